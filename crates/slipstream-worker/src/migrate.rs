//! Migration of current-generation content into older generations.
//!
//! A client pinned to an old generation keeps being served from it until
//! the new worker activates. Copying the new content in early means the
//! very next navigation already sees new top-level markup.

use slipstream_cache::GenerationStore;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

/// Outcome of one migration run.
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    /// Outdated generations that received content.
    pub migrated: Vec<String>,
    /// Root-document overwrites performed.
    pub root_copied: usize,
    /// Missing entries added to outdated generations.
    pub entries_added: usize,
    /// Per-generation failures, with the reason.
    pub failed: Vec<(String, String)>,
}

impl MigrationReport {
    /// Whether the run had anything to do.
    pub fn is_noop(&self) -> bool {
        self.migrated.is_empty() && self.failed.is_empty()
    }
}

/// Path component of a stored key.
fn key_path(key: &str) -> String {
    match Url::parse(key) {
        Ok(url) => url.path().to_string(),
        Err(_) => key.split(['?', '#']).next().unwrap_or(key).to_string(),
    }
}

/// The key addressing the application root document, if captured.
///
/// `root_paths` is in priority order, so the choice is deterministic even
/// when several root-ish documents were captured.
fn find_root_key<'a>(keys: &[&'a str], root_paths: &[&str]) -> Option<&'a str> {
    root_paths
        .iter()
        .find_map(|path| keys.iter().find(|key| key_path(key) == *path).copied())
}

/// Copy the current generation's content into every outdated generation.
///
/// The root document is overwritten so the next navigation sees new
/// markup; every other key is only added when missing, never clobbered
/// under a concurrent reader. Running this twice with no new generation
/// changes nothing. Per-generation failures are logged and recorded
/// without aborting the rest.
pub async fn migrate_generations(
    store: &RwLock<GenerationStore>,
    current: &str,
    root_paths: &[&str],
) -> MigrationReport {
    let mut report = MigrationReport::default();

    // Snapshot the current generation before touching anything, so the
    // copy phase never holds the lock across an entry-by-entry walk of a
    // generation that is being read concurrently.
    let (source, outdated) = {
        let store = store.read().await;
        let names = store.generation_names(current);
        if names.current.is_none() || names.outdated.is_empty() {
            debug!(current = %current, "nothing to migrate");
            return report;
        }
        let source = match store.get(current) {
            Some(generation) => generation.clone(),
            None => return report,
        };
        (source, names.outdated)
    };

    let root_key = find_root_key(&source.keys(), root_paths).map(str::to_string);

    let mut store = store.write().await;
    for name in outdated {
        let Some(generation) = store.get_mut(&name) else {
            warn!(generation = %name, "outdated generation disappeared during migration");
            report
                .failed
                .push((name.clone(), "generation disappeared".to_string()));
            continue;
        };

        if let Some(root_key) = &root_key {
            if let Some(entry) = source.lookup(root_key, &Default::default()) {
                generation.put(root_key, entry.clone());
                report.root_copied += 1;
            }
        }

        for key in source.keys() {
            if Some(key) == root_key.as_deref() {
                continue;
            }
            if let Some(entry) = source.lookup(key, &Default::default()) {
                if generation.add(key, entry.clone()) {
                    report.entries_added += 1;
                }
            }
        }

        debug!(generation = %name, "generation migrated");
        report.migrated.push(name);
    }

    info!(
        current = %current,
        migrated = report.migrated.len(),
        root_copied = report.root_copied,
        entries_added = report.entries_added,
        "migration finished"
    );
    report
}
