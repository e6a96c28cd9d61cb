//! # Slipstream Cache
//!
//! Versioned response snapshots for the Slipstream offline delivery layer.
//!
//! ## Features
//!
//! - **Generations**: named, versioned snapshots of captured responses
//! - **Lookup matching**: configurable query-string and variance handling
//! - **Capture**: best-effort snapshot of a resource manifest
//! - **Redirect cleaning**: redirect-flagged responses are rebuilt before
//!   being handed back to a caller
//!
//! ## Architecture
//!
//! ```text
//! GenerationStore
//!     └── Generation ({prefix}-v{N})
//!             └── resource key → CachedResponse
//! ```

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use slipstream_common::unix_time_ms;
use slipstream_fetch::{FetchedResponse, NetworkClient, Request};
use tracing::{debug, info, warn};
use url::Url;

// ==================== Match options ====================

/// Lookup matching behavior.
///
/// Both flags default to on, trading strict correctness for a higher
/// offline hit rate. Embedders that cache resources differing only by
/// query string or negotiated representation should turn them off.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MatchOptions {
    /// Treat `/a?x=1` and `/a` as the same resource key.
    pub ignore_search: bool,
    /// Ignore content-negotiation variance recorded on the captured
    /// response. When off, entries that declared a `Vary` header are not
    /// matched, since the varying request headers were not captured.
    pub ignore_vary: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            ignore_search: true,
            ignore_vary: true,
        }
    }
}

/// Strip the fragment, and the query when requested, from a resource key.
fn normalize_key(key: &str, ignore_search: bool) -> &str {
    let key = key.split('#').next().unwrap_or(key);
    if ignore_search {
        key.split('?').next().unwrap_or(key)
    } else {
        key
    }
}

// ==================== Cached response ====================

/// A captured response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    /// URL the resource was requested under.
    pub url: String,
    /// Response status.
    pub status: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body.
    pub body: Vec<u8>,
    /// Whether the capture went through a redirect.
    pub redirected: bool,
    /// Capture timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CachedResponse {
    /// Capture a fetched response under the key it was requested with.
    pub fn capture(requested_url: &str, response: &FetchedResponse) -> Self {
        Self {
            url: requested_url.to_string(),
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.to_vec(),
            redirected: response.redirected,
            cached_at: unix_time_ms(),
        }
    }

    /// Whether the captured response declared representation variance.
    pub fn varies(&self) -> bool {
        self.headers
            .iter()
            .any(|(name, value)| name.eq_ignore_ascii_case("vary") && !value.trim().is_empty())
    }

    /// Convert back into a response servable to a caller.
    pub fn to_response(&self) -> FetchedResponse {
        FetchedResponse {
            url: self.url.clone(),
            status: self.status,
            headers: self.headers.clone(),
            body: Bytes::from(self.body.clone()),
            redirected: self.redirected,
        }
    }
}

/// Rebuild a redirect-flagged response as a fresh, non-redirected one.
///
/// The platform boundary rejects redirect-flagged responses handed back
/// from a cache, so this step is mandatory before serving such an entry.
pub fn clean_redirect(entry: &CachedResponse) -> CachedResponse {
    CachedResponse {
        redirected: false,
        ..entry.clone()
    }
}

// ==================== Generation ====================

/// A single versioned snapshot of captured responses.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Generation {
    /// Namespace name, e.g. `app-cache-v3`.
    pub name: String,
    entries: HashMap<String, CachedResponse>,
}

impl Generation {
    /// Create an empty generation.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Look up a captured response for a resource key.
    ///
    /// Fragments never participate in identity; query strings only when
    /// `ignore_search` is off.
    pub fn lookup(&self, key: &str, options: &MatchOptions) -> Option<&CachedResponse> {
        let entry = match self.entries.get(key) {
            Some(entry) => Some(entry),
            None => {
                let wanted = normalize_key(key, options.ignore_search);
                self.entries
                    .iter()
                    .find(|(stored, _)| normalize_key(stored, options.ignore_search) == wanted)
                    .map(|(_, entry)| entry)
            }
        }?;

        if !options.ignore_vary && entry.varies() {
            return None;
        }
        Some(entry)
    }

    /// Insert or overwrite an entry.
    pub fn put(&mut self, key: &str, entry: CachedResponse) {
        self.entries.insert(key.to_string(), entry);
    }

    /// Insert an entry only if the key is absent.
    ///
    /// Returns false when the key already existed; duplicate adds are
    /// idempotent, never an error.
    pub fn add(&mut self, key: &str, entry: CachedResponse) -> bool {
        if self.entries.contains_key(key) {
            return false;
        }
        self.entries.insert(key.to_string(), entry);
        true
    }

    /// Remove an entry.
    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Whether the key is present (exact match).
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// All resource keys.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Capture ====================

/// Outcome of capturing a generation from a resource manifest.
#[derive(Debug, Clone, Default)]
pub struct InstallReport {
    /// Generation the capture targeted.
    pub generation: String,
    /// Resource keys captured successfully.
    pub captured: Vec<String>,
    /// Resources that failed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl InstallReport {
    /// Some resources failed but at least one was captured.
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty() && !self.captured.is_empty()
    }

    /// Nothing was captured at all.
    pub fn is_total_failure(&self) -> bool {
        self.captured.is_empty() && !self.failed.is_empty()
    }
}

/// Version-tagged namespace name for a generation.
pub fn generation_name(prefix: &str, version: u32) -> String {
    format!("{}-v{}", prefix, version)
}

/// Capture a new generation from a resource manifest.
///
/// Entries are stored under their absolute URL so lookups match request
/// identity directly; the report speaks in manifest terms. Each resource
/// is fetched with `Cache-Control: no-cache` so content always comes from
/// the origin rather than an intermediary cache. A failing resource is
/// logged and recorded in the report; it does not abort the rest of the
/// capture.
pub async fn capture_generation(
    origin: &Url,
    name: &str,
    resources: &[String],
    network: &dyn NetworkClient,
) -> (Generation, InstallReport) {
    let mut generation = Generation::new(name);
    let mut report = InstallReport {
        generation: name.to_string(),
        ..Default::default()
    };

    let fetches = resources.iter().map(|resource| async move {
        let absolute = match origin.join(resource) {
            Ok(url) => url,
            Err(e) => return (resource.clone(), Err(e.to_string())),
        };
        let request = Request::get(absolute.clone()).header(
            HeaderName::from_static("cache-control"),
            HeaderValue::from_static("no-cache"),
        );
        match network.fetch(request).await {
            Ok(response) if response.ok() => (resource.clone(), Ok((absolute, response))),
            Ok(response) => (resource.clone(), Err(format!("status {}", response.status))),
            Err(e) => (resource.clone(), Err(e.to_string())),
        }
    });

    for (resource, outcome) in futures::future::join_all(fetches).await {
        match outcome {
            Ok((absolute, response)) => {
                generation.put(
                    absolute.as_str(),
                    CachedResponse::capture(absolute.as_str(), &response),
                );
                report.captured.push(resource);
            }
            Err(reason) => {
                warn!(generation = %name, resource = %resource, reason = %reason, "capture failed");
                report.failed.push((resource, reason));
            }
        }
    }

    info!(
        generation = %name,
        captured = report.captured.len(),
        failed = report.failed.len(),
        "generation captured"
    );
    (generation, report)
}

// ==================== Generation store ====================

/// Known generation names split by currency.
#[derive(Debug, Clone, Default)]
pub struct GenerationNames {
    pub current: Option<String>,
    pub outdated: Vec<String>,
}

/// The set of generations known to this worker process.
#[derive(Debug, Default)]
pub struct GenerationStore {
    caches: HashMap<String, Generation>,
}

impl GenerationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a captured generation, replacing any previous one of the
    /// same name.
    pub fn insert(&mut self, generation: Generation) {
        self.caches.insert(generation.name.clone(), generation);
    }

    /// Open a generation, creating it if absent.
    pub fn open(&mut self, name: &str) -> &mut Generation {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Generation::new(name))
    }

    pub fn get(&self, name: &str) -> Option<&Generation> {
        self.caches.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Generation> {
        self.caches.get_mut(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a generation.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// All generation names.
    pub fn names(&self) -> Vec<&str> {
        self.caches.keys().map(|s| s.as_str()).collect()
    }

    /// Split known names into the current one and outdated ones.
    pub fn generation_names(&self, current: &str) -> GenerationNames {
        let mut names = GenerationNames::default();
        for name in self.caches.keys() {
            if name == current {
                names.current = Some(name.clone());
            } else {
                names.outdated.push(name.clone());
            }
        }
        names.outdated.sort();
        names
    }

    /// Remove every generation except the named one.
    ///
    /// Returns the names that were removed; used at activation.
    pub fn delete_generations_except(&mut self, keep: &str) -> Vec<String> {
        let stale: Vec<String> = self
            .caches
            .keys()
            .filter(|name| name.as_str() != keep)
            .cloned()
            .collect();
        for name in &stale {
            self.caches.remove(name);
            debug!(generation = %name, "stale generation deleted");
        }
        stale
    }

    /// Look up a key in a named generation.
    pub fn lookup(
        &self,
        generation: &str,
        key: &str,
        options: &MatchOptions,
    ) -> Option<&CachedResponse> {
        self.caches.get(generation)?.lookup(key, options)
    }
}

/// Build a capture request list from static files plus routes.
pub fn manifest_with_routes(static_files: &[String], routes: &[String]) -> Vec<String> {
    let mut combined: Vec<String> = routes.to_vec();
    for file in static_files {
        if !combined.contains(file) {
            combined.push(file.clone());
        }
    }
    combined
}
