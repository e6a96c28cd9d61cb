//! Worker configuration.

use serde::{Deserialize, Serialize};
use slipstream_cache::{generation_name, manifest_with_routes, MatchOptions};
use url::Url;

/// Configuration for one worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Origin this worker serves.
    pub origin: Url,

    /// Cache namespace prefix.
    pub cache_prefix: String,

    /// Build version; tags the generation namespace.
    pub version: u32,

    /// Static files to snapshot at install.
    pub static_files: Vec<String>,

    /// Application routes to snapshot at install.
    pub routes: Vec<String>,

    /// Offline fallback document path.
    pub offline_path: String,

    /// Index document path answering route-like requests.
    pub index_path: String,

    /// Lookup matching behavior.
    pub match_options: MatchOptions,

    /// Whether the platform offers a background-retry facility; when it
    /// does, explicit drain messages are left to the platform signal.
    pub background_retry: bool,
}

impl WorkerConfig {
    /// Configuration with production defaults for the given origin.
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            cache_prefix: "web-app-cache".to_string(),
            version: 1,
            static_files: Vec::new(),
            routes: vec!["/".to_string()],
            offline_path: "/offline.html".to_string(),
            index_path: "/index.html".to_string(),
            match_options: MatchOptions::default(),
            background_retry: false,
        }
    }

    /// Namespace name of the generation matching this build.
    pub fn generation_name(&self) -> String {
        generation_name(&self.cache_prefix, self.version)
    }

    /// Full capture list: routes, static files, and the two documents the
    /// worker itself depends on.
    pub fn capture_manifest(&self) -> Vec<String> {
        let mut manifest = manifest_with_routes(&self.static_files, &self.routes);
        for required in [&self.offline_path, &self.index_path] {
            if !manifest.contains(required) {
                manifest.push(required.clone());
            }
        }
        manifest
    }

    /// Paths that identify the application root document.
    pub fn root_document_paths(&self) -> [&str; 2] {
        ["/", self.index_path.as_str()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WorkerConfig {
        WorkerConfig::new(Url::parse("https://example.com/").unwrap())
    }

    #[test]
    fn test_generation_name_tracks_version() {
        let mut config = config();
        assert_eq!(config.generation_name(), "web-app-cache-v1");

        config.version = 7;
        assert_eq!(config.generation_name(), "web-app-cache-v7");
    }

    #[test]
    fn test_capture_manifest_includes_worker_documents() {
        let mut config = config();
        config.static_files = vec!["/app.js".to_string()];

        let manifest = config.capture_manifest();
        assert!(manifest.contains(&"/".to_string()));
        assert!(manifest.contains(&"/app.js".to_string()));
        assert!(manifest.contains(&"/offline.html".to_string()));
        assert!(manifest.contains(&"/index.html".to_string()));
    }

    #[test]
    fn test_capture_manifest_does_not_duplicate() {
        let mut config = config();
        config.static_files = vec!["/offline.html".to_string(), "/index.html".to_string()];

        let manifest = config.capture_manifest();
        let offline_count = manifest.iter().filter(|p| *p == "/offline.html").count();
        assert_eq!(offline_count, 1);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = config();
        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: WorkerConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.cache_prefix, config.cache_prefix);
        assert_eq!(decoded.origin, config.origin);
    }
}
