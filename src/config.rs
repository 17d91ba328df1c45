//! Hub configuration.
//!
//! Everything the hub needs is carried in one explicit struct that is handed
//! to [`Hub::open`](crate::hub::Hub::open); nothing is read from globals
//! after startup. Settings have defaults so a local store works with zero
//! configuration.

use std::path::PathBuf;

use crate::storage::{BranchName, Signature};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Root directory of the object store and branch tables.
    /// Env: `DBHUB_STORAGE_DIR`
    /// Default: `./dbhub-data`
    pub storage_dir: PathBuf,

    /// Branch used when an upload names none.
    /// Env: `DBHUB_DEFAULT_BRANCH`
    /// Default: `master`
    pub default_branch: BranchName,

    /// Largest accepted upload, in bytes.
    /// Env: `DBHUB_MAX_UPLOAD_BYTES`
    /// Default: 512 MiB
    pub max_upload_bytes: usize,

    /// Identity recorded as author when an upload carries none.
    /// Env: `DBHUB_AUTHOR_NAME`, `DBHUB_AUTHOR_EMAIL`
    /// Default: `dbhub <dbhub@localhost>`
    pub default_identity: Signature,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./dbhub-data"),
            default_branch: BranchName::master(),
            max_upload_bytes: 512 * 1024 * 1024,
            default_identity: Signature::new("dbhub", "dbhub@localhost"),
        }
    }
}

impl HubConfig {
    /// Create a configuration rooted at the given directory.
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key lookup; invalid values are logged
    /// and the default is kept.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("DBHUB_STORAGE_DIR") {
            if !dir.is_empty() {
                config.storage_dir = PathBuf::from(dir);
            }
        }

        if let Some(branch) = lookup("DBHUB_DEFAULT_BRANCH") {
            match BranchName::new(branch.as_str()) {
                Ok(name) => config.default_branch = name,
                Err(e) => tracing::warn!(
                    value = %branch,
                    error = %e,
                    "Invalid DBHUB_DEFAULT_BRANCH, using default"
                ),
            }
        }

        if let Some(max) = lookup("DBHUB_MAX_UPLOAD_BYTES") {
            match max.parse::<usize>() {
                Ok(n) if n > 0 => config.max_upload_bytes = n,
                _ => tracing::warn!(value = %max, "Invalid DBHUB_MAX_UPLOAD_BYTES, using default"),
            }
        }

        // empty values count as unset
        if let Some(name) = lookup("DBHUB_AUTHOR_NAME").filter(|v| !v.trim().is_empty()) {
            config.default_identity.name = name;
        }
        if let Some(email) = lookup("DBHUB_AUTHOR_EMAIL").filter(|v| !v.trim().is_empty()) {
            config.default_identity.email = email;
        }
        if let Err(e) = config.default_identity.validate() {
            tracing::warn!(error = %e, "Invalid default identity, using default");
            config.default_identity = Self::default().default_identity;
        }

        config
    }

    /// Set the default branch.
    pub fn default_branch(mut self, branch: BranchName) -> Self {
        self.default_branch = branch;
        self
    }

    /// Set the upload size limit.
    pub fn max_upload_bytes(mut self, value: usize) -> Self {
        self.max_upload_bytes = value;
        self
    }

    /// Set the fallback author identity.
    pub fn default_identity(mut self, identity: Signature) -> Self {
        self.default_identity = identity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = HubConfig::default();
        assert_eq!(config.default_branch.as_str(), "master");
        assert_eq!(config.max_upload_bytes, 512 * 1024 * 1024);
        assert_eq!(config.storage_dir, PathBuf::from("./dbhub-data"));
    }

    #[test]
    fn test_from_lookup() {
        let config = HubConfig::from_lookup(lookup_from(&[
            ("DBHUB_STORAGE_DIR", "/srv/dbhub"),
            ("DBHUB_DEFAULT_BRANCH", "main"),
            ("DBHUB_MAX_UPLOAD_BYTES", "1024"),
            ("DBHUB_AUTHOR_NAME", "Ops"),
            ("DBHUB_AUTHOR_EMAIL", "ops@example.org"),
        ]));

        assert_eq!(config.storage_dir, PathBuf::from("/srv/dbhub"));
        assert_eq!(config.default_branch.as_str(), "main");
        assert_eq!(config.max_upload_bytes, 1024);
        assert_eq!(config.default_identity, Signature::new("Ops", "ops@example.org"));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = HubConfig::from_lookup(lookup_from(&[
            ("DBHUB_DEFAULT_BRANCH", "a..b"),
            ("DBHUB_MAX_UPLOAD_BYTES", "lots"),
            ("DBHUB_AUTHOR_NAME", "Eve <evil>"),
        ]));

        assert_eq!(config.default_branch.as_str(), "master");
        assert_eq!(config.max_upload_bytes, 512 * 1024 * 1024);
        assert_eq!(config.default_identity, HubConfig::default().default_identity);
    }

    #[test]
    fn test_empty_identity_values_are_unset() {
        let config = HubConfig::from_lookup(lookup_from(&[
            ("DBHUB_AUTHOR_NAME", ""),
            ("DBHUB_AUTHOR_EMAIL", "ops@example.org"),
        ]));

        assert_eq!(config.default_identity, Signature::new("dbhub", "ops@example.org"));
    }

    #[test]
    fn test_builder() {
        let config = HubConfig::new("/tmp/x")
            .max_upload_bytes(10)
            .default_branch(BranchName::new("trunk").unwrap());
        assert_eq!(config.max_upload_bytes, 10);
        assert_eq!(config.default_branch.as_str(), "trunk");
    }
}
