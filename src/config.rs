//! Runtime configuration.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::error::CompletionError;

/// The default path to use for segment data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/varve/data";

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,

    /// The filesystem root under which all segment data is stored.
    #[serde(default = "Config::default_storage_data_path")]
    pub storage_data_path: String,

    /// The number of replicas expected to consume each stream partition.
    pub expected_replicas: u32,
    /// The stream offset a replica must reach before it is eligible to commit a segment.
    pub completion_threshold: u64,

    /// The seconds to wait for further replica reports once one replica has reached the
    /// completion threshold, before forcing a committer decision.
    #[serde(default = "Config::default_decision_timeout_sec")]
    pub decision_timeout_sec: u64,
    /// The seconds a decided committer is granted to build & commit its segment.
    #[serde(default = "Config::default_commit_timeout_sec")]
    pub commit_timeout_sec: u64,
    /// The ceiling on total build time a single commit attempt may accumulate via extensions,
    /// measured from the instant the commit window was first armed.
    #[serde(default = "Config::default_max_commit_time_sec")]
    pub max_commit_time_sec: u64,
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants between config values.
    pub fn validate(&self) -> Result<()> {
        if self.expected_replicas == 0 {
            bail!(CompletionError::ConfigInvalid("expected_replicas must be at least 1".into()));
        }
        if self.commit_timeout_sec == 0 {
            bail!(CompletionError::ConfigInvalid("commit_timeout_sec must be at least 1".into()));
        }
        if self.max_commit_time_sec < self.commit_timeout_sec {
            bail!(CompletionError::ConfigInvalid(format!(
                "max_commit_time_sec ({}) must be >= commit_timeout_sec ({})",
                self.max_commit_time_sec, self.commit_timeout_sec
            )));
        }
        Ok(())
    }

    fn default_storage_data_path() -> String {
        DEFAULT_DATA_PATH.to_string()
    }

    fn default_decision_timeout_sec() -> u64 {
        30
    }

    fn default_commit_timeout_sec() -> u64 {
        120
    }

    fn default_max_commit_time_sec() -> u64 {
        1800
    }
}

#[cfg(test)]
impl Config {
    /// Create a new config instance for tests, backed by a temp storage dir.
    pub fn new_test() -> Result<(std::sync::Arc<Config>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir().context("error creating temp dir for test config")?;
        let config = Config {
            rust_log: "".into(),
            storage_data_path: tmpdir.path().display().to_string(),
            expected_replicas: 3,
            completion_threshold: 100,
            decision_timeout_sec: 30,
            commit_timeout_sec: 120,
            max_commit_time_sec: 1800,
        };
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
