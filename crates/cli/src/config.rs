use anyhow::{bail, Context, Result};
use conveyor_core::ExecutionPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for every `*_secs` setting: one week
const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub workflow: WorkflowConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Run policy; durations are whole seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub max_concurrent_runs: usize,
    pub admission_wait_secs: u64,
    pub run_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_backoff_secs: u64,
    pub skip_succeeded_on_retry: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        let policy = ExecutionPolicy::default();
        Self {
            max_concurrent_runs: policy.max_concurrent_runs,
            admission_wait_secs: policy.admission_wait.as_secs(),
            run_timeout_secs: policy.run_timeout.as_secs(),
            max_attempts: policy.max_attempts,
            retry_backoff_secs: policy.retry_backoff.as_secs(),
            skip_succeeded_on_retry: policy.skip_succeeded_on_retry,
        }
    }
}

impl WorkflowConfig {
    pub fn policy(&self) -> Result<ExecutionPolicy> {
        if self.max_concurrent_runs == 0 {
            bail!("workflow.max_concurrent_runs must be at least 1");
        }
        if self.max_attempts == 0 {
            bail!("workflow.max_attempts must be at least 1");
        }
        for (name, secs) in [
            ("admission_wait_secs", self.admission_wait_secs),
            ("run_timeout_secs", self.run_timeout_secs),
            ("retry_backoff_secs", self.retry_backoff_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                bail!("workflow.{name} must be at most {MAX_DURATION_SECS}");
            }
        }
        Ok(ExecutionPolicy {
            max_concurrent_runs: self.max_concurrent_runs,
            admission_wait: Duration::from_secs(self.admission_wait_secs),
            run_timeout: Duration::from_secs(self.run_timeout_secs),
            max_attempts: self.max_attempts,
            retry_backoff: Duration::from_secs(self.retry_backoff_secs),
            skip_succeeded_on_retry: self.skip_succeeded_on_retry,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_index_file")]
    pub index_file: String,
}

fn default_index_file() -> String {
    "index.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            index_file: default_index_file(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// Used when `RUST_LOG` is not set
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "conveyor=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
        }
    }
}

impl CliConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            Self::default()
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the index file path
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("data");

        let config = CliConfig::load(&temp_dir.path().join("absent.toml"), data_dir.clone()).unwrap();

        assert!(data_dir.is_dir());
        assert_eq!(config.index_path(), data_dir.join("index.redb"));
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.workflow.policy().unwrap(), ExecutionPolicy::default());
    }

    #[test]
    fn test_partial_file_overrides_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("conveyor.toml");
        std::fs::write(
            &path,
            r#"
[workflow]
max_concurrent_runs = 4
retry_backoff_secs = 1
skip_succeeded_on_retry = true

[storage]
index_file = "runs.redb"

[logging]
format = "json"
"#,
        )
        .unwrap();

        let config = CliConfig::load(&path, temp_dir.path().to_path_buf()).unwrap();
        let policy = config.workflow.policy().unwrap();

        assert_eq!(policy.max_concurrent_runs, 4);
        assert_eq!(policy.retry_backoff, Duration::from_secs(1));
        assert!(policy.skip_succeeded_on_retry);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.admission_wait, Duration::from_secs(30));
        assert_eq!(config.index_path(), temp_dir.path().join("runs.redb"));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let workflow = WorkflowConfig {
            max_concurrent_runs: 0,
            ..Default::default()
        };
        assert!(workflow.policy().is_err());
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("conveyor.toml");
        std::fs::write(&path, "[workflow]\nretry_backoff_secs = 9223372036854775807\n").unwrap();

        let config = CliConfig::load(&path, temp_dir.path().to_path_buf()).unwrap();
        let err = config.workflow.policy().unwrap_err();
        assert!(err.to_string().contains("retry_backoff_secs"));

        let workflow = WorkflowConfig {
            run_timeout_secs: MAX_DURATION_SECS,
            ..Default::default()
        };
        assert!(workflow.policy().is_ok());
    }
}
