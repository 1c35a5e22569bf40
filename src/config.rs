use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{LedgerError, Result};
use crate::ingest::ViewLoggingConfig;
use crate::retention::SweeperConfig;
use crate::sinks::{ArchiveSink, ExportSink, FileSink, HttpSink};
use crate::subject::SubjectRequestConfig;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "LEDGER_CONFIG";
const DEFAULT_CONFIG_NAME: &str = "compliance-ledger";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Directory for the file archival sink
    pub dir: Option<PathBuf>,
    /// Base URL of an archival service; takes precedence over `dir`
    pub url: Option<String>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            dir: Some(PathBuf::from("./data/archive")),
            url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportsConfig {
    pub dir: PathBuf,
}

impl Default for ExportsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/exports"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub listen_addr: String,
    pub data_dir: PathBuf,
    pub policies_path: PathBuf,
    pub sweeper: SweeperConfig,
    pub subject_requests: SubjectRequestConfig,
    pub archive: ArchiveConfig,
    pub exports: ExportsConfig,
    pub view_logging: ViewLoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            data_dir: PathBuf::from("./data"),
            policies_path: PathBuf::from("./retention-policies.yml"),
            sweeper: SweeperConfig::default(),
            subject_requests: SubjectRequestConfig::default(),
            archive: ArchiveConfig::default(),
            exports: ExportsConfig::default(),
            view_logging: ViewLoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Defaults, then the optional config file, then `LEDGER__*` variables
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        Self::load_from(path.as_deref(), true)
    }

    pub fn load_from(path: Option<&Path>, with_env: bool) -> Result<Self> {
        let mut builder = Config::builder();

        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_NAME).required(false)),
        };
        if with_env {
            builder = builder.add_source(Environment::with_prefix("LEDGER").separator("__"));
        }

        let config: AppConfig = builder
            .build()
            .and_then(|settings| settings.try_deserialize::<AppConfig>())
            .map_err(|e| LedgerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.sweeper.interval_secs == 0 {
            return Err(LedgerError::Config(
                "sweeper.interval_secs must be positive".to_string(),
            ));
        }
        if self.subject_requests.workers == 0 {
            return Err(LedgerError::Config(
                "subject_requests.workers must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn archive_sink(&self) -> Option<Arc<dyn ArchiveSink>> {
        if let Some(url) = &self.archive.url {
            return Some(Arc::new(HttpSink::new(url.clone())));
        }
        self.archive
            .dir
            .as_ref()
            .map(|dir| Arc::new(FileSink::new(dir)) as Arc<dyn ArchiveSink>)
    }

    pub fn export_sink(&self) -> Arc<dyn ExportSink> {
        Arc::new(FileSink::new(&self.exports.dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ViewLoggingMode;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_without_file() {
        let config = AppConfig::load_from(None, false).unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(config.archive_sink().is_some());
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.yaml");
        std::fs::write(
            &path,
            r#"
listen_addr: "127.0.0.1:8088"
data_dir: /var/lib/ledger
sweeper:
  interval_secs: 60
  personal_fields: [email]
subject_requests:
  subject_entity_types: [crm.customer, accounts.user]
view_logging:
  mode: all
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(Some(&path), false).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8088");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/ledger"));
        assert_eq!(config.sweeper.interval_secs, 60);
        assert_eq!(config.sweeper.sink_attempts, SweeperConfig::default().sink_attempts);
        assert_eq!(config.subject_requests.subject_entity_types.len(), 2);
        assert_eq!(config.view_logging.mode, ViewLoggingMode::All);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.yaml");
        std::fs::write(&path, "sweeper:\n  interval_secs: 0\n").unwrap();
        assert!(matches!(
            AppConfig::load_from(Some(&path), false),
            Err(LedgerError::Config(_))
        ));
    }
}
