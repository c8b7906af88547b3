//! Node configuration.
//!
//! Loaded once at startup from a YAML (or JSON, which YAML accepts) file.
//! Every field has a default so an empty document is a valid config.
//!
//! ```yaml
//! node_id: 3f1c9f0e-...
//! base_dir: /var/lib/magiknative
//! os: linux
//! log_level: info
//! termination_grace_ms: 3000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    APPS_DIR, DEFAULT_BASE_DIR, DOWNLOAD_TIMEOUT, FAILURE_BACKOFF, INTERRUPT_SETTLE, LOGS_DIR,
    NOT_FOUND_BACKOFF, PID_FILE_GRACE, TERMINATION_GRACE,
};
use crate::error::{Error, Result};
use crate::platform::{Os, Platform};
use crate::script::ScriptFamily;

/// Configuration of one node agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identifier of this node; used to recognise migrate-to-self.
    pub node_id: String,
    /// Root of the `apps/` and `logs/` trees.
    pub base_dir: PathBuf,
    /// OS name from node metadata. Detected when absent.
    pub os: Option<String>,
    /// Default tracing level.
    pub log_level: String,
    pub pid_file_grace_ms: u64,
    pub interrupt_settle_ms: u64,
    pub termination_grace_ms: u64,
    pub not_found_backoff_ms: u64,
    pub failure_backoff_ms: u64,
    pub download_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            base_dir: default_base_dir(),
            os: None,
            log_level: "info".to_string(),
            pid_file_grace_ms: PID_FILE_GRACE.as_millis() as u64,
            interrupt_settle_ms: INTERRUPT_SETTLE.as_millis() as u64,
            termination_grace_ms: TERMINATION_GRACE.as_millis() as u64,
            not_found_backoff_ms: NOT_FOUND_BACKOFF.as_millis() as u64,
            failure_backoff_ms: FAILURE_BACKOFF.as_millis() as u64,
            download_timeout_secs: DOWNLOAD_TIMEOUT.as_secs(),
        }
    }
}

/// Platform-appropriate base directory.
///
/// - Linux: `/var/lib/magiknative`
/// - elsewhere: `<local data dir>/magiknative`
fn default_base_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from(DEFAULT_BASE_DIR)
    }

    #[cfg(not(target_os = "linux"))]
    {
        dirs::data_local_dir()
            .map(|d| d.join("magiknative"))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR))
    }
}

impl NodeConfig {
    /// Reads and validates a config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    /// Parses and validates a config document.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: NodeConfig = if content.trim().is_empty() {
            NodeConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| Error::Config(e.to_string()))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects configs the orchestrator cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(Error::Config("node_id must not be empty".to_string()));
        }
        if !self.base_dir.is_absolute() {
            return Err(Error::Config(format!(
                "base_dir must be absolute: {}",
                self.base_dir.display()
            )));
        }
        Ok(())
    }

    /// Creates `base_dir`, `apps/` and `logs/` if missing.
    pub fn ensure_layout(&self) -> Result<()> {
        std::fs::create_dir_all(self.apps_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.base_dir.join(APPS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join(LOGS_DIR)
    }

    /// Node OS, from metadata when present, detected otherwise.
    pub fn os(&self) -> Os {
        match &self.os {
            Some(name) => Os::from_name(name),
            None => Platform::detect().os,
        }
    }

    /// Script family; fixed for the lifetime of the process.
    pub fn script_family(&self) -> ScriptFamily {
        self.os().script_family()
    }

    pub fn pid_file_grace(&self) -> Duration {
        Duration::from_millis(self.pid_file_grace_ms)
    }

    pub fn interrupt_settle(&self) -> Duration {
        Duration::from_millis(self.interrupt_settle_ms)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn not_found_backoff(&self) -> Duration {
        Duration::from_millis(self.not_found_backoff_ms)
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}
