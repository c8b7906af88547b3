//! Desired-state notification dispatch.
//!
//! A [`Notification`] names an instance and the lifecycle [`Action`] the
//! controller wants applied to it. The [`Dispatcher`] maps each action onto an
//! [`Orchestrator`] call and reacts to failures:
//!
//! | Failure | Code | Reaction |
//! |---------|------|----------|
//! | `NotFound` | 9 | back off, then remove the remote record |
//! | `AlreadyExists` | 0 | none |
//! | `UnsupportedOperation` | 7 | none |
//! | anything else | 10 | back off, then republish the last status |

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;
use crate::store::StateStore;
use crate::unit::UnitDefinition;

// =============================================================================
// Wire types
// =============================================================================

/// Desired lifecycle action carried by a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    Define,
    Undefine,
    Configure,
    Stop,
    Resume,
    Clean,
    /// Migration: this node is the destination.
    Land,
    /// Migration: this node is the source.
    TakeOff,
    /// Anything the plugin does not know about.
    Unknown(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Define => "DEFINE",
            Self::Undefine => "UNDEFINE",
            Self::Configure => "CONFIGURE",
            Self::Stop => "STOP",
            Self::Resume => "RESUME",
            Self::Clean => "CLEAN",
            Self::Land => "LAND",
            Self::TakeOff => "TAKE_OFF",
            Self::Unknown(s) => s,
        }
    }
}

impl From<String> for Action {
    fn from(s: String) -> Self {
        match s.as_str() {
            "DEFINE" => Self::Define,
            "UNDEFINE" => Self::Undefine,
            "CONFIGURE" => Self::Configure,
            "STOP" => Self::Stop,
            "RESUME" => Self::Resume,
            "CLEAN" => Self::Clean,
            "LAND" => Self::Land,
            "TAKE_OFF" => Self::TakeOff,
            _ => Self::Unknown(s),
        }
    }
}

impl From<Action> for String {
    fn from(a: Action) -> Self {
        a.as_str().to_string()
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationProperties {
    #[serde(default)]
    pub destination: Option<String>,
}

/// Desired-state change for one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Instance id.
    pub uuid: String,
    pub status: Action,
    pub fdu_id: Option<String>,
    pub migration_properties: Option<MigrationProperties>,
    /// Full record, decoded lazily into a [`UnitDefinition`] on DEFINE.
    pub raw: Value,
}

#[derive(Deserialize)]
struct Header {
    uuid: String,
    status: Action,
    #[serde(default, alias = "fdu_uuid")]
    fdu_id: Option<String>,
    #[serde(default)]
    migration_properties: Option<MigrationProperties>,
}

impl Notification {
    pub fn from_value(raw: Value) -> Result<Self> {
        let header: Header = serde_json::from_value(raw.clone())?;
        Ok(Self {
            uuid: header.uuid,
            status: header.status,
            fdu_id: header.fdu_id,
            migration_properties: header.migration_properties,
            raw,
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(json)?)
    }

    /// Unit definition embedded in the record.
    pub fn definition(&self) -> Result<UnitDefinition> {
        serde_json::from_value(self.raw.clone())
            .map_err(|e| Error::InvalidInput(format!("instance '{}': bad definition: {}", self.uuid, e)))
    }

    pub fn destination(&self) -> Option<&str> {
        self.migration_properties
            .as_ref()
            .and_then(|m| m.destination.as_deref())
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// What happened to a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Ignored,
    Failed { code: i32 },
}

/// Applies notifications to an orchestrator.
pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    not_found_backoff: Duration,
    failure_backoff: Duration,
}

impl Dispatcher {
    pub fn new(orchestrator: Arc<Orchestrator>, config: &NodeConfig) -> Self {
        Self {
            orchestrator,
            not_found_backoff: config.not_found_backoff(),
            failure_backoff: config.failure_backoff(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    fn store(&self) -> &Arc<dyn StateStore> {
        self.orchestrator.store()
    }

    async fn apply(&self, n: &Notification) -> Result<bool> {
        let id = n.uuid.as_str();
        match &n.status {
            Action::Define => self.orchestrator.define(id, n.definition()?).await?,
            Action::Undefine => self.orchestrator.undefine(id).await?,
            Action::Configure => self.orchestrator.configure(id).await?,
            Action::Stop => self.orchestrator.stop(id).await?,
            Action::Resume => self.orchestrator.resume(id).await?,
            Action::Clean => self.orchestrator.clean(id).await?,
            Action::Land | Action::TakeOff => {
                self.orchestrator
                    .migrate(id, n.fdu_id.as_deref(), n.destination())
                    .await?
            }
            Action::Unknown(status) => {
                warn!(instance = %id, status = %status, "ignoring notification with unknown status");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Applies one notification and reacts to its failure.
    pub async fn handle(&self, n: &Notification) -> Outcome {
        debug!(instance = %n.uuid, action = %n.status, "notification");
        let err = match self.apply(n).await {
            Ok(true) => return Outcome::Applied,
            Ok(false) => return Outcome::Ignored,
            Err(e) => e,
        };

        let id = n.uuid.as_str();
        let definition = n
            .fdu_id
            .clone()
            .or_else(|| self.orchestrator.definition_of(id))
            .unwrap_or_default();
        let code = err.code();
        error!(instance = %id, action = %n.status, code, error = %err, "notification failed");

        if let Err(e) = self
            .store()
            .report_error(&definition, id, code, &err.to_string())
            .await
        {
            warn!(instance = %id, error = %e, "failed to report error");
        }

        match err {
            Error::NotFound(_) => {
                tokio::time::sleep(self.not_found_backoff).await;
                if let Err(e) = self.store().remove_instance(&definition, id).await {
                    warn!(instance = %id, error = %e, "failed to remove remote record");
                }
            }
            Error::AlreadyExists(_) | Error::UnsupportedOperation { .. } => {}
            _ => {
                tokio::time::sleep(self.failure_backoff).await;
                if let Ok(state) = self.orchestrator.status(id).await
                    && let Err(e) = self.store().update_status(&definition, id, state).await
                {
                    warn!(instance = %id, error = %e, "failed to republish status");
                }
            }
        }

        Outcome::Failed { code }
    }

    /// Handles notifications in arrival order until the channel closes.
    pub async fn run(&self, rx: mpsc::Receiver<Notification>) {
        self.run_until(rx, std::future::pending()).await
    }

    /// Like [`run`](Self::run), but takes no further notification once `stop`
    /// completes. A transition already in progress runs to completion, so no
    /// instance is left half configured.
    pub async fn run_until(&self, mut rx: mpsc::Receiver<Notification>, stop: impl Future<Output = ()>) {
        tokio::pin!(stop);
        info!("notification worker started");
        loop {
            let n = tokio::select! {
                biased;
                _ = &mut stop => {
                    info!("notification worker asked to stop");
                    break;
                }
                n = rx.recv() => match n {
                    Some(n) => n,
                    None => break,
                },
            };
            self.handle(&n).await;
        }
        info!("notification worker stopped");
    }
}
