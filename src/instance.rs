//! Instance records and lifecycle states.
//!
//! ```text
//!  (absent) ──define──► DEFINED ──configure──► CONFIGURED ──start/run──► RUNNING
//!     ▲                   │  ◄────────clean────────  ▲                      │
//!     └────undefine───────┘                          └────────stop──────────┘
//! ```
//!
//! `PAUSED` exists for wire compatibility only; no transition enters it.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::network::{ConnectionPoint, InterfacePair};
use crate::unit::UnitDefinition;

/// Shared handle to the unit's OS process.
pub type ProcessHandle = Arc<tokio::sync::Mutex<tokio::process::Child>>;

// =============================================================================
// Lifecycle State
// =============================================================================

/// Lifecycle state of an instance.
///
/// Serialized with the status strings the state store uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    #[serde(rename = "DEFINE")]
    Defined,
    #[serde(rename = "CONFIGURE")]
    Configured,
    #[serde(rename = "RUN")]
    Running,
    #[serde(rename = "PAUSE")]
    Paused,
}

impl InstanceState {
    /// Status string published to the state store.
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Defined => "DEFINE",
            Self::Configured => "CONFIGURE",
            Self::Running => "RUN",
            Self::Paused => "PAUSE",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Defined => write!(f, "DEFINED"),
            Self::Configured => write!(f, "CONFIGURED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Paused => write!(f, "PAUSED"),
        }
    }
}

// =============================================================================
// Instance Record
// =============================================================================

/// Mutable state of one deployed copy of a unit.
#[derive(Debug)]
pub struct InstanceRecord {
    /// Globally unique instance identifier.
    pub id: String,
    pub definition: UnitDefinition,
    pub status: InstanceState,
    /// Staging directory of the packaged artifact, if the unit has one.
    pub source_dir: Option<PathBuf>,
    /// Combined stdout/stderr log; assigned at configure.
    pub outfile: Option<PathBuf>,
    pub namespace: Option<String>,
    pub connection_points: Vec<ConnectionPoint>,
    pub virtual_interfaces: Vec<InterfacePair>,
    pub pid: Option<u32>,
    pub process: Option<ProcessHandle>,
    pub defined_at: DateTime<Utc>,
    /// Set when the record leaves the table; waiters must treat it as gone.
    pub retired: bool,
}

impl InstanceRecord {
    /// Creates a record in `DEFINED`.
    pub fn new(id: impl Into<String>, definition: UnitDefinition, source_dir: Option<PathBuf>) -> Self {
        Self {
            id: id.into(),
            definition,
            status: InstanceState::Defined,
            source_dir,
            outfile: None,
            namespace: None,
            connection_points: Vec::new(),
            virtual_interfaces: Vec::new(),
            pid: None,
            process: None,
            defined_at: Utc::now(),
            retired: false,
        }
    }

    pub fn definition_id(&self) -> &str {
        &self.definition.fdu_id
    }

    pub fn command(&self) -> &str {
        &self.definition.command
    }

    pub fn args(&self) -> &[String] {
        &self.definition.args
    }

    /// Fails with `IllegalTransition` unless the record is in `expected`.
    pub fn expect_state(&self, expected: InstanceState) -> Result<()> {
        if self.status != expected {
            return Err(Error::IllegalTransition {
                id: self.id.clone(),
                state: self.status.to_string(),
                expected: expected.to_string(),
            });
        }
        Ok(())
    }

    /// Fails unless the record is `CONFIGURED` or `RUNNING`.
    pub fn expect_deployed(&self) -> Result<()> {
        match self.status {
            InstanceState::Configured | InstanceState::Running => Ok(()),
            other => Err(Error::IllegalTransition {
                id: self.id.clone(),
                state: other.to_string(),
                expected: "CONFIGURED or RUNNING".to_string(),
            }),
        }
    }

    /// DEFINED → CONFIGURED.
    pub fn on_configured(
        &mut self,
        namespace: Option<String>,
        connection_points: Vec<ConnectionPoint>,
        virtual_interfaces: Vec<InterfacePair>,
    ) {
        self.namespace = namespace;
        self.connection_points = connection_points;
        self.virtual_interfaces = virtual_interfaces;
        self.status = InstanceState::Configured;
    }

    /// CONFIGURED → DEFINED.
    pub fn on_clean(&mut self) {
        self.namespace = None;
        self.connection_points.clear();
        self.virtual_interfaces.clear();
        self.outfile = None;
        self.status = InstanceState::Defined;
    }

    /// CONFIGURED → RUNNING.
    pub fn on_start(&mut self, pid: u32, process: ProcessHandle) {
        self.pid = Some(pid);
        self.process = Some(process);
        self.status = InstanceState::Running;
    }

    /// RUNNING → CONFIGURED.
    pub fn on_stop(&mut self) {
        self.pid = None;
        self.process = None;
        self.status = InstanceState::Configured;
    }

    /// Read-only snapshot.
    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            id: self.id.clone(),
            definition_id: self.definition.fdu_id.clone(),
            name: self.definition.name.clone(),
            status: self.status,
            pid: self.pid,
            namespace: self.namespace.clone(),
            interfaces: self.virtual_interfaces.len(),
            connection_points: self.connection_points.len(),
            defined_at: self.defined_at,
        }
    }
}

/// Serializable snapshot of an [`InstanceRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    pub definition_id: String,
    pub name: String,
    pub status: InstanceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub interfaces: usize,
    pub connection_points: usize,
    pub defined_at: DateTime<Utc>,
}
