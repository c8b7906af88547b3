//! # magiknative
//!
//! **Node-local lifecycle orchestrator for native units**
//!
//! A native unit is a plain OS process that runs inside its own network
//! namespace instead of a container image or VM. This crate receives
//! desired-state notifications for instances assigned to the local node,
//! drives each instance through a strict state machine, and performs the
//! OS-level side effects needed to get there.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          magiknative                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │   Notification ──► Dispatcher ──► Orchestrator ◄── invoke (rpc)     │
//! │                                      │                              │
//! │        ┌─────────────────┬───────────┼──────────────┐               │
//! │        ▼                 ▼           ▼              ▼               │
//! │  ArtifactStager   NamespaceBuilder  Supervisor   StateStore         │
//! │  download/copy    netns, veth,      script/argv  status, errors,    │
//! │  tar/gz/zip       macvlan, cp       pid, signals remote ops         │
//! │                        │                 │                          │
//! │                  NetworkManager    ProcessSignaller                 │
//! │                   (ip, sysfs)        (kill/killpg)                  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Instance Lifecycle
//!
//! ```text
//!   ┌─────────┐  define   ┌─────────┐ configure ┌────────────┐  start/run  ┌─────────┐
//!   │ (none)  │ ────────► │ DEFINED │ ────────► │ CONFIGURED │ ──────────► │ RUNNING │
//!   └─────────┘ ◄──────── └─────────┘ ◄──────── └────────────┘ ◄────────── └─────────┘
//!               undefine              clean                    stop / exit
//! ```
//!
//! `PAUSED` exists in the state vocabulary but is never entered: pause,
//! resume and migration to another node are rejected with code 7.
//!
//! # Key Properties
//!
//! - **Legal edges only**: a transition requested from the wrong state fails
//!   with [`Error::IllegalTransition`] and changes nothing.
//! - **Symmetric networking**: everything `configure` builds, `clean` tears
//!   down (interfaces, connection points, then the namespace).
//! - **Bounded termination**: `stop` sends at most one kill per pid, and
//!   nothing after the process is gone.
//! - **Path Traversal Protection**: archive extraction and `file` reads reject
//!   names escaping the instance directory.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use magiknative::{IpNetworkManager, MemoryStore, NodeConfig, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> magiknative::Result<()> {
//!     let config = NodeConfig::from_file("/etc/magiknative/config.yaml".as_ref())?;
//!     let orchestrator = Orchestrator::new(
//!         &config,
//!         Arc::new(IpNetworkManager::new()),
//!         Arc::new(MemoryStore::new()),
//!     )?;
//!     let unit = serde_json::from_str(r#"{"fdu_id":"d1","name":"web","command":"sleep","args":["100"]}"#)?;
//!     orchestrator.define("i1", unit).await?;
//!     orchestrator.configure("i1").await?;
//!     orchestrator.start("i1", "").await?;
//!     orchestrator.force_terminate("i1").await
//! }
//! ```

pub mod artifact;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod instance;
pub mod network;
pub mod orchestrator;
pub mod platform;
pub mod rpc;
pub mod script;
pub mod store;
pub mod supervisor;
pub mod unit;

// Re-exports
pub use artifact::{ArchiveFormat, ArtifactSource, ArtifactStager};
pub use config::NodeConfig;
pub use constants::*;
pub use dispatch::{Action, Dispatcher, Notification, Outcome};
pub use error::{Error, Result};
pub use instance::{InstanceInfo, InstanceRecord, InstanceState};
pub use network::{IpNetworkManager, NamespaceBuilder, NetworkManager};
pub use orchestrator::Orchestrator;
pub use platform::{Arch, Capability, Os, Platform};
pub use rpc::{EvalReply, EvalRequest, EvalResponse};
pub use script::ScriptFamily;
pub use store::{JsonLinesStore, MemoryStore, RemoteOperation, StateStore, StoreEvent};
pub use supervisor::{LibcSignaller, ProcessSignaller, Signal, Supervisor, Termination};
pub use unit::{ConnectionPointSpec, InterfaceKind, InterfaceSpec, UnitDefinition};
