//! Boundary to the desired/actual state store.
//!
//! The orchestrator only ever *publishes* through [`StateStore`]; watching
//! desired state is the caller's job (see [`crate::dispatch`]).
//!
//! Two implementations ship with the crate:
//! - [`MemoryStore`] keeps every event in memory.
//! - [`JsonLinesStore`] writes every event as one JSON object per line.

use std::io::Write;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::instance::InstanceState;

/// Operations exposed to remote callers while an instance is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteOperation {
    Start,
    Run,
    Log,
    Ls,
    File,
}

impl RemoteOperation {
    pub const ALL: [RemoteOperation; 5] = [
        RemoteOperation::Start,
        RemoteOperation::Run,
        RemoteOperation::Log,
        RemoteOperation::Ls,
        RemoteOperation::File,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Run => "run",
            Self::Log => "log",
            Self::Ls => "ls",
            Self::File => "file",
        }
    }
}

impl std::fmt::Display for RemoteOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publication side of the state store.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Announces that the plugin on `node` is ready.
    async fn plugin_started(&self, node: &str) -> Result<()>;

    async fn update_status(&self, definition: &str, instance: &str, state: InstanceState) -> Result<()>;

    async fn report_error(&self, definition: &str, instance: &str, code: i32, message: &str) -> Result<()>;

    /// Removes the actual-state record of an instance.
    async fn remove_instance(&self, definition: &str, instance: &str) -> Result<()>;

    async fn register_operations(&self, definition: &str, instance: &str, ops: &[RemoteOperation]) -> Result<()>;

    async fn unregister_operations(&self, definition: &str, instance: &str, ops: &[RemoteOperation]) -> Result<()>;
}

/// Everything published through a [`StateStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StoreEvent {
    PluginStarted {
        node: String,
    },
    Status {
        definition: String,
        instance: String,
        status: InstanceState,
    },
    Error {
        definition: String,
        instance: String,
        code: i32,
        message: String,
    },
    Removed {
        definition: String,
        instance: String,
    },
    Registered {
        definition: String,
        instance: String,
        operations: Vec<RemoteOperation>,
    },
    Unregistered {
        definition: String,
        instance: String,
        operations: Vec<RemoteOperation>,
    },
}

impl StoreEvent {
    pub fn instance(&self) -> Option<&str> {
        match self {
            Self::PluginStarted { .. } => None,
            Self::Status { instance, .. }
            | Self::Error { instance, .. }
            | Self::Removed { instance, .. }
            | Self::Registered { instance, .. }
            | Self::Unregistered { instance, .. } => Some(instance),
        }
    }
}

fn status(definition: &str, instance: &str, state: InstanceState) -> StoreEvent {
    StoreEvent::Status {
        definition: definition.to_string(),
        instance: instance.to_string(),
        status: state,
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// Store that records events in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    events: Mutex<Vec<StoreEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: StoreEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?
            .push(event);
        Ok(())
    }

    /// Snapshot of all events so far.
    pub fn events(&self) -> Vec<StoreEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn events_for(&self, instance: &str) -> Vec<StoreEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.instance() == Some(instance))
            .collect()
    }

    /// Last status published for `instance`.
    pub fn last_status(&self, instance: &str) -> Option<InstanceState> {
        self.events_for(instance).into_iter().rev().find_map(|e| match e {
            StoreEvent::Status { status, .. } => Some(status),
            _ => None,
        })
    }

    /// `(code, message)` of every error reported for `instance`.
    pub fn errors_for(&self, instance: &str) -> Vec<(i32, String)> {
        self.events_for(instance)
            .into_iter()
            .filter_map(|e| match e {
                StoreEvent::Error { code, message, .. } => Some((code, message)),
                _ => None,
            })
            .collect()
    }

    pub fn was_removed(&self, instance: &str) -> bool {
        self.events_for(instance)
            .iter()
            .any(|e| matches!(e, StoreEvent::Removed { .. }))
    }

    /// Operations currently registered for `instance`.
    pub fn registered(&self, instance: &str) -> Vec<RemoteOperation> {
        let mut ops: Vec<RemoteOperation> = Vec::new();
        for event in self.events_for(instance) {
            match event {
                StoreEvent::Registered { operations, .. } => {
                    for op in operations {
                        if !ops.contains(&op) {
                            ops.push(op);
                        }
                    }
                }
                StoreEvent::Unregistered { operations, .. } => ops.retain(|op| !operations.contains(op)),
                _ => {}
            }
        }
        ops
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn plugin_started(&self, node: &str) -> Result<()> {
        self.push(StoreEvent::PluginStarted { node: node.to_string() })
    }

    async fn update_status(&self, definition: &str, instance: &str, state: InstanceState) -> Result<()> {
        self.push(status(definition, instance, state))
    }

    async fn report_error(&self, definition: &str, instance: &str, code: i32, message: &str) -> Result<()> {
        self.push(StoreEvent::Error {
            definition: definition.to_string(),
            instance: instance.to_string(),
            code,
            message: message.to_string(),
        })
    }

    async fn remove_instance(&self, definition: &str, instance: &str) -> Result<()> {
        self.push(StoreEvent::Removed {
            definition: definition.to_string(),
            instance: instance.to_string(),
        })
    }

    async fn register_operations(&self, definition: &str, instance: &str, ops: &[RemoteOperation]) -> Result<()> {
        self.push(StoreEvent::Registered {
            definition: definition.to_string(),
            instance: instance.to_string(),
            operations: ops.to_vec(),
        })
    }

    async fn unregister_operations(&self, definition: &str, instance: &str, ops: &[RemoteOperation]) -> Result<()> {
        self.push(StoreEvent::Unregistered {
            definition: definition.to_string(),
            instance: instance.to_string(),
            operations: ops.to_vec(),
        })
    }
}

// =============================================================================
// JSON lines store
// =============================================================================

/// Store that writes every event as a JSON line to a writer.
pub struct JsonLinesStore {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesStore {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Writes any serializable value as one line.
    pub fn write_line<T: Serialize>(&self, value: &T) -> Result<()> {
        let line = serde_json::to_string(value)?;
        let mut out = self
            .out
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonLinesStore {
    async fn plugin_started(&self, node: &str) -> Result<()> {
        self.write_line(&StoreEvent::PluginStarted { node: node.to_string() })
    }

    async fn update_status(&self, definition: &str, instance: &str, state: InstanceState) -> Result<()> {
        self.write_line(&status(definition, instance, state))
    }

    async fn report_error(&self, definition: &str, instance: &str, code: i32, message: &str) -> Result<()> {
        self.write_line(&StoreEvent::Error {
            definition: definition.to_string(),
            instance: instance.to_string(),
            code,
            message: message.to_string(),
        })
    }

    async fn remove_instance(&self, definition: &str, instance: &str) -> Result<()> {
        self.write_line(&StoreEvent::Removed {
            definition: definition.to_string(),
            instance: instance.to_string(),
        })
    }

    async fn register_operations(&self, definition: &str, instance: &str, ops: &[RemoteOperation]) -> Result<()> {
        self.write_line(&StoreEvent::Registered {
            definition: definition.to_string(),
            instance: instance.to_string(),
            operations: ops.to_vec(),
        })
    }

    async fn unregister_operations(&self, definition: &str, instance: &str, ops: &[RemoteOperation]) -> Result<()> {
        self.write_line(&StoreEvent::Unregistered {
            definition: definition.to_string(),
            instance: instance.to_string(),
            operations: ops.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registered_tracks_unregister() {
        let store = MemoryStore::new();
        store.register_operations("d", "i", &RemoteOperation::ALL).await.unwrap();
        assert_eq!(store.registered("i").len(), 5);
        store.unregister_operations("d", "i", &RemoteOperation::ALL).await.unwrap();
        assert!(store.registered("i").is_empty());
    }

    #[tokio::test]
    async fn test_last_status() {
        let store = MemoryStore::new();
        assert_eq!(store.last_status("i"), None);
        store.update_status("d", "i", InstanceState::Defined).await.unwrap();
        store.update_status("d", "i", InstanceState::Configured).await.unwrap();
        store.update_status("d", "other", InstanceState::Running).await.unwrap();
        assert_eq!(store.last_status("i"), Some(InstanceState::Configured));
    }

    #[test]
    fn test_event_wire_shape() {
        let event = status("d", "i", InstanceState::Running);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "status");
        assert_eq!(json["status"], "RUN");
    }
}
