//! Per-instance virtual networking.
//!
//! ```text
//!   ┌──────────────── namespace fos-xxxxxxxx ─────────────────┐
//!   │  eth0 (macvlan on ethernet face)                        │
//!   │  wlan (wireless face moved in)                          │
//!   │  net1 ══ veth ══╗                                       │
//!   └─────────────────╫───────────────────────────────────────┘
//!                     ║ external end
//!              bridge of face / connection point ── virtual network
//! ```
//!
//! [`NetworkManager`] is the seam to the host: primitive namespace and link
//! operations. [`IpNetworkManager`](ip::IpNetworkManager) implements it with
//! iproute2; [`NamespaceBuilder`](builder::NamespaceBuilder) turns declared
//! interfaces into calls on it and tears them down again.

pub mod builder;
pub mod ip;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::unit::ConnectionPointSpec;

pub use builder::{NamespaceBuilder, NetworkPlan, generate_mac};
pub use ip::IpNetworkManager;

// =============================================================================
// Types
// =============================================================================

/// How a link came to be inside the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkOrigin {
    /// Created for this instance; deleted at teardown.
    Created,
    /// A host face moved in; handed back at teardown under its old name.
    Moved { original_name: String },
}

/// One end of an instance interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    /// Namespace the link lives in; `None` for the host namespace.
    pub namespace: Option<String>,
    pub mac: Option<String>,
    pub address: Option<String>,
    pub origin: LinkOrigin,
}

impl InterfaceInfo {
    pub fn created(name: impl Into<String>, namespace: Option<&str>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.map(String::from),
            mac: None,
            address: None,
            origin: LinkOrigin::Created,
        }
    }

    /// A host face moved into `namespace` and renamed to `name`.
    pub fn moved(name: impl Into<String>, original: &str, namespace: &str) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.to_string()),
            mac: None,
            address: None,
            origin: LinkOrigin::Moved {
                original_name: original.to_string(),
            },
        }
    }
}

/// Internal end (inside the namespace) and optional external end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfacePair {
    pub internal: InterfaceInfo,
    pub external: Option<InterfaceInfo>,
}

/// A logical endpoint realised as a host bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionPoint {
    /// Generated identifier.
    pub uuid: String,
    /// Declared identifier interfaces refer to.
    pub cp_id: String,
    pub bridge: String,
    pub vld_ref: Option<String>,
    /// Links created to join the virtual network.
    #[serde(default)]
    pub links: Vec<String>,
}

/// Kind of a host face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceMedia {
    Ethernet,
    Wireless,
    Bridge,
    Other,
}

// =============================================================================
// Trait
// =============================================================================

/// Primitive namespace and link operations.
#[async_trait]
pub trait NetworkManager: Send + Sync {
    /// Creates a fresh network namespace and returns its name.
    async fn create_namespace(&self) -> Result<String>;

    async fn delete_namespace(&self, namespace: &str) -> Result<()>;

    async fn create_connection_point(&self, spec: &ConnectionPointSpec) -> Result<ConnectionPoint>;

    /// Joins a connection point to a virtual network.
    async fn connect_to_network(&self, cp: &mut ConnectionPoint, vld_ref: &str) -> Result<()>;

    async fn remove_connection_point(&self, cp: &ConnectionPoint) -> Result<()>;

    /// Classifies a host face.
    async fn interface_media(&self, face: &str) -> Result<InterfaceMedia>;

    /// Creates a macvlan on `face` in the host namespace; returns its name.
    async fn create_macvlan(&self, face: &str) -> Result<String>;

    async fn move_to_namespace(&self, intf: &str, namespace: &str) -> Result<()>;

    async fn assign_mac(&self, intf: &str, namespace: &str, mac: &str) -> Result<()>;

    async fn rename(&self, old: &str, new: &str, namespace: &str) -> Result<()>;

    /// Brings `intf` up and assigns `address` (CIDR) or starts DHCP.
    /// Returns the address when it is known.
    async fn assign_address(
        &self,
        intf: &str,
        namespace: &str,
        address: Option<&str>,
    ) -> Result<Option<String>>;

    /// Creates a veth pair: `name` inside `namespace`, a generated external end on the host.
    async fn create_veth(&self, name: &str, namespace: &str) -> Result<InterfacePair>;

    async fn attach_to_bridge(&self, intf: &str, bridge: &str) -> Result<()>;

    async fn detach_from_bridge(&self, intf: &str) -> Result<()>;

    /// Deletes a link, from `namespace` or from the host when `None`.
    async fn delete_interface(&self, intf: &str, namespace: Option<&str>) -> Result<()>;

    /// Renames a moved face back and returns it to the host namespace.
    async fn release_to_host(&self, intf: &str, original_name: &str, namespace: &str) -> Result<()>;

    /// Namespace processes can be launched in with `ip netns exec`, if any.
    fn exec_namespace<'a>(&self, namespace: &'a str) -> Option<&'a str> {
        Some(namespace)
    }
}
