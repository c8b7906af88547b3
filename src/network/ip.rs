//! iproute2-backed [`NetworkManager`].
//!
//! Every primitive shells out to `ip` with a timeout. Namespaces are named
//! `fos-<8 hex>`, connection-point bridges `cp-<8 hex>`, generated host
//! links `ve-`/`mv-`/`vn-` plus 8 hex characters, all within IFNAMSIZ.
//!
//! Virtual networks are host bridges named `vb-` plus 8 hex characters of a
//! v5 UUID over the full network reference. A network bridge lives as long
//! as at least one connection point is joined to it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{ConnectionPoint, InterfaceInfo, InterfaceMedia, InterfacePair, NetworkManager};
use crate::error::{Error, Result};
use crate::unit::ConnectionPointSpec;

/// Upper bound for one `ip` invocation.
const IP_TIMEOUT: Duration = Duration::from_secs(10);

/// sysfs directory describing host links.
const SYS_CLASS_NET: &str = "/sys/class/net";

/// ARPHRD_ETHER.
const ARPHRD_ETHER: &str = "1";

/// Connection points joined to each virtual network, keyed by bridge name.
#[derive(Debug, Clone, Default)]
struct NetworkBridges {
    members: Arc<Mutex<HashMap<String, usize>>>,
}

impl NetworkBridges {
    /// Counts one more member of `vld_ref` and returns its bridge.
    fn acquire(&self, vld_ref: &str) -> String {
        let bridge = bridge_for_network(vld_ref);
        if let Ok(mut members) = self.members.lock() {
            *members.entry(bridge.clone()).or_insert(0) += 1;
        }
        bridge
    }

    /// Counts one member of `vld_ref` out. Returns the bridge once nothing
    /// is joined to it anymore.
    fn release(&self, vld_ref: &str) -> Option<String> {
        let bridge = bridge_for_network(vld_ref);
        let mut members = self.members.lock().ok()?;
        let count = members.get_mut(&bridge)?;
        *count = count.saturating_sub(1);
        if *count > 0 {
            return None;
        }
        members.remove(&bridge);
        Some(bridge)
    }
}

/// `vb-<8 hex>` derived from the whole network reference.
fn bridge_for_network(vld_ref: &str) -> String {
    let id = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, vld_ref.as_bytes())
        .simple()
        .to_string();
    format!("vb-{}", &id[..8])
}

/// Network manager that drives the host with `ip` and `dhclient`.
#[derive(Debug, Clone)]
pub struct IpNetworkManager {
    sysfs_root: PathBuf,
    networks: NetworkBridges,
}

impl Default for IpNetworkManager {
    fn default() -> Self {
        Self::new()
    }
}

impl IpNetworkManager {
    pub fn new() -> Self {
        Self {
            sysfs_root: PathBuf::from(SYS_CLASS_NET),
            networks: NetworkBridges::default(),
        }
    }

    /// Reads link metadata from `root` instead of `/sys/class/net`.
    pub fn with_sysfs_root(root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: root.into(),
            networks: NetworkBridges::default(),
        }
    }

    /// Runs `ip <args>` and returns stdout.
    async fn ip(&self, operation: &str, args: &[&str]) -> Result<String> {
        run("ip", operation, args).await
    }

    async fn join_network(&self, cp: &mut ConnectionPoint, network_bridge: &str) -> Result<()> {
        if !self.sysfs_root.join(network_bridge).exists() {
            self.ip("connect_to_network", &["link", "add", "name", network_bridge, "type", "bridge"])
                .await?;
            self.ip("connect_to_network", &["link", "set", network_bridge, "up"]).await?;
        }

        let cp_end = short_name("vn-");
        let net_end = short_name("vn-");
        self.ip(
            "connect_to_network",
            &["link", "add", &cp_end, "type", "veth", "peer", "name", &net_end],
        )
        .await?;
        cp.links.push(cp_end.clone());
        self.ip("connect_to_network", &["link", "set", &cp_end, "master", &cp.bridge, "up"])
            .await?;
        self.ip("connect_to_network", &["link", "set", &net_end, "master", network_bridge, "up"])
            .await?;
        Ok(())
    }

    /// Drops one member of `vld_ref`, deleting its bridge with the last one.
    async fn leave_network(&self, vld_ref: &str) {
        let Some(bridge) = self.networks.release(vld_ref) else {
            return;
        };
        match self.ip("leave_network", &["link", "delete", &bridge, "type", "bridge"]).await {
            Ok(_) => info!(network = %vld_ref, bridge = %bridge, "virtual network bridge deleted"),
            Err(e) => warn!(network = %vld_ref, bridge = %bridge, error = %e, "failed to delete virtual network bridge"),
        }
    }
}

async fn run(program: &str, operation: &str, args: &[&str]) -> Result<String> {
    debug!(program, ?args, "network command");
    let output = tokio::time::timeout(IP_TIMEOUT, Command::new(program).args(args).output())
        .await
        .map_err(|_| Error::network(operation, format!("{} timed out after {:?}", program, IP_TIMEOUT)))?
        .map_err(|e| Error::network(operation, format!("{} failed to run: {}", program, e)))?;

    if !output.status.success() {
        return Err(Error::network(
            operation,
            format!(
                "{} {} exited with {}: {}",
                program,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `<prefix><8 hex>`
fn short_name(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", prefix, &id[..8])
}

/// Classifies a link from its sysfs directory.
pub fn classify_media(link_dir: &Path) -> Result<InterfaceMedia> {
    if !link_dir.exists() {
        return Err(Error::network(
            "interface_media",
            format!("no such interface: {}", link_dir.display()),
        ));
    }
    if link_dir.join("wireless").exists() || link_dir.join("phy80211").exists() {
        return Ok(InterfaceMedia::Wireless);
    }
    if link_dir.join("bridge").exists() {
        return Ok(InterfaceMedia::Bridge);
    }
    let link_type = std::fs::read_to_string(link_dir.join("type")).unwrap_or_default();
    if link_type.trim() == ARPHRD_ETHER && link_dir.join("device").exists() {
        return Ok(InterfaceMedia::Ethernet);
    }
    Ok(InterfaceMedia::Other)
}

#[async_trait]
impl NetworkManager for IpNetworkManager {
    async fn create_namespace(&self) -> Result<String> {
        let name = short_name("fos-");
        self.ip("create_namespace", &["netns", "add", &name]).await?;
        self.ip("create_namespace", &["-n", &name, "link", "set", "lo", "up"]).await?;
        info!(namespace = %name, "network namespace created");
        Ok(name)
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        self.ip("delete_namespace", &["netns", "delete", namespace]).await?;
        info!(namespace = %namespace, "network namespace deleted");
        Ok(())
    }

    async fn create_connection_point(&self, spec: &ConnectionPointSpec) -> Result<ConnectionPoint> {
        let uuid = uuid::Uuid::new_v4().to_string();
        let bridge = format!("cp-{}", &uuid.replace('-', "")[..8]);
        self.ip("create_connection_point", &["link", "add", "name", &bridge, "type", "bridge"])
            .await?;
        self.ip("create_connection_point", &["link", "set", &bridge, "up"]).await?;
        debug!(cp = %spec.cp_id, bridge = %bridge, "connection point created");
        Ok(ConnectionPoint {
            uuid,
            cp_id: spec.cp_id.clone(),
            bridge,
            vld_ref: spec.vld_ref.clone(),
            links: Vec::new(),
        })
    }

    async fn connect_to_network(&self, cp: &mut ConnectionPoint, vld_ref: &str) -> Result<()> {
        let network_bridge = self.networks.acquire(vld_ref);
        if let Err(e) = self.join_network(cp, &network_bridge).await {
            for link in cp.links.drain(..) {
                if let Err(cleanup) = self.ip("connect_to_network", &["link", "delete", &link]).await {
                    warn!(cp = %cp.cp_id, link = %link, error = %cleanup, "failed to roll back network link");
                }
            }
            self.leave_network(vld_ref).await;
            return Err(e);
        }
        debug!(cp = %cp.cp_id, network = %vld_ref, bridge = %network_bridge, "connection point joined virtual network");
        Ok(())
    }

    async fn remove_connection_point(&self, cp: &ConnectionPoint) -> Result<()> {
        for link in &cp.links {
            // Deleting one veth end removes its peer.
            if let Err(e) = self.ip("remove_connection_point", &["link", "delete", link]).await {
                warn!(cp = %cp.cp_id, link = %link, error = %e, "failed to delete network link");
            }
        }
        // Links exist only for a connection point that joined its network.
        if !cp.links.is_empty()
            && let Some(vld_ref) = &cp.vld_ref
        {
            self.leave_network(vld_ref).await;
        }
        self.ip("remove_connection_point", &["link", "delete", &cp.bridge, "type", "bridge"])
            .await?;
        Ok(())
    }

    async fn interface_media(&self, face: &str) -> Result<InterfaceMedia> {
        classify_media(&self.sysfs_root.join(face))
    }

    async fn create_macvlan(&self, face: &str) -> Result<String> {
        let name = short_name("mv-");
        self.ip(
            "create_macvlan",
            &["link", "add", &name, "link", face, "type", "macvlan", "mode", "bridge"],
        )
        .await?;
        Ok(name)
    }

    async fn move_to_namespace(&self, intf: &str, namespace: &str) -> Result<()> {
        self.ip("move_to_namespace", &["link", "set", intf, "netns", namespace]).await?;
        Ok(())
    }

    async fn assign_mac(&self, intf: &str, namespace: &str, mac: &str) -> Result<()> {
        self.ip("assign_mac", &["-n", namespace, "link", "set", intf, "address", mac])
            .await?;
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str, namespace: &str) -> Result<()> {
        self.ip("rename", &["-n", namespace, "link", "set", old, "down"]).await?;
        self.ip("rename", &["-n", namespace, "link", "set", old, "name", new]).await?;
        Ok(())
    }

    async fn assign_address(
        &self,
        intf: &str,
        namespace: &str,
        address: Option<&str>,
    ) -> Result<Option<String>> {
        self.ip("assign_address", &["-n", namespace, "link", "set", intf, "up"]).await?;
        match address {
            Some(cidr) => {
                self.ip("assign_address", &["-n", namespace, "addr", "add", cidr, "dev", intf])
                    .await?;
                Ok(Some(cidr.to_string()))
            }
            None => {
                run(
                    "ip",
                    "assign_address",
                    &["netns", "exec", namespace, "dhclient", "-nw", intf],
                )
                .await?;
                Ok(None)
            }
        }
    }

    async fn create_veth(&self, name: &str, namespace: &str) -> Result<InterfacePair> {
        let external = short_name("ve-");
        self.ip(
            "create_veth",
            &["link", "add", &external, "type", "veth", "peer", "name", name, "netns", namespace],
        )
        .await?;
        self.ip("create_veth", &["link", "set", &external, "up"]).await?;
        Ok(InterfacePair {
            internal: InterfaceInfo::created(name, Some(namespace)),
            external: Some(InterfaceInfo::created(external, None)),
        })
    }

    async fn attach_to_bridge(&self, intf: &str, bridge: &str) -> Result<()> {
        self.ip("attach_to_bridge", &["link", "set", intf, "master", bridge]).await?;
        Ok(())
    }

    async fn detach_from_bridge(&self, intf: &str) -> Result<()> {
        self.ip("detach_from_bridge", &["link", "set", intf, "nomaster"]).await?;
        Ok(())
    }

    async fn delete_interface(&self, intf: &str, namespace: Option<&str>) -> Result<()> {
        match namespace {
            Some(ns) => self.ip("delete_interface", &["-n", ns, "link", "delete", intf]).await?,
            None => self.ip("delete_interface", &["link", "delete", intf]).await?,
        };
        Ok(())
    }

    async fn release_to_host(&self, intf: &str, original_name: &str, namespace: &str) -> Result<()> {
        if intf != original_name {
            self.rename(intf, original_name, namespace).await?;
        }
        self.ip(
            "release_to_host",
            &["-n", namespace, "link", "set", original_name, "netns", "1"],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(root: &Path, name: &str, link_type: &str, extra: &[&str]) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("type"), format!("{}\n", link_type)).unwrap();
        for e in extra {
            std::fs::create_dir_all(dir.join(e)).unwrap();
        }
    }

    #[tokio::test]
    async fn test_interface_media_from_sysfs() {
        let root = tempfile::tempdir().unwrap();
        link(root.path(), "eth0", "1", &["device"]);
        link(root.path(), "wlan0", "1", &["device", "wireless"]);
        link(root.path(), "br0", "1", &["bridge"]);
        link(root.path(), "veth9", "1", &[]);

        let net = IpNetworkManager::with_sysfs_root(root.path());
        assert_eq!(net.interface_media("eth0").await.unwrap(), InterfaceMedia::Ethernet);
        assert_eq!(net.interface_media("wlan0").await.unwrap(), InterfaceMedia::Wireless);
        assert_eq!(net.interface_media("br0").await.unwrap(), InterfaceMedia::Bridge);
        assert_eq!(net.interface_media("veth9").await.unwrap(), InterfaceMedia::Other);
        assert!(net.interface_media("missing").await.is_err());
    }

    #[test]
    fn test_generated_names_fit_ifnamsiz() {
        for prefix in ["fos-", "ve-", "mv-", "vn-", "cp-"] {
            assert!(short_name(prefix).len() <= crate::constants::MAX_IFNAME_LEN);
        }
    }

    #[test]
    fn test_network_bridge_names_distinct_per_network() {
        let alpha1 = bridge_for_network("net-alpha1");
        let alpha2 = bridge_for_network("net-alpha2");
        assert_ne!(alpha1, alpha2);
        assert_eq!(alpha1, bridge_for_network("net-alpha1"));
        assert!(alpha1.starts_with("vb-"));
        assert!(alpha1.len() <= crate::constants::MAX_IFNAME_LEN);
    }

    #[test]
    fn test_network_bridge_released_with_last_member() {
        let networks = NetworkBridges::default();
        let bridge = networks.acquire("net-alpha1");
        assert_eq!(networks.acquire("net-alpha1"), bridge);
        networks.acquire("net-alpha2");

        assert_eq!(networks.release("net-alpha1"), None);
        assert_eq!(networks.release("net-alpha1"), Some(bridge));
        assert_eq!(networks.release("net-alpha1"), None);
        assert_eq!(networks.release("net-alpha2"), Some(bridge_for_network("net-alpha2")));
    }

    #[test]
    fn test_clones_share_network_membership() {
        let net = IpNetworkManager::new();
        let other = net.clone();
        net.networks.acquire("net-a");
        assert!(other.networks.release("net-a").is_some());
    }
}
