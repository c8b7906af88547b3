//! Builds and tears down the network of one instance.
//!
//! Building is best-effort: a connection point or interface that fails is
//! logged and skipped, and everything that did get created is recorded so
//! teardown can remove it. Only failing to create the namespace itself
//! aborts, after removing the connection points created so far.

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, error, info, warn};

use super::{ConnectionPoint, InterfaceInfo, InterfaceMedia, InterfacePair, LinkOrigin, NetworkManager};
use crate::error::{Error, Result};
use crate::unit::{InterfaceKind, InterfaceSpec, UnitDefinition};

/// First octet of generated MACs: locally administered bit set, multicast bit clear.
const LOCALLY_ADMINISTERED: u8 = 0x02;

/// Unicast, locally administered MAC in the `02:16:` range used for unit
/// interfaces.
pub fn generate_mac() -> String {
    let mut rng = rand::thread_rng();
    let bytes = [
        LOCALLY_ADMINISTERED,
        0x16,
        rng.gen_range(0x00..=0x7f),
        rng.gen_range(0x00..=0x7f),
        rng.r#gen::<u8>(),
        rng.r#gen::<u8>(),
    ];
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Result of building an instance network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkPlan {
    pub namespace: Option<String>,
    pub connection_points: Vec<ConnectionPoint>,
    pub interfaces: Vec<InterfacePair>,
}

/// Drives a [`NetworkManager`] through the interface strategies.
#[derive(Clone)]
pub struct NamespaceBuilder {
    net: Arc<dyn NetworkManager>,
}

impl NamespaceBuilder {
    pub fn new(net: Arc<dyn NetworkManager>) -> Self {
        Self { net }
    }

    pub fn manager(&self) -> &Arc<dyn NetworkManager> {
        &self.net
    }

    /// Creates connection points, the namespace, then every interface.
    pub async fn build(&self, instance: &str, unit: &UnitDefinition) -> Result<NetworkPlan> {
        let mut plan = NetworkPlan::default();

        for spec in &unit.connection_points {
            let mut cp = match self.net.create_connection_point(spec).await {
                Ok(cp) => cp,
                Err(e) => {
                    error!(instance = %instance, cp = %spec.cp_id, error = %e, "failed to create connection point");
                    continue;
                }
            };
            if let Some(vld) = &spec.vld_ref
                && let Err(e) = self.net.connect_to_network(&mut cp, vld).await
            {
                warn!(instance = %instance, cp = %spec.cp_id, network = %vld, error = %e, "failed to join virtual network");
            }
            plan.connection_points.push(cp);
        }

        let namespace = match self.net.create_namespace().await {
            Ok(ns) => ns,
            Err(e) => {
                for cp in &plan.connection_points {
                    if let Err(e) = self.net.remove_connection_point(cp).await {
                        warn!(instance = %instance, cp = %cp.cp_id, error = %e, "failed to roll back connection point");
                    }
                }
                return Err(e);
            }
        };
        plan.namespace = Some(namespace.clone());

        for intf in &unit.interfaces {
            match self.build_interface(instance, &namespace, intf, &plan.connection_points).await {
                Ok(Some(pair)) => plan.interfaces.push(pair),
                Ok(None) => {}
                Err(e) => {
                    error!(instance = %instance, interface = %intf.vintf_name, error = %e, "failed to create interface");
                }
            }
        }

        info!(
            instance = %instance,
            namespace = %namespace,
            interfaces = plan.interfaces.len(),
            connection_points = plan.connection_points.len(),
            "instance network built"
        );
        Ok(plan)
    }

    async fn build_interface(
        &self,
        instance: &str,
        ns: &str,
        intf: &InterfaceSpec,
        cps: &[ConnectionPoint],
    ) -> Result<Option<InterfacePair>> {
        if intf.kind == InterfaceKind::Virtual {
            return self.build_virtual(instance, ns, intf, cps).await.map(Some);
        }

        let face = intf.phy_face.as_deref().ok_or_else(|| {
            Error::InvalidInput(format!(
                "interface '{}' of kind {:?} needs a phy_face",
                intf.vintf_name, intf.kind
            ))
        })?;

        match self.net.interface_media(face).await? {
            InterfaceMedia::Ethernet => self.build_macvlan(instance, ns, intf, face).await.map(Some),
            InterfaceMedia::Wireless => self.build_moved(ns, intf, face).await.map(Some),
            InterfaceMedia::Bridge | InterfaceMedia::Other => {
                self.build_bridged(instance, ns, intf, face).await.map(Some)
            }
        }
    }

    /// macvlan on an ethernet face, moved in, MAC, renamed, addressed.
    async fn build_macvlan(
        &self,
        instance: &str,
        ns: &str,
        intf: &InterfaceSpec,
        face: &str,
    ) -> Result<InterfacePair> {
        debug!(instance = %instance, face = %face, "creating macvlan interface");
        let mac = intf.mac_address.clone().unwrap_or_else(generate_mac);
        let tmp = self.net.create_macvlan(face).await?;

        if let Err(e) = self.net.move_to_namespace(&tmp, ns).await {
            if let Err(cleanup) = self.net.delete_interface(&tmp, None).await {
                warn!(instance = %instance, interface = %tmp, error = %cleanup, "failed to remove stray macvlan");
            }
            return Err(e);
        }

        let mut internal = InterfaceInfo::created(&tmp, Some(ns));
        if self.step(instance, "assign mac", self.net.assign_mac(&tmp, ns, &mac).await) {
            internal.mac = Some(mac);
        }
        if self.step(instance, "rename", self.net.rename(&tmp, &intf.vintf_name, ns).await) {
            internal.name = intf.vintf_name.clone();
        }
        internal.address = self.address(instance, &internal.name, ns, intf).await;

        Ok(InterfacePair {
            internal,
            external: None,
        })
    }

    /// Wireless face moved in whole and renamed.
    async fn build_moved(&self, ns: &str, intf: &InterfaceSpec, face: &str) -> Result<InterfacePair> {
        self.net.move_to_namespace(face, ns).await?;
        let internal = match self.net.rename(face, &intf.vintf_name, ns).await {
            Ok(()) => InterfaceInfo::moved(&intf.vintf_name, face, ns),
            Err(e) => {
                warn!(face = %face, error = %e, "moved wireless face keeps its host name");
                InterfaceInfo::moved(face, face, ns)
            }
        };
        Ok(InterfacePair {
            internal,
            external: None,
        })
    }

    /// veth pair with the external end on the face bridge.
    async fn build_bridged(
        &self,
        instance: &str,
        ns: &str,
        intf: &InterfaceSpec,
        face: &str,
    ) -> Result<InterfacePair> {
        let mut pair = self.net.create_veth(&intf.vintf_name, ns).await?;
        if let Some(ext) = &pair.external {
            self.step(instance, "attach to bridge", self.net.attach_to_bridge(&ext.name, face).await);
        }
        self.set_mac(instance, ns, intf, &mut pair).await;
        pair.internal.address = self.address(instance, &intf.vintf_name, ns, intf).await;
        Ok(pair)
    }

    /// veth pair with the external end on the connection point bridge.
    async fn build_virtual(
        &self,
        instance: &str,
        ns: &str,
        intf: &InterfaceSpec,
        cps: &[ConnectionPoint],
    ) -> Result<InterfacePair> {
        let mut pair = self.net.create_veth(&intf.vintf_name, ns).await?;
        self.set_mac(instance, ns, intf, &mut pair).await;

        let cp = intf
            .cp_id
            .as_deref()
            .and_then(|id| cps.iter().find(|cp| cp.cp_id == id));
        match (cp, &pair.external) {
            (Some(cp), Some(ext)) => {
                self.step(instance, "attach to connection point", self.net.attach_to_bridge(&ext.name, &cp.bridge).await);
                pair.internal.address = self.address(instance, &intf.vintf_name, ns, intf).await;
            }
            _ => match &intf.cp_id {
                Some(cp_id) => warn!(
                    instance = %instance,
                    interface = %intf.vintf_name,
                    cp = %cp_id,
                    "connection point not found, interface left unattached"
                ),
                None => warn!(
                    instance = %instance,
                    interface = %intf.vintf_name,
                    "interface not connected to anything"
                ),
            },
        }
        Ok(pair)
    }

    async fn set_mac(&self, instance: &str, ns: &str, intf: &InterfaceSpec, pair: &mut InterfacePair) {
        let mac = intf.mac_address.clone().unwrap_or_else(generate_mac);
        if self.step(instance, "assign mac", self.net.assign_mac(&intf.vintf_name, ns, &mac).await) {
            pair.internal.mac = Some(mac);
        }
    }

    async fn address(&self, instance: &str, name: &str, ns: &str, intf: &InterfaceSpec) -> Option<String> {
        match self.net.assign_address(name, ns, intf.address.as_deref()).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!(instance = %instance, interface = %name, error = %e, "failed to assign address");
                None
            }
        }
    }

    /// Logs a failed best-effort step. Returns true on success.
    fn step(&self, instance: &str, what: &str, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(instance = %instance, step = %what, error = %e, "network step failed");
                false
            }
        }
    }

    /// Removes interfaces, then connection points, then the namespace.
    ///
    /// Best-effort; returns the number of steps that failed.
    pub async fn teardown(
        &self,
        instance: &str,
        namespace: Option<&str>,
        connection_points: &[ConnectionPoint],
        interfaces: &[InterfacePair],
    ) -> usize {
        let mut failures = 0;

        for pair in interfaces {
            if let Some(ext) = &pair.external
                && !self.step(instance, "detach from bridge", self.net.detach_from_bridge(&ext.name).await)
            {
                failures += 1;
            }
            let internal = &pair.internal;
            let ns = internal.namespace.as_deref().or(namespace);
            let result = match (&internal.origin, ns) {
                (LinkOrigin::Created, ns) => self.net.delete_interface(&internal.name, ns).await,
                (LinkOrigin::Moved { original_name }, Some(ns)) => {
                    self.net.release_to_host(&internal.name, original_name, ns).await
                }
                (LinkOrigin::Moved { .. }, None) => Ok(()),
            };
            if !self.step(instance, "delete interface", result) {
                failures += 1;
            }
        }

        for cp in connection_points {
            if !self.step(instance, "remove connection point", self.net.remove_connection_point(cp).await) {
                failures += 1;
            }
        }

        if let Some(ns) = namespace
            && !self.step(instance, "delete namespace", self.net.delete_namespace(ns).await)
        {
            failures += 1;
        }

        if failures > 0 {
            warn!(instance = %instance, failures, "instance network torn down with failures");
        } else {
            info!(instance = %instance, "instance network torn down");
        }
        failures
    }
}
