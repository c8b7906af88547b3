//! Shared fakes and fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use magiknative::network::{
    ConnectionPoint, InterfaceInfo, InterfaceMedia, InterfacePair, NetworkManager,
};
use magiknative::supervisor::{ProcessSignaller, Signal};
use magiknative::{
    ConnectionPointSpec, Error, MemoryStore, NodeConfig, Orchestrator, Result, UnitDefinition,
};

// =============================================================================
// Fixtures
// =============================================================================

/// Node configuration rooted in `base` with short timings.
pub fn test_config(base: &Path) -> NodeConfig {
    NodeConfig {
        node_id: "node-test".to_string(),
        base_dir: base.to_path_buf(),
        os: Some("linux".to_string()),
        log_level: "debug".to_string(),
        pid_file_grace_ms: 3000,
        interrupt_settle_ms: 50,
        termination_grace_ms: 200,
        not_found_backoff_ms: 0,
        failure_backoff_ms: 0,
        download_timeout_secs: 5,
    }
}

pub fn unit(fdu_id: &str, name: &str, command: &str, args: &[&str]) -> UnitDefinition {
    UnitDefinition {
        fdu_id: fdu_id.to_string(),
        name: name.to_string(),
        command: command.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        image: None,
        interfaces: Vec::new(),
        connection_points: Vec::new(),
    }
}

/// Orchestrator on a fake network and an in-memory store.
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub network: Arc<FakeNetwork>,
    pub store: Arc<MemoryStore>,
    pub config: NodeConfig,
}

impl Harness {
    pub fn new(base: &Path) -> Self {
        Self::with_network(base, FakeNetwork::new())
    }

    pub fn with_network(base: &Path, network: FakeNetwork) -> Self {
        let config = test_config(base);
        let network = Arc::new(network);
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Orchestrator::new(&config, network.clone(), store.clone())
            .expect("orchestrator");
        Self {
            orchestrator: Arc::new(orchestrator),
            network,
            store,
            config,
        }
    }

    pub fn with_signaller(base: &Path, signaller: Arc<dyn ProcessSignaller>) -> Self {
        let config = test_config(base);
        let network = Arc::new(FakeNetwork::new());
        let store = Arc::new(MemoryStore::new());
        let orchestrator =
            Orchestrator::with_signaller(&config, network.clone(), store.clone(), signaller)
                .expect("orchestrator");
        Self {
            orchestrator: Arc::new(orchestrator),
            network,
            store,
            config,
        }
    }
}

// =============================================================================
// Fake network
// =============================================================================

#[derive(Debug, Default)]
pub struct NetState {
    pub namespaces: HashSet<String>,
    /// Link name -> namespace (`None` = host).
    pub links: HashMap<String, Option<String>>,
    pub bridges: HashSet<String>,
    /// Bridge -> attached links.
    pub attached: HashMap<String, HashSet<String>>,
    pub macs: HashMap<String, String>,
    /// veth end -> peer end.
    pub peers: HashMap<String, String>,
    pub calls: Vec<String>,
}

/// In-memory [`NetworkManager`] that tracks every object it creates.
#[derive(Debug, Default)]
pub struct FakeNetwork {
    pub state: Mutex<NetState>,
    /// Media reported per host face; unknown faces fail classification.
    pub media: HashMap<String, InterfaceMedia>,
    pub fail_namespace: bool,
    /// Pause after a namespace is created, before returning it.
    pub namespace_delay: Option<Duration>,
    counter: Mutex<u32>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a host face with the given media.
    pub fn with_face(mut self, face: &str, media: InterfaceMedia) -> Self {
        self.media.insert(face.to_string(), media);
        self.state
            .get_mut()
            .unwrap()
            .links
            .insert(face.to_string(), None);
        self
    }

    pub fn failing_namespace(mut self) -> Self {
        self.fail_namespace = true;
        self
    }

    pub fn slow_namespace(mut self, delay: Duration) -> Self {
        self.namespace_delay = Some(delay);
        self
    }

    fn next(&self, prefix: &str) -> String {
        let mut c = self.counter.lock().unwrap();
        *c += 1;
        format!("{}{:04}", prefix, *c)
    }

    fn with<T>(&self, call: String, f: impl FnOnce(&mut NetState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        f(&mut state)
    }

    pub fn snapshot(&self) -> (usize, usize, usize) {
        let s = self.state.lock().unwrap();
        (s.namespaces.len(), s.links.len(), s.bridges.len())
    }

    pub fn namespaces(&self) -> HashSet<String> {
        self.state.lock().unwrap().namespaces.clone()
    }

    pub fn link_namespace(&self, name: &str) -> Option<Option<String>> {
        self.state.lock().unwrap().links.get(name).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }
}

fn missing(op: &str, what: &str) -> Error {
    Error::network(op, format!("{} does not exist", what))
}

#[async_trait]
impl NetworkManager for FakeNetwork {
    async fn create_namespace(&self) -> Result<String> {
        if self.fail_namespace {
            return Err(Error::network("netns add", "permission denied"));
        }
        let ns = self.next("fos-");
        self.with(format!("create_namespace {}", ns), |s| {
            s.namespaces.insert(ns.clone());
            Ok(())
        })?;
        if let Some(delay) = self.namespace_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(ns)
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        self.with(format!("delete_namespace {}", namespace), |s| {
            if !s.namespaces.remove(namespace) {
                return Err(missing("netns del", namespace));
            }
            s.links.retain(|_, ns| ns.as_deref() != Some(namespace));
            Ok(())
        })
    }

    async fn create_connection_point(&self, spec: &ConnectionPointSpec) -> Result<ConnectionPoint> {
        let bridge = self.next("cp-");
        self.with(format!("create_connection_point {}", spec.cp_id), |s| {
            s.bridges.insert(bridge.clone());
            Ok(ConnectionPoint {
                uuid: uuid::Uuid::new_v4().to_string(),
                cp_id: spec.cp_id.clone(),
                bridge: bridge.clone(),
                vld_ref: spec.vld_ref.clone(),
                links: Vec::new(),
            })
        })
    }

    async fn connect_to_network(&self, cp: &mut ConnectionPoint, vld_ref: &str) -> Result<()> {
        let link = self.next("ve-");
        self.with(format!("connect_to_network {} {}", cp.bridge, vld_ref), |s| {
            s.links.insert(link.clone(), None);
            Ok(())
        })?;
        cp.links.push(link);
        Ok(())
    }

    async fn remove_connection_point(&self, cp: &ConnectionPoint) -> Result<()> {
        self.with(format!("remove_connection_point {}", cp.bridge), |s| {
            for link in &cp.links {
                s.links.remove(link);
            }
            s.attached.remove(&cp.bridge);
            if !s.bridges.remove(&cp.bridge) {
                return Err(missing("link del", &cp.bridge));
            }
            Ok(())
        })
    }

    async fn interface_media(&self, face: &str) -> Result<InterfaceMedia> {
        match self.media.get(face) {
            Some(m) => Ok(*m),
            None => Err(missing("classify", face)),
        }
    }

    async fn create_macvlan(&self, face: &str) -> Result<String> {
        let name = self.next("mv-");
        self.with(format!("create_macvlan {}", face), |s| {
            s.links.insert(name.clone(), None);
            Ok(name.clone())
        })
    }

    async fn move_to_namespace(&self, intf: &str, namespace: &str) -> Result<()> {
        self.with(format!("move_to_namespace {} {}", intf, namespace), |s| {
            if !s.namespaces.contains(namespace) {
                return Err(missing("set netns", namespace));
            }
            match s.links.get_mut(intf) {
                Some(ns) => {
                    *ns = Some(namespace.to_string());
                    Ok(())
                }
                None => Err(missing("set netns", intf)),
            }
        })
    }

    async fn assign_mac(&self, intf: &str, _namespace: &str, mac: &str) -> Result<()> {
        self.with(format!("assign_mac {} {}", intf, mac), |s| {
            s.macs.insert(intf.to_string(), mac.to_string());
            Ok(())
        })
    }

    async fn rename(&self, old: &str, new: &str, namespace: &str) -> Result<()> {
        self.with(format!("rename {} {} {}", old, new, namespace), |s| {
            let ns = s.links.remove(old).ok_or_else(|| missing("rename", old))?;
            s.links.insert(new.to_string(), ns);
            Ok(())
        })
    }

    async fn assign_address(
        &self,
        intf: &str,
        _namespace: &str,
        address: Option<&str>,
    ) -> Result<Option<String>> {
        self.with(format!("assign_address {}", intf), |_| {
            Ok(address.map(String::from))
        })
    }

    async fn create_veth(&self, name: &str, namespace: &str) -> Result<InterfacePair> {
        let external = self.next("ve-");
        self.with(format!("create_veth {} {}", name, namespace), |s| {
            if !s.namespaces.contains(namespace) {
                return Err(missing("veth", namespace));
            }
            s.links.insert(name.to_string(), Some(namespace.to_string()));
            s.links.insert(external.clone(), None);
            s.peers.insert(name.to_string(), external.clone());
            s.peers.insert(external.clone(), name.to_string());
            Ok(InterfacePair {
                internal: InterfaceInfo::created(name, Some(namespace)),
                external: Some(InterfaceInfo::created(external.clone(), None)),
            })
        })
    }

    async fn attach_to_bridge(&self, intf: &str, bridge: &str) -> Result<()> {
        self.with(format!("attach_to_bridge {} {}", intf, bridge), |s| {
            s.attached
                .entry(bridge.to_string())
                .or_default()
                .insert(intf.to_string());
            Ok(())
        })
    }

    async fn detach_from_bridge(&self, intf: &str) -> Result<()> {
        self.with(format!("detach_from_bridge {}", intf), |s| {
            for links in s.attached.values_mut() {
                links.remove(intf);
            }
            Ok(())
        })
    }

    async fn delete_interface(&self, intf: &str, namespace: Option<&str>) -> Result<()> {
        self.with(format!("delete_interface {} {:?}", intf, namespace), |s| {
            s.links.remove(intf).ok_or_else(|| missing("link del", intf))?;
            // Deleting one end of a veth removes its peer too.
            if let Some(peer) = s.peers.remove(intf) {
                s.peers.remove(&peer);
                s.links.remove(&peer);
            }
            s.macs.remove(intf);
            Ok(())
        })
    }

    async fn release_to_host(&self, intf: &str, original_name: &str, namespace: &str) -> Result<()> {
        self.with(format!("release_to_host {} {} {}", intf, original_name, namespace), |s| {
            s.links.remove(intf).ok_or_else(|| missing("release", intf))?;
            s.links.insert(original_name.to_string(), None);
            Ok(())
        })
    }

    /// Fake namespaces cannot be entered; processes run on the host.
    fn exec_namespace<'a>(&self, _namespace: &'a str) -> Option<&'a str> {
        None
    }
}

// =============================================================================
// Fake signaller
// =============================================================================

/// How a fake process reacts to signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Dies on the first interrupt.
    DiesOnInterrupt,
    /// Only a kill ends it.
    IgnoresInterrupt,
}

/// [`ProcessSignaller`] over a table of imaginary pids.
#[derive(Debug, Default)]
pub struct FakeSignaller {
    alive: Mutex<HashMap<i32, Reaction>>,
    /// `(pid, group?, signal)` in delivery order.
    pub sent: Mutex<Vec<(i32, bool, Signal)>>,
}

impl FakeSignaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&self, pid: i32, reaction: Reaction) {
        self.alive.lock().unwrap().insert(pid, reaction);
    }

    pub fn sent(&self) -> Vec<(i32, bool, Signal)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn kills(&self, pid: i32) -> usize {
        self.sent()
            .iter()
            .filter(|(p, _, s)| *p == pid && *s == Signal::Kill)
            .count()
    }

    fn deliver(&self, pid: i32, group: bool, signal: Signal) {
        self.sent.lock().unwrap().push((pid, group, signal));
        let mut alive = self.alive.lock().unwrap();
        let dies = match (alive.get(&pid), signal) {
            (None, _) => false,
            (Some(_), Signal::Kill) => true,
            (Some(Reaction::DiesOnInterrupt), Signal::Int) => true,
            (Some(Reaction::IgnoresInterrupt), Signal::Int) => false,
        };
        if dies {
            alive.remove(&pid);
        }
    }
}

impl ProcessSignaller for FakeSignaller {
    fn signal_group(&self, pid: i32, signal: Signal) -> Result<()> {
        self.deliver(pid, true, signal);
        Ok(())
    }

    fn signal(&self, pid: i32, signal: Signal) -> Result<()> {
        self.deliver(pid, false, signal);
        Ok(())
    }

    fn is_alive(&self, pid: i32) -> bool {
        self.alive.lock().unwrap().contains_key(&pid)
    }
}
