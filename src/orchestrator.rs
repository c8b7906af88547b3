//! Instance lifecycle state machine.
//!
//! The [`Orchestrator`] owns the instance table and performs every side
//! effect of a transition: staging, network construction, process
//! supervision and status publication.
//!
//! ## Locking
//!
//! ```text
//!   instances: RwLock<HashMap<id, Slot>>      held only to look up / insert / remove
//!        │
//!        └── Slot.record: Arc<tokio::Mutex<InstanceRecord>>
//!                 held across awaits for the whole transition
//! ```
//!
//! `run` releases the record lock while it waits for the child, so `stop`,
//! `log`, `ls` and `file` stay available during a blocking run. A record
//! removed from the table is marked `retired`; anyone who was waiting on its
//! lock sees `NotFound`.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::artifact::ArtifactStager;
use crate::config::NodeConfig;
use crate::constants::{LOG_FILE_PREFIX, MAX_INSTANCES, PID_FILE_EXT};
use crate::error::{Error, Result};
use crate::instance::{InstanceInfo, InstanceRecord, InstanceState};
use crate::network::{NamespaceBuilder, NetworkManager};
use crate::store::{RemoteOperation, StateStore};
use crate::supervisor::{
    self, EscalationPolicy, LaunchRequest, LibcSignaller, ProcessSignaller, Supervisor,
};
use crate::unit::UnitDefinition;

/// Upper bound for reaping a child after its termination escalation.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// One entry of the instance table.
#[derive(Clone)]
struct Slot {
    definition_id: String,
    record: Arc<Mutex<InstanceRecord>>,
}

/// Drives native unit instances through their lifecycle.
pub struct Orchestrator {
    node_id: String,
    apps_dir: PathBuf,
    logs_dir: PathBuf,
    instances: RwLock<HashMap<String, Slot>>,
    stager: ArtifactStager,
    network: NamespaceBuilder,
    supervisor: Supervisor,
    store: Arc<dyn StateStore>,
}

impl Orchestrator {
    /// Creates an orchestrator that signals processes with `kill(2)`.
    pub fn new(
        config: &NodeConfig,
        network: Arc<dyn NetworkManager>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        Self::with_signaller(config, network, store, Arc::new(LibcSignaller))
    }

    pub fn with_signaller(
        config: &NodeConfig,
        network: Arc<dyn NetworkManager>,
        store: Arc<dyn StateStore>,
        signaller: Arc<dyn ProcessSignaller>,
    ) -> Result<Self> {
        config.validate()?;
        config.ensure_layout()?;

        let family = config.script_family();
        let stager = ArtifactStager::new(config.apps_dir(), config.download_timeout(), family)?;
        let supervisor = Supervisor::new(
            family,
            signaller,
            config.pid_file_grace(),
            EscalationPolicy {
                settle: config.interrupt_settle(),
                grace: config.termination_grace(),
            },
        );

        info!(
            node = %config.node_id,
            base_dir = %config.base_dir.display(),
            family = ?family,
            "orchestrator ready"
        );

        Ok(Self {
            node_id: config.node_id.clone(),
            apps_dir: config.apps_dir(),
            logs_dir: config.logs_dir(),
            instances: RwLock::new(HashMap::new()),
            stager,
            network: NamespaceBuilder::new(network),
            supervisor,
            store,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    // =========================================================================
    // Table access
    // =========================================================================

    fn slot(&self, id: &str) -> Result<Slot> {
        let instances = self
            .instances
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        instances
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Locks a live record.
    async fn lock(&self, id: &str) -> Result<OwnedMutexGuard<InstanceRecord>> {
        let slot = self.slot(id)?;
        let guard = slot.record.lock_owned().await;
        if guard.retired {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(guard)
    }

    /// Drops `id` from the table. The staging directory goes with the last
    /// instance of its definition.
    fn remove_slot(&self, id: &str, definition_id: &str) -> Result<()> {
        let mut instances = self
            .instances
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        let siblings = instances
            .values()
            .filter(|s| s.definition_id == definition_id)
            .count();
        if siblings == 1
            && let Err(e) = self.stager.remove_staging(definition_id)
        {
            warn!(definition = %definition_id, error = %e, "failed to remove staging directory");
        }
        instances.remove(id);
        Ok(())
    }

    /// Ids of every live instance.
    pub fn instance_ids(&self) -> Vec<String> {
        self.instances
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.instances.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Definition id of a live instance.
    pub fn definition_of(&self, id: &str) -> Option<String> {
        self.slot(id).ok().map(|s| s.definition_id)
    }

    // =========================================================================
    // Paths
    // =========================================================================

    /// `<logs>/native_<instance>.log`
    pub fn log_path(&self, id: &str) -> PathBuf {
        self.logs_dir.join(format!("{}{}.log", LOG_FILE_PREFIX, id))
    }

    /// `<apps>/<instance>.pid`
    pub fn store_pid_file(&self, id: &str) -> PathBuf {
        self.apps_dir.join(format!("{}.{}", id, PID_FILE_EXT))
    }

    pub fn instance_dir(&self, record: &InstanceRecord) -> PathBuf {
        self.stager
            .instance_dir(&record.definition.fdu_id, &record.definition.name)
    }

    async fn publish(&self, record: &InstanceRecord) {
        if let Err(e) = self
            .store
            .update_status(record.definition_id(), &record.id, record.status)
            .await
        {
            warn!(instance = %record.id, error = %e, "failed to publish status");
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// (absent) → DEFINED.
    pub async fn define(&self, id: &str, definition: UnitDefinition) -> Result<()> {
        definition.validate()?;
        if id.is_empty() || id.contains('/') || id.contains("..") {
            return Err(Error::InvalidInput(format!("invalid instance id '{}'", id)));
        }

        let definition_id = definition.fdu_id.clone();
        let record = Arc::new(Mutex::new(InstanceRecord::new(id, definition, None)));
        let mut guard = record
            .clone()
            .try_lock_owned()
            .map_err(|e| Error::Internal(format!("fresh record locked: {}", e)))?;

        {
            let mut instances = self
                .instances
                .write()
                .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
            if instances.contains_key(id) {
                return Err(Error::AlreadyExists(id.to_string()));
            }
            if instances.len() >= MAX_INSTANCES {
                return Err(Error::InvalidInput(format!(
                    "instance limit reached ({})",
                    MAX_INSTANCES
                )));
            }
            instances.insert(
                id.to_string(),
                Slot {
                    definition_id: definition_id.clone(),
                    record,
                },
            );
        }

        match self.stager.stage(&guard.definition).await {
            Ok(source_dir) => guard.source_dir = source_dir,
            Err(e) => {
                guard.retired = true;
                self.remove_slot(id, &definition_id)?;
                error!(instance = %id, definition = %definition_id, error = %e, "define failed");
                return Err(e);
            }
        }

        self.publish(&guard).await;
        info!(instance = %id, definition = %definition_id, "defined");
        Ok(())
    }

    /// DEFINED → (absent).
    pub async fn undefine(&self, id: &str) -> Result<()> {
        let mut guard = self.lock(id).await?;
        guard.expect_state(InstanceState::Defined)?;
        let definition_id = guard.definition_id().to_string();

        self.remove_slot(id, &definition_id)?;
        guard.retired = true;

        if let Err(e) = self.store.remove_instance(&definition_id, id).await {
            warn!(instance = %id, error = %e, "failed to remove remote record");
        }
        info!(instance = %id, "undefined");
        Ok(())
    }

    /// DEFINED → CONFIGURED.
    pub async fn configure(&self, id: &str) -> Result<()> {
        let mut guard = self.lock(id).await?;
        guard.expect_state(InstanceState::Defined)?;

        let outfile = self.log_path(id);
        let instance_dir = self.instance_dir(&guard);

        tokio::fs::create_dir_all(&self.logs_dir).await?;
        tokio::fs::File::create(&outfile).await?;
        tokio::fs::create_dir_all(&instance_dir).await?;

        let staged = async {
            if guard.source_dir.is_some() {
                self.stager.extract(&guard.definition, &instance_dir).await?;
            }
            self.network.build(id, &guard.definition).await
        }
        .await;

        let plan = match staged {
            Ok(plan) => plan,
            Err(e) => {
                remove_file_quiet(&outfile);
                remove_dir_quiet(&instance_dir);
                error!(instance = %id, error = %e, "configure failed");
                return Err(e);
            }
        };

        guard.outfile = Some(outfile);
        guard.on_configured(plan.namespace, plan.connection_points, plan.interfaces);

        if let Err(e) = self
            .store
            .register_operations(guard.definition_id(), id, &RemoteOperation::ALL)
            .await
        {
            error!(instance = %id, error = %e, "failed to register remote operations");
        }
        self.publish(&guard).await;
        info!(instance = %id, namespace = ?guard.namespace, "configured");
        Ok(())
    }

    /// CONFIGURED → DEFINED.
    pub async fn clean(&self, id: &str) -> Result<()> {
        let mut guard = self.lock(id).await?;
        guard.expect_state(InstanceState::Configured)?;

        if let Some(outfile) = &guard.outfile {
            remove_file_quiet(outfile);
        }
        remove_dir_quiet(&self.instance_dir(&guard));

        self.network
            .teardown(
                id,
                guard.namespace.as_deref(),
                &guard.connection_points,
                &guard.virtual_interfaces,
            )
            .await;

        if let Err(e) = self
            .store
            .unregister_operations(guard.definition_id(), id, &RemoteOperation::ALL)
            .await
        {
            warn!(instance = %id, error = %e, "failed to unregister remote operations");
        }

        guard.on_clean();
        self.publish(&guard).await;
        info!(instance = %id, "cleaned");
        Ok(())
    }

    fn launch_request<'a>(
        &self,
        record: &'a InstanceRecord,
        instance_dir: &'a Path,
        log_file: &'a Path,
        env: HashMap<String, String>,
    ) -> LaunchRequest<'a> {
        let namespace = record
            .namespace
            .as_deref()
            .and_then(|ns| self.network.manager().exec_namespace(ns));
        LaunchRequest {
            instance_id: &record.id,
            command: record.command(),
            args: record.args(),
            instance_dir,
            log_file,
            namespace,
            env,
            packaged: record.source_dir.is_some(),
        }
    }

    /// CONFIGURED → RUNNING. Returns the instance id.
    pub async fn start(&self, id: &str, env: &str) -> Result<String> {
        let env = supervisor::parse_env(env)?;
        let mut guard = self.lock(id).await?;
        guard.expect_state(InstanceState::Configured)?;

        let instance_dir = self.instance_dir(&guard);
        let log_file = guard.outfile.clone().unwrap_or_else(|| self.log_path(id));
        let launched = {
            let req = self.launch_request(&guard, &instance_dir, &log_file, env);
            self.supervisor.start(&req).await?
        };

        guard.on_start(launched.pid, Arc::new(Mutex::new(launched.child)));
        self.publish(&guard).await;
        info!(instance = %id, pid = launched.pid, "running");
        Ok(id.to_string())
    }

    /// CONFIGURED → RUNNING → CONFIGURED. Returns the exit code.
    pub async fn run(&self, id: &str, env: &str) -> Result<String> {
        let env = supervisor::parse_env(env)?;
        let (pid, handle) = {
            let mut guard = self.lock(id).await?;
            guard.expect_state(InstanceState::Configured)?;

            let instance_dir = self.instance_dir(&guard);
            let log_file = guard.outfile.clone().unwrap_or_else(|| self.log_path(id));
            let launched = {
                let req = self.launch_request(&guard, &instance_dir, &log_file, env);
                self.supervisor.run(&req).await?
            };

            let handle = Arc::new(Mutex::new(launched.child));
            guard.on_start(launched.pid, handle.clone());
            self.publish(&guard).await;
            (launched.pid, handle)
        };

        debug!(instance = %id, pid, "waiting for blocking run");
        let status = handle.lock().await.wait().await;
        let code = match status {
            Ok(status) => supervisor::exit_code(status),
            Err(e) => return Err(Error::execution(id, format!("wait failed: {}", e))),
        };
        info!(instance = %id, pid, exit_code = code, "blocking run finished");

        // The instance may have been stopped (or stopped and restarted) meanwhile.
        if let Ok(mut guard) = self.lock(id).await
            && guard.status == InstanceState::Running
            && guard.pid == Some(pid)
        {
            let instance_dir = self.instance_dir(&guard);
            remove_file_quiet(&Supervisor::pid_file(&instance_dir, id));
            guard.on_stop();
            self.publish(&guard).await;
        }

        Ok(code.to_string())
    }

    /// RUNNING → CONFIGURED.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let mut guard = self.lock(id).await?;
        guard.expect_state(InstanceState::Running)?;

        let instance_dir = self.instance_dir(&guard);
        let instance_pid_file = Supervisor::pid_file(&instance_dir, id);

        let mut pids = Vec::with_capacity(3);
        if let Some(pid) = guard.pid {
            pids.push(pid as i32);
        }
        for file in [self.store_pid_file(id), instance_pid_file.clone()] {
            match supervisor::read_pid_file(&file) {
                Ok(Some(pid)) => pids.push(pid),
                Ok(None) => {}
                Err(e) => warn!(instance = %id, file = %file.display(), error = %e, "cannot read pid file"),
            }
        }

        for (pid, outcome) in self.supervisor.terminate_all(&pids).await {
            debug!(instance = %id, pid, ?outcome, "pid source terminated");
        }

        // A blocking run holds the child and reaps it itself.
        if let Some(handle) = guard.process.take()
            && let Ok(mut child) = handle.try_lock()
            && tokio::time::timeout(REAP_TIMEOUT, child.wait()).await.is_err()
        {
            warn!(instance = %id, "process not reaped after termination");
        }

        remove_file_quiet(&instance_pid_file);
        guard.on_stop();
        self.publish(&guard).await;
        info!(instance = %id, "stopped");
        Ok(())
    }

    /// Always unsupported for native units.
    pub async fn pause(&self, id: &str) -> Result<()> {
        self.slot(id)?;
        warn!(instance = %id, "native instances cannot be paused");
        Err(Error::unsupported(id, "pause"))
    }

    /// Always unsupported for native units.
    pub async fn resume(&self, id: &str) -> Result<()> {
        self.slot(id)?;
        warn!(instance = %id, "native instances cannot be resumed");
        Err(Error::unsupported(id, "resume"))
    }

    /// Succeeds only for a migration onto this node, which just drops the
    /// remote record.
    pub async fn migrate(&self, id: &str, definition_id: Option<&str>, destination: Option<&str>) -> Result<()> {
        if destination == Some(self.node_id.as_str()) {
            let definition = definition_id
                .map(String::from)
                .or_else(|| self.definition_of(id))
                .unwrap_or_default();
            self.store.remove_instance(&definition, id).await?;
            info!(instance = %id, "migration onto this node acknowledged");
            return Ok(());
        }
        self.slot(id)?;
        warn!(instance = %id, destination = ?destination, "native instances cannot be migrated");
        Err(Error::unsupported(id, "migrate"))
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Contents of the instance log.
    pub async fn log(&self, id: &str) -> Result<String> {
        let guard = self.lock(id).await?;
        guard.expect_deployed()?;
        let path = guard.outfile.clone().unwrap_or_else(|| self.log_path(id));
        drop(guard);
        let bytes = tokio::fs::read(&path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// JSON array of the file names in the instance directory.
    pub async fn ls(&self, id: &str) -> Result<String> {
        let guard = self.lock(id).await?;
        guard.expect_deployed()?;
        let dir = self.instance_dir(&guard);
        drop(guard);

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(serde_json::to_string(&names)?)
    }

    /// Contents of a file below the instance directory.
    pub async fn file(&self, id: &str, name: &str) -> Result<String> {
        let relative = Path::new(name);
        if name.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::PathTraversal {
                path: name.to_string(),
            });
        }

        let guard = self.lock(id).await?;
        guard.expect_deployed()?;
        let path = self.instance_dir(&guard).join(relative);
        drop(guard);

        if !path.is_file() {
            return Err(Error::FileUnavailable {
                path: path.display().to_string(),
            });
        }
        let bytes = tokio::fs::read(&path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn status(&self, id: &str) -> Result<InstanceState> {
        Ok(self.lock(id).await?.status)
    }

    pub async fn info(&self, id: &str) -> Result<InstanceInfo> {
        Ok(self.lock(id).await?.info())
    }

    /// Snapshots of every live instance, ordered by id.
    pub async fn list(&self) -> Vec<InstanceInfo> {
        let mut ids = self.instance_ids();
        ids.sort();
        let mut infos = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(info) = self.info(&id).await {
                infos.push(info);
            }
        }
        infos
    }

    // =========================================================================
    // Forced termination
    // =========================================================================

    /// Walks an instance back to DEFINED along legal edges, then undefines it.
    pub async fn force_terminate(&self, id: &str) -> Result<()> {
        info!(instance = %id, "forcing termination");
        loop {
            match self.status(id).await? {
                InstanceState::Running => self.stop(id).await?,
                InstanceState::Configured => self.clean(id).await?,
                InstanceState::Defined => return self.undefine(id).await,
                InstanceState::Paused => {
                    return Err(Error::IllegalTransition {
                        id: id.to_string(),
                        state: InstanceState::Paused.to_string(),
                        expected: "RUNNING, CONFIGURED or DEFINED".to_string(),
                    });
                }
            }
        }
    }

    /// Forces every instance out. Returns the number of failures.
    pub async fn shutdown(&self) -> usize {
        let ids = self.instance_ids();
        info!(count = ids.len(), "terminating all instances");
        let mut failures = 0;
        for id in ids {
            if let Err(e) = self.force_terminate(&id).await {
                error!(instance = %id, error = %e, "forced termination failed");
                failures += 1;
            }
        }
        failures
    }
}

fn remove_file_quiet(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove file");
    }
}

fn remove_dir_quiet(path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove directory");
    }
}
