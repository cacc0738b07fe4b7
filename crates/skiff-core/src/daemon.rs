//! The instance lifecycle manager.
//!
//! Owns the operative/deleted tables, the preparing set, the allocated-MAC
//! set, the delayed-shutdown timers and the mount handler tables, all behind
//! one process-wide lock. A separate start lock serializes entries into the
//! start state machine so slow hypervisor work never happens under the
//! registry lock. Readiness waits run as shared background futures,
//! deduplicated per instance name.

use crate::config::{DaemonConfig, DEFAULT_TIMEOUT, MOUNTS_KEY, PASSPHRASE_KEY};
use crate::error::{CoreError, Result};
use crate::hypervisor::{GuestSession, VirtualMachine, VmStatusObserver};
use crate::mac::mac_set_of;
use crate::mounts::{ClassicMountHandler, MountHandler, MountRegistry};
use crate::persistence;
use crate::selection::{
    add_error, find_instance_and_react, select_instances, status_for_errors, status_for_selection,
    InstanceGroup, InstanceTrail, SelectionReaction, SelectionReport, REQUIRE_EXISTING,
    REQUIRE_OPERATIVE,
};
use crate::shutdown::DelayedShutdownRegistry;
use crate::spec::{InstanceSpec, InstanceState, MountKind, VmMount};
use crate::validation::{clean_path, invalid_target_path, valid_hostname};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use sha2::{Digest, Sha256};
use skiff_protocol::{
    CreateReply, DeleteRequest, ErrorDetail, GetReply, GetRequest, InfoReply, InfoRequest,
    InstanceDetail, InstanceSnapshotPair, InstanceStatus, KeysReply, ListEntry, ListReply,
    ListRequest, MountPathEntry, MountRequest, NetworkInterfaceEntry, NetworksReply, ReplyTx,
    RestartRequest, RestoreReply, RestoreRequest, SnapshotOverviewEntry, SnapshotReply,
    SnapshotRequest, SshInfo, SshInfoReply, SshInfoRequest, StartErrorCause, StartRequest, Status,
    StatusCode, StopRequest, SuspendRequest, UmountRequest, VersionReply, AuthenticateRequest,
    DeleteReply, PurgeReply, RecoverRequest, SetRequest,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

const REBOOT_CMD: &str = "sudo reboot";
const STOP_SSH_CMD: &str = "sudo systemctl stop ssh";

/// Mutable daemon state, guarded by one mutex.
pub(crate) struct DaemonState {
    /// Durable specs for every known instance, operative or deleted.
    pub(crate) specs: HashMap<String, InstanceSpec>,
    pub(crate) operative: HashMap<String, Arc<dyn VirtualMachine>>,
    pub(crate) deleted: HashMap<String, Arc<dyn VirtualMachine>>,
    /// Names reserved by the creation pipeline before commit.
    pub(crate) preparing: HashSet<String>,
    /// Every MAC referenced by any record, plus tentative reservations.
    pub(crate) allocated_macs: HashSet<String>,
    pub(crate) delayed_shutdowns: DelayedShutdownRegistry,
    pub(crate) mounts: MountRegistry,
}

pub(crate) struct DaemonInner {
    pub(crate) config: DaemonConfig,
    pub(crate) state: Mutex<DaemonState>,
    /// Serializes entries into the start state machine.
    pub(crate) start_lock: tokio::sync::Mutex<()>,
    /// Deduplication map for in-flight readiness waits.
    async_waits: Mutex<HashMap<String, Shared<BoxFuture<'static, String>>>>,
}

/// The control-plane daemon core.
///
/// Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Daemon {
    pub(crate) inner: Arc<DaemonInner>,
}

impl VmStatusObserver for DaemonInner {
    fn persist_state_for(&self, name: &str, state: InstanceState) {
        let mut guard = self.lock_state();
        if let Some(spec) = guard.specs.get_mut(name) {
            spec.state = state;
        }
        self.persist_locked(&guard);
    }

    fn update_metadata_for(&self, name: &str, metadata: serde_json::Value) {
        let mut guard = self.lock_state();
        if let Some(spec) = guard.specs.get_mut(name) {
            spec.metadata = metadata;
        }
        self.persist_locked(&guard);
    }

    fn retrieve_metadata_for(&self, name: &str) -> serde_json::Value {
        self.lock_state()
            .specs
            .get(name)
            .map(|spec| spec.metadata.clone())
            .unwrap_or(serde_json::Value::Null)
    }
}

impl DaemonInner {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, DaemonState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes the registry while already holding the state lock.
    pub(crate) fn persist_locked(&self, state: &DaemonState) {
        if let Err(e) =
            persistence::persist_instance_db(&state.specs, &self.config.backend_data_directory())
        {
            tracing::warn!("Failed to persist instances: {}", e);
        }
    }

    pub(crate) fn persist_instances(&self) {
        let guard = self.lock_state();
        self.persist_locked(&guard);
    }

    pub(crate) fn observer_ref(self: &Arc<Self>) -> Weak<dyn VmStatusObserver> {
        let strong: Arc<dyn VmStatusObserver> = self.clone();
        Arc::downgrade(&strong)
    }

    pub(crate) fn instances_running(&self) -> bool {
        self.lock_state()
            .operative
            .values()
            .any(|vm| vm.current_state().is_running())
    }

    /// Whether mount support is enabled in the settings store.
    pub(crate) fn mounts_enabled(&self) -> bool {
        match self.config.settings.get(MOUNTS_KEY) {
            Ok(value) => value != "false",
            Err(_) => true,
        }
    }

    /// Directory holding an instance's artifacts, resolved via the vault.
    pub(crate) fn instance_directory(&self, name: &str) -> Result<PathBuf> {
        Ok(self.config.vault.image_for(name)?.instance_directory())
    }

    /// Constructs the mount handler for a mount description.
    pub(crate) fn make_mount(
        &self,
        vm: &Arc<dyn VirtualMachine>,
        target: &str,
        mount: &VmMount,
    ) -> Result<Arc<dyn MountHandler>> {
        match mount.kind {
            MountKind::Classic => Ok(Arc::new(ClassicMountHandler::new(
                vm.clone(),
                self.config.session_factory.clone(),
                target,
                mount.clone(),
            ))),
            MountKind::Native => vm.make_native_mount_handler(target, mount),
        }
    }

    /// Installs handlers for every mount in an instance's spec, dropping
    /// mounts whose handler cannot be constructed.
    pub(crate) fn init_mounts(&self, state: &mut DaemonState, name: &str) {
        let Some(vm) = state.operative.get(name).cloned() else {
            return;
        };
        let Some(spec) = state.specs.get(name) else {
            return;
        };

        let mut to_remove = Vec::new();
        for (target, mount) in &spec.mounts {
            if state.mounts.contains(name, target) {
                continue;
            }
            match self.make_mount(&vm, target, mount) {
                Ok(handler) => state.mounts.insert(name, target, handler),
                Err(e) => {
                    tracing::warn!(
                        "Removing mount \"{}\" => \"{}\" from '{}': {}",
                        mount.source_path,
                        target,
                        name,
                        e
                    );
                    to_remove.push(target.clone());
                }
            }
        }

        if !to_remove.is_empty() {
            if let Some(spec) = state.specs.get_mut(name) {
                for target in &to_remove {
                    spec.mounts.remove(target);
                }
            }
            self.persist_locked(state);
        }
    }

    /// Deactivates every mount of an instance that the daemon manages.
    pub(crate) async fn stop_mounts(&self, name: &str) {
        let handlers = self.lock_state().mounts.handlers_for(name);
        for (target, handler) in handlers {
            if handler.is_managed_by_backend() {
                continue;
            }
            if let Err(e) = handler.deactivate(true).await {
                tracing::warn!("Failed to deactivate \"{}\" in '{}': {}", target, name, e);
            }
        }
    }

    /// Releases every resource of an instance: back-end artifacts, the vault
    /// record, its MAC addresses, and the spec itself.
    pub(crate) fn release_resources(&self, name: &str) -> Result<()> {
        self.config.factory.remove_resources_for(name)?;
        self.config.vault.remove(name)?;

        let mut state = self.lock_state();
        if let Some(spec) = state.specs.remove(name) {
            for mac in mac_set_of(&spec) {
                state.allocated_macs.remove(&mac);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Readiness waits
    // =========================================================================

    /// Waits for the guest shell, optionally for first-boot configuration,
    /// then activates unmanaged mounts. Returns an error string, empty on
    /// success.
    async fn wait_ssh_and_start_mounts(
        self: Arc<Self>,
        name: String,
        timeout: Duration,
        launch: bool,
        reply: Option<ReplyTx<CreateReply>>,
    ) -> String {
        let Some(vm) = self.lock_state().operative.get(&name).cloned() else {
            return String::new();
        };

        if let Err(e) = vm.wait_until_ssh_up(timeout).await {
            return e.to_string();
        }

        if launch {
            if let Some(reply) = &reply {
                reply.send(CreateReply {
                    reply_message: "Waiting for initialization to complete".to_string(),
                    ..CreateReply::default()
                });
            }
            if let Err(e) = self.wait_for_first_boot(vm.as_ref(), timeout).await {
                return e.to_string();
            }
        }

        if !self.mounts_enabled() {
            return String::new();
        }

        let mut errors = String::new();
        let mut warnings = String::new();
        let mut invalid_mounts = Vec::new();

        let handlers = self.lock_state().mounts.handlers_for(&name);
        for (target, handler) in handlers {
            if handler.is_managed_by_backend() {
                continue;
            }
            match handler.activate().await {
                Ok(()) => {}
                Err(e @ CoreError::SshfsMissing { .. }) => {
                    add_error(&mut errors, e.to_string());
                    break;
                }
                Err(e) => {
                    let msg = format!("Removing mount \"{}\" from '{}': {}\n", target, name, e);
                    tracing::warn!("{}", msg.trim_end());
                    warnings.push_str(&msg);
                    invalid_mounts.push(target);
                }
            }
        }

        {
            let mut state = self.lock_state();
            for target in &invalid_mounts {
                state.mounts.remove(&name, target);
                if let Some(spec) = state.specs.get_mut(&name) {
                    spec.mounts.remove(target);
                }
            }
            self.persist_locked(&state);
        }

        if !warnings.is_empty() {
            if let Some(reply) = &reply {
                reply.send(CreateReply {
                    log_line: warnings,
                    ..CreateReply::default()
                });
            }
        }

        errors
    }

    /// Waits for the guest's first-boot configuration to finish.
    async fn wait_for_first_boot(
        &self,
        vm: &dyn VirtualMachine,
        timeout: Duration,
    ) -> Result<()> {
        let mut session = self
            .config
            .session_factory
            .open(&vm.ssh_hostname(), vm.ssh_port(), &vm.ssh_username())
            .await?;

        let probe = session.run("which cloud-init").await?;
        if !probe.success() {
            return Err(CoreError::MissingFirstBootAgent(vm.name().to_string()));
        }

        match tokio::time::timeout(timeout, session.run("cloud-init status --wait")).await {
            Ok(Ok(output)) if output.success() => Ok(()),
            Ok(Ok(output)) => Err(CoreError::invalid_argument(format!(
                "initialization failed in instance '{}': {}",
                vm.name(),
                output.stderr.trim()
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CoreError::timeout(format!(
                "timed out waiting for initialization to complete in '{}'",
                vm.name()
            ))),
        }
    }

    /// Awaits readiness of every named instance, deduplicating concurrent
    /// waits per name, and folds the per-instance error strings plus any
    /// accumulated start errors into the final status.
    pub(crate) async fn wait_for_ready_all(
        self: &Arc<Self>,
        names: &[String],
        timeout: Duration,
        launch: bool,
        reply: Option<ReplyTx<CreateReply>>,
        start_errors: String,
    ) -> Status {
        let mut waits = Vec::with_capacity(names.len());
        {
            let mut running = self
                .async_waits
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for name in names {
                let wait = running
                    .entry(name.clone())
                    .or_insert_with(|| {
                        self.clone()
                            .wait_ssh_and_start_mounts(
                                name.clone(),
                                timeout,
                                launch,
                                reply.clone(),
                            )
                            .boxed()
                            .shared()
                    })
                    .clone();
                waits.push(wait);
            }
        }

        let results = futures::future::join_all(waits).await;

        {
            let mut running = self
                .async_waits
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for name in names {
                running.remove(name);
            }
        }

        let mut errors = start_errors;
        for result in results {
            if !result.is_empty() {
                add_error(&mut errors, result);
            }
        }

        let status = status_for_errors(&errors, StatusCode::Ok, StatusCode::FailedPrecondition);
        if !status.is_ok() {
            self.persist_instances();
        }
        status
    }

    /// Readiness watcher attached when reconciliation restarts an instance
    /// that was persisted as running.
    pub(crate) fn on_restart(self: &Arc<Self>, name: &str) {
        let inner = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            inner.stop_mounts(&name).await;
            let status = inner
                .wait_for_ready_all(
                    std::slice::from_ref(&name),
                    DEFAULT_TIMEOUT,
                    false,
                    None,
                    String::new(),
                )
                .await;
            if !status.is_ok() {
                tracing::warn!("Failed readiness wait for '{}': {}", name, status.message);
            }

            let vm = inner.lock_state().operative.get(&name).cloned();
            if let Some(vm) = vm {
                vm.set_state(InstanceState::Running);
                inner.persist_state_for(&name, InstanceState::Running);
            }
        });
    }

    // =========================================================================
    // Shutdown machinery
    // =========================================================================

    /// Stops an instance, either now or after a delay.
    pub(crate) async fn shutdown_vm(
        self: &Arc<Self>,
        vm: Arc<dyn VirtualMachine>,
        delay: Duration,
    ) -> Status {
        let name = vm.name().to_string();
        let state = vm.current_state();

        if matches!(
            state,
            InstanceState::Off | InstanceState::Stopped | InstanceState::Suspended
        ) {
            tracing::debug!("instance \"{}\" does not need stopping", name);
            return Status::ok();
        }

        // Best-effort session for the guest-side shutdown broadcast.
        let session = match self
            .config
            .session_factory
            .open(&vm.ssh_hostname(), vm.ssh_port(), &vm.ssh_username())
            .await
        {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::info!("Cannot open ssh session on \"{}\" shutdown: {}", name, e);
                None
            }
        };

        if !delay.is_zero() {
            if let Some(mut session) = session {
                let minutes = delay.as_secs() / 60;
                let _ = session
                    .run(&format!(
                        "wall 'The system is going down for poweroff in {minutes} minute(s)'"
                    ))
                    .await;
            }
        }

        {
            let inner = self.clone();
            let timer_vm = vm.clone();
            let timer_name = name.clone();
            let mut guard = self.lock_state();
            guard
                .delayed_shutdowns
                .schedule(&name, delay, move |timer_id| async move {
                    inner.execute_shutdown(timer_vm, timer_name, timer_id).await;
                });
        }

        if !delay.is_zero() {
            vm.set_state(InstanceState::DelayedShutdown);
            self.persist_state_for(&name, InstanceState::DelayedShutdown);
        }

        Status::ok()
    }

    async fn execute_shutdown(self: Arc<Self>, vm: Arc<dyn VirtualMachine>, name: String, id: u64) {
        self.stop_mounts(&name).await;
        if let Err(e) = vm.shutdown().await {
            tracing::warn!("Failed to stop '{}': {}", name, e);
        }
        self.lock_state().delayed_shutdowns.unregister(&name, id);
    }

    /// Cancels a pending delayed shutdown, restoring the running state.
    pub(crate) fn cancel_vm_shutdown(&self, vm: &Arc<dyn VirtualMachine>) -> Status {
        let name = vm.name().to_string();
        let cancelled = self.lock_state().delayed_shutdowns.cancel(&name);

        if cancelled {
            if vm.current_state() == InstanceState::DelayedShutdown {
                vm.set_state(InstanceState::Running);
                self.persist_state_for(&name, InstanceState::Running);
            }
        } else {
            tracing::debug!("no delayed shutdown to cancel on instance \"{}\"", name);
        }

        Status::ok()
    }

    /// Reboots a running instance over a fresh guest session.
    pub(crate) async fn reboot_vm(&self, vm: &Arc<dyn VirtualMachine>) -> Status {
        let name = vm.name().to_string();

        if vm.current_state() == InstanceState::DelayedShutdown {
            self.lock_state().delayed_shutdowns.cancel(&name);
        }

        if !vm.current_state().is_running() {
            return Status::new(
                StatusCode::InvalidArgument,
                format!("instance \"{name}\" is not running"),
            );
        }

        tracing::debug!("Rebooting {}", name);

        let mut session = match self
            .config
            .session_factory
            .open(&vm.ssh_hostname(), vm.ssh_port(), &vm.ssh_username())
            .await
        {
            Ok(session) => session,
            Err(e) => return e.to_status(),
        };

        // Stop the listener first so the post-reboot "ssh up" check cannot
        // race against the pre-reboot one.
        let _ = session.run(STOP_SSH_CMD).await;

        match session.run(REBOOT_CMD).await {
            // The session going down without an exit code is the expected
            // outcome of a reboot.
            Ok(output) => match output.exit_code {
                None | Some(0) => Status::ok(),
                Some(code) => Status::new(
                    StatusCode::FailedPrecondition,
                    format!("Reboot command exited with code {code}"),
                ),
            },
            Err(e) => e.to_status(),
        }
    }

    /// Runs one command in a session, failing on a non-zero exit.
    async fn run_in_session(
        &self,
        session: &mut Box<dyn GuestSession>,
        cmd: &str,
    ) -> Result<String> {
        let output = session.run(cmd).await?;
        if !output.success() {
            return Err(CoreError::internal(format!(
                "'{cmd}' failed in the guest: {}",
                output.stderr.trim()
            )));
        }
        Ok(output.stdout.trim().to_string())
    }
}

fn is_ipv4_valid(address: &str) -> bool {
    address.parse::<std::net::Ipv4Addr>().is_ok()
}

fn requested_names(pairs: &[InstanceSnapshotPair]) -> Vec<String> {
    pairs.iter().map(|p| p.instance_name.clone()).collect()
}

/// Maps requested snapshot filters per instance. An empty snapshot name
/// clears the filter (selects everything), and a cleared filter wins over
/// later named snapshots for the same instance.
fn map_snapshots_to_instances(
    pairs: &[InstanceSnapshotPair],
) -> HashMap<String, HashSet<String>> {
    let mut map: HashMap<String, HashSet<String>> = HashMap::new();
    for pair in pairs {
        if pair.snapshot_name.is_empty() {
            map.entry(pair.instance_name.clone()).or_default().clear();
        } else {
            match map.get_mut(&pair.instance_name) {
                Some(filter) if filter.is_empty() => {}
                Some(filter) => {
                    filter.insert(pair.snapshot_name.clone());
                }
                None => {
                    map.entry(pair.instance_name.clone())
                        .or_default()
                        .insert(pair.snapshot_name.clone());
                }
            }
        }
    }
    map
}

impl Daemon {
    /// Loads the persisted registry, reconciles it against the hypervisor,
    /// and starts the background image maintenance task.
    ///
    /// # Errors
    ///
    /// Fails when the persisted registry is unusable (invalid MAC records).
    pub async fn new(config: DaemonConfig) -> Result<Self> {
        let specs = persistence::load_instance_db(
            &config.backend_data_directory(),
            &config.backend_cache_directory(),
        )?;

        let inner = Arc::new(DaemonInner {
            config,
            state: Mutex::new(DaemonState {
                specs,
                operative: HashMap::new(),
                deleted: HashMap::new(),
                preparing: HashSet::new(),
                allocated_macs: HashSet::new(),
                delayed_shutdowns: DelayedShutdownRegistry::default(),
                mounts: MountRegistry::default(),
            }),
            start_lock: tokio::sync::Mutex::new(()),
            async_waits: Mutex::new(HashMap::new()),
        });

        if let Err(e) = inner.config.factory.hypervisor_health_check() {
            tracing::warn!("Hypervisor health check failed: {}", e);
        }

        let daemon = Self { inner };
        daemon.reconcile().await;
        daemon.spawn_image_maintenance();
        Ok(daemon)
    }

    /// Rebuilds the in-memory registries from the persisted specs.
    async fn reconcile(&self) {
        let inner = &self.inner;
        let names: Vec<String> = inner.lock_state().specs.keys().cloned().collect();
        let mut invalid_specs = Vec::new();
        let mut needs_start = Vec::new();

        for name in names {
            if !inner.config.vault.has_record_for(&name) {
                invalid_specs.push(name);
                continue;
            }

            let image = match inner.config.vault.image_for(&name) {
                Ok(image) => image,
                Err(e) => {
                    tracing::warn!("Could not resolve image for '{}': {}", name, e);
                    invalid_specs.push(name);
                    continue;
                }
            };

            if !image.image_path.as_os_str().is_empty() && !image.image_path.exists() {
                tracing::warn!(
                    "Could not find image for '{}'. Expected location: {}",
                    name,
                    image.image_path.display()
                );
                invalid_specs.push(name);
                continue;
            }

            let mut state = inner.lock_state();
            let Some(spec) = state.specs.get(&name).cloned() else {
                continue;
            };

            // Interfaces must not repeat MACs, inside the spec or across
            // already admitted specs.
            let new_macs = mac_set_of(&spec);
            if new_macs.len() <= spec.extra_interfaces.len()
                || !crate::mac::merge_if_disjoint(&mut state.allocated_macs, &new_macs)
            {
                tracing::warn!("{} has repeated MAC addresses", name);
                invalid_specs.push(name);
                continue;
            }

            let desc = crate::create::description_from_spec(&name, &spec, &image);
            let vm = match inner
                .config
                .factory
                .create_virtual_machine(&desc, inner.observer_ref())
            {
                Ok(vm) => vm,
                Err(e) => {
                    tracing::warn!("Could not construct instance '{}': {}", name, e);
                    for mac in mac_set_of(&spec) {
                        state.allocated_macs.remove(&mac);
                    }
                    invalid_specs.push(name);
                    continue;
                }
            };

            if let Err(e) = vm.load_snapshots(&image.instance_directory()) {
                tracing::warn!("Could not load snapshots for '{}': {}", name, e);
            }

            if spec.deleted {
                if spec.state != InstanceState::Stopped {
                    tracing::warn!(
                        "{} is deleted but has incompatible state {}, resetting to stopped",
                        name,
                        spec.state.code()
                    );
                    if let Some(stored) = state.specs.get_mut(&name) {
                        stored.state = InstanceState::Stopped;
                    }
                }
                state.deleted.insert(name.clone(), vm);
                continue;
            }

            state.operative.insert(name.clone(), vm.clone());
            inner.init_mounts(&mut state, &name);

            let persisted_state = state.specs.get(&name).map(|s| s.state);
            drop(state);

            // A spec persisted as running whose fresh handle is not: the
            // instance went down with the daemon, so bring it back.
            if persisted_state == Some(InstanceState::Running)
                && !matches!(
                    vm.current_state(),
                    InstanceState::Running | InstanceState::Starting
                )
            {
                needs_start.push((name, vm));
            }
        }

        {
            let _start_guard = inner.start_lock.lock().await;
            for (name, vm) in needs_start {
                tracing::info!("{} needs starting. Starting now...", name);
                match vm.start().await {
                    Ok(()) => inner.on_restart(&name),
                    Err(e) => tracing::warn!("Failed to start '{}': {}", name, e),
                }
            }
        }

        if !invalid_specs.is_empty() {
            let mut state = inner.lock_state();
            for name in &invalid_specs {
                tracing::warn!("Removing invalid instance: {}", name);
                state.specs.remove(name);
            }
            inner.persist_locked(&state);
        }

        inner.config.vault.prune_expired_images();
    }

    /// Periodic source-image maintenance: prune expired images and refresh
    /// to newly released ones.
    fn spawn_image_maintenance(&self) {
        let inner = self.inner.clone();
        let interval = inner.config.image_refresh_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick

            loop {
                ticker.tick().await;
                inner.config.vault.prune_expired_images();

                let monitor: crate::hypervisor::ProgressMonitor =
                    Box::new(|_kind, percentage| {
                        if percentage % 10 == 0 {
                            tracing::info!("  {}%", percentage);
                        }
                        true
                    });
                if let Err(e) = inner.config.vault.update_images(&monitor).await {
                    tracing::error!("Error updating images: {}", e);
                }
            }
        });
    }

    fn select(
        &self,
        names: &[String],
        no_name_means: InstanceGroup,
        reaction: &SelectionReaction,
    ) -> (SelectionReport, Status) {
        let state = self.inner.lock_state();
        let report = select_instances(&state.operative, &state.deleted, names, no_name_means);
        let status = status_for_selection(&report, reaction);
        (report, status)
    }

    fn operative_vm(&self, name: &str) -> Option<Arc<dyn VirtualMachine>> {
        self.inner.lock_state().operative.get(name).cloned()
    }

    // =========================================================================
    // Listing and inspection
    // =========================================================================

    /// Snapshot of all instances with their observable state.
    pub async fn list(&self, request: ListRequest) -> std::result::Result<ListReply, Status> {
        let (operative, deleted): (Vec<_>, Vec<String>) = {
            let state = self.inner.lock_state();
            (
                state
                    .operative
                    .iter()
                    .map(|(name, vm)| (name.clone(), vm.clone()))
                    .collect(),
                state.deleted.keys().cloned().collect(),
            )
        };

        let mut instances = Vec::with_capacity(operative.len() + deleted.len());
        for (name, vm) in operative {
            let present_state = vm.current_state();

            let current_release = match self.inner.config.vault.image_for(&name) {
                Ok(image) => image.original_release,
                Err(e) => {
                    tracing::warn!("Cannot fetch image information: {}", e);
                    String::new()
                }
            };

            let mut ipv4 = Vec::new();
            if request.request_ipv4 && present_state.is_running() {
                let management_ip = vm.management_ipv4();
                let all = vm.all_ipv4().await;
                if is_ipv4_valid(&management_ip) {
                    ipv4.push(management_ip.clone());
                } else if all.is_empty() {
                    ipv4.push("N/A".to_string());
                }
                for address in all {
                    if address != management_ip {
                        ipv4.push(address);
                    }
                }
            }

            instances.push(ListEntry {
                name,
                status: present_state.into(),
                ipv4,
                current_release,
            });
        }

        for name in deleted {
            instances.push(ListEntry {
                name,
                status: InstanceStatus::Deleted,
                ipv4: Vec::new(),
                current_release: String::new(),
            });
        }

        instances.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(ListReply { instances })
    }

    /// Detailed per-instance report, or the snapshot overview.
    pub async fn info(&self, request: InfoRequest) -> std::result::Result<InfoReply, Status> {
        let names = requested_names(&request.instances_snapshots);
        let (report, status) = self.select(&names, InstanceGroup::All, &REQUIRE_EXISTING);
        if !status.is_ok() {
            return Err(status);
        }

        let snapshot_filters = map_snapshots_to_instances(&request.instances_snapshots);

        let mut reply = InfoReply::default();
        let mut errors = String::new();
        let mut have_mounts = false;
        let mounts_enabled = self.inner.mounts_enabled();

        for (names, deleted) in [(&report.operative, false), (&report.deleted, true)] {
            for name in names {
                let vm = {
                    let state = self.inner.lock_state();
                    let table = if deleted {
                        &state.deleted
                    } else {
                        &state.operative
                    };
                    table.get(name).cloned()
                };
                let Some(vm) = vm else { continue };

                if request.snapshot_overview {
                    self.snapshot_overview_for(
                        name,
                        vm.as_ref(),
                        snapshot_filters.get(name),
                        &mut reply,
                        &mut errors,
                    );
                    continue;
                }

                let spec_has_mounts = self
                    .inner
                    .lock_state()
                    .specs
                    .get(name)
                    .is_some_and(|spec| !spec.mounts.is_empty());
                have_mounts = have_mounts || spec_has_mounts;

                match self
                    .instance_detail_for(name, &vm, deleted, &request, mounts_enabled)
                    .await
                {
                    Ok(detail) => reply.details.push(detail),
                    Err(e) => return Err(e.to_status()),
                }
            }
        }

        if have_mounts && !mounts_enabled {
            tracing::error!("Mounts have been disabled on this installation");
        }

        let status = status_for_errors(&errors, StatusCode::Ok, StatusCode::InvalidArgument);
        if !status.is_ok() {
            return Err(status);
        }
        Ok(reply)
    }

    fn snapshot_overview_for(
        &self,
        name: &str,
        vm: &dyn VirtualMachine,
        filter: Option<&HashSet<String>>,
        reply: &mut InfoReply,
        errors: &mut String,
    ) {
        let mut push = |snapshot: crate::hypervisor::SnapshotInfo| {
            reply.snapshot_overview.push(SnapshotOverviewEntry {
                instance_name: name.to_string(),
                snapshot_name: snapshot.name,
                parent: snapshot.parent,
                comment: snapshot.comment,
            });
        };

        match filter {
            None => {
                for snapshot in vm.view_snapshots() {
                    push(snapshot);
                }
            }
            Some(filter) if filter.is_empty() => {
                for snapshot in vm.view_snapshots() {
                    push(snapshot);
                }
            }
            Some(filter) => {
                for snapshot_name in filter {
                    match vm.get_snapshot(snapshot_name) {
                        Ok(snapshot) => push(snapshot),
                        Err(_) => add_error(
                            errors,
                            format!("snapshot \"{snapshot_name}\" does not exist"),
                        ),
                    }
                }
            }
        }
    }

    async fn instance_detail_for(
        &self,
        name: &str,
        vm: &Arc<dyn VirtualMachine>,
        deleted: bool,
        request: &InfoRequest,
        mounts_enabled: bool,
    ) -> Result<InstanceDetail> {
        let present_state = vm.current_state();

        let mut detail = InstanceDetail {
            name: name.to_string(),
            status: if deleted {
                InstanceStatus::Deleted
            } else {
                present_state.into()
            },
            snapshot_count: vm.snapshot_count(),
            ..InstanceDetail::default()
        };

        match self.inner.config.vault.image_for(name) {
            Ok(image) => {
                detail.image_release = image.original_release;
                detail.image_id = image.id;
            }
            Err(e) => tracing::warn!("Cannot fetch image information: {}", e),
        }

        let spec = self.inner.lock_state().specs.get(name).cloned();
        if let Some(spec) = &spec {
            if mounts_enabled {
                for (target, mount) in &spec.mounts {
                    detail.mounts.push(MountPathEntry {
                        source_path: mount.source_path.clone(),
                        target_path: target.clone(),
                        uid_mappings: mount.uid_mappings.clone(),
                        gid_mappings: mount.gid_mappings.clone(),
                    });
                }
                detail.mounts.sort_by(|a, b| a.target_path.cmp(&b.target_path));
            }
        }

        if !request.no_runtime_information && present_state.is_running() {
            let username = spec
                .as_ref()
                .map_or_else(|| vm.ssh_username(), |s| s.ssh_username.clone());
            let mut session = self
                .inner
                .config
                .session_factory
                .open(&vm.ssh_hostname(), vm.ssh_port(), &username)
                .await?;

            detail.load = self
                .inner
                .run_in_session(&mut session, "cat /proc/loadavg | cut -d ' ' -f1-3")
                .await?;
            detail.memory_usage = self
                .inner
                .run_in_session(&mut session, "free -b | grep 'Mem:' | awk '{printf $3}'")
                .await?;
            detail.memory_total = self
                .inner
                .run_in_session(&mut session, "free -b | grep 'Mem:' | awk '{printf $2}'")
                .await?;
            detail.disk_usage = self
                .inner
                .run_in_session(
                    &mut session,
                    "df -t ext4 -t vfat --total -B1 --output=used | tail -n 1",
                )
                .await?;
            detail.disk_total = self
                .inner
                .run_in_session(
                    &mut session,
                    "df -t ext4 -t vfat --total -B1 --output=size | tail -n 1",
                )
                .await?;
            detail.cpu_count = self.inner.run_in_session(&mut session, "nproc").await?;

            let management_ip = vm.management_ipv4();
            let all = vm.all_ipv4().await;
            if is_ipv4_valid(&management_ip) {
                detail.ipv4.push(management_ip.clone());
            } else if all.is_empty() {
                detail.ipv4.push("N/A".to_string());
            }
            for address in all {
                if address != management_ip {
                    detail.ipv4.push(address);
                }
            }

            let current_release = self
                .inner
                .run_in_session(
                    &mut session,
                    "cat /etc/os-release | grep 'PRETTY_NAME' | cut -d \\\" -f2",
                )
                .await?;
            detail.current_release = if current_release.is_empty() {
                detail.image_release.clone()
            } else {
                current_release
            };
        }

        Ok(detail)
    }

    // =========================================================================
    // Lifecycle transitions
    // =========================================================================

    /// Starts the selected instances and waits for their readiness.
    pub async fn start(&self, request: StartRequest) -> Status {
        let timeout = if request.timeout_secs > 0 {
            Duration::from_secs(request.timeout_secs as u64)
        } else {
            DEFAULT_TIMEOUT
        };

        if !self.inner.instances_running() {
            if let Err(e) = self.inner.config.factory.hypervisor_health_check() {
                return e.to_status();
            }
        }

        // Deleted or missing targets abort the whole batch, with a
        // structured payload enumerating them.
        const START_REACTION: SelectionReaction = SelectionReaction {
            operative: crate::selection::ReactionComponent {
                code: StatusCode::Ok,
                message_template: None,
            },
            deleted: crate::selection::ReactionComponent {
                code: StatusCode::Aborted,
                message_template: None,
            },
            missing: crate::selection::ReactionComponent {
                code: StatusCode::Aborted,
                message_template: None,
            },
        };

        let (report, status) =
            self.select(&request.instance_names, InstanceGroup::Operative, &START_REACTION);
        if !status.is_ok() {
            let mut causes = BTreeMap::new();
            for name in &report.deleted {
                causes.insert(name.clone(), StartErrorCause::InstanceDeleted);
            }
            for name in &report.missing {
                causes.insert(name.clone(), StartErrorCause::DoesNotExist);
            }
            return Status::new(status.code, "instance(s) missing")
                .with_details(ErrorDetail::Start(causes));
        }

        let mut complain_disabled_mounts = !self.inner.mounts_enabled();
        let mut start_errors = String::new();
        let mut starting = Vec::with_capacity(report.operative.len());

        for name in &report.operative {
            let _guard = self.inner.start_lock.lock().await;
            let Some(vm) = self.operative_vm(name) else {
                continue;
            };

            match vm.current_state() {
                InstanceState::Unknown => {
                    let error = format!(
                        "Instance '{name}' is already running, but in an unknown state"
                    );
                    tracing::warn!("{}", error);
                    add_error(&mut start_errors, error);
                    continue;
                }
                InstanceState::Suspending => {
                    add_error(
                        &mut start_errors,
                        format!("Cannot start the instance '{name}' while suspending"),
                    );
                    continue;
                }
                InstanceState::DelayedShutdown => {
                    self.inner.cancel_vm_shutdown(&vm);
                    continue;
                }
                InstanceState::Running => continue,
                InstanceState::Starting | InstanceState::Restarting => {}
                _ => {
                    let has_mounts = self
                        .inner
                        .lock_state()
                        .specs
                        .get(name)
                        .is_some_and(|spec| !spec.mounts.is_empty());
                    if complain_disabled_mounts && has_mounts {
                        complain_disabled_mounts = false;
                        tracing::error!("Mounts have been disabled on this installation");
                    }

                    if let Err(e) = vm.start().await {
                        add_error(&mut start_errors, e.to_string());
                        continue;
                    }
                }
            }

            starting.push(name.clone());
        }

        self.inner
            .wait_for_ready_all(&starting, timeout, false, None, start_errors)
            .await
    }

    /// Schedules or cancels shutdowns for the selected instances.
    pub async fn stop(&self, request: StopRequest) -> Status {
        let (report, status) = self.select(
            &request.instance_names,
            InstanceGroup::Operative,
            &REQUIRE_OPERATIVE,
        );
        if !status.is_ok() {
            return status;
        }

        for name in &report.operative {
            let Some(vm) = self.operative_vm(name) else {
                continue;
            };
            let status = if request.cancel_shutdown {
                self.inner.cancel_vm_shutdown(&vm)
            } else {
                let delay = Duration::from_secs(60 * u64::try_from(request.time_minutes).unwrap_or(0));
                self.inner.shutdown_vm(vm, delay).await
            };
            if !status.is_ok() {
                return status;
            }
        }

        Status::ok()
    }

    /// Reboots the selected running instances and waits for readiness.
    pub async fn restart(&self, request: RestartRequest) -> Status {
        let timeout = if request.timeout_secs > 0 {
            Duration::from_secs(request.timeout_secs as u64)
        } else {
            DEFAULT_TIMEOUT
        };

        let (report, status) = self.select(
            &request.instance_names,
            InstanceGroup::Operative,
            &REQUIRE_OPERATIVE,
        );
        if !status.is_ok() {
            return status;
        }

        for name in &report.operative {
            let Some(vm) = self.operative_vm(name) else {
                continue;
            };
            self.inner.stop_mounts(name).await;
            let status = self.inner.reboot_vm(&vm).await;
            if !status.is_ok() {
                return status;
            }
        }

        self.inner
            .wait_for_ready_all(&report.operative, timeout, false, None, String::new())
            .await
    }

    /// Suspends the selected instances, deactivating their mounts first.
    pub async fn suspend(&self, request: SuspendRequest) -> Status {
        let (report, status) = self.select(
            &request.instance_names,
            InstanceGroup::Operative,
            &REQUIRE_OPERATIVE,
        );
        if !status.is_ok() {
            return status;
        }

        for name in &report.operative {
            let Some(vm) = self.operative_vm(name) else {
                continue;
            };
            self.inner.stop_mounts(name).await;
            if let Err(e) = vm.suspend().await {
                return e.to_status();
            }
        }

        Status::ok()
    }

    /// Moves deleted instances back to the operative table.
    pub async fn recover(&self, request: RecoverRequest) -> Status {
        let mut reaction = REQUIRE_EXISTING;
        reaction.operative.message_template =
            Some("instance \"{}\" does not need to be recovered");

        let (report, status) =
            self.select(&request.instance_names, InstanceGroup::Deleted, &reaction);
        if !status.is_ok() {
            return status;
        }

        {
            let mut state = self.inner.lock_state();
            for name in &report.deleted {
                let Some(vm) = state.deleted.remove(name) else {
                    continue;
                };
                if let Some(spec) = state.specs.get_mut(name) {
                    debug_assert!(spec.deleted);
                    spec.deleted = false;
                }
                state.operative.insert(name.clone(), vm);
                self.inner.init_mounts(&mut state, name);
            }
            self.inner.persist_locked(&state);
        }

        Status::ok()
    }

    /// Shuts down and deletes the selected instances; with purge, releases
    /// their resources immediately.
    ///
    /// Snapshot filters in the request are ignored: delete currently removes
    /// the whole instance along with all of its snapshots.
    pub async fn delete(
        &self,
        request: DeleteRequest,
    ) -> std::result::Result<DeleteReply, Status> {
        let names = requested_names(&request.instances_snapshots);
        let (report, status) = self.select(&names, InstanceGroup::All, &REQUIRE_EXISTING);
        if !status.is_ok() {
            return Err(status);
        }

        let mut reply = DeleteReply::default();

        for name in &report.operative {
            let Some(vm) = self.operative_vm(name) else {
                continue;
            };

            {
                let mut state = self.inner.lock_state();
                state.delayed_shutdowns.cancel(name);
                state.mounts.clear_instance(name);
            }

            if let Err(e) = vm.shutdown().await {
                tracing::warn!("Failed to stop '{}' on delete: {}", name, e);
            }

            if request.purge {
                if let Err(e) = self.inner.release_resources(name) {
                    return Err(e.to_status());
                }
                self.inner.lock_state().operative.remove(name);
                reply.purged_instances.push(name.clone());
            } else {
                let mut state = self.inner.lock_state();
                if let Some(vm) = state.operative.remove(name) {
                    state.deleted.insert(name.clone(), vm);
                }
                if let Some(spec) = state.specs.get_mut(name) {
                    spec.deleted = true;
                    spec.state = InstanceState::Stopped;
                }
            }
        }

        if request.purge {
            for name in &report.deleted {
                if let Err(e) = self.inner.release_resources(name) {
                    return Err(e.to_status());
                }
                self.inner.lock_state().deleted.remove(name);
                reply.purged_instances.push(name.clone());
            }
        }

        self.inner.persist_instances();
        Ok(reply)
    }

    /// Releases resources of every deleted instance.
    pub async fn purge(&self) -> std::result::Result<PurgeReply, Status> {
        let names: Vec<String> = self.inner.lock_state().deleted.keys().cloned().collect();

        let mut reply = PurgeReply::default();
        for name in names {
            if let Err(e) = self.inner.release_resources(&name) {
                return Err(e.to_status());
            }
            reply.purged_instances.push(name);
        }

        {
            let mut state = self.inner.lock_state();
            state.deleted.clear();
            self.inner.persist_locked(&state);
        }

        Ok(reply)
    }

    // =========================================================================
    // Mounts
    // =========================================================================

    /// Adds mounts to instances, activating them when reachable.
    pub async fn mount(&self, request: MountRequest) -> Status {
        if !self.inner.mounts_enabled() {
            return Status::new(
                StatusCode::FailedPrecondition,
                "Mounts are disabled on this installation.\n\n\
                 Set local.privileged-mounts to true to enable them.",
            );
        }

        let mut errors = String::new();

        for entry in &request.target_paths {
            let name = &entry.instance_name;
            let target = clean_path(&entry.target_path);

            let Some(vm) = self.operative_vm(name) else {
                add_error(&mut errors, format!("instance '{name}' does not exist"));
                continue;
            };

            if invalid_target_path(&target) {
                add_error(&mut errors, format!("unable to mount to \"{target}\""));
                continue;
            }

            if self.inner.lock_state().mounts.contains(name, &target) {
                add_error(
                    &mut errors,
                    format!("\"{target}\" is already mounted in '{name}'"),
                );
                continue;
            }

            let mount = VmMount::new(
                request.source_path.clone(),
                &request.uid_mappings,
                &request.gid_mappings,
                request.mount_type.into(),
            );

            let handler = match self.inner.make_mount(&vm, &target, &mount) {
                Ok(handler) => handler,
                Err(e) => {
                    add_error(&mut errors, format!("error mounting \"{target}\": {e}"));
                    continue;
                }
            };

            if vm.current_state() == InstanceState::Running || handler.is_managed_by_backend() {
                match handler.activate().await {
                    Ok(()) => {}
                    Err(e @ CoreError::SshfsMissing { .. }) => return e.to_status(),
                    Err(e) => {
                        add_error(&mut errors, format!("error mounting \"{target}\": {e}"));
                        continue;
                    }
                }
            }

            let mut state = self.inner.lock_state();
            state.mounts.insert(name, &target, handler);
            if let Some(spec) = state.specs.get_mut(name) {
                spec.mounts.insert(target.clone(), mount);
            }
        }

        self.inner.persist_instances();
        status_for_errors(&errors, StatusCode::Ok, StatusCode::InvalidArgument)
    }

    /// Removes mounts from instances, deactivating them first.
    pub async fn umount(&self, request: UmountRequest) -> Status {
        let mut errors = String::new();

        for entry in &request.target_paths {
            let name = &entry.instance_name;
            let target = clean_path(&entry.target_path);

            if self.operative_vm(name).is_none() {
                add_error(&mut errors, format!("instance '{name}' does not exist"));
                continue;
            }

            // An empty target path unmounts everything in the instance.
            let targets = if entry.target_path.is_empty() {
                self.inner.lock_state().mounts.targets_for(name)
            } else if self.inner.lock_state().mounts.contains(name, &target) {
                vec![target.clone()]
            } else {
                add_error(
                    &mut errors,
                    format!("path \"{target}\" is not mounted in '{name}'"),
                );
                continue;
            };

            for target in targets {
                let Some(handler) = self.inner.lock_state().mounts.get(name, &target) else {
                    continue;
                };
                match handler.deactivate(false).await {
                    Ok(()) => {
                        let mut state = self.inner.lock_state();
                        state.mounts.remove(name, &target);
                        if let Some(spec) = state.specs.get_mut(name) {
                            spec.mounts.remove(&target);
                        }
                    }
                    Err(e) => {
                        add_error(
                            &mut errors,
                            format!("failed to unmount \"{target}\" from '{name}': {e}"),
                        );
                    }
                }
            }
        }

        self.inner.persist_instances();
        status_for_errors(&errors, StatusCode::Ok, StatusCode::InvalidArgument)
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Takes a snapshot of a stopped instance.
    pub async fn snapshot(
        &self,
        request: SnapshotRequest,
    ) -> std::result::Result<SnapshotReply, Status> {
        let (trail, status) = {
            let state = self.inner.lock_state();
            find_instance_and_react(
                &state.operative,
                &state.deleted,
                &request.instance,
                &REQUIRE_OPERATIVE,
            )
        };
        if !status.is_ok() {
            return Err(status);
        }
        debug_assert!(matches!(trail, InstanceTrail::Operative(_)));

        let vm = self
            .operative_vm(&request.instance)
            .ok_or_else(|| Status::new(StatusCode::NotFound, "instance vanished"))?;

        if !matches!(
            vm.current_state(),
            InstanceState::Off | InstanceState::Stopped
        ) {
            return Err(Status::new(
                StatusCode::InvalidArgument,
                "Instances must be stopped before taking a snapshot.",
            ));
        }

        if !request.snapshot.is_empty() && !valid_hostname(&request.snapshot) {
            return Err(Status::new(
                StatusCode::InvalidArgument,
                format!("Invalid snapshot name: \"{}\".", request.snapshot),
            ));
        }

        let instance_dir = self
            .inner
            .instance_directory(&request.instance)
            .map_err(|e| e.to_status_internal())?;
        let spec = self
            .inner
            .lock_state()
            .specs
            .get(&request.instance)
            .cloned()
            .ok_or_else(|| Status::new(StatusCode::Internal, "missing instance specs"))?;

        let snapshot = vm
            .take_snapshot(&instance_dir, &spec, &request.snapshot, &request.comment)
            .await
            .map_err(|e| e.to_status_internal())?;

        Ok(SnapshotReply {
            snapshot: snapshot.name,
        })
    }

    /// Restores a snapshot of a stopped instance, taking an automatic
    /// snapshot first unless the request is destructive.
    pub async fn restore(
        &self,
        request: RestoreRequest,
        reply: &ReplyTx<RestoreReply>,
    ) -> Status {
        let (_, status) = {
            let state = self.inner.lock_state();
            find_instance_and_react(
                &state.operative,
                &state.deleted,
                &request.instance,
                &REQUIRE_OPERATIVE,
            )
        };
        if !status.is_ok() {
            return status;
        }

        let Some(vm) = self.operative_vm(&request.instance) else {
            return Status::new(StatusCode::NotFound, "instance vanished");
        };

        if !matches!(
            vm.current_state(),
            InstanceState::Off | InstanceState::Stopped
        ) {
            return Status::new(
                StatusCode::InvalidArgument,
                "Instances must be stopped before restoring a snapshot.",
            );
        }

        let instance_dir = match self.inner.instance_directory(&request.instance) {
            Ok(dir) => dir,
            Err(e) => return e.to_status_internal(),
        };

        let mut spec = match self.inner.lock_state().specs.get(&request.instance).cloned() {
            Some(spec) => spec,
            None => return Status::new(StatusCode::Internal, "missing instance specs"),
        };

        if !request.destructive {
            reply.send(RestoreReply {
                reply_message: format!("Taking snapshot before restoring {}", request.instance),
            });

            let snapshot = match vm
                .take_snapshot(
                    &instance_dir,
                    &spec,
                    "",
                    &format!("Before restoring {}", request.snapshot),
                )
                .await
            {
                Ok(snapshot) => snapshot,
                Err(e) => return e.to_status_internal(),
            };

            reply.send(RestoreReply {
                reply_message: format!(
                    "Snapshot taken: {}.{}\n",
                    request.instance, snapshot.name
                ),
            });
        }

        reply.send(RestoreReply {
            reply_message: "Restoring snapshot".to_string(),
        });

        if let Err(e) = vm
            .restore_snapshot(&instance_dir, &request.snapshot, &mut spec)
            .await
        {
            return e.to_status_internal();
        }

        {
            let mut state = self.inner.lock_state();
            state.specs.insert(request.instance.clone(), spec);
            self.inner.persist_locked(&state);
        }

        Status::ok()
    }

    // =========================================================================
    // SSH info
    // =========================================================================

    /// Connection endpoints and key material for running instances.
    pub async fn ssh_info(
        &self,
        request: SshInfoRequest,
    ) -> std::result::Result<SshInfoReply, Status> {
        let (report, status) = self.select(
            &request.instance_names,
            InstanceGroup::None,
            &REQUIRE_OPERATIVE,
        );
        if !status.is_ok() {
            return Err(status);
        }

        let mut reply = SshInfoReply::default();

        for name in &report.operative {
            let Some(vm) = self.operative_vm(name) else {
                continue;
            };

            if vm.current_state() == InstanceState::Unknown {
                return Err(Status::new(
                    StatusCode::FailedPrecondition,
                    "Cannot retrieve credentials in unknown state",
                ));
            }

            if !vm.current_state().is_running() {
                return Err(Status::new(
                    StatusCode::Aborted,
                    format!("instance \"{name}\" is not running"),
                ));
            }

            if vm.current_state() == InstanceState::DelayedShutdown {
                let remaining = self.inner.lock_state().delayed_shutdowns.time_remaining(name);
                if remaining.is_some_and(|left| left <= Duration::from_secs(60)) {
                    return Err(Status::new(
                        StatusCode::FailedPrecondition,
                        format!(
                            "\"{name}\" is scheduled to shut down in less than a minute, use \
                             'stop --cancel {name}' to cancel the shutdown."
                        ),
                    ));
                }
            }

            let username = self
                .inner
                .lock_state()
                .specs
                .get(name)
                .map_or_else(|| vm.ssh_username(), |spec| spec.ssh_username.clone());

            reply.ssh_info.insert(
                name.clone(),
                SshInfo {
                    host: vm.ssh_hostname(),
                    port: vm.ssh_port(),
                    username,
                    priv_key_base64: self.inner.config.ssh_key_provider.private_key_as_base64(),
                },
            );
        }

        Ok(reply)
    }

    // =========================================================================
    // Settings and authentication
    // =========================================================================

    /// Reads one settings key.
    pub fn get(&self, request: GetRequest) -> std::result::Result<GetReply, Status> {
        match self.inner.config.settings.get(&request.key) {
            Ok(value) => {
                tracing::debug!("Returning setting {}={}", request.key, value);
                Ok(GetReply { value })
            }
            Err(e) => Err(e.to_status_internal()),
        }
    }

    /// Writes one settings key.
    pub fn set(&self, request: SetRequest) -> Status {
        tracing::trace!("Trying to set {}={}", request.key, request.val);
        match self.inner.config.settings.set(&request.key, &request.val) {
            Ok(()) => {
                tracing::debug!("Succeeded setting {}={}", request.key, request.val);
                Status::ok()
            }
            Err(e) => e.to_status_internal(),
        }
    }

    /// Lists the recognized settings keys.
    pub fn keys(&self) -> KeysReply {
        let settings_keys = self.inner.config.settings.keys();
        tracing::debug!("Returning {} settings keys", settings_keys.len());
        KeysReply { settings_keys }
    }

    /// Verifies a client passphrase against the stored hash.
    pub fn authenticate(&self, request: AuthenticateRequest) -> Status {
        let stored_hash = match self.inner.config.settings.get(PASSPHRASE_KEY) {
            Ok(hash) => hash,
            Err(e) => return e.to_status_internal(),
        };

        if stored_hash.is_empty() {
            return Status::new(
                StatusCode::FailedPrecondition,
                "Passphrase is not set. Set local.passphrase with a trusted client first.",
            );
        }

        let hashed = format!("{:x}", Sha256::digest(request.passphrase.as_bytes()));
        if stored_hash != hashed {
            return Status::new(
                StatusCode::InvalidArgument,
                "Passphrase is not correct. Please try again.",
            );
        }

        Status::ok()
    }

    // =========================================================================
    // Miscellaneous
    // =========================================================================

    /// The daemon's version string.
    pub fn version(&self) -> VersionReply {
        VersionReply {
            version: crate::config::version_string().to_string(),
        }
    }

    /// Host networks available for extra interfaces.
    pub fn networks(&self) -> std::result::Result<NetworksReply, Status> {
        if !self.inner.instances_running() {
            if let Err(e) = self.inner.config.factory.hypervisor_health_check() {
                return Err(e.to_status());
            }
        }

        let interfaces = self
            .inner
            .config
            .factory
            .networks()
            .map_err(|e| e.to_status())?;

        Ok(NetworksReply {
            interfaces: interfaces
                .into_iter()
                .map(|iface| NetworkInterfaceEntry {
                    name: iface.id,
                    kind: iface.kind,
                    description: iface.description,
                })
                .collect(),
        })
    }
}
