//! In-process development back-end.
//!
//! Tracks instance state without booting anything, so the control plane can
//! be exercised end to end on hosts without a hypervisor. Platform drivers
//! plug in through the same traits.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use skiff_core::config::CLOUD_INIT_ISO_NAME;
use skiff_core::error::{CoreError, Result};
use skiff_core::hypervisor::{
    CommandOutput, GuestSession, GuestSessionFactory, ImageVault, NetworkInterfaceInfo,
    ProgressMonitor, Query, QueryType, SnapshotInfo, SshKeyProvider, VirtualMachine,
    VirtualMachineDescription, VmFactory, VmImage, VmStatusObserver,
};
use skiff_core::mounts::MountHandler;
use skiff_core::spec::{InstanceSpec, InstanceState, MemorySize, NetworkInterface, VmMount};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// Virtual machine
// =============================================================================

struct DevVm {
    name: String,
    vm_id: Uuid,
    ssh_username: String,
    state: Mutex<InstanceState>,
    observer: Weak<dyn VmStatusObserver>,
    snapshots: Mutex<Vec<SnapshotInfo>>,
    auto_snapshot_counter: AtomicUsize,
}

impl DevVm {
    fn transition(&self, state: InstanceState) {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = state;
        if let Some(observer) = self.observer.upgrade() {
            observer.persist_state_for(&self.name, state);
        }
    }
}

#[async_trait]
impl VirtualMachine for DevVm {
    fn name(&self) -> &str {
        &self.name
    }

    fn current_state(&self) -> InstanceState {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_state(&self, state: InstanceState) {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = state;
    }

    async fn start(&self) -> Result<()> {
        tracing::info!(vm_id = %self.vm_id, "Starting instance '{}'", self.name);
        self.transition(InstanceState::Running);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        tracing::info!(vm_id = %self.vm_id, "Stopping instance '{}'", self.name);
        self.transition(InstanceState::Stopped);
        Ok(())
    }

    async fn suspend(&self) -> Result<()> {
        tracing::info!(vm_id = %self.vm_id, "Suspending instance '{}'", self.name);
        self.transition(InstanceState::Suspended);
        Ok(())
    }

    fn ssh_hostname(&self) -> String {
        "127.0.0.1".to_string()
    }

    fn ssh_port(&self) -> u16 {
        22
    }

    fn ssh_username(&self) -> String {
        self.ssh_username.clone()
    }

    fn management_ipv4(&self) -> String {
        "127.0.0.1".to_string()
    }

    async fn all_ipv4(&self) -> Vec<String> {
        vec!["127.0.0.1".to_string()]
    }

    async fn wait_until_ssh_up(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn load_snapshots(&self, _instance_dir: &Path) -> Result<()> {
        Ok(())
    }

    fn view_snapshots(&self) -> Vec<SnapshotInfo> {
        self.snapshots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn get_snapshot(&self, name: &str) -> Result<SnapshotInfo> {
        self.view_snapshots()
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| CoreError::not_found(format!("snapshot \"{name}\"")))
    }

    fn snapshot_count(&self) -> usize {
        self.view_snapshots().len()
    }

    async fn take_snapshot(
        &self,
        _instance_dir: &Path,
        _spec: &InstanceSpec,
        name: &str,
        comment: &str,
    ) -> Result<SnapshotInfo> {
        let assigned = if name.is_empty() {
            let n = self.auto_snapshot_counter.fetch_add(1, Ordering::SeqCst) + 1;
            format!("snapshot{n}")
        } else {
            name.to_string()
        };

        let mut snapshots = self
            .snapshots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if snapshots.iter().any(|s| s.name == assigned) {
            return Err(CoreError::SnapshotNameTaken(assigned));
        }

        let info = SnapshotInfo {
            name: assigned,
            parent: snapshots.last().map(|s| s.name.clone()).unwrap_or_default(),
            comment: comment.to_string(),
            created: Some(Utc::now()),
        };
        snapshots.push(info.clone());
        Ok(info)
    }

    async fn restore_snapshot(
        &self,
        _instance_dir: &Path,
        name: &str,
        _spec: &mut InstanceSpec,
    ) -> Result<()> {
        self.get_snapshot(name).map(|_| ())
    }

    fn make_native_mount_handler(
        &self,
        _target: &str,
        _mount: &VmMount,
    ) -> Result<Arc<dyn MountHandler>> {
        Err(CoreError::Unsupported("native mounts".to_string()))
    }
}

// =============================================================================
// Factory
// =============================================================================

/// The development hypervisor back-end.
#[derive(Default)]
pub struct DevFactory;

#[async_trait]
impl VmFactory for DevFactory {
    fn create_virtual_machine(
        &self,
        desc: &VirtualMachineDescription,
        observer: Weak<dyn VmStatusObserver>,
    ) -> Result<Arc<dyn VirtualMachine>> {
        Ok(Arc::new(DevVm {
            name: desc.name.clone(),
            vm_id: Uuid::new_v4(),
            ssh_username: desc.ssh_username.clone(),
            state: Mutex::new(InstanceState::Off),
            observer,
            snapshots: Mutex::new(Vec::new()),
            auto_snapshot_counter: AtomicUsize::new(0),
        }))
    }

    fn networks(&self) -> Result<Vec<NetworkInterfaceInfo>> {
        Err(CoreError::Unsupported("bridging".to_string()))
    }

    fn prepare_networking(&self, _extra_interfaces: &mut [NetworkInterface]) -> Result<()> {
        Ok(())
    }

    fn configure(&self, _desc: &mut VirtualMachineDescription) -> Result<()> {
        Ok(())
    }

    async fn prepare_instance_image(
        &self,
        image: &VmImage,
        desc: &VirtualMachineDescription,
    ) -> Result<()> {
        // The seed "image" is the concatenated cloud-init documents; enough
        // to inspect what a real driver would burn into the ISO.
        let dir = image.instance_directory();
        tokio::fs::create_dir_all(&dir).await?;

        let mut seed = String::new();
        for (label, document) in [
            ("meta-data", &desc.meta_data),
            ("vendor-data", &desc.vendor_data),
            ("user-data", &desc.user_data),
            ("network-config", &desc.network_data),
        ] {
            seed.push_str(&format!("# {label}\n"));
            if !document.is_null() {
                seed.push_str(&serde_yaml::to_string(document).map_err(|e| {
                    CoreError::internal(format!("failed to render {label}: {e}"))
                })?);
            }
            seed.push_str("---\n");
        }

        tokio::fs::write(dir.join(CLOUD_INIT_ISO_NAME), seed).await?;
        Ok(())
    }

    fn remove_resources_for(&self, name: &str) -> Result<()> {
        tracing::debug!("Releasing back-end resources for '{}'", name);
        Ok(())
    }

    fn hypervisor_health_check(&self) -> Result<()> {
        Ok(())
    }

    fn backend_directory_name(&self) -> String {
        "dev".to_string()
    }

    fn backend_version_string(&self) -> String {
        format!("dev-{}", env!("CARGO_PKG_VERSION"))
    }
}

// =============================================================================
// Image vault
// =============================================================================

/// A vault that fabricates local image files instead of downloading.
pub struct DevVault {
    root: PathBuf,
    index_path: PathBuf,
    records: Mutex<HashMap<String, PathBuf>>,
}

impl DevVault {
    /// Opens the vault under `root`, loading the persisted index.
    pub fn open(root: &Path) -> Self {
        let index_path = root.join("vault-index.json");
        let records = std::fs::read_to_string(&index_path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();

        Self {
            root: root.to_path_buf(),
            index_path,
            records: Mutex::new(records),
        }
    }

    fn save_index(&self, records: &HashMap<String, PathBuf>) -> Result<()> {
        if let Some(parent) = self.index_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(records)
            .map_err(|e| CoreError::internal(format!("failed to serialize vault index: {e}")))?;
        std::fs::write(&self.index_path, content)?;
        Ok(())
    }

    fn image_record(&self, name: &str, image_path: &Path) -> VmImage {
        VmImage {
            id: format!("dev-{name}"),
            image_path: image_path.to_path_buf(),
            original_release: "devsim".to_string(),
        }
    }
}

#[async_trait]
impl ImageVault for DevVault {
    async fn fetch_image(
        &self,
        query: &Query,
        monitor: &ProgressMonitor,
        _checksum: Option<&str>,
    ) -> Result<VmImage> {
        let dir = self.root.join("instances").join(&query.name);
        std::fs::create_dir_all(&dir)?;
        let image_path = dir.join(format!("{}.img", query.name));

        match query.query_type {
            QueryType::LocalFile => {
                let source = query.release.trim_start_matches("file://");
                std::fs::copy(source, &image_path)?;
            }
            QueryType::HttpDownload => {
                return Err(CoreError::Unsupported("image download".to_string()));
            }
            QueryType::Alias => {
                std::fs::write(&image_path, query.release.as_bytes())?;
            }
        }
        monitor(0, 100);

        let mut records = self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        records.insert(query.name.clone(), image_path.clone());
        self.save_index(&records)?;

        Ok(self.image_record(&query.name, &image_path))
    }

    fn image_for(&self, name: &str) -> Result<VmImage> {
        let records = self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let path = records
            .get(name)
            .ok_or_else(|| CoreError::not_found(name.to_string()))?;
        Ok(self.image_record(name, path))
    }

    fn has_record_for(&self, name: &str) -> bool {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(name)
    }

    fn remove(&self, name: &str) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(path) = records.remove(name) {
            if let Some(dir) = path.parent() {
                let _ = std::fs::remove_dir_all(dir);
            }
            self.save_index(&records)?;
        }
        Ok(())
    }

    fn prune_expired_images(&self) {}

    async fn update_images(&self, _monitor: &ProgressMonitor) -> Result<()> {
        Ok(())
    }

    fn minimum_image_size_for(&self, _id: &str) -> Result<MemorySize> {
        "512M".parse()
    }
}

// =============================================================================
// Blueprints, sessions, keys
// =============================================================================

/// A provider with no blueprints: every image resolves as a raw reference.
#[derive(Default)]
pub struct NoBlueprints;

#[async_trait]
impl skiff_core::hypervisor::BlueprintProvider for NoBlueprints {
    fn name_from_blueprint(&self, _image: &str) -> Option<String> {
        None
    }

    async fn fetch_blueprint_for(
        &self,
        _name: &str,
        _desc: &mut VirtualMachineDescription,
        _launch_data: &mut skiff_core::hypervisor::ClientLaunchData,
    ) -> Result<Option<Query>> {
        Ok(None)
    }

    async fn blueprint_from_file(
        &self,
        path: &str,
        _name: &str,
        _desc: &mut VirtualMachineDescription,
        _launch_data: &mut skiff_core::hypervisor::ClientLaunchData,
    ) -> Result<Query> {
        Err(CoreError::invalid_argument(format!(
            "no blueprint found at {path}"
        )))
    }

    fn blueprint_timeout(&self, _name: &str) -> i32 {
        0
    }
}

struct DevSession;

#[async_trait]
impl GuestSession for DevSession {
    async fn run(&mut self, cmd: &str) -> Result<CommandOutput> {
        tracing::trace!("dev session pretending to run: {}", cmd);
        Ok(CommandOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

/// Session factory whose sessions accept every command.
#[derive(Default)]
pub struct DevSessions;

#[async_trait]
impl GuestSessionFactory for DevSessions {
    async fn open(
        &self,
        _host: &str,
        _port: u16,
        _username: &str,
    ) -> Result<Box<dyn GuestSession>> {
        Ok(Box::new(DevSession))
    }
}

/// Ephemeral key material, regenerated at every daemon start.
pub struct DevKeys {
    public_key: String,
    private_key: String,
}

impl DevKeys {
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut public = [0u8; 32];
        let mut private = [0u8; 64];
        rng.fill_bytes(&mut public);
        rng.fill_bytes(&mut private);
        Self {
            public_key: BASE64.encode(public),
            private_key: BASE64.encode(private),
        }
    }
}

impl SshKeyProvider for DevKeys {
    fn public_key_as_base64(&self) -> String {
        self.public_key.clone()
    }

    fn private_key_as_base64(&self) -> String {
        self.private_key.clone()
    }
}
