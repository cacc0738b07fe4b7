//! Mock collaborators for daemon tests.

use crate::config::DaemonConfig;
use crate::error::{CoreError, Result};
use crate::hypervisor::{
    BlueprintProvider, ClientLaunchData, CommandOutput, GuestSession, GuestSessionFactory,
    ImageVault, NameGenerator, NetworkInterfaceInfo, ProgressMonitor, Query, SettingsStore,
    SnapshotInfo, SshKeyProvider, VirtualMachine, VirtualMachineDescription, VmFactory, VmImage,
    VmStatusObserver,
};
use crate::mounts::MountHandler;
use crate::spec::{InstanceSpec, InstanceState, MemorySize, VmMount};
use async_trait::async_trait;
use skiff_protocol::CreateRequest;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tempfile::TempDir;

// =============================================================================
// Virtual machine and factory
// =============================================================================

pub(crate) struct MockVm {
    name: String,
    state: Mutex<InstanceState>,
    observer: Mutex<Weak<dyn VmStatusObserver>>,
    snapshots: Mutex<Vec<SnapshotInfo>>,
    auto_snapshot_counter: AtomicUsize,
    pub fail_start: AtomicBool,
    pub fail_ssh_wait: AtomicBool,
}

impl MockVm {
    fn new(name: &str, observer: Weak<dyn VmStatusObserver>) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(InstanceState::Off),
            observer: Mutex::new(observer),
            snapshots: Mutex::new(Vec::new()),
            auto_snapshot_counter: AtomicUsize::new(0),
            fail_start: AtomicBool::new(false),
            fail_ssh_wait: AtomicBool::new(false),
        }
    }

    pub fn force_state(&self, state: InstanceState) {
        *self.state.lock().unwrap() = state;
    }

    fn transition(&self, state: InstanceState) {
        *self.state.lock().unwrap() = state;
        if let Some(observer) = self.observer.lock().unwrap().upgrade() {
            observer.persist_state_for(&self.name, state);
        }
    }
}

#[async_trait]
impl VirtualMachine for MockVm {
    fn name(&self) -> &str {
        &self.name
    }

    fn current_state(&self) -> InstanceState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: InstanceState) {
        *self.state.lock().unwrap() = state;
    }

    async fn start(&self) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(CoreError::Start {
                name: self.name.clone(),
                message: format!("failed to boot '{}'", self.name),
            });
        }
        self.transition(InstanceState::Running);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.transition(InstanceState::Stopped);
        Ok(())
    }

    async fn suspend(&self) -> Result<()> {
        self.transition(InstanceState::Suspended);
        Ok(())
    }

    fn ssh_hostname(&self) -> String {
        "10.11.12.13".to_string()
    }

    fn ssh_port(&self) -> u16 {
        22
    }

    fn ssh_username(&self) -> String {
        "ubuntu".to_string()
    }

    fn management_ipv4(&self) -> String {
        "10.11.12.13".to_string()
    }

    async fn all_ipv4(&self) -> Vec<String> {
        vec!["10.11.12.13".to_string()]
    }

    async fn wait_until_ssh_up(&self, _timeout: Duration) -> Result<()> {
        if self.fail_ssh_wait.load(Ordering::SeqCst) {
            return Err(CoreError::timeout(format!(
                "timed out waiting for ssh in '{}'",
                self.name
            )));
        }
        Ok(())
    }

    fn load_snapshots(&self, _instance_dir: &Path) -> Result<()> {
        Ok(())
    }

    fn view_snapshots(&self) -> Vec<SnapshotInfo> {
        self.snapshots.lock().unwrap().clone()
    }

    fn get_snapshot(&self, name: &str) -> Result<SnapshotInfo> {
        self.snapshots
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| CoreError::not_found(name.to_string()))
    }

    fn snapshot_count(&self) -> usize {
        self.snapshots.lock().unwrap().len()
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

        let mut snapshots = self.snapshots.lock().unwrap();
        if snapshots.iter().any(|s| s.name == assigned) {
            return Err(CoreError::SnapshotNameTaken(assigned));
        }
        let info = SnapshotInfo {
            name: assigned,
            parent: snapshots.last().map(|s| s.name.clone()).unwrap_or_default(),
            comment: comment.to_string(),
            created: None,
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
        Ok(Arc::new(BackendMountHandler))
    }
}

/// Mount handler activated by the (pretend) back-end.
pub(crate) struct BackendMountHandler;

#[async_trait]
impl MountHandler for BackendMountHandler {
    async fn activate(&self) -> Result<()> {
        Ok(())
    }

    async fn deactivate(&self, _force: bool) -> Result<()> {
        Ok(())
    }

    fn is_managed_by_backend(&self) -> bool {
        true
    }
}

#[derive(Default)]
pub(crate) struct MockFactory {
    pub vms: Mutex<HashMap<String, Arc<MockVm>>>,
    pub networks: Mutex<Vec<NetworkInterfaceInfo>>,
    pub removed: Mutex<Vec<String>>,
    pub fail_health_check: AtomicBool,
    /// Names whose handles are born with a failing start.
    pub fail_start_for: Mutex<Vec<String>>,
}

impl MockFactory {
    pub fn with_default_networks() -> Self {
        let factory = Self::default();
        *factory.networks.lock().unwrap() = vec![
            NetworkInterfaceInfo {
                id: "en0".to_string(),
                kind: "ethernet".to_string(),
                description: "Ethernet adapter".to_string(),
                needs_authorization: false,
            },
            NetworkInterfaceInfo {
                id: "wlan0".to_string(),
                kind: "wifi".to_string(),
                description: "Wireless adapter".to_string(),
                needs_authorization: true,
            },
        ];
        factory
    }

    pub fn vm(&self, name: &str) -> Arc<MockVm> {
        self.vms.lock().unwrap().get(name).cloned().expect("vm not created")
    }
}

#[async_trait]
impl VmFactory for MockFactory {
    fn create_virtual_machine(
        &self,
        desc: &VirtualMachineDescription,
        observer: Weak<dyn VmStatusObserver>,
    ) -> Result<Arc<dyn VirtualMachine>> {
        let vm = Arc::new(MockVm::new(&desc.name, observer));
        if self.fail_start_for.lock().unwrap().contains(&desc.name) {
            vm.fail_start.store(true, Ordering::SeqCst);
        }
        self.vms.lock().unwrap().insert(desc.name.clone(), vm.clone());
        Ok(vm)
    }

    fn networks(&self) -> Result<Vec<NetworkInterfaceInfo>> {
        Ok(self.networks.lock().unwrap().clone())
    }

    fn prepare_networking(&self, _extra_interfaces: &mut [crate::spec::NetworkInterface]) -> Result<()> {
        Ok(())
    }

    fn configure(&self, _desc: &mut VirtualMachineDescription) -> Result<()> {
        Ok(())
    }

    async fn prepare_instance_image(
        &self,
        _image: &VmImage,
        _desc: &VirtualMachineDescription,
    ) -> Result<()> {
        Ok(())
    }

    fn remove_resources_for(&self, name: &str) -> Result<()> {
        self.removed.lock().unwrap().push(name.to_string());
        Ok(())
    }

    fn hypervisor_health_check(&self) -> Result<()> {
        if self.fail_health_check.load(Ordering::SeqCst) {
            return Err(CoreError::internal("hypervisor unavailable"));
        }
        Ok(())
    }

    fn backend_directory_name(&self) -> String {
        "mockvisor".to_string()
    }

    fn backend_version_string(&self) -> String {
        "mockvisor-1.0".to_string()
    }
}

// =============================================================================
// Image vault and blueprints
// =============================================================================

pub(crate) struct MockVault {
    root: PathBuf,
    pub records: Mutex<HashMap<String, VmImage>>,
    pub min_image_size: MemorySize,
    pub prune_calls: AtomicUsize,
}

impl MockVault {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            records: Mutex::new(HashMap::new()),
            min_image_size: MemorySize::from_bytes(1024 * 1024),
            prune_calls: AtomicUsize::new(0),
        }
    }

    /// Registers an image record, creating the backing file.
    pub fn seed(&self, name: &str) -> VmImage {
        let dir = self.root.join("vault").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let image_path = dir.join(format!("{name}.img"));
        std::fs::write(&image_path, b"image").unwrap();
        let image = VmImage {
            id: format!("sha-{name}"),
            image_path,
            original_release: "22.04 LTS".to_string(),
        };
        self.records.lock().unwrap().insert(name.to_string(), image.clone());
        image
    }
}

#[async_trait]
impl ImageVault for MockVault {
    async fn fetch_image(
        &self,
        query: &Query,
        monitor: &ProgressMonitor,
        _checksum: Option<&str>,
    ) -> Result<VmImage> {
        monitor(0, 100);
        Ok(self.seed(&query.name))
    }

    fn image_for(&self, name: &str) -> Result<VmImage> {
        self.records
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::not_found(name.to_string()))
    }

    fn has_record_for(&self, name: &str) -> bool {
        self.records.lock().unwrap().contains_key(name)
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.records.lock().unwrap().remove(name);
        Ok(())
    }

    fn prune_expired_images(&self) {
        self.prune_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn update_images(&self, _monitor: &ProgressMonitor) -> Result<()> {
        Ok(())
    }

    fn minimum_image_size_for(&self, _id: &str) -> Result<MemorySize> {
        Ok(self.min_image_size)
    }
}

#[derive(Default)]
pub(crate) struct MockBlueprints;

#[async_trait]
impl BlueprintProvider for MockBlueprints {
    fn name_from_blueprint(&self, _image: &str) -> Option<String> {
        None
    }

    async fn fetch_blueprint_for(
        &self,
        _name: &str,
        _desc: &mut VirtualMachineDescription,
        _launch_data: &mut ClientLaunchData,
    ) -> Result<Option<Query>> {
        Ok(None)
    }

    async fn blueprint_from_file(
        &self,
        path: &str,
        _name: &str,
        _desc: &mut VirtualMachineDescription,
        _launch_data: &mut ClientLaunchData,
    ) -> Result<Query> {
        Err(CoreError::invalid_argument(format!(
            "no blueprint at {path}"
        )))
    }

    fn blueprint_timeout(&self, _name: &str) -> i32 {
        0
    }
}

// =============================================================================
// Sessions, keys, settings, names
// =============================================================================

#[derive(Default)]
pub(crate) struct MockSessions {
    /// Scripted outputs keyed by exact command; anything else succeeds.
    pub responses: Mutex<HashMap<String, CommandOutput>>,
    pub fail_open: AtomicBool,
    pub commands_run: Mutex<Vec<String>>,
}

impl MockSessions {
    pub fn script(&self, cmd: &str, output: CommandOutput) {
        self.responses.lock().unwrap().insert(cmd.to_string(), output);
    }
}

struct MockSession {
    factory: Arc<MockSessions>,
}

#[async_trait]
impl GuestSession for MockSession {
    async fn run(&mut self, cmd: &str) -> Result<CommandOutput> {
        self.factory.commands_run.lock().unwrap().push(cmd.to_string());
        Ok(self
            .factory
            .responses
            .lock()
            .unwrap()
            .get(cmd)
            .cloned()
            .unwrap_or(CommandOutput {
                exit_code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            }))
    }
}

#[async_trait]
impl GuestSessionFactory for Arc<MockSessions> {
    async fn open(
        &self,
        _host: &str,
        _port: u16,
        _username: &str,
    ) -> Result<Box<dyn GuestSession>> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(CoreError::timeout("ssh unreachable"));
        }
        Ok(Box::new(MockSession {
            factory: self.clone(),
        }))
    }
}

pub(crate) struct MockKeys;

impl SshKeyProvider for MockKeys {
    fn public_key_as_base64(&self) -> String {
        "AAAApublic".to_string()
    }

    fn private_key_as_base64(&self) -> String {
        "cHJpdmF0ZS1rZXk=".to_string()
    }
}

pub(crate) struct MemorySettings {
    values: Mutex<HashMap<String, String>>,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            values: Mutex::new(HashMap::from([
                (crate::config::PASSPHRASE_KEY.to_string(), String::new()),
                (crate::config::MOUNTS_KEY.to_string(), "true".to_string()),
                (
                    crate::config::BRIDGED_INTERFACE_KEY.to_string(),
                    String::new(),
                ),
            ])),
        }
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Result<String> {
        self.values
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| CoreError::UnrecognizedSetting(key.to_string()))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap();
        if !values.contains_key(key) {
            return Err(CoreError::UnrecognizedSetting(key.to_string()));
        }
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Name generator yielding a fixed sequence, then a fallback.
#[derive(Default)]
pub(crate) struct SeqNames {
    queue: Mutex<Vec<String>>,
}

impl SeqNames {
    pub fn preload(&self, names: &[&str]) {
        let mut queue = self.queue.lock().unwrap();
        *queue = names.iter().rev().map(|s| (*s).to_string()).collect();
    }
}

impl NameGenerator for SeqNames {
    fn make_name(&self) -> String {
        self.queue
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| "fallback-name".to_string())
    }
}

// =============================================================================
// Environment
// =============================================================================

pub(crate) struct TestEnv {
    pub data_dir: TempDir,
    pub cache_dir: TempDir,
    pub factory: Arc<MockFactory>,
    pub vault: Arc<MockVault>,
    pub sessions: Arc<MockSessions>,
    pub settings: Arc<MemorySettings>,
    pub names: Arc<SeqNames>,
}

impl TestEnv {
    pub fn new() -> Self {
        let data_dir = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let vault = Arc::new(MockVault::new(data_dir.path()));
        Self {
            data_dir,
            cache_dir,
            factory: Arc::new(MockFactory::with_default_networks()),
            vault,
            sessions: Arc::new(MockSessions::default()),
            settings: Arc::new(MemorySettings::default()),
            names: Arc::new(SeqNames::default()),
        }
    }

    pub fn config(&self) -> DaemonConfig {
        DaemonConfig {
            data_directory: self.data_dir.path().to_path_buf(),
            cache_directory: self.cache_dir.path().to_path_buf(),
            ssh_username: "ubuntu".to_string(),
            factory: self.factory.clone(),
            vault: self.vault.clone(),
            blueprint_provider: Arc::new(MockBlueprints),
            name_generator: self.names.clone(),
            ssh_key_provider: Arc::new(MockKeys),
            session_factory: Arc::new(self.sessions.clone()),
            settings: self.settings.clone(),
            image_refresh_interval: Duration::from_secs(6 * 60 * 60),
        }
    }

    pub async fn daemon(&self) -> crate::daemon::Daemon {
        crate::daemon::Daemon::new(self.config()).await.unwrap()
    }
}

/// A plain create/launch request for the given name.
pub(crate) fn create_request(name: &str) -> CreateRequest {
    CreateRequest {
        instance_name: name.to_string(),
        image: "jammy".to_string(),
        time_zone: "UTC".to_string(),
        ..CreateRequest::default()
    }
}
