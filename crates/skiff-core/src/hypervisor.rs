//! Collaborator seams around the daemon core.
//!
//! Hypervisor back-ends, the image vault, blueprint resolution, guest shell
//! sessions, key material, and the settings store are all external to the
//! lifecycle core (and out of scope for this crate). The traits here are the
//! capability interfaces the daemon drives them through; concrete
//! implementations are chosen at initialization and injected via
//! [`crate::config::DaemonConfig`].

use crate::error::Result;
use crate::mounts::MountHandler;
use crate::spec::{InstanceSpec, InstanceState, MemorySize, NetworkInterface, VmMount};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skiff_protocol::AliasDefinition;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

// =============================================================================
// Description types
// =============================================================================

/// How an image reference is to be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryType {
    /// An alias into an image host, optionally qualified with `<remote>:`.
    #[default]
    Alias,
    /// A `file://` path on the host.
    LocalFile,
    /// An http(s) URL to download.
    HttpDownload,
}

/// An image lookup handed to the vault.
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// Instance the image is fetched for.
    pub name: String,
    /// Alias, path, or URL, depending on `query_type`.
    pub release: String,
    /// Image host to search; empty means the default.
    pub remote_name: String,
    pub query_type: QueryType,
}

/// An image record held by the vault.
#[derive(Debug, Clone, Default)]
pub struct VmImage {
    /// Content hash identifying the image.
    pub id: String,
    /// Path of the instance's image file.
    pub image_path: PathBuf,
    /// Release title the image was fetched as.
    pub original_release: String,
}

impl VmImage {
    /// The directory holding the instance's artifacts.
    #[must_use]
    pub fn instance_directory(&self) -> PathBuf {
        self.image_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }
}

/// Progress callback for image downloads; returning false cancels.
pub type ProgressMonitor = Box<dyn Fn(i32, i32) -> bool + Send + Sync>;

/// One snapshot of an instance.
#[derive(Debug, Clone, Default)]
pub struct SnapshotInfo {
    pub name: String,
    /// Name of the parent snapshot; empty for roots.
    pub parent: String,
    pub comment: String,
    pub created: Option<DateTime<Utc>>,
}

/// Client-side follow-ups a blueprint asks for after launch.
#[derive(Debug, Clone, Default)]
pub struct ClientLaunchData {
    pub aliases_to_be_created: Vec<AliasDefinition>,
    pub workspaces_to_be_created: Vec<String>,
}

/// Everything the factory needs to construct an instance.
#[derive(Debug, Clone, Default)]
pub struct VirtualMachineDescription {
    pub num_cores: i32,
    pub mem_size: MemorySize,
    pub disk_space: MemorySize,
    pub name: String,
    pub default_mac_address: String,
    pub extra_interfaces: Vec<NetworkInterface>,
    pub ssh_username: String,
    pub image: VmImage,
    /// Path of the cloud-init seed image built for the instance.
    pub cloud_init_iso: PathBuf,
    pub vendor_data: serde_yaml::Value,
    pub meta_data: serde_yaml::Value,
    pub user_data: serde_yaml::Value,
    pub network_data: serde_yaml::Value,
}

/// A host network usable for extra interfaces.
#[derive(Debug, Clone, Default)]
pub struct NetworkInterfaceInfo {
    pub id: String,
    /// Interface kind (e.g. "bridge", "wifi").
    pub kind: String,
    pub description: String,
    /// Whether attaching requires host-side authorization first.
    pub needs_authorization: bool,
}

/// Output of one command run in the guest.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code, or None when the session terminated without delivering one
    /// (e.g. the guest went down mid-command).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// True for a delivered zero exit code.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

// =============================================================================
// Collaborator traits
// =============================================================================

/// A live instance handle, owned by the registry.
///
/// Implementations guard their state behind an internal mutex; transitions
/// observed by the back-end are totally ordered per instance.
#[async_trait]
pub trait VirtualMachine: Send + Sync {
    fn name(&self) -> &str;

    /// The state as currently observed by the back-end.
    fn current_state(&self) -> InstanceState;

    /// Overrides the observed state (delayed shutdown, reconciliation).
    fn set_state(&self, state: InstanceState);

    async fn start(&self) -> Result<()>;
    async fn shutdown(&self) -> Result<()>;
    async fn suspend(&self) -> Result<()>;

    fn ssh_hostname(&self) -> String;
    fn ssh_port(&self) -> u16;
    fn ssh_username(&self) -> String;

    /// The address the daemon reaches the guest at; may be empty or stale
    /// when the guest is down.
    fn management_ipv4(&self) -> String;

    /// Every IPv4 address the guest currently holds.
    async fn all_ipv4(&self) -> Vec<String>;

    /// Waits for the guest's shell service to accept connections.
    async fn wait_until_ssh_up(&self, timeout: Duration) -> Result<()>;

    /// Loads the snapshot collection from the instance directory.
    fn load_snapshots(&self, instance_dir: &Path) -> Result<()>;

    fn view_snapshots(&self) -> Vec<SnapshotInfo>;

    /// Looks a snapshot up by name.
    ///
    /// # Errors
    ///
    /// Not-found when no snapshot has that name.
    fn get_snapshot(&self, name: &str) -> Result<SnapshotInfo>;

    fn snapshot_count(&self) -> usize;

    /// Takes a snapshot; an empty name means auto-assign one.
    async fn take_snapshot(
        &self,
        instance_dir: &Path,
        spec: &InstanceSpec,
        name: &str,
        comment: &str,
    ) -> Result<SnapshotInfo>;

    /// Restores a snapshot, rewriting the spec to the snapshotted shape.
    async fn restore_snapshot(
        &self,
        instance_dir: &Path,
        name: &str,
        spec: &mut InstanceSpec,
    ) -> Result<()>;

    /// Builds the back-end's own mount handler for a native mount.
    fn make_native_mount_handler(
        &self,
        target: &str,
        mount: &VmMount,
    ) -> Result<Arc<dyn MountHandler>>;
}

/// Non-owning back-reference from instance handles into the daemon.
///
/// Handles report state transitions and metadata through this observer; the
/// daemon persists on every call.
pub trait VmStatusObserver: Send + Sync {
    fn persist_state_for(&self, name: &str, state: InstanceState);
    fn update_metadata_for(&self, name: &str, metadata: serde_json::Value);
    fn retrieve_metadata_for(&self, name: &str) -> serde_json::Value;
}

/// The hypervisor back-end.
#[async_trait]
pub trait VmFactory: Send + Sync {
    /// Constructs a handle for a described instance.
    ///
    /// The observer must not be invoked during construction; the registry
    /// lock may still be held.
    fn create_virtual_machine(
        &self,
        desc: &VirtualMachineDescription,
        observer: Weak<dyn VmStatusObserver>,
    ) -> Result<Arc<dyn VirtualMachine>>;

    /// Host networks available for extra interfaces.
    ///
    /// # Errors
    ///
    /// Unsupported when the back-end cannot bridge at all.
    fn networks(&self) -> Result<Vec<NetworkInterfaceInfo>>;

    /// Back-end preparation for the requested extra interfaces (e.g.
    /// creating host bridges).
    fn prepare_networking(&self, extra_interfaces: &mut [NetworkInterface]) -> Result<()>;

    /// Back-end adjustments to a description before image preparation.
    fn configure(&self, desc: &mut VirtualMachineDescription) -> Result<()>;

    /// Writes the instance image and cloud-init seed for a description.
    async fn prepare_instance_image(
        &self,
        image: &VmImage,
        desc: &VirtualMachineDescription,
    ) -> Result<()>;

    /// Releases back-end artifacts of an instance.
    fn remove_resources_for(&self, name: &str) -> Result<()>;

    /// Verifies the hypervisor is usable on this host.
    fn hypervisor_health_check(&self) -> Result<()>;

    /// Name of the back-end's subdirectory under the data/cache directories.
    fn backend_directory_name(&self) -> String;

    fn backend_version_string(&self) -> String;
}

/// The image vault: download, cache, and prepare images.
#[async_trait]
pub trait ImageVault: Send + Sync {
    /// Resolves a query to a ready image, downloading as needed.
    async fn fetch_image(
        &self,
        query: &Query,
        monitor: &ProgressMonitor,
        checksum: Option<&str>,
    ) -> Result<VmImage>;

    /// Returns the cached image record of a known instance.
    fn image_for(&self, name: &str) -> Result<VmImage>;

    fn has_record_for(&self, name: &str) -> bool;

    fn remove(&self, name: &str) -> Result<()>;

    fn prune_expired_images(&self);

    /// Refreshes source images to newly released versions.
    async fn update_images(&self, monitor: &ProgressMonitor) -> Result<()>;

    /// Minimum disk an image needs to boot.
    fn minimum_image_size_for(&self, id: &str) -> Result<MemorySize>;
}

/// Blueprint resolution.
#[async_trait]
pub trait BlueprintProvider: Send + Sync {
    /// The instance name a blueprint dictates, if the image names one.
    fn name_from_blueprint(&self, image: &str) -> Option<String>;

    /// Expands a blueprint into the description, returning the image query.
    ///
    /// `Ok(None)` means the image is not a blueprint.
    async fn fetch_blueprint_for(
        &self,
        name: &str,
        desc: &mut VirtualMachineDescription,
        launch_data: &mut ClientLaunchData,
    ) -> Result<Option<Query>>;

    /// Expands a blueprint read from a local YAML file.
    async fn blueprint_from_file(
        &self,
        path: &str,
        name: &str,
        desc: &mut VirtualMachineDescription,
        launch_data: &mut ClientLaunchData,
    ) -> Result<Query>;

    /// Per-blueprint launch timeout in seconds; 0 means none specified.
    fn blueprint_timeout(&self, name: &str) -> i32;
}

/// One shell session into a guest.
#[async_trait]
pub trait GuestSession: Send {
    /// Runs a command to completion.
    async fn run(&mut self, cmd: &str) -> Result<CommandOutput>;
}

/// Opens shell sessions into guests.
#[async_trait]
pub trait GuestSessionFactory: Send + Sync {
    async fn open(&self, host: &str, port: u16, username: &str) -> Result<Box<dyn GuestSession>>;
}

/// Key material injected into guests and handed to clients.
pub trait SshKeyProvider: Send + Sync {
    fn public_key_as_base64(&self) -> String;
    fn private_key_as_base64(&self) -> String;
}

/// The daemon-wide settings store.
pub trait SettingsStore: Send + Sync {
    /// # Errors
    ///
    /// [`crate::error::CoreError::UnrecognizedSetting`] for unknown keys.
    fn get(&self, key: &str) -> Result<String>;

    /// # Errors
    ///
    /// [`crate::error::CoreError::UnrecognizedSetting`] or
    /// [`crate::error::CoreError::InvalidSetting`].
    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn keys(&self) -> Vec<String>;
}

/// Generates candidate instance names.
pub trait NameGenerator: Send + Sync {
    fn make_name(&self) -> String;
}
