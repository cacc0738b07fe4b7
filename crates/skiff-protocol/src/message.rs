//! Request and reply shapes for the daemon operations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// Shared types
// =============================================================================

/// Observable instance status reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Stopped,
    Starting,
    Restarting,
    Running,
    DelayedShutdown,
    Suspending,
    Suspended,
    Deleted,
    #[default]
    Unknown,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::Restarting => "Restarting",
            Self::Running => "Running",
            Self::DelayedShutdown => "Delayed Shutdown",
            Self::Suspending => "Suspending",
            Self::Suspended => "Suspended",
            Self::Deleted => "Deleted",
            Self::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// One host-id to instance-id mapping for a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub host_id: i32,
    pub instance_id: i32,
}

/// Mount flavor requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountType {
    /// Session-based mount driven by the daemon.
    #[default]
    Classic,
    /// Mount performed natively by the hypervisor back-end.
    Native,
}

/// An (instance, target path) pair for mount and umount requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPathEntry {
    pub instance_name: String,
    /// Empty means "all mounts of the instance" for umount.
    #[serde(default)]
    pub target_path: String,
}

/// An (instance, snapshot) pair; an empty snapshot selects the instance
/// itself (all snapshots).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSnapshotPair {
    pub instance_name: String,
    #[serde(default)]
    pub snapshot_name: String,
}

/// Requested configuration mode of an extra network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Configure the interface via DHCP at first boot.
    #[default]
    Auto,
    /// Leave configuration to the user.
    Manual,
}

/// One extra network requested at create time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkOption {
    /// Host network identifier, or the bridged-network shortcut.
    pub id: String,
    /// Requested MAC address; empty means "generate one".
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub mode: NetworkMode,
}

// =============================================================================
// Requests
// =============================================================================

/// Arguments to create (and optionally launch) an instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRequest {
    /// Requested name; empty means derive or generate one.
    #[serde(default)]
    pub instance_name: String,
    /// Image reference: alias, blueprint name, `file://` path or http URL.
    #[serde(default)]
    pub image: String,
    /// Image host to resolve the alias against; empty means the default.
    #[serde(default)]
    pub remote_name: String,
    #[serde(default)]
    pub num_cores: i32,
    /// Memory size string (e.g. "1G"); empty means the default.
    #[serde(default)]
    pub mem_size: String,
    /// Disk size string; empty means image-derived.
    #[serde(default)]
    pub disk_space: String,
    #[serde(default)]
    pub network_options: Vec<NetworkOption>,
    /// Whether the client authorized bridging host networks that need it.
    #[serde(default)]
    pub permission_to_bridge: bool,
    /// Readiness timeout in seconds; 0 means the default.
    #[serde(default)]
    pub timeout_secs: i32,
    /// User-supplied cloud-init user data (YAML).
    #[serde(default)]
    pub cloud_init_user_data: String,
    /// Time zone configured in the guest.
    #[serde(default)]
    pub time_zone: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub instance_names: Vec<String>,
    #[serde(default)]
    pub timeout_secs: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub instance_names: Vec<String>,
    /// Minutes to delay the shutdown; 0 means immediate.
    #[serde(default)]
    pub time_minutes: i32,
    /// Cancel a pending delayed shutdown instead of stopping.
    #[serde(default)]
    pub cancel_shutdown: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestartRequest {
    #[serde(default)]
    pub instance_names: Vec<String>,
    #[serde(default)]
    pub timeout_secs: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuspendRequest {
    #[serde(default)]
    pub instance_names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoverRequest {
    #[serde(default)]
    pub instance_names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteRequest {
    #[serde(default)]
    pub instances_snapshots: Vec<InstanceSnapshotPair>,
    /// Release resources immediately instead of moving to the deleted table.
    #[serde(default)]
    pub purge: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub request_ipv4: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfoRequest {
    #[serde(default)]
    pub instances_snapshots: Vec<InstanceSnapshotPair>,
    /// Skip the guest-side runtime queries.
    #[serde(default)]
    pub no_runtime_information: bool,
    /// Return the snapshot overview instead of the detailed report.
    #[serde(default)]
    pub snapshot_overview: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountRequest {
    pub source_path: String,
    #[serde(default)]
    pub target_paths: Vec<TargetPathEntry>,
    #[serde(default)]
    pub uid_mappings: Vec<IdMap>,
    #[serde(default)]
    pub gid_mappings: Vec<IdMap>,
    #[serde(default)]
    pub mount_type: MountType,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UmountRequest {
    #[serde(default)]
    pub target_paths: Vec<TargetPathEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub instance: String,
    /// Requested snapshot name; empty means auto-assign.
    #[serde(default)]
    pub snapshot: String,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub instance: String,
    pub snapshot: String,
    /// Skip the automatic snapshot taken before restoring.
    #[serde(default)]
    pub destructive: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshInfoRequest {
    #[serde(default)]
    pub instance_names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetRequest {
    pub key: String,
    pub val: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthenticateRequest {
    pub passphrase: String,
}

// =============================================================================
// Replies
// =============================================================================

/// Download/prepare progress relayed from the image vault.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchProgress {
    /// Progress category as reported by the vault.
    #[serde(default)]
    pub kind: i32,
    #[serde(default)]
    pub percent_complete: String,
}

/// A client-side alias a blueprint asks to define after launch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasDefinition {
    pub name: String,
    pub instance: String,
    pub command: String,
    #[serde(default)]
    pub working_directory: String,
}

/// Streamed reply for create and launch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateReply {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub create_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_progress: Option<LaunchProgress>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vm_instance_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nets_need_bridging: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reply_message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_line: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases_to_be_created: Vec<AliasDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspaces_to_be_created: Vec<String>,
}

impl CreateReply {
    /// A reply carrying only a create-stage message.
    #[must_use]
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            create_message: text.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListEntry {
    pub name: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub current_release: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListReply {
    pub instances: Vec<ListEntry>,
}

/// Mount entry in an instance detail report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountPathEntry {
    pub source_path: String,
    pub target_path: String,
    #[serde(default)]
    pub uid_mappings: Vec<IdMap>,
    #[serde(default)]
    pub gid_mappings: Vec<IdMap>,
}

/// Detailed report for one instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceDetail {
    pub name: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub image_release: String,
    #[serde(default)]
    pub image_id: String,
    #[serde(default)]
    pub snapshot_count: usize,
    #[serde(default)]
    pub mounts: Vec<MountPathEntry>,
    #[serde(default)]
    pub load: String,
    #[serde(default)]
    pub memory_usage: String,
    #[serde(default)]
    pub memory_total: String,
    #[serde(default)]
    pub disk_usage: String,
    #[serde(default)]
    pub disk_total: String,
    #[serde(default)]
    pub cpu_count: String,
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub current_release: String,
}

/// One row of the snapshot overview.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotOverviewEntry {
    pub instance_name: String,
    pub snapshot_name: String,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfoReply {
    #[serde(default)]
    pub details: Vec<InstanceDetail>,
    #[serde(default)]
    pub snapshot_overview: Vec<SnapshotOverviewEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteReply {
    #[serde(default)]
    pub purged_instances: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PurgeReply {
    #[serde(default)]
    pub purged_instances: Vec<String>,
}

/// SSH endpoint material for one instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub priv_key_base64: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshInfoReply {
    #[serde(default)]
    pub ssh_info: BTreeMap<String, SshInfo>,
}

/// One host network usable with the networks operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkInterfaceEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworksReply {
    #[serde(default)]
    pub interfaces: Vec<NetworkInterfaceEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionReply {
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetReply {
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysReply {
    #[serde(default)]
    pub settings_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotReply {
    /// The name assigned to the snapshot.
    pub snapshot: String,
}

/// Streamed reply for restore.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreReply {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reply_message: String,
}
