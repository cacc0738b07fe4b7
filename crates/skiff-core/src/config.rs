//! Daemon configuration and shared constants.

use crate::hypervisor::{
    BlueprintProvider, GuestSessionFactory, ImageVault, NameGenerator, SettingsStore,
    SshKeyProvider, VmFactory,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// The registry file and per-instance artifacts keep their multipass-era
// names so existing state directories load unchanged.

/// File name of the persisted instance registry.
pub const INSTANCE_DB_NAME: &str = "multipassd-vm-instances.json";

/// Name of the cloud-init seed image inside an instance directory.
pub const CLOUD_INIT_ISO_NAME: &str = "cloud-init-config.iso";

pub const DEFAULT_MEMORY_SIZE: &str = "1G";
pub const MIN_MEMORY_SIZE: &str = "128M";
pub const DEFAULT_DISK_SIZE: &str = "5G";
pub const MIN_DISK_SIZE: &str = "512M";
pub const DEFAULT_CPU_CORES: i32 = 1;
pub const MIN_CPU_CORES: i32 = 1;

pub const DEFAULT_SSH_USERNAME: &str = "ubuntu";

/// Default readiness timeout when neither request nor blueprint names one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// How often source images are refreshed in the background.
pub const IMAGE_REFRESH_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Settings key holding the hex SHA-256 digest of the client passphrase.
pub const PASSPHRASE_KEY: &str = "local.passphrase";

/// Settings key gating mount support.
pub const MOUNTS_KEY: &str = "local.privileged-mounts";

/// Settings key naming the host interface behind the bridged shortcut.
pub const BRIDGED_INTERFACE_KEY: &str = "local.bridged-network";

/// The network id clients pass to mean "the configured bridged interface".
pub const BRIDGED_NETWORK_NAME: &str = "bridged";

/// Everything the daemon needs at construction.
///
/// The collaborators are chosen by the embedding binary; the core never
/// constructs one itself.
pub struct DaemonConfig {
    /// Root of the durable state; the backend subdirectory lives below it.
    pub data_directory: PathBuf,
    /// Root of the cache; only read for the legacy registry location.
    pub cache_directory: PathBuf,
    /// Default SSH username written into new instances.
    pub ssh_username: String,
    pub factory: Arc<dyn VmFactory>,
    pub vault: Arc<dyn ImageVault>,
    pub blueprint_provider: Arc<dyn BlueprintProvider>,
    pub name_generator: Arc<dyn NameGenerator>,
    pub ssh_key_provider: Arc<dyn SshKeyProvider>,
    pub session_factory: Arc<dyn GuestSessionFactory>,
    pub settings: Arc<dyn SettingsStore>,
    /// Interval of the background image refresh task.
    pub image_refresh_interval: Duration,
}

impl DaemonConfig {
    /// The backend-specific subdirectory of the data directory.
    #[must_use]
    pub fn backend_data_directory(&self) -> PathBuf {
        self.data_directory
            .join(self.factory.backend_directory_name())
    }

    /// The backend-specific subdirectory of the (legacy) cache directory.
    #[must_use]
    pub fn backend_cache_directory(&self) -> PathBuf {
        self.cache_directory
            .join(self.factory.backend_directory_name())
    }
}

/// Host-version string advertised in guest provenance records.
#[must_use]
pub fn host_version() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// The daemon's own version string.
#[must_use]
pub fn version_string() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
