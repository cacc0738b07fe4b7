//! Durable instance data model.
//!
//! An [`InstanceSpec`] is the persisted description of one instance: sizing,
//! network identities, mounts, last observed state, and the deleted flag. The
//! volatile counterpart (the live handle) lives in
//! [`crate::hypervisor::VirtualMachine`].

use crate::error::{CoreError, Result};
use skiff_protocol::{IdMap, InstanceStatus, MountType};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Instance state
// =============================================================================

/// Lifecycle state of an instance.
///
/// The integer codes are part of the persisted format and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Off,
    Stopped,
    Starting,
    Restarting,
    Running,
    DelayedShutdown,
    Suspending,
    Suspended,
    Unknown,
}

impl InstanceState {
    /// Returns the persisted integer code.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Off => 0,
            Self::Stopped => 1,
            Self::Starting => 2,
            Self::Restarting => 3,
            Self::Running => 4,
            Self::DelayedShutdown => 5,
            Self::Suspending => 6,
            Self::Suspended => 7,
            Self::Unknown => 8,
        }
    }

    /// Reconstructs a state from its persisted code; anything unrecognized
    /// comes back as [`InstanceState::Unknown`].
    #[must_use]
    pub const fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Off,
            1 => Self::Stopped,
            2 => Self::Starting,
            3 => Self::Restarting,
            4 => Self::Running,
            5 => Self::DelayedShutdown,
            6 => Self::Suspending,
            7 => Self::Suspended,
            _ => Self::Unknown,
        }
    }

    /// Returns true for the states in which the guest is up or coming up.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Restarting | Self::Running | Self::DelayedShutdown
        )
    }
}

impl From<InstanceState> for InstanceStatus {
    fn from(state: InstanceState) -> Self {
        match state {
            InstanceState::Off | InstanceState::Stopped => Self::Stopped,
            InstanceState::Starting => Self::Starting,
            InstanceState::Restarting => Self::Restarting,
            InstanceState::Running => Self::Running,
            InstanceState::DelayedShutdown => Self::DelayedShutdown,
            InstanceState::Suspending => Self::Suspending,
            InstanceState::Suspended => Self::Suspended,
            InstanceState::Unknown => Self::Unknown,
        }
    }
}

// =============================================================================
// Memory size
// =============================================================================

/// A byte count parsed from a human-readable size string.
///
/// Accepts a decimal number with an optional `B`, `K`, `M`, `G` or `T` suffix
/// (binary multiples, case-insensitive, optional trailing `B` after the
/// multiplier). The empty string parses as zero bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct MemorySize {
    bytes: u64,
}

impl MemorySize {
    /// A size of exactly `bytes` bytes.
    #[must_use]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self { bytes }
    }

    /// Returns the size in bytes.
    #[must_use]
    pub const fn in_bytes(self) -> u64 {
        self.bytes
    }
}

impl FromStr for MemorySize {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Ok(Self::from_bytes(0));
        }

        let lower = trimmed.to_ascii_lowercase();
        let digits_end = lower
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(lower.len());
        let (number, suffix) = lower.split_at(digits_end);

        let multiplier: u64 = match suffix {
            "" | "b" => 1,
            "k" | "kb" => 1024,
            "m" | "mb" => 1024 * 1024,
            "g" | "gb" => 1024 * 1024 * 1024,
            "t" | "tb" => 1024_u64.pow(4),
            _ => {
                return Err(CoreError::invalid_argument(format!(
                    "invalid memory size '{value}'"
                )))
            }
        };

        let quantity: f64 = number
            .parse()
            .map_err(|_| CoreError::invalid_argument(format!("invalid memory size '{value}'")))?;
        if quantity < 0.0 || !quantity.is_finite() {
            return Err(CoreError::invalid_argument(format!(
                "invalid memory size '{value}'"
            )));
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Ok(Self::from_bytes((quantity * multiplier as f64) as u64))
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes)
    }
}

// =============================================================================
// Network interfaces and mounts
// =============================================================================

/// One extra network interface of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    /// Host network identifier the interface attaches to.
    pub id: String,
    /// MAC address, lowercase colon-separated.
    pub mac_address: String,
    /// Whether the guest configures the interface via DHCP at first boot.
    pub auto_mode: bool,
}

/// Mount flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// Session-based mount driven by the daemon.
    Classic,
    /// Mount performed natively by the hypervisor back-end.
    Native,
}

impl MountKind {
    /// Returns the persisted integer code.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Classic => 0,
            Self::Native => 1,
        }
    }

    /// Reconstructs a kind from its persisted code; unknown codes fall back
    /// to classic.
    #[must_use]
    pub const fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Native,
            _ => Self::Classic,
        }
    }
}

impl From<MountType> for MountKind {
    fn from(value: MountType) -> Self {
        match value {
            MountType::Classic => Self::Classic,
            MountType::Native => Self::Native,
        }
    }
}

/// Deduplicates id mappings by host id.
///
/// Later entries override earlier ones with the same host id; the position of
/// the first occurrence is preserved.
#[must_use]
pub fn unique_id_mappings(mappings: &[IdMap]) -> Vec<IdMap> {
    let mut result: Vec<IdMap> = Vec::with_capacity(mappings.len());
    for mapping in mappings {
        if let Some(existing) = result.iter_mut().find(|m| m.host_id == mapping.host_id) {
            existing.instance_id = mapping.instance_id;
        } else {
            result.push(*mapping);
        }
    }
    result
}

/// Description of one mount of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmMount {
    /// Source path on the host.
    pub source_path: String,
    /// Host UID to instance UID mappings.
    pub uid_mappings: Vec<IdMap>,
    /// Host GID to instance GID mappings.
    pub gid_mappings: Vec<IdMap>,
    pub kind: MountKind,
}

impl VmMount {
    /// Builds a mount description, normalizing the id mapping lists.
    #[must_use]
    pub fn new(
        source_path: impl Into<String>,
        uid_mappings: &[IdMap],
        gid_mappings: &[IdMap],
        kind: MountKind,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            uid_mappings: unique_id_mappings(uid_mappings),
            gid_mappings: unique_id_mappings(gid_mappings),
            kind,
        }
    }
}

// =============================================================================
// Instance specification
// =============================================================================

/// The durable description of one instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub num_cores: i32,
    pub mem_size: MemorySize,
    pub disk_space: MemorySize,
    /// MAC address of the default network interface.
    pub default_mac_address: String,
    /// Extra interfaces, in attach order.
    pub extra_interfaces: Vec<NetworkInterface>,
    pub ssh_username: String,
    /// Last observed lifecycle state.
    pub state: InstanceState,
    /// Mounts keyed by target path in the guest.
    pub mounts: HashMap<String, VmMount>,
    /// Whether the instance sits in the deleted table.
    pub deleted: bool,
    /// Opaque back-end metadata, persisted verbatim.
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(host_id: i32, instance_id: i32) -> IdMap {
        IdMap {
            host_id,
            instance_id,
        }
    }

    #[test]
    fn test_memory_size_parsing() {
        assert_eq!("1024".parse::<MemorySize>().unwrap().in_bytes(), 1024);
        assert_eq!("1K".parse::<MemorySize>().unwrap().in_bytes(), 1024);
        assert_eq!(
            "512M".parse::<MemorySize>().unwrap().in_bytes(),
            512 * 1024 * 1024
        );
        assert_eq!(
            "3g".parse::<MemorySize>().unwrap().in_bytes(),
            3 * 1024 * 1024 * 1024
        );
        assert_eq!(
            "1.5G".parse::<MemorySize>().unwrap().in_bytes(),
            3 * 512 * 1024 * 1024
        );
        assert_eq!("0".parse::<MemorySize>().unwrap().in_bytes(), 0);
        assert_eq!("".parse::<MemorySize>().unwrap().in_bytes(), 0);
    }

    #[test]
    fn test_memory_size_rejects_garbage() {
        assert!("1X".parse::<MemorySize>().is_err());
        assert!("G".parse::<MemorySize>().is_err());
        assert!("-1G".parse::<MemorySize>().is_err());
    }

    #[test]
    fn test_state_codes_round_trip() {
        for state in [
            InstanceState::Off,
            InstanceState::Stopped,
            InstanceState::Starting,
            InstanceState::Restarting,
            InstanceState::Running,
            InstanceState::DelayedShutdown,
            InstanceState::Suspending,
            InstanceState::Suspended,
            InstanceState::Unknown,
        ] {
            assert_eq!(InstanceState::from_code(state.code()), state);
        }
        assert_eq!(InstanceState::from_code(42), InstanceState::Unknown);
    }

    #[test]
    fn test_is_running() {
        assert!(InstanceState::Starting.is_running());
        assert!(InstanceState::Restarting.is_running());
        assert!(InstanceState::Running.is_running());
        assert!(InstanceState::DelayedShutdown.is_running());
        assert!(!InstanceState::Off.is_running());
        assert!(!InstanceState::Stopped.is_running());
        assert!(!InstanceState::Suspending.is_running());
        assert!(!InstanceState::Suspended.is_running());
        assert!(!InstanceState::Unknown.is_running());
    }

    #[test]
    fn test_unique_id_mappings_later_wins_order_preserved() {
        let deduped = unique_id_mappings(&[map(1000, 1), map(1001, 2), map(1000, 3)]);
        assert_eq!(deduped, vec![map(1000, 3), map(1001, 2)]);
    }

    #[test]
    fn test_vm_mount_normalizes_mappings() {
        let mount = VmMount::new(
            "/home/user/src",
            &[map(501, 1000), map(501, 1001)],
            &[],
            MountKind::Classic,
        );
        assert_eq!(mount.uid_mappings, vec![map(501, 1001)]);
        assert!(mount.gid_mappings.is_empty());
    }
}
