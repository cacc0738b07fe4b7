//! MAC address allocation.
//!
//! The daemon tracks every MAC it has handed out in one global set spanning
//! operative, deleted, and preparing instances. Generation draws from the
//! locally-administered unicast range and retries a few times before giving
//! up.

use crate::error::{CoreError, Result};
use crate::spec::InstanceSpec;
use rand::Rng;
use std::collections::HashSet;

/// Locally-administered, unicast OUI used for generated addresses.
const MAC_PREFIX: &str = "52:54:00";

/// Attempts before generation fails with resource exhaustion.
const MAX_GENERATION_TRIES: usize = 5;

/// Generates a random MAC address in the locally-administered unicast range.
#[must_use]
pub fn generate_mac_address() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{}:{:02x}:{:02x}:{:02x}",
        MAC_PREFIX,
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}

/// Returns every MAC address referenced by a spec: the default interface
/// plus all extras.
#[must_use]
pub fn mac_set_of(spec: &InstanceSpec) -> HashSet<String> {
    let mut macs = HashSet::with_capacity(1 + spec.extra_interfaces.len());
    macs.insert(spec.default_mac_address.clone());
    for iface in &spec.extra_interfaces {
        macs.insert(iface.mac_address.clone());
    }
    macs
}

/// Merges `t` into `s` iff the two sets are disjoint.
///
/// Returns whether the merge happened; `s` is untouched on overlap.
pub fn merge_if_disjoint(s: &mut HashSet<String>, t: &HashSet<String>) -> bool {
    if s.iter().any(|mac| t.contains(mac)) {
        return false;
    }
    s.extend(t.iter().cloned());
    true
}

/// Generates a MAC address absent from `used`, inserting it on success.
///
/// # Errors
///
/// Returns a resource-exhausted error after five colliding draws.
// TODO: checking our own records does not suffice to conclude the generated
// MAC is unique on the host; also consult the ARP table.
pub fn generate_unused_mac_address(used: &mut HashSet<String>) -> Result<String> {
    for _ in 0..MAX_GENERATION_TRIES {
        let candidate = generate_mac_address();
        if used.insert(candidate.clone()) {
            return Ok(candidate);
        }
    }

    Err(CoreError::ResourceExhausted(format!(
        "Failed to generate a unique MAC address after {} attempts. Number of MAC addresses in use: {}",
        MAX_GENERATION_TRIES,
        used.len()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{InstanceState, MemorySize, NetworkInterface};
    use crate::validation::valid_mac_address;
    use std::collections::HashMap;

    fn spec_with_macs(default: &str, extras: &[&str]) -> InstanceSpec {
        InstanceSpec {
            num_cores: 1,
            mem_size: MemorySize::from_bytes(1 << 30),
            disk_space: MemorySize::from_bytes(5 << 30),
            default_mac_address: default.to_string(),
            extra_interfaces: extras
                .iter()
                .map(|mac| NetworkInterface {
                    id: "en0".to_string(),
                    mac_address: (*mac).to_string(),
                    auto_mode: true,
                })
                .collect(),
            ssh_username: "ubuntu".to_string(),
            state: InstanceState::Off,
            mounts: HashMap::new(),
            deleted: false,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    #[test]
    fn test_generated_mac_is_valid_and_prefixed() {
        let mac = generate_mac_address();
        assert!(valid_mac_address(&mac));
        assert!(mac.starts_with("52:54:00:"));
    }

    #[test]
    fn test_mac_set_of_collects_default_and_extras() {
        let spec = spec_with_macs("52:54:00:00:00:01", &["52:54:00:00:00:02"]);
        let macs = mac_set_of(&spec);
        assert_eq!(macs.len(), 2);
        assert!(macs.contains("52:54:00:00:00:01"));
        assert!(macs.contains("52:54:00:00:00:02"));
    }

    #[test]
    fn test_mac_set_of_exposes_internal_duplicates() {
        // A spec with a repeated MAC yields a set smaller than the interface
        // count, which is how reconciliation detects the violation.
        let spec = spec_with_macs("52:54:00:00:00:01", &["52:54:00:00:00:01"]);
        assert_eq!(mac_set_of(&spec).len(), 1);
        assert!(mac_set_of(&spec).len() <= spec.extra_interfaces.len());
    }

    #[test]
    fn test_merge_if_disjoint() {
        let mut s: HashSet<String> = ["a".to_string(), "b".to_string()].into();
        let t: HashSet<String> = ["c".to_string()].into();
        assert!(merge_if_disjoint(&mut s, &t));
        assert_eq!(s.len(), 3);

        let overlapping: HashSet<String> = ["b".to_string(), "d".to_string()].into();
        assert!(!merge_if_disjoint(&mut s, &overlapping));
        assert_eq!(s.len(), 3, "set must be untouched on overlap");
    }

    #[test]
    fn test_generate_unused_mac_inserts() {
        let mut used = HashSet::new();
        let mac = generate_unused_mac_address(&mut used).unwrap();
        assert!(used.contains(&mac));
        assert_eq!(used.len(), 1);
    }
}
