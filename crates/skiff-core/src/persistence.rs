//! The persisted instance registry.
//!
//! The whole registry is one JSON document keyed by instance name, written
//! after every mutation. Loading is tolerant by design: unreadable documents
//! and ghost records are dropped with a warning so a damaged database never
//! takes the daemon down, but an invalid MAC address fails the load loudly
//! because it would corrupt the global allocation set.

use crate::config::{DEFAULT_DISK_SIZE, DEFAULT_MEMORY_SIZE, DEFAULT_SSH_USERNAME, INSTANCE_DB_NAME};
use crate::error::{CoreError, Result};
use crate::spec::{
    InstanceSpec, InstanceState, MemorySize, MountKind, NetworkInterface, VmMount,
};
use crate::validation::valid_mac_address;
use serde::{Deserialize, Serialize};
use skiff_protocol::IdMap;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ExtraInterfaceRecord {
    #[serde(default)]
    id: String,
    #[serde(default)]
    mac_address: String,
    #[serde(default)]
    auto_mode: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct UidMapRecord {
    #[serde(default)]
    host_uid: i32,
    #[serde(default)]
    instance_uid: i32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct GidMapRecord {
    #[serde(default)]
    host_gid: i32,
    #[serde(default)]
    instance_gid: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MountRecord {
    #[serde(default)]
    source_path: String,
    #[serde(default)]
    target_path: String,
    #[serde(default)]
    uid_mappings: Vec<UidMapRecord>,
    #[serde(default)]
    gid_mappings: Vec<GidMapRecord>,
    #[serde(default)]
    mount_type: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct InstanceRecord {
    #[serde(default)]
    num_cores: i32,
    /// Decimal byte string.
    #[serde(default)]
    mem_size: String,
    /// Decimal byte string.
    #[serde(default)]
    disk_space: String,
    #[serde(default)]
    ssh_username: String,
    #[serde(default)]
    state: i64,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    metadata: serde_json::Value,
    #[serde(default)]
    mac_addr: String,
    #[serde(default)]
    extra_interfaces: Vec<ExtraInterfaceRecord>,
    #[serde(default)]
    mounts: Vec<MountRecord>,
}

fn metadata_is_empty(metadata: &serde_json::Value) -> bool {
    match metadata {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Parses a persisted size string; empty means zero.
fn parse_size(value: &str) -> Result<MemorySize> {
    value.parse()
}

fn spec_from_record(name: &str, record: InstanceRecord) -> Result<Option<InstanceSpec>> {
    let mem_size = parse_size(&record.mem_size)?;
    let disk_space = parse_size(&record.disk_space)?;

    // Ghost: a record with nothing in it, left behind by an interrupted
    // write. Dropped rather than resurrected.
    if record.num_cores == 0
        && !record.deleted
        && record.ssh_username.is_empty()
        && metadata_is_empty(&record.metadata)
        && mem_size.in_bytes() == 0
        && disk_space.in_bytes() == 0
    {
        tracing::warn!("Ignoring ghost instance in database: {}", name);
        return Ok(None);
    }

    if !valid_mac_address(&record.mac_addr) {
        return Err(CoreError::invalid_argument(format!(
            "Invalid MAC address {}",
            record.mac_addr
        )));
    }

    let mut extra_interfaces = Vec::with_capacity(record.extra_interfaces.len());
    for iface in record.extra_interfaces {
        if !valid_mac_address(&iface.mac_address) {
            return Err(CoreError::invalid_argument(format!(
                "Invalid MAC address {}",
                iface.mac_address
            )));
        }
        extra_interfaces.push(NetworkInterface {
            id: iface.id,
            mac_address: iface.mac_address,
            auto_mode: iface.auto_mode,
        });
    }

    let mut mounts = HashMap::with_capacity(record.mounts.len());
    for mount in record.mounts {
        let uid_mappings: Vec<IdMap> = mount
            .uid_mappings
            .iter()
            .map(|m| IdMap {
                host_id: m.host_uid,
                instance_id: m.instance_uid,
            })
            .collect();
        let gid_mappings: Vec<IdMap> = mount
            .gid_mappings
            .iter()
            .map(|m| IdMap {
                host_id: m.host_gid,
                instance_id: m.instance_gid,
            })
            .collect();
        mounts.insert(
            mount.target_path,
            VmMount::new(
                mount.source_path,
                &uid_mappings,
                &gid_mappings,
                MountKind::from_code(mount.mount_type),
            ),
        );
    }

    let ssh_username = if record.ssh_username.is_empty() {
        DEFAULT_SSH_USERNAME.to_string()
    } else {
        record.ssh_username
    };

    Ok(Some(InstanceSpec {
        num_cores: record.num_cores,
        mem_size: if record.mem_size.is_empty() {
            DEFAULT_MEMORY_SIZE.parse().unwrap_or_default()
        } else {
            mem_size
        },
        disk_space: if record.disk_space.is_empty() {
            DEFAULT_DISK_SIZE.parse().unwrap_or_default()
        } else {
            disk_space
        },
        default_mac_address: record.mac_addr,
        extra_interfaces,
        ssh_username,
        state: InstanceState::from_code(record.state),
        mounts,
        deleted: record.deleted,
        metadata: record.metadata,
    }))
}

fn record_from_spec(spec: &InstanceSpec) -> InstanceRecord {
    let mut mounts: Vec<MountRecord> = spec
        .mounts
        .iter()
        .map(|(target, mount)| MountRecord {
            source_path: mount.source_path.clone(),
            target_path: target.clone(),
            uid_mappings: mount
                .uid_mappings
                .iter()
                .map(|m| UidMapRecord {
                    host_uid: m.host_id,
                    instance_uid: m.instance_id,
                })
                .collect(),
            gid_mappings: mount
                .gid_mappings
                .iter()
                .map(|m| GidMapRecord {
                    host_gid: m.host_id,
                    instance_gid: m.instance_id,
                })
                .collect(),
            mount_type: mount.kind.code(),
        })
        .collect();
    mounts.sort_by(|a, b| a.target_path.cmp(&b.target_path));

    InstanceRecord {
        num_cores: spec.num_cores,
        mem_size: spec.mem_size.in_bytes().to_string(),
        disk_space: spec.disk_space.in_bytes().to_string(),
        ssh_username: spec.ssh_username.clone(),
        state: spec.state.code(),
        deleted: spec.deleted,
        metadata: spec.metadata.clone(),
        mac_addr: spec.default_mac_address.clone(),
        extra_interfaces: spec
            .extra_interfaces
            .iter()
            .map(|iface| ExtraInterfaceRecord {
                id: iface.id.clone(),
                mac_address: iface.mac_address.clone(),
                auto_mode: iface.auto_mode,
            })
            .collect(),
        mounts,
    }
}

/// Loads the instance registry from the backend data directory, falling back
/// to the legacy location under the cache directory.
///
/// # Errors
///
/// Fails only on an invalid persisted MAC address; everything else degrades
/// to dropped records.
pub fn load_instance_db(
    data_dir: &Path,
    cache_dir: &Path,
) -> Result<HashMap<String, InstanceSpec>> {
    let content = match fs::read_to_string(data_dir.join(INSTANCE_DB_NAME)) {
        Ok(content) => content,
        Err(_) => match fs::read_to_string(cache_dir.join(INSTANCE_DB_NAME)) {
            Ok(content) => content,
            Err(_) => return Ok(HashMap::new()),
        },
    };

    let document: serde_json::Value = match serde_json::from_str(&content) {
        Ok(document) => document,
        Err(e) => {
            tracing::warn!("Discarding unparseable instance database: {}", e);
            return Ok(HashMap::new());
        }
    };

    let Some(records) = document.as_object() else {
        tracing::warn!("Discarding malformed instance database: not an object");
        return Ok(HashMap::new());
    };

    let mut specs = HashMap::with_capacity(records.len());
    for (name, value) in records {
        let record: InstanceRecord = match serde_json::from_value(value.clone()) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Ignoring ghost instance in database: {} ({})", name, e);
                continue;
            }
        };

        if let Some(spec) = spec_from_record(name, record)? {
            specs.insert(name.clone(), spec);
        }
    }

    Ok(specs)
}

/// Writes the whole registry atomically into the backend data directory.
///
/// # Errors
///
/// Returns an error if the directory or the file cannot be written.
pub fn persist_instance_db(specs: &HashMap<String, InstanceSpec>, data_dir: &Path) -> Result<()> {
    fs::create_dir_all(data_dir)?;

    let records: BTreeMap<&str, InstanceRecord> = specs
        .iter()
        .map(|(name, spec)| (name.as_str(), record_from_spec(spec)))
        .collect();

    let content = serde_json::to_string_pretty(&records)
        .map_err(|e| CoreError::internal(format!("failed to serialize instance db: {e}")))?;

    let final_path = data_dir.join(INSTANCE_DB_NAME);
    let tmp_path = data_dir.join(format!("{INSTANCE_DB_NAME}.tmp"));
    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, &final_path)?;

    tracing::debug!(path = %final_path.display(), count = specs.len(), "instance db persisted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_spec() -> InstanceSpec {
        InstanceSpec {
            num_cores: 2,
            mem_size: MemorySize::from_bytes(1 << 30),
            disk_space: MemorySize::from_bytes(5 << 30),
            default_mac_address: "52:54:00:11:22:33".to_string(),
            extra_interfaces: vec![NetworkInterface {
                id: "en0".to_string(),
                mac_address: "52:54:00:44:55:66".to_string(),
                auto_mode: true,
            }],
            ssh_username: "ubuntu".to_string(),
            state: InstanceState::Stopped,
            mounts: HashMap::from([(
                "/home/ubuntu/src".to_string(),
                VmMount::new(
                    "/host/src",
                    &[IdMap {
                        host_id: 1000,
                        instance_id: 1000,
                    }],
                    &[IdMap {
                        host_id: 1000,
                        instance_id: 1000,
                    }],
                    MountKind::Classic,
                ),
            )]),
            deleted: false,
            metadata: serde_json::json!({"arch": "amd64"}),
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let specs = HashMap::from([("primary".to_string(), sample_spec())]);

        persist_instance_db(&specs, temp.path()).unwrap();
        let loaded = load_instance_db(temp.path(), Path::new("/nonexistent")).unwrap();

        assert_eq!(loaded.len(), 1);
        let spec = &loaded["primary"];
        assert_eq!(spec.num_cores, 2);
        assert_eq!(spec.mem_size.in_bytes(), 1 << 30);
        assert_eq!(spec.disk_space.in_bytes(), 5 << 30);
        assert_eq!(spec.default_mac_address, "52:54:00:11:22:33");
        assert_eq!(spec.extra_interfaces.len(), 1);
        assert_eq!(spec.state, InstanceState::Stopped);
        assert_eq!(spec.metadata, serde_json::json!({"arch": "amd64"}));
        let mount = &spec.mounts["/home/ubuntu/src"];
        assert_eq!(mount.source_path, "/host/src");
        assert_eq!(mount.uid_mappings.len(), 1);

        // Saving what was loaded reproduces the document.
        let second = TempDir::new().unwrap();
        persist_instance_db(&loaded, second.path()).unwrap();
        assert_eq!(
            fs::read_to_string(temp.path().join(INSTANCE_DB_NAME)).unwrap(),
            fs::read_to_string(second.path().join(INSTANCE_DB_NAME)).unwrap()
        );
    }

    #[test]
    fn test_missing_database_loads_empty() {
        let temp = TempDir::new().unwrap();
        let loaded = load_instance_db(temp.path(), temp.path()).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_unparseable_database_loads_empty() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(INSTANCE_DB_NAME), "{not json").unwrap();
        let loaded = load_instance_db(temp.path(), temp.path()).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_legacy_cache_location_read() {
        let data = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let specs = HashMap::from([("primary".to_string(), sample_spec())]);
        persist_instance_db(&specs, cache.path()).unwrap();

        let loaded = load_instance_db(data.path(), cache.path()).unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn test_ghost_record_dropped_others_kept() {
        let temp = TempDir::new().unwrap();
        let doc = serde_json::json!({
            "ghost": {
                "num_cores": 0,
                "mem_size": "0",
                "disk_space": "0",
                "ssh_username": "",
                "state": 0,
                "deleted": false,
                "metadata": {},
                "mac_addr": "",
                "extra_interfaces": [],
                "mounts": []
            },
            "real": {
                "num_cores": 1,
                "mem_size": "1073741824",
                "disk_space": "5368709120",
                "ssh_username": "ubuntu",
                "state": 1,
                "deleted": false,
                "metadata": {"k": "v"},
                "mac_addr": "52:54:00:00:00:01",
                "extra_interfaces": [],
                "mounts": []
            }
        });
        fs::write(temp.path().join(INSTANCE_DB_NAME), doc.to_string()).unwrap();

        let loaded = load_instance_db(temp.path(), temp.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("real"));
    }

    #[test]
    fn test_empty_username_defaults_to_ubuntu() {
        let temp = TempDir::new().unwrap();
        let doc = serde_json::json!({
            "primary": {
                "num_cores": 1,
                "mem_size": "1073741824",
                "disk_space": "5368709120",
                "ssh_username": "",
                "state": 1,
                "deleted": false,
                "metadata": {},
                "mac_addr": "52:54:00:00:00:01",
                "extra_interfaces": [],
                "mounts": []
            }
        });
        fs::write(temp.path().join(INSTANCE_DB_NAME), doc.to_string()).unwrap();

        let loaded = load_instance_db(temp.path(), temp.path()).unwrap();
        assert_eq!(loaded["primary"].ssh_username, "ubuntu");
    }

    #[test]
    fn test_missing_sizes_take_defaults() {
        let temp = TempDir::new().unwrap();
        let doc = serde_json::json!({
            "primary": {
                "num_cores": 1,
                "ssh_username": "ubuntu",
                "state": 1,
                "deleted": false,
                "metadata": {},
                "mac_addr": "52:54:00:00:00:01"
            }
        });
        fs::write(temp.path().join(INSTANCE_DB_NAME), doc.to_string()).unwrap();

        let loaded = load_instance_db(temp.path(), temp.path()).unwrap();
        let spec = &loaded["primary"];
        assert_eq!(spec.mem_size.in_bytes(), 1 << 30);
        assert_eq!(spec.disk_space.in_bytes(), 5 << 30);
    }

    #[test]
    fn test_invalid_mac_fails_load() {
        let temp = TempDir::new().unwrap();
        let doc = serde_json::json!({
            "primary": {
                "num_cores": 1,
                "mem_size": "1073741824",
                "disk_space": "5368709120",
                "ssh_username": "ubuntu",
                "state": 1,
                "deleted": false,
                "metadata": {},
                "mac_addr": "not-a-mac",
                "extra_interfaces": [],
                "mounts": []
            }
        });
        fs::write(temp.path().join(INSTANCE_DB_NAME), doc.to_string()).unwrap();

        let err = load_instance_db(temp.path(), temp.path()).unwrap_err();
        assert!(err.to_string().contains("Invalid MAC address"));
    }

    #[test]
    fn test_mount_id_mappings_deduplicated_on_load() {
        let temp = TempDir::new().unwrap();
        let doc = serde_json::json!({
            "primary": {
                "num_cores": 1,
                "mem_size": "1073741824",
                "disk_space": "5368709120",
                "ssh_username": "ubuntu",
                "state": 1,
                "deleted": false,
                "metadata": {},
                "mac_addr": "52:54:00:00:00:01",
                "extra_interfaces": [],
                "mounts": [{
                    "source_path": "/src",
                    "target_path": "/dst",
                    "uid_mappings": [
                        {"host_uid": 1000, "instance_uid": 1},
                        {"host_uid": 1000, "instance_uid": 2}
                    ],
                    "gid_mappings": [],
                    "mount_type": 1
                }]
            }
        });
        fs::write(temp.path().join(INSTANCE_DB_NAME), doc.to_string()).unwrap();

        let loaded = load_instance_db(temp.path(), temp.path()).unwrap();
        let mount = &loaded["primary"].mounts["/dst"];
        assert_eq!(mount.uid_mappings.len(), 1);
        assert_eq!(mount.uid_mappings[0].instance_id, 2);
        assert_eq!(mount.kind, MountKind::Native);
    }
}
