//! Cloud-init document construction.
//!
//! The creation pipeline emits four YAML documents for every new instance:
//! vendor data (key material, timezone, provenance records), meta data
//! (identity), user data (client-supplied, lightly adjusted), and network
//! data (DHCP configuration for auto extra interfaces).
//!
//! Guests provisioned by earlier multipass installations carry these exact
//! document shapes, including the provenance strings; they must not change.

use crate::config::{host_version, version_string};
use crate::hypervisor::SshKeyProvider;
use crate::spec::NetworkInterface;
use serde_yaml::{Mapping, Value};

fn yaml_str(value: impl Into<String>) -> Value {
    Value::String(value.into())
}

/// Normalizes an image reference into the provenance alias written to the
/// guest: plain aliases pass through, URLs and files collapse to their kind.
fn provenance_alias(image: &str) -> &str {
    if image.is_empty() {
        "default"
    } else if image.starts_with("http") {
        "http"
    } else if image.starts_with("file") {
        "file"
    } else {
        image
    }
}

/// Builds the vendor-data document.
///
/// Injects the daemon's public key, sets timezone and default user, and
/// appends a provenance record under `/etc/pollinate/add-user-agent`.
#[must_use]
pub fn make_vendor_config(
    key_provider: &dyn SshKeyProvider,
    username: &str,
    backend_version: &str,
    image: &str,
    remote_name: &str,
    time_zone: &str,
) -> Value {
    let ssh_key_line = format!(
        "ssh-rsa {} {}@localhost",
        key_provider.public_key_as_base64(),
        username
    );

    let remote_prefix = if remote_name.is_empty() {
        String::new()
    } else {
        format!("{remote_name}:")
    };
    let user_agent = format!(
        "multipass/version/{} # written by Multipass\n\
         multipass/driver/{} # written by Multipass\n\
         multipass/host/{} # written by Multipass\n\
         multipass/alias/{}{} # written by Multipass\n",
        version_string(),
        backend_version,
        host_version(),
        remote_prefix,
        provenance_alias(image),
    );

    let mut default_user = Mapping::new();
    default_user.insert(yaml_str("name"), yaml_str(username));
    let mut system_info = Mapping::new();
    system_info.insert(yaml_str("default_user"), Value::Mapping(default_user));

    let mut user_agent_file = Mapping::new();
    user_agent_file.insert(yaml_str("path"), yaml_str("/etc/pollinate/add-user-agent"));
    user_agent_file.insert(yaml_str("content"), yaml_str(user_agent));

    let mut config = Mapping::new();
    config.insert(
        yaml_str("ssh_authorized_keys"),
        Value::Sequence(vec![yaml_str(ssh_key_line)]),
    );
    config.insert(yaml_str("timezone"), yaml_str(time_zone));
    config.insert(yaml_str("system_info"), Value::Mapping(system_info));
    config.insert(
        yaml_str("write_files"),
        Value::Sequence(vec![Value::Mapping(user_agent_file)]),
    );

    Value::Mapping(config)
}

/// Builds the meta-data document identifying the instance.
#[must_use]
pub fn make_meta_config(name: &str) -> Value {
    let mut meta = Mapping::new();
    meta.insert(yaml_str("instance-id"), yaml_str(name));
    meta.insert(yaml_str("local-hostname"), yaml_str(name));
    meta.insert(yaml_str("cloud-name"), yaml_str("multipass"));
    Value::Mapping(meta)
}

/// Builds the network-data document.
///
/// Emitted only when at least one extra interface wants automatic
/// configuration; otherwise the document is empty (null).
#[must_use]
pub fn make_network_config(
    default_mac_address: &str,
    extra_interfaces: &[NetworkInterface],
) -> Value {
    if !extra_interfaces.iter().any(|iface| iface.auto_mode) {
        return Value::Null;
    }

    let mut ethernets = Mapping::new();

    let mut default_match = Mapping::new();
    default_match.insert(yaml_str("macaddress"), yaml_str(default_mac_address));
    let mut default_eth = Mapping::new();
    default_eth.insert(yaml_str("match"), Value::Mapping(default_match));
    default_eth.insert(yaml_str("dhcp4"), Value::Bool(true));
    ethernets.insert(yaml_str("default"), Value::Mapping(default_eth));

    for (i, iface) in extra_interfaces.iter().enumerate() {
        if !iface.auto_mode {
            continue;
        }

        let mut iface_match = Mapping::new();
        iface_match.insert(yaml_str("macaddress"), yaml_str(&iface.mac_address));

        // The default gateway stays with the first interface.
        let mut overrides = Mapping::new();
        overrides.insert(yaml_str("route-metric"), Value::Number(200.into()));

        let mut eth = Mapping::new();
        eth.insert(yaml_str("match"), Value::Mapping(iface_match));
        eth.insert(yaml_str("dhcp4"), Value::Bool(true));
        eth.insert(yaml_str("dhcp4-overrides"), Value::Mapping(overrides));
        // Optional, so the guest's network target does not wait for it.
        eth.insert(yaml_str("optional"), Value::Bool(true));

        ethernets.insert(yaml_str(format!("extra{i}")), Value::Mapping(eth));
    }

    let mut network = Mapping::new();
    network.insert(yaml_str("version"), yaml_str("2"));
    network.insert(yaml_str("ethernets"), Value::Mapping(ethernets));
    Value::Mapping(network)
}

/// Adjusts user-supplied user data to coexist with the vendor document.
///
/// A `users` sequence gets `default` appended; an `ssh_authorized_keys`
/// sequence gets the first vendor key appended.
pub fn prepare_user_data(user_data: &mut Value, vendor_config: &Value) {
    if let Some(users) = user_data.get_mut("users").and_then(Value::as_sequence_mut) {
        users.push(yaml_str("default"));
    }

    if let Some(keys) = user_data
        .get_mut("ssh_authorized_keys")
        .and_then(Value::as_sequence_mut)
    {
        if let Some(vendor_key) = vendor_config
            .get("ssh_authorized_keys")
            .and_then(|k| k.get(0))
        {
            keys.push(vendor_key.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedKeys;

    impl SshKeyProvider for FixedKeys {
        fn public_key_as_base64(&self) -> String {
            "AAAAtestkey".to_string()
        }

        fn private_key_as_base64(&self) -> String {
            "cHJpdmF0ZQ==".to_string()
        }
    }

    fn iface(mac: &str, auto_mode: bool) -> NetworkInterface {
        NetworkInterface {
            id: "en0".to_string(),
            mac_address: mac.to_string(),
            auto_mode,
        }
    }

    #[test]
    fn test_vendor_config_contents() {
        let config = make_vendor_config(&FixedKeys, "ubuntu", "qemu-8.0", "jammy", "", "UTC");

        let keys = config["ssh_authorized_keys"].as_sequence().unwrap();
        assert_eq!(
            keys[0].as_str().unwrap(),
            "ssh-rsa AAAAtestkey ubuntu@localhost"
        );
        assert_eq!(config["timezone"].as_str().unwrap(), "UTC");
        assert_eq!(
            config["system_info"]["default_user"]["name"].as_str().unwrap(),
            "ubuntu"
        );

        let write_files = config["write_files"].as_sequence().unwrap();
        assert_eq!(
            write_files[0]["path"].as_str().unwrap(),
            "/etc/pollinate/add-user-agent"
        );
        let content = write_files[0]["content"].as_str().unwrap();
        assert!(content.contains("multipass/driver/qemu-8.0 # written by Multipass\n"));
        assert!(content.contains("multipass/alias/jammy # written by Multipass\n"));
    }

    #[test]
    fn test_vendor_alias_normalization() {
        let config = make_vendor_config(&FixedKeys, "ubuntu", "v", "", "", "UTC");
        let content = config["write_files"][0]["content"].as_str().unwrap();
        assert!(content.contains("multipass/alias/default #"));

        let config = make_vendor_config(&FixedKeys, "ubuntu", "v", "http://x/img", "", "UTC");
        let content = config["write_files"][0]["content"].as_str().unwrap();
        assert!(content.contains("multipass/alias/http #"));

        let config = make_vendor_config(&FixedKeys, "ubuntu", "v", "jammy", "daily", "UTC");
        let content = config["write_files"][0]["content"].as_str().unwrap();
        assert!(content.contains("multipass/alias/daily:jammy #"));
    }

    #[test]
    fn test_meta_config() {
        let meta = make_meta_config("primary");
        assert_eq!(meta["instance-id"].as_str().unwrap(), "primary");
        assert_eq!(meta["local-hostname"].as_str().unwrap(), "primary");
        assert_eq!(meta["cloud-name"].as_str().unwrap(), "multipass");
    }

    #[test]
    fn test_network_config_empty_without_auto_interfaces() {
        assert!(make_network_config("52:54:00:00:00:01", &[]).is_null());
        assert!(
            make_network_config("52:54:00:00:00:01", &[iface("52:54:00:00:00:02", false)])
                .is_null()
        );
    }

    #[test]
    fn test_network_config_with_auto_interface() {
        let network = make_network_config(
            "52:54:00:12:34:56",
            &[iface("52:54:00:de:ad:be", true)],
        );

        assert_eq!(network["version"].as_str().unwrap(), "2");
        let ethernets = &network["ethernets"];
        assert_eq!(
            ethernets["default"]["match"]["macaddress"].as_str().unwrap(),
            "52:54:00:12:34:56"
        );
        assert!(ethernets["default"]["dhcp4"].as_bool().unwrap());
        assert_eq!(
            ethernets["extra0"]["match"]["macaddress"].as_str().unwrap(),
            "52:54:00:de:ad:be"
        );
        assert!(ethernets["extra0"]["dhcp4"].as_bool().unwrap());
        assert_eq!(
            ethernets["extra0"]["dhcp4-overrides"]["route-metric"]
                .as_i64()
                .unwrap(),
            200
        );
        assert!(ethernets["extra0"]["optional"].as_bool().unwrap());
    }

    #[test]
    fn test_network_config_extra_index_follows_position() {
        let network = make_network_config(
            "52:54:00:00:00:01",
            &[
                iface("52:54:00:00:00:02", false),
                iface("52:54:00:00:00:03", true),
            ],
        );
        let ethernets = network["ethernets"].as_mapping().unwrap();
        assert!(ethernets.contains_key(yaml_str("extra1")));
        assert!(!ethernets.contains_key(yaml_str("extra0")));
    }

    #[test]
    fn test_prepare_user_data_appends() {
        let vendor = make_vendor_config(&FixedKeys, "ubuntu", "v", "jammy", "", "UTC");
        let mut user_data: Value = serde_yaml::from_str(
            "users:\n  - name: dev\nssh_authorized_keys:\n  - ssh-rsa AAAA dev@host\n",
        )
        .unwrap();

        prepare_user_data(&mut user_data, &vendor);

        let users = user_data["users"].as_sequence().unwrap();
        assert_eq!(users.last().unwrap().as_str().unwrap(), "default");
        let keys = user_data["ssh_authorized_keys"].as_sequence().unwrap();
        assert_eq!(
            keys.last().unwrap().as_str().unwrap(),
            "ssh-rsa AAAAtestkey ubuntu@localhost"
        );
    }

    #[test]
    fn test_prepare_user_data_leaves_scalars_alone() {
        let vendor = make_vendor_config(&FixedKeys, "ubuntu", "v", "jammy", "", "UTC");
        let mut user_data: Value = serde_yaml::from_str("package_update: true\n").unwrap();
        prepare_user_data(&mut user_data, &vendor);
        assert!(user_data.get("users").is_none());
    }
}
