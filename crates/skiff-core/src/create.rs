//! The instance creation pipeline.
//!
//! Create and launch share one path: validate the request, settle on a name,
//! reserve it in the preparing set, resolve the image (blueprint or raw),
//! size the disk, settle network identities on a tentative MAC set, emit the
//! cloud-init documents, prepare the instance image, and only then commit the
//! new record. Launch additionally starts the instance and awaits readiness.

use crate::cloudinit;
use crate::config::{
    DaemonConfig, BRIDGED_INTERFACE_KEY, BRIDGED_NETWORK_NAME, CLOUD_INIT_ISO_NAME,
    DEFAULT_CPU_CORES, DEFAULT_DISK_SIZE, DEFAULT_MEMORY_SIZE, DEFAULT_TIMEOUT, MIN_CPU_CORES,
    MIN_DISK_SIZE, MIN_MEMORY_SIZE,
};
use crate::daemon::Daemon;
use crate::error::{CoreError, Result};
use crate::hypervisor::{
    ClientLaunchData, NetworkInterfaceInfo, ProgressMonitor, Query, QueryType,
    VirtualMachineDescription, VmImage,
};
use crate::mac::generate_unused_mac_address;
use crate::selection::{find_instance_and_react, REQUIRE_MISSING};
use crate::spec::{InstanceSpec, InstanceState, MemorySize, NetworkInterface};
use crate::validation::{valid_hostname, valid_mac_address};
use skiff_protocol::{
    CreateReply, CreateRequest, ErrorDetail, LaunchError, LaunchProgress, NetworkMode, ReplyTx,
    Status, StatusCode,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Releases for which automatic network configuration is not available.
const NO_BRIDGING_RELEASE: [&str; 26] = [
    "10.04", "lucid", "11.10", "oneiric", "12.04", "precise", "12.10", "quantal", "13.04",
    "raring", "13.10", "saucy", "14.04", "trusty", "14.10", "utopic", "15.04", "vivid", "15.10",
    "wily", "16.04", "xenial", "16.10", "yakkety", "17.04", "zesty",
];

/// Remoteless images that likewise exclude automatic configuration.
const NO_BRIDGING_REMOTELESS: [&str; 2] = ["core", "core16"];

const NAME_GENERATION_RETRIES: usize = 100;

/// The request's arguments after validation.
pub(crate) struct CheckedArguments {
    pub mem_size: MemorySize,
    pub disk_space: Option<MemorySize>,
    pub instance_name: String,
    pub extra_interfaces: Vec<NetworkInterface>,
    pub nets_need_bridging: Vec<String>,
    pub option_errors: Vec<LaunchError>,
}

fn try_mem_size(value: &str) -> Option<MemorySize> {
    value.parse().ok()
}

/// Whether the image's release excludes automatically configured interfaces.
fn bridging_excluded(image: &str, remote: &str) -> bool {
    if remote.is_empty() {
        NO_BRIDGING_REMOTELESS.contains(&image) || NO_BRIDGING_RELEASE.contains(&image)
    } else {
        (remote == "release" || remote == "daily") && NO_BRIDGING_RELEASE.contains(&image)
    }
}

fn validate_extra_interfaces(
    request: &CreateRequest,
    config: &DaemonConfig,
    nets_need_bridging: &mut Vec<String>,
    option_errors: &mut Vec<LaunchError>,
) -> Result<Vec<NetworkInterface>> {
    let mut interfaces = Vec::with_capacity(request.network_options.len());

    // The back-end is only consulted when networks were actually requested.
    let factory_networks: Vec<NetworkInterfaceInfo> = if request.network_options.is_empty() {
        Vec::new()
    } else {
        match config.factory.networks() {
            Ok(networks) => networks,
            Err(CoreError::Unsupported(_)) => {
                return Err(CoreError::Unsupported("bridging".to_string()))
            }
            Err(e) => return Err(e),
        }
    };

    let specified_image = if request.remote_name.is_empty() {
        request.image.clone()
    } else {
        format!("{}:{}", request.remote_name, request.image)
    };
    let dont_allow_auto = bridging_excluded(&request.image, &request.remote_name);

    for net in &request.network_options {
        let mut net_id = net.id.clone();

        if net_id == BRIDGED_NETWORK_NAME {
            let bridged_id = config.settings.get(BRIDGED_INTERFACE_KEY).unwrap_or_default();
            if bridged_id.is_empty() {
                return Err(CoreError::invalid_argument(format!(
                    "You have to set {BRIDGED_INTERFACE_KEY} to use the \"{BRIDGED_NETWORK_NAME}\" shortcut."
                )));
            }
            net_id = bridged_id;
        }

        if dont_allow_auto && net.mode == NetworkMode::Auto {
            return Err(CoreError::invalid_argument(format!(
                "Automatic network configuration not available for {specified_image}. \
                 Consider using manual mode."
            )));
        }

        match factory_networks.iter().find(|info| info.id == net_id) {
            None => {
                if net.id == BRIDGED_NETWORK_NAME {
                    return Err(CoreError::invalid_argument(format!(
                        "Invalid network '{net_id}' set as bridged interface, set \
                         {BRIDGED_INTERFACE_KEY} to correct it."
                    )));
                }
                tracing::warn!("Invalid network name \"{}\"", net_id);
                option_errors.push(LaunchError::InvalidNetwork);
            }
            Some(info) if info.needs_authorization => nets_need_bridging.push(info.id.clone()),
            Some(_) => {}
        }

        let mac = net.mac_address.to_ascii_lowercase();
        if mac.is_empty() || valid_mac_address(&mac) {
            interfaces.push(NetworkInterface {
                id: net_id,
                mac_address: mac,
                auto_mode: net.mode != NetworkMode::Manual,
            });
        } else {
            tracing::warn!("Invalid MAC address \"{}\"", mac);
            option_errors.push(LaunchError::InvalidNetwork);
        }
    }

    Ok(interfaces)
}

pub(crate) fn validate_create_arguments(
    request: &CreateRequest,
    config: &DaemonConfig,
) -> Result<CheckedArguments> {
    let min_mem: MemorySize = MIN_MEMORY_SIZE.parse().unwrap_or_default();
    let min_disk: MemorySize = MIN_DISK_SIZE.parse().unwrap_or_default();

    let mut option_errors = Vec::new();

    let mem_request = if request.mem_size.is_empty() {
        DEFAULT_MEMORY_SIZE
    } else {
        &request.mem_size
    };
    let mem_size = match try_mem_size(mem_request) {
        Some(size) if size >= min_mem => size,
        _ => {
            option_errors.push(LaunchError::InvalidMemSize);
            MemorySize::default()
        }
    };

    // No disk request means "let the image decide" further down the line.
    let mut disk_space = None;
    if !request.disk_space.is_empty() {
        match try_mem_size(&request.disk_space) {
            Some(size) if size >= min_disk => disk_space = Some(size),
            _ => option_errors.push(LaunchError::InvalidDiskSize),
        }
    }

    if !request.instance_name.is_empty() && !valid_hostname(&request.instance_name) {
        option_errors.push(LaunchError::InvalidHostname);
    }

    let mut nets_need_bridging = Vec::new();
    let extra_interfaces = validate_extra_interfaces(
        request,
        config,
        &mut nets_need_bridging,
        &mut option_errors,
    )?;

    Ok(CheckedArguments {
        mem_size,
        disk_space,
        instance_name: request.instance_name.clone(),
        extra_interfaces,
        nets_need_bridging,
        option_errors,
    })
}

/// Settles the instance name: requested, then blueprint-derived, then
/// generated with a bounded number of retries against the used set.
pub(crate) fn name_from(
    requested_name: &str,
    blueprint_name: &str,
    generator: &dyn crate::hypervisor::NameGenerator,
    currently_used: &HashSet<String>,
) -> Result<String> {
    if !requested_name.is_empty() {
        return Ok(requested_name.to_string());
    }
    if !blueprint_name.is_empty() {
        return Ok(blueprint_name.to_string());
    }

    for _ in 0..NAME_GENERATION_RETRIES {
        let name = generator.make_name();
        if !currently_used.contains(&name) {
            return Ok(name);
        }
    }
    Err(CoreError::invalid_argument(
        "unable to generate a unique name",
    ))
}

pub(crate) fn timeout_for(requested_secs: i32, blueprint_secs: i32) -> Duration {
    if requested_secs > 0 {
        Duration::from_secs(requested_secs as u64)
    } else if blueprint_secs > 0 {
        Duration::from_secs(blueprint_secs as u64)
    } else {
        DEFAULT_TIMEOUT
    }
}

/// Builds the raw image query for a non-blueprint request.
pub(crate) fn query_from(request: &CreateRequest, name: &str) -> Result<Query> {
    if !request.remote_name.is_empty() && request.image.is_empty() {
        return Err(CoreError::invalid_argument(
            "Must specify an image when specifying a remote",
        ));
    }

    let image = if request.image.is_empty() {
        "default".to_string()
    } else {
        request.image.clone()
    };

    let query_type = if image.starts_with("file") {
        QueryType::LocalFile
    } else if image.starts_with("http") {
        QueryType::HttpDownload
    } else {
        QueryType::Alias
    };

    Ok(Query {
        name: name.to_string(),
        release: image,
        remote_name: request.remote_name.clone(),
        query_type,
    })
}

/// Computes the final disk size for an image.
///
/// With no request, the larger of the built-in default and the image
/// minimum; a requested size below the image minimum fails, as does a
/// filesystem without room for the image.
pub(crate) fn compute_final_image_size(
    image_size: MemorySize,
    requested: Option<MemorySize>,
    available: MemorySize,
) -> Result<MemorySize> {
    let disk_space = match requested {
        None => {
            let default_disk: MemorySize = DEFAULT_DISK_SIZE.parse().unwrap_or_default();
            default_disk.max(image_size)
        }
        Some(size) if size < image_size => {
            return Err(CoreError::invalid_argument(format!(
                "Requested disk ({} bytes) below minimum for this image ({} bytes)",
                size.in_bytes(),
                image_size.in_bytes()
            )));
        }
        Some(size) => size,
    };

    if available < image_size {
        return Err(CoreError::invalid_argument(format!(
            "Available disk ({} bytes) below minimum for this image ({} bytes)",
            available.in_bytes(),
            image_size.in_bytes()
        )));
    }

    if available < disk_space {
        tracing::warn!(
            "Reserving more disk space ({} bytes) than available ({} bytes)",
            disk_space.in_bytes(),
            available.in_bytes()
        );
    }

    Ok(disk_space)
}

/// Free bytes on the filesystem holding `path`.
pub(crate) fn filesystem_bytes_available(path: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(|e| {
        CoreError::internal(format!(
            "Failed to determine information about the volume containing {}: {}",
            path.display(),
            e
        ))
    })?;
    #[allow(clippy::unnecessary_cast)] // fsblkcnt_t differs across platforms
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// Rebuilds a factory description from a persisted spec (reconciliation).
pub(crate) fn description_from_spec(
    name: &str,
    spec: &InstanceSpec,
    image: &VmImage,
) -> VirtualMachineDescription {
    VirtualMachineDescription {
        num_cores: spec.num_cores,
        mem_size: spec.mem_size,
        disk_space: spec.disk_space,
        name: name.to_string(),
        default_mac_address: spec.default_mac_address.clone(),
        extra_interfaces: spec.extra_interfaces.clone(),
        ssh_username: spec.ssh_username.clone(),
        image: image.clone(),
        cloud_init_iso: image.instance_directory().join(CLOUD_INIT_ISO_NAME),
        ..VirtualMachineDescription::default()
    }
}

fn spec_from_description(desc: &VirtualMachineDescription) -> InstanceSpec {
    InstanceSpec {
        num_cores: desc.num_cores,
        mem_size: desc.mem_size,
        disk_space: desc.disk_space,
        default_mac_address: desc.default_mac_address.clone(),
        extra_interfaces: desc.extra_interfaces.clone(),
        ssh_username: desc.ssh_username.clone(),
        state: InstanceState::Off,
        mounts: HashMap::new(),
        deleted: false,
        metadata: serde_json::Value::Object(serde_json::Map::new()),
    }
}

impl Daemon {
    /// Creates an instance without starting it.
    pub async fn create(&self, request: CreateRequest, reply: &ReplyTx<CreateReply>) -> Status {
        self.create_vm(request, reply, false).await
    }

    /// Creates an instance, starts it, and waits for readiness.
    pub async fn launch(&self, request: CreateRequest, reply: &ReplyTx<CreateReply>) -> Status {
        self.create_vm(request, reply, true).await
    }

    async fn create_vm(
        &self,
        request: CreateRequest,
        reply: &ReplyTx<CreateReply>,
        start: bool,
    ) -> Status {
        let inner = &self.inner;

        let checked = match validate_create_arguments(&request, &inner.config) {
            Ok(checked) => checked,
            Err(e) => return e.to_status(),
        };

        if !checked.option_errors.is_empty() {
            return Status::new(StatusCode::InvalidArgument, "Invalid arguments supplied")
                .with_details(ErrorDetail::Launch(checked.option_errors));
        }

        if !checked.nets_need_bridging.is_empty() && !request.permission_to_bridge {
            reply.send(CreateReply {
                nets_need_bridging: checked.nets_need_bridging,
                ..CreateReply::default()
            });
            return Status::new(StatusCode::FailedPrecondition, "Missing bridges");
        }

        let blueprint_name = inner
            .config
            .blueprint_provider
            .name_from_blueprint(&request.image)
            .unwrap_or_default();

        // Reserve the name before any slow work.
        let name = {
            let mut state = inner.lock_state();

            let used: HashSet<String> = state.operative.keys().cloned().collect();
            let name = match name_from(
                &checked.instance_name,
                &blueprint_name,
                inner.config.name_generator.as_ref(),
                &used,
            ) {
                Ok(name) => name,
                Err(e) => return e.to_status(),
            };

            let (_trail, status) =
                find_instance_and_react(&state.operative, &state.deleted, &name, &REQUIRE_MISSING);
            if !status.is_ok() {
                return status;
            }

            if state.preparing.contains(&name) {
                return Status::new(
                    StatusCode::InvalidArgument,
                    format!("instance \"{name}\" is being prepared"),
                );
            }
            state.preparing.insert(name.clone());
            name
        };

        if !inner.instances_running() {
            if let Err(e) = inner.config.factory.hypervisor_health_check() {
                inner.lock_state().preparing.remove(&name);
                return e.to_status();
            }
        }

        let timeout = timeout_for(
            request.timeout_secs,
            inner.config.blueprint_provider.blueprint_timeout(&blueprint_name),
        );

        let prepared = self.prepare_instance(&request, &checked, &name, reply).await;

        let (desc, launch_data) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.rollback_create(&name);
                return Status::new(StatusCode::FailedPrecondition, e.to_string());
            }
        };

        // Commit: record the spec, construct the handle, release the name.
        {
            let mut state = inner.lock_state();
            state.specs.insert(name.clone(), spec_from_description(&desc));
        }
        match inner
            .config
            .factory
            .create_virtual_machine(&desc, inner.observer_ref())
        {
            Ok(vm) => {
                let mut state = inner.lock_state();
                state.operative.insert(name.clone(), vm);
                state.preparing.remove(&name);
                inner.persist_locked(&state);
            }
            Err(e) => {
                self.rollback_create(&name);
                return Status::new(StatusCode::FailedPrecondition, e.to_string());
            }
        }

        if !start {
            return Status::ok();
        }

        reply.send(CreateReply::message(format!("Starting {name}")));

        let vm = inner.lock_state().operative.get(&name).cloned();
        let Some(vm) = vm else {
            return Status::new(StatusCode::Internal, "instance vanished during launch");
        };

        if let Err(e) = vm.start().await {
            // A start failure after commit aborts the launch and withdraws
            // the instance.
            let status = match &e {
                CoreError::Start { .. } => Status::new(StatusCode::Aborted, e.to_string()),
                _ => Status::new(StatusCode::FailedPrecondition, e.to_string()),
            };
            if let Err(release_err) = inner.release_resources(&name) {
                tracing::warn!("Failed to release '{}': {}", name, release_err);
            }
            inner.lock_state().operative.remove(&name);
            inner.persist_instances();
            return status;
        }

        let status = inner
            .wait_for_ready_all(
                std::slice::from_ref(&name),
                timeout,
                true,
                Some(reply.clone()),
                String::new(),
            )
            .await;

        let mut final_reply = CreateReply {
            vm_instance_name: name.clone(),
            workspaces_to_be_created: launch_data.workspaces_to_be_created.clone(),
            ..CreateReply::default()
        };
        for alias in &launch_data.aliases_to_be_created {
            tracing::debug!("Adding alias '{}' to the reply", alias.name);
            final_reply.aliases_to_be_created.push(alias.clone());
        }
        for workspace in &launch_data.workspaces_to_be_created {
            tracing::debug!("Adding workspace '{}' to the reply", workspace);
        }
        reply.send(final_reply);

        status
    }

    /// Rolls a failed create back: the name leaves the preparing set, any
    /// partial resources are released, and a half-committed entry is erased.
    fn rollback_create(&self, name: &str) {
        let inner = &self.inner;
        inner.lock_state().preparing.remove(name);
        if let Err(e) = inner.release_resources(name) {
            tracing::warn!("Failed to release '{}': {}", name, e);
        }
        inner.lock_state().operative.remove(name);
        inner.persist_instances();
    }

    /// The slow middle of the pipeline: image, disk size, network
    /// identities, cloud-init documents, and back-end preparation.
    async fn prepare_instance(
        &self,
        request: &CreateRequest,
        checked: &CheckedArguments,
        name: &str,
        reply: &ReplyTx<CreateReply>,
    ) -> Result<(VirtualMachineDescription, ClientLaunchData)> {
        let inner = &self.inner;
        let config = &inner.config;

        reply.send(CreateReply::message(format!("Creating {name}")));

        let mut desc = VirtualMachineDescription {
            num_cores: request.num_cores,
            mem_size: request.mem_size.parse().unwrap_or_default(),
            disk_space: request.disk_space.parse().unwrap_or_default(),
            name: name.to_string(),
            ssh_username: config.ssh_username.clone(),
            vendor_data: cloudinit::make_vendor_config(
                config.ssh_key_provider.as_ref(),
                &config.ssh_username,
                &config.factory.backend_version_string(),
                &request.image,
                &request.remote_name,
                &request.time_zone,
            ),
            ..VirtualMachineDescription::default()
        };

        let mut launch_data = ClientLaunchData::default();

        // Blueprint resolution; a miss falls back to a raw image query.
        let image = &request.image;
        let blueprint_query = if image.starts_with("file://")
            && (image.to_lowercase().ends_with(".yaml") || image.to_lowercase().ends_with(".yml"))
        {
            let path = image.trim_start_matches("file://");
            let stem = Path::new(path)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            Some(
                config
                    .blueprint_provider
                    .blueprint_from_file(path, stem, &mut desc, &mut launch_data)
                    .await?,
            )
        } else {
            config
                .blueprint_provider
                .fetch_blueprint_for(image, &mut desc, &mut launch_data)
                .await?
        };

        let query = match blueprint_query {
            Some(mut query) => {
                query.name = name.to_string();

                // Blueprint aliases and workspaces are named after the
                // blueprint; follow a user-chosen name.
                if name != image {
                    for alias in &mut launch_data.aliases_to_be_created {
                        if alias.instance == *image {
                            tracing::trace!(
                                "Renaming instance on alias \"{}\" from \"{}\" to \"{}\"",
                                alias.name,
                                alias.instance,
                                name
                            );
                            alias.instance = name.to_string();
                        }
                    }
                    for workspace in &mut launch_data.workspaces_to_be_created {
                        if workspace == image {
                            tracing::trace!("Renaming workspace \"{}\" to \"{}\"", workspace, name);
                            *workspace = name.to_string();
                        }
                    }
                }
                query
            }
            None => {
                desc.mem_size = checked.mem_size;
                query_from(request, name)?
            }
        };

        let progress_reply = reply.clone();
        let monitor: ProgressMonitor = Box::new(move |kind, percentage| {
            progress_reply.send(CreateReply {
                launch_progress: Some(LaunchProgress {
                    kind,
                    percent_complete: percentage.to_string(),
                }),
                ..CreateReply::default()
            });
            true
        });

        let checksum = if desc.image.id.is_empty() {
            None
        } else {
            Some(desc.image.id.clone())
        };

        reply.send(CreateReply::message(format!("Preparing image for {name}")));
        let vm_image = config
            .vault
            .fetch_image(&query, &monitor, checksum.as_deref())
            .await?;

        let image_size = config.vault.minimum_image_size_for(&vm_image.id)?;
        let requested_disk = if desc.disk_space.in_bytes() > 0 {
            Some(desc.disk_space)
        } else {
            checked.disk_space
        };
        let available =
            MemorySize::from_bytes(filesystem_bytes_available(&config.data_directory)?);
        desc.disk_space = compute_final_image_size(image_size, requested_disk, available)?;

        reply.send(CreateReply::message(format!("Configuring {name}")));

        let mut extra_interfaces = checked.extra_interfaces.clone();
        config.factory.prepare_networking(&mut extra_interfaces)?;

        // Settle MACs on a tentative copy of the allocation set; the global
        // set is replaced only after the whole create path succeeds.
        let mut new_macs = inner.lock_state().allocated_macs.clone();

        for iface in &extra_interfaces {
            if !iface.mac_address.is_empty() && !new_macs.insert(iface.mac_address.clone()) {
                return Err(CoreError::invalid_argument(format!(
                    "Repeated MAC address {}",
                    iface.mac_address
                )));
            }
        }
        // Second pass, so generation cannot collide with requested MACs.
        for iface in &mut extra_interfaces {
            if iface.mac_address.is_empty() {
                iface.mac_address = generate_unused_mac_address(&mut new_macs)?;
            }
        }
        desc.default_mac_address = generate_unused_mac_address(&mut new_macs)?;
        desc.extra_interfaces = extra_interfaces;

        desc.meta_data = cloudinit::make_meta_config(name);
        desc.user_data = if request.cloud_init_user_data.is_empty() {
            serde_yaml::Value::Null
        } else {
            serde_yaml::from_str(&request.cloud_init_user_data).map_err(|e| {
                CoreError::invalid_argument(format!("Invalid cloud-init user data: {e}"))
            })?
        };
        cloudinit::prepare_user_data(&mut desc.user_data, &desc.vendor_data);

        if desc.num_cores < MIN_CPU_CORES {
            desc.num_cores = DEFAULT_CPU_CORES;
        }

        desc.network_data =
            cloudinit::make_network_config(&desc.default_mac_address, &desc.extra_interfaces);

        desc.cloud_init_iso = vm_image.instance_directory().join(CLOUD_INIT_ISO_NAME);
        desc.image = vm_image;

        config.factory.configure(&mut desc)?;
        let prepared_image = desc.image.clone();
        config
            .factory
            .prepare_instance_image(&prepared_image, &desc)
            .await?;

        // Everything went well; adopt the tentative MAC set.
        inner.lock_state().allocated_macs = new_macs;

        Ok((desc, launch_data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_final_image_size_defaults_to_max_of_default_and_image() {
        let gib = 1024 * 1024 * 1024;
        let available = MemorySize::from_bytes(100 * gib);

        let small_image = MemorySize::from_bytes(2 * gib);
        let size = compute_final_image_size(small_image, None, available).unwrap();
        assert_eq!(size.in_bytes(), 5 * gib);

        let large_image = MemorySize::from_bytes(8 * gib);
        let size = compute_final_image_size(large_image, None, available).unwrap();
        assert_eq!(size.in_bytes(), 8 * gib);
    }

    #[test]
    fn test_compute_final_image_size_rejects_small_requests() {
        let gib = 1024 * 1024 * 1024;
        let err = compute_final_image_size(
            MemorySize::from_bytes(8 * gib),
            Some(MemorySize::from_bytes(4 * gib)),
            MemorySize::from_bytes(100 * gib),
        )
        .unwrap_err();
        assert!(err.to_string().contains("below minimum for this image"));
    }

    #[test]
    fn test_compute_final_image_size_rejects_full_filesystem() {
        let gib = 1024 * 1024 * 1024;
        let err = compute_final_image_size(
            MemorySize::from_bytes(8 * gib),
            None,
            MemorySize::from_bytes(2 * gib),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Available disk"));
    }

    #[test]
    fn test_query_from_classifies_references() {
        let mut request = CreateRequest {
            image: "file:///tmp/img.qcow2".to_string(),
            ..CreateRequest::default()
        };
        assert_eq!(
            query_from(&request, "vm").unwrap().query_type,
            QueryType::LocalFile
        );

        request.image = "https://example.test/img".to_string();
        assert_eq!(
            query_from(&request, "vm").unwrap().query_type,
            QueryType::HttpDownload
        );

        request.image = "jammy".to_string();
        request.remote_name = "daily".to_string();
        let query = query_from(&request, "vm").unwrap();
        assert_eq!(query.query_type, QueryType::Alias);
        assert_eq!(query.remote_name, "daily");

        request.image = String::new();
        request.remote_name = String::new();
        assert_eq!(query_from(&request, "vm").unwrap().release, "default");

        request.remote_name = "daily".to_string();
        assert!(query_from(&request, "vm").is_err());
    }

    #[test]
    fn test_timeout_for_precedence() {
        assert_eq!(timeout_for(10, 20), Duration::from_secs(10));
        assert_eq!(timeout_for(0, 20), Duration::from_secs(20));
        assert_eq!(timeout_for(0, 0), DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_bridging_exclusions() {
        assert!(bridging_excluded("xenial", ""));
        assert!(bridging_excluded("core", ""));
        assert!(bridging_excluded("xenial", "release"));
        assert!(bridging_excluded("xenial", "daily"));
        assert!(!bridging_excluded("xenial", "custom"));
        assert!(!bridging_excluded("jammy", ""));
    }
}
