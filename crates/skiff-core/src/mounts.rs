//! Mount coordination.
//!
//! The daemon keeps one target→handler sub-map per instance, mirroring the
//! `mounts` map of each spec. Handlers are polymorphic over the mount kind:
//! classic mounts are driven through a guest session by the daemon, native
//! mounts are delegated to the hypervisor back-end.

use crate::error::{CoreError, Result};
use crate::hypervisor::{GuestSessionFactory, VirtualMachine};
use crate::spec::VmMount;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// One active (or activatable) mount of an instance.
#[async_trait]
pub trait MountHandler: Send + Sync {
    /// Makes the mount effective in the guest.
    async fn activate(&self) -> Result<()>;

    /// Tears the mount down. With `force`, failures are swallowed.
    async fn deactivate(&self, force: bool) -> Result<()>;

    /// True when activation and deactivation are performed by the hypervisor
    /// back-end rather than by the daemon.
    fn is_managed_by_backend(&self) -> bool;
}

/// Classic mount handler: drives the guest-side mount over a shell session.
pub struct ClassicMountHandler {
    vm: Arc<dyn VirtualMachine>,
    sessions: Arc<dyn GuestSessionFactory>,
    target: String,
    mount: VmMount,
}

impl ClassicMountHandler {
    #[must_use]
    pub fn new(
        vm: Arc<dyn VirtualMachine>,
        sessions: Arc<dyn GuestSessionFactory>,
        target: &str,
        mount: VmMount,
    ) -> Self {
        Self {
            vm,
            sessions,
            target: target.to_string(),
            mount,
        }
    }
}

#[async_trait]
impl MountHandler for ClassicMountHandler {
    async fn activate(&self) -> Result<()> {
        let mut session = self
            .sessions
            .open(
                &self.vm.ssh_hostname(),
                self.vm.ssh_port(),
                &self.vm.ssh_username(),
            )
            .await?;

        let probe = session.run("which sshfs").await?;
        if probe.exit_code != Some(0) {
            return Err(CoreError::SshfsMissing {
                instance: self.vm.name().to_string(),
            });
        }

        let output = session
            .run(&format!(
                "sudo mkdir -p '{target}' && sudo mount -t fuse.sshfs '{source}' '{target}'",
                source = self.mount.source_path,
                target = self.target,
            ))
            .await?;
        if output.exit_code != Some(0) {
            return Err(CoreError::invalid_argument(format!(
                "mounting \"{}\" in the instance failed: {}",
                self.target,
                output.stderr.trim()
            )));
        }

        tracing::debug!(
            target = %self.target,
            instance = self.vm.name(),
            "mount activated"
        );
        Ok(())
    }

    async fn deactivate(&self, force: bool) -> Result<()> {
        let result = async {
            let mut session = self
                .sessions
                .open(
                    &self.vm.ssh_hostname(),
                    self.vm.ssh_port(),
                    &self.vm.ssh_username(),
                )
                .await?;
            let output = session
                .run(&format!("sudo umount '{}'", self.target))
                .await?;
            if output.exit_code != Some(0) {
                return Err(CoreError::invalid_argument(format!(
                    "unmounting \"{}\" in the instance failed: {}",
                    self.target,
                    output.stderr.trim()
                )));
            }
            Ok(())
        }
        .await;

        match result {
            Err(e) if force => {
                tracing::warn!(
                    target = %self.target,
                    instance = self.vm.name(),
                    "forced deactivation failed: {}",
                    e
                );
                Ok(())
            }
            other => other,
        }
    }

    fn is_managed_by_backend(&self) -> bool {
        false
    }
}

/// Per-instance mount handler tables.
///
/// Invariant: a `(name, target)` pair exists here iff it exists in the
/// corresponding spec's mounts map (handlers may trail briefly while an
/// operation is installing or removing them under the daemon lock).
#[derive(Default)]
pub struct MountRegistry {
    handlers: HashMap<String, HashMap<String, Arc<dyn MountHandler>>>,
}

impl MountRegistry {
    /// Installs a handler for `(name, target)`, replacing any previous one.
    pub fn insert(&mut self, name: &str, target: &str, handler: Arc<dyn MountHandler>) {
        self.handlers
            .entry(name.to_string())
            .or_default()
            .insert(target.to_string(), handler);
    }

    /// Removes the handler for `(name, target)`.
    pub fn remove(&mut self, name: &str, target: &str) -> Option<Arc<dyn MountHandler>> {
        self.handlers.get_mut(name).and_then(|m| m.remove(target))
    }

    /// Drops every handler of an instance.
    pub fn clear_instance(&mut self, name: &str) {
        self.handlers.remove(name);
    }

    /// Returns the handler for `(name, target)`, if installed.
    #[must_use]
    pub fn get(&self, name: &str, target: &str) -> Option<Arc<dyn MountHandler>> {
        self.handlers.get(name).and_then(|m| m.get(target)).cloned()
    }

    /// True when `(name, target)` has a handler installed.
    #[must_use]
    pub fn contains(&self, name: &str, target: &str) -> bool {
        self.handlers
            .get(name)
            .is_some_and(|m| m.contains_key(target))
    }

    /// Returns `(target, handler)` pairs for an instance.
    #[must_use]
    pub fn handlers_for(&self, name: &str) -> Vec<(String, Arc<dyn MountHandler>)> {
        self.handlers
            .get(name)
            .map(|m| m.iter().map(|(t, h)| (t.clone(), h.clone())).collect())
            .unwrap_or_default()
    }

    /// Returns the installed target paths for an instance.
    #[must_use]
    pub fn targets_for(&self, name: &str) -> Vec<String> {
        self.handlers
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler {
        managed: bool,
    }

    #[async_trait]
    impl MountHandler for NoopHandler {
        async fn activate(&self) -> Result<()> {
            Ok(())
        }

        async fn deactivate(&self, _force: bool) -> Result<()> {
            Ok(())
        }

        fn is_managed_by_backend(&self) -> bool {
            self.managed
        }
    }

    #[test]
    fn test_registry_insert_get_remove() {
        let mut registry = MountRegistry::default();
        registry.insert("vm1", "/mnt/a", Arc::new(NoopHandler { managed: false }));
        registry.insert("vm1", "/mnt/b", Arc::new(NoopHandler { managed: true }));

        assert!(registry.contains("vm1", "/mnt/a"));
        assert!(!registry.contains("vm2", "/mnt/a"));
        assert_eq!(registry.handlers_for("vm1").len(), 2);

        assert!(registry.remove("vm1", "/mnt/a").is_some());
        assert!(!registry.contains("vm1", "/mnt/a"));
        assert!(registry.remove("vm1", "/mnt/a").is_none());
    }

    #[test]
    fn test_registry_clear_instance() {
        let mut registry = MountRegistry::default();
        registry.insert("vm1", "/mnt/a", Arc::new(NoopHandler { managed: false }));
        registry.clear_instance("vm1");
        assert!(registry.handlers_for("vm1").is_empty());
    }
}
