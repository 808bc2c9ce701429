use crate::error::CoreError;
use crate::host_config::HostConfig;
use crate::permissions::PermissionGuard;
use crate::registry::KeyRegistry;
use crate::store::Store;
use keywright_keychain::DocumentSeal;
use std::path::{Path, PathBuf};

/// Filesystem locations a [`KeyContext`] works against.
#[derive(Clone, Debug)]
pub struct ContextPaths {
    pub ssh_dir: PathBuf,
    pub ssh_config: PathBuf,
    pub state_dir: PathBuf,
}

impl ContextPaths {
    /// `<root>/.ssh`, `<root>/.ssh/config` and `<root>/state`.
    pub fn under(root: &Path) -> Self {
        let ssh_dir = root.join(".ssh");
        Self {
            ssh_config: ssh_dir.join("config"),
            ssh_dir,
            state_dir: root.join("state"),
        }
    }
}

/// Everything the lifecycle controller mutates, built once per process.
#[derive(Debug)]
pub struct KeyContext {
    pub store: Store,
    pub registry: KeyRegistry,
    pub guard: PermissionGuard,
    pub hosts: HostConfig,
}

impl KeyContext {
    pub fn new(store: Store, registry: KeyRegistry, hosts: HostConfig) -> Self {
        Self {
            store,
            registry,
            guard: PermissionGuard::new(),
            hosts,
        }
    }

    pub fn open(paths: &ContextPaths, seal: Option<DocumentSeal>) -> Result<Self, CoreError> {
        let store = Store::open(&paths.state_dir, seal)?;
        let mut registry = KeyRegistry::new(&paths.ssh_dir);
        registry.refresh(&store)?;
        Ok(Self::new(store, registry, HostConfig::new(&paths.ssh_config)))
    }

    pub fn refresh(&mut self) -> Result<(), CoreError> {
        self.registry.refresh(&self.store)
    }
}
