//! Managed resources and the per-handler resource registry.
//!
//! Each backend handler instance owns one [`ResourceRegistry`]: an
//! in-memory map of the containers, machines, or connections it manages.
//! The registry is a cache of backend-reported truth, not authoritative —
//! it is mutated only strictly after the corresponding external process
//! reports success, and can go stale if resources are altered outside
//! this system. The `list` operation exists to resynchronize display
//! state against the backend; it does not auto-repair the registry.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Concrete backend implementation behind a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendFlavor {
    /// Containers via the podman CLI.
    Podman,
    /// Containers via the docker CLI.
    Docker,
    /// Machines via systemd-nspawn / machinectl.
    Nspawn,
    /// LXC containers via Proxmox `pct`.
    Proxmox,
    /// Remote hosts over ssh/scp.
    RemoteShell,
}

impl std::fmt::Display for BackendFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Podman => write!(f, "podman"),
            Self::Docker => write!(f, "docker"),
            Self::Nspawn => write!(f, "nspawn"),
            Self::Proxmox => write!(f, "proxmox"),
            Self::RemoteShell => write!(f, "remote_shell"),
        }
    }
}

/// Lifecycle state of a managed resource.
///
/// ```text
/// created →(start)→ running →(stop)→ stopped →(start)→ running
/// stopped →(destroy)→ removed      running →(destroy, force)→ removed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// Backend create call succeeded; not yet started.
    Created,
    /// Resource is running (or connection is established).
    Running,
    /// Resource is stopped but still present.
    Stopped,
    /// Resource has been destroyed; terminal.
    Destroyed,
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// A container, VM, machine, or SSH connection tracked by a handler.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResource {
    /// Backend-assigned or locally-assigned identifier (container ID,
    /// vmid, machine name, `user@host`).
    pub id: String,
    /// Unique key within one handler instance.
    pub name: String,
    /// Current lifecycle status.
    pub status: ResourceStatus,
    /// Which backend implementation owns this resource.
    pub flavor: BackendFlavor,
    /// Image or template the resource was created from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Bound port mappings (`host:container`).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    /// Volume mounts (`host:container[:ro]`).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    /// True once the RexxJS interpreter has been deployed into the target.
    pub has_rexx: bool,
    /// In-target path of the deployed interpreter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rexx_path: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Flavor-specific details (node, user, key path, bridge).
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl ManagedResource {
    /// Creates a resource record in the `Created` state.
    pub fn new(id: impl Into<String>, name: impl Into<String>, flavor: BackendFlavor) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: ResourceStatus::Created,
            flavor,
            image: None,
            ports: Vec::new(),
            volumes: Vec::new(),
            has_rexx: false,
            rexx_path: None,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}

/// In-memory registry of managed resources, owned by one handler instance.
///
/// Enforces the per-instance capacity limit and the rule that no mutating
/// operation targets a destroyed resource. Thread-safe; handlers share
/// `&self` across concurrent operations.
pub struct ResourceRegistry {
    /// Singular label for not-found messages ("Container", "Connection").
    kind: &'static str,
    /// Plural label for capacity messages ("containers", "connections").
    kind_plural: &'static str,
    max: usize,
    entries: RwLock<HashMap<String, ManagedResource>>,
}

impl ResourceRegistry {
    /// Creates a registry with the given labels and capacity.
    pub fn new(kind: &'static str, kind_plural: &'static str, max: usize) -> Self {
        Self {
            kind,
            kind_plural,
            max,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Replaces the capacity limit (during handler initialization only).
    pub fn set_max(&mut self, max: usize) {
        self.max = max;
    }

    /// Configured capacity limit.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Fails with the canonical capacity error if the registry is full.
    ///
    /// Called by resource-creating operations before any process spawn.
    pub async fn ensure_capacity(&self) -> Result<()> {
        let entries = self.entries.read().await;
        if entries.len() >= self.max {
            return Err(Error::CapacityExceeded {
                kind: self.kind_plural.to_string(),
                max: self.max,
            });
        }
        Ok(())
    }

    /// Inserts a resource after a confirmed backend success.
    ///
    /// Capacity and uniqueness are re-checked under the write lock.
    pub async fn insert(&self, resource: ManagedResource) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.max {
            return Err(Error::CapacityExceeded {
                kind: self.kind_plural.to_string(),
                max: self.max,
            });
        }
        if entries.contains_key(&resource.name) {
            return Err(Error::AlreadyExists {
                kind: self.kind.to_string(),
                name: resource.name,
            });
        }
        entries.insert(resource.name.clone(), resource);
        Ok(())
    }

    /// Returns a snapshot of a resource by name.
    pub async fn get(&self, name: &str) -> Result<ManagedResource> {
        let entries = self.entries.read().await;
        entries.get(name).cloned().ok_or_else(|| Error::NotFound {
            kind: self.kind.to_string(),
            name: name.to_string(),
        })
    }

    /// Mutates a resource after a confirmed backend success.
    ///
    /// Destroyed resources reject all mutation.
    pub async fn update<F>(&self, name: &str, mutate: F) -> Result<ManagedResource>
    where
        F: FnOnce(&mut ManagedResource),
    {
        let mut entries = self.entries.write().await;
        let resource = entries.get_mut(name).ok_or_else(|| Error::NotFound {
            kind: self.kind.to_string(),
            name: name.to_string(),
        })?;
        if resource.status == ResourceStatus::Destroyed {
            return Err(Error::InvalidState {
                kind: self.kind.to_string(),
                name: name.to_string(),
                state: ResourceStatus::Destroyed.to_string(),
                expected: "not destroyed".to_string(),
            });
        }
        mutate(resource);
        Ok(resource.clone())
    }

    /// Removes a resource after a confirmed backend destroy.
    pub async fn remove(&self, name: &str) -> Result<ManagedResource> {
        let mut entries = self.entries.write().await;
        entries.remove(name).ok_or_else(|| Error::NotFound {
            kind: self.kind.to_string(),
            name: name.to_string(),
        })
    }

    /// Number of tracked resources.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// True if nothing is tracked.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// True if `name` is tracked.
    pub async fn contains(&self, name: &str) -> bool {
        self.entries.read().await.contains_key(name)
    }

    /// Snapshot of all tracked resources.
    pub async fn list(&self) -> Vec<ManagedResource> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Snapshot of all tracked names.
    pub async fn names(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Removes every entry, returning how many were removed.
    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.write().await;
        let count = entries.len();
        entries.clear();
        count
    }
}
