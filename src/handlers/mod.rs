//! Backend handlers — the polymorphic seam of the crate.
//!
//! One [`AddressHandler`] implementation exists per backend flavor:
//!
//! - [`ContainerHandler`]: podman with docker fallback
//! - [`NspawnHandler`]: systemd-nspawn machines via machinectl
//! - [`ProxmoxHandler`]: Proxmox LXC containers via `pct`
//! - [`RemoteShellHandler`]: remote hosts over ssh/scp
//!
//! The orchestrator depends only on the trait and never branches on the
//! concrete type outside handler construction. Every operation follows
//! the same control flow: parse + interpolate → verify required
//! parameters → security policy checks → capacity check → build the
//! backend argument vector → invoke the process gateway → translate the
//! result → update the registry only on confirmed success.

mod container;
mod nspawn;
mod proxmox;
mod remote;

pub use container::ContainerHandler;
pub use nspawn::NspawnHandler;
pub use proxmox::ProxmoxHandler;
pub use remote::RemoteShellHandler;

use crate::command::VarContext;
use crate::error::{Error, Result};
use crate::policy::{SecurityMode, SecurityPolicy};
use crate::resource::BackendFlavor;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Configuration
// =============================================================================

/// Recognized initialization options, shared across handler flavors.
///
/// Each handler reads the subset it recognizes and ignores the rest.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HandlerConfig {
    /// Validation strictness; defaults to moderate.
    pub security_mode: Option<SecurityMode>,
    /// Capacity limit for container-flavor registries.
    pub max_containers: Option<usize>,
    /// Capacity limit for the nspawn machine registry.
    pub max_machines: Option<usize>,
    /// Capacity limit for the remote-shell connection registry.
    pub max_connections: Option<usize>,
    /// Default process timeout in milliseconds.
    pub default_timeout: Option<u64>,
    /// Strict-mode image allow-list.
    pub allowed_images: Vec<String>,
    /// Strict-mode template allow-list.
    pub allowed_templates: Vec<String>,
    /// Strict-mode host allow-list.
    pub allowed_hosts: Vec<String>,
    /// Strict-mode volume host-path allow-list.
    pub allowed_volumes: Vec<String>,
    /// Strict-mode path allow-list.
    pub allowed_paths: Vec<String>,
    /// Bridge device for Proxmox network configuration.
    pub network_bridge: Option<String>,
    /// Machine image directory for the nspawn flavor.
    pub machines_path: Option<String>,
    /// First VMID allocated by a Proxmox handler instance. Accepts both
    /// the `startVmid` and `startVMID` spellings.
    #[serde(alias = "startVMID")]
    pub start_vmid: Option<u32>,
    /// Proxmox node name recorded in resource metadata.
    pub proxmox_node: Option<String>,
    /// Local path of the RexxJS binary used by default for deployment.
    pub rexx_binary_path: Option<String>,
}

impl HandlerConfig {
    /// Builds a [`SecurityPolicy`] from the config's mode and allow-lists.
    pub fn build_policy(&self) -> SecurityPolicy {
        SecurityPolicy::new(self.security_mode.unwrap_or(SecurityMode::Moderate))
            .with_allowed_images(self.allowed_images.iter().cloned())
            .with_allowed_templates(self.allowed_templates.iter().cloned())
            .with_allowed_hosts(self.allowed_hosts.iter().cloned())
            .with_allowed_volumes(self.allowed_volumes.iter().cloned())
            .with_allowed_paths(self.allowed_paths.iter().cloned())
    }

    /// Default process timeout as a [`std::time::Duration`].
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(
            self.default_timeout
                .unwrap_or(crate::constants::DEFAULT_TIMEOUT_MS),
        )
    }
}

// =============================================================================
// Responses
// =============================================================================

/// Structured result of a handled operation.
///
/// Always carries `success` plus operation-specific fields. Script
/// execution failures are returned this way (success = false with
/// `exitCode`/`stderr`) rather than thrown: a failing guest script is an
/// expected outcome, not a handler fault.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Response {
    /// Whether the operation's business outcome succeeded.
    pub success: bool,
    /// Operation name the response belongs to.
    pub operation: String,
    /// Operation-specific fields, flattened into the serialized object.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Response {
    /// A successful response for `operation`.
    pub fn ok(operation: impl Into<String>) -> Self {
        Self {
            success: true,
            operation: operation.into(),
            fields: Map::new(),
        }
    }

    /// A script-execution failure carried as data.
    pub fn execution_failure(operation: impl Into<String>, exit_code: i32, stderr: &str) -> Self {
        Self {
            success: false,
            operation: operation.into(),
            fields: Map::new(),
        }
        .with("exitCode", exit_code)
        .with("stderr", stderr)
    }

    /// Attaches a field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Reads a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Reads a string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Reads an integer field.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(Value::as_i64)
    }

    /// Reads a boolean field.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_bool)
    }
}

// =============================================================================
// Handler Trait
// =============================================================================

/// A pluggable backend the scripting runtime dispatches environment
/// commands to.
///
/// # Contract
///
/// - `initialize` applies recognized options and performs one-time
///   environment detection (tool probing); it must be called exactly once
///   before `handle_message`.
/// - `handle_message` parses the command, validates parameters and policy,
///   invokes the external tool through the process gateway, and updates
///   the handler's registry only on confirmed success.
///
/// # Thread Safety
///
/// Implementations are `Send + Sync`; registries use interior
/// synchronization so `handle_message` takes `&self`.
#[async_trait]
pub trait AddressHandler: Send + Sync {
    /// Handler name for logs and responses.
    fn name(&self) -> &str;

    /// Concrete backend flavor (fixed after initialization).
    fn flavor(&self) -> BackendFlavor;

    /// Applies configuration and probes the environment.
    async fn initialize(&mut self, config: HandlerConfig) -> Result<()>;

    /// Dispatches one command string with its interpolation context.
    async fn handle_message(&self, raw: &str, ctx: &VarContext) -> Result<Response>;
}

// =============================================================================
// Shared Helpers
// =============================================================================

static SCRIPT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Allocates a uniquely-named host temp path for an inline script.
///
/// Uniqueness comes from the process id plus a monotonic counter, so
/// concurrent executions within one process never collide.
pub(crate) fn temp_script_path() -> PathBuf {
    let seq = SCRIPT_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "rexxrun-script-{}-{}.rexx",
        std::process::id(),
        seq
    ))
}

/// In-target path an uploaded script lands at.
pub(crate) fn target_script_path(host_path: &std::path::Path) -> String {
    let file_name = host_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "script.rexx".to_string());
    format!("{}/{}", crate::constants::TARGET_SCRIPT_DIR, file_name)
}

/// Splits `ports="8080:80,9090:90"` into `(host, container)` pairs.
pub(crate) fn parse_ports(spec: &str) -> Result<Vec<(String, String)>> {
    spec.split(',')
        .filter(|p| !p.trim().is_empty())
        .map(|pair| {
            pair.trim()
                .split_once(':')
                .map(|(h, c)| (h.to_string(), c.to_string()))
                .ok_or_else(|| Error::InvalidParameter {
                    parameter: "ports".to_string(),
                    value: pair.to_string(),
                })
        })
        .collect()
}

/// Splits `volumes="/h:/c:ro,/a:/b"` into raw mount specs, returning the
/// host path of each for policy checks.
pub(crate) fn parse_volumes(spec: &str) -> Result<Vec<(String, String)>> {
    spec.split(',')
        .filter(|v| !v.trim().is_empty())
        .map(|mount| {
            let mount = mount.trim();
            match mount.split(':').next() {
                Some(host) if !host.is_empty() => Ok((host.to_string(), mount.to_string())),
                _ => Err(Error::InvalidParameter {
                    parameter: "volumes".to_string(),
                    value: mount.to_string(),
                }),
            }
        })
        .collect()
}

/// Verifies the local RexxJS binary exists before a deploy attempt.
pub(crate) async fn require_local_binary(path: &str) -> Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(Error::NotFound {
            kind: "RexxJS binary".to_string(),
            name: path.to_string(),
        }),
    }
}

/// Reads a host script file as UTF-8 for file-based execution.
pub(crate) async fn read_script_file(path: &str) -> Result<String> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => {}
        _ => {
            return Err(Error::NotFound {
                kind: "Script file".to_string(),
                name: path.to_string(),
            })
        }
    }
    Ok(tokio::fs::read_to_string(path).await?)
}
