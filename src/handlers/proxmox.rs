//! # Proxmox Handler — LXC containers via `pct`
//!
//! Containers are addressed by VMID on the Proxmox side and by name on
//! ours; the handler allocates VMIDs monotonically from the configured
//! `startVmid` and records the mapping in its registry. Staging uses
//! `pct push`, in-guest execution uses `pct exec`.

use crate::command::{self, VarContext};
use crate::constants::{DEFAULT_REXX_PATH, DEFAULT_START_VMID, PROBE_TIMEOUT, validate_resource_name};
use crate::error::{Error, Result};
use crate::handlers::{
    read_script_file, require_local_binary, target_script_path, temp_script_path, AddressHandler,
    HandlerConfig, Response,
};
use crate::policy::{ResourceLimits, SecurityPolicy};
use crate::process::{ExecSpec, ProcessGateway, ProcessResult};
use crate::resource::{BackendFlavor, ManagedResource, ResourceRegistry, ResourceStatus};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// ADDRESS handler for Proxmox LXC containers.
pub struct ProxmoxHandler {
    gateway: Arc<dyn ProcessGateway>,
    policy: SecurityPolicy,
    registry: ResourceRegistry,
    timeout: Duration,
    next_vmid: AtomicU32,
    node: Option<String>,
    network_bridge: Option<String>,
    default_rexx_binary: Option<String>,
    available: bool,
}

impl ProxmoxHandler {
    /// Creates an uninitialized handler over the given gateway.
    pub fn new(gateway: Arc<dyn ProcessGateway>) -> Self {
        Self {
            gateway,
            policy: SecurityPolicy::default(),
            registry: ResourceRegistry::new(
                "Container",
                "containers",
                crate::constants::DEFAULT_MAX_RESOURCES,
            ),
            timeout: Duration::from_millis(crate::constants::DEFAULT_TIMEOUT_MS),
            next_vmid: AtomicU32::new(DEFAULT_START_VMID),
            node: None,
            network_bridge: None,
            default_rexx_binary: None,
            available: false,
        }
    }

    /// The handler's resource registry.
    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    async fn run(&self, args: Vec<String>) -> Result<ProcessResult> {
        if !self.available {
            return Err(Error::Internal("proxmox handler not initialized".to_string()));
        }
        let spec = ExecSpec::new("pct", args).with_timeout(self.timeout);
        self.gateway.execute(spec).await
    }

    async fn run_lifecycle(&self, operation: &str, args: Vec<String>) -> Result<ProcessResult> {
        let result = self.run(args).await?;
        if result.timed_out {
            return Err(Error::Timeout {
                operation: operation.to_string(),
                duration: self.timeout,
            });
        }
        if result.exit_code != 0 {
            let stderr = if result.stderr.trim().is_empty() {
                result.stdout.trim().to_string()
            } else {
                result.stderr.trim().to_string()
            };
            return Err(Error::OperationFailed {
                operation: operation.to_string(),
                stderr,
            });
        }
        Ok(result)
    }

    async fn vmid_of(&self, name: &str) -> Result<String> {
        Ok(self.registry.get(name).await?.id)
    }

    // =========================================================================
    // Operations
    // =========================================================================

    async fn create(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require("name")?;
        validate_resource_name(name).map_err(|reason| Error::InvalidParameter {
            parameter: "name".to_string(),
            value: format!("{} ({})", name, reason),
        })?;
        let template = cmd.require("template")?;
        self.policy.require_template(template)?;

        let limits = ResourceLimits {
            memory_mb: cmd.get_u64("memory")?,
            cpus: cmd.get_u32("cores")?,
            disk_gb: cmd.get_u64("disk")?,
        };
        self.policy.require_resource_limits(&limits)?;

        self.registry.ensure_capacity().await?;

        let vmid = self.next_vmid.fetch_add(1, Ordering::SeqCst);
        let mut args: Vec<String> = vec![
            "create".into(),
            vmid.to_string(),
            template.to_string(),
            format!("--hostname={}", name),
        ];
        if let Some(mem) = limits.memory_mb {
            args.push("--memory".into());
            args.push(mem.to_string());
        }
        if let Some(cores) = limits.cpus {
            args.push("--cores".into());
            args.push(cores.to_string());
        }
        if let Some(disk) = limits.disk_gb {
            args.push("--rootfs".into());
            args.push(format!("local-lvm:{}", disk));
        }
        if let Some(bridge) = &self.network_bridge {
            args.push("--net0".into());
            args.push(format!("name=eth0,bridge={},ip=dhcp", bridge));
        }

        self.run_lifecycle("Create", args).await?;

        let mut resource = ManagedResource::new(vmid.to_string(), name, BackendFlavor::Proxmox);
        resource.image = Some(template.to_string());
        if let Some(node) = &self.node {
            resource.metadata.insert("node".to_string(), node.clone());
        }
        self.registry.insert(resource).await?;

        info!(container = name, vmid, template, "created LXC container");
        Ok(Response::ok("create")
            .with("vmid", vmid as i64)
            .with("name", name)
            .with("template", template)
            .with("status", ResourceStatus::Created.to_string()))
    }

    async fn start(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require("name")?;
        let vmid = self.vmid_of(name).await?;
        self.run_lifecycle("Start", vec!["start".into(), vmid])
            .await?;
        let resource = self
            .registry
            .update(name, |r| r.status = ResourceStatus::Running)
            .await?;
        info!(container = name, "started LXC container");
        Ok(Response::ok("start")
            .with("name", name)
            .with("status", resource.status.to_string()))
    }

    async fn stop(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require("name")?;
        let vmid = self.vmid_of(name).await?;
        self.run_lifecycle("Stop", vec!["stop".into(), vmid]).await?;
        let resource = self
            .registry
            .update(name, |r| r.status = ResourceStatus::Stopped)
            .await?;
        info!(container = name, "stopped LXC container");
        Ok(Response::ok("stop")
            .with("name", name)
            .with("status", resource.status.to_string()))
    }

    async fn destroy(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require_any(&["name", "container"])?;
        let force = cmd.get_bool("force");
        let resource = self.registry.get(name).await?;
        if resource.status == ResourceStatus::Running {
            if !force {
                return Err(Error::InvalidState {
                    kind: "Container".to_string(),
                    name: name.to_string(),
                    state: resource.status.to_string(),
                    expected: "stopped (or force=true)".to_string(),
                });
            }
            self.run_lifecycle("Destroy", vec!["stop".into(), resource.id.clone()])
                .await?;
        }
        self.run_lifecycle("Destroy", vec!["destroy".into(), resource.id.clone()])
            .await?;
        self.registry.remove(name).await?;

        info!(container = name, vmid = %resource.id, "destroyed LXC container");
        Ok(Response::ok("destroy")
            .with("name", name)
            .with("vmid", resource.id)
            .with("removed", true))
    }

    async fn list(&self) -> Result<Response> {
        let result = self.run_lifecycle("List", vec!["list".into()]).await?;
        let tracked = self.registry.list().await;
        let containers =
            serde_json::to_value(&tracked).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Response::ok("list")
            .with("containers", containers)
            .with("count", tracked.len() as i64)
            .with("backendOutput", result.stdout.trim()))
    }

    async fn status(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require_any(&["name", "container"])?;
        let resource = self.registry.get(name).await?;
        let result = self
            .run_lifecycle("Status", vec!["status".into(), resource.id.clone()])
            .await?;
        Ok(Response::ok("status")
            .with("name", name)
            .with("vmid", resource.id)
            .with("status", result.stdout.trim())
            .with("registryStatus", resource.status.to_string()))
    }

    async fn logs(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require_any(&["name", "container"])?;
        let vmid = self.vmid_of(name).await?;
        let tail = cmd.get_u64("tail")?.unwrap_or(50);
        // pct has no log verb; read the journal inside the guest.
        let result = self
            .run(vec![
                "exec".into(),
                vmid,
                "--".into(),
                "journalctl".into(),
                "-n".into(),
                tail.to_string(),
                "--no-pager".into(),
            ])
            .await?;
        Ok(Response::ok("logs")
            .with("name", name)
            .with("logs", result.stdout))
    }

    async fn deploy_rexx(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require("container")?;
        let vmid = self.vmid_of(name).await?;

        let binary = match cmd.get("rexx_binary") {
            Some(path) => path.to_string(),
            None => self
                .default_rexx_binary
                .clone()
                .ok_or_else(|| Error::MissingParameter {
                    operation: "deploy_rexx".to_string(),
                    parameter: "rexx_binary".to_string(),
                })?,
        };
        require_local_binary(&binary).await?;
        let target_path = cmd.get("target").unwrap_or(DEFAULT_REXX_PATH).to_string();

        self.run_lifecycle(
            "Deploy",
            vec![
                "push".into(),
                vmid.clone(),
                binary.clone(),
                target_path.clone(),
            ],
        )
        .await?;
        self.run_lifecycle(
            "Deploy",
            vec![
                "exec".into(),
                vmid,
                "--".into(),
                "chmod".into(),
                "+x".into(),
                target_path.clone(),
            ],
        )
        .await?;

        self.registry
            .update(name, |r| {
                r.has_rexx = true;
                r.rexx_path = Some(target_path.clone());
            })
            .await?;

        info!(container = name, path = %target_path, "deployed RexxJS binary");
        Ok(Response::ok("deploy_rexx")
            .with("container", name)
            .with("rexxPath", target_path)
            .with("hasRexx", true))
    }

    async fn execute(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require_any(&["container", "name"])?;
        let guest_cmd = cmd.require("command")?;
        let vmid = self.vmid_of(name).await?;

        let result = self
            .run(vec![
                "exec".into(),
                vmid,
                "--".into(),
                "sh".into(),
                "-c".into(),
                guest_cmd.to_string(),
            ])
            .await?;
        self.translate_execution("execute", name, result)
    }

    async fn execute_script(&self, name: &str, script: &str) -> Result<Response> {
        let resource = self.registry.get(name).await?;
        let vmid = resource.id.clone();
        let rexx_path = resource
            .rexx_path
            .unwrap_or_else(|| DEFAULT_REXX_PATH.to_string());

        let host_path = temp_script_path();
        tokio::fs::write(&host_path, script).await?;
        let guest_path = target_script_path(&host_path);

        let outcome = self
            .run_staged(&vmid, &host_path, &guest_path, &rexx_path)
            .await;

        if let Err(e) = tokio::fs::remove_file(&host_path).await {
            warn!(path = %host_path.display(), error = %e, "failed to remove host temp script");
        }
        match self
            .run(vec![
                "exec".into(),
                vmid,
                "--".into(),
                "rm".into(),
                "-f".into(),
                guest_path.clone(),
            ])
            .await
        {
            Ok(r) if r.exit_code != 0 => {
                warn!(container = name, path = %guest_path, "failed to remove staged script")
            }
            Err(e) => warn!(container = name, error = %e, "cleanup exec failed"),
            _ => {}
        }

        self.translate_execution("execute_rexx", name, outcome?)
    }

    async fn run_staged(
        &self,
        vmid: &str,
        host_path: &Path,
        guest_path: &str,
        rexx_path: &str,
    ) -> Result<ProcessResult> {
        self.run_lifecycle(
            "Execute",
            vec![
                "push".into(),
                vmid.to_string(),
                host_path.to_string_lossy().into_owned(),
                guest_path.to_string(),
            ],
        )
        .await?;
        self.run(vec![
            "exec".into(),
            vmid.to_string(),
            "--".into(),
            rexx_path.to_string(),
            guest_path.to_string(),
        ])
        .await
    }

    fn translate_execution(
        &self,
        operation: &str,
        name: &str,
        result: ProcessResult,
    ) -> Result<Response> {
        if result.timed_out {
            return Err(Error::Timeout {
                operation: operation.to_string(),
                duration: self.timeout,
            });
        }
        if result.exit_code == 0 {
            Ok(Response::ok(operation)
                .with("container", name)
                .with("output", result.stdout)
                .with("exitCode", 0))
        } else {
            debug!(
                container = name,
                exit_code = result.exit_code,
                "guest script exited nonzero"
            );
            Ok(
                Response::execution_failure(operation, result.exit_code, &result.stderr)
                    .with("container", name)
                    .with("output", result.stdout),
            )
        }
    }
}

#[async_trait]
impl AddressHandler for ProxmoxHandler {
    fn name(&self) -> &str {
        "proxmox"
    }

    fn flavor(&self) -> BackendFlavor {
        BackendFlavor::Proxmox
    }

    async fn initialize(&mut self, config: HandlerConfig) -> Result<()> {
        self.policy = config.build_policy();
        self.timeout = config.timeout();
        if let Some(max) = config.max_containers {
            self.registry.set_max(max);
        }
        if let Some(start) = config.start_vmid {
            self.next_vmid = AtomicU32::new(start);
        }
        self.node = config.proxmox_node.clone();
        self.network_bridge = config.network_bridge.clone();
        self.default_rexx_binary = config.rexx_binary_path.clone();

        let probe = ExecSpec::new("pct", ["--version"]).with_timeout(PROBE_TIMEOUT);
        match self.gateway.execute(probe).await {
            Ok(result) if result.is_success() => {
                info!("pct available");
                self.available = true;
                Ok(())
            }
            Ok(result) => Err(Error::OperationFailed {
                operation: "Proxmox runtime detection".to_string(),
                stderr: format!(
                    "pct probe exited {}: {}",
                    result.exit_code,
                    result.stderr.trim()
                ),
            }),
            Err(Error::SpawnFailed { reason, .. }) => Err(Error::OperationFailed {
                operation: "Proxmox runtime detection".to_string(),
                stderr: format!("pct not available: {}", reason),
            }),
            Err(e) => Err(e),
        }
    }

    async fn handle_message(&self, raw: &str, ctx: &VarContext) -> Result<Response> {
        let mut cmd = command::parse(raw)?;
        cmd.interpolate(ctx);
        debug!(operation = %cmd.operation, "proxmox handler dispatch");

        match cmd.operation.as_str() {
            "create" => self.create(&cmd).await,
            "start" => self.start(&cmd).await,
            "stop" => self.stop(&cmd).await,
            "destroy" | "remove" => self.destroy(&cmd).await,
            "list" => self.list().await,
            "status" => self.status(&cmd).await,
            "logs" => self.logs(&cmd).await,
            "deploy_rexx" | "deploy_binary" => self.deploy_rexx(&cmd).await,
            "execute" => self.execute(&cmd).await,
            "execute_rexx" => {
                let name = cmd.require("container")?.to_string();
                let script = cmd.require("script")?.to_string();
                self.execute_script(&name, &script).await
            }
            "execute_file" => {
                let name = cmd.require("container")?.to_string();
                let file = cmd.require("file")?;
                let script = read_script_file(file).await?;
                self.execute_script(&name, &script).await
            }
            other => Err(Error::UnknownOperation(other.to_string())),
        }
    }
}
