//! # Container Handler — podman/docker backend
//!
//! Implements [`AddressHandler`] over a local container CLI. During
//! initialization the handler probes `podman --version` and falls back to
//! `docker --version`, selecting the first candidate whose probe exits
//! zero; both CLIs share the argument vocabulary used here.
//!
//! ## Operations
//!
//! | Operation      | Backend invocation                                  |
//! |----------------|-----------------------------------------------------|
//! | `create`       | `run -d --name X [--memory Ym] [--cpus C] ... IMAGE`|
//! | `start`/`stop` | `start X` / `stop X`                                |
//! | `remove`       | `rm [-f] X`                                         |
//! | `list`         | `ps -a --format {{.Names}}`                         |
//! | `status`       | `inspect --format {{.State.Status}} X`              |
//! | `logs`         | `logs [--tail N] X`                                 |
//! | `deploy_rexx`  | `cp BIN X:PATH` then `exec X chmod +x PATH`         |
//! | `execute`      | `exec X sh -c CMD`                                  |
//! | `execute_rexx` | stage script, `cp`, `exec X rexx PATH`, cleanup     |
//! | `execute_file` | read host file, then the `execute_rexx` sequence    |
//!
//! Lifecycle operations throw on nonzero exit; script execution returns
//! nonzero exit as data. Registry updates happen only after the backend
//! confirms success.

use crate::command::{self, VarContext};
use crate::constants::{DEFAULT_REXX_PATH, PROBE_TIMEOUT, validate_resource_name};
use crate::error::{Error, Result};
use crate::handlers::{
    parse_ports, parse_volumes, read_script_file, require_local_binary, target_script_path,
    temp_script_path, AddressHandler, HandlerConfig, Response,
};
use crate::policy::{ResourceLimits, SecurityPolicy};
use crate::process::{ExecSpec, ProcessGateway, ProcessResult};
use crate::resource::{BackendFlavor, ManagedResource, ResourceRegistry, ResourceStatus};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Candidate container CLIs, probed in order.
const RUNTIME_CANDIDATES: &[(&str, BackendFlavor)] =
    &[("podman", BackendFlavor::Podman), ("docker", BackendFlavor::Docker)];

/// ADDRESS handler for podman/docker containers.
pub struct ContainerHandler {
    gateway: Arc<dyn ProcessGateway>,
    policy: SecurityPolicy,
    registry: ResourceRegistry,
    runtime_bin: Option<String>,
    flavor: BackendFlavor,
    timeout: Duration,
    default_rexx_binary: Option<String>,
}

impl ContainerHandler {
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
            runtime_bin: None,
            flavor: BackendFlavor::Podman,
            timeout: Duration::from_millis(crate::constants::DEFAULT_TIMEOUT_MS),
            default_rexx_binary: None,
        }
    }

    /// The handler's resource registry (for orchestrator introspection).
    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    fn bin(&self) -> Result<&str> {
        self.runtime_bin
            .as_deref()
            .ok_or_else(|| Error::Internal("container handler not initialized".to_string()))
    }

    async fn run(&self, args: Vec<String>) -> Result<ProcessResult> {
        let spec = ExecSpec::new(self.bin()?, args).with_timeout(self.timeout);
        self.gateway.execute(spec).await
    }

    /// Runs a lifecycle-affecting call: timeout and nonzero exit are thrown.
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

    // =========================================================================
    // Operations
    // =========================================================================

    async fn create(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require("name")?;
        validate_resource_name(name).map_err(|reason| Error::InvalidParameter {
            parameter: "name".to_string(),
            value: format!("{} ({})", name, reason),
        })?;
        let image = cmd.require("image")?;
        self.policy.require_image(image)?;

        let limits = ResourceLimits {
            memory_mb: cmd.get_u64("memory")?,
            cpus: cmd.get_u32("cpus")?,
            disk_gb: cmd.get_u64("disk")?,
        };
        self.policy.require_resource_limits(&limits)?;

        let ports = match cmd.get("ports") {
            Some(spec) => parse_ports(spec)?,
            None => Vec::new(),
        };
        for (host, container) in &ports {
            self.policy.require_port(host)?;
            self.policy.require_port(container)?;
        }
        let volumes = match cmd.get("volumes") {
            Some(spec) => parse_volumes(spec)?,
            None => Vec::new(),
        };
        for (host, _) in &volumes {
            self.policy.require_volume(host)?;
        }

        // Capacity is checked before any process is spawned.
        self.registry.ensure_capacity().await?;

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.to_string(),
        ];
        if let Some(mem) = limits.memory_mb {
            args.push("--memory".into());
            args.push(format!("{}m", mem));
        }
        if let Some(cpus) = limits.cpus {
            args.push("--cpus".into());
            args.push(cpus.to_string());
        }
        for (host, container) in &ports {
            args.push("-p".into());
            args.push(format!("{}:{}", host, container));
        }
        for (_, mount) in &volumes {
            args.push("-v".into());
            args.push(mount.clone());
        }
        if let Some(network) = cmd.get("network") {
            args.push("--network".into());
            args.push(network.to_string());
        }
        args.push(image.to_string());
        match cmd.get("command") {
            Some(guest_cmd) => args.extend(guest_cmd.split_whitespace().map(String::from)),
            // Keep the container alive so exec/deploy can reach it later.
            None => args.extend(["sleep".to_string(), "infinity".to_string()]),
        }

        let result = self.run_lifecycle("Create", args).await?;
        let container_id = {
            let id = result.stdout.trim();
            if id.is_empty() { name.to_string() } else { id.to_string() }
        };

        let mut resource = ManagedResource::new(container_id.clone(), name, self.flavor);
        resource.image = Some(image.to_string());
        resource.ports = ports.iter().map(|(h, c)| format!("{}:{}", h, c)).collect();
        resource.volumes = volumes.iter().map(|(_, m)| m.clone()).collect();
        if let Some(network) = cmd.get("network") {
            resource.metadata.insert("network".to_string(), network.to_string());
        }
        self.registry.insert(resource).await?;

        info!(container = name, image, "created container");
        Ok(Response::ok("create")
            .with("containerId", container_id)
            .with("name", name)
            .with("image", image)
            .with("status", ResourceStatus::Created.to_string()))
    }

    async fn start(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require("name")?;
        self.registry.get(name).await?;
        self.run_lifecycle("Start", vec!["start".into(), name.to_string()])
            .await?;
        let resource = self
            .registry
            .update(name, |r| r.status = ResourceStatus::Running)
            .await?;
        info!(container = name, "started container");
        Ok(Response::ok("start")
            .with("name", name)
            .with("status", resource.status.to_string()))
    }

    async fn stop(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require("name")?;
        self.registry.get(name).await?;
        self.run_lifecycle("Stop", vec!["stop".into(), name.to_string()])
            .await?;
        let resource = self
            .registry
            .update(name, |r| r.status = ResourceStatus::Stopped)
            .await?;
        info!(container = name, "stopped container");
        Ok(Response::ok("stop")
            .with("name", name)
            .with("status", resource.status.to_string()))
    }

    async fn remove(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require_any(&["name", "container"])?;
        let force = cmd.get_bool("force");
        let resource = self.registry.get(name).await?;
        if resource.status == ResourceStatus::Running && !force {
            return Err(Error::InvalidState {
                kind: "Container".to_string(),
                name: name.to_string(),
                state: resource.status.to_string(),
                expected: "stopped (or force=true)".to_string(),
            });
        }

        let mut args: Vec<String> = vec!["rm".into()];
        if force {
            args.push("-f".into());
        }
        args.push(name.to_string());
        self.run_lifecycle("Remove", args).await?;
        self.registry.remove(name).await?;

        info!(container = name, force, "removed container");
        Ok(Response::ok("remove").with("name", name).with("removed", true))
    }

    async fn list(&self) -> Result<Response> {
        let result = self
            .run_lifecycle(
                "List",
                vec!["ps".into(), "-a".into(), "--format".into(), "{{.Names}}".into()],
            )
            .await?;
        let tracked = self.registry.list().await;
        let containers = serde_json::to_value(&tracked)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Response::ok("list")
            .with("containers", containers)
            .with("count", tracked.len() as i64)
            .with("backendOutput", result.stdout.trim()))
    }

    async fn status(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require_any(&["name", "container"])?;
        let resource = self.registry.get(name).await?;
        let result = self
            .run_lifecycle(
                "Status",
                vec![
                    "inspect".into(),
                    "--format".into(),
                    "{{.State.Status}}".into(),
                    name.to_string(),
                ],
            )
            .await?;
        Ok(Response::ok("status")
            .with("name", name)
            .with("status", result.stdout.trim())
            .with("registryStatus", resource.status.to_string()))
    }

    async fn logs(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require_any(&["name", "container"])?;
        self.registry.get(name).await?;
        let mut args: Vec<String> = vec!["logs".into()];
        if let Some(tail) = cmd.get_u64("tail")? {
            args.push("--tail".into());
            args.push(tail.to_string());
        }
        args.push(name.to_string());
        let result = self.run_lifecycle("Logs", args).await?;
        Ok(Response::ok("logs")
            .with("name", name)
            .with("logs", result.stdout))
    }

    async fn deploy_rexx(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require("container")?;
        self.registry.get(name).await?;

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
            vec!["cp".into(), binary.clone(), format!("{}:{}", name, target_path)],
        )
        .await?;
        self.run_lifecycle(
            "Deploy",
            vec![
                "exec".into(),
                name.to_string(),
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
        self.registry.get(name).await?;

        let result = self
            .run(vec![
                "exec".into(),
                name.to_string(),
                "sh".into(),
                "-c".into(),
                guest_cmd.to_string(),
            ])
            .await?;
        self.translate_execution("execute", name, result)
    }

    async fn execute_rexx(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require("container")?;
        let script = cmd.require("script")?;
        self.execute_script(name, script).await
    }

    async fn execute_file(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require("container")?;
        let file = cmd.require("file")?;
        let script = read_script_file(file).await?;
        self.execute_script(name, &script).await
    }

    /// Shared inline-script sub-protocol: stage to a host temp file, copy
    /// in, run the deployed interpreter, then remove both copies. Cleanup
    /// runs on success and failure paths alike.
    async fn execute_script(&self, name: &str, script: &str) -> Result<Response> {
        let resource = self.registry.get(name).await?;
        let rexx_path = resource
            .rexx_path
            .unwrap_or_else(|| DEFAULT_REXX_PATH.to_string());

        let host_path = temp_script_path();
        tokio::fs::write(&host_path, script).await?;
        let guest_path = target_script_path(&host_path);

        let outcome = self
            .run_staged(name, &host_path, &guest_path, &rexx_path)
            .await;

        if let Err(e) = tokio::fs::remove_file(&host_path).await {
            warn!(path = %host_path.display(), error = %e, "failed to remove host temp script");
        }
        match self
            .run(vec![
                "exec".into(),
                name.to_string(),
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
        name: &str,
        host_path: &Path,
        guest_path: &str,
        rexx_path: &str,
    ) -> Result<ProcessResult> {
        self.run_lifecycle(
            "Execute",
            vec![
                "cp".into(),
                host_path.to_string_lossy().into_owned(),
                format!("{}:{}", name, guest_path),
            ],
        )
        .await?;
        self.run(vec![
            "exec".into(),
            name.to_string(),
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
            Ok(Response::execution_failure(operation, result.exit_code, &result.stderr)
                .with("container", name)
                .with("output", result.stdout))
        }
    }
}

#[async_trait]
impl AddressHandler for ContainerHandler {
    fn name(&self) -> &str {
        "container"
    }

    fn flavor(&self) -> BackendFlavor {
        self.flavor
    }

    async fn initialize(&mut self, config: HandlerConfig) -> Result<()> {
        self.policy = config.build_policy();
        self.timeout = config.timeout();
        if let Some(max) = config.max_containers {
            self.registry.set_max(max);
        }
        self.default_rexx_binary = config.rexx_binary_path.clone();

        for (candidate, flavor) in RUNTIME_CANDIDATES {
            let probe = ExecSpec::new(candidate, ["--version"]).with_timeout(PROBE_TIMEOUT);
            match self.gateway.execute(probe).await {
                Ok(result) if result.is_success() => {
                    info!(runtime = candidate, "selected container runtime");
                    self.runtime_bin = Some(candidate.to_string());
                    self.flavor = *flavor;
                    return Ok(());
                }
                Ok(_) | Err(Error::SpawnFailed { .. }) => {
                    debug!(runtime = candidate, "container runtime probe failed");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::OperationFailed {
            operation: "Container runtime detection".to_string(),
            stderr: "no container runtime found (tried podman, docker)".to_string(),
        })
    }

    async fn handle_message(&self, raw: &str, ctx: &VarContext) -> Result<Response> {
        let mut cmd = command::parse(raw)?;
        cmd.interpolate(ctx);
        debug!(operation = %cmd.operation, "container handler dispatch");

        match cmd.operation.as_str() {
            "create" => self.create(&cmd).await,
            "start" => self.start(&cmd).await,
            "stop" => self.stop(&cmd).await,
            "remove" | "destroy" => self.remove(&cmd).await,
            "list" => self.list().await,
            "status" => self.status(&cmd).await,
            "logs" => self.logs(&cmd).await,
            "deploy_rexx" | "deploy_binary" => self.deploy_rexx(&cmd).await,
            "execute" => self.execute(&cmd).await,
            "execute_rexx" => self.execute_rexx(&cmd).await,
            "execute_file" => self.execute_file(&cmd).await,
            other => Err(Error::UnknownOperation(other.to_string())),
        }
    }
}
