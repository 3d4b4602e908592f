//! # Nspawn Handler — systemd-nspawn machines via machinectl
//!
//! Machines are created from a template (cloned from the local machine
//! image pool, or imported from a tarball when the template is a path),
//! started and stopped through `machinectl`, and reached for in-machine
//! execution through `systemd-run --machine`.
//!
//! The deploy/execute sub-protocols mirror the container handler with
//! nspawn's own primitives: `machinectl copy-to` for staging and
//! `systemd-run --pipe --wait` for in-target execution.

use crate::command::{self, VarContext};
use crate::constants::{DEFAULT_REXX_PATH, PROBE_TIMEOUT, validate_resource_name};
use crate::error::{Error, Result};
use crate::handlers::{
    read_script_file, require_local_binary, target_script_path, temp_script_path, AddressHandler,
    HandlerConfig, Response,
};
use crate::policy::SecurityPolicy;
use crate::process::{ExecSpec, ProcessGateway, ProcessResult};
use crate::resource::{BackendFlavor, ManagedResource, ResourceRegistry, ResourceStatus};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// ADDRESS handler for systemd-nspawn machines.
pub struct NspawnHandler {
    gateway: Arc<dyn ProcessGateway>,
    policy: SecurityPolicy,
    registry: ResourceRegistry,
    timeout: Duration,
    machines_path: Option<String>,
    default_rexx_binary: Option<String>,
    available: bool,
}

impl NspawnHandler {
    /// Creates an uninitialized handler over the given gateway.
    pub fn new(gateway: Arc<dyn ProcessGateway>) -> Self {
        Self {
            gateway,
            policy: SecurityPolicy::default(),
            registry: ResourceRegistry::new(
                "Machine",
                "machines",
                crate::constants::DEFAULT_MAX_RESOURCES,
            ),
            timeout: Duration::from_millis(crate::constants::DEFAULT_TIMEOUT_MS),
            machines_path: None,
            default_rexx_binary: None,
            available: false,
        }
    }

    /// The handler's resource registry.
    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    async fn run(&self, program: &str, args: Vec<String>) -> Result<ProcessResult> {
        if !self.available {
            return Err(Error::Internal("nspawn handler not initialized".to_string()));
        }
        let spec = ExecSpec::new(program, args).with_timeout(self.timeout);
        self.gateway.execute(spec).await
    }

    async fn run_lifecycle(
        &self,
        operation: &str,
        program: &str,
        args: Vec<String>,
    ) -> Result<ProcessResult> {
        let result = self.run(program, args).await?;
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

    /// In-machine exec primitive: `systemd-run --machine=X --pipe --wait`.
    fn exec_args(name: &str, command: &[&str]) -> Vec<String> {
        let mut args: Vec<String> = vec![
            format!("--machine={}", name),
            "--pipe".into(),
            "--wait".into(),
            "--quiet".into(),
        ];
        args.extend(command.iter().map(|s| s.to_string()));
        args
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
        let template = cmd.require_any(&["template", "image"])?;
        self.policy.require_template(template)?;

        self.registry.ensure_capacity().await?;

        // A path template is imported from a tarball; a bare name is
        // cloned from the local machine image pool.
        let args: Vec<String> = if template.contains('/') {
            let template_path = match &self.machines_path {
                Some(root) if !template.starts_with('/') => {
                    format!("{}/{}", root, template)
                }
                _ => template.to_string(),
            };
            vec!["import-tar".into(), template_path, name.to_string()]
        } else {
            vec!["clone".into(), template.to_string(), name.to_string()]
        };
        self.run_lifecycle("Create", "machinectl", args).await?;

        let mut resource = ManagedResource::new(name, name, BackendFlavor::Nspawn);
        resource.image = Some(template.to_string());
        self.registry.insert(resource).await?;

        info!(machine = name, template, "created machine");
        Ok(Response::ok("create")
            .with("name", name)
            .with("template", template)
            .with("status", ResourceStatus::Created.to_string()))
    }

    async fn start(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require("name")?;
        self.registry.get(name).await?;
        self.run_lifecycle("Start", "machinectl", vec!["start".into(), name.to_string()])
            .await?;
        let resource = self
            .registry
            .update(name, |r| r.status = ResourceStatus::Running)
            .await?;
        info!(machine = name, "started machine");
        Ok(Response::ok("start")
            .with("name", name)
            .with("status", resource.status.to_string()))
    }

    async fn stop(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require("name")?;
        self.registry.get(name).await?;
        self.run_lifecycle(
            "Stop",
            "machinectl",
            vec!["poweroff".into(), name.to_string()],
        )
        .await?;
        let resource = self
            .registry
            .update(name, |r| r.status = ResourceStatus::Stopped)
            .await?;
        info!(machine = name, "stopped machine");
        Ok(Response::ok("stop")
            .with("name", name)
            .with("status", resource.status.to_string()))
    }

    async fn remove(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require_any(&["name", "machine"])?;
        let force = cmd.get_bool("force");
        let resource = self.registry.get(name).await?;
        if resource.status == ResourceStatus::Running {
            if !force {
                return Err(Error::InvalidState {
                    kind: "Machine".to_string(),
                    name: name.to_string(),
                    state: resource.status.to_string(),
                    expected: "stopped (or force=true)".to_string(),
                });
            }
            self.run_lifecycle(
                "Remove",
                "machinectl",
                vec!["terminate".into(), name.to_string()],
            )
            .await?;
        }
        self.run_lifecycle(
            "Remove",
            "machinectl",
            vec!["remove".into(), name.to_string()],
        )
        .await?;
        self.registry.remove(name).await?;

        info!(machine = name, force, "removed machine");
        Ok(Response::ok("remove").with("name", name).with("removed", true))
    }

    async fn list(&self) -> Result<Response> {
        let result = self
            .run_lifecycle(
                "List",
                "machinectl",
                vec!["list".into(), "--no-legend".into()],
            )
            .await?;
        let tracked = self.registry.list().await;
        let machines =
            serde_json::to_value(&tracked).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Response::ok("list")
            .with("machines", machines)
            .with("count", tracked.len() as i64)
            .with("backendOutput", result.stdout.trim()))
    }

    async fn status(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require_any(&["name", "machine"])?;
        let resource = self.registry.get(name).await?;
        let result = self
            .run_lifecycle(
                "Status",
                "machinectl",
                vec!["show".into(), name.to_string(), "--property=State".into()],
            )
            .await?;
        let state = result
            .stdout
            .trim()
            .strip_prefix("State=")
            .unwrap_or(result.stdout.trim())
            .to_string();
        Ok(Response::ok("status")
            .with("name", name)
            .with("status", state)
            .with("registryStatus", resource.status.to_string()))
    }

    async fn logs(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require_any(&["name", "machine"])?;
        self.registry.get(name).await?;
        let tail = cmd.get_u64("tail")?.unwrap_or(50);
        let result = self
            .run_lifecycle(
                "Logs",
                "journalctl",
                vec![
                    "-M".into(),
                    name.to_string(),
                    "-n".into(),
                    tail.to_string(),
                    "--no-pager".into(),
                ],
            )
            .await?;
        Ok(Response::ok("logs")
            .with("name", name)
            .with("logs", result.stdout))
    }

    async fn deploy_rexx(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require_any(&["machine", "container"])?;
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
            "machinectl",
            vec![
                "copy-to".into(),
                name.to_string(),
                binary.clone(),
                target_path.clone(),
            ],
        )
        .await?;
        self.run_lifecycle(
            "Deploy",
            "systemd-run",
            Self::exec_args(name, &["chmod", "+x", &target_path]),
        )
        .await?;

        self.registry
            .update(name, |r| {
                r.has_rexx = true;
                r.rexx_path = Some(target_path.clone());
            })
            .await?;

        info!(machine = name, path = %target_path, "deployed RexxJS binary");
        Ok(Response::ok("deploy_rexx")
            .with("machine", name)
            .with("rexxPath", target_path)
            .with("hasRexx", true))
    }

    async fn execute(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require_any(&["machine", "name", "container"])?;
        let guest_cmd = cmd.require("command")?;
        self.registry.get(name).await?;

        let result = self
            .run(
                "systemd-run",
                Self::exec_args(name, &["/bin/sh", "-c", guest_cmd]),
            )
            .await?;
        self.translate_execution("execute", name, result)
    }

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
            .run(
                "systemd-run",
                Self::exec_args(name, &["rm", "-f", &guest_path]),
            )
            .await
        {
            Ok(r) if r.exit_code != 0 => {
                warn!(machine = name, path = %guest_path, "failed to remove staged script")
            }
            Err(e) => warn!(machine = name, error = %e, "cleanup exec failed"),
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
            "machinectl",
            vec![
                "copy-to".into(),
                name.to_string(),
                host_path.to_string_lossy().into_owned(),
                guest_path.to_string(),
            ],
        )
        .await?;
        self.run(
            "systemd-run",
            Self::exec_args(name, &[rexx_path, guest_path]),
        )
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
                .with("machine", name)
                .with("output", result.stdout)
                .with("exitCode", 0))
        } else {
            debug!(
                machine = name,
                exit_code = result.exit_code,
                "guest script exited nonzero"
            );
            Ok(
                Response::execution_failure(operation, result.exit_code, &result.stderr)
                    .with("machine", name)
                    .with("output", result.stdout),
            )
        }
    }
}

#[async_trait]
impl AddressHandler for NspawnHandler {
    fn name(&self) -> &str {
        "nspawn"
    }

    fn flavor(&self) -> BackendFlavor {
        BackendFlavor::Nspawn
    }

    async fn initialize(&mut self, config: HandlerConfig) -> Result<()> {
        self.policy = config.build_policy();
        self.timeout = config.timeout();
        if let Some(max) = config.max_machines {
            self.registry.set_max(max);
        }
        self.machines_path = config.machines_path.clone();
        self.default_rexx_binary = config.rexx_binary_path.clone();

        let probe = ExecSpec::new("machinectl", ["--version"]).with_timeout(PROBE_TIMEOUT);
        match self.gateway.execute(probe).await {
            Ok(result) if result.is_success() => {
                info!("machinectl available");
                self.available = true;
                Ok(())
            }
            Ok(result) => Err(Error::OperationFailed {
                operation: "Machine runtime detection".to_string(),
                stderr: format!(
                    "machinectl probe exited {}: {}",
                    result.exit_code,
                    result.stderr.trim()
                ),
            }),
            Err(Error::SpawnFailed { reason, .. }) => Err(Error::OperationFailed {
                operation: "Machine runtime detection".to_string(),
                stderr: format!("machinectl not available: {}", reason),
            }),
            Err(e) => Err(e),
        }
    }

    async fn handle_message(&self, raw: &str, ctx: &VarContext) -> Result<Response> {
        let mut cmd = command::parse(raw)?;
        cmd.interpolate(ctx);
        debug!(operation = %cmd.operation, "nspawn handler dispatch");

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
            "execute_rexx" => {
                let name = cmd.require_any(&["machine", "container"])?.to_string();
                let script = cmd.require("script")?.to_string();
                self.execute_script(&name, &script).await
            }
            "execute_file" => {
                let name = cmd.require_any(&["machine", "container"])?.to_string();
                let file = cmd.require("file")?;
                let script = read_script_file(file).await?;
                self.execute_script(&name, &script).await
            }
            other => Err(Error::UnknownOperation(other.to_string())),
        }
    }
}
