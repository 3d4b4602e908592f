//! # Remote Shell Handler — remote hosts over ssh/scp
//!
//! Connections are probed with a non-interactive `ssh ... true` call and
//! tracked in the handler's registry; every later operation resolves the
//! connection by name (alias or host) and builds its ssh/scp argument
//! vector from the recorded user, port, and key path. The local spawn is
//! always a direct argv call; only the remote side of an `execute` passes
//! through the remote login shell, which is the documented contract.

use crate::command::{self, VarContext};
use crate::constants::{
    DEFAULT_REXX_PATH, DEFAULT_SSH_USER, PROBE_TIMEOUT, SSH_CONNECT_TIMEOUT_SECS,
};
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

/// ADDRESS handler for remote hosts reached over SSH.
pub struct RemoteShellHandler {
    gateway: Arc<dyn ProcessGateway>,
    policy: SecurityPolicy,
    registry: ResourceRegistry,
    timeout: Duration,
    default_rexx_binary: Option<String>,
    available: bool,
}

impl RemoteShellHandler {
    /// Creates an uninitialized handler over the given gateway.
    pub fn new(gateway: Arc<dyn ProcessGateway>) -> Self {
        Self {
            gateway,
            policy: SecurityPolicy::default(),
            registry: ResourceRegistry::new(
                "Connection",
                "connections",
                crate::constants::DEFAULT_MAX_RESOURCES,
            ),
            timeout: Duration::from_millis(crate::constants::DEFAULT_TIMEOUT_MS),
            default_rexx_binary: None,
            available: false,
        }
    }

    /// The handler's connection registry.
    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    async fn run(&self, program: &str, args: Vec<String>) -> Result<ProcessResult> {
        if !self.available {
            return Err(Error::Internal("remote shell handler not initialized".to_string()));
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

    fn destination(resource: &ManagedResource) -> String {
        let user = resource
            .metadata
            .get("user")
            .map(String::as_str)
            .unwrap_or(DEFAULT_SSH_USER);
        let host = resource
            .metadata
            .get("host")
            .map(String::as_str)
            .unwrap_or(resource.name.as_str());
        format!("{}@{}", user, host)
    }

    /// Common ssh option vector for a tracked connection.
    fn ssh_base(resource: &ManagedResource) -> Vec<String> {
        let mut args: Vec<String> = vec!["-o".into(), "BatchMode=yes".into()];
        if let Some(port) = resource.metadata.get("port") {
            args.push("-p".into());
            args.push(port.clone());
        }
        if let Some(key) = resource.metadata.get("key") {
            args.push("-i".into());
            args.push(key.clone());
        }
        args
    }

    /// Common scp option vector (scp spells the port flag `-P`).
    fn scp_base(resource: &ManagedResource) -> Vec<String> {
        let mut args: Vec<String> = vec!["-o".into(), "BatchMode=yes".into()];
        if let Some(port) = resource.metadata.get("port") {
            args.push("-P".into());
            args.push(port.clone());
        }
        if let Some(key) = resource.metadata.get("key") {
            args.push("-i".into());
            args.push(key.clone());
        }
        args
    }

    // =========================================================================
    // Operations
    // =========================================================================

    async fn connect(&self, cmd: &command::Command) -> Result<Response> {
        let host = cmd.require("host")?;
        self.policy.require_host(host)?;
        let user = cmd.get("user").unwrap_or(DEFAULT_SSH_USER);
        if let Some(port) = cmd.get("port") {
            self.policy.require_port(port)?;
        }
        let alias = cmd.get("alias").unwrap_or(host);

        self.registry.ensure_capacity().await?;

        let mut resource =
            ManagedResource::new(format!("{}@{}", user, host), alias, BackendFlavor::RemoteShell);
        resource.metadata.insert("host".to_string(), host.to_string());
        resource.metadata.insert("user".to_string(), user.to_string());
        if let Some(port) = cmd.get("port") {
            resource.metadata.insert("port".to_string(), port.to_string());
        }
        if let Some(key) = cmd.get("key_file") {
            resource.metadata.insert("key".to_string(), key.to_string());
        }

        let mut args = Self::ssh_base(&resource);
        args.push("-o".into());
        args.push(format!("ConnectTimeout={}", SSH_CONNECT_TIMEOUT_SECS));
        args.push(Self::destination(&resource));
        args.push("true".into());
        self.run_lifecycle("Connect", "ssh", args).await?;

        resource.status = ResourceStatus::Running;
        self.registry.insert(resource).await?;

        info!(host, user, alias, "connected to remote host");
        Ok(Response::ok("connect")
            .with("host", host)
            .with("user", user)
            .with("name", alias)
            .with("status", ResourceStatus::Running.to_string()))
    }

    async fn disconnect(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require_any(&["name", "host", "connection"])?;
        self.registry.remove(name).await?;
        info!(connection = name, "disconnected");
        Ok(Response::ok("disconnect").with("name", name).with("removed", true))
    }

    async fn disconnect_all(&self) -> Result<Response> {
        let count = self.registry.clear().await;
        info!(count, "disconnected all remote hosts");
        Ok(Response::ok("disconnect_all").with("removedCount", count as i64))
    }

    async fn execute(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require_any(&["connection", "host", "name"])?;
        let remote_cmd = cmd.require("command")?;
        let resource = self.registry.get(name).await?;

        let mut args = Self::ssh_base(&resource);
        args.push(Self::destination(&resource));
        args.push(remote_cmd.to_string());
        let result = self.run("ssh", args).await?;
        self.translate_execution("execute", name, result)
    }

    async fn upload(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require_any(&["connection", "host", "name"])?;
        let local = cmd.require("local")?;
        let remote = cmd.require("remote")?;
        self.policy.require_path(local)?;
        let resource = self.registry.get(name).await?;

        let mut args = Self::scp_base(&resource);
        args.push(local.to_string());
        args.push(format!("{}:{}", Self::destination(&resource), remote));
        self.run_lifecycle("Upload", "scp", args).await?;

        info!(connection = name, local, remote, "uploaded file");
        Ok(Response::ok("upload")
            .with("name", name)
            .with("local", local)
            .with("remote", remote))
    }

    async fn download(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require_any(&["connection", "host", "name"])?;
        let remote = cmd.require("remote")?;
        let local = cmd.require("local")?;
        self.policy.require_path(local)?;
        let resource = self.registry.get(name).await?;

        let mut args = Self::scp_base(&resource);
        args.push(format!("{}:{}", Self::destination(&resource), remote));
        args.push(local.to_string());
        self.run_lifecycle("Download", "scp", args).await?;

        info!(connection = name, remote, local, "downloaded file");
        Ok(Response::ok("download")
            .with("name", name)
            .with("remote", remote)
            .with("local", local))
    }

    async fn list(&self) -> Result<Response> {
        let tracked = self.registry.list().await;
        let connections =
            serde_json::to_value(&tracked).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Response::ok("list")
            .with("connections", connections)
            .with("count", tracked.len() as i64))
    }

    async fn status(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require_any(&["connection", "host", "name"])?;
        let resource = self.registry.get(name).await?;

        // Re-probe reachability; a dropped connection shows up here.
        let mut args = Self::ssh_base(&resource);
        args.push("-o".into());
        args.push(format!("ConnectTimeout={}", SSH_CONNECT_TIMEOUT_SECS));
        args.push(Self::destination(&resource));
        args.push("true".into());
        let reachable = match self.run("ssh", args).await {
            Ok(result) => result.is_success(),
            Err(_) => false,
        };

        Ok(Response::ok("status")
            .with("name", name)
            .with("reachable", reachable)
            .with("registryStatus", resource.status.to_string()))
    }

    async fn deploy_rexx(&self, cmd: &command::Command) -> Result<Response> {
        let name = cmd.require_any(&["connection", "host", "name"])?;
        let resource = self.registry.get(name).await?;

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

        let mut args = Self::scp_base(&resource);
        args.push(binary.clone());
        args.push(format!("{}:{}", Self::destination(&resource), target_path));
        self.run_lifecycle("Deploy", "scp", args).await?;

        let mut args = Self::ssh_base(&resource);
        args.push(Self::destination(&resource));
        args.push(format!("chmod +x {}", target_path));
        self.run_lifecycle("Deploy", "ssh", args).await?;

        self.registry
            .update(name, |r| {
                r.has_rexx = true;
                r.rexx_path = Some(target_path.clone());
            })
            .await?;

        info!(connection = name, path = %target_path, "deployed RexxJS binary");
        Ok(Response::ok("deploy_rexx")
            .with("name", name)
            .with("rexxPath", target_path)
            .with("hasRexx", true))
    }

    async fn execute_script(&self, name: &str, script: &str) -> Result<Response> {
        let resource = self.registry.get(name).await?;
        let rexx_path = resource
            .rexx_path
            .clone()
            .unwrap_or_else(|| DEFAULT_REXX_PATH.to_string());

        let host_path = temp_script_path();
        tokio::fs::write(&host_path, script).await?;
        let guest_path = target_script_path(&host_path);

        let outcome = self
            .run_staged(&resource, &host_path, &guest_path, &rexx_path)
            .await;

        if let Err(e) = tokio::fs::remove_file(&host_path).await {
            warn!(path = %host_path.display(), error = %e, "failed to remove host temp script");
        }
        let mut args = Self::ssh_base(&resource);
        args.push(Self::destination(&resource));
        args.push(format!("rm -f {}", guest_path));
        match self.run("ssh", args).await {
            Ok(r) if r.exit_code != 0 => {
                warn!(connection = name, path = %guest_path, "failed to remove staged script")
            }
            Err(e) => warn!(connection = name, error = %e, "cleanup ssh failed"),
            _ => {}
        }

        self.translate_execution("execute_rexx", name, outcome?)
    }

    async fn run_staged(
        &self,
        resource: &ManagedResource,
        host_path: &Path,
        guest_path: &str,
        rexx_path: &str,
    ) -> Result<ProcessResult> {
        let mut args = Self::scp_base(resource);
        args.push(host_path.to_string_lossy().into_owned());
        args.push(format!("{}:{}", Self::destination(resource), guest_path));
        self.run_lifecycle("Execute", "scp", args).await?;

        let mut args = Self::ssh_base(resource);
        args.push(Self::destination(resource));
        args.push(format!("{} {}", rexx_path, guest_path));
        self.run("ssh", args).await
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
                .with("name", name)
                .with("output", result.stdout)
                .with("exitCode", 0))
        } else {
            debug!(
                connection = name,
                exit_code = result.exit_code,
                "remote command exited nonzero"
            );
            Ok(
                Response::execution_failure(operation, result.exit_code, &result.stderr)
                    .with("name", name)
                    .with("output", result.stdout),
            )
        }
    }
}

#[async_trait]
impl AddressHandler for RemoteShellHandler {
    fn name(&self) -> &str {
        "remote_shell"
    }

    fn flavor(&self) -> BackendFlavor {
        BackendFlavor::RemoteShell
    }

    async fn initialize(&mut self, config: HandlerConfig) -> Result<()> {
        self.policy = config.build_policy();
        self.timeout = config.timeout();
        if let Some(max) = config.max_connections {
            self.registry.set_max(max);
        }
        self.default_rexx_binary = config.rexx_binary_path.clone();

        let probe = ExecSpec::new("ssh", ["-V"]).with_timeout(PROBE_TIMEOUT);
        match self.gateway.execute(probe).await {
            // ssh -V prints the version and exits 0 on OpenSSH; some
            // builds exit 255 while still printing to stderr.
            Ok(result) if result.exit_code == 0 || !result.stderr.trim().is_empty() => {
                info!("ssh available");
                self.available = true;
                Ok(())
            }
            Ok(result) => Err(Error::OperationFailed {
                operation: "SSH detection".to_string(),
                stderr: format!("ssh probe exited {}", result.exit_code),
            }),
            Err(Error::SpawnFailed { reason, .. }) => Err(Error::OperationFailed {
                operation: "SSH detection".to_string(),
                stderr: format!("ssh not available: {}", reason),
            }),
            Err(e) => Err(e),
        }
    }

    async fn handle_message(&self, raw: &str, ctx: &VarContext) -> Result<Response> {
        let mut cmd = command::parse(raw)?;
        cmd.interpolate(ctx);
        debug!(operation = %cmd.operation, "remote shell handler dispatch");

        match cmd.operation.as_str() {
            "connect" | "create" => self.connect(&cmd).await,
            "disconnect" | "remove" | "destroy" => self.disconnect(&cmd).await,
            "disconnect_all" => self.disconnect_all().await,
            "execute" => self.execute(&cmd).await,
            "upload" => self.upload(&cmd).await,
            "download" => self.download(&cmd).await,
            "list" => self.list().await,
            "status" => self.status(&cmd).await,
            "deploy_rexx" | "deploy_binary" => self.deploy_rexx(&cmd).await,
            "execute_rexx" => {
                let name = cmd
                    .require_any(&["connection", "host", "name", "container"])?
                    .to_string();
                let script = cmd.require("script")?.to_string();
                self.execute_script(&name, &script).await
            }
            "execute_file" => {
                let name = cmd
                    .require_any(&["connection", "host", "name", "container"])?
                    .to_string();
                let file = cmd.require("file")?;
                let script = read_script_file(file).await?;
                self.execute_script(&name, &script).await
            }
            other => Err(Error::UnknownOperation(other.to_string())),
        }
    }
}
