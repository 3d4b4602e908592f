//! # Deployment Orchestrator
//!
//! Composes one container-flavor handler and one remote-shell handler
//! behind a backend-agnostic vocabulary: `setup_container`,
//! `setup_remote_shell`, `deploy_binary`, `execute_remote`,
//! `monitor_deployment`, `cleanup_deployment`, `cleanup_all_deployments`,
//! `setup_mixed_deployment`, and the one-shot `deploy_and_execute`.
//!
//! Named deployments live in a single namespace regardless of backend
//! kind; target resolution through the active-deployments map is what
//! makes `execute_remote` and friends backend-agnostic. The orchestrator
//! depends only on [`AddressHandler`] and composes internal commands in
//! the same grammar external callers use.
//!
//! ## Retry policy
//!
//! `retry_attempts=N` re-issues the underlying operation on transient
//! failures only ([`Error::is_retryable`]); validation, policy,
//! not-found, and capacity errors abort immediately. The result reports
//! the attempt count actually used.

use crate::checkpoint::{CheckpointRouter, LibraryResolver, ProgressCallback, ProgressRecord};
use crate::command::{self, quote, VarContext};
use crate::error::{Error, Result};
use crate::handlers::{
    AddressHandler, ContainerHandler, HandlerConfig, RemoteShellHandler, Response,
};
use crate::process::{ProcessGateway, SystemGateway};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Prefix on worker stdout lines that carry checkpoint messages.
const CHECKPOINT_MARKER: &str = "CHECKPOINT ";

// =============================================================================
// Configuration
// =============================================================================

/// Orchestrator construction options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Configuration handed to the container-flavor handler.
    pub container: HandlerConfig,
    /// Configuration handed to the remote-shell handler.
    pub remote: HandlerConfig,
    /// Retry budget applied when a command carries no `retry_attempts`.
    pub default_retry_attempts: Option<u32>,
    /// Root directory for local library resolution in the require protocol.
    pub library_root: Option<PathBuf>,
}

// =============================================================================
// Deployments
// =============================================================================

/// Which backend kind owns a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentKind {
    /// Backed by the container-flavor handler.
    Container,
    /// Backed by the remote-shell handler.
    RemoteShell,
}

impl std::fmt::Display for DeploymentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Container => write!(f, "container"),
            Self::RemoteShell => write!(f, "remote_shell"),
        }
    }
}

/// Lifecycle of a named deployment.
///
/// ```text
/// provisioning → ready ↔ executing
///                  │
///                  └→ failed / cleaned_up
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Setup sequence in flight.
    Provisioning,
    /// Provisioned and idle.
    Ready,
    /// A remote execution is in flight.
    Executing,
    /// A lifecycle operation against the target threw.
    Failed,
    /// Torn down; terminal.
    CleanedUp,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Ready => write!(f, "ready"),
            Self::Executing => write!(f, "executing"),
            Self::Failed => write!(f, "failed"),
            Self::CleanedUp => write!(f, "cleaned_up"),
        }
    }
}

/// One named deployment tracked by the orchestrator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    /// Unique name across the orchestrator instance, any kind.
    pub target: String,
    /// Owning backend kind.
    pub kind: DeploymentKind,
    /// Current status.
    pub status: DeploymentStatus,
    /// Resource name within the owning handler's registry.
    pub resource: String,
    /// Whether progress relay was requested at setup.
    pub progress_enabled: bool,
    /// Timestamp of the last `execute_remote` against this target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Owns the backend handlers, the active-deployments map, the retry
/// policy, and the checkpoint router.
pub struct DeploymentOrchestrator {
    container: Box<dyn AddressHandler>,
    remote: Box<dyn AddressHandler>,
    deployments: RwLock<HashMap<String, Deployment>>,
    default_retries: u32,
    router: Mutex<CheckpointRouter>,
    oneshot_seq: AtomicU64,
}

impl DeploymentOrchestrator {
    /// Builds and initializes production handlers over the system gateway.
    pub async fn initialize(config: OrchestratorConfig) -> Result<Self> {
        let gateway: Arc<dyn ProcessGateway> = Arc::new(SystemGateway::new());
        Self::initialize_with_gateway(config, gateway).await
    }

    /// Builds and initializes handlers over a caller-supplied gateway
    /// (tests substitute a recording mock here).
    pub async fn initialize_with_gateway(
        config: OrchestratorConfig,
        gateway: Arc<dyn ProcessGateway>,
    ) -> Result<Self> {
        let mut container = ContainerHandler::new(gateway.clone());
        container.initialize(config.container.clone()).await?;
        let mut remote = RemoteShellHandler::new(gateway);
        remote.initialize(config.remote.clone()).await?;
        Ok(Self::from_handlers(
            Box::new(container),
            Box::new(remote),
            &config,
        ))
    }

    /// Composes an orchestrator from already-initialized handlers.
    pub fn from_handlers(
        container: Box<dyn AddressHandler>,
        remote: Box<dyn AddressHandler>,
        config: &OrchestratorConfig,
    ) -> Self {
        let root = config
            .library_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            container,
            remote,
            deployments: RwLock::new(HashMap::new()),
            default_retries: config.default_retry_attempts.unwrap_or(1),
            router: Mutex::new(CheckpointRouter::new(
                "orchestrator",
                LibraryResolver::new(root),
            )),
            oneshot_seq: AtomicU64::new(0),
        }
    }

    /// Registers the callback invoked for every relayed progress message.
    pub async fn set_progress_callback(&self, callback: ProgressCallback) {
        self.router.lock().await.set_callback(callback);
    }

    /// Routes one checkpoint message, returning the require response when
    /// the message was a library request.
    pub async fn route_checkpoint(&self, message: serde_json::Value) -> Option<serde_json::Value> {
        self.router.lock().await.route(message).await
    }

    /// Snapshot of all progress records received so far.
    pub async fn checkpoint_records(&self) -> Vec<ProgressRecord> {
        self.router.lock().await.session().records.clone()
    }

    /// Number of active deployments.
    pub async fn active_deployment_count(&self) -> usize {
        self.deployments.read().await.len()
    }

    /// Dispatches one orchestrator command string.
    pub async fn handle_message(&self, raw: &str, ctx: &VarContext) -> Result<Response> {
        let mut cmd = command::parse(raw)?;
        cmd.interpolate(ctx);
        debug!(operation = %cmd.operation, "orchestrator dispatch");

        match cmd.operation.as_str() {
            "setup_container" => self.setup_container(&cmd, ctx).await,
            "setup_remote_shell" => self.setup_remote_shell(&cmd, ctx).await,
            "setup_mixed_deployment" => self.setup_mixed(&cmd, ctx).await,
            "deploy_binary" => self.deploy_binary(&cmd, ctx).await,
            "execute_remote" => self.execute_remote(&cmd, ctx).await,
            "monitor_deployment" => self.monitor_deployment(&cmd, ctx).await,
            "cleanup_deployment" => self.cleanup_deployment(&cmd, ctx).await,
            "cleanup_all_deployments" => self.cleanup_all(ctx).await,
            "deploy_and_execute" => self.deploy_and_execute(&cmd, ctx).await,
            other => Err(Error::UnknownOperation(other.to_string())),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn handler_for(&self, kind: DeploymentKind) -> &dyn AddressHandler {
        match kind {
            DeploymentKind::Container => self.container.as_ref(),
            DeploymentKind::RemoteShell => self.remote.as_ref(),
        }
    }

    async fn get_deployment(&self, target: &str) -> Result<Deployment> {
        self.deployments
            .read()
            .await
            .get(target)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "Deployment target".to_string(),
                name: target.to_string(),
            })
    }

    async fn reserve_target(&self, target: &str) -> Result<()> {
        let deployments = self.deployments.read().await;
        if deployments.contains_key(target) {
            return Err(Error::AlreadyExists {
                kind: "Deployment target".to_string(),
                name: target.to_string(),
            });
        }
        Ok(())
    }

    async fn set_status(&self, target: &str, status: DeploymentStatus) {
        if let Some(dep) = self.deployments.write().await.get_mut(target) {
            dep.status = status;
        }
    }

    /// Re-issues a handler operation up to `attempts` times on transient
    /// failures. Terminal errors abort on first occurrence.
    async fn dispatch_with_retry(
        &self,
        handler: &dyn AddressHandler,
        raw: &str,
        ctx: &VarContext,
        attempts: u32,
    ) -> Result<(Response, u32)> {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            match handler.handle_message(raw, ctx).await {
                Ok(response) => return Ok((response, attempt)),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(attempt, error = %e, "transient failure, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Internal("retry loop exhausted".to_string()))
    }

    /// Forwards selected parameters from an orchestrator command into a
    /// composed handler command.
    fn forward_params(cmd: &command::Command, keys: &[&str], raw: &mut String) {
        for key in keys {
            if let Some(value) = cmd.get(key) {
                raw.push_str(&format!(" {}={}", key, quote(value)));
            }
        }
    }

    /// Appends deploy options, translating the orchestrator's
    /// `target_path` into the handlers' `target` (in-guest path) key;
    /// `target` itself names the deployment at this layer.
    fn forward_deploy_params(cmd: &command::Command, raw: &mut String) {
        Self::forward_params(cmd, &["rexx_binary"], raw);
        if let Some(path) = cmd.get("target_path") {
            raw.push_str(&format!(" target={}", quote(path)));
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    async fn setup_container(&self, cmd: &command::Command, ctx: &VarContext) -> Result<Response> {
        let name = cmd.require("name")?;
        let image = cmd.require("image")?;
        self.reserve_target(name).await?;
        let attempts = cmd
            .get_u32("retry_attempts")?
            .unwrap_or(self.default_retries);

        let mut raw = format!("create image={} name={}", quote(image), quote(name));
        Self::forward_params(
            cmd,
            &["memory", "cpus", "disk", "ports", "volumes", "network", "command"],
            &mut raw,
        );
        let (create_resp, attempts_used) = self
            .dispatch_with_retry(self.container.as_ref(), &raw, ctx, attempts)
            .await?;

        if cmd.get_bool("deploy_rexx") || cmd.get("rexx_binary").is_some() {
            let mut raw = format!("deploy_rexx container={}", quote(name));
            Self::forward_deploy_params(cmd, &mut raw);
            if let Err(e) = self.container.handle_message(&raw, ctx).await {
                // A container that never received its interpreter is not a
                // usable deployment; remove it rather than stranding it.
                self.teardown_container(name, ctx).await;
                return Err(e);
            }
        }

        let deployment = Deployment {
            target: name.to_string(),
            kind: DeploymentKind::Container,
            status: DeploymentStatus::Ready,
            resource: name.to_string(),
            progress_enabled: cmd.get_bool("progress"),
            last_execution: None,
            created_at: Utc::now(),
        };
        {
            let mut deployments = self.deployments.write().await;
            if deployments.contains_key(name) {
                return Err(Error::AlreadyExists {
                    kind: "Deployment target".to_string(),
                    name: name.to_string(),
                });
            }
            deployments.insert(name.to_string(), deployment);
        }

        info!(target = name, image, "container deployment ready");
        Ok(Response::ok("setup_container")
            .with("target", name)
            .with("deploymentType", "container")
            .with("status", DeploymentStatus::Ready.to_string())
            .with("attempts", attempts_used as i64)
            .with(
                "containerId",
                create_resp.get_str("containerId").map(str::to_string),
            ))
    }

    async fn setup_remote_shell(
        &self,
        cmd: &command::Command,
        ctx: &VarContext,
    ) -> Result<Response> {
        let host = cmd.require("host")?;
        let target = cmd.get("alias").unwrap_or(host);
        self.reserve_target(target).await?;
        let attempts = cmd
            .get_u32("retry_attempts")?
            .unwrap_or(self.default_retries);

        let mut raw = format!("connect host={} alias={}", quote(host), quote(target));
        Self::forward_params(cmd, &["user", "port", "key_file"], &mut raw);
        let (_, attempts_used) = self
            .dispatch_with_retry(self.remote.as_ref(), &raw, ctx, attempts)
            .await?;

        if cmd.get_bool("deploy_rexx") || cmd.get("rexx_binary").is_some() {
            let mut raw = format!("deploy_rexx name={}", quote(target));
            Self::forward_deploy_params(cmd, &mut raw);
            if let Err(e) = self.remote.handle_message(&raw, ctx).await {
                let raw = format!("disconnect name={}", quote(target));
                if let Err(e) = self.remote.handle_message(&raw, ctx).await {
                    warn!(connection = target, error = %e, "connection teardown failed");
                }
                return Err(e);
            }
        }

        let deployment = Deployment {
            target: target.to_string(),
            kind: DeploymentKind::RemoteShell,
            status: DeploymentStatus::Ready,
            resource: target.to_string(),
            progress_enabled: cmd.get_bool("progress"),
            last_execution: None,
            created_at: Utc::now(),
        };
        {
            let mut deployments = self.deployments.write().await;
            if deployments.contains_key(target) {
                return Err(Error::AlreadyExists {
                    kind: "Deployment target".to_string(),
                    name: target.to_string(),
                });
            }
            deployments.insert(target.to_string(), deployment);
        }

        info!(target, host, "remote shell deployment ready");
        Ok(Response::ok("setup_remote_shell")
            .with("target", target)
            .with("deploymentType", "remote_shell")
            .with("status", DeploymentStatus::Ready.to_string())
            .with("attempts", attempts_used as i64)
            .with("host", host))
    }

    async fn setup_mixed(&self, cmd: &command::Command, ctx: &VarContext) -> Result<Response> {
        let mut raw = "setup_container".to_string();
        Self::forward_params(
            cmd,
            &["image", "name", "memory", "cpus", "rexx_binary", "retry_attempts"],
            &mut raw,
        );
        let container_cmd = command::parse(&raw)?;
        let container_outcome = self.setup_container(&container_cmd, ctx).await;

        let mut raw = "setup_remote_shell".to_string();
        Self::forward_params(
            cmd,
            &["host", "user", "port", "alias", "key_file", "retry_attempts"],
            &mut raw,
        );
        let remote_cmd = command::parse(&raw)?;
        let remote_outcome = self.setup_remote_shell(&remote_cmd, ctx).await;

        let describe = |outcome: &Result<Response>| match outcome {
            Ok(resp) => serde_json::json!({
                "success": true,
                "target": resp.get_str("target"),
            }),
            Err(e) => serde_json::json!({
                "success": false,
                "error": e.to_string(),
            }),
        };
        let overall = container_outcome.is_ok() && remote_outcome.is_ok();
        let mut response = Response::ok("setup_mixed_deployment")
            .with("container", describe(&container_outcome))
            .with("remote", describe(&remote_outcome));
        response.success = overall;
        Ok(response)
    }

    async fn deploy_binary(&self, cmd: &command::Command, ctx: &VarContext) -> Result<Response> {
        let target = cmd.require("target")?;
        let deployment = self.get_deployment(target).await?;

        let key = match deployment.kind {
            DeploymentKind::Container => "container",
            DeploymentKind::RemoteShell => "name",
        };
        let mut raw = format!("deploy_rexx {}={}", key, quote(&deployment.resource));
        Self::forward_deploy_params(cmd, &mut raw);
        let response = self
            .handler_for(deployment.kind)
            .handle_message(&raw, ctx)
            .await?;

        Ok(Response::ok("deploy_binary")
            .with("target", target)
            .with("rexxPath", response.get_str("rexxPath").map(str::to_string))
            .with("hasRexx", true))
    }

    async fn execute_remote(&self, cmd: &command::Command, ctx: &VarContext) -> Result<Response> {
        let target = cmd.require("target")?;
        let deployment = self.get_deployment(target).await?;
        let attempts = cmd.get_u32("retry_attempts")?.unwrap_or(1);
        let progress = cmd.get_bool("progress") || deployment.progress_enabled;

        let raw = if let Some(script) = cmd.get("script") {
            format!(
                "execute_rexx container={} script={}",
                quote(&deployment.resource),
                quote(script)
            )
        } else if let Some(file) = cmd.get("file") {
            format!(
                "execute_file container={} file={}",
                quote(&deployment.resource),
                quote(file)
            )
        } else {
            return Err(Error::MissingParameter {
                operation: "execute_remote".to_string(),
                parameter: "script|file".to_string(),
            });
        };

        self.set_status(target, DeploymentStatus::Executing).await;
        let outcome = self
            .dispatch_with_retry(self.handler_for(deployment.kind), &raw, ctx, attempts)
            .await;

        match outcome {
            Ok((exec_resp, attempts_used)) => {
                {
                    let mut deployments = self.deployments.write().await;
                    if let Some(dep) = deployments.get_mut(target) {
                        dep.status = DeploymentStatus::Ready;
                        dep.last_execution = Some(Utc::now());
                    }
                }

                let mut checkpoints = 0usize;
                if progress {
                    if let Some(output) = exec_resp.get_str("output") {
                        checkpoints = self.relay_progress(output).await;
                    }
                }

                let mut response = Response::ok("execute_remote")
                    .with("target", target)
                    .with("attempts", attempts_used as i64)
                    .with("checkpoints", checkpoints as i64);
                response.success = exec_resp.success;
                for (key, value) in exec_resp.fields {
                    response.fields.entry(key).or_insert(value);
                }
                Ok(response)
            }
            Err(e) => {
                self.set_status(target, DeploymentStatus::Failed).await;
                Err(e)
            }
        }
    }

    /// Feeds `CHECKPOINT {json}` stdout lines through the router,
    /// returning how many messages were relayed.
    async fn relay_progress(&self, output: &str) -> usize {
        let mut relayed = 0;
        let mut router = self.router.lock().await;
        for line in output.lines() {
            let Some(payload) = line.trim().strip_prefix(CHECKPOINT_MARKER) else {
                continue;
            };
            match serde_json::from_str::<serde_json::Value>(payload) {
                Ok(message) => {
                    router.route(message).await;
                    relayed += 1;
                }
                Err(e) => warn!(error = %e, "unparseable checkpoint line"),
            }
        }
        relayed
    }

    async fn monitor_deployment(
        &self,
        cmd: &command::Command,
        ctx: &VarContext,
    ) -> Result<Response> {
        let target = cmd.require("target")?;
        let deployment = self.get_deployment(target).await?;

        let mut response = Response::ok("monitor_deployment")
            .with("target", target)
            .with("deploymentType", deployment.kind.to_string())
            .with("status", deployment.status.to_string())
            .with("progressEnabled", deployment.progress_enabled)
            .with(
                "lastExecution",
                deployment.last_execution.map(|t| t.to_rfc3339()),
            );

        if cmd.get_bool("detailed") {
            let handler = self.handler_for(deployment.kind);
            let key = match deployment.kind {
                DeploymentKind::Container => "container",
                DeploymentKind::RemoteShell => "name",
            };
            let status_raw = format!("status {}={}", key, quote(&deployment.resource));
            match handler.handle_message(&status_raw, ctx).await {
                Ok(status_resp) => {
                    response = response.with(
                        "resourceStatus",
                        serde_json::Value::Object(status_resp.fields),
                    );
                }
                Err(e) => {
                    warn!(target, error = %e, "detailed status unavailable");
                    response = response.with("resourceStatusError", e.to_string());
                }
            }
            if deployment.kind == DeploymentKind::Container {
                let logs_raw = format!("logs {}={} tail=20", key, quote(&deployment.resource));
                match handler.handle_message(&logs_raw, ctx).await {
                    Ok(logs_resp) => {
                        response = response
                            .with("logs", logs_resp.get_str("logs").map(str::to_string));
                    }
                    Err(e) => {
                        warn!(target, error = %e, "logs unavailable");
                        response = response.with("logsError", e.to_string());
                    }
                }
            }
        }

        Ok(response)
    }

    /// Tears down one deployment's backing resource. The registry entry
    /// is removed even when the backend refuses; the registry tracks our
    /// intent, the backend output reports the discrepancy.
    async fn teardown(&self, deployment: &Deployment, ctx: &VarContext) -> Option<String> {
        let raw = match deployment.kind {
            DeploymentKind::Container => {
                format!("remove container={} force=true", quote(&deployment.resource))
            }
            DeploymentKind::RemoteShell => {
                format!("disconnect name={}", quote(&deployment.resource))
            }
        };
        match self
            .handler_for(deployment.kind)
            .handle_message(&raw, ctx)
            .await
        {
            Ok(_) => None,
            Err(e) => {
                warn!(target = %deployment.target, error = %e, "teardown failed");
                Some(e.to_string())
            }
        }
    }

    async fn cleanup_deployment(
        &self,
        cmd: &command::Command,
        ctx: &VarContext,
    ) -> Result<Response> {
        let target = cmd.require("target")?;
        let deployment = self.get_deployment(target).await?;

        let teardown_error = self.teardown(&deployment, ctx).await;
        self.deployments.write().await.remove(target);

        info!(target, "deployment cleaned up");
        let mut response = Response::ok("cleanup_deployment")
            .with("target", target)
            .with("removed", true)
            .with("status", DeploymentStatus::CleanedUp.to_string());
        if let Some(error) = teardown_error {
            response = response.with("teardownError", error);
        }
        Ok(response)
    }

    async fn cleanup_all(&self, ctx: &VarContext) -> Result<Response> {
        let snapshot: Vec<Deployment> =
            self.deployments.read().await.values().cloned().collect();
        let mut errors = Vec::new();
        for deployment in &snapshot {
            if let Some(error) = self.teardown(deployment, ctx).await {
                errors.push(serde_json::json!({
                    "target": deployment.target,
                    "error": error,
                }));
            }
        }
        {
            let mut deployments = self.deployments.write().await;
            for deployment in &snapshot {
                deployments.remove(&deployment.target);
            }
        }

        info!(removed = snapshot.len(), "all deployments cleaned up");
        let mut response =
            Response::ok("cleanup_all_deployments").with("removedCount", snapshot.len() as i64);
        if !errors.is_empty() {
            response = response.with("teardownErrors", serde_json::Value::Array(errors));
        }
        Ok(response)
    }

    async fn deploy_and_execute(
        &self,
        cmd: &command::Command,
        ctx: &VarContext,
    ) -> Result<Response> {
        let image = cmd.require("image")?;
        cmd.require_any(&["script", "file"])?;
        let attempts = cmd
            .get_u32("retry_attempts")?
            .unwrap_or(self.default_retries);
        let name = match cmd.get("name") {
            Some(name) => name.to_string(),
            None => format!(
                "oneshot-{}-{}",
                std::process::id(),
                self.oneshot_seq.fetch_add(1, Ordering::Relaxed)
            ),
        };

        let create_raw = format!("create image={} name={}", quote(image), quote(&name));
        self.dispatch_with_retry(self.container.as_ref(), &create_raw, ctx, attempts)
            .await?;

        if cmd.get("rexx_binary").is_some() {
            let mut raw = format!("deploy_rexx container={}", quote(&name));
            Self::forward_deploy_params(cmd, &mut raw);
            if let Err(e) = self.container.handle_message(&raw, ctx).await {
                // The transient resource must not outlive the failure.
                self.teardown_container(&name, ctx).await;
                return Err(e);
            }
        }

        let exec_raw = if let Some(script) = cmd.get("script") {
            format!("execute_rexx container={} script={}", quote(&name), quote(script))
        } else {
            // Presence checked above.
            let file = cmd.get("file").unwrap_or_default();
            format!("execute_file container={} file={}", quote(&name), quote(file))
        };
        let outcome = self.container.handle_message(&exec_raw, ctx).await;

        // Teardown is unconditional: the transient resource is removed on
        // success and failure paths alike.
        self.teardown_container(&name, ctx).await;

        let exec_resp = outcome?;
        let mut response = Response::ok("deploy_and_execute")
            .with("deploymentType", "oneshot_container")
            .with("cleanedUp", true)
            .with("name", name);
        response.success = exec_resp.success;
        for (key, value) in exec_resp.fields {
            response.fields.entry(key).or_insert(value);
        }
        Ok(response)
    }

    async fn teardown_container(&self, name: &str, ctx: &VarContext) {
        let raw = format!("remove container={} force=true", quote(name));
        if let Err(e) = self.container.handle_message(&raw, ctx).await {
            warn!(container = name, error = %e, "container teardown failed");
        }
    }
}
