//! # rexxrun
//!
//! **Provisioning and Remote-Execution Backends for a REXX Scripting Runtime**
//!
//! This crate lets REXX scripts provision isolated execution environments
//! and run script fragments inside them, through the language's ADDRESS
//! mechanism. A script says `ADDRESS PODMAN "create image=... name=..."`
//! and this crate parses the command, validates it against a security
//! policy, drives the backend CLI tool, and reports a structured result.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            rexxrun                                  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                  AddressHandler Trait                       │    │
//! │  │   initialize(config) → handle_message(command, context)     │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                Shared Pipeline Per Operation              │      │
//! │  │  parse + interpolate → policy checks → capacity check →   │      │
//! │  │  process gateway → result translation → registry update   │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                        Backend Handlers                             │
//! │ ┌────────────────┐ ┌───────────────┐ ┌──────────┐ ┌──────────────┐  │
//! │ │ContainerHandler│ │ NspawnHandler │ │ Proxmox  │ │ RemoteShell  │  │
//! │ │ podman/docker  │ │  machinectl   │ │   pct    │ │   ssh/scp    │  │
//! │ └────────────────┘ └───────────────┘ └──────────┘ └──────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Above the handlers, [`orchestrator::DeploymentOrchestrator`] composes a
//! container backend and a remote-shell backend behind backend-agnostic
//! deployment commands with retry and cleanup. Alongside them,
//! [`checkpoint`] carries progress messages and the library-resolution
//! protocol between a remotely-executing script and the host runtime.
//!
//! # Resource Lifecycle
//!
//! ```text
//!   ┌─────────┐  create   ┌─────────┐  start   ┌─────────┐
//!   │ (none)  │ ────────► │ Created │ ───────► │ Running │
//!   └─────────┘           └─────────┘          └────┬────┘
//!                              │                    │ stop
//!                              │ remove             ▼
//!                              │               ┌─────────┐
//!                              ▼               │ Stopped │
//!                        ┌───────────┐         └────┬────┘
//!                        │ Destroyed │ ◄────────────┘
//!                        └───────────┘    remove
//! ```
//!
//! Destroyed is terminal; the registry rejects further transitions.
//!
//! # Security Model
//!
//! Every externally-influenced value passes a [`policy::SecurityPolicy`]
//! check before any process is spawned:
//!
//! | Mode       | Images/Templates/Hosts | Paths              | Limits    |
//! |------------|------------------------|--------------------|-----------|
//! | permissive | anything               | anything           | unchecked |
//! | moderate   | anything               | deny-prefix list   | ceilings  |
//! | strict     | allow-list only        | allow-list only    | ceilings  |
//!
//! Backend tools are always invoked with direct argument vectors, never
//! through a shell, so command strings cannot inject into the host.
//!
//! # Example
//!
//! ```rust,ignore
//! use rexxrun::{AddressHandler, ContainerHandler, HandlerConfig, SystemGateway};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> rexxrun::Result<()> {
//!     let mut handler = ContainerHandler::new(Arc::new(SystemGateway::new()));
//!     handler.initialize(HandlerConfig::default()).await?;
//!
//!     let ctx = HashMap::new();
//!     let created = handler
//!         .handle_message(r#"create image=debian:stable name=worker1"#, &ctx)
//!         .await?;
//!     println!("created: {}", created.get_str("containerId").unwrap_or("?"));
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod command;
pub mod constants;
pub mod error;
pub mod handlers;
pub mod orchestrator;
pub mod policy;
pub mod process;
pub mod resource;

// Re-exports
pub use checkpoint::{ChannelTransport, CheckpointRouter, CheckpointTransport, LibraryResolver};
pub use command::{Command, VarContext};
pub use error::{Error, Result};
pub use handlers::{
    AddressHandler, ContainerHandler, HandlerConfig, NspawnHandler, ProxmoxHandler,
    RemoteShellHandler, Response,
};
pub use orchestrator::{DeploymentOrchestrator, OrchestratorConfig};
pub use policy::{SecurityMode, SecurityPolicy};
pub use process::{ExecSpec, ProcessGateway, ProcessResult, SystemGateway};
pub use resource::{BackendFlavor, ManagedResource, ResourceRegistry, ResourceStatus};
