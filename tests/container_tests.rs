//! Tests for the podman/docker container handler.
//!
//! Drives the full handler pipeline over a recording mock gateway:
//! runtime probing with fallback, argument vector construction, policy
//! and capacity ordering, lifecycle error translation, and the script
//! execution sub-protocol with unconditional cleanup.

mod common;

use common::MockGateway;
use rexxrun::handlers::{AddressHandler, ContainerHandler, HandlerConfig};
use rexxrun::process::ProcessGateway;
use rexxrun::resource::BackendFlavor;
use rexxrun::{Error, VarContext};
use std::io::Write;
use std::sync::Arc;

fn ctx() -> VarContext {
    VarContext::new()
}

async fn initialized(gateway: &Arc<MockGateway>, config: HandlerConfig) -> ContainerHandler {
    let mut handler = ContainerHandler::new(gateway.clone() as Arc<dyn ProcessGateway>);
    handler.initialize(config).await.unwrap();
    handler
}

// =============================================================================
// Runtime Probing
// =============================================================================

#[tokio::test]
async fn test_probe_selects_podman_first() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;

    assert_eq!(handler.flavor(), BackendFlavor::Podman);
    let calls = gateway.calls();
    assert_eq!(calls[0].program, "podman");
    assert_eq!(calls[0].args, vec!["--version"]);
}

#[tokio::test]
async fn test_probe_falls_back_to_docker() {
    let gateway = Arc::new(MockGateway::new());
    gateway.push_error(Error::SpawnFailed {
        program: "podman".to_string(),
        reason: "No such file or directory".to_string(),
    });
    let handler = initialized(&gateway, HandlerConfig::default()).await;

    assert_eq!(handler.flavor(), BackendFlavor::Docker);
    let calls = gateway.calls();
    assert_eq!(calls[0].program, "podman");
    assert_eq!(calls[1].program, "docker");
}

#[tokio::test]
async fn test_probe_failure_when_no_runtime_found() {
    let gateway = Arc::new(MockGateway::new());
    gateway.push_failure(127, "podman: not found");
    gateway.push_failure(127, "docker: not found");

    let mut handler = ContainerHandler::new(gateway.clone() as Arc<dyn ProcessGateway>);
    let err = handler.initialize(HandlerConfig::default()).await.unwrap_err();
    assert!(err.to_string().contains("no container runtime found"));
}

// =============================================================================
// Create
// =============================================================================

#[tokio::test]
async fn test_create_builds_run_argv_and_tracks_resource() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;
    gateway.push_success("abc123\n");

    let resp = handler
        .handle_message(
            "create image=debian:stable name=w1 memory=512 cpus=2 ports=8080:80",
            &ctx(),
        )
        .await
        .unwrap();

    assert!(resp.success);
    assert_eq!(resp.get_str("containerId"), Some("abc123"));
    assert_eq!(resp.get_str("status"), Some("created"));

    let calls = gateway.calls();
    let run = &calls[1];
    assert_eq!(run.program, "podman");
    let argv = run.args.join(" ");
    assert!(argv.starts_with("run -d --name w1"));
    assert!(argv.contains("--memory 512m"));
    assert!(argv.contains("--cpus 2"));
    assert!(argv.contains("-p 8080:80"));
    assert!(argv.contains("debian:stable"));
    // No explicit command: keep the container alive for later exec calls.
    assert!(argv.ends_with("sleep infinity"));
}

#[tokio::test]
async fn test_create_requires_name_and_image() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;

    let err = handler
        .handle_message("create image=debian:stable", &ctx())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "create requires name parameter");

    let err = handler.handle_message("create name=w1", &ctx()).await.unwrap_err();
    assert_eq!(err.to_string(), "create requires image parameter");
}

#[tokio::test]
async fn test_create_rejects_disallowed_image_before_spawn() {
    let gateway = Arc::new(MockGateway::new());
    let config = HandlerConfig {
        security_mode: Some("strict".parse().unwrap()),
        allowed_images: vec!["debian:stable".to_string()],
        ..Default::default()
    };
    let handler = initialized(&gateway, config).await;
    let probe_calls = gateway.call_count();

    let err = handler
        .handle_message("create image=evil:latest name=w1", &ctx())
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Image evil:latest not allowed by security policy"
    );
    // Policy rejection happens before any backend process is spawned.
    assert_eq!(gateway.call_count(), probe_calls);
}

#[tokio::test]
async fn test_capacity_checked_before_spawn() {
    let gateway = Arc::new(MockGateway::new());
    let config = HandlerConfig {
        max_containers: Some(1),
        ..Default::default()
    };
    let handler = initialized(&gateway, config).await;

    handler
        .handle_message("create image=debian:stable name=w1", &ctx())
        .await
        .unwrap();
    let calls_after_first = gateway.call_count();

    let err = handler
        .handle_message("create image=debian:stable name=w2", &ctx())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Maximum number of containers (1) reached");
    assert_eq!(gateway.call_count(), calls_after_first);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_start_stop_transition_status() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;
    handler
        .handle_message("create image=debian:stable name=w1", &ctx())
        .await
        .unwrap();

    let resp = handler.handle_message("start name=w1", &ctx()).await.unwrap();
    assert_eq!(resp.get_str("status"), Some("running"));

    let resp = handler.handle_message("stop name=w1", &ctx()).await.unwrap();
    assert_eq!(resp.get_str("status"), Some("stopped"));
}

#[tokio::test]
async fn test_lifecycle_failure_is_thrown_with_stderr() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;
    handler
        .handle_message("create image=debian:stable name=w1", &ctx())
        .await
        .unwrap();

    gateway.push_failure(125, "container state improper");
    let err = handler.handle_message("start name=w1", &ctx()).await.unwrap_err();
    assert_eq!(err.to_string(), "Start failed: container state improper");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_remove_running_requires_force() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;
    handler
        .handle_message("create image=debian:stable name=w1", &ctx())
        .await
        .unwrap();
    handler.handle_message("start name=w1", &ctx()).await.unwrap();
    let calls_before = gateway.call_count();

    let err = handler.handle_message("remove name=w1", &ctx()).await.unwrap_err();
    assert!(err.to_string().contains("running"));
    assert_eq!(gateway.call_count(), calls_before);

    let resp = handler
        .handle_message("remove name=w1 force=true", &ctx())
        .await
        .unwrap();
    assert_eq!(resp.get_bool("removed"), Some(true));
    let rm = gateway.calls().last().unwrap().clone();
    assert_eq!(rm.args, vec!["rm", "-f", "w1"]);
}

#[tokio::test]
async fn test_operations_on_unknown_container_are_not_found() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;

    let err = handler.handle_message("start name=ghost", &ctx()).await.unwrap_err();
    assert_eq!(err.to_string(), "Container not found: ghost");
}

#[tokio::test]
async fn test_list_reports_tracked_and_backend_output() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;
    handler
        .handle_message("create image=debian:stable name=w1", &ctx())
        .await
        .unwrap();

    gateway.push_success("w1\nstray\n");
    let resp = handler.handle_message("list", &ctx()).await.unwrap();
    assert_eq!(resp.get_i64("count"), Some(1));
    assert!(resp.get_str("backendOutput").unwrap().contains("stray"));
}

// =============================================================================
// Binary Deployment
// =============================================================================

#[tokio::test]
async fn test_deploy_rexx_copies_and_marks_executable() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;
    handler
        .handle_message("create image=debian:stable name=w1", &ctx())
        .await
        .unwrap();

    let mut binary = tempfile::NamedTempFile::new().unwrap();
    binary.write_all(b"#!/bin/true\n").unwrap();
    let path = binary.path().to_string_lossy().into_owned();

    let resp = handler
        .handle_message(
            &format!("deploy_rexx container=w1 rexx_binary={}", path),
            &ctx(),
        )
        .await
        .unwrap();
    assert_eq!(resp.get_str("rexxPath"), Some("/usr/local/bin/rexx"));
    assert_eq!(resp.get_bool("hasRexx"), Some(true));

    let calls = gateway.calls();
    let cp = &calls[calls.len() - 2];
    assert_eq!(cp.args[0], "cp");
    assert_eq!(cp.args[2], "w1:/usr/local/bin/rexx");
    let chmod = &calls[calls.len() - 1];
    assert_eq!(chmod.args, vec!["exec", "w1", "chmod", "+x", "/usr/local/bin/rexx"]);
}

#[tokio::test]
async fn test_deploy_rexx_requires_existing_local_binary() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;
    handler
        .handle_message("create image=debian:stable name=w1", &ctx())
        .await
        .unwrap();
    let calls_before = gateway.call_count();

    let err = handler
        .handle_message(
            "deploy_rexx container=w1 rexx_binary=/no/such/rexx",
            &ctx(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "RexxJS binary not found: /no/such/rexx");
    assert_eq!(gateway.call_count(), calls_before);
}

// =============================================================================
// Script Execution
// =============================================================================

#[tokio::test]
async fn test_execute_rexx_stages_runs_and_cleans_up() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;
    handler
        .handle_message("create image=debian:stable name=w1", &ctx())
        .await
        .unwrap();
    let calls_before = gateway.call_count();

    gateway.push_success(""); // cp
    gateway.push_success("HELLO\n"); // rexx run
    gateway.push_success(""); // rm -f cleanup

    let resp = handler
        .handle_message(r#"execute_rexx container=w1 script="SAY HELLO""#, &ctx())
        .await
        .unwrap();
    assert!(resp.success);
    assert_eq!(resp.get_str("output"), Some("HELLO\n"));
    assert_eq!(resp.get_i64("exitCode"), Some(0));

    let calls = gateway.calls();
    assert_eq!(calls.len(), calls_before + 3);
    assert_eq!(calls[calls_before].args[0], "cp");
    assert_eq!(calls[calls_before + 1].args[0], "exec");
    assert_eq!(calls[calls_before + 1].args[2], "/usr/local/bin/rexx");
    // Cleanup runs even on the success path.
    let cleanup = &calls[calls_before + 2];
    assert_eq!(&cleanup.args[..3], &["exec".to_string(), "w1".to_string(), "rm".to_string()]);
}

#[tokio::test]
async fn test_script_failure_is_data_not_error() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;
    handler
        .handle_message("create image=debian:stable name=w1", &ctx())
        .await
        .unwrap();
    let calls_before = gateway.call_count();

    gateway.push_success(""); // cp
    gateway.push_failure(3, "syntax error on line 1"); // rexx run
    gateway.push_success(""); // rm -f cleanup

    let resp = handler
        .handle_message(r#"execute_rexx container=w1 script="BAD SYNTAX""#, &ctx())
        .await
        .unwrap();
    assert!(!resp.success);
    assert_eq!(resp.get_i64("exitCode"), Some(3));
    assert_eq!(resp.get_str("stderr"), Some("syntax error on line 1"));
    // Guest-side cleanup still ran after the failed execution.
    assert_eq!(gateway.call_count(), calls_before + 3);
}

#[tokio::test]
async fn test_execute_runs_through_guest_shell() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;
    handler
        .handle_message("create image=debian:stable name=w1", &ctx())
        .await
        .unwrap();

    gateway.push_success("3\n");
    let resp = handler
        .handle_message(r#"execute container=w1 command="ls /tmp | wc -l""#, &ctx())
        .await
        .unwrap();
    assert!(resp.success);

    let exec = gateway.calls().last().unwrap().clone();
    assert_eq!(exec.args, vec!["exec", "w1", "sh", "-c", "ls /tmp | wc -l"]);
}

#[tokio::test]
async fn test_interpolation_resolves_context_variables() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;

    let mut ctx = VarContext::new();
    ctx.insert("worker".to_string(), "w9".to_string());
    handler
        .handle_message("create image=debian:stable name={worker}", &ctx)
        .await
        .unwrap();

    let run = gateway.calls().last().unwrap().clone();
    assert!(run.args.join(" ").contains("--name w9"));
}

#[tokio::test]
async fn test_unknown_operation_is_rejected() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;

    let err = handler.handle_message("teleport name=w1", &ctx()).await.unwrap_err();
    assert_eq!(err.to_string(), "unknown operation: teleport");
}
