//! Tests for the remote shell handler.
//!
//! Validates connection probing, host allow-list enforcement, ssh/scp
//! argument construction from connection metadata, remote execution as
//! data, and bulk disconnect.

mod common;

use common::MockGateway;
use rexxrun::handlers::{AddressHandler, HandlerConfig, RemoteShellHandler};
use rexxrun::process::ProcessGateway;
use rexxrun::VarContext;
use std::sync::Arc;

fn ctx() -> VarContext {
    VarContext::new()
}

async fn initialized(gateway: &Arc<MockGateway>, config: HandlerConfig) -> RemoteShellHandler {
    let mut handler = RemoteShellHandler::new(gateway.clone() as Arc<dyn ProcessGateway>);
    handler.initialize(config).await.unwrap();
    handler
}

fn strict_hosts(hosts: &[&str]) -> HandlerConfig {
    HandlerConfig {
        security_mode: Some("strict".parse().unwrap()),
        allowed_hosts: hosts.iter().map(|h| h.to_string()).collect(),
        ..Default::default()
    }
}

// =============================================================================
// Connect
// =============================================================================

#[tokio::test]
async fn test_connect_probes_host_and_tracks_connection() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;

    let resp = handler
        .handle_message(
            "connect host=build.example.com user=deploy port=2222 alias=builder",
            &ctx(),
        )
        .await
        .unwrap();
    assert!(resp.success);
    assert_eq!(resp.get_str("name"), Some("builder"));
    assert_eq!(resp.get_str("status"), Some("running"));

    let probe = gateway.calls().last().unwrap().clone();
    assert_eq!(probe.program, "ssh");
    let argv = probe.args.join(" ");
    assert!(argv.contains("BatchMode=yes"));
    assert!(argv.contains("-p 2222"));
    assert!(argv.contains("ConnectTimeout=10"));
    assert!(argv.contains("deploy@build.example.com"));
    assert!(argv.ends_with("true"));

    assert!(handler.registry().contains("builder").await);
}

#[tokio::test]
async fn test_strict_mode_rejects_unlisted_host() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, strict_hosts(&["build.example.com"])).await;
    let before = gateway.call_count();

    let err = handler
        .handle_message("connect host=evil.com", &ctx())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Host evil.com not allowed by security policy");
    // Rejected before any ssh process is spawned.
    assert_eq!(gateway.call_count(), before);
    assert!(!handler.registry().contains("evil.com").await);
}

#[tokio::test]
async fn test_unreachable_host_is_not_tracked() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;

    gateway.push_failure(255, "Connection refused");
    let err = handler
        .handle_message("connect host=down.example.com", &ctx())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Connect failed: Connection refused");
    assert!(!handler.registry().contains("down.example.com").await);
}

#[tokio::test]
async fn test_connection_capacity_enforced() {
    let gateway = Arc::new(MockGateway::new());
    let config = HandlerConfig {
        max_connections: Some(1),
        ..Default::default()
    };
    let handler = initialized(&gateway, config).await;

    handler.handle_message("connect host=a.example.com", &ctx()).await.unwrap();
    let err = handler
        .handle_message("connect host=b.example.com", &ctx())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Maximum number of connections (1) reached");
}

// =============================================================================
// Execute
// =============================================================================

#[tokio::test]
async fn test_execute_sends_command_over_ssh() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;
    handler
        .handle_message("connect host=h1.example.com user=admin", &ctx())
        .await
        .unwrap();

    gateway.push_success("Linux h1\n");
    let resp = handler
        .handle_message(r#"execute host=h1.example.com command="uname -n""#, &ctx())
        .await
        .unwrap();
    assert!(resp.success);
    assert_eq!(resp.get_str("output"), Some("Linux h1\n"));

    let exec = gateway.calls().last().unwrap().clone();
    assert_eq!(exec.program, "ssh");
    assert_eq!(exec.args.last().unwrap(), "uname -n");
    assert!(exec.args.contains(&"admin@h1.example.com".to_string()));
}

#[tokio::test]
async fn test_remote_failure_is_data_not_error() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;
    handler.handle_message("connect host=h1.example.com", &ctx()).await.unwrap();

    gateway.push_failure(2, "No such file or directory");
    let resp = handler
        .handle_message(r#"execute host=h1.example.com command="cat /missing""#, &ctx())
        .await
        .unwrap();
    assert!(!resp.success);
    assert_eq!(resp.get_i64("exitCode"), Some(2));
    assert_eq!(resp.get_str("stderr"), Some("No such file or directory"));
}

// =============================================================================
// File Transfer
// =============================================================================

#[tokio::test]
async fn test_upload_uses_scp_with_port_flag() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;
    handler
        .handle_message("connect host=h1.example.com port=2222", &ctx())
        .await
        .unwrap();

    handler
        .handle_message(
            "upload host=h1.example.com local=/home/user/data.txt remote=/tmp/data.txt",
            &ctx(),
        )
        .await
        .unwrap();

    let scp = gateway.calls().last().unwrap().clone();
    assert_eq!(scp.program, "scp");
    let argv = scp.args.join(" ");
    // scp spells the port flag -P, unlike ssh.
    assert!(argv.contains("-P 2222"));
    assert!(argv.contains("/home/user/data.txt"));
    assert!(argv.ends_with("root@h1.example.com:/tmp/data.txt"));
}

#[tokio::test]
async fn test_upload_from_denied_path_is_rejected() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;
    handler.handle_message("connect host=h1.example.com", &ctx()).await.unwrap();
    let before = gateway.call_count();

    let err = handler
        .handle_message(
            "upload host=h1.example.com local=/etc/shadow remote=/tmp/x",
            &ctx(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Path /etc/shadow not allowed by security policy");
    assert_eq!(gateway.call_count(), before);
}

// =============================================================================
// Script Execution
// =============================================================================

#[tokio::test]
async fn test_execute_rexx_stages_via_scp_and_cleans_up() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;
    handler.handle_message("connect host=h1.example.com", &ctx()).await.unwrap();
    let before = gateway.call_count();

    gateway.push_success(""); // scp stage
    gateway.push_success("OK\n"); // remote interpreter
    gateway.push_success(""); // rm -f cleanup

    let resp = handler
        .handle_message(r#"execute_rexx host=h1.example.com script="SAY OK""#, &ctx())
        .await
        .unwrap();
    assert!(resp.success);
    assert_eq!(resp.get_str("output"), Some("OK\n"));

    let calls = gateway.calls();
    assert_eq!(calls.len(), before + 3);
    assert_eq!(calls[before].program, "scp");
    assert_eq!(calls[before + 1].program, "ssh");
    assert!(calls[before + 1].args.last().unwrap().starts_with("/usr/local/bin/rexx /tmp/"));
    assert!(calls[before + 2].args.last().unwrap().starts_with("rm -f /tmp/"));
}

// =============================================================================
// Disconnect
// =============================================================================

#[tokio::test]
async fn test_disconnect_removes_connection() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;
    handler.handle_message("connect host=h1.example.com", &ctx()).await.unwrap();

    let resp = handler
        .handle_message("disconnect name=h1.example.com", &ctx())
        .await
        .unwrap();
    assert_eq!(resp.get_bool("removed"), Some(true));
    assert!(!handler.registry().contains("h1.example.com").await);
}

#[tokio::test]
async fn test_disconnect_all_reports_count_and_is_idempotent() {
    let gateway = Arc::new(MockGateway::new());
    let handler = initialized(&gateway, HandlerConfig::default()).await;
    handler.handle_message("connect host=a.example.com", &ctx()).await.unwrap();
    handler.handle_message("connect host=b.example.com", &ctx()).await.unwrap();

    let resp = handler.handle_message("disconnect_all", &ctx()).await.unwrap();
    assert_eq!(resp.get_i64("removedCount"), Some(2));

    let resp = handler.handle_message("disconnect_all", &ctx()).await.unwrap();
    assert_eq!(resp.get_i64("removedCount"), Some(0));
}
