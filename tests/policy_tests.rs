//! Tests for the security policy engine.
//!
//! Validates the three strictness modes, allow-set membership, the
//! denied-path prefix list, port rules, and resource-limit ceilings.

use rexxrun::policy::{ResourceLimits, SecurityMode, SecurityPolicy};

fn strict_policy() -> SecurityPolicy {
    SecurityPolicy::new(SecurityMode::Strict)
        .with_allowed_images(["debian:stable".to_string(), "alpine:3.20".to_string()])
        .with_allowed_hosts(["build.example.com".to_string()])
        .with_allowed_paths(["/home/user/data".to_string()])
        .with_allowed_volumes(["/srv/shared".to_string()])
}

// =============================================================================
// Mode Basics
// =============================================================================

#[test]
fn test_default_mode_is_moderate() {
    assert_eq!(SecurityPolicy::default().mode(), SecurityMode::Moderate);
}

#[test]
fn test_mode_parse_round_trip() {
    for mode in [
        SecurityMode::Permissive,
        SecurityMode::Moderate,
        SecurityMode::Strict,
    ] {
        let parsed: SecurityMode = mode.to_string().parse().unwrap();
        assert_eq!(parsed, mode);
    }
}

#[test]
fn test_unknown_mode_is_rejected() {
    assert!("paranoid".parse::<SecurityMode>().is_err());
}

// =============================================================================
// Permissive Mode
// =============================================================================

#[test]
fn test_permissive_allows_everything() {
    let policy = SecurityPolicy::new(SecurityMode::Permissive);
    assert!(policy.validate_image("anything:latest"));
    assert!(policy.validate_host("evil.com"));
    assert!(policy.validate_path("/etc/shadow"));
    assert!(policy.validate_volume("/proc/self"));
    // Even port 0 and non-numeric ports pass in permissive mode.
    assert!(policy.validate_port(0));
    assert!(policy.validate_port_str("not-a-port"));
    assert!(policy.validate_resource_limits(&ResourceLimits {
        memory_mb: Some(1_000_000),
        cpus: Some(512),
        disk_gb: Some(10_000),
    }));
}

// =============================================================================
// Moderate Mode
// =============================================================================

#[test]
fn test_moderate_allows_arbitrary_identifiers() {
    let policy = SecurityPolicy::new(SecurityMode::Moderate);
    assert!(policy.validate_image("any/image:tag"));
    assert!(policy.validate_template("debian-12"));
    assert!(policy.validate_host("some.host.example"));
}

#[test]
fn test_moderate_rejects_denied_path_prefixes() {
    let policy = SecurityPolicy::new(SecurityMode::Moderate);
    for denied in ["/etc/passwd", "/root/.ssh/id_rsa", "/sys/kernel", "/proc/1"] {
        assert!(!policy.validate_path(denied), "{} should be denied", denied);
        assert!(!policy.validate_volume(denied), "{} should be denied", denied);
    }
    assert!(!policy.validate_path("/etc"));
    // Prefix match is component-wise: /etcetera is not under /etc.
    assert!(policy.validate_path("/etcetera/file"));
    assert!(policy.validate_path("/home/user/file"));
}

#[test]
fn test_moderate_port_rules() {
    let policy = SecurityPolicy::new(SecurityMode::Moderate);
    assert!(policy.validate_port(1));
    assert!(policy.validate_port(8080));
    assert!(policy.validate_port(65535));
    assert!(!policy.validate_port(0));
    assert!(!policy.validate_port(65536));
    assert!(!policy.validate_port_str("8080x"));
}

#[test]
fn test_moderate_enforces_resource_ceilings() {
    let policy = SecurityPolicy::new(SecurityMode::Moderate);
    assert!(policy.validate_resource_limits(&ResourceLimits {
        memory_mb: Some(512),
        cpus: Some(2),
        disk_gb: Some(10),
    }));
    assert!(!policy.validate_resource_limits(&ResourceLimits {
        memory_mb: Some(40_000),
        ..Default::default()
    }));
    assert!(!policy.validate_resource_limits(&ResourceLimits {
        cpus: Some(64),
        ..Default::default()
    }));
    assert!(!policy.validate_resource_limits(&ResourceLimits {
        disk_gb: Some(1024),
        ..Default::default()
    }));
    // Absent limits are not checked.
    assert!(policy.validate_resource_limits(&ResourceLimits::default()));
}

// =============================================================================
// Strict Mode
// =============================================================================

#[test]
fn test_strict_requires_allow_set_membership() {
    let policy = strict_policy();
    assert!(policy.validate_image("debian:stable"));
    assert!(!policy.validate_image("debian:latest"));
    assert!(policy.validate_host("build.example.com"));
    assert!(!policy.validate_host("evil.com"));
    assert!(policy.validate_path("/home/user/data"));
    assert!(!policy.validate_path("/home/user/other"));
    assert!(policy.validate_volume("/srv/shared"));
    assert!(!policy.validate_volume("/srv/private"));
}

#[test]
fn test_strict_empty_allow_set_rejects_all() {
    let policy = SecurityPolicy::new(SecurityMode::Strict);
    assert!(!policy.validate_image("debian:stable"));
    assert!(!policy.validate_host("localhost"));
    assert!(!policy.validate_template("any"));
}

#[test]
fn test_strict_rejects_every_port() {
    // Ports have no allow-set, so strict mode has nothing to grant one.
    let policy = SecurityPolicy::new(SecurityMode::Strict);
    assert!(!policy.validate_port(8080));
    assert!(!policy.validate_port(22));
    assert!(!policy.validate_port(0));
    assert!(!policy.validate_port_str("8080"));
    assert!(policy.require_port("8080").is_err());
}

// =============================================================================
// Throwing Wrappers
// =============================================================================

#[test]
fn test_policy_violation_message_names_the_value() {
    let policy = strict_policy();
    let err = policy.require_host("evil.com").unwrap_err();
    assert_eq!(
        err.to_string(),
        "Host evil.com not allowed by security policy"
    );

    let err = policy.require_image("debian:latest").unwrap_err();
    assert_eq!(
        err.to_string(),
        "Image debian:latest not allowed by security policy"
    );
}

#[test]
fn test_require_wrappers_pass_allowed_values() {
    let policy = strict_policy();
    assert!(policy.require_image("alpine:3.20").is_ok());
    assert!(policy.require_host("build.example.com").is_ok());
    let moderate = SecurityPolicy::new(SecurityMode::Moderate);
    assert!(moderate.require_port("22").is_ok());
}

#[test]
fn test_custom_ceilings_override_defaults() {
    let policy = SecurityPolicy::new(SecurityMode::Moderate).with_ceilings(1024, 2, 20);
    assert!(policy.validate_resource_limits(&ResourceLimits {
        memory_mb: Some(1024),
        cpus: Some(2),
        disk_gb: Some(20),
    }));
    assert!(!policy.validate_resource_limits(&ResourceLimits {
        memory_mb: Some(1025),
        ..Default::default()
    }));
}
