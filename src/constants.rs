//! # Provisioning Constants
//!
//! Defines the resource ceilings, timeouts, and validation patterns for the
//! provisioning layer. These constants are the **single source of truth**
//! for security-critical bounds throughout the codebase.
//!
//! ## Security Rationale
//!
//! All limits are chosen to prevent resource exhaustion while allowing
//! legitimate workloads. The moderate security mode enforces the hard
//! ceilings defined here even when no allow-lists are configured.
//!
//! ## Cross-References
//!
//! - [`crate::policy`]: Uses the ceilings and denied path prefixes
//! - [`crate::process`]: Uses the timeout defaults and SIGTERM grace
//! - [`crate::handlers`]: Uses registry capacity defaults and name validation

use std::time::Duration;

// =============================================================================
// Registry Capacity
// =============================================================================
//
// Each backend handler owns an in-memory registry of the resources it
// manages. Capacity is enforced before any external process is spawned.
// =============================================================================

/// Default maximum number of managed resources per handler instance.
///
/// **Security**: Bounds memory growth in the registry and limits how many
/// backend processes a single runaway script can provision.
pub const DEFAULT_MAX_RESOURCES: usize = 20;

// =============================================================================
// Resource Ceilings (moderate mode)
// =============================================================================
//
// Hard ceilings applied by the moderate security mode regardless of
// allow-list contents. Backend flavors may configure lower limits; these
// are the absolute upper bounds.
// =============================================================================

/// Maximum memory a single resource may request (32 GiB, in MiB).
///
/// **Security**: Prevents a single create call from reserving the host's
/// entire memory. Operators needing more must run in permissive mode.
pub const MAX_MEMORY_MB: u64 = 32_768;

/// Maximum CPU count a single resource may request.
pub const MAX_CPUS: u32 = 16;

/// Maximum disk allocation a single resource may request (GiB).
pub const MAX_DISK_GB: u64 = 512;

/// Highest valid TCP/UDP port number.
pub const MAX_PORT: u32 = 65_535;

/// Path prefixes rejected by the moderate security mode.
///
/// Mount or copy targets under these prefixes expose host configuration,
/// credentials, or kernel state to the guest.
pub const DENIED_PATH_PREFIXES: &[&str] = &["/etc", "/root", "/sys", "/proc"];

// =============================================================================
// Timeouts
// =============================================================================
//
// Every external process call MUST have a timeout. The gateway sends
// SIGTERM when the timer fires, escalating to SIGKILL after the grace
// period.
// =============================================================================

/// Default timeout for external process calls (60 seconds).
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Grace period between SIGTERM and SIGKILL for a timed-out process.
pub const SIGTERM_GRACE: Duration = Duration::from_secs(5);

/// Timeout for backend tool detection probes (`podman --version` etc.).
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// SSH connection establishment timeout passed via `-o ConnectTimeout`.
pub const SSH_CONNECT_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// Deployment Defaults
// =============================================================================

/// Default in-target path for the deployed RexxJS interpreter binary.
pub const DEFAULT_REXX_PATH: &str = "/usr/local/bin/rexx";

/// Default in-target directory for staged script files.
pub const TARGET_SCRIPT_DIR: &str = "/tmp";

/// First VMID handed out by a Proxmox handler instance.
pub const DEFAULT_START_VMID: u32 = 200;

/// Default SSH user when `user=` is not supplied on connect.
pub const DEFAULT_SSH_USER: &str = "root";

/// Fixed origin for registry-hosted library fetches in the checkpoint
/// require protocol. The full URL is composed from the library name.
pub const LIBRARY_ORIGIN: &str = "https://rexxjs-libraries.org";

// =============================================================================
// Validation Patterns
// =============================================================================
//
// Character allowlists for user-supplied identifiers. Validation is
// allowlist-based (only listed characters permitted) because resource
// names end up in argument vectors and in-target file paths.
// =============================================================================

/// Valid characters for resource names (containers, machines, aliases).
///
/// **Security**: Excludes `/`, `.`, whitespace, and shell metacharacters
/// so names are safe in argv positions and guest paths.
pub const RESOURCE_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum resource name length.
pub const MAX_RESOURCE_NAME_LEN: usize = 128;

/// Validates a resource name for safety.
///
/// Ensures names are non-empty, bounded in length, and only contain
/// characters from [`RESOURCE_NAME_VALID_CHARS`].
#[inline]
#[must_use = "validation result must be checked before using the name"]
pub fn validate_resource_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("resource name cannot be empty");
    }
    if name.len() > MAX_RESOURCE_NAME_LEN {
        return Err("resource name exceeds maximum length");
    }
    if !name.chars().all(|c| RESOURCE_NAME_VALID_CHARS.contains(c)) {
        return Err("resource name contains invalid characters");
    }
    Ok(())
}
