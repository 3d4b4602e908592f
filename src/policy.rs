//! Security policy engine.
//!
//! Pure validation functions over resource identifiers and limits,
//! parameterized by a strictness mode and per-handler allow-lists. Checks
//! have no side effects and are safe to call speculatively; handlers
//! MUST invoke the relevant checks before any external process is spawned.
//!
//! # Modes
//!
//! | Mode       | Behavior                                                  |
//! |------------|-----------------------------------------------------------|
//! | permissive | every check passes                                        |
//! | moderate   | allow by default, reject a fixed deny-list (default mode) |
//! | strict     | allow only allow-set members; empty set rejects all       |

use crate::constants::{DENIED_PATH_PREFIXES, MAX_CPUS, MAX_DISK_GB, MAX_MEMORY_MB, MAX_PORT};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashSet;

/// Validation strictness applied to resource identifiers and limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Every check passes.
    Permissive,
    /// Allow by default, reject the fixed deny-list.
    #[default]
    Moderate,
    /// Allow only values present in the corresponding allow-set.
    Strict,
}

impl std::fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Permissive => write!(f, "permissive"),
            Self::Moderate => write!(f, "moderate"),
            Self::Strict => write!(f, "strict"),
        }
    }
}

impl std::str::FromStr for SecurityMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "permissive" => Ok(Self::Permissive),
            "moderate" => Ok(Self::Moderate),
            "strict" => Ok(Self::Strict),
            other => Err(Error::InvalidParameter {
                parameter: "securityMode".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Resource limits extracted from a create request, in canonical units.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceLimits {
    /// Requested memory in MiB.
    pub memory_mb: Option<u64>,
    /// Requested CPU count.
    pub cpus: Option<u32>,
    /// Requested disk in GiB.
    pub disk_gb: Option<u64>,
}

/// Immutable per-handler security policy.
///
/// Built once during handler initialization from the handler's
/// recognized configuration options, then consulted before every spawn.
#[derive(Debug, Clone, Default)]
pub struct SecurityPolicy {
    mode: SecurityMode,
    allowed_images: HashSet<String>,
    allowed_templates: HashSet<String>,
    allowed_hosts: HashSet<String>,
    allowed_paths: HashSet<String>,
    allowed_volumes: HashSet<String>,
    /// Backend-specific ceilings; defaults come from [`crate::constants`].
    max_memory_mb: u64,
    max_cpus: u32,
    max_disk_gb: u64,
}

impl SecurityPolicy {
    /// Creates a policy in the given mode with default ceilings and empty
    /// allow-sets.
    pub fn new(mode: SecurityMode) -> Self {
        Self {
            mode,
            max_memory_mb: MAX_MEMORY_MB,
            max_cpus: MAX_CPUS,
            max_disk_gb: MAX_DISK_GB,
            ..Self::default()
        }
    }

    /// Returns the policy's mode.
    pub fn mode(&self) -> SecurityMode {
        self.mode
    }

    /// Replaces the image allow-set.
    pub fn with_allowed_images<I: IntoIterator<Item = String>>(mut self, names: I) -> Self {
        self.allowed_images = names.into_iter().collect();
        self
    }

    /// Replaces the template allow-set.
    pub fn with_allowed_templates<I: IntoIterator<Item = String>>(mut self, names: I) -> Self {
        self.allowed_templates = names.into_iter().collect();
        self
    }

    /// Replaces the host allow-set.
    pub fn with_allowed_hosts<I: IntoIterator<Item = String>>(mut self, names: I) -> Self {
        self.allowed_hosts = names.into_iter().collect();
        self
    }

    /// Replaces the path allow-set.
    pub fn with_allowed_paths<I: IntoIterator<Item = String>>(mut self, paths: I) -> Self {
        self.allowed_paths = paths.into_iter().collect();
        self
    }

    /// Replaces the volume host-path allow-set.
    pub fn with_allowed_volumes<I: IntoIterator<Item = String>>(mut self, paths: I) -> Self {
        self.allowed_volumes = paths.into_iter().collect();
        self
    }

    /// Overrides the backend-specific resource ceilings.
    pub fn with_ceilings(mut self, memory_mb: u64, cpus: u32, disk_gb: u64) -> Self {
        self.max_memory_mb = memory_mb;
        self.max_cpus = cpus;
        self.max_disk_gb = disk_gb;
        self
    }

    // =========================================================================
    // Pure checks
    // =========================================================================

    /// Validates a container image reference.
    pub fn validate_image(&self, name: &str) -> bool {
        match self.mode {
            SecurityMode::Permissive => true,
            SecurityMode::Moderate => true,
            SecurityMode::Strict => self.allowed_images.contains(name),
        }
    }

    /// Validates a machine/LXC template reference.
    pub fn validate_template(&self, name: &str) -> bool {
        match self.mode {
            SecurityMode::Permissive => true,
            SecurityMode::Moderate => true,
            SecurityMode::Strict => self.allowed_templates.contains(name),
        }
    }

    /// Validates a remote host name.
    pub fn validate_host(&self, name: &str) -> bool {
        match self.mode {
            SecurityMode::Permissive => true,
            SecurityMode::Moderate => true,
            SecurityMode::Strict => self.allowed_hosts.contains(name),
        }
    }

    /// Validates a host filesystem path used as a copy source/target.
    pub fn validate_path(&self, path: &str) -> bool {
        match self.mode {
            SecurityMode::Permissive => true,
            SecurityMode::Moderate => !Self::is_denied_path(path),
            SecurityMode::Strict => self.allowed_paths.contains(path),
        }
    }

    /// Validates a host path used as a volume mount source.
    pub fn validate_volume(&self, path: &str) -> bool {
        match self.mode {
            SecurityMode::Permissive => true,
            SecurityMode::Moderate => !Self::is_denied_path(path),
            SecurityMode::Strict => self.allowed_volumes.contains(path),
        }
    }

    /// Validates a port number in string form. Non-numeric ports are
    /// rejected outside permissive mode.
    pub fn validate_port_str(&self, port: &str) -> bool {
        if self.mode == SecurityMode::Permissive {
            return true;
        }
        match port.parse::<u32>() {
            Ok(n) => self.validate_port(n),
            Err(_) => false,
        }
    }

    /// Validates a numeric port. Moderate mode accepts the full valid
    /// range; strict mode rejects every port, since ports carry no
    /// allow-set that could grant one.
    pub fn validate_port(&self, port: u32) -> bool {
        match self.mode {
            SecurityMode::Permissive => true,
            SecurityMode::Moderate => port != 0 && port <= MAX_PORT,
            SecurityMode::Strict => false,
        }
    }

    /// Validates requested resource limits against the backend ceilings.
    pub fn validate_resource_limits(&self, limits: &ResourceLimits) -> bool {
        if self.mode == SecurityMode::Permissive {
            return true;
        }
        if let Some(mem) = limits.memory_mb {
            if mem > self.max_memory_mb {
                return false;
            }
        }
        if let Some(cpus) = limits.cpus {
            if cpus > self.max_cpus {
                return false;
            }
        }
        if let Some(disk) = limits.disk_gb {
            if disk > self.max_disk_gb {
                return false;
            }
        }
        true
    }

    fn is_denied_path(path: &str) -> bool {
        DENIED_PATH_PREFIXES.iter().any(|prefix| {
            path == *prefix || path.starts_with(&format!("{}/", prefix))
        })
    }

    // =========================================================================
    // Throwing wrappers
    // =========================================================================
    //
    // Handlers call these before building argument vectors; the error names
    // the offending value.
    // =========================================================================

    /// Checks an image reference, raising [`Error::PolicyViolation`] on failure.
    pub fn require_image(&self, name: &str) -> Result<()> {
        self.check(self.validate_image(name), "Image", name)
    }

    /// Checks a template reference.
    pub fn require_template(&self, name: &str) -> Result<()> {
        self.check(self.validate_template(name), "Template", name)
    }

    /// Checks a remote host name.
    pub fn require_host(&self, name: &str) -> Result<()> {
        self.check(self.validate_host(name), "Host", name)
    }

    /// Checks a host filesystem path.
    pub fn require_path(&self, path: &str) -> Result<()> {
        self.check(self.validate_path(path), "Path", path)
    }

    /// Checks a volume mount source path.
    pub fn require_volume(&self, path: &str) -> Result<()> {
        self.check(self.validate_volume(path), "Volume", path)
    }

    /// Checks a port number in string form.
    pub fn require_port(&self, port: &str) -> Result<()> {
        self.check(self.validate_port_str(port), "Port", port)
    }

    /// Checks requested resource limits.
    pub fn require_resource_limits(&self, limits: &ResourceLimits) -> Result<()> {
        if self.validate_resource_limits(limits) {
            Ok(())
        } else {
            Err(Error::PolicyViolation {
                subject: "Resource limits".to_string(),
                value: format!(
                    "memory={:?}MB cpus={:?} disk={:?}GB",
                    limits.memory_mb, limits.cpus, limits.disk_gb
                ),
            })
        }
    }

    fn check(&self, ok: bool, subject: &str, value: &str) -> Result<()> {
        if ok {
            Ok(())
        } else {
            Err(Error::PolicyViolation {
                subject: subject.to_string(),
                value: value.to_string(),
            })
        }
    }
}
