//! Sandbox admission boundary.
//!
//! Before a tool command is allowed to spawn, it passes through this
//! boundary: command/argument validation against one consolidated
//! dangerous-pattern list, path admission against allow/deny lists, and
//! environment/flag filtering. The boundary holds no state machine; each
//! call is independent and side-effect free, so admitting the same
//! `(command, args, config)` tuple twice always yields the same answer.
//! The eventual process spawn is performed by the caller after admission.
//!
//! ## Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//! use warden::observer::NullObserver;
//! use warden::sandbox::{SandboxBoundary, SandboxSettings};
//!
//! let settings = SandboxSettings {
//!     blocked_paths: vec!["/etc".into()],
//!     ..Default::default()
//! };
//! let boundary = SandboxBoundary::new(settings, Arc::new(NullObserver));
//! let config = boundary.config_for(&BTreeMap::new());
//!
//! let admission = boundary.admit("cat", &["/etc/passwd".into()], &config);
//! assert!(!admission.is_allowed());
//! ```

mod command;
mod env;

use std::collections::BTreeMap;
use std::sync::Arc;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::observer::{Observer, TelemetryEvent};

pub(crate) use command::dangerous_patterns;

/// The kind of access a path is being admitted for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    /// Reading file contents.
    Read,
    /// Creating or modifying files.
    Write,
    /// Executing a script.
    Execute,
}

/// The outcome of an admission check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    /// The command or path may proceed.
    Allowed,
    /// The command or path is refused, naming the violated constraint.
    Denied {
        /// The specific violated constraint.
        reason: String,
    },
}

impl Admission {
    /// Returns true if admission was granted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }

    /// The denial reason, if denied.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Admission::Allowed => None,
            Admission::Denied { reason } => Some(reason),
        }
    }
}

/// Session-level sandbox settings, consumed from configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxSettings {
    /// When true, all write admissions are denied.
    pub read_only: bool,
    /// Memory limit handed to the sandbox launcher (e.g. `"512m"`).
    pub memory_limit: Option<String>,
    /// CPU limit handed to the sandbox launcher.
    pub cpu_limit: Option<String>,
    /// Whether the sandboxed process may reach the network.
    pub network_access: bool,
    /// Paths reads/writes are restricted to; empty means unrestricted
    /// (aside from `blocked_paths`). Entries may be prefixes or globs.
    pub allowed_paths: Vec<String>,
    /// Paths that are never admitted, regardless of `allowed_paths`.
    pub blocked_paths: Vec<String>,
    /// Sandbox launcher flags; filtered to the recognized-prefix set.
    pub flags: Vec<String>,
    /// Wall-clock timeout for a sandboxed tool execution, in
    /// milliseconds. Deliberately above the hook default so a tool's own
    /// hooks cannot outlive it.
    pub timeout_ms: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            read_only: false,
            memory_limit: None,
            cpu_limit: None,
            network_access: false,
            allowed_paths: Vec::new(),
            blocked_paths: Vec::new(),
            flags: Vec::new(),
            timeout_ms: 30_000,
        }
    }
}

/// Per-call sandbox configuration: session settings plus the filtered
/// environment for one tool-execution request. Not mutated after
/// construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxConfig {
    /// When true, write admissions are denied.
    pub read_only: bool,
    /// Memory limit passthrough for the launcher.
    pub memory_limit: Option<String>,
    /// CPU limit passthrough for the launcher.
    pub cpu_limit: Option<String>,
    /// Network access passthrough for the launcher.
    pub network_access: bool,
    /// Admitted path prefixes/globs; empty means unrestricted.
    pub allowed_paths: Vec<String>,
    /// Refused path prefixes/globs.
    pub blocked_paths: Vec<String>,
    /// The environment the child will receive, after filtering.
    pub environment: BTreeMap<String, String>,
    /// Launcher flags that survived the recognized-prefix filter.
    pub flags: Vec<String>,
    /// Wall-clock timeout for the execution, in milliseconds.
    pub timeout_ms: u64,
}

/// The sandbox admission boundary.
///
/// Owns the single compiled dangerous-command pattern list; other
/// components consult this boundary instead of re-declaring patterns.
pub struct SandboxBoundary {
    settings: SandboxSettings,
    dangerous: Vec<(Regex, &'static str)>,
    observer: Arc<dyn Observer>,
}

impl std::fmt::Debug for SandboxBoundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxBoundary")
            .field("settings", &self.settings)
            .field("dangerous_patterns", &self.dangerous.len())
            .finish_non_exhaustive()
    }
}

impl SandboxBoundary {
    /// Create a boundary from session settings.
    pub fn new(settings: SandboxSettings, observer: Arc<dyn Observer>) -> Self {
        Self {
            settings,
            dangerous: dangerous_patterns(),
            observer,
        }
    }

    /// The session settings this boundary was built from.
    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// Build the per-call configuration for one tool-execution request.
    ///
    /// The requested environment is filtered against the hard-coded
    /// sensitive-key denylist and key-shape rule, and dynamic-linker
    /// injection variables are stripped unconditionally; launcher flags
    /// are filtered to the recognized-prefix allowlist.
    pub fn config_for(&self, requested_env: &BTreeMap<String, String>) -> SandboxConfig {
        SandboxConfig {
            read_only: self.settings.read_only,
            memory_limit: self.settings.memory_limit.clone(),
            cpu_limit: self.settings.cpu_limit.clone(),
            network_access: self.settings.network_access,
            allowed_paths: self.settings.allowed_paths.clone(),
            blocked_paths: self.settings.blocked_paths.clone(),
            environment: env::filter_environment(requested_env),
            flags: env::filter_flags(&self.settings.flags),
            timeout_ms: self.settings.timeout_ms,
        }
    }

    /// Validate a concrete command invocation against the boundary.
    ///
    /// Rejects shell metacharacters and newlines, the dangerous-command
    /// pattern list, path traversal, absolute paths into OS-sensitive
    /// directories, and path-shaped arguments that fail path admission.
    pub fn admit(&self, command: &str, args: &[String], config: &SandboxConfig) -> Admission {
        let admission = self.check_command(command, args, config);
        if let Admission::Denied { reason } = &admission {
            self.observer.report(TelemetryEvent::SandboxDenied {
                reason: reason.clone(),
            });
        }
        admission
    }

    fn check_command(&self, command: &str, args: &[String], config: &SandboxConfig) -> Admission {
        for text in std::iter::once(command).chain(args.iter().map(String::as_str)) {
            if let Some(c) = command::find_metacharacter(text) {
                return Admission::Denied {
                    reason: format!("shell metacharacter {c:?} in {text:?}"),
                };
            }
            if text.contains("..") {
                return Admission::Denied {
                    reason: format!("path traversal sequence in {text:?}"),
                };
            }
        }

        let joined = if args.is_empty() {
            command.to_string()
        } else {
            format!("{command} {}", args.join(" "))
        };
        for text in std::iter::once(joined.as_str())
            .chain(std::iter::once(command))
            .chain(args.iter().map(String::as_str))
        {
            for (pattern, label) in &self.dangerous {
                if pattern.is_match(text) {
                    return Admission::Denied {
                        reason: format!("disallowed command: {label}"),
                    };
                }
            }
        }

        for arg in args {
            if command::is_sensitive_path(arg) {
                return Admission::Denied {
                    reason: format!("access to protected system path {arg:?}"),
                };
            }
            if arg.starts_with('/') {
                let admission = self.admit_path(arg, AccessKind::Read, config);
                if !admission.is_allowed() {
                    return admission;
                }
            }
        }

        Admission::Allowed
    }

    /// Check whether a path may be accessed with the given kind.
    pub fn admit_path(&self, path: &str, access: AccessKind, config: &SandboxConfig) -> Admission {
        if access == AccessKind::Write && config.read_only {
            return Admission::Denied {
                reason: format!("write to {path:?} denied: sandbox is read-only"),
            };
        }

        for blocked in &config.blocked_paths {
            if path_under(path, blocked) {
                return Admission::Denied {
                    reason: format!("path {path:?} is under blocked path {blocked:?}"),
                };
            }
        }

        if !config.allowed_paths.is_empty()
            && !config
                .allowed_paths
                .iter()
                .any(|allowed| path_under(path, allowed))
        {
            return Admission::Denied {
                reason: format!("path {path:?} is outside the allowed paths"),
            };
        }

        if access == AccessKind::Execute && !command::has_executable_extension(path) {
            return Admission::Denied {
                reason: format!("{path:?} is not a recognized executable script"),
            };
        }

        Admission::Allowed
    }
}

/// Whether `path` falls under a configured entry. Entries are plain
/// prefixes (`/etc`) or glob patterns (`/home/*/.cache`).
fn path_under(path: &str, entry: &str) -> bool {
    let entry = entry.trim_end_matches('/');
    if entry.is_empty() {
        return false;
    }
    if entry.contains(['*', '?', '[']) {
        return glob::Pattern::new(entry).is_ok_and(|p| p.matches(path));
    }
    path == entry || path.starts_with(&format!("{entry}/"))
}
