//! Session settings for the governance boundary.
//!
//! Settings are consumed once at session start and never reloaded
//! mid-session. Malformed hook or policy definitions are fatal: they are
//! reported as [`ConfigError`]s before any tool call is attempted. Every
//! later failure mode in the boundary is recovered as a structured
//! verdict instead.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hooks::{HookDefinition, HookEntry, HookEvent, PluginRegistry};
use crate::policy::PolicyRule;
use crate::sandbox::SandboxSettings;

/// A fatal configuration problem. These abort session start; nothing
/// else in the governance boundary raises.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A settings or policy file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// The file that could not be read.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// Settings were not valid JSON for the expected shape.
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    /// A hook definition failed validation.
    #[error("invalid hook definition: {0}")]
    InvalidHook(String),
    /// A `type: plugin` hook names a method that is not registered.
    #[error("unresolved plugin hook: {0}")]
    UnresolvedPlugin(String),
}

/// One hook group as written in configuration:
/// `{matcher?, sequential?, hooks: [...]}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookGroupConfig {
    /// Optional matcher against the tool or sub-agent name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matcher: Option<String>,
    /// Run entries one at a time, stopping at the first `block`.
    #[serde(default)]
    pub sequential: bool,
    /// The hook entries in declared order.
    pub hooks: Vec<HookEntry>,
}

/// Tool-related toggles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolSettings {
    /// Gates the whole hook orchestrator. When false, lifecycle events
    /// dispatch no hooks; policy and sandbox checks still apply.
    pub enable_hooks: bool,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self { enable_hooks: true }
    }
}

/// The full settings surface consumed at session start.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Hook groups keyed by lifecycle event name.
    pub hooks: BTreeMap<HookEvent, Vec<HookGroupConfig>>,
    /// The ordered policy rule set.
    pub policy: Vec<PolicyRule>,
    /// Sandbox session settings.
    pub sandbox: SandboxSettings,
    /// Tool-related toggles.
    pub tools: ToolSettings,
}

impl Settings {
    /// Parse settings from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load settings from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    /// Load additional policy rules from a standalone JSON file (the
    /// `--policy-file` surface). The file holds a JSON array of rules.
    pub fn load_policy_file(path: impl AsRef<Path>) -> Result<Vec<PolicyRule>, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Flatten the hooks table into the orchestrator's definition list,
    /// preserving declaration order within each event.
    pub fn hook_definitions(&self) -> Vec<HookDefinition> {
        self.hooks
            .iter()
            .flat_map(|(event, groups)| {
                groups.iter().map(|group| HookDefinition {
                    event: *event,
                    matcher: group.matcher.clone(),
                    sequential: group.sequential,
                    entries: group.hooks.clone(),
                })
            })
            .collect()
    }

    /// Validate the settings against the session's plugin registry.
    ///
    /// Rejects empty hook commands, zero timeouts, plugin entries
    /// without a method, and plugin methods the registry does not know.
    pub fn validate(&self, plugins: &PluginRegistry) -> Result<(), ConfigError> {
        for (event, groups) in &self.hooks {
            for group in groups {
                if group.hooks.is_empty() {
                    return Err(ConfigError::InvalidHook(format!(
                        "{event}: hook group has no entries"
                    )));
                }
                for entry in &group.hooks {
                    self.validate_entry(event, entry, plugins)?;
                }
            }
        }
        Ok(())
    }

    fn validate_entry(
        &self,
        event: &HookEvent,
        entry: &HookEntry,
        plugins: &PluginRegistry,
    ) -> Result<(), ConfigError> {
        match entry {
            HookEntry::Command {
                command,
                timeout_ms,
            } => {
                if command.trim().is_empty() {
                    return Err(ConfigError::InvalidHook(format!(
                        "{event}: command hook with empty command"
                    )));
                }
                if *timeout_ms == Some(0) {
                    return Err(ConfigError::InvalidHook(format!(
                        "{event}: hook {:?} has a zero timeout",
                        entry.name()
                    )));
                }
            }
            HookEntry::Plugin {
                package,
                method,
                timeout_ms,
            } => {
                let Some(method) = method else {
                    return Err(ConfigError::InvalidHook(format!(
                        "{event}: plugin hook for {package} is missing a method"
                    )));
                };
                if !plugins.contains(package, method) {
                    return Err(ConfigError::UnresolvedPlugin(format!(
                        "{event}: {package}::{method}"
                    )));
                }
                if *timeout_ms == Some(0) {
                    return Err(ConfigError::InvalidHook(format!(
                        "{event}: plugin hook {package}::{method} has a zero timeout"
                    )));
                }
            }
        }
        Ok(())
    }
}
