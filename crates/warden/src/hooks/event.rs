//! Lifecycle events and hook definitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default timeout for a hook entry that does not declare one.
pub const DEFAULT_HOOK_TIMEOUT_MS: u64 = 5_000;

/// A named point in the agent's turn at which hooks and policy are
/// consulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HookEvent {
    /// Start of a user-visible agent turn.
    BeforeAgent,
    /// A model request is about to be sent.
    BeforeModel,
    /// A model response has been received.
    AfterModel,
    /// The tool set for this turn is about to be offered to the model.
    BeforeToolSelection,
    /// A proposed tool call is about to execute.
    BeforeTool,
    /// A tool call has finished.
    AfterTool,
    /// A sub-agent is about to be spawned.
    BeforeSubAgent,
    /// A sub-agent has completed.
    AfterSubAgent,
    /// The agent turn has completed.
    AfterAgent,
    /// An informational notification; hooks observe, decisions are ignored.
    Notification,
}

impl HookEvent {
    /// The wire name of the event, as written in configuration and in the
    /// `hook_event_name` payload field.
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::BeforeAgent => "BeforeAgent",
            HookEvent::BeforeModel => "BeforeModel",
            HookEvent::AfterModel => "AfterModel",
            HookEvent::BeforeToolSelection => "BeforeToolSelection",
            HookEvent::BeforeTool => "BeforeTool",
            HookEvent::AfterTool => "AfterTool",
            HookEvent::BeforeSubAgent => "BeforeSubAgent",
            HookEvent::AfterSubAgent => "AfterSubAgent",
            HookEvent::AfterAgent => "AfterAgent",
            HookEvent::Notification => "Notification",
        }
    }

    /// True for the events whose merged hook decision is combined with a
    /// policy-engine verdict before a tool may run.
    pub fn combines_policy(&self) -> bool {
        matches!(self, HookEvent::BeforeTool)
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One runnable hook: an external command or a registered plugin method.
///
/// The configuration shape is
/// `{type: "command"|"plugin", command|package, method?, timeout}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookEntry {
    /// A shell command spawned as a subprocess.
    Command {
        /// The command string, run via the configured shell.
        command: String,
        /// Per-entry timeout in milliseconds; defaults to
        /// [`DEFAULT_HOOK_TIMEOUT_MS`].
        #[serde(default, rename = "timeout", skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// An in-process plugin method, resolved once at session start.
    Plugin {
        /// The plugin package name.
        package: String,
        /// The method to invoke; required, validated at load time.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        /// Soft deadline in milliseconds; defaults to
        /// [`DEFAULT_HOOK_TIMEOUT_MS`].
        #[serde(default, rename = "timeout", skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
}

impl HookEntry {
    /// A stable display name for records and telemetry.
    pub fn name(&self) -> String {
        match self {
            HookEntry::Command { command, .. } => command
                .split_whitespace()
                .next()
                .unwrap_or("<empty>")
                .to_string(),
            HookEntry::Plugin {
                package, method, ..
            } => match method {
                Some(method) => format!("{package}::{method}"),
                None => package.clone(),
            },
        }
    }

    /// The effective timeout for this entry.
    pub fn timeout(&self) -> Duration {
        let ms = match self {
            HookEntry::Command { timeout_ms, .. } | HookEntry::Plugin { timeout_ms, .. } => {
                timeout_ms.unwrap_or(DEFAULT_HOOK_TIMEOUT_MS)
            }
        };
        Duration::from_millis(ms)
    }
}

/// A group of hook entries bound to one lifecycle event.
///
/// Loaded once at session start from configuration and read-only for the
/// rest of the session; any number of in-flight calls may consult the
/// table concurrently.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HookDefinition {
    /// The lifecycle event this group fires on.
    pub event: HookEvent,
    /// Optional matcher against the call's tool or sub-agent name.
    /// Absent means "always". Matching is exact or substring containment
    /// of the declared matcher in the name.
    pub matcher: Option<String>,
    /// When true, entries run one at a time in declared order and stop at
    /// the first `block`. When false (the default), all entries start
    /// concurrently and are awaited together.
    pub sequential: bool,
    /// The hooks in this group, in declared order.
    pub entries: Vec<HookEntry>,
}

impl HookDefinition {
    /// Whether this group fires for the given event and subject name.
    ///
    /// Events without a tool/sub-agent subject can only be matched by
    /// groups without a matcher.
    pub fn matches(&self, event: HookEvent, subject: Option<&str>) -> bool {
        if self.event != event {
            return false;
        }
        match (&self.matcher, subject) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(matcher), Some(name)) => name == matcher || name.contains(matcher.as_str()),
        }
    }
}
