//! Rule evaluation and verdicts.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The outcome a policy rule (or the built-in default) assigns to a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    /// The call may proceed without confirmation.
    Allow,
    /// The call is refused.
    Deny,
    /// The call requires interactive confirmation.
    AskUser,
}

/// Whether a human is available to answer an `AskUser` verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// A user is present and can confirm or refuse.
    Interactive,
    /// No user is available; `AskUser` is deterministically downgraded to
    /// `Deny` after rule resolution.
    Headless,
}

/// Capability tag for a tool, supplied by the tool registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolKind {
    /// The tool only observes state; the default verdict is `Allow`.
    ReadOnly,
    /// The tool writes or executes; the default verdict is `AskUser`.
    Mutating,
}

/// Per-tool capability profile supplied by the tool registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ToolProfile {
    /// Read-only vs mutating, driving the no-rule-matched default.
    pub kind: ToolKind,
    /// Whether the tool executes shell command text. `command_prefix`
    /// rules only apply to shell-executing tools.
    pub shell: bool,
}

impl ToolProfile {
    /// Profile for a read-only tool.
    pub fn read_only() -> Self {
        Self {
            kind: ToolKind::ReadOnly,
            shell: false,
        }
    }

    /// Profile for a mutating (write/execute) tool.
    pub fn mutating() -> Self {
        Self {
            kind: ToolKind::Mutating,
            shell: false,
        }
    }

    /// Profile for a shell-executing tool (always mutating).
    pub fn shell() -> Self {
        Self {
            kind: ToolKind::Mutating,
            shell: true,
        }
    }
}

/// Source of per-tool capability tags.
///
/// The default decision table is owned by the tool registry (an external
/// collaborator), not hard-coded in the engine. Implementations must be
/// thread-safe; evaluation happens concurrently across in-flight calls.
pub trait CapabilityProvider: Send + Sync {
    /// The capability profile for a tool.
    ///
    /// Tools the registry does not know are treated as mutating, so the
    /// conservative `AskUser` default applies.
    fn profile(&self, tool_name: &str) -> ToolProfile;
}

/// A fixed capability table backed by a map.
///
/// Tools without an entry are treated as mutating; nothing is guessed
/// from the tool name.
#[derive(Clone, Debug, Default)]
pub struct StaticCapabilities {
    profiles: HashMap<String, ToolProfile>,
}

impl StaticCapabilities {
    /// Create an empty table (every tool is treated as mutating).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool's profile.
    pub fn with_tool(mut self, name: impl Into<String>, profile: ToolProfile) -> Self {
        self.profiles.insert(name.into(), profile);
        self
    }
}

impl CapabilityProvider for StaticCapabilities {
    fn profile(&self, tool_name: &str) -> ToolProfile {
        self.profiles
            .get(tool_name)
            .copied()
            .unwrap_or_else(ToolProfile::mutating)
    }
}

/// One entry in the ordered policy rule set. Immutable once loaded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    /// Tool this rule applies to; absent means the rule is global.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Command-text prefix; only matched when the tool is shell-executing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_prefix: Option<String>,
    /// The decision this rule renders when it wins.
    pub decision: PolicyDecision,
    /// Rules are evaluated in descending priority.
    pub priority: i32,
}

impl PolicyRule {
    /// Tie-break rank: prefix+tool beats tool-only beats global.
    fn specificity(&self) -> u8 {
        let tool = u8::from(self.tool_name.is_some());
        let prefix = u8::from(self.command_prefix.is_some());
        tool * 2 + prefix
    }

    fn matches(&self, tool_name: &str, command_text: Option<&str>, shell: bool) -> bool {
        if let Some(rule_tool) = &self.tool_name
            && rule_tool != tool_name
        {
            return false;
        }
        match &self.command_prefix {
            None => true,
            // Prefix rules are meaningless for tools that do not execute
            // command text, and cannot match a call without any.
            Some(prefix) => {
                shell
                    && command_text
                        .is_some_and(|text| text.trim_start().starts_with(prefix.trim()))
            }
        }
    }
}

/// The result of evaluating one tool call against the rule set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyVerdict {
    /// The effective decision, after any headless downgrade.
    pub decision: PolicyDecision,
    /// The rule that determined the verdict, if any matched. Recorded
    /// before the headless downgrade so telemetry can still see which
    /// rule was hit.
    pub matched_rule: Option<PolicyRule>,
    /// True when an `AskUser` resolution was downgraded to `Deny`
    /// because the session is headless.
    pub downgraded: bool,
}

impl PolicyVerdict {
    /// Returns true if the call may proceed without confirmation.
    pub fn is_allowed(&self) -> bool {
        self.decision == PolicyDecision::Allow
    }

    /// Returns true if the call is refused.
    pub fn is_denied(&self) -> bool {
        self.decision == PolicyDecision::Deny
    }
}

/// The policy engine: an immutable, ordered rule table plus the registry's
/// capability tags.
///
/// Evaluation is deterministic: identical (rules, call, mode) inputs always
/// yield identical verdicts.
pub struct PolicyEngine {
    /// Sorted by descending (priority, specificity) at construction so the
    /// first matching rule wins.
    rules: Vec<PolicyRule>,
    capabilities: Arc<dyn CapabilityProvider>,
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("rules", &self.rules.len())
            .finish_non_exhaustive()
    }
}

impl PolicyEngine {
    /// Create an engine from a rule set and a capability provider.
    ///
    /// The rule order given here does not matter; selection is by
    /// descending priority with the specificity tie-break
    /// (prefix+tool > tool-only > global).
    pub fn new(mut rules: Vec<PolicyRule>, capabilities: Arc<dyn CapabilityProvider>) -> Self {
        rules.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.specificity().cmp(&a.specificity()))
        });
        Self {
            rules,
            capabilities,
        }
    }

    /// The capability profile the registry reports for a tool.
    pub fn profile(&self, tool_name: &str) -> ToolProfile {
        self.capabilities.profile(tool_name)
    }

    /// Evaluate one tool call.
    ///
    /// `command_text` is the shell command line for shell-executing tools
    /// and `None` otherwise. In [`ExecutionMode::Headless`] an `AskUser`
    /// resolution is downgraded to `Deny` after rule selection, so the
    /// matched rule is still recorded in the verdict.
    pub fn evaluate(
        &self,
        tool_name: &str,
        command_text: Option<&str>,
        mode: ExecutionMode,
    ) -> PolicyVerdict {
        let profile = self.capabilities.profile(tool_name);

        let matched = self
            .rules
            .iter()
            .find(|rule| rule.matches(tool_name, command_text, profile.shell));

        let resolved = match matched {
            Some(rule) => rule.decision,
            None => match profile.kind {
                ToolKind::ReadOnly => PolicyDecision::Allow,
                ToolKind::Mutating => PolicyDecision::AskUser,
            },
        };

        // The downgrade happens after rule resolution so telemetry can
        // record which rule was hit even though the effective decision
        // changed.
        let (decision, downgraded) = match (mode, resolved) {
            (ExecutionMode::Headless, PolicyDecision::AskUser) => (PolicyDecision::Deny, true),
            _ => (resolved, false),
        };

        PolicyVerdict {
            decision,
            matched_rule: matched.cloned(),
            downgraded,
        }
    }
}
