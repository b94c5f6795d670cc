//! Wire payloads for the hook subprocess protocol and execution records.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::HookEvent;

/// Exit-code sentinel recorded when a hook was terminated for exceeding
/// its timeout (no real exit status exists; POSIX codes are non-negative).
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// A hook's vote on the event it observed.
///
/// The merge across hooks is most-restrictive-wins: `Block` beats `Ask`
/// beats `Allow`, which the derived ordering encodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookDecision {
    /// Let the event proceed.
    Allow,
    /// Escalate to the user for confirmation.
    Ask,
    /// Refuse the event.
    Block,
}

/// Tool-set restriction returned by a `BeforeToolSelection` hook.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    /// When present, restricts the tools offered to the model for this
    /// turn only; it does not persist across turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_function_names: Option<Vec<String>>,
}

/// Event-specific portion of a hook's stdout envelope.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HookSpecificOutput {
    /// Echo of the event the hook believes it handled.
    #[serde(
        default,
        rename = "hookEventName",
        skip_serializing_if = "Option::is_none"
    )]
    pub hook_event_name: Option<String>,
    /// Extra context to inject into the conversation. Values from
    /// multiple hooks are newline-concatenated, never overwritten.
    #[serde(
        default,
        rename = "additionalContext",
        skip_serializing_if = "Option::is_none"
    )]
    pub additional_context: Option<String>,
    /// Wholesale replacement for the outbound model request. A hook
    /// opting to replace the request takes full responsibility for its
    /// shape; no field-by-field merge is attempted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_request: Option<Value>,
    /// Wholesale replacement for the model response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_response: Option<Value>,
    /// Tool-set restriction for `BeforeToolSelection`.
    #[serde(default, rename = "toolConfig", skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,
    /// Replacement inputs for a sub-agent about to be spawned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subagent_inputs: Option<Value>,
}

/// The JSON envelope a hook prints on stdout.
///
/// All fields are optional; an empty object is a valid "no opinion"
/// response. Unknown fields are ignored.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HookInvocationOutput {
    /// The hook's vote; absent counts as `allow`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<HookDecision>,
    /// Human-readable justification, surfaced on `block`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// A message to show the user out-of-band.
    #[serde(
        default,
        rename = "systemMessage",
        skip_serializing_if = "Option::is_none"
    )]
    pub system_message: Option<String>,
    /// Event-specific payload mutations.
    #[serde(
        default,
        rename = "hookSpecificOutput",
        skip_serializing_if = "Option::is_none"
    )]
    pub hook_specific_output: Option<HookSpecificOutput>,
}

impl HookInvocationOutput {
    /// The hook's effective vote (`allow` when absent).
    pub fn effective_decision(&self) -> HookDecision {
        self.decision.unwrap_or(HookDecision::Allow)
    }
}

/// The JSON payload written to a hook's stdin, one per invocation.
///
/// The base fields are always present; event-specific fields are
/// populated per the lifecycle event being dispatched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HookInvocationInput {
    /// The governing session.
    pub session_id: String,
    /// The session working directory.
    pub cwd: String,
    /// The lifecycle event being dispatched.
    pub hook_event_name: HookEvent,
    /// Unix-epoch milliseconds at dispatch time.
    pub timestamp: u64,
    /// Tool name, for `BeforeTool`/`AfterTool`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Tool input, for `BeforeTool`/`AfterTool`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    /// Sub-agent name, for sub-agent events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subagent_name: Option<String>,
    /// Sub-agent inputs, for `BeforeSubAgent`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subagent_inputs: Option<Value>,
    /// Sub-agent output, for `AfterSubAgent`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subagent_output: Option<Value>,
    /// The turn's final response text, for `AfterAgent`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_response: Option<String>,
    /// Whether tool calls are still pending, for `AfterAgent`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_pending_tool_calls: Option<bool>,
    /// The outbound model request, for `BeforeModel`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_request: Option<Value>,
    /// The inbound model response, for `AfterModel`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_response: Option<Value>,
}

impl HookInvocationInput {
    /// Create a base payload for an event with no event-specific fields.
    pub fn new(
        session_id: impl Into<String>,
        cwd: impl Into<String>,
        event: HookEvent,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            cwd: cwd.into(),
            hook_event_name: event,
            timestamp: now_ms(),
            tool_name: None,
            tool_input: None,
            subagent_name: None,
            subagent_inputs: None,
            subagent_output: None,
            prompt_response: None,
            has_pending_tool_calls: None,
            llm_request: None,
            llm_response: None,
        }
    }

    /// Attach the tool-call fields.
    pub fn with_tool_call(mut self, tool_name: impl Into<String>, tool_input: Value) -> Self {
        self.tool_name = Some(tool_name.into());
        self.tool_input = Some(tool_input);
        self
    }

    /// Attach the sub-agent fields.
    pub fn with_subagent(mut self, name: impl Into<String>) -> Self {
        self.subagent_name = Some(name.into());
        self
    }

    /// Attach the outbound model request.
    pub fn with_llm_request(mut self, request: Value) -> Self {
        self.llm_request = Some(request);
        self
    }

    /// Attach the inbound model response.
    pub fn with_llm_response(mut self, response: Value) -> Self {
        self.llm_response = Some(response);
        self
    }

    /// Attach the turn-completion fields.
    pub fn with_turn_result(
        mut self,
        prompt_response: impl Into<String>,
        has_pending_tool_calls: bool,
    ) -> Self {
        self.prompt_response = Some(prompt_response.into());
        self.has_pending_tool_calls = Some(has_pending_tool_calls);
        self
    }

    /// The name hook matchers are tested against: the tool name for tool
    /// events, the sub-agent name for sub-agent events.
    pub fn subject_name(&self) -> Option<&str> {
        self.tool_name
            .as_deref()
            .or(self.subagent_name.as_deref())
    }
}

/// Append-only record of one hook invocation, consumed by telemetry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookExecutionRecord {
    /// Display name of the hook (command head or `package::method`).
    pub hook_name: String,
    /// The event the hook ran for.
    pub hook_event_name: HookEvent,
    /// Child exit code; [`TIMEOUT_EXIT_CODE`] on timeout or abnormal
    /// termination.
    pub exit_code: i32,
    /// Captured stdout (capped, lossily decoded).
    pub stdout: String,
    /// Captured stderr (capped, lossily decoded). Never parsed as a
    /// decision.
    pub stderr: String,
    /// Wall-clock duration of the invocation.
    pub duration_ms: u64,
    /// Derived: exit code was zero and stdout parsed as an output
    /// envelope.
    pub success: bool,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
