//! The governance facade the agent loop calls at each lifecycle point.
//!
//! [`Warden`] composes the hook orchestrator, the policy engine, and the
//! sandbox boundary into one call per lifecycle event. A tool call's fate
//! is the conjunction of all three: hooks may block or rewrite, policy
//! renders allow/deny/ask, and sandbox admission validates the concrete
//! command before it may spawn. Every failure mode past session start is
//! returned as a structured verdict plus reason; nothing here raises into
//! the agent loop.
//!
//! ## Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//! use warden::config::Settings;
//! use warden::facade::Warden;
//! use warden::policy::{ExecutionMode, StaticCapabilities, ToolProfile};
//!
//! # async fn demo() -> Result<(), warden::config::ConfigError> {
//! let settings = Settings::from_json(r#"{"policy": []}"#)?;
//! let warden = Warden::builder(settings)
//!     .session_id("session-42")
//!     .cwd("/work")
//!     .mode(ExecutionMode::Headless)
//!     .capabilities(StaticCapabilities::new().with_tool(
//!         "run_shell_command",
//!         ToolProfile::shell(),
//!     ))
//!     .build()?;
//!
//! let cancel = CancellationToken::new();
//! let outcome = warden
//!     .before_tool("run_shell_command", &json!({"command": "echo hi"}), &cancel)
//!     .await;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, Settings};
use crate::hooks::{
    DispatchOutcome, GateDecision, HookEvent, HookExecutionRecord, HookInvocationInput,
    HookOrchestrator, HookRunner, PluginHook, PluginRegistry, combine_with_policy,
    gate_from_hooks,
};
use crate::observer::{NullObserver, Observer, TelemetryEvent};
use crate::policy::{CapabilityProvider, ExecutionMode, PolicyEngine, StaticCapabilities};
use crate::sandbox::{Admission, SandboxBoundary, SandboxConfig};

/// What one lifecycle call produced for the agent loop.
#[derive(Clone, Debug)]
pub struct GateOutcome {
    /// The final verdict for the event.
    pub decision: GateDecision,
    /// The event payload after hook mutations, when the event carries
    /// one (model request/response, sub-agent inputs).
    pub mutated_payload: Option<Value>,
    /// Newline-joined `additionalContext` from all hooks.
    pub additional_context: Option<String>,
    /// Out-of-band message from the hook that set the decision.
    pub system_message: Option<String>,
    /// Tool-set restriction for this turn only.
    pub allowed_function_names: Option<Vec<String>>,
    /// One record per executed hook, for telemetry.
    pub records: Vec<HookExecutionRecord>,
}

impl GateOutcome {
    fn from_dispatch(
        decision: GateDecision,
        dispatch: DispatchOutcome,
        mutated_payload: Option<Value>,
    ) -> Self {
        Self {
            decision,
            mutated_payload,
            additional_context: dispatch.additional_context,
            system_message: dispatch.system_message,
            allowed_function_names: dispatch.allowed_function_names,
            records: dispatch.records,
        }
    }
}

/// Builder for a [`Warden`].
pub struct WardenBuilder {
    settings: Settings,
    session_id: String,
    cwd: String,
    mode: ExecutionMode,
    capabilities: Option<Arc<dyn CapabilityProvider>>,
    plugins: PluginRegistry,
    observer: Option<Arc<dyn Observer>>,
    shell: Option<Vec<String>>,
    extra_policy: Vec<crate::policy::PolicyRule>,
}

impl std::fmt::Debug for WardenBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WardenBuilder")
            .field("session_id", &self.session_id)
            .field("mode", &self.mode)
            .field("has_capabilities", &self.capabilities.is_some())
            .field("has_observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

impl WardenBuilder {
    fn new(settings: Settings) -> Self {
        Self {
            settings,
            session_id: "local".to_string(),
            cwd: ".".to_string(),
            mode: ExecutionMode::Interactive,
            capabilities: None,
            plugins: PluginRegistry::new(),
            observer: None,
            shell: None,
            extra_policy: Vec::new(),
        }
    }

    /// Set the session id stamped into every hook payload.
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Set the working directory stamped into every hook payload.
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Interactive or headless execution.
    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the tool registry's capability table.
    pub fn capabilities(mut self, capabilities: impl CapabilityProvider + 'static) -> Self {
        self.capabilities = Some(Arc::new(capabilities));
        self
    }

    /// Set the capability table from a shared handle.
    pub fn capabilities_arc(mut self, capabilities: Arc<dyn CapabilityProvider>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Register an in-process plugin hook method.
    pub fn plugin(
        mut self,
        package: impl Into<String>,
        method: impl Into<String>,
        hook: Arc<dyn PluginHook>,
    ) -> Self {
        self.plugins.register(package, method, hook);
        self
    }

    /// Set the telemetry observer.
    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Override the shell used to spawn command hooks.
    pub fn hook_shell(mut self, shell: Vec<String>) -> Self {
        self.shell = Some(shell);
        self
    }

    /// Append policy rules loaded outside the main settings file (the
    /// `--policy-file` surface; see [`Settings::load_policy_file`]).
    pub fn policy_rules(mut self, rules: Vec<crate::policy::PolicyRule>) -> Self {
        self.extra_policy.extend(rules);
        self
    }

    /// Validate the settings and construct the facade.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when hook or policy definitions are
    /// malformed or a plugin entry cannot be resolved. These are the
    /// only errors the governance boundary ever raises.
    pub fn build(self) -> Result<Warden, ConfigError> {
        self.settings.validate(&self.plugins)?;

        let observer = self
            .observer
            .unwrap_or_else(|| Arc::new(NullObserver));
        let capabilities = self
            .capabilities
            .unwrap_or_else(|| Arc::new(StaticCapabilities::new()));

        let mut rules = self.settings.policy.clone();
        rules.extend(self.extra_policy);
        let policy = PolicyEngine::new(rules, capabilities);

        let mut runner = HookRunner::new(Arc::new(self.plugins), Arc::clone(&observer));
        if let Some(shell) = self.shell {
            runner = runner.with_shell(shell);
        }
        let orchestrator = HookOrchestrator::new(self.settings.hook_definitions(), runner);
        let sandbox = SandboxBoundary::new(self.settings.sandbox.clone(), Arc::clone(&observer));

        Ok(Warden {
            policy,
            orchestrator,
            sandbox,
            observer,
            mode: self.mode,
            hooks_enabled: self.settings.tools.enable_hooks,
            session_id: self.session_id,
            cwd: self.cwd,
        })
    }
}

/// The governance boundary: one entry point per lifecycle event.
pub struct Warden {
    policy: PolicyEngine,
    orchestrator: HookOrchestrator,
    sandbox: SandboxBoundary,
    observer: Arc<dyn Observer>,
    mode: ExecutionMode,
    hooks_enabled: bool,
    session_id: String,
    cwd: String,
}

impl std::fmt::Debug for Warden {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Warden")
            .field("session_id", &self.session_id)
            .field("mode", &self.mode)
            .field("hooks_enabled", &self.hooks_enabled)
            .finish_non_exhaustive()
    }
}

impl Warden {
    /// Start building a facade from session settings.
    pub fn builder(settings: Settings) -> WardenBuilder {
        WardenBuilder::new(settings)
    }

    /// The sandbox boundary, for callers that spawn after admission.
    pub fn sandbox(&self) -> &SandboxBoundary {
        &self.sandbox
    }

    /// The session's execution mode.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Build the per-call sandbox configuration and admit a concrete
    /// command for execution. This is the final check before the caller
    /// spawns; the returned config carries the filtered environment and
    /// launcher flags to spawn with.
    pub fn admit_execution(
        &self,
        command: &str,
        args: &[String],
        requested_env: &BTreeMap<String, String>,
    ) -> (SandboxConfig, Admission) {
        let config = self.sandbox.config_for(requested_env);
        let admission = self.sandbox.admit(command, args, &config);
        (config, admission)
    }

    /// Dispatch `BeforeAgent` hooks at the start of a turn.
    pub async fn before_agent(&self, cancel: &CancellationToken) -> GateOutcome {
        self.hook_only_event(HookEvent::BeforeAgent, self.base_input(HookEvent::BeforeAgent), cancel)
            .await
    }

    /// Dispatch `BeforeModel` hooks; the request may be rewritten.
    pub async fn before_model(
        &self,
        llm_request: Value,
        cancel: &CancellationToken,
    ) -> GateOutcome {
        let input = self
            .base_input(HookEvent::BeforeModel)
            .with_llm_request(llm_request);
        let dispatch = self.dispatch_if_enabled(HookEvent::BeforeModel, input, cancel).await;
        let decision = gate_from_hooks(&dispatch, self.mode);
        let payload = dispatch.mutated_input.llm_request.clone();
        GateOutcome::from_dispatch(decision, dispatch, payload)
    }

    /// Dispatch `AfterModel` hooks; the response may be rewritten.
    pub async fn after_model(
        &self,
        llm_response: Value,
        cancel: &CancellationToken,
    ) -> GateOutcome {
        let input = self
            .base_input(HookEvent::AfterModel)
            .with_llm_response(llm_response);
        let dispatch = self.dispatch_if_enabled(HookEvent::AfterModel, input, cancel).await;
        let decision = gate_from_hooks(&dispatch, self.mode);
        let payload = dispatch.mutated_input.llm_response.clone();
        GateOutcome::from_dispatch(decision, dispatch, payload)
    }

    /// Dispatch `BeforeToolSelection` hooks. A returned
    /// `allowed_function_names` restricts the tool set offered to the
    /// model for this turn only.
    pub async fn before_tool_selection(&self, cancel: &CancellationToken) -> GateOutcome {
        self.hook_only_event(
            HookEvent::BeforeToolSelection,
            self.base_input(HookEvent::BeforeToolSelection),
            cancel,
        )
        .await
    }

    /// Gate one proposed tool call: `BeforeTool` hooks, the policy
    /// verdict, and (for shell-executing tools) sandbox admission of the
    /// command text. Either side refusing wins.
    pub async fn before_tool(
        &self,
        tool_name: &str,
        tool_input: &Value,
        cancel: &CancellationToken,
    ) -> GateOutcome {
        let profile = self.policy.profile(tool_name);
        let command_text = if profile.shell {
            tool_input.get("command").and_then(Value::as_str)
        } else {
            None
        };

        let input = self
            .base_input(HookEvent::BeforeTool)
            .with_tool_call(tool_name, tool_input.clone());
        let dispatch = self.dispatch_if_enabled(HookEvent::BeforeTool, input, cancel).await;

        let verdict = self.policy.evaluate(tool_name, command_text, self.mode);
        self.observer.report(TelemetryEvent::PolicyEvaluated {
            tool_name: tool_name.to_string(),
            verdict: verdict.clone(),
        });
        if verdict.downgraded
            || (self.mode == ExecutionMode::Headless
                && dispatch.decision == crate::hooks::HookDecision::Ask)
        {
            self.observer.report(TelemetryEvent::AskDowngraded {
                tool_name: tool_name.to_string(),
            });
        }

        let mut decision = combine_with_policy(&dispatch, &verdict, self.mode);

        if decision.is_allowed()
            && let Some(command) = command_text
        {
            let requested_env = requested_env(tool_input);
            let config = self.sandbox.config_for(&requested_env);
            let mut parts = command.split_whitespace();
            if let Some(head) = parts.next() {
                let args: Vec<String> = parts.map(String::from).collect();
                if let Admission::Denied { reason } = self.sandbox.admit(head, &args, &config) {
                    decision = GateDecision::Deny { reason };
                }
            }
        }

        GateOutcome::from_dispatch(decision, dispatch, None)
    }

    /// Dispatch `AfterTool` hooks once a tool call finishes. A `block`
    /// here is surfaced back to the model as the tool's error result.
    pub async fn after_tool(
        &self,
        tool_name: &str,
        tool_input: &Value,
        cancel: &CancellationToken,
    ) -> GateOutcome {
        let input = self
            .base_input(HookEvent::AfterTool)
            .with_tool_call(tool_name, tool_input.clone());
        self.hook_only_event(HookEvent::AfterTool, input, cancel).await
    }

    /// Dispatch `BeforeSubAgent` hooks; the sub-agent inputs may be
    /// rewritten.
    pub async fn before_sub_agent(
        &self,
        subagent_name: &str,
        subagent_inputs: Value,
        cancel: &CancellationToken,
    ) -> GateOutcome {
        let mut input = self
            .base_input(HookEvent::BeforeSubAgent)
            .with_subagent(subagent_name);
        input.subagent_inputs = Some(subagent_inputs);
        let dispatch = self
            .dispatch_if_enabled(HookEvent::BeforeSubAgent, input, cancel)
            .await;
        let decision = gate_from_hooks(&dispatch, self.mode);
        let payload = dispatch.mutated_input.subagent_inputs.clone();
        GateOutcome::from_dispatch(decision, dispatch, payload)
    }

    /// Dispatch `AfterSubAgent` hooks once a sub-agent completes.
    pub async fn after_sub_agent(
        &self,
        subagent_name: &str,
        subagent_output: Value,
        cancel: &CancellationToken,
    ) -> GateOutcome {
        let mut input = self
            .base_input(HookEvent::AfterSubAgent)
            .with_subagent(subagent_name);
        input.subagent_output = Some(subagent_output);
        self.hook_only_event(HookEvent::AfterSubAgent, input, cancel).await
    }

    /// Dispatch `AfterAgent` hooks at the end of a turn.
    pub async fn after_agent(
        &self,
        prompt_response: &str,
        has_pending_tool_calls: bool,
        cancel: &CancellationToken,
    ) -> GateOutcome {
        let input = self
            .base_input(HookEvent::AfterAgent)
            .with_turn_result(prompt_response, has_pending_tool_calls);
        self.hook_only_event(HookEvent::AfterAgent, input, cancel).await
    }

    /// Dispatch `Notification` hooks. Decisions are ignored; the outcome
    /// always allows, but records are kept for telemetry.
    pub async fn notification(&self, cancel: &CancellationToken) -> GateOutcome {
        let input = self.base_input(HookEvent::Notification);
        let dispatch = self
            .dispatch_if_enabled(HookEvent::Notification, input, cancel)
            .await;
        GateOutcome::from_dispatch(GateDecision::Allow, dispatch, None)
    }

    fn base_input(&self, event: HookEvent) -> HookInvocationInput {
        HookInvocationInput::new(self.session_id.clone(), self.cwd.clone(), event)
    }

    async fn dispatch_if_enabled(
        &self,
        event: HookEvent,
        input: HookInvocationInput,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        if self.hooks_enabled {
            self.orchestrator.dispatch(event, input, cancel).await
        } else {
            DispatchOutcome::empty(input)
        }
    }

    async fn hook_only_event(
        &self,
        event: HookEvent,
        input: HookInvocationInput,
        cancel: &CancellationToken,
    ) -> GateOutcome {
        let dispatch = self.dispatch_if_enabled(event, input, cancel).await;
        let decision = gate_from_hooks(&dispatch, self.mode);
        GateOutcome::from_dispatch(decision, dispatch, None)
    }
}

/// The environment a tool call requested for its child process, read
/// from the `env` object of the tool input when present.
fn requested_env(tool_input: &Value) -> BTreeMap<String, String> {
    tool_input
        .get("env")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
