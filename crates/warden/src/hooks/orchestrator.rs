//! Hook group selection, execution, and decision/mutation merging.

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use super::event::{HookDefinition, HookEvent};
use super::payload::{
    HookDecision, HookExecutionRecord, HookInvocationInput, HookInvocationOutput,
};
use super::runner::{HookOutcome, HookRunner};
use crate::policy::{ExecutionMode, PolicyDecision, PolicyVerdict};

/// The combined verdict for one lifecycle event after hook decisions,
/// the policy verdict, and the headless invariant have been applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateDecision {
    /// The event may proceed.
    Allow,
    /// The event requires interactive confirmation. Never produced in
    /// headless mode.
    AskUser {
        /// Why confirmation is being requested, if a rule or hook said.
        reason: Option<String>,
    },
    /// The event is refused.
    Deny {
        /// Which rule, hook, or constraint refused it.
        reason: String,
    },
}

impl GateDecision {
    /// Returns true if the event may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }

    /// Returns true if the event was refused.
    pub fn is_denied(&self) -> bool {
        matches!(self, GateDecision::Deny { .. })
    }

    /// The denial or confirmation reason, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            GateDecision::Allow => None,
            GateDecision::AskUser { reason } => reason.as_deref(),
            GateDecision::Deny { reason } => Some(reason),
        }
    }
}

/// Everything one `dispatch` call produced: the merged decision, the
/// payload after mutations, and the execution records for telemetry.
#[derive(Clone, Debug)]
pub struct DispatchOutcome {
    /// Most-restrictive-wins merge of all executed hooks' votes.
    pub decision: HookDecision,
    /// Reason from the hook that set the merged decision.
    pub reason: Option<String>,
    /// System message from the hook that set the merged decision.
    pub system_message: Option<String>,
    /// The payload after mutation merge, in hook declaration order.
    pub mutated_input: HookInvocationInput,
    /// `additionalContext` values from all hooks, newline-joined.
    pub additional_context: Option<String>,
    /// Tool-set restriction for this turn, from the last hook that set
    /// one. Never persisted across turns.
    pub allowed_function_names: Option<Vec<String>>,
    /// One record per executed hook, in declaration order.
    pub records: Vec<HookExecutionRecord>,
}

impl DispatchOutcome {
    /// An outcome for an event where no hooks ran.
    pub fn empty(input: HookInvocationInput) -> Self {
        Self {
            decision: HookDecision::Allow,
            reason: None,
            system_message: None,
            mutated_input: input,
            additional_context: None,
            allowed_function_names: None,
            records: Vec::new(),
        }
    }
}

/// Dispatches lifecycle events to the session's hook table.
///
/// The definition table is read-only after construction and may be
/// consulted concurrently by any number of in-flight calls; all per-call
/// state lives in the [`DispatchOutcome`].
pub struct HookOrchestrator {
    definitions: Vec<HookDefinition>,
    runner: HookRunner,
}

impl std::fmt::Debug for HookOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookOrchestrator")
            .field("definitions", &self.definitions.len())
            .finish_non_exhaustive()
    }
}

impl HookOrchestrator {
    /// Create an orchestrator over a fixed definition table.
    pub fn new(definitions: Vec<HookDefinition>, runner: HookRunner) -> Self {
        Self {
            definitions,
            runner,
        }
    }

    /// Dispatch one lifecycle event to every matching hook group.
    ///
    /// Groups run in declaration order. Within a group, `sequential`
    /// entries run one at a time and stop at the first `block`;
    /// non-sequential entries all start concurrently and are awaited
    /// together, so no entry's timeout blocks another's. The final merge
    /// is deterministic given the set of results: mutations and decision
    /// reduction use declared order, not arrival order.
    pub async fn dispatch(
        &self,
        event: HookEvent,
        input: HookInvocationInput,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let subject = input.subject_name().map(str::to_owned);
        let mut outcome = DispatchOutcome::empty(input);

        for def in self
            .definitions
            .iter()
            .filter(|def| def.matches(event, subject.as_deref()))
        {
            if def.sequential {
                self.run_sequential(event, def, &mut outcome, cancel).await;
            } else {
                self.run_concurrent(event, def, &mut outcome, cancel).await;
            }
        }

        outcome
    }

    async fn run_sequential(
        &self,
        event: HookEvent,
        def: &HookDefinition,
        outcome: &mut DispatchOutcome,
        cancel: &CancellationToken,
    ) {
        for entry in &def.entries {
            let result = self
                .runner
                .run(event, entry, &outcome.mutated_input, cancel)
                .await;
            let blocked = merge_result(outcome, result);
            if blocked {
                break;
            }
        }
    }

    async fn run_concurrent(
        &self,
        event: HookEvent,
        def: &HookDefinition,
        outcome: &mut DispatchOutcome,
        cancel: &CancellationToken,
    ) {
        // All entries in the group see the same payload snapshot; their
        // mutations are applied afterwards in declared order.
        let snapshot = outcome.mutated_input.clone();
        let results = join_all(
            def.entries
                .iter()
                .map(|entry| self.runner.run(event, entry, &snapshot, cancel)),
        )
        .await;

        for result in results {
            merge_result(outcome, result);
        }
    }
}

/// Fold one hook result into the running outcome. Returns true when the
/// hook voted `block` (the sequential short-circuit condition).
///
/// A failed hook (no parsed output) contributes an implicit allow to the
/// merge, but its record is always kept — the failure is never hidden.
fn merge_result(outcome: &mut DispatchOutcome, result: HookOutcome) -> bool {
    let HookOutcome { record, output } = result;
    outcome.records.push(record);

    let Some(output) = output else {
        return false;
    };

    let decision = output.effective_decision();
    if decision > outcome.decision {
        outcome.decision = decision;
        outcome.reason = output.reason.clone();
        outcome.system_message = output.system_message.clone();
    }

    apply_mutation(outcome, &output);
    decision == HookDecision::Block
}

/// Apply one hook's payload mutations. Later hooks override earlier ones
/// on the same field, except `additionalContext`, which concatenates.
fn apply_mutation(outcome: &mut DispatchOutcome, output: &HookInvocationOutput) {
    let Some(specific) = &output.hook_specific_output else {
        return;
    };

    if let Some(context) = &specific.additional_context {
        outcome.additional_context = Some(match outcome.additional_context.take() {
            Some(existing) => format!("{existing}\n{context}"),
            None => context.clone(),
        });
    }
    // Request/response replacement is wholesale: a hook opting to replace
    // a payload takes full responsibility for its shape.
    if let Some(request) = &specific.llm_request {
        outcome.mutated_input.llm_request = Some(request.clone());
    }
    if let Some(response) = &specific.llm_response {
        outcome.mutated_input.llm_response = Some(response.clone());
    }
    if let Some(inputs) = &specific.subagent_inputs {
        outcome.mutated_input.subagent_inputs = Some(inputs.clone());
    }
    if let Some(config) = &specific.tool_config
        && let Some(names) = &config.allowed_function_names
    {
        outcome.allowed_function_names = Some(names.clone());
    }
}

/// Combine the orchestrator's merged decision with the policy engine's
/// verdict for a BeforeTool-class event.
///
/// Either side refusing wins; `ask` applies only when neither side
/// refused; `allow` only when both are silent or allowing. In headless
/// mode no `AskUser` ever escapes: a surviving `ask` from either side is
/// converted to a denial explaining that interactive confirmation is
/// unavailable.
pub fn combine_with_policy(
    outcome: &DispatchOutcome,
    verdict: &PolicyVerdict,
    mode: ExecutionMode,
) -> GateDecision {
    if outcome.decision == HookDecision::Block {
        return GateDecision::Deny {
            reason: outcome
                .reason
                .clone()
                .unwrap_or_else(|| "blocked by hook".to_string()),
        };
    }
    if verdict.decision == PolicyDecision::Deny {
        let reason = if verdict.downgraded {
            "interactive confirmation is unavailable in this mode".to_string()
        } else {
            match &verdict.matched_rule {
                Some(rule) => format!(
                    "denied by policy rule (priority {}{})",
                    rule.priority,
                    rule.tool_name
                        .as_deref()
                        .map(|t| format!(", tool {t}"))
                        .unwrap_or_default()
                ),
                None => "denied by policy".to_string(),
            }
        };
        return GateDecision::Deny { reason };
    }

    let wants_ask =
        outcome.decision == HookDecision::Ask || verdict.decision == PolicyDecision::AskUser;
    if wants_ask {
        return match mode {
            ExecutionMode::Headless => GateDecision::Deny {
                reason: "interactive confirmation is unavailable in this mode".to_string(),
            },
            ExecutionMode::Interactive => GateDecision::AskUser {
                reason: outcome.reason.clone(),
            },
        };
    }

    GateDecision::Allow
}

/// Reduce a hook-only event (no policy consultation) to a gate decision,
/// applying the same headless invariant.
pub(crate) fn gate_from_hooks(outcome: &DispatchOutcome, mode: ExecutionMode) -> GateDecision {
    match outcome.decision {
        HookDecision::Block => GateDecision::Deny {
            reason: outcome
                .reason
                .clone()
                .unwrap_or_else(|| "blocked by hook".to_string()),
        },
        HookDecision::Ask => match mode {
            ExecutionMode::Headless => GateDecision::Deny {
                reason: "interactive confirmation is unavailable in this mode".to_string(),
            },
            ExecutionMode::Interactive => GateDecision::AskUser {
                reason: outcome.reason.clone(),
            },
        },
        HookDecision::Allow => GateDecision::Allow,
    }
}
