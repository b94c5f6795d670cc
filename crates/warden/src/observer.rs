//! Telemetry observer seam.
//!
//! Every component reports business-relevant events through a single
//! injected [`Observer`] passed in at construction; there is no
//! process-wide mutable logger singleton. Sinks must tolerate concurrent
//! reports from parallel hook groups across different tool calls.

use std::sync::Arc;

use crate::hooks::{HookEvent, HookExecutionRecord};
use crate::policy::PolicyVerdict;

/// An event the governance boundary wants an external sink to see.
#[derive(Clone, Debug)]
pub enum TelemetryEvent {
    /// A hook invocation completed (successfully or not). One per
    /// invocation, append-only.
    HookExecuted {
        /// The invocation record.
        record: HookExecutionRecord,
    },
    /// A hook exited zero but its stdout was not a parsable output
    /// envelope. The hook's vote was treated as an implicit allow, which
    /// must never be silently equated with an explicit one.
    HookOutputParseFailure {
        /// Display name of the hook.
        hook_name: String,
        /// The event the hook ran for.
        event: HookEvent,
    },
    /// The policy engine evaluated a tool call.
    PolicyEvaluated {
        /// The tool that was evaluated.
        tool_name: String,
        /// The resulting verdict, including the matched rule and whether
        /// a headless downgrade occurred.
        verdict: PolicyVerdict,
    },
    /// An `ask` outcome was deterministically converted to a denial
    /// because no user is available to answer.
    AskDowngraded {
        /// The tool whose confirmation was unavailable.
        tool_name: String,
    },
    /// The sandbox boundary refused a command or path.
    SandboxDenied {
        /// The specific violated constraint.
        reason: String,
    },
}

/// Receiver for [`TelemetryEvent`]s.
///
/// Implementations must be cheap and non-blocking; reports happen on the
/// hot path of every hook invocation and policy evaluation.
pub trait Observer: Send + Sync {
    /// Deliver one event to the sink.
    fn report(&self, event: TelemetryEvent);
}

impl Observer for Arc<dyn Observer> {
    fn report(&self, event: TelemetryEvent) {
        (**self).report(event)
    }
}

/// An observer that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullObserver;

impl Observer for NullObserver {
    fn report(&self, _event: TelemetryEvent) {}
}

/// An observer that forwards events to the `tracing` subscriber.
///
/// Denials and failures log at warn; routine evaluations at debug.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn report(&self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::HookExecuted { record } => {
                if record.success {
                    tracing::debug!(
                        hook = %record.hook_name,
                        event = %record.hook_event_name,
                        duration_ms = record.duration_ms,
                        "hook executed"
                    );
                } else {
                    tracing::warn!(
                        hook = %record.hook_name,
                        event = %record.hook_event_name,
                        exit_code = record.exit_code,
                        stderr = %record.stderr,
                        "hook failed"
                    );
                }
            }
            TelemetryEvent::HookOutputParseFailure { hook_name, event } => {
                tracing::warn!(hook = %hook_name, event = %event, "hook output was not valid JSON");
            }
            TelemetryEvent::PolicyEvaluated { tool_name, verdict } => {
                tracing::debug!(
                    tool = %tool_name,
                    decision = ?verdict.decision,
                    downgraded = verdict.downgraded,
                    "policy evaluated"
                );
            }
            TelemetryEvent::AskDowngraded { tool_name } => {
                tracing::warn!(tool = %tool_name, "confirmation unavailable in headless mode; denied");
            }
            TelemetryEvent::SandboxDenied { reason } => {
                tracing::warn!(%reason, "sandbox admission denied");
            }
        }
    }
}
