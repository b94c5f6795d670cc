//! Policy engine for tool-call governance.
//!
//! The policy engine renders an [`PolicyDecision`] for each proposed tool
//! call by evaluating an ordered rule set against the call's fingerprint
//! (tool name, and command text for shell-executing tools).
//!
//! ## Design Philosophy
//!
//! Evaluation is a pure function over the engine's immutable rule table and
//! the call's inputs. The engine never prompts, spawns, or logs on its own;
//! it only produces a [`PolicyVerdict`] that the facade combines with hook
//! decisions and sandbox admission. Rules are loaded once at session start
//! and may be read concurrently by any number of in-flight calls.
//!
//! ## Example
//!
//! ```rust
//! use warden::policy::{
//!     ExecutionMode, PolicyDecision, PolicyEngine, PolicyRule, StaticCapabilities,
//!     ToolProfile,
//! };
//! use std::sync::Arc;
//!
//! let rules = vec![PolicyRule {
//!     tool_name: Some("run_shell_command".into()),
//!     command_prefix: Some("echo".into()),
//!     decision: PolicyDecision::Allow,
//!     priority: 100,
//! }];
//! let caps = StaticCapabilities::new().with_tool("run_shell_command", ToolProfile::shell());
//! let engine = PolicyEngine::new(rules, Arc::new(caps));
//!
//! let verdict = engine.evaluate(
//!     "run_shell_command",
//!     Some("echo hi"),
//!     ExecutionMode::Interactive,
//! );
//! assert_eq!(verdict.decision, PolicyDecision::Allow);
//! ```

mod engine;

pub use engine::{
    CapabilityProvider, ExecutionMode, PolicyDecision, PolicyEngine, PolicyRule, PolicyVerdict,
    StaticCapabilities, ToolKind, ToolProfile,
};
