//! Integration tests for the governance boundary.
//!
//! These tests drive real `/bin/sh` hook subprocesses through the facade
//! and verify the end-to-end contract:
//! - hook payload delivery over stdin and decision parsing from stdout
//! - sequential short-circuit and concurrent group scheduling
//! - timeout escalation and parse-failure fallback
//! - the conjunction of hook, policy, and sandbox verdicts

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use warden::config::Settings;
use warden::facade::Warden;
use warden::observer::{Observer, TelemetryEvent};
use warden::policy::{ExecutionMode, StaticCapabilities, ToolProfile};
use warden::GateDecision;

fn capabilities() -> StaticCapabilities {
    StaticCapabilities::new()
        .with_tool("run_shell_command", ToolProfile::shell())
        .with_tool("read_file", ToolProfile::read_only())
        .with_tool("write_file", ToolProfile::mutating())
}

fn build(settings_json: &str) -> Warden {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Warden::builder(Settings::from_json(settings_json).expect("parse settings"))
        .session_id("itest")
        .cwd("/tmp")
        .capabilities(capabilities())
        .build()
        .expect("build warden")
}

fn marker_path(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("warden-itest-{}-{}", std::process::id(), name));
    let _ = std::fs::remove_file(&path);
    path
}

/// Observer that appends every event to a shared vector; exercises the
/// concurrent-append tolerance the telemetry contract requires.
#[derive(Clone, Default)]
struct Recording(Arc<Mutex<Vec<TelemetryEvent>>>);

impl Observer for Recording {
    fn report(&self, event: TelemetryEvent) {
        if let Ok(mut events) = self.0.lock() {
            events.push(event);
        }
    }
}

// =============================================================================
// Subprocess protocol
// =============================================================================

mod protocol {
    use super::*;

    #[tokio::test]
    async fn test_hook_reads_payload_and_blocks_on_match() {
        // The hook greps its stdin payload for the tool name.
        let warden = build(
            r#"{
                "hooks": {"BeforeTool": [{"hooks": [{
                    "type": "command",
                    "command": "if grep -q write_file; then echo '{\"decision\":\"block\",\"reason\":\"writes are off limits\"}'; else echo '{\"decision\":\"allow\"}'; fi"
                }]}]},
                "policy": [{"decision": "allow", "priority": 1}]
            }"#,
        );
        let cancel = CancellationToken::new();

        let outcome = warden
            .before_tool("write_file", &json!({"path": "x"}), &cancel)
            .await;
        assert_eq!(
            outcome.decision,
            GateDecision::Deny {
                reason: "writes are off limits".to_string()
            }
        );

        let outcome = warden
            .before_tool("read_file", &json!({"path": "x"}), &cancel)
            .await;
        assert!(outcome.decision.is_allowed());
    }

    #[tokio::test]
    async fn test_parse_failure_falls_back_to_allow_but_is_recorded() -> anyhow::Result<()> {
        let events = Recording::default();
        let settings = Settings::from_json(
            r#"{"hooks": {"BeforeTool": [{"hooks": [{"type": "command", "command": "echo this-is-not-json"}]}]}}"#,
        )?;
        let warden = Warden::builder(settings)
            .capabilities(capabilities())
            .observer(Arc::new(events.clone()))
            .build()?;

        let outcome = warden
            .before_tool("read_file", &json!({}), &CancellationToken::new())
            .await;

        // The hook's garbage output is an implicit allow...
        assert!(outcome.decision.is_allowed());
        // ...but the failure is never hidden.
        assert_eq!(outcome.records.len(), 1);
        assert!(!outcome.records[0].success);
        assert_eq!(outcome.records[0].exit_code, 0);

        let recorded = events.0.lock().expect("lock");
        assert!(recorded.iter().any(|e| matches!(
            e,
            TelemetryEvent::HookOutputParseFailure { .. }
        )));
        Ok(())
    }

    #[tokio::test]
    async fn test_stderr_is_captured_never_parsed() {
        // A decision printed on stderr must not count as one.
        let warden = build(
            r#"{"hooks": {"BeforeTool": [{"hooks": [{
                "type": "command",
                "command": "echo '{\"decision\":\"block\"}' >&2; echo '{\"decision\":\"allow\"}'"
            }]}]}}"#,
        );

        let outcome = warden
            .before_tool("read_file", &json!({}), &CancellationToken::new())
            .await;

        assert!(outcome.decision.is_allowed());
        assert!(outcome.records[0].stderr.contains("block"));
        assert!(outcome.records[0].success);
    }
}

// =============================================================================
// Scheduling
// =============================================================================

mod scheduling {
    use super::*;

    #[tokio::test]
    async fn test_sequential_group_short_circuits_on_block() {
        let first = marker_path("seq-first");
        let second = marker_path("seq-second");
        let settings = format!(
            r#"{{
                "hooks": {{"BeforeTool": [{{
                    "sequential": true,
                    "hooks": [
                        {{"type": "command", "command": "touch {first}; echo '{{\"decision\":\"block\",\"reason\":\"stop here\"}}'"}},
                        {{"type": "command", "command": "touch {second}; echo '{{\"decision\":\"allow\"}}'"}}
                    ]
                }}]}}
            }}"#,
            first = first.display(),
            second = second.display(),
        );
        let warden = build(&settings);

        let outcome = warden
            .before_tool("read_file", &json!({}), &CancellationToken::new())
            .await;

        assert_eq!(
            outcome.decision,
            GateDecision::Deny {
                reason: "stop here".to_string()
            }
        );
        assert!(first.exists(), "first hook must have run");
        assert!(!second.exists(), "second hook must not run after a block");
        assert_eq!(outcome.records.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_group_wall_clock_is_max_not_sum() {
        // Two one-second hooks in a non-sequential group: the group takes
        // about one second, not two.
        let warden = build(
            r#"{"hooks": {"BeforeAgent": [{"hooks": [
                {"type": "command", "command": "sleep 1; echo '{}'"},
                {"type": "command", "command": "sleep 1; echo '{}'"}
            ]}]}}"#,
        );

        let started = Instant::now();
        let outcome = warden.before_agent(&CancellationToken::new()).await;
        let elapsed = started.elapsed();

        assert!(outcome.decision.is_allowed());
        assert_eq!(outcome.records.len(), 2);
        assert!(
            elapsed >= Duration::from_millis(900),
            "hooks finished implausibly fast: {elapsed:?}"
        );
        assert!(
            elapsed < Duration::from_millis(1_700),
            "concurrent group appears serialized: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_blocking_result_in_concurrent_group_still_wins() {
        // Scenario C: first hook allows, second blocks with a reason.
        let warden = build(
            r#"{"hooks": {"BeforeTool": [{"hooks": [
                {"type": "command", "command": "echo '{\"decision\":\"allow\"}'"},
                {"type": "command", "command": "echo '{\"decision\":\"block\",\"reason\":\"policy\"}'"}
            ]}]}}"#,
        );

        let outcome = warden
            .before_tool("read_file", &json!({}), &CancellationToken::new())
            .await;

        assert_eq!(
            outcome.decision,
            GateDecision::Deny {
                reason: "policy".to_string()
            }
        );
        // No short-circuit: both hooks executed.
        assert_eq!(outcome.records.len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_does_not_stall_the_event() {
        let warden = build(
            r#"{"hooks": {"BeforeTool": [{"hooks": [
                {"type": "command", "command": "sleep 30", "timeout": 200}
            ]}]}}"#,
        );

        let started = Instant::now();
        let outcome = warden
            .before_tool("read_file", &json!({}), &CancellationToken::new())
            .await;

        // The timed-out hook votes implicit allow and is recorded failed.
        assert!(outcome.decision.is_allowed());
        assert!(!outcome.records[0].success);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancellation_emits_failed_records() {
        let warden = build(
            r#"{"hooks": {"BeforeAgent": [{"hooks": [
                {"type": "command", "command": "sleep 30"}
            ]}]}}"#,
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = warden.before_agent(&cancel).await;

        assert_eq!(outcome.records.len(), 1);
        assert!(!outcome.records[0].success);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}

// =============================================================================
// Governance conjunction
// =============================================================================

mod conjunction {
    use super::*;

    const FULL_SETTINGS: &str = r#"{
        "hooks": {"BeforeTool": [{
            "matcher": "run_shell_command",
            "hooks": [{"type": "command", "command": "echo '{\"decision\":\"allow\"}'"}]
        }]},
        "policy": [
            {"toolName": "run_shell_command", "commandPrefix": "echo", "decision": "allow", "priority": 100},
            {"toolName": "run_shell_command", "commandPrefix": "cat", "decision": "allow", "priority": 100}
        ],
        "sandbox": {"blockedPaths": ["/etc"]}
    }"#;

    #[tokio::test]
    async fn test_allowed_by_all_three_sides() {
        let warden = build(FULL_SETTINGS);

        let outcome = warden
            .before_tool(
                "run_shell_command",
                &json!({"command": "echo hi"}),
                &CancellationToken::new(),
            )
            .await;

        assert!(outcome.decision.is_allowed());
        assert_eq!(outcome.records.len(), 1);
    }

    #[tokio::test]
    async fn test_sandbox_denies_despite_hook_and_policy_allow() {
        let warden = build(FULL_SETTINGS);

        let outcome = warden
            .before_tool(
                "run_shell_command",
                &json!({"command": "cat /etc/passwd"}),
                &CancellationToken::new(),
            )
            .await;

        assert!(outcome.decision.is_denied());
        let reason = outcome.decision.reason().expect("denial reason");
        assert!(reason.contains("/etc"), "reason must name the constraint: {reason}");
    }

    #[tokio::test]
    async fn test_headless_never_surfaces_ask() -> anyhow::Result<()> {
        let settings = Settings::from_json(FULL_SETTINGS)?;
        let warden = Warden::builder(settings)
            .capabilities(capabilities())
            .mode(ExecutionMode::Headless)
            .build()?;

        // No rule matches `git push`; the mutating default would ask.
        let outcome = warden
            .before_tool(
                "run_shell_command",
                &json!({"command": "git push"}),
                &CancellationToken::new(),
            )
            .await;

        assert!(
            outcome.decision.is_denied(),
            "headless mode must deny, not ask: {:?}",
            outcome.decision
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_additional_context_flows_to_caller() {
        let warden = build(
            r#"{"hooks": {"BeforeAgent": [{"hooks": [
                {"type": "command", "command": "echo '{\"hookSpecificOutput\":{\"hookEventName\":\"BeforeAgent\",\"additionalContext\":\"from hook one\"}}'"},
                {"type": "command", "command": "echo '{\"hookSpecificOutput\":{\"hookEventName\":\"BeforeAgent\",\"additionalContext\":\"from hook two\"}}'"}
            ]}]}}"#,
        );

        let outcome = warden.before_agent(&CancellationToken::new()).await;

        let context = outcome.additional_context.expect("context");
        assert!(context.contains("from hook one"));
        assert!(context.contains("from hook two"));
    }

    #[tokio::test]
    async fn test_telemetry_sees_hook_and_policy_events() -> anyhow::Result<()> {
        let events = Recording::default();
        let settings = Settings::from_json(FULL_SETTINGS)?;
        let warden = Warden::builder(settings)
            .capabilities(capabilities())
            .observer(Arc::new(events.clone()))
            .build()?;

        warden
            .before_tool(
                "run_shell_command",
                &json!({"command": "echo hi"}),
                &CancellationToken::new(),
            )
            .await;

        let recorded = events.0.lock().expect("lock");
        assert!(recorded
            .iter()
            .any(|e| matches!(e, TelemetryEvent::HookExecuted { .. })));
        assert!(recorded
            .iter()
            .any(|e| matches!(e, TelemetryEvent::PolicyEvaluated { .. })));
        Ok(())
    }
}
