//! Hook invocation: subprocess spawning and in-process plugin dispatch.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::event::{HookEntry, HookEvent};
use super::payload::{
    HookExecutionRecord, HookInvocationInput, HookInvocationOutput, TIMEOUT_EXIT_CODE,
};
use crate::observer::{Observer, TelemetryEvent};

/// Per-stream capture cap. Bytes beyond the cap are dropped, not
/// buffered, to bound memory.
const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// How long a timed-out or cancelled hook gets between the graceful
/// termination signal and the forced kill.
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Exit code recorded when the hook process could not be spawned at all
/// (mirrors the shell's command-not-found convention).
const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Buffer that keeps at most `limit` bytes and silently drops the rest.
#[derive(Debug, Clone)]
pub(crate) struct CaptureBuffer {
    buffer: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl Default for CaptureBuffer {
    fn default() -> Self {
        Self::new(MAX_CAPTURE_BYTES)
    }
}

impl CaptureBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub(crate) fn write(&mut self, data: &[u8]) {
        let remaining = self.limit.saturating_sub(self.buffer.len());
        if remaining == 0 {
            self.truncated = true;
            return;
        }
        let to_write = data.len().min(remaining);
        self.buffer.extend_from_slice(&data[..to_write]);
        if to_write < data.len() {
            self.truncated = true;
        }
    }

    pub(crate) fn into_string_lossy(self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }

    #[cfg(test)]
    pub(crate) fn was_truncated(&self) -> bool {
        self.truncated
    }

    #[cfg(test)]
    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

/// Error returned by an in-process plugin hook.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PluginError(pub String);

/// An in-process hook method.
///
/// Plugin hooks run inside the host process, so there is no subprocess
/// and no termination signal; the runner applies a soft deadline instead
/// by abandoning the awaited call.
#[async_trait]
pub trait PluginHook: Send + Sync {
    /// Handle one lifecycle event and return the same envelope a command
    /// hook would print on stdout.
    async fn invoke(&self, input: &HookInvocationInput) -> Result<HookInvocationOutput, PluginError>;
}

/// Registered-capability table for plugin hooks.
///
/// Each configured `type: plugin` entry is resolved to a typed function
/// reference once at session start; no dynamic loading happens at call
/// time. Configuration naming an unregistered method is a fatal load
/// error.
#[derive(Default)]
pub struct PluginRegistry {
    methods: HashMap<String, Arc<dyn PluginHook>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin method under `package::method`.
    pub fn register(
        &mut self,
        package: impl Into<String>,
        method: impl Into<String>,
        hook: Arc<dyn PluginHook>,
    ) {
        self.methods
            .insert(format!("{}::{}", package.into(), method.into()), hook);
    }

    /// Whether `package::method` is registered.
    pub fn contains(&self, package: &str, method: &str) -> bool {
        self.methods.contains_key(&format!("{package}::{method}"))
    }

    fn resolve(&self, package: &str, method: &str) -> Option<Arc<dyn PluginHook>> {
        self.methods.get(&format!("{package}::{method}")).cloned()
    }
}

/// The result of running one hook entry.
#[derive(Debug)]
pub struct HookOutcome {
    /// The append-only execution record for telemetry.
    pub record: HookExecutionRecord,
    /// The parsed output envelope, when stdout held one.
    pub output: Option<HookInvocationOutput>,
}

impl HookOutcome {
    fn failure(
        entry: &HookEntry,
        event: HookEvent,
        exit_code: i32,
        stderr: String,
        started: Instant,
    ) -> Self {
        Self {
            record: HookExecutionRecord {
                hook_name: entry.name(),
                hook_event_name: event,
                exit_code,
                stdout: String::new(),
                stderr,
                duration_ms: started.elapsed().as_millis() as u64,
                success: false,
            },
            output: None,
        }
    }
}

/// Runs one hook entry at a time: spawns command hooks as subprocesses
/// with the payload on stdin, and dispatches plugin hooks in-process.
pub struct HookRunner {
    shell: Vec<String>,
    plugins: Arc<PluginRegistry>,
    observer: Arc<dyn Observer>,
}

impl std::fmt::Debug for HookRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRunner")
            .field("shell", &self.shell)
            .finish_non_exhaustive()
    }
}

impl HookRunner {
    /// Create a runner using the default `/bin/sh -c` shell.
    pub fn new(plugins: Arc<PluginRegistry>, observer: Arc<dyn Observer>) -> Self {
        Self {
            shell: vec!["/bin/sh".to_string(), "-c".to_string()],
            plugins,
            observer,
        }
    }

    /// Override the shell command used to spawn command hooks.
    pub fn with_shell(mut self, shell: Vec<String>) -> Self {
        if !shell.is_empty() {
            self.shell = shell;
        }
        self
    }

    /// Run one hook entry to completion.
    ///
    /// Never returns an error: every failure mode (spawn error, timeout,
    /// non-zero exit, unparsable stdout, plugin exception, cancellation)
    /// is folded into the returned record with `success = false`.
    pub async fn run(
        &self,
        event: HookEvent,
        entry: &HookEntry,
        input: &HookInvocationInput,
        cancel: &CancellationToken,
    ) -> HookOutcome {
        let outcome = match entry {
            HookEntry::Command { command, .. } => {
                self.run_command(event, entry, command, input, cancel).await
            }
            HookEntry::Plugin {
                package, method, ..
            } => {
                self.run_plugin(event, entry, package, method.as_deref(), input, cancel)
                    .await
            }
        };

        self.observer.report(TelemetryEvent::HookExecuted {
            record: outcome.record.clone(),
        });
        outcome
    }

    async fn run_command(
        &self,
        event: HookEvent,
        entry: &HookEntry,
        command: &str,
        input: &HookInvocationInput,
        cancel: &CancellationToken,
    ) -> HookOutcome {
        let started = Instant::now();
        let payload = serde_json::to_vec(input).unwrap_or_else(|_| b"{}".to_vec());

        let mut cmd = tokio::process::Command::new(&self.shell[0]);
        cmd.args(&self.shell[1..])
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(hook = %entry.name(), "failed to spawn hook: {e}");
                return HookOutcome::failure(
                    entry,
                    event,
                    SPAWN_FAILURE_EXIT_CODE,
                    format!("failed to spawn hook: {e}"),
                    started,
                );
            }
        };

        // Drain stdout/stderr concurrently so a chatty hook cannot
        // deadlock against a full pipe while we wait on it.
        let stdout_task = child.stdout.take().map(spawn_capture);
        let stderr_task = child.stderr.take().map(spawn_capture);

        if let Some(mut stdin) = child.stdin.take() {
            // Written from a task: a hook that never reads stdin must not
            // stall the wait below once the payload outgrows the pipe.
            let hook_name = entry.name();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    warn!(hook = %hook_name, "failed to write hook payload to stdin: {e}");
                }
            });
        }

        enum Wait {
            Exited(std::io::Result<std::process::ExitStatus>),
            TimedOut,
            Cancelled,
        }

        let waited = tokio::select! {
            status = child.wait() => Wait::Exited(status),
            _ = tokio::time::sleep(entry.timeout()) => Wait::TimedOut,
            _ = cancel.cancelled() => Wait::Cancelled,
        };

        let mut timed_out = false;
        let mut cancelled = false;
        let exit_code = match waited {
            Wait::Exited(Ok(status)) => status.code().unwrap_or(TIMEOUT_EXIT_CODE),
            Wait::Exited(Err(e)) => {
                warn!(hook = %entry.name(), "failed waiting for hook process: {e}");
                TIMEOUT_EXIT_CODE
            }
            Wait::TimedOut => {
                timed_out = true;
                terminate_then_kill(&mut child).await;
                TIMEOUT_EXIT_CODE
            }
            Wait::Cancelled => {
                cancelled = true;
                terminate_then_kill(&mut child).await;
                TIMEOUT_EXIT_CODE
            }
        };

        let stdout = collect_capture(stdout_task).await;
        let stderr = collect_capture(stderr_task).await;

        let output: Option<HookInvocationOutput> = serde_json::from_str(stdout.trim()).ok();
        if output.is_none() && exit_code == 0 && !timed_out && !cancelled {
            self.observer.report(TelemetryEvent::HookOutputParseFailure {
                hook_name: entry.name(),
                event,
            });
        }

        let success = !timed_out && !cancelled && exit_code == 0 && output.is_some();
        HookOutcome {
            record: HookExecutionRecord {
                hook_name: entry.name(),
                hook_event_name: event,
                exit_code,
                stdout,
                stderr,
                duration_ms: started.elapsed().as_millis() as u64,
                success,
            },
            output,
        }
    }

    async fn run_plugin(
        &self,
        event: HookEvent,
        entry: &HookEntry,
        package: &str,
        method: Option<&str>,
        input: &HookInvocationInput,
        cancel: &CancellationToken,
    ) -> HookOutcome {
        let started = Instant::now();
        let Some(method) = method else {
            return HookOutcome::failure(
                entry,
                event,
                SPAWN_FAILURE_EXIT_CODE,
                format!("plugin entry for {package} has no method"),
                started,
            );
        };
        let Some(plugin) = self.plugins.resolve(package, method) else {
            return HookOutcome::failure(
                entry,
                event,
                SPAWN_FAILURE_EXIT_CODE,
                format!("plugin method {package}::{method} is not registered"),
                started,
            );
        };

        // No subprocess, so no signal escalation: a soft deadline rejects
        // the awaited call instead.
        let result = tokio::select! {
            res = tokio::time::timeout(entry.timeout(), plugin.invoke(input)) => Some(res),
            _ = cancel.cancelled() => None,
        };

        let (exit_code, stdout, stderr, output) = match result {
            Some(Ok(Ok(output))) => {
                let rendered = serde_json::to_string(&output).unwrap_or_default();
                (0, rendered, String::new(), Some(output))
            }
            Some(Ok(Err(e))) => (1, String::new(), e.to_string(), None),
            Some(Err(_elapsed)) => (
                TIMEOUT_EXIT_CODE,
                String::new(),
                format!("plugin hook exceeded {}ms deadline", entry.timeout().as_millis()),
                None,
            ),
            None => (
                TIMEOUT_EXIT_CODE,
                String::new(),
                "turn cancelled".to_string(),
                None,
            ),
        };

        let success = exit_code == 0 && output.is_some();
        HookOutcome {
            record: HookExecutionRecord {
                hook_name: entry.name(),
                hook_event_name: event,
                exit_code,
                stdout,
                stderr,
                duration_ms: started.elapsed().as_millis() as u64,
                success,
            },
            output,
        }
    }
}

struct CaptureTask {
    handle: tokio::task::JoinHandle<()>,
    buffer: Arc<std::sync::Mutex<CaptureBuffer>>,
}

fn spawn_capture<R>(mut reader: R) -> CaptureTask
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let buffer = Arc::new(std::sync::Mutex::new(CaptureBuffer::new(MAX_CAPTURE_BYTES)));
    let shared = Arc::clone(&buffer);
    let handle = tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut buf) = shared.lock() {
                        buf.write(&chunk[..n]);
                    }
                }
            }
        }
    });
    CaptureTask { handle, buffer }
}

/// How long to wait for pipe EOF after the child has exited. A killed
/// hook can leave an orphaned grandchild holding the write end open;
/// the capture is bounded so that never stalls the turn.
const CAPTURE_DRAIN_GRACE: Duration = Duration::from_millis(500);

async fn collect_capture(task: Option<CaptureTask>) -> String {
    let Some(CaptureTask { mut handle, buffer }) = task else {
        return String::new();
    };
    if tokio::time::timeout(CAPTURE_DRAIN_GRACE, &mut handle)
        .await
        .is_err()
    {
        handle.abort();
    }
    let captured = match buffer.lock() {
        Ok(buf) => buf.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    captured.into_string_lossy()
}

/// Graceful-termination escalation: SIGTERM, a grace window, then
/// SIGKILL. Output captured up to this point is kept.
async fn terminate_then_kill(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: sending a signal to a child process we own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE_PERIOD, child.wait())
            .await
            .is_ok()
        {
            return;
        }
    }
    if let Err(e) = child.start_kill() {
        warn!("failed to kill hook process: {e}");
    }
    let _ = child.wait().await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::hooks::HookDecision;
    use crate::observer::NullObserver;

    fn runner() -> HookRunner {
        HookRunner::new(Arc::new(PluginRegistry::new()), Arc::new(NullObserver))
    }

    fn input() -> HookInvocationInput {
        HookInvocationInput::new("session-1", "/tmp", HookEvent::BeforeTool)
            .with_tool_call("read_file", serde_json::json!({"path": "a.txt"}))
    }

    #[test]
    fn test_capture_buffer_drops_overflow_silently() {
        let mut buf = CaptureBuffer::new(5);
        buf.write(b"hello world");
        assert!(buf.was_truncated());
        // Only the first five bytes are kept; no marker is appended.
        assert_eq!(buf.as_bytes(), b"hello");

        buf.write(b"more");
        assert_eq!(buf.as_bytes(), b"hello");
    }

    #[test]
    fn test_capture_buffer_under_limit() {
        let mut buf = CaptureBuffer::new(64);
        buf.write(b"hello");
        buf.write(b" world");
        assert!(!buf.was_truncated());
        assert_eq!(buf.into_string_lossy(), "hello world");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_hook_parses_envelope() {
        let entry = HookEntry::Command {
            command: r#"echo '{"decision":"block","reason":"nope"}'"#.to_string(),
            timeout_ms: None,
        };
        let outcome = runner()
            .run(
                HookEvent::BeforeTool,
                &entry,
                &input(),
                &CancellationToken::new(),
            )
            .await;

        assert!(outcome.record.success);
        assert_eq!(outcome.record.exit_code, 0);
        let output = outcome.output.unwrap();
        assert_eq!(output.effective_decision(), HookDecision::Block);
        assert_eq!(output.reason.as_deref(), Some("nope"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_hook_receives_payload_on_stdin() {
        // `cat` echoes the payload back; the input struct tolerates the
        // round trip because unknown envelope fields are ignored.
        let entry = HookEntry::Command {
            command: "cat".to_string(),
            timeout_ms: None,
        };
        let outcome = runner()
            .run(
                HookEvent::BeforeTool,
                &entry,
                &input(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.record.exit_code, 0);
        assert!(outcome.record.stdout.contains("session-1"));
        assert!(outcome.record.stdout.contains("read_file"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_failure_regardless_of_stdout() {
        let entry = HookEntry::Command {
            command: r#"echo '{"decision":"allow"}'; exit 3"#.to_string(),
            timeout_ms: None,
        };
        let outcome = runner()
            .run(
                HookEvent::BeforeTool,
                &entry,
                &input(),
                &CancellationToken::new(),
            )
            .await;

        assert!(!outcome.record.success);
        assert_eq!(outcome.record.exit_code, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unparsable_stdout_is_failure_but_not_error() {
        let entry = HookEntry::Command {
            command: "echo not-json".to_string(),
            timeout_ms: None,
        };
        let outcome = runner()
            .run(
                HookEvent::BeforeTool,
                &entry,
                &input(),
                &CancellationToken::new(),
            )
            .await;

        assert!(!outcome.record.success);
        assert_eq!(outcome.record.exit_code, 0);
        assert!(outcome.output.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_records_sentinel_and_keeps_output() {
        let entry = HookEntry::Command {
            command: "echo partial; sleep 30".to_string(),
            timeout_ms: Some(200),
        };
        let started = Instant::now();
        let outcome = runner()
            .run(
                HookEvent::BeforeTool,
                &entry,
                &input(),
                &CancellationToken::new(),
            )
            .await;

        assert!(!outcome.record.success);
        assert_eq!(outcome.record.exit_code, TIMEOUT_EXIT_CODE);
        assert!(outcome.record.stdout.contains("partial"));
        // The sleep must not have run to completion.
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_terminates_hook() {
        let entry = HookEntry::Command {
            command: "sleep 30".to_string(),
            timeout_ms: Some(60_000),
        };
        let cancel = CancellationToken::new();
        let abort = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            abort.cancel();
        });

        let started = Instant::now();
        let outcome = runner()
            .run(HookEvent::BeforeTool, &entry, &input(), &cancel)
            .await;

        assert!(!outcome.record.success);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_plugin_hook_round_trip() {
        struct Approve;

        #[async_trait]
        impl PluginHook for Approve {
            async fn invoke(
                &self,
                _input: &HookInvocationInput,
            ) -> Result<HookInvocationOutput, PluginError> {
                Ok(HookInvocationOutput {
                    decision: Some(HookDecision::Allow),
                    reason: Some("looks fine".into()),
                    ..Default::default()
                })
            }
        }

        let mut plugins = PluginRegistry::new();
        plugins.register("auditor", "on_tool", Arc::new(Approve));
        let runner = HookRunner::new(Arc::new(plugins), Arc::new(NullObserver));

        let entry = HookEntry::Plugin {
            package: "auditor".into(),
            method: Some("on_tool".into()),
            timeout_ms: None,
        };
        let outcome = runner
            .run(
                HookEvent::BeforeTool,
                &entry,
                &input(),
                &CancellationToken::new(),
            )
            .await;

        assert!(outcome.record.success);
        assert_eq!(
            outcome.output.unwrap().reason.as_deref(),
            Some("looks fine")
        );
    }

    #[tokio::test]
    async fn test_plugin_soft_deadline() {
        struct Stuck;

        #[async_trait]
        impl PluginHook for Stuck {
            async fn invoke(
                &self,
                _input: &HookInvocationInput,
            ) -> Result<HookInvocationOutput, PluginError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(HookInvocationOutput::default())
            }
        }

        let mut plugins = PluginRegistry::new();
        plugins.register("auditor", "slow", Arc::new(Stuck));
        let runner = HookRunner::new(Arc::new(plugins), Arc::new(NullObserver));

        let entry = HookEntry::Plugin {
            package: "auditor".into(),
            method: Some("slow".into()),
            timeout_ms: Some(100),
        };
        let outcome = runner
            .run(
                HookEvent::BeforeTool,
                &entry,
                &input(),
                &CancellationToken::new(),
            )
            .await;

        assert!(!outcome.record.success);
        assert_eq!(outcome.record.exit_code, TIMEOUT_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_unregistered_plugin_is_recoverable_failure() {
        let entry = HookEntry::Plugin {
            package: "ghost".into(),
            method: Some("missing".into()),
            timeout_ms: None,
        };
        let outcome = runner()
            .run(
                HookEvent::BeforeTool,
                &entry,
                &input(),
                &CancellationToken::new(),
            )
            .await;

        assert!(!outcome.record.success);
        assert!(outcome.record.stderr.contains("not registered"));
    }
}
