use std::{
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    sync::watch,
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::AppConfig,
    error::ExecutionError,
    models::ToolExecutionResult,
    tools::{render_args, ToolKind},
};

/// Captured output beyond this is read and discarded so the child never blocks on a full pipe.
const MAX_CAPTURE_BYTES: usize = 16 * 1024 * 1024;

/// Cooperative cancellation shared by every invocation of one scan.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Runs one tool invocation to completion, timeout or cancellation.
#[async_trait::async_trait]
pub trait ToolRunner: Send + Sync {
    /// `args` may contain target placeholders. Only configuration errors are
    /// returned as `Err`; every runtime outcome is a result with `success = false`.
    async fn execute(
        &self,
        tool: ToolKind,
        args: &[String],
        target: &str,
        timeout_ms: u64,
        cancel: &CancelToken,
    ) -> Result<ToolExecutionResult, ExecutionError>;
}

/// Rejects targets a tool could read as an option or that carry control characters.
pub fn validate_target(target: &str) -> Result<(), ExecutionError> {
    let reason = if target.is_empty() {
        "empty target"
    } else if target.starts_with('-') {
        "target must not start with '-'"
    } else if target.chars().any(|c| c.is_whitespace() || c.is_control()) {
        "target must not contain whitespace or control characters"
    } else {
        return Ok(());
    };
    Err(ExecutionError::InvalidTarget {
        target: target.to_string(),
        reason,
    })
}

pub fn check_request(tool: ToolKind, target: &str, timeout_ms: u64) -> Result<(), ExecutionError> {
    if timeout_ms == 0 {
        return Err(ExecutionError::InvalidTimeout { tool });
    }
    validate_target(target)
}

/// Spawns tool binaries directly (argv, no shell) in their own process group.
pub struct ProcessRunner {
    config: Arc<AppConfig>,
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl ProcessRunner {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self { config }
    }

    fn command(binary: &str, argv: &[String]) -> Command {
        let mut std_cmd = std::process::Command::new(binary);
        std_cmd
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }
        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait::async_trait]
impl ToolRunner for ProcessRunner {
    async fn execute(
        &self,
        tool: ToolKind,
        args: &[String],
        target: &str,
        timeout_ms: u64,
        cancel: &CancelToken,
    ) -> Result<ToolExecutionResult, ExecutionError> {
        check_request(tool, target, timeout_ms)?;

        if cancel.is_cancelled() {
            return Ok(ToolExecutionResult::skipped(tool));
        }

        let binary = self.config.binary(tool);
        let argv = render_args(args, target);
        info!(tool = %tool, command = binary, ?argv, timeout_ms, "audit: launching external tool");

        let start = Instant::now();
        let mut child = match Self::command(binary, &argv).spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = match e.kind() {
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                        ExecutionError::ToolNotFound {
                            tool,
                            binary: binary.to_string(),
                        }
                    }
                    _ => ExecutionError::Spawn {
                        tool,
                        reason: e.to_string(),
                    },
                };
                warn!(tool = %tool, error = %err, "tool could not be started");
                return Ok(ToolExecutionResult::from_error(tool, &err, String::new(), String::new(), 0));
            }
        };

        let pid = child.id();
        let stdout = child.stdout.take().map(Capture::spawn);
        let stderr = child.stderr.take().map(Capture::spawn);

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        let grace = self.config.cancel_grace();
        let duration_ms = match outcome {
            Outcome::Exited(_) => {
                // the leader is gone; anything it left behind in its group goes too
                let elapsed = start.elapsed().as_millis() as u64;
                reap_group(pid, grace).await;
                elapsed
            }
            _ => {
                terminate(&mut child, pid, grace).await;
                start.elapsed().as_millis() as u64
            }
        };

        let stdout = collect(stdout, grace).await;
        let stderr = collect(stderr, grace).await;

        let result = match outcome {
            Outcome::Exited(Ok(status)) => {
                let code = status.code().unwrap_or(-1);
                info!(tool = %tool, exit_code = code, duration_ms, "tool exited");
                ToolExecutionResult::exited(tool, code, stdout, stderr, duration_ms)
            }
            Outcome::Exited(Err(e)) => {
                let err = ExecutionError::Spawn {
                    tool,
                    reason: e.to_string(),
                };
                warn!(tool = %tool, error = %err, "failed waiting on tool");
                ToolExecutionResult::from_error(tool, &err, stdout, stderr, duration_ms)
            }
            Outcome::TimedOut => {
                let err = ExecutionError::ExecutionTimeout { tool, timeout_ms };
                warn!(tool = %tool, timeout_ms, "tool timed out, process group terminated");
                ToolExecutionResult::from_error(tool, &err, stdout, stderr, duration_ms)
            }
            Outcome::Cancelled => {
                info!(tool = %tool, duration_ms, "tool cancelled, process group terminated");
                ToolExecutionResult::from_error(tool, &ExecutionError::Cancelled { tool }, stdout, stderr, duration_ms)
            }
        };
        Ok(result)
    }
}

/// One output stream drained on its own task into a buffer that survives the task.
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl Capture {
    fn spawn<R: AsyncRead + Unpin + Send + 'static>(mut stream: R) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = buf.clone();
        let task = tokio::spawn(async move {
            let mut chunk = [0u8; 8192];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut kept = sink.lock();
                        let room = MAX_CAPTURE_BYTES.saturating_sub(kept.len());
                        kept.extend_from_slice(&chunk[..n.min(room)]);
                    }
                }
            }
        });
        Self { buf, task }
    }
}

/// Waits up to `grace` for the stream to close. Whatever was read by then is kept.
async fn collect(capture: Option<Capture>, grace: Duration) -> String {
    let Some(Capture { buf, mut task }) = capture else {
        return String::new();
    };
    if timeout(grace, &mut task).await.is_err() {
        warn!("output stream still open after the grace period, keeping what was read");
        task.abort();
    }
    let bytes = std::mem::take(&mut *buf.lock());
    String::from_utf8_lossy(&bytes).into_owned()
}

/// SIGTERM to the process group, then SIGKILL once the grace period runs out.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    signal_group(child, pid, false);
    if let Ok(Ok(_)) = timeout(grace, child.wait()).await {
        return;
    }
    warn!(?pid, "process ignored SIGTERM, killing process group");
    signal_group(child, pid, true);
    let _ = child.wait().await;
}

#[cfg(unix)]
fn signal_group(child: &mut Child, pid: Option<u32>, force: bool) {
    use nix::{
        sys::signal::{killpg, Signal},
        unistd::Pid,
    };

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    match pid {
        Some(pid) => {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
                warn!(pid, error = %e, "failed to signal process group");
                let _ = child.start_kill();
            }
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _pid: Option<u32>, _force: bool) {
    let _ = child.start_kill();
}

/// Clears a group whose leader already exited: SIGTERM, then SIGKILL for
/// whatever is still there once the grace period runs out.
#[cfg(unix)]
async fn reap_group(pid: Option<u32>, grace: Duration) {
    use nix::{
        sys::signal::{killpg, Signal},
        unistd::Pid,
    };

    let Some(pid) = pid else {
        return;
    };
    let group = Pid::from_raw(pid as i32);
    if killpg(group, Signal::SIGTERM).is_err() {
        return;
    }
    debug!(pid, "tool left processes in its group, terminating them");
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if killpg(group, None::<Signal>).is_err() {
            return;
        }
    }
    let _ = killpg(group, Signal::SIGKILL);
}

#[cfg(not(unix))]
async fn reap_group(_pid: Option<u32>, _grace: Duration) {}
