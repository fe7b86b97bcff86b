//! External tool runner.
//!
//! Launches image/video/PDF tools as subprocesses, tees their stdout and stderr
//! into capture files, feeds output lines to a progress tracker, retries
//! transient failures and supports cancellation through SIGTERM.
//!
//! A tool that was terminated by the engine is reported as
//! [`ExitResult::Cancelled`], never as a failure: the pid is recorded in the
//! shared [`CancellationRegistry`] before the signal is sent and the exit
//! handler consults it.

use crate::progress::{ProgressGrammar, ProgressSink, ProgressTracker};
use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How long a terminated tool gets to exit before it is killed outright.
const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// Upper bound on captured output pulled back into memory for error reports.
const CAPTURE_TAIL_BYTES: usize = 64 * 1024;

/// Error type for tool runs
#[derive(Debug, Error)]
pub enum RunError {
    /// The binary could not be started at all
    #[error("failed to launch {command}: {source}")]
    LaunchFailed {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Non-zero exit after all attempts
    #[error("{command} exited with code {code:?}")]
    ExitedNonZero {
        command: String,
        args: Vec<String>,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("{command} timed out after {after:?}")]
    TimedOut { command: String, after: Duration },

    /// Terminated by the engine
    #[error("{command} was cancelled")]
    Cancelled { command: String },

    /// Output capture or process bookkeeping failed
    #[error("capture error: {0}")]
    Capture(#[source] io::Error),
}

/// Outcome of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitResult {
    Success,
    Failed { code: Option<i32> },
    Cancelled,
    TimedOut,
}

/// Where a successful run left its captured output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub attempts: u32,
}

/// Pids the engine itself asked to terminate.
///
/// Shared between the coordinator (which stops assets) and the runner (which
/// decides whether an exit was a failure).
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    terminated: Arc<Mutex<HashSet<u32>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<u32>> {
        self.terminated.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mark_cancelled(&self, pid: u32) {
        self.lock().insert(pid);
    }

    pub fn was_cancelled(&self, pid: u32) -> bool {
        self.lock().contains(&pid)
    }

    /// Drop the record once the exit has been classified; pids get reused.
    pub fn forget(&self, pid: u32) {
        self.lock().remove(&pid);
    }

    /// Record the pid, then send SIGTERM.
    pub fn terminate(&self, pid: u32) -> io::Result<()> {
        self.mark_cancelled(pid);
        send_terminate(pid)
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> io::Result<()> {
    if pid == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "refusing to signal pid 0"));
    }
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "graceful termination is only available on unix",
    ))
}

/// One external tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    program: String,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg);
        }
        self
    }

    pub fn env(&mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> &mut Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Short name used in logs and error messages (`/usr/bin/gs` -> `gs`).
    pub fn name(&self) -> String {
        Path::new(&self.program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.clone())
    }

    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in self.args_lossy() {
            out.push(' ');
            if arg.contains(' ') {
                out.push('"');
                out.push_str(&arg);
                out.push('"');
            } else {
                out.push_str(&arg);
            }
        }
        out
    }

    fn to_tokio(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// Lifecycle notifications for spawned subprocesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    Started { pid: u32 },
    Exited { pid: u32 },
}

pub type ProcessObserver = Arc<dyn Fn(ProcessEvent) + Send + Sync>;

/// Progress wiring for a run: which grammar to parse and where updates go.
#[derive(Clone)]
pub struct ProgressHook {
    pub grammar: ProgressGrammar,
    pub description: String,
    pub sink: ProgressSink,
}

/// Per-run context
#[derive(Clone)]
pub struct RunContext {
    /// Directory receiving `<tool>-<attempt>.stdout` / `.stderr`
    pub capture_dir: PathBuf,
    pub cancel: CancellationToken,
    pub progress: Option<ProgressHook>,
    pub observer: Option<ProcessObserver>,
}

impl RunContext {
    pub fn new(capture_dir: impl Into<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            capture_dir: capture_dir.into(),
            cancel,
            progress: None,
            observer: None,
        }
    }

    pub fn with_progress(mut self, hook: ProgressHook) -> Self {
        self.progress = Some(hook);
        self
    }

    pub fn with_observer(mut self, observer: ProcessObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    fn notify(&self, event: ProcessEvent) {
        if let Some(observer) = &self.observer {
            observer(event);
        }
    }
}

/// A launched attempt
pub struct RunningTool {
    child: Child,
    pid: u32,
    pumps: Vec<JoinHandle<io::Result<()>>>,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl RunningTool {
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

enum Waited {
    Exited(io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut,
}

/// Runs external tools with retry, timeout and cancellation.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    cancellations: CancellationRegistry,
    max_attempts: u32,
    timeout: Option<Duration>,
    retry_on_timeout: bool,
}

impl ToolRunner {
    pub fn new(cancellations: CancellationRegistry, max_attempts: u32) -> Self {
        Self {
            cancellations,
            max_attempts: max_attempts.max(1),
            timeout: None,
            retry_on_timeout: false,
        }
    }

    /// Per-attempt time limit; `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>, retry_on_timeout: bool) -> Self {
        self.timeout = timeout;
        self.retry_on_timeout = retry_on_timeout;
        self
    }

    /// Launch one attempt with piped output.
    pub fn spawn(
        &self,
        command: &ToolCommand,
        capture_dir: &Path,
        attempt: u32,
        lines: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<RunningTool, RunError> {
        let mut cmd = command.to_tokio();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| RunError::LaunchFailed {
            command: command.name(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);

        let stem = format!("{}-{}", command.name(), attempt);
        let stdout_path = capture_dir.join(format!("{}.stdout", stem));
        let stderr_path = capture_dir.join(format!("{}.stderr", stem));

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(stdout, stdout_path.clone(), lines.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(stderr, stderr_path.clone(), lines)));
        }

        debug!(pid, command = %command.display(), attempt, "tool started");
        Ok(RunningTool {
            child,
            pid,
            pumps,
            stdout_path,
            stderr_path,
        })
    }

    /// Wait for an attempt to end by exit, cancellation or timeout.
    pub async fn wait(&self, mut tool: RunningTool, cancel: &CancellationToken) -> Result<ExitResult, RunError> {
        let pid = tool.pid;
        let timeout = self.timeout;

        let waited = tokio::select! {
            status = tool.child.wait() => Waited::Exited(status),
            _ = cancel.cancelled() => Waited::Cancelled,
            _ = sleep_or_forever(timeout) => Waited::TimedOut,
        };

        let mut timed_out = false;
        let status = match waited {
            Waited::Exited(status) => status.map_err(RunError::Capture)?,
            Waited::Cancelled => {
                if let Err(e) = self.cancellations.terminate(pid) {
                    debug!(pid, error = %e, "terminate failed, killing");
                    let _ = tool.child.start_kill();
                }
                reap(&mut tool.child).await?
            }
            Waited::TimedOut => {
                timed_out = true;
                if send_terminate(pid).is_err() {
                    let _ = tool.child.start_kill();
                }
                reap(&mut tool.child).await?
            }
        };

        for pump in tool.pumps.drain(..) {
            match pump.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(pid, error = %e, "output capture failed"),
                Err(e) => warn!(pid, error = %e, "output pump panicked"),
            }
        }

        if self.cancellations.was_cancelled(pid) {
            self.cancellations.forget(pid);
            return Ok(ExitResult::Cancelled);
        }
        if timed_out {
            return Ok(ExitResult::TimedOut);
        }
        if status.success() {
            Ok(ExitResult::Success)
        } else {
            Ok(ExitResult::Failed { code: status.code() })
        }
    }

    /// Run a tool to completion, retrying non-zero exits up to `max_attempts`.
    ///
    /// Launch failures and cancellations are never retried. Timeouts are
    /// retried only when configured.
    pub async fn run(&self, command: &ToolCommand, ctx: &RunContext) -> Result<ToolOutput, RunError> {
        tokio::fs::create_dir_all(&ctx.capture_dir)
            .await
            .map_err(RunError::Capture)?;

        // One tracker spans all attempts so progress never moves backwards.
        let (lines_tx, tracker) = match &ctx.progress {
            Some(hook) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let tracker = ProgressTracker::new(
                    hook.grammar.clone(),
                    hook.description.clone(),
                    hook.sink.clone(),
                );
                (Some(tx), Some(tracker.spawn(rx)))
            }
            None => (None, None),
        };

        let name = command.name();
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            if ctx.cancel.is_cancelled() {
                break Err(RunError::Cancelled { command: name.clone() });
            }

            let tool = match self.spawn(command, &ctx.capture_dir, attempt, lines_tx.clone()) {
                Ok(tool) => tool,
                Err(e) => break Err(e),
            };
            let pid = tool.pid;
            let stdout_path = tool.stdout_path.clone();
            let stderr_path = tool.stderr_path.clone();

            ctx.notify(ProcessEvent::Started { pid });
            let exit = self.wait(tool, &ctx.cancel).await;
            ctx.notify(ProcessEvent::Exited { pid });

            match exit {
                Err(e) => break Err(e),
                Ok(ExitResult::Success) => {
                    break Ok(ToolOutput {
                        stdout_path,
                        stderr_path,
                        attempts: attempt,
                    })
                }
                Ok(ExitResult::Cancelled) => {
                    debug!(pid, command = %name, "tool cancelled");
                    break Err(RunError::Cancelled { command: name.clone() });
                }
                Ok(ExitResult::TimedOut) => {
                    let after = self.timeout.unwrap_or_default();
                    if self.retry_on_timeout && attempt < self.max_attempts {
                        warn!(command = %name, attempt, ?after, "tool timed out, retrying");
                        continue;
                    }
                    error!(command = %name, attempt, ?after, "tool timed out");
                    break Err(RunError::TimedOut { command: name.clone(), after });
                }
                Ok(ExitResult::Failed { code }) => {
                    if attempt < self.max_attempts {
                        warn!(command = %name, attempt, ?code, "tool failed, retrying");
                        continue;
                    }
                    let stdout = read_capture(&stdout_path).await;
                    let stderr = read_capture(&stderr_path).await;
                    error!(
                        command = %command.display(),
                        attempts = attempt,
                        ?code,
                        %stdout,
                        %stderr,
                        "tool failed"
                    );
                    break Err(RunError::ExitedNonZero {
                        command: name.clone(),
                        args: command.args_lossy(),
                        code,
                        stdout,
                        stderr,
                    });
                }
            }
        };

        drop(lines_tx);
        if let Some(tracker) = tracker {
            let _ = tracker.await;
        }
        result
    }
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// Wait for a signalled child, escalating to SIGKILL after the grace period.
async fn reap(child: &mut Child) -> Result<std::process::ExitStatus, RunError> {
    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(status) => status.map_err(RunError::Capture),
        Err(_) => {
            warn!(pid = ?child.id(), "tool ignored SIGTERM, killing");
            child.kill().await.map_err(RunError::Capture)?;
            child.wait().await.map_err(RunError::Capture)
        }
    }
}

/// Copy a pipe into its capture file, forwarding each line to the tracker.
///
/// Tools redraw progress with `\r`, so carriage returns also split lines.
async fn pump<R>(reader: R, capture: PathBuf, lines: Option<mpsc::UnboundedSender<String>>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut file = tokio::fs::File::create(&capture).await?;
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf).await?;
        if read == 0 {
            break;
        }
        file.write_all(&buf).await?;
        if let Some(tx) = &lines {
            let text = String::from_utf8_lossy(&buf);
            for line in text.split(['\r', '\n']).filter(|l| !l.is_empty()) {
                let _ = tx.send(line.to_string());
            }
        }
    }
    file.flush().await
}

/// Tail of a capture file for error reports; missing files read as empty.
async fn read_capture(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let start = bytes.len().saturating_sub(CAPTURE_TAIL_BYTES);
            String::from_utf8_lossy(&bytes[start..]).into_owned()
        }
        Err(_) => String::new(),
    }
}
