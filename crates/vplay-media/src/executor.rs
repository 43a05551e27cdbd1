//! Process executor for external tools.
//!
//! Launches a binary with captured stdout/stderr and races its natural exit
//! against a cancellation token and an optional timeout. The race stays
//! armed until both output streams close, so a descendant that inherited
//! the pipes cannot outlive the budget. Whatever happens, the child is
//! reaped, its process group is killed and both reader tasks are joined
//! before returning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant as Deadline;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MediaConfig;
use crate::error::{MediaError, MediaResult};
use crate::metrics;

/// Default cap on captured bytes per output stream (16 MiB).
pub const DEFAULT_OUTPUT_LIMIT: usize = 16 * 1024 * 1024;

/// Appended to a stream that hit the capture limit.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Outcome of one external invocation that ran to natural exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    /// Exit code; `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Convert a non-zero exit into [`MediaError::ToolFailure`].
    pub fn into_success(self, tool: &str) -> MediaResult<Self> {
        if self.success() {
            return Ok(self);
        }
        let message = match self.exit_code {
            Some(code) => format!("exited with status {}", code),
            None => "terminated by signal".to_string(),
        };
        Err(MediaError::tool_failed(
            tool,
            self.exit_code,
            message,
            self.stderr,
        ))
    }
}

/// Launches external tools.
///
/// Cheap to share behind an `Arc`; every invocation is independent apart
/// from the logical-name table, which is snapshotted at launch.
#[derive(Debug)]
pub struct ProcessExecutor {
    tool_paths: RwLock<HashMap<String, PathBuf>>,
    /// Bytes kept per output stream; `None` keeps everything
    output_limit: Option<usize>,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self {
            tool_paths: RwLock::new(HashMap::new()),
            output_limit: Some(DEFAULT_OUTPUT_LIMIT),
        }
    }
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor with the configured output limit and tool paths.
    pub fn from_config(config: &MediaConfig) -> Self {
        let executor = Self::new().with_output_limit(config.output_limit);
        config.apply_tool_paths(&executor);
        executor
    }

    /// Cap captured stdout and stderr. Output past the cap is drained and
    /// dropped so the child never blocks on a full pipe.
    pub fn with_output_limit(mut self, limit: Option<usize>) -> Self {
        self.output_limit = limit;
        self
    }

    pub fn output_limit(&self) -> Option<usize> {
        self.output_limit
    }

    /// Map a logical tool name (e.g. `ffmpeg`) to an absolute path.
    ///
    /// Invocations already in flight keep the path they started with.
    pub fn set_tool_path(&self, name: impl Into<String>, path: impl Into<PathBuf>) {
        let name = name.into();
        let path = path.into();
        debug!(tool = %name, path = %path.display(), "Tool path updated");
        let mut paths = self
            .tool_paths
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        paths.insert(name, path);
    }

    /// Remove a mapping so the name falls back to `PATH` lookup.
    pub fn clear_tool_path(&self, name: &str) -> Option<PathBuf> {
        self.tool_paths
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name)
    }

    pub fn tool_path(&self, name: &str) -> Option<PathBuf> {
        self.tool_paths
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    /// Resolve an executable to the path that will be spawned.
    pub fn resolve(&self, executable: &str) -> MediaResult<PathBuf> {
        let executable = executable.trim();
        if executable.is_empty() {
            return Err(MediaError::invalid_invocation("executable must not be empty"));
        }

        if let Some(mapped) = self.tool_path(executable) {
            return Ok(mapped);
        }

        which::which(executable).map_err(|e| {
            MediaError::invalid_invocation(format!("cannot resolve '{}': {}", executable, e))
        })
    }

    /// Run `executable` with a shell-quoted `arguments` string.
    ///
    /// The argument string is split with POSIX shell-word rules; no shell
    /// is spawned. Cancellation wins over a simultaneous natural exit.
    pub async fn execute(
        &self,
        executable: &str,
        arguments: &str,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> MediaResult<ProcessResult> {
        let tool = tool_label(executable);
        let started = Instant::now();

        let result = self.run(executable, arguments, cancel, timeout).await;

        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;
        match &result {
            Ok(output) if output.success() => {
                info!(tool = %tool, elapsed_ms, outcome = "success", "Tool finished");
                metrics::record_invocation(&tool, "success", elapsed);
            }
            Ok(output) => {
                warn!(
                    tool = %tool,
                    elapsed_ms,
                    outcome = "tool_failure",
                    exit_code = ?output.exit_code,
                    "Tool exited unsuccessfully"
                );
                metrics::record_invocation(&tool, "tool_failure", elapsed);
            }
            Err(e) => {
                warn!(tool = %tool, elapsed_ms, outcome = e.outcome(), error = %e, "Tool did not complete");
                metrics::record_invocation(&tool, e.outcome(), elapsed);
            }
        }

        result
    }

    async fn run(
        &self,
        executable: &str,
        arguments: &str,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> MediaResult<ProcessResult> {
        let program = self.resolve(executable)?;
        let args = split_arguments(arguments)?;

        if cancel.is_cancelled() {
            return Err(MediaError::Cancelled);
        }

        debug!(program = %program.display(), args = ?args, "Launching tool");

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        {
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|e| {
            MediaError::invalid_invocation(format!(
                "failed to launch {}: {}",
                program.display(),
                e
            ))
        })?;

        // The group id equals the child pid; keep it past reaping
        let pid = child.id();
        let mut stdout = spawn_reader(child.stdout.take(), self.output_limit);
        let mut stderr = spawn_reader(child.stderr.take(), self.output_limit);

        let limit = timeout.unwrap_or_default();
        let deadline_at = timeout.map(|limit| Deadline::now() + limit);

        let exited = tokio::select! {
            biased;
            err = interrupted(cancel, deadline_at, limit) => Err(err),
            status = child.wait() => Ok(status),
        };
        let status = match exited {
            Ok(status) => status,
            Err(err) => {
                terminate(&mut child, pid, &program).await;
                abort_reader(stdout).await;
                abort_reader(stderr).await;
                return Err(err);
            }
        };

        // Descendants may still hold the pipes after the child exits
        let drained = tokio::select! {
            biased;
            err = interrupted(cancel, deadline_at, limit) => Err(err),
            outputs = async { tokio::join!(&mut stdout, &mut stderr) } => Ok(outputs),
        };

        kill_group(pid, &program);

        let (stdout, stderr) = match drained {
            Ok((out, err)) => (out.unwrap_or_default(), err.unwrap_or_default()),
            Err(err) => {
                abort_reader(stdout).await;
                abort_reader(stderr).await;
                return Err(err);
            }
        };

        let status = status.map_err(|e| {
            MediaError::invalid_invocation(format!(
                "failed to wait for {}: {}",
                program.display(),
                e
            ))
        })?;
        Ok(ProcessResult {
            exit_code: status.code(),
            stdout,
            stderr,
        })
    }
}

/// Split a quoted argument string into argv entries.
fn split_arguments(arguments: &str) -> MediaResult<Vec<String>> {
    let args = shell_words::split(arguments)
        .map_err(|e| MediaError::invalid_invocation(format!("malformed argument string: {}", e)))?;
    if args.iter().any(|a| a.contains('\0')) {
        return Err(MediaError::invalid_invocation(
            "argument contains a NUL byte",
        ));
    }
    Ok(args)
}

/// Name used in logs and metrics: the file name for paths.
fn tool_label(executable: &str) -> String {
    let executable = executable.trim();
    Path::new(executable)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| executable.to_string())
}

async fn deadline(at: Option<Deadline>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Resolves when the invocation must stop; cancellation beats the deadline.
async fn interrupted(
    cancel: &CancellationToken,
    deadline_at: Option<Deadline>,
    limit: Duration,
) -> MediaError {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => MediaError::Cancelled,
        _ = deadline(deadline_at) => MediaError::Timeout(limit),
    }
}

fn spawn_reader<R>(stream: Option<R>, limit: Option<usize>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut stream) = stream else {
            return String::new();
        };
        let mut buf = Vec::new();
        let read = match limit {
            Some(limit) => (&mut stream).take(limit as u64).read_to_end(&mut buf).await,
            None => stream.read_to_end(&mut buf).await,
        };
        if let Err(e) = read {
            debug!(error = %e, "Output stream closed with error");
            return String::from_utf8_lossy(&buf).into_owned();
        }

        let dropped = match limit {
            Some(_) => tokio::io::copy(&mut stream, &mut tokio::io::sink())
                .await
                .unwrap_or_default(),
            None => 0,
        };

        let mut text = String::from_utf8_lossy(&buf).into_owned();
        if dropped > 0 {
            debug!(kept = buf.len(), dropped, "Output exceeded capture limit");
            text.push_str(TRUNCATION_MARKER);
        }
        text
    })
}

async fn abort_reader(handle: JoinHandle<String>) {
    handle.abort();
    let _ = handle.await;
}

/// Kill the process group, then the direct child. Failures are logged only.
async fn terminate(child: &mut Child, pid: Option<u32>, program: &Path) {
    kill_group(pid, program);

    if let Err(e) = child.kill().await {
        warn!(program = %program.display(), error = %e, "Failed to kill process");
    }
}

/// SIGKILL whatever is left in the child's process group.
#[cfg(unix)]
fn kill_group(pid: Option<u32>, program: &Path) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return;
    };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        // Group already empty
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            warn!(program = %program.display(), pid, error = %e, "Failed to kill process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>, _program: &Path) {}
