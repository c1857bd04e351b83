//! Supervised execution of external tools.
//!
//! Both the conversion binary and the bundler run through [`run_supervised`]:
//! the child is spawned with piped output, its streams are drained to EOF in
//! background tasks (keeping only the tail), and it is killed if it outlives
//! the configured timeout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Bytes of each output stream retained (the most recent ones).
const MAX_CAPTURE_BYTES: usize = 4 * 1024 * 1024;

/// How long to keep reading after exit when a descendant still holds the pipes.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lines of each stream kept in a diagnostic excerpt.
const EXCERPT_LINES: usize = 20;

/// Upper bound on the excerpt size in characters.
const EXCERPT_CHARS: usize = 4000;

/// What to run and how long to let it run.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl ProcessSpec {
    pub fn new(program: &Path, timeout: Duration) -> Self {
        Self {
            program: program.to_path_buf(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.envs.push((key.to_string(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }
}

/// Captured result of a process that ran to exit.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Tail of both streams, for log lines and callback details.
    pub fn excerpt(&self) -> String {
        excerpt(&self.stdout, &self.stderr)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {}s", .after.as_secs())]
    Timeout { program: String, after: Duration },

    #[error("I/O error while supervising {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Spawn the process described by `spec`, wait for it under its timeout and
/// capture its output. A timed-out child is killed and reaped before returning.
pub async fn run_supervised(spec: &ProcessSpec) -> Result<ProcessOutput, ProcessError> {
    let program = spec.program.display().to_string();

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in &spec.envs {
        cmd.env(key, value);
    }

    if let Some(dir) = &spec.current_dir {
        cmd.current_dir(dir);
    }

    tracing::debug!(program = %program, args = ?spec.args, "Spawning supervised process");

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|source| ProcessError::Launch {
        program: program.clone(),
        source,
    })?;

    let stop_readers = CancellationToken::new();
    let stdout_task = tokio::spawn(read_stream(child.stdout.take(), stop_readers.clone()));
    let stderr_task = tokio::spawn(read_stream(child.stderr.take(), stop_readers.clone()));

    let waited = tokio::time::timeout(spec.timeout, child.wait()).await;
    match waited {
        Ok(Ok(status)) => {
            let drain = spec
                .timeout
                .saturating_sub(start.elapsed())
                .min(PIPE_DRAIN_TIMEOUT);
            let stopper = {
                let stop = stop_readers.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(drain).await;
                    stop.cancel();
                })
            };
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            stopper.abort();

            if stop_readers.is_cancelled() {
                tracing::warn!(
                    program = %program,
                    "Output pipes still open after exit, a descendant process may be running"
                );
            }

            Ok(ProcessOutput {
                exit_code: status.code(),
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                duration: start.elapsed(),
            })
        }
        Ok(Err(source)) => {
            stop_readers.cancel();
            Err(ProcessError::Io { program, source })
        }
        Err(_elapsed) => {
            tracing::warn!(
                program = %program,
                timeout_secs = spec.timeout.as_secs(),
                "Process exceeded its timeout, killing it"
            );
            if let Err(e) = child.kill().await {
                tracing::error!(program = %program, error = %e, "Failed to kill timed-out process");
            }
            // Grandchildren may still hold the pipes open.
            stop_readers.cancel();
            Err(ProcessError::Timeout {
                program,
                after: spec.timeout,
            })
        }
    }
}

/// Read `handle` until EOF or `stop`, keeping the last [`MAX_CAPTURE_BYTES`].
///
/// The pipe is always drained so a chatty child never blocks or gets SIGPIPE.
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>, stop: CancellationToken) -> Vec<u8> {
    let mut buf = Vec::new();
    let Some(mut handle) = handle else {
        return buf;
    };

    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let read = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            r = handle.read(&mut chunk) => r,
        };
        match read {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > 2 * MAX_CAPTURE_BYTES {
                    buf.drain(..buf.len() - MAX_CAPTURE_BYTES);
                }
            }
        }
    }

    if buf.len() > MAX_CAPTURE_BYTES {
        buf.drain(..buf.len() - MAX_CAPTURE_BYTES);
    }
    buf
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Combine the tails of stdout and stderr into one bounded excerpt.
pub fn excerpt(stdout: &str, stderr: &str) -> String {
    let mut parts = Vec::new();
    let out = tail_lines(stdout.trim_end(), EXCERPT_LINES);
    if !out.is_empty() {
        parts.push(format!("stdout:\n{out}"));
    }
    let err = tail_lines(stderr.trim_end(), EXCERPT_LINES);
    if !err.is_empty() {
        parts.push(format!("stderr:\n{err}"));
    }

    let joined = parts.join("\n");
    let total = joined.chars().count();
    if total > EXCERPT_CHARS {
        joined.chars().skip(total - EXCERPT_CHARS).collect()
    } else {
        joined
    }
}
