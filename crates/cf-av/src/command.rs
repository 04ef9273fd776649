//! Builder for executing external tool commands with timeout and
//! cancellation support.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use cf_core::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Default command timeout: 5 minutes.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Number of trailing stderr lines kept for diagnostics.
const STDERR_TAIL_LINES: usize = 32;

/// Output captured from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Process exit status.
    pub status: ExitStatus,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Trailing diagnostic lines of standard error (lossy UTF-8).
    pub stderr: String,
}

/// A builder for constructing and executing external tool invocations.
///
/// # Example
///
/// ```no_run
/// use cf_av::ToolCommand;
/// use std::path::PathBuf;
///
/// # async fn example() -> cf_core::Result<()> {
/// let output = ToolCommand::new(PathBuf::from("ffprobe"))
///     .args(["-v", "quiet", "-print_format", "json", "-show_format"])
///     .arg("/path/to/video.mp4")
///     .execute()
///     .await?;
/// println!("{}", output.stdout);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    cancel: Option<CancellationToken>,
    diagnostic_filter: Option<fn(&str) -> bool>,
}

impl ToolCommand {
    /// Create a new command for the given program path.
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            cancel: None,
            diagnostic_filter: None,
        }
    }

    /// Append a single argument.
    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    /// Append multiple arguments.
    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Set the maximum execution time.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    /// Kill the process when `token` is cancelled.
    pub fn cancel_on(&mut self, token: CancellationToken) -> &mut Self {
        self.cancel = Some(token);
        self
    }

    /// Only keep stderr lines for which `keep` returns true in the
    /// diagnostic tail. Every line still reaches the stderr callback.
    pub fn diagnostic_filter(&mut self, keep: fn(&str) -> bool) -> &mut Self {
        self.diagnostic_filter = Some(keep);
        self
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// Execute the command, capturing stdout and stderr.
    pub async fn execute(&self) -> cf_core::Result<ToolOutput> {
        self.execute_with_stderr_callback(|_| {}).await
    }

    /// Execute the command, handing every stderr line to `on_line` as it
    /// arrives.
    ///
    /// # Errors
    ///
    /// - [`Error::Spawn`] if the process could not be started.
    /// - [`Error::Timeout`] if the timeout elapsed; the process is killed.
    /// - [`Error::Cancelled`] if the cancellation token fired; the process is
    ///   killed.
    /// - [`Error::EngineFailure`] if the process exited non-zero, carrying a
    ///   sanitized tail of stderr.
    pub async fn execute_with_stderr_callback(
        &self,
        mut on_line: impl FnMut(&str),
    ) -> cf_core::Result<ToolOutput> {
        let tool = self.tool_name();
        tracing::debug!(tool = %tool, args = ?self.args, "spawning");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::spawn(&tool, e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("child stdout was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("child stderr was not captured".into()))?;

        let keep = self.diagnostic_filter;
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

        let outcome = {
            let drive = async {
                let (stderr_res, stdout_res) = tokio::join!(
                    pump_lines(stderr, |line| {
                        on_line(line);
                        if keep.map_or(true, |k| k(line)) {
                            if tail.len() == STDERR_TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(line.to_string());
                        }
                    }),
                    read_all(stdout),
                );
                stderr_res?;
                let stdout = stdout_res?;
                let status = child.wait().await?;
                Ok::<_, std::io::Error>((status, stdout))
            };

            tokio::select! {
                res = drive => Outcome::Exited(res),
                _ = tokio::time::sleep(self.timeout) => Outcome::TimedOut,
                _ = cancelled(self.cancel.as_ref()) => Outcome::Cancelled,
            }
        };

        match outcome {
            Outcome::Exited(Ok((status, stdout))) => {
                let stderr = Vec::from(tail).join("\n");
                if !status.success() {
                    return Err(Error::engine(
                        tool,
                        &format!("{stderr}\nexited with {status}"),
                    ));
                }
                Ok(ToolOutput {
                    status,
                    stdout: String::from_utf8_lossy(&stdout).to_string(),
                    stderr,
                })
            }
            Outcome::Exited(Err(e)) => {
                terminate(&mut child, &tool).await;
                Err(Error::engine(tool, &format!("I/O error supervising process: {e}")))
            }
            Outcome::TimedOut => {
                tracing::warn!(tool = %tool, timeout = ?self.timeout, "timed out; killing");
                terminate(&mut child, &tool).await;
                Err(Error::Timeout {
                    after: self.timeout,
                })
            }
            Outcome::Cancelled => {
                tracing::info!(tool = %tool, "cancelled; killing");
                terminate(&mut child, &tool).await;
                Err(Error::Cancelled)
            }
        }
    }
}

enum Outcome {
    Exited(std::io::Result<(ExitStatus, Vec<u8>)>),
    TimedOut,
    Cancelled,
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Kill the child and reap it so no zombie is left behind.
async fn terminate(child: &mut Child, tool: &str) {
    if let Err(e) = child.kill().await {
        tracing::warn!(tool = %tool, "failed to kill process: {e}");
    }
}

/// Feed each line of `reader` (newline-terminated, lossy UTF-8) to `f`.
async fn pump_lines(
    reader: impl AsyncRead + Unpin,
    mut f: impl FnMut(&str),
) -> std::io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);
        f(line.trim_end_matches(['\r', '\n']));
    }
}

async fn read_all(mut reader: impl AsyncRead + Unpin) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}
