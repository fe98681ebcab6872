/// Single agent session: spawn the agent subprocess, supervise it, and
/// report results (exit code, output bytes, captured stderr, duration).
///
/// Whether the agent gets the terminal (interactive) or has its output
/// captured is decided once, when the runner is built.
use crate::config::AgentConfig;
use crate::reader::{JoinStatus, ReaderTask, Stream};
use crate::signals::{IgnoreInterrupts, Interrupts, SignalError};
use crate::supervisor::{status_exit_code, Supervisor, SupervisorError, INTERRUPTED_EXIT_CODE};
use nix::sys::signal::Signal;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;
use tokio::process::Command;

/// Result of a completed session.
#[derive(Debug)]
pub struct SessionResult {
    /// Shell-style exit code: the child's code, 128 + N if it died by
    /// signal N, 130 if the user interrupted.
    pub exit_code: i32,
    /// Whether the session ended because of a user interrupt.
    pub interrupted: bool,
    /// Bytes the agent wrote to stdout (0 in interactive mode).
    pub output_bytes: u64,
    /// Captured stderr of the agent (empty in interactive mode).
    pub stderr: String,
    /// Wall-clock duration of the session.
    pub duration: Duration,
    /// Where stdout was written, when it went to a file.
    pub output_file: Option<PathBuf>,
    /// Child PID (for logging/diagnostics).
    pub pid: u32,
}

/// Errors that can occur during session execution.
#[derive(Debug)]
pub enum SessionError {
    /// Failed to create the output file.
    OutputFile {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to spawn the agent subprocess.
    Spawn { source: std::io::Error },
    /// Failed to read from child stdout/stderr or to wait for it.
    Io { source: std::io::Error },
    /// Supervision could not start or complete.
    Supervisor { source: SupervisorError },
    /// Failed to adjust signal handling around the agent.
    Signal { source: SignalError },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::OutputFile { path, source } => {
                write!(
                    f,
                    "failed to create output file {}: {}",
                    path.display(),
                    source
                )
            }
            SessionError::Spawn { source } => {
                write!(f, "failed to spawn agent subprocess: {}", source)
            }
            SessionError::Io { source } => {
                write!(f, "I/O error during session: {}", source)
            }
            SessionError::Supervisor { source } => {
                write!(f, "supervision failed: {}", source)
            }
            SessionError::Signal { source } => {
                write!(f, "signal setup failed: {}", source)
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::OutputFile { source, .. } => Some(source),
            SessionError::Spawn { source } => Some(source),
            SessionError::Io { source } => Some(source),
            SessionError::Supervisor { source } => Some(source),
            SessionError::Signal { source } => Some(source),
        }
    }
}

/// Build the command arguments, replacing `{prompt}` placeholders with actual prompt content.
fn build_args(agent_config: &AgentConfig, prompt: &str) -> Vec<String> {
    agent_config
        .args
        .iter()
        .map(|arg| arg.replace("{prompt}", prompt))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Captured,
    Interactive,
}

/// Runs agent sessions in one fixed mode.
pub struct SessionRunner {
    agent: AgentConfig,
    mode: Mode,
    terminate_timeout: Duration,
}

impl SessionRunner {
    pub fn new(agent: AgentConfig, interactive: bool, terminate_timeout: Duration) -> Self {
        let mode = if interactive {
            Mode::Interactive
        } else {
            Mode::Captured
        };
        Self {
            agent,
            mode,
            terminate_timeout,
        }
    }

    pub fn is_interactive(&self) -> bool {
        self.mode == Mode::Interactive
    }

    /// Run one session. In captured mode stdout goes to `output_path`, or to
    /// our own stdout when no path is given.
    pub async fn run(
        &self,
        prompt: &str,
        output_path: Option<&Path>,
    ) -> Result<SessionResult, SessionError> {
        let args = build_args(&self.agent, prompt);
        tracing::info!(
            command = %self.agent.command,
            args = ?args,
            mode = ?self.mode,
            "spawning agent session"
        );

        let result = match self.mode {
            Mode::Captured => self.run_captured(&args, output_path).await?,
            Mode::Interactive => self.run_interactive(&args).await?,
        };

        tracing::info!(
            exit_code = result.exit_code,
            interrupted = result.interrupted,
            output_bytes = result.output_bytes,
            duration_secs = result.duration.as_secs(),
            "agent session completed"
        );
        Ok(result)
    }

    async fn run_captured(
        &self,
        args: &[String],
        output_path: Option<&Path>,
    ) -> Result<SessionResult, SessionError> {
        let sink: Box<dyn AsyncWrite + Unpin + Send> = match output_path {
            Some(path) => {
                let file = std::fs::File::create(path).map_err(|e| SessionError::OutputFile {
                    path: path.to_path_buf(),
                    source: e,
                })?;
                Box::new(tokio::fs::File::from_std(file))
            }
            None => Box::new(tokio::io::stdout()),
        };

        let start = Instant::now();

        // Listen before spawning: the agent gets its own group, so a Ctrl-C
        // that killed us before supervision started would orphan it.
        let mut interrupts = Interrupts::new();
        interrupts
            .enter()
            .map_err(|source| SessionError::Signal { source })?;

        let mut child = Command::new(&self.agent.command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0) // Own group: the terminal must not signal it directly
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Spawn { source: e })?;

        let pid = child.id().unwrap_or(0);
        tracing::info!(pid, "agent subprocess started");

        let stdout = child.stdout.take().ok_or_else(|| SessionError::Io {
            source: std::io::Error::other("child stdout was not piped"),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| SessionError::Io {
            source: std::io::Error::other("child stderr was not piped"),
        })?;
        let mut readers = vec![
            ReaderTask::forward(Stream::Stdout, stdout, sink),
            ReaderTask::capture(Stream::Stderr, stderr),
        ];

        let mut supervisor = Supervisor::new(&self.agent.label, child)
            .map_err(|source| SessionError::Supervisor { source })?
            .with_interrupts(interrupts)
            .with_terminate_timeout(self.terminate_timeout);
        let outcome = supervisor
            .run(&mut readers)
            .await
            .map_err(|source| SessionError::Supervisor { source })?;

        let duration = start.elapsed();

        let mut output_bytes = 0;
        let mut captured_stderr = String::new();
        for mut reader in readers {
            let stream = reader.stream();
            // Interrupt cleanup already spent the join budget on this one.
            if outcome.is_interrupted() && !reader.is_finished() {
                tracing::warn!(%stream, "stream still open after interrupt, reporting it as empty");
                continue;
            }
            if reader.join_timeout(self.terminate_timeout).await == JoinStatus::TimedOut {
                tracing::warn!(%stream, "stream still open after agent exit, not waiting for it");
                continue;
            }
            match reader.finish().await {
                Ok(drained) => match stream {
                    Stream::Stdout => output_bytes = drained.bytes,
                    Stream::Stderr => {
                        captured_stderr = String::from_utf8_lossy(&drained.captured).into_owned()
                    }
                },
                Err(e) if outcome.is_interrupted() => {
                    tracing::warn!(error = %e, %stream, "reader failed during interrupted session");
                }
                Err(e) => return Err(SessionError::Io { source: e }),
            }
        }

        Ok(SessionResult {
            exit_code: outcome.exit_code(),
            interrupted: supervisor.interrupted(),
            output_bytes,
            stderr: captured_stderr,
            duration,
            output_file: output_path.map(Path::to_path_buf),
            pid,
        })
    }

    async fn run_interactive(&self, args: &[String]) -> Result<SessionResult, SessionError> {
        let start = Instant::now();

        // Same process group and inherited stdio: the terminal signals the agent directly.
        let mut child = Command::new(&self.agent.command)
            .args(args)
            .spawn()
            .map_err(|e| SessionError::Spawn { source: e })?;

        let pid = child.id().unwrap_or(0);
        tracing::info!(pid, "interactive agent subprocess started");

        let status = {
            let _ignore = IgnoreInterrupts::install()
                .map_err(|source| SessionError::Signal { source })?;
            child
                .wait()
                .await
                .map_err(|e| SessionError::Io { source: e })?
        };

        let interrupted = status.signal() == Some(Signal::SIGINT as i32);
        let exit_code = if interrupted {
            INTERRUPTED_EXIT_CODE
        } else {
            status_exit_code(&status)
        };

        Ok(SessionResult {
            exit_code,
            interrupted,
            output_bytes: 0,
            stderr: String::new(),
            duration: start.elapsed(),
            output_file: None,
            pid,
        })
    }
}
