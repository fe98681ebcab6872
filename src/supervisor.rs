//! Scoped supervision of one agent child process.
//!
//! `Supervisor::run` enters the scope (suspend/resume forwarding plus SIGINT
//! capture), waits for the child inside it, and leaves the scope either
//! because the child finished or because the user interrupted. On interrupt
//! it escalates SIGTERM → SIGKILL against the child's process group, joins
//! the readers with a bound, and reports `Outcome::Interrupted` instead of
//! an error.
use crate::reader::{JoinStatus, ReaderTask};
use crate::signals::{Interrupts, SignalBridge, SignalError};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, Pid};
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::time::Instant;

/// How long the child gets to honour SIGTERM, and the readers to finish.
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Conventional exit code after a user interrupt (128 + SIGINT).
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Lifecycle of the supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Running,
    /// SIGTERM sent, waiting out the grace period.
    Terminating,
    /// SIGKILL sent.
    Killed,
    /// Reaped.
    Exited,
}

/// How the supervision scope ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The child finished on its own.
    Exited(ExitStatus),
    /// The user interrupted; the child has been terminated and reaped.
    Interrupted,
}

impl Outcome {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Outcome::Interrupted)
    }

    /// Exit code the caller should finish with.
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Interrupted => INTERRUPTED_EXIT_CODE,
            Outcome::Exited(status) => status_exit_code(status),
        }
    }
}

/// Map an exit status to a shell-style exit code (128 + N for signal N).
pub fn status_exit_code(status: &ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

/// Errors that prevent supervision from starting or completing.
#[derive(Debug)]
pub enum SupervisorError {
    /// The child was already reaped before supervision started.
    ChildGone,
    /// Looking up the child's process group failed.
    ProcessGroup { source: Errno },
    /// The child shares our process group, so the terminal would signal it directly.
    SharedProcessGroup { group: Pid },
    /// Installing signal handlers failed.
    Signal { source: SignalError },
    /// Waiting for the child failed.
    Wait { source: std::io::Error },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::ChildGone => write!(f, "child process has already been reaped"),
            SupervisorError::ProcessGroup { source } => {
                write!(f, "failed to look up child process group: {}", source)
            }
            SupervisorError::SharedProcessGroup { group } => write!(
                f,
                "child shares process group {} with the supervisor; spawn it in its own group",
                group
            ),
            SupervisorError::Signal { source } => {
                write!(f, "failed to install signal handlers: {}", source)
            }
            SupervisorError::Wait { source } => {
                write!(f, "failed to wait for child process: {}", source)
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::ChildGone | SupervisorError::SharedProcessGroup { .. } => None,
            SupervisorError::ProcessGroup { source } => Some(source),
            SupervisorError::Signal { source } => Some(source),
            SupervisorError::Wait { source } => Some(source),
        }
    }
}

impl From<SignalError> for SupervisorError {
    fn from(source: SignalError) -> Self {
        SupervisorError::Signal { source }
    }
}

/// Owns one child process for the duration of a supervision scope.
///
/// Only one supervisor may be inside its scope at a time, since signal
/// dispositions are process-wide. Sequential supervisors are fine.
pub struct Supervisor {
    label: String,
    child: Child,
    pid: Pid,
    group: Pid,
    terminate_timeout: Duration,
    diagnostics: Box<dyn Write + Send>,
    bridge: SignalBridge,
    interrupts: Interrupts,
    state: ChildState,
    interrupted: bool,
}

impl Supervisor {
    /// Take ownership of `child`, which must run in its own process group.
    pub fn new(label: impl Into<String>, child: Child) -> Result<Self, SupervisorError> {
        let pid = child.id().ok_or(SupervisorError::ChildGone)?;
        let pid = Pid::from_raw(pid as i32);
        let group =
            unistd::getpgid(Some(pid)).map_err(|source| SupervisorError::ProcessGroup { source })?;
        if group == unistd::getpgrp() {
            return Err(SupervisorError::SharedProcessGroup { group });
        }

        Ok(Self {
            label: label.into(),
            child,
            pid,
            group,
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
            diagnostics: Box::new(std::io::stderr()),
            bridge: SignalBridge::new(group),
            interrupts: Interrupts::new(),
            state: ChildState::Running,
            interrupted: false,
        })
    }

    pub fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    /// Where the user-facing status lines go (stderr by default).
    pub fn with_diagnostics(mut self, out: impl Write + Send + 'static) -> Self {
        self.diagnostics = Box::new(out);
        self
    }

    /// Use an `Interrupts` listener that was entered before the child was
    /// spawned. An interrupt already pending on it takes the interrupt path.
    pub fn with_interrupts(mut self, interrupts: Interrupts) -> Self {
        self.interrupts = interrupts;
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> ChildState {
        self.state
    }

    /// Whether the scope was left through a user interrupt. Never reverts.
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    /// Wait for the child inside the supervision scope.
    ///
    /// `readers` are only touched on the interrupt path, where together they
    /// get joins bounded by one terminate timeout.
    pub async fn run(&mut self, readers: &mut [ReaderTask]) -> Result<Outcome, SupervisorError> {
        self.enter()?;

        let waited = tokio::select! {
            biased;
            () = self.interrupts.recv() => None,
            status = self.child.wait() => Some(status),
        };

        match waited {
            Some(Ok(status)) => {
                self.state = ChildState::Exited;
                self.exit();
                tracing::info!(label = %self.label, pid = self.pid.as_raw(), ?status, "child exited");
                Ok(Outcome::Exited(status))
            }
            Some(Err(source)) => {
                self.exit();
                Err(SupervisorError::Wait { source })
            }
            None => {
                self.shut_down(readers).await;
                self.exit();
                self.interrupted = true;
                tracing::info!(label = %self.label, pid = self.pid.as_raw(), "child terminated after interrupt");
                Ok(Outcome::Interrupted)
            }
        }
    }

    fn enter(&mut self) -> Result<(), SupervisorError> {
        self.interrupts.enter()?;
        if let Err(e) = self.bridge.enter() {
            if let Err(restore) = self.interrupts.exit() {
                tracing::warn!(error = %restore, "failed to restore interrupt disposition");
            }
            return Err(e.into());
        }
        tracing::debug!(
            label = %self.label,
            pid = self.pid.as_raw(),
            group = self.group.as_raw(),
            "entered supervision scope"
        );
        Ok(())
    }

    fn exit(&mut self) {
        if let Err(e) = self.bridge.exit() {
            tracing::warn!(error = %e, "failed to restore suspend/resume dispositions");
        }
        if let Err(e) = self.interrupts.exit() {
            tracing::warn!(error = %e, "failed to restore interrupt disposition");
        }
        tracing::debug!(label = %self.label, "left supervision scope");
    }

    async fn shut_down(&mut self, readers: &mut [ReaderTask]) {
        let line = format!("\nInterrupted. Terminating {} process...", self.label);
        self.diagnostic(&line);

        self.state = ChildState::Terminating;
        self.signal_group(Signal::SIGTERM);

        // A second interrupt cuts the grace period short.
        let grace = self.terminate_timeout;
        let exited = tokio::select! {
            waited = tokio::time::timeout(grace, self.child.wait()) => matches!(waited, Ok(Ok(_))),
            () = self.interrupts.recv() => {
                tracing::info!(label = %self.label, "second interrupt, skipping grace period");
                false
            }
        };

        if !exited && self.still_running() {
            let line = format!("Force-killing {} process...", self.label);
            self.diagnostic(&line);

            self.state = ChildState::Killed;
            self.signal_group(Signal::SIGKILL);
            if let Err(e) = self.child.wait().await {
                tracing::warn!(error = %e, pid = self.pid.as_raw(), "failed to reap killed child");
            }
        }
        self.state = ChildState::Exited;

        self.join_readers(readers).await;
        self.diagnostic("Done.");
    }

    fn still_running(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(error = %e, pid = self.pid.as_raw(), "failed to poll child status");
                true
            }
        }
    }

    fn signal_group(&self, signal: Signal) {
        match signal::killpg(self.group, signal) {
            Ok(()) => {
                tracing::debug!(group = self.group.as_raw(), %signal, "signalled process group");
            }
            Err(Errno::ESRCH) => {
                tracing::debug!(group = self.group.as_raw(), %signal, "process group already gone");
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    group = self.group.as_raw(),
                    %signal,
                    "failed to signal process group, signalling child directly"
                );
                if let Err(e) = signal::kill(self.pid, signal) {
                    tracing::warn!(error = %e, pid = self.pid.as_raw(), %signal, "failed to signal child");
                }
            }
        }
    }

    /// Join every reader within one shared `terminate_timeout` budget.
    async fn join_readers(&self, readers: &mut [ReaderTask]) {
        let deadline = Instant::now() + self.terminate_timeout;
        for reader in readers.iter_mut() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match reader.join_timeout(remaining).await {
                JoinStatus::Joined => {
                    tracing::debug!(stream = %reader.stream(), "reader joined");
                }
                JoinStatus::TimedOut => {
                    tracing::warn!(
                        stream = %reader.stream(),
                        timeout_ms = self.terminate_timeout.as_millis() as u64,
                        "reader did not finish after child exit, leaving it behind"
                    );
                }
            }
        }
    }

    fn diagnostic(&mut self, line: &str) {
        let _ = writeln!(self.diagnostics, "{}", line);
        let _ = self.diagnostics.flush();
    }
}
