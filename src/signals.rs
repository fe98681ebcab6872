//! Process-wide signal plumbing for a supervised child.
//!
//! `SignalBridge` forwards terminal suspend (SIGTSTP) and resume (SIGCONT)
//! to the child's process group. `Interrupts` turns SIGINT into an awaitable
//! event through a self-pipe. `IgnoreInterrupts` keeps this process alive
//! while an interactive child owns the terminal.
//!
//! Handlers run in signal context: they only read atomics and call
//! async-signal-safe functions. Saved dispositions live on the instances;
//! the statics below hold only what a handler has to read.
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::libc;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;

const NO_GROUP: i32 = 0;
const INVALID_FILENO: i32 = -1;

/// Process group that suspend/resume are forwarded to while a bridge is active.
static TARGET_GROUP: AtomicI32 = AtomicI32::new(NO_GROUP);

/// Write end of the interrupt self-pipe while a listener is active.
static INTERRUPT_WRITE: AtomicI32 = AtomicI32::new(INVALID_FILENO);

/// Errors raised while installing or removing signal handlers.
#[derive(Debug)]
pub enum SignalError {
    /// Another instance already owns these handlers.
    Busy,
    /// `sigaction` rejected the new disposition.
    Install { signal: Signal, source: Errno },
    /// Creating or configuring the interrupt self-pipe failed.
    Pipe { source: std::io::Error },
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalError::Busy => {
                write!(f, "signal handlers are already owned by another supervisor")
            }
            SignalError::Install { signal, source } => {
                write!(f, "failed to set disposition for {}: {}", signal, source)
            }
            SignalError::Pipe { source } => {
                write!(f, "failed to set up interrupt pipe: {}", source)
            }
        }
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignalError::Busy => None,
            SignalError::Install { source, .. } => Some(source),
            SignalError::Pipe { source } => Some(source),
        }
    }
}

fn action(handler: SigHandler) -> SigAction {
    SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty())
}

/// Install `handler` for `signal`, returning the disposition it replaced.
fn install(signal: Signal, handler: SigHandler) -> Result<SigAction, SignalError> {
    // SAFETY: every handler in this module is async-signal-safe, and the
    // previous action is only ever handed back to `restore` verbatim.
    unsafe { signal::sigaction(signal, &action(handler)) }
        .map_err(|source| SignalError::Install { signal, source })
}

fn restore(signal: Signal, previous: &SigAction) -> Result<(), SignalError> {
    // SAFETY: `previous` was returned by `sigaction` for this same signal.
    unsafe { signal::sigaction(signal, previous) }
        .map(drop)
        .map_err(|source| SignalError::Install { signal, source })
}

fn forward(signal: Signal) {
    let group = TARGET_GROUP.load(Ordering::Acquire);
    if group != NO_GROUP {
        let _ = signal::killpg(Pid::from_raw(group), signal);
    }
}

extern "C" fn on_suspend(_: libc::c_int) {
    let errno = Errno::last();

    forward(Signal::SIGTSTP);

    // Must happen before the re-raise, or the raised signal lands back here.
    // SAFETY: SIG_DFL is always a valid disposition.
    let _ = unsafe { signal::sigaction(Signal::SIGTSTP, &action(SigHandler::SigDfl)) };

    // SIGTSTP is blocked while this handler runs; the stop takes effect on return.
    let _ = signal::raise(Signal::SIGTSTP);

    errno.set();
}

extern "C" fn on_resume(_: libc::c_int) {
    let errno = Errno::last();

    forward(Signal::SIGCONT);

    // SAFETY: `on_suspend` is async-signal-safe.
    let _ = unsafe {
        signal::sigaction(
            Signal::SIGTSTP,
            &action(SigHandler::Handler(on_suspend)),
        )
    };

    errno.set();
}

extern "C" fn on_interrupt(_: libc::c_int) {
    let errno = Errno::last();

    let fd = INTERRUPT_WRITE.load(Ordering::Acquire);
    if fd != INVALID_FILENO {
        // SAFETY: the write end is published only while it is open, and is
        // unpublished before it is closed.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        // EAGAIN means the pipe already holds unread interrupts.
        let _ = nix::unistd::write(fd, &[1]);
    }

    errno.set();
}

struct SavedDispositions {
    suspend: SigAction,
    resume: SigAction,
}

/// Forwards terminal suspend/resume to a child's process group.
///
/// While active, Ctrl-Z stops the child's whole group first and then this
/// process; `fg` resumes this process, which resumes the group and re-arms
/// the suspend handler for the next cycle. The child must live in its own
/// process group, otherwise the terminal signals it directly as well.
pub struct SignalBridge {
    group: Pid,
    saved: Option<SavedDispositions>,
}

impl SignalBridge {
    pub fn new(group: Pid) -> Self {
        Self { group, saved: None }
    }

    /// Save the current SIGTSTP/SIGCONT dispositions and install the
    /// forwarding handlers. Entering an active bridge is a no-op.
    pub fn enter(&mut self) -> Result<(), SignalError> {
        if self.saved.is_some() {
            return Ok(());
        }

        TARGET_GROUP
            .compare_exchange(
                NO_GROUP,
                self.group.as_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| SignalError::Busy)?;

        let suspend = match install(Signal::SIGTSTP, SigHandler::Handler(on_suspend)) {
            Ok(previous) => previous,
            Err(e) => {
                TARGET_GROUP.store(NO_GROUP, Ordering::Release);
                return Err(e);
            }
        };
        let resume = match install(Signal::SIGCONT, SigHandler::Handler(on_resume)) {
            Ok(previous) => previous,
            Err(e) => {
                let _ = restore(Signal::SIGTSTP, &suspend);
                TARGET_GROUP.store(NO_GROUP, Ordering::Release);
                return Err(e);
            }
        };

        self.saved = Some(SavedDispositions { suspend, resume });
        tracing::debug!(group = self.group.as_raw(), "suspend/resume forwarding active");
        Ok(())
    }

    /// Restore the dispositions captured by `enter`. Exiting an idle bridge is a no-op.
    pub fn exit(&mut self) -> Result<(), SignalError> {
        let Some(saved) = self.saved.take() else {
            return Ok(());
        };

        let suspend = restore(Signal::SIGTSTP, &saved.suspend);
        let resume = restore(Signal::SIGCONT, &saved.resume);
        TARGET_GROUP.store(NO_GROUP, Ordering::Release);

        tracing::debug!(group = self.group.as_raw(), "suspend/resume forwarding removed");
        suspend.and(resume)
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.saved.is_some()
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        if let Err(e) = self.exit() {
            tracing::warn!(error = %e, "failed to restore suspend/resume dispositions");
        }
    }
}

struct Listening {
    saved: SigAction,
    receiver: pipe::Receiver,
    // Kept open until the handler has been removed.
    _write: OwnedFd,
}

/// Delivers SIGINT as an awaitable event.
///
/// Must be entered from within a tokio runtime.
pub struct Interrupts {
    listening: Option<Listening>,
}

impl Interrupts {
    pub fn new() -> Self {
        Self { listening: None }
    }

    /// Save the current SIGINT disposition and start catching interrupts.
    pub fn enter(&mut self) -> Result<(), SignalError> {
        if self.listening.is_some() {
            return Ok(());
        }

        let (read, write) = self_pipe()?;
        let receiver =
            pipe::Receiver::from_owned_fd(read).map_err(|source| SignalError::Pipe { source })?;

        INTERRUPT_WRITE
            .compare_exchange(
                INVALID_FILENO,
                write.as_raw_fd(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| SignalError::Busy)?;

        let saved = match install(Signal::SIGINT, SigHandler::Handler(on_interrupt)) {
            Ok(previous) => previous,
            Err(e) => {
                INTERRUPT_WRITE.store(INVALID_FILENO, Ordering::Release);
                return Err(e);
            }
        };

        self.listening = Some(Listening {
            saved,
            receiver,
            _write: write,
        });
        Ok(())
    }

    /// Wait for the next interrupt. Never completes while not listening.
    pub async fn recv(&mut self) {
        let Some(listening) = self.listening.as_mut() else {
            return std::future::pending().await;
        };

        let mut byte = [0u8; 1];
        loop {
            match listening.receiver.read(&mut byte).await {
                Ok(0) => break,
                Ok(_) => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "interrupt pipe read failed");
                    break;
                }
            }
        }
        std::future::pending().await
    }

    /// Restore the SIGINT disposition captured by `enter` and close the pipe.
    pub fn exit(&mut self) -> Result<(), SignalError> {
        let Some(listening) = self.listening.take() else {
            return Ok(());
        };

        INTERRUPT_WRITE.store(INVALID_FILENO, Ordering::Release);
        restore(Signal::SIGINT, &listening.saved)
    }

    #[cfg(test)]
    pub fn is_listening(&self) -> bool {
        self.listening.is_some()
    }
}

impl Default for Interrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Interrupts {
    fn drop(&mut self) {
        if let Err(e) = self.exit() {
            tracing::warn!(error = %e, "failed to restore interrupt disposition");
        }
    }
}

fn self_pipe() -> Result<(OwnedFd, OwnedFd), SignalError> {
    let pipe_error = |e: Errno| SignalError::Pipe { source: e.into() };

    let (read, write) = nix::unistd::pipe().map_err(pipe_error)?;
    for fd in [&read, &write] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(pipe_error)?;
    }
    // The handler must never block on a full pipe.
    fcntl(write.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(pipe_error)?;

    Ok((read, write))
}

/// Ignores SIGINT and SIGQUIT in this process until dropped.
///
/// Install it only after spawning an interactive child: ignored dispositions
/// are inherited across exec.
pub struct IgnoreInterrupts {
    saved: Vec<(Signal, SigAction)>,
}

impl IgnoreInterrupts {
    pub fn install() -> Result<Self, SignalError> {
        let mut guard = Self { saved: Vec::new() };
        for signal in [Signal::SIGINT, Signal::SIGQUIT] {
            let previous = install(signal, SigHandler::SigIgn)?;
            guard.saved.push((signal, previous));
        }
        Ok(guard)
    }
}

impl Drop for IgnoreInterrupts {
    fn drop(&mut self) {
        for (signal, previous) in self.saved.drain(..).rev() {
            if let Err(e) = restore(signal, &previous) {
                tracing::warn!(error = %e, "failed to restore signal disposition");
            }
        }
    }
}

/// True while some `Interrupts` instance is catching SIGINT.
#[cfg(test)]
pub(crate) fn interrupts_listening() -> bool {
    INTERRUPT_WRITE.load(Ordering::Acquire) != INVALID_FILENO
}

/// The raw handler address and flags currently installed for `signal`.
#[cfg(test)]
pub(crate) fn disposition(signal: Signal) -> (usize, libc::c_int) {
    let mut current = std::mem::MaybeUninit::<libc::sigaction>::uninit();
    // SAFETY: a null new action only queries the current one.
    let rc = unsafe {
        libc::sigaction(
            signal as libc::c_int,
            std::ptr::null(),
            current.as_mut_ptr(),
        )
    };
    assert_eq!(rc, 0, "sigaction query failed for {signal}");
    // SAFETY: sigaction succeeded and filled `current`.
    let current = unsafe { current.assume_init() };
    (current.sa_sigaction, current.sa_flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::os::unix::process::CommandExt;
    use std::process::{Child, Command};
    use std::time::Duration;

    const TRACKED: [Signal; 3] = [Signal::SIGTSTP, Signal::SIGCONT, Signal::SIGINT];

    fn snapshot() -> Vec<(usize, libc::c_int)> {
        TRACKED.iter().map(|&s| disposition(s)).collect()
    }

    fn isolated_sleeper() -> Child {
        Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap()
    }

    fn group_of(child: &Child) -> Pid {
        Pid::from_raw(child.id() as i32)
    }

    fn reap(mut child: Child) {
        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    #[serial]
    fn test_bridge_installs_handlers_and_restores_on_exit() {
        let child = isolated_sleeper();
        let before = snapshot();

        let mut bridge = SignalBridge::new(group_of(&child));
        bridge.enter().unwrap();
        assert!(bridge.is_active());
        assert_eq!(disposition(Signal::SIGTSTP).0, on_suspend as usize);
        assert_eq!(disposition(Signal::SIGCONT).0, on_resume as usize);

        bridge.exit().unwrap();
        assert!(!bridge.is_active());
        assert_eq!(snapshot(), before);

        reap(child);
    }

    #[test]
    #[serial]
    fn test_bridge_restores_on_drop() {
        let child = isolated_sleeper();
        let before = snapshot();
        {
            let mut bridge = SignalBridge::new(group_of(&child));
            bridge.enter().unwrap();
        }
        assert_eq!(snapshot(), before);
        reap(child);
    }

    #[test]
    #[serial]
    fn test_bridge_restores_non_default_dispositions() {
        let child = isolated_sleeper();
        // Start from an ignored SIGTSTP, as a shell without job control would leave it.
        let original = install(Signal::SIGTSTP, SigHandler::SigIgn).unwrap();
        let before = snapshot();

        let mut bridge = SignalBridge::new(group_of(&child));
        bridge.enter().unwrap();
        bridge.exit().unwrap();

        assert_eq!(snapshot(), before);
        assert_eq!(disposition(Signal::SIGTSTP).0, libc::SIG_IGN);

        restore(Signal::SIGTSTP, &original).unwrap();
        reap(child);
    }

    #[test]
    #[serial]
    fn test_second_bridge_is_busy_while_first_is_active() {
        let child = isolated_sleeper();
        let mut first = SignalBridge::new(group_of(&child));
        first.enter().unwrap();

        let mut second = SignalBridge::new(group_of(&child));
        let err = second.enter().unwrap_err();
        assert!(matches!(err, SignalError::Busy));
        assert!(!second.is_active());

        first.exit().unwrap();
        second.enter().unwrap();
        second.exit().unwrap();
        reap(child);
    }

    #[test]
    #[serial]
    fn test_resume_reinstalls_suspend_handler() {
        let mut child = isolated_sleeper();
        let mut bridge = SignalBridge::new(group_of(&child));
        bridge.enter().unwrap();

        // What the suspend handler leaves behind once the stop has happened.
        install(Signal::SIGTSTP, SigHandler::SigDfl).unwrap();
        assert_eq!(disposition(Signal::SIGTSTP).0, libc::SIG_DFL);

        signal::raise(Signal::SIGCONT).unwrap();
        assert_eq!(disposition(Signal::SIGTSTP).0, on_suspend as usize);

        // A second cycle finds the handler armed again.
        install(Signal::SIGTSTP, SigHandler::SigDfl).unwrap();
        signal::raise(Signal::SIGCONT).unwrap();
        assert_eq!(disposition(Signal::SIGTSTP).0, on_suspend as usize);

        // Forwarded SIGCONT leaves the child running.
        assert!(child.try_wait().unwrap().is_none());

        bridge.exit().unwrap();
        reap(child);
    }

    #[test]
    #[serial]
    fn test_sequential_bridges_do_not_drift() {
        let before = snapshot();
        for _ in 0..2 {
            let child = isolated_sleeper();
            let mut bridge = SignalBridge::new(group_of(&child));
            bridge.enter().unwrap();
            bridge.exit().unwrap();
            assert_eq!(snapshot(), before);
            reap(child);
        }
    }

    #[tokio::test]
    #[serial]
    async fn test_interrupts_deliver_sigint_and_restore() {
        let before = snapshot();

        let mut interrupts = Interrupts::new();
        interrupts.enter().unwrap();
        assert!(interrupts.is_listening());
        assert!(interrupts_listening());
        assert_eq!(disposition(Signal::SIGINT).0, on_interrupt as usize);

        signal::raise(Signal::SIGINT).unwrap();
        tokio::time::timeout(Duration::from_secs(5), interrupts.recv())
            .await
            .expect("interrupt was not delivered");

        interrupts.exit().unwrap();
        assert!(!interrupts_listening());
        assert_eq!(snapshot(), before);
    }

    #[tokio::test]
    #[serial]
    async fn test_interrupts_recv_pends_when_idle() {
        let mut interrupts = Interrupts::new();
        let waited =
            tokio::time::timeout(Duration::from_millis(50), interrupts.recv()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    #[serial]
    async fn test_second_interrupt_listener_is_busy() {
        let mut first = Interrupts::new();
        first.enter().unwrap();

        let mut second = Interrupts::new();
        assert!(matches!(second.enter().unwrap_err(), SignalError::Busy));

        first.exit().unwrap();
    }

    #[test]
    #[serial]
    fn test_ignore_interrupts_guard_restores() {
        let before = (disposition(Signal::SIGINT), disposition(Signal::SIGQUIT));
        {
            let _guard = IgnoreInterrupts::install().unwrap();
            assert_eq!(disposition(Signal::SIGINT).0, libc::SIG_IGN);
            assert_eq!(disposition(Signal::SIGQUIT).0, libc::SIG_IGN);
            // Ignored, so this does not end the test process.
            signal::raise(Signal::SIGINT).unwrap();
        }
        assert_eq!(
            (disposition(Signal::SIGINT), disposition(Signal::SIGQUIT)),
            before
        );
    }

    #[test]
    fn test_signal_error_display() {
        let err = SignalError::Install {
            signal: Signal::SIGTSTP,
            source: Errno::EINVAL,
        };
        assert!(err.to_string().contains("SIGTSTP"));
        assert!(SignalError::Busy.to_string().contains("already owned"));
    }
}
