//! End-to-end signal handling: run the shepherd binary around a shell
//! "agent", deliver real signals to shepherd, and watch both processes
//! through /proc.
#![cfg(target_os = "linux")]

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

fn shepherd(terminate_timeout_secs: u64, script: &str) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_shepherd"));
    command
        .args([
            "--config",
            "/nonexistent/shepherd.toml",
            "--label",
            "agent",
            "--terminate-timeout",
            &terminate_timeout_secs.to_string(),
            "--",
            "sh",
            "-c",
            script,
        ])
        .env_remove("RUST_LOG")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Own group, so the stop is not discarded as an orphaned-group stop
        // and signals aimed at shepherd never hit the test runner.
        .process_group(0);
    command
}

/// Start shepherd around `script`, which must print the agent's pid first.
fn start(terminate_timeout_secs: u64, script: &str) -> (Child, Pid, BufReader<ChildStdout>) {
    let mut child = shepherd(terminate_timeout_secs, script).spawn().unwrap();
    let mut stdout = BufReader::new(child.stdout.take().unwrap());
    let mut line = String::new();
    stdout.read_line(&mut line).unwrap();
    let agent = Pid::from_raw(line.trim().parse().expect("agent pid on first line"));

    let shepherd = pid_of(&child);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !(catches(shepherd, Signal::SIGINT) && catches(shepherd, Signal::SIGTSTP)) {
        assert!(Instant::now() < deadline, "shepherd never installed its handlers");
        std::thread::sleep(Duration::from_millis(10));
    }
    (child, agent, stdout)
}

/// Whether `pid` has a handler installed for `signal` (SigCgt in /proc/<pid>/status).
fn catches(pid: Pid, signal: Signal) -> bool {
    let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) else {
        return false;
    };
    status
        .lines()
        .find_map(|line| line.strip_prefix("SigCgt:"))
        .and_then(|mask| u64::from_str_radix(mask.trim(), 16).ok())
        .is_some_and(|mask| mask & (1 << (signal as i32 - 1)) != 0)
}

fn pid_of(child: &Child) -> Pid {
    Pid::from_raw(child.id() as i32)
}

/// Process state letter from /proc/<pid>/stat, None once the process is reaped.
fn state(pid: Pid) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    stat.rsplit_once(") ")?.1.chars().next()
}

fn wait_for(pid: Pid, wanted: impl Fn(Option<char>) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if wanted(state(pid)) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn stopped(state: Option<char>) -> bool {
    state == Some('T')
}

fn running(state: Option<char>) -> bool {
    matches!(state, Some('R' | 'S' | 'D'))
}

fn finish(mut child: Child) -> (ExitStatus, String) {
    let mut stderr = String::new();
    child
        .stderr
        .take()
        .unwrap()
        .read_to_string(&mut stderr)
        .unwrap();
    let status = child.wait().unwrap();
    (status, stderr)
}

#[test]
fn normal_exit_prints_nothing_and_passes_exit_code_through() {
    let (status, stderr) = finish(shepherd(5, "echo hello").spawn().unwrap());
    assert_eq!(status.code(), Some(0));
    assert!(!stderr.contains("Interrupted"), "stderr: {stderr}");
    assert!(!stderr.contains("Done."), "stderr: {stderr}");

    let (status, _) = finish(shepherd(5, "exit 3").spawn().unwrap());
    assert_eq!(status.code(), Some(3));
}

#[test]
fn interrupt_terminates_cooperative_agent() {
    let (child, agent, _stdout) = start(5, "echo $$; exec sleep 30");
    let start = Instant::now();

    kill(pid_of(&child), Signal::SIGINT).unwrap();
    let (status, stderr) = finish(child);

    assert_eq!(status.code(), Some(130));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(stderr.contains("\nInterrupted. Terminating agent process...\n"), "stderr: {stderr}");
    assert!(stderr.contains("Done.\n"), "stderr: {stderr}");
    assert!(!stderr.contains("Force-killing"), "stderr: {stderr}");
    assert_eq!(state(agent), None);
}

#[test]
fn interrupt_force_kills_agent_that_ignores_sigterm() {
    let (child, agent, _stdout) = start(1, "trap '' TERM; echo $$; exec sleep 30");

    kill(pid_of(&child), Signal::SIGINT).unwrap();
    let (status, stderr) = finish(child);

    assert_eq!(status.code(), Some(130));
    assert_eq!(stderr.matches("Force-killing agent process...").count(), 1, "stderr: {stderr}");
    let interrupted = stderr.find("Interrupted.").unwrap();
    let killing = stderr.find("Force-killing").unwrap();
    let done = stderr.find("Done.").unwrap();
    assert!(interrupted < killing && killing < done, "stderr: {stderr}");
    assert_eq!(state(agent), None);
}

#[test]
fn suspend_and_resume_are_forwarded_to_agent_group() {
    let (child, agent, _stdout) = start(5, "echo $$; exec sleep 30");
    let shepherd = pid_of(&child);

    // Two full cycles: the suspend handler has to be re-armed by the resume.
    for cycle in 0..2 {
        kill(shepherd, Signal::SIGTSTP).unwrap();
        assert!(wait_for(agent, stopped), "agent not stopped in cycle {cycle}");
        assert!(wait_for(shepherd, stopped), "shepherd not stopped in cycle {cycle}");

        kill(shepherd, Signal::SIGCONT).unwrap();
        assert!(wait_for(agent, running), "agent not resumed in cycle {cycle}");
        assert!(wait_for(shepherd, running), "shepherd not resumed in cycle {cycle}");

        // Let the resume handler finish re-arming before the next stop.
        std::thread::sleep(Duration::from_millis(100));
    }

    kill(shepherd, Signal::SIGINT).unwrap();
    let (status, stderr) = finish(child);
    assert_eq!(status.code(), Some(130));
    assert!(stderr.contains("Done."), "stderr: {stderr}");
}
