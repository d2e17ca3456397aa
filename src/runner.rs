//! Spawns and supervises a script's child process (spec §4.5).
//!
//! The Executor only ever sees [`spawn`] and the handle it returns; process
//! group management, PATH derivation, and the ready/terminated signals are
//! runner-internal.

use std::{
    ffi::OsString,
    io::IsTerminal,
    path::PathBuf,
    process::Stdio,
    sync::Arc,
};

use regex::Regex;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::watch,
};
use tracing::{instrument, trace, warn};

use crate::{error::ExecutionFailure, path::AbsDirPath, runtime::Runtime};

/// Runner-facing state machine (spec §4.5): `Starting -> Started ->
/// (Killing)* -> Stopped`. A `kill()` requested while `Starting` is latched
/// and applied as soon as the process actually spawns.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum State {
    Starting,
    Started,
    Killing,
    Stopped,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum TerminationOutcome {
    ExitZero,
    ExitNonZero(i32),
    ExitSignal(i32),
    SpawnError(String),
    Killed,
}

impl TerminationOutcome {
    pub fn into_execution_result(self) -> Result<(), ExecutionFailure> {
        match self {
            TerminationOutcome::ExitZero => Ok(()),
            TerminationOutcome::ExitNonZero(code) => Err(ExecutionFailure::ExitNonZero(code)),
            TerminationOutcome::ExitSignal(signal) => Err(ExecutionFailure::ExitSignal(signal)),
            TerminationOutcome::SpawnError(message) => Err(ExecutionFailure::SpawnError(message)),
            TerminationOutcome::Killed => Err(ExecutionFailure::Killed),
        }
    }
}

/// Receives captured output lines as they arrive, so the executor can tee
/// them to the terminal logger and to the replay files at the same time.
pub trait OutputSink: Send + Sync {
    fn on_stdout_line(&self, line: &[u8]);
    fn on_stderr_line(&self, line: &[u8]);
}

/// A spawned child process and its two awaitable signals.
pub struct RunningProcess {
    state: watch::Receiver<State>,
    ready: watch::Receiver<bool>,
    terminated: watch::Receiver<Option<TerminationOutcome>>,
    kill_tx: watch::Sender<KillRequest>,
    pid: Option<u32>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
enum KillRequest {
    #[default]
    None,
    Graceful,
    Forceful,
}

impl RunningProcess {
    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Resolves once the process has emitted its readiness signal (spec
    /// §4.5 "service readiness"). Takes `&self` (cloning the receiver
    /// internally) so callers can await readiness and termination
    /// concurrently from the same handle.
    pub async fn ready(&self) {
        let mut rx = self.ready.clone();
        let _ = rx.wait_for(|r| *r).await;
    }

    /// Resolves with the process's termination outcome. Can be awaited
    /// concurrently with [`RunningProcess::ready`], and by more than one
    /// clone of this handle.
    pub async fn terminated(&self) -> TerminationOutcome {
        let mut rx = self.terminated.clone();
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without ever recording an outcome: treat as
                // a spawn-time failure that was never reported, which
                // should not happen in practice.
                return TerminationOutcome::SpawnError("runner task ended without reporting an outcome".to_string());
            }
        }
    }

    /// Request termination: sends SIGINT (POSIX) / taskkill (Windows) to the
    /// process group. Safe to call while `Starting`; the request is latched
    /// and applied once the child actually spawns.
    pub fn request_kill(&self) {
        let _ = self.kill_tx.send(KillRequest::Graceful);
    }

    /// Escalate to a forceful kill (SIGKILL / taskkill /F), e.g. on a second
    /// SIGINT received by the orchestrating process.
    pub fn request_kill_forceful(&self) {
        let _ = self.kill_tx.send(KillRequest::Forceful);
    }
}

/// Spawn `command` (plus `extra_args`, shell-joined) in `package_dir`,
/// capturing stdout/stderr line-by-line into `sink`. `ready_when_line_matches`
/// drives service readiness; absent, readiness fires immediately on spawn.
#[instrument(skip(env, sink, runtime))]
pub fn spawn(
    package_dir: AbsDirPath,
    command: String,
    extra_args: Vec<String>,
    env: Vec<(String, String)>,
    ready_when_line_matches: Option<String>,
    sink: Arc<dyn OutputSink>,
    runtime: Arc<dyn Runtime>,
) -> RunningProcess {
    let (state_tx, state_rx) = watch::channel(State::Starting);
    let (ready_tx, ready_rx) = watch::channel(false);
    let (terminated_tx, terminated_rx) = watch::channel(None);
    let (kill_tx, kill_rx) = watch::channel(KillRequest::None);

    let handle = RunningProcess {
        state: state_rx,
        ready: ready_rx,
        terminated: terminated_rx,
        kill_tx,
        pid: None,
    };

    tokio::spawn(run_child(
        package_dir,
        command,
        extra_args,
        env,
        ready_when_line_matches,
        sink,
        runtime,
        state_tx,
        ready_tx,
        terminated_tx,
        kill_rx,
    ));

    handle
}

#[allow(clippy::too_many_arguments)]
async fn run_child(
    package_dir: AbsDirPath,
    command: String,
    extra_args: Vec<String>,
    env: Vec<(String, String)>,
    ready_when_line_matches: Option<String>,
    sink: Arc<dyn OutputSink>,
    runtime: Arc<dyn Runtime>,
    state_tx: watch::Sender<State>,
    ready_tx: watch::Sender<bool>,
    terminated_tx: watch::Sender<Option<TerminationOutcome>>,
    mut kill_rx: watch::Receiver<KillRequest>,
) {
    let mut cmd = shell_command(&command, &extra_args);
    cmd.current_dir(package_dir.as_std_path());
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let parent_path = runtime.path_var();
    cmd.env("PATH", build_path_env(&package_dir, parent_path.as_deref()));
    if std::io::stdout().is_terminal() {
        cmd.env("FORCE_COLOR", "true");
    }
    for (name, value) in env {
        cmd.env(name, value);
    }

    detach_process_group(&mut cmd);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = state_tx.send(State::Stopped);
            let _ = terminated_tx.send(Some(TerminationOutcome::SpawnError(e.to_string())));
            return;
        }
    };
    let pid = child.id();

    // Apply a kill request latched while we were still `Starting`.
    let pending = *kill_rx.borrow();
    let _ = state_tx.send(State::Started);
    if pending != KillRequest::None {
        if let Some(pid) = pid {
            kill_process_group(pid, pending == KillRequest::Forceful);
        }
        let _ = state_tx.send(State::Killing);
    }

    let regex = ready_when_line_matches.as_deref().and_then(|p| match Regex::new(p) {
        Ok(r) => Some(r),
        Err(e) => {
            warn!(pattern = p, error = %e, "invalid readyWhen.lineMatches pattern, ignoring");
            None
        }
    });
    if regex.is_none() {
        let _ = ready_tx.send(true);
    }

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut stdout_done = false;
    let mut stderr_done = false;

    loop {
        tokio::select! {
            line = stdout_lines.next_line(), if !stdout_done => {
                match line {
                    Ok(Some(line)) => {
                        sink.on_stdout_line(line.as_bytes());
                        if let Some(re) = &regex {
                            if !*ready_tx.borrow() && re.is_match(&line) {
                                let _ = ready_tx.send(true);
                            }
                        }
                    }
                    Ok(None) => stdout_done = true,
                    Err(e) => {
                        trace!(error = %e, "stdout read error");
                        stdout_done = true;
                    }
                }
            }
            line = stderr_lines.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(line)) => {
                        sink.on_stderr_line(line.as_bytes());
                        if let Some(re) = &regex {
                            if !*ready_tx.borrow() && re.is_match(&line) {
                                let _ = ready_tx.send(true);
                            }
                        }
                    }
                    Ok(None) => stderr_done = true,
                    Err(e) => {
                        trace!(error = %e, "stderr read error");
                        stderr_done = true;
                    }
                }
            }
            changed = kill_rx.changed() => {
                if changed.is_ok() {
                    let request = *kill_rx.borrow();
                    if request != KillRequest::None {
                        let _ = state_tx.send(State::Killing);
                        if let Some(pid) = pid {
                            kill_process_group(pid, request == KillRequest::Forceful);
                        }
                    }
                }
            }
            status = child.wait() => {
                let outcome = match status {
                    Ok(status) if *kill_rx.borrow() != KillRequest::None => {
                        let _ = status;
                        TerminationOutcome::Killed
                    }
                    Ok(status) if status.success() => TerminationOutcome::ExitZero,
                    Ok(status) => exit_outcome(status),
                    Err(e) => TerminationOutcome::SpawnError(e.to_string()),
                };
                let _ = state_tx.send(State::Stopped);
                let _ = ready_tx.send(true);
                let _ = terminated_tx.send(Some(outcome));
                return;
            }
        }
    }
}

#[cfg(unix)]
fn exit_outcome(status: std::process::ExitStatus) -> TerminationOutcome {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = status.signal() {
        TerminationOutcome::ExitSignal(signal)
    } else {
        TerminationOutcome::ExitNonZero(status.code().unwrap_or(-1))
    }
}

#[cfg(windows)]
fn exit_outcome(status: std::process::ExitStatus) -> TerminationOutcome {
    TerminationOutcome::ExitNonZero(status.code().unwrap_or(-1))
}

/// `sh -c '<command> <extra_args...>'` on POSIX, `cmd /C` on Windows,
/// matching how the scripting ecosystem this ScriptConfig came from already
/// invokes commands through its own shell.
fn shell_command(command: &str, extra_args: &[String]) -> Command {
    let full = if extra_args.is_empty() {
        command.to_string()
    } else {
        format!("{command} {}", extra_args.join(" "))
    };

    #[cfg(unix)]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(full);
        cmd
    }
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(full);
        cmd
    }
}

#[cfg(unix)]
fn detach_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(windows)]
fn detach_process_group(cmd: &mut Command) {
    // CREATE_NEW_PROCESS_GROUP, so `taskkill /T` below can reach the whole tree.
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

#[cfg(unix)]
fn kill_process_group(pid: u32, forceful: bool) {
    let signal = if forceful { libc::SIGKILL } else { libc::SIGINT };
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

#[cfg(windows)]
fn kill_process_group(pid: u32, _forceful: bool) {
    // Windows has no graceful process-group signal; always hard-kill the tree.
    let _ = std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .status();
}

/// Prepend `node_modules/.bin` for `package_dir` and every ancestor, then
/// the parent `PATH` with any existing `node_modules/.bin` entries filtered
/// out (spec §4.5 "avoid double-prefixing").
fn build_path_env(package_dir: &AbsDirPath, parent_path: Option<&str>) -> OsString {
    let mut entries: Vec<PathBuf> = Vec::new();
    let mut current = Some(package_dir.clone());
    while let Some(dir) = current {
        entries.push(dir.as_std_path().join("node_modules").join(".bin"));
        current = dir.parent();
    }

    if let Some(parent_path) = parent_path {
        for entry in std::env::split_paths(parent_path) {
            if !is_node_modules_bin(&entry) {
                entries.push(entry);
            }
        }
    }

    std::env::join_paths(entries).unwrap_or_default()
}

fn is_node_modules_bin(path: &std::path::Path) -> bool {
    let is_bin = path.file_name().is_some_and(|n| n == ".bin");
    let parent_is_node_modules = path
        .parent()
        .and_then(|p| p.file_name())
        .is_some_and(|n| n == "node_modules");
    is_bin && parent_is_node_modules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_path_env_prepends_ancestors_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("packages").join("app");
        std::fs::create_dir_all(&nested).unwrap();
        let package_dir = AbsDirPath::try_from(nested.clone()).unwrap();

        let existing = std::env::join_paths([
            dir.path().join("node_modules").join(".bin"),
            PathBuf::from("/usr/bin"),
        ])
        .unwrap();
        let existing = existing.to_string_lossy().into_owned();

        let result = build_path_env(&package_dir, Some(&existing));
        let result = result.to_string_lossy().into_owned();

        assert!(result.contains(nested.join("node_modules").join(".bin").to_string_lossy().as_ref()));
        assert!(result.contains("/usr/bin"));
        // The pre-existing node_modules/.bin entry from the parent PATH
        // should not appear twice.
        let bin_count = result
            .matches(dir.path().join("node_modules").join(".bin").to_string_lossy().as_ref())
            .count();
        assert_eq!(bin_count, 1);
    }

    #[tokio::test]
    async fn spawn_runs_and_reports_exit_zero() {
        struct NullSink;
        impl OutputSink for NullSink {
            fn on_stdout_line(&self, _line: &[u8]) {}
            fn on_stderr_line(&self, _line: &[u8]) {}
        }

        let dir = tempfile::tempdir().unwrap();
        let package_dir = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let handle = spawn(
            package_dir,
            "true".to_string(),
            Vec::new(),
            Vec::new(),
            None,
            Arc::new(NullSink),
            Arc::new(crate::runtime::ProcessRuntime::host()),
        );
        handle.ready().await;
        let outcome = handle.terminated().await;
        assert_eq!(outcome, TerminationOutcome::ExitZero);
    }
}
