use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Exit code reported when the wall-clock timeout expired.
pub const TIMEOUT_EXIT_CODE: i32 = -1;
/// Exit code reported when the program could not be started or waited on.
pub const LAUNCH_FAILURE_EXIT_CODE: i32 = -2;
/// Exit code reported when the session was cancelled mid-execution.
pub const CANCELLED_EXIT_CODE: i32 = -3;

/// Signal `n` is reported as `128 + n`, the convention shells use.
const SIGNAL_EXIT_BASE: i32 = 128;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long to wait for the output readers after the child is gone.
const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(500);
const READ_CHUNK: usize = 8192;

/// How a program run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "value")]
pub enum ProcessExit {
    Code(i32),
    Signal(i32),
    Timeout,
    LaunchFailure,
    Cancelled,
}

impl ProcessExit {
    /// Signed exit status; zero only for a clean exit.
    pub fn code(&self) -> i32 {
        match self {
            ProcessExit::Code(code) => *code,
            ProcessExit::Signal(signal) => SIGNAL_EXIT_BASE + signal,
            ProcessExit::Timeout => TIMEOUT_EXIT_CODE,
            ProcessExit::LaunchFailure => LAUNCH_FAILURE_EXIT_CODE,
            ProcessExit::Cancelled => CANCELLED_EXIT_CODE,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code() == 0
    }

    pub fn is_crash(&self) -> bool {
        !self.is_success()
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ProcessExit::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ProcessExit::Signal(signal);
            }
        }
        ProcessExit::LaunchFailure
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessExit::Code(code) => write!(f, "exited with code {code}"),
            ProcessExit::Signal(signal) => write!(f, "terminated by signal {signal}"),
            ProcessExit::Timeout => f.write_str("timed out"),
            ProcessExit::LaunchFailure => f.write_str("failed to launch"),
            ProcessExit::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Everything observed from one program run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit: ProcessExit,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn new(exit: ProcessExit, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit,
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration: Duration::ZERO,
        }
    }

    pub fn exited(code: i32, stdout: impl Into<String>) -> Self {
        Self::new(ProcessExit::Code(code), stdout, "")
    }

    pub fn launch_failure(description: impl Into<String>) -> Self {
        Self::new(ProcessExit::LaunchFailure, "", description)
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn crashed(&self) -> bool {
        self.exit.is_crash()
    }
}

/// A program taking part in a comparison, identified by an explicit label.
///
/// `command[0]` is the executable, the rest are leading arguments. The
/// snapshot path, when there is one, is appended as the final argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ProgramSpec {
    pub label: String,
    pub command: Vec<String>,
}

impl ProgramSpec {
    pub fn new(label: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            label: label.into(),
            command,
        }
    }

    pub fn from_path(label: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self::new(label, vec![path.as_ref().to_string_lossy().into_owned()])
    }
}

/// Shared flag telling in-flight executions to stop.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Runs one program against one statement.
///
/// Implementations never fail: launch errors, timeouts and crashes are all
/// reported through the returned [`ExecutionResult`], so one broken target
/// cannot abort a trial for the others.
pub trait Executor: Send + Sync {
    fn execute(
        &self,
        program: &ProgramSpec,
        statement: &str,
        data_path: Option<&Path>,
        timeout: Duration,
    ) -> ExecutionResult;
}

#[derive(Debug, Clone)]
pub struct CommandExecutorConfig {
    pub working_dir: Option<PathBuf>,
    pub envs: BTreeMap<String, String>,
    pub max_poll_interval: Duration,
    pub drain_grace: Duration,
}

impl Default for CommandExecutorConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            envs: BTreeMap::new(),
            max_poll_interval: DEFAULT_MAX_POLL_INTERVAL,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

/// Runs programs as subprocesses: statement on stdin, both output streams captured.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    config: CommandExecutorConfig,
    cancel: CancellationToken,
}

enum Waited {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
    WaitFailed(String),
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn wait_with_timeout(&self, child: &mut Child, timeout: Duration) -> Waited {
        let start_time = Instant::now();
        let mut poll_interval = MIN_POLL_INTERVAL;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Waited::Exited(status),
                Ok(None) => {
                    if self.cancel.is_cancelled() {
                        terminate(child);
                        return Waited::Cancelled;
                    }
                    let elapsed = start_time.elapsed();
                    if elapsed >= timeout {
                        terminate(child);
                        return Waited::TimedOut;
                    }
                    thread::sleep(poll_interval.min(timeout - elapsed));
                    poll_interval = (poll_interval * 2).min(self.config.max_poll_interval);
                }
                Err(e) => {
                    terminate(child);
                    return Waited::WaitFailed(format!("Error waiting for child: {e}"));
                }
            }
        }
    }
}

/// Kills and reaps a child. Both steps may fail if it already exited.
///
/// On unix the child leads its own process group, and the whole group is
/// killed first so anything it spawned goes with it.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    kill_process_group(child);
    if let Err(e) = child.kill() {
        debug!("kill failed (child probably exited): {e}");
    }
    if let Err(e) = child.wait() {
        warn!("failed to reap killed child: {e}");
    }
}

#[cfg(unix)]
fn kill_process_group(child: &Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: kill(2) takes no pointers. The group id is the unreaped
    // child's pid, so it cannot have been recycled yet.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(
            "killing process group {pgid} failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

/// Drains one output stream on a background thread.
///
/// Bytes land in a shared buffer as they arrive, so a killed program's
/// partial output is still available.
struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    done: Receiver<()>,
}

impl OutputCapture {
    fn spawn<R: Read + Send + 'static>(mut reader: R) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let (done_tx, done) = mpsc::channel();
        thread::spawn(move || {
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            let _ = done_tx.send(());
        });
        Self { buffer, done }
    }

    /// Waits up to `grace` for end-of-stream, then returns what was read.
    /// A grandchild still holding the pipe open cannot stall the harness.
    fn collect(self, grace: Duration) -> String {
        let _ = self.done.recv_timeout(grace);
        let bytes = self
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn collect_stream(capture: Option<OutputCapture>, grace: Duration) -> String {
    capture.map(|c| c.collect(grace)).unwrap_or_default()
}

impl Executor for CommandExecutor {
    fn execute(
        &self,
        program: &ProgramSpec,
        statement: &str,
        data_path: Option<&Path>,
        timeout: Duration,
    ) -> ExecutionResult {
        let started = Instant::now();

        let Some((program_path, leading_args)) = program.command.split_first() else {
            return ExecutionResult::launch_failure(format!(
                "Program '{}' has an empty command",
                program.label
            ));
        };
        if self.cancel.is_cancelled() {
            return ExecutionResult::new(ProcessExit::Cancelled, "", "");
        }

        let mut cmd = Command::new(program_path);
        cmd.args(leading_args);
        if let Some(path) = data_path {
            cmd.arg(path);
        }
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }
        cmd.envs(&self.config.envs);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let error_msg = format!("Failed to spawn command {:?}: {e}", program.command);
                warn!(program = %program.label, "{error_msg}");
                return ExecutionResult::launch_failure(error_msg)
                    .with_duration(started.elapsed());
            }
        };

        // Written from a thread: a large statement must not deadlock against
        // a program that fills its stdout before reading stdin.
        let stdin_result = child.stdin.take().map(|mut child_stdin| {
            let bytes = statement.as_bytes().to_vec();
            let (tx, rx) = mpsc::channel();
            thread::spawn(move || {
                let outcome = match child_stdin.write_all(&bytes) {
                    Err(e) if e.kind() != ErrorKind::BrokenPipe => Err(e.to_string()),
                    _ => Ok(()),
                };
                let _ = tx.send(outcome);
            });
            rx
        });
        let stdout_capture = child.stdout.take().map(OutputCapture::spawn);
        let stderr_capture = child.stderr.take().map(OutputCapture::spawn);

        let waited = self.wait_with_timeout(&mut child, timeout);

        let grace = self.config.drain_grace;
        let stdout = collect_stream(stdout_capture, grace);
        let mut stderr = collect_stream(stderr_capture, grace);
        if let Some(Ok(Err(e))) = stdin_result.map(|rx| rx.recv_timeout(grace)) {
            warn!(program = %program.label, "failed to write statement to stdin: {e}");
        }

        let exit = match waited {
            Waited::Exited(status) => ProcessExit::from_status(status),
            Waited::TimedOut => {
                debug!(program = %program.label, ?timeout, "target timed out, killed");
                ProcessExit::Timeout
            }
            Waited::Cancelled => ProcessExit::Cancelled,
            Waited::WaitFailed(msg) => {
                warn!(program = %program.label, "{msg}");
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&msg);
                ProcessExit::LaunchFailure
            }
        };

        let duration = started.elapsed();
        debug!(
            program = %program.label,
            %exit,
            elapsed_ms = duration.as_millis() as u64,
            stdout_bytes = stdout.len(),
            "execution finished"
        );
        ExecutionResult {
            exit,
            stdout,
            stderr,
            duration,
        }
    }
}


#[cfg(all(test, unix))]
mod command_executor_tests {
    use super::*;

    fn sh(label: &str, script: &str) -> ProgramSpec {
        ProgramSpec::new(
            label,
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                script.to_string(),
                "sh".to_string(),
            ],
        )
    }

    fn run(program: &ProgramSpec, statement: &str, data: Option<&Path>) -> ExecutionResult {
        CommandExecutor::default().execute(program, statement, data, Duration::from_secs(5))
    }

    #[test]
    fn statement_is_delivered_on_stdin() {
        let result = run(&sh("echo", "cat"), "SELECT 1;", None);
        assert_eq!(result.exit, ProcessExit::Code(0));
        assert_eq!(result.stdout, "SELECT 1;");
        assert!(result.stderr.is_empty());
    }

    #[test]
    fn both_streams_are_captured() {
        let result = run(&sh("streams", "echo out; echo err >&2; exit 3"), "", None);
        assert_eq!(result.exit, ProcessExit::Code(3));
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert!(result.crashed());
    }

    #[test]
    fn data_path_is_last_argument() {
        let data = PathBuf::from("/tmp/some_snapshot.db");
        let result = run(&sh("args", "printf '%s' \"$1\""), "", Some(&data));
        assert_eq!(result.stdout, "/tmp/some_snapshot.db");
    }

    #[test]
    fn no_data_path_means_no_extra_argument() {
        let result = run(&sh("args", "printf '%s' \"$#\""), "", None);
        assert_eq!(result.stdout, "0");
    }

    #[test]
    fn segfault_exit_code_is_reported_verbatim() {
        let result = run(&sh("segv_code", "exit 139"), "", None);
        assert_eq!(result.exit, ProcessExit::Code(139));
        assert_eq!(result.exit.code(), 139);
    }

    #[test]
    fn death_by_signal_is_reported() {
        let result = run(&sh("segv", "kill -SEGV $$"), "", None);
        assert_eq!(result.exit, ProcessExit::Signal(11));
        assert_eq!(result.exit.code(), 139);
    }

    #[test]
    fn timeout_kills_and_keeps_partial_output() {
        let program = sh("slow", "printf partial; exec sleep 5");
        let started = Instant::now();
        let result = CommandExecutor::default().execute(
            &program,
            "",
            None,
            Duration::from_millis(200),
        );
        assert_eq!(result.exit, ProcessExit::Timeout);
        assert_eq!(result.exit.code(), TIMEOUT_EXIT_CODE);
        assert_eq!(result.stdout, "partial");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn missing_binary_is_a_launch_failure_not_an_error() {
        let program = ProgramSpec::from_path("ghost", "./this_command_does_not_exist_ever_12345");
        let result = run(&program, "SELECT 1;", None);
        assert_eq!(result.exit, ProcessExit::LaunchFailure);
        assert!(result.stderr.contains("Failed to spawn command"));
    }

    #[test]
    fn empty_command_is_a_launch_failure() {
        let result = run(&ProgramSpec::new("empty", vec![]), "", None);
        assert_eq!(result.exit, ProcessExit::LaunchFailure);
        assert!(result.stderr.contains("empty command"));
    }

    #[test]
    fn program_ignoring_large_stdin_still_exits_cleanly() {
        let statement = "x".repeat(1 << 20);
        let result = run(&sh("deaf", "exit 0"), &statement, None);
        assert_eq!(result.exit, ProcessExit::Code(0));
    }

    #[test]
    fn large_output_does_not_deadlock() {
        let statement = "y".repeat(1 << 20);
        let result = run(&sh("echo", "cat"), &statement, None);
        assert_eq!(result.exit, ProcessExit::Code(0));
        assert_eq!(result.stdout.len(), statement.len());
    }

    #[test]
    fn environment_and_working_dir_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CommandExecutorConfig::default();
        config.working_dir = Some(dir.path().to_path_buf());
        config
            .envs
            .insert("DIVERGENT_TEST_VAR".to_string(), "hello".to_string());
        let executor = CommandExecutor::new(config);
        let result = executor.execute(
            &sh("env", "printf '%s:' \"$DIVERGENT_TEST_VAR\"; pwd -P"),
            "",
            None,
            Duration::from_secs(5),
        );
        let expected_dir = dir.path().canonicalize().unwrap();
        assert_eq!(
            result.stdout.trim_end(),
            format!("hello:{}", expected_dir.display())
        );
    }

    #[test]
    fn cancellation_stops_an_inflight_program() {
        let cancel = CancellationToken::new();
        let executor = CommandExecutor::default().with_cancellation(cancel.clone());
        let canceller = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                cancel.cancel();
            })
        };
        let started = Instant::now();
        let result = executor.execute(
            &sh("sleepy", "exec sleep 5"),
            "",
            None,
            Duration::from_secs(10),
        );
        canceller.join().unwrap();
        assert_eq!(result.exit, ProcessExit::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn cancelled_executor_does_not_launch() {
        let executor = CommandExecutor::default();
        executor.cancellation().cancel();
        let result = run_with(&executor, &sh("never", "exit 0"));
        assert_eq!(result.exit, ProcessExit::Cancelled);
    }

    fn run_with(executor: &CommandExecutor, program: &ProgramSpec) -> ExecutionResult {
        executor.execute(program, "", None, Duration::from_secs(5))
    }

    #[cfg(target_os = "linux")]
    fn is_gone(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            // Killed but not yet reaped by init.
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn timeout_kills_background_children_too() {
        let executor = CommandExecutor::default();
        let result = executor.execute(
            &sh("forker", "sleep 30 & echo $!; sleep 30"),
            "",
            None,
            Duration::from_millis(300),
        );
        assert_eq!(result.exit, ProcessExit::Timeout);
        let grandchild: u32 = result.stdout.trim().parse().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !is_gone(grandchild) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(is_gone(grandchild), "background child {grandchild} outlived the timeout");
    }
}
