//! Process engine boundary and the default child-process engine.
//!
//! The pool never spawns anything itself. It asks a [`ProcessEngine`] for a
//! [`Session`] when it needs a worker and calls [`Session::close`] when the
//! worker is retired. [`CommandEngine`] is the stock implementation on top of
//! `std::process`.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{BoxError, Error, Result};

/// How often `close` polls for exit while waiting out the grace period.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long `close` waits for a writer to release stdin before killing.
const STDIN_RELEASE_WAIT: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A live interactive process owned by one worker.
pub trait Session: Send + Sync + 'static {
    /// Terminate the process. Called exactly once, outside the pool lock.
    fn close(&self) -> std::result::Result<(), BoxError>;

    fn is_alive(&self) -> bool {
        true
    }
}

/// Launches sessions for the pool.
pub trait ProcessEngine: Send + Sync + 'static {
    type Session: Session;

    fn start_session(&self, spec: &LaunchSpec) -> std::result::Result<Self::Session, BoxError>;
}

// ---------------------------------------------------------------------------
// LaunchSpec
// ---------------------------------------------------------------------------

/// What to run for every worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
    destroy_process_tree: bool,
}

impl LaunchSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            destroy_process_tree: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Kill the whole process group on close, not just the direct child.
    pub fn destroy_process_tree(mut self, enabled: bool) -> Self {
        self.destroy_process_tree = enabled;
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn arguments(&self) -> impl Iterator<Item = &OsStr> {
        self.args.iter().map(OsString::as_os_str)
    }

    pub fn envs(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.env.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    pub fn destroys_process_tree(&self) -> bool {
        self.destroy_process_tree
    }

    pub fn validate(&self) -> Result<()> {
        if self.program.is_empty() {
            return Err(Error::configuration("launch spec has an empty program"));
        }
        Ok(())
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        if self.destroy_process_tree {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        command
    }
}

// ---------------------------------------------------------------------------
// CommandEngine
// ---------------------------------------------------------------------------

/// Spawns each worker as a `std::process::Child` with piped stdio.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    grace_period: Duration,
}

impl CommandEngine {
    pub fn new() -> Self {
        Self {
            grace_period: Duration::from_secs(1),
        }
    }

    /// How long `close` waits for the process to exit after closing stdin.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

impl Default for CommandEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessEngine for CommandEngine {
    type Session = ChildSession;

    fn start_session(&self, spec: &LaunchSpec) -> std::result::Result<ChildSession, BoxError> {
        spec.validate()?;
        let mut child = spec.to_command().spawn()?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(BufReader::new);
        let stderr = child.stderr.take();
        tracing::debug!(pid = child.id(), program = ?spec.program(), "spawned worker process");
        Ok(ChildSession {
            pid: child.id(),
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(stdout),
            stderr: Mutex::new(stderr),
            grace_period: self.grace_period,
            destroy_process_tree: spec.destroys_process_tree(),
            closed: AtomicBool::new(false),
        })
    }
}

// ---------------------------------------------------------------------------
// ChildSession
// ---------------------------------------------------------------------------

/// Session backed by a spawned child process.
pub struct ChildSession {
    pid: u32,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<BufReader<ChildStdout>>>,
    stderr: Mutex<Option<ChildStderr>>,
    grace_period: Duration,
    destroy_process_tree: bool,
    closed: AtomicBool,
}

impl ChildSession {
    pub fn id(&self) -> u32 {
        self.pid
    }

    /// Run `f` with exclusive access to the child's stdin.
    pub fn with_stdin<R>(&self, f: impl FnOnce(&mut ChildStdin) -> io::Result<R>) -> io::Result<R> {
        let mut stdin = self.stdin.lock();
        let stdin = stdin.as_mut().ok_or_else(closed_pipe)?;
        f(stdin)
    }

    /// Run `f` with exclusive access to the child's buffered stdout.
    pub fn with_stdout<R>(
        &self,
        f: impl FnOnce(&mut BufReader<ChildStdout>) -> io::Result<R>,
    ) -> io::Result<R> {
        let mut stdout = self.stdout.lock();
        let stdout = stdout.as_mut().ok_or_else(closed_pipe)?;
        f(stdout)
    }

    /// Write `line` plus a newline and flush.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        self.with_stdin(|stdin| {
            stdin.write_all(line.as_bytes())?;
            stdin.write_all(b"\n")?;
            stdin.flush()
        })
    }

    /// Read one line from stdout without the trailing newline.
    pub fn read_line(&self) -> io::Result<String> {
        self.with_stdout(|stdout| {
            let mut line = String::new();
            if stdout.read_line(&mut line)? == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "worker closed stdout"));
            }
            let trimmed = line.trim_end_matches(['\n', '\r']).len();
            line.truncate(trimmed);
            Ok(line)
        })
    }

    /// Detach stderr so the caller can drain it.
    pub fn take_stderr(&self) -> Option<ChildStderr> {
        self.stderr.lock().take()
    }

    fn wait_for_exit(&self, budget: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + budget;
        loop {
            if self.child.lock().try_wait()?.is_some() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    fn kill(&self) -> io::Result<()> {
        #[cfg(unix)]
        if self.destroy_process_tree {
            return kill_process_group(self.pid);
        }
        match self.child.lock().kill() {
            // Already exited.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }
}

impl Session for ChildSession {
    fn close(&self) -> std::result::Result<(), BoxError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // EOF on stdin asks a well-behaved worker to exit on its own. A writer
        // blocked on a full pipe keeps the lock; killing the worker frees it.
        match self.stdin.try_lock_for(STDIN_RELEASE_WAIT) {
            Some(mut stdin) => {
                drop(stdin.take());
                if !self.wait_for_exit(self.grace_period)? {
                    tracing::debug!(pid = self.pid, "worker ignored stdin close, killing");
                    self.kill()?;
                }
            }
            None => {
                tracing::debug!(pid = self.pid, "worker stdin is busy, killing");
                self.kill()?;
            }
        }
        self.child.lock().wait()?;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && matches!(self.child.lock().try_wait(), Ok(None))
    }
}

impl Drop for ChildSession {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(error) = self.kill().and_then(|()| self.child.lock().wait().map(drop)) {
            tracing::debug!(pid = self.pid, error = %error, "failed to reap dropped worker");
        }
    }
}

impl fmt::Debug for ChildSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildSession")
            .field("pid", &self.pid)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "worker pipe is closed")
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_process_group(pid: u32) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions. The child was
    // spawned with process_group(0), so its pid is also its group id.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let error = io::Error::last_os_error();
    if error.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(error)
}
