//! Testing utilities: an in-memory process engine.
//!
//! [`ScriptedEngine`] never spawns a process. Each session echoes commands
//! back, and the engine records launches and closes and can be told to fail
//! launches or close calls.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::engine::{LaunchSpec, ProcessEngine, Session};
use crate::error::BoxError;

/// Error returned by scripted failures.
#[derive(Debug, thiserror::Error)]
#[error("scripted failure: {0}")]
pub struct ScriptedFailure(pub String);

#[derive(Default)]
struct Script {
    next_serial: AtomicU64,
    launches: AtomicUsize,
    fail_launches: AtomicUsize,
    fail_all_launches: AtomicBool,
    fail_closes: AtomicBool,
    launch_delay: Mutex<Duration>,
    closed: Mutex<Vec<u64>>,
    launched_programs: Mutex<Vec<String>>,
}

/// In-memory [`ProcessEngine`]. Clones share the same script and records.
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    script: Arc<Script>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` launch attempts.
    pub fn fail_next_launches(&self, count: usize) {
        self.script.fail_launches.store(count, Ordering::SeqCst);
    }

    /// Fail every launch until switched off.
    pub fn fail_all_launches(&self, enabled: bool) {
        self.script.fail_all_launches.store(enabled, Ordering::SeqCst);
    }

    /// Make `Session::close` return an error (the session still counts as closed).
    pub fn fail_closes(&self, enabled: bool) {
        self.script.fail_closes.store(enabled, Ordering::SeqCst);
    }

    /// Sleep this long inside every launch.
    pub fn set_launch_delay(&self, delay: Duration) {
        *self.script.launch_delay.lock() = delay;
    }

    /// Launch attempts so far, failed ones included.
    pub fn launches(&self) -> usize {
        self.script.launches.load(Ordering::SeqCst)
    }

    /// Serials of sessions closed so far, in close order.
    pub fn closed_sessions(&self) -> Vec<u64> {
        self.script.closed.lock().clone()
    }

    /// Sessions started and not yet closed.
    pub fn live_sessions(&self) -> usize {
        let started = self.script.next_serial.load(Ordering::SeqCst) as usize;
        started - self.script.closed.lock().len()
    }

    pub fn launched_programs(&self) -> Vec<String> {
        self.script.launched_programs.lock().clone()
    }
}

impl fmt::Debug for ScriptedEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedEngine")
            .field("launches", &self.launches())
            .field("live_sessions", &self.live_sessions())
            .finish()
    }
}

impl ProcessEngine for ScriptedEngine {
    type Session = ScriptedSession;

    fn start_session(&self, spec: &LaunchSpec) -> Result<ScriptedSession, BoxError> {
        let script = &self.script;
        script.launches.fetch_add(1, Ordering::SeqCst);

        let delay = *script.launch_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if script.fail_all_launches.load(Ordering::SeqCst) {
            return Err(ScriptedFailure("launch refused".to_string()).into());
        }
        let consumed = script
            .fail_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(ScriptedFailure("launch refused".to_string()).into());
        }

        script
            .launched_programs
            .lock()
            .push(spec.program().to_string_lossy().into_owned());
        let serial = script.next_serial.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ScriptedSession {
            serial,
            script: Arc::clone(script),
            alive: AtomicBool::new(true),
            commands: Mutex::new(Vec::new()),
        })
    }
}

/// Session produced by [`ScriptedEngine`].
pub struct ScriptedSession {
    serial: u64,
    script: Arc<Script>,
    alive: AtomicBool,
    commands: Mutex<Vec<String>>,
}

impl ScriptedSession {
    /// Launch order of this session, starting at 1.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Record `command` and echo it back.
    pub fn execute(&self, command: &str) -> Result<String, BoxError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ScriptedFailure("session is closed".to_string()).into());
        }
        self.commands.lock().push(command.to_string());
        Ok(command.to_string())
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

impl Session for ScriptedSession {
    fn close(&self) -> Result<(), BoxError> {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.script.closed.lock().push(self.serial);
        if self.script.fail_closes.load(Ordering::SeqCst) {
            return Err(ScriptedFailure("close failed".to_string()).into());
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ScriptedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedSession")
            .field("serial", &self.serial)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_failures_are_consumed_in_order() {
        let engine = ScriptedEngine::new();
        let spec = LaunchSpec::new("worker");
        engine.fail_next_launches(2);

        assert!(engine.start_session(&spec).is_err());
        assert!(engine.start_session(&spec).is_err());
        let session = engine.start_session(&spec).expect("third launch succeeds");
        assert_eq!(session.serial(), 1);
        assert_eq!(engine.launches(), 3);
        assert_eq!(engine.live_sessions(), 1);
        assert_eq!(engine.launched_programs(), vec!["worker".to_string()]);
    }

    #[test]
    fn close_is_recorded_once() {
        let engine = ScriptedEngine::new();
        let session = engine.start_session(&LaunchSpec::new("worker")).unwrap();
        assert_eq!(session.execute("hello").unwrap(), "hello");

        session.close().unwrap();
        session.close().unwrap();
        assert!(!session.is_alive());
        assert!(session.execute("again").is_err());
        assert_eq!(engine.closed_sessions(), vec![1]);
        assert_eq!(engine.live_sessions(), 0);
        assert_eq!(session.commands(), vec!["hello".to_string()]);
    }
}
