//! Managed process lifecycle.
//!
//! A [`ManagedProcess`] owns at most one running child at a time and moves
//! through `NotStarted → Running → Stopped`. Teardown never fails: `stop()`
//! reports what happened through [`StopOutcome`] and the event sink instead of
//! returning an error, so it is safe to call from failure paths and from
//! `Drop` during unwinding.

use crate::{execute, terminate};
use prox_common::{HarnessError, HarnessResult, ProcessExit, ProcessSpec, SharedSink};
use std::fmt;
use std::process::Child;
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

/// Default time a process gets to exit after SIGTERM before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on waiting for a killed process to be reaped.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of a [`ManagedProcess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagedProcessState {
    NotStarted,
    Running,
    Stopped,
}

impl fmt::Display for ManagedProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagedProcessState::NotStarted => write!(f, "not_started"),
            ManagedProcessState::Running => write!(f, "running"),
            ManagedProcessState::Stopped => write!(f, "stopped"),
        }
    }
}

/// What `stop()` actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running (never started, or already stopped).
    NotRunning,
    /// The process had already exited on its own.
    AlreadyExited(ProcessExit),
    /// The process exited within the grace period after SIGTERM.
    Terminated(ProcessExit),
    /// The process had to be killed.
    Killed(ProcessExit),
    /// Kill was sent but the process could not be reaped in time.
    Abandoned,
}

/// A running (or exited, not yet reaped) child process.
///
/// The exit status slot is filled exactly once, the first time the exit is
/// observed. Handles are owned by whoever spawned them and are never shared.
pub struct ProcessHandle {
    name: String,
    pid: u32,
    child: Child,
    exit: Option<ProcessExit>,
    started_at: Instant,
}

impl ProcessHandle {
    fn new(name: &str, child: Child) -> Self {
        Self {
            name: name.to_string(),
            pid: child.id(),
            child,
            exit: None,
            started_at: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Exit status, if the exit has been observed.
    pub fn exit(&self) -> Option<ProcessExit> {
        self.exit
    }

    fn record_exit(&mut self, status: std::process::ExitStatus) -> ProcessExit {
        *self.exit.get_or_insert_with(|| ProcessExit::from(status))
    }

    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> HarnessResult<Option<ProcessExit>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        match self.child.try_wait() {
            Ok(Some(status)) => Ok(Some(self.record_exit(status))),
            Ok(None) => Ok(None),
            Err(e) => Err(HarnessError::from_io(&self.name, &e)),
        }
    }

    /// Wait up to `timeout` for the process to exit.
    pub fn wait_timeout(&mut self, timeout: Duration) -> HarnessResult<Option<ProcessExit>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        match self.child.wait_timeout(timeout) {
            Ok(Some(status)) => Ok(Some(self.record_exit(status))),
            Ok(None) => Ok(None),
            Err(e) => Err(HarnessError::from_io(&self.name, &e)),
        }
    }

    /// Block until the process exits.
    pub fn wait(&mut self) -> HarnessResult<ProcessExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let status = self
            .child
            .wait()
            .map_err(|e| HarnessError::from_io(&self.name, &e))?;
        Ok(self.record_exit(status))
    }

    fn kill(&mut self) -> HarnessResult<()> {
        terminate::force_kill(&mut self.child)
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("exit", &self.exit)
            .finish()
    }
}

/// The seam a scenario uses to control the proxy under test.
pub trait ProxyProcess {
    /// Launch the process; returns its PID.
    fn start(&mut self, spec: &ProcessSpec) -> HarnessResult<u32>;

    /// Tear the process down. Must be idempotent and must not panic.
    fn stop(&mut self) -> StopOutcome;
}

/// Owns the lifetime of one externally spawned process.
pub struct ManagedProcess {
    name: String,
    state: ManagedProcessState,
    handle: Option<ProcessHandle>,
    stop_grace: Duration,
    sink: SharedSink,
}

impl ManagedProcess {
    pub fn new(name: impl Into<String>, sink: SharedSink) -> Self {
        Self {
            name: name.into(),
            state: ManagedProcessState::NotStarted,
            handle: None,
            stop_grace: DEFAULT_STOP_GRACE,
            sink,
        }
    }

    /// Time between SIGTERM and SIGKILL. Zero kills immediately.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ManagedProcessState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(ProcessHandle::pid)
    }

    pub fn handle(&self) -> Option<&ProcessHandle> {
        self.handle.as_ref()
    }

    /// Spawn the process. Fails if this instance is already running one.
    pub fn start(&mut self, spec: &ProcessSpec) -> HarnessResult<&ProcessHandle> {
        if self.state == ManagedProcessState::Running {
            return Err(HarnessError::invalid_state(
                &self.name,
                "not_started or stopped",
                self.state.to_string(),
            ));
        }

        self.sink.info(
            "process_starting",
            &format!("{}: {}", self.name, spec.command_line()),
        );

        let child = match execute::spawn(spec) {
            Ok(child) => child,
            Err(e) => {
                self.sink.error("process_spawn_failed", &format!("{}: {}", self.name, e));
                return Err(e);
            }
        };

        let handle = ProcessHandle::new(&self.name, child);
        self.sink.info(
            "process_started",
            &format!("{} started with PID {}", self.name, handle.pid()),
        );
        self.state = ManagedProcessState::Running;
        let handle = self.handle.insert(handle);
        Ok(&*handle)
    }

    /// Non-blocking check whether the process exited on its own.
    pub fn try_exit(&mut self) -> Option<ProcessExit> {
        let handle = self.handle.as_mut()?;
        match handle.try_wait() {
            Ok(exit) => exit,
            Err(e) => {
                self.sink.warn("process_wait_failed", &format!("{}: {}", self.name, e));
                None
            }
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.state == ManagedProcessState::Running && self.try_exit().is_none()
    }

    /// Stop the process: SIGTERM, bounded grace period, then SIGKILL.
    ///
    /// Idempotent; calling it on a process that was never started or is
    /// already stopped returns [`StopOutcome::NotRunning`].
    pub fn stop(&mut self) -> StopOutcome {
        let Some(mut handle) = self.handle.take() else {
            return StopOutcome::NotRunning;
        };
        self.state = ManagedProcessState::Stopped;
        let pid = handle.pid();

        let outcome = self.stop_handle(&mut handle);
        match outcome {
            StopOutcome::AlreadyExited(exit) => self.sink.warn(
                "process_already_exited",
                &format!("{} (PID {}) had already exited: {}", self.name, pid, exit),
            ),
            StopOutcome::Terminated(exit) => self.sink.info(
                "process_stopped",
                &format!("{} (PID {}) terminated: {}", self.name, pid, exit),
            ),
            StopOutcome::Killed(exit) => self.sink.warn(
                "process_killed",
                &format!("{} (PID {}) killed: {}", self.name, pid, exit),
            ),
            StopOutcome::Abandoned => self.sink.error(
                "process_abandoned",
                &format!("{} (PID {}) could not be reaped after kill", self.name, pid),
            ),
            StopOutcome::NotRunning => {}
        }
        outcome
    }

    fn stop_handle(&self, handle: &mut ProcessHandle) -> StopOutcome {
        match handle.try_wait() {
            Ok(Some(exit)) => return StopOutcome::AlreadyExited(exit),
            Ok(None) => {}
            Err(e) => self.sink.warn("process_wait_failed", &format!("{}: {}", self.name, e)),
        }

        if !self.stop_grace.is_zero() {
            if let Err(e) = terminate::terminate_gracefully(handle.pid()) {
                self.sink.warn("process_signal_failed", &format!("{}: {}", self.name, e));
            }
            match handle.wait_timeout(self.stop_grace) {
                Ok(Some(exit)) => return StopOutcome::Terminated(exit),
                Ok(None) => self.sink.debug(
                    "process_grace_expired",
                    &format!("{} did not exit within {:?}, killing", self.name, self.stop_grace),
                ),
                Err(e) => self.sink.warn("process_wait_failed", &format!("{}: {}", self.name, e)),
            }
        }

        if let Err(e) = handle.kill() {
            self.sink.warn("process_kill_failed", &format!("{}: {}", self.name, e));
        }
        match handle.wait_timeout(KILL_REAP_TIMEOUT) {
            Ok(Some(exit)) => StopOutcome::Killed(exit),
            _ => StopOutcome::Abandoned,
        }
    }
}

impl ProxyProcess for ManagedProcess {
    fn start(&mut self, spec: &ProcessSpec) -> HarnessResult<u32> {
        ManagedProcess::start(self, spec).map(ProcessHandle::pid)
    }

    fn stop(&mut self) -> StopOutcome {
        ManagedProcess::stop(self)
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.sink.debug("process_drop_cleanup", &self.name);
            self.stop();
        }
    }
}

/// Pairs a started process with its guaranteed release.
///
/// `release()` stops the process once; if the guard is dropped without being
/// released (early return, `?`, panic) the process is stopped in `Drop`.
pub struct ProcessGuard<'a, P: ProxyProcess + ?Sized> {
    process: &'a mut P,
    released: bool,
}

impl<'a, P: ProxyProcess + ?Sized> ProcessGuard<'a, P> {
    /// Start `process` from `spec` and guard it. On spawn failure nothing is
    /// guarded and no stop is issued.
    pub fn start(process: &'a mut P, spec: &ProcessSpec) -> HarnessResult<(Self, u32)> {
        let pid = process.start(spec)?;
        Ok((
            Self {
                process,
                released: false,
            },
            pid,
        ))
    }

    /// Stop the guarded process now.
    pub fn release(mut self) -> StopOutcome {
        self.released = true;
        self.process.stop()
    }
}

impl<P: ProxyProcess + ?Sized> Drop for ProcessGuard<'_, P> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.process.stop();
        }
    }
}
