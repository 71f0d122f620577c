//! Process supervision primitives.
//!
//! Two ways to launch a program: [`Supervisor::run_once`] blocks until a
//! one-shot program exits, and [`Supervisor::start`] forks a dedicated
//! supervising process that keeps a service alive under its restart policy.

use crate::console;
use crate::error::{Error, Result};
use crate::service::{RestartPolicy, ServiceSpec};
use crate::syscall::System;
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use nix::unistd::{ForkResult, Pid};
use tracing::{debug, info};

/// Last observed state of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// Spawned and not yet reaped
    Running,
    /// Exited normally with a status code
    Exited(i32),
    /// Terminated by a signal
    Killed(Signal),
}

impl ChildState {
    /// Check if the process exited successfully.
    pub fn success(&self) -> bool {
        matches!(self, ChildState::Exited(0))
    }

    /// Normal exit carrying the program's own error status.
    pub fn is_error_exit(&self) -> bool {
        matches!(self, ChildState::Exited(code) if *code != 0)
    }
}

impl std::fmt::Display for ChildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChildState::Running => write!(f, "running"),
            ChildState::Exited(code) => write!(f, "exited with status {}", code),
            ChildState::Killed(sig) => write!(f, "killed by {}", sig),
        }
    }
}

/// A spawned program owned by the supervisor until it is reaped.
#[derive(Debug, Clone)]
pub struct ChildProcess {
    /// Process ID
    pub pid: Pid,
    /// Service this process belongs to
    pub service: String,
    /// Last observed state
    pub state: ChildState,
    /// When the process was spawned
    pub started_at: DateTime<Utc>,
}

impl ChildProcess {
    fn new(pid: Pid, service: &ServiceSpec) -> Self {
        Self {
            pid,
            service: service.name.clone(),
            state: ChildState::Running,
            started_at: Utc::now(),
        }
    }

    /// Seconds since the process was spawned.
    pub fn uptime_secs(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.started_at)
            .num_seconds()
            .max(0)
    }
}

/// Why a supervision loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    /// The policy decided the service is permanently broken
    Stopped { restarts: u32, last: ChildState },
    /// Waiting on the child failed; supervision was abandoned
    Abandoned { restarts: u32, reason: String },
    /// The program could not be spawned at all
    SpawnFailed { restarts: u32, reason: String },
}

impl SupervisorExit {
    /// Number of times the service was restarted before the loop ended.
    pub fn restarts(&self) -> u32 {
        match self {
            SupervisorExit::Stopped { restarts, .. }
            | SupervisorExit::Abandoned { restarts, .. }
            | SupervisorExit::SpawnFailed { restarts, .. } => *restarts,
        }
    }
}

/// Fork/exec/wait based launcher.
pub struct Supervisor<'a, S: System> {
    sys: &'a S,
}

impl<'a, S: System> Supervisor<'a, S> {
    /// Create a supervisor over a system interface.
    pub fn new(sys: &'a S) -> Self {
        Self { sys }
    }

    /// Run a program to completion.
    ///
    /// Failures are only diagnostics: the result is returned for logging and
    /// boot continues either way.
    pub fn run_once(&self, spec: &ServiceSpec) -> Option<ChildState> {
        let pid = match self.sys.spawn(spec) {
            Ok(pid) => pid,
            Err(e) => {
                console::warning(&spec.name, format_args!("Spawn error: {}", e));
                return None;
            }
        };
        debug!(service = %spec.name, pid = pid.as_raw(), "Spawned one-shot process");

        let state = match self.sys.wait_pid(pid) {
            Ok(state) => state,
            Err(e) => {
                console::warning(&spec.name, format_args!("Waitpid error: {}", e));
                return None;
            }
        };

        if !state.success() {
            console::warning(&spec.name, format_args!("Exited with an error ({})", state));
        }

        Some(state)
    }

    /// Keep a service running until its policy says otherwise.
    ///
    /// Restarts are immediate with no backoff and no cap. The loop only ends
    /// when the policy stops the service or the process can no longer be
    /// spawned or waited on.
    pub fn supervise(&self, spec: &ServiceSpec) -> SupervisorExit {
        let mut restarts = 0u32;

        loop {
            let pid = match self.sys.spawn(spec) {
                Ok(pid) => pid,
                Err(e) => {
                    console::warning(&spec.name, format_args!("Spawn error: {}", e));
                    return SupervisorExit::SpawnFailed {
                        restarts,
                        reason: e.to_string(),
                    };
                }
            };

            let mut child = ChildProcess::new(pid, spec);
            info!(service = %spec.name, pid = pid.as_raw(), "Started service");

            child.state = match self.sys.wait_pid(pid) {
                Ok(state) => state,
                Err(e) => {
                    console::warning(&spec.name, format_args!("Waitpid error: {}", e));
                    return SupervisorExit::Abandoned {
                        restarts,
                        reason: e.to_string(),
                    };
                }
            };

            if !spec.restart.should_restart(&child.state) {
                console::warning(
                    &spec.name,
                    format_args!("{} after {}s; not restarting", child.state, child.uptime_secs()),
                );
                return SupervisorExit::Stopped {
                    restarts,
                    last: child.state,
                };
            }

            console::warning(
                &spec.name,
                format_args!("{} after {}s; restarting...", child.state, child.uptime_secs()),
            );
            restarts += 1;
        }
    }

    /// Start a supervised service in its own process and return immediately.
    ///
    /// The forked supervisor never comes back: whatever ends its loop, it
    /// halts rather than falling through into the caller's boot logic.
    pub fn start(&self, spec: &ServiceSpec) -> Result<()> {
        debug_assert!(spec.restart != RestartPolicy::OneShot);

        match self.sys.fork() {
            Ok(ForkResult::Child) => {
                let exit = self.supervise(spec);
                info!(service = %spec.name, restarts = exit.restarts(), "Supervision ended");
                self.sys.halt()
            }
            Ok(ForkResult::Parent { child }) => {
                debug!(service = %spec.name, supervisor = child.as_raw(), "Forked supervisor");
                Ok(())
            }
            Err(e) if spec.critical => Err(Error::ForkFailed {
                name: spec.name.clone(),
                reason: e.to_string(),
            }),
            Err(e) => {
                console::warning(&spec.name, format_args!("Fork error: {}", e));
                Ok(())
            }
        }
    }
}
