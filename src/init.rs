//! Boot sequencer - PID 1 duties.
//!
//! PID 1 forks exactly once. The child (init role) mounts, configures,
//! starts the supervised services and finally becomes the interactive
//! shell. The parent (supervisor role) waits for that shell to exit and then
//! shuts the machine down.

use crate::config::Config;
use crate::console;
use crate::error::{Error, Result};
use crate::loopdev::{self, LoopBinding};
use crate::mount::Mounter;
use crate::process::{ChildState, Supervisor};
use crate::service::{Registry, Task};
use crate::shutdown::Shutdown;
use crate::syscall::System;
use nix::unistd::{ForkResult, Pid};
use std::cell::Cell;
use std::convert::Infallible;
use tracing::{debug, info};

/// Phases of a boot, in the only order they can happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootPhase {
    /// Mounting filesystems
    Mounting,
    /// Running one-shot configuration
    Configuring,
    /// Forking supervised services
    StartingServices,
    /// Handing over to the interactive shell
    Interactive,
    /// Killing, reaping and unmounting
    ShuttingDown,
    /// Rebooted, powered off or halted
    Terminal,
}

impl std::fmt::Display for BootPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootPhase::Mounting => write!(f, "mounting"),
            BootPhase::Configuring => write!(f, "configuring"),
            BootPhase::StartingServices => write!(f, "starting-services"),
            BootPhase::Interactive => write!(f, "interactive"),
            BootPhase::ShuttingDown => write!(f, "shutting-down"),
            BootPhase::Terminal => write!(f, "terminal"),
        }
    }
}

/// Check that we are PID 1 before doing anything irreversible.
pub fn require_pid1() -> Result<()> {
    let pid = std::process::id();
    if pid != 1 {
        return Err(Error::NotPid1(pid));
    }
    Ok(())
}

/// The init system.
pub struct Init<S: System> {
    /// Configuration
    config: Config,
    /// Ordered boot table
    registry: Registry,
    /// Kernel interface
    sys: S,
    /// Current phase of this process
    phase: Cell<BootPhase>,
}

impl<S: System> Init<S> {
    /// Create an init over a validated configuration.
    pub fn new(config: Config, sys: S) -> Result<Self> {
        config.validate()?;
        let registry = config.registry()?;

        Ok(Self {
            config,
            registry,
            sys,
            phase: Cell::new(BootPhase::Mounting),
        })
    }

    /// Boot the system. Never returns.
    pub fn run(&self) -> ! {
        info!("= = = Micro Init = = =");

        // Done before the fork so both roles see the new root. A chroot
        // after the fork would leave PID 1 on the real root.
        if let Err(e) = self.prepare_root() {
            self.fatal(&e);
        }

        match self.sys.fork() {
            Ok(ForkResult::Child) => self.init_role(),
            Ok(ForkResult::Parent { child }) => self.supervisor_role(child),
            Err(e) => self.fatal(&Error::ForkFailed {
                name: "init".to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Mount the root image and change root into it, if configured.
    pub fn prepare_root(&self) -> Result<Option<LoopBinding>> {
        match self.config.root_image {
            Some(ref root) => loopdev::enter_root_image(&self.sys, root).map(Some),
            None => Ok(None),
        }
    }

    /// Init role: bring the system up and become the shell. Never returns.
    pub fn init_role(&self) -> ! {
        match self.bring_up() {
            Ok(never) => match never {},
            Err(e) => self.fatal(&e),
        }
    }

    /// Mount, configure, start services, then exec the shell.
    ///
    /// Only returns on failure: success replaces this process image.
    pub fn bring_up(&self) -> Result<Infallible> {
        self.enter(BootPhase::Mounting);
        let mounter = Mounter::new(&self.sys);
        mounter.mount_all(&self.config.mounts)?;
        mounter.symlink_all(&self.config.symlinks)?;

        self.enter(BootPhase::Configuring);
        self.configure();

        self.enter(BootPhase::StartingServices);
        self.start_services()?;

        self.enter(BootPhase::Interactive);
        self.exec_shell()
    }

    /// Run every configuration task in table order, each to completion.
    pub fn configure(&self) {
        let supervisor = Supervisor::new(&self.sys);

        for task in self.registry.tasks() {
            debug!(task = %task.describe(), "Running configuration task");
            match task {
                Task::Run(spec) => {
                    supervisor.run_once(spec);
                }
                Task::Write { path, value } => {
                    if let Err(e) = self.sys.write_file(path, value) {
                        console::warning(
                            "sysctl",
                            format_args!("Failed to write [{}] to [{}]: {}", value, path.display(), e),
                        );
                    }
                }
                Task::Mkdir { path, mode } => {
                    if let Err(e) = self.sys.mkdir(path, *mode) {
                        console::warning(
                            "mkdir",
                            format_args!("Failed to create [{}]: {}", path.display(), e),
                        );
                    }
                }
                Task::Settle { yields } => {
                    for _ in 0..*yields {
                        self.sys.yield_now();
                    }
                }
            }
        }
    }

    /// Fork a supervisor for every service, in table order.
    pub fn start_services(&self) -> Result<()> {
        let supervisor = Supervisor::new(&self.sys);
        for spec in self.registry.services() {
            supervisor.start(spec)?;
        }
        Ok(())
    }

    fn exec_shell(&self) -> Result<Infallible> {
        if let Some(ref banner) = self.config.shell.banner {
            info!("{}", banner);
        }
        Err(self.sys.exec(&self.config.shell_spec()))
    }

    /// Supervisor role: wait for the shell, then shut down. Never returns.
    pub fn supervisor_role(&self, shell: Pid) -> ! {
        let state = self.await_shell(shell);
        info!(state = ?state, "Initial shell exited, entering shutdown sequence");

        self.enter(BootPhase::ShuttingDown);
        let result = Shutdown::new(&self.sys, &self.config.shutdown).run();

        self.enter(BootPhase::Terminal);
        match result {
            Ok(()) => self.sys.halt(),
            Err(e) => self.fatal(&e),
        }
    }

    /// Reap children until the shell is among them.
    ///
    /// Other children that exit in the meantime are reported rather than
    /// dropped silently. Returns `None` if the shell could not be observed,
    /// in which case shutdown proceeds anyway.
    pub fn await_shell(&self, shell: Pid) -> Option<ChildState> {
        loop {
            match self.sys.wait_any() {
                Ok(Some((pid, state))) if pid == shell => return Some(state),
                Ok(Some((pid, state))) => {
                    info!(pid = pid.as_raw(), state = %state, "Reaped process");
                }
                Ok(None) => {
                    console::warning("init", "No children left while waiting for the shell");
                    return None;
                }
                Err(e) => {
                    console::warning("init", format_args!("Wait error: {}", e));
                    return None;
                }
            }
        }
    }

    fn enter(&self, next: BootPhase) {
        let current = self.phase.get();
        debug_assert!(next >= current, "boot phase went backwards: {} -> {}", current, next);
        if next != current {
            debug!(from = %current, to = %next, "Entering boot phase");
        }
        self.phase.set(next.max(current));
    }

    fn fatal(&self, err: &Error) -> ! {
        console::fatal(&self.sys, err)
    }

    /// Current boot phase of this process.
    pub fn phase(&self) -> BootPhase {
        self.phase.get()
    }

    /// The configuration this init was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The ordered boot table.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The kernel interface.
    pub fn system(&self) -> &S {
        &self.sys
    }
}
