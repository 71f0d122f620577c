//! Tearing the system down after the interactive shell exits.

use crate::console;
use crate::error::{Error, Result};
use crate::process::ChildState;
use crate::syscall::System;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

/// Terminal action once everything is unmounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownType {
    /// Power off the system
    PowerOff,
    /// Reboot the system
    #[default]
    Reboot,
    /// Announce it is safe to power off and stop there
    Halt,
}

impl std::str::FromStr for ShutdownType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "poweroff" | "power-off" => Ok(ShutdownType::PowerOff),
            "reboot" => Ok(ShutdownType::Reboot),
            "halt" => Ok(ShutdownType::Halt),
            other => Err(Error::ConfigError(format!("Unknown shutdown type: {}", other))),
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// What to do once the root is unmounted
    #[serde(default)]
    pub action: ShutdownType,
    /// Filesystem to unmount
    #[serde(default = "default_root")]
    pub unmount: PathBuf,
    /// Unmount with MNT_FORCE
    #[serde(default = "default_force")]
    pub force: bool,
    /// Unmount with MNT_DETACH so a still-busy mount is tolerated
    #[serde(default)]
    pub detach: bool,
}

fn default_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_force() -> bool {
    true
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            action: ShutdownType::default(),
            unmount: default_root(),
            force: default_force(),
            detach: false,
        }
    }
}

/// Runs the shutdown steps in order.
pub struct Shutdown<'a, S: System> {
    sys: &'a S,
    config: &'a ShutdownConfig,
}

impl<'a, S: System> Shutdown<'a, S> {
    /// Create a shutdown sequencer.
    pub fn new(sys: &'a S, config: &'a ShutdownConfig) -> Self {
        Self { sys, config }
    }

    /// Kill everything, reap everything, unmount, then reboot or power off.
    ///
    /// Returns `Ok` only for [`ShutdownType::Halt`] (and, in theory, if the
    /// kernel comes back from a reboot request); the caller then halts.
    pub fn run(&self) -> Result<()> {
        info!(action = ?self.config.action, "Initiating system shutdown");

        self.terminate_processes();
        let reaped = self.reap_all();
        debug!(count = reaped.len(), "All children reaped");

        self.unmount_root()?;

        match self.config.action {
            ShutdownType::Halt => {
                info!("System halted. It is now safe to power off.");
                Ok(())
            }
            action => {
                info!(action = ?action, "Requesting kernel shutdown");
                self.sys.reboot(action)
            }
        }
    }

    /// Send SIGKILL to every process so nothing holds a mount open.
    pub fn terminate_processes(&self) {
        info!("Terminating processes...");
        if let Err(e) = self.sys.kill_all(Signal::SIGKILL) {
            console::warning("shutdown", format_args!("kill(-1) failed: {}", e));
        }
    }

    /// Reap children until none are left.
    pub fn reap_all(&self) -> Vec<(Pid, ChildState)> {
        let mut reaped = Vec::new();
        loop {
            match self.sys.wait_any() {
                Ok(Some((pid, state))) => {
                    debug!(pid = pid.as_raw(), state = %state, "Reaped process");
                    reaped.push((pid, state));
                }
                Ok(None) => break,
                Err(e) => {
                    console::warning("shutdown", format_args!("Error reaping processes: {}", e));
                    break;
                }
            }
        }
        reaped
    }

    /// Flush and unmount the root. Failure is fatal to the caller.
    pub fn unmount_root(&self) -> Result<()> {
        info!(target = %self.config.unmount.display(), "Unmounting root...");
        self.sys.sync();
        self.sys
            .unmount(&self.config.unmount, self.config.force, self.config.detach)
            .map_err(|e| Error::UnmountFailed {
                target: self.config.unmount.clone(),
                reason: e.to_string(),
            })
    }
}
