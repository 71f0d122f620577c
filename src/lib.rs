//! Buckos micro init - a minimal PID 1 for appliance images.
//!
//! This crate is an init for devices whose root is read-only or lives in a
//! loop-mounted image. It does the least a userspace needs and nothing more:
//!
//! - Mounts the pseudo-filesystems and tmpfs trees, in table order
//! - Optionally loop-mounts a root image and changes root into it
//! - Runs one-shot configuration programs in order
//! - Supervises a fixed set of daemons and login terminals
//! - Hands the console to an interactive shell
//! - Kills, reaps, unmounts and reboots once that shell exits
//!
//! # Architecture
//!
//! - **System**: the kernel interface every other component goes through
//! - **Mounter**: required and optional mounts, symlinks, the root image
//! - **Supervisor**: one-shot and supervised fork/exec/wait launchers
//! - **Registry**: the ordered table of tasks and services
//! - **Init**: the boot sequencer, split into init and supervisor roles
//! - **Shutdown**: the teardown sequence
//!
//! Failures are either warnings, after which boot continues, or fatal, in
//! which case the process prints one diagnostic and blocks forever.
//!
//! # Example
//!
//! ```no_run
//! use buckos_microinit::{Config, Init, Linux};
//!
//! fn main() -> anyhow::Result<()> {
//!     let init = Init::new(Config::load(None)?, Linux)?;
//!     init.run()
//! }
//! ```

pub mod config;
pub mod console;
pub mod error;
pub mod init;
pub mod loopdev;
pub mod mount;
pub mod process;
pub mod service;
pub mod shutdown;
pub mod syscall;

// Re-export main types
pub use config::{Config, ShellConfig, Terminals, DEFAULT_CONFIG_PATH};
pub use error::{Error, Result};
pub use init::{BootPhase, Init};
pub use loopdev::{LoopBinding, RootImage};
pub use mount::{MountFlags, MountSpec, Mounter, Severity, SymlinkSpec};
pub use process::{ChildProcess, ChildState, Supervisor, SupervisorExit};
pub use service::{Registry, RestartPolicy, ServiceSpec, Task};
pub use shutdown::{Shutdown, ShutdownConfig, ShutdownType};
pub use syscall::{Linux, System};
