//! The system call surface the init is built on.
//!
//! Boot and shutdown logic only talks to the kernel through [`System`], so
//! the sequencing can be driven against a scripted implementation. [`Linux`]
//! is the real one.

use crate::error::{Error, Result};
use crate::mount::MountFlags;
use crate::process::ChildState;
use crate::service::ServiceSpec;
use crate::shutdown::ShutdownType;
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::reboot::{reboot, RebootMode};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{ForkResult, Pid};
use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

// include/uapi/linux/loop.h
const LOOP_SET_FD: u32 = 0x4C00;
const LOOP_CLR_FD: u32 = 0x4C01;
const LOOP_CTL_GET_FREE: u32 = 0x4C82;

/// Kernel operations used by the init.
///
/// Every call reports failure through [`Error`]; callers decide on the spot
/// whether that failure is fatal or only worth a warning.
pub trait System {
    /// An open file descriptor.
    type File;

    /// Open a device or file read-write.
    fn open(&self, path: &Path) -> Result<Self::File>;

    /// Ask the loop-control device for a free loop index.
    fn loop_get_free(&self, control: &Self::File) -> Result<u32>;

    /// Bind a backing file to a loop device.
    fn loop_attach(&self, device: &Self::File, image: &Self::File) -> Result<()>;

    /// Release the backing file of a loop device.
    fn loop_detach(&self, device: &Self::File) -> Result<()>;

    /// Create a single directory. An existing directory is not an error.
    fn mkdir(&self, path: &Path, mode: u32) -> Result<()>;

    /// Mount `source` on `target`.
    fn mount(&self, source: &str, target: &Path, fstype: Option<&str>, flags: MountFlags) -> Result<()>;

    /// Unmount `target`.
    fn unmount(&self, target: &Path, force: bool, detach: bool) -> Result<()>;

    /// Create `link` pointing at `original`.
    fn symlink(&self, original: &Path, link: &Path) -> Result<()>;

    /// Change root to `root` and move into it.
    fn chroot(&self, root: &Path) -> Result<()>;

    /// Write `contents` into an existing file.
    fn write_file(&self, path: &Path, contents: &str) -> Result<()>;

    /// Fork the calling process.
    fn fork(&self) -> Result<ForkResult>;

    /// Start a program in a new process.
    ///
    /// A failed exec is reported here, in the caller, so the half-started
    /// child never runs any of the caller's code.
    fn spawn(&self, spec: &ServiceSpec) -> Result<Pid>;

    /// Replace the current process image. Only returns on failure.
    fn exec(&self, spec: &ServiceSpec) -> Error;

    /// Block until `pid` terminates.
    fn wait_pid(&self, pid: Pid) -> Result<ChildState>;

    /// Block until any child terminates. `None` once there are no children left.
    fn wait_any(&self) -> Result<Option<(Pid, ChildState)>>;

    /// Send `signal` to every process we are allowed to signal.
    fn kill_all(&self, signal: Signal) -> Result<()>;

    /// Flush filesystem buffers.
    fn sync(&self);

    /// Give up the CPU once.
    fn yield_now(&self);

    /// Ask the kernel to reboot or power off.
    fn reboot(&self, action: ShutdownType) -> Result<()>;

    /// Stop making progress, forever.
    fn halt(&self) -> !;
}

/// The real kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct Linux;

impl Linux {
    fn command(spec: &ServiceSpec) -> Command {
        let mut cmd = Command::new(&spec.path);
        cmd.arg0(spec.argv0());
        cmd.args(&spec.args);

        cmd.env_clear();
        cmd.envs(spec.env_pairs());

        // Terminals and daemons write straight to the console
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        if spec.session_leader {
            unsafe {
                cmd.pre_exec(|| {
                    nix::unistd::setsid()
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                    Ok(())
                });
            }
        }

        cmd
    }

    fn ioctl(fd: &File, request: u32, arg: libc::c_ulong) -> Result<libc::c_int> {
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), request as _, arg) };
        if rc < 0 {
            return Err(Error::Nix(Errno::last()));
        }
        Ok(rc)
    }
}

impl System for Linux {
    type File = File;

    fn open(&self, path: &Path) -> Result<File> {
        Ok(OpenOptions::new().read(true).write(true).open(path)?)
    }

    fn loop_get_free(&self, control: &File) -> Result<u32> {
        let index = Self::ioctl(control, LOOP_CTL_GET_FREE, 0)?;
        Ok(index as u32)
    }

    fn loop_attach(&self, device: &File, image: &File) -> Result<()> {
        Self::ioctl(device, LOOP_SET_FD, image.as_raw_fd() as libc::c_ulong)?;
        Ok(())
    }

    fn loop_detach(&self, device: &File) -> Result<()> {
        Self::ioctl(device, LOOP_CLR_FD, 0)?;
        Ok(())
    }

    fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        match DirBuilder::new().mode(mode).create(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn mount(&self, source: &str, target: &Path, fstype: Option<&str>, flags: MountFlags) -> Result<()> {
        let flags = match flags {
            MountFlags::None => MsFlags::empty(),
            MountFlags::ReadOnly => MsFlags::MS_RDONLY,
            MountFlags::Bind => MsFlags::MS_BIND,
        };
        mount(Some(source), target, fstype, flags, None::<&str>)?;
        Ok(())
    }

    fn unmount(&self, target: &Path, force: bool, detach: bool) -> Result<()> {
        let mut flags = MntFlags::empty();
        if force {
            flags |= MntFlags::MNT_FORCE;
        }
        if detach {
            flags |= MntFlags::MNT_DETACH;
        }
        umount2(target, flags)?;
        Ok(())
    }

    fn symlink(&self, original: &Path, link: &Path) -> Result<()> {
        std::os::unix::fs::symlink(original, link)?;
        Ok(())
    }

    fn chroot(&self, root: &Path) -> Result<()> {
        nix::unistd::chroot(root)?;
        std::env::set_current_dir("/")?;
        Ok(())
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }

    fn fork(&self) -> Result<ForkResult> {
        // The init never starts threads, so the child may run arbitrary code.
        let result = unsafe { nix::unistd::fork() }?;
        Ok(result)
    }

    fn spawn(&self, spec: &ServiceSpec) -> Result<Pid> {
        let child = Self::command(spec)
            .spawn()
            .map_err(|e| Error::ProcessSpawnFailed(format!("{}: {}", spec.path.display(), e)))?;

        // Reaped with waitpid, not through the std handle
        Ok(Pid::from_raw(child.id() as i32))
    }

    fn exec(&self, spec: &ServiceSpec) -> Error {
        let e = Self::command(spec).exec();
        Error::ExecFailed {
            path: spec.path.clone(),
            reason: e.to_string(),
        }
    }

    fn wait_pid(&self, pid: Pid) -> Result<ChildState> {
        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(ChildState::Exited(code)),
                Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(ChildState::Killed(sig)),
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn wait_any(&self) -> Result<Option<(Pid, ChildState)>> {
        loop {
            match waitpid(Pid::from_raw(-1), None) {
                Ok(WaitStatus::Exited(pid, code)) => return Ok(Some((pid, ChildState::Exited(code)))),
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    return Ok(Some((pid, ChildState::Killed(sig))))
                }
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn kill_all(&self, sig: Signal) -> Result<()> {
        signal::kill(Pid::from_raw(-1), sig)?;
        Ok(())
    }

    fn sync(&self) {
        nix::unistd::sync();
    }

    fn yield_now(&self) {
        if let Err(e) = nix::sched::sched_yield() {
            debug!(error = %e, "sched_yield failed");
        }
    }

    fn reboot(&self, action: ShutdownType) -> Result<()> {
        let mode = match action {
            ShutdownType::Reboot => RebootMode::RB_AUTOBOOT,
            ShutdownType::PowerOff => RebootMode::RB_POWER_OFF,
            ShutdownType::Halt => RebootMode::RB_HALT_SYSTEM,
        };
        match reboot(mode) {
            Ok(never) => match never {},
            Err(e) => Err(Error::RebootFailed(e.to_string())),
        }
    }

    fn halt(&self) -> ! {
        loop {
            nix::unistd::pause();
        }
    }
}
