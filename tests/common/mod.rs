//! Scripted kernel used by the integration tests.
//!
//! Every call is recorded in order. Failures and child exits are scripted up
//! front; a halt unwinds with a [`Halted`] payload so tests can observe it.

#![allow(dead_code)]

use buckos_microinit::{ChildState, Error, MountFlags, Result, ServiceSpec, ShutdownType, System};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::{ForkResult, Pid};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

/// A recorded system call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open(PathBuf),
    LoopGetFree(PathBuf),
    LoopAttach { device: PathBuf, image: PathBuf },
    LoopDetach(PathBuf),
    Mkdir(PathBuf),
    Mount {
        source: String,
        target: PathBuf,
        fstype: Option<String>,
        flags: MountFlags,
    },
    Unmount {
        target: PathBuf,
        force: bool,
        detach: bool,
    },
    Symlink { original: PathBuf, link: PathBuf },
    Chroot(PathBuf),
    Write { path: PathBuf, contents: String },
    Fork,
    Spawn { name: String, pid: Pid },
    Exec(String),
    WaitPid(Pid),
    WaitAny,
    KillAll(Signal),
    Sync,
    Yield,
    Reboot(ShutdownType),
    Halt,
}

/// Panic payload raised by [`FakeSystem::halt`].
#[derive(Debug)]
pub struct Halted;

/// An "open" file: just the path it was opened from.
#[derive(Debug, Clone)]
pub struct FakeFile {
    pub path: PathBuf,
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    fail_open: HashSet<PathBuf>,
    fail_mount: HashSet<PathBuf>,
    fail_mkdir: HashSet<PathBuf>,
    fail_write: HashSet<PathBuf>,
    fail_spawn: HashSet<String>,
    fail_symlink: bool,
    fail_attach: bool,
    fail_fork: bool,
    fail_unmount: bool,
    free_loop: Option<u32>,
    forks: VecDeque<ForkResult>,
    exits: HashMap<String, VecDeque<ChildState>>,
    running: HashMap<Pid, String>,
    reap: VecDeque<(Pid, ChildState)>,
    next_pid: i32,
}

/// Scripted [`System`].
pub struct FakeSystem {
    state: RefCell<State>,
}

impl Default for FakeSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSystem {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State {
                next_pid: 100,
                ..State::default()
            }),
        }
    }

    pub fn fail_open(self, path: impl Into<PathBuf>) -> Self {
        self.state.borrow_mut().fail_open.insert(path.into());
        self
    }

    pub fn fail_mount(self, target: impl Into<PathBuf>) -> Self {
        self.state.borrow_mut().fail_mount.insert(target.into());
        self
    }

    pub fn fail_mkdir(self, path: impl Into<PathBuf>) -> Self {
        self.state.borrow_mut().fail_mkdir.insert(path.into());
        self
    }

    pub fn fail_write(self, path: impl Into<PathBuf>) -> Self {
        self.state.borrow_mut().fail_write.insert(path.into());
        self
    }

    pub fn fail_spawn(self, name: &str) -> Self {
        self.state.borrow_mut().fail_spawn.insert(name.to_string());
        self
    }

    pub fn fail_symlinks(self) -> Self {
        self.state.borrow_mut().fail_symlink = true;
        self
    }

    pub fn fail_attach(self) -> Self {
        self.state.borrow_mut().fail_attach = true;
        self
    }

    pub fn fail_fork(self) -> Self {
        self.state.borrow_mut().fail_fork = true;
        self
    }

    pub fn fail_unmount(self) -> Self {
        self.state.borrow_mut().fail_unmount = true;
        self
    }

    /// Index the loop-control device hands out.
    pub fn free_loop(self, index: u32) -> Self {
        self.state.borrow_mut().free_loop = Some(index);
        self
    }

    /// Make the next fork return in the child.
    pub fn fork_as_child(self) -> Self {
        self.state.borrow_mut().forks.push_back(ForkResult::Child);
        self
    }

    /// Make the next fork return in the parent with `child`.
    pub fn fork_as_parent(self, child: i32) -> Self {
        self.state.borrow_mut().forks.push_back(ForkResult::Parent {
            child: Pid::from_raw(child),
        });
        self
    }

    /// Successive terminations of the service `name`. Once they run out,
    /// waiting on it fails with ECHILD. Unscripted programs exit 0.
    pub fn exits<I>(self, name: &str, states: I) -> Self
    where
        I: IntoIterator<Item = ChildState>,
    {
        self.state
            .borrow_mut()
            .exits
            .insert(name.to_string(), states.into_iter().collect());
        self
    }

    /// A child for `wait_any` to report.
    pub fn reap(self, pid: i32, state: ChildState) -> Self {
        self.state
            .borrow_mut()
            .reap
            .push_back((Pid::from_raw(pid), state));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    /// Names of spawned programs, in order.
    pub fn spawned(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Spawn { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn mounted(&self) -> Vec<PathBuf> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Mount { target, .. } => Some(target),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| pred(call)).count()
    }

    pub fn position(&self, pred: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls().iter().position(pred)
    }

    pub fn halts(&self) -> usize {
        self.count(|call| *call == Call::Halt)
    }

    fn record(&self, call: Call) {
        self.state.borrow_mut().calls.push(call);
    }

    fn fail(errno: Errno) -> Error {
        Error::Nix(errno)
    }
}

impl System for FakeSystem {
    type File = FakeFile;

    fn open(&self, path: &Path) -> Result<FakeFile> {
        self.record(Call::Open(path.to_path_buf()));
        if self.state.borrow().fail_open.contains(path) {
            return Err(Self::fail(Errno::ENOENT));
        }
        Ok(FakeFile {
            path: path.to_path_buf(),
        })
    }

    fn loop_get_free(&self, control: &FakeFile) -> Result<u32> {
        self.record(Call::LoopGetFree(control.path.clone()));
        self.state
            .borrow()
            .free_loop
            .ok_or_else(|| Self::fail(Errno::ENODEV))
    }

    fn loop_attach(&self, device: &FakeFile, image: &FakeFile) -> Result<()> {
        self.record(Call::LoopAttach {
            device: device.path.clone(),
            image: image.path.clone(),
        });
        if self.state.borrow().fail_attach {
            return Err(Self::fail(Errno::EBUSY));
        }
        Ok(())
    }

    fn loop_detach(&self, device: &FakeFile) -> Result<()> {
        self.record(Call::LoopDetach(device.path.clone()));
        Ok(())
    }

    fn mkdir(&self, path: &Path, _mode: u32) -> Result<()> {
        self.record(Call::Mkdir(path.to_path_buf()));
        if self.state.borrow().fail_mkdir.contains(path) {
            return Err(Self::fail(Errno::EROFS));
        }
        Ok(())
    }

    fn mount(&self, source: &str, target: &Path, fstype: Option<&str>, flags: MountFlags) -> Result<()> {
        self.record(Call::Mount {
            source: source.to_string(),
            target: target.to_path_buf(),
            fstype: fstype.map(str::to_string),
            flags,
        });
        if self.state.borrow().fail_mount.contains(target) {
            return Err(Self::fail(Errno::ENOENT));
        }
        Ok(())
    }

    fn unmount(&self, target: &Path, force: bool, detach: bool) -> Result<()> {
        self.record(Call::Unmount {
            target: target.to_path_buf(),
            force,
            detach,
        });
        if self.state.borrow().fail_unmount {
            return Err(Self::fail(Errno::EBUSY));
        }
        Ok(())
    }

    fn symlink(&self, original: &Path, link: &Path) -> Result<()> {
        self.record(Call::Symlink {
            original: original.to_path_buf(),
            link: link.to_path_buf(),
        });
        if self.state.borrow().fail_symlink {
            return Err(Self::fail(Errno::EEXIST));
        }
        Ok(())
    }

    fn chroot(&self, root: &Path) -> Result<()> {
        self.record(Call::Chroot(root.to_path_buf()));
        Ok(())
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        self.record(Call::Write {
            path: path.to_path_buf(),
            contents: contents.to_string(),
        });
        if self.state.borrow().fail_write.contains(path) {
            return Err(Self::fail(Errno::ENOENT));
        }
        Ok(())
    }

    fn fork(&self) -> Result<ForkResult> {
        self.record(Call::Fork);
        let mut state = self.state.borrow_mut();
        if state.fail_fork {
            return Err(Self::fail(Errno::EAGAIN));
        }
        if let Some(result) = state.forks.pop_front() {
            return Ok(result);
        }
        state.next_pid += 1;
        Ok(ForkResult::Parent {
            child: Pid::from_raw(state.next_pid),
        })
    }

    fn spawn(&self, spec: &ServiceSpec) -> Result<Pid> {
        if self.state.borrow().fail_spawn.contains(&spec.name) {
            return Err(Error::ProcessSpawnFailed(format!(
                "{}: No such file or directory",
                spec.path.display()
            )));
        }
        let pid = {
            let mut state = self.state.borrow_mut();
            state.next_pid += 1;
            let pid = Pid::from_raw(state.next_pid);
            state.running.insert(pid, spec.name.clone());
            pid
        };
        self.record(Call::Spawn {
            name: spec.name.clone(),
            pid,
        });
        Ok(pid)
    }

    fn exec(&self, spec: &ServiceSpec) -> Error {
        self.record(Call::Exec(spec.name.clone()));
        Error::ExecFailed {
            path: spec.path.clone(),
            reason: "exec is not available in tests".to_string(),
        }
    }

    fn wait_pid(&self, pid: Pid) -> Result<ChildState> {
        self.record(Call::WaitPid(pid));
        let mut state = self.state.borrow_mut();
        let name = state
            .running
            .remove(&pid)
            .ok_or_else(|| Self::fail(Errno::ECHILD))?;
        match state.exits.get_mut(&name) {
            Some(script) => script.pop_front().ok_or_else(|| Self::fail(Errno::ECHILD)),
            None => Ok(ChildState::Exited(0)),
        }
    }

    fn wait_any(&self) -> Result<Option<(Pid, ChildState)>> {
        self.record(Call::WaitAny);
        Ok(self.state.borrow_mut().reap.pop_front())
    }

    fn kill_all(&self, signal: Signal) -> Result<()> {
        self.record(Call::KillAll(signal));
        Ok(())
    }

    fn sync(&self) {
        self.record(Call::Sync);
    }

    fn yield_now(&self) {
        self.record(Call::Yield);
    }

    fn reboot(&self, action: ShutdownType) -> Result<()> {
        self.record(Call::Reboot(action));
        Ok(())
    }

    fn halt(&self) -> ! {
        self.record(Call::Halt);
        std::panic::panic_any(Halted)
    }
}

/// Run `f` and assert that it ends in a halt.
pub fn expect_halt<F, R>(f: F)
where
    F: FnOnce() -> R,
{
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Err(payload) if payload.is::<Halted>() => {}
        Err(payload) => std::panic::resume_unwind(payload),
        Ok(_) => panic!("expected the process to halt"),
    }
}
