//! Service definitions, restart policies and the ordered boot registry.

use crate::error::{Error, Result};
use crate::process::ChildState;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Service restart policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Run to completion once, never restart
    OneShot,
    /// Always restart, whatever the exit reason
    Always,
    /// Restart on signal or clean exit, stop for good on a non-zero exit
    UnlessError,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::UnlessError
    }
}

impl RestartPolicy {
    /// Whether a supervised service should be spawned again after `state`.
    ///
    /// A process that reports its own error is assumed to be misconfigured
    /// and will not recover by itself, so `UnlessError` gives up on it.
    /// One-shot programs are never restarted.
    pub fn should_restart(&self, state: &ChildState) -> bool {
        match self {
            RestartPolicy::OneShot => false,
            RestartPolicy::Always => true,
            RestartPolicy::UnlessError => !state.is_error_exit(),
        }
    }

    /// Whether this policy keeps a process running under a supervisor.
    pub fn is_supervised(&self) -> bool {
        !matches!(self, RestartPolicy::OneShot)
    }
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartPolicy::OneShot => write!(f, "one-shot"),
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::UnlessError => write!(f, "unless-error"),
        }
    }
}

/// Service definition - a fixed program invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unique name of the service, used as the log origin
    pub name: String,
    /// Executable to run
    pub path: PathBuf,
    /// Override for argv[0] (defaults to the file name of `path`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg0: Option<String>,
    /// Arguments after argv[0]
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment as `KEY=value` entries; empty means the global environment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Restart policy
    #[serde(default)]
    pub restart: RestartPolicy,
    /// Make the process a session leader so it can own a terminal
    #[serde(default)]
    pub session_leader: bool,
    /// A failed fork while starting this service halts the boot
    #[serde(default)]
    pub critical: bool,
}

impl ServiceSpec {
    /// Create a new service definition with minimal configuration.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            arg0: None,
            args: Vec::new(),
            env: Vec::new(),
            restart: RestartPolicy::default(),
            session_leader: false,
            critical: false,
        }
    }

    /// Create a one-shot definition.
    pub fn one_shot(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(name, path).with_restart(RestartPolicy::OneShot)
    }

    /// Set the arguments following argv[0].
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Override argv[0].
    pub fn with_arg0(mut self, arg0: impl Into<String>) -> Self {
        self.arg0 = Some(arg0.into());
        self
    }

    /// Set the restart policy.
    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Spawn as a session leader.
    pub fn session_leader(mut self) -> Self {
        self.session_leader = true;
        self
    }

    /// Treat a fork failure for this service as fatal.
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// The argv[0] the program will see.
    pub fn argv0(&self) -> &str {
        if let Some(ref arg0) = self.arg0 {
            return arg0;
        }
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.name)
    }

    /// The environment split into key/value pairs. Malformed entries are skipped.
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().filter_map(|var| var.split_once('='))
    }
}

/// A step of the configuration phase, run strictly in table order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Task {
    /// Run a one-shot program and wait for it
    Run(ServiceSpec),
    /// Write a value into a kernel tunable file
    Write { path: PathBuf, value: String },
    /// Create a directory some later service needs
    Mkdir { path: PathBuf, mode: u32 },
    /// Yield the CPU a number of times
    Settle { yields: u32 },
}

impl Task {
    /// Short description used in logs.
    pub fn describe(&self) -> String {
        match self {
            Task::Run(spec) => spec.name.clone(),
            Task::Write { path, value } => format!("write {} > {}", value, path.display()),
            Task::Mkdir { path, .. } => format!("mkdir {}", path.display()),
            Task::Settle { yields } => format!("settle x{}", yields),
        }
    }
}

/// The fixed, ordered table of things to run at boot.
///
/// Tasks all complete before the first service is started; services are
/// started in table order but run independently once forked.
#[derive(Debug, Clone)]
pub struct Registry {
    tasks: Vec<Task>,
    services: Vec<ServiceSpec>,
}

impl Registry {
    /// Build a registry, filling in the global environment and checking
    /// that every entry's policy matches the phase it runs in.
    pub fn new(tasks: Vec<Task>, services: Vec<ServiceSpec>, environment: &[String]) -> Result<Self> {
        let mut names = HashSet::new();

        let tasks = tasks
            .into_iter()
            .map(|task| match task {
                Task::Run(spec) => {
                    if spec.restart != RestartPolicy::OneShot {
                        return Err(Error::ConfigError(format!(
                            "configuration step {} must be one-shot, not {}",
                            spec.name, spec.restart
                        )));
                    }
                    if !names.insert(spec.name.clone()) {
                        return Err(duplicate(&spec.name));
                    }
                    Ok(Task::Run(with_environment(spec, environment)))
                }
                other => Ok(other),
            })
            .collect::<Result<Vec<_>>>()?;

        let services = services
            .into_iter()
            .map(|spec| {
                if !spec.restart.is_supervised() {
                    return Err(Error::ConfigError(format!(
                        "service {} must be supervised; one-shot programs belong in the configure table",
                        spec.name
                    )));
                }
                if !names.insert(spec.name.clone()) {
                    return Err(duplicate(&spec.name));
                }
                Ok(with_environment(spec, environment))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { tasks, services })
    }

    /// Configuration tasks in run order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Supervised services in start order.
    pub fn services(&self) -> &[ServiceSpec] {
        &self.services
    }

    /// Look up a service or one-shot program by name.
    pub fn get(&self, name: &str) -> Option<&ServiceSpec> {
        self.tasks
            .iter()
            .filter_map(|task| match task {
                Task::Run(spec) => Some(spec),
                _ => None,
            })
            .chain(self.services.iter())
            .find(|spec| spec.name == name)
    }
}

fn with_environment(mut spec: ServiceSpec, environment: &[String]) -> ServiceSpec {
    if spec.env.is_empty() {
        spec.env = environment.to_vec();
    }
    spec
}

fn duplicate(name: &str) -> Error {
    Error::ConfigError(format!("duplicate service name: {}", name))
}

/// Supervised terminal login on `tty`.
pub fn terminal_login(program: &Path, tty: &str) -> ServiceSpec {
    let name = format!(
        "{}-{}",
        program
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("getty"),
        tty
    );
    ServiceSpec::new(name, program)
        .with_args([tty])
        .with_restart(RestartPolicy::Always)
        .session_leader()
        .critical()
}
