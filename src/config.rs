//! Boot configuration.
//!
//! The boot table is immutable data built once at startup: the built-in
//! appliance table, optionally overridden field by field from a TOML file.

use crate::error::{Error, Result};
use crate::loopdev::RootImage;
use crate::mount::{self, MountSpec, SymlinkSpec};
use crate::service::{self, Registry, RestartPolicy, ServiceSpec, Task};
use crate::shutdown::ShutdownConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Configuration file read when no path is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/microinit.toml";

/// Supervised login terminals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Terminals {
    /// Login program, given the terminal name as its only argument
    pub program: PathBuf,
    /// Terminal names, one supervised login each
    pub ttys: Vec<String>,
}

impl Default for Terminals {
    fn default() -> Self {
        Self {
            program: PathBuf::from("/sbin/agetty"),
            ttys: (2..=12).map(|n| format!("tty{}", n)).collect(),
        }
    }
}

/// The interactive shell the init role turns into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Shell executable
    pub path: PathBuf,
    /// Arguments after argv[0]
    pub args: Vec<String>,
    /// Line printed before the shell takes over the console. Absent in a
    /// file means no banner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/bin/su"),
            // --pty avoids "can't access tty; job control turned off"
            args: vec!["-".to_string(), "--pty".to_string()],
            banner: Some(
                "Dropping you into a root shell so you can set a password or create a new account. \
                 If done, use Ctrl + Alt + F2 to F12 to switch into a real console."
                    .to_string(),
            ),
        }
    }
}

/// Full boot configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment given to every program without its own
    pub environment: Vec<String>,
    /// Root image to loop-mount and change root into before anything else
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_image: Option<RootImage>,
    /// Mount table, in order
    pub mounts: Vec<MountSpec>,
    /// Required symlinks
    pub symlinks: Vec<SymlinkSpec>,
    /// Configuration phase, in order
    pub configure: Vec<Task>,
    /// Supervised login terminals, started before other services
    pub terminals: Terminals,
    /// Supervised services, in start order
    pub services: Vec<ServiceSpec>,
    /// Interactive shell
    pub shell: ShellConfig,
    /// Shutdown behaviour
    pub shutdown: ShutdownConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: vec!["HOME=/".to_string(), "TERM=linux".to_string()],
            root_image: None,
            mounts: default_mounts(),
            symlinks: vec![SymlinkSpec::new("/proc/self/fd", "/dev/fd")],
            configure: default_configure(),
            terminals: Terminals::default(),
            services: default_services(),
            shell: ShellConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

fn default_mounts() -> Vec<MountSpec> {
    vec![
        MountSpec::new("shm", "/dev/shm", "tmpfs").create(0o777),
        MountSpec::new("devpts", "/dev/pts", "devpts").create(0o755),
        MountSpec::new("proc", "/proc", "proc"),
        MountSpec::new("sysfs", "/sys", "sysfs"),
        MountSpec::new("tmpfs", "/run", "tmpfs"),
        MountSpec::new("tmpfs", "/run/lock", "tmpfs").create(0o777),
        MountSpec::new("shm", "/run/shm", "tmpfs").create(0o777),
        MountSpec::new("tmpfs", "/run/user", "tmpfs").create(0o755),
        // Logs live in RAM; the root is read-only
        MountSpec::new("tmpfs", "/var/log", "tmpfs"),
        MountSpec::new("/dev/mmcblk0p1", "/boot", "vfat")
            .read_only()
            .optional(),
    ]
}

fn default_configure() -> Vec<Task> {
    vec![
        Task::Run(
            ServiceSpec::one_shot("loopback", "/bin/ip").with_args(["link", "set", "up", "dev", "lo"]),
        ),
        Task::Run(ServiceSpec::one_shot("modprobe", "/sbin/modprobe").with_args([
            "-a",
            "brcmfmac",
            "tcp_bbr",
            "i2c_bcm2835",
            "vc4",
            "snd_soc_hdmi_codec",
            "bcm2835_isp",
        ])),
        // Firmware uploads started by the modules above run asynchronously
        Task::Settle { yields: 1000 },
        Task::Run(
            ServiceSpec::one_shot("hostname", "/bin/hostname").with_args(["-F", "/etc/hostname"]),
        ),
        Task::Write {
            path: PathBuf::from("/sys/devices/system/cpu/cpufreq/policy0/scaling_governor"),
            value: "ondemand".to_string(),
        },
        Task::Write {
            path: PathBuf::from("/proc/sys/net/ipv4/tcp_congestion_control"),
            value: "bbr".to_string(),
        },
        Task::Write {
            path: PathBuf::from("/proc/sys/net/ipv4/ip_forward"),
            value: "1".to_string(),
        },
        // sshd privilege separation directory
        Task::Mkdir {
            path: PathBuf::from("/run/sshd"),
            mode: 0o755,
        },
        Task::Run(ServiceSpec::one_shot("ssh-keygen", "/bin/ssh-keygen").with_args(["-A"])),
    ]
}

fn default_services() -> Vec<ServiceSpec> {
    vec![
        ServiceSpec::new("watchdog", "/sbin/watchdog").with_args(["-F"]),
        ServiceSpec::new("wpa_supplicant", "/sbin/wpa_supplicant").with_args([
            "-Dnl80211",
            "-iwlan0",
            "-c/boot/wpa_supplicant.conf",
        ]),
        // The stock dhclient-script does not cope with a read-only root
        ServiceSpec::new("dhclient", "/sbin/dhclient").with_args([
            "wlan0",
            "-d",
            "-sf",
            "/boot/dhcp-script.sh",
        ]),
        ServiceSpec::new("ddns", "/bin/sh").with_args(["/boot/ddns-update.sh"]),
        // sshd re-execs itself and insists on an absolute argv[0]
        ServiceSpec::new("sshd", "/sbin/sshd")
            .with_arg0("/sbin/sshd")
            .with_args(["-D"]),
    ]
}

impl Config {
    /// Load the configuration.
    ///
    /// An explicit path must exist. Without one, [`DEFAULT_CONFIG_PATH`] is
    /// used if present, otherwise the built-in table.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    debug!("No configuration file, using built-in table");
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load and validate a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content).map_err(|e| Error::InvalidConfigFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Parse and validate TOML. Fields not present keep their built-in value.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::ConfigError(e.to_string()))
    }

    /// Render as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check everything that can be checked before touching the system.
    pub fn validate(&self) -> Result<()> {
        if let Some(bad) = self.environment.iter().find(|var| !var.contains('=')) {
            return Err(Error::ConfigError(format!(
                "environment entry {:?} is not KEY=value",
                bad
            )));
        }

        mount::validate_order(&self.mounts)?;

        if !self.shell.path.is_absolute() {
            return Err(Error::ConfigError(format!(
                "shell path {} must be absolute",
                self.shell.path.display()
            )));
        }

        let registry = self.registry()?;
        let programs = registry
            .tasks()
            .iter()
            .filter_map(|task| match task {
                Task::Run(spec) => Some(spec),
                _ => None,
            })
            .chain(registry.services());
        for spec in programs {
            if !spec.path.is_absolute() {
                return Err(Error::ConfigError(format!(
                    "{}: program path {} must be absolute",
                    spec.name,
                    spec.path.display()
                )));
            }
        }

        Ok(())
    }

    /// Build the ordered service registry: terminals first, then services.
    pub fn registry(&self) -> Result<Registry> {
        let services = self
            .terminals
            .ttys
            .iter()
            .map(|tty| service::terminal_login(&self.terminals.program, tty))
            .chain(self.services.iter().cloned())
            .collect();

        Registry::new(self.configure.clone(), services, &self.environment)
    }

    /// The shell as a program invocation.
    pub fn shell_spec(&self) -> ServiceSpec {
        let mut spec = ServiceSpec::new("shell", &self.shell.path)
            .with_args(self.shell.args.iter().cloned())
            .with_restart(RestartPolicy::OneShot);
        spec.env = self.environment.clone();
        spec
    }
}
