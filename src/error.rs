//! Error types for the micro init.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for init operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while bringing the system up or down.
///
/// Every variant that names a path names the exact target that failed, so
/// the single fatal line printed before a halt tells the operator which boot
/// step is stuck.
#[derive(Error, Debug)]
pub enum Error {
    /// Mount error
    #[error("Error mounting {source_path} into [{target}]: {reason}")]
    MountError {
        source_path: String,
        target: PathBuf,
        reason: String,
    },

    /// Directory creation error
    #[error("Failed to create [{path}]: {reason}")]
    CreateDirFailed { path: PathBuf, reason: String },

    /// Symlink error
    #[error("Error symlinking [{link}] -> [{original}]: {reason}")]
    SymlinkFailed {
        link: PathBuf,
        original: PathBuf,
        reason: String,
    },

    /// Loop device error
    #[error("Loop device setup failed at {step} [{path}]: {reason}")]
    LoopDevice {
        step: &'static str,
        path: PathBuf,
        reason: String,
    },

    /// Chroot error
    #[error("Failed to change root into [{root}]: {reason}")]
    ChrootFailed { root: PathBuf, reason: String },

    /// Fork error
    #[error("Failed to fork for {name}: {reason}")]
    ForkFailed { name: String, reason: String },

    /// Process spawn error
    #[error("Failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    /// Exec error in a process that was meant to replace itself
    #[error("Failed to exec [{path}]: {reason}")]
    ExecFailed { path: PathBuf, reason: String },

    /// Unmount error
    #[error("Failed to unmount [{target}]: {reason}")]
    UnmountFailed { target: PathBuf, reason: String },

    /// Reboot syscall refused
    #[error("Reboot request failed: {0}")]
    RebootFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration file
    #[error("Invalid configuration file: {path}: {reason}")]
    InvalidConfigFile { path: PathBuf, reason: String },

    /// Not running as PID 1
    #[error("Not running as PID 1 (current PID: {0})")]
    NotPid1(u32),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Nix error
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
}
