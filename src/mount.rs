//! Ordered mounting of the filesystem tree a userspace needs.

use crate::console;
use crate::error::{Error, Result};
use crate::syscall::System;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Flags applied to a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MountFlags {
    /// Plain read-write mount
    #[default]
    None,
    /// Read-only mount
    ReadOnly,
    /// Bind an existing directory
    Bind,
}

/// What a failed mount does to the boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Failure halts the system
    #[default]
    Required,
    /// Failure is reported and boot continues
    Optional,
}

/// A single entry of the mount table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Device, pseudo-filesystem name or bind source
    pub source: String,
    /// Mount point
    pub target: PathBuf,
    /// Filesystem type (none for bind mounts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fstype: Option<String>,
    /// Mount flags
    #[serde(default)]
    pub flags: MountFlags,
    /// Create the mount point first
    #[serde(default)]
    pub create: bool,
    /// Mode for a created mount point
    #[serde(default = "default_mode")]
    pub mode: u32,
    /// Required or optional
    #[serde(default)]
    pub severity: Severity,
}

fn default_mode() -> u32 {
    0o755
}

impl MountSpec {
    /// A required pseudo-filesystem mount on an existing directory.
    pub fn new(source: impl Into<String>, target: impl Into<PathBuf>, fstype: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            fstype: Some(fstype.into()),
            flags: MountFlags::None,
            create: false,
            mode: default_mode(),
            severity: Severity::Required,
        }
    }

    /// A required bind mount.
    pub fn bind(source: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            fstype: None,
            flags: MountFlags::Bind,
            create: false,
            mode: default_mode(),
            severity: Severity::Required,
        }
    }

    /// Create the mount point with `mode` before mounting.
    pub fn create(mut self, mode: u32) -> Self {
        self.create = true;
        self.mode = mode;
        self
    }

    /// Mount read-only.
    pub fn read_only(mut self) -> Self {
        self.flags = MountFlags::ReadOnly;
        self
    }

    /// Downgrade failures to warnings.
    pub fn optional(mut self) -> Self {
        self.severity = Severity::Optional;
        self
    }
}

/// A symlink the userspace expects, e.g. `/dev/fd -> /proc/self/fd`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkSpec {
    /// Path the link points at
    pub original: PathBuf,
    /// Path of the link itself
    pub link: PathBuf,
}

impl SymlinkSpec {
    /// Create a symlink entry.
    pub fn new(original: impl Into<PathBuf>, link: impl Into<PathBuf>) -> Self {
        Self {
            original: original.into(),
            link: link.into(),
        }
    }
}

/// Performs mounts against a system interface.
pub struct Mounter<'a, S: System> {
    sys: &'a S,
}

impl<'a, S: System> Mounter<'a, S> {
    /// Create a mounter.
    pub fn new(sys: &'a S) -> Self {
        Self { sys }
    }

    /// Mount the whole table: every required entry in table order, then every
    /// optional one. The first required failure is returned and nothing
    /// after it is attempted.
    pub fn mount_all(&self, table: &[MountSpec]) -> Result<()> {
        for spec in execution_order(table) {
            match spec.severity {
                Severity::Required => self.mount_required(spec)?,
                Severity::Optional => {
                    self.mount_optional(spec);
                }
            }
        }
        Ok(())
    }

    /// Mount an entry whose failure must stop the boot.
    pub fn mount_required(&self, spec: &MountSpec) -> Result<()> {
        self.apply(spec)
    }

    /// Mount an entry whose failure only degrades the system.
    pub fn mount_optional(&self, spec: &MountSpec) -> bool {
        match self.apply(spec) {
            Ok(()) => true,
            Err(e) => {
                console::warning("mount", &e);
                false
            }
        }
    }

    fn apply(&self, spec: &MountSpec) -> Result<()> {
        if spec.create {
            self.sys
                .mkdir(&spec.target, spec.mode)
                .map_err(|e| Error::CreateDirFailed {
                    path: spec.target.clone(),
                    reason: e.to_string(),
                })?;
        }

        self.sys
            .mount(&spec.source, &spec.target, spec.fstype.as_deref(), spec.flags)
            .map_err(|e| Error::MountError {
                source_path: spec.source.clone(),
                target: spec.target.clone(),
                reason: e.to_string(),
            })?;

        info!(
            source = %spec.source,
            target = %spec.target.display(),
            fstype = spec.fstype.as_deref().unwrap_or("bind"),
            "Mounted filesystem"
        );
        Ok(())
    }

    /// Create every symlink. All of them are required.
    pub fn symlink_all(&self, links: &[SymlinkSpec]) -> Result<()> {
        for link in links {
            self.sys
                .symlink(&link.original, &link.link)
                .map_err(|e| Error::SymlinkFailed {
                    link: link.link.clone(),
                    original: link.original.clone(),
                    reason: e.to_string(),
                })?;
            info!(link = %link.link.display(), original = %link.original.display(), "Created symlink");
        }
        Ok(())
    }
}

/// The order [`Mounter::mount_all`] mounts a table in: required entries in
/// table order, then optional entries in table order.
pub fn execution_order(table: &[MountSpec]) -> impl Iterator<Item = &MountSpec> {
    let required = table.iter().filter(|s| s.severity == Severity::Required);
    let optional = table.iter().filter(|s| s.severity == Severity::Optional);
    required.chain(optional)
}

/// Check that no mount is shadowed by a later mount of one of its ancestors.
///
/// Checked against [`execution_order`], so `/run` has to be mounted before
/// `/run/lock`, and an optional parent can never sit above a required child.
pub fn validate_order(table: &[MountSpec]) -> Result<()> {
    let ordered: Vec<&MountSpec> = execution_order(table).collect();
    for (i, earlier) in ordered.iter().enumerate() {
        for later in &ordered[i + 1..] {
            if is_strict_ancestor(&later.target, &earlier.target) {
                return Err(Error::ConfigError(format!(
                    "mount of {} comes after {} and would hide it",
                    later.target.display(),
                    earlier.target.display()
                )));
            }
        }
    }
    Ok(())
}

fn is_strict_ancestor(ancestor: &Path, path: &Path) -> bool {
    ancestor != path && path.starts_with(ancestor)
}
