//! Root image mounting through a loop device.

use crate::console;
use crate::error::{Error, Result};
use crate::mount::{MountFlags, MountSpec, Mounter};
use crate::syscall::System;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Root filesystem image to mount and change root into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootImage {
    /// Loop control device
    #[serde(default = "default_control")]
    pub control: PathBuf,
    /// Backing image file
    pub image: PathBuf,
    /// Filesystem inside the image
    #[serde(default = "default_fstype")]
    pub fstype: String,
    /// Where the image is mounted (read-only)
    #[serde(default = "default_target")]
    pub target: PathBuf,
    /// Bind the current /dev into the new root
    #[serde(default = "default_true")]
    pub bind_dev: bool,
    /// Change root into the mounted image
    #[serde(default = "default_true")]
    pub chroot: bool,
}

fn default_control() -> PathBuf {
    PathBuf::from("/dev/loop-control")
}

fn default_fstype() -> String {
    "ext2".to_string()
}

fn default_target() -> PathBuf {
    PathBuf::from("/newroot")
}

fn default_true() -> bool {
    true
}

impl RootImage {
    /// An ext2 image mounted at /newroot, with /dev bound and a chroot.
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self {
            control: default_control(),
            image: image.into(),
            fstype: default_fstype(),
            target: default_target(),
            bind_dev: true,
            chroot: true,
        }
    }
}

/// A loop device dispensed by the kernel and bound to the root image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopBinding {
    /// Control device the index was requested from
    pub control: PathBuf,
    /// Dispensed loop index
    pub index: u32,
    /// Loop device node
    pub device: PathBuf,
    /// Backing image
    pub image: PathBuf,
}

/// Device node for loop index `index`.
pub fn device_path(index: u32) -> PathBuf {
    PathBuf::from(format!("/dev/loop{}", index))
}

fn loop_error(step: &'static str, path: &Path, e: Error) -> Error {
    Error::LoopDevice {
        step,
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

/// Attach the root image to a free loop device and mount it read-only.
///
/// Every step is required. Once the image is attached, a later failure
/// releases the loop device again before reporting; on success the binding
/// stays with the kernel for the rest of the session.
pub fn mount_image<S: System>(sys: &S, root: &RootImage) -> Result<LoopBinding> {
    let control = sys.open(&root.control).map_err(|e| {
        loop_error(
            "open loop-control (was /dev populated? is loop support built in?)",
            &root.control,
            e,
        )
    })?;

    let index = sys.loop_get_free(&control).map_err(|e| {
        loop_error(
            "request free loop (was /dev populated?)",
            &root.control,
            e,
        )
    })?;

    let node = device_path(index);
    let device = sys
        .open(&node)
        .map_err(|e| loop_error("open dispensed loop", &node, e))?;

    let image = sys
        .open(&root.image)
        .map_err(|e| loop_error("open image", &root.image, e))?;

    sys.loop_attach(&device, &image)
        .map_err(|e| loop_error("attach image", &node, e))?;

    let source = node.to_string_lossy();
    if let Err(e) = sys.mount(&source, &root.target, Some(root.fstype.as_str()), MountFlags::ReadOnly) {
        if let Err(detach) = sys.loop_detach(&device) {
            console::warning("loop", format_args!("Failed to release {}: {}", source, detach));
        }
        return Err(Error::MountError {
            source_path: source.into_owned(),
            target: root.target.clone(),
            reason: e.to_string(),
        });
    }

    info!(
        index = index,
        device = %node.display(),
        image = %root.image.display(),
        target = %root.target.display(),
        "Mounted root image"
    );

    Ok(LoopBinding {
        control: root.control.clone(),
        index,
        device: node,
        image: root.image.clone(),
    })
}

/// Mount the root image, bind /dev into it and change root, as configured.
pub fn enter_root_image<S: System>(sys: &S, root: &RootImage) -> Result<LoopBinding> {
    let binding = mount_image(sys, root)?;

    if root.bind_dev {
        Mounter::new(sys).mount_required(&MountSpec::bind("/dev", root.target.join("dev")))?;
    }

    if root.chroot {
        sys.chroot(&root.target).map_err(|e| Error::ChrootFailed {
            root: root.target.clone(),
            reason: e.to_string(),
        })?;
        info!(root = %root.target.display(), "Changed root");
    }

    Ok(binding)
}
