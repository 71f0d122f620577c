//! Loading boot tables from disk.

use buckos_microinit::{Config, Error, RestartPolicy, ShutdownType};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn test_load_from_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("microinit.toml");
    fs::write(
        &path,
        r#"
[terminals]
ttys = ["tty1"]

[[services]]
name = "dropbear"
path = "/usr/sbin/dropbear"
args = ["-F", "-R"]
restart = "always"

[shell]
args = ["-l"]

[shutdown]
action = "power-off"
detach = true
"#,
    )
    .unwrap();

    let config = Config::load(Some(&path)).unwrap();
    let registry = config.registry().unwrap();

    let names: Vec<_> = registry.services().iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["agetty-tty1", "dropbear"]);
    assert_eq!(registry.get("dropbear").unwrap().restart, RestartPolicy::Always);
    assert_eq!(config.terminals.program, PathBuf::from("/sbin/agetty"));
    assert_eq!(config.shell.path, PathBuf::from("/bin/su"));
    assert_eq!(config.shell.args, vec!["-l"]);
    assert_eq!(config.shutdown.action, ShutdownType::PowerOff);
    assert!(config.shutdown.detach);
    assert!(config.shutdown.force);
    // untouched sections keep the appliance defaults
    assert_eq!(config.mounts, Config::default().mounts);
}

#[test]
fn test_explicit_missing_file_is_an_error() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("absent.toml");

    assert!(matches!(Config::load(Some(&path)), Err(Error::Io(_))));
}

#[test]
fn test_invalid_file_names_the_path() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("broken.toml");
    fs::write(
        &path,
        r#"
[[mounts]]
source = "tmpfs"
target = "/run/lock"
fstype = "tmpfs"

[[mounts]]
source = "tmpfs"
target = "/run"
fstype = "tmpfs"
"#,
    )
    .unwrap();

    let err = Config::load(Some(&path)).unwrap_err();

    assert!(matches!(err, Error::InvalidConfigFile { .. }));
    assert!(err.to_string().contains("broken.toml"));
}

#[test]
fn test_plan_output_reloads() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("plan.toml");
    let config = Config::default();
    fs::write(&path, config.to_toml().unwrap()).unwrap();

    assert_eq!(Config::load(Some(&path)).unwrap(), config);
}

#[test]
fn test_optional_parent_of_required_mount_is_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("hidden.toml");
    fs::write(
        &path,
        r#"
[[mounts]]
source = "/dev/sda1"
target = "/data"
fstype = "ext4"
severity = "optional"

[[mounts]]
source = "tmpfs"
target = "/data/cache"
fstype = "tmpfs"
"#,
    )
    .unwrap();

    let err = Config::load(Some(&path)).unwrap_err();

    assert!(matches!(err, Error::InvalidConfigFile { .. }));
    assert!(err.to_string().contains("/data/cache"));
}
