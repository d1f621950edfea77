// Exit-code contract of the vm-backup binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn vm_backup() -> Command {
    let mut cmd = Command::cargo_bin("vm-backup").unwrap();
    for var in [
        "VM_BACKUP_CONFIG",
        "VM_BACKUP_DEST_DIR",
        "VM_BACKUP_VMS",
        "VM_BACKUP_MAX_COUNT",
        "VM_BACKUP_MAX_AGE_DAYS",
        "VM_BACKUP_CONCURRENCY",
        "VM_BACKUP_DEBUG",
        "VM_BACKUP_COMPRESSION",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd.env("LOG_OUTPUT", "console");
    cmd
}

fn write_config(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("vm-backup.yaml");
    fs::write(&path, body).unwrap();
    path
}

#[test]
fn help_lists_the_flags() {
    vm_backup()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--debug"));
}

#[test]
fn missing_config_file_exits_2() {
    let dir = TempDir::new().unwrap();
    vm_backup()
        .arg("--config")
        .arg(dir.path().join("absent.yaml"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("absent.yaml"));
}

#[test]
fn unusable_log_file_falls_back_to_console() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("plain-file");
    fs::write(&blocker, b"not a directory").unwrap();

    vm_backup()
        .env("LOG_OUTPUT", "both")
        .env("LOG_FILE_PATH", blocker.join("sub").join("vm-backup.log"))
        .arg("--config")
        .arg(dir.path().join("absent.yaml"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("log file unavailable"))
        .stderr(predicate::str::contains("absent.yaml"));
}

#[test]
fn unknown_config_key_exits_2() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "dest_dir: /tmp/x\nretention_days: 7\n");
    vm_backup().arg("--config").arg(config).assert().code(2);
}

#[test]
fn unwritable_destination_exits_2() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("plain-file");
    fs::write(&blocker, b"not a directory").unwrap();
    let config = write_config(
        dir.path(),
        &format!("dest_dir: {}\nvms: [web1]\n", blocker.join("backups").display()),
    );

    vm_backup()
        .arg("--config")
        .arg(config)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn missing_tool_exits_2_before_any_vm() {
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("backups");
    let config = write_config(
        dir.path(),
        &format!(
            "dest_dir: {}\ntool: vm-backup-no-such-tool\nvms: [web1]\n",
            dest.display()
        ),
    );

    vm_backup().arg("--config").arg(config).assert().code(2);
    assert!(!dest.join("web1").exists());
}

#[cfg(unix)]
mod with_fake_tool {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    const FAKE_INCUS: &str = r#"#!/bin/sh
case "$1" in
  snapshot)
    case "$2" in
      list) echo '[{"name":"snapshot-20200101T000000Z","created_at":"2020-01-01T00:00:00Z"}]' ;;
    esac ;;
  export) printf 'archive' > "$3" ;;
  list) echo '[{"name":"web1"}]' ;;
esac
exit 0
"#;

    const FAILING_EXPORT: &str = r#"#!/bin/sh
case "$1" in
  export) echo "Error: Instance not found" >&2; exit 1 ;;
  snapshot) [ "$2" = list ] && echo '[]' ;;
esac
exit 0
"#;

    fn install_tool(dir: &Path, script: &str) -> std::path::PathBuf {
        let path = dir.join("fake-incus");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn archives(vm_dir: &Path) -> Vec<String> {
        fs::read_dir(vm_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn successful_run_exits_0_and_leaves_one_archive() {
        let dir = TempDir::new().unwrap();
        let tool = install_tool(dir.path(), FAKE_INCUS);
        let dest = dir.path().join("backups");
        let config = write_config(
            dir.path(),
            &format!(
                "dest_dir: {}\ntool: {}\nvms: [web1]\n",
                dest.display(),
                tool.display()
            ),
        );

        vm_backup().arg("--config").arg(config).assert().code(0);

        let files = archives(&dest.join("web1"));
        assert_eq!(files.len(), 1, "{files:?}");
        assert!(files[0].starts_with("web1-") && files[0].ends_with(".tar.gz"));
    }

    #[test]
    fn discovery_is_used_when_no_vms_are_configured() {
        let dir = TempDir::new().unwrap();
        let tool = install_tool(dir.path(), FAKE_INCUS);
        let dest = dir.path().join("backups");

        vm_backup()
            .env("VM_BACKUP_DEST_DIR", &dest)
            .arg("--config")
            .arg(write_config(dir.path(), &format!("tool: {}\n", tool.display())))
            .assert()
            .code(0);

        assert_eq!(archives(&dest.join("web1")).len(), 1);
    }

    #[test]
    fn failed_export_exits_1() {
        let dir = TempDir::new().unwrap();
        let tool = install_tool(dir.path(), FAILING_EXPORT);
        let dest = dir.path().join("backups");
        let config = write_config(
            dir.path(),
            &format!(
                "dest_dir: {}\ntool: {}\nvms: [web1]\n",
                dest.display(),
                tool.display()
            ),
        );

        vm_backup()
            .arg("--config")
            .arg(config)
            .assert()
            .code(1)
            .stderr(predicate::str::contains("not found"));

        assert!(archives(&dest.join("web1")).is_empty());
    }
}
