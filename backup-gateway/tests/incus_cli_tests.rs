//! IncusGateway against a scripted stand-in for the `incus` binary.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use backup_gateway::{Gateway, GatewayErrorKind, IncusGateway, Snapshot, VmIdentity};
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

const SCRIPT: &str = r#"#!/bin/sh
echo "$@" >> "$(dirname "$0")/calls.log"
case "$1" in
  snapshot)
    case "$2" in
      create) [ "$3" = "--stateful" ] && { echo "Error: stateful snapshots are unsupported" >&2; exit 1; } ;;
      list) echo '[{"name":"snapshot-20261018T030000Z","created_at":"2026-10-18T03:00:00.5Z"}]' ;;
      delete) [ "$4" = "locked" ] && { echo "Error: permission denied" >&2; exit 1; } ;;
    esac ;;
  export)
    [ "$2" = "slow" ] && sleep 3
    printf 'tarball' > "$3" ;;
  list) echo '[{"name":"web1"},{"name":"db1"}]' ;;
esac
exit 0
"#;

fn install(dir: &Path) -> PathBuf {
    let path = dir.join("incus");
    fs::write(&path, SCRIPT).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn calls(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn gateway(tool: &Path) -> IncusGateway {
    IncusGateway::new(tool.to_string_lossy()).with_timeouts(Duration::from_secs(10), Duration::from_secs(1))
}

fn snapshot(vm: &str) -> Snapshot {
    Snapshot::new(
        VmIdentity::new(vm),
        "snapshot-20261019T030000Z",
        Utc.with_ymd_and_hms(2026, 10, 19, 3, 0, 0).unwrap(),
    )
}

#[test]
fn snapshot_commands_have_the_expected_shape() {
    let dir = TempDir::new().unwrap();
    let gw = gateway(&install(dir.path()));
    let vm = VmIdentity::new("web1");
    let at = Utc.with_ymd_and_hms(2026, 10, 19, 3, 0, 0).unwrap();

    let created = gw.create_snapshot(&vm, at, false).unwrap();
    let listed = gw.list_snapshots(&vm).unwrap();
    gw.delete_snapshot(&vm, &listed[0]).unwrap();

    assert_eq!(created.name, "snapshot-20261019T030000Z");
    assert_eq!(listed.len(), 1);
    assert_eq!(
        calls(dir.path()),
        vec![
            "snapshot create web1 snapshot-20261019T030000Z",
            "snapshot list web1 --format json",
            "snapshot delete web1 snapshot-20261018T030000Z",
        ]
    );
}

#[test]
fn stderr_is_classified() {
    let dir = TempDir::new().unwrap();
    let gw = gateway(&install(dir.path()));
    let vm = VmIdentity::new("web1");

    let locked = Snapshot::new(vm.clone(), "locked", Utc::now());
    let err = gw.delete_snapshot(&vm, &locked).unwrap_err();
    assert_eq!(err.kind, GatewayErrorKind::PermissionDenied);

    let err = gw.create_snapshot(&vm, Utc::now(), true).unwrap_err();
    assert_eq!(err.kind, GatewayErrorKind::Unknown);
    assert!(err.raw_message.contains("stateful"));
}

#[test]
fn export_lands_under_its_final_name() {
    let dir = TempDir::new().unwrap();
    let gw = gateway(&install(dir.path()));
    let dest = dir.path().join("web1");
    fs::create_dir_all(&dest).unwrap();

    let artifact = gw
        .export_snapshot(&VmIdentity::new("web1"), &snapshot("web1"), &dest)
        .unwrap();

    assert!(artifact.complete);
    assert_eq!(artifact.size_bytes, 7);
    assert_eq!(artifact.path, dest.join("web1-20261019T030000Z.tar.gz"));
    assert_eq!(fs::read_dir(&dest).unwrap().count(), 1);
    let export_call = calls(dir.path()).pop().unwrap();
    assert!(export_call.starts_with("export web1 "));
    assert!(export_call.ends_with(".tar.gz.partial --compression gzip"));
}

#[test]
fn export_refuses_to_replace_an_existing_archive() {
    let dir = TempDir::new().unwrap();
    let gw = gateway(&install(dir.path()));
    let dest = dir.path().join("web1");
    fs::create_dir_all(&dest).unwrap();
    let existing = dest.join("web1-20261019T030000Z.tar.gz");
    fs::write(&existing, b"keep me").unwrap();

    assert!(gw
        .export_snapshot(&VmIdentity::new("web1"), &snapshot("web1"), &dest)
        .is_err());
    assert_eq!(fs::read(&existing).unwrap(), b"keep me");
    assert!(calls(dir.path()).is_empty());
}

#[test]
fn slow_export_times_out_and_leaves_no_partial() {
    let dir = TempDir::new().unwrap();
    let gw = gateway(&install(dir.path()));
    let dest = dir.path().join("slow");
    fs::create_dir_all(&dest).unwrap();

    let err = gw
        .export_snapshot(&VmIdentity::new("slow"), &snapshot("slow"), &dest)
        .unwrap_err();

    assert_eq!(err.kind, GatewayErrorKind::Timeout);
    assert_eq!(fs::read_dir(&dest).unwrap().count(), 0);
}

#[test]
fn discovery_lists_instances() {
    let dir = TempDir::new().unwrap();
    let gw = gateway(&install(dir.path()));

    let names: Vec<_> = gw
        .list_instances()
        .unwrap()
        .into_iter()
        .map(|vm| vm.as_str().to_string())
        .collect();

    assert_eq!(names, vec!["web1", "db1"]);
}
