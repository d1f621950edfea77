//! Loader resolution tests against real files.

use backup_config::ConfigLoader;
use serial_test::serial;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn no_env(_: &str) -> Option<String> {
    None
}

#[test]
fn test_explicit_path_wins_over_search_paths() {
    let dir = TempDir::new().unwrap();
    let explicit = dir.path().join("explicit.yaml");
    let searched = dir.path().join("searched.yaml");
    fs::write(&explicit, "dest_dir: /srv/explicit\n").unwrap();
    fs::write(&searched, "dest_dir: /srv/searched\n").unwrap();

    let config = ConfigLoader::new(Some(explicit))
        .with_search_paths(vec![searched])
        .load_with(no_env)
        .unwrap();

    assert_eq!(config.dest_dir, PathBuf::from("/srv/explicit"));
}

#[test]
fn test_first_existing_search_path_is_used() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing.yaml");
    let present = dir.path().join("present.yaml");
    fs::write(&present, "dest_dir: /srv/present\nvms: [web1]\n").unwrap();

    let config = ConfigLoader::new(None)
        .with_search_paths(vec![missing, present])
        .load_with(no_env)
        .unwrap();

    assert_eq!(config.dest_dir, PathBuf::from("/srv/present"));
    assert_eq!(config.vms.len(), 1);
}

#[test]
fn test_missing_explicit_file_is_config_error() {
    let dir = TempDir::new().unwrap();
    let err = ConfigLoader::new(Some(dir.path().join("nope.yaml")))
        .with_search_paths(vec![])
        .load_with(no_env)
        .unwrap_err();
    assert!(err.is_config());
}

#[test]
fn test_environment_alone_can_configure_a_run() {
    let vars = |key: &str| match key {
        "VM_BACKUP_DEST_DIR" => Some("/srv/env".to_string()),
        "VM_BACKUP_VMS" => Some("web1,db1".to_string()),
        _ => None,
    };

    let config = ConfigLoader::new(None)
        .with_search_paths(vec![])
        .load_with(vars)
        .unwrap();

    assert_eq!(config.dest_dir, PathBuf::from("/srv/env"));
    assert_eq!(config.vms.len(), 2);
}

#[test]
fn test_no_file_and_no_destination_fails_validation() {
    let err = ConfigLoader::new(None)
        .with_search_paths(vec![])
        .load_with(no_env)
        .unwrap_err();
    assert!(err.is_config());
}

#[test]
fn test_malformed_yaml_is_config_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.yaml");
    fs::write(&path, "dest_dir: [unterminated\n").unwrap();

    let err = ConfigLoader::new(Some(path))
        .load_with(no_env)
        .unwrap_err();
    assert!(err.is_config());
    assert!(err.to_string().contains("broken.yaml"));
}

#[test]
#[serial]
fn test_config_path_from_process_environment() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("from-env.yaml");
    fs::write(&path, "dest_dir: /srv/from-env\nmax_count: 2\n").unwrap();

    std::env::set_var("VM_BACKUP_CONFIG", &path);
    let result = ConfigLoader::new(None).with_search_paths(vec![]).load();
    std::env::remove_var("VM_BACKUP_CONFIG");

    let config = result.unwrap();
    assert_eq!(config.dest_dir, PathBuf::from("/srv/from-env"));
    assert_eq!(config.max_count, 2);
}
