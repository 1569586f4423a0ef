/// Config file loading
use super::setup_test_env;
use lxce::capability::{self, BASIC_BUNDLE};
use lxce::cspace::ContainedSpace;
use lxce::engine::Engine;
use lxce::types::{AppConfig, LxceError, Manifest, SpaceConfig, SpaceKind, CONFIG_MAX_SIZE};
use nix::sched::CloneFlags;
use std::fs;

const SERVICE_SPACE: &str = r#"{
    "version": "0.1",
    "target": "all",
    "name": "services",
    "hostname": "svc",
    "uid": 1000,
    "gid": 1000,
    "type": "service",
    "rootfs": "/var/lib/lxce/cspaces/services",
    "namespaces": [{"type": "mount"}, {"type": "pid"}, {"type": "net"}, {"type": "user"}],
    "capabilities": [{"type": "CAP_CHOWN"}]
}"#;

#[test]
fn test_space_config_file() {
    let dir = setup_test_env();
    let path = dir.path().join("services.json");
    fs::write(&path, SERVICE_SPACE).unwrap();

    let space = ContainedSpace::from_file(&path).unwrap();
    assert_eq!(space.name, "services");
    assert_eq!(space.kind, SpaceKind::Service);
    assert!(space.namespaces.contains(CloneFlags::CLONE_NEWUSER));
    assert!(space.namespaces.contains(CloneFlags::CLONE_NEWNET));
    assert_eq!(space.config_file.as_deref(), Some(path.as_path()));

    let dropped = capability::dropped_for(space.kind, &space.capabilities);
    for cap in BASIC_BUNDLE {
        assert!(dropped.contains(cap));
    }
    assert!(dropped.contains(&caps::Capability::CAP_CHOWN));
}

#[test]
fn test_space_config_too_many_capabilities() {
    let caps: Vec<String> = (0..65)
        .map(|_| r#"{"type": "CAP_CHOWN"}"#.to_string())
        .collect();
    let json = format!(
        r#"{{"version": "0.1", "target": "all", "name": "s", "capabilities": [{}]}}"#,
        caps.join(",")
    );
    assert!(matches!(
        SpaceConfig::from_json(&json),
        Err(LxceError::Config(_))
    ));
}

#[test]
fn test_space_config_unknown_capability() {
    let json = r#"{"version": "0.1", "target": "all", "name": "s",
                   "capabilities": [{"type": "CAP_FLY"}]}"#;
    assert!(SpaceConfig::from_json(json).is_err());
}

#[test]
fn test_oversized_config_rejected() {
    let dir = setup_test_env();
    let path = dir.path().join("huge.json");
    fs::write(&path, vec![b' '; CONFIG_MAX_SIZE as usize + 1]).unwrap();
    assert!(matches!(
        SpaceConfig::from_file(&path),
        Err(LxceError::Config(_))
    ));
}

#[test]
fn test_manifest_file() {
    let dir = setup_test_env();
    let path = dir.path().join("manifest.json");
    fs::write(
        &path,
        r#"{
            "version": "0.1",
            "target": "all",
            "capps": [
                {"name": "wimc", "tag": "0.1", "contained": "services", "restart": true},
                {"name": "noded", "tag": "latest", "contained": "boot", "path": "/capps/noded"}
            ]
        }"#,
    )
    .unwrap();

    let manifest = Manifest::from_file(&path).unwrap();
    assert_eq!(manifest.capps.len(), 2);
    assert!(manifest.capps[0].restart);
    assert_eq!(
        manifest.capps[1].bundle_path().unwrap().to_str(),
        Some("/capps/noded")
    );
}

#[test]
fn test_app_config_rejects_empty_exec() {
    assert!(AppConfig::from_json(r#"{"process": {"exec": ""}}"#).is_err());
    assert!(AppConfig::from_json(r#"{"namespaces": []}"#).is_err());
}

#[test]
fn test_engine_loads_spaces() {
    let dir = setup_test_env();
    let space = dir.path().join("services.json");
    fs::write(&space, SERVICE_SPACE).unwrap();
    let config = dir.path().join("lxce.toml");
    fs::write(
        &config,
        format!(
            r#"
            [config]
            status_file = "{}"
            level = "INFO"
            manifest = "{}"
            spaces = ["{}"]
            poll_interval_ms = 250

            [user_ns]
            offset = 200000
            count = 1000
            "#,
            dir.path().join("lxce.status").display(),
            dir.path().join("manifest.json").display(),
            space.display()
        ),
    )
    .unwrap();

    let engine = Engine::load(&config).unwrap();
    assert_eq!(engine.spaces().len(), 1);
    assert_eq!(engine.config().user_ns.offset, 200000);
    assert_eq!(engine.config().poll_interval().as_millis(), 250);
}
