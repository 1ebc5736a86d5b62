mod common;

use std::fs;

use unit_supervisor::{SupervisorBuilder, SupervisorError, UnitState};

use common::{test_builder, write_unit, LONG_RUNNER};

#[test]
fn test_missing_root() {
    let root = tempfile::tempdir().unwrap();
    let result = SupervisorBuilder::new(root.path().join("nope")).build();
    assert!(matches!(result, Err(SupervisorError::RootNotFound(_))));
}

#[test]
fn test_root_without_units() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir(root.path().join("empty")).unwrap();
    let result = SupervisorBuilder::new(root.path()).build();
    assert!(matches!(result, Err(SupervisorError::NoRunnableUnits(_))));
}

#[test]
fn test_broken_run_conf_skips_unit() {
    let root = tempfile::tempdir().unwrap();
    write_unit(root.path(), "good", LONG_RUNNER, Some("autostart: false\n"));
    write_unit(root.path(), "bad-regex", LONG_RUNNER, Some("filter: '('\n"));
    write_unit(root.path(), "bad-yaml", LONG_RUNNER, Some("actions: [\n"));

    let supervisor = test_builder(root.path()).build().unwrap();
    assert_eq!(supervisor.unit_names(), ["good"]);
}

#[test]
fn test_only_broken_units_is_an_error() {
    let root = tempfile::tempdir().unwrap();
    write_unit(root.path(), "bad", LONG_RUNNER, Some("heartbeat_timeout: -1\n"));
    let result = test_builder(root.path()).build();
    assert!(matches!(result, Err(SupervisorError::NoRunnableUnits(_))));
}

#[test]
fn test_unit_subset() {
    let root = tempfile::tempdir().unwrap();
    write_unit(root.path(), "a", LONG_RUNNER, None);
    write_unit(root.path(), "b", LONG_RUNNER, None);
    write_unit(root.path(), "c", LONG_RUNNER, None);

    let supervisor = test_builder(root.path())
        .with_units(["c", "a", "zzz"])
        .build()
        .unwrap();
    assert_eq!(supervisor.unit_names(), ["a", "c"]);

    let a = supervisor.lookup("a").unwrap();
    assert_eq!(a.state(), UnitState::Stopped);
    assert_eq!(a.dir(), supervisor.root().join("a"));
    assert!(supervisor.lookup("b").is_none());
}

#[test]
fn test_run_conf_is_loaded() {
    let root = tempfile::tempdir().unwrap();
    write_unit(
        root.path(),
        "web",
        LONG_RUNNER,
        Some(
            "heartbeat_timeout: 1.5\nautorestart: false\ncrash_limit: 7\nmultiplexed: true\n\
             actions:\n  reload: kill -HUP $(cat pid)\n",
        ),
    );

    let supervisor = test_builder(root.path()).build().unwrap();
    let web = supervisor.lookup("web").unwrap();
    let config = web.config();
    assert_eq!(config.heartbeat_timeout, Some(std::time::Duration::from_millis(1500)));
    assert!(config.autostart);
    assert!(!config.autorestart);
    assert_eq!(config.crash_limit, 7);
    assert!(web.is_multiplexed());
    assert_eq!(web.actions(), ["start", "reload"]);
}
