mod common;

use std::time::Duration;

use tokio::time::sleep;

use unit_supervisor::{Action, ActionError, SupervisorHandleError, UnitState};

use common::{
    shutdown, start_supervisor, wait_for_state, write_unit, HOSTNAME, LONG_RUNNER,
};

#[tokio::test]
async fn test_custom_action_output() {
    let root = tempfile::tempdir().unwrap();
    write_unit(
        root.path(),
        "web",
        LONG_RUNNER,
        Some("autostart: false\nactions:\n  greet: echo hello from $(basename $(pwd))\n"),
    );
    let handle = start_supervisor(&root);

    let status = handle.status("web").await.unwrap();
    assert_eq!(status.actions, ["start", "greet"]);

    let output = handle.invoke("web", "greet").await.unwrap().unwrap();
    assert!(output.starts_with("Executing: "), "unexpected output: {output}");
    assert!(output.contains("hello from web"), "unexpected output: {output}");

    // Custom actions do not touch the unit's state.
    assert_eq!(handle.status("web").await.unwrap().state, UnitState::Stopped);

    shutdown(&handle).await;
}

#[tokio::test]
async fn test_illegal_actions_are_rejected() {
    let root = tempfile::tempdir().unwrap();
    write_unit(root.path(), "idle", LONG_RUNNER, Some("autostart: false\n"));
    let handle = start_supervisor(&root);

    let err = handle.invoke("idle", "stop").await.unwrap_err();
    assert!(matches!(
        err,
        SupervisorHandleError::Action(ActionError::Rejected {
            action: Action::Stop,
            state: UnitState::Stopped,
        })
    ));

    let err = handle.invoke("idle", "dance").await.unwrap_err();
    assert!(matches!(
        err,
        SupervisorHandleError::Action(ActionError::Unknown(ref name)) if name == "dance"
    ));

    assert_eq!(handle.status("idle").await.unwrap().state, UnitState::Stopped);

    shutdown(&handle).await;
}

#[tokio::test]
async fn test_unknown_unit() {
    let root = tempfile::tempdir().unwrap();
    write_unit(root.path(), "worker", LONG_RUNNER, None);
    let handle = start_supervisor(&root);

    assert!(matches!(
        handle.invoke("ghost", "start").await,
        Err(SupervisorHandleError::UnitNotFound(name)) if name == "ghost"
    ));
    assert!(matches!(
        handle.status("ghost").await,
        Err(SupervisorHandleError::UnitNotFound(_))
    ));
    assert!(matches!(
        handle.list_runs("ghost").await,
        Err(SupervisorHandleError::UnitNotFound(_))
    ));

    shutdown(&handle).await;
}

#[tokio::test]
async fn test_multiplexed_units_take_turns() {
    let root = tempfile::tempdir().unwrap();
    write_unit(root.path(), "a", LONG_RUNNER, Some("multiplexed: true\n"));
    write_unit(root.path(), "b", LONG_RUNNER, Some("multiplexed: true\n"));
    write_unit(root.path(), "plain", LONG_RUNNER, None);
    let handle = start_supervisor(&root);

    // Multiplexed units never autostart; ordinary ones do.
    wait_for_state(&handle, "plain", UnitState::Running).await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.status("a").await.unwrap().state, UnitState::Stopped);
    assert_eq!(handle.status("b").await.unwrap().state, UnitState::Stopped);

    handle.invoke("a", "start").await.unwrap();
    wait_for_state(&handle, "a", UnitState::Running).await;

    handle.invoke("b", "start").await.unwrap();
    wait_for_state(&handle, "b", UnitState::Running).await;
    let a = wait_for_state(&handle, "a", UnitState::Stopped).await;
    assert_eq!(a.pid, None);
    assert_eq!(a.crashes, 0);

    // The ordinary unit is not part of the group.
    assert_eq!(handle.status("plain").await.unwrap().state, UnitState::Running);

    shutdown(&handle).await;
}

#[tokio::test]
async fn test_status_tuples_carry_hostname() {
    let root = tempfile::tempdir().unwrap();
    write_unit(root.path(), "b", LONG_RUNNER, Some("autostart: false\n"));
    write_unit(root.path(), "a", LONG_RUNNER, None);
    let handle = start_supervisor(&root);
    wait_for_state(&handle, "a", UnitState::Running).await;

    assert_eq!(handle.hostname(), HOSTNAME);
    assert_eq!(handle.unit_names().await.unwrap(), ["a", "b"]);
    assert_eq!(
        handle.status_tuples().await.unwrap(),
        [
            (HOSTNAME.to_string(), "a".to_string(), "running".to_string()),
            (HOSTNAME.to_string(), "b".to_string(), "stopped".to_string()),
        ]
    );

    shutdown(&handle).await;
}
