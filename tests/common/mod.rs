use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::{sleep, Instant};
use unit_supervisor::{
    OsFamily, OsInfo, SupervisorBuilder, SupervisorHandle, UnitState, UnitStatus,
};

// Runs until terminated; `exec` so the signal reaches the sleeping process.
#[allow(unused)]
pub const LONG_RUNNER: &str = "exec sleep 30";

#[allow(unused)]
pub const HOSTNAME: &str = "testhost";

// Writes `<root>/<name>/run` (and `run.conf` when given).
#[allow(unused)]
pub fn write_unit(root: &Path, name: &str, script: &str, conf: Option<&str>) {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    let run = dir.join("run");
    fs::write(&run, format!("#!/bin/sh\n{script}\n")).unwrap();
    fs::set_permissions(&run, fs::Permissions::from_mode(0o755)).unwrap();
    if let Some(conf) = conf {
        fs::write(dir.join("run.conf"), conf).unwrap();
    }
}

// Builder with intervals short enough for tests
#[allow(unused)]
pub fn test_builder(root: &Path) -> SupervisorBuilder {
    SupervisorBuilder::new(root)
        .with_os_info(OsInfo::new(HOSTNAME, OsFamily::Linux))
        .with_health_check_interval(Duration::from_millis(50))
        .with_shutdown_poll_interval(Duration::from_millis(50))
        .with_shutdown_attempts(40)
}

// Helper function to build and run a supervisor over a prepared root
#[allow(unused)]
pub fn start_supervisor(root: &TempDir) -> SupervisorHandle {
    test_builder(root.path()).build().unwrap().run()
}

#[allow(unused)]
pub async fn wait_until<F>(handle: &SupervisorHandle, unit: &str, what: &str, cond: F) -> UnitStatus
where
    F: Fn(&UnitStatus) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = handle.status(unit).await.unwrap();
        if cond(&status) {
            return status;
        }
        assert!(
            Instant::now() < deadline,
            "{unit} never became {what}, last status: {status:?}"
        );
        sleep(Duration::from_millis(20)).await;
    }
}

#[allow(unused)]
pub async fn wait_for_state(handle: &SupervisorHandle, unit: &str, state: UnitState) -> UnitStatus {
    wait_until(handle, unit, &state.to_string(), |status| status.state == state).await
}

// Shuts the supervisor down so no test leaves processes behind.
#[allow(unused)]
pub async fn shutdown(handle: &SupervisorHandle) {
    handle.shutdown().unwrap();
    handle.wait().await.unwrap();
}
