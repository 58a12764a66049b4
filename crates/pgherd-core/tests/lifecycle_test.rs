// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle tests for directly supervised instances.
//!
//! Stand-in `postgres` scripts replace the real server; provisioning is mocked.

mod common;

use std::fs;

use common::{CRASHING_SERVER, HEALTHY_SERVER, TestContext, wait_until_dead};
use pgherd_core::bootstrap::{BootstrapStep, GENERATED_MARKER, MockProvisioner};
use pgherd_core::lock::InstanceLock;
use pgherd_core::supervisor::is_alive;
use pgherd_core::{CreateOptions, ErrorKind, InstanceState, RemoveOptions};

fn on_port(port: u16) -> CreateOptions {
    CreateOptions {
        port: Some(port),
        ..Default::default()
    }
}

// ============================================================================
// Create
// ============================================================================

#[tokio::test]
async fn test_create_then_status_is_stopped() {
    let ctx = TestContext::new();

    let spec = ctx.orchestrator.create("demo", on_port(5500)).await.unwrap();
    assert_eq!(spec.network.port, 5500);
    assert_eq!(spec.database.name, "demo");
    assert_eq!(spec.database.owner, "demo");
    assert_eq!(spec.database.password.len(), 32);
    let home = fs::canonicalize(&ctx.home).unwrap();
    assert_eq!(spec.storage.data_directory, home.join("instances/demo/data"));

    let conf = fs::read_to_string(spec.storage.data_directory.join("postgresql.conf")).unwrap();
    assert!(conf.starts_with(GENERATED_MARKER));
    assert!(conf.lines().any(|l| l == "port = 5500"));
    let hba = fs::read_to_string(spec.storage.data_directory.join("pg_hba.conf")).unwrap();
    assert!(hba.starts_with(GENERATED_MARKER));

    let record = ctx.orchestrator.status("demo").await.unwrap();
    assert_eq!(record.status.state, InstanceState::Stopped);
    assert_eq!(record.status.pid, None);
    assert_eq!(record.spec.database.password, spec.database.password);
}

#[tokio::test]
async fn test_create_defaults_from_name() {
    let ctx = TestContext::new();

    let spec = ctx
        .orchestrator
        .create("app-db", CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(spec.database.name, "app_db");
    assert_eq!(spec.database.owner, "app_db");
    assert_eq!(spec.network.port, 5433);
    assert_eq!(spec.version, "16");

    let next = ctx
        .orchestrator
        .create("other", CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(next.network.port, 5434);
}

#[tokio::test]
async fn test_create_rejects_invalid_name() {
    let ctx = TestContext::new();
    let err = ctx
        .orchestrator
        .create("Bad_Name", CreateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSpec);
    assert_eq!(ctx.provisioner.init_calls(), 0);
}

#[tokio::test]
async fn test_create_existing_name_conflicts() {
    let ctx = TestContext::new();
    ctx.orchestrator.create("demo", on_port(5500)).await.unwrap();

    let err = ctx.orchestrator.create("demo", on_port(5501)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(ctx.stored("demo").await.unwrap().spec.network.port, 5500);
}

#[tokio::test]
async fn test_port_conflict_touches_nothing() {
    let ctx = TestContext::new();
    ctx.orchestrator.create("a", on_port(5600)).await.unwrap();

    let err = ctx.orchestrator.create("b", on_port(5600)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(err.to_string().contains("'a'"));
    assert!(!ctx.home.join("instances/b").exists());
    assert!(ctx.stored("b").await.is_none());
    assert_eq!(ctx.provisioner.init_calls(), 1);
}

#[tokio::test]
async fn test_missing_server_binaries() {
    let ctx = TestContext::new();
    fs::remove_file(ctx.bin_dir.join("initdb")).unwrap();

    let err = ctx.orchestrator.create("demo", on_port(5500)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalToolMissing);
    assert!(err.to_string().contains("initdb"));
    assert!(ctx.stored("demo").await.is_none());
}

// ============================================================================
// Partial installs and foreign directories
// ============================================================================

#[tokio::test]
async fn test_failed_create_heals_on_retry() {
    let ctx =
        TestContext::with_provisioner(MockProvisioner::failing_at(BootstrapStep::Provisioning));

    let err = ctx.orchestrator.create("demo", on_port(5500)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BootstrapFailure);
    assert!(err.to_string().contains("provisioning"));
    assert!(ctx.stored("demo").await.is_none());
    let data_dir = ctx.home.join("instances/demo/data");
    assert!(data_dir.join("PG_VERSION").exists());

    ctx.provisioner.set_fail_at(None).await;
    let spec = ctx.orchestrator.create("demo", on_port(5500)).await.unwrap();
    assert_eq!(ctx.provisioner.init_calls(), 2);
    assert!(!spec.database.password.is_empty());

    let record = ctx.orchestrator.status("demo").await.unwrap();
    assert_eq!(record.status.state, InstanceState::Stopped);
}

#[tokio::test]
async fn test_failed_initdb_heals_on_retry() {
    let ctx =
        TestContext::with_provisioner(MockProvisioner::failing_at(BootstrapStep::ClusterInit));

    let err = ctx.orchestrator.create("demo", on_port(5500)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BootstrapFailure);
    assert!(err.to_string().contains("simulated failure"));

    ctx.provisioner.set_fail_at(None).await;
    ctx.orchestrator.create("demo", on_port(5500)).await.unwrap();
}

#[tokio::test]
async fn test_foreign_directory_is_left_alone() {
    let ctx = TestContext::new();
    let foreign = ctx.path("foreign");
    fs::create_dir_all(&foreign).unwrap();
    fs::write(foreign.join("notes.txt"), "keep me").unwrap();

    let options = CreateOptions {
        data_directory: Some(foreign.clone()),
        ..on_port(5500)
    };
    let err = ctx.orchestrator.create("demo", options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsafeState);
    assert!(err.to_string().contains("notes.txt") || err.to_string().contains("not created"));

    assert_eq!(fs::read_to_string(foreign.join("notes.txt")).unwrap(), "keep me");
    assert_eq!(fs::read_dir(&foreign).unwrap().count(), 1);
    assert_eq!(ctx.provisioner.init_calls(), 0);
    assert!(ctx.stored("demo").await.is_none());
}

#[tokio::test]
async fn test_stopped_foreign_cluster_is_left_alone() {
    let ctx = TestContext::new();
    let dir = ctx.path("their-cluster");
    fs::create_dir_all(dir.join("global")).unwrap();
    fs::create_dir_all(dir.join("base/1")).unwrap();
    fs::create_dir_all(dir.join("base/16384")).unwrap();
    fs::create_dir_all(dir.join("pg_wal")).unwrap();
    fs::write(dir.join("PG_VERSION"), "16\n").unwrap();
    fs::write(dir.join("postgresql.conf"), "port = 5432\n").unwrap();
    fs::write(dir.join("base/16384/2619"), "their rows").unwrap();

    let options = CreateOptions {
        data_directory: Some(dir.clone()),
        ..on_port(5500)
    };
    let err = ctx.orchestrator.create("demo", options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsafeState);

    assert_eq!(fs::read_to_string(dir.join("base/16384/2619")).unwrap(), "their rows");
    assert_eq!(fs::read_to_string(dir.join("postgresql.conf")).unwrap(), "port = 5432\n");
    assert_eq!(ctx.provisioner.init_calls(), 0);
    assert!(ctx.stored("demo").await.is_none());
}

#[tokio::test]
async fn test_directory_of_running_server_is_unsafe() {
    let ctx = TestContext::new();
    let dir = ctx.path("busy");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("PG_VERSION"), "16\n").unwrap();
    fs::write(dir.join("postmaster.pid"), format!("{}\n", std::process::id())).unwrap();

    let options = CreateOptions {
        data_directory: Some(dir.clone()),
        ..on_port(5500)
    };
    let err = ctx.orchestrator.create("demo", options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsafeState);
    assert!(dir.join("PG_VERSION").exists());
    assert!(dir.join("postmaster.pid").exists());
}

#[tokio::test]
async fn test_data_directory_of_other_instance_conflicts() {
    let ctx = TestContext::new();
    let shared = ctx.path("shared");
    let options = CreateOptions {
        data_directory: Some(shared.clone()),
        ..on_port(5500)
    };
    ctx.orchestrator.create("a", options).await.unwrap();

    let options = CreateOptions {
        data_directory: Some(shared),
        ..on_port(5501)
    };
    let err = ctx.orchestrator.create("b", options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(ctx.provisioner.init_calls(), 1);
}

#[tokio::test]
async fn test_aliased_data_directory_conflicts() {
    let ctx = TestContext::new();
    let shared = ctx.path("shared");
    let options = CreateOptions {
        data_directory: Some(shared.clone()),
        ..on_port(5500)
    };
    ctx.orchestrator.create("a", options).await.unwrap();
    fs::write(shared.join("keep-me"), "a's data").unwrap();

    fs::create_dir_all(ctx.path("sub")).unwrap();
    std::os::unix::fs::symlink(&shared, ctx.path("alias")).unwrap();

    for (port, alias) in [
        (5501, ctx.path("sub/../shared")),
        (5502, ctx.path("./shared/")),
        (5503, ctx.path("alias")),
        (5504, ctx.path("shared/nested")),
        (5505, ctx.path("alias/nested")),
    ] {
        let options = CreateOptions {
            data_directory: Some(alias.clone()),
            ..on_port(port)
        };
        let err = ctx.orchestrator.create("b", options).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict, "{}", alias.display());
    }

    assert_eq!(ctx.provisioner.init_calls(), 1);
    assert!(ctx.stored("b").await.is_none());
    assert_eq!(fs::read_to_string(shared.join("keep-me")).unwrap(), "a's data");
    assert!(shared.join("PG_VERSION").exists());
}

#[tokio::test]
async fn test_log_directory_overlap_conflicts() {
    let ctx = TestContext::new();
    let spec = ctx.orchestrator.create("a", on_port(5500)).await.unwrap();

    let options = CreateOptions {
        log_directory: Some(spec.storage.data_directory.clone()),
        ..on_port(5501)
    };
    let err = ctx.orchestrator.create("b", options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let options = CreateOptions {
        log_directory: Some(spec.storage.log_directory.clone()),
        ..on_port(5502)
    };
    let err = ctx.orchestrator.create("b", options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let options = CreateOptions {
        data_directory: Some(spec.storage.log_directory.join("data")),
        ..on_port(5503)
    };
    let err = ctx.orchestrator.create("b", options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    assert_eq!(ctx.provisioner.init_calls(), 1);
}

// ============================================================================
// Start / stop / restart
// ============================================================================

#[tokio::test]
async fn test_demo_scenario() {
    let ctx = TestContext::new();

    let spec = ctx.orchestrator.create("demo", on_port(5500)).await.unwrap();
    let conf = fs::read_to_string(spec.storage.data_directory.join("postgresql.conf")).unwrap();
    assert!(conf.contains("port = 5500"));

    let status = ctx.orchestrator.start("demo").await.unwrap();
    assert_eq!(status.state, InstanceState::Running);
    let pid = status.pid.unwrap();
    assert!(is_alive(pid));
    assert!(status.start_time.is_some());

    let record = ctx.orchestrator.status("demo").await.unwrap();
    assert_eq!(record.status.state, InstanceState::Running);
    assert_eq!(record.status.pid, Some(pid));

    let status = ctx.orchestrator.stop("demo").await.unwrap();
    assert_eq!(status.state, InstanceState::Stopped);
    assert_eq!(status.pid, None);
    assert!(wait_until_dead(pid).await);

    ctx.orchestrator
        .remove("demo", RemoveOptions::default())
        .await
        .unwrap();
    assert!(ctx.stored("demo").await.is_none());
    assert!(spec.storage.data_directory.join("PG_VERSION").exists());

    let err = ctx.orchestrator.status("demo").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_start_twice_and_stop_twice_conflict() {
    let ctx = TestContext::new();
    ctx.orchestrator.create("demo", on_port(5500)).await.unwrap();

    let err = ctx.orchestrator.stop("demo").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let pid = ctx.orchestrator.start("demo").await.unwrap().pid.unwrap();
    let err = ctx.orchestrator.start("demo").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(ctx.stored("demo").await.unwrap().status.pid, Some(pid));

    ctx.orchestrator.stop("demo").await.unwrap();
    let err = ctx.orchestrator.stop("demo").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_unknown_instance_is_not_found() {
    let ctx = TestContext::new();
    for err in [
        ctx.orchestrator.start("ghost").await.unwrap_err(),
        ctx.orchestrator.stop("ghost").await.unwrap_err(),
        ctx.orchestrator.restart("ghost").await.unwrap_err(),
        ctx.orchestrator
            .remove("ghost", RemoveOptions::default())
            .await
            .unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("ghost"));
    }
}

#[tokio::test]
async fn test_crashing_server_moves_to_error() {
    let ctx = TestContext::new();
    ctx.orchestrator.create("demo", on_port(5500)).await.unwrap();
    ctx.install_server(CRASHING_SERVER);

    let err = ctx.orchestrator.start("demo").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SupervisionFailure);
    assert!(err.to_string().contains("could not bind"));

    let record = ctx.orchestrator.status("demo").await.unwrap();
    assert_eq!(record.status.state, InstanceState::Error);
    assert_eq!(record.status.pid, None);
    assert!(record.status.last_error.is_some());

    // Error is recoverable through another start.
    ctx.install_server(HEALTHY_SERVER);
    let status = ctx.orchestrator.start("demo").await.unwrap();
    assert_eq!(status.state, InstanceState::Running);
    assert_eq!(status.last_error, None);

    ctx.orchestrator.stop("demo").await.unwrap();
}

#[tokio::test]
async fn test_restart_replaces_process() {
    let ctx = TestContext::new();
    ctx.orchestrator.create("demo", on_port(5500)).await.unwrap();
    let first = ctx.orchestrator.start("demo").await.unwrap().pid.unwrap();

    let status = ctx.orchestrator.restart("demo").await.unwrap();
    let second = status.pid.unwrap();
    assert_eq!(status.state, InstanceState::Running);
    assert_ne!(first, second);
    assert!(status.last_restart.is_some());
    assert!(wait_until_dead(first).await);
    assert!(is_alive(second));

    ctx.orchestrator.stop("demo").await.unwrap();
}

#[tokio::test]
async fn test_restart_of_stopped_instance_starts_it() {
    let ctx = TestContext::new();
    ctx.orchestrator.create("demo", on_port(5500)).await.unwrap();

    let status = ctx.orchestrator.restart("demo").await.unwrap();
    assert_eq!(status.state, InstanceState::Running);
    assert!(status.pid.is_some());

    ctx.orchestrator.stop("demo").await.unwrap();
}

// ============================================================================
// Reconciliation
// ============================================================================

#[tokio::test]
async fn test_stale_pid_is_corrected_and_persisted() {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let ctx = TestContext::new();
    ctx.orchestrator.create("demo", on_port(5500)).await.unwrap();
    let pid = ctx.orchestrator.start("demo").await.unwrap().pid.unwrap();

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
    assert!(wait_until_dead(pid).await);

    let stored = ctx.stored("demo").await.unwrap();
    assert_eq!(stored.status.state, InstanceState::Running);

    let record = ctx.orchestrator.status("demo").await.unwrap();
    assert_eq!(record.status.state, InstanceState::Stopped);
    assert_eq!(record.status.pid, None);

    let stored = ctx.stored("demo").await.unwrap();
    assert_eq!(stored.status.state, InstanceState::Stopped);
    assert_eq!(stored.status.pid, None);

    // A start works again without manual cleanup.
    ctx.orchestrator.start("demo").await.unwrap();
    ctx.orchestrator.stop("demo").await.unwrap();
}

#[tokio::test]
async fn test_list_reconciles_every_record() {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let ctx = TestContext::new();
    ctx.orchestrator.create("b", on_port(5501)).await.unwrap();
    ctx.orchestrator.create("a", on_port(5500)).await.unwrap();
    let pid = ctx.orchestrator.start("b").await.unwrap().pid.unwrap();
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
    assert!(wait_until_dead(pid).await);

    let records = ctx.orchestrator.list().await.unwrap();
    let names: Vec<&str> = records.iter().map(|r| r.name()).collect();
    assert_eq!(names, vec!["a", "b"]);
    assert!(records.iter().all(|r| r.status.state == InstanceState::Stopped));
    assert_eq!(ctx.stored("b").await.unwrap().status.state, InstanceState::Stopped);
}

#[tokio::test]
async fn test_list_empty_home() {
    let ctx = TestContext::new();
    assert!(ctx.orchestrator.list().await.unwrap().is_empty());
}

// ============================================================================
// Locking
// ============================================================================

#[tokio::test]
async fn test_held_lock_rejects_mutations_but_not_reads() {
    let ctx = TestContext::new();
    ctx.orchestrator.create("demo", on_port(5500)).await.unwrap();

    let lock = InstanceLock::acquire(&ctx.home.join("locks"), "demo").unwrap();
    let err = ctx.orchestrator.start("demo").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = ctx
        .orchestrator
        .remove("demo", RemoveOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let record = ctx.orchestrator.status("demo").await.unwrap();
    assert_eq!(record.status.state, InstanceState::Stopped);
    drop(lock);

    ctx.orchestrator
        .remove("demo", RemoveOptions::default())
        .await
        .unwrap();
}

// ============================================================================
// Remove, info, logs
// ============================================================================

#[tokio::test]
async fn test_remove_running_requires_force() {
    let ctx = TestContext::new();
    ctx.orchestrator.create("demo", on_port(5500)).await.unwrap();
    let pid = ctx.orchestrator.start("demo").await.unwrap().pid.unwrap();

    let err = ctx
        .orchestrator
        .remove("demo", RemoveOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(ctx.stored("demo").await.is_some());
    assert!(is_alive(pid));

    ctx.orchestrator
        .remove(
            "demo",
            RemoveOptions {
                backup: true,
                force: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(ctx.backup.calls(), 1);
    assert!(ctx.stored("demo").await.is_none());
    assert!(wait_until_dead(pid).await);
    assert!(ctx.home.join("instances/demo/data/PG_VERSION").exists());
}

#[tokio::test]
async fn test_connection_info() {
    let ctx = TestContext::new();
    let spec = ctx.orchestrator.create("demo", on_port(5500)).await.unwrap();

    let info = ctx.orchestrator.connection_info("demo").await.unwrap();
    assert_eq!(info.host, "localhost");
    assert_eq!(info.port, 5500);
    assert_eq!(info.user, "demo");
    assert_eq!(info.password, spec.database.password);
    assert_eq!(info.socket_directory, spec.storage.data_directory.join("sockets"));
    assert_eq!(
        info.url,
        format!("postgresql://demo:{}@localhost:5500/demo", spec.database.password)
    );
}

#[tokio::test]
async fn test_logs_tail_server_output() {
    let ctx = TestContext::new();
    ctx.orchestrator.create("demo", on_port(5500)).await.unwrap();

    let err = ctx.orchestrator.logs("demo", 10).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    ctx.orchestrator.start("demo").await.unwrap();
    let logs = ctx.orchestrator.logs("demo", 10).await.unwrap();
    assert!(logs.contains("ready to accept connections"));

    ctx.orchestrator.stop("demo").await.unwrap();
}
