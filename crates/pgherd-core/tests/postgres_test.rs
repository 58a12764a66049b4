// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests against real PostgreSQL executables.
//!
//! Skipped unless `initdb` and `postgres` can be located for the version in
//! `PGHERD_TEST_PG_VERSION` (default `16`). `initdb` refuses to run as root, so these
//! tests also skip under root.

use std::sync::Arc;
use std::time::Duration;

use pgherd_core::locator::{BinaryLocator, SearchPaths};
use pgherd_core::supervisor::{MockServiceManager, SupervisorConfig};
use pgherd_core::{CreateOptions, InstanceState, Orchestrator, RemoveOptions};
use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, Connection};

fn test_version() -> String {
    std::env::var("PGHERD_TEST_PG_VERSION").unwrap_or_else(|_| "16".to_string())
}

/// Helper macro to skip tests when no usable PostgreSQL installation is present.
macro_rules! skip_if_no_postgres {
    () => {
        if nix::unistd::geteuid().is_root() {
            eprintln!("Skipping test: initdb cannot run as root");
            return;
        }
        let locator = BinaryLocator::new(SearchPaths::default());
        if let Err(e) = locator.server_binaries(&test_version()) {
            eprintln!("Skipping test: {}", e);
            return;
        }
    };
}

fn real_orchestrator(home: &std::path::Path) -> Orchestrator {
    Orchestrator::builder(home)
        .service_manager(Arc::new(MockServiceManager::new()))
        .supervisor_config(SupervisorConfig {
            settle_time: Duration::from_secs(2),
            ..SupervisorConfig::default()
        })
        .build()
}

#[tokio::test]
async fn test_create_start_connect_as_owner() {
    skip_if_no_postgres!();

    let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
    let orchestrator = real_orchestrator(&temp_dir.path().join("home"));

    let spec = orchestrator
        .create(
            "real-pg",
            CreateOptions {
                port: Some(55432),
                version: Some(test_version()),
                ..Default::default()
            },
        )
        .await
        .expect("create against real initdb");
    assert_eq!(spec.database.name, "real_pg");

    let status = orchestrator.start("real-pg").await.expect("start");
    assert_eq!(status.state, InstanceState::Running);

    let info = orchestrator.connection_info("real-pg").await.unwrap();
    let mut conn = PgConnectOptions::new_without_pgpass()
        .socket(&info.socket_directory)
        .port(info.port)
        .username(&info.user)
        .password(&info.password)
        .database(&info.database)
        .connect()
        .await
        .expect("connect as owner");

    let user: String = sqlx::query_scalar("SELECT current_user::text")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(user, "real_pg");

    sqlx::raw_sql("CREATE TABLE public.t (id int); INSERT INTO public.t VALUES (1)")
        .execute(&mut conn)
        .await
        .expect("owner can create tables in public");
    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM public.t")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(count, 1);
    conn.close().await.unwrap();

    let record = orchestrator.status("real-pg").await.unwrap();
    assert_eq!(record.status.state, InstanceState::Running);

    let status = orchestrator.stop("real-pg").await.unwrap();
    assert_eq!(status.state, InstanceState::Stopped);

    orchestrator
        .remove("real-pg", RemoveOptions::default())
        .await
        .unwrap();
    assert!(orchestrator.list().await.unwrap().is_empty());
}
