// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock service manager for testing.
//!
//! Keeps units in memory and flips their active flag on start/stop without
//! touching any real service manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::systemd::{ServiceManager, ServiceState};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
struct MockUnit {
    contents: String,
    enabled: bool,
    active: bool,
    failed: bool,
}

/// Mock service manager for testing.
#[derive(Default)]
pub struct MockServiceManager {
    units: Mutex<HashMap<String, MockUnit>>,
    /// If true, `start` fails and marks the unit failed.
    pub fail_start: AtomicBool,
}

impl MockServiceManager {
    /// Create an empty mock manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent starts fail (or succeed again).
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Installed unit file contents.
    pub async fn unit_contents(&self, unit: &str) -> Option<String> {
        self.units.lock().await.get(unit).map(|u| u.contents.clone())
    }

    /// Whether a unit is installed.
    pub async fn is_installed(&self, unit: &str) -> bool {
        self.units.lock().await.contains_key(unit)
    }

    /// Simulate the service manager starting or stopping a unit on its own.
    pub async fn set_active(&self, unit: &str, active: bool) {
        if let Some(u) = self.units.lock().await.get_mut(unit) {
            u.active = active;
            u.failed = false;
        }
    }

    fn missing(unit: &str) -> Error {
        Error::SupervisionFailure {
            message: format!("Unit {} not found", unit),
            hint: "install the unit first".to_string(),
        }
    }
}

#[async_trait]
impl ServiceManager for MockServiceManager {
    fn manager_type(&self) -> &'static str {
        "mock"
    }

    async fn install(&self, unit: &str, contents: &str) -> Result<()> {
        let mut units = self.units.lock().await;
        units.entry(unit.to_string()).or_default().contents = contents.to_string();
        Ok(())
    }

    async fn uninstall(&self, unit: &str) -> Result<()> {
        self.units.lock().await.remove(unit);
        Ok(())
    }

    async fn enable(&self, unit: &str) -> Result<()> {
        let mut units = self.units.lock().await;
        let u = units.get_mut(unit).ok_or_else(|| Self::missing(unit))?;
        u.enabled = true;
        Ok(())
    }

    async fn disable(&self, unit: &str) -> Result<()> {
        if let Some(u) = self.units.lock().await.get_mut(unit) {
            u.enabled = false;
        }
        Ok(())
    }

    async fn start(&self, unit: &str) -> Result<()> {
        let mut units = self.units.lock().await;
        let u = units.get_mut(unit).ok_or_else(|| Self::missing(unit))?;
        if self.fail_start.load(Ordering::SeqCst) {
            u.active = false;
            u.failed = true;
            return Err(Error::SupervisionFailure {
                message: format!("Job for {} failed", unit),
                hint: "see the unit journal".to_string(),
            });
        }
        u.active = true;
        u.failed = false;
        Ok(())
    }

    async fn stop(&self, unit: &str) -> Result<()> {
        if let Some(u) = self.units.lock().await.get_mut(unit) {
            u.active = false;
        }
        Ok(())
    }

    async fn query(&self, unit: &str) -> Result<ServiceState> {
        let units = self.units.lock().await;
        Ok(match units.get(unit) {
            Some(u) => ServiceState {
                enabled: u.enabled,
                active: u.active,
                sub_state: if u.active {
                    "running"
                } else if u.failed {
                    "failed"
                } else {
                    "dead"
                }
                .to_string(),
            },
            None => ServiceState {
                sub_state: "dead".to_string(),
                ..Default::default()
            },
        })
    }
}
