//! Periodic hygiene over the cache tier.
//!
//! The scheduler scans the live sessions and clears the ones left with zero
//! turns, typically the residue of aborted requests that set a title but
//! never recorded a message. It also drives scan-based expiry for the
//! in-process fallback cache, which has no native TTL enforcement. Failures
//! are collected into the report and never crash the loop.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheMode;
use crate::coordinator::SessionCoordinator;

/// Default time between cleanup passes.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);

/// Default delay before the first pass after startup.
pub const DEFAULT_STARTUP_DELAY: Duration = Duration::from_secs(30);

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Number of zero-turn sessions cleared.
    pub cleaned: usize,
    /// Errors encountered during the pass, one message per failure.
    pub errors: Vec<String>,
}

/// Background task that periodically clears empty sessions.
pub struct MaintenanceScheduler {
    coordinator: Arc<SessionCoordinator>,
    interval: Duration,
    startup_delay: Duration,
}

impl MaintenanceScheduler {
    /// Creates a scheduler with the default timing.
    pub fn new(coordinator: Arc<SessionCoordinator>) -> Self {
        Self::with_timing(coordinator, DEFAULT_INTERVAL, DEFAULT_STARTUP_DELAY)
    }

    /// Creates a scheduler with explicit timing.
    pub fn with_timing(
        coordinator: Arc<SessionCoordinator>,
        interval: Duration,
        startup_delay: Duration,
    ) -> Self {
        Self {
            coordinator,
            interval,
            startup_delay,
        }
    }

    /// Spawns the scheduler loop: one pass shortly after startup, then one
    /// per interval, forever.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(self.startup_delay).await;
            loop {
                let report = self.run_once().await;
                if !report.errors.is_empty() {
                    warn!(
                        cleaned = report.cleaned,
                        errors = report.errors.len(),
                        "cleanup pass finished with errors"
                    );
                }
                tokio::time::sleep(self.interval).await;
            }
        })
    }

    /// Runs one cleanup pass and reports the outcome. Never fails.
    pub async fn run_once(&self) -> CleanupReport {
        let mut report = CleanupReport {
            cleaned: 0,
            errors: Vec::new(),
        };

        if self.coordinator.cache_mode() == CacheMode::InProcess {
            match self.coordinator.evict_expired_cache_entries().await {
                Ok(evicted) if evicted > 0 => {
                    debug!(evicted, "evicted expired fallback cache entries");
                }
                Ok(_) => {}
                Err(e) => report.errors.push(format!("expiry scan failed: {e}")),
            }
        }

        let sessions = match self.coordinator.list_active_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                report.errors.push(format!("listing active sessions failed: {e}"));
                return report;
            }
        };

        for summary in sessions {
            if summary.turn_count != 0 {
                continue;
            }
            match self.coordinator.clear_session(summary.session_id).await {
                Ok(()) => report.cleaned += 1,
                Err(e) => report.errors.push(format!(
                    "clearing session {} failed: {e}",
                    summary.session_id
                )),
            }
        }

        info!(cleaned = report.cleaned, "cleanup pass complete");
        report
    }
}
