//! Plugin health checks.
//!
//! A [`HealthManager`] holds the named health checks registered with the
//! plugin. Periodic checks run on their own ticker task and record the
//! latest result; the Health RPC summarises all checks at query time. The
//! runtime itself registers a single check (scheduler liveness); plugins may
//! register more.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::errors::{PluginError, PluginResult};
use crate::output::rfc3339_now;
use crate::stop::StopSignal;

/// Type name for periodically evaluated checks.
pub const TYPE_PERIODIC: &str = "periodic";

/// A point-in-time view of one health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckStatus {
    pub name: String,
    pub ok: bool,
    pub message: String,
    pub timestamp: String,
    pub kind: String,
}

struct CheckState {
    err: Option<String>,
    last_update: String,
}

/// Latest result of a single health check. Safe for concurrent update and
/// read.
pub struct Checker {
    kind: &'static str,
    state: Mutex<CheckState>,
}

impl Checker {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            state: Mutex::new(CheckState {
                err: None,
                last_update: String::new(),
            }),
        }
    }

    /// Record the outcome of one evaluation.
    pub fn update(&self, result: Result<(), String>) {
        let mut state = self.state.lock();
        state.last_update = rfc3339_now();
        state.err = result.err();
    }

    fn status(&self, name: &str) -> CheckStatus {
        let state = self.state.lock();
        CheckStatus {
            name: name.to_string(),
            ok: state.err.is_none(),
            message: state.err.clone().unwrap_or_default(),
            timestamp: state.last_update.clone(),
            kind: self.kind.to_string(),
        }
    }
}

/// The collection of health checks registered with a plugin instance.
#[derive(Default)]
pub struct HealthManager {
    checks: Mutex<HashMap<String, Arc<Checker>>>,
}

impl HealthManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a checker under a unique name.
    pub fn register(&self, name: impl Into<String>, checker: Arc<Checker>) -> PluginResult<()> {
        let name = name.into();
        let mut checks = self.checks.lock();
        if checks.contains_key(&name) {
            return Err(PluginError::HealthCheckExists(name));
        }
        checks.insert(name, checker);
        Ok(())
    }

    /// Register a check evaluated on the given interval until stopped.
    /// The first evaluation happens immediately.
    pub fn register_periodic<F>(
        &self,
        name: impl Into<String>,
        interval: Duration,
        check: F,
        stop: StopSignal,
    ) -> PluginResult<JoinHandle<()>>
    where
        F: Fn() -> Result<(), String> + Send + Sync + 'static,
    {
        let name = name.into();
        let checker = Arc::new(Checker::new(TYPE_PERIODIC));
        self.register(name.clone(), checker.clone())?;
        debug!(%name, ?interval, "new periodic health check");

        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.stopped() => break,
                    _ = ticker.tick() => checker.update(check()),
                }
            }
        }))
    }

    /// Current status of every registered check, sorted by name.
    pub fn statuses(&self) -> Vec<CheckStatus> {
        let checks = self.checks.lock();
        let mut statuses: Vec<_> = checks
            .iter()
            .map(|(name, checker)| checker.status(name))
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn count(&self) -> usize {
        self.checks.lock().len()
    }

    /// True when every check is passing. An empty catalog is healthy.
    pub fn healthy(&self) -> bool {
        self.statuses().iter().all(|s| s.ok)
    }
}
