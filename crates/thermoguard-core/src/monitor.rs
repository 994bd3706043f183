//! Monitoring task lifecycle.
//!
//! Each monitored (device, detector) pair is one `tokio` task. Stopping is
//! cooperative: the task polls its [`CancelFlag`] at the top of every cycle,
//! so a stop request is honored within one cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::error::{GuardError, Result};

/// Shared cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a monitoring task did before it ended.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorReport {
    pub key: String,
    pub cycles: u64,
    pub missed_samples: u64,
    pub events: u64,
    /// Set when the task ended abnormally (panic).
    pub error: Option<String>,
}

pub struct MonitorHandle {
    key: String,
    cancel: CancelFlag,
    join: JoinHandle<MonitorReport>,
}

impl MonitorHandle {
    pub(crate) fn new(key: String, cancel: CancelFlag, join: JoinHandle<MonitorReport>) -> Self {
        Self { key, cancel, join }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Request the task to stop at its next cycle boundary.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the task to end on its own.
    pub async fn join(self) -> MonitorReport {
        match self.join.await {
            Ok(report) => report,
            Err(e) => MonitorReport {
                key: self.key,
                error: Some(e.to_string()),
                ..Default::default()
            },
        }
    }

    pub async fn shutdown(self) -> MonitorReport {
        self.stop();
        self.join().await
    }
}

/// Running monitors of one detector, keyed by device (and operation).
pub(crate) struct MonitorSet {
    detector: &'static str,
    handles: Mutex<HashMap<String, MonitorHandle>>,
}

impl MonitorSet {
    pub(crate) fn new(detector: &'static str) -> Self {
        Self {
            detector,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn `task` under `key` unless a live monitor already owns that key.
    pub(crate) fn start<F>(&self, key: String, task: impl FnOnce(CancelFlag) -> F) -> Result<()>
    where
        F: std::future::Future<Output = MonitorReport> + Send + 'static,
    {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if handles.get(&key).is_some_and(|h| !h.is_finished()) {
            return Err(GuardError::AlreadyMonitoring {
                detector: self.detector,
                key,
            });
        }
        let cancel = CancelFlag::new();
        let join = tokio::spawn(task(cancel.clone()));
        log::info!("{} monitor started for {key}", self.detector);
        handles.insert(key.clone(), MonitorHandle::new(key, cancel, join));
        Ok(())
    }

    pub(crate) async fn stop(&self, key: &str) -> Option<MonitorReport> {
        let handle = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)?;
        let report = handle.shutdown().await;
        log::info!(
            "{} monitor stopped for {key} after {} cycles",
            self.detector,
            report.cycles
        );
        Some(report)
    }

    pub(crate) fn active(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub(crate) async fn stop_all(&self) -> Vec<MonitorReport> {
        let handles: Vec<MonitorHandle> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, h)| h)
            .collect();
        for h in &handles {
            h.stop();
        }
        let mut reports = Vec::with_capacity(handles.len());
        for h in handles {
            reports.push(h.join().await);
        }
        reports
    }
}
