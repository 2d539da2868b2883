//! Periodic liveness probing of the reader backend.
//!
//! The monitor owns the only writer of the connection status. Everyone
//! else (the read controller, the UI) holds a `watch` receiver.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::core::backend::ReaderBackend;
use crate::core::config::ClientConfig;
use crate::core::state::ConnectionStatus;

/// Latest probe outcome as published to subscribers
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: ConnectionStatus,
    pub checked_at: Option<DateTime<Utc>>,
}

/// State shared between the monitor and its timer task
struct Prober {
    backend: Arc<dyn ReaderBackend>,
    probe_timeout: Duration,
    report: watch::Sender<HealthReport>,
    in_flight: AtomicBool,
}

/// Clears the outstanding-probe flag even if the probe future is dropped
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Prober {
    async fn probe(&self) -> Option<ConnectionStatus> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            log::debug!("Health probe still outstanding, skipping");
            return None;
        }
        let _guard = InFlightGuard(&self.in_flight);

        let status = match time::timeout(self.probe_timeout, self.backend.health()).await {
            Ok(Ok(())) => ConnectionStatus::Online,
            Ok(Err(e)) => {
                log::debug!("Health probe failed: {e}");
                ConnectionStatus::Offline
            }
            Err(_) => {
                log::debug!("Health probe timed out after {:?}", self.probe_timeout);
                ConnectionStatus::Offline
            }
        };

        self.publish(status);
        Some(status)
    }

    fn publish(&self, status: ConnectionStatus) {
        self.report.send_modify(|report| {
            if report.status != status {
                log::info!("Reader backend is now {status}");
            }
            report.status = status;
            report.checked_at = Some(Utc::now());
        });
    }
}

/// Keeps a best-effort view of backend reachability
pub struct HealthMonitor {
    prober: Arc<Prober>,
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn new(backend: Arc<dyn ReaderBackend>, config: &ClientConfig) -> Self {
        Self::with_timing(backend, config.probe_interval(), config.probe_timeout())
    }

    pub fn with_timing(
        backend: Arc<dyn ReaderBackend>,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        let (report, _) = watch::channel(HealthReport::default());
        Self {
            prober: Arc::new(Prober {
                backend,
                probe_timeout,
                report,
                in_flight: AtomicBool::new(false),
            }),
            interval,
            task: None,
        }
    }

    /// Receiver that observes every published probe outcome
    pub fn subscribe(&self) -> watch::Receiver<HealthReport> {
        self.prober.report.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.prober.report.borrow().status
    }

    pub fn report(&self) -> HealthReport {
        *self.prober.report.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Probe now, then every interval. Calling it again while running does nothing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) {
        if self.is_running() {
            log::debug!("Health monitor already running");
            return;
        }

        let prober = Arc::clone(&self.prober);
        let interval = self.interval;
        log::info!("Starting health monitor ({interval:?} interval)");

        self.task = Some(tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            // A tick that lands while a probe is outstanding is dropped
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                prober.probe().await;
            }
        }));
    }

    /// Cancel scheduled probing. Once this returns no probe can publish again.
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            // Wait for the task to be torn down so an in-flight probe can't publish late
            let _ = task.await;
            log::info!("Health monitor stopped");
        }
    }

    /// Run a single probe immediately.
    ///
    /// Returns `None` when another probe is still outstanding; the status is
    /// left untouched in that case.
    pub async fn probe(&self) -> Option<ConnectionStatus> {
        self.prober.probe().await
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
