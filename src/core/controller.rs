//! Single-flight card read operation.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::sync::watch;
use tokio::time;

use crate::core::backend::{BackendError, ReaderBackend};
use crate::core::config::ClientConfig;
use crate::core::health::HealthReport;
use crate::core::protocol::ReadReply;
use crate::core::state::{
    CardRecord, ConnectionStatus, OperationError, OperationState, StatusSnapshot,
};

/// Map the outcome of one read request onto the operation state
pub fn resolve_read(result: Result<ReadReply, BackendError>) -> OperationState {
    match result {
        Ok(ReadReply::Card(card)) => OperationState::Success(card),
        Ok(ReadReply::Refused(message)) => OperationState::Error(OperationError::backend(message)),
        Err(e) => {
            log::warn!("Card read did not reach the backend: {e}");
            OperationState::Error(OperationError::transport())
        }
    }
}

/// Drives at most one card read at a time.
///
/// The result of a triggered read is delivered back through a oneshot
/// channel and applied by [`poll`](Self::poll) or [`settle`](Self::settle),
/// so all state changes happen on the owner's side.
pub struct CardReadController {
    backend: Arc<dyn ReaderBackend>,
    health: watch::Receiver<HealthReport>,
    read_timeout: Duration,
    state: OperationState,
    completed_at: Option<DateTime<Utc>>,
    pending: Option<PendingRead>,
}

struct PendingRead {
    result: oneshot::Receiver<OperationState>,
    started: Instant,
}

impl CardReadController {
    pub fn new(
        backend: Arc<dyn ReaderBackend>,
        health: watch::Receiver<HealthReport>,
        config: &ClientConfig,
    ) -> Self {
        Self::with_timeout(backend, health, config.read_timeout())
    }

    pub fn with_timeout(
        backend: Arc<dyn ReaderBackend>,
        health: watch::Receiver<HealthReport>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            health,
            read_timeout,
            state: OperationState::Idle,
            completed_at: None,
            pending: None,
        }
    }

    pub fn state(&self) -> &OperationState {
        &self.state
    }

    pub fn card(&self) -> Option<&CardRecord> {
        self.state.card()
    }

    pub fn error(&self) -> Option<&OperationError> {
        self.state.error()
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.health.borrow().status
    }

    pub fn is_reading(&self) -> bool {
        self.state.is_reading()
    }

    /// Whether a trigger would currently be accepted
    pub fn can_trigger(&self) -> bool {
        self.connection().is_online() && !self.is_reading()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let report = *self.health.borrow();
        StatusSnapshot {
            connection: report.status,
            operation: self.state.clone(),
            last_probe_at: report.checked_at,
            completed_at: self.completed_at,
        }
    }

    /// Start a card read.
    ///
    /// Ignored while offline or while a read is outstanding. Must be called
    /// from within a tokio runtime.
    pub fn trigger_read(&mut self) {
        if self.is_reading() {
            log::debug!("Card read already in progress, ignoring trigger");
            return;
        }
        if !self.connection().is_online() {
            log::debug!("Reader backend offline, ignoring trigger");
            return;
        }

        log::info!("Reading card");
        self.state = OperationState::Reading;
        self.completed_at = None;

        let (tx, rx) = oneshot::channel();
        let backend = Arc::clone(&self.backend);
        let read_timeout = self.read_timeout;

        tokio::spawn(async move {
            let result = time::timeout(read_timeout, backend.read_card())
                .await
                .unwrap_or(Err(BackendError::Timeout));
            if tx.send(resolve_read(result)).is_err() {
                log::debug!("Card read finished after its controller went away, discarding");
            }
        });

        self.pending = Some(PendingRead {
            result: rx,
            started: Instant::now(),
        });
    }

    /// Apply a finished read without waiting. Returns true if the state changed.
    pub fn poll(&mut self) -> bool {
        let Some(pending) = self.pending.as_mut() else {
            return false;
        };

        let outcome = match pending.result.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => return false,
            Err(TryRecvError::Closed) => OperationState::Error(OperationError::transport()),
        };
        self.finish(outcome);
        true
    }

    /// Wait for the outstanding read, if any, and apply its outcome
    pub async fn settle(&mut self) -> &OperationState {
        if let Some(pending) = self.pending.as_mut() {
            let outcome = (&mut pending.result)
                .await
                .unwrap_or_else(|_| OperationState::Error(OperationError::transport()));
            self.finish(outcome);
        }
        &self.state
    }

    /// Trigger a read and wait for its outcome
    pub async fn read(&mut self) -> &OperationState {
        self.trigger_read();
        self.settle().await
    }

    fn finish(&mut self, outcome: OperationState) {
        if let Some(pending) = self.pending.take() {
            let elapsed = pending.started.elapsed();
            match &outcome {
                OperationState::Success(card) => {
                    log::info!("Card read from '{}' in {}ms", card.reader, elapsed.as_millis())
                }
                OperationState::Error(error) => {
                    log::warn!("Card read failed ({}): {}", error.kind, error.message)
                }
                _ => {}
            }
        }
        self.state = outcome;
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::MockReaderBackend;
    use crate::core::state::{ErrorKind, TRANSPORT_FAILURE_MESSAGE};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{mpsc, Mutex};

    /// Read endpoint that answers only when the test releases a reply
    struct GatedBackend {
        replies: Mutex<mpsc::UnboundedReceiver<Result<ReadReply, BackendError>>>,
        calls: AtomicUsize,
    }

    impl GatedBackend {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<Result<ReadReply, BackendError>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let backend = Arc::new(Self {
                replies: Mutex::new(rx),
                calls: AtomicUsize::new(0),
            });
            (backend, tx)
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReaderBackend for GatedBackend {
        async fn health(&self) -> Result<(), BackendError> {
            Ok(())
        }

        async fn read_card(&self) -> Result<ReadReply, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .await
                .recv()
                .await
                .unwrap_or_else(|| Err(BackendError::Transport("closed".to_string())))
        }
    }

    fn health_channel(status: ConnectionStatus) -> (watch::Sender<HealthReport>, watch::Receiver<HealthReport>) {
        watch::channel(HealthReport {
            status,
            checked_at: Some(Utc::now()),
        })
    }

    fn card() -> CardRecord {
        CardRecord::new("3B6500...", "ACS ACR122")
    }

    async fn let_tasks_run() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_starts_idle() {
        let (backend, _replies) = GatedBackend::new();
        let (_health, rx) = health_channel(ConnectionStatus::Online);
        let controller = CardReadController::with_timeout(backend, rx, Duration::from_secs(10));

        assert_eq!(controller.state(), &OperationState::Idle);
        assert!(controller.card().is_none());
        assert!(controller.error().is_none());
        assert!(controller.can_trigger());
    }

    #[tokio::test]
    async fn test_trigger_while_offline_is_ignored() {
        let (backend, _replies) = GatedBackend::new();
        let (_health, rx) = health_channel(ConnectionStatus::Offline);
        let mut controller =
            CardReadController::with_timeout(backend.clone(), rx, Duration::from_secs(10));

        controller.trigger_read();
        let_tasks_run().await;

        assert_eq!(controller.state(), &OperationState::Idle);
        assert_eq!(backend.calls(), 0);
        assert!(!controller.poll());
    }

    #[tokio::test]
    async fn test_successful_read() {
        let (backend, replies) = GatedBackend::new();
        let (_health, rx) = health_channel(ConnectionStatus::Online);
        let mut controller = CardReadController::with_timeout(backend, rx, Duration::from_secs(10));

        controller.trigger_read();
        assert!(controller.is_reading());

        replies.send(Ok(ReadReply::Card(card()))).unwrap();
        controller.settle().await;

        assert_eq!(controller.state(), &OperationState::Success(card()));
        assert_eq!(controller.card(), Some(&card()));
        assert!(controller.error().is_none());
        assert!(controller.snapshot().completed_at.is_some());
    }

    #[tokio::test]
    async fn test_backend_reported_failure() {
        let (backend, replies) = GatedBackend::new();
        let (_health, rx) = health_channel(ConnectionStatus::Online);
        let mut controller = CardReadController::with_timeout(backend, rx, Duration::from_secs(10));

        replies
            .send(Ok(ReadReply::Refused("No card present".to_string())))
            .unwrap();
        controller.read().await;

        let error = controller.error().unwrap();
        assert_eq!(error.kind, ErrorKind::BackendReported);
        assert_eq!(error.message, "No card present");
        assert!(controller.card().is_none());
    }

    #[tokio::test]
    async fn test_transport_failure_uses_generic_message() {
        let (backend, replies) = GatedBackend::new();
        let (_health, rx) = health_channel(ConnectionStatus::Online);
        let mut controller = CardReadController::with_timeout(backend, rx, Duration::from_secs(10));

        replies
            .send(Err(BackendError::Transport("connection refused".to_string())))
            .unwrap();
        controller.read().await;

        let error = controller.error().unwrap();
        assert_eq!(error.kind, ErrorKind::Transport);
        assert_eq!(error.message, TRANSPORT_FAILURE_MESSAGE);
        assert!(controller.card().is_none());
    }

    #[tokio::test]
    async fn test_trigger_while_reading_is_ignored() {
        let (backend, replies) = GatedBackend::new();
        let (_health, rx) = health_channel(ConnectionStatus::Online);
        let mut controller =
            CardReadController::with_timeout(backend.clone(), rx, Duration::from_secs(10));

        controller.trigger_read();
        let_tasks_run().await;
        controller.trigger_read();
        let_tasks_run().await;

        assert_eq!(backend.calls(), 1);
        assert_eq!(controller.state(), &OperationState::Reading);
        assert!(!controller.can_trigger());

        replies.send(Ok(ReadReply::Card(card()))).unwrap();
        controller.settle().await;
        assert_eq!(controller.card(), Some(&card()));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_retrigger_clears_previous_result() {
        let (backend, replies) = GatedBackend::new();
        let (_health, rx) = health_channel(ConnectionStatus::Online);
        let mut controller = CardReadController::with_timeout(backend, rx, Duration::from_secs(10));

        replies.send(Ok(ReadReply::Card(card()))).unwrap();
        controller.read().await;
        assert!(controller.card().is_some());

        controller.trigger_read();
        assert_eq!(controller.state(), &OperationState::Reading);
        assert!(controller.card().is_none());
        assert!(controller.snapshot().completed_at.is_none());

        replies
            .send(Ok(ReadReply::Refused("Card connection failed".to_string())))
            .unwrap();
        controller.settle().await;
        assert!(controller.card().is_none());
        assert_eq!(controller.error().unwrap().message, "Card connection failed");

        // Error re-arms as well
        replies.send(Ok(ReadReply::Card(card()))).unwrap();
        controller.read().await;
        assert!(controller.error().is_none());
        assert_eq!(controller.card(), Some(&card()));
    }

    #[tokio::test]
    async fn test_poll_applies_outcome_without_blocking() {
        let (backend, replies) = GatedBackend::new();
        let (_health, rx) = health_channel(ConnectionStatus::Online);
        let mut controller = CardReadController::with_timeout(backend, rx, Duration::from_secs(10));

        controller.trigger_read();
        let_tasks_run().await;
        assert!(!controller.poll());
        assert!(controller.is_reading());

        replies.send(Ok(ReadReply::Card(card()))).unwrap();
        let mut changed = false;
        for _ in 0..20 {
            let_tasks_run().await;
            if controller.poll() {
                changed = true;
                break;
            }
        }
        assert!(changed);
        assert_eq!(controller.card(), Some(&card()));
        assert!(!controller.poll());
    }

    #[tokio::test]
    async fn test_abandoned_settle_keeps_read_pending() {
        let (backend, replies) = GatedBackend::new();
        let (_health, rx) = health_channel(ConnectionStatus::Online);
        let mut controller = CardReadController::with_timeout(backend, rx, Duration::from_secs(10));

        controller.trigger_read();
        {
            let mut settle = tokio_test::task::spawn(controller.settle());
            tokio_test::assert_pending!(settle.poll());
        }
        assert!(controller.is_reading());

        replies.send(Ok(ReadReply::Card(card()))).unwrap();
        controller.settle().await;
        assert_eq!(controller.card(), Some(&card()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_is_a_transport_failure() {
        let (backend, _replies) = GatedBackend::new();
        let (_health, rx) = health_channel(ConnectionStatus::Online);
        let mut controller = CardReadController::with_timeout(backend, rx, Duration::from_secs(2));

        controller.read().await;
        assert_eq!(controller.error().unwrap().kind, ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_late_response_after_drop_is_discarded() {
        let (backend, replies) = GatedBackend::new();
        let (_health, rx) = health_channel(ConnectionStatus::Online);
        let mut controller =
            CardReadController::with_timeout(backend.clone(), rx, Duration::from_secs(10));

        controller.trigger_read();
        let_tasks_run().await;
        drop(controller);

        replies.send(Ok(ReadReply::Card(card()))).unwrap();
        let_tasks_run().await;
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_tracks_connection() {
        let (backend, _replies) = GatedBackend::new();
        let (health, rx) = health_channel(ConnectionStatus::Offline);
        let controller = CardReadController::with_timeout(backend, rx, Duration::from_secs(10));
        assert!(!controller.snapshot().can_trigger());

        health.send_modify(|report| report.status = ConnectionStatus::Online);
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.connection, ConnectionStatus::Online);
        assert!(snapshot.can_trigger());
        assert!(snapshot.last_probe_at.is_some());
    }

    #[tokio::test]
    async fn test_read_through_mock_backend() {
        let mut backend = MockReaderBackend::new();
        backend
            .expect_read_card()
            .times(1)
            .returning(|| Ok(ReadReply::Card(CardRecord::new("3B 8F 80 01", "Mock Reader"))));

        let (_health, rx) = health_channel(ConnectionStatus::Online);
        let mut controller =
            CardReadController::with_timeout(Arc::new(backend), rx, Duration::from_secs(10));

        let state = controller.read().await;
        assert_eq!(state.card().unwrap().reader, "Mock Reader");
    }

    #[test]
    fn test_resolve_read_mapping() {
        assert_eq!(
            resolve_read(Ok(ReadReply::Card(card()))),
            OperationState::Success(card())
        );
        assert_eq!(
            resolve_read(Ok(ReadReply::Refused("No card present".to_string()))),
            OperationState::Error(OperationError::backend("No card present"))
        );
        assert_eq!(
            resolve_read(Err(BackendError::Malformed("bad".to_string()))),
            OperationState::Error(OperationError::transport())
        );
        assert_eq!(
            resolve_read(Err(BackendError::Timeout)),
            OperationState::Error(OperationError::transport())
        );
    }
}
