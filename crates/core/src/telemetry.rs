//! Best-effort session telemetry.
//!
//! Relay code never talks to a [`TelemetrySink`] directly. It enqueues records on a
//! [`Telemetry`] handle, which returns immediately; a single background worker
//! delivers them to the sink and swallows any failure.

use crate::turn::{ContentKind, Role, truncate};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Default number of records the queue holds before new ones are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Destination of telemetry records. Implementations may fail; failures are
/// logged by the queue worker and never reach the relay.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn session_started(&self, session_id: &str, preset_id: &str) -> Result<()>;

    async fn turn(&self, session_id: &str, role: Role, kind: ContentKind, content: &str)
    -> Result<()>;

    async fn session_ended(&self, session_id: &str, turn_count: usize) -> Result<()>;
}

/// A sink that only writes records to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

#[async_trait]
impl TelemetrySink for TracingTelemetry {
    async fn session_started(&self, session_id: &str, preset_id: &str) -> Result<()> {
        info!(%session_id, %preset_id, "telemetry: session started");
        Ok(())
    }

    async fn turn(
        &self,
        session_id: &str,
        role: Role,
        kind: ContentKind,
        content: &str,
    ) -> Result<()> {
        debug!(%session_id, %role, %kind, content = %truncate(content, 80), "telemetry: turn");
        Ok(())
    }

    async fn session_ended(&self, session_id: &str, turn_count: usize) -> Result<()> {
        info!(%session_id, turn_count, "telemetry: session ended");
        Ok(())
    }
}

/// A single queued telemetry record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryRecord {
    SessionStart {
        session_id: String,
        preset_id: String,
    },
    Turn {
        session_id: String,
        role: Role,
        kind: ContentKind,
        content: String,
    },
    SessionEnd {
        session_id: String,
        turn_count: usize,
    },
}

enum Command {
    Record(TelemetryRecord),
    Flush(oneshot::Sender<()>),
    Stop,
}

/// Cloneable, non-blocking handle to the telemetry queue.
#[derive(Clone)]
pub struct Telemetry {
    tx: mpsc::Sender<Command>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Telemetry {
    /// Spawns the queue worker delivering to `sink`.
    pub fn spawn(sink: Arc<dyn TelemetrySink>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(sink, rx));
        Self {
            tx,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    pub fn session_started(&self, session_id: &str, preset_id: &str) {
        self.enqueue(TelemetryRecord::SessionStart {
            session_id: session_id.to_string(),
            preset_id: preset_id.to_string(),
        });
    }

    pub fn turn(&self, session_id: &str, role: Role, kind: ContentKind, content: &str) {
        self.enqueue(TelemetryRecord::Turn {
            session_id: session_id.to_string(),
            role,
            kind,
            content: content.to_string(),
        });
    }

    pub fn session_ended(&self, session_id: &str, turn_count: usize) {
        self.enqueue(TelemetryRecord::SessionEnd {
            session_id: session_id.to_string(),
            turn_count,
        });
    }

    /// Waits until every record enqueued before this call has been delivered.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Drains the queue and stops the worker. Records enqueued afterwards are
    /// dropped.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Stop).await;
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "Telemetry worker did not shut down cleanly");
            }
        }
    }

    fn enqueue(&self, record: TelemetryRecord) {
        match self.tx.try_send(Command::Record(record)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Telemetry queue is full, dropping record");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Telemetry worker stopped, dropping record");
            }
        }
    }
}

async fn run_worker(sink: Arc<dyn TelemetrySink>, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Record(record) => deliver(sink.as_ref(), record).await,
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
            Command::Stop => break,
        }
    }
    debug!("Telemetry worker finished");
}

async fn deliver(sink: &dyn TelemetrySink, record: TelemetryRecord) {
    let result = match &record {
        TelemetryRecord::SessionStart {
            session_id,
            preset_id,
        } => sink.session_started(session_id, preset_id).await,
        TelemetryRecord::Turn {
            session_id,
            role,
            kind,
            content,
        } => sink.turn(session_id, *role, *kind, content).await,
        TelemetryRecord::SessionEnd {
            session_id,
            turn_count,
        } => sink.session_ended(session_id, *turn_count).await,
    };
    if let Err(e) = result {
        warn!(error = ?e, ?record, "Failed to deliver telemetry record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use mockall::predicate::eq;

    #[tokio::test]
    async fn records_are_delivered_in_order() {
        let mut sink = MockTelemetrySink::new();
        let mut seq = mockall::Sequence::new();
        sink.expect_session_started()
            .withf(|id, preset| id == "s1" && preset == "tutor")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        sink.expect_turn()
            .withf(|id, role, kind, content| {
                id == "s1" && *role == Role::User && *kind == ContentKind::Text && content == "hi"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        sink.expect_session_ended()
            .with(eq("s1"), eq(1))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let telemetry = Telemetry::spawn(Arc::new(sink), 8);
        telemetry.session_started("s1", "tutor");
        telemetry.turn("s1", Role::User, ContentKind::Text, "hi");
        telemetry.session_ended("s1", 1);
        telemetry.shutdown().await;
    }

    #[tokio::test]
    async fn sink_failures_are_swallowed() {
        let mut sink = MockTelemetrySink::new();
        sink.expect_session_started()
            .times(1)
            .returning(|_, _| Err(anyhow!("database unavailable")));
        sink.expect_session_ended().times(1).returning(|_, _| Ok(()));

        let telemetry = Telemetry::spawn(Arc::new(sink), 8);
        telemetry.session_started("s1", "general");
        telemetry.session_ended("s1", 0);
        telemetry.flush().await;
        telemetry.shutdown().await;
    }

    #[tokio::test]
    async fn records_after_shutdown_are_dropped() {
        let sink = MockTelemetrySink::new();
        let telemetry = Telemetry::spawn(Arc::new(sink), 8);
        telemetry.shutdown().await;
        // The mock has no expectations, so delivering this would panic the worker.
        telemetry.session_started("late", "general");
        telemetry.flush().await;
    }
}
