//! Session Registry
//!
//! The single authoritative map from session id to [`SessionRecord`]. It enforces
//! the concurrent-session cap, evicts idle sessions from a background sweeper and
//! ends each session when it is removed: the record's end signal is raised so the
//! owning connection tears down, and its upstream connection is closed.

use crate::models::{RegistryStats, SessionStats};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use gemini_realtime::LiveSession;
use live_agent_core::turn::{ContentKind, Role, Turn};
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex as StdMutex, OnceLock, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

/// Upper bound on a single upstream close during removal.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Max sessions ({max}) reached")]
    CapacityExceeded { max: usize },
    #[error("Session {0} is already active")]
    DuplicateSession(String),
}

/// Bookkeeping for one admitted session.
pub struct SessionRecord {
    id: String,
    requested_preset: String,
    /// The preset resolved once the session starts streaming.
    resolved_preset: OnceLock<String>,
    started_at: DateTime<Utc>,
    created_at: Instant,
    /// Milliseconds between `created_at` and the last observed activity.
    last_activity_ms: AtomicU64,
    turns: StdMutex<Vec<Turn>>,
    upstream: Mutex<Option<Arc<LiveSession>>>,
    ended: CancellationToken,
}

impl SessionRecord {
    fn new(id: String, preset_id: String) -> Self {
        Self {
            id,
            requested_preset: preset_id,
            resolved_preset: OnceLock::new(),
            started_at: Utc::now(),
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            turns: StdMutex::new(Vec::new()),
            upstream: Mutex::new(None),
            ended: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn preset_id(&self) -> String {
        self.resolved_preset
            .get()
            .unwrap_or(&self.requested_preset)
            .clone()
    }

    /// Records the preset resolved at session start. Only the first call takes
    /// effect; returns whether this call set it.
    pub(crate) fn set_preset_id(&self, preset_id: &str) -> bool {
        let set = self.resolved_preset.set(preset_id.to_string()).is_ok();
        if !set {
            debug!(session_id = %self.id, %preset_id, "Preset already resolved");
        }
        set
    }

    /// Whether the registry has removed this session.
    pub fn is_ended(&self) -> bool {
        self.ended.is_cancelled()
    }

    /// Resolves once the registry removes this session.
    pub fn ended(&self) -> WaitForCancellationFuture<'_> {
        self.ended.cancelled()
    }

    /// A token cancelled when the registry removes this session.
    pub fn end_token(&self) -> CancellationToken {
        self.ended.clone()
    }

    /// Wall-clock admission time.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        self.created_at + Duration::from_millis(self.last_activity_ms.load(Ordering::SeqCst))
    }

    /// Marks the session as active now.
    pub fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::SeqCst);
    }

    /// Appends a turn; content beyond the turn limit is truncated.
    pub fn log_turn(&self, role: Role, kind: ContentKind, content: &str) {
        self.turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Turn::new(role, kind, content));
    }

    pub fn turns(&self) -> Vec<Turn> {
        self.turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn turn_count(&self) -> usize {
        self.turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Hands ownership of the upstream session to this record.
    pub async fn attach_upstream(&self, upstream: Arc<LiveSession>) {
        *self.upstream.lock().await = Some(upstream);
    }

    pub async fn upstream(&self) -> Option<Arc<LiveSession>> {
        self.upstream.lock().await.clone()
    }

    async fn stats(&self, now: Instant) -> SessionStats {
        let connected = self
            .upstream
            .lock()
            .await
            .as_ref()
            .is_some_and(|upstream| upstream.is_active());
        SessionStats {
            session_id: self.id.clone(),
            agent: self.preset_id(),
            turns: self.turn_count(),
            connected,
            started_at: self.started_at,
            age_seconds: now.saturating_duration_since(self.created_at).as_secs(),
        }
    }
}

struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    sessions: Mutex<HashMap<String, Arc<SessionRecord>>>,
    max_sessions: usize,
    close_timeout: Duration,
    sweeper: Mutex<Option<Sweeper>>,
}

/// Cloneable handle to the shared registry.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self::with_close_timeout(max_sessions, DEFAULT_CLOSE_TIMEOUT)
    }

    pub fn with_close_timeout(max_sessions: usize, close_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                max_sessions,
                close_timeout,
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.inner.max_sessions
    }

    /// Admits a new session, failing if the registry is full or `id` is live.
    pub async fn register(
        &self,
        id: &str,
        preset_id: &str,
    ) -> Result<Arc<SessionRecord>, RegistryError> {
        let mut sessions = self.inner.sessions.lock().await;
        if sessions.contains_key(id) {
            return Err(RegistryError::DuplicateSession(id.to_string()));
        }
        if sessions.len() >= self.inner.max_sessions {
            return Err(RegistryError::CapacityExceeded {
                max: self.inner.max_sessions,
            });
        }
        let record = Arc::new(SessionRecord::new(id.to_string(), preset_id.to_string()));
        sessions.insert(id.to_string(), record.clone());
        info!(session_id = %id, active = sessions.len(), "Session registered");
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<SessionRecord>> {
        self.inner.sessions.lock().await.get(id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Removes a session and closes its upstream connection. Removing an unknown
    /// id is a no-op; returns whether a session was removed.
    pub async fn remove(&self, id: &str) -> bool {
        let (record, active) = {
            let mut sessions = self.inner.sessions.lock().await;
            (sessions.remove(id), sessions.len())
        };
        let Some(record) = record else {
            return false;
        };
        self.end(&record).await;
        info!(session_id = %id, active, "Session removed");
        true
    }

    /// Removes `record` only if it is still the live entry for its id. A
    /// session evicted earlier must not take down a newer one reusing the id.
    pub async fn remove_record(&self, record: &Arc<SessionRecord>) -> bool {
        let active = {
            let mut sessions = self.inner.sessions.lock().await;
            match sessions.get(&record.id) {
                Some(live) if Arc::ptr_eq(live, record) => {
                    sessions.remove(&record.id);
                    Some(sessions.len())
                }
                _ => None,
            }
        };
        // An already-removed record may still hold an upstream attached late.
        self.end(record).await;
        let Some(active) = active else {
            return false;
        };
        info!(session_id = %record.id, active, "Session removed");
        true
    }

    /// Removes every session idle for longer than `idle_threshold` as of `now`
    /// and returns their ids.
    pub async fn sweep(&self, now: Instant, idle_threshold: Duration) -> Vec<String> {
        let stale: Vec<Arc<SessionRecord>> = {
            let mut sessions = self.inner.sessions.lock().await;
            let ids: Vec<String> = sessions
                .values()
                .filter(|r| now.saturating_duration_since(r.last_activity()) > idle_threshold)
                .map(|r| r.id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for record in &stale {
            warn!(session_id = %record.id, "Cleaning up stale session");
        }
        join_all(stale.iter().map(|record| self.end(record))).await;
        stale.iter().map(|record| record.id.clone()).collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        let records: Vec<Arc<SessionRecord>> =
            self.inner.sessions.lock().await.values().cloned().collect();
        let now = Instant::now();
        let mut sessions = Vec::with_capacity(records.len());
        for record in &records {
            sessions.push(record.stats(now).await);
        }
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        RegistryStats {
            active_sessions: records.len(),
            sessions,
        }
    }

    /// Starts the periodic idle sweep, replacing any sweeper already running.
    pub async fn start_sweeper(&self, interval: Duration, idle_threshold: Duration) {
        let cancel = CancellationToken::new();
        let registry = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(run_sweeper(
            registry,
            interval,
            idle_threshold,
            cancel.clone(),
        ));
        let previous = self
            .inner
            .sweeper
            .lock()
            .await
            .replace(Sweeper { cancel, handle });
        if let Some(previous) = previous {
            previous.cancel.cancel();
            let _ = previous.handle.await;
        }
        info!(?interval, ?idle_threshold, "Session sweeper started");
    }

    /// Stops the sweeper, then removes every session.
    pub async fn shutdown_all(&self) {
        if let Some(sweeper) = self.inner.sweeper.lock().await.take() {
            sweeper.cancel.cancel();
            if let Err(e) = sweeper.handle.await {
                warn!(error = %e, "Session sweeper did not stop cleanly");
            }
        }
        let records: Vec<Arc<SessionRecord>> = self
            .inner
            .sessions
            .lock()
            .await
            .drain()
            .map(|(_, record)| record)
            .collect();
        join_all(records.iter().map(|record| self.end(record))).await;
        info!(closed = records.len(), "All sessions closed.");
    }

    /// Signals the session's owner to stop, then closes the upstream session
    /// within the close timeout. Failures are logged only.
    async fn end(&self, record: &SessionRecord) {
        record.ended.cancel();
        let Some(upstream) = record.upstream.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(self.inner.close_timeout, upstream.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(session_id = %record.id, error = %e, "Failed to close upstream session")
            }
            Err(_) => warn!(
                session_id = %record.id,
                timeout = ?self.inner.close_timeout,
                "Timed out closing upstream session"
            ),
        }
    }
}

async fn run_sweeper(
    registry: Weak<Inner>,
    interval: Duration,
    idle_threshold: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = registry.upgrade() else { break };
                let removed = SessionRegistry { inner }
                    .sweep(Instant::now(), idle_threshold)
                    .await;
                if !removed.is_empty() {
                    info!(count = removed.len(), "Evicted idle sessions");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gemini_realtime::testing::channel_connection;

    #[tokio::test]
    async fn register_beyond_capacity_fails() {
        let registry = SessionRegistry::new(2);
        registry.register("a", "general").await.unwrap();
        registry.register("b", "general").await.unwrap();

        let err = registry.register("c", "general").await.err();
        assert_eq!(err, Some(RegistryError::CapacityExceeded { max: 2 }));
        assert_eq!(registry.active_count().await, 2);
        assert!(registry.get("c").await.is_none());
    }

    #[tokio::test]
    async fn full_registry_leaves_existing_session_untouched() {
        let registry = SessionRegistry::new(1);
        let s1 = registry.register("s1", "tutor").await.unwrap();
        s1.log_turn(Role::User, ContentKind::Text, "hello");

        assert!(matches!(
            registry.register("s2", "general").await,
            Err(RegistryError::CapacityExceeded { max: 1 })
        ));

        let still_there = registry.get("s1").await.unwrap();
        assert_eq!(still_there.preset_id(), "tutor");
        assert_eq!(still_there.turn_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let registry = SessionRegistry::new(5);
        registry.register("s1", "general").await.unwrap();
        assert_eq!(
            registry.register("s1", "tutor").await.err(),
            Some(RegistryError::DuplicateSession("s1".to_string()))
        );
        assert_eq!(registry.get("s1").await.unwrap().preset_id(), "general");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = SessionRegistry::new(2);
        registry.register("a", "general").await.unwrap();
        registry.register("b", "general").await.unwrap();

        assert!(registry.remove("a").await);
        assert!(!registry.remove("a").await);
        assert!(!registry.remove("never-registered").await);
        assert_eq!(registry.active_count().await, 1);

        // Capacity freed by the removal can be reused.
        registry.register("c", "general").await.unwrap();
    }

    #[tokio::test]
    async fn remove_closes_the_upstream_session() {
        let registry = SessionRegistry::new(1);
        let record = registry.register("s1", "general").await.unwrap();
        let (connection, handle) = channel_connection();
        let upstream = Arc::new(LiveSession::new(Box::new(connection)));
        record.attach_upstream(upstream.clone()).await;

        registry.remove("s1").await;

        assert!(!upstream.is_active());
        assert_eq!(handle.close_calls(), 1);
        assert!(record.upstream().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_exactly_the_idle_sessions() {
        let registry = SessionRegistry::new(10);
        let idle = registry.register("idle", "general").await.unwrap();
        let busy = registry.register("busy", "tutor").await.unwrap();
        busy.log_turn(Role::Assistant, ContentKind::Text, "still here");

        tokio::time::advance(Duration::from_secs(90)).await;
        busy.touch();
        let fresh = registry.register("fresh", "general").await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;

        let removed = registry
            .sweep(Instant::now(), Duration::from_secs(60))
            .await;

        assert_eq!(removed, vec!["idle".to_string()]);
        assert!(registry.get("idle").await.is_none());
        assert_eq!(registry.active_count().await, 2);
        assert_eq!(registry.get("busy").await.unwrap().turn_count(), 1);
        assert!(registry.get("fresh").await.is_some());
        assert!(idle.last_activity() < fresh.last_activity());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_threshold_is_strict() {
        let registry = SessionRegistry::new(1);
        registry.register("s1", "general").await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(
            registry
                .sweep(Instant::now(), Duration::from_secs(60))
                .await
                .is_empty()
        );
        assert_eq!(registry.active_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_in_the_background_until_shutdown() {
        let registry = SessionRegistry::new(4);
        registry
            .start_sweeper(Duration::from_secs(60), Duration::from_secs(100))
            .await;
        registry.register("s1", "general").await.unwrap();

        for _ in 0..300 {
            if registry.active_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(registry.active_count().await, 0);

        registry.register("s2", "general").await.unwrap();
        registry.shutdown_all().await;
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn removal_raises_the_end_signal() {
        let registry = SessionRegistry::new(2);
        let record = registry.register("s1", "general").await.unwrap();
        assert!(!record.is_ended());

        let waiter = tokio::spawn({
            let record = record.clone();
            async move { record.ended().await }
        });
        registry.remove("s1").await;

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("end signal not raised")
            .unwrap();
        assert!(record.is_ended());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_and_shutdown_raise_the_end_signal() {
        let registry = SessionRegistry::new(2);
        let idle = registry.register("idle", "general").await.unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;
        registry.sweep(Instant::now(), Duration::from_secs(60)).await;
        assert!(idle.is_ended());

        let live = registry.register("live", "general").await.unwrap();
        registry.shutdown_all().await;
        assert!(live.is_ended());
    }

    #[tokio::test]
    async fn stale_record_does_not_remove_its_successor() {
        let registry = SessionRegistry::new(2);
        let old = registry.register("s1", "general").await.unwrap();
        assert!(registry.remove("s1").await);

        let new = registry.register("s1", "tutor").await.unwrap();
        let (connection, handle) = channel_connection();
        let upstream = Arc::new(LiveSession::new(Box::new(connection)));
        new.attach_upstream(upstream.clone()).await;

        assert!(!registry.remove_record(&old).await);
        assert!(Arc::ptr_eq(&registry.get("s1").await.unwrap(), &new));
        assert!(upstream.is_active());
        assert_eq!(handle.close_calls(), 0);
        assert!(!new.is_ended());

        assert!(registry.remove_record(&new).await);
        assert_eq!(registry.active_count().await, 0);
        assert_eq!(handle.close_calls(), 1);
    }

    #[tokio::test]
    async fn remove_record_closes_an_upstream_attached_after_eviction() {
        let registry = SessionRegistry::new(1);
        let record = registry.register("s1", "general").await.unwrap();
        registry.remove("s1").await;

        let (connection, handle) = channel_connection();
        record
            .attach_upstream(Arc::new(LiveSession::new(Box::new(connection))))
            .await;

        assert!(!registry.remove_record(&record).await);
        assert_eq!(handle.close_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_close_is_bounded_by_the_close_timeout() {
        let timeout = Duration::from_millis(250);
        let registry = SessionRegistry::with_close_timeout(2, timeout);
        let record = registry.register("s1", "general").await.unwrap();
        let (connection, handle) = channel_connection();
        handle.hang_close(true);
        record
            .attach_upstream(Arc::new(LiveSession::new(Box::new(connection))))
            .await;
        tokio::time::advance(Duration::from_secs(120)).await;

        let started = Instant::now();
        let removed = registry.sweep(Instant::now(), Duration::from_secs(60)).await;

        assert_eq!(removed, vec!["s1".to_string()]);
        let elapsed = started.elapsed();
        assert!(elapsed >= timeout && elapsed < timeout * 2, "{elapsed:?}");
        assert_eq!(handle.close_calls(), 1);
        assert!(registry.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn failing_close_still_removes_the_session() {
        let registry = SessionRegistry::new(2);
        let record = registry.register("s1", "general").await.unwrap();
        let (connection, handle) = channel_connection();
        handle.fail_close(true);
        record
            .attach_upstream(Arc::new(LiveSession::new(Box::new(connection))))
            .await;

        assert!(registry.remove("s1").await);
        assert_eq!(handle.close_calls(), 1);
        assert_eq!(registry.active_count().await, 0);
        assert!(record.upstream().await.is_none());
    }

    #[tokio::test]
    async fn preset_is_resolved_once() {
        let registry = SessionRegistry::new(1);
        let record = registry.register("s1", "general").await.unwrap();
        assert_eq!(record.preset_id(), "general");

        assert!(record.set_preset_id("tutor"));
        assert!(!record.set_preset_id("cooking"));
        assert_eq!(record.preset_id(), "tutor");
    }

    #[tokio::test]
    async fn stats_report_each_session() {
        let registry = SessionRegistry::new(3);
        let a = registry.register("a", "general").await.unwrap();
        a.set_preset_id("tutor");
        a.log_turn(Role::User, ContentKind::Image, "");
        a.log_turn(Role::Assistant, ContentKind::Text, "nice picture");
        registry.register("b", "general").await.unwrap();

        let stats = registry.stats().await;

        assert_eq!(stats.active_sessions, 2);
        assert_eq!(stats.sessions[0].session_id, "a");
        assert_eq!(stats.sessions[0].agent, "tutor");
        assert_eq!(stats.sessions[0].turns, 2);
        assert!(!stats.sessions[0].connected);
        assert_eq!(stats.sessions[1].turns, 0);
    }
}
