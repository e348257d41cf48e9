//! Postgres Telemetry Sink
//!
//! Persists session start/end and per-turn records with `sqlx`. Writes are
//! best-effort: the telemetry queue logs and drops any error returned here.

use anyhow::Result;
use async_trait::async_trait;
use live_agent_core::{
    telemetry::TelemetrySink,
    turn::{ContentKind, Role, truncate},
};
use sqlx::{PgPool, migrate::Migrator};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Maximum number of characters persisted per turn.
pub const TELEMETRY_CONTENT_LIMIT: usize = 1000;

/// A wrapper around the `PgPool` implementing [`TelemetrySink`].
#[derive(Clone)]
pub struct PgTelemetry {
    pool: PgPool,
}

impl PgTelemetry {
    /// Creates a new `PgTelemetry` instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TelemetrySink for PgTelemetry {
    async fn session_started(&self, session_id: &str, preset_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO telemetry_sessions (session_id, preset_id, status)
            VALUES ($1, $2, 'active')
            ON CONFLICT (session_id) DO UPDATE
            SET preset_id = EXCLUDED.preset_id, status = 'active', started_at = NOW(),
                ended_at = NULL, total_turns = NULL
            "#,
        )
        .bind(session_id)
        .bind(preset_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn turn(
        &self,
        session_id: &str,
        role: Role,
        kind: ContentKind,
        content: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO telemetry_turns (session_id, role, kind, content) VALUES ($1, $2, $3, $4)",
        )
        .bind(session_id)
        .bind(role.to_string())
        .bind(kind.to_string())
        .bind(truncate(content, TELEMETRY_CONTENT_LIMIT))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn session_ended(&self, session_id: &str, turn_count: usize) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE telemetry_sessions
            SET status = 'completed', ended_at = NOW(), total_turns = $2
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .bind(turn_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
