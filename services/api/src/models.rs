//! API Models
//!
//! Response bodies of the REST API. They double as the `utoipa` schemas of the
//! generated OpenAPI document.

use chrono::{DateTime, Utc};
use live_agent_core::preset::PresetSummary;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct HealthResponse {
    #[schema(example = "healthy")]
    pub status: String,
    pub active_sessions: usize,
}

/// One selectable agent preset.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct AgentSummary {
    #[schema(example = "tutor")]
    pub id: String,
    #[schema(example = "Homework Tutor")]
    pub name: String,
    pub description: String,
    #[schema(example = "Puck")]
    pub voice: String,
}

impl From<PresetSummary> for AgentSummary {
    fn from(summary: PresetSummary) -> Self {
        Self {
            id: summary.id,
            name: summary.name,
            description: summary.description,
            voice: summary.voice,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct AgentsResponse {
    pub agents: Vec<AgentSummary>,
}

/// Snapshot of one live session.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct SessionStats {
    pub session_id: String,
    /// Preset the session runs with.
    pub agent: String,
    /// Entries in the session's turn log.
    pub turns: usize,
    /// Whether an upstream session is attached and still active.
    pub connected: bool,
    pub started_at: DateTime<Utc>,
    pub age_seconds: u64,
}

/// Snapshot of the whole session registry.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct RegistryStats {
    pub active_sessions: usize,
    pub sessions: Vec<SessionStats>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct EndSessionResponse {
    #[schema(example = "ended")]
    pub status: String,
    pub session_id: String,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}
