//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds all shared,
//! clonable resources like the session registry and service clients.

use crate::{config::Config, registry::SessionRegistry};
use gemini_realtime::Connector;
use live_agent_core::{preset::PresetCatalog, telemetry::Telemetry};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
/// All fields are public to be accessible from other modules.
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub presets: Arc<PresetCatalog>,
    /// Opens upstream Live API connections.
    pub connector: Arc<dyn Connector>,
    pub telemetry: Telemetry,
    pub config: Arc<Config>,
}
