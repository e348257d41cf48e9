//! Live Agent API Library Crate
//!
//! This library contains all the core logic for the live agent relay service,
//! including the application state, session registry, telemetry storage, API
//! handlers, WebSocket relay, and routing. The `api` binary is a thin wrapper
//! around this library.

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod registry;
pub mod router;
pub mod state;
pub mod ws;
