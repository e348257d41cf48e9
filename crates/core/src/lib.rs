//! Domain types shared by the live agent services.
//!
//! - `preset`: the static catalog of agent personas selectable at session start.
//! - `turn`: conversation turn records kept per session.
//! - `telemetry`: the best-effort telemetry contract and its non-blocking queue.

pub mod preset;
pub mod telemetry;
pub mod turn;
