//! WebSocket Session Handling
//!
//! This module contains the per-connection relay between a browser client and
//! the upstream Live API. It is structured into submodules:
//!
//! - `protocol`: the frame and JSON message format of the client connection.
//! - `session`: the connection lifecycle, from registration to teardown.
//! - `relay`: the two forwarding loops and their first-to-finish cancellation.

pub mod protocol;
mod relay;
pub mod session;

pub use session::{run_session, ws_handler, ws_handler_with_id};
