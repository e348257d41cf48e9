//! Client for the Gemini Live bidirectional streaming API.
//!
//! - `types`: the JSON wire format, decoded permissively.
//! - `event`: normalization of server messages into [`LiveEvent`]s.
//! - `connection`: the connection contract plus the WebSocket connector.
//! - `session`: [`LiveSession`], the typed facade the relay talks to.

pub mod connection;
pub mod error;
pub mod event;
pub mod session;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod types;

pub use connection::{Connector, GeminiConnector, LiveConfig, LiveConnection};
pub use error::LiveError;
pub use event::{LiveEvent, normalize};
pub use session::LiveSession;
