//! Defines the WebSocket message protocol between the browser client and the API server.
//!
//! Binary frames carry raw PCM audio in both directions. Text frames carry JSON
//! messages tagged by `type`.

use anyhow::Result;
use axum::extract::ws::Message;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Messages sent from the client (browser) to the server.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Selects the agent preset. Only honoured as the first message.
    Config {
        #[serde(default)]
        preset: Option<String>,
    },
    /// A camera or screen frame.
    Image {
        /// Base64-encoded image bytes.
        #[serde(default)]
        data: String,
        #[serde(default)]
        mime_type: Option<String>,
    },
    /// A typed user message.
    Text {
        #[serde(default)]
        text: String,
    },
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The upstream session is established and streaming may begin.
    SessionReady { session_id: String, agent: String },
    /// Text spoken or written by the assistant.
    Transcript { text: String },
    /// Transcript of the user's speech.
    InputTranscript { text: String },
    /// The assistant was cut off; drop any queued playback.
    Interrupted,
    TurnComplete,
    /// Reports a fatal error to the client.
    Error { message: String },
}

/// A transport-agnostic WebSocket frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Binary(Bytes),
    Text(String),
    Close,
}

impl Frame {
    /// Maps an axum message to a frame; control frames map to `None`.
    pub fn from_message(message: Message) -> Option<Self> {
        match message {
            Message::Binary(data) => Some(Frame::Binary(data)),
            Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
            Message::Close(_) => Some(Frame::Close),
            Message::Ping(_) | Message::Pong(_) => None,
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Binary(data) => Message::Binary(data),
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Close => Message::Close(None),
        }
    }
}

/// Inbound half of a client connection.
pub trait FrameSource: Stream<Item = Result<Frame>> + Unpin + Send + 'static {}

impl<T> FrameSource for T where T: Stream<Item = Result<Frame>> + Unpin + Send + 'static {}

/// Outbound half of a client connection.
pub trait FrameSink: Sink<Frame, Error = anyhow::Error> + Unpin + Send + 'static {}

impl<T> FrameSink for T where T: Sink<Frame, Error = anyhow::Error> + Unpin + Send + 'static {}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg<K: FrameSink>(sink: &Mutex<K>, msg: ServerMessage) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    sink.lock().await.send(Frame::Text(serialized)).await?;
    Ok(())
}
