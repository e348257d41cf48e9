//! Manages the WebSocket connection lifecycle for a live agent session.
//!
//! A connection moves through `Connecting` (admission), `ConfigPending` (a short
//! wait for the preset choice), `Streaming` (the relay loops), `Draining` and
//! finally `Closed`, where the session is always deregistered.

use super::{
    protocol::{ClientMessage, Frame, FrameSink, FrameSource, ServerMessage, send_msg},
    relay::{self, RelayContext},
};
use crate::{registry::SessionRecord, state::AppState};
use anyhow::{Context, Result, anyhow};
use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{FutureExt, SinkExt, StreamExt, future, stream};
use gemini_realtime::{LiveConfig, LiveSession};
use live_agent_core::preset::{DEFAULT_PRESET_ID, Preset};
use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

/// Axum handler upgrading `/ws/session/{session_id}` to a WebSocket.
pub async fn ws_handler_with_id(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

/// Axum handler upgrading `/ws` to a WebSocket under a freshly generated id.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let session_id = Uuid::new_v4().to_string();
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, session_id: String) {
    let (socket_tx, socket_rx) = socket.split();
    let source = socket_rx.filter_map(|msg| {
        future::ready(match msg {
            Ok(msg) => Frame::from_message(msg).map(Ok),
            Err(e) => Some(Err(anyhow::Error::from(e))),
        })
    });
    let sink = socket_tx
        .with(|frame: Frame| future::ready(Ok::<_, anyhow::Error>(Message::from(frame))));

    let span = info_span!("ws_session", %session_id);
    run_session(state, session_id, source, sink)
        .instrument(span)
        .await;
}

/// Runs one client connection from admission to teardown.
///
/// Deregistration and the session-end telemetry record happen on every exit
/// path once the session was admitted, including removal by the registry. At
/// most one error notification is sent to the client.
pub async fn run_session<S: FrameSource, K: FrameSink>(
    state: Arc<AppState>,
    session_id: String,
    source: S,
    sink: K,
) {
    let sink = Arc::new(Mutex::new(sink));
    info!("New WebSocket connection");

    // Connecting
    let record = match state.registry.register(&session_id, DEFAULT_PRESET_ID).await {
        Ok(record) => record,
        Err(e) => {
            warn!(error = %e, "Rejecting session");
            let _ = send_msg(&sink, ServerMessage::Error { message: e.to_string() }).await;
            let _ = sink.lock().await.close().await;
            return;
        }
    };

    let outcome = AssertUnwindSafe(drive_session(&state, &record, source, sink.clone()))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(anyhow!("session task panicked")));
    if let Err(e) = outcome {
        error!(error = ?e, "Session terminated with error");
        let _ = send_msg(&sink, ServerMessage::Error { message: e.to_string() }).await;
    }

    // Closed
    let turn_count = record.turn_count();
    state.registry.remove_record(&record).await;
    state.telemetry.session_ended(&session_id, turn_count);
    let _ = sink.lock().await.close().await;
    info!(turn_count, "Session closed");
}

async fn drive_session<S: FrameSource, K: FrameSink>(
    state: &AppState,
    record: &Arc<SessionRecord>,
    mut source: S,
    sink: Arc<Mutex<K>>,
) -> Result<()> {
    // ConfigPending
    let outcome = tokio::select! {
        _ = record.ended() => ConfigOutcome::Ended,
        outcome = await_config(&mut source, state.config.config_wait) => outcome,
    };
    let (requested, replay) = match outcome {
        ConfigOutcome::Preset(preset) => (preset, None),
        ConfigOutcome::Replay(frame) => (None, Some(frame)),
        ConfigOutcome::TimedOut => (None, None),
        ConfigOutcome::Disconnected => {
            info!("Client disconnected before streaming started");
            return Ok(());
        }
        ConfigOutcome::Ended => {
            info!("Session ended by the registry before streaming started");
            return Ok(());
        }
    };
    let preset = state
        .presets
        .lookup(requested.as_deref().unwrap_or(DEFAULT_PRESET_ID));
    if let Some(requested) = requested.filter(|id| *id != preset.id) {
        warn!(%requested, fallback = %preset.id, "Unknown preset requested");
    }
    record.set_preset_id(&preset.id);

    // Streaming
    info!(preset = %preset.id, "Connecting to the Live API");
    let config = live_config(preset);
    let connection = tokio::select! {
        _ = record.ended() => {
            info!("Session ended by the registry while connecting");
            return Ok(());
        }
        connection = state.connector.connect(&config) => {
            connection.context("Failed to connect to the Live API")?
        }
    };
    let upstream = Arc::new(LiveSession::new(connection));
    record.attach_upstream(upstream.clone()).await;
    if record.is_ended() {
        // Removed while attaching; teardown closes the upstream.
        return Ok(());
    }
    state.telemetry.session_started(record.id(), &preset.id);

    let ready = ServerMessage::SessionReady {
        session_id: record.id().to_string(),
        agent: preset.id.clone(),
    };
    if let Err(e) = send_msg(&sink, ready).await {
        info!(error = %e, "Client left before the session was ready");
        return Ok(());
    }
    info!("Session is live");

    let source = stream::iter(replay.map(Ok::<_, anyhow::Error>)).chain(source);
    let ctx = RelayContext {
        record: record.clone(),
        upstream,
        telemetry: state.telemetry.clone(),
    };
    relay::run(ctx, source, sink).await
}

enum ConfigOutcome {
    Preset(Option<String>),
    /// The first frame was not a config message and must still be relayed.
    Replay(Frame),
    TimedOut,
    Disconnected,
    /// The registry removed the session.
    Ended,
}

async fn await_config<S: FrameSource>(source: &mut S, wait: Duration) -> ConfigOutcome {
    let first = match tokio::time::timeout(wait, source.next()).await {
        Ok(first) => first,
        Err(_) => return ConfigOutcome::TimedOut,
    };
    match first {
        None | Some(Ok(Frame::Close)) => ConfigOutcome::Disconnected,
        Some(Err(e)) => {
            info!(error = %e, "Client connection lost");
            ConfigOutcome::Disconnected
        }
        Some(Ok(Frame::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Config { preset }) => ConfigOutcome::Preset(preset),
            _ => ConfigOutcome::Replay(Frame::Text(text)),
        },
        Some(Ok(frame)) => ConfigOutcome::Replay(frame),
    }
}

fn live_config(preset: &Preset) -> LiveConfig {
    LiveConfig {
        instructions: preset.instructions.clone(),
        voice: preset.voice.clone(),
        capabilities: preset.capabilities.clone(),
    }
}
