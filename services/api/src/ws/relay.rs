//! The two forwarding loops of a streaming session.
//!
//! One loop moves client frames upstream, the other moves upstream events to
//! the client. Whichever finishes first cancels the other; the relay returns
//! once both have stopped.

use super::protocol::{ClientMessage, Frame, FrameSink, FrameSource, ServerMessage, send_msg};
use crate::registry::SessionRecord;
use anyhow::{Result, anyhow};
use base64::Engine;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use gemini_realtime::{LiveEvent, LiveSession, types::DEFAULT_IMAGE_MIME_TYPE};
use live_agent_core::{
    telemetry::Telemetry,
    turn::{ContentKind, Role},
};
use std::sync::Arc;
use tokio::{sync::Mutex, task::JoinError};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

/// Everything the loops share about one session.
#[derive(Clone)]
pub(crate) struct RelayContext {
    pub record: Arc<SessionRecord>,
    pub upstream: Arc<LiveSession>,
    pub telemetry: Telemetry,
}

impl RelayContext {
    fn log_turn(&self, role: Role, kind: ContentKind, content: &str) {
        self.record.log_turn(role, kind, content);
        self.telemetry.turn(self.record.id(), role, kind, content);
    }
}

/// Runs both loops until the first one finishes, then cancels and awaits the
/// other. Removal from the registry cancels both. Returns the first error
/// either loop produced.
pub(crate) async fn run<S: FrameSource, K: FrameSink>(
    ctx: RelayContext,
    source: S,
    sink: Arc<Mutex<K>>,
) -> Result<()> {
    let record = ctx.record.clone();
    let cancel = record.end_token().child_token();

    let mut inbound = tokio::spawn(
        client_to_upstream(ctx.clone(), source, cancel.clone()).in_current_span(),
    );
    let mut outbound =
        tokio::spawn(upstream_to_client(ctx, sink, cancel.clone()).in_current_span());

    let (client_done, first) = tokio::select! {
        result = &mut inbound => (true, result),
        result = &mut outbound => (false, result),
    };

    // Draining
    if record.is_ended() {
        info!("Session ended by the registry");
    }
    cancel.cancel();
    let remaining = if client_done { outbound } else { inbound };
    let first = flatten(first);
    let second = flatten(remaining.await);

    match (first, second) {
        (Err(e), Err(other)) => {
            debug!(error = %other, "Second relay loop also failed");
            Err(e)
        }
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Ok(()), Ok(())) => Ok(()),
    }
}

fn flatten(joined: Result<Result<()>, JoinError>) -> Result<()> {
    joined.map_err(|e| anyhow!("relay task failed: {e}"))?
}

/// Forwards client frames upstream until the client leaves, the upstream
/// session becomes inactive, or the loop is cancelled.
async fn client_to_upstream<S: FrameSource>(
    ctx: RelayContext,
    mut source: S,
    cancel: CancellationToken,
) -> Result<()> {
    while ctx.upstream.is_active() {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Client loop cancelled");
                return Ok(());
            }
            next = source.next() => next,
        };

        let frame = match next {
            Some(Ok(Frame::Close)) | None => {
                info!("Client disconnected");
                return Ok(());
            }
            Some(Err(e)) => {
                info!(error = %e, "Client connection lost");
                return Ok(());
            }
            Some(Ok(frame)) => frame,
        };
        ctx.record.touch();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Client loop cancelled");
                return Ok(());
            }
            result = forward_frame(&ctx, frame) => result?,
        }
    }
    debug!("Upstream session inactive; client loop done");
    Ok(())
}

async fn forward_frame(ctx: &RelayContext, frame: Frame) -> Result<()> {
    match frame {
        Frame::Binary(audio) => {
            if !audio.is_empty() {
                ctx.upstream.send_audio(&audio).await?;
            }
        }
        Frame::Text(text) => forward_command(ctx, &text).await?,
        Frame::Close => {}
    }
    Ok(())
}

async fn forward_command(ctx: &RelayContext, text: &str) -> Result<()> {
    let command = match serde_json::from_str::<ClientMessage>(text) {
        Ok(command) => command,
        Err(e) => {
            debug!(error = %e, "Ignoring unrecognized client message");
            return Ok(());
        }
    };

    match command {
        ClientMessage::Config { preset } => {
            debug!(?preset, "Ignoring config message after streaming started");
        }
        ClientMessage::Image { data, mime_type } => {
            if data.is_empty() {
                return Ok(());
            }
            let image = match base64::engine::general_purpose::STANDARD.decode(data.as_bytes()) {
                Ok(image) => image,
                Err(e) => {
                    warn!(error = %e, "Dropping image with invalid base64 payload");
                    return Ok(());
                }
            };
            let mime_type = mime_type.as_deref().unwrap_or(DEFAULT_IMAGE_MIME_TYPE);
            ctx.upstream.send_image(&image, mime_type).await?;
            ctx.log_turn(Role::User, ContentKind::Image, "");
        }
        ClientMessage::Text { text } => {
            if text.is_empty() {
                return Ok(());
            }
            ctx.upstream.send_text(&text).await?;
            ctx.log_turn(Role::User, ContentKind::Text, &text);
        }
    }
    Ok(())
}

/// Forwards upstream events to the client until the event stream ends, a
/// client write fails, or the loop is cancelled.
async fn upstream_to_client<K: FrameSink>(
    ctx: RelayContext,
    sink: Arc<Mutex<K>>,
    cancel: CancellationToken,
) -> Result<()> {
    let events = ctx.upstream.receive();
    tokio::pin!(events);

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Upstream loop cancelled");
                return Ok(());
            }
            event = events.next() => event,
        };
        let Some(event) = event else {
            info!("Upstream event stream ended");
            return Ok(());
        };
        ctx.record.touch();

        let Some(delivery) = to_client(&ctx, event) else {
            continue;
        };
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Upstream loop cancelled");
                return Ok(());
            }
            written = deliver(&sink, delivery) => written,
        };
        if let Err(e) = written {
            info!(error = %e, "Client write failed; client presumed gone");
            return Ok(());
        }
    }
}

enum Delivery {
    Audio(Bytes),
    Message(ServerMessage),
}

fn to_client(ctx: &RelayContext, event: LiveEvent) -> Option<Delivery> {
    let delivery = match event {
        LiveEvent::Audio(audio) => Delivery::Audio(Bytes::from(audio)),
        LiveEvent::Text(text) => {
            ctx.log_turn(Role::Assistant, ContentKind::Text, &text);
            Delivery::Message(ServerMessage::Transcript { text })
        }
        LiveEvent::InputTranscript(text) => {
            ctx.log_turn(Role::User, ContentKind::Text, &text);
            Delivery::Message(ServerMessage::InputTranscript { text })
        }
        LiveEvent::Interrupted => {
            debug!("Assistant interrupted");
            Delivery::Message(ServerMessage::Interrupted)
        }
        LiveEvent::TurnComplete => Delivery::Message(ServerMessage::TurnComplete),
        LiveEvent::ToolCall(call) => {
            info!(tool_call = %call, "Upstream requested a tool call");
            return None;
        }
    };
    Some(delivery)
}

async fn deliver<K: FrameSink>(sink: &Mutex<K>, delivery: Delivery) -> Result<()> {
    match delivery {
        Delivery::Audio(audio) => sink.lock().await.send(Frame::Binary(audio)).await,
        Delivery::Message(msg) => send_msg(sink, msg).await,
    }
}
