//! Typed facade over one upstream connection.

use crate::{
    connection::LiveConnection,
    error::LiveError,
    event::{LiveEvent, normalize},
    types::{
        AUDIO_INPUT_MIME_TYPE, Blob, ClientContent, ClientMessage, Content, FunctionResponse,
        Part, RealtimeInput, ServerMessage, ToolResponse,
    },
};
use base64::Engine;
use futures::{Stream, stream};
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One live upstream session.
///
/// The session starts active and becomes inactive, permanently, on the first
/// failed primary send, a failed or finished receive, or [`close`](Self::close).
/// While inactive every send is a no-op and [`receive`](Self::receive) ends.
pub struct LiveSession {
    connection: Box<dyn LiveConnection>,
    active: AtomicBool,
    /// Cancelled on deactivation; wakes a pending `recv`.
    deactivated: CancellationToken,
    closed: AtomicBool,
    turn_count: AtomicU64,
}

impl LiveSession {
    pub fn new(connection: Box<dyn LiveConnection>) -> Self {
        Self {
            connection,
            active: AtomicBool::new(true),
            deactivated: CancellationToken::new(),
            closed: AtomicBool::new(false),
            turn_count: AtomicU64::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Number of turn completions observed so far.
    pub fn turn_count(&self) -> u64 {
        self.turn_count.load(Ordering::SeqCst)
    }

    /// Sends a chunk of 16 kHz mono PCM16 audio.
    pub async fn send_audio(&self, audio: &[u8]) -> Result<(), LiveError> {
        let input = RealtimeInput {
            audio: Some(blob(AUDIO_INPUT_MIME_TYPE, audio)),
            video: None,
        };
        self.send_primary(ClientMessage::RealtimeInput(input), "audio")
            .await
    }

    /// Sends one camera or screen frame.
    pub async fn send_image(&self, image: &[u8], mime_type: &str) -> Result<(), LiveError> {
        let input = RealtimeInput {
            audio: None,
            video: Some(blob(mime_type, image)),
        };
        self.send_primary(ClientMessage::RealtimeInput(input), "image")
            .await
    }

    /// Sends a complete user turn consisting of `text`.
    pub async fn send_text(&self, text: &str) -> Result<(), LiveError> {
        let content = ClientContent {
            turns: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: text.to_string(),
                }],
            }],
            turn_complete: true,
        };
        self.send_primary(ClientMessage::ClientContent(content), "text")
            .await
    }

    /// Returns function-call results to the model.
    ///
    /// A failure here is returned but leaves the session active: a lost tool
    /// response does not make the conversation unrecoverable.
    pub async fn send_tool_response(
        &self,
        responses: Vec<FunctionResponse>,
    ) -> Result<(), LiveError> {
        if !self.is_active() {
            return Ok(());
        }
        let message = ClientMessage::ToolResponse(ToolResponse {
            function_responses: responses,
        });
        self.connection.send(message).await.inspect_err(|e| {
            error!(error = %e, "Error sending tool response");
        })
    }

    /// Lazily yields normalized events until the upstream stream ends, fails, or
    /// the session is closed. Malformed messages are logged and skipped.
    pub fn receive(&self) -> impl Stream<Item = LiveEvent> + Send + '_ {
        stream::unfold(
            (self, VecDeque::new()),
            |(session, mut pending)| async move {
                loop {
                    if !session.is_active() {
                        return None;
                    }
                    if let Some(event) = pending.pop_front() {
                        return Some((event, (session, pending)));
                    }
                    let next = tokio::select! {
                        biased;
                        _ = session.deactivated.cancelled() => return None,
                        next = session.connection.recv() => next,
                    };
                    match next {
                        Some(Ok(payload)) => pending.extend(session.decode(&payload)),
                        Some(Err(e)) => {
                            error!(error = %e, "Error in upstream receive loop");
                            session.deactivate();
                            return None;
                        }
                        None => {
                            info!("Upstream stream ended");
                            session.deactivate();
                            return None;
                        }
                    }
                }
            },
        )
    }

    /// Deactivates the session and releases the connection. Only the first call
    /// touches the connection; later calls return `Ok(())`.
    pub async fn close(&self) -> Result<(), LiveError> {
        self.deactivate();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.connection.close().await
    }

    async fn send_primary(&self, message: ClientMessage, what: &str) -> Result<(), LiveError> {
        if !self.is_active() {
            return Ok(());
        }
        if let Err(e) = self.connection.send(message).await {
            error!(error = %e, "Error sending {what}");
            self.deactivate();
            return Err(e);
        }
        Ok(())
    }

    fn decode(&self, payload: &[u8]) -> Vec<LiveEvent> {
        let message = match serde_json::from_slice::<ServerMessage>(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Skipping malformed upstream message");
                return Vec::new();
            }
        };
        if message.go_away.is_some() {
            warn!(go_away = ?message.go_away, "Upstream announced it will disconnect");
        }
        let events = normalize(message);
        let completed = events
            .iter()
            .filter(|e| matches!(e, LiveEvent::TurnComplete))
            .count() as u64;
        if completed > 0 {
            let total = self.turn_count.fetch_add(completed, Ordering::SeqCst) + completed;
            debug!(turn_count = total, "Upstream turn complete");
        }
        events
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.deactivated.cancel();
    }
}

fn blob(mime_type: &str, data: &[u8]) -> Blob {
    Blob {
        mime_type: mime_type.to_string(),
        data: base64::engine::general_purpose::STANDARD.encode(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::channel_connection;
    use futures::StreamExt;
    use serde_json::json;
    use std::{sync::Arc, time::Duration};

    #[tokio::test]
    async fn audio_is_wrapped_in_realtime_input() {
        let (connection, handle) = channel_connection();
        let session = LiveSession::new(Box::new(connection));

        session.send_audio(&[0, 1, 2, 3]).await.unwrap();

        assert_eq!(handle.sent_audio(), vec![vec![0, 1, 2, 3]]);
        assert!(session.is_active());
    }

    #[tokio::test]
    async fn text_is_a_complete_user_turn() {
        let (connection, handle) = channel_connection();
        let session = LiveSession::new(Box::new(connection));

        session.send_text("hello").await.unwrap();

        let sent = serde_json::to_value(&handle.sent()[0]).unwrap();
        assert_eq!(
            sent,
            json!({"clientContent": {
                "turns": [{"role": "user", "parts": [{"text": "hello"}]}],
                "turnComplete": true
            }})
        );
    }

    #[tokio::test]
    async fn primary_send_failure_deactivates_and_later_sends_are_noops() {
        let (connection, handle) = channel_connection();
        let session = LiveSession::new(Box::new(connection));
        handle.fail_sends(true);

        assert!(matches!(
            session.send_image(b"jpeg", "image/jpeg").await,
            Err(LiveError::Transport(_))
        ));
        assert!(!session.is_active());

        handle.fail_sends(false);
        session.send_text("ignored").await.unwrap();
        session.send_audio(&[1]).await.unwrap();
        assert!(handle.sent().is_empty());
    }

    #[tokio::test]
    async fn tool_response_failure_keeps_session_active() {
        let (connection, handle) = channel_connection();
        let session = LiveSession::new(Box::new(connection));
        handle.fail_sends(true);

        let result = session
            .send_tool_response(vec![FunctionResponse {
                id: Some("call-1".into()),
                name: "lookup".into(),
                response: json!({"ok": true}),
            }])
            .await;

        assert!(result.is_err());
        assert!(session.is_active());
    }

    #[tokio::test]
    async fn receive_skips_malformed_messages_and_counts_turns() {
        let (connection, handle) = channel_connection();
        let session = LiveSession::new(Box::new(connection));

        handle.push_raw(b"{not json".to_vec());
        handle.push_json(json!({"serverContent": {"interrupted": "yes"}}));
        handle.push_json(json!({"serverContent": {"outputTranscription": {"text": "hi"}, "turnComplete": true}}));
        handle.push_json(json!({"serverContent": {"turnComplete": true}}));
        handle.end();

        let events: Vec<LiveEvent> = session.receive().collect().await;

        assert_eq!(
            events,
            vec![
                LiveEvent::Text("hi".into()),
                LiveEvent::TurnComplete,
                LiveEvent::TurnComplete
            ]
        );
        assert_eq!(session.turn_count(), 2);
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn receive_error_is_terminal() {
        let (connection, handle) = channel_connection();
        let session = LiveSession::new(Box::new(connection));

        handle.push_error("reset by peer");
        handle.push_json(json!({"serverContent": {"turnComplete": true}}));

        let events: Vec<LiveEvent> = session.receive().collect().await;

        assert!(events.is_empty());
        assert!(!session.is_active());
        assert_eq!(session.turn_count(), 0);
    }

    #[tokio::test]
    async fn close_ends_a_pending_receive() {
        let (connection, handle) = channel_connection();
        let session = Arc::new(LiveSession::new(Box::new(connection)));

        let receiver = tokio::spawn({
            let session = session.clone();
            async move { session.receive().collect::<Vec<LiveEvent>>().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.close().await.unwrap();

        let events = tokio::time::timeout(Duration::from_secs(2), receiver)
            .await
            .expect("receive did not end after close")
            .unwrap();
        assert!(events.is_empty());
        assert!(!session.is_active());
        assert_eq!(handle.close_calls(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (connection, handle) = channel_connection();
        let session = LiveSession::new(Box::new(connection));

        session.close().await.unwrap();
        session.close().await.unwrap();

        assert!(!session.is_active());
        assert_eq!(handle.close_calls(), 1);
        let events: Vec<LiveEvent> = session.receive().collect().await;
        assert!(events.is_empty());
    }
}
