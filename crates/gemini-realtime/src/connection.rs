//! The upstream connection contract and its WebSocket implementation.

use crate::{
    error::LiveError,
    types::{
        AudioTranscriptionConfig, ClientMessage, Content, GenerationConfig, GoogleSearch, Part,
        PrebuiltVoiceConfig, ResponseModality, ServerMessage, Setup, SpeechConfig, Tool,
        VoiceConfig,
    },
};
use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use secrecy::{ExposeSecret, SecretString};
use std::{collections::BTreeSet, time::Duration};
use tokio::{net::TcpStream, sync::Mutex};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, protocol::Message as WsMessage},
};
use tracing::{debug, info, warn};

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// An established, duplex connection to the Live API.
///
/// `send` and `recv` may be called concurrently from different tasks.
#[async_trait]
pub trait LiveConnection: Send + Sync {
    async fn send(&self, message: ClientMessage) -> Result<(), LiveError>;

    /// Next raw server message. `None` once the stream has ended.
    async fn recv(&self) -> Option<Result<Vec<u8>, LiveError>>;

    async fn close(&self) -> Result<(), LiveError>;
}

/// Establishes connections configured for one session.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &LiveConfig) -> Result<Box<dyn LiveConnection>, LiveError>;
}

/// Per-session behaviour negotiated during setup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveConfig {
    pub instructions: String,
    pub voice: String,
    /// Capability names such as `google_search`. Unknown names are ignored.
    pub capabilities: BTreeSet<String>,
}

impl LiveConfig {
    /// Builds the setup message: audio responses with transcripts of both sides.
    pub fn setup(&self, model: &str) -> Setup {
        let tools = self
            .capabilities
            .iter()
            .filter_map(|capability| match capability.as_str() {
                "google_search" => Some(Tool {
                    google_search: Some(GoogleSearch {}),
                }),
                other => {
                    debug!(capability = other, "Ignoring unsupported capability");
                    None
                }
            })
            .collect();

        let speech_config = (!self.voice.is_empty()).then(|| SpeechConfig {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: self.voice.clone(),
                },
            },
        });

        let system_instruction = (!self.instructions.is_empty()).then(|| Content {
            role: None,
            parts: vec![Part {
                text: self.instructions.clone(),
            }],
        });

        Setup {
            model: model.to_string(),
            generation_config: GenerationConfig {
                response_modalities: vec![ResponseModality::Audio],
                speech_config,
            },
            system_instruction,
            tools,
            input_audio_transcription: Some(AudioTranscriptionConfig::default()),
            output_audio_transcription: Some(AudioTranscriptionConfig::default()),
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`LiveConnection`] over a tungstenite WebSocket.
pub struct WsConnection {
    sink: Mutex<SplitSink<WsStream, WsMessage>>,
    stream: Mutex<SplitStream<WsStream>>,
}

impl WsConnection {
    fn new(ws: WsStream) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }
}

#[async_trait]
impl LiveConnection for WsConnection {
    async fn send(&self, message: ClientMessage) -> Result<(), LiveError> {
        let payload = serde_json::to_string(&message)?;
        self.sink
            .lock()
            .await
            .send(WsMessage::Text(payload.into()))
            .await?;
        Ok(())
    }

    async fn recv(&self) -> Option<Result<Vec<u8>, LiveError>> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text.into_bytes())),
                Ok(WsMessage::Binary(data)) => return Some(Ok(data)),
                Ok(WsMessage::Close(frame)) => {
                    info!(?frame, "Gemini WebSocket connection closed by server.");
                    return None;
                }
                Ok(_) => continue,
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => return None,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&self) -> Result<(), LiveError> {
        match self.sink.lock().await.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Connects to the Gemini Live WebSocket endpoint and completes the setup
/// handshake before handing the connection out.
pub struct GeminiConnector {
    api_key: SecretString,
    model: String,
    endpoint: String,
    handshake_timeout: Duration,
}

impl GeminiConnector {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: SecretString::from(api_key.into()),
            model: model.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Connector for GeminiConnector {
    async fn connect(&self, config: &LiveConfig) -> Result<Box<dyn LiveConnection>, LiveError> {
        let url = format!("{}?key={}", self.endpoint, self.api_key.expose_secret());
        let (ws_stream, _) = connect_async(url).await?;
        info!(model = %self.model, "Connected to Gemini Live WebSocket.");

        let connection = WsConnection::new(ws_stream);
        connection
            .send(ClientMessage::Setup(config.setup(&self.model)))
            .await?;

        match tokio::time::timeout(self.handshake_timeout, wait_for_setup(&connection)).await {
            Ok(Ok(())) => {
                info!("Gemini session setup is complete.");
                Ok(Box::new(connection))
            }
            Ok(Err(e)) => {
                let _ = connection.close().await;
                Err(e)
            }
            Err(_) => {
                let _ = connection.close().await;
                Err(LiveError::Handshake(format!(
                    "no setupComplete within {:?}",
                    self.handshake_timeout
                )))
            }
        }
    }
}

async fn wait_for_setup(connection: &WsConnection) -> Result<(), LiveError> {
    while let Some(payload) = connection.recv().await {
        let payload = payload?;
        match serde_json::from_slice::<ServerMessage>(&payload) {
            Ok(msg) if msg.setup_complete.is_some() => return Ok(()),
            Ok(msg) => debug!(?msg, "Ignoring message received before setupComplete"),
            Err(e) => warn!(error = %e, "Failed to parse Gemini message during setup"),
        }
    }
    Err(LiveError::Handshake(
        "connection closed before setupComplete".to_string(),
    ))
}
