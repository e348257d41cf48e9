//! In-memory [`LiveConnection`] for tests.

use crate::{
    connection::{Connector, LiveConfig, LiveConnection},
    error::LiveError,
    types::{ClientMessage, RealtimeInput},
};
use async_trait::async_trait;
use base64::Engine;
use std::sync::{
    Arc, Mutex as StdMutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use tokio::sync::{Mutex, mpsc};

type Inbound = Result<Vec<u8>, LiveError>;

/// Connection whose server side is driven by a [`ChannelHandle`].
pub struct ChannelConnection {
    inbound: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    sent: StdMutex<Vec<ClientMessage>>,
    fail_sends: AtomicBool,
    fail_close: AtomicBool,
    hang_close: AtomicBool,
    close_calls: AtomicUsize,
}

/// Test-side control of a [`ChannelConnection`].
#[derive(Clone)]
pub struct ChannelHandle {
    inbound_tx: Arc<StdMutex<Option<mpsc::UnboundedSender<Inbound>>>>,
    shared: Arc<Shared>,
}

pub fn channel_connection() -> (ChannelConnection, ChannelHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared::default());
    (
        ChannelConnection {
            inbound: Mutex::new(rx),
            shared: shared.clone(),
        },
        ChannelHandle {
            inbound_tx: Arc::new(StdMutex::new(Some(tx))),
            shared,
        },
    )
}

impl ChannelHandle {
    pub fn push_json(&self, value: serde_json::Value) {
        self.push(Ok(value.to_string().into_bytes()));
    }

    pub fn push_raw(&self, payload: Vec<u8>) {
        self.push(Ok(payload));
    }

    pub fn push_error(&self, message: &str) {
        self.push(Err(LiveError::Transport(message.to_string())));
    }

    /// Ends the server stream once queued messages are consumed.
    pub fn end(&self) {
        self.inbound_tx.lock().unwrap().take();
    }

    pub fn fail_sends(&self, fail: bool) {
        self.shared.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Makes `close` return an error.
    pub fn fail_close(&self, fail: bool) {
        self.shared.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Makes `close` never complete.
    pub fn hang_close(&self, hang: bool) {
        self.shared.hang_close.store(hang, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        self.shared.sent.lock().unwrap().clone()
    }

    /// Decoded audio payloads of every realtime-input audio message sent.
    pub fn sent_audio(&self) -> Vec<Vec<u8>> {
        self.sent_blobs(|input| input.audio.as_ref())
    }

    /// Decoded image payloads of every realtime-input video message sent.
    pub fn sent_images(&self) -> Vec<Vec<u8>> {
        self.sent_blobs(|input| input.video.as_ref())
    }

    pub fn close_calls(&self) -> usize {
        self.shared.close_calls.load(Ordering::SeqCst)
    }

    fn sent_blobs(
        &self,
        select: impl Fn(&RealtimeInput) -> Option<&crate::types::Blob>,
    ) -> Vec<Vec<u8>> {
        self.sent()
            .iter()
            .filter_map(|msg| match msg {
                ClientMessage::RealtimeInput(input) => select(input),
                _ => None,
            })
            .map(|blob| {
                base64::engine::general_purpose::STANDARD
                    .decode(&blob.data)
                    .unwrap()
            })
            .collect()
    }

    fn push(&self, item: Inbound) {
        if let Some(tx) = self.inbound_tx.lock().unwrap().as_ref() {
            let _ = tx.send(item);
        }
    }
}

#[async_trait]
impl LiveConnection for ChannelConnection {
    async fn send(&self, message: ClientMessage) -> Result<(), LiveError> {
        if self.shared.fail_sends.load(Ordering::SeqCst) {
            return Err(LiveError::Transport("broken pipe".to_string()));
        }
        self.shared.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn recv(&self) -> Option<Inbound> {
        self.inbound.lock().await.recv().await
    }

    async fn close(&self) -> Result<(), LiveError> {
        self.shared.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.shared.hang_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.shared.fail_close.load(Ordering::SeqCst) {
            return Err(LiveError::Transport("close failed".to_string()));
        }
        Ok(())
    }
}

/// Connector handing out [`ChannelConnection`]s and remembering their handles
/// and the configs they were requested with.
#[derive(Clone, Default)]
pub struct ChannelConnector {
    handles: Arc<StdMutex<Vec<ChannelHandle>>>,
    configs: Arc<StdMutex<Vec<LiveConfig>>>,
    refuse: Arc<AtomicBool>,
}

impl ChannelConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent `connect` calls fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn handles(&self) -> Vec<ChannelHandle> {
        self.handles.lock().unwrap().clone()
    }

    pub fn configs(&self) -> Vec<LiveConfig> {
        self.configs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, config: &LiveConfig) -> Result<Box<dyn LiveConnection>, LiveError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(LiveError::Handshake("connection refused".to_string()));
        }
        let (connection, handle) = channel_connection();
        self.handles.lock().unwrap().push(handle);
        self.configs.lock().unwrap().push(config.clone());
        Ok(Box::new(connection))
    }
}
