//! WebSocket session with the live conversational endpoint.
//!
//! A connect attempt opens the socket, sends the setup message and waits for
//! `setupComplete`. After that the socket is split between two tasks: a writer
//! draining one bounded outbound queue, and a reader turning frames into
//! [`ServerEvent`]s. The controller only ever sees the two channel ends.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{ClientMessage, MediaInput, ServerEvent, Setup, parse_server_frame};
use crate::error::TransportError;

/// Inbound events buffered between the reader task and the event loop.
const INBOUND_QUEUE_SIZE: usize = 256;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Opens sessions. Implemented by the real endpoint and by test doubles.
pub trait Connector {
    /// Cheap checks that must pass before any device is acquired.
    fn preflight(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Open a session and complete the handshake.
    ///
    /// The returned future owns everything it needs so it can run on its own task
    /// and be aborted at any point.
    fn connect(&self, setup: Setup) -> BoxFuture<'static, Result<SessionHandle, TransportError>>;
}

/// The controller's end of an open session.
pub struct SessionHandle {
    id: u64,
    outbound: mpsc::Sender<MediaInput>,
    inbound: mpsc::Receiver<ServerEvent>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub(crate) fn new(
        id: u64,
        outbound: mpsc::Sender<MediaInput>,
        inbound: mpsc::Receiver<ServerEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self { id, outbound, inbound, cancel }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue one chunk for sending. Never waits.
    ///
    /// A full queue or a closed session drops the chunk; returns whether it was queued.
    pub fn send(&self, input: MediaInput) -> bool {
        match self.outbound.try_send(input) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Outbound queue full, chunk dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Session {} closed, chunk dropped", self.id);
                false
            }
        }
    }

    /// Next inbound event; `None` once the reader task is gone.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.inbound.recv().await
    }

    /// Ask both socket tasks to stop. Idempotent.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Closing session {}", self.id);
            self.cancel.cancel();
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Connector for the Gemini live WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct GeminiConnector {
    endpoint: String,
    api_key: Option<String>,
    outbound_depth: usize,
    handshake_timeout: Duration,
}

impl GeminiConnector {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, outbound_depth: usize) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            outbound_depth: outbound_depth.max(1),
            handshake_timeout: Duration::from_secs(15),
        }
    }
}

impl Connector for GeminiConnector {
    fn preflight(&self) -> Result<(), TransportError> {
        match self.api_key {
            Some(_) => Ok(()),
            None => Err(TransportError::MissingApiKey),
        }
    }

    fn connect(&self, setup: Setup) -> BoxFuture<'static, Result<SessionHandle, TransportError>> {
        let endpoint = self.endpoint.clone();
        let api_key = self.api_key.clone();
        let depth = self.outbound_depth;
        let timeout = self.handshake_timeout;

        async move {
            let api_key = api_key.ok_or(TransportError::MissingApiKey)?;
            let url = format!("{}?key={}", endpoint, api_key);

            let socket = tokio::time::timeout(timeout, open(&url, &setup))
                .await
                .map_err(|_| TransportError::HandshakeTimeout)??;

            Ok(spawn_session(socket, depth))
        }
        .boxed()
    }
}

/// Open the socket, send `setup` and wait for the acknowledgement.
async fn open(url: &str, setup: &Setup) -> Result<Socket, TransportError> {
    let (mut socket, _response) = connect_async(url).await?;
    debug!("WebSocket connected, sending setup for {}", setup.model);

    let payload = serde_json::to_string(&ClientMessage::Setup(setup.clone()))?;
    socket.send(Message::Text(payload.into())).await?;

    while let Some(frame) = socket.next().await {
        let payload = match frame? {
            Message::Text(text) => text.as_bytes().to_vec(),
            Message::Binary(bytes) => bytes.to_vec(),
            Message::Close(frame) => {
                let reason = frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default();
                return Err(TransportError::Handshake(format!("closed during setup: {reason}")));
            }
            _ => continue,
        };

        match parse_server_frame(&payload) {
            Ok(events) if events.contains(&ServerEvent::SetupComplete) => return Ok(socket),
            Ok(_) => debug!("Ignoring frame received before setupComplete"),
            Err(e) => warn!("Unparseable frame during setup: {}", e),
        }
    }

    Err(TransportError::Handshake("connection ended during setup".into()))
}

fn spawn_session<S>(socket: WebSocketStream<S>, depth: usize) -> SessionHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    static NEXT_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
    let id = NEXT_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let (mut write, mut read) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<MediaInput>(depth);
    let (inbound_tx, inbound_rx) = mpsc::channel::<ServerEvent>(INBOUND_QUEUE_SIZE);
    let cancel = CancellationToken::new();

    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let input = tokio::select! {
                _ = writer_cancel.cancelled() => break,
                input = outbound_rx.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
            };

            let payload = match serde_json::to_string(&ClientMessage::from(input)) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Failed to encode outbound chunk: {}", e);
                    continue;
                }
            };
            if let Err(e) = write.send(Message::Text(payload.into())).await {
                debug!("Outbound send failed, dropping chunk: {}", e);
            }
        }
        let _ = write.close().await;
        debug!("Session {} writer stopped", id);
    });

    let reader_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = reader_cancel.cancelled() => break,
                frame = read.next() => frame,
            };

            let payload = match frame {
                Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.as_str().to_string()).filter(|r| !r.is_empty());
                    let _ = inbound_tx.send(ServerEvent::Closed { reason }).await;
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    let _ = inbound_tx.send(ServerEvent::Error(e.to_string())).await;
                    break;
                }
                None => {
                    let _ = inbound_tx.send(ServerEvent::Closed { reason: None }).await;
                    break;
                }
            };

            let events = match parse_server_frame(&payload) {
                Ok(events) => events,
                Err(e) => {
                    warn!("Ignoring unparseable server frame: {}", e);
                    continue;
                }
            };
            for event in events {
                if inbound_tx.send(event).await.is_err() {
                    return;
                }
            }
        }
        reader_cancel.cancel();
        debug!("Session {} reader stopped", id);
    });

    info!("Live session {} established", id);
    SessionHandle::new(id, outbound_tx, inbound_rx, cancel)
}
