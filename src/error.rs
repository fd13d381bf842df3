//! Error taxonomy for the live audio session.
//!
//! Fatal errors (`SessionError`) always end in a full teardown; recoverable ones
//! (`DecodeError`, dropped sends) are logged and never change the connection state.

use thiserror::Error;

/// User-facing message for failures while starting audio.
const MSG_AUDIO_START: &str = "Falha ao iniciar o áudio.";

/// User-facing message for any transport failure.
const MSG_CONNECTION: &str = "Erro de conexão com o servidor.";

/// User-facing message for missing credentials.
const MSG_MISSING_KEY: &str = "Chave de API não encontrada nas variáveis de ambiente.";

/// Failure to turn an inbound audio payload into a playable buffer.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PCM16 payload has an odd byte count ({0})")]
    OddLength(usize),

    #[error("empty audio payload")]
    Empty,
}

/// Failures of the connection to the remote service.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no API key configured")]
    MissingApiKey,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("connection task ended unexpectedly")]
    Aborted,
}

/// Errors that are fatal to a session (or to a connect attempt).
#[derive(Debug, Error)]
pub enum SessionError {
    /// The microphone or speaker could not be opened or started.
    #[error("audio device error: {0:#}")]
    Acquisition(anyhow::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// Short localized message suitable for showing to the user.
    pub fn user_message(&self) -> &'static str {
        match self {
            SessionError::Acquisition(_) => MSG_AUDIO_START,
            SessionError::Transport(TransportError::MissingApiKey) => MSG_MISSING_KEY,
            SessionError::Transport(_) => MSG_CONNECTION,
        }
    }
}
