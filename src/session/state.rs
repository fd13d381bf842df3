//! Values shared between the session controller and the UI.

use std::fmt;

use clap::ValueEnum;

/// Lifecycle of the live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    /// Whether `connect()` may start from this state.
    pub fn can_connect(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(label)
    }
}

/// Which panel the user is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum AppMode {
    #[default]
    Voice,
    Chat,
}

impl fmt::Display for AppMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppMode::Voice => f.write_str("voice"),
            AppMode::Chat => f.write_str("chat"),
        }
    }
}

/// Everything the UI renders, published on a watch channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UiSnapshot {
    pub state: ConnectionState,
    pub mode: AppMode,
    pub input_volume: f32,
    pub output_volume: f32,
    pub error: Option<&'static str>,
}

/// Requests from the UI to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Teardown,
    SwitchMode(AppMode),
}
