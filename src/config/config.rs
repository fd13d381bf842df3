//! Application configuration and CLI argument parsing.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use super::voices::{self, DEFAULT_VOICE};
use crate::session::AppMode;

/// Live endpoint of the bidirectional audio service.
const DEFAULT_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Opening line of every conversation, in both modes.
pub const GREETING: &str = "Olá, como te ajudar nessa caminhada? Fala ai um tema que te explico";

/// Persona used when no persona file is present.
const DEFAULT_PERSONA: &str = "Você é uma assistente virtual acadêmica: divertida, objetiva, bem-humorada e muito inteligente. \
Fale como uma mentora experiente, trate o usuário de forma neutra e responda em português do Brasil. \
Inicie SEMPRE a primeira interação com a frase exata: \"Olá, como te ajudar nessa caminhada? Fala ai um tema que te explico\"";

/// Live voice assistant configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "live-voice-assistant")]
#[command(author, version, about = "A real-time voice assistant for live conversational audio", long_about = None)]
pub struct AppConfig {
    /// List all prebuilt voices and exit
    #[arg(long)]
    pub list_voices: bool,

    /// Show information about a specific voice and exit
    #[arg(long)]
    pub voice_info: Option<String>,

    /// API key for the live and chat services
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// WebSocket endpoint of the live audio service
    #[arg(long, env = "LIVE_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Model used for live voice sessions
    #[arg(long, env = "VOICE_MODEL", default_value = "gemini-2.5-flash-native-audio-preview-09-2025")]
    pub voice_model: String,

    /// Model used for text chat
    #[arg(long, env = "CHAT_MODEL", default_value = "gemini-2.5-flash")]
    pub chat_model: String,

    /// Prebuilt voice for spoken replies (see --list-voices)
    #[arg(long, default_value = DEFAULT_VOICE)]
    pub voice: String,

    /// File with the assistant persona / system instruction
    #[arg(long, short = 'p', env = "PERSONA_FILE", default_value_os_t = default_persona_path())]
    pub persona_file: PathBuf,

    /// Microphone sample rate sent to the live service
    #[arg(long, default_value = "16000")]
    pub sample_rate: u32,

    /// Samples per capture window (power of two, 256-16384)
    #[arg(long, default_value = "4096", value_parser = parse_window)]
    pub window: usize,

    /// Preferred output device rate, also assumed for inbound speech without a declared rate
    #[arg(long, default_value = "24000")]
    pub playback_rate: u32,

    /// Outbound chunks buffered before new ones are dropped
    #[arg(long, default_value = "64")]
    pub outbound_queue: usize,

    /// Volume meter refresh interval in milliseconds
    #[arg(long, default_value = "50")]
    pub meter_interval_ms: u64,

    /// Starting mode
    #[arg(long, value_enum, default_value = "voice")]
    pub mode: AppMode,

    /// Connect the voice session immediately on startup
    #[arg(long)]
    pub auto_connect: bool,

    /// Chat temperature (0.0-2.0)
    #[arg(long, default_value = "0.7", value_parser = parse_temperature)]
    pub temperature: f32,

    /// Maximum chat history length
    #[arg(long, default_value = "10")]
    pub max_history: usize,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

impl AppConfig {
    /// Parse configuration from command line arguments.
    ///
    /// Voice listing flags print and exit.
    pub fn from_args() -> Self {
        let config = Self::parse();

        if config.list_voices {
            voices::print_voices();
            std::process::exit(0);
        }

        if let Some(ref voice_name) = config.voice_info {
            match voices::print_voice_info(voice_name) {
                Ok(_) => std::process::exit(0),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }

        config
    }

    /// Canonical spelling of the configured voice.
    pub fn voice_name(&self) -> &str {
        voices::get_voice(&self.voice).map_or(self.voice.as_str(), |voice| voice.name)
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().map(str::trim).filter(|key| !key.is_empty())
    }

    pub fn meter_interval(&self) -> Duration {
        Duration::from_millis(self.meter_interval_ms)
    }

    /// Load the persona file, falling back to the built-in persona when it does not exist.
    pub fn persona(&self) -> Result<String> {
        if !self.persona_file.exists() {
            return Ok(DEFAULT_PERSONA.to_string());
        }
        let text = std::fs::read_to_string(&self.persona_file)
            .with_context(|| format!("Failed to read persona file: {}", self.persona_file.display()))?;
        let text = text.trim();
        if text.is_empty() {
            warn!("Persona file {} is empty, using built-in persona", self.persona_file.display());
            return Ok(DEFAULT_PERSONA.to_string());
        }
        Ok(text.to_string())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if voices::get_voice(&self.voice).is_none() {
            anyhow::bail!("Unknown voice '{}'. Run with --list-voices to see available voices", self.voice);
        }

        if !(8000..=48000).contains(&self.sample_rate) {
            anyhow::bail!("Sample rate must be between 8000 and 48000 Hz");
        }

        if !(8000..=48000).contains(&self.playback_rate) {
            anyhow::bail!("Playback rate must be between 8000 and 48000 Hz");
        }

        if self.outbound_queue == 0 {
            anyhow::bail!("Outbound queue must hold at least one chunk");
        }

        if self.meter_interval_ms < 10 {
            anyhow::bail!("Meter interval must be at least 10 ms");
        }

        if self.endpoint.trim().is_empty() {
            anyhow::bail!("Endpoint must not be empty");
        }

        if self.api_key().is_none() {
            warn!("API_KEY is not set; connecting will fail until it is provided");
        }

        Ok(())
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        info!("Configuration:");
        info!("  Endpoint: {}", self.endpoint);
        info!("  Voice model: {}", self.voice_model);
        info!("  Chat model: {}", self.chat_model);
        info!("  Voice: {}", self.voice_name());
        info!("  Persona file: {}", self.persona_file.display());
        info!(
            "  Capture: {} Hz, {} samples per window ({:.0} ms)",
            self.sample_rate,
            self.window,
            self.window as f64 * 1000.0 / self.sample_rate as f64
        );
        info!("  Playback rate: {} Hz", self.playback_rate);
        info!("  Outbound queue: {} chunks", self.outbound_queue);
        info!("  Start mode: {}", self.mode);
        if self.auto_connect {
            info!("  Auto-connect: enabled");
        }
    }
}

/// Default persona location (<config dir>/live-voice-assistant/persona.md).
fn default_persona_path() -> PathBuf {
    match dirs::config_dir() {
        Some(dir) => dir.join("live-voice-assistant").join("persona.md"),
        None => PathBuf::from("persona.md"),
    }
}

/// Parse and validate a capture window size.
fn parse_window(s: &str) -> Result<usize, String> {
    let value: usize = s.parse().map_err(|_| format!("'{}' is not a valid window size", s))?;
    if (256..=16384).contains(&value) && value.is_power_of_two() {
        Ok(value)
    } else {
        Err(format!("window must be a power of two between 256 and 16384, got {}", value))
    }
}

/// Parse and validate temperature value (0.0-2.0).
fn parse_temperature(s: &str) -> Result<f32, String> {
    let value: f32 = s.parse().map_err(|_| format!("'{}' is not a valid float", s))?;
    if (0.0..=2.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("temperature must be between 0.0 and 2.0, got {}", value))
    }
}
