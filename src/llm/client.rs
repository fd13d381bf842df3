//! Chat client using RIG with the Gemini provider.

use anyhow::{Context, Result};
use rig::agent::Agent;
use rig::client::CompletionClient;
use rig::completion::Chat;
use rig::message::Message;
use rig::providers::gemini;
use tracing::{debug, info};

use crate::config::{AppConfig, GREETING};

/// Request/response chat against the text model.
pub struct ChatClient {
    agent: Agent<gemini::completion::CompletionModel>,
    history: Vec<Message>, // Completed exchanges, oldest first
    max_history: usize,    // Exchanges kept
}

impl ChatClient {
    /// Create a chat client with the given persona as preamble.
    ///
    /// # Errors
    /// Returns an error if no API key is configured or the client cannot be built.
    pub fn new(config: &AppConfig, persona: &str) -> Result<Self> {
        let api_key = config.api_key().context("API_KEY is required for chat")?;

        info!("Using chat model: {}", config.chat_model);

        let client = gemini::Client::builder().api_key(api_key).build().context("Failed to create Gemini client")?;

        let agent = client.agent(&config.chat_model).preamble(persona).temperature(config.temperature as f64).build();

        Ok(Self { agent, history: Vec::new(), max_history: config.max_history.max(1) })
    }

    /// Opening line shown before the first exchange. Not part of the history.
    pub fn greeting(&self) -> &'static str {
        GREETING
    }

    /// Send a message and wait for the complete reply.
    ///
    /// # Errors
    /// Returns an error if the request fails; history is left untouched.
    pub async fn chat(&mut self, message: &str) -> Result<String> {
        debug!("User: {}", message);

        let response = self.agent.chat(message, self.history.clone()).await.context("Chat request failed")?;

        debug!("Assistant: {}", response);

        self.history.push(Message::user(message));
        self.history.push(Message::assistant(&response));
        trim_history(&mut self.history, self.max_history);

        Ok(response)
    }
}

/// Drop whole exchanges from the front until at most `max_exchanges` remain.
fn trim_history(history: &mut Vec<Message>, max_exchanges: usize) {
    let limit = max_exchanges * 2;
    if history.len() > limit {
        let excess = history.len() - limit;
        // Keep user/assistant pairs aligned
        history.drain(..excess + excess % 2);
    }
}
