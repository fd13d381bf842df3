//! Text chat collaborator.
//!
//! Uses RIG with the Gemini provider, sharing the voice session's persona.

mod client;

pub use client::ChatClient;
