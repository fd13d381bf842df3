//! Configuration module for the voice assistant.
//!
//! Provides CLI argument parsing, the prebuilt voice table and persona loading.

#[allow(clippy::module_inception)]
mod config;
mod voices;

pub use config::{AppConfig, GREETING};
