//! Terminal front end: command parsing and status rendering.

use std::io::Write;

use crate::session::{AppMode, Command, ConnectionState, UiSnapshot};

/// Width of each level bar in characters.
const BAR_WIDTH: usize = 20;

/// One line typed by the user.
#[derive(Debug, Clone, PartialEq)]
pub enum UserInput {
    Command(Command),
    Text(String),
    Help,
    Quit,
    Empty,
    Unknown(String),
}

pub fn parse_line(line: &str) -> UserInput {
    let line = line.trim();
    if line.is_empty() {
        return UserInput::Empty;
    }
    if !line.starts_with('/') {
        return UserInput::Text(line.to_string());
    }

    match line.split_whitespace().next().unwrap_or_default() {
        "/connect" | "/start" => UserInput::Command(Command::Connect),
        "/end" | "/stop" => UserInput::Command(Command::Teardown),
        "/voice" => UserInput::Command(Command::SwitchMode(AppMode::Voice)),
        "/chat" => UserInput::Command(Command::SwitchMode(AppMode::Chat)),
        "/help" => UserInput::Help,
        "/quit" | "/exit" => UserInput::Quit,
        other => UserInput::Unknown(other.to_string()),
    }
}

pub fn print_help() {
    println!("Commands:");
    println!("  /connect   start a live voice session");
    println!("  /end       end the voice session");
    println!("  /voice     switch to voice mode");
    println!("  /chat      switch to text chat (ends any voice session)");
    println!("  /quit      exit");
    println!("In chat mode, any other line is sent as a message.");
}

/// Render a volume as a fixed-width bar. Values are clamped to [0, 1] for display only.
pub fn level_bar(volume: f32, width: usize) -> String {
    let clamped = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 0.0 };
    let filled = (clamped * width as f32).round() as usize;
    format!("[{}{}]", "#".repeat(filled), ".".repeat(width - filled))
}

/// Prints state transitions and, while connected, a live level line.
#[derive(Default)]
pub struct StatusRenderer {
    last: Option<UiSnapshot>,
    meter_line: bool,
}

impl StatusRenderer {
    pub fn render(&mut self, snapshot: &UiSnapshot) {
        let previous = self.last.replace(snapshot.clone());
        let state_changed = previous.as_ref().is_none_or(|p| p.state != snapshot.state || p.mode != snapshot.mode);

        if state_changed {
            self.end_meter_line();
            println!("● {} [{} mode]", state_label(snapshot.state), snapshot.mode);
            if let Some(error) = snapshot.error {
                println!("  {}", error);
            }
        }

        if snapshot.state == ConnectionState::Connected {
            print!(
                "\r  mic {} spk {}",
                level_bar(snapshot.input_volume, BAR_WIDTH),
                level_bar(snapshot.output_volume, BAR_WIDTH)
            );
            let _ = std::io::stdout().flush();
            self.meter_line = true;
        }
    }

    fn end_meter_line(&mut self) {
        if self.meter_line {
            println!();
            self.meter_line = false;
        }
    }
}

fn state_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Disconnected => "Desconectado",
        ConnectionState::Connecting => "Conectando...",
        ConnectionState::Connected => "Ao vivo",
        ConnectionState::Error => "Erro",
    }
}
