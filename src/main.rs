//! Live Voice Assistant - real-time spoken conversation with a live audio model.
//!
//! Microphone audio is streamed to the live service over a WebSocket while its
//! spoken replies are scheduled for gapless playback. A text chat mode talks to
//! the same service family through RIG.

mod audio;
mod config;
mod error;
mod live;
mod llm;
mod session;
mod ui;

use std::io::BufRead;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::LocalTime;

use audio::CpalBackend;
use config::AppConfig;
use live::{GeminiConnector, Setup};
use llm::ChatClient;
use session::{AppMode, Command, SessionController, SessionOptions, UiSnapshot};
use ui::{StatusRenderer, UserInput};

/// Requests handled by the chat task.
enum ChatRequest {
    Open,
    Message(String),
}

/// Read stdin on a plain thread so a pending read never holds up shutdown.
fn spawn_stdin_reader() -> Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel::<String>(16);
    std::thread::Builder::new().name("stdin-reader".into()).spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read input: {}", e);
                    break;
                }
            }
        }
        debug!("Standard input closed");
    })?;
    Ok(rx)
}

/// Spawn the task that turns typed lines into controller commands and chat messages.
///
/// Ends on `/quit` or end of input, dropping its command sender.
fn spawn_input_task(
    mut lines: mpsc::Receiver<String>,
    commands: mpsc::Sender<Command>,
    chat: mpsc::Sender<ChatRequest>,
    mut mode: AppMode,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if mode == AppMode::Chat {
            let _ = chat.send(ChatRequest::Open).await;
        }

        while let Some(line) = lines.recv().await {
            match ui::parse_line(&line) {
                UserInput::Command(command) => {
                    if let Command::SwitchMode(next) = command {
                        if next == AppMode::Chat && mode != AppMode::Chat {
                            let _ = chat.send(ChatRequest::Open).await;
                        }
                        mode = next;
                    }
                    if commands.send(command).await.is_err() {
                        break;
                    }
                }
                UserInput::Text(text) if mode == AppMode::Chat => {
                    if chat.send(ChatRequest::Message(text)).await.is_err() {
                        warn!("Chat is unavailable");
                    }
                }
                UserInput::Text(_) => println!("Voice mode: use /connect to talk, or /chat to type."),
                UserInput::Help => ui::print_help(),
                UserInput::Quit => break,
                UserInput::Unknown(command) => println!("Unknown command {}. Type /help.", command),
                UserInput::Empty => {}
            }
        }
    })
}

/// Spawn the chat task. Requests are answered one at a time, in order.
fn spawn_chat_task(mut client: Option<ChatClient>, mut requests: mpsc::Receiver<ChatRequest>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut greeted = false;
        while let Some(request) = requests.recv().await {
            let Some(client) = client.as_mut() else {
                println!("Chat indisponível: configure a variável API_KEY.");
                continue;
            };

            match request {
                ChatRequest::Open => {
                    if !greeted {
                        println!("🤖 {}", client.greeting());
                        greeted = true;
                    }
                }
                ChatRequest::Message(text) => match client.chat(&text).await {
                    Ok(response) => println!("🤖 {}", response),
                    Err(e) => {
                        error!("❌ Chat error: {:#}", e);
                        println!("Desculpe, ocorreu um erro ao processar sua mensagem.");
                    }
                },
            }
        }
    })
}

/// Spawn the status printer that follows the controller's UI snapshots.
fn spawn_status_task(mut snapshots: watch::Receiver<UiSnapshot>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut renderer = StatusRenderer::default();
        renderer.render(&snapshots.borrow_and_update());
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            renderer.render(&snapshot);
        }
    })
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn wait_for_shutdown() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("🛑 Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        warn!("Failed to register SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("🛑 Received SIGTERM, shutting down...");
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = AppConfig::from_args();

    // Respect RUST_LOG env var, fallback to verbose flag, default to info
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if config.verbose { "debug" } else { "info" }));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(LocalTime::new(time::macros::format_description!("[hour]:[minute]:[second]")))
        .init();

    info!("🎙️ Live Voice Assistant v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("❌ Configuration error: {}", e);
        std::process::exit(1);
    }
    config.log_config();

    let persona = config.persona()?;
    let setup = Setup::audio(&config.voice_model, &persona, config.voice_name());
    let connector = GeminiConnector::new(&config.endpoint, config.api_key().map(str::to_string), config.outbound_queue);
    let options = SessionOptions {
        sample_rate: config.sample_rate,
        window: config.window,
        playback_rate: config.playback_rate,
        meter_interval: config.meter_interval(),
    };

    let mut controller = SessionController::new(CpalBackend, connector, setup, options, config.mode);

    let chat_client = match ChatClient::new(&config, &persona) {
        Ok(client) => Some(client),
        Err(e) => {
            warn!("Chat disabled: {:#}", e);
            None
        }
    };

    let (command_tx, command_rx) = mpsc::channel::<Command>(16);
    let (chat_tx, chat_rx) = mpsc::channel::<ChatRequest>(8);

    let status_handle = spawn_status_task(controller.subscribe());
    let chat_handle = spawn_chat_task(chat_client, chat_rx);

    if config.auto_connect {
        let _ = command_tx.send(Command::Connect).await;
    }
    let input_handle = spawn_input_task(spawn_stdin_reader()?, command_tx, chat_tx, config.mode);

    println!("Type /help for commands.");

    tokio::select! {
        _ = controller.run(command_rx) => {
            info!("Input closed, shutting down...");
        }
        _ = wait_for_shutdown() => {}
    }

    controller.teardown();

    input_handle.abort();
    chat_handle.abort();

    // Let the status printer flush the final state
    drop(controller);
    if tokio::time::timeout(Duration::from_millis(200), status_handle).await.is_err() {
        debug!("Status task didn't finish in time");
    }

    info!("✅ Live voice assistant stopped");
    Ok(())
}
