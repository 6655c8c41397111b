//! Streamsync - Headless Chat Client
//!
//! Connects the engine to a chat server, turns stdin lines into user
//! messages and logs every event the engine emits.
//!
//! # Usage
//!
//! ```bash
//! # Defaults (ws://127.0.0.1:8000/ws, in-memory conversation store)
//! streamsync
//!
//! # Custom server and REST backend
//! streamsync --url wss://chat.example.com/ws --api-url https://chat.example.com/api
//!
//! # Verbose logging
//! RUST_LOG=streamsync_core=debug streamsync
//! ```
//!
//! # Commands
//!
//! | Input | Effect |
//! |-------|--------|
//! | any text | send as a user message to the active conversation |
//! | `/new` | start a conversation |
//! | `/title <text>` | rename the active conversation |
//! | `/delete` | delete the active conversation |
//! | `/list` | log every conversation |
//! | `/quit` | disconnect and exit |

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use streamsync_core::{
    default_config_path, load_config_from_path, ConfigOverrides, ConversationBackend,
    ConversationId, Engine, EngineConfig, EngineEvent, HttpConversationBackend, InMemoryBackend,
    WsConnector,
};

/// Streamsync - headless client for a streaming chat server
#[derive(Parser, Debug)]
#[command(name = "streamsync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Websocket endpoint
    #[arg(short = 'u', long, value_name = "URL")]
    url: Option<String>,

    /// REST base URL of the conversation backend (in-memory if unset)
    #[arg(short = 'a', long, value_name = "URL")]
    api_url: Option<String>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "STREAMSYNC_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Tokens per batch
    #[arg(short = 'b', long)]
    batch_size: Option<usize>,

    /// Deliver every token on its own
    #[arg(long)]
    no_batching: bool,

    /// Disable keep-alive frames
    #[arg(long)]
    no_heartbeat: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "STREAMSYNC_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(url) = &self.url {
            overrides = overrides.with_url(url.clone());
        }
        if let Some(api_url) = &self.api_url {
            overrides = overrides.with_api_base_url(api_url.clone());
        }
        if let Some(size) = self.batch_size {
            overrides = overrides.with_batch_size(size);
        }
        if self.no_batching {
            overrides = overrides.with_batching_enabled(false);
        }
        if self.no_heartbeat {
            overrides = overrides.with_heartbeat_enabled(false);
        }
        overrides
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("streamsync={level},streamsync_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// One parsed stdin line
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Say(String),
    New,
    Title(String),
    Delete,
    List,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let command = match line.split_once(' ') {
            Some(("/title", title)) => Self::Title(title.trim().to_string()),
            _ => match line {
                "/new" => Self::New,
                "/delete" => Self::Delete,
                "/list" => Self::List,
                "/quit" | "/exit" => Self::Quit,
                _ => Self::Say(line.to_string()),
            },
        };
        Some(command)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config =
        load_config_from_path(config_path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(version = env!("CARGO_PKG_VERSION"), "Streamsync starting");
    info!(url = %config.connection.url, source = %config.source(), "Configuration loaded");

    match config.reconciler.api_base_url.clone() {
        Some(base_url) => {
            let backend = HttpConversationBackend::new(
                base_url,
                config.reconciler.api_token.clone(),
                config.reconciler.request_timeout(),
            )
            .context("Failed to build HTTP client")?;
            run(backend, config).await
        }
        None => {
            info!("No API URL configured, keeping conversations in memory");
            run(InMemoryBackend::new(), config).await
        }
    }
}

async fn run<B: ConversationBackend>(backend: B, config: EngineConfig) -> Result<()> {
    let (mut engine, mut events) = Engine::new(WsConnector, backend, config);
    engine.connect().await.context("Failed to connect")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            input = engine.next_input() => match input {
                Some(input) => engine.dispatch(input).await,
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let Some(command) = Command::parse(&line) else { continue };
                    if command == Command::Quit {
                        break;
                    }
                    handle_command(&mut engine, command).await;
                }
                Ok(None) => {
                    info!("stdin closed, still listening");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
        log_events(&mut events);
    }

    engine.disconnect().await;
    log_events(&mut events);
    info!("Streamsync stopped");
    Ok(())
}

async fn handle_command<B: ConversationBackend>(
    engine: &mut Engine<WsConnector, B>,
    command: Command,
) {
    match command {
        Command::Say(text) => {
            let conversation = match engine.active_conversation().cloned() {
                Some(id) => id,
                None => engine.create_conversation(),
            };
            if let Err(e) = engine.send_user_message(&conversation, text).await {
                error!(conversation_id = %conversation, error = %e, "Message not sent");
            }
        }
        Command::New => {
            let id = engine.create_conversation();
            info!(conversation_id = %id, "Conversation started");
        }
        Command::Title(title) => match engine.active_conversation().cloned() {
            Some(id) => {
                if let Err(e) = engine.update_title(&id, &title).await {
                    error!(conversation_id = %id, error = %e, "Rename failed");
                }
            }
            None => warn!("No active conversation"),
        },
        Command::Delete => match engine.active_conversation().cloned() {
            Some(id) => {
                engine.delete_conversation(&id).await;
            }
            None => warn!("No active conversation"),
        },
        Command::List => {
            let active: Option<ConversationId> = engine.active_conversation().cloned();
            for conversation in engine.conversations() {
                info!(
                    conversation_id = %conversation.id,
                    title = %conversation.title,
                    messages = conversation.messages.len(),
                    confirmed = conversation.is_backend_confirmed,
                    active = active.as_ref() == Some(&conversation.id),
                    "Conversation"
                );
            }
        }
        Command::Quit => {}
    }
}

fn log_events(events: &mut mpsc::UnboundedReceiver<EngineEvent>) {
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::StreamChunkAppended {
                conversation_id,
                session_id,
                text,
                token_count,
                ..
            } => info!(
                conversation_id = %conversation_id,
                session_id = %session_id,
                tokens = token_count,
                text = %text,
                "Chunk"
            ),
            EngineEvent::StreamCompleted {
                conversation_id,
                session_id,
                metrics,
            } => info!(
                conversation_id = %conversation_id,
                session_id = %session_id,
                tokens = metrics.token_count,
                duration_secs = metrics.duration_seconds,
                "Stream completed"
            ),
            EngineEvent::StreamFailed {
                session_id, error, ..
            } => error!(session_id = %session_id, error = %error, "Stream failed"),
            EngineEvent::ConnectionLost { error } => {
                error!(error = %error, "Connection lost, restart to reconnect");
            }
            other => info!(event = ?other, "Engine event"),
        }
    }
}
