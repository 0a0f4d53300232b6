//! `threadkeep` command-line interface: interactive chat and session administration.

mod chat;
mod config;

use clap::{Parser, Subcommand};
use config::ThreadkeepConfig;
use std::path::PathBuf;
use std::sync::Arc;
use threadkeep_core::{SessionKey, SessionState};
use threadkeep_session::{CheckpointManager, Conversation, EchoProcessor};
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "threadkeep", about = "threadkeep: durable chatbot sessions")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "threadkeep.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the echo bot on stdin/stdout
    Chat {
        /// Resume an existing session
        #[arg(long, conflicts_with = "user")]
        session: Option<String>,
        /// Start a new session scoped to this user
        #[arg(long)]
        user: Option<String>,
    },
    /// Inspect and manage stored sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Print the effective state of a session
    Show { key: String },
    /// Delete every record of a session
    Delete { key: String },
    /// Generate a fresh session key
    New {
        /// Scope the key to this user
        #[arg(long)]
        user: Option<String>,
    },
}

fn new_key(user: Option<&str>) -> anyhow::Result<SessionKey> {
    Ok(match user {
        Some(user) => SessionKey::for_principal(user)?,
        None => SessionKey::generate(),
    })
}

fn render_state(state: &SessionState) -> anyhow::Result<String> {
    let key = &state.session_key;
    if state.is_empty() {
        return Ok(format!("Session '{key}' has no records"));
    }
    let sequence = state.sequence_no;
    let metadata = serde_json::to_string(&state.metadata)?;
    let messages = serde_json::to_string_pretty(&state.messages)?;
    Ok(format!(
        "session:  {key}\nsequence: {sequence}\nmetadata: {metadata}\n{messages}"
    ))
}

fn render_deleted(key: &SessionKey) -> String {
    format!("Session '{key}' deleted")
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("THREADKEEP_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    if let Commands::Session {
        action: SessionAction::New { user },
    } = &cli.command
    {
        println!("{}", new_key(user.as_deref())?);
        return Ok(());
    }

    let config = ThreadkeepConfig::load(&cli.config).await?;
    let store = config.store.connect().await?;
    let manager = Arc::new(CheckpointManager::new(store));

    match cli.command {
        Commands::Chat { session, user } => {
            let key = match session {
                Some(key) => SessionKey::new(key)?,
                None => new_key(user.as_deref())?,
            };
            info!(session_key = %key, backend = config.store.backend_name(), "Starting chat");
            let conversation = Conversation::new(manager, Arc::new(EchoProcessor));
            let stdin = BufReader::new(tokio::io::stdin());
            let mut stdout = std::io::stdout();
            chat::run(&conversation, &key, stdin, &mut stdout).await?;
        }
        Commands::Session { action } => match action {
            SessionAction::Show { key } => {
                let key = SessionKey::new(key)?;
                let state = manager.load(&key).await?;
                println!("{}", render_state(&state)?);
            }
            SessionAction::Delete { key } => {
                let key = SessionKey::new(key)?;
                manager.delete(&key).await?;
                println!("{}", render_deleted(&key));
            }
            SessionAction::New { .. } => {}
        },
    }

    Ok(())
}
