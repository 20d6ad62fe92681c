//! # Bouncer - AI-challenge gatekeeper for Telegram groups
//!
//! Join requests to allow-listed groups are held until the requester
//! answers a question generated from the group's topic.
//!
//! ## Architecture
//! ```text
//! Telegram ─getUpdates→ Poller → Controller → ChallengeGenerator → LLM
//!                                    │  ↑
//!                                    ↓  └── TimeoutScheduler
//!                                  Store (SQLite | Redis | memory)
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use bouncer_common::constants::DEFAULT_CONFIG_PATH;
use bouncer_common::{AllowedGroup, ChatId};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod ai;
mod challenge;
mod config;
mod lifecycle;
mod notify;
mod routes;
mod state;
mod storage;
mod telegram;

use crate::challenge::ChallengeGenerator;
use crate::config::AppConfig;
use crate::lifecycle::{Controller, LifecycleSettings, TokioScheduler};
use crate::state::AppState;
use crate::telegram::{Poller, TelegramClient};

/// Bouncer - gates group join requests behind AI-generated challenges
#[derive(Parser, Debug)]
#[command(name = "bouncer")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "BOUNCER_CONFIG")]
    config: String,

    /// Telegram bot token (overrides config)
    #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

/// Group provisioning; without a subcommand the bot runs
#[derive(Subcommand, Debug)]
enum Command {
    /// Allow the bot to moderate a group
    AllowGroup {
        #[arg(long, allow_negative_numbers = true)]
        chat_id: i64,

        /// Display name stored with the group
        #[arg(long)]
        title: String,
    },

    /// Stop moderating a group
    RevokeGroup {
        #[arg(long, allow_negative_numbers = true)]
        chat_id: i64,
    },

    /// Print allowed groups
    ListGroups,
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env first so clap sees TELEGRAM_BOT_TOKEN and friends
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs)?;

    match args.command {
        Some(command) => run_command(command, &args.config).await,
        None => run_bot(&args.config, args.token).await,
    }
}

async fn run_command(command: Command, config_path: &str) -> Result<()> {
    let storage_config = crate::config::load_storage(config_path)?;
    let store = storage::open(&storage_config).await?;

    match command {
        Command::AllowGroup { chat_id, title } => {
            store
                .allow_group(&AllowedGroup {
                    chat_id: ChatId(chat_id),
                    display_name: title.clone(),
                })
                .await
                .context("Failed to allow group")?;
            info!(chat_id, title = %title, "Group allowed");
        }
        Command::RevokeGroup { chat_id } => {
            let removed = store
                .revoke_group(ChatId(chat_id))
                .await
                .context("Failed to revoke group")?;
            if removed {
                info!(chat_id, "Group revoked");
            } else {
                tracing::warn!(chat_id, "Group was not allowed");
            }
        }
        Command::ListGroups => {
            let groups = store
                .list_allowed_groups()
                .await
                .context("Failed to list groups")?;
            for group in groups {
                println!("{}\t{}", group.chat_id, group.display_name);
            }
        }
    }

    Ok(())
}

async fn run_bot(config_path: &str, token: Option<String>) -> Result<()> {
    info!("🚪 Starting Bouncer v{}", env!("CARGO_PKG_VERSION"));

    // Validate everything before touching the network
    let config = AppConfig::load(config_path, token)?;
    info!("📋 Configuration loaded from {}", config_path);

    let store = storage::open(&config.storage).await?;
    let ai = ai::build(&config.backend).context("Failed to set up generative AI backend")?;

    let client = Arc::new(TelegramClient::new(&config.telegram_bot_token)?);
    let me = client
        .get_me()
        .await
        .context("Telegram rejected the bot token")?;
    info!(bot_id = me.id, username = ?me.username, "✅ Authenticated with Telegram");

    // Create shutdown broadcast channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let (scheduler, fired) = TokioScheduler::new();
    let controller = Arc::new(Controller::new(
        store.clone(),
        ChallengeGenerator::new(ai.clone(), config.prompts.clone()),
        client.clone(),
        Arc::new(scheduler),
        LifecycleSettings {
            messages: config.messages.clone(),
            answer_timeout: config.answer_timeout,
            retry_timeout: config.retry_timeout,
        },
    ));

    tokio::spawn(lifecycle::run_timeouts(
        controller.clone(),
        fired,
        shutdown_tx.subscribe(),
    ));

    controller
        .recover_pending(Utc::now())
        .await
        .context("Failed to recover pending challenges")?;

    if let Some(addr) = config.status.listen_addr.as_deref() {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind status server on {}", addr))?;
        info!("🚀 Status server listening on {}", addr);

        let app = routes::create_router(AppState::new(store.clone(), ai.name()));
        let mut status_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = status_shutdown.recv().await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "Status server error");
            }
        });
    }

    let poller = Poller::new(client, controller, me.username);
    let poller_task = tokio::spawn(poller.run(shutdown_tx.subscribe()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;
    info!("🛑 Shutdown signal received");
    let _ = shutdown_tx.send(());

    poller_task.await.context("Poller task failed")?;

    info!("👋 Bouncer shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let args = Args::try_parse_from([
            "bouncer",
            "--config",
            "custom.yaml",
            "allow-group",
            "--chat-id",
            "-1001234",
            "--title",
            "Rustaceans",
        ])
        .unwrap();

        assert_eq!(args.config, "custom.yaml");
        match args.command {
            Some(Command::AllowGroup { chat_id, title }) => {
                assert_eq!(chat_id, -1001234);
                assert_eq!(title, "Rustaceans");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_defaults_to_bot() {
        let args = Args::try_parse_from(["bouncer", "--json-logs"]).unwrap();
        assert!(args.command.is_none());
        assert!(args.json_logs);
    }
}
