use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::{load_settings, ClientSettings},
    grouping::group_messages,
    Connectivity, HttpRemoteApi, MessageSender, QueryCache, QueryClient,
};
use serde_json::json;
use shared::{domain::ConversationId, protocol::ChatMessage};
use storage::{DraftStore, FailedOperationQueue, KeyValueStore, SqliteStore};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(about = "Inspect and maintain the portal client's local state")]
struct Cli {
    /// Overrides the configured storage path.
    #[arg(long)]
    storage_path: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(subcommand)]
    Drafts(DraftsCommand),
    #[command(subcommand)]
    Failed(FailedCommand),
    /// Prints grouping annotations for a JSON array of messages.
    Group {
        messages: PathBuf,
        #[arg(long)]
        threshold_ms: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum DraftsCommand {
    Show { conversation_id: i64 },
    Clear { conversation_id: i64 },
}

#[derive(Subcommand, Debug)]
enum FailedCommand {
    List {
        #[arg(long)]
        conversation: Option<i64>,
    },
    Drop {
        id: Uuid,
    },
    /// Re-sends a queued message to the configured server.
    Retry {
        id: Uuid,
        #[arg(long)]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let mut settings = load_settings();
    if let Some(path) = cli.storage_path {
        settings.storage_path = path;
    }

    match cli.command {
        Command::Drafts(command) => run_drafts(&settings, command),
        Command::Failed(command) => run_failed(&settings, command).await,
        Command::Group {
            messages,
            threshold_ms,
        } => {
            let threshold = threshold_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| settings.group_threshold());
            run_group(&messages, threshold)
        }
    }
}

fn open_store(settings: &ClientSettings) -> Result<Arc<dyn KeyValueStore>> {
    let store = SqliteStore::open(&settings.storage_path).with_context(|| {
        format!("failed to open storage at {}", settings.storage_path.display())
    })?;
    Ok(Arc::new(store))
}

fn run_drafts(settings: &ClientSettings, command: DraftsCommand) -> Result<()> {
    let drafts = DraftStore::new(open_store(settings)?);
    match command {
        DraftsCommand::Show { conversation_id } => {
            match drafts.get(ConversationId(conversation_id)) {
                Some(draft) => println!("{}", serde_json::to_string_pretty(&draft)?),
                None => println!("no draft for conversation {conversation_id}"),
            }
        }
        DraftsCommand::Clear { conversation_id } => {
            drafts.delete(ConversationId(conversation_id));
            info!(conversation_id, "cli: draft cleared");
        }
    }
    Ok(())
}

async fn run_failed(settings: &ClientSettings, command: FailedCommand) -> Result<()> {
    let store = open_store(settings)?;
    let failed = FailedOperationQueue::new(Arc::clone(&store));
    match command {
        FailedCommand::List { conversation } => {
            for entry in failed.get_all(conversation.map(ConversationId)) {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        FailedCommand::Drop { id } => {
            if !failed.remove(id) {
                bail!("no failed operation with id {id}");
            }
            info!(%id, "cli: failed operation dropped");
        }
        FailedCommand::Retry { id, token } => {
            let mut remote = HttpRemoteApi::new(&settings.server_url, Connectivity::new())?;
            if let Some(token) = token {
                remote = remote.with_bearer_token(token);
            }
            let client = QueryClient::new(Arc::new(QueryCache::new()), Arc::new(remote));
            let sender = MessageSender::new(
                client,
                failed,
                DraftStore::new(store),
                settings.request_timeout(),
            );
            let message = sender.retry_failed(id).await?;
            println!("{}", serde_json::to_string(&message)?);
        }
    }
    Ok(())
}

fn run_group(path: &Path, threshold: Duration) -> Result<()> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let messages: Vec<ChatMessage> =
        serde_json::from_str(&raw).context("expected a JSON array of messages")?;
    for (message, annotation) in messages.iter().zip(group_messages(&messages, threshold)) {
        println!(
            "{}",
            json!({
                "message_id": message.message_id,
                "sender_id": message.sender_id,
                "is_first_in_group": annotation.is_first_in_group,
                "is_middle_in_group": annotation.is_middle_in_group,
                "is_last_in_group": annotation.is_last_in_group,
            })
        );
    }
    Ok(())
}
