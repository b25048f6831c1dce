//! hybrid-rag: question answering over an OData service and embedded documents.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hybrid_rag::commands::{chat, knowledge};
use hybrid_rag::config::load_config;
use hybrid_rag::db::models::FileFilter;
use hybrid_rag::{init_tracing, AppState};

#[derive(Parser, Debug)]
#[command(name = "hybrid-rag", version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./hybrid-rag.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store a document, optionally embedding it right away.
    Upload {
        path: PathBuf,
        #[arg(long)]
        ingest: bool,
    },
    /// Chunk and embed a stored document.
    Ingest { id: String },
    /// Ask a question within a conversation.
    Ask {
        #[arg(long, default_value = "default")]
        conversation: String,
        #[arg(long)]
        user: Option<String>,
        query: Vec<String>,
    },
    /// List stored documents.
    Documents,
    /// Delete one document, or all documents with the given name.
    DeleteDocument {
        id: Option<String>,
        #[arg(long, conflicts_with = "id")]
        name: Option<String>,
    },
    /// Remove every embedded chunk.
    DeleteEmbeddings,
    /// List conversations.
    Conversations,
    /// Remove all conversations and messages.
    DeleteChat,
    /// Delete chunks whose document no longer exists.
    Sweep {
        /// Keep running, sweeping every `maintenance.sweep_interval_secs`
        /// until interrupted.
        #[arg(long)]
        watch: bool,
        /// Sweep interval in seconds for `--watch`; implies `--watch`.
        #[arg(long)]
        every: Option<u64>,
    },
    /// Show the entity sets of the configured OData service.
    Schema {
        /// Drop the cached copy and fetch `$metadata` again.
        #[arg(long)]
        refresh: bool,
    },
    /// Reattach chunks with a missing document reference.
    Repair,
}

fn print_json<T: Serialize>(value: &T) -> hybrid_rag::Result<()> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| hybrid_rag::Error::InvalidInput(e.to_string()))?;
    println!("{rendered}");
    Ok(())
}

async fn run(cli: Cli, state: AppState) -> hybrid_rag::Result<()> {
    match cli.command {
        Commands::Upload { path, ingest } => {
            let file = knowledge::upload_document_from_path(&state, &path)?;
            if ingest {
                println!("{}", knowledge::store_embeddings(&state, &file.id).await?);
            }
            print_json(&file)?;
        }
        Commands::Ingest { id } => {
            println!("{}", knowledge::store_embeddings(&state, &id).await?);
        }
        Commands::Ask {
            conversation,
            user,
            query,
        } => {
            let reply = chat::get_chat_rag_response(
                &state,
                chat::ChatQuery {
                    conversation_id: conversation,
                    message_id: None,
                    message_time: None,
                    user_id: user,
                    user_query: query.join(" "),
                },
            )
            .await?;
            print_json(&reply)?;
        }
        Commands::Documents => print_json(&knowledge::list_documents(&state)?)?,
        Commands::DeleteDocument { id, name } => match (id, name) {
            (Some(id), _) => knowledge::delete_document(&state, &id)?,
            (None, Some(name)) => {
                let deleted = knowledge::delete_documents(&state, &FileFilter::Name(name))?;
                println!("{deleted} document(s) deleted");
            }
            (None, None) => {
                return Err(hybrid_rag::Error::InvalidInput(
                    "pass a document id or --name".into(),
                ))
            }
        },
        Commands::DeleteEmbeddings => println!("{}", knowledge::delete_embeddings(&state)?),
        Commands::Conversations => print_json(&chat::list_conversations(&state)?)?,
        Commands::DeleteChat => println!("{}", chat::delete_chat_data(&state)?),
        Commands::Sweep { watch, every } => {
            print_json(&knowledge::sweep_orphans(&state)?)?;
            if watch || every.is_some() {
                let cancel = CancellationToken::new();
                let sweeper = knowledge::start_orphan_sweeper(
                    &state,
                    every.map(Duration::from_secs),
                    cancel.clone(),
                );
                info!("orphan sweeper running, press Ctrl+C to stop");
                tokio::signal::ctrl_c().await?;
                cancel.cancel();
                if let Err(e) = sweeper.await {
                    warn!(error = %e, "orphan sweeper task failed");
                }
            }
        }
        Commands::Schema { refresh } => {
            print_json(&chat::describe_schema(&state, refresh).await?)?;
        }
        Commands::Repair => print_json(&knowledge::repair_chunk_references(&state)?)?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("hybrid-rag: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.logging.level);

    let state = match AppState::from_config(config) {
        Ok(state) => state,
        Err(e) => {
            eprintln!("hybrid-rag: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli, state).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("hybrid-rag: {e}");
            ExitCode::FAILURE
        }
    }
}
