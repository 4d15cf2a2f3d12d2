//! # docbase CLI
//!
//! Command-line interface over the docbase engine. All commands accept a
//! `--root` flag pointing at the instance data root (default `./data`).
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docbase init` | Create the data root and a default `config.json` |
//! | `docbase kb create <name>` | Create a knowledge base |
//! | `docbase kb list` | List knowledge bases |
//! | `docbase kb rename <id> <name>` | Rename a knowledge base |
//! | `docbase kb delete <id>` | Delete a knowledge base and its servers |
//! | `docbase kb stats <id>` | Show file/chunk statistics |
//! | `docbase upload <kb> <path>` | Ingest a file |
//! | `docbase docs <kb>` | List documents |
//! | `docbase search <kb> "<query>"` | Query a knowledge base |
//! | `docbase reindex <kb>` | Rebuild indices with the current config |
//! | `docbase server …` | Manage tool servers |
//!
//! The hidden `toolserve` subcommand is the tool-server child entry
//! point; the supervisor invokes it, not users.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use docbase::config;
use docbase::engine::Engine;
use docbase::models::ServerUpdate;
use docbase::supervisor::CreateServer;
use docbase::toolserver;

#[derive(Parser)]
#[command(
    name = "docbase",
    about = "Self-hosted knowledge bases with hybrid retrieval and per-KB tool servers",
    version
)]
struct Cli {
    /// Instance data root.
    #[arg(long, global = true, default_value = "./data")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the data root (directories and default config.json).
    Init,

    /// Manage knowledge bases.
    Kb {
        #[command(subcommand)]
        action: KbAction,
    },

    /// Ingest a file into a knowledge base.
    Upload {
        /// Knowledge base id.
        kb: String,
        /// File to ingest.
        path: PathBuf,
    },

    /// List documents in a knowledge base.
    Docs {
        kb: String,
    },

    /// Delete a document.
    DeleteDoc {
        kb: String,
        doc: String,
    },

    /// Re-extract, re-chunk, and re-embed a document from its blob.
    Reprocess {
        kb: String,
        doc: String,
    },

    /// Query a knowledge base.
    Search {
        kb: String,
        query: String,
        /// Maximum number of results.
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Rank passages similar to an existing document.
    Similar {
        kb: String,
        doc: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Rebuild a knowledge base's indices with its current config.
    Reindex {
        kb: String,
    },

    /// Manage tool servers.
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },

    /// Tool-server child entry point (spawned by the supervisor).
    #[command(hide = true)]
    Toolserve {
        #[arg(long)]
        server_id: String,
    },
}

#[derive(Subcommand)]
enum KbAction {
    /// Create a knowledge base with default configuration.
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// List all knowledge bases.
    List,
    /// Rename a knowledge base (id stays stable).
    Rename {
        id: String,
        name: String,
    },
    /// Delete a knowledge base, its documents, and its tool servers.
    Delete {
        id: String,
    },
    /// Show statistics for a knowledge base.
    Stats {
        id: String,
    },
    /// Show the knowledge base configuration as JSON.
    Config {
        id: String,
    },
}

#[derive(Subcommand)]
enum ServerAction {
    /// List tool servers and their status.
    List,
    /// Create a tool server over one or more knowledge bases.
    Create {
        name: String,
        /// Knowledge base id (repeatable).
        #[arg(long = "kb", required = true)]
        kb_ids: Vec<String>,
        #[arg(long, default_value = "")]
        instructions: String,
        /// Preferred port within the configured range.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Start a tool server and wait for it to become healthy.
    Start {
        id: String,
    },
    /// Stop a tool server (graceful, then kill).
    Stop {
        id: String,
    },
    /// Delete a tool server record.
    Delete {
        id: String,
    },
    /// Update a tool server's instructions.
    SetInstructions {
        id: String,
        instructions: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("docbase=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Init => {
            config::init_root(&cli.root)?;
            println!("Initialized data root at {}", cli.root.display());
            return Ok(());
        }
        Commands::Toolserve { server_id } => {
            return toolserver::run_toolserver(&cli.root, server_id).await;
        }
        _ => {}
    }

    let engine = Engine::open(&cli.root).await?;

    match cli.command {
        Commands::Init | Commands::Toolserve { .. } => unreachable!(),

        Commands::Kb { action } => match action {
            KbAction::Create { name, description } => {
                let kb = engine.create_kb(&name, description.as_deref()).await?;
                println!("{}  {}", kb.id, kb.name);
            }
            KbAction::List => {
                for kb in engine.list_kbs().await? {
                    println!(
                        "{}  {}  gen={}  {}",
                        kb.id,
                        kb.name,
                        kb.generation,
                        kb.description.unwrap_or_default()
                    );
                }
            }
            KbAction::Rename { id, name } => {
                let kb = engine.rename_kb(&id, &name).await?;
                println!("{}  {}", kb.id, kb.name);
            }
            KbAction::Delete { id } => {
                engine.delete_kb(&id).await?;
                println!("deleted {}", id);
            }
            KbAction::Stats { id } => {
                let stats = engine.stats(&id).await?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
            KbAction::Config { id } => {
                let cfg = engine.get_config(&id).await?;
                println!("{}", serde_json::to_string_pretty(&cfg)?);
            }
        },

        Commands::Upload { kb, path } => {
            let bytes = tokio::fs::read(&path).await?;
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "upload.bin".to_string());
            let doc = engine.upload_document(&kb, &filename, &bytes).await?;
            println!(
                "{}  {}  {}  chunks={}{}",
                doc.id,
                doc.filename,
                doc.status.as_str(),
                doc.chunk_count,
                doc.error.map(|e| format!("  error: {}", e)).unwrap_or_default()
            );
        }

        Commands::Docs { kb } => {
            for doc in engine.list_documents(&kb).await? {
                println!(
                    "{}  {}  {}  {}  {} bytes  chunks={}",
                    doc.id,
                    doc.filename,
                    doc.format.as_str(),
                    doc.status.as_str(),
                    doc.size_bytes,
                    doc.chunk_count
                );
            }
        }

        Commands::DeleteDoc { kb, doc } => {
            engine.delete_document(&kb, &doc).await?;
            println!("deleted {}", doc);
        }

        Commands::Reprocess { kb, doc } => {
            let doc = engine.reprocess_document(&kb, &doc).await?;
            println!("{}  {}  chunks={}", doc.id, doc.status.as_str(), doc.chunk_count);
        }

        Commands::Search { kb, query, limit } => {
            let response = engine.query(&kb, &query, limit).await?;
            if response.results.is_empty() {
                println!("No results.");
            }
            for (i, r) in response.results.iter().enumerate() {
                println!("{}. [{:.2}] {} (chunk {})", i + 1, r.score, r.filename, r.seq);
                println!("   {}", snippet(&r.content));
            }
            println!(
                "{} results in {:.3}s",
                response.total, response.elapsed_seconds
            );
        }

        Commands::Similar { kb, doc, limit } => {
            for (i, r) in engine.find_similar(&kb, &doc, limit).await?.iter().enumerate() {
                println!("{}. [{:.2}] {} (chunk {})", i + 1, r.score, r.filename, r.seq);
                println!("   {}", snippet(&r.content));
            }
        }

        Commands::Reindex { kb } => {
            engine.reindex(&kb).await?;
            let kb_row = engine.get_kb(&kb).await?;
            println!("reindexed {}  generation={}", kb, kb_row.generation);
        }

        Commands::Server { action } => match action {
            ServerAction::List => {
                for s in engine.supervisor.list().await {
                    println!(
                        "{}  {}  port={}  {}  kbs={}{}",
                        s.id,
                        s.name,
                        s.port,
                        s.status.as_str(),
                        s.kb_ids.join(","),
                        s.last_error.map(|e| format!("  error: {}", e)).unwrap_or_default()
                    );
                }
            }
            ServerAction::Create {
                name,
                kb_ids,
                instructions,
                port,
            } => {
                let record = engine
                    .create_tool_server(CreateServer {
                        name,
                        instructions,
                        kb_ids,
                        tool_descriptions: Default::default(),
                        tool_param_descriptions: Default::default(),
                        requested_port: port,
                    })
                    .await?;
                println!("{}  {}  port={}", record.id, record.name, record.port);
            }
            ServerAction::Start { id } => {
                let record = engine.supervisor.start(&id).await?;
                println!("{}  {}  port={}", record.id, record.status.as_str(), record.port);
            }
            ServerAction::Stop { id } => {
                let record = engine.supervisor.stop(&id).await?;
                println!("{}  {}", record.id, record.status.as_str());
            }
            ServerAction::Delete { id } => {
                engine.supervisor.delete(&id).await?;
                println!("deleted {}", id);
            }
            ServerAction::SetInstructions { id, instructions } => {
                let record = engine
                    .update_tool_server(
                        &id,
                        ServerUpdate {
                            instructions: Some(instructions),
                            ..Default::default()
                        },
                    )
                    .await?;
                println!("{}  updated", record.id);
            }
        },
    }

    Ok(())
}

fn snippet(text: &str) -> String {
    let flat = text.replace('\n', " ");
    let mut out: String = flat.chars().take(160).collect();
    if flat.chars().count() > 160 {
        out.push('…');
    }
    out
}
