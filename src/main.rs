//! # Lires CLI (`lires`)
//!
//! Command-line client for a Lires reference server. It loads the document
//! library into memory, browses tags, runs searches, reads and edits notes
//! and abstracts, administers tags, and follows live server events.
//!
//! ## Usage
//!
//! ```bash
//! lires --config ./config/lires.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lires load` | Stream the library and print a summary |
//! | `lires tags` | Print the tag hierarchy |
//! | `lires search "<pattern>"` | Filter documents by a field selector |
//! | `lires get <id>` | Print one document summary as JSON |
//! | `lires note <id>` | Print (or `--set`) a document's note |
//! | `lires abstract <id>` | Print (or `--set`) a document's abstract |
//! | `lires rename-tag <from> <to>` | Rename a tag and its descendants |
//! | `lires delete-tag <tag>` | Delete a tag and its descendants |
//! | `lires reload` | Ask the server to reload its database |
//! | `lires watch` | Follow server events (printed as JSON lines) and keep the library loaded |

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lires_client::config::{self, Config};
use lires_client::conn::{ServerConn, SupplementKind};
use lires_client::event_channel::{EventChannel, WebSocketTransport};
use lires_client::library::{Library, SearchHit};
use lires_client::progress::ProgressMode;
use lires_client_core::channel::HandlerRegistry;
use lires_client_core::events::EventKind;
use lires_client_core::tags::TagSet;
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Lires CLI: a client for a Lires reference library server.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. The auth token may also be supplied through `LIRES_KEY`.
#[derive(Parser)]
#[command(name = "lires", about = "Client for a Lires reference library server", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/lires.toml")]
    config: PathBuf,

    /// More log output (-v debug, -vv trace). `LIRES_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Load progress on stderr. Defaults to human output on a TTY.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Stream the whole library into memory and print a summary.
    Load,

    /// Print the tag hierarchy of the loaded library.
    Tags {
        /// One fully-qualified tag per line instead of a tree.
        #[arg(long)]
        flat: bool,
    },

    /// Search the library.
    ///
    /// Selectors: general, title, id, author, year, publication (local);
    /// feature, note (evaluated by the server).
    Search {
        pattern: String,

        /// Field selector; defaults to `search.default_selector`.
        #[arg(long = "by")]
        selector: Option<String>,

        /// Restrict to documents carrying this tag (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,

        #[arg(long, default_value = "20")]
        limit: usize,

        /// Print hits as JSON lines.
        #[arg(long)]
        json: bool,
    },

    /// Print one document summary as JSON.
    Get { id: String },

    /// Print a document's note, or replace it with `--set`.
    Note {
        id: String,
        #[arg(long)]
        set: Option<String>,
    },

    /// Print a document's abstract, or replace it with `--set`.
    Abstract {
        id: String,
        #[arg(long)]
        set: Option<String>,
    },

    /// Rename a tag (and every descendant tag) on the server.
    RenameTag { from: String, to: String },

    /// Delete a tag (and every descendant tag) on the server.
    DeleteTag { tag: String },

    /// Ask the server to reload its database.
    Reload,

    /// Load the library, then print server events until interrupted.
    Watch,
}

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("LIRES_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn print_hit(hit: &SearchHit) {
    let r = &hit.record;
    let added = r
        .added_at()
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_default();
    match hit.score {
        Some(score) => println!("{:.3}  {}  {}  [{}] {}", score, r.year_author("  "), r.title, r.id, added),
        None => println!("{}  {}  [{}] {}", r.year_author("  "), r.title, r.id, added),
    }
}

async fn supplement_cmd(library: &Library, kind: SupplementKind, id: &str, set: Option<String>) -> Result<()> {
    match set {
        Some(text) => library.update_supplement(kind, id, text).await,
        None => {
            println!("{}", library.supplement(kind, id).await?);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let cfg: Config = config::load_config(&cli.config)?;
    let conn = ServerConn::from_config(&cfg.server).context("Failed to build HTTP client")?;
    let library = Library::new(conn.clone(), cfg.load.clone());
    let progress = cli
        .progress
        .map(ProgressMode::from)
        .unwrap_or_else(ProgressMode::default_for_tty)
        .reporter();

    match cli.command {
        Commands::Load => {
            let done = library.load(progress.as_ref()).await?;
            let (docs, tags) = library.read(|idx| (idx.len(), idx.all_tags().len()));
            println!("{} documents, {} tags ({} streamed)", docs, tags, done.current);
        }
        Commands::Tags { flat } => {
            library.load(progress.as_ref()).await?;
            let tags = library.read(|idx| idx.all_tags());
            if flat {
                for tag in tags.sorted() {
                    println!("{}", tag);
                }
            } else {
                for entry in tags.hierarchy().walk() {
                    let marker = if entry.tagged { "" } else { " (implied)" };
                    println!("{}{}{}", "  ".repeat(entry.depth), entry.label(), marker);
                }
            }
        }
        Commands::Search {
            pattern,
            selector,
            tags,
            limit,
            json,
        } => {
            library.load(progress.as_ref()).await?;
            let selector = selector.unwrap_or_else(|| cfg.search.default_selector.clone());
            let tags: TagSet = tags.iter().collect();
            let hits = library.search(&selector, &pattern, &tags).await?;
            for hit in hits.iter().take(limit) {
                if json {
                    let line = serde_json::json!({ "score": hit.score, "record": &hit.record });
                    println!("{}", line);
                } else {
                    print_hit(hit);
                }
            }
            if hits.len() > limit {
                eprintln!("... {} more", hits.len() - limit);
            }
        }
        Commands::Get { id } => {
            let record = library.refresh(&id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Note { id, set } => supplement_cmd(&library, SupplementKind::Note, &id, set).await?,
        Commands::Abstract { id, set } => {
            supplement_cmd(&library, SupplementKind::Abstract, &id, set).await?
        }
        Commands::RenameTag { from, to } => {
            library.rename_tag(&from, &to).await?;
            println!("renamed {} -> {}", from, to);
        }
        Commands::DeleteTag { tag } => {
            library.delete_tag(&tag).await?;
            println!("deleted {}", tag);
        }
        Commands::Reload => {
            conn.reload_db().await.context("Failed to reload server database")?;
            println!("server database reloaded");
        }
        Commands::Watch => {
            if !cfg.events.enabled {
                bail!("events.enabled is false in {}", cli.config.display());
            }
            let registry = HandlerRegistry::new();
            let _sync = library.subscribe(&registry);
            let channel = EventChannel::new(
                WebSocketTransport::new(conn.backend(), conn.key()),
                registry.clone(),
            )
            .with_policy(cfg.events.reconnect_policy())
            .on_final_failure(|| warn!("event channel gave up reconnecting"));

            let session_id = channel.session_id().to_string();
            let _printer = registry.on(EventKind::ALL, move |event| {
                let line = serde_json::json!({ "echo": event.is_echo_of(&session_id), "event": event });
                println!("{}", line);
            });

            let handle = channel.spawn();
            library.load(progress.as_ref()).await?;

            tokio::select! {
                _ = tokio::signal::ctrl_c() => handle.close(),
                _ = handle.closed() => {}
            }
            handle.closed().await;
            let docs = library.read(|idx| idx.len());
            eprintln!("watch ended with {} documents", docs);
        }
    }

    Ok(())
}
