//! mdstore Administration CLI

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use mdstore_core::{
    Content, HistoryConfig, MetadataStore, Store, StoreConfig, VerifyPhase, VerifyProgress,
    VersionedStore,
};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "mdstore-admin")]
#[command(author = "mdstore Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Versioned metadata store administration tool")]
struct Cli {
    /// Store configuration file
    #[arg(short, long, default_value = "store.json")]
    config: PathBuf,

    /// Identity recorded on changes (defaults to $USER)
    #[arg(short, long, global = true)]
    author: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a new store configuration and create its directories
    Init {
        /// Base identifier, e.g. DocPortal_document
        id: String,
        /// Directory for current content
        base_dir: PathBuf,
        /// Revision log repository; omit for an unversioned store
        #[arg(long)]
        history: Option<PathBuf>,
        #[arg(long, default_value = "4-2-2")]
        layout: String,
        #[arg(long)]
        doc_type: Option<String>,
        /// Accept payloads that are not XML
        #[arg(long)]
        unstructured: bool,
    },

    /// Create or update an object from a file ("-" reads stdin)
    Put {
        #[arg(short, long)]
        file: String,
        /// Object id; a fresh one is allocated when omitted
        id: Option<u64>,
    },

    /// Print an object's content
    Cat {
        id: u64,
        #[arg(short, long)]
        revision: Option<u64>,
    },

    /// List the versions of an object
    Log {
        id: u64,
        #[arg(long)]
        json: bool,
    },

    /// Delete an object
    Delete { id: u64 },

    /// Make an earlier revision current again
    Restore { id: u64, revision: u64 },

    /// Compare local content with the latest committed revision
    Check { id: u64 },

    /// Verify the revision log and the store's consistency
    Verify {
        #[arg(short, long)]
        quiet: bool,
    },

    /// Rewrite local content from the revision log
    Refresh,
}

fn init_tracing(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn author(cli_author: Option<String>) -> String {
    cli_author
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "mdstore-admin".to_string())
}

fn read_input(file: &str) -> Result<Vec<u8>> {
    if file == "-" {
        let mut data = Vec::new();
        std::io::stdin().read_to_end(&mut data)?;
        Ok(data)
    } else {
        std::fs::read(file).with_context(|| format!("Failed to read {}", file))
    }
}

fn load_config(path: &PathBuf) -> Result<StoreConfig> {
    StoreConfig::load(path).with_context(|| format!("Cannot use store config {:?}", path))
}

fn print_progress(progress: VerifyProgress) {
    let phase = match progress.phase {
        VerifyPhase::Revisions => "revisions",
        VerifyPhase::Objects => "objects",
    };
    eprintln!(
        "  {} {}/{} ({}%)",
        phase,
        progress.done,
        progress.total,
        progress.percent()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let author = author(cli.author);

    match cli.command {
        Commands::Init {
            id,
            base_dir,
            history,
            layout,
            doc_type,
            unstructured,
        } => {
            if cli.config.exists() {
                bail!("Store config {:?} already exists", cli.config);
            }
            let mut config = StoreConfig::new(id, base_dir)
                .with_slot_layout(layout)
                .with_force_structured(!unstructured);
            if let Some(doc_type) = doc_type {
                config = config.with_doc_type(doc_type);
            }
            if let Some(repository) = history {
                config = config.with_history(HistoryConfig::new(repository));
            }
            config.validate()?;
            let store = Store::open(config.clone()).await?;
            config.save(&cli.config)?;
            println!("Store {} initialized ({:?})", store.id(), cli.config);
        }

        Commands::Put { file, id } => {
            let store = Store::open(load_config(&cli.config)?).await?;
            let content = Content::new(read_input(&file)?);
            let handle = match id {
                Some(id) if store.exists(id).await? => store.update(id, content, &author).await?,
                Some(id) => store.create(id, content, &author).await?,
                None => store.create_next(content, &author).await?,
            };
            println!(
                "{} at revision {}",
                handle.full_id(),
                handle
                    .revision()
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }

        Commands::Cat { id, revision } => {
            let store = Store::open(load_config(&cli.config)?).await?;
            let mut handle = match revision {
                Some(revision) => store.handle_at(id, revision),
                None => store.handle(id),
            };
            match handle.read().await? {
                Some(content) => {
                    std::io::stdout().write_all(content.data())?;
                }
                None => bail!(
                    "{} is deleted in revision {}",
                    handle.full_id(),
                    handle.revision().unwrap_or_default()
                ),
            }
        }

        Commands::Log { id, json } => {
            let store = Store::open(load_config(&cli.config)?).await?;
            let versions = store.versions(id).await?;
            if versions.is_empty() {
                bail!("{} has no versions", store.full_id(id));
            }
            if json {
                let infos: Vec<_> = versions.iter().map(|v| v.info()).collect();
                println!("{}", serde_json::to_string_pretty(&infos)?);
            } else {
                for version in &versions {
                    println!(
                        "r{} {} {} {}",
                        version.revision(),
                        version.type_char(),
                        version.date().format("%Y-%m-%d %H:%M:%S%.3f"),
                        version.author()
                    );
                }
            }
        }

        Commands::Delete { id } => {
            let store = Store::open(load_config(&cli.config)?).await?;
            store.delete(id, &author).await?;
            println!("{} deleted", store.full_id(id));
        }

        Commands::Restore { id, revision } => {
            let store = Store::open(load_config(&cli.config)?).await?;
            let record = store.version(id, revision).await?;
            let latest = record.restore(&author).await?;
            println!(
                "{} restored to revision {}, now at revision {}",
                latest.full_id(),
                revision,
                latest.revision().unwrap_or_default()
            );
        }

        Commands::Check { id } => {
            let store = Store::open(load_config(&cli.config)?).await?;
            if store.backend().is_up_to_date(id).await? {
                println!("{} is up to date", store.full_id(id));
            } else {
                println!("{} differs from the revision log", store.full_id(id));
                std::process::exit(1);
            }
        }

        Commands::Verify { quiet } => {
            let config = load_config(&cli.config)?;
            if !quiet {
                println!("Verifying store {}", config.id);
            }
            let store = Store::open(config).await?;
            let report = if quiet {
                store.verify(None).await?
            } else {
                store.verify(Some(&print_progress)).await?
            };
            if !quiet {
                println!(
                    "Verified {} revisions, {} blobs, {} objects",
                    report.revisions, report.blobs, report.objects
                );
            }
        }

        Commands::Refresh => {
            let config = load_config(&cli.config)?;
            if config.history.is_none() {
                return Err(anyhow!("Store {} keeps no revision log", config.id));
            }
            let store = VersionedStore::open(config).await?;
            let count = store.refresh_local_cache().await?;
            println!(
                "Refreshed {} objects of store {}",
                count,
                store.config().id
            );
        }
    }

    Ok(())
}
