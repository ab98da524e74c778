use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use objfs::{
    FileStatus, FsConfig, FsPath, ObjectFileSystem,
    backends::LocalStore,
    config::ConfigArgs,
    db,
    metastore::{MemoryMetastore, MetadataStore, SqliteMetastore},
};
use serde_json::json;
use std::{fs, path::PathBuf, sync::Arc};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

/// Hierarchical filesystem commands over a local object store.
#[derive(Parser, Debug)]
#[command(name = "objfs", version, about)]
struct Cli {
    /// Directory holding object payloads
    #[arg(long, default_value = "./data")]
    root: PathBuf,

    /// SQLite URL of the object catalog (default: <root>/objects.db)
    #[arg(long)]
    database_url: Option<String>,

    /// Metastore: `memory` or a SQLite URL; none when omitted
    #[arg(long)]
    metastore: Option<String>,

    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the status of a path
    Stat { path: String },
    /// List a directory
    Ls {
        path: String,
        /// Every file in the subtree
        #[arg(short, long)]
        recursive: bool,
    },
    /// Create a directory and its parents
    Mkdir { path: String },
    /// Upload a local file
    Put {
        local: PathBuf,
        path: String,
        #[arg(long)]
        overwrite: bool,
    },
    /// Write a file to stdout
    Cat { path: String },
    /// Delete a file or directory
    Rm {
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Rename a file or directory
    Mv { src: String, dst: String },
    /// Apply the schema to the catalog and metastore databases, then exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = FsConfig::from_env_and_args(&cli.config)?;
    tracing::debug!("Starting objfs with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !cli.root.exists() {
        fs::create_dir_all(&cli.root)?;
        tracing::info!("Created storage directory at {}", cli.root.display());
    }

    let db_url = cli
        .database_url
        .clone()
        .unwrap_or_else(|| format!("sqlite://{}/objects.db", cli.root.display()));
    let catalog = Arc::new(
        db::connect(&db_url)
            .await
            .with_context(|| format!("opening catalog {}", db_url))?,
    );

    // --- Handle migration mode ---
    if matches!(cli.command, Command::Migrate) {
        db::run_migrations(&catalog).await?;
        if let Some(url) = cli.metastore.as_deref().filter(|url| *url != "memory" && *url != db_url) {
            db::open(url).await?;
        }
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    let metastore: Option<Arc<dyn MetadataStore>> = match cli.metastore.as_deref() {
        None => None,
        Some("memory") => {
            let mut metastore = MemoryMetastore::new(cfg.owner.clone());
            if let Some(ttl) = cfg.metastore_ttl {
                metastore = metastore.with_tombstone_ttl(ttl);
            }
            Some(Arc::new(metastore))
        }
        Some(url) => {
            let pool = if url == db_url {
                catalog.clone()
            } else {
                Arc::new(db::connect(url).await?)
            };
            let mut metastore = SqliteMetastore::new(pool, cfg.owner.clone());
            if let Some(ttl) = cfg.metastore_ttl {
                metastore = metastore.with_tombstone_ttl(ttl);
            }
            Some(Arc::new(metastore))
        }
    };

    let store = Arc::new(LocalStore::new(catalog, cli.root.clone()));
    let filesystem = ObjectFileSystem::new(store, metastore, cfg);
    let result = run(&filesystem, cli.command).await;
    filesystem.close();
    result
}

fn print_status(status: &FileStatus) -> Result<()> {
    println!("{}", serde_json::to_string(status)?);
    Ok(())
}

async fn run(filesystem: &ObjectFileSystem, command: Command) -> Result<()> {
    match command {
        Command::Stat { path } => {
            print_status(&filesystem.get_file_status(&FsPath::new(path)).await?)?;
        }
        Command::Ls { path, recursive } => {
            let path = FsPath::new(path);
            let statuses = if recursive {
                filesystem.list_files(&path, true).await?
            } else {
                filesystem.list_status(&path).await?
            };
            for status in &statuses {
                print_status(status)?;
            }
        }
        Command::Mkdir { path } => {
            let created = filesystem.mkdirs(&FsPath::new(&path)).await?;
            println!("{}", json!({ "path": path, "created": created }));
        }
        Command::Put {
            local,
            path,
            overwrite,
        } => {
            let status = filesystem
                .copy_from_local_file(&local, &FsPath::new(path), overwrite)
                .await?;
            print_status(&status)?;
        }
        Command::Cat { path } => {
            let body = filesystem.open(&FsPath::new(path)).await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&body).await?;
            stdout.flush().await?;
        }
        Command::Rm { path, recursive } => {
            let deleted = filesystem.delete(&FsPath::new(&path), recursive).await?;
            println!("{}", json!({ "path": path, "deleted": deleted }));
        }
        Command::Mv { src, dst } => {
            let renamed = filesystem
                .rename(&FsPath::new(&src), &FsPath::new(&dst))
                .await?;
            println!("{}", json!({ "src": src, "dst": dst, "renamed": renamed }));
        }
        Command::Migrate => {}
    }
    Ok(())
}
