use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use treemeta_kv_backends::{MemTableClient, MemTableFactory};
use treemeta_store::{
    MetadataStore, NoopRetryListener, PathMetadata, StoreConfig, StorePath, TableMetadataStore,
};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Table metadata store walkthrough
///
/// Runs the store against the in-memory table service:
///   1. Load config (or fall back to defaults) and bind the table
///   2. Save a few files and list them
///   3. Rename a directory and delete a subtree
///   4. Prune old entries, print diagnostics, destroy the table
#[derive(Parser, Debug)]
#[command(name = "treemeta-demo", version, about)]
struct Args {
    /// Path to configuration file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<String>,

    /// Bucket to populate
    #[arg(short, long, default_value = "demo-bucket")]
    bucket: String,

    /// Keep the table instead of destroying it at the end
    #[arg(long)]
    keep: bool,
}

fn demo_config() -> StoreConfig {
    let mut config = StoreConfig::new("treemeta-demo", "local");
    config.create_table = true;
    config.owner = "demo".to_string();
    config
}

fn path_in(bucket: &str, rel: &str) -> anyhow::Result<StorePath> {
    Ok(StorePath::parse(&format!("{}{}", StorePath::root(bucket)?, rel))?)
}

async fn print_listing(store: &TableMetadataStore, path: &StorePath) -> anyhow::Result<()> {
    match store.list_children(path).await? {
        Some(listing) => {
            for child in &listing.listing {
                let kind = if child.is_deleted {
                    "deleted"
                } else if child.is_dir {
                    "dir"
                } else {
                    "file"
                };
                println!("  {:<8} {}", kind, child.path);
            }
        }
        None => println!("  {} does not exist", path),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = match &args.config {
        Some(path) => StoreConfig::load(path)?,
        None => demo_config(),
    };
    let backend = MemTableClient::new(config.region.clone());
    let store = TableMetadataStore::new(
        config,
        &MemTableFactory::new(backend),
        Arc::new(NoopRetryListener),
    )?;
    store.initialize().await?;
    tracing::info!(store = %store, "Store ready");

    let now = chrono::Utc::now().timestamp_millis();
    let mut files = Vec::new();
    for (rel, length, mod_time) in [
        ("src/main.rs", 1200, now),
        ("src/lib.rs", 800, now),
        ("docs/guide/intro.md", 300, now),
        ("tmp/stale.log", 50, now - 2 * DAY_MS),
    ] {
        files.push(PathMetadata::file(
            path_in(&args.bucket, rel)?,
            length,
            mod_time,
            4096,
            "demo",
        ));
    }
    store.put_all(files).await?;

    let root = StorePath::root(args.bucket.as_str())?;
    println!("{}:", root);
    print_listing(&store, &root).await?;

    // Rename src -> lib.
    let src = path_in(&args.bucket, "src")?;
    let lib = path_in(&args.bucket, "lib")?;
    let mut to_delete = vec![src.clone()];
    let mut to_create = Vec::new();
    if let Some(listing) = store.list_children(&src).await? {
        tracing::info!(entries = ?listing.names(), "Moving {} to {}", src, lib);
        for child in listing.listing.into_iter().filter(PathMetadata::is_live) {
            to_delete.push(child.path.clone());
            let mut moved = child.clone();
            moved.path = lib.child(child.path.name())?;
            to_create.push(moved);
        }
    }
    store.move_paths(Some(to_delete), Some(to_create)).await?;

    store
        .delete_subtree(&path_in(&args.bucket, "docs")?)
        .await?;

    println!("{} after rename and delete:", root);
    print_listing(&store, &root).await?;
    println!("{}:", lib);
    print_listing(&store, &lib).await?;

    let pruned = store.prune(now - DAY_MS).await?;
    println!("pruned {} entries older than a day", pruned);

    for (key, value) in store.diagnostics().await? {
        println!("  {:<15} {}", key, value);
    }

    if !args.keep {
        store.destroy().await?;
    }
    store.close();
    tracing::info!("Demo finished");

    Ok(())
}
