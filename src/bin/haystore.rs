//! The storage layer's entry point.
//!
//! Parses CLI args with clap's derive macros, loads a `StoreConfig`, builds
//! the multi-location `Store` it describes, and starts the HTTP server.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use haystack_store::config::StoreConfig;
use haystack_store::disk_location::DiskLocation;
use haystack_store::errors::Result;
use haystack_store::http::server;
use haystack_store::remote::NullMasterLookup;
use haystack_store::store::Store;

#[derive(Parser, Debug)]
#[command(name = "haystore", about = "The storage layer")]
struct Args {
    /// Path to a TOML config file. Falls back to built-in defaults, overridable by HAYSTACK_* env vars.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Overrides the listening HTTP port from the config file.
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = StoreConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.port = port;
    }

    let locations: Vec<DiskLocation> = config
        .locations
        .iter()
        .map(|loc| {
            std::fs::create_dir_all(&loc.directory).ok();
            DiskLocation::new(loc.directory.clone(), loc.max_volumes)
        })
        .collect();

    let store = Arc::new(Store::new(locations));
    store.load_existing_volumes()?;
    tracing::info!(
        locations = store.locations().len(),
        "store initialized"
    );

    let addr = config.socket_addr()?;
    let master = if config.allow_remote_reads || config.redirect_on_remote {
        Some(Arc::new(NullMasterLookup) as Arc<dyn haystack_store::remote::MasterLookup>)
    } else {
        None
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    runtime.block_on(server::serve(store, master, addr))
}
