// src/main.rs

//! The main entry point for the NVMe-oF gateway control plane.

use anyhow::Result;
use nvmeof_gw::config::Config;
use nvmeof_gw::store::MemoryObjectStore;
use nvmeof_gw::supervisor::{self, logs};
use nvmeof_gw::{discovery, store::ObjectStore};
use std::env;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("nvmeof-gw version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path. It can be provided via a --config
    // flag; otherwise, it defaults to "nvmeof-gw.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("nvmeof-gw.toml");

    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    // The object store seam: the in-process store serves single-host and
    // test deployments; a distributed backend plugs in behind the trait.
    let store: Arc<dyn ObjectStore> = {
        let store = MemoryObjectStore::new();
        store.add_pool(&config.store.pool);
        Arc::new(store)
    };

    if args.iter().any(|arg| arg == "--discovery") {
        // --- Standalone discovery responder mode ---
        tracing_subscriber::fmt()
            .with_env_filter(
                env::var("RUST_LOG").unwrap_or_else(|_| config.logs.log_level.clone()),
            )
            .compact()
            .with_ansi(true)
            .init();

        if let Err(e) = discovery::run_standalone(&config, store).await {
            error!("Discovery runtime error: {e}");
            return Err(e.into());
        }
        return Ok(());
    }

    // --- Gateway mode ---

    // Reloadable filter so the log level can be changed over the API.
    let initial_log_level =
        env::var("RUST_LOG").unwrap_or_else(|_| config.logs.log_level.clone());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));

    let file_writer = if config.logs.log_files_enabled {
        logs::setup_log_writer(
            &config.logs.log_directory,
            &config.gateway.name,
            config.logs.max_log_file_size_in_mb,
            config.logs.max_log_files_count,
            config.logs.log_files_rotation_enabled,
        )
    } else {
        None
    };

    match file_writer {
        Some(writer) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false),
                )
                .init();
            // Keep the writer thread alive for the whole process lifetime.
            Box::leak(Box::new(guard));
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
                .init();
        }
    }

    let reload_handle = Arc::new(reload_handle);
    if let Err(e) = supervisor::serve(config, store, Some(reload_handle)).await {
        error!("Gateway runtime error: {e}");
        return Err(e);
    }

    Ok(())
}
