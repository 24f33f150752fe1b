//! shp-rust - CLI Entry Point
//!
//! `shp-rust client -c client.yaml` runs the local racing proxy,
//! `shp-rust server -c server.yaml` runs the authenticating HTTPS proxy.

// Use mimalloc as global allocator for better p99 latency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::{Parser, Subcommand};
use shp_rust::{Client, ClientConfig, Server, ServerConfig, VERSION};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shp-rust")]
#[command(author = "Tsang")]
#[command(version = VERSION)]
#[command(about = "Secure HTTP proxy client and server")]
struct Args {
    #[command(subcommand)]
    agent: Agent,
}

#[derive(Subcommand, Debug)]
enum Agent {
    /// Run the local proxy client
    Client {
        /// Path to configuration file
        #[arg(short = 'c', long = "config", default_value = "client.yaml")]
        config: PathBuf,

        /// Test configuration and exit
        #[arg(short = 't', long = "test")]
        test: bool,
    },
    /// Run the proxy server
    Server {
        /// Path to configuration file
        #[arg(short = 'c', long = "config", default_value = "server.yaml")]
        config: PathBuf,

        /// Test configuration and exit
        #[arg(short = 't', long = "test")]
        test: bool,
    },
}

fn main() -> anyhow::Result<()> {
    // Install aws-lc-rs as the default crypto provider for rustls
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .max_blocking_threads(32)
        .enable_all()
        // Reduce I/O polling overhead - check for new events every 61 ticks
        .event_interval(61)
        // Reduce cross-thread work stealing frequency for better cache locality
        .global_queue_interval(31)
        .thread_name("shp-worker")
        .build()?;

    runtime.block_on(async_main())
}

fn init_logging(level: Option<&str>) -> anyhow::Result<()> {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("shp_rust=info".parse()?);
    if let Some(level) = level {
        filter = filter.add_directive(format!("shp_rust={}", level).parse()?);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
    Ok(())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.agent {
        Agent::Client { config, test } => {
            let loaded = ClientConfig::load_async(&config).await;
            init_logging(loaded.as_ref().ok().and_then(|c| c.log_level.as_deref()))?;
            let config = require_config(loaded, &config);
            info!("shp-rust client v{}", VERSION);

            if test {
                info!("Configuration test passed");
                return Ok(());
            }

            let client = match Client::new(config) {
                Ok(client) => client,
                Err(e) => {
                    error!("Failed to initialize client: {}", e);
                    std::process::exit(1);
                }
            };
            if let Err(e) = client.run().await {
                error!("Client error: {}", e);
                std::process::exit(1);
            }
        }
        Agent::Server { config, test } => {
            let loaded = ServerConfig::load(&config);
            init_logging(loaded.as_ref().ok().and_then(|c| c.log_level.as_deref()))?;
            let config = require_config(loaded, &config);
            info!("shp-rust server v{}", VERSION);

            if test {
                info!("Configuration test passed");
                return Ok(());
            }

            let server = match Server::new(config) {
                Ok(server) => server,
                Err(e) => {
                    error!("Failed to initialize server: {}", e);
                    std::process::exit(1);
                }
            };
            if let Err(e) = server.run().await {
                error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn require_config<T>(loaded: shp_rust::Result<T>, path: &Path) -> T {
    match loaded {
        Ok(config) => {
            info!("Loaded configuration from {}", path.display());
            config
        }
        Err(e) => {
            error!("Failed to load configuration {}: {}", path.display(), e);
            std::process::exit(1);
        }
    }
}
