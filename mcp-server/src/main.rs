mod config;
mod setup;
mod telemetry;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use setup::{ensure_database_directory_from_config, initialize_app};
use telemetry::{init_telemetry, log_config_validation, log_startup_info};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "broker-server")]
#[command(about = "Multi-agent task broker - HTTP only")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Start the broker server
    #[arg(long)]
    start: bool,

    /// Port to listen on
    #[arg(long, default_value = "3000")]
    port: u16,

    /// Configuration file path
    #[arg(short, long, env = "CONFIG_FILE")]
    config: Option<String>,

    /// Database URL override
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Listen address override (default: 127.0.0.1)
    #[arg(long, env = "LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Log level override
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(config_file) => {
            info!("Loading configuration from file: {}", config_file);
            Config::from_file(config_file)?
        }
        None => {
            info!("Loading configuration from environment");
            Config::from_env()?
        }
    };

    if let Some(ref database_url) = cli.database_url {
        info!("Overriding database URL from CLI");
        config.database.url = Some(database_url.clone());
    }

    if let Some(ref listen_addr) = cli.listen_addr {
        config.server.listen_addr = listen_addr.clone();
    }

    config.server.port = cli.port;

    info!("Server will listen on: {}", config.server_address());

    if let Some(ref log_level) = cli.log_level {
        info!("Overriding log level from CLI");
        config.logging.level = log_level.clone();
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    if !cli.start {
        println!("Multi-agent task broker");
        println!();
        println!("Usage:");
        println!("  broker-server --start --port=8888");
        println!();
        println!("This will:");
        println!("  - Start the broker HTTP server on the given port");
        println!("  - Use the configured (or default) SQLite database");
        println!("  - Run restart recovery before accepting connections");
        println!("  - Enable structured request logging");
        println!();
        println!("For more options, use: broker-server --help");
        return Ok(());
    }

    let config = load_config(&cli).context("Failed to load configuration")?;

    init_telemetry(&config.logging).context("Failed to initialize telemetry")?;

    log_config_validation(&config);

    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration validation failed");
        std::process::exit(1);
    }

    log_startup_info(&config);

    ensure_database_directory_from_config(&config).context("Failed to create database directory")?;

    info!("Starting broker server");

    let app = initialize_app(&config).await.context("Failed to initialize application")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let scheduler = app.scheduler.clone();
    let scheduler_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        scheduler.run(scheduler_shutdown).await;
    });

    let server_addr = config.server_address();
    let listener = tokio::net::TcpListener::bind(&server_addr)
        .await
        .with_context(|| format!("Failed to bind {server_addr}"))?;

    println!("Broker server is ready!");
    println!("  Listening on: http://{server_addr}");
    println!("  Request logging: enabled");
    println!();
    println!("Press Ctrl+C to shutdown");
    println!();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to register SIGTERM handler");
            let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                .expect("Failed to register SIGINT handler");

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            tokio::signal::ctrl_c().await.expect("Failed to listen for ctrl+c");
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        let _ = shutdown_tx.send(true);
    });

    let mut shutdown_rx = shutdown_rx;
    let result = axum::serve(listener, app.router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await;

    match result {
        Ok(_) => {
            println!("Broker server shut down cleanly");
            info!("broker server shut down cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "broker server error");
            println!("Server error: {e}");
            std::process::exit(3);
        }
    }
}
