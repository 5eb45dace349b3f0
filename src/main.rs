//! jobgate entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use jobgate::admission::{build_mutators, build_validators, Pipeline};
use jobgate::config::{load_config, Config};
use jobgate::proxy::{serve, ProxyService};
use jobgate::tls::build_acceptor;

#[derive(Parser, Debug)]
#[command(author, version, about = "Admission-control reverse proxy for Nomad job submissions")]
struct Cli {
    /// Path to the jobgate config file.
    #[arg(short, long, env = "JOBGATE_CONFIG")]
    config: Option<PathBuf>,
}

fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => {
                init_tracing(&config.log_level);
                info!(config = %path.display(), "loaded config");
                config
            }
            Err(e) => {
                init_tracing("info");
                error!(error = %e, "failed to load config");
                return ExitCode::FAILURE;
            }
        },
        None => {
            let config = Config::default_config();
            init_tracing(&config.log_level);
            info!("no config file given, using default config");
            config
        }
    };

    match run(config).await {
        Ok(()) => {
            info!("jobgate stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "jobgate failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    // rustls needs a process-wide crypto provider before any TLS config is
    // assembled.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let (mutators, resolve_token_mutators) = build_mutators(&config)?;
    let (validators, resolve_token_validators) = build_validators(&config)?;
    let pipeline = Pipeline::new(
        mutators,
        validators,
        resolve_token_mutators || resolve_token_validators,
    );

    let service = Arc::new(ProxyService::new(&config, pipeline)?);

    let acceptor = config.tls.as_ref().map(build_acceptor).transpose()?;

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!(
        bind = %config.bind,
        port = config.port,
        nomad = %config.nomad.address,
        tls = acceptor.is_some(),
        "jobgate starting"
    );

    tokio::select! {
        () = serve(listener, acceptor, service) => {}
        () = shutdown_signal() => {
            info!("shutdown signal received, stopping");
        }
    }

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
