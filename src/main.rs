//! Server binary.
//!
//! Loads the TOML configuration (path in the first argument, defaults
//! otherwise), applies environment overrides, installs the tracing
//! subscriber, and runs the server until SIGINT/SIGTERM.
//!
//! Exit codes: 0 on clean shutdown, 1 on configuration or bind failure, 2
//! on fatal runtime failure.

use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use securechat::config::ServerConfig;
use securechat::error::ChatError;
use securechat::service::auth::StaticVerifier;
use securechat::transport::ChatServer;

#[tokio::main]
async fn main() -> ExitCode {
    let mut config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };
    config.apply_env_overrides();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("starting securechat server");

    let verifier = StaticVerifier::from_config(&config.auth);
    let server = match ChatServer::bind(config, Box::new(verifier)).await {
        Ok(server) => server,
        Err(e @ (ChatError::ConfigInvalid(_) | ChatError::BindFailed(_))) => {
            error!(error = %e, "startup failed");
            return ExitCode::from(1);
        }
        Err(e) => {
            error!(error = %e, "startup failed");
            return ExitCode::from(2);
        }
    };

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        shutdown.shutdown();
    });

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal runtime failure");
            ExitCode::from(2)
        }
    }
}

fn load_config() -> securechat::error::Result<ServerConfig> {
    match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_file(path),
        None => Ok(ServerConfig::default()),
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
