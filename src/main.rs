use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use rmcp::{transport::stdio, ServiceExt};
use toolgate::{
    logging::{self, LogFormat},
    Gateway, GatewayService,
};
use toolgate_mcp::{GatewayConfig, McpError};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "toolgate", version, about = "MCP gateway aggregating many tool servers")]
struct Cli {
    /// Config file (JSON, or YAML by extension)
    #[arg(short, long, env = "TOOLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level or filter directive; RUST_LOG takes precedence
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Expose bare tool names instead of <server>__<tool>
    #[arg(long)]
    no_namespace: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let bootstrap = logging::bootstrap_subscriber(logging::resolve_level(
        cli.log_level.as_deref(),
        None,
    ));
    let mut config = tracing::subscriber::with_default(bootstrap, || {
        GatewayConfig::load(cli.config.as_deref())
    });
    if cli.no_namespace {
        config.use_namespace = false;
    }

    let level = logging::resolve_level(
        cli.log_level.as_deref(),
        Some(config.log_level.as_str()),
    );
    if let Err(e) = logging::init(cli.log_format, level) {
        eprintln!("failed to initialize logging: {}", e);
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Gateway terminated");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    info!(
        name = %config.name,
        version = %config.version,
        servers = config.servers.len(),
        use_namespace = config.use_namespace,
        "Starting gateway"
    );

    let gateway = Gateway::new(config);
    let running = GatewayService::new(Arc::clone(&gateway))
        .serve(stdio())
        .await
        .map_err(|e| McpError::Upstream(e.to_string()))?;

    gateway.attach_upstream(running.peer().clone());
    info!("Upstream endpoint ready, connecting backends in the background");
    let _startup = gateway.start_background();

    let upstream_cancel = running.cancellation_token();
    tokio::select! {
        quit = running.waiting() => match quit {
            Ok(reason) => info!(reason = ?reason, "Upstream session ended"),
            Err(e) => warn!(error = %e, "Upstream session task failed"),
        },
        _ = shutdown_signal() => {
            info!("Termination signal received");
            upstream_cancel.cancel();
        }
    }

    gateway.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
