use std::{env, io, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use devjail_core::{Dispatcher, EngineConfig};
use tracing_subscriber::EnvFilter;

mod http;
mod llm;

#[derive(Parser, Debug)]
#[command(name = "devjaild", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Project root every operation is confined to (defaults to the cwd)
    #[arg(long = "root", value_name = "PATH")]
    root: Option<PathBuf>,

    /// Explicit configuration file (defaults to <root>/devjail.toml)
    #[arg(long = "config", value_name = "FILE")]
    config_path: Option<PathBuf>,

    #[arg(long = "host", value_name = "HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long = "port", value_name = "PORT", default_value_t = 3111)]
    port: u16,

    /// Shell for terminal sessions
    #[arg(long = "shell", value_name = "PATH")]
    shell: Option<String>,

    /// Log filter (e.g. info, debug, devjail_core=trace)
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let root = match &args.root {
        Some(root) => root.clone(),
        None => match env::var_os("DEVJAIL_PROJECT_ROOT") {
            Some(root) => PathBuf::from(root),
            None => env::current_dir().context("failed to read current directory")?,
        },
    };
    let root = root
        .canonicalize()
        .with_context(|| format!("project root {} is not accessible", root.display()))?;

    let mut config = EngineConfig::load(&root, args.config_path.as_deref())
        .context("failed to load configuration")?;
    if args.root.is_some() {
        config.project_root = root;
    }
    if let Some(shell) = &args.shell {
        config.shell = shell.clone();
    }
    config.validate().context("invalid configuration")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        root = %config.project_root.display(),
        shell = %config.shell,
        allow_shell = config.allow_shell,
        "starting devjaild"
    );

    let provider = llm::provider_from_config(&config.llm)?;
    let dispatcher = Arc::new(
        Dispatcher::new(&config, provider).context("failed to initialise the engine")?,
    );

    let result = http::serve(Arc::clone(&dispatcher), &args.host, args.port, shutdown_signal()).await;

    dispatcher.sessions().shutdown().await;
    tracing::info!("devjaild stopped");
    result
}

fn init_tracing(args: &Args) {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
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
    tracing::info!("shutdown requested");
}
