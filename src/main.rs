use overlayd::cheatsheets::{CheatsheetService, CheatsheetStore};
use overlayd::config::Config;
use overlayd::server::{Handler, HttpServer, PKG_NAME, VERSION};
use overlayd::streamers::{StreamerService, StreamerStore};
use overlayd::supervisor::{Supervisor, SupervisorService};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "overlayd.toml";

const USAGE: &str = "usage: overlayd <streamers|supervisor|cheatsheets> [config.toml]";

/// Which service this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceKind {
    Streamers,
    Supervisor,
    Cheatsheets,
}

impl FromStr for ServiceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "streamers" => Ok(ServiceKind::Streamers),
            "supervisor" => Ok(ServiceKind::Supervisor),
            "cheatsheets" => Ok(ServiceKind::Cheatsheets),
            other => anyhow::bail!("Unknown service '{}'\n{}", other, USAGE),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("overlayd=debug".parse().expect("valid log directive")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(service) = args.next() else {
        anyhow::bail!("{}", USAGE);
    };
    let service: ServiceKind = service.parse()?;

    // Load configuration
    let config_path = args.next().map(PathBuf::from);
    let config = match config_path {
        Some(ref path) => Config::load(path),
        None => Config::load_or_default(DEFAULT_CONFIG_PATH),
    }
    .map_err(|e| {
        error!(path = ?config_path, error = %e, "Failed to load configuration");
        e
    })?;

    let bind_addr = config.server.socket_addr()?;
    info!(
        name = PKG_NAME,
        version = VERSION,
        service = ?service,
        addr = %bind_addr,
        "Starting service"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let max_body_bytes = config.server.max_body_bytes;

    let mut supervisor = None;
    let server_handle = match service {
        ServiceKind::Streamers => {
            info!(file = %config.streamers.file.display(), "Streamer list store");
            let handler = StreamerService::new(StreamerStore::new(&config.streamers), max_body_bytes);
            spawn_server(bind_addr, handler, shutdown_rx).await?
        }
        ServiceKind::Supervisor => {
            config.validate_supervisor()?;
            let sup = Supervisor::new(config.supervisor.clone());
            if let Some(pid) = sup.reconcile().await {
                warn!(pid, "An orphaned worker is still running; /start will launch a second one");
            }
            supervisor = Some(Arc::clone(&sup));
            spawn_server(bind_addr, SupervisorService::new(sup), shutdown_rx).await?
        }
        ServiceKind::Cheatsheets => {
            info!(
                storage_dir = %config.cheatsheets.storage_dir.display(),
                metadata_file = %config.cheatsheets.metadata_file.display(),
                escape_html = config.cheatsheets.escape_html,
                "Cheatsheet store"
            );
            let handler =
                CheatsheetService::new(CheatsheetStore::new(&config.cheatsheets), max_body_bytes);
            spawn_server(bind_addr, handler, shutdown_rx).await?
        }
    };

    wait_for_shutdown_signal().await;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    if let Some(supervisor) = supervisor {
        supervisor.shutdown().await;
    }

    // Wait for the server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

async fn spawn_server<H: Handler>(
    bind_addr: SocketAddr,
    handler: Arc<H>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<()>> {
    let server = HttpServer::bind(bind_addr, handler, shutdown_rx)
        .await
        .map_err(|e| {
            error!(addr = %bind_addr, error = %e, "Failed to bind");
            e
        })?;

    Ok(tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Server error");
        }
    }))
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}
