// QoreDB Broker - multi-protocol database connection broker
// Core library

pub mod commands;
pub mod config;
pub mod engine;
pub mod observability;

use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{info, warn};

use config::BrokerConfig;
use engine::{DriverRegistry, FileTransport, RemoteFileStager, SessionManager, SftpTransport};

pub type SharedState = Arc<Mutex<AppState>>;
pub struct AppState {
    pub session_manager: Arc<SessionManager>,
}

impl AppState {
    pub fn new(config: BrokerConfig) -> Self {
        let transport = Arc::new(SftpTransport::new(config.transfer_timeout()));
        Self::with_transport(config, transport)
    }

    /// Builds the broker around a custom file transport
    pub fn with_transport(config: BrokerConfig, transport: Arc<dyn FileTransport>) -> Self {
        let registry = Arc::new(DriverRegistry::with_builtin_drivers());
        let stager = Arc::new(RemoteFileStager::new(
            config.staging_dir(),
            transport,
            config.delete_local_on_failed_upload,
        ));
        let session_manager = Arc::new(SessionManager::new(registry, stager, &config));

        Self { session_manager }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(BrokerConfig::load())
    }
}

/// Serves JSON-lines requests until `input` ends, then closes every connection.
pub async fn serve<R, W>(state: &SharedState, input: R, mut output: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = commands::dispatch_line(state, &line).await;
        let mut payload = response.to_string();
        payload.push('\n');
        output.write_all(payload.as_bytes()).await?;
        output.flush().await?;
    }

    commands::connection::close_all_connections(state).await;
    Ok(())
}

/// Runs the broker on stdin/stdout. Ctrl-C triggers the same shutdown sweep as EOF.
pub async fn run() -> std::io::Result<()> {
    let state: SharedState = Arc::new(Mutex::new(AppState::default()));
    info!("Broker started");

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    tokio::select! {
        result = serve(&state, stdin, stdout) => result?,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
            let closed = commands::connection::close_all_connections(&state).await;
            info!(closed, "Interrupted; connections closed");
        }
    }

    info!("Broker stopped");
    Ok(())
}
