//! # Rocketship Server
//!
//! The long-lived engine process: it accepts suite submissions over the RPC
//! surface, orchestrates workflow execution, fans structured log lines out
//! to subscribers, and projects run evidence into the persistence sink.

pub mod auth;
pub mod config;
pub mod error;
pub mod persistence;
pub mod registry;
pub mod rpc;
pub mod service;

pub use auth::{AuthState, OidcVerifier};
pub use config::{DbConfig, ServerConfig};
pub use error::{ApiError, ApiResult, RpcCode};
pub use persistence::{
    MemoryStore, PersistenceSink, PostgresStore, ProjectionEvent, ResultStore, RunRecord,
    StepRecord, TestRecord,
};
pub use registry::{OVERRUN_MARKER, RUN_COMPLETE_MARKER, RunRegistry};
pub use rpc::{ShutdownHandle, router};
pub use service::{CreateRunRequest, EngineService};

use anyhow::{Context, Result};
use rocketship_engine::{PluginRegistry, RegistryBuilder, WorkflowConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Session file written under the run directory so external tooling (the
/// CLI, runner subprocesses) can find a locally started engine.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionFile {
    pub addr: SocketAddr,
    pub pid: u32,
}

impl SessionFile {
    pub fn path(run_dir: &Path) -> std::path::PathBuf {
        run_dir.join("engine.json")
    }
}

/// A running server: its bound address and the handles to stop and await it.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: ShutdownHandle,
    task: tokio::task::JoinHandle<Result<()>>,
}

impl ServerHandle {
    /// Ask the server to stop and wait for it to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.trigger().await;
        self.task.await.context("server task panicked")?
    }
}

/// Build the service stack and bind the listener, returning a handle.
///
/// The plugin registry must be sealed before any run can start; callers that
/// embed extra plugins pass their own sealed registry.
pub async fn spawn(config: ServerConfig, plugins: Option<Arc<PluginRegistry>>) -> Result<ServerHandle> {
    let plugins = match plugins {
        Some(plugins) => plugins,
        None => RegistryBuilder::with_builtins()?.seal(),
    };

    let store: Arc<dyn ResultStore> = match &config.db {
        Some(db) => Arc::new(
            PostgresStore::connect(&db.connection_url())
                .await
                .context("failed to connect to the relational store")?,
        ),
        None => MemoryStore::new(),
    };
    let persistence = PersistenceSink::spawn(store);

    let runs = Arc::new(RunRegistry::new(config.log_buffer_lines));
    let workflow_config = WorkflowConfig {
        test_fan_out: config.test_fan_out,
        ..WorkflowConfig::default()
    };
    let service = EngineService::new(plugins, runs, persistence, workflow_config);

    let oidc = match (&config.oidc_issuer, &config.oidc_client_id) {
        (Some(issuer), Some(client_id)) => Some(OidcVerifier::new(issuer, client_id)),
        _ => None,
    };
    let auth = AuthState::new(config.auth_required(), config.api_tokens.clone(), oidc);

    let (shutdown, mut shutdown_rx) = ShutdownHandle::new();
    let app = router(service, auth, shutdown.clone());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let addr = listener.local_addr().context("listener has no local addr")?;

    write_session_file(&config, addr)?;
    info!(%addr, auth_required = config.auth_required(), "engine listening");

    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
            .context("server error")
    });

    Ok(ServerHandle {
        addr,
        shutdown,
        task,
    })
}

/// Run the server until it is asked to stop, via the admin endpoint or an
/// interrupt signal.
pub async fn serve(config: ServerConfig) -> Result<()> {
    let ServerHandle {
        addr: _,
        shutdown,
        mut task,
    } = spawn(config, None).await?;

    tokio::select! {
        result = &mut task => result.context("server task panicked")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for the interrupt signal")?;
            info!("interrupt received; shutting down");
            shutdown.trigger().await;
            task.await.context("server task panicked")?
        }
    }
}

fn write_session_file(config: &ServerConfig, addr: SocketAddr) -> Result<()> {
    std::fs::create_dir_all(&config.run_dir)
        .with_context(|| format!("failed to create run dir {}", config.run_dir.display()))?;
    let session = SessionFile {
        addr,
        pid: std::process::id(),
    };
    let path = SessionFile::path(&config.run_dir);
    let encoded = serde_json::to_string_pretty(&session).context("failed to encode session file")?;
    std::fs::write(&path, encoded)
        .with_context(|| format!("failed to write session file {}", path.display()))?;
    Ok(())
}
