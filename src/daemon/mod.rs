//! Daemon: the process-wide registry of analysis workers and the Unix
//! socket control plane over it.
//!
//! Records stay in the registry after completion so `list`/`inspect` can
//! see terminal state; an explicit `cleanup` (or shutdown) removes them.
//! Stop requests only cancel: they return before release completes, and
//! the record flips to not-running when the worker actually returns.

pub mod protocol;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::analysis::{AnalysisError, AnalysisOptions, AnalysisWorker};

use protocol::{AnalysisSummary, Command, InspectReport, Request, Response};

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/bottle/daemon.sock";

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("analysis not found: {0}")]
    NotFound(String),

    #[error("missing request payload")]
    MissingPayload,

    #[error("missing analysis id")]
    MissingId,

    #[error("malformed payload: {0}")]
    BadPayload(String),

    #[error("io at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// How the daemon launches one analysis. The production launcher builds
/// an `AnalysisWorker`; tests substitute scripted runs.
#[async_trait]
pub trait AnalysisLauncher: Send + Sync {
    async fn run(
        &self,
        options: AnalysisOptions,
        cancel: CancellationToken,
    ) -> Result<(), AnalysisError>;
}

pub struct ProductionLauncher;

#[async_trait]
impl AnalysisLauncher for ProductionLauncher {
    async fn run(
        &self,
        options: AnalysisOptions,
        cancel: CancellationToken,
    ) -> Result<(), AnalysisError> {
        AnalysisWorker::production(options).run(cancel).await
    }
}

struct AnalysisRecord {
    id: String,
    options: AnalysisOptions,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    running: bool,
    error: Option<String>,
    cancel: CancellationToken,
}

impl AnalysisRecord {
    fn summary(&self) -> AnalysisSummary {
        AnalysisSummary {
            id: self.id.clone(),
            sample: self.options.sample_path.to_string_lossy().to_string(),
            c2_ip: self.options.c2_address.clone(),
            running: self.running,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
        }
    }

    fn status(&self) -> &'static str {
        if self.running {
            "running"
        } else if self.error.is_some() {
            "failed"
        } else {
            "completed"
        }
    }
}

pub struct Daemon {
    registry: Arc<RwLock<HashMap<String, AnalysisRecord>>>,
    launcher: Arc<dyn AnalysisLauncher>,
    tracker: TaskTracker,
}

impl Daemon {
    pub fn new(launcher: Arc<dyn AnalysisLauncher>) -> Self {
        Self {
            registry: Arc::new(RwLock::new(HashMap::new())),
            launcher,
            tracker: TaskTracker::new(),
        }
    }

    // ── Lifecycle RPCs ──────────────────────────────────────────

    /// Register and launch one analysis. Returns its id immediately.
    pub async fn start(&self, options: AnalysisOptions) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();

        let record = AnalysisRecord {
            id: id.clone(),
            options: options.clone(),
            started_at: Utc::now(),
            completed_at: None,
            running: true,
            error: None,
            cancel: cancel.clone(),
        };
        self.registry.write().await.insert(id.clone(), record);

        let registry = self.registry.clone();
        let launcher = self.launcher.clone();
        let task_id = id.clone();
        self.tracker.spawn(async move {
            let result = launcher.run(options, cancel).await;

            let mut registry = registry.write().await;
            if let Some(record) = registry.get_mut(&task_id) {
                record.completed_at = Some(Utc::now());
                record.running = false;
                record.error = match result {
                    Ok(()) => None,
                    // Cancellation is a normal way for a run to end.
                    Err(e) if e.is_cancelled() => None,
                    Err(e) => Some(e.to_string()),
                };
                tracing::info!(
                    analysis = %task_id,
                    error = ?record.error,
                    "analysis finished"
                );
            }
        });

        tracing::info!(analysis = %id, "analysis started");
        id
    }

    /// Request cancellation. Returns as soon as it is requested; release
    /// completion is observed via `list`/`inspect`.
    pub async fn stop(&self, id: &str) -> Result<(), DaemonError> {
        let registry = self.registry.read().await;
        let record = registry
            .get(id)
            .ok_or_else(|| DaemonError::NotFound(id.to_string()))?;
        record.cancel.cancel();
        tracing::info!(analysis = %id, "stop requested");
        Ok(())
    }

    pub async fn list(&self) -> Vec<AnalysisSummary> {
        let registry = self.registry.read().await;
        let mut rows: Vec<AnalysisSummary> = registry.values().map(|r| r.summary()).collect();
        rows.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        rows
    }

    pub async fn inspect(&self, id: &str) -> Result<InspectReport, DaemonError> {
        let registry = self.registry.read().await;
        let record = registry
            .get(id)
            .ok_or_else(|| DaemonError::NotFound(id.to_string()))?;
        let end = record.completed_at.unwrap_or_else(Utc::now);
        Ok(InspectReport {
            status: record.status().to_string(),
            options: record.options.clone(),
            duration: (end - record.started_at).num_milliseconds() as f64 / 1000.0,
        })
    }

    /// Remove records whose worker has returned. In-flight stops stay
    /// visible until their worker actually finishes.
    pub async fn cleanup(&self) -> usize {
        let mut registry = self.registry.write().await;
        let before = registry.len();
        registry.retain(|_, record| record.running);
        before - registry.len()
    }

    /// Cancel everything and wait for all workers to return.
    pub async fn shutdown(&self) {
        {
            let registry = self.registry.read().await;
            for record in registry.values() {
                record.cancel.cancel();
            }
        }
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("all analyses returned");
    }

    // ── Control socket ──────────────────────────────────────────

    /// Serve the control socket until `shutdown` is cancelled. On exit,
    /// cancels every analysis, waits for them, and removes the socket.
    pub async fn serve(
        self: Arc<Self>,
        socket_path: PathBuf,
        shutdown: CancellationToken,
    ) -> Result<(), DaemonError> {
        let socket_path = socket_path.as_path();
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| DaemonError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        match std::fs::remove_file(socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(DaemonError::Io {
                    path: socket_path.to_path_buf(),
                    source,
                });
            }
        }

        let listener = UnixListener::bind(socket_path).map_err(|source| DaemonError::Io {
            path: socket_path.to_path_buf(),
            source,
        })?;
        tracing::info!(socket = %socket_path.display(), "control socket listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let daemon = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = daemon.handle_connection(stream).await {
                                tracing::warn!(error = %e, "control connection failed");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                },
            }
        }

        self.shutdown().await;
        let _ = std::fs::remove_file(socket_path);
        Ok(())
    }

    async fn handle_connection(&self, mut stream: UnixStream) -> std::io::Result<()> {
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;

        let response = match serde_json::from_slice::<Request>(&raw) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => Response::failure(format!("malformed request: {e}")),
        };

        let out = serde_json::to_vec(&response).expect("response serializes");
        stream.write_all(&out).await?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn dispatch(&self, request: Request) -> Response {
        match self.dispatch_inner(request).await {
            Ok(response) => response,
            Err(e) => Response::failure(e.to_string()),
        }
    }

    async fn dispatch_inner(&self, request: Request) -> Result<Response, DaemonError> {
        match request.command {
            Command::Start => {
                let payload = request.payload.ok_or(DaemonError::MissingPayload)?;
                let options: AnalysisOptions = serde_json::from_value(payload)
                    .map_err(|e| DaemonError::BadPayload(e.to_string()))?;
                let id = self.start(options).await;
                Ok(Response::success(serde_json::json!({ "id": id })))
            }
            Command::Stop => {
                let id = request.id.ok_or(DaemonError::MissingId)?;
                self.stop(&id).await?;
                Ok(Response::empty())
            }
            Command::List => Ok(Response::success(self.list().await)),
            Command::Inspect => {
                let id = request.id.ok_or(DaemonError::MissingId)?;
                Ok(Response::success(self.inspect(&id).await?))
            }
            Command::Cleanup => {
                let removed = self.cleanup().await;
                Ok(Response::success(serde_json::json!({ "removed": removed })))
            }
        }
    }
}

/// One request/response exchange against a daemon socket (CLI side).
pub async fn request(socket_path: &Path, request: &Request) -> Result<Response, DaemonError> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .map_err(|source| DaemonError::Io {
            path: socket_path.to_path_buf(),
            source,
        })?;
    let raw = serde_json::to_vec(request).expect("request serializes");
    let io = |source| DaemonError::Io {
        path: socket_path.to_path_buf(),
        source,
    };
    stream.write_all(&raw).await.map_err(io)?;
    stream.shutdown().await.map_err(io)?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.map_err(io)?;
    serde_json::from_slice(&buf).map_err(|e| DaemonError::BadPayload(e.to_string()))
}
