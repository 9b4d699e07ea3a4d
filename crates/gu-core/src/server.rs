//! Restore-over-snapshot HTTP endpoint.
//!
//! `POST /restore` takes `{journal, targetDirectory}` and runs the snapshot's
//! batches backward, newest first. Every path an undo step writes must lie
//! inside `targetDirectory`; backups it reads must lie inside
//! `targetDirectory` or the server's backup root. Driver steps are refused:
//! they act on the host, not on a directory. Restores for one target are
//! serialized by its restore lock; a concurrent request gets `409`. Undo
//! steps are retry-safe, so replaying a request is harmless.
//!
//! `GET /health` answers `ok`.

use crate::executor::{Executor, OperationInterpreter};
use crate::journal::JournalSnapshot;
use crate::lock::LockError;
use crate::logging::event_names;
use crate::operation::UndoPayload;
use crate::store::{LockKind, StateStore};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Read;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Largest accepted request body.
const MAX_BODY_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    pub journal: JournalSnapshot,
    pub target_directory: PathBuf,
}

/// HTTP status and JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreResponse {
    pub status: u16,
    pub body: Value,
}

impl RestoreResponse {
    fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }
}

fn is_contained(path: &Path, root: &Path) -> bool {
    path.is_absolute()
        && !path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
        && path.starts_with(root)
}

/// Why an undo step may not run through this endpoint.
fn out_of_scope(undo: &UndoPayload, root: &Path, backup_root: &Path) -> Option<String> {
    match undo {
        UndoPayload::RestoreFile { backup, target } => {
            if !is_contained(target, root) {
                Some(format!("{} is outside {}", target.display(), root.display()))
            } else if !is_contained(backup, root) && !is_contained(backup, backup_root) {
                Some(format!(
                    "backup {} is outside {} and {}",
                    backup.display(),
                    root.display(),
                    backup_root.display()
                ))
            } else {
                None
            }
        }
        UndoPayload::RemoveFile { path } => (!is_contained(path, root))
            .then(|| format!("{} is outside {}", path.display(), root.display())),
        UndoPayload::DeregisterArtifact { name, .. } => Some(format!(
            "driver step '{}' cannot be restored over HTTP",
            name
        )),
        UndoPayload::Noop => None,
    }
}

/// Handle one `POST /restore` body.
pub fn handle_restore(
    body: &[u8],
    store: &StateStore,
    backup_root: &Path,
    interpreter: &dyn OperationInterpreter,
) -> RestoreResponse {
    let request: RestoreRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => return RestoreResponse::error(400, format!("invalid request: {}", e)),
    };
    if let Err(e) = request.journal.validate() {
        return RestoreResponse::error(400, e.to_string());
    }
    let root = &request.target_directory;
    if !root.is_absolute() || root.components().any(|c| matches!(c, Component::ParentDir)) {
        return RestoreResponse::error(400, "targetDirectory must be an absolute path");
    }
    for entry in &request.journal.batches {
        for op in &entry.operations {
            if let Some(reason) = out_of_scope(&op.undo, root, backup_root) {
                warn!(
                    target: event_names::SERVE_REJECTED,
                    artifact = %op.artifact_id,
                    root = %root.display(),
                    reason = %reason,
                    "undo step rejected"
                );
                return RestoreResponse::error(400, reason);
            }
        }
    }

    let target = &request.journal.target_id;
    let _lock = match store.try_lock(target, LockKind::Restore) {
        Ok(lock) => lock,
        Err(LockError::Unavailable(_)) => {
            return RestoreResponse::error(409, format!("restore already running for {}", target))
        }
        Err(e) => return RestoreResponse::error(500, e.to_string()),
    };

    let executor = Executor::new(interpreter);
    let mut batches_restored = 0usize;
    let mut operations_undone = 0usize;
    for entry in request.journal.batches.iter().rev() {
        let mut batch = entry.to_batch();
        match executor.run_backward(&mut batch) {
            Ok(undone) => {
                batches_restored += 1;
                operations_undone += undone;
            }
            Err(e) => {
                error!(target_id = %target, batch = %entry.id, error = %e, "restore request failed");
                return RestoreResponse {
                    status: 500,
                    body: json!({
                        "error": e.to_string(),
                        "batches_restored": batches_restored,
                    }),
                };
            }
        }
    }

    info!(
        target: event_names::SERVE_RESTORE,
        target_id = %target,
        batches = batches_restored,
        operations = operations_undone,
        "snapshot restored"
    );
    RestoreResponse {
        status: 200,
        body: json!({
            "journal": request.journal,
            "batches_restored": batches_restored,
            "operations_undone": operations_undone,
        }),
    }
}

/// Background restore server.
pub struct RestoreServer {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    addr: SocketAddr,
}

impl RestoreServer {
    pub fn start(
        bind: &str,
        store: StateStore,
        backup_root: PathBuf,
        interpreter: Arc<dyn OperationInterpreter + Send + Sync>,
    ) -> Result<Self, String> {
        let server = tiny_http::Server::http(bind)
            .map_err(|e| format!("failed to start restore server on {}: {}", bind, e))?;
        let addr = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| format!("restore server on {} is not bound to an IP address", bind))?;

        info!(target: event_names::SERVE_STARTED, addr = %addr, "restore server started");

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let thread = thread::Builder::new()
            .name("gu-restore".to_string())
            .spawn(move || serve_loop(server, &store, &backup_root, interpreter.as_ref(), &shutdown_clone))
            .map_err(|e| format!("failed to spawn restore thread: {}", e))?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
            addr,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Block until `stop` is set, then shut down.
    pub fn run_until(self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(200));
        }
        self.shutdown();
    }

    pub fn shutdown(mut self) {
        self.stop();
        info!("restore server stopped");
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = std::net::TcpStream::connect(self.addr);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RestoreServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn respond_json(request: tiny_http::Request, status: u16, body: &Value) {
    let mut response = tiny_http::Response::from_string(body.to_string()).with_status_code(status);
    if let Ok(header) = "Content-Type: application/json".parse::<tiny_http::Header>() {
        response = response.with_header(header);
    }
    if let Err(e) = request.respond(response) {
        warn!(error = %e, "failed to send response");
    }
}

fn serve_loop(
    server: tiny_http::Server,
    store: &StateStore,
    backup_root: &Path,
    interpreter: &dyn OperationInterpreter,
    shutdown: &AtomicBool,
) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let mut request = match server.recv_timeout(Duration::from_secs(1)) {
            Ok(Some(req)) => req,
            Ok(None) => continue,
            Err(e) => {
                if !shutdown.load(Ordering::SeqCst) {
                    error!(error = %e, "restore server accept error");
                }
                break;
            }
        };
        if shutdown.load(Ordering::SeqCst) {
            let _ = request
                .respond(tiny_http::Response::from_string("shutting down").with_status_code(503));
            break;
        }

        let method = request.method().clone();
        let url = request.url().to_string();
        debug!(method = %method, url = %url, "request");

        match (&method, url.trim_end_matches('/')) {
            (tiny_http::Method::Get, "/health") => {
                let _ = request.respond(tiny_http::Response::from_string("ok"));
            }
            (tiny_http::Method::Post, "/restore") => {
                let mut body = Vec::new();
                if let Err(e) = request
                    .as_reader()
                    .take(MAX_BODY_BYTES + 1)
                    .read_to_end(&mut body)
                {
                    respond_json(request, 400, &json!({ "error": e.to_string() }));
                    continue;
                }
                if body.len() as u64 > MAX_BODY_BYTES {
                    respond_json(request, 413, &json!({ "error": "request body too large" }));
                    continue;
                }
                let response = handle_restore(&body, store, backup_root, interpreter);
                respond_json(request, response.status, &response.body);
            }
            _ => {
                let _ = request
                    .respond(tiny_http::Response::from_string("not found").with_status_code(404));
            }
        }
    }
}
