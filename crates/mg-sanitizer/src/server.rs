//! Privileged sanitize server.
//!
//! Accepts connections on the local endpoint and reads one JSON request per
//! line. Control requests are answered inline. Sanitize requests are
//! acknowledged with `202` and queued for the single editor worker; the final
//! result is written later on the same connection under the same message id.
//! A `quit` request (or a termination signal) stops the accept loop, refuses
//! further sanitize work with `503` and drains what is queued.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mg_protocol::{
    ControlAction, MsgType, ProtocolError, RequestEnvelope, ResponseEnvelope, ResultCode,
    SanitizeRequest, decode_request, encode_line,
};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::editor::EditorLauncher;
use crate::lockfile::{LockError, LockGuard};
use crate::supervisor::{DEFAULT_DOC_DEADLINE, WorkerSupervisor};
use crate::transport::{BoxedReader, BoxedWriter, Listener, default_endpoint};
use crate::worker::{SanitizeJob, WorkerError};

const JOB_QUEUE_DEPTH: usize = 100;
const REPLY_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub endpoint: String,
    pub lock_file: PathBuf,
    pub doc_timeout: Duration,
    pub drain_timeout: Duration,
    pub debug: bool,
    pub dry_run: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            lock_file: PathBuf::from("privhelper.lock"),
            doc_timeout: DEFAULT_DOC_DEADLINE,
            drain_timeout: Duration::from_secs(210),
            debug: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("failed to bind {endpoint}: {source}")]
    Bind { endpoint: String, source: io::Error },
    #[error("editor worker failed to start: {0}")]
    Worker(#[from] WorkerError),
    #[error("refusing to run under the system account")]
    RunningAsSystem,
    #[error("server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

struct Job {
    request: RequestEnvelope,
    payload: SanitizeRequest,
    path: PathBuf,
    reply: mpsc::Sender<ResponseEnvelope>,
}

struct Shared {
    quit: broadcast::Sender<()>,
    shutting_down: AtomicBool,
    dry_run: bool,
}

impl Shared {
    fn begin_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            let _ = self.quit.send(());
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

enum Flow {
    Continue,
    Close,
}

pub struct PrivServer {
    config: ServerConfig,
    supervisor: Option<Arc<WorkerSupervisor>>,
}

impl PrivServer {
    /// `supervisor` may be `None` only in dry-run mode.
    pub fn new(config: ServerConfig, supervisor: Option<Arc<WorkerSupervisor>>) -> Self {
        Self { config, supervisor }
    }

    pub async fn serve<F>(self, mut listener: Listener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        let (quit_tx, mut quit_rx) = broadcast::channel::<()>(1);
        let shared = Arc::new(Shared {
            quit: quit_tx,
            shutting_down: AtomicBool::new(false),
            dry_run: self.config.dry_run,
        });
        let (job_tx, job_rx) = mpsc::channel::<Job>(JOB_QUEUE_DEPTH);
        let runner = tokio::spawn(run_jobs(job_rx, self.supervisor.clone()));
        let mut conns = JoinSet::new();

        info!("listening on {}", self.config.endpoint);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = quit_rx.recv() => {
                    info!("quit requested, shutting down");
                    break;
                }
                _ = &mut shutdown => {
                    info!("termination signal received, shutting down");
                    shared.begin_shutdown();
                    break;
                }
                res = listener.accept() => match res {
                    Ok((reader, writer)) => {
                        info!("accepted connection");
                        conns.spawn(handle_conn(reader, writer, shared.clone(), job_tx.clone()));
                    }
                    Err(e) => {
                        error!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
            }
        }
        drop(listener);
        drop(job_tx);

        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            let _ = runner.await;
            while conns.join_next().await.is_some() {}
        })
        .await;

        if let Some(sup) = &self.supervisor {
            if drained.is_ok() {
                sup.shutdown().await;
            } else {
                warn!(
                    "in-flight work did not drain within {:?}, abandoning it",
                    self.config.drain_timeout
                );
                conns.abort_all();
                sup.kill_editors().await;
            }
        }
        info!("server stopped");
        Ok(())
    }
}

/// Acquire the lock, start the editor, bind the endpoint and serve until quit.
pub async fn run<F>(
    config: ServerConfig,
    launcher: Arc<dyn EditorLauncher>,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send,
{
    let _lock = LockGuard::acquire(&config.lock_file)?;

    let supervisor = if config.dry_run {
        info!("dry run, editor not started");
        None
    } else {
        let debug = config.debug;
        let deadline = config.doc_timeout;
        let sup = tokio::task::spawn_blocking(move || {
            launcher.kill_all();
            WorkerSupervisor::start(launcher, debug, deadline)
        })
        .await??;
        Some(Arc::new(sup))
    };

    let listener = Listener::bind(&config.endpoint).map_err(|source| ServerError::Bind {
        endpoint: config.endpoint.clone(),
        source,
    })?;
    PrivServer::new(config, supervisor)
        .serve(listener, shutdown)
        .await
}

async fn run_jobs(mut jobs: mpsc::Receiver<Job>, supervisor: Option<Arc<WorkerSupervisor>>) {
    while let Some(job) = jobs.recv().await {
        let Some(sup) = &supervisor else {
            reply_to(&job, ResultCode::UNAVAILABLE, "editor unavailable");
            continue;
        };
        info!(
            detection = %job.payload.detection_name,
            "sanitizing {}", job.path.display()
        );
        let res = sup
            .run(SanitizeJob {
                path: job.path.clone(),
                module: job.payload.destination_module.clone(),
                operation: job.payload.action.clone(),
            })
            .await;
        match res {
            Ok(()) => {
                info!("sanitized {}", job.path.display());
                let msg = format!("sanitized {}", job.payload.path);
                reply_to(&job, ResultCode::OK, msg);
            }
            Err(e @ WorkerError::DeadlineExceeded(_)) => {
                error!("{}: {e}", job.path.display());
                reply_to(&job, ResultCode::DEADLINE_EXCEEDED, e.to_string());
            }
            Err(e) => {
                error!("failed to sanitize {}: {e}", job.path.display());
                reply_to(&job, ResultCode::FAILED, e.to_string());
            }
        }
    }
}

/// Never waits: the job runner is shared by every connection.
fn reply_to(job: &Job, code: u32, msg: impl Into<String>) {
    let resp = ResponseEnvelope::reply(&job.request, code, msg);
    let reason = match job.reply.try_send(resp) {
        Ok(()) => return,
        Err(mpsc::error::TrySendError::Full(_)) => "client is not reading, result dropped",
        Err(mpsc::error::TrySendError::Closed(_)) => {
            "connection closed before the result was delivered"
        }
    };
    warn!(
        client = %job.request.client_id,
        id = job.request.message_id,
        "{reason}"
    );
}

async fn handle_conn(
    reader: BoxedReader,
    writer: BoxedWriter,
    shared: Arc<Shared>,
    jobs: mpsc::Sender<Job>,
) {
    let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE_DEPTH);
    let writer_task = tokio::spawn(write_replies(writer, reply_rx));
    let mut quit_rx = shared.quit.subscribe();
    let mut lines = BufReader::new(reader).lines();

    while !shared.is_shutting_down() {
        let line = tokio::select! {
            _ = quit_rx.recv() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("connection read failed: {e}");
                break;
            }
        };
        let req = match decode_request(&line) {
            Ok(req) => req,
            Err(ProtocolError::Empty) => continue,
            Err(e) => {
                warn!("dropping message: {e}");
                continue;
            }
        };
        info!(
            client = %req.client_id,
            id = req.message_id,
            "received {:?} message", req.msg_type
        );
        debug!("raw message: {line}");
        if let Flow::Close = handle_request(req, &shared, &jobs, &reply_tx).await {
            break;
        }
    }

    drop(jobs);
    drop(reply_tx);
    // Finishes once every queued job for this connection has replied.
    if let Err(e) = writer_task.await {
        error!("connection writer failed: {e}");
    }
    debug!("connection closed");
}

async fn handle_request(
    req: RequestEnvelope,
    shared: &Shared,
    jobs: &mpsc::Sender<Job>,
    reply: &mpsc::Sender<ResponseEnvelope>,
) -> Flow {
    let respond = |code: u32, msg: &str| ResponseEnvelope::reply(&req, code, msg);
    match req.msg_type {
        MsgType::Control => {
            let action = match req.control_payload() {
                Ok(payload) => payload.control_action,
                Err(e) => {
                    warn!("bad control payload: {e}");
                    let _ = reply
                        .send(respond(ResultCode::BAD_REQUEST, "invalid request"))
                        .await;
                    return Flow::Continue;
                }
            };
            match action {
                ControlAction::Ping => {
                    let _ = reply.send(respond(ResultCode::OK, "pong")).await;
                    Flow::Continue
                }
                ControlAction::Disconn => {
                    let _ = reply.send(respond(ResultCode::OK, "ack")).await;
                    Flow::Close
                }
                ControlAction::Quit => {
                    info!("quit control received");
                    let _ = reply.send(respond(ResultCode::OK, "ack")).await;
                    shared.begin_shutdown();
                    Flow::Close
                }
                ControlAction::Unknown => {
                    warn!("unknown control action");
                    let _ = reply
                        .send(respond(ResultCode::BAD_REQUEST, "invalid request"))
                        .await;
                    Flow::Continue
                }
            }
        }
        MsgType::Sanitize => {
            if shared.is_shutting_down() {
                let _ = reply
                    .send(respond(ResultCode::UNAVAILABLE, "shutting down"))
                    .await;
                return Flow::Continue;
            }
            let payload = match req.sanitize_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("bad sanitize payload: {e}");
                    let _ = reply
                        .send(respond(ResultCode::BAD_REQUEST, "invalid request"))
                        .await;
                    return Flow::Continue;
                }
            };
            if shared.dry_run {
                info!(
                    module = %payload.destination_module,
                    action = %payload.action,
                    "dry run, not sanitizing {}", payload.path
                );
                let _ = reply.send(respond(ResultCode::OK, "dry run")).await;
                return Flow::Continue;
            }
            let path = absolute(Path::new(&payload.path));
            let _ = reply.send(respond(ResultCode::ACCEPTED, "enqueued")).await;
            let job = Job {
                request: req.clone(),
                payload,
                path,
                reply: reply.clone(),
            };
            if let Err(mpsc::error::SendError(job)) = jobs.send(job).await {
                reply_to(&job, ResultCode::UNAVAILABLE, "shutting down");
            }
            Flow::Continue
        }
        MsgType::Unknown => {
            warn!("unknown message type");
            let _ = reply
                .send(respond(ResultCode::BAD_REQUEST, "invalid request"))
                .await;
            Flow::Continue
        }
    }
}

async fn write_replies(mut writer: BoxedWriter, mut replies: mpsc::Receiver<ResponseEnvelope>) {
    while let Some(resp) = replies.recv().await {
        let line = match encode_line(&resp) {
            Ok(line) => line,
            Err(e) => {
                error!("cannot encode response: {e}");
                continue;
            }
        };
        if let Err(e) = writer.write_all(&line).await {
            warn!("write to client failed: {e}");
            break;
        }
        let _ = writer.flush().await;
    }
    let _ = writer.shutdown().await;
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
