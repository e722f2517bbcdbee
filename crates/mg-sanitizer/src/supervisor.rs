//! Deadline supervisor around the editor worker.
//!
//! The worker lives in a slot guarded by an async mutex, so only one document
//! operation runs at a time. Each job moves the worker onto a blocking thread
//! and waits at most `deadline`. A job that overruns is abandoned: every
//! editor process is killed, a fresh worker is launched into the slot, and the
//! job is reported as failed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::editor::EditorLauncher;
use crate::worker::{EditorWorker, SanitizeJob, WorkerError};

pub const DEFAULT_DOC_DEADLINE: Duration = Duration::from_secs(180);

pub struct WorkerSupervisor {
    slot: Mutex<Option<EditorWorker>>,
    launcher: Arc<dyn EditorLauncher>,
    debug: bool,
    deadline: Duration,
    available: AtomicBool,
    stopped: AtomicBool,
}

impl WorkerSupervisor {
    /// Launch the first worker. Blocking; call from a blocking context.
    pub fn start(
        launcher: Arc<dyn EditorLauncher>,
        debug: bool,
        deadline: Duration,
    ) -> Result<Self, WorkerError> {
        let worker = EditorWorker::start(launcher.as_ref(), debug)?;
        Ok(Self {
            slot: Mutex::new(Some(worker)),
            launcher,
            debug,
            deadline,
            available: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub async fn run(&self, job: SanitizeJob) -> Result<(), WorkerError> {
        let mut slot = self.slot.lock().await;
        if self.stopped.load(Ordering::Acquire) {
            return Err(WorkerError::Unavailable);
        }
        if slot.is_none() {
            self.recreate(&mut slot).await;
        }
        let Some(mut worker) = slot.take() else {
            return Err(WorkerError::Unavailable);
        };

        let path = job.path.clone();
        let task = tokio::task::spawn_blocking(move || {
            let res = worker.process(&job);
            (worker, res)
        });
        match tokio::time::timeout(self.deadline, task).await {
            Ok(Ok((worker, res))) => {
                *slot = Some(worker);
                res
            }
            Ok(Err(e)) => {
                error!("worker task for {} died: {e}", path.display());
                self.recreate(&mut slot).await;
                Err(WorkerError::Panicked)
            }
            Err(_) => {
                warn!(
                    "{} exceeded {:?}, recreating editor",
                    path.display(),
                    self.deadline
                );
                self.recreate(&mut slot).await;
                Err(WorkerError::DeadlineExceeded(self.deadline))
            }
        }
    }

    async fn recreate(&self, slot: &mut Option<EditorWorker>) {
        self.available.store(false, Ordering::Release);
        let launcher = self.launcher.clone();
        let debug = self.debug;
        let task = tokio::task::spawn_blocking(move || {
            launcher.kill_all();
            EditorWorker::start(launcher.as_ref(), debug)
        });
        // A launch that hangs leaves the slot empty; the next job retries.
        match tokio::time::timeout(self.deadline, task).await {
            Ok(Ok(Ok(worker))) => {
                *slot = Some(worker);
                self.available.store(true, Ordering::Release);
                info!("editor worker recreated");
            }
            Ok(Ok(Err(e))) => error!("failed to recreate editor worker: {e}"),
            Ok(Err(e)) => error!("editor recreation task died: {e}"),
            Err(_) => error!(
                "editor did not come back within {:?}, retrying on the next job",
                self.deadline
            ),
        }
    }

    /// Quit the editor. Waits for any running job first.
    pub async fn shutdown(&self) {
        let worker = {
            let mut slot = self.slot.lock().await;
            self.stopped.store(true, Ordering::Release);
            self.available.store(false, Ordering::Release);
            slot.take()
        };
        if let Some(worker) = worker {
            if let Err(e) = tokio::task::spawn_blocking(move || worker.quit()).await {
                error!("editor quit task died: {e}");
            }
        }
    }

    /// Kill every editor process without waiting for the running job.
    pub async fn kill_editors(&self) {
        self.stopped.store(true, Ordering::Release);
        self.available.store(false, Ordering::Release);
        let launcher = self.launcher.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || launcher.kill_all()).await {
            error!("editor kill task died: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::testing::{FakeEditor, FakeLauncher};

    fn job(path: &str) -> SanitizeJob {
        SanitizeJob {
            path: path.into(),
            module: "Module1".into(),
            operation: "remediate".into(),
        }
    }

    fn supervisor(editor: &FakeEditor, deadline: Duration) -> Arc<WorkerSupervisor> {
        Arc::new(
            WorkerSupervisor::start(
                Arc::new(FakeLauncher::new(editor.clone())),
                false,
                deadline,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn hung_open_is_abandoned_and_worker_recovers() {
        let editor = FakeEditor::default().with_modules(&["Module1"]);
        let sup = supervisor(&editor, Duration::from_millis(200));
        editor.hang_next_opens(1);

        let started = Instant::now();
        let err = sup.run(job("/stuck.xlsm")).await.unwrap_err();
        assert!(matches!(err, WorkerError::DeadlineExceeded(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(sup.is_available());
        assert_eq!(editor.kills(), 1);
        assert_eq!(editor.launches(), 2);

        // The fresh worker accepts the next document.
        sup.run(job("/next.xlsm")).await.unwrap();
        assert_eq!(editor.opens(), 1);
    }

    #[tokio::test]
    async fn hung_relaunch_does_not_hold_the_slot() {
        let editor = FakeEditor::default().with_modules(&["Module1"]);
        let sup = supervisor(&editor, Duration::from_millis(200));
        editor.hang_next_opens(1);
        editor.hang_next_launches(1);

        let started = Instant::now();
        let err = sup.run(job("/stuck.xlsm")).await.unwrap_err();
        assert!(matches!(err, WorkerError::DeadlineExceeded(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!sup.is_available());

        // Killing the editor releases the stuck launch; the next job relaunches.
        FakeLauncher::new(editor.clone()).kill_all();
        sup.run(job("/next.xlsm")).await.unwrap();
        assert!(sup.is_available());
        assert_eq!(editor.opens(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_jobs_never_open_two_documents() {
        let editor = FakeEditor::default()
            .with_modules(&["Module1"])
            .with_open_delay(Duration::from_millis(5));
        let sup = supervisor(&editor, DEFAULT_DOC_DEADLINE);

        let mut handles = Vec::new();
        for i in 0..32 {
            let sup = sup.clone();
            handles.push(tokio::spawn(async move {
                sup.run(job(&format!("/doc-{i}.xlsm"))).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(editor.opens(), 32);
        assert_eq!(editor.max_open(), 1);
    }

    #[tokio::test]
    async fn shutdown_leaves_worker_unavailable() {
        let editor = FakeEditor::default();
        let sup = supervisor(&editor, DEFAULT_DOC_DEADLINE);
        sup.shutdown().await;
        assert!(!sup.is_available());
        assert!(matches!(
            sup.run(job("/late.xlsm")).await,
            Err(WorkerError::Unavailable)
        ));
        assert_eq!(editor.launches(), 1);
    }
}
