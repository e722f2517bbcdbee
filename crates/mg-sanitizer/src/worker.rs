//! Single-document editor worker.
//!
//! The worker owns one editor instance and at most one open document. It is
//! not `Sync`; the supervisor moves it onto a blocking thread per job.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backup;
use crate::editor::{EditorApp, EditorError, EditorLauncher, PLACEHOLDER_MODULE_CODE, Workbook};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("workbook collection was never fetched")]
    WorkbooksUnavailable,
    #[error("no document is open")]
    NoDocument,
    #[error("document has no macro project")]
    NoMacroFound,
    #[error("unknown sanitize operation '{0}'")]
    UnknownOperation(String),
    #[error(transparent)]
    Editor(#[from] EditorError),
    #[error("editor worker is being recreated")]
    Unavailable,
    #[error("document operation exceeded {0:?}")]
    DeadlineExceeded(Duration),
    #[error("document operation panicked")]
    Panicked,
}

/// What to do with the matching macro module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizeOp {
    /// Replace the module's code with a placeholder.
    Remediate,
    /// Remove the module outright.
    RemoveModule,
}

impl SanitizeOp {
    pub fn parse(raw: &str) -> Result<Self, WorkerError> {
        match raw {
            "remediate" => Ok(Self::Remediate),
            "rm_module" => Ok(Self::RemoveModule),
            other => Err(WorkerError::UnknownOperation(other.to_string())),
        }
    }
}

/// One document to process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizeJob {
    pub path: PathBuf,
    pub module: String,
    pub operation: String,
}

pub struct EditorWorker {
    app: Box<dyn EditorApp>,
    workbooks_ready: bool,
    document: Option<Box<dyn Workbook>>,
    document_path: Option<PathBuf>,
    debug: bool,
}

impl EditorWorker {
    /// Wrap an already launched editor. Documents cannot be opened until
    /// [`fetch_workbooks`](Self::fetch_workbooks) succeeds.
    pub fn new(app: Box<dyn EditorApp>, debug: bool) -> Self {
        Self {
            app,
            workbooks_ready: false,
            document: None,
            document_path: None,
            debug,
        }
    }

    /// Launch an editor and fetch its workbook collection.
    pub fn start(launcher: &dyn EditorLauncher, debug: bool) -> Result<Self, WorkerError> {
        let app = launcher.launch(debug)?;
        let mut worker = Self::new(app, debug);
        worker.fetch_workbooks()?;
        info!(debug = worker.debug, "editor worker ready");
        Ok(worker)
    }

    pub fn fetch_workbooks(&mut self) -> Result<(), WorkerError> {
        self.app.fetch_workbooks()?;
        self.workbooks_ready = true;
        debug!("workbook collection fetched");
        Ok(())
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn is_document_open(&self) -> bool {
        self.document.is_some()
    }

    pub fn open(&mut self, path: &Path) -> Result<(), WorkerError> {
        if !self.workbooks_ready {
            return Err(WorkerError::WorkbooksUnavailable);
        }
        if self.document.is_some() {
            warn!("document still open while opening {}, closing it", path.display());
            self.save_and_close()?;
        }
        let doc = self.app.open(path)?;
        self.document = Some(doc);
        self.document_path = Some(path.to_path_buf());
        info!("opened {}", path.display());
        Ok(())
    }

    pub fn sanitize(&mut self, module: &str, op: SanitizeOp) -> Result<(), WorkerError> {
        let doc = self.document.as_mut().ok_or(WorkerError::NoDocument)?;
        if !doc.has_macro_project()? {
            return Err(WorkerError::NoMacroFound);
        }
        let names = doc.module_names()?;
        debug!("macro modules: {names:?}");
        if !names.iter().any(|n| n == module) {
            warn!("module {module} not present, nothing to do");
            return Ok(());
        }
        match op {
            SanitizeOp::Remediate => {
                doc.replace_module_code(module, PLACEHOLDER_MODULE_CODE)?;
                info!("remediated module {module}");
            }
            SanitizeOp::RemoveModule => {
                doc.remove_module(module)?;
                info!("removed module {module}");
            }
        }
        Ok(())
    }

    /// Save and close the open document. Calling this with nothing open is a
    /// caller bug and is logged, but not an error.
    pub fn save_and_close(&mut self) -> Result<(), WorkerError> {
        let Some(doc) = self.document.take() else {
            warn!("save_and_close called with no open document");
            return Ok(());
        };
        let path = self.document_path.take();
        doc.save_and_close()?;
        if let Some(path) = path {
            info!("saved and closed {}", path.display());
        }
        Ok(())
    }

    /// Archive, open, sanitize, save and rename one document.
    ///
    /// Archival and renaming are best-effort. The document is always closed
    /// once it was opened.
    pub fn process(&mut self, job: &SanitizeJob) -> Result<(), WorkerError> {
        let op = SanitizeOp::parse(&job.operation)?;
        match backup::archive(&job.path) {
            Ok(bak) => info!("archived {} to {}", job.path.display(), bak.display()),
            Err(e) => error!("archive of {} failed: {e}", job.path.display()),
        }

        self.open(&job.path)?;
        let sanitized = self.sanitize(&job.module, op);
        let closed = self.save_and_close();
        sanitized?;
        closed?;

        match backup::mark_sanitized(&job.path) {
            Ok(renamed) => info!("renamed to {}", renamed.display()),
            Err(e) => error!("rename of {} failed: {e}", job.path.display()),
        }
        Ok(())
    }

    pub fn quit(mut self) {
        if self.document.is_some() {
            let _ = self.save_and_close();
        }
        self.app.quit();
        info!("editor worker quit");
    }
}
