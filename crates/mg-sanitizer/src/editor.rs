//! Automation surface of the spreadsheet editor.
//!
//! Every call here is blocking and may hang indefinitely; callers run them on
//! a blocking thread under a deadline (see [`crate::supervisor`]).

use std::path::Path;

use thiserror::Error;

/// Code left in a remediated module so the editor keeps the module around.
pub const PLACEHOLDER_MODULE_CODE: &str = "' Sanitized by MacroGuard
Private Sub MacroGuardPlaceholder()
    ' Keeps the comment above in place
End Sub
";

#[derive(Debug, Error)]
pub enum EditorError {
    #[error("editor unavailable: {0}")]
    Unavailable(String),
    #[error("failed to open {path}: {reason}")]
    Open { path: String, reason: String },
    #[error("editor call failed: {0}")]
    Call(String),
}

/// Starts editor instances and tears down stray ones.
pub trait EditorLauncher: Send + Sync {
    fn launch(&self, debug: bool) -> Result<Box<dyn EditorApp>, EditorError>;

    /// Forcefully terminate every editor process, including hung ones.
    fn kill_all(&self);
}

/// One live editor instance.
pub trait EditorApp: Send {
    /// Fetch the workbook collection; documents can only be opened after this.
    fn fetch_workbooks(&mut self) -> Result<(), EditorError>;

    fn open(&mut self, path: &Path) -> Result<Box<dyn Workbook>, EditorError>;

    fn quit(&mut self);
}

/// An open document.
pub trait Workbook: Send {
    fn has_macro_project(&self) -> Result<bool, EditorError>;

    fn module_names(&self) -> Result<Vec<String>, EditorError>;

    fn replace_module_code(&mut self, module: &str, code: &str) -> Result<(), EditorError>;

    fn remove_module(&mut self, module: &str) -> Result<(), EditorError>;

    fn save_and_close(self: Box<Self>) -> Result<(), EditorError>;
}

/// Launcher for builds without an editor automation bridge.
#[derive(Debug, Default, Clone)]
pub struct UnavailableLauncher;

impl EditorLauncher for UnavailableLauncher {
    fn launch(&self, _debug: bool) -> Result<Box<dyn EditorApp>, EditorError> {
        Err(EditorError::Unavailable(
            "no spreadsheet automation bridge in this build".into(),
        ))
    }

    fn kill_all(&self) {}
}
