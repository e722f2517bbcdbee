//! In-memory editor used by tests and by `--fake-editor` smoke runs.

use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::editor::{EditorApp, EditorError, EditorLauncher, Workbook};

#[derive(Debug, Default)]
struct State {
    modules: Vec<(String, String)>,
    launches: usize,
    kills: usize,
    opens: usize,
    saves: usize,
    open_now: usize,
    max_open: usize,
    hang_opens: usize,
    hang_launches: usize,
    open_delay: Duration,
}

/// Shared, inspectable state behind the fake editor.
#[derive(Clone, Default)]
pub struct FakeEditor {
    inner: Arc<(Mutex<State>, Condvar)>,
}

impl FakeEditor {
    /// Every opened document carries these macro modules.
    pub fn with_modules(self, names: &[&str]) -> Self {
        self.state().modules = names
            .iter()
            .map(|n| (n.to_string(), format!("Sub {n}()\nEnd Sub\n")))
            .collect();
        self
    }

    /// The next `n` opens block until `kill_all` is called.
    pub fn hang_next_opens(&self, n: usize) {
        self.state().hang_opens = n;
    }

    /// The next `n` launches block until `kill_all` is called, then fail.
    pub fn hang_next_launches(&self, n: usize) {
        self.state().hang_launches = n;
    }

    pub fn with_open_delay(self, delay: Duration) -> Self {
        self.state().open_delay = delay;
        self
    }

    pub fn app(&self) -> FakeApp {
        FakeApp {
            editor: self.clone(),
        }
    }

    pub fn modules(&self) -> Vec<String> {
        self.state().modules.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn code_of(&self, module: &str) -> Option<String> {
        self.state()
            .modules
            .iter()
            .find(|(n, _)| n == module)
            .map(|(_, c)| c.clone())
    }

    pub fn launches(&self) -> usize {
        self.state().launches
    }

    pub fn kills(&self) -> usize {
        self.state().kills
    }

    pub fn opens(&self) -> usize {
        self.state().opens
    }

    pub fn saves(&self) -> usize {
        self.state().saves
    }

    /// Highest number of simultaneously open documents ever observed.
    pub fn max_open(&self) -> usize {
        self.state().max_open
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.inner.0.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Block until the kill counter moves past what `st` saw.
    fn wait_for_kill<'a>(&'a self, mut st: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        let kills = st.kills;
        while st.kills == kills {
            st = match self.inner.1.wait(st) {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
        }
        st
    }
}

pub struct FakeLauncher {
    editor: FakeEditor,
}

impl FakeLauncher {
    pub fn new(editor: FakeEditor) -> Self {
        Self { editor }
    }
}

impl EditorLauncher for FakeLauncher {
    fn launch(&self, _debug: bool) -> Result<Box<dyn EditorApp>, EditorError> {
        let mut st = self.editor.state();
        if st.hang_launches > 0 {
            st.hang_launches -= 1;
            drop(self.editor.wait_for_kill(st));
            return Err(EditorError::Unavailable("editor was terminated".into()));
        }
        st.launches += 1;
        drop(st);
        Ok(Box::new(self.editor.app()))
    }

    fn kill_all(&self) {
        let mut st = self.editor.state();
        st.kills += 1;
        self.editor.inner.1.notify_all();
    }
}

pub struct FakeApp {
    editor: FakeEditor,
}

impl EditorApp for FakeApp {
    fn fetch_workbooks(&mut self) -> Result<(), EditorError> {
        Ok(())
    }

    fn open(&mut self, path: &Path) -> Result<Box<dyn Workbook>, EditorError> {
        let mut st = self.editor.state();
        if st.hang_opens > 0 {
            st.hang_opens -= 1;
            drop(self.editor.wait_for_kill(st));
            return Err(EditorError::Open {
                path: path.display().to_string(),
                reason: "editor was terminated".into(),
            });
        }
        let delay = st.open_delay;
        st.opens += 1;
        st.open_now += 1;
        st.max_open = st.max_open.max(st.open_now);
        drop(st);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        Ok(Box::new(FakeWorkbook {
            editor: self.editor.clone(),
            closed: false,
        }))
    }

    fn quit(&mut self) {}
}

struct FakeWorkbook {
    editor: FakeEditor,
    closed: bool,
}

impl Workbook for FakeWorkbook {
    fn has_macro_project(&self) -> Result<bool, EditorError> {
        Ok(!self.editor.state().modules.is_empty())
    }

    fn module_names(&self) -> Result<Vec<String>, EditorError> {
        Ok(self.editor.modules())
    }

    fn replace_module_code(&mut self, module: &str, code: &str) -> Result<(), EditorError> {
        let mut st = self.editor.state();
        let entry = st
            .modules
            .iter_mut()
            .find(|(n, _)| n == module)
            .ok_or_else(|| EditorError::Call(format!("no module {module}")))?;
        entry.1 = code.to_string();
        Ok(())
    }

    fn remove_module(&mut self, module: &str) -> Result<(), EditorError> {
        self.editor.state().modules.retain(|(n, _)| n != module);
        Ok(())
    }

    fn save_and_close(mut self: Box<Self>) -> Result<(), EditorError> {
        self.closed = true;
        let mut st = self.editor.state();
        st.saves += 1;
        st.open_now -= 1;
        Ok(())
    }
}

impl Drop for FakeWorkbook {
    fn drop(&mut self) {
        if !self.closed {
            self.editor.state().open_now -= 1;
        }
    }
}
