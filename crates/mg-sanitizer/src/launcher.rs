//! Starting the privileged helper process.
//!
//! A regular user (or an elevated admin) spawns the helper directly. When the
//! agent runs under the system account, the helper has to run inside the
//! interactive user's session instead, otherwise the editor's automation
//! surface is not reachable. That path needs an interactive session and the
//! right to duplicate its token.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use mg_agent::CapabilitySnapshot;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Session ids at or above this value are reserved by the OS.
pub const MAX_SESSION_ID: u32 = 65530;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("no interactive user session to run the helper in")]
    NoInteractiveSession,
    #[error("session impersonation is not supported on this platform")]
    Unsupported,
}

/// A running helper process.
#[async_trait]
pub trait ServerProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Wait for exit and return the exit code when there is one.
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;

    async fn kill(&mut self) -> std::io::Result<()>;
}

pub trait ServerLauncher: Send + Sync {
    fn spawn(&self, endpoint: &str) -> Result<Box<dyn ServerProcess>, LaunchError>;
}

pub struct ChildProcess {
    child: Child,
}

#[async_trait]
impl ServerProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self.child.wait().await?.code())
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

/// Runs the helper binary as a child of the current process.
#[derive(Debug, Clone)]
pub struct DirectLauncher {
    program: PathBuf,
    extra_args: Vec<String>,
}

impl DirectLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
        }
    }

    /// Arguments appended after `--endpoint <endpoint>`.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl ServerLauncher for DirectLauncher {
    fn spawn(&self, endpoint: &str) -> Result<Box<dyn ServerProcess>, LaunchError> {
        let child = Command::new(&self.program)
            .arg("--endpoint")
            .arg(endpoint)
            .args(&self.extra_args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;
        info!(
            pid = child.id(),
            "started helper {} on {endpoint}",
            self.program.display()
        );
        Ok(Box::new(ChildProcess { child }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Connected,
    Disconnected,
    Other,
}

/// One entry of the OS session table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: u32,
    /// Window station name, `Console` for the physical console.
    pub station: String,
    pub state: SessionState,
    pub user: String,
}

/// Pick the session the helper should run in.
///
/// Preference order: the active console session, any other active session,
/// then a disconnected session that still has a logged-on user. Session 0 and
/// reserved ids are skipped, and connected sessions without a logon are never
/// chosen.
pub fn select_interactive_session(sessions: &[SessionInfo]) -> Option<&SessionInfo> {
    let usable = || {
        sessions
            .iter()
            .filter(|s| s.id != 0 && s.id <= MAX_SESSION_ID)
    };
    usable()
        .find(|s| s.state == SessionState::Active && s.station.eq_ignore_ascii_case("console"))
        .or_else(|| usable().find(|s| s.state == SessionState::Active))
        .or_else(|| {
            usable().find(|s| s.state == SessionState::Disconnected && !s.user.is_empty())
        })
}

/// OS session table and token duplication.
pub trait SessionBroker: Send + Sync {
    fn sessions(&self) -> Vec<SessionInfo>;

    /// Start `program` with `args` under the user token of `session`.
    fn spawn_in_session(
        &self,
        session: &SessionInfo,
        program: &std::path::Path,
        args: &[String],
    ) -> Result<Box<dyn ServerProcess>, LaunchError>;
}

/// Broker for builds without token impersonation support.
#[derive(Debug, Default, Clone)]
pub struct UnsupportedBroker;

impl SessionBroker for UnsupportedBroker {
    fn sessions(&self) -> Vec<SessionInfo> {
        Vec::new()
    }

    fn spawn_in_session(
        &self,
        _session: &SessionInfo,
        _program: &std::path::Path,
        _args: &[String],
    ) -> Result<Box<dyn ServerProcess>, LaunchError> {
        Err(LaunchError::Unsupported)
    }
}

/// Runs the helper inside the interactive user's session.
pub struct ImpersonatingLauncher {
    program: PathBuf,
    extra_args: Vec<String>,
    broker: Arc<dyn SessionBroker>,
}

impl ImpersonatingLauncher {
    pub fn new(program: impl Into<PathBuf>, broker: Arc<dyn SessionBroker>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
            broker,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl ServerLauncher for ImpersonatingLauncher {
    fn spawn(&self, endpoint: &str) -> Result<Box<dyn ServerProcess>, LaunchError> {
        let sessions = self.broker.sessions();
        let session =
            select_interactive_session(&sessions).ok_or(LaunchError::NoInteractiveSession)?;
        info!(
            session = session.id,
            user = %session.user,
            "starting helper in interactive session"
        );
        let mut args = vec!["--endpoint".to_string(), endpoint.to_string()];
        args.extend(self.extra_args.iter().cloned());
        self.broker.spawn_in_session(session, &self.program, &args)
    }
}

/// Direct spawn unless running as the system account.
pub fn choose_launcher(
    caps: &CapabilitySnapshot,
    program: PathBuf,
    extra_args: Vec<String>,
) -> Arc<dyn ServerLauncher> {
    if caps.running_as_system {
        if !caps.can_impersonate {
            warn!("running as system without impersonation rights, helper launch will fail");
        }
        let broker = Arc::new(UnsupportedBroker);
        Arc::new(ImpersonatingLauncher::new(program, broker).with_args(extra_args))
    } else {
        Arc::new(DirectLauncher::new(program).with_args(extra_args))
    }
}
