//! Privilege-separated sanitize path.
//!
//! The agent side ([`frontend`], [`client`], [`launcher`]) relays sanitize
//! requests to a helper process. The helper ([`server`]) serializes them onto
//! one editor worker guarded by a deadline ([`supervisor`], [`worker`]).

pub mod backup;
pub mod client;
pub mod editor;
pub mod frontend;
pub mod launcher;
pub mod lockfile;
pub mod server;
pub mod supervisor;
pub mod testing;
pub mod transport;
pub mod worker;

pub use client::{ClientConfig, ClientError, RpcClient};
pub use editor::{EditorApp, EditorError, EditorLauncher, UnavailableLauncher, Workbook};
pub use frontend::{FrontEndConfig, SanitizerFrontEnd};
pub use launcher::{
    DirectLauncher, ImpersonatingLauncher, LaunchError, ServerLauncher, ServerProcess,
    SessionInfo, SessionState, choose_launcher, select_interactive_session,
};
pub use lockfile::{LockError, LockGuard};
pub use server::{PrivServer, ServerConfig, ServerError};
pub use supervisor::WorkerSupervisor;
pub use transport::{Listener, default_endpoint};
pub use worker::{EditorWorker, SanitizeJob, WorkerError};
