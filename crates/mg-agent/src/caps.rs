use std::path::{Path, PathBuf};

/// What the current process is allowed to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    pub elevated: bool,
    /// Running under the system service account rather than a user.
    pub running_as_system: bool,
    /// User of the interactive session the helper would run in, if any.
    pub session_user: Option<String>,
    pub session_profile: Option<PathBuf>,
    pub can_impersonate: bool,
}

/// OS privilege and filesystem queries, kept behind a trait so orchestration
/// can be driven by fakes.
pub trait Capabilities: Send + Sync {
    fn current(&self) -> CapabilitySnapshot;

    /// Whether the accelerated volume reader can handle the filesystem `root`
    /// lives on.
    fn supports_accelerated_search(&self, root: &Path) -> bool;
}

#[derive(Debug, Default, Clone)]
pub struct HostCapabilities;

impl Capabilities for HostCapabilities {
    fn current(&self) -> CapabilitySnapshot {
        CapabilitySnapshot {
            elevated: is_elevated(),
            ..CapabilitySnapshot::default()
        }
    }

    fn supports_accelerated_search(&self, root: &Path) -> bool {
        cfg!(windows) && root.is_absolute()
    }
}

#[cfg(unix)]
fn is_elevated() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_elevated() -> bool {
    false
}
