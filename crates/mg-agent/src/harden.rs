//! Filesystem hardening against re-infection.
//!
//! Each detection class is hardened at most once per process unless its
//! solution allows repeats. Filesystem errors are logged per measure and
//! never abort the rest of the request.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::caps::CapabilitySnapshot;
use crate::catalog::HardenMeasure;
use crate::detection::HardenRequest;
use crate::error::HardenError;

pub const HOME_PLACEHOLDER: &str = "${HOME}";

/// Resolves the profile directory that `${HOME}` expands to.
pub trait HomeResolver: Send + Sync {
    fn home_dir(&self) -> Result<PathBuf, HardenError>;
}

/// Uses the interactive user's profile when running under the system
/// account, otherwise the caller's own.
#[derive(Debug, Clone)]
pub struct ProfileHomeResolver {
    running_as_system: bool,
    session_profile: Option<PathBuf>,
}

impl ProfileHomeResolver {
    pub fn from_capabilities(caps: &CapabilitySnapshot) -> Self {
        Self {
            running_as_system: caps.running_as_system,
            session_profile: caps.session_profile.clone(),
        }
    }
}

impl HomeResolver for ProfileHomeResolver {
    fn home_dir(&self) -> Result<PathBuf, HardenError> {
        if self.running_as_system {
            return self
                .session_profile
                .clone()
                .ok_or_else(|| HardenError::Home("no interactive user profile".into()));
        }
        ["HOME", "USERPROFILE"]
            .iter()
            .find_map(|var| std::env::var_os(var).filter(|v| !v.is_empty()))
            .map(PathBuf::from)
            .ok_or_else(|| HardenError::Home("HOME and USERPROFILE are unset".into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardenOutcome {
    DryRun,
    AlreadyHardened,
    Applied,
}

pub struct Hardener {
    dry_run: bool,
    platform_supported: bool,
    home: Arc<dyn HomeResolver>,
    hardened: Mutex<HashSet<String>>,
}

impl Hardener {
    pub fn new(dry_run: bool, home: Arc<dyn HomeResolver>) -> Self {
        Self {
            dry_run,
            platform_supported: cfg!(windows),
            home,
            hardened: Mutex::new(HashSet::new()),
        }
    }

    /// Override platform detection. The measures themselves are portable.
    pub fn with_platform_support(mut self, supported: bool) -> Self {
        self.platform_supported = supported;
        self
    }

    pub fn apply(&self, req: &HardenRequest) -> Result<HardenOutcome, HardenError> {
        if self.dry_run {
            info!(
                "dry run, not hardening {} ({} measures)",
                req.detection_name,
                req.measures.len()
            );
            return Ok(HardenOutcome::DryRun);
        }
        if !self.platform_supported {
            return Err(HardenError::UnsupportedPlatform);
        }
        if !self.mark(&req.detection_name, req.allow_repeated) {
            info!(
                "{} already hardened and repeats are not allowed",
                req.detection_name
            );
            return Ok(HardenOutcome::AlreadyHardened);
        }

        for measure in &req.measures {
            let target = match self.resolve(&measure.destination) {
                Ok(target) => target,
                Err(e) => {
                    error!("cannot resolve {}: {e}", measure.destination);
                    continue;
                }
            };
            apply_measure(measure, &target);
        }
        Ok(HardenOutcome::Applied)
    }

    /// Consume harden requests until the dispatcher closes the queue.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<HardenRequest>) -> usize {
        let mut applied = 0usize;
        while let Some(req) = rx.recv().await {
            let this = self.clone();
            let name = req.detection_name.clone();
            match tokio::task::spawn_blocking(move || this.apply(&req)).await {
                Ok(Ok(HardenOutcome::Applied)) => applied += 1,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("hardening {name} failed: {e}"),
                Err(e) => error!("hardening task for {name} panicked: {e}"),
            }
        }
        applied
    }

    /// Returns whether the caller should go ahead with the measures.
    fn mark(&self, name: &str, allow_repeated: bool) -> bool {
        let mut set = match self.hardened.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        if set.contains(name) && !allow_repeated {
            return false;
        }
        set.insert(name.to_string());
        true
    }

    fn resolve(&self, template: &str) -> Result<PathBuf, HardenError> {
        if !template.contains(HOME_PLACEHOLDER) {
            return Ok(PathBuf::from(template));
        }
        let home = self.home.home_dir()?;
        Ok(PathBuf::from(
            template.replace(HOME_PLACEHOLDER, &home.to_string_lossy()),
        ))
    }
}

fn apply_measure(measure: &HardenMeasure, target: &Path) {
    let kind = measure.target_type.as_str();
    match (measure.action.as_str(), kind) {
        ("setRO", _) => set_readonly(kind, target),
        ("clean_setRO", "file") => {
            log_step("truncate", target, std::fs::File::create(target).map(drop));
            set_readonly(kind, target);
        }
        ("clean_setRO", "dir") => {
            log_step("remove dir", target, std::fs::remove_dir_all(target));
            log_step("recreate dir", target, std::fs::create_dir_all(target));
            set_readonly(kind, target);
        }
        ("replaceFile_setRO", "dir") => {
            log_step("remove dir", target, std::fs::remove_dir_all(target));
            log_step("create file", target, std::fs::File::create(target).map(drop));
            set_readonly("file", target);
        }
        ("rm_replaceDir_setRO", "file") => {
            log_step("remove file", target, std::fs::remove_file(target));
            log_step("create dir", target, std::fs::create_dir_all(target));
            set_readonly("dir", target);
        }
        (action @ ("clean_setRO" | "replaceFile_setRO" | "rm_replaceDir_setRO"), _) => {
            warn!("{action} does not apply to target type {kind:?}, skipped");
        }
        (action, _) => warn!("unsupported hardening action {action:?}, skipped"),
    }
}

fn set_readonly(kind: &str, target: &Path) {
    match kind {
        "file" => log_step("set read-only", target, mark_readonly(target)),
        "dir" => {
            if !target.is_dir() {
                warn!("{} is not a directory, skipped", target.display());
                return;
            }
            for entry in WalkDir::new(target).contents_first(true) {
                match entry {
                    Ok(entry) => {
                        if let Err(e) = mark_readonly(entry.path()) {
                            error!("set read-only {}: {e}", entry.path().display());
                        }
                    }
                    Err(e) => error!("walk {}: {e}", target.display()),
                }
            }
            info!("set read-only recursively on {}", target.display());
        }
        other => warn!("unsupported target type {other:?} for {}", target.display()),
    }
}

fn mark_readonly(path: &Path) -> std::io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    std::fs::set_permissions(path, perms)
}

fn log_step(step: &str, target: &Path, res: std::io::Result<()>) {
    match res {
        Ok(()) => info!("{step}: {}", target.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{step}: {} not present", target.display())
        }
        Err(e) => error!("{step}: {}: {e}", target.display()),
    }
}
