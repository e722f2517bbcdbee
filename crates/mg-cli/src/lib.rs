//! Pieces shared by the `macroguard` and `macroguard-privhelper` binaries.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use mg_agent::{CatalogError, EngineError, PipelineError, SealError, SearchError};
use tracing::warn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

pub const EXIT_RUNTIME: u8 = 1;
pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_LOCKED: u8 = 3;

/// Log to stdout and to a file that is truncated on every run.
///
/// `RUST_LOG` wins when set; otherwise `debug` turns on debug level.
pub fn init_logging(log_file: &Path, debug: bool) -> Result<()> {
    let filter = if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::try_from_default_env().context("invalid RUST_LOG")?
    } else {
        EnvFilter::new(if debug { "debug" } else { "info" })
    };
    let file = File::create(log_file)
        .with_context(|| format!("create log file {}", log_file.display()))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stdout))
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .context("install log subscriber")?;
    Ok(())
}

/// Exit code for a failed agent run.
pub fn agent_exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        let config = if let Some(e) = cause.downcast_ref::<PipelineError>() {
            e.is_config()
        } else if let Some(e) = cause.downcast_ref::<EngineError>() {
            matches!(e, EngineError::NoRules(_))
        } else if let Some(e) = cause.downcast_ref::<SearchError>() {
            matches!(e, SearchError::InvalidInput(_))
        } else {
            cause.is::<CatalogError>() || cause.is::<SealError>()
        };
        if config {
            return EXIT_CONFIG;
        }
    }
    EXIT_RUNTIME
}

/// Path of a file shipped next to the running executable.
pub fn beside_exe(name: &str) -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_default()
        .join(name)
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl-C received, shutting down"),
        _ = term => tracing::info!("termination signal received, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn configuration_failures_map_to_exit_two() {
        let bad_root = anyhow::Error::new(PipelineError::Search(SearchError::InvalidInput(
            "/nope".into(),
        )));
        assert_eq!(agent_exit_code(&bad_root), EXIT_CONFIG);

        let bad_key = anyhow::Error::new(SealError::KeyLength(3)).context("load catalog");
        assert_eq!(agent_exit_code(&bad_key), EXIT_CONFIG);

        let no_rules = anyhow::Error::new(EngineError::NoRules("yr missing".into()));
        assert_eq!(agent_exit_code(&no_rules), EXIT_CONFIG);
    }

    #[test]
    fn everything_else_is_a_runtime_failure() {
        assert_eq!(agent_exit_code(&anyhow!("helper died")), EXIT_RUNTIME);
        let sink = anyhow::Error::new(PipelineError::Sanitizer("gone".into()));
        assert_eq!(agent_exit_code(&sink), EXIT_RUNTIME);
    }

    #[test]
    fn shipped_files_resolve_next_to_the_executable() {
        let p = beside_exe("cramc_db.bin");
        assert_eq!(p.file_name().unwrap(), "cramc_db.bin");
    }
}
