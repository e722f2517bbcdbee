use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mg_agent::config::debug_from_env;
use mg_agent::{Capabilities, HostCapabilities};
use mg_cli::{EXIT_LOCKED, EXIT_RUNTIME, init_logging, shutdown_signal};
use mg_sanitizer::server::{self, ServerConfig, ServerError};
use mg_sanitizer::testing::{FakeEditor, FakeLauncher};
use mg_sanitizer::{EditorLauncher, LockError, UnavailableLauncher, default_endpoint};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "macroguard-privhelper",
    version,
    about = "Sanitize documents on behalf of the macroguard agent",
    after_help = "This build ships without a spreadsheet automation bridge: \
                  outside --dry-run the helper cannot open documents and exits at startup."
)]
struct Cli {
    /// Endpoint to listen on (socket path, or pipe name on Windows)
    #[arg(long, env = "MACROGUARD_ENDPOINT")]
    endpoint: Option<String>,

    /// Lock file guarding against a second helper
    #[arg(long, default_value = "privhelper.lock")]
    lock_file: PathBuf,

    /// Acknowledge requests without opening any document
    #[arg(long)]
    dry_run: bool,

    /// Per-document deadline before the editor is recreated
    #[arg(long, default_value_t = 180)]
    doc_timeout_secs: u64,

    /// How long queued work may take to finish after quit
    #[arg(long, default_value_t = 210)]
    drain_timeout_secs: u64,

    /// Log file, truncated on every run
    #[arg(long, default_value = "macroguard_privhelper.log")]
    log_file: PathBuf,

    /// Use an in-memory editor (smoke tests)
    #[arg(long, hide = true)]
    fake_editor: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let debug = debug_from_env();
    if let Err(e) = init_logging(&cli.log_file, debug) {
        eprintln!("error: {e:#}");
        return ExitCode::from(EXIT_RUNTIME);
    }

    if HostCapabilities.current().running_as_system {
        error!("{}", ServerError::RunningAsSystem);
        return ExitCode::from(EXIT_RUNTIME);
    }

    let launcher: Arc<dyn EditorLauncher> = if cli.fake_editor {
        warn!("using the in-memory editor, documents are not touched");
        Arc::new(FakeLauncher::new(
            FakeEditor::default().with_modules(&["Module1"]),
        ))
    } else {
        if !cli.dry_run {
            warn!("this build has no spreadsheet automation bridge, only --dry-run can serve");
        }
        Arc::new(UnavailableLauncher)
    };

    let config = ServerConfig {
        endpoint: cli.endpoint.unwrap_or_else(default_endpoint),
        lock_file: cli.lock_file,
        doc_timeout: Duration::from_secs(cli.doc_timeout_secs),
        drain_timeout: Duration::from_secs(cli.drain_timeout_secs),
        debug,
        dry_run: cli.dry_run,
    };
    info!(
        endpoint = %config.endpoint,
        dry_run = config.dry_run,
        "macroguard-privhelper {} starting",
        env!("CARGO_PKG_VERSION")
    );

    match server::run(config, launcher, shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ ServerError::Lock(LockError::Held(_))) => {
            error!("{e}");
            ExitCode::from(EXIT_LOCKED)
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}
