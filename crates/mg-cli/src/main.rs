use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{ArgAction, Parser};
use mg_agent::search::validate_root;
use mg_agent::{
    AgentConfig, Capabilities, DetectionEngine, Dispatcher, ExternalScannerEngine, Hardener,
    HostCapabilities, PipelineError, ProfileHomeResolver, RemediationCatalog, ResultListEngine,
    RunSummary, XChaChaDecryptor, scanner,
};
use mg_cli::{EXIT_RUNTIME, agent_exit_code, beside_exe, init_logging, shutdown_signal};
use mg_sanitizer::{FrontEndConfig, SanitizerFrontEnd, choose_launcher, default_endpoint};
use tracing::{error, info};

#[cfg(windows)]
const DEFAULT_ACTION_PATH: &str = r"C:\Users";
#[cfg(not(windows))]
const DEFAULT_ACTION_PATH: &str = "/home";

#[cfg(windows)]
const HELPER_EXE: &str = "macroguard-privhelper.exe";
#[cfg(not(windows))]
const HELPER_EXE: &str = "macroguard-privhelper";

#[derive(Parser, Debug)]
#[command(
    name = "macroguard",
    version,
    about = "Find macro-infected spreadsheets, sanitize them and harden the host"
)]
struct Cli {
    /// Directory tree to search
    #[arg(long, env = "MACROGUARD_ACTION_PATH", default_value = DEFAULT_ACTION_PATH)]
    action_path: PathBuf,

    /// Log every action without touching files or documents
    #[arg(long, env = "MACROGUARD_DRY_RUN")]
    dry_run: bool,

    /// Apply the catalog's filesystem hardening measures
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    enable_hardening: bool,

    /// Read detections from --result-list instead of scanning the disk
    #[arg(long)]
    no_disk_scan: bool,

    /// Scanner output to replay with --no-disk-scan
    #[arg(long, default_value = "ipt_yrscan.lst")]
    result_list: PathBuf,

    /// Always use the directory walk, even when elevated
    #[arg(long)]
    no_priv: bool,

    /// Sealed remediation catalog [default: cramc_db.bin next to the executable]
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Sealed scanner rules [default: unified.yar.bin next to the executable]
    #[arg(long)]
    rules: Option<PathBuf>,

    /// External signature scanner program
    #[arg(long, default_value = "yr")]
    scanner: PathBuf,

    /// Hex key that opens the sealed catalog and rules
    #[arg(long, env = "MACROGUARD_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Privileged helper binary [default: next to the executable]
    #[arg(long)]
    privhelper: Option<PathBuf>,

    /// Helper endpoint (socket path, or pipe name on Windows)
    #[arg(long, env = "MACROGUARD_ENDPOINT")]
    endpoint: Option<String>,

    /// Log file, truncated on every run
    #[arg(long, default_value = "macroguard.log")]
    log_file: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = AgentConfig::from_env();
    if let Err(e) = init_logging(&cli.log_file, config.debug) {
        eprintln!("error: {e:#}");
        return ExitCode::from(EXIT_RUNTIME);
    }

    let outcome = tokio::select! {
        res = run(cli, config) => res,
        _ = shutdown_signal() => Err(anyhow!("interrupted")),
    };
    match outcome {
        Ok(summary) => {
            info!(
                candidates = summary.candidates,
                survivors = summary.survivors,
                detections = summary.detections,
                sanitize_requests = summary.sanitize_requests,
                harden_requests = summary.harden_requests,
                unmatched = summary.unmatched,
                "done"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(agent_exit_code(&e))
        }
    }
}

async fn run(cli: Cli, config: AgentConfig) -> Result<RunSummary> {
    info!(
        dry_run = cli.dry_run,
        hardening = cli.enable_hardening,
        "macroguard {} starting",
        env!("CARGO_PKG_VERSION")
    );
    validate_root(&cli.action_path)
        .map_err(PipelineError::Search)
        .context("--action-path")?;

    let key = cli.key.as_deref().ok_or_else(|| {
        PipelineError::Config("no catalog key, pass --key or set MACROGUARD_KEY".into())
    })?;
    let decryptor = XChaChaDecryptor::from_hex(key).context("--key")?;

    let catalog_path = cli.catalog.unwrap_or_else(|| beside_exe("cramc_db.bin"));
    let catalog = RemediationCatalog::load_sealed(&catalog_path, &decryptor)
        .with_context(|| format!("load catalog {}", catalog_path.display()))?;
    info!(
        version = catalog.version,
        solutions = catalog.len(),
        "catalog loaded"
    );

    let engine: Arc<dyn DetectionEngine> = if cli.no_disk_scan {
        if !cli.result_list.is_file() {
            return Err(PipelineError::Config(format!(
                "result list {} not found",
                cli.result_list.display()
            ))
            .into());
        }
        info!("replaying detections from {}", cli.result_list.display());
        Arc::new(ResultListEngine::new(&cli.result_list))
    } else {
        let rules = cli.rules.unwrap_or_else(|| beside_exe("unified.yar.bin"));
        Arc::new(ExternalScannerEngine::prepare(
            &cli.scanner,
            scanner::default_args(),
            &rules,
            &decryptor,
        )?)
    };

    let caps = Arc::new(HostCapabilities);
    let snapshot = caps.current();
    info!(
        elevated = snapshot.elevated,
        system = snapshot.running_as_system,
        "capabilities probed"
    );

    let home = Arc::new(ProfileHomeResolver::from_capabilities(&snapshot));
    let hardener = Arc::new(Hardener::new(cli.dry_run, home));
    let dispatcher = Dispatcher::new(Arc::new(catalog), cli.enable_hardening);

    let endpoint = cli.endpoint.unwrap_or_else(default_endpoint);
    let helper = cli.privhelper.unwrap_or_else(|| beside_exe(HELPER_EXE));
    let launcher = choose_launcher(&snapshot, helper, Vec::new());
    let frontend = SanitizerFrontEnd::new(
        FrontEndConfig::from_agent(&config, endpoint, cli.dry_run),
        launcher,
    );

    let summary = mg_agent::Pipeline::new(
        config,
        &cli.action_path,
        caps,
        engine,
        dispatcher,
        hardener,
    )
    .force_generic(cli.no_priv)
    .run(Box::new(frontend))
    .await?;
    Ok(summary)
}
