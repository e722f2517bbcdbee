use std::time::Duration;

/// Extensions that make a file a candidate for scanning.
pub const DEFAULT_EXTENSIONS: &[&str] = &[".xls", ".xlsx", ".xlsm", ".xlsb"];

/// Files under an Excel start-up folder always qualify, whatever their extension.
pub const XLSTART_MARKER: &str = "AppData/Roaming/Microsoft/Excel/XLSTART";

pub const DEBUG_ENV: &str = "MACROGUARD_DEBUG";

/// Agent tunables.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub queue_depth: usize,
    pub control_timeout: Duration,
    pub sanitize_timeout: Duration,
    pub server_exit_grace: Duration,
    pub connect_attempts: u32,
    pub connect_timeout: Duration,
    pub exit_grace_delay: Duration,
    pub extensions: Vec<String>,
    pub debug: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            queue_depth: 100,
            control_timeout: Duration::from_secs(5),
            sanitize_timeout: Duration::from_secs(5 * 60),
            server_exit_grace: Duration::from_secs(300),
            connect_attempts: 3,
            connect_timeout: Duration::from_secs(5),
            exit_grace_delay: Duration::from_secs(5),
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            debug: false,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self {
            debug: debug_from_env(),
            ..Self::default()
        }
    }
}

/// `MACROGUARD_DEBUG=1` (or `true`) turns on debug mode.
pub fn debug_from_env() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim(), "1" | "true" | "TRUE" | "yes")
}
