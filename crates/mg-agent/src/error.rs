use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decrypt catalog: {0}")]
    Seal(#[from] SealError),
    #[error("failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate solution name '{0}'")]
    DuplicateName(String),
    #[error("solution #{0} has an empty name")]
    EmptyName(usize),
    #[error("solution '{name}' has a harden measure with an empty destination")]
    EmptyDestination { name: String },
}

#[derive(Debug, Error)]
pub enum SealError {
    #[error("key must be 32 bytes, got {0}")]
    KeyLength(usize),
    #[error("invalid hex key: {0}")]
    KeyHex(#[from] hex::FromHexError),
    #[error("sealed blob is truncated")]
    Truncated,
    #[error("decryption failed, integrity check failed")]
    DecryptionFailed,
    #[error("failed to generate nonce")]
    Nonce,
}

/// Errors from a candidate source.
///
/// `Fallback` and `UnsupportedPlatform` are recovered by switching to the
/// generic walk; `InvalidInput` is fatal.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("accelerated search unavailable: {0}")]
    Fallback(String),
    #[error("unsupported platform")]
    UnsupportedPlatform,
    #[error("invalid search root: {0}")]
    InvalidInput(String),
    #[error("search failed: {0}")]
    Io(#[from] std::io::Error),
}

impl SearchError {
    pub fn triggers_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_) | Self::UnsupportedPlatform)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no rules loaded: {0}")]
    NoRules(String),
    #[error("scan of {path} failed: {reason}")]
    File { path: PathBuf, reason: String },
    #[error("detection engine i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum HardenError {
    #[error("unsupported platform")]
    UnsupportedPlatform,
    #[error("cannot resolve home directory: {0}")]
    Home(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("sanitizer failed: {0}")]
    Sanitizer(String),
}

impl PipelineError {
    /// Configuration problems are reported before any work starts.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Search(SearchError::InvalidInput(_))
        )
    }
}
