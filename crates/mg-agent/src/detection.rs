use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::catalog::HardenMeasure;
use crate::error::EngineError;

/// A single rule match against one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub rule_id: String,
    pub path: String,
}

impl Detection {
    pub fn new(rule_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            path: path.into(),
        }
    }
}

/// Filesystem hardening work produced alongside a sanitize request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardenRequest {
    pub detection_name: String,
    pub allow_repeated: bool,
    pub measures: Vec<HardenMeasure>,
}

/// Turns candidate paths into detections.
///
/// Implementations close `out` by dropping it when they return. A failure on
/// one file is logged and skipped; only an engine that cannot run at all
/// returns an error.
#[async_trait]
pub trait DetectionEngine: Send + Sync {
    /// Whether this engine consumes the candidate list. Engines that replay a
    /// precomputed result skip the disk search entirely.
    fn needs_candidates(&self) -> bool {
        true
    }

    async fn scan(
        &self,
        paths: Vec<PathBuf>,
        out: mpsc::Sender<Detection>,
    ) -> Result<usize, EngineError>;
}

/// Parse one `RULE_ID PATH` line as printed by common signature scanners.
///
/// The path may itself contain spaces; only the first one separates it from
/// the rule id.
pub fn parse_result_line(line: &str) -> Option<Detection> {
    let idx = line.find(' ')?;
    if idx == 0 || idx + 3 >= line.len() {
        return None;
    }
    Some(Detection::new(&line[..idx], &line[idx + 1..]))
}

const UTF8_BOM: &[u8] = b"\xef\xbb\xbf";

/// Replays detections from a result list produced by an earlier scan.
#[derive(Debug, Clone)]
pub struct ResultListEngine {
    path: PathBuf,
}

impl ResultListEngine {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DetectionEngine for ResultListEngine {
    fn needs_candidates(&self) -> bool {
        false
    }

    async fn scan(
        &self,
        _paths: Vec<PathBuf>,
        out: mpsc::Sender<Detection>,
    ) -> Result<usize, EngineError> {
        let file = tokio::fs::File::open(&self.path).await.map_err(|e| {
            EngineError::NoRules(format!("result list {}: {e}", self.path.display()))
        })?;
        let mut lines = BufReader::new(file).split(b'\n');
        let mut count = 0usize;
        let mut first = true;
        while let Some(segment) = lines.next_segment().await? {
            let raw = if std::mem::take(&mut first) {
                segment.strip_prefix(UTF8_BOM).unwrap_or(&segment[..])
            } else {
                &segment[..]
            };
            let line = match std::str::from_utf8(raw) {
                Ok(line) => line.trim_end_matches('\r'),
                Err(_) => {
                    error!(
                        "ignored result line that is not valid UTF-8: {:?}",
                        String::from_utf8_lossy(raw)
                    );
                    continue;
                }
            };
            match parse_result_line(line) {
                Some(det) => {
                    if out.send(det).await.is_err() {
                        break;
                    }
                    count += 1;
                }
                None => error!("ignored result line without a valid detection: {line:?}"),
            }
        }
        info!("result list yielded {count} detections");
        Ok(count)
    }
}
