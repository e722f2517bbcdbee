//! Detection engine backed by an external signature scanner process.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::detection::{Detection, DetectionEngine, parse_result_line};
use crate::error::EngineError;
use crate::seal::BlobDecryptor;

pub const RULES_PLACEHOLDER: &str = "{rules}";
pub const PATH_PLACEHOLDER: &str = "{path}";

/// Default argument template, `<scanner> scan --compiled-rules <rules> <file>`.
pub fn default_args() -> Vec<String> {
    ["scan", "--compiled-rules", RULES_PLACEHOLDER, PATH_PLACEHOLDER]
        .into_iter()
        .map(String::from)
        .collect()
}

pub struct ExternalScannerEngine {
    program: PathBuf,
    args: Vec<String>,
    // Held for the engine's lifetime; the file is removed on drop.
    rules: NamedTempFile,
}

impl ExternalScannerEngine {
    /// Decrypt the sealed rule set into a private temporary file.
    pub fn prepare(
        program: impl Into<PathBuf>,
        args: Vec<String>,
        sealed_rules: &Path,
        decryptor: &dyn BlobDecryptor,
    ) -> Result<Self, EngineError> {
        let blob = std::fs::read(sealed_rules).map_err(|e| {
            EngineError::NoRules(format!("read {}: {e}", sealed_rules.display()))
        })?;
        let plain = decryptor
            .decrypt(&blob)
            .map_err(|e| EngineError::NoRules(format!("decrypt rules: {e}")))?;
        let mut rules = NamedTempFile::new()?;
        rules.write_all(&plain)?;
        rules.flush()?;
        debug!("rules decrypted to {}", rules.path().display());
        Ok(Self {
            program: program.into(),
            args,
            rules,
        })
    }

    fn argv_for(&self, file: &Path) -> Vec<String> {
        let rules = self.rules.path().to_string_lossy();
        let file = file.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace(RULES_PLACEHOLDER, &rules).replace(PATH_PLACEHOLDER, &file))
            .collect()
    }
}

#[async_trait]
impl DetectionEngine for ExternalScannerEngine {
    async fn scan(
        &self,
        paths: Vec<PathBuf>,
        out: mpsc::Sender<Detection>,
    ) -> Result<usize, EngineError> {
        let mut count = 0usize;
        for path in paths {
            let output = match Command::new(&self.program)
                .args(self.argv_for(&path))
                .kill_on_drop(true)
                .output()
                .await
            {
                Ok(output) => output,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(EngineError::NoRules(format!(
                        "scanner {} not found",
                        self.program.display()
                    )));
                }
                Err(e) => {
                    warn!("{}", EngineError::File { path, reason: e.to_string() });
                    continue;
                }
            };
            if !output.status.success() {
                let reason = String::from_utf8_lossy(&output.stderr).trim().to_string();
                warn!("{}", EngineError::File { path, reason });
                continue;
            }
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                let Some(det) = parse_result_line(line.trim_end()) else {
                    continue;
                };
                if out.send(det).await.is_err() {
                    return Ok(count);
                }
                count += 1;
            }
        }
        info!("scanner reported {count} detections");
        Ok(count)
    }
}
