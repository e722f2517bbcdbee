//! Search, scan, dispatch, then sanitize and harden concurrently.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use mg_protocol::SanitizeRequest;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::caps::Capabilities;
use crate::config::AgentConfig;
use crate::detection::DetectionEngine;
use crate::dispatch::{DispatchStats, Dispatcher};
use crate::error::{PipelineError, SearchError};
use crate::filter::filter_existing;
use crate::harden::Hardener;
use crate::search::{
    CandidateSource, SearchStrategy, VolumeRecordSource, WalkDirSource, choose_strategy,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SanitizeReport {
    pub sanitized: usize,
    pub failed: usize,
}

/// Consumer of sanitize requests.
///
/// The sink owns its side of the queue and is expected to release whatever
/// it started (helper processes, connections) before returning.
#[async_trait]
pub trait SanitizeSink: Send {
    async fn run(
        self: Box<Self>,
        requests: mpsc::Receiver<SanitizeRequest>,
    ) -> Result<SanitizeReport, PipelineError>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub strategy: Option<SearchStrategy>,
    pub candidates: usize,
    pub survivors: usize,
    pub detections: usize,
    pub sanitize_requests: usize,
    pub harden_requests: usize,
    pub unmatched: usize,
    pub sanitized: usize,
    pub sanitize_failed: usize,
    pub hardened: usize,
}

pub struct Pipeline {
    config: AgentConfig,
    root: PathBuf,
    force_generic: bool,
    caps: Arc<dyn Capabilities>,
    accelerated: Arc<dyn CandidateSource>,
    generic: Arc<dyn CandidateSource>,
    engine: Arc<dyn DetectionEngine>,
    dispatcher: Dispatcher,
    hardener: Arc<Hardener>,
}

impl Pipeline {
    pub fn new(
        config: AgentConfig,
        root: impl Into<PathBuf>,
        caps: Arc<dyn Capabilities>,
        engine: Arc<dyn DetectionEngine>,
        dispatcher: Dispatcher,
        hardener: Arc<Hardener>,
    ) -> Self {
        Self {
            config,
            root: root.into(),
            force_generic: false,
            caps,
            accelerated: Arc::new(VolumeRecordSource),
            generic: Arc::new(WalkDirSource),
            engine,
            dispatcher,
            hardener,
        }
    }

    pub fn force_generic(mut self, force: bool) -> Self {
        self.force_generic = force;
        self
    }

    pub fn with_sources(
        mut self,
        accelerated: Arc<dyn CandidateSource>,
        generic: Arc<dyn CandidateSource>,
    ) -> Self {
        self.accelerated = accelerated;
        self.generic = generic;
        self
    }

    pub async fn run(self, sink: Box<dyn SanitizeSink>) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::default();

        let survivors = if self.engine.needs_candidates() {
            let (strategy, candidates, survivors) = self.collect_candidates().await?;
            summary.strategy = Some(strategy);
            summary.candidates = candidates;
            summary.survivors = survivors.len();
            info!(
                "{candidates} candidates, {} present on local disk",
                survivors.len()
            );
            survivors
        } else {
            Vec::new()
        };

        let depth = self.config.queue_depth.max(1);
        let (det_tx, det_rx) = mpsc::channel(depth);
        let (san_tx, san_rx) = mpsc::channel(depth);
        let (hard_tx, hard_rx) = mpsc::channel(depth);

        let (scanned, dispatched, sanitized, hardened) = tokio::join!(
            self.engine.scan(survivors, det_tx),
            self.dispatcher.clone().run(det_rx, san_tx, hard_tx),
            sink.run(san_rx),
            self.hardener.clone().run(hard_rx),
        );

        let DispatchStats {
            detections,
            sanitize_requests,
            harden_requests,
            unmatched,
        } = dispatched;
        summary.detections = detections;
        summary.sanitize_requests = sanitize_requests;
        summary.harden_requests = harden_requests;
        summary.unmatched = unmatched;
        summary.hardened = hardened;

        let sanitized = sanitized?;
        summary.sanitized = sanitized.sanitized;
        summary.sanitize_failed = sanitized.failed;
        scanned?;

        info!(
            detections = summary.detections,
            unmatched = summary.unmatched,
            sanitized = summary.sanitized,
            failed = summary.sanitize_failed,
            hardened = summary.hardened,
            "run complete"
        );
        tokio::time::sleep(self.config.exit_grace_delay).await;
        Ok(summary)
    }

    async fn collect_candidates(
        &self,
    ) -> Result<(SearchStrategy, usize, Vec<PathBuf>), PipelineError> {
        let snap = self.caps.current();
        let strategy = choose_strategy(
            snap.elevated,
            self.caps.supports_accelerated_search(&self.root),
            self.force_generic,
        );
        if strategy == SearchStrategy::Accelerated {
            match run_source(self.accelerated.as_ref(), &self.root, &self.config).await {
                Ok((count, survivors)) => return Ok((strategy, count, survivors)),
                Err(e) if e.triggers_fallback() => {
                    warn!("{e}, falling back to directory walk");
                }
                Err(e) => return Err(e.into()),
            }
        }
        // Always a fresh queue here; a closed one is never reused.
        let (count, survivors) =
            run_source(self.generic.as_ref(), &self.root, &self.config).await?;
        Ok((SearchStrategy::Generic, count, survivors))
    }
}

async fn run_source(
    source: &dyn CandidateSource,
    root: &Path,
    config: &AgentConfig,
) -> Result<(usize, Vec<PathBuf>), SearchError> {
    info!("searching {} with {}", root.display(), source.name());
    let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
    let (count, survivors) = tokio::join!(
        source.search(root, &config.extensions, tx),
        filter_existing(rx)
    );
    Ok((count?, survivors))
}
