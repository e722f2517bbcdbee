use std::sync::Arc;

use mg_protocol::SanitizeRequest;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::catalog::RemediationCatalog;
use crate::detection::{Detection, HardenRequest};

/// Joins detections with catalog solutions.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    catalog: Arc<RemediationCatalog>,
    hardening: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub detections: usize,
    pub sanitize_requests: usize,
    pub harden_requests: usize,
    pub unmatched: usize,
}

impl Dispatcher {
    pub fn new(catalog: Arc<RemediationCatalog>, hardening: bool) -> Self {
        Self { catalog, hardening }
    }

    /// Build the requests for one detection, or `None` when the catalog has
    /// no solution for its rule.
    pub fn route(&self, det: &Detection) -> Option<(SanitizeRequest, Option<HardenRequest>)> {
        let sol = self.catalog.find(&det.rule_id)?;
        let sanitize = SanitizeRequest {
            path: det.path.clone(),
            action: sol.action.clone(),
            destination_module: sol.destination_module.clone(),
            detection_name: sol.name.clone(),
        };
        let harden = self.hardening.then(|| HardenRequest {
            detection_name: sol.name.clone(),
            allow_repeated: sol.allow_repeated_harden,
            measures: sol.harden_measures.clone(),
        });
        Some((sanitize, harden))
    }

    /// Consume detections until the engine closes its queue.
    ///
    /// Both output senders are owned here and dropped on return, which closes
    /// the sanitize and harden queues exactly once.
    pub async fn run(
        self,
        mut detections: mpsc::Receiver<Detection>,
        sanitize_tx: mpsc::Sender<SanitizeRequest>,
        harden_tx: mpsc::Sender<HardenRequest>,
    ) -> DispatchStats {
        let mut stats = DispatchStats::default();
        while let Some(det) = detections.recv().await {
            stats.detections += 1;
            let Some((sanitize, harden)) = self.route(&det) else {
                warn!(
                    rule = %det.rule_id,
                    "no remediation for detection in {}, dropped", det.path
                );
                stats.unmatched += 1;
                continue;
            };
            info!(
                rule = %det.rule_id,
                module = %sanitize.destination_module,
                action = %sanitize.action,
                "dispatching {}", det.path
            );
            if sanitize_tx.send(sanitize).await.is_err() {
                warn!("sanitizer stopped, request for {} lost", det.path);
            } else {
                stats.sanitize_requests += 1;
            }
            if let Some(harden) = harden {
                if harden_tx.send(harden).await.is_err() {
                    warn!("hardener stopped, request for {} lost", det.rule_id);
                } else {
                    stats.harden_requests += 1;
                }
            }
        }
        stats
    }
}
