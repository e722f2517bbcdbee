//! Unprivileged half of the remediation agent.
//!
//! Finds candidate spreadsheets, scans them, joins detections with the
//! remediation catalog and fans the results out to a sanitizer sink and the
//! filesystem hardener.

pub mod caps;
pub mod catalog;
pub mod config;
pub mod detection;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod harden;
pub mod pipeline;
pub mod scanner;
pub mod search;
pub mod seal;

pub use caps::{Capabilities, CapabilitySnapshot, HostCapabilities};
pub use catalog::{HardenMeasure, RemediationCatalog, Solution};
pub use config::AgentConfig;
pub use detection::{Detection, DetectionEngine, HardenRequest, ResultListEngine};
pub use dispatch::{DispatchStats, Dispatcher};
pub use error::{CatalogError, EngineError, HardenError, PipelineError, SealError, SearchError};
pub use harden::{HardenOutcome, Hardener, HomeResolver, ProfileHomeResolver};
pub use pipeline::{Pipeline, RunSummary, SanitizeReport, SanitizeSink};
pub use scanner::ExternalScannerEngine;
pub use search::{
    CandidateSource, SearchStrategy, VolumeRecordSource, WalkDirSource, choose_strategy,
};
pub use seal::{BlobDecryptor, XChaChaDecryptor};
