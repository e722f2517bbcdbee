use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mg_agent::{
    AgentConfig, CandidateSource, Capabilities, CapabilitySnapshot, Detection, DetectionEngine,
    Dispatcher, EngineError, HardenError, Hardener, HomeResolver, Pipeline, PipelineError,
    RemediationCatalog, SanitizeReport, SanitizeSink, SearchError, SearchStrategy, WalkDirSource,
};
use mg_protocol::SanitizeRequest;
use tokio::sync::mpsc;

const VIRUS_X: &str = r#"{
    "version": 1,
    "solutions": [{
        "name": "VirusX",
        "module": "Module1",
        "action": "sanitize",
        "mustHarden": true,
        "hardenMeasures": [{"action": "setRO", "type": "file", "dest": "${HOME}/cache.db"}]
    }]
}"#;

fn config() -> AgentConfig {
    AgentConfig {
        exit_grace_delay: Duration::ZERO,
        ..AgentConfig::default()
    }
}

struct FixedHome(PathBuf);

impl HomeResolver for FixedHome {
    fn home_dir(&self) -> Result<PathBuf, HardenError> {
        Ok(self.0.clone())
    }
}

struct FakeCaps {
    elevated: bool,
    accelerated_fs: bool,
}

impl Capabilities for FakeCaps {
    fn current(&self) -> CapabilitySnapshot {
        CapabilitySnapshot {
            elevated: self.elevated,
            ..Default::default()
        }
    }

    fn supports_accelerated_search(&self, _root: &Path) -> bool {
        self.accelerated_fs
    }
}

/// Emits fixed detections and ignores the candidate list.
struct FixedDetections(Vec<Detection>);

#[async_trait]
impl DetectionEngine for FixedDetections {
    fn needs_candidates(&self) -> bool {
        false
    }

    async fn scan(
        &self,
        _paths: Vec<PathBuf>,
        out: mpsc::Sender<Detection>,
    ) -> Result<usize, EngineError> {
        for d in &self.0 {
            out.send(d.clone()).await.ok();
        }
        Ok(self.0.len())
    }
}

/// Flags every candidate as `rule`.
struct FlagAll(&'static str);

#[async_trait]
impl DetectionEngine for FlagAll {
    async fn scan(
        &self,
        paths: Vec<PathBuf>,
        out: mpsc::Sender<Detection>,
    ) -> Result<usize, EngineError> {
        let n = paths.len();
        for p in paths {
            out.send(Detection::new(self.0, p.to_string_lossy()))
                .await
                .ok();
        }
        Ok(n)
    }
}

/// Emits one path, then gives up as if the filesystem were unsupported.
struct BrokenAccelerated {
    emit: PathBuf,
    err: fn() -> SearchError,
}

#[async_trait]
impl CandidateSource for BrokenAccelerated {
    fn name(&self) -> &'static str {
        "broken"
    }

    async fn search(
        &self,
        _root: &Path,
        _extensions: &[String],
        out: mpsc::Sender<PathBuf>,
    ) -> Result<usize, SearchError> {
        out.send(self.emit.clone()).await.ok();
        Err((self.err)())
    }
}

#[derive(Clone, Default)]
struct CollectingSink(Arc<Mutex<Vec<SanitizeRequest>>>);

#[async_trait]
impl SanitizeSink for CollectingSink {
    async fn run(
        self: Box<Self>,
        mut requests: mpsc::Receiver<SanitizeRequest>,
    ) -> Result<SanitizeReport, PipelineError> {
        let mut report = SanitizeReport::default();
        while let Some(r) = requests.recv().await {
            self.0.lock().unwrap().push(r);
            report.sanitized += 1;
        }
        Ok(report)
    }
}

fn catalog() -> Arc<RemediationCatalog> {
    Arc::new(RemediationCatalog::from_json(VIRUS_X.as_bytes()).unwrap())
}

fn hardener(home: &Path, dry_run: bool) -> Arc<Hardener> {
    Arc::new(
        Hardener::new(dry_run, Arc::new(FixedHome(home.to_path_buf()))).with_platform_support(true),
    )
}

#[tokio::test]
async fn virus_x_end_to_end() {
    let home = tempfile::tempdir().unwrap();
    let cache = home.path().join("cache.db");
    std::fs::write(&cache, b"state").unwrap();

    let engine = FixedDetections(vec![Detection::new("VirusX", "C:\\Users\\bob\\Book1.xlsm")]);
    let sink = CollectingSink::default();
    let summary = Pipeline::new(
        config(),
        home.path(),
        Arc::new(FakeCaps { elevated: false, accelerated_fs: false }),
        Arc::new(engine),
        Dispatcher::new(catalog(), true),
        hardener(home.path(), false),
    )
    .run(Box::new(sink.clone()))
    .await
    .unwrap();

    let sent = sink.0.lock().unwrap().clone();
    assert_eq!(
        sent,
        vec![SanitizeRequest {
            path: "C:\\Users\\bob\\Book1.xlsm".into(),
            action: "sanitize".into(),
            destination_module: "Module1".into(),
            detection_name: "VirusX".into(),
        }]
    );
    assert_eq!(summary.harden_requests, 1);
    assert_eq!(summary.hardened, 1);
    assert!(std::fs::metadata(&cache).unwrap().permissions().readonly());
    assert_eq!(summary.strategy, None);
}

#[tokio::test]
async fn dry_run_keeps_dispatch_trail_without_mutation() {
    let home = tempfile::tempdir().unwrap();
    let cache = home.path().join("cache.db");
    std::fs::write(&cache, b"state").unwrap();

    let engine = FixedDetections(vec![
        Detection::new("VirusX", "/a.xlsm"),
        Detection::new("VirusX", "/b.xlsm"),
        Detection::new("Unmapped", "/c.xlsm"),
    ]);
    let sink = CollectingSink::default();
    let summary = Pipeline::new(
        config(),
        home.path(),
        Arc::new(FakeCaps { elevated: false, accelerated_fs: false }),
        Arc::new(engine),
        Dispatcher::new(catalog(), true),
        hardener(home.path(), true),
    )
    .run(Box::new(sink.clone()))
    .await
    .unwrap();

    assert_eq!(summary.detections, 3);
    assert_eq!(summary.sanitize_requests, 2);
    assert_eq!(summary.harden_requests, 2);
    assert_eq!(summary.unmatched, 1);
    assert_eq!(summary.hardened, 0);
    assert!(!std::fs::metadata(&cache).unwrap().permissions().readonly());
}

#[tokio::test]
async fn accelerated_failure_falls_back_to_walk() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("book.xlsm"), b"PK").unwrap();
    std::fs::write(root.path().join("empty.xls"), b"").unwrap();
    let stale = root.path().join("stale.xlsm");
    std::fs::write(&stale, b"PK").unwrap();

    let accelerated = BrokenAccelerated {
        emit: stale,
        err: || SearchError::Fallback("not ntfs".into()),
    };
    let sink = CollectingSink::default();
    let summary = Pipeline::new(
        config(),
        root.path(),
        Arc::new(FakeCaps { elevated: true, accelerated_fs: true }),
        Arc::new(FlagAll("VirusX")),
        Dispatcher::new(catalog(), false),
        hardener(root.path(), false),
    )
    .with_sources(Arc::new(accelerated), Arc::new(WalkDirSource))
    .run(Box::new(sink.clone()))
    .await
    .unwrap();

    assert_eq!(summary.strategy, Some(SearchStrategy::Generic));
    assert_eq!(summary.candidates, 3);
    assert_eq!(summary.survivors, 2);
    assert_eq!(summary.sanitize_requests, 2);
    assert_eq!(summary.harden_requests, 0);
}

#[tokio::test]
async fn invalid_root_is_fatal_configuration_error() {
    let root = tempfile::tempdir().unwrap();
    let accelerated = BrokenAccelerated {
        emit: root.path().join("x.xls"),
        err: || SearchError::InvalidInput("bad root".into()),
    };
    let err = Pipeline::new(
        config(),
        root.path(),
        Arc::new(FakeCaps { elevated: true, accelerated_fs: true }),
        Arc::new(FlagAll("VirusX")),
        Dispatcher::new(catalog(), false),
        hardener(root.path(), false),
    )
    .with_sources(Arc::new(accelerated), Arc::new(WalkDirSource))
    .run(Box::new(CollectingSink::default()))
    .await
    .unwrap_err();
    assert!(err.is_config());
}

#[tokio::test]
async fn forced_generic_skips_accelerated_source() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("book.xlsb"), b"PK").unwrap();
    let accelerated = BrokenAccelerated {
        emit: root.path().join("never.xls"),
        err: || SearchError::InvalidInput("must not be called".into()),
    };
    let summary = Pipeline::new(
        config(),
        root.path(),
        Arc::new(FakeCaps { elevated: true, accelerated_fs: true }),
        Arc::new(FlagAll("Nothing")),
        Dispatcher::new(catalog(), true),
        hardener(root.path(), false),
    )
    .with_sources(Arc::new(accelerated), Arc::new(WalkDirSource))
    .force_generic(true)
    .run(Box::new(CollectingSink::default()))
    .await
    .unwrap();
    assert_eq!(summary.strategy, Some(SearchStrategy::Generic));
    assert_eq!(summary.unmatched, 1);
    assert_eq!(summary.sanitize_requests, 0);
}
