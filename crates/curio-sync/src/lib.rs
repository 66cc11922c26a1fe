//! Pipeline orchestration: classify -> acquire -> screen -> merge.

pub mod acquire;
pub mod classify;
pub mod config;
pub mod control;
pub mod inventory;
pub mod merge;
pub mod report;
pub mod screen;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use curio_core::{CurioError, QueueRow, Stage, StageManifest, Target};
use curio_storage::{FsStageStore, HttpFetcher, PayloadStore, StageStore};
use futures::stream::{self, StreamExt};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use acquire::{AcquireOutcome, AcquireReport, AcquisitionEngine};
pub use classify::{Classifier, EvidenceStore, LicenseResolver, QueueStore};
pub use config::PipelineConfig;
pub use control::{cancel_pair, with_backoff, CancelHandle, CancelSignal};
pub use inventory::TargetInventory;
pub use merge::{MergeEngine, MergeOutcome, MergeReport};
pub use report::{format_status, report_latest_markdown, stage_status, RunReport, RunSummary};
pub use screen::{ScreenOutcome, ScreenPolicy, ScreenReport, ScreeningEngine};

pub const CRATE_NAME: &str = "curio-sync";

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run only this stage; `None` runs all four in order.
    pub stage: Option<Stage>,
    /// Without this, only classification mutates state; later stages plan.
    pub execute: bool,
    pub workers: Option<usize>,
    pub limit_targets: Option<usize>,
    pub limit_files: Option<usize>,
    pub no_fetch: bool,
    /// Re-capture evidence for targets already classified.
    pub refresh_evidence: bool,
}

impl RunOptions {
    fn runs(&self, stage: Stage) -> bool {
        self.stage.map_or(true, |selected| selected == stage)
    }
}

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    inventory: TargetInventory,
    stages: Arc<dyn StageStore>,
    http: HttpFetcher,
    store: PayloadStore,
    resolver: LicenseResolver,
    policy: Arc<ScreenPolicy>,
    cancel: CancelSignal,
}

impl Pipeline {
    /// Everything fallible about the run's setup happens here, before any mutation.
    pub fn new(
        config: PipelineConfig,
        inventory: TargetInventory,
        stages: Arc<dyn StageStore>,
        cancel: CancelSignal,
    ) -> Result<Self, CurioError> {
        config.validate()?;
        let http = HttpFetcher::new(config.acquisition.http_config())
            .map_err(|e| CurioError::Config(format!("building http client: {e:#}")))?;
        let policy = Arc::new(ScreenPolicy::new(&config)?);
        Ok(Self {
            store: PayloadStore::new(config.raw_dir()),
            resolver: LicenseResolver::new(&config.licensing),
            config: Arc::new(config),
            inventory,
            stages,
            http,
            policy,
            cancel,
        })
    }

    /// Load the inventory named by `config` and persist stage state under its state root.
    pub fn from_config(config: PipelineConfig, cancel: CancelSignal) -> Result<Self, CurioError> {
        let inventory = TargetInventory::load(&config.targets_path())?;
        let stages: Arc<dyn StageStore> = Arc::new(FsStageStore::new(config.state_dir()));
        Self::new(config, inventory, stages, cancel)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stages(&self) -> &dyn StageStore {
        self.stages.as_ref()
    }

    pub async fn run(&self, options: &RunOptions) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, execute = options.execute);
        self.run_inner(run_id, options).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, options: &RunOptions) -> Result<RunReport> {
        let mut report = RunReport::new(run_id, Utc::now(), options.execute, options.stage);
        let workers = options
            .workers
            .unwrap_or(self.config.acquisition.workers)
            .max(1);

        let enabled = self.inventory.enabled();
        let enabled_ids: BTreeSet<&str> = enabled.iter().map(|t| t.id.as_str()).collect();
        let mut targets = enabled.clone();
        if let Some(limit) = options.limit_targets {
            targets.truncate(limit);
        }
        info!(
            targets = targets.len(),
            enabled = enabled.len(),
            workers,
            stage = options.stage.map(Stage::as_str).unwrap_or("all"),
            "run started"
        );

        let queue = QueueStore::new(self.config.queues_dir());
        let mut rows = queue.load_all().context("loading queues")?;
        // Rows for targets that were disabled or removed leave the queues.
        rows.retain(|id, _| enabled_ids.contains(id.as_str()));

        if options.runs(Stage::Classify) {
            self.classify_stage(run_id, &targets, options, workers, &mut rows, &mut report)
                .await?;
            queue.write_all(&rows).context("writing queues")?;
        }

        let active: Vec<QueueRow> = targets
            .iter()
            .filter_map(|t| rows.get(&t.id).cloned())
            .collect();

        if options.runs(Stage::Acquire) {
            let engine = AcquisitionEngine {
                config: &self.config,
                http: &self.http,
                store: &self.store,
                stages: self.stages.as_ref(),
                cancel: &self.cancel,
            };
            let acquirable: Vec<QueueRow> = active
                .iter()
                .filter(|row| row.bucket.is_acquirable())
                .cloned()
                .collect();
            let mut reports = engine
                .run(run_id, acquirable, options.execute, workers, options.limit_files)
                .await;
            reports.sort_by(|a, b| a.target_id.cmp(&b.target_id));
            report.acquired(&reports);
        }

        if options.runs(Stage::Screen) {
            let engine = ScreeningEngine {
                config: &self.config,
                policy: Arc::clone(&self.policy),
                stages: self.stages.as_ref(),
            };
            let reports = engine
                .run(run_id, active.clone(), options.execute, workers)
                .await?;
            report.screened(&reports);
        }

        if options.runs(Stage::Merge) {
            let engine = MergeEngine {
                config: &self.config,
                stages: self.stages.as_ref(),
            };
            let reports = engine.run(run_id, &rows, options.execute)?;
            report.merged(&reports);
        }

        report.finish(Utc::now(), self.cancel.is_cancelled());
        if options.execute {
            let dir = report.write(&self.config.reports_dir()).await?;
            info!(reports = %dir.display(), "run reports written");
        }
        info!(
            accepted = report.summary.accepted,
            pitched = report.summary.pitched,
            duplicates = report.summary.duplicates,
            needs_review = report.summary.needs_review,
            cancelled = report.summary.cancelled,
            "run finished"
        );
        Ok(report)
    }

    async fn classify_stage(
        &self,
        run_id: Uuid,
        targets: &[&Target],
        options: &RunOptions,
        workers: usize,
        rows: &mut BTreeMap<String, QueueRow>,
        report: &mut RunReport,
    ) -> Result<()> {
        let evidence = EvidenceStore::new(self.config.evidence_dir());
        let classifier = Classifier {
            config: &self.config,
            resolver: &self.resolver,
            http: &self.http,
            evidence: &evidence,
            cancel: &self.cancel,
        };

        let mut pending = Vec::new();
        for &target in targets {
            if self.cancel.is_cancelled() {
                warn!("cancelled; remaining targets left unclassified");
                break;
            }
            let prior = self
                .stages
                .load(&target.id, Stage::Classify)
                .with_context(|| format!("loading classify state for {}", target.id))?;
            let done = prior.as_ref().is_some_and(StageManifest::is_done);
            if done && rows.contains_key(&target.id) && !options.refresh_evidence {
                report.classify_skipped();
                continue;
            }
            // A refresh re-scores the row but leaves the DONE record alone.
            let begun = if done {
                None
            } else {
                let begun = StageManifest::begin(prior.as_ref(), &target.id, Stage::Classify, Utc::now())?;
                self.stages.save(&begun)?;
                Some(begun)
            };
            pending.push((target, begun));
        }

        let results: Vec<_> = stream::iter(pending)
            .map(|(target, begun)| {
                let classifier = &classifier;
                async move {
                    let result = classifier
                        .classify(run_id, target, options.no_fetch, Utc::now())
                        .await;
                    (target, begun, result)
                }
            })
            .buffered(workers)
            .collect()
            .await;

        for (target, begun, result) in results {
            match result {
                Ok(row) => {
                    if let Some(begun) = begun {
                        self.stages.save(&begun.complete(Vec::new(), Utc::now())?)?;
                    }
                    report.classified(&row);
                    rows.insert(row.target_id.clone(), row);
                }
                Err(err) => {
                    let reason = err.diagnostic();
                    warn!(target_id = %target.id, reason = %reason, "classification failed");
                    if let Some(begun) = begun {
                        self.stages.save(&begun.fail(reason.clone(), Utc::now())?)?;
                    }
                    report.classify_failed(&target.id, &reason);
                }
            }
        }
        Ok(())
    }
}

/// Build a pipeline from `CURIO_*` environment variables and run it once.
pub async fn run_from_env(options: &RunOptions, cancel: CancelSignal) -> Result<RunReport> {
    let config = PipelineConfig::from_env()?;
    let pipeline = Pipeline::from_config(config, cancel)?;
    pipeline.run(options).await
}
