//! Per-run summaries, needs-review listings and the stage status table.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use curio_core::{QueueRow, Stage, StageState};
use curio_storage::StageStore;
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::acquire::{AcquireOutcome, AcquireReport};
use crate::merge::{MergeOutcome, MergeReport};
use crate::screen::{ScreenOutcome, ScreenReport};

pub const RUN_SUMMARY_FILE: &str = "run_summary.json";
pub const NEEDS_REVIEW_FILE: &str = "needs_review.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub processed: usize,
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
    pub planned: usize,
    pub blocked: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewKind {
    ManualReview,
    Failed,
    RetryLimit,
    Quarantined,
    Pitched,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeedsReviewItem {
    pub target_id: String,
    pub stage: Stage,
    pub kind: ReviewKind,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub execute: bool,
    pub stage: Option<Stage>,
    pub cancelled: bool,
    pub stages: BTreeMap<Stage, StageSummary>,
    pub accepted: usize,
    pub pitched: usize,
    pub duplicates: usize,
    pub needs_review: usize,
}

/// Accumulates stage outcomes into a summary and a needs-review list.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: RunSummary,
    pub needs_review: Vec<NeedsReviewItem>,
}

impl RunReport {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>, execute: bool, stage: Option<Stage>) -> Self {
        Self {
            summary: RunSummary {
                run_id,
                started_at,
                finished_at: None,
                execute,
                stage,
                cancelled: false,
                stages: BTreeMap::new(),
                accepted: 0,
                pitched: 0,
                duplicates: 0,
                needs_review: 0,
            },
            needs_review: Vec::new(),
        }
    }

    fn stage(&mut self, stage: Stage) -> &mut StageSummary {
        self.summary.stages.entry(stage).or_default()
    }

    fn flag(&mut self, target_id: &str, stage: Stage, kind: ReviewKind, reason: impl Into<String>) {
        self.needs_review.push(NeedsReviewItem {
            target_id: target_id.to_string(),
            stage,
            kind,
            reason: reason.into(),
        });
    }

    fn retry_limited(&mut self, target_id: &str, stage: Stage, attempts: u32, last: Option<&str>) {
        let reason = format!("failed {attempts} runs; last: {}", last.unwrap_or("unknown"));
        self.flag(target_id, stage, ReviewKind::RetryLimit, reason);
    }

    pub fn classified(&mut self, row: &QueueRow) {
        let summary = self.stage(Stage::Classify);
        summary.processed += 1;
        summary.done += 1;
        if row.manual_review {
            let reason = format!("{}: {}", row.bucket, row.review_reasons.join("; "));
            self.flag(&row.target_id, Stage::Classify, ReviewKind::ManualReview, reason);
        }
    }

    pub fn classify_skipped(&mut self) {
        self.stage(Stage::Classify).skipped += 1;
    }

    pub fn classify_failed(&mut self, target_id: &str, reason: &str) {
        let summary = self.stage(Stage::Classify);
        summary.processed += 1;
        summary.failed += 1;
        self.flag(target_id, Stage::Classify, ReviewKind::Failed, reason);
    }

    pub fn acquired(&mut self, reports: &[AcquireReport]) {
        for report in reports {
            let summary = self.stage(Stage::Acquire);
            match &report.outcome {
                AcquireOutcome::Done { .. } => {
                    summary.processed += 1;
                    summary.done += 1;
                }
                AcquireOutcome::AlreadyDone => summary.skipped += 1,
                AcquireOutcome::Blocked => summary.blocked += 1,
                AcquireOutcome::Planned => summary.planned += 1,
                AcquireOutcome::Cancelled => {
                    summary.skipped += 1;
                    self.summary.cancelled = true;
                }
                AcquireOutcome::Failed { reason } => {
                    summary.processed += 1;
                    summary.failed += 1;
                    let reason = reason.clone();
                    self.flag(&report.target_id, Stage::Acquire, ReviewKind::Failed, reason);
                }
                AcquireOutcome::Quarantined { reason } => {
                    summary.skipped += 1;
                    let reason = reason.clone();
                    self.flag(&report.target_id, Stage::Acquire, ReviewKind::Quarantined, reason);
                }
                AcquireOutcome::Sampled { .. } => summary.skipped += 1,
                AcquireOutcome::RetryLimit { attempts, reason } => {
                    summary.skipped += 1;
                    self.retry_limited(&report.target_id, Stage::Acquire, *attempts, reason.as_deref());
                }
            }
        }
    }

    pub fn screened(&mut self, reports: &[ScreenReport]) {
        for report in reports {
            let summary = self.stage(Stage::Screen);
            match &report.outcome {
                ScreenOutcome::Done { accepted, pitched } => {
                    summary.processed += 1;
                    summary.done += 1;
                    self.summary.accepted += accepted;
                    self.summary.pitched += pitched;
                }
                ScreenOutcome::AlreadyDone => summary.skipped += 1,
                ScreenOutcome::Blocked => summary.blocked += 1,
                ScreenOutcome::Planned => summary.planned += 1,
                ScreenOutcome::Failed { reason } => {
                    summary.processed += 1;
                    summary.failed += 1;
                    let reason = reason.clone();
                    self.flag(&report.target_id, Stage::Screen, ReviewKind::Failed, reason);
                }
                ScreenOutcome::RetryLimit { attempts, reason } => {
                    summary.skipped += 1;
                    self.retry_limited(&report.target_id, Stage::Screen, *attempts, reason.as_deref());
                }
                ScreenOutcome::Quarantined { reason } => {
                    summary.skipped += 1;
                    let reason = reason.clone();
                    self.flag(&report.target_id, Stage::Screen, ReviewKind::Quarantined, reason);
                }
            }
            for pitch in &report.pitches {
                let reason = format!("{} {}: {}", pitch.locator, pitch.reason, pitch.detail);
                self.flag(&report.target_id, Stage::Screen, ReviewKind::Pitched, reason);
            }
        }
    }

    pub fn merged(&mut self, reports: &[MergeReport]) {
        for report in reports {
            let summary = self.stage(Stage::Merge);
            match &report.outcome {
                MergeOutcome::Done {
                    duplicates,
                    pitched,
                    ..
                } => {
                    summary.processed += 1;
                    summary.done += 1;
                    self.summary.duplicates += duplicates;
                    self.summary.pitched += pitched;
                    if *pitched > 0 {
                        let reason = format!("{pitched} records pitched at merge");
                        self.flag(&report.target_id, Stage::Merge, ReviewKind::Pitched, reason);
                    }
                }
                MergeOutcome::AlreadyDone => summary.skipped += 1,
                MergeOutcome::Planned => summary.planned += 1,
                MergeOutcome::Failed { reason } => {
                    summary.processed += 1;
                    summary.failed += 1;
                    let reason = reason.clone();
                    self.flag(&report.target_id, Stage::Merge, ReviewKind::Failed, reason);
                }
                MergeOutcome::RetryLimit { attempts, reason } => {
                    summary.skipped += 1;
                    self.retry_limited(&report.target_id, Stage::Merge, *attempts, reason.as_deref());
                }
                MergeOutcome::Quarantined { reason } => {
                    summary.skipped += 1;
                    let reason = reason.clone();
                    self.flag(&report.target_id, Stage::Merge, ReviewKind::Quarantined, reason);
                }
            }
        }
    }

    pub fn finish(&mut self, finished_at: DateTime<Utc>, cancelled: bool) {
        self.summary.finished_at = Some(finished_at);
        self.summary.cancelled |= cancelled;
        self.summary.needs_review = self.needs_review.len();
    }

    /// Write `<reports>/<run_id>/{run_summary,needs_review}.json`.
    pub async fn write(&self, reports_root: &Path) -> Result<PathBuf> {
        let dir = reports_root.join(self.summary.run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let summary = serde_json::to_vec_pretty(&self.summary).context("serializing run summary")?;
        fs::write(dir.join(RUN_SUMMARY_FILE), summary)
            .await
            .context("writing run_summary.json")?;

        let review = serde_json::to_vec_pretty(&self.needs_review).context("serializing needs review")?;
        fs::write(dir.join(NEEDS_REVIEW_FILE), review)
            .await
            .context("writing needs_review.json")?;
        Ok(dir)
    }
}

/// Markdown digest of the most recent `runs` run reports.
pub fn report_latest_markdown(reports_root: &Path, runs: usize) -> Result<String> {
    let mut summaries = Vec::new();
    if reports_root.exists() {
        for entry in std::fs::read_dir(reports_root)
            .with_context(|| format!("reading {}", reports_root.display()))?
        {
            let entry = entry.with_context(|| format!("reading {}", reports_root.display()))?;
            let path = entry.path().join(RUN_SUMMARY_FILE);
            if !path.exists() {
                continue;
            }
            let summary: RunSummary = serde_json::from_str(
                &std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?,
            )
            .with_context(|| format!("parsing {}", path.display()))?;
            summaries.push((entry.path(), summary));
        }
    }
    summaries.sort_by_key(|(_, s)| std::cmp::Reverse(s.started_at));
    summaries.truncate(runs.max(1));

    let mut lines = vec!["# Curio Run Report".to_string(), String::new()];
    if summaries.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for (dir, summary) in summaries {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at.to_rfc3339()));
        if let Some(finished) = summary.finished_at {
            lines.push(format!("- finished: {}", finished.to_rfc3339()));
        }
        if summary.cancelled {
            lines.push("- cancelled before completion".to_string());
        }
        lines.push(format!(
            "- records: {} accepted, {} pitched, {} duplicates",
            summary.accepted, summary.pitched, summary.duplicates
        ));
        for (stage, counts) in &summary.stages {
            lines.push(format!(
                "- {stage}: {} done, {} failed, {} skipped, {} planned, {} blocked",
                counts.done, counts.failed, counts.skipped, counts.planned, counts.blocked
            ));
        }
        lines.push(format!("- needs review: {}", summary.needs_review));
        let review_path = dir.join(NEEDS_REVIEW_FILE);
        if review_path.exists() {
            lines.push(format!("- review list: `{}`", review_path.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
}

pub fn stage_status(stages: &dyn StageStore) -> Result<BTreeMap<Stage, StateCounts>> {
    let mut out = BTreeMap::new();
    for stage in [Stage::Classify, Stage::Acquire, Stage::Screen, Stage::Merge] {
        let counts: &mut StateCounts = out.entry(stage).or_default();
        for manifest in stages.list(stage)? {
            match manifest.state {
                StageState::Pending => counts.pending += 1,
                StageState::InProgress => counts.in_progress += 1,
                StageState::Done => counts.done += 1,
                StageState::Failed => counts.failed += 1,
            }
        }
    }
    Ok(out)
}

pub fn format_status(status: &BTreeMap<Stage, StateCounts>) -> String {
    let mut lines = vec![format!(
        "{:<10} {:>8} {:>12} {:>8} {:>8}",
        "stage", "pending", "in_progress", "done", "failed"
    )];
    for (stage, c) in status {
        lines.push(format!(
            "{:<10} {:>8} {:>12} {:>8} {:>8}",
            stage.as_str(),
            c.pending,
            c.in_progress,
            c.done,
            c.failed
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::PitchNote;
    use curio_core::{ReasonCode, StageManifest};
    use curio_storage::MemoryStageStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn failures_and_pitches_become_review_items() {
        let mut report = RunReport::new(Uuid::new_v4(), Utc::now(), true, None);
        report.acquired(&[
            AcquireReport {
                target_id: "a".into(),
                outcome: AcquireOutcome::Failed {
                    reason: "transient_fetch: 503".into(),
                },
            },
            AcquireReport {
                target_id: "b".into(),
                outcome: AcquireOutcome::Done { files: 2 },
            },
        ]);
        report.screened(&[ScreenReport {
            target_id: "b".into(),
            outcome: ScreenOutcome::Done {
                accepted: 3,
                pitched: 1,
            },
            pitches: vec![PitchNote {
                locator: "x.jsonl#L2".into(),
                reason: ReasonCode::MissingLicense,
                detail: "no license".into(),
            }],
        }]);
        report.finish(Utc::now(), false);

        assert_eq!(report.summary.needs_review, 2);
        assert_eq!(report.summary.accepted, 3);
        assert_eq!(report.summary.stages[&Stage::Acquire].failed, 1);
        assert_eq!(report.needs_review[0].kind, ReviewKind::Failed);
        assert!(report.needs_review[1].reason.contains("missing_license"));

        let dir = tempdir().unwrap();
        let written = report.write(dir.path()).await.unwrap();
        assert!(written.join(RUN_SUMMARY_FILE).exists());
        let markdown = report_latest_markdown(dir.path(), 3).unwrap();
        assert!(markdown.contains(&report.summary.run_id.to_string()));
        assert!(markdown.contains("needs review: 2"));
    }

    #[test]
    fn latest_report_handles_missing_directory() {
        let dir = tempdir().unwrap();
        let markdown = report_latest_markdown(&dir.path().join("reports"), 1).unwrap();
        assert!(markdown.contains("No runs recorded yet."));
    }

    #[test]
    fn status_counts_states_per_stage() {
        let stages = MemoryStageStore::new();
        let begun = StageManifest::begin(None, "a", Stage::Acquire, Utc::now()).unwrap();
        stages.save(&begun.clone().fail("boom", Utc::now()).unwrap()).unwrap();
        let other = StageManifest::begin(None, "b", Stage::Acquire, Utc::now()).unwrap();
        stages.save(&other).unwrap();

        let status = stage_status(&stages).unwrap();
        assert_eq!(status[&Stage::Acquire].failed, 1);
        assert_eq!(status[&Stage::Acquire].in_progress, 1);
        assert_eq!(status[&Stage::Merge], StateCounts::default());
        assert!(format_status(&status).contains("acquire"));
    }
}
