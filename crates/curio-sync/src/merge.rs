//! Merge: the single global dedup point between screened and combined shards.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use curio_core::{
    Bucket, CanonicalRecord, CurioError, Disposition, FileRecord, LedgerEntry, OutputPool,
    QueueRow, ReasonCode, ShardRef, Stage, StageManifest,
};
use curio_storage::shard::closed_shards;
use curio_storage::{read_shard, sha256_hex, Ledger, ShardWriter, StageStore};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::control::{held_back, HeldBack};

pub const MERGE_LEDGER: &str = "merge.jsonl";

/// Merge order: GREEN before YELLOW.
const MERGE_BUCKETS: [Bucket; 2] = [Bucket::Green, Bucket::Yellow];

/// Content hashes already present anywhere in the combined output.
#[derive(Debug, Default)]
pub struct HashIndex {
    seen: HashSet<String>,
}

impl HashIndex {
    pub fn load(combined_dir: &Path) -> anyhow::Result<Self> {
        let mut seen = HashSet::new();
        for pool in OutputPool::ALL {
            for (_, path) in closed_shards(combined_dir, pool.as_str())? {
                let records: Vec<CanonicalRecord> = read_shard(&path)?;
                seen.extend(records.into_iter().map(|r| r.content_hash));
            }
        }
        debug!(hashes = seen.len(), "hash index loaded");
        Ok(Self { seen })
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.seen.contains(hash)
    }

    /// True when the hash was not yet present.
    pub fn insert(&mut self, hash: &str) -> bool {
        self.seen.insert(hash.to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Done {
        accepted: usize,
        duplicates: usize,
        pitched: usize,
    },
    AlreadyDone,
    RetryLimit { attempts: u32, reason: Option<String> },
    Quarantined { reason: String },
    Planned,
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct MergeReport {
    pub target_id: String,
    pub outcome: MergeOutcome,
}

#[derive(Debug, Default)]
struct Tally {
    accepted: usize,
    duplicates: usize,
    pitched: usize,
    shards: BTreeSet<String>,
}

pub struct MergeEngine<'a> {
    pub config: &'a PipelineConfig,
    pub stages: &'a dyn StageStore,
}

fn output_error(err: anyhow::Error) -> CurioError {
    CurioError::Io(format!("merge output: {err:#}"))
}

/// Screened shards referenced by a done-marker must still match it.
fn verify_inputs(screened_dir: &Path, manifest: &StageManifest) -> Result<(), CurioError> {
    for file in &manifest.files {
        let path = screened_dir.join(&file.path);
        let bytes = std::fs::read(&path).map_err(|e| CurioError::io(path.display(), e))?;
        if sha256_hex(&bytes) != file.sha256 {
            return Err(CurioError::integrity(format!(
                "screened shard {} changed since screening",
                file.path
            )));
        }
    }
    Ok(())
}

impl MergeEngine<'_> {
    /// Merge every screened target not yet merged. `rows` is the current
    /// queue; a target missing from it or now RED is pitched, not merged.
    pub fn run(
        &self,
        run_id: Uuid,
        rows: &BTreeMap<String, QueueRow>,
        execute: bool,
    ) -> Result<Vec<MergeReport>, CurioError> {
        let state_error = |e: anyhow::Error| CurioError::Io(format!("stage state: {e:#}"));
        let screened_dir = self.config.screened_dir();
        let combined_dir = self.config.combined_dir();

        let mut screened: Vec<StageManifest> = self
            .stages
            .list(Stage::Screen)
            .map_err(state_error)?
            .into_iter()
            .filter(StageManifest::is_done)
            .collect();
        screened.sort_by(|a, b| a.target_id.cmp(&b.target_id));

        let mut reports = Vec::new();
        let mut started: BTreeMap<String, StageManifest> = BTreeMap::new();
        let mut wanted: BTreeSet<String> = BTreeSet::new();
        for manifest in screened {
            let target_id = manifest.target_id.clone();
            let prior = self
                .stages
                .load(&target_id, Stage::Merge)
                .map_err(state_error)?;
            if prior.as_ref().is_some_and(StageManifest::is_done) {
                reports.push(MergeReport {
                    target_id,
                    outcome: MergeOutcome::AlreadyDone,
                });
                continue;
            }
            let held = prior
                .as_ref()
                .and_then(|prior| held_back(prior, self.config.acquisition.max_run_retries));
            if let Some(held) = held {
                let outcome = match held {
                    HeldBack::Quarantined { reason } => MergeOutcome::Quarantined { reason },
                    HeldBack::RetryLimit { attempts, reason } => {
                        MergeOutcome::RetryLimit { attempts, reason }
                    }
                };
                reports.push(MergeReport { target_id, outcome });
                continue;
            }
            if !execute {
                reports.push(MergeReport {
                    target_id,
                    outcome: MergeOutcome::Planned,
                });
                continue;
            }
            let begun = StageManifest::begin(prior.as_ref(), &target_id, Stage::Merge, Utc::now())?;
            self.stages.save(&begun).map_err(state_error)?;
            if let Err(err) = verify_inputs(&screened_dir, &manifest) {
                let reason = err.diagnostic();
                warn!(target_id = %target_id, reason = %reason, "merge input rejected");
                self.stages
                    .save(&begun.fail(reason.clone(), Utc::now())?)
                    .map_err(state_error)?;
                reports.push(MergeReport {
                    target_id,
                    outcome: MergeOutcome::Failed { reason },
                });
                continue;
            }
            wanted.extend(manifest.files.iter().map(|f| f.path.clone()));
            started.insert(target_id, begun);
        }
        if started.is_empty() {
            return Ok(reports);
        }

        let mut index = HashIndex::load(&combined_dir).map_err(output_error)?;
        let mut ledger = Ledger::open(self.config.ledger_dir().join(MERGE_LEDGER)).map_err(output_error)?;
        let mut writers: BTreeMap<OutputPool, ShardWriter> = BTreeMap::new();
        let mut tallies: BTreeMap<String, Tally> = BTreeMap::new();
        let mut entries: Vec<LedgerEntry> = Vec::new();

        for bucket in MERGE_BUCKETS {
            let bucket_dir = screened_dir.join(bucket.as_str());
            for pool in OutputPool::ALL {
                let shards = closed_shards(&bucket_dir, pool.as_str()).map_err(output_error)?;
                for (_, path) in shards {
                    let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                        continue;
                    };
                    if !wanted.contains(&format!("{}/{name}", bucket.as_str())) {
                        continue;
                    }
                    let values: Vec<Value> = read_shard(&path).map_err(output_error)?;
                    for (line, value) in values.into_iter().enumerate() {
                        let Some(target_id) = value.get("target_id").and_then(Value::as_str) else {
                            warn!(shard = %name, line = line + 1, "screened record without target id");
                            entries.push(LedgerEntry {
                                run_id,
                                target_id: String::new(),
                                content_hash: value
                                    .get("content_hash")
                                    .and_then(Value::as_str)
                                    .map(str::to_string),
                                disposition: Disposition::Pitched,
                                reason: ReasonCode::ParseError,
                                detail: Some("screened record has no target id".into()),
                                stage: Stage::Merge,
                                source_path: Some(format!("{}/{name}#L{}", bucket.as_str(), line + 1)),
                                shard: None,
                                recorded_at: Utc::now(),
                            });
                            continue;
                        };
                        if !started.contains_key(target_id) {
                            continue;
                        }
                        let target_id = target_id.to_string();
                        let tally = tallies.entry(target_id.clone()).or_default();
                        let entry = self.merge_one(
                            run_id,
                            &target_id,
                            value,
                            rows.get(&target_id),
                            &mut index,
                            &mut writers,
                            tally,
                        )?;
                        entries.push(entry);
                    }
                }
            }
        }

        let mut closed: BTreeMap<String, FileRecord> = BTreeMap::new();
        for (_, writer) in writers {
            for shard in writer.finish().map_err(output_error)? {
                let bytes = std::fs::read(&shard.path)
                    .with_context(|| format!("reading {}", shard.path.display()))
                    .map_err(output_error)?;
                closed.insert(
                    shard.name.clone(),
                    FileRecord {
                        path: shard.name,
                        sha256: sha256_hex(&bytes),
                        bytes: bytes.len() as u64,
                    },
                );
            }
        }
        // Ledger rows, then done-markers, only once every shard they reference is closed.
        for entry in &entries {
            ledger.append(entry).map_err(output_error)?;
        }
        ledger.sync().map_err(output_error)?;

        for (target_id, begun) in started {
            let tally = tallies.remove(&target_id).unwrap_or_default();
            let files = tally
                .shards
                .iter()
                .filter_map(|name| closed.get(name).cloned())
                .collect();
            self.stages
                .save(&begun.complete(files, Utc::now())?)
                .map_err(state_error)?;
            info!(
                target_id = %target_id,
                accepted = tally.accepted,
                duplicates = tally.duplicates,
                pitched = tally.pitched,
                "merged"
            );
            reports.push(MergeReport {
                target_id,
                outcome: MergeOutcome::Done {
                    accepted: tally.accepted,
                    duplicates: tally.duplicates,
                    pitched: tally.pitched,
                },
            });
        }
        info!(hashes = index.len(), "merge complete");
        Ok(reports)
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_one(
        &self,
        run_id: Uuid,
        target_id: &str,
        value: Value,
        row: Option<&QueueRow>,
        index: &mut HashIndex,
        writers: &mut BTreeMap<OutputPool, ShardWriter>,
        tally: &mut Tally,
    ) -> Result<LedgerEntry, CurioError> {
        let source_path = value
            .get("source_path")
            .and_then(Value::as_str)
            .map(str::to_string);
        let mut entry = LedgerEntry {
            run_id,
            target_id: target_id.to_string(),
            content_hash: None,
            disposition: Disposition::Pitched,
            reason: ReasonCode::MissingHash,
            detail: None,
            stage: Stage::Merge,
            source_path,
            shard: None,
            recorded_at: Utc::now(),
        };

        let hash = value
            .get("content_hash")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string);
        let Some(hash) = hash else {
            tally.pitched += 1;
            entry.detail = Some("screened record has no content hash".into());
            return Ok(entry);
        };
        entry.content_hash = Some(hash.clone());

        let record: CanonicalRecord = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(e) => {
                tally.pitched += 1;
                entry.reason = ReasonCode::ParseError;
                entry.detail = Some(format!("malformed screened record: {e}"));
                return Ok(entry);
            }
        };

        match row {
            None => {
                tally.pitched += 1;
                entry.reason = ReasonCode::PolicyFlag;
                entry.detail = Some("target is no longer queued".into());
                return Ok(entry);
            }
            Some(row) if row.bucket == Bucket::Red => {
                tally.pitched += 1;
                entry.reason = ReasonCode::PolicyFlag;
                entry.detail = Some("target was reclassified RED after screening".into());
                return Ok(entry);
            }
            Some(_) => {}
        }

        if index.contains(&hash) {
            let duplicate = CurioError::DuplicateContent {
                content_hash: hash.clone(),
            };
            debug!(target_id, error = %duplicate, "dropping duplicate");
            tally.duplicates += 1;
            entry.disposition = Disposition::Duplicate;
            entry.reason = ReasonCode::Duplicate;
            entry.detail = Some(duplicate.to_string());
            return Ok(entry);
        }

        let writer = match writers.entry(record.pool) {
            std::collections::btree_map::Entry::Occupied(slot) => slot.into_mut(),
            std::collections::btree_map::Entry::Vacant(slot) => slot.insert(
                ShardWriter::open(
                    self.config.combined_dir(),
                    record.pool.as_str(),
                    self.config.sharding.limits(),
                )
                .map_err(output_error)?,
            ),
        };
        let shard_ref: ShardRef = writer.write(&record).map_err(output_error)?;
        index.insert(&hash);
        tally.accepted += 1;
        tally.shards.insert(shard_ref.shard.clone());
        entry.disposition = Disposition::Accepted;
        entry.reason = ReasonCode::Ok;
        entry.shard = Some(shard_ref);
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curio_core::{ManualSpec, Routing, StrategyDescriptor};
    use curio_storage::{MemoryStageStore, ShardLimits};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn record(target_id: &str, hash: &str, bucket: Bucket) -> CanonicalRecord {
        CanonicalRecord {
            record_id: CanonicalRecord::derive_id(target_id, hash),
            target_id: target_id.into(),
            content_hash: hash.into(),
            pool: OutputPool::Permissive,
            bucket,
            license: Some("MIT".into()),
            title: None,
            text: Some(format!("text {hash}")),
            asset: None,
            source_path: "data.jsonl#L1".into(),
            routing: Routing::default(),
        }
    }

    fn queue_row(target_id: &str, bucket: Bucket) -> QueueRow {
        QueueRow {
            target_id: target_id.into(),
            bucket,
            output_pool: OutputPool::Permissive,
            license_spdx: Some("MIT".into()),
            license_confidence: 1.0,
            manual_review: false,
            review_reasons: vec![],
            evidence_sha256: None,
            evidence_changed: false,
            routing: Routing::default(),
            screener: "text_jsonl".into(),
            download: StrategyDescriptor::Manual(ManualSpec {
                path: PathBuf::from("/nonexistent"),
            }),
            classified_at: Utc::now(),
        }
    }

    /// Write one screened shard for `bucket` and mark each target's screen stage DONE.
    fn seed(config: &PipelineConfig, stages: &dyn StageStore, bucket: Bucket, records: &[CanonicalRecord]) {
        let dir = config.screened_dir().join(bucket.as_str());
        let mut writer = ShardWriter::open(&dir, "permissive", ShardLimits::default()).unwrap();
        for r in records {
            writer.write(r).unwrap();
        }
        let closed = writer.finish().unwrap();
        let bytes = std::fs::read(&closed[0].path).unwrap();
        let file = FileRecord {
            path: format!("{}/{}", bucket.as_str(), closed[0].name),
            sha256: sha256_hex(&bytes),
            bytes: bytes.len() as u64,
        };
        let targets: BTreeSet<&str> = records.iter().map(|r| r.target_id.as_str()).collect();
        for target in targets {
            let done = StageManifest::begin(None, target, Stage::Screen, Utc::now())
                .unwrap()
                .complete(vec![file.clone()], Utc::now())
                .unwrap();
            stages.save(&done).unwrap();
        }
    }

    fn combined(config: &PipelineConfig) -> Vec<CanonicalRecord> {
        closed_shards(&config.combined_dir(), "permissive")
            .unwrap()
            .into_iter()
            .flat_map(|(_, path)| read_shard::<CanonicalRecord>(&path).unwrap())
            .collect()
    }

    #[test]
    fn green_wins_over_yellow_and_duplicates_are_ledgered() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            workspace_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let stages = MemoryStageStore::new();
        seed(&config, &stages, Bucket::Yellow, &[record("y1", "h1", Bucket::Yellow)]);
        seed(
            &config,
            &stages,
            Bucket::Green,
            &[record("g1", "h1", Bucket::Green), record("g1", "h2", Bucket::Green)],
        );
        let rows = BTreeMap::from([
            ("g1".to_string(), queue_row("g1", Bucket::Green)),
            ("y1".to_string(), queue_row("y1", Bucket::Yellow)),
        ]);

        let engine = MergeEngine {
            config: &config,
            stages: &stages,
        };
        let reports = engine.run(Uuid::new_v4(), &rows, true).unwrap();
        let outcome = |id: &str| reports.iter().find(|r| r.target_id == id).unwrap().outcome.clone();
        assert_eq!(
            outcome("g1"),
            MergeOutcome::Done { accepted: 2, duplicates: 0, pitched: 0 }
        );
        assert_eq!(
            outcome("y1"),
            MergeOutcome::Done { accepted: 0, duplicates: 1, pitched: 0 }
        );

        let merged = combined(&config);
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().all(|r| r.target_id == "g1"));

        let ledger = Ledger::replay(&config.ledger_dir().join(MERGE_LEDGER)).unwrap();
        assert_eq!(ledger.len(), 3);
        assert_eq!(
            ledger.iter().filter(|e| e.disposition == Disposition::Duplicate).count(),
            1
        );

        // Nothing left to merge; output is untouched.
        let again = engine.run(Uuid::new_v4(), &rows, true).unwrap();
        assert!(again.iter().all(|r| r.outcome == MergeOutcome::AlreadyDone));
        assert_eq!(combined(&config), merged);
    }

    #[test]
    fn later_runs_dedup_against_existing_combined_output() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            workspace_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let stages = MemoryStageStore::new();
        let engine = MergeEngine {
            config: &config,
            stages: &stages,
        };
        seed(&config, &stages, Bucket::Green, &[record("a", "h1", Bucket::Green)]);
        let rows = BTreeMap::from([
            ("a".to_string(), queue_row("a", Bucket::Green)),
            ("b".to_string(), queue_row("b", Bucket::Green)),
        ]);
        engine.run(Uuid::new_v4(), &rows, true).unwrap();

        seed(&config, &stages, Bucket::Green, &[record("b", "h1", Bucket::Green)]);
        let reports = engine.run(Uuid::new_v4(), &rows, true).unwrap();
        let b = reports.iter().find(|r| r.target_id == "b").unwrap();
        assert_eq!(
            b.outcome,
            MergeOutcome::Done { accepted: 0, duplicates: 1, pitched: 0 }
        );
        assert_eq!(combined(&config).len(), 1);
    }

    #[test]
    fn red_targets_and_dry_runs_do_not_reach_combined_output() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            workspace_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let stages = MemoryStageStore::new();
        seed(&config, &stages, Bucket::Green, &[record("r", "h9", Bucket::Green)]);
        let rows = BTreeMap::from([("r".to_string(), queue_row("r", Bucket::Red))]);
        let engine = MergeEngine {
            config: &config,
            stages: &stages,
        };

        let planned = engine.run(Uuid::new_v4(), &rows, false).unwrap();
        assert_eq!(planned[0].outcome, MergeOutcome::Planned);
        assert!(stages.load("r", Stage::Merge).unwrap().is_none());

        let reports = engine.run(Uuid::new_v4(), &rows, true).unwrap();
        assert_eq!(
            reports[0].outcome,
            MergeOutcome::Done { accepted: 0, duplicates: 0, pitched: 1 }
        );
        assert!(combined(&config).is_empty());
        let ledger = Ledger::replay(&config.ledger_dir().join(MERGE_LEDGER)).unwrap();
        assert_eq!(ledger[0].reason, ReasonCode::PolicyFlag);
    }

    #[test]
    fn changed_screened_shard_is_quarantined_not_retried() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            workspace_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let stages = MemoryStageStore::new();
        seed(&config, &stages, Bucket::Green, &[record("g1", "h1", Bucket::Green)]);
        let mut screened = stages.load("g1", Stage::Screen).unwrap().unwrap();
        screened.files[0].sha256 = sha256_hex(b"something else");
        stages.save(&screened).unwrap();
        let rows = BTreeMap::from([("g1".to_string(), queue_row("g1", Bucket::Green))]);
        let engine = MergeEngine {
            config: &config,
            stages: &stages,
        };

        let first = engine.run(Uuid::new_v4(), &rows, true).unwrap();
        assert!(matches!(first[0].outcome, MergeOutcome::Failed { ref reason } if reason.starts_with("integrity")));
        let failed = stages.load("g1", Stage::Merge).unwrap().unwrap();
        assert_eq!(failed.attempts, 1);

        let again = engine.run(Uuid::new_v4(), &rows, true).unwrap();
        assert!(matches!(again[0].outcome, MergeOutcome::Quarantined { .. }));
        assert_eq!(stages.load("g1", Stage::Merge).unwrap().unwrap(), failed);
        assert!(combined(&config).is_empty());
    }

    #[test]
    fn exhausted_merge_attempts_hit_the_retry_limit() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            workspace_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let stages = MemoryStageStore::new();
        seed(&config, &stages, Bucket::Green, &[record("g1", "h1", Bucket::Green)]);
        let mut failed = StageManifest::pending("g1", Stage::Merge, Utc::now());
        for _ in 0..config.acquisition.max_run_retries {
            failed = StageManifest::begin(Some(&failed), "g1", Stage::Merge, Utc::now())
                .unwrap()
                .fail("io: disk full", Utc::now())
                .unwrap();
        }
        stages.save(&failed).unwrap();
        let rows = BTreeMap::from([("g1".to_string(), queue_row("g1", Bucket::Green))]);
        let engine = MergeEngine {
            config: &config,
            stages: &stages,
        };

        let reports = engine.run(Uuid::new_v4(), &rows, true).unwrap();
        assert_eq!(
            reports[0].outcome,
            MergeOutcome::RetryLimit {
                attempts: 3,
                reason: Some("io: disk full".into())
            }
        );
        assert!(combined(&config).is_empty());
    }

    #[test]
    fn record_without_target_id_is_ledgered_as_a_parse_error() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            workspace_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let stages = MemoryStageStore::new();
        let shard_dir = config.screened_dir().join("green");
        let mut writer = ShardWriter::open(&shard_dir, "permissive", ShardLimits::default()).unwrap();
        writer
            .write(&serde_json::json!({"content_hash": "h0", "text": "orphan"}))
            .unwrap();
        writer.write(&record("g1", "h1", Bucket::Green)).unwrap();
        let closed = writer.finish().unwrap();
        let bytes = std::fs::read(&closed[0].path).unwrap();
        let done = StageManifest::begin(None, "g1", Stage::Screen, Utc::now())
            .unwrap()
            .complete(
                vec![FileRecord {
                    path: format!("green/{}", closed[0].name),
                    sha256: sha256_hex(&bytes),
                    bytes: bytes.len() as u64,
                }],
                Utc::now(),
            )
            .unwrap();
        stages.save(&done).unwrap();
        let rows = BTreeMap::from([("g1".to_string(), queue_row("g1", Bucket::Green))]);
        let engine = MergeEngine {
            config: &config,
            stages: &stages,
        };

        let reports = engine.run(Uuid::new_v4(), &rows, true).unwrap();
        assert_eq!(
            reports[0].outcome,
            MergeOutcome::Done { accepted: 1, duplicates: 0, pitched: 0 }
        );
        let ledger = Ledger::replay(&config.ledger_dir().join(MERGE_LEDGER)).unwrap();
        assert_eq!(ledger.len(), 2);
        let orphan = ledger
            .iter()
            .find(|e| e.reason == ReasonCode::ParseError)
            .unwrap();
        assert!(orphan.target_id.is_empty());
        assert_eq!(orphan.disposition, Disposition::Pitched);
        assert_eq!(
            orphan.source_path.as_deref(),
            Some(format!("green/{}#L1", closed[0].name).as_str())
        );
    }
}
