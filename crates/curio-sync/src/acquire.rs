//! Acquisition: drains classified rows into raw payload storage, one
//! checkpointed stage record per target.

use std::path::{Path, PathBuf};

use chrono::Utc;
use curio_adapters::{strategy_for, FetchContext, FetchedFile};
use curio_core::{CurioError, FileRecord, QueueRow, Stage, StageManifest};
use curio_storage::{
    extract_archive, verify_checksum, ArchiveKind, HttpFetcher, PayloadStore, StageStore,
};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::control::{held_back, with_backoff, CancelSignal, HeldBack};

#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    Done { files: usize },
    AlreadyDone,
    /// Prior stage has no done-marker.
    Blocked,
    /// FAILED in `attempts` runs; left for manual intervention.
    RetryLimit { attempts: u32, reason: Option<String> },
    /// Last attempt failed an integrity check; not retried until its state is cleared.
    Quarantined { reason: String },
    Planned,
    /// Fetched under a file cap; kept on disk but not checkpointed, so an
    /// uncapped run fetches the whole payload.
    Sampled { files: usize },
    Cancelled,
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct AcquireReport {
    pub target_id: String,
    pub outcome: AcquireOutcome,
}

pub struct AcquisitionEngine<'a> {
    pub config: &'a PipelineConfig,
    pub http: &'a HttpFetcher,
    pub store: &'a PayloadStore,
    pub stages: &'a dyn StageStore,
    pub cancel: &'a CancelSignal,
}

fn state_error(err: anyhow::Error) -> CurioError {
    CurioError::Io(format!("stage state: {err:#}"))
}

/// Paths in the done-marker are relative to the raw root, so screening can
/// find a payload even if the row's bucket is tightened later.
fn root_relative(store: &PayloadStore, dest: &Path, rel: &str) -> String {
    let full = dest.join(rel);
    full.strip_prefix(store.root())
        .unwrap_or(&full)
        .to_string_lossy()
        .replace('\\', "/")
}

impl AcquisitionEngine<'_> {
    pub async fn run(
        &self,
        run_id: Uuid,
        rows: Vec<QueueRow>,
        execute: bool,
        workers: usize,
        max_files: Option<usize>,
    ) -> Vec<AcquireReport> {
        stream::iter(rows)
            .map(|row| async move {
                let span = info_span!("acquire", target_id = %row.target_id, bucket = %row.bucket);
                let outcome = self
                    .acquire(run_id, &row, execute, max_files)
                    .instrument(span)
                    .await;
                AcquireReport {
                    target_id: row.target_id,
                    outcome,
                }
            })
            .buffer_unordered(workers.max(1))
            .collect()
            .await
    }

    /// One target. Per-target failures are recorded, never propagated.
    pub async fn acquire(
        &self,
        run_id: Uuid,
        row: &QueueRow,
        execute: bool,
        max_files: Option<usize>,
    ) -> AcquireOutcome {
        match self.acquire_inner(run_id, row, execute, max_files).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(target_id = %row.target_id, error = %err, "acquisition bookkeeping failed");
                AcquireOutcome::Failed {
                    reason: err.diagnostic(),
                }
            }
        }
    }

    async fn acquire_inner(
        &self,
        run_id: Uuid,
        row: &QueueRow,
        execute: bool,
        max_files: Option<usize>,
    ) -> Result<AcquireOutcome, CurioError> {
        let classified = self
            .stages
            .load(&row.target_id, Stage::Classify)
            .map_err(state_error)?;
        if !classified.as_ref().is_some_and(StageManifest::is_done) || !row.bucket.is_acquirable() {
            return Ok(AcquireOutcome::Blocked);
        }

        let prior = self
            .stages
            .load(&row.target_id, Stage::Acquire)
            .map_err(state_error)?;
        if let Some(prior) = &prior {
            if prior.is_done() {
                debug!("acquire_done present; skipping");
                return Ok(AcquireOutcome::AlreadyDone);
            }
            match held_back(prior, self.config.acquisition.max_run_retries) {
                Some(HeldBack::Quarantined { reason }) => {
                    return Ok(AcquireOutcome::Quarantined { reason })
                }
                Some(HeldBack::RetryLimit { attempts, reason }) => {
                    return Ok(AcquireOutcome::RetryLimit { attempts, reason })
                }
                None => {}
            }
        }
        if !execute {
            return Ok(AcquireOutcome::Planned);
        }
        if self.cancel.is_cancelled() {
            return Ok(AcquireOutcome::Cancelled);
        }

        let started = StageManifest::begin(prior.as_ref(), &row.target_id, Stage::Acquire, Utc::now())?;
        self.stages.save(&started).map_err(state_error)?;

        let dest = self
            .store
            .target_dir(row.bucket, row.output_pool, &row.target_id);
        // Puts the record back as it was, so the attempt does not count.
        let released = prior
            .clone()
            .unwrap_or_else(|| StageManifest::pending(&row.target_id, Stage::Acquire, Utc::now()));
        match self.fetch_and_verify(run_id, row, &dest, max_files).await {
            Ok((files, true)) => {
                self.stages.save(&released).map_err(state_error)?;
                info!(files = files.len(), "file cap reached; payload left unmarked");
                Ok(AcquireOutcome::Sampled { files: files.len() })
            }
            Err(CurioError::Cancelled) => {
                self.stages.save(&released).map_err(state_error)?;
                warn!("acquisition cancelled mid-retry; stage record restored");
                Ok(AcquireOutcome::Cancelled)
            }
            Ok((files, false)) => {
                let count = files.len();
                let done = started.complete(files, Utc::now())?;
                self.stages.save(&done).map_err(state_error)?;
                info!(files = count, "acquire_done");
                Ok(AcquireOutcome::Done { files: count })
            }
            Err(err) => {
                let reason = err.diagnostic();
                let failed = started.fail(reason.clone(), Utc::now())?;
                self.stages.save(&failed).map_err(state_error)?;
                warn!(reason = %reason, "acquisition failed");
                Ok(AcquireOutcome::Failed { reason })
            }
        }
    }

    /// Returns the verified files and whether the file cap may have cut the payload short.
    async fn fetch_and_verify(
        &self,
        run_id: Uuid,
        row: &QueueRow,
        dest: &Path,
        max_files: Option<usize>,
    ) -> Result<(Vec<FileRecord>, bool), CurioError> {
        let max_files = max_files.map(|limit| limit.max(1));
        let strategy = strategy_for(&row.download);
        let backoff = self.config.acquisition.backoff();
        let ctx = FetchContext {
            run_id,
            http: self.http,
            store: self.store,
            max_files,
        };

        let fetched = with_backoff(&backoff, self.cancel, &row.target_id, |attempt| {
            let ctx = &ctx;
            async move {
                // Every attempt starts from an empty directory; partial files never survive.
                self.store
                    .reset_target_dir(dest)
                    .await
                    .map_err(|e| CurioError::io(dest.display(), format!("{e:#}")))?;
                debug!(strategy = strategy.kind(), attempt = attempt + 1, "fetching");
                strategy.fetch(ctx, dest).await
            }
        })
        .await?;

        self.verify_and_extract(dest, &fetched).await?;

        let mut listed = PayloadStore::list_files(dest)
            .map_err(|e| CurioError::io(dest.display(), format!("{e:#}")))?;
        if listed.is_empty() {
            return Err(CurioError::permanent(
                row.download.kind(),
                "strategy produced no payload files",
            ));
        }
        // Strategies cap what they download, but clones and archives can
        // still leave more; the cap holds for what is on disk.
        let capped = max_files.is_some_and(|limit| listed.len() >= limit);
        if let Some(limit) = max_files {
            for extra in listed.iter().skip(limit) {
                let path = dest.join(&extra.path);
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| CurioError::io(path.display(), e))?;
            }
            listed.truncate(limit);
        }
        let files = listed
            .into_iter()
            .map(|record| FileRecord {
                path: root_relative(self.store, dest, &record.path),
                ..record
            })
            .collect();
        Ok((files, capped))
    }

    /// Checksums first, then archive extraction through the safety gate.
    async fn verify_and_extract(&self, dest: &Path, fetched: &[FetchedFile]) -> Result<(), CurioError> {
        for file in fetched {
            verify_checksum(
                &file.record.path,
                file.expected_sha256.as_deref(),
                &file.record.sha256,
            )?;
        }

        for file in fetched.iter().filter(|f| f.extract) {
            let archive = dest.join(&file.record.path);
            if ArchiveKind::detect(&archive).is_none() {
                return Err(CurioError::integrity(format!(
                    "{} is marked for extraction but is not a supported archive",
                    file.record.path
                )));
            }
            let out_dir: PathBuf = dest.join(format!("{}.d", file.record.path));
            let archive_for_task = archive.clone();
            let written = tokio::task::spawn_blocking(move || {
                extract_archive(&archive_for_task, &out_dir)
            })
            .await
            .map_err(|e| CurioError::io(archive.display(), e))??;
            debug!(archive = %archive.display(), files = written.len(), "extracted");
            // Only the extracted members are screened.
            tokio::fs::remove_file(&archive)
                .await
                .map_err(|e| CurioError::io(archive.display(), e))?;
        }
        Ok(())
    }
}
