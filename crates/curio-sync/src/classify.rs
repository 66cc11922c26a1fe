//! License-risk classification: evidence capture, SPDX normalisation,
//! denylist scoring and queue routing.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use curio_core::{
    Bucket, CurioError, EvidenceSnapshot, LicenseProfile, OutputPool, QueueRow, Target,
};
use curio_storage::{safe_component, sha256_hex, HttpFetcher};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{LicensingConfig, PipelineConfig};
use crate::control::{with_backoff, CancelSignal};

/// Evidence text kept on a snapshot for rescoring in no-fetch runs.
const MAX_EVIDENCE_TEXT: usize = 64 * 1024;

const BUILTIN_ALIASES: [(&str, &str); 28] = [
    ("mit license", "MIT"),
    ("the mit license", "MIT"),
    ("apache 2.0", "Apache-2.0"),
    ("apache-2", "Apache-2.0"),
    ("apache license 2.0", "Apache-2.0"),
    ("apache license version 2.0", "Apache-2.0"),
    ("bsd 2-clause", "BSD-2-Clause"),
    ("bsd 3-clause", "BSD-3-Clause"),
    ("cc0", "CC0-1.0"),
    ("cc0 1.0", "CC0-1.0"),
    ("cc0 1.0 universal", "CC0-1.0"),
    ("cc by 4.0", "CC-BY-4.0"),
    ("cc-by 4.0", "CC-BY-4.0"),
    ("creative commons attribution 4.0", "CC-BY-4.0"),
    ("cc by-sa 4.0", "CC-BY-SA-4.0"),
    ("cc-by-sa 4.0", "CC-BY-SA-4.0"),
    ("creative commons attribution-sharealike 4.0", "CC-BY-SA-4.0"),
    ("cc by-nc 4.0", "CC-BY-NC-4.0"),
    ("cc-by-nc 4.0", "CC-BY-NC-4.0"),
    ("cc by-nd 4.0", "CC-BY-ND-4.0"),
    ("gplv2", "GPL-2.0-only"),
    ("gpl-2.0", "GPL-2.0-only"),
    ("gplv3", "GPL-3.0-only"),
    ("gpl-3.0", "GPL-3.0-only"),
    ("lgpl-3.0", "LGPL-3.0-only"),
    ("agpl-3.0", "AGPL-3.0-only"),
    ("mpl 2.0", "MPL-2.0"),
    ("odbl", "ODbL-1.0"),
];

/// Lowercase, fold `_`/`,` to spaces and collapse whitespace.
pub fn normalize_phrase(raw: &str) -> String {
    raw.to_lowercase()
        .replace(['_', ','], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whole-term containment: the match may not touch alphanumerics on either side.
pub(crate) fn contains_term(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    haystack.match_indices(needle).any(|(start, matched)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + matched.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseClass {
    Allow,
    Conditional,
    Deny,
    Unknown,
}

impl LicenseClass {
    fn bucket(self) -> Bucket {
        match self {
            LicenseClass::Allow => Bucket::Green,
            LicenseClass::Conditional | LicenseClass::Unknown => Bucket::Yellow,
            LicenseClass::Deny => Bucket::Red,
        }
    }
}

/// Heuristic SPDX resolution. Never authoritative; ambiguity lowers confidence.
#[derive(Debug, Clone)]
pub struct LicenseResolver {
    config: LicensingConfig,
    /// normalised phrase -> canonical id, configured aliases first.
    aliases: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub spdx: Option<String>,
    pub bucket: Bucket,
    pub confidence: f64,
    pub manual_review: bool,
    pub reasons: Vec<String>,
}

impl LicenseResolver {
    pub fn new(config: &LicensingConfig) -> Self {
        let mut aliases: Vec<(String, String)> = config
            .aliases
            .iter()
            .map(|(k, v)| (normalize_phrase(k), v.clone()))
            .collect();
        aliases.extend(
            BUILTIN_ALIASES
                .iter()
                .map(|(k, v)| (normalize_phrase(k), v.to_string())),
        );
        Self {
            config: config.clone(),
            aliases,
        }
    }

    fn known_ids(&self) -> impl Iterator<Item = &String> {
        self.config
            .spdx_allow
            .iter()
            .chain(&self.config.spdx_conditional)
            .chain(&self.config.spdx_deny)
    }

    /// Map a free-form license name onto a canonical SPDX id.
    pub fn normalize(&self, raw: &str) -> Option<String> {
        let key = normalize_phrase(raw);
        if key.is_empty() {
            return None;
        }
        if let Some(id) = self.known_ids().find(|id| normalize_phrase(id) == key) {
            return Some(id.clone());
        }
        self.aliases
            .iter()
            .find(|(alias, _)| *alias == key)
            .map(|(_, id)| id.clone())
    }

    pub fn class_of(&self, spdx: &str) -> LicenseClass {
        let matches = |list: &[String]| list.iter().any(|id| id.eq_ignore_ascii_case(spdx));
        if matches(&self.config.spdx_deny) {
            LicenseClass::Deny
        } else if matches(&self.config.spdx_conditional) {
            LicenseClass::Conditional
        } else if matches(&self.config.spdx_allow) {
            LicenseClass::Allow
        } else {
            LicenseClass::Unknown
        }
    }

    /// SPDX ids named in normalised evidence text.
    pub fn detect(&self, text: &str) -> BTreeSet<String> {
        if let Some(rest) = text.split("spdx-license-identifier:").nth(1) {
            let token = rest.split_whitespace().next().unwrap_or_default();
            if let Some(id) = self.normalize(token) {
                return BTreeSet::from([id]);
            }
        }
        let mut found: BTreeSet<String> = self
            .known_ids()
            .filter(|id| contains_term(text, &normalize_phrase(id)))
            .cloned()
            .collect();
        found.extend(
            self.aliases
                .iter()
                .filter(|(alias, _)| contains_term(text, alias))
                .map(|(_, id)| id.clone()),
        );
        found
    }

    /// Score a target's declared license against its (normalised) evidence text.
    pub fn assess(&self, target: &Target, evidence: Option<&str>) -> Assessment {
        let mut reasons = Vec::new();
        let mut manual_review = false;
        let detected = evidence.map(|text| self.detect(text)).unwrap_or_default();
        let hint = target.license.spdx_hint.as_deref();

        let declared = hint.map(|raw| (raw, self.normalize(raw)));
        let (spdx, mut confidence): (Option<String>, f64) = match declared {
            Some((_, Some(id))) => match evidence {
                None => (Some(id), 0.7),
                Some(_) if detected.is_empty() => {
                    reasons.push(format!("evidence does not name declared license {id}"));
                    (Some(id), 0.6)
                }
                Some(_) if detected.contains(&id) && detected.len() == 1 => (Some(id), 1.0),
                Some(_) if detected.contains(&id) => {
                    reasons.push(format!("evidence names several licenses: {detected:?}"));
                    (Some(id), 0.6)
                }
                Some(_) => {
                    manual_review = true;
                    reasons.push(format!(
                        "declared license {id} not found in evidence, which names {detected:?}"
                    ));
                    (Some(id), 0.3)
                }
            },
            Some((raw, None)) => {
                reasons.push(format!("unrecognised license hint {raw:?}"));
                match detected.len() {
                    1 => (detected.iter().next().cloned(), 0.5),
                    _ => (None, 0.0),
                }
            }
            None => match detected.len() {
                0 => {
                    reasons.push("no license declared or detected".to_string());
                    (None, 0.0)
                }
                1 => (detected.iter().next().cloned(), 0.8),
                _ => {
                    // Several candidates: take the most restrictive reading.
                    reasons.push(format!("evidence names several licenses: {detected:?}"));
                    let strictest = detected
                        .iter()
                        .max_by_key(|id| self.class_of(id).bucket())
                        .cloned();
                    (strictest, 0.3)
                }
            },
        };

        let class = spdx
            .as_deref()
            .map(|id| self.class_of(id))
            .unwrap_or(LicenseClass::Unknown);
        let mut bucket = class.bucket();
        match target.license.profile {
            LicenseProfile::Deny => bucket = Bucket::Red,
            LicenseProfile::RecordLevel => bucket = bucket.stricter(Bucket::Yellow),
            _ => {}
        }

        if let Some(text) = evidence {
            let hits: Vec<_> = self
                .config
                .denylist
                .iter()
                .filter(|rule| contains_term(text, &normalize_phrase(&rule.phrase)))
                .collect();
            for rule in &hits {
                bucket = bucket.stricter(rule.severity.bucket());
                confidence -= 0.2;
                reasons.push(format!(
                    "denylist phrase {:?} ({})",
                    rule.phrase,
                    rule.severity.bucket()
                ));
            }
            if !hits.is_empty() && class == LicenseClass::Allow {
                manual_review = true;
                reasons.push(format!(
                    "denylist matches conflict with allowlisted {}",
                    spdx.as_deref().unwrap_or_default()
                ));
            }
        }

        let confidence = confidence.clamp(0.0, 1.0);
        if bucket == Bucket::Green && confidence < self.config.min_license_confidence {
            bucket = Bucket::Yellow;
            reasons.push(format!(
                "license confidence {confidence:.2} below {:.2}",
                self.config.min_license_confidence
            ));
        }

        Assessment {
            spdx,
            bucket,
            confidence,
            manual_review,
            reasons,
        }
    }

    pub fn output_pool(&self, target: &Target) -> OutputPool {
        target
            .output_pool
            .or_else(|| self.config.profile_pools.get(&target.license.profile).copied())
            .unwrap_or(OutputPool::Quarantine)
    }
}

/// Append-only evidence snapshots, one JSON-lines file per target.
#[derive(Debug, Clone)]
pub struct EvidenceStore {
    dir: PathBuf,
}

impl EvidenceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, target_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", safe_component(target_id)))
    }

    pub fn append(&self, snapshot: &EvidenceSnapshot) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.path_for(&snapshot.target_id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        let mut line = serde_json::to_vec(snapshot).context("serializing evidence snapshot")?;
        line.push(b'\n');
        file.write_all(&line)
            .with_context(|| format!("appending to {}", path.display()))?;
        file.sync_data()
            .with_context(|| format!("syncing {}", path.display()))
    }

    pub fn history(&self, target_id: &str) -> Result<Vec<EvidenceSnapshot>> {
        let path = self.path_for(target_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| format!("reading {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(
                serde_json::from_str(&line).with_context(|| format!("parsing {}", path.display()))?,
            );
        }
        Ok(out)
    }

    pub fn latest(&self, target_id: &str) -> Result<Option<EvidenceSnapshot>> {
        Ok(self.history(target_id)?.pop())
    }
}

/// `<queues>/<bucket>_queue.jsonl`, rewritten atomically per classification pass.
#[derive(Debug, Clone)]
pub struct QueueStore {
    dir: PathBuf,
}

const QUEUE_BUCKETS: [Bucket; 3] = [Bucket::Green, Bucket::Yellow, Bucket::Red];

impl QueueStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, bucket: Bucket) -> PathBuf {
        self.dir.join(format!("{}_queue.jsonl", bucket.as_str()))
    }

    /// Rows by target id. A target listed in several queues keeps its strictest row.
    pub fn load_all(&self) -> Result<BTreeMap<String, QueueRow>> {
        let mut rows = BTreeMap::new();
        for bucket in QUEUE_BUCKETS {
            for row in Self::read(&self.path_for(bucket))? {
                rows.insert(row.target_id.clone(), row);
            }
        }
        Ok(rows)
    }

    fn read(path: &Path) -> Result<Vec<QueueRow>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("parsing {} row {}", path.display(), i + 1))
            })
            .collect()
    }

    pub fn write_all(&self, rows: &BTreeMap<String, QueueRow>) -> Result<()> {
        fs::create_dir_all(&self.dir).with_context(|| format!("creating {}", self.dir.display()))?;
        for bucket in QUEUE_BUCKETS {
            let mut body = Vec::new();
            for row in rows.values().filter(|row| row.bucket == bucket) {
                serde_json::to_writer(&mut body, row).context("serializing queue row")?;
                body.push(b'\n');
            }
            let path = self.path_for(bucket);
            let temp = self.dir.join(format!(".{}.{}.tmp", bucket.as_str(), Uuid::new_v4()));
            fs::write(&temp, &body).with_context(|| format!("writing {}", temp.display()))?;
            fs::rename(&temp, &path)
                .with_context(|| format!("renaming {} -> {}", temp.display(), path.display()))?;
        }
        Ok(())
    }
}

struct CapturedEvidence {
    url: Option<String>,
    sha256: String,
    headers: BTreeMap<String, String>,
    text: Option<String>,
}

fn clip(mut text: String) -> String {
    if text.len() > MAX_EVIDENCE_TEXT {
        let mut cut = MAX_EVIDENCE_TEXT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

/// Resolves targets into queue rows. Evidence fetch failures never abort;
/// they push the bucket toward YELLOW instead.
pub struct Classifier<'a> {
    pub config: &'a PipelineConfig,
    pub resolver: &'a LicenseResolver,
    pub http: &'a HttpFetcher,
    pub evidence: &'a EvidenceStore,
    pub cancel: &'a CancelSignal,
}

impl Classifier<'_> {
    pub async fn classify(
        &self,
        run_id: Uuid,
        target: &Target,
        no_fetch: bool,
        now: DateTime<Utc>,
    ) -> Result<QueueRow, CurioError> {
        let prior = self
            .evidence
            .latest(&target.id)
            .map_err(|e| CurioError::io(format!("evidence history for {}", target.id), format!("{e:#}")))?;

        let mut reasons = Vec::new();
        let mut manual_review = false;
        let mut floor = Bucket::Green;

        if no_fetch && prior.is_none() {
            floor = Bucket::Yellow;
            reasons.push("no-fetch run without a prior evidence snapshot".to_string());
        }

        let captured = match (&target.license.evidence_url, &target.license.evidence_text) {
            (Some(url), _) if no_fetch => prior.as_ref().map(|p| CapturedEvidence {
                url: Some(url.clone()),
                sha256: p.sha256.clone(),
                headers: p.headers.clone(),
                text: p.text.clone(),
            }),
            (Some(url), _) => {
                let backoff = self.config.acquisition.backoff();
                let fetched = with_backoff(&backoff, self.cancel, &target.id, move |_| async move {
                    self.http
                        .fetch_bytes(run_id, url)
                        .await
                        .map_err(|e| e.into_curio(url))
                })
                .await;
                match fetched {
                    Ok(resp) => Some(CapturedEvidence {
                        url: Some(resp.final_url),
                        sha256: sha256_hex(&resp.body),
                        headers: resp.headers,
                        text: Some(clip(normalize_phrase(&String::from_utf8_lossy(&resp.body)))),
                    }),
                    Err(err) => {
                        warn!(target_id = %target.id, error = %err, "evidence fetch failed");
                        floor = floor.stricter(Bucket::Yellow);
                        manual_review = true;
                        reasons.push(format!("evidence fetch failed: {}", err.diagnostic()));
                        // Score against the last known text, but never above YELLOW.
                        prior.as_ref().map(|p| CapturedEvidence {
                            url: Some(url.clone()),
                            sha256: p.sha256.clone(),
                            headers: p.headers.clone(),
                            text: p.text.clone(),
                        })
                    }
                }
            }
            (None, Some(text)) => Some(CapturedEvidence {
                url: None,
                sha256: sha256_hex(text.as_bytes()),
                headers: BTreeMap::new(),
                text: Some(clip(normalize_phrase(text))),
            }),
            (None, None) => None,
        };

        let assessment = self
            .resolver
            .assess(target, captured.as_ref().and_then(|c| c.text.as_deref()));
        reasons.extend(assessment.reasons.iter().cloned());
        manual_review |= assessment.manual_review;
        let mut bucket = assessment.bucket.stricter(floor);

        let sha256 = captured
            .as_ref()
            .map(|c| c.sha256.clone())
            .unwrap_or_else(|| sha256_hex(b""));
        let mut evidence_changed = false;
        if let Some(prior) = &prior {
            if prior.sha256 != sha256 {
                evidence_changed = true;
                manual_review = true;
                reasons.push(format!("evidence changed since {}", prior.captured_at.to_rfc3339()));
                bucket = bucket.stricter(Bucket::Yellow);
            }
            if prior.bucket == Bucket::Red && bucket != Bucket::Red {
                bucket = Bucket::Red;
                manual_review = true;
                reasons.push("previously classified RED; not reclassified automatically".to_string());
            }
        }

        let snapshot = EvidenceSnapshot {
            target_id: target.id.clone(),
            url: captured.as_ref().and_then(|c| c.url.clone()),
            sha256: sha256.clone(),
            captured_at: now,
            headers: captured.as_ref().map(|c| c.headers.clone()).unwrap_or_default(),
            bucket,
            spdx: assessment.spdx.clone(),
            text: captured.and_then(|c| c.text),
        };
        self.evidence
            .append(&snapshot)
            .map_err(|e| CurioError::io(format!("evidence snapshot for {}", target.id), format!("{e:#}")))?;

        let row = QueueRow {
            target_id: target.id.clone(),
            bucket,
            output_pool: self.resolver.output_pool(target),
            license_spdx: assessment.spdx,
            license_confidence: assessment.confidence,
            manual_review,
            review_reasons: reasons,
            evidence_sha256: Some(sha256),
            evidence_changed,
            routing: target.routing.clone(),
            screener: target.screener.clone(),
            download: target.download.clone(),
            classified_at: now,
        };
        if row.manual_review {
            info!(target_id = %row.target_id, bucket = %row.bucket, reasons = ?row.review_reasons, "classified; needs review");
        } else {
            debug!(target_id = %row.target_id, bucket = %row.bucket, pool = %row.output_pool, "classified");
        }
        Ok(row)
    }
}
