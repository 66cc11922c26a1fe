//! Core domain model, stage-state machine and error taxonomy for curio.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "curio-core";

/// Risk classification of a target's license posture.
///
/// Variants are ordered from least to most restrictive so `max` picks the
/// stricter bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Bucket {
    Green,
    Yellow,
    Red,
}

impl Bucket {
    pub fn as_str(self) -> &'static str {
        match self {
            Bucket::Green => "green",
            Bucket::Yellow => "yellow",
            Bucket::Red => "red",
        }
    }

    pub fn stricter(self, other: Bucket) -> Bucket {
        self.max(other)
    }

    pub fn is_acquirable(self) -> bool {
        self != Bucket::Red
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output partition by license risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputPool {
    Permissive,
    Copyleft,
    Quarantine,
}

impl OutputPool {
    pub const ALL: [OutputPool; 3] = [
        OutputPool::Permissive,
        OutputPool::Copyleft,
        OutputPool::Quarantine,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OutputPool::Permissive => "permissive",
            OutputPool::Copyleft => "copyleft",
            OutputPool::Quarantine => "quarantine",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "permissive" => Some(OutputPool::Permissive),
            "copyleft" => Some(OutputPool::Copyleft),
            "quarantine" => Some(OutputPool::Quarantine),
            _ => None,
        }
    }
}

impl fmt::Display for OutputPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared license family of a target, used to pick a default output pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseProfile {
    Permissive,
    Copyleft,
    RecordLevel,
    Deny,
    #[default]
    Unknown,
}

impl LicenseProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            LicenseProfile::Permissive => "permissive",
            LicenseProfile::Copyleft => "copyleft",
            LicenseProfile::RecordLevel => "record_level",
            LicenseProfile::Deny => "deny",
            LicenseProfile::Unknown => "unknown",
        }
    }
}

/// Subject/domain hints carried from the inventory through to every record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Routing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// License metadata declared for a target in the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LicenseDeclaration {
    #[serde(default)]
    pub profile: LicenseProfile,
    #[serde(default)]
    pub spdx_hint: Option<String>,
    /// Page holding the license or terms text; fetched as evidence.
    #[serde(default)]
    pub evidence_url: Option<String>,
    /// Inline terms text, used when no evidence URL is declared.
    #[serde(default)]
    pub evidence_text: Option<String>,
}

/// One downloadable file declared by a URL-based strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub url: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub extract: bool,
}

/// One object addressed by key inside a bucket or hosted repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSpec {
    pub key: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub extract: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSpec {
    pub files: Vec<FileSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtpSpec {
    pub files: Vec<FileSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSpec {
    pub repo: String,
    #[serde(default)]
    pub rev: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Spec {
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Overrides the AWS virtual-host endpoint, e.g. for S3-compatible mirrors.
    #[serde(default)]
    pub endpoint: Option<String>,
    pub objects: Vec<ObjectSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HubRepoType {
    #[default]
    Dataset,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HuggingfaceSpec {
    pub repo_id: String,
    #[serde(default = "default_revision")]
    pub revision: String,
    #[serde(default)]
    pub repo_type: HubRepoType,
    /// Hub base URL; defaults to the public hub.
    #[serde(default)]
    pub endpoint: Option<String>,
    pub files: Vec<ObjectSpec>,
}

fn default_revision() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FigshareSpec {
    pub article_id: u64,
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualSpec {
    pub path: PathBuf,
}

/// Acquisition strategy descriptor, tagged by `strategy` in the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum StrategyDescriptor {
    Http(HttpSpec),
    Ftp(FtpSpec),
    Git(GitSpec),
    S3(S3Spec),
    Huggingface(HuggingfaceSpec),
    Figshare(FigshareSpec),
    Manual(ManualSpec),
}

impl StrategyDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            StrategyDescriptor::Http(_) => "http",
            StrategyDescriptor::Ftp(_) => "ftp",
            StrategyDescriptor::Git(_) => "git",
            StrategyDescriptor::S3(_) => "s3",
            StrategyDescriptor::Huggingface(_) => "huggingface",
            StrategyDescriptor::Figshare(_) => "figshare",
            StrategyDescriptor::Manual(_) => "manual",
        }
    }
}

pub fn default_screener() -> String {
    "text_jsonl".to_string()
}

fn default_true() -> bool {
    true
}

/// A named external source, immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub license: LicenseDeclaration,
    /// Explicit pool override; wins over the license-profile mapping.
    #[serde(default)]
    pub output_pool: Option<OutputPool>,
    #[serde(default)]
    pub routing: Routing,
    pub download: StrategyDescriptor,
    #[serde(default = "default_screener")]
    pub screener: String,
}

/// Captured license/terms evidence for a target. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSnapshot {
    pub target_id: String,
    #[serde(default)]
    pub url: Option<String>,
    pub sha256: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub bucket: Bucket,
    #[serde(default)]
    pub spdx: Option<String>,
    /// Normalised lowercase evidence text retained for rescoring in no-fetch runs.
    #[serde(default)]
    pub text: Option<String>,
}

/// A classified unit of work written to a bucket queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRow {
    pub target_id: String,
    pub bucket: Bucket,
    pub output_pool: OutputPool,
    #[serde(default)]
    pub license_spdx: Option<String>,
    pub license_confidence: f64,
    #[serde(default)]
    pub manual_review: bool,
    #[serde(default)]
    pub review_reasons: Vec<String>,
    #[serde(default)]
    pub evidence_sha256: Option<String>,
    #[serde(default)]
    pub evidence_changed: bool,
    #[serde(default)]
    pub routing: Routing,
    pub screener: String,
    pub download: StrategyDescriptor,
    pub classified_at: DateTime<Utc>,
}

/// Pipeline stages in their fixed execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Classify,
    Acquire,
    Screen,
    Merge,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Classify, Stage::Acquire, Stage::Screen, Stage::Merge];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Classify => "classify",
            Stage::Acquire => "acquire",
            Stage::Screen => "screen",
            Stage::Merge => "merge",
        }
    }

    pub fn marker_name(self) -> String {
        format!("{}_done", self.as_str())
    }

    pub fn previous(self) -> Option<Stage> {
        match self {
            Stage::Classify => None,
            Stage::Acquire => Some(Stage::Classify),
            Stage::Screen => Some(Stage::Acquire),
            Stage::Merge => Some(Stage::Screen),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per target, per stage state: `PENDING -> IN_PROGRESS -> DONE | FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageState {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl StageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StageState::Done | StageState::Failed)
    }

    /// FAILED may re-enter IN_PROGRESS on a retry; DONE never moves again.
    pub fn can_transition_to(self, next: StageState) -> bool {
        matches!(
            (self, next),
            (StageState::Pending, StageState::InProgress)
                | (StageState::InProgress, StageState::Done)
                | (StageState::InProgress, StageState::Failed)
                | (StageState::InProgress, StageState::InProgress)
                | (StageState::Failed, StageState::InProgress)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the target's payload directory.
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Persisted state record keyed by (target, stage).
///
/// When `state` is DONE this doubles as the stage's done-marker manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageManifest {
    pub target_id: String,
    pub stage: Stage,
    pub state: StageState,
    pub attempts: u32,
    #[serde(default)]
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files: Vec<FileRecord>,
}

impl StageManifest {
    pub fn pending(target_id: impl Into<String>, stage: Stage, now: DateTime<Utc>) -> Self {
        Self {
            target_id: target_id.into(),
            stage,
            state: StageState::Pending,
            attempts: 0,
            reason: None,
            updated_at: now,
            completed_at: None,
            files: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == StageState::Done
    }

    /// Start (or restart) the stage, carrying the attempt counter forward.
    pub fn begin(
        prior: Option<&StageManifest>,
        target_id: &str,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> Result<Self, CurioError> {
        let base = prior
            .cloned()
            .unwrap_or_else(|| StageManifest::pending(target_id, stage, now));
        base.transition(StageState::InProgress, now).map(|mut next| {
            next.attempts += 1;
            next.reason = None;
            next.files.clear();
            next.completed_at = None;
            next
        })
    }

    pub fn complete(self, files: Vec<FileRecord>, now: DateTime<Utc>) -> Result<Self, CurioError> {
        let mut next = self.transition(StageState::Done, now)?;
        next.files = files;
        next.completed_at = Some(now);
        next.reason = None;
        Ok(next)
    }

    pub fn fail(self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<Self, CurioError> {
        let mut next = self.transition(StageState::Failed, now)?;
        next.reason = Some(reason.into());
        Ok(next)
    }

    fn transition(mut self, next: StageState, now: DateTime<Utc>) -> Result<Self, CurioError> {
        if !self.state.can_transition_to(next) {
            return Err(CurioError::Config(format!(
                "illegal stage transition {:?} -> {:?} for {}/{}",
                self.state, next, self.target_id, self.stage
            )));
        }
        self.state = next;
        self.updated_at = now;
        Ok(self)
    }
}

/// Binary asset reference carried by asset-backed records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// The unit of value. Immutable once written to a shard.
///
/// Carries no wall-clock fields so that identical input yields identical shards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub record_id: Uuid,
    pub target_id: String,
    pub content_hash: String,
    pub pool: OutputPool,
    pub bucket: Bucket,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<AssetRef>,
    pub source_path: String,
    #[serde(default)]
    pub routing: Routing,
}

impl CanonicalRecord {
    /// Deterministic id derived from the source target and the content hash.
    pub fn derive_id(target_id: &str, content_hash: &str) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{target_id}:{content_hash}").as_bytes(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Accepted,
    Pitched,
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Ok,
    MissingLicense,
    DenylistMatch,
    LengthOutOfRange,
    SecretMatch,
    PolicyFlag,
    ParseError,
    EmptyPayload,
    UnreadablePayload,
    MissingHash,
    Duplicate,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::Ok => "ok",
            ReasonCode::MissingLicense => "missing_license",
            ReasonCode::DenylistMatch => "denylist_match",
            ReasonCode::LengthOutOfRange => "length_out_of_range",
            ReasonCode::SecretMatch => "secret_match",
            ReasonCode::PolicyFlag => "policy_flag",
            ReasonCode::ParseError => "parse_error",
            ReasonCode::EmptyPayload => "empty_payload",
            ReasonCode::UnreadablePayload => "unreadable_payload",
            ReasonCode::MissingHash => "missing_hash",
            ReasonCode::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location of a record inside a closed shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRef {
    pub shard: String,
    pub index: u32,
    pub line: u64,
}

/// Append-only audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub run_id: Uuid,
    pub target_id: String,
    #[serde(default)]
    pub content_hash: Option<String>,
    pub disposition: Disposition,
    pub reason: ReasonCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardRef>,
    pub recorded_at: DateTime<Utc>,
}

/// Error taxonomy shared by every stage.
#[derive(Debug, Error)]
pub enum CurioError {
    #[error("transient fetch error for {url}: {message}")]
    TransientFetch { url: String, message: String },
    #[error("fetch failed for {url}: {message}")]
    PermanentFetch { url: String, message: String },
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("policy violation ({code}): {detail}")]
    PolicyViolation { code: ReasonCode, detail: String },
    #[error("config error: {0}")]
    Config(String),
    #[error("duplicate content {content_hash}")]
    DuplicateContent { content_hash: String },
    #[error("I/O error: {0}")]
    Io(String),
    #[error("run cancelled")]
    Cancelled,
}

impl CurioError {
    pub fn transient(url: impl Into<String>, message: impl Into<String>) -> Self {
        CurioError::TransientFetch {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn permanent(url: impl Into<String>, message: impl Into<String>) -> Self {
        CurioError::PermanentFetch {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        CurioError::Integrity(message.into())
    }

    pub fn io(context: impl fmt::Display, err: impl fmt::Display) -> Self {
        CurioError::Io(format!("{context}: {err}"))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CurioError::TransientFetch { .. })
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            CurioError::TransientFetch { .. } => "transient_fetch",
            CurioError::PermanentFetch { .. } => "permanent_fetch",
            CurioError::Integrity(_) => "integrity",
            CurioError::PolicyViolation { .. } => "policy_violation",
            CurioError::Config(_) => "config",
            CurioError::DuplicateContent { .. } => "duplicate_content",
            CurioError::Io(_) => "io",
            CurioError::Cancelled => "cancelled",
        }
    }

    /// Diagnostic string recorded in manifests and ledgers.
    pub fn diagnostic(&self) -> String {
        format!("{}: {}", self.reason_code(), self)
    }
}
