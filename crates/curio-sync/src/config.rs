//! Immutable pipeline configuration, loaded once per run from YAML.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use curio_core::{Bucket, CurioError, LicenseProfile, OutputPool};
use curio_storage::{BackoffPolicy, BreakerConfig, HttpClientConfig, ShardLimits, TokenBucketConfig};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "curio.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Directory every relative path resolves against. Set by the loader.
    #[serde(skip)]
    pub workspace_root: PathBuf,
    pub targets_file: PathBuf,
    pub roots: RootsConfig,
    pub sharding: ShardingConfig,
    pub screening: ScreeningConfig,
    pub licensing: LicensingConfig,
    pub acquisition: AcquisitionConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            targets_file: PathBuf::from("targets.yaml"),
            roots: RootsConfig::default(),
            sharding: ShardingConfig::default(),
            screening: ScreeningConfig::default(),
            licensing: LicensingConfig::default(),
            acquisition: AcquisitionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RootsConfig {
    pub queues: PathBuf,
    pub evidence: PathBuf,
    pub raw: PathBuf,
    pub state: PathBuf,
    pub screened: PathBuf,
    pub combined: PathBuf,
    pub ledger: PathBuf,
    pub reports: PathBuf,
}

impl Default for RootsConfig {
    fn default() -> Self {
        Self {
            queues: PathBuf::from("queues"),
            evidence: PathBuf::from("evidence"),
            raw: PathBuf::from("raw"),
            state: PathBuf::from("state"),
            screened: PathBuf::from("screened"),
            combined: PathBuf::from("combined"),
            ledger: PathBuf::from("ledger"),
            reports: PathBuf::from("reports"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShardingConfig {
    pub max_records: u64,
    pub max_bytes: u64,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        let limits = ShardLimits::default();
        Self {
            max_records: limits.max_records,
            max_bytes: limits.max_bytes,
        }
    }
}

impl ShardingConfig {
    pub fn limits(&self) -> ShardLimits {
        ShardLimits {
            max_records: self.max_records,
            max_bytes: self.max_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScreeningConfig {
    pub min_chars: usize,
    pub max_chars: usize,
    /// Every record must carry its own license instead of inheriting the target's.
    pub require_record_license: bool,
    pub denylist_phrases: Vec<String>,
    pub secret_patterns: Vec<String>,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            min_chars: 1,
            max_chars: 2_000_000,
            require_record_license: false,
            denylist_phrases: Vec::new(),
            secret_patterns: vec![
                r"AKIA[0-9A-Z]{16}".to_string(),
                r"-----BEGIN (RSA |EC |OPENSSH )?PRIVATE KEY-----".to_string(),
                r"ghp_[A-Za-z0-9]{36}".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Yellow,
    Red,
}

impl Severity {
    pub fn bucket(self) -> Bucket {
        match self {
            Severity::Yellow => Bucket::Yellow,
            Severity::Red => Bucket::Red,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenylistRule {
    pub phrase: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
}

fn default_severity() -> Severity {
    Severity::Yellow
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LicensingConfig {
    pub min_license_confidence: f64,
    pub spdx_allow: Vec<String>,
    pub spdx_conditional: Vec<String>,
    pub spdx_deny: Vec<String>,
    /// Free-form license names mapped to SPDX ids; checked before the built-ins.
    pub aliases: BTreeMap<String, String>,
    pub denylist: Vec<DenylistRule>,
    /// Pool per license profile; profiles missing here resolve to quarantine.
    pub profile_pools: BTreeMap<LicenseProfile, OutputPool>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for LicensingConfig {
    fn default() -> Self {
        Self {
            min_license_confidence: 0.6,
            spdx_allow: strings(&[
                "MIT",
                "Apache-2.0",
                "BSD-2-Clause",
                "BSD-3-Clause",
                "ISC",
                "CC0-1.0",
                "CC-BY-4.0",
                "Unlicense",
                "PDDL-1.0",
                "ODC-By-1.0",
            ]),
            spdx_conditional: strings(&[
                "CC-BY-SA-4.0",
                "GPL-2.0-only",
                "GPL-3.0-only",
                "LGPL-3.0-only",
                "AGPL-3.0-only",
                "MPL-2.0",
                "ODbL-1.0",
            ]),
            spdx_deny: strings(&[
                "CC-BY-NC-4.0",
                "CC-BY-NC-SA-4.0",
                "CC-BY-ND-4.0",
                "CC-BY-NC-ND-4.0",
            ]),
            aliases: BTreeMap::new(),
            denylist: vec![
                DenylistRule {
                    phrase: "non-commercial".to_string(),
                    severity: Severity::Yellow,
                },
                DenylistRule {
                    phrase: "no derivatives".to_string(),
                    severity: Severity::Yellow,
                },
                DenylistRule {
                    phrase: "all rights reserved".to_string(),
                    severity: Severity::Yellow,
                },
                DenylistRule {
                    phrase: "may not be redistributed".to_string(),
                    severity: Severity::Red,
                },
                DenylistRule {
                    phrase: "no machine learning".to_string(),
                    severity: Severity::Red,
                },
            ],
            profile_pools: BTreeMap::from([
                (LicenseProfile::Permissive, OutputPool::Permissive),
                (LicenseProfile::Copyleft, OutputPool::Copyleft),
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AcquisitionConfig {
    pub workers: usize,
    /// Fetch attempts per target per run, including the first.
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub per_host_capacity: Option<u32>,
    pub per_host_refill_ms: u64,
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
    /// Runs a FAILED target is retried in before it is left for manual intervention.
    pub max_run_retries: u32,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            global_concurrency: 16,
            per_host_concurrency: 4,
            per_host_capacity: Some(8),
            per_host_refill_ms: 250,
            breaker_threshold: 5,
            breaker_cooldown_secs: 60,
            max_run_retries: 3,
            timeout_secs: 60,
            user_agent: format!("curio/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl AcquisitionConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.global_concurrency,
            per_host_concurrency: self.per_host_concurrency,
            per_host_bucket: self.per_host_capacity.map(|capacity| TokenBucketConfig {
                capacity,
                refill_every: Duration::from_millis(self.per_host_refill_ms),
            }),
            breaker: BreakerConfig {
                failure_threshold: self.breaker_threshold,
                cooldown: Duration::from_secs(self.breaker_cooldown_secs),
            },
        }
    }
}

fn config_error(context: impl std::fmt::Display, err: impl std::fmt::Display) -> CurioError {
    CurioError::Config(format!("{context}: {err}"))
}

impl PipelineConfig {
    /// Parse YAML and resolve relative paths against `workspace_root`.
    pub fn from_yaml(text: &str, workspace_root: impl Into<PathBuf>) -> Result<Self, CurioError> {
        let mut config: PipelineConfig =
            serde_yaml::from_str(text).map_err(|e| config_error("parsing pipeline config", e))?;
        config.workspace_root = workspace_root.into();
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or fall back to defaults when it does not exist.
    pub fn load(path: &Path, workspace_root: impl Into<PathBuf>) -> Result<Self, CurioError> {
        let workspace_root = workspace_root.into();
        if !path.exists() {
            let config = PipelineConfig {
                workspace_root,
                ..Default::default()
            };
            config.validate()?;
            return Ok(config);
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| config_error(format!("reading {}", path.display()), e))?;
        Self::from_yaml(&text, workspace_root)
    }

    /// `CURIO_WORKSPACE`, `CURIO_CONFIG`, `CURIO_USER_AGENT`, `CURIO_HTTP_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, CurioError> {
        Self::from_env_with(None, None)
    }

    /// Like [`PipelineConfig::from_env`], with explicit paths taking precedence.
    pub fn from_env_with(
        workspace_root: Option<PathBuf>,
        config_path: Option<PathBuf>,
    ) -> Result<Self, CurioError> {
        let workspace_root = workspace_root
            .or_else(|| std::env::var("CURIO_WORKSPACE").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));
        let config_path = config_path
            .or_else(|| std::env::var("CURIO_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| workspace_root.join(DEFAULT_CONFIG_FILE));
        let mut config = Self::load(&config_path, workspace_root)?;

        if let Ok(user_agent) = std::env::var("CURIO_USER_AGENT") {
            config.acquisition.user_agent = user_agent;
        }
        if let Ok(raw) = std::env::var("CURIO_HTTP_TIMEOUT_SECS") {
            config.acquisition.timeout_secs = raw
                .parse()
                .map_err(|e| config_error(format!("CURIO_HTTP_TIMEOUT_SECS={raw}"), e))?;
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CurioError> {
        let acquisition = &self.acquisition;
        if acquisition.workers == 0 {
            return Err(CurioError::Config("acquisition.workers must be positive".into()));
        }
        if acquisition.max_attempts == 0 {
            return Err(CurioError::Config(
                "acquisition.max_attempts must be positive".into(),
            ));
        }
        if self.sharding.max_records == 0 || self.sharding.max_bytes == 0 {
            return Err(CurioError::Config("sharding limits must be positive".into()));
        }
        if self.screening.min_chars > self.screening.max_chars {
            return Err(CurioError::Config(format!(
                "screening.min_chars ({}) exceeds max_chars ({})",
                self.screening.min_chars, self.screening.max_chars
            )));
        }
        if !(0.0..=1.0).contains(&self.licensing.min_license_confidence) {
            return Err(CurioError::Config(format!(
                "licensing.min_license_confidence must be within 0..=1, got {}",
                self.licensing.min_license_confidence
            )));
        }
        Ok(())
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    pub fn targets_path(&self) -> PathBuf {
        self.resolve(&self.targets_file)
    }

    pub fn queues_dir(&self) -> PathBuf {
        self.resolve(&self.roots.queues)
    }

    pub fn evidence_dir(&self) -> PathBuf {
        self.resolve(&self.roots.evidence)
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.resolve(&self.roots.raw)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.resolve(&self.roots.state)
    }

    pub fn screened_dir(&self) -> PathBuf {
        self.resolve(&self.roots.screened)
    }

    pub fn combined_dir(&self) -> PathBuf {
        self.resolve(&self.roots.combined)
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.resolve(&self.roots.ledger)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.resolve(&self.roots.reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_yaml_keeps_defaults_for_missing_sections() {
        let yaml = r#"
sharding:
  max_records: 2
screening:
  require_record_license: true
  denylist_phrases: ["do not train"]
licensing:
  denylist:
    - phrase: "research only"
      severity: red
  profile_pools:
    record_level: copyleft
"#;
        let config = PipelineConfig::from_yaml(yaml, "/work").unwrap();
        assert_eq!(config.sharding.max_records, 2);
        assert_eq!(config.sharding.max_bytes, ShardLimits::default().max_bytes);
        assert!(config.screening.require_record_license);
        assert_eq!(config.licensing.denylist[0].severity, Severity::Red);
        assert_eq!(
            config.licensing.profile_pools.get(&LicenseProfile::RecordLevel),
            Some(&OutputPool::Copyleft)
        );
        assert_eq!(config.acquisition.max_attempts, 3);
        assert_eq!(config.raw_dir(), PathBuf::from("/work/raw"));
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let err = PipelineConfig::from_yaml("acquisition:\n  workers: 0\n", ".").unwrap_err();
        assert!(matches!(err, CurioError::Config(_)));

        let err = PipelineConfig::from_yaml("unknown_section: 1\n", ".").unwrap_err();
        assert!(matches!(err, CurioError::Config(_)));

        let err = PipelineConfig::from_yaml(
            "screening:\n  min_chars: 10\n  max_chars: 5\n",
            ".",
        )
        .unwrap_err();
        assert!(err.to_string().contains("min_chars"));
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig::load(&dir.path().join("curio.yaml"), dir.path()).unwrap();
        assert_eq!(config.targets_path(), dir.path().join("targets.yaml"));
        assert_eq!(config.acquisition.workers, 4);
    }

    #[test]
    fn absolute_roots_are_not_rebased() {
        let mut config = PipelineConfig::default();
        config.roots.ledger = PathBuf::from("/var/curio/ledger");
        assert_eq!(config.ledger_dir(), PathBuf::from("/var/curio/ledger"));
    }
}
