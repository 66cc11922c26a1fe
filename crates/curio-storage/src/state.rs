//! Persisted stage-state records keyed by (target, stage).

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use curio_core::{Stage, StageManifest};
use uuid::Uuid;

use crate::safe_component;

/// Checkpoint store consulted by every stage before doing work.
pub trait StageStore: Send + Sync {
    fn load(&self, target_id: &str, stage: Stage) -> Result<Option<StageManifest>>;
    fn save(&self, manifest: &StageManifest) -> Result<()>;
    fn list(&self, stage: Stage) -> Result<Vec<StageManifest>>;
}

/// One JSON file per (stage, target) under `root/<stage>/`.
#[derive(Debug, Clone)]
pub struct FsStageStore {
    root: PathBuf,
}

impl FsStageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, target_id: &str, stage: Stage) -> PathBuf {
        self.root
            .join(stage.as_str())
            .join(format!("{}.json", safe_component(target_id)))
    }
}

impl StageStore for FsStageStore {
    fn load(&self, target_id: &str, stage: Stage) -> Result<Option<StageManifest>> {
        let path = self.path_for(target_id, stage);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let manifest = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(manifest))
    }

    fn save(&self, manifest: &StageManifest) -> Result<()> {
        let path = self.path_for(&manifest.target_id, manifest.stage);
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("state path {} has no parent", path.display()))?;
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;

        let bytes = serde_json::to_vec_pretty(manifest).context("serializing stage manifest")?;
        let temp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp, bytes).with_context(|| format!("writing {}", temp.display()))?;
        if let Err(err) = fs::rename(&temp, &path) {
            let _ = fs::remove_file(&temp);
            return Err(err)
                .with_context(|| format!("renaming {} -> {}", temp.display(), path.display()));
        }
        Ok(())
    }

    fn list(&self, stage: Stage) -> Result<Vec<StageManifest>> {
        let dir = self.root.join(stage.as_str());
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))? {
            let entry = entry.with_context(|| format!("reading {}", dir.display()))?;
            let path = entry.path();
            if !matches!(path.extension(), Some(ext) if ext == "json") {
                continue;
            }
            let text =
                fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            out.push(
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?,
            );
        }
        out.sort_by(|a: &StageManifest, b| a.target_id.cmp(&b.target_id));
        Ok(out)
    }
}

/// In-memory store for unit tests that should not touch a filesystem.
#[derive(Debug, Default)]
pub struct MemoryStageStore {
    inner: Mutex<BTreeMap<(Stage, String), StageManifest>>,
}

impl MemoryStageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StageStore for MemoryStageStore {
    fn load(&self, target_id: &str, stage: Stage) -> Result<Option<StageManifest>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("stage store lock poisoned"))?;
        Ok(inner.get(&(stage, target_id.to_string())).cloned())
    }

    fn save(&self, manifest: &StageManifest) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("stage store lock poisoned"))?;
        inner.insert(
            (manifest.stage, manifest.target_id.clone()),
            manifest.clone(),
        );
        Ok(())
    }

    fn list(&self, stage: Stage) -> Result<Vec<StageManifest>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("stage store lock poisoned"))?;
        Ok(inner
            .iter()
            .filter(|((s, _), _)| *s == stage)
            .map(|(_, m)| m.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use curio_core::{FileRecord, StageState};
    use tempfile::tempdir;

    fn roundtrip(store: &dyn StageStore) {
        assert!(store.load("t1", Stage::Acquire).unwrap().is_none());

        let started = StageManifest::begin(None, "t1", Stage::Acquire, Utc::now()).unwrap();
        store.save(&started).unwrap();
        assert_eq!(
            store.load("t1", Stage::Acquire).unwrap().unwrap().state,
            StageState::InProgress
        );

        let done = started
            .complete(
                vec![FileRecord {
                    path: "a.jsonl".into(),
                    sha256: "00".into(),
                    bytes: 1,
                }],
                Utc::now(),
            )
            .unwrap();
        store.save(&done).unwrap();

        let loaded = store.load("t1", Stage::Acquire).unwrap().unwrap();
        assert!(loaded.is_done());
        assert_eq!(loaded.files.len(), 1);
        assert!(store.load("t1", Stage::Screen).unwrap().is_none());
        assert_eq!(store.list(Stage::Acquire).unwrap().len(), 1);
    }

    #[test]
    fn memory_store_tracks_state_per_stage() {
        roundtrip(&MemoryStageStore::new());
    }

    #[test]
    fn fs_store_tracks_state_per_stage() {
        let dir = tempdir().unwrap();
        roundtrip(&FsStageStore::new(dir.path()));
        assert!(dir.path().join("acquire/t1.json").exists());
    }
}
