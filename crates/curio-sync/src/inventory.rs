//! Target inventory (`targets.yaml`), validated before any stage mutates state.

use std::collections::BTreeMap;
use std::path::Path;

use curio_adapters::{registered_screeners, screener_for};
use curio_core::{CurioError, Target};
use curio_storage::safe_component;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetInventory {
    pub targets: Vec<Target>,
}

impl TargetInventory {
    pub fn from_yaml(text: &str) -> Result<Self, CurioError> {
        let inventory: TargetInventory = serde_yaml::from_str(text)
            .map_err(|e| CurioError::Config(format!("parsing target inventory: {e}")))?;
        inventory.validate()?;
        Ok(inventory)
    }

    pub fn load(path: &Path) -> Result<Self, CurioError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CurioError::Config(format!("reading target inventory {}: {e}", path.display()))
        })?;
        Self::from_yaml(&text)
    }

    fn validate(&self) -> Result<(), CurioError> {
        // Keyed by the on-disk form so two ids cannot share a payload directory.
        let mut seen: BTreeMap<String, &str> = BTreeMap::new();
        for target in &self.targets {
            if target.id.trim().is_empty() {
                return Err(CurioError::Config("target with empty id".into()));
            }
            if let Some(previous) = seen.insert(safe_component(&target.id), &target.id) {
                return Err(CurioError::Config(format!(
                    "duplicate target id {} (collides with {previous})",
                    target.id
                )));
            }
            if screener_for(&target.screener).is_none() {
                return Err(CurioError::Config(format!(
                    "target {} names unknown screener {:?}; registered: {}",
                    target.id,
                    target.screener,
                    registered_screeners().join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Enabled targets in id order.
    pub fn enabled(&self) -> Vec<&Target> {
        let mut targets: Vec<_> = self.targets.iter().filter(|t| t.enabled).collect();
        targets.sort_by(|a, b| a.id.cmp(&b.id));
        targets
    }

    pub fn get(&self, id: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.id == id)
    }
}
