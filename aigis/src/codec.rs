// src/codec.rs
//
// Action codec: maps between the parameter catalog, flat / per-agent action
// vectors in [0, 1], and the deployable configuration document.
//
// Layout:
// - every catalog key, in catalog order, owns one flat position
// - tunable keys additionally get a group-local position in their agent's
//   sub-vector; non-tunable keys are in no group and always decode from 0
//
// Decoding scales each component by the key's max value and truncates to an
// integer, so a decoded document is reproducible bit-for-bit from the same
// vector.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{parse_limit, Catalog, Limit};
use crate::groups::{must_be_positive, AgentGroup, TunableSet};

/// Flat `key -> rendered value` configuration sent to the harness.
pub type ConfigDocument = IndexMap<String, String>;

/// One action vector per agent group, indexed by [`AgentGroup::index`].
pub type GroupActions = Vec<Vec<f64>>;

/// Catalog regrouped into `section -> key -> value`, ready to serialize.
pub type SectionedConfig = IndexMap<String, IndexMap<String, String>>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActionShapeError {
    #[error("flat action has {got} components, expected {expected}")]
    FlatLength { expected: usize, got: usize },
    #[error("expected {expected} group actions, got {got}")]
    GroupCount { expected: usize, got: usize },
    #[error("group '{group}' action has {got} components, expected {expected}")]
    GroupLength {
        group: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("configuration is missing key '{0}'")]
    MissingKey(String),
    #[error("configuration value '{value}' for key '{key}' is not a rendered limit")]
    BadValue { key: String, value: String },
}

/// One catalog key's place in the layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutEntry {
    pub section: String,
    pub key: String,
    pub limit: Limit,
    /// Agent group controlling this key, None when not tunable.
    pub group: Option<AgentGroup>,
}

/// Index map derived from a catalog and the tunable set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLayout {
    entries: Vec<LayoutEntry>,
    /// Global flat positions per group, in catalog order.
    group_indices: Vec<Vec<usize>>,
}

impl ActionLayout {
    pub fn new(catalog: &Catalog, tunable: &TunableSet) -> Self {
        let mut entries = Vec::with_capacity(catalog.len());
        let mut group_indices = vec![Vec::new(); AgentGroup::ALL.len()];

        for (position, (section, key, limit)) in catalog.iter().enumerate() {
            let group = tunable.group_of(section, key);
            if let Some(group) = group {
                group_indices[group.index()].push(position);
            }
            entries.push(LayoutEntry {
                section: section.to_string(),
                key: key.to_string(),
                limit: limit.clone(),
                group,
            });
        }

        Self {
            entries,
            group_indices,
        }
    }

    /// Total flat length (every catalog key).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LayoutEntry] {
        &self.entries
    }

    /// Global flat positions controlled by `group`.
    pub fn group_indices(&self, group: AgentGroup) -> &[usize] {
        &self.group_indices[group.index()]
    }

    /// Dimension of each group's action vector, in agent order.
    pub fn group_dims(&self) -> Vec<usize> {
        self.group_indices.iter().map(Vec::len).collect()
    }

    /// `(global, group-local)` position of a tunable key.
    pub fn position_of(&self, key: &str) -> Option<(usize, Option<usize>)> {
        let global = self.entries.iter().position(|e| e.key == key)?;
        let local = self.entries[global].group.and_then(|group| {
            self.group_indices[group.index()]
                .iter()
                .position(|&idx| idx == global)
        });
        Some((global, local))
    }
}

/// Scale one normalized component by `max_value`, truncating toward zero.
///
/// Components outside [0, 1] are clamped and NaN reads as 0, so the result
/// always lies in `[0, max_value]`.
#[inline]
fn scale(component: f64, max_value: f64) -> i64 {
    let clamped = if component.is_nan() {
        0.0
    } else {
        component.clamp(0.0, 1.0)
    };
    (clamped * max_value).trunc() as i64
}

/// Inverse of [`scale`]: the component whose scaled value truncates to `n`.
///
/// Uses the midpoint of `[n, n + 1)` so truncation lands back on `n`.
#[inline]
fn unscale(n: i64, max_value: f64) -> f64 {
    if max_value <= 0.0 {
        return 0.0;
    }
    ((n as f64 + 0.5) / max_value).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCodec {
    layout: ActionLayout,
}

impl ActionCodec {
    pub fn new(catalog: &Catalog, tunable: &TunableSet) -> Self {
        Self {
            layout: ActionLayout::new(catalog, tunable),
        }
    }

    pub fn layout(&self) -> &ActionLayout {
        &self.layout
    }

    /// Decode a flat vector covering every catalog key.
    pub fn decode_flat(&self, action: &[f64]) -> Result<ConfigDocument, ActionShapeError> {
        if action.len() != self.layout.len() {
            return Err(ActionShapeError::FlatLength {
                expected: self.layout.len(),
                got: action.len(),
            });
        }
        Ok(self.render(action))
    }

    /// Decode one vector per agent group.
    ///
    /// Group components are scattered to their global positions; positions
    /// no group controls stay at 0.
    pub fn decode_groups(&self, actions: &[Vec<f64>]) -> Result<ConfigDocument, ActionShapeError> {
        let flat = self.scatter(actions)?;
        Ok(self.render(&flat))
    }

    /// Flat vector that decodes back to `doc`.
    pub fn encode_inverse_flat(&self, doc: &ConfigDocument) -> Result<Vec<f64>, ActionShapeError> {
        self.layout
            .entries
            .iter()
            .map(|entry| {
                let raw = doc
                    .get(&entry.key)
                    .ok_or_else(|| ActionShapeError::MissingKey(entry.key.clone()))?;
                let n = parse_rendered(raw, &entry.limit).ok_or_else(|| ActionShapeError::BadValue {
                    key: entry.key.clone(),
                    value: raw.clone(),
                })?;
                Ok(unscale(n, entry.limit.max_value))
            })
            .collect()
    }

    /// Per-group vectors that decode back to `doc`.
    pub fn encode_inverse(&self, doc: &ConfigDocument) -> Result<GroupActions, ActionShapeError> {
        let flat = self.encode_inverse_flat(doc)?;
        Ok(self.gather(&flat))
    }

    /// Max values per group, aligned with the group action vectors.
    pub fn max_values(&self) -> GroupActions {
        let maxes: Vec<f64> = self
            .layout
            .entries
            .iter()
            .map(|e| e.limit.max_value)
            .collect();
        self.gather(&maxes)
    }

    /// Regroup a decoded document by catalog section, in catalog order.
    ///
    /// Keys absent from `doc` are skipped; keys not in the catalog are
    /// dropped.
    pub fn sectioned(&self, doc: &ConfigDocument) -> SectionedConfig {
        let mut out = SectionedConfig::new();
        for entry in &self.layout.entries {
            if let Some(value) = doc.get(&entry.key) {
                out.entry(entry.section.clone())
                    .or_default()
                    .insert(entry.key.clone(), value.clone());
            }
        }
        out
    }

    /// [`Self::sectioned`] rendered as a YAML document.
    pub fn sectioned_yaml(&self, doc: &ConfigDocument) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.sectioned(doc))
    }

    fn render(&self, flat: &[f64]) -> ConfigDocument {
        let mut doc = ConfigDocument::with_capacity(self.layout.len());
        for (entry, &component) in self.layout.entries.iter().zip(flat) {
            let mut value = scale(component, entry.limit.max_value);
            if value <= 0 && must_be_positive(&entry.key) {
                value = 1;
            }
            doc.insert(entry.key.clone(), entry.limit.render(value));
        }
        doc
    }

    fn scatter(&self, actions: &[Vec<f64>]) -> Result<Vec<f64>, ActionShapeError> {
        if actions.len() != AgentGroup::ALL.len() {
            return Err(ActionShapeError::GroupCount {
                expected: AgentGroup::ALL.len(),
                got: actions.len(),
            });
        }

        let mut flat = vec![0.0; self.layout.len()];
        for group in AgentGroup::ALL {
            let indices = self.layout.group_indices(group);
            let values = &actions[group.index()];
            if values.len() != indices.len() {
                return Err(ActionShapeError::GroupLength {
                    group: group.as_str(),
                    expected: indices.len(),
                    got: values.len(),
                });
            }
            for (&idx, &value) in indices.iter().zip(values) {
                flat[idx] = value;
            }
        }
        Ok(flat)
    }

    fn gather(&self, flat: &[f64]) -> GroupActions {
        AgentGroup::ALL
            .iter()
            .map(|&group| {
                self.layout
                    .group_indices(group)
                    .iter()
                    .map(|&idx| flat[idx])
                    .collect()
            })
            .collect()
    }
}

/// Read a rendered value back to its integer magnitude, checking the unit.
fn parse_rendered(raw: &str, limit: &Limit) -> Option<i64> {
    let parsed = parse_limit(raw).ok()?;
    if parsed.unit.as_deref().map(str::trim) != limit.unit.as_deref().map(str::trim) {
        return None;
    }
    i64::try_from(parsed.max_value as u64).ok()
}
