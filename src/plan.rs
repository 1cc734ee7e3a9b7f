//! Reconciliation planning.
//!
//! [`build_plan`] diffs a desired [`RegistryStruct`] against a queried
//! [`QueryResult`] and produces an ordered [`ExecutionPlan`]:
//!
//! 1. explicit value deletions,
//! 2. explicit key deletions,
//! 3. creation of desired keys that do not exist,
//! 4. value updates (and optional pruning) on keys that do exist.
//!
//! Later stages assume earlier ones already ran, so a key deleted in stage 2
//! is treated as absent by stages 3 and 4.

use crate::key::KeyPath;
use crate::process::RegView;
use crate::state::{find_value, QueryResult, RegistryStruct, ValueMap};
use crate::value::{is_default_name, RegistryValue};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// One mutating step.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExecutionStep {
    /// Create `key`, and set one value when given.
    Add {
        /// Target key.
        key: KeyPath,
        /// Value name and content.
        value: Option<(String, RegistryValue)>,
    },
    /// Delete one value of `key`, or the whole key when `value` is `None`.
    Delete {
        /// Target key.
        key: KeyPath,
        /// Value name.
        value: Option<String>,
    },
}

impl ExecutionStep {
    /// The key this step targets.
    pub fn key(&self) -> &KeyPath {
        match self {
            ExecutionStep::Add { key, .. } | ExecutionStep::Delete { key, .. } => key,
        }
    }

    /// Returns true for an ADD whose value is a REG_NONE with bytes, which
    /// `reg add` cannot express.
    pub fn needs_document(&self) -> bool {
        matches!(self, ExecutionStep::Add { value: Some((_, v)), .. } if v.is_none_with_payload())
    }
}

/// Ordered steps produced by [`build_plan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ExecutionPlan {
    steps: Vec<ExecutionStep>,
}

impl ExecutionPlan {
    /// The steps in execution order.
    pub fn steps(&self) -> &[ExecutionStep] {
        &self.steps
    }

    /// Iterates the steps in execution order.
    pub fn iter(&self) -> std::slice::Iter<'_, ExecutionStep> {
        self.steps.iter()
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true when there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn push(&mut self, step: ExecutionStep) {
        self.steps.push(step);
    }
}

impl From<Vec<ExecutionStep>> for ExecutionPlan {
    fn from(steps: Vec<ExecutionStep>) -> Self {
        Self { steps }
    }
}

impl<'a> IntoIterator for &'a ExecutionPlan {
    type Item = &'a ExecutionStep;
    type IntoIter = std::slice::Iter<'a, ExecutionStep>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}

impl IntoIterator for ExecutionPlan {
    type Item = ExecutionStep;
    type IntoIter = std::vec::IntoIter<ExecutionStep>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.into_iter()
    }
}

/// Predicate deciding whether an unspecified value is deleted.
pub type DeletionPredicate = Arc<dyn Fn(&KeyPath, &str, &RegistryValue) -> bool + Send + Sync>;

/// Which unspecified current values are deleted.
#[derive(Clone)]
pub enum DeletionPolicy {
    /// Every value absent from the desired state.
    All,
    /// Every such value except the default value.
    AllExceptDefault,
    /// Only the default value.
    OnlyDefault,
    /// Values for which the predicate returns true.
    Custom(DeletionPredicate),
}

impl DeletionPolicy {
    /// Creates a [`Custom`](Self::Custom) policy.
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&KeyPath, &str, &RegistryValue) -> bool + Send + Sync + 'static,
    {
        DeletionPolicy::Custom(Arc::new(predicate))
    }

    /// Returns true if `name` under `key` should be deleted.
    pub fn should_delete(&self, key: &KeyPath, name: &str, value: &RegistryValue) -> bool {
        match self {
            DeletionPolicy::All => true,
            DeletionPolicy::AllExceptDefault => !is_default_name(name),
            DeletionPolicy::OnlyDefault => is_default_name(name),
            DeletionPolicy::Custom(predicate) => predicate(key, name, value),
        }
    }
}

impl fmt::Debug for DeletionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeletionPolicy::All => f.write_str("All"),
            DeletionPolicy::AllExceptDefault => f.write_str("AllExceptDefault"),
            DeletionPolicy::OnlyDefault => f.write_str("OnlyDefault"),
            DeletionPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// How a plan is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ApplyMode {
    /// One `reg add` / `reg delete` per step.
    Direct,
    /// One generated document applied with `reg import`.
    Document,
}

/// Options for [`build_plan`] and `RegClient::reconcile`.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    /// Delete current values missing from the desired state, filtered by
    /// this policy. `None` leaves them alone.
    pub delete_unspecified: Option<DeletionPolicy>,
    /// Keys to delete outright.
    pub delete_keys: Vec<KeyPath>,
    /// Individual values to delete.
    pub delete_values: Vec<(KeyPath, String)>,
    /// Forces the apply mode.
    pub mode: Option<ApplyMode>,
    /// Registry view queried and written.
    pub view: RegView,
}

impl ReconcileOptions {
    /// Sets the unspecified-value deletion policy.
    pub fn delete_unspecified(mut self, policy: DeletionPolicy) -> Self {
        self.delete_unspecified = Some(policy);
        self
    }

    /// Adds a key to delete.
    pub fn delete_key(mut self, key: impl Into<KeyPath>) -> Self {
        self.delete_keys.push(key.into());
        self
    }

    /// Adds a value to delete.
    pub fn delete_value(mut self, key: impl Into<KeyPath>, name: impl Into<String>) -> Self {
        self.delete_values.push((key.into(), name.into()));
        self
    }

    /// Forces the apply mode.
    pub fn with_mode(mut self, mode: ApplyMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Selects the registry view.
    pub fn with_view(mut self, view: RegView) -> Self {
        self.view = view;
        self
    }

    /// Every key the current state must be queried for.
    pub fn query_keys(&self, desired: &RegistryStruct) -> Vec<KeyPath> {
        let mut keys: Vec<KeyPath> = Vec::new();
        let candidates = desired
            .keys()
            .chain(self.delete_keys.iter())
            .chain(self.delete_values.iter().map(|(key, _)| key));
        for key in candidates {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }
}

fn is_deleted(deleted_keys: &[KeyPath], key: &KeyPath) -> bool {
    deleted_keys.iter().any(|d| d == key || d.is_ancestor_of(key))
}

/// Computes the steps that move `current` to `desired`.
pub fn build_plan(desired: &RegistryStruct, current: &QueryResult, options: &ReconcileOptions) -> ExecutionPlan {
    let mut plan = ExecutionPlan::default();
    let exists = |key: &KeyPath| current.data.contains_key(key) && !current.is_missing(key);

    // 1. Explicit value deletions.
    let mut deleted_values: Vec<(&KeyPath, &str)> = Vec::new();
    for (key, name) in &options.delete_values {
        if is_deleted(&options.delete_keys, key) || !exists(key) {
            continue;
        }
        deleted_values.push((key, name.as_str()));
        plan.push(ExecutionStep::Delete {
            key: key.clone(),
            value: Some(name.clone()),
        });
    }

    // 2. Explicit key deletions.
    let mut deleted_keys: Vec<KeyPath> = Vec::new();
    for key in &options.delete_keys {
        if current.is_missing(key) {
            continue;
        }
        deleted_keys.push(key.clone());
        plan.push(ExecutionStep::Delete {
            key: key.clone(),
            value: None,
        });
    }

    let present = |key: &KeyPath| exists(key) && !is_deleted(&deleted_keys, key);

    // 3. Missing keys.
    for (key, values) in desired {
        if present(key) {
            continue;
        }
        if values.is_empty() {
            plan.push(ExecutionStep::Add {
                key: key.clone(),
                value: None,
            });
        }
        for (name, value) in values {
            plan.push(ExecutionStep::Add {
                key: key.clone(),
                value: Some((name.clone(), value.clone())),
            });
        }
    }

    // 4. Existing keys.
    for (key, values) in desired {
        let Some(current_values) = current.data.get(key).filter(|_| present(key)) else {
            continue;
        };
        diff_values(&mut plan, key, values, current_values, &deleted_values, options);
    }

    debug!(steps = plan.len(), "Built execution plan");
    plan
}

/// `reg query` prints no payload for REG_NONE, so a current REG_NONE only
/// tells us the type.
fn is_unchanged(desired: &RegistryValue, current: &RegistryValue) -> bool {
    match (desired, current) {
        (RegistryValue::None(_), RegistryValue::None(_)) => true,
        _ => desired == current,
    }
}

fn diff_values(
    plan: &mut ExecutionPlan,
    key: &KeyPath,
    desired: &ValueMap,
    current: &ValueMap,
    explicitly_deleted: &[(&KeyPath, &str)],
    options: &ReconcileOptions,
) {
    for (name, value) in desired {
        let unchanged = matches!(find_value(current, name), Some((_, existing)) if is_unchanged(value, existing));
        if !unchanged {
            plan.push(ExecutionStep::Add {
                key: key.clone(),
                value: Some((name.clone(), value.clone())),
            });
        }
    }

    let Some(policy) = &options.delete_unspecified else {
        return;
    };
    for (name, value) in current {
        if find_value(desired, name).is_some() {
            continue;
        }
        let already = explicitly_deleted
            .iter()
            .any(|(k, n)| *k == key && n.eq_ignore_ascii_case(name));
        if already || !policy.should_delete(key, name, value) {
            continue;
        }
        plan.push(ExecutionStep::Delete {
            key: key.clone(),
            value: Some(name.clone()),
        });
    }
}

/// Picks how `plan` is applied.
///
/// A forced mode wins. Otherwise a plan of more than one step, or one that
/// writes a REG_NONE with bytes, goes through a document.
pub fn select_mode(plan: &ExecutionPlan, forced: Option<ApplyMode>) -> ApplyMode {
    if let Some(mode) = forced {
        return mode;
    }
    if plan.len() > 1 || plan.iter().any(ExecutionStep::needs_document) {
        ApplyMode::Document
    } else {
        ApplyMode::Direct
    }
}
