//! Diff-and-apply of user globals for persistent contexts.
//!
//! A persistent run executes against a copy of the shared globals. Afterwards
//! only what that run changed is written back, so two overlapping runs of the
//! same macro do not erase each other's unrelated variables.
//!
//! Native values cannot be compared, so [`NativeDiff`] treats a value as
//! changed unless the run handed back the very same allocation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::context::{Globals, NativeState, NativeValue};

/// Top-level variables a run added, changed or removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalsDiff {
    /// Variables that are new or hold a different value.
    pub changed: Globals,
    /// Variables that no longer exist.
    pub removed: Vec<String>,
}

impl GlobalsDiff {
    /// Compute the difference from `before` to `after`.
    #[must_use]
    pub fn between(before: &Globals, after: &Globals) -> Self {
        let changed = after
            .iter()
            .filter(|(name, value)| before.get(*name) != Some(*value))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let removed = before
            .keys()
            .filter(|name| !after.contains_key(*name))
            .cloned()
            .collect();
        Self { changed, removed }
    }

    /// Whether the run left the globals untouched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }

    /// Write the difference into `target`.
    pub fn apply(self, target: &mut Globals) {
        for name in &self.removed {
            target.remove(name);
        }
        target.extend(self.changed);
    }
}

/// Native values and functions a run added, replaced or removed.
#[derive(Clone, Default)]
pub struct NativeDiff {
    /// Values that are new or were handed back as a different allocation.
    pub changed: BTreeMap<String, NativeValue>,
    /// Values that no longer exist.
    pub removed: Vec<String>,
    /// Replacement function set, if the run produced a new one.
    pub functions: Option<NativeValue>,
}

impl fmt::Debug for NativeDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeDiff")
            .field("changed", &self.changed.keys().collect::<Vec<_>>())
            .field("removed", &self.removed)
            .field("functions", &self.functions.is_some())
            .finish()
    }
}

impl NativeDiff {
    /// Compute the difference from `before` to `after`.
    #[must_use]
    pub fn between(before: &NativeState, after: &NativeState) -> Self {
        let changed = after
            .values
            .iter()
            .filter(|(name, value)| {
                !before
                    .values
                    .get(*name)
                    .is_some_and(|old| Arc::ptr_eq(old, value))
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let removed = before
            .values
            .keys()
            .filter(|name| !after.values.contains_key(*name))
            .cloned()
            .collect();
        let functions = match (&before.functions, &after.functions) {
            (Some(old), Some(new)) if Arc::ptr_eq(old, new) => None,
            (_, new) => new.clone(),
        };
        Self {
            changed,
            removed,
            functions,
        }
    }

    /// Whether the run left the native state untouched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty() && self.functions.is_none()
    }

    /// Write the difference into `target`.
    pub fn apply(self, target: &mut NativeState) {
        for name in &self.removed {
            target.values.remove(name);
        }
        target.values.extend(self.changed);
        if let Some(functions) = self.functions {
            target.functions = Some(functions);
        }
    }
}
