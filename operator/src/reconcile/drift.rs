//! Field-level comparison helpers shared by the per-kind drift checks.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

/// Result of comparing an owned object against what the Environment spec implies.
#[derive(Debug, Clone, PartialEq)]
pub enum Drift {
    InSync,
    /// JSON merge patch carrying only the fields that differ.
    Patch(Value),
    /// A field that differs cannot be changed in place.
    Recreate(&'static str),
}

/// Collects a sparse JSON merge patch.
#[derive(Debug, Default)]
pub struct PatchBuilder {
    root: Map<String, Value>,
}

impl PatchBuilder {
    pub fn set(&mut self, path: &[&str], value: impl Serialize) -> &mut Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        insert_at(&mut self.root, path, value);
        self
    }

    pub fn into_drift(self) -> Drift {
        if self.root.is_empty() {
            Drift::InSync
        } else {
            Drift::Patch(Value::Object(self.root))
        }
    }
}

fn insert_at(node: &mut Map<String, Value>, path: &[&str], value: Value) {
    match path {
        [] => {}
        [last] => {
            node.insert(last.to_string(), value);
        }
        [segment, rest @ ..] => {
            let entry = node
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                insert_at(child, rest, value);
            }
        }
    }
}

/// Adds every desired label that is missing or different on the live object.
/// Labels the controller does not set are left alone.
pub fn diff_labels(
    patch: &mut PatchBuilder,
    desired: Option<&BTreeMap<String, String>>,
    actual: Option<&BTreeMap<String, String>>,
) {
    let Some(desired) = desired else { return };
    for (key, value) in desired {
        if actual.and_then(|a| a.get(key)) != Some(value) {
            patch.set(&["metadata", "labels", key.as_str()], value);
        }
    }
}

/// The live image may have been pinned to a digest by the cluster or an
/// admission hook; `repo:tag@sha256:...` still satisfies `repo:tag`.
pub fn image_matches(desired: &str, actual: &str) -> bool {
    actual == desired
        || actual
            .strip_prefix(desired)
            .is_some_and(|rest| rest.starts_with('@'))
}

/// Parses a Kubernetes resource quantity into its numeric value.
///
/// Supports plain numbers, decimal fractions, binary (`Ki`..`Ei`) and decimal
/// (`k`..`E`) suffixes. Exponent notation is not supported.
pub fn parse_quantity(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);
    if number.is_empty() {
        return None;
    }
    let number: f64 = number.parse().ok()?;

    let multiplier = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        _ => return None,
    };
    Some(number * multiplier)
}
