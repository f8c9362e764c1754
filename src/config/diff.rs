//! Nested settings diff for reload logging.
//!
//! A reload replaces the whole settings snapshot; the diff tells operators
//! what actually changed. Changes are flattened to dotted paths and logged as
//! one `settings_diff` JSON line, preceded by a `settings_reload` marker.

use log::Level;
use serde_json::{json, Value};
use toml::Value as TomlValue;

use crate::logutil::JsonEvent;

/// One change between two settings snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingChange {
    pub path: String,
    pub kind: ChangeKind,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    Changed,
}

impl ChangeKind {
    fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
            ChangeKind::Changed => "changed",
        }
    }
}

fn to_json(value: &TomlValue) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Walk two TOML tables and collect leaf-level changes, sorted by path.
pub fn compute_diff(old: &TomlValue, new: &TomlValue) -> Vec<SettingChange> {
    let mut changes = Vec::new();
    walk(old, new, String::new(), &mut changes);
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes
}

fn walk(old: &TomlValue, new: &TomlValue, prefix: String, out: &mut Vec<SettingChange>) {
    match (old.as_table(), new.as_table()) {
        (Some(old_table), Some(new_table)) => {
            let mut keys: Vec<&String> = old_table.keys().chain(new_table.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                match (old_table.get(key), new_table.get(key)) {
                    (None, Some(added)) => out.push(SettingChange {
                        path,
                        kind: ChangeKind::Added,
                        old: None,
                        new: Some(to_json(added)),
                    }),
                    (Some(removed), None) => out.push(SettingChange {
                        path,
                        kind: ChangeKind::Removed,
                        old: Some(to_json(removed)),
                        new: None,
                    }),
                    (Some(old_value), Some(new_value)) => {
                        walk(old_value, new_value, path, out)
                    }
                    (None, None) => unreachable!("key came from one of the tables"),
                }
            }
        }
        _ => {
            if old != new {
                out.push(SettingChange {
                    path: prefix,
                    kind: ChangeKind::Changed,
                    old: Some(to_json(old)),
                    new: Some(to_json(new)),
                });
            }
        }
    }
}

/// Emit `settings_reload` and, when anything changed, one `settings_diff`
/// line listing every change.
pub fn log_settings_diff(old: &TomlValue, new: &TomlValue) {
    JsonEvent::new("settings_reload", "config", "-").emit(Level::Info);
    let changes = compute_diff(old, new);
    if changes.is_empty() {
        return;
    }
    let payload: Vec<Value> = changes
        .iter()
        .map(|change| {
            json!({
                "path": change.path,
                "type": change.kind.as_str(),
                "old": change.old,
                "new": change.new,
            })
        })
        .collect();
    JsonEvent::new("settings_diff", "config", "-")
        .field("changes", payload)
        .emit(Level::Info);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(s: &str) -> TomlValue {
        s.parse().unwrap()
    }

    #[test]
    fn identical_snapshots_have_no_diff() {
        let a = table("timezone = \"UTC\"\n[dedupe]\nrecent_k = 20");
        assert!(compute_diff(&a, &a.clone()).is_empty());
    }

    #[test]
    fn nested_change_uses_dotted_path() {
        let old = table("[scheduler.queue]\nthreshold = 3");
        let new = table("[scheduler.queue]\nthreshold = 5");
        let changes = compute_diff(&old, &new);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "scheduler.queue.threshold");
        assert_eq!(changes[0].kind, ChangeKind::Changed);
        assert_eq!(changes[0].old, Some(serde_json::json!(3)));
        assert_eq!(changes[0].new, Some(serde_json::json!(5)));
    }

    #[test]
    fn added_and_removed_keys_are_reported() {
        let old = table("timezone = \"UTC\"");
        let new = table("locale = \"ja\"");
        let changes = compute_diff(&old, &new);
        let kinds: Vec<(String, ChangeKind)> = changes
            .iter()
            .map(|c| (c.path.clone(), c.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("locale".to_string(), ChangeKind::Added),
                ("timezone".to_string(), ChangeKind::Removed),
            ]
        );
    }

    #[test]
    fn type_change_is_a_leaf_change() {
        let old = table("jitter = 60");
        let new = table("jitter = [60, 180]");
        let changes = compute_diff(&old, &new);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Changed);
    }
}
