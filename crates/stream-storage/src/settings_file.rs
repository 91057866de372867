//! Settings snapshot file (`<base>_settings.dat`).
//!
//! Settings are kept as a flat map from slash-separated paths
//! (`save/pretrigger_status/start`) to JSON values, one `path<TAB>value` line
//! per entry. Nested JSON objects are flattened on insertion, so branches
//! coming from different sources can be merged key by key.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::Value;

/// Flat settings dictionary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsDict {
    entries: BTreeMap<String, Value>,
}

fn join(prefix: &str, key: &str) -> String {
    match (prefix.is_empty(), key.is_empty()) {
        (true, _) => key.to_string(),
        (_, true) => prefix.to_string(),
        _ => format!("{}/{}", prefix, key),
    }
}

impl SettingsDict {
    /// Empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leaf entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Leaf value at `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Iterate leaves in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// Store `value` at `key`, flattening objects into sub-keys.
    ///
    /// Anything already stored under `key` is replaced.
    pub fn insert(&mut self, key: &str, value: impl Serialize) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.remove_branch(key);
        self.merge_value(key, value);
    }

    /// Merge `value` under `key` without clearing the existing branch.
    pub fn merge_value(&mut self, key: &str, value: Value) {
        match value {
            Value::Object(map) if !map.is_empty() => {
                for (k, v) in map {
                    self.merge_value(&join(key, &k), v);
                }
            }
            other => {
                // A leaf replaces a branch of the same name and vice versa.
                self.remove_branch(key);
                let mut parent = key;
                while let Some((head, _)) = parent.rsplit_once('/') {
                    self.entries.remove(head);
                    parent = head;
                }
                self.entries.insert(key.to_string(), other);
            }
        }
    }

    /// Merge all entries of `other` under `prefix`.
    pub fn merge(&mut self, prefix: &str, other: &SettingsDict) {
        for (k, v) in &other.entries {
            self.merge_value(&join(prefix, k), v.clone());
        }
    }

    /// Remove `key` and everything below it.
    pub fn remove_branch(&mut self, key: &str) {
        if key.is_empty() {
            self.entries.clear();
            return;
        }
        let below = format!("{}/", key);
        self.entries
            .retain(|k, _| k != key && !k.starts_with(&below));
    }

    /// Entries below `prefix`, with the prefix stripped.
    pub fn branch(&self, prefix: &str) -> SettingsDict {
        let below = format!("{}/", prefix);
        let entries = self
            .entries
            .iter()
            .filter_map(|(k, v)| {
                if k == prefix {
                    Some((String::new(), v.clone()))
                } else {
                    k.strip_prefix(&below).map(|s| (s.to_string(), v.clone()))
                }
            })
            .collect();
        SettingsDict { entries }
    }

    /// Read a settings file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {:?}", path))?;
        let mut dict = SettingsDict::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, raw) = line
                .split_once('\t')
                .ok_or_else(|| anyhow!("{:?}:{}: missing tab separator", path, n + 1))?;
            let value: Value = serde_json::from_str(raw)
                .with_context(|| format!("{:?}:{}: invalid value", path, n + 1))?;
            dict.entries.insert(key.to_string(), value);
        }
        Ok(dict)
    }

    /// Write the settings file, replacing any existing one.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let mut text = String::with_capacity(self.entries.len() * 32);
        for (k, v) in &self.entries {
            text.push_str(k);
            text.push('\t');
            text.push_str(&serde_json::to_string(v)?);
            text.push('\n');
        }
        let mut file = fs::File::create(path)?;
        file.write_all(text.as_bytes())?;
        tracing::debug!(path = ?path, entries = self.entries.len(), "Wrote settings file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_insert_flattens_objects() {
        let mut d = SettingsDict::new();
        d.insert("save", json!({"path": "/x", "pretrigger_status": {"start": [1, 2]}}));
        assert_eq!(d.get("save/path"), Some(&json!("/x")));
        assert_eq!(d.get("save/pretrigger_status/start"), Some(&json!([1, 2])));
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn test_leaf_replaces_branch() {
        let mut d = SettingsDict::new();
        d.insert("cam/cnt", json!({"frames": 1}));
        d.merge_value("cam/cnt", json!(5));
        assert_eq!(d.get("cam/cnt"), Some(&json!(5)));
        assert!(d.get("cam/cnt/frames").is_none());
        d.merge_value("cam/cnt/frames", json!(7));
        assert!(d.get("cam/cnt").is_none());
        assert_eq!(d.get("cam/cnt/frames"), Some(&json!(7)));
    }

    #[test]
    fn test_merge_and_branch() {
        let mut d = SettingsDict::new();
        d.insert("save/saved", 3);
        let mut delta = SettingsDict::new();
        delta.insert("frames", 10);
        delta.insert("lost", 0);
        d.merge("cam/cnt_after", &delta);
        let branch = d.branch("cam/cnt_after");
        assert_eq!(branch.get("frames"), Some(&json!(10)));
        assert_eq!(d.len(), 3);
    }

    #[test]
    fn test_save_load_preserves_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.dat");
        let mut d = SettingsDict::new();
        d.insert("save/path", "/data/a b\tc");
        d.insert("save/batch_size", Value::Null);
        d.insert("frame/shape", [512, 256]);
        d.save(&path).unwrap();
        let loaded = SettingsDict::load(&path).unwrap();
        assert_eq!(loaded, d);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.dat");
        std::fs::write(&path, "# comment\nno_tab_here\n").unwrap();
        assert!(SettingsDict::load(&path).is_err());
    }
}
