//! Keyed value store with pattern subscriptions, transactions, and
//! JSON persistence.
//!
//! Values are `serde_json::Value`. Subscribers register a pattern —
//! exact key, `prefix.*`, or `*` — and are called with the key, old
//! value, and new value after every committed mutation, never while a
//! store lock is held.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::error::{Result, RuntimeError};

/// Callback invoked as `(key, old_value, new_value)` after a mutation.
pub type StateCallback = Arc<dyn Fn(&str, Option<&Value>, Option<&Value>) + Send + Sync>;

#[derive(Debug, Default)]
struct Transaction {
    /// Buffered writes; `None` marks a pending delete.
    changes: HashMap<String, Option<Value>>,
    /// Pre-transaction values, captured on first touch only.
    originals: HashMap<String, Option<Value>>,
}

#[derive(Debug, Default)]
struct StoreInner {
    store: HashMap<String, Value>,
    txn: Option<Transaction>,
}

struct StateSub {
    id: u64,
    pattern: String,
    callback: StateCallback,
}

/// Keyed state store shared by the runtime and its components.
pub struct StateManager {
    inner: RwLock<StoreInner>,
    subs: RwLock<Vec<StateSub>>,
    next_sub_id: AtomicU64,
}

impl StateManager {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            subs: RwLock::new(Vec::new()),
            next_sub_id: AtomicU64::new(1),
        }
    }

    /// Read a key, seeing through an open transaction's change set.
    pub fn get(&self, key: &str) -> Option<Value> {
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(_) => return None,
        };
        if let Some(txn) = &inner.txn {
            if let Some(change) = txn.changes.get(key) {
                return change.clone();
            }
        }
        inner.store.get(key).cloned()
    }

    /// Write a key; buffered while a transaction is open.
    pub fn set(&self, key: &str, value: Value) {
        let notification = {
            let mut guard = match self.inner.write() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            let inner = &mut *guard;
            if let Some(txn) = &mut inner.txn {
                let original = inner.store.get(key).cloned();
                txn.originals.entry(key.to_string()).or_insert(original);
                txn.changes.insert(key.to_string(), Some(value));
                None
            } else {
                let old = inner.store.insert(key.to_string(), value.clone());
                Some((key.to_string(), old, Some(value)))
            }
        };
        if let Some((key, old, new)) = notification {
            self.notify(&key, old.as_ref(), new.as_ref());
        }
    }

    /// Remove a key; buffered while a transaction is open.
    pub fn delete(&self, key: &str) {
        let notification = {
            let mut guard = match self.inner.write() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            let inner = &mut *guard;
            if let Some(txn) = &mut inner.txn {
                let original = inner.store.get(key).cloned();
                txn.originals.entry(key.to_string()).or_insert(original);
                txn.changes.insert(key.to_string(), None);
                None
            } else {
                inner
                    .store
                    .remove(key)
                    .map(|old| (key.to_string(), Some(old)))
            }
        };
        if let Some((key, old)) = notification {
            self.notify(&key, old.as_ref(), None);
        }
    }

    /// Remove every key, notifying subscribers per key.
    pub fn clear(&self) {
        let removed: Vec<(String, Value)> = {
            let mut inner = match self.inner.write() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner.txn = None;
            inner.store.drain().collect()
        };
        for (key, old) in removed {
            self.notify(&key, Some(&old), None);
        }
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(_) => return Vec::new(),
        };
        let mut keys: Vec<String> = inner.store.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.store.len()).unwrap_or(0)
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open a transaction; fails if one is already open.
    pub fn begin_transaction(&self) -> Result<()> {
        let mut inner = match self.inner.write() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.txn.is_some() {
            return Err(RuntimeError::State("transaction already open".into()));
        }
        inner.txn = Some(Transaction::default());
        Ok(())
    }

    /// Apply the open transaction and notify per mutated key.
    pub fn commit(&self) -> Result<()> {
        let notifications: Vec<(String, Option<Value>, Option<Value>)> = {
            let mut inner = match self.inner.write() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            let txn = inner
                .txn
                .take()
                .ok_or_else(|| RuntimeError::State("no open transaction".into()))?;

            let mut out = Vec::with_capacity(txn.changes.len());
            for (key, change) in txn.changes {
                let old = txn.originals.get(&key).cloned().flatten();
                match change {
                    Some(value) => {
                        inner.store.insert(key.clone(), value.clone());
                        out.push((key, old, Some(value)));
                    }
                    None => {
                        inner.store.remove(&key);
                        out.push((key, old, None));
                    }
                }
            }
            out
        };
        for (key, old, new) in notifications {
            self.notify(&key, old.as_ref(), new.as_ref());
        }
        Ok(())
    }

    /// Discard the open transaction's change set.
    pub fn rollback(&self) -> Result<()> {
        let mut inner = match self.inner.write() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.txn.take().is_none() {
            return Err(RuntimeError::State("no open transaction".into()));
        }
        Ok(())
    }

    /// Subscribe to mutations of keys matching `pattern`.
    ///
    /// Patterns: exact key, `prefix.*`, or `*`.
    pub fn subscribe(&self, pattern: &str, callback: StateCallback) -> u64 {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subs) = self.subs.write() {
            subs.push(StateSub {
                id,
                pattern: pattern.to_string(),
                callback,
            });
        }
        id
    }

    /// Remove a subscription; returns whether it existed.
    pub fn unsubscribe(&self, id: u64) -> bool {
        match self.subs.write() {
            Ok(mut subs) => {
                let before = subs.len();
                subs.retain(|s| s.id != id);
                subs.len() != before
            }
            Err(_) => false,
        }
    }

    /// Persist the store as pretty-printed JSON.
    ///
    /// Missing parent directories are created with mode 0755; the file
    /// is written owner read/write only.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dump = {
            let inner = match self.inner.read() {
                Ok(inner) => inner,
                Err(_) => return Err(RuntimeError::State("store lock poisoned".into())),
            };
            let map: serde_json::Map<String, Value> = inner
                .store
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            serde_json::to_string_pretty(&Value::Object(map))?
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                create_parent_dirs(parent)?;
            }
        }
        std::fs::write(path, dump)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Merge a persisted JSON object over the current store.
    ///
    /// A missing file or malformed content is an error. Subscribers are
    /// notified per merged key.
    pub fn load(&self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        let parsed: Value = serde_json::from_str(&text)?;
        let map = match parsed {
            Value::Object(map) => map,
            _ => {
                return Err(RuntimeError::State(format!(
                    "state file {} is not a JSON object",
                    path.display()
                )));
            }
        };

        let notifications: Vec<(String, Option<Value>, Value)> = {
            let mut inner = match self.inner.write() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.into_iter()
                .map(|(key, value)| {
                    let old = inner.store.insert(key.clone(), value.clone());
                    (key, old, value)
                })
                .collect()
        };
        for (key, old, new) in notifications {
            self.notify(&key, old.as_ref(), Some(&new));
        }
        Ok(())
    }

    fn notify(&self, key: &str, old: Option<&Value>, new: Option<&Value>) {
        let callbacks: Vec<StateCallback> = match self.subs.read() {
            Ok(subs) => subs
                .iter()
                .filter(|s| pattern_matches(&s.pattern, key))
                .map(|s| Arc::clone(&s.callback))
                .collect(),
            Err(_) => return,
        };
        // Lock released before callbacks run.
        for callback in callbacks {
            callback(key, old, new);
        }
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Create missing directory components of `dir` with mode 0755, even
/// under a stricter process umask.
fn create_parent_dirs(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    let created: Vec<std::path::PathBuf> = {
        let mut missing = Vec::new();
        let mut current = Some(dir);
        while let Some(component) = current {
            if component.as_os_str().is_empty() || component.exists() {
                break;
            }
            missing.push(component.to_path_buf());
            current = component.parent();
        }
        missing
    };

    std::fs::create_dir_all(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for component in created.iter().rev() {
            std::fs::set_permissions(component, std::fs::Permissions::from_mode(0o755))?;
        }
    }
    Ok(())
}

/// Whether `pattern` (exact, `prefix.*`, or `*`) matches `key`.
fn pattern_matches(pattern: &str, key: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return key
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'))
            || key == prefix;
    }
    pattern == key
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn set_get_delete() {
        let state = StateManager::new();
        state.set("a", json!(1));
        assert_eq!(state.get("a"), Some(json!(1)));
        state.delete("a");
        assert_eq!(state.get("a"), None);
    }

    #[test]
    fn keys_sorted_and_len() {
        let state = StateManager::new();
        state.set("b", json!(2));
        state.set("a", json!(1));
        assert_eq!(state.keys(), vec!["a", "b"]);
        assert_eq!(state.len(), 2);
        assert!(!state.is_empty());
    }

    #[test]
    fn transaction_rollback_restores() {
        let state = StateManager::new();
        state.set("keep", json!("old"));
        state.begin_transaction().unwrap();
        state.set("keep", json!("new"));
        state.set("fresh", json!(true));
        state.delete("keep");
        state.rollback().unwrap();
        assert_eq!(state.get("keep"), Some(json!("old")));
        assert_eq!(state.get("fresh"), None);
    }

    #[test]
    fn transaction_get_reads_through_changes() {
        let state = StateManager::new();
        state.set("k", json!(1));
        state.begin_transaction().unwrap();
        state.set("k", json!(2));
        assert_eq!(state.get("k"), Some(json!(2)));
        state.delete("k");
        assert_eq!(state.get("k"), None);
        state.rollback().unwrap();
        assert_eq!(state.get("k"), Some(json!(1)));
    }

    #[test]
    fn commit_applies_and_notifies_once_per_key() {
        let state = StateManager::new();
        state.set("a", json!("before"));

        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_clone = Arc::clone(&calls);
        state.subscribe(
            "*",
            Arc::new(move |key, old, new| {
                calls_clone
                    .lock()
                    .unwrap()
                    .push((key.to_string(), old.cloned(), new.cloned()));
            }),
        );

        state.begin_transaction().unwrap();
        state.set("a", json!("mid"));
        state.set("a", json!("after"));
        state.set("b", json!(1));
        state.commit().unwrap();

        let mut calls = calls.lock().unwrap().clone();
        calls.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0],
            ("a".to_string(), Some(json!("before")), Some(json!("after")))
        );
        assert_eq!(calls[1], ("b".to_string(), None, Some(json!(1))));
    }

    #[test]
    fn double_begin_rejected() {
        let state = StateManager::new();
        state.begin_transaction().unwrap();
        assert!(state.begin_transaction().is_err());
        state.rollback().unwrap();
        assert!(state.rollback().is_err());
        assert!(state.commit().is_err());
    }

    #[test]
    fn pattern_matching() {
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("a.b", "a.b"));
        assert!(!pattern_matches("a.b", "a.c"));
        assert!(pattern_matches("app.*", "app.theme"));
        assert!(pattern_matches("app.*", "app.nested.key"));
        assert!(pattern_matches("app.*", "app"));
        assert!(!pattern_matches("app.*", "apple"));
    }

    #[test]
    fn prefix_subscription_scoped() {
        let state = StateManager::new();
        let count = Arc::new(Mutex::new(0));
        let count_clone = Arc::clone(&count);
        state.subscribe(
            "ui.*",
            Arc::new(move |_, _, _| {
                *count_clone.lock().unwrap() += 1;
            }),
        );
        state.set("ui.theme", json!("dark"));
        state.set("net.host", json!("x"));
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn unsubscribe_state() {
        let state = StateManager::new();
        let count = Arc::new(Mutex::new(0));
        let count_clone = Arc::clone(&count);
        let id = state.subscribe(
            "*",
            Arc::new(move |_, _, _| {
                *count_clone.lock().unwrap() += 1;
            }),
        );
        assert!(state.unsubscribe(id));
        state.set("k", json!(1));
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let state = StateManager::new();
        state.set("name", json!("conch"));
        state.set("count", json!(3));
        state.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("  \"count\": 3"));

        let restored = StateManager::new();
        restored.set("extra", json!(true));
        restored.load(&path).unwrap();
        assert_eq!(restored.get("name"), Some(json!("conch")));
        assert_eq!(restored.get("extra"), Some(json!(true)));
    }

    #[test]
    #[cfg(unix)]
    fn save_sets_directory_and_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("state.json");

        let state = StateManager::new();
        state.set("k", json!(1));
        state.save(&path).unwrap();

        let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&path), 0o600);
        assert_eq!(mode(&dir.path().join("a")), 0o755);
        assert_eq!(mode(&dir.path().join("a").join("b")), 0o755);
    }

    #[test]
    fn load_missing_file_errors() {
        let state = StateManager::new();
        assert!(state.load(Path::new("/nonexistent/state.json")).is_err());
    }

    #[test]
    fn load_malformed_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();
        let state = StateManager::new();
        assert!(state.load(&path).is_err());
        std::fs::write(&path, "[1,2]").unwrap();
        assert!(state.load(&path).is_err());
    }

    #[test]
    fn clear_notifies() {
        let state = StateManager::new();
        state.set("a", json!(1));
        let count = Arc::new(Mutex::new(0));
        let count_clone = Arc::clone(&count);
        state.subscribe(
            "*",
            Arc::new(move |_, old, new| {
                assert!(old.is_some() && new.is_none());
                *count_clone.lock().unwrap() += 1;
            }),
        );
        state.clear();
        assert_eq!(*count.lock().unwrap(), 1);
        assert!(state.is_empty());
    }
}
