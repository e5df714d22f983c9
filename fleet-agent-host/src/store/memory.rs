//! In-memory document store for tests
//!
//! Applies field operations the way the gateway does and notifies watchers
//! synchronously, so tests can assert on both the resulting documents and the
//! exact patches the agent sent.

use super::{DocStream, DocumentStore, FieldOp, Patch, Snapshot, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

struct MemoryWatcher {
    path: String,
    collection: bool,
    tx: mpsc::UnboundedSender<Snapshot>,
}

impl MemoryWatcher {
    fn wants(&self, path: &str) -> bool {
        if self.collection {
            path.strip_prefix(self.path.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .is_some_and(|id| !id.contains('/'))
        } else {
            self.path == path
        }
    }
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<String, Value>,
    watchers: Vec<MemoryWatcher>,
    updates: Vec<(String, Patch)>,
    version: u64,
    fail_updates: bool,
}

impl Inner {
    fn snapshot(&self, path: &str) -> Snapshot {
        let data = self.docs.get(path).cloned().unwrap_or(Value::Null);
        Snapshot {
            path: path.to_string(),
            exists: self.docs.contains_key(path),
            version: self.version,
            data,
        }
    }

    fn notify(&mut self, path: &str) {
        self.version += 1;
        let snapshot = self.snapshot(path);
        self.watchers
            .retain(|w| !w.wants(path) || w.tx.send(snapshot.clone()).is_ok());
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, document: Value) {
        let mut inner = self.inner.lock();
        inner.docs.insert(path.to_string(), document);
        inner.notify(path);
    }

    pub fn remove(&self, path: &str) {
        let mut inner = self.inner.lock();
        inner.docs.remove(path);
        inner.notify(path);
    }

    pub fn document(&self, path: &str) -> Option<Value> {
        self.inner.lock().docs.get(path).cloned()
    }

    pub fn updates(&self) -> Vec<(String, Patch)> {
        self.inner.lock().updates.clone()
    }

    pub fn updates_for(&self, path: &str) -> Vec<Patch> {
        self.inner
            .lock()
            .updates
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, patch)| patch.clone())
            .collect()
    }

    pub fn clear_updates(&self) {
        self.inner.lock().updates.clear();
    }

    pub fn fail_updates(&self, fail: bool) {
        self.inner.lock().fail_updates = fail;
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn watch(&self, path: &str) -> Result<DocStream, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let _ = tx.send(inner.snapshot(path));
        inner.watchers.push(MemoryWatcher {
            path: path.to_string(),
            collection: false,
            tx,
        });
        Ok(DocStream::new(rx))
    }

    async fn watch_collection(&self, collection: &str) -> Result<DocStream, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let watcher = MemoryWatcher {
            path: collection.to_string(),
            collection: true,
            tx,
        };
        let existing: Vec<String> = inner
            .docs
            .keys()
            .filter(|path| watcher.wants(path))
            .cloned()
            .collect();
        for path in existing {
            let _ = watcher.tx.send(inner.snapshot(&path));
        }
        inner.watchers.push(watcher);
        Ok(DocStream::new(rx))
    }

    async fn get(&self, path: &str) -> Result<Snapshot, StoreError> {
        Ok(self.inner.lock().snapshot(path))
    }

    async fn update(&self, path: &str, patch: Patch) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.fail_updates {
            return Err(StoreError::Closed);
        }
        inner.updates.push((path.to_string(), patch.clone()));
        let document = inner
            .docs
            .entry(path.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        apply_patch(document, &patch);
        inner.notify(path);
        Ok(())
    }
}

/// Apply field operations to a JSON document
pub fn apply_patch(document: &mut Value, patch: &Patch) {
    for op in &patch.ops {
        match op {
            FieldOp::Set { field, value } => {
                if let Some((parent, key)) = parent_of(document, field) {
                    parent.insert(key, value.clone());
                }
            }
            FieldOp::Delete { field } => {
                if let Some((parent, key)) = parent_of(document, field) {
                    parent.remove(&key);
                }
            }
            FieldOp::ArrayUnion { field, values } => {
                if let Some(items) = array_at(document, field) {
                    for value in values {
                        if !items.contains(value) {
                            items.push(value.clone());
                        }
                    }
                }
            }
            FieldOp::ArrayRemove { field, values } => {
                if let Some(items) = array_at(document, field) {
                    items.retain(|item| !values.contains(item));
                }
            }
        }
    }
}

/// Walk to the object holding the last segment, creating objects on the way
fn parent_of<'a>(document: &'a mut Value, field: &str) -> Option<(&'a mut Map<String, Value>, String)> {
    let mut segments: Vec<&str> = field.split('.').collect();
    let last = segments.pop()?.to_string();
    let mut current = document;
    for segment in segments {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = current
            .as_object_mut()?
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    Some((current.as_object_mut()?, last))
}

fn array_at<'a>(document: &'a mut Value, field: &str) -> Option<&'a mut Vec<Value>> {
    let (parent, key) = parent_of(document, field)?;
    let slot = parent.entry(key).or_insert_with(|| Value::Array(Vec::new()));
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    slot.as_array_mut()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_nested_set_and_delete() {
        let mut doc = json!({"files": {"a": {"name": "a.img"}}});
        let patch = Patch::new()
            .set("files.a.lastCheck", "2024-01-01T00:00:00Z")
            .set("files.b", json!({"name": "b.img"}))
            .delete("files.a.name");
        apply_patch(&mut doc, &patch);

        assert_eq!(
            doc,
            json!({"files": {
                "a": {"lastCheck": "2024-01-01T00:00:00Z"},
                "b": {"name": "b.img"},
            }})
        );
    }

    #[test]
    fn test_apply_array_ops() {
        let mut doc = json!({"commands": [{"id": "1"}, {"id": "2"}]});
        let patch = Patch::new()
            .array_remove("commands", vec![json!({"id": "1"})])
            .array_union("rtc.answerIceCandidates", vec![json!("c1"), json!("c1")]);
        apply_patch(&mut doc, &patch);

        assert_eq!(doc["commands"], json!([{"id": "2"}]));
        assert_eq!(doc["rtc"]["answerIceCandidates"], json!(["c1"]));
    }

    #[tokio::test]
    async fn test_watchers_see_updates() {
        let store = MemoryStore::new();
        store.insert("storagepools/p1", json!({"name": "one"}));

        let mut pools = store.watch_collection("storagepools").await.unwrap();
        let mut node = store.watch("nodes/n1").await.unwrap();

        assert_eq!(pools.next().await.unwrap().data["name"], "one");
        assert!(!node.next().await.unwrap().exists);

        store.update("nodes/n1", Patch::new().set("name", "n1")).await.unwrap();
        let snapshot = node.next().await.unwrap();
        assert!(snapshot.exists);
        assert_eq!(snapshot.data["name"], "n1");
    }
}
