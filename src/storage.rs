use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::fingerprint::Fingerprint;

/// Key-value contract a [`crate::Cache`] delegates to.
///
/// Implementors are expected to be cheap to share (the core and user code
/// both hold a reference), so all methods take `&self`.
pub trait Storage: Send + Sync {
    /// Whether a response for `key` is stored.
    fn has(&self, key: &Fingerprint) -> bool;
    /// The stored response for `key`, if any.
    fn get(&self, key: &Fingerprint) -> Option<Value>;
    /// Stores `value` under `key`, and updates the `msg_type` index with it.
    fn set(&self, key: Fingerprint, value: Value);
    /// The most recently stored response carrying this `msg_type`, if any.
    fn get_by_msg_type(&self, msg_type: &str) -> Option<Value>;
}

/// In-memory [`Storage`]: a key→response map plus a `msg_type`→last-response
/// index, exactly as spec §4.2 describes. Grounded on
/// `original_source/deriv_api/in_memory.py`.
#[derive(Default)]
pub struct InMemoryStorage {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    by_key: HashMap<Fingerprint, Value>,
    by_msg_type: HashMap<String, Value>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn has(&self, key: &Fingerprint) -> bool {
        self.inner.lock().unwrap().by_key.contains_key(key)
    }

    fn get(&self, key: &Fingerprint) -> Option<Value> {
        self.inner.lock().unwrap().by_key.get(key).cloned()
    }

    fn set(&self, key: Fingerprint, value: Value) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(msg_type) = value.get("msg_type").and_then(Value::as_str) {
            inner.by_msg_type.insert(msg_type.to_owned(), value.clone());
        }
        inner.by_key.insert(key, value);
    }

    fn get_by_msg_type(&self, msg_type: &str) -> Option<Value> {
        self.inner.lock().unwrap().by_msg_type.get(msg_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tracks_last_response_by_msg_type() {
        let storage = InMemoryStorage::new();
        let key1 = Fingerprint::of(&json!({"ticks": "R_50"}));
        let key2 = Fingerprint::of(&json!({"ticks": "R_100"}));

        storage.set(key1.clone(), json!({"msg_type": "tick", "quote": 1}));
        storage.set(key2.clone(), json!({"msg_type": "tick", "quote": 2}));

        assert!(storage.has(&key1));
        assert_eq!(storage.get(&key1).unwrap()["quote"], 1);
        assert_eq!(storage.get_by_msg_type("tick").unwrap()["quote"], 2);
    }
}
