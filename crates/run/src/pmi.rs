//! In-client PMI key/value store.
//!
//! Tasks publish rendezvous data with kvs-put and read their peers' with
//! kvs-get over the response channel. The store is a plain map; the launch
//! bitmaps never see this traffic.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct KvsStore {
    map: Mutex<HashMap<(String, String), String>>,
}

impl KvsStore {
    pub fn put(&self, kvs_name: &str, key: &str, value: &str) {
        self.map
            .lock()
            .unwrap()
            .insert((kvs_name.to_string(), key.to_string()), value.to_string());
    }

    pub fn get(&self, kvs_name: &str, key: &str) -> Option<String> {
        self.map
            .lock()
            .unwrap()
            .get(&(kvs_name.to_string(), key.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_overwrite() {
        let store = KvsStore::default();
        assert!(store.get("kvs", "a").is_none());
        store.put("kvs", "a", "1");
        store.put("kvs", "a", "2");
        assert_eq!(store.get("kvs", "a").as_deref(), Some("2"));
        assert_eq!(store.len(), 1);
        // Different namespaces do not collide.
        store.put("other", "a", "3");
        assert_eq!(store.get("kvs", "a").as_deref(), Some("2"));
        assert_eq!(store.get("other", "a").as_deref(), Some("3"));
    }
}
