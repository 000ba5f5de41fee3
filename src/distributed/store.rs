//! Rendezvous key-value store

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Timeout for [`Store::get`] when the store was built without one
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(300);

/// Key-value store the ranks of a group use to find each other
///
/// Only used while a process group connects; never on the data path.
pub trait Store: Send + Sync {
    /// Set `key` to `value`, waking anyone waiting for it
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Value of `key`, waiting for it to be set
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Add `delta` to the integer stored at `key` (missing keys count as 0)
    fn add(&self, key: &str, delta: i64) -> Result<i64>;

    /// Whether every key is set
    fn check(&self, keys: &[&str]) -> Result<bool>;

    /// Block until every key is set, or fail with `Timeout`
    fn wait(&self, keys: &[&str], timeout: Duration) -> Result<()>;
}

/// In-memory [`Store`] shared by the ranks of one process
#[derive(Debug)]
pub struct HashStore {
    map: Mutex<HashMap<String, Vec<u8>>>,
    changed: Condvar,
    timeout: Duration,
}

impl HashStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_STORE_TIMEOUT)
    }

    /// Create an empty store whose `get` gives up after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            changed: Condvar::new(),
            timeout,
        }
    }

    /// Number of keys set
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Whether no key is set
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

impl Default for HashStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for HashStore {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.map.lock().insert(key.to_string(), value);
        self.changed.notify_all();
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.wait(&[key], self.timeout)?;
        self.map
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("store key '{key}' vanished")))
    }

    fn add(&self, key: &str, delta: i64) -> Result<i64> {
        let mut map = self.map.lock();
        let current = match map.get(key) {
            None => 0,
            Some(bytes) => {
                let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    Error::invalid_argument("key", format!("'{key}' does not hold a counter"))
                })?;
                i64::from_le_bytes(bytes)
            }
        };
        let value = current + delta;
        map.insert(key.to_string(), value.to_le_bytes().to_vec());
        drop(map);
        self.changed.notify_all();
        Ok(value)
    }

    fn check(&self, keys: &[&str]) -> Result<bool> {
        let map = self.map.lock();
        Ok(keys.iter().all(|key| map.contains_key(*key)))
    }

    fn wait(&self, keys: &[&str], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut map = self.map.lock();
        while !keys.iter().all(|key| map.contains_key(*key)) {
            if self.changed.wait_until(&mut map, deadline).timed_out()
                && !keys.iter().all(|key| map.contains_key(*key))
            {
                let missing: Vec<&str> = keys
                    .iter()
                    .copied()
                    .filter(|key| !map.contains_key(*key))
                    .collect();
                return Err(Error::Timeout {
                    what: format!("store keys {missing:?}"),
                    after: timeout,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_get() {
        let store = HashStore::new();
        store.set("a", vec![1, 2]).unwrap();
        assert_eq!(store.get("a").unwrap(), vec![1, 2]);
        assert!(store.check(&["a"]).unwrap());
        assert!(!store.check(&["a", "b"]).unwrap());
    }

    #[test]
    fn test_add_counts() {
        let store = HashStore::new();
        assert_eq!(store.add("n", 2).unwrap(), 2);
        assert_eq!(store.add("n", -5).unwrap(), -3);
        store.set("bytes", vec![1]).unwrap();
        assert!(store.add("bytes", 1).is_err());
    }

    #[test]
    fn test_wait_sees_later_set() {
        let store = Arc::new(HashStore::new());
        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                store.set("late", vec![7]).unwrap();
            })
        };
        store.wait(&["late"], Duration::from_secs(5)).unwrap();
        writer.join().unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let store = HashStore::with_timeout(Duration::from_millis(10));
        let err = store.wait(&["never"], Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(store.get("never").is_err());
    }
}
