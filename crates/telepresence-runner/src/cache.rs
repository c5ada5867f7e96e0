use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

/// Key-value store persisted to `~/.cache/telepresence/cache.json`.
///
/// Values live under a per-context scope; keys may contain `/` to address
/// nested maps (e.g. `ip-list/db.example.com`). The whole store is dropped
/// once it is older than the TTL handed to [`Cache::invalidate`].
pub struct Cache {
    path: PathBuf,
    root: Map<String, Value>,
}

impl Cache {
    /// Load the cache, starting fresh if the file is missing or unreadable.
    pub fn load(path: &Path) -> Cache {
        let root = fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str::<Value>(&text).ok())
            .and_then(|value| match value {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default();
        Cache {
            path: path.to_path_buf(),
            root,
        }
    }

    /// Drop all entries when the store is older than `ttl`.
    pub fn invalidate(&mut self, ttl: Duration) {
        let now = unix_now();
        let created = self
            .root
            .get("created")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if now.saturating_sub(created) > ttl.as_secs() {
            self.root.clear();
            self.root.insert("created".to_string(), Value::from(now));
        }
    }

    pub fn get<T: DeserializeOwned>(&self, scope: &str, key: &str) -> Option<T> {
        let mut node = self.root.get(scope)?;
        for part in key.split('/') {
            node = node.as_object()?.get(part)?;
        }
        serde_json::from_value(node.clone()).ok()
    }

    pub fn insert<T: Serialize>(&mut self, scope: &str, key: &str, value: &T) {
        let Ok(value) = serde_json::to_value(value) else {
            return;
        };
        let mut node = self
            .root
            .entry(scope.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        let mut parts = key.split('/').peekable();
        while let Some(part) = parts.next() {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let map = node.as_object_mut().unwrap();
            if parts.peek().is_none() {
                map.insert(part.to_string(), value);
                return;
            }
            node = map
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
    }

    /// Flush to disk atomically (write-then-rename).
    pub fn save(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&Value::Object(self.root.clone()))?)?;
        fs::rename(&tmp, &self.path)?;
        debug!("saved cache to {}", self.path.display());
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn scratch_path() -> PathBuf {
        let nonce: u32 = rand::thread_rng().gen();
        std::env::temp_dir().join(format!("tel-cache-test-{:08x}.json", nonce))
    }

    #[test]
    fn round_trips_nested_keys() {
        let path = scratch_path();
        let mut cache = Cache::load(&path);
        cache.insert("minikube", "podCIDRs", &vec!["10.0.0.0/24".to_string()]);
        cache.insert("minikube", "ip-list/db.example.com", &vec!["10.1.2.3".to_string()]);
        cache.save().unwrap();

        let cache = Cache::load(&path);
        let cidrs: Vec<String> = cache.get("minikube", "podCIDRs").unwrap();
        assert_eq!(cidrs, vec!["10.0.0.0/24"]);
        let ips: Vec<String> = cache.get("minikube", "ip-list/db.example.com").unwrap();
        assert_eq!(ips, vec!["10.1.2.3"]);
        assert_eq!(cache.get::<Vec<String>>("minikube", "serviceCIDR"), None);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn invalidate_clears_stale_entries() {
        let path = scratch_path();
        let mut cache = Cache::load(&path);
        cache.insert("ctx", "serviceCIDR", &"10.96.0.0/12".to_string());
        // No "created" stamp at all counts as infinitely old.
        cache.invalidate(Duration::from_secs(12 * 60 * 60));
        assert_eq!(cache.get::<String>("ctx", "serviceCIDR"), None);

        cache.insert("ctx", "serviceCIDR", &"10.96.0.0/12".to_string());
        cache.invalidate(Duration::from_secs(12 * 60 * 60));
        assert_eq!(
            cache.get::<String>("ctx", "serviceCIDR").as_deref(),
            Some("10.96.0.0/12")
        );
        let _ = fs::remove_file(&path);
    }
}
