//! Thread-safe store of materialized ingester configurations. The config
//! loader is the only writer; the orchestrator reads snapshots and watches
//! the version channel for change notifications.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tokio::sync::watch;

use zen_common::IngesterConfig;

pub struct IngesterStore {
    map: RwLock<HashMap<String, IngesterConfig>>,
    version: AtomicU64,
    notify: watch::Sender<u64>,
}

impl Default for IngesterStore {
    fn default() -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            map: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
            notify,
        }
    }
}

impl IngesterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receives a bumped version number on every effective change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    fn bump(&self) {
        let v = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.notify.send(v);
    }

    /// Replace every config belonging to `namespace/name` with `configs`.
    pub fn replace_ingester(&self, namespace: &str, name: &str, configs: Vec<IngesterConfig>) {
        let changed = {
            let mut map = self.map.write().expect("ingester store lock poisoned");
            let old_keys: Vec<String> = map
                .values()
                .filter(|c| c.config.namespace == namespace && c.config.ingester_name == name)
                .map(|c| c.key.clone())
                .collect();

            let unchanged = old_keys.len() == configs.len()
                && configs
                    .iter()
                    .all(|c| map.get(&c.key).is_some_and(|old| old == c));
            if unchanged {
                false
            } else {
                for key in old_keys {
                    map.remove(&key);
                }
                for config in configs {
                    map.insert(config.key.clone(), config);
                }
                true
            }
        };
        if changed {
            self.bump();
        }
    }

    pub fn remove_ingester(&self, namespace: &str, name: &str) {
        let changed = {
            let mut map = self.map.write().expect("ingester store lock poisoned");
            let keys: Vec<String> = map
                .values()
                .filter(|c| c.config.namespace == namespace && c.config.ingester_name == name)
                .map(|c| c.key.clone())
                .collect();
            for key in &keys {
                map.remove(key);
            }
            !keys.is_empty()
        };
        if changed {
            self.bump();
        }
    }

    /// Swap in a full relist result.
    pub fn replace_all(&self, configs: Vec<IngesterConfig>) {
        {
            let mut map = self.map.write().expect("ingester store lock poisoned");
            map.clear();
            for config in configs {
                map.insert(config.key.clone(), config);
            }
        }
        self.bump();
    }

    pub fn snapshot(&self) -> Vec<IngesterConfig> {
        self.map
            .read()
            .expect("ingester store lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<IngesterConfig> {
        self.map
            .read()
            .expect("ingester store lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.map.read().expect("ingester store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zen_common::{DedupConfig, FilterConfig, ProcessingConfig, SourceConfig};

    fn config(ns: &str, ingester: &str, source: &str) -> IngesterConfig {
        let key = format!("{ns}/{ingester}/{source}");
        IngesterConfig {
            key: key.clone(),
            config: SourceConfig {
                source: key,
                source_name: source.to_string(),
                ingester: "webhook".to_string(),
                namespace: ns.to_string(),
                ingester_name: ingester.to_string(),
                webhook: None,
                informer: None,
                filter: FilterConfig::default(),
                dedup: DedupConfig::default(),
                normalization: None,
                processing: ProcessingConfig::default(),
                destinations: Vec::new(),
            },
        }
    }

    #[test]
    fn replace_swaps_an_ingesters_sources() {
        let store = IngesterStore::new();
        store.replace_ingester(
            "default",
            "scanners",
            vec![config("default", "scanners", "a"), config("default", "scanners", "b")],
        );
        assert_eq!(store.len(), 2);

        // Renaming b → c drops b.
        store.replace_ingester(
            "default",
            "scanners",
            vec![config("default", "scanners", "a"), config("default", "scanners", "c")],
        );
        assert_eq!(store.len(), 2);
        assert!(store.get("default/scanners/b").is_none());
        assert!(store.get("default/scanners/c").is_some());
    }

    #[test]
    fn replace_does_not_touch_other_ingesters() {
        let store = IngesterStore::new();
        store.replace_ingester("default", "one", vec![config("default", "one", "a")]);
        store.replace_ingester("default", "two", vec![config("default", "two", "b")]);
        store.replace_ingester("default", "one", vec![]);
        assert_eq!(store.len(), 1);
        assert!(store.get("default/two/b").is_some());
    }

    #[test]
    fn remove_ingester_drops_all_its_sources() {
        let store = IngesterStore::new();
        store.replace_ingester(
            "default",
            "scanners",
            vec![config("default", "scanners", "a"), config("default", "scanners", "b")],
        );
        store.remove_ingester("default", "scanners");
        assert!(store.is_empty());
    }

    #[test]
    fn unchanged_replace_does_not_notify() {
        let store = IngesterStore::new();
        let mut rx = store.subscribe();
        store.replace_ingester("default", "one", vec![config("default", "one", "a")]);
        assert!(rx.has_changed().unwrap());
        rx.mark_unchanged();

        store.replace_ingester("default", "one", vec![config("default", "one", "a")]);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn replace_all_resets_everything() {
        let store = IngesterStore::new();
        store.replace_ingester("default", "one", vec![config("default", "one", "a")]);
        store.replace_all(vec![config("prod", "two", "x")]);
        assert_eq!(store.len(), 1);
        assert!(store.get("prod/two/x").is_some());
    }
}
