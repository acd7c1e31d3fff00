//! Get-or-load cache for heavy external assets (label masks, mesh
//! payloads) that outlive the views requesting them.
//!
//! Keys are normalized resource identities, so `HTTPS://Host/a/?t=1` and
//! `https://host/a` share one entry. Every entry is tagged with the study
//! generation that loaded it; replacing the study evicts the rest.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Normalized identity of an external resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(String);

impl ResourceId {
    /// Lowercase the scheme and host, strip query and fragment, and drop a
    /// trailing slash from the path. Plain paths only lose the suffixes.
    pub fn normalize(raw: &str) -> Self {
        let raw = raw.trim();
        let end = raw.find(['?', '#']).unwrap_or(raw.len());
        let raw = &raw[..end];

        let normalized = match raw.split_once("://") {
            Some((scheme, rest)) => {
                let (authority, path) = match rest.find('/') {
                    Some(slash) => rest.split_at(slash),
                    None => (rest, ""),
                };
                format!(
                    "{}://{}{}",
                    scheme.to_ascii_lowercase(),
                    authority.to_ascii_lowercase(),
                    path.trim_end_matches('/')
                )
            }
            None => {
                let trimmed = raw.trim_end_matches('/');
                if trimmed.is_empty() && !raw.is_empty() {
                    "/".to_owned()
                } else {
                    trimmed.to_owned()
                }
            }
        };
        ResourceId(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(raw: &str) -> Self {
        ResourceId::normalize(raw)
    }
}

#[derive(Debug)]
struct CachedAsset<V> {
    value: Arc<V>,
    generation: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug)]
pub struct AssetCache<V> {
    entries: HashMap<ResourceId, CachedAsset<V>>,
    generation: u64,
    hits: u64,
    misses: u64,
}

impl<V> Default for AssetCache<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            generation: 0,
            hits: 0,
            misses: 0,
        }
    }
}

impl<V> AssetCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation new entries are tagged with.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Return the cached asset or run `load` and cache its result.
    /// Failed loads are not cached.
    pub fn get_or_load<E>(
        &mut self,
        id: &ResourceId,
        load: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        if let Some(entry) = self.entries.get(id) {
            self.hits += 1;
            return Ok(Arc::clone(&entry.value));
        }
        self.misses += 1;
        let value = Arc::new(load()?);
        self.insert_arc(id.clone(), Arc::clone(&value));
        Ok(value)
    }

    pub fn get(&self, id: &ResourceId) -> Option<Arc<V>> {
        self.entries.get(id).map(|entry| Arc::clone(&entry.value))
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.entries.contains_key(id)
    }

    /// Store an asset resolved elsewhere, e.g. by an async fetch.
    pub fn insert(&mut self, id: ResourceId, value: V) -> Arc<V> {
        let value = Arc::new(value);
        self.insert_arc(id, Arc::clone(&value));
        value
    }

    fn insert_arc(&mut self, id: ResourceId, value: Arc<V>) {
        self.entries.insert(
            id,
            CachedAsset {
                value,
                generation: self.generation,
            },
        );
    }

    /// Drop every entry not loaded for `generation`. Returns how many were
    /// evicted.
    pub fn evict_except(&mut self, generation: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.generation == generation);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, generation, "evicted cached assets");
        }
        evicted
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_normalization() {
        assert_eq!(
            ResourceId::normalize("HTTPS://Example.ORG/Studies/42/mask.nii.gz?token=abc#frag").as_str(),
            "https://example.org/Studies/42/mask.nii.gz"
        );
        assert_eq!(
            ResourceId::normalize("https://example.org/models/"),
            ResourceId::normalize("https://EXAMPLE.org/models")
        );
        assert_eq!(ResourceId::normalize("data/Mask.nii/").as_str(), "data/Mask.nii");
        assert_eq!(ResourceId::normalize("/").as_str(), "/");
    }

    #[test]
    fn loads_once_per_identity() {
        let mut cache = AssetCache::new();
        let mut calls = 0;
        for raw in ["https://host/a?x=1", "HTTPS://HOST/a/", "https://host/a"] {
            let value = cache
                .get_or_load::<()>(&ResourceId::normalize(raw), || {
                    calls += 1;
                    Ok(7)
                })
                .unwrap();
            assert_eq!(*value, 7);
        }
        assert_eq!(calls, 1);
        assert_eq!(
            cache.stats(),
            CacheStats {
                entries: 1,
                hits: 2,
                misses: 1
            }
        );
    }

    #[test]
    fn failed_loads_are_not_cached() {
        let mut cache: AssetCache<u32> = AssetCache::new();
        let id = ResourceId::normalize("mask");
        assert_eq!(cache.get_or_load(&id, || Err("offline")), Err("offline"));
        assert!(!cache.contains(&id));
        assert_eq!(*cache.get_or_load::<&str>(&id, || Ok(3)).unwrap(), 3);
    }

    #[test]
    fn eviction_keeps_active_generation() {
        let mut cache = AssetCache::new();
        cache.insert("old".into(), 1);
        cache.set_generation(1);
        cache.insert("new".into(), 2);
        assert_eq!(cache.evict_except(1), 1);
        assert!(cache.get(&"old".into()).is_none());
        assert_eq!(cache.get(&"new".into()).as_deref(), Some(&2));
    }
}
