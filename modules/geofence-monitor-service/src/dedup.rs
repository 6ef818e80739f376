//! Durable set of geofences the device is currently inside.
//!
//! A key is present from the cycle that detects entry until the cycle that
//! detects exit, so a geofence notifies once per visit and again on the next
//! visit. The set lives in memory and is written to storage as a JSON array
//! only when it changed.
//!
//! Writes that fail leave the cache dirty and are retried on the next flush.
//! If the process dies between a mutation and a successful flush, the next
//! start reloads the older set and an arrival may notify a second time.

use crate::db::KeyValueStorage;
use geofence_monitor_types::GeofenceKey;
use std::collections::HashSet;
use std::sync::Arc;

/// Storage key holding the JSON array of inside keys
pub const INSIDE_CACHE_KEY: &str = "inside_geofences";

pub struct DedupCache {
    storage: Arc<dyn KeyValueStorage>,
    inside: HashSet<GeofenceKey>,
    dirty: bool,
}

impl DedupCache {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            storage,
            inside: HashSet::new(),
            dirty: false,
        }
    }

    /// Replace the in-memory set with what storage holds.
    ///
    /// Missing or unreadable data yields an empty set. Unflushed changes are
    /// written first; if that write fails the in-memory set is kept as is.
    pub fn load(&mut self) {
        if self.dirty && !self.flush_if_dirty() {
            log::warn!(
                "[GEOFENCE] Keeping {} unflushed cache entries instead of reloading",
                self.inside.len()
            );
            return;
        }

        self.inside = match self.storage.get(INSIDE_CACHE_KEY) {
            Ok(Some(raw)) => parse_keys(&raw),
            Ok(None) => HashSet::new(),
            Err(e) => {
                log::warn!("[GEOFENCE] Failed to read inside cache, starting empty: {}", e);
                HashSet::new()
            }
        };
        self.dirty = false;

        log::debug!("[GEOFENCE] Loaded {} inside geofences", self.inside.len());
    }

    pub fn contains(&self, key: &GeofenceKey) -> bool {
        self.inside.contains(key)
    }

    /// Returns true if the key was not already present
    pub fn mark_entered(&mut self, key: GeofenceKey) -> bool {
        let inserted = self.inside.insert(key);
        self.dirty |= inserted;
        inserted
    }

    /// Returns true if the key was present
    pub fn mark_exited(&mut self, key: &GeofenceKey) -> bool {
        let removed = self.inside.remove(key);
        self.dirty |= removed;
        removed
    }

    /// Drop every key belonging to a memo. Returns how many were removed.
    pub fn purge(&mut self, memo_id: &str) -> usize {
        let before = self.inside.len();
        self.inside.retain(|k| k.memo_id() != memo_id);
        let removed = before - self.inside.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    pub fn purge_location(&mut self, memo_id: &str, location_id: &str) -> bool {
        self.mark_exited(&GeofenceKey::new(memo_id, location_id))
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.inside.len()
    }

    /// Current keys in stable order
    pub fn keys(&self) -> Vec<GeofenceKey> {
        let mut keys: Vec<GeofenceKey> = self.inside.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Persist the set unconditionally. Clears the dirty flag on success.
    pub fn flush(&mut self) -> Result<(), String> {
        let keys: Vec<&str> = {
            let mut keys: Vec<&str> = self.inside.iter().map(|k| k.as_str()).collect();
            keys.sort_unstable();
            keys
        };
        let raw = serde_json::to_string(&keys)
            .map_err(|e| format!("Failed to encode inside cache: {}", e))?;
        self.storage.set(INSIDE_CACHE_KEY, &raw)?;
        self.dirty = false;
        Ok(())
    }

    /// Flush only when something changed. Failures are logged, not returned.
    /// Returns false if a write was attempted and failed.
    pub fn flush_if_dirty(&mut self) -> bool {
        if !self.dirty {
            return true;
        }
        match self.flush() {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[GEOFENCE] Inside cache flush failed, will retry: {}", e);
                false
            }
        }
    }
}

fn parse_keys(raw: &str) -> HashSet<GeofenceKey> {
    let entries: Vec<serde_json::Value> = match serde_json::from_str(raw) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("[GEOFENCE] Inside cache is corrupt, starting empty: {}", e);
            return HashSet::new();
        }
    };

    entries
        .iter()
        .filter_map(|entry| {
            let key = entry.as_str().and_then(GeofenceKey::parse);
            if key.is_none() {
                log::warn!("[GEOFENCE] Dropping malformed cache entry: {}", entry);
            }
            key
        })
        .collect()
}
