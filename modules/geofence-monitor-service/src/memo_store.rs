//! Memo persistence.
//!
//! All memos live in one JSON document under the `memos` key, in the shape
//! `{ "state": { "memos": [...] }, "version": 2 }`. The monitor only reads it
//! through [`MemoStoreReader`]; the RPC layer mutates it through [`MemoStore`].
//!
//! Stored records are validated one by one. A memo that cannot be decoded is
//! skipped, and a location with bad coordinates or radius (or beyond the
//! per-memo limit) is left out of the memo it belongs to. Both are written
//! back untouched on the next mutation. A document whose root can't be read
//! at all is never overwritten: writes fail until it is repaired.

use crate::db::KeyValueStorage;
use geofence_monitor_types::{
    DEFAULT_RADIUS_METERS, MAX_LOCATIONS_PER_MEMO, MAX_RADIUS_METERS, MIN_RADIUS_METERS, Memo,
    MemoLocation, ShoppingItem, UpdateLocationRequest,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Storage key of the memo document
pub const MEMOS_KEY: &str = "memos";

const STORE_VERSION: u32 = 2;

/// Read-only view the monitor evaluates every cycle
pub trait MemoStoreReader: Send + Sync {
    fn list_memos(&self) -> Result<Vec<Memo>, String>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum MemoStoreError {
    NotFound(String),
    Invalid(String),
    Storage(String),
}

impl fmt::Display for MemoStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoStoreError::NotFound(what) => write!(f, "{} not found", what),
            MemoStoreError::Invalid(msg) => write!(f, "Invalid request: {}", msg),
            MemoStoreError::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

/// Fields for a new location
#[derive(Debug, Clone)]
pub struct NewLocation {
    pub label: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius: Option<f64>,
    pub address: Option<String>,
}

/// Location data a memo carries that can't be evaluated
#[derive(Debug, Default)]
struct SetAside {
    /// Entries that failed to decode, have bad geometry, or exceed the limit
    locations: Vec<Value>,
    /// A `locations` field that isn't an array
    field: Option<Value>,
}

/// Decoded memo document
#[derive(Debug, Default)]
struct MemoDocument {
    memos: Vec<Memo>,
    /// Records that failed to decode, kept so writes don't destroy them
    unreadable: Vec<Value>,
    /// Unusable location data per memo id, re-emitted on save
    set_aside: HashMap<String, SetAside>,
}

pub struct MemoStore {
    storage: Arc<dyn KeyValueStorage>,
    /// Serializes read-modify-write cycles on the document
    write_lock: Mutex<()>,
}

impl MemoStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    /// Tolerant read: a document that can't be decoded reads as empty
    fn load(&self) -> Result<MemoDocument, MemoStoreError> {
        let Some(raw) = self.read_raw()? else {
            return Ok(MemoDocument::default());
        };
        Ok(decode_document(&raw).unwrap_or_else(|e| {
            log::warn!("[GEOFENCE] {}, reading as empty", e);
            MemoDocument::default()
        }))
    }

    /// Strict read for read-modify-write, so data that couldn't be decoded
    /// is never replaced
    fn load_for_write(&self) -> Result<MemoDocument, MemoStoreError> {
        match self.read_raw()? {
            Some(raw) => decode_document(&raw).map_err(MemoStoreError::Storage),
            None => Ok(MemoDocument::default()),
        }
    }

    fn read_raw(&self) -> Result<Option<String>, MemoStoreError> {
        self.storage.get(MEMOS_KEY).map_err(MemoStoreError::Storage)
    }

    fn save(&self, doc: &MemoDocument) -> Result<(), MemoStoreError> {
        let mut records: Vec<Value> = Vec::with_capacity(doc.memos.len() + doc.unreadable.len());
        let mut emitted: Vec<&str> = Vec::new();
        for memo in &doc.memos {
            let mut value = serde_json::to_value(memo)
                .map_err(|e| MemoStoreError::Storage(format!("Failed to encode memo: {}", e)))?;
            // Duplicate ids get the set-aside data once
            if !emitted.contains(&memo.id.as_str()) {
                emitted.push(&memo.id);
                if let Some(aside) = doc.set_aside.get(&memo.id) {
                    restore_set_aside(&mut value, memo, aside);
                }
            }
            records.push(value);
        }
        records.extend(doc.unreadable.iter().cloned());

        let raw = json!({ "state": { "memos": records }, "version": STORE_VERSION }).to_string();
        self.storage
            .set(MEMOS_KEY, &raw)
            .map_err(MemoStoreError::Storage)
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Vec<Memo>) -> Result<T, MemoStoreError>,
    ) -> Result<T, MemoStoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut doc = self.load_for_write()?;
        let result = f(&mut doc.memos)?;
        self.save(&doc)?;
        Ok(result)
    }

    fn mutate_memo<T>(
        &self,
        memo_id: &str,
        f: impl FnOnce(&mut Memo) -> Result<T, MemoStoreError>,
    ) -> Result<T, MemoStoreError> {
        self.mutate(|memos| {
            let memo = memos
                .iter_mut()
                .find(|m| m.id == memo_id)
                .ok_or_else(|| MemoStoreError::NotFound(format!("Memo {}", memo_id)))?;
            let result = f(memo)?;
            memo.updated_at = now_ms();
            Ok(result)
        })
    }

    pub fn list(&self) -> Result<Vec<Memo>, MemoStoreError> {
        Ok(self.load()?.memos)
    }

    pub fn get(&self, memo_id: &str) -> Result<Option<Memo>, MemoStoreError> {
        Ok(self.load()?.memos.into_iter().find(|m| m.id == memo_id))
    }

    // ── Memos ───────────────────────────────────────────────

    /// New memos go to the front of the list with notifications on
    pub fn add_memo(&self, title: &str) -> Result<Memo, MemoStoreError> {
        let title = non_empty(title, "title")?;
        let now = now_ms();
        let memo = Memo {
            id: new_id(),
            title,
            items: Vec::new(),
            locations: Vec::new(),
            notification_enabled: true,
            completed: false,
            created_at: now,
            updated_at: now,
        };
        self.mutate(|memos| {
            memos.insert(0, memo.clone());
            Ok(())
        })?;
        Ok(memo)
    }

    pub fn update_memo(
        &self,
        memo_id: &str,
        title: Option<&str>,
        notification_enabled: Option<bool>,
    ) -> Result<Memo, MemoStoreError> {
        let title = title.map(|t| non_empty(t, "title")).transpose()?;
        self.mutate_memo(memo_id, |memo| {
            if let Some(title) = title {
                memo.title = title;
            }
            if let Some(enabled) = notification_enabled {
                memo.notification_enabled = enabled;
            }
            Ok(())
        })?;
        self.require(memo_id)
    }

    pub fn set_completed(&self, memo_id: &str, completed: bool) -> Result<Memo, MemoStoreError> {
        self.mutate_memo(memo_id, |memo| {
            memo.completed = completed;
            Ok(())
        })?;
        self.require(memo_id)
    }

    /// Returns false if no memo had that id
    pub fn delete_memo(&self, memo_id: &str) -> Result<bool, MemoStoreError> {
        self.mutate(|memos| {
            let before = memos.len();
            memos.retain(|m| m.id != memo_id);
            Ok(memos.len() != before)
        })
    }

    fn require(&self, memo_id: &str) -> Result<Memo, MemoStoreError> {
        self.get(memo_id)?
            .ok_or_else(|| MemoStoreError::NotFound(format!("Memo {}", memo_id)))
    }

    // ── Items ───────────────────────────────────────────────

    pub fn add_item(&self, memo_id: &str, name: &str) -> Result<ShoppingItem, MemoStoreError> {
        let item = ShoppingItem {
            id: new_id(),
            name: non_empty(name, "item name")?,
            is_checked: false,
            checked_at: None,
        };
        self.mutate_memo(memo_id, |memo| {
            memo.items.push(item.clone());
            Ok(())
        })?;
        Ok(item)
    }

    /// Flip the checked state; checking records the time, unchecking clears it
    pub fn toggle_item(&self, memo_id: &str, item_id: &str) -> Result<ShoppingItem, MemoStoreError> {
        self.mutate_memo(memo_id, |memo| {
            let item = memo
                .items
                .iter_mut()
                .find(|i| i.id == item_id)
                .ok_or_else(|| MemoStoreError::NotFound(format!("Item {}", item_id)))?;
            item.is_checked = !item.is_checked;
            item.checked_at = item.is_checked.then(now_ms);
            Ok(item.clone())
        })
    }

    pub fn delete_item(&self, memo_id: &str, item_id: &str) -> Result<bool, MemoStoreError> {
        self.mutate_memo(memo_id, |memo| {
            let before = memo.items.len();
            memo.items.retain(|i| i.id != item_id);
            Ok(memo.items.len() != before)
        })
    }

    // ── Locations ───────────────────────────────────────────

    pub fn add_location(
        &self,
        memo_id: &str,
        new: NewLocation,
    ) -> Result<MemoLocation, MemoStoreError> {
        let location = MemoLocation {
            id: new_id(),
            label: non_empty(&new.label, "label")?,
            latitude: new.latitude,
            longitude: new.longitude,
            radius: new.radius.unwrap_or(DEFAULT_RADIUS_METERS),
            address: new.address,
        };
        validate_location(&location)?;

        self.mutate_memo(memo_id, |memo| {
            if memo.locations.len() >= MAX_LOCATIONS_PER_MEMO {
                return Err(MemoStoreError::Invalid(format!(
                    "a memo can have at most {} locations",
                    MAX_LOCATIONS_PER_MEMO
                )));
            }
            memo.locations.push(location.clone());
            Ok(())
        })?;
        Ok(location)
    }

    pub fn update_location(
        &self,
        req: &UpdateLocationRequest,
    ) -> Result<MemoLocation, MemoStoreError> {
        let label = req
            .label
            .as_deref()
            .map(|l| non_empty(l, "label"))
            .transpose()?;

        self.mutate_memo(&req.memo_id, |memo| {
            let location = memo
                .locations
                .iter_mut()
                .find(|l| l.id == req.location_id)
                .ok_or_else(|| MemoStoreError::NotFound(format!("Location {}", req.location_id)))?;

            let mut updated = location.clone();
            if let Some(label) = label {
                updated.label = label;
            }
            if let Some(lat) = req.latitude {
                updated.latitude = lat;
            }
            if let Some(lon) = req.longitude {
                updated.longitude = lon;
            }
            if let Some(radius) = req.radius {
                updated.radius = radius;
            }
            if let Some(address) = &req.address {
                updated.address = Some(address.clone());
            }
            validate_location(&updated)?;

            *location = updated.clone();
            Ok(updated)
        })
    }

    pub fn delete_location(&self, memo_id: &str, location_id: &str) -> Result<bool, MemoStoreError> {
        self.mutate_memo(memo_id, |memo| {
            let before = memo.locations.len();
            memo.locations.retain(|l| l.id != location_id);
            Ok(memo.locations.len() != before)
        })
    }
}

impl MemoStoreReader for MemoStore {
    fn list_memos(&self) -> Result<Vec<Memo>, String> {
        self.list().map_err(|e| e.to_string())
    }
}

fn validate_location(location: &MemoLocation) -> Result<(), MemoStoreError> {
    if !location.is_well_formed() {
        return Err(MemoStoreError::Invalid(format!(
            "coordinates ({}, {}) are out of range",
            location.latitude, location.longitude
        )));
    }
    if !(MIN_RADIUS_METERS..=MAX_RADIUS_METERS).contains(&location.radius) {
        return Err(MemoStoreError::Invalid(format!(
            "radius must be between {} and {} meters",
            MIN_RADIUS_METERS, MAX_RADIUS_METERS
        )));
    }
    Ok(())
}

fn non_empty(value: &str, field: &str) -> Result<String, MemoStoreError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(MemoStoreError::Invalid(format!("{} must not be empty", field)));
    }
    Ok(trimmed.to_string())
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Put a memo's unusable location data back into its encoded record
fn restore_set_aside(value: &mut Value, memo: &Memo, aside: &SetAside) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };
    if !aside.locations.is_empty() {
        if let Some(Value::Array(locations)) = obj.get_mut("locations") {
            locations.extend(aside.locations.iter().cloned());
        }
    } else if let Some(field) = &aside.field {
        // Only while nothing replaced it
        if memo.locations.is_empty() {
            obj.insert("locations".to_string(), field.clone());
        }
    }
}

/// Decode the stored document, accepting both the wrapped shape and a bare
/// array. Errors if the root is not JSON or holds no memo array.
fn decode_document(raw: &str) -> Result<MemoDocument, String> {
    let root: Value = serde_json::from_str(raw)
        .map_err(|e| format!("Memo store is not valid JSON: {}", e))?;

    let records = match root.pointer("/state/memos").or(Some(&root)) {
        Some(Value::Array(records)) => records.clone(),
        _ => return Err("Memo store has no memo array".to_string()),
    };

    let mut doc = MemoDocument::default();
    for record in records {
        match decode_memo(&record) {
            Some((memo, aside)) => {
                if !aside.locations.is_empty() || aside.field.is_some() {
                    doc.set_aside.entry(memo.id.clone()).or_insert(aside);
                }
                doc.memos.push(memo);
            }
            None => doc.unreadable.push(record),
        }
    }
    Ok(doc)
}

fn decode_memo(record: &Value) -> Option<(Memo, SetAside)> {
    let mut shell = record.clone();
    let raw_locations = match shell.as_object_mut() {
        Some(obj) => obj.remove("locations"),
        None => {
            log::warn!("[GEOFENCE] Skipping memo record that is not an object");
            return None;
        }
    };

    let mut memo: Memo = match serde_json::from_value(shell) {
        Ok(m) => m,
        Err(e) => {
            log::warn!("[GEOFENCE] Skipping malformed memo record: {}", e);
            return None;
        }
    };
    if memo.id.is_empty() {
        log::warn!("[GEOFENCE] Skipping memo record without an id");
        return None;
    }

    let mut aside = SetAside::default();
    let raw_locations = match raw_locations {
        Some(Value::Array(locations)) => locations,
        Some(Value::Null) | None => Vec::new(),
        Some(other) => {
            log::warn!(
                "[GEOFENCE] Memo {} has non-array locations ({}), ignoring them",
                memo.id,
                other
            );
            aside.field = Some(other);
            Vec::new()
        }
    };

    for raw in raw_locations {
        match serde_json::from_value::<MemoLocation>(raw.clone()) {
            Ok(location) if location.is_well_formed() => {
                if memo.locations.len() < MAX_LOCATIONS_PER_MEMO {
                    memo.locations.push(location);
                } else {
                    log::warn!(
                        "[GEOFENCE] Memo {} location {} is over the limit of {}, skipping",
                        memo.id,
                        location.id,
                        MAX_LOCATIONS_PER_MEMO
                    );
                    aside.locations.push(raw);
                }
            }
            Ok(location) => {
                log::warn!(
                    "[GEOFENCE] Memo {} location {} has invalid geometry, skipping",
                    memo.id,
                    location.id
                );
                aside.locations.push(raw);
            }
            Err(e) => {
                log::warn!(
                    "[GEOFENCE] Memo {} has a malformed location, skipping: {}",
                    memo.id,
                    e
                );
                aside.locations.push(raw);
            }
        }
    }

    Some((memo, aside))
}
