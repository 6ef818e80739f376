//! Shared types for the geofence monitor service and its RPC clients.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A memo may carry at most this many locations
pub const MAX_LOCATIONS_PER_MEMO: usize = 3;

/// Smallest geofence radius accepted from clients (meters)
pub const MIN_RADIUS_METERS: f64 = 50.0;

/// Largest geofence radius accepted from clients (meters)
pub const MAX_RADIUS_METERS: f64 = 5000.0;

/// Radius applied when a client adds a location without one (meters)
pub const DEFAULT_RADIUS_METERS: f64 = 200.0;

// =====================================================
// Domain Types
// =====================================================

/// One line of a shopping list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShoppingItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_checked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<i64>,
}

/// A circular geofence attached to a memo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoLocation {
    pub id: String,
    /// User-chosen name, e.g. the shop name
    pub label: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Geofence radius in meters
    pub radius: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl MemoLocation {
    /// Coordinates in range and a positive, finite radius
    pub fn is_well_formed(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
            && self.radius.is_finite()
            && self.radius > 0.0
    }
}

/// A shopping memo. Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memo {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub items: Vec<ShoppingItem>,
    #[serde(default)]
    pub locations: Vec<MemoLocation>,
    #[serde(default = "default_true")]
    pub notification_enabled: bool,
    #[serde(default, alias = "isCompleted")]
    pub completed: bool,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

fn default_true() -> bool {
    true
}

impl Memo {
    /// Only active memos have their locations evaluated
    pub fn is_active(&self) -> bool {
        self.notification_enabled && !self.completed
    }

    pub fn unchecked_item_count(&self) -> usize {
        self.items.iter().filter(|i| !i.is_checked).count()
    }

    pub fn geofence_key(&self, location: &MemoLocation) -> GeofenceKey {
        GeofenceKey::new(&self.id, &location.id)
    }
}

/// Dedup cache key: `memoId:locationId`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeofenceKey(String);

impl GeofenceKey {
    pub fn new(memo_id: &str, location_id: &str) -> Self {
        Self(format!("{}:{}", memo_id, location_id))
    }

    /// Parse a stored key. Returns None if there is no `:` separator.
    pub fn parse(raw: &str) -> Option<Self> {
        let (memo_id, location_id) = raw.split_once(':')?;
        if memo_id.is_empty() || location_id.is_empty() {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn memo_id(&self) -> &str {
        self.0.split_once(':').map(|(m, _)| m).unwrap_or(&self.0)
    }

    pub fn location_id(&self) -> &str {
        self.0.split_once(':').map(|(_, l)| l).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GeofenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A device position fix
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Reported horizontal accuracy in meters, if known
    pub accuracy_m: Option<f64>,
    /// When the fix was taken (Unix ms)
    pub timestamp_ms: i64,
}

// =====================================================
// Notification Types
// =====================================================

/// One arrival event. Item count is a snapshot taken at evaluation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrivalNotification {
    pub memo_id: String,
    pub memo_title: String,
    pub location_label: String,
    pub unchecked_item_count: usize,
}

/// Callback data attached to a delivered notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    pub memo_id: String,
}

/// Platform-facing notification. The id is derived from the memo so a later
/// arrival for the same memo replaces the earlier one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub id: String,
    pub title: String,
    pub body: String,
    pub data: NotificationData,
}

impl From<&ArrivalNotification> for NotificationPayload {
    fn from(arrival: &ArrivalNotification) -> Self {
        Self {
            id: format!("arrival-{}", arrival.memo_id),
            title: format!("Approaching {}", arrival.location_label),
            body: format!(
                "Check your \"{}\" shopping list ({} items)",
                arrival.memo_title, arrival.unchecked_item_count
            ),
            data: NotificationData {
                memo_id: arrival.memo_id.clone(),
            },
        }
    }
}

// =====================================================
// RPC Request Types
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct AddMemoRequest {
    pub title: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MemoIdRequest {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateMemoRequest {
    pub id: String,
    pub title: Option<String>,
    pub notification_enabled: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompleteMemoRequest {
    pub id: String,
    #[serde(default = "default_true")]
    pub completed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddItemRequest {
    pub memo_id: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ItemRequest {
    pub memo_id: String,
    pub item_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddLocationRequest {
    pub memo_id: String,
    pub label: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius: Option<f64>,
    pub address: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UpdateLocationRequest {
    pub memo_id: String,
    pub location_id: String,
    pub label: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub radius: Option<f64>,
    pub address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteLocationRequest {
    pub memo_id: String,
    pub location_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportPositionRequest {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PositionUnavailableRequest {
    pub reason: Option<String>,
}

// =====================================================
// RPC Response Types
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> RpcResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// =====================================================
// Service Status
// =====================================================

/// Passive view of the background monitor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub monitoring: bool,
    pub poll_interval_secs: u64,
    pub cycles_completed: u64,
    pub last_cycle_at: Option<String>,
    /// When the last successful position fix was obtained
    pub last_position_at: Option<String>,
    /// Set while position fetches keep failing, cleared on the next good fix
    pub last_position_error: Option<String>,
    pub inside_geofences: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub total_memos: usize,
    pub active_memos: usize,
    pub monitor: MonitorStatus,
}
