//! Position sources.
//!
//! The monitor asks for one fix per cycle. [`ReportedPositionSource`] serves
//! fixes that the device pushes over RPC: a recent enough fix is returned
//! immediately, otherwise the query waits for the next report until the
//! timeout runs out.

use async_trait::async_trait;
use geofence_monitor_types::Position;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

/// Fixes reported with a worse accuracy than this don't satisfy a high-accuracy query
const HIGH_ACCURACY_METERS: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccuracyHint {
    /// Any recent fix will do
    Low,
    /// Recent fix with a known accuracy of at most 50 m
    High,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PositionError {
    /// A fix exists but none fresh enough arrived in time
    Timeout(Duration),
    /// No fix has ever been reported
    NoFix,
    /// The source itself is unusable (permission revoked, hardware off)
    Unavailable(String),
}

impl fmt::Display for PositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionError::Timeout(t) => {
                write!(f, "no fresh position within {}ms", t.as_millis())
            }
            PositionError::NoFix => write!(f, "no position fix available"),
            PositionError::Unavailable(reason) => write!(f, "position unavailable: {}", reason),
        }
    }
}

#[async_trait]
pub trait PositionSource: Send + Sync {
    async fn current_position(
        &self,
        timeout: Duration,
        accuracy: AccuracyHint,
    ) -> Result<Position, PositionError>;
}

pub struct ReportedPositionSource {
    max_age: Duration,
    latest: watch::Sender<Option<Position>>,
    /// Set when the device says it can't provide fixes; cleared by the next fix
    unavailable: Mutex<Option<String>>,
}

impl ReportedPositionSource {
    pub fn new(max_age: Duration) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            max_age,
            latest,
            unavailable: Mutex::new(None),
        }
    }

    /// The device lost the ability to produce fixes (e.g. permission revoked).
    /// Queries fail fast until the next report.
    pub fn report_unavailable(&self, reason: &str) {
        *self.unavailable.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.to_string());
        self.latest.send_replace(None);
    }

    fn unavailable_reason(&self) -> Option<String> {
        self.unavailable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Record a fix from the device, stamped with the current time
    pub fn report(
        &self,
        latitude: f64,
        longitude: f64,
        accuracy_m: Option<f64>,
    ) -> Result<Position, String> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(format!("latitude {} out of range", latitude));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(format!("longitude {} out of range", longitude));
        }
        if let Some(acc) = accuracy_m {
            if !acc.is_finite() || acc < 0.0 {
                return Err(format!("accuracy {} is invalid", acc));
            }
        }

        let position = Position {
            latitude,
            longitude,
            accuracy_m,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        *self.unavailable.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.latest.send_replace(Some(position));
        Ok(position)
    }

    pub fn latest(&self) -> Option<Position> {
        *self.latest.borrow()
    }

    fn acceptable(&self, position: &Position, accuracy: AccuracyHint) -> bool {
        let age_ms = chrono::Utc::now().timestamp_millis() - position.timestamp_ms;
        if age_ms > self.max_age.as_millis() as i64 {
            return false;
        }
        match accuracy {
            AccuracyHint::Low => true,
            AccuracyHint::High => position
                .accuracy_m
                .map_or(false, |acc| acc <= HIGH_ACCURACY_METERS),
        }
    }
}

#[async_trait]
impl PositionSource for ReportedPositionSource {
    async fn current_position(
        &self,
        timeout: Duration,
        accuracy: AccuracyHint,
    ) -> Result<Position, PositionError> {
        if let Some(reason) = self.unavailable_reason() {
            return Err(PositionError::Unavailable(reason));
        }

        let mut rx = self.latest.subscribe();

        let wait = async {
            loop {
                let candidate = *rx.borrow_and_update();
                if let Some(position) = candidate {
                    if self.acceptable(&position, accuracy) {
                        return position;
                    }
                }
                // The sender lives in self, so this only errors if self is gone
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(position) => Ok(position),
            Err(_) if self.latest().is_none() => Err(PositionError::NoFix),
            Err(_) => Err(PositionError::Timeout(timeout)),
        }
    }
}
