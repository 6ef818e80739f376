use std::env;
use std::time::Duration;

/// Shortest poll interval accepted from the environment (seconds)
const MIN_POLL_INTERVAL_SECS: u64 = 15;

/// Longest poll interval accepted from the environment (seconds)
const MAX_POLL_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub db_path: String,
    pub poll_interval_secs: u64,
    pub position_timeout_secs: u64,
    /// How old a reported fix may be and still count as current
    pub position_max_age_secs: u64,
    pub notify_callback_url: Option<String>,
    /// Upper bound on delivering one arrival notification
    pub notify_timeout_secs: u64,
    /// Resume monitoring on boot if it was on when the service last ran
    pub autostart: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 9104,
            db_path: "./geofence_monitor.db".to_string(),
            poll_interval_secs: 15,
            position_timeout_secs: 15,
            position_max_age_secs: 30,
            notify_callback_url: None,
            notify_timeout_secs: 10,
            autostart: true,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(default)
        };

        Self {
            port: lookup("GEOFENCE_MONITOR_PORT")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.port),
            db_path: lookup("GEOFENCE_MONITOR_DB_PATH").unwrap_or(defaults.db_path),
            poll_interval_secs: parsed("GEOFENCE_POLL_INTERVAL_SECS", defaults.poll_interval_secs)
                .clamp(MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS),
            position_timeout_secs: parsed(
                "GEOFENCE_POSITION_TIMEOUT_SECS",
                defaults.position_timeout_secs,
            )
            .max(1),
            position_max_age_secs: parsed(
                "GEOFENCE_POSITION_MAX_AGE_SECS",
                defaults.position_max_age_secs,
            ),
            notify_callback_url: lookup("GEOFENCE_NOTIFY_CALLBACK_URL")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            notify_timeout_secs: parsed("GEOFENCE_NOTIFY_TIMEOUT_SECS", defaults.notify_timeout_secs)
                .max(1),
            autostart: lookup("GEOFENCE_AUTOSTART")
                .map(|s| !matches!(s.trim(), "0" | "false" | "no" | "off"))
                .unwrap_or(defaults.autostart),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn position_timeout(&self) -> Duration {
        Duration::from_secs(self.position_timeout_secs)
    }

    pub fn position_max_age(&self) -> Duration {
        Duration::from_secs(self.position_max_age_secs)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }
}
