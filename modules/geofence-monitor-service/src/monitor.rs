//! Geofence monitor.
//!
//! One background task runs a cycle, sleeps for the poll interval, and
//! repeats until stopped. Each cycle takes a position fix, evaluates every
//! location of every active memo against it, records entries and exits in
//! the dedup cache, flushes the cache if it changed, and sends one
//! notification per entry.
//!
//! Stopping is cooperative: the cancellation token is checked before each
//! cycle and wakes the inter-cycle sleep, but a cycle already in progress
//! runs to completion. Every await inside a cycle is bounded, so that takes
//! at most the position timeout plus one notify timeout per arrival.

use crate::db::KeyValueStorage;
use crate::dedup::DedupCache;
use crate::geo;
use crate::memo_store::MemoStoreReader;
use crate::notifier::Notifier;
use crate::position::{AccuracyHint, PositionError, PositionSource};
use geofence_monitor_types::{ArrivalNotification, GeofenceKey, Memo, MonitorStatus, Position};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Storage key remembering whether monitoring should resume after a restart
pub const MONITORING_ENABLED_KEY: &str = "monitoring_enabled";

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    /// Upper bound on one position fetch, and so on shutdown latency
    pub position_timeout: Duration,
    pub accuracy: AccuracyHint,
    /// Upper bound on delivering one arrival notification
    pub notify_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            position_timeout: Duration::from_secs(15),
            accuracy: AccuracyHint::Low,
            notify_timeout: Duration::from_secs(10),
        }
    }
}

/// What a single cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No position or no memo list; nothing was evaluated or mutated
    Skipped(String),
    Evaluated {
        arrivals: usize,
        exits: usize,
        notified: usize,
    },
}

/// Transitions found while evaluating one position
#[derive(Debug, Default)]
pub struct Evaluation {
    pub arrivals: Vec<ArrivalNotification>,
    pub exits: Vec<GeofenceKey>,
}

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct GeofenceMonitor {
    settings: MonitorSettings,
    memos: Arc<dyn MemoStoreReader>,
    positions: Arc<dyn PositionSource>,
    notifier: Arc<dyn Notifier>,
    /// Held from listing memos through the flush, so a purge can't land
    /// between a cycle's snapshot and its cache update
    cache: Mutex<DedupCache>,
    task: StdMutex<Option<RunningTask>>,
    status: StdMutex<MonitorStatus>,
}

impl GeofenceMonitor {
    pub fn new(
        settings: MonitorSettings,
        memos: Arc<dyn MemoStoreReader>,
        positions: Arc<dyn PositionSource>,
        notifier: Arc<dyn Notifier>,
        cache_storage: Arc<dyn KeyValueStorage>,
    ) -> Self {
        let status = MonitorStatus {
            poll_interval_secs: settings.poll_interval.as_secs(),
            ..Default::default()
        };
        Self {
            settings,
            memos,
            positions,
            notifier,
            cache: Mutex::new(DedupCache::new(cache_storage)),
            task: StdMutex::new(None),
            status: StdMutex::new(status),
        }
    }

    /// Start the background loop. Returns true if the monitor is running
    /// afterwards, including when it already was.
    pub async fn start_monitoring(self: &Arc<Self>) -> bool {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("[GEOFENCE] Cannot start monitor outside a runtime: {}", e);
                return false;
            }
        };

        if self.is_monitoring() {
            log::debug!("[GEOFENCE] Monitor already running");
            return true;
        }

        // The process may have been restarted since the last run
        self.cache.lock().await.load();

        let mut task = self.lock_task();
        if let Some(running) = task.as_ref() {
            if !running.handle.is_finished() {
                log::debug!("[GEOFENCE] Monitor already running");
                return true;
            }
            log::warn!("[GEOFENCE] Monitor loop exited unexpectedly, restarting");
        }

        let cancel = CancellationToken::new();
        let monitor = Arc::clone(self);
        let token = cancel.clone();
        let handle = runtime.spawn(async move {
            monitor.run_loop(token).await;
        });

        *task = Some(RunningTask { cancel, handle });
        drop(task);
        self.with_status(|s| s.monitoring = true);

        log::info!(
            "[GEOFENCE] Monitoring started (poll interval: {}s)",
            self.settings.poll_interval.as_secs()
        );
        true
    }

    /// Signal the loop to stop and return without waiting for it
    pub async fn stop_monitoring(&self) {
        if let Some(running) = self.lock_task().take() {
            running.cancel.cancel();
            log::info!("[GEOFENCE] Monitoring stopped");
        }
        self.with_status(|s| s.monitoring = false);
    }

    /// True while a loop task exists and hasn't exited, so a loop that
    /// died on a panic reads as stopped
    pub fn is_monitoring(&self) -> bool {
        self.lock_task()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<RunningTask>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.run_cycle().await {
                CycleOutcome::Skipped(reason) => {
                    log::debug!("[GEOFENCE] Cycle skipped: {}", reason);
                }
                CycleOutcome::Evaluated {
                    arrivals,
                    exits,
                    notified,
                } => {
                    if arrivals > 0 || exits > 0 {
                        log::info!(
                            "[GEOFENCE] Cycle complete: {} arrivals ({} notified), {} exits",
                            arrivals,
                            notified,
                            exits
                        );
                    } else {
                        log::debug!("[GEOFENCE] Cycle complete: no transitions");
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
        log::debug!("[GEOFENCE] Monitor loop exited");
    }

    /// Run one cycle. Never fails: every problem is logged and turned into
    /// a skipped or partially delivered cycle.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let position = match self.fetch_position().await {
            Ok(position) => position,
            Err(e) => {
                log::debug!("[GEOFENCE] Position unavailable, skipping cycle: {}", e);
                self.with_status(|s| s.last_position_error = Some(e.to_string()));
                return CycleOutcome::Skipped(e.to_string());
            }
        };

        let (evaluation, inside_count) = {
            let mut cache = self.cache.lock().await;
            let memos = match self.memos.list_memos() {
                Ok(memos) => memos,
                Err(e) => {
                    log::warn!("[GEOFENCE] Failed to read memos, skipping cycle: {}", e);
                    return CycleOutcome::Skipped(e);
                }
            };
            let evaluation = evaluate(&mut cache, &memos, &position);
            cache.flush_if_dirty();
            (evaluation, cache.len())
        };

        let mut notified = 0usize;
        for arrival in &evaluation.arrivals {
            let result = tokio::time::timeout(
                self.settings.notify_timeout,
                self.notifier.notify_arrival(arrival),
            )
            .await
            .unwrap_or_else(|_| {
                Err(format!(
                    "timed out after {}ms",
                    self.settings.notify_timeout.as_millis()
                ))
            });
            match result {
                Ok(()) => notified += 1,
                Err(e) => log::warn!(
                    "[GEOFENCE] Failed to notify arrival at '{}' for memo {}: {}",
                    arrival.location_label,
                    arrival.memo_id,
                    e
                ),
            }
        }

        let fix_time = chrono::DateTime::from_timestamp_millis(position.timestamp_ms)
            .map(|t| t.to_rfc3339());
        let now = chrono::Utc::now().to_rfc3339();
        self.with_status(|s| {
            s.cycles_completed += 1;
            s.last_cycle_at = Some(now);
            s.last_position_at = fix_time;
            s.last_position_error = None;
            s.inside_geofences = inside_count;
        });

        CycleOutcome::Evaluated {
            arrivals: evaluation.arrivals.len(),
            exits: evaluation.exits.len(),
            notified,
        }
    }

    async fn fetch_position(&self) -> Result<Position, PositionError> {
        let timeout = self.settings.position_timeout;
        // Bound sources that ignore their own timeout
        match tokio::time::timeout(
            timeout,
            self.positions.current_position(timeout, self.settings.accuracy),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PositionError::Timeout(timeout)),
        }
    }

    // ── Lifecycle triggers ──────────────────────────────────

    pub async fn on_memo_deleted(&self, memo_id: &str) {
        let removed = self.purge(|cache| cache.purge(memo_id)).await;
        log::debug!(
            "[GEOFENCE] Memo {} deleted, purged {} cache entries",
            memo_id,
            removed
        );
    }

    /// A completed memo notifies again on the next visit after it is reopened
    pub async fn on_memo_completed(&self, memo_id: &str) {
        let removed = self.purge(|cache| cache.purge(memo_id)).await;
        log::debug!(
            "[GEOFENCE] Memo {} completed, purged {} cache entries",
            memo_id,
            removed
        );
    }

    pub async fn on_location_deleted(&self, memo_id: &str, location_id: &str) {
        self.purge(|cache| usize::from(cache.purge_location(memo_id, location_id)))
            .await;
    }

    async fn purge(&self, f: impl FnOnce(&mut DedupCache) -> usize) -> usize {
        let mut cache = self.cache.lock().await;
        // While stopped nothing keeps the in-memory set current
        if !self.is_monitoring() {
            cache.load();
        }
        let removed = f(&mut cache);
        cache.flush_if_dirty();
        self.with_status(|s| s.inside_geofences = cache.len());
        removed
    }

    // ── Status ──────────────────────────────────────────────

    pub async fn inside_keys(&self) -> Vec<GeofenceKey> {
        self.cache.lock().await.keys()
    }

    pub fn status(&self) -> MonitorStatus {
        let mut status = self
            .status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone());
        status.monitoring = self.is_monitoring();
        status
    }

    fn with_status(&self, f: impl FnOnce(&mut MonitorStatus)) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut status);
    }
}

/// Compare one position against every location of every active memo,
/// recording transitions in the cache. The radius boundary counts as inside.
pub fn evaluate(cache: &mut DedupCache, memos: &[Memo], position: &Position) -> Evaluation {
    let mut evaluation = Evaluation::default();

    for memo in memos.iter().filter(|m| m.is_active()) {
        for location in &memo.locations {
            let key = memo.geofence_key(location);
            let distance = geo::distance_meters(
                position.latitude,
                position.longitude,
                location.latitude,
                location.longitude,
            );
            let inside = distance <= location.radius;
            let was_inside = cache.contains(&key);

            if inside && !was_inside {
                cache.mark_entered(key);
                log::info!(
                    "[GEOFENCE] Entered '{}' ({:.0}m of {:.0}m) for memo '{}'",
                    location.label,
                    distance,
                    location.radius,
                    memo.title
                );
                evaluation.arrivals.push(ArrivalNotification {
                    memo_id: memo.id.clone(),
                    memo_title: memo.title.clone(),
                    location_label: location.label.clone(),
                    unchecked_item_count: memo.unchecked_item_count(),
                });
            } else if !inside && was_inside {
                cache.mark_exited(&key);
                log::info!(
                    "[GEOFENCE] Left '{}' for memo '{}'",
                    location.label,
                    memo.title
                );
                evaluation.exits.push(key);
            }
        }
    }

    evaluation
}

/// Whether monitoring was on when the service last ran. Unreadable means off.
pub fn monitoring_intent(storage: &dyn KeyValueStorage) -> bool {
    match storage.get(MONITORING_ENABLED_KEY) {
        Ok(value) => value.as_deref() == Some("true"),
        Err(e) => {
            log::warn!("[GEOFENCE] Failed to read monitoring intent: {}", e);
            false
        }
    }
}

pub fn set_monitoring_intent(storage: &dyn KeyValueStorage, enabled: bool) {
    let result = if enabled {
        storage.set(MONITORING_ENABLED_KEY, "true")
    } else {
        storage.remove(MONITORING_ENABLED_KEY)
    };
    if let Err(e) = result {
        log::warn!("[GEOFENCE] Failed to persist monitoring intent: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::dedup::INSIDE_CACHE_KEY;
    use crate::dedup::tests::MemoryStorage;
    use crate::memo_store::{MemoStore, NewLocation};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    const SHOP: (f64, f64) = (35.6812, 139.7671);
    // About 1.1 km north of the shop
    const AWAY: (f64, f64) = (35.6912, 139.7671);

    struct FakePositions {
        next: StdMutex<Result<(f64, f64), PositionError>>,
    }

    impl FakePositions {
        fn at(point: (f64, f64)) -> Arc<Self> {
            Arc::new(Self {
                next: StdMutex::new(Ok(point)),
            })
        }

        fn move_to(&self, point: (f64, f64)) {
            *self.next.lock().unwrap() = Ok(point);
        }

        fn fail(&self, err: PositionError) {
            *self.next.lock().unwrap() = Err(err);
        }
    }

    #[async_trait]
    impl PositionSource for FakePositions {
        async fn current_position(
            &self,
            _timeout: Duration,
            _accuracy: AccuracyHint,
        ) -> Result<Position, PositionError> {
            let (latitude, longitude) = self.next.lock().unwrap().clone()?;
            Ok(Position {
                latitude,
                longitude,
                accuracy_m: None,
                timestamp_ms: 0,
            })
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: StdMutex<Vec<ArrivalNotification>>,
        fail: AtomicBool,
    }

    impl RecordingNotifier {
        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify_arrival(&self, arrival: &ArrivalNotification) -> Result<(), String> {
            if self.fail.load(Ordering::SeqCst) {
                return Err("push service down".to_string());
            }
            self.sent.lock().unwrap().push(arrival.clone());
            Ok(())
        }
    }

    struct Harness {
        db: Arc<Db>,
        store: Arc<MemoStore>,
        positions: Arc<FakePositions>,
        notifier: Arc<RecordingNotifier>,
        monitor: Arc<GeofenceMonitor>,
    }

    fn settings(poll_ms: u64) -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::from_millis(poll_ms),
            position_timeout: Duration::from_millis(200),
            accuracy: AccuracyHint::Low,
            notify_timeout: Duration::from_millis(100),
        }
    }

    fn harness_with(db: Arc<Db>, cache_storage: Arc<dyn KeyValueStorage>, start: (f64, f64)) -> Harness {
        let store = Arc::new(MemoStore::new(db.clone()));
        let positions = FakePositions::at(start);
        let notifier = Arc::new(RecordingNotifier::default());
        let monitor = Arc::new(GeofenceMonitor::new(
            settings(10),
            store.clone(),
            positions.clone(),
            notifier.clone(),
            cache_storage,
        ));
        Harness {
            db,
            store,
            positions,
            notifier,
            monitor,
        }
    }

    fn harness(start: (f64, f64)) -> Harness {
        let db = Arc::new(Db::open(":memory:").expect("in-memory db"));
        harness_with(db.clone(), db, start)
    }

    fn memo_with_shop(store: &MemoStore, radius: f64) -> (Memo, GeofenceKey) {
        let memo = store.add_memo("Groceries").unwrap();
        let location = store
            .add_location(
                &memo.id,
                NewLocation {
                    label: "Corner Market".to_string(),
                    latitude: SHOP.0,
                    longitude: SHOP.1,
                    radius: Some(radius),
                    address: None,
                },
            )
            .unwrap();
        let key = GeofenceKey::new(&memo.id, &location.id);
        (memo, key)
    }

    fn evaluated(arrivals: usize, exits: usize, notified: usize) -> CycleOutcome {
        CycleOutcome::Evaluated {
            arrivals,
            exits,
            notified,
        }
    }

    #[tokio::test]
    async fn test_entry_notifies_once_while_inside() {
        let h = harness(SHOP);
        let (memo, key) = memo_with_shop(&h.store, 200.0);

        assert_eq!(h.monitor.run_cycle().await, evaluated(1, 0, 1));
        assert_eq!(h.monitor.inside_keys().await, vec![key]);

        let sent = h.notifier.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].memo_id, memo.id);
        assert_eq!(sent[0].memo_title, "Groceries");
        assert_eq!(sent[0].location_label, "Corner Market");

        assert_eq!(h.monitor.run_cycle().await, evaluated(0, 0, 0));
        assert_eq!(h.notifier.count(), 1);
    }

    #[tokio::test]
    async fn test_exit_then_reentry_notifies_again() {
        let h = harness(SHOP);
        memo_with_shop(&h.store, 200.0);

        h.monitor.run_cycle().await;
        assert_eq!(h.notifier.count(), 1);

        h.positions.move_to(AWAY);
        assert_eq!(h.monitor.run_cycle().await, evaluated(0, 1, 0));
        assert!(h.monitor.inside_keys().await.is_empty());
        assert_eq!(h.notifier.count(), 1);

        h.positions.move_to(SHOP);
        assert_eq!(h.monitor.run_cycle().await, evaluated(1, 0, 1));
        assert_eq!(h.notifier.count(), 2);
    }

    #[tokio::test]
    async fn test_radius_boundary_is_inside() {
        let h = harness(AWAY);
        let radius = geo::distance_meters(AWAY.0, AWAY.1, SHOP.0, SHOP.1);
        memo_with_shop(&h.store, radius);

        assert_eq!(h.monitor.run_cycle().await, evaluated(1, 0, 1));
    }

    #[tokio::test]
    async fn test_outside_radius_does_nothing() {
        let h = harness(AWAY);
        memo_with_shop(&h.store, 500.0);

        assert_eq!(h.monitor.run_cycle().await, evaluated(0, 0, 0));
        assert_eq!(h.notifier.count(), 0);
    }

    #[tokio::test]
    async fn test_item_count_is_snapshot() {
        let h = harness(SHOP);
        let (memo, _) = memo_with_shop(&h.store, 200.0);
        let milk = h.store.add_item(&memo.id, "Milk").unwrap();
        h.store.add_item(&memo.id, "Eggs").unwrap();
        h.store.add_item(&memo.id, "Bread").unwrap();
        h.store.toggle_item(&memo.id, &milk.id).unwrap();

        h.monitor.run_cycle().await;

        // Later edits don't change what was already sent
        h.store.toggle_item(&memo.id, &milk.id).unwrap();
        let sent = h.notifier.sent.lock().unwrap().clone();
        assert_eq!(sent[0].unchecked_item_count, 2);
    }

    #[tokio::test]
    async fn test_deleted_memo_is_purged_and_silent() {
        let h = harness(SHOP);
        let (memo, _) = memo_with_shop(&h.store, 200.0);
        h.monitor.run_cycle().await;

        assert!(h.store.delete_memo(&memo.id).unwrap());
        h.monitor.on_memo_deleted(&memo.id).await;
        assert!(h.monitor.inside_keys().await.is_empty());
        assert_eq!(h.db.get_value(INSIDE_CACHE_KEY).unwrap().as_deref(), Some("[]"));

        h.positions.move_to(AWAY);
        h.monitor.run_cycle().await;
        h.positions.move_to(SHOP);
        assert_eq!(h.monitor.run_cycle().await, evaluated(0, 0, 0));
        assert_eq!(h.notifier.count(), 1);
    }

    #[tokio::test]
    async fn test_completed_memo_is_not_evaluated() {
        let h = harness(SHOP);
        let (memo, key) = memo_with_shop(&h.store, 200.0);
        h.monitor.run_cycle().await;

        // Completing without the lifecycle trigger leaves the key cached
        h.store.set_completed(&memo.id, true).unwrap();
        h.positions.move_to(AWAY);
        assert_eq!(h.monitor.run_cycle().await, evaluated(0, 0, 0));
        assert_eq!(h.monitor.inside_keys().await, vec![key]);

        h.positions.move_to(SHOP);
        assert_eq!(h.monitor.run_cycle().await, evaluated(0, 0, 0));
        assert_eq!(h.notifier.count(), 1);
    }

    #[tokio::test]
    async fn test_completion_trigger_allows_renotify_after_reopen() {
        let h = harness(SHOP);
        let (memo, _) = memo_with_shop(&h.store, 200.0);
        h.monitor.run_cycle().await;

        h.store.set_completed(&memo.id, true).unwrap();
        h.monitor.on_memo_completed(&memo.id).await;
        assert!(h.monitor.inside_keys().await.is_empty());

        h.store.set_completed(&memo.id, false).unwrap();
        assert_eq!(h.monitor.run_cycle().await, evaluated(1, 0, 1));
        assert_eq!(h.notifier.count(), 2);
    }

    #[tokio::test]
    async fn test_notifications_disabled_memo_is_skipped() {
        let h = harness(SHOP);
        let (memo, _) = memo_with_shop(&h.store, 200.0);
        h.store.update_memo(&memo.id, None, Some(false)).unwrap();

        assert_eq!(h.monitor.run_cycle().await, evaluated(0, 0, 0));
        assert!(h.monitor.inside_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_position_failure_skips_cycle() {
        let storage = Arc::new(MemoryStorage::default());
        let db = Arc::new(Db::open(":memory:").expect("in-memory db"));
        let h = harness_with(db, storage.clone(), SHOP);
        memo_with_shop(&h.store, 200.0);

        h.positions.fail(PositionError::Unavailable("permission revoked".to_string()));
        let outcome = h.monitor.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Skipped(_)));
        assert_eq!(h.notifier.count(), 0);
        assert!(h.monitor.inside_keys().await.is_empty());
        assert_eq!(storage.writes.load(Ordering::SeqCst), 0);
        assert!(h.monitor.status().last_position_error.is_some());

        h.positions.move_to(SHOP);
        assert_eq!(h.monitor.run_cycle().await, evaluated(1, 0, 1));
        assert!(h.monitor.status().last_position_error.is_none());
    }

    #[tokio::test]
    async fn test_notifier_failure_is_not_retried() {
        let h = harness(SHOP);
        let (_, key) = memo_with_shop(&h.store, 200.0);

        h.notifier.fail.store(true, Ordering::SeqCst);
        assert_eq!(h.monitor.run_cycle().await, evaluated(1, 0, 0));
        assert_eq!(h.monitor.inside_keys().await, vec![key]);

        h.notifier.fail.store(false, Ordering::SeqCst);
        assert_eq!(h.monitor.run_cycle().await, evaluated(0, 0, 0));
        assert_eq!(h.notifier.count(), 0);
    }

    #[tokio::test]
    async fn test_flush_failure_keeps_running() {
        let storage = Arc::new(MemoryStorage::default());
        let db = Arc::new(Db::open(":memory:").expect("in-memory db"));
        let h = harness_with(db, storage.clone(), SHOP);
        memo_with_shop(&h.store, 200.0);

        storage.fail_writes.store(true, Ordering::SeqCst);
        assert_eq!(h.monitor.run_cycle().await, evaluated(1, 0, 1));
        assert!(storage.raw(INSIDE_CACHE_KEY).is_none());

        // In-memory state still suppresses a duplicate
        assert_eq!(h.monitor.run_cycle().await, evaluated(0, 0, 0));

        storage.fail_writes.store(false, Ordering::SeqCst);
        h.monitor.run_cycle().await;
        assert!(storage.raw(INSIDE_CACHE_KEY).is_some());
        assert_eq!(h.notifier.count(), 1);
    }

    #[tokio::test]
    async fn test_cache_survives_restart() {
        let db = Arc::new(Db::open(":memory:").expect("in-memory db"));
        let first = harness_with(db.clone(), db.clone(), SHOP);
        memo_with_shop(&first.store, 200.0);
        first.monitor.run_cycle().await;
        assert_eq!(first.notifier.count(), 1);

        // Fresh monitor over the same storage, as after a process restart
        let second = harness_with(db.clone(), db, SHOP);
        assert!(second.monitor.start_monitoring().await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        second.monitor.stop_monitoring().await;

        assert_eq!(second.notifier.count(), 0);
    }

    #[tokio::test]
    async fn test_double_start_is_idempotent() {
        let h = harness(SHOP);
        memo_with_shop(&h.store, 200.0);

        assert!(h.monitor.start_monitoring().await);
        assert!(h.monitor.start_monitoring().await);
        assert!(h.monitor.is_monitoring());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.notifier.count(), 1);
        assert!(h.monitor.status().cycles_completed >= 2);

        h.monitor.stop_monitoring().await;
        assert!(!h.monitor.is_monitoring());
    }

    #[tokio::test]
    async fn test_stop_halts_cycles_and_restart_resumes() {
        let h = harness(AWAY);
        memo_with_shop(&h.store, 200.0);

        // Stopping a stopped monitor is a no-op
        h.monitor.stop_monitoring().await;
        assert!(!h.monitor.is_monitoring());

        assert!(h.monitor.start_monitoring().await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        h.monitor.stop_monitoring().await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let cycles = h.monitor.status().cycles_completed;
        h.positions.move_to(SHOP);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(h.monitor.status().cycles_completed, cycles);
        assert_eq!(h.notifier.count(), 0);

        assert!(h.monitor.start_monitoring().await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        h.monitor.stop_monitoring().await;
        assert_eq!(h.notifier.count(), 1);
    }

    #[tokio::test]
    async fn test_purge_while_stopped_reads_storage() {
        let db = Arc::new(Db::open(":memory:").expect("in-memory db"));
        let first = harness_with(db.clone(), db.clone(), SHOP);
        let (memo, _) = memo_with_shop(&first.store, 200.0);
        first.monitor.run_cycle().await;

        let second = harness_with(db.clone(), db.clone(), SHOP);
        second.monitor.on_memo_deleted(&memo.id).await;
        assert_eq!(db.get_value(INSIDE_CACHE_KEY).unwrap().as_deref(), Some("[]"));
    }

    #[tokio::test]
    async fn test_location_delete_purges_key() {
        let h = harness(SHOP);
        let (memo, key) = memo_with_shop(&h.store, 200.0);
        h.monitor.run_cycle().await;
        assert_eq!(h.monitor.inside_keys().await, vec![key.clone()]);

        h.store.delete_location(&memo.id, key.location_id()).unwrap();
        h.monitor.on_location_deleted(&memo.id, key.location_id()).await;
        assert!(h.monitor.inside_keys().await.is_empty());
    }

    /// Never finishes a delivery
    struct StuckNotifier;

    #[async_trait]
    impl Notifier for StuckNotifier {
        async fn notify_arrival(&self, _arrival: &ArrivalNotification) -> Result<(), String> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stuck_notifier_does_not_stall_cycle() {
        let db = Arc::new(Db::open(":memory:").expect("in-memory db"));
        let store = Arc::new(MemoStore::new(db.clone()));
        let (_, key) = memo_with_shop(&store, 200.0);
        let monitor = Arc::new(GeofenceMonitor::new(
            settings(10),
            store,
            FakePositions::at(SHOP),
            Arc::new(StuckNotifier),
            db,
        ));

        let outcome = tokio::time::timeout(Duration::from_secs(2), monitor.run_cycle())
            .await
            .expect("cycle finished");
        assert_eq!(outcome, evaluated(1, 0, 0));
        assert_eq!(monitor.inside_keys().await, vec![key]);

        // The loop still reaches its cancellation check
        assert!(monitor.start_monitoring().await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop_monitoring().await;
        assert!(!monitor.is_monitoring());
    }

    /// Reads the real store, then stalls before handing the snapshot back
    struct SlowReader {
        inner: Arc<MemoStore>,
        listed: AtomicBool,
    }

    impl MemoStoreReader for SlowReader {
        fn list_memos(&self) -> Result<Vec<Memo>, String> {
            let memos = self.inner.list_memos();
            self.listed.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            memos
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_purge_during_cycle_is_not_lost() {
        let db = Arc::new(Db::open(":memory:").expect("in-memory db"));
        let store = Arc::new(MemoStore::new(db.clone()));
        let (memo, _) = memo_with_shop(&store, 200.0);
        let reader = Arc::new(SlowReader {
            inner: store.clone(),
            listed: AtomicBool::new(false),
        });
        let monitor = Arc::new(GeofenceMonitor::new(
            settings(10),
            reader.clone(),
            FakePositions::at(SHOP),
            Arc::new(RecordingNotifier::default()),
            db.clone(),
        ));

        let cycle = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.run_cycle().await }
        });
        while !reader.listed.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // The memo is completed after the cycle took its snapshot
        store.set_completed(&memo.id, true).unwrap();
        monitor.on_memo_completed(&memo.id).await;
        cycle.await.unwrap();

        assert!(monitor.inside_keys().await.is_empty());
        assert_eq!(db.get_value(INSIDE_CACHE_KEY).unwrap().as_deref(), Some("[]"));
    }

    #[tokio::test]
    async fn test_last_position_at_is_fix_time() {
        let h = harness(SHOP);
        h.monitor.run_cycle().await;

        let status = h.monitor.status();
        // FakePositions stamps every fix at the epoch
        assert_eq!(
            status.last_position_at.as_deref(),
            Some("1970-01-01T00:00:00+00:00")
        );
        assert!(status.last_cycle_at.is_some());
        assert_ne!(status.last_cycle_at, status.last_position_at);
    }

    struct PanickingReader;

    impl MemoStoreReader for PanickingReader {
        fn list_memos(&self) -> Result<Vec<Memo>, String> {
            panic!("memo store exploded");
        }
    }

    #[tokio::test]
    async fn test_panicked_loop_reads_as_stopped() {
        let storage = Arc::new(MemoryStorage::default());
        let monitor = Arc::new(GeofenceMonitor::new(
            settings(10),
            Arc::new(PanickingReader),
            FakePositions::at(SHOP),
            Arc::new(RecordingNotifier::default()),
            storage,
        ));

        assert!(monitor.start_monitoring().await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!monitor.is_monitoring());
        assert!(!monitor.status().monitoring);

        // A new start replaces the dead loop
        assert!(monitor.start_monitoring().await);
        monitor.stop_monitoring().await;
    }

    #[test]
    fn test_monitoring_intent_roundtrip() {
        let storage = MemoryStorage::default();
        assert!(!monitoring_intent(&storage));
        set_monitoring_intent(&storage, true);
        assert!(monitoring_intent(&storage));
        set_monitoring_intent(&storage, false);
        assert!(!monitoring_intent(&storage));
    }
}
