//! Order watcher module.
//!
//! Plays a chime when new records of one owner show up in a shared
//! collection. Two channels feed a single worker thread:
//! - a poll every `poll_interval` that looks for records created after
//!   the last detection (timestamp rule)
//! - storage events from other contexts that compare the owner's record
//!   count with the last one seen (count rule)
//!
//! The rules are independent, so one new record can be detected by both.

use crate::record::Collection;
use crate::sound::Chime;
use crate::store::{LocalStore, StorageEvent, Subscription};
use chrono::{DateTime, Utc};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const DEFAULT_COLLECTION_KEY: &str = "orders";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Watcher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherOptions {
    /// Store key of the watched collection.
    pub collection_key: String,
    pub poll_interval: Duration,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            collection_key: DEFAULT_COLLECTION_KEY.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Detection state of one watcher. Kept in memory only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchState {
    owner_id: String,
    /// Never moves backwards.
    last_check: DateTime<Utc>,
    last_seen_count: usize,
}

impl WatchState {
    /// Baselines the state on the collection as it is at `now`.
    ///
    /// Nothing is reported here. A stored record dated after `now` is still
    /// picked up by the first poll.
    pub fn new(owner_id: impl Into<String>, initial: Option<&str>, now: DateTime<Utc>) -> Self {
        let owner_id = owner_id.into();
        let last_seen_count = match Collection::parse_optional(initial) {
            Ok(collection) => collection.count_owned_by(&owner_id),
            Err(e) => {
                log::warn!("Unreadable collection at start for {}: {}", owner_id, e);
                0
            }
        };

        Self {
            owner_id,
            last_check: now,
            last_seen_count,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn last_check(&self) -> DateTime<Utc> {
        self.last_check
    }

    pub fn last_seen_count(&self) -> usize {
        self.last_seen_count
    }

    /// Timestamp rule, run on every poll. Returns whether to play.
    ///
    /// A record is new when created strictly after the last detection.
    /// On detection the check instant moves to `now`. The seen count is
    /// refreshed on every readable poll.
    pub fn poll_tick(&mut self, raw: Option<&str>, now: DateTime<Utc>) -> bool {
        let collection = match Collection::parse_optional(raw) {
            Ok(collection) => collection,
            Err(e) => {
                log::warn!("Skipping poll for {}: {}", self.owner_id, e);
                return false;
            }
        };

        let fresh = collection
            .created_after(&self.owner_id, self.last_check)
            .count();
        if fresh > 0 {
            log::debug!("Poll found {} new record(s) for {}", fresh, self.owner_id);
            self.last_check = self.last_check.max(now);
        }

        self.last_seen_count = collection.count_owned_by(&self.owner_id);
        fresh > 0
    }

    /// Count rule, run on every foreign write. Returns whether to play.
    ///
    /// Fires when the owner has more records than last seen. Leaves the
    /// check instant alone, and a shrinking count is not recorded.
    pub fn storage_changed(&mut self, new_value: &str) -> bool {
        let collection = match Collection::parse(new_value) {
            Ok(collection) => collection,
            Err(e) => {
                log::warn!("Skipping storage event for {}: {}", self.owner_id, e);
                return false;
            }
        };

        let count = collection.count_owned_by(&self.owner_id);
        if count > self.last_seen_count {
            log::debug!(
                "Storage event raised count for {}: {} -> {}",
                self.owner_id,
                self.last_seen_count,
                count
            );
            self.last_seen_count = count;
            return true;
        }
        false
    }
}

enum WatchMessage {
    /// New value of the collection written by another context.
    Storage(String),
    Stop,
}

/// Running watcher. Stops on `stop()` or when dropped.
pub struct OrderWatcher {
    owner_id: String,
    sender: Sender<WatchMessage>,
    worker: Option<JoinHandle<()>>,
    subscription: Option<Subscription>,
}

impl OrderWatcher {
    /// Starts watching `owner_id`'s records. Returns `None` for an empty owner.
    pub fn start(
        store: &LocalStore,
        chime: Arc<dyn Chime>,
        owner_id: &str,
        options: WatcherOptions,
    ) -> Option<Self> {
        if owner_id.is_empty() {
            log::debug!("No owner id, not watching");
            return None;
        }

        let (sender, receiver) = mpsc::channel();

        // Subscribed before the initial read so a write in between is queued
        let events = sender.clone();
        let key = options.collection_key.clone();
        let subscription = store.listen(Arc::new(move |event: &StorageEvent| {
            if event.key != key {
                return;
            }
            match &event.new_value {
                Some(value) if !value.is_empty() => {
                    if events.send(WatchMessage::Storage(value.clone())).is_err() {
                        log::debug!("Watcher gone, dropping storage event");
                    }
                }
                _ => {}
            }
        }));

        // Taken before the read so a record written after it is newer than `now`
        let now = Utc::now();
        let initial = store
            .get_item(&options.collection_key)
            .unwrap_or_else(|e| {
                log::warn!("Failed to read {}: {}", options.collection_key, e);
                None
            });
        let state = WatchState::new(owner_id, initial.as_deref(), now);
        log::info!(
            "Watching {:?} for {} ({} existing record(s))",
            options.collection_key,
            owner_id,
            state.last_seen_count()
        );

        let worker_store = store.clone();
        let worker = thread::Builder::new()
            .name(format!("order-watcher-{}", owner_id))
            .spawn(move || watch_loop(state, worker_store, chime, options, receiver));

        match worker {
            Ok(worker) => Some(Self {
                owner_id: owner_id.to_string(),
                sender,
                worker: Some(worker),
                subscription: Some(subscription),
            }),
            Err(e) => {
                log::error!("Failed to start order watcher: {}", e);
                None
            }
        }
    }

    /// Stops both channels. Nothing is played once this returns.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        self.subscription = None;
        let _ = self.sender.send(WatchMessage::Stop);
        if worker.join().is_err() {
            log::error!("Order watcher for {} panicked", self.owner_id);
        }

        log::info!("Stopped watching for {}", self.owner_id);
    }
}

impl Drop for OrderWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker loop: storage events as they arrive, polls on the interval.
fn watch_loop(
    mut state: WatchState,
    store: LocalStore,
    chime: Arc<dyn Chime>,
    options: WatcherOptions,
    receiver: Receiver<WatchMessage>,
) {
    let mut next_poll = Instant::now() + options.poll_interval;

    loop {
        let timeout = next_poll.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(timeout) {
            Ok(WatchMessage::Storage(value)) => {
                if state.storage_changed(&value) {
                    log::info!("New order for {} from another context", state.owner_id());
                    chime.play(None);
                }
            }
            Ok(WatchMessage::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                match store.get_item(&options.collection_key) {
                    Ok(raw) => {
                        let since = state.last_check();
                        if state.poll_tick(raw.as_deref(), Utc::now()) {
                            log::info!("New order for {} since {}", state.owner_id(), since);
                            chime.play(None);
                        }
                    }
                    Err(e) => log::warn!("Skipping poll, failed to read store: {}", e),
                }
                next_poll = Instant::now() + options.poll_interval;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::sound::SoundType;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t(secs: f64) -> DateTime<Utc> {
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        base + chrono::Duration::milliseconds((secs * 1000.0) as i64)
    }

    fn collection(records: &[(&str, f64)]) -> String {
        let records: Vec<Record> = records
            .iter()
            .map(|(owner, at)| Record::new(*owner, t(*at)))
            .collect();
        serde_json::to_string(&records).unwrap()
    }

    #[test]
    fn start_counts_owner_records_without_detecting() {
        let raw = collection(&[("alice", 0.0), ("alice", 5.0), ("bob", 5.0)]);
        let mut state = WatchState::new("alice", Some(&raw), t(1.0));

        assert_eq!(state.last_seen_count(), 2);
        assert_eq!(state.last_check(), t(1.0));

        // Already stored at start but dated after it, so the first poll reports it
        assert!(state.poll_tick(Some(&raw), t(3.0)));
    }

    #[test]
    fn existing_records_are_not_reported() {
        let raw = collection(&[("alice", 0.0), ("alice", 0.5)]);
        let mut state = WatchState::new("alice", Some(&raw), t(1.0));

        assert!(!state.poll_tick(Some(&raw), t(3.0)));
        assert!(!state.storage_changed(&raw));
        assert_eq!(state.last_check(), t(1.0));
    }

    #[test]
    fn record_written_after_the_initial_read_is_detected() {
        // Start instant taken, collection read, then a record lands
        let mut state = WatchState::new("alice", Some("[]"), t(1.0));
        let raw = collection(&[("alice", 1.002)]);

        let mut by_event = state.clone();
        assert!(by_event.storage_changed(&raw));

        assert!(state.poll_tick(Some(&raw), t(3.0)));
        assert_eq!(state.last_seen_count(), 1);
    }

    #[test]
    fn poll_detects_new_record_once() {
        let mut state = WatchState::new("alice", Some(&collection(&[("alice", 0.0)])), t(1.0));

        let raw = collection(&[("alice", 0.0), ("alice", 2.5)]);
        assert!(state.poll_tick(Some(&raw), t(3.0)));
        assert_eq!(state.last_check(), t(3.0));
        assert_eq!(state.last_seen_count(), 2);

        assert!(!state.poll_tick(Some(&raw), t(5.0)));
        assert_eq!(state.last_check(), t(3.0));
    }

    #[test]
    fn poll_refreshes_count_without_detection() {
        let mut state = WatchState::new("alice", Some(&collection(&[("alice", 0.0)])), t(1.0));

        assert!(!state.poll_tick(Some("[]"), t(3.0)));
        assert_eq!(state.last_seen_count(), 0);
        assert!(!state.poll_tick(None, t(5.0)));
    }

    #[test]
    fn check_instant_never_moves_back() {
        let mut state = WatchState::new("alice", None, t(10.0));

        let raw = collection(&[("alice", 11.0)]);
        assert!(state.poll_tick(Some(&raw), t(8.0)));
        assert_eq!(state.last_check(), t(10.0));
    }

    #[test]
    fn storage_event_uses_count_rule() {
        let mut state = WatchState::new("alice", Some(&collection(&[("alice", 0.0)])), t(1.0));

        // Older than the check instant, detected anyway because the count grew
        let raw = collection(&[("alice", 0.0), ("alice", -30.0)]);
        assert!(state.storage_changed(&raw));
        assert_eq!(state.last_seen_count(), 2);
        assert_eq!(state.last_check(), t(1.0));

        assert!(!state.storage_changed(&raw));
    }

    #[test]
    fn shrinking_count_is_not_recorded() {
        let raw = collection(&[("alice", 0.0), ("alice", 0.1)]);
        let mut state = WatchState::new("alice", Some(&raw), t(1.0));

        assert!(!state.storage_changed(&collection(&[("alice", 0.0)])));
        assert_eq!(state.last_seen_count(), 2);
        assert!(!state.storage_changed(&raw));
    }

    #[test]
    fn other_owners_never_count() {
        let mut state = WatchState::new("alice", Some(&collection(&[("alice", 0.0)])), t(1.0));

        let raw = collection(&[("alice", 0.0), ("bob", 2.0), ("bob", 2.5), ("carol", 9.0)]);
        assert!(!state.storage_changed(&raw));
        assert!(!state.poll_tick(Some(&raw), t(3.0)));
        assert_eq!(state.last_seen_count(), 1);
        assert_eq!(state.last_check(), t(1.0));
    }

    #[test]
    fn malformed_payload_leaves_state_untouched() {
        let mut state = WatchState::new("alice", Some(&collection(&[("alice", 0.0)])), t(1.0));
        let before = state.clone();

        assert!(!state.poll_tick(Some("{broken"), t(3.0)));
        assert!(!state.storage_changed("not json"));
        assert!(!state.storage_changed(r#"{"userId": "alice"}"#));
        assert_eq!(state, before);
    }

    #[test]
    fn malformed_payload_at_start_counts_nothing() {
        let state = WatchState::new("alice", Some("{broken"), t(1.0));
        assert_eq!(state.last_seen_count(), 0);
    }

    #[test]
    fn poll_then_storage_event_plays_once() {
        let mut state = WatchState::new("alice", Some(&collection(&[("alice", 0.0)])), t(1.0));
        assert_eq!(state.last_seen_count(), 1);

        let raw = collection(&[("alice", 0.0), ("alice", 2.5)]);
        assert!(state.poll_tick(Some(&raw), t(3.0)));
        assert_eq!(state.last_check(), t(3.0));

        assert!(!state.storage_changed(&raw));
    }

    #[test]
    fn storage_event_then_poll_both_fire() {
        let mut state = WatchState::new("alice", Some(&collection(&[("alice", 0.0)])), t(1.0));

        let raw = collection(&[("alice", 0.0), ("alice", 2.5)]);
        assert!(state.storage_changed(&raw));
        assert!(state.poll_tick(Some(&raw), t(3.0)));
    }

    #[derive(Default)]
    struct CountingChime {
        plays: AtomicUsize,
    }

    impl Chime for CountingChime {
        fn play(&self, _sound: Option<SoundType>) {
            self.plays.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_options() -> WatcherOptions {
        WatcherOptions {
            poll_interval: Duration::from_millis(20),
            ..WatcherOptions::default()
        }
    }

    fn open_fast(dir: &std::path::Path) -> LocalStore {
        LocalStore::with_scan_interval(dir, Duration::from_millis(10)).unwrap()
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn empty_owner_does_not_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_fast(dir.path());
        let chime = Arc::new(CountingChime::default());

        assert!(OrderWatcher::start(&store, chime, "", fast_options()).is_none());
    }

    #[test]
    fn existing_records_do_not_play() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_fast(dir.path());
        store
            .set_item("orders", &collection(&[("alice", 0.0), ("alice", 1.0)]))
            .unwrap();
        let chime = Arc::new(CountingChime::default());

        let mut watcher =
            OrderWatcher::start(&store, chime.clone(), "alice", fast_options()).unwrap();
        thread::sleep(Duration::from_millis(150));
        watcher.stop();

        assert_eq!(chime.plays.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn plays_for_records_written_by_another_context() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_fast(dir.path());
        let other = open_fast(dir.path());
        let chime = Arc::new(CountingChime::default());

        let mut watcher =
            OrderWatcher::start(&store, chime.clone(), "alice", fast_options()).unwrap();

        thread::sleep(Duration::from_millis(5));
        let record = Record::new("alice", Utc::now());
        other
            .set_item("orders", &serde_json::to_string(&[record]).unwrap())
            .unwrap();

        assert!(wait_until(|| chime.plays.load(Ordering::SeqCst) >= 1));

        watcher.stop();
        watcher.stop();

        // Both channels may report the same record
        let plays = chime.plays.load(Ordering::SeqCst);
        assert!(plays <= 2);

        let newer = Record::new("alice", Utc::now());
        other
            .set_item("orders", &serde_json::to_string(&[newer.clone(), newer]).unwrap())
            .unwrap();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(chime.plays.load(Ordering::SeqCst), plays);
    }

    #[test]
    fn plays_for_records_written_in_the_same_context() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_fast(dir.path());
        let chime = Arc::new(CountingChime::default());

        let _watcher =
            OrderWatcher::start(&store, chime.clone(), "alice", fast_options()).unwrap();

        thread::sleep(Duration::from_millis(5));
        let record = Record::new("alice", Utc::now());
        crate::record::append_record(&store, "orders", &record).unwrap();

        assert!(wait_until(|| chime.plays.load(Ordering::SeqCst) >= 1));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(chime.plays.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_stops_the_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_fast(dir.path());
        let chime = Arc::new(CountingChime::default());

        let watcher = OrderWatcher::start(&store, chime.clone(), "alice", fast_options()).unwrap();
        drop(watcher);

        let record = Record::new("alice", Utc::now());
        crate::record::append_record(&store, "orders", &record).unwrap();
        thread::sleep(Duration::from_millis(150));

        assert_eq!(chime.plays.load(Ordering::SeqCst), 0);
    }
}
