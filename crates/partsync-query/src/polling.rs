//! Polling scheduler.
//!
//! Re-fetches a query on a fixed interval, waiting for each round trip to
//! finish before the next countdown starts.  An unresponsive machine therefore
//! never accumulates a backlog of requests: at most one refetch per session is
//! outstanding at any time.
//!
//! # Sessions
//!
//! A [`PollHandle`] watches a key and an [`Interval`].  Each (key, interval)
//! pair with an enabled interval runs one *session*:
//!
//! ```text
//! wait(interval) -> refetch(key) -> wait(interval) -> refetch(key) -> ...
//! ```
//!
//! Changing the key or the interval ends the current session and starts a
//! new one.  Dropping the handle ends it for good.  A refetch that is already
//! in flight when its session ends is allowed to finish, but nothing is
//! scheduled after it.  A refetch that fails ends its session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use partsync_types::PartSyncError;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::key::QueryKey;

/// Polling period.  `Disabled` schedules nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Interval {
    #[default]
    Disabled,
    Every(Duration),
}

impl Interval {
    /// `0` means disabled.
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            Self::Disabled
        } else {
            Self::Every(Duration::from_millis(ms))
        }
    }

    pub fn period(self) -> Option<Duration> {
        match self {
            Self::Every(period) if !period.is_zero() => Some(period),
            _ => None,
        }
    }

    pub fn is_enabled(self) -> bool {
        self.period().is_some()
    }
}

impl From<Option<Duration>> for Interval {
    fn from(period: Option<Duration>) -> Self {
        period.map_or(Self::Disabled, Self::Every)
    }
}

/// Re-runs every enabled query whose key starts with `key`.
#[async_trait]
pub trait Refetch: Send + Sync {
    async fn refetch(&self, key: &QueryKey) -> Result<(), PartSyncError>;
}

/// Starts polling sessions against a [`Refetch`] target.
#[derive(Clone)]
pub struct Poller {
    target: Arc<dyn Refetch>,
}

impl Poller {
    pub fn new(target: Arc<dyn Refetch>) -> Self {
        Self { target }
    }

    /// Poll `key` every `interval`.  The returned handle can change both.
    pub fn schedule(&self, key: QueryKey, interval: Interval) -> PollHandle {
        let (key_tx, key_rx) = watch::channel(key);
        let (interval_tx, interval_rx) = watch::channel(interval);
        PollHandle {
            key: Some(key_tx),
            interval: Some(interval_tx),
            driver: self.spawn_driver(key_rx, interval_rx),
        }
    }

    /// Poll with the key and interval supplied by outside channels.
    ///
    /// Polling stops for good once either sender is dropped.
    pub fn schedule_with(
        &self,
        key: watch::Receiver<QueryKey>,
        interval: watch::Receiver<Interval>,
    ) -> PollHandle {
        PollHandle {
            key: None,
            interval: None,
            driver: self.spawn_driver(key, interval),
        }
    }

    fn spawn_driver(
        &self,
        key: watch::Receiver<QueryKey>,
        interval: watch::Receiver<Interval>,
    ) -> JoinHandle<()> {
        tokio::spawn(drive(Arc::clone(&self.target), key, interval))
    }
}

/// Owns one polling schedule.  Dropping it stops polling.
pub struct PollHandle {
    key: Option<watch::Sender<QueryKey>>,
    interval: Option<watch::Sender<Interval>>,
    driver: JoinHandle<()>,
}

impl PollHandle {
    /// Switch to a new key.  Returns `false` when the key is driven by an
    /// outside channel.
    pub fn set_key(&self, key: QueryKey) -> bool {
        match &self.key {
            Some(tx) => {
                tx.send_if_modified(|current| replace_if_changed(current, key));
                true
            }
            None => false,
        }
    }

    /// Switch to a new interval.  Returns `false` when the interval is driven
    /// by an outside channel.
    pub fn set_interval(&self, interval: Interval) -> bool {
        match &self.interval {
            Some(tx) => {
                tx.send_if_modified(|current| replace_if_changed(current, interval));
                true
            }
            None => false,
        }
    }

    /// `true` once polling has stopped for good.
    pub fn is_finished(&self) -> bool {
        self.driver.is_finished()
    }

    /// Stop polling for good.  Consumes the handle; dropping it does the same.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

fn replace_if_changed<T: PartialEq>(current: &mut T, next: T) -> bool {
    if *current == next {
        false
    } else {
        *current = next;
        true
    }
}

async fn drive(
    target: Arc<dyn Refetch>,
    mut key_rx: watch::Receiver<QueryKey>,
    mut interval_rx: watch::Receiver<Interval>,
) {
    loop {
        let key = key_rx.borrow_and_update().clone();
        let interval = *interval_rx.borrow_and_update();

        let session = interval.period().map(|period| {
            debug!(key = %key, period_ms = period.as_millis() as u64, "polling session started");
            Session::start(Arc::clone(&target), key.clone(), period)
        });

        let open = tokio::select! {
            changed = key_rx.changed() => changed.is_ok(),
            changed = interval_rx.changed() => changed.is_ok(),
        };

        if session.is_some() {
            debug!(key = %key, "polling session ended");
        }
        drop(session);
        if !open {
            break;
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Session
// ────────────────────────────────────────────────────────────────────────────

/// One wait/refetch cycle.  Dropping it deactivates the cycle.
struct Session {
    active: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl Session {
    fn start(target: Arc<dyn Refetch>, key: QueryKey, period: Duration) -> Self {
        let active = Arc::new(AtomicBool::new(true));
        let wake = Arc::new(Notify::new());
        tokio::spawn(cycle(target, key, period, Arc::clone(&active), Arc::clone(&wake)));
        Self { active, wake }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

async fn cycle(
    target: Arc<dyn Refetch>,
    key: QueryKey,
    period: Duration,
    active: Arc<AtomicBool>,
    wake: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = wake.notified() => return,
        }
        if !active.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = target.refetch(&key).await {
            warn!(key = %key, error = %e, "refetch failed; polling stopped");
            return;
        }
        if !active.load(Ordering::SeqCst) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partsync_types::PartId;
    use std::sync::Mutex;

    const PERIOD: Duration = Duration::from_millis(100);

    enum Mode {
        Succeed,
        Fail,
        Hang,
        Gate(Arc<Notify>),
    }

    struct Recorder {
        calls: Mutex<Vec<QueryKey>>,
        mode: Mode,
    }

    impl Recorder {
        fn new(mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                mode,
            })
        }

        fn count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Refetch for Recorder {
        async fn refetch(&self, key: &QueryKey) -> Result<(), PartSyncError> {
            self.calls.lock().unwrap().push(key.clone());
            match &self.mode {
                Mode::Succeed => Ok(()),
                Mode::Fail => Err(PartSyncError::Request("boom".to_string())),
                Mode::Hang => std::future::pending().await,
                Mode::Gate(gate) => {
                    gate.notified().await;
                    Ok(())
                }
            }
        }
    }

    fn poller(recorder: &Arc<Recorder>) -> Poller {
        Poller::new(Arc::clone(recorder) as Arc<dyn Refetch>)
    }

    fn key(part: &str) -> QueryKey {
        QueryKey::part(&PartId::from(part)).push("robotClient").push("getMachineStatus")
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn tick(times: u32) {
        for _ in 0..times {
            tokio::time::advance(PERIOD).await;
            settle().await;
        }
    }

    #[test]
    fn zero_interval_is_disabled() {
        assert_eq!(Interval::from_millis(0), Interval::Disabled);
        assert!(!Interval::Every(Duration::ZERO).is_enabled());
        assert_eq!(Interval::from_millis(250).period(), Some(Duration::from_millis(250)));
        assert_eq!(Interval::from(None), Interval::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn refetches_once_per_interval() {
        let recorder = Recorder::new(Mode::Succeed);
        let _handle = poller(&recorder).schedule(key("p1"), Interval::Every(PERIOD));
        settle().await;
        assert_eq!(recorder.count(), 0, "nothing before the first interval elapses");

        tick(1).await;
        assert_eq!(recorder.count(), 1);
        tick(1).await;
        assert_eq!(recorder.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_refetch_blocks_the_next_one() {
        let recorder = Recorder::new(Mode::Hang);
        let _handle = poller(&recorder).schedule(key("p1"), Interval::Every(PERIOD));
        settle().await;

        tick(10).await;
        assert_eq!(recorder.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_interval_stops_polling() {
        let recorder = Recorder::new(Mode::Succeed);
        let handle = poller(&recorder).schedule(key("p1"), Interval::Every(PERIOD));
        settle().await;
        tick(1).await;
        assert_eq!(recorder.count(), 1);

        assert!(handle.set_interval(Interval::Disabled));
        settle().await;
        tick(5).await;
        assert_eq!(recorder.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_during_refetch_schedules_nothing_more() {
        let gate = Arc::new(Notify::new());
        let recorder = Recorder::new(Mode::Gate(Arc::clone(&gate)));
        let handle = poller(&recorder).schedule(key("p1"), Interval::Every(PERIOD));
        settle().await;
        tick(1).await;
        assert_eq!(recorder.count(), 1, "first refetch is in flight");

        drop(handle);
        settle().await;
        gate.notify_one();
        settle().await;

        tick(5).await;
        assert_eq!(recorder.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_polling() {
        let recorder = Recorder::new(Mode::Succeed);
        let handle = poller(&recorder).schedule(key("p1"), Interval::Every(PERIOD));
        settle().await;
        tick(2).await;
        assert_eq!(recorder.count(), 2);

        handle.cancel();
        settle().await;
        tick(5).await;
        assert_eq!(recorder.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refetch_ends_the_session() {
        let recorder = Recorder::new(Mode::Fail);
        let _handle = poller(&recorder).schedule(key("p1"), Interval::Every(PERIOD));
        settle().await;

        tick(5).await;
        assert_eq!(recorder.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn key_change_restarts_with_new_key() {
        let recorder = Recorder::new(Mode::Succeed);
        let handle = poller(&recorder).schedule(key("p1"), Interval::Every(PERIOD));
        settle().await;
        tick(1).await;

        assert!(handle.set_key(key("p2")));
        settle().await;
        tick(1).await;

        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![key("p1"), key("p2")]);
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_are_independent() {
        let fast = Recorder::new(Mode::Succeed);
        let slow = Recorder::new(Mode::Succeed);
        let _fast = poller(&fast).schedule(key("p1"), Interval::Every(PERIOD));
        let _slow = poller(&slow).schedule(key("p2"), Interval::Every(PERIOD * 3));
        settle().await;

        tick(3).await;
        assert_eq!(fast.count(), 3);
        assert_eq!(slow.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn external_sources_drive_the_schedule() {
        let recorder = Recorder::new(Mode::Succeed);
        let (key_tx, key_rx) = watch::channel(key("p1"));
        let (interval_tx, interval_rx) = watch::channel(Interval::Disabled);
        let handle = poller(&recorder).schedule_with(key_rx, interval_rx);
        assert!(!handle.set_interval(Interval::Every(PERIOD)));
        settle().await;

        tick(2).await;
        assert_eq!(recorder.count(), 0);

        interval_tx.send_replace(Interval::Every(PERIOD));
        settle().await;
        tick(1).await;
        assert_eq!(recorder.count(), 1);

        drop(key_tx);
        settle().await;
        assert!(handle.is_finished());
        tick(3).await;
        assert_eq!(recorder.count(), 1);
    }
}
