use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::types::{EventKey, WebhookEvent};

/// Scalar retry bookkeeping for one webhook.
///
/// `timeout` is the *remaining* budget; it is only decremented when the
/// state is suspended at shutdown.
#[derive(Debug, Clone)]
struct BackoffClock {
    timeout: Duration,
    active_since: DateTime<Utc>,
    last_retry: DateTime<Utc>,
    failure_count: u32,
    next_backoff: Duration,
}

/// Read-only projection of the scalar block, used for checkpointing.
#[derive(Debug, Clone)]
pub struct RetrySnapshot {
    pub active_since: DateTime<Utc>,
    pub last_retry: DateTime<Utc>,
    pub timeout: Duration,
    pub next_backoff: Duration,
    pub failure_count: u32,
}

/// Per-webhook retry state.
///
/// Owns the bounded retry queue of pending events, the in-flight set of
/// events currently posted but not yet confirmed, and a bounded channel
/// of one-shot backoff-reset signals. An event is never in the queue and
/// in flight at the same time: it leaves the queue when it enters the
/// in-flight set and is re-enqueued only after the backoff sleep.
///
/// The state is *active* iff it owns a live timeout timer.
pub struct RetryState {
    base: Duration,
    max_backoff: Duration,

    retry_tx: mpsc::Sender<WebhookEvent>,
    /// Handed to the retry dispatcher exactly once.
    retry_rx: StdMutex<Option<mpsc::Receiver<WebhookEvent>>>,

    in_flight: StdMutex<HashSet<EventKey>>,

    reset_tx: mpsc::Sender<oneshot::Sender<()>>,
    reset_rx: Mutex<mpsc::Receiver<oneshot::Sender<()>>>,

    clock: StdMutex<BackoffClock>,

    /// Kill switch of the timeout timer; `Some` iff active.
    timer: StdMutex<Option<CancellationToken>>,
}

impl RetryState {
    /// Fresh state after a first failure. `next_backoff` starts at the
    /// configured base and `failure_count` at zero.
    pub fn new(config: &RetryConfig, now: DateTime<Utc>) -> Self {
        Self::build(
            config,
            BackoffClock {
                timeout: config.timeout,
                active_since: now,
                last_retry: now,
                failure_count: 0,
                next_backoff: config.exponential_base,
            },
        )
    }

    /// State rebuilt from a persisted checkpoint entry.
    ///
    /// Durations are clamped at zero to tolerate clock jumps recorded in
    /// the blob.
    pub fn recovered(
        config: &RetryConfig,
        since_time: DateTime<Utc>,
        last_retry_time: DateTime<Utc>,
        time_left: Duration,
        backoff: Duration,
        attempt: u32,
    ) -> Self {
        Self::build(
            config,
            BackoffClock {
                timeout: time_left,
                active_since: since_time,
                last_retry: last_retry_time,
                failure_count: attempt,
                next_backoff: backoff,
            },
        )
    }

    fn build(config: &RetryConfig, clock: BackoffClock) -> Self {
        let capacity = config.capacity.max(1);
        let (retry_tx, retry_rx) = mpsc::channel(capacity);
        let (reset_tx, reset_rx) = mpsc::channel(capacity);
        Self {
            base: config.exponential_base,
            max_backoff: config.max_backoff,
            retry_tx,
            retry_rx: StdMutex::new(Some(retry_rx)),
            in_flight: StdMutex::new(HashSet::new()),
            reset_tx,
            reset_rx: Mutex::new(reset_rx),
            clock: StdMutex::new(clock),
            timer: StdMutex::new(None),
        }
    }

    /// Take the consuming end of the retry queue. Returns `None` after
    /// the first call; exactly one dispatcher may consume the queue.
    pub fn take_retry_receiver(&self) -> Option<mpsc::Receiver<WebhookEvent>> {
        self.retry_rx.lock().expect("retry_rx lock").take()
    }

    pub fn add_in_flight(&self, keys: &[EventKey]) {
        let mut guard = self.in_flight.lock().expect("in_flight lock");
        for key in keys {
            guard.insert(key.clone());
        }
    }

    pub fn remove_in_flight(&self, keys: &[EventKey]) {
        let mut guard = self.in_flight.lock().expect("in_flight lock");
        for key in keys {
            guard.remove(key);
        }
    }

    pub fn in_flight_is_empty(&self) -> bool {
        self.in_flight.lock().expect("in_flight lock").is_empty()
    }

    pub fn retry_queue_is_empty(&self) -> bool {
        self.retry_tx.capacity() == self.retry_tx.max_capacity()
    }

    /// Offer events to the retry queue. Blocks when the queue is at
    /// capacity; the backpressure is intentional.
    pub async fn enqueue_all(&self, events: Vec<WebhookEvent>) {
        for event in events {
            if self.retry_tx.send(event).await.is_err() {
                // Receiver gone: dispatcher is shut down, events are
                // recovered from the event repository on restart.
                return;
            }
        }
    }

    /// Grow the backoff after a failed dispatch.
    ///
    /// `failure_count` stops advancing once the exponential reaches the
    /// ceiling, so a later success resumes from a meaningful count.
    pub fn increase_backoff(&self, now: DateTime<Utc>) {
        let mut clock = self.clock.lock().expect("clock lock");
        let exponential = 2u32
            .checked_pow(clock.failure_count)
            .map_or(Duration::MAX, |m| self.base.saturating_mul(m));
        if exponential >= self.max_backoff {
            clock.next_backoff = self.max_backoff;
        } else {
            clock.failure_count += 1;
            clock.next_backoff = exponential;
        }
        clock.last_retry = now;
    }

    /// Reset the backoff after a successful dispatch and wake every
    /// requeue currently sleeping on it.
    pub async fn reset_backoff(&self, now: DateTime<Utc>) {
        {
            let mut clock = self.clock.lock().expect("clock lock");
            clock.failure_count = 0;
            clock.next_backoff = self.base;
            clock.last_retry = now;
        }
        let mut pending = self.reset_rx.lock().await;
        while let Ok(signal) = pending.try_recv() {
            let _ = signal.send(());
        }
    }

    /// Sleep out the current backoff, preemptible by a backoff reset or
    /// shutdown, then re-enqueue `events`.
    ///
    /// On shutdown the events are dropped; their status is still
    /// `Delivering` in the event repository and they replay on restart.
    pub async fn requeue(&self, events: Vec<WebhookEvent>, shutdown: &CancellationToken) {
        let (signal_tx, signal_rx) = oneshot::channel();
        let registered = tokio::select! {
            _ = shutdown.cancelled() => return,
            sent = self.reset_tx.send(signal_tx) => sent.is_ok(),
        };
        let backoff = self.next_backoff();

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = sleep(backoff) => {}
            _ = signal_rx, if registered => {}
        }

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = self.enqueue_all(events) => {}
        }
    }

    /// Arm the timeout timer. Idempotent: a state that is already active
    /// keeps its running timer and `on_timeout` is dropped.
    pub fn set_active_with_timeout<F>(&self, on_timeout: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut timer = self.timer.lock().expect("timer lock");
        if timer.is_some() {
            return;
        }

        let remaining = {
            let mut clock = self.clock.lock().expect("clock lock");
            clock.active_since = Utc::now();
            clock.timeout
        };

        let kill_switch = CancellationToken::new();
        let observed = kill_switch.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = observed.cancelled() => {}
                _ = sleep(remaining) => on_timeout.await,
            }
        });
        *timer = Some(kill_switch);
    }

    /// Cancel the timeout timer via its kill switch. No-op when inactive.
    pub fn set_inactive(&self) {
        if let Some(kill_switch) = self.timer.lock().expect("timer lock").take() {
            kill_switch.cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.timer.lock().expect("timer lock").is_some()
    }

    /// Fold elapsed wall-clock time into the remaining timeout and
    /// backoff, ahead of checkpointing. Saturates at zero.
    pub fn suspend(&self, now: DateTime<Utc>) {
        let mut clock = self.clock.lock().expect("clock lock");
        let active_for = (now - clock.active_since).to_std().unwrap_or_default();
        let since_retry = (now - clock.last_retry).to_std().unwrap_or_default();
        clock.timeout = clock.timeout.saturating_sub(active_for);
        clock.next_backoff = clock.next_backoff.saturating_sub(since_retry);
    }

    pub fn next_backoff(&self) -> Duration {
        self.clock.lock().expect("clock lock").next_backoff
    }

    pub fn failure_count(&self) -> u32 {
        self.clock.lock().expect("clock lock").failure_count
    }

    pub fn snapshot(&self) -> RetrySnapshot {
        let clock = self.clock.lock().expect("clock lock");
        RetrySnapshot {
            active_since: clock.active_since,
            last_retry: clock.last_retry,
            timeout: clock.timeout,
            next_backoff: clock.next_backoff,
            failure_count: clock.failure_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    fn config(base_ms: u64, max_ms: u64) -> RetryConfig {
        RetryConfig::default()
            .with_capacity(8)
            .with_exponential_base(Duration::from_millis(base_ms))
            .with_max_backoff(Duration::from_millis(max_ms))
    }

    fn event(id: &str) -> WebhookEvent {
        WebhookEvent::new(EventKey::new("w1", id), b"{}".to_vec())
    }

    #[test]
    fn backoff_doubles_then_holds_at_ceiling() {
        let state = RetryState::new(&config(1_000, 4_000), Utc::now());

        let mut observed = Vec::new();
        for _ in 0..10 {
            state.increase_backoff(Utc::now());
            observed.push(state.next_backoff().as_millis());
        }
        assert_eq!(
            observed,
            vec![1_000, 2_000, 4_000, 4_000, 4_000, 4_000, 4_000, 4_000, 4_000, 4_000]
        );
        // failure_count stops advancing once the exponential reaches the cap.
        assert_eq!(state.failure_count(), 2);
    }

    #[tokio::test]
    async fn reset_returns_backoff_to_base() {
        let state = RetryState::new(&config(100, 10_000), Utc::now());
        for _ in 0..4 {
            state.increase_backoff(Utc::now());
        }
        assert!(state.next_backoff() > Duration::from_millis(100));

        state.reset_backoff(Utc::now()).await;
        assert_eq!(state.next_backoff(), Duration::from_millis(100));
        assert_eq!(state.failure_count(), 0);
    }

    #[tokio::test]
    async fn reset_wakes_sleeping_requeue() {
        let state = Arc::new(RetryState::new(&config(60_000, 120_000), Utc::now()));
        state.increase_backoff(Utc::now());
        let shutdown = CancellationToken::new();

        let sleeper = {
            let state = state.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                state.requeue(vec![event("e1")], &shutdown).await;
            })
        };

        // Let the requeue register its reset signal, then fire the reset.
        tokio::time::sleep(Duration::from_millis(50)).await;
        state.reset_backoff(Utc::now()).await;

        tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .expect("requeue preempted long before its one-minute sleep")
            .unwrap();

        let mut rx = state.take_retry_receiver().expect("receiver");
        assert_eq!(rx.recv().await.unwrap().key, EventKey::new("w1", "e1"));
    }

    #[tokio::test]
    async fn timer_fires_when_not_cancelled() {
        let state = RetryState::new(
            &config(100, 1_000).with_timeout(Duration::from_millis(50)),
            Utc::now(),
        );
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        state.set_active_with_timeout(async move {
            flag.store(true, Ordering::SeqCst);
        });
        assert!(state.is_active());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn kill_switch_cancels_timer() {
        let state = RetryState::new(
            &config(100, 1_000).with_timeout(Duration::from_millis(50)),
            Utc::now(),
        );
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        state.set_active_with_timeout(async move {
            flag.store(true, Ordering::SeqCst);
        });
        state.set_inactive();
        assert!(!state.is_active());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn activation_is_idempotent() {
        let state = RetryState::new(&config(100, 1_000), Utc::now());
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        state.set_active_with_timeout(async move {
            flag.store(true, Ordering::SeqCst);
        });
        // Second activation must not replace the running timer.
        state.set_active_with_timeout(async {});
        state.set_inactive();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn suspend_folds_elapsed_time() {
        let now = Utc::now();
        let state = RetryState::new(
            &config(1_000, 10_000).with_timeout(Duration::from_secs(60)),
            now,
        );
        state.increase_backoff(now);

        let later = now + chrono::Duration::seconds(10);
        state.suspend(later);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.timeout, Duration::from_secs(50));
        // next_backoff was 1s and 10s elapsed since last_retry: clamped.
        assert_eq!(snapshot.next_backoff, Duration::ZERO);
    }

    #[tokio::test]
    async fn requeued_event_has_a_single_home_at_all_times() {
        let state = Arc::new(RetryState::new(&config(100, 1_000), Utc::now()));
        let shutdown = CancellationToken::new();
        let key = EventKey::new("w1", "e1");

        // Dispatcher side of the cycle: the event leaves the queue
        // before it goes in flight.
        state.enqueue_all(vec![event("e1")]).await;
        let mut rx = state.take_retry_receiver().expect("receiver");
        let taken = rx.recv().await.unwrap();
        assert!(state.retry_queue_is_empty());
        state.add_in_flight(&[key.clone()]);

        // Failure path: while the requeue sleeps, the event must not be
        // back in the queue, or a second take could post it again.
        let cycle = {
            let state = state.clone();
            let shutdown = shutdown.clone();
            let key = key.clone();
            tokio::spawn(async move {
                state.requeue(vec![taken], &shutdown).await;
                state.remove_in_flight(&[key]);
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(state.retry_queue_is_empty(), "not re-enqueued while sleeping");
        assert!(!state.in_flight_is_empty());

        cycle.await.unwrap();
        assert!(state.in_flight_is_empty());
        let back = rx.recv().await.unwrap();
        assert_eq!(back.key, key);
        assert!(rx.try_recv().is_err(), "exactly one copy re-enqueued");

        // Same cycle again, this time preempted by a backoff reset; the
        // early wake-up must not duplicate the event either.
        state.add_in_flight(&[key.clone()]);
        for _ in 0..3 {
            state.increase_backoff(Utc::now());
        }
        let cycle = {
            let state = state.clone();
            let shutdown = shutdown.clone();
            let key = key.clone();
            tokio::spawn(async move {
                state.requeue(vec![back], &shutdown).await;
                state.remove_in_flight(&[key]);
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(state.retry_queue_is_empty(), "still sleeping out its backoff");
        state.reset_backoff(Utc::now()).await;

        cycle.await.unwrap();
        assert!(state.in_flight_is_empty());
        assert_eq!(rx.recv().await.unwrap().key, key);
        assert!(rx.try_recv().is_err(), "exactly one copy after the reset wake");
    }

    #[test]
    fn queue_and_in_flight_bookkeeping() {
        let state = RetryState::new(&config(100, 1_000), Utc::now());
        assert!(state.retry_queue_is_empty());
        assert!(state.in_flight_is_empty());

        let keys = vec![EventKey::new("w1", "e1"), EventKey::new("w1", "e2")];
        state.add_in_flight(&keys);
        assert!(!state.in_flight_is_empty());
        state.remove_in_flight(&keys);
        assert!(state.in_flight_is_empty());
    }
}
