//! End-to-end admission behaviour using the in-process store and queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_test::{assert_err, assert_ok};

use spillway::admission::{AdmissionDecision, AdmissionGate, CallerResponse};
use spillway::config::LimitsConfig;
use spillway::error::AdmissionError;
use spillway::queue::{DeadLetter, DeferredTask, Delivery, InMemoryQueue, OverflowQueue, QueueError};
use spillway::ratelimit::{
    ClientIdentity, CountingStore, InMemoryStore, StoreError, WindowKind, WindowSnapshot,
};

/// Counts store calls per window namespace.
#[derive(Default)]
struct SpyStore {
    inner: InMemoryStore,
    burst_calls: AtomicUsize,
    sustained_calls: AtomicUsize,
}

#[async_trait]
impl CountingStore for SpyStore {
    async fn consume(&self, key: &str, capacity: u64, window: Duration) -> Result<WindowSnapshot, StoreError> {
        if key.starts_with("rps:") {
            self.burst_calls.fetch_add(1, Ordering::SeqCst);
        } else if key.starts_with("rpm:") {
            self.sustained_calls.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.consume(key, capacity, window).await
    }

    async fn points(&self, key: &str) -> Result<Option<u64>, StoreError> {
        self.inner.points(key).await
    }
}

/// A store that never answers.
struct HangingStore;

#[async_trait]
impl CountingStore for HangingStore {
    async fn consume(&self, _: &str, _: u64, _: Duration) -> Result<WindowSnapshot, StoreError> {
        std::future::pending().await
    }

    async fn points(&self, _: &str) -> Result<Option<u64>, StoreError> {
        std::future::pending().await
    }
}

/// Counts enqueue attempts and optionally refuses them.
#[derive(Default)]
struct RecordingQueue {
    inner: InMemoryQueue,
    enqueues: AtomicUsize,
    refuse: bool,
}

impl RecordingQueue {
    fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl OverflowQueue for RecordingQueue {
    async fn enqueue(&self, task: &DeferredTask) -> Result<(), QueueError> {
        self.enqueues.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(QueueError::Unavailable("connection reset".into()));
        }
        self.inner.enqueue(task).await
    }

    async fn reserve(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        self.inner.reserve(wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.inner.ack(delivery).await
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        self.inner.retry(delivery, delay).await
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        self.inner.dead_letter(delivery, reason).await
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        self.inner.recover().await
    }

    async fn requeue_stalled(&self, older_than: Duration) -> Result<usize, QueueError> {
        self.inner.requeue_stalled(older_than).await
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        self.inner.dead_letters().await
    }

    async fn pending(&self) -> Result<usize, QueueError> {
        self.inner.pending().await
    }
}

struct Harness {
    store: Arc<SpyStore>,
    queue: Arc<RecordingQueue>,
    gate: AdmissionGate<SpyStore, RecordingQueue>,
}

fn harness_with(queue: RecordingQueue) -> Harness {
    let store = Arc::new(SpyStore::default());
    let queue = Arc::new(queue);
    let gate = AdmissionGate::new(store.clone(), queue.clone(), &LimitsConfig::default());
    Harness { store, queue, gate }
}

fn harness() -> Harness {
    harness_with(RecordingQueue::default())
}

#[tokio::test(start_paused = true)]
async fn scenario_a_second_immediate_request_is_deferred() {
    let h = harness();

    let first = assert_ok!(h.gate.admit("u1").await);
    assert_eq!(first, AdmissionDecision::Accepted);
    assert_eq!(h.queue.enqueues.load(Ordering::SeqCst), 0);

    let second = assert_ok!(h.gate.admit("u1").await);
    match second {
        AdmissionDecision::Deferred { retry_after_secs, .. } => assert_eq!(retry_after_secs, 1),
        other => panic!("expected deferral, got {:?}", other),
    }
    assert_eq!(h.queue.enqueues.load(Ordering::SeqCst), 1);
    assert_eq!(h.queue.pending().await.unwrap(), 1);

    let response = CallerResponse::from(&Ok::<_, AdmissionError>(second));
    assert_eq!(response.status, 202);
    assert_eq!(response.retry_after, Some(1));
}

#[tokio::test(start_paused = true)]
async fn scenario_b_twenty_first_request_hits_sustained_window() {
    let h = harness();

    for i in 0..20 {
        let decision = assert_ok!(h.gate.admit("u2").await);
        assert_eq!(decision, AdmissionDecision::Accepted, "request {} should be accepted", i + 1);
        tokio::time::advance(Duration::from_millis(1100)).await;
    }
    // 22s into the 60s window
    let decision = assert_ok!(h.gate.admit("u2").await);
    match decision {
        AdmissionDecision::Deferred { retry_after_secs, .. } => assert_eq!(retry_after_secs, 38),
        other => panic!("expected deferral, got {:?}", other),
    }
    assert_eq!(h.queue.enqueues.load(Ordering::SeqCst), 1);
    let sustained = h.gate.limiter(WindowKind::Sustained);
    let client = ClientIdentity::parse("u2").unwrap();
    assert_eq!(sustained.points(&client).await.unwrap(), 20);
}

#[tokio::test(start_paused = true)]
async fn scenario_c_store_timeout_is_an_error_without_enqueue() {
    let queue = Arc::new(RecordingQueue::default());
    let gate = AdmissionGate::new(Arc::new(HangingStore), queue.clone(), &LimitsConfig::default())
        .with_store_timeout(Duration::from_millis(100));

    let err = assert_err!(gate.admit("u3").await);
    assert!(matches!(err, AdmissionError::Store(StoreError::Timeout(_))));
    assert_eq!(queue.enqueues.load(Ordering::SeqCst), 0);
    assert_eq!(CallerResponse::from(&Err::<AdmissionDecision, _>(err)).status, 500);
}

#[tokio::test(start_paused = true)]
async fn scenario_d_enqueue_failure_downgrades_deferral_to_error() {
    let h = harness_with(RecordingQueue::refusing());

    assert_eq!(assert_ok!(h.gate.admit("u4").await), AdmissionDecision::Accepted);
    let err = assert_err!(h.gate.admit("u4").await);
    assert!(matches!(err, AdmissionError::Queue(_)));
    assert_eq!(h.queue.enqueues.load(Ordering::SeqCst), 1);
    assert_eq!(h.queue.pending().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn burst_rejection_never_consults_sustained() {
    let h = harness();

    h.gate.admit("u5").await.unwrap();
    assert_eq!(h.store.burst_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.sustained_calls.load(Ordering::SeqCst), 1);

    for _ in 0..5 {
        h.gate.admit("u5").await.unwrap();
    }
    assert_eq!(h.store.burst_calls.load(Ordering::SeqCst), 6);
    assert_eq!(h.store.sustained_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn every_deferral_matches_exactly_one_enqueue() {
    let h = harness();
    let mut deferred = 0;

    // 3 requests per second for 90 seconds
    for _ in 0..270 {
        if let AdmissionDecision::Deferred { .. } = h.gate.admit("u6").await.unwrap() {
            deferred += 1;
        }
        tokio::time::advance(Duration::from_millis(333)).await;
    }

    assert!(deferred > 0);
    assert_eq!(h.queue.enqueues.load(Ordering::SeqCst), deferred);
    assert_eq!(h.queue.pending().await.unwrap(), deferred);
}

#[tokio::test(start_paused = true)]
async fn sustained_budget_holds_for_evenly_spaced_traffic() {
    let h = harness();
    let mut accepted_at = Vec::new();

    // One request every 1.1s for three minutes
    for i in 0..165u64 {
        if h.gate.admit("u7").await.unwrap() == AdmissionDecision::Accepted {
            accepted_at.push(i * 1100);
        }
        tokio::time::advance(Duration::from_millis(1100)).await;
    }

    for (i, start) in accepted_at.iter().enumerate() {
        let in_window = accepted_at[i..]
            .iter()
            .take_while(|t| **t < start + 60_000)
            .count();
        assert!(in_window <= 20, "{} admissions within a minute of {}ms", in_window, start);
    }
}

#[tokio::test(start_paused = true)]
async fn fixed_windows_admit_up_to_twice_capacity_across_a_boundary() {
    let h = harness();
    let mut accepted_at = Vec::new();

    // One request opens the window at t=0, 19 crowd its tail, 20 open the next.
    let schedule: Vec<u64> = std::iter::once(0)
        .chain(40..59)
        .chain(60..80)
        .collect();
    let mut now = 0;
    for at in schedule {
        tokio::time::advance(Duration::from_secs(at - now)).await;
        now = at;
        if h.gate.admit("u9").await.unwrap() == AdmissionDecision::Accepted {
            accepted_at.push(at);
        }
    }

    assert_eq!(accepted_at.len(), 40);
    let rolling_minute = accepted_at.iter().filter(|t| (40..100).contains(*t)).count();
    assert_eq!(rolling_minute, 39);
}

#[tokio::test(start_paused = true)]
async fn clients_do_not_share_budgets() {
    let h = harness();
    assert_eq!(h.gate.admit("alice").await.unwrap(), AdmissionDecision::Accepted);
    assert_eq!(h.gate.admit("bob").await.unwrap(), AdmissionDecision::Accepted);
}

#[tokio::test(start_paused = true)]
async fn missing_identity_never_touches_the_store() {
    let h = harness();
    let err = assert_err!(h.gate.admit("  ").await);
    assert!(matches!(err, AdmissionError::Validation(_)));
    assert_eq!(h.store.burst_calls.load(Ordering::SeqCst), 0);
    assert_eq!(CallerResponse::from(&Err::<AdmissionDecision, _>(err)).status, 400);
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_admit_exactly_one_per_burst() {
    let h = Arc::new(harness());
    let mut handles = Vec::new();
    for _ in 0..50 {
        let h = h.clone();
        handles.push(tokio::spawn(async move { h.gate.admit("u8").await.unwrap() }));
    }

    let mut accepted = 0;
    for handle in handles {
        if handle.await.unwrap() == AdmissionDecision::Accepted {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(h.queue.enqueues.load(Ordering::SeqCst), 49);
}
