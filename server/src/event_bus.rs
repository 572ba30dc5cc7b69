//! Typed publish/subscribe bus.
//!
//! Handlers subscribe to one [`EventKind`] with a priority; dispatch walks
//! subscribers in strictly decreasing priority, insertion order inside a
//! priority tier. Publishing is synchronous (inline dispatch) or
//! asynchronous (bounded time-ordered queue drained by a worker pool)
//! depending on configuration; delayed and periodic publishes always go
//! through the queue.
//!
//! The subscriber table lock is held only around subscribe/unsubscribe and
//! the per-dispatch snapshot, never across a handler call. A panicking
//! handler is isolated at the dispatch boundary, counted, and logged.

use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use std::{cmp, fmt};

use crate::config::EventBusConfig;
use crate::events::{EventKind, GameEvent};

pub type SubscriberId = i64;
pub type PeriodicEventId = i64;

/// Bus operation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bounded async queue is full; the publish was rejected.
    Backpressure { queue_size: usize },
    /// Interval or delay was not representable (periodic interval of 0).
    InvalidInterval,
    /// The bus has been shut down.
    ShutDown,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Backpressure { queue_size } => {
                write!(f, "event queue full ({queue_size} events)")
            }
            BusError::InvalidInterval => write!(f, "periodic interval must be non-zero"),
            BusError::ShutDown => write!(f, "event bus is shut down"),
        }
    }
}

impl std::error::Error for BusError {}

/// Snapshot of bus counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BusStats {
    pub total_events: u64,
    pub processed_events: u64,
    pub queue_size: usize,
    pub avg_processing_ms: f32,
    pub events_per_second: f32,
    pub handler_panics: u64,
    pub backpressure_rejections: u64,
}

struct Subscriber {
    id: SubscriberId,
    priority: i32,
    handler: Arc<dyn Fn(&GameEvent) + Send + Sync>,
}

#[derive(Default)]
struct SubscriberTable {
    by_kind: HashMap<EventKind, Vec<Subscriber>>,
    kind_of: HashMap<SubscriberId, EventKind>,
}

struct QueuedEvent {
    due: Instant,
    seq: u64,
    event: GameEvent,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    // Reversed so the earliest due time (then lowest sequence number) sits
    // on top of the max-heap.
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PeriodicEvent {
    id: PeriodicEventId,
    event: GameEvent,
    interval: Duration,
    /// Fires left; 0 means unbounded.
    remaining: u32,
    next_due: Instant,
    active: bool,
}

#[derive(Default)]
struct StatCounters {
    total_events: AtomicU64,
    processed_events: AtomicU64,
    total_processing_us: AtomicU64,
    handler_panics: AtomicU64,
    backpressure_rejections: AtomicU64,
}

struct BusShared {
    config: EventBusConfig,
    subscribers: Mutex<SubscriberTable>,
    queue: Mutex<BinaryHeap<QueuedEvent>>,
    queue_cv: Condvar,
    periodic: Mutex<Vec<PeriodicEvent>>,
    periodic_cv: Condvar,
    active: AtomicBool,
    next_subscriber_id: AtomicI64,
    next_periodic_id: AtomicI64,
    next_seq: AtomicU64,
    stats: StatCounters,
    stats_start: Mutex<Instant>,
}

/// The process-wide event bus. Constructed once by the server aggregate and
/// handed to subsystems as an `Arc`.
pub struct EventBus {
    shared: Arc<BusShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    periodic_thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let worker_count = config.num_worker_threads.max(1);
        let shared = Arc::new(BusShared {
            config,
            subscribers: Mutex::new(SubscriberTable::default()),
            queue: Mutex::new(BinaryHeap::new()),
            queue_cv: Condvar::new(),
            periodic: Mutex::new(Vec::new()),
            periodic_cv: Condvar::new(),
            active: AtomicBool::new(true),
            next_subscriber_id: AtomicI64::new(1),
            next_periodic_id: AtomicI64::new(1),
            next_seq: AtomicU64::new(0),
            stats: StatCounters::default(),
            stats_start: Mutex::new(Instant::now()),
        });

        // Workers always run: delayed and periodic events need a drain even
        // when plain publishes dispatch inline.
        let mut workers = Vec::with_capacity(worker_count);
        for n in 0..worker_count {
            let shared_clone = shared.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("bus-worker-{n}"))
                    .spawn(move || worker_loop(&shared_clone))
                    .expect("Failed to spawn event bus worker"),
            );
        }

        let shared_clone = shared.clone();
        let periodic_thread = std::thread::Builder::new()
            .name("bus-periodic".into())
            .spawn(move || periodic_loop(&shared_clone))
            .expect("Failed to spawn periodic event thread");

        Self {
            shared,
            workers: Mutex::new(workers),
            periodic_thread: Mutex::new(Some(periodic_thread)),
        }
    }

    /// Subscribe a handler for one event kind. Higher priorities run first;
    /// equal priorities run in subscription order.
    pub fn subscribe(
        &self,
        kind: EventKind,
        priority: i32,
        handler: impl Fn(&GameEvent) + Send + Sync + 'static,
    ) -> SubscriberId {
        let id = self.shared.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let mut table = self.shared.subscribers.lock().unwrap();
        let list = table.by_kind.entry(kind).or_default();
        list.push(Subscriber {
            id,
            priority,
            handler: Arc::new(handler),
        });
        // Stable sort keeps insertion order inside a priority tier.
        list.sort_by(|a, b| b.priority.cmp(&a.priority));
        table.kind_of.insert(id, kind);
        id
    }

    /// Remove a subscription. Dispatches already in flight still see the
    /// old snapshot; subsequent events do not.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut table = self.shared.subscribers.lock().unwrap();
        let Some(kind) = table.kind_of.remove(&id) else {
            return false;
        };
        if let Some(list) = table.by_kind.get_mut(&kind) {
            list.retain(|s| s.id != id);
        }
        true
    }

    /// Publish an event. Dispatches inline in sync mode; enqueues for the
    /// worker pool in async mode.
    pub fn publish(&self, event: GameEvent) -> Result<(), BusError> {
        if !self.shared.active.load(Ordering::SeqCst) {
            return Err(BusError::ShutDown);
        }
        self.shared.stats.total_events.fetch_add(1, Ordering::Relaxed);
        if self.shared.config.use_async_dispatch {
            enqueue(&self.shared, event, Instant::now())
        } else {
            dispatch_event(&self.shared, &event);
            Ok(())
        }
    }

    /// Enqueue an event for dispatch at `now + delay_ms`.
    pub fn publish_delayed(&self, event: GameEvent, delay_ms: u64) -> Result<(), BusError> {
        if !self.shared.active.load(Ordering::SeqCst) {
            return Err(BusError::ShutDown);
        }
        self.shared.stats.total_events.fetch_add(1, Ordering::Relaxed);
        enqueue(
            &self.shared,
            event,
            Instant::now() + Duration::from_millis(delay_ms),
        )
    }

    /// Schedule an event every `interval_ms`, `repeat_count` times (0 =
    /// until canceled). First fire is one interval from now.
    pub fn publish_periodic(
        &self,
        event: GameEvent,
        interval_ms: u64,
        repeat_count: u32,
    ) -> Result<PeriodicEventId, BusError> {
        if !self.shared.active.load(Ordering::SeqCst) {
            return Err(BusError::ShutDown);
        }
        if interval_ms == 0 {
            return Err(BusError::InvalidInterval);
        }
        let id = self.shared.next_periodic_id.fetch_add(1, Ordering::SeqCst);
        let interval = Duration::from_millis(interval_ms);
        {
            let mut list = self.shared.periodic.lock().unwrap();
            list.push(PeriodicEvent {
                id,
                event,
                interval,
                remaining: repeat_count,
                next_due: Instant::now() + interval,
                active: true,
            });
        }
        self.shared.periodic_cv.notify_all();
        Ok(id)
    }

    pub fn cancel_periodic(&self, id: PeriodicEventId) -> bool {
        let mut list = self.shared.periodic.lock().unwrap();
        let found = match list.iter_mut().find(|p| p.id == id && p.active) {
            Some(p) => {
                p.active = false;
                true
            }
            None => false,
        };
        drop(list);
        if found {
            self.shared.periodic_cv.notify_all();
        }
        found
    }

    pub fn stats(&self) -> BusStats {
        let s = &self.shared.stats;
        let processed = s.processed_events.load(Ordering::Relaxed);
        let total_us = s.total_processing_us.load(Ordering::Relaxed);
        let elapsed = self.shared.stats_start.lock().unwrap().elapsed();
        BusStats {
            total_events: s.total_events.load(Ordering::Relaxed),
            processed_events: processed,
            queue_size: self.shared.queue.lock().unwrap().len(),
            avg_processing_ms: if processed > 0 {
                total_us as f32 / processed as f32 / 1000.0
            } else {
                0.0
            },
            events_per_second: if elapsed.as_secs_f32() > 0.0 {
                processed as f32 / elapsed.as_secs_f32()
            } else {
                0.0
            },
            handler_panics: s.handler_panics.load(Ordering::Relaxed),
            backpressure_rejections: s.backpressure_rejections.load(Ordering::Relaxed),
        }
    }

    pub fn clear_stats(&self) {
        let s = &self.shared.stats;
        s.total_events.store(0, Ordering::Relaxed);
        s.processed_events.store(0, Ordering::Relaxed);
        s.total_processing_us.store(0, Ordering::Relaxed);
        s.handler_panics.store(0, Ordering::Relaxed);
        s.backpressure_rejections.store(0, Ordering::Relaxed);
        *self.shared.stats_start.lock().unwrap() = Instant::now();
    }

    /// Stop workers and the periodic thread, then join them. Idempotent;
    /// also invoked by `Drop`.
    pub fn shutdown(&self) {
        self.shared.active.store(false, Ordering::SeqCst);
        self.shared.queue_cv.notify_all();
        self.shared.periodic_cv.notify_all();
        for handle in self.workers.lock().unwrap().drain(..) {
            if let Err(e) = handle.join() {
                log::error!("Event bus worker panicked: {e:?}");
            }
        }
        if let Some(handle) = self.periodic_thread.lock().unwrap().take() {
            if let Err(e) = handle.join() {
                log::error!("Periodic event thread panicked: {e:?}");
            }
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn enqueue(shared: &Arc<BusShared>, event: GameEvent, due: Instant) -> Result<(), BusError> {
    let mut queue = shared.queue.lock().unwrap();
    if queue.len() >= shared.config.max_queue_size {
        shared
            .stats
            .backpressure_rejections
            .fetch_add(1, Ordering::Relaxed);
        return Err(BusError::Backpressure {
            queue_size: queue.len(),
        });
    }
    let seq = shared.next_seq.fetch_add(1, Ordering::SeqCst);
    queue.push(QueuedEvent { due, seq, event });
    drop(queue);
    shared.queue_cv.notify_one();
    Ok(())
}

/// Dispatch one event to a snapshot of its subscribers.
fn dispatch_event(shared: &BusShared, event: &GameEvent) {
    let handlers: Vec<Arc<dyn Fn(&GameEvent) + Send + Sync>> = {
        let table = shared.subscribers.lock().unwrap();
        match table.by_kind.get(&event.kind()) {
            Some(list) => list.iter().map(|s| s.handler.clone()).collect(),
            None => Vec::new(),
        }
    };

    let started = Instant::now();
    for handler in handlers {
        if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
            shared.stats.handler_panics.fetch_add(1, Ordering::Relaxed);
            log::error!("Event handler panicked on {:?}", event.kind());
        }
    }
    shared
        .stats
        .total_processing_us
        .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
    shared.stats.processed_events.fetch_add(1, Ordering::Relaxed);
}

fn worker_loop(shared: &Arc<BusShared>) {
    loop {
        let ready = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if !shared.active.load(Ordering::SeqCst) {
                    return;
                }
                let now = Instant::now();
                let next_due = queue.peek().map(|e| e.due);
                match next_due {
                    None => {
                        queue = shared.queue_cv.wait(queue).unwrap();
                    }
                    Some(due) if due <= now => {
                        break queue.pop().expect("peeked entry vanished");
                    }
                    Some(due) => {
                        let (q, _) = shared
                            .queue_cv
                            .wait_timeout(queue, due.saturating_duration_since(now))
                            .unwrap();
                        queue = q;
                    }
                }
            }
        };
        dispatch_event(shared, &ready.event);
    }
}

fn periodic_loop(shared: &Arc<BusShared>) {
    loop {
        let fired = {
            let mut list = shared.periodic.lock().unwrap();
            loop {
                if !shared.active.load(Ordering::SeqCst) {
                    return;
                }
                let now = Instant::now();
                let next_due = list.iter().filter(|p| p.active).map(|p| p.next_due).min();
                match next_due {
                    None => {
                        list = shared.periodic_cv.wait(list).unwrap();
                    }
                    Some(due) if due > now => {
                        let (l, _) = shared
                            .periodic_cv
                            .wait_timeout(list, due.saturating_duration_since(now))
                            .unwrap();
                        list = l;
                    }
                    Some(_) => {
                        let mut fired = Vec::new();
                        for p in list.iter_mut().filter(|p| p.active) {
                            if p.next_due > now {
                                continue;
                            }
                            fired.push(p.event.clone());
                            p.next_due += p.interval;
                            if p.next_due < now {
                                // More than one interval behind: resync
                                // instead of replaying the backlog.
                                p.next_due = now + p.interval;
                            }
                            if p.remaining > 0 {
                                p.remaining -= 1;
                                if p.remaining == 0 {
                                    p.active = false;
                                }
                            }
                        }
                        list.retain(|p| p.active);
                        break fired;
                    }
                }
            }
        };
        for event in fired {
            shared.stats.total_events.fetch_add(1, Ordering::Relaxed);
            if shared.config.use_async_dispatch {
                if let Err(e) = enqueue(shared, event, Instant::now()) {
                    log::warn!("Dropping periodic event: {e}");
                }
            } else {
                dispatch_event(shared, &event);
            }
        }
    }
}
