//! Typed link-event dispatch.
//!
//! Drivers raise events into the registry, which validates them and feeds
//! the dispatcher's bounded ingest channel. A single dispatch thread fans
//! events out to per-subscriber queues, so events from one link are observed
//! in issue order by every subscriber, and no two deliveries to the same
//! subscriber overlap.
//!
//! Each subscriber queue is bounded. When it fills, the oldest *droppable*
//! event (QualityChanged, ParameterReport) is shed first; state-transition
//! and handover events are never dropped — the queue soft-exceeds its bound
//! rather than lose one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use magic_common::types::{truncate_message, LinkLifeState, LinkStats};
use magic_common::LinkId;
use tracing::{debug, warn};

/// Maximum bytes of human-readable text carried by an event.
pub const MAX_EVENT_MESSAGE_LEN: usize = 256;

/// Ingest channel capacity between the registry and the dispatch thread.
const INGEST_CAPACITY: usize = 1024;

/// Per-subscriber queue soft bound.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

// ── Event model ─────────────────────────────────────────────────────

/// Payload of a link event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEventPayload {
    LinkDetected,
    LinkUp,
    LinkGoingDown,
    LinkDown,
    QualityChanged { rssi_dbm: i32, quality: u8 },
    ParameterReport { fwd_usage_kbps: u32, rev_usage_kbps: u32, stats: LinkStats },
    HandoverRecommend { target: Option<LinkId> },
}

impl LinkEventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            LinkEventPayload::LinkDetected => EventKind::LinkDetected,
            LinkEventPayload::LinkUp => EventKind::LinkUp,
            LinkEventPayload::LinkGoingDown => EventKind::LinkGoingDown,
            LinkEventPayload::LinkDown => EventKind::LinkDown,
            LinkEventPayload::QualityChanged { .. } => EventKind::QualityChanged,
            LinkEventPayload::ParameterReport { .. } => EventKind::ParameterReport,
            LinkEventPayload::HandoverRecommend { .. } => EventKind::HandoverRecommend,
        }
    }

    /// Whether this event may be shed under queue pressure.
    pub fn droppable(&self) -> bool {
        matches!(
            self,
            LinkEventPayload::QualityChanged { .. } | LinkEventPayload::ParameterReport { .. }
        )
    }
}

/// A validated event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub link_id: LinkId,
    pub payload: LinkEventPayload,
    pub old_state: LinkLifeState,
    pub new_state: LinkLifeState,
    pub message: String,
}

impl LinkEvent {
    pub fn new(
        link_id: LinkId,
        payload: LinkEventPayload,
        old_state: LinkLifeState,
        new_state: LinkLifeState,
        message: &str,
    ) -> Self {
        LinkEvent {
            link_id,
            payload,
            old_state,
            new_state,
            message: truncate_message(message, MAX_EVENT_MESSAGE_LEN),
        }
    }
}

/// Event kinds, used for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EventKind {
    LinkUp = 1 << 0,
    LinkDown = 1 << 1,
    LinkGoingDown = 1 << 2,
    LinkDetected = 1 << 3,
    QualityChanged = 1 << 4,
    ParameterReport = 1 << 5,
    HandoverRecommend = 1 << 6,
}

/// Set of subscribed event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask(u16);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const ALL: EventMask = EventMask(0x7F);

    /// State transitions plus handover — the session manager's diet.
    pub const TRANSITIONS: EventMask = EventMask(
        EventKind::LinkUp as u16
            | EventKind::LinkDown as u16
            | EventKind::LinkGoingDown as u16
            | EventKind::LinkDetected as u16
            | EventKind::HandoverRecommend as u16,
    );

    pub fn of(kinds: &[EventKind]) -> EventMask {
        EventMask(kinds.iter().fold(0, |acc, k| acc | *k as u16))
    }

    pub fn contains(&self, kind: EventKind) -> bool {
        self.0 & kind as u16 != 0
    }
}

// ── Subscriber queues ───────────────────────────────────────────────

struct QueueState {
    events: VecDeque<LinkEvent>,
    closed: bool,
}

struct SubscriberQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    fn new() -> Arc<Self> {
        Arc::new(SubscriberQueue {
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
            dropped: AtomicU64::new(0),
        })
    }

    fn push(&self, event: LinkEvent) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return;
        }
        if state.events.len() >= SUBSCRIBER_QUEUE_CAPACITY {
            // Shed the oldest droppable event; critical events stay.
            if let Some(idx) = state.events.iter().position(|e| e.payload.droppable()) {
                state.events.remove(idx);
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if total == 1 || total % 1000 == 0 {
                    warn!(total, "subscriber queue full, shedding low-priority events");
                }
            } else if event.payload.droppable() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        state.events.push_back(event);
        drop(state);
        self.ready.notify_one();
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        drop(state);
        self.ready.notify_all();
    }
}

/// A subscription token. Dropping it detaches the subscriber.
pub struct Subscription {
    id: u64,
    mask: EventMask,
    queue: Arc<SubscriberQueue>,
    shared: Arc<DispatcherShared>,
}

impl Subscription {
    /// Blocking receive with timeout. `None` on timeout or after the
    /// dispatcher shut down and the queue drained.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<LinkEvent> {
        let mut state = self
            .queue
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(event) = state.events.pop_front() {
                return Some(event);
            }
            if state.closed {
                return None;
            }
            let (next, result) = self
                .queue
                .ready
                .wait_timeout(state, timeout)
                .unwrap_or_else(|e| e.into_inner());
            state = next;
            if result.timed_out() {
                return state.events.pop_front();
            }
        }
    }

    pub fn try_recv(&self) -> Option<LinkEvent> {
        self.queue
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .events
            .pop_front()
    }

    /// Events shed from this subscriber's queue so far.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn mask(&self) -> EventMask {
        self.mask
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close();
        let mut subs = self
            .shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subs.retain(|s| s.id != self.id);
    }
}

// ── Dispatcher ──────────────────────────────────────────────────────

struct SubscriberSlot {
    id: u64,
    mask: EventMask,
    queue: Arc<SubscriberQueue>,
}

struct DispatcherShared {
    subscribers: Mutex<Vec<SubscriberSlot>>,
    next_id: AtomicU64,
}

enum IngestMsg {
    Event(LinkEvent),
    Shutdown,
}

/// Handle used by the registry to raise validated events.
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<IngestMsg>,
}

impl EventSender {
    pub fn send(&self, event: LinkEvent) {
        // A full ingest queue means the dispatch thread died or a subscriber
        // storm; blocking the registry would invert priorities, so drop with
        // a warning instead.
        if self.tx.try_send(IngestMsg::Event(event)).is_err() {
            warn!("event ingest queue unavailable, dropping event");
        }
    }
}

/// Fan-out dispatcher owning the dispatch thread.
pub struct EventDispatcher {
    tx: Sender<IngestMsg>,
    shared: Arc<DispatcherShared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        let (tx, rx) = bounded(INGEST_CAPACITY);
        let shared = Arc::new(DispatcherShared {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        });
        let shared_clone = shared.clone();
        let handle = thread::Builder::new()
            .name("magic-events".into())
            .spawn(move || dispatch_loop(rx, shared_clone))
            .expect("failed to spawn event dispatch thread");

        EventDispatcher {
            tx,
            shared,
            handle: Some(handle),
        }
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    /// Attach a subscriber for the given event kinds.
    pub fn subscribe(&self, mask: EventMask) -> Subscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = SubscriberQueue::new();
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SubscriberSlot {
                id,
                mask,
                queue: queue.clone(),
            });
        Subscription {
            id,
            mask,
            queue,
            shared: self.shared.clone(),
        }
    }

    /// Stop the dispatch thread and close all subscriber queues. Idempotent.
    pub fn shutdown(&mut self) {
        let _ = self.tx.send(IngestMsg::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        for slot in self
            .shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            slot.queue.close();
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_loop(rx: Receiver<IngestMsg>, shared: Arc<DispatcherShared>) {
    loop {
        match rx.recv() {
            Ok(IngestMsg::Event(event)) => {
                let kind = event.payload.kind();
                debug!(link_id = %event.link_id, ?kind, "dispatching event");
                let subs = shared
                    .subscribers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                for slot in subs.iter() {
                    if slot.mask.contains(kind) {
                        slot.queue.push(event.clone());
                    }
                }
            }
            Ok(IngestMsg::Shutdown) | Err(_) => break,
        }
    }
}
