//! Queueing event channel between native producers and the embedded runtime
//!
//! Producers on arbitrary native callback threads call [`QueueingChannel::send`].
//! The embedded runtime attaches a single [`EventConsumer`]; envelopes sent
//! while no consumer is attached are either buffered (and flushed in order on
//! the next attach) or dropped, depending on the [`DeliveryMode`].

use std::{
    cell::RefCell,
    collections::VecDeque,
    num::NonZeroUsize,
    panic::{self, AssertUnwindSafe},
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use crossbeam_channel::{Receiver, Sender, TryIter, unbounded};
use log::{debug, error, warn};

use crate::envelope::EventEnvelope;

/// Receiving end of a bridge stream
///
/// A consumer may send back into the stream it is attached to, or detach
/// from it, while handling an envelope. Such sends are delivered right after
/// the current batch, and such detaches take effect once it completes.
/// Attaching a new consumer from inside `deliver` is not supported.
pub trait EventConsumer: Send + Sync {
    /// Hand one envelope to the consumer
    fn deliver(&self, envelope: EventEnvelope);
}

impl<F> EventConsumer for F
where
    F: Fn(EventEnvelope) + Send + Sync,
{
    fn deliver(&self, envelope: EventEnvelope) {
        self(envelope)
    }
}

/// What to do with an envelope when no consumer is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Buffer the envelope and flush it on the next attach
    #[default]
    QueueIfNotReady,
    /// Discard the envelope; it is a live signal with no value later
    DropIfNotReady,
}

impl DeliveryMode {
    /// Maps the host's `queueIfNotReady` flag onto a mode
    pub fn from_queue_flag(queue_if_not_ready: bool) -> Self {
        if queue_if_not_ready {
            Self::QueueIfNotReady
        } else {
            Self::DropIfNotReady
        }
    }
}

/// Result of a single [`QueueingChannel::send_with`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the attached consumer
    Delivered,
    /// Buffered until a consumer attaches, or until the consumer that sent
    /// it from inside a delivery returns
    Queued,
    /// Discarded because no consumer was attached
    Dropped,
}

/// Identifies one attach call, so a stale owner cannot detach its successor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentId(pub(crate) u64);

impl AttachmentId {
    /// Returned when an attach is refused because it came from inside a
    /// delivery; never names a consumer
    pub(crate) const REFUSED: Self = Self(0);
}

thread_local! {
    // Streams currently delivering on this thread, by address
    static DELIVERING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks a gate as delivering on the current thread until dropped
struct DeliveryScope {
    key: usize,
}

impl DeliveryScope {
    fn enter(key: usize) -> Self {
        DELIVERING.with_borrow_mut(|keys| keys.push(key));
        Self { key }
    }
}

impl Drop for DeliveryScope {
    fn drop(&mut self) {
        DELIVERING.with_borrow_mut(|keys| {
            if let Some(pos) = keys.iter().rposition(|key| *key == self.key) {
                keys.remove(pos);
            }
        });
    }
}

/// Calls made by a consumer into the stream it is being delivered from
#[derive(Default)]
pub(crate) struct Reentry {
    delivering: Option<AttachmentId>,
    /// Sends to deliver once the current batch is done
    pub(crate) sends: VecDeque<EventEnvelope>,
    /// Queueing sends made after the consumer asked to detach
    requeue: VecDeque<EventEnvelope>,
    pub(crate) detach: bool,
    close: bool,
}

impl Reentry {
    pub(crate) fn detaching(&self) -> bool {
        self.detach || self.close
    }

    pub(crate) fn is_delivering(&self, id: AttachmentId) -> bool {
        self.delivering == Some(id)
    }
}

/// Re-entry bookkeeping shared by the channel and the single-slot sink
#[derive(Default)]
pub(crate) struct ReentryGate {
    state: Mutex<Reentry>,
}

impl ReentryGate {
    fn key(&self) -> usize {
        self as *const Self as usize
    }

    /// Whether the current thread is inside a delivery guarded by this gate
    pub(crate) fn is_active(&self) -> bool {
        let key = self.key();
        DELIVERING.with_borrow(|keys| keys.contains(&key))
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Reentry> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers `batch`, then whatever the consumer sent back meanwhile,
    /// and returns what else it asked for
    ///
    /// Once the consumer asks to detach, nothing more reaches it; whatever
    /// was left undelivered ends up in `requeue`, oldest first.
    pub(crate) fn deliver(
        &self,
        consumer: &dyn EventConsumer,
        mut batch: VecDeque<EventEnvelope>,
        id: AttachmentId,
    ) -> Reentry {
        let _scope = DeliveryScope::enter(self.key());
        self.lock().delivering = Some(id);
        loop {
            while let Some(envelope) = batch.pop_front() {
                deliver_guarded(consumer, envelope);
                if self.lock().detaching() {
                    break;
                }
            }
            let mut reentry = self.lock();
            if reentry.detaching() {
                batch.append(&mut reentry.sends);
                batch.append(&mut reentry.requeue);
                reentry.requeue = batch;
                return std::mem::take(&mut *reentry);
            }
            if reentry.sends.is_empty() {
                return std::mem::take(&mut *reentry);
            }
            debug!(
                "Delivering {} events sent from inside a delivery",
                reentry.sends.len()
            );
            batch = std::mem::take(&mut reentry.sends);
        }
    }
}

struct ChannelState {
    pending: VecDeque<EventEnvelope>,
    consumer: Option<Box<dyn EventConsumer>>,
    generation: u64,
    capacity: Option<NonZeroUsize>,
    closed: bool,
}

/// Buffering single-consumer channel
///
/// Invariant: while a consumer is attached the backlog is empty. All
/// operations run inside one exclusive critical section.
pub struct QueueingChannel {
    state: Mutex<ChannelState>,
    reentry: ReentryGate,
    evicted: AtomicU64,
}

impl Default for QueueingChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueingChannel {
    /// Creates a detached channel with an unbounded backlog
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a detached channel whose backlog holds at most `capacity`
    /// envelopes, evicting the oldest one when full
    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self::build(Some(capacity))
    }

    fn build(capacity: Option<NonZeroUsize>) -> Self {
        Self {
            state: Mutex::new(ChannelState {
                pending: VecDeque::new(),
                consumer: None,
                generation: 0,
                capacity,
                closed: false,
            }),
            reentry: ReentryGate::default(),
            evicted: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches `consumer`, flushing the backlog to it in FIFO order
    ///
    /// Attaching while another consumer is attached replaces it. A closed
    /// channel ignores the consumer and returns an id that is never current.
    pub fn attach(&self, consumer: impl EventConsumer + 'static) -> AttachmentId {
        if self.reentry.is_active() {
            error!("Cannot attach an event consumer from inside a delivery");
            return AttachmentId::REFUSED;
        }

        let mut state = self.lock();
        state.generation += 1;
        let id = AttachmentId(state.generation);
        if state.closed {
            warn!("Event channel is closed, ignoring new consumer");
            return id;
        }
        if state.consumer.take().is_some() {
            debug!("Replacing attached event consumer");
        }

        let consumer: Box<dyn EventConsumer> = Box::new(consumer);
        let backlog = std::mem::take(&mut state.pending);
        if !backlog.is_empty() {
            debug!("Flushing {} queued events to new consumer", backlog.len());
        }
        let reentry = self.reentry.deliver(consumer.as_ref(), backlog, id);
        self.settle(&mut state, consumer, reentry);
        id
    }

    /// Detaches the current consumer and discards any backlog. Idempotent.
    pub fn detach(&self) {
        if self.reentry.is_active() {
            self.reentry.lock().detach = true;
            return;
        }
        let mut state = self.lock();
        Self::reset(&mut state);
    }

    /// Detaches only if `id` still names the attached consumer
    ///
    /// Returns `false` when another consumer has since replaced it.
    pub fn detach_if_current(&self, id: AttachmentId) -> bool {
        if self.reentry.is_active() {
            let mut reentry = self.reentry.lock();
            if !reentry.is_delivering(id) || reentry.detaching() {
                return false;
            }
            reentry.detach = true;
            return true;
        }
        let mut state = self.lock();
        if state.consumer.is_none() || state.generation != id.0 {
            return false;
        }
        Self::reset(&mut state);
        true
    }

    /// Detaches, discards the backlog and drops every later send
    ///
    /// Returns `true` if this call closed the channel.
    pub fn close(&self) -> bool {
        if self.reentry.is_active() {
            let mut reentry = self.reentry.lock();
            return !std::mem::replace(&mut reentry.close, true);
        }
        let mut state = self.lock();
        Self::reset(&mut state);
        !std::mem::replace(&mut state.closed, true)
    }

    /// Whether [`QueueingChannel::close`] has run
    pub fn is_closed(&self) -> bool {
        if self.reentry.is_active() {
            return self.reentry.lock().close;
        }
        self.lock().closed
    }

    fn reset(state: &mut ChannelState) {
        if state.consumer.take().is_some() {
            debug!("Event consumer detached");
        }
        if !state.pending.is_empty() {
            debug!("Discarding {} queued events on detach", state.pending.len());
            state.pending.clear();
        }
    }

    /// Puts `consumer` back after a delivery, unless it detached meanwhile
    fn settle(&self, state: &mut ChannelState, consumer: Box<dyn EventConsumer>, reentry: Reentry) {
        if reentry.close {
            state.closed = true;
        }
        if !reentry.detaching() {
            state.consumer = Some(consumer);
            return;
        }
        debug!("Event consumer detached during delivery");
        for envelope in reentry.requeue {
            self.enqueue(state, envelope);
        }
    }

    /// Sends with [`DeliveryMode::QueueIfNotReady`]
    pub fn send(&self, envelope: EventEnvelope) -> SendOutcome {
        self.send_with(envelope, DeliveryMode::QueueIfNotReady)
    }

    /// Delivers immediately if attached, otherwise queues or drops per `mode`
    ///
    /// A consumer sending into its own channel gets [`SendOutcome::Queued`];
    /// the envelope follows as soon as the current delivery returns.
    pub fn send_with(&self, envelope: EventEnvelope, mode: DeliveryMode) -> SendOutcome {
        if self.reentry.is_active() {
            return self.send_reentrant(envelope, mode);
        }

        let mut state = self.lock();
        if let Some(consumer) = state.consumer.take() {
            let id = AttachmentId(state.generation);
            let reentry = self
                .reentry
                .deliver(consumer.as_ref(), VecDeque::from([envelope]), id);
            self.settle(&mut state, consumer, reentry);
            return SendOutcome::Delivered;
        }

        match mode {
            DeliveryMode::DropIfNotReady => {
                debug!("Dropping `{}`, no consumer attached", envelope.event_type());
                SendOutcome::Dropped
            }
            DeliveryMode::QueueIfNotReady => self.enqueue(&mut state, envelope),
        }
    }

    fn send_reentrant(&self, envelope: EventEnvelope, mode: DeliveryMode) -> SendOutcome {
        let mut reentry = self.reentry.lock();
        if !reentry.detaching() {
            debug!(
                "Deferring `{}` sent from inside a delivery",
                envelope.event_type()
            );
            reentry.sends.push_back(envelope);
            return SendOutcome::Queued;
        }
        if reentry.close || mode == DeliveryMode::DropIfNotReady {
            debug!("Dropping `{}`, consumer is detaching", envelope.event_type());
            return SendOutcome::Dropped;
        }
        reentry.requeue.push_back(envelope);
        SendOutcome::Queued
    }

    fn enqueue(&self, state: &mut ChannelState, envelope: EventEnvelope) -> SendOutcome {
        if state.closed {
            debug!("Event channel closed, dropping `{}`", envelope.event_type());
            return SendOutcome::Dropped;
        }
        if let Some(capacity) = state.capacity {
            if state.pending.len() >= capacity.get() {
                if let Some(oldest) = state.pending.pop_front() {
                    self.evicted.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Event backlog full ({}), evicted oldest `{}`",
                        capacity,
                        oldest.event_type()
                    );
                }
            }
        }
        state.pending.push_back(envelope);
        SendOutcome::Queued
    }

    /// Whether a consumer is currently attached
    pub fn is_attached(&self) -> bool {
        if self.reentry.is_active() {
            return !self.reentry.lock().detaching();
        }
        self.lock().consumer.is_some()
    }

    /// Number of envelopes waiting for a consumer
    pub fn pending_len(&self) -> usize {
        if self.reentry.is_active() {
            return self.reentry.lock().requeue.len();
        }
        self.lock().pending.len()
    }

    /// Number of envelopes evicted from a bounded backlog so far
    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

/// Delivers one envelope, containing any panic raised by the consumer
fn deliver_guarded(consumer: &dyn EventConsumer, envelope: EventEnvelope) {
    let event_type = envelope.event_type().to_owned();
    if panic::catch_unwind(AssertUnwindSafe(|| consumer.deliver(envelope))).is_err() {
        error!("Event consumer panicked while handling `{}`", event_type);
    }
}

/// [`EventConsumer`] that forwards envelopes into a crossbeam channel
#[derive(Clone)]
pub struct StreamConsumer {
    sender: Sender<EventEnvelope>,
}

impl EventConsumer for StreamConsumer {
    fn deliver(&self, envelope: EventEnvelope) {
        if let Err(err) = self.sender.send(envelope) {
            debug!(
                "Event stream receiver is gone, dropping `{}`",
                err.0.event_type()
            );
        }
    }
}

/// Receiving half of a [`StreamConsumer`], polled from the runtime's own loop
#[derive(Clone)]
pub struct EventStream {
    receiver: Receiver<EventEnvelope>,
}

impl EventStream {
    /// Receive the next delivered envelope (non-blocking)
    pub fn receive(&self) -> Option<EventEnvelope> {
        self.receiver.try_recv().ok()
    }

    /// Iterate over every envelope delivered so far (non-blocking)
    pub fn drain(&self) -> TryIter<'_, EventEnvelope> {
        self.receiver.try_iter()
    }
}

/// Creates a connected consumer/stream pair
pub fn event_stream() -> (StreamConsumer, EventStream) {
    let (sender, receiver) = unbounded();
    (StreamConsumer { sender }, EventStream { receiver })
}
