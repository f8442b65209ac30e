//! Single-slot sink for signals where only the live consumer matters

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use log::{debug, error};

use crate::{
    channel::{AttachmentId, EventConsumer, ReentryGate, SendOutcome},
    envelope::EventEnvelope,
};

#[derive(Default)]
struct Slot {
    consumer: Option<Box<dyn EventConsumer>>,
    generation: u64,
}

/// Holds at most one consumer and never buffers
///
/// Used for "recompute" signals such as inbox updates: a consumer that
/// attaches late re-queries instead of replaying stale signals.
#[derive(Default)]
pub struct SingleSlotSink {
    slot: Mutex<Slot>,
    reentry: ReentryGate,
}

impl SingleSlotSink {
    /// Creates an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs `consumer`, or clears the slot with `None`
    pub fn set_consumer(&self, consumer: Option<Box<dyn EventConsumer>>) {
        match consumer {
            Some(consumer) => {
                self.install(consumer);
            }
            None => self.detach(),
        }
    }

    /// Installs `consumer`, replacing any previous one
    pub fn attach(&self, consumer: impl EventConsumer + 'static) -> AttachmentId {
        self.install(Box::new(consumer))
    }

    fn install(&self, consumer: Box<dyn EventConsumer>) -> AttachmentId {
        if self.reentry.is_active() {
            error!("Cannot attach an in-app consumer from inside a delivery");
            return AttachmentId::REFUSED;
        }
        let mut slot = self.lock();
        slot.generation += 1;
        slot.consumer = Some(consumer);
        AttachmentId(slot.generation)
    }

    /// Clears the slot
    pub fn detach(&self) {
        if self.reentry.is_active() {
            self.reentry.lock().detach = true;
            return;
        }
        if self.lock().consumer.take().is_some() {
            debug!("In-app consumer detached");
        }
    }

    /// Clears the slot only if `id` still names the installed consumer
    pub fn detach_if_current(&self, id: AttachmentId) -> bool {
        if self.reentry.is_active() {
            let mut reentry = self.reentry.lock();
            if !reentry.is_delivering(id) || reentry.detaching() {
                return false;
            }
            reentry.detach = true;
            return true;
        }
        let mut slot = self.lock();
        if slot.consumer.is_none() || slot.generation != id.0 {
            return false;
        }
        slot.consumer = None;
        debug!("In-app consumer detached");
        true
    }

    /// Whether a consumer is set
    pub fn is_attached(&self) -> bool {
        if self.reentry.is_active() {
            return !self.reentry.lock().detaching();
        }
        self.lock().consumer.is_some()
    }

    /// Delivers to the current consumer, or drops silently
    ///
    /// A consumer sending into this sink from inside a delivery gets
    /// [`SendOutcome::Queued`]; the envelope follows once it returns.
    pub fn send(&self, envelope: EventEnvelope) -> SendOutcome {
        if self.reentry.is_active() {
            let mut reentry = self.reentry.lock();
            if reentry.detaching() {
                debug!("In-app consumer is detaching, dropping `{}`", envelope.event_type());
                return SendOutcome::Dropped;
            }
            reentry.sends.push_back(envelope);
            return SendOutcome::Queued;
        }

        let mut slot = self.lock();
        let Some(consumer) = slot.consumer.take() else {
            debug!("No in-app consumer, dropping `{}`", envelope.event_type());
            return SendOutcome::Dropped;
        };
        let id = AttachmentId(slot.generation);
        let reentry = self
            .reentry
            .deliver(consumer.as_ref(), VecDeque::from([envelope]), id);
        if reentry.detaching() {
            debug!("In-app consumer detached during delivery");
        } else {
            slot.consumer = Some(consumer);
        }
        SendOutcome::Delivered
    }
}
