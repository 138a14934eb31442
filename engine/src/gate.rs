//! Per-user turn serialization.
//!
//! Each user has a queue of numbered places. [`TurnGate::reserve`] hands out
//! the next place without awaiting, so callers fix arrival order before any
//! network call. A place is served once every earlier place has been left,
//! whether it was admitted or abandoned.

use std::collections::BTreeSet;
use std::pin::pin;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use tokio::sync::Notify;

use relay_types::UserId;

#[derive(Debug, Default)]
struct Queue {
    next: u64,
    serving: u64,
    /// Places left out of order, skipped once `serving` reaches them.
    left: BTreeSet<u64>,
}

#[derive(Debug, Default)]
struct Slot {
    queue: Mutex<Queue>,
    advanced: Notify,
}

impl Slot {
    fn queue(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type Slots = Arc<DashMap<UserId, Arc<Slot>>>;

/// At most one in-flight turn per user; different users never wait on each other.
///
/// Turns for one user are admitted in reservation order.
#[derive(Debug, Default)]
pub struct TurnGate {
    slots: Slots,
}

impl TurnGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the next place in `user_id`'s queue.
    pub fn reserve(&self, user_id: UserId) -> TurnTicket {
        let slot = Arc::clone(self.slots.entry(user_id).or_default().value());
        let number = {
            let mut queue = slot.queue();
            queue.next += 1;
            queue.next - 1
        };
        TurnTicket {
            place: Place {
                slots: Arc::clone(&self.slots),
                user_id,
                slot: Some(slot),
                number,
            },
        }
    }

    /// Waits until no other turn for `user_id` is running or queued ahead.
    pub async fn acquire(&self, user_id: UserId) -> TurnPermit {
        self.reserve(user_id).admit().await
    }

    /// Users with a running or queued turn.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// A reserved place in a user's queue. Dropping it gives the place up.
#[derive(Debug)]
pub struct TurnTicket {
    place: Place,
}

impl TurnTicket {
    /// Waits for every earlier place to be left.
    pub async fn admit(self) -> TurnPermit {
        let number = self.place.number;
        if let Some(slot) = &self.place.slot {
            loop {
                // Register before checking so a wakeup in between is not lost.
                let mut advanced = pin!(slot.advanced.notified());
                advanced.as_mut().enable();
                if slot.queue().serving == number {
                    break;
                }
                advanced.await;
            }
        }
        TurnPermit { _place: self.place }
    }
}

/// Held for the duration of a turn. Dropping it admits the next place.
#[derive(Debug)]
pub struct TurnPermit {
    _place: Place,
}

#[derive(Debug)]
struct Place {
    slots: Slots,
    user_id: UserId,
    slot: Option<Arc<Slot>>,
    number: u64,
}

impl Drop for Place {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        {
            let mut queue = slot.queue();
            if queue.serving == self.number {
                loop {
                    queue.serving += 1;
                    let serving = queue.serving;
                    if !queue.left.remove(&serving) {
                        break;
                    }
                }
            } else {
                queue.left.insert(self.number);
            }
        }
        slot.advanced.notify_waiters();
        drop(slot);
        // Only the map holds the slot once nobody is running or waiting.
        self.slots
            .remove_if(&self.user_id, |_, slot| Arc::strong_count(slot) == 1);
    }
}
