use super::error::{Error, Result};
use super::sync::{lock, read, write};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error};

/// Handle returned by [`StateCell::subscribe`], used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Callback invoked with `(old, new)` on every state change.
pub type StateCallback<S> = Arc<dyn Fn(S, S) + Send + Sync>;

/// Receives the panic payload of a subscriber that panicked during delivery.
pub type PanicHandler = Arc<dyn Fn(SubscriptionId, &(dyn Any + Send)) + Send + Sync>;

/// An observable state value.
///
/// Assigning a value different from the current one queues the `(old, new)`
/// transition and delivers it to every subscriber before the assignment
/// returns. Assigning the current value is a no-op.
///
/// Transitions reach subscribers in assignment order. Only one thread
/// delivers at a time: if another thread is already delivering for this
/// cell, it also delivers the new transition and the assigning thread
/// returns at once. An assignment made by a subscriber is delivered after
/// the current round.
///
/// No lock is held while subscribers run, so a subscriber may subscribe,
/// unsubscribe, read the state or assign to it.
pub struct StateCell<S> {
    name: &'static str,
    slot: Mutex<Slot<S>>,
    subscribers: Mutex<Vec<(SubscriptionId, StateCallback<S>)>>,
    next_id: AtomicU64,
    panic_handler: RwLock<PanicHandler>,
}

struct Slot<S> {
    value: S,
    /// Assigned but not yet delivered, oldest first
    pending: VecDeque<(S, S)>,
    delivering: bool,
}

impl<S> StateCell<S>
where
    S: Copy + PartialEq + fmt::Display + Send + 'static,
{
    /// Create a cell; `name` only labels log records.
    pub fn new(name: &'static str, initial: S) -> Self {
        Self {
            name,
            slot: Mutex::new(Slot {
                value: initial,
                pending: VecDeque::new(),
                delivering: false,
            }),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            panic_handler: RwLock::new(Arc::new(move |id: SubscriptionId, payload: &(dyn Any + Send)| {
                error!(
                    machine = name,
                    subscription = %id,
                    "state subscriber panicked: {}",
                    panic_message(payload)
                );
            })),
        }
    }

    /// The last successfully assigned value.
    pub fn get(&self) -> S {
        lock(&self.slot).value
    }

    /// Assign `new`. Returns `false` (and notifies nobody) if the value is unchanged.
    pub fn set(&self, new: S) -> bool {
        let changed = self.set_deferred(new);
        self.flush();
        changed
    }

    /// Assign `new` without notifying; the transition is delivered by the
    /// next [`flush`](Self::flush) or assignment.
    pub fn set_deferred(&self, new: S) -> bool {
        let mut slot = lock(&self.slot);
        if slot.value == new {
            return false;
        }
        let old = std::mem::replace(&mut slot.value, new);
        slot.pending.push_back((old, new));
        true
    }

    /// Assign `new` only if the current value is `expected`.
    pub fn compare_and_set(&self, expected: S, new: S) -> bool {
        {
            let mut slot = lock(&self.slot);
            if slot.value != expected {
                return false;
            }
            if expected == new {
                return true;
            }
            slot.value = new;
            slot.pending.push_back((expected, new));
        }
        self.flush();
        true
    }

    /// Deliver queued transitions, unless another thread already is.
    pub fn flush(&self) {
        {
            let mut slot = lock(&self.slot);
            if slot.delivering || slot.pending.is_empty() {
                return;
            }
            slot.delivering = true;
        }

        loop {
            let (old, new) = {
                let mut slot = lock(&self.slot);
                match slot.pending.pop_front() {
                    Some(transition) => transition,
                    None => {
                        slot.delivering = false;
                        return;
                    }
                }
            };
            self.notify(old, new);
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(S, S) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.subscribers).push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let mut subscribers = lock(&self.subscribers);
        match subscribers.iter().position(|(sub, _)| *sub == id) {
            Some(pos) => {
                subscribers.remove(pos);
                Ok(())
            }
            None => Err(Error::NotSubscribed(id)),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Replace the hook that handles subscriber panics.
    pub fn set_panic_handler<F>(&self, handler: F)
    where
        F: Fn(SubscriptionId, &(dyn Any + Send)) + Send + Sync + 'static,
    {
        *write(&self.panic_handler) = Arc::new(handler);
    }

    fn notify(&self, old: S, new: S) {
        debug!(machine = self.name, from = %old, to = %new, "state changed");

        let snapshot: Vec<(SubscriptionId, StateCallback<S>)> = lock(&self.subscribers).clone();
        for (id, callback) in snapshot {
            // Skip subscribers removed by an earlier callback in this round.
            if !lock(&self.subscribers).iter().any(|(sub, _)| *sub == id) {
                continue;
            }
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(old, new))) {
                let handler = Arc::clone(&*read(&self.panic_handler));
                if catch_unwind(AssertUnwindSafe(|| handler(id, payload.as_ref()))).is_err() {
                    error!(machine = self.name, subscription = %id, "panic handler panicked");
                }
            }
        }
    }
}

impl<S: fmt::Debug> fmt::Debug for StateCell<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCell")
            .field("name", &self.name)
            .field("state", &lock(&self.slot).value)
            .finish_non_exhaustive()
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
