//! History change notifications.
//!
//! Each subscriber owns a one-slot channel. A mutation fills the slot if it
//! is empty; if a signal is already waiting, the new one folds into it. So a
//! burst of writes between two reads of a subscriber produces exactly one
//! wake-up, and a write after the subscriber drained its slot always
//! produces another. The signal carries no data: receivers re-run their
//! query.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

#[derive(Default)]
pub struct ChangeNotifier {
    subscribers: Mutex<Vec<(ListenerId, SyncSender<()>)>>,
    next_listener_id: AtomicUsize,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::sync_channel(1);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, tx));
        Subscription { id, rx }
    }

    /// Signal every live subscriber. Dropped subscriptions are pruned here.
    pub fn notify(&self) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|(id, tx)| match tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => {
                trace!(listener = id.0, "Change already pending, coalesced");
                true
            }
            Err(TrySendError::Disconnected(())) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Receiving end of the "history changed" signal. Dropping it unsubscribes.
pub struct Subscription {
    id: ListenerId,
    rx: Receiver<()>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Block until a change arrives. `false` once the notifier is gone.
    pub fn recv(&self) -> bool {
        self.rx.recv().is_ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    pub fn try_recv(&self) -> bool {
        self.rx.try_recv().is_ok()
    }
}
