//! Unbounded queues with an explicit, idempotent close.
//!
//! Used for the per-address mailbox update sinks and for the session's
//! outbound lifecycle-event queue. The receiving half is handed out once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::remote::{Label, LabelId, MessageId, MessageMeta};

/// Queue that drops items once closed.
#[derive(Debug)]
pub struct Queue<T> {
    tx: Mutex<Option<UnboundedSender<T>>>,
    rx: Mutex<Option<UnboundedReceiver<T>>>,
    closed: AtomicBool,
}

impl<T> Queue<T> {
    /// Create an open queue.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        }
    }

    /// Push an item. Returns false if the queue is closed.
    pub fn enqueue(&self, item: T) -> bool {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => {
                debug!("Dropping item enqueued on closed queue");
                false
            }
        }
    }

    /// Take the receiving half. Only the first caller gets it.
    pub fn take_receiver(&self) -> Option<UnboundedReceiver<T>> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Close the queue. Items already queued can still be drained.
    ///
    /// Returns true only for the call that actually closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        true
    }

    /// Whether the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Change to the locally exposed mailbox view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MailboxUpdate {
    /// Mailbox for a label should exist.
    MailboxCreated(Label),
    /// Mailbox was renamed.
    MailboxUpdated(Label),
    /// Mailbox was removed.
    MailboxDeleted(LabelId),
    /// Message should appear.
    MessageCreated(MessageMeta),
    /// Message labels or flags changed.
    MessageUpdated(MessageMeta),
    /// Message should disappear.
    MessageDeleted(MessageId),
}

/// Outbound sink of mailbox updates consumed by the protocol server.
pub type UpdateSink = Queue<MailboxUpdate>;
