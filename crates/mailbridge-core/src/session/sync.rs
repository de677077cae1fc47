//! Single-flight, cancellable resync orchestration.
//!
//! At most one resync runs per account. Late callers get
//! [`SyncOutcome::Skipped`] instead of queueing a second run. Aborting is a
//! single-slot signal: it reaches the running sync, or is dropped if none is
//! running.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use super::event::{EventQueue, SessionEvent};
use crate::account::UserId;
use crate::{Error, Result};

/// The resync procedure driven by a [`SyncController`].
#[async_trait]
pub trait SyncJob: Send + Sync {
    /// Whether the persisted checkpoint says the account is fully synced.
    fn is_complete(&self) -> bool;

    /// Run (or resume) the procedure. Must poll `cancel` at safe points.
    async fn run(&self, cancel: &SyncCancel) -> Result<()>;
}

/// Cooperative cancellation signal handed to a running sync.
#[derive(Debug, Clone)]
pub struct SyncCancel {
    rx: watch::Receiver<bool>,
}

impl SyncCancel {
    /// Whether an abort was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Fail with [`Error::SyncAborted`] if an abort was requested.
    ///
    /// # Errors
    ///
    /// Returns `SyncAborted` once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::SyncAborted)
        } else {
            Ok(())
        }
    }

    /// Resolve once an abort is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // A dropped sender means the run is over, which is as good as cancelled.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Result of a [`SyncController::start`] call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The checkpoint was already complete; nothing ran.
    AlreadyComplete,
    /// Another sync was running (or starts are locked); nothing ran.
    Skipped,
    /// This call ran the procedure to completion.
    Completed,
}

#[derive(Debug, Default)]
struct Slot {
    running: Option<watch::Sender<bool>>,
    locked: bool,
}

/// Orchestrates the resync procedure of one account.
pub struct SyncController {
    user_id: UserId,
    job: Arc<dyn SyncJob>,
    events: Arc<EventQueue>,
    slot: Mutex<Slot>,
    idle: Notify,
    lock_owner: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for SyncController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncController")
            .field("user_id", &self.user_id)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl SyncController {
    /// Create a controller emitting progress notifications to `events`.
    #[must_use]
    pub fn new(user_id: UserId, job: Arc<dyn SyncJob>, events: Arc<EventQueue>) -> Self {
        Self {
            user_id,
            job,
            events,
            slot: Mutex::new(Slot::default()),
            idle: Notify::new(),
            lock_owner: tokio::sync::Mutex::new(()),
        }
    }

    /// Run the resync procedure unless it is complete or already running.
    ///
    /// # Errors
    ///
    /// Returns the procedure's error (wrapped in [`Error::Shared`], the same
    /// value carried by the `SyncFailed` notification).
    pub async fn start(&self) -> Result<SyncOutcome> {
        if self.job.is_complete() {
            debug!(user_id = %self.user_id, "Already synced, skipping");
            return Ok(SyncOutcome::AlreadyComplete);
        }

        let Some(run) = self.try_acquire() else {
            debug!(user_id = %self.user_id, "Sync already in progress, skipping");
            return Ok(SyncOutcome::Skipped);
        };

        info!(user_id = %self.user_id, "Sync started");
        self.events.enqueue(SessionEvent::SyncStarted {
            user_id: self.user_id.clone(),
        });

        let result = self.job.run(&run.cancel).await;
        drop(run);

        match result {
            Ok(()) => {
                info!(user_id = %self.user_id, "Sync finished");
                self.events.enqueue(SessionEvent::SyncFinished {
                    user_id: self.user_id.clone(),
                });
                Ok(SyncOutcome::Completed)
            }
            Err(err) => {
                warn!(user_id = %self.user_id, error = %err, "Sync failed");
                let err = Arc::new(err);
                self.events.enqueue(SessionEvent::SyncFailed {
                    user_id: self.user_id.clone(),
                    error: Arc::clone(&err),
                });
                Err(Error::Shared(err))
            }
        }
    }

    /// Signal the running sync to stop. Dropped if nothing is running.
    pub fn abort(&self) {
        match self.slot().running.as_ref() {
            Some(tx) => {
                tx.send_replace(true);
                debug!(user_id = %self.user_id, "Sent sync abort signal");
            }
            None => debug!(user_id = %self.user_id, "No sync to abort"),
        }
    }

    /// Block new sync starts and wait for the running one to exit.
    ///
    /// Starts are allowed again when the returned guard is dropped.
    pub async fn lock(&self) -> SyncLock<'_> {
        let owner = self.lock_owner.lock().await;
        self.slot().locked = true;
        self.wait().await;
        SyncLock {
            controller: self,
            _owner: owner,
        }
    }

    /// Wait until no sync is running.
    pub async fn wait(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.slot().running.is_none() {
                return;
            }

            notified.await;
        }
    }

    /// Whether a sync is running right now.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.slot().running.is_some()
    }

    fn try_acquire(&self) -> Option<RunGuard<'_>> {
        let mut slot = self.slot();
        if slot.locked || slot.running.is_some() {
            return None;
        }

        let (tx, rx) = watch::channel(false);
        slot.running = Some(tx);
        Some(RunGuard {
            controller: self,
            cancel: SyncCancel { rx },
        })
    }

    fn release(&self) {
        self.slot().running = None;
        self.idle.notify_waiters();
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds the single-flight slot for the duration of a run.
struct RunGuard<'a> {
    controller: &'a SyncController,
    cancel: SyncCancel,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.controller.release();
    }
}

/// Keeps new sync starts blocked while held.
#[must_use = "dropping the lock allows syncs again immediately"]
pub struct SyncLock<'a> {
    controller: &'a SyncController,
    _owner: tokio::sync::MutexGuard<'a, ()>,
}

impl SyncLock<'_> {
    /// Allow sync starts again.
    pub fn unlock(self) {}
}

impl Drop for SyncLock<'_> {
    fn drop(&mut self) {
        self.controller.slot().locked = false;
    }
}
