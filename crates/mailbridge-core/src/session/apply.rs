//! Remote-event consumption and application to local state.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::UserSession;
use super::event::SessionEvent;
use super::queue::MailboxUpdate;
use crate::account::AddressId;
use crate::remote::{AddressEvent, EventStream, LabelEvent, MessageEvent, RemoteEvent};
use crate::{Error, Result};

impl UserSession {
    /// Consume the stream until stopped, the stream ends, or an event fails.
    ///
    /// Events are applied strictly in order. The cursor is persisted only
    /// after an event was fully applied.
    pub(super) async fn consume(&self, mut stream: EventStream, mut stop: watch::Receiver<bool>) {
        let inner = &self.inner;

        loop {
            let item = tokio::select! {
                biased;
                _ = stop.changed() => {
                    debug!(user_id = %inner.user_id, "Event loop stopped");
                    return;
                }
                item = stream.recv() => item,
            };

            let Some(item) = item else {
                debug!(user_id = %inner.user_id, "Event stream ended");
                return;
            };

            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    warn!(user_id = %inner.user_id, error = %e, "Event stream error");
                    inner.events.enqueue(SessionEvent::UncategorizedError {
                        user_id: inner.user_id.clone(),
                        error: Arc::new(e),
                    });
                    continue;
                }
            };

            let old_cursor = inner.vault.event_cursor();

            if let Err(e) = self.apply_event(&event).await {
                error!(
                    user_id = %inner.user_id,
                    cursor = %event.cursor,
                    error = %e,
                    "Failed to handle remote event"
                );
                let payload = serde_json::to_string(&event)
                    .unwrap_or_else(|se| format!("<unserializable event: {se}>"));
                inner.events.enqueue(SessionEvent::UnrecoverableEvent {
                    user_id: inner.user_id.clone(),
                    old_cursor,
                    new_cursor: event.cursor.clone(),
                    payload,
                    error: Arc::new(e),
                });
                return;
            }

            if let Err(e) = inner.vault.set_event_cursor(&event.cursor).await {
                error!(user_id = %inner.user_id, error = %e, "Failed to update event cursor");
                inner.events.enqueue(SessionEvent::UncategorizedError {
                    user_id: inner.user_id.clone(),
                    error: Arc::new(e),
                });
                return;
            }
        }
    }

    /// Apply one remote event to the local view.
    pub(super) async fn apply_event(&self, event: &RemoteEvent) -> Result<()> {
        if event.refresh {
            return self.refresh().await;
        }

        if let Some(user) = &event.user {
            if user.id != self.inner.user_id {
                return Err(Error::Remote(format!(
                    "user event for {} delivered to {}",
                    user.id, self.inner.user_id
                )));
            }
            self.replace_identity(user.clone());
        }

        for address_event in &event.addresses {
            self.apply_address_event(address_event)?;
        }

        for label_event in &event.labels {
            self.apply_label_event(label_event);
        }

        for message_event in &event.messages {
            self.apply_message_event(message_event)?;
        }

        Ok(())
    }

    /// Refetch everything after the remote side asked for a full refresh.
    async fn refresh(&self) -> Result<()> {
        let inner = &self.inner;
        info!(user_id = %inner.user_id, "Refreshing account");

        let identity = inner.remote.fetch_user().await?;
        let addrs = inner.remote.fetch_addresses().await?;

        inner.sync.abort();
        let lock = inner.sync.lock().await;

        self.replace_identity(identity);
        inner.addresses.replace(addrs);
        inner
            .router
            .rebuild(inner.vault.address_mode(), &inner.addresses.ids());
        inner.vault.clear_sync_checkpoint().await?;

        lock.unlock();

        inner.events.enqueue(SessionEvent::AccountRefreshed {
            user_id: inner.user_id.clone(),
        });
        self.spawn_sync("account refreshed");
        Ok(())
    }

    fn apply_address_event(&self, event: &AddressEvent) -> Result<()> {
        let inner = &self.inner;

        match event {
            AddressEvent::Created(addr) => {
                if !inner.addresses.insert(addr.clone()) {
                    debug!(
                        user_id = %inner.user_id,
                        address_id = %addr.id,
                        "Address already known"
                    );
                    return Ok(());
                }
                inner.router.add_address(inner.vault.address_mode(), &addr.id);
                inner.events.enqueue(SessionEvent::AddressCreated {
                    user_id: inner.user_id.clone(),
                    address_id: addr.id.clone(),
                    email: addr.email.clone(),
                });
            }

            AddressEvent::Updated(addr) => {
                inner.addresses.update(addr.clone())?;
                inner.events.enqueue(SessionEvent::AddressUpdated {
                    user_id: inner.user_id.clone(),
                    address_id: addr.id.clone(),
                    email: addr.email.clone(),
                });
            }

            AddressEvent::Deleted(id) => {
                let removed = inner.addresses.remove(id)?;
                inner.router.remove_address(id);
                inner.events.enqueue(SessionEvent::AddressDeleted {
                    user_id: inner.user_id.clone(),
                    address_id: id.clone(),
                    email: removed.email,
                });
            }
        }

        Ok(())
    }

    fn apply_label_event(&self, event: &LabelEvent) {
        let update = match event {
            LabelEvent::Created(label) => MailboxUpdate::MailboxCreated(label.clone()),
            LabelEvent::Updated(label) => MailboxUpdate::MailboxUpdated(label.clone()),
            LabelEvent::Deleted(id) => MailboxUpdate::MailboxDeleted(id.clone()),
        };
        self.broadcast(&update);
    }

    fn apply_message_event(&self, event: &MessageEvent) -> Result<()> {
        match event {
            MessageEvent::Created(meta) => {
                self.route(&meta.address_id, MailboxUpdate::MessageCreated(meta.clone()))
            }
            MessageEvent::Updated(meta) => {
                self.route(&meta.address_id, MailboxUpdate::MessageUpdated(meta.clone()))
            }
            MessageEvent::Deleted(id) => {
                self.broadcast(&MailboxUpdate::MessageDeleted(id.clone()));
                Ok(())
            }
        }
    }

    fn route(&self, address_id: &AddressId, update: MailboxUpdate) -> Result<()> {
        let sink = self
            .inner
            .router
            .get(address_id)
            .ok_or_else(|| Error::NotFound(format!("update sink for address {address_id}")))?;
        sink.enqueue(update);
        Ok(())
    }

    fn broadcast(&self, update: &MailboxUpdate) {
        for sink in self.inner.router.distinct() {
            sink.enqueue(update.clone());
        }
    }
}
