//! The resumable full-resync procedure.
//!
//! Labels are pushed first, then messages page by page. Progress is
//! persisted after every step, so an interrupted resync picks up after the
//! last page it completed.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::queue::MailboxUpdate;
use super::router::UpdateRouter;
use super::sync::{SyncCancel, SyncJob};
use crate::Result;
use crate::account::{AddressDirectory, UserId};
use crate::remote::RemoteClient;
use crate::vault::Vault;

/// Resync of one account, driven by its `SyncController`.
pub(super) struct Resync {
    user_id: UserId,
    vault: Arc<dyn Vault>,
    remote: Arc<dyn RemoteClient>,
    addresses: Arc<AddressDirectory>,
    router: Arc<UpdateRouter>,
    page_size: usize,
}

impl Resync {
    pub(super) fn new(
        user_id: UserId,
        vault: Arc<dyn Vault>,
        remote: Arc<dyn RemoteClient>,
        addresses: Arc<AddressDirectory>,
        router: Arc<UpdateRouter>,
        page_size: usize,
    ) -> Self {
        Self {
            user_id,
            vault,
            remote,
            addresses,
            router,
            page_size: page_size.max(1),
        }
    }
}

#[async_trait]
impl SyncJob for Resync {
    fn is_complete(&self) -> bool {
        self.vault.sync_checkpoint().is_complete()
    }

    async fn run(&self, cancel: &SyncCancel) -> Result<()> {
        let mut checkpoint = self.vault.sync_checkpoint();

        if !checkpoint.has_labels {
            cancel.check()?;
            let labels = self.remote.fetch_labels().await?;
            cancel.check()?;

            let sinks = self.router.distinct();
            for label in &labels {
                for sink in &sinks {
                    sink.enqueue(MailboxUpdate::MailboxCreated(label.clone()));
                }
            }

            checkpoint.has_labels = true;
            self.vault.set_sync_checkpoint(&checkpoint).await?;
            debug!(user_id = %self.user_id, count = labels.len(), "Synced labels");
        }

        while !checkpoint.has_messages {
            cancel.check()?;
            let page = self
                .remote
                .fetch_messages(checkpoint.last_message_id.as_ref(), self.page_size)
                .await?;
            cancel.check()?;

            let fetched = page.len();
            if let Some(last) = page.last() {
                checkpoint.last_message_id = Some(last.id.clone());
            }

            for message in page {
                match self.router.get(&message.address_id) {
                    Some(sink) => {
                        sink.enqueue(MailboxUpdate::MessageCreated(message));
                    }
                    None => warn!(
                        user_id = %self.user_id,
                        message_id = %message.id,
                        address_id = %message.address_id,
                        known = self.addresses.contains(&message.address_id),
                        "Skipping message of unrouted address"
                    ),
                }
            }

            checkpoint.has_messages = fetched < self.page_size;
            self.vault.set_sync_checkpoint(&checkpoint).await?;
            debug!(user_id = %self.user_id, count = fetched, "Synced message page");
        }

        Ok(())
    }
}
