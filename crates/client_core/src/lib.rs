//! Client-side realtime inbox: a resilient request layer, one supervised push
//! channel, and a synchronizer that keeps messages, notifications and folder
//! counters consistent across optimistic intents and server pushes.

use async_trait::async_trait;
use shared::{
    domain::{Folder, Message, MessageId, MessagePatch, NotificationId, Stats},
    protocol::{NewMessage, Page},
};
use tokio::sync::broadcast;

pub mod api;
pub mod backoff;
pub mod cache;
pub mod config;
pub mod error;
pub mod realtime;
pub mod request;
pub mod sync;
pub mod warm_cache;

pub use config::SyncConfig;
pub use error::{ActionError, RequestError, SyncError};
pub use realtime::ConnectionState;
pub use sync::{ClientEvent, InboxHandle, InboxSnapshot, InboxSync, Session};
pub use warm_cache::SqliteCacheMirror;

/// What a front end needs from an inbox session. [`InboxHandle`] is the
/// production implementation; front ends hold it as `Arc<dyn InboxClient>`.
#[async_trait]
pub trait InboxClient: Send + Sync {
    async fn load_folder(&self, folder: Folder, page: u32) -> Result<Page<Message>, ActionError>;
    async fn refresh_stats(&self) -> Result<Stats, ActionError>;
    async fn send_message(&self, draft: NewMessage) -> Result<(), ActionError>;
    async fn update_message(&self, id: MessageId, patch: MessagePatch) -> Result<(), ActionError>;
    async fn bulk_update(
        &self,
        ids: Vec<MessageId>,
        patch: MessagePatch,
    ) -> Result<(), ActionError>;
    async fn delete_message(&self, id: MessageId) -> Result<(), ActionError>;
    async fn mark_notification_read(&self, id: NotificationId) -> Result<(), ActionError>;
    async fn snapshot(&self) -> Result<InboxSnapshot, ActionError>;
    async fn shutdown(&self);
    fn connection_state(&self) -> ConnectionState;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

#[async_trait]
impl InboxClient for InboxHandle {
    async fn load_folder(&self, folder: Folder, page: u32) -> Result<Page<Message>, ActionError> {
        InboxHandle::load_folder(self, folder, page).await
    }

    async fn refresh_stats(&self) -> Result<Stats, ActionError> {
        InboxHandle::refresh_stats(self).await
    }

    async fn send_message(&self, draft: NewMessage) -> Result<(), ActionError> {
        InboxHandle::send_message(self, draft).await
    }

    async fn update_message(&self, id: MessageId, patch: MessagePatch) -> Result<(), ActionError> {
        InboxHandle::update(self, id, patch).await
    }

    async fn bulk_update(
        &self,
        ids: Vec<MessageId>,
        patch: MessagePatch,
    ) -> Result<(), ActionError> {
        InboxHandle::bulk_update(self, ids, patch).await
    }

    async fn delete_message(&self, id: MessageId) -> Result<(), ActionError> {
        InboxHandle::delete_message(self, id).await
    }

    async fn mark_notification_read(&self, id: NotificationId) -> Result<(), ActionError> {
        InboxHandle::mark_notification_read(self, id).await
    }

    async fn snapshot(&self) -> Result<InboxSnapshot, ActionError> {
        InboxHandle::snapshot(self).await
    }

    async fn shutdown(&self) {
        InboxHandle::shutdown(self).await
    }

    fn connection_state(&self) -> ConnectionState {
        InboxHandle::connection_state(self)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
