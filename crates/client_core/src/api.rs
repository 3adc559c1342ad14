//! Typed inbox endpoints on top of [`RequestLayer`].

use shared::{
    domain::{Message, MessageId, MessagePatch, Notification, NotificationId, Stats},
    protocol::{
        BulkUpdateRequest, BulkUpdateResponse, ListQuery, NewMessage, NotificationPatch,
        NotificationQuery, Page,
    },
};

use crate::{cache::CachePolicy, error::RequestError, request::RequestLayer};

pub const MESSAGES: &str = "messages";
pub const NOTIFICATIONS: &str = "notifications";

pub fn list_query_pairs(query: &ListQuery) -> Vec<(&'static str, String)> {
    vec![
        ("folder", query.folder.as_str().to_string()),
        ("page", query.page.to_string()),
        ("per_page", query.per_page.to_string()),
        ("unread_only", query.unread_only.to_string()),
    ]
}

pub fn notification_query_pairs(query: &NotificationQuery) -> Vec<(&'static str, String)> {
    vec![
        ("page", query.page.to_string()),
        ("per_page", query.per_page.to_string()),
        ("unread_only", query.unread_only.to_string()),
    ]
}

impl RequestLayer {
    pub async fn list_messages(&self, query: &ListQuery) -> Result<Page<Message>, RequestError> {
        let ttl = self.ttls().list();
        self.get(MESSAGES, &list_query_pairs(query), CachePolicy::Ttl(ttl))
            .await
    }

    pub async fn get_message(&self, id: MessageId) -> Result<Message, RequestError> {
        let ttl = self.ttls().message();
        self.get(&format!("{MESSAGES}/{}", id.0), &[], CachePolicy::Ttl(ttl))
            .await
    }

    pub async fn send_message(&self, draft: &NewMessage) -> Result<Message, RequestError> {
        self.create(MESSAGES, draft).await
    }

    pub async fn update_message(
        &self,
        id: MessageId,
        patch: &MessagePatch,
    ) -> Result<Message, RequestError> {
        self.update(&format!("{MESSAGES}/{}", id.0), patch).await
    }

    pub async fn delete_message(&self, id: MessageId) -> Result<(), RequestError> {
        self.delete(&format!("{MESSAGES}/{}", id.0)).await
    }

    pub async fn bulk_update(
        &self,
        request: &BulkUpdateRequest,
    ) -> Result<BulkUpdateResponse, RequestError> {
        self.create(&format!("{MESSAGES}/bulk"), request).await
    }

    pub async fn stats(&self, policy: CachePolicy) -> Result<Stats, RequestError> {
        self.get(&format!("{MESSAGES}/stats"), &[], policy).await
    }

    pub async fn list_notifications(
        &self,
        query: &NotificationQuery,
    ) -> Result<Page<Notification>, RequestError> {
        let ttl = self.ttls().notifications();
        self.get(
            NOTIFICATIONS,
            &notification_query_pairs(query),
            CachePolicy::Ttl(ttl),
        )
        .await
    }

    pub async fn mark_notification_read(
        &self,
        id: NotificationId,
    ) -> Result<Notification, RequestError> {
        self.update(
            &format!("{NOTIFICATIONS}/{}", id.0),
            &NotificationPatch { is_read: true },
        )
        .await
    }
}
