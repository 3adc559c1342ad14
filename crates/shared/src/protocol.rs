use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{
    Folder, Message, MessageId, MessagePatch, Notification, NotificationId, UserId,
};

/// Frame shape shared by both directions of the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Accepts RFC 3339 and naive ISO-8601 (read as UTC). Anything else is treated
/// as absent rather than failing the whole frame.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    Ok(raw.as_str().and_then(parse_timestamp))
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDeleted {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRead {
    pub notification_id: NotificationId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionEstablished {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

/// Closed set of push events the client understands. `pong` never reaches
/// this type: the channel consumes it for heartbeat bookkeeping.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    NewMessage(Message),
    MessageUpdated(Message),
    MessageDeleted(MessageDeleted),
    NewNotification(Notification),
    NotificationRead(NotificationRead),
    ConnectionEstablished(ConnectionEstablished),
    Error(ServerErrorPayload),
}

#[derive(Debug, Clone)]
pub enum InboundFrame {
    Pong { timestamp: Option<DateTime<Utc>> },
    Event {
        event: InboundEvent,
        timestamp: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unknown event type `{0}`")]
    UnknownType(String),
    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

fn payload<T: DeserializeOwned>(kind: &str, data: Value) -> Result<T, FrameError> {
    serde_json::from_value(data).map_err(|source| FrameError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(FrameError::Malformed)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, FrameError> {
        let Envelope {
            kind,
            data,
            timestamp,
        } = envelope;
        let event = match kind.as_str() {
            "pong" => return Ok(InboundFrame::Pong { timestamp }),
            "new_message" => InboundEvent::NewMessage(payload(&kind, data)?),
            "message_updated" => InboundEvent::MessageUpdated(payload(&kind, data)?),
            "message_deleted" => InboundEvent::MessageDeleted(payload(&kind, data)?),
            "new_notification" => InboundEvent::NewNotification(payload(&kind, data)?),
            "notification_read" => InboundEvent::NotificationRead(payload(&kind, data)?),
            "connection_established" => {
                let established = if data.is_null() {
                    ConnectionEstablished::default()
                } else {
                    payload(&kind, data)?
                };
                InboundEvent::ConnectionEstablished(established)
            }
            "error" => InboundEvent::Error(payload(&kind, data)?),
            _ => return Err(FrameError::UnknownType(kind)),
        };
        Ok(InboundFrame::Event { event, timestamp })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyPayload {
    pub user_id: UserId,
}

#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Ping { timestamp: DateTime<Utc> },
    Identify(IdentifyPayload),
}

impl OutboundFrame {
    pub fn to_envelope(&self) -> Envelope {
        match self {
            OutboundFrame::Ping { timestamp } => Envelope {
                kind: "ping".to_string(),
                data: Value::Null,
                timestamp: Some(*timestamp),
            },
            OutboundFrame::Identify(identify) => Envelope {
                kind: "identify".to_string(),
                data: serde_json::json!({ "user_id": identify.user_id }),
                timestamp: None,
            },
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_envelope())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListQuery {
    pub folder: Folder,
    pub page: u32,
    pub per_page: u32,
    pub unread_only: bool,
}

impl ListQuery {
    pub fn first_page(folder: Folder) -> Self {
        Self {
            folder,
            page: 1,
            per_page: 20,
            unread_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationQuery {
    pub page: u32,
    pub per_page: u32,
    pub unread_only: bool,
}

impl Default for NotificationQuery {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 20,
            unread_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
    pub pages: u32,
    pub has_next: bool,
    pub has_prev: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub recipient_id: UserId,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkUpdateRequest {
    pub ids: Vec<MessageId>,
    pub updates: MessagePatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkUpdateResponse {
    pub updated_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPatch {
    pub is_read: bool,
}
