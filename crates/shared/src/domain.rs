use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);
id_newtype!(NotificationId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Folder {
    Inbox,
    Sent,
    Starred,
    Archived,
}

impl Folder {
    pub fn as_str(self) -> &'static str {
        match self {
            Folder::Inbox => "inbox",
            Folder::Sent => "sent",
            Folder::Starred => "starred",
            Folder::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: Participant,
    pub recipient: Participant,
    pub subject: String,
    pub body: String,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Where a message lives from one user's point of view. Archiving wins over
/// inbox/sent; starring is an overlay that does not move the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Inbox,
    Sent,
    Archived,
    Elsewhere,
}

impl Message {
    pub fn placement_for(&self, user_id: UserId) -> Placement {
        if self.is_archived {
            Placement::Archived
        } else if self.recipient.id == user_id {
            Placement::Inbox
        } else if self.sender.id == user_id {
            Placement::Sent
        } else {
            Placement::Elsewhere
        }
    }

    pub fn in_folder(&self, folder: Folder, user_id: UserId) -> bool {
        match folder {
            Folder::Starred => self.is_starred,
            Folder::Inbox => self.placement_for(user_id) == Placement::Inbox,
            Folder::Sent => self.placement_for(user_id) == Placement::Sent,
            Folder::Archived => self.placement_for(user_id) == Placement::Archived,
        }
    }

    pub fn apply_patch(&mut self, patch: &MessagePatch) {
        if let Some(is_read) = patch.is_read {
            self.is_read = is_read;
        }
        if let Some(is_starred) = patch.is_starred {
            self.is_starred = is_starred;
        }
        if let Some(is_archived) = patch.is_archived {
            self.is_archived = is_archived;
        }
    }

    pub fn patched(&self, patch: &MessagePatch) -> Self {
        let mut next = self.clone();
        next.apply_patch(patch);
        next
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_read: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_starred: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_archived: Option<bool>,
}

impl MessagePatch {
    pub fn read(is_read: bool) -> Self {
        Self {
            is_read: Some(is_read),
            ..Self::default()
        }
    }

    pub fn starred(is_starred: bool) -> Self {
        Self {
            is_starred: Some(is_starred),
            ..Self::default()
        }
    }

    pub fn archived(is_archived: bool) -> Self {
        Self {
            is_archived: Some(is_archived),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.is_read.is_none() && self.is_starred.is_none() && self.is_archived.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub inbox_count: u64,
    pub unread_count: u64,
    pub starred_count: u64,
    pub sent_count: u64,
    pub archived_count: u64,
}

/// Signed per-counter change. Every visible transition of a message is turned
/// into one of these so that counters move by ±1 instead of being recounted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsDelta {
    pub inbox: i64,
    pub unread: i64,
    pub starred: i64,
    pub sent: i64,
    pub archived: i64,
}

impl StatsDelta {
    pub fn contribution(message: Option<&Message>, user_id: UserId) -> Self {
        let Some(message) = message else {
            return Self::default();
        };
        let placement = message.placement_for(user_id);
        let inbox = placement == Placement::Inbox;
        Self {
            inbox: i64::from(inbox),
            unread: i64::from(inbox && !message.is_read),
            starred: i64::from(message.is_starred),
            sent: i64::from(placement == Placement::Sent),
            archived: i64::from(placement == Placement::Archived),
        }
    }

    pub fn between(before: Option<&Message>, after: Option<&Message>, user_id: UserId) -> Self {
        Self::contribution(after, user_id) - Self::contribution(before, user_id)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

impl std::ops::Add for StatsDelta {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            inbox: self.inbox + rhs.inbox,
            unread: self.unread + rhs.unread,
            starred: self.starred + rhs.starred,
            sent: self.sent + rhs.sent,
            archived: self.archived + rhs.archived,
        }
    }
}

impl std::ops::AddAssign for StatsDelta {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub for StatsDelta {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            inbox: self.inbox - rhs.inbox,
            unread: self.unread - rhs.unread,
            starred: self.starred - rhs.starred,
            sent: self.sent - rhs.sent,
            archived: self.archived - rhs.archived,
        }
    }
}

impl std::ops::SubAssign for StatsDelta {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Stats {
    pub fn apply(&mut self, delta: StatsDelta) {
        self.inbox_count = self.inbox_count.saturating_add_signed(delta.inbox);
        self.unread_count = self.unread_count.saturating_add_signed(delta.unread);
        self.starred_count = self.starred_count.saturating_add_signed(delta.starred);
        self.sent_count = self.sent_count.saturating_add_signed(delta.sent);
        self.archived_count = self.archived_count.saturating_add_signed(delta.archived);
    }

    pub fn recount<'a>(messages: impl IntoIterator<Item = &'a Message>, user_id: UserId) -> Self {
        let mut stats = Self::default();
        for message in messages {
            stats.apply(StatsDelta::contribution(Some(message), user_id));
        }
        stats
    }
}
