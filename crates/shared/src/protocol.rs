use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{MessageKind, UserId};

/// A direct message as held in memory and carried on the wire.
///
/// `id` is server-assigned once confirmed; optimistic local entries carry a
/// millisecond-epoch timestamp as a temporary id until the echo arrives.
/// `content` is plaintext in memory whenever the local side can produce it;
/// `is_encrypted` means the content is still opaque ciphertext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub is_encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<String>,
    /// The sender's published X25519 public key, when the server chooses to
    /// inline it with the delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_public_key: Option<String>,
}

/// `is_seen` flips when the notification surface is opened; `is_read` only
/// on explicit per-item acknowledgement. The bits are independent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_seen: bool,
    #[serde(default)]
    pub is_read: bool,
}

/// Outbound socket envelope, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    ChatMessage {
        recipient_id: UserId,
        content: String,
        message_type: MessageKind,
        is_encrypted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_type: Option<String>,
    },
    OpenChat {
        chat_with: UserId,
    },
    CloseChat {
        chat_with: UserId,
    },
}

/// Inbound socket envelope, discriminated by `type`. Frames with types not
/// listed here are dropped by the connection layer without error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ChatMessage { message: ChatMessage },
    Notification { notification: Notification },
    OpenChatAck { chat_with: UserId },
    CloseChatAck { chat_with: UserId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// One row of the conversation listing: the peer plus enough context to
/// render a sidebar entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub user_id: UserId,
    pub user_username: String,
    pub user_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<ChatMessage>,
    #[serde(default)]
    pub unread_count: u32,
}

/// Cursor-paginated listing shape shared by the user and conversation
/// endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    pub results: Vec<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationListResponse {
    pub notifications: Vec<Notification>,
}
