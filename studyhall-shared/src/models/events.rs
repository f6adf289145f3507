use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{message::MessageView, message::ReactionView, timestamp::Timestamp};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ConnectedPayload {
    pub connection_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ReactionUpdate {
    pub chat_id: Uuid,
    pub message_id: Uuid,
    pub reactions: Vec<ReactionView>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct TypingUpdate {
    pub chat_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct PresenceUpdate {
    pub user_id: Uuid,
    pub status: PresenceStatus,
    pub last_seen_at: Timestamp,
}

/// Every event a push stream can carry. The tag doubles as the wire
/// `type` field, so the serialized payload is self-describing JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatStreamEvent {
    Connected { payload: ConnectedPayload },
    Ping,
    HealthCheck,
    Message { payload: MessageView },
    Reaction { payload: ReactionUpdate },
    System { payload: MessageView },
    Typing { payload: TypingUpdate },
    UserStatus { payload: PresenceUpdate },
}

impl ChatStreamEvent {
    /// Wire name of the event, matching the serde tag.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Ping => "ping",
            Self::HealthCheck => "health_check",
            Self::Message { .. } => "message",
            Self::Reaction { .. } => "reaction",
            Self::System { .. } => "system",
            Self::Typing { .. } => "typing",
            Self::UserStatus { .. } => "user_status",
        }
    }
}
