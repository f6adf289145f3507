use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::timestamp::Timestamp;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    System,
    Image,
    File,
}

impl MessageType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::System => "system",
            Self::Image => "image",
            Self::File => "file",
        }
    }
}

impl TryFrom<&str> for MessageType {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "text" => Ok(Self::Text),
            "system" => Ok(Self::System),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            _ => Err("invalid message type"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Attachment {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// One reaction on a message; unique per (message, user, emoji).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ReactionView {
    pub user_id: Uuid,
    pub emoji: String,
    pub created_at: Timestamp,
}

/// Fully-populated message as delivered over the stream and poll paths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct MessageView {
    pub id: Uuid,
    pub chat_id: Uuid,
    /// `None` for system messages narrating membership events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<Uuid>,
    pub content: String,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<ReactionView>,
    pub is_edited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub message_type: Option<MessageType>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reply_to_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct EditMessageRequest {
    pub content: String,
}

/// Chronological page of chat history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct MessagePage {
    pub messages: Vec<MessageView>,
    /// Cursor for the next (older) page, if one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_before: Option<Timestamp>,
}

/// Catch-up poll result: everything created after the client's cursor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct PollResponse {
    pub messages: Vec<MessageView>,
    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn message_type_round_trips_through_str() {
        for ty in [
            MessageType::Text,
            MessageType::System,
            MessageType::Image,
            MessageType::File,
        ] {
            assert_eq!(MessageType::try_from(ty.as_str()), Ok(ty));
        }
        assert!(MessageType::try_from("video").is_err());
    }

    #[test]
    fn system_message_omits_sender() {
        let view = MessageView {
            id: Uuid::new_v4(),
            chat_id: Uuid::new_v4(),
            sender_id: None,
            content: "Ana joined the chat".into(),
            message_type: MessageType::System,
            attachments: vec![],
            reply_to_id: None,
            reactions: vec![],
            is_edited: false,
            edited_at: None,
            created_at: Timestamp(Utc::now()),
        };

        let json = serde_json::to_value(&view).unwrap();
        assert!(json.get("sender_id").is_none());
        assert_eq!(json["message_type"], "system");
    }

    #[test]
    fn send_request_defaults_are_empty() {
        let request: SendMessageRequest = serde_json::from_str("{}").unwrap();
        assert!(request.content.is_none());
        assert!(request.attachments.is_empty());
        assert!(request.reply_to_id.is_none());
    }
}
