use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::timestamp::Timestamp;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Direct,
    Group,
    PublicGroup,
}

impl ChatKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
            Self::PublicGroup => "public_group",
        }
    }

    /// Whether the kind supports join/invite membership changes.
    #[must_use]
    pub const fn is_group(self) -> bool {
        matches!(self, Self::Group | Self::PublicGroup)
    }
}

impl TryFrom<&str> for ChatKind {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "direct" => Ok(Self::Direct),
            "group" => Ok(Self::Group),
            "public_group" => Ok(Self::PublicGroup),
            _ => Err("invalid chat kind"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Admin,
    Member,
}

impl ParticipantRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Member => "member",
        }
    }
}

impl TryFrom<&str> for ParticipantRole {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "admin" => Ok(Self::Admin),
            "member" => Ok(Self::Member),
            _ => Err("invalid participant role"),
        }
    }
}

/// Chat-list entry: one conversation as seen by a participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ChatSummary {
    pub id: Uuid,
    pub kind: ChatKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub created_by: Uuid,
    pub participant_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<Uuid>,
    pub last_activity_at: Timestamp,
    pub is_active: bool,
}

/// A user's membership record in a chat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ParticipantView {
    pub chat_id: Uuid,
    pub user_id: Uuid,
    pub role: ParticipantRole,
    pub is_active: bool,
    pub joined_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_message_id: Option<Uuid>,
    pub muted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct CreateGroupChatRequest {
    pub name: String,
    #[serde(default)]
    pub member_ids: Vec<Uuid>,
    #[serde(default)]
    pub public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct OpenDirectChatRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct InviteRequest {
    pub user_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct RemoveParticipantRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ChangeRoleRequest {
    pub user_id: Uuid,
    pub role: ParticipantRole,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct TransferAdminRequest {
    pub user_id: Uuid,
}

/// Outcome of a membership action: the chat snapshot after the change
/// and, where one applies, the affected participant row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct MembershipResponse {
    pub chat: ChatSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant: Option<ParticipantView>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_kind_round_trips_through_str() {
        for kind in [ChatKind::Direct, ChatKind::Group, ChatKind::PublicGroup] {
            assert_eq!(ChatKind::try_from(kind.as_str()), Ok(kind));
        }
        assert!(ChatKind::try_from("channel").is_err());
    }

    #[test]
    fn only_group_kinds_accept_membership_changes() {
        assert!(!ChatKind::Direct.is_group());
        assert!(ChatKind::Group.is_group());
        assert!(ChatKind::PublicGroup.is_group());
    }

    #[test]
    fn role_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ParticipantRole::Admin).unwrap(),
            "\"admin\""
        );
        assert_eq!(ParticipantRole::try_from("member"), Ok(ParticipantRole::Member));
    }
}
