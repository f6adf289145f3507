use chrono::{DateTime, Utc};
use shared::models::{ChatKind, ChatSummary, MessageType, MessageView, Timestamp};
use sqlx::PgPool;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::realtime::Broadcaster;

use super::{ServiceError, ServiceResult};

#[derive(sqlx::FromRow)]
pub(crate) struct ChatRow {
    pub id: Uuid,
    pub kind: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub created_by: Uuid,
    pub participant_count: i32,
    pub last_message_id: Option<Uuid>,
    pub last_activity_at: DateTime<Utc>,
    pub is_active: bool,
}

pub(crate) const CHAT_COLUMNS: &str = "id, kind, name, avatar_url, created_by, participant_count, \
                            last_message_id, last_activity_at, is_active";

impl ChatRow {
    pub(crate) fn into_summary(self) -> ChatSummary {
        let kind = ChatKind::try_from(self.kind.as_str()).unwrap_or(ChatKind::Group);
        ChatSummary {
            id: self.id,
            kind,
            name: self.name,
            avatar_url: self.avatar_url,
            created_by: self.created_by,
            participant_count: self.participant_count,
            last_message_id: self.last_message_id,
            last_activity_at: Timestamp(self.last_activity_at),
            is_active: self.is_active,
        }
    }
}

/// Deterministic key for the unordered user pair of a direct chat.
/// A partial unique index on it enforces one active direct chat per
/// pair regardless of who opens it.
pub(crate) fn direct_pair_key(a: Uuid, b: Uuid) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{low}:{high}")
}

/// Chat creation and lookup. Membership mutations live in
/// [`MembershipService`](super::MembershipService); this service only
/// brings chats into existence and answers list/snapshot reads.
#[derive(Debug, Clone)]
pub struct ChatService {
    pool: PgPool,
    broadcaster: Broadcaster,
}

impl ChatService {
    pub fn new(pool: PgPool, broadcaster: Broadcaster) -> Self {
        Self { pool, broadcaster }
    }

    /// Creates a group chat with the creator as admin and the listed
    /// members as members.
    #[instrument(name = "chat.create_group", skip(self, member_ids), err)]
    pub async fn create_group(
        &self,
        creator: Uuid,
        name: &str,
        member_ids: &[Uuid],
        public: bool,
        avatar_url: Option<&str>,
    ) -> ServiceResult<ChatSummary> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "group chat requires a display name".to_string(),
            ));
        }

        let kind = if public {
            ChatKind::PublicGroup
        } else {
            ChatKind::Group
        };
        let chat_id = Uuid::new_v4();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO chats (id, kind, name, avatar_url, created_by, participant_count) \
             VALUES ($1, $2, $3, $4, $5, 0)",
        )
        .bind(chat_id)
        .bind(kind.as_str())
        .bind(name)
        .bind(avatar_url)
        .bind(creator)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO chat_participants (chat_id, user_id, role, is_active, joined_at) \
             VALUES ($1, $2, 'admin', TRUE, now())",
        )
        .bind(chat_id)
        .bind(creator)
        .execute(&mut *tx)
        .await?;

        for member in member_ids {
            if *member == creator {
                continue;
            }
            sqlx::query(
                "INSERT INTO chat_participants (chat_id, user_id, role, is_active, joined_at) \
                 VALUES ($1, $2, 'member', TRUE, now()) \
                 ON CONFLICT (chat_id, user_id) DO NOTHING",
            )
            .bind(chat_id)
            .bind(member)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE chats SET participant_count = \
               (SELECT count(*) FROM chat_participants WHERE chat_id = $1 AND is_active) \
             WHERE id = $1",
        )
        .bind(chat_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        // Notification step only; the chat already exists either way.
        if let Err(err) = self
            .record_system_message(chat_id, format!("Group \"{name}\" was created"))
            .await
        {
            warn!(%chat_id, error = %err, "failed to record group creation message");
        }

        self.chat_summary(chat_id).await
    }

    /// Opens (or reuses) the direct chat for an unordered user pair.
    /// Idempotent: an active direct chat for the pair is returned
    /// as-is. A concurrent create racing the partial unique index
    /// surfaces as Conflict.
    #[instrument(name = "chat.open_direct", skip(self), err)]
    pub async fn open_direct(&self, actor: Uuid, other: Uuid) -> ServiceResult<ChatSummary> {
        if actor == other {
            return Err(ServiceError::InvalidArgument(
                "cannot open a direct chat with yourself".to_string(),
            ));
        }

        let pair_key = direct_pair_key(actor, other);

        let existing = sqlx::query_as::<_, ChatRow>(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE pair_key = $1 AND is_active",
        ))
        .bind(&pair_key)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = existing {
            return Ok(row.into_summary());
        }

        let chat_id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO chats (id, kind, created_by, pair_key, participant_count) \
             VALUES ($1, 'direct', $2, $3, 2) \
             ON CONFLICT (pair_key) WHERE pair_key IS NOT NULL AND is_active DO NOTHING",
        )
        .bind(chat_id)
        .bind(actor)
        .bind(&pair_key)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(ServiceError::Conflict(
                "a direct chat for this pair was created concurrently".to_string(),
            ));
        }

        for user in [actor, other] {
            sqlx::query(
                "INSERT INTO chat_participants (chat_id, user_id, role, is_active, joined_at) \
                 VALUES ($1, $2, 'member', TRUE, now())",
            )
            .bind(chat_id)
            .bind(user)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        self.chat_summary(chat_id).await
    }

    /// Active chats for a user, most recent activity first.
    #[instrument(name = "chat.list", skip(self), err)]
    pub async fn list_chats(&self, user_id: Uuid) -> ServiceResult<Vec<ChatSummary>> {
        let rows = sqlx::query_as::<_, ChatRow>(
            "SELECT c.id, c.kind, c.name, c.avatar_url, c.created_by, c.participant_count, \
                    c.last_message_id, c.last_activity_at, c.is_active \
             FROM chats c \
             JOIN chat_participants p ON p.chat_id = c.id \
             WHERE p.user_id = $1 AND p.is_active AND c.is_active \
             ORDER BY c.last_activity_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ChatRow::into_summary).collect())
    }

    /// Ids of every chat the user is active in; used for presence
    /// badge fan-out.
    pub async fn active_chat_ids(&self, user_id: Uuid) -> ServiceResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT c.id FROM chats c \
             JOIN chat_participants p ON p.chat_id = c.id \
             WHERE p.user_id = $1 AND p.is_active AND c.is_active",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    pub async fn chat_summary(&self, chat_id: Uuid) -> ServiceResult<ChatSummary> {
        let row = sqlx::query_as::<_, ChatRow>(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE id = $1",
        ))
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ChatRow::into_summary)
            .ok_or_else(|| ServiceError::NotFound(format!("chat {chat_id} not found")))
    }

    /// Persists and broadcasts a system message. Shared with the
    /// membership engine through [`record_system_message`].
    pub(crate) async fn record_system_message(
        &self,
        chat_id: Uuid,
        content: String,
    ) -> ServiceResult<MessageView> {
        record_system_message(&self.pool, &self.broadcaster, chat_id, content).await
    }
}

/// Inserts a system message (no human sender), bumps the chat's
/// last-message reference and activity, and broadcasts it to the chat
/// scope. Callers treat failures as a notification loss, never as a
/// reason to roll back the membership change that produced it.
pub(crate) async fn record_system_message(
    pool: &PgPool,
    broadcaster: &Broadcaster,
    chat_id: Uuid,
    content: String,
) -> ServiceResult<MessageView> {
    let message_id = Uuid::new_v4();

    let created_at: DateTime<Utc> = sqlx::query_scalar(
        "INSERT INTO messages (id, chat_id, sender_id, content, message_type) \
         VALUES ($1, $2, NULL, $3, 'system') \
         RETURNING created_at",
    )
    .bind(message_id)
    .bind(chat_id)
    .bind(&content)
    .fetch_one(pool)
    .await?;

    sqlx::query(
        "UPDATE chats SET last_message_id = $2, last_activity_at = now() WHERE id = $1",
    )
    .bind(chat_id)
    .bind(message_id)
    .execute(pool)
    .await?;

    let view = MessageView {
        id: message_id,
        chat_id,
        sender_id: None,
        content,
        message_type: MessageType::System,
        attachments: vec![],
        reply_to_id: None,
        reactions: vec![],
        is_edited: false,
        edited_at: None,
        created_at: Timestamp(created_at),
    };

    broadcaster.system_message(&view);
    Ok(view)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(direct_pair_key(a, b), direct_pair_key(b, a));
    }

    #[test]
    fn pair_key_distinguishes_pairs() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        assert_ne!(direct_pair_key(a, b), direct_pair_key(a, c));
    }

    #[test]
    fn chat_row_maps_unknown_kind_to_group() {
        let row = ChatRow {
            id: Uuid::new_v4(),
            kind: "direct".into(),
            name: None,
            avatar_url: None,
            created_by: Uuid::new_v4(),
            participant_count: 2,
            last_message_id: None,
            last_activity_at: Utc::now(),
            is_active: true,
        };
        assert_eq!(row.into_summary().kind, ChatKind::Direct);
    }
}
