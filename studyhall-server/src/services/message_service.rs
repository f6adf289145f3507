use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::models::{
    Attachment, MessagePage, MessageType, MessageView, PollResponse, ReactionView,
    SendMessageRequest, Timestamp,
};
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use crate::realtime::Broadcaster;

use super::{ServiceError, ServiceResult, ensure_active_participant};

// Counted in scalar values, not bytes: ZWJ sequences with skin-tone
// modifiers run well past 32 UTF-8 bytes.
const MAX_EMOJI_SCALARS: usize = 16;

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    chat_id: Uuid,
    sender_id: Option<Uuid>,
    content: String,
    message_type: String,
    attachments: serde_json::Value,
    reply_to_id: Option<Uuid>,
    is_edited: bool,
    edited_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

const MESSAGE_COLUMNS: &str = "id, chat_id, sender_id, content, message_type, attachments, \
                               reply_to_id, is_edited, edited_at, created_at";

impl MessageRow {
    fn into_view(self, reactions: Vec<ReactionView>) -> MessageView {
        let message_type =
            MessageType::try_from(self.message_type.as_str()).unwrap_or(MessageType::Text);
        let attachments: Vec<Attachment> =
            serde_json::from_value(self.attachments).unwrap_or_default();
        MessageView {
            id: self.id,
            chat_id: self.chat_id,
            sender_id: self.sender_id,
            content: self.content,
            message_type,
            attachments,
            reply_to_id: self.reply_to_id,
            reactions,
            is_edited: self.is_edited,
            edited_at: self.edited_at.map(Timestamp),
            created_at: Timestamp(self.created_at),
        }
    }
}

/// Normalizes an incoming send request: trims the content, defaults the
/// type to text, and rejects empty payloads and client-authored system
/// messages.
pub(crate) fn validate_send(
    request: &SendMessageRequest,
) -> Result<(String, MessageType), ServiceError> {
    let content = request
        .content
        .as_deref()
        .unwrap_or_default()
        .trim()
        .to_string();
    if content.is_empty() && request.attachments.is_empty() {
        return Err(ServiceError::InvalidArgument(
            "message needs content or at least one attachment".to_string(),
        ));
    }

    let message_type = request.message_type.unwrap_or(MessageType::Text);
    if message_type == MessageType::System {
        return Err(ServiceError::InvalidArgument(
            "system messages are server generated".to_string(),
        ));
    }

    Ok((content, message_type))
}

/// Trims a reaction emoji and bounds its length.
pub(crate) fn validate_emoji(emoji: &str) -> Result<&str, ServiceError> {
    let emoji = emoji.trim();
    if emoji.is_empty() || emoji.chars().count() > MAX_EMOJI_SCALARS {
        return Err(ServiceError::InvalidArgument(
            "reaction emoji is empty or too long".to_string(),
        ));
    }
    Ok(emoji)
}

/// Message pipeline: sends, edits, soft deletes, reaction toggles, and
/// the two read paths (history page and catch-up poll). Broadcasts
/// happen only after the store write has committed, which keeps
/// per-chat delivery in commit order.
#[derive(Debug, Clone)]
pub struct MessageService {
    pool: PgPool,
    broadcaster: Broadcaster,
    page_size: i64,
}

impl MessageService {
    pub fn new(pool: PgPool, broadcaster: Broadcaster, page_size: i64) -> Self {
        Self {
            pool,
            broadcaster,
            page_size: page_size.max(1),
        }
    }

    /// Persists a message and fans it out to the chat scope, excluding
    /// the sender (who already has it from the HTTP response).
    #[instrument(name = "message.send", skip(self, request), err)]
    pub async fn send_message(
        &self,
        chat_id: Uuid,
        sender: Uuid,
        request: SendMessageRequest,
    ) -> ServiceResult<MessageView> {
        ensure_active_participant(&self.pool, chat_id, sender).await?;
        let (content, message_type) = validate_send(&request)?;

        if let Some(reply_to) = request.reply_to_id {
            let in_chat: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM messages \
                 WHERE id = $1 AND chat_id = $2 AND NOT is_deleted)",
            )
            .bind(reply_to)
            .bind(chat_id)
            .fetch_one(&self.pool)
            .await?;
            if !in_chat {
                return Err(ServiceError::InvalidArgument(
                    "reply target is not a message in this chat".to_string(),
                ));
            }
        }

        let message_id = Uuid::new_v4();
        let attachments = serde_json::to_value(&request.attachments)
            .map_err(|err| ServiceError::InvalidArgument(err.to_string()))?;

        let mut tx = self.pool.begin().await?;

        let created_at: DateTime<Utc> = sqlx::query_scalar(
            "INSERT INTO messages \
             (id, chat_id, sender_id, content, message_type, attachments, reply_to_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING created_at",
        )
        .bind(message_id)
        .bind(chat_id)
        .bind(sender)
        .bind(&content)
        .bind(message_type.as_str())
        .bind(&attachments)
        .bind(request.reply_to_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE chats SET last_message_id = $2, last_activity_at = now() WHERE id = $1",
        )
        .bind(chat_id)
        .bind(message_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let view = MessageView {
            id: message_id,
            chat_id,
            sender_id: Some(sender),
            content,
            message_type,
            attachments: request.attachments,
            reply_to_id: request.reply_to_id,
            reactions: vec![],
            is_edited: false,
            edited_at: None,
            created_at: Timestamp(created_at),
        };

        self.broadcaster.message_created(&view, true);
        Ok(view)
    }

    /// Toggles a reaction: removes it if this user already reacted with
    /// this emoji, adds it otherwise. Returns the message's updated
    /// reaction list, which is also broadcast to the chat.
    #[instrument(name = "message.toggle_reaction", skip(self, emoji), err)]
    pub async fn toggle_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: &str,
    ) -> ServiceResult<Vec<ReactionView>> {
        let emoji = validate_emoji(emoji)?;

        let chat_id: Uuid = sqlx::query_scalar(
            "SELECT chat_id FROM messages WHERE id = $1 AND NOT is_deleted",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("message {message_id} not found")))?;

        ensure_active_participant(&self.pool, chat_id, user_id).await?;

        let removed = sqlx::query(
            "DELETE FROM message_reactions \
             WHERE message_id = $1 AND user_id = $2 AND emoji = $3",
        )
        .bind(message_id)
        .bind(user_id)
        .bind(emoji)
        .execute(&self.pool)
        .await?;

        if removed.rows_affected() == 0 {
            sqlx::query(
                "INSERT INTO message_reactions (message_id, user_id, emoji) \
                 VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
            )
            .bind(message_id)
            .bind(user_id)
            .bind(emoji)
            .execute(&self.pool)
            .await?;
        }

        let reactions = self.reactions_for(message_id).await?;
        self.broadcaster
            .reaction_updated(chat_id, message_id, reactions.clone());
        Ok(reactions)
    }

    /// Edits a message's content. Sender only; system and deleted
    /// messages cannot be edited. The edited message is re-broadcast
    /// to the whole chat, sender included.
    #[instrument(name = "message.edit", skip(self, content), err)]
    pub async fn edit_message(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        content: &str,
    ) -> ServiceResult<MessageView> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "edited content cannot be empty".to_string(),
            ));
        }

        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "UPDATE messages SET content = $3, is_edited = TRUE, edited_at = now() \
             WHERE id = $1 AND sender_id = $2 AND NOT is_deleted \
               AND message_type <> 'system' \
             RETURNING {MESSAGE_COLUMNS}",
        ))
        .bind(message_id)
        .bind(user_id)
        .bind(content)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(self.diagnose_sender_op(message_id, user_id).await?);
        };

        let reactions = self.reactions_for(message_id).await?;
        let view = row.into_view(reactions);
        self.broadcaster.message_created(&view, false);
        Ok(view)
    }

    /// Soft-deletes a message. Sender only. Deleted messages drop out
    /// of history and poll results but stay in the store.
    #[instrument(name = "message.delete", skip(self), err)]
    pub async fn delete_message(&self, message_id: Uuid, user_id: Uuid) -> ServiceResult<()> {
        let result = sqlx::query(
            "UPDATE messages SET is_deleted = TRUE \
             WHERE id = $1 AND sender_id = $2 AND NOT is_deleted",
        )
        .bind(message_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.diagnose_sender_op(message_id, user_id).await?);
        }
        Ok(())
    }

    /// History page: up to `limit` non-deleted messages strictly older
    /// than `before` (or the newest page), returned in chronological
    /// order. Reading advances the caller's read cursor.
    #[instrument(name = "message.list", skip(self), err)]
    pub async fn list_messages(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> ServiceResult<MessagePage> {
        ensure_active_participant(&self.pool, chat_id, user_id).await?;

        let limit = limit
            .map(|l| i64::from(l.max(1)))
            .unwrap_or(self.page_size)
            .min(self.page_size * 2);

        let mut rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE chat_id = $1 AND NOT is_deleted \
               AND ($2::timestamptz IS NULL OR created_at < $2) \
             ORDER BY created_at DESC LIMIT $3",
        ))
        .bind(chat_id)
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let next_before = if rows.len() as i64 == limit {
            rows.last().map(|row| Timestamp(row.created_at))
        } else {
            None
        };
        rows.reverse();

        let messages = self.attach_reactions(rows).await?;
        if let Some(newest) = messages.last() {
            self.advance_read_cursor(chat_id, user_id, newest.id, newest.created_at.0)
                .await?;
        }

        Ok(MessagePage {
            messages,
            next_before,
        })
    }

    /// Catch-up poll: everything created after `since`, ascending,
    /// capped at one page. Without a cursor it returns the most recent
    /// page so a fresh client can seed one.
    #[instrument(name = "message.poll", skip(self), err)]
    pub async fn poll_since(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> ServiceResult<PollResponse> {
        ensure_active_participant(&self.pool, chat_id, user_id).await?;

        let rows = match since {
            Some(since) => {
                sqlx::query_as::<_, MessageRow>(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE chat_id = $1 AND NOT is_deleted AND created_at > $2 \
                     ORDER BY created_at ASC LIMIT $3",
                ))
                .bind(chat_id)
                .bind(since)
                .bind(self.page_size)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                let mut rows = sqlx::query_as::<_, MessageRow>(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE chat_id = $1 AND NOT is_deleted \
                     ORDER BY created_at DESC LIMIT $2",
                ))
                .bind(chat_id)
                .bind(self.page_size)
                .fetch_all(&self.pool)
                .await?;
                rows.reverse();
                rows
            }
        };

        let messages = self.attach_reactions(rows).await?;
        if let Some(newest) = messages.last() {
            self.advance_read_cursor(chat_id, user_id, newest.id, newest.created_at.0)
                .await?;
        }

        Ok(PollResponse {
            count: messages.len(),
            messages,
        })
    }

    async fn reactions_for(&self, message_id: Uuid) -> ServiceResult<Vec<ReactionView>> {
        let rows: Vec<(Uuid, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT user_id, emoji, created_at FROM message_reactions \
             WHERE message_id = $1 ORDER BY created_at",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, emoji, created_at)| ReactionView {
                user_id,
                emoji,
                created_at: Timestamp(created_at),
            })
            .collect())
    }

    /// Loads reactions for a whole page in one query.
    async fn attach_reactions(&self, rows: Vec<MessageRow>) -> ServiceResult<Vec<MessageView>> {
        if rows.is_empty() {
            return Ok(vec![]);
        }

        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        let reaction_rows: Vec<(Uuid, Uuid, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT message_id, user_id, emoji, created_at FROM message_reactions \
             WHERE message_id = ANY($1) ORDER BY created_at",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_message: HashMap<Uuid, Vec<ReactionView>> = HashMap::new();
        for (message_id, user_id, emoji, created_at) in reaction_rows {
            by_message.entry(message_id).or_default().push(ReactionView {
                user_id,
                emoji,
                created_at: Timestamp(created_at),
            });
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let reactions = by_message.remove(&row.id).unwrap_or_default();
                row.into_view(reactions)
            })
            .collect())
    }

    /// Moves the caller's read cursor forward, never back: a reader
    /// paging into older history must not rewind what they have
    /// already seen.
    async fn advance_read_cursor(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
        newest_message_id: Uuid,
        newest_created_at: DateTime<Utc>,
    ) -> ServiceResult<()> {
        sqlx::query(
            "UPDATE chat_participants \
             SET last_read_at = now(), last_seen_message_id = $3 \
             WHERE chat_id = $1 AND user_id = $2 \
               AND (last_seen_message_id IS NULL \
                    OR $4 >= (SELECT m.created_at FROM messages m \
                              WHERE m.id = chat_participants.last_seen_message_id))",
        )
        .bind(chat_id)
        .bind(user_id)
        .bind(newest_message_id)
        .bind(newest_created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn diagnose_sender_op(
        &self,
        message_id: Uuid,
        user_id: Uuid,
    ) -> ServiceResult<ServiceError> {
        let row: Option<(Option<Uuid>, bool)> = sqlx::query_as(
            "SELECT sender_id, is_deleted FROM messages WHERE id = $1",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((sender, false)) if sender != Some(user_id) => {
                ServiceError::Forbidden("only the sender can modify a message".to_string())
            }
            _ => ServiceError::NotFound(format!("message {message_id} not found")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_send_rejects_empty_payload() {
        let request = SendMessageRequest::default();
        assert!(matches!(
            validate_send(&request),
            Err(ServiceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn validate_send_trims_and_defaults_to_text() {
        let request = SendMessageRequest {
            content: Some("  hello  ".to_string()),
            ..Default::default()
        };
        let (content, message_type) = validate_send(&request).unwrap();
        assert_eq!(content, "hello");
        assert_eq!(message_type, MessageType::Text);
    }

    #[test]
    fn validate_send_allows_attachment_only() {
        let request = SendMessageRequest {
            message_type: Some(MessageType::Image),
            attachments: vec![Attachment {
                url: "https://cdn.example/pic.png".to_string(),
                name: None,
                content_type: Some("image/png".to_string()),
            }],
            ..Default::default()
        };
        let (content, message_type) = validate_send(&request).unwrap();
        assert!(content.is_empty());
        assert_eq!(message_type, MessageType::Image);
    }

    #[test]
    fn validate_send_rejects_client_system_messages() {
        let request = SendMessageRequest {
            content: Some("pretend".to_string()),
            message_type: Some(MessageType::System),
            ..Default::default()
        };
        assert!(matches!(
            validate_send(&request),
            Err(ServiceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn message_row_maps_attachments_and_unknown_type() {
        let row = MessageRow {
            id: Uuid::new_v4(),
            chat_id: Uuid::new_v4(),
            sender_id: Some(Uuid::new_v4()),
            content: "hi".to_string(),
            message_type: "sticker".to_string(),
            attachments: json!([{ "url": "https://cdn.example/a.pdf", "name": "a.pdf" }]),
            reply_to_id: None,
            is_edited: false,
            edited_at: None,
            created_at: Utc::now(),
        };
        let view = row.into_view(vec![]);
        assert_eq!(view.message_type, MessageType::Text);
        assert_eq!(view.attachments.len(), 1);
        assert_eq!(view.attachments[0].url, "https://cdn.example/a.pdf");
    }

    #[test]
    fn validate_emoji_accepts_long_zwj_sequences() {
        // Four people with skin tones: 41 UTF-8 bytes, 11 scalars.
        let family = "👨🏻‍👩🏼‍👧🏽‍👦🏾";
        assert!(family.len() > 32);
        assert_eq!(validate_emoji(family).unwrap(), family);

        assert!(validate_emoji("   ").is_err());
        assert!(validate_emoji(&"😀".repeat(17)).is_err());
    }

    mod sql {
        use super::*;
        use crate::services::testing::{seed_chat, seed_message, test_broadcaster, test_pool};

        fn service(pool: &PgPool) -> MessageService {
            MessageService::new(pool.clone(), test_broadcaster(), 50)
        }

        #[tokio::test]
        async fn reaction_toggle_round_trips() {
            let Some(pool) = test_pool().await else { return };
            let user = Uuid::new_v4();
            let chat_id = seed_chat(&pool, "group", &[user], &[]).await;
            let message_id = seed_message(&pool, chat_id, user, "hello", 10.0).await;
            let service = service(&pool);

            let added = service.toggle_reaction(message_id, user, "🔥").await.unwrap();
            assert_eq!(added.len(), 1);
            assert_eq!(added[0].emoji, "🔥");

            let removed = service.toggle_reaction(message_id, user, "🔥").await.unwrap();
            assert!(removed.is_empty());
        }

        #[tokio::test]
        async fn poll_skips_deleted_messages_and_orders_ascending() {
            let Some(pool) = test_pool().await else { return };
            let user = Uuid::new_v4();
            let chat_id = seed_chat(&pool, "group", &[user], &[]).await;
            let oldest = seed_message(&pool, chat_id, user, "one", 30.0).await;
            let deleted = seed_message(&pool, chat_id, user, "two", 20.0).await;
            let newest = seed_message(&pool, chat_id, user, "three", 10.0).await;
            let service = service(&pool);

            service.delete_message(deleted, user).await.unwrap();

            let since = Utc::now() - chrono::Duration::minutes(5);
            let response = service.poll_since(chat_id, user, Some(since)).await.unwrap();
            let ids: Vec<Uuid> = response.messages.iter().map(|m| m.id).collect();
            assert_eq!(ids, vec![oldest, newest]);
            assert_eq!(response.count, 2);
        }

        #[tokio::test]
        async fn paging_back_does_not_rewind_the_read_cursor() {
            let Some(pool) = test_pool().await else { return };
            let user = Uuid::new_v4();
            let chat_id = seed_chat(&pool, "group", &[user], &[]).await;
            seed_message(&pool, chat_id, user, "one", 30.0).await;
            seed_message(&pool, chat_id, user, "two", 20.0).await;
            let newest = seed_message(&pool, chat_id, user, "three", 10.0).await;
            let service = service(&pool);

            let page = service
                .list_messages(chat_id, user, None, Some(2))
                .await
                .unwrap();
            assert_eq!(page.messages.last().unwrap().id, newest);

            // Page into older history; the cursor must stay put.
            let older_than = page.messages.first().unwrap().created_at.0;
            service
                .list_messages(chat_id, user, Some(older_than), None)
                .await
                .unwrap();

            let cursor: Option<Uuid> = sqlx::query_scalar(
                "SELECT last_seen_message_id FROM chat_participants \
                 WHERE chat_id = $1 AND user_id = $2",
            )
            .bind(chat_id)
            .bind(user)
            .fetch_one(&pool)
            .await
            .unwrap();
            assert_eq!(cursor, Some(newest));
        }
    }
}
