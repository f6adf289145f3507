use chrono::{DateTime, Utc};
use shared::models::{
    ChatKind, MembershipResponse, ParticipantRole, ParticipantView, Timestamp,
};
use sqlx::PgPool;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::realtime::Broadcaster;

use super::chat_service::{ChatRow, record_system_message};
use super::{ServiceError, ServiceResult, ensure_active_participant};

#[derive(sqlx::FromRow)]
struct ParticipantRow {
    chat_id: Uuid,
    user_id: Uuid,
    role: String,
    is_active: bool,
    joined_at: DateTime<Utc>,
    left_at: Option<DateTime<Utc>>,
    last_read_at: Option<DateTime<Utc>>,
    last_seen_message_id: Option<Uuid>,
    muted: bool,
}

const PARTICIPANT_COLUMNS: &str = "chat_id, user_id, role, is_active, joined_at, left_at, \
                                   last_read_at, last_seen_message_id, muted";

impl ParticipantRow {
    fn into_view(self) -> ParticipantView {
        let role = ParticipantRole::try_from(self.role.as_str()).unwrap_or(ParticipantRole::Member);
        ParticipantView {
            chat_id: self.chat_id,
            user_id: self.user_id,
            role,
            is_active: self.is_active,
            joined_at: Timestamp(self.joined_at),
            left_at: self.left_at.map(Timestamp),
            last_read_at: self.last_read_at.map(Timestamp),
            last_seen_message_id: self.last_seen_message_id,
            muted: self.muted,
        }
    }
}

/// Membership engine. Every invariant (sole admin, invite-only groups,
/// admin-only moderation) is enforced inside the conditional `UPDATE`
/// itself, so two racing requests resolve against whichever state was
/// committed first rather than against a stale read. Mutations that
/// consult *other* rows for the admin invariant additionally lock the
/// chat row first; single-row updates alone do not serialize two
/// concurrent statements whose subqueries look at each other's rows.
#[derive(Debug, Clone)]
pub struct MembershipService {
    pool: PgPool,
    broadcaster: Broadcaster,
}

/// Takes the per-chat lock that serializes admin-invariant mutations.
async fn lock_chat(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    chat_id: Uuid,
) -> ServiceResult<()> {
    sqlx::query("SELECT id FROM chats WHERE id = $1 FOR UPDATE")
        .bind(chat_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

impl MembershipService {
    pub fn new(pool: PgPool, broadcaster: Broadcaster) -> Self {
        Self { pool, broadcaster }
    }

    /// Joins (or rejoins) a chat. Public groups accept anyone; private
    /// groups only reactivate a previously left participant; direct
    /// chats never accept joins. Already-active callers get their
    /// current membership back unchanged.
    #[instrument(name = "membership.join", skip(self), err)]
    pub async fn join(&self, chat_id: Uuid, user_id: Uuid) -> ServiceResult<MembershipResponse> {
        let kind = self.active_chat_kind(chat_id).await?;

        let joined = match kind {
            ChatKind::Direct => {
                return Err(ServiceError::Forbidden(
                    "direct chats cannot be joined".to_string(),
                ));
            }
            ChatKind::PublicGroup => {
                let result = sqlx::query(
                    "INSERT INTO chat_participants (chat_id, user_id, role, is_active, joined_at) \
                     VALUES ($1, $2, 'member', TRUE, now()) \
                     ON CONFLICT (chat_id, user_id) DO UPDATE \
                     SET is_active = TRUE, joined_at = now(), left_at = NULL, \
                         role = 'member' \
                     WHERE NOT chat_participants.is_active",
                )
                .bind(chat_id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;
                result.rows_affected() > 0
            }
            ChatKind::Group => {
                let result = sqlx::query(
                    "UPDATE chat_participants \
                     SET is_active = TRUE, joined_at = now(), left_at = NULL, \
                         role = 'member' \
                     WHERE chat_id = $1 AND user_id = $2 AND NOT is_active",
                )
                .bind(chat_id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;
                if result.rows_affected() == 0 {
                    // Either already active (fine) or never a member.
                    ensure_active_participant(&self.pool, chat_id, user_id)
                        .await
                        .map_err(|_| {
                            ServiceError::Forbidden(
                                "this group is invitation only".to_string(),
                            )
                        })?;
                }
                result.rows_affected() > 0
            }
        };

        if joined {
            self.refresh_participant_count(chat_id).await?;
            self.notify(chat_id, format!("{user_id} joined the chat"))
                .await;
        }

        self.membership_snapshot(chat_id, user_id).await
    }

    /// Invites users into a group chat. Any active participant may
    /// invite; invitees who are already active are skipped. Returns
    /// how many users actually gained membership.
    #[instrument(name = "membership.invite", skip(self, user_ids), err)]
    pub async fn invite(
        &self,
        chat_id: Uuid,
        actor: Uuid,
        user_ids: &[Uuid],
    ) -> ServiceResult<usize> {
        ensure_active_participant(&self.pool, chat_id, actor).await?;
        if self.active_chat_kind(chat_id).await? == ChatKind::Direct {
            return Err(ServiceError::Forbidden(
                "direct chats cannot take invitees".to_string(),
            ));
        }

        let mut invited = Vec::new();
        for &target in user_ids {
            if target == actor || invited.contains(&target) {
                continue;
            }
            let result = sqlx::query(
                "INSERT INTO chat_participants (chat_id, user_id, role, is_active, joined_at) \
                 VALUES ($1, $2, 'member', TRUE, now()) \
                 ON CONFLICT (chat_id, user_id) DO UPDATE \
                 SET is_active = TRUE, joined_at = now(), left_at = NULL, \
                     role = 'member' \
                 WHERE NOT chat_participants.is_active",
            )
            .bind(chat_id)
            .bind(target)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() > 0 {
                invited.push(target);
            }
        }

        if !invited.is_empty() {
            self.refresh_participant_count(chat_id).await?;
            for target in &invited {
                self.notify(chat_id, format!("{target} was added by {actor}"))
                    .await;
            }
        }

        Ok(invited.len())
    }

    /// Leaves a chat. The sole active admin of a group cannot leave
    /// while other active participants remain; the last participant
    /// out (and either side of a direct chat) soft-deletes the chat.
    /// Deactivation drops the row back to `member`, so nobody comes
    /// back from a leave still holding admin.
    #[instrument(name = "membership.leave", skip(self), err)]
    pub async fn leave(&self, chat_id: Uuid, user_id: Uuid) -> ServiceResult<()> {
        let mut tx = self.pool.begin().await?;
        lock_chat(&mut tx, chat_id).await?;

        let result = sqlx::query(
            "UPDATE chat_participants \
             SET is_active = FALSE, left_at = now(), role = 'member' \
             WHERE chat_id = $1 AND user_id = $2 AND is_active \
               AND (role <> 'admin' \
                    OR (SELECT kind FROM chats WHERE id = $1) = 'direct' \
                    OR EXISTS (SELECT 1 FROM chat_participants o \
                               WHERE o.chat_id = $1 AND o.user_id <> $2 \
                                 AND o.is_active AND o.role = 'admin') \
                    OR NOT EXISTS (SELECT 1 FROM chat_participants o \
                                   WHERE o.chat_id = $1 AND o.user_id <> $2 AND o.is_active))",
        )
        .bind(chat_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            drop(tx);
            ensure_active_participant(&self.pool, chat_id, user_id).await?;
            return Err(ServiceError::Conflict(
                "sole admin must promote or transfer before leaving".to_string(),
            ));
        }

        let kind: String = sqlx::query_scalar("SELECT kind FROM chats WHERE id = $1")
            .bind(chat_id)
            .fetch_one(&mut *tx)
            .await?;
        let remaining: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM chat_participants WHERE chat_id = $1 AND is_active",
        )
        .bind(chat_id)
        .fetch_one(&mut *tx)
        .await?;

        let closing = remaining == 0 || kind == "direct";
        if closing {
            sqlx::query(
                "UPDATE chats SET is_active = FALSE, participant_count = $2, \
                 last_activity_at = now() WHERE id = $1",
            )
            .bind(chat_id)
            .bind(i32::try_from(remaining).unwrap_or(0))
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE chats SET participant_count = \
                 (SELECT count(*) FROM chat_participants WHERE chat_id = $1 AND is_active), \
                 last_activity_at = now() WHERE id = $1",
            )
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        if !closing {
            self.notify(chat_id, format!("{user_id} left the chat")).await;
        }
        Ok(())
    }

    /// Removes a member. The requester must be an active admin; admins
    /// cannot be removed directly and have to be demoted first.
    #[instrument(name = "membership.remove", skip(self), err)]
    pub async fn remove(&self, chat_id: Uuid, actor: Uuid, target: Uuid) -> ServiceResult<()> {
        if actor == target {
            return Err(ServiceError::InvalidArgument(
                "use leave to remove yourself".to_string(),
            ));
        }

        let result = sqlx::query(
            "UPDATE chat_participants SET is_active = FALSE, left_at = now() \
             WHERE chat_id = $1 AND user_id = $3 AND is_active AND role = 'member' \
               AND EXISTS (SELECT 1 FROM chat_participants a \
                           WHERE a.chat_id = $1 AND a.user_id = $2 \
                             AND a.is_active AND a.role = 'admin')",
        )
        .bind(chat_id)
        .bind(actor)
        .bind(target)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.diagnose_moderation(chat_id, actor, target).await?);
        }

        self.refresh_participant_count(chat_id).await?;
        self.notify(chat_id, format!("{target} was removed by {actor}"))
            .await;
        Ok(())
    }

    /// Changes a participant's role. Demoting the sole active admin is
    /// rejected so the chat never ends up unadministered.
    #[instrument(name = "membership.change_role", skip(self), err)]
    pub async fn change_role(
        &self,
        chat_id: Uuid,
        actor: Uuid,
        target: Uuid,
        role: ParticipantRole,
    ) -> ServiceResult<ParticipantView> {
        let mut tx = self.pool.begin().await?;
        lock_chat(&mut tx, chat_id).await?;

        let result = sqlx::query(
            "UPDATE chat_participants SET role = $4 \
             WHERE chat_id = $1 AND user_id = $3 AND is_active \
               AND EXISTS (SELECT 1 FROM chat_participants a \
                           WHERE a.chat_id = $1 AND a.user_id = $2 \
                             AND a.is_active AND a.role = 'admin') \
               AND ($4 = 'admin' OR role = 'member' \
                    OR (SELECT count(*) FROM chat_participants x \
                        WHERE x.chat_id = $1 AND x.is_active AND x.role = 'admin') > 1)",
        )
        .bind(chat_id)
        .bind(actor)
        .bind(target)
        .bind(role.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            drop(tx);
            let admin = self.is_active_admin(chat_id, actor).await?;
            if !admin {
                return Err(ServiceError::Forbidden(
                    "only an admin can change roles".to_string(),
                ));
            }
            return match self.fetch_participant(chat_id, target).await? {
                Some(p) if p.is_active => Err(ServiceError::Conflict(
                    "cannot demote the sole admin".to_string(),
                )),
                _ => Err(ServiceError::NotFound(
                    "no active participant to update".to_string(),
                )),
            };
        }

        sqlx::query("UPDATE chats SET last_activity_at = now() WHERE id = $1")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.notify(chat_id, format!("{target} is now {}", role.as_str()))
            .await;

        self.fetch_participant(chat_id, target)
            .await?
            .ok_or_else(|| ServiceError::NotFound("participant vanished".to_string()))
    }

    /// Hands the admin role to another active participant, demoting
    /// the requester, in one transaction.
    #[instrument(name = "membership.transfer_admin", skip(self), err)]
    pub async fn transfer_admin(
        &self,
        chat_id: Uuid,
        actor: Uuid,
        target: Uuid,
    ) -> ServiceResult<()> {
        if actor == target {
            return Err(ServiceError::InvalidArgument(
                "cannot transfer admin to yourself".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        lock_chat(&mut tx, chat_id).await?;

        let promoted = sqlx::query(
            "UPDATE chat_participants SET role = 'admin' \
             WHERE chat_id = $1 AND user_id = $3 AND is_active \
               AND EXISTS (SELECT 1 FROM chat_participants a \
                           WHERE a.chat_id = $1 AND a.user_id = $2 \
                             AND a.is_active AND a.role = 'admin')",
        )
        .bind(chat_id)
        .bind(actor)
        .bind(target)
        .execute(&mut *tx)
        .await?;

        if promoted.rows_affected() == 0 {
            let admin = self.is_active_admin(chat_id, actor).await?;
            return Err(if admin {
                ServiceError::NotFound("target is not an active participant".to_string())
            } else {
                ServiceError::Forbidden("only an admin can transfer the role".to_string())
            });
        }

        let demoted = sqlx::query(
            "UPDATE chat_participants SET role = 'member' \
             WHERE chat_id = $1 AND user_id = $2 AND is_active AND role = 'admin'",
        )
        .bind(chat_id)
        .bind(actor)
        .execute(&mut *tx)
        .await?;

        if demoted.rows_affected() == 0 {
            return Err(ServiceError::Forbidden(
                "only an admin can transfer the role".to_string(),
            ));
        }

        sqlx::query("UPDATE chats SET created_by = $2, last_activity_at = now() WHERE id = $1")
            .bind(chat_id)
            .bind(target)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        self.notify(chat_id, format!("{actor} handed admin to {target}"))
            .await;
        Ok(())
    }

    /// Current chat summary plus the caller's own participant row, if
    /// they have one.
    pub async fn membership_snapshot(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
    ) -> ServiceResult<MembershipResponse> {
        let chat = sqlx::query_as::<_, ChatRow>(&format!(
            "SELECT {} FROM chats WHERE id = $1",
            super::chat_service::CHAT_COLUMNS,
        ))
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("chat {chat_id} not found")))?;

        let participant = self.fetch_participant(chat_id, user_id).await?;
        Ok(MembershipResponse {
            chat: chat.into_summary(),
            participant,
        })
    }

    /// Active participant rows for a chat; the caller must be one of
    /// them.
    #[instrument(name = "membership.participants", skip(self), err)]
    pub async fn participants(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
    ) -> ServiceResult<Vec<ParticipantView>> {
        ensure_active_participant(&self.pool, chat_id, user_id).await?;

        let rows = sqlx::query_as::<_, ParticipantRow>(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM chat_participants \
             WHERE chat_id = $1 AND is_active ORDER BY joined_at",
        ))
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ParticipantRow::into_view).collect())
    }

    async fn fetch_participant(
        &self,
        chat_id: Uuid,
        user_id: Uuid,
    ) -> ServiceResult<Option<ParticipantView>> {
        let row = sqlx::query_as::<_, ParticipantRow>(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM chat_participants \
             WHERE chat_id = $1 AND user_id = $2",
        ))
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ParticipantRow::into_view))
    }

    async fn is_active_admin(&self, chat_id: Uuid, user_id: Uuid) -> ServiceResult<bool> {
        let role: Option<String> = sqlx::query_scalar(
            "SELECT role FROM chat_participants \
             WHERE chat_id = $1 AND user_id = $2 AND is_active",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(role.as_deref() == Some("admin"))
    }

    async fn diagnose_moderation(
        &self,
        chat_id: Uuid,
        actor: Uuid,
        target: Uuid,
    ) -> ServiceResult<ServiceError> {
        if !self.is_active_admin(chat_id, actor).await? {
            return Ok(ServiceError::Forbidden(
                "only an admin can remove participants".to_string(),
            ));
        }
        Ok(match self.fetch_participant(chat_id, target).await? {
            Some(p) if p.is_active && p.role == ParticipantRole::Admin => ServiceError::Conflict(
                "demote the admin before removing them".to_string(),
            ),
            _ => ServiceError::NotFound("no active participant to remove".to_string()),
        })
    }

    async fn active_chat_kind(&self, chat_id: Uuid) -> ServiceResult<ChatKind> {
        let row: Option<(String, bool)> =
            sqlx::query_as("SELECT kind, is_active FROM chats WHERE id = $1")
                .bind(chat_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((kind, true)) => Ok(ChatKind::try_from(kind.as_str())
                .map_err(|_| ServiceError::InvalidArgument(format!("unknown chat kind {kind}")))?),
            _ => Err(ServiceError::NotFound(format!("chat {chat_id} not found"))),
        }
    }

    async fn refresh_participant_count(&self, chat_id: Uuid) -> ServiceResult<()> {
        sqlx::query(
            "UPDATE chats SET participant_count = \
             (SELECT count(*) FROM chat_participants WHERE chat_id = $1 AND is_active), \
             last_activity_at = now() WHERE id = $1",
        )
        .bind(chat_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Best-effort system message. The membership change is already
    /// committed; losing the notice is acceptable, losing the change
    /// is not.
    async fn notify(&self, chat_id: Uuid, content: String) {
        if let Err(err) =
            record_system_message(&self.pool, &self.broadcaster, chat_id, content).await
        {
            warn!(%chat_id, error = %err, "failed to record system message");
        }
    }
}
