//! Store-backed services. Every authorization and invariant check in
//! here is evaluated against current database state, and the checks
//! that guard invariants (sole admin, duplicate reaction, duplicate
//! direct chat) are built into single conditional statements rather
//! than read-then-write sequences.

use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

pub mod chat_service;
pub mod membership_service;
pub mod message_service;

pub use chat_service::ChatService;
pub use membership_service::MembershipService;
pub use message_service::MessageService;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Guard shared by the message pipeline, poller, and membership
/// operations: the caller must currently be an active participant.
pub(crate) async fn ensure_active_participant(
    pool: &PgPool,
    chat_id: Uuid,
    user_id: Uuid,
) -> ServiceResult<()> {
    let active: Option<bool> = sqlx::query_scalar(
        "SELECT is_active FROM chat_participants WHERE chat_id = $1 AND user_id = $2",
    )
    .bind(chat_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    match active {
        Some(true) => Ok(()),
        _ => Err(ServiceError::Forbidden(
            "user is not an active participant in this chat".to_string(),
        )),
    }
}

/// Shared fixtures for service tests that exercise live SQL. The
/// database is named by `TEST_DATABASE_URL`; tests skip themselves
/// when it is unset so the suite stays runnable without Postgres.
#[cfg(test)]
pub(crate) mod testing {
    use sqlx::PgPool;
    use tokio::sync::OnceCell;
    use uuid::Uuid;

    use crate::db::bootstrap;
    use crate::realtime::{Broadcaster, ConnectionRegistry};
    use shared::config::server::Config;

    static TEST_POOL: OnceCell<Option<PgPool>> = OnceCell::const_new();

    pub(crate) async fn test_pool() -> Option<PgPool> {
        TEST_POOL
            .get_or_init(|| async {
                let url = std::env::var("TEST_DATABASE_URL").ok()?;
                let pool = PgPool::connect(&url).await.ok()?;
                bootstrap::run(&pool).await.ok()?;
                Some(pool)
            })
            .await
            .clone()
    }

    pub(crate) fn test_broadcaster() -> Broadcaster {
        Broadcaster::new(ConnectionRegistry::new(&Config::with_defaults().realtime))
    }

    /// Seeds an active chat with the given admins and members.
    pub(crate) async fn seed_chat(
        pool: &PgPool,
        kind: &str,
        admins: &[Uuid],
        members: &[Uuid],
    ) -> Uuid {
        let chat_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO chats (id, kind, name, created_by, participant_count) \
             VALUES ($1, $2, 'study hall', $3, $4)",
        )
        .bind(chat_id)
        .bind(kind)
        .bind(admins.first().copied().unwrap_or_else(Uuid::new_v4))
        .bind((admins.len() + members.len()) as i32)
        .execute(pool)
        .await
        .expect("seed chat");

        let seats = admins
            .iter()
            .map(|id| (*id, "admin"))
            .chain(members.iter().map(|id| (*id, "member")));
        for (user_id, role) in seats {
            sqlx::query(
                "INSERT INTO chat_participants (chat_id, user_id, role) VALUES ($1, $2, $3)",
            )
            .bind(chat_id)
            .bind(user_id)
            .bind(role)
            .execute(pool)
            .await
            .expect("seed participant");
        }
        chat_id
    }

    /// Inserts a message backdated by `seconds_ago` so ordering
    /// assertions are deterministic.
    pub(crate) async fn seed_message(
        pool: &PgPool,
        chat_id: Uuid,
        sender: Uuid,
        content: &str,
        seconds_ago: f64,
    ) -> Uuid {
        let message_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO messages (id, chat_id, sender_id, content, created_at) \
             VALUES ($1, $2, $3, $4, now() - make_interval(secs => $5))",
        )
        .bind(message_id)
        .bind(chat_id)
        .bind(sender)
        .bind(content)
        .bind(seconds_ago)
        .execute(pool)
        .await
        .expect("seed message");
        message_id
    }
}
