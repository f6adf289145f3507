pub mod chats;
pub mod messages;
pub mod presence;
pub mod streaming;

use sqlx::PgPool;

use crate::{
    app_state::AppState,
    http::error::{ApiError, AppResult},
    middleware::request_context::RequestContext,
};
use uuid::Uuid;

pub(crate) fn require_user(context: &RequestContext) -> AppResult<Uuid> {
    context
        .user_id
        .ok_or_else(|| ApiError::unauthorized("authentication required"))
}

pub(crate) fn require_pool(state: &AppState) -> AppResult<PgPool> {
    state
        .pool
        .clone()
        .ok_or_else(|| ApiError::transient("database pool not configured"))
}
