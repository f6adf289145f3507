use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    app_state::AppState,
    handlers::{require_pool, require_user},
    http::error::AppResult,
    middleware::request_context::RequestContext,
    services::MessageService,
};
use shared::config::server::Config;
use shared::models::{
    EditMessageRequest, MessagePage, MessageView, PollResponse, ReactionRequest, ReactionView,
    SendMessageRequest,
};

pub fn routes() -> Router {
    Router::new()
        .route(
            "/api/chats/{chat_id}/messages",
            post(send_message).get(list_messages),
        )
        .route("/api/chats/{chat_id}/messages/poll", get(poll_messages))
        .route("/api/messages/{message_id}/reactions", post(toggle_reaction))
        .route("/api/messages/{message_id}/edit", post(edit_message))
        .route("/api/messages/{message_id}/delete", post(delete_message))
}

fn message_service(app_state: &AppState, config: &Config) -> AppResult<MessageService> {
    let pool = require_pool(app_state)?;
    Ok(MessageService::new(
        pool,
        app_state.broadcaster(),
        config.realtime.poll_page_size,
    ))
}

#[derive(Debug, Deserialize, Default)]
struct HistoryQuery {
    before: Option<DateTime<Utc>>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct PollQuery {
    since: Option<DateTime<Utc>>,
}

#[instrument(skip(app_state, config, context, payload))]
async fn send_message(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(config): Extension<Arc<Config>>,
    Extension(context): Extension<RequestContext>,
    Path(chat_id): Path<Uuid>,
    Json(payload): Json<SendMessageRequest>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user(&context)?;
    let service = message_service(&app_state, &config)?;

    let message = service.send_message(chat_id, user_id, payload).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[instrument(skip(app_state, config, context, query))]
async fn list_messages(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(config): Extension<Arc<Config>>,
    Extension(context): Extension<RequestContext>,
    Path(chat_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<MessagePage>> {
    let user_id = require_user(&context)?;
    let service = message_service(&app_state, &config)?;

    let page = service
        .list_messages(chat_id, user_id, query.before, query.limit)
        .await?;
    Ok(Json(page))
}

/// Catch-up poll for clients whose push stream dropped: everything
/// after their cursor, oldest first.
#[instrument(skip(app_state, config, context, query))]
async fn poll_messages(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(config): Extension<Arc<Config>>,
    Extension(context): Extension<RequestContext>,
    Path(chat_id): Path<Uuid>,
    Query(query): Query<PollQuery>,
) -> AppResult<Json<PollResponse>> {
    let user_id = require_user(&context)?;
    let service = message_service(&app_state, &config)?;

    let response = service.poll_since(chat_id, user_id, query.since).await?;
    Ok(Json(response))
}

#[instrument(skip(app_state, config, context, payload))]
async fn toggle_reaction(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(config): Extension<Arc<Config>>,
    Extension(context): Extension<RequestContext>,
    Path(message_id): Path<Uuid>,
    Json(payload): Json<ReactionRequest>,
) -> AppResult<Json<Vec<ReactionView>>> {
    let user_id = require_user(&context)?;
    let service = message_service(&app_state, &config)?;

    let reactions = service
        .toggle_reaction(message_id, user_id, &payload.emoji)
        .await?;
    Ok(Json(reactions))
}

#[instrument(skip(app_state, config, context, payload))]
async fn edit_message(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(config): Extension<Arc<Config>>,
    Extension(context): Extension<RequestContext>,
    Path(message_id): Path<Uuid>,
    Json(payload): Json<EditMessageRequest>,
) -> AppResult<Json<MessageView>> {
    let user_id = require_user(&context)?;
    let service = message_service(&app_state, &config)?;

    let message = service
        .edit_message(message_id, user_id, &payload.content)
        .await?;
    Ok(Json(message))
}

#[instrument(skip(app_state, config, context))]
async fn delete_message(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(config): Extension<Arc<Config>>,
    Extension(context): Extension<RequestContext>,
    Path(message_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let user_id = require_user(&context)?;
    let service = message_service(&app_state, &config)?;

    service.delete_message(message_id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
