use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    app_state::AppState,
    handlers::{require_pool, require_user},
    http::error::AppResult,
    middleware::request_context::RequestContext,
    services::{ChatService, MembershipService},
};
use shared::models::{
    ChangeRoleRequest, ChatSummary, CreateGroupChatRequest, InviteRequest, MembershipResponse,
    OpenDirectChatRequest, ParticipantView, RemoveParticipantRequest, TransferAdminRequest,
};

pub fn routes() -> Router {
    Router::new()
        .route("/api/chats", post(create_chat).get(list_chats))
        .route("/api/chats/direct", post(open_direct))
        .route("/api/chats/{chat_id}/participants", get(participants))
        .route("/api/chats/{chat_id}/join", post(join))
        .route("/api/chats/{chat_id}/leave", post(leave))
        .route("/api/chats/{chat_id}/invite", post(invite))
        .route("/api/chats/{chat_id}/remove", post(remove))
        .route("/api/chats/{chat_id}/role", post(change_role))
        .route("/api/chats/{chat_id}/transfer-admin", post(transfer_admin))
}

#[instrument(skip(app_state, context, payload))]
async fn create_chat(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Json(payload): Json<CreateGroupChatRequest>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user(&context)?;
    let pool = require_pool(&app_state)?;
    let service = ChatService::new(pool, app_state.broadcaster());

    let summary = service
        .create_group(
            user_id,
            &payload.name,
            &payload.member_ids,
            payload.public,
            payload.avatar_url.as_deref(),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(summary)))
}

/// Opens (or returns the existing) direct chat with the other user.
#[instrument(skip(app_state, context, payload))]
async fn open_direct(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Json(payload): Json<OpenDirectChatRequest>,
) -> AppResult<Json<ChatSummary>> {
    let user_id = require_user(&context)?;
    let pool = require_pool(&app_state)?;
    let service = ChatService::new(pool, app_state.broadcaster());

    let summary = service.open_direct(user_id, payload.user_id).await?;
    Ok(Json(summary))
}

#[instrument(skip(app_state, context))]
async fn list_chats(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
) -> AppResult<Json<Vec<ChatSummary>>> {
    let user_id = require_user(&context)?;
    let pool = require_pool(&app_state)?;
    let service = ChatService::new(pool, app_state.broadcaster());

    Ok(Json(service.list_chats(user_id).await?))
}

#[instrument(skip(app_state, context))]
async fn participants(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path(chat_id): Path<Uuid>,
) -> AppResult<Json<Vec<ParticipantView>>> {
    let user_id = require_user(&context)?;
    let pool = require_pool(&app_state)?;
    let service = MembershipService::new(pool, app_state.broadcaster());

    Ok(Json(service.participants(chat_id, user_id).await?))
}

#[instrument(skip(app_state, context))]
async fn join(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path(chat_id): Path<Uuid>,
) -> AppResult<Json<MembershipResponse>> {
    let user_id = require_user(&context)?;
    let pool = require_pool(&app_state)?;
    let service = MembershipService::new(pool, app_state.broadcaster());

    Ok(Json(service.join(chat_id, user_id).await?))
}

#[instrument(skip(app_state, context))]
async fn leave(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path(chat_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let user_id = require_user(&context)?;
    let pool = require_pool(&app_state)?;
    let service = MembershipService::new(pool, app_state.broadcaster());

    service.leave(chat_id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(app_state, context, payload))]
async fn invite(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path(chat_id): Path<Uuid>,
    Json(payload): Json<InviteRequest>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user(&context)?;
    let pool = require_pool(&app_state)?;
    let service = MembershipService::new(pool, app_state.broadcaster());

    let invited = service.invite(chat_id, user_id, &payload.user_ids).await?;
    Ok(Json(json!({ "invited": invited })))
}

#[instrument(skip(app_state, context, payload))]
async fn remove(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path(chat_id): Path<Uuid>,
    Json(payload): Json<RemoveParticipantRequest>,
) -> AppResult<StatusCode> {
    let user_id = require_user(&context)?;
    let pool = require_pool(&app_state)?;
    let service = MembershipService::new(pool, app_state.broadcaster());

    service.remove(chat_id, user_id, payload.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(app_state, context, payload))]
async fn change_role(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path(chat_id): Path<Uuid>,
    Json(payload): Json<ChangeRoleRequest>,
) -> AppResult<Json<ParticipantView>> {
    let user_id = require_user(&context)?;
    let pool = require_pool(&app_state)?;
    let service = MembershipService::new(pool, app_state.broadcaster());

    let participant = service
        .change_role(chat_id, user_id, payload.user_id, payload.role)
        .await?;
    Ok(Json(participant))
}

#[instrument(skip(app_state, context, payload))]
async fn transfer_admin(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Path(chat_id): Path<Uuid>,
    Json(payload): Json<TransferAdminRequest>,
) -> AppResult<StatusCode> {
    let user_id = require_user(&context)?;
    let pool = require_pool(&app_state)?;
    let service = MembershipService::new(pool, app_state.broadcaster());

    service
        .transfer_admin(chat_id, user_id, payload.user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
