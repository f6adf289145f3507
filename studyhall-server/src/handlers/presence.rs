use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Extension,
    http::StatusCode,
    routing::post,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    app_state::AppState,
    handlers::{require_pool, require_user},
    http::error::AppResult,
    middleware::request_context::RequestContext,
    realtime::TouchOutcome,
    services::{ChatService, ensure_active_participant},
};
use shared::models::{PresenceStatus, PresenceUpdate, Timestamp};

pub fn routes() -> Router {
    Router::new()
        .route("/api/presence/heartbeat", post(heartbeat))
        .route("/api/presence/beacon", post(beacon))
        .route("/api/typing", post(typing))
}

#[derive(Debug, Deserialize)]
struct TypingBody {
    chat_id: Uuid,
}

/// Activity heartbeat. Only a transition to online fans a status
/// update out to the user's chats; steady-state heartbeats are
/// absorbed by the tracker's throttle.
#[instrument(skip(app_state, context))]
async fn heartbeat(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
) -> AppResult<Json<PresenceUpdate>> {
    let user_id = require_user(&context)?;

    let outcome = app_state.presence.touch(user_id);
    let last_seen_at = Timestamp(app_state.presence.last_seen(user_id).unwrap_or_else(Utc::now));

    if outcome == TouchOutcome::CameOnline {
        let pool = require_pool(&app_state)?;
        let service = ChatService::new(pool, app_state.broadcaster());
        let chat_ids = service.active_chat_ids(user_id).await?;
        app_state.broadcaster().user_status(
            user_id,
            PresenceStatus::Online,
            last_seen_at,
            &chat_ids,
        );
    }

    Ok(Json(PresenceUpdate {
        user_id,
        status: PresenceStatus::Online,
        last_seen_at,
    }))
}

/// Unload beacon: the client is navigating away, mark it offline now
/// instead of waiting out the threshold. Broadcasts only when the user
/// actually went offline; beacons from untracked or already-offline
/// users would otherwise flip badges that never showed online.
#[instrument(skip(app_state, context))]
async fn beacon(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
) -> AppResult<StatusCode> {
    let user_id = require_user(&context)?;

    if app_state.presence.beacon_offline(user_id) {
        let last_seen_at =
            Timestamp(app_state.presence.last_seen(user_id).unwrap_or_else(Utc::now));
        let pool = require_pool(&app_state)?;
        let service = ChatService::new(pool, app_state.broadcaster());
        let chat_ids = service.active_chat_ids(user_id).await?;
        app_state.broadcaster().user_status(
            user_id,
            PresenceStatus::Offline,
            last_seen_at,
            &chat_ids,
        );
    }

    Ok(StatusCode::NO_CONTENT)
}

/// Ephemeral typing relay: never persisted, fanned out to everyone in
/// the chat except the typist.
#[instrument(skip(app_state, context, payload))]
async fn typing(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(context): Extension<RequestContext>,
    Json(payload): Json<TypingBody>,
) -> AppResult<StatusCode> {
    let user_id = require_user(&context)?;
    let pool = require_pool(&app_state)?;
    ensure_active_participant(&pool, payload.chat_id, user_id).await?;

    app_state.broadcaster().typing(payload.chat_id, user_id);
    Ok(StatusCode::NO_CONTENT)
}
