use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{Extension, Path},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
};
use futures_util::Stream;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    app_state::AppState,
    handlers::{require_pool, require_user},
    http::error::AppResult,
    middleware::request_context::RequestContext,
    realtime::{ConnectionRegistry, Scope},
    services::ensure_active_participant,
};
use shared::config::server::Config;

pub fn routes() -> Router {
    Router::new()
        .route("/api/chats/{chat_id}/stream", get(chat_stream))
        .route("/api/stream", get(user_stream))
}

/// Removes the registry entry when the SSE stream is dropped, which is
/// the only signal axum gives us that the client went away.
struct StreamGuard {
    registry: Arc<ConnectionRegistry>,
    connection_id: Uuid,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.connection_id);
    }
}

/// Push stream for one chat. Requires active membership; the first
/// event on the wire is the `connected` ack carrying the connection id.
#[instrument(skip(app_state, config, context))]
async fn chat_stream(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(config): Extension<Arc<Config>>,
    Extension(context): Extension<RequestContext>,
    Path(chat_id): Path<Uuid>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let user_id = require_user(&context)?;
    let pool = require_pool(&app_state)?;
    ensure_active_participant(&pool, chat_id, user_id).await?;

    info!(%chat_id, %user_id, "establishing chat stream");
    Ok(open_stream(&app_state, &config, user_id, Scope::Chat(chat_id)))
}

/// Cross-chat push stream for the caller's own sessions, carrying
/// events addressed to the user rather than a chat, such as presence
/// changes from their other tabs.
#[instrument(skip(app_state, config, context))]
async fn user_stream(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(config): Extension<Arc<Config>>,
    Extension(context): Extension<RequestContext>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let user_id = require_user(&context)?;

    info!(%user_id, "establishing user stream");
    Ok(open_stream(&app_state, &config, user_id, Scope::User(user_id)))
}

fn open_stream(
    app_state: &AppState,
    config: &Config,
    user_id: Uuid,
    scope: Scope,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + use<>> {
    let registry = app_state.registry.clone();
    let handle = registry.register(user_id, scope);
    let guard = StreamGuard {
        registry,
        connection_id: handle.id,
    };

    let stream = ReceiverStream::new(handle.receiver).map(move |event| {
        // Holds the guard for the life of the stream.
        let _guard = &guard;
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, Infallible>(Event::default().event(event.name()).data(data))
    });

    let keepalive = KeepAlive::new()
        .interval(Duration::from_secs(
            config.realtime.heartbeat_seconds.max(5),
        ))
        .text("keep-alive");

    Sse::new(stream).keep_alive(keepalive)
}
