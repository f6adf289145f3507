use std::{str::FromStr, sync::Arc};

use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, HeaderName},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::http::error::{ApiError, AppResult};
use crate::middleware::request_context::RequestContext;
use shared::config::server::Config;

/// Resolves the caller's identity from the gateway-injected identity
/// header. The platform gateway authenticates the session upstream;
/// this service trusts the header it forwards and rejects requests
/// that arrive without one.
pub async fn require_identity(mut request: Request<Body>, next: Next) -> AppResult<Response> {
    let header = request
        .extensions()
        .get::<Arc<Config>>()
        .map(|config| {
            HeaderName::from_str(&config.server.identity_header)
                .unwrap_or_else(|_| HeaderName::from_static("x-user-id"))
        })
        .unwrap_or_else(|| HeaderName::from_static("x-user-id"));

    let user_id = extract_identity(request.headers(), &header)
        .ok_or_else(|| ApiError::unauthorized("missing or malformed identity header"))?;

    if let Some(context) = request.extensions_mut().get_mut::<RequestContext>() {
        context.user_id = Some(user_id);
    } else {
        request.extensions_mut().insert(RequestContext {
            request_id: String::new(),
            user_id: Some(user_id),
        });
    }

    Ok(next.run(request).await)
}

fn extract_identity(headers: &HeaderMap, header: &HeaderName) -> Option<Uuid> {
    headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value.trim()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn parses_valid_identity() {
        let id = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        let header = HeaderName::from_static("x-user-id");
        headers.insert(&header, HeaderValue::from_str(&id.to_string()).unwrap());
        assert_eq!(extract_identity(&headers, &header), Some(id));
    }

    #[test]
    fn rejects_non_uuid_identity() {
        let mut headers = HeaderMap::new();
        let header = HeaderName::from_static("x-user-id");
        headers.insert(&header, HeaderValue::from_static("alice"));
        assert_eq!(extract_identity(&headers, &header), None);
    }

    #[test]
    fn missing_header_yields_none() {
        let headers = HeaderMap::new();
        let header = HeaderName::from_static("x-user-id");
        assert_eq!(extract_identity(&headers, &header), None);
    }
}
