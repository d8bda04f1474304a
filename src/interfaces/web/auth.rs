use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request, header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use tracing::debug;

use super::AppState;
use super::error::ApiError;
use crate::core::error::CoreError;

pub(crate) const APP_ID_FIELD: &str = "app_id";
pub(crate) const TOKEN_FIELD: &str = "token";

const FORM_LIMIT: usize = 1024 * 1024;

/// Caller address: the peer socket, or the first `x-forwarded-for` hop when proxies are trusted.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClientIp(pub Option<String>);

#[derive(Debug, Default)]
struct Credentials {
    app_id: Option<String>,
    token: Option<String>,
}

impl Credentials {
    fn complete(&self) -> bool {
        self.app_id.is_some() && self.token.is_some()
    }

    fn fill_from_headers(&mut self, headers: &HeaderMap) {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };
        self.app_id = self.app_id.take().or_else(|| get(APP_ID_FIELD));
        self.token = self.token.take().or_else(|| get(TOKEN_FIELD));
    }

    fn fill_from_fields(&mut self, raw: &[u8]) {
        for (key, value) in url::form_urlencoded::parse(raw) {
            if value.trim().is_empty() {
                continue;
            }
            match &*key {
                APP_ID_FIELD if self.app_id.is_none() => self.app_id = Some(value.into_owned()),
                TOKEN_FIELD if self.token.is_none() => self.token = Some(value.into_owned()),
                _ => {}
            }
        }
    }
}

fn is_form(parts: &Parts) -> bool {
    parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"))
}

fn client_ip(parts: &Parts, trust_forwarded: bool) -> ClientIp {
    let forwarded = parts
        .headers
        .get("x-forwarded-for")
        .filter(|_| trust_forwarded)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from);
    let peer = || {
        parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip().to_string())
    };
    ClientIp(forwarded.or_else(peer))
}

/// Resolves `app_id` and `token` (headers, then query string, then form body) to an
/// identity and stores it, with the client address, in the request extensions.
pub async fn require_identity(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let (mut parts, mut body) = req.into_parts();

    let mut creds = Credentials::default();
    creds.fill_from_headers(&parts.headers);
    if let Some(query) = parts.uri.query() {
        creds.fill_from_fields(query.as_bytes());
    }
    if !creds.complete() && is_form(&parts) {
        let bytes = match axum::body::to_bytes(body, FORM_LIMIT).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return ApiError(CoreError::Validation(format!("Unreadable form body: {}", e))).into_response();
            }
        };
        creds.fill_from_fields(&bytes);
        body = Body::from(bytes);
    }

    let (Some(app_id), Some(token)) = (creds.app_id, creds.token) else {
        debug!("Request to {} carries no credentials", parts.uri.path());
        return ApiError(CoreError::authentication_failed()).into_response();
    };

    match state.authenticator.authenticate(&app_id, &token).await {
        Ok(identity) => {
            let ip = client_ip(&parts, state.trust_forwarded);
            parts.extensions.insert(identity);
            parts.extensions.insert(ip);
            next.run(Request::from_parts(parts, body)).await
        }
        Err(e) => ApiError(e).into_response(),
    }
}
