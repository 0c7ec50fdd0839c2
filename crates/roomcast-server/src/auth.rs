//! Bearer token authentication.
//!
//! [`require_principal`] runs in front of the WebSocket route. It reads the
//! token from `Authorization: Bearer <token>`, or from the `token` query
//! parameter on WebSocket upgrades (browsers cannot set headers there), and
//! attaches the authenticated [`Principal`] to the request.

use async_trait::async_trait;
use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// The authenticated account behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Account ID.
    pub id: String,
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token was presented.
    #[error("Missing bearer token")]
    MissingToken,

    /// The token is not recognized.
    #[error("Invalid token")]
    InvalidToken,
}

/// Resolves bearer tokens to principals.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticate `token`.
    async fn authenticate(&self, token: &str) -> Result<Principal, AuthError>;
}

/// Authenticator backed by a fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    /// Create an authenticator accepting `tokens` (token -> principal ID).
    #[must_use]
    pub fn new(tokens: HashMap<String, String>) -> Self {
        if tokens.is_empty() {
            warn!("No auth tokens configured, every connection will be rejected");
        }
        Self { tokens }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
        self.tokens
            .get(token)
            .map(|id| Principal { id: id.clone() })
            .ok_or(AuthError::InvalidToken)
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Middleware that rejects unauthenticated requests with `401` and attaches
/// the [`Principal`] to authenticated ones.
pub async fn require_principal(
    State(authenticator): State<Arc<dyn Authenticator>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = request_token(&request) else {
        return unauthorized(&AuthError::MissingToken);
    };

    match authenticator.authenticate(&token).await {
        Ok(principal) => {
            debug!(principal = %principal.id, "Request authenticated");
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(e) => unauthorized(&e),
    }
}

fn request_token(request: &Request) -> Option<String> {
    if let Some(token) = bearer_token(request.headers()) {
        return Some(token.to_string());
    }
    if !is_websocket_upgrade(request.headers()) {
        return None;
    }
    Query::<TokenQuery>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(query)| query.token)
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

fn unauthorized(error: &AuthError) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": error.to_string() })),
    )
        .into_response()
}
