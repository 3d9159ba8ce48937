// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Resolves the owning user of a control-plane socket.
//!
//! Browsers cannot set headers on a WebSocket upgrade, so credentials are
//! also accepted as `api_key` / `access_token` query parameters.

use axum::{
    extract::Request,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use url::form_urlencoded;

/// Authentication context attached to each authenticated request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// Owner of every connection opened through this request's socket
    pub user_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication credentials")]
    MissingCredentials,

    #[error("Invalid authentication credentials")]
    InvalidCredentials,

    #[error("JWT token validation failed: {0}")]
    JwtValidation(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, self.to_string()).into_response()
    }
}

/// JWT claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Authenticator trait for pluggable auth strategies
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, AuthError>;
}

/// API Key authenticator
pub struct ApiKeyAuth {
    /// API key -> user_id
    keys: HashMap<String, String>,
}

impl ApiKeyAuth {
    pub fn new(api_keys: Vec<String>) -> Self {
        let mut keys = HashMap::new();

        for key_config in api_keys {
            // Format: "api_key:user_id"
            if let Some((key, user)) = key_config.split_once(':') {
                if !key.is_empty() && !user.is_empty() {
                    keys.insert(key.to_string(), user.to_string());
                }
            } else {
                tracing::warn!("Ignoring malformed API key entry (expected key:user_id)");
            }
        }

        Self { keys }
    }
}

impl Authenticator for ApiKeyAuth {
    fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, AuthError> {
        let api_key = headers
            .get("X-API-Key")
            .and_then(|h| h.to_str().ok())
            .ok_or(AuthError::MissingCredentials)?;

        let user_id = self.keys.get(api_key).ok_or(AuthError::InvalidCredentials)?;

        Ok(AuthContext {
            user_id: user_id.clone(),
        })
    }
}

/// Bearer token (JWT) authenticator
pub struct BearerTokenAuth {
    jwt_secret: Vec<u8>,
}

impl BearerTokenAuth {
    pub fn new(jwt_secret: String) -> Self {
        Self {
            jwt_secret: jwt_secret.into_bytes(),
        }
    }
}

impl Authenticator for BearerTokenAuth {
    fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, AuthError> {
        let auth_header = headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or(AuthError::MissingCredentials)?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or(AuthError::MissingCredentials)?;

        let token_data = jsonwebtoken::decode::<Claims>(
            token,
            &jsonwebtoken::DecodingKey::from_secret(&self.jwt_secret),
            &jsonwebtoken::Validation::default(),
        )
        .map_err(|e| AuthError::JwtValidation(e.to_string()))?;

        Ok(AuthContext {
            user_id: token_data.claims.sub,
        })
    }
}

/// Multi-strategy authenticator (tries multiple auth methods)
pub struct MultiAuth {
    strategies: Vec<Arc<dyn Authenticator>>,
}

impl MultiAuth {
    pub fn new(strategies: Vec<Arc<dyn Authenticator>>) -> Self {
        Self { strategies }
    }
}

impl Authenticator for MultiAuth {
    fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, AuthError> {
        for strategy in &self.strategies {
            if let Ok(ctx) = strategy.authenticate(headers) {
                return Ok(ctx);
            }
        }
        Err(AuthError::InvalidCredentials)
    }
}

/// Single-user mode: every request belongs to the same owner
pub struct NoAuth {
    default_user_id: String,
}

impl NoAuth {
    pub fn new(default_user_id: impl Into<String>) -> Self {
        Self {
            default_user_id: default_user_id.into(),
        }
    }
}

impl Authenticator for NoAuth {
    fn authenticate(&self, _headers: &HeaderMap) -> Result<AuthContext, AuthError> {
        Ok(AuthContext {
            user_id: self.default_user_id.clone(),
        })
    }
}

/// Authentication middleware
pub async fn auth_middleware(
    auth: axum::Extension<Arc<dyn Authenticator>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    match auth.authenticate(req.headers()) {
        Ok(ctx) => {
            req.extensions_mut().insert(ctx);
            Ok(next.run(req).await)
        }
        Err(primary_err) => {
            if let Some(headers) = credentials_from_query(req.uri()) {
                if let Ok(ctx) = auth.authenticate(&headers) {
                    req.extensions_mut().insert(ctx);
                    return Ok(next.run(req).await);
                }
            }

            Err(primary_err)
        }
    }
}

/// Rebuilds credential headers from `api_key` or `access_token` query params.
fn credentials_from_query(uri: &axum::http::Uri) -> Option<HeaderMap> {
    let query = uri.query()?;
    let mut headers = HeaderMap::new();

    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        match key.to_ascii_lowercase().as_str() {
            "api_key" | "x-api-key" => {
                if let Ok(value) = HeaderValue::from_str(&value) {
                    headers.insert("X-API-Key", value);
                }
            }
            "access_token" | "token" => {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", value)) {
                    headers.insert(header::AUTHORIZATION, value);
                }
            }
            _ => {}
        }
    }

    (!headers.is_empty()).then_some(headers)
}
