//! HTTP Basic authentication for the admin API.

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderValue},
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::debug;

use super::api::ApiError;
use super::AdminState;

/// Realm sent with `WWW-Authenticate`.
pub const REALM: &str = "onedoor admin";

/// Admin username and password.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Check an `Authorization` header value.
    pub fn verify(&self, header: Option<&HeaderValue>) -> bool {
        let Some((username, password)) = header.and_then(parse_basic) else {
            return false;
        };
        username == self.username && password == self.password
    }

    /// `Authorization` header value for these credentials.
    pub fn header_value(&self) -> String {
        let encoded = STANDARD.encode(format!("{}:{}", self.username, self.password));
        format!("Basic {encoded}")
    }
}

/// Decode `Basic base64(user:pass)`.
pub fn parse_basic(header: &HeaderValue) -> Option<(String, String)> {
    let value = header.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Reject requests without valid credentials.
pub async fn require_basic_auth(
    State(state): State<AdminState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.credentials().verify(request.headers().get(AUTHORIZATION)) {
        debug!(uri = %request.uri(), "Admin request without valid credentials");
        return Err(ApiError::unauthorized("Authentication required"));
    }
    Ok(next.run(request).await)
}
