//! Whitelist management endpoints.

use std::net::SocketAddr;

use axum::{
    extract::{rejection::FormRejection, rejection::QueryRejection, FromRequestParts, Query, State},
    http::{header::WWW_AUTHENTICATE, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Form, Json, Router,
};
use serde::Serialize;
use tracing::{error, info, warn};

use super::auth::REALM;
use super::AdminState;

/// Caller address recovered from the PROXY v2 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

impl<S> FromRequestParts<S> for ClientAddr
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<ClientAddr>()
            .copied()
            .ok_or_else(|| ApiError::internal("Client address unavailable"))
    }
}

/// JSON error body: `{"error": .., "message": ..}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: code.to_string(),
                message: message.into(),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.body)).into_response();
        if self.status == StatusCode::UNAUTHORIZED {
            let challenge = format!("Basic realm=\"{REALM}\"");
            if let Ok(value) = HeaderValue::from_str(&challenge) {
                response.headers_mut().insert(WWW_AUTHENTICATE, value);
            }
        }
        response
    }
}

/// `GET /` response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct IndexResponse {
    pub whitelist: Vec<String>,
    /// Caller address, or empty when the caller is already listed.
    pub remoteaddr: String,
}

/// `POST /` parameters. `add` and `remove` may repeat (`add=a&add=b` or
/// `add[]=a&add[]=b`).
#[derive(Debug, Default, PartialEq, Eq)]
pub struct WhitelistChange {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

impl WhitelistChange {
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut change = Self::default();
        for (key, value) in pairs {
            if value.trim().is_empty() {
                continue;
            }
            match key.strip_suffix("[]").unwrap_or(&key) {
                "add" => change.add.push(value),
                "remove" => change.remove.push(value),
                _ => {}
            }
        }
        change
    }

    /// Body values take precedence over the query string, per parameter.
    fn merge(self, fallback: WhitelistChange) -> Self {
        Self {
            add: if self.add.is_empty() { fallback.add } else { self.add },
            remove: if self.remove.is_empty() {
                fallback.remove
            } else {
                self.remove
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct Success {
    pub success: bool,
}

pub fn routes() -> Router<AdminState> {
    Router::new().route("/", get(index).post(update))
}

async fn index(State(state): State<AdminState>, ClientAddr(client): ClientAddr) -> Json<IndexResponse> {
    let remote = client.ip().to_canonical().to_string();
    let whitelist = state.whitelist();
    let remoteaddr = if whitelist.contains(&remote) {
        String::new()
    } else {
        remote
    };

    Json(IndexResponse {
        whitelist: whitelist.all(),
        remoteaddr,
    })
}

async fn update(
    State(state): State<AdminState>,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
    form: Result<Form<Vec<(String, String)>>, FormRejection>,
) -> Json<Success> {
    let query = match query {
        Ok(Query(pairs)) => pairs,
        Err(rejection) => {
            warn!(error = %rejection, "Ignoring malformed query string");
            Vec::new()
        }
    };
    let form = match form {
        Ok(Form(pairs)) => pairs,
        Err(FormRejection::InvalidFormContentType(_)) => Vec::new(),
        Err(rejection) => {
            warn!(error = %rejection, "Ignoring malformed form body");
            Vec::new()
        }
    };
    let change = WhitelistChange::from_pairs(form).merge(WhitelistChange::from_pairs(query));

    let whitelist = state.whitelist();
    let changed = if !change.add.is_empty() {
        let changed = whitelist.add_all(&change.add);
        if changed {
            info!(addresses = ?change.add, "Whitelist entries added");
        }
        changed
    } else {
        let mut changed = false;
        for address in &change.remove {
            if whitelist.remove(address.trim()) {
                info!(address = %address.trim(), "Whitelist entry removed");
                changed = true;
            }
        }
        changed
    };

    if changed && state.persist() {
        if let Err(e) = whitelist.sync() {
            error!(error = %e, "Failed to persist whitelist");
        }
    }

    Json(Success { success: true })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_change_collects_repeated_and_bracketed_keys() {
        let change = WhitelistChange::from_pairs(pairs(&[
            ("add", "10.0.0.1"),
            ("add[]", "10.0.0.2"),
            ("add", " "),
            ("remove", "10.0.0.3"),
            ("other", "x"),
        ]));
        assert_eq!(change.add, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(change.remove, vec!["10.0.0.3"]);
    }

    #[test]
    fn test_body_overrides_query_per_parameter() {
        let body = WhitelistChange::from_pairs(pairs(&[("add", "10.0.0.1")]));
        let query = WhitelistChange::from_pairs(pairs(&[("add", "10.0.0.9"), ("remove", "10.0.0.2")]));
        let change = body.merge(query);
        assert_eq!(change.add, vec!["10.0.0.1"]);
        assert_eq!(change.remove, vec!["10.0.0.2"]);
    }
}
