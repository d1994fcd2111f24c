//! HTTP routes

pub mod health;
pub mod sync;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
    routing::get,
    Router,
};

use crate::error::AppError;
use crate::state::AppState;

/// Header carrying the authenticated user, set by the auth layer in front of us
pub const USER_HEADER: &str = "x-user-id";

/// Header naming the calling device when the body does not
pub const DEVICE_HEADER: &str = "x-device-id";

/// Authenticated caller of a sync endpoint
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub device_id: Option<String>,
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let user_id = header(USER_HEADER)
            .ok_or_else(|| AppError::Unauthorized(format!("missing {} header", USER_HEADER)))?;

        Ok(Caller {
            user_id,
            device_id: header(DEVICE_HEADER),
        })
    }
}

/// Every route the server exposes, without middleware
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/health", get(health::health_check))
        .nest("/api/v1/sync", sync::router())
}
