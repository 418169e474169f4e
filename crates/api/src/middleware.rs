use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use canopy_core::UserId;

use crate::app::errors::json_error;
use crate::context::UserContext;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const CALLBACK_TOKEN_HEADER: &str = "x-callback-token";

/// Require `x-user-id` and expose it as a [`UserContext`] extension.
pub async fn user_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let user_id = extract_user_id(req.headers())?;
    req.extensions_mut().insert(UserContext::new(user_id));
    Ok(next.run(req).await)
}

fn extract_user_id(headers: &HeaderMap) -> Result<UserId, Response> {
    let header = headers.get(USER_ID_HEADER).ok_or_else(|| {
        json_error(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing x-user-id header",
        )
    })?;

    header
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<UserId>().ok())
        .ok_or_else(|| {
            json_error(
                StatusCode::BAD_REQUEST,
                "invalid_user_id",
                "x-user-id must be a UUID",
            )
        })
}

#[derive(Clone)]
pub struct CallbackAuth {
    /// Shared secret; `None` accepts every callback.
    pub token: Option<String>,
}

/// Check the processing service's shared secret on inbound callbacks.
pub async fn callback_token_middleware(
    State(auth): State<CallbackAuth>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    if let Some(expected) = auth.token.as_deref() {
        let presented = req
            .headers()
            .get(CALLBACK_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected) {
            return Err(json_error(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "invalid callback token",
            ));
        }
    }
    Ok(next.run(req).await)
}
