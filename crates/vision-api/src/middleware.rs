use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use tracing::debug;

use vision_types::ChatError;

use crate::{ApiError, AppState};

/// Verify the bearer token and attach its `Claims` to the request.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let bearer = req
        .headers()
        .typed_get::<Authorization<Bearer>>()
        .ok_or(ApiError(ChatError::Unauthenticated))?;

    let claims = state.dispatcher.verify_token(bearer.token()).map_err(|e| {
        debug!("Rejected {} {}: {}", req.method(), req.uri().path(), e);
        ApiError::from(ChatError::from(e))
    })?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}
