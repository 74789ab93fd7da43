use crate::AppState;
use crate::utils::auth::validate_jwt;
use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};
use serde::Deserialize;

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Bearer header first; export links fall back to `?token=`.
fn request_token(req: &Request) -> Option<String> {
    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::to_owned);

    bearer.or_else(|| {
        let query = req.uri().query()?;
        serde_urlencoded::from_str::<TokenQuery>(query).ok()?.token
    })
}

/// Puts the validated [`Claims`](crate::utils::auth::Claims) into the request
/// extensions or answers 401.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = request_token(&req).ok_or(StatusCode::UNAUTHORIZED)?;

    let claims = validate_jwt(&token, &state.jwt_secret).map_err(|e| {
        tracing::debug!(path = %req.uri().path(), "🔒 Rejected token: {}", e);
        StatusCode::UNAUTHORIZED
    })?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}
