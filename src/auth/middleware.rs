use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::AppState;
use crate::auth::{CallerIdentity, Operation};
use crate::error::AppError;

/// Axum middleware that extracts a Bearer token from the Authorization header,
/// resolves it through the credential validator, and injects the
/// [`CallerIdentity`] into request extensions.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(&request)?;
    let identity = state.validator.authenticate(&token).await?;

    tracing::debug!(
        user_id = %identity.user_id,
        name = %identity.user_name,
        key_id = %identity.api_key_id,
        "Authenticated request"
    );

    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

/// Axum middleware that requires an `admin`-capable scope.
///
/// Must be applied _after_ `require_auth` so that `CallerIdentity` is present
/// in request extensions.
pub async fn require_admin(request: Request, next: Next) -> Result<Response, AppError> {
    let identity = request.extensions().get::<CallerIdentity>().ok_or_else(|| {
        AppError::Internal("CallerIdentity missing from extensions -- is require_auth applied?".to_string())
    })?;
    identity.authorize(Operation::Admin)?;
    Ok(next.run(request).await)
}

/// Extract the Bearer token from the Authorization header.
fn extract_bearer_token(request: &Request) -> Result<String, AppError> {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .ok_or_else(|| AppError::Unauthorized("Missing Authorization header".to_string()))?;

    let value = header
        .to_str()
        .map_err(|_| AppError::Unauthorized("Invalid Authorization header encoding".to_string()))?;

    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| {
            AppError::Unauthorized("Authorization header must use Bearer scheme".to_string())
        })?
        .trim();

    if token.is_empty() {
        return Err(AppError::Unauthorized("Empty Bearer token".to_string()));
    }

    Ok(token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode, header};
    use axum::middleware;
    use axum::routing::get;
    use tower::ServiceExt;

    use crate::auth::users::{create_api_key, create_user};
    use crate::test_support::test_state;

    async fn whoami(request: Request) -> String {
        let identity = request.extensions().get::<CallerIdentity>().unwrap();
        identity.user_name.clone()
    }

    fn auth_router(state: AppState) -> Router {
        Router::new()
            .route("/whoami", get(whoami))
            .layer(middleware::from_fn_with_state(state.clone(), require_auth))
            .with_state(state)
    }

    fn admin_router(state: AppState) -> Router {
        Router::new()
            .route("/admin", get(|| async { "ok" }))
            .layer(middleware::from_fn(require_admin))
            .layer(middleware::from_fn_with_state(state.clone(), require_auth))
            .with_state(state)
    }

    fn get_with_token(uri: &str, token: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_extract_bearer_token_valid() {
        let req = HttpRequest::builder()
            .header(header::AUTHORIZATION, "Bearer   sk-gw-abc123   ")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&req).unwrap(), "sk-gw-abc123");
    }

    #[test]
    fn test_extract_bearer_token_wrong_scheme() {
        let req = HttpRequest::builder()
            .header(header::AUTHORIZATION, "Basic dXNlcjpwYXNz")
            .body(Body::empty())
            .unwrap();
        assert!(matches!(
            extract_bearer_token(&req),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_extract_bearer_token_missing_or_empty() {
        let req = HttpRequest::builder().body(Body::empty()).unwrap();
        assert!(extract_bearer_token(&req).is_err());
        let req = HttpRequest::builder()
            .header(header::AUTHORIZATION, "Bearer ")
            .body(Body::empty())
            .unwrap();
        assert!(extract_bearer_token(&req).is_err());
    }

    #[tokio::test]
    async fn test_missing_and_invalid_tokens_are_401() {
        let state = test_state();
        let resp = auth_router(state.clone())
            .oneshot(get_with_token("/whoami", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = auth_router(state)
            .oneshot(get_with_token("/whoami", Some("sk-gw-invalid")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_valid_auth() {
        let state = test_state();
        let user = create_user(&state.db, "alice").unwrap();
        let key = create_api_key(&state.db, &user.id, "test", "").unwrap();

        let resp = auth_router(state)
            .oneshot(get_with_token("/whoami", Some(&key.plaintext)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"alice");
    }

    #[tokio::test]
    async fn test_admin_scope_required() {
        let state = test_state();
        let user = create_user(&state.db, "bob").unwrap();
        let chat_key = create_api_key(&state.db, &user.id, "", "chat").unwrap();
        let admin_key = create_api_key(&state.db, &user.id, "", "admin").unwrap();

        let resp = admin_router(state.clone())
            .oneshot(get_with_token("/admin", Some(&chat_key.plaintext)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = admin_router(state)
            .oneshot(get_with_token("/admin", Some(&admin_key.plaintext)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
