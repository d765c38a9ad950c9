pub mod admin;
pub mod chat;
pub mod health;
pub mod models;

use axum::Router;
use axum::middleware;
use axum::routing::{get, patch, post};

use crate::AppState;
use crate::auth::middleware::{require_admin, require_auth};

/// Build the full API router with all endpoint groups.
///
/// Route layout:
/// ```text
/// /health                        GET    (no auth)
/// /v1/chat/completions           POST   (auth required)
/// /v1/models                     GET    (auth required)
/// /v1/models/{model}             GET    (auth required)
/// /admin/users                   POST   (admin)
/// /admin/users                   GET    (admin)
/// /admin/users/{id}              PATCH  (admin)
/// /admin/users/{id}              DELETE (admin)
/// /admin/users/{id}/keys         POST   (admin)
/// /admin/users/{id}/keys         GET    (admin)
/// /admin/keys/{id}               PATCH  (admin)
/// /admin/keys/{id}               DELETE (admin)
/// /admin/usage                   GET    (admin)
/// /admin/reload                  POST   (admin)
/// ```
pub fn build_api_router(state: AppState) -> Router<AppState> {
    let admin_routes = Router::new()
        .route("/users", post(admin::create_user).get(admin::list_users))
        .route(
            "/users/{id}",
            patch(admin::rename_user).delete(admin::delete_user),
        )
        .route(
            "/users/{id}/keys",
            post(admin::create_api_key).get(admin::list_api_keys),
        )
        .route(
            "/keys/{id}",
            patch(admin::update_api_key).delete(admin::revoke_api_key),
        )
        .route("/usage", get(admin::usage_summary))
        .route("/reload", post(admin::reload_registry))
        .layer(middleware::from_fn(require_admin));

    let authed = Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/models", get(models::list_models))
        .route("/v1/models/{model}", get(models::get_model))
        .nest("/admin", admin_routes)
        .layer(middleware::from_fn_with_state(state, require_auth));

    Router::new()
        .route("/health", get(health::health_check))
        .merge(authed)
}
