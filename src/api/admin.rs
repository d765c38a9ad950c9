use axum::Json;
use axum::extract::{Path, State};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::accounting::UserUsageSummary;
use crate::accounting::store::user_usage_summaries;
use crate::auth::users;
use crate::error::AppError;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    #[serde(default)]
    pub label: String,
    /// Empty means unrestricted.
    #[serde(default)]
    pub scope: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub name: String,
}

/// Omitted fields keep their current value.
#[derive(Debug, Deserialize)]
pub struct UpdateApiKeyRequest {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreatedApiKeyResponse {
    pub id: String,
    pub user_id: String,
    pub key_prefix: String,
    pub label: String,
    pub scope: String,
    pub created_at: String,
    /// The full plaintext key. Shown exactly once.
    pub plaintext: String,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct UsageSummaryResponse {
    pub data: Vec<UserUsageSummary>,
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub generation: u64,
    pub models: usize,
}

// ---------------------------------------------------------------------------
// User management
// ---------------------------------------------------------------------------

/// POST /admin/users
pub async fn create_user(
    State(state): State<AppState>,
    Json(body): Json<CreateUserRequest>,
) -> Result<Json<users::User>, AppError> {
    let created = users::create_user(&state.db, &body.name)?;
    tracing::info!(user_id = %created.id, name = %created.name, "User created");
    Ok(Json(created))
}

/// GET /admin/users
pub async fn list_users(State(state): State<AppState>) -> Result<Json<Vec<users::User>>, AppError> {
    Ok(Json(users::list_users(&state.db)?))
}

/// PATCH /admin/users/{id}
pub async fn rename_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateUserRequest>,
) -> Result<Json<users::User>, AppError> {
    Ok(Json(users::rename_user(&state.db, &id, &body.name)?))
}

/// DELETE /admin/users/{id}
///
/// The user's keys go with them and stop authenticating at once.
pub async fn delete_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeletedResponse>, AppError> {
    for digest in users::delete_user(&state.db, &id)? {
        state.validator.invalidate(&digest);
    }
    Ok(Json(DeletedResponse { deleted: true }))
}

// ---------------------------------------------------------------------------
// API key management
// ---------------------------------------------------------------------------

/// POST /admin/users/{id}/keys
pub async fn create_api_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CreateApiKeyRequest>,
) -> Result<Json<CreatedApiKeyResponse>, AppError> {
    let created = users::create_api_key(&state.db, &id, &body.label, &body.scope)?;
    tracing::info!(user_id = %id, key_id = %created.info.id, scope = %created.info.scope, "API key created");

    Ok(Json(CreatedApiKeyResponse {
        id: created.info.id,
        user_id: created.info.user_id,
        key_prefix: created.info.key_prefix,
        label: created.info.label,
        scope: created.info.scope,
        created_at: created.info.created_at,
        plaintext: created.plaintext,
    }))
}

/// GET /admin/users/{id}/keys
pub async fn list_api_keys(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<users::ApiKeyInfo>>, AppError> {
    Ok(Json(users::list_api_keys(&state.db, &id)?))
}

/// DELETE /admin/keys/{id}
pub async fn revoke_api_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeletedResponse>, AppError> {
    let digest = users::revoke_api_key(&state.db, &id)?;
    state.validator.invalidate(&digest);
    tracing::info!(key_id = %id, "API key revoked");
    Ok(Json(DeletedResponse { deleted: true }))
}

/// PATCH /admin/keys/{id}
///
/// A new scope applies from the key's next request.
pub async fn update_api_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateApiKeyRequest>,
) -> Result<Json<users::ApiKeyInfo>, AppError> {
    let (info, digest) = users::update_api_key(
        &state.db,
        &id,
        body.label.as_deref(),
        body.scope.as_deref(),
    )?;
    state.validator.invalidate(&digest);
    Ok(Json(info))
}

// ---------------------------------------------------------------------------
// Usage and registry
// ---------------------------------------------------------------------------

/// GET /admin/usage
pub async fn usage_summary(
    State(state): State<AppState>,
) -> Result<Json<UsageSummaryResponse>, AppError> {
    let data = user_usage_summaries(&state.db)?;
    Ok(Json(UsageSummaryResponse { data }))
}

/// POST /admin/reload
///
/// Re-reads the config file and swaps the model registry. A failing reload
/// keeps the current table.
pub async fn reload_registry(
    State(state): State<AppState>,
) -> Result<Json<ReloadResponse>, AppError> {
    let generation = state
        .registry
        .reload_from_path(&state.config_path)
        .map_err(|e| {
            tracing::error!(error = %e, "Registry reload failed; keeping current table");
            AppError::Internal(format!("registry reload failed: {e}"))
        })?;
    Ok(Json(ReloadResponse {
        generation,
        models: state.registry.snapshot().len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_key_request_defaults() {
        let body: CreateApiKeyRequest = serde_json::from_str("{}").unwrap();
        assert!(body.label.is_empty());
        assert!(body.scope.is_empty());
    }

    #[tokio::test]
    async fn test_reload_swaps_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(
            &path,
            r#"
[[providers]]
name = "local"
family = "openai"
base_url = "http://127.0.0.1:9"

[[models]]
name = "local-model"
provider = "local"
"#,
        )
        .unwrap();

        let mut state = crate::test_support::test_state();
        state.config_path = path;
        let before = state.registry.generation();

        let Json(reloaded) = reload_registry(State(state.clone())).await.unwrap();
        assert_eq!(reloaded.models, 1);
        assert!(reloaded.generation > before);
        assert!(state.registry.resolve("local-model").is_ok());
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "[[models]]\nname = \"x\"\nprovider = \"missing\"\n").unwrap();

        let mut state = crate::test_support::test_state();
        state.config_path = path;
        let before = state.registry.generation();

        let err = reload_registry(State(state.clone())).await.unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
        assert_eq!(state.registry.generation(), before);
    }
}
