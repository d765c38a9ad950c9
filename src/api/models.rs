use axum::Extension;
use axum::Json;
use axum::extract::{Path, State};
use chrono::Utc;

use crate::AppState;
use crate::auth::{CallerIdentity, Operation};
use crate::error::AppError;
use crate::providers::ProviderBinding;
use crate::providers::types::{ModelObject, ModelsResponse};

fn model_object(id: &str, binding: &ProviderBinding, created: i64) -> ModelObject {
    ModelObject {
        id: id.to_string(),
        object: "model".to_string(),
        created,
        owned_by: binding.provider.clone(),
    }
}

/// GET /v1/models
///
/// Lists the public model ids of the current registry snapshot.
pub async fn list_models(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
) -> Result<Json<ModelsResponse>, AppError> {
    identity.authorize(Operation::ListModels)?;

    let now = Utc::now().timestamp();
    let table = state.registry.snapshot();
    let data = table
        .models()
        .map(|binding| model_object(&binding.model, binding, now))
        .collect();

    Ok(Json(ModelsResponse {
        object: "list".to_string(),
        data,
    }))
}

/// GET /v1/models/{model}
pub async fn get_model(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
    Path(model): Path<String>,
) -> Result<Json<ModelObject>, AppError> {
    identity.authorize(Operation::ListModels)?;
    let binding = state.registry.resolve(&model)?;
    Ok(Json(model_object(&model, &binding, Utc::now().timestamp())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderFamily;

    #[test]
    fn test_model_object_format() {
        let mut binding = ProviderBinding::new("claude-sonnet", ProviderFamily::Anthropic, "https://x");
        binding.provider = "anthropic-direct".into();
        let json = serde_json::to_value(model_object("sonnet", &binding, 1_700_000_000)).unwrap();
        assert_eq!(json["id"], "sonnet");
        assert_eq!(json["object"], "model");
        assert_eq!(json["owned_by"], "anthropic-direct");
    }
}
