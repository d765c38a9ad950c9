pub mod keys;
pub mod middleware;
pub mod users;
pub mod validator;

use serde::Serialize;

use crate::error::AppError;

pub use self::validator::{CredentialStore, CredentialValidator};

/// Authenticated caller attached to request extensions by the auth
/// middleware.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallerIdentity {
    pub user_id: String,
    pub user_name: String,
    pub api_key_id: String,
    pub scope: Scope,
}

impl CallerIdentity {
    /// `Forbidden` unless the key's scope covers `operation`.
    pub fn authorize(&self, operation: Operation<'_>) -> Result<(), AppError> {
        if self.scope.allows(operation) {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "API key scope '{}' does not permit {operation}",
                self.scope
            )))
        }
    }
}

/// What a request is trying to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation<'a> {
    ChatCompletion { model: &'a str },
    ListModels,
    Admin,
}

impl std::fmt::Display for Operation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChatCompletion { model } => write!(f, "chat completions with model '{model}'"),
            Self::ListModels => f.write_str("listing models"),
            Self::Admin => f.write_str("administration"),
        }
    }
}

/// One permission in a key's scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub enum Grant {
    Admin,
    Chat,
    Models,
    Model(String),
}

impl From<Grant> for String {
    fn from(grant: Grant) -> Self {
        match grant {
            Grant::Admin => "admin".to_string(),
            Grant::Chat => "chat".to_string(),
            Grant::Models => "models".to_string(),
            Grant::Model(id) => format!("model:{id}"),
        }
    }
}

/// Permission scope of an API key.
///
/// Grants are separated by commas or whitespace. An empty scope is
/// unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub struct Scope {
    grants: Vec<Grant>,
}

impl Scope {
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let mut grants = Vec::new();
        for token in raw
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
        {
            let grant = match token {
                "admin" => Grant::Admin,
                "chat" => Grant::Chat,
                "models" => Grant::Models,
                _ => match token.strip_prefix("model:") {
                    Some(id) if !id.is_empty() => Grant::Model(id.to_string()),
                    _ => {
                        return Err(AppError::BadRequest(format!(
                            "Invalid scope grant '{token}': expected admin, chat, models or model:<id>"
                        )));
                    }
                },
            };
            if !grants.contains(&grant) {
                grants.push(grant);
            }
        }
        Ok(Self { grants })
    }

    pub fn is_unrestricted(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn allows(&self, operation: Operation<'_>) -> bool {
        if self.is_unrestricted() || self.grants.contains(&Grant::Admin) {
            return true;
        }
        match operation {
            Operation::Admin => false,
            Operation::ListModels => self.grants.contains(&Grant::Models),
            Operation::ChatCompletion { model } => self.grants.iter().any(|g| match g {
                Grant::Chat => true,
                Grant::Model(id) => id == model,
                _ => false,
            }),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.grants.iter().cloned().map(String::from).collect();
        f.write_str(&parts.join(","))
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(model: &str) -> Operation<'_> {
        Operation::ChatCompletion { model }
    }

    #[test]
    fn test_empty_scope_is_unrestricted() {
        let scope = Scope::parse("  ").unwrap();
        assert!(scope.is_unrestricted());
        assert!(scope.allows(Operation::Admin));
        assert!(scope.allows(chat("anything")));
    }

    #[test]
    fn test_model_grant_is_exact() {
        let scope = Scope::parse("model:gpt-4.1, models").unwrap();
        assert!(scope.allows(chat("gpt-4.1")));
        assert!(!scope.allows(chat("gpt-4.1-mini")));
        assert!(scope.allows(Operation::ListModels));
        assert!(!scope.allows(Operation::Admin));
    }

    #[test]
    fn test_chat_grant_excludes_listing() {
        let scope = Scope::parse("chat").unwrap();
        assert!(scope.allows(chat("m")));
        assert!(!scope.allows(Operation::ListModels));
    }

    #[test]
    fn test_admin_grant_allows_everything() {
        let scope = Scope::parse("admin").unwrap();
        assert!(scope.allows(chat("m")));
        assert!(scope.allows(Operation::ListModels));
    }

    #[test]
    fn test_invalid_grant_rejected() {
        assert!(Scope::parse("root").is_err());
        assert!(Scope::parse("model:").is_err());
    }

    #[test]
    fn test_scope_display_normalizes() {
        let scope = Scope::parse("chat  models,chat").unwrap();
        assert_eq!(scope.to_string(), "chat,models");
        assert_eq!(Scope::parse(&scope.to_string()).unwrap(), scope);
    }

    #[test]
    fn test_authorize_forbidden_message() {
        let identity = CallerIdentity {
            user_id: "u".into(),
            user_name: "alice".into(),
            api_key_id: "k".into(),
            scope: Scope::parse("model:a").unwrap(),
        };
        let err = identity.authorize(chat("b")).unwrap_err();
        assert!(matches!(err, AppError::Forbidden(m) if m.contains("'b'")));
    }
}
