use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use uuid::Uuid;

use crate::auth::keys::{self, GeneratedKey};
use crate::auth::{CallerIdentity, Scope};
use crate::db::Database;
use crate::error::{AppError, StoreError};

/// Stored user record.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub created_at: String,
}

/// Stored API key metadata (never includes the digest or hash).
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyInfo {
    pub id: String,
    pub user_id: String,
    pub key_prefix: String,
    pub label: String,
    pub scope: String,
    pub created_at: String,
}

/// Result of creating a new API key: metadata plus the one-time plaintext.
#[derive(Debug)]
pub struct CreatedApiKey {
    pub info: ApiKeyInfo,
    pub plaintext: String,
}

/// Result of bootstrapping the first admin user.
#[derive(Debug)]
pub struct BootstrapResult {
    pub user: User,
    pub api_key_plaintext: String,
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
    })
}

fn key_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApiKeyInfo> {
    Ok(ApiKeyInfo {
        id: row.get(0)?,
        user_id: row.get(1)?,
        key_prefix: row.get(2)?,
        label: row.get(3)?,
        scope: row.get(4)?,
        created_at: row.get(5)?,
    })
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

pub fn create_user(db: &Database, name: &str) -> Result<User, AppError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("User name must not be empty".to_string()));
    }

    let id = Uuid::new_v4().to_string();
    let user = db
        .with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name) VALUES (?1, ?2)",
                params![id, name],
            )?;
            conn.query_row(
                "SELECT id, name, created_at FROM users WHERE id = ?1",
                params![id],
                user_from_row,
            )
        })
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                AppError::BadRequest(format!("User '{name}' already exists"))
            }
            other => other.into(),
        })?;

    tracing::info!(user_id = %user.id, name = %user.name, "User created");
    Ok(user)
}

pub fn list_users(db: &Database) -> Result<Vec<User>, AppError> {
    let users = db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT id, name, created_at FROM users ORDER BY created_at, name")?;
        let rows = stmt.query_map([], user_from_row)?;
        rows.collect::<Result<Vec<_>, _>>()
    })?;
    Ok(users)
}

pub fn get_user(db: &Database, user_id: &str) -> Result<User, AppError> {
    db.with_conn(|conn| {
        conn.query_row(
            "SELECT id, name, created_at FROM users WHERE id = ?1",
            params![user_id],
            user_from_row,
        )
        .optional()
    })?
    .ok_or_else(|| AppError::NotFound(format!("User '{user_id}' not found")))
}

pub fn rename_user(db: &Database, user_id: &str, name: &str) -> Result<User, AppError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("User name must not be empty".to_string()));
    }

    let user = db
        .with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET name = ?2 WHERE id = ?1",
                params![user_id, name],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            conn.query_row(
                "SELECT id, name, created_at FROM users WHERE id = ?1",
                params![user_id],
                user_from_row,
            )
            .map(Some)
        })
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                AppError::BadRequest(format!("User '{name}' already exists"))
            }
            other => other.into(),
        })?;

    let user = user.ok_or_else(|| AppError::NotFound(format!("User '{user_id}' not found")))?;
    tracing::info!(user_id = %user.id, name = %user.name, "User renamed");
    Ok(user)
}

/// Delete a user and, through the foreign key, every key they own. Returns
/// the digests of those keys. Usage records are kept.
pub fn delete_user(db: &Database, user_id: &str) -> Result<Vec<String>, AppError> {
    let deleted = db.with_conn_mut(|conn| {
        let tx = conn.transaction()?;
        let digests = {
            let mut stmt = tx.prepare("SELECT key_digest FROM api_keys WHERE user_id = ?1")?;
            let rows = stmt.query_map(params![user_id], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let changed = tx.execute("DELETE FROM users WHERE id = ?1", params![user_id])?;
        tx.commit()?;
        Ok((changed > 0).then_some(digests))
    })?;

    let digests =
        deleted.ok_or_else(|| AppError::NotFound(format!("User '{user_id}' not found")))?;
    tracing::info!(user_id = %user_id, keys = digests.len(), "User deleted");
    Ok(digests)
}

// ---------------------------------------------------------------------------
// API keys
// ---------------------------------------------------------------------------

/// Create a new API key for a user. `scope` is validated and stored in its
/// normalized form.
pub fn create_api_key(
    db: &Database,
    user_id: &str,
    label: &str,
    scope: &str,
) -> Result<CreatedApiKey, AppError> {
    get_user(db, user_id)?;
    let scope = Scope::parse(scope)?.to_string();

    let GeneratedKey {
        plaintext,
        digest,
        hash,
        prefix,
    } = keys::generate_api_key()
        .map_err(|e| AppError::Internal(format!("Failed to generate API key: {e}")))?;

    let key_id = Uuid::new_v4().to_string();
    let info = db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO api_keys (id, user_id, key_digest, key_hash, key_prefix, label, scope) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![key_id, user_id, digest, hash, prefix, label, scope],
        )?;
        conn.query_row(
            "SELECT id, user_id, key_prefix, label, scope, created_at FROM api_keys WHERE id = ?1",
            params![key_id],
            key_from_row,
        )
    })?;

    tracing::info!(
        key_id = %info.id,
        user_id = %user_id,
        prefix = %info.key_prefix,
        scope = %info.scope,
        "API key created"
    );
    Ok(CreatedApiKey { info, plaintext })
}

pub fn list_api_keys(db: &Database, user_id: &str) -> Result<Vec<ApiKeyInfo>, AppError> {
    get_user(db, user_id)?;
    let keys = db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, user_id, key_prefix, label, scope, created_at \
             FROM api_keys WHERE user_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![user_id], key_from_row)?;
        rows.collect::<Result<Vec<_>, _>>()
    })?;
    Ok(keys)
}

/// Delete a key. Returns its digest so cached identities can be dropped.
pub fn revoke_api_key(db: &Database, key_id: &str) -> Result<String, AppError> {
    let digest = db.with_conn(|conn| {
        let digest: Option<String> = conn
            .query_row(
                "SELECT key_digest FROM api_keys WHERE id = ?1",
                params![key_id],
                |row| row.get(0),
            )
            .optional()?;
        if digest.is_some() {
            conn.execute("DELETE FROM api_keys WHERE id = ?1", params![key_id])?;
        }
        Ok(digest)
    })?;

    let digest = digest.ok_or_else(|| AppError::NotFound(format!("API key '{key_id}' not found")))?;
    tracing::info!(key_id = %key_id, "API key revoked");
    Ok(digest)
}

/// Change a key's label and/or scope. Returns the new metadata and the key's
/// digest so an identity cached under the old scope can be dropped.
pub fn update_api_key(
    db: &Database,
    key_id: &str,
    label: Option<&str>,
    scope: Option<&str>,
) -> Result<(ApiKeyInfo, String), AppError> {
    let scope = scope.map(Scope::parse).transpose()?.map(|s| s.to_string());

    let updated = db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE api_keys SET label = COALESCE(?2, label), scope = COALESCE(?3, scope) \
             WHERE id = ?1",
            params![key_id, label, scope],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let info = conn.query_row(
            "SELECT id, user_id, key_prefix, label, scope, created_at FROM api_keys WHERE id = ?1",
            params![key_id],
            key_from_row,
        )?;
        let digest: String = conn.query_row(
            "SELECT key_digest FROM api_keys WHERE id = ?1",
            params![key_id],
            |row| row.get(0),
        )?;
        Ok(Some((info, digest)))
    })?;

    let (info, digest) =
        updated.ok_or_else(|| AppError::NotFound(format!("API key '{key_id}' not found")))?;
    tracing::info!(key_id = %key_id, scope = %info.scope, "API key updated");
    Ok((info, digest))
}

// ---------------------------------------------------------------------------
// Identity lookup
// ---------------------------------------------------------------------------

/// Resolve a key digest to the caller it belongs to.
///
/// The digest selects at most one row; the argon2 hash is then verified so a
/// leaked database without hashes cannot be replayed as digests.
pub fn lookup_identity(db: &Database, digest: &str) -> Result<Option<CallerIdentity>, StoreError> {
    let row = db.with_conn(|conn| {
        conn.query_row(
            "SELECT ak.id, ak.key_hash, ak.scope, u.id, u.name \
             FROM api_keys ak JOIN users u ON ak.user_id = u.id \
             WHERE ak.key_digest = ?1",
            params![digest],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()
    })?;

    let Some((api_key_id, hash, scope, user_id, user_name)) = row else {
        return Ok(None);
    };

    match keys::verify_digest(digest, &hash) {
        Ok(true) => {}
        Ok(false) => return Ok(None),
        Err(e) => {
            tracing::error!(key_id = %api_key_id, error = %e, "Stored key hash is unreadable");
            return Ok(None);
        }
    }

    // A key whose stored scope no longer parses is treated as unknown rather
    // than unrestricted.
    let Ok(scope) = Scope::parse(&scope) else {
        tracing::error!(key_id = %api_key_id, scope = %scope, "Stored scope is invalid");
        return Ok(None);
    };

    Ok(Some(CallerIdentity {
        user_id,
        user_name,
        api_key_id,
        scope,
    }))
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

/// If no users exist, create an admin user with an `admin`-scoped key and
/// print the key to stdout. Returns `None` if users already exist.
pub fn bootstrap_admin(
    db: &Database,
    admin_name: &str,
) -> Result<Option<BootstrapResult>, AppError> {
    let user_count: i64 =
        db.with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0)))?;

    if user_count > 0 {
        return Ok(None);
    }

    tracing::info!("No users found -- bootstrapping default admin");

    let user = create_user(db, admin_name)?;
    let key = create_api_key(db, &user.id, "bootstrap", "admin")?;

    println!();
    println!("=========================================================");
    println!("  llm-gateway first-run bootstrap");
    println!("---------------------------------------------------------");
    println!("  Admin user : {}", user.name);
    println!("  API key    : {}", key.plaintext);
    println!("---------------------------------------------------------");
    println!("  Save this key now -- it will not be shown again.");
    println!("=========================================================");
    println!();

    Ok(Some(BootstrapResult {
        user,
        api_key_plaintext: key.plaintext,
    }))
}
