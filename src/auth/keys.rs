use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use rand::Rng;
use sha2::{Digest, Sha256};

pub const KEY_PREFIX: &str = "sk-gw-";
const KEY_RANDOM_LEN: usize = 32;
/// Salt length in bytes (16 bytes = 22 base64 chars, well within argon2 limits).
const SALT_LEN: usize = 16;

/// A newly generated API key. The plaintext is shown to the caller once and
/// never stored.
#[derive(Debug)]
pub struct GeneratedKey {
    pub plaintext: String,
    /// SHA-256 hex of the plaintext; the lookup index.
    pub digest: String,
    /// Argon2 hash of the digest; the verifier.
    pub hash: String,
    /// Short display form, e.g. `sk-gw-a1b2c3d4...`.
    pub prefix: String,
}

/// Generate a new API key with the format `sk-gw-{32 alphanumeric}`.
pub fn generate_api_key() -> Result<GeneratedKey, argon2::password_hash::Error> {
    let random_part = generate_random_alphanumeric(KEY_RANDOM_LEN);
    let plaintext = format!("{KEY_PREFIX}{random_part}");
    let prefix = format!("{KEY_PREFIX}{}...", &random_part[..8]);
    let digest = key_digest(&plaintext);
    let hash = hash_digest(&digest)?;

    Ok(GeneratedKey {
        plaintext,
        digest,
        hash,
        prefix,
    })
}

/// SHA-256 digest of a key, returned as a hex string.
///
/// The digest is stored in its own indexed column so a lookup touches one
/// row instead of verifying every stored hash.
pub fn key_digest(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Argon2id hash of a key digest.
pub fn hash_digest(digest: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = generate_salt()?;
    let hash = Argon2::default().hash_password(digest.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a key digest against a stored argon2 hash.
pub fn verify_digest(digest: &str, hash: &str) -> Result<bool, argon2::password_hash::Error> {
    let parsed_hash = PasswordHash::new(hash)?;
    Ok(Argon2::default()
        .verify_password(digest.as_bytes(), &parsed_hash)
        .is_ok())
}

fn generate_salt() -> Result<SaltString, argon2::password_hash::Error> {
    let mut rng = rand::rng();
    let mut salt_bytes = [0u8; SALT_LEN];
    rng.fill(&mut salt_bytes);
    SaltString::encode_b64(&salt_bytes)
}

fn generate_random_alphanumeric(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_api_key_format() {
        let key = generate_api_key().unwrap();
        assert!(key.plaintext.starts_with("sk-gw-"));
        assert_eq!(key.plaintext.len(), KEY_PREFIX.len() + KEY_RANDOM_LEN);
        assert!(key.prefix.ends_with("..."));
        assert_eq!(key.digest, key_digest(&key.plaintext));
        assert_eq!(key.digest.len(), 64);
    }

    #[test]
    fn test_generate_api_key_unique() {
        let key1 = generate_api_key().unwrap();
        let key2 = generate_api_key().unwrap();
        assert_ne!(key1.plaintext, key2.plaintext);
        assert_ne!(key1.hash, key2.hash);
    }

    #[test]
    fn test_hash_and_verify() {
        let digest = key_digest("sk-gw-testkey12345678901234567890ab");
        let hash = hash_digest(&digest).unwrap();
        assert!(verify_digest(&digest, &hash).unwrap());
        assert!(!verify_digest(&key_digest("sk-gw-other"), &hash).unwrap());
    }

    #[test]
    fn test_malformed_hash_is_error() {
        assert!(verify_digest("abc", "not-a-phc-string").is_err());
    }

    #[test]
    fn test_alphanumeric_only() {
        let key = generate_api_key().unwrap();
        let random_part = &key.plaintext[KEY_PREFIX.len()..];
        assert!(random_part.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
