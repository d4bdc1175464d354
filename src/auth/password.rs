use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PasswordError {
    #[error("Failed to hash password: {0}")]
    Hash(String),

    #[error("Password check timed out")]
    Timeout,

    #[error("Password worker failed: {0}")]
    Worker(String),
}

/// Hash a password using Argon2
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| PasswordError::Hash(e.to_string()))?;
    Ok(hash.to_string())
}

/// Verify a password against a hash
pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

/// Hash on the blocking pool so the request task is not stalled
pub async fn hash_password_async(password: String, limit: Duration) -> Result<String, PasswordError> {
    let job = tokio::task::spawn_blocking(move || hash_password(&password));
    match tokio::time::timeout(limit, job).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(PasswordError::Worker(e.to_string())),
        Err(_) => Err(PasswordError::Timeout),
    }
}

/// Verify on the blocking pool, giving up after `limit`
pub async fn verify_password_async(
    password: String,
    hash: String,
    limit: Duration,
) -> Result<bool, PasswordError> {
    let job = tokio::task::spawn_blocking(move || verify_password(&password, &hash));
    match tokio::time::timeout(limit, job).await {
        Ok(Ok(matched)) => Ok(matched),
        Ok(Err(e)) => Err(PasswordError::Worker(e.to_string())),
        Err(_) => Err(PasswordError::Timeout),
    }
}
