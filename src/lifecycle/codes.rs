//! Process-lifetime one-time codes.
//!
//! Registration codes and login second factors are kept here, keyed by
//! lowercased email. Nothing in this table is persisted: after a restart the
//! user simply asks for a new code.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::Rng;
use subtle::ConstantTimeEq;

#[derive(Debug, Clone)]
pub struct IssuedCode {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

impl IssuedCode {
    pub fn new(code: String, ttl: Duration) -> Self {
        Self {
            code,
            expires_at: Utc::now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Result of checking a submitted code against one stored code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeCheck {
    Valid,
    Expired,
    Mismatch,
}

pub fn check_code(stored: &str, expires_at: DateTime<Utc>, submitted: &str, now: DateTime<Utc>) -> CodeCheck {
    if !codes_match(stored, submitted) {
        CodeCheck::Mismatch
    } else if now > expires_at {
        CodeCheck::Expired
    } else {
        CodeCheck::Valid
    }
}

/// Constant-time comparison of two codes
pub fn codes_match(stored: &str, submitted: &str) -> bool {
    let stored = stored.as_bytes();
    let submitted = submitted.trim().as_bytes();
    stored.len() == submitted.len() && stored.ct_eq(submitted).into()
}

/// Six random decimal digits
pub fn generate_numeric_code() -> String {
    let n: u32 = rand::rng().random_range(0..1_000_000);
    format!("{:06}", n)
}

/// Random token for emailed links
pub fn generate_link_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    hex::encode(bytes)
}

#[derive(Debug, Default)]
pub struct CodeTable {
    entries: DashMap<String, IssuedCode>,
}

fn key(email: &str) -> String {
    email.trim().to_lowercase()
}

impl CodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a code, replacing any earlier one for the same email
    pub fn insert(&self, email: &str, code: IssuedCode) {
        self.entries.insert(key(email), code);
    }

    pub fn get(&self, email: &str) -> Option<IssuedCode> {
        self.entries.get(&key(email)).map(|e| e.value().clone())
    }

    pub fn remove(&self, email: &str) -> Option<IssuedCode> {
        self.entries.remove(&key(email)).map(|(_, v)| v)
    }

    /// Remove the entry if `submitted` matches and has not expired.
    /// Mismatch and expiry are deliberately indistinguishable.
    pub fn consume(&self, email: &str, submitted: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .remove_if(&key(email), |_, issued| {
                check_code(&issued.code, issued.expires_at, submitted, now) == CodeCheck::Valid
            })
            .is_some()
    }

    /// Drop expired entries, returning how many were removed
    pub fn cleanup_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, issued| !issued.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Both side tables used by the account flows
#[derive(Debug, Default)]
pub struct SideTables {
    pub registration: CodeTable,
    pub two_factor: CodeTable,
}

impl SideTables {
    pub fn cleanup_expired(&self, now: DateTime<Utc>) -> usize {
        self.registration.cleanup_expired(now) + self.two_factor.cleanup_expired(now)
    }
}
