//! Account lifecycle.
//!
//! A user record moves through two independent axes: `verified` (the owner
//! proved control of the email address) and `status` (an administrator's
//! decision). Each transition mutates the store synchronously, then waits
//! for the save queue. A failed save is reported to the caller but the
//! in-memory change stays, and the next successful save picks it up.

pub mod codes;
pub mod gate;

pub use codes::{CodeTable, IssuedCode, SideTables};
pub use gate::{can_login, LoginBlock, LoginGate};

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::password::{hash_password_async, verify_password_async};
use crate::auth::{Claims, TokenIssuer};
use crate::config::AuthConfig;
use crate::notifications::{email, Mailer};
use crate::persistence::{SaveError, SaveQueue};
use crate::store::{DocumentStore, Role, StoreError, User, UserStatus};
use codes::{check_code, codes_match, generate_link_token, generate_numeric_code, CodeCheck};

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("{message}")]
    Validation { field: &'static str, message: String },

    #[error("Password must be at least {0} characters")]
    PasswordTooShort(usize),

    #[error("An account with this email already exists")]
    DuplicateEmail,

    #[error("Email is already verified")]
    AlreadyVerified,

    #[error("User already has a department assigned")]
    AlreadyAssigned,

    #[error("Only pending registrations can be denied")]
    NotPending,

    #[error("The superadmin account cannot be changed this way")]
    ProtectedAccount,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("No account found for this email")]
    UnknownAccount,

    #[error("Your account is pending approval. Please verify your email first.")]
    PendingApproval,

    #[error("Please verify your email before logging in")]
    EmailNotVerified,

    #[error("Your registration was rejected by an administrator")]
    Rejected,

    #[error("Your registration was denied")]
    Denied,

    #[error("Account setup is not complete. Use the link sent to your email.")]
    NoPasswordSet,

    #[error("Incorrect password")]
    IncorrectPassword,

    #[error("Invalid verification code")]
    InvalidCode,

    #[error("Verification code has expired")]
    CodeExpired,

    #[error("Invalid or expired code")]
    InvalidOrExpiredCode,

    #[error("Invalid verification link")]
    InvalidLink,

    #[error("Verification link has expired")]
    LinkExpired,

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Change applied but not saved: {0}")]
    Persistence(#[from] SaveError),
}

impl From<LoginBlock> for LifecycleError {
    fn from(block: LoginBlock) -> Self {
        match block {
            LoginBlock::PendingApproval => LifecycleError::PendingApproval,
            LoginBlock::EmailNotVerified => LifecycleError::EmailNotVerified,
            LoginBlock::Rejected => LifecycleError::Rejected,
            LoginBlock::Denied => LifecycleError::Denied,
        }
    }
}

fn credential(e: impl std::fmt::Display) -> LifecycleError {
    LifecycleError::Credential(e.to_string())
}

fn ttl(duration: Option<Duration>, setting: &'static str) -> Result<Duration, LifecycleError> {
    duration.ok_or_else(|| LifecycleError::Credential(format!("auth.{} is out of range", setting)))
}

fn expiry_after(ttl: Duration, setting: &'static str) -> Result<DateTime<Utc>, LifecycleError> {
    Utc::now()
        .checked_add_signed(ttl)
        .ok_or_else(|| LifecycleError::Credential(format!("auth.{} is out of range", setting)))
}

/// Self-service registration input
#[derive(Debug, Clone)]
pub struct Registration {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub department_id: Option<String>,
}

/// Account created by an administrator
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub role: Role,
    pub department_id: Option<String>,
}

/// Result of an operation that sent an email
#[derive(Debug, Clone)]
pub struct Delivery<T> {
    pub value: T,
    pub delivered: bool,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user: User,
}

#[derive(Debug, Clone)]
pub enum LoginOutcome {
    Authenticated(Session),
    TwoFactorRequired { email: String, delivered: bool },
}

#[derive(Debug, Clone)]
pub struct LinkIssued {
    pub user: User,
    pub expires_at: DateTime<Utc>,
}

/// The account state machine and everything it needs
pub struct Accounts {
    store: Arc<DocumentStore>,
    saver: SaveQueue,
    codes: Arc<SideTables>,
    mailer: Arc<dyn Mailer>,
    tokens: TokenIssuer,
    policy: AuthConfig,
}

fn normalize_email(email: &str) -> Result<String, LifecycleError> {
    let email = email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(LifecycleError::Validation {
            field: "email",
            message: "A valid email address is required".to_string(),
        });
    }
    Ok(email)
}

impl Accounts {
    pub fn new(
        store: Arc<DocumentStore>,
        saver: SaveQueue,
        codes: Arc<SideTables>,
        mailer: Arc<dyn Mailer>,
        tokens: TokenIssuer,
        policy: AuthConfig,
    ) -> Self {
        Self {
            store,
            saver,
            codes,
            mailer,
            tokens,
            policy,
        }
    }

    pub fn user(&self, id: &str) -> Option<User> {
        self.store.user(id)
    }

    pub fn users(&self, status: Option<UserStatus>) -> Vec<User> {
        self.store.users_with_status(status)
    }

    async fn persist(&self, operation: &'static str) -> Result<(), LifecycleError> {
        self.saver.enqueue_save().await.map_err(|e| {
            error!(operation, error = %e, "Change kept in memory but not persisted");
            LifecycleError::Persistence(e)
        })
    }

    fn check_password(&self, password: &str) -> Result<(), LifecycleError> {
        if password.chars().count() < self.policy.password_min_length {
            return Err(LifecycleError::PasswordTooShort(self.policy.password_min_length));
        }
        Ok(())
    }

    /// A requested department must exist. Blank means "not chosen yet".
    fn resolve_department(&self, requested: Option<String>) -> Result<Option<String>, LifecycleError> {
        match requested.map(|d| d.trim().to_string()).filter(|d| !d.is_empty()) {
            Some(id) if self.store.department(&id).is_none() => Err(LifecycleError::NotFound("Department")),
            other => Ok(other),
        }
    }

    fn code_ttl(&self) -> Result<Duration, LifecycleError> {
        ttl(Duration::try_minutes(self.policy.code_ttl_minutes), "code_ttl_minutes")
    }

    fn link_expiry(&self) -> Result<DateTime<Utc>, LifecycleError> {
        let ttl = ttl(Duration::try_days(self.policy.link_ttl_days), "link_ttl_days")?;
        expiry_after(ttl, "link_ttl_days")
    }

    fn faculty_link(&self, token: &str) -> String {
        format!(
            "{}/faculty/verify?token={}",
            self.policy.public_url.trim_end_matches('/'),
            token
        )
    }

    fn issue_session(&self, user: User) -> Result<Session, LifecycleError> {
        let token = self.tokens.issue(&user).map_err(credential)?;
        Ok(Session { token, user })
    }

    // -------------------------------------------------------------------------
    // Boot
    // -------------------------------------------------------------------------

    /// Create the configured superadmin if no account holds that email.
    /// Returns whether an account was created.
    pub async fn ensure_superadmin(&self) -> Result<bool, LifecycleError> {
        let (Some(email), Some(password)) = (
            self.policy.superadmin_email.as_deref(),
            self.policy.superadmin_password.as_deref(),
        ) else {
            debug!("No superadmin configured");
            return Ok(false);
        };
        let email = normalize_email(email)?;

        if self.store.user_by_email(&email).is_some() {
            debug!(email = %email, "Superadmin already present");
            return Ok(false);
        }

        let hash = hash_password_async(password.to_string(), self.policy.password_timeout())
            .await
            .map_err(credential)?;

        let mut user = User::new(
            &email,
            &self.policy.superadmin_first_name,
            &self.policy.superadmin_last_name,
        );
        user.password = Some(hash);
        user.role = Role::SuperAdmin;
        user.status = UserStatus::Approved;
        user.set_verified(true);
        user.approved_at = Some(Utc::now());
        user.department_id = None;

        match self.store.insert_user(user) {
            Ok(()) => {}
            Err(StoreError::DuplicateEmail(_)) => return Ok(false),
            Err(e) => return Err(credential(e)),
        }
        self.persist("seed superadmin").await?;
        info!(email = %email, "Created superadmin account");
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Self-service registration
    // -------------------------------------------------------------------------

    pub async fn register(&self, registration: Registration) -> Result<Delivery<User>, LifecycleError> {
        let email = normalize_email(&registration.email)?;
        self.check_password(&registration.password)?;
        let department_id = self.resolve_department(registration.department_id)?;

        if self.store.user_by_email(&email).is_some() {
            return Err(LifecycleError::DuplicateEmail);
        }

        let hash = hash_password_async(registration.password, self.policy.password_timeout())
            .await
            .map_err(credential)?;

        let issued = IssuedCode::new(generate_numeric_code(), self.code_ttl()?);

        let mut user = User::new(&email, &registration.first_name, &registration.last_name);
        user.middle_name = registration
            .middle_name
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());
        if department_id.is_some() {
            user.department_id = department_id;
        }
        user.password = Some(hash);
        user.verification_code = Some(issued.code.clone());
        user.verification_code_expires = Some(issued.expires_at);

        self.store.insert_user(user.clone()).map_err(|e| match e {
            StoreError::DuplicateEmail(_) => LifecycleError::DuplicateEmail,
            other => credential(other),
        })?;
        self.codes.registration.insert(&email, issued.clone());
        self.persist("register").await?;

        info!(user_id = %user.id, email = %email, "Registered new account");

        let delivered = email::render_verification_code(&user.first_name, &issued.code, self.policy.code_ttl_minutes)
            .send(self.mailer.as_ref(), &email)
            .await;
        if !delivered {
            warn!(email = %email, "Verification code not delivered, user can request a resend");
        }

        Ok(Delivery { value: user, delivered })
    }

    /// Confirm the email address. The status is left at `pending`: approval
    /// is a separate administrator step.
    pub async fn verify_code(&self, email: &str, code: &str) -> Result<User, LifecycleError> {
        let email = normalize_email(email)?;
        let now = Utc::now();
        let side_entry = self.codes.registration.get(&email);

        let result = self
            .store
            .update_user_by_email(&email, |user| {
                if user.is_verified() {
                    return Err(LifecycleError::AlreadyVerified);
                }

                let record_check = match &user.verification_code {
                    Some(stored) => check_code(
                        stored,
                        user.verification_code_expires.unwrap_or(DateTime::<Utc>::MIN_UTC),
                        code,
                        now,
                    ),
                    None => CodeCheck::Mismatch,
                };
                let check = match record_check {
                    CodeCheck::Mismatch => side_entry
                        .as_ref()
                        .map(|issued| check_code(&issued.code, issued.expires_at, code, now))
                        .unwrap_or(CodeCheck::Mismatch),
                    found => found,
                };

                match check {
                    CodeCheck::Valid => {
                        user.set_verified(true);
                        user.clear_verification_code();
                        user.touch(None);
                        Ok(user.clone())
                    }
                    CodeCheck::Expired => Err(LifecycleError::CodeExpired),
                    CodeCheck::Mismatch => Err(LifecycleError::InvalidCode),
                }
            })
            .ok_or(LifecycleError::UnknownAccount)?;

        let user = match result {
            Ok(user) => user,
            Err(e) => {
                debug!(email = %email, error = %e, "Verification code rejected");
                return Err(e);
            }
        };

        self.codes.registration.remove(&email);
        self.persist("verify code").await?;
        info!(user_id = %user.id, "Email verified, awaiting approval");
        Ok(user)
    }

    /// Issue a fresh code, invalidating the previous one
    pub async fn resend_code(&self, email: &str) -> Result<Delivery<User>, LifecycleError> {
        let email = normalize_email(email)?;
        let issued = IssuedCode::new(generate_numeric_code(), self.code_ttl()?);

        let user = self
            .store
            .update_user_by_email(&email, |user| {
                if user.is_verified() {
                    return Err(LifecycleError::AlreadyVerified);
                }
                user.verification_code = Some(issued.code.clone());
                user.verification_code_expires = Some(issued.expires_at);
                user.touch(None);
                Ok(user.clone())
            })
            .ok_or(LifecycleError::UnknownAccount)??;

        self.codes.registration.insert(&email, issued.clone());
        self.persist("resend code").await?;
        info!(user_id = %user.id, "Verification code reissued");

        let delivered = email::render_verification_code(&user.first_name, &issued.code, self.policy.code_ttl_minutes)
            .send(self.mailer.as_ref(), &email)
            .await;
        Ok(Delivery { value: user, delivered })
    }

    // -------------------------------------------------------------------------
    // Administrator decisions
    // -------------------------------------------------------------------------

    /// Approve an account. Re-approving only refreshes the audit fields.
    pub async fn approve(&self, admin: &Claims, user_id: &str) -> Result<User, LifecycleError> {
        let now = Utc::now();
        let user = self
            .store
            .update_user(user_id, |user| {
                user.status = UserStatus::Approved;
                user.set_verified(true);
                user.clear_verification_code();
                user.approved_at = Some(now);
                user.rejected_at = None;
                user.touch(Some(&admin.id));
                user.clone()
            })
            .ok_or(LifecycleError::NotFound("User"))?;

        self.codes.registration.remove(&user.email);
        self.persist("approve").await?;
        info!(user_id = %user.id, admin_id = %admin.id, "Account approved");

        email::render_review_outcome(&user.first_name, true)
            .send(self.mailer.as_ref(), &user.email)
            .await;
        Ok(user)
    }

    /// Reject an account but keep the record for audit
    pub async fn reject(&self, admin: &Claims, user_id: &str) -> Result<User, LifecycleError> {
        let now = Utc::now();
        let user = self
            .store
            .update_user(user_id, |user| {
                if user.role == Role::SuperAdmin {
                    return Err(LifecycleError::ProtectedAccount);
                }
                user.status = UserStatus::Rejected;
                user.rejected_at = Some(now);
                user.touch(Some(&admin.id));
                Ok(user.clone())
            })
            .ok_or(LifecycleError::NotFound("User"))??;

        self.persist("reject").await?;
        info!(user_id = %user.id, admin_id = %admin.id, "Account rejected");

        email::render_review_outcome(&user.first_name, false)
            .send(self.mailer.as_ref(), &user.email)
            .await;
        Ok(user)
    }

    /// Delete a registration that is still pending
    pub async fn deny(&self, admin: &Claims, user_id: &str) -> Result<User, LifecycleError> {
        let mut protected = false;
        let removed = self
            .store
            .remove_user_if(user_id, |user| {
                protected = user.role == Role::SuperAdmin;
                !protected && user.status == UserStatus::Pending
            })
            .map_err(|_| LifecycleError::NotFound("User"))?;

        let user = match removed {
            Some(user) => user,
            None if protected => return Err(LifecycleError::ProtectedAccount),
            None => return Err(LifecycleError::NotPending),
        };

        self.codes.registration.remove(&user.email);
        self.codes.two_factor.remove(&user.email);
        self.persist("deny").await?;
        info!(user_id = %user.id, email = %user.email, admin_id = %admin.id, "Pending registration denied and removed");
        Ok(user)
    }

    /// Set the department of a user who still has the placeholder
    pub async fn assign_department(
        &self,
        admin: &Claims,
        user_id: &str,
        department_id: &str,
    ) -> Result<User, LifecycleError> {
        if self.store.department(department_id).is_none() {
            return Err(LifecycleError::NotFound("Department"));
        }

        let user = self
            .store
            .update_user(user_id, |user| {
                if user.has_department() {
                    return Err(LifecycleError::AlreadyAssigned);
                }
                user.department_id = Some(department_id.to_string());
                user.touch(Some(&admin.id));
                Ok(user.clone())
            })
            .ok_or(LifecycleError::NotFound("User"))??;

        self.persist("assign department").await?;
        info!(user_id = %user.id, department_id, "Department assigned");
        Ok(user)
    }

    // -------------------------------------------------------------------------
    // Administrator-created accounts
    // -------------------------------------------------------------------------

    /// Create an account without a password and email its setup link
    pub async fn create_account(
        &self,
        admin: &Claims,
        account: NewAccount,
    ) -> Result<Delivery<LinkIssued>, LifecycleError> {
        let email = normalize_email(&account.email)?;
        if account.role == Role::SuperAdmin {
            return Err(LifecycleError::ProtectedAccount);
        }
        let department_id = self.resolve_department(account.department_id)?;

        let token = generate_link_token();
        let expires_at = self.link_expiry()?;

        let mut user = User::new(&email, &account.first_name, &account.last_name);
        user.middle_name = account.middle_name.filter(|m| !m.trim().is_empty());
        user.role = account.role;
        if department_id.is_some() {
            user.department_id = department_id;
        }
        user.verification_token = Some(token.clone());
        user.verification_token_expires = Some(expires_at);
        user.touch(Some(&admin.id));

        self.store.insert_user(user.clone()).map_err(|e| match e {
            StoreError::DuplicateEmail(_) => LifecycleError::DuplicateEmail,
            other => credential(other),
        })?;
        self.persist("create account").await?;
        info!(user_id = %user.id, role = user.role.as_str(), admin_id = %admin.id, "Account created by administrator");

        let delivered = email::render_faculty_link(&user.first_name, &self.faculty_link(&token), self.policy.link_ttl_days)
            .send(self.mailer.as_ref(), &email)
            .await;
        Ok(Delivery {
            value: LinkIssued { user, expires_at },
            delivered,
        })
    }

    /// Generate a new setup link for `user_id`. When `email` is given it
    /// must be the address on the record.
    pub async fn issue_faculty_link(
        &self,
        admin: &Claims,
        user_id: &str,
        email: Option<&str>,
    ) -> Result<Delivery<LinkIssued>, LifecycleError> {
        let token = generate_link_token();
        let expires_at = self.link_expiry()?;

        let user = self
            .store
            .update_user(user_id, |user| {
                if let Some(email) = email {
                    if !user.email.eq_ignore_ascii_case(email.trim()) {
                        return Err(LifecycleError::Validation {
                            field: "email",
                            message: "Email does not match this account".to_string(),
                        });
                    }
                }
                if user.is_verified() && user.password.is_some() {
                    return Err(LifecycleError::AlreadyVerified);
                }
                user.verification_token = Some(token.clone());
                user.verification_token_expires = Some(expires_at);
                user.touch(Some(&admin.id));
                Ok(user.clone())
            })
            .ok_or(LifecycleError::NotFound("User"))??;

        self.persist("issue faculty link").await?;
        info!(user_id = %user.id, admin_id = %admin.id, expires_at = %expires_at, "Faculty verification link issued");

        let delivered = email::render_faculty_link(&user.first_name, &self.faculty_link(&token), self.policy.link_ttl_days)
            .send(self.mailer.as_ref(), &user.email)
            .await;
        if !delivered {
            warn!(user_id = %user.id, "Faculty link not delivered, it can be reissued");
        }
        Ok(Delivery {
            value: LinkIssued { user, expires_at },
            delivered,
        })
    }

    /// Set the password from a setup link. Verification and approval happen
    /// together here because the issuing administrator already vetted the
    /// account. Returns a session directly, without a second factor.
    pub async fn complete_faculty_link(&self, token: &str, password: &str) -> Result<Session, LifecycleError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(LifecycleError::InvalidLink);
        }
        self.check_password(password)?;

        let holder = self
            .store
            .read(|s| {
                s.users
                    .iter()
                    .find(|u| u.verification_token.as_deref().is_some_and(|t| codes_match(t, token)))
                    .map(|u| (u.id.clone(), u.verification_token_expires))
            })
            .ok_or(LifecycleError::InvalidLink)?;
        let (user_id, expires_at) = holder;
        if expires_at.map_or(true, |exp| Utc::now() > exp) {
            return Err(LifecycleError::LinkExpired);
        }

        let hash = hash_password_async(password.to_string(), self.policy.password_timeout())
            .await
            .map_err(credential)?;

        let now = Utc::now();
        let user = self
            .store
            .update_user(&user_id, |user| {
                // The link may have been reissued while hashing
                if !user.verification_token.as_deref().is_some_and(|t| codes_match(t, token)) {
                    return Err(LifecycleError::InvalidLink);
                }
                user.password = Some(hash);
                user.set_verified(true);
                user.status = UserStatus::Approved;
                user.approved_at = Some(now);
                user.clear_verification_token();
                user.clear_verification_code();
                user.touch(None);
                Ok(user.clone())
            })
            .ok_or(LifecycleError::InvalidLink)??;

        self.persist("complete faculty link").await?;
        info!(user_id = %user.id, "Faculty account activated");
        self.issue_session(user)
    }

    // -------------------------------------------------------------------------
    // Sign-in
    // -------------------------------------------------------------------------

    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, LifecycleError> {
        let email = normalize_email(email)?;
        let user = self
            .store
            .user_by_email(&email)
            .ok_or(LifecycleError::UnknownAccount)?;

        if let LoginGate::Block(block) = can_login(&user) {
            debug!(user_id = %user.id, ?block, "Login blocked by account state");
            return Err(block.into());
        }

        let hash = user.password.clone().ok_or(LifecycleError::NoPasswordSet)?;
        let matched = verify_password_async(password.to_string(), hash, self.policy.password_timeout())
            .await
            .map_err(credential)?;
        if !matched {
            warn!(user_id = %user.id, "Login failed: incorrect password");
            return Err(LifecycleError::IncorrectPassword);
        }

        if self.policy.bypasses_two_factor(&email) {
            info!(user_id = %user.id, "Login without second factor (bypass list)");
            return self.issue_session(user).map(LoginOutcome::Authenticated);
        }

        let ttl_minutes = self.policy.two_factor_ttl_minutes;
        let code_ttl = ttl(Duration::try_minutes(ttl_minutes), "two_factor_ttl_minutes")?;
        let issued = IssuedCode::new(generate_numeric_code(), code_ttl);
        self.codes.two_factor.insert(&email, issued.clone());

        let delivered = email::render_two_factor_code(&issued.code, ttl_minutes)
            .send(self.mailer.as_ref(), &email)
            .await;
        info!(user_id = %user.id, delivered, "Second factor issued");

        Ok(LoginOutcome::TwoFactorRequired { email, delivered })
    }

    pub async fn verify_two_factor(&self, email: &str, code: &str) -> Result<Session, LifecycleError> {
        let email = normalize_email(email)?;
        if !self.codes.two_factor.consume(&email, code, Utc::now()) {
            debug!(email = %email, "Second factor rejected");
            return Err(LifecycleError::InvalidOrExpiredCode);
        }

        let user = self
            .store
            .user_by_email(&email)
            .ok_or(LifecycleError::UnknownAccount)?;
        if let LoginGate::Block(block) = can_login(&user) {
            return Err(block.into());
        }

        info!(user_id = %user.id, "Login completed");
        self.issue_session(user)
    }
}

/// Periodically drop expired codes from the side tables
pub fn spawn_code_sweeper(tables: Arc<SideTables>, every: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = tables.cleanup_expired(Utc::now());
            if removed > 0 {
                debug!(removed, "Swept expired one-time codes");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::testing::RecordingMailer;
    use crate::persistence::AtomicWriter;
    use crate::store::{Department, Snapshot};
    use std::sync::atomic::Ordering;

    struct Harness {
        accounts: Accounts,
        store: Arc<DocumentStore>,
        writer: Arc<AtomicWriter>,
        codes: Arc<SideTables>,
        mailer: Arc<RecordingMailer>,
        tokens: TokenIssuer,
        _dir: tempfile::TempDir,
    }

    fn harness_with(policy: AuthConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocumentStore::new(Snapshot::default()));
        let writer = Arc::new(AtomicWriter::new(
            dir.path().join("db.json"),
            std::time::Duration::from_secs(300),
        ));
        let (saver, _) = SaveQueue::spawn(store.clone(), writer.clone(), 16);
        let codes = Arc::new(SideTables::default());
        let mailer = Arc::new(RecordingMailer::default());
        let tokens = TokenIssuer::new("test-secret", 1);
        let accounts = Accounts::new(
            store.clone(),
            saver,
            codes.clone(),
            mailer.clone(),
            tokens.clone(),
            policy,
        );
        Harness {
            accounts,
            store,
            writer,
            codes,
            mailer,
            tokens,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(AuthConfig {
            superadmin_email: Some("root@school.edu".to_string()),
            superadmin_password: Some("rootpass".to_string()),
            two_factor_bypass: vec!["bypass@x.com".to_string()],
            password_timeout_secs: 60,
            ..AuthConfig::default()
        })
    }

    fn admin() -> Claims {
        Claims {
            id: "admin-1".to_string(),
            email: "admin@school.edu".to_string(),
            role: Role::Admin,
            iat: 0,
            exp: 0,
        }
    }

    fn registration(email: &str, password: &str) -> Registration {
        Registration {
            email: email.to_string(),
            password: password.to_string(),
            first_name: "Ada".to_string(),
            middle_name: None,
            last_name: "Lovelace".to_string(),
            department_id: None,
        }
    }

    async fn on_disk(h: &Harness) -> Snapshot {
        let bytes = tokio::fs::read(h.writer.path()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn register_verified(h: &Harness, email: &str, password: &str) -> User {
        let user = h.accounts.register(registration(email, password)).await.unwrap().value;
        let code = user.verification_code.clone().unwrap();
        h.accounts.verify_code(email, &code).await.unwrap()
    }

    #[tokio::test]
    async fn test_register_creates_pending_unverified_user() {
        let h = harness();
        let receipt = h.accounts.register(registration("A@X.com", "secret1")).await.unwrap();
        let user = receipt.value;

        assert!(receipt.delivered);
        assert_eq!(user.email, "a@x.com");
        assert_eq!(user.status, UserStatus::Pending);
        assert_eq!(user.role, Role::User);
        assert!(!user.is_verified());
        assert_eq!(user.department_id.as_deref(), Some("pending"));

        let code = user.verification_code.clone().unwrap();
        assert_eq!(h.codes.registration.get("a@x.com").unwrap().code, code);
        assert_eq!(h.mailer.last_code_to("a@x.com").unwrap(), code);

        let persisted = on_disk(&h).await;
        assert_eq!(persisted.users.len(), 1);
        assert_eq!(persisted.users[0].verification_code.as_deref(), Some(code.as_str()));
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_and_short_password() {
        let h = harness();
        h.accounts.register(registration("a@x.com", "secret1")).await.unwrap();

        assert!(matches!(
            h.accounts.register(registration("A@x.COM", "secret2")).await,
            Err(LifecycleError::DuplicateEmail)
        ));
        assert!(matches!(
            h.accounts.register(registration("b@x.com", "abc")).await,
            Err(LifecycleError::PasswordTooShort(6))
        ));
        assert!(matches!(
            h.accounts.register(registration("not-an-email", "secret1")).await,
            Err(LifecycleError::Validation { field: "email", .. })
        ));
        assert_eq!(h.store.snapshot().users.len(), 1);
    }

    #[tokio::test]
    async fn test_verify_code_leaves_status_pending() {
        let h = harness();
        let user = register_verified(&h, "a@x.com", "secret1").await;

        assert!(user.is_verified());
        assert!(user.email_verified);
        assert_eq!(user.status, UserStatus::Pending);
        assert!(user.verification_code.is_none());
        assert!(h.codes.registration.get("a@x.com").is_none());
        assert!(on_disk(&h).await.users[0].verified);

        assert!(matches!(
            h.accounts.verify_code("a@x.com", "000000").await,
            Err(LifecycleError::AlreadyVerified)
        ));
    }

    #[tokio::test]
    async fn test_verify_code_wrong_and_expired() {
        let h = harness();
        let user = h.accounts.register(registration("a@x.com", "secret1")).await.unwrap().value;
        let code = user.verification_code.clone().unwrap();
        let wrong = if code == "000000" { "111111" } else { "000000" };

        assert!(matches!(
            h.accounts.verify_code("a@x.com", wrong).await,
            Err(LifecycleError::InvalidCode)
        ));

        h.store.update_user(&user.id, |u| {
            u.verification_code_expires = Some(Utc::now() - Duration::minutes(1));
        });
        h.codes.registration.insert(
            "a@x.com",
            IssuedCode {
                code: code.clone(),
                expires_at: Utc::now() - Duration::minutes(1),
            },
        );
        assert!(matches!(
            h.accounts.verify_code("a@x.com", &code).await,
            Err(LifecycleError::CodeExpired)
        ));
        assert!(!h.store.user(&user.id).unwrap().is_verified());
    }

    #[tokio::test]
    async fn test_verify_code_falls_back_to_side_table() {
        let h = harness();
        let user = h.accounts.register(registration("a@x.com", "secret1")).await.unwrap().value;
        h.store.update_user(&user.id, |u| u.clear_verification_code());
        let code = h.codes.registration.get("a@x.com").unwrap().code;

        let verified = h.accounts.verify_code("a@x.com", &code).await.unwrap();
        assert!(verified.is_verified());
    }

    #[tokio::test]
    async fn test_resend_invalidates_old_code() {
        let h = harness();
        let user = h.accounts.register(registration("a@x.com", "secret1")).await.unwrap().value;
        let old = user.verification_code.clone().unwrap();

        let mut new_code = old.clone();
        while new_code == old {
            new_code = h.accounts.resend_code("a@x.com").await.unwrap().value.verification_code.unwrap();
        }
        assert_eq!(h.mailer.last_code_to("a@x.com").unwrap(), new_code);

        assert!(matches!(
            h.accounts.verify_code("a@x.com", &old).await,
            Err(LifecycleError::InvalidCode)
        ));
        tokio_test::assert_ok!(h.accounts.verify_code("a@x.com", &new_code).await);
        assert!(matches!(
            h.accounts.resend_code("a@x.com").await,
            Err(LifecycleError::AlreadyVerified)
        ));
    }

    #[tokio::test]
    async fn test_login_before_verification_is_pending_approval() {
        let h = harness();
        h.accounts.register(registration("a@x.com", "secret1")).await.unwrap();
        assert!(matches!(
            h.accounts.login("a@x.com", "secret1").await,
            Err(LifecycleError::PendingApproval)
        ));
        assert!(matches!(
            h.accounts.login("nobody@x.com", "secret1").await,
            Err(LifecycleError::UnknownAccount)
        ));
    }

    #[tokio::test]
    async fn test_registration_to_two_factor_scenario() {
        let h = harness();
        register_verified(&h, "a@x.com", "secret1").await;

        assert!(matches!(
            h.accounts.login("a@x.com", "wrong-pass").await,
            Err(LifecycleError::IncorrectPassword)
        ));

        let outcome = h.accounts.login("a@x.com", "secret1").await.unwrap();
        assert!(matches!(outcome, LoginOutcome::TwoFactorRequired { delivered: true, .. }));

        let code = h.mailer.last_code_to("a@x.com").unwrap();
        let session = h.accounts.verify_two_factor("a@x.com", &code).await.unwrap();
        let claims = h.tokens.validate(&session.token).unwrap();
        assert_eq!(claims.email, "a@x.com");
        assert_eq!(claims.role, Role::User);

        assert!(matches!(
            h.accounts.verify_two_factor("a@x.com", &code).await,
            Err(LifecycleError::InvalidOrExpiredCode)
        ));
    }

    #[tokio::test]
    async fn test_two_factor_expiry_is_not_distinguished() {
        let h = harness();
        register_verified(&h, "a@x.com", "secret1").await;
        h.accounts.login("a@x.com", "secret1").await.unwrap();
        let code = h.mailer.last_code_to("a@x.com").unwrap();

        h.codes.two_factor.insert(
            "a@x.com",
            IssuedCode {
                code: code.clone(),
                expires_at: Utc::now() - Duration::seconds(1),
            },
        );
        assert!(matches!(
            h.accounts.verify_two_factor("a@x.com", &code).await,
            Err(LifecycleError::InvalidOrExpiredCode)
        ));
    }

    #[tokio::test]
    async fn test_two_factor_code_issued_even_if_delivery_fails() {
        let h = harness();
        register_verified(&h, "a@x.com", "secret1").await;
        h.mailer.fail.store(true, Ordering::Relaxed);

        let outcome = h.accounts.login("a@x.com", "secret1").await.unwrap();
        assert!(matches!(outcome, LoginOutcome::TwoFactorRequired { delivered: false, .. }));
        assert!(h.codes.two_factor.get("a@x.com").is_some());
    }

    #[tokio::test]
    async fn test_bypass_account_gets_token_directly() {
        let h = harness();
        register_verified(&h, "bypass@x.com", "secret1").await;
        match h.accounts.login("BYPASS@x.com", "secret1").await.unwrap() {
            LoginOutcome::Authenticated(session) => assert_eq!(session.user.email, "bypass@x.com"),
            other => panic!("expected token, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_approve_is_idempotent() {
        let h = harness();
        let user = register_verified(&h, "a@x.com", "secret1").await;

        let first = h.accounts.approve(&admin(), &user.id).await.unwrap();
        let second = h.accounts.approve(&admin(), &user.id).await.unwrap();
        assert_eq!(first.status, UserStatus::Approved);
        assert_eq!(second.status, UserStatus::Approved);
        assert!(second.is_verified());
        assert!(second.approved_at >= first.approved_at);
        assert_eq!(second.updated_by.as_deref(), Some("admin-1"));

        let persisted = on_disk(&h).await;
        assert_eq!(persisted.users[0].status, UserStatus::Approved);
        assert!(h.mailer.last_to("a@x.com").unwrap().subject.contains("approved"));

        assert!(matches!(
            h.accounts.approve(&admin(), "missing").await,
            Err(LifecycleError::NotFound("User"))
        ));
    }

    #[tokio::test]
    async fn test_approve_unverified_forces_verified() {
        let h = harness();
        let user = h.accounts.register(registration("a@x.com", "secret1")).await.unwrap().value;
        let approved = h.accounts.approve(&admin(), &user.id).await.unwrap();
        assert!(approved.is_verified());
        assert!(approved.verification_code.is_none());
        assert!(h.codes.registration.get("a@x.com").is_none());
    }

    #[tokio::test]
    async fn test_reject_keeps_record_and_blocks_login() {
        let h = harness();
        let user = register_verified(&h, "a@x.com", "secret1").await;
        let rejected = h.accounts.reject(&admin(), &user.id).await.unwrap();
        assert_eq!(rejected.status, UserStatus::Rejected);
        assert!(rejected.rejected_at.is_some());
        assert!(h.store.user(&user.id).is_some());

        assert!(matches!(
            h.accounts.login("a@x.com", "secret1").await,
            Err(LifecycleError::Rejected)
        ));
    }

    #[tokio::test]
    async fn test_deny_removes_only_pending() {
        let h = harness();
        let pending = h.accounts.register(registration("a@x.com", "secret1")).await.unwrap().value;
        let approved = register_verified(&h, "b@x.com", "secret1").await;
        h.accounts.approve(&admin(), &approved.id).await.unwrap();

        let denied = h.accounts.deny(&admin(), &pending.id).await.unwrap();
        assert_eq!(denied.email, "a@x.com");
        assert!(h.store.user(&pending.id).is_none());
        assert!(h.codes.registration.get("a@x.com").is_none());
        assert_eq!(on_disk(&h).await.users.len(), 1);

        assert!(matches!(
            h.accounts.deny(&admin(), &approved.id).await,
            Err(LifecycleError::NotPending)
        ));
        assert!(matches!(
            h.accounts.deny(&admin(), &pending.id).await,
            Err(LifecycleError::NotFound("User"))
        ));
    }

    #[tokio::test]
    async fn test_superadmin_seed_and_protection() {
        let h = harness();
        assert!(h.accounts.ensure_superadmin().await.unwrap());
        assert!(!h.accounts.ensure_superadmin().await.unwrap());

        let root = h.store.user_by_email("root@school.edu").unwrap();
        assert_eq!(root.role, Role::SuperAdmin);
        assert_eq!(root.status, UserStatus::Approved);
        assert!(root.is_verified());
        assert_eq!(on_disk(&h).await.users.len(), 1);

        assert!(matches!(
            h.accounts.register(registration("ROOT@school.edu", "secret1")).await,
            Err(LifecycleError::DuplicateEmail)
        ));
        assert!(matches!(
            h.accounts.reject(&admin(), &root.id).await,
            Err(LifecycleError::ProtectedAccount)
        ));

        let outcome = h.accounts.login("root@school.edu", "rootpass").await.unwrap();
        assert!(matches!(outcome, LoginOutcome::TwoFactorRequired { .. }));
    }

    #[tokio::test]
    async fn test_faculty_link_scenario() {
        let h = harness();
        let issued = h
            .accounts
            .create_account(
                &admin(),
                NewAccount {
                    email: "prof@x.com".to_string(),
                    first_name: "Grace".to_string(),
                    middle_name: None,
                    last_name: "Hopper".to_string(),
                    role: Role::Faculty,
                    department_id: None,
                },
            )
            .await
            .unwrap();
        let user = issued.value.user;
        assert!(user.password.is_none());
        assert!(matches!(
            h.accounts.login("prof@x.com", "anything").await,
            Err(LifecycleError::PendingApproval)
        ));

        // A fresh link replaces the one sent at creation
        let relinked = h
            .accounts
            .issue_faculty_link(&admin(), &user.id, Some("PROF@x.com"))
            .await
            .unwrap();
        assert!(relinked.delivered);
        let token = h.store.user(&user.id).unwrap().verification_token.unwrap();
        assert_ne!(Some(token.clone()), user.verification_token);
        assert!(h.mailer.last_to("prof@x.com").unwrap().text.contains(&token));

        assert!(matches!(
            h.accounts.complete_faculty_link(&token, "abcd").await,
            Err(LifecycleError::PasswordTooShort(6))
        ));
        assert!(matches!(
            h.accounts.complete_faculty_link(user.verification_token.as_deref().unwrap(), "abcdef").await,
            Err(LifecycleError::InvalidLink)
        ));

        let session = h.accounts.complete_faculty_link(&token, "abcdef").await.unwrap();
        assert_eq!(session.user.status, UserStatus::Approved);
        assert!(session.user.is_verified());
        assert!(session.user.verification_token.is_none());
        assert_eq!(h.tokens.validate(&session.token).unwrap().role, Role::Faculty);

        assert!(matches!(
            h.accounts.complete_faculty_link(&token, "abcdef").await,
            Err(LifecycleError::InvalidLink)
        ));
        assert!(matches!(
            h.accounts.issue_faculty_link(&admin(), &user.id, None).await,
            Err(LifecycleError::AlreadyVerified)
        ));
    }

    #[tokio::test]
    async fn test_faculty_link_expiry_and_email_mismatch() {
        let h = harness();
        let user = h.accounts.register(registration("a@x.com", "secret1")).await.unwrap().value;

        assert!(matches!(
            h.accounts.issue_faculty_link(&admin(), &user.id, Some("b@x.com")).await,
            Err(LifecycleError::Validation { field: "email", .. })
        ));

        h.accounts.issue_faculty_link(&admin(), &user.id, None).await.unwrap();
        let token = h
            .store
            .update_user(&user.id, |u| {
                u.verification_token_expires = Some(Utc::now() - Duration::hours(1));
                u.verification_token.clone().unwrap()
            })
            .unwrap();
        assert!(matches!(
            h.accounts.complete_faculty_link(&token, "abcdef").await,
            Err(LifecycleError::LinkExpired)
        ));
    }

    #[tokio::test]
    async fn test_assign_department() {
        let h = harness();
        h.store.insert_department(Department {
            id: "cs".to_string(),
            name: "Computer Science".to_string(),
            code: Some("CS".to_string()),
            extra: Default::default(),
        });
        let user = h.accounts.register(registration("a@x.com", "secret1")).await.unwrap().value;

        assert!(matches!(
            h.accounts.assign_department(&admin(), &user.id, "math").await,
            Err(LifecycleError::NotFound("Department"))
        ));
        let assigned = h.accounts.assign_department(&admin(), &user.id, "cs").await.unwrap();
        assert_eq!(assigned.department_id.as_deref(), Some("cs"));
        assert!(matches!(
            h.accounts.assign_department(&admin(), &user.id, "cs").await,
            Err(LifecycleError::AlreadyAssigned)
        ));
    }

    #[tokio::test]
    async fn test_register_requires_existing_department() {
        let h = harness();
        let mut unknown = registration("a@x.com", "secret1");
        unknown.department_id = Some("no-such-dept".to_string());
        assert!(matches!(
            h.accounts.register(unknown).await,
            Err(LifecycleError::NotFound("Department"))
        ));
        assert!(h.store.user_by_email("a@x.com").is_none());
        assert!(h.mailer.last_to("a@x.com").is_none());

        h.store.insert_department(Department {
            id: "cs".to_string(),
            name: "Computer Science".to_string(),
            code: None,
            extra: Default::default(),
        });
        let mut known = registration("a@x.com", "secret1");
        known.department_id = Some(" cs ".to_string());
        let user = h.accounts.register(known).await.unwrap().value;
        assert_eq!(user.department_id.as_deref(), Some("cs"));

        let mut blank = registration("b@x.com", "secret1");
        blank.department_id = Some("  ".to_string());
        let user = h.accounts.register(blank).await.unwrap().value;
        assert_eq!(user.department_id.as_deref(), Some("pending"));
        tokio_test::assert_ok!(h.accounts.assign_department(&admin(), &user.id, "cs").await);
    }

    #[tokio::test]
    async fn test_create_account_requires_existing_department() {
        let h = harness();
        let account = NewAccount {
            email: "prof@x.com".to_string(),
            first_name: "Grace".to_string(),
            middle_name: None,
            last_name: "Hopper".to_string(),
            role: Role::Faculty,
            department_id: Some("no-such-dept".to_string()),
        };
        assert!(matches!(
            h.accounts.create_account(&admin(), account.clone()).await,
            Err(LifecycleError::NotFound("Department"))
        ));
        assert!(h.store.user_by_email("prof@x.com").is_none());

        h.store.insert_department(Department {
            id: "math".to_string(),
            name: "Mathematics".to_string(),
            code: None,
            extra: Default::default(),
        });
        let created = h
            .accounts
            .create_account(
                &admin(),
                NewAccount {
                    department_id: Some("math".to_string()),
                    ..account
                },
            )
            .await
            .unwrap();
        assert_eq!(created.value.user.department_id.as_deref(), Some("math"));
    }

    #[tokio::test]
    async fn test_out_of_range_link_lifetime_is_an_error() {
        let h = harness_with(AuthConfig {
            link_ttl_days: i64::MAX,
            password_timeout_secs: 60,
            ..AuthConfig::default()
        });
        let result = h
            .accounts
            .create_account(
                &admin(),
                NewAccount {
                    email: "prof@x.com".to_string(),
                    first_name: "Grace".to_string(),
                    middle_name: None,
                    last_name: "Hopper".to_string(),
                    role: Role::Faculty,
                    department_id: None,
                },
            )
            .await;
        assert!(matches!(result, Err(LifecycleError::Credential(_))));
        assert!(h.store.user_by_email("prof@x.com").is_none());
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_memory_state() {
        let h = harness();
        h.accounts.register(registration("a@x.com", "secret1")).await.unwrap();

        h.writer.set_fail_point(Some(crate::persistence::writer::FailPoint::BeforeRename));
        let err = h.accounts.register(registration("b@x.com", "secret1")).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Persistence(_)));
        assert!(h.store.user_by_email("b@x.com").is_some());
        assert_eq!(on_disk(&h).await.users.len(), 1);

        h.writer.set_fail_point(None);
        h.accounts.resend_code("a@x.com").await.unwrap();
        assert_eq!(on_disk(&h).await.users.len(), 2);
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_codes() {
        let tables = Arc::new(SideTables::default());
        tables.two_factor.insert("a@x.com", IssuedCode::new("1".to_string(), Duration::minutes(-1)));
        let handle = spawn_code_sweeper(tables.clone(), std::time::Duration::from_millis(10));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.abort();
        assert!(tables.two_factor.is_empty());
    }
}
