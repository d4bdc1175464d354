//! Login admission rules.
//!
//! Every rule about which lifecycle states may sign in lives here, so call
//! sites never rebuild the `status`/`verified` logic themselves.

use crate::store::{Role, User, UserStatus};

/// Why an account may not sign in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginBlock {
    /// Email not confirmed and still waiting for review
    PendingApproval,
    /// Reviewed (or otherwise moved on) but the email was never confirmed
    EmailNotVerified,
    Rejected,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginGate {
    Allow,
    Block(LoginBlock),
}

impl LoginGate {
    pub fn is_allowed(&self) -> bool {
        matches!(self, LoginGate::Allow)
    }
}

/// Decide whether `user` may proceed to the password check.
///
/// Checks run in this order:
/// 1. unverified accounts are stopped, unless they are the superadmin;
///    a pending one gets `PendingApproval`
/// 2. rejected and denied accounts are stopped with their own reason
/// 3. everything else passes, including a verified account whose status
///    is still `pending`. Accounts created by an administrator and
///    confirmed by email sit in that state until someone approves them.
pub fn can_login(user: &User) -> LoginGate {
    if !user.is_verified() && user.role != Role::SuperAdmin {
        return match user.status {
            UserStatus::Pending => LoginGate::Block(LoginBlock::PendingApproval),
            UserStatus::Rejected => LoginGate::Block(LoginBlock::Rejected),
            UserStatus::Denied => LoginGate::Block(LoginBlock::Denied),
            UserStatus::Approved => LoginGate::Block(LoginBlock::EmailNotVerified),
        };
    }

    match user.status {
        UserStatus::Rejected => LoginGate::Block(LoginBlock::Rejected),
        UserStatus::Denied => LoginGate::Block(LoginBlock::Denied),
        UserStatus::Pending | UserStatus::Approved => LoginGate::Allow,
    }
}
