//! LMDB-backed replica of API key and quota facts.
//!
//! The origin service pushes full snapshots; [`AuthReplica::apply_snapshot`]
//! replaces both tables inside a single LMDB write transaction. LMDB readers
//! keep seeing the previously committed tree until the commit lands, so a
//! concurrent `authorize` observes either the old snapshot or the new one,
//! never a half-written table.
//!
//! Request handling only reads. The snapshot feed is the only writer.
//!
//! # Tables
//!
//! | database    | key        | value             |
//! |-------------|------------|-------------------|
//! | `auth_keys` | key hash   | `AuthFact` (JSON) |
//! | `quotas`    | user id    | `QuotaFact` (JSON)|

mod lmdb;

pub use lmdb::{AuthReplica, ReplicaError};

use async_trait::async_trait;
use htmlshot_core::{AuthError, QuotaDecision, QuotaVerdict, Timestamp, UpstreamError};

/// Published after every committed snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaStatus {
    /// Number of snapshots applied. Zero means not ready.
    pub last_update: u64,
    pub key_count: u64,
    pub quota_count: u64,
    pub updated_at: Option<Timestamp>,
}

impl ReplicaStatus {
    pub fn is_ready(&self) -> bool {
        self.last_update > 0
    }
}

/// A bearer token that passed key and quota checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorized {
    pub user_id: String,
    pub plan: String,
    pub remaining: u64,
}

/// Why the replica refused a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDenial {
    /// No snapshot has been applied yet. Retryable.
    NotReady,
    InvalidKey,
    KeyInactive,
    QuotaExceeded {
        current_usage: u64,
        monthly_limit: u64,
    },
    SubscriptionInactive {
        status: String,
    },
}

impl AuthDenial {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthDenial::NotReady)
    }

    /// Wire error code.
    pub fn code(&self) -> &'static str {
        match self {
            AuthDenial::NotReady => "NOT_READY",
            AuthDenial::InvalidKey => "INVALID_KEY",
            AuthDenial::KeyInactive => "KEY_INACTIVE",
            AuthDenial::QuotaExceeded { .. } | AuthDenial::SubscriptionInactive { .. } => {
                "QUOTA_EXCEEDED"
            }
        }
    }
}

impl From<AuthDenial> for AuthError {
    fn from(denial: AuthDenial) -> Self {
        match denial {
            AuthDenial::NotReady => AuthError::NotReady,
            AuthDenial::InvalidKey => AuthError::InvalidKey,
            AuthDenial::KeyInactive => AuthError::KeyInactive,
            AuthDenial::QuotaExceeded {
                current_usage,
                monthly_limit,
            } => AuthError::QuotaExceeded {
                current_usage,
                monthly_limit,
            },
            AuthDenial::SubscriptionInactive { status } => {
                AuthError::SubscriptionInactive { status }
            }
        }
    }
}

/// Answers quota checks from the local replica instead of calling the origin.
#[async_trait]
impl QuotaDecision for AuthReplica {
    async fn check_quota(&self, user_id: &str) -> Result<QuotaVerdict, UpstreamError> {
        Ok(match AuthReplica::check_quota(self, user_id) {
            Ok(_) => QuotaVerdict::allow(),
            Err(denial) => {
                let code = denial.code();
                QuotaVerdict::deny(code, AuthError::from(denial).to_string())
            }
        })
    }
}
