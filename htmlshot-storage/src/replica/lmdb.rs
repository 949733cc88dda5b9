//! heed (LMDB) environment holding the replicated tables.

use std::path::Path;
use std::sync::RwLock;

use chrono::Utc;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use htmlshot_core::{hash_api_key, AuthFact, QuotaFact, Snapshot, StorageError};
use serde::de::DeserializeOwned;

use super::{AuthDenial, Authorized, ReplicaStatus};

const AUTH_KEYS_DB: &str = "auth_keys";
const QUOTAS_DB: &str = "quotas";

/// Error type for replica storage operations.
#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a named database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ReplicaError> for StorageError {
    fn from(e: ReplicaError) -> Self {
        match e {
            ReplicaError::Deserialization(reason) => StorageError::Corrupt {
                key: "replica".to_string(),
                reason,
            },
            other => StorageError::Database {
                reason: other.to_string(),
            },
        }
    }
}

/// Local, read-mostly copy of the origin's key and quota tables.
pub struct AuthReplica {
    env: Env,
    keys: Database<Str, Bytes>,
    quotas: Database<Str, Bytes>,
    status: RwLock<ReplicaStatus>,
}

impl AuthReplica {
    /// Open (creating if needed) the replica environment at `path`.
    ///
    /// Rows left over from a previous process are not trusted: the replica
    /// reports not-ready until the first snapshot of this process commits.
    pub fn open<P: AsRef<Path>>(path: P, map_size_mb: usize) -> Result<Self, ReplicaError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb * 1024 * 1024)
                .max_dbs(2)
                .open(path.as_ref())
        }
        .map_err(|e| ReplicaError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| ReplicaError::Transaction(e.to_string()))?;
        let keys: Database<Str, Bytes> = env
            .create_database(&mut wtxn, Some(AUTH_KEYS_DB))
            .map_err(|e| ReplicaError::DbOpen(e.to_string()))?;
        let quotas: Database<Str, Bytes> = env
            .create_database(&mut wtxn, Some(QUOTAS_DB))
            .map_err(|e| ReplicaError::DbOpen(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| ReplicaError::Transaction(e.to_string()))?;

        Ok(Self {
            env,
            keys,
            quotas,
            status: RwLock::new(ReplicaStatus::default()),
        })
    }

    pub fn status(&self) -> ReplicaStatus {
        self.status
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn is_ready(&self) -> bool {
        self.status().is_ready()
    }

    /// Replace both tables with `snapshot` in one write transaction.
    pub fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<ReplicaStatus, ReplicaError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| ReplicaError::Transaction(e.to_string()))?;

        self.keys
            .clear(&mut wtxn)
            .map_err(|e| ReplicaError::Transaction(e.to_string()))?;
        self.quotas
            .clear(&mut wtxn)
            .map_err(|e| ReplicaError::Transaction(e.to_string()))?;

        for fact in &snapshot.keys {
            let value = serde_json::to_vec(fact)
                .map_err(|e| ReplicaError::Serialization(e.to_string()))?;
            self.keys
                .put(&mut wtxn, &fact.key_hash, &value)
                .map_err(|e| ReplicaError::Transaction(e.to_string()))?;
        }
        for fact in &snapshot.quotas {
            let value = serde_json::to_vec(fact)
                .map_err(|e| ReplicaError::Serialization(e.to_string()))?;
            self.quotas
                .put(&mut wtxn, &fact.user_id, &value)
                .map_err(|e| ReplicaError::Transaction(e.to_string()))?;
        }

        // Duplicate keys in a snapshot collapse, so count what was stored.
        let key_count = self
            .keys
            .len(&wtxn)
            .map_err(|e| ReplicaError::Transaction(e.to_string()))?;
        let quota_count = self
            .quotas
            .len(&wtxn)
            .map_err(|e| ReplicaError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| ReplicaError::Transaction(e.to_string()))?;

        let status = match self.status.write() {
            Ok(mut status) => {
                status.last_update += 1;
                status.key_count = key_count;
                status.quota_count = quota_count;
                status.updated_at = Some(Utc::now());
                status.clone()
            }
            Err(_) => return Err(ReplicaError::Transaction("status lock poisoned".to_string())),
        };

        tracing::info!(
            last_update = status.last_update,
            keys = key_count,
            quotas = quota_count,
            "Applied auth snapshot"
        );
        Ok(status)
    }

    /// Authorize a raw bearer token.
    ///
    /// Storage failures are logged and reported as `NotReady`, which callers
    /// surface as a retryable error.
    pub fn authorize(&self, bearer_token: &str) -> Result<Authorized, AuthDenial> {
        if !self.is_ready() {
            return Err(AuthDenial::NotReady);
        }
        let token = bearer_token.trim();
        if token.is_empty() {
            return Err(AuthDenial::InvalidKey);
        }

        self.read(|replica, rtxn| {
            let key_hash = hash_api_key(token);
            let Some(fact) = replica.read_json::<AuthFact>(replica.keys, rtxn, &key_hash)? else {
                return Ok(Err(AuthDenial::InvalidKey));
            };
            if !fact.active {
                return Ok(Err(AuthDenial::KeyInactive));
            }
            replica.quota_decision(rtxn, &fact.user_id)
        })
    }

    /// Quota decision for an already-identified user.
    pub fn check_quota(&self, user_id: &str) -> Result<Authorized, AuthDenial> {
        if !self.is_ready() {
            return Err(AuthDenial::NotReady);
        }
        self.read(|replica, rtxn| replica.quota_decision(rtxn, user_id))
    }

    pub fn key(&self, key_hash: &str) -> Result<Option<AuthFact>, ReplicaError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| ReplicaError::Transaction(e.to_string()))?;
        self.read_json(self.keys, &rtxn, key_hash)
    }

    pub fn quota(&self, user_id: &str) -> Result<Option<QuotaFact>, ReplicaError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| ReplicaError::Transaction(e.to_string()))?;
        self.read_json(self.quotas, &rtxn, user_id)
    }

    fn read<F>(&self, f: F) -> Result<Authorized, AuthDenial>
    where
        F: FnOnce(&Self, &RoTxn<'_>) -> Result<Result<Authorized, AuthDenial>, ReplicaError>,
    {
        let outcome = self
            .env
            .read_txn()
            .map_err(|e| ReplicaError::Transaction(e.to_string()))
            .and_then(|rtxn| f(self, &rtxn));
        match outcome {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(error = %e, "Auth replica read failed");
                Err(AuthDenial::NotReady)
            }
        }
    }

    fn quota_decision(
        &self,
        rtxn: &RoTxn<'_>,
        user_id: &str,
    ) -> Result<Result<Authorized, AuthDenial>, ReplicaError> {
        // An active key without a quota row has no allowance.
        let Some(quota) = self.read_json::<QuotaFact>(self.quotas, rtxn, user_id)? else {
            return Ok(Err(AuthDenial::QuotaExceeded {
                current_usage: 0,
                monthly_limit: 0,
            }));
        };
        if quota.subscription_blocks_usage() {
            return Ok(Err(AuthDenial::SubscriptionInactive {
                status: quota.subscription_status,
            }));
        }
        if !quota.has_remaining() {
            return Ok(Err(AuthDenial::QuotaExceeded {
                current_usage: quota.current_usage,
                monthly_limit: quota.monthly_limit,
            }));
        }
        Ok(Ok(Authorized {
            user_id: quota.user_id.clone(),
            remaining: quota.remaining(),
            plan: quota.plan,
        }))
    }

    fn read_json<T: DeserializeOwned>(
        &self,
        db: Database<Str, Bytes>,
        rtxn: &RoTxn<'_>,
        key: &str,
    ) -> Result<Option<T>, ReplicaError> {
        let Some(bytes) = db
            .get(rtxn, key)
            .map_err(|e| ReplicaError::Transaction(e.to_string()))?
        else {
            return Ok(None);
        };
        serde_json::from_slice(bytes)
            .map(Some)
            .map_err(|e| ReplicaError::Deserialization(format!("{}: {}", key, e)))
    }
}
