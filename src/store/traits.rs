//! Store traits: the operations the engine consumes from external stores.
//!
//! Each collaborator gets its own narrow trait so the dispatch loop, the
//! outcome applier and the device guard only see what they use. The libSQL
//! backend implements all of them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::auth::Session;
use crate::dispatch::RawJob;
use crate::error::DatabaseError;

/// A registered account.
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub account_id: String,
    #[serde(skip_serializing)]
    pub credential_digest: String,
    pub bound_device_id: Option<String>,
    #[serde(with = "rust_decimal::serde::str")]
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Status written to the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Sent,
    Failed,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for AuditStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown audit status '{other}'")),
        }
    }
}

/// Append-only record of one delivery outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Job the record belongs to. Unique when present.
    pub job_id: Option<String>,
    pub account_id: String,
    pub address: String,
    pub status: AuditStatus,
    pub timestamp: DateTime<Utc>,
}

/// Shared queue of pending send-jobs.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Fetch every pending job, in queue order.
    async fn fetch_pending(&self) -> Result<Vec<RawJob>, DatabaseError>;

    /// Remove a job so later fetches no longer return it.
    async fn retire(&self, job_id: &str) -> Result<(), DatabaseError>;
}

/// Account storage.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self, account_id: &str) -> Result<Option<Account>, DatabaseError>;

    async fn find_by_device(&self, device_id: &str) -> Result<Option<Account>, DatabaseError>;

    /// Create an account. Fails with `Constraint` if the id is taken.
    async fn create_account(&self, account: &Account) -> Result<(), DatabaseError>;

    /// Atomically add `amount` to the account's balance.
    async fn increment_balance(&self, account_id: &str, amount: Decimal)
    -> Result<(), DatabaseError>;
}

/// Append-only audit log.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> Result<(), DatabaseError>;

    /// Records for one account, newest first.
    async fn list_for_account(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, DatabaseError>;
}

/// Store-side dedupe of applied outcomes, keyed by job id.
#[async_trait]
pub trait OutcomeLedger: Send + Sync {
    /// Claim a job id. Returns `true` only for the first claim.
    async fn claim(&self, job_id: &str, account_id: &str) -> Result<bool, DatabaseError>;
}

/// Transmissions this relay issued. Completion signals are only honoured
/// for jobs recorded here.
#[async_trait]
pub trait IssueLog: Send + Sync {
    async fn record_issued(&self, job_id: &str, account_id: &str) -> Result<(), DatabaseError>;

    /// Account the job was issued for, or `None` if it never was.
    async fn issued_account(&self, job_id: &str) -> Result<Option<String>, DatabaseError>;
}

/// Local state that survives restarts: the signed-in session and the
/// per-installation device identifier.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self) -> Result<Option<Session>, DatabaseError>;

    async fn save_session(&self, session: &Session) -> Result<(), DatabaseError>;

    async fn clear_session(&self) -> Result<(), DatabaseError>;

    async fn load_device_id(&self) -> Result<Option<String>, DatabaseError>;

    async fn save_device_id(&self, device_id: &str) -> Result<(), DatabaseError>;
}
