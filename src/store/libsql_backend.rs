//! libSQL backend: implements every store trait against one local database.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::info;

use crate::auth::Session;
use crate::dispatch::RawJob;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    Account, AccountStore, AuditRecord, AuditSink, IssueLog, OutcomeLedger, SessionStore,
    TaskSource,
};

/// Balances are stored as integer ten-thousandths of a currency unit.
const BALANCE_SCALE: u32 = 4;

const SESSION_KEY: &str = "session";
const DEVICE_ID_KEY: &str = "device_id";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Put a job on the local queue. Fields may be absent to model
    /// upstream data that arrives incomplete.
    pub async fn enqueue_task(
        &self,
        id: &str,
        phone: Option<&str>,
        message: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO sms_tasks (id, phone, message, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, opt_text(phone), opt_text(message), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| map_insert_error("enqueue_task", e))?;
        Ok(())
    }

    async fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT value FROM local_state WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_state: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<String>(0).ok()),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_state: {e}"))),
        }
    }

    async fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO local_state (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO UPDATE SET value = ?2, updated_at = ?3",
                params![key, value, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_state: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn to_units(amount: Decimal) -> Result<i64, DatabaseError> {
    (amount * Decimal::from(10_i64.pow(BALANCE_SCALE)))
        .round()
        .to_i64()
        .ok_or_else(|| DatabaseError::Serialization(format!("amount {amount} out of range")))
}

fn from_units(units: i64) -> Decimal {
    Decimal::new(units, BALANCE_SCALE).normalize()
}

fn map_insert_error(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

/// Map a libsql Row to a RawJob.
fn row_to_job(row: &libsql::Row) -> RawJob {
    RawJob {
        id: row.get::<String>(0).ok(),
        destination: row.get::<String>(1).ok(),
        body: row.get::<String>(2).ok(),
    }
}

/// Map a libsql Row to an Account.
///
/// Column order matches ACCOUNT_COLUMNS.
fn row_to_account(row: &libsql::Row) -> Result<Account, libsql::Error> {
    let created_str: String = row.get(4)?;
    Ok(Account {
        account_id: row.get(0)?,
        credential_digest: row.get(1)?,
        bound_device_id: row.get::<String>(2).ok(),
        balance: from_units(row.get::<i64>(3)?),
        created_at: parse_datetime(&created_str),
    })
}

/// Map a libsql Row to an AuditRecord.
///
/// Column order matches AUDIT_COLUMNS.
fn row_to_audit(row: &libsql::Row) -> Result<AuditRecord, libsql::Error> {
    let status_str: String = row.get(3)?;
    let ts_str: String = row.get(4)?;
    Ok(AuditRecord {
        job_id: row.get::<String>(0).ok(),
        account_id: row.get(1)?,
        address: row.get(2)?,
        status: status_str
            .parse()
            .unwrap_or(crate::store::traits::AuditStatus::Failed),
        timestamp: parse_datetime(&ts_str),
    })
}

const ACCOUNT_COLUMNS: &str =
    "account_id, credential_digest, bound_device_id, balance_units, created_at";

const AUDIT_COLUMNS: &str = "job_id, account_id, address, status, timestamp";

// ── Trait implementations ───────────────────────────────────────────

#[async_trait]
impl TaskSource for LibSqlBackend {
    async fn fetch_pending(&self) -> Result<Vec<RawJob>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, phone, message FROM sms_tasks ORDER BY created_at, rowid",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_pending: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_pending: {e}")))?
        {
            jobs.push(row_to_job(&row));
        }
        Ok(jobs)
    }

    async fn retire(&self, job_id: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute("DELETE FROM sms_tasks WHERE id = ?1", params![job_id])
            .await
            .map_err(|e| DatabaseError::Query(format!("retire: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for LibSqlBackend {
    async fn get_account(&self, account_id: &str) -> Result<Option<Account>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE account_id = ?1"),
                params![account_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_account: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_account(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Serialization(format!("get_account: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_account: {e}"))),
        }
    }

    async fn find_by_device(&self, device_id: &str) -> Result<Option<Account>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE bound_device_id = ?1 LIMIT 1"
                ),
                params![device_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_by_device: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_account(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Serialization(format!("find_by_device: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_by_device: {e}"))),
        }
    }

    async fn create_account(&self, account: &Account) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO accounts ({ACCOUNT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                params![
                    account.account_id.as_str(),
                    account.credential_digest.as_str(),
                    opt_text(account.bound_device_id.as_deref()),
                    to_units(account.balance)?,
                    account.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| map_insert_error("create_account", e))?;
        Ok(())
    }

    async fn increment_balance(
        &self,
        account_id: &str,
        amount: Decimal,
    ) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE accounts SET balance_units = balance_units + ?1 WHERE account_id = ?2",
                params![to_units(amount)?, account_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("increment_balance: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "account".to_string(),
                id: account_id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AuditSink for LibSqlBackend {
    async fn append(&self, record: &AuditRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO audit_log ({AUDIT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                params![
                    opt_text(record.job_id.as_deref()),
                    record.account_id.as_str(),
                    record.address.as_str(),
                    record.status.as_str(),
                    record.timestamp.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| map_insert_error("append_audit", e))?;
        Ok(())
    }

    async fn list_for_account(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE account_id = ?1 \
                     ORDER BY timestamp DESC, id DESC LIMIT ?2"
                ),
                params![account_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_for_account: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_for_account: {e}")))?
        {
            let record = row_to_audit(&row)
                .map_err(|e| DatabaseError::Serialization(format!("list_for_account: {e}")))?;
            records.push(record);
        }
        Ok(records)
    }
}

#[async_trait]
impl OutcomeLedger for LibSqlBackend {
    async fn claim(&self, job_id: &str, account_id: &str) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO delivery_outcomes (job_id, account_id, claimed_at) \
                 VALUES (?1, ?2, ?3)",
                params![job_id, account_id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_outcome: {e}")))?;
        Ok(inserted == 1)
    }
}

#[async_trait]
impl IssueLog for LibSqlBackend {
    async fn record_issued(&self, job_id: &str, account_id: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO issued_jobs (job_id, account_id, issued_at) \
                 VALUES (?1, ?2, ?3)",
                params![job_id, account_id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_issued: {e}")))?;
        Ok(())
    }

    async fn issued_account(&self, job_id: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT account_id FROM issued_jobs WHERE job_id = ?1",
                params![job_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("issued_account: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<String>(0)
                .map(Some)
                .map_err(|e| DatabaseError::Serialization(format!("issued_account: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("issued_account: {e}"))),
        }
    }
}

#[async_trait]
impl SessionStore for LibSqlBackend {
    async fn load_session(&self) -> Result<Option<Session>, DatabaseError> {
        match self.get_state(SESSION_KEY).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| DatabaseError::Serialization(format!("load_session: {e}"))),
            None => Ok(None),
        }
    }

    async fn save_session(&self, session: &Session) -> Result<(), DatabaseError> {
        let raw = serde_json::to_string(session)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.set_state(SESSION_KEY, &raw).await
    }

    async fn clear_session(&self) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM local_state WHERE key = ?1",
                params![SESSION_KEY],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_session: {e}")))?;
        Ok(())
    }

    async fn load_device_id(&self) -> Result<Option<String>, DatabaseError> {
        self.get_state(DEVICE_ID_KEY).await
    }

    async fn save_device_id(&self, device_id: &str) -> Result<(), DatabaseError> {
        self.set_state(DEVICE_ID_KEY, device_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::traits::AuditStatus;
    use rust_decimal_macros::dec;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_account(id: &str, device: &str) -> Account {
        Account {
            account_id: id.to_string(),
            credential_digest: "digest".to_string(),
            bound_device_id: Some(device.to_string()),
            balance: Decimal::ZERO,
            created_at: Utc::now(),
        }
    }

    fn make_record(job_id: &str, status: AuditStatus) -> AuditRecord {
        AuditRecord {
            job_id: Some(job_id.to_string()),
            account_id: "acc".to_string(),
            address: "+919876543210".to_string(),
            status,
            timestamp: Utc::now(),
        }
    }

    // ── Tasks ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn fetch_returns_queue_order() {
        let db = test_db().await;
        db.enqueue_task("a", Some("111"), Some("one")).await.unwrap();
        db.enqueue_task("b", Some("222"), Some("two")).await.unwrap();

        let jobs = db.fetch_pending().await.unwrap();
        let ids: Vec<_> = jobs.iter().map(|j| j.id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(jobs[1].body.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn incomplete_rows_surface_as_missing_fields() {
        let db = test_db().await;
        db.enqueue_task("x", None, Some("body")).await.unwrap();

        let jobs = db.fetch_pending().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].destination.is_none());
        assert_eq!(jobs[0].body.as_deref(), Some("body"));
    }

    #[tokio::test]
    async fn retire_removes_from_later_fetches() {
        let db = test_db().await;
        db.enqueue_task("j1", Some("9876543210"), Some("hi")).await.unwrap();

        db.retire("j1").await.unwrap();
        assert!(db.fetch_pending().await.unwrap().is_empty());

        // Retiring an absent job is not an error
        db.retire("j1").await.unwrap();
    }

    // ── Accounts ────────────────────────────────────────────────────

    #[tokio::test]
    async fn create_and_lookup_account() {
        let db = test_db().await;
        db.create_account(&make_account("9876543210", "D1")).await.unwrap();

        let by_id = db.get_account("9876543210").await.unwrap().unwrap();
        assert_eq!(by_id.bound_device_id.as_deref(), Some("D1"));
        assert_eq!(by_id.balance, Decimal::ZERO);

        let by_device = db.find_by_device("D1").await.unwrap().unwrap();
        assert_eq!(by_device.account_id, "9876543210");

        assert!(db.find_by_device("D2").await.unwrap().is_none());
        assert!(db.get_account("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_account_is_constraint_error() {
        let db = test_db().await;
        db.create_account(&make_account("acc", "D1")).await.unwrap();
        let err = db.create_account(&make_account("acc", "D2")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn increment_balance_accumulates_exactly() {
        let db = test_db().await;
        db.create_account(&make_account("acc", "D1")).await.unwrap();

        for _ in 0..3 {
            db.increment_balance("acc", dec!(0.16)).await.unwrap();
        }

        let account = db.get_account("acc").await.unwrap().unwrap();
        assert_eq!(account.balance, dec!(0.48));
    }

    #[tokio::test]
    async fn increment_balance_unknown_account() {
        let db = test_db().await;
        let err = db.increment_balance("ghost", dec!(0.16)).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    // ── Audit ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn audit_list_is_newest_first() {
        let db = test_db().await;
        let mut first = make_record("j1", AuditStatus::Sent);
        first.timestamp = Utc::now() - chrono::Duration::minutes(5);
        db.append(&first).await.unwrap();
        db.append(&make_record("j2", AuditStatus::Failed)).await.unwrap();

        let records = db.list_for_account("acc", 10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].job_id.as_deref(), Some("j2"));
        assert_eq!(records[0].status, AuditStatus::Failed);
        assert_eq!(records[1].status, AuditStatus::Sent);

        let limited = db.list_for_account("acc", 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn audit_rejects_second_record_for_job() {
        let db = test_db().await;
        db.append(&make_record("j1", AuditStatus::Sent)).await.unwrap();
        let err = db.append(&make_record("j1", AuditStatus::Sent)).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
        assert_eq!(db.list_for_account("acc", 10).await.unwrap().len(), 1);
    }

    // ── Ledger ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn ledger_claims_once() {
        let db = test_db().await;
        assert!(db.claim("j1", "acc").await.unwrap());
        assert!(!db.claim("j1", "acc").await.unwrap());
        assert!(db.claim("j2", "acc").await.unwrap());
    }

    // ── Issue log ───────────────────────────────────────────────────

    #[tokio::test]
    async fn issue_log_tracks_account_per_job() {
        let db = test_db().await;
        assert!(db.issued_account("j1").await.unwrap().is_none());

        db.record_issued("j1", "acc").await.unwrap();
        assert_eq!(db.issued_account("j1").await.unwrap().as_deref(), Some("acc"));
        assert!(db.issued_account("j2").await.unwrap().is_none());

        // Re-issuing a job id records the latest account
        db.record_issued("j1", "other").await.unwrap();
        assert_eq!(db.issued_account("j1").await.unwrap().as_deref(), Some("other"));
    }

    // ── Session ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn session_save_load_clear() {
        let db = test_db().await;
        assert!(db.load_session().await.unwrap().is_none());

        let session = Session::new("9876543210", "D1");
        db.save_session(&session).await.unwrap();
        assert_eq!(db.load_session().await.unwrap(), Some(session));

        db.clear_session().await.unwrap();
        assert!(db.load_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn device_id_persists() {
        let db = test_db().await;
        assert!(db.load_device_id().await.unwrap().is_none());
        db.save_device_id("install-1").await.unwrap();
        db.save_device_id("install-1").await.unwrap();
        assert_eq!(db.load_device_id().await.unwrap().as_deref(), Some("install-1"));
    }

    #[test]
    fn unit_conversion() {
        assert_eq!(to_units(dec!(0.16)).unwrap(), 1600);
        assert_eq!(from_units(1600), dec!(0.16));
        assert_eq!(from_units(0), Decimal::ZERO);
    }
}
