//! Outcome applier: balance credit, audit record and failure streak,
//! applied at most once per job id.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::correlator::{DeliveryOutcome, DeliveryResult};
use crate::config::DeliveryConfig;
use crate::dispatch::{ProgressEvent, ProgressObserver};
use crate::error::{DatabaseError, DeliveryError};
use crate::store::{AccountStore, AuditRecord, AuditSink, AuditStatus, IssueLog, OutcomeLedger};

/// Consecutive failed outcomes since the last confirmation.
#[derive(Debug, Default)]
pub struct FailureStreak(AtomicU32);

impl FailureStreak {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count one failure and return the new streak.
    pub fn record_failure(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst).saturating_add(1)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    pub fn current(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// What `apply` did with an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// First application. `streak` is the failure streak afterwards.
    Applied { result: DeliveryResult, streak: u32 },
    /// The job id was already applied; nothing was written.
    Duplicate,
    /// The outcome doesn't match a transmission this relay issued; nothing
    /// was written.
    Unverified,
}

/// Bounded set of recently applied job ids, oldest evicted first.
struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns `false` if the id was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

/// Applies delivery outcomes to the account and audit stores.
pub struct OutcomeApplier {
    accounts: Arc<dyn AccountStore>,
    audit: Arc<dyn AuditSink>,
    ledger: Arc<dyn OutcomeLedger>,
    issued: Arc<dyn IssueLog>,
    observer: Arc<ProgressObserver>,
    streak: Arc<FailureStreak>,
    config: DeliveryConfig,
    recent: Mutex<RecentIds>,
}

impl OutcomeApplier {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        audit: Arc<dyn AuditSink>,
        ledger: Arc<dyn OutcomeLedger>,
        issued: Arc<dyn IssueLog>,
        observer: Arc<ProgressObserver>,
        streak: Arc<FailureStreak>,
        config: DeliveryConfig,
    ) -> Self {
        let recent = Mutex::new(RecentIds::new(config.dedupe_capacity));
        Self {
            accounts,
            audit,
            ledger,
            issued,
            observer,
            streak,
            config,
            recent,
        }
    }

    pub fn streak(&self) -> &Arc<FailureStreak> {
        &self.streak
    }

    /// Apply an outcome once. Store failures are logged, never returned.
    pub async fn apply(&self, outcome: DeliveryOutcome) -> ApplyOutcome {
        if let Err(e) = self.verify(&outcome).await {
            warn!(
                job_id = %outcome.job_id,
                account_id = %outcome.account_id,
                error = %e,
                "Dropping unverified delivery outcome"
            );
            return ApplyOutcome::Unverified;
        }

        if !self.remember(&outcome.job_id) {
            debug!(job_id = %outcome.job_id, "Outcome already applied in this process");
            return ApplyOutcome::Duplicate;
        }

        match self.ledger.claim(&outcome.job_id, &outcome.account_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %outcome.job_id, "Outcome already recorded in ledger");
                return ApplyOutcome::Duplicate;
            }
            Err(e) => warn!(
                job_id = %outcome.job_id,
                error = %e,
                "Outcome ledger unavailable, relying on in-process dedupe"
            ),
        }

        let status = match outcome.result {
            DeliveryResult::Confirmed => {
                self.streak.reset();
                if let Err(e) = self
                    .accounts
                    .increment_balance(&outcome.account_id, self.config.reward)
                    .await
                {
                    error!(
                        job_id = %outcome.job_id,
                        account_id = %outcome.account_id,
                        error = %e,
                        "Failed to credit balance"
                    );
                }
                AuditStatus::Sent
            }
            DeliveryResult::Failed => {
                let streak = self.streak.record_failure();
                if streak >= self.config.escalation_threshold {
                    warn!(streak, "Consecutive delivery failures");
                    self.observer.emit(ProgressEvent::Escalation { streak });
                }
                AuditStatus::Failed
            }
        };

        let record = AuditRecord {
            job_id: Some(outcome.job_id.clone()),
            account_id: outcome.account_id.clone(),
            address: outcome.address.clone(),
            status,
            timestamp: Utc::now(),
        };
        match self.audit.append(&record).await {
            Ok(()) => {}
            Err(DatabaseError::Constraint(_)) => {
                debug!(job_id = %outcome.job_id, "Audit record already present")
            }
            Err(e) => warn!(job_id = %outcome.job_id, error = %e, "Failed to append audit record"),
        }

        info!(
            job_id = %outcome.job_id,
            account_id = %outcome.account_id,
            result = ?outcome.result,
            "Delivery outcome applied"
        );
        self.observer.emit(ProgressEvent::Delivered {
            job_id: outcome.job_id,
            address: outcome.address,
            result: outcome.result,
        });

        ApplyOutcome::Applied {
            result: outcome.result,
            streak: self.streak.current(),
        }
    }

    /// The outcome must name a job this relay issued, for the same account.
    async fn verify(&self, outcome: &DeliveryOutcome) -> Result<(), DeliveryError> {
        match self.issued.issued_account(&outcome.job_id).await {
            Ok(Some(account)) if account == outcome.account_id => Ok(()),
            Ok(Some(account)) => Err(DeliveryError::AccountMismatch {
                job_id: outcome.job_id.clone(),
                issued_to: account,
                claimed: outcome.account_id.clone(),
            }),
            Ok(None) => Err(DeliveryError::NotIssued(outcome.job_id.clone())),
            Err(e) => {
                error!(job_id = %outcome.job_id, error = %e, "Issue log unavailable");
                Err(DeliveryError::NotIssued(outcome.job_id.clone()))
            }
        }
    }

    fn remember(&self, job_id: &str) -> bool {
        let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        recent.insert(job_id)
    }
}
