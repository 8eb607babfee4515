//! Device-binding guard: one account per device, enforced at
//! registration and sign-in.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::session::{DeviceId, Session};
use crate::error::{AuthError, DatabaseError};
use crate::store::{Account, AccountStore, SessionStore};

/// Allow the presented device only if the account is unbound or bound to it.
pub fn check_binding(bound: Option<&str>, presented: &DeviceId) -> Result<(), AuthError> {
    match bound {
        Some(bound) if bound != presented.as_str() => Err(AuthError::DeviceMismatch),
        _ => Ok(()),
    }
}

/// SHA-256 hex digest of a credential.
pub(crate) fn credential_digest(credential: &SecretString) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential.expose_secret().as_bytes());
    hex::encode(hasher.finalize())
}

pub struct DeviceGuard {
    accounts: Arc<dyn AccountStore>,
    sessions: Arc<dyn SessionStore>,
}

impl DeviceGuard {
    pub fn new(accounts: Arc<dyn AccountStore>, sessions: Arc<dyn SessionStore>) -> Self {
        Self { accounts, sessions }
    }

    /// Create an account bound to `device` and sign it in.
    pub async fn register(
        &self,
        account_id: &str,
        credential: &SecretString,
        device: &DeviceId,
    ) -> Result<Session, AuthError> {
        let account_id = account_id.trim();
        if account_id.is_empty() || credential.expose_secret().trim().is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        if self.accounts.find_by_device(device.as_str()).await?.is_some() {
            warn!(device_id = %device, "Registration refused, device already bound");
            return Err(AuthError::DeviceAlreadyBound);
        }
        if self.accounts.get_account(account_id).await?.is_some() {
            return Err(AuthError::AccountExists(account_id.to_string()));
        }

        let account = Account {
            account_id: account_id.to_string(),
            credential_digest: credential_digest(credential),
            bound_device_id: Some(device.as_str().to_string()),
            balance: Decimal::ZERO,
            created_at: Utc::now(),
        };
        match self.accounts.create_account(&account).await {
            Ok(()) => {}
            Err(DatabaseError::Constraint(_)) => {
                return Err(AuthError::AccountExists(account_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        info!(account_id = %account_id, device_id = %device, "Account registered");
        self.open_session(account_id, device).await
    }

    /// Sign in from `device`. On any denial the stored session is untouched.
    pub async fn sign_in(
        &self,
        account_id: &str,
        credential: &SecretString,
        device: &DeviceId,
    ) -> Result<Session, AuthError> {
        let account_id = account_id.trim();
        if account_id.is_empty() || credential.expose_secret().is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        let account = self
            .accounts
            .get_account(account_id)
            .await?
            .ok_or_else(|| AuthError::AccountNotFound(account_id.to_string()))?;

        if account.credential_digest != credential_digest(credential) {
            return Err(AuthError::InvalidCredential);
        }

        if let Err(e) = check_binding(account.bound_device_id.as_deref(), device) {
            warn!(account_id = %account_id, device_id = %device, "Sign-in refused, device mismatch");
            return Err(e);
        }

        info!(account_id = %account_id, "Signed in");
        self.open_session(account_id, device).await
    }

    pub async fn sign_out(&self) -> Result<(), AuthError> {
        self.sessions.clear_session().await?;
        info!("Signed out");
        Ok(())
    }

    pub async fn current_session(&self) -> Result<Option<Session>, AuthError> {
        Ok(self.sessions.load_session().await?)
    }

    async fn open_session(&self, account_id: &str, device: &DeviceId) -> Result<Session, AuthError> {
        let session = Session::new(account_id, device.as_str());
        self.sessions.save_session(&session).await?;
        Ok(session)
    }
}
