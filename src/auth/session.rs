//! Local session and per-installation device identity.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::SessionStore;

/// The signed-in `(account, device)` pair. Persisted across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub account_id: String,
    pub device_id: String,
}

impl Session {
    pub fn new(account_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            device_id: device_id.into(),
        }
    }
}

/// Identifier of this installation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Use `configured` if given, else the id persisted in local state,
    /// else generate one and persist it.
    pub async fn resolve(
        configured: Option<String>,
        store: &dyn SessionStore,
    ) -> Result<Self, DatabaseError> {
        if let Some(id) = configured {
            return Ok(Self(id));
        }
        if let Some(id) = store.load_device_id().await? {
            return Ok(Self(id));
        }

        let id = Uuid::new_v4().to_string();
        store.save_device_id(&id).await?;
        tracing::info!(device_id = %id, "Generated new device id");
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
