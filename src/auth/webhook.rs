//! Bearer-token check for the delivery webhook.
//!
//! Only the SHA-256 digest of the configured token is held; presented
//! tokens are hashed and compared against it.

use secrecy::SecretString;
use tracing::warn;

use super::guard::credential_digest;

#[derive(Debug, Clone, Default)]
pub struct WebhookAuth {
    token_digest: Option<String>,
}

impl WebhookAuth {
    /// Without a token the webhook refuses every report.
    pub fn new(token: Option<&SecretString>) -> Self {
        Self {
            token_digest: token.map(credential_digest),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token_digest.is_some()
    }

    /// Check the raw `Authorization` header value.
    pub fn authorize(&self, header: Option<&str>) -> bool {
        let Some(expected) = &self.token_digest else {
            return false;
        };
        let Some(token) = header.and_then(|h| h.strip_prefix("Bearer ")) else {
            warn!("Delivery report without bearer token");
            return false;
        };
        let presented = credential_digest(&SecretString::from(token.trim().to_string()));
        if &presented != expected {
            warn!("Delivery report with invalid token");
            return false;
        }
        true
    }
}
