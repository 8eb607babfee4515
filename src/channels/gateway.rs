//! HTTP gateway channel: hands each transmission to an SMS gateway.
//!
//! The gateway answers the POST with accept/reject. Delivery reports come
//! back later through the `/api/delivery` webhook with the correlation
//! data echoed.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::{Correlation, SmsChannel, segment_count};
use crate::dispatch::NormalizedAddress;
use crate::error::ChannelError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub struct GatewayChannel {
    name: String,
    url: String,
    slot: usize,
    token: Option<SecretString>,
    client: reqwest::Client,
}

impl GatewayChannel {
    pub fn new(slot: usize, url: impl Into<String>, token: Option<SecretString>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to build gateway client, using defaults");
                reqwest::Client::new()
            });

        Self {
            name: format!("gateway-{slot}"),
            url: url.into().trim_end_matches('/').to_string(),
            slot,
            token,
            client,
        }
    }

    fn send_url(&self) -> String {
        format!("{}/send", self.url)
    }
}

#[async_trait]
impl SmsChannel for GatewayChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn transmit(
        &self,
        address: &NormalizedAddress,
        body: &str,
        correlation: &Correlation,
    ) -> Result<usize, ChannelError> {
        let parts = segment_count(body);
        let payload = serde_json::json!({
            "to": address.as_str(),
            "body": body,
            "parts": parts,
            "slot": self.slot,
            "correlation": correlation,
        });

        let mut request = self.client.post(self.send_url()).json(&payload);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ChannelError::Timeout {
                    name: self.name.clone(),
                    timeout: REQUEST_TIMEOUT,
                }
            } else {
                ChannelError::Unreachable {
                    name: self.name.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Rejected {
                name: self.name.clone(),
                reason: format!("gateway returned {status}: {detail}"),
            });
        }

        Ok(parts)
    }
}
