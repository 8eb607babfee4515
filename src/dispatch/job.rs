//! Send-jobs as they come off the queue, and destination normalization.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

static NON_DIAL_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^0-9+]").unwrap());

/// A job exactly as the task source returned it. Any field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawJob {
    pub id: Option<String>,
    #[serde(alias = "phone")]
    pub destination: Option<String>,
    #[serde(alias = "message")]
    pub body: Option<String>,
}

impl RawJob {
    pub fn new(
        id: impl Into<String>,
        destination: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Some(id.into()),
            destination: Some(destination.into()),
            body: Some(body.into()),
        }
    }

    /// Check required fields. Blank strings count as missing.
    pub fn validate(self) -> Result<Job, DispatchError> {
        let id = present(self.id).ok_or(DispatchError::MalformedJob {
            id: "<unknown>".to_string(),
            field: "id",
        })?;

        let destination = present(self.destination).ok_or_else(|| DispatchError::MalformedJob {
                id: id.clone(),
                field: "destination",
            })?;

        let body = present(self.body).ok_or_else(|| DispatchError::MalformedJob {
            id: id.clone(),
            field: "body",
        })?;

        Ok(Job {
            id,
            destination,
            body,
        })
    }
}

fn present(field: Option<String>) -> Option<String> {
    field.filter(|s| !s.trim().is_empty())
}

/// A validated job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub destination: String,
    pub body: String,
}

/// Destination reduced to digits and `+`, always with a leading `+`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedAddress(String);

impl NormalizedAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for NormalizedAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keep only digits and `+`; prepend `default_prefix` when the result does
/// not already start with `+`.
pub fn normalize_address(raw: &str, default_prefix: &str) -> NormalizedAddress {
    let filtered = NON_DIAL_CHARS.replace_all(raw, "");
    if filtered.starts_with('+') {
        NormalizedAddress(filtered.into_owned())
    } else {
        NormalizedAddress(format!("{default_prefix}{filtered}"))
    }
}
