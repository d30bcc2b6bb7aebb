//! Payload validation.
//!
//! The core stores and forwards payloads without reading them. Front-ends
//! plug in a schema so malformed submissions are refused up front.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub trait PayloadSchema: Send + Sync {
    fn validate(&self, payload: &serde_json::Value) -> Result<()>;
}

/// Accepts any payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyPayload;

impl PayloadSchema for AnyPayload {
    fn validate(&self, _payload: &serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// A package build request as sent by the chat and source-control front-ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub packages: Vec<String>,
    pub git_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_pr: Option<u64>,
    /// Front-end routing data (chat id, comment thread); echoed back in notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<serde_json::Value>,
}

/// Validates payloads against [`BuildRequest`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildRequestSchema;

impl PayloadSchema for BuildRequestSchema {
    fn validate(&self, payload: &serde_json::Value) -> Result<()> {
        let request: BuildRequest = serde_json::from_value(payload.clone())
            .map_err(|e| Error::InvalidPayload(e.to_string()))?;

        if request.git_ref.trim().is_empty() {
            return Err(Error::InvalidPayload("git_ref is empty".to_string()));
        }
        if request.packages.is_empty() {
            return Err(Error::InvalidPayload("no packages given".to_string()));
        }
        if request.packages.iter().any(|p| p.trim().is_empty()) {
            return Err(Error::InvalidPayload("empty package name".to_string()));
        }
        Ok(())
    }
}
