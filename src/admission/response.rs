//! Mapping admission outcomes to what the caller sees.

use serde::Serialize;

use super::gate::AdmissionDecision;
use crate::error::AdmissionError;

/// The caller-facing shape of an admission outcome, in HTTP terms.
///
/// Which window rejected a request is never part of the response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallerResponse {
    /// HTTP-equivalent status code
    pub status: u16,
    /// `Retry-After` header value in seconds, set on deferral only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Human-readable message body
    pub msg: String,
}

impl CallerResponse {
    pub fn accepted() -> Self {
        Self {
            status: 200,
            retry_after: None,
            msg: "Task is being processed".to_string(),
        }
    }

    pub fn deferred(retry_after_secs: u64) -> Self {
        Self {
            status: 202,
            retry_after: Some(retry_after_secs),
            msg: "Task queued due to rate limit.".to_string(),
        }
    }

    pub fn internal_error() -> Self {
        Self {
            status: 500,
            retry_after: None,
            msg: "Internal Server Error".to_string(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: 400,
            retry_after: None,
            msg: msg.into(),
        }
    }

    /// `Retry-After` header as a name/value pair, if any.
    pub fn retry_after_header(&self) -> Option<(&'static str, String)> {
        self.retry_after.map(|secs| ("Retry-After", secs.to_string()))
    }
}

impl From<&Result<AdmissionDecision, AdmissionError>> for CallerResponse {
    fn from(result: &Result<AdmissionDecision, AdmissionError>) -> Self {
        match result {
            Ok(AdmissionDecision::Accepted) => CallerResponse::accepted(),
            Ok(AdmissionDecision::Deferred {
                retry_after_secs, ..
            }) => CallerResponse::deferred(*retry_after_secs),
            Err(AdmissionError::Validation(msg)) => CallerResponse::bad_request(msg.clone()),
            Err(AdmissionError::Store(_)) | Err(AdmissionError::Queue(_)) => {
                CallerResponse::internal_error()
            }
        }
    }
}
