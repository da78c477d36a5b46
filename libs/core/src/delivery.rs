use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SendError;

/// Outcome of one logical send, returned to the orchestrator.
///
/// Invariant: `success` is true iff `id` is present and `error` is absent.
/// Use [`DeliveryResult::delivered`] and [`DeliveryResult::failed`] so the
/// invariant cannot be broken by hand-rolled construction.
///
/// ```
/// use courier_core::{DeliveryResult, SendError};
///
/// let ok = DeliveryResult::delivered("msg-1", serde_json::json!({"ok": true}));
/// assert!(ok.success && ok.id.is_some() && ok.error.is_none());
///
/// let failed = DeliveryResult::failed(&SendError::Security("ftp scheme".into()));
/// assert!(!failed.success && !failed.is_temporary && failed.is_local_error);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    pub success: bool,
    /// Provider-assigned message identifier; correlates later webhook events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Raw provider payload, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Retry guidance for the orchestrator.
    #[serde(default)]
    pub is_temporary: bool,
    /// Adapter-wide cool-down hint in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_duration: Option<u64>,
    /// Failure detected before any network call was made.
    #[serde(default)]
    pub is_local_error: bool,
}

impl DeliveryResult {
    pub fn delivered(id: impl Into<String>, response: Value) -> Self {
        Self {
            success: true,
            id: Some(id.into()),
            response: Some(response),
            error: None,
            is_temporary: false,
            pause_duration: None,
            is_local_error: false,
        }
    }

    pub fn failed(err: &SendError) -> Self {
        Self {
            success: false,
            id: None,
            response: None,
            error: Some(err.to_string()),
            is_temporary: err.is_temporary(),
            pause_duration: err.pause().map(|d| d.as_secs()),
            is_local_error: err.is_local(),
        }
    }
}

/// Snapshot of adapter reachability, produced fresh on every probe and never
/// cached by this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}
