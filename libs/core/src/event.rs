use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Canonical delivery-status taxonomy.
///
/// Every provider's webhook vocabulary is normalized into one of these;
/// events that carry no terminal meaning (queued, sent-but-not-delivered,
/// delayed) are dropped before reaching the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventStatus {
    #[serde(rename = "ACCEPTED")]
    Accepted,
    #[serde(rename = "DELIVERED")]
    Delivered,
    #[serde(rename = "OPENED")]
    Opened,
    #[serde(rename = "CLICKED")]
    Clicked,
    #[serde(rename = "SOFT-REJECT")]
    SoftReject,
    #[serde(rename = "HARD-REJECT")]
    HardReject,
    #[serde(rename = "COMPLAINED")]
    Complained,
    #[serde(rename = "UNSUBSCRIBED")]
    Unsubscribed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Accepted => "ACCEPTED",
            EventStatus::Delivered => "DELIVERED",
            EventStatus::Opened => "OPENED",
            EventStatus::Clicked => "CLICKED",
            EventStatus::SoftReject => "SOFT-REJECT",
            EventStatus::HardReject => "HARD-REJECT",
            EventStatus::Complained => "COMPLAINED",
            EventStatus::Unsubscribed => "UNSUBSCRIBED",
        }
    }
}

/// Normalized webhook event handed back to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub status: EventStatus,
    /// Correlates to the `id` returned by the original send.
    pub message_id: String,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<OffsetDateTime>,
}

impl WebhookEvent {
    pub fn new(status: EventStatus, message_id: impl Into<String>) -> Self {
        Self {
            status,
            message_id: message_id.into(),
            timestamp: None,
        }
    }

    pub fn at(mut self, timestamp: OffsetDateTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Keyword fallback for event names missing from an adapter's vocabulary
/// table. Deterministic: the same input always yields the same status.
///
/// Order matters: "soft_bounce_detected" must hit the soft branch before
/// the generic bounce branch. Unsubscribes normalize to a hard reject
/// because they are a standing suppression signal, not an engagement event.
pub fn normalize_by_keyword(event_type: &str) -> Option<EventStatus> {
    let name = event_type.to_ascii_lowercase();
    if name.contains("unsub") {
        return Some(EventStatus::HardReject);
    }
    if name.contains("soft") && (name.contains("bounce") || name.contains("reject")) {
        return Some(EventStatus::SoftReject);
    }
    if name.contains("defer") {
        return None;
    }
    if name.contains("bounce") || name.contains("reject") || name.contains("fail") {
        return Some(EventStatus::HardReject);
    }
    if name.contains("complain") || name.contains("spam") || name.contains("abuse") {
        return Some(EventStatus::Complained);
    }
    if name.contains("click") {
        return Some(EventStatus::Clicked);
    }
    if name.contains("open") {
        return Some(EventStatus::Opened);
    }
    if name.contains("deliver") {
        return Some(EventStatus::Delivered);
    }
    None
}
