use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::SendError;

/// Canonical cross-channel message handed to an adapter by the orchestrator.
///
/// Created once per send request and consumed exactly once; this layer never
/// retains it. `to` is the only required field; its meaning is
/// channel-dependent (an email address, a chat id, an arbitrary recipient
/// token for the generic webhook adapter).
///
/// ```
/// use courier_core::Message;
///
/// let msg = Message::new("alice@example.com");
/// assert!(msg.validate().is_ok());
/// assert!(Message::new(" ").validate().is_err());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Textual, HTML or template content, depending on the adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Adapter options and template variables, keys unique.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub scheduled_at: Option<OffsetDateTime>,
    /// Routing override; interpreted by the orchestrator, opaque here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn new(to: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            ..Default::default()
        }
    }

    /// Checks the invariants every adapter relies on before building a
    /// provider payload.
    pub fn validate(&self) -> Result<(), SendError> {
        if self.to.trim().is_empty() {
            return Err(SendError::Validation("recipient `to` is empty".into()));
        }
        Ok(())
    }

    /// Returns a `data` entry as a string, accepting bare strings as well as
    /// other scalar JSON values.
    pub fn data_str(&self, key: &str) -> Option<String> {
        self.data.get(key).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// A single attachment, supplied inline or by remote reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(flatten)]
    pub source: AttachmentSource,
    /// Content-ID for images referenced from an HTML body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_cid: Option<String>,
}

/// Where attachment bytes come from. Remote references are subject to the
/// http/https allow-list before any connection is opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttachmentSource {
    /// Base64-encoded content supplied by the caller.
    Content(String),
    /// URL to fetch; only `http` and `https` are ever dereferenced.
    Url(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_roundtrips_with_camel_case_keys() {
        let raw = json!({
            "to": "bob@example.com",
            "subject": "hi",
            "templateId": "welcome",
            "idempotencyKey": "k-1",
            "scheduledAt": "2026-01-01T00:00:00Z",
            "data": { "name": "Bob" },
        });
        let msg: Message = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.template_id.as_deref(), Some("welcome"));
        assert_eq!(msg.idempotency_key.as_deref(), Some("k-1"));
        assert!(msg.scheduled_at.is_some());
        assert_eq!(msg.data_str("name").as_deref(), Some("Bob"));

        let back = serde_json::to_value(&msg).unwrap();
        assert_eq!(back["templateId"], "welcome");
        assert!(back.get("attachments").is_none());
    }

    #[test]
    fn validate_rejects_blank_recipient() {
        assert!(Message::new("").validate().is_err());
        assert!(Message::new("x").validate().is_ok());
    }

    #[test]
    fn data_str_stringifies_scalars() {
        let mut msg = Message::new("x");
        msg.data.insert("n".into(), json!(42));
        assert_eq!(msg.data_str("n").as_deref(), Some("42"));
    }

    #[test]
    fn attachment_source_deserializes_both_shapes() {
        let inline: Attachment =
            serde_json::from_value(json!({ "filename": "a.txt", "content": "aGk=" })).unwrap();
        assert!(matches!(inline.source, AttachmentSource::Content(_)));

        let remote: Attachment = serde_json::from_value(
            json!({ "filename": "a.pdf", "url": "https://example.com/a.pdf" }),
        )
        .unwrap();
        assert!(matches!(remote.source, AttachmentSource::Url(_)));
    }
}
