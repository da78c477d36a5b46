//! Transactional email via the Mandrill (Mailchimp Transactional) API.
//!
//! Three send endpoints are used depending on message shape: plain JSON send,
//! template send when a template id is set, and raw MIME send whenever
//! attachments are present (the raw endpoint is the only one that carries
//! inline images reliably).

use std::collections::BTreeMap;

use async_trait::async_trait;
use courier_core::{
    DeliveryResult, EventStatus, HealthStatus, Message, SendError, WebhookEvent,
};
use courier_request::{EngineError, PreparedRequest, RequestEngine, RetryPolicy};
use courier_security::SortedFieldSignature;
use courier_translator::MimeMessage;
use http::HeaderMap;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use tracing::warn;

use crate::attachments::resolve_attachment;
use crate::registry::{AdapterRegistry, RegistryError};
use crate::traits::{Adapter, AdapterCategory, AdapterMetadata, ValidateOutcome};

pub const PROVIDER_ID: &str = "mandrill";

const SIGNATURE_HEADER: &str = "x-mandrill-signature";

/// Graduated cool-downs for quota exhaustion. The API does not send a
/// retry-after, only a human-readable reason.
const DAILY_QUOTA_PAUSE_SECS: u64 = 3600;
const HOURLY_QUOTA_PAUSE_SECS: u64 = 300;

/// The API wants scheduled sends as a UTC `YYYY-MM-DD HH:MM:SS` string.
const SEND_AT_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

const TRACK_OPENS_DEFAULT: bool = true;
const TRACK_CLICKS_DEFAULT: bool = true;
/// Generate the text part from the HTML body server-side.
const AUTO_TEXT_DEFAULT: bool = true;

const METADATA: AdapterMetadata = AdapterMetadata {
    id: PROVIDER_ID,
    display_name: "Mandrill",
    description: "Transactional email through the Mailchimp Transactional API",
    category: AdapterCategory::Email,
};

pub fn register(registry: &mut AdapterRegistry) -> Result<(), RegistryError> {
    registry.register(METADATA, |config| {
        MandrillAdapter::from_config(config).map(|adapter| Box::new(adapter) as Box<dyn Adapter>)
    })
}

fn default_base_url() -> String {
    "https://mandrillapp.com/api/1.0".to_string()
}

fn default_track_opens() -> bool {
    TRACK_OPENS_DEFAULT
}

fn default_track_clicks() -> bool {
    TRACK_CLICKS_DEFAULT
}

fn default_auto_text() -> bool {
    AUTO_TEXT_DEFAULT
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MandrillConfig {
    pub api_key: String,
    /// Sender address.
    pub from_email: String,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_track_opens")]
    pub track_opens: bool,
    #[serde(default = "default_track_clicks")]
    pub track_clicks: bool,
    #[serde(default = "default_auto_text")]
    pub auto_text: bool,
    /// Webhook authentication key, shown next to the webhook in the Mandrill
    /// console. Required to accept inbound events.
    #[serde(default)]
    pub webhook_key: Option<String>,
    /// Public URL this webhook is registered under; part of the signed
    /// content.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug)]
pub struct MandrillAdapter {
    config: MandrillConfig,
    client: reqwest::Client,
    engine: RequestEngine,
}

impl MandrillAdapter {
    pub fn from_config(config: Value) -> Result<Self, SendError> {
        let config: MandrillConfig = serde_json::from_value(config)
            .map_err(|err| SendError::Configuration(format!("mandrill config: {err}")))?;
        if config.api_key.trim().is_empty() {
            return Err(SendError::Configuration("mandrill apiKey is empty".into()));
        }
        if config.from_email.trim().is_empty() {
            return Err(SendError::Configuration(
                "mandrill fromEmail is empty".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .user_agent("courier-mandrill/0.3")
            .build()
            .map_err(|err| SendError::Configuration(format!("http client: {err}")))?;
        let engine = RequestEngine::with_client(client.clone(), RetryPolicy::default());
        Ok(Self {
            config,
            client,
            engine,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn from_header(&self) -> String {
        match &self.config.from_name {
            Some(name) => format!("{name} <{}>", self.config.from_email),
            None => self.config.from_email.clone(),
        }
    }

    fn base_message(&self, message: &Message) -> Value {
        let mut msg = json!({
            "from_email": self.config.from_email,
            "to": [{ "email": message.to, "type": "to" }],
            "track_opens": self.config.track_opens,
            "track_clicks": self.config.track_clicks,
            "auto_text": self.config.auto_text,
        });
        if let Some(obj) = msg.as_object_mut() {
            if let Some(name) = &self.config.from_name {
                obj.insert("from_name".into(), Value::String(name.clone()));
            }
            if let Some(subject) = &message.subject {
                obj.insert("subject".into(), Value::String(subject.clone()));
            }
            if let Some(body) = &message.body {
                obj.insert("html".into(), Value::String(body.clone()));
            }
        }
        msg
    }

    /// Picks the endpoint and payload for one message.
    async fn build_request(&self, message: &Message) -> Result<(String, Value), SendError> {
        let (path, mut payload) = self.build_request_body(message).await?;
        // `send_at` is a top-level parameter on every send endpoint.
        if let Some(at) = message.scheduled_at {
            let stamp = at
                .to_offset(UtcOffset::UTC)
                .format(SEND_AT_FORMAT)
                .map_err(|err| SendError::Validation(format!("scheduledAt: {err}")))?;
            if let Some(obj) = payload.as_object_mut() {
                obj.insert("send_at".into(), Value::String(stamp));
            }
        }
        Ok((path, payload))
    }

    async fn build_request_body(&self, message: &Message) -> Result<(String, Value), SendError> {
        if !message.attachments.is_empty() {
            let mut mime = MimeMessage {
                from: self.from_header(),
                to: message.to.clone(),
                subject: message.subject.clone().unwrap_or_default(),
                text: None,
                html: message.body.clone(),
                attachments: Vec::with_capacity(message.attachments.len()),
            };
            for attachment in &message.attachments {
                let resolved = resolve_attachment(&self.client, attachment).await?;
                mime.attachments.push(resolved.into());
            }
            let payload = json!({
                "key": self.config.api_key,
                "raw_message": mime.build(),
                "from_email": self.config.from_email,
                "to": [message.to],
            });
            return Ok(("/messages/send-raw.json".into(), payload));
        }

        if let Some(template) = &message.template_id {
            let vars: Vec<Value> = message
                .data
                .iter()
                .map(|(name, content)| json!({ "name": name, "content": content }))
                .collect();
            let mut msg = self.base_message(message);
            if let Some(obj) = msg.as_object_mut() {
                obj.insert("global_merge_vars".into(), Value::Array(vars));
            }
            let payload = json!({
                "key": self.config.api_key,
                "template_name": template,
                "template_content": [],
                "message": msg,
            });
            return Ok(("/messages/send-template.json".into(), payload));
        }

        let payload = json!({
            "key": self.config.api_key,
            "message": self.base_message(message),
        });
        Ok(("/messages/send.json".into(), payload))
    }

    async fn send_inner(&self, message: &Message) -> Result<DeliveryResult, SendError> {
        message.validate()?;
        let (path, payload) = self.build_request(message).await?;

        if let Some(scenario) = self.config.base_url.strip_prefix("mock://") {
            return match scenario {
                "success" => Ok(DeliveryResult::delivered("mock-id", payload)),
                "throttle" => Err(SendError::rate_limited(
                    "mock throttled",
                    Some(std::time::Duration::from_secs(1)),
                )),
                other => Err(SendError::Configuration(format!(
                    "unknown mock scenario `{other}`"
                ))),
            };
        }

        let request = PreparedRequest::post(self.endpoint(&path)).json(&payload);
        let response = self
            .engine
            .execute(&request)
            .await
            .map_err(classify_api_error)?;

        // Success body is an array with one entry per recipient.
        let results: Vec<MandrillSendResult> = response
            .json()
            .map_err(|err| SendError::Validation(format!("unparseable response: {err}")))?;
        let first = results
            .into_iter()
            .next()
            .ok_or_else(|| SendError::Validation("empty result array".into()))?;

        match first.status.as_str() {
            "sent" | "queued" | "scheduled" => Ok(DeliveryResult::delivered(
                first.id.unwrap_or_default(),
                json!({ "status": first.status }),
            )),
            "rejected" => {
                let reason = first.reject_reason.unwrap_or_else(|| "rejected".into());
                // Soft bounces come back as rejections too but are worth a
                // later retry.
                if reason.contains("soft") {
                    Err(SendError::Unknown(format!("soft rejection: {reason}")))
                } else {
                    Err(SendError::Validation(format!("rejected: {reason}")))
                }
            }
            other => Err(SendError::Unknown(format!("unexpected status `{other}`"))),
        }
    }

    /// Parses and verifies the form-encoded webhook batch. Returns the
    /// decoded events only when the signature checks out.
    fn verified_events(&self, body: &[u8], headers: &HeaderMap) -> Option<Vec<Value>> {
        let (Some(key), Some(url)) = (&self.config.webhook_key, &self.config.webhook_url) else {
            warn!(
                adapter = PROVIDER_ID,
                "webhook dropped: webhookKey/webhookUrl not configured"
            );
            return None;
        };
        let Some(provided) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok())
        else {
            warn!(adapter = PROVIDER_ID, "webhook dropped: signature header missing");
            metrics::counter!("courier_webhook_rejected", "adapter" => PROVIDER_ID).increment(1);
            return None;
        };

        let fields: BTreeMap<String, String> =
            match serde_urlencoded::from_bytes::<Vec<(String, String)>>(body) {
                Ok(pairs) => pairs.into_iter().collect(),
                Err(err) => {
                    warn!(adapter = PROVIDER_ID, %err, "webhook dropped: not form-encoded");
                    return None;
                }
            };

        if !SortedFieldSignature::new(key, url).verify(&fields, provided) {
            metrics::counter!("courier_webhook_rejected", "adapter" => PROVIDER_ID).increment(1);
            return None;
        }

        let raw = fields.get("mandrill_events").map(String::as_str).unwrap_or("[]");
        match serde_json::from_str::<Vec<Value>>(raw) {
            Ok(events) => Some(events),
            Err(err) => {
                warn!(adapter = PROVIDER_ID, %err, "webhook dropped: unparseable event batch");
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct MandrillSendResult {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    status: String,
    #[serde(default)]
    reject_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MandrillApiError {
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: String,
}

/// Mandrill reports everything as HTTP 500 with a JSON error body, so the
/// body's `name` field is the real classifier here.
fn classify_api_error(err: EngineError) -> SendError {
    if let EngineError::Status { status, body, .. } = &err {
        if let Ok(api) = serde_json::from_str::<MandrillApiError>(body) {
            let message = if api.message.is_empty() {
                body.clone()
            } else {
                api.message
            };
            return match api.name.as_str() {
                "Invalid_Key" => SendError::Auth(message),
                "ValidationError" | "Unknown_Template" | "Unknown_Message" => {
                    SendError::Validation(message)
                }
                "PaymentRequired" => SendError::Auth(message),
                "GeneralError" => {
                    let lower = message.to_ascii_lowercase();
                    if lower.contains("daily") {
                        SendError::rate_limited(
                            message,
                            Some(std::time::Duration::from_secs(DAILY_QUOTA_PAUSE_SECS)),
                        )
                    } else if lower.contains("hourly") {
                        SendError::rate_limited(
                            message,
                            Some(std::time::Duration::from_secs(HOURLY_QUOTA_PAUSE_SECS)),
                        )
                    } else {
                        SendError::Server(message)
                    }
                }
                _ => courier_core::classify_status(*status, message),
            };
        }
    }
    err.classify()
}

fn normalize_event(event_type: &str) -> Option<EventStatus> {
    match event_type {
        "send" => Some(EventStatus::Accepted),
        "deferral" => None,
        "soft_bounce" => Some(EventStatus::SoftReject),
        "hard_bounce" | "reject" | "blacklist" => Some(EventStatus::HardReject),
        "unsub" => Some(EventStatus::HardReject),
        "open" => Some(EventStatus::Opened),
        "click" => Some(EventStatus::Clicked),
        "spam" => Some(EventStatus::Complained),
        // Allow/deny list maintenance events carry no delivery meaning.
        "whitelist" => None,
        other => courier_core::normalize_by_keyword(other),
    }
}

#[async_trait]
impl Adapter for MandrillAdapter {
    fn metadata(&self) -> AdapterMetadata {
        METADATA
    }

    fn config_schema(&self) -> schemars::Schema {
        schemars::schema_for!(MandrillConfig)
    }

    async fn validate_config(&self) -> ValidateOutcome {
        if self.config.base_url.starts_with("mock://") {
            return ValidateOutcome::ok("mock endpoint");
        }
        let request = PreparedRequest::post(self.endpoint("/users/ping.json"))
            .json(&json!({ "key": self.config.api_key }));
        match self.engine.execute(&request).await {
            Ok(_) => ValidateOutcome::ok("credentials accepted"),
            Err(err) => ValidateOutcome::failed(classify_api_error(err).to_string()),
        }
    }

    async fn health_check(&self) -> HealthStatus {
        if self.config.base_url.starts_with("mock://") {
            return HealthStatus::Healthy;
        }
        let request = PreparedRequest::post(self.endpoint("/users/ping.json"))
            .json(&json!({ "key": self.config.api_key }));
        match self.engine.execute(&request).await {
            Ok(_) => HealthStatus::Healthy,
            Err(EngineError::Status { .. }) => HealthStatus::Degraded,
            Err(_) => HealthStatus::Unhealthy,
        }
    }

    async fn send(&self, message: &Message) -> DeliveryResult {
        match self.send_inner(message).await {
            Ok(result) => result,
            Err(err) => {
                warn!(adapter = PROVIDER_ID, error = %err, "send failed");
                DeliveryResult::failed(&err)
            }
        }
    }

    fn webhook(&self, body: &[u8], headers: &HeaderMap) -> Option<WebhookEvent> {
        let events = self.verified_events(body, headers)?;
        let batch_len = events.len();
        // One normalized event per callback; the orchestrator acknowledges the
        // whole batch, so additional entries are logged and skipped.
        let mut normalized = None;
        for event in events {
            let Some(kind) = event.get("event").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(status) = normalize_event(kind) else {
                continue;
            };
            let Some(message_id) = event
                .pointer("/msg/_id")
                .or_else(|| event.get("_id"))
                .and_then(|v| v.as_str())
            else {
                continue;
            };
            if normalized.is_some() {
                warn!(
                    adapter = PROVIDER_ID,
                    batch_len, "webhook batch has multiple terminal events; extras skipped"
                );
                break;
            }
            let mut event_out = WebhookEvent::new(status, message_id);
            if let Some(ts) = event
                .get("ts")
                .and_then(|v| v.as_i64())
                .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
            {
                event_out = event_out.at(ts);
            }
            normalized = Some(event_out);
        }
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(base_url: &str) -> MandrillAdapter {
        MandrillAdapter::from_config(json!({
            "apiKey": "md-key",
            "fromEmail": "courier@example.com",
            "fromName": "Courier",
            "baseUrl": base_url,
            "webhookKey": "hook-key",
            "webhookUrl": "https://hooks.example.com/mandrill",
        }))
        .unwrap()
    }

    #[test]
    fn construction_fails_fast_without_credentials() {
        let err =
            MandrillAdapter::from_config(json!({ "apiKey": " ", "fromEmail": "a@b" })).unwrap_err();
        assert!(matches!(err, SendError::Configuration(_)));
    }

    #[tokio::test]
    async fn endpoint_selection_follows_message_shape() {
        let adapter = adapter("mock://success");

        let plain = Message::new("a@b.com");
        let (path, payload) = adapter.build_request(&plain).await.unwrap();
        assert_eq!(path, "/messages/send.json");
        assert_eq!(payload["message"]["to"][0]["email"], "a@b.com");

        let mut templated = Message::new("a@b.com");
        templated.template_id = Some("welcome".into());
        templated.data.insert("name".into(), json!("Ada"));
        let (path, payload) = adapter.build_request(&templated).await.unwrap();
        assert_eq!(path, "/messages/send-template.json");
        assert_eq!(payload["template_name"], "welcome");
        assert_eq!(payload["message"]["global_merge_vars"][0]["name"], "name");

        let mut with_attachment = Message::new("a@b.com");
        with_attachment.subject = Some("report".into());
        with_attachment.attachments.push(courier_core::Attachment {
            filename: "r.csv".into(),
            content_type: Some("text/csv".into()),
            source: courier_core::AttachmentSource::Content("YSxi".into()),
            inline_cid: None,
        });
        let (path, payload) = adapter.build_request(&with_attachment).await.unwrap();
        assert_eq!(path, "/messages/send-raw.json");
        let raw = payload["raw_message"].as_str().unwrap();
        assert!(raw.contains("Subject: "));
        assert!(raw.contains("r.csv"));
    }

    #[tokio::test]
    async fn scheduled_sends_carry_send_at_in_every_shape() {
        let adapter = adapter("mock://success");
        // Non-UTC offsets are normalized before formatting.
        let at = time::macros::datetime!(2026-09-01 10:30:00 +02:00);

        let mut message = Message::new("a@b.com");
        message.scheduled_at = Some(at);
        let (_, payload) = adapter.build_request(&message).await.unwrap();
        assert_eq!(payload["send_at"], "2026-09-01 08:30:00");

        message.template_id = Some("welcome".into());
        let (_, payload) = adapter.build_request(&message).await.unwrap();
        assert_eq!(payload["send_at"], "2026-09-01 08:30:00");

        message.attachments.push(courier_core::Attachment {
            filename: "r.csv".into(),
            content_type: Some("text/csv".into()),
            source: courier_core::AttachmentSource::Content("YSxi".into()),
            inline_cid: None,
        });
        let (path, payload) = adapter.build_request(&message).await.unwrap();
        assert_eq!(path, "/messages/send-raw.json");
        assert_eq!(payload["send_at"], "2026-09-01 08:30:00");
    }

    #[test]
    fn quota_errors_get_graduated_pauses() {
        let daily = classify_api_error(EngineError::Status {
            status: 500,
            body: r#"{"name":"GeneralError","message":"daily quota exceeded"}"#.into(),
            retry_after: None,
            attempts: 1,
        });
        assert_eq!(
            daily.pause(),
            Some(std::time::Duration::from_secs(DAILY_QUOTA_PAUSE_SECS))
        );

        let hourly = classify_api_error(EngineError::Status {
            status: 500,
            body: r#"{"name":"GeneralError","message":"hourly send limit"}"#.into(),
            retry_after: None,
            attempts: 1,
        });
        assert_eq!(
            hourly.pause(),
            Some(std::time::Duration::from_secs(HOURLY_QUOTA_PAUSE_SECS))
        );

        // Invalid key is permanent even though it arrives as a 500.
        let auth = classify_api_error(EngineError::Status {
            status: 500,
            body: r#"{"name":"Invalid_Key","message":"Invalid API key"}"#.into(),
            retry_after: None,
            attempts: 1,
        });
        assert!(!auth.is_temporary());
    }

    fn signed_webhook(adapter: &MandrillAdapter, events: &str) -> (Vec<u8>, HeaderMap) {
        let mut fields = BTreeMap::new();
        fields.insert("mandrill_events".to_string(), events.to_string());
        let signer = SortedFieldSignature::new(
            adapter.config.webhook_key.as_deref().unwrap(),
            adapter.config.webhook_url.as_deref().unwrap(),
        );
        let sig = signer.compute(&fields).unwrap();
        let body = serde_urlencoded::to_string(fields.iter().collect::<Vec<_>>())
            .unwrap()
            .into_bytes();
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            http::HeaderValue::from_str(&sig).unwrap(),
        );
        (body, headers)
    }

    #[test]
    fn webhook_verifies_and_normalizes_vocabulary() {
        let adapter = adapter("mock://success");
        let events = json!([
            { "event": "deferral", "ts": 1_756_000_000, "msg": { "_id": "m1" } },
            { "event": "hard_bounce", "ts": 1_756_000_100, "msg": { "_id": "m2" } },
        ])
        .to_string();
        let (body, headers) = signed_webhook(&adapter, &events);

        let event = adapter.webhook(&body, &headers).unwrap();
        assert_eq!(event.status, EventStatus::HardReject);
        assert_eq!(event.message_id, "m2");
        assert!(event.timestamp.is_some());
    }

    #[test]
    fn webhook_rejects_bad_signature() {
        let adapter = adapter("mock://success");
        let events = json!([{ "event": "open", "msg": { "_id": "m1" } }]).to_string();
        let (body, mut headers) = signed_webhook(&adapter, &events);
        headers.insert(
            SIGNATURE_HEADER,
            http::HeaderValue::from_static("bm90LXRoZS1zaWc="),
        );
        assert!(adapter.webhook(&body, &headers).is_none());
    }

    #[test]
    fn unsubscribe_normalizes_to_hard_reject() {
        assert_eq!(normalize_event("unsub"), Some(EventStatus::HardReject));
        assert_eq!(normalize_event("soft_bounce"), Some(EventStatus::SoftReject));
        assert_eq!(normalize_event("whitelist"), None);
        assert_eq!(normalize_event("send"), Some(EventStatus::Accepted));
    }
}
