//! Chat delivery via the Telegram Bot API.
//!
//! Telegram rejects the whole message when its parse mode chokes on the
//! body, so the body is converted defensively: HTML is reduced to the
//! supported tag subset, Markdown with unbalanced entities falls back to
//! plain text.

use async_trait::async_trait;
use courier_core::{
    DeliveryResult, EventStatus, HealthStatus, Message, SendError, WebhookEvent,
};
use courier_request::{EngineError, PreparedRequest, RequestEngine, RetryPolicy};
use courier_security::StaticSecret;
use courier_translator::{
    detect_markup, escape_html, markdown_is_balanced, sanitize_html, Markup, TELEGRAM_ALLOWED_TAGS,
};
use http::HeaderMap;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::warn;

use crate::registry::{AdapterRegistry, RegistryError};
use crate::traits::{Adapter, AdapterCategory, AdapterMetadata, ValidateOutcome};

pub const PROVIDER_ID: &str = "telegram";

/// Header Telegram echoes back on every webhook when a secret token was set
/// with `setWebhook`.
const SECRET_TOKEN_HEADER: &str = "x-telegram-bot-api-secret-token";

const METADATA: AdapterMetadata = AdapterMetadata {
    id: PROVIDER_ID,
    display_name: "Telegram",
    description: "Chat messages through the Telegram Bot API",
    category: AdapterCategory::Chat,
};

pub fn register(registry: &mut AdapterRegistry) -> Result<(), RegistryError> {
    registry.register(METADATA, |config| {
        TelegramAdapter::from_config(config).map(|adapter| Box::new(adapter) as Box<dyn Adapter>)
    })
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    pub bot_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Secret token registered with `setWebhook`; required to accept inbound
    /// callbacks.
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

#[derive(Debug)]
pub struct TelegramAdapter {
    config: TelegramConfig,
    engine: RequestEngine,
}

impl TelegramAdapter {
    pub fn from_config(config: Value) -> Result<Self, SendError> {
        let config: TelegramConfig = serde_json::from_value(config)
            .map_err(|err| SendError::Configuration(format!("telegram config: {err}")))?;
        if config.bot_token.trim().is_empty() {
            return Err(SendError::Configuration("telegram botToken is empty".into()));
        }
        let client = reqwest::Client::builder()
            .user_agent("courier-telegram/0.3")
            .build()
            .map_err(|err| SendError::Configuration(format!("http client: {err}")))?;
        Ok(Self {
            config,
            engine: RequestEngine::with_client(client, RetryPolicy::default()),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token
        )
    }

    /// Converts the message body into text plus a parse mode Telegram will
    /// accept without rejecting the request.
    fn render_body(message: &Message) -> (String, Option<&'static str>) {
        let body = message.body.clone().unwrap_or_default();
        let (mut text, mode) = match detect_markup(&body) {
            Markup::Html => (sanitize_html(&body, TELEGRAM_ALLOWED_TAGS), Some("HTML")),
            Markup::Markdown if markdown_is_balanced(&body) => (body, Some("Markdown")),
            // Unbalanced entities would fail the whole send; deliver plain.
            Markup::Markdown => (body, None),
            Markup::Plain => (body, None),
        };
        if let Some(subject) = &message.subject {
            // The subject is caller data, not markup: escape it in HTML mode
            // and wrap it in Markdown mode only when doing so cannot leave an
            // unterminated entity behind.
            let heading = match mode {
                Some("HTML") => format!("<b>{}</b>\n", escape_html(subject)),
                Some("Markdown") if markdown_is_balanced(subject) => format!("*{subject}*\n"),
                _ => format!("{subject}\n"),
            };
            text.insert_str(0, &heading);
        }
        (text, mode)
    }

    async fn send_inner(&self, message: &Message) -> Result<DeliveryResult, SendError> {
        message.validate()?;
        if !message.attachments.is_empty() {
            return Err(SendError::Validation(
                "telegram adapter does not carry attachments".into(),
            ));
        }
        // The Bot API has no scheduling primitive; failing visibly beats
        // sending a scheduled message immediately.
        if message.scheduled_at.is_some() {
            return Err(SendError::Validation(
                "telegram adapter does not support scheduled sends".into(),
            ));
        }

        let (text, parse_mode) = Self::render_body(message);
        let mut payload = json!({
            "chat_id": message.to,
            "text": text,
        });
        if let (Some(mode), Some(obj)) = (parse_mode, payload.as_object_mut()) {
            obj.insert("parse_mode".into(), Value::String(mode.into()));
        }

        if let Some(scenario) = self.config.api_base.strip_prefix("mock://") {
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

        let request = PreparedRequest::post(self.method_url("sendMessage")).json(&payload);
        let response = self
            .engine
            .execute(&request)
            .await
            .map_err(classify_api_error)?;

        let reply: TelegramReply = response
            .json()
            .map_err(|err| SendError::Validation(format!("unparseable response: {err}")))?;
        if !reply.ok {
            return Err(SendError::Unknown(
                reply.description.unwrap_or_else(|| "ok=false".into()),
            ));
        }
        let message_id = reply
            .result
            .and_then(|r| r.message_id)
            .ok_or_else(|| SendError::Validation("response missing message_id".into()))?;
        Ok(DeliveryResult::delivered(
            message_id.to_string(),
            json!({ "ok": true }),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct TelegramReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<TelegramMessageRef>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessageRef {
    #[serde(default)]
    message_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TelegramError {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<TelegramRetryParams>,
}

#[derive(Debug, Deserialize)]
struct TelegramRetryParams {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// The Bot API carries its retry hint inside the error body rather than a
/// header, and signals unreachable recipients with a 400/403 description.
fn classify_api_error(err: EngineError) -> SendError {
    if let EngineError::Status { status, body, .. } = &err {
        if let Ok(api) = serde_json::from_str::<TelegramError>(body) {
            let description = api.description.unwrap_or_else(|| body.clone());
            if *status == 429 {
                let pause = api
                    .parameters
                    .and_then(|p| p.retry_after)
                    .map(std::time::Duration::from_secs);
                return SendError::rate_limited(description, pause);
            }
            let lower = description.to_ascii_lowercase();
            // A blocked bot or unknown chat never recovers on retry.
            if lower.contains("blocked") || lower.contains("chat not found") {
                return SendError::Validation(description);
            }
            if lower.contains("unauthorized") {
                return SendError::Auth(description);
            }
            return courier_core::classify_status(*status, description);
        }
    }
    err.classify()
}

#[async_trait]
impl Adapter for TelegramAdapter {
    fn metadata(&self) -> AdapterMetadata {
        METADATA
    }

    fn config_schema(&self) -> schemars::Schema {
        schemars::schema_for!(TelegramConfig)
    }

    async fn validate_config(&self) -> ValidateOutcome {
        if self.config.api_base.starts_with("mock://") {
            return ValidateOutcome::ok("mock endpoint");
        }
        let request = PreparedRequest::get(self.method_url("getMe"));
        match self.engine.execute(&request).await {
            Ok(_) => ValidateOutcome::ok("bot token accepted"),
            Err(err) => ValidateOutcome::failed(classify_api_error(err).to_string()),
        }
    }

    async fn health_check(&self) -> HealthStatus {
        if self.config.api_base.starts_with("mock://") {
            return HealthStatus::Healthy;
        }
        let request = PreparedRequest::get(self.method_url("getMe"));
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

    /// Telegram has no delivery receipts; the only terminal signal is a chat
    /// member update saying the bot was kicked or the user left, which is a
    /// standing suppression for that chat.
    fn webhook(&self, body: &[u8], headers: &HeaderMap) -> Option<WebhookEvent> {
        let Some(secret) = &self.config.webhook_secret else {
            warn!(adapter = PROVIDER_ID, "webhook dropped: no secret token configured");
            return None;
        };
        if !StaticSecret::new(SECRET_TOKEN_HEADER, secret).verify(headers) {
            metrics::counter!("courier_webhook_rejected", "adapter" => PROVIDER_ID).increment(1);
            return None;
        }

        let update: Value = match serde_json::from_slice(body) {
            Ok(update) => update,
            Err(err) => {
                warn!(adapter = PROVIDER_ID, %err, "webhook dropped: unparseable update");
                return None;
            }
        };

        let member = update.get("my_chat_member")?;
        let status = member.pointer("/new_chat_member/status")?.as_str()?;
        if !matches!(status, "kicked" | "left") {
            return None;
        }
        let chat_id = member.pointer("/chat/id")?.as_i64()?;
        let mut event = WebhookEvent::new(EventStatus::HardReject, chat_id.to_string());
        if let Some(ts) = member
            .get("date")
            .and_then(|v| v.as_i64())
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
        {
            event = event.at(ts);
        }
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn adapter(api_base: &str) -> TelegramAdapter {
        TelegramAdapter::from_config(json!({
            "botToken": "12345:token",
            "apiBase": api_base,
            "webhookSecret": "tok-1",
        }))
        .unwrap()
    }

    #[test]
    fn construction_fails_fast_without_token() {
        let err = TelegramAdapter::from_config(json!({ "botToken": "" })).unwrap_err();
        assert!(matches!(err, SendError::Configuration(_)));
    }

    #[test]
    fn html_body_is_sanitized_with_bold_subject() {
        let mut message = Message::new("42");
        message.subject = Some("Alert".into());
        message.body = Some("<p>disk <script>x</script><b>full</b></p>".into());
        let (text, mode) = TelegramAdapter::render_body(&message);
        assert_eq!(mode, Some("HTML"));
        assert_eq!(text, "<b>Alert</b>\ndisk x<b>full</b>");
    }

    #[test]
    fn unbalanced_markdown_falls_back_to_plain() {
        let mut message = Message::new("42");
        message.body = Some("*unterminated bold".into());
        let (text, mode) = TelegramAdapter::render_body(&message);
        assert_eq!(mode, None);
        assert_eq!(text, "*unterminated bold");

        message.body = Some("*bold* ok".into());
        let (_, mode) = TelegramAdapter::render_body(&message);
        assert_eq!(mode, Some("Markdown"));
    }

    #[test]
    fn subject_markup_cannot_break_the_message() {
        let mut message = Message::new("42");
        message.subject = Some("disk <80% & rising>".into());
        message.body = Some("<i>details</i>".into());
        let (text, mode) = TelegramAdapter::render_body(&message);
        assert_eq!(mode, Some("HTML"));
        assert_eq!(text, "<b>disk &lt;80% &amp; rising&gt;</b>\n<i>details</i>");

        // An unbalanced subject over a Markdown body gets a plain heading
        // instead of an unterminated bold entity.
        message.subject = Some("*oops".into());
        message.body = Some("*bold* body".into());
        let (text, mode) = TelegramAdapter::render_body(&message);
        assert_eq!(mode, Some("Markdown"));
        assert!(text.starts_with("*oops\n"));
    }

    #[tokio::test]
    async fn scheduled_sends_are_a_permanent_validation_failure() {
        let adapter = adapter("mock://success");
        let mut message = Message::new("42");
        message.body = Some("now or never".into());
        message.scheduled_at = Some(time::macros::datetime!(2026-09-01 08:00:00 UTC));
        let result = adapter.send(&message).await;
        assert!(!result.success);
        assert!(!result.is_temporary);
    }

    #[tokio::test]
    async fn attachments_are_a_permanent_validation_failure() {
        let adapter = adapter("mock://success");
        let mut message = Message::new("42");
        message.attachments.push(courier_core::Attachment {
            filename: "a.txt".into(),
            content_type: None,
            source: courier_core::AttachmentSource::Content("aGk=".into()),
            inline_cid: None,
        });
        let result = adapter.send(&message).await;
        assert!(!result.success);
        assert!(!result.is_temporary);
    }

    #[test]
    fn retry_after_hint_is_honored_exactly() {
        let err = classify_api_error(EngineError::Status {
            status: 429,
            body: r#"{"ok":false,"description":"Too Many Requests","parameters":{"retry_after":17}}"#
                .into(),
            retry_after: None,
            attempts: 1,
        });
        assert_eq!(err.pause(), Some(std::time::Duration::from_secs(17)));
    }

    #[test]
    fn blocked_bot_is_permanent_despite_403() {
        let err = classify_api_error(EngineError::Status {
            status: 403,
            body: r#"{"ok":false,"description":"Forbidden: bot was blocked by the user"}"#.into(),
            retry_after: None,
            attempts: 1,
        });
        assert!(matches!(err, SendError::Validation(_)));
        assert!(!err.is_temporary());
    }

    #[test]
    fn kicked_chat_member_becomes_hard_reject() {
        let adapter = adapter("mock://success");
        let body = json!({
            "update_id": 1,
            "my_chat_member": {
                "chat": { "id": -100123 },
                "date": 1_756_000_000,
                "new_chat_member": { "status": "kicked" },
            },
        })
        .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(SECRET_TOKEN_HEADER, HeaderValue::from_static("tok-1"));
        let event = adapter.webhook(body.as_bytes(), &headers).unwrap();
        assert_eq!(event.status, EventStatus::HardReject);
        assert_eq!(event.message_id, "-100123");

        // Wrong or missing token: dropped.
        headers.insert(SECRET_TOKEN_HEADER, HeaderValue::from_static("tok-2"));
        assert!(adapter.webhook(body.as_bytes(), &headers).is_none());
    }

    #[test]
    fn ordinary_updates_carry_no_delivery_meaning() {
        let adapter = adapter("mock://success");
        let body = json!({
            "update_id": 2,
            "message": { "text": "hello", "chat": { "id": 7 } },
        })
        .to_string();
        let mut headers = HeaderMap::new();
        headers.insert(SECRET_TOKEN_HEADER, HeaderValue::from_static("tok-1"));
        assert!(adapter.webhook(body.as_bytes(), &headers).is_none());
    }
}
