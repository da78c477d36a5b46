//! Transactional email via the Resend HTTP API.

use async_trait::async_trait;
use courier_core::{
    normalize_by_keyword, DeliveryResult, EventStatus, HealthStatus, Message, SendError,
    WebhookEvent,
};
use courier_idempotency::{derive, payload_hash, KeyFormat};
use courier_request::{EngineError, PreparedRequest, RequestEngine, RetryPolicy};
use courier_security::TimestampedSignature;
use http::HeaderMap;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

use crate::attachments::resolve_attachment;
use crate::registry::{AdapterRegistry, RegistryError};
use crate::traits::{Adapter, AdapterCategory, AdapterMetadata, ValidateOutcome};

pub const PROVIDER_ID: &str = "resend";

/// The API accepts opaque idempotency tokens up to this length.
const IDEMPOTENCY_KEY_MAX_LEN: usize = 256;

const METADATA: AdapterMetadata = AdapterMetadata {
    id: PROVIDER_ID,
    display_name: "Resend",
    description: "Transactional email through the Resend API",
    category: AdapterCategory::Email,
};

pub fn register(registry: &mut AdapterRegistry) -> Result<(), RegistryError> {
    registry.register(METADATA, |config| {
        ResendAdapter::from_config(config).map(|adapter| Box::new(adapter) as Box<dyn Adapter>)
    })
}

fn default_base_url() -> String {
    "https://api.resend.com".to_string()
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResendConfig {
    /// API key, `re_...`.
    pub api_key: String,
    /// Sender address, `Name <from@domain>` or a bare address.
    pub from: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Signing secret for inbound webhooks (`whsec_...`). Without it every
    /// callback is dropped as unverifiable.
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

#[derive(Debug)]
pub struct ResendAdapter {
    config: ResendConfig,
    client: reqwest::Client,
    engine: RequestEngine,
}

impl ResendAdapter {
    pub fn from_config(config: Value) -> Result<Self, SendError> {
        let config: ResendConfig = serde_json::from_value(config)
            .map_err(|err| SendError::Configuration(format!("resend config: {err}")))?;
        if config.api_key.trim().is_empty() {
            return Err(SendError::Configuration("resend apiKey is empty".into()));
        }
        if config.from.trim().is_empty() {
            return Err(SendError::Configuration("resend from is empty".into()));
        }
        let client = reqwest::Client::builder()
            .user_agent("courier-resend/0.3")
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

    async fn build_payload(&self, message: &Message) -> Result<Value, SendError> {
        let mut payload = json!({
            "from": self.config.from,
            "to": [message.to],
            "subject": message.subject.clone().unwrap_or_default(),
        });
        let obj = payload
            .as_object_mut()
            .ok_or_else(|| SendError::Unknown("payload not an object".into()))?;
        if let Some(body) = &message.body {
            obj.insert("html".into(), Value::String(body.clone()));
        }
        if let Some(at) = message.scheduled_at {
            let stamp = at
                .format(&Rfc3339)
                .map_err(|err| SendError::Validation(format!("scheduledAt: {err}")))?;
            obj.insert("scheduled_at".into(), Value::String(stamp));
        }
        if !message.attachments.is_empty() {
            let mut resolved = Vec::with_capacity(message.attachments.len());
            for attachment in &message.attachments {
                let att = resolve_attachment(&self.client, attachment).await?;
                resolved.push(json!({
                    "filename": att.filename,
                    "content": att.content_b64,
                }));
            }
            obj.insert("attachments".into(), Value::Array(resolved));
        }
        Ok(payload)
    }

    async fn send_inner(&self, message: &Message) -> Result<DeliveryResult, SendError> {
        message.validate()?;
        let payload = self.build_payload(message).await?;

        if let Some(scenario) = self.config.base_url.strip_prefix("mock://") {
            return match scenario {
                "success" => Ok(DeliveryResult::delivered("mock-id", payload)),
                "throttle" => Err(SendError::rate_limited(
                    "mock throttled",
                    Some(std::time::Duration::from_secs(1)),
                )),
                "denied" => Err(SendError::Auth("mock denied".into())),
                other => Err(SendError::Configuration(format!(
                    "unknown mock scenario `{other}`"
                ))),
            };
        }

        let payload_bytes = payload.to_string();
        let mut request = PreparedRequest::post(self.endpoint("/emails"))
            .bearer(&self.config.api_key)
            .json(&payload);
        if let Some(key) = &message.idempotency_key {
            let token = derive(
                key,
                &KeyFormat::Opaque {
                    max_len: IDEMPOTENCY_KEY_MAX_LEN,
                },
            );
            request = request.header("idempotency-key", &token);
        }

        match self.engine.execute(&request).await {
            Ok(response) => {
                let raw: Value = response.json().unwrap_or(Value::Null);
                let id = raw
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| SendError::Validation("response missing id".into()))?
                    .to_string();
                Ok(DeliveryResult::delivered(id, raw))
            }
            Err(EngineError::Status { status: 409, body, .. })
                if body.contains("idempot") =>
            {
                // The same idempotency key is already being processed: the
                // message is on its way, so report success with a
                // deterministic id instead of letting the orchestrator
                // requeue a duplicate.
                metrics::counter!("courier_idempotent_replays", "adapter" => PROVIDER_ID)
                    .increment(1);
                Ok(DeliveryResult::delivered(
                    payload_hash(payload_bytes.as_bytes()),
                    json!({ "deduplicated": true }),
                ))
            }
            Err(err) => Err(classify_api_error(err)),
        }
    }

    fn verified(&self, body: &[u8], headers: &HeaderMap) -> bool {
        let Some(secret) = &self.config.webhook_secret else {
            warn!(adapter = PROVIDER_ID, "webhook dropped: no signing secret configured");
            return false;
        };
        let ok = TimestampedSignature::new(secret).verify(body, headers);
        if !ok {
            metrics::counter!("courier_webhook_rejected", "adapter" => PROVIDER_ID).increment(1);
        }
        ok
    }
}

/// Provider-specific classification layered over the status baseline.
/// Permanence wins over a temporary-looking status code.
fn classify_api_error(err: EngineError) -> SendError {
    if let EngineError::Status { status, body, .. } = &err {
        if let Ok(api) = serde_json::from_str::<ResendApiError>(body) {
            let name = api.name.to_ascii_lowercase();
            return match name.as_str() {
                "validation_error" | "missing_required_field" | "invalid_from_address"
                | "invalid_to_address" | "invalid_attachment" => {
                    SendError::Validation(api.message)
                }
                "missing_api_key" | "invalid_api_key" | "restricted_api_key" => {
                    SendError::Auth(api.message)
                }
                "rate_limit_exceeded" => SendError::rate_limited(api.message, None),
                "daily_quota_exceeded" => SendError::rate_limited(
                    api.message,
                    Some(std::time::Duration::from_secs(3600)),
                ),
                "internal_server_error" | "application_error" => SendError::Server(api.message),
                _ => courier_core::classify_status(*status, api.message),
            };
        }
    }
    err.classify()
}

#[derive(Debug, Deserialize)]
struct ResendApiError {
    name: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResendEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    data: ResendEventData,
}

#[derive(Debug, Default, Deserialize)]
struct ResendEventData {
    #[serde(default)]
    email_id: Option<String>,
}

fn normalize_event(kind: &str) -> Option<EventStatus> {
    match kind {
        // Accepted-by-provider and delay notices carry no terminal meaning.
        "email.sent" | "email.scheduled" | "email.delivery_delayed" => None,
        "email.delivered" => Some(EventStatus::Delivered),
        "email.bounced" => Some(EventStatus::HardReject),
        "email.failed" => Some(EventStatus::HardReject),
        "email.opened" => Some(EventStatus::Opened),
        "email.clicked" => Some(EventStatus::Clicked),
        "email.complained" => Some(EventStatus::Complained),
        other => normalize_by_keyword(other),
    }
}

#[async_trait]
impl Adapter for ResendAdapter {
    fn metadata(&self) -> AdapterMetadata {
        METADATA
    }

    fn config_schema(&self) -> schemars::Schema {
        schemars::schema_for!(ResendConfig)
    }

    async fn validate_config(&self) -> ValidateOutcome {
        if self.config.base_url.starts_with("mock://") {
            return ValidateOutcome::ok("mock endpoint");
        }
        let request = PreparedRequest::get(self.endpoint("/domains")).bearer(&self.config.api_key);
        match self.engine.execute(&request).await {
            Ok(_) => ValidateOutcome::ok("credentials accepted"),
            Err(err) => ValidateOutcome::failed(err.to_string()),
        }
    }

    async fn health_check(&self) -> HealthStatus {
        if self.config.base_url.starts_with("mock://") {
            return HealthStatus::Healthy;
        }
        let request = PreparedRequest::get(self.endpoint("/domains")).bearer(&self.config.api_key);
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
        if !self.verified(body, headers) {
            return None;
        }
        let event: ResendEvent = match serde_json::from_slice(body) {
            Ok(event) => event,
            Err(err) => {
                warn!(adapter = PROVIDER_ID, %err, "webhook dropped: unparseable payload");
                return None;
            }
        };
        let status = normalize_event(&event.kind)?;
        let message_id = event.data.email_id?;
        let mut normalized = WebhookEvent::new(status, message_id);
        if let Some(stamp) = event
            .created_at
            .as_deref()
            .and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok())
        {
            normalized = normalized.at(stamp);
        }
        Some(normalized)
    }
}
