//! Generic outbound webhook: delivers to any caller-configured HTTP endpoint
//! with a `{{placeholder}}` body template, for targets no dedicated adapter
//! covers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use courier_core::{
    normalize_by_keyword, DeliveryResult, HealthStatus, Message, SendError, WebhookEvent,
};
use courier_idempotency::payload_hash;
use courier_request::{EngineError, PreparedRequest, RequestEngine, RetryPolicy};
use courier_security::StaticSecret;
use courier_translator::render_payload;
use http::{HeaderMap, Method};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

use crate::registry::{AdapterRegistry, RegistryError};
use crate::traits::{Adapter, AdapterCategory, AdapterMetadata, ValidateOutcome};

pub const PROVIDER_ID: &str = "webhook";

const DEFAULT_BODY_TEMPLATE: &str =
    r#"{"to":"{{to}}","subject":"{{subject}}","body":"{{body}}"}"#;

const METADATA: AdapterMetadata = AdapterMetadata {
    id: PROVIDER_ID,
    display_name: "Generic Webhook",
    description: "Configurable HTTP delivery to arbitrary endpoints",
    category: AdapterCategory::Webhook,
};

pub fn register(registry: &mut AdapterRegistry) -> Result<(), RegistryError> {
    registry.register(METADATA, |config| {
        WebhookAdapter::from_config(config).map(|adapter| Box::new(adapter) as Box<dyn Adapter>)
    })
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_body_template() -> String {
    DEFAULT_BODY_TEMPLATE.to_string()
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    /// Target endpoint, http or https.
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Extra headers sent verbatim on every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Body template with `{{to}}`, `{{subject}}`, `{{body}}` and any
    /// `{{data.*}}` placeholders. A JSON template is sent as JSON; anything
    /// else goes out as text/plain.
    #[serde(default = "default_body_template")]
    pub body_template: String,
    /// Shared-secret header name and value expected on inbound callbacks.
    #[serde(default)]
    pub callback_header: Option<String>,
    #[serde(default)]
    pub callback_secret: Option<String>,
}

#[derive(Debug)]
pub struct WebhookAdapter {
    config: WebhookConfig,
    method: Method,
    engine: RequestEngine,
}

impl WebhookAdapter {
    pub fn from_config(config: Value) -> Result<Self, SendError> {
        let config: WebhookConfig = serde_json::from_value(config)
            .map_err(|err| SendError::Configuration(format!("webhook config: {err}")))?;
        let url = url::Url::parse(&config.url)
            .map_err(|err| SendError::Configuration(format!("webhook url: {err}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SendError::Configuration(format!(
                "webhook url scheme `{}` is not allowed",
                url.scheme()
            )));
        }
        let method = Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| SendError::Configuration(format!("bad method `{}`", config.method)))?;
        let client = reqwest::Client::builder()
            .user_agent("courier-webhook/0.3")
            .build()
            .map_err(|err| SendError::Configuration(format!("http client: {err}")))?;
        Ok(Self {
            config,
            method,
            engine: RequestEngine::with_client(client, RetryPolicy::default()),
        })
    }

    fn template_vars(message: &Message) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("to".to_string(), message.to.clone());
        vars.insert(
            "subject".to_string(),
            message.subject.clone().unwrap_or_default(),
        );
        vars.insert("body".to_string(), message.body.clone().unwrap_or_default());
        if let Some(at) = message.scheduled_at {
            if let Ok(stamp) = at.format(&Rfc3339) {
                vars.insert("scheduledAt".to_string(), stamp);
            }
        }
        for (key, value) in &message.data {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            vars.insert(format!("data.{key}"), rendered);
        }
        vars
    }

    async fn send_inner(&self, message: &Message) -> Result<DeliveryResult, SendError> {
        message.validate()?;
        if !message.attachments.is_empty() {
            return Err(SendError::Validation(
                "webhook adapter does not carry attachments".into(),
            ));
        }

        let vars = Self::template_vars(message);
        let payload = render_payload(&self.config.body_template, &vars);

        let mut request = match &payload {
            // Template did not parse as JSON: deliver the substituted text.
            Value::String(raw) => PreparedRequest::new(self.method.clone(), &self.config.url)
                .body(raw.clone().into_bytes(), "text/plain; charset=utf-8"),
            json => PreparedRequest::new(self.method.clone(), &self.config.url).json(json),
        };
        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }

        let response = self
            .engine
            .execute(&request)
            .await
            .map_err(|err| err.classify())?;

        // Endpoints are under no obligation to return an id; fall back to a
        // deterministic digest of what was sent so webhook correlation stays
        // possible.
        let raw: Value = response.json().unwrap_or(Value::Null);
        let id = raw
            .get("id")
            .or_else(|| raw.get("messageId"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| payload_hash(payload.to_string().as_bytes()));
        Ok(DeliveryResult::delivered(id, raw))
    }
}

#[derive(Debug, Deserialize)]
struct CallbackEvent {
    #[serde(alias = "event", alias = "type", alias = "status")]
    kind: String,
    #[serde(alias = "messageId", alias = "id")]
    message_id: String,
    #[serde(default)]
    timestamp: Option<String>,
}

#[async_trait]
impl Adapter for WebhookAdapter {
    fn metadata(&self) -> AdapterMetadata {
        METADATA
    }

    fn config_schema(&self) -> schemars::Schema {
        schemars::schema_for!(WebhookConfig)
    }

    // No provider-side credential check exists for an arbitrary endpoint.
    async fn validate_config(&self) -> ValidateOutcome {
        ValidateOutcome::unsupported()
    }

    async fn health_check(&self) -> HealthStatus {
        let request = PreparedRequest::get(&self.config.url);
        match self.engine.execute(&request).await {
            Ok(_) => HealthStatus::Healthy,
            Err(EngineError::Status { status, .. }) if status < 500 => HealthStatus::Healthy,
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
        let (Some(header), Some(secret)) =
            (&self.config.callback_header, &self.config.callback_secret)
        else {
            warn!(adapter = PROVIDER_ID, "callback dropped: no shared secret configured");
            return None;
        };
        if !StaticSecret::new(header, secret).verify(headers) {
            metrics::counter!("courier_webhook_rejected", "adapter" => PROVIDER_ID).increment(1);
            return None;
        }

        let event: CallbackEvent = match serde_json::from_slice(body) {
            Ok(event) => event,
            Err(err) => {
                warn!(adapter = PROVIDER_ID, %err, "callback dropped: unparseable payload");
                return None;
            }
        };
        let status = normalize_by_keyword(&event.kind)?;
        let mut normalized = WebhookEvent::new(status, event.message_id);
        if let Some(ts) = event
            .timestamp
            .as_deref()
            .and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok())
        {
            normalized = normalized.at(ts);
        }
        Some(normalized)
    }
}
