use async_trait::async_trait;
use courier_core::{DeliveryResult, HealthStatus, Message, WebhookEvent};
use http::HeaderMap;

/// Static display information for one adapter variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterMetadata {
    /// Registry key; stable, lowercase.
    pub id: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    pub category: AdapterCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterCategory {
    Email,
    Chat,
    Webhook,
}

impl AdapterCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterCategory::Email => "email",
            AdapterCategory::Chat => "chat",
            AdapterCategory::Webhook => "webhook",
        }
    }
}

/// Result of a lightweight credentials/connectivity check.
#[derive(Debug, Clone)]
pub struct ValidateOutcome {
    pub success: bool,
    pub message: String,
    /// False when the provider offers no validation primitive at all.
    pub can_validate: bool,
}

impl ValidateOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            can_validate: true,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            can_validate: true,
        }
    }

    pub fn unsupported() -> Self {
        Self {
            success: true,
            message: "validation not supported by this adapter".into(),
            can_validate: false,
        }
    }
}

/// Uniform delivery contract implemented by every provider variant.
///
/// Construction is pure: configuration is parsed and validated eagerly, but
/// no network I/O happens until a method is called, so configuration can be
/// stored before connectivity is ever verified. Instances hold only
/// immutable configuration and are safe for unlimited concurrent use.
#[async_trait]
pub trait Adapter: Send + Sync + std::fmt::Debug {
    fn metadata(&self) -> AdapterMetadata;

    /// Declarative description of the adapter's configuration fields.
    fn config_schema(&self) -> schemars::Schema;

    /// Lightweight connectivity/credentials probe.
    async fn validate_config(&self) -> ValidateOutcome {
        ValidateOutcome::unsupported()
    }

    /// Reachability probe. Returns [`HealthStatus::Unhealthy`] on error
    /// rather than failing.
    async fn health_check(&self) -> HealthStatus;

    /// Delivers one message. Never fails with an error for provider-side or
    /// network trouble: every such failure is captured in the returned
    /// [`DeliveryResult`].
    async fn send(&self, message: &Message) -> DeliveryResult;

    /// Authenticates and normalizes one inbound provider callback. `None`
    /// means the event was dropped (unverifiable, unparseable or carrying no
    /// terminal meaning).
    fn webhook(&self, body: &[u8], headers: &HeaderMap) -> Option<WebhookEvent>;
}
