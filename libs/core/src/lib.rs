//! Core types shared by every Courier delivery adapter.
//!
//! This crate defines the contract surface the orchestrator sees:
//! [`Message`] going in, [`DeliveryResult`], [`HealthStatus`] and
//! [`WebhookEvent`] coming out, plus the [`SendError`] taxonomy that
//! drives temporary/permanent classification.

mod delivery;
mod error;
mod event;
mod message;

pub use delivery::{DeliveryResult, HealthStatus};
pub use error::{classify_status, SendError, DEFAULT_RATE_LIMIT_PAUSE};
pub use event::{normalize_by_keyword, EventStatus, WebhookEvent};
pub use message::{Attachment, AttachmentSource, Message};
