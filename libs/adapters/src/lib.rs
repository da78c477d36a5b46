//! Provider adapters behind one uniform contract.
//!
//! Each variant translates the canonical [`courier_core::Message`] into one
//! vendor's wire format and normalizes that vendor's webhook vocabulary back
//! into the canonical status taxonomy. Cross-cutting behaviour (retrying
//! HTTP, idempotency-key derivation, signature verification, markup and MIME
//! building) is injected from the sibling crates rather than inherited.

mod attachments;
mod registry;
mod traits;

pub mod providers;

pub use attachments::{check_remote_source, resolve_attachment, ResolvedAttachment, MAX_REMOTE_ATTACHMENT_BYTES};
pub use registry::{AdapterRegistry, RegistryError};
pub use traits::{Adapter, AdapterCategory, AdapterMetadata, ValidateOutcome};

/// Registry pre-populated with every built-in adapter variant.
pub fn builtin_registry() -> Result<AdapterRegistry, RegistryError> {
    let mut registry = AdapterRegistry::new();
    providers::resend::register(&mut registry)?;
    providers::mandrill::register(&mut registry)?;
    providers::telegram::register(&mut registry)?;
    providers::webhook::register(&mut registry)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_knows_every_variant() {
        let registry = builtin_registry().unwrap();
        let mut names: Vec<_> = registry.names().cloned().collect();
        names.sort();
        assert_eq!(names, ["mandrill", "resend", "telegram", "webhook"]);
    }
}
