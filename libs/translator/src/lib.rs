//! Helpers for translating message bodies into provider wire formats.

mod html;
mod mime;
mod template;

pub use html::{
    detect_markup, escape_html, markdown_is_balanced, sanitize_html, Markup, TELEGRAM_ALLOWED_TAGS,
};
pub use mime::{MimeAttachment, MimeMessage};
pub use template::{render_payload, substitute};
