//! Raw multi-part MIME construction, used when a provider's raw-send
//! endpoint supports richer structure (inline images, arbitrary
//! attachments) than its JSON API.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;

const LINE_WIDTH: usize = 76;

/// An already-resolved attachment: content is base64, remote references have
/// been fetched upstream.
#[derive(Debug, Clone)]
pub struct MimeAttachment {
    pub filename: String,
    pub content_type: String,
    pub content_b64: String,
    /// Present for images referenced from the HTML body via `cid:`.
    pub inline_cid: Option<String>,
}

/// Builder for a complete RFC 5322 message.
#[derive(Debug, Clone, Default)]
pub struct MimeMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<MimeAttachment>,
}

impl MimeMessage {
    /// Renders the full message with nesting chosen by content:
    /// `mixed( related( alternative(text, html), inline images ), files )`,
    /// with unneeded layers omitted.
    pub fn build(&self) -> String {
        let mut out = String::new();
        push_header(&mut out, "From", &self.from);
        push_header(&mut out, "To", &self.to);
        push_header(&mut out, "Subject", &encode_header_value(&self.subject));
        if let Ok(date) = OffsetDateTime::now_utc().format(&Rfc2822) {
            push_header(&mut out, "Date", &date);
        }
        push_header(&mut out, "MIME-Version", "1.0");

        let (inline, files): (Vec<_>, Vec<_>) = self
            .attachments
            .iter()
            .partition(|a| a.inline_cid.is_some());

        let body_part = self.body_part(&inline);
        if files.is_empty() {
            out.push_str(&body_part.into_message_body());
        } else {
            let boundary = boundary("mixed");
            push_header(
                &mut out,
                "Content-Type",
                &format!("multipart/mixed; boundary=\"{boundary}\""),
            );
            out.push_str("\r\n");
            let mut parts = vec![body_part];
            parts.extend(files.iter().map(|a| attachment_part(a, "attachment")));
            out.push_str(&join_parts(&boundary, &parts));
        }
        out
    }

    fn body_part(&self, inline: &[&MimeAttachment]) -> Part {
        let alternative = match (&self.text, &self.html) {
            (Some(text), Some(html)) => {
                let boundary = boundary("alt");
                let body = join_parts(&boundary, &[text_part(text, false), text_part(html, true)]);
                Part {
                    headers: vec![(
                        "Content-Type".into(),
                        format!("multipart/alternative; boundary=\"{boundary}\""),
                    )],
                    body,
                }
            }
            (None, Some(html)) => text_part(html, true),
            (Some(text), None) => text_part(text, false),
            (None, None) => text_part("", false),
        };

        if inline.is_empty() {
            return alternative;
        }
        let boundary = boundary("rel");
        let mut parts = vec![alternative];
        parts.extend(inline.iter().map(|a| attachment_part(a, "inline")));
        Part {
            headers: vec![(
                "Content-Type".into(),
                format!("multipart/related; boundary=\"{boundary}\""),
            )],
            body: join_parts(&boundary, &parts),
        }
    }
}

struct Part {
    headers: Vec<(String, String)>,
    body: String,
}

impl Part {
    fn render(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.headers {
            push_header(&mut out, name, value);
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }

    /// When this part is the whole message, its headers merge into the
    /// top-level header block.
    fn into_message_body(self) -> String {
        self.render()
    }
}

fn text_part(content: &str, html: bool) -> Part {
    let subtype = if html { "html" } else { "plain" };
    Part {
        headers: vec![
            (
                "Content-Type".into(),
                format!("text/{subtype}; charset=utf-8"),
            ),
            ("Content-Transfer-Encoding".into(), "base64".into()),
        ],
        body: wrap_base64(&B64.encode(content.as_bytes())),
    }
}

fn attachment_part(attachment: &MimeAttachment, disposition: &str) -> Part {
    let mut headers = vec![
        (
            "Content-Type".into(),
            format!(
                "{}; name=\"{}\"",
                attachment.content_type, attachment.filename
            ),
        ),
        ("Content-Transfer-Encoding".into(), "base64".into()),
        (
            "Content-Disposition".into(),
            format!("{disposition}; filename=\"{}\"", attachment.filename),
        ),
    ];
    if let Some(cid) = &attachment.inline_cid {
        headers.push(("Content-ID".into(), format!("<{cid}>")));
    }
    Part {
        headers,
        body: wrap_base64(&attachment.content_b64),
    }
}

fn join_parts(boundary: &str, parts: &[Part]) -> String {
    let mut out = String::new();
    for part in parts {
        out.push_str(&format!("--{boundary}\r\n"));
        out.push_str(&part.render());
        out.push_str("\r\n");
    }
    out.push_str(&format!("--{boundary}--\r\n"));
    out
}

fn boundary(label: &str) -> String {
    format!("courier-{label}-{}", nanoid::nanoid!(16))
}

fn push_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
}

/// RFC 2047 encoded-word for non-ASCII header values.
fn encode_header_value(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?utf-8?B?{}?=", B64.encode(value.as_bytes()))
    }
}

fn wrap_base64(encoded: &str) -> String {
    let mut out = String::with_capacity(encoded.len() + encoded.len() / LINE_WIDTH * 2 + 2);
    let bytes = encoded.as_bytes();
    for chunk in bytes.chunks(LINE_WIDTH) {
        out.push_str(std::str::from_utf8(chunk).unwrap_or(""));
        out.push_str("\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_attachment(cid: Option<&str>) -> MimeAttachment {
        MimeAttachment {
            filename: "logo.png".into(),
            content_type: "image/png".into(),
            content_b64: B64.encode(b"not really a png"),
            inline_cid: cid.map(Into::into),
        }
    }

    #[test]
    fn plain_text_message_has_no_multipart() {
        let msg = MimeMessage {
            from: "noreply@example.com".into(),
            to: "alice@example.com".into(),
            subject: "Hi".into(),
            text: Some("hello".into()),
            ..Default::default()
        };
        let raw = msg.build();
        assert!(raw.contains("Content-Type: text/plain; charset=utf-8"));
        assert!(!raw.contains("multipart"));
        assert!(raw.contains(&wrap_base64(&B64.encode(b"hello")).trim_end().to_string()));
    }

    #[test]
    fn text_and_html_nest_under_alternative() {
        let msg = MimeMessage {
            from: "a@example.com".into(),
            to: "b@example.com".into(),
            subject: "s".into(),
            text: Some("plain".into()),
            html: Some("<b>rich</b>".into()),
            ..Default::default()
        };
        let raw = msg.build();
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("text/plain"));
        assert!(raw.contains("text/html"));
    }

    #[test]
    fn inline_image_gets_related_layer_and_content_id() {
        let msg = MimeMessage {
            from: "a@example.com".into(),
            to: "b@example.com".into(),
            subject: "s".into(),
            html: Some(r#"<img src="cid:logo">"#.into()),
            attachments: vec![sample_attachment(Some("logo"))],
            ..Default::default()
        };
        let raw = msg.build();
        assert!(raw.contains("multipart/related"));
        assert!(raw.contains("Content-ID: <logo>"));
        assert!(raw.contains("Content-Disposition: inline"));
        assert!(!raw.contains("multipart/mixed"));
    }

    #[test]
    fn file_attachment_gets_mixed_layer() {
        let msg = MimeMessage {
            from: "a@example.com".into(),
            to: "b@example.com".into(),
            subject: "s".into(),
            text: Some("see attached".into()),
            attachments: vec![sample_attachment(None)],
            ..Default::default()
        };
        let raw = msg.build();
        assert!(raw.contains("multipart/mixed"));
        assert!(raw.contains("Content-Disposition: attachment; filename=\"logo.png\""));
    }

    #[test]
    fn non_ascii_subject_is_encoded() {
        let msg = MimeMessage {
            from: "a@example.com".into(),
            to: "b@example.com".into(),
            subject: "héllo".into(),
            text: Some("x".into()),
            ..Default::default()
        };
        assert!(msg.build().contains("Subject: =?utf-8?B?"));
    }
}
