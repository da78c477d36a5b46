//! Rich-text body conversion for channels that only accept a constrained
//! markup dialect.

/// Inline tags Telegram's HTML parse mode accepts. Everything else is
/// stripped, with block-level elements converted to line breaks.
pub const TELEGRAM_ALLOWED_TAGS: &[&str] = &[
    "b",
    "strong",
    "i",
    "em",
    "u",
    "ins",
    "s",
    "strike",
    "del",
    "a",
    "code",
    "pre",
    "blockquote",
    "tg-spoiler",
];

/// Tags whose boundaries become line breaks when stripped.
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "br", "li", "ul", "ol", "tr", "table", "h1", "h2", "h3", "h4", "h5", "h6",
];

/// Rough shape of a message body, used to pick a safe parse mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Markup {
    Html,
    Markdown,
    Plain,
}

/// Best-effort markup sniffing: an HTML tag anywhere wins, then common
/// Markdown tokens, else plain text.
pub fn detect_markup(body: &str) -> Markup {
    if contains_html_tag(body) {
        return Markup::Html;
    }
    if body
        .chars()
        .any(|c| matches!(c, '*' | '_' | '`' | '[' | '~'))
    {
        return Markup::Markdown;
    }
    Markup::Plain
}

fn contains_html_tag(body: &str) -> bool {
    let bytes = body.as_bytes();
    let mut i = 0;
    while let Some(offset) = body[i..].find('<') {
        let start = i + offset + 1;
        if start < bytes.len() {
            let rest = &body[start..];
            let rest = rest.strip_prefix('/').unwrap_or(rest);
            if rest.starts_with(|c: char| c.is_ascii_alphabetic()) && rest.contains('>') {
                return true;
            }
        }
        i = start;
    }
    false
}

/// Whether Markdown entity markers are balanced. Providers that parse
/// Markdown reject the whole message on an unterminated entity, so an
/// unbalanced body must fall back to a safer mode.
pub fn markdown_is_balanced(body: &str) -> bool {
    let mut counts = [0usize; 4]; // * _ ` ~
    let mut brackets = 0i32;
    let mut escaped = false;
    for c in body.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '*' => counts[0] += 1,
            '_' => counts[1] += 1,
            '`' => counts[2] += 1,
            '~' => counts[3] += 1,
            '[' => brackets += 1,
            ']' => brackets -= 1,
            _ => {}
        }
    }
    counts.iter().all(|n| n % 2 == 0) && brackets == 0
}

/// Reduces arbitrary HTML to the subset in `allowed`, keeping allowed tags
/// verbatim, turning block-element boundaries into newlines and dropping
/// everything else while preserving inner text.
pub fn sanitize_html(input: &str, allowed: &[&str]) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('>') else {
            // Dangling bracket, keep literally.
            out.push_str(&rest[open..]);
            rest = "";
            break;
        };
        let raw_tag = &after[..close];
        let name = tag_name(raw_tag);
        if allowed.iter().any(|t| *t == name) {
            out.push('<');
            out.push_str(raw_tag);
            out.push('>');
        } else if BLOCK_TAGS.iter().any(|t| *t == name) && should_break(raw_tag, &name) {
            if !out.ends_with('\n') && !out.is_empty() {
                out.push('\n');
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out.trim_end().to_string()
}

/// Escapes text for insertion into an HTML body, so literal `<`, `>` and `&`
/// in caller data cannot open a tag or break entity parsing.
pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn tag_name(raw: &str) -> String {
    raw.trim_start_matches('/')
        .split([' ', '\t', '\n', '/'])
        .next()
        .unwrap_or("")
        .to_ascii_lowercase()
}

/// `<br>` breaks on the opening tag; other block tags break when closing so
/// `<p>a</p><p>b</p>` yields exactly one newline between paragraphs.
fn should_break(raw: &str, name: &str) -> bool {
    if name == "br" {
        return true;
    }
    raw.starts_with('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_unsupported_tags_keeps_text() {
        let html = r#"<table><tr><td>Hello <b>world</b></td></tr></table><script>x()</script>"#;
        let safe = sanitize_html(html, TELEGRAM_ALLOWED_TAGS);
        assert_eq!(safe, "Hello <b>world</b>\nx()");
    }

    #[test]
    fn block_elements_become_line_breaks() {
        let html = "<p>first</p><p>second</p>line<br>break";
        let safe = sanitize_html(html, TELEGRAM_ALLOWED_TAGS);
        assert_eq!(safe, "first\nsecond\nline\nbreak");
    }

    #[test]
    fn anchors_survive_with_attributes() {
        let html = r#"click <a href="https://example.com">here</a> now"#;
        let safe = sanitize_html(html, TELEGRAM_ALLOWED_TAGS);
        assert_eq!(safe, html);
    }

    #[test]
    fn dangling_bracket_is_preserved() {
        assert_eq!(sanitize_html("a < b", TELEGRAM_ALLOWED_TAGS), "a < b");
    }

    #[test]
    fn markup_detection() {
        assert_eq!(detect_markup("<b>hi</b>"), Markup::Html);
        assert_eq!(detect_markup("*hi* there"), Markup::Markdown);
        assert_eq!(detect_markup("just words"), Markup::Plain);
        assert_eq!(detect_markup("2 < 3 but no tag"), Markup::Plain);
    }

    #[test]
    fn escaping_neutralizes_markup_characters() {
        assert_eq!(escape_html("a<b & c>d"), "a&lt;b &amp; c&gt;d");
        assert_eq!(escape_html("plain"), "plain");
    }

    #[test]
    fn markdown_balance_detection() {
        assert!(markdown_is_balanced("*bold* and _italic_"));
        assert!(!markdown_is_balanced("*unterminated bold"));
        assert!(!markdown_is_balanced("[link without close"));
        assert!(markdown_is_balanced(r"escaped \* star"));
    }
}
