//! Constrained `{{placeholder}}` substitution for the configurable webhook
//! adapter. Not a template language: no conditionals, no loops, just a fixed
//! vocabulary of caller-supplied keys.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

/// Replaces `{{key}}` occurrences with values from `vars`. Unknown
/// placeholders are left intact so a misconfigured template is visible in
/// the provider payload instead of silently collapsing to empty strings.
pub fn substitute(template: &str, vars: &BTreeMap<String, String>) -> String {
    render(template, vars, false)
}

/// Substitutes and then attempts a strict JSON parse of the result, with the
/// values JSON-escaped. Falls back to the raw substituted string when the
/// template was never valid JSON to begin with.
pub fn render_payload(template: &str, vars: &BTreeMap<String, String>) -> Value {
    let escaped = render(template, vars, true);
    match serde_json::from_str::<Value>(&escaped) {
        Ok(value) => value,
        Err(err) => {
            debug!(%err, "payload template is not JSON, sending raw string body");
            Value::String(render(template, vars, false))
        }
    }
}

fn render(template: &str, vars: &BTreeMap<String, String>, json_escape: bool) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };
        let key = after[..close].trim();
        match vars.get(key) {
            Some(value) if json_escape => out.push_str(&escape_json(value)),
            Some(value) => out.push_str(value),
            None => {
                out.push_str("{{");
                out.push_str(&after[..close]);
                out.push_str("}}");
            }
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    out
}

/// JSON string escaping without the surrounding quotes, so values drop into
/// an already-quoted template slot.
fn escape_json(value: &str) -> String {
    let quoted = serde_json::to_string(value).unwrap_or_default();
    quoted
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(&quoted)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_known_leaves_unknown() {
        let vars = vars(&[("to", "alice"), ("body", "hello")]);
        let out = substitute("to={{to}} body={{ body }} x={{missing}}", &vars);
        assert_eq!(out, "to=alice body=hello x={{missing}}");
    }

    #[test]
    fn json_template_parses_strictly() {
        let vars = vars(&[("to", "alice"), ("subject", "He said \"hi\"")]);
        let payload = render_payload(
            r#"{"recipient":"{{to}}","title":"{{subject}}"}"#,
            &vars,
        );
        assert_eq!(
            payload,
            json!({"recipient": "alice", "title": "He said \"hi\""})
        );
    }

    #[test]
    fn non_json_template_falls_back_to_raw_string() {
        let vars = vars(&[("to", "alice")]);
        let payload = render_payload("recipient is {{to}}", &vars);
        assert_eq!(payload, json!("recipient is alice"));
    }

    #[test]
    fn unterminated_placeholder_kept_verbatim() {
        let out = substitute("broken {{to", &vars(&[("to", "x")]));
        assert_eq!(out, "broken {{to");
    }
}
