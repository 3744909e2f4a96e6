//! Template substitution against trigger payloads.
//!
//! Action config strings may reference the trigger payload with
//! `{{path.with.dots}}`. A lookup that resolves to nothing leaves the literal
//! `{{path}}` in place so a misspelled path is visible in the delivered
//! output instead of silently vanishing.

use regex::Regex;
use serde_json::Value as JsonValue;
use std::sync::OnceLock;

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("valid regex"))
}

/// Resolves a dotted path against a JSON value.
///
/// Missing keys and non-object intermediates yield `None`.
#[must_use]
pub fn resolve_path<'a>(data: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = data;
    for segment in path.split('.') {
        current = match current {
            JsonValue::Object(map) => map.get(segment)?,
            JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Renders a JSON value into the string form used in templates and
/// comparisons: strings verbatim, everything else via its JSON encoding.
#[must_use]
pub fn stringify(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Substitutes every `{{path}}` occurrence in `template`.
///
/// Lookups resolving to nothing or to JSON `null` keep the literal
/// placeholder.
#[must_use]
pub fn render(template: &str, data: &JsonValue) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let path = &caps[1];
            match resolve_path(data, path) {
                Some(JsonValue::Null) | None => caps[0].to_string(),
                Some(value) => stringify(value),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> JsonValue {
        json!({
            "trigger": {
                "from": "a@important.com",
                "subject": "Hi",
                "count": 3,
                "nested": {"deep": "value"}
            }
        })
    }

    #[test]
    fn renders_simple_paths() {
        let out = render("{{trigger.subject}} from {{trigger.from}}", &payload());
        assert_eq!(out, "Hi from a@important.com");
    }

    #[test]
    fn renders_nested_and_numeric_values() {
        let out = render("{{trigger.nested.deep}}: {{trigger.count}}", &payload());
        assert_eq!(out, "value: 3");
    }

    #[test]
    fn missing_path_keeps_the_literal() {
        let out = render("value is {{x.y}}", &payload());
        assert_eq!(out, "value is {{x.y}}");
    }

    #[test]
    fn null_value_keeps_the_literal() {
        let data = json!({"trigger": {"gone": null}});
        let out = render("{{trigger.gone}}", &data);
        assert_eq!(out, "{{trigger.gone}}");
    }

    #[test]
    fn plain_text_passes_through() {
        let out = render("no templates here", &payload());
        assert_eq!(out, "no templates here");
    }

    #[test]
    fn resolve_path_walks_arrays_by_index() {
        let data = json!({"items": ["a", "b"]});
        assert_eq!(resolve_path(&data, "items.1"), Some(&json!("b")));
        assert_eq!(resolve_path(&data, "items.9"), None);
    }

    #[test]
    fn stringify_unquotes_strings_only() {
        assert_eq!(stringify(&json!("plain")), "plain");
        assert_eq!(stringify(&json!(42)), "42");
        assert_eq!(stringify(&json!({"a": 1})), "{\"a\":1}");
    }
}
