//! `{path}` prompt templating over the expression scope.

use serde_json::Value;

use crate::expression::resolve_path;

/// Render `{path}` placeholders against `scope`.
///
/// `{{` and `}}` produce literal braces. Placeholders whose path does not
/// resolve are left verbatim. Strings are inserted as-is, other values as JSON.
pub fn render(template: &str, scope: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        match c {
            '{' if chars.peek().map(|(_, n)| *n) == Some('{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek().map(|(_, n)| *n) == Some('}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let rest = &template[idx + 1..];
                match rest.find('}') {
                    Some(end) if is_path(&rest[..end]) => {
                        let path = rest[..end].trim();
                        match resolve_path(scope, path) {
                            Some(value) => out.push_str(&display(value)),
                            None => {
                                out.push('{');
                                out.push_str(&rest[..end]);
                                out.push('}');
                            }
                        }
                        // Skip past the placeholder body and closing brace
                        for _ in 0..rest[..end].chars().count() + 1 {
                            chars.next();
                        }
                    }
                    _ => out.push('{'),
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Render every string leaf of a JSON value.
///
/// A string that is exactly one resolvable placeholder is replaced by the
/// referenced value itself, so structured data passes through untouched.
pub fn render_value(value: &Value, scope: &Value) -> Value {
    match value {
        Value::String(s) => {
            if let Some(path) = sole_placeholder(s) {
                if let Some(found) = resolve_path(scope, path) {
                    return found.clone();
                }
            }
            Value::String(render(s, scope))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Text form of a value as it appears in rendered output.
pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn sole_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix('{')?.strip_suffix('}')?;
    if inner.starts_with('{') || !is_path(inner) {
        return None;
    }
    Some(inner.trim())
}

fn is_path(body: &str) -> bool {
    let body = body.trim();
    !body.is_empty()
        && body
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_simple_and_nested() {
        let scope = json!({"input": "Hello", "user": {"name": "Ada"}, "n": 3});
        assert_eq!(render("Echo: {input}", &scope), "Echo: Hello");
        assert_eq!(render("Hi {user.name}, n={n}", &scope), "Hi Ada, n=3");
        assert_eq!(render("{ input }", &scope), "Hello");
    }

    #[test]
    fn test_unknown_placeholder_left_verbatim() {
        let scope = json!({});
        assert_eq!(render("Value: {missing.key}", &scope), "Value: {missing.key}");
    }

    #[test]
    fn test_escaped_braces_and_json_bodies() {
        let scope = json!({"x": 1});
        assert_eq!(render("{{x}} is {x}", &scope), "{x} is 1");
        assert_eq!(render(r#"{"a": 1}"#, &scope), r#"{"a": 1}"#);
        assert_eq!(render("open { brace", &scope), "open { brace");
    }

    #[test]
    fn test_non_string_values_render_as_json() {
        let scope = json!({"list": [1, 2], "none": null});
        assert_eq!(render("{list}", &scope), "[1,2]");
        assert_eq!(render("[{none}]", &scope), "[]");
    }

    #[test]
    fn test_render_value_passes_structured_data() {
        let scope = json!({"doc": {"a": [1, 2]}, "name": "x"});
        let rendered = render_value(
            &json!({"data": "{doc}", "label": "name={name}", "n": 5, "raw": "{nope}"}),
            &scope,
        );
        assert_eq!(
            rendered,
            json!({"data": {"a": [1, 2]}, "label": "name=x", "n": 5, "raw": "{nope}"})
        );
    }

    #[test]
    fn test_multibyte_text_survives() {
        let scope = json!({"w": "wörld"});
        assert_eq!(render("héllo {w} ✓", &scope), "héllo wörld ✓");
    }
}
