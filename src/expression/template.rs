//! `{{ }}` template scanning and parameter resolution.

use serde_json::Value;

use super::context::ExpressionContext;
use super::interpreter::evaluate;
use super::parser::parse_expression;
use super::value::to_display;
use super::ExpressionError;

#[derive(Debug, PartialEq)]
enum Segment<'t> {
    Text(&'t str),
    Expr(&'t str),
}

/// True if `text` contains a `{{` opener.
pub fn contains_expression(text: &str) -> bool {
    text.contains("{{")
}

/// Split template text into literal and expression segments.
///
/// The closing `}}` is found by scanning the expression body, skipping
/// quoted strings and balanced braces, so `{{ {a: "}}"} }}` is one
/// expression.
fn split_template(text: &str) -> Result<Vec<Segment<'_>>, ExpressionError> {
    let bytes = text.as_bytes();
    let mut segments = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find("{{") {
        let open = cursor + offset;
        let body_start = open + 2;
        let mut j = body_start;
        let mut quote: Option<u8> = None;
        let mut depth = 0usize;
        let mut close = None;

        while j < bytes.len() {
            let b = bytes[j];
            if let Some(q) = quote {
                if b == b'\\' {
                    j += 2;
                    continue;
                }
                if b == q {
                    quote = None;
                }
                j += 1;
                continue;
            }
            match b {
                b'"' | b'\'' => quote = Some(b),
                b'{' => depth += 1,
                b'}' if depth > 0 => depth -= 1,
                b'}' if bytes.get(j + 1) == Some(&b'}') => {
                    close = Some(j);
                    break;
                }
                _ => {}
            }
            j += 1;
        }

        let close = close.ok_or_else(|| ExpressionError::Syntax {
            position: open,
            message: "unterminated expression, missing '}}'".to_string(),
        })?;

        if open > cursor {
            segments.push(Segment::Text(&text[cursor..open]));
        }
        segments.push(Segment::Expr(&text[body_start..close]));
        cursor = close + 2;
    }

    if cursor < text.len() {
        segments.push(Segment::Text(&text[cursor..]));
    }
    Ok(segments)
}

/// Resolve one string. A string that is a single expression (ignoring
/// surrounding whitespace) yields the expression's native value; anything
/// else is stringified and spliced.
pub fn resolve_string(text: &str, ctx: &ExpressionContext<'_>) -> Result<Value, ExpressionError> {
    if !contains_expression(text) {
        return Ok(Value::String(text.to_string()));
    }
    let segments = split_template(text)?;

    let mut expressions = segments.iter().filter_map(|s| match s {
        Segment::Expr(source) => Some(*source),
        Segment::Text(_) => None,
    });
    let only_whitespace_text = segments.iter().all(|s| match s {
        Segment::Text(t) => t.trim().is_empty(),
        Segment::Expr(_) => true,
    });
    if let (Some(source), None, true) = (expressions.next(), expressions.next(), only_whitespace_text) {
        return evaluate(&parse_expression(source)?, ctx);
    }

    let mut out = String::with_capacity(text.len());
    for segment in segments {
        match segment {
            Segment::Text(t) => out.push_str(t),
            Segment::Expr(source) => {
                let value = evaluate(&parse_expression(source)?, ctx)?;
                out.push_str(&to_display(&value));
            }
        }
    }
    Ok(Value::String(out))
}

/// Resolve every expression in a parameter tree.
///
/// Object keys are left untouched; values without `{{` pass through, so
/// resolving already-resolved data is a no-op.
pub fn resolve_expressions(
    parameters: &Value,
    ctx: &ExpressionContext<'_>,
) -> Result<Value, ExpressionError> {
    match parameters {
        Value::String(text) => resolve_string(text, ctx),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_expressions(v, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), resolve_expressions(value, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Syntax and safety check without data.
pub fn validate_expression(text: &str) -> Result<(), ExpressionError> {
    for segment in split_template(text)? {
        if let Segment::Expr(source) = segment {
            parse_expression(source)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::ExpressionScope;
    use serde_json::json;

    fn resolve(params: Value, item: Value) -> Result<Value, ExpressionError> {
        let scope = ExpressionScope::new();
        resolve_expressions(&params, &ExpressionContext::for_item(&scope, &item))
    }

    #[test]
    fn test_whole_value_keeps_native_type() {
        assert_eq!(
            resolve(json!("{{ $json.a + $json.b }}"), json!({"a": 2, "b": 3})).unwrap(),
            json!(5)
        );
        assert_eq!(
            resolve(json!("  {{ $json.tags }} "), json!({"tags": ["x"]})).unwrap(),
            json!(["x"])
        );
    }

    #[test]
    fn test_embedded_expressions_are_spliced() {
        assert_eq!(
            resolve(json!("Hello {{ $json.name }}, you owe {{ $json.due }}"), json!({"name": "Ada", "due": 12.5}))
                .unwrap(),
            json!("Hello Ada, you owe 12.5")
        );
        assert_eq!(
            resolve(json!("{{ $json.a }}{{ $json.b }}"), json!({"a": 1, "b": 2})).unwrap(),
            json!("12")
        );
    }

    #[test]
    fn test_nested_parameters_resolved_recursively() {
        let params = json!({
            "url": "https://api.example.com/users/{{ $json.id }}",
            "headers": {"X-Count": "{{ $json.n * 2 }}"},
            "list": ["{{ $json.id }}", 7, true],
        });
        assert_eq!(
            resolve(params, json!({"id": 42, "n": 4})).unwrap(),
            json!({
                "url": "https://api.example.com/users/42",
                "headers": {"X-Count": 8},
                "list": [42, 7, true],
            })
        );
    }

    #[test]
    fn test_plain_text_passes_through_and_is_idempotent() {
        let params = json!({"a": "no braces", "b": 3, "c": null, "d": "single { brace }"});
        let once = resolve(params.clone(), json!({})).unwrap();
        assert_eq!(once, params);
        let item = json!({"x": 1});
        let resolved = resolve(json!({"v": "{{ $json.x }}", "s": "n={{ $json.x }}"}), item.clone()).unwrap();
        assert_eq!(resolve(resolved.clone(), item).unwrap(), resolved);
    }

    #[test]
    fn test_braces_and_quotes_inside_expression() {
        assert_eq!(
            resolve(json!("{{ {a: '}}'}.a }}"), json!({})).unwrap(),
            json!("}}")
        );
        assert_eq!(
            resolve(json!("{{ {a: {b: 1}}.a.b }}"), json!({})).unwrap(),
            json!(1)
        );
    }

    #[test]
    fn test_unterminated_template() {
        assert!(matches!(
            resolve(json!("{{ $json.a"), json!({})),
            Err(ExpressionError::Syntax { position: 0, .. })
        ));
    }

    #[test]
    fn test_validate_expression() {
        assert!(validate_expression("plain text").is_ok());
        assert!(validate_expression("{{ $json.a.upper() }} and {{ $now }}").is_ok());
        assert!(matches!(
            validate_expression("{{ $json.constructor }}"),
            Err(ExpressionError::Forbidden(_))
        ));
        assert!(validate_expression("{{ require('fs') }}").is_err());
        assert!(validate_expression("{{ }}").is_err());
    }
}
