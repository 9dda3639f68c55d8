//! JavaScript-flavoured coercions over `serde_json::Value`.

use std::cmp::Ordering;

use serde_json::Value;

use super::ExpressionError;

/// Largest integer an f64 represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Convert an arithmetic result back into JSON.
///
/// Integral results become JSON integers so `2 + 3` compares equal to `5`.
pub fn number(n: f64) -> Result<Value, ExpressionError> {
    if !n.is_finite() {
        return Err(ExpressionError::Evaluation(
            "arithmetic produced a non-finite number".to_string(),
        ));
    }
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        return Ok(Value::from(n as i64));
    }
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| ExpressionError::Evaluation(format!("cannot represent {}", n)))
}

pub fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Null => Some(0.0),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Some(0.0)
            } else {
                trimmed.parse::<f64>().ok()
            }
        }
        Value::Array(_) | Value::Object(_) => None,
    }
}

pub fn expect_number(value: &Value, what: &str) -> Result<f64, ExpressionError> {
    to_number(value).ok_or_else(|| {
        ExpressionError::Type(format!(
            "{} expects a number, got {}",
            what,
            type_name(value)
        ))
    })
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Text form used when a value is spliced into a larger string.
pub fn to_display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER => {
                (f as i64).to_string()
            }
            _ => n.to_string(),
        },
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

pub fn strict_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

pub fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(_), Value::Number(_))
        | (Value::Number(_), Value::String(_))
        | (Value::Bool(_), _)
        | (_, Value::Bool(_)) => match (to_number(left), to_number(right)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        _ => strict_eq(left, right),
    }
}

/// Ordering for `<`, `<=`, `>`, `>=`. `None` means "not comparable".
pub fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    if let (Value::String(a), Value::String(b)) = (left, right) {
        return Some(a.cmp(b));
    }
    let a = to_number(left)?;
    let b = to_number(right)?;
    a.partial_cmp(&b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integral_results_are_integers() {
        assert_eq!(number(5.0).unwrap(), json!(5));
        assert_eq!(number(2.5).unwrap(), json!(2.5));
        assert!(number(f64::INFINITY).is_err());
    }

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&Value::Null));
        assert!(truthy(&json!([])));
        assert!(truthy(&json!("0")));
    }

    #[test]
    fn test_display() {
        assert_eq!(to_display(&json!(3.0)), "3");
        assert_eq!(to_display(&json!(null)), "");
        assert_eq!(to_display(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[test]
    fn test_equality() {
        assert!(loose_eq(&json!("5"), &json!(5)));
        assert!(!strict_eq(&json!("5"), &json!(5)));
        assert!(strict_eq(&json!(5), &json!(5.0)));
        assert!(!loose_eq(&json!(null), &json!(0)));
    }

    #[test]
    fn test_compare() {
        assert_eq!(compare(&json!("b"), &json!("a")), Some(Ordering::Greater));
        assert_eq!(compare(&json!("10"), &json!(9)), Some(Ordering::Greater));
        assert_eq!(compare(&json!({}), &json!(1)), None);
    }
}
