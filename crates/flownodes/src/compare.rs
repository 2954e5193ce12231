//! Comparison operators shared by conditions and routers.

use flowcore::BlockError;
use serde_json::Value;

/// Compare two resolved values with a named operator
pub fn evaluate(left: &Value, operator: &str, right: &Value) -> Result<bool, BlockError> {
    let result = match operator.trim() {
        "==" | "eq" | "equals" => loosely_equal(left, right),
        "!=" | "ne" | "not_equals" => !loosely_equal(left, right),
        ">" | "gt" => ordering(left, right).is_some_and(|o| o.is_gt()),
        "<" | "lt" => ordering(left, right).is_some_and(|o| o.is_lt()),
        ">=" | "gte" => ordering(left, right).is_some_and(|o| o.is_ge()),
        "<=" | "lte" => ordering(left, right).is_some_and(|o| o.is_le()),
        "contains" => contains(left, right),
        "not_contains" => !contains(left, right),
        "truthy" => is_truthy(left),
        "falsy" => !is_truthy(left),
        other => {
            return Err(BlockError::Configuration(format!(
                "unknown comparison operator '{}'",
                other
            )))
        }
    };

    tracing::debug!(
        left = %left,
        operator = %operator,
        right = %right,
        result = result,
        "Evaluated comparison"
    );
    Ok(result)
}

/// JavaScript-like truthiness
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a == b,
        _ => match (left, right) {
            (Value::String(a), b) | (b, Value::String(a)) if !b.is_string() => *a == b.to_string(),
            _ => false,
        },
    }
}

fn ordering(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (left, right) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        },
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => match needle {
            Value::String(n) => s.contains(n.as_str()),
            other => s.contains(&other.to_string()),
        },
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_compare_across_strings() {
        assert!(evaluate(&json!("10"), ">", &json!(9)).unwrap());
        assert!(evaluate(&json!(3), "==", &json!("3")).unwrap());
        assert!(!evaluate(&json!(3), "!=", &json!(3.0)).unwrap());
    }

    #[test]
    fn contains_works_on_text_and_lists() {
        assert!(evaluate(&json!("hello world"), "contains", &json!("world")).unwrap());
        assert!(evaluate(&json!([1, 2, 3]), "contains", &json!(2)).unwrap());
        assert!(!evaluate(&json!({"a": 1}), "contains", &json!("b")).unwrap());
    }

    #[test]
    fn truthiness() {
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(0)));
        assert!(is_truthy(&json!([])));
        assert!(evaluate(&json!("yes"), "truthy", &Value::Null).unwrap());
    }

    #[test]
    fn unknown_operator_is_a_configuration_error() {
        assert!(matches!(
            evaluate(&json!(1), "~=", &json!(1)),
            Err(BlockError::Configuration(_))
        ));
    }
}
