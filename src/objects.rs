//! Accessors over untyped Kubernetes object trees and quantity parsing.
//!
//! Longhorn CRDs and rendered GitOps manifests arrive as `serde_json::Value`
//! trees; these helpers walk nested paths without panicking on shape
//! surprises.

use serde_json::Value;

/// Walk a nested map path and return the string at the leaf.
pub fn nested_str<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    nested_value(value, path).and_then(Value::as_str)
}

/// Walk a nested map path and return the integer at the leaf.
pub fn nested_i64(value: &Value, path: &[&str]) -> Option<i64> {
    nested_value(value, path).and_then(Value::as_i64)
}

/// Walk a nested map path and return the array at the leaf.
pub fn nested_slice<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Vec<Value>> {
    nested_value(value, path).and_then(Value::as_array)
}

fn nested_value<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Parse a Kubernetes CPU quantity into millicores.
///
/// Accepts the forms the API server hands back for allocatable CPU and
/// container requests: plain cores (`"4"`), millicores (`"1500m"`), and
/// fractional cores (`"0.5"`). Unrecognized strings yield `None`.
pub fn parse_cpu_millis(quantity: &str) -> Option<i64> {
    let q = quantity.trim();
    if q.is_empty() {
        return None;
    }

    if let Some(milli) = q.strip_suffix('m') {
        return milli.parse::<i64>().ok();
    }

    if q.contains('.') {
        #[allow(clippy::cast_possible_truncation)]
        return q.parse::<f64>().ok().map(|cores| (cores * 1000.0).round() as i64);
    }

    q.parse::<i64>().ok().map(|cores| cores * 1000)
}

/// Parse a Longhorn size string (plain decimal bytes) into a byte count.
///
/// Longhorn stores `spec.size` as a stringified byte count; anything else
/// is treated as unparsable and skips capacity checks.
pub fn parse_byte_size(size: &str) -> i64 {
    size.trim().parse::<i64>().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_str() {
        let obj = json!({"status": {"state": "attached", "robustness": "healthy"}});
        assert_eq!(nested_str(&obj, &["status", "state"]), Some("attached"));
        assert_eq!(nested_str(&obj, &["status", "missing"]), None);
        assert_eq!(nested_str(&obj, &["spec", "state"]), None);
    }

    #[test]
    fn test_nested_i64() {
        let obj = json!({"status": {"actualSize": 1073741824_i64}});
        assert_eq!(nested_i64(&obj, &["status", "actualSize"]), Some(1073741824));
        assert_eq!(nested_i64(&obj, &["status", "state"]), None);
    }

    #[test]
    fn test_nested_slice() {
        let obj = json!({"status": {"conditions": [{"type": "Ready"}]}});
        let conditions = nested_slice(&obj, &["status", "conditions"]).unwrap();
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn test_parse_cpu_millis() {
        assert_eq!(parse_cpu_millis("4"), Some(4000));
        assert_eq!(parse_cpu_millis("1500m"), Some(1500));
        assert_eq!(parse_cpu_millis("0.5"), Some(500));
        assert_eq!(parse_cpu_millis("2.25"), Some(2250));
        assert_eq!(parse_cpu_millis(""), None);
        assert_eq!(parse_cpu_millis("garbage"), None);
    }

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("21474836480"), 21474836480);
        assert_eq!(parse_byte_size(""), 0);
        assert_eq!(parse_byte_size("10Gi"), 0);
    }
}
