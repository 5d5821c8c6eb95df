//! Dotted-path access into CLI JSON output.
//!
//! Paths are `.`-separated keys; numeric segments index arrays and `#`
//! fans out over every element (`validators.#.operator_address`).

use serde_json::Value;
use systest_common::{HarnessError, HarnessResult};

/// Value at `path`, if every segment resolves to a single element.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Every value reachable through `path`, with `#` expanding arrays.
pub fn collect<'a>(value: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![value];
    if path.is_empty() {
        return current;
    }
    for segment in path.split('.') {
        let mut next = Vec::new();
        for item in current {
            match (item, segment) {
                (Value::Array(items), "#") => next.extend(items.iter()),
                (Value::Array(items), idx) => {
                    if let Some(v) = idx.parse::<usize>().ok().and_then(|i| items.get(i)) {
                        next.push(v);
                    }
                }
                (Value::Object(map), key) => {
                    if let Some(v) = map.get(key) {
                        next.push(v);
                    }
                }
                _ => {}
            }
        }
        current = next;
    }
    current
}

pub fn require<'a>(value: &'a Value, path: &str) -> HarnessResult<&'a Value> {
    lookup(value, path).ok_or_else(|| HarnessError::state(format!("missing JSON path `{path}`")))
}

pub fn require_str<'a>(value: &'a Value, path: &str) -> HarnessResult<&'a str> {
    require(value, path)?
        .as_str()
        .ok_or_else(|| HarnessError::state(format!("JSON path `{path}` is not a string")))
}

/// Reads an integer encoded either as a JSON number or a decimal string.
pub fn as_u64_lenient(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validators() -> Value {
        json!({
            "validators": [
                {"operator_address": "valoper1a", "tokens": "100"},
                {"operator_address": "valoper1b", "tokens": 200}
            ],
            "pagination": {"total": "2"}
        })
    }

    #[test]
    fn test_lookup_nested_and_indexed() {
        let doc = validators();
        assert_eq!(
            lookup(&doc, "validators.1.operator_address"),
            Some(&json!("valoper1b"))
        );
        assert_eq!(lookup(&doc, "validators.5"), None);
        assert_eq!(lookup(&doc, "pagination.total.deeper"), None);
        assert_eq!(lookup(&doc, ""), Some(&doc));
    }

    #[test]
    fn test_collect_fans_out() {
        let doc = validators();
        let addrs: Vec<&str> = collect(&doc, "validators.#.operator_address")
            .into_iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(addrs, vec!["valoper1a", "valoper1b"]);
        assert!(collect(&doc, "missing.#").is_empty());
    }

    #[test]
    fn test_require_reports_path() {
        let doc = validators();
        let err = require(&doc, "balance.amount").unwrap_err();
        assert!(err.to_string().contains("balance.amount"));
        assert_eq!(err.code(), "SYS301");
        assert!(require_str(&doc, "pagination").is_err());
    }

    #[test]
    fn test_lenient_integers() {
        let doc = validators();
        let tokens: Vec<u64> = collect(&doc, "validators.#.tokens")
            .into_iter()
            .filter_map(as_u64_lenient)
            .collect();
        assert_eq!(tokens, vec![100, 200]);
    }
}
