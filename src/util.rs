//! Small shared helpers: canonical JSON encoding and string truncation.
//!
//! Canonical JSON (object keys sorted recursively, no insignificant
//! whitespace) is the encoding every integrity hash and checksum in the
//! crate is computed over. Two structurally equal values always produce
//! the same byte string.

use serde_json::Value;

/// Encode a JSON value canonically: object keys sorted recursively,
/// arrays in order, compact separators.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Truncate a string to a maximum number of characters, appending `...`
/// when anything was cut.
pub fn truncate_str(s: &str, max_len: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let a = json!({"b": 1, "a": {"z": true, "y": [1, 2]}});
        let b = json!({"a": {"y": [1, 2], "z": true}, "b": 1});

        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"y":[1,2],"z":true},"b":1}"#);
    }

    #[test]
    fn canonical_json_preserves_array_order() {
        let v = json!([3, 1, 2]);
        assert_eq!(canonical_json(&v), "[3,1,2]");
    }

    #[test]
    fn canonical_json_scalars() {
        assert_eq!(canonical_json(&json!(null)), "null");
        assert_eq!(canonical_json(&json!("x")), "\"x\"");
        assert_eq!(canonical_json(&json!(1.5)), "1.5");
    }

    #[test]
    fn truncate_leaves_short_strings_alone() {
        assert_eq!(truncate_str("abc", 10), "abc");
    }

    #[test]
    fn truncate_cuts_long_strings() {
        assert_eq!(truncate_str("abcdefghij", 6), "abc...");
    }
}
