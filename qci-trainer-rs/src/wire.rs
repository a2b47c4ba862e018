// qci-trainer-rs/src/wire.rs
// Lenient serde helpers for model-produced JSON. Models return numbers as
// strings ("45%", "8"), strings as numbers, and null where a list belongs.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Accept a number, a numeric string (optionally with a trailing `%`), or
/// null. Anything else is `None`.
pub fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_as_f64))
}

pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

/// Accept any scalar and render it as text; null becomes "".
pub fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    })
}

/// Accept a list of strings, a single string, or null.
pub fn lenient_strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.trim().is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s],
        _ => Vec::new(),
    })
}

/// Treat `null` like a missing field for container types.
pub fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Loose {
        #[serde(default, deserialize_with = "lenient_f64")]
        number: Option<f64>,
        #[serde(default, deserialize_with = "lenient_string")]
        text: String,
        #[serde(default, deserialize_with = "lenient_strings")]
        list: Vec<String>,
    }

    #[test]
    fn accepts_loosely_typed_values() {
        let loose: Loose =
            serde_json::from_value(json!({ "number": "45%", "text": 3, "list": "one" })).unwrap();
        assert_eq!(loose.number, Some(45.0));
        assert_eq!(loose.text, "3");
        assert_eq!(loose.list, vec!["one".to_string()]);

        let loose: Loose = serde_json::from_value(json!({ "number": null, "list": [null, "a", ""] })).unwrap();
        assert_eq!(loose.number, None);
        assert_eq!(loose.text, "");
        assert_eq!(loose.list, vec!["a".to_string()]);
    }
}
