// llm-service-rs/src/json.rs
//
// Models asked for "strict JSON" still wrap it in code fences or add a
// sentence before it. These helpers cut the outermost object out of the
// response before handing it to serde.

use serde::de::DeserializeOwned;

/// Return the outermost `{ ... }` span of `raw`, or the trimmed input when no
/// object delimiters are present.
pub fn json_slice(raw: &str) -> &str {
    let trimmed = raw.trim();
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    }
}

/// Deserialize the JSON object embedded in a model response.
pub fn extract_json<T: DeserializeOwned>(raw: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(json_slice(raw))
}
