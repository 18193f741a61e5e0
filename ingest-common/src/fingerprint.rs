use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

const FIELD_DELIMITER: &str = "|";

/// Computes the content fingerprint of a set of semantic fields.
///
/// Fields are sorted by name and rendered as `name=value` pairs joined by `|` before being
/// hashed with SHA-256, so the result does not depend on the order the fields were supplied in.
/// Strings are rendered without quotes, every other scalar with its JSON representation. If a
/// field name is repeated, the last value wins.
///
/// The returned hex digest doubles as the dedup key on the domain topic and the merge key in
/// storage, so normalizers must only feed it fields that define the identity of an event.
pub fn fingerprint<I, K>(fields: I) -> String
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    let sorted: BTreeMap<String, Value> = fields
        .into_iter()
        .map(|(name, value)| (name.into(), value))
        .collect();

    let canonical = sorted
        .iter()
        .map(|(name, value)| format!("{name}={}", render(value)))
        .collect::<Vec<_>>()
        .join(FIELD_DELIMITER);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
