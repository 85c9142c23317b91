pub mod analysis;
pub mod data;
pub mod generation;
pub mod output;

use std::collections::BTreeMap;

/// Numeric records loaded into working data, if any.
pub(crate) fn records(data: &BTreeMap<String, serde_json::Value>) -> Option<Vec<f64>> {
    let values = data.get("records")?.as_array()?;
    Some(values.iter().filter_map(|v| v.as_f64()).collect())
}

/// Resolve a dot path like `profile.mean` against working data.
pub(crate) fn lookup<'a>(
    data: &'a BTreeMap<String, serde_json::Value>,
    path: &str,
) -> Option<&'a serde_json::Value> {
    let mut segments = path.split('.').filter(|s| !s.is_empty());
    let mut current = data.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            other => other.get(segment)?,
        };
    }
    Some(current)
}
