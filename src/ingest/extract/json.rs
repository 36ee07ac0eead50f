//! JSON extraction: nested structures flattened into key-value lines

use std::path::Path;

use crate::error::{GroundedError, Result};
use crate::types::{Metadata, Scalar, TextBlock};

use super::Extractor;

fn flatten(value: &serde_json::Value, prefix: &str, items: &mut Vec<(String, String)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let new_key = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(child, &new_key, items);
            }
        }
        serde_json::Value::Array(list) => {
            for (i, child) in list.iter().enumerate() {
                flatten(child, &format!("{}[{}]", prefix, i), items);
            }
        }
        other => {
            let key = if prefix.is_empty() { "value" } else { prefix };
            let rendered = match other {
                serde_json::Value::String(s) => s.clone(),
                v => v.to_string(),
            };
            items.push((key.to_string(), rendered));
        }
    }
}

pub struct JsonExtractor;

impl Extractor for JsonExtractor {
    fn extensions(&self) -> Vec<&'static str> {
        vec![".json"]
    }

    fn extract(&self, path: &Path) -> Result<Vec<TextBlock>> {
        let content = std::fs::read_to_string(path)?;
        let data: serde_json::Value = serde_json::from_str(&content)
            .map_err(|e| GroundedError::Extraction(format!("Invalid JSON: {}", e)))?;

        let mut items = Vec::new();
        flatten(&data, "", &mut items);

        let mut metadata = Metadata::new();
        metadata.insert("file_type".into(), Scalar::Str("json".into()));

        if items.is_empty() {
            return Ok(vec![TextBlock::new("[Empty JSON]", metadata)]);
        }

        metadata.insert("keys_count".into(), Scalar::Int(items.len() as i64));
        let text = items
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(vec![TextBlock::new(text, metadata)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_nested() {
        let value = serde_json::json!({
            "plan": {"name": "strength", "weeks": [1, 2]},
            "active": true,
        });
        let mut items = Vec::new();
        flatten(&value, "", &mut items);
        assert!(items.contains(&("plan.name".to_string(), "strength".to_string())));
        assert!(items.contains(&("plan.weeks[1]".to_string(), "2".to_string())));
        assert!(items.contains(&("active".to_string(), "true".to_string())));
    }
}
