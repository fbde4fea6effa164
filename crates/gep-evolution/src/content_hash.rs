use serde::Serialize;
use serde_json::{Number, Value};

use crate::{
    serde_err, sha256_hex, Capsule, EvolutionError, EvolutionEvent, Gene, ValidationReport,
    SCHEMA_VERSION,
};

/// Deterministic JSON: object keys sorted at every depth, no whitespace,
/// non-finite numbers rendered as `null`.
pub fn canonicalize(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => canonical_number(number),
        Value::String(text) => quote(text),
        Value::Array(items) => {
            let parts = items.iter().map(canonicalize).collect::<Vec<_>>();
            format!("[{}]", parts.join(","))
        }
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            let parts = keys
                .into_iter()
                .map(|key| format!("{}:{}", quote(key), canonicalize(&map[key])))
                .collect::<Vec<_>>();
            format!("{{{}}}", parts.join(","))
        }
    }
}

/// `sha256:<hex>` over the canonical form of `value` without its `asset_id`.
pub fn compute_asset_id(value: &Value) -> String {
    let mut stripped = value.clone();
    if let Value::Object(map) = &mut stripped {
        map.remove("asset_id");
    }
    format!("sha256:{}", sha256_hex(&canonicalize(&stripped)))
}

pub fn verify_asset_id(value: &Value) -> bool {
    match value.get("asset_id").and_then(Value::as_str) {
        Some(claimed) if !claimed.is_empty() => compute_asset_id(value) == claimed,
        _ => false,
    }
}

/// Assets whose identity is the hash of their own content.
pub trait ContentAddressed: Serialize {
    fn asset_id(&self) -> Option<&str>;
    fn set_asset_id(&mut self, asset_id: String);
    fn schema_version(&self) -> &str;
    fn set_schema_version(&mut self, version: String);

    fn content_address(&self) -> Result<String, EvolutionError> {
        let value = serde_json::to_value(self).map_err(serde_err)?;
        Ok(compute_asset_id(&value))
    }

    /// Recomputes `asset_id` from the current content.
    fn seal(&mut self) -> Result<(), EvolutionError> {
        if self.schema_version().is_empty() {
            self.set_schema_version(SCHEMA_VERSION.to_string());
        }
        let asset_id = self.content_address()?;
        self.set_asset_id(asset_id);
        Ok(())
    }

    /// Fills `schema_version` and `asset_id` only when they are absent.
    fn ensure_schema_fields(&mut self) -> Result<(), EvolutionError> {
        if self.schema_version().is_empty() {
            self.set_schema_version(SCHEMA_VERSION.to_string());
        }
        if self.asset_id().map(str::is_empty).unwrap_or(true) {
            let asset_id = self.content_address()?;
            self.set_asset_id(asset_id);
        }
        Ok(())
    }

    fn has_valid_asset_id(&self) -> bool {
        match (self.asset_id(), self.content_address()) {
            (Some(claimed), Ok(actual)) => claimed == actual,
            _ => false,
        }
    }
}

macro_rules! impl_content_addressed {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl ContentAddressed for $ty {
                fn asset_id(&self) -> Option<&str> {
                    self.asset_id.as_deref()
                }

                fn set_asset_id(&mut self, asset_id: String) {
                    self.asset_id = Some(asset_id);
                }

                fn schema_version(&self) -> &str {
                    &self.schema_version
                }

                fn set_schema_version(&mut self, version: String) {
                    self.schema_version = version;
                }
            }
        )+
    };
}

impl_content_addressed!(Gene, Capsule, EvolutionEvent, ValidationReport);

fn canonical_number(number: &Number) -> String {
    if number.is_f64() {
        if let Some(value) = number.as_f64() {
            if !value.is_finite() {
                return "null".to_string();
            }
            if value.fract() == 0.0 && value.abs() < 1e15 {
                return format!("{}", value as i64);
            }
        }
    }
    number.to_string()
}

fn quote(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| String::from("\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GeneCategory;
    use serde_json::json;

    #[test]
    fn canonical_form_sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"z": [true, null], "y": "x"}});
        assert_eq!(canonicalize(&value), r#"{"a":{"y":"x","z":[true,null]},"b":1}"#);
    }

    #[test]
    fn integral_floats_render_like_integers() {
        assert_eq!(canonicalize(&json!(1.0)), "1");
        assert_eq!(canonicalize(&json!(0.85)), "0.85");
    }

    #[test]
    fn asset_id_ignores_existing_asset_id_and_key_order() {
        let first = json!({"type": "Gene", "id": "g1", "asset_id": "sha256:stale"});
        let second = json!({"id": "g1", "type": "Gene"});
        assert_eq!(compute_asset_id(&first), compute_asset_id(&second));
        assert!(compute_asset_id(&second).starts_with("sha256:"));
    }

    #[test]
    fn verify_detects_tampering() {
        let mut value = json!({"type": "Capsule", "id": "c1", "confidence": 0.9});
        let asset_id = compute_asset_id(&value);
        value["asset_id"] = json!(asset_id);
        assert!(verify_asset_id(&value));
        value["confidence"] = json!(0.1);
        assert!(!verify_asset_id(&value));
        assert!(!verify_asset_id(&json!({"id": "no-id"})));
    }

    #[test]
    fn ensure_schema_fields_keeps_existing_identity() {
        let mut gene = Gene::new("gene_a", GeneCategory::Repair);
        gene.schema_version.clear();
        gene.ensure_schema_fields().unwrap();
        assert_eq!(gene.schema_version, SCHEMA_VERSION);
        let first = gene.asset_id.clone().unwrap();
        assert!(gene.has_valid_asset_id());

        gene.signals_match.push("timeout".into());
        gene.ensure_schema_fields().unwrap();
        assert_eq!(gene.asset_id.as_deref(), Some(first.as_str()));
        assert!(!gene.has_valid_asset_id());

        gene.seal().unwrap();
        assert_ne!(gene.asset_id.as_deref(), Some(first.as_str()));
        assert!(gene.has_valid_asset_id());
    }
}
