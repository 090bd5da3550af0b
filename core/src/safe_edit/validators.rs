//! Structured-text validators pluggable into [`super::SafeEditService::stage`]
//! (spec.md §4.6).

/// A structural check over staged text content. Returns `Err(reason)` on
/// rejection; `stage` treats a validator failure the same as a forbidden
/// pattern hit.
pub trait Validator: Send + Sync {
    fn validate(&self, content: &str) -> Result<(), String>;
}

pub struct JsonValidator;

impl Validator for JsonValidator {
    fn validate(&self, content: &str) -> Result<(), String> {
        serde_json::from_str::<serde_json::Value>(content)
            .map(|_| ())
            .map_err(|e| format!("invalid JSON: {e}"))
    }
}

pub struct TomlValidator;

impl Validator for TomlValidator {
    fn validate(&self, content: &str) -> Result<(), String> {
        content
            .parse::<toml::Value>()
            .map(|_| ())
            .map_err(|e| format!("invalid TOML: {e}"))
    }
}

pub struct YamlValidator;

impl Validator for YamlValidator {
    fn validate(&self, content: &str) -> Result<(), String> {
        serde_yml::from_str::<serde_yml::Value>(content)
            .map(|_| ())
            .map_err(|e| format!("invalid YAML: {e}"))
    }
}

/// Accepts any content; used when the target has no structured format but
/// should still pass through the forbidden-pattern and size checks.
pub struct PlainTextValidator;

impl Validator for PlainTextValidator {
    fn validate(&self, _content: &str) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_validator_rejects_malformed_input() {
        assert!(JsonValidator.validate("{not json").is_err());
        assert!(JsonValidator.validate("{\"a\": 1}").is_ok());
    }

    #[test]
    fn toml_validator_rejects_malformed_input() {
        assert!(TomlValidator.validate("a = ").is_err());
        assert!(TomlValidator.validate("a = 1").is_ok());
    }

    #[test]
    fn yaml_validator_rejects_malformed_input() {
        assert!(YamlValidator.validate("a: [1, 2").is_err());
        assert!(YamlValidator.validate("a: 1").is_ok());
    }
}
