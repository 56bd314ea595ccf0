//! Declarative per-extension transform rules.
//!
//! A [`TransformConfig`] maps file extensions to an ordered chain of
//! [`TransformRule`]s, with one `default` chain for extensions that have
//! no entry of their own. [`TransformRuleEngine`] answers "which chain
//! applies to this file" and never fails: a missing configuration simply
//! resolves to an empty chain, which means "index the raw content".
//!
//! ```toml
//! [[transform.pdf]]
//! operation = "max_pages"
//! parameters = { num_max_pages = 5 }
//!
//! [[transform.default]]
//! operation = "move"
//! parameters = { output_format = "same" }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Operation names understood by the built-in executor.
pub const OP_MAX_PAGES: &str = "max_pages";
pub const OP_PRINT_SCREEN: &str = "print_screen";
pub const OP_MOVE: &str = "move";

/// One configured operation in a transform chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRule {
    pub operation: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Keys given next to `operation` instead of under `parameters`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TransformRule {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            parameters: Map::new(),
            extra: Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Look up a parameter, preferring `parameters` over top-level keys.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key).or_else(|| self.extra.get(key))
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.param(key).and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.param(key).and_then(Value::as_str)
    }
}

/// Extension → rule chain mapping, plus the fallback chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default)]
    pub default: Vec<TransformRule>,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Vec<TransformRule>>,
}

impl TransformConfig {
    /// Every rule in the configuration, with the key it was declared under.
    pub fn all_rules(&self) -> impl Iterator<Item = (&str, &TransformRule)> {
        self.extensions
            .iter()
            .flat_map(|(ext, rules)| rules.iter().map(move |r| (ext.as_str(), r)))
            .chain(self.default.iter().map(|r| ("default", r)))
    }
}

/// Resolves the transform chain for a file extension.
///
/// Built once per run from the loaded configuration and read-only after.
#[derive(Debug, Clone, Default)]
pub struct TransformRuleEngine {
    by_extension: BTreeMap<String, Vec<TransformRule>>,
    default: Vec<TransformRule>,
}

impl TransformRuleEngine {
    pub fn new(config: &TransformConfig) -> Self {
        let by_extension = config
            .extensions
            .iter()
            .map(|(ext, rules)| (normalize_key(ext), rules.clone()))
            .collect();
        Self {
            by_extension,
            default: config.default.clone(),
        }
    }

    /// Ordered rules for `extension` (case-insensitive, leading dot ignored).
    ///
    /// Falls back to the `default` chain when the extension has no entry
    /// or an empty one; returns an empty slice when neither exists.
    pub fn resolve(&self, extension: &str) -> &[TransformRule] {
        match self.by_extension.get(&normalize_key(extension)) {
            Some(rules) if !rules.is_empty() => rules,
            _ => &self.default,
        }
    }

    /// Extensions with a dedicated chain.
    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.by_extension.keys().map(String::as_str)
    }
}

/// Stable hash of a rule chain, recorded with every indexed document so
/// that editing the chain for an extension re-processes its documents.
///
/// Parameter maps serialize with sorted keys, so the hash only depends on
/// the rules and their order.
pub fn chain_hash(rules: &[TransformRule]) -> String {
    let mut hasher = Sha256::new();
    for rule in rules {
        hasher.update(rule.operation.as_bytes());
        hasher.update([0u8]);
        let mut params = rule.extra.clone();
        params.extend(rule.parameters.clone());
        hasher.update(Value::Object(params).to_string().as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

fn normalize_key(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_pdf_and_default() -> TransformConfig {
        let mut extensions = BTreeMap::new();
        extensions.insert(
            "pdf".to_string(),
            vec![TransformRule::new(OP_MAX_PAGES).with_param("num_max_pages", 5)],
        );
        TransformConfig {
            default: vec![TransformRule::new(OP_PRINT_SCREEN)],
            extensions,
        }
    }

    #[test]
    fn resolves_configured_extension() {
        let engine = TransformRuleEngine::new(&config_with_pdf_and_default());
        let rules = engine.resolve("pdf");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].operation, OP_MAX_PAGES);
        assert_eq!(rules[0].param_u64("num_max_pages"), Some(5));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let engine = TransformRuleEngine::new(&config_with_pdf_and_default());
        assert_eq!(engine.resolve("PDF")[0].operation, OP_MAX_PAGES);
        assert_eq!(engine.resolve(".pdf")[0].operation, OP_MAX_PAGES);
    }

    #[test]
    fn falls_back_to_default() {
        let engine = TransformRuleEngine::new(&config_with_pdf_and_default());
        let rules = engine.resolve("docx");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].operation, OP_PRINT_SCREEN);
    }

    #[test]
    fn empty_extension_entry_falls_back_to_default() {
        let mut config = config_with_pdf_and_default();
        config.extensions.insert("txt".to_string(), vec![]);
        let engine = TransformRuleEngine::new(&config);
        assert_eq!(engine.resolve("txt")[0].operation, OP_PRINT_SCREEN);
    }

    #[test]
    fn no_config_resolves_to_empty_chain() {
        let engine = TransformRuleEngine::new(&TransformConfig::default());
        assert!(engine.resolve("pdf").is_empty());
        assert!(engine.resolve("").is_empty());
    }

    #[test]
    fn top_level_parameters_are_accepted() {
        let rule: TransformRule = serde_json::from_value(serde_json::json!({
            "operation": "move",
            "output_format": "txt"
        }))
        .unwrap();
        assert_eq!(rule.param_str("output_format"), Some("txt"));
    }

    #[test]
    fn parameters_take_precedence_over_top_level() {
        let rule: TransformRule = serde_json::from_value(serde_json::json!({
            "operation": "move",
            "output_format": "txt",
            "parameters": { "output_format": "same" }
        }))
        .unwrap();
        assert_eq!(rule.param_str("output_format"), Some("same"));
    }

    #[test]
    fn chain_hash_tracks_rules_and_order() {
        let a = TransformRule::new(OP_MAX_PAGES).with_param("num_max_pages", 5);
        let b = TransformRule::new(OP_PRINT_SCREEN);
        let base = chain_hash(&[a.clone(), b.clone()]);
        assert_eq!(base, chain_hash(&[a.clone(), b.clone()]));
        assert_ne!(base, chain_hash(&[b.clone(), a.clone()]));
        assert_ne!(
            base,
            chain_hash(&[TransformRule::new(OP_MAX_PAGES).with_param("num_max_pages", 6), b])
        );
        assert_ne!(chain_hash(&[]), chain_hash(&[a]));
    }

    #[test]
    fn numeric_parameter_accepts_strings() {
        let rule = TransformRule::new(OP_MAX_PAGES).with_param("num_max_pages", "7");
        assert_eq!(rule.param_u64("num_max_pages"), Some(7));
    }
}
