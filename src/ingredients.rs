use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;
use tracing::warn;

use crate::error::{HarnessError, Result};

/// A pipeline parameter value after string coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IngredientValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for IngredientValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Str(v) => write!(f, "{}", v),
        }
    }
}

fn int_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+$").expect("valid integer pattern"))
}

fn float_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d*\.\d+$").expect("valid decimal pattern"))
}

/// Coerce a raw CLI value: digits become an integer, a decimal becomes a
/// float, anything else stays a (trimmed) string. Digits too large for an
/// `i64` are kept as the original string.
pub fn convert(raw: &str) -> IngredientValue {
    let s = raw.trim();
    if int_pattern().is_match(s) {
        match s.parse::<i64>() {
            Ok(v) => return IngredientValue::Int(v),
            Err(e) => warn!(
                value = %s,
                error = %e,
                "Integer ingredient out of range, keeping it as text"
            ),
        }
    } else if float_pattern().is_match(s) {
        if let Ok(v) = s.parse::<f64>() {
            return IngredientValue::Float(v);
        }
    }
    IngredientValue::Str(s.to_string())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ingredients(BTreeMap<String, IngredientValue>);

impl Ingredients {
    /// Pair `--var-name` / `--var-value` occurrences in order.
    pub fn from_pairs(names: &[String], values: &[String]) -> Result<Self> {
        if names.len() != values.len() {
            return Err(HarnessError::configuration(format!(
                "every --var-name needs a matching --var-value (got {} names, {} values)",
                names.len(),
                values.len()
            )));
        }
        let mut map = BTreeMap::new();
        for (name, value) in names.iter().zip(values) {
            map.insert(name.clone(), convert(value));
        }
        Ok(Self(map))
    }

    pub fn get_str_or(&self, name: &str, default: &str) -> String {
        match self.0.get(name) {
            Some(v) => v.to_string(),
            None => default.to_string(),
        }
    }

    pub fn get_int_or(&self, name: &str, default: i64) -> i64 {
        match self.0.get(name) {
            Some(IngredientValue::Int(v)) => *v,
            Some(IngredientValue::Float(v)) => *v as i64,
            _ => default,
        }
    }

    #[cfg(test)]
    pub fn insert(&mut self, name: impl Into<String>, value: IngredientValue) {
        self.0.insert(name.into(), value);
    }
}

impl fmt::Display for Ingredients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_int() {
        assert_eq!(convert("42"), IngredientValue::Int(42));
        assert_eq!(convert("  7 "), IngredientValue::Int(7));
    }

    #[test]
    fn test_convert_float() {
        assert_eq!(convert("0.5"), IngredientValue::Float(0.5));
        assert_eq!(convert(".25"), IngredientValue::Float(0.25));
    }

    #[test]
    fn test_convert_string() {
        assert_eq!(convert("-3"), IngredientValue::Str("-3".into()));
        assert_eq!(convert("1e5"), IngredientValue::Str("1e5".into()));
        assert_eq!(convert("5."), IngredientValue::Str("5.".into()));
        assert_eq!(convert("gpt-4o"), IngredientValue::Str("gpt-4o".into()));
    }

    #[test]
    fn test_convert_int_overflow_keeps_text() {
        let huge = "92233720368547758070";
        assert_eq!(convert(huge), IngredientValue::Str(huge.into()));
        assert_eq!(
            convert("9223372036854775807"),
            IngredientValue::Int(i64::MAX)
        );
    }

    #[test]
    fn test_from_pairs() {
        let names = vec!["chunk_size".to_string(), "model".to_string()];
        let values = vec!["512".to_string(), "small".to_string()];
        let ing = Ingredients::from_pairs(&names, &values).unwrap();
        assert_eq!(ing.get_int_or("chunk_size", 0), 512);
        assert_eq!(ing.get_str_or("model", ""), "small");
        assert_eq!(ing.get_int_or("missing", 3), 3);
        assert_eq!(ing.to_string(), "{chunk_size=512, model=small}");
    }

    #[test]
    fn test_from_pairs_mismatch() {
        let names = vec!["a".to_string()];
        let err = Ingredients::from_pairs(&names, &[]).unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
    }
}
