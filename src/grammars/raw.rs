use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use serde::de::{self, Deserializer};
use serde::Deserialize;

use crate::error::OcraResult;

/// Capture rules keyed by capture group index.
///
/// Grammar JSON keys them with strings ("0", "1", ...) and the values are full
/// rules: a capture can carry just a scope name, or patterns for
/// retokenization of the captured text.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Captures(#[serde(deserialize_with = "deserialize_capture_map")] pub BTreeMap<usize, RawRule>);

impl Captures {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &usize> {
        self.0.keys()
    }
}

fn deserialize_capture_map<'de, D>(deserializer: D) -> Result<BTreeMap<usize, RawRule>, D::Error>
where
    D: Deserializer<'de>,
{
    let string_map = BTreeMap::<String, RawRule>::deserialize(deserializer)?;
    let mut out = BTreeMap::new();
    for (key, value) in string_map {
        let index: usize = key
            .parse()
            .map_err(|_| de::Error::custom(format!("capture key '{key}' is not a number")))?;
        out.insert(index, value);
    }
    Ok(out)
}

/// `applyEndPatternLast` appears as a bool or as 0/1 depending on the grammar.
fn deserialize_bool_or_int<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrInt {
        Bool(bool),
        Int(i64),
    }

    Ok(match BoolOrInt::deserialize(deserializer)? {
        BoolOrInt::Bool(b) => b,
        BoolOrInt::Int(i) => i != 0,
    })
}

/// One rule as it appears in grammar JSON.
///
/// Every field is optional; which combination is present decides what kind of
/// rule this compiles to:
/// - `match` -> a single-line match rule
/// - `begin` + `end` -> a delimited region
/// - `begin` + `while` -> a region continuing while the condition holds
/// - `include` -> a reference to another rule
/// - only `patterns` -> a container
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all(deserialize = "camelCase"), default)]
pub struct RawRule {
    /// Scope name for the whole rule, e.g. `string.quoted.double.js`.
    /// May contain `$1`-style placeholders resolved against the match.
    pub name: Option<String>,
    /// Scope name for the content between begin and end delimiters.
    pub content_name: Option<String>,
    #[serde(rename(deserialize = "match"))]
    pub match_: Option<String>,
    pub begin: Option<String>,
    /// May reference begin captures with `\1`, `\2`, ...
    pub end: Option<String>,
    /// Same backreference mechanism as `end`.
    #[serde(rename(deserialize = "while"))]
    pub while_: Option<String>,
    /// Fallback for both begin and end captures when the specific ones are
    /// absent.
    pub captures: Captures,
    pub begin_captures: Captures,
    pub end_captures: Captures,
    pub while_captures: Captures,
    pub patterns: Vec<RawRule>,
    /// `#name`, `$self`, `$base`, `scope.name` or `scope.name#rule`
    pub include: Option<String>,
    pub repository: BTreeMap<String, RawRule>,
    #[serde(deserialize_with = "deserialize_bool_or_int")]
    pub apply_end_pattern_last: bool,
}

/// Top-level structure of a TextMate grammar file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all(deserialize = "camelCase"), default)]
pub struct RawGrammar {
    /// Name end users refer to, e.g. "JavaScript"
    pub name: String,
    /// Unique scope identifying the grammar, e.g. `source.js`
    pub scope_name: String,
    pub file_types: Vec<String>,
    /// Root patterns, applied when no rule is active
    pub patterns: Vec<RawRule>,
    /// Named sub-rules referenced via `#name` includes
    pub repository: BTreeMap<String, RawRule>,
    /// Selector -> rules matched opportunistically at every position
    pub injections: BTreeMap<String, RawRule>,
    /// Selector controlling where this whole grammar gets injected when
    /// another grammar lists us in `injectTo`
    pub injection_selector: Option<String>,
    /// Scope names of grammars this one wants to be injected into
    pub inject_to: Vec<String>,
}

impl RawGrammar {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> OcraResult<Self> {
        let file = File::open(&path)?;
        let raw_grammar = serde_json::from_reader(&file)?;
        Ok(raw_grammar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_deserialize_capture_keys() {
        let rule: RawRule = serde_json::from_value(serde_json::json!({
            "match": "(a)(b)",
            "captures": {
                "1": { "name": "first" },
                "2": { "name": "second" }
            }
        }))
        .unwrap();

        assert_eq!(rule.match_.as_deref(), Some("(a)(b)"));
        assert_eq!(rule.captures.0.len(), 2);
        assert_eq!(rule.captures.0[&1].name.as_deref(), Some("first"));
    }

    #[test]
    fn apply_end_pattern_last_accepts_int_and_bool() {
        let as_int: RawRule =
            serde_json::from_value(serde_json::json!({ "applyEndPatternLast": 1 })).unwrap();
        let as_bool: RawRule =
            serde_json::from_value(serde_json::json!({ "applyEndPatternLast": true })).unwrap();
        let absent: RawRule = serde_json::from_value(serde_json::json!({})).unwrap();

        assert!(as_int.apply_end_pattern_last);
        assert!(as_bool.apply_end_pattern_last);
        assert!(!absent.apply_end_pattern_last);
    }

    #[test]
    fn grammar_with_repository_and_injections() {
        let grammar: RawGrammar = serde_json::from_value(serde_json::json!({
            "name": "Test",
            "scopeName": "source.test",
            "patterns": [{ "include": "#main" }],
            "repository": {
                "main": { "match": "x", "name": "keyword.x" }
            },
            "injections": {
                "L:source.test": { "match": "!", "name": "punctuation.bang" }
            }
        }))
        .unwrap();

        assert_eq!(grammar.scope_name, "source.test");
        assert_eq!(grammar.patterns.len(), 1);
        assert!(grammar.repository.contains_key("main"));
        assert_eq!(grammar.injections.len(), 1);
    }
}
