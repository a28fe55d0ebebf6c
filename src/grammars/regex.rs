use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

/// A regex wrapper that keeps its source string and compiles lazily at
/// runtime. A pattern that fails to compile yields `None` from `compiled()`;
/// callers decide whether that is fatal (strict mode) or means "never
/// matches" (forgiving mode).
pub struct Regex {
    pattern: String,
    compiled: OnceLock<Option<Arc<onig::Regex>>>,
}

impl Clone for Regex {
    fn clone(&self) -> Self {
        // same pattern, fresh lazy compilation
        Regex::new(self.pattern.clone())
    }
}

impl fmt::Debug for Regex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.pattern)
    }
}

impl Regex {
    pub fn new(pattern: String) -> Self {
        Self {
            pattern,
            compiled: OnceLock::new(),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn compiled(&self) -> Option<&Arc<onig::Regex>> {
        self.compiled
            .get_or_init(|| onig::Regex::new(&self.pattern).ok().map(Arc::new))
            .as_ref()
    }

    /// Validate that this regex pattern compiles successfully
    pub fn validate(&self) -> Result<(), onig::Error> {
        onig::Regex::new(&self.pattern).map(|_| ())
    }

    /// Whether the source contains `\1`..`\9` placeholders that need to be
    /// substituted per match. An escaped backslash (`\\1`) does not count.
    pub fn has_backreferences(&self) -> bool {
        let bytes = self.pattern.as_bytes();
        let mut i = 0;
        while i + 1 < bytes.len() {
            if bytes[i] == b'\\' {
                if bytes[i + 1].is_ascii_digit() && bytes[i + 1] != b'0' {
                    return true;
                }
                // skip whatever this escape is, including \\
                i += 2;
            } else {
                i += 1;
            }
        }
        false
    }
}

impl Serialize for Regex {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.pattern)
    }
}

impl<'de> Deserialize<'de> for Regex {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let pattern = String::deserialize(deserializer)?;
        Ok(Regex::new(pattern))
    }
}

/// Escapes regex metacharacters so captured text can be spliced into a
/// pattern as a literal.
pub fn escape_regex(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(
            c,
            '\\' | '.' | '+' | '*' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|'
                | '-'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Substitutes `\1`..`\9` placeholders in an end/while pattern with the text
/// captured by the begin match. Must run fresh per match since the captured
/// text differs per occurrence. Unmatched groups become the empty string.
pub fn resolve_backreferences(
    pattern: &str,
    line: &str,
    captures: &[Option<(usize, usize)>],
) -> String {
    let bytes = pattern.as_bytes();
    let mut out = String::with_capacity(pattern.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            let next = bytes[i + 1];
            if next.is_ascii_digit() && next != b'0' {
                let group = (next - b'0') as usize;
                if let Some(Some((start, end))) = captures.get(group) {
                    out.push_str(&escape_regex(&line[*start..*end]));
                }
                i += 2;
                continue;
            }
            // carry the escape through untouched (\\, \G, \d, ...)
            out.push('\\');
            out.push(next as char);
            i += 2;
        } else {
            // pattern is valid utf-8; push the full char
            let c = pattern[i..].chars().next().unwrap();
            out.push(c);
            i += c.len_utf8();
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_backreferences() {
        assert!(Regex::new("\\1".to_string()).has_backreferences());
        assert!(Regex::new("foo\\2bar".to_string()).has_backreferences());
        assert!(!Regex::new("foo".to_string()).has_backreferences());
        assert!(!Regex::new("\\\\1".to_string()).has_backreferences());
        assert!(!Regex::new("\\0".to_string()).has_backreferences());
    }

    #[test]
    fn resolves_backreferences_with_escaping() {
        // begin (ab+) matched "abb" at [2, 5]
        let line = "x yabb z";
        let captures = vec![Some((3, 6)), Some((3, 6))];
        assert_eq!(resolve_backreferences("\\1", line, &captures), "abb");

        // captured text with metacharacters gets escaped
        let line = "a.* b";
        let captures = vec![Some((0, 3)), Some((0, 3))];
        assert_eq!(resolve_backreferences("end\\1", line, &captures), "enda\\.\\*");
    }

    #[test]
    fn leaves_other_escapes_untouched() {
        let captures = vec![None];
        assert_eq!(
            resolve_backreferences("\\G\\d+\\s", "irrelevant", &captures),
            "\\G\\d+\\s"
        );
    }

    #[test]
    fn unmatched_group_becomes_empty() {
        let captures = vec![Some((0, 1)), None];
        assert_eq!(resolve_backreferences("x\\1y", "a", &captures), "xy");
    }

    #[test]
    fn forgiving_compile() {
        let broken = Regex::new("(unclosed".to_string());
        assert!(broken.compiled().is_none());
        assert!(broken.validate().is_err());

        let fine = Regex::new("a+".to_string());
        assert!(fine.compiled().is_some());
    }
}
