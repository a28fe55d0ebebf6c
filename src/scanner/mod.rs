//! Batch regex scanning over a list of candidate rules.
//!
//! A [`PatternSet`] owns the pattern sources for every rule that can match at
//! a stack position and answers "which rule matches first from here". The
//! primary backend compiles all sources into a single onig `RegSet`; when
//! that fails (one broken pattern poisons the whole set) the forgiving
//! fallback compiles each pattern on its own, skips the broken ones and
//! scans them serially with the same leftmost-first semantics.

use std::fmt::{Debug, Formatter};

use onig::{RegSet, Regex, RegexOptions, Region, SearchOptions, Syntax};

use crate::grammars::GlobalRuleRef;
use crate::tokenizer::AnchorActive;

/// Result of scanning a pattern set: the winning rule, its span and the
/// absolute byte positions of every capture group.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ScanMatch {
    pub rule_ref: GlobalRuleRef,
    pub start: usize,
    pub end: usize,
    pub capture_pos: Vec<Option<(usize, usize)>>,
}

enum Backend {
    Batch(RegSet),
    /// One slot per source; `None` marks a pattern that failed to compile
    /// and therefore never matches.
    Serial(Vec<Option<Regex>>),
}

pub struct PatternSet {
    rule_refs: Vec<GlobalRuleRef>,
    sources: Vec<String>,
    strict: bool,
    /// Compiled backends keyed by [`AnchorActive::cache_slot`]. Cleared
    /// whenever a source slot is rewritten.
    compiled: [Option<Backend>; 4],
}

impl PatternSet {
    pub fn new(items: Vec<(GlobalRuleRef, String)>, strict: bool) -> Self {
        let (rule_refs, sources) = items.into_iter().unzip();
        Self {
            rule_refs,
            sources,
            strict,
            compiled: [None, None, None, None],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rule_refs.is_empty()
    }

    /// Rewrites the first source slot (the end/while pattern of the active
    /// rule, freshly resolved against its begin captures).
    pub fn update_front(&mut self, pattern: &str) {
        if self.sources.first().is_some_and(|s| s != pattern) {
            self.sources[0] = pattern.to_string();
            self.compiled = [None, None, None, None];
        }
    }

    /// Rewrites the last source slot, used when the active rule applies its
    /// end pattern after its children.
    pub fn update_last(&mut self, pattern: &str) {
        let last = self.sources.len().wrapping_sub(1);
        if self.sources.last().is_some_and(|s| s != pattern) {
            self.sources[last] = pattern.to_string();
            self.compiled = [None, None, None, None];
        }
    }

    /// Finds the leftmost match at or after `pos`. Ties at the same start
    /// offset go to the earliest listed pattern.
    pub fn find_at(
        &mut self,
        text: &str,
        pos: usize,
        anchors: AnchorActive,
    ) -> Result<Option<ScanMatch>, String> {
        if self.rule_refs.is_empty() {
            return Ok(None);
        }

        let slot = anchors.cache_slot();
        if self.compiled[slot].is_none() {
            self.compiled[slot] = Some(self.compile(anchors)?);
        }

        match self.compiled[slot].as_ref().unwrap() {
            Backend::Batch(regset) => Self::find_batch(&self.rule_refs, regset, text, pos),
            Backend::Serial(regexes) => Ok(Self::find_serial(&self.rule_refs, regexes, text, pos)),
        }
    }

    fn compile(&self, anchors: AnchorActive) -> Result<Backend, String> {
        let rewritten: Vec<_> = self
            .sources
            .iter()
            .map(|s| anchors.replace_anchors(s))
            .collect();
        let pattern_strs: Vec<&str> = rewritten.iter().map(|s| s.as_ref()).collect();

        match RegSet::with_options(&pattern_strs, RegexOptions::REGEX_OPTION_CAPTURE_GROUP) {
            Ok(regset) => Ok(Backend::Batch(regset)),
            Err(e) if self.strict => Err(format!(
                "Failed to compile pattern set with {} patterns: {e:?}",
                pattern_strs.len()
            )),
            Err(_) => {
                // one of the sources is broken; compile individually and
                // drop the offenders
                let regexes = pattern_strs
                    .iter()
                    .map(|p| {
                        Regex::with_options(
                            p,
                            RegexOptions::REGEX_OPTION_CAPTURE_GROUP,
                            Syntax::default(),
                        )
                        .ok()
                    })
                    .collect();
                Ok(Backend::Serial(regexes))
            }
        }
    }

    fn find_batch(
        rule_refs: &[GlobalRuleRef],
        regset: &RegSet,
        text: &str,
        pos: usize,
    ) -> Result<Option<ScanMatch>, String> {
        // We need to specify pos/text.len() because some regex might do lookbehind
        if let Some((pattern_index, captures)) = regset.captures_with_options(
            text,       // Full text (not sliced)
            pos,        // Start searching from this position
            text.len(), // Search to end of text
            onig::RegSetLead::Position,
            SearchOptions::SEARCH_OPTION_NONE,
        ) && let Some((match_start, match_end)) = captures.pos(0)
        {
            let capture_pos: Vec<Option<(usize, usize)>> =
                (0..captures.len()).map(|i| captures.pos(i)).collect();

            return Ok(Some(ScanMatch {
                rule_ref: rule_refs[pattern_index],
                start: match_start,
                end: match_end,
                capture_pos,
            }));
        }

        Ok(None)
    }

    fn find_serial(
        rule_refs: &[GlobalRuleRef],
        regexes: &[Option<Regex>],
        text: &str,
        pos: usize,
    ) -> Option<ScanMatch> {
        let mut best: Option<ScanMatch> = None;

        for (index, regex) in regexes.iter().enumerate() {
            let Some(regex) = regex else { continue };

            let mut region = Region::new();
            let found = regex.search_with_options(
                text,
                pos,
                text.len(),
                SearchOptions::SEARCH_OPTION_NONE,
                Some(&mut region),
            );

            if let Some(start) = found
                && best.as_ref().is_none_or(|b| start < b.start)
            {
                let end = region.pos(0).map(|(_, e)| e).unwrap_or(start);
                best = Some(ScanMatch {
                    rule_ref: rule_refs[index],
                    start,
                    end,
                    capture_pos: (0..region.len()).map(|i| region.pos(i)).collect(),
                });

                // nothing earlier is possible
                if start == pos {
                    break;
                }
            }
        }

        best
    }
}

impl Debug for PatternSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PatternSet({} rules)", self.rule_refs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammars::{GrammarId, RuleId};

    fn rule(n: u16) -> GlobalRuleRef {
        GlobalRuleRef {
            grammar: GrammarId(0),
            rule: RuleId(n),
        }
    }

    fn set(patterns: &[&str], strict: bool) -> PatternSet {
        PatternSet::new(
            patterns
                .iter()
                .enumerate()
                .map(|(i, p)| (rule(i as u16), p.to_string()))
                .collect(),
            strict,
        )
    }

    #[test]
    fn leftmost_match_wins() {
        let mut set = set(&["bar", "foo"], true);
        let m = set
            .find_at("a foo bar", 0, AnchorActive::None)
            .unwrap()
            .unwrap();
        assert_eq!(m.rule_ref, rule(1));
        assert_eq!((m.start, m.end), (2, 5));
    }

    #[test]
    fn ties_go_to_earliest_pattern() {
        let mut set = set(&["fo+", "foo"], true);
        let m = set
            .find_at("foo", 0, AnchorActive::None)
            .unwrap()
            .unwrap();
        assert_eq!(m.rule_ref, rule(0));
    }

    #[test]
    fn capture_positions_are_absolute() {
        let mut set = set(&["(b)(c)"], true);
        let m = set
            .find_at("abc", 0, AnchorActive::None)
            .unwrap()
            .unwrap();
        assert_eq!(m.capture_pos, vec![Some((1, 3)), Some((1, 2)), Some((2, 3))]);
    }

    #[test]
    fn broken_pattern_fails_in_strict_mode() {
        let mut set = set(&["(unclosed", "ok"], true);
        assert!(set.find_at("ok", 0, AnchorActive::None).is_err());
    }

    #[test]
    fn broken_pattern_is_skipped_in_forgiving_mode() {
        let mut set = set(&["(unclosed", "ok"], false);
        let m = set
            .find_at("ok", 0, AnchorActive::None)
            .unwrap()
            .unwrap();
        assert_eq!(m.rule_ref, rule(1));
    }

    #[test]
    fn inactive_g_anchor_never_matches() {
        let mut set = set(&["\\Gfoo"], true);
        assert!(
            set.find_at("foo", 0, AnchorActive::None)
                .unwrap()
                .is_none()
        );
        assert!(set.find_at("foo", 0, AnchorActive::G).unwrap().is_some());
    }

    #[test]
    fn updated_end_slot_invalidates_cache() {
        let mut set = set(&["one", "two"], true);
        assert!(set.find_at("one", 0, AnchorActive::None).unwrap().is_some());

        set.update_front("uno");
        assert!(set.find_at("one", 0, AnchorActive::None).unwrap().is_none());
        let m = set
            .find_at("uno two", 0, AnchorActive::None)
            .unwrap()
            .unwrap();
        assert_eq!(m.rule_ref, rule(0));
    }

    #[test]
    fn empty_set_matches_nothing() {
        let mut set = PatternSet::new(Vec::new(), true);
        assert!(set.find_at("foo", 0, AnchorActive::None).unwrap().is_none());
    }
}
