//! The tokenization engine. The scanning logic replicates
//! <https://github.com/microsoft/vscode-textmate> so grammars written against
//! it behave identically here, including its infinite-loop protections.

use std::collections::HashMap;
use std::ops::Range;
use std::time::{Duration, Instant};

use onig::{Region, SearchOptions};

use serde::{Deserialize, Serialize};

use crate::Registry;
use crate::error::{Error, OcraResult};
use crate::grammars::{
    END_RULE_ID, GlobalRuleRef, GrammarId, InjectionPrecedence, Regex, RegexId, Rule, RuleId,
    resolve_backreferences,
};
use crate::scanner::{PatternSet, ScanMatch};
use crate::scope::Scope;
use crate::themes::ThemeMatcher;

mod anchors;
mod encoding;
mod stack;

pub use anchors::AnchorActive;
pub use encoding::{StandardTokenType, TokenMetadata};
pub use stack::{PersistedFrame, PersistedState, StackFrame, StateStack};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Byte span within the line (start inclusive, end exclusive, 0-based)
    pub span: Range<usize>,
    /// Hierarchical scope names, ordered from outermost to innermost
    /// (e.g., source.js -> string.quoted.double -> punctuation.definition.string).
    pub scopes: Vec<Scope>,
}

/// One tokenized line plus everything needed to continue with the next one.
#[derive(Debug, Clone)]
pub struct TokenizedLine {
    pub tokens: Vec<Token>,
    /// State after this line; feed it to the next `tokenize_line` call.
    pub state: StateStack,
    /// The time limit expired before the line was fully scanned. The tokens
    /// cover the whole line but everything after the cutoff carries only the
    /// scopes that were active at that point.
    pub stopped_early: bool,
}

/// Binary variant of [`TokenizedLine`]: `tokens` holds
/// `(start_offset, metadata)` pairs flattened into one vec.
#[derive(Debug, Clone)]
pub struct BinaryTokenizedLine {
    pub tokens: Vec<u32>,
    pub state: StateStack,
    pub stopped_early: bool,
}

/// Small wrapper so we make we only produce valid tokens.
/// Called in the tokenizer a few times and easier to use a struct than pass
/// mutable vec and usize everywhere
#[derive(Debug, Clone, Default)]
struct TokenAccumulator {
    tokens: Vec<Token>,
    /// Position up to which tokens have been generated
    /// (start of next token to be produced)
    last_end_pos: usize,
}

impl TokenAccumulator {
    fn produce(&mut self, end_pos: usize, scopes: &[Scope]) {
        // Skip empty tokens (can happen with zero-width matches)
        if self.last_end_pos >= end_pos {
            return;
        }

        self.tokens.push(Token {
            span: self.last_end_pos..end_pos,
            scopes: scopes.to_vec(),
        });

        self.last_end_pos = end_pos;
    }

    /// Similar to LineTokens.getResult in vscode-textmate except we don't push
    /// tokens for empty lines
    fn finalize(&mut self, line_len: usize) {
        // Pop the token for the added newline if there is one
        if let Some(tok) = self.tokens.last()
            && tok.span.start == line_len - 1
        {
            self.tokens.pop();
        }

        // If we have a token that includes the trailing newline,
        // decrement the end to not include it
        if let Some(t) = self.tokens.last_mut()
            && t.span.end == line_len
        {
            t.span.end -= 1;
        }
    }
}

#[derive(Debug)]
pub struct Tokenizer<'g> {
    /// The index in the grammars vec below we will use to start the process
    base_grammar_id: GrammarId,
    /// All the grammars in the registry
    registry: &'g Registry,
    /// Broken patterns abort tokenization instead of being skipped
    strict: bool,
    /// Runtime pattern cache by rule ID
    pattern_cache: HashMap<GlobalRuleRef, PatternSet>,
    /// Used only for end/while patterns
    /// Some end patterns will change depending on backrefs so we might have multiple
    /// versions of the same regex in there
    /// Some regex content use backref so they are essentially dynamic patterns
    end_regex_cache: HashMap<String, Regex>,
}

impl<'g> Tokenizer<'g> {
    pub fn new(base_grammar_id: GrammarId, registry: &'g Registry) -> Self {
        Self {
            base_grammar_id,
            registry,
            strict: false,
            pattern_cache: HashMap::new(),
            end_regex_cache: HashMap::new(),
        }
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// The state to pass for the first line of a document.
    pub fn initial_state(&self) -> StateStack {
        StateStack::new(
            self.base_grammar_id,
            self.registry.grammars[self.base_grammar_id.as_index()].scope,
        )
    }

    /// Tokenizes one line. `prev_state` is `None` for the first line of a
    /// document, otherwise the state returned for the previous line. With a
    /// `time_limit`, scanning stops once the limit is exceeded and the rest
    /// of the line is emitted with the currently active scopes.
    pub fn tokenize_line(
        &mut self,
        line: &str,
        prev_state: Option<StateStack>,
        time_limit: Option<Duration>,
    ) -> OcraResult<TokenizedLine> {
        let is_first_line = prev_state.is_none();
        let stack = prev_state.unwrap_or_else(|| self.initial_state());

        // Always add a new line, some regex expect it
        let line = if line.ends_with('\n') {
            line.to_string()
        } else {
            format!("{line}\n")
        };

        let deadline = time_limit.map(|limit| Instant::now() + limit);
        let (mut acc, mut state, stopped_early) = self
            .tokenize_line_internal(stack, &line, 0, is_first_line, true, deadline)
            .map_err(Error::TokenizeRegex)?;
        acc.finalize(line.len());
        state.reset();

        Ok(TokenizedLine {
            tokens: acc.tokens,
            state,
            stopped_early,
        })
    }

    /// Like [`tokenize_line`](Self::tokenize_line) but resolves each token
    /// against a theme and packs it into `(start_offset, metadata)` pairs.
    pub fn tokenize_line_binary(
        &mut self,
        line: &str,
        prev_state: Option<StateStack>,
        time_limit: Option<Duration>,
        matcher: &mut ThemeMatcher,
        language_id: u8,
    ) -> OcraResult<BinaryTokenizedLine> {
        let line_result = self.tokenize_line(line, prev_state, time_limit)?;

        let mut tokens = Vec::with_capacity(line_result.tokens.len() * 2);
        let mut previous_metadata = None;

        for token in &line_result.tokens {
            let style = matcher.resolve(&token.scopes);
            let metadata = TokenMetadata::new(language_id)
                .with_token_type(StandardTokenType::from_scopes(&token.scopes))
                .with_font_style(style.font_style.bits())
                .with_foreground(style.foreground)
                .with_background(style.background);

            // Merge runs that would render identically
            if previous_metadata == Some(metadata) {
                continue;
            }
            tokens.push(token.span.start as u32);
            tokens.push(metadata.raw());
            previous_metadata = Some(metadata);
        }

        Ok(BinaryTokenizedLine {
            tokens,
            state: line_result.state,
            stopped_early: line_result.stopped_early,
        })
    }

    /// Tokenizes a whole text, threading the state across lines.
    pub fn tokenize_text(&mut self, text: &str) -> OcraResult<Vec<Vec<Token>>> {
        if text.is_empty() {
            return Ok(vec![]);
        }

        let mut stack = self.initial_state();
        let mut lines_tokens = Vec::new();
        let mut is_first_line = true;

        for line in text.split('\n') {
            // Always add a new line, some regex expect it
            let line = format!("{line}\n");
            let (mut acc, mut new_state, _) = self
                .tokenize_line_internal(stack, &line, 0, is_first_line, true, None)
                .map_err(Error::TokenizeRegex)?;
            acc.finalize(line.len());
            lines_tokens.push(acc.tokens);
            new_state.reset();
            stack = new_state;
            is_first_line = false;
        }

        Ok(lines_tokens)
    }

    /// Rebuilds a [`StateStack`] persisted by a previous session, validating
    /// every frame against the current registry.
    pub fn restore_state(&self, persisted: &PersistedState) -> OcraResult<StateStack> {
        StateStack::from_persisted(persisted, |rule_ref| {
            self.registry
                .grammars
                .get(rule_ref.grammar.as_index())
                .is_some_and(|g| g.rules.get(rule_ref.rule.as_index()).is_some())
        })
    }

    /// Matches injection patterns at the current position
    /// Returns (precedence, ScanMatch) for the best match
    fn match_injections(
        &mut self,
        stack: &StateStack,
        line: &str,
        pos: usize,
        is_first_line: bool,
        anchor_position: Option<usize>,
    ) -> Result<Option<(InjectionPrecedence, ScanMatch)>, String> {
        let anchors = AnchorActive::new(is_first_line, anchor_position, pos);
        let injection_patterns = self
            .registry
            .collect_injection_patterns(self.base_grammar_id, &stack.top().content_scopes);

        if injection_patterns.is_empty() {
            return Ok(None);
        }

        let mut best_match: Option<(InjectionPrecedence, ScanMatch)> = None;

        // Process injections in the order returned by registry (already sorted by precedence)
        for (precedence, rule) in injection_patterns {
            // Use injection override instead of cloning stack
            let key = self.ensure_pattern_set(stack, Some(rule));
            let found = self
                .pattern_cache
                .get_mut(&key)
                .unwrap()
                .find_at(line, pos, anchors)?;

            if let Some(found) = found {
                if let Some((_, current_best_match)) = &best_match {
                    if found.start >= current_best_match.start {
                        continue;
                    }
                    let is_done = found.start == pos;
                    best_match = Some((precedence, found));
                    if is_done {
                        break;
                    }
                } else {
                    best_match = Some((precedence, found));
                }
            }
        }

        Ok(best_match)
    }

    /// Matches both regular rule patterns and injections, returning the best match
    /// Follows vscode-textmate's comparison logic for rule vs injection precedence
    fn match_rule_or_injections(
        &mut self,
        stack: &StateStack,
        line: &str,
        pos: usize,
        is_first_line: bool,
        anchor_position: Option<usize>,
    ) -> Result<Option<ScanMatch>, String> {
        let anchors = AnchorActive::new(is_first_line, anchor_position, pos);
        // Get regular rule patterns
        let key = self.ensure_pattern_set(stack, None);
        let regular_match = self
            .pattern_cache
            .get_mut(&key)
            .unwrap()
            .find_at(line, pos, anchors)?;

        // Get injection matches
        let injection_match =
            self.match_injections(stack, line, pos, is_first_line, anchor_position)?;

        // Compare and return the winner
        match (regular_match, injection_match) {
            (None, None) => Ok(None),
            (Some(regular), None) => Ok(Some(regular)),
            (None, Some((_, injection))) => Ok(Some(injection)),
            (Some(regular), Some((precedence, injection))) => {
                let match_score = regular.start;
                let injection_score = injection.start;
                if injection_score < match_score
                    || (injection_score == match_score && precedence == InjectionPrecedence::Left)
                {
                    Ok(Some(injection))
                } else {
                    Ok(Some(regular))
                }
            }
        }
    }

    /// Check if there is a while condition active and if it's still true
    fn check_while_conditions(
        &mut self,
        stack: StateStack,
        line: &str,
        pos: &mut usize,
        acc: &mut TokenAccumulator,
        is_first_line: bool,
    ) -> Result<(StateStack, Option<usize>, bool), String> {
        // Initialize anchor position: reset to 0 if previous rule captured EOL, otherwise use stack value
        let mut anchor_position: Option<usize> = if stack.top().begin_rule_has_captured_eol {
            Some(0)
        } else {
            None
        };
        let mut is_first_line = is_first_line;
        let mut stack = stack;

        let mut while_frame_indices = Vec::new();
        for i in 0..stack.frames.len() {
            let frame = &stack.frames[i];
            if let Some(Rule::BeginWhile(_)) = self.registry.grammars
                [frame.rule_ref.grammar.as_index()]
            .rules
            .get(frame.rule_ref.rule.as_index())
            {
                while_frame_indices.push(i);
            }
        }

        if while_frame_indices.is_empty() {
            return Ok((stack, anchor_position, is_first_line));
        }

        let active_anchor = AnchorActive::new(is_first_line, anchor_position, *pos);

        for &frame_idx in while_frame_indices.iter() {
            let frame = &stack.frames[frame_idx];
            let grammar = &self.registry.grammars[frame.rule_ref.grammar.as_index()];
            let while_pat = if let Some(end_pat) = &frame.end_pattern {
                end_pat.as_str()
            } else if let Rule::BeginWhile(b) = &grammar.rules[frame.rule_ref.rule.as_index()] {
                grammar.regexes[b.while_.as_index()].pattern()
            } else {
                unreachable!()
            };

            let rewritten = active_anchor.replace_anchors(while_pat);
            let re = if let Some(re) = self.end_regex_cache.get(rewritten.as_ref()) {
                re
            } else {
                let owned = rewritten.into_owned();
                self.end_regex_cache
                    .entry(owned.clone())
                    .or_insert_with(|| Regex::new(owned))
            };

            let Some(compiled_re) = re.compiled() else {
                if self.strict {
                    return Err(format!("While pattern {while_pat} was invalid"));
                }
                // forgiving mode: a broken while condition no longer holds
                let mut popped_stack = StateStack {
                    frames: stack.frames[0..=frame_idx].to_vec(),
                };
                popped_stack.pop();
                stack = popped_stack;
                break;
            };

            let mut region = Region::new();
            if compiled_re
                .search_with_options(
                    line,
                    *pos,
                    line.len(),
                    SearchOptions::SEARCH_OPTION_NONE,
                    Some(&mut region),
                )
                .is_some()
                && let Some((start, end)) = region.pos(0)
                && start == *pos
            // Must match at current position
            {
                // While condition matches - handle captures and advance position
                let absolute_start = *pos;
                let absolute_end = end;

                acc.produce(absolute_start, &frame.content_scopes);
                // Handle while captures if they exist
                if let Some(Rule::BeginWhile(begin_while_rule)) = self.registry.grammars
                    [frame.rule_ref.grammar.as_index()]
                .rules
                .get(frame.rule_ref.rule.as_index())
                    && !begin_while_rule.while_captures.is_empty()
                {
                    // positions are already absolute, the search ran on the full line
                    let captures_pos: Vec<Option<(usize, usize)>> =
                        (0..region.len()).map(|i| region.pos(i)).collect();

                    // Create temporary StateStack only for resolve_captures
                    let temp_while_stack = StateStack {
                        frames: stack.frames[0..=frame_idx].to_vec(),
                    };
                    self.resolve_captures(
                        &temp_while_stack,
                        line,
                        frame.rule_ref.grammar,
                        &begin_while_rule.while_captures,
                        &captures_pos,
                        acc,
                        is_first_line,
                    )?;
                }

                // Produce token for the while match itself
                acc.produce(absolute_end, &frame.content_scopes);

                // Advance position and update anchor - matches VSCode behavior
                if absolute_end > *pos {
                    *pos = absolute_end;
                    anchor_position = Some(*pos);
                    is_first_line = false;
                }
            } else {
                // Create StateStack and pop the while frame
                let mut popped_stack = StateStack {
                    frames: stack.frames[0..=frame_idx].to_vec(),
                };
                popped_stack.pop();
                stack = popped_stack;
                break; // Stop checking further while conditions
            }
        }

        Ok((stack, anchor_position, is_first_line))
    }

    /// Makes sure the pattern set for the active rule (or an injection
    /// override) is cached, keeping its end-pattern slot current, and returns
    /// its cache key.
    fn ensure_pattern_set(
        &mut self,
        stack: &StateStack,
        injection_rule_override: Option<GlobalRuleRef>,
    ) -> GlobalRuleRef {
        let rule_ref = injection_rule_override.unwrap_or(stack.top().rule_ref);
        let grammar = &self.registry.grammars[rule_ref.grammar.as_index()];
        let rule = &grammar.rules[rule_ref.rule.as_index()];

        // Get end pattern from stack or rule definition when it has backref filled
        let mut end_pattern = stack.top().end_pattern.as_deref();
        // otherwise we get it from the rule directly
        if end_pattern.is_none() {
            match rule {
                Rule::BeginEnd(b) => {
                    end_pattern = Some(grammar.regexes[b.end.as_index()].pattern());
                }
                Rule::BeginWhile(b) => {
                    end_pattern = Some(grammar.regexes[b.while_.as_index()].pattern());
                }
                _ => (),
            }
        }

        let key = rule_ref;
        if let Some(p) = self.pattern_cache.get_mut(&key) {
            if let Rule::BeginEnd(b) = rule
                && let Some(end_pat) = end_pattern
            {
                if b.apply_end_pattern_last {
                    p.update_last(end_pat)
                } else {
                    p.update_front(end_pat)
                };
            }
        } else {
            // Collect base patterns from grammar
            let mut patterns = self.registry.collect_patterns(self.base_grammar_id, rule_ref);

            // Insert end pattern at correct position if this is a BeginEnd rule
            if let Some(pat) = end_pattern
                && let Rule::BeginEnd(b) = rule
            {
                let end_rule_ref = GlobalRuleRef {
                    grammar: rule_ref.grammar,
                    rule: END_RULE_ID,
                };

                if b.apply_end_pattern_last {
                    patterns.push((end_rule_ref, pat.to_owned()));
                } else {
                    patterns.insert(0, (end_rule_ref, pat.to_owned()));
                }
            }

            let p = PatternSet::new(patterns, self.strict);
            self.pattern_cache.insert(key, p);
        }

        key
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_captures(
        &mut self,
        stack: &StateStack,
        line: &str,
        grammar_id: GrammarId,
        rule_captures: &[Option<RuleId>],
        captures: &[Option<(usize, usize)>],
        accumulator: &mut TokenAccumulator,
        is_first_line: bool,
    ) -> Result<(), String> {
        if rule_captures.is_empty() {
            return Ok(());
        }

        // (scopes, end_pos)[]
        let mut local_stack: Vec<(Vec<Scope>, usize)> = Vec::with_capacity(2);

        let min = std::cmp::min(rule_captures.len(), captures.len());

        for i in 0..min {
            let rule_id = if let Some(&Some(r)) = rule_captures.get(i) {
                r
            } else {
                continue;
            };
            let Some(&Some((cap_start, cap_end))) = captures.get(i) else {
                continue;
            };
            // Nothing captured
            if cap_start == cap_end {
                continue;
            }

            // pop captures while needed
            while !local_stack.is_empty()
                && let Some((scopes, end_pos)) = local_stack.last()
                && *end_pos <= cap_start
            {
                accumulator.produce(*end_pos, scopes);
                local_stack.pop();
            }

            if let Some((scopes, _)) = local_stack.last() {
                accumulator.produce(cap_start, scopes);
            } else {
                accumulator.produce(cap_start, &stack.top().content_scopes);
            }

            // Check if it has patterns. If it does we need to retokenize the
            // captured text with the capture rule active.
            let rule = &self.registry.grammars[grammar_id.as_index()].rules[rule_id.as_index()];

            if rule.has_patterns() {
                let rule_ref = GlobalRuleRef {
                    grammar: grammar_id,
                    rule: rule_id,
                };
                let mut retokenization_stack = stack.clone();
                retokenization_stack.push(rule_ref, None, false, Some(cap_start));

                // Apply rule name scopes to the new state
                retokenization_stack
                    .top_mut()
                    .name_scopes
                    .extend(rule.get_name_scope(line, captures));

                // Start with name + content scopes for content scopes
                retokenization_stack.top_mut().content_scopes =
                    retokenization_stack.top().name_scopes.clone();

                // Apply content scopes
                retokenization_stack
                    .top_mut()
                    .content_scopes
                    .extend(rule.get_content_scope(line, captures));

                let substring = &line[0..cap_end];
                let (retokenized_acc, _, _) = self.tokenize_line_internal(
                    retokenization_stack,
                    substring,
                    cap_start,
                    is_first_line && cap_start == 0,
                    false,
                    None,
                )?;

                for token in retokenized_acc.tokens {
                    // Only include tokens that are within the capture bounds (they should all be valid now)
                    accumulator.produce(token.span.end, &token.scopes);
                }
                continue;
            }

            // For rules without patterns, we still need to apply their scopes
            let rule_scope = rule.get_name_scope(line, captures);

            if let Some(rule_scope) = rule_scope {
                let mut base = if let Some((scopes, _)) = local_stack.last() {
                    scopes.clone()
                } else {
                    stack.top().content_scopes.clone()
                };
                base.push(rule_scope);
                local_stack.push((base, cap_end));
            }
        }

        while let Some((scopes, end_pos)) = local_stack.pop() {
            accumulator.produce(end_pos, &scopes);
        }

        Ok(())
    }

    fn tokenize_line_internal(
        &mut self,
        stack: StateStack,
        line: &str,
        line_pos: usize,
        is_first_line: bool,
        check_while_conditions: bool,
        deadline: Option<Instant>,
    ) -> Result<(TokenAccumulator, StateStack, bool), String> {
        let mut accumulator = TokenAccumulator::default();
        let mut pos = line_pos;
        let mut anchor_position = None;
        let mut is_first_line = is_first_line;
        let mut stack = stack;
        let mut stopped_early = false;

        // 1. We check if the while pattern is still truthy
        if check_while_conditions {
            let while_res = self.check_while_conditions(
                stack,
                line,
                &mut pos,
                &mut accumulator,
                is_first_line,
            )?;
            stack = while_res.0;
            anchor_position = while_res.1;
            is_first_line = while_res.2;
        }

        // 2. We check for any matching patterns
        loop {
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                // Out of time: close the line with the scopes active right now
                accumulator.produce(line.len(), &stack.top().content_scopes);
                stopped_early = true;
                break;
            }

            if let Some(m) =
                self.match_rule_or_injections(&stack, line, pos, is_first_line, anchor_position)?
            {
                log::trace!(
                    "matched rule {:?} at {}..{} (pos={pos})",
                    m.rule_ref,
                    m.start,
                    m.end
                );
                // Track whether this match has advanced the position
                let has_advanced = m.end > pos;

                // We matched the `end` for this rule, can only happen for BeginEnd rules
                if m.rule_ref.rule == END_RULE_ID
                    && let Rule::BeginEnd(b) = &self.registry.grammars
                        [stack.top().rule_ref.grammar.as_index()]
                    .rules[stack.top().rule_ref.rule.as_index()]
                {
                    let end_grammar_id = stack.top().rule_ref.grammar;
                    accumulator.produce(m.start, &stack.top().content_scopes);
                    let popped_enter_position = stack.top().enter_position; // Save for infinite loop protection
                    let popped_anchor_position = stack.top().anchor_position;
                    stack.set_content_scopes(stack.top().name_scopes.clone());
                    self.resolve_captures(
                        &stack,
                        line,
                        end_grammar_id,
                        &b.end_captures,
                        &m.capture_pos,
                        &mut accumulator,
                        is_first_line,
                    )?;
                    accumulator.produce(m.end, &stack.top().content_scopes);

                    // Pop to parent state and update anchor position
                    let popped_frame = stack.pop().unwrap();
                    anchor_position = popped_anchor_position;

                    // Grammar pushed & popped a rule without advancing - infinite loop protection
                    if !has_advanced && popped_enter_position == Some(pos) {
                        // See https://github.com/Microsoft/vscode-textmate/issues/12
                        // Like vscode-textmate, restore the popped frame to keep the rule active
                        stack.frames.push(popped_frame);
                        accumulator.produce(line.len(), &stack.top().content_scopes);
                        break;
                    }
                } else {
                    let rule = &self.registry.grammars[m.rule_ref.grammar.as_index()].rules
                        [m.rule_ref.rule.as_index()];
                    accumulator.produce(m.start, &stack.top().content_scopes);
                    let mut new_scopes = stack.top().content_scopes.clone();
                    new_scopes.extend(rule.get_name_scope(line, &m.capture_pos));
                    // Use push_with_scopes to avoid double-cloning
                    stack.push_with_scopes(
                        m.rule_ref,
                        anchor_position,
                        m.end == line.len(),
                        Some(pos),
                        new_scopes,
                    );
                    stack.top_mut().end_pattern = None;

                    let mut handle_begin_rule = |re_id: RegexId,
                                                 end_has_backrefs: bool,
                                                 begin_captures: &[Option<RuleId>]|
                     -> Result<(), String> {
                        let re = &self.registry.grammars[m.rule_ref.grammar.as_index()].regexes
                            [re_id.as_index()];

                        self.resolve_captures(
                            &stack,
                            line,
                            m.rule_ref.grammar,
                            begin_captures,
                            &m.capture_pos,
                            &mut accumulator,
                            is_first_line,
                        )?;
                        accumulator.produce(m.end, &stack.top().content_scopes);
                        anchor_position = Some(m.end);
                        let mut content_scopes = stack.top().name_scopes.clone();
                        content_scopes.extend(rule.get_content_scope(line, &m.capture_pos));
                        stack.set_content_scopes(content_scopes);

                        if end_has_backrefs {
                            let resolved_end =
                                resolve_backreferences(re.pattern(), line, &m.capture_pos);
                            stack.set_end_pattern(resolved_end);
                        }

                        Ok(())
                    };

                    match rule {
                        Rule::BeginEnd(r) => {
                            handle_begin_rule(r.end, r.end_has_backrefs, &r.begin_captures)?;

                            // Grammar pushed a rule already entered at this
                            // position without advancing - infinite loop
                            // protection. Checking the whole chain of frames
                            // entered here also catches rules that push each
                            // other in a cycle.
                            if !has_advanced && stack.has_rule_entered_at(m.rule_ref, pos) {
                                stack.pop();
                                accumulator.produce(line.len(), &stack.top().content_scopes);
                                break;
                            }
                        }
                        Rule::BeginWhile(r) => {
                            handle_begin_rule(r.while_, r.while_has_backrefs, &r.begin_captures)?;

                            if !has_advanced && stack.has_rule_entered_at(m.rule_ref, pos) {
                                stack.pop();
                                accumulator.produce(line.len(), &stack.top().content_scopes);
                                break;
                            }
                        }
                        Rule::Match(r) => {
                            self.resolve_captures(
                                &stack,
                                line,
                                m.rule_ref.grammar,
                                &r.captures,
                                &m.capture_pos,
                                &mut accumulator,
                                is_first_line,
                            )?;
                            accumulator.produce(m.end, &stack.top().content_scopes);
                            // pop rule immediately since it is a MatchRule
                            stack.pop();

                            // Protection: grammar is not advancing, nor is it pushing/popping
                            if !has_advanced {
                                stack.safe_pop();
                                accumulator.produce(line.len(), &stack.top().content_scopes);
                                break;
                            }
                        }
                        _ => unreachable!("matched something without a regex??"),
                    }
                }

                if has_advanced {
                    // advance
                    pos = m.end;
                    is_first_line = false;
                }
            } else {
                // No more matches - emit final token and stop
                accumulator.produce(line.len(), &stack.top().content_scopes);
                break;
            }
        }

        Ok((accumulator, stack, stopped_early))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};

    use super::*;
    use crate::Registry;

    fn registry_with(grammars: &[Value]) -> Registry {
        let mut registry = Registry::new();
        for grammar in grammars {
            registry.add_grammar_from_str(&grammar.to_string()).unwrap();
        }
        registry.link_grammars().unwrap();
        registry
    }

    fn scopes_of(token: &Token) -> Vec<String> {
        token.scopes.iter().map(|s| s.build_string()).collect()
    }

    #[test]
    fn match_rules_and_gaps() {
        let registry = registry_with(&[json!({
            "name": "test",
            "scopeName": "source.test",
            "patterns": [{ "match": "foo", "name": "keyword.test" }],
        })]);
        let mut tokenizer = registry.tokenizer("source.test").unwrap();

        let result = tokenizer.tokenize_line("foo bar foo", None, None).unwrap();
        assert!(!result.stopped_early);

        let tokens = &result.tokens;
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0].span, 0..3);
        assert_eq!(scopes_of(&tokens[0]), vec!["source.test", "keyword.test"]);
        assert_eq!(tokens[1].span, 3..8);
        assert_eq!(scopes_of(&tokens[1]), vec!["source.test"]);
        assert_eq!(tokens[2].span, 8..11);
        assert_eq!(scopes_of(&tokens[2]), vec!["source.test", "keyword.test"]);
    }

    #[test]
    fn begin_end_spans_lines_via_state() {
        let registry = registry_with(&[json!({
            "name": "test",
            "scopeName": "source.test",
            "patterns": [{ "begin": "/\\*", "end": "\\*/", "name": "comment.block" }],
        })]);
        let mut tokenizer = registry.tokenizer("source.test").unwrap();

        let first = tokenizer.tokenize_line("a /* b", None, None).unwrap();
        assert_eq!(first.state.frames.len(), 2);
        assert_eq!(scopes_of(&first.tokens[0]), vec!["source.test"]);
        assert_eq!(
            scopes_of(&first.tokens[1]),
            vec!["source.test", "comment.block"]
        );

        let second = tokenizer
            .tokenize_line("c */ d", Some(first.state), None)
            .unwrap();
        assert_eq!(second.state.frames.len(), 1);
        // "c " and "*/" are still comment, " d" is back to plain source
        assert_eq!(
            scopes_of(&second.tokens[0]),
            vec!["source.test", "comment.block"]
        );
        assert_eq!(second.tokens[0].span, 0..2);
        assert_eq!(
            scopes_of(&second.tokens[1]),
            vec!["source.test", "comment.block"]
        );
        assert_eq!(second.tokens[1].span, 2..4);
        assert_eq!(scopes_of(&second.tokens[2]), vec!["source.test"]);
    }

    #[test]
    fn end_pattern_backreferences_pair_with_begin() {
        let registry = registry_with(&[json!({
            "name": "test",
            "scopeName": "source.test",
            "patterns": [{ "begin": "(a+)", "end": "\\1", "name": "pair.test" }],
        })]);
        let mut tokenizer = registry.tokenizer("source.test").unwrap();

        // the region opened by "aa" only closes on "aa", not on a single "a"
        let result = tokenizer.tokenize_line("aa x a x aa y", None, None).unwrap();
        assert_eq!(result.state.frames.len(), 1);

        let pair_end = result
            .tokens
            .iter()
            .filter(|t| scopes_of(t).contains(&"pair.test".to_string()))
            .map(|t| t.span.end)
            .max()
            .unwrap();
        assert_eq!(pair_end, 11);
        // text after the closing "aa" is plain again
        let last = result.tokens.last().unwrap();
        assert_eq!(scopes_of(last), vec!["source.test"]);
    }

    #[test]
    fn captures_get_their_own_scopes() {
        let registry = registry_with(&[json!({
            "name": "test",
            "scopeName": "source.test",
            "patterns": [{
                "match": "(\\w+)=(\\w+)",
                "captures": {
                    "1": { "name": "variable.name" },
                    "2": { "name": "variable.value" },
                },
            }],
        })]);
        let mut tokenizer = registry.tokenizer("source.test").unwrap();

        let result = tokenizer.tokenize_line("a=b", None, None).unwrap();
        let tokens = &result.tokens;
        assert_eq!(tokens.len(), 3);
        assert_eq!(scopes_of(&tokens[0]), vec!["source.test", "variable.name"]);
        assert_eq!(tokens[0].span, 0..1);
        assert_eq!(scopes_of(&tokens[1]), vec!["source.test"]);
        assert_eq!(tokens[1].span, 1..2);
        assert_eq!(scopes_of(&tokens[2]), vec!["source.test", "variable.value"]);
        assert_eq!(tokens[2].span, 2..3);
    }

    #[test]
    fn capture_with_patterns_is_retokenized() {
        let registry = registry_with(&[json!({
            "name": "test",
            "scopeName": "source.test",
            "patterns": [{
                "match": "#(.*)$",
                "name": "comment.line",
                "captures": {
                    "1": { "patterns": [{ "match": "\\d+", "name": "constant.numeric" }] },
                },
            }],
        })]);
        let mut tokenizer = registry.tokenizer("source.test").unwrap();

        let result = tokenizer.tokenize_line("#x 42", None, None).unwrap();
        let numeric = result
            .tokens
            .iter()
            .find(|t| scopes_of(t).contains(&"constant.numeric".to_string()))
            .expect("nested pattern should fire inside the capture");
        assert_eq!(numeric.span, 3..5);
    }

    #[test]
    fn while_rule_holds_and_releases() {
        let registry = registry_with(&[json!({
            "name": "test",
            "scopeName": "source.test",
            "patterns": [{
                "begin": "^> ",
                "while": "^> ",
                "name": "markup.quote",
            }],
        })]);
        let mut tokenizer = registry.tokenizer("source.test").unwrap();

        let lines = tokenizer.tokenize_text("> a\n> b\nc").unwrap();
        assert_eq!(lines.len(), 3);
        assert!(
            lines[1]
                .iter()
                .all(|t| scopes_of(t).contains(&"markup.quote".to_string()))
        );
        assert!(
            lines[2]
                .iter()
                .all(|t| !scopes_of(t).contains(&"markup.quote".to_string()))
        );
    }

    #[test]
    fn left_injection_wins_ties() {
        let registry = registry_with(&[json!({
            "name": "test",
            "scopeName": "source.test",
            "patterns": [{ "match": "TODO", "name": "string.other" }],
            "injections": {
                "L:source.test": {
                    "patterns": [{ "match": "TODO", "name": "marker.todo" }],
                },
            },
        })]);
        let mut tokenizer = registry.tokenizer("source.test").unwrap();

        let result = tokenizer.tokenize_line("x TODO y", None, None).unwrap();
        let todo = result.tokens.iter().find(|t| t.span == (2..6)).unwrap();
        assert_eq!(scopes_of(todo), vec!["source.test", "marker.todo"]);
    }

    #[test]
    fn default_injection_loses_ties() {
        let registry = registry_with(&[json!({
            "name": "test",
            "scopeName": "source.test",
            "patterns": [{ "match": "TODO", "name": "string.other" }],
            "injections": {
                "source.test": {
                    "patterns": [{ "match": "TODO", "name": "marker.todo" }],
                },
            },
        })]);
        let mut tokenizer = registry.tokenizer("source.test").unwrap();

        let result = tokenizer.tokenize_line("x TODO y", None, None).unwrap();
        let todo = result.tokens.iter().find(|t| t.span == (2..6)).unwrap();
        assert_eq!(scopes_of(todo), vec!["source.test", "string.other"]);
    }

    #[test]
    fn zero_width_match_terminates() {
        let registry = registry_with(&[json!({
            "name": "test",
            "scopeName": "source.test",
            "patterns": [{ "match": "x*", "name": "bad.rule" }],
        })]);
        let mut tokenizer = registry.tokenizer("source.test").unwrap();

        // "x*" matches empty at position 0 and would never advance
        let result = tokenizer.tokenize_line("abc", None, None).unwrap();
        assert_eq!(result.tokens.len(), 1);
        assert_eq!(result.tokens[0].span, 0..3);
        assert_eq!(scopes_of(&result.tokens[0]), vec!["source.test"]);
    }

    #[test]
    fn mutually_recursive_zero_width_begins_terminate() {
        // #a and #b push each other with lookahead begins that consume
        // nothing, so no single frame ever has its direct parent as the same
        // rule. The push guard has to look through the whole run of frames
        // entered at the current position.
        let registry = registry_with(&[json!({
            "name": "test",
            "scopeName": "source.test",
            "patterns": [{ "include": "#a" }],
            "repository": {
                "a": {
                    "begin": "(?=x)",
                    "end": "y",
                    "name": "meta.a",
                    "patterns": [{ "include": "#b" }],
                },
                "b": {
                    "begin": "(?=x)",
                    "end": "y",
                    "name": "meta.b",
                    "patterns": [{ "include": "#a" }],
                },
            },
        })]);
        let mut tokenizer = registry.tokenizer("source.test").unwrap();

        // No time budget: only the loop guard keeps this from spinning
        let result = tokenizer.tokenize_line("x", None, None).unwrap();
        assert!(!result.stopped_early);
        assert_eq!(result.tokens.last().unwrap().span.end, 1);
        // the stack stayed bounded instead of piling up a/b frames
        assert!(result.state.frames.len() <= 3);
    }

    #[test]
    fn expired_time_budget_stops_early() {
        let registry = registry_with(&[json!({
            "name": "test",
            "scopeName": "source.test",
            "patterns": [{ "match": "foo", "name": "keyword.test" }],
        })]);
        let mut tokenizer = registry.tokenizer("source.test").unwrap();

        let result = tokenizer
            .tokenize_line("foo bar foo", None, Some(Duration::ZERO))
            .unwrap();
        assert!(result.stopped_early);
        // the whole line is still covered
        assert_eq!(result.tokens.last().unwrap().span.end, 11);
    }

    #[test]
    fn state_round_trips_through_persistence() {
        let registry = registry_with(&[json!({
            "name": "test",
            "scopeName": "source.test",
            "patterns": [{ "begin": "/\\*", "end": "\\*/", "name": "comment.block" }],
        })]);
        let mut tokenizer = registry.tokenizer("source.test").unwrap();

        let first = tokenizer.tokenize_line("a /* b", None, None).unwrap();
        let persisted = first.state.to_persisted();
        let json = serde_json::to_string(&persisted).unwrap();

        let parsed: PersistedState = serde_json::from_str(&json).unwrap();
        let restored = tokenizer.restore_state(&parsed).unwrap();
        assert!(restored.same_context(&first.state));

        // tokenization continues exactly as with the in-memory state
        let second = tokenizer
            .tokenize_line("c */ d", Some(restored), None)
            .unwrap();
        assert_eq!(
            scopes_of(&second.tokens[0]),
            vec!["source.test", "comment.block"]
        );
    }

    #[test]
    fn repository_and_self_includes() {
        let registry = registry_with(&[json!({
            "name": "test",
            "scopeName": "source.test",
            "patterns": [
                { "include": "#paren" },
                { "match": "\\w+", "name": "word.test" },
            ],
            "repository": {
                "paren": {
                    "begin": "\\(",
                    "end": "\\)",
                    "name": "meta.paren",
                    "patterns": [{ "include": "$self" }],
                },
            },
        })]);
        let mut tokenizer = registry.tokenizer("source.test").unwrap();

        let result = tokenizer.tokenize_line("(a (b))", None, None).unwrap();
        let inner_word = result
            .tokens
            .iter()
            .find(|t| t.span == (4..5))
            .expect("inner word token");
        // nested paren frames stack their scopes
        assert_eq!(
            scopes_of(inner_word),
            vec!["source.test", "meta.paren", "meta.paren", "word.test"]
        );
        assert_eq!(result.state.frames.len(), 1);
    }

    #[test]
    fn cross_grammar_include() {
        let registry = registry_with(&[
            json!({
                "name": "host",
                "scopeName": "text.host",
                "patterns": [{
                    "begin": "<x>",
                    "end": "</x>",
                    "name": "meta.embedded",
                    "patterns": [{ "include": "source.guest" }],
                }],
            }),
            json!({
                "name": "guest",
                "scopeName": "source.guest",
                "patterns": [{ "match": "num", "name": "constant.guest" }],
            }),
        ]);
        let mut tokenizer = registry.tokenizer("text.host").unwrap();

        let result = tokenizer.tokenize_line("<x>num</x>", None, None).unwrap();
        let guest_token = result.tokens.iter().find(|t| t.span == (3..6)).unwrap();
        assert_eq!(
            scopes_of(guest_token),
            vec!["text.host", "meta.embedded", "constant.guest"]
        );
    }

    #[test]
    fn content_name_applies_between_delimiters() {
        let registry = registry_with(&[json!({
            "name": "test",
            "scopeName": "source.test",
            "patterns": [{
                "begin": "\"",
                "end": "\"",
                "name": "string.quoted",
                "contentName": "meta.inside",
            }],
        })]);
        let mut tokenizer = registry.tokenizer("source.test").unwrap();

        let result = tokenizer.tokenize_line("\"ab\"", None, None).unwrap();
        let inside = result.tokens.iter().find(|t| t.span == (1..3)).unwrap();
        assert_eq!(
            scopes_of(inside),
            vec!["source.test", "string.quoted", "meta.inside"]
        );
        // delimiters carry only the name scope
        let open = result.tokens.iter().find(|t| t.span == (0..1)).unwrap();
        assert_eq!(scopes_of(open), vec!["source.test", "string.quoted"]);
    }
}
