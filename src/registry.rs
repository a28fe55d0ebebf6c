use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::{Error, OcraResult};
use crate::grammars::{
    BASE_GLOBAL_RULE_REF, CompiledGrammar, GlobalRuleRef, GrammarId, InjectionPrecedence, Match,
    NO_OP_GLOBAL_RULE_REF, PatternRef, ROOT_RULE_ID, RawGrammar, Rule,
};
use crate::scope::Scope;
use crate::themes::{CompiledTheme, RawTheme};
use crate::tokenizer::Tokenizer;

/// The default grammar name, where nothing is tokenized beyond the base scope.
pub const PLAIN_GRAMMAR_NAME: &str = "plain";

/// Holds all the grammars and themes and hands out tokenizers.
///
/// Grammars are added first, then `link_grammars` resolves cross-grammar
/// includes; only a linked registry can tokenize.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    // Vector of compiled grammars for ID-based access
    pub(crate) grammars: Vec<CompiledGrammar>,
    // grammar scope name -> grammar ID, used by includes and injections
    grammar_id_by_scope_name: HashMap<String, GrammarId>,
    // grammar name -> grammar ID, the name end users refer to
    grammar_id_by_name: HashMap<String, GrammarId>,
    // name given by the theme file -> theme
    themes: HashMap<String, CompiledTheme>,
    // which external grammars inject into each grammar (via injectTo)
    // Most of the inner sets will be empty since few grammars use injectTo
    injections_by_grammar: Vec<HashSet<GrammarId>>,
    // Once a registry has linked grammars, it's not possible to replace existing grammars.
    linked: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an already deserialized grammar.
    pub fn add_raw_grammar(&mut self, raw_grammar: RawGrammar) -> OcraResult<GrammarId> {
        if self.linked && self.grammar_id_by_name.contains_key(&raw_grammar.name) {
            return Err(Error::ReplacingGrammarPostLinking(
                raw_grammar.name.to_owned(),
            ));
        }
        let grammar_id = GrammarId(self.grammars.len() as u16);
        let grammar = CompiledGrammar::from_raw_grammar(raw_grammar, grammar_id);
        log::debug!(
            "compiled grammar '{}' ({} rules, {} regexes)",
            grammar.scope_name,
            grammar.rules.len(),
            grammar.regexes.len()
        );
        let grammar_name = grammar.name.clone();
        let grammar_scope_name = grammar.scope_name.clone();
        self.grammars.push(grammar);
        self.grammar_id_by_scope_name
            .insert(grammar_scope_name, grammar_id);
        self.grammar_id_by_name.insert(grammar_name, grammar_id);
        self.injections_by_grammar.push(HashSet::new());
        Ok(grammar_id)
    }

    /// Parses grammar JSON and adds it.
    pub fn add_grammar_from_str(&mut self, json: &str) -> OcraResult<GrammarId> {
        let raw_grammar: RawGrammar = serde_json::from_str(json)?;
        self.add_raw_grammar(raw_grammar)
    }

    /// Reads the file and adds it as a grammar.
    pub fn add_grammar_from_file(&mut self, path: impl AsRef<Path>) -> OcraResult<GrammarId> {
        let raw_grammar = RawGrammar::load_from_file(path)?;
        self.add_raw_grammar(raw_grammar)
    }

    /// Adds an empty grammar that will not match any token. Useful as a
    /// fallback when the requested grammar is not found.
    ///
    /// It gets the `plain` grammar name.
    pub fn add_plain_grammar(&mut self, aliases: &[&str]) -> OcraResult<GrammarId> {
        let raw = RawGrammar {
            name: PLAIN_GRAMMAR_NAME.to_owned(),
            scope_name: PLAIN_GRAMMAR_NAME.to_owned(),
            ..Default::default()
        };
        let id = self.add_raw_grammar(raw)?;
        for alias in aliases {
            self.add_alias(PLAIN_GRAMMAR_NAME, alias);
        }
        Ok(id)
    }

    /// Adds an alias for the given grammar
    pub fn add_alias(&mut self, grammar_name: &str, alias: &str) {
        if let Some(grammar_id) = self.grammar_id_by_name.get(grammar_name) {
            self.grammar_id_by_name
                .insert(alias.to_string(), *grammar_id);
        }
    }

    /// Parses theme JSON, compiles it and adds it.
    pub fn add_theme_from_str(&mut self, json: &str) -> OcraResult<()> {
        let raw_theme: RawTheme = serde_json::from_str(json)?;
        let compiled_theme = raw_theme.compile()?;
        self.themes
            .insert(compiled_theme.name.to_string(), compiled_theme);
        Ok(())
    }

    /// Reads the file and adds it as a theme.
    pub fn add_theme_from_file(&mut self, path: impl AsRef<Path>) -> OcraResult<()> {
        let raw_theme = RawTheme::load_from_file(path)?;
        let compiled_theme = raw_theme.compile()?;
        self.themes
            .insert(compiled_theme.name.to_string(), compiled_theme);
        Ok(())
    }

    /// Checks whether the given lang is available in the registry with its
    /// grammar name, alias or scope name
    pub fn contains_grammar(&self, name: &str) -> bool {
        self.grammar_id_by_name.contains_key(name)
            || self.grammar_id_by_scope_name.contains_key(name)
    }

    /// Checks whether the given theme is available in the registry
    pub fn contains_theme(&self, name: &str) -> bool {
        self.themes.contains_key(name)
    }

    pub fn theme(&self, name: &str) -> OcraResult<&CompiledTheme> {
        self.themes
            .get(name)
            .ok_or_else(|| Error::ThemeNotFound(name.to_string()))
    }

    fn grammar_id(&self, name: &str) -> Option<GrammarId> {
        self.grammar_id_by_name
            .get(name)
            .or_else(|| self.grammar_id_by_scope_name.get(name))
            .copied()
    }

    /// Creates a tokenizer for the given grammar name, alias or scope name.
    ///
    /// Make sure `link_grammars` was called first, this will error otherwise.
    pub fn tokenizer(&self, name: &str) -> OcraResult<Tokenizer<'_>> {
        if !self.linked {
            return Err(Error::UnlinkedGrammars);
        }
        let grammar_id = self
            .grammar_id(name)
            .ok_or_else(|| Error::GrammarNotFound(name.to_string()))?;
        Ok(Tokenizer::new(grammar_id, self))
    }

    /// Resolves all references to other grammars. Call it again after adding
    /// more grammars; includes that pointed at grammars absent the first time
    /// get another chance.
    pub fn link_grammars(&mut self) -> OcraResult<()> {
        // resolution reads all grammars, applying mutates one: two phases
        let mut plans = Vec::with_capacity(self.grammars.len());
        for grammar in &self.grammars {
            plans.push(grammar.plan_reference_resolution(
                &self.grammar_id_by_scope_name,
                &self.grammars,
            ));
        }

        for (grammar, (replacements, unresolved)) in self.grammars.iter_mut().zip(plans) {
            if !unresolved.is_empty() {
                log::warn!(
                    "grammar '{}' references missing grammars: {}",
                    grammar.scope_name,
                    unresolved.join(", ")
                );
            }
            grammar.apply_reference_resolution(replacements, unresolved);
        }

        for grammar_idx in 0..self.grammars.len() {
            let grammar_id = self.grammars[grammar_idx].id;
            for inject_to in self.grammars[grammar_idx].inject_to.clone() {
                if let Some(target) = self.grammar_id(&inject_to) {
                    self.injections_by_grammar[target.as_index()].insert(grammar_id);
                }
            }
        }

        self.linked = true;
        Ok(())
    }

    fn get_rule_patterns(
        &self,
        base_grammar_id: GrammarId,
        mut rule_ref: GlobalRuleRef,
        visited: &mut HashSet<GlobalRuleRef>,
    ) -> Vec<(GlobalRuleRef, String)> {
        let mut out = vec![];
        if visited.contains(&rule_ref) || rule_ref == NO_OP_GLOBAL_RULE_REF {
            return out;
        }
        if rule_ref == BASE_GLOBAL_RULE_REF {
            rule_ref = GlobalRuleRef {
                grammar: base_grammar_id,
                rule: ROOT_RULE_ID,
            };
        }
        visited.insert(rule_ref);

        let grammar = &self.grammars[rule_ref.grammar.as_index()];
        let rule = &grammar.rules[rule_ref.rule.as_index()];
        match rule {
            Rule::Match(Match { regex_id, .. }) => {
                if let Some(regex_id) = regex_id {
                    let re = &grammar.regexes[regex_id.as_index()];
                    out.push((rule_ref, re.pattern().to_owned()));
                }
            }
            Rule::IncludeOnly(i) => {
                out.extend(self.get_pattern_set_data(base_grammar_id, &i.patterns, visited));
            }
            Rule::BeginEnd(b) => out.push((
                rule_ref,
                grammar.regexes[b.begin.as_index()].pattern().to_owned(),
            )),
            Rule::BeginWhile(b) => out.push((
                rule_ref,
                grammar.regexes[b.begin.as_index()].pattern().to_owned(),
            )),
            Rule::Noop => {}
        }
        out
    }

    fn get_pattern_set_data(
        &self,
        base_grammar_id: GrammarId,
        patterns: &[PatternRef],
        visited: &mut HashSet<GlobalRuleRef>,
    ) -> Vec<(GlobalRuleRef, String)> {
        let mut out = Vec::new();

        for p in patterns {
            match p {
                PatternRef::Resolved(rule_ref) => {
                    out.extend(self.get_rule_patterns(base_grammar_id, *rule_ref, visited));
                }
                PatternRef::Reference(reference) => {
                    // still unresolved after linking: the target grammar was
                    // never added, so the include contributes nothing
                    log::debug!("skipping unresolved include {reference:?}");
                }
            }
        }

        out
    }

    /// Flattens the patterns of a rule into scannable (rule, regex) pairs,
    /// expanding includes recursively.
    pub(crate) fn collect_patterns(
        &self,
        base_grammar_id: GrammarId,
        rule_ref: GlobalRuleRef,
    ) -> Vec<(GlobalRuleRef, String)> {
        let grammar = &self.grammars[rule_ref.grammar.as_index()];
        let base_patterns: &[PatternRef] = match &grammar.rules[rule_ref.rule.as_index()] {
            Rule::IncludeOnly(a) => &a.patterns,
            Rule::BeginEnd(a) => &a.patterns,
            Rule::BeginWhile(a) => &a.patterns,
            Rule::Match(_) | Rule::Noop => &[],
        };
        let mut visited = HashSet::new();
        self.get_pattern_set_data(base_grammar_id, base_patterns, &mut visited)
    }

    /// Injection rules whose selector matches the current scope stack, sorted
    /// left-priority first so the scan tries them in tie-break order.
    pub(crate) fn collect_injection_patterns(
        &self,
        target_grammar_id: GrammarId,
        scope_stack: &[Scope],
    ) -> Vec<(InjectionPrecedence, GlobalRuleRef)> {
        let mut result = Vec::new();

        for (matchers, rule) in &self.grammars[target_grammar_id.as_index()].injections {
            for matcher in matchers {
                if matcher.matches(scope_stack) {
                    log::trace!("scope stack {scope_stack:?} matched injection {matcher:?}");
                    result.push((matcher.precedence(), *rule));
                }
            }
        }

        // Grammars that inject themselves into the target grammar
        for &injector_id in &self.injections_by_grammar[target_grammar_id.as_index()] {
            let injector = &self.grammars[injector_id.as_index()];

            if let Some(matcher) = injector
                .injection_selector
                .iter()
                .find(|matcher| matcher.matches(scope_stack))
            {
                // injector grammars contribute their whole root rule
                result.push((
                    matcher.precedence(),
                    GlobalRuleRef {
                        grammar: injector_id,
                        rule: ROOT_RULE_ID,
                    },
                ));
            }
        }

        result.sort_by_key(|(precedence, _)| precedence.sort_key());

        result
    }
}
