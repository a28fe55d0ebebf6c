use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::grammars::injections::{CompiledInjectionMatcher, parse_injection_selector};
use crate::grammars::raw::{Captures, RawGrammar, RawRule};
use crate::grammars::regex::Regex;
use crate::scope::Scope;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub u16);

impl RuleId {
    #[inline]
    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl Deref for RuleId {
    type Target = u16;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrammarId(pub u16);

impl GrammarId {
    #[inline]
    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}

/// A rule within a specific grammar. Stacks and pattern sets reference rules
/// globally since includes cross grammar boundaries.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct GlobalRuleRef {
    pub grammar: GrammarId,
    pub rule: RuleId,
}

/// Rule 0 of every grammar is its root container.
pub const ROOT_RULE_ID: RuleId = RuleId(0);
/// Virtual rule id reported by pattern sets when the active end/while pattern
/// matched. Never stored in the arena.
pub const END_RULE_ID: RuleId = RuleId(u16::MAX);
/// `$base` placeholder: re-pointed to the base grammar's root at scan time.
pub const BASE_GLOBAL_RULE_REF: GlobalRuleRef = GlobalRuleRef {
    grammar: GrammarId(u16::MAX),
    rule: RuleId(0),
};
/// Reference that resolved to nothing; contributes no pattern.
pub const NO_OP_GLOBAL_RULE_REF: GlobalRuleRef = GlobalRuleRef {
    grammar: GrammarId(u16::MAX),
    rule: RuleId(1),
};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegexId(u16);

impl RegexId {
    #[inline]
    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryId(u16);

impl RepositoryId {
    #[inline]
    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}

/// Named rules visible at some nesting level of the grammar.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct Repository(HashMap<String, RuleId>);

impl Repository {
    pub fn get(&self, name: &str) -> Option<&RuleId> {
        self.0.get(name)
    }
}

/// Chain of repositories in scope for a rule, innermost last. Rules deep in a
/// grammar see their local repository overrides first, then outer ones.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct RepositoryStack {
    stack: [Option<RepositoryId>; 8],
    len: u8,
}

impl RepositoryStack {
    /// Pushes an inner repository. Nesting past the fixed capacity keeps the
    /// outer repositories and drops the new override.
    pub fn push(mut self, id: RepositoryId) -> Self {
        if (self.len as usize) < self.stack.len() {
            self.stack[self.len as usize] = Some(id);
            self.len += 1;
        } else {
            log::warn!(
                "rule-local repositories nested deeper than {}, ignoring the innermost one",
                self.stack.len()
            );
        }
        self
    }

    /// Repository ids from innermost to outermost.
    pub fn iter_innermost_first(&self) -> impl Iterator<Item = RepositoryId> + '_ {
        (0..self.len as usize)
            .rev()
            .filter_map(|i| self.stack[i])
    }
}

/// A scope name from the grammar, possibly carrying `$1`-style placeholders
/// that are substituted with captured text per match.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ScopeName {
    Static(Scope),
    Dynamic(String),
}

impl ScopeName {
    pub fn new(s: &str) -> Self {
        if s.contains('$') {
            ScopeName::Dynamic(s.to_string())
        } else {
            ScopeName::Static(Scope::new(s))
        }
    }

    /// Resolves placeholders against the current match. Static names resolve
    /// without touching the line.
    pub fn resolve(&self, line: &str, captures: &[Option<(usize, usize)>]) -> Scope {
        match self {
            ScopeName::Static(scope) => *scope,
            ScopeName::Dynamic(template) => {
                let mut out = String::with_capacity(template.len());
                let bytes = template.as_bytes();
                let mut i = 0;
                while i < bytes.len() {
                    if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() {
                        let mut j = i + 1;
                        while j < bytes.len() && bytes[j].is_ascii_digit() {
                            j += 1;
                        }
                        let group: usize = template[i + 1..j].parse().unwrap_or(0);
                        if let Some(Some((start, end))) = captures.get(group) {
                            out.push_str(line[*start..*end].trim());
                        }
                        i = j;
                    } else {
                        let c = template[i..].chars().next().unwrap();
                        out.push(c);
                        i += c.len_utf8();
                    }
                }
                Scope::new(&out)
            }
        }
    }
}

/// How an `include` string resolves. `Unknown` entries are recorded rather
/// than failing so dependency loaders can fetch the missing grammar later.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Reference {
    /// `$self`: the including grammar's root
    Self_,
    /// `$base`: the root of the grammar tokenization started with
    Base,
    /// `#name` within the current grammar
    Local(String),
    /// `scope.name`: another grammar's root
    External(String),
    /// `scope.name#rule`: a repository entry in another grammar
    ExternalRule(String, String),
}

impl From<&str> for Reference {
    fn from(value: &str) -> Self {
        match value {
            "$self" => Reference::Self_,
            "$base" => Reference::Base,
            s if s.starts_with('#') => Reference::Local(s[1..].to_string()),
            s if s.contains('#') => {
                let (scope, rule) = s.split_once('#').unwrap();
                Reference::ExternalRule(scope.to_string(), rule.to_string())
            }
            s => Reference::External(s.to_string()),
        }
    }
}

/// A slot in a rule's pattern list: either resolved to an arena rule or a
/// reference still waiting for `link_grammars`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PatternRef {
    Resolved(GlobalRuleRef),
    Reference(Reference),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Match {
    pub id: RuleId,
    // some match rules only exist for their captures
    pub scope_name: Option<ScopeName>,
    /// None for scope-only rules (captures that just assign a scope)
    pub regex_id: Option<RegexId>,
    pub captures: Vec<Option<RuleId>>,
    pub repository_stack: RepositoryStack,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IncludeOnly {
    pub id: RuleId,
    pub scope_name: Option<ScopeName>,
    pub content_scope_name: Option<ScopeName>,
    pub repository_stack: RepositoryStack,
    pub patterns: Vec<PatternRef>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BeginEnd {
    pub id: RuleId,
    pub scope_name: Option<ScopeName>,
    pub content_scope_name: Option<ScopeName>,
    pub begin: RegexId,
    pub begin_captures: Vec<Option<RuleId>>,
    pub end: RegexId,
    pub end_has_backrefs: bool,
    pub end_captures: Vec<Option<RuleId>>,
    pub apply_end_pattern_last: bool,
    pub patterns: Vec<PatternRef>,
    pub repository_stack: RepositoryStack,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BeginWhile {
    pub id: RuleId,
    pub scope_name: Option<ScopeName>,
    pub content_scope_name: Option<ScopeName>,
    pub begin: RegexId,
    pub begin_captures: Vec<Option<RuleId>>,
    pub while_: RegexId,
    pub while_has_backrefs: bool,
    pub while_captures: Vec<Option<RuleId>>,
    pub patterns: Vec<PatternRef>,
    pub repository_stack: RepositoryStack,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Rule {
    Match(Match),
    IncludeOnly(IncludeOnly),
    BeginEnd(BeginEnd),
    BeginWhile(BeginWhile),
    Noop,
}

impl Rule {
    pub fn scope_name(&self) -> Option<&ScopeName> {
        match self {
            Rule::Match(r) => r.scope_name.as_ref(),
            Rule::IncludeOnly(r) => r.scope_name.as_ref(),
            Rule::BeginEnd(r) => r.scope_name.as_ref(),
            Rule::BeginWhile(r) => r.scope_name.as_ref(),
            Rule::Noop => None,
        }
    }

    pub fn content_scope_name(&self) -> Option<&ScopeName> {
        match self {
            Rule::IncludeOnly(r) => r.content_scope_name.as_ref(),
            Rule::BeginEnd(r) => r.content_scope_name.as_ref(),
            Rule::BeginWhile(r) => r.content_scope_name.as_ref(),
            Rule::Match(_) | Rule::Noop => None,
        }
    }

    /// The scope this rule adds for its whole extent, resolved per match.
    pub fn get_name_scope(
        &self,
        line: &str,
        captures: &[Option<(usize, usize)>],
    ) -> Option<Scope> {
        self.scope_name().map(|name| name.resolve(line, captures))
    }

    /// The extra scope for the content between delimiters, resolved per match.
    pub fn get_content_scope(
        &self,
        line: &str,
        captures: &[Option<(usize, usize)>],
    ) -> Option<Scope> {
        self.content_scope_name()
            .map(|name| name.resolve(line, captures))
    }

    /// Whether a capture using this rule needs its text retokenized.
    pub fn has_patterns(&self) -> bool {
        match self {
            Rule::IncludeOnly(r) => !r.patterns.is_empty(),
            Rule::BeginEnd(r) => !r.patterns.is_empty(),
            Rule::BeginWhile(r) => !r.patterns.is_empty(),
            Rule::Match(_) | Rule::Noop => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledGrammar {
    pub id: GrammarId,
    pub name: String,
    pub scope_name: String,
    pub scope: Scope,
    pub file_types: Vec<String>,
    pub regexes: Vec<Regex>,
    pub rules: Vec<Rule>,
    pub repositories: Vec<Repository>,
    /// Own-grammar injections: selector matchers plus the rule they activate
    pub injections: Vec<(Vec<CompiledInjectionMatcher>, GlobalRuleRef)>,
    /// Selector gating where this grammar injects itself into others
    pub injection_selector: Vec<CompiledInjectionMatcher>,
    pub inject_to: Vec<String>,
    /// Includes that pointed at grammars absent from the registry at link
    /// time. Recorded so callers can fetch and re-link.
    pub unresolved_references: Vec<String>,
}

impl CompiledGrammar {
    pub fn from_raw_grammar(raw: RawGrammar, id: GrammarId) -> Self {
        let scope = Scope::new(&raw.scope_name);

        let mut grammar = Self {
            id,
            name: raw.name,
            scope_name: raw.scope_name,
            scope,
            file_types: raw.file_types,
            regexes: Vec::new(),
            rules: Vec::new(),
            repositories: Vec::new(),
            injections: Vec::new(),
            injection_selector: raw
                .injection_selector
                .as_deref()
                .map(parse_injection_selector)
                .unwrap_or_default(),
            inject_to: raw.inject_to,
            unresolved_references: Vec::new(),
        };

        let root_rule = RawRule {
            patterns: raw.patterns,
            repository: raw.repository,
            ..Default::default()
        };
        let root_rule_id = grammar.compile_rule(root_rule, RepositoryStack::default());
        debug_assert_eq!(root_rule_id, ROOT_RULE_ID);

        for (selector, raw_rule) in raw.injections {
            let matchers = parse_injection_selector(&selector);
            if matchers.is_empty() {
                continue;
            }
            let rule_id = grammar.compile_rule(raw_rule, RepositoryStack::default());
            grammar.injections.push((
                matchers,
                GlobalRuleRef {
                    grammar: id,
                    rule: rule_id,
                },
            ));
        }

        grammar
    }

    /// Compiles one raw rule into the arena. The id is reserved by pushing a
    /// placeholder before the body is built, so recursive grammars can refer
    /// back to a rule that is still being compiled.
    fn compile_rule(&mut self, raw_rule: RawRule, repository_stack: RepositoryStack) -> RuleId {
        let id = RuleId(self.rules.len() as u16);
        self.rules.push(Rule::Noop);

        let scope_name = raw_rule.name.as_deref().map(ScopeName::new);
        let content_scope_name = raw_rule.content_name.as_deref().map(ScopeName::new);

        let rule = if let Some(pat) = raw_rule.match_ {
            let captures = self.compile_captures(raw_rule.captures, repository_stack);
            Rule::Match(Match {
                id,
                scope_name,
                regex_id: Some(self.compile_regex(pat).0),
                captures,
                repository_stack,
            })
        } else if let Some(begin_pat) = raw_rule.begin {
            // vscode-textmate: `captures` acts as fallback for both the begin
            // and the end/while captures
            let begin_captures = if raw_rule.begin_captures.is_empty() {
                raw_rule.captures.clone()
            } else {
                raw_rule.begin_captures
            };

            if let Some(while_pat) = raw_rule.while_ {
                let while_captures = if raw_rule.while_captures.is_empty() {
                    raw_rule.captures
                } else {
                    raw_rule.while_captures
                };
                let (while_, while_has_backrefs) = self.compile_regex(while_pat);
                let patterns = self.compile_patterns(raw_rule.patterns, repository_stack);
                Rule::BeginWhile(BeginWhile {
                    id,
                    scope_name,
                    content_scope_name,
                    begin: self.compile_regex(begin_pat).0,
                    begin_captures: self.compile_captures(begin_captures, repository_stack),
                    while_,
                    while_has_backrefs,
                    while_captures: self.compile_captures(while_captures, repository_stack),
                    patterns,
                    repository_stack,
                })
            } else if let Some(end_pat) = raw_rule.end {
                let end_captures = if raw_rule.end_captures.is_empty() {
                    raw_rule.captures
                } else {
                    raw_rule.end_captures
                };
                let (end, end_has_backrefs) = self.compile_regex(end_pat);
                let patterns = self.compile_patterns(raw_rule.patterns, repository_stack);
                Rule::BeginEnd(BeginEnd {
                    id,
                    scope_name,
                    content_scope_name,
                    begin: self.compile_regex(begin_pat).0,
                    begin_captures: self.compile_captures(begin_captures, repository_stack),
                    end,
                    end_has_backrefs,
                    end_captures: self.compile_captures(end_captures, repository_stack),
                    apply_end_pattern_last: raw_rule.apply_end_pattern_last,
                    patterns,
                    repository_stack,
                })
            } else {
                // begin without end/while is just a match, probably a typo
                Rule::Match(Match {
                    id,
                    scope_name,
                    regex_id: Some(self.compile_regex(begin_pat).0),
                    captures: self.compile_captures(begin_captures, repository_stack),
                    repository_stack,
                })
            }
        } else {
            let repository_stack = if raw_rule.repository.is_empty() {
                repository_stack
            } else {
                let repo_id = self.compile_repository(raw_rule.repository, repository_stack);
                repository_stack.push(repo_id)
            };

            if scope_name.is_some() && raw_rule.patterns.is_empty() && raw_rule.include.is_none() {
                // scope-only rule: a capture that just assigns a scope
                Rule::Match(Match {
                    id,
                    scope_name,
                    regex_id: None,
                    captures: vec![],
                    repository_stack,
                })
            } else {
                // vscode-textmate quirk: includes become patterns only when
                // patterns are absent; present patterns win over the include
                let patterns = if raw_rule.patterns.is_empty() {
                    if let Some(include) = raw_rule.include {
                        vec![RawRule {
                            include: Some(include),
                            ..Default::default()
                        }]
                    } else {
                        raw_rule.patterns
                    }
                } else {
                    raw_rule.patterns
                };

                if patterns.is_empty() {
                    Rule::Noop
                } else {
                    let compiled_patterns = self.compile_patterns(patterns, repository_stack);
                    Rule::IncludeOnly(IncludeOnly {
                        id,
                        scope_name,
                        content_scope_name,
                        repository_stack,
                        patterns: compiled_patterns,
                    })
                }
            }
        };

        self.rules[id.as_index()] = rule;
        id
    }

    fn compile_regex(&mut self, pattern: String) -> (RegexId, bool) {
        let regex_id = RegexId(self.regexes.len() as u16);
        let re = Regex::new(pattern);
        let has_backrefs = re.has_backreferences();
        self.regexes.push(re);

        (regex_id, has_backrefs)
    }

    fn compile_repository(
        &mut self,
        raw_repository: BTreeMap<String, RawRule>,
        repository_stack: RepositoryStack,
    ) -> RepositoryId {
        let repo_id = RepositoryId(self.repositories.len() as u16);

        // reserve the slot first: entries may include each other cyclically
        self.repositories.push(Repository::default());
        let stack = repository_stack.push(repo_id);

        let mut rules = HashMap::new();
        for (name, raw_rule) in raw_repository {
            rules.insert(name, self.compile_rule(raw_rule, stack));
        }

        self.repositories[repo_id.as_index()] = Repository(rules);
        repo_id
    }

    fn compile_captures(
        &mut self,
        captures: Captures,
        repository_stack: RepositoryStack,
    ) -> Vec<Option<RuleId>> {
        if captures.is_empty() {
            return Vec::new();
        }

        let max_capture = captures.keys().max().copied().unwrap_or_default();
        let mut out: Vec<Option<RuleId>> = vec![None; max_capture + 1];

        for (key, rule) in captures.0 {
            out[key] = Some(self.compile_rule(rule, repository_stack));
        }

        out
    }

    fn compile_patterns(
        &mut self,
        rules: Vec<RawRule>,
        repository_stack: RepositoryStack,
    ) -> Vec<PatternRef> {
        let mut out = vec![];

        for r in rules {
            if let Some(include) = r.include {
                // other rule contents are ignored when an include is present
                out.push(PatternRef::Reference(include.as_str().into()));
            } else {
                out.push(PatternRef::Resolved(GlobalRuleRef {
                    grammar: self.id,
                    rule: self.compile_rule(r, repository_stack),
                }));
            }
        }

        out
    }

    /// Looks a repository name up through a rule's repository chain, innermost
    /// override first, falling back to the grammar's root repository.
    pub fn lookup_repository(&self, stack: RepositoryStack, name: &str) -> Option<RuleId> {
        for repo_id in stack.iter_innermost_first() {
            if let Some(&rule_id) = self.repositories[repo_id.as_index()].get(name) {
                return Some(rule_id);
            }
        }
        self.repositories
            .first()
            .and_then(|repo| repo.get(name).copied())
    }

    fn repository_stack_of(&self, rule_id: RuleId) -> RepositoryStack {
        match &self.rules[rule_id.as_index()] {
            Rule::Match(r) => r.repository_stack,
            Rule::IncludeOnly(r) => r.repository_stack,
            Rule::BeginEnd(r) => r.repository_stack,
            Rule::BeginWhile(r) => r.repository_stack,
            Rule::Noop => RepositoryStack::default(),
        }
    }

    /// Resolves this grammar's pending references against the registry's
    /// scope-name table. Returns the replacement list so the registry can
    /// apply it without aliasing the grammar vec.
    pub fn plan_reference_resolution(
        &self,
        grammar_id_by_scope_name: &HashMap<String, GrammarId>,
        grammars: &[CompiledGrammar],
    ) -> (Vec<(usize, usize, GlobalRuleRef)>, Vec<String>) {
        let mut replacements = Vec::new();
        let mut unresolved = Vec::new();

        for (rule_idx, rule) in self.rules.iter().enumerate() {
            let patterns = match rule {
                Rule::IncludeOnly(r) => &r.patterns,
                Rule::BeginEnd(r) => &r.patterns,
                Rule::BeginWhile(r) => &r.patterns,
                Rule::Match(_) | Rule::Noop => continue,
            };

            for (pattern_idx, pattern) in patterns.iter().enumerate() {
                let PatternRef::Reference(reference) = pattern else {
                    continue;
                };

                let resolved = match reference {
                    Reference::Self_ => Some(GlobalRuleRef {
                        grammar: self.id,
                        rule: ROOT_RULE_ID,
                    }),
                    Reference::Base => Some(BASE_GLOBAL_RULE_REF),
                    Reference::Local(name) => {
                        let stack = self.repository_stack_of(RuleId(rule_idx as u16));
                        match self.lookup_repository(stack, name) {
                            Some(rule_id) => Some(GlobalRuleRef {
                                grammar: self.id,
                                rule: rule_id,
                            }),
                            None => {
                                log::debug!(
                                    "repository entry '#{name}' not found in grammar '{}'",
                                    self.scope_name
                                );
                                Some(NO_OP_GLOBAL_RULE_REF)
                            }
                        }
                    }
                    Reference::External(scope) => {
                        match grammar_id_by_scope_name.get(scope.as_str()) {
                            Some(&grammar) => Some(GlobalRuleRef {
                                grammar,
                                rule: ROOT_RULE_ID,
                            }),
                            None => {
                                unresolved.push(scope.clone());
                                None
                            }
                        }
                    }
                    Reference::ExternalRule(scope, rule_name) => {
                        match grammar_id_by_scope_name.get(scope.as_str()) {
                            Some(&grammar_id) => {
                                let other = &grammars[grammar_id.as_index()];
                                match other
                                    .lookup_repository(RepositoryStack::default(), rule_name)
                                {
                                    Some(rule_id) => Some(GlobalRuleRef {
                                        grammar: grammar_id,
                                        rule: rule_id,
                                    }),
                                    None => Some(NO_OP_GLOBAL_RULE_REF),
                                }
                            }
                            None => {
                                unresolved.push(format!("{scope}#{rule_name}"));
                                None
                            }
                        }
                    }
                };

                if let Some(target) = resolved {
                    replacements.push((rule_idx, pattern_idx, target));
                }
            }
        }

        (replacements, unresolved)
    }

    pub fn apply_reference_resolution(
        &mut self,
        replacements: Vec<(usize, usize, GlobalRuleRef)>,
        unresolved: Vec<String>,
    ) {
        for (rule_idx, pattern_idx, target) in replacements {
            let patterns = match &mut self.rules[rule_idx] {
                Rule::IncludeOnly(r) => &mut r.patterns,
                Rule::BeginEnd(r) => &mut r.patterns,
                Rule::BeginWhile(r) => &mut r.patterns,
                Rule::Match(_) | Rule::Noop => continue,
            };
            patterns[pattern_idx] = PatternRef::Resolved(target);
        }
        self.unresolved_references = unresolved;
    }
}
