//! TextMate grammar injection selector parsing and matching.
//!
//! Selectors look like `L:text.html -comment` or
//! `L:(meta.script | meta.style) - (meta source)`: an optional priority
//! prefix, scope tests, negation, parentheses and `,`/`|` alternation.

use std::sync::LazyLock;

use onig::Regex;

use crate::scope::Scope;

/// Injection priority relative to the active rule's own patterns.
/// `Left` wins ties at the same start offset, `Right` and `Default` lose them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InjectionPrecedence {
    /// `L:` prefix
    Left,
    /// no prefix
    Default,
    /// `R:` prefix
    Right,
}

impl InjectionPrecedence {
    pub fn sort_key(self) -> i8 {
        match self {
            InjectionPrecedence::Left => -1,
            InjectionPrecedence::Default => 0,
            InjectionPrecedence::Right => 1,
        }
    }
}

/// A compiled injection selector with its priority prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledInjectionMatcher {
    matcher: SelectorMatcher,
    priority: Option<InjectionPrecedence>,
}

impl CompiledInjectionMatcher {
    pub fn matches(&self, scope_stack: &[Scope]) -> bool {
        self.matcher.matches(scope_stack)
    }

    pub fn precedence(&self) -> InjectionPrecedence {
        self.priority.unwrap_or(InjectionPrecedence::Default)
    }
}

/// Selector expression tree evaluated against scope stacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorMatcher {
    Scope(Scope),
    /// All matchers must succeed (space-separated)
    And(Vec<SelectorMatcher>),
    /// Any matcher can succeed (`|` or `,` separated)
    Or(Vec<SelectorMatcher>),
    /// Matcher must NOT succeed (`-` prefix)
    Not(Box<SelectorMatcher>),
}

impl SelectorMatcher {
    pub fn matches(&self, scope_stack: &[Scope]) -> bool {
        match self {
            SelectorMatcher::Scope(selector) => {
                scope_stack.iter().any(|s| selector.is_prefix_of(*s))
            }
            SelectorMatcher::And(matchers) => matchers.iter().all(|m| m.matches(scope_stack)),
            SelectorMatcher::Or(matchers) => matchers.iter().any(|m| m.matches(scope_stack)),
            SelectorMatcher::Not(inner) => !inner.matches(scope_stack),
        }
    }
}

/// Tokenizer for selector strings (follows vscode-textmate, plus `*`)
static TOKEN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([LR]:|[\w.:]+[\w\*.:\-]*|[,|\-()])?").expect("Invalid selector regex")
});

fn is_identifier(s: &str) -> bool {
    if s.is_empty() || s == "-" {
        return false;
    }

    s.chars().all(|c| {
        c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == ':' || c == '-' || c == '*'
    })
}

fn parse_inner_expression(tokens: &[&str], position: &mut usize) -> SelectorMatcher {
    let mut out = Vec::new();
    while let Some(m) = parse_conjunction(tokens, position) {
        out.push(m);
        if *position < tokens.len() && matches!(tokens[*position], "|" | ",") {
            *position += 1;
        } else {
            break;
        }
    }

    let mut deduplicated = Vec::new();
    for matcher in out {
        if !deduplicated.contains(&matcher) {
            deduplicated.push(matcher);
        }
    }

    if deduplicated.len() == 1 {
        deduplicated.pop().unwrap()
    } else {
        SelectorMatcher::Or(deduplicated)
    }
}

fn parse_operand(tokens: &[&str], position: &mut usize) -> Option<SelectorMatcher> {
    if *position >= tokens.len() {
        return None;
    }

    match tokens[*position] {
        "-" => {
            *position += 1;
            let negated = parse_operand(tokens, position)?;
            Some(SelectorMatcher::Not(Box::new(negated)))
        }
        "(" => {
            *position += 1;
            let inner = parse_inner_expression(tokens, position);
            if *position < tokens.len() && tokens[*position] == ")" {
                *position += 1;
            }
            Some(inner)
        }
        _ => {
            let mut scopes = vec![];

            while *position < tokens.len() && is_identifier(tokens[*position]) {
                let token = tokens[*position];
                // `meta.tag.*` tests the same as `meta.tag`
                let scope = if let Some(pos) = token.find(".*") {
                    Scope::new(token[..pos].trim_end_matches('.'))
                } else {
                    Scope::new(token)
                };

                if !scopes.contains(&scope) {
                    scopes.push(scope);
                }
                *position += 1;
            }

            match scopes.len() {
                0 => None,
                1 => Some(SelectorMatcher::Scope(scopes.pop().unwrap())),
                _ => Some(SelectorMatcher::And(
                    scopes.into_iter().map(SelectorMatcher::Scope).collect(),
                )),
            }
        }
    }
}

fn parse_conjunction(tokens: &[&str], position: &mut usize) -> Option<SelectorMatcher> {
    let mut matchers = Vec::new();

    while let Some(m) = parse_operand(tokens, position) {
        matchers.push(m);
    }

    match matchers.len() {
        0 => None,
        1 => Some(matchers.pop().unwrap()),
        _ => Some(SelectorMatcher::And(matchers)),
    }
}

/// Parse an injection selector string into compiled matchers, one per
/// comma-separated branch.
pub fn parse_injection_selector(selector: &str) -> Vec<CompiledInjectionMatcher> {
    let selector = selector.trim();
    if selector.is_empty() {
        return Vec::new();
    }

    let tokens: Vec<_> = TOKEN_REGEX
        .find_iter(selector)
        .map(|(start, end)| &selector[start..end])
        .filter(|s| !s.is_empty())
        .collect();
    let mut position = 0;
    let mut res = Vec::new();

    let mut priority = None;
    while position < tokens.len() {
        let token = tokens[position];

        match token {
            "L:" => {
                priority = Some(InjectionPrecedence::Left);
                position += 1;
                continue;
            }
            "R:" => {
                priority = Some(InjectionPrecedence::Right);
                position += 1;
                continue;
            }
            _ => (),
        };

        if let Some(matcher) = parse_conjunction(&tokens, &mut position) {
            res.push(CompiledInjectionMatcher { matcher, priority });
            priority = None;
            if position < tokens.len() && tokens[position] == "," {
                position += 1;
            } else {
                break;
            }
        } else {
            break;
        }
    }

    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(names: &[&str]) -> Vec<Scope> {
        names.iter().map(|n| Scope::new(n)).collect()
    }

    #[test]
    fn simple_selector_with_priority() {
        let matchers = parse_injection_selector("L:text.html.markdown");
        assert_eq!(matchers.len(), 1);
        assert_eq!(matchers[0].precedence(), InjectionPrecedence::Left);
        assert!(matchers[0].matches(&stack(&["text.html.markdown.fenced"])));
        assert!(!matchers[0].matches(&stack(&["source.js"])));
    }

    #[test]
    fn negation() {
        let matchers = parse_injection_selector("L:text.html -comment");
        assert_eq!(matchers.len(), 1);
        assert!(matchers[0].matches(&stack(&["text.html"])));
        assert!(!matchers[0].matches(&stack(&["text.html", "comment.block"])));
    }

    #[test]
    fn comma_separates_matchers_and_resets_priority() {
        let matchers = parse_injection_selector("L:text.pug -comment, text.html.derivative");
        assert_eq!(matchers.len(), 2);
        assert_eq!(matchers[0].precedence(), InjectionPrecedence::Left);
        assert_eq!(matchers[1].precedence(), InjectionPrecedence::Default);
    }

    #[test]
    fn parenthesized_or_groups() {
        let matchers =
            parse_injection_selector("L:(meta.script.svelte | meta.style.svelte) (meta.lang.js)");
        assert_eq!(matchers.len(), 1);
        assert!(matchers[0].matches(&stack(&["meta.style.svelte", "meta.lang.js"])));
        assert!(matchers[0].matches(&stack(&["meta.script.svelte", "meta.lang.js"])));
        assert!(!matchers[0].matches(&stack(&["meta.script.svelte"])));
    }

    #[test]
    fn right_priority_and_star_suffix() {
        let matchers = parse_injection_selector("R:text.html - meta.tag.*.*.html");
        assert_eq!(matchers.len(), 1);
        assert_eq!(matchers[0].precedence(), InjectionPrecedence::Right);
        assert!(matchers[0].matches(&stack(&["text.html"])));
        // the star selector collapses to meta.tag
        assert!(!matchers[0].matches(&stack(&["text.html", "meta.tag.span.x.html"])));
    }

    #[test]
    fn empty_selector() {
        assert!(parse_injection_selector("").is_empty());
        assert!(parse_injection_selector("   ").is_empty());
    }
}
