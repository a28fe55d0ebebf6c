//! Trie over scope segments for theme rule lookup.
//!
//! Selectors are inserted keyed by their target scope's dot-segments, sorted
//! so that ancestors land before descendants; every child node starts as a
//! clone of its parent's accumulated rules, so a lookup only needs to walk as
//! deep as the queried scope and read the node it lands on.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::scope::Scope;
use crate::themes::font_style::FontStyle;
use crate::themes::selector::{Parent, parents_match};

/// A style contribution stored in a trie node. Color values are ids in the
/// theme's color map; 0 means "not set by any rule".
#[derive(Debug, Clone, Default)]
pub(crate) struct TrieRule {
    pub parent_scopes: Vec<Parent>,
    /// Segment count of the selector's target scope
    scope_depth: u32,
    pub font_style: Option<FontStyle>,
    pub foreground: u32,
    pub background: u32,
    /// Insertion order; the later rule wins exact specificity ties
    order: u32,
}

impl TrieRule {
    fn accept_overwrite(
        &mut self,
        scope_depth: u32,
        font_style: Option<FontStyle>,
        foreground: u32,
        background: u32,
        order: u32,
    ) {
        self.scope_depth = scope_depth;
        if font_style.is_some() {
            self.font_style = font_style;
        }
        if foreground != 0 {
            self.foreground = foreground;
        }
        if background != 0 {
            self.background = background;
        }
        self.order = order;
    }

    fn is_set(&self) -> bool {
        self.font_style.is_some() || self.foreground != 0 || self.background != 0
    }

    /// Deeper target scope wins outright. Parent scopes are then compared
    /// pairwise from the innermost parent outwards, longer parent scope
    /// first; only fully tied pairs fall back to the parent count. The last
    /// inserted rule takes any remaining tie.
    fn cmp_specificity(&self, other: &TrieRule) -> Ordering {
        self.scope_depth
            .cmp(&other.scope_depth)
            .then_with(|| {
                for (a, b) in self.parent_scopes.iter().zip(&other.parent_scopes) {
                    let by_len = a.scope().len().cmp(&b.scope().len());
                    if by_len != Ordering::Equal {
                        return by_len;
                    }
                }
                Ordering::Equal
            })
            .then_with(|| self.parent_scopes.len().cmp(&other.parent_scopes.len()))
            .then_with(|| self.order.cmp(&other.order))
    }
}

#[derive(Debug, Clone, Default)]
struct TrieNode {
    /// Accumulated rule without parent requirements
    main_rule: TrieRule,
    /// Parent-qualified rules that end at this node
    rules_with_parents: Vec<TrieRule>,
    /// Children keyed by the next scope segment's interned atom
    children: HashMap<u16, TrieNode>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ThemeTrie {
    root: TrieNode,
}

impl ThemeTrie {
    /// Inserts a selector. Callers must insert selectors sorted so that a
    /// target scope comes after all of its dotted prefixes, otherwise
    /// children cloned before the ancestor rule arrived would miss it.
    pub fn insert(
        &mut self,
        target: Scope,
        parent_scopes: &[Parent],
        font_style: Option<FontStyle>,
        foreground: u32,
        background: u32,
        order: u32,
    ) {
        Self::insert_into(
            &mut self.root,
            target,
            0,
            parent_scopes,
            font_style,
            foreground,
            background,
            order,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_into(
        node: &mut TrieNode,
        target: Scope,
        depth: usize,
        parent_scopes: &[Parent],
        font_style: Option<FontStyle>,
        foreground: u32,
        background: u32,
        order: u32,
    ) {
        if depth == target.len() as usize {
            Self::do_insert_here(
                node,
                target.len(),
                parent_scopes,
                font_style,
                foreground,
                background,
                order,
            );
            return;
        }

        let atom = target.atom_at(depth);
        if !node.children.contains_key(&atom) {
            // new children start from everything accumulated at this level
            let child = TrieNode {
                main_rule: node.main_rule.clone(),
                rules_with_parents: node.rules_with_parents.clone(),
                children: HashMap::new(),
            };
            node.children.insert(atom, child);
        }
        let child = node.children.get_mut(&atom).unwrap();
        Self::insert_into(
            child,
            target,
            depth + 1,
            parent_scopes,
            font_style,
            foreground,
            background,
            order,
        );
    }

    fn do_insert_here(
        node: &mut TrieNode,
        scope_depth: u32,
        parent_scopes: &[Parent],
        font_style: Option<FontStyle>,
        foreground: u32,
        background: u32,
        order: u32,
    ) {
        if parent_scopes.is_empty() {
            node.main_rule
                .accept_overwrite(scope_depth, font_style, foreground, background, order);
            return;
        }

        for rule in &mut node.rules_with_parents {
            if rule.parent_scopes == parent_scopes {
                rule.accept_overwrite(scope_depth, font_style, foreground, background, order);
                return;
            }
        }

        // a fresh parent-qualified rule inherits the unqualified defaults
        let mut rule = node.main_rule.clone();
        rule.parent_scopes = parent_scopes.to_vec();
        rule.accept_overwrite(scope_depth, font_style, foreground, background, order);
        node.rules_with_parents.push(rule);
    }

    /// Finds the most specific rule for one scope given the scopes above it
    /// in the stack.
    pub fn match_scope(&self, scope: Scope, parents: &[Scope]) -> Option<&TrieRule> {
        let mut node = &self.root;
        for i in 0..scope.len() as usize {
            match node.children.get(&scope.atom_at(i)) {
                Some(child) => node = child,
                None => break,
            }
        }

        let mut best: Option<&TrieRule> = None;
        for rule in &node.rules_with_parents {
            if parents_match(&rule.parent_scopes, parents)
                && best.is_none_or(|b| rule.cmp_specificity(b) == Ordering::Greater)
            {
                best = Some(rule);
            }
        }

        if best.is_none() && node.main_rule.is_set() {
            best = Some(&node.main_rule);
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scopes(names: &[&str]) -> Vec<Scope> {
        names.iter().map(|n| Scope::new(n)).collect()
    }

    #[test]
    fn deeper_target_wins() {
        let mut trie = ThemeTrie::default();
        trie.insert(Scope::new("a"), &[], None, 1, 0, 0);
        trie.insert(Scope::new("a.b"), &[], None, 2, 0, 1);

        let rule = trie.match_scope(Scope::new("a.b.c"), &[]).unwrap();
        assert_eq!(rule.foreground, 2);
        let rule = trie.match_scope(Scope::new("a.x"), &[]).unwrap();
        assert_eq!(rule.foreground, 1);
        assert!(trie.match_scope(Scope::new("b"), &[]).is_none());
    }

    #[test]
    fn child_inherits_unset_fields() {
        let mut trie = ThemeTrie::default();
        trie.insert(
            Scope::new("a"),
            &[],
            Some(FontStyle::ITALIC),
            1,
            0,
            0,
        );
        // deeper rule only overrides the foreground
        trie.insert(Scope::new("a.b"), &[], None, 2, 0, 1);

        let rule = trie.match_scope(Scope::new("a.b"), &[]).unwrap();
        assert_eq!(rule.foreground, 2);
        assert_eq!(rule.font_style, Some(FontStyle::ITALIC));
    }

    #[test]
    fn parent_qualified_rule_beats_plain() {
        let mut trie = ThemeTrie::default();
        trie.insert(Scope::new("a"), &[], None, 1, 0, 0);
        trie.insert(
            Scope::new("a"),
            &[Parent::Anywhere(Scope::new("b"))],
            None,
            2,
            0,
            1,
        );

        let with_parent = trie
            .match_scope(Scope::new("a"), &scopes(&["b.c"]))
            .unwrap();
        assert_eq!(with_parent.foreground, 2);

        let without = trie.match_scope(Scope::new("a"), &[]).unwrap();
        assert_eq!(without.foreground, 1);
    }

    #[test]
    fn direct_parent_requires_adjacency() {
        let mut trie = ThemeTrie::default();
        trie.insert(
            Scope::new("a"),
            &[Parent::Direct(Scope::new("b"))],
            None,
            2,
            0,
            0,
        );

        assert!(trie.match_scope(Scope::new("a"), &scopes(&["b"])).is_some());
        assert!(
            trie.match_scope(Scope::new("a"), &scopes(&["b", "c"]))
                .is_none()
        );
    }

    #[test]
    fn longer_parent_scope_wins_over_more_parents() {
        let mut trie = ThemeTrie::default();
        trie.insert(
            Scope::new("a"),
            &[
                Parent::Anywhere(Scope::new("c")),
                Parent::Anywhere(Scope::new("b")),
            ],
            None,
            1,
            0,
            0,
        );
        trie.insert(
            Scope::new("a"),
            &[Parent::Anywhere(Scope::new("b.x.y"))],
            None,
            2,
            0,
            1,
        );

        let rule = trie
            .match_scope(Scope::new("a"), &scopes(&["b.x.y", "c"]))
            .unwrap();
        assert_eq!(rule.foreground, 2);
    }

    #[test]
    fn innermost_parent_length_beats_parent_count() {
        let mut trie = ThemeTrie::default();
        // "x y z t": three single-segment parents, innermost-first
        trie.insert(
            Scope::new("t"),
            &[
                Parent::Anywhere(Scope::new("z")),
                Parent::Anywhere(Scope::new("y")),
                Parent::Anywhere(Scope::new("x")),
            ],
            None,
            1,
            0,
            0,
        );
        // "aaa.bbb t": a single but longer innermost parent
        trie.insert(
            Scope::new("t"),
            &[Parent::Anywhere(Scope::new("aaa.bbb"))],
            None,
            2,
            0,
            1,
        );

        // summed parent segments would favour the first rule (3 vs 2); the
        // pairwise innermost comparison picks the longer parent scope
        let rule = trie
            .match_scope(Scope::new("t"), &scopes(&["x", "y", "z", "aaa.bbb"]))
            .unwrap();
        assert_eq!(rule.foreground, 2);
    }
}
