use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, OcraResult};
use crate::grammars::{GlobalRuleRef, GrammarId, ROOT_RULE_ID};
use crate::scope::Scope;

#[derive(Clone, Debug)]
pub struct StackFrame {
    /// Global rule ref that created this stack element
    pub rule_ref: GlobalRuleRef,
    /// "name" scopes - applied to begin/end delimiters
    /// These scopes are active when matching the rule's boundaries
    pub name_scopes: Vec<Scope>,
    /// "contentName" scopes - applied to content between delimiters
    /// These scopes are active for the rule's interior content
    pub content_scopes: Vec<Scope>,
    /// Dynamic end/while pattern resolved with backreferences
    /// For BeginEnd rules: the end pattern with \1, \2, etc. resolved
    /// For BeginWhile rules: the while pattern with backreferences resolved
    pub end_pattern: Option<String>,
    /// The state has entered and captured \n.
    /// This means that the next line should start with an anchor_position of 0.
    pub begin_rule_has_captured_eol: bool,
    /// Where we currently are in a line
    pub anchor_position: Option<usize>,
    /// The position where this rule was entered during current line (for infinite loop detection)
    /// None at beginning of a line
    pub enter_position: Option<usize>,
}

impl StackFrame {
    /// Equality without the per-line scratch positions, which are reset at
    /// every line start and never affect later lines.
    fn same_context(&self, other: &StackFrame) -> bool {
        self.rule_ref == other.rule_ref
            && self.name_scopes == other.name_scopes
            && self.content_scopes == other.content_scopes
            && self.end_pattern == other.end_pattern
            && self.begin_rule_has_captured_eol == other.begin_rule_has_captured_eol
    }
}

/// Keeps track of nested context as well as how to exit that context and the captures
/// strings used in backreferences.
#[derive(Clone)]
pub struct StateStack {
    /// Stack frames from root to current
    pub frames: Vec<StackFrame>,
}

impl StateStack {
    pub fn new(grammar_id: GrammarId, grammar_scope: Scope) -> Self {
        Self {
            frames: vec![StackFrame {
                rule_ref: GlobalRuleRef {
                    grammar: grammar_id,
                    rule: ROOT_RULE_ID,
                },
                name_scopes: vec![grammar_scope],
                content_scopes: vec![grammar_scope],
                end_pattern: None,
                begin_rule_has_captured_eol: false,
                anchor_position: None,
                enter_position: None,
            }],
        }
    }

    /// Called when entering a nested context: when a BeginEnd or BeginWhile begin pattern matches
    pub fn push(
        &mut self,
        rule_ref: GlobalRuleRef,
        anchor_position: Option<usize>,
        begin_rule_has_captured_eol: bool,
        enter_position: Option<usize>,
    ) {
        let content_scopes = self.top().content_scopes.clone();

        self.frames.push(StackFrame {
            rule_ref,
            // Start with the same scope they will diverge later
            name_scopes: content_scopes.clone(),
            content_scopes,
            end_pattern: None,
            begin_rule_has_captured_eol,
            anchor_position,
            enter_position,
        });
    }

    pub fn push_with_scopes(
        &mut self,
        rule_ref: GlobalRuleRef,
        anchor_position: Option<usize>,
        begin_rule_has_captured_eol: bool,
        enter_position: Option<usize>,
        scopes: Vec<Scope>,
    ) {
        self.frames.push(StackFrame {
            rule_ref,
            name_scopes: scopes.clone(),
            content_scopes: scopes,
            end_pattern: None,
            begin_rule_has_captured_eol,
            anchor_position,
            enter_position,
        });
    }

    pub fn set_content_scopes(&mut self, content_scopes: Vec<Scope>) {
        self.top_mut().content_scopes = content_scopes;
    }

    pub fn set_end_pattern(&mut self, end_pattern: String) {
        self.top_mut().end_pattern = Some(end_pattern);
    }

    /// Exits the current context, getting back to the parent
    pub fn pop(&mut self) -> Option<StackFrame> {
        if self.frames.len() > 1 {
            self.frames.pop()
        } else {
            None
        }
    }

    /// Pop but never go below root state - used in infinite loop protection
    pub fn safe_pop(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    /// Whether `rule_ref` already sits on the stack below the top frame, with
    /// every frame from there up entered at `pos`. Grammars whose rules push
    /// each other in a cycle without consuming input never fail the direct
    /// parent comparison, so the walk has to cover the whole chain of frames
    /// entered at the current position.
    pub fn has_rule_entered_at(&self, rule_ref: GlobalRuleRef, pos: usize) -> bool {
        for frame in self.frames.iter().rev().skip(1) {
            if frame.enter_position != Some(pos) {
                return false;
            }
            if frame.rule_ref == rule_ref {
                return true;
            }
        }
        false
    }

    /// Resets enter_position/anchor_position for all stack elements to None
    pub fn reset(&mut self) {
        for frame in &mut self.frames {
            frame.enter_position = None;
            frame.anchor_position = None;
        }
    }

    /// Access the top frame of the stack
    pub fn top(&self) -> &StackFrame {
        self.frames.last().expect("stack never empty")
    }

    /// Mutable access to the top frame of the stack
    pub fn top_mut(&mut self) -> &mut StackFrame {
        self.frames.last_mut().expect("stack never empty")
    }

    /// Structural equality between line-end states. When the state after
    /// re-tokenizing a line equals the previously known state, following
    /// lines keep their old tokens.
    pub fn same_context(&self, other: &StateStack) -> bool {
        self.frames.len() == other.frames.len()
            && self
                .frames
                .iter()
                .zip(&other.frames)
                .all(|(a, b)| a.same_context(b))
    }

    pub fn to_persisted(&self) -> PersistedState {
        PersistedState {
            frames: self
                .frames
                .iter()
                .map(|frame| PersistedFrame {
                    rule_ref: frame.rule_ref,
                    name_scopes: frame.name_scopes.iter().map(|s| s.build_string()).collect(),
                    content_scopes: frame
                        .content_scopes
                        .iter()
                        .map(|s| s.build_string())
                        .collect(),
                    end_pattern: frame.end_pattern.clone(),
                    begin_rule_has_captured_eol: frame.begin_rule_has_captured_eol,
                })
                .collect(),
        }
    }

    /// Rebuilds a runtime stack from its persisted form. `rule_exists`
    /// checks each frame's rule against the current grammar set, so state
    /// saved against different grammars is rejected instead of causing
    /// out-of-bounds rule lookups.
    pub fn from_persisted(
        persisted: &PersistedState,
        rule_exists: impl Fn(GlobalRuleRef) -> bool,
    ) -> OcraResult<Self> {
        if persisted.frames.is_empty() {
            return Err(Error::InvalidPersistedState("no frames".to_string()));
        }
        if persisted.frames[0].rule_ref.rule != ROOT_RULE_ID {
            return Err(Error::InvalidPersistedState(
                "first frame is not a grammar root".to_string(),
            ));
        }

        let mut frames = Vec::with_capacity(persisted.frames.len());
        for frame in &persisted.frames {
            if !rule_exists(frame.rule_ref) {
                return Err(Error::InvalidPersistedState(format!(
                    "unknown rule {:?}",
                    frame.rule_ref
                )));
            }

            frames.push(StackFrame {
                rule_ref: frame.rule_ref,
                name_scopes: frame.name_scopes.iter().map(|s| Scope::new(s)).collect(),
                content_scopes: frame.content_scopes.iter().map(|s| Scope::new(s)).collect(),
                end_pattern: frame.end_pattern.clone(),
                begin_rule_has_captured_eol: frame.begin_rule_has_captured_eol,
                anchor_position: None,
                enter_position: None,
            });
        }

        Ok(Self { frames })
    }
}

/// A [`StateStack`] flattened for storage between editing sessions. Scopes
/// are stored as strings since interned ids are not stable across processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub frames: Vec<PersistedFrame>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedFrame {
    pub rule_ref: GlobalRuleRef,
    pub name_scopes: Vec<String>,
    pub content_scopes: Vec<String>,
    pub end_pattern: Option<String>,
    pub begin_rule_has_captured_eol: bool,
}

impl fmt::Debug for StateStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "StateStack:")?;

        for (depth, frame) in self.frames.iter().enumerate() {
            let indent = "  ".repeat(depth);

            write!(
                f,
                "{}grammar={}, rule={}",
                indent, frame.rule_ref.grammar.0, frame.rule_ref.rule.0
            )?;

            if !frame.name_scopes.is_empty() {
                write!(f, " name=[")?;
                for (i, scope) in frame.name_scopes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", scope.build_string())?;
                }
                write!(f, "]")?;
            }

            if !frame.content_scopes.is_empty() {
                write!(f, ", content=[")?;
                for (i, scope) in frame.content_scopes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", scope.build_string())?;
                }
                write!(f, "]")?;
            }

            if let Some(pattern) = &frame.end_pattern {
                write!(f, ", end_pattern=\"{}\"", pattern)?;
            }

            write!(f, ", anchor_pos={:?}", frame.anchor_position)?;

            if let Some(enter_pos) = frame.enter_position
                && frame.anchor_position != Some(enter_pos)
            {
                write!(f, ", enter_pos={}", enter_pos)?;
            }

            write!(
                f,
                ", begin_rule_has_captured_eol={}",
                frame.begin_rule_has_captured_eol
            )?;

            writeln!(f)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammars::RuleId;

    fn rule(n: u16) -> GlobalRuleRef {
        GlobalRuleRef {
            grammar: GrammarId(0),
            rule: RuleId(n),
        }
    }

    fn stack() -> StateStack {
        StateStack::new(GrammarId(0), Scope::new("source.test"))
    }

    #[test]
    fn pop_never_removes_root() {
        let mut stack = stack();
        assert!(stack.pop().is_none());
        stack.safe_pop();
        assert_eq!(stack.frames.len(), 1);

        stack.push(rule(3), Some(2), false, Some(2));
        assert!(stack.pop().is_some());
        assert_eq!(stack.frames.len(), 1);
    }

    #[test]
    fn pushed_frame_inherits_content_scopes() {
        let mut stack = stack();
        stack.set_content_scopes(vec![Scope::new("source.test"), Scope::new("string.quoted")]);
        stack.push(rule(3), None, false, None);
        assert_eq!(stack.top().name_scopes.len(), 2);
        assert_eq!(stack.top().content_scopes.len(), 2);
    }

    #[test]
    fn reset_clears_line_positions() {
        let mut stack = stack();
        stack.push(rule(3), Some(4), false, Some(4));
        stack.reset();
        assert_eq!(stack.top().anchor_position, None);
        assert_eq!(stack.top().enter_position, None);
    }

    #[test]
    fn same_context_ignores_line_positions() {
        let mut a = stack();
        a.push(rule(3), Some(4), false, Some(4));
        a.set_end_pattern("\\)".to_string());

        let mut b = stack();
        b.push(rule(3), None, false, None);
        b.set_end_pattern("\\)".to_string());

        assert!(a.same_context(&b));

        b.set_end_pattern("\\]".to_string());
        assert!(!a.same_context(&b));
    }

    #[test]
    fn persisted_round_trip() {
        let mut original = stack();
        original.push(rule(3), Some(1), true, Some(1));
        original.set_content_scopes(vec![Scope::new("source.test"), Scope::new("meta.block")]);
        original.set_end_pattern("\\}".to_string());

        let persisted = original.to_persisted();
        let json = serde_json::to_string(&persisted).unwrap();
        let parsed: PersistedState = serde_json::from_str(&json).unwrap();
        let restored = StateStack::from_persisted(&parsed, |_| true).unwrap();

        assert!(original.same_context(&restored));
        // scratch positions are not persisted
        assert_eq!(restored.top().anchor_position, None);
        assert_eq!(restored.top().enter_position, None);
    }

    #[test]
    fn persisted_state_is_validated() {
        let empty = PersistedState { frames: Vec::new() };
        assert!(StateStack::from_persisted(&empty, |_| true).is_err());

        let persisted = stack().to_persisted();
        assert!(StateStack::from_persisted(&persisted, |_| false).is_err());
    }
}
