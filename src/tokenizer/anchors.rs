use std::borrow::Cow;
use std::fmt;

/// Which of the `\A`/`\G` anchors may match at the current scan position.
/// These are not native regex anchors for our purposes: `\A` means "start of
/// the first line" and `\G` means "end of the previous match", so the same
/// rule source compiles to up to four variants depending on context.
#[derive(Copy, Clone, PartialEq, Hash, Eq)]
pub enum AnchorActive {
    /// Only \A is active
    A,
    /// Only \G is active
    G,
    /// Both \A and \G are active
    AG,
    /// Neither \A nor \G are active
    None,
}

impl AnchorActive {
    pub fn new(is_first_line: bool, anchor_position: Option<usize>, current_pos: usize) -> Self {
        let g_active = anchor_position == Some(current_pos);

        if is_first_line {
            if g_active { AnchorActive::AG } else { AnchorActive::A }
        } else if g_active {
            AnchorActive::G
        } else {
            AnchorActive::None
        }
    }

    /// Index into the per-variant scanner cache.
    #[inline]
    pub fn cache_slot(self) -> usize {
        match self {
            AnchorActive::None => 0,
            AnchorActive::A => 1,
            AnchorActive::G => 2,
            AnchorActive::AG => 3,
        }
    }

    /// Inactive anchors are replaced with a character that is very unlikely
    /// to appear in real text, following vscode-textmate. Active ones keep
    /// their native meaning: `\A` only matches at offset 0 of the searched
    /// line, `\G` at the search start position.
    pub fn replace_anchors<'a>(&self, pat: &'a str) -> Cow<'a, str> {
        match self {
            AnchorActive::AG => Cow::Borrowed(pat),
            AnchorActive::A => {
                if pat.contains("\\G") {
                    Cow::Owned(pat.replace("\\G", "\u{FFFF}"))
                } else {
                    Cow::Borrowed(pat)
                }
            }
            AnchorActive::G => {
                if pat.contains("\\A") {
                    Cow::Owned(pat.replace("\\A", "\u{FFFF}"))
                } else {
                    Cow::Borrowed(pat)
                }
            }
            AnchorActive::None => {
                if pat.contains("\\A") || pat.contains("\\G") {
                    Cow::Owned(pat.replace("\\A", "\u{FFFF}").replace("\\G", "\u{FFFF}"))
                } else {
                    Cow::Borrowed(pat)
                }
            }
        }
    }
}

impl fmt::Debug for AnchorActive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnchorActive::A => "allow_A=true, allow_G=false",
            AnchorActive::G => "allow_A=false, allow_G=true",
            AnchorActive::AG => "allow_A=true, allow_G=true",
            AnchorActive::None => "allow_A=false, allow_G=false",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_state_from_position() {
        assert_eq!(AnchorActive::new(true, Some(3), 3), AnchorActive::AG);
        assert_eq!(AnchorActive::new(true, Some(2), 3), AnchorActive::A);
        assert_eq!(AnchorActive::new(true, None, 0), AnchorActive::A);
        assert_eq!(AnchorActive::new(false, Some(5), 5), AnchorActive::G);
        assert_eq!(AnchorActive::new(false, None, 0), AnchorActive::None);
    }

    #[test]
    fn inactive_anchors_are_neutralized() {
        let pat = "\\Afoo\\Gbar";
        assert_eq!(AnchorActive::AG.replace_anchors(pat), pat);
        assert_eq!(AnchorActive::A.replace_anchors(pat), "\\Afoo\u{FFFF}bar");
        assert_eq!(AnchorActive::G.replace_anchors(pat), "\u{FFFF}foo\\Gbar");
        assert_eq!(
            AnchorActive::None.replace_anchors(pat),
            "\u{FFFF}foo\u{FFFF}bar"
        );
    }

    #[test]
    fn plain_patterns_borrow() {
        assert!(matches!(
            AnchorActive::None.replace_anchors("abc"),
            Cow::Borrowed(_)
        ));
    }
}
