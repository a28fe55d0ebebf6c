use serde::{Deserialize, Serialize};

#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug,
)]
pub struct FontStyle {
    bits: u8,
}

impl FontStyle {
    /// Italic font style
    pub const ITALIC: Self = Self { bits: 1 };
    /// Bold font style
    pub const BOLD: Self = Self { bits: 2 };
    /// Underline font style
    pub const UNDERLINE: Self = Self { bits: 4 };
    /// Strikethrough font style
    pub const STRIKETHROUGH: Self = Self { bits: 8 };

    /// Returns an empty set of flags
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Returns `true` if no flags are currently stored
    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Returns `true` if all of the flags in `other` are contained within `self`
    pub const fn contains(&self, other: Self) -> bool {
        (self.bits & other.bits) == other.bits
    }

    /// The raw bit representation, as packed into token metadata
    pub const fn bits(&self) -> u8 {
        self.bits
    }

    /// Returns the font style from a theme font style string
    pub fn from_str(font_style_str: &str) -> Self {
        let mut font_style = Self::empty();
        if font_style_str.contains("bold") {
            font_style.insert(FontStyle::BOLD);
        }
        if font_style_str.contains("italic") {
            font_style.insert(FontStyle::ITALIC);
        }
        if font_style_str.contains("underline") {
            font_style.insert(FontStyle::UNDERLINE);
        }
        if font_style_str.contains("strikethrough") {
            font_style.insert(FontStyle::STRIKETHROUGH);
        }
        font_style
    }

    /// Inserts the specified flags in-place
    pub fn insert(&mut self, other: Self) {
        self.bits |= other.bits;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_combined_styles() {
        let style = FontStyle::from_str("bold italic");
        assert!(style.contains(FontStyle::BOLD));
        assert!(style.contains(FontStyle::ITALIC));
        assert!(!style.contains(FontStyle::UNDERLINE));
        assert_eq!(style.bits(), 3);

        assert!(FontStyle::from_str("").is_empty());
        assert!(FontStyle::from_str("normal").is_empty());
    }
}
