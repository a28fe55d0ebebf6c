//! Packed per-token metadata for the binary tokenization API.
//!
//! Editors that consume binary tokens get one `u32` per token instead of a
//! scope list. The layout follows the encoding popularized by vscode:
//!
//! ```text
//!  3322 2222 2222 1111 1111 1100 0000 0000
//!  1098 7654 3210 9876 5432 1098 7654 3210
//!  bbbb bbbb bfff ffff ffFF FFBT Tlll llll
//! ```
//!
//! - `l` (bits 0..8): language id
//! - `T` (bits 8..10): standard token type
//! - `B` (bit 10): contains balanced brackets
//! - `F` (bits 11..15): font style
//! - `f` (bits 15..24): foreground color id in the theme's color map
//! - `b` (bits 24..32): background color id

use std::sync::LazyLock;

use crate::scope::Scope;

const LANGUAGE_ID_OFFSET: u32 = 0;
const TOKEN_TYPE_OFFSET: u32 = 8;
const BALANCED_BRACKETS_OFFSET: u32 = 10;
const FONT_STYLE_OFFSET: u32 = 11;
const FOREGROUND_OFFSET: u32 = 15;
const BACKGROUND_OFFSET: u32 = 24;

const LANGUAGE_ID_MASK: u32 = 0b0000_0000_0000_0000_0000_0000_1111_1111;
const TOKEN_TYPE_MASK: u32 = 0b0000_0000_0000_0000_0000_0011_0000_0000;
const BALANCED_BRACKETS_MASK: u32 = 0b0000_0000_0000_0000_0000_0100_0000_0000;
const FONT_STYLE_MASK: u32 = 0b0000_0000_0000_0000_0111_1000_0000_0000;
const FOREGROUND_MASK: u32 = 0b0000_0000_1111_1111_1000_0000_0000_0000;
const BACKGROUND_MASK: u32 = 0b1111_1111_0000_0000_0000_0000_0000_0000;

/// The four token classes editors special-case (bracket matching, word
/// selection, auto-closing pairs all behave differently inside these).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StandardTokenType {
    Other = 0,
    Comment = 1,
    String = 2,
    RegEx = 3,
}

impl StandardTokenType {
    /// Classifies a scope by its first dot-segment.
    pub fn from_scope(scope: Scope) -> Self {
        static COMMENT: LazyLock<Scope> = LazyLock::new(|| Scope::new("comment"));
        static STRING: LazyLock<Scope> = LazyLock::new(|| Scope::new("string"));
        static REGEXP: LazyLock<Scope> = LazyLock::new(|| Scope::new("string.regexp"));

        if REGEXP.is_prefix_of(scope) {
            StandardTokenType::RegEx
        } else if STRING.is_prefix_of(scope) {
            StandardTokenType::String
        } else if COMMENT.is_prefix_of(scope) {
            StandardTokenType::Comment
        } else {
            StandardTokenType::Other
        }
    }

    /// The innermost classifying scope wins, matching how themes resolve.
    pub fn from_scopes(scopes: &[Scope]) -> Self {
        for scope in scopes.iter().rev() {
            let t = Self::from_scope(*scope);
            if t != StandardTokenType::Other {
                return t;
            }
        }
        StandardTokenType::Other
    }
}

/// Packed token metadata. Field updates only overwrite their own bits, so
/// defaults survive unless a style rule explicitly sets something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenMetadata(u32);

impl TokenMetadata {
    pub fn new(language_id: u8) -> Self {
        Self((language_id as u32) << LANGUAGE_ID_OFFSET)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn language_id(self) -> u8 {
        ((self.0 & LANGUAGE_ID_MASK) >> LANGUAGE_ID_OFFSET) as u8
    }

    pub fn token_type(self) -> StandardTokenType {
        match (self.0 & TOKEN_TYPE_MASK) >> TOKEN_TYPE_OFFSET {
            1 => StandardTokenType::Comment,
            2 => StandardTokenType::String,
            3 => StandardTokenType::RegEx,
            _ => StandardTokenType::Other,
        }
    }

    pub fn contains_balanced_brackets(self) -> bool {
        self.0 & BALANCED_BRACKETS_MASK != 0
    }

    pub fn font_style(self) -> u8 {
        ((self.0 & FONT_STYLE_MASK) >> FONT_STYLE_OFFSET) as u8
    }

    /// Index into the theme's color map; 0 means "not set".
    pub fn foreground(self) -> u32 {
        (self.0 & FOREGROUND_MASK) >> FOREGROUND_OFFSET
    }

    pub fn background(self) -> u32 {
        (self.0 & BACKGROUND_MASK) >> BACKGROUND_OFFSET
    }

    pub fn with_language_id(self, language_id: u8) -> Self {
        Self((self.0 & !LANGUAGE_ID_MASK) | ((language_id as u32) << LANGUAGE_ID_OFFSET))
    }

    pub fn with_token_type(self, token_type: StandardTokenType) -> Self {
        Self((self.0 & !TOKEN_TYPE_MASK) | ((token_type as u32) << TOKEN_TYPE_OFFSET))
    }

    pub fn with_balanced_brackets(self, contains: bool) -> Self {
        if contains {
            Self(self.0 | BALANCED_BRACKETS_MASK)
        } else {
            Self(self.0 & !BALANCED_BRACKETS_MASK)
        }
    }

    pub fn with_font_style(self, font_style: u8) -> Self {
        Self((self.0 & !FONT_STYLE_MASK) | (((font_style as u32) << FONT_STYLE_OFFSET) & FONT_STYLE_MASK))
    }

    pub fn with_foreground(self, color_id: u32) -> Self {
        if color_id == 0 {
            return self;
        }
        Self((self.0 & !FOREGROUND_MASK) | ((color_id << FOREGROUND_OFFSET) & FOREGROUND_MASK))
    }

    pub fn with_background(self, color_id: u32) -> Self {
        if color_id == 0 {
            return self;
        }
        Self((self.0 & !BACKGROUND_MASK) | ((color_id << BACKGROUND_OFFSET) & BACKGROUND_MASK))
    }
}
