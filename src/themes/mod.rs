//! Theme loading, compilation and scope stack matching.
//!
//! A theme starts as VSCode-style JSON ([`RawTheme`]), gets compiled into a
//! trie keyed by scope segments ([`CompiledTheme`]) and is then queried
//! through a memoizing [`ThemeMatcher`].

mod color;
mod compiled;
mod font_style;
mod raw;
mod selector;
mod trie;

pub use color::{Color, ColorMap};
pub use compiled::{CompiledTheme, ResolvedStyle, Style, StyleModifier, ThemeMatcher, ThemeType};
pub use font_style::FontStyle;
pub use raw::{RawTheme, TokenColorRule, TokenColorSettings};
pub use selector::{Parent, ThemeSelector, parse_selector};
