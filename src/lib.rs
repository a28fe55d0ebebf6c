//! Declarative TextMate-style grammar tokenization.
//!
//! Grammars and themes go into a [`Registry`]; once linked it hands out
//! [`Tokenizer`]s that turn lines of text into scope-annotated tokens, either
//! as plain spans or packed into binary metadata against a theme. Tokenizer
//! state can be persisted between lines, so an edited line can be retokenized
//! without starting from the top of the file.

mod error;
mod grammars;
mod registry;
mod scanner;
mod scope;
mod themes;
mod tokenizer;

pub use error::Error;
pub use grammars::{GrammarId, RawGrammar};
pub use registry::{PLAIN_GRAMMAR_NAME, Registry};
pub use scope::Scope;
pub use themes::{
    Color, CompiledTheme, FontStyle, RawTheme, ResolvedStyle, Style, ThemeMatcher, ThemeType,
};
pub use tokenizer::{
    BinaryTokenizedLine, PersistedState, StandardTokenType, StateStack, Token, TokenMetadata,
    TokenizedLine, Tokenizer,
};
