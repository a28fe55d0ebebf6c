use std::fmt;
use std::io;

pub(crate) type OcraResult<T> = Result<T, Error>;

/// Errors that can occur during ocra usage
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error occurred when reading a grammar or theme file
    Io(io::Error),

    /// JSON parsing failed when loading a grammar or a theme.
    Json(serde_json::Error),

    /// An invalid hex color was encountered.
    /// Can only happen when loading a theme.
    #[allow(missing_docs)]
    InvalidHexColor { value: String, reason: String },

    /// A theme references a color that is not present in its frozen color map.
    /// Indicates a corrupt precomputed theme.
    ColorNotInMap(String),

    /// A grammar was not found in the registry.
    GrammarNotFound(String),

    /// A theme was not found in the registry.
    ThemeNotFound(String),

    /// Tried to tokenize before `link_grammars` was called, so `$base` and
    /// external references cannot be resolved.
    UnlinkedGrammars,

    /// A grammar with the same name cannot replace an existing one once the
    /// registry has linked grammars.
    ReplacingGrammarPostLinking(String),

    /// A regex compilation error occurred during tokenization.
    /// Patterns are rewritten at runtime (backreferences, anchors) so not all
    /// of them can be validated ahead of time. Only raised in strict mode;
    /// forgiving mode treats broken patterns as never matching.
    TokenizeRegex(String),

    /// A persisted state referenced a rule that does not exist in the
    /// registry it was restored against.
    InvalidPersistedState(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Json(err) => write!(f, "JSON parsing error: {}", err),
            Error::InvalidHexColor { value, reason } => {
                write!(f, "invalid hex color '{}': {}", value, reason)
            }
            Error::ColorNotInMap(color) => {
                write!(f, "color '{}' missing from frozen color map", color)
            }
            Error::GrammarNotFound(name) => write!(f, "grammar '{}' not found", name),
            Error::ThemeNotFound(name) => write!(f, "theme '{}' not found", name),
            Error::UnlinkedGrammars => {
                write!(f, "registry is not linked, call link_grammars() first")
            }
            Error::ReplacingGrammarPostLinking(name) => {
                write!(f, "cannot replace grammar '{}' after linking", name)
            }
            Error::TokenizeRegex(message) => write!(f, "regex compilation error: {}", message),
            Error::InvalidPersistedState(message) => {
                write!(f, "invalid persisted state: {}", message)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Json(err) => Some(err),
            Error::InvalidHexColor { .. }
            | Error::ColorNotInMap(_)
            | Error::GrammarNotFound(_)
            | Error::ThemeNotFound(_)
            | Error::UnlinkedGrammars
            | Error::ReplacingGrammarPostLinking(_)
            | Error::TokenizeRegex(_)
            | Error::InvalidPersistedState(_) => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}
