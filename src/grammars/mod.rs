mod compiled;
mod injections;
mod raw;
mod regex;

pub use compiled::*;
pub use injections::{CompiledInjectionMatcher, InjectionPrecedence, parse_injection_selector};
pub use raw::{Captures, RawGrammar, RawRule};
pub use regex::{Regex, escape_regex, resolve_backreferences};
