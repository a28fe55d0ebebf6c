//! Interned scope names packed into a single u128.
//!
//! A scope like `string.quoted.double` is stored as up to 8 atoms of 16 bits
//! each, MSB-first. Each atom is an index into a global string repository
//! plus one (0 marks an unused slot). Packing the whole scope into one word
//! makes the dotted-prefix test used everywhere in theme matching a couple of
//! bit operations.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

pub const MAX_ATOMS: usize = 8;
// 2^16 - 2: atom 0 means "unused", u16::MAX stays free
pub const MAX_REPOSITORY_SIZE: usize = 65534;

/// A dot-segmented lexical label such as `comment.line.double-slash`.
///
/// Scopes longer than 8 segments are truncated; real grammars stay well under
/// that.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Copy, Default, Hash)]
pub struct Scope {
    /// Atoms packed MSB-first so that lexicographic ordering on the u128
    /// matches segment-wise ordering.
    atoms: u128,
}

impl Scope {
    /// Interns a dot-separated string into the global repository.
    pub fn new(s: &str) -> Scope {
        let mut repo = lock_global_scope_repo();
        repo.build(s.trim())
    }

    /// The atom at `index` (0-7): 0 for unused slots, repository index + 1
    /// otherwise.
    #[inline]
    pub fn atom_at(self, index: usize) -> u16 {
        debug_assert!(index < MAX_ATOMS);
        let shift = (MAX_ATOMS - 1 - index) * 16;
        ((self.atoms >> shift) & 0xFFFF) as u16
    }

    /// Number of segments in this scope.
    #[inline]
    pub fn len(self) -> u32 {
        MAX_ATOMS as u32 - self.missing_atoms()
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.atoms == 0
    }

    /// Unused slots sit in the low bits, so counting trailing zeros gives the
    /// number of empty atom slots.
    #[inline]
    fn missing_atoms(self) -> u32 {
        self.atoms.trailing_zeros() / 16
    }

    /// TextMate dotted-segment prefix test: `a.b` matches selector `a`.
    /// This is the hot path of theme matching and stays O(1).
    #[inline]
    pub fn is_prefix_of(self, other: Scope) -> bool {
        let missing = self.missing_atoms();

        if missing == MAX_ATOMS as u32 {
            return true;
        }

        let mask_shift = missing * 16;
        let mask = if mask_shift >= 128 {
            0u128
        } else {
            u128::MAX << mask_shift
        };

        (self.atoms ^ other.atoms) & mask == 0
    }

    /// Rebuilds the dotted string. Allocates; used for display and for
    /// persisting stack frames, not in the matching hot path.
    pub fn build_string(self) -> String {
        let repo = lock_global_scope_repo();
        repo.to_string(self)
    }
}

// Atom ids are indices into the process-local repository, so scopes cross
// serialization boundaries as their dotted strings and get re-interned on the
// way back in.
impl Serialize for Scope {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.build_string())
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Scope::new(&s))
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scope(\"{}\")", self.build_string())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.build_string())
    }
}

/// Global atom repository mapping segment strings to indices.
struct ScopeRepository {
    atoms: Vec<String>,
    atom_index_map: HashMap<String, usize>,
}

impl ScopeRepository {
    fn new() -> Self {
        Self {
            atoms: Vec::new(),
            atom_index_map: HashMap::new(),
        }
    }

    fn atom_to_index(&mut self, atom: &str) -> usize {
        if let Some(&index) = self.atom_index_map.get(atom) {
            return index;
        }

        if self.atoms.len() >= MAX_REPOSITORY_SIZE {
            panic!("scope repository overflow: more than {MAX_REPOSITORY_SIZE} distinct segments");
        }

        let index = self.atoms.len();
        self.atoms.push(atom.to_owned());
        self.atom_index_map.insert(atom.to_owned(), index);
        index
    }

    fn atom_str(&self, atom_number: u16) -> &str {
        debug_assert!(atom_number > 0);
        &self.atoms[(atom_number - 1) as usize]
    }

    fn build(&mut self, s: &str) -> Scope {
        if s.is_empty() {
            return Scope::default();
        }

        let parts: Vec<&str> = s.split('.').collect();
        let atoms_to_process = parts.len().min(MAX_ATOMS);
        let mut atoms = 0u128;

        for (i, &atom_str) in parts.iter().take(atoms_to_process).enumerate() {
            if atom_str.is_empty() {
                // "a..b" style input
                continue;
            }

            let index = self.atom_to_index(atom_str);
            let atom_value = (index + 1) as u128;

            let shift = (MAX_ATOMS - 1 - i) * 16;
            atoms |= atom_value << shift;
        }

        Scope { atoms }
    }

    fn to_string(&self, scope: Scope) -> String {
        let mut parts = Vec::new();

        for i in 0..MAX_ATOMS {
            let atom_number = scope.atom_at(i);
            if atom_number == 0 {
                break;
            }
            parts.push(self.atom_str(atom_number));
        }

        parts.join(".")
    }
}

static SCOPE_REPO: std::sync::LazyLock<Mutex<ScopeRepository>> =
    std::sync::LazyLock::new(|| Mutex::new(ScopeRepository::new()));

fn lock_global_scope_repo() -> MutexGuard<'static, ScopeRepository> {
    SCOPE_REPO.lock().expect("Failed to lock scope repository")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_scope_creation() {
        let scope = Scope::new("source.rust.meta.function");
        assert_eq!(scope.len(), 4);
        assert_eq!(scope.build_string(), "source.rust.meta.function");
    }

    #[test]
    fn empty_scope() {
        let scope = Scope::new("");
        assert_eq!(scope.len(), 0);
        assert!(scope.is_empty());
        assert_eq!(scope.build_string(), "");
    }

    #[test]
    fn prefix_matching() {
        let prefix = Scope::new("source.rust");
        let full = Scope::new("source.rust.meta.function");
        let different = Scope::new("source.javascript");

        assert!(prefix.is_prefix_of(full));
        assert!(prefix.is_prefix_of(prefix));
        assert!(!prefix.is_prefix_of(different));
        // a full scope is not a prefix of its own prefix
        assert!(!full.is_prefix_of(prefix));
    }

    #[test]
    fn segment_boundaries_respected() {
        // "comment" must not be treated as a prefix of "commentary"
        let short = Scope::new("comment");
        let longer = Scope::new("commentary");
        assert!(!short.is_prefix_of(longer));
    }

    #[test]
    fn atom_truncation() {
        let long_scope = Scope::new("a.b.c.d.e.f.g.h.i.j.k.l");
        assert_eq!(long_scope.len(), 8);
        assert_eq!(long_scope.build_string(), "a.b.c.d.e.f.g.h");
    }

    #[test]
    fn atom_extraction() {
        let scope = Scope::new("source.rust.meta");

        assert_ne!(scope.atom_at(0), 0);
        assert_ne!(scope.atom_at(1), 0);
        assert_ne!(scope.atom_at(2), 0);
        assert_eq!(scope.atom_at(3), 0);
        assert_eq!(scope.atom_at(7), 0);
    }

    #[test]
    fn serializes_as_dotted_string() {
        let scope = Scope::new("keyword.control.rust");
        let json = serde_json::to_string(&scope).unwrap();
        assert_eq!(json, "\"keyword.control.rust\"");

        let back: Scope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, scope);
    }

    #[test]
    fn scope_equality() {
        let scope1 = Scope::new("source.rust.meta");
        let scope2 = Scope::new("source.rust.meta");
        let scope3 = Scope::new("source.rust");

        assert_eq!(scope1, scope2);
        assert_ne!(scope1, scope3);
    }
}
