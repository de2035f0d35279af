//! Symbol interning for O(1) name equality.
//!
//! Variable and argument names are interned once per process and compared by
//! pointer identity afterwards. The interpreter's binding cache, the
//! compiler's name tables, and the optimizer's environment model all rely on
//! `Symbol` equality being a pointer comparison.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A handle to an interned name.
///
/// Two `Symbol`s are equal iff they were produced by the same interner for
/// the same string content.
#[derive(Clone)]
pub struct Symbol {
    inner: Arc<str>,
}

impl Symbol {
    #[inline]
    fn new(s: Arc<str>) -> Self {
        Self { inner: s }
    }

    /// The name as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.inner
    }

    #[inline]
    fn ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }
}

impl PartialEq for Symbol {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr().hash(state);
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({:?})", self.as_str())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for Symbol {
    #[inline]
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<str> for Symbol {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for Symbol {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// Process-wide symbol table.
///
/// Interning the same name twice returns the same handle. The table is
/// append-only: handles stay valid for the lifetime of the process.
pub struct SymbolTable {
    symbols: RwLock<FxHashMap<Arc<str>, Symbol>>,
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            symbols: RwLock::new(FxHashMap::default()),
        }
    }

    /// Intern a name, returning its canonical handle.
    pub fn intern(&self, s: &str) -> Symbol {
        {
            let symbols = self.symbols.read();
            if let Some(interned) = symbols.get(s) {
                return interned.clone();
            }
        }

        let mut symbols = self.symbols.write();
        // Re-check: another caller may have raced us to the write lock.
        if let Some(interned) = symbols.get(s) {
            return interned.clone();
        }

        let arc: Arc<str> = s.into();
        let interned = Symbol::new(arc.clone());
        symbols.insert(arc, interned.clone());
        interned
    }

    /// Number of distinct names interned so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.read().is_empty()
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The global symbol table.
pub static SYMBOLS: std::sync::LazyLock<SymbolTable> = std::sync::LazyLock::new(SymbolTable::new);

/// Intern a name in the global table.
#[inline]
pub fn sym(s: &str) -> Symbol {
    SYMBOLS.intern(s)
}
