// SPDX-License-Identifier: BSD-3-Clause
//! Analysis options and the allocator registry.

use regex::RegexSet;
use serde::{Deserialize, Serialize};

/// Precision/generality knobs shared by the analyses. Defaults favor
/// soundness over precision.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Options {
    /// Treat externally-visible globals as if the module were the whole
    /// program. Unsound for libraries, useful for whole-program builds.
    pub full_universal: bool,
    /// Answer register (non-memory) dependence queries with "no
    /// dependence" instead of computing them.
    pub skip_register_dependence: bool,
    /// Do not propagate points-to facts through calls to defined
    /// functions; every call is treated like an external one.
    pub skip_internal_calls: bool,
}

/// How an allocator sizes its result, used when a call site creates a
/// heap object and we want an element count for pattern analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocKind {
    /// `malloc`-like: one size argument at the given position.
    Sized { size_arg: u32 },
    /// `calloc`-like: count and element size arguments.
    Counted { count_arg: u32, size_arg: u32 },
    /// `realloc`-like: reuses an existing object; the pointer argument
    /// aliases the result.
    Resize { ptr_arg: u32, size_arg: u32 },
    /// Size not recoverable from the call site.
    Opaque,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct AllocEntry {
    pattern: String,
    kind: AllocKind,
}

/// Which external functions return fresh heap memory.
///
/// Matching is by anchored regex over the callee name, so one entry can
/// cover a family like the mangled C++ `operator new` variants.
#[derive(Clone, Debug)]
pub struct AllocRegistry {
    entries: Vec<AllocEntry>,
    matcher: RegexSet,
}

impl Default for AllocRegistry {
    fn default() -> Self {
        let entries = vec![
            AllocEntry {
                pattern: "malloc".to_owned(),
                kind: AllocKind::Sized { size_arg: 0 },
            },
            AllocEntry {
                pattern: "calloc".to_owned(),
                kind: AllocKind::Counted {
                    count_arg: 0,
                    size_arg: 1,
                },
            },
            AllocEntry {
                pattern: "realloc".to_owned(),
                kind: AllocKind::Resize {
                    ptr_arg: 0,
                    size_arg: 1,
                },
            },
            // operator new / operator new[]
            AllocEntry {
                pattern: "_Znwm|_Znam".to_owned(),
                kind: AllocKind::Sized { size_arg: 0 },
            },
        ];
        // Building from literal patterns can't fail.
        Self::from_entries(entries).unwrap_or_else(|_| AllocRegistry {
            entries: Vec::new(),
            matcher: RegexSet::empty(),
        })
    }
}

impl AllocRegistry {
    fn from_entries(entries: Vec<AllocEntry>) -> Result<Self, regex::Error> {
        let matcher = RegexSet::new(entries.iter().map(|e| format!("^(?:{})$", e.pattern)))?;
        Ok(AllocRegistry { entries, matcher })
    }

    /// Registers a pattern of additional allocator names.
    pub fn add(&mut self, pattern: &str, kind: AllocKind) -> Result<(), regex::Error> {
        let mut entries = self.entries.clone();
        entries.push(AllocEntry {
            pattern: pattern.to_owned(),
            kind,
        });
        let rebuilt = Self::from_entries(entries)?;
        *self = rebuilt;
        Ok(())
    }

    /// Loads extra entries from a JSON array of `{pattern, kind}` pairs.
    pub fn extend_from_json(&mut self, json: &str) -> anyhow::Result<()> {
        let extra: Vec<AllocEntry> = serde_json::from_str(json)?;
        let mut entries = self.entries.clone();
        entries.extend(extra);
        *self = Self::from_entries(entries)?;
        Ok(())
    }

    pub fn classify(&self, name: &str) -> Option<AllocKind> {
        self.matcher
            .matches(name)
            .iter()
            .next()
            .map(|i| self.entries[i].kind)
    }

    pub fn is_allocator(&self, name: &str) -> bool {
        self.matcher.is_match(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_names() {
        let reg = AllocRegistry::default();
        assert!(reg.is_allocator("malloc"));
        assert!(reg.is_allocator("_Znwm"));
        assert!(!reg.is_allocator("memcpy"));
        assert!(!reg.is_allocator("mallocx"));
        assert_eq!(
            reg.classify("calloc"),
            Some(AllocKind::Counted {
                count_arg: 0,
                size_arg: 1
            })
        );
    }

    #[test]
    fn custom_entry() {
        let mut reg = AllocRegistry::default();
        reg.add("xmalloc", AllocKind::Sized { size_arg: 0 }).unwrap();
        assert!(reg.is_allocator("xmalloc"));
    }
}
