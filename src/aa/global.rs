// SPDX-License-Identifier: BSD-3-Clause
//! Alias oracle for globals that only ever hold fresh heap memory.
//!
//! A pointer-typed global is *exclusive* when every store to it stores
//! the result of a known allocator and its address never escapes to any
//! other use. Pointers loaded from two different exclusive globals can
//! then only alias if some allocation site feeds both, and a pointer
//! loaded from an exclusive global can never alias a stack slot or a
//! global's own storage.
//!
//! Externally-visible globals only qualify under
//! [`Options::full_universal`], since another module could store
//! anything into them.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::aa::{
    AliasResult, LoopAa, LoopScope, PtrQuery, SchedulingPreference, TemporalRelation,
};
use crate::config::{AllocRegistry, Options};
use crate::ir::{Callee, FuncId, GlobalId, InstId, Module, Opcode, Operand, ValueRef};

pub struct GlobalMallocAa {
    registry: AllocRegistry,
    exclusive: FxHashSet<GlobalId>,
    /// Allocator call sites whose results are stored into each global.
    sources: FxHashMap<GlobalId, FxHashSet<(FuncId, InstId)>>,
}

/// What a pointer resolves to for this oracle's purposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Source {
    /// Loaded from an exclusive global: some allocation owned by it.
    HeapOf(GlobalId),
    /// A direct allocator call result.
    HeapSite(FuncId, InstId),
    /// A stack slot or a global's own storage.
    Identified,
    Unknown,
}

impl GlobalMallocAa {
    pub fn build(module: &Module, registry: &AllocRegistry, opts: &Options) -> Self {
        let mut sources: FxHashMap<GlobalId, FxHashSet<(FuncId, InstId)>> = FxHashMap::default();
        let mut tainted: FxHashSet<GlobalId> = FxHashSet::default();

        let candidate = |g: GlobalId| {
            let global = module.global(g);
            module.types.get(global.ty).is_pointer()
                && (global.is_internal || opts.full_universal)
        };

        for (fi, f) in module.functions.iter().enumerate() {
            let fid = FuncId(fi as u32);
            for inst in &f.insts {
                match &inst.opcode {
                    Opcode::Load {
                        ptr: Operand::Global(_),
                    } => {}
                    Opcode::Store {
                        ptr: Operand::Global(g),
                        value,
                    } => {
                        match allocator_site(module, registry, fid, *value) {
                            Some(site) => {
                                sources.entry(*g).or_default().insert(site);
                            }
                            None => {
                                tainted.insert(*g);
                            }
                        }
                        // The stored value might itself be some global's
                        // address escaping.
                        if let Operand::Global(v) = value {
                            tainted.insert(*v);
                        }
                    }
                    other => {
                        // Any other appearance of a global's address
                        // (gep base, call argument, phi arm, stored
                        // value) lets it escape this oracle's model.
                        for op in inst_globals(other) {
                            tainted.insert(op);
                        }
                    }
                }
            }
        }

        let exclusive: FxHashSet<GlobalId> = sources
            .keys()
            .copied()
            .filter(|g| candidate(*g) && !tainted.contains(g))
            .collect();
        debug!(
            exclusive = exclusive.len(),
            tainted = tainted.len(),
            "exclusive-global scan finished"
        );
        GlobalMallocAa {
            registry: registry.clone(),
            exclusive,
            sources,
        }
    }

    pub fn is_exclusive(&self, g: GlobalId) -> bool {
        self.exclusive.contains(&g)
    }

    fn source_of(&self, module: &Module, v: ValueRef) -> Source {
        match strip_pointer(module, v) {
            ValueRef::Global(_) => Source::Identified,
            ValueRef::Inst(f, i) => match &module.function(f).inst(i).opcode {
                Opcode::Alloca { .. } => Source::Identified,
                Opcode::Load { ptr: Operand::Global(g) } if self.is_exclusive(*g) => {
                    Source::HeapOf(*g)
                }
                Opcode::Call { .. } => {
                    // Only allocator calls participate; other calls may
                    // return anything, including pointers we track.
                    match allocator_site(module, &self.registry, f, Operand::Inst(i)) {
                        Some((sf, si)) => Source::HeapSite(sf, si),
                        None => Source::Unknown,
                    }
                }
                _ => Source::Unknown,
            },
            _ => Source::Unknown,
        }
    }

    fn disjoint_sources(&self, a: GlobalId, b: GlobalId) -> bool {
        match (self.sources.get(&a), self.sources.get(&b)) {
            (Some(sa), Some(sb)) => sa.is_disjoint(sb),
            _ => false,
        }
    }
}

impl LoopAa for GlobalMallocAa {
    fn name(&self) -> &'static str {
        "global-malloc-aa"
    }

    fn preference(&self) -> SchedulingPreference {
        SchedulingPreference::Normal
    }

    fn alias(
        &self,
        module: &Module,
        a: PtrQuery,
        _rel: TemporalRelation,
        b: PtrQuery,
        _scope: Option<LoopScope>,
    ) -> AliasResult {
        let sa = self.source_of(module, a.ptr);
        let sb = self.source_of(module, b.ptr);
        match (sa, sb) {
            (Source::HeapOf(ga), Source::HeapOf(gb)) if ga != gb => {
                if self.disjoint_sources(ga, gb) {
                    AliasResult::NoAlias
                } else {
                    AliasResult::MayAlias
                }
            }
            // Exclusive heap memory versus a stack slot or global
            // storage.
            (Source::HeapOf(_), Source::Identified)
            | (Source::Identified, Source::HeapOf(_)) => AliasResult::NoAlias,
            // Versus a direct allocation: disjoint unless that site
            // feeds the global.
            (Source::HeapOf(g), Source::HeapSite(f, i))
            | (Source::HeapSite(f, i), Source::HeapOf(g)) => {
                if self
                    .sources
                    .get(&g)
                    .is_some_and(|s| !s.contains(&(f, i)))
                {
                    AliasResult::NoAlias
                } else {
                    AliasResult::MayAlias
                }
            }
            _ => AliasResult::MayAlias,
        }
    }
}

/// Globals whose address appears anywhere in an instruction's operands.
fn inst_globals(op: &Opcode) -> Vec<GlobalId> {
    op.operands()
        .into_iter()
        .filter_map(|o| match o {
            Operand::Global(g) => Some(g),
            _ => None,
        })
        .collect()
}

/// Follows casts from `value` to an allocator call site, if that is what
/// it is.
fn allocator_site(
    module: &Module,
    registry: &AllocRegistry,
    func: FuncId,
    value: Operand,
) -> Option<(FuncId, InstId)> {
    let mut cur = module.value_ref(func, value)?;
    for _ in 0..8 {
        let ValueRef::Inst(f, i) = cur else { return None };
        match &module.function(f).inst(i).opcode {
            Opcode::Cast { value, .. } => {
                cur = module.value_ref(f, *value)?;
            }
            Opcode::Call {
                callee: Callee::Direct(t),
                ..
            } => {
                let callee = module.function(*t);
                if callee.is_declaration && registry.is_allocator(&callee.name) {
                    return Some((f, i));
                }
                return None;
            }
            _ => return None,
        }
    }
    None
}

/// Strips geps and casts down to the base pointer.
fn strip_pointer(module: &Module, mut v: ValueRef) -> ValueRef {
    for _ in 0..8 {
        let ValueRef::Inst(f, i) = v else { break };
        let next = match &module.function(f).inst(i).opcode {
            Opcode::Gep { base, .. } => module.value_ref(f, *base),
            Opcode::Cast { value, .. } => module.value_ref(f, *value),
            _ => None,
        };
        match next {
            Some(n) => v = n,
            None => break,
        }
    }
    v
}
