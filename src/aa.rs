// SPDX-License-Identifier: BSD-3-Clause
//! Loop-aware alias oracle stack.
//!
//! Individual oracles implement [`LoopAa`] and answer what they can;
//! everything they cannot answer falls through to the next oracle in the
//! stack. The stack is sorted by [`SchedulingPreference`], cheapest and
//! most precise first, and always bottoms out in [`NoLoopAa`], which
//! answers every query conservatively.
//!
//! Queries are loop-aware: `alias(a, Before, b, scope)` asks whether `a`
//! in one iteration of `scope` may collide with `b` in a later one.
//! Intra-iteration queries use [`TemporalRelation::Same`].

pub mod basic;
pub mod global;
pub mod points_to;

use std::ops::BitAnd;

use tracing::trace;

use crate::ir::{FuncId, InstId, LoopId, Module, Opcode, ValueRef};

/// Iteration relation between the two sides of a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TemporalRelation {
    /// First pointer in an earlier iteration than the second.
    Before,
    /// Both in the same iteration (or no loop scope at all).
    Same,
    /// First pointer in a later iteration than the second.
    After,
}

impl TemporalRelation {
    /// The relation seen from the other operand's side. Oracles use this
    /// to canonicalize, so they only implement one direction.
    pub fn rev(self) -> Self {
        match self {
            TemporalRelation::Before => TemporalRelation::After,
            TemporalRelation::Same => TemporalRelation::Same,
            TemporalRelation::After => TemporalRelation::Before,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AliasResult {
    NoAlias,
    MayAlias,
    MustAlias,
}

/// Mod/ref facts as a two-bit lattice: bit 0 is "reads", bit 1 is
/// "writes". Combining chained answers is bitwise intersection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModRefResult {
    NoModRef,
    Ref,
    Mod,
    ModRef,
}

impl ModRefResult {
    fn bits(self) -> u8 {
        match self {
            ModRefResult::NoModRef => 0,
            ModRefResult::Ref => 1,
            ModRefResult::Mod => 2,
            ModRefResult::ModRef => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => ModRefResult::NoModRef,
            1 => ModRefResult::Ref,
            2 => ModRefResult::Mod,
            _ => ModRefResult::ModRef,
        }
    }
}

impl BitAnd for ModRefResult {
    type Output = ModRefResult;

    fn bitand(self, rhs: Self) -> Self {
        ModRefResult::from_bits(self.bits() & rhs.bits())
    }
}

/// Where an oracle wants to sit in the stack. Higher runs earlier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SchedulingPreference {
    Bottom,
    Low,
    Normal,
    High,
    Top,
}

/// A pointer with the byte size of the access through it. Size 0 means
/// unknown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PtrQuery {
    pub ptr: ValueRef,
    pub size: u64,
}

impl PtrQuery {
    pub fn new(ptr: ValueRef, size: u64) -> Self {
        PtrQuery { ptr, size }
    }
}

/// An instruction named from outside its function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InstRef {
    pub func: FuncId,
    pub inst: InstId,
}

/// The loop a temporal query ranges over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LoopScope {
    pub func: FuncId,
    pub loop_id: LoopId,
}

/// One member of the alias oracle stack. Default implementations answer
/// nothing, so an oracle only overrides the queries it understands.
pub trait LoopAa {
    fn name(&self) -> &'static str;

    fn preference(&self) -> SchedulingPreference {
        SchedulingPreference::Normal
    }

    /// Called whenever the stack's membership changes, so oracles that
    /// cache chain-dependent results can drop them.
    fn stack_changed(&mut self) {}

    fn alias(
        &self,
        module: &Module,
        a: PtrQuery,
        rel: TemporalRelation,
        b: PtrQuery,
        scope: Option<LoopScope>,
    ) -> AliasResult {
        let _ = (module, a, rel, b, scope);
        AliasResult::MayAlias
    }

    /// Can this oracle prove the pointer only ever refers to memory that
    /// is never written?
    fn points_to_constant_memory(&self, module: &Module, ptr: PtrQuery) -> bool {
        let _ = (module, ptr);
        false
    }

    /// How a call may touch the given memory.
    fn modref_call(
        &self,
        module: &Module,
        call: InstRef,
        rel: TemporalRelation,
        mem: PtrQuery,
        scope: Option<LoopScope>,
    ) -> ModRefResult {
        let _ = (module, call, rel, mem, scope);
        ModRefResult::ModRef
    }
}

/// The conservative floor of the stack: everything may alias, every call
/// may do anything. Present so a chain walk always terminates in an
/// answer rather than in a missing case.
pub struct NoLoopAa;

impl LoopAa for NoLoopAa {
    fn name(&self) -> &'static str {
        "no-loop-aa"
    }

    fn preference(&self) -> SchedulingPreference {
        SchedulingPreference::Bottom
    }
}

/// Ordered registry of oracles.
pub struct AaStack<'a> {
    oracles: Vec<Box<dyn LoopAa + 'a>>,
}

impl Default for AaStack<'_> {
    fn default() -> Self {
        AaStack {
            oracles: vec![Box::new(NoLoopAa)],
        }
    }
}

impl<'a> AaStack<'a> {
    /// A stack holding only the conservative floor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an oracle at the position its preference asks for. Among
    /// equal preferences, earlier registration runs first.
    pub fn register(&mut self, oracle: Box<dyn LoopAa + 'a>) {
        let pref = oracle.preference();
        let at = self
            .oracles
            .iter()
            .position(|o| o.preference() < pref)
            .unwrap_or(self.oracles.len());
        self.oracles.insert(at, oracle);
        self.notify();
    }

    /// Removes the first oracle with the given name.
    pub fn unregister(&mut self, name: &str) -> Option<Box<dyn LoopAa + 'a>> {
        let at = self.oracles.iter().position(|o| o.name() == name)?;
        let removed = self.oracles.remove(at);
        self.notify();
        Some(removed)
    }

    fn notify(&mut self) {
        for o in &mut self.oracles {
            o.stack_changed();
        }
    }

    pub fn oracle_names(&self) -> Vec<&'static str> {
        self.oracles.iter().map(|o| o.name()).collect()
    }

    /// Chained alias query: the first definitive answer wins.
    pub fn alias(
        &self,
        module: &Module,
        a: PtrQuery,
        rel: TemporalRelation,
        b: PtrQuery,
        scope: Option<LoopScope>,
    ) -> AliasResult {
        for o in &self.oracles {
            let r = o.alias(module, a, rel, b, scope);
            if r != AliasResult::MayAlias {
                trace!(oracle = o.name(), ?r, "alias query resolved");
                return r;
            }
        }
        AliasResult::MayAlias
    }

    /// How `inst` may touch the memory at `mem`. Loads and stores reduce
    /// to alias queries on their pointer operand; calls are the meet of
    /// every oracle's answer.
    pub fn modref(
        &self,
        module: &Module,
        inst: InstRef,
        rel: TemporalRelation,
        mem: PtrQuery,
        scope: Option<LoopScope>,
    ) -> ModRefResult {
        let f = module.function(inst.func);
        match &f.inst(inst.inst).opcode {
            Opcode::Load { ptr } => {
                let Some(p) = module.value_ref(inst.func, *ptr) else {
                    return ModRefResult::Ref;
                };
                let size = self.access_size(module, inst);
                match self.alias(module, PtrQuery::new(p, size), rel, mem, scope) {
                    AliasResult::NoAlias => ModRefResult::NoModRef,
                    _ => ModRefResult::Ref,
                }
            }
            Opcode::Store { ptr, .. } => {
                let Some(p) = module.value_ref(inst.func, *ptr) else {
                    return ModRefResult::Mod;
                };
                let size = self.access_size(module, inst);
                match self.alias(module, PtrQuery::new(p, size), rel, mem, scope) {
                    AliasResult::NoAlias => ModRefResult::NoModRef,
                    _ => ModRefResult::Mod,
                }
            }
            Opcode::Call { .. } => {
                let mut acc = ModRefResult::ModRef;
                for o in &self.oracles {
                    acc = acc & o.modref_call(module, inst, rel, mem, scope);
                    if acc == ModRefResult::NoModRef {
                        trace!(oracle = o.name(), "call proved NoModRef");
                        break;
                    }
                }
                acc
            }
            // Everything else touches registers only.
            _ => ModRefResult::NoModRef,
        }
    }

    /// May `a` touch memory that `b` reads or writes? Reduces `b` to its
    /// memory footprint where one exists.
    pub fn modref_insts(
        &self,
        module: &Module,
        a: InstRef,
        rel: TemporalRelation,
        b: InstRef,
        scope: Option<LoopScope>,
    ) -> ModRefResult {
        let fb = module.function(b.func);
        match &fb.inst(b.inst).opcode {
            Opcode::Load { ptr } | Opcode::Store { ptr, .. } => {
                match module.value_ref(b.func, *ptr) {
                    Some(p) => {
                        let size = self.access_size(module, b);
                        self.modref(module, a, rel, PtrQuery::new(p, size), scope)
                    }
                    None => self.conservative_footprint(module, a),
                }
            }
            // A call's footprint is not a single pointer. Answer only
            // when `a` provably touches no memory at all.
            Opcode::Call { .. } => self.conservative_footprint(module, a),
            _ => ModRefResult::NoModRef,
        }
    }

    /// May `a` in one iteration of the scoped loop write memory that `b`
    /// touches in a later iteration? This is the question a loop
    /// parallelizer asks per instruction pair.
    pub fn may_mod_inter_iteration(
        &self,
        module: &Module,
        a: InstRef,
        b: InstRef,
        scope: LoopScope,
    ) -> bool {
        matches!(
            self.modref_insts(module, a, TemporalRelation::Before, b, Some(scope)),
            ModRefResult::Mod | ModRefResult::ModRef
        )
    }

    /// True when any oracle proves the pointer refers only to read-only
    /// memory.
    pub fn points_to_constant_memory(&self, module: &Module, ptr: PtrQuery) -> bool {
        self.oracles
            .iter()
            .any(|o| o.points_to_constant_memory(module, ptr))
    }

    fn conservative_footprint(&self, module: &Module, a: InstRef) -> ModRefResult {
        match &module.function(a.func).inst(a.inst).opcode {
            Opcode::Load { .. } => ModRefResult::Ref,
            Opcode::Store { .. } => ModRefResult::Mod,
            Opcode::Call { .. } => ModRefResult::ModRef,
            _ => ModRefResult::NoModRef,
        }
    }

    /// Byte size of the access a load or store performs, 0 if unknown.
    pub fn access_size(&self, module: &Module, inst: InstRef) -> u64 {
        let f = module.function(inst.func);
        let i = f.inst(inst.inst);
        match &i.opcode {
            Opcode::Load { .. } => module.layout.size_of(&module.types, i.ty),
            Opcode::Store { ptr, .. } => module
                .pointee_ty(inst.func, *ptr)
                .map(|t| module.layout.size_of(&module.types, t))
                .unwrap_or(0),
            _ => 0,
        }
    }
}
