// SPDX-License-Identifier: BSD-3-Clause
//! Alias oracle backed by the solved points-to sets.
//!
//! Cheap and whole-module: two pointers with resolved, disjoint
//! points-to sets cannot alias in any iteration pair, so temporal
//! relation and loop scope are irrelevant here. Calls to defined
//! functions are checked against the callee's transitive memory
//! footprint.

use crate::aa::{
    AliasResult, InstRef, LoopAa, LoopScope, ModRefResult, PtrQuery, SchedulingPreference,
    TemporalRelation,
};
use crate::analysis::points_to::{AllocSite, PointsToAnalysis};
use crate::ir::Module;

pub struct PointsToAa<'a> {
    pa: &'a PointsToAnalysis,
}

impl<'a> PointsToAa<'a> {
    pub fn new(pa: &'a PointsToAnalysis) -> Self {
        PointsToAa { pa }
    }
}

impl LoopAa for PointsToAa<'_> {
    fn name(&self) -> &'static str {
        "points-to-aa"
    }

    /// Runs after the arithmetic oracles: set intersection is coarse but
    /// catches what offset reasoning cannot.
    fn preference(&self) -> SchedulingPreference {
        SchedulingPreference::Low
    }

    fn alias(
        &self,
        _module: &Module,
        a: PtrQuery,
        _rel: TemporalRelation,
        b: PtrQuery,
        _scope: Option<LoopScope>,
    ) -> AliasResult {
        if self.pa.is_no_alias(a.ptr, a.size, b.ptr, b.size) {
            AliasResult::NoAlias
        } else {
            AliasResult::MayAlias
        }
    }

    fn points_to_constant_memory(&self, module: &Module, ptr: PtrQuery) -> bool {
        let pts = self.pa.points_to(ptr.ptr);
        !pts.is_empty()
            && pts.iter().all(|o| match self.pa.object(*o).site {
                AllocSite::Global(g) => module.global(g).is_const,
                _ => false,
            })
    }

    fn modref_call(
        &self,
        module: &Module,
        call: InstRef,
        _rel: TemporalRelation,
        mem: PtrQuery,
        _scope: Option<LoopScope>,
    ) -> ModRefResult {
        let Some(used) = self.pa.used_memory(module, call.func, call.inst) else {
            return ModRefResult::ModRef;
        };
        let pts = self.pa.points_to(mem.ptr);
        if !pts.is_empty() && pts.is_disjoint(used) {
            ModRefResult::NoModRef
        } else {
            ModRefResult::ModRef
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aa::AaStack;
    use crate::config::{AllocRegistry, Options};
    use crate::ir::build::ModuleBuilder;
    use crate::ir::{Operand, Type, ValueRef};

    #[test]
    fn disjoint_sets_disambiguate() {
        let mut b = ModuleBuilder::new();
        let i32t = b.ty(Type::Int(32));
        let p32 = b.ptr_to(i32t);
        let void = b.ty(Type::Void);
        let mut f = b.define("f", &[], void);
        let fid = f.id();
        f.block("entry");
        let x = f.alloca(p32, i32t);
        let y = f.alloca(p32, i32t);
        f.ret(None);
        let m = b.finish().unwrap();
        let pa = PointsToAnalysis::run(&m, &AllocRegistry::default(), &Options::default());
        let aa = PointsToAa::new(&pa);
        let qx = PtrQuery::new(ValueRef::Inst(fid, x), 4);
        let qy = PtrQuery::new(ValueRef::Inst(fid, y), 4);
        assert_eq!(
            aa.alias(&m, qx, TemporalRelation::Same, qy, None),
            AliasResult::NoAlias
        );
        assert_eq!(
            aa.alias(&m, qx, TemporalRelation::Same, qx, None),
            AliasResult::MayAlias
        );
    }

    #[test]
    fn constant_memory_needs_const_globals() {
        let mut b = ModuleBuilder::new();
        let i32t = b.ty(Type::Int(32));
        let p32 = b.ptr_to(i32t);
        let void = b.ty(Type::Void);
        let table = b.const_global("table", i32t, true);
        let cell = b.global("cell", i32t, true);
        let mut f = b.define("f", &[], void);
        let fid = f.id();
        f.block("entry");
        // A pointer that may be either global is constant only if both
        // are.
        let either = f.select(
            p32,
            Operand::Const(1),
            Operand::Global(table),
            Operand::Global(cell),
        );
        f.ret(None);
        let m = b.finish().unwrap();
        let pa = PointsToAnalysis::run(&m, &AllocRegistry::default(), &Options::default());
        let mut stack = AaStack::new();
        stack.register(Box::new(PointsToAa::new(&pa)));
        assert!(stack.points_to_constant_memory(&m, PtrQuery::new(ValueRef::Global(table), 4)));
        assert!(!stack.points_to_constant_memory(&m, PtrQuery::new(ValueRef::Global(cell), 4)));
        assert!(!stack.points_to_constant_memory(&m, PtrQuery::new(ValueRef::Inst(fid, either), 4)));
    }

    /// A callee that only touches its own global proves NoModRef against
    /// an unrelated alloca, through the full stack.
    #[test]
    fn call_footprint_disambiguates() {
        let mut b = ModuleBuilder::new();
        let i32t = b.ty(Type::Int(32));
        let p32 = b.ptr_to(i32t);
        let void = b.ty(Type::Void);
        let g = b.global("g", i32t, true);
        let mut leaf = b.define("leaf", &[], void);
        let leaf_id = leaf.id();
        leaf.block("entry");
        leaf.store(Operand::Global(g), Operand::Const(1));
        leaf.ret(None);
        let mut f = b.define("f", &[], void);
        let fid = f.id();
        f.block("entry");
        let x = f.alloca(p32, i32t);
        let call = f.call(void, leaf_id, vec![]);
        let st = f.store(Operand::Inst(x), Operand::Const(2));
        f.ret(None);
        let m = b.finish().unwrap();
        let pa = PointsToAnalysis::run(&m, &AllocRegistry::default(), &Options::default());
        let mut stack = AaStack::new();
        stack.register(Box::new(PointsToAa::new(&pa)));

        let callr = InstRef {
            func: fid,
            inst: call,
        };
        // The call never touches x.
        assert_eq!(
            stack.modref(
                &m,
                callr,
                TemporalRelation::Same,
                PtrQuery::new(ValueRef::Inst(fid, x), 4),
                None
            ),
            ModRefResult::NoModRef
        );
        // But it does touch g.
        assert_eq!(
            stack.modref(
                &m,
                callr,
                TemporalRelation::Same,
                PtrQuery::new(ValueRef::Global(g), 4),
                None
            ),
            ModRefResult::ModRef
        );
        // Instruction-level: the call is independent of the store to x.
        assert_eq!(
            stack.modref_insts(
                &m,
                callr,
                TemporalRelation::Same,
                InstRef {
                    func: fid,
                    inst: st
                },
                None
            ),
            ModRefResult::NoModRef
        );
    }
}
