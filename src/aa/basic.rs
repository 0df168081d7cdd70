// SPDX-License-Identifier: BSD-3-Clause
//! Pointer-arithmetic alias oracle.
//!
//! Decomposes each pointer into `base + constant + Σ var·scale` by
//! walking GEP and cast chains, then reasons about the difference of the
//! two decompositions. Disambiguates:
//!
//!  * same base, constant offsets far enough apart for the access sizes,
//!  * same base, unknown indices whose scales share a divisor that the
//!    constant remainder cannot bridge (the `A[i][1]` vs `A[j][0]` case),
//!  * distinct identified bases (allocas, globals, allocator calls),
//!  * phi and select pointers, argument by argument.
//!
//! Cross-iteration queries require the base (and any cancelled index) to
//! be invariant in the scoped loop; anything else defers to the rest of
//! the stack.

use rustc_hash::FxHashSet;

use crate::aa::{
    AliasResult, LoopAa, LoopScope, PtrQuery, SchedulingPreference, TemporalRelation,
};
use crate::config::AllocRegistry;
use crate::ir::{
    BinOp, Callee, FuncId, Module, Opcode, Operand, Type, TypeId, ValueRef,
};

/// Budget for def-chain walking; deep pointer arithmetic past this point
/// falls back to MayAlias.
const MAX_DEPTH: usize = 6;

pub struct BasicAa {
    registry: AllocRegistry,
}

/// One unknown-index term of a decomposed pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct VarTerm {
    var: ValueRef,
    scale: i64,
}

/// `base + offset + Σ vars`. `exact` is false when some step could not
/// be typed or folded, in which case only `base` identity is usable.
#[derive(Clone, Debug)]
struct Decomposed {
    base: Option<ValueRef>,
    offset: i64,
    vars: Vec<VarTerm>,
    exact: bool,
}

type Visited = FxHashSet<(ValueRef, ValueRef)>;

impl BasicAa {
    pub fn new(registry: AllocRegistry) -> Self {
        BasicAa { registry }
    }

    fn alias_common(
        &self,
        module: &Module,
        a: PtrQuery,
        rel: TemporalRelation,
        b: PtrQuery,
        scope: Option<LoopScope>,
        visited: &mut Visited,
    ) -> AliasResult {
        if a.ptr == b.ptr && self.invariant_in(module, scope, a.ptr) {
            // Identical loop-invariant addresses, in any iteration pair.
            return AliasResult::MustAlias;
        }
        if a.ptr == b.ptr && rel == TemporalRelation::Same {
            return AliasResult::MustAlias;
        }
        // Order-free key so the swapped query hits the same entry.
        let key = if a.ptr <= b.ptr {
            (a.ptr, b.ptr)
        } else {
            (b.ptr, a.ptr)
        };
        if !visited.insert(key) {
            // Cycle through phi arguments.
            return AliasResult::MayAlias;
        }

        if let Some(r) = self.alias_phi_like(module, a, rel, b, scope, visited) {
            return r;
        }
        if let Some(r) = self.alias_phi_like(module, b, rel.rev(), a, scope, visited) {
            return r;
        }

        let da = self.decompose(module, a.ptr, MAX_DEPTH);
        let db = self.decompose(module, b.ptr, MAX_DEPTH);
        let (Some(base_a), Some(base_b)) = (da.base, db.base) else {
            return AliasResult::MayAlias;
        };

        if base_a != base_b {
            return self.alias_distinct_bases(module, base_a, base_b);
        }
        if !da.exact || !db.exact {
            return AliasResult::MayAlias;
        }
        if rel != TemporalRelation::Same && !self.invariant_in(module, scope, base_a) {
            // The base itself changes between iterations.
            return AliasResult::MayAlias;
        }

        // Difference of the two offset expressions. Terms with the same
        // variable cancel only when that variable denotes the same value
        // on both sides of the temporal relation.
        let may_cancel = |v: ValueRef| {
            rel == TemporalRelation::Same || self.invariant_in(module, scope, v)
        };
        let mut terms: Vec<VarTerm> = Vec::new();
        for t in &da.vars {
            terms.push(*t);
        }
        for t in &db.vars {
            terms.push(VarTerm {
                var: t.var,
                scale: -t.scale,
            });
        }
        let mut reduced: Vec<VarTerm> = Vec::new();
        for t in terms {
            if may_cancel(t.var) {
                if let Some(existing) = reduced.iter_mut().find(|e| e.var == t.var) {
                    existing.scale += t.scale;
                    continue;
                }
            }
            reduced.push(t);
        }
        reduced.retain(|t| t.scale != 0);

        let delta = da.offset - db.offset;
        if reduced.is_empty() {
            return Self::alias_constant_delta(delta, a.size, b.size);
        }

        // addr(a) - addr(b) ≡ delta (mod g) whatever the index values.
        let g = reduced
            .iter()
            .fold(0i64, |acc, t| gcd(acc, t.scale.unsigned_abs() as i64));
        if g > 1 && a.size > 0 && b.size > 0 {
            let r = delta.rem_euclid(g);
            if r >= b.size as i64 && g - r >= a.size as i64 {
                return AliasResult::NoAlias;
            }
        }
        AliasResult::MayAlias
    }

    fn alias_constant_delta(delta: i64, size_a: u64, size_b: u64) -> AliasResult {
        if delta == 0 {
            return AliasResult::MustAlias;
        }
        if delta > 0 && size_b > 0 && delta >= size_b as i64 {
            return AliasResult::NoAlias;
        }
        if delta < 0 && size_a > 0 && -delta >= size_a as i64 {
            return AliasResult::NoAlias;
        }
        AliasResult::MayAlias
    }

    /// Argument-wise recursion through phi and select pointers. `None`
    /// when `a` is neither.
    fn alias_phi_like(
        &self,
        module: &Module,
        a: PtrQuery,
        rel: TemporalRelation,
        b: PtrQuery,
        scope: Option<LoopScope>,
        visited: &mut Visited,
    ) -> Option<AliasResult> {
        let ValueRef::Inst(f, i) = a.ptr else {
            return None;
        };
        let args: Vec<Operand> = match &module.function(f).inst(i).opcode {
            Opcode::Phi { incoming } => incoming.iter().map(|(_, v)| *v).collect(),
            Opcode::Select {
                on_true, on_false, ..
            } => vec![*on_true, *on_false],
            _ => return None,
        };
        let mut merged: Option<AliasResult> = None;
        for arg in args {
            let Some(v) = module.value_ref(f, arg) else {
                return Some(AliasResult::MayAlias);
            };
            let r = self.alias_common(module, PtrQuery::new(v, a.size), rel, b, scope, visited);
            merged = Some(match merged {
                None => r,
                Some(prev) if prev == r => r,
                Some(_) => return Some(AliasResult::MayAlias),
            });
            if merged == Some(AliasResult::MayAlias) {
                return merged;
            }
        }
        merged
    }

    fn alias_distinct_bases(
        &self,
        module: &Module,
        base_a: ValueRef,
        base_b: ValueRef,
    ) -> AliasResult {
        let ia = self.is_identified(module, base_a);
        let ib = self.is_identified(module, base_b);
        if ia && ib {
            return AliasResult::NoAlias;
        }
        // Null bases cannot overlap real objects.
        if (base_a == ValueRef::Null && ib) || (base_b == ValueRef::Null && ia) {
            return AliasResult::NoAlias;
        }
        AliasResult::MayAlias
    }

    /// An identified object has a unique address: a stack slot, a global,
    /// or the result of a known allocator.
    fn is_identified(&self, module: &Module, v: ValueRef) -> bool {
        match v {
            ValueRef::Global(_) => true,
            ValueRef::Inst(f, i) => match &module.function(f).inst(i).opcode {
                Opcode::Alloca { .. } => true,
                Opcode::Call {
                    callee: Callee::Direct(target),
                    ..
                } => {
                    let callee = module.function(*target);
                    callee.is_declaration && self.registry.is_allocator(&callee.name)
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// A value is invariant in the scoped loop when it is defined outside
    /// it. Without a scope every value is trivially invariant.
    fn invariant_in(&self, module: &Module, scope: Option<LoopScope>, v: ValueRef) -> bool {
        let Some(scope) = scope else { return true };
        let ValueRef::Inst(f, i) = v else {
            return true;
        };
        if f != scope.func {
            return true;
        }
        let func = module.function(f);
        let info = &func.loops[scope.loop_id.index()];
        match func.block_of(i) {
            Some(b) => !info.contains(b),
            None => false,
        }
    }

    /// Walks GEP and cast chains down to an underlying base, folding
    /// constant offsets and collecting variable-index terms.
    fn decompose(&self, module: &Module, v: ValueRef, budget: usize) -> Decomposed {
        let mut out = Decomposed {
            base: None,
            offset: 0,
            vars: Vec::new(),
            exact: true,
        };
        let mut cur = v;
        for _ in 0..budget {
            let ValueRef::Inst(f, i) = cur else { break };
            match &module.function(f).inst(i).opcode {
                Opcode::Cast { value, .. } => {
                    match module.value_ref(f, *value) {
                        Some(next) => cur = next,
                        None => {
                            out.exact = false;
                            break;
                        }
                    }
                }
                Opcode::Gep { base, indices } => {
                    if !self.fold_gep(module, f, *base, indices, &mut out) {
                        out.exact = false;
                    }
                    match module.value_ref(f, *base) {
                        Some(next) => cur = next,
                        None => {
                            out.exact = false;
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
        // A chain longer than the budget leaves `cur` on a gep or cast;
        // its arithmetic was not folded.
        if let ValueRef::Inst(f, i) = cur {
            if matches!(
                module.function(f).inst(i).opcode,
                Opcode::Gep { .. } | Opcode::Cast { .. }
            ) {
                out.exact = false;
            }
        }
        out.base = Some(cur);
        out
    }

    /// Folds one GEP's indices into `out`. Returns false when the offset
    /// could not be computed exactly.
    fn fold_gep(
        &self,
        module: &Module,
        f: FuncId,
        base: Operand,
        indices: &[Operand],
        out: &mut Decomposed,
    ) -> bool {
        let Some(pointee) = module.pointee_ty(f, base) else {
            return false;
        };
        let types = &module.types;
        let layout = &module.layout;
        let mut cur_ty: TypeId = pointee;
        for (n, idx) in indices.iter().enumerate() {
            let scale = if n == 0 {
                layout.size_of(types, pointee) as i64
            } else {
                match types.get(cur_ty).clone() {
                    Type::Struct { fields } => {
                        // Struct indices must be constant.
                        match idx.as_const() {
                            Some(c) if (c as usize) < fields.len() => {
                                out.offset +=
                                    layout.struct_offset(types, cur_ty, c as usize) as i64;
                                cur_ty = fields[c as usize];
                                continue;
                            }
                            _ => return false,
                        }
                    }
                    Type::Array { elem, .. } => {
                        cur_ty = elem;
                        layout.size_of(types, elem) as i64
                    }
                    _ => return false,
                }
            };
            match idx.as_const() {
                Some(c) => out.offset += c * scale,
                None => {
                    let Some(idx_v) = module.value_ref(f, *idx) else {
                        return false;
                    };
                    let (var, lin_scale, lin_off) =
                        linear_expression(module, f, idx_v, MAX_DEPTH);
                    out.offset += lin_off * scale;
                    if lin_scale != 0 {
                        out.vars.push(VarTerm {
                            var,
                            scale: lin_scale * scale,
                        });
                    }
                }
            }
        }
        true
    }
}

/// Rewrites an integer value as `var * scale + offset` through constant
/// add/sub/mul/shl chains. The fallback is the value itself with scale 1.
fn linear_expression(module: &Module, f: FuncId, v: ValueRef, budget: usize) -> (ValueRef, i64, i64) {
    if budget == 0 {
        return (v, 1, 0);
    }
    let ValueRef::Inst(_, i) = v else {
        return (v, 1, 0);
    };
    let inst = &module.function(f).inst(i).opcode;
    let Opcode::Bin { op, lhs, rhs } = inst else {
        if let Opcode::Cast { value, .. } = inst {
            if let Some(inner) = module.value_ref(f, *value) {
                return linear_expression(module, f, inner, budget - 1);
            }
        }
        return (v, 1, 0);
    };
    let recurse = |side: Operand| -> Option<(ValueRef, i64, i64)> {
        let inner = module.value_ref(f, side)?;
        Some(linear_expression(module, f, inner, budget - 1))
    };
    match (op, lhs.as_const(), rhs.as_const()) {
        (BinOp::Add, _, Some(c)) => {
            if let Some((var, s, o)) = recurse(*lhs) {
                return (var, s, o + c);
            }
        }
        (BinOp::Add, Some(c), _) => {
            if let Some((var, s, o)) = recurse(*rhs) {
                return (var, s, o + c);
            }
        }
        (BinOp::Sub, _, Some(c)) => {
            if let Some((var, s, o)) = recurse(*lhs) {
                return (var, s, o - c);
            }
        }
        (BinOp::Mul, _, Some(c)) => {
            if let Some((var, s, o)) = recurse(*lhs) {
                return (var, s * c, o * c);
            }
        }
        (BinOp::Mul, Some(c), _) => {
            if let Some((var, s, o)) = recurse(*rhs) {
                return (var, s * c, o * c);
            }
        }
        (BinOp::Shl, _, Some(c)) if (0..63).contains(&c) => {
            if let Some((var, s, o)) = recurse(*lhs) {
                return (var, s << c, o << c);
            }
        }
        _ => {}
    }
    (v, 1, 0)
}

fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl LoopAa for BasicAa {
    fn name(&self) -> &'static str {
        "basic-aa"
    }

    fn preference(&self) -> SchedulingPreference {
        SchedulingPreference::Top
    }

    fn alias(
        &self,
        module: &Module,
        a: PtrQuery,
        rel: TemporalRelation,
        b: PtrQuery,
        scope: Option<LoopScope>,
    ) -> AliasResult {
        if rel != TemporalRelation::Same && scope.is_none() {
            return AliasResult::MayAlias;
        }
        let mut visited = Visited::default();
        self.alias_common(module, a, rel, b, scope, &mut visited)
    }
}
