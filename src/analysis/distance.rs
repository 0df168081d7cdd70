// SPDX-License-Identifier: BSD-3-Clause
//! Iteration distance between two accesses of a simple loop.
//!
//! For two pointers inside a nest whose structure is determined, this
//! computes how many iterations of the innermost loop separate their
//! accesses to the same location. The result mirrors a three-way
//! convention:
//!
//!  * `(false, -1)` nothing is known, assume the accesses always alias,
//!  * `(false, 0)` provably independent, no distance exists,
//!  * `(true, k)` the first pointer reaches the second pointer's
//!    location `k` iterations later (`A[i]` vs `A[i+1]` gives 1,
//!    `A[i+1]` vs `A[i]` gives -1).

use rustc_hash::FxHashMap;

use crate::analysis::loops::{LoopNode, LoopState};
use crate::analysis::points_to::PointsToAnalysis;
use crate::ir::{BinOp, CastKind, Module, Opcode, Operand, Type, ValueRef};

const MAX_DEPTH: u32 = 6;

pub const UNKNOWN: (bool, i64) = (false, -1);
pub const INDEPENDENT: (bool, i64) = (false, 0);

pub struct DistanceAnalysis<'a> {
    module: &'a Module,
    pa: &'a PointsToAnalysis,
}

/// A pointer as an affine expression: `base + consts + Σ coeff · var`,
/// all in bytes.
struct Affine {
    base: ValueRef,
    consts: i64,
    terms: FxHashMap<ValueRef, i64>,
}

impl<'a> DistanceAnalysis<'a> {
    pub fn new(module: &'a Module, pa: &'a PointsToAnalysis) -> Self {
        DistanceAnalysis { module, pa }
    }

    /// Iteration distance from `ptr_a` to `ptr_b` inside `node`'s
    /// innermost loop. Sizes are access sizes in bytes.
    pub fn get_distance(
        &self,
        node: &LoopNode,
        ptr_a: Operand,
        size_a: u64,
        ptr_b: Operand,
        size_b: u64,
    ) -> (bool, i64) {
        if node.state != LoopState::StructureDetermined {
            return UNKNOWN;
        }
        let Some(level) = node.innermost() else {
            return UNKNOWN;
        };
        let indvar = ValueRef::Inst(node.func, level.indvar.phi);

        // Different objects never carry a dependence.
        let obj_a = self
            .module
            .value_ref(node.func, ptr_a)
            .and_then(|v| self.pa.unique_object(v));
        let obj_b = self
            .module
            .value_ref(node.func, ptr_b)
            .and_then(|v| self.pa.unique_object(v));
        if let (Some(a), Some(b)) = (obj_a, obj_b) {
            if a != b {
                return INDEPENDENT;
            }
        }

        let (Some(a), Some(b)) = (
            self.pointer_affine(node, ptr_a),
            self.pointer_affine(node, ptr_b),
        ) else {
            return UNKNOWN;
        };
        if a.base != b.base {
            return UNKNOWN;
        }

        // Every symbolic term other than the induction variable must
        // agree between the two sides, otherwise the gap varies.
        let mut vars: Vec<ValueRef> = a.terms.keys().chain(b.terms.keys()).copied().collect();
        vars.sort();
        vars.dedup();
        for v in vars {
            if v == indvar {
                continue;
            }
            if a.terms.get(&v).copied().unwrap_or(0) != b.terms.get(&v).copied().unwrap_or(0) {
                return UNKNOWN;
            }
        }
        let sa = a.terms.get(&indvar).copied().unwrap_or(0);
        let sb = b.terms.get(&indvar).copied().unwrap_or(0);
        if sa != sb {
            return UNKNOWN;
        }
        // Bytes the address advances per iteration.
        let step = sa * level.indvar.stride;
        let delta = b.consts - a.consts;

        if step == 0 {
            return if disjoint(delta, size_a, size_b) {
                INDEPENDENT
            } else {
                UNKNOWN
            };
        }
        if delta % step == 0 {
            let k = delta / step;
            return if k == 0 { INDEPENDENT } else { (true, k) };
        }
        // The gap is a fixed non-multiple of the step. Small enough
        // accesses then never touch.
        let r = delta.rem_euclid(step.abs());
        if size_b as i64 <= r && size_a as i64 <= step.abs() - r {
            INDEPENDENT
        } else {
            UNKNOWN
        }
    }

    /// Decomposes a pointer into base plus an affine byte offset. `None`
    /// when the chain leaves affine territory.
    fn pointer_affine(&self, node: &LoopNode, ptr: Operand) -> Option<Affine> {
        let f = self.module.function(node.func);
        let mut consts = 0i64;
        let mut terms: FxHashMap<ValueRef, i64> = FxHashMap::default();
        let mut cur = ptr;
        for _ in 0..MAX_DEPTH {
            let Operand::Inst(i) = cur else { break };
            match &f.inst(i).opcode {
                Opcode::Cast {
                    kind: CastKind::BitCast | CastKind::PtrToInt | CastKind::IntToPtr,
                    value,
                } => cur = *value,
                Opcode::Gep { base, indices } => {
                    self.fold_gep(node, *base, indices, &mut consts, &mut terms)?;
                    cur = *base;
                }
                _ => break,
            }
        }
        let base = self.module.value_ref(node.func, cur)?;
        Some(Affine { base, consts, terms })
    }

    fn fold_gep(
        &self,
        node: &LoopNode,
        base: Operand,
        indices: &[Operand],
        consts: &mut i64,
        terms: &mut FxHashMap<ValueRef, i64>,
    ) -> Option<()> {
        let mut ty = self.module.pointee_ty(node.func, base)?;
        let mut scale = self.module.layout.size_of(&self.module.types, ty) as i64;
        for (k, idx) in indices.iter().enumerate() {
            if k > 0 {
                match self.module.types.get(ty) {
                    Type::Array { elem, .. } => {
                        ty = *elem;
                        scale = self.module.layout.size_of(&self.module.types, ty) as i64;
                    }
                    Type::Struct { fields } => {
                        let fi = idx.as_const()? as usize;
                        if fi >= fields.len() {
                            return None;
                        }
                        *consts +=
                            self.module.layout.struct_offset(&self.module.types, ty, fi) as i64;
                        ty = fields[fi];
                        scale = self.module.layout.size_of(&self.module.types, ty) as i64;
                        continue;
                    }
                    _ => return None,
                }
            }
            self.index_affine(node, *idx, scale, MAX_DEPTH, consts, terms)?;
        }
        Some(())
    }

    /// Accumulates `scale * idx` into the running affine expression.
    fn index_affine(
        &self,
        node: &LoopNode,
        idx: Operand,
        scale: i64,
        depth: u32,
        consts: &mut i64,
        terms: &mut FxHashMap<ValueRef, i64>,
    ) -> Option<()> {
        if let Some(c) = idx.as_const() {
            *consts += scale * c;
            return Some(());
        }
        let f = self.module.function(node.func);
        if depth > 0 {
            if let Operand::Inst(i) = idx {
                match &f.inst(i).opcode {
                    Opcode::Bin { op, lhs, rhs } => match op {
                        BinOp::Add => {
                            self.index_affine(node, *lhs, scale, depth - 1, consts, terms)?;
                            self.index_affine(node, *rhs, scale, depth - 1, consts, terms)?;
                            return Some(());
                        }
                        BinOp::Sub => {
                            self.index_affine(node, *lhs, scale, depth - 1, consts, terms)?;
                            self.index_affine(node, *rhs, -scale, depth - 1, consts, terms)?;
                            return Some(());
                        }
                        BinOp::Mul => {
                            if let Some(c) = rhs.as_const() {
                                return self
                                    .index_affine(node, *lhs, scale * c, depth - 1, consts, terms);
                            }
                            if let Some(c) = lhs.as_const() {
                                return self
                                    .index_affine(node, *rhs, scale * c, depth - 1, consts, terms);
                            }
                        }
                        BinOp::Shl => {
                            if let Some(c) = rhs.as_const() {
                                if (0..63).contains(&c) {
                                    return self.index_affine(
                                        node,
                                        *lhs,
                                        scale * (1 << c),
                                        depth - 1,
                                        consts,
                                        terms,
                                    );
                                }
                            }
                        }
                        BinOp::Or => {}
                    },
                    Opcode::Cast { value, .. } => {
                        return self.index_affine(node, *value, scale, depth - 1, consts, terms)
                    }
                    _ => {}
                }
            }
        }
        // Opaque leaf: keep it symbolic.
        let v = self.module.value_ref(node.func, idx)?;
        *terms.entry(v).or_insert(0) += scale;
        Some(())
    }
}

/// Accesses at a fixed byte gap `delta` never overlap?
fn disjoint(delta: i64, size_a: u64, size_b: u64) -> bool {
    if size_a == 0 || size_b == 0 {
        return false;
    }
    delta >= size_a as i64 || -delta >= size_b as i64
}
