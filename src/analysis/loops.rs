// SPDX-License-Identifier: BSD-3-Clause
//! Loop access-pattern analysis.
//!
//! For every top-level loop nest this derives, when the nest is simple
//! enough:
//!
//!  * the canonical induction variable and trip count of each level,
//!  * which memory objects the nest touches, at which nest level,
//!  * per access and per object, a coarse traversal class
//!    ([`AccessClass`]): constant, row-major, column-major, mixed, or
//!    random.
//!
//! A nest qualifies when each level is a single-subloop chain whose
//! header carries a `phi(const, self + 1)` induction variable and whose
//! exit compares that variable's increment against a constant. Anything
//! else is recorded as [`LoopState::StructureUndetermined`], with the
//! touched objects still collected so clients can at least see the
//! footprint.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::analysis::points_to::{MemObjectId, PointsToAnalysis};
use crate::ir::{
    BinOp, BlockId, FuncId, Function, InstId, LoopId, LoopInfo, Module, Opcode, Operand, Type,
};

/// Traversal class of an access or an object, coarsest last. The
/// row/column pair is unordered in spirit: combining the two yields
/// [`AccessClass::Mixed`], not the larger of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessClass {
    /// Same address every iteration.
    Const,
    /// Innermost level walks contiguous elements.
    Row,
    /// Outermost level walks contiguous elements, inner levels jump.
    Column,
    Mixed,
    /// Not an affine function of the induction variables.
    Random,
}

impl AccessClass {
    pub fn combine(self, other: AccessClass) -> AccessClass {
        use AccessClass::*;
        match (self, other) {
            (Row, Column) | (Column, Row) => Mixed,
            _ => self.max(other),
        }
    }
}

/// A canonical induction variable: `phi(init, phi + stride)`.
#[derive(Clone, Copy, Debug)]
pub struct IndVar {
    pub phi: InstId,
    pub init: i64,
    pub stride: i64,
    /// The increment instruction feeding the back edge.
    pub next: InstId,
}

/// One level of a determined nest. Nest levels are 1-based, outermost
/// first.
#[derive(Clone, Copy, Debug)]
pub struct NestLevel {
    pub loop_id: LoopId,
    pub indvar: IndVar,
    /// 0 when the bound is not a compile-time constant.
    pub trip_count: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    StructureDetermined,
    StructureUndetermined,
}

/// One memory access inside the nest.
#[derive(Clone, Debug)]
pub struct Access {
    pub inst: InstId,
    pub class: AccessClass,
    /// `(nest level, element stride)` per induction variable involved.
    pub strides: Vec<(u32, i64)>,
}

#[derive(Clone, Debug)]
pub struct ObjectPattern {
    pub summary: AccessClass,
    pub accesses: Vec<Access>,
}

pub struct LoopNode {
    pub func: FuncId,
    pub root: LoopId,
    pub state: LoopState,
    /// Empty unless `state` is `StructureDetermined`.
    pub nest: Vec<NestLevel>,
    pub objects: FxHashSet<MemObjectId>,
    /// False when some load or store in the nest could not be traced to
    /// a unique object.
    pub objects_known: bool,
    pub inst_object: FxHashMap<InstId, MemObjectId>,
    pub inst_nest: FxHashMap<InstId, u32>,
    pub patterns: FxHashMap<MemObjectId, ObjectPattern>,
}

impl LoopNode {
    pub fn max_nest(&self) -> u32 {
        self.nest.len() as u32
    }

    pub fn level(&self, nest: u32) -> Option<&NestLevel> {
        if nest == 0 {
            return None;
        }
        self.nest.get(nest as usize - 1)
    }

    pub fn innermost(&self) -> Option<&NestLevel> {
        self.nest.last()
    }

    /// Which nest level a phi drives, if it is one of the nest's
    /// induction variables.
    pub fn nest_of_indvar(&self, phi: InstId) -> Option<u32> {
        self.nest
            .iter()
            .position(|l| l.indvar.phi == phi)
            .map(|i| i as u32 + 1)
    }

    pub fn pattern(&self, obj: MemObjectId) -> Option<&ObjectPattern> {
        self.patterns.get(&obj)
    }

    /// The coarsest class over every object the nest touches. Random
    /// when the footprint itself is unknown.
    pub fn summary(&self) -> AccessClass {
        if !self.objects_known {
            return AccessClass::Random;
        }
        self.patterns
            .values()
            .map(|p| p.summary)
            .fold(AccessClass::Const, AccessClass::combine)
    }
}

pub struct LoopPatternAnalysis {
    nodes: FxHashMap<(FuncId, LoopId), LoopNode>,
}

impl LoopPatternAnalysis {
    pub fn run(module: &Module, pa: &PointsToAnalysis) -> Self {
        let mut nodes = FxHashMap::default();
        for (fi, f) in module.functions.iter().enumerate() {
            let fid = FuncId(fi as u32);
            for root in f.top_level_loops() {
                let node = analyze_nest(module, pa, fid, root);
                debug!(
                    func = %f.name,
                    root = root.0,
                    state = ?node.state,
                    objects = node.objects.len(),
                    "loop nest analyzed"
                );
                nodes.insert((fid, root), node);
            }
        }
        LoopPatternAnalysis { nodes }
    }

    pub fn loop_node(&self, func: FuncId, root: LoopId) -> Option<&LoopNode> {
        self.nodes.get(&(func, root))
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&(FuncId, LoopId), &LoopNode)> {
        self.nodes.iter()
    }

    /// Constant trip count of one loop, 0 when it cannot be computed
    /// from the exit comparison.
    pub fn trip_count(module: &Module, func: FuncId, loop_id: LoopId) -> u64 {
        let f = module.function(func);
        trip_count(f, &f.loops[loop_id.index()])
    }
}

/// The canonical induction variable of a loop, or `None` when the header
/// phis do not contain one. `unit_only` additionally requires stride 1,
/// which pattern classification depends on.
pub fn find_indvar(f: &Function, info: &LoopInfo, unit_only: bool) -> Option<IndVar> {
    let header = &f.blocks[info.header.index()];
    for id in &header.insts {
        let Opcode::Phi { incoming } = &f.inst(*id).opcode else {
            continue;
        };
        if incoming.len() != 2 {
            continue;
        }
        let mut init: Option<i64> = None;
        let mut back: Option<Operand> = None;
        for (block, value) in incoming {
            if info.contains(*block) {
                back = Some(*value);
            } else if let Some(c) = value.as_const() {
                init = Some(c);
            }
        }
        let (Some(init), Some(Operand::Inst(next))) = (init, back) else {
            continue;
        };
        let Opcode::Bin {
            op: BinOp::Add,
            lhs: Operand::Inst(self_ref),
            rhs,
        } = &f.inst(next).opcode
        else {
            continue;
        };
        if *self_ref != *id {
            continue;
        }
        let Some(stride) = rhs.as_const() else {
            continue;
        };
        if unit_only && stride != 1 {
            continue;
        }
        return Some(IndVar {
            phi: *id,
            init,
            stride,
            next,
        });
    }
    None
}

/// Blocks of a loop that belong to no subloop.
fn unique_blocks<'a>(f: &'a Function, info: &'a LoopInfo) -> impl Iterator<Item = BlockId> + 'a {
    info.blocks.iter().copied().filter(move |b| {
        !info
            .sub_loops
            .iter()
            .any(|s| f.loops[s.index()].contains(*b))
    })
}

/// `(exit - init) / stride`, from the exit branch of a block unique to
/// the loop whose condition compares the indvar's increment against a
/// constant. 0 for any other shape.
fn trip_count(f: &Function, info: &LoopInfo) -> u64 {
    let Some(iv) = find_indvar(f, info, false) else {
        return 0;
    };
    for b in unique_blocks(f, info) {
        let Some(last) = f.blocks[b.index()].insts.last() else {
            continue;
        };
        let Opcode::CondBr {
            cond,
            on_true,
            on_false,
        } = &f.inst(*last).opcode
        else {
            continue;
        };
        if info.contains(*on_true) && info.contains(*on_false) {
            continue;
        }
        let Operand::Inst(cond_inst) = cond else {
            continue;
        };
        let Opcode::Icmp { lhs, rhs, .. } = &f.inst(*cond_inst).opcode else {
            continue;
        };
        // The comparison must be against the incremented value, so the
        // bound is exact rather than off by one.
        if *lhs != Operand::Inst(iv.next) {
            continue;
        }
        let Some(exit) = rhs.as_const() else {
            continue;
        };
        if iv.stride == 0 {
            return 0;
        }
        let n = (exit - iv.init) / iv.stride;
        return if n > 0 { n as u64 } else { 0 };
    }
    0
}

/// Loop exits through exactly one outside block?
fn has_unique_exit(f: &Function, info: &LoopInfo) -> bool {
    let mut exit: Option<BlockId> = None;
    for b in &info.blocks {
        let Some(last) = f.blocks[b.index()].insts.last() else {
            return false;
        };
        let targets: Vec<BlockId> = match &f.inst(*last).opcode {
            Opcode::Br { dest } => vec![*dest],
            Opcode::CondBr {
                on_true, on_false, ..
            } => vec![*on_true, *on_false],
            _ => vec![],
        };
        for t in targets {
            if !info.contains(t) {
                match exit {
                    None => exit = Some(t),
                    Some(e) if e == t => {}
                    Some(_) => return false,
                }
            }
        }
    }
    exit.is_some()
}

fn simple_loop_check(f: &Function, info: &LoopInfo) -> Option<(IndVar, u64)> {
    let iv = find_indvar(f, info, true)?;
    if !has_unique_exit(f, info) {
        return None;
    }
    let n = trip_count(f, info);
    if n == 0 {
        return None;
    }
    Some((iv, n))
}

fn analyze_nest(
    module: &Module,
    pa: &PointsToAnalysis,
    fid: FuncId,
    root: LoopId,
) -> LoopNode {
    let f = module.function(fid);
    let mut node = LoopNode {
        func: fid,
        root,
        state: LoopState::StructureUndetermined,
        nest: Vec::new(),
        objects: FxHashSet::default(),
        objects_known: true,
        inst_object: FxHashMap::default(),
        inst_nest: FxHashMap::default(),
        patterns: FxHashMap::default(),
    };

    // Probe the nest: a chain of single subloops, each passing the
    // simple-loop check.
    let mut cur = root;
    let determined = loop {
        let info = &f.loops[cur.index()];
        match simple_loop_check(f, info) {
            Some((indvar, trip_count)) => node.nest.push(NestLevel {
                loop_id: cur,
                indvar,
                trip_count,
            }),
            None => break false,
        }
        match info.sub_loops.as_slice() {
            [] => break true,
            [sub] => cur = *sub,
            _ => break false,
        }
    };

    if !determined {
        node.nest.clear();
        // Still collect the footprint over the whole nest.
        let info = &f.loops[root.index()];
        for b in &info.blocks {
            for id in &f.blocks[b.index()].insts {
                collect_access(module, pa, fid, *id, 0, &mut node);
            }
        }
        return node;
    }

    node.state = LoopState::StructureDetermined;
    for (li, level) in node.nest.clone().iter().enumerate() {
        let info = &f.loops[level.loop_id.index()];
        for b in unique_blocks(f, info) {
            for id in &f.blocks[b.index()].insts {
                collect_access(module, pa, fid, *id, li as u32 + 1, &mut node);
            }
        }
    }
    classify_patterns(module, pa, &mut node);
    node
}

fn collect_access(
    module: &Module,
    pa: &PointsToAnalysis,
    fid: FuncId,
    id: InstId,
    nest: u32,
    node: &mut LoopNode,
) {
    let f = module.function(fid);
    let ptr = match &f.inst(id).opcode {
        Opcode::Load { ptr } => *ptr,
        Opcode::Store { ptr, .. } => *ptr,
        _ => return,
    };
    let obj = module
        .value_ref(fid, ptr)
        .and_then(|v| pa.unique_object(v));
    match obj {
        Some(obj) => {
            node.objects.insert(obj);
            node.inst_object.insert(id, obj);
            node.inst_nest.insert(id, nest);
        }
        None => node.objects_known = false,
    }
}

fn classify_patterns(module: &Module, pa: &PointsToAnalysis, node: &mut LoopNode) {
    let f = module.function(node.func);
    let mut per_object: FxHashMap<MemObjectId, Vec<InstId>> = FxHashMap::default();
    for (inst, obj) in &node.inst_object {
        per_object.entry(*obj).or_default().push(*inst);
    }
    for (obj, mut insts) in per_object {
        insts.sort();
        let mut accesses = Vec::new();
        for inst in insts {
            let ptr = match &f.inst(inst).opcode {
                Opcode::Load { ptr } => *ptr,
                Opcode::Store { ptr, .. } => *ptr,
                _ => continue,
            };
            accesses.push(classify_access(module, pa, node, inst, ptr, obj));
        }
        let summary = accesses
            .iter()
            .map(|a| a.class)
            .reduce(AccessClass::combine)
            .unwrap_or(AccessClass::Const);
        node.patterns.insert(obj, ObjectPattern { summary, accesses });
    }
}

fn classify_access(
    module: &Module,
    pa: &PointsToAnalysis,
    node: &LoopNode,
    inst: InstId,
    ptr: Operand,
    obj: MemObjectId,
) -> Access {
    let random = |strides: Vec<(u32, i64)>| Access {
        inst,
        class: AccessClass::Random,
        strides,
    };
    let Some(mut strides) = collect_strides(module, pa, node, ptr, obj) else {
        return random(Vec::new());
    };
    strides.sort();
    let class = classify_strides(node, &strides);
    Access {
        inst,
        class,
        strides,
    }
}

/// Walks the pointer's GEP chain collecting `(nest level, element
/// stride)` terms. `None` means some index was not an affine function of
/// a nest induction variable.
fn collect_strides(
    module: &Module,
    pa: &PointsToAnalysis,
    node: &LoopNode,
    ptr: Operand,
    obj: MemObjectId,
) -> Option<Vec<(u32, i64)>> {
    let f = module.function(node.func);
    let mut strides: FxHashMap<u32, i64> = FxHashMap::default();
    let mut cur = ptr;
    for _ in 0..8 {
        let Operand::Inst(i) = cur else { break };
        match &f.inst(i).opcode {
            Opcode::Cast { value, .. } => cur = *value,
            Opcode::Gep { base, indices } => {
                fold_gep_strides(module, pa, node, obj, *base, indices, &mut strides)?;
                cur = *base;
            }
            _ => break,
        }
    }
    Some(strides.into_iter().collect())
}

fn fold_gep_strides(
    module: &Module,
    pa: &PointsToAnalysis,
    node: &LoopNode,
    obj: MemObjectId,
    base: Operand,
    indices: &[Operand],
    strides: &mut FxHashMap<u32, i64>,
) -> Option<()> {
    let f = module.function(node.func);
    let pointee = module.pointee_ty(node.func, base);
    let is_array = pointee
        .map(|t| matches!(module.types.get(t), Type::Array { .. }))
        .unwrap_or(false);
    let dims = &pa.object(obj).dims;
    for (k, idx) in indices.iter().enumerate() {
        if idx.as_const().is_some() {
            continue;
        }
        let (phi, s) = get_stride(f, *idx)?;
        let nest = node.nest_of_indvar(phi)?;
        // Element stride of this dimension: the product of every inner
        // dimension's extent. The leading GEP index steps over whole
        // objects.
        let dim_stride: i64 = if is_array {
            if k == 0 {
                dims.iter().product::<u64>() as i64
            } else {
                dims.get(k..)
                    .map(|rest| rest.iter().product::<u64>())
                    .unwrap_or(1) as i64
            }
        } else {
            1
        };
        strides.insert(nest, s * dim_stride);
    }
    Some(())
}

/// `index = phi * stride` through one add/sub/mul/shl, the shape loop
/// counters actually take. Anything else is not classifiable.
fn get_stride(f: &Function, idx: Operand) -> Option<(InstId, i64)> {
    let Operand::Inst(i) = idx else { return None };
    match &f.inst(i).opcode {
        Opcode::Phi { .. } => Some((i, 1)),
        Opcode::Cast { value, .. } => get_stride(f, *value),
        Opcode::Bin { op, lhs, rhs } => {
            let phi_of = |side: &Operand| -> Option<InstId> {
                let Operand::Inst(x) = side else { return None };
                match &f.inst(*x).opcode {
                    Opcode::Phi { .. } => Some(*x),
                    Opcode::Cast { value: Operand::Inst(y), .. }
                        if matches!(f.inst(*y).opcode, Opcode::Phi { .. }) =>
                    {
                        Some(*y)
                    }
                    _ => None,
                }
            };
            match op {
                BinOp::Add | BinOp::Sub => phi_of(lhs).or_else(|| phi_of(rhs)).map(|p| (p, 1)),
                BinOp::Mul => match (phi_of(lhs), rhs.as_const(), phi_of(rhs), lhs.as_const()) {
                    (Some(p), Some(c), _, _) => Some((p, c)),
                    (_, _, Some(p), Some(c)) => Some((p, c)),
                    _ => None,
                },
                BinOp::Shl => match (phi_of(lhs), rhs.as_const()) {
                    (Some(p), Some(c)) if (0..63).contains(&c) => Some((p, 1 << c)),
                    _ => None,
                },
                BinOp::Or => None,
            }
        }
        _ => None,
    }
}

/// The row/column decision over sorted `(nest, stride)` pairs.
fn classify_strides(node: &LoopNode, strides: &[(u32, i64)]) -> AccessClass {
    if strides.is_empty() {
        return AccessClass::Const;
    }
    if strides.len() == 1 {
        return AccessClass::Row;
    }
    let mut column_candidate = false;
    let mut row_candidate = true;
    for i in 0..strides.len() - 1 {
        if strides[i].0 >= strides[i + 1].0 {
            // Same induction variable at two levels.
            return AccessClass::Random;
        }
        if i == 0 && strides[0].1 == 1 {
            column_candidate = true;
        } else {
            let inner_trip = node
                .level(strides[i + 1].0)
                .map(|l| l.trip_count)
                .unwrap_or(0) as i64;
            if strides[i].1 < strides[i + 1].1 * inner_trip {
                row_candidate = false;
            }
        }
    }
    if column_candidate && row_candidate {
        AccessClass::Column
    } else if row_candidate {
        AccessClass::Row
    } else {
        AccessClass::Mixed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AllocRegistry, Options};
    use crate::ir::build::ModuleBuilder;
    use crate::ir::Module;

    /// Builds `for i in 0..10 { for j in 0..20 { touch A[x][y] } }` where
    /// the two innermost indices are produced by `make_indices`, which
    /// gets (builder, i_phi, j_phi) and returns the gep index operands.
    /// `extra` is how many instructions the closure itself emits, so the
    /// back-edge phis can forward-reference their increments.
    fn nest_module(
        extra: u32,
        make_indices: impl FnOnce(&mut crate::ir::build::FunctionBuilder<'_>, InstId, InstId) -> Vec<Operand>,
    ) -> (Module, FuncId, LoopId) {
        let mut b = ModuleBuilder::new();
        let i32t = b.ty(Type::Int(32));
        let i64t = b.ty(Type::Int(64));
        let i1 = b.ty(Type::Int(1));
        let row = b.ty(Type::Array { elem: i32t, len: 20 });
        let mat = b.ty(Type::Array { elem: row, len: 10 });
        let p32 = b.ptr_to(i32t);
        let void = b.ty(Type::Void);
        let a = b.global("A", mat, true);
        let mut f = b.define("f", &[], void);
        let fid = f.id();

        let entry = f.block("entry");
        let h1 = f.next_block_id();
        f.br(h1);

        // h1: i = phi [(entry, 0), (l1, i_next)]
        let h1b = f.block("h1");
        assert_eq!(h1b, h1);
        let i_next_id = InstId(9 + extra);
        let i_phi = f.phi(
            i64t,
            vec![(entry, Operand::Const(0)), (BlockId(3), Operand::Inst(i_next_id))],
        );
        let h2 = f.next_block_id();
        f.br(h2);

        // h2: j = phi [(h1, 0), (h2, j_next)]; access; j_next; exit test
        let h2b = f.block("h2");
        assert_eq!(h2b, h2);
        let j_next_id = InstId(6 + extra);
        let j_phi = f.phi(
            i64t,
            vec![(h1, Operand::Const(0)), (h2, Operand::Inst(j_next_id))],
        );
        let indices = make_indices(&mut f, i_phi, j_phi);
        let gep = f.gep(p32, Operand::Global(a), indices);
        f.load(i32t, Operand::Inst(gep));
        let j_next = f.bin(i64t, BinOp::Add, Operand::Inst(j_phi), Operand::Const(1));
        assert_eq!(j_next, j_next_id);
        let j_cmp = f.icmp(
            i1,
            crate::ir::Predicate::Slt,
            Operand::Inst(j_next),
            Operand::Const(20),
        );
        let l1 = f.next_block_id();
        f.cond_br(Operand::Inst(j_cmp), h2, l1);

        // l1: i_next; exit test
        let l1b = f.block("l1");
        assert_eq!(l1b, l1);
        let i_next = f.bin(i64t, BinOp::Add, Operand::Inst(i_phi), Operand::Const(1));
        assert_eq!(i_next, i_next_id);
        let i_cmp = f.icmp(
            i1,
            crate::ir::Predicate::Slt,
            Operand::Inst(i_next),
            Operand::Const(10),
        );
        let exit = f.next_block_id();
        f.cond_br(Operand::Inst(i_cmp), h1, exit);

        let exitb = f.block("exit");
        assert_eq!(exitb, exit);
        f.ret(None);

        let inner = f.add_loop(LoopInfo {
            header: h2,
            blocks: vec![h2],
            sub_loops: vec![],
            parent: Some(LoopId(1)),
        });
        let outer = f.add_loop(LoopInfo {
            header: h1,
            blocks: vec![h1, h2, l1],
            sub_loops: vec![inner],
            parent: None,
        });
        let m = b.finish().unwrap();
        (m, fid, outer)
    }

    fn analyze(m: &Module) -> PointsToAnalysis {
        PointsToAnalysis::run(m, &AllocRegistry::default(), &Options::default())
    }

    fn single_pattern(node: &LoopNode) -> &ObjectPattern {
        assert_eq!(node.patterns.len(), 1);
        node.patterns.values().next().unwrap()
    }

    #[test]
    fn row_major_access() {
        let (m, fid, root) = nest_module(0, |_, i, j| {
            vec![Operand::Const(0), Operand::Inst(i), Operand::Inst(j)]
        });
        let pa = analyze(&m);
        let lpa = LoopPatternAnalysis::run(&m, &pa);
        let node = lpa.loop_node(fid, root).unwrap();
        assert_eq!(node.state, LoopState::StructureDetermined);
        assert_eq!(node.max_nest(), 2);
        assert_eq!(node.level(1).unwrap().trip_count, 10);
        assert_eq!(node.level(2).unwrap().trip_count, 20);
        assert!(node.objects_known);
        let p = single_pattern(node);
        assert_eq!(p.summary, AccessClass::Row);
        assert_eq!(p.accesses[0].strides, vec![(1, 20), (2, 1)]);
    }

    #[test]
    fn column_major_access() {
        // A[j][i]: the outer counter walks within a row.
        let (m, fid, root) = nest_module(0, |_, i, j| {
            vec![Operand::Const(0), Operand::Inst(j), Operand::Inst(i)]
        });
        let pa = analyze(&m);
        let lpa = LoopPatternAnalysis::run(&m, &pa);
        let node = lpa.loop_node(fid, root).unwrap();
        let p = single_pattern(node);
        assert_eq!(p.summary, AccessClass::Column);
    }

    #[test]
    fn constant_access() {
        let (m, fid, root) =
            nest_module(0, |_, _, _| vec![Operand::Const(0), Operand::Const(2), Operand::Const(3)]);
        let pa = analyze(&m);
        let lpa = LoopPatternAnalysis::run(&m, &pa);
        let node = lpa.loop_node(fid, root).unwrap();
        assert_eq!(single_pattern(node).summary, AccessClass::Const);
    }

    #[test]
    fn nonlinear_index_is_random() {
        // A[i][j*j] is not affine in the counters.
        let (m, fid, root) = nest_module(1, |f, i, j| {
            let i64t = crate::ir::TypeId(1);
            let jj = f.bin(i64t, BinOp::Mul, Operand::Inst(j), Operand::Inst(j));
            vec![Operand::Const(0), Operand::Inst(i), Operand::Inst(jj)]
        });
        let pa = analyze(&m);
        let lpa = LoopPatternAnalysis::run(&m, &pa);
        let node = lpa.loop_node(fid, root).unwrap();
        assert_eq!(single_pattern(node).summary, AccessClass::Random);
    }

    /// The same classification comes out however many times it runs.
    #[test]
    fn classification_is_deterministic() {
        let (m, fid, root) = nest_module(0, |_, i, j| {
            vec![Operand::Const(0), Operand::Inst(i), Operand::Inst(j)]
        });
        let pa = analyze(&m);
        let first = LoopPatternAnalysis::run(&m, &pa);
        for _ in 0..3 {
            let again = LoopPatternAnalysis::run(&m, &pa);
            assert_eq!(
                again.loop_node(fid, root).unwrap().summary(),
                first.loop_node(fid, root).unwrap().summary()
            );
        }
    }

    #[test]
    fn exact_trip_count_and_unknown_bound() {
        let (m, fid, root) = nest_module(0, |_, i, j| {
            vec![Operand::Const(0), Operand::Inst(i), Operand::Inst(j)]
        });
        assert_eq!(LoopPatternAnalysis::trip_count(&m, fid, root), 10);

        // A data-dependent bound defeats the trip count and with it the
        // structure check.
        let mut b = ModuleBuilder::new();
        let i64t = b.ty(Type::Int(64));
        let i1 = b.ty(Type::Int(1));
        let void = b.ty(Type::Void);
        let mut f = b.define("g", &[i64t], void);
        let fid = f.id();
        let entry = f.block("entry");
        let h = f.next_block_id();
        f.br(h);
        let hb = f.block("h");
        assert_eq!(hb, h);
        let next_id = InstId(2);
        let iv = f.phi(
            i64t,
            vec![(entry, Operand::Const(0)), (h, Operand::Inst(next_id))],
        );
        let next = f.bin(i64t, BinOp::Add, Operand::Inst(iv), Operand::Const(1));
        assert_eq!(next, next_id);
        let cmp = f.icmp(
            i1,
            crate::ir::Predicate::Slt,
            Operand::Inst(next),
            Operand::Param(0),
        );
        let exit = f.next_block_id();
        f.cond_br(Operand::Inst(cmp), h, exit);
        let exitb = f.block("exit");
        assert_eq!(exitb, exit);
        f.ret(None);
        let lp = f.add_loop(LoopInfo {
            header: h,
            blocks: vec![h],
            sub_loops: vec![],
            parent: None,
        });
        let m = b.finish().unwrap();
        assert_eq!(LoopPatternAnalysis::trip_count(&m, fid, lp), 0);
        let pa = analyze(&m);
        let lpa = LoopPatternAnalysis::run(&m, &pa);
        assert_eq!(
            lpa.loop_node(fid, lp).unwrap().state,
            LoopState::StructureUndetermined
        );
    }

    /// Row and column accesses to the same object make it mixed.
    #[test]
    fn conflicting_accesses_are_mixed() {
        let (m, fid, root) = nest_module(2, |f, i, j| {
            // Sneak in a second, transposed access before returning the
            // row-major indices.
            let p32 = crate::ir::TypeId(5);
            let g2 = f.gep(
                p32,
                Operand::Global(crate::ir::GlobalId(0)),
                vec![Operand::Const(0), Operand::Inst(j), Operand::Inst(i)],
            );
            f.load(crate::ir::TypeId(0), Operand::Inst(g2));
            vec![Operand::Const(0), Operand::Inst(i), Operand::Inst(j)]
        });
        let pa = analyze(&m);
        let lpa = LoopPatternAnalysis::run(&m, &pa);
        let node = lpa.loop_node(fid, root).unwrap();
        assert_eq!(single_pattern(node).summary, AccessClass::Mixed);
    }
}
