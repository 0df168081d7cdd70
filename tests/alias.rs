// End-to-end checks over the whole stack: points-to, oracles, loop
// patterns, and distances on small synthetic modules.

use loopaa::aa::basic::BasicAa;
use loopaa::aa::global::GlobalMallocAa;
use loopaa::aa::points_to::PointsToAa;
use loopaa::aa::{AaStack, AliasResult, InstRef, LoopScope, PtrQuery, TemporalRelation};
use loopaa::analysis::distance::DistanceAnalysis;
use loopaa::analysis::loops::{AccessClass, LoopPatternAnalysis, LoopState};
use loopaa::analysis::points_to::PointsToAnalysis;
use loopaa::config::{AllocRegistry, Options};
use loopaa::ir::build::ModuleBuilder;
use loopaa::ir::{
    BinOp, FuncId, InstId, LoopId, LoopInfo, Module, Operand, Predicate, Type, ValueRef,
};

// ------------------------------------------------------------------
// Helpers

fn analyses(m: &Module) -> (PointsToAnalysis, AllocRegistry, Options) {
    let registry = AllocRegistry::default();
    let opts = Options::default();
    let pa = PointsToAnalysis::run(m, &registry, &opts);
    (pa, registry, opts)
}

fn full_stack<'a>(
    m: &Module,
    pa: &'a PointsToAnalysis,
    registry: &AllocRegistry,
    opts: &Options,
) -> AaStack<'a> {
    let mut stack = AaStack::default();
    stack.register(Box::new(BasicAa::new(registry.clone())));
    stack.register(Box::new(GlobalMallocAa::build(m, registry, opts)));
    stack.register(Box::new(PointsToAa::new(pa)));
    stack
}

fn q(f: FuncId, inst: InstId, size: u64) -> PtrQuery {
    PtrQuery::new(ValueRef::Inst(f, inst), size)
}

/// `for i in 0..100` over a global `[100 x i32]`, with `A[i]` loaded and
/// `A[i+1]` stored each iteration.
fn stride_loop() -> (Module, FuncId, LoopId, InstId, InstId) {
    let mut b = ModuleBuilder::new();
    let i32t = b.ty(Type::Int(32));
    let i64t = b.ty(Type::Int(64));
    let i1 = b.ty(Type::Int(1));
    let arr = b.ty(Type::Array { elem: i32t, len: 100 });
    let p32 = b.ptr_to(i32t);
    let void = b.ty(Type::Void);
    let a = b.global("A", arr, true);
    let mut f = b.define("f", &[], void);
    let fid = f.id();

    let entry = f.block("entry");
    let h = f.next_block_id();
    f.br(h);
    let hb = f.block("h");
    assert_eq!(hb, h);
    let next_id = InstId(7);
    let iv = f.phi(
        i64t,
        vec![(entry, Operand::Const(0)), (h, Operand::Inst(next_id))],
    );
    let ga = f.gep(
        p32,
        Operand::Global(a),
        vec![Operand::Const(0), Operand::Inst(iv)],
    );
    f.load(i32t, Operand::Inst(ga));
    let ip1 = f.bin(i64t, BinOp::Add, Operand::Inst(iv), Operand::Const(1));
    let ga1 = f.gep(
        p32,
        Operand::Global(a),
        vec![Operand::Const(0), Operand::Inst(ip1)],
    );
    f.store(Operand::Inst(ga1), Operand::Const(0));
    let next = f.bin(i64t, BinOp::Add, Operand::Inst(iv), Operand::Const(1));
    assert_eq!(next, next_id);
    let cmp = f.icmp(i1, Predicate::Slt, Operand::Inst(next), Operand::Const(100));
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
    (m, fid, lp, ga, ga1)
}

// ------------------------------------------------------------------
// Constant GEP offsets

#[test]
fn constant_gep_offsets() {
    let mut b = ModuleBuilder::new();
    let i32t = b.ty(Type::Int(32));
    let arr = b.ty(Type::Array { elem: i32t, len: 100 });
    let p32 = b.ptr_to(i32t);
    let void = b.ty(Type::Void);
    let a = b.global("A", arr, true);
    let mut f = b.define("f", &[], void);
    let fid = f.id();
    f.block("entry");
    let g2 = f.gep(
        p32,
        Operand::Global(a),
        vec![Operand::Const(0), Operand::Const(2)],
    );
    let g5 = f.gep(
        p32,
        Operand::Global(a),
        vec![Operand::Const(0), Operand::Const(5)],
    );
    let g2b = f.gep(
        p32,
        Operand::Global(a),
        vec![Operand::Const(0), Operand::Const(2)],
    );
    f.ret(None);
    let m = b.finish().unwrap();
    let (pa, registry, opts) = analyses(&m);
    let stack = full_stack(&m, &pa, &registry, &opts);

    let qa = q(fid, g2, 4);
    let qb = q(fid, g5, 4);
    let qc = q(fid, g2b, 4);
    let rel = TemporalRelation::Same;
    // A[2] vs A[5] with 4-byte elements cannot overlap, and the answer
    // does not depend on argument order.
    assert_eq!(stack.alias(&m, qa, rel, qb, None), AliasResult::NoAlias);
    assert_eq!(stack.alias(&m, qb, rel, qa, None), AliasResult::NoAlias);
    // A[2] vs A[2] through distinct instructions is a must alias.
    assert_eq!(stack.alias(&m, qa, rel, qc, None), AliasResult::MustAlias);
}

// ------------------------------------------------------------------
// Chain conservatism

#[test]
fn empty_stack_answers_may_alias() {
    let (m, fid, _, ga, ga1) = stride_loop();
    let stack = AaStack::default();
    assert_eq!(
        stack.alias(
            &m,
            q(fid, ga, 4),
            TemporalRelation::Same,
            q(fid, ga1, 4),
            None
        ),
        AliasResult::MayAlias
    );
}

#[test]
fn oracles_only_refine() {
    // Whatever the full stack proves, a prefix of it never contradicts:
    // adding oracles moves answers from MayAlias toward a definite one.
    let (m, fid, lp, ga, ga1) = stride_loop();
    let (pa, registry, opts) = analyses(&m);
    let scope = Some(LoopScope {
        func: fid,
        loop_id: lp,
    });
    let mut partial = AaStack::default();
    partial.register(Box::new(PointsToAa::new(&pa)));
    let full = full_stack(&m, &pa, &registry, &opts);
    for rel in [
        TemporalRelation::Before,
        TemporalRelation::Same,
        TemporalRelation::After,
    ] {
        let weak = partial.alias(&m, q(fid, ga, 4), rel, q(fid, ga1, 4), scope);
        let strong = full.alias(&m, q(fid, ga, 4), rel, q(fid, ga1, 4), scope);
        if weak != AliasResult::MayAlias {
            assert_eq!(weak, strong);
        }
    }
    // Within one iteration the two accesses sit one element apart.
    assert_eq!(
        full.alias(
            &m,
            q(fid, ga, 4),
            TemporalRelation::Same,
            q(fid, ga1, 4),
            scope
        ),
        AliasResult::NoAlias
    );
}

// ------------------------------------------------------------------
// Soundness on merged flow

#[test]
fn merged_pointer_stays_may_alias() {
    let mut b = ModuleBuilder::new();
    let i32t = b.ty(Type::Int(32));
    let i1 = b.ty(Type::Int(1));
    let p32 = b.ptr_to(i32t);
    let void = b.ty(Type::Void);
    let mut f = b.define("f", &[i1], void);
    let fid = f.id();
    f.block("entry");
    let x = f.alloca(p32, i32t);
    let y = f.alloca(p32, i32t);
    let p = f.select(p32, Operand::Param(0), Operand::Inst(x), Operand::Inst(y));
    f.store(Operand::Inst(p), Operand::Const(1));
    f.ret(None);
    let m = b.finish().unwrap();
    let (pa, registry, opts) = analyses(&m);
    let stack = full_stack(&m, &pa, &registry, &opts);

    assert_eq!(pa.points_to(ValueRef::Inst(fid, p)).len(), 2);
    let rel = TemporalRelation::Same;
    // p may be either slot, so nothing may claim NoAlias against them.
    for target in [x, y] {
        assert_ne!(
            stack.alias(&m, q(fid, p, 4), rel, q(fid, target, 4), None),
            AliasResult::NoAlias
        );
    }
    // The two slots themselves never overlap.
    assert_eq!(
        stack.alias(&m, q(fid, x, 4), rel, q(fid, y, 4), None),
        AliasResult::NoAlias
    );
}

// ------------------------------------------------------------------
// Heap disambiguation through the whole stack

#[test]
fn separate_heap_allocations() {
    let mut b = ModuleBuilder::new();
    let i8t = b.ty(Type::Int(8));
    let i64t = b.ty(Type::Int(64));
    let p8 = b.ptr_to(i8t);
    let void = b.ty(Type::Void);
    let malloc = b.declare("malloc", &[i64t], p8);
    let mut f = b.define("f", &[], void);
    let fid = f.id();
    f.block("entry");
    let p = f.call(p8, malloc, vec![Operand::Const(64)]);
    let r = f.call(p8, malloc, vec![Operand::Const(64)]);
    f.store(Operand::Inst(p), Operand::Const(0));
    f.store(Operand::Inst(r), Operand::Const(0));
    f.ret(None);
    let m = b.finish().unwrap();
    let (pa, registry, opts) = analyses(&m);
    let stack = full_stack(&m, &pa, &registry, &opts);

    assert_eq!(
        stack.alias(
            &m,
            q(fid, p, 1),
            TemporalRelation::Same,
            q(fid, r, 1),
            None
        ),
        AliasResult::NoAlias
    );
}

// ------------------------------------------------------------------
// Loop pipeline: pattern, trip count, distance

#[test]
fn stride_loop_pipeline() {
    let (m, fid, lp, ga, ga1) = stride_loop();
    let (pa, _registry, _opts) = analyses(&m);
    let lpa = LoopPatternAnalysis::run(&m, &pa);
    let node = lpa.loop_node(fid, lp).unwrap();

    assert_eq!(node.state, LoopState::StructureDetermined);
    assert_eq!(node.innermost().unwrap().trip_count, 100);
    assert!(node.objects_known);
    let pat = node.patterns.values().next().unwrap();
    assert_eq!(pat.summary, AccessClass::Row);

    let da = DistanceAnalysis::new(&m, &pa);
    assert_eq!(
        da.get_distance(node, Operand::Inst(ga), 4, Operand::Inst(ga1), 4),
        (true, 1)
    );
    assert_eq!(
        da.get_distance(node, Operand::Inst(ga1), 4, Operand::Inst(ga), 4),
        (true, -1)
    );
    assert_eq!(
        da.get_distance(node, Operand::Inst(ga), 4, Operand::Inst(ga), 4),
        (false, 0)
    );
}

// ------------------------------------------------------------------
// Inter-iteration mod queries

#[test]
fn store_mods_next_iteration_load() {
    let (m, fid, lp, ga, ga1) = stride_loop();
    let (pa, registry, opts) = analyses(&m);
    let stack = full_stack(&m, &pa, &registry, &opts);
    let scope = LoopScope {
        func: fid,
        loop_id: lp,
    };
    // Each gep is immediately followed by its access.
    let load = InstRef {
        func: fid,
        inst: InstId(ga.0 + 1),
    };
    let store = InstRef {
        func: fid,
        inst: InstId(ga1.0 + 1),
    };

    // The store to A[i+1] lands exactly where the next iteration loads.
    assert!(stack.may_mod_inter_iteration(&m, store, load, scope));
    // A load never writes anything.
    assert!(!stack.may_mod_inter_iteration(&m, load, store, scope));
}
