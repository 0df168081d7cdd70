// SPDX-License-Identifier: BSD-3-Clause
//! Flow-insensitive, field-sensitive inclusion-based points-to analysis.
//!
//! Every pointer-carrying value gets a dense [`ValueId`]; every
//! allocation site (alloca, internal global, allocator call) becomes a
//! [`MemObject`], recursively split into sub-objects for struct fields.
//! Instruction shapes are lowered to inclusion constraints and solved to
//! a fixed point; the result maps each value to the set of objects it
//! may point at.
//!
//! An empty set is an answer, not a proof: it means the value's sources
//! were not resolvable (external call, indirect call, a parameter of an
//! entry point), and every client must treat it conservatively.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

use crate::config::{AllocKind, AllocRegistry, Options};
use crate::ir::{
    Callee, FuncId, GlobalId, InstId, Module, Opcode, Operand, Type, TypeId, ValueRef,
};

/// Dense index of a pointer-carrying value.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ValueId(u32);

/// Dense index of an abstract memory object.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemObjectId(pub u32);

impl MemObjectId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum AllocSite {
    Stack(FuncId, InstId),
    Heap(FuncId, InstId),
    Global(GlobalId),
}

/// One abstract allocation, or a struct field carved out of one.
#[derive(Clone, Debug)]
pub struct MemObject {
    pub name: String,
    pub site: AllocSite,
    /// Scalar element size in bytes, when the site's type is known.
    pub element_size: u64,
    /// Array dimensions, outermost first. Empty for scalars and for heap
    /// sites whose extent is not recoverable.
    pub dims: Vec<u64>,
    pub parent: Option<MemObjectId>,
    pub field_index: Option<u32>,
    pub fields: Vec<MemObjectId>,
    /// Set when the object came from an external allocator whose size
    /// argument was constant at the call site.
    pub byte_size: Option<u64>,
}

impl MemObject {
    /// Total elements across all dimensions; 1 for scalars.
    pub fn element_count(&self) -> u64 {
        self.dims.iter().product()
    }
}

/// Inclusion constraints, in the usual Andersen taxonomy plus a
/// field-selecting `Gep`.
#[derive(Clone, Debug)]
enum Constraint {
    /// pts(dst) ∋ object
    AddressOf { dst: ValueId, object: MemObjectId },
    /// pts(dst) ⊇ pts(src)
    Copy { dst: ValueId, src: ValueId },
    /// pts(dst) ⊇ pts(o) for o ∈ pts(src)
    Load { dst: ValueId, src: ValueId },
    /// pts(o) ⊇ pts(src) for o ∈ pts(dst)
    Store { dst: ValueId, src: ValueId },
    /// pts(dst) ⊇ { field(o) } for o ∈ pts(base); `None` keeps the whole
    /// object (non-constant or non-struct offset).
    Gep {
        dst: ValueId,
        base: ValueId,
        field: Option<u32>,
    },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    pub values: usize,
    pub objects: usize,
    pub constraints: usize,
    pub passes: usize,
}

pub struct PointsToAnalysis {
    values: FxHashMap<ValueRef, ValueId>,
    objects: Vec<MemObject>,
    /// Parent object of each allocation site.
    sites: FxHashMap<AllocSite, MemObjectId>,
    value_pts: Vec<FxHashSet<MemObjectId>>,
    object_pts: Vec<FxHashSet<MemObjectId>>,
    /// Objects loaded or stored anywhere in a function, including through
    /// callees reachable by direct calls.
    func_memory: FxHashMap<FuncId, FxHashSet<MemObjectId>>,
    /// Reverse of `func_memory`, restricted to direct accesses.
    object_users: FxHashMap<MemObjectId, FxHashSet<FuncId>>,
    empty: FxHashSet<MemObjectId>,
    pub stats: Stats,
}

impl PointsToAnalysis {
    pub fn run(module: &Module, registry: &AllocRegistry, opts: &Options) -> Self {
        let mut builder = Collector {
            module,
            registry,
            opts,
            pa: PointsToAnalysis {
                values: FxHashMap::default(),
                objects: Vec::new(),
                sites: FxHashMap::default(),
                value_pts: Vec::new(),
                object_pts: Vec::new(),
                func_memory: FxHashMap::default(),
                object_users: FxHashMap::default(),
                empty: FxHashSet::default(),
                stats: Stats::default(),
            },
            constraints: Vec::new(),
        };
        builder.collect();
        let mut pa = builder.pa;
        let constraints = builder.constraints;
        pa.stats.values = pa.values.len();
        pa.stats.objects = pa.objects.len();
        pa.stats.constraints = constraints.len();
        pa.solve(&constraints);
        pa.derive_memory_maps(module, opts);
        info!(
            values = pa.stats.values,
            objects = pa.stats.objects,
            constraints = pa.stats.constraints,
            passes = pa.stats.passes,
            "points-to analysis converged"
        );
        pa
    }

    /// Repeated passes over the constraint list until no set grows.
    /// Monotone over a finite lattice, so this terminates even when the
    /// constraint graph is cyclic.
    fn solve(&mut self, constraints: &[Constraint]) {
        let mut changed = true;
        while changed {
            changed = false;
            self.stats.passes += 1;
            for c in constraints {
                match *c {
                    Constraint::AddressOf { dst, object } => {
                        changed |= self.value_pts[dst.0 as usize].insert(object);
                    }
                    Constraint::Copy { dst, src } => {
                        changed |= self.union_value(dst, src);
                    }
                    Constraint::Load { dst, src } => {
                        let sources: Vec<MemObjectId> =
                            self.value_pts[src.0 as usize].iter().copied().collect();
                        for o in sources {
                            let incoming: Vec<MemObjectId> =
                                self.object_pts[o.index()].iter().copied().collect();
                            let dst_set = &mut self.value_pts[dst.0 as usize];
                            for x in incoming {
                                changed |= dst_set.insert(x);
                            }
                        }
                    }
                    Constraint::Store { dst, src } => {
                        let targets: Vec<MemObjectId> =
                            self.value_pts[dst.0 as usize].iter().copied().collect();
                        let incoming: Vec<MemObjectId> =
                            self.value_pts[src.0 as usize].iter().copied().collect();
                        for o in targets {
                            let set = &mut self.object_pts[o.index()];
                            for x in &incoming {
                                changed |= set.insert(*x);
                            }
                        }
                    }
                    Constraint::Gep { dst, base, field } => {
                        let bases: Vec<MemObjectId> =
                            self.value_pts[base.0 as usize].iter().copied().collect();
                        for o in bases {
                            let picked = match field {
                                Some(f) => *self.objects[o.index()]
                                    .fields
                                    .get(f as usize)
                                    .unwrap_or(&o),
                                None => o,
                            };
                            changed |= self.value_pts[dst.0 as usize].insert(picked);
                        }
                    }
                }
            }
        }
    }

    fn union_value(&mut self, dst: ValueId, src: ValueId) -> bool {
        if dst == src {
            return false;
        }
        let (d, s) = (dst.0 as usize, src.0 as usize);
        // Indices are distinct, so split the vector to borrow both.
        let (lo, hi) = self.value_pts.split_at_mut(d.max(s));
        let (dset, sset) = if d < s {
            (&mut lo[d], &hi[0])
        } else {
            (&mut hi[0], &lo[s])
        };
        let before = dset.len();
        dset.extend(sset.iter().copied());
        dset.len() != before
    }

    /// Memory-object sets a function touches, directly and through the
    /// direct calls it makes. Union over a cyclic call graph, so iterate
    /// to a fixed point.
    fn derive_memory_maps(&mut self, module: &Module, opts: &Options) {
        for (fi, f) in module.functions.iter().enumerate() {
            let fid = FuncId(fi as u32);
            let mut used = FxHashSet::default();
            for inst in &f.insts {
                let ptr = match &inst.opcode {
                    Opcode::Load { ptr } => Some(*ptr),
                    Opcode::Store { ptr, .. } => Some(*ptr),
                    _ => None,
                };
                let Some(ptr) = ptr else { continue };
                if let Some(v) = module.value_ref(fid, ptr) {
                    let objs: Vec<MemObjectId> = self.points_to(v).iter().copied().collect();
                    for o in objs {
                        used.insert(o);
                        self.object_users.entry(o).or_default().insert(fid);
                    }
                }
            }
            self.func_memory.insert(fid, used);
        }
        if opts.skip_internal_calls {
            return;
        }
        let mut changed = true;
        while changed {
            changed = false;
            for (fi, f) in module.functions.iter().enumerate() {
                let fid = FuncId(fi as u32);
                for inst in &f.insts {
                    let Opcode::Call {
                        callee: Callee::Direct(callee),
                        ..
                    } = &inst.opcode
                    else {
                        continue;
                    };
                    let callee_mem: Vec<MemObjectId> = self
                        .func_memory
                        .get(callee)
                        .map(|s| s.iter().copied().collect())
                        .unwrap_or_default();
                    let mine = self.func_memory.entry(fid).or_default();
                    for o in callee_mem {
                        changed |= mine.insert(o);
                    }
                }
            }
        }
    }

    /// Every tracked value and its solved set.
    pub fn values(&self) -> impl Iterator<Item = (ValueRef, &FxHashSet<MemObjectId>)> {
        self.values
            .iter()
            .map(|(v, id)| (*v, &self.value_pts[id.0 as usize]))
    }

    pub fn value_id(&self, v: ValueRef) -> Option<ValueId> {
        self.values.get(&v).copied()
    }

    pub fn object(&self, id: MemObjectId) -> &MemObject {
        &self.objects[id.index()]
    }

    pub fn objects(&self) -> impl Iterator<Item = (MemObjectId, &MemObject)> {
        self.objects
            .iter()
            .enumerate()
            .map(|(i, o)| (MemObjectId(i as u32), o))
    }

    pub fn site_object(&self, site: AllocSite) -> Option<MemObjectId> {
        self.sites.get(&site).copied()
    }

    /// Points-to set of a value. Empty means unresolved, which clients
    /// must treat as "could be anything".
    pub fn points_to(&self, v: ValueRef) -> &FxHashSet<MemObjectId> {
        match self.values.get(&v) {
            Some(id) => &self.value_pts[id.0 as usize],
            None => &self.empty,
        }
    }

    /// What the contents of an object may point at.
    pub fn object_points_to(&self, o: MemObjectId) -> &FxHashSet<MemObjectId> {
        &self.object_pts[o.index()]
    }

    /// The single object a value points at, when the analysis pinned it
    /// down exactly. This is the precision lever most clients want.
    pub fn unique_object(&self, v: ValueRef) -> Option<MemObjectId> {
        let pts = self.points_to(v);
        if pts.len() == 1 {
            pts.iter().next().copied()
        } else {
            None
        }
    }

    /// May the two values point at overlapping memory? Unresolved values
    /// alias everything.
    pub fn may_alias(&self, a: ValueRef, b: ValueRef) -> bool {
        let pa = self.points_to(a);
        let pb = self.points_to(b);
        if pa.is_empty() || pb.is_empty() {
            return true;
        }
        !pa.is_disjoint(pb)
    }

    /// True only when both sides were resolved and provably disjoint.
    /// The verdict holds at object granularity, so it covers any access
    /// size; sizes of 0 mean unknown.
    pub fn is_no_alias(&self, a: ValueRef, _size_a: u64, b: ValueRef, _size_b: u64) -> bool {
        let pa = self.points_to(a);
        let pb = self.points_to(b);
        !pa.is_empty() && !pb.is_empty() && pa.is_disjoint(pb)
    }

    /// Objects touched by the callee of a direct call to a defined
    /// function, transitively. `None` when the call target is external or
    /// indirect, in which case the caller must assume everything.
    pub fn used_memory(
        &self,
        module: &Module,
        func: FuncId,
        call: InstId,
    ) -> Option<&FxHashSet<MemObjectId>> {
        let inst = module.function(func).inst(call);
        let Opcode::Call {
            callee: Callee::Direct(callee),
            ..
        } = &inst.opcode
        else {
            return None;
        };
        if module.function(*callee).is_declaration {
            return None;
        }
        self.func_memory.get(callee)
    }

    /// All objects a function loads or stores (transitive over direct
    /// calls).
    pub fn function_memory(&self, func: FuncId) -> &FxHashSet<MemObjectId> {
        self.func_memory.get(&func).unwrap_or(&self.empty)
    }

    /// Functions that directly access an object. An object with exactly
    /// one user is private to that function.
    pub fn object_users(&self, o: MemObjectId) -> Option<&FxHashSet<FuncId>> {
        self.object_users.get(&o)
    }
}

/// Walks the module once, numbering values, creating objects, and
/// emitting constraints.
struct Collector<'m> {
    module: &'m Module,
    registry: &'m AllocRegistry,
    opts: &'m Options,
    pa: PointsToAnalysis,
    constraints: Vec<Constraint>,
}

impl Collector<'_> {
    fn collect(&mut self) {
        for (gi, g) in self.module.globals.iter().enumerate() {
            let gid = GlobalId(gi as u32);
            let obj = self.create_object(&g.name, AllocSite::Global(gid), Some(g.ty), None);
            let dst = self.value(ValueRef::Global(gid));
            self.constraints
                .push(Constraint::AddressOf { dst, object: obj });
        }
        // Initializers seed the object contents: a global holding
        // another global's address points at it before any code runs.
        for (gi, g) in self.module.globals.iter().enumerate() {
            let obj = self.pa.sites[&AllocSite::Global(GlobalId(gi as u32))];
            for r in &g.init_refs {
                let target = self.pa.sites[&AllocSite::Global(*r)];
                self.pa.object_pts[obj.index()].insert(target);
            }
        }
        for fi in 0..self.module.functions.len() {
            let fid = FuncId(fi as u32);
            if !self.module.function(fid).is_declaration {
                self.collect_function(fid);
            }
        }
    }

    fn collect_function(&mut self, fid: FuncId) {
        let f = self.module.function(fid);
        for (ii, inst) in f.insts.iter().enumerate() {
            let iid = InstId(ii as u32);
            let result = ValueRef::Inst(fid, iid);
            match &inst.opcode {
                Opcode::Alloca { allocated } => {
                    let name = format!("{}.alloca{}", f.name, ii);
                    let obj = self.create_object(
                        &name,
                        AllocSite::Stack(fid, iid),
                        Some(*allocated),
                        None,
                    );
                    let dst = self.value(result);
                    self.constraints
                        .push(Constraint::AddressOf { dst, object: obj });
                }
                Opcode::Load { ptr } => {
                    if !self.module.is_pointer_like(inst.ty) {
                        continue;
                    }
                    if let Some(src) = self.value_of(fid, *ptr) {
                        let dst = self.value(result);
                        self.constraints.push(Constraint::Load { dst, src });
                    }
                }
                Opcode::Store { ptr, value } => {
                    let (Some(dst), Some(src)) =
                        (self.value_of(fid, *ptr), self.value_of(fid, *value))
                    else {
                        continue;
                    };
                    self.constraints.push(Constraint::Store { dst, src });
                }
                Opcode::Gep { base, indices } => {
                    if let Some(b) = self.value_of(fid, *base) {
                        let field = self.struct_field(fid, *base, indices);
                        let dst = self.value(result);
                        self.constraints.push(Constraint::Gep {
                            dst,
                            base: b,
                            field,
                        });
                    }
                }
                Opcode::Phi { incoming } => {
                    for (_, v) in incoming {
                        self.copy_into(fid, result, *v);
                    }
                }
                Opcode::Select {
                    on_true, on_false, ..
                } => {
                    self.copy_into(fid, result, *on_true);
                    self.copy_into(fid, result, *on_false);
                }
                Opcode::Cast { value, .. } => {
                    self.copy_into(fid, result, *value);
                }
                Opcode::Call { callee, args } => {
                    self.collect_call(fid, iid, callee, args);
                }
                Opcode::Bin { .. }
                | Opcode::Icmp { .. }
                | Opcode::Br { .. }
                | Opcode::CondBr { .. }
                | Opcode::Ret { .. } => {}
            }
        }
    }

    fn collect_call(&mut self, fid: FuncId, iid: InstId, callee: &Callee, args: &[Operand]) {
        let result = ValueRef::Inst(fid, iid);
        let target = match callee {
            Callee::Direct(t) => *t,
            Callee::Indirect(_) => {
                debug!(func = fid.0, inst = iid.0, "indirect call left unresolved");
                return;
            }
        };
        let callee_fn = self.module.function(target);
        if callee_fn.is_declaration {
            match self.registry.classify(&callee_fn.name) {
                Some(kind) => self.collect_heap_alloc(fid, iid, kind, args),
                None => {
                    debug!(
                        callee = %callee_fn.name,
                        "external call left unresolved"
                    );
                }
            }
            return;
        }
        if self.opts.skip_internal_calls {
            return;
        }
        // Arguments flow into parameters, returned values flow back.
        for (i, arg) in args.iter().enumerate() {
            if i >= callee_fn.params.len() {
                break;
            }
            if let Some(src) = self.value_of(fid, *arg) {
                let dst = self.value(ValueRef::Param(target, i as u32));
                self.constraints.push(Constraint::Copy { dst, src });
            }
        }
        let rets: Vec<Operand> = callee_fn
            .insts
            .iter()
            .filter_map(|inst| match inst.opcode {
                Opcode::Ret { value: Some(v) } => Some(v),
                _ => None,
            })
            .collect();
        for v in rets {
            if let Some(src) = self.value_of(target, v) {
                let dst = self.value(result);
                self.constraints.push(Constraint::Copy { dst, src });
            }
        }
    }

    fn collect_heap_alloc(&mut self, fid: FuncId, iid: InstId, kind: AllocKind, args: &[Operand]) {
        let f = self.module.function(fid);
        let result = ValueRef::Inst(fid, iid);
        let pointee = self.module.pointee_ty(fid, Operand::Inst(iid));
        let byte_size = match kind {
            AllocKind::Sized { size_arg } => args
                .get(size_arg as usize)
                .and_then(Operand::as_const)
                .map(|c| c as u64),
            AllocKind::Counted {
                count_arg,
                size_arg,
            } => {
                let count = args.get(count_arg as usize).and_then(Operand::as_const);
                let size = args.get(size_arg as usize).and_then(Operand::as_const);
                count.zip(size).map(|(c, s)| (c * s) as u64)
            }
            AllocKind::Resize { ptr_arg, size_arg } => {
                // The result aliases the pointer that was passed in.
                if let Some(old) = args.get(ptr_arg as usize) {
                    self.copy_into(fid, result, *old);
                }
                args.get(size_arg as usize)
                    .and_then(Operand::as_const)
                    .map(|c| c as u64)
            }
            AllocKind::Opaque => None,
        };
        let name = format!("{}.heap{}", f.name, iid.0);
        let obj = self.create_object(&name, AllocSite::Heap(fid, iid), pointee, byte_size);
        let dst = self.value(result);
        self.constraints
            .push(Constraint::AddressOf { dst, object: obj });
    }

    /// The field selected by a GEP, when the base is a struct pointer and
    /// the first two indices have the `[0, const]` shape. Anything else
    /// degrades to the whole object.
    fn struct_field(&self, fid: FuncId, base: Operand, indices: &[Operand]) -> Option<u32> {
        let pointee = self.module.pointee_ty(fid, base)?;
        if !matches!(self.module.types.get(pointee), Type::Struct { .. }) {
            return None;
        }
        match indices {
            [first, second, ..] if first.as_const() == Some(0) => {
                second.as_const().map(|f| f as u32)
            }
            _ => None,
        }
    }

    fn copy_into(&mut self, fid: FuncId, dst: ValueRef, src: Operand) {
        if let Some(s) = self.value_of(fid, src) {
            let d = self.value(dst);
            self.constraints.push(Constraint::Copy { dst: d, src: s });
        }
    }

    fn value(&mut self, v: ValueRef) -> ValueId {
        if let Some(id) = self.pa.values.get(&v) {
            return *id;
        }
        let id = ValueId(self.pa.value_pts.len() as u32);
        self.pa.values.insert(v, id);
        self.pa.value_pts.push(FxHashSet::default());
        id
    }

    fn value_of(&mut self, fid: FuncId, op: Operand) -> Option<ValueId> {
        let v = self.module.value_ref(fid, op)?;
        if matches!(v, ValueRef::Null) {
            return None;
        }
        Some(self.value(v))
    }

    /// Creates the object for an allocation site, recursing into struct
    /// fields. Array dimensions are peeled onto the object itself, so an
    /// `[10 x [20 x i32]]` site is one object with `dims = [10, 20]`.
    fn create_object(
        &mut self,
        name: &str,
        site: AllocSite,
        ty: Option<TypeId>,
        byte_size: Option<u64>,
    ) -> MemObjectId {
        let obj = self.create_object_rec(name, site, ty, byte_size, None, None);
        self.pa.sites.insert(site, obj);
        obj
    }

    fn create_object_rec(
        &mut self,
        name: &str,
        site: AllocSite,
        ty: Option<TypeId>,
        byte_size: Option<u64>,
        parent: Option<MemObjectId>,
        field_index: Option<u32>,
    ) -> MemObjectId {
        let types = &self.module.types;
        let layout = &self.module.layout;
        let (dims, elem) = match ty {
            Some(t) => {
                let (dims, elem) = types.array_dims(t);
                (dims, Some(elem))
            }
            None => (Vec::new(), None),
        };
        let element_size = elem.map(|e| layout.size_of(types, e)).unwrap_or(1);
        let id = MemObjectId(self.pa.objects.len() as u32);
        self.pa.objects.push(MemObject {
            name: name.to_owned(),
            site,
            element_size,
            dims,
            parent,
            field_index,
            fields: Vec::new(),
            byte_size,
        });
        self.pa.object_pts.push(FxHashSet::default());
        if let Some(Type::Struct { fields }) = elem.map(|e| types.get(e).clone()) {
            let children: Vec<MemObjectId> = fields
                .iter()
                .enumerate()
                .map(|(i, fty)| {
                    self.create_object_rec(
                        &format!("{name}.f{i}"),
                        site,
                        Some(*fty),
                        None,
                        Some(id),
                        Some(i as u32),
                    )
                })
                .collect();
            self.pa.objects[id.index()].fields = children;
        }
        id
    }
}
