// SPDX-License-Identifier: BSD-3-Clause
//! Programmatic module construction.
//!
//! Tests and front-end glue build modules through these builders rather
//! than filling in the arenas by hand; `finish` checks the invariants the
//! analyses rely on (ids in range, loop nesting consistent, exactly one
//! terminator per block).

use thiserror::Error;

use super::{
    Block, BlockId, Callee, FuncId, Function, Global, GlobalId, Inst, InstId, LoopId, LoopInfo,
    Module, Opcode, Operand, Param, Type, TypeId,
};

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("function {func}: instruction {inst} references out-of-range {what}")]
    BadReference {
        func: String,
        inst: u32,
        what: &'static str,
    },
    #[error("function {func}: block {block} has no terminator")]
    MissingTerminator { func: String, block: String },
    #[error("function {func}: loop {loop_id} header {header} is outside its block set")]
    LoopHeaderOutside {
        func: String,
        loop_id: u32,
        header: u32,
    },
    #[error("function {func}: sub-loop {sub} of loop {parent} has block {block} outside the parent")]
    LoopNestBroken {
        func: String,
        parent: u32,
        sub: u32,
        block: u32,
    },
    #[error("duplicate function name {0:?}")]
    DuplicateFunction(String),
}

pub struct ModuleBuilder {
    module: Module,
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        ModuleBuilder {
            module: Module::default(),
        }
    }
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ty(&mut self, ty: Type) -> TypeId {
        self.module.types.intern(ty)
    }

    pub fn ptr_to(&mut self, pointee: TypeId) -> TypeId {
        self.module.types.intern(Type::Ptr(pointee))
    }

    pub fn global(&mut self, name: &str, ty: TypeId, is_internal: bool) -> GlobalId {
        self.module.globals.push(Global {
            name: name.to_owned(),
            ty,
            is_internal,
            is_const: false,
            init_refs: Vec::new(),
        });
        GlobalId(self.module.globals.len() as u32 - 1)
    }

    /// A global whose storage is never written after initialization.
    pub fn const_global(&mut self, name: &str, ty: TypeId, is_internal: bool) -> GlobalId {
        let id = self.global(name, ty, is_internal);
        self.module.globals[id.index()].is_const = true;
        id
    }

    /// Records which globals' addresses appear in `g`'s initializer.
    pub fn init_global(&mut self, g: GlobalId, refs: Vec<GlobalId>) {
        self.module.globals[g.index()].init_refs = refs;
    }

    /// Declares an external function with no body. Calls to it are
    /// treated as opaque unless an allocator registry says otherwise.
    pub fn declare(&mut self, name: &str, params: &[TypeId], ret: TypeId) -> FuncId {
        self.module.functions.push(Function {
            name: name.to_owned(),
            params: params
                .iter()
                .enumerate()
                .map(|(i, ty)| Param {
                    name: format!("p{i}"),
                    ty: *ty,
                })
                .collect(),
            ret,
            insts: Vec::new(),
            blocks: Vec::new(),
            loops: Vec::new(),
            is_declaration: true,
        });
        FuncId(self.module.functions.len() as u32 - 1)
    }

    pub fn define(&mut self, name: &str, params: &[TypeId], ret: TypeId) -> FunctionBuilder<'_> {
        let void = self.module.types.intern(Type::Void);
        let id = self.declare(name, params, ret);
        let f = &mut self.module.functions[id.index()];
        f.is_declaration = false;
        FunctionBuilder { func: f, id, void }
    }

    /// Re-enter an already-defined function, e.g. to add loop records
    /// after its blocks exist.
    pub fn resume(&mut self, id: FuncId) -> FunctionBuilder<'_> {
        let void = self.module.types.intern(Type::Void);
        FunctionBuilder {
            func: &mut self.module.functions[id.index()],
            id,
            void,
        }
    }

    pub fn finish(self) -> Result<Module, ModuleError> {
        let m = self.module;
        for (i, f) in m.functions.iter().enumerate() {
            if m.functions[..i].iter().any(|g| g.name == f.name) {
                return Err(ModuleError::DuplicateFunction(f.name.clone()));
            }
            validate_function(&m, f)?;
        }
        Ok(m)
    }
}

fn validate_function(m: &Module, f: &Function) -> Result<(), ModuleError> {
    let bad = |inst: u32, what: &'static str| ModuleError::BadReference {
        func: f.name.clone(),
        inst,
        what,
    };
    for (i, inst) in f.insts.iter().enumerate() {
        let i = i as u32;
        for op in inst.operands() {
            match op {
                Operand::Inst(x) if x.index() >= f.insts.len() => {
                    return Err(bad(i, "instruction"))
                }
                Operand::Param(p) if p as usize >= f.params.len() => {
                    return Err(bad(i, "parameter"))
                }
                Operand::Global(g) if g.index() >= m.globals.len() => {
                    return Err(bad(i, "global"))
                }
                Operand::Func(c) if c.index() >= m.functions.len() => {
                    return Err(bad(i, "function"))
                }
                _ => {}
            }
        }
        if let Opcode::Call {
            callee: Callee::Direct(c),
            ..
        } = &inst.opcode
        {
            if c.index() >= m.functions.len() {
                return Err(bad(i, "callee"));
            }
        }
    }
    for block in &f.blocks {
        let terminated = block.insts.last().is_some_and(|id| {
            matches!(
                f.inst(*id).opcode,
                Opcode::Br { .. } | Opcode::CondBr { .. } | Opcode::Ret { .. }
            )
        });
        if !terminated {
            return Err(ModuleError::MissingTerminator {
                func: f.name.clone(),
                block: block.name.clone(),
            });
        }
    }
    for (li, l) in f.loops.iter().enumerate() {
        if !l.contains(l.header) {
            return Err(ModuleError::LoopHeaderOutside {
                func: f.name.clone(),
                loop_id: li as u32,
                header: l.header.0,
            });
        }
        for sub in &l.sub_loops {
            for b in &f.loops[sub.index()].blocks {
                if !l.contains(*b) {
                    return Err(ModuleError::LoopNestBroken {
                        func: f.name.clone(),
                        parent: li as u32,
                        sub: sub.0,
                        block: b.0,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Appends blocks and instructions to one function. Instructions go into
/// the block most recently opened with [`FunctionBuilder::block`].
pub struct FunctionBuilder<'m> {
    func: &'m mut Function,
    id: FuncId,
    void: TypeId,
}

impl FunctionBuilder<'_> {
    pub fn id(&self) -> FuncId {
        self.id
    }

    /// Id the next call to [`FunctionBuilder::block`] will return, so a
    /// branch can name a block before it exists.
    pub fn next_block_id(&self) -> BlockId {
        BlockId(self.func.blocks.len() as u32)
    }

    pub fn block(&mut self, name: &str) -> BlockId {
        self.func.blocks.push(Block {
            name: name.to_owned(),
            insts: Vec::new(),
        });
        BlockId(self.func.blocks.len() as u32 - 1)
    }

    pub fn inst(&mut self, ty: TypeId, opcode: Opcode) -> InstId {
        self.func.insts.push(Inst { ty, opcode });
        let id = InstId(self.func.insts.len() as u32 - 1);
        if let Some(b) = self.func.blocks.last_mut() {
            b.insts.push(id);
        }
        id
    }

    pub fn alloca(&mut self, ptr_ty: TypeId, allocated: TypeId) -> InstId {
        self.inst(ptr_ty, Opcode::Alloca { allocated })
    }

    pub fn load(&mut self, ty: TypeId, ptr: Operand) -> InstId {
        self.inst(ty, Opcode::Load { ptr })
    }

    pub fn store(&mut self, ptr: Operand, value: Operand) -> InstId {
        self.inst(self.void, Opcode::Store { ptr, value })
    }

    pub fn gep(&mut self, ty: TypeId, base: Operand, indices: Vec<Operand>) -> InstId {
        self.inst(ty, Opcode::Gep { base, indices })
    }

    pub fn phi(&mut self, ty: TypeId, incoming: Vec<(BlockId, Operand)>) -> InstId {
        self.inst(ty, Opcode::Phi { incoming })
    }

    pub fn select(&mut self, ty: TypeId, cond: Operand, on_true: Operand, on_false: Operand) -> InstId {
        self.inst(ty, Opcode::Select { cond, on_true, on_false })
    }

    pub fn call(&mut self, ty: TypeId, callee: FuncId, args: Vec<Operand>) -> InstId {
        self.inst(
            ty,
            Opcode::Call {
                callee: Callee::Direct(callee),
                args,
            },
        )
    }

    pub fn bin(&mut self, ty: TypeId, op: super::BinOp, lhs: Operand, rhs: Operand) -> InstId {
        self.inst(ty, Opcode::Bin { op, lhs, rhs })
    }

    pub fn icmp(&mut self, ty: TypeId, pred: super::Predicate, lhs: Operand, rhs: Operand) -> InstId {
        self.inst(ty, Opcode::Icmp { pred, lhs, rhs })
    }

    pub fn cast(&mut self, ty: TypeId, kind: super::CastKind, value: Operand) -> InstId {
        self.inst(ty, Opcode::Cast { kind, value })
    }

    pub fn br(&mut self, dest: BlockId) -> InstId {
        self.inst(self.void, Opcode::Br { dest })
    }

    pub fn cond_br(&mut self, cond: Operand, on_true: BlockId, on_false: BlockId) -> InstId {
        self.inst(self.void, Opcode::CondBr { cond, on_true, on_false })
    }

    pub fn ret(&mut self, value: Option<Operand>) -> InstId {
        self.inst(self.void, Opcode::Ret { value })
    }

    pub fn add_loop(&mut self, info: LoopInfo) -> LoopId {
        self.func.loops.push(info);
        LoopId(self.func.loops.len() as u32 - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminator_required() {
        let mut b = ModuleBuilder::new();
        let i32t = b.ty(Type::Int(32));
        let void = b.ty(Type::Void);
        let mut f = b.define("f", &[], void);
        f.block("entry");
        f.inst(i32t, Opcode::Bin {
            op: crate::ir::BinOp::Add,
            lhs: Operand::Const(1),
            rhs: Operand::Const(2),
        });
        assert!(matches!(
            b.finish(),
            Err(ModuleError::MissingTerminator { .. })
        ));
    }

    #[test]
    fn out_of_range_operand_rejected() {
        let mut b = ModuleBuilder::new();
        let void = b.ty(Type::Void);
        let i32t = b.ty(Type::Int(32));
        let mut f = b.define("f", &[], void);
        f.block("entry");
        f.load(i32t, Operand::Inst(InstId(99)));
        f.ret(None);
        assert!(matches!(b.finish(), Err(ModuleError::BadReference { .. })));
    }

    #[test]
    fn loop_nesting_validated() {
        let mut b = ModuleBuilder::new();
        let void = b.ty(Type::Void);
        let mut f = b.define("f", &[], void);
        let entry = f.block("entry");
        f.ret(None);
        let header = f.block("header");
        f.br(entry);
        f.add_loop(LoopInfo {
            header,
            blocks: vec![entry], // header missing
            sub_loops: vec![],
            parent: None,
        });
        assert!(matches!(
            b.finish(),
            Err(ModuleError::LoopHeaderOutside { .. })
        ));
    }
}
