// SPDX-License-Identifier: BSD-3-Clause
//! In-memory program representation.
//!
//! A [`Module`] owns all functions, globals, and the interned type table.
//! Everything else is an index: instructions live in per-function arenas
//! and are named by [`InstId`], so cross-references are plain `u32`s and
//! the analyses can key tables by id without borrowing the module.
//!
//! Loop structure is part of the input ([`LoopInfo`] records per
//! function), not something this crate rediscovers from the CFG.

pub mod build;
pub mod types;

use serde::{Deserialize, Serialize};

pub use types::{DataLayout, Type, TypeId, TypeTable};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

id_type!(
    /// Index into [`Module::functions`].
    FuncId
);
id_type!(
    /// Index into [`Module::globals`].
    GlobalId
);
id_type!(
    /// Index into [`Function::blocks`].
    BlockId
);
id_type!(
    /// Index into [`Function::insts`].
    InstId
);
id_type!(
    /// Index into [`Function::loops`].
    LoopId
);

/// An operand of an instruction, local to one function.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Inst(InstId),
    Param(u32),
    Global(GlobalId),
    Func(FuncId),
    Const(i64),
    Null,
}

impl Operand {
    pub fn as_const(&self) -> Option<i64> {
        match self {
            Operand::Const(c) => Some(*c),
            Operand::Null => Some(0),
            _ => None,
        }
    }
}

/// A value named from outside its defining function. This is the key type
/// for alias and points-to queries, which span the whole module.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValueRef {
    Inst(FuncId, InstId),
    Param(FuncId, u32),
    Global(GlobalId),
    Func(FuncId),
    Null,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Shl,
    Or,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum CastKind {
    BitCast,
    PtrToInt,
    IntToPtr,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Predicate {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Callee {
    Direct(FuncId),
    Indirect(Operand),
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    /// Stack allocation of one `allocated` value.
    Alloca { allocated: TypeId },
    Load { ptr: Operand },
    Store { ptr: Operand, value: Operand },
    /// Pointer arithmetic. Indices follow the usual convention: the first
    /// index steps over whole pointees, later indices descend into
    /// aggregate fields and array elements.
    Gep { base: Operand, indices: Vec<Operand> },
    Phi { incoming: Vec<(BlockId, Operand)> },
    Select { cond: Operand, on_true: Operand, on_false: Operand },
    Call { callee: Callee, args: Vec<Operand> },
    Bin { op: BinOp, lhs: Operand, rhs: Operand },
    Icmp { pred: Predicate, lhs: Operand, rhs: Operand },
    Cast { kind: CastKind, value: Operand },
    Br { dest: BlockId },
    CondBr { cond: Operand, on_true: BlockId, on_false: BlockId },
    Ret { value: Option<Operand> },
}

/// One instruction. `ty` is the type of the value the instruction
/// produces ([`Type::Void`] for stores, branches, and void calls).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Inst {
    pub ty: TypeId,
    pub opcode: Opcode,
}

impl Inst {
    pub fn operands(&self) -> Vec<Operand> {
        self.opcode.operands()
    }
}

impl Opcode {
    /// Operands read by this instruction, in a fresh vector. Convenient
    /// for use-scanning passes that do not care which role each operand
    /// plays.
    pub fn operands(&self) -> Vec<Operand> {
        match self {
            Opcode::Alloca { .. } => vec![],
            Opcode::Load { ptr } => vec![*ptr],
            Opcode::Store { ptr, value } => vec![*ptr, *value],
            Opcode::Gep { base, indices } => {
                let mut ops = vec![*base];
                ops.extend(indices.iter().copied());
                ops
            }
            Opcode::Phi { incoming } => incoming.iter().map(|(_, v)| *v).collect(),
            Opcode::Select { cond, on_true, on_false } => vec![*cond, *on_true, *on_false],
            Opcode::Call { callee, args } => {
                let mut ops = Vec::new();
                if let Callee::Indirect(f) = callee {
                    ops.push(*f);
                }
                ops.extend(args.iter().copied());
                ops
            }
            Opcode::Bin { lhs, rhs, .. } | Opcode::Icmp { lhs, rhs, .. } => vec![*lhs, *rhs],
            Opcode::Cast { value, .. } => vec![*value],
            Opcode::Br { .. } => vec![],
            Opcode::CondBr { cond, .. } => vec![*cond],
            Opcode::Ret { value } => value.iter().copied().collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    pub insts: Vec<InstId>,
}

/// One natural loop. Nesting is explicit: `sub_loops` lists the loops
/// directly contained in this one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoopInfo {
    pub header: BlockId,
    /// All blocks in the loop, including sub-loop blocks and the header.
    pub blocks: Vec<BlockId>,
    pub sub_loops: Vec<LoopId>,
    pub parent: Option<LoopId>,
}

impl LoopInfo {
    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.contains(&block)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: TypeId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: TypeId,
    /// Arena of instructions; blocks reference into it by [`InstId`].
    pub insts: Vec<Inst>,
    pub blocks: Vec<Block>,
    pub loops: Vec<LoopInfo>,
    /// Declarations have no blocks and are treated as opaque externals.
    pub is_declaration: bool,
}

impl Function {
    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.index()]
    }

    /// Top-level loops of this function (those with no parent).
    pub fn top_level_loops(&self) -> impl Iterator<Item = LoopId> + '_ {
        (0..self.loops.len() as u32)
            .map(LoopId)
            .filter(|l| self.loops[l.index()].parent.is_none())
    }

    /// The block an instruction lives in, if it is reachable from any
    /// block's instruction list.
    pub fn block_of(&self, inst: InstId) -> Option<BlockId> {
        (0..self.blocks.len() as u32)
            .map(BlockId)
            .find(|b| self.blocks[b.index()].insts.contains(&inst))
    }
}

/// Linkage is only two-valued here: a global either escapes the module
/// or it does not.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Global {
    pub name: String,
    /// Type of the value stored at the global, not of the address.
    pub ty: TypeId,
    pub is_internal: bool,
    /// Read-only storage: the contents never change after initialization.
    #[serde(default)]
    pub is_const: bool,
    /// Globals whose address appears in this global's initializer.
    #[serde(default)]
    pub init_refs: Vec<GlobalId>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Module {
    pub types: TypeTable,
    pub layout: DataLayout,
    pub globals: Vec<Global>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.index()]
    }

    pub fn global(&self, id: GlobalId) -> &Global {
        &self.globals[id.index()]
    }

    pub fn function_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncId(i as u32))
    }

    /// Module-wide identity of a local operand, or `None` for constants
    /// (which have no address and no points-to set).
    pub fn value_ref(&self, func: FuncId, op: Operand) -> Option<ValueRef> {
        match op {
            Operand::Inst(i) => Some(ValueRef::Inst(func, i)),
            Operand::Param(p) => Some(ValueRef::Param(func, p)),
            Operand::Global(g) => Some(ValueRef::Global(g)),
            Operand::Func(f) => Some(ValueRef::Func(f)),
            Operand::Null => Some(ValueRef::Null),
            Operand::Const(_) => None,
        }
    }

    /// The type a pointer operand points at, or `None` when the operand
    /// is not a typed pointer. A global operand is the address of its
    /// stored value, so its pointee is `Global::ty`.
    pub fn pointee_ty(&self, func: FuncId, op: Operand) -> Option<TypeId> {
        let f = self.function(func);
        match op {
            Operand::Inst(i) => self.types.pointee(f.inst(i).ty),
            Operand::Param(p) => self.types.pointee(f.params[p as usize].ty),
            Operand::Global(g) => Some(self.global(g).ty),
            Operand::Func(_) | Operand::Null | Operand::Const(_) => None,
        }
    }

    /// True when a value of this type can carry a memory address.
    /// `PtrToInt`/`IntToPtr` round trips mean integers qualify.
    pub fn is_pointer_like(&self, ty: TypeId) -> bool {
        matches!(self.types.get(ty), Type::Ptr(_) | Type::Int(_))
    }
}
