// SPDX-License-Identifier: BSD-3-Clause
//! Interned types and target data layout.

use serde::{Deserialize, Serialize};

/// Index into the module's [`TypeTable`].
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub u32);

#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Type {
    Void,
    /// Integer of the given bit width.
    Int(u32),
    Float,
    Double,
    Ptr(TypeId),
    Array { elem: TypeId, len: u64 },
    Struct { fields: Vec<TypeId> },
}

impl Type {
    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Ptr(_))
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Type::Array { .. } | Type::Struct { .. })
    }
}

/// All types in a module, deduplicated so a [`TypeId`] is a cheap identity.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TypeTable {
    types: Vec<Type>,
}

impl TypeTable {
    pub fn intern(&mut self, ty: Type) -> TypeId {
        if let Some(i) = self.types.iter().position(|t| *t == ty) {
            return TypeId(i as u32);
        }
        self.types.push(ty);
        TypeId(self.types.len() as u32 - 1)
    }

    pub fn get(&self, id: TypeId) -> &Type {
        &self.types[id.0 as usize]
    }

    pub fn pointee(&self, id: TypeId) -> Option<TypeId> {
        match self.get(id) {
            Type::Ptr(p) => Some(*p),
            _ => None,
        }
    }

    /// Peels all array dimensions off `id`, innermost element last.
    pub fn array_dims(&self, mut id: TypeId) -> (Vec<u64>, TypeId) {
        let mut dims = Vec::new();
        while let Type::Array { elem, len } = self.get(id) {
            dims.push(*len);
            id = *elem;
        }
        (dims, id)
    }
}

/// Pointer size and derived type sizes. Sizes are in bytes; there is no
/// padding model, fields are laid out back to back.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DataLayout {
    pub pointer_size: u64,
}

impl Default for DataLayout {
    fn default() -> Self {
        DataLayout { pointer_size: 8 }
    }
}

impl DataLayout {
    pub fn size_of(&self, types: &TypeTable, id: TypeId) -> u64 {
        match types.get(id) {
            Type::Void => 0,
            Type::Int(bits) => u64::from((bits + 7) / 8),
            Type::Float => 4,
            Type::Double => 8,
            Type::Ptr(_) => self.pointer_size,
            Type::Array { elem, len } => self.size_of(types, *elem) * len,
            Type::Struct { fields } => fields.iter().map(|f| self.size_of(types, *f)).sum(),
        }
    }

    /// Byte offset of `field` within a struct type.
    ///
    /// Panics if `id` is not a struct or the index is out of range: a
    /// malformed field index means an earlier pass produced a bad
    /// module, not an analyzable program.
    pub fn struct_offset(&self, types: &TypeTable, id: TypeId, field: usize) -> u64 {
        match types.get(id) {
            Type::Struct { fields } => {
                assert!(field < fields.len(), "struct field index out of range");
                fields[..field]
                    .iter()
                    .map(|f| self.size_of(types, *f))
                    .sum()
            }
            other => panic!("struct_offset on non-struct type {other:?}"),
        }
    }
}
