//! Type representation for Ferrule
//!
//! Types are interned in a `TypeTable`: each distinct shape gets one
//! `TypeId`, so anonymous composites that look alike share an id and that id
//! doubles as the runtime tag of a boxed `any`. Named types (structs,
//! inttypes, handletypes) are identified by the node that declares them.

use crate::ast::NodeId;
use std::collections::HashMap;

/// Index of an interned type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

impl TypeId {
    pub const INT: TypeId = TypeId(0);
    pub const FLOAT: TypeId = TypeId(1);
    pub const BOOL: TypeId = TypeId(2);
    pub const STRING: TypeId = TypeId(3);
    pub const VOID: TypeId = TypeId(4);
    pub const ANY: TypeId = TypeId(5);
    /// Type of the `null` literal before it meets an expected type
    pub const NULL: TypeId = TypeId(6);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Int,
    Float,
    Bool,
    Str,
    Void,
    Any,
    Null,
    List(TypeId),
    Tuple(Vec<TypeId>),
    Error(TypeId),
    Func { ret: TypeId, params: Vec<TypeId> },
    Struct(NodeId),
    IntType(NodeId),
    Handle(NodeId),
}

/// Layout of a declared struct
#[derive(Debug, Clone)]
pub struct StructInfo {
    pub name: String,
    pub fields: Vec<(String, TypeId)>,
}

/// A declared inttype or handletype
#[derive(Debug, Clone)]
pub struct NominalInfo {
    pub name: String,
    pub parent: Option<TypeId>,
}

/// Interned types plus the side tables for named declarations
#[derive(Debug, Clone)]
pub struct TypeTable {
    types: Vec<Type>,
    index: HashMap<Type, TypeId>,
    structs: HashMap<NodeId, StructInfo>,
    nominals: HashMap<NodeId, NominalInfo>,
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeTable {
    pub fn new() -> Self {
        let mut table = Self {
            types: Vec::new(),
            index: HashMap::new(),
            structs: HashMap::new(),
            nominals: HashMap::new(),
        };
        for ty in [Type::Int, Type::Float, Type::Bool, Type::Str, Type::Void, Type::Any, Type::Null] {
            table.intern(ty);
        }
        table
    }

    /// Id of `ty`, creating it on first use
    pub fn intern(&mut self, ty: Type) -> TypeId {
        if let Some(&id) = self.index.get(&ty) {
            return id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(ty.clone());
        self.index.insert(ty, id);
        id
    }

    pub fn get(&self, id: TypeId) -> &Type {
        &self.types[id.0 as usize]
    }

    /// Look up an already interned type without creating it
    pub fn find(&self, ty: &Type) -> Option<TypeId> {
        self.index.get(ty).copied()
    }

    pub fn list_of(&mut self, element: TypeId) -> TypeId {
        self.intern(Type::List(element))
    }

    pub fn error_of(&mut self, payload: TypeId) -> TypeId {
        self.intern(Type::Error(payload))
    }

    pub fn func(&mut self, ret: TypeId, params: Vec<TypeId>) -> TypeId {
        self.intern(Type::Func { ret, params })
    }

    pub fn declare_struct(&mut self, decl: NodeId, name: &str) -> TypeId {
        self.structs.entry(decl).or_insert_with(|| StructInfo {
            name: name.to_string(),
            fields: Vec::new(),
        });
        self.intern(Type::Struct(decl))
    }

    pub fn set_struct_fields(&mut self, decl: NodeId, fields: Vec<(String, TypeId)>) {
        if let Some(info) = self.structs.get_mut(&decl) {
            info.fields = fields;
        }
    }

    pub fn declare_nominal(&mut self, decl: NodeId, name: &str, handle: bool) -> TypeId {
        self.nominals.entry(decl).or_insert_with(|| NominalInfo {
            name: name.to_string(),
            parent: None,
        });
        if handle {
            self.intern(Type::Handle(decl))
        } else {
            self.intern(Type::IntType(decl))
        }
    }

    pub fn set_nominal_parent(&mut self, decl: NodeId, parent: TypeId) {
        if let Some(info) = self.nominals.get_mut(&decl) {
            info.parent = Some(parent);
        }
    }

    pub fn struct_info(&self, id: TypeId) -> Option<&StructInfo> {
        match self.get(id) {
            Type::Struct(decl) => self.structs.get(decl),
            _ => None,
        }
    }

    fn nominal_info(&self, id: TypeId) -> Option<&NominalInfo> {
        match self.get(id) {
            Type::IntType(decl) | Type::Handle(decl) => self.nominals.get(decl),
            _ => None,
        }
    }

    // ==================== Equality ====================

    /// Named declarations match when they are the same declaration
    pub fn nominal_eq(&self, a: TypeId, b: TypeId) -> bool {
        match (self.get(a), self.get(b)) {
            (Type::Struct(x), Type::Struct(y))
            | (Type::IntType(x), Type::IntType(y))
            | (Type::Handle(x), Type::Handle(y)) => x == y,
            _ => false,
        }
    }

    /// Anonymous shapes match by recursive comparison; named components
    /// inside them fall back to `nominal_eq`
    pub fn structural_eq(&self, a: TypeId, b: TypeId) -> bool {
        if a == b {
            return true;
        }
        match (self.get(a), self.get(b)) {
            (Type::List(x), Type::List(y)) | (Type::Error(x), Type::Error(y)) => self.same(*x, *y),
            (Type::Tuple(xs), Type::Tuple(ys)) => {
                xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| self.same(*x, *y))
            }
            (Type::Func { ret: r1, params: p1 }, Type::Func { ret: r2, params: p2 }) => {
                self.same(*r1, *r2) && p1.len() == p2.len() && p1.iter().zip(p2).all(|(x, y)| self.same(*x, *y))
            }
            _ => false,
        }
    }

    pub fn same(&self, a: TypeId, b: TypeId) -> bool {
        if self.is_nominal(a) || self.is_nominal(b) {
            self.nominal_eq(a, b)
        } else {
            self.structural_eq(a, b)
        }
    }

    // ==================== Classification ====================

    pub fn is_nominal(&self, id: TypeId) -> bool {
        matches!(self.get(id), Type::Struct(_) | Type::IntType(_) | Type::Handle(_))
    }

    /// Values of this type live on the heap
    pub fn is_managed(&self, id: TypeId) -> bool {
        matches!(
            self.get(id),
            Type::Str | Type::Any | Type::List(_) | Type::Tuple(_) | Type::Error(_) | Type::Func { .. } | Type::Struct(_)
        )
    }

    /// Types whose default value is `null` and that accept `null`
    pub fn is_nullable(&self, id: TypeId) -> bool {
        matches!(
            self.get(id),
            Type::Any | Type::List(_) | Type::Tuple(_) | Type::Error(_) | Type::Func { .. } | Type::Struct(_) | Type::Null
        )
    }

    pub fn is_integer_like(&self, id: TypeId) -> bool {
        matches!(self.get(id), Type::Int | Type::IntType(_) | Type::Handle(_))
    }

    pub fn is_inttype(&self, id: TypeId) -> bool {
        matches!(self.get(id), Type::IntType(_))
    }

    pub fn is_handle(&self, id: TypeId) -> bool {
        matches!(self.get(id), Type::Handle(_))
    }

    /// `id` followed by every inherited ancestor, nearest first
    pub fn ancestors(&self, id: TypeId) -> Vec<TypeId> {
        let mut chain = vec![id];
        let mut current = id;
        while let Some(parent) = self.nominal_info(current).and_then(|info| info.parent) {
            if chain.contains(&parent) {
                break;
            }
            chain.push(parent);
            current = parent;
        }
        chain
    }

    /// True when `from` can widen to `to` by walking up its inheritance chain
    pub fn inherits(&self, from: TypeId, to: TypeId) -> bool {
        self.ancestors(from).iter().any(|&a| self.same(a, to))
    }

    /// For two related inttypes, the non-inherited ancestor they both widen to
    pub fn common_root(&self, a: TypeId, b: TypeId) -> Option<TypeId> {
        if !self.is_inttype(a) || !self.is_inttype(b) {
            return None;
        }
        let root_a = *self.ancestors(a).last()?;
        let root_b = *self.ancestors(b).last()?;
        if !self.same(root_a, root_b) {
            return None;
        }
        if self.inherits(a, b) || self.inherits(b, a) {
            Some(root_a)
        } else {
            None
        }
    }

    /// Readable name used in diagnostics and by the printer
    pub fn name(&self, id: TypeId) -> String {
        match self.get(id) {
            Type::Int => "int".to_string(),
            Type::Float => "float".to_string(),
            Type::Bool => "bool".to_string(),
            Type::Str => "string".to_string(),
            Type::Void => "void".to_string(),
            Type::Any => "any".to_string(),
            Type::Null => "null".to_string(),
            Type::List(inner) => format!("list<{}>", self.name(*inner)),
            Type::Error(inner) => format!("error<{}>", self.name(*inner)),
            Type::Tuple(items) => {
                let names: Vec<String> = items.iter().map(|t| self.name(*t)).collect();
                format!("tuple<{}>", names.join(", "))
            }
            Type::Func { ret, params } => {
                let names: Vec<String> = params.iter().map(|t| self.name(*t)).collect();
                format!("fn<{}({})>", self.name(*ret), names.join(", "))
            }
            Type::Struct(decl) => self.structs.get(decl).map_or_else(|| "struct".to_string(), |s| s.name.clone()),
            Type::IntType(decl) | Type::Handle(decl) => {
                self.nominals.get(decl).map_or_else(|| "inttype".to_string(), |n| n.name.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_shares_ids() {
        let mut table = TypeTable::new();
        let a = table.list_of(TypeId::INT);
        let b = table.list_of(TypeId::INT);
        assert_eq!(a, b);
        assert_ne!(a, table.list_of(TypeId::FLOAT));
        assert_eq!(table.name(a), "list<int>");
    }

    #[test]
    fn test_nominal_vs_structural() {
        let mut table = TypeTable::new();
        let meters = table.declare_nominal(NodeId(1), "Meters", false);
        let feet = table.declare_nominal(NodeId(2), "Feet", false);
        assert!(!table.same(meters, feet));
        assert!(!table.same(meters, TypeId::INT));
        let f1 = table.func(TypeId::VOID, vec![meters]);
        let f2 = table.func(TypeId::VOID, vec![meters]);
        assert!(table.structural_eq(f1, f2));
    }

    #[test]
    fn test_inttype_widening() {
        let mut table = TypeTable::new();
        let length = table.declare_nominal(NodeId(1), "Length", false);
        let meters = table.declare_nominal(NodeId(2), "Meters", false);
        let km = table.declare_nominal(NodeId(3), "Km", false);
        let other = table.declare_nominal(NodeId(4), "Other", false);
        table.set_nominal_parent(NodeId(2), length);
        table.set_nominal_parent(NodeId(3), meters);

        assert_eq!(table.ancestors(km), vec![km, meters, length]);
        assert!(table.inherits(km, length));
        assert!(!table.inherits(length, km));
        assert_eq!(table.common_root(km, meters), Some(length));
        assert_eq!(table.common_root(km, other), None);
    }
}
