//! Lexical scopes
//!
//! Every module root, function, block and loop gets a `Scope`. Entries are
//! kept in declaration order and are unique by name within one scope.
//! Lookups walk the static parent chain; the host prelude is the outermost
//! scope of every module.

use crate::ast::NodeId;
use crate::types::TypeId;
use indexmap::map::Entry as MapEntry;
use indexmap::IndexMap;

/// Index of a scope in the `ScopeTable`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

/// What a name refers to once resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Slot in the enclosing function's local frame
    Local(u32),
    /// Absolute index into the program's global table
    Global(u32),
    /// A script function
    Function(u32),
    /// An entry of the host table
    Host(u32),
    /// A struct, inttype or handletype
    Type(TypeId),
    /// A module imported with `as`
    Namespace(u32),
}

impl Binding {
    /// Declarations that take up a variable slot
    pub fn occupies_slot(&self) -> bool {
        matches!(self, Binding::Local(_) | Binding::Global(_))
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub decl: NodeId,
    pub binding: Binding,
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    pub entries: IndexMap<String, Entry>,
    pub is_module_root: bool,
    /// First local slot owned by this scope
    pub slot_base: u32,
    /// Declarations here that occupy a slot
    pub slot_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ScopeTable {
    scopes: Vec<Scope>,
}

impl ScopeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, parent: Option<ScopeId>, is_module_root: bool, slot_base: u32) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope {
            parent,
            entries: IndexMap::new(),
            is_module_root,
            slot_base,
            slot_count: 0,
        });
        id
    }

    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    /// Register `name` in `scope`. Re-declaring the same node is a no-op so
    /// a module reached through two inline imports is spliced once; any
    /// other clash returns the existing declaration.
    pub fn declare(&mut self, scope: ScopeId, name: &str, entry: Entry) -> std::result::Result<(), NodeId> {
        let scope = &mut self.scopes[scope.0 as usize];
        match scope.entries.entry(name.to_string()) {
            MapEntry::Occupied(existing) if existing.get().decl == entry.decl => Ok(()),
            MapEntry::Occupied(existing) => Err(existing.get().decl),
            MapEntry::Vacant(slot) => {
                if matches!(entry.binding, Binding::Local(_)) {
                    scope.slot_count += 1;
                }
                slot.insert(entry);
                Ok(())
            }
        }
    }

    /// Find `name` in `scope` or any enclosing scope
    pub fn lookup(&self, scope: ScopeId, name: &str) -> Option<&Entry> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let scope = self.get(id);
            if let Some(entry) = scope.entries.get(name) {
                return Some(entry);
            }
            current = scope.parent;
        }
        None
    }

    /// Find `name` declared directly in `scope`
    pub fn lookup_here(&self, scope: ScopeId, name: &str) -> Option<&Entry> {
        self.get(scope).entries.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_walks_parents() {
        let mut table = ScopeTable::new();
        let root = table.create(None, true, 0);
        let inner = table.create(Some(root), false, 0);
        table.declare(root, "x", Entry { decl: NodeId(1), binding: Binding::Global(0) }).unwrap();
        table.declare(inner, "y", Entry { decl: NodeId(2), binding: Binding::Local(0) }).unwrap();

        assert_eq!(table.lookup(inner, "x").map(|e| e.binding), Some(Binding::Global(0)));
        assert!(table.lookup(root, "y").is_none());
        assert_eq!(table.get(inner).slot_count, 1);
    }

    #[test]
    fn test_duplicates() {
        let mut table = ScopeTable::new();
        let root = table.create(None, true, 0);
        let entry = Entry { decl: NodeId(1), binding: Binding::Global(0) };
        table.declare(root, "x", entry.clone()).unwrap();
        assert!(table.declare(root, "x", entry).is_ok());
        let clash = Entry { decl: NodeId(2), binding: Binding::Global(1) };
        assert_eq!(table.declare(root, "x", clash), Err(NodeId(1)));
    }
}
