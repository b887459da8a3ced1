//! Scope resolution
//!
//! Attaches a scope to every module root, function, block and loop, registers
//! declarations with duplicate detection and resolves every identifier to a
//! `Binding`. Declared types (struct fields, parameters, variables, nominal
//! parents) are resolved here too, so the checker only deals with
//! expressions.
//!
//! Module-root declarations are registered before any body is resolved,
//! which is what makes forward references legal at the top level. Inside
//! functions names are registered as they are reached.

use crate::ast::{NodeId, NodeKind, Prim, Qualifier};
use crate::error::{ErrorKind, FerruleError, Result};
use crate::loader::{FunctionDecl, GlobalDecl, Session};
use crate::scope::{Binding, Entry, ScopeId};
use crate::types::{Type, TypeId};

pub struct Resolver<'s> {
    session: &'s mut Session,
    module: u32,
    /// Next free slot in the current function's local frame
    next_local: u32,
    loop_depth: u32,
}

impl<'s> Resolver<'s> {
    pub fn new(session: &'s mut Session, module: u32) -> Self {
        Self { session, module, next_local: 0, loop_depth: 0 }
    }

    /// Resolve one freshly parsed module whose imports are already loaded
    pub fn resolve_module(&mut self) -> Result<()> {
        let root = self.session.modules[self.module as usize].root;
        let items = match self.session.ast.kind(root) {
            NodeKind::Module { items } => items.clone(),
            other => return Err(FerruleError::defect(format!("module root is a {}", other.label()))),
        };

        let parent = self.session.prelude;
        let scope = self.session.scopes.create(parent, true, 0);
        self.session.ast.node_mut(root).scope = Some(scope);
        self.session.modules[self.module as usize].scope = scope;
        self.session.modules[self.module as usize].global_base = self.session.globals.len() as u32;

        for &item in &items {
            self.declare_item(item, scope)?;
        }
        for &item in &items {
            self.resolve_signature(item, scope)?;
        }
        for &item in &items {
            self.resolve_item(item, scope)?;
        }

        let module = &mut self.session.modules[self.module as usize];
        module.global_count = self.session.globals.len() as u32 - module.global_base;
        tracing::debug!(module = %module.display, globals = module.global_count, "resolved module");
        Ok(())
    }

    /// Resolve the host prelude: only `extern` prototypes, bound to the host table
    pub fn resolve_prelude(&mut self) -> Result<ScopeId> {
        let root = self.session.modules[self.module as usize].root;
        let items = match self.session.ast.kind(root) {
            NodeKind::Module { items } => items.clone(),
            other => return Err(FerruleError::defect(format!("prelude root is a {}", other.label()))),
        };
        let scope = self.session.scopes.create(None, true, 0);
        self.session.ast.node_mut(root).scope = Some(scope);
        self.session.modules[self.module as usize].scope = scope;
        for &item in &items {
            self.declare_item(item, scope)?;
            self.resolve_signature(item, scope)?;
        }
        Ok(scope)
    }

    fn declare(&mut self, scope: ScopeId, name: &str, decl: NodeId, binding: Binding) -> Result<()> {
        self.session
            .scopes
            .declare(scope, name, Entry { decl, binding })
            .map_err(|_| self.error(ErrorKind::DuplicateDeclaration(name.to_string()), decl))?;
        self.session.bindings.insert(decl, binding);
        Ok(())
    }

    /// Persisted records are keyed by name, so a name may be persisted by
    /// only one module of a program
    fn check_persisted_name(&self, name: &str, decl: NodeId) -> Result<()> {
        let earlier = self
            .session
            .globals
            .iter()
            .find(|g| g.qualifier == Qualifier::Persist && g.name == name && g.module != self.module);
        match earlier {
            Some(global) => {
                let module = self.session.modules[global.module as usize].display.clone();
                Err(self.error(ErrorKind::DuplicatePersisted(name.to_string(), module), decl))
            }
            None => Ok(()),
        }
    }

    fn error(&self, kind: ErrorKind, node: NodeId) -> FerruleError {
        FerruleError::new(kind, Some(self.session.ast.span(node)))
    }

    // ==================== Module root ====================

    fn declare_item(&mut self, item: NodeId, scope: ScopeId) -> Result<()> {
        match self.session.ast.kind(item).clone() {
            NodeKind::Import { alias, inline, .. } => {
                let imported = *self
                    .session
                    .imports
                    .get(&item)
                    .ok_or_else(|| FerruleError::defect("import resolved before its module was loaded"))?;
                if inline {
                    let source = self.session.modules[imported as usize].scope;
                    let entries: Vec<(String, Entry)> = self
                        .session
                        .scopes
                        .get(source)
                        .entries
                        .iter()
                        .map(|(name, entry)| (name.clone(), entry.clone()))
                        .collect();
                    for (name, entry) in entries {
                        self.session
                            .scopes
                            .declare(scope, &name, entry)
                            .map_err(|_| self.error(ErrorKind::DuplicateDeclaration(name.clone()), item))?;
                    }
                } else if let Some(alias) = alias {
                    self.declare(scope, &alias, item, Binding::Namespace(imported))?;
                }
            }
            NodeKind::Function { name, body, .. } => {
                let binding = if body.is_some() {
                    let id = self.session.functions.len() as u32;
                    self.session.functions.push(FunctionDecl {
                        name: name.clone(),
                        decl: item,
                        module: self.module,
                        ty: TypeId::VOID,
                    });
                    Binding::Function(id)
                } else {
                    let index = self
                        .session
                        .host
                        .index_of(&name)
                        .ok_or_else(|| self.error(ErrorKind::UnknownHostFunction(name.clone()), item))?;
                    Binding::Host(index)
                };
                self.declare(scope, &name, item, binding)?;
            }
            NodeKind::Struct { name, .. } => {
                let ty = self.session.types.declare_struct(item, &name);
                self.session.ast.set_ty(item, ty);
                self.declare(scope, &name, item, Binding::Type(ty))?;
            }
            NodeKind::Nominal { name, handle, .. } => {
                let ty = self.session.types.declare_nominal(item, &name, handle);
                self.session.ast.set_ty(item, ty);
                self.declare(scope, &name, item, Binding::Type(ty))?;
            }
            NodeKind::VarDecl { binders, qualifier, .. } => {
                for binder in binders {
                    let name = self.session.ast.decl_name(binder).to_string();
                    if qualifier == Qualifier::Persist {
                        self.check_persisted_name(&name, binder)?;
                    }
                    let index = self.session.globals.len() as u32;
                    self.session.globals.push(GlobalDecl {
                        name: name.clone(),
                        decl: binder,
                        module: self.module,
                        ty: TypeId::VOID,
                        qualifier,
                    });
                    self.declare(scope, &name, binder, Binding::Global(index))?;
                }
            }
            NodeKind::Trailing { .. } => {}
            other => return Err(FerruleError::defect(format!("unexpected {} at module level", other.label()))),
        }
        Ok(())
    }

    /// Declared types of top-level items
    fn resolve_signature(&mut self, item: NodeId, scope: ScopeId) -> Result<()> {
        match self.session.ast.kind(item).clone() {
            NodeKind::Function { ret, params, .. } => {
                let ret = self.resolve_type(ret, scope, true)?;
                let mut param_types = Vec::with_capacity(params.len());
                for param in params {
                    param_types.push(self.resolve_binder_type(param, scope)?);
                }
                let ty = self.session.types.func(ret, param_types);
                self.session.ast.set_ty(item, ty);
                if let Some(Binding::Function(id)) = self.session.bindings.get(&item) {
                    self.session.functions[*id as usize].ty = ty;
                }
            }
            NodeKind::Struct { fields, .. } => {
                let mut layout = Vec::with_capacity(fields.len());
                let mut seen = std::collections::HashSet::new();
                for field in fields {
                    let name = self.session.ast.decl_name(field).to_string();
                    if !seen.insert(name.clone()) {
                        return Err(self.error(ErrorKind::DuplicateDeclaration(name), field));
                    }
                    let ty = self.resolve_binder_type(field, scope)?;
                    layout.push((name, ty));
                }
                self.session.types.set_struct_fields(item, layout);
            }
            NodeKind::Nominal { name, handle, parent: Some(parent) } => {
                let parent_ty = self.resolve_type(parent, scope, false)?;
                let compatible = if handle {
                    self.session.types.is_handle(parent_ty)
                } else {
                    self.session.types.is_inttype(parent_ty)
                };
                let own = self.session.ast.ty(item).unwrap_or(TypeId::VOID);
                if !compatible || self.session.types.inherits(parent_ty, own) {
                    let kind = if handle { "handletype" } else { "inttype" };
                    return Err(self.error(
                        ErrorKind::InvalidDeclaration(format!("{} '{}' must inherit from an unrelated {}", kind, name, kind)),
                        parent,
                    ));
                }
                self.session.types.set_nominal_parent(item, parent_ty);
            }
            NodeKind::VarDecl { binders, qualifier, .. } => {
                for binder in binders {
                    let ty = self.resolve_binder_type(binder, scope)?;
                    let allowed = match qualifier {
                        Qualifier::None => true,
                        Qualifier::Option => matches!(ty, TypeId::INT | TypeId::STRING | TypeId::BOOL),
                        Qualifier::Persist => {
                            matches!(ty, TypeId::INT | TypeId::FLOAT | TypeId::STRING | TypeId::BOOL)
                        }
                    };
                    if !allowed {
                        let name = self.session.ast.decl_name(binder).to_string();
                        return Err(self.error(
                            ErrorKind::InvalidDeclaration(format!(
                                "'{}' cannot be {} with type {}",
                                name,
                                if qualifier == Qualifier::Option { "an option" } else { "persisted" },
                                self.session.types.name(ty)
                            )),
                            binder,
                        ));
                    }
                    if let Some(Binding::Global(index)) = self.session.bindings.get(&binder) {
                        self.session.globals[*index as usize].ty = ty;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn resolve_item(&mut self, item: NodeId, scope: ScopeId) -> Result<()> {
        match self.session.ast.kind(item).clone() {
            NodeKind::Function { params, body: Some(body), .. } => {
                let function_scope = self.session.scopes.create(Some(scope), false, 0);
                self.session.ast.node_mut(item).scope = Some(function_scope);
                self.next_local = 0;
                self.loop_depth = 0;
                for param in params {
                    let name = self.session.ast.decl_name(param).to_string();
                    let slot = self.next_local;
                    self.next_local += 1;
                    self.declare(function_scope, &name, param, Binding::Local(slot))?;
                }
                self.resolve_stmt(body, function_scope)?;
            }
            NodeKind::VarDecl { init: Some(init), .. } => self.resolve_expr(init, scope)?,
            NodeKind::Trailing { expr } => self.resolve_expr(expr, scope)?,
            _ => {}
        }
        Ok(())
    }

    // ==================== Types ====================

    fn resolve_binder_type(&mut self, binder: NodeId, scope: ScopeId) -> Result<TypeId> {
        let ty_node = match self.session.ast.kind(binder) {
            NodeKind::Binder { ty, .. } => *ty,
            other => return Err(FerruleError::defect(format!("expected binder, found {}", other.label()))),
        };
        let ty = self.resolve_type(ty_node, scope, false)?;
        self.session.ast.set_ty(binder, ty);
        Ok(ty)
    }

    /// Turn a type expression into a `TypeId`; `void` only where `allow_void`
    pub fn resolve_type(&mut self, node: NodeId, scope: ScopeId, allow_void: bool) -> Result<TypeId> {
        let ty = match self.session.ast.kind(node).clone() {
            NodeKind::PrimType(prim) => match prim {
                Prim::Int => TypeId::INT,
                Prim::Float => TypeId::FLOAT,
                Prim::Bool => TypeId::BOOL,
                Prim::Str => TypeId::STRING,
                Prim::Any => TypeId::ANY,
                Prim::Void => {
                    if !allow_void {
                        return Err(self.error(
                            ErrorKind::InvalidDeclaration("void is not a value type".to_string()),
                            node,
                        ));
                    }
                    TypeId::VOID
                }
            },
            NodeKind::ListType(inner) => {
                let inner = self.resolve_type(inner, scope, false)?;
                self.session.types.list_of(inner)
            }
            NodeKind::ErrorType(inner) => {
                let inner = self.resolve_type(inner, scope, false)?;
                self.session.types.error_of(inner)
            }
            NodeKind::TupleType(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(self.resolve_type(item, scope, false)?);
                }
                self.session.types.intern(Type::Tuple(resolved))
            }
            NodeKind::FnType { ret, params } => {
                let ret = self.resolve_type(ret, scope, true)?;
                let mut resolved = Vec::with_capacity(params.len());
                for param in params {
                    resolved.push(self.resolve_type(param, scope, false)?);
                }
                self.session.types.func(ret, resolved)
            }
            NodeKind::NamedType { path } => self.resolve_named_type(&path, scope, node)?,
            other => return Err(FerruleError::defect(format!("expected type, found {}", other.label()))),
        };
        self.session.ast.set_ty(node, ty);
        Ok(ty)
    }

    fn resolve_named_type(&self, path: &[String], scope: ScopeId, node: NodeId) -> Result<TypeId> {
        let unknown = || self.error(ErrorKind::UnknownType(path.join(".")), node);
        let binding = match path {
            [name] => self.session.scopes.lookup(scope, name).map(|e| e.binding),
            [namespace, name] => match self.session.scopes.lookup(scope, namespace).map(|e| e.binding) {
                Some(Binding::Namespace(module)) => {
                    let module_scope = self.session.modules[module as usize].scope;
                    self.session.scopes.lookup_here(module_scope, name).map(|e| e.binding)
                }
                _ => None,
            },
            _ => None,
        };
        match binding {
            Some(Binding::Type(ty)) => Ok(ty),
            _ => Err(unknown()),
        }
    }

    // ==================== Statements ====================

    fn enter_scope(&mut self, node: NodeId, parent: ScopeId) -> ScopeId {
        let scope = self.session.scopes.create(Some(parent), false, self.next_local);
        self.session.ast.node_mut(node).scope = Some(scope);
        scope
    }

    fn declare_local(&mut self, binder: NodeId, scope: ScopeId) -> Result<()> {
        self.resolve_binder_type(binder, scope)?;
        let name = self.session.ast.decl_name(binder).to_string();
        let slot = self.next_local;
        self.next_local += 1;
        self.declare(scope, &name, binder, Binding::Local(slot))
    }

    fn resolve_stmt(&mut self, node: NodeId, scope: ScopeId) -> Result<()> {
        match self.session.ast.kind(node).clone() {
            NodeKind::Block { stmts } => {
                let saved = self.next_local;
                let inner = self.enter_scope(node, scope);
                for stmt in stmts {
                    self.resolve_stmt(stmt, inner)?;
                }
                self.next_local = saved;
            }
            NodeKind::VarDecl { binders, init, .. } => {
                if let Some(init) = init {
                    self.resolve_expr(init, scope)?;
                }
                for binder in binders {
                    self.declare_local(binder, scope)?;
                }
            }
            NodeKind::If { cond, then, els } => {
                self.resolve_expr(cond, scope)?;
                self.resolve_stmt(then, scope)?;
                if let Some(els) = els {
                    self.resolve_stmt(els, scope)?;
                }
            }
            NodeKind::IfIn { binder, expr, then, els } => {
                self.resolve_expr(expr, scope)?;
                let saved = self.next_local;
                let inner = self.enter_scope(node, scope);
                self.declare_local(binder, inner)?;
                self.resolve_stmt(then, inner)?;
                self.next_local = saved;
                if let Some(els) = els {
                    self.resolve_stmt(els, scope)?;
                }
            }
            NodeKind::While { cond, body } => {
                self.resolve_expr(cond, scope)?;
                self.loop_depth += 1;
                self.resolve_stmt(body, scope)?;
                self.loop_depth -= 1;
            }
            NodeKind::For { init, cond, step, body } => {
                let saved = self.next_local;
                let inner = self.enter_scope(node, scope);
                if let Some(init) = init {
                    self.resolve_stmt(init, inner)?;
                }
                if let Some(cond) = cond {
                    self.resolve_expr(cond, inner)?;
                }
                if let Some(step) = step {
                    self.resolve_stmt(step, inner)?;
                }
                self.loop_depth += 1;
                self.resolve_stmt(body, inner)?;
                self.loop_depth -= 1;
                self.next_local = saved;
            }
            NodeKind::ForIn { binder, iterable, body } => {
                self.resolve_expr(iterable, scope)?;
                let saved = self.next_local;
                let inner = self.enter_scope(node, scope);
                self.declare_local(binder, inner)?;
                self.loop_depth += 1;
                self.resolve_stmt(body, inner)?;
                self.loop_depth -= 1;
                self.next_local = saved;
            }
            NodeKind::Return { value: Some(value) } => self.resolve_expr(value, scope)?,
            NodeKind::Return { value: None } => {}
            NodeKind::Break if self.loop_depth == 0 => return Err(self.error(ErrorKind::BreakOutsideLoop, node)),
            NodeKind::Continue if self.loop_depth == 0 => {
                return Err(self.error(ErrorKind::ContinueOutsideLoop, node))
            }
            NodeKind::Break | NodeKind::Continue => {}
            NodeKind::ExprStmt { expr } | NodeKind::Assert { expr } => self.resolve_expr(expr, scope)?,
            other => return Err(FerruleError::defect(format!("unexpected {} in statement position", other.label()))),
        }
        Ok(())
    }

    // ==================== Expressions ====================

    fn resolve_expr(&mut self, node: NodeId, scope: ScopeId) -> Result<()> {
        match self.session.ast.kind(node).clone() {
            NodeKind::Ident { name } => {
                let entry = self
                    .session
                    .scopes
                    .lookup(scope, &name)
                    .cloned()
                    .ok_or_else(|| self.error(ErrorKind::UndeclaredIdentifier(name.clone()), node))?;
                self.session.bindings.insert(node, entry.binding);
                self.session.references.insert(node, entry.decl);
            }
            NodeKind::Member { object, name } => {
                let namespace = match self.session.ast.kind(object) {
                    NodeKind::Ident { name } => match self.session.scopes.lookup(scope, name).map(|e| e.binding) {
                        Some(Binding::Namespace(module)) => Some((module, name.clone())),
                        _ => None,
                    },
                    _ => None,
                };
                match namespace {
                    Some((module, namespace)) => {
                        let module_scope = self.session.modules[module as usize].scope;
                        let entry = self
                            .session
                            .scopes
                            .lookup_here(module_scope, &name)
                            .cloned()
                            .ok_or_else(|| {
                                self.error(ErrorKind::UndeclaredIdentifier(format!("{}.{}", namespace, name)), node)
                            })?;
                        self.session.bindings.insert(node, entry.binding);
                        self.session.references.insert(node, entry.decl);
                    }
                    None => self.resolve_expr(object, scope)?,
                }
            }
            NodeKind::New { ty } => {
                self.resolve_type(ty, scope, false)?;
            }
            NodeKind::Fail { ty, message } => {
                self.resolve_type(ty, scope, false)?;
                self.resolve_expr(message, scope)?;
            }
            NodeKind::Cast { expr, ty } => {
                self.resolve_expr(expr, scope)?;
                self.resolve_type(ty, scope, false)?;
            }
            kind => {
                for child in kind.children() {
                    self.resolve_expr(child, scope)?;
                }
            }
        }
        Ok(())
    }
}
