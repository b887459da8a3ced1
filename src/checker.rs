//! Type checking
//!
//! One post-order pass per module that gives every expression a type,
//! enforces operator contracts and splices `Implicit` nodes wherever a value
//! is converted without being asked to. Member syntax on built-in types and
//! value-changing casts are rewritten into `Intrinsic` nodes so the compiler
//! never has to look at types to pick an operation.
//!
//! A second, separate pass checks that non-void functions return on every
//! path.

use crate::ast::{BinaryOp, Implicit, Intrinsic, NodeId, NodeKind, UnaryOp};
use crate::error::{ErrorKind, FerruleError, Result};
use crate::loader::Session;
use crate::scope::Binding;
use crate::types::{Type, TypeId};

/// What `coerce` decided to do with a value
enum Conversion {
    None,
    Wrap(Implicit),
    /// Convert to the error's payload type first, then wrap as success
    Success(TypeId),
}

pub struct Checker<'s> {
    session: &'s mut Session,
    module: u32,
    /// Return type of the function whose body is being checked
    ret: TypeId,
}

impl<'s> Checker<'s> {
    pub fn new(session: &'s mut Session, module: u32) -> Self {
        Self { session, module, ret: TypeId::VOID }
    }

    pub fn check_module(&mut self) -> Result<()> {
        let root = self.session.modules[self.module as usize].root;
        let items = match self.session.ast.kind(root) {
            NodeKind::Module { items } => items.clone(),
            other => return Err(FerruleError::defect(format!("module root is a {}", other.label()))),
        };

        for item in items {
            match self.session.ast.kind(item).clone() {
                NodeKind::Function { name, body: Some(body), .. } => {
                    let fn_ty = self.type_of(item)?;
                    self.ret = match self.session.types.get(fn_ty) {
                        Type::Func { ret, .. } => *ret,
                        _ => return Err(FerruleError::defect(format!("function '{}' has no signature", name))),
                    };
                    self.stmt(body)?;
                    if self.ret != TypeId::VOID && !always_returns(self, body) {
                        return Err(self.error(ErrorKind::MissingReturn(name), item));
                    }
                }
                NodeKind::VarDecl { .. } => self.var_decl(item)?,
                NodeKind::Trailing { expr } => {
                    let ty = self.expr(expr, None)?;
                    self.session.ast.set_ty(item, ty);
                }
                _ => {}
            }
        }
        tracing::debug!(module = %self.session.modules[self.module as usize].display, "checked module");
        Ok(())
    }

    fn error(&self, kind: ErrorKind, node: NodeId) -> FerruleError {
        FerruleError::new(kind, Some(self.session.ast.span(node)))
    }

    fn type_of(&self, node: NodeId) -> Result<TypeId> {
        self.session
            .ast
            .ty(node)
            .ok_or_else(|| FerruleError::defect(format!("{} has no type", self.session.ast.kind(node).label())))
    }

    fn name(&self, ty: TypeId) -> String {
        self.session.types.name(ty)
    }

    fn mismatch(&self, expected: TypeId, found: TypeId, node: NodeId) -> FerruleError {
        self.error(ErrorKind::TypeMismatch(self.name(expected), self.name(found)), node)
    }

    // ==================== Conversions ====================

    /// Type `node` with `to` as a hint, then convert it to `to`
    fn expect(&mut self, node: NodeId, to: TypeId) -> Result<NodeId> {
        self.expr(node, Some(to))?;
        self.coerce(node, to)
    }

    /// Convert an already typed expression to `to`, splicing in an implicit
    /// conversion when one is allowed
    fn coerce(&mut self, node: NodeId, to: TypeId) -> Result<NodeId> {
        let from = self.type_of(node)?;
        match self.conversion(node, from, to) {
            Some(Conversion::None) => Ok(node),
            Some(Conversion::Wrap(conv)) => Ok(self.wrap(node, conv, to)),
            Some(Conversion::Success(payload)) => {
                let inner = self.coerce(node, payload)?;
                Ok(self.wrap(inner, Implicit::ToError, to))
            }
            None => Err(self.mismatch(to, from, node)),
        }
    }

    fn conversion(&self, node: NodeId, from: TypeId, to: TypeId) -> Option<Conversion> {
        let types = &self.session.types;
        if types.same(from, to) {
            return Some(Conversion::None);
        }
        if from == TypeId::NULL && (types.is_nullable(to) || types.is_integer_like(to)) {
            return Some(Conversion::Wrap(Implicit::Retype));
        }
        if matches!(self.session.ast.kind(node), NodeKind::IntLit(0)) && (types.is_inttype(to) || types.is_handle(to)) {
            return Some(Conversion::Wrap(Implicit::Retype));
        }
        if let (Type::List(TypeId::NULL), Type::List(_)) = (types.get(from), types.get(to)) {
            return Some(Conversion::Wrap(Implicit::Retype));
        }
        if to == TypeId::ANY && from != TypeId::VOID {
            return Some(Conversion::Wrap(Implicit::Box(from.0)));
        }
        if (types.is_inttype(from) || types.is_handle(from)) && types.inherits(from, to) {
            return Some(Conversion::Wrap(Implicit::Widen));
        }
        if let (Type::Func { ret: r1, params: p1 }, Type::Func { ret: TypeId::VOID, params: p2 }) =
            (types.get(from), types.get(to))
        {
            let params_match = p1.len() == p2.len() && p1.iter().zip(p2).all(|(a, b)| types.same(*a, *b));
            if params_match && *r1 != TypeId::VOID {
                return Some(Conversion::Wrap(Implicit::Discard));
            }
        }
        if let Type::Error(payload) = types.get(to) {
            if !matches!(types.get(from), Type::Error(_)) && self.conversion(node, from, *payload).is_some() {
                return Some(Conversion::Success(*payload));
            }
        }
        None
    }

    fn wrap(&mut self, node: NodeId, conv: Implicit, ty: TypeId) -> NodeId {
        let wrapper = self.session.ast.splice(node, |expr| NodeKind::Implicit { conv, expr });
        self.session.ast.set_ty(wrapper, ty);
        wrapper
    }

    /// `null`, a literal `0` or `[]`: values that take on the other operand's type
    fn is_flexible(&self, node: NodeId, ty: TypeId) -> bool {
        ty == TypeId::NULL
            || matches!(self.session.ast.kind(node), NodeKind::IntLit(0))
            || matches!(self.session.types.get(ty), Type::List(TypeId::NULL))
    }

    // ==================== Statements ====================

    fn stmt(&mut self, node: NodeId) -> Result<()> {
        match self.session.ast.kind(node).clone() {
            NodeKind::Block { stmts } => {
                for stmt in stmts {
                    self.stmt(stmt)?;
                }
            }
            NodeKind::VarDecl { .. } => self.var_decl(node)?,
            NodeKind::ExprStmt { expr } => {
                self.expr(expr, None)?;
            }
            NodeKind::Assert { expr } => {
                self.expect(expr, TypeId::BOOL)?;
            }
            NodeKind::If { cond, then, els } => {
                self.expect(cond, TypeId::BOOL)?;
                self.stmt(then)?;
                if let Some(els) = els {
                    self.stmt(els)?;
                }
            }
            NodeKind::IfIn { binder, expr, then, els } => {
                let binder_ty = self.type_of(binder)?;
                let ty = self.expr(expr, None)?;
                let payload_matches = match self.session.types.get(ty) {
                    Type::Error(payload) => self.session.types.same(*payload, binder_ty),
                    _ => false,
                };
                if !payload_matches {
                    let expected = self.session.types.error_of(binder_ty);
                    return Err(self.mismatch(expected, ty, expr));
                }
                self.stmt(then)?;
                if let Some(els) = els {
                    self.stmt(els)?;
                }
            }
            NodeKind::While { cond, body } => {
                self.expect(cond, TypeId::BOOL)?;
                self.stmt(body)?;
            }
            NodeKind::For { init, cond, step, body } => {
                if let Some(init) = init {
                    self.stmt(init)?;
                }
                if let Some(cond) = cond {
                    self.expect(cond, TypeId::BOOL)?;
                }
                if let Some(step) = step {
                    self.stmt(step)?;
                }
                self.stmt(body)?;
            }
            NodeKind::ForIn { binder, iterable, body } => {
                let binder_ty = self.type_of(binder)?;
                let ty = self.expr(iterable, None)?;
                let element = match self.session.types.get(ty) {
                    Type::List(element) => *element,
                    Type::Str => TypeId::STRING,
                    _ => {
                        return Err(self.error(ErrorKind::InvalidOperands("for-in".to_string(), self.name(ty)), iterable))
                    }
                };
                if !self.session.types.same(element, binder_ty) {
                    return Err(self.mismatch(binder_ty, element, binder));
                }
                self.stmt(body)?;
            }
            NodeKind::Return { value } => match value {
                None if self.ret != TypeId::VOID => return Err(self.mismatch(self.ret, TypeId::VOID, node)),
                None => {}
                Some(value) if self.ret == TypeId::VOID => {
                    let ty = self.expr(value, None)?;
                    return Err(self.mismatch(TypeId::VOID, ty, value));
                }
                Some(value) => {
                    self.expect(value, self.ret)?;
                }
            },
            NodeKind::Break | NodeKind::Continue => {}
            other => return Err(FerruleError::defect(format!("unexpected {} in statement position", other.label()))),
        }
        Ok(())
    }

    fn var_decl(&mut self, node: NodeId) -> Result<()> {
        let (binders, init) = match self.session.ast.kind(node) {
            NodeKind::VarDecl { binders, init, .. } => (binders.clone(), *init),
            other => return Err(FerruleError::defect(format!("expected declaration, found {}", other.label()))),
        };
        let Some(init) = init else {
            return Ok(());
        };

        if let [binder] = binders.as_slice() {
            let ty = self.type_of(*binder)?;
            self.expect(init, ty)?;
            return Ok(());
        }

        // Destructuring: the initializer must produce a tuple of exactly the declared types
        let declared = binders.iter().map(|b| self.type_of(*b)).collect::<Result<Vec<_>>>()?;
        let ty = self.expr(init, None)?;
        let matches = match self.session.types.get(ty) {
            Type::Tuple(items) => {
                items.len() == declared.len()
                    && items.iter().zip(&declared).all(|(a, b)| self.session.types.same(*a, *b))
            }
            _ => false,
        };
        if !matches {
            let expected = self.session.types.intern(Type::Tuple(declared));
            return Err(self.mismatch(expected, ty, init));
        }
        Ok(())
    }

    // ==================== Expressions ====================

    fn expr(&mut self, node: NodeId, expected: Option<TypeId>) -> Result<TypeId> {
        let ty = match self.session.ast.kind(node).clone() {
            NodeKind::IntLit(_) => TypeId::INT,
            NodeKind::FloatLit(_) => TypeId::FLOAT,
            NodeKind::BoolLit(_) => TypeId::BOOL,
            NodeKind::StrLit(_) => TypeId::STRING,
            NodeKind::Null => TypeId::NULL,
            NodeKind::Interp { parts } => {
                for part in parts {
                    let ty = self.expr(part, None)?;
                    let printable = matches!(ty, TypeId::INT | TypeId::FLOAT | TypeId::BOOL | TypeId::STRING)
                        || self.session.types.is_inttype(ty);
                    if !printable {
                        return Err(self.error(ErrorKind::InvalidOperands("interpolation".to_string(), self.name(ty)), part));
                    }
                }
                TypeId::STRING
            }
            NodeKind::ListLit { items } => self.list_literal(&items, expected)?,
            NodeKind::TupleLit { items } => self.tuple_literal(&items, expected)?,
            NodeKind::Ident { name } => self.reference(node, &name)?,
            NodeKind::Member { object, name } => self.member(node, object, &name)?,
            NodeKind::Index { object, index } => {
                let ty = self.expr(object, None)?;
                self.expect(index, TypeId::INT)?;
                match self.session.types.get(ty) {
                    Type::List(element) => *element,
                    Type::Str => TypeId::STRING,
                    _ => return Err(self.error(ErrorKind::InvalidOperands("[]".to_string(), self.name(ty)), node)),
                }
            }
            NodeKind::Call { callee, args } => self.call(node, callee, &args)?,
            NodeKind::Unary { op, operand } => {
                let ty = self.expr(operand, None)?;
                let valid = match op {
                    UnaryOp::Neg => matches!(ty, TypeId::INT | TypeId::FLOAT) || self.session.types.is_inttype(ty),
                    UnaryOp::Not => ty == TypeId::BOOL,
                };
                if !valid {
                    let symbol = if op == UnaryOp::Neg { "-" } else { "!" };
                    return Err(self.error(ErrorKind::InvalidOperands(symbol.to_string(), self.name(ty)), node));
                }
                ty
            }
            NodeKind::Binary { op, lhs, rhs } => self.binary(node, op, lhs, rhs)?,
            NodeKind::Logical { lhs, rhs, .. } => {
                self.expect(lhs, TypeId::BOOL)?;
                self.expect(rhs, TypeId::BOOL)?;
                TypeId::BOOL
            }
            NodeKind::Assign { op, target, value } => self.assign(node, op, target, value)?,
            NodeKind::New { ty } => {
                let ty = self.type_of(ty)?;
                if !matches!(self.session.types.get(ty), Type::Struct(_) | Type::List(_)) {
                    return Err(self.error(ErrorKind::InvalidOperands("new".to_string(), self.name(ty)), node));
                }
                ty
            }
            NodeKind::Fail { ty, message } => {
                let payload = self.type_of(ty)?;
                self.expect(message, TypeId::STRING)?;
                self.session.types.error_of(payload)
            }
            NodeKind::Cast { expr, ty } => self.cast(node, expr, ty)?,
            NodeKind::Async { call } => {
                let callee = match self.session.ast.kind(call) {
                    NodeKind::Call { callee, .. } => *callee,
                    other => return Err(FerruleError::defect(format!("async on {}", other.label()))),
                };
                if let Some(Binding::Host(_)) = self.session.bindings.get(&callee) {
                    return Err(self.error(ErrorKind::InvalidOperands("async".to_string(), "host function".to_string()), call));
                }
                self.expr(call, None)?;
                TypeId::INT
            }
            NodeKind::Await { ids } => {
                let ids_ty = self.session.types.list_of(TypeId::INT);
                self.expect(ids, ids_ty)?;
                TypeId::INT
            }
            NodeKind::Bind { func, arg } => {
                let ty = self.expr(func, None)?;
                let (ret, params) = self.function_shape(ty, func)?;
                let Some((first, rest)) = params.split_first() else {
                    return Err(self.error(ErrorKind::WrongArity(1, 0), func));
                };
                self.expect(arg, *first)?;
                self.session.types.func(ret, rest.to_vec())
            }
            NodeKind::Discard { func } => {
                let ty = self.expr(func, None)?;
                let (_, params) = self.function_shape(ty, func)?;
                self.session.types.func(TypeId::VOID, params)
            }
            NodeKind::Asserting { func } => {
                let ty = self.expr(func, None)?;
                let (ret, params) = self.function_shape(ty, func)?;
                if ret != TypeId::BOOL {
                    let expected = self.session.types.func(TypeId::BOOL, params);
                    return Err(self.mismatch(expected, ty, func));
                }
                self.session.types.func(TypeId::VOID, params)
            }
            NodeKind::Implicit { .. } | NodeKind::Intrinsic { .. } => self.type_of(node)?,
            other => return Err(FerruleError::defect(format!("unexpected {} in expression position", other.label()))),
        };
        self.session.ast.set_ty(node, ty);
        Ok(ty)
    }

    fn function_shape(&self, ty: TypeId, node: NodeId) -> Result<(TypeId, Vec<TypeId>)> {
        match self.session.types.get(ty) {
            Type::Func { ret, params } => Ok((*ret, params.clone())),
            _ => Err(self.error(ErrorKind::NotCallable(self.name(ty)), node)),
        }
    }

    fn list_literal(&mut self, items: &[NodeId], expected: Option<TypeId>) -> Result<TypeId> {
        let hinted = expected.and_then(|ty| match self.session.types.get(ty) {
            Type::List(element) if *element != TypeId::NULL => Some(*element),
            _ => None,
        });
        let element = match (hinted, items.first()) {
            (Some(element), _) => element,
            (None, None) => TypeId::NULL,
            (None, Some(&first)) => {
                let ty = self.expr(first, None)?;
                if ty == TypeId::NULL || ty == TypeId::VOID {
                    return Err(self.error(ErrorKind::InvalidOperands("[]".to_string(), self.name(ty)), first));
                }
                ty
            }
        };
        for &item in items {
            self.expect(item, element)?;
        }
        Ok(self.session.types.list_of(element))
    }

    fn tuple_literal(&mut self, items: &[NodeId], expected: Option<TypeId>) -> Result<TypeId> {
        let hinted = expected.and_then(|ty| match self.session.types.get(ty) {
            Type::Tuple(types) if types.len() == items.len() => Some(types.clone()),
            _ => None,
        });
        match hinted {
            Some(types) => {
                for (&item, &ty) in items.iter().zip(&types) {
                    self.expect(item, ty)?;
                }
                Ok(self.session.types.intern(Type::Tuple(types)))
            }
            None => {
                let mut types = Vec::with_capacity(items.len());
                for &item in items {
                    types.push(self.expr(item, None)?);
                }
                Ok(self.session.types.intern(Type::Tuple(types)))
            }
        }
    }

    /// Type of a resolved name used as a value
    fn reference(&mut self, node: NodeId, name: &str) -> Result<TypeId> {
        match self.session.bindings.get(&node) {
            Some(Binding::Local(_)) | Some(Binding::Global(_)) | Some(Binding::Function(_)) => {
                let decl = *self
                    .session
                    .references
                    .get(&node)
                    .ok_or_else(|| FerruleError::defect(format!("'{}' has no declaration", name)))?;
                self.type_of(decl)
            }
            Some(_) => Err(self.error(ErrorKind::NotAValue(name.to_string()), node)),
            None => Err(FerruleError::defect(format!("'{}' was never resolved", name))),
        }
    }

    fn member(&mut self, node: NodeId, object: NodeId, name: &str) -> Result<TypeId> {
        if self.session.bindings.contains_key(&node) {
            return self.reference(node, name);
        }

        let ty = self.expr(object, None)?;
        if let Some(info) = self.session.types.struct_info(ty) {
            if let Some((_, field_ty)) = info.fields.iter().find(|(field, _)| field == name) {
                return Ok(*field_ty);
            }
        }

        let intrinsic = match (self.session.types.get(ty), name) {
            (Type::List(_) | Type::Str, "length") => Some((Intrinsic::Length, TypeId::INT)),
            (Type::Error(_), "message") => Some((Intrinsic::ErrorMessage, TypeId::STRING)),
            _ => None,
        };
        match intrinsic {
            Some((op, result)) => {
                self.session.ast.node_mut(node).kind = NodeKind::Intrinsic { op, args: vec![object] };
                Ok(result)
            }
            None => Err(self.error(ErrorKind::NoSuchMember(self.name(ty), name.to_string()), node)),
        }
    }

    fn call(&mut self, node: NodeId, callee: NodeId, args: &[NodeId]) -> Result<TypeId> {
        // list.push(value)
        if let NodeKind::Member { object, name } = self.session.ast.kind(callee).clone() {
            if name == "push" && !self.session.bindings.contains_key(&callee) {
                let ty = self.expr(object, None)?;
                if let Type::List(element) = *self.session.types.get(ty) {
                    if args.len() != 1 {
                        return Err(self.error(ErrorKind::WrongArity(1, args.len()), node));
                    }
                    self.expect(args[0], element)?;
                    let value = self.session.ast.kind(node).children().last().copied().unwrap_or(args[0]);
                    self.session.ast.node_mut(node).kind = NodeKind::Intrinsic { op: Intrinsic::Push, args: vec![object, value] };
                    self.session.ast.node_mut(object).parent = Some(node);
                    return Ok(TypeId::VOID);
                }
            }
        }

        let fn_ty = match self.session.bindings.get(&callee) {
            Some(Binding::Host(_)) | Some(Binding::Function(_)) => {
                let decl = *self
                    .session
                    .references
                    .get(&callee)
                    .ok_or_else(|| FerruleError::defect("callee has no declaration"))?;
                let ty = self.type_of(decl)?;
                self.session.ast.set_ty(callee, ty);
                ty
            }
            _ => self.expr(callee, None)?,
        };

        let (ret, params) = self.function_shape(fn_ty, callee)?;
        if params.len() != args.len() {
            return Err(self.error(ErrorKind::WrongArity(params.len(), args.len()), node));
        }
        for (&arg, &param) in args.iter().zip(&params) {
            self.expect(arg, param)?;
        }
        Ok(ret)
    }

    fn binary(&mut self, node: NodeId, op: BinaryOp, lhs: NodeId, rhs: NodeId) -> Result<TypeId> {
        let lt = self.expr(lhs, None)?;
        let rt = self.expr(rhs, Some(lt))?;
        let operand = self.unify(op, lhs, lt, rhs, rt, node)?;

        let types = &self.session.types;
        let numeric = matches!(operand, TypeId::INT | TypeId::FLOAT) || types.is_inttype(operand);
        let valid = match op {
            BinaryOp::Add => numeric || operand == TypeId::STRING,
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => numeric,
            BinaryOp::Mod => operand == TypeId::INT || types.is_inttype(operand),
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => numeric || operand == TypeId::STRING,
            BinaryOp::Eq | BinaryOp::Ne => operand != TypeId::VOID,
        };
        if !valid {
            return Err(self.error(ErrorKind::InvalidOperands(op.to_string(), self.name(operand)), node));
        }

        if op.is_comparison() || op.is_equality() {
            Ok(TypeId::BOOL)
        } else {
            Ok(operand)
        }
    }

    /// Bring both operands of a binary operator to one type
    fn unify(&mut self, op: BinaryOp, lhs: NodeId, lt: TypeId, rhs: NodeId, rt: TypeId, node: NodeId) -> Result<TypeId> {
        if self.session.types.same(lt, rt) {
            return Ok(lt);
        }
        if let Some(root) = self.session.types.common_root(lt, rt) {
            self.coerce(lhs, root)?;
            self.coerce(rhs, root)?;
            return Ok(root);
        }
        if self.is_flexible(rhs, rt) && self.conversion(rhs, rt, lt).is_some() {
            self.coerce(rhs, lt)?;
            return Ok(lt);
        }
        if self.is_flexible(lhs, lt) && self.conversion(lhs, lt, rt).is_some() {
            self.coerce(lhs, rt)?;
            return Ok(rt);
        }
        Err(self.error(
            ErrorKind::InvalidOperands(op.to_string(), format!("{} and {}", self.name(lt), self.name(rt))),
            node,
        ))
    }

    fn assign(&mut self, node: NodeId, op: Option<BinaryOp>, target: NodeId, value: NodeId) -> Result<TypeId> {
        let target_ty = self.assignable(target)?;
        match op {
            None => {
                self.expect(value, target_ty)?;
            }
            Some(op) => {
                let value_ty = self.expr(value, Some(target_ty))?;
                let operand = self.unify(op, target, target_ty, value, value_ty, node)?;
                if !self.session.types.same(operand, target_ty) {
                    return Err(self.mismatch(target_ty, operand, node));
                }
                let types = &self.session.types;
                let valid = match op {
                    BinaryOp::Add => matches!(operand, TypeId::INT | TypeId::FLOAT | TypeId::STRING) || types.is_inttype(operand),
                    BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                        matches!(operand, TypeId::INT | TypeId::FLOAT) || types.is_inttype(operand)
                    }
                    BinaryOp::Mod => operand == TypeId::INT || types.is_inttype(operand),
                    _ => false,
                };
                if !valid {
                    return Err(self.error(ErrorKind::InvalidOperands(format!("{}=", op), self.name(operand)), node));
                }
            }
        }
        Ok(target_ty)
    }

    /// Type of an assignment target; only variables, struct fields and list
    /// elements can be assigned
    fn assignable(&mut self, target: NodeId) -> Result<TypeId> {
        match self.session.ast.kind(target).clone() {
            NodeKind::Ident { .. } | NodeKind::Member { .. } if self.session.bindings.contains_key(&target) => {
                match self.session.bindings.get(&target) {
                    Some(Binding::Local(_)) | Some(Binding::Global(_)) => self.expr(target, None),
                    _ => Err(self.error(ErrorKind::InvalidAssignmentTarget, target)),
                }
            }
            NodeKind::Member { object, name } => {
                let ty = self.expr(object, None)?;
                let field = self
                    .session
                    .types
                    .struct_info(ty)
                    .and_then(|info| info.fields.iter().find(|(field, _)| *field == name).map(|(_, t)| *t));
                match field {
                    Some(field_ty) => {
                        self.session.ast.set_ty(target, field_ty);
                        Ok(field_ty)
                    }
                    None => Err(self.error(ErrorKind::InvalidAssignmentTarget, target)),
                }
            }
            NodeKind::Index { object, .. } => {
                let ty = self.expr(target, None)?;
                let object_ty = self.type_of(object)?;
                if !matches!(self.session.types.get(object_ty), Type::List(_)) {
                    return Err(self.error(ErrorKind::InvalidAssignmentTarget, target));
                }
                Ok(ty)
            }
            _ => Err(self.error(ErrorKind::InvalidAssignmentTarget, target)),
        }
    }

    fn cast(&mut self, node: NodeId, expr: NodeId, ty_node: NodeId) -> Result<TypeId> {
        let from = self.expr(expr, None)?;
        let to = self.type_of(ty_node)?;
        let types = &self.session.types;

        let integer_like = |t: TypeId| t == TypeId::INT || types.is_inttype(t) || types.is_handle(t);
        let related = (types.is_inttype(from) && types.is_inttype(to) || types.is_handle(from) && types.is_handle(to))
            && (types.inherits(from, to) || types.inherits(to, from));

        let rewrite = if types.same(from, to) || related {
            None
        } else if from == TypeId::INT && to == TypeId::FLOAT {
            Some(Intrinsic::IntToFloat)
        } else if from == TypeId::FLOAT && to == TypeId::INT {
            Some(Intrinsic::FloatToInt)
        } else if (from == TypeId::INT && integer_like(to)) || (integer_like(from) && to == TypeId::INT) {
            None
        } else if from == TypeId::ANY && to != TypeId::VOID {
            Some(Intrinsic::Unbox(to.0))
        } else {
            return Err(self.error(ErrorKind::InvalidCast(self.name(from), self.name(to)), node));
        };

        if let Some(op) = rewrite {
            self.session.ast.node_mut(node).kind = NodeKind::Intrinsic { op, args: vec![expr] };
        }
        Ok(to)
    }
}

/// True when every path through `node` ends in a `return`
fn always_returns(checker: &Checker<'_>, node: NodeId) -> bool {
    match checker.session.ast.kind(node) {
        NodeKind::Return { .. } => true,
        NodeKind::Block { stmts } => stmts.last().map_or(false, |&last| always_returns(checker, last)),
        NodeKind::If { then, els: Some(els), .. } | NodeKind::IfIn { then, els: Some(els), .. } => {
            always_returns(checker, *then) && always_returns(checker, *els)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostTable;
    use std::path::Path;
    use std::rc::Rc;

    fn check(source: &str) -> Result<Session> {
        let mut session = Session::new(Rc::new(HostTable::standard()))?;
        session.load_source("test.fer", source, Path::new("."))?;
        Ok(session)
    }

    fn check_err(source: &str) -> ErrorKind {
        match check(source) {
            Ok(_) => panic!("expected a compile error"),
            Err(err) => err.kind,
        }
    }

    #[test]
    fn test_arithmetic_requires_identical_operands() {
        assert!(check("int F() { return 1 + 2; }").is_ok());
        assert!(matches!(check_err("float F() { return 1 + 2.0; }"), ErrorKind::InvalidOperands(..)));
        assert!(check("float F() { return 1 as float + 2.0; }").is_ok());
    }

    #[test]
    fn test_inttype_widening() {
        let source = "inttype Length; inttype Meters : Length; \
                      Length Total(Length a, Meters b) { return a + b; } \
                      Length Widen(Meters m) { return m; }";
        assert!(check(source).is_ok());
        assert!(matches!(
            check_err("inttype A; inttype B; A F(A a, B b) { return a + b; }"),
            ErrorKind::InvalidOperands(..)
        ));
        assert!(matches!(check_err("inttype A; A F() { return 5; }"), ErrorKind::TypeMismatch(..)));
        assert!(check("inttype A; A F() { return 0; }").is_ok());
    }

    #[test]
    fn test_implicit_error_and_any() {
        let session = check("error<int> F() { return 5; } any G() { return \"s\"; }").unwrap();
        let implicits = (0..session.ast.len() as u32)
            .filter(|&i| matches!(session.ast.kind(NodeId(i)), NodeKind::Implicit { .. }))
            .count();
        assert_eq!(implicits, 2);
    }

    #[test]
    fn test_missing_return() {
        assert!(matches!(
            check_err("int F(bool b) { if b { return 1; } }"),
            ErrorKind::MissingReturn(_)
        ));
        assert!(check("int F(bool b) { if b { return 1; } else { return 2; } }").is_ok());
        assert!(check("void F() { }").is_ok());
    }

    #[test]
    fn test_members_and_intrinsics() {
        assert!(check("int F(list<int> xs) { xs.push(3); return xs.length; }").is_ok());
        assert!(check("string F(error<int> e) { return e.message; }").is_ok());
        assert!(matches!(check_err("int F(int x) { return x.length; }"), ErrorKind::NoSuchMember(..)));
    }

    #[test]
    fn test_function_values() {
        let source = "int Add(int a, int b) { return a + b; } \
                      bool Pos(int a) { return a > 0; } \
                      void F() { fn<int(int)> inc = bind(Add, 1); fn<void(int)> d = Add2; fn<void(int)> c = asserting(Pos); } \
                      int Add2(int a) { return a; }";
        assert!(check(source).is_ok());
    }

    #[test]
    fn test_undeclared_and_duplicates() {
        assert!(matches!(check_err("int F() { return y; }"), ErrorKind::UndeclaredIdentifier(_)));
        assert!(matches!(check_err("void F() { int a; int a; }"), ErrorKind::DuplicateDeclaration(_)));
        assert!(matches!(check_err("void F() { break; }"), ErrorKind::BreakOutsideLoop));
        assert!(matches!(check_err("extern void Nope();"), ErrorKind::UnknownHostFunction(_)));
    }

    #[test]
    fn test_qualified_globals() {
        assert!(check("option int port = 80; persist float ratio;").is_ok());
        assert!(matches!(check_err("option float ratio;"), ErrorKind::InvalidDeclaration(_)));
    }

    #[test]
    fn test_casts() {
        assert!(check("int F(any a) { return a as int; }").is_ok());
        assert!(matches!(check_err("string F(int a) { return a as string; }"), ErrorKind::InvalidCast(..)));
    }
}
