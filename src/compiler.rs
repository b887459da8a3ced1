//! Compiler: typed AST → Bytecode
//!
//! A direct post-order walk: operands are emitted before their operator,
//! forward branches get a placeholder offset that is patched once the
//! skipped code is known. Every module gets one chunk holding its
//! functions plus a synthetic function that runs its global initializers.
//!
//! Locals follow the resolver's slot numbering, which is a stack: a
//! declaration pushes one slot and leaving a scope drops the slots it
//! declared. `depth` mirrors the runtime local count of the function being
//! compiled, so `break`, `continue` and scope exits know how many to drop.

use crate::ast::{BinaryOp, Implicit, Intrinsic, LogicalOp, NodeId, NodeKind, Qualifier, UnaryOp};
use crate::bytecode::{Chunk, OpCode};
use crate::config::EngineConfig;
use crate::error::{ErrorKind, FerruleError, Result};
use crate::loader::Session;
use crate::program::{CompiledModule, FunctionInfo, GlobalInfo, ModuleInit, Program};
use crate::scope::Binding;
use crate::types::{Type, TypeId};

struct LoopContext {
    /// Local depth inside the loop body, before any body declarations
    depth: u32,
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

/// The bytecode compiler
pub struct Compiler<'s> {
    session: &'s mut Session,
    chunks: Vec<Chunk>,
    functions: Vec<FunctionInfo>,
    module: u32,
    function: u32,
    depth: u32,
    loops: Vec<LoopContext>,
}

impl<'s> Compiler<'s> {
    pub fn new(session: &'s mut Session) -> Self {
        let chunks = vec![Chunk::new(); session.modules.len()];
        let functions = session
            .functions
            .iter()
            .map(|decl| FunctionInfo {
                name: decl.name.clone(),
                module: decl.module,
                entry: 0,
                arity: 0,
                ret: TypeId::VOID,
            })
            .collect();
        Self { session, chunks, functions, module: 0, function: 0, depth: 0, loops: Vec::new() }
    }

    /// Compile every loaded module into a program whose start function is
    /// looked up in `main`
    pub fn compile(mut self, main: u32, config: &EngineConfig) -> Result<Program> {
        for index in 0..self.session.functions.len() {
            let (ret, arity) = match self.session.types.get(self.session.functions[index].ty) {
                Type::Func { ret, params } => (*ret, params.len() as u32),
                _ => return Err(FerruleError::defect(format!("function '{}' has no signature", self.functions[index].name))),
            };
            self.functions[index].ret = ret;
            self.functions[index].arity = arity;
        }

        let order = self.session.order.clone();
        let mut inits = Vec::with_capacity(order.len());
        let mut start = None;
        for &module in &order {
            self.module = module;
            let items = self.module_items(module)?;

            for &item in &items {
                if let NodeKind::Function { body: Some(_), .. } = self.session.ast.kind(item) {
                    let index = match self.session.bindings.get(&item) {
                        Some(Binding::Function(index)) => *index,
                        _ => return Err(FerruleError::defect("function declaration without a binding")),
                    };
                    self.compile_function(index, item)?;
                }
            }

            let globals = self.compile_global_init(module, &items)?;
            let init = self.find_function(module, &config.init)?;
            if let Some(init) = init {
                let info = &self.functions[init as usize];
                if info.arity != 0 || info.ret != TypeId::VOID {
                    return Err(self.declaration_error(init, format!("'{}' must take no parameters and return void", config.init)));
                }
            }
            inits.push(ModuleInit { module, globals, init });

            let trailing = items.iter().copied().find(|&item| matches!(self.session.ast.kind(item), NodeKind::Trailing { .. }));
            if let Some(trailing) = trailing {
                if module != main {
                    return Err(FerruleError::new(
                        ErrorKind::InvalidDeclaration("a trailing expression is only allowed in the main module".to_string()),
                        Some(self.session.ast.span(trailing)),
                    ));
                }
                start = Some(self.compile_trailing(module, trailing)?);
            }
        }

        let start = match start {
            Some(start) => start,
            None => {
                let start = self
                    .find_function(main, &config.start)?
                    .ok_or_else(|| FerruleError::new(ErrorKind::MissingStart(config.start.clone()), None))?;
                if self.functions[start as usize].arity != 0 {
                    return Err(self.declaration_error(start, format!("'{}' must take no parameters", config.start)));
                }
                start
            }
        };

        let modules = self
            .session
            .modules
            .iter()
            .zip(self.chunks)
            .map(|(info, chunk)| CompiledModule {
                path: info.display.clone(),
                source: info.source.clone(),
                chunk,
                global_base: info.global_base,
                global_count: info.global_count,
            })
            .collect();
        let globals = self
            .session
            .globals
            .iter()
            .map(|g| GlobalInfo { name: g.name.clone(), module: g.module, ty: g.ty, qualifier: g.qualifier })
            .collect();

        tracing::debug!(functions = self.functions.len(), modules = order.len(), "compiled program");
        Ok(Program {
            modules,
            functions: self.functions,
            globals,
            types: self.session.types.clone(),
            inits,
            start,
            main,
            host_names: self.session.host.names(),
        })
    }

    fn module_items(&self, module: u32) -> Result<Vec<NodeId>> {
        let root = self.session.modules[module as usize].root;
        match self.session.ast.kind(root) {
            NodeKind::Module { items } => Ok(items.clone()),
            other => Err(FerruleError::defect(format!("module root is a {}", other.label()))),
        }
    }

    /// A script function named `name` declared by `module` itself
    fn find_function(&self, module: u32, name: &str) -> Result<Option<u32>> {
        let scope = self.session.modules[module as usize].scope;
        match self.session.scopes.lookup_here(scope, name).map(|entry| entry.binding) {
            Some(Binding::Function(index)) if self.functions[index as usize].module == module => Ok(Some(index)),
            _ => Ok(None),
        }
    }

    fn declaration_error(&self, function: u32, message: String) -> FerruleError {
        let span = self.session.functions.get(function as usize).map(|f| self.session.ast.span(f.decl));
        FerruleError::new(ErrorKind::InvalidDeclaration(message), span)
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.chunks[self.module as usize]
    }

    fn emit(&mut self, op: OpCode) {
        self.chunk().emit(op);
    }

    fn emit_index(&mut self, op: OpCode, index: u32) {
        let chunk = self.chunk();
        chunk.emit(op);
        chunk.emit_u32(index);
    }

    fn mark(&mut self, node: NodeId) {
        let span = self.session.ast.span(node);
        let function = self.function;
        self.chunk().mark_line(span.line, span.column, function);
    }

    fn ty(&self, node: NodeId) -> Result<TypeId> {
        self.session
            .ast
            .ty(node)
            .ok_or_else(|| FerruleError::defect(format!("{} reached the compiler untyped", self.session.ast.kind(node).label())))
    }

    /// Start a function body at the current end of the module's chunk
    fn begin_function(&mut self, index: u32, depth: u32) {
        self.function = index;
        self.depth = depth;
        self.loops.clear();
        let entry = self.chunk().len();
        self.functions[index as usize].entry = entry;
    }

    fn add_function(&mut self, name: String, module: u32, ret: TypeId) -> u32 {
        let index = self.functions.len() as u32;
        self.functions.push(FunctionInfo { name, module, entry: 0, arity: 0, ret });
        index
    }

    fn compile_function(&mut self, index: u32, decl: NodeId) -> Result<()> {
        let body = match self.session.ast.kind(decl) {
            NodeKind::Function { body: Some(body), .. } => *body,
            other => return Err(FerruleError::defect(format!("expected function body, found {}", other.label()))),
        };
        let arity = self.functions[index as usize].arity;
        self.begin_function(index, arity);
        self.mark(decl);
        self.stmt(body)?;
        if self.functions[index as usize].ret == TypeId::VOID {
            self.emit(OpCode::Return);
            self.chunk().emit_u8(0);
        } else {
            self.emit(OpCode::Unreachable);
        }
        Ok(())
    }

    fn compile_global_init(&mut self, module: u32, items: &[NodeId]) -> Result<u32> {
        let name = format!("<globals {}>", self.session.modules[module as usize].display);
        let index = self.add_function(name, module, TypeId::VOID);
        self.begin_function(index, 0);
        let root = self.session.modules[module as usize].root;
        self.mark(root);
        for &item in items {
            if let NodeKind::VarDecl { .. } = self.session.ast.kind(item) {
                self.var_decl(item)?;
            }
        }
        self.emit(OpCode::Return);
        self.chunk().emit_u8(0);
        Ok(index)
    }

    /// The final bare expression of a script becomes its start function
    fn compile_trailing(&mut self, module: u32, trailing: NodeId) -> Result<u32> {
        let expr = match self.session.ast.kind(trailing) {
            NodeKind::Trailing { expr } => *expr,
            other => return Err(FerruleError::defect(format!("expected trailing expression, found {}", other.label()))),
        };
        let ret = self.ty(expr)?;
        let index = self.add_function("<main>".to_string(), module, ret);
        self.begin_function(index, 0);
        self.mark(trailing);
        self.expr(expr)?;
        self.emit(OpCode::Return);
        self.chunk().emit_u8((ret != TypeId::VOID) as u8);
        Ok(index)
    }

    // ==================== Statements ====================

    /// Drop locals declared since `depth`
    fn release_to(&mut self, depth: u32) {
        if self.depth > depth {
            let count = self.depth - depth;
            self.emit_index(OpCode::Release, count);
            self.depth = depth;
        }
    }

    fn reserve(&mut self, count: u32) {
        if count > 0 {
            self.emit_index(OpCode::Reserve, count);
            self.depth += count;
        }
    }

    fn stmt(&mut self, node: NodeId) -> Result<()> {
        self.mark(node);
        match self.session.ast.kind(node).clone() {
            NodeKind::Block { stmts } => {
                let entry = self.depth;
                for stmt in stmts {
                    self.stmt(stmt)?;
                }
                self.release_to(entry);
            }
            NodeKind::VarDecl { .. } => self.var_decl(node)?,
            NodeKind::ExprStmt { expr } => {
                self.expr(expr)?;
                if self.ty(expr)? != TypeId::VOID {
                    self.emit(OpCode::Pop);
                }
            }
            NodeKind::Assert { expr } => {
                self.expr(expr)?;
                self.emit(OpCode::Assert);
            }
            NodeKind::If { cond, then, els } => {
                self.expr(cond)?;
                let to_else = self.chunk().emit_jump(OpCode::JumpIfFalse);
                self.stmt(then)?;
                match els {
                    Some(els) => {
                        let to_end = self.chunk().emit_jump(OpCode::Jump);
                        self.chunk().patch_jump(to_else)?;
                        self.stmt(els)?;
                        self.chunk().patch_jump(to_end)?;
                    }
                    None => self.chunk().patch_jump(to_else)?,
                }
            }
            NodeKind::IfIn { binder, expr, then, els } => {
                self.expr(expr)?;
                self.emit(OpCode::ErrorUnwrap);
                let to_else = self.chunk().emit_jump(OpCode::JumpIfFalse);
                let entry = self.depth;
                self.reserve(1);
                let slot = self.local_slot(binder)?;
                self.emit_index(OpCode::StoreLocal, slot);
                self.stmt(then)?;
                self.release_to(entry);
                match els {
                    Some(els) => {
                        let to_end = self.chunk().emit_jump(OpCode::Jump);
                        self.chunk().patch_jump(to_else)?;
                        self.stmt(els)?;
                        self.chunk().patch_jump(to_end)?;
                    }
                    None => self.chunk().patch_jump(to_else)?,
                }
            }
            NodeKind::While { cond, body } => {
                let top = self.chunk().len();
                self.expr(cond)?;
                let exit = self.chunk().emit_jump(OpCode::JumpIfFalse);
                self.loops.push(LoopContext { depth: self.depth, breaks: Vec::new(), continues: Vec::new() });
                self.stmt(body)?;
                let context = self.pop_loop()?;
                for at in context.continues {
                    self.chunk().patch_jump_to(at, top)?;
                }
                self.chunk().emit_loop(top)?;
                self.chunk().patch_jump(exit)?;
                for at in context.breaks {
                    self.chunk().patch_jump(at)?;
                }
            }
            NodeKind::For { init, cond, step, body } => {
                let entry = self.depth;
                if let Some(init) = init {
                    self.stmt(init)?;
                }
                let top = self.chunk().len();
                let exit = match cond {
                    Some(cond) => {
                        self.expr(cond)?;
                        Some(self.chunk().emit_jump(OpCode::JumpIfFalse))
                    }
                    None => None,
                };
                self.loops.push(LoopContext { depth: self.depth, breaks: Vec::new(), continues: Vec::new() });
                self.stmt(body)?;
                let context = self.pop_loop()?;
                let step_label = self.chunk().len();
                for at in context.continues {
                    self.chunk().patch_jump_to(at, step_label)?;
                }
                if let Some(step) = step {
                    self.stmt(step)?;
                }
                self.chunk().emit_loop(top)?;
                if let Some(exit) = exit {
                    self.chunk().patch_jump(exit)?;
                }
                for at in context.breaks {
                    self.chunk().patch_jump(at)?;
                }
                self.release_to(entry);
            }
            NodeKind::ForIn { binder, iterable, body } => self.for_in(binder, iterable, body)?,
            NodeKind::Return { value } => {
                let has_value = match value {
                    Some(value) => {
                        self.expr(value)?;
                        1
                    }
                    None => 0,
                };
                self.emit(OpCode::Return);
                self.chunk().emit_u8(has_value);
            }
            NodeKind::Break | NodeKind::Continue => {
                let is_break = matches!(self.session.ast.kind(node), NodeKind::Break);
                let target = self.loops.last().map(|l| l.depth).ok_or_else(|| FerruleError::defect("loop jump outside of a loop"))?;
                if self.depth > target {
                    self.emit_index(OpCode::Release, self.depth - target);
                }
                let at = self.chunk().emit_jump(OpCode::Jump);
                if let Some(context) = self.loops.last_mut() {
                    if is_break {
                        context.breaks.push(at);
                    } else {
                        context.continues.push(at);
                    }
                }
            }
            other => return Err(FerruleError::defect(format!("unexpected {} in statement position", other.label()))),
        }
        Ok(())
    }

    fn pop_loop(&mut self) -> Result<LoopContext> {
        self.loops.pop().ok_or_else(|| FerruleError::defect("loop context underflow"))
    }

    /// `for T v in xs` over a list or string, as an index-counting loop
    /// keeping `[iterable, index]` on the operand stack
    fn for_in(&mut self, binder: NodeId, iterable: NodeId, body: NodeId) -> Result<()> {
        let entry = self.depth;
        self.expr(iterable)?;
        self.chunk().emit(OpCode::PushInt);
        self.chunk().emit_i64(0);
        self.reserve(1);
        let slot = self.local_slot(binder)?;

        // index < iterable.length
        let top = self.chunk().len();
        for op in [OpCode::Swap, OpCode::Dup, OpCode::Length, OpCode::Rot, OpCode::Dup, OpCode::Rot, OpCode::LtI] {
            self.emit(op);
        }
        let exit = self.chunk().emit_jump(OpCode::JumpIfFalse);

        // binder = iterable[index]
        for op in [OpCode::Swap, OpCode::Dup, OpCode::Rot, OpCode::Dup, OpCode::Rot, OpCode::Swap, OpCode::GetIndex] {
            self.emit(op);
        }
        self.emit_index(OpCode::StoreLocal, slot);

        self.loops.push(LoopContext { depth: self.depth, breaks: Vec::new(), continues: Vec::new() });
        self.stmt(body)?;
        let context = self.pop_loop()?;

        let step = self.chunk().len();
        for at in context.continues {
            self.chunk().patch_jump_to(at, step)?;
        }
        self.chunk().emit(OpCode::PushInt);
        self.chunk().emit_i64(1);
        self.emit(OpCode::AddI);
        self.chunk().emit_loop(top)?;

        self.chunk().patch_jump(exit)?;
        for at in context.breaks {
            self.chunk().patch_jump(at)?;
        }
        self.emit(OpCode::Pop);
        self.emit(OpCode::Pop);
        self.release_to(entry);
        Ok(())
    }

    fn local_slot(&self, binder: NodeId) -> Result<u32> {
        match self.session.bindings.get(&binder) {
            Some(Binding::Local(slot)) => Ok(*slot),
            _ => Err(FerruleError::defect(format!("'{}' is not a local", self.session.ast.decl_name(binder)))),
        }
    }

    /// Local or global declaration, depending on how its binders resolved
    fn var_decl(&mut self, node: NodeId) -> Result<()> {
        let (binders, init) = match self.session.ast.kind(node) {
            NodeKind::VarDecl { binders, init, .. } => (binders.clone(), *init),
            other => return Err(FerruleError::defect(format!("expected declaration, found {}", other.label()))),
        };

        match (init, binders.as_slice()) {
            (Some(init), [binder]) => {
                self.expr(init)?;
                self.declare(*binder)?;
            }
            (Some(init), _) => {
                // Destructure a tuple left to right
                self.expr(init)?;
                for (index, &binder) in binders.iter().enumerate() {
                    self.emit(OpCode::Dup);
                    self.emit_index(OpCode::GetField, index as u32);
                    self.declare(binder)?;
                }
                self.emit(OpCode::Pop);
            }
            (None, _) => {
                for &binder in &binders {
                    let ty = self.ty(binder)?;
                    self.default_value(ty);
                    self.declare(binder)?;
                }
            }
        }
        Ok(())
    }

    /// Store the value on top of the stack into a freshly declared variable
    fn declare(&mut self, binder: NodeId) -> Result<()> {
        match self.session.bindings.get(&binder).copied() {
            Some(Binding::Local(slot)) => {
                self.reserve(1);
                self.emit_index(OpCode::StoreLocal, slot);
            }
            // Persisted globals start from their initializer; the file overrides it on first access
            Some(Binding::Global(index)) => self.emit_index(OpCode::StoreGlobal, index),
            _ => return Err(FerruleError::defect(format!("'{}' has no slot", self.session.ast.decl_name(binder)))),
        }
        Ok(())
    }

    fn default_value(&mut self, ty: TypeId) {
        match ty {
            TypeId::STRING => {
                let index = self.chunk().add_string("");
                self.emit_index(OpCode::PushStr, index);
            }
            TypeId::FLOAT => {
                self.emit(OpCode::PushFloat);
                self.chunk().emit_f64(0.0);
            }
            _ => self.emit(OpCode::PushNull),
        }
    }

    // ==================== Expressions ====================

    fn expr(&mut self, node: NodeId) -> Result<()> {
        self.mark(node);
        match self.session.ast.kind(node).clone() {
            NodeKind::IntLit(n) => {
                self.emit(OpCode::PushInt);
                self.chunk().emit_i64(n);
            }
            NodeKind::FloatLit(n) => {
                self.emit(OpCode::PushFloat);
                self.chunk().emit_f64(n);
            }
            NodeKind::BoolLit(b) => {
                self.emit(OpCode::PushInt);
                self.chunk().emit_i64(b as i64);
            }
            NodeKind::StrLit(text) => {
                let index = self.chunk().add_string(&text);
                self.emit_index(OpCode::PushStr, index);
            }
            NodeKind::Null => self.emit(OpCode::PushNull),
            NodeKind::Interp { parts } => {
                if parts.is_empty() {
                    self.default_value(TypeId::STRING);
                }
                for (i, part) in parts.into_iter().enumerate() {
                    self.expr(part)?;
                    let ty = self.ty(part)?;
                    self.stringify(ty);
                    if i > 0 {
                        self.emit(OpCode::Concat);
                    }
                }
            }
            NodeKind::ListLit { items } => {
                let count = items.len() as u32;
                for item in items {
                    self.expr(item)?;
                }
                self.emit_index(OpCode::MakeList, count);
            }
            NodeKind::TupleLit { items } => {
                let count = items.len() as u32;
                for item in items {
                    self.expr(item)?;
                }
                self.emit_index(OpCode::MakeTuple, count);
            }
            NodeKind::Ident { .. } => self.load(node)?,
            NodeKind::Member { object, name } => {
                if self.session.bindings.contains_key(&node) {
                    self.load(node)?;
                } else {
                    let field = self.field_index(object, &name)?;
                    self.expr(object)?;
                    self.emit_index(OpCode::GetField, field);
                }
            }
            NodeKind::Index { object, index } => {
                self.expr(object)?;
                self.expr(index)?;
                self.emit(OpCode::GetIndex);
            }
            NodeKind::Call { callee, args } => {
                let argc = args.len() as u32;
                match self.session.bindings.get(&callee).copied() {
                    Some(Binding::Function(function)) => {
                        for arg in args {
                            self.expr(arg)?;
                        }
                        self.mark(node);
                        self.emit_index(OpCode::Call, function);
                    }
                    Some(Binding::Host(host)) => {
                        for arg in args {
                            self.expr(arg)?;
                        }
                        self.mark(node);
                        self.emit_index(OpCode::CallHost, host);
                        self.chunk().emit_u32(argc);
                    }
                    _ => {
                        self.expr(callee)?;
                        for arg in args {
                            self.expr(arg)?;
                        }
                        self.mark(node);
                        self.emit_index(OpCode::CallPtr, argc);
                    }
                }
            }
            NodeKind::Unary { op, operand } => {
                self.expr(operand)?;
                match op {
                    UnaryOp::Not => self.emit(OpCode::Not),
                    UnaryOp::Neg if self.ty(operand)? == TypeId::FLOAT => self.emit(OpCode::NegF),
                    UnaryOp::Neg => self.emit(OpCode::NegI),
                }
            }
            NodeKind::Binary { op, lhs, rhs } => {
                self.expr(lhs)?;
                self.expr(rhs)?;
                self.mark(node);
                let operand = self.ty(lhs)?;
                self.binary_op(op, operand)?;
            }
            NodeKind::Logical { op, lhs, rhs } => {
                self.expr(lhs)?;
                let jump = match op {
                    LogicalOp::And => OpCode::JumpIfFalseOrPop,
                    LogicalOp::Or => OpCode::JumpIfTrueOrPop,
                };
                let end = self.chunk().emit_jump(jump);
                self.expr(rhs)?;
                self.chunk().patch_jump(end)?;
            }
            NodeKind::Assign { op, target, value } => self.assign(node, op, target, value)?,
            NodeKind::New { .. } => {
                let ty = self.ty(node)?;
                match self.session.types.get(ty) {
                    Type::Struct(_) => self.emit_index(OpCode::NewStruct, ty.0),
                    Type::List(_) => self.emit(OpCode::NewList),
                    _ => return Err(FerruleError::defect(format!("new {}", self.session.types.name(ty)))),
                }
            }
            NodeKind::Fail { message, .. } => {
                self.expr(message)?;
                self.emit(OpCode::WrapFail);
            }
            NodeKind::Cast { expr, .. } => self.expr(expr)?,
            NodeKind::Implicit { conv, expr } => {
                self.expr(expr)?;
                match conv {
                    Implicit::ToError => self.emit(OpCode::WrapOk),
                    Implicit::Box(type_id) => self.emit_index(OpCode::Box, type_id),
                    Implicit::Discard => self.emit(OpCode::DiscardFn),
                    Implicit::Widen | Implicit::Retype => {}
                }
            }
            NodeKind::Intrinsic { op, args } => {
                for arg in args {
                    self.expr(arg)?;
                }
                self.mark(node);
                match op {
                    Intrinsic::Length => self.emit(OpCode::Length),
                    Intrinsic::Push => self.emit(OpCode::Push),
                    Intrinsic::ErrorMessage => self.emit(OpCode::ErrorMessage),
                    Intrinsic::IntToFloat => self.emit(OpCode::IntToFloat),
                    Intrinsic::FloatToInt => self.emit(OpCode::FloatToInt),
                    Intrinsic::Unbox(type_id) => self.emit_index(OpCode::Unbox, type_id),
                }
            }
            NodeKind::Async { call } => {
                let (callee, args) = match self.session.ast.kind(call) {
                    NodeKind::Call { callee, args } => (*callee, args.clone()),
                    other => return Err(FerruleError::defect(format!("async on {}", other.label()))),
                };
                let argc = args.len() as u32;
                match self.session.bindings.get(&callee).copied() {
                    Some(Binding::Function(function)) => {
                        for arg in args {
                            self.expr(arg)?;
                        }
                        self.mark(node);
                        self.emit_index(OpCode::Async, function);
                        self.chunk().emit_u32(argc);
                    }
                    _ => {
                        self.expr(callee)?;
                        for arg in args {
                            self.expr(arg)?;
                        }
                        self.mark(node);
                        self.emit_index(OpCode::AsyncPtr, argc);
                    }
                }
            }
            NodeKind::Await { ids } => {
                self.expr(ids)?;
                self.mark(node);
                self.emit(OpCode::Await);
            }
            NodeKind::Bind { func, arg } => {
                self.expr(func)?;
                self.expr(arg)?;
                self.emit(OpCode::BindFn);
            }
            NodeKind::Discard { func } => {
                self.expr(func)?;
                self.emit(OpCode::DiscardFn);
            }
            NodeKind::Asserting { func } => {
                self.expr(func)?;
                self.emit(OpCode::AssertFn);
            }
            other => return Err(FerruleError::defect(format!("unexpected {} in expression position", other.label()))),
        }
        Ok(())
    }

    fn field_index(&self, object: NodeId, name: &str) -> Result<u32> {
        let ty = self.ty(object)?;
        self.session
            .types
            .struct_info(ty)
            .and_then(|info| info.fields.iter().position(|(field, _)| field == name))
            .map(|i| i as u32)
            .ok_or_else(|| FerruleError::defect(format!("no field '{}' on {}", name, self.session.types.name(ty))))
    }

    fn persisted(&self, global: u32) -> bool {
        self.session.globals.get(global as usize).map_or(false, |g| g.qualifier == Qualifier::Persist)
    }

    /// Push the value of a resolved name
    fn load(&mut self, node: NodeId) -> Result<()> {
        match self.session.bindings.get(&node).copied() {
            Some(Binding::Local(slot)) => self.emit_index(OpCode::LoadLocal, slot),
            Some(Binding::Global(index)) if self.persisted(index) => self.emit_index(OpCode::LoadPersist, index),
            Some(Binding::Global(index)) => self.emit_index(OpCode::LoadGlobal, index),
            Some(Binding::Function(function)) => self.emit_index(OpCode::FuncRef, function),
            other => return Err(FerruleError::defect(format!("cannot load {:?}", other))),
        }
        Ok(())
    }

    /// Pop the top of the stack into a resolved variable
    fn store(&mut self, node: NodeId) -> Result<()> {
        match self.session.bindings.get(&node).copied() {
            Some(Binding::Local(slot)) => self.emit_index(OpCode::StoreLocal, slot),
            Some(Binding::Global(index)) if self.persisted(index) => self.emit_index(OpCode::StorePersist, index),
            Some(Binding::Global(index)) => self.emit_index(OpCode::StoreGlobal, index),
            other => return Err(FerruleError::defect(format!("cannot store to {:?}", other))),
        }
        Ok(())
    }

    fn assign(&mut self, node: NodeId, op: Option<BinaryOp>, target: NodeId, value: NodeId) -> Result<()> {
        let target_ty = self.ty(node)?;
        match self.session.ast.kind(target).clone() {
            NodeKind::Ident { .. } | NodeKind::Member { .. } if self.session.bindings.contains_key(&target) => {
                if let Some(op) = op {
                    self.load(target)?;
                    self.expr(value)?;
                    self.binary_op(op, target_ty)?;
                } else {
                    self.expr(value)?;
                }
                self.emit(OpCode::Dup);
                self.store(target)?;
            }
            NodeKind::Member { object, name } => {
                let field = self.field_index(object, &name)?;
                self.expr(object)?;
                if let Some(op) = op {
                    self.emit(OpCode::Dup);
                    self.emit_index(OpCode::GetField, field);
                    self.expr(value)?;
                    self.binary_op(op, target_ty)?;
                } else {
                    self.expr(value)?;
                }
                self.mark(node);
                self.emit_index(OpCode::SetField, field);
            }
            NodeKind::Index { object, index } => {
                self.expr(object)?;
                self.expr(index)?;
                if let Some(op) = op {
                    self.emit(OpCode::Dup2);
                    self.emit(OpCode::GetIndex);
                    self.expr(value)?;
                    self.binary_op(op, target_ty)?;
                } else {
                    self.expr(value)?;
                }
                self.mark(node);
                self.emit(OpCode::SetIndex);
            }
            other => return Err(FerruleError::defect(format!("assignment to {}", other.label()))),
        }
        Ok(())
    }

    fn binary_op(&mut self, op: BinaryOp, operand: TypeId) -> Result<()> {
        let types = &self.session.types;
        let float = operand == TypeId::FLOAT;
        let string = operand == TypeId::STRING;
        let scalar = types.is_integer_like(operand) || operand == TypeId::BOOL;

        let (swap, code, negate) = match op {
            BinaryOp::Add if string => (false, OpCode::Concat, false),
            BinaryOp::Add => (false, if float { OpCode::AddF } else { OpCode::AddI }, false),
            BinaryOp::Sub => (false, if float { OpCode::SubF } else { OpCode::SubI }, false),
            BinaryOp::Mul => (false, if float { OpCode::MulF } else { OpCode::MulI }, false),
            BinaryOp::Div => (false, if float { OpCode::DivF } else { OpCode::DivI }, false),
            BinaryOp::Mod => (false, OpCode::ModI, false),
            BinaryOp::Lt | BinaryOp::Gt => {
                let code = if float { OpCode::LtF } else if string { OpCode::LtS } else { OpCode::LtI };
                (op == BinaryOp::Gt, code, false)
            }
            BinaryOp::Le | BinaryOp::Ge => {
                let code = if float { OpCode::LeF } else if string { OpCode::LeS } else { OpCode::LeI };
                (op == BinaryOp::Ge, code, false)
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                let code = if float {
                    OpCode::EqF
                } else if string {
                    OpCode::EqS
                } else if scalar {
                    OpCode::EqI
                } else {
                    OpCode::EqRef
                };
                (false, code, op == BinaryOp::Ne)
            }
        };

        if swap {
            self.emit(OpCode::Swap);
        }
        self.emit(code);
        if negate {
            self.emit(OpCode::Not);
        }
        Ok(())
    }

    fn stringify(&mut self, ty: TypeId) {
        match ty {
            TypeId::STRING => {}
            TypeId::FLOAT => self.emit(OpCode::ToStrF),
            TypeId::BOOL => self.emit(OpCode::ToStrB),
            _ => self.emit(OpCode::ToStrI),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostTable;
    use crate::loader::compile_source;
    use std::rc::Rc;

    fn compile(source: &str) -> Result<Program> {
        compile_source("test.fer", source, Rc::new(HostTable::standard()), &EngineConfig::default())
    }

    /// Opcodes of one function, up to the next function entry in its chunk
    fn opcodes(program: &Program, function: &str) -> Vec<OpCode> {
        let info = program.functions.iter().find(|f| f.name == function).unwrap();
        let chunk = &program.modules[info.module as usize].chunk;
        let end = program
            .functions
            .iter()
            .filter(|f| f.module == info.module && f.entry > info.entry)
            .map(|f| f.entry)
            .min()
            .unwrap_or(chunk.len());
        let mut ops = Vec::new();
        let mut offset = info.entry;
        while offset < end {
            let op = OpCode::from_byte(chunk.code[offset]).unwrap();
            ops.push(op);
            offset += 1 + op.operands().iter().map(|o| o.width()).sum::<usize>();
        }
        ops
    }

    #[test]
    fn test_post_order_arithmetic() {
        let program = compile("int Start() { return 2 + 3 * 4; }").unwrap();
        let ops = opcodes(&program, "Start");
        assert_eq!(
            &ops[..6],
            &[OpCode::PushInt, OpCode::PushInt, OpCode::PushInt, OpCode::MulI, OpCode::AddI, OpCode::Return]
        );
    }

    #[test]
    fn test_greater_swaps_operands() {
        let program = compile("bool Start() { return 1 > 2; }").unwrap();
        let ops = opcodes(&program, "Start");
        assert_eq!(&ops[..4], &[OpCode::PushInt, OpCode::PushInt, OpCode::Swap, OpCode::LtI]);
    }

    #[test]
    fn test_block_locals_are_released() {
        let program = compile("void Start() { int a = 1; { int b = 2; } }").unwrap();
        let ops = opcodes(&program, "Start");
        let reserves = ops.iter().filter(|op| **op == OpCode::Reserve).count();
        let releases = ops.iter().filter(|op| **op == OpCode::Release).count();
        assert_eq!(reserves, 2);
        assert_eq!(releases, 2);
    }

    #[test]
    fn test_missing_start() {
        let err = compile("int Helper() { return 1; }").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::MissingStart(ref name) if name == "Start"));
    }

    #[test]
    fn test_trailing_expression_becomes_start() {
        let program = compile("int x = 4;\nx * 2").unwrap();
        assert_eq!(program.functions[program.start as usize].name, "<main>");
        assert_eq!(program.result_type(), TypeId::INT);
    }

    #[test]
    fn test_init_signature_is_checked() {
        let err = compile("int Init() { return 1; } void Start() { }").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidDeclaration(_)));
    }

    #[test]
    fn test_disassembly_names_functions() {
        let program = compile("void Start() { Print(\"hi\"); }").unwrap();
        let text = program.disassemble();
        assert!(text.contains("-- Start --"));
        assert!(text.contains("CallHost"));
    }
}
