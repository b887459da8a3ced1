//! Abstract Syntax Tree definitions for Ferrule
//!
//! Nodes of every loaded module live in one arena and refer to each other by
//! `NodeId`. Parent links, resolved types and attached scopes are indices
//! too, so the checker can splice implicit-cast nodes in place without
//! invalidating anything.

use crate::scope::ScopeId;
use crate::token::Span;
use crate::types::TypeId;

/// Index of a node in the `Ast` arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// A node plus the side data later passes attach to it
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub span: Span,
    pub parent: Option<NodeId>,
    /// Resolved type of an expression, or the declared type of a declaration
    pub ty: Option<TypeId>,
    /// Scope opened by this node (module root, function, block, loop)
    pub scope: Option<ScopeId>,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add, // +
    Sub, // -
    Mul, // *
    Div, // /
    Mod, // %
    Eq,  // ==
    Ne,  // !=
    Lt,  // <
    Le,  // <=
    Gt,  // >
    Ge,  // >=
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(self, BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge)
    }

    pub fn is_equality(self) -> bool {
        matches!(self, BinaryOp::Eq | BinaryOp::Ne)
    }
}

impl std::fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
        };
        write!(f, "{}", text)
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg, // -
    Not, // !
}

/// Logical operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

/// Qualifier on a global variable declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
    None,
    /// Bindable from the command line with `name=value`
    Option,
    /// Stored in the persisted-variable file
    Persist,
}

/// Primitive type keywords
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prim {
    Int,
    Float,
    Bool,
    Str,
    Void,
    Any,
}

/// Conversions the checker splices into the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Implicit {
    /// Wrap a bare value as the success payload of an error
    ToError,
    /// Box a value into `any`, tagged with its runtime type id
    Box(u32),
    /// Inttype/handletype to an inherited ancestor; no runtime effect
    Widen,
    /// Function pointer to a void-returning one that drops the result
    Discard,
    /// `null`, `0` or `[]` taking on the expected type; no runtime effect
    Retype,
}

/// Operations reached through member syntax on built-in types, or through
/// explicit conversions, after the checker has rewritten them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intrinsic {
    /// `list.length` / `string.length`
    Length,
    /// `list.push(value)`
    Push,
    /// `err.message`
    ErrorMessage,
    IntToFloat,
    FloatToInt,
    /// `any as T`, checked against a runtime type id
    Unbox(u32),
}

/// Every kind of node: declarations, statements, expressions and type expressions
#[derive(Debug, Clone)]
pub enum NodeKind {
    // ==================== Declarations ====================
    /// Root of one source file
    Module { items: Vec<NodeId> },

    /// `import "path" as name;` or `import inline "path";`
    Import { path: String, alias: Option<String>, inline: bool },

    /// `ret Name(params) { body }`, or `extern ret Name(params);` with no body
    Function {
        name: String,
        ret: NodeId,
        params: Vec<NodeId>,
        body: Option<NodeId>,
    },

    /// `struct Name { fields }`
    Struct { name: String, fields: Vec<NodeId> },

    /// `inttype Name : Parent;` or `handletype Name : Parent;`
    Nominal { name: String, handle: bool, parent: Option<NodeId> },

    /// A name and its declared type: parameters, struct fields, variables,
    /// loop and narrowing binders
    Binder { name: String, ty: NodeId },

    /// One variable declaration statement, possibly grouped or destructuring
    VarDecl {
        binders: Vec<NodeId>,
        init: Option<NodeId>,
        qualifier: Qualifier,
    },

    // ==================== Statements ====================
    Block { stmts: Vec<NodeId> },
    ExprStmt { expr: NodeId },
    If { cond: NodeId, then: NodeId, els: Option<NodeId> },
    /// `if T name in expr { } else { }`
    IfIn {
        binder: NodeId,
        expr: NodeId,
        then: NodeId,
        els: Option<NodeId>,
    },
    While { cond: NodeId, body: NodeId },
    For {
        init: Option<NodeId>,
        cond: Option<NodeId>,
        step: Option<NodeId>,
        body: NodeId,
    },
    ForIn { binder: NodeId, iterable: NodeId, body: NodeId },
    Return { value: Option<NodeId> },
    Break,
    Continue,
    Assert { expr: NodeId },
    /// Final bare expression of a script, captured as the program result
    Trailing { expr: NodeId },

    // ==================== Expressions ====================
    IntLit(i64),
    FloatLit(f64),
    BoolLit(bool),
    StrLit(String),
    Null,
    /// String with interpolated segments; parts are `StrLit` or expressions
    Interp { parts: Vec<NodeId> },
    ListLit { items: Vec<NodeId> },
    /// `return a, b;`
    TupleLit { items: Vec<NodeId> },
    Ident { name: String },
    Member { object: NodeId, name: String },
    Index { object: NodeId, index: NodeId },
    Call { callee: NodeId, args: Vec<NodeId> },
    Unary { op: UnaryOp, operand: NodeId },
    Binary { op: BinaryOp, lhs: NodeId, rhs: NodeId },
    Logical { op: LogicalOp, lhs: NodeId, rhs: NodeId },
    /// `target = value`, or `target op= value`
    Assign { op: Option<BinaryOp>, target: NodeId, value: NodeId },
    /// `new T`
    New { ty: NodeId },
    /// `error<T>(message)`
    Fail { ty: NodeId, message: NodeId },
    /// `expr as T`
    Cast { expr: NodeId, ty: NodeId },
    Implicit { conv: Implicit, expr: NodeId },
    Intrinsic { op: Intrinsic, args: Vec<NodeId> },
    Async { call: NodeId },
    Await { ids: NodeId },
    Bind { func: NodeId, arg: NodeId },
    Discard { func: NodeId },
    Asserting { func: NodeId },

    // ==================== Type expressions ====================
    PrimType(Prim),
    /// A named type, optionally namespace-qualified: `Point`, `geo.Point`
    NamedType { path: Vec<String> },
    ListType(NodeId),
    TupleType(Vec<NodeId>),
    ErrorType(NodeId),
    FnType { ret: NodeId, params: Vec<NodeId> },
}

impl NodeKind {
    /// Short description used in internal-defect messages
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Module { .. } => "module",
            NodeKind::Import { .. } => "import",
            NodeKind::Function { .. } => "function",
            NodeKind::Struct { .. } => "struct",
            NodeKind::Nominal { .. } => "nominal type",
            NodeKind::Binder { .. } => "binder",
            NodeKind::VarDecl { .. } => "variable declaration",
            NodeKind::Block { .. } => "block",
            NodeKind::ExprStmt { .. } => "expression statement",
            NodeKind::If { .. } => "if",
            NodeKind::IfIn { .. } => "if-in",
            NodeKind::While { .. } => "while",
            NodeKind::For { .. } => "for",
            NodeKind::ForIn { .. } => "for-in",
            NodeKind::Return { .. } => "return",
            NodeKind::Break => "break",
            NodeKind::Continue => "continue",
            NodeKind::Assert { .. } => "assert",
            NodeKind::Trailing { .. } => "trailing expression",
            NodeKind::PrimType(_)
            | NodeKind::NamedType { .. }
            | NodeKind::ListType(_)
            | NodeKind::TupleType(_)
            | NodeKind::ErrorType(_)
            | NodeKind::FnType { .. } => "type",
            _ => "expression",
        }
    }

    /// Direct children in source order
    pub fn children(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut kind = self.clone();
        kind.for_each_child_mut(|child| out.push(*child));
        out
    }

    /// Visit every child id in source order, allowing it to be replaced
    pub fn for_each_child_mut(&mut self, mut f: impl FnMut(&mut NodeId)) {
        fn opt(child: &mut Option<NodeId>, f: &mut dyn FnMut(&mut NodeId)) {
            if let Some(child) = child {
                f(child);
            }
        }
        match self {
            NodeKind::Module { items } => items.iter_mut().for_each(&mut f),
            NodeKind::Function { ret, params, body, .. } => {
                f(ret);
                params.iter_mut().for_each(&mut f);
                opt(body, &mut f);
            }
            NodeKind::Struct { fields, .. } => fields.iter_mut().for_each(&mut f),
            NodeKind::Nominal { parent, .. } => opt(parent, &mut f),
            NodeKind::Binder { ty, .. } => f(ty),
            NodeKind::VarDecl { binders, init, .. } => {
                binders.iter_mut().for_each(&mut f);
                opt(init, &mut f);
            }
            NodeKind::Block { stmts } => stmts.iter_mut().for_each(&mut f),
            NodeKind::ExprStmt { expr }
            | NodeKind::Assert { expr }
            | NodeKind::Trailing { expr }
            | NodeKind::Implicit { expr, .. } => f(expr),
            NodeKind::If { cond, then, els } => {
                f(cond);
                f(then);
                opt(els, &mut f);
            }
            NodeKind::IfIn { binder, expr, then, els } => {
                f(binder);
                f(expr);
                f(then);
                opt(els, &mut f);
            }
            NodeKind::While { cond, body } => {
                f(cond);
                f(body);
            }
            NodeKind::For { init, cond, step, body } => {
                opt(init, &mut f);
                opt(cond, &mut f);
                opt(step, &mut f);
                f(body);
            }
            NodeKind::ForIn { binder, iterable, body } => {
                f(binder);
                f(iterable);
                f(body);
            }
            NodeKind::Return { value } => opt(value, &mut f),
            NodeKind::Interp { parts } => parts.iter_mut().for_each(&mut f),
            NodeKind::ListLit { items } | NodeKind::TupleLit { items } => items.iter_mut().for_each(&mut f),
            NodeKind::Member { object, .. } => f(object),
            NodeKind::Index { object, index } => {
                f(object);
                f(index);
            }
            NodeKind::Call { callee, args } => {
                f(callee);
                args.iter_mut().for_each(&mut f);
            }
            NodeKind::Unary { operand, .. } => f(operand),
            NodeKind::Binary { lhs, rhs, .. } | NodeKind::Logical { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            NodeKind::Assign { target, value, .. } => {
                f(target);
                f(value);
            }
            NodeKind::New { ty } => f(ty),
            NodeKind::Fail { ty, message } => {
                f(ty);
                f(message);
            }
            NodeKind::Cast { expr, ty } => {
                f(expr);
                f(ty);
            }
            NodeKind::Intrinsic { args, .. } => args.iter_mut().for_each(&mut f),
            NodeKind::Async { call } => f(call),
            NodeKind::Await { ids } => f(ids),
            NodeKind::Bind { func, arg } => {
                f(func);
                f(arg);
            }
            NodeKind::Discard { func } | NodeKind::Asserting { func } => f(func),
            NodeKind::ListType(inner) | NodeKind::ErrorType(inner) => f(inner),
            NodeKind::TupleType(items) => items.iter_mut().for_each(&mut f),
            NodeKind::FnType { ret, params } => {
                f(ret);
                params.iter_mut().for_each(&mut f);
            }
            NodeKind::Import { .. }
            | NodeKind::Break
            | NodeKind::Continue
            | NodeKind::IntLit(_)
            | NodeKind::FloatLit(_)
            | NodeKind::BoolLit(_)
            | NodeKind::StrLit(_)
            | NodeKind::Null
            | NodeKind::Ident { .. }
            | NodeKind::PrimType(_)
            | NodeKind::NamedType { .. } => {}
        }
    }
}

/// Arena holding the nodes of every module in a program
#[derive(Debug, Default, Clone)]
pub struct Ast {
    nodes: Vec<Node>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node; children must already exist and get their parent link set
    pub fn push(&mut self, kind: NodeKind, span: Span) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        for child in kind.children() {
            self.nodes[child.0 as usize].parent = Some(id);
        }
        self.nodes.push(Node {
            kind,
            span,
            parent: None,
            ty: None,
            scope: None,
        });
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.0 as usize].kind
    }

    pub fn span(&self, id: NodeId) -> Span {
        self.nodes[id.0 as usize].span
    }

    pub fn ty(&self, id: NodeId) -> Option<TypeId> {
        self.nodes[id.0 as usize].ty
    }

    pub fn set_ty(&mut self, id: NodeId, ty: TypeId) {
        self.nodes[id.0 as usize].ty = Some(ty);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drop every node created after `len`; rolls back a speculative parse
    pub fn truncate(&mut self, len: usize) {
        self.nodes.truncate(len);
    }

    /// Wrap `child` in a new node built by `wrap`; the wrapper takes the
    /// child's place in its parent. Returns the wrapper.
    pub fn splice(&mut self, child: NodeId, wrap: impl FnOnce(NodeId) -> NodeKind) -> NodeId {
        let parent = self.node(child).parent;
        let span = self.span(child);
        let wrapper = self.push(wrap(child), span);
        self.node_mut(wrapper).parent = parent;
        if let Some(parent) = parent {
            self.node_mut(parent).kind.for_each_child_mut(|slot| {
                if *slot == child {
                    *slot = wrapper;
                }
            });
        }
        wrapper
    }

    /// Name declared by a function, struct, nominal type or binder
    pub fn decl_name(&self, id: NodeId) -> &str {
        match self.kind(id) {
            NodeKind::Function { name, .. }
            | NodeKind::Struct { name, .. }
            | NodeKind::Nominal { name, .. }
            | NodeKind::Binder { name, .. } => name,
            _ => "<anonymous>",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_links_parents() {
        let mut ast = Ast::new();
        let span = Span::default();
        let a = ast.push(NodeKind::IntLit(1), span);
        let b = ast.push(NodeKind::IntLit(2), span);
        let sum = ast.push(NodeKind::Binary { op: BinaryOp::Add, lhs: a, rhs: b }, span);
        assert_eq!(ast.node(a).parent, Some(sum));
        assert_eq!(ast.node(b).parent, Some(sum));
    }

    #[test]
    fn test_splice_keeps_parent() {
        let mut ast = Ast::new();
        let span = Span::default();
        let value = ast.push(NodeKind::IntLit(1), span);
        let stmt = ast.push(NodeKind::Return { value: Some(value) }, span);
        let wrapper = ast.splice(value, |inner| NodeKind::Implicit { conv: Implicit::ToError, expr: inner });
        assert_eq!(ast.node(wrapper).parent, Some(stmt));
        assert_eq!(ast.node(value).parent, Some(wrapper));
        assert!(matches!(ast.kind(stmt), NodeKind::Return { value: Some(v) } if *v == wrapper));
    }
}
