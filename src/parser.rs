//! Parser for Ferrule
//!
//! Converts tokens into nodes of the shared `Ast` arena. Statements and
//! declarations are recursive descent; operators use precedence climbing.
//! Whether a statement starts with a declaration is decided by speculatively
//! reading `Type name` and looking at the token after it.

use crate::ast::{Ast, BinaryOp, LogicalOp, NodeId, NodeKind, Prim, Qualifier, UnaryOp};
use crate::error::{ErrorKind, FerruleError, Result};
use crate::lexer::Lexer;
use crate::token::{Span, StrPart, Token, TokenKind};

/// Binding power of infix operators, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // = += -= *= /= %=
    Or,         // ||
    And,        // &&
    Equality,   // == !=
    Comparison, // < <= > >=
    Term,       // + -
    Factor,     // * / %
    Unary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor | Precedence::Unary => Precedence::Unary,
        }
    }
}

fn infix_precedence(kind: &TokenKind) -> Precedence {
    match kind {
        TokenKind::Equal
        | TokenKind::PlusEqual
        | TokenKind::MinusEqual
        | TokenKind::StarEqual
        | TokenKind::SlashEqual
        | TokenKind::PercentEqual => Precedence::Assignment,
        TokenKind::OrOr => Precedence::Or,
        TokenKind::AndAnd => Precedence::And,
        TokenKind::EqualEqual | TokenKind::BangEqual => Precedence::Equality,
        TokenKind::Less | TokenKind::LessEqual | TokenKind::Greater | TokenKind::GreaterEqual => {
            Precedence::Comparison
        }
        TokenKind::Plus | TokenKind::Minus => Precedence::Term,
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => Precedence::Factor,
        _ => Precedence::None,
    }
}

fn binary_op(kind: &TokenKind) -> Option<BinaryOp> {
    let op = match kind {
        TokenKind::Plus | TokenKind::PlusEqual => BinaryOp::Add,
        TokenKind::Minus | TokenKind::MinusEqual => BinaryOp::Sub,
        TokenKind::Star | TokenKind::StarEqual => BinaryOp::Mul,
        TokenKind::Slash | TokenKind::SlashEqual => BinaryOp::Div,
        TokenKind::Percent | TokenKind::PercentEqual => BinaryOp::Mod,
        TokenKind::EqualEqual => BinaryOp::Eq,
        TokenKind::BangEqual => BinaryOp::Ne,
        TokenKind::Less => BinaryOp::Lt,
        TokenKind::LessEqual => BinaryOp::Le,
        TokenKind::Greater => BinaryOp::Gt,
        TokenKind::GreaterEqual => BinaryOp::Ge,
        _ => return None,
    };
    Some(op)
}

/// Parse a whole source file into `ast`, returning its `Module` node
pub fn parse_source(source: &str, module: u32, ast: &mut Ast) -> Result<NodeId> {
    let tokens = Lexer::new(source, module).tokenize()?;
    Parser::new(tokens, ast, module).parse_module()
}

/// The parser state
pub struct Parser<'a> {
    tokens: Vec<Token>,
    current: usize,
    ast: &'a mut Ast,
    module: u32,
}

impl<'a> Parser<'a> {
    /// Create a new parser that adds nodes to `ast`
    pub fn new(tokens: Vec<Token>, ast: &'a mut Ast, module: u32) -> Self {
        Self { tokens, current: 0, ast, module }
    }

    /// Parse the tokens into a `Module` node
    pub fn parse_module(&mut self) -> Result<NodeId> {
        let span = self.peek().span;
        let mut items = Vec::new();

        while !self.is_at_end() {
            items.push(self.top_level()?);
        }

        Ok(self.ast.push(NodeKind::Module { items }, span))
    }

    // ==================== Declarations ====================

    fn top_level(&mut self) -> Result<NodeId> {
        match self.peek().kind {
            TokenKind::Import => self.import_declaration(),
            TokenKind::Extern => self.extern_declaration(),
            TokenKind::Struct => self.struct_declaration(),
            TokenKind::IntTypeDecl => self.nominal_declaration(false),
            TokenKind::HandleTypeDecl => self.nominal_declaration(true),
            TokenKind::Option => {
                self.advance();
                self.qualified_variable(Qualifier::Option)
            }
            TokenKind::Persist => {
                self.advance();
                self.qualified_variable(Qualifier::Persist)
            }
            _ => {
                if self.starts_type() {
                    let mark = self.mark();
                    if let Ok(ret) = self.parse_type() {
                        if matches!(self.peek().kind, TokenKind::Ident(_))
                            && self.peek_next().map(|t| &t.kind) == Some(&TokenKind::LeftParen)
                        {
                            return self.function_declaration(ret, false);
                        }
                    }
                    self.reset(mark);
                    if let Some(first) = self.try_binder(&[TokenKind::Equal, TokenKind::Semicolon, TokenKind::Comma]) {
                        return self.variable_declaration(first, Qualifier::None);
                    }
                }
                self.trailing_expression()
            }
        }
    }

    /// A bare expression with no `;` that ends the file
    fn trailing_expression(&mut self) -> Result<NodeId> {
        let span = self.peek().span;
        let expr = self.expression()?;
        if !self.is_at_end() {
            return Err(self.error_here(ErrorKind::ExpectedToken(
                "expected a declaration".to_string(),
                self.peek().kind.to_string(),
            )));
        }
        Ok(self.ast.push(NodeKind::Trailing { expr }, span))
    }

    /// `import "path" as name;` or `import inline "path";`
    fn import_declaration(&mut self) -> Result<NodeId> {
        let span = self.advance().span; // consume 'import'
        let inline = self.match_token(&TokenKind::Inline);

        let path = match &self.peek().kind {
            TokenKind::Str(parts) => match parts.as_slice() {
                [StrPart::Text(text)] => text.clone(),
                _ => {
                    return Err(self.error_here(ErrorKind::ExpectedToken(
                        "expected a plain module path".to_string(),
                        "interpolated string".to_string(),
                    )))
                }
            },
            other => {
                return Err(self.error_here(ErrorKind::ExpectedToken(
                    "expected module path string".to_string(),
                    other.to_string(),
                )))
            }
        };
        self.advance();

        let alias = if inline {
            None
        } else {
            self.expect(&TokenKind::As, "expected 'as' after module path")?;
            Some(self.expect_ident("expected namespace name")?)
        };
        self.expect(&TokenKind::Semicolon, "expected ';' after import")?;

        Ok(self.ast.push(NodeKind::Import { path, alias, inline }, span))
    }

    /// `extern R Name(params);`
    fn extern_declaration(&mut self) -> Result<NodeId> {
        self.advance(); // consume 'extern'
        let ret = self.parse_type()?;
        self.function_declaration(ret, true)
    }

    fn function_declaration(&mut self, ret: NodeId, is_extern: bool) -> Result<NodeId> {
        let span = self.peek().span;
        let name = self.expect_ident("expected function name")?;

        self.expect(&TokenKind::LeftParen, "expected '(' after function name")?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                params.push(self.binder("expected parameter name")?);
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RightParen, "expected ')' after parameters")?;

        let body = if is_extern {
            self.expect(&TokenKind::Semicolon, "expected ';' after extern prototype")?;
            None
        } else {
            Some(self.block()?)
        };

        Ok(self.ast.push(NodeKind::Function { name, ret, params, body }, span))
    }

    /// `struct Name { T field; ... }`
    fn struct_declaration(&mut self) -> Result<NodeId> {
        self.advance(); // consume 'struct'
        let span = self.peek().span;
        let name = self.expect_ident("expected struct name")?;

        self.expect(&TokenKind::LeftBrace, "expected '{' before struct body")?;
        let mut fields = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.is_at_end() {
            fields.push(self.binder("expected field name")?);
            self.expect(&TokenKind::Semicolon, "expected ';' after field")?;
        }
        self.expect(&TokenKind::RightBrace, "expected '}' after struct body")?;

        Ok(self.ast.push(NodeKind::Struct { name, fields }, span))
    }

    /// `inttype Name;`, `handletype Name : Parent;`
    fn nominal_declaration(&mut self, handle: bool) -> Result<NodeId> {
        self.advance(); // consume keyword
        let span = self.peek().span;
        let name = self.expect_ident("expected type name")?;

        let parent = if self.match_token(&TokenKind::Colon) {
            Some(self.named_type()?)
        } else {
            None
        };
        self.expect(&TokenKind::Semicolon, "expected ';' after type declaration")?;

        Ok(self.ast.push(NodeKind::Nominal { name, handle, parent }, span))
    }

    fn qualified_variable(&mut self, qualifier: Qualifier) -> Result<NodeId> {
        let first = self.binder("expected variable name")?;
        self.variable_declaration(first, qualifier)
    }

    /// The rest of a variable declaration after its first binder:
    /// more comma-separated binders, an optional initializer and `;`
    fn variable_declaration(&mut self, first: NodeId, qualifier: Qualifier) -> Result<NodeId> {
        let span = self.ast.span(first);
        let mut binders = vec![first];

        while self.match_token(&TokenKind::Comma) {
            let bare_name = matches!(self.peek().kind, TokenKind::Ident(_))
                && matches!(
                    self.peek_next().map(|t| &t.kind),
                    Some(TokenKind::Comma | TokenKind::Equal | TokenKind::Semicolon)
                );
            let binder = if bare_name {
                let name_span = self.peek().span;
                let name = self.expect_ident("expected variable name")?;
                let previous = match self.ast.kind(binders[binders.len() - 1]) {
                    NodeKind::Binder { ty, .. } => *ty,
                    other => return Err(FerruleError::defect(format!("binder expected, found {}", other.label()))),
                };
                let ty = self.clone_type(previous)?;
                self.ast.push(NodeKind::Binder { name, ty }, name_span)
            } else {
                self.binder("expected variable name")?
            };
            binders.push(binder);
        }

        let init = if self.match_token(&TokenKind::Equal) {
            Some(self.expression()?)
        } else {
            None
        };
        self.expect(&TokenKind::Semicolon, "expected ';' after variable declaration")?;

        Ok(self.ast.push(NodeKind::VarDecl { binders, init, qualifier }, span))
    }

    /// `Type name`
    fn binder(&mut self, message: &str) -> Result<NodeId> {
        let ty = self.parse_type()?;
        let span = self.peek().span;
        let name = self.expect_ident(message)?;
        Ok(self.ast.push(NodeKind::Binder { name, ty }, span))
    }

    /// Speculatively read `Type name` followed by one of `followers`. On
    /// success the cursor sits on the follower; otherwise the cursor and the
    /// arena are rolled back and `None` is returned.
    fn try_binder(&mut self, followers: &[TokenKind]) -> Option<NodeId> {
        if !self.starts_type() {
            return None;
        }
        let mark = self.mark();
        if let Ok(ty) = self.parse_type() {
            if let TokenKind::Ident(name) = &self.peek().kind {
                let name = name.clone();
                let span = self.peek().span;
                if let Some(next) = self.peek_next() {
                    if followers.contains(&next.kind) {
                        self.advance();
                        return Some(self.ast.push(NodeKind::Binder { name, ty }, span));
                    }
                }
            }
        }
        self.reset(mark);
        None
    }

    // ==================== Types ====================

    fn starts_type(&self) -> bool {
        matches!(
            self.peek().kind,
            TokenKind::IntType
                | TokenKind::FloatType
                | TokenKind::BoolType
                | TokenKind::StringType
                | TokenKind::Void
                | TokenKind::Any
                | TokenKind::List
                | TokenKind::Tuple
                | TokenKind::Error
                | TokenKind::Fn
                | TokenKind::Ident(_)
        )
    }

    fn parse_type(&mut self) -> Result<NodeId> {
        let token = self.peek().clone();
        let prim = match token.kind {
            TokenKind::IntType => Some(Prim::Int),
            TokenKind::FloatType => Some(Prim::Float),
            TokenKind::BoolType => Some(Prim::Bool),
            TokenKind::StringType => Some(Prim::Str),
            TokenKind::Void => Some(Prim::Void),
            TokenKind::Any => Some(Prim::Any),
            _ => None,
        };
        if let Some(prim) = prim {
            self.advance();
            return Ok(self.ast.push(NodeKind::PrimType(prim), token.span));
        }

        match token.kind {
            TokenKind::List => {
                self.advance();
                self.expect(&TokenKind::Less, "expected '<' after 'list'")?;
                let inner = self.parse_type()?;
                self.expect(&TokenKind::Greater, "expected '>' after list element type")?;
                Ok(self.ast.push(NodeKind::ListType(inner), token.span))
            }
            TokenKind::Error => {
                self.advance();
                self.expect(&TokenKind::Less, "expected '<' after 'error'")?;
                let inner = self.parse_type()?;
                self.expect(&TokenKind::Greater, "expected '>' after error payload type")?;
                Ok(self.ast.push(NodeKind::ErrorType(inner), token.span))
            }
            TokenKind::Tuple => {
                self.advance();
                self.expect(&TokenKind::Less, "expected '<' after 'tuple'")?;
                let mut items = vec![self.parse_type()?];
                while self.match_token(&TokenKind::Comma) {
                    items.push(self.parse_type()?);
                }
                self.expect(&TokenKind::Greater, "expected '>' after tuple types")?;
                Ok(self.ast.push(NodeKind::TupleType(items), token.span))
            }
            TokenKind::Fn => {
                self.advance();
                self.expect(&TokenKind::Less, "expected '<' after 'fn'")?;
                let ret = self.parse_type()?;
                self.expect(&TokenKind::LeftParen, "expected '(' after return type")?;
                let mut params = Vec::new();
                if !self.check(&TokenKind::RightParen) {
                    loop {
                        params.push(self.parse_type()?);
                        if !self.match_token(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RightParen, "expected ')' after parameter types")?;
                self.expect(&TokenKind::Greater, "expected '>' after function type")?;
                Ok(self.ast.push(NodeKind::FnType { ret, params }, token.span))
            }
            TokenKind::Ident(_) => self.named_type(),
            other => Err(FerruleError::new(ErrorKind::ExpectedType(other.to_string()), Some(token.span))),
        }
    }

    /// `Name` or `namespace.Name`
    fn named_type(&mut self) -> Result<NodeId> {
        let span = self.peek().span;
        let mut path = vec![self.expect_ident("expected type name")?];
        while self.check(&TokenKind::Dot) && matches!(self.peek_next().map(|t| &t.kind), Some(TokenKind::Ident(_))) {
            self.advance();
            path.push(self.expect_ident("expected type name")?);
        }
        Ok(self.ast.push(NodeKind::NamedType { path }, span))
    }

    /// Deep copy of a type expression, for `T a, b;` where `b` repeats `T`
    fn clone_type(&mut self, ty: NodeId) -> Result<NodeId> {
        let span = self.ast.span(ty);
        let kind = match self.ast.kind(ty).clone() {
            NodeKind::PrimType(prim) => NodeKind::PrimType(prim),
            NodeKind::NamedType { path } => NodeKind::NamedType { path },
            NodeKind::ListType(inner) => NodeKind::ListType(self.clone_type(inner)?),
            NodeKind::ErrorType(inner) => NodeKind::ErrorType(self.clone_type(inner)?),
            NodeKind::TupleType(items) => {
                let items = items.into_iter().map(|item| self.clone_type(item)).collect::<Result<Vec<_>>>()?;
                NodeKind::TupleType(items)
            }
            NodeKind::FnType { ret, params } => {
                let ret = self.clone_type(ret)?;
                let params = params.into_iter().map(|p| self.clone_type(p)).collect::<Result<Vec<_>>>()?;
                NodeKind::FnType { ret, params }
            }
            other => return Err(FerruleError::defect(format!("cannot copy {} as a type", other.label()))),
        };
        Ok(self.ast.push(kind, span))
    }

    // ==================== Statements ====================

    fn block(&mut self) -> Result<NodeId> {
        let span = self.peek().span;
        self.expect(&TokenKind::LeftBrace, "expected '{'")?;

        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.is_at_end() {
            stmts.push(self.statement()?);
        }
        self.expect(&TokenKind::RightBrace, "expected '}' after block")?;

        Ok(self.ast.push(NodeKind::Block { stmts }, span))
    }

    fn statement(&mut self) -> Result<NodeId> {
        match self.peek().kind {
            TokenKind::LeftBrace => self.block(),
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Return => self.return_statement(),
            TokenKind::Break => {
                let span = self.advance().span;
                self.expect(&TokenKind::Semicolon, "expected ';' after 'break'")?;
                Ok(self.ast.push(NodeKind::Break, span))
            }
            TokenKind::Continue => {
                let span = self.advance().span;
                self.expect(&TokenKind::Semicolon, "expected ';' after 'continue'")?;
                Ok(self.ast.push(NodeKind::Continue, span))
            }
            TokenKind::Assert => {
                let span = self.advance().span;
                let expr = self.expression()?;
                self.expect(&TokenKind::Semicolon, "expected ';' after assertion")?;
                Ok(self.ast.push(NodeKind::Assert { expr }, span))
            }
            _ => {
                if let Some(first) = self.try_binder(&[TokenKind::Equal, TokenKind::Semicolon, TokenKind::Comma]) {
                    return self.variable_declaration(first, Qualifier::None);
                }
                self.expression_statement()
            }
        }
    }

    fn expression_statement(&mut self) -> Result<NodeId> {
        let span = self.peek().span;
        let expr = self.expression()?;
        self.expect(&TokenKind::Semicolon, "expected ';' after expression")?;
        Ok(self.ast.push(NodeKind::ExprStmt { expr }, span))
    }

    fn if_statement(&mut self) -> Result<NodeId> {
        let span = self.advance().span; // consume 'if'

        if let Some(binder) = self.try_binder(&[TokenKind::In]) {
            self.advance(); // consume 'in'
            let expr = self.expression()?;
            let then = self.block()?;
            let els = self.else_branch()?;
            return Ok(self.ast.push(NodeKind::IfIn { binder, expr, then, els }, span));
        }

        let cond = self.expression()?;
        let then = self.block()?;
        let els = self.else_branch()?;
        Ok(self.ast.push(NodeKind::If { cond, then, els }, span))
    }

    fn else_branch(&mut self) -> Result<Option<NodeId>> {
        if !self.match_token(&TokenKind::Else) {
            return Ok(None);
        }
        if self.check(&TokenKind::If) {
            Ok(Some(self.if_statement()?))
        } else {
            Ok(Some(self.block()?))
        }
    }

    fn while_statement(&mut self) -> Result<NodeId> {
        let span = self.advance().span; // consume 'while'
        let cond = self.expression()?;
        let body = self.block()?;
        Ok(self.ast.push(NodeKind::While { cond, body }, span))
    }

    /// `for T v in xs { }` or `for init; cond; step { }`
    fn for_statement(&mut self) -> Result<NodeId> {
        let span = self.advance().span; // consume 'for'

        if let Some(binder) = self.try_binder(&[TokenKind::In]) {
            self.advance(); // consume 'in'
            let iterable = self.expression()?;
            let body = self.block()?;
            return Ok(self.ast.push(NodeKind::ForIn { binder, iterable, body }, span));
        }

        let init = if self.match_token(&TokenKind::Semicolon) {
            None
        } else if let Some(first) = self.try_binder(&[TokenKind::Equal, TokenKind::Semicolon, TokenKind::Comma]) {
            Some(self.variable_declaration(first, Qualifier::None)?)
        } else {
            Some(self.expression_statement()?)
        };

        let cond = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(&TokenKind::Semicolon, "expected ';' after loop condition")?;

        let step = if self.check(&TokenKind::LeftBrace) {
            None
        } else {
            let step_span = self.peek().span;
            let expr = self.expression()?;
            Some(self.ast.push(NodeKind::ExprStmt { expr }, step_span))
        };

        let body = self.block()?;
        Ok(self.ast.push(NodeKind::For { init, cond, step, body }, span))
    }

    /// `return;`, `return e;` or `return a, b;`
    fn return_statement(&mut self) -> Result<NodeId> {
        let span = self.advance().span; // consume 'return'

        let value = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            let first = self.expression()?;
            if self.check(&TokenKind::Comma) {
                let mut items = vec![first];
                while self.match_token(&TokenKind::Comma) {
                    items.push(self.expression()?);
                }
                let tuple_span = self.ast.span(first);
                Some(self.ast.push(NodeKind::TupleLit { items }, tuple_span))
            } else {
                Some(first)
            }
        };
        self.expect(&TokenKind::Semicolon, "expected ';' after return")?;

        Ok(self.ast.push(NodeKind::Return { value }, span))
    }

    // ==================== Expressions ====================

    pub fn expression(&mut self) -> Result<NodeId> {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, min: Precedence) -> Result<NodeId> {
        let mut lhs = self.unary()?;

        loop {
            let prec = infix_precedence(&self.peek().kind);
            if prec == Precedence::None || prec < min {
                break;
            }
            let token = self.advance();

            lhs = match prec {
                Precedence::Assignment => {
                    if !matches!(
                        self.ast.kind(lhs),
                        NodeKind::Ident { .. } | NodeKind::Member { .. } | NodeKind::Index { .. }
                    ) {
                        return Err(FerruleError::new(ErrorKind::InvalidAssignmentTarget, Some(token.span)));
                    }
                    // Right associative
                    let value = self.parse_precedence(Precedence::Assignment)?;
                    let op = binary_op(&token.kind);
                    self.ast.push(NodeKind::Assign { op, target: lhs, value }, token.span)
                }
                Precedence::Or | Precedence::And => {
                    let rhs = self.parse_precedence(prec.next())?;
                    let op = if prec == Precedence::Or { LogicalOp::Or } else { LogicalOp::And };
                    self.ast.push(NodeKind::Logical { op, lhs, rhs }, token.span)
                }
                _ => {
                    let rhs = self.parse_precedence(prec.next())?;
                    let op = binary_op(&token.kind)
                        .ok_or_else(|| FerruleError::defect(format!("'{}' is not a binary operator", token.kind)))?;
                    self.ast.push(NodeKind::Binary { op, lhs, rhs }, token.span)
                }
            };
        }

        Ok(lhs)
    }

    fn unary(&mut self) -> Result<NodeId> {
        let span = self.peek().span;
        match self.peek().kind {
            TokenKind::Minus => {
                self.advance();
                let operand = self.unary()?;
                Ok(self.ast.push(NodeKind::Unary { op: UnaryOp::Neg, operand }, span))
            }
            TokenKind::Bang => {
                self.advance();
                let operand = self.unary()?;
                Ok(self.ast.push(NodeKind::Unary { op: UnaryOp::Not, operand }, span))
            }
            TokenKind::Await => {
                self.advance();
                let ids = self.unary()?;
                Ok(self.ast.push(NodeKind::Await { ids }, span))
            }
            _ => self.postfix(),
        }
    }

    /// Calls, member access, indexing and `as` casts
    fn postfix(&mut self) -> Result<NodeId> {
        let mut expr = self.primary()?;

        loop {
            let span = self.peek().span;
            if self.match_token(&TokenKind::LeftParen) {
                let args = self.arguments()?;
                expr = self.ast.push(NodeKind::Call { callee: expr, args }, span);
            } else if self.match_token(&TokenKind::Dot) {
                let name = self.expect_ident("expected member name after '.'")?;
                expr = self.ast.push(NodeKind::Member { object: expr, name }, span);
            } else if self.match_token(&TokenKind::LeftBracket) {
                let index = self.expression()?;
                self.expect(&TokenKind::RightBracket, "expected ']' after index")?;
                expr = self.ast.push(NodeKind::Index { object: expr, index }, span);
            } else if self.match_token(&TokenKind::As) {
                let ty = self.parse_type()?;
                expr = self.ast.push(NodeKind::Cast { expr, ty }, span);
            } else {
                break;
            }
        }

        Ok(expr)
    }

    /// Comma-separated expressions up to and including `)`
    fn arguments(&mut self) -> Result<Vec<NodeId>> {
        let mut args = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                args.push(self.expression()?);
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RightParen, "expected ')' after arguments")?;
        Ok(args)
    }

    fn primary(&mut self) -> Result<NodeId> {
        let token = self.peek().clone();
        let span = token.span;

        match token.kind {
            TokenKind::Int(n) => {
                self.advance();
                Ok(self.ast.push(NodeKind::IntLit(n), span))
            }
            TokenKind::Float(n) => {
                self.advance();
                Ok(self.ast.push(NodeKind::FloatLit(n), span))
            }
            TokenKind::True | TokenKind::False => {
                self.advance();
                Ok(self.ast.push(NodeKind::BoolLit(token.kind == TokenKind::True), span))
            }
            TokenKind::Null => {
                self.advance();
                Ok(self.ast.push(NodeKind::Null, span))
            }
            TokenKind::Str(parts) => {
                self.advance();
                self.string_literal(parts, span)
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(self.ast.push(NodeKind::Ident { name }, span))
            }
            TokenKind::LeftParen => {
                self.advance();
                let expr = self.expression()?;
                self.expect(&TokenKind::RightParen, "expected ')' after expression")?;
                Ok(expr)
            }
            TokenKind::LeftBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.check(&TokenKind::RightBracket) {
                    loop {
                        items.push(self.expression()?);
                        if !self.match_token(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RightBracket, "expected ']' after list items")?;
                Ok(self.ast.push(NodeKind::ListLit { items }, span))
            }
            TokenKind::New => {
                self.advance();
                let ty = self.parse_type()?;
                Ok(self.ast.push(NodeKind::New { ty }, span))
            }
            TokenKind::Error => {
                // error<T>(message)
                self.advance();
                self.expect(&TokenKind::Less, "expected '<' after 'error'")?;
                let ty = self.parse_type()?;
                self.expect(&TokenKind::Greater, "expected '>' after error payload type")?;
                self.expect(&TokenKind::LeftParen, "expected '(' before error message")?;
                let message = self.expression()?;
                self.expect(&TokenKind::RightParen, "expected ')' after error message")?;
                Ok(self.ast.push(NodeKind::Fail { ty, message }, span))
            }
            TokenKind::Async => {
                self.advance();
                let call = self.postfix()?;
                if !matches!(self.ast.kind(call), NodeKind::Call { .. }) {
                    return Err(FerruleError::new(
                        ErrorKind::ExpectedToken("expected a call after 'async'".to_string(), self.ast.kind(call).label().to_string()),
                        Some(span),
                    ));
                }
                Ok(self.ast.push(NodeKind::Async { call }, span))
            }
            TokenKind::Bind => {
                self.advance();
                self.expect(&TokenKind::LeftParen, "expected '(' after 'bind'")?;
                let func = self.expression()?;
                self.expect(&TokenKind::Comma, "expected ',' after bound function")?;
                let arg = self.expression()?;
                self.expect(&TokenKind::RightParen, "expected ')' after bound argument")?;
                Ok(self.ast.push(NodeKind::Bind { func, arg }, span))
            }
            TokenKind::Discard | TokenKind::Asserting => {
                self.advance();
                self.expect(&TokenKind::LeftParen, "expected '(' before function")?;
                let func = self.expression()?;
                self.expect(&TokenKind::RightParen, "expected ')' after function")?;
                let kind = if token.kind == TokenKind::Discard {
                    NodeKind::Discard { func }
                } else {
                    NodeKind::Asserting { func }
                };
                Ok(self.ast.push(kind, span))
            }
            TokenKind::Invalid(kind) => Err(FerruleError::new(kind, Some(span))),
            other => Err(FerruleError::new(ErrorKind::ExpectedExpression(other.to_string()), Some(span))),
        }
    }

    /// Plain strings become `StrLit`; interpolated ones parse each embedded
    /// expression with a sub-lexer positioned where the expression starts
    fn string_literal(&mut self, parts: Vec<StrPart>, span: Span) -> Result<NodeId> {
        if let [StrPart::Text(text)] = parts.as_slice() {
            return Ok(self.ast.push(NodeKind::StrLit(text.clone()), span));
        }

        let mut nodes = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                StrPart::Text(text) => nodes.push(self.ast.push(NodeKind::StrLit(text), span)),
                StrPart::Interp(source, line, column) => {
                    let tokens = Lexer::starting_at(&source, self.module, line, column).tokenize()?;
                    let mut sub = Parser::new(tokens, &mut *self.ast, self.module);
                    let expr = sub.expression()?;
                    if !sub.is_at_end() {
                        return Err(sub.error_here(ErrorKind::UnexpectedToken(sub.peek().kind.to_string())));
                    }
                    nodes.push(expr);
                }
            }
        }
        Ok(self.ast.push(NodeKind::Interp { parts: nodes }, span))
    }

    // ==================== Helpers ====================

    fn mark(&self) -> (usize, usize) {
        (self.current, self.ast.len())
    }

    fn reset(&mut self, (current, nodes): (usize, usize)) {
        self.current = current;
        self.ast.truncate(nodes);
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    fn peek_next(&self) -> Option<&Token> {
        self.tokens.get(self.current + 1)
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if !self.is_at_end() {
            self.current += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(kind)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error_here(&self, kind: ErrorKind) -> FerruleError {
        FerruleError::new(kind, Some(self.peek().span))
    }

    fn expect(&mut self, kind: &TokenKind, message: &str) -> Result<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error_here(ErrorKind::ExpectedToken(message.to_string(), self.peek().kind.to_string())))
        }
    }

    fn expect_ident(&mut self, message: &str) -> Result<String> {
        if let TokenKind::Ident(name) = &self.peek().kind {
            let name = name.clone();
            self.advance();
            Ok(name)
        } else {
            Err(self.error_here(ErrorKind::ExpectedToken(message.to_string(), self.peek().kind.to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> (Ast, Vec<NodeId>) {
        let mut ast = Ast::new();
        let root = parse_source(source, 0, &mut ast).unwrap();
        let items = match ast.kind(root) {
            NodeKind::Module { items } => items.clone(),
            _ => panic!("expected module"),
        };
        (ast, items)
    }

    fn parse_err(source: &str) -> ErrorKind {
        let mut ast = Ast::new();
        parse_source(source, 0, &mut ast).unwrap_err().kind
    }

    #[test]
    fn test_function() {
        let (ast, items) = parse("int Add(int a, int b) { return a + b; }");
        assert_eq!(items.len(), 1);
        match ast.kind(items[0]) {
            NodeKind::Function { name, params, body, .. } => {
                assert_eq!(name, "Add");
                assert_eq!(params.len(), 2);
                assert_eq!(ast.decl_name(params[1]), "b");
                assert!(body.is_some());
            }
            _ => panic!("expected function"),
        }
    }

    #[test]
    fn test_extern_and_struct() {
        let (ast, items) = parse("extern void Print(string s);\nstruct P { int x; string name; }");
        assert!(matches!(ast.kind(items[0]), NodeKind::Function { body: None, .. }));
        match ast.kind(items[1]) {
            NodeKind::Struct { name, fields } => {
                assert_eq!(name, "P");
                assert_eq!(fields.len(), 2);
            }
            _ => panic!("expected struct"),
        }
    }

    #[test]
    fn test_nominal_with_parent() {
        let (ast, items) = parse("inttype Meters; inttype Km : Meters; handletype File;");
        assert!(matches!(ast.kind(items[0]), NodeKind::Nominal { parent: None, handle: false, .. }));
        assert!(matches!(ast.kind(items[1]), NodeKind::Nominal { parent: Some(_), .. }));
        assert!(matches!(ast.kind(items[2]), NodeKind::Nominal { handle: true, .. }));
    }

    #[test]
    fn test_grouped_declaration_repeats_type() {
        let (ast, items) = parse("void F() { int a, b = G(); }");
        let body = match ast.kind(items[0]) {
            NodeKind::Function { body: Some(body), .. } => *body,
            _ => panic!("expected function"),
        };
        let decl = match ast.kind(body) {
            NodeKind::Block { stmts } => stmts[0],
            _ => panic!("expected block"),
        };
        match ast.kind(decl) {
            NodeKind::VarDecl { binders, init, .. } => {
                assert_eq!(binders.len(), 2);
                assert!(init.is_some());
                match ast.kind(binders[1]) {
                    NodeKind::Binder { ty, .. } => {
                        assert!(matches!(ast.kind(*ty), NodeKind::PrimType(Prim::Int)))
                    }
                    _ => panic!("expected binder"),
                }
            }
            _ => panic!("expected declaration"),
        }
    }

    #[test]
    fn test_assignment_is_not_a_declaration() {
        let (ast, items) = parse("void F() { x = 1; p.x += 2; }");
        let body = match ast.kind(items[0]) {
            NodeKind::Function { body: Some(body), .. } => *body,
            _ => panic!("expected function"),
        };
        let stmts = match ast.kind(body) {
            NodeKind::Block { stmts } => stmts.clone(),
            _ => panic!("expected block"),
        };
        for stmt in stmts {
            assert!(matches!(ast.kind(stmt), NodeKind::ExprStmt { .. }));
        }
    }

    #[test]
    fn test_precedence() {
        let (ast, items) = parse("2 + 3 * 4");
        let expr = match ast.kind(items[0]) {
            NodeKind::Trailing { expr } => *expr,
            _ => panic!("expected trailing expression"),
        };
        match ast.kind(expr) {
            NodeKind::Binary { op: BinaryOp::Add, rhs, .. } => {
                assert!(matches!(ast.kind(*rhs), NodeKind::Binary { op: BinaryOp::Mul, .. }))
            }
            _ => panic!("expected addition at the root"),
        }
    }

    #[test]
    fn test_if_in_and_for_in() {
        let (ast, items) = parse(
            "void F() { if int v in Parse() { } else { } for string c in \"ab\" { } for int i = 0; i < 3; i += 1 { } }",
        );
        let stmts = match ast.kind(items[0]) {
            NodeKind::Function { body: Some(body), .. } => match ast.kind(*body) {
                NodeKind::Block { stmts } => stmts.clone(),
                _ => panic!("expected block"),
            },
            _ => panic!("expected function"),
        };
        assert!(matches!(ast.kind(stmts[0]), NodeKind::IfIn { els: Some(_), .. }));
        assert!(matches!(ast.kind(stmts[1]), NodeKind::ForIn { .. }));
        assert!(matches!(ast.kind(stmts[2]), NodeKind::For { init: Some(_), cond: Some(_), step: Some(_), .. }));
    }

    #[test]
    fn test_imports_and_qualifiers() {
        let (ast, items) = parse("import \"lib\" as lib; import inline \"util.fer\"; option int port = 80; persist int runs;");
        assert!(matches!(ast.kind(items[0]), NodeKind::Import { inline: false, alias: Some(_), .. }));
        assert!(matches!(ast.kind(items[1]), NodeKind::Import { inline: true, alias: None, .. }));
        assert!(matches!(ast.kind(items[2]), NodeKind::VarDecl { qualifier: Qualifier::Option, .. }));
        assert!(matches!(ast.kind(items[3]), NodeKind::VarDecl { qualifier: Qualifier::Persist, .. }));
    }

    #[test]
    fn test_interpolation_parses_embedded_expression() {
        let (ast, items) = parse("\"a $x + 1$ b\"");
        let expr = match ast.kind(items[0]) {
            NodeKind::Trailing { expr } => *expr,
            _ => panic!("expected trailing expression"),
        };
        match ast.kind(expr) {
            NodeKind::Interp { parts } => {
                assert_eq!(parts.len(), 3);
                assert!(matches!(ast.kind(parts[1]), NodeKind::Binary { op: BinaryOp::Add, .. }));
                assert_eq!(ast.span(parts[1]).column, 7);
            }
            _ => panic!("expected interpolated string"),
        }
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(parse_err("int F( { }"), ErrorKind::ExpectedType(_)));
        assert!(matches!(parse_err("void F() { 1 = 2; }"), ErrorKind::InvalidAssignmentTarget));
        assert!(matches!(parse_err("void F() { int x = 1 }"), ErrorKind::ExpectedToken(..)));
        assert!(matches!(parse_err("void F() { x = 1.2.3; }"), ErrorKind::InvalidNumber(_)));
    }
}
