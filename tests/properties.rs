//! Property-based tests for literals and well-typed arithmetic.
//!
//! - literals returned from `Start` come back unchanged
//! - random integer expressions evaluate like wrapping `i64` arithmetic
//! - random well-typed programs over lists, structs, loops and calls fail
//!   only with runtime errors, never an internal defect

use ferrule::value::Value;
use ferrule::{run, Category, ErrorKind};
use proptest::prelude::*;

// =============================================================================
// Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Expr {
    Lit(i64),
    Bin(char, Box<Expr>, Box<Expr>),
}

impl Expr {
    fn source(&self) -> String {
        match self {
            Expr::Lit(n) => format!("({})", n),
            Expr::Bin(op, lhs, rhs) => format!("({} {} {})", lhs.source(), op, rhs.source()),
        }
    }

    /// `None` when a division by zero happens somewhere
    fn eval(&self) -> Option<i64> {
        match self {
            Expr::Lit(n) => Some(*n),
            Expr::Bin(op, lhs, rhs) => {
                let (a, b) = (lhs.eval()?, rhs.eval()?);
                match op {
                    '+' => Some(a.wrapping_add(b)),
                    '-' => Some(a.wrapping_sub(b)),
                    '*' => Some(a.wrapping_mul(b)),
                    '/' if b == 0 => None,
                    '/' => Some(a.wrapping_div(b)),
                    '%' if b == 0 => None,
                    _ => Some(a.wrapping_rem(b)),
                }
            }
        }
    }
}

fn arb_expr() -> impl Strategy<Value = Expr> {
    let leaf = (-1000i64..1000i64).prop_map(Expr::Lit);
    leaf.prop_recursive(4, 32, 2, |inner| {
        (prop::sample::select(vec!['+', '-', '*', '/', '%']), inner.clone(), inner)
            .prop_map(|(op, lhs, rhs)| Expr::Bin(op, Box::new(lhs), Box::new(rhs)))
    })
}

/// Integer operands of generated statements
#[derive(Debug, Clone)]
enum Term {
    Lit(i64),
    Ref(&'static str),
    Bin(char, Box<Term>, Box<Term>),
}

const REFS: [&str; 4] = ["total", "p.x", "xs.length", "Twice(3)"];

impl Term {
    fn source(&self) -> String {
        match self {
            Term::Lit(n) => format!("({})", n),
            Term::Ref(name) => name.to_string(),
            Term::Bin(op, lhs, rhs) => format!("({} {} {})", lhs.source(), op, rhs.source()),
        }
    }
}

fn arb_term() -> impl Strategy<Value = Term> {
    let leaf = prop_oneof![
        (-50i64..50).prop_map(Term::Lit),
        prop::sample::select(REFS.to_vec()).prop_map(Term::Ref),
    ];
    leaf.prop_recursive(3, 16, 2, |inner| {
        (prop::sample::select(vec!['+', '-', '*', '/', '%']), inner.clone(), inner)
            .prop_map(|(op, lhs, rhs)| Term::Bin(op, Box::new(lhs), Box::new(rhs)))
    })
}

#[derive(Debug, Clone)]
enum Stmt {
    Push(Term),
    AddIndexed(Term),
    SetField(Term),
    Call(Term),
    Append(Term),
    If(Term, Vec<Stmt>, Vec<Stmt>),
    ForIn(Vec<Stmt>),
}

impl Stmt {
    /// `loops` is the number of enclosing `for-in` loops over `xs`
    fn source(&self, loops: usize, out: &mut String) {
        match self {
            // Growing the list being iterated would never terminate
            Stmt::Push(t) if loops > 0 => out.push_str(&format!("p.y = p.y + {};\n", t.source())),
            Stmt::Push(t) => out.push_str(&format!("xs.push({});\n", t.source())),
            Stmt::AddIndexed(t) => out.push_str(&format!("total += xs[{} % xs.length];\n", t.source())),
            Stmt::SetField(t) => out.push_str(&format!("p.x = {};\n", t.source())),
            Stmt::Call(t) => out.push_str(&format!("total += Twice({});\n", t.source())),
            Stmt::Append(t) => out.push_str(&format!("s = s + \"${}$\";\n", t.source())),
            Stmt::If(t, then, els) => {
                out.push_str(&format!("if {} > 0 {{\n", t.source()));
                then.iter().for_each(|stmt| stmt.source(loops, out));
                out.push_str("} else {\n");
                els.iter().for_each(|stmt| stmt.source(loops, out));
                out.push_str("}\n");
            }
            Stmt::ForIn(body) => {
                out.push_str(&format!("for int v{0} in xs {{\ntotal += v{0};\n", loops));
                body.iter().for_each(|stmt| stmt.source(loops + 1, out));
                out.push_str("}\n");
            }
        }
    }
}

fn arb_stmt() -> impl Strategy<Value = Stmt> {
    let leaf = prop_oneof![
        arb_term().prop_map(Stmt::Push),
        arb_term().prop_map(Stmt::AddIndexed),
        arb_term().prop_map(Stmt::SetField),
        arb_term().prop_map(Stmt::Call),
        arb_term().prop_map(Stmt::Append),
    ];
    leaf.prop_recursive(3, 24, 3, |inner| {
        prop_oneof![
            (arb_term(), prop::collection::vec(inner.clone(), 0..3), prop::collection::vec(inner.clone(), 0..3))
                .prop_map(|(cond, then, els)| Stmt::If(cond, then, els)),
            prop::collection::vec(inner, 1..3).prop_map(Stmt::ForIn),
        ]
    })
}

fn program_source(stmts: &[Stmt]) -> String {
    let mut body = String::new();
    stmts.iter().for_each(|stmt| stmt.source(0, &mut body));
    format!(
        "struct Point {{ int x; int y; }}\n\
         int Twice(int n) {{ return n * 2; }}\n\
         int Start() {{\n\
         int total = 0;\n\
         list<int> xs = [1, 2, 3];\n\
         Point p = new Point;\n\
         string s = \"\";\n\
         {}\
         return total + p.x + p.y + xs.length + s.length;\n\
         }}\n",
        body
    )
}

// =============================================================================
// Literal round trips
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn int_literal_round_trip(n in 0i64..i64::MAX) {
        let result = run(&format!("int Start() {{ return {}; }}", n)).unwrap();
        prop_assert_eq!(result, Value::Int(n));
    }

    #[test]
    fn float_literal_round_trip(whole in 0u32..1_000_000, frac in 0u32..1000) {
        let text = format!("{}.{:03}", whole, frac);
        let result = run(&format!("float Start() {{ return {}; }}", text)).unwrap();
        prop_assert_eq!(result, Value::Float(text.parse::<f64>().unwrap()));
    }

    #[test]
    fn string_literal_round_trip(s in "[a-zA-Z0-9 _.,]{0,24}") {
        let result = run(&format!("string Start() {{ return \"{}\"; }}", s)).unwrap();
        prop_assert_eq!(result, Value::Str(s));
    }

    #[test]
    fn bool_literal_round_trip(b in any::<bool>()) {
        let result = run(&format!("bool Start() {{ return {}; }}", b)).unwrap();
        prop_assert_eq!(result, Value::Bool(b));
    }
}

// =============================================================================
// Well-typed programs
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn arithmetic_matches_wrapping_semantics(expr in arb_expr()) {
        let source = format!("int Start() {{ return {}; }}", expr.source());
        match (run(&source), expr.eval()) {
            (Ok(value), Some(expected)) => prop_assert_eq!(value, Value::Int(expected)),
            (Err(err), None) => prop_assert_eq!(err.kind, ErrorKind::DivisionByZero),
            (Ok(value), None) => prop_assert!(false, "expected division by zero, got {:?}", value),
            (Err(err), Some(_)) => prop_assert!(false, "unexpected error {}", err),
        }
    }

    #[test]
    fn checked_programs_never_hit_defects(stmts in prop::collection::vec(arb_stmt(), 1..6)) {
        let source = program_source(&stmts);
        if let Err(err) = run(&source) {
            // Generated programs are well typed, so only runtime failures are allowed
            prop_assert_eq!(err.category(), Category::Runtime, "{}\n{}", err, source);
        }
    }
}
