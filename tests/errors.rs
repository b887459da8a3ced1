use ferrule::{run, Category, ErrorKind};

fn error_of(source: &str) -> ferrule::FerruleError {
    match run(source) {
        Ok(value) => panic!("expected an error, got {:?}", value),
        Err(err) => err,
    }
}

#[test]
fn test_syntax_errors() {
    let err = error_of("int Start() { return 1 }");
    assert_eq!(err.category(), Category::Syntax);

    let err = error_of("string Start() { return \"open; }");
    assert_eq!(err.kind, ErrorKind::UnterminatedString);
}

#[test]
fn test_semantic_errors() {
    let err = error_of("int Start() { return missing; }");
    assert!(matches!(err.kind, ErrorKind::UndeclaredIdentifier(ref name) if name == "missing"));
    assert_eq!(err.category(), Category::Semantic);

    let err = error_of("int Start() { string s = 1; return 0; }");
    assert!(matches!(err.kind, ErrorKind::TypeMismatch(..)), "unexpected {:?}", err.kind);

    let err = error_of("int Start() { break; return 0; }");
    assert_eq!(err.kind, ErrorKind::BreakOutsideLoop);

    let err = error_of("int Add(int a, int b) { return a + b; }\nint Start() { return Add(1); }");
    assert_eq!(err.kind, ErrorKind::WrongArity(2, 1));

    let err = error_of("int Start() { if true { return 1; } }");
    assert!(matches!(err.kind, ErrorKind::MissingReturn(_)), "unexpected {:?}", err.kind);

    let err = error_of("int x = 1;\nint x = 2;\nvoid Start() { }");
    assert!(matches!(err.kind, ErrorKind::DuplicateDeclaration(_)), "unexpected {:?}", err.kind);
}

#[test]
fn test_errors_carry_location() {
    let err = error_of("void Start() {\n  int x = true;\n}");
    let span = err.span.expect("error should have a location");
    assert_eq!(span.line, 2);
    assert_eq!(err.path.as_deref(), Some("main.fer"));
    assert_eq!(err.source_line.as_deref(), Some("  int x = true;"));
    assert!(err.to_string().starts_with("[main.fer:2:"));
}

#[test]
fn test_null_dereference() {
    let source = r#"
        struct Box { int v; }

        int Start() {
            Box b = null;
            return b.v;
        }
    "#;
    let err = error_of(source);
    assert_eq!(err.kind, ErrorKind::NullDereference);
    assert_eq!(err.category(), Category::Runtime);
    assert_eq!(err.span.map(|s| s.line), Some(6));
}

#[test]
fn test_assert_statement() {
    let err = error_of("void Start() { int x = 3; assert x > 5; }");
    assert_eq!(err.kind, ErrorKind::AssertionFailed);
}

#[test]
fn test_bad_downcast_names_both_types() {
    let err = error_of("int Start() { any a = 2.5; return a as int; }");
    assert_eq!(err.kind, ErrorKind::BadDowncast("int".to_string(), "float".to_string()));
}

#[test]
fn test_stack_overflow_is_reported() {
    let err = error_of("int Loop(int n) { return Loop(n) + 1; }\nint Start() { return Loop(0); }");
    assert_eq!(err.kind, ErrorKind::StackOverflow);
    let trace = &err.backtrace[0];
    assert_eq!(trace.frames.first().map(|f| f.function.as_str()), Some("Loop"));
    assert_eq!(trace.frames.last().map(|f| f.function.as_str()), Some("Start"));
}

#[test]
fn test_init_with_parameters_is_rejected() {
    let err = error_of("void Init(int x) { }\nvoid Start() { }");
    assert!(matches!(err.kind, ErrorKind::InvalidDeclaration(_)), "unexpected {:?}", err.kind);
}
