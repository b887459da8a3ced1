use std::fs;

use ferrule::value::Value;
use ferrule::{run, Engine, ErrorKind};

#[test]
fn test_recursion() {
    let source = r#"
        int Fib(int n) {
            if n < 2 { return n; }
            return Fib(n - 1) + Fib(n - 2);
        }

        int Start() { return Fib(15); }
    "#;
    assert_eq!(run(source).expect("Execution failed"), Value::Int(610));
}

#[test]
fn test_tuple_destructuring() {
    let source = r#"
        tuple<int, string> Split() {
            return 3, "three";
        }

        string Start() {
            int n, string name = Split();
            return "$n$=$name$";
        }
    "#;
    assert_eq!(run(source).expect("Execution failed"), Value::Str("3=three".to_string()));
}

#[test]
fn test_grouped_declarations_take_defaults() {
    let source = r#"
        tuple<int, float, bool, string> Start() {
            int a, b;
            float f;
            bool flag;
            string s;
            b = a + 1;
            return b, f, flag, s;
        }
    "#;
    assert_eq!(
        run(source).expect("Execution failed"),
        Value::Tuple(vec![Value::Int(1), Value::Float(0.0), Value::Bool(false), Value::Str(String::new())])
    );
}

#[test]
fn test_lists_grow_with_push() {
    let source = r#"
        list<int> Start() {
            list<int> xs = new list<int>;
            for int i = 0; i < 4; i += 1 {
                xs.push(i * i);
            }
            xs[0] = 10;
            return xs;
        }
    "#;
    assert_eq!(
        run(source).expect("Execution failed"),
        Value::List(vec![Value::Int(10), Value::Int(1), Value::Int(4), Value::Int(9)])
    );
}

#[test]
fn test_inttype_casts() {
    let source = r#"
        inttype Meters;

        Meters Double(Meters m) {
            return (m as int * 2) as Meters;
        }

        Meters Start() {
            return Double(21 as Meters);
        }
    "#;
    assert_eq!(
        run(source).expect("Execution failed"),
        Value::Nominal { name: "Meters".to_string(), value: 42 }
    );
}

#[test]
fn test_float_conversions() {
    let source = r#"
        tuple<float, int> Start() {
            int n = 7;
            return n as float / 2.0, 7.9 as int;
        }
    "#;
    assert_eq!(
        run(source).expect("Execution failed"),
        Value::Tuple(vec![Value::Float(3.5), Value::Int(7)])
    );
}

#[test]
fn test_discard_wrapper() {
    let source = r#"
        int calls = 0;

        int Count(int by) {
            calls += by;
            return calls;
        }

        int Start() {
            fn<void(int)> quiet = discard(Count);
            quiet(2);
            quiet(3);
            return calls;
        }
    "#;
    assert_eq!(run(source).expect("Execution failed"), Value::Int(5));
}

#[test]
fn test_trailing_expression_is_the_result() {
    let source = "int Square(int x) { return x * x; }\nint n = 6;\nSquare(n) + 1";
    assert_eq!(run(source).expect("Execution failed"), Value::Int(37));
}

#[test]
fn test_init_runs_before_start() {
    let source = r#"
        string log = "";

        void Init() {
            log = log + "init;";
        }

        string Start() {
            return log + "start";
        }
    "#;
    assert_eq!(run(source).expect("Execution failed"), Value::Str("init;start".to_string()));
}

#[test]
fn test_namespace_import() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("geometry.fer"),
        r#"
        struct Point { int x; int y; }

        int Manhattan(Point p) {
            return p.x + p.y;
        }
        "#,
    )
    .unwrap();
    fs::write(
        dir.path().join("main.fer"),
        r#"
        import "geometry" as geo;

        int Start() {
            geo.Point p = new geo.Point;
            p.x = 3;
            p.y = 4;
            return geo.Manhattan(p);
        }
        "#,
    )
    .unwrap();

    let result = Engine::default().run_file(dir.path().join("main.fer")).expect("Execution failed");
    assert_eq!(result, Value::Int(7));
}

#[test]
fn test_inline_import_runs_imported_init_once() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("base.fer"),
        r#"
        string trail = "";

        void Init() {
            trail = trail + "base;";
        }

        int Twice(int x) { return x * 2; }
        "#,
    )
    .unwrap();
    fs::write(
        dir.path().join("main.fer"),
        r#"
        import inline "base.fer";

        string Start() {
            return trail + "$Twice(4)$";
        }
        "#,
    )
    .unwrap();

    let result = Engine::default().run_file(dir.path().join("main.fer")).expect("Execution failed");
    assert_eq!(result, Value::Str("base;8".to_string()));
}

#[test]
fn test_diamond_import_shares_globals() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("counter.fer"), "int count = 0;\nvoid Bump() { count += 1; }").unwrap();
    fs::write(dir.path().join("left.fer"), "import \"counter\" as c;\nvoid Init() { c.Bump(); }").unwrap();
    fs::write(dir.path().join("right.fer"), "import \"counter\" as c;\nvoid Init() { c.Bump(); }").unwrap();
    fs::write(
        dir.path().join("main.fer"),
        "import \"left\" as l;\nimport \"right\" as r;\nimport \"counter\" as c;\nint Start() { return c.count; }",
    )
    .unwrap();

    let engine = Engine::default();
    let program = engine.compile_file(dir.path().join("main.fer")).unwrap();
    assert_eq!(program.globals.iter().filter(|g| g.name == "count").count(), 1);
    assert_eq!(engine.load(program).unwrap().run().unwrap(), Value::Int(2));
}

#[test]
fn test_custom_start_function() {
    let mut engine = Engine::default();
    engine.config_mut().start = "Main".to_string();
    let result = engine.run_source("main.fer", "int Main() { return 1; }").expect("Execution failed");
    assert_eq!(result, Value::Int(1));

    let err = Engine::default().run_source("main.fer", "int Main() { return 1; }").unwrap_err();
    assert!(matches!(err.kind, ErrorKind::MissingStart(_)));
}
