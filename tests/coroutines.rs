use ferrule::value::Value;
use ferrule::{run, CapturedOutput, Engine, ErrorKind};

fn run_captured(source: &str) -> (Value, String) {
    let mut vm = Engine::default().load_source("main.fer", source).expect("Compilation failed");
    let out = CapturedOutput::new();
    vm.set_output(Box::new(out.clone()));
    let value = vm.run().expect("Execution failed");
    (value, out.contents())
}

#[test]
fn test_coroutines_run_in_spawn_order() {
    let source = r#"
        void Say(string s) {
            Print(s);
        }

        void Start() {
            int a = async Say("a");
            int b = async Say("b");
            Print("start");
            await [a, b];
            Print("done");
        }
    "#;
    let (_, output) = run_captured(source);
    assert_eq!(output, "start\na\nb\ndone\n");
}

#[test]
fn test_await_empty_list_returns_zero() {
    let source = r#"
        int Start() {
            list<int> none = new list<int>;
            return await none;
        }
    "#;
    assert_eq!(run(source).expect("Execution failed"), Value::Int(0));
}

#[test]
fn test_await_finished_coroutine_returns_zero() {
    let source = r#"
        void Nop() { }

        tuple<bool, int> Start() {
            int a = async Nop();
            int first = await [a];
            return first == a, await [a];
        }
    "#;
    assert_eq!(
        run(source).expect("Execution failed"),
        Value::Tuple(vec![Value::Bool(true), Value::Int(0)])
    );
}

#[test]
fn test_async_through_function_value() {
    let source = r#"
        int total = 0;

        void Add(int x) {
            total += x;
        }

        int Start() {
            fn<void(int)> add = Add;
            fn<void()> addTen = bind(Add, 10);
            await [async add(5), async addTen()];
            return total;
        }
    "#;
    assert_eq!(run(source).expect("Execution failed"), Value::Int(15));
}

#[test]
fn test_results_of_spawned_coroutines_are_discarded() {
    let source = r#"
        int Answer() { return 42; }

        int Start() {
            int id = async Answer();
            await [id];
            return 7;
        }
    "#;
    assert_eq!(run(source).expect("Execution failed"), Value::Int(7));
}

#[test]
fn test_self_await_is_a_deadlock() {
    let source = r#"
        void Wait(list<int> ids) {
            await ids;
        }

        void Start() {
            list<int> ids = new list<int>;
            int a = async Wait(ids);
            ids.push(a);
            await [a];
        }
    "#;
    let err = run(source).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Deadlock(_)), "unexpected {:?}", err.kind);
    assert_eq!(err.backtrace.len(), 2);
    assert!(err.backtrace.iter().all(|trace| trace.state.starts_with("awaiting")));
}

#[test]
fn test_sleeping_coroutines_interleave() {
    let source = r#"
        void Slow() {
            Sleep(20);
            Print("slow");
        }

        void Fast() {
            Print("fast");
        }

        void Start() {
            await [async Slow(), async Fast()];
        }
    "#;
    let (_, output) = run_captured(source);
    assert_eq!(output, "fast\nslow\n");
}

#[test]
fn test_runtime_error_in_coroutine_reports_every_coroutine() {
    let source = r#"
        int Divide(int by) {
            return 10 / by;
        }

        void Start() {
            await [async Divide(0)];
        }
    "#;
    let err = run(source).unwrap_err();
    assert_eq!(err.kind, ErrorKind::DivisionByZero);
    assert_eq!(err.backtrace.len(), 2);
    assert_eq!(err.backtrace[0].frames[0].function, "Divide");
    assert_eq!(err.backtrace[0].frames[0].line, 3);
    assert_eq!(err.backtrace[1].frames[0].function, "Start");
}
