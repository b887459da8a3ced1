use ferrule::run;
use ferrule::value::Value;

#[test]
fn test_arithmetic_start_result() {
    let result = run("int Start() { return 2 + 3 * 4; }").expect("Execution failed");
    assert_eq!(result, Value::Int(14));
    assert_eq!(result.to_string(), "14");
}

#[test]
fn test_struct_field_round_trip() {
    let source = r#"
        struct Pair {
            int first;
            string second;
        }

        string Start() {
            Pair p = new Pair;
            p.second = "ok";
            return p.second;
        }
    "#;
    assert_eq!(run(source).expect("Execution failed"), Value::Str("ok".to_string()));
}

#[test]
fn test_for_each_sums_list() {
    let source = r#"
        int Start() {
            int sum = 0;
            for int x in [1, 2, 5] {
                sum += x;
            }
            return sum;
        }
    "#;
    assert_eq!(run(source).expect("Execution failed"), Value::Int(8));
}

#[test]
fn test_await_reports_unblocking_coroutine() {
    let source = r#"
        int shared = 0;
        int first = -1;
        int unblocked = -1;

        void A() {
            Sleep(10);
            shared = 5;
        }

        void B(int a) {
            unblocked = await [a];
        }

        bool Start() {
            first = async A();
            int b = async B(first);
            await [b];
            assert shared == 5;
            return unblocked == first;
        }
    "#;
    // A sleeps, so B awaits it while it is still live
    assert_eq!(run(source).expect("Execution failed"), Value::Bool(true));
}

#[test]
fn test_start_coroutine_awaits_directly() {
    let source = r#"
        int shared = 0;

        void A() {
            shared = 5;
        }

        tuple<bool, int> Start() {
            int a = async A();
            int by = await [a];
            return by == a, shared;
        }
    "#;
    assert_eq!(
        run(source).expect("Execution failed"),
        Value::Tuple(vec![Value::Bool(true), Value::Int(5)])
    );
}
