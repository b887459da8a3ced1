use ferrule::value::Value;
use ferrule::{Engine, EngineConfig, ErrorKind};

fn small_heap() -> Engine {
    Engine::new(EngineConfig::default().with_heap(8, 4096))
}

#[test]
fn test_garbage_is_collected_during_a_loop() {
    let source = r#"
        int Start() {
            int total = 0;
            for int i = 0; i < 500; i += 1 {
                string s = "n" + "$i$";
                total += s.length;
            }
            return total;
        }
    "#;
    let mut vm = small_heap().load_source("main.fer", source).unwrap();
    assert_eq!(vm.run().unwrap(), Value::Int(1890));
    assert!(vm.heap().collections > 0);
    // Only dead temporaries were allocated, so the heap never needed to grow far
    assert!(vm.heap().capacity() < 4096);

    vm.collect_garbage();
    assert_eq!(vm.heap().live(), 0);
}

#[test]
fn test_reachable_values_survive_collection() {
    let source = r#"
        list<string> kept;

        void Start() {
            kept = new list<string>;
            for int i = 0; i < 50; i += 1 {
                string garbage = "tmp $i$";
                kept.push("k$i$");
            }
        }
    "#;
    let mut vm = small_heap().load_source("main.fer", source).unwrap();
    vm.run().unwrap();
    let stats = vm.collect_garbage();
    assert!(stats.after >= 51);
    assert_eq!(vm.collect_garbage().freed(), 0);

    match vm.global("kept").unwrap() {
        Some(Value::List(items)) => {
            assert_eq!(items.len(), 50);
            assert_eq!(items[0], Value::Str("k0".to_string()));
            assert_eq!(items[49], Value::Str("k49".to_string()));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_nested_structures_survive_pressure() {
    let source = r#"
        struct Node {
            int value;
            Node next;
        }

        int Start() {
            Node head = null;
            for int i = 1; i <= 100; i += 1 {
                Node n = new Node;
                n.value = i;
                n.next = head;
                head = n;
                string noise = "noise $i$";
            }
            int sum = 0;
            while head != null {
                sum += head.value;
                head = head.next;
            }
            return sum;
        }
    "#;
    assert_eq!(small_heap().run_source("main.fer", source).unwrap(), Value::Int(5050));
}

#[test]
fn test_heap_exhaustion() {
    let source = r#"
        void Start() {
            list<string> all = new list<string>;
            while true {
                all.push("x");
            }
        }
    "#;
    let err = Engine::new(EngineConfig::default().with_heap(8, 64)).run_source("main.fer", source).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::HeapExhausted(_)), "unexpected {:?}", err.kind);
}
