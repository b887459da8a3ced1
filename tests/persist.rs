use ferrule::value::Value;
use ferrule::{Engine, EngineConfig, ErrorKind};

const COUNTER: &str = r#"
    persist int runs = 0;
    persist string last = "";
    persist float scale = 1.5;

    string Start() {
        runs += 1;
        string previous = last;
        last = "run $runs$";
        scale = scale * 2.0;
        return "$runs$|$previous$|$scale$";
    }
"#;

#[test]
fn test_persisted_globals_survive_runs() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::default().with_persist_path(dir.path().join("counter.persist"));

    let first = Engine::new(config.clone()).run_source("counter.fer", COUNTER).unwrap();
    assert_eq!(first, Value::Str("1||3.0".to_string()));

    let second = Engine::new(config.clone()).run_source("counter.fer", COUNTER).unwrap();
    assert_eq!(second, Value::Str("2|run 1|6.0".to_string()));
    assert!(dir.path().join("counter.persist").exists());
}

#[test]
fn test_persisted_file_defaults_next_to_script() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("visits.fer");
    std::fs::write(&script, "persist int visits;\nint Start() { visits += 1; return visits; }").unwrap();

    let engine = Engine::default();
    assert_eq!(engine.run_file(&script).unwrap(), Value::Int(1));
    assert_eq!(engine.run_file(&script).unwrap(), Value::Int(2));
    assert!(dir.path().join("visits.persist").exists());
}

#[test]
fn test_corrupt_persisted_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.persist");
    std::fs::write(&path, [9u8, 0, 0]).unwrap();

    let config = EngineConfig::default().with_persist_path(&path);
    let err = Engine::new(config).run_source("bad.fer", COUNTER).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Io(_)), "unexpected {:?}", err.kind);
}

const SERVER: &str = r#"
    option int port = 80;
    option bool verbose;
    option string name = "anon";
    string seen = "";

    void Init() {
        seen = "$port$";
    }

    string Start() {
        return "$seen$ $verbose$ $name$";
    }
"#;

#[test]
fn test_options_override_initializers_before_init() {
    let config = EngineConfig::default()
        .with_option("port", "8080")
        .with_option("verbose", "yes")
        .with_option("name", "edge");
    let result = Engine::new(config).run_source("server.fer", SERVER).unwrap();
    assert_eq!(result, Value::Str("8080 true edge".to_string()));

    let result = Engine::default().run_source("server.fer", SERVER).unwrap();
    assert_eq!(result, Value::Str("80 false anon".to_string()));
}

#[test]
fn test_invalid_option_values() {
    let config = EngineConfig::default().with_option("port", "eighty");
    let err = Engine::new(config).run_source("server.fer", SERVER).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::InvalidOption(_)));
    assert_eq!(err.category(), ferrule::Category::Startup);

    let config = EngineConfig::default().with_option("host", "example.org");
    let err = Engine::new(config).run_source("server.fer", SERVER).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::InvalidOption(_)));
}

#[test]
fn test_persisted_names_are_unique_across_modules() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("stats.fer"), "persist int count;\nvoid Bump() { count += 1; }\n").unwrap();
    let main = dir.path().join("main.fer");
    std::fs::write(&main, "import \"stats\" as stats;\npersist int count;\nvoid Start() { stats.Bump(); }\n").unwrap();

    let err = Engine::default().compile_file(&main).unwrap_err();
    match &err.kind {
        ErrorKind::DuplicatePersisted(name, module) => {
            assert_eq!(name, "count");
            assert!(module.ends_with("stats.fer"), "unexpected module {}", module);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(err.category(), ferrule::Category::Semantic);
    assert_eq!(err.span.map(|s| s.line), Some(2));

    std::fs::write(&main, "import \"stats\" as stats;\npersist int visits;\nvoid Start() { stats.Bump(); }\n").unwrap();
    assert!(Engine::default().compile_file(&main).is_ok());
}
