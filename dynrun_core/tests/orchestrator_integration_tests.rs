use dynrun_core::{
    diagnostics::codes, BinaryImage, CompilationOptions, CompileError, Error, HostContext,
    InvokeError, LanguageVersion, LifecycleTracker, LoadError, Orchestrator, OutputKind,
    RuntimeConfig, SourceInput, UnitLimits, UnloadPolicy, Value, YieldStrategy,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

const SHAPES: &str = r#"
public class Square {
    public int side = 3;
    public int Area() => side * side;
}

public class Counter {
    int count = 0;
    public int Next() {
        count = count + 1;
        return count;
    }
}
"#;

const APP: &str = r#"
public class C {
    public int F() => new Square().Area() + 1;
    public Square Make() => new Square();
}
"#;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn orchestrator() -> Orchestrator {
    init_tracing();
    Orchestrator::new().with_host(Arc::new(HostContext::new()))
}

fn named(name: &str) -> CompilationOptions {
    CompilationOptions::new().with_target_name(name)
}

fn write_image(dir: &Path, image: &BinaryImage) -> std::path::PathBuf {
    let path = dir.join(format!("{}.wasm", image.name()));
    fs::write(&path, image.as_bytes()).unwrap();
    path
}

#[test]
fn test_compile_load_invoke_and_unload() {
    let orchestrator = orchestrator();
    let artifact = orchestrator
        .compile_and_load(
            SourceInput::from_text("public class C { public int F() => 2 + 2; }"),
            &CompilationOptions::new(),
            true,
        )
        .unwrap();

    let object = artifact.get_type("C").unwrap().create_instance().unwrap();
    assert_eq!(object.invoke("F", &[]).unwrap(), Value::Int(4));

    drop(object);
    drop(artifact);
    let report = orchestrator.unload();
    assert_eq!(report.units_unloaded, 1);
    assert!(report.still_alive.is_empty());
}

#[test]
fn test_empty_source_is_a_parse_error() {
    let orchestrator = orchestrator();
    let err = orchestrator
        .compile_and_load(SourceInput::from_text("   "), &CompilationOptions::new(), true)
        .unwrap_err();

    match err {
        Error::Compile(CompileError::Parse { diagnostics, .. }) => {
            assert_eq!(diagnostics[0].code, codes::EMPTY_SOURCE);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(orchestrator.tracker().tracked(), 0);
}

#[test]
fn test_undefined_type_is_an_emit_error() {
    let orchestrator = orchestrator();
    let err = orchestrator
        .compile(
            SourceInput::from_text("public class C { public Widget W() => new Widget(); }"),
            &CompilationOptions::new(),
        )
        .unwrap_err();

    assert!(matches!(err, CompileError::Emit { .. }));
    assert!(err
        .diagnostics()
        .iter()
        .all(|d| d.code == codes::UNKNOWN_TYPE));
}

#[test]
fn test_units_do_not_share_state() {
    let orchestrator = orchestrator();
    let source = "public class Box { public int value = 0; public int Bump() { value = value + 1; return value; } }";

    let first = orchestrator
        .compile_and_load(SourceInput::from_text(source), &named("Lib"), true)
        .unwrap();
    let second = orchestrator
        .compile_and_load(SourceInput::from_text(source), &named("Lib"), true)
        .unwrap();
    assert_ne!(first.unit_id(), second.unit_id());

    let a = first.get_type("Box").unwrap().create_instance().unwrap();
    let b = second.get_type("Box").unwrap().create_instance().unwrap();
    a.invoke("Bump", &[]).unwrap();
    a.invoke("Bump", &[]).unwrap();
    assert_eq!(a.get_field("value").unwrap(), Value::Int(2));
    assert_eq!(b.get_field("value").unwrap(), Value::Int(0));

    // Isolated loads never touch the host context
    assert!(orchestrator.host().image_names().is_empty());
}

#[test]
fn test_one_image_loaded_into_two_units() {
    let orchestrator = orchestrator();
    let mut image = orchestrator
        .compile(SourceInput::from_text(SHAPES), &named("Shapes"))
        .unwrap();

    let first = orchestrator.load(&mut image, true, None).unwrap();
    // A partly consumed image still loads from its first byte
    let mut head = [0u8; 8];
    std::io::Read::read_exact(&mut image, &mut head).unwrap();
    let second = orchestrator.load(&mut image, true, None).unwrap();
    assert_ne!(first.unit_id(), second.unit_id());
    assert_eq!(orchestrator.tracker().tracked(), 2);

    let a = first.get_type("Counter").unwrap().create_instance().unwrap();
    let b = second.get_type("Counter").unwrap().create_instance().unwrap();
    assert_eq!(a.invoke("Next", &[]).unwrap(), Value::Int(1));
    assert_eq!(a.invoke("Next", &[]).unwrap(), Value::Int(2));
    assert_eq!(b.invoke("Next", &[]).unwrap(), Value::Int(1));

    drop((a, b, first, second));
    let report = orchestrator.unload();
    assert_eq!(report.units_unloaded, 2);
    assert!(report.still_alive.is_empty());
}

#[test]
fn test_retained_object_keeps_unit_alive() {
    let orchestrator = orchestrator().with_unload_policy(UnloadPolicy {
        max_attempts: 5,
        yield_strategy: YieldStrategy::Sleep { millis: 1 },
    });
    let artifact = orchestrator
        .compile_and_load(SourceInput::from_text(SHAPES), &named("Shapes"), true)
        .unwrap();
    let square = artifact.get_type("Square").unwrap().create_instance().unwrap();
    let unit_id = artifact.unit_id();
    drop(artifact);

    let report = orchestrator.unload();
    assert_eq!(report.units_still_alive, 1);
    assert_eq!(report.still_alive, vec![unit_id]);
    assert_eq!(square.invoke("Area", &[]).unwrap(), Value::Int(9));

    drop(square);
    let report = orchestrator.release();
    assert_eq!(report.units_unloaded, 1);
}

#[test]
fn test_dependency_from_reference_path() {
    let dir = tempdir().unwrap();
    let orchestrator = orchestrator();
    let shapes = orchestrator
        .compile(SourceInput::from_text(SHAPES), &named("Shapes"))
        .unwrap();
    let shapes_path = write_image(dir.path(), &shapes);

    let artifact = orchestrator
        .compile_and_load(
            SourceInput::from_text(APP),
            &named("App").with_reference_path(&shapes_path),
            true,
        )
        .unwrap();
    assert_eq!(artifact.metadata().dependencies, vec!["Shapes".to_string()]);

    let app = artifact.get_type("C").unwrap().create_instance().unwrap();
    assert_eq!(app.invoke("F", &[]).unwrap(), Value::Int(10));
    assert!(matches!(
        app.invoke("Make", &[]),
        Err(InvokeError::ForeignObject(name)) if name == "Shapes.Square"
    ));
}

#[test]
fn test_dependency_from_host_context() {
    let orchestrator = orchestrator();
    let shared = orchestrator
        .compile_and_load(SourceInput::from_text(SHAPES), &named("Shapes"), false)
        .unwrap();
    let counter = shared.get_type("Counter").unwrap().create_instance().unwrap();
    assert_eq!(counter.invoke("Next", &[]).unwrap(), Value::Int(1));

    // No reference path needed: host images join every reference set
    let artifact = orchestrator
        .compile_and_load(SourceInput::from_text(APP), &named("App"), true)
        .unwrap();
    let app = artifact.get_type("C").unwrap().create_instance().unwrap();
    assert_eq!(app.invoke("F", &[]).unwrap(), Value::Int(10));
    assert_eq!(counter.invoke("Next", &[]).unwrap(), Value::Int(2));
}

#[test]
fn test_unresolved_dependency() {
    let dir = tempdir().unwrap();
    let orchestrator = orchestrator();
    let shapes = orchestrator
        .compile(SourceInput::from_text(SHAPES), &named("Shapes"))
        .unwrap();
    let shapes_path = write_image(dir.path(), &shapes);
    let mut app = orchestrator
        .compile(
            SourceInput::from_text(APP),
            &named("App").with_reference_path(&shapes_path),
        )
        .unwrap();

    let err = orchestrator.load(&mut app, true, None).unwrap_err();
    assert!(matches!(
        err,
        LoadError::UnresolvedDependency { ref artifact, ref dependency }
            if artifact == "App" && dependency == "Shapes"
    ));
}

#[test]
fn test_cyclic_dependency() {
    let dir = tempdir().unwrap();
    let orchestrator = orchestrator();

    let first = orchestrator
        .compile(
            SourceInput::from_text("public class A { public static int One() => 1; }"),
            &named("Alpha"),
        )
        .unwrap();
    let first_path = write_image(dir.path(), &first);
    let beta = orchestrator
        .compile(
            SourceInput::from_text("public class B { public static int Two() => A.One() + 1; }"),
            &named("Beta").with_reference_path(&first_path),
        )
        .unwrap();
    let beta_path = write_image(dir.path(), &beta);

    // A second Alpha that depends on Beta, which depends on Alpha
    let mut alpha = orchestrator
        .compile(
            SourceInput::from_text("public class A { public static int One() => B.Two(); }"),
            &named("Alpha").with_reference_path(&beta_path),
        )
        .unwrap();
    let err = orchestrator
        .load(&mut alpha, true, Some(dir.path().to_path_buf()))
        .unwrap_err();
    assert!(matches!(err, LoadError::CyclicDependency(chain) if chain == "Alpha -> Beta -> Alpha"));
}

#[test]
fn test_language_version_gating() {
    let orchestrator = orchestrator();
    let options = CompilationOptions::new().with_language_version(LanguageVersion::V1);
    let err = orchestrator
        .compile(
            SourceInput::from_text("public class C { public int F() => 1; }"),
            &options,
        )
        .unwrap_err();
    assert_eq!(err.diagnostics()[0].code, codes::FEATURE_UNAVAILABLE);

    orchestrator
        .compile(
            SourceInput::from_text("public class C { public int F() { return 1; } }"),
            &options,
        )
        .unwrap();
}

#[test]
fn test_warnings_as_errors() {
    let orchestrator = orchestrator();
    let source = "public class C { public int F() { return 1; return 2; } }";

    let image = orchestrator
        .compile(SourceInput::from_text(source), &CompilationOptions::new())
        .unwrap();
    assert_eq!(image.diagnostics()[0].code, codes::UNREACHABLE_CODE);

    let err = orchestrator
        .compile(
            SourceInput::from_text(source),
            &CompilationOptions::new().with_warnings_as_errors(true),
        )
        .unwrap_err();
    assert!(err.diagnostics()[0].is_error());
}

#[test]
fn test_entry_point_and_traps() {
    let orchestrator = orchestrator();
    let program = r#"
        class Program {
            static int Main() {
                int total = 0;
                int i = 1;
                while (i <= 10) {
                    total = total + i;
                    i = i + 1;
                }
                return total;
            }
            public static int Divide(int a, int b) => a / b;
        }
    "#;
    let options = named("Program").with_output_kind(OutputKind::Executable);
    let artifact = orchestrator
        .compile_and_load(SourceInput::from_text(program), &options, true)
        .unwrap();

    assert_eq!(artifact.run().unwrap(), Value::Int(55));

    let program_type = artifact.get_type("Program").unwrap();
    assert_eq!(
        program_type
            .invoke_static("Divide", &[Value::Int(9), Value::Int(3)])
            .unwrap(),
        Value::Int(3)
    );
    assert!(matches!(
        program_type.invoke_static("Divide", &[Value::Int(1), Value::Int(0)]),
        Err(InvokeError::Trap(_))
    ));
    assert!(matches!(
        program_type.invoke_static("Divide", &[Value::Int(1)]),
        Err(InvokeError::Arity { expected: 2, found: 1, .. })
    ));
    assert!(matches!(
        program_type.invoke_static("Divide", &[Value::Bool(true), Value::Int(1)]),
        Err(InvokeError::ArgumentType { index: 0, .. })
    ));
}

#[test]
fn test_library_has_no_entry_point() {
    let orchestrator = orchestrator();
    let artifact = orchestrator
        .compile_and_load(SourceInput::from_text(SHAPES), &named("Shapes"), true)
        .unwrap();
    assert!(matches!(artifact.run(), Err(InvokeError::NoEntryPoint(_))));
}

#[test]
fn test_objects_and_fields() {
    let orchestrator = orchestrator();
    let source = r#"
        public class Point {
            public int x = 1;
            public bool visible = true;
            public Point Moved(int dx) {
                Point next = new Point();
                next.x = x + dx;
                return next;
            }
        }
    "#;
    let artifact = orchestrator
        .compile_and_load(SourceInput::from_text(source), &named("Geometry"), true)
        .unwrap();

    let point = artifact.get_type("Point").unwrap().create_instance().unwrap();
    let moved = point.invoke("Moved", &[Value::Int(4)]).unwrap();
    let moved = moved.as_object().unwrap();
    assert_eq!(moved.class_name(), "Point");
    assert_eq!(moved.get_field("x").unwrap(), Value::Int(5));
    assert_eq!(moved.get_field("visible").unwrap(), Value::Bool(true));
    assert!(matches!(
        moved.get_field("y"),
        Err(InvokeError::UnknownField { .. })
    ));
    assert!(matches!(
        point.invoke("Missing", &[]),
        Err(InvokeError::UnknownMethod { .. })
    ));
}

#[test]
fn test_memory_limit_traps() {
    let orchestrator = orchestrator().with_unit_limits(UnitLimits {
        memory_limit: 64 * 1024,
    });
    let source = r#"
        public class Node {
            public int value = 0;
            public static int Fill(int count) {
                int i = 0;
                while (i < count) {
                    new Node();
                    i = i + 1;
                }
                return i;
            }
        }
    "#;
    let artifact = orchestrator
        .compile_and_load(SourceInput::from_text(source), &named("Nodes"), true)
        .unwrap();
    let node = artifact.get_type("Node").unwrap();

    assert_eq!(
        node.invoke_static("Fill", &[Value::Int(100)]).unwrap(),
        Value::Int(100)
    );
    assert!(matches!(
        node.invoke_static("Fill", &[Value::Int(100_000)]),
        Err(InvokeError::Trap(_))
    ));
}

#[test]
fn test_shared_tracker_across_orchestrators() {
    let tracker = Arc::new(LifecycleTracker::new());
    let first = orchestrator().with_tracker(tracker.clone());
    let second = orchestrator().with_tracker(tracker.clone());

    first
        .compile_and_load(SourceInput::from_text(SHAPES), &named("Shapes"), true)
        .unwrap();
    second
        .compile_and_load(SourceInput::from_text(SHAPES), &named("Shapes"), true)
        .unwrap();
    assert_eq!(tracker.tracked(), 2);

    let report = first.release();
    assert_eq!(report.units_unloaded, 2);
    assert_eq!(second.unload().units_unloaded, 0);
}

#[test]
fn test_orchestrator_from_config() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("DynRun.toml");
    fs::write(
        &path,
        r#"
[compilation]
language_version = "v1"
warnings_as_errors = true

[unload]
max_attempts = 3
yield_strategy = { kind = "none" }

[unit]
memory_limit = 131072
"#,
    )
    .unwrap();

    let config = RuntimeConfig::load(&path).unwrap();
    assert_eq!(config.compilation.language_version, LanguageVersion::V1);
    assert_eq!(config.unload.max_attempts, 3);
    assert_eq!(config.unit.memory_limit, 131072);

    let orchestrator = Orchestrator::from_config(&config).with_host(Arc::new(HostContext::new()));
    let image = orchestrator
        .compile(
            SourceInput::from_text("public class C { public int F() { return 1; } }"),
            &config.compilation,
        )
        .unwrap();
    assert_eq!(image.metadata().language_version, LanguageVersion::V1);
}

#[tokio::test]
async fn test_compile_async_then_load() {
    let orchestrator = orchestrator();
    let mut image = orchestrator
        .compile_async(
            SourceInput::from_text("public class C { public static int F() => Math.Clamp(42, 0, 10); }"),
            named("Async"),
        )
        .await
        .unwrap();

    let artifact = orchestrator.load(&mut image, true, None).unwrap();
    let value = artifact
        .get_type("C")
        .unwrap()
        .invoke_static("F", &[])
        .unwrap();
    assert_eq!(value, Value::Int(10));
}
