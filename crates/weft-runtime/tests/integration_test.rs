/// End-to-end tests for weft-runtime.
///
/// Each test writes small ES modules to a temp dir and runs them through a
/// fresh RuntimeEnvironment, exercising the real QuickJS engine.
use std::io::{BufRead, BufReader};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use weft_core::{
    ForeignObject, HandleTable, HostValue, Level, TypeHint, from_runtime_value, to_runtime_value,
};
use weft_runtime::{EntryCall, RuntimeEnvironment, RuntimeError, RuntimeOptions};
use weft_core::value::RuntimeValue;

const ADD_SCRIPT: &str = r#"
export function runScript(inputs, context) {
  console.log("adding", inputs.a, inputs.b);
  return { x: inputs.a + inputs.b };
}
"#;

fn write_script(dir: &Path, name: &str, source: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, source).unwrap();
    path
}

fn call(path: &Path) -> EntryCall {
    EntryCall::new(path, "runScript")
}

fn number(n: f64) -> RuntimeValue {
    RuntimeValue::Number(n)
}

#[test]
fn run_evaluates_on_the_runtime_thread() {
    let env = RuntimeEnvironment::default();
    let value = env
        .run(|scope| {
            let value = scope.eval("1 + 2")?;
            scope.from_js(value)
        })
        .unwrap();
    assert_eq!(value, number(3.0));
    assert!(env.is_live());
}

#[test]
fn run_async_drives_promises_to_settlement() {
    let env = RuntimeEnvironment::default();
    let value = env
        .run_async(|scope| scope.eval("Promise.resolve(41).then((v) => v + 1)"))
        .wait()
        .unwrap();
    assert_eq!(value, number(42.0));
}

#[test]
fn entry_adds_inputs_and_captures_console() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "index.js", ADD_SCRIPT);
    let env = RuntimeEnvironment::default();

    let inputs = RuntimeValue::from_pairs([("a", number(2.0)), ("b", number(3.0))]);
    let outcome = env
        .execute_entry(call(&script).with_inputs(inputs))
        .wait()
        .unwrap();

    assert_eq!(
        outcome.value.unwrap(),
        RuntimeValue::from_pairs([("x", number(5.0))])
    );
    assert_eq!(outcome.console.len(), 1);
    assert_eq!(outcome.console[0].level, Level::Info);
    assert_eq!(outcome.console[0].text, "adding\n2\n3");
    assert_eq!(outcome.epoch, env.epoch());
}

#[test]
fn async_entry_waits_on_timers() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "index.js",
        r#"
export async function runScript(inputs) {
  const started = Date.now();
  await new Promise((resolve) => setTimeout(resolve, 20));
  console.warn("waited");
  return { doubled: inputs.a * 2, waited: Date.now() - started >= 15 };
}
"#,
    );
    let env = RuntimeEnvironment::default();
    let inputs = RuntimeValue::from_pairs([("a", number(5.0))]);
    let outcome = env
        .execute_entry(call(&script).with_inputs(inputs))
        .wait()
        .unwrap();

    assert_eq!(
        outcome.value.unwrap(),
        RuntimeValue::from_pairs([("doubled", number(10.0)), ("waited", RuntimeValue::Bool(true))])
    );
    assert_eq!(outcome.console[0].level, Level::Warning);
}

#[tokio::test]
async fn execution_handle_is_awaitable() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "index.js", ADD_SCRIPT);
    let env = RuntimeEnvironment::default();
    let inputs = RuntimeValue::from_pairs([("a", number(1.0)), ("b", number(1.0))]);

    let outcome = env.execute_entry(call(&script).with_inputs(inputs)).await.unwrap();
    assert_eq!(
        outcome.value.unwrap(),
        RuntimeValue::from_pairs([("x", number(2.0))])
    );
}

#[test]
fn thrown_errors_keep_console_output() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "index.js",
        r#"
export function runScript() {
  console.error("about to fail");
  throw new Error("bad input");
}
"#,
    );
    let env = RuntimeEnvironment::default();
    let outcome = env.execute_entry(call(&script)).wait().unwrap();

    match outcome.value {
        Err(RuntimeError::Script(message)) => assert!(message.contains("bad input"), "{message}"),
        other => panic!("expected a script error, got {other:?}"),
    }
    assert_eq!(outcome.console[0].level, Level::Error);
    assert_eq!(outcome.console[0].text, "about to fail");
}

#[test]
fn promise_that_can_never_settle_is_stalled() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "index.js",
        "export function runScript() { return new Promise(() => {}); }",
    );
    let env = RuntimeEnvironment::default();
    let outcome = env.execute_entry(call(&script)).wait().unwrap();
    assert!(matches!(outcome.value, Err(RuntimeError::Stalled)));
}

#[test]
fn missing_export_and_missing_artifact_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "index.js", ADD_SCRIPT);
    let env = RuntimeEnvironment::default();

    let outcome = env
        .execute_entry(EntryCall::new(&script, "main"))
        .wait()
        .unwrap();
    assert!(matches!(
        outcome.value,
        Err(RuntimeError::EntryNotFound { ref export, .. }) if export == "main"
    ));

    let outcome = env
        .execute_entry(call(&dir.path().join("missing.js")))
        .wait()
        .unwrap();
    assert!(matches!(outcome.value, Err(RuntimeError::Artifact { .. })));
}

#[test]
fn module_is_reused_until_its_content_changes() {
    let dir = tempfile::tempdir().unwrap();
    let counter = r#"
let calls = 0;
export function runScript() {
  calls += 1;
  return calls;
}
"#;
    let script = write_script(dir.path(), "index.js", counter);
    let env = RuntimeEnvironment::default();

    let run = |env: &RuntimeEnvironment| env.execute_entry(call(&script)).wait().unwrap().value.unwrap();
    assert_eq!(run(&env), number(1.0));
    assert_eq!(run(&env), number(2.0));
    assert_eq!(env.cached_modules(), 1);

    write_script(dir.path(), "index.js", &counter.replace("calls += 1", "calls += 10"));
    assert_eq!(run(&env), number(10.0));
    assert_eq!(env.cached_modules(), 1);

    env.reset();
    assert_eq!(run(&env), number(10.0));
}

#[test]
fn reset_advances_the_epoch_and_is_idempotent() {
    let env = RuntimeEnvironment::default();
    assert_eq!(env.epoch(), 1);
    env.reset();
    assert_eq!(env.epoch(), 1, "nothing live yet");

    env.run(|_| Ok(())).unwrap();
    env.reset();
    assert_eq!(env.epoch(), 2);
    assert!(!env.is_live());
    env.reset();
    assert_eq!(env.epoch(), 2);

    let epoch = env.run(|scope| Ok(scope.epoch())).unwrap();
    assert_eq!(epoch, 2);
    assert!(env.is_current(epoch));
}

#[test]
fn reset_during_execution_reports_stale_result() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "index.js",
        r#"
export async function runScript() {
  await new Promise((resolve) => setTimeout(resolve, 200));
  return 1;
}
"#,
    );
    let env = RuntimeEnvironment::default();
    let handle = env.execute_entry(call(&script));
    let scheduled = handle.epoch();
    env.reset();

    match handle.wait() {
        Err(RuntimeError::Stale { executed, current }) => {
            assert_eq!(executed, scheduled);
            assert_eq!(current, scheduled + 1);
        }
        other => panic!("expected a stale result, got {other:?}"),
    }

    // The next execution runs on a fresh instance.
    let outcome = env.execute_entry(call(&script)).wait().unwrap();
    assert_eq!(outcome.epoch, scheduled + 1);
    assert_eq!(outcome.value.unwrap(), number(1.0));
}

#[test]
fn out_of_memory_faults_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let hog = write_script(
        dir.path(),
        "hog.js",
        r#"
export function runScript() {
  const chunks = [];
  for (;;) chunks.push(new Array(1 << 16).fill(chunks.length));
}
"#,
    );
    let ok = write_script(dir.path(), "index.js", ADD_SCRIPT);
    let env = RuntimeEnvironment::new(RuntimeOptions {
        memory_limit: Some(16 * 1024 * 1024),
        max_stack_size: Some(512 * 1024),
    });

    let first = env.execute_entry(call(&hog));
    let faulted_epoch = first.epoch();
    let err = first.wait().unwrap_err();
    assert!(err.is_fault(), "{err}");

    let inputs = RuntimeValue::from_pairs([("a", number(2.0)), ("b", number(2.0))]);
    let outcome = env
        .execute_entry(call(&ok).with_inputs(inputs))
        .wait()
        .unwrap();
    assert!(outcome.epoch > faulted_epoch);
    assert_eq!(
        outcome.value.unwrap(),
        RuntimeValue::from_pairs([("x", number(4.0))])
    );
}

#[test]
fn runaway_recursion_is_a_script_error() {
    let env = RuntimeEnvironment::default();
    let err = env
        .run(|scope| {
            let value = scope.eval("function f(n) { return f(n + 1) + 1; } f(0)")?;
            scope.from_js(value)
        })
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Script(_)), "{err}");
    assert!(env.is_live());
}

#[test]
fn globals_are_installed() {
    let env = RuntimeEnvironment::default();
    let value = env
        .run(|scope| {
            let value = scope.eval(
                "[typeof console.log, typeof setTimeout, typeof clearTimeout, \
                  typeof setInterval, typeof clearInterval, typeof DataTree].join(',')",
            )?;
            scope.from_js(value)
        })
        .unwrap();
    assert_eq!(
        value,
        RuntimeValue::String("function,function,function,function,function,function".into())
    );
}

#[test]
fn special_values_cross_the_bridge() {
    let env = RuntimeEnvironment::default();
    let value = env
        .run(|scope| {
            let value = scope.eval(
                "({ big: 2n ** 40n, when: new Date(0), fn: () => 1, nothing: undefined, nil: null })",
            )?;
            scope.from_js(value)
        })
        .unwrap();
    let fields = value.as_object().unwrap();
    assert_eq!(fields["big"], RuntimeValue::BigInt(1 << 40));
    assert_eq!(fields["when"], RuntimeValue::Date(0.0));
    assert_eq!(fields["fn"], RuntimeValue::Unclassified("function".into()));
    assert_eq!(fields["nothing"], RuntimeValue::Undefined);
    assert_eq!(fields["nil"], RuntimeValue::Null);
}

#[test]
fn data_trees_round_trip_through_scripts() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "index.js",
        r#"
export function runScript(inputs) {
  const isTree = inputs.points instanceof DataTree;
  const out = new DataTree();
  for (const path of inputs.points.paths()) {
    for (const item of inputs.points.get(path)) out.add([...path, 0], item * 10);
  }
  return { isTree, out };
}
"#,
    );

    let mut tree = weft_core::DataTree::new();
    tree.push(weft_core::TreePath::new([0]), HostValue::Int(1));
    tree.push(weft_core::TreePath::new([0]), HostValue::Int(2));
    tree.push(weft_core::TreePath::new([3]), HostValue::Int(4));
    let mut table = HandleTable::new();
    let points = to_runtime_value(&HostValue::Tree(tree), &TypeHint::Any, &mut table).unwrap();

    let env = RuntimeEnvironment::default();
    let outcome = env
        .execute_entry(call(&script).with_inputs(RuntimeValue::from_pairs([("points", points)])))
        .wait()
        .unwrap();
    let value = outcome.value.unwrap();
    let host = from_runtime_value(&value, &table).unwrap().unwrap();

    let HostValue::Record(fields) = host else {
        panic!("expected a record, got {host:?}");
    };
    assert_eq!(fields["isTree"], HostValue::Bool(true));
    let HostValue::Tree(out) = &fields["out"] else {
        panic!("expected a tree, got {:?}", fields["out"]);
    };
    assert_eq!(
        out.branch(&weft_core::TreePath::new([0, 0])).unwrap(),
        &[HostValue::Int(10), HostValue::Int(20)]
    );
    assert_eq!(
        out.branch(&weft_core::TreePath::new([3, 0])).unwrap(),
        &[HostValue::Int(40)]
    );
}

#[test]
fn foreign_objects_come_back_as_the_same_object() {
    struct Brep {
        faces: usize,
    }

    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "index.js",
        r#"
export function runScript(inputs) {
  return { same: inputs.shape, label: String(inputs.shape), frozen: Object.isFrozen(inputs.shape) };
}
"#,
    );

    let shape = ForeignObject::new(Brep { faces: 6 });
    let mut table = HandleTable::new();
    let handle = to_runtime_value(&HostValue::Object(shape.clone()), &TypeHint::Any, &mut table)
        .unwrap();
    assert_eq!(table.registered_types(), 1);

    let env = RuntimeEnvironment::default();
    let outcome = env
        .execute_entry(call(&script).with_inputs(RuntimeValue::from_pairs([("shape", handle)])))
        .wait()
        .unwrap();
    let host = from_runtime_value(&outcome.value.unwrap(), &table)
        .unwrap()
        .unwrap();
    let HostValue::Record(fields) = host else {
        panic!("expected a record");
    };

    let HostValue::Object(back) = &fields["same"] else {
        panic!("expected the foreign object back");
    };
    assert!(back.ptr_eq(&shape));
    assert_eq!(back.downcast_ref::<Brep>().unwrap().faces, 6);
    assert_eq!(fields["label"], HostValue::Text("[Brep #0]".into()));
    assert_eq!(fields["frozen"], HostValue::Bool(true));
}

mod surface {
    pub struct Mesh;
}

mod volume {
    pub struct Mesh;
}

#[test]
fn same_named_foreign_types_keep_separate_prototypes() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "index.js",
        r#"
export function runScript(inputs) {
  const [a, b, c] = inputs.meshes;
  return {
    shared: Object.getPrototypeOf(a) === Object.getPrototypeOf(b),
    sameType: Object.getPrototypeOf(a) === Object.getPrototypeOf(c),
    labels: [String(a), String(b)],
    types: [a.$type, b.$type],
  };
}
"#,
    );

    let mut table = HandleTable::new();
    let meshes = HostValue::List(vec![
        HostValue::Object(ForeignObject::new(surface::Mesh)),
        HostValue::Object(ForeignObject::new(volume::Mesh)),
        HostValue::Object(ForeignObject::new(surface::Mesh)),
    ]);
    let handles = to_runtime_value(&meshes, &TypeHint::Any, &mut table).unwrap();
    assert_eq!(table.registered_types(), 2);

    let env = RuntimeEnvironment::default();
    let outcome = env
        .execute_entry(call(&script).with_inputs(RuntimeValue::from_pairs([("meshes", handles)])))
        .wait()
        .unwrap();
    let HostValue::Record(fields) = from_runtime_value(&outcome.value.unwrap(), &table)
        .unwrap()
        .unwrap()
    else {
        panic!("expected a record");
    };

    assert_eq!(fields["shared"], HostValue::Bool(false));
    assert_eq!(fields["sameType"], HostValue::Bool(true));
    assert_eq!(
        fields["labels"],
        HostValue::List(vec![
            HostValue::Text("[Mesh #0]".into()),
            HostValue::Text("[Mesh #1]".into()),
        ])
    );
    assert_eq!(
        fields["types"],
        HostValue::List(vec![
            HostValue::Text(std::any::type_name::<surface::Mesh>().into()),
            HostValue::Text(std::any::type_name::<volume::Mesh>().into()),
        ])
    );
}

#[test]
fn debugger_waits_for_a_client_and_streams_events() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "index.js", ADD_SCRIPT);
    let env = RuntimeEnvironment::default();
    let port = env.enable_debugger(0).unwrap();
    assert_ne!(port, 0);
    assert_eq!(env.debugger_port(), Some(port));

    let inputs = RuntimeValue::from_pairs([("a", number(1.0)), ("b", number(2.0))]);
    let handle = env.execute_entry(call(&script).with_inputs(inputs));
    std::thread::sleep(Duration::from_millis(50));
    assert!(!handle.is_ready(), "execution must wait for the debugger");

    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let outcome = handle.wait().unwrap();
    assert!(outcome.value.is_ok());

    let events: Vec<serde_json::Value> = BufReader::new(stream)
        .lines()
        .take(3)
        .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
        .collect();
    assert_eq!(events[0]["event"], "execute");
    assert_eq!(events[0]["export"], "runScript");
    assert_eq!(events[1]["event"], "console");
    assert_eq!(events[1]["text"], "adding\n1\n2");
    assert_eq!(events[2]["event"], "settled");
    assert_eq!(events[2]["ok"], true);

    env.disable_debugger();
    assert_eq!(env.debugger_port(), None);
    let outcome = env.execute_entry(call(&script)).wait().unwrap();
    assert!(outcome.value.is_ok());
}

#[test]
fn debugger_keeps_its_port_across_resets() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "index.js", ADD_SCRIPT);
    let env = RuntimeEnvironment::default();
    let port = env.enable_debugger(0).unwrap();

    for _ in 0..25 {
        env.reset();
        env.run(|_| Ok(())).unwrap();
        assert_eq!(env.debugger_port(), Some(port));
    }
    assert_eq!(env.enable_debugger(port).unwrap(), port);

    let inputs = RuntimeValue::from_pairs([("a", number(4.0)), ("b", number(5.0))]);
    let handle = env.execute_entry(call(&script).with_inputs(inputs));
    std::thread::sleep(Duration::from_millis(50));
    assert!(!handle.is_ready(), "the new instance must wait for the debugger");

    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let outcome = handle.wait().unwrap();
    assert!(outcome.value.is_ok());
    let first = BufReader::new(stream).lines().next().unwrap().unwrap();
    let event: serde_json::Value = serde_json::from_str(&first).unwrap();
    assert_eq!(event["event"], "execute");
    assert_eq!(event["epoch"], env.epoch());
}

#[test]
fn date_hinted_inputs_arrive_as_dates() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "index.js",
        r#"
export function runScript(inputs) {
  return {
    isDate: inputs.d instanceof Date,
    millis: inputs.d.getTime(),
    fromNumber: inputs.n.getTime(),
    later: new Date(inputs.d.getTime() + 86400000),
  };
}
"#,
    );
    let mut table = HandleTable::new();
    let d = to_runtime_value(&HostValue::Text("2024-03-01T12:00:00Z".into()), &TypeHint::Date, &mut table)
        .unwrap();
    let n = to_runtime_value(&HostValue::Int(1_000), &TypeHint::Date, &mut table).unwrap();
    assert_eq!(d, RuntimeValue::Date(1_709_294_400_000.0));

    let env = RuntimeEnvironment::default();
    let outcome = env
        .execute_entry(call(&script).with_inputs(RuntimeValue::from_pairs([("d", d), ("n", n)])))
        .wait()
        .unwrap();
    let value = from_runtime_value(&outcome.value.unwrap(), &table).unwrap().unwrap();
    let HostValue::Record(fields) = value else {
        panic!("expected a record");
    };
    assert_eq!(fields["isDate"], HostValue::Bool(true));
    assert_eq!(fields["millis"], HostValue::Int(1_709_294_400_000));
    assert_eq!(fields["fromNumber"], HostValue::Int(1_000));
    assert_eq!(fields["later"], HostValue::Text("2024-03-02T12:00:00.000Z".into()));
}
