//! End-to-end tests for the core build flow: cold builds, warm re-runs,
//! pattern steps, and parameter-triggered rebuilds.

mod common;

use common::Workspace;
use dynamake::params::Value;
use dynamake::{Error, Make, ParamKind, StepContext};

/// Register the single-file copy step (`foo` is produced from `bar`).
fn register_copy(make: &mut Make, ws: &Workspace) {
    let foo = ws.path("foo");
    let bar = ws.path("bar");
    make.step("copy", [foo.clone()], move |context: &mut StepContext| {
        context.require(bar.as_str())?;
        context.shell(["cp", bar.as_str(), foo.as_str()])
    })
    .unwrap();
}

#[test]
fn test_copy_cold_and_warm() {
    let ws = Workspace::new();
    ws.write("bar", "payload");

    let mut make = ws.make();
    register_copy(&mut make, &ws);

    let target = ws.path("foo");
    let report = make.build(&[&target]).unwrap();
    assert_eq!(report.actions, 1);
    assert_eq!(ws.read("foo"), "payload");
    assert!(ws.has_record("copy"));

    // Warm re-run: nothing changed, zero actions.
    let report = make.build(&[&target]).unwrap();
    assert_eq!(report.actions, 0);
    assert_eq!(report.skipped, 1);
}

#[test]
fn test_output_newer_than_inputs() {
    let ws = Workspace::new();
    ws.write("bar", "payload");

    let mut make = ws.make();
    register_copy(&mut make, &ws);
    make.build(&[&ws.path("foo")]).unwrap();

    assert!(ws.mtime_ns("foo") >= ws.mtime_ns("bar"));
}

#[test]
fn test_pattern_compile() {
    let ws = Workspace::new();
    ws.write("src/a.c", "int a;");
    ws.write("obj/.keep", "");

    let root = ws.root();
    let mut make = ws.make();
    make.step(
        "compile",
        [format!("{root}/obj/{{*name}}.o")],
        move |context: &mut StepContext| {
            let name = context.binding("name")?.to_owned();
            let source = format!("{root}/src/{name}.c");
            let object = format!("{root}/obj/{name}.o");
            context.require(source.as_str())?;
            context.shell(["cp", source.as_str(), object.as_str()])
        },
    )
    .unwrap();

    let target = ws.path("obj/a.o");
    let report = make.build(&[&target]).unwrap();
    assert_eq!(report.actions, 1);
    assert_eq!(ws.read("obj/a.o"), "int a;");

    // Unchanged: zero actions.
    let report = make.build(&[&target]).unwrap();
    assert_eq!(report.actions, 0);

    // A newer source triggers exactly one recompile.
    ws.touch("src/a.c");
    let report = make.build(&[&target]).unwrap();
    assert_eq!(report.actions, 1);

    let report = make.build(&[&target]).unwrap();
    assert_eq!(report.actions, 0);
}

/// A step reading the `mode` parameter; the action itself does not mention
/// the value, so only the recorded configuration can trigger the rebuild.
fn make_with_mode(ws: &Workspace, mode: &str) -> Make {
    let mut make = ws.make();
    make.parameter(
        "mode",
        ParamKind::Str,
        Value::String("release".to_owned()),
        "The build mode",
    )
    .unwrap();
    make.params_mut().override_from("mode", mode).unwrap();

    let source = ws.path("input.txt");
    let output = ws.path("output.txt");
    make.step("generate", [output.clone()], move |context: &mut StepContext| {
        context.parameter("mode")?;
        context.require(source.as_str())?;
        context.shell(["cp", source.as_str(), output.as_str()])
    })
    .unwrap();
    make
}

#[test]
fn test_parameter_change_triggers_rebuild() {
    let ws = Workspace::new();
    ws.write("input.txt", "data");
    let target = ws.path("output.txt");

    let report = make_with_mode(&ws, "release").build(&[&target]).unwrap();
    assert_eq!(report.actions, 1);

    // Same files, different parameter value: exactly one rebuild.
    let report = make_with_mode(&ws, "debug").build(&[&target]).unwrap();
    assert_eq!(report.actions, 1);

    // Same parameter value again: zero actions.
    let report = make_with_mode(&ws, "debug").build(&[&target]).unwrap();
    assert_eq!(report.actions, 0);
}

#[test]
fn test_changed_command_triggers_rebuild() {
    let ws = Workspace::new();
    ws.write("bar", "payload");
    let target = ws.path("foo");

    let mut make = ws.make();
    register_copy(&mut make, &ws);
    assert_eq!(make.build(&[&target]).unwrap().actions, 1);

    // A different command line for the same step: rebuild.
    let foo = ws.path("foo");
    let bar = ws.path("bar");
    let mut changed = ws.make();
    changed
        .step("copy", [foo.clone()], move |context: &mut StepContext| {
            context.require(bar.as_str())?;
            context.shell(["cp", "-p", bar.as_str(), foo.as_str()])
        })
        .unwrap();
    assert_eq!(changed.build(&[&target]).unwrap().actions, 1);
    assert_eq!(changed.build(&[&target]).unwrap().actions, 0);
}

#[test]
fn test_corrupt_record_rebuilds_once() {
    let ws = Workspace::new();
    ws.write("bar", "payload");
    let target = ws.path("foo");

    let mut make = ws.make();
    register_copy(&mut make, &ws);
    assert_eq!(make.build(&[&target]).unwrap().actions, 1);

    ws.write(".dynamake/copy.actions.yaml", "not: [valid yaml");
    assert_eq!(make.build(&[&target]).unwrap().actions, 1);
    assert_eq!(make.build(&[&target]).unwrap().actions, 0);
}

#[test]
fn test_source_is_used_directly() {
    let ws = Workspace::new();
    ws.write("plain.txt", "source");

    let make = ws.make();
    let target = ws.path("plain.txt");
    let report = make.build(&[&target]).unwrap();
    assert_eq!(report.actions, 0);
    assert_eq!(report.skipped, 0);
}

#[test]
fn test_no_rule_for_missing_target() {
    let ws = Workspace::new();
    let make = ws.make();
    let target = ws.path("absent.txt");
    assert!(make.build(&[&target]).is_err());
}

#[test]
fn test_ambiguous_rule_is_fatal() {
    let ws = Workspace::new();
    let pattern = format!("{}/out/{{*name}}", ws.root());
    let mut make = ws.make();
    make.step("one", [pattern.as_str()], |_context: &mut StepContext| Ok(()))
        .unwrap();
    make.step("two", [pattern.as_str()], |_context: &mut StepContext| Ok(()))
        .unwrap();

    let target = ws.path("out/thing");
    match make.build(&[&target]) {
        Err(Error::Config { message }) => {
            assert!(message.contains("may be created by both"), "{message}");
        }
        other => panic!("expected a configuration error, got: {other:?}"),
    }
}

#[test]
fn test_cyclic_require_fails() {
    let ws = Workspace::new();
    let ping = ws.path("ping");
    let pong = ws.path("pong");

    let mut make = ws.make();
    let required = pong.clone();
    make.step("ping", [ping.as_str()], move |context: &mut StepContext| {
        context.require(required.as_str())?;
        context.sync()
    })
    .unwrap();
    let required = ping.clone();
    make.step("pong", [pong.as_str()], move |context: &mut StepContext| {
        context.require(required.as_str())?;
        context.sync()
    })
    .unwrap();

    assert!(make.build(&[&ping]).is_err());
}

#[test]
fn test_memoized_requirement_still_records_producer() {
    let ws = Workspace::new();
    ws.write("bar", "payload");

    let mut make = ws.make();
    register_copy(&mut make, &ws);

    let foo = ws.path("foo");
    let early = ws.path("early");
    make.step("early", [early.clone()], move |context: &mut StepContext| {
        context.require(foo.as_str())?;
        context.shell(["cp", foo.as_str(), early.as_str()])
    })
    .unwrap();

    let foo = ws.path("foo");
    let early = ws.path("early");
    let late = ws.path("late");
    make.step("late", [late.clone()], move |context: &mut StepContext| {
        context.require(early.as_str())?;
        context.sync()?;
        // By now `foo` is already up to date; requiring it must still
        // record the producer relationship, or the persisted sub-steps
        // would depend on scheduling.
        context.require(foo.as_str())?;
        context.shell(["cp", foo.as_str(), late.as_str()])
    })
    .unwrap();

    let report = make.build(&[&ws.path("late")]).unwrap();
    assert_eq!(report.actions, 3);
    let record = ws.read(".dynamake/late.actions.yaml");
    assert!(record.contains("step: early"), "{record}");
    assert!(record.contains("step: copy"), "{record}");

    let report = make.build(&[&ws.path("late")]).unwrap();
    assert_eq!(report.actions, 0);
}

/// A two-action step whose second action changes between runs: the first
/// action is skippable, so the step must restart and run both.
fn make_two_phase(ws: &Workspace, greeting: &str) -> Make {
    let mut make = ws.make();
    let source = ws.path("in");
    let first = ws.path("out1");
    let second = ws.path("out2");
    let greeting = greeting.to_owned();
    make.step(
        "two_phase",
        [first.clone(), second.clone()],
        move |context: &mut StepContext| {
            context.require(source.as_str())?;
            context.shell(["cp", source.as_str(), first.as_str()])?;
            context.shell([format!("echo {greeting} > {second}")])
        },
    )
    .unwrap();
    make
}

#[test]
fn test_restart_runs_all_actions() {
    let ws = Workspace::new();
    ws.write("in", "x");
    let target = ws.path("out2");

    let report = make_two_phase(&ws, "one").build(&[&target]).unwrap();
    assert_eq!(report.actions, 2);
    assert_eq!(ws.read("out2"), "one\n");

    // Only the second action changed, but after the restart both actions
    // run unconditionally.
    let report = make_two_phase(&ws, "two").build(&[&target]).unwrap();
    assert_eq!(report.actions, 2);
    assert_eq!(ws.read("out2"), "two\n");

    let report = make_two_phase(&ws, "two").build(&[&target]).unwrap();
    assert_eq!(report.actions, 0);
    assert_eq!(report.skipped, 2);
}

#[test]
fn test_optional_input_may_be_absent() {
    let ws = Workspace::new();
    ws.write("present", "data");

    let mut make = ws.make();
    let present = ws.path("present");
    let absent = ws.path("absent");
    let output = ws.path("out");
    make.step("tolerant", [output.clone()], move |context: &mut StepContext| {
        context.require(dynamake::optional(absent.as_str()))?;
        context.require(present.as_str())?;
        context.shell(["cp", present.as_str(), output.as_str()])
    })
    .unwrap();

    let report = make.build(&[&ws.path("out")]).unwrap();
    assert_eq!(report.actions, 1);
    assert_eq!(ws.read("out"), "data");
}

#[test]
fn test_sub_step_results_are_shared() {
    let ws = Workspace::new();
    ws.write("bar", "payload");

    let mut make = ws.make();
    register_copy(&mut make, &ws);

    // Two dependents of the same file: the copy step runs once.
    let root = ws.root();
    let foo = ws.path("foo");
    make.step(
        "use",
        [format!("{root}/use-{{*name}}.txt")],
        move |context: &mut StepContext| {
            let name = context.binding("name")?.to_owned();
            let target = format!("{root}/use-{name}.txt");
            context.require(foo.as_str())?;
            context.shell(["cp", foo.as_str(), target.as_str()])
        },
    )
    .unwrap();

    let first = ws.path("use-a.txt");
    let second = ws.path("use-b.txt");
    let report = make.build(&[&first, &second]).unwrap();
    assert_eq!(report.actions, 3);
    assert_eq!(ws.read("use-a.txt"), "payload");
    assert_eq!(ws.read("use-b.txt"), "payload");
}
