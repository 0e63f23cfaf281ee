//! Tests for the failure and cleanup policy: failed outputs are scrubbed
//! unless precious, the previous persistent record survives the failure,
//! and `failure_aborts_build=false` keeps independent branches going.

mod common;

use common::Workspace;
use dynamake::{precious, APath, Make, StepContext};

fn register_failing(make: &mut Make, ws: &Workspace) {
    let result = ws.path("result");
    let log = ws.path("log");
    make.step(
        "failing",
        [APath::from(result.as_str()), precious(log.as_str())],
        move |context: &mut StepContext| {
            context.shell([format!("echo partial > {result} && echo trace > {log} && exit 1")])
        },
    )
    .unwrap();
}

#[test]
fn test_failed_outputs_scrubbed_except_precious() {
    let ws = Workspace::new();
    let mut make = ws.make();
    register_failing(&mut make, &ws);

    let target = ws.path("result");
    assert!(make.build(&[&target]).is_err());

    // The plain output is removed, the precious one survives, and there is
    // no persistent record (the step never succeeded).
    assert!(!ws.exists("result"));
    assert!(ws.exists("log"));
    assert!(!ws.has_record("failing"));
}

#[test]
fn test_failure_keeps_previous_record() {
    let ws = Workspace::new();
    ws.write("mode", "ok");
    let root = ws.root();

    // A step that succeeds or fails depending on a file's content.
    let mut make = ws.make();
    let output = ws.path("out");
    let mode = ws.path("mode");
    make.step("flaky", [output.clone()], move |context: &mut StepContext| {
        context.require(mode.as_str())?;
        context.shell([format!(
            "grep -q ok {root}/mode && echo built > {root}/out"
        )])
    })
    .unwrap();

    let target = ws.path("out");
    assert!(make.build(&[&target]).is_ok());
    let record = ws.read(".dynamake/flaky.actions.yaml");

    // Make it fail; the record written by the successful run is untouched.
    ws.write("mode", "broken");
    assert!(make.build(&[&target]).is_err());
    assert_eq!(ws.read(".dynamake/flaky.actions.yaml"), record);
}

#[test]
fn test_failure_propagates_to_dependents() {
    let ws = Workspace::new();
    let mut make = ws.make();
    register_failing(&mut make, &ws);

    let result = ws.path("result");
    let derived = ws.path("derived");
    make.step("derived", [derived.clone()], move |context: &mut StepContext| {
        context.require(result.as_str())?;
        context.shell(["cp", result.as_str(), derived.as_str()])
    })
    .unwrap();

    assert!(make.build(&[&ws.path("derived")]).is_err());
    assert!(!ws.exists("derived"));
}

#[test]
fn test_continue_mode_builds_independent_branches() {
    let ws = Workspace::new();
    ws.write("src-good", "good");
    let mut make = ws.make();
    make.params_mut()
        .override_from("failure_aborts_build", "false")
        .unwrap();
    register_failing(&mut make, &ws);

    let source = ws.path("src-good");
    let good = ws.path("good");
    make.step("good", [good.clone()], move |context: &mut StepContext| {
        context.require(source.as_str())?;
        context.shell(["cp", source.as_str(), good.as_str()])
    })
    .unwrap();

    // The build as a whole fails, but the independent branch completes.
    let result = make.build(&[&ws.path("result"), &ws.path("good")]);
    assert!(result.is_err());
    assert_eq!(ws.read("good"), "good");
}

#[test]
fn test_missing_output_is_a_failure() {
    let ws = Workspace::new();
    let mut make = ws.make();
    let output = ws.path("never-made");
    make.step("lazy", [output.as_str()], |context: &mut StepContext| {
        context.shell(["true"])
    })
    .unwrap();

    assert!(make.build(&[&ws.path("never-made")]).is_err());
    assert!(!ws.has_record("lazy"));
}

#[test]
fn test_keep_failed_outputs_when_disabled() {
    let ws = Workspace::new();
    let mut make = ws.make();
    make.params_mut()
        .override_from("remove_failed_outputs", "false")
        .unwrap();
    register_failing(&mut make, &ws);

    assert!(make.build(&[&ws.path("result")]).is_err());
    assert!(ws.exists("result"));
    assert!(ws.exists("log"));
}
