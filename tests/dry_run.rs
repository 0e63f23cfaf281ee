//! Tests for `no_actions`: the build stops at the first action that would
//! have to run, leaving the filesystem and persistent state untouched.

mod common;

use common::Workspace;
use dynamake::{Make, StepContext};

fn register_chain(make: &mut Make, ws: &Workspace) {
    let source = ws.path("source");
    let middle = ws.path("middle");
    make.step("first", [middle.clone()], move |context: &mut StepContext| {
        context.require(source.as_str())?;
        context.shell(["cp", source.as_str(), middle.as_str()])
    })
    .unwrap();

    let middle = ws.path("middle");
    let last = ws.path("last");
    make.step("second", [last.clone()], move |context: &mut StepContext| {
        context.require(middle.as_str())?;
        context.shell(["cp", middle.as_str(), last.as_str()])
    })
    .unwrap();
}

#[test]
fn test_dry_run_stops_before_first_action() {
    let ws = Workspace::new();
    ws.write("source", "data");

    let mut make = ws.make();
    make.params_mut().override_from("no_actions", "true").unwrap();
    register_chain(&mut make, &ws);

    let report = make.build(&[&ws.path("last")]).unwrap();
    assert!(report.dry_stopped);
    assert_eq!(report.actions, 0);
    assert!(!ws.exists("middle"));
    assert!(!ws.exists("last"));
    assert!(!ws.has_record("first"));
    assert!(!ws.has_record("second"));
}

#[test]
fn test_dry_run_after_full_build_is_quiet() {
    let ws = Workspace::new();
    ws.write("source", "data");

    let mut make = ws.make();
    register_chain(&mut make, &ws);
    assert_eq!(make.build(&[&ws.path("last")]).unwrap().actions, 2);

    // Everything is up to date: the dry run completes without stopping.
    let mut make = ws.make();
    make.params_mut().override_from("no_actions", "true").unwrap();
    register_chain(&mut make, &ws);
    let report = make.build(&[&ws.path("last")]).unwrap();
    assert!(!report.dry_stopped);
    assert_eq!(report.actions, 0);
    assert_eq!(report.skipped, 2);
}
