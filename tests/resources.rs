//! Tests for resource-gated action admission.

mod common;

use common::Workspace;
use dynamake::params::Value;
use dynamake::{Make, ParamKind, StepContext, StepConfig};

/// Three independent steps, each drawing 60 of a 100-unit budget: no two of
/// their actions may overlap. Each action records how many other actions
/// were live when it started.
#[test]
fn test_resource_cap_serializes_actions() {
    let ws = Workspace::new();
    ws.write("live/.keep", "");
    let root = ws.root();

    let mut make = ws.make();
    make.parameter("ram", ParamKind::Int, Value::from(100_i64), "RAM budget")
        .unwrap();
    make.resource_parameters(&[("ram", 10)]).unwrap();

    for name in ["one", "two", "three"] {
        let root = root.clone();
        let output = ws.path(&format!("out-{name}"));
        make.step(name, [output.clone()], move |context: &mut StepContext| {
            let script = format!(
                "ls {root}/live | grep -v keep | wc -l >> {root}/observed && \
                 touch {root}/live/{name} && sleep 0.2 && rm {root}/live/{name} && \
                 touch {root}/out-{name}"
            );
            context.shell_with([script.as_str()], &[("ram", 60)])
        })
        .unwrap();
    }

    let targets = [ws.path("out-one"), ws.path("out-two"), ws.path("out-three")];
    let targets: Vec<&str> = targets.iter().map(String::as_str).collect();
    let report = make.build(&targets).unwrap();
    assert_eq!(report.actions, 3);

    // Every action observed zero other live actions.
    for line in ws.read("observed").lines() {
        assert_eq!(line.trim(), "0");
    }
    assert_eq!(ws.read("observed").lines().count(), 3);
}

#[test]
fn test_unknown_resource_is_fatal() {
    let ws = Workspace::new();
    let mut make = ws.make();
    let output = ws.path("out");
    make.step("step", [output.clone()], move |context: &mut StepContext| {
        context.shell_with([format!("touch {output}")], &[("quota", 1)])
    })
    .unwrap();

    assert!(make.build(&[&ws.path("out")]).is_err());
}

#[test]
fn test_over_budget_draw_is_fatal() {
    let ws = Workspace::new();
    let mut make = ws.make();
    make.parameter("ram", ParamKind::Int, Value::from(10_i64), "RAM budget")
        .unwrap();
    make.resource_parameters(&[("ram", 1)]).unwrap();

    let output = ws.path("out");
    make.step("greedy", [output.clone()], move |context: &mut StepContext| {
        context.shell_with([format!("touch {output}")], &[("ram", 60)])
    })
    .unwrap();

    assert!(make.build(&[&ws.path("out")]).is_err());
}

#[test]
fn test_default_draw_over_budget_rejected_at_build() {
    let ws = Workspace::new();
    let mut make = ws.make();
    make.parameter("ram", ParamKind::Int, Value::from(10_i64), "RAM budget")
        .unwrap();
    make.resource_parameters(&[("ram", 60)]).unwrap();
    assert!(make.build::<&str>(&[]).is_err());
}

#[test]
fn test_step_default_resources_apply() {
    let ws = Workspace::new();
    ws.write("live/.keep", "");
    let root = ws.root();

    let mut make = ws.make();
    make.parameter("slots", ParamKind::Int, Value::from(1_i64), "slots")
        .unwrap();
    make.resource_parameters(&[("slots", 0)]).unwrap();

    // Both steps declare a default draw of the whole budget, so their
    // actions are serialized even without per-action requests.
    for name in ["left", "right"] {
        let root = root.clone();
        let output = ws.path(&format!("out-{name}"));
        make.step_with(
            name,
            [output.clone()],
            StepConfig {
                resources: vec![("slots".to_owned(), 1)],
                ..StepConfig::default()
            },
            move |context: &mut StepContext| {
                let script = format!(
                    "ls {root}/live | grep -v keep | wc -l >> {root}/observed && \
                     touch {root}/live/{name} && sleep 0.1 && rm {root}/live/{name} && \
                     touch {root}/out-{name}"
                );
                context.shell([script.as_str()])
            },
        )
        .unwrap();
    }

    let targets = [ws.path("out-left"), ws.path("out-right")];
    let targets: Vec<&str> = targets.iter().map(String::as_str).collect();
    make.build(&targets).unwrap();
    for line in ws.read("observed").lines() {
        assert_eq!(line.trim(), "0");
    }
}

#[test]
fn test_serial_jobs() {
    let ws = Workspace::new();
    ws.write("live/.keep", "");
    let root = ws.root();

    let mut make = ws.make();
    make.params_mut().override_from("jobs", "1").unwrap();

    for name in ["a", "b"] {
        let root = root.clone();
        let output = ws.path(&format!("out-{name}"));
        make.step(name, [output.clone()], move |context: &mut StepContext| {
            let script = format!(
                "ls {root}/live | grep -v keep | wc -l >> {root}/observed && \
                 touch {root}/live/{name} && sleep 0.1 && rm {root}/live/{name} && \
                 touch {root}/out-{name}"
            );
            context.shell([script.as_str()])
        })
        .unwrap();
    }

    let targets = [ws.path("out-a"), ws.path("out-b")];
    let targets: Vec<&str> = targets.iter().map(String::as_str).collect();
    make.build(&targets).unwrap();
    for line in ws.read("observed").lines() {
        assert_eq!(line.trim(), "0");
    }
}
