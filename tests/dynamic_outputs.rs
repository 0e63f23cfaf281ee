//! Tests for dynamic outputs: steps whose concrete output set is only
//! learned after execution, declared with non-captured wildcard holes and
//! discovered by globbing.

mod common;

use common::Workspace;
use dynamake::StepContext;

/// Register the extraction step: `files/X/.all.done` unpacks the entries
/// listed in `lists/X.txt` into `files/X/`, one `.txt` file per entry.
fn register_extract(make: &mut dynamake::Make, root: &str) {
    let list_root = root.to_owned();
    make.step(
        "extract",
        [
            format!("{root}/files/{{*name}}/{{**_file}}"),
            format!("{root}/files/{{*name}}/.all.done"),
        ],
        move |context: &mut StepContext| {
            let name = context.binding("name")?.to_owned();
            let list = format!("{list_root}/lists/{name}.txt");
            context.require(list.as_str())?;
            context.sync()?;

            // Dynamic dependencies: the output set comes from the list
            // file's contents.
            let entries = std::fs::read_to_string(&list)?;
            let target_dir = format!("{list_root}/files/{name}");
            let mut script = format!("mkdir -p {target_dir}");
            for entry in entries.split_whitespace() {
                script.push_str(&format!(" && echo {entry} > {target_dir}/{entry}.txt"));
            }
            script.push_str(&format!(" && touch {target_dir}/.all.done"));
            context.shell([script.as_str()])
        },
    )
    .unwrap();
}

#[test]
fn test_extract_and_reuse() {
    let ws = Workspace::new();
    ws.write("lists/x.txt", "one two three");
    let root = ws.root();

    let mut make = ws.make();
    register_extract(&mut make, &root);

    let target = ws.path("files/x/.all.done");
    let report = make.build(&[&target]).unwrap();
    assert_eq!(report.actions, 1);
    for entry in ["one", "two", "three"] {
        assert_eq!(ws.read(&format!("files/x/{entry}.txt")), format!("{entry}\n"));
    }
    assert!(ws.exists("files/x/.all.done"));

    // A second invocation runs zero actions.
    let report = make.build(&[&target]).unwrap();
    assert_eq!(report.actions, 0);
}

#[test]
fn test_downstream_glob_observes_every_file() {
    let ws = Workspace::new();
    ws.write("lists/x.txt", "alpha beta");
    let root = ws.root();

    let mut make = ws.make();
    register_extract(&mut make, &root);

    let sum_root = root.clone();
    make.step(
        "summarize",
        [format!("{root}/sums/{{*name}}.txt")],
        move |context: &mut StepContext| {
            let name = context.binding("name")?.to_owned();
            context.require(format!("{sum_root}/files/{name}/.all.done"))?;
            context.sync()?;

            let parts = context.glob_paths(format!("{sum_root}/files/{name}/{{*part}}.txt"))?;
            let mut script = format!("mkdir -p {sum_root}/sums && cat");
            for part in &parts {
                script.push_str(&format!(" {part}"));
            }
            script.push_str(&format!(" > {sum_root}/sums/{name}.txt"));
            context.shell([script.as_str()])
        },
    )
    .unwrap();

    let target = ws.path("sums/x.txt");
    let report = make.build(&[&target]).unwrap();
    assert_eq!(report.actions, 2);
    assert_eq!(ws.read("sums/x.txt"), "alpha\nbeta\n");

    let report = make.build(&[&target]).unwrap();
    assert_eq!(report.actions, 0);
}

#[test]
fn test_new_list_entry_rebuilds() {
    let ws = Workspace::new();
    ws.write("lists/x.txt", "one");
    let root = ws.root();

    let mut make = ws.make();
    register_extract(&mut make, &root);

    let target = ws.path("files/x/.all.done");
    assert_eq!(make.build(&[&target]).unwrap().actions, 1);

    // Growing the list changes both the list's time and the command.
    ws.write("lists/x.txt", "one two");
    assert_eq!(make.build(&[&target]).unwrap().actions, 1);
    assert!(ws.exists("files/x/two.txt"));

    assert_eq!(make.build(&[&target]).unwrap().actions, 0);
}
