//! # Action Runner
//!
//! Launches the external commands of build steps and routes their output
//! into the logging layer. A `shell` action hands the whole command line to
//! `/bin/sh -c` (the caller is responsible for quoting); a `spawn` action
//! executes the program directly with its argument vector.
//!
//! Child standard output and standard error are read line by line on small
//! reader threads and logged under the `stdout`/`stderr` targets, each line
//! tagged with the step instance that produced it, so interleaved output of
//! parallel actions can still be attributed.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;

use log::info;

use crate::annotations::APath;
use crate::error::{Error, Result};

/// How a command is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Joined into one string and run via `/bin/sh -c`.
    Shell,
    /// Executed directly with its argument vector.
    Spawn,
}

/// A launched external command with its output readers.
pub struct RunningAction {
    child: Child,
    readers: Vec<JoinHandle<()>>,
}

impl RunningAction {
    /// Wait for the command to exit and for its output to drain.
    pub fn wait(mut self) -> Result<ExitStatus> {
        let status = self.child.wait()?;
        for reader in self.readers {
            let _ = reader.join();
        }
        Ok(status)
    }
}

/// Launch an external command, tagging its output lines with `label`.
pub fn launch(kind: Kind, argv: &[APath], label: &str) -> Result<RunningAction> {
    if argv.is_empty() {
        return Err(Error::Config {
            message: "Cannot run an empty command".to_owned(),
        });
    }

    let mut command = match kind {
        Kind::Shell => {
            let joined = argv
                .iter()
                .map(APath::as_str)
                .collect::<Vec<_>>()
                .join(" ");
            let mut command = Command::new("/bin/sh");
            command.arg("-c").arg(joined);
            command
        }
        Kind::Spawn => {
            let mut command = Command::new(argv[0].as_str());
            command.args(argv[1..].iter().map(APath::as_str));
            command
        }
    };
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|error| Error::ActionFailed {
        command: format!("{}: {error}", render_command(kind, argv)),
    })?;

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(frame_lines(stdout, "stdout", label.to_owned()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(frame_lines(stderr, "stderr", label.to_owned()));
    }

    Ok(RunningAction { child, readers })
}

fn frame_lines(
    stream: impl std::io::Read + Send + 'static,
    target: &'static str,
    label: String,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            match line {
                Ok(line) => info!(target: target, "{label} - {line}"),
                Err(_) => break,
            }
        }
    })
}

/// Quote a word for display in a logged `spawn` command line.
fn quote(word: &str) -> String {
    let safe = word
        .chars()
        .all(|char| char.is_ascii_alphanumeric() || "_-./=@%+:,".contains(char));
    if safe && !word.is_empty() {
        word.to_owned()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Render a command line for logging, applying the `emphasized` style and
/// quoting `spawn` arguments the way a shell would expect them.
pub fn render_command(kind: Kind, argv: &[APath]) -> String {
    argv.iter()
        .map(|word| match kind {
            Kind::Shell => word.colored(),
            Kind::Spawn => word.copy_annotations_to(quote(word.as_str())).colored(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(words: &[&str]) -> Vec<APath> {
        words.iter().map(|word| APath::from(*word)).collect()
    }

    #[test]
    fn test_shell_runs_and_exits() {
        let action = launch(Kind::Shell, &argv(&["exit", "0"]), "test").unwrap();
        assert!(action.wait().unwrap().success());

        let action = launch(Kind::Shell, &argv(&["exit", "1"]), "test").unwrap();
        assert_eq!(action.wait().unwrap().code(), Some(1));
    }

    #[test]
    fn test_spawn_runs_directly() {
        let action = launch(Kind::Spawn, &argv(&["true"]), "test").unwrap();
        assert!(action.wait().unwrap().success());

        let action = launch(Kind::Spawn, &argv(&["false"]), "test").unwrap();
        assert!(!action.wait().unwrap().success());
    }

    #[test]
    fn test_spawn_missing_program() {
        let result = launch(Kind::Spawn, &argv(&["/no/such/program"]), "test");
        assert!(matches!(result, Err(Error::ActionFailed { .. })));
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(launch(Kind::Shell, &[], "test").is_err());
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain-word.txt"), "plain-word.txt");
        assert_eq!(quote("two words"), "'two words'");
        assert_eq!(quote("don't"), r"'don'\''t'");
    }
}
