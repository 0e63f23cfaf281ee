//! Shared helpers for the engine integration tests.
//!
//! Each test gets a temporary workspace directory; step output patterns and
//! required paths are absolute paths inside it, and the persistent state
//! directory lives under it too, so tests are fully isolated from each
//! other and from the process working directory.

#![allow(dead_code)]

use std::fs;
use std::path::Path;

use dynamake::Make;

/// A temporary directory with path helpers and a pre-configured engine.
pub struct Workspace {
    dir: assert_fs::TempDir,
}

impl Workspace {
    pub fn new() -> Workspace {
        Workspace {
            dir: assert_fs::TempDir::new().expect("create temporary workspace"),
        }
    }

    /// The absolute workspace root, without a trailing separator.
    pub fn root(&self) -> String {
        self.dir.path().to_string_lossy().into_owned()
    }

    /// The absolute path of a workspace-relative file, as a `String`
    /// suitable for patterns and commands.
    pub fn path(&self, relative: &str) -> String {
        self.dir
            .path()
            .join(relative)
            .to_string_lossy()
            .into_owned()
    }

    /// The persistent state directory used by engines from [`Workspace::make`].
    pub fn state_dir(&self) -> String {
        self.path(".dynamake")
    }

    /// Write a file, creating parent directories as needed.
    pub fn write(&self, relative: &str, content: &str) {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent directories");
        }
        fs::write(path, content).expect("write file");
    }

    /// Rewrite a file so its modification time moves forward.
    pub fn touch(&self, relative: &str) {
        let path = self.dir.path().join(relative);
        let content = fs::read(&path).expect("read file to touch");
        fs::write(&path, content).expect("rewrite file");
    }

    pub fn read(&self, relative: &str) -> String {
        fs::read_to_string(self.dir.path().join(relative)).expect("read file")
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.dir.path().join(relative).exists()
    }

    pub fn mtime_ns(&self, relative: &str) -> i64 {
        let metadata = fs::metadata(self.dir.path().join(relative)).expect("stat file");
        let modified = metadata.modified().expect("modification time");
        modified
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_nanos() as i64)
            .unwrap_or(0)
    }

    /// Whether a persistent record exists for a parameterless step.
    pub fn has_record(&self, step: &str) -> bool {
        Path::new(&self.state_dir())
            .join(format!("{step}.actions.yaml"))
            .exists()
    }

    /// An engine whose persistent state lives inside this workspace.
    pub fn make(&self) -> Make {
        let mut make = Make::new();
        make.params_mut()
            .override_from("persistent_directory", &self.state_dir())
            .expect("set the persistent directory");
        make
    }
}
