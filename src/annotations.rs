//! # Annotated Paths
//!
//! Build steps describe their inputs and outputs as path strings, but a bare
//! string cannot express *how* a path participates in the build: whether it
//! is allowed to be missing, whether only its existence matters, whether it
//! must survive failures. Rather than subclassing strings, this module pairs
//! a path value with a small set of flags and makes sure every
//! string-producing helper in the engine (formatting, globbing, extraction)
//! carries the flags along.
//!
//! ## Annotations
//!
//! - **`optional`**: the path is allowed not to exist, as an input before an
//!   action runs or as an output after it.
//! - **`exists`**: only existence matters; the modification time is ignored.
//!   Directories should be annotated this way because their modification
//!   time is unreliable.
//! - **`precious`**: the path is never deleted, neither as a stale output
//!   before an action nor as a failed output after one.
//! - **`phony`**: the path is not a disk file at all. Phony outputs force
//!   their step to run; phony argument segments are excluded from action
//!   fingerprints.
//! - **`emphasized`**: the segment is rendered in bold when a command line
//!   is logged, to make the interesting parts stand out of the flag soup.

use std::fmt;

use console::style;

use crate::error::{Error, Result};

/// The set of flags a path (or command-line segment) may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Annotations {
    /// Allowed not to exist.
    pub optional: bool,
    /// Only existence matters, not the modification time.
    pub exists: bool,
    /// Never deleted by the engine.
    pub precious: bool,
    /// Not a disk file.
    pub phony: bool,
    /// Rendered in bold in logged command lines.
    pub emphasized: bool,
}

/// A path string together with its annotations.
///
/// # Examples
///
/// ```
/// use dynamake::annotations::{optional, precious, APath};
///
/// let plain = APath::from("obj/a.o");
/// assert!(!plain.is_optional());
///
/// let log = precious(optional("build.log"));
/// assert!(log.is_optional());
/// assert!(log.is_precious());
/// assert_eq!(log.as_str(), "build.log");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct APath {
    value: String,
    annotations: Annotations,
}

impl APath {
    /// Create a plain, un-annotated path.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            annotations: Annotations::default(),
        }
    }

    /// The path string itself.
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// The annotations carried by this path.
    pub fn annotations(&self) -> Annotations {
        self.annotations
    }

    /// Produce a new value carrying this path's annotations.
    ///
    /// Every transform in the engine (formatting a pattern, expanding a
    /// glob, extracting a template) funnels through this so annotations are
    /// never lost along the way.
    pub fn copy_annotations_to(&self, value: impl Into<String>) -> APath {
        APath {
            value: value.into(),
            annotations: self.annotations,
        }
    }

    /// Merge the other path's annotations into this one's.
    pub fn merge_annotations(mut self, other: Annotations) -> APath {
        self.annotations.optional |= other.optional;
        self.annotations.exists |= other.exists;
        self.annotations.precious |= other.precious;
        self.annotations.phony |= other.phony;
        self.annotations.emphasized |= other.emphasized;
        self
    }

    pub fn is_optional(&self) -> bool {
        self.annotations.optional
    }

    pub fn is_exists(&self) -> bool {
        self.annotations.exists
    }

    pub fn is_precious(&self) -> bool {
        self.annotations.precious
    }

    pub fn is_phony(&self) -> bool {
        self.annotations.phony
    }

    pub fn is_emphasized(&self) -> bool {
        self.annotations.emphasized
    }

    /// Render for a logged command line, applying the `emphasized` style.
    pub fn colored(&self) -> String {
        if self.annotations.emphasized {
            style(&self.value).bold().to_string()
        } else {
            self.value.clone()
        }
    }
}

impl fmt::Display for APath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl AsRef<str> for APath {
    fn as_ref(&self) -> &str {
        &self.value
    }
}

impl From<&str> for APath {
    fn from(value: &str) -> Self {
        APath::new(value)
    }
}

impl From<String> for APath {
    fn from(value: String) -> Self {
        APath::new(value)
    }
}

impl From<&APath> for APath {
    fn from(value: &APath) -> Self {
        value.clone()
    }
}

/// Annotate a path as allowed not to exist.
pub fn optional(path: impl Into<APath>) -> APath {
    let mut path = path.into();
    path.annotations.optional = true;
    path
}

/// Annotate a path as exist-only: it must exist but its modification time is
/// ignored.
pub fn exists(path: impl Into<APath>) -> APath {
    let mut path = path.into();
    path.annotations.exists = true;
    path
}

/// Annotate a path as precious: it is never deleted, neither as a stale
/// output before an action is run nor as a failed output afterwards.
pub fn precious(path: impl Into<APath>) -> APath {
    let mut path = path.into();
    path.annotations.precious = true;
    path
}

/// Annotate a target as phony: it is not a disk file. A phony output causes
/// the step to always run its actions; a phony command-line segment is
/// excluded from the action fingerprint.
pub fn phony(path: impl Into<APath>) -> APath {
    let mut path = path.into();
    path.annotations.phony = true;
    path
}

/// Annotate a command-line segment as emphasized, so it is rendered in bold
/// when the command is logged.
pub fn emphasized(path: impl Into<APath>) -> APath {
    let mut path = path.into();
    path.annotations.emphasized = true;
    path
}

/// Return a clean and hopefully canonical form of a path.
///
/// Patterns are matched textually, so paths must be in a canonical textual
/// form: repeated `/` are collapsed, `./` prefixes and trailing `/` are
/// stripped. An empty path is invalid.
pub fn clean_path(path: impl Into<APath>) -> Result<APath> {
    let path = path.into();
    let mut value = path.as_str().to_owned();
    while value.contains("//") {
        value = value.replace("//", "/");
    }
    while let Some(rest) = value.strip_prefix("./") {
        value = rest.to_owned();
    }
    while value.len() > 1 && value.ends_with('/') {
        value.pop();
    }
    if value.is_empty() {
        return Err(Error::Config {
            message: format!("Invalid empty path: {}", path.as_str()),
        });
    }
    Ok(path.copy_annotations_to(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotations_accumulate() {
        let path = precious(optional("log.txt"));
        assert!(path.is_optional());
        assert!(path.is_precious());
        assert!(!path.is_phony());
        assert!(!path.is_exists());
    }

    #[test]
    fn test_copy_annotations() {
        let pattern = optional(exists("out/{*name}.txt"));
        let path = pattern.copy_annotations_to("out/a.txt");
        assert_eq!(path.as_str(), "out/a.txt");
        assert!(path.is_optional());
        assert!(path.is_exists());
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("a//b///c").unwrap().as_str(), "a/b/c");
        assert_eq!(clean_path("./a/b").unwrap().as_str(), "a/b");
        assert_eq!(clean_path("a/b/").unwrap().as_str(), "a/b");
        assert_eq!(clean_path("/").unwrap().as_str(), "/");
        assert!(clean_path("").is_err());
    }

    #[test]
    fn test_clean_path_keeps_annotations() {
        let path = clean_path(phony("all//")).unwrap();
        assert_eq!(path.as_str(), "all");
        assert!(path.is_phony());
    }
}
