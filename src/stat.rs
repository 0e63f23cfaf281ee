//! # Stat Cache
//!
//! The up-to-date decision layer asks for the existence and modification
//! time of the same paths over and over. This module caches `stat` results
//! so each path is examined at most once between invalidations.
//!
//! Entries are populated lazily and never expire on their own; the engine
//! explicitly forgets paths whenever an action completes (every path matched
//! by the completed step's output patterns) and whenever it touches or
//! removes a path itself. Forgetting a directory forgets everything under
//! it, which is why the cache is kept in an ordered map: the paths below a
//! directory form a contiguous key range.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::debug;

use crate::error::{Error, Result};

/// The cached facts about one existing path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStat {
    /// Modification time in nanoseconds since the epoch.
    pub mtime_ns: i64,
    /// Whether the path is a directory.
    pub is_dir: bool,
}

/// Nanoseconds since the epoch for a `SystemTime`.
pub fn nanoseconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_nanos() as i64,
        Err(_) => 0,
    }
}

/// The current time in nanoseconds since the epoch.
pub fn now_nanoseconds() -> i64 {
    nanoseconds(SystemTime::now())
}

/// A lazily-populated cache of `stat` results.
///
/// A `None` value is the "missing" sentinel: the path was examined and did
/// not exist.
#[derive(Debug, Default)]
pub struct StatCache {
    cache: BTreeMap<String, Option<PathStat>>,
}

impl StatCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&mut self, path: &str) -> Option<PathStat> {
        if let Some(cached) = self.cache.get(path) {
            return *cached;
        }
        let result = match fs::metadata(path) {
            Ok(metadata) => {
                let mtime = metadata.modified().unwrap_or(UNIX_EPOCH);
                Some(PathStat {
                    mtime_ns: nanoseconds(mtime),
                    is_dir: metadata.is_dir(),
                })
            }
            Err(_) => None,
        };
        self.cache.insert(path.to_owned(), result);
        result
    }

    /// The stat data for a path, or an error when it does not exist.
    pub fn stat(&mut self, path: &str) -> Result<PathStat> {
        self.lookup(path).ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("No such file: {path}"),
            ))
        })
    }

    /// The stat data for a path, or `None` when it does not exist.
    pub fn try_stat(&mut self, path: &str) -> Option<PathStat> {
        self.lookup(path)
    }

    /// Whether a path exists on disk.
    pub fn exists(&mut self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    /// Forget the cached data about a path. If it is a directory, also
    /// forget everything under it.
    pub fn forget(&mut self, path: &str) {
        self.cache.remove(path);
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let below: Vec<String> = self
            .cache
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in below {
            self.cache.remove(&key);
        }
    }

    /// Set the modification time of an existing path and forget its cached
    /// data.
    pub fn touch(&mut self, path: &str, mtime_ns: i64) -> Result<()> {
        let file = fs::File::open(path)?;
        file.set_modified(UNIX_EPOCH + Duration::from_nanos(mtime_ns.max(0) as u64))?;
        self.forget(path);
        Ok(())
    }

    /// Remove a path (file or directory tree) and forget its cached data.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let result = match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(_) if fs::metadata(path).map(|meta| meta.is_dir()).unwrap_or(false) => {
                fs::remove_dir_all(path)
            }
            Err(error) => Err(error),
        };
        self.forget(path);
        result.map_err(Error::Io)
    }

    /// Remove a directory if it is empty and forget its cached data. Fails
    /// when the directory is not empty.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        fs::remove_dir(path)?;
        debug!(target: "file", "Remove the empty directory: {path}");
        self.forget(path);
        Ok(())
    }
}
