// SPDX-License-Identifier: GPL-2.0

//! The append-only crash registry.
//!
//! `crash.db` holds one semicolon-separated line per unique fingerprint.
//! Several fuzzer processes append to the same file, so the read-then-
//! append runs under an exclusive advisory lock; a hash that is already
//! present is silently suppressed.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::debug;
use rustix::fs::{flock, FlockOperation};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashDbEntry {
    pub fuzzer: String,
    pub vm_name: String,
    pub fs_kind: String,
    pub fs_size: String,
    /// Engine tag, with the radamsa seed when there is one.
    pub engine: String,
    pub panic_label: String,
    pub stack_hash: String,
    pub crash_dir: PathBuf,
    pub runtime: String,
    pub iteration: u64,
}

impl CrashDbEntry {
    pub fn to_line(&self) -> String {
        format!(
            "{}; {}; {}; {}; {}; {}; {}; {}; {}; {}\n",
            self.fuzzer,
            self.vm_name,
            self.fs_kind,
            self.fs_size,
            self.engine,
            self.panic_label,
            self.stack_hash,
            self.crash_dir.display(),
            self.runtime,
            self.iteration,
        )
    }

    pub fn parse(line: &str) -> Option<CrashDbEntry> {
        let fields: Vec<&str> = line.trim_end().split("; ").collect();
        if fields.len() != 10 {
            return None;
        }
        Some(CrashDbEntry {
            fuzzer: fields[0].to_string(),
            vm_name: fields[1].to_string(),
            fs_kind: fields[2].to_string(),
            fs_size: fields[3].to_string(),
            engine: fields[4].to_string(),
            panic_label: fields[5].to_string(),
            stack_hash: fields[6].to_string(),
            crash_dir: PathBuf::from(fields[7]),
            runtime: fields[8].to_string(),
            iteration: fields[9].trim().parse().ok()?,
        })
    }
}

pub struct CrashDb {
    path: PathBuf,
}

impl CrashDb {
    pub fn new(path: &Path) -> Self {
        CrashDb { path: path.to_path_buf() }
    }

    /// Parse every well-formed line.
    pub fn entries(&self) -> Result<Vec<CrashDbEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(contents.lines().filter_map(CrashDbEntry::parse).collect())
    }

    /// Append `entry` unless its hash is already present. Returns whether
    /// the line was written. The whole read-check-append runs locked.
    pub fn append_if_new(&self, entry: &CrashDbEntry) -> Result<bool> {
        let mut file = File::options()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)?;
        flock(&file, FlockOperation::LockExclusive).map_err(std::io::Error::from)?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        if contents.contains(&entry.stack_hash) {
            debug!("fingerprint {} already recorded", entry.stack_hash);
            return Ok(false);
        }

        file.write_all(entry.to_line().as_bytes())?;
        Ok(true)
        // lock released on close
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestTempDir;

    fn entry(hash: &str) -> CrashDbEntry {
        CrashDbEntry {
            fuzzer: "fuzz1".into(),
            vm_name: "fuzzBox".into(),
            fs_kind: "ufs2".into(),
            fs_size: "20MB".into(),
            engine: "radamsa (seed: 633825300114114700748351602688)".into(),
            panic_label: "ffs_valloc".into(),
            stack_hash: hash.into(),
            crash_dir: PathBuf::from("/work/crash_dumps/2026-07-01T10_00_00_ffs_valloc"),
            runtime: "1:23:45".into(),
            iteration: 512,
        }
    }

    #[test]
    fn line_round_trips() {
        let e = entry("ab12");
        let parsed = CrashDbEntry::parse(&e.to_line()).unwrap();
        assert_eq!(parsed, e);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        assert!(CrashDbEntry::parse("too; few; fields").is_none());
    }

    #[test]
    fn duplicate_hashes_append_exactly_once() {
        let dir = TestTempDir::new("crashdb-dedup");
        let db = CrashDb::new(&dir.path().join("crash.db"));

        assert!(db.append_if_new(&entry("deadbeef")).unwrap());
        assert!(!db.append_if_new(&entry("deadbeef")).unwrap());
        assert!(db.append_if_new(&entry("cafef00d")).unwrap());

        let entries = db.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].stack_hash, "deadbeef");
        assert_eq!(entries[1].stack_hash, "cafef00d");
    }

    #[test]
    fn missing_db_reads_as_empty() {
        let dir = TestTempDir::new("crashdb-empty");
        let db = CrashDb::new(&dir.path().join("crash.db"));
        assert!(db.entries().unwrap().is_empty());
    }
}
