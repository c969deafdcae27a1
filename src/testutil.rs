//! Shared test fixtures: self-cleaning temp dirs, synthetic filesystem
//! images assembled from the layout descriptors, and a scripted guest
//! transport.

use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::fs::layout::{self, EXT_MAGIC, UFS_MAGIC, ZFS_MAGIC};
use crate::fs::FsKind;
use crate::guest::{ExecReply, GuestTransport};

pub struct TestTempDir {
    path: PathBuf,
}

impl TestTempDir {
    pub fn new(name: &str) -> Self {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!(
            "fsfuzz-{}-{}-{}",
            std::process::id(),
            name,
            ts
        ));
        fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TestTempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// A plausible UFS2 superblock record: nonzero field soup with the magic in
/// its place as the last field.
fn ufs_record() -> Vec<u8> {
    let mut rec = vec![0xa5u8; layout::record_len(FsKind::Ufs2)];
    let (off, _) = layout::offset_of(FsKind::Ufs2, "fs_magic").unwrap();
    rec[off as usize..off as usize + 4].copy_from_slice(UFS_MAGIC);
    rec
}

/// Write a UFS2 image with the primary superblock at 65536 plus copies at
/// `backups`. Returns the image path.
pub fn ufs2_image(dir: &Path, size: usize, backups: &[usize]) -> PathBuf {
    let mut data = vec![0u8; size];
    let rec = ufs_record();
    for &off in [65536usize].iter().chain(backups) {
        data[off..off + rec.len()].copy_from_slice(&rec);
    }
    let path = dir.join("fuzz1_ufs2_20MB");
    fs::write(&path, &data).unwrap();
    path
}

/// Write an ext image with the primary superblock at 1024 plus copies at
/// `backups`, all carrying `uuid`.
pub fn ext_image(dir: &Path, size: usize, uuid: [u8; 16], backups: &[usize]) -> PathBuf {
    let mut rec = vec![0u8; layout::record_len(FsKind::Ext2)];
    rec[56..58].copy_from_slice(EXT_MAGIC);
    rec[104..120].copy_from_slice(&uuid);

    let mut data = vec![0u8; size];
    for &off in [1024usize].iter().chain(backups) {
        data[off..off + rec.len()].copy_from_slice(&rec);
    }
    let path = dir.join("fuzz1_ext2_10MB");
    fs::write(&path, &data).unwrap();
    path
}

/// Write a ZFS image with uberblocks at the given offsets.
pub fn zfs_image(dir: &Path, size: usize, offsets: &[usize]) -> PathBuf {
    let mut rec = vec![0x5au8; layout::record_len(FsKind::Zfs)];
    rec[..8].copy_from_slice(ZFS_MAGIC);

    let mut data = vec![0u8; size];
    for &off in offsets {
        data[off..off + rec.len()].copy_from_slice(&rec);
    }
    let path = dir.join("fuzz1_zfs_4MB");
    fs::write(&path, &data).unwrap();
    path
}

/// Guest transport double: replies are looked up by substring of the issued
/// command, every call is recorded.
#[derive(Default)]
pub struct FakeTransport {
    replies: RefCell<Vec<(String, ExecReply)>>,
    pub commands: RefCell<Vec<String>>,
    pub alive: Cell<bool>,
    pub copied_to_guest: RefCell<Vec<PathBuf>>,
    pub copied_to_host: RefCell<Vec<String>>,
    pub snapshots_restored: RefCell<Vec<String>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        let t = FakeTransport::default();
        t.alive.set(true);
        t
    }

    /// Script a reply for any command containing `pattern`. First match
    /// wins; unscripted commands return `Empty` (success for mutating
    /// commands).
    pub fn reply(&self, pattern: &str, reply: ExecReply) {
        self.replies.borrow_mut().push((pattern.to_string(), reply));
    }
}

impl GuestTransport for FakeTransport {
    fn exec(&self, cmd: &str, _timeout: Duration) -> ExecReply {
        self.commands.borrow_mut().push(cmd.to_string());
        for (pattern, reply) in self.replies.borrow().iter() {
            if cmd.contains(pattern.as_str()) {
                return reply.clone();
            }
        }
        ExecReply::Empty
    }

    fn copy_to_guest(&self, local_files: &[PathBuf], _remote_dir: &str) -> Result<()> {
        self.copied_to_guest.borrow_mut().extend(local_files.iter().cloned());
        Ok(())
    }

    fn copy_to_host(&self, remote_files: &[String], local_dir: &Path) -> Result<()> {
        for f in remote_files {
            self.copied_to_host.borrow_mut().push(f.clone());
            let name = f.rsplit('/').next().unwrap_or(f);
            fs::write(local_dir.join(name), b"fake").ok();
        }
        Ok(())
    }

    fn liveness(&self) -> bool {
        self.alive.get()
    }

    fn restore_snapshot(&self, name: &str) -> Result<()> {
        self.snapshots_restored.borrow_mut().push(name.to_string());
        self.alive.set(true);
        Ok(())
    }

    fn current_snapshot(&self) -> Option<String> {
        Some("base".to_string())
    }

    fn reset(&self) -> Result<()> {
        self.alive.set(true);
        Ok(())
    }

    fn boot(&self) -> Result<()> {
        self.alive.set(true);
        Ok(())
    }
}
