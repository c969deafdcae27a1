// SPDX-License-Identifier: GPL-2.0

//! Raw image loading and superblock discovery.
//!
//! `find_all` locates every copy of a superblock in an image. UFS is found
//! by its 4-byte magic (which sits at the *end* of the record), ext by its
//! per-image UUID (the 2-byte ext magic alone is too short to scan for and
//! yields spurious hits), ZFS by the 8-byte uberblock magic.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{FuzzError, Result};
use crate::fs::layout::{
    self, EXT_MAGIC_SB_OFFSET, EXT_UUID_SB_OFFSET,
};
use crate::fs::FsKind;

/// A raw image file held in memory. The file itself is never modified;
/// mutation engines write derived copies under new names.
pub struct Image {
    path: PathBuf,
    data: Vec<u8>,
}

impl Image {
    pub fn open(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        Ok(Image { path: path.to_path_buf(), data })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// One superblock's worth of bytes, addressable by field name.
#[derive(Debug)]
pub struct SuperblockRecord {
    kind: FsKind,
    offset: u64,
    bytes: Vec<u8>,
}

impl SuperblockRecord {
    pub fn kind(&self) -> FsKind {
        self.kind
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Raw bytes of a named field, or `None` for an unknown name.
    pub fn field(&self, name: &str) -> Option<&[u8]> {
        let (off, width) = layout::offset_of(self.kind, name)?;
        self.bytes.get(off as usize..off as usize + width)
    }

    /// Iterate fields in on-disk order.
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, &[u8])> {
        let mut off = 0usize;
        layout::descriptor(self.kind).fields.iter().map(move |field| {
            let slice = &self.bytes[off..off + field.width];
            off += field.width;
            (field.name, slice)
        })
    }
}

/// Read `record_len(kind)` bytes at `offset` into a field-addressable
/// record. A read past end-of-file is a malformed image, not a panic.
pub fn read_record(image: &Image, kind: FsKind, offset: u64) -> Result<SuperblockRecord> {
    let len = layout::record_len(kind);
    let start = offset as usize;
    let bytes = image
        .data()
        .get(start..start + len)
        .ok_or_else(|| FuzzError::MalformedImage { path: image.path().to_path_buf(), offset })?
        .to_vec();
    Ok(SuperblockRecord { kind, offset, bytes })
}

/// Non-overlapping occurrences of `pattern` in `data`, in order.
pub fn find_pattern(data: &[u8], pattern: &[u8]) -> Vec<u64> {
    let mut out = Vec::new();
    if pattern.is_empty() || data.len() < pattern.len() {
        return out;
    }
    let mut i = 0;
    while i + pattern.len() <= data.len() {
        if &data[i..i + pattern.len()] == pattern {
            out.push(i as u64);
            i += pattern.len();
        } else {
            i += 1;
        }
    }
    out
}

/// Whether a candidate record at `offset` fits inside the image.
fn record_fits(image: &Image, kind: FsKind, offset: i64) -> bool {
    offset >= 0 && (offset as u64 + layout::record_len(kind) as u64) <= image.len()
}

/// All superblock offsets of `kind` in the image, in discovery order.
///
/// UFS: the magic is the last field of the record, so each match at byte
/// `m` puts the record at `m - (record_len - 4)`. The first match belongs
/// to the boot block and is dropped; the canonical primary offset is
/// prepended if the scan did not produce it. An image with no usable match
/// still yields the primary offset.
///
/// ext: the primary superblock's UUID anchors a whole-image scan; every
/// hit is checked for the `53 ef` magic at +56 before being accepted.
///
/// ZFS: every uberblock magic match is a candidate. ext and ZFS may
/// legitimately return an empty list.
pub fn find_all(image: &Image, kind: FsKind) -> Result<Vec<u64>> {
    if kind.is_ufs() {
        find_all_ufs(image, kind)
    } else if kind.is_ext() {
        find_all_ext(image, kind)
    } else {
        Ok(find_pattern(image.data(), layout::ZFS_MAGIC)
            .into_iter()
            .filter(|&m| record_fits(image, kind, m as i64))
            .collect())
    }
}

fn find_all_ufs(image: &Image, kind: FsKind) -> Result<Vec<u64>> {
    let desc = layout::descriptor(kind);
    let tail = (desc.record_len - desc.magic.len()) as i64;

    let mut candidates: Vec<i64> = find_pattern(image.data(), desc.magic)
        .into_iter()
        .map(|m| m as i64 - tail)
        .collect();
    if !candidates.is_empty() {
        candidates.remove(0);
    }

    let mut locs: Vec<u64> = candidates
        .into_iter()
        .filter(|&c| record_fits(image, kind, c))
        .map(|c| c as u64)
        .collect();

    // primary_offset is always set for UFS descriptors
    let primary = desc.primary_offset.unwrap_or(0);
    if !locs.contains(&primary) {
        locs.insert(0, primary);
    }
    Ok(locs)
}

fn find_all_ext(image: &Image, kind: FsKind) -> Result<Vec<u64>> {
    let primary = read_record(image, kind, layout::SBLOCK_EXT)?;
    let uuid = primary.field("e2fs_uuid").unwrap_or_default().to_vec();

    let data = image.data();
    let mut locs = Vec::new();
    for m in find_pattern(data, &uuid) {
        let cand = m as i64 - EXT_UUID_SB_OFFSET as i64;
        if !record_fits(image, kind, cand) {
            continue;
        }
        let magic_at = cand as usize + EXT_MAGIC_SB_OFFSET as usize;
        if &data[magic_at..magic_at + layout::EXT_MAGIC.len()] == layout::EXT_MAGIC {
            locs.push(cand as u64);
        }
    }
    Ok(locs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ext_image, ufs2_image, zfs_image, TestTempDir};

    #[test]
    fn ufs2_finds_primary_and_backup() {
        let dir = TestTempDir::new("scan-ufs2");
        let path = ufs2_image(dir.path(), 20 << 20, &[180224]);
        let image = Image::open(&path).unwrap();
        assert_eq!(find_all(&image, FsKind::Ufs2).unwrap(), vec![65536, 180224]);
    }

    #[test]
    fn ufs2_empty_scan_still_yields_primary() {
        let dir = TestTempDir::new("scan-ufs2-empty");
        let path = dir.path().join("blank.img");
        std::fs::write(&path, vec![0u8; 1 << 20]).unwrap();
        let image = Image::open(&path).unwrap();
        assert_eq!(find_all(&image, FsKind::Ufs2).unwrap(), vec![65536]);
    }

    #[test]
    fn ufs_stray_early_magic_is_dropped() {
        let dir = TestTempDir::new("scan-ufs-boot");
        let path = ufs2_image(dir.path(), 20 << 20, &[180224]);
        let mut data = std::fs::read(&path).unwrap();
        // magic alone inside the boot block, not a full record
        data[512..516].copy_from_slice(layout::UFS_MAGIC);
        std::fs::write(&path, &data).unwrap();
        let image = Image::open(&path).unwrap();
        // the boot-block hit is the dropped first match
        assert_eq!(find_all(&image, FsKind::Ufs2).unwrap(), vec![65536, 180224]);
    }

    #[test]
    fn ext_uuid_scan_finds_backups_and_checks_magic() {
        let dir = TestTempDir::new("scan-ext");
        let uuid = *b"\x11\x22\x33\x44abcdefghijkl";
        let path = ext_image(dir.path(), 10 << 20, uuid, &[32768, 98304]);
        let mut data = std::fs::read(&path).unwrap();
        // decoy: UUID bytes in file data, with no magic in front of them
        data[500_000..500_016].copy_from_slice(&uuid);
        std::fs::write(&path, &data).unwrap();

        let image = Image::open(&path).unwrap();
        let locs = find_all(&image, FsKind::Ext4).unwrap();
        assert_eq!(locs, vec![1024, 32768, 98304]);
        for loc in locs {
            let at = loc as usize + 56;
            assert_eq!(&image.data()[at..at + 2], layout::EXT_MAGIC);
        }
    }

    #[test]
    fn zfs_scan_returns_every_uberblock() {
        let dir = TestTempDir::new("scan-zfs");
        let path = zfs_image(dir.path(), 4 << 20, &[128 << 10, 256 << 10, 384 << 10]);
        let image = Image::open(&path).unwrap();
        assert_eq!(
            find_all(&image, FsKind::Zfs).unwrap(),
            vec![128 << 10, 256 << 10, 384 << 10]
        );
    }

    #[test]
    fn short_record_read_is_malformed() {
        let dir = TestTempDir::new("scan-short");
        let path = dir.path().join("tiny.img");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();
        let image = Image::open(&path).unwrap();
        let err = read_record(&image, FsKind::Ufs2, 1024).unwrap_err();
        assert!(matches!(err, FuzzError::MalformedImage { offset: 1024, .. }));
    }

    #[test]
    fn superblock_round_trip_is_byte_identical() {
        let dir = TestTempDir::new("scan-roundtrip");
        let path = ufs2_image(dir.path(), 20 << 20, &[180224]);
        let image = Image::open(&path).unwrap();

        let before = std::fs::read(&path).unwrap();
        let mut copy = before.clone();
        for loc in find_all(&image, FsKind::Ufs2).unwrap() {
            let rec = read_record(&image, FsKind::Ufs2, loc).unwrap();
            let start = loc as usize;
            copy[start..start + rec.as_bytes().len()].copy_from_slice(rec.as_bytes());
        }
        assert_eq!(before, copy);
    }

    #[test]
    fn record_fields_cover_whole_record() {
        let dir = TestTempDir::new("scan-fields");
        let path = ufs2_image(dir.path(), 20 << 20, &[]);
        let image = Image::open(&path).unwrap();
        let rec = read_record(&image, FsKind::Ufs2, 65536).unwrap();

        let total: usize = rec.fields().map(|(_, bytes)| bytes.len()).sum();
        assert_eq!(total, layout::record_len(FsKind::Ufs2));
        assert_eq!(rec.field("fs_magic").unwrap(), layout::UFS_MAGIC);
        assert!(rec.field("no_such_field").is_none());
    }
}
