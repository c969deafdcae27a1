//! On-disk format support: layout descriptors, the image scanner, and the
//! filesystem kind probe.

pub mod layout;
pub mod scanner;

use strum::{Display, EnumString};

use crate::error::{FuzzError, Result};
use self::scanner::Image;

/// Filesystem kinds the fuzzer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FsKind {
    Ufs1,
    Ufs2,
    Ext2,
    Ext3,
    Ext4,
    Zfs,
}

impl FsKind {
    pub fn is_ufs(self) -> bool {
        matches!(self, FsKind::Ufs1 | FsKind::Ufs2)
    }

    pub fn is_ext(self) -> bool {
        matches!(self, FsKind::Ext2 | FsKind::Ext3 | FsKind::Ext4)
    }
}

// ext2 feature flags used to tell the ext generations apart.
const EXT_COMPAT_HAS_JOURNAL: u32 = 0x0004;
const EXT_INCOMPAT_EXTENTS: u32 = 0x0040;
const EXT_INCOMPAT_64BIT: u32 = 0x0080;

fn le_u32_at(data: &[u8], off: usize) -> Option<u32> {
    data.get(off..off + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn magic_at(data: &[u8], off: usize, magic: &[u8]) -> bool {
    data.get(off..off + magic.len()).map_or(false, |b| b == magic)
}

/// Classify the filesystem in a raw image by inspecting the magic offsets
/// directly: UFS magic at the end of the primary superblock, ext magic at
/// 1024+56 (refined by feature flags), otherwise an uberblock scan for ZFS.
pub fn probe(image: &Image) -> Result<FsKind> {
    let data = image.data();

    let ufs_magic_off = |sb: u64| (sb + layout::magic_offset(FsKind::Ufs2)) as usize;
    if magic_at(data, ufs_magic_off(layout::SBLOCK_UFS2), layout::UFS_MAGIC) {
        return Ok(FsKind::Ufs2);
    }
    if magic_at(data, ufs_magic_off(layout::SBLOCK_UFS1), layout::UFS_MAGIC) {
        return Ok(FsKind::Ufs1);
    }

    let ext_sb = layout::SBLOCK_EXT as usize;
    if magic_at(data, ext_sb + layout::EXT_MAGIC_SB_OFFSET as usize, layout::EXT_MAGIC) {
        let compat = le_u32_at(data, ext_sb + 92).unwrap_or(0);
        let incompat = le_u32_at(data, ext_sb + 96).unwrap_or(0);
        return Ok(if incompat & (EXT_INCOMPAT_EXTENTS | EXT_INCOMPAT_64BIT) != 0 {
            FsKind::Ext4
        } else if compat & EXT_COMPAT_HAS_JOURNAL != 0 {
            FsKind::Ext3
        } else {
            FsKind::Ext2
        });
    }

    if !scanner::find_pattern(data, layout::ZFS_MAGIC).is_empty() {
        return Ok(FsKind::Zfs);
    }

    Err(FuzzError::UnknownFilesystem(image.path().to_path_buf()))
}
