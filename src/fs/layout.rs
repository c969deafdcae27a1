// SPDX-License-Identifier: GPL-2.0

//! Static on-disk layout descriptors for the supported superblocks.
//!
//! Each descriptor is an ordered table of `(name, width)` pairs; a field's
//! offset is the sum of the widths preceding it. Total lengths are checked
//! against the declared record lengths at compile time, so a table edit
//! that changes the record size fails the build rather than silently
//! shifting every offset behind it.
//!
//! Field payloads are raw byte slices. Endianness interpretation is the
//! caller's business and only matters for pretty-printing.

use super::FsKind;

/// One field of a superblock record: name and width in bytes.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub width: usize,
}

const fn f(name: &'static str, width: usize) -> FieldSpec {
    FieldSpec { name, width }
}

/// Everything needed to locate and slice one kind of superblock.
#[derive(Debug, Clone, Copy)]
pub struct LayoutDescriptor {
    /// Byte pattern identifying the record on disk.
    pub magic: &'static [u8],
    /// Fixed offset of the primary copy, if the format has one.
    pub primary_offset: Option<u64>,
    /// Declared total record length; equals the sum of field widths.
    pub record_len: usize,
    /// Name of the field holding the magic pattern.
    pub magic_field: &'static str,
    pub fields: &'static [FieldSpec],
}

pub const UFS_MAGIC: &[u8] = &[0x19, 0x01, 0x54, 0x19];
pub const EXT_MAGIC: &[u8] = &[0x53, 0xef];
pub const ZFS_MAGIC: &[u8] = &[0x0c, 0xb1, 0xba, 0x00, 0x00, 0x00, 0x00, 0x00];

pub const SBLOCK_UFS1: u64 = 8192;
pub const SBLOCK_UFS2: u64 = 65536;
pub const SBLOCK_EXT: u64 = 1024;

pub const UFS_SB_LEN: usize = 1376;
pub const EXT_SB_LEN: usize = 960;
pub const ZFS_UB_LEN: usize = 1024;

/// Offset of the ext magic within the superblock, used when verifying
/// UUID-anchored scan hits.
pub const EXT_MAGIC_SB_OFFSET: u64 = 56;
/// Offset of the ext UUID within the superblock.
pub const EXT_UUID_SB_OFFSET: u64 = 104;

// struct fs, FreeBSD sys/ufs/ffs/fs.h. Pointer-valued fields are on-disk
// padding here and keep their source names for greppability.
static UFS_SB_FIELDS: &[FieldSpec] = &[
    f("fs_firstfield", 4),
    f("fs_unused_1", 4),
    f("fs_sblkno", 4),
    f("fs_cblkno", 4),
    f("fs_iblkno", 4),
    f("fs_dblkno", 4),
    f("fs_old_cgoffset", 4),
    f("fs_old_cgmask", 4),
    f("fs_old_time", 4),
    f("fs_old_size", 4),
    f("fs_old_dsize", 4),
    f("fs_ncg", 4),
    f("fs_bsize", 4),
    f("fs_fsize", 4),
    f("fs_frag", 4),
    f("fs_minfree", 4),
    f("fs_old_rotdelay", 4),
    f("fs_old_rps", 4),
    f("fs_bmask", 4),
    f("fs_fmask", 4),
    f("fs_bshift", 4),
    f("fs_fshift", 4),
    f("fs_maxcontig", 4),
    f("fs_maxbpg", 4),
    f("fs_fragshift", 4),
    f("fs_fsbtodb", 4),
    f("fs_sbsize", 4),
    f("fs_spare1", 8),
    f("fs_nindir", 4),
    f("fs_inopb", 4),
    f("fs_old_nspf", 4),
    f("fs_optim", 4),
    f("fs_old_npsect", 4),
    f("fs_old_interleave", 4),
    f("fs_old_trackskew", 4),
    f("fs_id", 8),
    f("fs_old_csaddr", 4),
    f("fs_cssize", 4),
    f("fs_cgsize", 4),
    f("fs_spare2", 4),
    f("fs_old_nsect", 4),
    f("fs_old_spc", 4),
    f("fs_old_ncyl", 4),
    f("fs_old_cpg", 4),
    f("fs_ipg", 4),
    f("fs_fpg", 4),
    f("fs_old_cstotal_cs_ndir", 4),
    f("fs_old_cstotal_cs_nbfree", 4),
    f("fs_old_cstotal_cs_nifree", 4),
    f("fs_old_cstotal_cs_nffree", 4),
    f("fs_fmod", 1),
    f("fs_clean", 1),
    f("fs_ronly", 1),
    f("fs_old_flags", 1),
    f("fs_fsmnt", 468),
    f("fs_volname", 32),
    f("fs_swuid", 8),
    f("fs_pad", 4),
    f("fs_cgrotor", 4),
    f("fs_ocsp", 96),
    f("fs_contigdirs", 8),
    f("fs_csp", 8),
    f("fs_maxcluster", 8),
    f("fs_active", 8),
    f("fs_old_cpc", 4),
    f("fs_maxbsize", 4),
    f("fs_unrefs", 8),
    f("fs_providersize", 8),
    f("fs_metaspace", 8),
    f("fs_sparecon64", 104),
    f("fs_sblockactualloc", 8),
    f("fs_sblockloc", 8),
    f("fs_cstotal_cs_ndir", 8),
    f("fs_cstotal_cs_nbfree", 8),
    f("fs_cstotal_cs_nifree", 8),
    f("fs_cstotal_cs_nffree", 8),
    f("fs_cstotal_cs_numclusters", 8),
    f("fs_cstotal_cs_spare", 24),
    f("fs_time", 8),
    f("fs_size", 8),
    f("fs_dsize", 8),
    f("fs_csaddr", 8),
    f("fs_pendingblocks", 8),
    f("fs_pendinginodes", 4),
    f("fs_snapinum", 80),
    f("fs_avgfilesize", 4),
    f("fs_avgfpdir", 4),
    f("fs_save_cgsize", 4),
    f("fs_mtime", 8),
    f("fs_sujfree", 4),
    f("fs_sparecon32", 84),
    f("fs_ckhash", 4),
    f("fs_metackhash", 4),
    f("fs_flags", 4),
    f("fs_contigsumsize", 4),
    f("fs_maxsymlinklen", 4),
    f("fs_old_inodefmt", 4),
    f("fs_maxfilesize", 8),
    f("fs_qbmask", 8),
    f("fs_qfmask", 8),
    f("fs_state", 4),
    f("fs_old_postblformat", 4),
    f("fs_old_nrpos", 4),
    f("fs_spare5", 8),
    // The magic is the *last* field: a magic match at byte m means the
    // record starts at m - (record_len - 4).
    f("fs_magic", 4),
];

// struct ext2fs, matching the ext2/3/4 on-disk superblock up through the
// checksum field.
static EXT_SB_FIELDS: &[FieldSpec] = &[
    f("e2fs_icount", 4),
    f("e2fs_bcount", 4),
    f("e2fs_rbcount", 4),
    f("e2fs_fbcount", 4),
    f("e2fs_ficount", 4),
    f("e2fs_first_dblock", 4),
    f("e2fs_log_bsize", 4),
    f("e2fs_log_fsize", 4),
    f("e2fs_bpg", 4),
    f("e2fs_fpg", 4),
    f("e2fs_ipg", 4),
    f("e2fs_mtime", 4),
    f("e2fs_wtime", 4),
    f("e2fs_mnt_count", 2),
    f("e2fs_max_mnt_count", 2),
    f("e2fs_magic", 2),
    f("e2fs_state", 2),
    f("e2fs_beh", 2),
    f("e2fs_minrev", 2),
    f("e2fs_lastfsck", 4),
    f("e2fs_fsckintv", 4),
    f("e2fs_creator", 4),
    f("e2fs_rev", 4),
    f("e2fs_ruid", 2),
    f("e2fs_rgid", 2),
    f("e2fs_first_ino", 4),
    f("e2fs_inode_size", 2),
    f("e2fs_block_group_nr", 2),
    f("e2fs_features_compat", 4),
    f("e2fs_features_incompat", 4),
    f("e2fs_features_rocompat", 4),
    f("e2fs_uuid", 16),
    f("e2fs_vname", 16),
    f("e2fs_fsmnt", 64),
    f("e2fs_algo", 4),
    f("e2fs_prealloc", 1),
    f("e2fs_dir_prealloc", 1),
    f("e2fs_reserved_ngdb", 2),
    f("e3fs_journal_uuid", 16),
    f("e3fs_journal_inum", 4),
    f("e3fs_journal_dev", 4),
    f("e3fs_last_orphan", 4),
    f("e3fs_hash_seed", 16),
    f("e3fs_def_hash_version", 1),
    f("e3fs_jnl_backup_type", 1),
    f("e3fs_desc_size", 2),
    f("e3fs_default_mount_opts", 4),
    f("e3fs_first_meta_bg", 4),
    f("e3fs_mkfs_time", 4),
    f("e3fs_jnl_blks", 4),
    f("e4fs_bcount_hi", 4),
    f("e4fs_rbcount_hi", 4),
    f("e4fs_fbcount_hi", 4),
    f("e4fs_min_extra_isize", 2),
    f("e4fs_want_extra_isize", 2),
    f("e4fs_flags", 4),
    f("e4fs_raid_stride", 2),
    f("e4fs_mmpintv", 2),
    f("e4fs_mmpblk", 8),
    f("e4fs_raid_stripe_wid", 4),
    f("e4fs_log_gpf", 1),
    f("e4fs_chksum_type", 1),
    f("e4fs_encrypt", 1),
    f("e4fs_reserved_pad", 1),
    f("e4fs_kbytes_written", 8),
    f("e4fs_snapinum", 4),
    f("e4fs_snapid", 4),
    f("e4fs_snaprbcount", 8),
    f("e4fs_snaplist", 4),
    f("e4fs_errcount", 4),
    f("e4fs_first_errtime", 4),
    f("e4fs_first_errino", 4),
    f("e4fs_first_errblk", 8),
    f("e4fs_first_errfunc", 32),
    f("e4fs_first_errline", 4),
    f("e4fs_last_errtime", 4),
    f("e4fs_last_errino", 4),
    f("e4fs_last_errline", 4),
    f("e4fs_last_errblk", 8),
    f("e4fs_last_errfunc", 32),
    f("e4fs_mount_opts", 64),
    f("e4fs_usrquota_inum", 4),
    f("e4fs_grpquota_inum", 4),
    f("e4fs_overhead_clusters", 4),
    f("e4fs_backup_bgs", 8),
    f("e4fs_encrypt_algos", 4),
    f("e4fs_encrypt_pw_salt", 16),
    f("e4fs_lpf_ino", 4),
    f("e4fs_proj_quota_inum", 4),
    f("e4fs_chksum_seed", 4),
    f("e4fs_reserved", 392),
    f("e4fs_sbchksum", 4),
];

// struct uberblock. The block pointer and trailing pad are one opaque
// region; the MMP fields at the tail are split out since they sit at
// stable offsets.
static ZFS_UB_FIELDS: &[FieldSpec] = &[
    f("ub_magic", 8),
    f("ub_version", 8),
    f("ub_txg", 8),
    f("ub_guid_sum", 8),
    f("ub_timestamp", 8),
    f("ub_rootbp", 936),
    f("ub_software_version", 8),
    f("ub_mmp_magic", 8),
    f("ub_mmp_delay", 8),
    f("ub_mmp_config", 8),
    f("ub_mmp_config_valid", 1),
    f("ub_mmp_write_interval", 3),
    f("ub_mmp_seq", 2),
    f("ub_mmp_fail_intervals", 2),
    f("ub_checkpoint_txg", 8),
];

const fn total_width(fields: &[FieldSpec]) -> usize {
    let mut sum = 0;
    let mut i = 0;
    while i < fields.len() {
        sum += fields[i].width;
        i += 1;
    }
    sum
}

// Build-time integrity check: declared record lengths must match the tables.
const _: () = assert!(total_width(UFS_SB_FIELDS) == UFS_SB_LEN);
const _: () = assert!(total_width(EXT_SB_FIELDS) == EXT_SB_LEN);
const _: () = assert!(total_width(ZFS_UB_FIELDS) == ZFS_UB_LEN);

static UFS1_DESC: LayoutDescriptor = LayoutDescriptor {
    magic: UFS_MAGIC,
    primary_offset: Some(SBLOCK_UFS1),
    record_len: UFS_SB_LEN,
    magic_field: "fs_magic",
    fields: UFS_SB_FIELDS,
};

static UFS2_DESC: LayoutDescriptor = LayoutDescriptor {
    magic: UFS_MAGIC,
    primary_offset: Some(SBLOCK_UFS2),
    record_len: UFS_SB_LEN,
    magic_field: "fs_magic",
    fields: UFS_SB_FIELDS,
};

static EXT_DESC: LayoutDescriptor = LayoutDescriptor {
    magic: EXT_MAGIC,
    primary_offset: Some(SBLOCK_EXT),
    record_len: EXT_SB_LEN,
    magic_field: "e2fs_magic",
    fields: EXT_SB_FIELDS,
};

static ZFS_DESC: LayoutDescriptor = LayoutDescriptor {
    magic: ZFS_MAGIC,
    primary_offset: None,
    record_len: ZFS_UB_LEN,
    magic_field: "ub_magic",
    fields: ZFS_UB_FIELDS,
};

/// The layout descriptor for a filesystem kind. The three ext variants
/// share one superblock layout, as do UFS1/UFS2 (they differ only in the
/// primary offset).
pub fn descriptor(kind: FsKind) -> &'static LayoutDescriptor {
    match kind {
        FsKind::Ufs1 => &UFS1_DESC,
        FsKind::Ufs2 => &UFS2_DESC,
        FsKind::Ext2 | FsKind::Ext3 | FsKind::Ext4 => &EXT_DESC,
        FsKind::Zfs => &ZFS_DESC,
    }
}

/// Total record length for a kind.
pub fn record_len(kind: FsKind) -> usize {
    descriptor(kind).record_len
}

/// Offset and width of a named field within the record, or `None` for an
/// unknown name. Offsets are deterministic: the sum of preceding widths.
pub fn offset_of(kind: FsKind, field_name: &str) -> Option<(u64, usize)> {
    let mut off = 0u64;
    for field in descriptor(kind).fields {
        if field.name == field_name {
            return Some((off, field.width));
        }
        off += field.width as u64;
    }
    None
}

/// Offset of the magic field within the record.
pub fn magic_offset(kind: FsKind) -> u64 {
    let desc = descriptor(kind);
    // The magic field name comes from the descriptor itself, so the lookup
    // cannot miss.
    offset_of(kind, desc.magic_field).map(|(off, _)| off).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_lengths_match_declared() {
        assert_eq!(record_len(FsKind::Ufs1), 1376);
        assert_eq!(record_len(FsKind::Ufs2), 1376);
        assert_eq!(record_len(FsKind::Ext2), 960);
        assert_eq!(record_len(FsKind::Ext4), 960);
        assert_eq!(record_len(FsKind::Zfs), 1024);
    }

    #[test]
    fn known_field_offsets() {
        assert_eq!(offset_of(FsKind::Ufs2, "fs_magic"), Some((1372, 4)));
        assert_eq!(offset_of(FsKind::Ufs2, "fs_sblkno"), Some((8, 4)));
        assert_eq!(offset_of(FsKind::Ext4, "e2fs_magic"), Some((56, 2)));
        assert_eq!(offset_of(FsKind::Ext4, "e2fs_uuid"), Some((104, 16)));
        assert_eq!(offset_of(FsKind::Zfs, "ub_magic"), Some((0, 8)));
        assert_eq!(offset_of(FsKind::Zfs, "ub_checkpoint_txg"), Some((1016, 8)));
    }

    #[test]
    fn unknown_field_is_none() {
        assert_eq!(offset_of(FsKind::Ufs2, "fs_nonexistent"), None);
        assert_eq!(offset_of(FsKind::Ext2, "fs_magic"), None);
    }

    #[test]
    fn offsets_are_deterministic() {
        for _ in 0..3 {
            assert_eq!(offset_of(FsKind::Ufs1, "fs_fsmnt"), offset_of(FsKind::Ufs1, "fs_fsmnt"));
        }
    }

    #[test]
    fn magic_field_offsets() {
        assert_eq!(magic_offset(FsKind::Ufs1), 1372);
        assert_eq!(magic_offset(FsKind::Ufs2), 1372);
        assert_eq!(magic_offset(FsKind::Ext3), 56);
        assert_eq!(magic_offset(FsKind::Zfs), 0);
    }

    #[test]
    fn ext_magic_precedes_uuid() {
        let (magic_off, _) = offset_of(FsKind::Ext2, "e2fs_magic").unwrap();
        let (uuid_off, uuid_w) = offset_of(FsKind::Ext2, "e2fs_uuid").unwrap();
        assert_eq!(magic_off, EXT_MAGIC_SB_OFFSET);
        assert_eq!(uuid_off, EXT_UUID_SB_OFFSET);
        assert_eq!(uuid_w, 16);
    }
}
