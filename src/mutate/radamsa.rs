//! Opaque external mutation via the `radamsa` binary, with optional
//! structure restoration afterwards.
//!
//! Radamsa treats the image as a byte soup and routinely destroys the
//! superblock magic, which makes the kernel reject the image before any
//! interesting code runs. Restoring the magic bytes (default) keeps the
//! image mountable-looking; restoring whole superblocks instead confines
//! the effective mutation to non-metadata regions.

use std::fs::{self, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::process::Command;

use log::debug;
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{FuzzError, Result};
use crate::fs::scanner::{find_all, read_record, Image};
use crate::fs::{layout, probe};

use super::{derived_path, Mutation};

#[derive(Debug, Clone, Copy)]
pub struct RadamsaOptions {
    pub preserve_magic: bool,
    pub preserve_uberblock: bool,
    /// Seed the mutator so a crash can be replayed byte-for-byte.
    pub deterministic: bool,
}

impl Default for RadamsaOptions {
    fn default() -> Self {
        RadamsaOptions {
            preserve_magic: true,
            preserve_uberblock: false,
            deterministic: true,
        }
    }
}

const SEED_BITS: u32 = 100;

/// Run radamsa over `src` into a `radamsa_`-prefixed sibling file and
/// restore structure per `opts`. Returns the seed used (if deterministic)
/// so the mutation can be replayed.
pub fn mutate(src: &Path, opts: &RadamsaOptions, rng: &mut StdRng) -> Result<Mutation> {
    let out = derived_path(src, "radamsa_");

    let seed = opts
        .deterministic
        .then(|| rng.gen::<u128>() >> (128 - SEED_BITS));

    let mut cmd = Command::new("radamsa");
    if let Some(seed) = seed {
        cmd.arg("-s").arg(seed.to_string());
    }
    let output = cmd.arg(src).output()?;
    if !output.status.success() {
        return Err(FuzzError::Io(std::io::Error::other(format!(
            "radamsa exited with {}",
            output.status
        ))));
    }
    fs::write(&out, &output.stdout)?;
    debug!("radamsa {:?} -> {:?} (seed {:?})", src, out, seed);

    // uberblock restoration subsumes the magic bytes
    if opts.preserve_uberblock {
        restore_records(src, &out)?;
    } else if opts.preserve_magic {
        restore_magic(src, &out)?;
    }

    Ok(Mutation { path: out, seed })
}

/// Write the canonical magic back at every superblock offset found in the
/// *original* image. After this, a fresh scan of the mutated image yields
/// at least those offsets.
pub fn restore_magic(original: &Path, mutated: &Path) -> Result<()> {
    let image = Image::open(original)?;
    let kind = probe(&image)?;
    let locs = find_all(&image, kind)?;

    let magic = layout::descriptor(kind).magic;
    let magic_off = layout::magic_offset(kind);

    let file = OpenOptions::new().write(true).open(mutated)?;
    for loc in locs {
        file.write_all_at(magic, loc + magic_off)?;
    }
    Ok(())
}

/// Copy every original superblock record over the mutated image at its
/// original offset.
pub fn restore_records(original: &Path, mutated: &Path) -> Result<()> {
    let image = Image::open(original)?;
    let kind = probe(&image)?;
    let locs = find_all(&image, kind)?;

    let file = OpenOptions::new().write(true).open(mutated)?;
    for loc in locs {
        let record = read_record(&image, kind, loc)?;
        file.write_all_at(record.as_bytes(), loc)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::layout::UFS_MAGIC;
    use crate::fs::scanner::find_all;
    use crate::fs::FsKind;
    use crate::testutil::{ufs2_image, TestTempDir};

    #[test]
    fn restore_magic_makes_scan_offsets_a_superset() {
        let dir = TestTempDir::new("radamsa-magic");
        let src = ufs2_image(dir.path(), 20 << 20, &[180224]);
        let orig_locs = find_all(&Image::open(&src).unwrap(), FsKind::Ufs2).unwrap();

        // stand-in for a radamsa pass that trashed both magics
        let mutated = dir.path().join("radamsa_fuzz1_ufs2_20MB");
        let mut data = fs::read(&src).unwrap();
        for &loc in &orig_locs {
            let at = loc as usize + 1372;
            data[at..at + 4].copy_from_slice(&[0; 4]);
        }
        fs::write(&mutated, &data).unwrap();

        restore_magic(&src, &mutated).unwrap();

        let after = fs::read(&mutated).unwrap();
        for &loc in &orig_locs {
            let at = loc as usize + 1372;
            assert_eq!(&after[at..at + 4], UFS_MAGIC);
        }
        let new_locs = find_all(&Image::open(&mutated).unwrap(), FsKind::Ufs2).unwrap();
        assert!(orig_locs.iter().all(|loc| new_locs.contains(loc)));
    }

    #[test]
    fn restore_records_copies_whole_superblocks_back() {
        let dir = TestTempDir::new("radamsa-records");
        let src = ufs2_image(dir.path(), 20 << 20, &[180224]);

        let mutated = dir.path().join("radamsa_fuzz1_ufs2_20MB");
        let mut data = fs::read(&src).unwrap();
        for loc in [65536usize, 180224] {
            for byte in &mut data[loc..loc + 1376] {
                *byte = 0xee;
            }
        }
        fs::write(&mutated, &data).unwrap();

        restore_records(&src, &mutated).unwrap();

        let before = fs::read(&src).unwrap();
        let after = fs::read(&mutated).unwrap();
        for loc in [65536usize, 180224] {
            assert_eq!(before[loc..loc + 1376], after[loc..loc + 1376]);
        }
    }

    #[test]
    fn seed_stays_inside_100_bits() {
        // the seed must survive a round trip through radamsa's CLI
        let max = 1u128 << SEED_BITS;
        let mut rng = <StdRng as rand::SeedableRng>::seed_from_u64(42);
        for _ in 0..64 {
            let seed = rng.gen::<u128>() >> (128 - SEED_BITS);
            assert!(seed < max);
        }
    }
}
