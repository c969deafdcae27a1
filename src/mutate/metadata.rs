//! Format-aware mutation: single-byte overwrites confined to the byte
//! ranges covered by the image's superblock copies.

use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{FuzzError, Result};
use crate::fs::scanner::{find_all, Image};
use crate::fs::{layout, probe};

use super::derived_path;

/// Overwrite `nbytes` positions drawn uniformly from the union of all
/// superblock ranges. Fails with `NoSuperblock` when the image has no
/// addressable superblock bytes at all.
pub fn mutate(src: &Path, nbytes: usize, rng: &mut StdRng) -> Result<PathBuf> {
    let image = Image::open(src)?;
    let kind = probe(&image)?;
    let locs = find_all(&image, kind)?;

    let record_len = layout::record_len(kind) as u64;
    let mut pool: Vec<u64> = Vec::new();
    for &loc in &locs {
        let end = (loc + record_len).min(image.len());
        pool.extend(loc..end);
    }
    pool.sort_unstable();
    pool.dedup();

    if pool.is_empty() {
        return Err(FuzzError::NoSuperblock(src.to_path_buf()));
    }

    let mut data = image.data().to_vec();
    for _ in 0..nbytes {
        let pos = pool[rng.gen_range(0..pool.len())] as usize;
        data[pos] = rng.gen();
    }

    let out = derived_path(src, &format!("{nbytes}b_sb_meta_"));
    fs::write(&out, &data)?;
    Ok(out)
}
