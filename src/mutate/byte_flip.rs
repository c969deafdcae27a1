//! Blind byte-flip engines: one contiguous run of fresh random bytes, or
//! `n` independent single-byte overwrites.

use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{FuzzError, Result};

use super::derived_path;

/// Overwrite `[p, p+n)` at a random start with fresh random bytes.
pub fn flip_seq(src: &Path, nbytes: usize, rng: &mut StdRng) -> Result<PathBuf> {
    let mut data = fs::read(src)?;
    if data.len() < nbytes || data.is_empty() {
        return Err(FuzzError::ImageTooSmall { path: src.to_path_buf(), wanted: nbytes });
    }

    let start = rng.gen_range(0..=data.len() - nbytes);
    for byte in &mut data[start..start + nbytes] {
        *byte = rng.gen();
    }

    let out = derived_path(src, &format!("{nbytes}b_seq_"));
    fs::write(&out, &data)?;
    Ok(out)
}

/// `n` single-byte overwrites at independently drawn positions. Hitting
/// the same position twice is allowed; this is a random walk, not a
/// distinct-position sample.
pub fn flip_rnd(src: &Path, nbytes: usize, rng: &mut StdRng) -> Result<PathBuf> {
    let mut data = fs::read(src)?;
    if data.is_empty() {
        return Err(FuzzError::ImageTooSmall { path: src.to_path_buf(), wanted: nbytes });
    }

    for _ in 0..nbytes {
        let pos = rng.gen_range(0..data.len());
        data[pos] = rng.gen();
    }

    let out = derived_path(src, &format!("{nbytes}b_rnd_"));
    fs::write(&out, &data)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestTempDir;
    use rand::SeedableRng;

    fn diff_indices(a: &[u8], b: &[u8]) -> Vec<usize> {
        a.iter()
            .zip(b.iter())
            .enumerate()
            .filter(|(_, (x, y))| x != y)
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn seq_flip_is_one_contiguous_window() {
        let dir = TestTempDir::new("flip-seq");
        let src = dir.path().join("img");
        fs::write(&src, vec![0u8; 4096]).unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let out = flip_seq(&src, 16, &mut rng).unwrap();
        assert_eq!(out.file_name().unwrap().to_str().unwrap(), "16b_seq_img");

        let before = fs::read(&src).unwrap();
        let after = fs::read(&out).unwrap();
        assert_eq!(before.len(), after.len());

        let diffs = diff_indices(&before, &after);
        assert!(!diffs.is_empty());
        assert!(diffs.len() <= 16);
        // all differing bytes fall inside one n-byte window
        assert!(diffs.last().unwrap() - diffs.first().unwrap() < 16);
    }

    #[test]
    fn rnd_flip_touches_at_most_n_positions() {
        let dir = TestTempDir::new("flip-rnd");
        let src = dir.path().join("img");
        fs::write(&src, vec![0xffu8; 4096]).unwrap();

        let mut rng = StdRng::seed_from_u64(9);
        let out = flip_rnd(&src, 8, &mut rng).unwrap();
        assert_eq!(out.file_name().unwrap().to_str().unwrap(), "8b_rnd_img");

        let before = fs::read(&src).unwrap();
        let after = fs::read(&out).unwrap();
        assert_eq!(before.len(), after.len());
        assert!(diff_indices(&before, &after).len() <= 8);
    }

    #[test]
    fn source_file_is_left_alone() {
        let dir = TestTempDir::new("flip-src");
        let src = dir.path().join("img");
        fs::write(&src, vec![3u8; 1024]).unwrap();

        let mut rng = StdRng::seed_from_u64(1);
        flip_seq(&src, 4, &mut rng).unwrap();
        flip_rnd(&src, 4, &mut rng).unwrap();
        assert_eq!(fs::read(&src).unwrap(), vec![3u8; 1024]);
    }

    #[test]
    fn too_small_image_is_rejected() {
        let dir = TestTempDir::new("flip-small");
        let src = dir.path().join("img");
        fs::write(&src, vec![0u8; 3]).unwrap();

        let mut rng = StdRng::seed_from_u64(2);
        let err = flip_seq(&src, 10, &mut rng).unwrap_err();
        assert!(matches!(err, FuzzError::ImageTooSmall { wanted: 10, .. }));
    }
}
