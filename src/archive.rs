//! Crash-directory archival: the sample bundle, the layout log with crash
//! metadata attached, and vmcore compression.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, error};
use serde_json::{json, Value};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{FuzzError, Result};

fn zip_err(e: zip::result::ZipError) -> FuzzError {
    FuzzError::Io(io::Error::other(e))
}

/// Deflate `files` into `archive`, flat (basenames only). Missing inputs
/// are skipped: a mutation that never produced a file still leaves a
/// usable bundle.
pub fn zip_files(archive: &Path, files: &[PathBuf]) -> Result<()> {
    let out = File::create(archive)?;
    let mut zip = ZipWriter::new(out);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for path in files {
        if !path.is_file() {
            debug!("skipping missing sample file {}", path.display());
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        zip.start_file(name, options).map_err(zip_err)?;
        io::copy(&mut File::open(path)?, &mut zip)?;
    }
    zip.finish().map_err(zip_err)?;
    Ok(())
}

/// Bundle the iteration's artifacts as `sample.zip` in the crash dir.
pub fn write_sample_bundle(crash_dir: &Path, files: &[PathBuf]) -> Result<()> {
    zip_files(&crash_dir.join("sample.zip"), files)
}

pub fn write_shasum(crash_dir: &Path, stack_hash: &str) -> Result<()> {
    fs::write(crash_dir.join("shasum256.txt"), stack_hash)?;
    Ok(())
}

/// Write `fs.json`: the generator's layout log with `crash_meta_data`
/// attached. The log arrives through a shell and may carry prompt noise
/// before the JSON; everything before the first brace is dropped. The
/// radamsa seed exceeds u64 and is stored as a decimal string.
pub fn write_fs_json(
    crash_dir: &Path,
    layout_log: &str,
    seed: Option<u128>,
    panic_label: &str,
) -> Result<()> {
    let json_start = match layout_log.find('{') {
        Some(idx) => &layout_log[idx..],
        None => {
            error!("layout log contains no JSON, skipping fs.json");
            return Ok(());
        }
    };
    let mut log: Value = match serde_json::from_str(json_start) {
        Ok(v) => v,
        Err(e) => {
            error!("unparseable layout log ({e}), skipping fs.json");
            return Ok(());
        }
    };

    log["crash_meta_data"] = json!({
        "seed": seed.map(|s| s.to_string()),
        "panic": panic_label,
    });

    let pretty =
        serde_json::to_string_pretty(&log).map_err(|e| FuzzError::Io(io::Error::other(e)))?;
    fs::write(crash_dir.join("fs.json"), pretty.as_bytes()).map_err(FuzzError::Io)
}

/// Zip the raw vmcore inside a crash directory and drop the original;
/// kernel cores are large and compress well.
pub fn compress_vmcore(crash_dir: &Path) -> Result<()> {
    let vmcore = fs::read_dir(crash_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| {
            p.file_name()
                .map(|n| {
                    let n = n.to_string_lossy();
                    n.starts_with("vmcore") && !n.ends_with(".zip")
                })
                .unwrap_or(false)
        });

    let Some(vmcore) = vmcore else { return Ok(()) };
    let archive = vmcore.with_file_name(format!(
        "{}.zip",
        vmcore.file_name().unwrap_or_default().to_string_lossy()
    ));
    zip_files(&archive, &[vmcore.clone()])?;
    fs::remove_file(&vmcore)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestTempDir;

    #[test]
    fn sample_bundle_holds_the_given_files() {
        let dir = TestTempDir::new("archive-bundle");
        let img = dir.path().join("radamsa_fuzz1_ufs2_20MB");
        let log = dir.path().join("fuzz1_syscall.log");
        fs::write(&img, b"image").unwrap();
        fs::write(&log, b"[+] touch /mnt/x/T\n").unwrap();

        write_sample_bundle(dir.path(), &[img, log, dir.path().join("not-there")]).unwrap();

        let archive = File::open(dir.path().join("sample.zip")).unwrap();
        let mut zip = zip::ZipArchive::new(archive).unwrap();
        let names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["radamsa_fuzz1_ufs2_20MB", "fuzz1_syscall.log"]);
    }

    #[test]
    fn fs_json_attaches_crash_metadata_and_strips_noise() {
        let dir = TestTempDir::new("archive-fsjson");
        let noisy = "sh-5.1$ {\"fs\": \"ufs2\", \"entries\": []}";
        write_fs_json(dir.path(), noisy, Some(1234567890123456789012345), "ffs_valloc").unwrap();

        let v: Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("fs.json")).unwrap()).unwrap();
        assert_eq!(v["fs"], "ufs2");
        assert_eq!(v["crash_meta_data"]["panic"], "ffs_valloc");
        assert_eq!(v["crash_meta_data"]["seed"], "1234567890123456789012345");
    }

    #[test]
    fn junk_layout_log_is_tolerated() {
        let dir = TestTempDir::new("archive-junk");
        write_fs_json(dir.path(), "ERROR no fs generated", None, "x").unwrap();
        assert!(!dir.path().join("fs.json").exists());
    }

    #[test]
    fn vmcore_is_compressed_and_removed() {
        let dir = TestTempDir::new("archive-vmcore");
        let vmcore = dir.path().join("vmcore.3");
        fs::write(&vmcore, vec![0u8; 8192]).unwrap();

        compress_vmcore(dir.path()).unwrap();
        assert!(!vmcore.exists());
        assert!(dir.path().join("vmcore.3.zip").exists());

        // second run is a no-op
        compress_vmcore(dir.path()).unwrap();
    }
}
