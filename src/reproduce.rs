//! Crash reproduction: replay archived samples on a pristine VM and
//! confirm the fingerprint.
//!
//! An explicit poll loop re-reads the registry on a fixed wake interval
//! and works through entries that have no verdict yet. The verdict lands
//! in the crash directory as a marker file:
//! `reprod.1` means same chain and same fingerprint (or a mount-time
//! crash that crashed at mount again), `reprod.2` a different command or
//! fingerprint needing manual review, `reprod.0` no reproduction.

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use log::{error, info, warn};

use crate::crashdb::{CrashDb, CrashDbEntry};
use crate::fingerprint;
use crate::guest::{
    adapter, exec_quiet, ExecReply, GuestOs, GuestTransport, MountOutcome,
};

const REPROD_MARKERS: &[&str] = &["reprod.0", "reprod.1", "reprod.2"];

/// Extract the replayable command chain from a syscall log: commands that
/// ran (`[+]`) plus the one that killed the guest (`[!]`), minus the
/// mount pseudo-entry.
pub fn command_chain(log_text: &str) -> Vec<String> {
    log_text
        .lines()
        .filter(|l| {
            l.starts_with("[+]") || (l.starts_with("[!]") && !l.starts_with("[!] mount"))
        })
        .filter_map(|l| l.split_once("] ").map(|(_, cmd)| cmd.trim().to_string()))
        .collect()
}

/// Whether this registry entry already has a verdict on disk.
pub fn is_verified(entry: &CrashDbEntry) -> bool {
    REPROD_MARKERS.iter().any(|m| entry.crash_dir.join(m).exists())
}

pub struct Reproducer {
    db: CrashDb,
    transport: Box<dyn GuestTransport>,
    os: GuestOs,
    interval: Duration,
    checked: HashSet<PathBuf>,
    stop: Arc<AtomicBool>,
}

impl Reproducer {
    pub fn new(
        db_path: &Path,
        transport: Box<dyn GuestTransport>,
        interval: Duration,
        stop: Arc<AtomicBool>,
    ) -> anyhow::Result<Self> {
        let os = adapter::probe_os(transport.as_ref()).context("probing verifier guest OS")?;
        Ok(Reproducer {
            db: CrashDb::new(db_path),
            transport,
            os,
            interval,
            checked: HashSet::new(),
            stop,
        })
    }

    /// Poll the registry until interrupted.
    pub fn run(&mut self) -> anyhow::Result<()> {
        while !self.stop.load(Ordering::Relaxed) {
            if self.run_once()? == 0 {
                thread::sleep(self.interval);
            }
        }
        Ok(())
    }

    /// Verify everything currently pending; returns how many entries were
    /// processed.
    pub fn run_once(&mut self) -> anyhow::Result<usize> {
        let pending: Vec<CrashDbEntry> = self
            .db
            .entries()?
            .into_iter()
            .filter(|e| !self.checked.contains(&e.crash_dir) && !is_verified(e))
            .collect();

        for entry in &pending {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            self.checked.insert(entry.crash_dir.clone());
            if let Err(e) = self.verify(entry) {
                error!("verification of {} failed: {e}", entry.crash_dir.display());
            }
            if let Some(snap) = self.transport.current_snapshot() {
                let _ = self.transport.restore_snapshot(&snap);
            }
        }
        Ok(pending.len())
    }

    fn verify(&mut self, entry: &CrashDbEntry) -> anyhow::Result<()> {
        info!("verifying {}", entry.crash_dir.display());

        let (image, syscall_log) = extract_sample(&entry.crash_dir)?;
        let chain = command_chain(&fs::read_to_string(&syscall_log).unwrap_or_default());

        let image_name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.transport.copy_to_guest(&[image.clone()], "/tmp")?;

        let mut fs_adapter = adapter::adapter_for(
            self.os,
            format!("/tmp/{image_name}"),
            format!("/mnt/{image_name}"),
        );
        let mount = fs_adapter.mount_file_system(self.transport.as_ref());

        if chain.is_empty() {
            match mount {
                MountOutcome::Crashed => write_verdict(
                    &entry.crash_dir,
                    "reprod.1",
                    "System crashed as expected during mount!\n",
                )?,
                _ => write_verdict(
                    &entry.crash_dir,
                    "reprod.0",
                    "Command chain was empty. Expected the system to crash during mount!\n",
                )?,
            }
        } else if mount == MountOutcome::Mounted && self.transport.liveness() {
            self.replay_chain(entry, &chain)?;
        } else {
            write_verdict(
                &entry.crash_dir,
                "reprod.0",
                "Mount did not reach the recorded command chain.\n",
            )?;
        }

        // leave only the verdict and the original bundle behind
        let _ = fs::remove_file(&image);
        let _ = fs::remove_file(&syscall_log);
        Ok(())
    }

    fn replay_chain(&mut self, entry: &CrashDbEntry, chain: &[String]) -> anyhow::Result<()> {
        for (idx, cmd) in chain.iter().enumerate() {
            exec_quiet(self.transport.as_ref(), cmd);
            let last = idx == chain.len() - 1;
            let alive = self.transport.liveness();

            match (last, alive) {
                (false, true) => continue,
                (false, false) => {
                    // earlier command than recorded took the guest down
                    let verdict = format!(
                        "Command chain mismatch. Manual review necessary!\n\
                         Originally crashed at: {}\n\
                         Now crashed at: {cmd}\n",
                        chain[chain.len() - 1]
                    );
                    write_verdict(&entry.crash_dir, "reprod.2", &verdict)?;
                    self.transport.reset().ok();
                    let _ = self.repro_fingerprint(&entry.crash_dir);
                    return Ok(());
                }
                (true, true) => {
                    write_verdict(
                        &entry.crash_dir,
                        "reprod.0",
                        &format!("Could not verify crash with loaded command chain:\n{chain:?}\n"),
                    )?;
                    return Ok(());
                }
                (true, false) => {
                    self.transport.reset().ok();
                    let new_hash = self
                        .repro_fingerprint(&entry.crash_dir)
                        .unwrap_or_else(|| "NONE".to_string());
                    if new_hash != entry.stack_hash {
                        error!(
                            "{}",
                            crate::error::FuzzError::ReproductionMismatch {
                                expected: entry.stack_hash.clone(),
                                got: new_hash.clone(),
                            }
                        );
                    }
                    if new_hash == entry.stack_hash {
                        write_verdict(
                            &entry.crash_dir,
                            "reprod.1",
                            "System crashed after executing the same command chain!\n\
                             sha256 sums are a match!\n",
                        )?;
                    } else {
                        write_verdict(
                            &entry.crash_dir,
                            "reprod.2",
                            &format!(
                                "System crashed after executing the same command chain!\n\
                                 sha256 sums are a mismatch:\n\
                                 > Original crash: {}\n\
                                 > Reproduced crash: {new_hash}\n\
                                 Manual review necessary!\n",
                                entry.stack_hash
                            ),
                        )?;
                    }
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Pull the fresh core of the reproduction run and fingerprint it.
    fn repro_fingerprint(&self, save_to: &Path) -> Option<String> {
        const FIND: &str = r#"/usr/bin/find /var/crash -name "core*" -print0 | /usr/bin/xargs -0 ls -t | /usr/bin/head -n1"#;
        let core = match exec_quiet(self.transport.as_ref(), FIND) {
            ExecReply::Output(s) => s.trim().to_string(),
            _ => return None,
        };
        // park it under a reprod name so the next run will not re-find it
        exec_quiet(
            self.transport.as_ref(),
            &format!("mv {core} /var/crash/core.txt.reprod"),
        );
        self.transport
            .copy_to_host(&["/var/crash/core.txt.reprod".to_string()], save_to)
            .ok()?;

        let data = fs::read(save_to.join("core.txt.reprod")).ok()?;
        fingerprint::fingerprint(&data).map(|fp| fp.stack_hash)
    }
}

/// Unpack `sample.zip` next to itself and identify the mutated image and
/// the syscall log. The mutated image carries the engine tag, which makes
/// it the longest non-log name in the bundle.
fn extract_sample(crash_dir: &Path) -> anyhow::Result<(PathBuf, PathBuf)> {
    let sample = crash_dir.join("sample.zip");
    let mut zip = zip::ZipArchive::new(File::open(&sample).context("opening sample.zip")?)?;

    let mut log = None;
    let mut images: Vec<PathBuf> = Vec::new();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(name) = entry.enclosed_name().map(|p| p.to_path_buf()) else { continue };
        let dest = crash_dir.join(&name);
        let mut out = File::create(&dest)?;
        std::io::copy(&mut entry, &mut out)?;

        if name.to_string_lossy().ends_with("_syscall.log") {
            log = Some(dest);
        } else {
            images.push(dest);
        }
    }

    images.sort_by_key(|p| std::cmp::Reverse(p.file_name().map(|n| n.len()).unwrap_or(0)));
    let image = images.into_iter().next().context("sample.zip holds no image")?;
    let log = log.context("sample.zip holds no syscall log")?;
    Ok((image, log))
}

fn write_verdict(crash_dir: &Path, marker: &str, text: &str) -> anyhow::Result<()> {
    warn!("verdict for {}: {marker}", crash_dir.display());
    fs::write(crash_dir.join(marker), text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::write_sample_bundle;
    use crate::crashdb::CrashDb;
    use crate::testutil::{FakeTransport, TestTempDir};
    use std::rc::Rc;

    #[test]
    fn chain_extraction_skips_failures_and_mount_marker() {
        let log = "[+] touch /mnt/x/T\n\
                   [-] ls -lah /mnt/x/d\n\
                   >>ls: No such file or directory\n\
                   [!] mount\n\
                   [!] rm -rf /mnt/x/d\n";
        assert_eq!(
            command_chain(log),
            vec!["touch /mnt/x/T".to_string(), "rm -rf /mnt/x/d".to_string()]
        );
    }

    fn seed_crash_dir(dir: &Path, chain_log: &str) -> PathBuf {
        let crash_dir = dir.join("2026-07-01T10_00_00_ffs_valloc");
        fs::create_dir_all(&crash_dir).unwrap();

        let img = dir.join("radamsa_fuzz1_ufs2_20MB");
        let seed = dir.join("fuzz1_ufs2_20MB");
        let log = dir.join("fuzz1_syscall.log");
        fs::write(&img, b"mutated").unwrap();
        fs::write(&seed, b"seed").unwrap();
        fs::write(&log, chain_log).unwrap();
        write_sample_bundle(&crash_dir, &[img, seed, log]).unwrap();
        crash_dir
    }

    fn seed_db(dir: &Path, crash_dir: &Path) -> PathBuf {
        let db_path = dir.join("crash.db");
        let db = CrashDb::new(&db_path);
        db.append_if_new(&CrashDbEntry {
            fuzzer: "fuzz1".into(),
            vm_name: "fuzzBox".into(),
            fs_kind: "ufs2".into(),
            fs_size: "20MB".into(),
            engine: "radamsa (seed: 1)".into(),
            panic_label: "ffs_valloc".into(),
            stack_hash: "aa55".into(),
            crash_dir: crash_dir.to_path_buf(),
            runtime: "0:10:00".into(),
            iteration: 3,
        })
        .unwrap();
        db_path
    }

    #[test]
    fn sample_extraction_finds_image_and_log() {
        let dir = TestTempDir::new("reprod-extract");
        let crash_dir = seed_crash_dir(dir.path(), "[+] touch /mnt/x/T\n");
        let (image, log) = extract_sample(&crash_dir).unwrap();
        assert_eq!(image.file_name().unwrap(), "radamsa_fuzz1_ufs2_20MB");
        assert_eq!(log.file_name().unwrap(), "fuzz1_syscall.log");
    }

    #[test]
    fn mount_time_crash_reproduces_as_reprod_1() {
        let dir = TestTempDir::new("reprod-mount");
        let crash_dir = seed_crash_dir(dir.path(), "[!] mount\n");
        let db_path = seed_db(dir.path(), &crash_dir);

        let t = Rc::new(FakeTransport::new());
        t.reply("uname", ExecReply::Output("FreeBSD".into()));
        t.reply("/usr/bin/file", ExecReply::Output("Unix Fast File system [v2]".into()));
        t.reply("mdconfig -a", ExecReply::Output("md0".into()));
        t.reply("/sbin/mount", ExecReply::TransportFailed);

        let mut reproducer = Reproducer::new(
            &db_path,
            Box::new(Rc::clone(&t)),
            Duration::from_secs(1),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        // the mount takes the guest down
        t.alive.set(false);
        assert_eq!(reproducer.run_once().unwrap(), 1);
        assert!(crash_dir.join("reprod.1").exists());

        // verdict recorded: nothing pending on the next poll
        assert_eq!(reproducer.run_once().unwrap(), 0);
    }

    #[test]
    fn surviving_replay_is_reprod_0() {
        let dir = TestTempDir::new("reprod-survive");
        let crash_dir = seed_crash_dir(dir.path(), "[+] touch /mnt/x/T\n[!] rm -rf /mnt/x/d\n");
        let db_path = seed_db(dir.path(), &crash_dir);

        let t = Rc::new(FakeTransport::new());
        t.reply("uname", ExecReply::Output("FreeBSD".into()));
        t.reply("/usr/bin/file", ExecReply::Output("Unix Fast File system [v2]".into()));
        t.reply("mdconfig -a", ExecReply::Output("md0".into()));

        let mut reproducer = Reproducer::new(
            &db_path,
            Box::new(Rc::clone(&t)),
            Duration::from_secs(1),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        assert_eq!(reproducer.run_once().unwrap(), 1);
        assert!(crash_dir.join("reprod.0").exists());
        let verdict = fs::read_to_string(crash_dir.join("reprod.0")).unwrap();
        assert!(verdict.contains("Could not verify"));
    }
}
