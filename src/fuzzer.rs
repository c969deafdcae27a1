// SPDX-License-Identifier: GPL-2.0

//! The fuzzing control loop.
//!
//! One iteration: ask the generator VM for a fresh image, mutate it,
//! push it to the fuzzing VM, mount, exercise, observe. A guest that
//! stops answering goes through crash handling: reset, core fetch,
//! fingerprint, dedup, archive. Everything in between is bookkeeping:
//! counters, timing, the periodic proactive reset, and dynamic scaling of
//! the seed filesystem when the unique-crash stream dries up.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use chrono::{DateTime, Local};
use log::{debug, error, warn};
use owo_colors::OwoColorize;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::archive;
use crate::config::FuzzConfig;
use crate::crashdb::{CrashDb, CrashDbEntry};
use crate::error::FuzzError;
use crate::fingerprint;
use crate::fs::FsKind;
use crate::guest::{
    self, adapter, exec_quiet, ExecReply, GuestOs, GuestTransport, MountOutcome,
};
use crate::mutate::{self, EngineKind, RadamsaOptions};
use crate::workload::{self, CmdOutcome, ListKind};

/// Proactive reset cadence: long-lived guest shells leak descriptors and
/// background tasks.
const RESET_PERIOD: u64 = 150;
const RESET_QUIET_ITERS: u64 = 50;

const SCALING_STALL_ITERS: u64 = 15_000;
const SCALING_STEP_MB: u64 = 50;
const SCALING_CEILING_MB: u64 = 750;
/// Generator overhead reserved out of the size budget, in KB.
const SCALING_RESERVE_KB: u64 = 3000;

/// Current seed-filesystem parameters; dynamic scaling rewrites these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsParams {
    pub kind: FsKind,
    pub size_mb: u64,
    pub files: u64,
    pub max_file_size_kb: u64,
}

/// The proactive reset fires on every 150th iteration that is more than
/// 50 iterations past the last crash.
pub fn should_reset(iter: u64, last_crash_iter: u64) -> bool {
    iter % RESET_PERIOD == 0 && iter.saturating_sub(last_crash_iter) > RESET_QUIET_ITERS
}

/// Grow the seed filesystem after a long unique-less stretch, rebalancing
/// either file count or file size against the new capacity. At the ceiling
/// the parameters snap back to the small per-kind defaults.
pub fn rescale(params: &mut FsParams, iter: u64, last_unique_iter: &mut u64, rng: &mut StdRng) {
    if params.size_mb >= SCALING_CEILING_MB {
        if params.kind == FsKind::Zfs {
            *params = FsParams { size_mb: 65, files: 20, max_file_size_kb: 2048, ..*params };
        } else {
            *params = FsParams { size_mb: 15, files: 10, max_file_size_kb: 1024, ..*params };
        }
        return;
    }
    if iter.saturating_sub(*last_unique_iter) >= SCALING_STALL_ITERS {
        // advance the guard so the grown filesystem gets a full stall
        // window before the next recompute
        *last_unique_iter += SCALING_STALL_ITERS;
        params.size_mb += SCALING_STEP_MB;
        let budget_kb = (params.size_mb << 10) - SCALING_RESERVE_KB;
        if rng.gen_range(0..2) == 0 {
            params.files = (budget_kb / params.max_file_size_kb.max(1)).max(1);
        } else {
            params.max_file_size_kb = (budget_kb / params.files.max(1)).max(1);
        }
    }
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 * 10_000.0 / whole as f64).round() / 100.0
}

/// Counters and timing for one fuzzer instance.
pub struct FuzzerState {
    pub iter: u64,
    pub crashes: u64,
    pub ucrashes: u64,
    pub success_mounts: u64,
    pub last_crash_iter: u64,
    pub last_unique_iter: u64,
    pub max_exec: u64,
    pub actual_exec: u64,
    pub last_panic: String,
    pub last_iter_secs: f64,
    pub total_iter_secs: f64,
    pub avg_iter_secs: f64,
    pub start: DateTime<Local>,
}

impl FuzzerState {
    fn new() -> Self {
        FuzzerState {
            iter: 0,
            crashes: 0,
            ucrashes: 0,
            success_mounts: 0,
            last_crash_iter: 0,
            last_unique_iter: 0,
            max_exec: 0,
            actual_exec: 0,
            last_panic: String::new(),
            last_iter_secs: 0.0,
            total_iter_secs: 0.0,
            avg_iter_secs: 0.0,
            start: Local::now(),
        }
    }

    pub fn runtime(&self) -> String {
        let secs = Local::now()
            .signed_duration_since(self.start)
            .num_seconds()
            .max(0);
        format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

enum IterOutcome {
    Clean,
    Crashed,
}

pub struct Fuzzer {
    cfg: FuzzConfig,
    params: FsParams,
    state: FuzzerState,
    rng: StdRng,
    os: GuestOs,
    guest: Box<dyn GuestTransport>,
    generator: Box<dyn GuestTransport>,
    crash_db: CrashDb,
    stop: Arc<AtomicBool>,

    // artifacts of the running iteration, archived on crash
    seed_image: Option<PathBuf>,
    mutated_image: Option<PathBuf>,
    radamsa_seed: Option<u128>,
    layout_log: Option<String>,
}

impl Fuzzer {
    pub fn new(
        cfg: FuzzConfig,
        guest: Box<dyn GuestTransport>,
        generator: Box<dyn GuestTransport>,
        stop: Arc<AtomicBool>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(cfg.storage_dir())?;
        std::fs::create_dir_all(cfg.crash_root())?;
        std::fs::create_dir_all(cfg.stats_dir())?;

        let os = adapter::probe_os(guest.as_ref()).context("probing guest OS")?;
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let params = FsParams {
            kind: cfg.fs_kind,
            size_mb: cfg.fs_size_mb,
            files: cfg.fs_files,
            max_file_size_kb: cfg.max_file_size_kb,
        };
        let crash_db = CrashDb::new(&cfg.crash_db_path());

        Ok(Fuzzer {
            cfg,
            params,
            state: FuzzerState::new(),
            rng,
            os,
            guest,
            generator,
            crash_db,
            stop,
            seed_image: None,
            mutated_image: None,
            radamsa_seed: None,
            layout_log: None,
        })
    }

    pub fn state(&self) -> &FuzzerState {
        &self.state
    }

    /// Loop until interrupted; statistics are flushed on the way out.
    pub fn run(&mut self) -> anyhow::Result<()> {
        while !self.stop.load(Ordering::Relaxed) {
            self.run_one()?;
        }
        self.save_stats()
    }

    /// One full pass of the iteration state machine.
    pub fn run_one(&mut self) -> anyhow::Result<()> {
        if self.cfg.dyn_scaling {
            rescale(
                &mut self.params,
                self.state.iter,
                &mut self.state.last_unique_iter,
                &mut self.rng,
            );
        }

        let started = Instant::now();
        self.maybe_reset();

        if let Err(e) = self.iteration() {
            match e.downcast_ref::<FuzzError>() {
                Some(FuzzError::TransportTimeout(_)) | Some(FuzzError::GuestUnresponsive) => {
                    error!("guest transport failure: {e}; treating as crash");
                    self.crash_handle(0);
                }
                Some(FuzzError::NoSuperblock(_))
                | Some(FuzzError::ImageTooSmall { .. })
                | Some(FuzzError::MalformedImage { .. })
                | Some(FuzzError::UnknownFilesystem(_)) => {
                    warn!("mutation skipped: {e}");
                }
                Some(FuzzError::Io(_)) => error!("host-side failure, skipping iteration: {e}"),
                _ => return Err(e),
            }
        }

        self.state.iter += 1;
        self.state.last_iter_secs = started.elapsed().as_secs_f64();
        self.state.total_iter_secs += self.state.last_iter_secs;
        self.state.avg_iter_secs = self.state.total_iter_secs / self.state.iter as f64;
        self.print_status();
        Ok(())
    }

    fn iteration(&mut self) -> anyhow::Result<()> {
        self.seed_image = None;
        self.mutated_image = None;
        self.radamsa_seed = None;
        self.layout_log = None;

        let (seed_image, layout) = self.generate()?;
        self.seed_image = Some(seed_image.clone());
        self.layout_log = Some(layout);

        let mutation = mutate::run_engine(
            self.cfg.engine,
            &seed_image,
            self.cfg.engine_bytes,
            &mut self.rng,
            &RadamsaOptions::default(),
        )?;
        self.radamsa_seed = mutation.seed;
        self.mutated_image = Some(mutation.path.clone());

        self.guest.copy_to_guest(&[mutation.path.clone()], "/tmp")?;

        let basename = mutation
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        // ZFS mounts under its pool name, not the image name
        let mount_name = if self.params.kind == FsKind::Zfs {
            let tail: Vec<&str> = basename.split('_').skip(1).collect();
            format!("pool_{}", tail.join("_"))
        } else {
            basename.clone()
        };

        let outcome = self.automate(&format!("/tmp/{basename}"), &format!("/mnt/{mount_name}"))?;

        exec_quiet(self.guest.as_ref(), &format!("rm -rf /tmp/{basename}"));
        if matches!(outcome, IterOutcome::Clean) {
            self.remove_iteration_images();
        }
        Ok(())
    }

    /// Ask the generator VM for a fresh image; returns the host-side path
    /// and the layout log JSON. A dead generator is restored and the same
    /// generation retried once; the second failure is fatal.
    fn generate(&mut self) -> anyhow::Result<(PathBuf, String)> {
        let fs_name = format!("{}_{}_{}MB", self.cfg.name, self.params.kind, self.params.size_mb);
        let cmd = format!(
            "{} -fs {} -m 1 -n \"{}\" -s {} -p {} -ps {} -o /tmp/",
            self.cfg.generator_cmd,
            self.params.kind,
            fs_name,
            self.params.size_mb,
            self.params.files,
            self.params.max_file_size_kb,
        );

        if !self.generator.liveness() {
            warn!("generator VM unresponsive before generation");
            self.restore_generator()?;
        }

        let layout = match exec_quiet(self.generator.as_ref(), &cmd) {
            ExecReply::Output(s) if !s.contains("ERROR") => s,
            ExecReply::Output(s) => bail!("filesystem generation failed: {s}"),
            first => {
                warn!("generation attempt failed ({first:?}), restoring generator VM");
                self.restore_generator()?;
                match exec_quiet(self.generator.as_ref(), &cmd) {
                    ExecReply::Output(s) if !s.contains("ERROR") => s,
                    other => bail!("generator VM failed twice: {other:?}"),
                }
            }
        };

        self.generator
            .copy_to_host(&[format!("/tmp/{fs_name}")], &self.cfg.storage_dir())?;
        exec_quiet(self.generator.as_ref(), &format!("/bin/rm -rf /tmp/{fs_name}"));
        exec_quiet(self.generator.as_ref(), &format!("/bin/rm -rf /mnt/{fs_name}"));

        Ok((self.cfg.storage_dir().join(fs_name), layout))
    }

    fn restore_generator(&mut self) -> anyhow::Result<()> {
        if let Some(snap) = self.generator.current_snapshot() {
            self.generator.restore_snapshot(&snap)?;
        }
        self.generator.boot()?;
        Ok(())
    }

    /// Mount, exercise, unmount, or hand off to crash handling.
    fn automate(&mut self, remote_image: &str, mount_at: &str) -> anyhow::Result<IterOutcome> {
        let mut fs_adapter =
            adapter::adapter_for(self.os, remote_image.to_string(), mount_at.to_string());
        debug!("mounting {remote_image} via {} adapter", fs_adapter.os());
        let mut syscall_log = File::create(self.cfg.syscall_log_path())?;

        match fs_adapter.mount_file_system(self.guest.as_ref()) {
            MountOutcome::Mounted if self.guest.liveness() => {
                println!("{}", "[+] Mounting successful!".green());
                self.state.success_mounts += 1;

                if self.exercise(&mut syscall_log, mount_at)? {
                    self.crash_handle(0);
                    return Ok(IterOutcome::Crashed);
                }
                if fs_adapter.unmount_file_system(self.guest.as_ref()) && self.guest.liveness() {
                    println!("{}", format!("[+] Unmounted {mount_at} successfully").green());
                    Ok(IterOutcome::Clean)
                } else {
                    self.crash_handle(0);
                    Ok(IterOutcome::Crashed)
                }
            }
            MountOutcome::Refused => {
                println!("{}", "[!] Mounting failed!".red());
                let released =
                    matches!(fs_adapter.destroy_block_device(self.guest.as_ref()), ExecReply::Empty);
                if released && self.guest.liveness() {
                    debug!("{}", FuzzError::MountFailed(mount_at.to_string()));
                    Ok(IterOutcome::Clean)
                } else {
                    writeln!(syscall_log, "[!] mount")?;
                    self.crash_handle(0);
                    Ok(IterOutcome::Crashed)
                }
            }
            _ => {
                println!("{}", "[!] Mounting failed!".red());
                writeln!(syscall_log, "[!] mount")?;
                syscall_log.flush()?;
                self.crash_handle(0);
                Ok(IterOutcome::Crashed)
            }
        }
    }

    /// Issue the workload; true means the guest died under it.
    fn exercise(&mut self, log: &mut File, mount_at: &str) -> anyhow::Result<bool> {
        println!(
            "{}",
            format!("\t[*] Accessing & modifying mounted filesystem: {mount_at}").yellow()
        );

        let templates = workload::templates(self.os, mount_at, &mut self.rng);
        self.state.max_exec += templates.len() as u64;

        let files = workload::list_entries(self.guest.as_ref(), mount_at, ListKind::Files);
        let dirs = workload::list_entries(self.guest.as_ref(), mount_at, ListKind::Dirs);

        let mut executed = 0u64;
        for template in &templates {
            let cmd = if template.needs_substitution() {
                match workload::pick_distinct(&files, &dirs, &mut self.rng) {
                    Some((file, dir)) => template.render(&file, &dir),
                    None => {
                        writeln!(log, "[-] {}", template.render("?", "?"))?;
                        continue;
                    }
                }
            } else {
                template.render("", "")
            };

            let reply = exec_quiet(self.guest.as_ref(), &cmd);
            debug!("ret val for {cmd}: {reply:?}");
            let alive = !reply.is_transport_failure() || self.guest.liveness();

            match workload::classify(&cmd, &reply, alive) {
                CmdOutcome::Success => {
                    writeln!(log, "[+] {cmd}")?;
                    log.flush()?;
                    executed += 1;
                }
                CmdOutcome::Failed => {
                    match reply.output() {
                        Some(out) => writeln!(log, "[-] {cmd}\n>>{out}")?,
                        None => writeln!(log, "[-] {cmd}")?,
                    }
                    log.flush()?;
                }
                CmdOutcome::Crashed => {
                    writeln!(log, "[!] {cmd}")?;
                    log.flush()?;
                    println!(
                        "{}",
                        format!("[*] Completed {executed}/{} program calls", templates.len())
                            .yellow()
                    );
                    self.state.actual_exec += executed;
                    return Ok(true);
                }
            }
        }

        println!(
            "{}",
            format!("[*] Completed {executed}/{} program calls", templates.len()).yellow()
        );
        self.state.actual_exec += executed;
        Ok(false)
    }

    /// Reset the guest, fetch and archive the core, deduplicate. A nested
    /// transport failure retries once, then falls through to snapshot
    /// restore.
    fn crash_handle(&mut self, depth: u8) {
        self.state.last_crash_iter = self.state.iter;
        println!("{}", "[*] Checking for crash dump..!".yellow());

        if let Err(e) = self.guest.reset() {
            warn!("guest reset failed: {e}");
        }

        match guest::fetch_latest_cores(self.guest.as_ref(), &self.cfg.crash_root()) {
            Ok(Some(crash_dir)) => {
                if let Err(e) = self.archive_crash(&crash_dir) {
                    error!("failed to archive crash: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!("transport failure during crash handling: {e}");
                if depth == 0 && self.guest.liveness() {
                    self.crash_handle(depth + 1);
                    return;
                }
                // a guest stuck in a boot loop only comes back by snapshot
                if let Some(snap) = self.guest.current_snapshot() {
                    let _ = self.guest.restore_snapshot(&snap);
                }
                let _ = self.guest.boot();
            }
        }

        if let Err(e) = self.save_stats() {
            error!("failed to save stats: {e}");
        }
    }

    fn archive_crash(&mut self, crash_dir: &std::path::Path) -> anyhow::Result<()> {
        let core_txt = std::fs::read_dir(crash_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().starts_with("core"))
                    .unwrap_or(false)
            })
            .context("crash directory has no core text")?;

        let Some(fp) = fingerprint::fingerprint(&std::fs::read(&core_txt)?) else {
            warn!("core text has no usable fingerprint, leaving {}", crash_dir.display());
            return Ok(());
        };

        self.state.crashes += 1;
        self.state.last_panic = fp.panic_label.clone();
        archive::write_shasum(crash_dir, &fp.stack_hash)?;

        let mut samples = Vec::new();
        if let Some(m) = &self.mutated_image {
            samples.push(m.clone());
        }
        if let Some(s) = &self.seed_image {
            samples.push(s.clone());
        }
        samples.push(self.cfg.syscall_log_path());
        archive::write_sample_bundle(crash_dir, &samples)?;

        let dir_name = crash_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let renamed = crash_dir.with_file_name(format!("{dir_name}_{}", fp.panic_label));
        std::fs::rename(crash_dir, &renamed)?;

        let engine = match (self.cfg.engine, self.radamsa_seed) {
            (EngineKind::Radamsa, Some(seed)) => format!("radamsa (seed: {seed})"),
            (engine, _) => engine.to_string(),
        };
        let entry = CrashDbEntry {
            fuzzer: self.cfg.name.clone(),
            vm_name: self.cfg.fuzz_vm.name.clone(),
            fs_kind: self.params.kind.to_string(),
            fs_size: format!("{}MB", self.params.size_mb),
            engine,
            panic_label: fp.panic_label.clone(),
            stack_hash: fp.stack_hash.clone(),
            crash_dir: renamed.clone(),
            runtime: self.state.runtime(),
            iteration: self.state.iter,
        };
        if self.crash_db.append_if_new(&entry)? {
            self.state.ucrashes += 1;
            self.state.last_unique_iter = self.state.iter;
            println!(
                "{}",
                format!("[+] New unseen crash found: {}!", fp.stack_hash).cyan()
            );
        }

        if let Some(layout) = &self.layout_log {
            archive::write_fs_json(&renamed, layout, self.radamsa_seed, &fp.panic_label)?;
        }
        exec_quiet(self.guest.as_ref(), "/bin/rm -rf /var/crash/*");
        archive::compress_vmcore(&renamed)?;
        Ok(())
    }

    fn maybe_reset(&mut self) {
        if !should_reset(self.state.iter, self.state.last_crash_iter) {
            return;
        }
        warn!("automatic VM reset in progress...");
        if let Some(snap) = self.guest.current_snapshot() {
            if self.guest.restore_snapshot(&snap).is_err() && !self.guest.liveness() {
                self.crash_handle(0);
            }
        }
    }

    fn remove_iteration_images(&mut self) {
        for path in [self.seed_image.take(), self.mutated_image.take()].into_iter().flatten() {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!("could not remove {}: {e}", path.display());
            }
        }
    }

    fn print_status(&self) {
        let s = &self.state;
        println!("{}", "─".repeat(100));
        println!(
            "Start date: {} | Runtime: {} | OS: {} | Mutation engine: {}\n\
             Filesystem type: {} | Filesystem size: {}MB\n\
             Iteration: {} | Last iteration time: {:.2}s | Avg. iteration time: {:.2}s\n\
             # Crashes: {} | # New crashes: {} | Last panic: {} | Last new crash (iter): {}\n\
             Successful mounts: {} ({}%) | {}/{} ({}%) Commands executed",
            s.start.format("%Y-%m-%d %H:%M:%S"),
            s.runtime(),
            self.os,
            self.cfg.engine,
            self.params.kind,
            self.params.size_mb,
            s.iter,
            s.last_iter_secs,
            s.avg_iter_secs,
            s.crashes,
            s.ucrashes,
            s.last_panic,
            s.last_unique_iter,
            s.success_mounts,
            percentage(s.success_mounts, s.iter),
            s.actual_exec,
            s.max_exec,
            percentage(s.actual_exec, s.max_exec),
        );
        println!("{}", "─".repeat(100));
    }

    /// Flush the run statistics; called on exit, interrupt, and after
    /// every crash so a killed run still leaves numbers behind.
    pub fn save_stats(&self) -> anyhow::Result<()> {
        let s = &self.state;
        let image_name = self
            .mutated_image
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.cfg.name.clone());
        let path = self.cfg.stats_dir().join(format!(
            "{}_{image_name}.txt",
            s.start.format("%Y-%m-%dT%H_%M_%S")
        ));

        let mut out = File::create(path)?;
        writeln!(out, "> Start date: {}", s.start.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(out, "> End date: {}", Local::now().format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(out, "> Engine: {}", self.cfg.engine)?;
        writeln!(out, "> Runtime: {}", s.runtime())?;
        writeln!(out, "> File system name: {image_name}")?;
        writeln!(out, "> File system type: {}", self.params.kind)?;
        writeln!(out, "> File system size: {}MB", self.params.size_mb)?;
        writeln!(out, "> #Files in initial file system: {}", self.params.files)?;
        writeln!(out, "> #Max_size of files: {}KB", self.params.max_file_size_kb)?;
        writeln!(out, "> Iterations: {}", s.iter)?;
        writeln!(out, "> Avg Iteration time: {:.2}s", s.avg_iter_secs)?;
        writeln!(out, "> #Crashes: {}", s.crashes)?;
        writeln!(out, "> #Unique_Crashes: {}", s.ucrashes)?;
        writeln!(
            out,
            "> #Successful_Mounts: {}({}%)",
            s.success_mounts,
            percentage(s.success_mounts, s.iter)
        )?;
        writeln!(out, "> #Unsuccessful_Mounts {}", s.iter.saturating_sub(s.success_mounts))?;
        writeln!(
            out,
            "> {}/{} ({}%) Commands executed",
            s.actual_exec,
            s.max_exec,
            percentage(s.actual_exec, s.max_exec)
        )?;
        Ok(())
    }
}
