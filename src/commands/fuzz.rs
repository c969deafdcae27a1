use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use crate::config::{FuzzConfig, VmConfig};
use crate::fs::FsKind;
use crate::fuzzer::Fuzzer;
use crate::guest::{GuestTransport, ShellTransport};
use crate::mutate::EngineKind;

/// Run one fuzzing instance against a guest VM
#[derive(Parser, Debug)]
#[command(about = "Run the fuzzing control loop")]
pub struct FuzzCli {
    /// JSON run description (a list of instances); flags are ignored
    /// when given
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Instance index inside the config file
    #[arg(long, default_value_t = 0)]
    instance: usize,

    /// Internal name for this instance
    #[arg(long, default_value = "fuzz1")]
    name: String,

    /// libvirt domain of the fuzzing VM
    #[arg(long)]
    fuzz_vm: Option<String>,
    /// ssh host of the fuzzing VM
    #[arg(long)]
    fuzz_host: Option<String>,

    /// libvirt domain of the generator VM
    #[arg(long)]
    gen_vm: Option<String>,
    /// ssh host of the generator VM
    #[arg(long)]
    gen_host: Option<String>,

    /// ssh user on both VMs
    #[arg(long, default_value = "root")]
    user: String,

    /// Mutation engine [radamsa, byte_flip_seq, byte_flip_rnd, metadata]
    #[arg(long, default_value = "radamsa")]
    engine: EngineKind,

    /// Mutation size in bytes (ignored by radamsa)
    #[arg(long, default_value_t = 3)]
    bytes: usize,

    /// Seed filesystem kind [ufs1, ufs2, ext2, ext3, ext4, zfs]
    #[arg(long, default_value = "ufs2")]
    fs: FsKind,

    /// Seed filesystem size in MB
    #[arg(long, default_value_t = 20)]
    size: u64,

    /// Files placed on the seed filesystem
    #[arg(long, default_value_t = 20)]
    files: u64,

    /// Maximum size of each generated file in KB
    #[arg(long, default_value_t = 1024)]
    max_file_size: u64,

    /// Grow the filesystem when no new unique crash shows up
    #[arg(long)]
    dyn_scaling: bool,

    /// Run-wide RNG seed for reproducible mutation decisions
    #[arg(long)]
    seed: Option<u64>,

    /// Working directory for images, crashes and stats
    #[arg(long, default_value = ".")]
    workdir: PathBuf,
}

impl FuzzCli {
    fn into_config(self) -> Result<FuzzConfig> {
        if let Some(path) = &self.config {
            let mut configs = FuzzConfig::load(path)?;
            return configs
                .drain(..)
                .nth(self.instance)
                .ok_or_else(|| anyhow!("config has no instance {}", self.instance));
        }

        let fuzz_vm = self.fuzz_vm.ok_or_else(|| anyhow!("--fuzz-vm required"))?;
        let fuzz_host = self.fuzz_host.ok_or_else(|| anyhow!("--fuzz-host required"))?;
        let gen_vm = self.gen_vm.ok_or_else(|| anyhow!("--gen-vm required"))?;
        let gen_host = self.gen_host.ok_or_else(|| anyhow!("--gen-host required"))?;

        Ok(FuzzConfig {
            name: self.name,
            fuzz_vm: VmConfig { name: fuzz_vm, user: self.user.clone(), host: fuzz_host, port: 22 },
            generator_vm: VmConfig { name: gen_vm, user: self.user, host: gen_host, port: 22 },
            engine: self.engine,
            engine_bytes: self.bytes,
            fs_kind: self.fs,
            fs_size_mb: self.size,
            fs_files: self.files,
            max_file_size_kb: self.max_file_size,
            dyn_scaling: self.dyn_scaling,
            seed: self.seed,
            workdir: self.workdir,
            generator_cmd: "/tmp/makefs".to_string(),
        })
    }
}

pub fn cmd_fuzz(argv: Vec<String>) -> Result<()> {
    let cfg = FuzzCli::parse_from(argv).into_config()?;

    let guest = ShellTransport::new(
        &cfg.fuzz_vm.user,
        &cfg.fuzz_vm.host,
        cfg.fuzz_vm.port,
        &cfg.fuzz_vm.name,
    );
    let generator = ShellTransport::new(
        &cfg.generator_vm.user,
        &cfg.generator_vm.host,
        cfg.generator_vm.port,
        &cfg.generator_vm.name,
    );
    guest.boot().context("booting fuzzing VM")?;
    generator.boot().context("booting generator VM")?;

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        eprintln!("Observed Ctrl+C! Exiting...");
        handler_stop.store(true, Ordering::Relaxed);
    })
    .context("installing interrupt handler")?;

    let mut fuzzer = Fuzzer::new(cfg, Box::new(guest), Box::new(generator), stop)?;
    fuzzer.run()
}
