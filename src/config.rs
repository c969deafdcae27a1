//! Per-instance run configuration.
//!
//! One `FuzzConfig` fully describes a fuzzing instance: the two VMs, the
//! mutation engine, the seed filesystem parameters, and the working
//! directory. Instances are independent processes and share nothing but
//! the crash registry.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::fs::FsKind;
use crate::mutate::EngineKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    /// libvirt domain name
    pub name: String,
    pub user: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzConfig {
    /// Internal name of this instance, used in file names and the registry.
    pub name: String,
    pub fuzz_vm: VmConfig,
    pub generator_vm: VmConfig,

    pub engine: EngineKind,
    /// Bytes to mutate; informational for radamsa.
    #[serde(default = "default_engine_bytes")]
    pub engine_bytes: usize,

    pub fs_kind: FsKind,
    #[serde(default = "default_fs_size_mb")]
    pub fs_size_mb: u64,
    #[serde(default = "default_fs_files")]
    pub fs_files: u64,
    #[serde(default = "default_max_file_size_kb")]
    pub max_file_size_kb: u64,

    /// Grow the seed filesystem when the unique-crash stream stalls.
    #[serde(default)]
    pub dyn_scaling: bool,

    /// Run-wide RNG seed; a fixed value replays every mutation decision.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Host directory holding file_system_storage/, crash_dumps/, stats/.
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,

    /// Generator program on the generator VM.
    #[serde(default = "default_generator_cmd")]
    pub generator_cmd: String,
}

fn default_engine_bytes() -> usize {
    3
}

fn default_fs_size_mb() -> u64 {
    20
}

fn default_fs_files() -> u64 {
    20
}

fn default_max_file_size_kb() -> u64 {
    1024
}

fn default_workdir() -> PathBuf {
    PathBuf::from(".")
}

fn default_generator_cmd() -> String {
    "/tmp/makefs".to_string()
}

impl FuzzConfig {
    /// Load a list of instance configurations from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Vec<FuzzConfig>> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.workdir.join("file_system_storage")
    }

    pub fn crash_root(&self) -> PathBuf {
        self.workdir.join("crash_dumps")
    }

    pub fn stats_dir(&self) -> PathBuf {
        self.workdir.join("stats")
    }

    pub fn crash_db_path(&self) -> PathBuf {
        self.crash_root().join("crash.db")
    }

    pub fn syscall_log_path(&self) -> PathBuf {
        self.storage_dir().join(format!("{}_syscall.log", self.name))
    }
}
