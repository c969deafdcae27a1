//! Capability interface over the per-OS mount plumbing.
//!
//! Each target OS wires a raw image file to a block device and mounts it
//! with its own tools; the controller only sees [`FsAdapter`]. The OS is
//! probed once per boot with `uname` and the matching adapter constructed
//! from it.

use strum::{Display, EnumString};

use crate::error::{FuzzError, Result};
use crate::guest::{exec_quiet, mkdir_p, rm_rf, ExecReply, GuestTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum GuestOs {
    FreeBsd,
    NetBsd,
    OpenBsd,
    Linux,
}

/// What the guest's `file(1)` said about the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestFsType {
    Ext2,
    Ext3,
    Ext4,
    Ufs,
    /// `file` saw only "data", which is what a ZFS member looks like to it.
    Data,
    Unknown,
}

impl GuestFsType {
    pub fn is_ext(self) -> bool {
        matches!(self, GuestFsType::Ext2 | GuestFsType::Ext3 | GuestFsType::Ext4)
    }
}

/// Mount attempt results, distinguished by what the guest did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    /// Mount observed in the guest.
    Mounted,
    /// Clean refusal; guest still responsive.
    Refused,
    /// Guest died during the mount.
    Crashed,
}

/// Per-OS mount capabilities. Adapters are stateful across one iteration:
/// they remember the block device (and pool) they created so unmount can
/// release it.
pub trait FsAdapter {
    fn os(&self) -> GuestOs;

    fn make_block_device(&mut self, t: &dyn GuestTransport);
    fn destroy_block_device(&mut self, t: &dyn GuestTransport) -> ExecReply;
    fn mount_file_system(&mut self, t: &dyn GuestTransport) -> MountOutcome;
    /// True on a clean unmount with the block device released.
    fn unmount_file_system(&mut self, t: &dyn GuestTransport) -> bool;
}

/// Identify the guest OS with one `uname`.
pub fn probe_os(t: &dyn GuestTransport) -> Result<GuestOs> {
    match exec_quiet(t, "uname") {
        ExecReply::Output(s) => {
            let sys = s.trim().to_lowercase();
            match sys.as_str() {
                "freebsd" => Ok(GuestOs::FreeBsd),
                "netbsd" => Ok(GuestOs::NetBsd),
                "openbsd" => Ok(GuestOs::OpenBsd),
                "linux" => Ok(GuestOs::Linux),
                other => Err(FuzzError::Io(std::io::Error::other(format!(
                    "unsupported guest kernel: {other}"
                )))),
            }
        }
        ExecReply::TransportFailed => Err(FuzzError::TransportTimeout("uname".into())),
        _ => Err(FuzzError::GuestUnresponsive),
    }
}

/// Construct the adapter for a guest OS, mounting `remote_image` at
/// `mount_at`.
pub fn adapter_for(os: GuestOs, remote_image: String, mount_at: String) -> Box<dyn FsAdapter> {
    match os {
        GuestOs::FreeBsd => Box::new(super::freebsd::FreeBsdAdapter::new(remote_image, mount_at)),
        GuestOs::NetBsd => Box::new(super::netbsd::NetBsdAdapter::new(remote_image, mount_at)),
        GuestOs::OpenBsd => Box::new(super::openbsd::OpenBsdAdapter::new(remote_image, mount_at)),
        GuestOs::Linux => Box::new(super::linux::LinuxAdapter::new(remote_image, mount_at)),
    }
}

/// The mount point is recreated from scratch every iteration.
pub(crate) fn clean_mount_dir(t: &dyn GuestTransport, mount_at: &str) {
    rm_rf(t, mount_at);
    mkdir_p(t, mount_at);
}

/// Ask the guest's `file(1)` what the image is.
pub(crate) fn determine_fs_type(t: &dyn GuestTransport, rfile: &str) -> GuestFsType {
    if !t.liveness() {
        return GuestFsType::Unknown;
    }
    match exec_quiet(t, &format!("/usr/bin/file {rfile}")) {
        ExecReply::Output(s) => parse_file_output(&s),
        _ => GuestFsType::Unknown,
    }
}

fn parse_file_output(out: &str) -> GuestFsType {
    if out.contains("ext2 filesystem data") {
        GuestFsType::Ext2
    } else if out.contains("ext3 filesystem data") {
        GuestFsType::Ext3
    } else if out.contains("ext4 filesystem data") {
        GuestFsType::Ext4
    } else if out.contains("Unix Fast File system") || out.contains("4.3bsd") {
        GuestFsType::Ufs
    } else if out.contains("data") {
        GuestFsType::Data
    } else {
        GuestFsType::Unknown
    }
}

/// Shared failure classification: a refused mount with a live guest is
/// clean, anything else is a crash.
pub(crate) fn failed_mount_outcome(t: &dyn GuestTransport) -> MountOutcome {
    if t.liveness() {
        MountOutcome::Refused
    } else {
        MountOutcome::Crashed
    }
}
