//! Guest-facing interfaces: the transport the controller talks through,
//! and the per-OS mount adapters built on top of it.

pub mod adapter;
pub mod freebsd;
pub mod linux;
pub mod netbsd;
pub mod openbsd;
pub mod ssh;

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error};

use crate::error::{FuzzError, Result};

pub use self::adapter::{FsAdapter, GuestOs, MountOutcome};
pub use self::ssh::ShellTransport;

pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecReply {
    /// Command ran and printed something.
    Output(String),
    /// Command ran silently; success for mutating shell commands.
    Empty,
    /// The transport itself failed (connection refused, dropped, timed
    /// out). With a failing liveness probe this is the crash signal.
    TransportFailed,
    /// Output was not decodable text.
    Garbled,
}

impl ExecReply {
    pub fn output(&self) -> Option<&str> {
        match self {
            ExecReply::Output(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_transport_failure(&self) -> bool {
        matches!(self, ExecReply::TransportFailed)
    }
}

/// Remote side of the fuzzer: command execution, file copy in both
/// directions, liveness, and snapshot control. Implemented over ssh/virsh
/// for real guests and by a scripted double in tests.
pub trait GuestTransport {
    fn exec(&self, cmd: &str, timeout: Duration) -> ExecReply;

    fn copy_to_guest(&self, local_files: &[PathBuf], remote_dir: &str) -> Result<()>;
    fn copy_to_host(&self, remote_files: &[String], local_dir: &Path) -> Result<()>;

    /// TCP probe of the guest's ssh port, 3 second deadline.
    fn liveness(&self) -> bool;

    fn restore_snapshot(&self, name: &str) -> Result<()>;
    fn current_snapshot(&self) -> Option<String>;
    fn reset(&self) -> Result<()>;
    fn boot(&self) -> Result<()>;
}

// Shared handles count as transports, so a caller can keep one end while
// the controller owns the other.
impl<T: GuestTransport + ?Sized> GuestTransport for std::rc::Rc<T> {
    fn exec(&self, cmd: &str, timeout: Duration) -> ExecReply {
        (**self).exec(cmd, timeout)
    }

    fn copy_to_guest(&self, local_files: &[PathBuf], remote_dir: &str) -> Result<()> {
        (**self).copy_to_guest(local_files, remote_dir)
    }

    fn copy_to_host(&self, remote_files: &[String], local_dir: &Path) -> Result<()> {
        (**self).copy_to_host(remote_files, local_dir)
    }

    fn liveness(&self) -> bool {
        (**self).liveness()
    }

    fn restore_snapshot(&self, name: &str) -> Result<()> {
        (**self).restore_snapshot(name)
    }

    fn current_snapshot(&self) -> Option<String> {
        (**self).current_snapshot()
    }

    fn reset(&self) -> Result<()> {
        (**self).reset()
    }

    fn boot(&self) -> Result<()> {
        (**self).boot()
    }
}

/// `exec` with the default timeout.
pub fn exec_quiet(t: &dyn GuestTransport, cmd: &str) -> ExecReply {
    t.exec(cmd, DEFAULT_EXEC_TIMEOUT)
}

pub fn mkdir_p(t: &dyn GuestTransport, path: &str) -> ExecReply {
    exec_quiet(t, &format!("/bin/mkdir -p {path}"))
}

pub fn rm_rf(t: &dyn GuestTransport, path: &str) -> ExecReply {
    exec_quiet(t, &format!("/bin/rm -rf {path}"))
}

const FIND_LATEST_CORE: &str = r#"/usr/bin/find /var/crash -name "core*" -print0 | /usr/bin/xargs -0 ls -t | /usr/bin/head -n1"#;
const FIND_LATEST_VMCORE: &str = r#"/usr/bin/find /var/crash -name "vmcore*" -print0 | /usr/bin/xargs -0 ls -t | /usr/bin/head -n1"#;

/// Locate the newest `core.txt`/`vmcore` pair under `/var/crash` and pull
/// both into a fresh timestamped directory under `crash_root`. Returns the
/// new directory, or `None` when the guest has no usable core.
pub fn fetch_latest_cores(t: &dyn GuestTransport, crash_root: &Path) -> Result<Option<PathBuf>> {
    let core = match exec_quiet(t, FIND_LATEST_CORE) {
        ExecReply::Output(s) => s.trim().to_string(),
        ExecReply::TransportFailed => {
            return Err(FuzzError::TransportTimeout("core lookup".into()))
        }
        _ => return Ok(None),
    };
    let vmcore = match exec_quiet(t, FIND_LATEST_VMCORE) {
        ExecReply::Output(s) => s.trim().to_string(),
        ExecReply::TransportFailed => {
            return Err(FuzzError::TransportTimeout("vmcore lookup".into()))
        }
        _ => return Ok(None),
    };

    // A crash that died before dumping leaves a stub core.txt behind.
    let size_cmd = format!(r#"/usr/bin/stat {core} | /usr/bin/cut -d" " -f8"#);
    let usable = match exec_quiet(t, &size_cmd) {
        ExecReply::Output(s) => s.trim().parse::<u64>().map(|n| n > 1).unwrap_or(false),
        ExecReply::TransportFailed => {
            return Err(FuzzError::TransportTimeout("core stat".into()))
        }
        _ => false,
    };
    if !usable {
        error!("no usable core files found in /var/crash");
        return Ok(None);
    }

    let stamp = chrono::Local::now().format("%Y-%m-%dT%H_%M_%S");
    let crash_dir = crash_root.join(stamp.to_string());
    std::fs::create_dir_all(&crash_dir)?;

    debug!("fetching cores {core} / {vmcore} into {}", crash_dir.display());
    t.copy_to_host(&[core, vmcore], &crash_dir)?;
    Ok(Some(crash_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeTransport, TestTempDir};

    #[test]
    fn fetch_pulls_the_newest_core_pair() {
        let dir = TestTempDir::new("fetch-cores");
        let t = FakeTransport::new();
        t.reply(r#"-name "core*""#, ExecReply::Output("/var/crash/core.txt.3".into()));
        t.reply(r#"-name "vmcore*""#, ExecReply::Output("/var/crash/vmcore.3".into()));
        t.reply("/usr/bin/stat", ExecReply::Output("48731".into()));

        let crash_dir = fetch_latest_cores(&t, dir.path()).unwrap().unwrap();
        assert!(crash_dir.starts_with(dir.path()));
        assert_eq!(
            *t.copied_to_host.borrow(),
            vec!["/var/crash/core.txt.3".to_string(), "/var/crash/vmcore.3".to_string()]
        );
    }

    #[test]
    fn fetch_without_cores_is_none() {
        let dir = TestTempDir::new("fetch-none");
        let t = FakeTransport::new();
        // unscripted commands return Empty
        assert!(fetch_latest_cores(&t, dir.path()).unwrap().is_none());
    }

    #[test]
    fn fetch_surfaces_transport_failure() {
        let dir = TestTempDir::new("fetch-dead");
        let t = FakeTransport::new();
        t.reply(r#"-name "core*""#, ExecReply::TransportFailed);
        assert!(matches!(
            fetch_latest_cores(&t, dir.path()),
            Err(FuzzError::TransportTimeout(_))
        ));
    }

    #[test]
    fn stub_core_is_ignored() {
        let dir = TestTempDir::new("fetch-stub");
        let t = FakeTransport::new();
        t.reply(r#"-name "core*""#, ExecReply::Output("/var/crash/core.txt.0".into()));
        t.reply(r#"-name "vmcore*""#, ExecReply::Output("/var/crash/vmcore.0".into()));
        t.reply("/usr/bin/stat", ExecReply::Output("1".into()));
        assert!(fetch_latest_cores(&t, dir.path()).unwrap().is_none());
    }
}
