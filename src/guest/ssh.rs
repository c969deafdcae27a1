//! Subprocess-backed guest transport: `ssh`/`scp` for command execution
//! and file copy, `virsh` for snapshot and power control.
//!
//! Remote commands run with a bounded server-alive window so a guest that
//! panics mid-command surfaces as a transport failure instead of hanging
//! the fuzzing loop.

use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::error::{FuzzError, Result};
use crate::guest::{ExecReply, GuestTransport};

const LIVENESS_TIMEOUT: Duration = Duration::from_secs(3);
/// Fresh boots need roughly this long before sshd answers.
const BOOT_SETTLE: Duration = Duration::from_secs(60);
const RESET_SETTLE_MAX: Duration = Duration::from_secs(120);

pub struct ShellTransport {
    user: String,
    host: String,
    port: u16,
    /// libvirt domain name, for snapshot/power control
    vm_name: String,
}

impl ShellTransport {
    pub fn new(user: &str, host: &str, port: u16, vm_name: &str) -> Self {
        ShellTransport {
            user: user.to_string(),
            host: host.to_string(),
            port,
            vm_name: vm_name.to_string(),
        }
    }

    fn ssh_target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn ssh_command(&self, remote_cmd: &str, timeout: Duration) -> Command {
        let secs = timeout.as_secs().max(1);
        let mut cmd = Command::new("ssh");
        cmd.arg("-o").arg("BatchMode=yes")
            .arg("-o").arg("StrictHostKeyChecking=no")
            .arg("-o").arg(format!("ConnectTimeout={secs}"))
            .arg("-o").arg(format!("ServerAliveInterval={secs}"))
            .arg("-o").arg("ServerAliveCountMax=1")
            .arg("-p").arg(self.port.to_string())
            .arg(self.ssh_target())
            .arg(remote_cmd);
        cmd
    }

    fn virsh(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("virsh").args(args).output()?;
        if !output.status.success() {
            return Err(FuzzError::Io(std::io::Error::other(format!(
                "virsh {:?} failed: {}",
                args,
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Wait until sshd answers again, up to `max`.
    fn settle(&self, max: Duration) -> Result<()> {
        let start = Instant::now();
        while start.elapsed() < max {
            if self.liveness() {
                return Ok(());
            }
            thread::sleep(Duration::from_secs(5));
        }
        Err(FuzzError::GuestUnresponsive)
    }
}

impl GuestTransport for ShellTransport {
    fn exec(&self, cmd: &str, timeout: Duration) -> ExecReply {
        debug!("guest exec: {cmd}");
        let output = match self.ssh_command(cmd, timeout).output() {
            Ok(o) => o,
            Err(e) => {
                warn!("ssh spawn failed: {e}");
                return ExecReply::TransportFailed;
            }
        };

        // 255 is ssh's own failure code; remote commands never produce it
        if output.status.code() == Some(255) {
            return ExecReply::TransportFailed;
        }

        // stderr folds into the reply like a pty would
        let mut raw = output.stdout;
        raw.extend_from_slice(&output.stderr);
        match String::from_utf8(raw) {
            Ok(s) if s.trim().is_empty() => ExecReply::Empty,
            Ok(s) => ExecReply::Output(s.trim().to_string()),
            Err(_) => ExecReply::Garbled,
        }
    }

    fn copy_to_guest(&self, local_files: &[PathBuf], remote_dir: &str) -> Result<()> {
        for file in local_files {
            let status = Command::new("scp")
                .arg("-o").arg("BatchMode=yes")
                .arg("-o").arg("StrictHostKeyChecking=no")
                .arg("-P").arg(self.port.to_string())
                .arg(file)
                .arg(format!("{}:{}/", self.ssh_target(), remote_dir))
                .status()?;
            if !status.success() {
                return Err(FuzzError::TransportTimeout(format!(
                    "scp to guest failed for {}",
                    file.display()
                )));
            }
        }
        Ok(())
    }

    fn copy_to_host(&self, remote_files: &[String], local_dir: &Path) -> Result<()> {
        for file in remote_files {
            let status = Command::new("scp")
                .arg("-o").arg("BatchMode=yes")
                .arg("-o").arg("StrictHostKeyChecking=no")
                .arg("-P").arg(self.port.to_string())
                .arg(format!("{}:{}", self.ssh_target(), file))
                .arg(local_dir)
                .status()?;
            if !status.success() {
                return Err(FuzzError::TransportTimeout(format!(
                    "scp to host failed for {file}"
                )));
            }
        }
        Ok(())
    }

    fn liveness(&self) -> bool {
        let addr = format!("{}:{}", self.host, self.port);
        let Ok(mut addrs) = addr.to_socket_addrs() else { return false };
        let Some(addr) = addrs.next() else { return false };
        TcpStream::connect_timeout(&addr, LIVENESS_TIMEOUT).is_ok()
    }

    fn restore_snapshot(&self, name: &str) -> Result<()> {
        warn!("restoring {} to snapshot {name}", self.vm_name);
        self.virsh(&["snapshot-revert", self.vm_name.as_str(), name])?;
        // revert to an offline snapshot leaves the domain shut off
        if self.virsh(&["start", self.vm_name.as_str()]).is_ok() {
            thread::sleep(BOOT_SETTLE);
        }
        self.settle(RESET_SETTLE_MAX)
    }

    fn current_snapshot(&self) -> Option<String> {
        match self.virsh(&["snapshot-current", "--name", self.vm_name.as_str()]) {
            Ok(name) if !name.is_empty() => Some(name),
            Ok(_) => None,
            Err(e) => {
                error!("no current snapshot for {}: {e}", self.vm_name);
                None
            }
        }
    }

    fn reset(&self) -> Result<()> {
        self.virsh(&["reset", self.vm_name.as_str()])?;
        thread::sleep(Duration::from_secs(40));
        self.settle(RESET_SETTLE_MAX)
    }

    fn boot(&self) -> Result<()> {
        if self.liveness() {
            return Ok(());
        }
        self.virsh(&["start", self.vm_name.as_str()])?;
        thread::sleep(BOOT_SETTLE);
        self.settle(RESET_SETTLE_MAX)
    }
}
