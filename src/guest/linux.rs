//! Linux mount plumbing: loop devices via `losetup`, mounted with the
//! exact ext generation `file(1)` reported.

use log::debug;

use crate::guest::adapter::{
    clean_mount_dir, determine_fs_type, failed_mount_outcome, FsAdapter, GuestFsType, GuestOs,
    MountOutcome,
};
use crate::guest::{exec_quiet, ExecReply, GuestTransport};

pub struct LinuxAdapter {
    rfile: String,
    mount_at: String,
    bdev: Option<String>,
    fs_type: GuestFsType,
}

impl LinuxAdapter {
    pub fn new(rfile: String, mount_at: String) -> Self {
        LinuxAdapter { rfile, mount_at, bdev: None, fs_type: GuestFsType::Unknown }
    }

    fn mount_switch(&self) -> &'static str {
        match self.fs_type {
            GuestFsType::Ext2 => "ext2",
            GuestFsType::Ext3 => "ext3",
            GuestFsType::Ext4 => "ext4",
            _ => "auto",
        }
    }
}

impl FsAdapter for LinuxAdapter {
    fn os(&self) -> GuestOs {
        GuestOs::Linux
    }

    fn make_block_device(&mut self, t: &dyn GuestTransport) {
        if let ExecReply::Output(loopdev) = exec_quiet(t, "losetup -f") {
            let loopdev = loopdev.trim().to_string();
            let cmd = format!("losetup {loopdev} {}", self.rfile);
            debug!("{cmd}");
            exec_quiet(t, &cmd);
            self.bdev = Some(loopdev);
        }
    }

    fn destroy_block_device(&mut self, t: &dyn GuestTransport) -> ExecReply {
        let bdev = self.bdev.take().unwrap_or_default();
        let cmd = format!("losetup -d {bdev}");
        debug!("{cmd}");
        exec_quiet(t, &cmd)
    }

    fn mount_file_system(&mut self, t: &dyn GuestTransport) -> MountOutcome {
        clean_mount_dir(t, &self.mount_at);
        self.fs_type = determine_fs_type(t, &self.rfile);
        self.make_block_device(t);

        let bdev = self.bdev.as_deref().unwrap_or_default();
        let cmd = format!(r#"/bin/mount -t "{}" {} {}"#, self.mount_switch(), bdev, self.mount_at);
        debug!("{cmd}");
        if matches!(exec_quiet(t, &cmd), ExecReply::Empty) {
            MountOutcome::Mounted
        } else {
            failed_mount_outcome(t)
        }
    }

    fn unmount_file_system(&mut self, t: &dyn GuestTransport) -> bool {
        let cmd = format!("/bin/umount -f {}", self.mount_at);
        debug!("{cmd}");
        matches!(exec_quiet(t, &cmd), ExecReply::Empty)
            && matches!(self.destroy_block_device(t), ExecReply::Empty)
    }
}
