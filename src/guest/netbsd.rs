//! NetBSD mount plumbing: vnd pseudo-disks via `vndconfig`, labeled with
//! `disklabel`, mounted through the cooked device node.

use log::debug;

use crate::guest::adapter::{
    clean_mount_dir, determine_fs_type, failed_mount_outcome, FsAdapter, GuestFsType, GuestOs,
    MountOutcome,
};
use crate::guest::{exec_quiet, ExecReply, GuestTransport};

pub struct NetBsdAdapter {
    rfile: String,
    mount_at: String,
    bdev: Option<String>,
    fs_type: GuestFsType,
}

impl NetBsdAdapter {
    pub fn new(rfile: String, mount_at: String) -> Self {
        NetBsdAdapter { rfile, mount_at, bdev: None, fs_type: GuestFsType::Unknown }
    }

    fn mount_switch(&self) -> &'static str {
        match self.fs_type {
            GuestFsType::Ext2 => "ext2fs",
            GuestFsType::Ufs => "ufs",
            _ => "",
        }
    }
}

impl FsAdapter for NetBsdAdapter {
    fn os(&self) -> GuestOs {
        GuestOs::NetBsd
    }

    fn make_block_device(&mut self, t: &dyn GuestTransport) {
        let cmd = format!("/usr/sbin/vndconfig vnd0 {}", self.rfile);
        debug!("{cmd}");
        exec_quiet(t, &cmd);
        exec_quiet(t, "/sbin/disklabel /dev/vnd0");
        // the raw node is only good for disklabel; mount wants the cooked one
        self.bdev = Some("/dev/vnd0".to_string());
    }

    fn destroy_block_device(&mut self, t: &dyn GuestTransport) -> ExecReply {
        self.bdev = None;
        let cmd = "/usr/sbin/vndconfig -u vnd0";
        debug!("{cmd}");
        exec_quiet(t, cmd)
    }

    fn mount_file_system(&mut self, t: &dyn GuestTransport) -> MountOutcome {
        clean_mount_dir(t, &self.mount_at);
        self.fs_type = determine_fs_type(t, &self.rfile);
        self.make_block_device(t);

        let bdev = self.bdev.as_deref().unwrap_or_default();
        let cmd = format!("/sbin/mount -t {} {} {}", self.mount_switch(), bdev, self.mount_at);
        debug!("{cmd}");
        if matches!(exec_quiet(t, &cmd), ExecReply::Empty) {
            MountOutcome::Mounted
        } else {
            failed_mount_outcome(t)
        }
    }

    fn unmount_file_system(&mut self, t: &dyn GuestTransport) -> bool {
        let cmd = format!("/sbin/umount -f {}", self.mount_at);
        debug!("{cmd}");
        matches!(exec_quiet(t, &cmd), ExecReply::Empty)
            && matches!(self.destroy_block_device(t), ExecReply::Empty)
    }
}
