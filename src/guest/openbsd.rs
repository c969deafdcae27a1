//! OpenBSD mount plumbing: vnd devices via `vnconfig`, auto-labeled with
//! `disklabel -A`, mounted as `ffs` for the UFS family.

use log::debug;

use crate::guest::adapter::{
    clean_mount_dir, determine_fs_type, failed_mount_outcome, FsAdapter, GuestFsType, GuestOs,
    MountOutcome,
};
use crate::guest::{exec_quiet, ExecReply, GuestTransport};

pub struct OpenBsdAdapter {
    rfile: String,
    mount_at: String,
    bdev: Option<String>,
    fs_type: GuestFsType,
}

impl OpenBsdAdapter {
    pub fn new(rfile: String, mount_at: String) -> Self {
        OpenBsdAdapter { rfile, mount_at, bdev: None, fs_type: GuestFsType::Unknown }
    }

    fn mount_switch(&self) -> &'static str {
        match self.fs_type {
            GuestFsType::Ext2 => "ext2fs",
            GuestFsType::Ufs => "ffs",
            _ => "",
        }
    }
}

impl FsAdapter for OpenBsdAdapter {
    fn os(&self) -> GuestOs {
        GuestOs::OpenBsd
    }

    fn make_block_device(&mut self, t: &dyn GuestTransport) {
        let cmd = format!("/sbin/vnconfig vnd0 {}", self.rfile);
        debug!("{cmd}");
        exec_quiet(t, &cmd);
        exec_quiet(t, "/sbin/disklabel -A vnd0");
        // partition c spans the whole pseudo-disk
        self.bdev = Some("/dev/vnd0c".to_string());
    }

    fn destroy_block_device(&mut self, t: &dyn GuestTransport) -> ExecReply {
        self.bdev = None;
        let cmd = "/sbin/vnconfig -u vnd0";
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeTransport;

    #[test]
    fn vnconfig_wiring_and_ffs_mount() {
        let t = FakeTransport::new();
        t.reply("/usr/bin/file", ExecReply::Output("Unix Fast File system [v2]".into()));

        let mut a = OpenBsdAdapter::new("/tmp/img".into(), "/mnt/img".into());
        assert_eq!(a.mount_file_system(&t), MountOutcome::Mounted);

        let cmds = t.commands.borrow();
        assert!(cmds.iter().any(|c| c == "/sbin/vnconfig vnd0 /tmp/img"));
        assert!(cmds.iter().any(|c| c == "/sbin/disklabel -A vnd0"));
        assert!(cmds.iter().any(|c| c == "/sbin/mount -t ffs /dev/vnd0c /mnt/img"));
    }

    #[test]
    fn unmount_releases_the_vnd() {
        let t = FakeTransport::new();
        t.reply("/usr/bin/file", ExecReply::Output("Unix Fast File system [v2]".into()));

        let mut a = OpenBsdAdapter::new("/tmp/img".into(), "/mnt/img".into());
        a.mount_file_system(&t);
        assert!(a.unmount_file_system(&t));
        assert!(t.commands.borrow().iter().any(|c| c == "/sbin/vnconfig -u vnd0"));
    }
}
