//! FreeBSD mount plumbing: vnode-backed md devices, `mount -t ext2fs|ufs`,
//! and `zpool import` for ZFS members.

use log::debug;

use crate::guest::adapter::{
    clean_mount_dir, determine_fs_type, failed_mount_outcome, FsAdapter, GuestFsType, GuestOs,
    MountOutcome,
};
use crate::guest::{exec_quiet, ExecReply, GuestTransport};

pub struct FreeBsdAdapter {
    rfile: String,
    mount_at: String,
    bdev: Option<String>,
    fs_type: GuestFsType,
    pool: Option<String>,
}

impl FreeBsdAdapter {
    pub fn new(rfile: String, mount_at: String) -> Self {
        FreeBsdAdapter {
            rfile,
            mount_at,
            bdev: None,
            fs_type: GuestFsType::Unknown,
            pool: None,
        }
    }

    fn mount_switch(&self) -> &'static str {
        if self.fs_type.is_ext() {
            "ext2fs"
        } else if self.fs_type == GuestFsType::Ufs {
            "ufs"
        } else {
            // mangled metadata: let the kernel guess
            "auto"
        }
    }

    fn mount_ext_ufs(&self, t: &dyn GuestTransport) -> bool {
        let bdev = self.bdev.as_deref().unwrap_or_default();
        let cmd = format!(r#"/sbin/mount -t "{}" {} {}"#, self.mount_switch(), bdev, self.mount_at);
        debug!("{cmd}");
        matches!(exec_quiet(t, &cmd), ExecReply::Empty)
    }

    fn mount_zfs(&mut self, t: &dyn GuestTransport) -> bool {
        let listing = match exec_quiet(t, "zpool import") {
            ExecReply::Output(s) if s.len() > 2 => s,
            _ => {
                debug!("no zpool to import found");
                return false;
            }
        };
        // "   pool: <name>" leads the listing
        let Some(pool) = listing.split_whitespace().nth(1).map(str::to_string) else {
            return false;
        };
        let cmd = format!("zpool import {pool} -f");
        debug!("{cmd}");
        self.pool = Some(pool);
        matches!(exec_quiet(t, &cmd), ExecReply::Empty)
    }
}

impl FsAdapter for FreeBsdAdapter {
    fn os(&self) -> GuestOs {
        GuestOs::FreeBsd
    }

    fn make_block_device(&mut self, t: &dyn GuestTransport) {
        let cmd = format!("/sbin/mdconfig -a -t vnode -f {}", self.rfile);
        debug!("{cmd}");
        if let ExecReply::Output(unit) = exec_quiet(t, &cmd) {
            self.bdev = Some(format!("/dev/{}", unit.trim()));
        }
    }

    fn destroy_block_device(&mut self, t: &dyn GuestTransport) -> ExecReply {
        let bdev = self.bdev.take().unwrap_or_default();
        let cmd = format!("/sbin/mdconfig -d -u {bdev}");
        debug!("{cmd}");
        exec_quiet(t, &cmd)
    }

    fn mount_file_system(&mut self, t: &dyn GuestTransport) -> MountOutcome {
        clean_mount_dir(t, &self.mount_at);
        self.fs_type = determine_fs_type(t, &self.rfile);
        self.make_block_device(t);

        let mounted = if self.fs_type == GuestFsType::Data {
            self.mount_zfs(t)
        } else {
            // ext/ufs directly, everything unidentified as -t auto
            self.mount_ext_ufs(t)
        };
        if mounted {
            MountOutcome::Mounted
        } else {
            failed_mount_outcome(t)
        }
    }

    fn unmount_file_system(&mut self, t: &dyn GuestTransport) -> bool {
        if let Some(pool) = self.pool.take() {
            let cmd = format!("zpool export {pool}");
            debug!("{cmd}");
            return matches!(exec_quiet(t, &cmd), ExecReply::Empty)
                && matches!(self.destroy_block_device(t), ExecReply::Empty);
        }
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

    fn adapter() -> FreeBsdAdapter {
        FreeBsdAdapter::new("/tmp/radamsa_fuzz1_ufs2_20MB".into(), "/mnt/fuzz1".into())
    }

    #[test]
    fn ufs_mount_goes_through_mdconfig() {
        let t = FakeTransport::new();
        t.reply("/usr/bin/file", ExecReply::Output("Unix Fast File system [v2]".into()));
        t.reply("mdconfig -a", ExecReply::Output("md0".into()));

        let mut a = adapter();
        assert_eq!(a.mount_file_system(&t), MountOutcome::Mounted);

        let cmds = t.commands.borrow();
        assert!(cmds.iter().any(|c| c == "/bin/rm -rf /mnt/fuzz1"));
        assert!(cmds.iter().any(|c| c == "/bin/mkdir -p /mnt/fuzz1"));
        assert!(cmds.iter().any(|c| c == "/sbin/mdconfig -a -t vnode -f /tmp/radamsa_fuzz1_ufs2_20MB"));
        assert!(cmds.iter().any(|c| c == r#"/sbin/mount -t "ufs" /dev/md0 /mnt/fuzz1"#));
    }

    #[test]
    fn refused_mount_with_live_guest() {
        let t = FakeTransport::new();
        t.reply("/usr/bin/file", ExecReply::Output("ext2 filesystem data".into()));
        t.reply("mdconfig -a", ExecReply::Output("md1".into()));
        t.reply("/sbin/mount", ExecReply::Output("mount: /dev/md1: Invalid argument".into()));

        let mut a = adapter();
        assert_eq!(a.mount_file_system(&t), MountOutcome::Refused);
    }

    #[test]
    fn dead_guest_mid_mount_is_a_crash() {
        let t = FakeTransport::new();
        t.reply("/usr/bin/file", ExecReply::Output("Unix Fast File system [v2]".into()));
        t.reply("mdconfig -a", ExecReply::Output("md0".into()));
        t.reply("/sbin/mount", ExecReply::TransportFailed);
        t.alive.set(false);

        let mut a = adapter();
        assert_eq!(a.mount_file_system(&t), MountOutcome::Crashed);
    }

    #[test]
    fn zfs_mount_imports_the_discovered_pool() {
        let t = FakeTransport::new();
        t.reply("/usr/bin/file", ExecReply::Output("/tmp/img: data".into()));
        t.reply("mdconfig -a", ExecReply::Output("md2".into()));
        t.reply("zpool import fuzzpool -f", ExecReply::Empty);
        t.reply("zpool import", ExecReply::Output("   pool: fuzzpool\n     id: 77".into()));

        let mut a = adapter();
        assert_eq!(a.mount_file_system(&t), MountOutcome::Mounted);
        assert!(t.commands.borrow().iter().any(|c| c == "zpool import fuzzpool -f"));
    }

    #[test]
    fn clean_unmount_releases_the_device() {
        let t = FakeTransport::new();
        t.reply("/usr/bin/file", ExecReply::Output("Unix Fast File system [v2]".into()));
        t.reply("mdconfig -a", ExecReply::Output("md0".into()));

        let mut a = adapter();
        a.mount_file_system(&t);
        assert!(a.unmount_file_system(&t));
        assert!(t.commands.borrow().iter().any(|c| c == "/sbin/umount -f /mnt/fuzz1"));
        assert!(t.commands.borrow().iter().any(|c| c == "/sbin/mdconfig -d -u /dev/md0"));
    }
}
