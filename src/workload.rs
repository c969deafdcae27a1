//! Workload synthesis and outcome classification.
//!
//! Commands are templates with typed holes rather than format strings: a
//! hole is filled with a file or a directory drawn from the live listing
//! of the mounted filesystem. Classification mirrors what the shell gives
//! us: read-only probes are expected to print, mutating commands are
//! expected to stay silent.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::guest::{exec_quiet, ExecReply, GuestOs, GuestTransport};

/// Read-only probes: string output is success unless a sentinel matches.
pub const READ_PROBES: &[&str] = &[
    "dd", "find", "readlink", "getfacl", "ls", "stat", "tar", "du", "wc",
];

const PICK_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPart {
    Literal(String),
    FileHole,
    DirHole,
}

/// One workload command with its holes still open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub parts: Vec<CommandPart>,
}

impl CommandTemplate {
    pub fn literal(text: &str) -> Self {
        CommandTemplate { parts: vec![CommandPart::Literal(text.to_string())] }
    }

    /// Parse a raw `{}` template: the first hole takes a file, any further
    /// hole takes a directory.
    pub fn parse(raw: &str) -> Self {
        let mut parts = Vec::new();
        let mut hole = 0usize;
        let mut rest = raw;
        while let Some(idx) = rest.find("{}") {
            if idx > 0 {
                parts.push(CommandPart::Literal(rest[..idx].to_string()));
            }
            parts.push(if hole == 0 { CommandPart::FileHole } else { CommandPart::DirHole });
            hole += 1;
            rest = &rest[idx + 2..];
        }
        if !rest.is_empty() {
            parts.push(CommandPart::Literal(rest.to_string()));
        }
        CommandTemplate { parts }
    }

    pub fn needs_substitution(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, CommandPart::FileHole | CommandPart::DirHole))
    }

    pub fn render(&self, file: &str, dir: &str) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                CommandPart::Literal(s) => out.push_str(s),
                CommandPart::FileHole => out.push_str(file),
                CommandPart::DirHole => out.push_str(dir),
            }
        }
        out
    }
}

/// How one executed command went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdOutcome {
    Success,
    Failed,
    /// Transport died and the guest is gone: the crash signal.
    Crashed,
}

pub fn is_read_probe(cmd: &str) -> bool {
    READ_PROBES.iter().any(|p| cmd.contains(p))
}

/// Classify a command's reply. `guest_alive` is the liveness probe taken
/// after a transport failure.
pub fn classify(cmd: &str, reply: &ExecReply, guest_alive: bool) -> CmdOutcome {
    if reply.is_transport_failure() && !guest_alive {
        return CmdOutcome::Crashed;
    }
    if is_read_probe(cmd) {
        return match reply {
            ExecReply::Output(out) => {
                if cmd.contains("tar") && out.contains("Error") {
                    CmdOutcome::Failed
                } else if cmd.contains("getfacl") && out.contains("stat() failed") {
                    CmdOutcome::Failed
                } else if out.contains("No such") {
                    CmdOutcome::Failed
                } else {
                    CmdOutcome::Success
                }
            }
            _ => CmdOutcome::Failed,
        };
    }
    match reply {
        ExecReply::Empty => CmdOutcome::Success,
        _ => CmdOutcome::Failed,
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ListKind {
    Files,
    Dirs,
}

/// Enumerate entries of the mounted filesystem through the transport.
pub fn list_entries(t: &dyn GuestTransport, mount: &str, kind: ListKind) -> Vec<String> {
    let flag = match kind {
        ListKind::Files => "f",
        ListKind::Dirs => "d",
    };
    match exec_quiet(t, &format!("find {mount} -type {flag}")) {
        ExecReply::Output(s) => s
            .lines()
            .map(|l| l.trim_end_matches(',').trim().to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

/// Draw one file and one directory, distinct from each other. Bounded
/// retries instead of recursion: two exhausted lists give up cleanly.
pub fn pick_distinct(files: &[String], dirs: &[String], rng: &mut StdRng) -> Option<(String, String)> {
    if files.is_empty() || dirs.is_empty() {
        return None;
    }
    for _ in 0..PICK_ATTEMPTS {
        let file = &files[rng.gen_range(0..files.len())];
        let dir = &dirs[rng.gen_range(0..dirs.len())];
        if file != dir {
            return Some((file.clone(), dir.clone()));
        }
    }
    None
}

fn random_chmod_mode(rng: &mut StdRng) -> String {
    (0..3).map(|_| char::from(b'0' + rng.gen_range(0..8))).collect()
}

/// The built-in per-OS workload: realistic file operations over the
/// mounted filesystem, shuffled per iteration. BSD guests additionally get
/// the flag/ACL probes their userland carries.
pub fn templates(os: GuestOs, mount: &str, rng: &mut StdRng) -> Vec<CommandTemplate> {
    use CommandPart::{DirHole, FileHole, Literal};

    let lit = |s: &str| Literal(s.to_string());
    let t = |parts: Vec<CommandPart>| CommandTemplate { parts };

    let dd_count = rng.gen_range(1..=5);
    let trunc_len = rng.gen_range(1..=5);
    let mode = random_chmod_mode(rng);

    let mut list = vec![
        CommandTemplate::literal(&format!("find {mount}/*")),
        t(vec![lit("ls -lah "), DirHole]),
        t(vec![lit("touch "), DirHole, lit("/TOUCHED")]),
        t(vec![lit("mkdir -p "), DirHole, lit("/a/b/c")]),
        t(vec![
            lit("dd if=/dev/urandom of="),
            DirHole,
            lit(&format!("/DATA bs={} count={dd_count}", 1 << 20)),
        ]),
        t(vec![lit("ln "), FileHole, lit(&format!(" {mount}/HARDLINK"))]),
        t(vec![lit("ln -s "), FileHole, lit(&format!(" {mount}/SOFTLINK"))]),
        t(vec![lit(&format!("readlink {mount}/SOFTLINK"))]),
        t(vec![lit("stat "), DirHole]),
        // raw {} templates: first hole takes the file, second the dir
        CommandTemplate::parse("cp -R {} {}/COPIED"),
        CommandTemplate::parse("mv {} {}"),
        t(vec![
            lit(&format!("tar -jcvf {mount}/archive.bzip2 ")),
            FileHole,
        ]),
        t(vec![lit(&format!("chmod {mode} ")), FileHole]),
        t(vec![lit("echo APPENDED >> "), FileHole]),
        t(vec![lit("rm -rf "), DirHole]),
        t(vec![lit("du "), FileHole]),
        t(vec![lit("wc "), FileHole]),
        t(vec![lit(&format!("truncate -s {trunc_len} ")), FileHole]),
    ];

    if os != GuestOs::Linux {
        let flags = ["nodump", "uappnd", "uchg", "arch", "opaque"];
        let flag = flags[rng.gen_range(0..flags.len())];
        list.push(t(vec![lit(&format!("chflags {flag} ")), FileHole]));
        list.push(t(vec![lit("getfacl "), FileHole]));
    }

    list.shuffle(rng);
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn raw_template_parse_and_render() {
        let t = CommandTemplate::parse("cp -R {} {}/COPIED");
        assert_eq!(
            t.parts,
            vec![
                CommandPart::Literal("cp -R ".into()),
                CommandPart::FileHole,
                CommandPart::Literal(" ".into()),
                CommandPart::DirHole,
                CommandPart::Literal("/COPIED".into()),
            ]
        );
        assert!(t.needs_substitution());
        assert_eq!(t.render("/mnt/x/f1", "/mnt/x/d1"), "cp -R /mnt/x/f1 /mnt/x/d1/COPIED");
    }

    #[test]
    fn literal_template_needs_no_substitution() {
        let t = CommandTemplate::literal("find /mnt/x/*");
        assert!(!t.needs_substitution());
        assert_eq!(t.render("unused", "unused"), "find /mnt/x/*");
    }

    #[test]
    fn read_probe_classification() {
        let alive = true;
        assert_eq!(
            classify("ls -lah /mnt/d", &ExecReply::Output("total 4".into()), alive),
            CmdOutcome::Success
        );
        assert_eq!(
            classify("ls -lah /mnt/d", &ExecReply::Output("ls: No such file or directory".into()), alive),
            CmdOutcome::Failed
        );
        assert_eq!(
            classify("tar -jcvf /mnt/a.bz2 f", &ExecReply::Output("tar: Error exit delayed".into()), alive),
            CmdOutcome::Failed
        );
        assert_eq!(
            classify("getfacl f", &ExecReply::Output("getfacl: stat() failed".into()), alive),
            CmdOutcome::Failed
        );
        // silent probe means the traversal found nothing
        assert_eq!(classify("du f", &ExecReply::Empty, alive), CmdOutcome::Failed);
    }

    #[test]
    fn mutating_command_classification() {
        assert_eq!(classify("touch /mnt/d/T", &ExecReply::Empty, true), CmdOutcome::Success);
        assert_eq!(
            classify("touch /mnt/d/T", &ExecReply::Output("touch: read-only".into()), true),
            CmdOutcome::Failed
        );
    }

    #[test]
    fn dead_guest_is_a_crash_regardless_of_command() {
        assert_eq!(
            classify("mkdir -p /mnt/d/a", &ExecReply::TransportFailed, false),
            CmdOutcome::Crashed
        );
        // transport hiccup with a live guest is only a failure
        assert_eq!(
            classify("mkdir -p /mnt/d/a", &ExecReply::TransportFailed, true),
            CmdOutcome::Failed
        );
    }

    #[test]
    fn pick_distinct_is_bounded() {
        let mut rng = StdRng::seed_from_u64(5);
        let files = vec!["/mnt/f1".to_string(), "/mnt/f2".to_string()];
        let dirs = vec!["/mnt/d1".to_string()];
        let (f, d) = pick_distinct(&files, &dirs, &mut rng).unwrap();
        assert_ne!(f, d);

        // the only file equals the only dir: must give up, not recurse
        let same = vec!["/mnt/x".to_string()];
        assert!(pick_distinct(&same, &same, &mut rng).is_none());
        assert!(pick_distinct(&[], &dirs, &mut rng).is_none());
    }

    #[test]
    fn bsd_workloads_carry_flag_probes() {
        let mut rng = StdRng::seed_from_u64(1);
        let bsd = templates(GuestOs::FreeBsd, "/mnt/x", &mut rng);
        let linux = templates(GuestOs::Linux, "/mnt/x", &mut rng);

        let has = |list: &[CommandTemplate], needle: &str| {
            list.iter().any(|t| t.render("f", "d").contains(needle))
        };
        assert!(has(&bsd, "chflags"));
        assert!(has(&bsd, "getfacl"));
        assert!(!has(&linux, "chflags"));
        assert!(!has(&linux, "getfacl"));
        assert!(bsd.len() > linux.len());
    }
}
