// SPDX-License-Identifier: GPL-2.0

//! Crash identity from kernel core text.
//!
//! Two crashes of the same bug differ in addresses, frame pointers and
//! per-boot noise; the `symbol+offset` part of each backtrace line is
//! stable. The fingerprint is the SHA-256 of the backtrace with everything
//! unstable stripped, so equal hashes mean the same crash site.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// Identity of one crash: the panic label for humans, the stack hash for
/// deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashFingerprint {
    pub panic_label: String,
    pub stack_hash: String,
}

fn trap_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^---\strap\s").unwrap())
}

fn frame_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#\d{1,3}\s0x[0-9a-f]{0,16}\sat\s").unwrap())
}

// Tokens ending the panic label. The earliest occurrence wins.
const LABEL_TERMINATORS: &[&str] = &[":", "(", " bp ", " fip ", "\\", ", addr:", "\n"];

/// Extract the panic label: the text following the first `panic:`, cut at
/// the first terminator token, whitespace collapsed to underscores, and
/// anything after `_/` dropped (panics quoting paths stay one token).
pub fn panic_label(text: &str) -> Option<String> {
    let (_, rest) = text.split_once("panic:")?;

    let cut = LABEL_TERMINATORS
        .iter()
        .filter_map(|t| rest.find(t))
        .min()
        .unwrap_or(rest.len());

    let label = rest[..cut]
        .trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_");
    let label = label.split("_/").next().unwrap_or("").to_string();
    Some(label)
}

/// Reduce the backtrace between `KDB: stack backtrace:` and the first of
/// `--- syscall` / `Uptime` to its stable lines: trap lines dropped,
/// numbered frames reduced to the text after ` at `, other lines cut
/// before `/frame`.
pub fn sanitize_backtrace(text: &str) -> Option<String> {
    let (_, rest) = text.split_once("KDB: stack backtrace:")?;

    let end = ["--- syscall", "Uptime"]
        .iter()
        .filter_map(|m| rest.find(m))
        .min()
        .unwrap_or(rest.len());
    let window = rest[..end].trim();

    let mut clean = String::new();
    for line in window.lines() {
        if trap_line_re().is_match(line) {
            continue;
        }
        if frame_line_re().is_match(line) {
            if let Some((_, sym)) = line.split_once(" at ") {
                clean.push_str(sym);
                clean.push('\n');
            }
        } else {
            clean.push_str(line.split("/frame").next().unwrap_or(""));
            clean.push('\n');
        }
    }
    Some(clean)
}

pub fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Fingerprint a raw core-text artifact. Returns `None` when there is no
/// usable panic line or backtrace, or when the label is too short to be a
/// real panic (truncated cores produce one- or two-character fragments).
pub fn fingerprint(core_text: &[u8]) -> Option<CrashFingerprint> {
    let text = String::from_utf8_lossy(core_text);

    let panic_label = panic_label(&text)?;
    if panic_label.len() <= 2 {
        return None;
    }

    let sanitized = sanitize_backtrace(&text)?;
    Some(CrashFingerprint {
        panic_label,
        stack_hash: sha256_hex(&sanitized),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CORE: &str = "\
panic: ffs_valloc: dup alloc
cpuid = 0
time = 1592422545
KDB: stack backtrace:
#0 0xffffffff80c1d297 at kdb_backtrace+0x67
#1 0xffffffff80bd05ad at vpanic+0x19d
--- trap 0xc, rip = 0xffffffff80e1aaaa, rsp = 0xfffffe0000530840 ---
#2 0xffffffff80e1b1de at ffs_valloc+0x11ce
db_trace_self_wrapper() at db_trace_self_wrapper+0x2b/frame 0xfffffe00004ff473
Uptime: 2m3s
";

    #[test]
    fn label_is_extracted_and_normalized() {
        assert_eq!(panic_label(CORE).as_deref(), Some("ffs_valloc"));
        assert_eq!(
            panic_label("panic: Assertion failed (count > 0)").as_deref(),
            Some("Assertion_failed")
        );
        assert_eq!(
            panic_label("panic: page fault, addr: 0xdeadbeef").as_deref(),
            Some("page_fault")
        );
        assert_eq!(panic_label("no panic marker here"), None);
    }

    #[test]
    fn label_drops_trailing_paths() {
        assert_eq!(
            panic_label("panic: vm_fault_hold /usr/src/sys/vm/vm_fault.c").as_deref(),
            Some("vm_fault_hold")
        );
    }

    #[test]
    fn backtrace_keeps_only_stable_tokens() {
        let clean = sanitize_backtrace(CORE).unwrap();
        assert_eq!(
            clean,
            "kdb_backtrace+0x67\n\
             vpanic+0x19d\n\
             ffs_valloc+0x11ce\n\
             db_trace_self_wrapper() at db_trace_self_wrapper+0x2b\n"
        );
    }

    #[test]
    fn fingerprint_ignores_addresses_and_trap_lines() {
        let base = fingerprint(CORE.as_bytes()).unwrap();

        let other_addresses = CORE
            .replace("0xffffffff80c1d297", "0xffffffff80000001")
            .replace("0xffffffff80bd05ad", "0xdeadbeefcafe0000");
        let more_traps = other_addresses.replace(
            "#2 ",
            "--- trap 0x9, rip = 0x1, rsp = 0x2 ---\n#2 ",
        );

        let same = fingerprint(more_traps.as_bytes()).unwrap();
        assert_eq!(base.stack_hash, same.stack_hash);
        assert_eq!(base.panic_label, same.panic_label);
    }

    #[test]
    fn fingerprint_differs_for_different_stacks() {
        let other = CORE.replace("ffs_valloc+0x11ce", "ffs_blkfree+0x9a");
        let a = fingerprint(CORE.as_bytes()).unwrap();
        let b = fingerprint(other.as_bytes()).unwrap();
        assert_ne!(a.stack_hash, b.stack_hash);
    }

    #[test]
    fn truncated_core_yields_nothing() {
        assert!(fingerprint(b"panic: a").is_none());
        assert!(fingerprint(b"garbage with no markers").is_none());
        // panic line but no backtrace window
        assert!(fingerprint(b"panic: ffs_valloc: dup alloc\nno trace").is_none());
    }

    #[test]
    fn hash_is_stable_across_calls() {
        let a = fingerprint(CORE.as_bytes()).unwrap();
        let b = fingerprint(CORE.as_bytes()).unwrap();
        assert_eq!(a.stack_hash, b.stack_hash);
        assert_eq!(a.stack_hash.len(), 64);
    }
}
