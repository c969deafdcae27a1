use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;

use crate::fingerprint::fingerprint;

/// Fingerprint a kernel core-text artifact
#[derive(Parser, Debug)]
#[command(about = "Compute panic label and stack hash of a core text")]
pub struct FingerprintCli {
    /// core.txt (or equivalent) to fingerprint
    core: PathBuf,
}

pub fn cmd_fingerprint(argv: Vec<String>) -> Result<()> {
    let cli = FingerprintCli::parse_from(argv);
    let data = std::fs::read(&cli.core)?;

    let fp = fingerprint(&data)
        .ok_or_else(|| anyhow!("{}: no usable panic/backtrace found", cli.core.display()))?;
    println!("panic: {}", fp.panic_label);
    println!("{}", fp.stack_hash);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestTempDir;

    #[test]
    fn prints_for_a_valid_core_and_fails_for_junk() {
        let dir = TestTempDir::new("cmd-fingerprint");

        let core = dir.path().join("core.txt.0");
        std::fs::write(
            &core,
            "panic: ffs_valloc: dup alloc\nKDB: stack backtrace:\n\
             #0 0xffffffff80c1d297 at kdb_backtrace+0x67\nUptime: 1m\n",
        )
        .unwrap();
        cmd_fingerprint(vec!["fingerprint".into(), core.to_string_lossy().into_owned()]).unwrap();

        let junk = dir.path().join("junk");
        std::fs::write(&junk, "nothing here").unwrap();
        assert!(cmd_fingerprint(vec![
            "fingerprint".into(),
            junk.to_string_lossy().into_owned()
        ])
        .is_err());
    }
}
