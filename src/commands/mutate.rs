use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::mutate::{run_engine, EngineKind, RadamsaOptions};

/// One-shot mutation of an image, mostly for triage and debugging of the
/// engines themselves.
#[derive(Parser, Debug)]
#[command(about = "Apply one mutation engine to an image")]
pub struct MutateCli {
    /// Engine [radamsa, byte_flip_seq, byte_flip_rnd, metadata]
    #[arg(short, long)]
    engine: EngineKind,

    /// Bytes to mutate (ignored by radamsa)
    #[arg(short = 'n', long = "nbytes", default_value_t = 3)]
    nbytes: usize,

    /// RNG seed for reproducible engine decisions
    #[arg(long)]
    seed: Option<u64>,

    /// Restore whole superblocks instead of just the magic (radamsa)
    #[arg(long)]
    preserve_uberblock: bool,

    /// Skip magic restoration entirely (radamsa)
    #[arg(long)]
    no_preserve_magic: bool,

    /// Image to mutate; the original is left untouched
    image: PathBuf,
}

pub fn cmd_mutate(argv: Vec<String>) -> Result<()> {
    let cli = MutateCli::parse_from(argv);

    let mut rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let opts = RadamsaOptions {
        preserve_magic: !cli.no_preserve_magic,
        preserve_uberblock: cli.preserve_uberblock,
        ..RadamsaOptions::default()
    };

    let mutation = run_engine(cli.engine, &cli.image, cli.nbytes, &mut rng, &opts)?;
    match mutation.seed {
        Some(seed) => println!("[+] {} (radamsa seed: {seed})", mutation.path.display()),
        None => println!("[+] {}", mutation.path.display()),
    }
    Ok(())
}
