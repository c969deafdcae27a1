//! Mutation engines.
//!
//! Every engine takes the path of an original image and produces a *new*
//! file next to it; the original is never touched. Output names carry an
//! engine tag so a crash sample's file name alone identifies how it was
//! made: `radamsa_`, `{n}b_seq_`, `{n}b_rnd_`, `{n}b_sb_meta_` followed by
//! the original basename.

pub mod byte_flip;
pub mod metadata;
pub mod radamsa;

use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use strum::{Display, EnumString};

use crate::error::Result;

pub use self::radamsa::RadamsaOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Radamsa,
    ByteFlipSeq,
    ByteFlipRnd,
    Metadata,
}

/// Result of one engine run: the derived image, plus the seed for engines
/// that have one (radamsa).
pub struct Mutation {
    pub path: PathBuf,
    pub seed: Option<u128>,
}

/// Place the derived image next to the original, under `<tag><basename>`.
pub(crate) fn derived_path(src: &Path, tag: &str) -> PathBuf {
    let name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    src.with_file_name(format!("{tag}{name}"))
}

/// Run one engine against `src`. `nbytes` is the mutation size for the
/// byte-level engines and informational for radamsa.
pub fn run_engine(
    engine: EngineKind,
    src: &Path,
    nbytes: usize,
    rng: &mut StdRng,
    radamsa_opts: &RadamsaOptions,
) -> Result<Mutation> {
    match engine {
        EngineKind::Radamsa => radamsa::mutate(src, radamsa_opts, rng),
        EngineKind::ByteFlipSeq => Ok(Mutation {
            path: byte_flip::flip_seq(src, nbytes, rng)?,
            seed: None,
        }),
        EngineKind::ByteFlipRnd => Ok(Mutation {
            path: byte_flip::flip_rnd(src, nbytes, rng)?,
            seed: None,
        }),
        EngineKind::Metadata => Ok(Mutation {
            path: metadata::mutate(src, nbytes, rng)?,
            seed: None,
        }),
    }
}
