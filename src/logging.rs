use std::io::Write;

use log::LevelFilter;

/// Set up the global logger. `RUST_LOG` wins if set; the debug flag raises
/// the default from info to debug.
pub fn setup(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(default_level)
        .format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()));

    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }

    builder.init();
}
