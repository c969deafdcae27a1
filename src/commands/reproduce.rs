use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use crate::guest::{GuestTransport, ShellTransport};
use crate::reproduce::Reproducer;

/// Replay archived crash samples on a pristine verifier VM
#[derive(Parser, Debug)]
#[command(about = "Verify recorded crashes reproduce from their samples")]
pub struct ReproduceCli {
    /// Crash registry to poll
    #[arg(long, default_value = "crash_dumps/crash.db")]
    db: PathBuf,

    /// libvirt domain of the verifier VM
    #[arg(long)]
    vm: String,

    /// ssh host of the verifier VM
    #[arg(long)]
    host: String,

    /// ssh user on the verifier VM
    #[arg(long, default_value = "root")]
    user: String,

    /// Poll interval in seconds
    #[arg(long, default_value_t = 60)]
    interval: u64,
}

pub fn cmd_reproduce(argv: Vec<String>) -> Result<()> {
    let cli = ReproduceCli::parse_from(argv);

    let transport = ShellTransport::new(&cli.user, &cli.host, 22, &cli.vm);
    transport.boot().context("booting verifier VM")?;

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        eprintln!("Observed Ctrl+C! Exiting...");
        handler_stop.store(true, Ordering::Relaxed);
    })
    .context("installing interrupt handler")?;

    let mut reproducer = Reproducer::new(
        &cli.db,
        Box::new(transport),
        Duration::from_secs(cli.interval),
        stop,
    )?;
    reproducer.run()
}
