mod archive;
mod commands;
mod config;
mod crashdb;
mod error;
mod fingerprint;
mod fs;
mod fuzzer;
mod guest;
mod logging;
mod mutate;
mod reproduce;
#[cfg(test)]
mod testutil;
mod workload;

use std::process::{ExitCode, Termination};

/// Print main fsfuzz usage, with commands grouped by what they touch.
/// Descriptions are pulled from the clap command tree (build_cli).
fn fsfuzz_usage() {
    let cmd = commands::build_cli();

    let groups: &[(&str, &[&str])] = &[
        ("Fuzzing:", &["fuzz"]),
        ("Image inspection:", &["scan"]),
        ("Mutation:", &["mutate"]),
        ("Crash triage:", &["fingerprint", "reproduce"]),
        ("Miscellaneous:", &["completions", "version"]),
    ];

    println!("fsfuzz - mutation-based fuzzer for kernel filesystem code");
    println!("usage: fsfuzz <command> [<args>]\n");

    for (heading, names) in groups {
        println!("{heading}");
        for name in *names {
            let about = cmd
                .find_subcommand(name)
                .and_then(|sub| sub.get_about().map(|s| s.to_string()))
                .unwrap_or_default();
            println!("  {name:<26}{about}");
        }
        println!();
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        println!("missing command");
        fsfuzz_usage();
        return ExitCode::from(1);
    }

    logging::setup(std::env::var_os("FSFUZZ_DEBUG").is_some());

    match args[1].as_str() {
        "--help" | "help" => {
            fsfuzz_usage();
            ExitCode::SUCCESS
        }
        "version" => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        "completions" => {
            commands::completions(args[1..].to_vec());
            ExitCode::SUCCESS
        }
        "fuzz" => commands::cmd_fuzz(args[1..].to_vec()).report(),
        "scan" => commands::cmd_scan(args[1..].to_vec()).report(),
        "mutate" => commands::cmd_mutate(args[1..].to_vec()).report(),
        "fingerprint" => commands::cmd_fingerprint(args[1..].to_vec()).report(),
        "reproduce" => commands::cmd_reproduce(args[1..].to_vec()).report(),
        cmd => {
            println!("Unknown command {cmd}");
            fsfuzz_usage();
            ExitCode::from(1)
        }
    }
}
