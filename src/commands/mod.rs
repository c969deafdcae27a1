use clap::{Command, CommandFactory, Parser};

pub mod fingerprint;
pub mod fuzz;
pub mod mutate;
pub mod reproduce;
pub mod scan;

pub use fingerprint::cmd_fingerprint;
pub use fuzz::cmd_fuzz;
pub use mutate::cmd_mutate;
pub use reproduce::cmd_reproduce;
pub use scan::cmd_scan;

/// The full command tree, used for the grouped usage screen and shell
/// completions.
pub fn build_cli() -> Command {
    Command::new("fsfuzz")
        .about("mutation-based fuzzer for kernel filesystem code")
        .subcommand(fuzz::FuzzCli::command().name("fuzz"))
        .subcommand(scan::ScanCli::command().name("scan"))
        .subcommand(mutate::MutateCli::command().name("mutate"))
        .subcommand(fingerprint::FingerprintCli::command().name("fingerprint"))
        .subcommand(reproduce::ReproduceCli::command().name("reproduce"))
}

#[derive(Parser, Debug)]
#[command(about = "Generate shell completions")]
struct CompletionsCli {
    shell: clap_complete::Shell,
}

pub fn completions(argv: Vec<String>) {
    let cli = CompletionsCli::parse_from(argv);
    clap_complete::generate(cli.shell, &mut build_cli(), "fsfuzz", &mut std::io::stdout());
}
