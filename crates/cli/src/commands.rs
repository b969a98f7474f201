//! Command tree for the `epochkv` binary.

use clap::{Arg, ArgAction, Command};

/// Build the clap command tree.
pub fn build_cli() -> Command {
    Command::new("epochkv")
        .about("Workload driver and config checker for epochkv")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Print machine-readable JSON"),
        )
        .subcommand(bench_command())
        .subcommand(
            Command::new("check-config")
                .about("Parse and validate a TOML configuration file")
                .arg(Arg::new("file").required(true).help("Path to the TOML file")),
        )
}

fn bench_command() -> Command {
    Command::new("bench")
        .about("Run a bank-transfer workload against an in-process cluster")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("TOML configuration file; flags override it"),
        )
        .arg(
            Arg::new("partitions")
                .long("partitions")
                .short('p')
                .value_parser(clap::value_parser!(u32))
                .help("Number of partitions"),
        )
        .arg(
            Arg::new("workers")
                .long("workers")
                .short('w')
                .value_parser(clap::value_parser!(u32))
                .help("Worker threads per partition"),
        )
        .arg(
            Arg::new("accounts")
                .long("accounts")
                .short('a')
                .value_parser(clap::value_parser!(u64))
                .default_value("1000")
                .help("Number of accounts"),
        )
        .arg(
            Arg::new("seconds")
                .long("seconds")
                .short('s')
                .value_parser(clap::value_parser!(f64))
                .default_value("5")
                .help("Run time in seconds"),
        )
        .arg(
            Arg::new("backend")
                .long("backend")
                .short('b')
                .help("Index backend: cuckoo, hopscotch or cluster"),
        )
        .arg(
            Arg::new("readonly-ratio")
                .long("readonly-ratio")
                .value_parser(clap::value_parser!(f64))
                .default_value("0.1")
                .help("Fraction of transactions that are read-only audits"),
        )
}
