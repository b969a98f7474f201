//! epochkv CLI: workload driver and configuration checker.
//!
//! - `epochkv bench [flags]` runs a bank-transfer workload against an
//!   in-process cluster and reports throughput and epoch timing
//! - `epochkv check-config FILE` validates a TOML configuration
//!
//! Logging goes to stderr and is controlled with `RUST_LOG`.

mod bench;
mod commands;
mod parse;

use std::path::Path;
use std::process;

use epochkv::EngineConfig;
use tracing_subscriber::EnvFilter;

use commands::build_cli;
use parse::{matches_to_action, CliAction};

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let matches = build_cli().get_matches();
    let json = matches.get_flag("json");

    let exit_code = match matches_to_action(&matches) {
        Ok(CliAction::Bench(opts)) => match bench::run(&opts) {
            Ok(report) => {
                print_report(&report, json);
                if report.audit_violations > 0 {
                    2
                } else {
                    0
                }
            }
            Err(e) => {
                eprintln!("(error) {:#}", e);
                1
            }
        },
        Ok(CliAction::CheckConfig { path }) => check_config(&path, json),
        Err(e) => {
            eprintln!("(error) {}", e);
            1
        }
    };
    process::exit(exit_code);
}

fn check_config(path: &Path, json: bool) -> i32 {
    let config = match EngineConfig::from_file(path).and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("(error) {}: {}", path.display(), e);
            return 1;
        }
    };
    let rendered = if json {
        serde_json::to_string_pretty(&config).map_err(|e| e.to_string())
    } else {
        config.to_toml_string().map_err(|e| e.to_string())
    };
    match rendered {
        Ok(text) => {
            println!("{}", text);
            0
        }
        Err(e) => {
            eprintln!("(error) {}", e);
            1
        }
    }
}

fn print_report(report: &bench::BenchReport, json: bool) {
    if json {
        match serde_json::to_string_pretty(report) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("(error) {}", e),
        }
        return;
    }
    println!(
        "{} partitions x {} workers, {} backend, {} accounts, {:.1}s",
        report.partitions,
        report.workers / report.partitions.max(1) as usize,
        report.backend,
        report.accounts,
        report.seconds
    );
    println!(
        "transfers {}  audits {}  aborted {}  errors {}",
        report.transfers, report.audits, report.aborted, report.errors
    );
    println!(
        "throughput {:.0} txn/s  commit rate {:.3}  remote requests {}",
        report.throughput, report.commit_rate, report.remote_requests
    );
    println!(
        "epochs {}  mean {}us  min {}us  max {}us  late {}",
        report.epochs.ticks,
        report.epochs.mean_us,
        report.epochs.min_us,
        report.epochs.max_us,
        report.epochs.late
    );
    if report.audit_violations > 0 {
        println!("AUDIT VIOLATIONS: {}", report.audit_violations);
    }
}
