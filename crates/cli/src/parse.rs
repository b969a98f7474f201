//! ArgMatches → CliAction conversion.

use clap::ArgMatches;
use epochkv::{BackendKind, EngineConfig, Partitioner, TableConfig, TableId};
use std::path::PathBuf;
use std::time::Duration;

/// What the user asked for.
#[derive(Debug)]
pub enum CliAction {
    /// Run the bank-transfer workload.
    Bench(BenchOptions),
    /// Validate a configuration file.
    CheckConfig { path: PathBuf },
}

/// Workload parameters.
#[derive(Debug, Clone)]
pub struct BenchOptions {
    pub config: EngineConfig,
    pub accounts: u64,
    pub duration: Duration,
    pub readonly_ratio: f64,
}

/// Accounts live in this table.
pub const ACCOUNTS: TableId = TableId(0);

/// Translate parsed arguments into an action.
pub fn matches_to_action(matches: &ArgMatches) -> Result<CliAction, String> {
    match matches.subcommand() {
        Some(("bench", m)) => parse_bench(m).map(CliAction::Bench),
        Some(("check-config", m)) => {
            let path = m
                .get_one::<String>("file")
                .ok_or("missing configuration file")?;
            Ok(CliAction::CheckConfig {
                path: PathBuf::from(path),
            })
        }
        Some((other, _)) => Err(format!("unknown command '{}'", other)),
        None => Err("no command given".to_string()),
    }
}

fn parse_bench(m: &ArgMatches) -> Result<BenchOptions, String> {
    let mut config = match m.get_one::<String>("config") {
        Some(path) => EngineConfig::from_file(path).map_err(|e| e.to_string())?,
        None => EngineConfig::default(),
    };
    if let Some(&n) = m.get_one::<u32>("partitions") {
        config.partitions = n;
    }
    if let Some(&n) = m.get_one::<u32>("workers") {
        config.workers_per_partition = n;
    }
    if let Some(kind) = m.get_one::<String>("backend") {
        config.backend = kind.parse::<BackendKind>().map_err(|e| e.to_string())?;
    }

    let accounts = m.get_one::<u64>("accounts").copied().unwrap_or(1000);
    if accounts < 2 {
        return Err("need at least 2 accounts".to_string());
    }
    let seconds = m.get_one::<f64>("seconds").copied().unwrap_or(5.0);
    if !(seconds.is_finite() && seconds > 0.0) {
        return Err(format!("invalid duration {}", seconds));
    }
    let readonly_ratio = m.get_one::<f64>("readonly-ratio").copied().unwrap_or(0.1);
    if !(0.0..=1.0).contains(&readonly_ratio) {
        return Err(format!("readonly ratio {} not in [0, 1]", readonly_ratio));
    }

    // Every partition gets room for twice its share of accounts
    let share = match config.partitioner {
        Partitioner::Modulo => {
            let n = config.partitions.max(1) as usize;
            (accounts as usize + n - 1) / n
        }
        Partitioner::Range { .. } => accounts as usize,
    };
    match config.tables.iter_mut().find(|t| t.id == ACCOUNTS) {
        Some(t) => t.capacity = t.capacity.max(share * 2),
        None => config.tables.push(TableConfig {
            id: ACCOUNTS,
            capacity: share * 2,
        }),
    }
    config.validate().map_err(|e| e.to_string())?;

    Ok(BenchOptions {
        config,
        accounts,
        duration: Duration::from_secs_f64(seconds),
        readonly_ratio,
    })
}
