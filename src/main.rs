//! CLI for running transfer blocks through the sequential and parallel executors.

use clap::Parser;
use eyre::WrapErr;
use std::time::Instant;
use txn_exec::{build_executor, ExecutionMode, Executor, TxExecutorConfig, Workload, WorkloadConfig};

const SWEEP: [(&str, f64); 5] = [
    ("No conflicts", 0.0),
    ("25% conflicts", 0.25),
    ("50% conflicts", 0.5),
    ("75% conflicts", 0.75),
    ("Full conflicts", 1.0),
];

#[derive(Parser, Debug)]
#[command(about = "Execute blocks of signed transfers and report throughput.")]
struct Args {
    /// Execution strategy.
    #[arg(long, value_enum, default_value_t = ExecutionMode::Parallel)]
    executor: ExecutionMode,

    /// Worker threads for the parallel executor; 0 uses every available core.
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Number of funded accounts.
    #[arg(long, default_value_t = 1000)]
    accounts: usize,

    /// Number of transactions per block.
    #[arg(long, default_value_t = 1000)]
    transactions: usize,

    /// Share of transactions between hot accounts, in [0, 1].
    /// Runs the standard sweep when omitted.
    #[arg(long)]
    conflict_factor: Option<f64>,

    /// Workload seed.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Verify every transaction signature before applying it.
    #[arg(long, default_value_t = false)]
    verify: bool,
}

fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = Args::parse();
    if let Some(factor) = args.conflict_factor {
        if !(0.0..=1.0).contains(&factor) {
            eyre::bail!("conflict factor must be within [0, 1], got {}", factor);
        }
    }

    let executor = build_executor(&TxExecutorConfig {
        mode: args.executor,
        num_threads: args.threads,
        verify_signatures: args.verify,
    });

    println!("=== Transfer Block Benchmark ===\n");
    println!(
        "Configuration: {} executor, {} accounts, {} transactions per block, signature verification {}\n",
        executor.name(),
        args.accounts,
        args.transactions,
        if args.verify { "on" } else { "off" }
    );

    let runs: Vec<(String, f64)> = match args.conflict_factor {
        Some(factor) => vec![(format!("{:.0}% conflicts", factor * 100.0), factor)],
        None => SWEEP
            .iter()
            .map(|&(name, factor)| (name.to_string(), factor))
            .collect(),
    };

    for (name, conflict_factor) in runs {
        let workload = Workload::generate(WorkloadConfig {
            num_accounts: args.accounts,
            num_transactions: args.transactions,
            conflict_factor,
            seed: args.seed,
            chain_id: 1,
        })
        .wrap_err("failed to sign workload")?;
        let mut store = workload.create_store();

        let start = Instant::now();
        let output = executor
            .execute(&mut store, &workload)
            .wrap_err_with(|| format!("block execution failed at {}", name))?;
        let elapsed = start.elapsed();

        let tps = workload.transactions.len() as f64 / elapsed.as_secs_f64();
        let aborts = output
            .stats
            .as_ref()
            .map(|s| s.aborts.to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:20} | {:5} successful | {:5} failed | {:6} aborts | {:8.2} ms | {:8.0} tx/s",
            name,
            output.result.successful,
            output.result.failed,
            aborts,
            elapsed.as_secs_f64() * 1000.0,
            tps
        );
    }

    Ok(())
}
