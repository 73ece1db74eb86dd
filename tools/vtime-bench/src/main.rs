use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use vtime_bench::{AdvanceParams, MachinesParams};

#[derive(Parser, Debug)]
#[command(author, version, about = "Drive synthetic workloads through the vtime engine")]
struct Opts {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "warn", value_name = "FILTER")]
    log: String,

    #[command(subcommand)]
    workload: Workload,
}

#[derive(Subcommand, Debug)]
enum Workload {
    /// Advance one clock source carrying many periodic entries
    Advance {
        #[arg(long, default_value_t = 64)]
        entries: i64,
        #[arg(long, default_value_t = 1)]
        min_period: i64,
        #[arg(long, default_value_t = 1_000_000)]
        ticks: i64,
        /// Ticks per `advance` call
        #[arg(long, default_value_t = 1_000)]
        step: i64,
    },
    /// Spin participants of one synchronization domain through barrier phases
    Sync {
        #[arg(long, default_value_t = 4)]
        threads: usize,
        #[arg(long, default_value_t = 10_000)]
        phases: usize,
    },
    /// Run several machines in lock step
    Machines {
        #[arg(long, default_value_t = 2)]
        machines: usize,
        #[arg(long, default_value_t = 100)]
        sync_unit: i64,
        #[arg(long, default_value_t = 1_000_000)]
        ticks: i64,
        #[arg(long, default_value_t = 1_000)]
        step: i64,
    },
    /// Let host time drive a single entry and compare against wall time
    Host {
        #[arg(long, default_value_t = 1_000)]
        frequency: i64,
        #[arg(long, default_value_t = 1_000, value_name = "MS")]
        millis: u64,
    },
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&opts.log)).init();

    let report = match opts.workload {
        Workload::Advance {
            entries,
            min_period,
            ticks,
            step,
        } => vtime_bench::advance(AdvanceParams {
            entries,
            min_period,
            ticks,
            step,
        })?,
        Workload::Sync { threads, phases } => vtime_bench::sync(threads, phases)?,
        Workload::Machines {
            machines,
            sync_unit,
            ticks,
            step,
        } => vtime_bench::machines(MachinesParams {
            machines,
            sync_unit,
            ticks,
            step,
        })?,
        Workload::Host { frequency, millis } => {
            vtime_bench::host(frequency, Duration::from_millis(millis))?
        }
    };

    println!("{report}");
    Ok(())
}
