use std::{fs::File, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use occam_sim::{Runner, SchedulerKind, SimConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "occam",
    about = "Discrete-event simulator of a regex-lock workflow scheduler"
)]
struct Args {
    /// The folder of the run
    #[arg(short = 'f', long = "folder", default_value = "lessdc")]
    folder: String,

    /// The scale of the gap time
    #[arg(long = "gs", default_value = "1.0")]
    gs: String,

    /// The scale of the exec time
    #[arg(long = "es", default_value = "1.0")]
    es: String,

    /// The choice of scheduler
    #[arg(short = 's', long = "scheduler", value_enum, default_value = "occam_depset")]
    scheduler: Scheduler,

    /// Result file path
    #[arg(short = 'o', long = "output", default_value = "occam_depset.txt")]
    output: PathBuf,

    /// The number of workflows you want to run, -1 means run all
    #[arg(short = 'n', long = "num-wf", default_value_t = 1000)]
    num_wf: i64,

    /// Log file path
    #[arg(short = 'l', long = "log-file")]
    log_file: Option<PathBuf>,

    /// Run the structural sanity checks after every scheduling pass
    #[arg(long)]
    sanity: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Scheduler {
    #[value(name = "dc_fifo")]
    DcFifo,
    #[value(name = "dev_fifo")]
    DevFifo,
    #[value(name = "dc_depset")]
    DcDepset,
    #[value(name = "dev_depset")]
    DevDepset,
    #[value(name = "occam_depset")]
    OccamDepset,
    #[value(name = "occam_fifo")]
    OccamFifo,
}

impl From<Scheduler> for SchedulerKind {
    fn from(s: Scheduler) -> Self {
        match s {
            Scheduler::DcFifo => SchedulerKind::DcFifo,
            Scheduler::DevFifo => SchedulerKind::DevFifo,
            Scheduler::DcDepset => SchedulerKind::DcDepset,
            Scheduler::DevDepset => SchedulerKind::DevDepset,
            Scheduler::OccamDepset => SchedulerKind::OccamDepset,
            Scheduler::OccamFifo => SchedulerKind::OccamFifo,
        }
    }
}

fn init_tracing(log_file: Option<&PathBuf>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("cannot create log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_file.as_ref())?;

    let cfg = SimConfig::builder()
        .folder(args.folder)
        .gap_scale(args.gs)
        .exec_scale(args.es)
        .scheduler(args.scheduler.into())
        .output(args.output)
        .num_wf(args.num_wf)
        .sanity_check(args.sanity)
        .build();

    let mut runner = Runner::from_config(&cfg).context("setting up the simulation")?;
    let summary = runner.run().context("running the simulation")?;
    runner.write_outputs().context("writing the results")?;
    info!(
        arrivals = summary.arrivals,
        completions = summary.completions,
        deadlocks = summary.deadlocks,
        sim_end = summary.end_time,
        "done"
    );
    Ok(())
}
