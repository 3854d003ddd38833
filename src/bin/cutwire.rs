//! Cut (and optionally strip) wire to length with a feed drive and a cutter.
//!
//! Each piece is measured from a freshly rezeroed drive position:
//!
//! 1. Feed to the strip length, bite the insulation, pull back, release
//! 2. Feed to the opposite-side cut, bite deeper, release
//! 3. Feed to the full length and cut through
//!
//! `--action` runs a single operation instead, for bench testing the mechanism.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::Parser;
use log::{debug, info};
use tokio::sync::mpsc;

use cutwire::axis_hal_factory::AxisHalFactory;
use cutwire::convergence::ConvergenceConfig;
use cutwire::sequencer::{Action, Job, Progress, RunParameters, WireSequencer};

#[derive(Parser, Debug)]
#[clap(name = "cutwire")]
struct Opts {
    /// Overall length in cm
    #[clap(short, long)]
    length: Option<f64>,

    /// Length of strip (0.0 means no strip)
    #[clap(short, long, default_value = "0.0")]
    strip: f64,

    /// Length of opposite side cut (0.0 means no cut)
    #[clap(short, long, default_value = "0.0")]
    cut: f64,

    /// Spool and cut a small amount of wire to begin with
    #[clap(short, long)]
    prime: bool,

    /// Make this many instances
    #[clap(short = 'n', long, default_value = "1")]
    count: u32,

    /// Add debugging delays
    #[clap(long)]
    slow: bool,

    /// Run one of break, stop, strip, release, query or advance_<cm> and exit
    #[clap(short, long)]
    action: Option<String>,

    /// Read run parameters (and optional "convergence" bounds) from a JSON file instead of the
    /// flags above
    #[clap(long, parse(from_os_str))]
    job: Option<PathBuf>,

    #[clap(long)]
    fake_hw: bool,

    /// Fraction of simulated round trips to drop (with --fake-hw)
    #[clap(long, default_value = "0.0")]
    miss_probability: f64,

    #[clap(long)]
    seed: Option<u64>,

    #[clap(long)]
    miss_limit: Option<u32>,

    #[clap(long)]
    iteration_limit: Option<u32>,

    #[clap(long)]
    rezero_attempt_limit: Option<u32>,
}

impl Opts {
    /// Flags given on the command line win over the job file's bounds.
    fn convergence_config(&self, defaults: ConvergenceConfig) -> ConvergenceConfig {
        ConvergenceConfig {
            miss_limit: self.miss_limit.unwrap_or(defaults.miss_limit),
            iteration_limit: self.iteration_limit.or(defaults.iteration_limit),
            rezero_attempt_limit: self.rezero_attempt_limit.unwrap_or(defaults.rezero_attempt_limit),
        }
    }

    fn job(&self) -> anyhow::Result<Job> {
        if let Some(job) = &self.job {
            return load_job(job);
        }
        let length_cm = self.length
            .ok_or_else(|| anyhow!("--length is required unless --action or --job is given"))?;
        let run = RunParameters {
            length_cm,
            strip_cm: self.strip,
            cut_cm: self.cut,
            prime: self.prime,
            count: self.count,
            slow: self.slow,
        };
        Ok(Job { run, convergence: None })
    }
}

fn load_job(path: &Path) -> anyhow::Result<Job> {
    let file = File::open(path).with_context(|| format!("opening job {}", path.display()))?;
    let job = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing job {}", path.display()))?;
    Ok(job)
}

enum Mode {
    Single(Action),
    Run(RunParameters),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts: Opts = Opts::parse();

    // Bad names and parameters are rejected before anything moves.
    let (mode, job_convergence) = match opts.action.as_deref() {
        Some(name) => (Mode::Single(name.parse()?), None),
        None => {
            let job = opts.job()?;
            (Mode::Run(job.run), job.convergence)
        }
    };
    let convergence = opts.convergence_config(job_convergence.unwrap_or_default());

    let hal = AxisHalFactory::new_maybe_mock(opts.fake_hw)
        .with_miss_probability(opts.miss_probability)
        .with_seed(opts.seed)
        .create_hal()?;

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let reporter = tokio::spawn(async move {
        while let Some(progress) = progress_rx.recv().await {
            match progress {
                Progress::UnitStarted { unit, .. } => println!("CUT NUMBER: {unit}"),
                Progress::Step(step) => debug!("{step:?}"),
                Progress::Finished { units } => info!("Finished {units} pieces"),
            }
        }
    });

    let mut sequencer = WireSequencer::new(hal, convergence).with_progress(progress_tx);
    let result = run(&mut sequencer, mode).await;

    // Closes the progress channel so the reporter drains and exits.
    drop(sequencer);
    reporter.await?;
    result
}

async fn run(sequencer: &mut WireSequencer, mode: Mode) -> anyhow::Result<()> {
    match mode {
        Mode::Single(Action::Query) => match sequencer.run_action(Action::Query).await? {
            Some(sample) => println!("{}", serde_json::to_string(&sample)?),
            None => println!("no telemetry (missed round trip)"),
        },
        Mode::Single(action) => {
            sequencer.run_action(action).await?;
        }
        Mode::Run(params) => {
            sequencer.run(&params).await?;
        }
    }
    Ok(())
}
