use clap::Parser;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rust_vmc::{
    read_run_config, Fit, GaussianMlp, HistorySink, LossFn, MetropolisSampler, Optimizer,
    PotentialHamiltonian, RunConfig, Stats, StatsSink, TracingSink,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.yml")]
    config: String,

    /// Override the number of training steps
    #[arg(long)]
    steps: Option<u64>,

    /// Override the root random seed
    #[arg(long)]
    seed: Option<u64>,
}

/// Logs every step and keeps the trajectory for the final summary.
#[derive(Default)]
struct RunSink {
    log: TracingSink,
    history: HistorySink,
}

impl StatsSink for RunSink {
    fn record(&mut self, step: u64, stats: &Stats) {
        self.log.record(step, stats);
        self.history.record(step, stats);
    }
}

fn run(config: &RunConfig) -> rust_vmc::Result<Vec<f64>> {
    let ansatz = GaussianMlp::new(config.sampler.n_electrons, config.ansatz.hidden);
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let params = ansatz.init_params(config.ansatz.alpha, &mut rng)?;

    let sampler = MetropolisSampler::new(ansatz.clone(), config.sampler.clone())?;
    let hamiltonian = PotentialHamiltonian::new(config.system.clone());
    let loss = LossFn::new(ansatz, hamiltonian, config.fit)?;
    let optimizer = Optimizer::new(loss, sampler, config.optimizer.clone())?;

    let mut fit = Fit::new(optimizer, params, 0..config.steps, config.seed)?
        .with_sink(RunSink::default());
    for item in fit.by_ref() {
        item?;
    }
    Ok(fit.sink().history.series("E_loc/mean"))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match read_run_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to read {}: {}", args.config, e);
            std::process::exit(1);
        }
    };
    if let Some(steps) = args.steps {
        config.steps = steps;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    info!(steps = config.steps, seed = config.seed, "starting VMC training");

    let energies = match run(&config) {
        Ok(energies) => energies,
        Err(e) => {
            error!("training failed: {}", e);
            std::process::exit(1);
        }
    };

    // Average over the second half of the run
    let tail = &energies[energies.len() / 2..];
    println!("VMC Training Results");
    println!("--------------------");
    println!("Steps: {}", energies.len());
    if let Some(last) = energies.last() {
        println!("Final energy: {:.6} Ha", last);
    }
    if !tail.is_empty() {
        let mean = tail.iter().sum::<f64>() / tail.len() as f64;
        println!("Average energy (second half): {:.6} Ha", mean);
    }
}
