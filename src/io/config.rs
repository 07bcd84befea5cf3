use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VmcError};
use crate::fit::ClipConfig;
use crate::hamiltonian::Potential;
use crate::optim::OptimizerConfig;
use crate::sampling::MetropolisConfig;

/// Shape of the Gaussian-envelope network.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnsatzConfig {
    #[serde(default = "default_hidden")]
    pub hidden: usize,
    /// Initial envelope exponent
    #[serde(default = "default_alpha")]
    pub alpha: f64,
}

fn default_hidden() -> usize {
    8
}
fn default_alpha() -> f64 {
    0.7
}

impl Default for AnsatzConfig {
    fn default() -> Self {
        Self {
            hidden: default_hidden(),
            alpha: default_alpha(),
        }
    }
}

/// Everything a training run reads from its YAML file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_steps")]
    pub steps: u64,
    #[serde(default)]
    pub ansatz: AnsatzConfig,
    pub system: Potential,
    pub sampler: MetropolisConfig,
    pub fit: ClipConfig,
    /// Written as a single-key map naming the backend
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub optimizer: OptimizerConfig,
}

fn default_steps() -> u64 {
    100
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ansatz.hidden == 0 || !(self.ansatz.alpha > 0.0) {
            return Err(VmcError::InvalidConfig(format!(
                "ansatz needs hidden > 0 and alpha > 0, got {} and {}",
                self.ansatz.hidden, self.ansatz.alpha
            )));
        }
        self.sampler.validate()?;
        self.fit.validate()?;
        self.optimizer.validate()
    }
}

/// Parse and validate a run configuration.
pub fn parse_run_config(yaml: &str) -> Result<RunConfig> {
    let config: RunConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

/// Read and validate a run configuration from a YAML file.
pub fn read_run_config<P: AsRef<Path>>(filename: P) -> Result<RunConfig> {
    let file = File::open(filename)?;
    let reader = BufReader::new(file);
    let config: RunConfig = serde_yaml::from_reader(reader)?;
    config.validate()?;
    Ok(config)
}
