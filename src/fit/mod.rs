//! Fitting: robust loss estimation and the training loop.

mod clip;
mod loss;
mod rng;
mod stats;
mod train;

pub use clip::{
    exp_normalize_mean, log_squeeze, masked_mean, median, median_log_squeeze, quantile, Squeezed,
};
pub use loss::{Batch, ClipConfig, CurvatureSink, LossFn, LossOutput, NoCurvature};
pub use rng::{split_seed, step_rng, RngSequence};
pub use stats::{HistorySink, NullSink, Stats, StatsSink, TracingSink};
pub use train::{Fit, StateCallback, TrainState};
