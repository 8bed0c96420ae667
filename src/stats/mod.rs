//! Statistics: latency histograms and rolling rate samples

pub mod histogram;
pub mod sampler;

pub use histogram::LatencyHistogram;
pub use sampler::RateSampler;
