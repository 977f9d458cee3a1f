pub mod aggregator;
pub mod types;

pub use aggregator::{decay_factor, signal_bias, SignalAggregator};
pub use types::{Bias, Consensus, MarketRegime, RawSignal, WeightedSignal};

/// Pre-aggregation quality hook. Spam and duplicate suppression live
/// behind this seam; a batch filtered down to nothing takes the normal
/// skip path.
pub trait SignalQualityFilter: Send + Sync {
    fn filter(&self, batch: Vec<RawSignal>) -> Vec<RawSignal>;
}

/// Default filter: passes everything through.
pub struct Unfiltered;

impl SignalQualityFilter for Unfiltered {
    fn filter(&self, batch: Vec<RawSignal>) -> Vec<RawSignal> {
        batch
    }
}
