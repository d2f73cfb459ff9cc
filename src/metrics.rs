use vise::{Counter, EncodeLabelSet, Family, Histogram, Metrics};

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct BuildOutcomeLabel {
    pub outcome: &'static str,
}

#[derive(Debug, Metrics)]
#[metrics(prefix = "runepool_btc_client")]
pub struct RunepoolBtcClientMetrics {
    /// Number of transaction builds started
    pub builds_started: Counter,

    /// Number of builds finished, by outcome
    pub builds_finished: Family<BuildOutcomeLabel, Counter>,

    /// Fee loop iterations needed per converged build
    #[metrics(buckets = vise::Buckets::linear(1.0..=10.0, 1.0))]
    pub fee_loop_iterations: Histogram<usize>,
}

#[vise::register]
pub static METRICS: vise::Global<RunepoolBtcClientMetrics> = vise::Global::new();
