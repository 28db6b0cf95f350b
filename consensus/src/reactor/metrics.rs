use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
};

/// Function label for metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FnLabel {
    pub fn_id: String,
}

impl FnLabel {
    pub fn new(fn_id: &str) -> Self {
        Self {
            fn_id: fn_id.to_string(),
        }
    }
}

/// Outcome of handling a received vote set.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Invalid,
    Stale,
    Ignored,
    Merged,
    Replaced,
    Adopted,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabel {
    pub outcome: Outcome,
}

impl OutcomeLabel {
    pub const fn new(outcome: Outcome) -> Self {
        Self { outcome }
    }
}

/// Metrics for the [super::Engine].
pub struct Metrics {
    /// Number of multi-signed messages submitted per function
    pub submitted: Family<FnLabel, Counter>,
    /// Next nonce per function
    pub nonce: Family<FnLabel, Gauge>,
    /// Number of vote sets received by outcome
    pub vote_sets: Family<OutcomeLabel, Counter>,
    /// Number of converged vote sets received by outcome
    pub maj_vote_sets: Family<OutcomeLabel, Counter>,
    /// Number of vote sets proposed
    pub proposals: Counter,
    /// Number of vote sets committed
    pub commits: Counter,
    /// Number of function callbacks that panicked
    pub panics: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init(context: impl RuntimeMetrics) -> Self {
        let submitted = Family::default();
        context.register(
            "submitted",
            "Number of multi-signed messages submitted per function",
            submitted.clone(),
        );
        let nonce = Family::default();
        context.register("nonce", "Next nonce per function", nonce.clone());
        let vote_sets = Family::default();
        context.register(
            "vote_sets",
            "Number of vote sets received by outcome",
            vote_sets.clone(),
        );
        let maj_vote_sets = Family::default();
        context.register(
            "maj_vote_sets",
            "Number of converged vote sets received by outcome",
            maj_vote_sets.clone(),
        );
        let proposals = Counter::default();
        context.register(
            "proposals",
            "Number of vote sets proposed",
            proposals.clone(),
        );
        let commits = Counter::default();
        context.register("commits", "Number of vote sets committed", commits.clone());
        let panics = Counter::default();
        context.register(
            "panics",
            "Number of function callbacks that panicked",
            panics.clone(),
        );

        Self {
            submitted,
            nonce,
            vote_sets,
            maj_vote_sets,
            proposals,
            commits,
            panics,
        }
    }
}
