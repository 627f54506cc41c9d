pub mod divergence;
pub mod engine;
pub mod scoring;
pub mod series;
pub mod snapshot;
pub mod validator;
pub mod wtmfi;

pub use divergence::{compute_signals, DivergenceKind, DivergenceSignal};
pub use engine::{compute_atr_series, compute_report, IndicatorValue, Report};
pub use scoring::{
    base_weight, score_with_weights, Direction, DivergenceRecord, DivergenceScorer, ScoreResult,
    ScoredSignal,
};
pub use snapshot::{build_snapshot, IndicatorSnapshot, SNAPSHOT_VERSION};
pub use validator::{DivergenceValidator, PendingValidation};
pub use wtmfi::WtMfiSettings;
