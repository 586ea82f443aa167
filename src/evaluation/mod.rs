pub mod controller;
pub mod progress;
pub mod recorder;
pub mod scorer;

pub use controller::{EvaluationController, QueryBatch};
pub use scorer::ScorerConfig;
