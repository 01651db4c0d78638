pub mod fusion;
pub mod ingredient;
pub mod judge;
pub mod recipe;

mod error;

pub use error::{Error, Result};
pub use fusion::{DEFAULT_RRF_K, merge};
pub use ingredient::{IngredientScorer, TermOverlapScorer};
pub use judge::{
	DimensionCounts, FallbackStrategy, JudgeConfig, JudgeEngine, JudgeInput, JudgeMetrics,
	JudgeReport, JudgeVerdict,
};
pub use recipe::{
	Candidate, DistanceMetric, EmbeddingTask, ParsedQuery, ScoredCandidate, SearchFilters,
};
