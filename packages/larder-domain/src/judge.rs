//! Result judging: scores fused candidates against a request policy and applies the fallback
//! strategy when too few of them qualify.

use serde::{Deserialize, Serialize};

use crate::{
	Error, Result,
	ingredient::{IngredientScorer, TermOverlapScorer},
	recipe::{Candidate, ParsedQuery, ScoredCandidate, SearchFilters},
};

const SEMANTIC_WEIGHT: f32 = 0.4;
const FILTER_WEIGHT: f32 = 0.4;
const INGREDIENT_WEIGHT: f32 = 0.2;

pub const NO_CANDIDATES_MESSAGE: &str = "no candidates to judge";

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
	RelaxThresholds,
	EmptyResults,
	/// Currently served by the same best-effort path as `RelaxThresholds`.
	SuggestAlternatives,
}
impl FallbackStrategy {
	pub fn parse(value: &str) -> Result<Self> {
		match value.trim().to_ascii_lowercase().as_str() {
			"relax_thresholds" => Ok(Self::RelaxThresholds),
			"empty_results" => Ok(Self::EmptyResults),
			"suggest_alternatives" => Ok(Self::SuggestAlternatives),
			other => Err(Error::InvalidConfig {
				message: format!(
					"fallback_strategy must be one of: relax_thresholds, empty_results, suggest_alternatives. Got {other}."
				),
			}),
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Self::RelaxThresholds => "relax_thresholds",
			Self::EmptyResults => "empty_results",
			Self::SuggestAlternatives => "suggest_alternatives",
		}
	}
}

/// Per-request judging policy. Read-only for the duration of a pipeline run.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct JudgeConfig {
	pub semantic_threshold: f32,
	pub filter_compliance_min: f32,
	pub ingredient_match_min: f32,
	pub confidence_threshold: f32,
	pub dietary_strict_mode: bool,
	pub min_results: usize,
	pub max_results: usize,
	pub fallback_strategy: FallbackStrategy,
}
impl JudgeConfig {
	pub fn from_config(cfg: &larder_config::Judge) -> Result<Self> {
		let config = Self {
			semantic_threshold: cfg.semantic_threshold,
			filter_compliance_min: cfg.filter_compliance_min,
			ingredient_match_min: cfg.ingredient_match_min,
			confidence_threshold: cfg.confidence_threshold,
			dietary_strict_mode: cfg.dietary_strict_mode,
			min_results: cfg.min_results,
			max_results: cfg.max_results,
			fallback_strategy: FallbackStrategy::parse(&cfg.fallback_strategy)?,
		};

		config.validate()?;

		Ok(config)
	}

	pub fn validate(&self) -> Result<()> {
		for (label, value) in [
			("semantic_threshold", self.semantic_threshold),
			("filter_compliance_min", self.filter_compliance_min),
			("ingredient_match_min", self.ingredient_match_min),
			("confidence_threshold", self.confidence_threshold),
		] {
			if !value.is_finite() || !(0.0..=1.0).contains(&value) {
				return Err(Error::InvalidConfig {
					message: format!("{label} must be a finite number in the range 0.0-1.0."),
				});
			}
		}

		if self.max_results == 0 {
			return Err(Error::InvalidConfig {
				message: "max_results must be greater than zero.".to_string(),
			});
		}

		Ok(())
	}
}
impl Default for JudgeConfig {
	fn default() -> Self {
		Self {
			semantic_threshold: 0.3,
			filter_compliance_min: 0.5,
			ingredient_match_min: 0.3,
			confidence_threshold: 0.5,
			dietary_strict_mode: true,
			min_results: 3,
			max_results: 20,
			fallback_strategy: FallbackStrategy::RelaxThresholds,
		}
	}
}

/// Score breakdown for one candidate.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct JudgeVerdict {
	pub semantic_score: f32,
	pub filter_compliance: f32,
	pub ingredient_match: f32,
	pub dietary_compliant: bool,
	pub confidence: f32,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct DimensionCounts {
	pub passed: usize,
	pub failed: usize,
}
impl DimensionCounts {
	fn record(&mut self, passed: bool) {
		if passed {
			self.passed += 1;
		} else {
			self.failed += 1;
		}
	}
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct JudgeMetrics {
	pub total_evaluated: usize,
	pub semantic: DimensionCounts,
	pub filter: DimensionCounts,
	pub dietary: DimensionCounts,
	pub confidence: DimensionCounts,
	/// Informational only; ingredient match never gates admission.
	pub ingredient: DimensionCounts,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct JudgeReport {
	pub original_count: usize,
	pub filtered_count: usize,
	pub removed_count: usize,
	pub metrics: JudgeMetrics,
	pub fallback_applied: Option<FallbackStrategy>,
	pub message: Option<String>,
	pub config_snapshot: JudgeConfig,
}
impl JudgeReport {
	pub fn empty(config: &JudgeConfig) -> Self {
		Self {
			original_count: 0,
			filtered_count: 0,
			removed_count: 0,
			metrics: JudgeMetrics::default(),
			fallback_applied: None,
			message: Some(NO_CANDIDATES_MESSAGE.to_string()),
			config_snapshot: config.clone(),
		}
	}
}

pub struct JudgeInput<'a> {
	pub candidates: Vec<ScoredCandidate>,
	pub query: &'a ParsedQuery,
	pub filters: &'a SearchFilters,
	pub config: &'a JudgeConfig,
	/// Whether semantic retrieval ran for this query. Candidates without a `similarity` carry no
	/// semantic signal and score `1.0` on that dimension either way.
	pub semantic_used: bool,
}

pub struct JudgeEngine {
	ingredient_scorer: Box<dyn IngredientScorer>,
}
impl JudgeEngine {
	pub fn new(ingredient_scorer: Box<dyn IngredientScorer>) -> Self {
		Self { ingredient_scorer }
	}

	pub fn judge(&self, input: JudgeInput<'_>) -> (Vec<ScoredCandidate>, JudgeReport) {
		let JudgeInput { candidates, query, filters, config, semantic_used } = input;

		if candidates.is_empty() {
			return (Vec::new(), JudgeReport::empty(config));
		}

		let original_count = candidates.len();
		let mut metrics = JudgeMetrics::default();
		let mut passed = Vec::with_capacity(candidates.len());

		for item in &candidates {
			let verdict = self.evaluate(item, query, filters, semantic_used);
			let semantic_ok = !semantic_used || verdict.semantic_score >= config.semantic_threshold;
			let filter_ok = verdict.filter_compliance >= config.filter_compliance_min;
			let confidence_ok = verdict.confidence >= config.confidence_threshold;
			let dietary_ok = verdict.dietary_compliant || !config.dietary_strict_mode;

			metrics.total_evaluated += 1;
			metrics.semantic.record(semantic_ok);
			metrics.filter.record(filter_ok);
			metrics.dietary.record(dietary_ok);
			metrics.confidence.record(confidence_ok);
			metrics.ingredient.record(verdict.ingredient_match >= config.ingredient_match_min);

			let admitted = semantic_ok && filter_ok && confidence_ok && dietary_ok;

			tracing::debug!(
				candidate_id = item.id(),
				semantic_score = verdict.semantic_score,
				filter_compliance = verdict.filter_compliance,
				ingredient_match = verdict.ingredient_match,
				dietary_compliant = verdict.dietary_compliant,
				confidence = verdict.confidence,
				admitted,
				"Judged candidate."
			);

			if admitted {
				passed.push(item.clone());
			}
		}

		let mut fallback_applied = None;

		if passed.len() < config.min_results {
			tracing::info!(
				passed = passed.len(),
				min_results = config.min_results,
				strategy = config.fallback_strategy.as_str(),
				"Too few candidates passed judging; applying fallback."
			);

			passed = match config.fallback_strategy {
				FallbackStrategy::RelaxThresholds | FallbackStrategy::SuggestAlternatives =>
					candidates.iter().take(config.min_results).cloned().collect(),
				FallbackStrategy::EmptyResults => Vec::new(),
			};
			fallback_applied = Some(config.fallback_strategy);
		}

		passed.truncate(config.max_results);

		let filtered_count = passed.len();
		let report = JudgeReport {
			original_count,
			filtered_count,
			removed_count: original_count.saturating_sub(filtered_count),
			metrics,
			fallback_applied,
			message: None,
			config_snapshot: config.clone(),
		};

		(passed, report)
	}

	pub fn evaluate(
		&self,
		item: &ScoredCandidate,
		query: &ParsedQuery,
		filters: &SearchFilters,
		semantic_used: bool,
	) -> JudgeVerdict {
		let semantic_score = match (semantic_used, item.similarity) {
			(true, Some(similarity)) => similarity,
			_ => 1.0,
		};
		let (filter_compliance, dietary_compliant) = filter_compliance(filters, &item.candidate);
		let ingredient_match =
			self.ingredient_scorer.score(&query.ingredients, &item.candidate).clamp(0.0, 1.0);
		let confidence = SEMANTIC_WEIGHT * semantic_score
			+ FILTER_WEIGHT * filter_compliance
			+ INGREDIENT_WEIGHT * ingredient_match;

		JudgeVerdict {
			semantic_score,
			filter_compliance,
			ingredient_match,
			dietary_compliant,
			confidence,
		}
	}
}
impl Default for JudgeEngine {
	fn default() -> Self {
		Self::new(Box::new(TermOverlapScorer))
	}
}

/// Fraction of active filters matched, and whether the diet filter (if any) held.
fn filter_compliance(filters: &SearchFilters, candidate: &Candidate) -> (f32, bool) {
	let checks = [
		filters.matches_cuisine(candidate),
		filters.matches_difficulty(candidate),
		filters.matches_prep_time(candidate),
		filters.matches_cook_time(candidate),
		filters.matches_total_time(candidate),
	];
	let diets = filters.matches_diets(candidate);
	let mut active = 0_usize;
	let mut matched = 0_usize;

	for check in checks.into_iter().chain(std::iter::once(diets)).flatten() {
		active += 1;

		if check {
			matched += 1;
		}
	}

	let compliance = if active == 0 { 1.0 } else { matched as f32 / active as f32 };

	(compliance, diets.unwrap_or(true))
}
