//! Hybrid search pipeline.
//!
//! A fixed state machine: each [`Stage`] has exactly one handler in the dispatch table, and the
//! next stage is chosen by the pure routing functions [`route_after_parse`] and
//! [`route_after_judge`]. Stage handlers absorb provider and retriever failures into the run's
//! diagnostics; only sequencing defects and invalid requests escape.

use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

use crate::{Error, LarderService, LlmCallSettings, Result};
use larder_config::Config;
use larder_domain::{
	DistanceMetric, EmbeddingTask, JudgeConfig, JudgeInput, JudgeReport, ParsedQuery,
	ScoredCandidate, SearchFilters,
};

const FILTER_MATCH_SCORE: f32 = 1.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
	ParseQuery,
	Retrieve,
	MergeResults,
	JudgeRelevance,
	Rerank,
	FormatResponse,
	Done,
}
impl Stage {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::ParseQuery => "parse_query",
			Self::Retrieve => "retrieve",
			Self::MergeResults => "merge_results",
			Self::JudgeRelevance => "judge_relevance",
			Self::Rerank => "rerank",
			Self::FormatResponse => "format_response",
			Self::Done => "done",
		}
	}
}

/// Steps inside the two retrieval branches of [`Stage::Retrieve`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStep {
	GenerateEmbedding,
	VectorSearch,
	ExtractFilters,
	FilterSearch,
}
impl BranchStep {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::GenerateEmbedding => "generate_embedding",
			Self::VectorSearch => "vector_search",
			Self::ExtractFilters => "extract_filters",
			Self::FilterSearch => "filter_search",
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
	Both,
	SemanticOnly,
	FilterOnly,
}
impl Route {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Both => "both",
			Self::SemanticOnly => "semantic_only",
			Self::FilterOnly => "filter_only",
		}
	}

	pub fn uses_semantic(self) -> bool {
		matches!(self, Self::Both | Self::SemanticOnly)
	}

	pub fn uses_filters(self) -> bool {
		matches!(self, Self::Both | Self::FilterOnly)
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StageFailure {
	pub stage: String,
	pub message: String,
}
impl StageFailure {
	fn record(stage: &str, err: &Error) -> Self {
		tracing::warn!(stage, error = %err, "Pipeline stage failed; continuing with a safe default.");

		Self { stage: stage.to_string(), message: err.to_string() }
	}
}

#[derive(Clone, Debug, Serialize)]
pub struct PipelineOutput {
	pub results: Vec<ScoredCandidate>,
	pub judge_report: JudgeReport,
	pub metadata: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSettings {
	pub candidate_limit: usize,
	pub rrf_k: u32,
	pub distance_metric: DistanceMetric,
	pub embedding_timeout: Duration,
	pub retrieval_timeout: Duration,
	pub rerank_enabled: bool,
	pub rerank_min_results: usize,
	pub rerank_min_removed: usize,
	pub rerank_max_candidates: usize,
	pub understanding: LlmCallSettings,
	pub rerank: LlmCallSettings,
}
impl PipelineSettings {
	pub fn from_config(cfg: &Config) -> Result<Self> {
		let pipeline = &cfg.pipeline;
		let llm = &cfg.providers.llm;
		let llm_timeout = Duration::from_millis(llm.timeout_ms);

		Ok(Self {
			candidate_limit: pipeline.candidate_limit as usize,
			rrf_k: pipeline.rrf_k,
			distance_metric: DistanceMetric::parse(&pipeline.distance_metric)?,
			embedding_timeout: Duration::from_millis(cfg.providers.embedding.timeout_ms),
			retrieval_timeout: Duration::from_millis(pipeline.retrieval_timeout_ms),
			rerank_enabled: pipeline.rerank_enabled,
			rerank_min_results: pipeline.rerank_min_results,
			rerank_min_removed: pipeline.rerank_min_removed,
			rerank_max_candidates: pipeline.rerank_max_candidates,
			understanding: LlmCallSettings {
				max_tokens: pipeline.understanding_max_tokens,
				temperature: llm.temperature,
				timeout: llm_timeout,
			},
			rerank: LlmCallSettings {
				max_tokens: pipeline.rerank_max_tokens,
				temperature: llm.temperature,
				timeout: llm_timeout,
			},
		})
	}
}
impl Default for PipelineSettings {
	fn default() -> Self {
		let llm_call = |max_tokens| LlmCallSettings {
			max_tokens,
			temperature: 0.1,
			timeout: Duration::from_secs(10),
		};

		Self {
			candidate_limit: 50,
			rrf_k: larder_domain::DEFAULT_RRF_K,
			distance_metric: DistanceMetric::Cosine,
			embedding_timeout: Duration::from_secs(10),
			retrieval_timeout: Duration::from_secs(5),
			rerank_enabled: true,
			rerank_min_results: 3,
			rerank_min_removed: 5,
			rerank_max_candidates: 20,
			understanding: llm_call(500),
			rerank: llm_call(200),
		}
	}
}

/// Chooses the retrieval branches for a parsed query. With neither signal present the filter
/// path still runs so the run always attempts some retrieval.
pub fn route_after_parse(parsed: &ParsedQuery, filters: &SearchFilters) -> Route {
	match (parsed.has_semantic_query(), !filters.is_empty()) {
		(true, true) => Route::Both,
		(true, false) => Route::SemanticOnly,
		(false, _) => Route::FilterOnly,
	}
}

/// Reranks only when judging kept a meaningful set and removed a meaningful share.
pub fn route_after_judge(judged: usize, removed: usize, settings: &PipelineSettings) -> Stage {
	if settings.rerank_enabled
		&& judged > settings.rerank_min_results
		&& removed > settings.rerank_min_removed
	{
		Stage::Rerank
	} else {
		Stage::FormatResponse
	}
}

struct PipelineState {
	run_id: Uuid,
	started_at: OffsetDateTime,
	query: String,
	judge_config: JudgeConfig,
	parsed_query: Option<ParsedQuery>,
	filters: SearchFilters,
	route: Option<Route>,
	embedding: Option<Vec<f32>>,
	semantic_used: bool,
	semantic_results: Vec<ScoredCandidate>,
	filter_results: Vec<ScoredCandidate>,
	merged_results: Option<Vec<ScoredCandidate>>,
	filtered_results: Option<Vec<ScoredCandidate>>,
	judge_report: Option<JudgeReport>,
	final_results: Option<Vec<ScoredCandidate>>,
	reranked: bool,
	stages: Vec<&'static str>,
	errors: Vec<StageFailure>,
	metadata: Map<String, Value>,
}
impl PipelineState {
	fn new(query: &str, judge_config: JudgeConfig) -> Self {
		Self {
			run_id: Uuid::new_v4(),
			started_at: OffsetDateTime::now_utc(),
			query: query.to_string(),
			judge_config,
			parsed_query: None,
			filters: SearchFilters::default(),
			route: None,
			embedding: None,
			semantic_used: false,
			semantic_results: Vec::new(),
			filter_results: Vec::new(),
			merged_results: None,
			filtered_results: None,
			judge_report: None,
			final_results: None,
			reranked: false,
			stages: Vec::new(),
			errors: Vec::new(),
			metadata: Map::new(),
		}
	}

	fn parsed_query(&self) -> Result<&ParsedQuery> {
		self.parsed_query.as_ref().ok_or_else(|| missing("parsed query"))
	}

	fn into_output(self) -> Result<PipelineOutput> {
		let Some(judge_report) = self.judge_report else {
			return Err(missing("judge report"));
		};
		let Some(results) = self.final_results else {
			return Err(missing("final results"));
		};

		Ok(PipelineOutput { results, judge_report, metadata: self.metadata })
	}
}

#[derive(Default)]
struct BranchOutcome {
	steps: Vec<BranchStep>,
	embedding: Option<Vec<f32>>,
	searched: bool,
	results: Vec<ScoredCandidate>,
	failure: Option<StageFailure>,
}
impl BranchOutcome {
	fn failed(mut self, step: BranchStep, err: &Error) -> Self {
		self.failure = Some(StageFailure::record(step.as_str(), err));

		self
	}
}

impl LarderService {
	/// Runs one query through parsing, retrieval, fusion, judging and optional reranking.
	///
	/// `judge_config` overrides the configured judge defaults for this run only.
	pub async fn run_pipeline(
		&self,
		query: &str,
		judge_config: Option<JudgeConfig>,
	) -> Result<PipelineOutput> {
		let query = query.trim();

		if query.is_empty() {
			return Err(Error::InvalidRequest { message: "query must be non-empty.".to_string() });
		}

		let judge_config = judge_config.unwrap_or_else(|| self.default_judge.clone());

		judge_config.validate()?;

		let mut state = PipelineState::new(query, judge_config);
		let mut stage = Stage::ParseQuery;

		while stage != Stage::Done {
			state.stages.push(stage.as_str());

			stage = self.dispatch(stage, &mut state).await?;
		}

		tracing::info!(
			run_id = %state.run_id,
			results = state.final_results.as_ref().map(Vec::len).unwrap_or_default(),
			errors = state.errors.len(),
			reranked = state.reranked,
			"Pipeline run finished."
		);

		state.into_output()
	}

	async fn dispatch(&self, stage: Stage, state: &mut PipelineState) -> Result<Stage> {
		match stage {
			Stage::ParseQuery => Ok(self.parse_query(state).await),
			Stage::Retrieve => self.retrieve(state).await,
			Stage::MergeResults => Ok(self.merge_results(state)),
			Stage::JudgeRelevance => self.judge_relevance(state),
			Stage::Rerank => self.rerank_results(state).await,
			Stage::FormatResponse => self.format_response(state),
			Stage::Done => Err(Error::InvalidState {
				message: "the done stage has no handler.".to_string(),
			}),
		}
	}

	async fn parse_query(&self, state: &mut PipelineState) -> Stage {
		let parsed = match self.understander().try_parse(&state.query).await {
			Ok(parsed) => parsed,
			Err(err) => {
				state.errors.push(StageFailure::record(Stage::ParseQuery.as_str(), &err));

				ParsedQuery::fallback(&state.query)
			},
		};
		let filters = SearchFilters::from_parsed(&parsed);
		let route = route_after_parse(&parsed, &filters);

		tracing::debug!(
			route = route.as_str(),
			active_filters = filters.active_count(),
			ingredients = parsed.ingredients.len(),
			"Parsed query."
		);

		state.parsed_query = Some(parsed);
		state.filters = filters;
		state.route = Some(route);

		Stage::Retrieve
	}

	async fn retrieve(&self, state: &mut PipelineState) -> Result<Stage> {
		let Some(route) = state.route else {
			return Err(missing("route"));
		};
		let parsed = state.parsed_query()?;
		let filters = &state.filters;
		let semantic = async {
			if route.uses_semantic() {
				self.semantic_branch(&parsed.semantic_query).await
			} else {
				BranchOutcome::default()
			}
		};
		let filter = async {
			if route.uses_filters() {
				self.filter_branch(filters).await
			} else {
				BranchOutcome::default()
			}
		};
		let (semantic, filter) = tokio::join!(semantic, filter);

		// Branch steps are logged semantic first so the trace does not depend on completion order.
		for outcome in [&semantic, &filter] {
			state.stages.extend(outcome.steps.iter().map(|step| step.as_str()));
		}

		state.errors.extend(semantic.failure);
		state.errors.extend(filter.failure);
		state.embedding = semantic.embedding;
		state.semantic_used = semantic.searched;
		state.semantic_results = semantic.results;
		state.filter_results = filter.results;

		tracing::debug!(
			semantic_count = state.semantic_results.len(),
			filter_count = state.filter_results.len(),
			"Retrieved candidates."
		);

		Ok(Stage::MergeResults)
	}

	async fn semantic_branch(&self, text: &str) -> BranchOutcome {
		let mut outcome =
			BranchOutcome { steps: vec![BranchStep::GenerateEmbedding], ..Default::default() };
		let embedded = crate::with_timeout(
			BranchStep::GenerateEmbedding.as_str(),
			self.settings.embedding_timeout,
			self.collaborators.embedding.embed(text, EmbeddingTask::RetrievalQuery),
		)
		.await;
		let embedding = match embedded {
			Ok(vector) if !vector.is_empty() => vector,
			Ok(_) => {
				let err = Error::Provider {
					message: "Embedding provider returned an empty vector.".to_string(),
				};

				return outcome.failed(BranchStep::GenerateEmbedding, &err);
			},
			Err(err) => return outcome.failed(BranchStep::GenerateEmbedding, &err),
		};
		let metric = self.settings.distance_metric;

		outcome.steps.push(BranchStep::VectorSearch);

		let searched = crate::with_timeout(
			BranchStep::VectorSearch.as_str(),
			self.settings.retrieval_timeout,
			self.collaborators.vectors.search(&embedding, self.settings.candidate_limit, metric),
		)
		.await;

		outcome.embedding = Some(embedding);

		match searched {
			Ok(hits) => {
				outcome.searched = true;
				outcome.results = hits
					.into_iter()
					.take(self.settings.candidate_limit)
					.map(|(candidate, distance)| {
						ScoredCandidate::from_similarity(candidate, metric.similarity(distance))
					})
					.collect();

				outcome
			},
			Err(err) => outcome.failed(BranchStep::VectorSearch, &err),
		}
	}

	async fn filter_branch(&self, filters: &SearchFilters) -> BranchOutcome {
		let mut outcome = BranchOutcome {
			steps: vec![BranchStep::ExtractFilters, BranchStep::FilterSearch],
			..Default::default()
		};

		tracing::debug!(active_filters = filters.active_count(), "Extracted search filters.");

		let searched = crate::with_timeout(
			BranchStep::FilterSearch.as_str(),
			self.settings.retrieval_timeout,
			self.collaborators.filters.search(filters, self.settings.candidate_limit),
		)
		.await;

		match searched {
			Ok(candidates) => {
				outcome.searched = true;
				outcome.results = candidates
					.into_iter()
					.take(self.settings.candidate_limit)
					.map(|candidate| ScoredCandidate::new(candidate, FILTER_MATCH_SCORE))
					.collect();

				outcome
			},
			Err(err) => outcome.failed(BranchStep::FilterSearch, &err),
		}
	}

	fn merge_results(&self, state: &mut PipelineState) -> Stage {
		let merged =
			larder_domain::merge(&state.semantic_results, &state.filter_results, self.settings.rrf_k);

		tracing::debug!(merged_count = merged.len(), "Merged retrieval results.");

		state.merged_results = Some(merged);

		Stage::JudgeRelevance
	}

	fn judge_relevance(&self, state: &mut PipelineState) -> Result<Stage> {
		let Some(merged) = state.merged_results.as_ref() else {
			return Err(missing("merged results"));
		};
		let parsed = state.parsed_query()?;
		let (filtered, report) = self.judge.judge(JudgeInput {
			candidates: merged.clone(),
			query: parsed,
			filters: &state.filters,
			config: &state.judge_config,
			semantic_used: state.semantic_used,
		});
		let next = route_after_judge(filtered.len(), report.removed_count, &self.settings);

		tracing::debug!(
			filtered_count = filtered.len(),
			removed_count = report.removed_count,
			next = next.as_str(),
			"Judged merged results."
		);

		state.filtered_results = Some(filtered);
		state.judge_report = Some(report);

		Ok(next)
	}

	async fn rerank_results(&self, state: &mut PipelineState) -> Result<Stage> {
		let Some(filtered) = state.filtered_results.as_ref() else {
			return Err(missing("filtered results"));
		};
		let reranked = match self.reranker().try_rerank(filtered, &state.query).await {
			Ok(reranked) => {
				state.reranked = true;

				reranked
			},
			Err(err) => {
				state.errors.push(StageFailure::record(Stage::Rerank.as_str(), &err));

				filtered.clone()
			},
		};

		state.final_results = Some(reranked);

		Ok(Stage::FormatResponse)
	}

	fn format_response(&self, state: &mut PipelineState) -> Result<Stage> {
		if state.final_results.is_none() {
			state.final_results = state.filtered_results.clone();
		}

		let Some(report) = state.judge_report.as_ref() else {
			return Err(missing("judge report"));
		};
		let policy = serde_json::to_vec(&report.config_snapshot)
			.map_err(|err| Error::InvalidState { message: err.to_string() })?;
		let started_at = state
			.started_at
			.format(&Rfc3339)
			.map_err(|err| Error::InvalidState { message: err.to_string() })?;
		let filters = serde_json::to_value(&state.filters)
			.map_err(|err| Error::InvalidState { message: err.to_string() })?;
		let errors = serde_json::to_value(&state.errors)
			.map_err(|err| Error::InvalidState { message: err.to_string() })?;
		let count = |items: &Option<Vec<ScoredCandidate>>| {
			Value::from(items.as_ref().map(Vec::len).unwrap_or_default())
		};
		let metadata = &mut state.metadata;

		metadata.insert("run_id".to_string(), Value::String(state.run_id.to_string()));
		metadata.insert("started_at".to_string(), Value::String(started_at));
		metadata.insert("query".to_string(), Value::String(state.query.clone()));
		metadata.insert(
			"route".to_string(),
			state.route.map(|route| Value::String(route.as_str().to_string())).unwrap_or(Value::Null),
		);
		metadata.insert(
			"stages".to_string(),
			Value::Array(
				state
					.stages
					.iter()
					.map(|stage| Value::String((*stage).to_string()))
					.collect(),
			),
		);
		metadata.insert("semantic_count".to_string(), Value::from(state.semantic_results.len()));
		metadata.insert("filter_count".to_string(), Value::from(state.filter_results.len()));
		metadata.insert("merged_count".to_string(), count(&state.merged_results));
		metadata.insert("filtered_count".to_string(), count(&state.filtered_results));
		metadata.insert("reranked".to_string(), Value::Bool(state.reranked));
		metadata.insert("filters".to_string(), filters);
		metadata.insert(
			"judge_policy_hash".to_string(),
			Value::String(blake3::hash(&policy).to_hex().to_string()),
		);
		metadata.insert(
			"embedding_dimensions".to_string(),
			Value::from(state.embedding.as_ref().map(Vec::len).unwrap_or_default()),
		);
		metadata.insert("errors".to_string(), errors);

		if let Some(last) = state.errors.last() {
			metadata.insert("error".to_string(), Value::String(last.message.clone()));
		}

		Ok(Stage::Done)
	}
}

fn missing(what: &str) -> Error {
	Error::InvalidState { message: format!("{what} is not available at this stage.") }
}
