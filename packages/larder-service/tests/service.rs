use std::{
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration,
};

use serde_json::Value;

use larder_domain::{
	Candidate, DistanceMetric, EmbeddingTask, FallbackStrategy, IngredientScorer, JudgeConfig,
	JudgeEngine, ParsedQuery, ScoredCandidate, SearchFilters, judge::NO_CANDIDATES_MESSAGE,
};
use larder_service::{
	BoxFuture, Collaborators, EmbeddingProvider, Error, FilterRetriever, LanguageModel,
	LarderService, PipelineSettings, RateLimiter, Result, VectorRetriever,
};

struct ScriptedLlm {
	understanding: Option<String>,
	ranking: Option<String>,
	delay: Option<Duration>,
	calls: Arc<AtomicUsize>,
}
impl ScriptedLlm {
	fn new(understanding: Option<&str>, ranking: Option<&str>) -> Self {
		Self {
			understanding: understanding.map(str::to_string),
			ranking: ranking.map(str::to_string),
			delay: None,
			calls: Arc::new(AtomicUsize::new(0)),
		}
	}

	fn failing() -> Self {
		Self::new(None, None)
	}

	fn count(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}
impl LanguageModel for ScriptedLlm {
	fn generate<'a>(
		&'a self,
		prompt: &'a str,
		_max_tokens: u32,
		_temperature: f32,
	) -> BoxFuture<'a, Result<String>> {
		self.calls.fetch_add(1, Ordering::SeqCst);

		let reply =
			if prompt.contains("Recipes:") { self.ranking.clone() } else { self.understanding.clone() };
		let delay = self.delay;

		Box::pin(async move {
			if let Some(delay) = delay {
				tokio::time::sleep(delay).await;
			}

			reply.ok_or_else(|| Error::Provider { message: "language model unavailable".to_string() })
		})
	}
}

struct StaticEmbedding {
	fail: bool,
}
impl EmbeddingProvider for StaticEmbedding {
	fn embed<'a>(&'a self, _text: &'a str, task: EmbeddingTask) -> BoxFuture<'a, Result<Vec<f32>>> {
		let fail = self.fail;

		Box::pin(async move {
			assert_eq!(task, EmbeddingTask::RetrievalQuery);

			if fail {
				return Err(Error::Provider { message: "embedding endpoint down".to_string() });
			}

			Ok(vec![0.1, 0.2, 0.3])
		})
	}
}

struct ListVectors {
	hits: Option<Vec<(Candidate, f32)>>,
	delay: Option<Duration>,
}
impl VectorRetriever for ListVectors {
	fn search<'a>(
		&'a self,
		_vector: &'a [f32],
		limit: usize,
		metric: DistanceMetric,
	) -> BoxFuture<'a, Result<Vec<(Candidate, f32)>>> {
		Box::pin(async move {
			assert_eq!(metric, DistanceMetric::Cosine);

			if let Some(delay) = self.delay {
				tokio::time::sleep(delay).await;
			}

			let hits = self.hits.as_ref().ok_or_else(|| Error::Retrieval {
				message: "vector store outage".to_string(),
			})?;

			Ok(hits.iter().take(limit).cloned().collect())
		})
	}
}

struct CatalogFilters {
	catalog: Option<Vec<Candidate>>,
	calls: Arc<AtomicUsize>,
}
impl CatalogFilters {
	fn new(catalog: Vec<Candidate>) -> Self {
		Self { catalog: Some(catalog), calls: Arc::new(AtomicUsize::new(0)) }
	}
}
impl FilterRetriever for CatalogFilters {
	fn search<'a>(
		&'a self,
		filters: &'a SearchFilters,
		limit: usize,
	) -> BoxFuture<'a, Result<Vec<Candidate>>> {
		self.calls.fetch_add(1, Ordering::SeqCst);

		Box::pin(async move {
			let catalog = self.catalog.as_ref().ok_or_else(|| Error::Retrieval {
				message: "filter store outage".to_string(),
			})?;

			Ok(catalog.iter().filter(|item| filters.matches_all(item)).take(limit).cloned().collect())
		})
	}
}

fn recipe(
	id: i64,
	title: &str,
	cuisine: &str,
	diets: &[&str],
	prep_time: u32,
	cook_time: u32,
	ingredients: &[&str],
) -> Candidate {
	Candidate {
		id,
		title: title.to_string(),
		description: None,
		cuisine_type: Some(cuisine.to_string()),
		difficulty: Some("easy".to_string()),
		diet_types: diets.iter().map(|diet| diet.to_string()).collect(),
		ingredients: ingredients.iter().map(|item| item.to_string()).collect(),
		prep_time: Some(prep_time),
		cook_time: Some(cook_time),
	}
}

/// Five recipes; only 1 and 4 are vegetarian, Italian and ready within 30 minutes.
fn catalog() -> Vec<Candidate> {
	vec![
		recipe(1, "Pasta Primavera", "italian", &["vegetarian"], 10, 15, &["pasta", "zucchini"]),
		recipe(2, "Spaghetti Carbonara", "italian", &[], 10, 15, &["pasta", "pancetta"]),
		recipe(3, "Chicken Tacos", "mexican", &[], 15, 15, &["chicken", "tortilla"]),
		recipe(4, "Pesto Gnocchi", "italian", &["vegetarian"], 10, 12, &["gnocchi", "pasta"]),
		recipe(5, "Beef Bourguignon", "french", &[], 30, 180, &["beef", "wine"]),
	]
}

/// Vector order: 2, 1, 3, 4, 5.
fn vector_hits() -> Vec<(Candidate, f32)> {
	let catalog = catalog();
	let distances = [(1, 0.10), (0, 0.12), (2, 0.30), (3, 0.35), (4, 0.60)];

	distances.iter().map(|(index, distance)| (catalog[*index].clone(), *distance)).collect()
}

const PASTA_INTENT: &str = r#"```json
{
  "semantic_query": "vegetarian italian pasta",
  "ingredients": ["pasta"],
  "cuisine_type": "Italian",
  "diet_types": ["vegetarian"],
  "max_prep_time": null,
  "max_cook_time": null,
  "max_total_time": 30,
  "difficulty": null
}
```"#;

fn fast_settings() -> PipelineSettings {
	PipelineSettings {
		retrieval_timeout: Duration::from_millis(200),
		embedding_timeout: Duration::from_millis(200),
		..Default::default()
	}
}

fn build(
	llm: Arc<ScriptedLlm>,
	embedding: StaticEmbedding,
	vectors: ListVectors,
	filters: Arc<CatalogFilters>,
	settings: PipelineSettings,
) -> LarderService {
	let collaborators = Collaborators {
		embedding: Arc::new(embedding),
		llm,
		vectors: Arc::new(vectors),
		filters,
	};

	LarderService::from_parts(
		settings,
		JudgeConfig::default(),
		Arc::new(RateLimiter::new(1_000.0, 100)),
		collaborators,
	)
}

fn ids(items: &[ScoredCandidate]) -> Vec<i64> {
	items.iter().map(ScoredCandidate::id).collect()
}

fn error_stages(metadata: &serde_json::Map<String, Value>) -> Vec<String> {
	metadata["errors"]
		.as_array()
		.expect("errors must be an array")
		.iter()
		.filter_map(|entry| entry["stage"].as_str().map(str::to_string))
		.collect()
}

#[tokio::test]
async fn understander_falls_back_when_the_provider_fails() {
	let llm = Arc::new(ScriptedLlm::failing());
	let service = build(
		llm.clone(),
		StaticEmbedding { fail: false },
		ListVectors { hits: Some(Vec::new()), delay: None },
		Arc::new(CatalogFilters::new(Vec::new())),
		fast_settings(),
	);
	let parsed = service.understander().parse("cheesy baked gnocchi").await;

	assert_eq!(parsed, ParsedQuery::fallback("cheesy baked gnocchi"));
	assert_eq!(parsed.semantic_query, "cheesy baked gnocchi");
	assert!(parsed.ingredients.is_empty());
	assert!(parsed.diet_types.is_empty());
	assert_eq!(parsed.cuisine_type, None);
	assert_eq!(llm.count(), 1);
}

#[tokio::test]
async fn understander_falls_back_on_timeout() {
	let mut slow = ScriptedLlm::new(Some(PASTA_INTENT), None);

	slow.delay = Some(Duration::from_millis(500));

	let settings = PipelineSettings {
		understanding: larder_service::LlmCallSettings {
			timeout: Duration::from_millis(20),
			..PipelineSettings::default().understanding
		},
		..fast_settings()
	};
	let service = build(
		Arc::new(slow),
		StaticEmbedding { fail: false },
		ListVectors { hits: Some(Vec::new()), delay: None },
		Arc::new(CatalogFilters::new(Vec::new())),
		settings,
	);
	let err = service
		.understander()
		.try_parse("pasta")
		.await
		.expect_err("Expected the call to time out.");

	assert!(matches!(err, Error::Timeout { .. }));
	assert_eq!(service.understander().parse("pasta").await, ParsedQuery::fallback("pasta"));
}

#[tokio::test]
async fn understander_extracts_intent() {
	let service = build(
		Arc::new(ScriptedLlm::new(Some(PASTA_INTENT), None)),
		StaticEmbedding { fail: false },
		ListVectors { hits: Some(Vec::new()), delay: None },
		Arc::new(CatalogFilters::new(Vec::new())),
		fast_settings(),
	);
	let parsed = service.understander().parse("quick vegetarian italian pasta").await;

	assert_eq!(parsed.original_query, "quick vegetarian italian pasta");
	assert_eq!(parsed.semantic_query, "vegetarian italian pasta");
	assert_eq!(parsed.cuisine_type.as_deref(), Some("italian"));
	assert_eq!(parsed.max_total_time, Some(30));
}

#[tokio::test]
async fn reranker_skips_the_model_for_empty_input() {
	let llm = Arc::new(ScriptedLlm::new(None, Some("[1]")));
	let service = build(
		llm.clone(),
		StaticEmbedding { fail: false },
		ListVectors { hits: Some(Vec::new()), delay: None },
		Arc::new(CatalogFilters::new(Vec::new())),
		fast_settings(),
	);

	assert!(service.reranker().rerank(Vec::new(), "pasta").await.is_empty());
	assert_eq!(llm.count(), 0);
}

#[tokio::test]
async fn reranker_applies_the_model_ordering() {
	let llm = Arc::new(ScriptedLlm::new(None, Some("[2, 1]")));
	let service = build(
		llm.clone(),
		StaticEmbedding { fail: false },
		ListVectors { hits: Some(Vec::new()), delay: None },
		Arc::new(CatalogFilters::new(Vec::new())),
		fast_settings(),
	);
	let input: Vec<ScoredCandidate> =
		catalog().into_iter().take(3).map(|item| ScoredCandidate::new(item, 0.5)).collect();
	let out = service.reranker().rerank(input, "pasta").await;

	assert_eq!(ids(&out), vec![2, 1, 3]);
	assert!((out[0].score - 0.65).abs() < 1e-6);
	assert!((out[1].score - 0.575).abs() < 1e-6);
	assert_eq!(out[2].score, 0.5);
	assert_eq!(llm.count(), 1);
}

#[tokio::test]
async fn reranker_keeps_order_on_unusable_reply() {
	let service = build(
		Arc::new(ScriptedLlm::new(None, Some("They all look delicious."))),
		StaticEmbedding { fail: false },
		ListVectors { hits: Some(Vec::new()), delay: None },
		Arc::new(CatalogFilters::new(Vec::new())),
		fast_settings(),
	);
	let input: Vec<ScoredCandidate> =
		catalog().into_iter().map(|item| ScoredCandidate::new(item, 0.4)).collect();
	let out = service.reranker().rerank(input.clone(), "pasta").await;

	assert_eq!(out, input);
}

#[tokio::test]
async fn reranker_ignores_numbers_in_a_refusal() {
	let service = build(
		Arc::new(ScriptedLlm::new(None, Some("Sorry, none of these 3 recipes match the query."))),
		StaticEmbedding { fail: false },
		ListVectors { hits: Some(Vec::new()), delay: None },
		Arc::new(CatalogFilters::new(Vec::new())),
		fast_settings(),
	);
	let input: Vec<ScoredCandidate> =
		catalog().into_iter().map(|item| ScoredCandidate::new(item, 0.4)).collect();

	assert!(service.reranker().try_rerank(&input, "pasta").await.is_err());
	assert_eq!(service.reranker().rerank(input.clone(), "pasta").await, input);
}

#[tokio::test]
async fn vegetarian_italian_query_returns_exactly_the_matching_recipes() {
	let llm = Arc::new(ScriptedLlm::new(Some(PASTA_INTENT), Some("[1]")));
	let service = build(
		llm.clone(),
		StaticEmbedding { fail: false },
		ListVectors { hits: Some(vector_hits()), delay: None },
		Arc::new(CatalogFilters::new(catalog())),
		fast_settings(),
	);
	let judge = JudgeConfig {
		filter_compliance_min: 0.5,
		dietary_strict_mode: true,
		min_results: 0,
		..Default::default()
	};
	let output = service
		.run_pipeline("quick vegetarian italian pasta under 30 minutes", Some(judge))
		.await
		.expect("Pipeline failed.");

	assert_eq!(ids(&output.results), vec![1, 4]);
	assert!(output.results[0].score >= output.results[1].score);
	assert_eq!(output.judge_report.original_count, 5);
	assert_eq!(output.judge_report.filtered_count, 2);
	assert_eq!(output.judge_report.removed_count, 3);
	assert_eq!(output.judge_report.fallback_applied, None);
	assert_eq!(output.judge_report.metrics.dietary.failed, 3);

	// Two survivors never trigger the reranking pass.
	assert_eq!(llm.count(), 1);

	let metadata = &output.metadata;
	let stages: Vec<&str> = metadata["stages"]
		.as_array()
		.expect("stages must be an array")
		.iter()
		.filter_map(Value::as_str)
		.collect();

	assert_eq!(
		stages,
		vec![
			"parse_query",
			"retrieve",
			"generate_embedding",
			"vector_search",
			"extract_filters",
			"filter_search",
			"merge_results",
			"judge_relevance",
			"format_response",
		]
	);
	assert_eq!(metadata["route"], "both");
	assert_eq!(metadata["semantic_count"], 5);
	assert_eq!(metadata["filter_count"], 2);
	assert_eq!(metadata["merged_count"], 5);
	assert_eq!(metadata["filtered_count"], 2);
	assert_eq!(metadata["reranked"], false);
	assert_eq!(metadata["filters"]["cuisine_type"], "italian");
	assert_eq!(metadata["judge_policy_hash"].as_str().map(str::len), Some(64));
	assert!(metadata["errors"].as_array().is_some_and(Vec::is_empty));
	assert!(metadata.get("error").is_none());
}

#[tokio::test]
async fn filter_matches_far_from_the_query_fail_the_semantic_gate() {
	let catalog = catalog();
	// Recipe 4 satisfies every filter but sits far from the query embedding.
	let distances = [(0, 0.10), (1, 0.12), (2, 0.30), (3, 0.90), (4, 0.60)];
	let hits = distances.iter().map(|(index, distance)| (catalog[*index].clone(), *distance)).collect();
	let service = build(
		Arc::new(ScriptedLlm::new(Some(PASTA_INTENT), None)),
		StaticEmbedding { fail: false },
		ListVectors { hits: Some(hits), delay: None },
		Arc::new(CatalogFilters::new(catalog)),
		fast_settings(),
	);
	let judge = JudgeConfig {
		semantic_threshold: 0.5,
		filter_compliance_min: 1.0,
		min_results: 0,
		..Default::default()
	};
	let output = service
		.run_pipeline("quick vegetarian italian pasta", Some(judge))
		.await
		.expect("Pipeline failed.");

	assert_eq!(output.metadata["filter_count"], 2);
	assert_eq!(ids(&output.results), vec![1]);
	assert_eq!(output.judge_report.metrics.semantic.failed, 2);
}

#[tokio::test]
async fn embedding_failure_degrades_to_filter_results() {
	let service = build(
		Arc::new(ScriptedLlm::new(Some(PASTA_INTENT), None)),
		StaticEmbedding { fail: true },
		ListVectors { hits: Some(vector_hits()), delay: None },
		Arc::new(CatalogFilters::new(catalog())),
		fast_settings(),
	);
	let judge = JudgeConfig { min_results: 0, ..Default::default() };
	let output =
		service.run_pipeline("quick vegetarian italian pasta", Some(judge)).await.expect("Pipeline failed.");

	assert_eq!(ids(&output.results), vec![1, 4]);
	assert_eq!(error_stages(&output.metadata), vec!["generate_embedding".to_string()]);
	assert_eq!(output.metadata["semantic_count"], 0);
	assert!(output.metadata["error"].as_str().is_some_and(|msg| msg.contains("embedding")));
}

#[tokio::test]
async fn slow_vector_search_times_out_without_aborting_the_run() {
	let service = build(
		Arc::new(ScriptedLlm::new(Some(PASTA_INTENT), None)),
		StaticEmbedding { fail: false },
		ListVectors { hits: Some(vector_hits()), delay: Some(Duration::from_secs(2)) },
		Arc::new(CatalogFilters::new(catalog())),
		fast_settings(),
	);
	let judge = JudgeConfig { min_results: 0, ..Default::default() };
	let output = service.run_pipeline("vegetarian pasta", Some(judge)).await.expect("Pipeline failed.");

	assert_eq!(ids(&output.results), vec![1, 4]);
	assert_eq!(error_stages(&output.metadata), vec!["vector_search".to_string()]);
	assert!(
		output.metadata["error"].as_str().is_some_and(|msg| msg.contains("timed out")),
		"Unexpected error: {:?}",
		output.metadata["error"]
	);
}

#[tokio::test]
async fn total_outage_still_returns_a_report() {
	let filters = Arc::new(CatalogFilters::new(catalog()));
	let service = build(
		Arc::new(ScriptedLlm::failing()),
		StaticEmbedding { fail: true },
		ListVectors { hits: None, delay: None },
		filters.clone(),
		fast_settings(),
	);
	let output = service.run_pipeline("anything good", None).await.expect("Pipeline failed.");

	assert!(output.results.is_empty());
	assert_eq!(output.judge_report.message.as_deref(), Some(NO_CANDIDATES_MESSAGE));
	assert_eq!(
		error_stages(&output.metadata),
		vec!["parse_query".to_string(), "generate_embedding".to_string()]
	);
	// The fallback parse carries no filters, so only the semantic branch is routed.
	assert_eq!(output.metadata["route"], "semantic_only");
	assert_eq!(filters.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn relax_thresholds_backfills_from_fused_order() {
	let service = build(
		Arc::new(ScriptedLlm::new(Some(PASTA_INTENT), None)),
		StaticEmbedding { fail: false },
		ListVectors { hits: Some(vector_hits()), delay: None },
		Arc::new(CatalogFilters::new(catalog())),
		fast_settings(),
	);
	let judge = JudgeConfig {
		min_results: 4,
		fallback_strategy: FallbackStrategy::RelaxThresholds,
		..Default::default()
	};
	let output = service.run_pipeline("vegetarian pasta", Some(judge)).await.expect("Pipeline failed.");

	assert_eq!(output.results.len(), 4);
	assert_eq!(ids(&output.results[..2]), vec![1, 4]);
	assert_eq!(output.judge_report.fallback_applied, Some(FallbackStrategy::RelaxThresholds));
}

#[tokio::test]
async fn heavy_filtering_triggers_the_reranker() {
	let intent = r#"{"semantic_query": "pasta", "cuisine_type": "italian"}"#;
	let llm = Arc::new(ScriptedLlm::new(Some(intent), Some("[4, 3, 2, 1]")));
	let mut hits = Vec::new();

	for id in 1..=4 {
		hits.push((recipe(id, "Trattoria pasta", "italian", &[], 10, 10, &["pasta"]), 0.1 * id as f32));
	}
	for id in 5..=12 {
		hits.push((recipe(id, "Bistro plate", "french", &[], 10, 10, &["butter"]), 0.5));
	}

	let catalog: Vec<Candidate> = hits.iter().map(|(candidate, _)| candidate.clone()).collect();
	let service = build(
		llm.clone(),
		StaticEmbedding { fail: false },
		ListVectors { hits: Some(hits), delay: None },
		Arc::new(CatalogFilters::new(catalog)),
		fast_settings(),
	);
	let judge = JudgeConfig {
		semantic_threshold: 0.0,
		filter_compliance_min: 1.0,
		confidence_threshold: 0.0,
		min_results: 0,
		..Default::default()
	};
	let output = service.run_pipeline("italian pasta", Some(judge)).await.expect("Pipeline failed.");

	assert_eq!(output.judge_report.filtered_count, 4);
	assert_eq!(output.judge_report.removed_count, 8);
	assert_eq!(ids(&output.results), vec![4, 3, 2, 1]);
	assert_eq!(output.metadata["reranked"], true);
	assert_eq!(llm.count(), 2);
}

#[tokio::test]
async fn rerank_failure_keeps_judged_order() {
	let intent = r#"{"semantic_query": "pasta", "cuisine_type": "italian"}"#;
	let mut hits = Vec::new();

	for id in 1..=4 {
		hits.push((recipe(id, "Trattoria pasta", "italian", &[], 10, 10, &["pasta"]), 0.1 * id as f32));
	}
	for id in 5..=12 {
		hits.push((recipe(id, "Bistro plate", "french", &[], 10, 10, &["butter"]), 0.5));
	}

	let catalog: Vec<Candidate> = hits.iter().map(|(candidate, _)| candidate.clone()).collect();
	let service = build(
		Arc::new(ScriptedLlm::new(Some(intent), None)),
		StaticEmbedding { fail: false },
		ListVectors { hits: Some(hits), delay: None },
		Arc::new(CatalogFilters::new(catalog)),
		fast_settings(),
	);
	let judge = JudgeConfig {
		semantic_threshold: 0.0,
		filter_compliance_min: 1.0,
		confidence_threshold: 0.0,
		min_results: 0,
		..Default::default()
	};
	let output = service.run_pipeline("italian pasta", Some(judge)).await.expect("Pipeline failed.");

	assert_eq!(ids(&output.results), vec![1, 2, 3, 4]);
	assert_eq!(output.metadata["reranked"], false);
	assert_eq!(error_stages(&output.metadata), vec!["rerank".to_string()]);
}

#[tokio::test]
async fn invalid_requests_propagate() {
	let service = build(
		Arc::new(ScriptedLlm::new(Some(PASTA_INTENT), None)),
		StaticEmbedding { fail: false },
		ListVectors { hits: Some(vector_hits()), delay: None },
		Arc::new(CatalogFilters::new(catalog())),
		fast_settings(),
	);
	let bad_judge = JudgeConfig { max_results: 0, ..Default::default() };

	assert!(matches!(
		service.run_pipeline("pasta", Some(bad_judge)).await,
		Err(Error::InvalidRequest { .. })
	));
	assert!(matches!(service.run_pipeline("   ", None).await, Err(Error::InvalidRequest { .. })));
}

struct CountingScorer {
	calls: Arc<AtomicUsize>,
}
impl IngredientScorer for CountingScorer {
	fn score(&self, _: &[String], _: &Candidate) -> f32 {
		self.calls.fetch_add(1, Ordering::SeqCst);

		0.0
	}
}

#[tokio::test]
async fn custom_ingredient_scorer_is_used_for_judging() {
	let calls = Arc::new(AtomicUsize::new(0));
	let service = build(
		Arc::new(ScriptedLlm::new(Some(PASTA_INTENT), None)),
		StaticEmbedding { fail: false },
		ListVectors { hits: Some(vector_hits()), delay: None },
		Arc::new(CatalogFilters::new(catalog())),
		fast_settings(),
	)
	.with_judge_engine(JudgeEngine::new(Box::new(CountingScorer { calls: calls.clone() })));
	let output = service.run_pipeline("pasta", None).await.expect("Pipeline failed.");

	assert_eq!(calls.load(Ordering::SeqCst), output.judge_report.original_count);
	assert!(output.judge_report.original_count > 0);
}
