use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	pub service: Service,
	pub providers: Providers,
	#[serde(default)]
	pub rate_limit: RateLimit,
	#[serde(default)]
	pub pipeline: Pipeline,
	#[serde(default)]
	pub judge: Judge,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Service {
	pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Providers {
	pub embedding: EmbeddingProviderConfig,
	pub llm: LlmProviderConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub dimensions: u32,
	pub timeout_ms: u64,
	/// Forward the embedding task label in the request body. Only some providers accept it.
	#[serde(default)]
	pub send_task_type: bool,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub temperature: f32,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimit {
	pub requests_per_second: f64,
	pub burst: u32,
}
impl Default for RateLimit {
	fn default() -> Self {
		Self { requests_per_second: 2.0, burst: 4 }
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Pipeline {
	pub candidate_limit: u32,
	pub rrf_k: u32,
	pub distance_metric: String,
	pub retrieval_timeout_ms: u64,
	pub rerank_enabled: bool,
	pub rerank_min_results: usize,
	pub rerank_min_removed: usize,
	pub rerank_max_candidates: usize,
	pub understanding_max_tokens: u32,
	pub rerank_max_tokens: u32,
}
impl Default for Pipeline {
	fn default() -> Self {
		Self {
			candidate_limit: 50,
			rrf_k: 60,
			distance_metric: "cosine".to_string(),
			retrieval_timeout_ms: 5_000,
			rerank_enabled: true,
			rerank_min_results: 3,
			rerank_min_removed: 5,
			rerank_max_candidates: 20,
			understanding_max_tokens: 500,
			rerank_max_tokens: 200,
		}
	}
}

/// Defaults for the per-request judge policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Judge {
	pub semantic_threshold: f32,
	pub filter_compliance_min: f32,
	pub ingredient_match_min: f32,
	pub confidence_threshold: f32,
	pub dietary_strict_mode: bool,
	pub min_results: usize,
	pub max_results: usize,
	pub fallback_strategy: String,
}
impl Default for Judge {
	fn default() -> Self {
		Self {
			semantic_threshold: 0.3,
			filter_compliance_min: 0.5,
			ingredient_match_min: 0.3,
			confidence_threshold: 0.5,
			dietary_strict_mode: true,
			min_results: 3,
			max_results: 20,
			fallback_strategy: "relax_thresholds".to_string(),
		}
	}
}
