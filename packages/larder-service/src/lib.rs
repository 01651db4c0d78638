pub mod pipeline;
pub mod rate_limit;
pub mod rerank;
pub mod understanding;

mod error;

pub use error::{Error, Result};
pub use pipeline::{BranchStep, PipelineOutput, PipelineSettings, Route, Stage, StageFailure};
pub use rate_limit::RateLimiter;
pub use rerank::Reranker;
pub use understanding::QueryUnderstander;

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use larder_config::{Config, EmbeddingProviderConfig, LlmProviderConfig};
use larder_domain::{
	Candidate, DistanceMetric, EmbeddingTask, JudgeConfig, JudgeEngine, SearchFilters,
};
use larder_providers::{embedding, llm};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait EmbeddingProvider
where
	Self: Send + Sync,
{
	fn embed<'a>(&'a self, text: &'a str, task: EmbeddingTask) -> BoxFuture<'a, Result<Vec<f32>>>;
}

pub trait LanguageModel
where
	Self: Send + Sync,
{
	fn generate<'a>(
		&'a self,
		prompt: &'a str,
		max_tokens: u32,
		temperature: f32,
	) -> BoxFuture<'a, Result<String>>;
}

/// Nearest-neighbour lookup. Returns candidates with their raw distance under `metric`, closest
/// first.
pub trait VectorRetriever
where
	Self: Send + Sync,
{
	fn search<'a>(
		&'a self,
		vector: &'a [f32],
		limit: usize,
		metric: DistanceMetric,
	) -> BoxFuture<'a, Result<Vec<(Candidate, f32)>>>;
}

/// Exact and range matching over recipe attributes.
pub trait FilterRetriever
where
	Self: Send + Sync,
{
	fn search<'a>(
		&'a self,
		filters: &'a SearchFilters,
		limit: usize,
	) -> BoxFuture<'a, Result<Vec<Candidate>>>;
}

#[derive(Clone)]
pub struct Collaborators {
	pub embedding: Arc<dyn EmbeddingProvider>,
	pub llm: Arc<dyn LanguageModel>,
	pub vectors: Arc<dyn VectorRetriever>,
	pub filters: Arc<dyn FilterRetriever>,
}
impl Collaborators {
	/// Wires the HTTP-backed embedding and language-model clients around the given retrievers.
	pub fn with_http_providers(
		cfg: &Config,
		vectors: Arc<dyn VectorRetriever>,
		filters: Arc<dyn FilterRetriever>,
	) -> Self {
		Self {
			embedding: Arc::new(HttpEmbeddingProvider::new(cfg.providers.embedding.clone())),
			llm: Arc::new(HttpLanguageModel::new(cfg.providers.llm.clone())),
			vectors,
			filters,
		}
	}
}

/// Token budget, sampling temperature and deadline for one language-model call site.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LlmCallSettings {
	pub max_tokens: u32,
	pub temperature: f32,
	pub timeout: Duration,
}

pub struct HttpEmbeddingProvider {
	cfg: EmbeddingProviderConfig,
}
impl HttpEmbeddingProvider {
	pub fn new(cfg: EmbeddingProviderConfig) -> Self {
		Self { cfg }
	}
}

impl EmbeddingProvider for HttpEmbeddingProvider {
	fn embed<'a>(&'a self, text: &'a str, task: EmbeddingTask) -> BoxFuture<'a, Result<Vec<f32>>> {
		Box::pin(async move {
			let texts = [text.to_string()];
			let mut vectors = embedding::embed(&self.cfg, &texts, task.as_str()).await?;

			vectors.pop().ok_or_else(|| Error::Provider {
				message: "Embedding provider returned no vectors.".to_string(),
			})
		})
	}
}

pub struct HttpLanguageModel {
	cfg: LlmProviderConfig,
}
impl HttpLanguageModel {
	pub fn new(cfg: LlmProviderConfig) -> Self {
		Self { cfg }
	}
}

impl LanguageModel for HttpLanguageModel {
	fn generate<'a>(
		&'a self,
		prompt: &'a str,
		max_tokens: u32,
		temperature: f32,
	) -> BoxFuture<'a, Result<String>> {
		Box::pin(async move {
			Ok(llm::generate(&self.cfg, prompt, max_tokens, temperature).await?)
		})
	}
}

pub struct LarderService {
	pub settings: PipelineSettings,
	pub default_judge: JudgeConfig,
	pub collaborators: Collaborators,
	understander: QueryUnderstander,
	reranker: Reranker,
	judge: JudgeEngine,
}
impl LarderService {
	pub fn new(cfg: &Config, collaborators: Collaborators) -> Result<Self> {
		let settings = PipelineSettings::from_config(cfg)?;
		let default_judge = JudgeConfig::from_config(&cfg.judge)?;
		let limiter = Arc::new(RateLimiter::from_config(&cfg.rate_limit));

		Ok(Self::from_parts(settings, default_judge, limiter, collaborators))
	}

	/// Builds a service from already-resolved settings. The limiter is shared by every
	/// language-model call the service makes.
	pub fn from_parts(
		settings: PipelineSettings,
		default_judge: JudgeConfig,
		limiter: Arc<RateLimiter>,
		collaborators: Collaborators,
	) -> Self {
		let understander = QueryUnderstander::new(
			collaborators.llm.clone(),
			limiter.clone(),
			settings.understanding,
		);
		let reranker = Reranker::new(
			collaborators.llm.clone(),
			limiter,
			settings.rerank,
			settings.rerank_max_candidates,
		);

		Self {
			settings,
			default_judge,
			collaborators,
			understander,
			reranker,
			judge: JudgeEngine::default(),
		}
	}

	pub fn with_judge_engine(mut self, judge: JudgeEngine) -> Self {
		self.judge = judge;

		self
	}

	pub fn understander(&self) -> &QueryUnderstander {
		&self.understander
	}

	pub fn reranker(&self) -> &Reranker {
		&self.reranker
	}
}

pub(crate) async fn with_timeout<T>(
	operation: &str,
	limit: Duration,
	fut: impl Future<Output = Result<T>>,
) -> Result<T> {
	match tokio::time::timeout(limit, fut).await {
		Ok(result) => result,
		Err(_) => Err(Error::Timeout {
			operation: operation.to_string(),
			timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
		}),
	}
}
