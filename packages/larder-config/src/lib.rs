mod error;
mod types;

pub use error::{Error, Result};
pub use types::{
	Config, EmbeddingProviderConfig, Judge, LlmProviderConfig, Pipeline, Providers, RateLimit,
	Service,
};

use std::{fs, path::Path};

pub const DISTANCE_METRICS: [&str; 3] = ["cosine", "l2", "inner_product"];
pub const FALLBACK_STRATEGIES: [&str; 3] =
	["relax_thresholds", "empty_results", "suggest_alternatives"];

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;
	let mut cfg: Config = toml::from_str(&raw)
		.map_err(|err| Error::ParseConfig { path: path.to_path_buf(), source: err })?;

	normalize(&mut cfg);

	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	if cfg.providers.embedding.dimensions == 0 {
		return Err(Error::Validation {
			message: "providers.embedding.dimensions must be greater than zero.".to_string(),
		});
	}

	for (label, key) in
		[("embedding", &cfg.providers.embedding.api_key), ("llm", &cfg.providers.llm.api_key)]
	{
		if key.trim().is_empty() {
			return Err(Error::Validation {
				message: format!("Provider {label} api_key must be non-empty."),
			});
		}
	}
	for (label, timeout_ms) in [
		("providers.embedding.timeout_ms", cfg.providers.embedding.timeout_ms),
		("providers.llm.timeout_ms", cfg.providers.llm.timeout_ms),
		("pipeline.retrieval_timeout_ms", cfg.pipeline.retrieval_timeout_ms),
	] {
		if timeout_ms == 0 {
			return Err(Error::Validation {
				message: format!("{label} must be greater than zero."),
			});
		}
	}

	if !cfg.providers.llm.temperature.is_finite() || cfg.providers.llm.temperature < 0.0 {
		return Err(Error::Validation {
			message: "providers.llm.temperature must be a finite number, zero or greater."
				.to_string(),
		});
	}
	if !cfg.rate_limit.requests_per_second.is_finite()
		|| cfg.rate_limit.requests_per_second <= 0.0
	{
		return Err(Error::Validation {
			message: "rate_limit.requests_per_second must be a finite number greater than zero."
				.to_string(),
		});
	}
	if cfg.rate_limit.burst == 0 {
		return Err(Error::Validation {
			message: "rate_limit.burst must be greater than zero.".to_string(),
		});
	}
	if cfg.pipeline.candidate_limit == 0 {
		return Err(Error::Validation {
			message: "pipeline.candidate_limit must be greater than zero.".to_string(),
		});
	}
	if cfg.pipeline.rerank_max_candidates == 0 {
		return Err(Error::Validation {
			message: "pipeline.rerank_max_candidates must be greater than zero.".to_string(),
		});
	}
	if !DISTANCE_METRICS.contains(&cfg.pipeline.distance_metric.as_str()) {
		return Err(Error::Validation {
			message: "pipeline.distance_metric must be one of cosine, l2, or inner_product."
				.to_string(),
		});
	}

	validate_judge(&cfg.judge)
}

pub fn validate_judge(judge: &Judge) -> Result<()> {
	for (label, value) in [
		("judge.semantic_threshold", judge.semantic_threshold),
		("judge.filter_compliance_min", judge.filter_compliance_min),
		("judge.ingredient_match_min", judge.ingredient_match_min),
		("judge.confidence_threshold", judge.confidence_threshold),
	] {
		if !value.is_finite() {
			return Err(Error::Validation { message: format!("{label} must be a finite number.") });
		}
		if !(0.0..=1.0).contains(&value) {
			return Err(Error::Validation {
				message: format!("{label} must be in the range 0.0-1.0."),
			});
		}
	}

	if judge.max_results == 0 {
		return Err(Error::Validation {
			message: "judge.max_results must be greater than zero.".to_string(),
		});
	}
	if !FALLBACK_STRATEGIES.contains(&judge.fallback_strategy.as_str()) {
		return Err(Error::Validation {
			message: "judge.fallback_strategy must be one of relax_thresholds, empty_results, or suggest_alternatives."
				.to_string(),
		});
	}

	Ok(())
}

fn normalize(cfg: &mut Config) {
	cfg.pipeline.distance_metric = cfg.pipeline.distance_metric.trim().to_ascii_lowercase();
	cfg.judge.fallback_strategy = cfg.judge.fallback_strategy.trim().to_ascii_lowercase();

	if cfg.service.log_level.trim().is_empty() {
		cfg.service.log_level = "info".to_string();
	}
}
