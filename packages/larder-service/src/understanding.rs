//! Free-text query understanding.

use std::sync::Arc;

use serde::Deserialize;

use crate::{Error, LanguageModel, LlmCallSettings, RateLimiter, Result};
use larder_domain::ParsedQuery;

#[derive(Deserialize)]
struct RawIntent {
	semantic_query: Option<String>,
	ingredients: Option<Vec<String>>,
	cuisine_type: Option<String>,
	diet_types: Option<Vec<String>>,
	max_prep_time: Option<u32>,
	max_cook_time: Option<u32>,
	max_total_time: Option<u32>,
	difficulty: Option<String>,
}

pub struct QueryUnderstander {
	llm: Arc<dyn LanguageModel>,
	limiter: Arc<RateLimiter>,
	call: LlmCallSettings,
}
impl QueryUnderstander {
	pub fn new(llm: Arc<dyn LanguageModel>, limiter: Arc<RateLimiter>, call: LlmCallSettings) -> Self {
		Self { llm, limiter, call }
	}

	/// Extracts structured intent. Any failure yields the unfiltered parse of `query`.
	pub async fn parse(&self, query: &str) -> ParsedQuery {
		match self.try_parse(query).await {
			Ok(parsed) => parsed,
			Err(err) => {
				tracing::warn!(error = %err, "Query understanding failed; using the raw query.");

				ParsedQuery::fallback(query)
			},
		}
	}

	pub async fn try_parse(&self, query: &str) -> Result<ParsedQuery> {
		let prompt = build_prompt(query);

		self.limiter.acquire().await;

		let raw = crate::with_timeout(
			"query understanding",
			self.call.timeout,
			self.llm.generate(&prompt, self.call.max_tokens, self.call.temperature),
		)
		.await?;

		parse_intent(query, &raw)
	}
}

pub fn build_prompt(query: &str) -> String {
	format!(
		"Extract recipe search intent from the user query below.\n\
		 Respond with ONLY a JSON object with exactly these fields and nothing else:\n\
		 {{\"semantic_query\": string, \"ingredients\": [string], \"cuisine_type\": string or null, \
		 \"diet_types\": [string], \"max_prep_time\": integer or null, \"max_cook_time\": integer or null, \
		 \"max_total_time\": integer or null, \"difficulty\": \"easy\", \"medium\", \"hard\" or null}}\n\n\
		 Time rules:\n\
		 - \"under X minutes\" or \"in X minutes\" sets max_total_time to X.\n\
		 - \"quick\" or \"fast\" without a number sets max_total_time to 30.\n\
		 - Set max_prep_time or max_cook_time only when the query names prep or cook time explicitly.\n\
		 - All times are in minutes.\n\n\
		 semantic_query describes the dish itself without the constraints. Use lowercase values.\n\n\
		 Query: {query}"
	)
}

/// Parses the model reply into a [`ParsedQuery`]. The reply must be a bare JSON object, optionally
/// wrapped in a markdown code fence.
pub fn parse_intent(query: &str, raw: &str) -> Result<ParsedQuery> {
	let body = strip_code_fences(raw);
	let intent: RawIntent = serde_json::from_str(body).map_err(|err| Error::Provider {
		message: format!("Query understanding returned invalid JSON: {err}"),
	})?;
	let semantic_query = intent
		.semantic_query
		.map(|value| value.trim().to_string())
		.filter(|value| !value.is_empty())
		.unwrap_or_else(|| query.to_string());

	Ok(ParsedQuery {
		original_query: query.to_string(),
		semantic_query,
		ingredients: normalize_list(intent.ingredients),
		cuisine_type: normalize_label(intent.cuisine_type),
		diet_types: normalize_list(intent.diet_types),
		max_prep_time: intent.max_prep_time.filter(|minutes| *minutes > 0),
		max_cook_time: intent.max_cook_time.filter(|minutes| *minutes > 0),
		max_total_time: intent.max_total_time.filter(|minutes| *minutes > 0),
		difficulty: normalize_label(intent.difficulty),
	})
}

pub(crate) fn strip_code_fences(raw: &str) -> &str {
	let trimmed = raw.trim();
	let Some(rest) = trimmed.strip_prefix("```") else {
		return trimmed;
	};
	// Drop the info string (`json`) on the opening fence line.
	let rest = match rest.find('\n') {
		Some(newline) => &rest[newline + 1..],
		None => {
			let info_len =
				rest.find(|c: char| !c.is_ascii_alphanumeric()).unwrap_or(rest.len());

			&rest[info_len..]
		},
	};

	rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn normalize_label(value: Option<String>) -> Option<String> {
	value.map(|value| value.trim().to_lowercase()).filter(|value| !value.is_empty())
}

fn normalize_list(values: Option<Vec<String>>) -> Vec<String> {
	let mut out: Vec<String> = Vec::new();

	for value in values.unwrap_or_default() {
		let value = value.trim().to_lowercase();

		if !value.is_empty() && !out.contains(&value) {
			out.push(value);
		}
	}

	out
}
