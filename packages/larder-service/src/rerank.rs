//! Language-model reranking of judged results.

use std::sync::Arc;

use crate::{Error, LanguageModel, LlmCallSettings, RateLimiter, Result, understanding};
use larder_domain::ScoredCandidate;

const MAX_BOOST: f32 = 0.3;
const DESCRIPTION_CHARS: usize = 160;

pub struct Reranker {
	llm: Arc<dyn LanguageModel>,
	limiter: Arc<RateLimiter>,
	call: LlmCallSettings,
	max_candidates: usize,
}
impl Reranker {
	pub fn new(
		llm: Arc<dyn LanguageModel>,
		limiter: Arc<RateLimiter>,
		call: LlmCallSettings,
		max_candidates: usize,
	) -> Self {
		Self { llm, limiter, call, max_candidates: max_candidates.max(1) }
	}

	/// Reorders `candidates` by model preference. Returns the input untouched on any failure.
	pub async fn rerank(&self, candidates: Vec<ScoredCandidate>, query: &str) -> Vec<ScoredCandidate> {
		match self.try_rerank(&candidates, query).await {
			Ok(reranked) => reranked,
			Err(err) => {
				tracing::warn!(error = %err, "Rerank failed; keeping judged order.");

				candidates
			},
		}
	}

	pub async fn try_rerank(
		&self,
		candidates: &[ScoredCandidate],
		query: &str,
	) -> Result<Vec<ScoredCandidate>> {
		if candidates.is_empty() {
			return Ok(Vec::new());
		}

		let window = candidates.len().min(self.max_candidates);
		let prompt = build_prompt(query, &candidates[..window]);

		self.limiter.acquire().await;

		let raw = crate::with_timeout(
			"rerank",
			self.call.timeout,
			self.llm.generate(&prompt, self.call.max_tokens, self.call.temperature),
		)
		.await?;
		let order = parse_ranking(&raw, window)?;

		tracing::debug!(window, ranked = order.len(), "Applied rerank ordering.");

		Ok(apply_ranking(candidates, &order))
	}
}

pub fn build_prompt(query: &str, candidates: &[ScoredCandidate]) -> String {
	let mut lines = Vec::with_capacity(candidates.len());

	for (index, item) in candidates.iter().enumerate() {
		lines.push(format!("{}. {}", index + 1, summarize(item)));
	}

	format!(
		"Rank these recipes by how well they match the search query.\n\
		 Query: {query}\n\n\
		 Recipes:\n{}\n\n\
		 Respond with ONLY a JSON array of recipe numbers, best match first. Example: [3, 1, 2]",
		lines.join("\n")
	)
}

fn summarize(item: &ScoredCandidate) -> String {
	let candidate = &item.candidate;
	let mut parts = vec![candidate.title.clone()];

	if let Some(cuisine) = candidate.cuisine_type.as_deref() {
		parts.push(format!("cuisine: {cuisine}"));
	}
	if let Some(difficulty) = candidate.difficulty.as_deref() {
		parts.push(format!("difficulty: {difficulty}"));
	}
	if !candidate.diet_types.is_empty() {
		parts.push(format!("diets: {}", candidate.diet_types.join(", ")));
	}
	if let Some(total) = candidate.total_time() {
		parts.push(format!("total time: {total} min"));
	}
	if let Some(description) = candidate.description.as_deref()
		&& !description.trim().is_empty()
	{
		parts.push(description.trim().chars().take(DESCRIPTION_CHARS).collect());
	}

	parts.join(" | ")
}

/// Parses a JSON array of 1-based indices into distinct 0-based positions below `window`.
///
/// Anything other than a JSON integer array, optionally fenced or wrapped in prose around the
/// brackets, is an error.
pub fn parse_ranking(raw: &str, window: usize) -> Result<Vec<usize>> {
	let body = understanding::strip_code_fences(raw);
	let slice = match (body.find('['), body.rfind(']')) {
		(Some(start), Some(end)) if start < end => &body[start..=end],
		_ => body,
	};
	let numbers: Vec<i64> = serde_json::from_str(slice).map_err(|err| Error::Provider {
		message: format!("Rerank reply is not a JSON array of recipe numbers: {err}."),
	})?;
	let mut order = Vec::with_capacity(numbers.len());

	for number in numbers {
		let Ok(position) = usize::try_from(number) else {
			continue;
		};

		if position == 0 || position > window {
			continue;
		}

		let index = position - 1;

		if !order.contains(&index) {
			order.push(index);
		}
	}

	if order.is_empty() {
		return Err(Error::Provider {
			message: "Rerank reply contained no usable recipe numbers.".to_string(),
		});
	}

	Ok(order)
}

/// Promotes the ranked positions with a boost that decays by rank, then appends the rest in their
/// original order.
pub fn apply_ranking(candidates: &[ScoredCandidate], order: &[usize]) -> Vec<ScoredCandidate> {
	let ranked = order.len() as f32;
	let mut used = vec![false; candidates.len()];
	let mut out = Vec::with_capacity(candidates.len());

	for (position, &index) in order.iter().enumerate() {
		let Some(item) = candidates.get(index) else {
			continue;
		};

		if used[index] {
			continue;
		}

		let boost = 1.0 + (ranked - position as f32) / ranked * MAX_BOOST;
		let mut item = item.clone();

		item.score *= boost;
		used[index] = true;

		out.push(item);
	}

	for (index, item) in candidates.iter().enumerate() {
		if !used[index] {
			out.push(item.clone());
		}
	}

	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use larder_domain::Candidate;

	fn item(id: i64, score: f32) -> ScoredCandidate {
		ScoredCandidate::new(Candidate { id, title: format!("Recipe {id}"), ..Default::default() }, score)
	}

	#[test]
	fn parses_clean_array() {
		assert_eq!(parse_ranking("[2, 1, 3]", 3).expect("parse failed"), vec![1, 0, 2]);
	}

	#[test]
	fn parses_array_inside_prose() {
		let raw = "Best first:\n```json\n[3, 1]\n```";

		assert_eq!(parse_ranking(raw, 3).expect("parse failed"), vec![2, 0]);
	}

	#[test]
	fn skips_out_of_range_and_duplicate_indices() {
		assert_eq!(parse_ranking("[0, 2, 9, 2, 1]", 3).expect("parse failed"), vec![1, 0]);
	}

	#[test]
	fn digits_in_prose_are_not_a_ranking() {
		assert!(parse_ranking("2 > 1 > 3", 3).is_err());
		assert!(parse_ranking("Sorry, none of these 3 recipes match the query.", 3).is_err());
		assert!(parse_ranking("[\"2\", \"1\"]", 3).is_err());
	}

	#[test]
	fn no_usable_indices_is_an_error() {
		assert!(parse_ranking("I cannot rank these.", 3).is_err());
		assert!(parse_ranking("[7, 8]", 3).is_err());
	}

	#[test]
	fn boost_decays_by_position_and_omitted_items_follow() {
		let candidates = vec![item(1, 0.5), item(2, 0.5), item(3, 0.5), item(4, 0.5)];
		let out = apply_ranking(&candidates, &[2, 0]);
		let ids: Vec<i64> = out.iter().map(ScoredCandidate::id).collect();

		assert_eq!(ids, vec![3, 1, 2, 4]);
		assert!((out[0].score - 0.5 * 1.3).abs() < 1e-6);
		assert!((out[1].score - 0.5 * 1.15).abs() < 1e-6);
		assert_eq!(out[2].score, 0.5);
		assert_eq!(out[3].score, 0.5);
	}

	#[test]
	fn summary_truncates_long_descriptions() {
		let mut candidate = item(1, 1.0);

		candidate.candidate.description = Some("x".repeat(400));

		let summary = summarize(&candidate);

		assert!(summary.len() < 200);
		assert!(summary.starts_with("Recipe 1"));
	}
}
