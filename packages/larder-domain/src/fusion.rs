//! Reciprocal rank fusion of the semantic and attribute-filter candidate lists.
//!
//! Each appearance contributes `1 / (k + rank + 1)` with a zero-based rank. The accumulated value
//! is normalized by the two-list maximum `2 / (k + 1)` and blended with the best raw score seen
//! for the candidate:
//!
//! ```text
//! score = 0.7 * best_raw_score + 0.3 * normalized_rrf
//! ```
//!
//! Equal blended scores are ordered by the best rank the candidate reached in either list, then
//! by ascending candidate id. Neither key depends on which list was passed first.
//!
//! A candidate found in both lists keeps the payload of its best raw score. On equal raw scores
//! the payload carrying a vector similarity wins, and the highest similarity seen is kept.

use std::{
	cmp::Ordering,
	collections::{HashMap, HashSet},
};

use crate::recipe::ScoredCandidate;

pub const DEFAULT_RRF_K: u32 = 60;

const RAW_SCORE_WEIGHT: f32 = 0.7;
const RRF_WEIGHT: f32 = 0.3;

#[derive(Debug)]
struct FusedCandidate {
	item: ScoredCandidate,
	best_raw_score: f32,
	best_rank: usize,
	similarity: Option<f32>,
	rrf: f64,
}

pub fn merge(
	list_a: &[ScoredCandidate],
	list_b: &[ScoredCandidate],
	k: u32,
) -> Vec<ScoredCandidate> {
	if list_a.is_empty() {
		return list_b.to_vec();
	}
	if list_b.is_empty() {
		return list_a.to_vec();
	}

	let mut by_id: HashMap<i64, FusedCandidate> = HashMap::new();

	for list in [list_a, list_b] {
		let mut seen_for_list = HashSet::new();

		for (rank, item) in list.iter().enumerate() {
			if !seen_for_list.insert(item.id()) {
				continue;
			}

			let contribution = rrf_contribution(k, rank);

			match by_id.get_mut(&item.id()) {
				Some(existing) => {
					existing.rrf += contribution;
					existing.best_rank = existing.best_rank.min(rank);
					existing.similarity = max_similarity(existing.similarity, item.similarity);

					if prefers_payload(item, &existing.item) {
						existing.best_raw_score = item.score;
						existing.item = item.clone();
					}
				},
				None => {
					by_id.insert(
						item.id(),
						FusedCandidate {
							item: item.clone(),
							best_raw_score: item.score,
							best_rank: rank,
							similarity: item.similarity,
							rrf: contribution,
						},
					);
				},
			}
		}
	}

	let max_rrf = 2.0 * rrf_contribution(k, 0);
	let mut fused: Vec<FusedCandidate> = by_id.into_values().collect();

	for candidate in &mut fused {
		let normalized = (candidate.rrf / max_rrf) as f32;

		candidate.item.score =
			RAW_SCORE_WEIGHT * candidate.best_raw_score + RRF_WEIGHT * normalized;
		candidate.item.similarity = candidate.similarity;
	}

	fused.sort_by(|left, right| {
		cmp_f32_desc(left.item.score, right.item.score)
			.then_with(|| left.best_rank.cmp(&right.best_rank))
			.then_with(|| left.item.id().cmp(&right.item.id()))
	});

	fused.into_iter().map(|candidate| candidate.item).collect()
}

fn rrf_contribution(k: u32, rank: usize) -> f64 {
	1.0 / (f64::from(k) + rank as f64 + 1.0)
}

fn prefers_payload(incoming: &ScoredCandidate, current: &ScoredCandidate) -> bool {
	match incoming.score.total_cmp(&current.score) {
		Ordering::Greater => true,
		Ordering::Less => false,
		Ordering::Equal => incoming.similarity.is_some() && current.similarity.is_none(),
	}
}

fn max_similarity(left: Option<f32>, right: Option<f32>) -> Option<f32> {
	match (left, right) {
		(Some(left), Some(right)) => Some(left.max(right)),
		(left, right) => left.or(right),
	}
}

fn cmp_f32_desc(left: f32, right: f32) -> Ordering {
	right.total_cmp(&left)
}
