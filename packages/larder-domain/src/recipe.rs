use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Minimal recipe projection carried through retrieval, fusion and judging.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Candidate {
	pub id: i64,
	pub title: String,
	#[serde(default)]
	pub description: Option<String>,
	#[serde(default)]
	pub cuisine_type: Option<String>,
	#[serde(default)]
	pub difficulty: Option<String>,
	#[serde(default)]
	pub diet_types: Vec<String>,
	#[serde(default)]
	pub ingredients: Vec<String>,
	#[serde(default)]
	pub prep_time: Option<u32>,
	#[serde(default)]
	pub cook_time: Option<u32>,
}
impl Candidate {
	pub fn total_time(&self) -> Option<u32> {
		match (self.prep_time, self.cook_time) {
			(Some(prep), Some(cook)) => Some(prep.saturating_add(cook)),
			_ => None,
		}
	}
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ScoredCandidate {
	pub candidate: Candidate,
	pub score: f32,
	/// Vector similarity in `[0, 1]`, present only for candidates returned by semantic search.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub similarity: Option<f32>,
}
impl ScoredCandidate {
	pub fn new(candidate: Candidate, score: f32) -> Self {
		Self { candidate, score, similarity: None }
	}

	/// A semantic search hit, scored by its similarity.
	pub fn from_similarity(candidate: Candidate, similarity: f32) -> Self {
		Self { candidate, score: similarity, similarity: Some(similarity) }
	}

	pub fn id(&self) -> i64 {
		self.candidate.id
	}
}

/// Structured intent extracted from a free-text query.
///
/// `semantic_query` is never empty; it falls back to `original_query`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ParsedQuery {
	pub original_query: String,
	pub semantic_query: String,
	pub ingredients: Vec<String>,
	pub cuisine_type: Option<String>,
	pub diet_types: Vec<String>,
	pub max_prep_time: Option<u32>,
	pub max_cook_time: Option<u32>,
	pub max_total_time: Option<u32>,
	pub difficulty: Option<String>,
}
impl ParsedQuery {
	/// The no-filter parse used whenever extraction fails.
	pub fn fallback(query: &str) -> Self {
		Self {
			original_query: query.to_string(),
			semantic_query: query.to_string(),
			ingredients: Vec::new(),
			cuisine_type: None,
			diet_types: Vec::new(),
			max_prep_time: None,
			max_cook_time: None,
			max_total_time: None,
			difficulty: None,
		}
	}

	pub fn has_semantic_query(&self) -> bool {
		!self.semantic_query.trim().is_empty()
	}
}

/// Typed form of the active attribute filters.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SearchFilters {
	pub cuisine_type: Option<String>,
	pub difficulty: Option<String>,
	pub diet_types: Vec<String>,
	pub max_prep_time: Option<u32>,
	pub max_cook_time: Option<u32>,
	pub max_total_time: Option<u32>,
}
impl SearchFilters {
	pub fn from_parsed(parsed: &ParsedQuery) -> Self {
		Self {
			cuisine_type: parsed.cuisine_type.clone(),
			difficulty: parsed.difficulty.clone(),
			diet_types: parsed.diet_types.clone(),
			max_prep_time: parsed.max_prep_time,
			max_cook_time: parsed.max_cook_time,
			max_total_time: parsed.max_total_time,
		}
	}

	pub fn active_count(&self) -> usize {
		[
			self.cuisine_type.is_some(),
			self.difficulty.is_some(),
			!self.diet_types.is_empty(),
			self.max_prep_time.is_some(),
			self.max_cook_time.is_some(),
			self.max_total_time.is_some(),
		]
		.into_iter()
		.filter(|active| *active)
		.count()
	}

	pub fn is_empty(&self) -> bool {
		self.active_count() == 0
	}

	pub fn matches_cuisine(&self, candidate: &Candidate) -> Option<bool> {
		let wanted = self.cuisine_type.as_deref()?;

		Some(candidate.cuisine_type.as_deref().is_some_and(|value| same_label(value, wanted)))
	}

	pub fn matches_difficulty(&self, candidate: &Candidate) -> Option<bool> {
		let wanted = self.difficulty.as_deref()?;

		Some(candidate.difficulty.as_deref().is_some_and(|value| same_label(value, wanted)))
	}

	/// Every requested diet type must be present on the candidate.
	pub fn matches_diets(&self, candidate: &Candidate) -> Option<bool> {
		if self.diet_types.is_empty() {
			return None;
		}

		Some(self.diet_types.iter().all(|wanted| {
			candidate.diet_types.iter().any(|value| same_label(value, wanted))
		}))
	}

	pub fn matches_prep_time(&self, candidate: &Candidate) -> Option<bool> {
		let max = self.max_prep_time?;

		Some(candidate.prep_time.is_some_and(|value| value <= max))
	}

	pub fn matches_cook_time(&self, candidate: &Candidate) -> Option<bool> {
		let max = self.max_cook_time?;

		Some(candidate.cook_time.is_some_and(|value| value <= max))
	}

	pub fn matches_total_time(&self, candidate: &Candidate) -> Option<bool> {
		let max = self.max_total_time?;

		Some(candidate.total_time().is_some_and(|value| value <= max))
	}

	pub fn matches_all(&self, candidate: &Candidate) -> bool {
		[
			self.matches_cuisine(candidate),
			self.matches_difficulty(candidate),
			self.matches_diets(candidate),
			self.matches_prep_time(candidate),
			self.matches_cook_time(candidate),
			self.matches_total_time(candidate),
		]
		.into_iter()
		.flatten()
		.all(|matched| matched)
	}
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
	Cosine,
	L2,
	InnerProduct,
}
impl DistanceMetric {
	pub fn parse(value: &str) -> Result<Self> {
		match value.trim().to_ascii_lowercase().as_str() {
			"cosine" => Ok(Self::Cosine),
			"l2" => Ok(Self::L2),
			"inner_product" => Ok(Self::InnerProduct),
			other => Err(Error::InvalidConfig {
				message: format!(
					"distance metric must be one of: cosine, l2, inner_product. Got {other}."
				),
			}),
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Cosine => "cosine",
			Self::L2 => "l2",
			Self::InnerProduct => "inner_product",
		}
	}

	/// Maps a retriever distance onto a similarity in `[0, 1]`.
	pub fn similarity(self, distance: f32) -> f32 {
		if !distance.is_finite() {
			return 0.0;
		}

		let similarity = match self {
			Self::Cosine => 1.0 - distance,
			Self::L2 => 1.0 / (1.0 + distance.max(0.0)),
			Self::InnerProduct => -distance,
		};

		similarity.clamp(0.0, 1.0)
	}
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingTask {
	RetrievalQuery,
	RetrievalDocument,
}
impl EmbeddingTask {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::RetrievalQuery => "retrieval_query",
			Self::RetrievalDocument => "retrieval_document",
		}
	}
}

fn same_label(left: &str, right: &str) -> bool {
	left.trim().eq_ignore_ascii_case(right.trim())
}
