use crate::recipe::Candidate;

/// Scores how well a candidate covers the ingredient terms of a query, in `[0, 1]`.
pub trait IngredientScorer
where
	Self: Send + Sync,
{
	fn score(&self, query_ingredients: &[String], candidate: &Candidate) -> f32;
}

/// Coarse term overlap against the candidate's ingredient list, title and description.
///
/// A query without ingredient terms carries no signal and scores `1.0`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TermOverlapScorer;
impl IngredientScorer for TermOverlapScorer {
	fn score(&self, query_ingredients: &[String], candidate: &Candidate) -> f32 {
		let terms: Vec<String> = query_ingredients
			.iter()
			.map(|term| term.trim().to_lowercase())
			.filter(|term| !term.is_empty())
			.collect();

		if terms.is_empty() {
			return 1.0;
		}

		let haystack = candidate_text(candidate);
		let matched = terms.iter().filter(|term| haystack.contains(term.as_str())).count();

		matched as f32 / terms.len() as f32
	}
}

fn candidate_text(candidate: &Candidate) -> String {
	let mut text = candidate.title.to_lowercase();

	if let Some(description) = candidate.description.as_deref() {
		text.push('\n');
		text.push_str(&description.to_lowercase());
	}

	for ingredient in &candidate.ingredients {
		text.push('\n');
		text.push_str(&ingredient.to_lowercase());
	}

	text
}
