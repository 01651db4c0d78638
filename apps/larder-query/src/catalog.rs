//! In-memory recipe store backing both retrievers for local runs.

use std::{fs, path::Path};

use color_eyre::eyre::WrapErr;
use serde::Deserialize;

use larder_domain::{Candidate, DistanceMetric, SearchFilters};
use larder_service::{BoxFuture, FilterRetriever, Result, VectorRetriever};

#[derive(Clone, Debug, Deserialize)]
pub struct CatalogEntry {
	#[serde(flatten)]
	pub recipe: Candidate,
	#[serde(default)]
	pub embedding: Option<Vec<f32>>,
}

pub struct Catalog {
	entries: Vec<CatalogEntry>,
}
impl Catalog {
	pub fn new(entries: Vec<CatalogEntry>) -> Self {
		Self { entries }
	}

	pub fn load(path: &Path) -> color_eyre::Result<Self> {
		let raw = fs::read_to_string(path)
			.wrap_err_with(|| format!("Failed to read catalog at {}.", path.display()))?;
		let entries: Vec<CatalogEntry> = serde_json::from_str(&raw)
			.wrap_err_with(|| format!("Failed to parse catalog at {}.", path.display()))?;

		tracing::debug!(recipes = entries.len(), "Loaded recipe catalog.");

		Ok(Self::new(entries))
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	fn nearest(&self, vector: &[f32], limit: usize, metric: DistanceMetric) -> Vec<(Candidate, f32)> {
		let mut hits: Vec<(Candidate, f32)> = self
			.entries
			.iter()
			.filter_map(|entry| {
				let embedding = entry.embedding.as_deref()?;

				if embedding.len() != vector.len() {
					return None;
				}

				Some((entry.recipe.clone(), distance(metric, vector, embedding)))
			})
			.collect();

		hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.id.cmp(&b.0.id)));
		hits.truncate(limit);

		hits
	}

	fn matching(&self, filters: &SearchFilters, limit: usize) -> Vec<Candidate> {
		self.entries
			.iter()
			.filter(|entry| filters.matches_all(&entry.recipe))
			.take(limit)
			.map(|entry| entry.recipe.clone())
			.collect()
	}
}

impl VectorRetriever for Catalog {
	fn search<'a>(
		&'a self,
		vector: &'a [f32],
		limit: usize,
		metric: DistanceMetric,
	) -> BoxFuture<'a, Result<Vec<(Candidate, f32)>>> {
		Box::pin(async move { Ok(self.nearest(vector, limit, metric)) })
	}
}

impl FilterRetriever for Catalog {
	fn search<'a>(
		&'a self,
		filters: &'a SearchFilters,
		limit: usize,
	) -> BoxFuture<'a, Result<Vec<Candidate>>> {
		Box::pin(async move { Ok(self.matching(filters, limit)) })
	}
}

/// Distance under `metric`; smaller is closer.
fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
	let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();

	match metric {
		DistanceMetric::Cosine => {
			let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
			let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

			if norm_a == 0.0 || norm_b == 0.0 {
				return 1.0;
			}

			1.0 - dot / (norm_a * norm_b)
		},
		DistanceMetric::L2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt(),
		DistanceMetric::InnerProduct => -dot,
	}
}
