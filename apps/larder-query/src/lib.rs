pub mod catalog;

use std::{fs, path::PathBuf, sync::Arc};

use clap::Parser;
use color_eyre::eyre::WrapErr;
use tracing_subscriber::EnvFilter;

use crate::catalog::Catalog;
use larder_domain::JudgeConfig;
use larder_service::{Collaborators, LarderService};

#[derive(Debug, Parser)]
#[command(
	version = larder_cli::VERSION,
	rename_all = "kebab",
	styles = larder_cli::styles(),
)]
pub struct Args {
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: PathBuf,
	/// JSON array of recipes, each with an optional `embedding`.
	#[arg(long, value_name = "FILE")]
	pub catalog: PathBuf,
	/// JSON object overriding judge settings for this query.
	#[arg(long, value_name = "FILE")]
	pub judge: Option<PathBuf>,
	pub query: String,
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let config = larder_config::load(&args.config)?;
	init_tracing(&config)?;
	let catalog = Arc::new(Catalog::load(&args.catalog)?);
	let judge = args.judge.as_deref().map(load_judge).transpose()?;
	let collaborators = Collaborators::with_http_providers(&config, catalog.clone(), catalog);
	let service = LarderService::new(&config, collaborators)?;
	let output = service.run_pipeline(&args.query, judge).await?;

	println!("{}", serde_json::to_string_pretty(&output)?);

	Ok(())
}

fn load_judge(path: &std::path::Path) -> color_eyre::Result<JudgeConfig> {
	let raw = fs::read_to_string(path)
		.wrap_err_with(|| format!("Failed to read judge config at {}.", path.display()))?;
	let judge: JudgeConfig = serde_json::from_str(&raw)
		.wrap_err_with(|| format!("Failed to parse judge config at {}.", path.display()))?;

	Ok(judge)
}

fn init_tracing(config: &larder_config::Config) -> color_eyre::Result<()> {
	let filter =
		EnvFilter::try_new(&config.service.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
	tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
	Ok(())
}
