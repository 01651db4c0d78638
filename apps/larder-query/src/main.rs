use clap::Parser;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;
	let args = larder_query::Args::parse();
	larder_query::run(args).await
}
