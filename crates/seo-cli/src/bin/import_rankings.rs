use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use seo_adapters::RowShape;

#[derive(Debug, Parser)]
#[command(name = "import-rankings")]
#[command(about = "Upsert keyword ranking snapshots")]
struct Cli {
    /// Position tracking export (CSV).
    #[arg(default_value = "fixtures/rankings/positions.csv")]
    input: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    seo_cli::run_import("import-rankings", RowShape::RankingKeywords, &cli.input).await
}
