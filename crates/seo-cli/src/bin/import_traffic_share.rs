use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use seo_adapters::RowShape;

#[derive(Debug, Parser)]
#[command(name = "import-traffic-share")]
#[command(about = "Enrich issue-type-16 audit records with organic traffic share and priority")]
struct Cli {
    /// Organic pages export (CSV).
    #[arg(default_value = "fixtures/traffic-share/organic_pages.csv")]
    input: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    seo_cli::run_import("import-traffic-share", RowShape::TrafficShare, &cli.input).await
}
