use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use seo_adapters::RowShape;

#[derive(Debug, Parser)]
#[command(name = "import-page-metadata")]
#[command(about = "Load crawl metadata, inserting audit records for new pages (issue type from ISSUE_TYPE_ID)")]
struct Cli {
    /// Crawler export (CSV).
    #[arg(default_value = "fixtures/page-metadata/crawl_export.csv")]
    input: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    seo_cli::run_import("import-page-metadata", RowShape::PageMetadata, &cli.input).await
}
