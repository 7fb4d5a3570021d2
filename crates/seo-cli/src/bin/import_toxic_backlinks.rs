use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use seo_adapters::RowShape;

#[derive(Debug, Parser)]
#[command(name = "import-toxic-backlinks")]
#[command(about = "Enrich issue-type-15 audit records with backlink toxicity and authority scores")]
struct Cli {
    /// Backlink audit export (tab-separated, UTF-16LE).
    #[arg(default_value = "fixtures/toxic-backlinks/backlink_audit.tsv")]
    input: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    seo_cli::run_import("import-toxic-backlinks", RowShape::ToxicBacklinks, &cli.input).await
}
