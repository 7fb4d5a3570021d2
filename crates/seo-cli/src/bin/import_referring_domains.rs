use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use seo_adapters::RowShape;

#[derive(Debug, Parser)]
#[command(name = "import-referring-domains")]
#[command(about = "Upsert referring domains on their domain name")]
struct Cli {
    /// Referring domains export (tab-separated, UTF-16LE).
    #[arg(default_value = "fixtures/referring-domains/referring_domains.tsv")]
    input: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    seo_cli::run_import("import-referring-domains", RowShape::ReferringDomains, &cli.input).await
}
