use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use seo_adapters::RowShape;

#[derive(Debug, Parser)]
#[command(name = "import-status-updates")]
#[command(about = "Apply operator status changes to audit records and log each change")]
struct Cli {
    /// Status sheet (CSV) with url, issue type id and status.
    #[arg(default_value = "fixtures/status-updates/status_updates.csv")]
    input: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    seo_cli::run_import("import-status-updates", RowShape::StatusUpdates, &cli.input).await
}
