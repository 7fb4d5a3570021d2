use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use seo_adapters::RowShape;

#[derive(Debug, Parser)]
#[command(name = "import-redirect-map")]
#[command(about = "Set redirect destinations on existing audit records")]
struct Cli {
    /// Redirect map (CSV); a literal NULL destination clears it.
    #[arg(default_value = "fixtures/redirect-map/redirect_map.csv")]
    input: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    seo_cli::run_import("import-redirect-map", RowShape::RedirectMap, &cli.input).await
}
