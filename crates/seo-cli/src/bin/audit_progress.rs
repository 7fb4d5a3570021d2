use anyhow::{Context, Result};
use clap::Parser;
use seo_sync::{audit_progress, connect_rest_store, ImportConfig, StoreCredentials};

#[derive(Debug, Parser)]
#[command(name = "audit-progress")]
#[command(about = "Count audit records per status")]
struct Cli {
    /// Restrict the counts to one issue type.
    issue_type_id: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    seo_cli::bootstrap("audit-progress");

    let config = ImportConfig::from_env().context("reading configuration")?;
    let credentials = StoreCredentials::from_env().context("reading store credentials")?;
    let store = connect_rest_store(&credentials, &config)?;

    let progress = audit_progress(&store, cli.issue_type_id)
        .await
        .context("counting audit records")?;
    match progress.issue_type_id {
        Some(id) => println!("issue type {id}: {} records", progress.total),
        None => println!("all issue types: {} records", progress.total),
    }
    for (status, count) in &progress.by_status {
        println!("  {status:<8} {count}");
    }
    println!("  resolved {:.1}%", progress.resolved_percent());
    Ok(())
}
