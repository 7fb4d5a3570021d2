//! Shared bootstrap for the import binaries.

use std::path::Path;
use std::sync::Once;

use anyhow::{bail, Result};
use seo_adapters::RowShape;
use seo_sync::RunStatus;
use tracing::info;

static INIT: Once = Once::new();

/// Load `.env` and install the log subscriber once. Logs go to stderr so
/// stdout stays reserved for progress counters.
pub fn bootstrap(bin_name: &str) {
    INIT.call_once(|| {
        let _ = dotenv::dotenv();
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
            )
            .with_writer(std::io::stderr)
            .init();
    });
    info!(bin = bin_name, "starting");
}

/// Run one import job end to end. Row and chunk failures still exit 0;
/// only fatal errors and interrupts surface as `Err`.
pub async fn run_import(bin_name: &str, shape: RowShape, input: &Path) -> Result<()> {
    bootstrap(bin_name);
    let report = seo_sync::run_import_from_env(shape, input).await?;
    println!("{}", report.summary_line());
    if report.status == RunStatus::Cancelled {
        bail!(
            "interrupted: {} of {} rows were never attempted",
            report.not_attempted,
            report.total_rows
        );
    }
    Ok(())
}
