//! The offline segment directory converter.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Result};
use structopt::StructOpt;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};
use varve::store::convert;

/// Convert a table's legacy segment directories to the packed v3 layout.
///
/// Every segment directory under the given table directory is converted in place. Entries
/// already using the v3 layout are skipped & a failing segment does not stop the run; the
/// process exits nonzero if any segment directory failed to convert.
#[derive(StructOpt)]
#[structopt(name = "segment-converter")]
struct SegmentConverter {
    /// The table directory holding the segment directories to convert.
    #[structopt(parse(from_os_str))]
    table_dir: PathBuf,
    /// Enable debug logging.
    #[structopt(short)]
    verbose: bool,
}

impl SegmentConverter {
    async fn run(self) -> Result<()> {
        // Initialize logging based on CLI config.
        let fmt_layer = fmt::layer().with_target(true);
        let filter_layer;
        let level_filter;
        if self.verbose {
            filter_layer = EnvFilter::new("debug");
            level_filter = LevelFilter::DEBUG;
        } else {
            filter_layer = EnvFilter::new("info");
            level_filter = LevelFilter::INFO;
        }
        tracing_subscriber::registry().with(filter_layer).with(fmt_layer).with(level_filter).init();

        if !self.table_dir.is_dir() {
            bail!("table path {:?} is not a directory", self.table_dir);
        }
        tracing::info!(table_dir = %self.table_dir.display(), "converting segment directories");
        let report = convert::convert_table_dir_async(self.table_dir).await??;
        tracing::info!(converted = report.converted, skipped = report.skipped, failed = report.failed, "table directory conversion complete");
        if report.failed > 0 {
            bail!("{} segment directories failed to convert", report.failed);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let res = SegmentConverter::from_args().run().await;

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    res
}
