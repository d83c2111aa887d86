//! Segment directory conversion.
//!
//! Converts legacy v1/v2 segment directories to the packed v3 layout. A conversion builds the
//! complete v3 layout inside a temp directory within the segment directory, renames it to `v3`
//! in one step, & only then removes the superseded per-buffer files. An interrupted run leaves
//! the source fully readable plus at most a stale temp directory, which the next run sweeps.

use std::path::{Path, PathBuf};
use std::time::Instant;

use uuid::Uuid;

use crate::error::{CompletionError, CompletionResult, ShutdownError, ShutdownResult};
use crate::store::layout::{
    IndexKind, SegmentDirectory, SegmentVersion, V3Writer, AGG_INDEX_DATA_FILE, AGG_INDEX_MAP_FILE, CREATION_META_FILE, METADATA_FILE, V3_SUBDIR,
};

/// The name prefix of in-progress conversion temp dirs inside a segment directory.
const V3_TEMP_PREFIX: &str = "v3.tmp";

/// The outcome of one segment directory conversion.
#[derive(Debug)]
pub struct ConversionReport {
    /// The converted segment directory.
    pub segment_dir: PathBuf,
    /// The number of index buffers packed into the v3 data file.
    pub buffers: usize,
    /// Conversion wall time in milliseconds.
    pub elapsed_ms: u64,
}

/// The outcome of a batch conversion over a table directory.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// The number of segment directories converted.
    pub converted: usize,
    /// The number of entries skipped: already current, or not a segment directory.
    pub skipped: usize,
    /// The number of segment directories which failed to convert.
    pub failed: usize,
}

/// Convert one legacy segment directory to the v3 layout.
#[tracing::instrument(level = "debug")]
pub fn convert_segment_dir(segment_dir: &Path) -> CompletionResult<ConversionReport> {
    let started = Instant::now();
    if !segment_dir.is_dir() {
        return Err(CompletionError::MalformedRequest(format!("segment path {:?} is not a directory", segment_dir)));
    }
    let source = SegmentDirectory::open(segment_dir)?;
    let version = source.version()?;
    if !version.is_legacy() {
        delete_stale_temp_dirs(segment_dir)?;
        if segment_dir.join(V3_SUBDIR).join(METADATA_FILE).is_file() {
            // A crash after the final rename leaves superseded files behind; sweep them so
            // retries converge.
            delete_legacy_files(segment_dir)?;
        }
        return Err(CompletionError::AlreadyTerminal(format!("segment {:?} already uses the {} layout", segment_dir, version)));
    }

    delete_stale_temp_dirs(segment_dir)?;
    let temp_dir = segment_dir.join(format!("{}{}", V3_TEMP_PREFIX, Uuid::new_v4().to_simple()));
    std::fs::create_dir(&temp_dir)?;
    let buffers = match write_v3_layout(&source, &temp_dir) {
        Ok(buffers) => buffers,
        Err(err) => {
            // Best effort; anything left behind falls to the next run's stale sweep.
            let _res = std::fs::remove_dir_all(&temp_dir);
            return Err(err);
        }
    };
    std::fs::rename(&temp_dir, segment_dir.join(V3_SUBDIR))?;
    delete_legacy_files(segment_dir)?;

    Ok(ConversionReport { segment_dir: segment_dir.to_path_buf(), buffers, elapsed_ms: started.elapsed().as_millis() as u64 })
}

/// Convert every segment directory under the given table directory.
///
/// Failures are isolated per segment; the batch continues & the report carries the counts.
#[tracing::instrument(level = "debug")]
pub fn convert_table_dir(table_dir: &Path) -> CompletionResult<BatchReport> {
    let mut report = BatchReport::default();
    for entry in std::fs::read_dir(table_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            report.skipped += 1;
            continue;
        }
        match convert_segment_dir(&path) {
            Ok(converted) => {
                tracing::info!(segment_dir = %converted.segment_dir.display(), buffers = converted.buffers, elapsed_ms = converted.elapsed_ms, "segment directory converted");
                report.converted += 1;
            }
            Err(CompletionError::AlreadyTerminal(reason)) => {
                tracing::debug!(segment_dir = %path.display(), reason = %reason, "skipping segment directory");
                report.skipped += 1;
            }
            Err(err) => {
                tracing::error!(error = ?err, segment_dir = %path.display(), "error converting segment directory");
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

/// Convert every segment directory under the given table directory from async code.
pub async fn convert_table_dir_async(table_dir: PathBuf) -> ShutdownResult<CompletionResult<BatchReport>> {
    spawn_blocking(move || convert_table_dir(&table_dir)).await
}

/// Write the complete v3 layout for the given legacy segment into the target directory.
fn write_v3_layout(source: &SegmentDirectory, target: &Path) -> CompletionResult<usize> {
    let mut metadata = source.metadata().clone();
    metadata.set_version(SegmentVersion::V3);
    metadata.write(&target.join(METADATA_FILE))?;
    let creation_meta = source.root().join(CREATION_META_FILE);
    if creation_meta.is_file() {
        std::fs::copy(&creation_meta, target.join(CREATION_META_FILE))?;
    }

    // Per-column sections first: dictionary then forward index. Inverted indexes follow after
    // every column's primary buffers.
    let mut writer = V3Writer::create(target)?;
    let columns = source.metadata().columns();
    for column in columns.iter() {
        if source.has_index(column, IndexKind::Dictionary) {
            writer.append(column, IndexKind::Dictionary, &source.read_index(column, IndexKind::Dictionary)?)?;
        }
        if !source.has_index(column, IndexKind::Forward) {
            return Err(CompletionError::ConfigInvalid(format!("column {} is missing its forward index", column)));
        }
        writer.append(column, IndexKind::Forward, &source.read_index(column, IndexKind::Forward)?)?;
    }
    for column in columns.iter() {
        if source.has_index(column, IndexKind::Inverted) {
            writer.append(column, IndexKind::Inverted, &source.read_index(column, IndexKind::Inverted)?)?;
        }
    }
    let index_map = writer.finish()?;

    for agg_file in [AGG_INDEX_DATA_FILE, AGG_INDEX_MAP_FILE] {
        let agg_path = source.root().join(agg_file);
        if agg_path.is_file() {
            std::fs::copy(&agg_path, target.join(agg_file))?;
        }
    }
    Ok(index_map.len())
}

/// Remove in-progress conversion temp dirs left behind by interrupted runs.
fn delete_stale_temp_dirs(segment_dir: &Path) -> CompletionResult<()> {
    for entry in std::fs::read_dir(segment_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let is_temp = name.to_str().map(|name| name.starts_with(V3_TEMP_PREFIX)).unwrap_or(false);
        if is_temp && entry.path().is_dir() {
            tracing::warn!(dir = %entry.path().display(), "removing stale conversion temp dir");
            std::fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}

/// Remove the superseded legacy layout files from the segment root, leaving directories alone.
fn delete_legacy_files(segment_dir: &Path) -> CompletionResult<()> {
    for entry in std::fs::read_dir(segment_dir)? {
        let entry = entry?;
        if entry.path().is_file() {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Spawn a blocking task & map a join failure onto a `ShutdownError`.
async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
}
