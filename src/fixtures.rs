//! Test fixtures & utils.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::prelude::*;

use crate::config::Config;
use crate::coordinator::CompletionCoordinator;
use crate::protocol::{
    ExtendBuildTimeRequest, SegmentCommitEndRequest, SegmentCommitRequest, SegmentCommitStartRequest, SegmentConsumedRequest, SegmentStoppedConsumingRequest,
    SegmentUploadRequest,
};
use crate::store::layout::{IndexKind, IndexMap, AGG_INDEX_DATA_FILE, AGG_INDEX_MAP_FILE, CREATION_META_FILE, METADATA_FILE};
use crate::store::SegmentStore;

/// The columns written by `write_legacy_segment_dir`.
pub const LEGACY_COLUMNS: &[&str] = &["city", "impressions", "ts"];

/// Build a coordinator backed by a temp dir segment store.
pub async fn coordinator() -> Result<(CompletionCoordinator, Arc<Config>, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let store = SegmentStore::new(config.clone()).await?;
    Ok((CompletionCoordinator::new(config.clone(), store), config, tmpdir))
}

/// Build a segmentConsumed request for the given replica & segment.
pub fn consumed_req(instance_id: &str, segment_name: &str, offset: i64) -> SegmentConsumedRequest {
    SegmentConsumedRequest {
        instance_id: Some(instance_id.into()),
        segment_name: Some(segment_name.into()),
        offset,
        reason: Some("rowLimit".into()),
        ..Default::default()
    }
}

/// Build a segmentStoppedConsuming request for the given replica & segment.
pub fn stopped_req(instance_id: &str, segment_name: &str, offset: i64) -> SegmentStoppedConsumingRequest {
    SegmentStoppedConsumingRequest {
        instance_id: Some(instance_id.into()),
        segment_name: Some(segment_name.into()),
        offset,
        reason: Some("partitionRebalance".into()),
    }
}

/// Build a segmentCommitStart request for the given replica & segment.
pub fn commit_start_req(instance_id: &str, segment_name: &str, offset: i64) -> SegmentCommitStartRequest {
    SegmentCommitStartRequest {
        instance_id: Some(instance_id.into()),
        segment_name: Some(segment_name.into()),
        offset,
        ..Default::default()
    }
}

/// Build an extendBuildTime request for the given replica & segment.
pub fn extend_req(instance_id: &str, segment_name: &str, offset: i64, extra_time_sec: i64) -> ExtendBuildTimeRequest {
    ExtendBuildTimeRequest {
        instance_id: Some(instance_id.into()),
        segment_name: Some(segment_name.into()),
        offset,
        extra_time_sec,
    }
}

/// Build a segmentCommitEnd request for the given replica & segment.
pub fn commit_end_req(instance_id: &str, segment_name: &str, offset: i64, location: Option<&str>, success: bool) -> SegmentCommitEndRequest {
    SegmentCommitEndRequest {
        instance_id: Some(instance_id.into()),
        segment_name: Some(segment_name.into()),
        offset,
        success,
        segment_location: location.map(String::from),
        ..Default::default()
    }
}

/// Build an inline segmentCommit request for the given replica & segment.
pub fn commit_req(instance_id: &str, segment_name: &str, offset: i64, payload: &[u8]) -> SegmentCommitRequest {
    SegmentCommitRequest {
        instance_id: Some(instance_id.into()),
        segment_name: Some(segment_name.into()),
        offset,
        payload: payload.to_vec(),
        ..Default::default()
    }
}

/// Build a segmentUpload request for the given replica & segment.
pub fn upload_req(instance_id: &str, segment_name: &str, offset: i64, payload: &[u8]) -> SegmentUploadRequest {
    SegmentUploadRequest {
        instance_id: Some(instance_id.into()),
        segment_name: Some(segment_name.into()),
        offset,
        payload: payload.to_vec(),
    }
}

/// Write a legacy v1 segment directory with a mix of optional buffers, returning the expected
/// contents of every buffer & file a conversion must carry forward, keyed by index map key or
/// file name.
pub fn write_legacy_segment_dir(segment_dir: &Path, segment_name: &str) -> Result<BTreeMap<String, Vec<u8>>> {
    std::fs::create_dir_all(segment_dir).context("error creating test segment dir")?;
    let metadata = serde_json::json!({
        "segment.format.version": "v1",
        "segment.name": segment_name,
        "segment.columns": LEGACY_COLUMNS,
        "segment.total.docs": 1234,
        "segment.custom.tag": "fixture",
    });
    std::fs::write(segment_dir.join(METADATA_FILE), serde_json::to_vec_pretty(&metadata)?).context("error writing test segment metadata")?;

    let mut expected = BTreeMap::new();
    let mut write_buf = |name: String, path: &Path| -> Result<()> {
        let mut buf = vec![0u8; rand::thread_rng().gen_range(64..256)];
        rand::thread_rng().fill_bytes(&mut buf);
        std::fs::write(path, &buf).context("error writing test index buffer")?;
        expected.insert(name, buf);
        Ok(())
    };
    // city: fully indexed; impressions: forward only; ts: dictionary + forward.
    write_buf(IndexMap::key("city", IndexKind::Dictionary), &segment_dir.join("city.dict"))?;
    write_buf(IndexMap::key("city", IndexKind::Forward), &segment_dir.join("city.fwd"))?;
    write_buf(IndexMap::key("city", IndexKind::Inverted), &segment_dir.join("city.inv"))?;
    write_buf(IndexMap::key("impressions", IndexKind::Forward), &segment_dir.join("impressions.fwd"))?;
    write_buf(IndexMap::key("ts", IndexKind::Dictionary), &segment_dir.join("ts.dict"))?;
    write_buf(IndexMap::key("ts", IndexKind::Forward), &segment_dir.join("ts.fwd"))?;
    write_buf(CREATION_META_FILE.to_string(), &segment_dir.join(CREATION_META_FILE))?;
    write_buf(AGG_INDEX_DATA_FILE.to_string(), &segment_dir.join(AGG_INDEX_DATA_FILE))?;
    write_buf(AGG_INDEX_MAP_FILE.to_string(), &segment_dir.join(AGG_INDEX_MAP_FILE))?;
    Ok(expected)
}

/// Build a random segment payload of the given size.
pub fn segment_payload(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// Read back the canonical file for the given location token, stripping the `file://` scheme.
pub fn read_location(location: &str) -> Result<Vec<u8>> {
    let path = location.strip_prefix(crate::store::LOCATION_SCHEME).unwrap_or(location);
    std::fs::read(path).with_context(|| format!("error reading segment data at {}", location))
}

/// Build a segment store rooted in a fresh temp dir.
pub async fn store() -> Result<(SegmentStore, Arc<Config>, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let store = SegmentStore::new(config.clone()).await?;
    Ok((store, config, tmpdir))
}
