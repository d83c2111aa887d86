use anyhow::Result;

use crate::error::CompletionError;
use crate::fixtures;
use crate::store::layout::{IndexEntry, IndexKind, IndexMap, SegmentDirectory, SegmentMetadata, SegmentVersion, V3Writer, METADATA_FILE, V3_SUBDIR};

#[test]
fn metadata_round_trips_and_carries_unknown_keys() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let path = tmpdir.path().join(METADATA_FILE);
    let doc = serde_json::json!({
        "segment.format.version": "v2",
        "segment.name": "events__0__0",
        "segment.columns": ["city", "ts"],
        "segment.total.docs": 42,
        "segment.custom.tag": "opaque",
    });
    std::fs::write(&path, serde_json::to_vec(&doc)?)?;

    let mut metadata = SegmentMetadata::read(&path).map_err(anyhow::Error::from)?;
    assert!(metadata.version().map_err(anyhow::Error::from)? == SegmentVersion::V2, "expected version v2");
    assert!(metadata.segment_name() == Some("events__0__0"), "unexpected segment name {:?}", metadata.segment_name());
    assert!(metadata.columns() == vec!["city".to_string(), "ts".to_string()], "unexpected columns {:?}", metadata.columns());
    assert!(metadata.total_docs() == Some(42), "unexpected total docs {:?}", metadata.total_docs());

    metadata.set_version(SegmentVersion::V3);
    metadata.write(&path).map_err(anyhow::Error::from)?;

    // Only the version field changes on a rewrite; everything else is carried verbatim.
    let reread: serde_json::Value = serde_json::from_slice(&std::fs::read(&path)?)?;
    assert!(reread["segment.format.version"] == "v3", "expected the version field to be rewritten, got {}", reread["segment.format.version"]);
    assert!(reread["segment.custom.tag"] == "opaque", "expected unknown keys to be carried, got {}", reread["segment.custom.tag"]);
    assert!(reread["segment.total.docs"] == 42, "expected total docs to be carried, got {}", reread["segment.total.docs"]);
    Ok(())
}

#[test]
fn metadata_version_parsing_rejects_unknown_values() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let path = tmpdir.path().join(METADATA_FILE);
    std::fs::write(&path, serde_json::to_vec(&serde_json::json!({"segment.format.version": "v9"}))?)?;

    let metadata = SegmentMetadata::read(&path).map_err(anyhow::Error::from)?;
    let res = metadata.version();
    assert!(matches!(res, Err(CompletionError::ConfigInvalid(_))), "expected ConfigInvalid for an unknown version, got {:?}", res);

    std::fs::write(&path, serde_json::to_vec(&serde_json::json!({"segment.name": "events__0__0"}))?)?;
    let metadata = SegmentMetadata::read(&path).map_err(anyhow::Error::from)?;
    let res = metadata.version();
    assert!(matches!(res, Err(CompletionError::ConfigInvalid(_))), "expected ConfigInvalid for a missing version, got {:?}", res);
    Ok(())
}

#[test]
fn index_map_round_trips() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let path = tmpdir.path().join("index.map");

    let mut map = IndexMap::default();
    map.insert("city", IndexKind::Dictionary, IndexEntry { offset: 0, size: 128 });
    map.insert("city", IndexKind::Forward, IndexEntry { offset: 128, size: 512 });
    map.insert("city", IndexKind::Inverted, IndexEntry { offset: 640, size: 64 });
    map.write(&path).map_err(anyhow::Error::from)?;

    let reread = IndexMap::read(&path).map_err(anyhow::Error::from)?;
    assert!(reread.len() == 3, "expected 3 entries got {}", reread.len());
    let entry = reread.get("city", IndexKind::Forward).expect("expected a forward index entry");
    assert!(entry == IndexEntry { offset: 128, size: 512 }, "unexpected entry {:?}", entry);
    assert!(reread.get("ts", IndexKind::Forward).is_none(), "expected no entry for an unknown column");
    Ok(())
}

#[test]
fn segment_directory_reads_legacy_layout() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let segment_dir = tmpdir.path().join("events__0__0");
    let expected = fixtures::write_legacy_segment_dir(&segment_dir, "events__0__0")?;

    let dir = SegmentDirectory::open(&segment_dir).map_err(anyhow::Error::from)?;
    assert!(dir.version().map_err(anyhow::Error::from)? == SegmentVersion::V1, "expected a v1 segment");
    assert!(dir.has_index("city", IndexKind::Inverted), "expected city to carry an inverted index");
    assert!(!dir.has_index("impressions", IndexKind::Dictionary), "expected impressions to carry no dictionary");

    let buf = dir.read_index("city", IndexKind::Forward).map_err(anyhow::Error::from)?;
    let expected_buf = &expected[&IndexMap::key("city", IndexKind::Forward)];
    assert!(&buf == expected_buf, "expected {} bytes for the city forward index, got {}", expected_buf.len(), buf.len());
    Ok(())
}

#[test]
fn v3_writer_packs_buffers_readable_through_segment_directory() -> Result<()> {
    let tmpdir = tempfile::tempdir()?;
    let segment_dir = tmpdir.path().join("events__0__1");
    let v3_dir = segment_dir.join(V3_SUBDIR);
    std::fs::create_dir_all(&v3_dir)?;
    let doc = serde_json::json!({
        "segment.format.version": "v3",
        "segment.name": "events__0__1",
        "segment.columns": ["city", "ts"],
        "segment.total.docs": 10,
    });
    std::fs::write(v3_dir.join(METADATA_FILE), serde_json::to_vec(&doc)?)?;

    let city_fwd = fixtures::segment_payload(256);
    let ts_fwd = fixtures::segment_payload(96);
    let mut writer = V3Writer::create(&v3_dir).map_err(anyhow::Error::from)?;
    writer.append("city", IndexKind::Forward, &city_fwd).map_err(anyhow::Error::from)?;
    writer.append("ts", IndexKind::Forward, &ts_fwd).map_err(anyhow::Error::from)?;
    let map = writer.finish().map_err(anyhow::Error::from)?;
    assert!(map.len() == 2, "expected 2 packed buffers got {}", map.len());
    let entry = map.get("ts", IndexKind::Forward).expect("expected a ts forward entry");
    assert!(entry.offset == 256 && entry.size == 96, "expected the ts buffer packed after city, got {:?}", entry);

    let dir = SegmentDirectory::open(&segment_dir).map_err(anyhow::Error::from)?;
    assert!(dir.version().map_err(anyhow::Error::from)? == SegmentVersion::V3, "expected a v3 segment");
    let buf = dir.read_index("ts", IndexKind::Forward).map_err(anyhow::Error::from)?;
    assert!(buf == ts_fwd, "expected the packed ts buffer to read back, got {} bytes", buf.len());
    let buf = dir.read_index("city", IndexKind::Forward).map_err(anyhow::Error::from)?;
    assert!(buf == city_fwd, "expected the packed city buffer to read back, got {} bytes", buf.len());
    assert!(!dir.has_index("city", IndexKind::Inverted), "expected no inverted index entry");
    let res = dir.read_index("city", IndexKind::Inverted);
    assert!(matches!(res, Err(CompletionError::ConfigInvalid(_))), "expected ConfigInvalid for an absent buffer, got {:?}", res.map(|buf| buf.len()));
    Ok(())
}
