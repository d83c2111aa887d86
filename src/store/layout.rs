//! Segment directory layouts.
//!
//! Two generations of on-disk segment layout coexist:
//!
//! - v1/v2 (legacy): the segment directory holds one file per index buffer, `{col}.dict`,
//!   `{col}.fwd` & `{col}.inv`, beside the segment's `metadata.json`.
//! - v3 (current): a `v3/` subdirectory holds `metadata.json`, every index buffer packed
//!   back-to-back in a single `columns.data` file, & an `index.map` document locating each
//!   buffer within it.
//!
//! `SegmentDirectory` reads either layout through one interface & `V3Writer` produces the
//! packed layout; the converter in [`crate::store::convert`] migrates between the two. All I/O
//! here is synchronous & expected to run under `spawn_blocking` when called from async code.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CompletionError, CompletionResult, ERR_METADATA_READ};

/// The name of the segment metadata document within a layout.
pub const METADATA_FILE: &str = "metadata.json";
/// The name of the segment creation metadata file within a layout.
pub const CREATION_META_FILE: &str = "creation.meta";
/// The name of the packed column buffer file within a v3 layout.
pub const V3_DATA_FILE: &str = "columns.data";
/// The name of the buffer index document within a v3 layout.
pub const V3_INDEX_MAP_FILE: &str = "index.map";
/// The name of the v3 layout subdirectory within a segment directory.
pub const V3_SUBDIR: &str = "v3";
/// The name of the aggregate index data file, carried verbatim across layouts.
pub const AGG_INDEX_DATA_FILE: &str = "agg_index.data";
/// The name of the aggregate index map file, carried verbatim across layouts.
pub const AGG_INDEX_MAP_FILE: &str = "agg_index.map";

/// The metadata key holding a segment's layout version.
pub const META_KEY_VERSION: &str = "segment.format.version";
/// The metadata key holding a segment's rendered name.
pub const META_KEY_NAME: &str = "segment.name";
/// The metadata key holding a segment's column names.
pub const META_KEY_COLUMNS: &str = "segment.columns";
/// The metadata key holding a segment's total document count.
pub const META_KEY_TOTAL_DOCS: &str = "segment.total.docs";

/// A segment layout version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentVersion {
    V1,
    V2,
    V3,
}

impl SegmentVersion {
    /// The metadata representation of this version.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
            Self::V3 => "v3",
        }
    }

    /// Whether this version uses the legacy file-per-buffer layout.
    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::V1 | Self::V2)
    }
}

impl FromStr for SegmentVersion {
    type Err = CompletionError;

    fn from_str(val: &str) -> Result<Self, Self::Err> {
        match val {
            "v1" => Ok(Self::V1),
            "v2" => Ok(Self::V2),
            "v3" => Ok(Self::V3),
            _ => Err(CompletionError::ConfigInvalid(format!("unknown segment format version `{}`", val))),
        }
    }
}

impl fmt::Display for SegmentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The kind of an index buffer within a segment layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKind {
    /// A column's value dictionary.
    Dictionary,
    /// A column's forward index.
    Forward,
    /// A column's inverted index.
    Inverted,
}

impl IndexKind {
    /// The legacy per-buffer file extension of this index kind.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Dictionary => "dict",
            Self::Forward => "fwd",
            Self::Inverted => "inv",
        }
    }

    /// The index map key suffix of this index kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dictionary => "dictionary",
            Self::Forward => "forward_index",
            Self::Inverted => "inverted_index",
        }
    }
}

/// A segment's metadata document: an arbitrary JSON object with typed accessors over the keys
/// this system understands. Unknown keys are carried verbatim through reads & rewrites.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentMetadata {
    fields: serde_json::Map<String, serde_json::Value>,
}

impl SegmentMetadata {
    /// Read a metadata document from the given path.
    pub fn read(path: &Path) -> CompletionResult<Self> {
        let raw = std::fs::read(path)?;
        serde_json::from_slice(&raw).map_err(|err| CompletionError::ConfigInvalid(format!("{} {:?}: {}", ERR_METADATA_READ, path, err)))
    }

    /// Write this metadata document to the given path.
    pub fn write(&self, path: &Path) -> CompletionResult<()> {
        let raw = serde_json::to_vec_pretty(self).map_err(|err| CompletionError::ConfigInvalid(format!("error serializing segment metadata: {}", err)))?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// The segment's layout version.
    pub fn version(&self) -> CompletionResult<SegmentVersion> {
        match self.fields.get(META_KEY_VERSION).and_then(|val| val.as_str()) {
            Some(version) => version.parse(),
            None => Err(CompletionError::ConfigInvalid(format!("segment metadata is missing key {}", META_KEY_VERSION))),
        }
    }

    /// Set the segment's layout version.
    pub fn set_version(&mut self, version: SegmentVersion) {
        self.fields.insert(META_KEY_VERSION.into(), serde_json::Value::String(version.as_str().into()));
    }

    /// The segment's rendered name, if recorded.
    pub fn segment_name(&self) -> Option<&str> {
        self.fields.get(META_KEY_NAME).and_then(|val| val.as_str())
    }

    /// The segment's column names, in metadata order.
    pub fn columns(&self) -> Vec<String> {
        self.fields
            .get(META_KEY_COLUMNS)
            .and_then(|val| val.as_array())
            .map(|cols| cols.iter().filter_map(|col| col.as_str().map(String::from)).collect())
            .unwrap_or_default()
    }

    /// The segment's total document count, if recorded.
    pub fn total_docs(&self) -> Option<u64> {
        self.fields.get(META_KEY_TOTAL_DOCS).and_then(|val| val.as_u64())
    }
}

/// The location of one index buffer within a v3 `columns.data` file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// The buffer's byte offset within the packed data file.
    pub offset: u64,
    /// The buffer's size in bytes.
    pub size: u64,
}

/// The buffer index of a v3 layout, keyed by `{column}.{kind}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexMap {
    entries: BTreeMap<String, IndexEntry>,
}

impl IndexMap {
    /// The index map key of the given column & index kind.
    pub fn key(column: &str, kind: IndexKind) -> String {
        format!("{}.{}", column, kind.as_str())
    }

    /// Read an index map document from the given path.
    pub fn read(path: &Path) -> CompletionResult<Self> {
        let raw = std::fs::read(path)?;
        serde_json::from_slice(&raw).map_err(|err| CompletionError::ConfigInvalid(format!("error parsing index map {:?}: {}", path, err)))
    }

    /// Write this index map document to the given path.
    pub fn write(&self, path: &Path) -> CompletionResult<()> {
        let raw = serde_json::to_vec_pretty(self).map_err(|err| CompletionError::ConfigInvalid(format!("error serializing index map: {}", err)))?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// The entry for the given column & index kind, if present.
    pub fn get(&self, column: &str, kind: IndexKind) -> Option<IndexEntry> {
        self.entries.get(&Self::key(column, kind)).copied()
    }

    /// Record the location of the given column & index kind.
    pub fn insert(&mut self, column: &str, kind: IndexKind, entry: IndexEntry) {
        self.entries.insert(Self::key(column, kind), entry);
    }

    /// The number of buffers indexed by this map.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A reader over a segment directory in either layout.
pub struct SegmentDirectory {
    /// The segment directory root.
    root: PathBuf,
    /// The directory holding the active layout's files: `{root}/v3`, or `{root}` itself for
    /// legacy layouts.
    layout_dir: PathBuf,
    /// The segment's metadata document.
    metadata: SegmentMetadata,
    /// The buffer index, present only for the v3 layout.
    index_map: Option<IndexMap>,
}

impl SegmentDirectory {
    /// Open the given segment directory, probing for the v3 layout first.
    pub fn open(root: &Path) -> CompletionResult<Self> {
        let v3_dir = root.join(V3_SUBDIR);
        if v3_dir.join(METADATA_FILE).is_file() {
            let metadata = SegmentMetadata::read(&v3_dir.join(METADATA_FILE))?;
            let index_map = IndexMap::read(&v3_dir.join(V3_INDEX_MAP_FILE))?;
            return Ok(Self { root: root.to_path_buf(), layout_dir: v3_dir, metadata, index_map: Some(index_map) });
        }
        let metadata = SegmentMetadata::read(&root.join(METADATA_FILE))?;
        Ok(Self { root: root.to_path_buf(), layout_dir: root.to_path_buf(), metadata, index_map: None })
    }

    /// The segment directory root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The segment's metadata document.
    pub fn metadata(&self) -> &SegmentMetadata {
        &self.metadata
    }

    /// The segment's layout version.
    pub fn version(&self) -> CompletionResult<SegmentVersion> {
        self.metadata.version()
    }

    /// Whether the segment holds a buffer for the given column & index kind.
    pub fn has_index(&self, column: &str, kind: IndexKind) -> bool {
        match &self.index_map {
            Some(map) => map.get(column, kind).is_some(),
            None => legacy_index_file(&self.layout_dir, column, kind).is_file(),
        }
    }

    /// Read the buffer of the given column & index kind.
    pub fn read_index(&self, column: &str, kind: IndexKind) -> CompletionResult<Vec<u8>> {
        match &self.index_map {
            Some(map) => {
                let entry = map
                    .get(column, kind)
                    .ok_or_else(|| CompletionError::ConfigInvalid(format!("segment index map holds no entry for {}", IndexMap::key(column, kind))))?;
                let mut file = File::open(self.layout_dir.join(V3_DATA_FILE))?;
                file.seek(SeekFrom::Start(entry.offset))?;
                let mut buf = vec![0; entry.size as usize];
                file.read_exact(&mut buf)?;
                Ok(buf)
            }
            None => Ok(std::fs::read(legacy_index_file(&self.layout_dir, column, kind))?),
        }
    }
}

/// A writer producing the packed v3 layout in a target directory.
pub struct V3Writer {
    /// The directory receiving the layout's files.
    dir: PathBuf,
    /// The packed data file under construction.
    data: File,
    /// The running byte offset within the data file.
    offset: u64,
    /// The index of buffers appended so far.
    index_map: IndexMap,
}

impl V3Writer {
    /// Create a new instance writing into the given directory.
    pub fn create(dir: &Path) -> CompletionResult<Self> {
        let data = File::create(dir.join(V3_DATA_FILE))?;
        Ok(Self { dir: dir.to_path_buf(), data, offset: 0, index_map: IndexMap::default() })
    }

    /// Append one index buffer to the packed data file.
    pub fn append(&mut self, column: &str, kind: IndexKind, buf: &[u8]) -> CompletionResult<()> {
        self.data.write_all(buf)?;
        self.index_map.insert(column, kind, IndexEntry { offset: self.offset, size: buf.len() as u64 });
        self.offset += buf.len() as u64;
        Ok(())
    }

    /// Finish the layout: fsync the data file & persist the index map.
    pub fn finish(self) -> CompletionResult<IndexMap> {
        self.data.sync_all()?;
        self.index_map.write(&self.dir.join(V3_INDEX_MAP_FILE))?;
        Ok(self.index_map)
    }
}

/// The legacy per-buffer file of the given column & index kind.
fn legacy_index_file(dir: &Path, column: &str, kind: IndexKind) -> PathBuf {
    dir.join(format!("{}.{}", column, kind.extension()))
}
