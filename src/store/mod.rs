//! Segment store.
//!
//! The store owns the on-disk layout of committed segment data under a single root directory,
//! `{root}/{table}/{segment}`. Uploaded segment payloads are first staged inside the root &
//! fsynced, then activated into their canonical location with a same-filesystem rename once the
//! coordinator accepts the commit. A staged payload which never activates is inert & carries a
//! unique suffix, so concurrent uploads for the same segment never collide.

pub mod convert;
pub mod layout;
#[cfg(test)]
mod layout_test;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{CompletionError, ERR_STAGING_WRITE};
use crate::segment::SegmentName;

/// The URI scheme of segment location tokens produced by this store.
pub const LOCATION_SCHEME: &str = "file://";
/// The directory under the store root holding inline commit staging data.
const UPLOAD_TMP_DIR: &str = "_upload_tmp";

/// The filesystem-backed segment store.
///
/// This is a cheap handle to the store; clones share the same underlying state.
#[derive(Clone)]
pub struct SegmentStore {
    inner: Arc<SegmentStoreInner>,
}

struct SegmentStoreInner {
    /// The canonicalized root directory of the store.
    root: PathBuf,
}

impl SegmentStore {
    /// Create a new instance, initializing the store's directory structure.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let root = PathBuf::from(&config.storage_data_path);
        tokio::fs::create_dir_all(&root).await.with_context(|| format!("error creating segment store root {:?}", &root))?;
        tokio::fs::create_dir_all(root.join(UPLOAD_TMP_DIR)).await.context("error creating segment store staging dir")?;
        let root = tokio::fs::canonicalize(&root).await.context("error canonicalizing segment store root")?;
        Ok(Self { inner: Arc::new(SegmentStoreInner { root }) })
    }

    /// The canonicalized root directory of the store.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// The canonical location token of the given segment.
    pub fn canonical_location(&self, segment: &SegmentName) -> String {
        location_token(&self.canonical_path(segment))
    }

    /// Stage an uploaded segment payload for later activation, returning its location token.
    ///
    /// The payload lands in the segment's table directory under a uniquely suffixed name & is
    /// fsynced before the token is returned, so activation is a same-filesystem rename.
    #[tracing::instrument(level = "debug", skip(self, payload))]
    pub async fn stage_split_upload(&self, segment: &SegmentName, payload: &[u8]) -> Result<String> {
        if payload.is_empty() {
            bail!(CompletionError::MalformedRequest("segment upload carries an empty payload".into()));
        }
        let table_dir = self.inner.root.join(&segment.table);
        tokio::fs::create_dir_all(&table_dir).await.context("error creating table dir for staged upload")?;
        let staged = table_dir.join(format!("{}.{}", segment, Uuid::new_v4()));
        write_sync(&staged, payload).await?;
        tracing::debug!(segment = %segment, staged = %staged.display(), "segment payload staged");
        Ok(location_token(&staged))
    }

    /// Stage an inline commit payload for activation within the same operation.
    #[tracing::instrument(level = "debug", skip(self, payload))]
    pub async fn stage_inline_upload(&self, segment: &SegmentName, payload: &[u8]) -> Result<String> {
        if payload.is_empty() {
            bail!(CompletionError::MalformedRequest("segment commit carries an empty payload".into()));
        }
        let staged = self.inner.root.join(UPLOAD_TMP_DIR).join(format!("{}.{}", segment, Uuid::new_v4()));
        write_sync(&staged, payload).await?;
        Ok(location_token(&staged))
    }

    /// Activate a staged segment at its canonical location, returning the canonical token.
    ///
    /// The staged location must resolve to a path inside the store root. Any existing data at
    /// the canonical location is replaced; the coordinator's single-commit guarantee makes such
    /// residue stale by construction.
    #[tracing::instrument(level = "debug", skip(self, staged_location))]
    pub async fn activate(&self, segment: &SegmentName, staged_location: &str) -> Result<String> {
        let staged = self.resolve_staged(staged_location).await?;
        let canonical = self.canonical_path(segment);
        if let Some(parent) = canonical.parent() {
            tokio::fs::create_dir_all(parent).await.context("error creating table dir for segment activation")?;
        }
        if let Ok(meta) = tokio::fs::metadata(&canonical).await {
            tracing::warn!(segment = %segment, "replacing existing data at the segment's canonical location");
            if meta.is_dir() {
                tokio::fs::remove_dir_all(&canonical).await.context("error removing existing segment data")?;
            }
        }
        tokio::fs::rename(&staged, &canonical).await.with_context(|| format!("error activating staged segment {:?}", &staged))?;
        tracing::debug!(segment = %segment, location = %canonical.display(), "staged segment activated");
        Ok(location_token(&canonical))
    }

    /// The canonical path of the given segment under the store root.
    fn canonical_path(&self, segment: &SegmentName) -> PathBuf {
        self.inner.root.join(&segment.table).join(segment.to_string())
    }

    /// Resolve a staged location token to a real path inside the store root.
    async fn resolve_staged(&self, location: &str) -> Result<PathBuf> {
        let path = location.strip_prefix(LOCATION_SCHEME).unwrap_or(location);
        let staged = match tokio::fs::canonicalize(path).await {
            Ok(staged) => staged,
            Err(err) => bail!(CompletionError::MalformedRequest(format!("staged segment location {} cannot be resolved: {}", location, err))),
        };
        if !staged.starts_with(&self.inner.root) {
            bail!(CompletionError::StaleOrUnauthorized(format!("staged segment location {} resolves outside the store root", location)));
        }
        Ok(staged)
    }
}

/// Write the given payload to the target path, fsyncing it before returning.
async fn write_sync(path: &Path, payload: &[u8]) -> Result<()> {
    let mut file = File::create(path).await.context(ERR_STAGING_WRITE)?;
    file.write_all(payload).await.context(ERR_STAGING_WRITE)?;
    file.sync_all().await.context(ERR_STAGING_WRITE)?;
    Ok(())
}

/// Render the location token of the given path.
fn location_token(path: &Path) -> String {
    format!("{}{}", LOCATION_SCHEME, path.display())
}
