//! Segment completion protocol records.
//!
//! Requests arrive from replicas over whatever transport the embedding system uses; this module
//! defines their shapes, the flat response record, and the pre-state validation applied to every
//! request before any coordination state is touched.

use serde::{Deserialize, Serialize};

use crate::error::CompletionError;
use crate::segment::SegmentName;

/// The sentinel offset value marking an unset offset field.
pub const UNSET_OFFSET: i64 = -1;

/// The disposition returned to a replica from a completion protocol operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionStatus {
    /// The request was malformed, unauthorized, stale, or the operation failed.
    Failed,
    /// Keep the locally built segment & continue consuming.
    Keep,
    /// Discard local progress beyond the returned offset & re-consume up to it.
    CatchUp,
    /// Hold at the current position & poll again shortly.
    Hold,
    /// The caller is the committer: build & commit the segment at the returned offset.
    Commit,
    /// The commit protocol may proceed to segment upload.
    CommitContinue,
    /// The uploaded segment payload was staged at the returned location.
    UploadSuccess,
    /// The request was accepted; no position change is required.
    Processed,
}

/// The flat response record returned for every completion protocol operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResponse {
    /// The disposition of the request.
    pub status: CompletionStatus,
    /// The offset associated with the disposition, `-1` when not applicable.
    #[serde(default = "default_offset")]
    pub offset: i64,
    /// The staged or canonical location of the segment, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_location: Option<String>,
    /// The build time remaining for the current commit attempt, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_time_sec: Option<i64>,
}

impl CompletionResponse {
    /// Construct a new response with the given status & no offset.
    pub fn new(status: CompletionStatus) -> Self {
        Self { status, offset: UNSET_OFFSET, segment_location: None, build_time_sec: None }
    }

    /// Construct a new response carrying the given offset.
    pub fn with_offset(status: CompletionStatus, offset: u64) -> Self {
        Self { status, offset: offset_to_i64(offset), segment_location: None, build_time_sec: None }
    }

    /// Construct a new failed response.
    pub fn failed() -> Self {
        Self::new(CompletionStatus::Failed)
    }

    /// Attach a segment location to this response.
    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.segment_location = Some(location.into());
        self
    }

    /// Attach the remaining build time to this response.
    pub fn build_time(mut self, seconds: u64) -> Self {
        self.build_time_sec = Some(offset_to_i64(seconds));
        self
    }
}

/// A replica's report of its current consuming position for a segment.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SegmentConsumedRequest {
    /// The reporting replica's instance id.
    pub instance_id: Option<String>,
    /// The rendered name of the segment being consumed.
    pub segment_name: Option<String>,
    /// The offset up to which the replica has consumed.
    pub offset: i64,
    /// The replica's reason for reporting, if any.
    pub reason: Option<String>,
    /// The memory used by the replica's in-progress segment, in bytes.
    pub memory_used_bytes: u64,
    /// The number of rows in the replica's in-progress segment.
    pub num_rows: u64,
}

impl Default for SegmentConsumedRequest {
    fn default() -> Self {
        Self { instance_id: None, segment_name: None, offset: UNSET_OFFSET, reason: None, memory_used_bytes: 0, num_rows: 0 }
    }
}

/// A replica's report that it has stopped consuming its partition.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SegmentStoppedConsumingRequest {
    /// The reporting replica's instance id.
    pub instance_id: Option<String>,
    /// The rendered name of the segment the replica was consuming.
    pub segment_name: Option<String>,
    /// The offset at which the replica stopped.
    pub offset: i64,
    /// The replica's reason for stopping.
    pub reason: Option<String>,
}

impl Default for SegmentStoppedConsumingRequest {
    fn default() -> Self {
        Self { instance_id: None, segment_name: None, offset: UNSET_OFFSET, reason: None }
    }
}

/// A committer's request to begin the commit protocol for its segment.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SegmentCommitStartRequest {
    /// The committing replica's instance id.
    pub instance_id: Option<String>,
    /// The rendered name of the segment being committed.
    pub segment_name: Option<String>,
    /// The offset at which the segment was built.
    pub offset: i64,
    /// The memory used by the replica's segment build, in bytes.
    pub memory_used_bytes: u64,
    /// The time the replica spent building the segment, in milliseconds.
    pub build_time_millis: u64,
    /// The time the replica waited before building, in milliseconds.
    pub wait_time_millis: u64,
    /// The number of rows in the built segment.
    pub num_rows: u64,
    /// The size of the built segment, in bytes.
    pub segment_size_bytes: u64,
}

impl Default for SegmentCommitStartRequest {
    fn default() -> Self {
        Self {
            instance_id: None,
            segment_name: None,
            offset: UNSET_OFFSET,
            memory_used_bytes: 0,
            build_time_millis: 0,
            wait_time_millis: 0,
            num_rows: 0,
            segment_size_bytes: 0,
        }
    }
}

/// A committer's request for more time to build & commit its segment.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExtendBuildTimeRequest {
    /// The committing replica's instance id.
    pub instance_id: Option<String>,
    /// The rendered name of the segment being committed.
    pub segment_name: Option<String>,
    /// The offset at which the segment is being committed.
    pub offset: i64,
    /// The additional build time requested, in seconds.
    ///
    /// Non-positive values fall back to the configured default commit window.
    pub extra_time_sec: i64,
}

impl Default for ExtendBuildTimeRequest {
    fn default() -> Self {
        Self { instance_id: None, segment_name: None, offset: UNSET_OFFSET, extra_time_sec: 0 }
    }
}

/// A committer's final commit request for its built segment.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SegmentCommitEndRequest {
    /// The committing replica's instance id.
    pub instance_id: Option<String>,
    /// The rendered name of the segment being committed.
    pub segment_name: Option<String>,
    /// The offset at which the segment was built.
    pub offset: i64,
    /// Whether the replica's segment build & upload succeeded.
    pub success: bool,
    /// Whether the segment was staged via the split commit protocol.
    pub is_split_commit: bool,
    /// The staged location of the uploaded segment, required for split commits.
    pub segment_location: Option<String>,
    /// The memory used by the replica's segment build, in bytes.
    pub memory_used_bytes: u64,
    /// The time the replica spent building the segment, in milliseconds.
    pub build_time_millis: u64,
    /// The time the replica waited before building, in milliseconds.
    pub wait_time_millis: u64,
    /// The number of rows in the built segment.
    pub num_rows: u64,
    /// The size of the built segment, in bytes.
    pub segment_size_bytes: u64,
}

impl Default for SegmentCommitEndRequest {
    fn default() -> Self {
        Self {
            instance_id: None,
            segment_name: None,
            offset: UNSET_OFFSET,
            success: false,
            is_split_commit: true,
            segment_location: None,
            memory_used_bytes: 0,
            build_time_millis: 0,
            wait_time_millis: 0,
            num_rows: 0,
            segment_size_bytes: 0,
        }
    }
}

/// A committer's inline commit request, carrying the segment payload itself.
///
/// Equivalent to a commit-start, a payload upload & a commit-end performed as one operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SegmentCommitRequest {
    /// The committing replica's instance id.
    pub instance_id: Option<String>,
    /// The rendered name of the segment being committed.
    pub segment_name: Option<String>,
    /// The offset at which the segment was built.
    pub offset: i64,
    /// The built segment payload, attached out-of-band by the transport layer.
    #[serde(skip)]
    pub payload: Vec<u8>,
    /// The memory used by the replica's segment build, in bytes.
    pub memory_used_bytes: u64,
    /// The time the replica spent building the segment, in milliseconds.
    pub build_time_millis: u64,
    /// The number of rows in the built segment.
    pub num_rows: u64,
    /// The size of the built segment, in bytes.
    pub segment_size_bytes: u64,
}

impl Default for SegmentCommitRequest {
    fn default() -> Self {
        Self {
            instance_id: None,
            segment_name: None,
            offset: UNSET_OFFSET,
            payload: Vec::new(),
            memory_used_bytes: 0,
            build_time_millis: 0,
            num_rows: 0,
            segment_size_bytes: 0,
        }
    }
}

/// A replica's request to stage a built segment ahead of a split commit.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SegmentUploadRequest {
    /// The uploading replica's instance id.
    pub instance_id: Option<String>,
    /// The rendered name of the segment being staged.
    pub segment_name: Option<String>,
    /// The offset at which the segment was built.
    pub offset: i64,
    /// The built segment payload, attached out-of-band by the transport layer.
    #[serde(skip)]
    pub payload: Vec<u8>,
}

impl Default for SegmentUploadRequest {
    fn default() -> Self {
        Self { instance_id: None, segment_name: None, offset: UNSET_OFFSET, payload: Vec::new() }
    }
}

/// The validated identity fields shared by all completion protocol requests.
pub struct RequestIdentity {
    /// The requesting replica's instance id.
    pub instance_id: String,
    /// The parsed segment name targeted by the request.
    pub segment: SegmentName,
    /// The offset carried by the request.
    pub offset: u64,
}

impl RequestIdentity {
    /// Validate the identity fields of a request, before any coordination state is touched.
    pub fn extract(instance_id: Option<&str>, segment_name: Option<&str>, offset: i64) -> Result<Self, CompletionError> {
        let instance_id = match instance_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(CompletionError::MalformedRequest("request is missing required field instanceId".into())),
        };
        let segment = match segment_name {
            Some(name) if !name.is_empty() => name.parse::<SegmentName>()?,
            _ => return Err(CompletionError::MalformedRequest("request is missing required field segmentName".into())),
        };
        if offset < 0 {
            return Err(CompletionError::MalformedRequest(format!("request offset must be >= 0, got {}", offset)));
        }
        Ok(Self { instance_id, segment, offset: offset as u64 })
    }
}

fn offset_to_i64(val: u64) -> i64 {
    i64::try_from(val).unwrap_or(i64::MAX)
}

fn default_offset() -> i64 {
    UNSET_OFFSET
}
