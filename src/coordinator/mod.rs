//! Segment completion coordinator.
//!
//! The coordinator routes every completion protocol request to the commit context controller of
//! the request's named segment, creating controllers on demand & retiring them once their
//! segment commits. Requests for one segment are thereby handled strictly one at a time in
//! arrival order, while distinct segments proceed independently. Committed outcomes are kept in
//! an in-memory index for the life of the process, so replayed requests for committed segments
//! are answered without a live controller.

mod context;
pub mod deadline;
pub mod fsm;

use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::coordinator::context::{ContextCtl, ContextCtlMsg};
use crate::coordinator::fsm::CommittedSegment;
use crate::protocol::{
    CompletionResponse, CompletionStatus, ExtendBuildTimeRequest, RequestIdentity, SegmentCommitEndRequest, SegmentCommitRequest, SegmentCommitStartRequest,
    SegmentConsumedRequest, SegmentStoppedConsumingRequest, SegmentUploadRequest,
};
use crate::segment::SegmentName;
use crate::store::SegmentStore;

/// The capacity of commit context request channels.
const CONTEXT_CHANNEL_CAP: usize = 100;

pub(self) const METRIC_SEGMENTS_COMMITTED: &str = "varve_segments_committed";
pub(self) const METRIC_COMMIT_ATTEMPTS_ABORTED: &str = "varve_commit_attempts_aborted";
pub(self) const METRIC_ACTIVE_COMMIT_CONTEXTS: &str = "varve_active_commit_contexts";
pub(self) const METRIC_UPLOADS_STAGED: &str = "varve_segment_uploads_staged";

/// The segment completion coordinator.
///
/// This is a cheap handle to the coordinator; clones share the same underlying state.
#[derive(Clone)]
pub struct CompletionCoordinator {
    inner: Arc<CoordinatorInner>,
}

/// Coordinator state shared across handles & commit context controllers.
struct CoordinatorInner {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The segment store used for staging & activating segment payloads.
    store: SegmentStore,
    /// A map of live commit contexts, keyed by rendered segment name.
    contexts: DashMap<String, ContextHandle>,
    /// An index of committed segment outcomes, keyed by rendered segment name.
    committed: DashMap<String, CommittedSegment>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
}

/// A handle to a live commit context controller.
struct ContextHandle {
    /// The context's request channel.
    tx: mpsc::Sender<ContextCtlMsg>,
    /// The context's join handle.
    handle: JoinHandle<Result<()>>,
}

impl CompletionCoordinator {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, store: SegmentStore) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        metrics::register_counter!(METRIC_SEGMENTS_COMMITTED, metrics::Unit::Count, "the number of segments committed by this coordinator");
        metrics::register_counter!(METRIC_COMMIT_ATTEMPTS_ABORTED, metrics::Unit::Count, "the number of commit attempts aborted before completion");
        metrics::register_counter!(METRIC_UPLOADS_STAGED, metrics::Unit::Count, "the number of segment payloads staged for activation");
        metrics::register_gauge!(METRIC_ACTIVE_COMMIT_CONTEXTS, metrics::Unit::Count, "the number of live commit contexts");
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                store,
                contexts: DashMap::new(),
                committed: DashMap::new(),
                shutdown_tx,
            }),
        }
    }

    /// Handle a replica's report of its consuming position on a segment.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub async fn segment_consumed(&self, req: SegmentConsumedRequest) -> CompletionResponse {
        let identity = match RequestIdentity::extract(req.instance_id.as_deref(), req.segment_name.as_deref(), req.offset) {
            Ok(identity) => identity,
            Err(err) => {
                tracing::warn!(error = ?err, "malformed segmentConsumed request");
                return CompletionResponse::failed();
            }
        };
        let reason = req.reason.unwrap_or_default();
        let RequestIdentity { instance_id, segment, offset } = identity;
        self.dispatch(
            &segment,
            |tx| ContextCtlMsg::Consumed { tx, instance_id: instance_id.clone(), offset, reason: reason.clone() },
            |outcome| {
                if offset < outcome.offset {
                    CompletionResponse::with_offset(CompletionStatus::CatchUp, outcome.offset).location(&outcome.location)
                } else {
                    CompletionResponse::new(CompletionStatus::Hold).location(&outcome.location)
                }
            },
        )
        .await
    }

    /// Handle a replica's report that it has stopped consuming its partition.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub async fn segment_stopped_consuming(&self, req: SegmentStoppedConsumingRequest) -> CompletionResponse {
        let identity = match RequestIdentity::extract(req.instance_id.as_deref(), req.segment_name.as_deref(), req.offset) {
            Ok(identity) => identity,
            Err(err) => {
                tracing::warn!(error = ?err, "malformed segmentStoppedConsuming request");
                return CompletionResponse::failed();
            }
        };
        let reason = req.reason.unwrap_or_default();
        let RequestIdentity { instance_id, segment, offset } = identity;
        self.dispatch(
            &segment,
            |tx| ContextCtlMsg::StoppedConsuming { tx, instance_id: instance_id.clone(), offset, reason: reason.clone() },
            |_outcome| CompletionResponse::new(CompletionStatus::Processed),
        )
        .await
    }

    /// Handle a committer's request to begin the commit protocol for its segment.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub async fn segment_commit_start(&self, req: SegmentCommitStartRequest) -> CompletionResponse {
        let identity = match RequestIdentity::extract(req.instance_id.as_deref(), req.segment_name.as_deref(), req.offset) {
            Ok(identity) => identity,
            Err(err) => {
                tracing::warn!(error = ?err, "malformed segmentCommitStart request");
                return CompletionResponse::failed();
            }
        };
        tracing::debug!(
            segment = %identity.segment, instance = %identity.instance_id, build_time_millis = req.build_time_millis, wait_time_millis = req.wait_time_millis,
            segment_size_bytes = req.segment_size_bytes, num_rows = req.num_rows, "commit protocol starting",
        );
        let RequestIdentity { instance_id, segment, offset } = identity;
        self.dispatch(
            &segment,
            |tx| ContextCtlMsg::CommitStart { tx, instance_id: instance_id.clone(), offset },
            |_outcome| CompletionResponse::failed(),
        )
        .await
    }

    /// Handle a committer's request for more build time on its active commit attempt.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub async fn extend_build_time(&self, req: ExtendBuildTimeRequest) -> CompletionResponse {
        let identity = match RequestIdentity::extract(req.instance_id.as_deref(), req.segment_name.as_deref(), req.offset) {
            Ok(identity) => identity,
            Err(err) => {
                tracing::warn!(error = ?err, "malformed extendBuildTime request");
                return CompletionResponse::failed();
            }
        };
        let RequestIdentity { instance_id, segment, offset } = identity;
        let extra_time_sec = req.extra_time_sec;
        self.dispatch(
            &segment,
            |tx| ContextCtlMsg::ExtendBuildTime { tx, instance_id: instance_id.clone(), offset, extra_time_sec },
            |_outcome| CompletionResponse::failed(),
        )
        .await
    }

    /// Handle a committer's final commit event for its built segment.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub async fn segment_commit_end(&self, req: SegmentCommitEndRequest) -> CompletionResponse {
        let identity = match RequestIdentity::extract(req.instance_id.as_deref(), req.segment_name.as_deref(), req.offset) {
            Ok(identity) => identity,
            Err(err) => {
                tracing::warn!(error = ?err, "malformed segmentCommitEnd request");
                return CompletionResponse::failed();
            }
        };
        tracing::debug!(
            segment = %identity.segment, instance = %identity.instance_id, success = req.success, is_split_commit = req.is_split_commit,
            build_time_millis = req.build_time_millis, segment_size_bytes = req.segment_size_bytes, "commit protocol concluding",
        );
        let RequestIdentity { instance_id, segment, offset } = identity;
        let (location, success) = (req.segment_location, req.success);
        self.dispatch(
            &segment,
            |tx| ContextCtlMsg::CommitEnd { tx, instance_id: instance_id.clone(), offset, location: location.clone(), success },
            |outcome| {
                if outcome.committer == instance_id && outcome.offset == offset {
                    CompletionResponse::with_offset(CompletionStatus::Commit, outcome.offset).location(&outcome.location)
                } else {
                    CompletionResponse::failed()
                }
            },
        )
        .await
    }

    /// Handle a replica's request to stage a built segment payload ahead of a split commit.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub async fn segment_upload(&self, req: SegmentUploadRequest) -> CompletionResponse {
        let identity = match RequestIdentity::extract(req.instance_id.as_deref(), req.segment_name.as_deref(), req.offset) {
            Ok(identity) => identity,
            Err(err) => {
                tracing::warn!(error = ?err, "malformed segmentUpload request");
                return CompletionResponse::failed();
            }
        };
        match self.inner.store.stage_split_upload(&identity.segment, &req.payload).await {
            Ok(staged) => {
                metrics::increment_counter!(METRIC_UPLOADS_STAGED);
                CompletionResponse::with_offset(CompletionStatus::UploadSuccess, identity.offset).location(staged)
            }
            Err(err) => {
                tracing::error!(error = ?err, segment = %identity.segment, "error staging uploaded segment payload");
                CompletionResponse::failed()
            }
        }
    }

    /// Handle a committer's inline commit request, equivalent to the split commit protocol
    /// performed as one operation.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub async fn segment_commit(&self, req: SegmentCommitRequest) -> CompletionResponse {
        let identity = match RequestIdentity::extract(req.instance_id.as_deref(), req.segment_name.as_deref(), req.offset) {
            Ok(identity) => identity,
            Err(err) => {
                tracing::warn!(error = ?err, "malformed segmentCommit request");
                return CompletionResponse::failed();
            }
        };
        let RequestIdentity { instance_id, segment, offset } = identity;
        let res = self
            .dispatch(
                &segment,
                |tx| ContextCtlMsg::CommitStart { tx, instance_id: instance_id.clone(), offset },
                |_outcome| CompletionResponse::failed(),
            )
            .await;
        if res.status != CompletionStatus::CommitContinue {
            return res;
        }
        // A staging failure concludes the attempt as an unsuccessful commit; the context is
        // then free to elect a new committer.
        let staged = match self.inner.store.stage_inline_upload(&segment, &req.payload).await {
            Ok(staged) => staged,
            Err(err) => {
                tracing::error!(error = ?err, segment = %segment, "error staging inline segment payload");
                return self
                    .dispatch(
                        &segment,
                        |tx| ContextCtlMsg::CommitEnd { tx, instance_id: instance_id.clone(), offset, location: None, success: false },
                        |_outcome| CompletionResponse::failed(),
                    )
                    .await;
            }
        };
        metrics::increment_counter!(METRIC_UPLOADS_STAGED);
        self.dispatch(
            &segment,
            |tx| ContextCtlMsg::CommitEnd { tx, instance_id: instance_id.clone(), offset, location: Some(staged.clone()), success: true },
            |outcome| {
                if outcome.committer == instance_id && outcome.offset == offset {
                    CompletionResponse::with_offset(CompletionStatus::Commit, outcome.offset).location(&outcome.location)
                } else {
                    CompletionResponse::failed()
                }
            },
        )
        .await
    }

    /// The committed outcome for the given segment, if any.
    pub fn committed_segment(&self, segment: &SegmentName) -> Option<CommittedSegment> {
        self.inner.committed.get(&segment.to_string()).map(|outcome| outcome.value().clone())
    }

    /// Trigger a graceful shutdown, draining all live commit contexts.
    ///
    /// Contexts retiring mid-drain open their successor's context, which may subscribe after
    /// the shutdown signal was sent; the drain loops until no live context remains, closing
    /// each context's request channel so late subscribers unblock all the same.
    pub async fn shutdown(&self) {
        let _res = self.inner.shutdown_tx.send(());
        loop {
            let keys: Vec<_> = self.inner.contexts.iter().map(|ctx| ctx.key().clone()).collect();
            if keys.is_empty() {
                return;
            }
            for key in keys {
                let handle = match self.inner.contexts.remove(&key) {
                    Some((_, handle)) => handle,
                    None => continue,
                };
                drop(handle.tx);
                if let Err(err) = handle.handle.await.context("error joining commit context controller").and_then(|res| res) {
                    tracing::error!(error = ?err, segment = %key, "error shutting down commit context controller");
                }
            }
        }
    }

    /// Dispatch a request message to the live commit context of the given segment, answering
    /// from the committed index once the segment has committed.
    async fn dispatch<M, T>(&self, segment: &SegmentName, mut msg: M, terminal: T) -> CompletionResponse
    where
        M: FnMut(oneshot::Sender<CompletionResponse>) -> ContextCtlMsg,
        T: Fn(&CommittedSegment) -> CompletionResponse,
    {
        let key = segment.to_string();
        // A send may race its context retiring after a commit; the retry then lands on the
        // committed index or on a fresh context.
        for _ in 0..2 {
            if let Some(outcome) = self.inner.committed.get(&key) {
                return terminal(outcome.value());
            }
            let tx = self.inner.ensure_context(segment);
            let (res_tx, res_rx) = oneshot::channel();
            if tx.send(msg(res_tx)).await.is_err() {
                continue;
            }
            match res_rx.await {
                Ok(res) => return res,
                Err(_) => continue,
            }
        }
        tracing::warn!(segment = %key, "commit context unavailable for request dispatch");
        CompletionResponse::failed()
    }
}

impl CoordinatorInner {
    /// Get a handle to the live commit context of the given segment, creating it as needed.
    fn ensure_context(self: &Arc<Self>, segment: &SegmentName) -> mpsc::Sender<ContextCtlMsg> {
        let entry = self.contexts.entry(segment.to_string()).or_insert_with(|| {
            tracing::debug!(segment = %segment, "opening commit context");
            let (tx, rx) = mpsc::channel(CONTEXT_CHANNEL_CAP);
            let ctl = ContextCtl::new(self.config.clone(), self.store.clone(), self.clone(), segment.clone(), rx, self.shutdown_tx.subscribe());
            ContextHandle { tx, handle: ctl.spawn() }
        });
        let tx = entry.value().tx.clone();
        drop(entry);
        metrics::gauge!(METRIC_ACTIVE_COMMIT_CONTEXTS, self.contexts.len() as f64);
        tx
    }

    /// Record a committed segment outcome, open the context of the successor sequence so
    /// consuming continues without a gap, & retire the committed context.
    ///
    /// The outcome is indexed before the context handle is dropped, so a request racing the
    /// retirement always finds one of the two. The successor opens before the handle is
    /// dropped as well, so a shutdown drain observing no live contexts cannot have missed a
    /// successor still being opened.
    fn handle_context_committed(self: &Arc<Self>, segment: &SegmentName, outcome: CommittedSegment) {
        let key = segment.to_string();
        self.committed.insert(key.clone(), outcome);
        let _tx = self.ensure_context(&segment.next());
        if self.contexts.remove(&key).is_some() {
            metrics::gauge!(METRIC_ACTIVE_COMMIT_CONTEXTS, self.contexts.len() as f64);
        }
        metrics::increment_counter!(METRIC_SEGMENTS_COMMITTED);
        tracing::debug!(segment = %key, "commit context retired");
    }
}
