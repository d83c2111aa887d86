//! Commit context controller.
//!
//! One controller owns the completion lifecycle of a single named segment. Every request
//! targeting that segment is funneled through the controller's channel, which serializes all
//! coordination per segment name without locks. The controller drives the completion state
//! machine, performs staged segment activation when a commit concludes, enforces the armed
//! deadline even when no requests arrive, and retires itself once the segment is committed.

use std::sync::Arc;

use anyhow::Result;
use futures::prelude::*;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::config::Config;
use crate::coordinator::deadline::Deadline;
use crate::coordinator::fsm::{CommitEndDisposition, CompletionFsm, ContextState};
use crate::coordinator::{CoordinatorInner, METRIC_COMMIT_ATTEMPTS_ABORTED};
use crate::protocol::CompletionResponse;
use crate::segment::SegmentName;
use crate::store::SegmentStore;

/// A controller encapsulating the completion lifecycle of a single named segment.
pub struct ContextCtl {
    /// The segment whose completion this controller coordinates.
    segment: SegmentName,
    /// The completion state machine for the segment.
    fsm: CompletionFsm,
    /// The segment store used for activating staged uploads.
    store: SegmentStore,
    /// A handle to the coordinator, used to publish the outcome when this context retires.
    coordinator: Arc<CoordinatorInner>,

    /// A channel of inbound completion requests for the segment.
    requests_rx: ReceiverStream<ContextCtlMsg>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl ContextCtl {
    /// Create a new instance.
    pub fn new(
        config: Arc<Config>, store: SegmentStore, coordinator: Arc<CoordinatorInner>, segment: SegmentName, requests_rx: mpsc::Receiver<ContextCtlMsg>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let fsm = CompletionFsm::new(config, segment.clone());
        Self {
            segment,
            fsm,
            store,
            coordinator,
            requests_rx: ReceiverStream::new(requests_rx),
            shutdown_rx: BroadcastStream::new(shutdown_rx),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("commit context controller {} has started", self.segment);

        loop {
            let deadline = self.fsm.deadline().map(Deadline::expires_at);
            tokio::select! {
                msg_opt = self.requests_rx.next() => match msg_opt {
                    Some(msg) => self.handle_ctl_msg(msg).await,
                    None => break,
                },
                _ = wait_deadline(deadline) => self.handle_deadline_fired(),
                _ = self.shutdown_rx.next() => break,
            }
            if matches!(self.fsm.state(), ContextState::Committed(_)) {
                self.retire().await;
                break;
            }
        }

        tracing::debug!("commit context controller {} has shutdown", self.segment);
        Ok(())
    }

    /// Handle a context controller message.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    async fn handle_ctl_msg(&mut self, msg: ContextCtlMsg) {
        let now = Instant::now();
        let was_aborted = matches!(self.fsm.state(), ContextState::Aborted);
        match msg {
            ContextCtlMsg::Consumed { tx, instance_id, offset, reason } => {
                tracing::debug!(segment = %self.segment, instance = %instance_id, offset, reason = %reason, "segment consumed report");
                let res = self.fsm.segment_consumed(now, &instance_id, offset);
                let _res = tx.send(res);
            }
            ContextCtlMsg::StoppedConsuming { tx, instance_id, offset, reason } => {
                let res = self.fsm.segment_stopped_consuming(now, &instance_id, offset, &reason);
                let _res = tx.send(res);
            }
            ContextCtlMsg::CommitStart { tx, instance_id, offset } => {
                let res = self.fsm.segment_commit_start(now, &instance_id, offset);
                let _res = tx.send(res);
            }
            ContextCtlMsg::ExtendBuildTime { tx, instance_id, offset, extra_time_sec } => {
                let res = self.fsm.extend_build_time(now, &instance_id, offset, extra_time_sec);
                let _res = tx.send(res);
            }
            ContextCtlMsg::CommitEnd { tx, instance_id, offset, location, success } => self.handle_commit_end(tx, instance_id, offset, location, success).await,
        }
        if !was_aborted && matches!(self.fsm.state(), ContextState::Aborted) {
            metrics::increment_counter!(METRIC_COMMIT_ATTEMPTS_ABORTED);
        }
    }

    /// Handle a committer's commit-end event, activating the staged segment on acceptance.
    #[tracing::instrument(level = "trace", skip(self, tx, location, success))]
    async fn handle_commit_end(&mut self, tx: oneshot::Sender<CompletionResponse>, instance_id: String, offset: u64, location: Option<String>, success: bool) {
        let staged = match self.fsm.segment_commit_end(Instant::now(), &instance_id, offset, location, success) {
            CommitEndDisposition::Reject(res) | CommitEndDisposition::AlreadyCommitted(res) => {
                let _res = tx.send(res);
                return;
            }
            CommitEndDisposition::Accepted { location } => location,
        };
        let res = match self.store.activate(&self.segment, &staged).await {
            Ok(canonical) => self.fsm.finish_commit(canonical),
            Err(err) => {
                tracing::error!(error = ?err, segment = %self.segment, "error activating staged segment");
                self.fsm.fail_commit()
            }
        };
        let _res = tx.send(res);
    }

    /// Handle expiry of the armed deadline.
    #[tracing::instrument(level = "trace", skip(self))]
    fn handle_deadline_fired(&mut self) {
        let was_aborted = matches!(self.fsm.state(), ContextState::Aborted);
        self.fsm.deadline_fired(Instant::now());
        if !was_aborted && matches!(self.fsm.state(), ContextState::Aborted) {
            metrics::increment_counter!(METRIC_COMMIT_ATTEMPTS_ABORTED);
        }
    }

    /// Publish the committed outcome & drain any queued requests before this controller exits.
    ///
    /// The outcome is published before the channel closes, so any request which raced the
    /// retirement either drains here or is re-routed by the coordinator to the committed index.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn retire(&mut self) {
        let outcome = match self.fsm.committed_segment() {
            Some(outcome) => outcome.clone(),
            None => return,
        };
        self.coordinator.handle_context_committed(&self.segment, outcome);
        self.requests_rx.close();
        while let Some(msg) = self.requests_rx.next().await {
            self.handle_ctl_msg(msg).await;
        }
    }
}

/// A message bound for a commit context controller.
pub enum ContextCtlMsg {
    /// A replica reported its consuming position on the segment.
    Consumed {
        tx: oneshot::Sender<CompletionResponse>,
        instance_id: String,
        offset: u64,
        reason: String,
    },
    /// A replica reported that it stopped consuming the segment.
    StoppedConsuming {
        tx: oneshot::Sender<CompletionResponse>,
        instance_id: String,
        offset: u64,
        reason: String,
    },
    /// The decided committer opened the commit protocol.
    CommitStart {
        tx: oneshot::Sender<CompletionResponse>,
        instance_id: String,
        offset: u64,
    },
    /// The decided committer asked for more build time.
    ExtendBuildTime {
        tx: oneshot::Sender<CompletionResponse>,
        instance_id: String,
        offset: u64,
        extra_time_sec: i64,
    },
    /// The decided committer concluded its commit attempt.
    CommitEnd {
        tx: oneshot::Sender<CompletionResponse>,
        instance_id: String,
        offset: u64,
        location: Option<String>,
        success: bool,
    },
}

/// Wait for the given deadline, pending forever when no deadline is armed.
async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}
