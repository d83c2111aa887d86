//! Segment completion state machine.
//!
//! One `CompletionFsm` instance drives the completion protocol for a single named segment. The
//! machine is pure over injected instants: callers pass `now` with every event & perform all
//! I/O themselves, which keeps every transition deterministic & directly testable.
//!
//! ## Committer decision
//! While replicas consume, their reported positions are tracked as candidates. The first
//! replica to report strictly past the configured completion threshold is decided as the
//! committer on the spot. A replica reporting exactly at the threshold opens the decision
//! window instead; once every expected replica has reported or stopped, or once the decision
//! window expires, the best qualified candidate wins: highest offset first, ties broken by
//! lexically smallest instance id. A decision is write-once per attempt, cleared only by an
//! abort.
//!
//! ## Commit window
//! A notified committer works under a commit deadline, extendable up to a cap measured from the
//! instant the window was first armed. Every event handler re-checks the armed deadline against
//! the injected `now` before trusting the current state, so a lagging timer task can never
//! extend a committer's privilege.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::Config;
use crate::coordinator::deadline::{Deadline, DeadlineKind};
use crate::protocol::{CompletionResponse, CompletionStatus};
use crate::segment::SegmentName;

/// The lifecycle state of a segment commit context.
#[derive(Clone, Debug)]
pub enum ContextState {
    /// Replicas are consuming; no committer has been decided.
    Consuming,
    /// A committer has been decided but not yet notified.
    CommitterDecided(CommitAttempt),
    /// The committer has been notified & the commit window is armed.
    CommitterNotified(CommitAttempt),
    /// The committer has started the commit protocol.
    CommitterUploading(CommitAttempt),
    /// A segment was committed. Terminal.
    Committed(CommittedSegment),
    /// The last commit attempt failed or timed out; consuming resumes on the next report.
    Aborted,
}

/// A decided commit attempt: the committer & the offset at which it must commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitAttempt {
    /// The instance holding the commit privilege.
    pub committer: String,
    /// The offset at which the segment will be committed.
    pub offset: u64,
}

/// The durable outcome of a committed segment.
#[derive(Clone, Debug)]
pub struct CommittedSegment {
    /// The committed segment's name.
    pub segment: SegmentName,
    /// The offset at which the segment was committed.
    pub offset: u64,
    /// The canonical location of the committed segment.
    pub location: String,
    /// The instance which performed the commit.
    pub committer: String,
}

/// The machine's disposition of a commit-end event.
#[derive(Debug)]
pub enum CommitEndDisposition {
    /// The event is rejected; respond immediately.
    Reject(CompletionResponse),
    /// The segment was already committed by this committer; respond with the stored outcome.
    AlreadyCommitted(CompletionResponse),
    /// The commit is accepted pending activation of the staged segment.
    Accepted {
        /// The staged location to activate.
        location: String,
    },
}

/// The completion state machine for a single named segment.
pub struct CompletionFsm {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The segment whose completion this machine coordinates.
    segment: SegmentName,
    /// The current lifecycle state.
    state: ContextState,
    /// Offsets reported by actively consuming replicas, cleared when a committer is decided.
    candidate_offsets: BTreeMap<String, u64>,
    /// Replicas which have reported that they stopped consuming.
    ///
    /// Stopped replicas are excluded from candidacy but still count toward the all-reported
    /// decision shortcut, & the set survives aborted attempts.
    stopped: BTreeSet<String>,
    /// The deadline bounding the current phase, if armed.
    deadline: Option<Deadline>,
}

impl CompletionFsm {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, segment: SegmentName) -> Self {
        Self {
            config,
            segment,
            state: ContextState::Consuming,
            candidate_offsets: BTreeMap::new(),
            stopped: BTreeSet::new(),
            deadline: None,
        }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> &ContextState {
        &self.state
    }

    /// The deadline bounding the current phase, if armed.
    pub fn deadline(&self) -> Option<&Deadline> {
        self.deadline.as_ref()
    }

    /// The final outcome of this segment's completion, once committed.
    pub fn committed_segment(&self) -> Option<&CommittedSegment> {
        match &self.state {
            ContextState::Committed(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Handle a replica's report of its consuming position.
    pub fn segment_consumed(&mut self, now: Instant, instance_id: &str, offset: u64) -> CompletionResponse {
        self.enforce_deadline(now);

        if matches!(self.state, ContextState::Aborted) {
            // A fresh report re-opens consuming after a failed attempt.
            self.state = ContextState::Consuming;
        }

        match &self.state {
            ContextState::Consuming => self.record_and_evaluate(now, instance_id, offset),
            ContextState::CommitterDecided(attempt) if attempt.committer == instance_id && offset >= attempt.offset => {
                let attempt = attempt.clone();
                self.notify_committer(now, attempt)
            }
            _ => self.respond_post_decision(instance_id, offset),
        }
    }

    /// Handle a replica's report that it has stopped consuming.
    pub fn segment_stopped_consuming(&mut self, now: Instant, instance_id: &str, offset: u64, reason: &str) -> CompletionResponse {
        self.enforce_deadline(now);
        tracing::debug!(segment = %self.segment, instance = instance_id, offset, reason, "replica stopped consuming");

        if matches!(self.state, ContextState::Committed(_)) {
            return CompletionResponse::new(CompletionStatus::Processed);
        }
        if self.current_committer() == Some(instance_id) {
            self.stopped.insert(instance_id.to_string());
            self.abort_attempt("committer stopped consuming");
            return CompletionResponse::new(CompletionStatus::Processed);
        }

        self.candidate_offsets.remove(instance_id);
        self.stopped.insert(instance_id.to_string());
        if matches!(self.state, ContextState::Consuming) && self.all_reported() {
            if let Some((winner, winner_offset)) = self.best_qualified() {
                self.decide_pending(now, winner, winner_offset);
            }
        }
        CompletionResponse::new(CompletionStatus::Processed)
    }

    /// Handle a committer's request to begin the commit protocol.
    pub fn segment_commit_start(&mut self, now: Instant, instance_id: &str, offset: u64) -> CompletionResponse {
        self.enforce_deadline(now);
        match &self.state {
            ContextState::CommitterNotified(attempt) if attempt.committer == instance_id && attempt.offset == offset => {
                let attempt = attempt.clone();
                tracing::debug!(segment = %self.segment, committer = instance_id, offset, "commit protocol started");
                self.state = ContextState::CommitterUploading(attempt);
                CompletionResponse::with_offset(CompletionStatus::CommitContinue, offset)
            }
            // Replayed commit-starts are answered in place.
            ContextState::CommitterUploading(attempt) if attempt.committer == instance_id && attempt.offset == offset => {
                CompletionResponse::with_offset(CompletionStatus::CommitContinue, offset)
            }
            _ => {
                tracing::warn!(segment = %self.segment, instance = instance_id, offset, state = ?self.state, "rejecting commit-start");
                CompletionResponse::failed()
            }
        }
    }

    /// Handle a committer's request for more build time.
    pub fn extend_build_time(&mut self, now: Instant, instance_id: &str, offset: u64, extra_time_sec: i64) -> CompletionResponse {
        self.enforce_deadline(now);
        let authorized = match &self.state {
            ContextState::CommitterNotified(attempt) | ContextState::CommitterUploading(attempt) => {
                attempt.committer == instance_id && attempt.offset == offset
            }
            _ => false,
        };
        if !authorized {
            tracing::warn!(segment = %self.segment, instance = instance_id, offset, "rejecting build time extension");
            return CompletionResponse::failed();
        }

        // Non-positive requests fall back to the default commit window.
        let extra = if extra_time_sec <= 0 { self.config.commit_timeout_sec } else { extra_time_sec as u64 };
        let cap = Duration::from_secs(self.config.max_commit_time_sec);
        let deadline = match self.deadline.as_mut() {
            Some(deadline) => deadline,
            None => {
                tracing::error!(segment = %self.segment, "no commit deadline armed for an active commit attempt");
                return CompletionResponse::failed();
            }
        };
        match deadline.extend(now, Duration::from_secs(extra), cap) {
            Some(remaining) => {
                tracing::debug!(segment = %self.segment, committer = instance_id, remaining_sec = remaining.as_secs(), "commit window extended");
                CompletionResponse::new(CompletionStatus::Processed).build_time(remaining.as_secs())
            }
            None => {
                tracing::warn!(segment = %self.segment, committer = instance_id, "commit window extension cap exhausted");
                CompletionResponse::failed()
            }
        }
    }

    /// Handle a committer's final commit event.
    ///
    /// An accepted commit still depends on activation of the staged segment, which the caller
    /// performs; the attempt then concludes via `finish_commit` or `fail_commit`.
    pub fn segment_commit_end(&mut self, now: Instant, instance_id: &str, offset: u64, location: Option<String>, success: bool) -> CommitEndDisposition {
        self.enforce_deadline(now);

        if let ContextState::Committed(outcome) = &self.state {
            if outcome.committer == instance_id && outcome.offset == offset {
                let response = CompletionResponse::with_offset(CompletionStatus::Commit, outcome.offset).location(&outcome.location);
                return CommitEndDisposition::AlreadyCommitted(response);
            }
            tracing::warn!(segment = %self.segment, instance = instance_id, "rejecting commit-end for an already committed segment");
            return CommitEndDisposition::Reject(CompletionResponse::failed());
        }

        let authorized = match &self.state {
            ContextState::CommitterUploading(attempt) => attempt.committer == instance_id && attempt.offset == offset,
            _ => false,
        };
        if !authorized {
            tracing::warn!(segment = %self.segment, instance = instance_id, offset, state = ?self.state, "rejecting commit-end");
            return CommitEndDisposition::Reject(CompletionResponse::failed());
        }
        if !success {
            self.abort_attempt("committer reported an unsuccessful commit");
            return CommitEndDisposition::Reject(CompletionResponse::failed());
        }
        match location {
            Some(location) if !location.is_empty() => CommitEndDisposition::Accepted { location },
            _ => {
                self.abort_attempt("commit-end carried no staged segment location");
                CommitEndDisposition::Reject(CompletionResponse::failed())
            }
        }
    }

    /// Conclude the active commit attempt after successful activation of the staged segment.
    pub fn finish_commit(&mut self, location: String) -> CompletionResponse {
        let attempt = match &self.state {
            ContextState::CommitterUploading(attempt) => attempt.clone(),
            _ => {
                tracing::error!(segment = %self.segment, state = ?self.state, "commit finalization outside of an active upload");
                return CompletionResponse::failed();
            }
        };
        self.deadline = None;
        let outcome = CommittedSegment { segment: self.segment.clone(), offset: attempt.offset, location, committer: attempt.committer };
        tracing::info!(segment = %self.segment, committer = %outcome.committer, offset = outcome.offset, location = %outcome.location, "segment committed");
        let response = CompletionResponse::with_offset(CompletionStatus::Commit, outcome.offset).location(&outcome.location);
        self.state = ContextState::Committed(outcome);
        response
    }

    /// Conclude the active commit attempt after failed activation.
    pub fn fail_commit(&mut self) -> CompletionResponse {
        self.abort_attempt("segment activation failed");
        CompletionResponse::failed()
    }

    /// Handle expiry of the armed deadline.
    pub fn deadline_fired(&mut self, now: Instant) {
        self.enforce_deadline(now);
    }

    /// Apply any already-expired deadline before trusting the current state.
    fn enforce_deadline(&mut self, now: Instant) {
        let kind = match self.deadline.as_ref() {
            Some(deadline) if deadline.is_expired(now) => deadline.kind(),
            _ => return,
        };
        match kind {
            DeadlineKind::Decision => {
                if matches!(self.state, ContextState::CommitterDecided(_)) {
                    self.abort_attempt("decided committer never returned for notification");
                    return;
                }
                self.deadline = None;
                if matches!(self.state, ContextState::Consuming) {
                    match self.best_qualified() {
                        Some((winner, winner_offset)) => {
                            tracing::info!(segment = %self.segment, "decision window expired, forcing a committer decision");
                            self.decide_pending(now, winner, winner_offset);
                        }
                        None => tracing::debug!(segment = %self.segment, "decision window expired with no qualified candidate"),
                    }
                }
            }
            DeadlineKind::Commit => {
                if matches!(self.state, ContextState::CommitterNotified(_) | ContextState::CommitterUploading(_)) {
                    self.abort_attempt("commit window expired");
                    return;
                }
                self.deadline = None;
            }
        }
    }

    /// Record a consuming replica's report & evaluate the committer decision policy.
    fn record_and_evaluate(&mut self, now: Instant, instance_id: &str, offset: u64) -> CompletionResponse {
        self.stopped.remove(instance_id);
        self.candidate_offsets.insert(instance_id.to_string(), offset);

        // A report strictly past the threshold decides its reporter on the spot.
        if offset > self.config.completion_threshold {
            return self.decide_and_notify(now, instance_id.to_string(), offset);
        }

        // With every replica accounted for, the best qualified candidate wins.
        if self.all_reported() {
            if let Some((winner, winner_offset)) = self.best_qualified() {
                if winner == instance_id {
                    return self.decide_and_notify(now, winner, winner_offset);
                }
                self.decide_pending(now, winner, winner_offset);
                return self.respond_post_decision(instance_id, offset);
            }
        }

        if offset >= self.config.completion_threshold {
            // At the threshold: open the decision window & hold the replica nearby.
            if self.deadline.is_none() {
                tracing::debug!(segment = %self.segment, instance = instance_id, offset, "decision window opened");
                self.deadline = Some(Deadline::arm(DeadlineKind::Decision, now, Duration::from_secs(self.config.decision_timeout_sec)));
            }
            return CompletionResponse::new(CompletionStatus::Hold);
        }
        CompletionResponse::new(CompletionStatus::Keep)
    }

    /// Decide the given replica as committer & notify it within the same call.
    fn decide_and_notify(&mut self, now: Instant, committer: String, offset: u64) -> CompletionResponse {
        self.candidate_offsets.clear();
        let attempt = CommitAttempt { committer, offset };
        self.notify_committer(now, attempt)
    }

    /// Decide the given replica as committer; notification happens on its next report, bounded
    /// by a fresh decision window.
    fn decide_pending(&mut self, now: Instant, committer: String, offset: u64) {
        self.candidate_offsets.clear();
        tracing::info!(segment = %self.segment, committer = %committer, offset, "segment committer decided, awaiting notification");
        self.deadline = Some(Deadline::arm(DeadlineKind::Decision, now, Duration::from_secs(self.config.decision_timeout_sec)));
        self.state = ContextState::CommitterDecided(CommitAttempt { committer, offset });
    }

    /// Notify the committer of the given attempt & arm its commit window.
    fn notify_committer(&mut self, now: Instant, attempt: CommitAttempt) -> CompletionResponse {
        let deadline = Deadline::arm(DeadlineKind::Commit, now, Duration::from_secs(self.config.commit_timeout_sec));
        tracing::info!(
            segment = %self.segment, committer = %attempt.committer, offset = attempt.offset, commit_deadline = %deadline.expires_at_wall(now),
            "segment committer notified",
        );
        self.deadline = Some(deadline);
        let response = CompletionResponse::with_offset(CompletionStatus::Commit, attempt.offset);
        self.state = ContextState::CommitterNotified(attempt);
        response
    }

    /// Answer a consuming report once a decision or commit exists, without mutating state.
    fn respond_post_decision(&self, instance_id: &str, offset: u64) -> CompletionResponse {
        match &self.state {
            ContextState::CommitterDecided(attempt) | ContextState::CommitterNotified(attempt) | ContextState::CommitterUploading(attempt) => {
                if offset < attempt.offset {
                    CompletionResponse::with_offset(CompletionStatus::CatchUp, attempt.offset)
                } else if attempt.committer == instance_id {
                    CompletionResponse::with_offset(CompletionStatus::Commit, attempt.offset)
                } else {
                    CompletionResponse::new(CompletionStatus::Hold)
                }
            }
            ContextState::Committed(outcome) => {
                if offset < outcome.offset {
                    CompletionResponse::with_offset(CompletionStatus::CatchUp, outcome.offset).location(&outcome.location)
                } else {
                    CompletionResponse::new(CompletionStatus::Hold).location(&outcome.location)
                }
            }
            _ => CompletionResponse::new(CompletionStatus::Hold),
        }
    }

    /// Abort the active commit attempt; consuming resumes on the next report.
    fn abort_attempt(&mut self, reason: &str) {
        tracing::warn!(segment = %self.segment, state = ?self.state, reason, "aborting commit attempt");
        self.candidate_offsets.clear();
        self.deadline = None;
        self.state = ContextState::Aborted;
    }

    /// The committer of the active attempt, if any.
    fn current_committer(&self) -> Option<&str> {
        match &self.state {
            ContextState::CommitterDecided(attempt) | ContextState::CommitterNotified(attempt) | ContextState::CommitterUploading(attempt) => {
                Some(attempt.committer.as_str())
            }
            _ => None,
        }
    }

    /// Whether every expected replica has either reported a position or stopped.
    fn all_reported(&self) -> bool {
        self.candidate_offsets.len() + self.stopped.len() >= self.config.expected_replicas as usize
    }

    /// The best qualified candidate: the highest reported offset at or past the threshold.
    ///
    /// Candidates iterate in ascending id order & ties keep the first seen, which yields the
    /// lexically smallest instance id among equal offsets.
    fn best_qualified(&self) -> Option<(String, u64)> {
        let mut best: Option<(&String, u64)> = None;
        for (id, offset) in self.candidate_offsets.iter() {
            if *offset < self.config.completion_threshold {
                continue;
            }
            let better = match best {
                Some((_, best_offset)) => *offset > best_offset,
                None => true,
            };
            if better {
                best = Some((id, *offset));
            }
        }
        best.map(|(id, offset)| (id.clone(), offset))
    }
}
