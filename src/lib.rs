//! Realtime segment completion coordination & segment store tooling.
//!
//! Multiple independent replicas consume the same partition of an append-only stream and
//! periodically build candidate segments from what they have consumed. This crate coordinates
//! those replicas so that exactly one immutable segment is committed per partition sequence, at
//! an offset every replica can agree on, even though replicas lag, crash and retry mid-protocol.
//!
//! The [`coordinator::CompletionCoordinator`] is the entrypoint for the completion protocol. It
//! owns one lightweight controller task per live segment name, which serializes all events for
//! that segment and drives its completion state machine. The [`store::SegmentStore`] handles
//! staged segment uploads and their atomic activation. The [`store::convert`] module provides
//! offline conversion of legacy segment directory layouts, exposed via the `segment-converter`
//! binary.

pub mod config;
pub mod coordinator;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod protocol;
pub mod segment;
pub mod store;

pub use crate::config::Config;
pub use crate::coordinator::CompletionCoordinator;
pub use crate::protocol::{CompletionResponse, CompletionStatus};
pub use crate::segment::SegmentName;
pub use crate::store::SegmentStore;
