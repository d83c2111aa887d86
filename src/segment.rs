//! Segment naming & identity.

use std::fmt;
use std::str::FromStr;

use crate::error::CompletionError;

/// The separator between the components of a rendered segment name.
const NAME_SEPARATOR: &str = "__";

/// The identity of one segment of a stream partition.
///
/// Rendered as `{table}__{partition}__{sequence}`. Names order by table, then partition, then
/// sequence, which keeps directory listings & index scans in commit order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentName {
    /// The name of the table to which this segment belongs.
    pub table: String,
    /// The stream partition from which this segment's data was consumed.
    pub partition: u32,
    /// The sequence number of this segment within its partition.
    pub sequence: u64,
}

impl SegmentName {
    /// Construct a new instance.
    pub fn new(table: impl Into<String>, partition: u32, sequence: u64) -> Self {
        Self { table: table.into(), partition, sequence }
    }

    /// The name of the segment which follows this one in its partition.
    pub fn next(&self) -> Self {
        Self { table: self.table.clone(), partition: self.partition, sequence: self.sequence + 1 }
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}{}{}", self.table, NAME_SEPARATOR, self.partition, NAME_SEPARATOR, self.sequence)
    }
}

impl FromStr for SegmentName {
    type Err = CompletionError;

    /// Parse a rendered segment name.
    ///
    /// The partition & sequence components are taken from the right, so table names containing
    /// the separator still parse unambiguously.
    fn from_str(val: &str) -> Result<Self, Self::Err> {
        let malformed = || CompletionError::MalformedRequest(format!("invalid segment name, expected `table__partition__sequence`, got `{}`", val));
        let mut parts = val.rsplitn(3, NAME_SEPARATOR);
        let sequence = parts.next().and_then(|part| part.parse::<u64>().ok()).ok_or_else(malformed)?;
        let partition = parts.next().and_then(|part| part.parse::<u32>().ok()).ok_or_else(malformed)?;
        let table = parts.next().filter(|part| !part.is_empty()).ok_or_else(malformed)?;
        Ok(Self { table: table.to_string(), partition, sequence })
    }
}
