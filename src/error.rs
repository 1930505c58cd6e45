//! Crate-wide error type.
//!
//! Mirrors the hand-rolled `Error` enum style used throughout this codebase's
//! mmap/segment layers rather than a blanket `anyhow::Error`: every fatal
//! condition named in the component design gets its own variant so callers
//! and tests can match on it instead of parsing strings.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    /// Any filesystem or mmap failure. Always fatal.
    Io(io::Error),
    /// A reattach observed a descriptor or imp template that disagrees with
    /// the caller's. Fatal.
    DescriptorMismatch(&'static str),
    /// A read went past the segment's published element count.
    ReadPastPublished { requested: u64, published: u64 },
    /// The caller invoked a write-only API without holding the lease, or a
    /// non-write API while holding it.
    WriteLeaseHeld,
    /// `wrt_get` found the lease already held by another attacher. Recoverable.
    WriteLeaseContended,
    /// Level index outside the fixed [0, 2] range.
    InvalidLevel(u8),
    /// The storage root is missing its `stg` marker file.
    MissingMarker,
    /// The index table has no room for another block.
    IndexFull { capacity: u64 },
    /// A write-lease commit would publish past the segment's max element count.
    SegmentFull { capacity: u64 },
    /// An append or update time moved backwards.
    NonMonotonicTime { previous: i64, next: i64 },
    /// A chosen heatmap anchor fell below half the row count.
    AnchorBelowHalf { anchor: i64, k: u32 },
    /// Metadata bytes failed a structural or checksum check.
    CorruptMetadata(&'static str),
    /// Initial-mode `add` named a tick the engine already knows about.
    DuplicateTick(i64),
    /// A streaming-mode update's time fell outside `[max_observed, end_of_acceptance)`.
    UpdateOutsideAcceptanceWindow { time: i64, max_observed: i64, end_of_acceptance: i64 },
    /// A streaming-mode update did not strictly advance its own tick's latest update time.
    StaleTickUpdate { tick: i64, time: i64, latest: i64 },
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::DescriptorMismatch(what) => write!(f, "descriptor mismatch: {what}"),
            Error::ReadPastPublished { requested, published } => {
                write!(f, "read past published: requested {requested}, published {published}")
            }
            Error::WriteLeaseHeld => write!(f, "write lease held"),
            Error::WriteLeaseContended => write!(f, "write lease already held by another attacher"),
            Error::InvalidLevel(l) => write!(f, "invalid level: {l}"),
            Error::MissingMarker => write!(f, "storage root missing 'stg' marker file"),
            Error::IndexFull { capacity } => write!(f, "index table full at capacity {capacity}"),
            Error::SegmentFull { capacity } => write!(f, "segment write would exceed capacity {capacity}"),
            Error::NonMonotonicTime { previous, next } => {
                write!(f, "non-monotonic time: previous {previous}, next {next}")
            }
            Error::AnchorBelowHalf { anchor, k } => {
                write!(f, "anchor {anchor} below half of row count {k}")
            }
            Error::CorruptMetadata(what) => write!(f, "corrupt metadata: {what}"),
            Error::DuplicateTick(tick) => write!(f, "initial-mode add named already-known tick {tick}"),
            Error::UpdateOutsideAcceptanceWindow { time, max_observed, end_of_acceptance } => write!(
                f,
                "update time {time} outside acceptance window [{max_observed}, {end_of_acceptance})"
            ),
            Error::StaleTickUpdate { tick, time, latest } => write!(
                f,
                "update time {time} for tick {tick} does not advance past its latest update time {latest}"
            ),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
