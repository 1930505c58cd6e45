//! Storage and reconstruction core for a market-data archive: memory-mapped
//! append-only segments, a per-`venue/instrument/level` time-series index
//! built on top of them, and an incremental level-1 heatmap/bid-ask engine
//! reconstructed from a block's tick stream.
//!
//! Out of scope for this crate (left as collaborators defined only by the
//! contracts in `storage`/`history`): currency/venue/instrument registries,
//! order/wallet bookkeeping, the broker plug adapter, and the provider glue
//! that multiplexes read streams across instruments.

pub mod config;
pub mod dr1;
pub mod error;
pub mod history;
pub mod mmap;
pub mod obs;
pub mod segment;
pub mod storage;

pub use config::{LevelParams, StorageConfig};
pub use dr1::DataReconstructor;
pub use error::{Error, Result};
pub use history::{History, HistoryConfig};
pub use obs::Obs;
pub use segment::{Segment, SegmentTemplate};
pub use storage::{Block, Index, Storage};
