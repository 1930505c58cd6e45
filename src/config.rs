//! Typed configuration for the storage tree.
//!
//! There is no environment-variable or config-file layer: the filesystem
//! root and a production/test scale selector are the whole configuration
//! surface, passed in explicitly by the caller.

use std::path::PathBuf;

/// Per-level fixed parameters (row/index capacities scale with `test_scale`).
#[derive(Clone, Copy, Debug)]
pub struct LevelParams {
    pub elem_sizes: &'static [u8],
    pub block_rows_max: u64,
    pub index_capacity: u64,
    pub obs_region: bool,
}

pub const LEVEL_COUNT: usize = 3;

const PROD_BLOCK_ROWS: [u64; LEVEL_COUNT] = [1 << 19, 1 << 26, 1 << 26];
const TEST_BLOCK_ROWS: [u64; LEVEL_COUNT] = [3, 3, 3];
const PROD_INDEX_CAPACITY: u64 = 22_000;
const TEST_INDEX_CAPACITY: u64 = 2_000;

const LEVEL0_ARRAYS: [u8; 5] = [8, 8, 8, 8, 8]; // time, bid, ask, avg, vol
const LEVEL1_ARRAYS: [u8; 3] = [8, 8, 8]; // time, price, vol
const LEVEL2_ARRAYS: [u8; 6] = [8, 8, 8, 1, 8, 8]; // time, order_id, trade_id, type, price, vol

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub test_scale: bool,
}

impl StorageConfig {
    pub fn production(root: impl Into<PathBuf>) -> Self {
        StorageConfig { root: root.into(), test_scale: false }
    }

    pub fn test(root: impl Into<PathBuf>) -> Self {
        StorageConfig { root: root.into(), test_scale: true }
    }

    pub fn level_params(&self, level: u8) -> Option<LevelParams> {
        let idx = level as usize;
        if idx >= LEVEL_COUNT {
            return None;
        }
        let block_rows_max = if self.test_scale { TEST_BLOCK_ROWS[idx] } else { PROD_BLOCK_ROWS[idx] };
        let index_capacity = if self.test_scale { TEST_INDEX_CAPACITY } else { PROD_INDEX_CAPACITY };
        let elem_sizes: &'static [u8] = match idx {
            0 => &LEVEL0_ARRAYS,
            1 => &LEVEL1_ARRAYS,
            _ => &LEVEL2_ARRAYS,
        };
        Some(LevelParams { elem_sizes, block_rows_max, index_capacity, obs_region: idx >= 1 })
    }
}
