//! The time-series index: a segment holding one `(start_time, end_time)`
//! entry per block, plus the process-local map of currently attached blocks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{LevelParams, StorageConfig};
use crate::error::{Error, Result};
use crate::obs::Obs;
use crate::segment::{Segment, SegmentTemplate};
use crate::storage::block::Block;

const START_TIME_STRIDE: u8 = 8;
const END_TIME_STRIDE: u8 = 8;

struct LoadedBlock {
    block: Block,
    refcount: u64,
}

/// A single level's index directory: `<root>/<venue>/<instrument>/<level>/`.
pub struct Index {
    dir: PathBuf,
    level: u8,
    params: LevelParams,
    segment: Segment,
    blocks: HashMap<u64, LoadedBlock>,
    writer_key: u64,
}

impl Index {
    pub fn open(config: &StorageConfig, dir: PathBuf, level: u8) -> Result<Self> {
        let params = config.level_params(level).ok_or_else(|| {
            log::error!("invalid level {level}");
            Error::InvalidLevel(level)
        })?;
        std::fs::create_dir_all(&dir)?;
        let seg_path = dir.join("index");
        let template = SegmentTemplate {
            elm_max: params.index_capacity,
            region_sizes: &[],
            elem_sizes: &[START_TIME_STRIDE, END_TIME_STRIDE],
            imp: b"IDX",
        };
        let segment = Segment::attach(&seg_path, &template)?;
        Ok(Index {
            dir,
            level,
            params,
            segment,
            blocks: HashMap::new(),
            writer_key: quanta::Clock::new().raw(),
        })
    }

    pub fn entry_count(&self) -> u64 {
        self.segment.published()
    }

    /// The nonce callers must present to [`Index::append`]. Guards against a
    /// stale handle from a previous open mutating an index concurrently with
    /// its current owner.
    pub fn writer_key(&self) -> u64 {
        self.writer_key
    }

    fn entry(&self, i: u64) -> Result<(i64, i64)> {
        let ptrs = self.segment.red_rng(i, 1)?;
        unsafe {
            let start = (ptrs[0] as *const i64).read();
            let end = (ptrs[1] as *const i64).read();
            Ok((start, end))
        }
    }

    /// Smallest block index `i` such that `entry[i].end_time >= t`, per the
    /// storage variant where a gap between blocks resolves to the successor.
    pub fn search(&self, t: i64) -> Result<Option<u64>> {
        let n = self.entry_count();
        if n == 0 {
            return Ok(None);
        }
        let (first_start, _) = self.entry(0)?;
        let (_, last_end) = self.entry(n - 1)?;
        if t < first_start {
            return Ok(Some(0));
        }
        if t > last_end {
            return Ok(None);
        }
        let mut lo = 0u64;
        let mut hi = n - 1;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (_, end) = self.entry(mid)?;
            if end >= t {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(Some(lo))
    }

    fn load(&mut self, i: u64) -> Result<()> {
        if let Some(loaded) = self.blocks.get_mut(&i) {
            loaded.refcount += 1;
            return Ok(());
        }
        let block = Block::attach(&self.dir, self.level, i, self.params)?;
        self.blocks.insert(i, LoadedBlock { block, refcount: 1 });
        Ok(())
    }

    pub fn unload(&mut self, i: u64) {
        if let Some(loaded) = self.blocks.get_mut(&i) {
            loaded.refcount = loaded.refcount.saturating_sub(1);
            if loaded.refcount == 0 {
                self.blocks.remove(&i);
            }
        }
    }

    pub fn block(&mut self, i: u64) -> Result<&mut Block> {
        self.load(i)?;
        Ok(&mut self.blocks.get_mut(&i).expect("just loaded").block)
    }

    /// Appends `times` paired with one column per fixed array (already laid
    /// out in per-level order) to the trailing block, creating new blocks
    /// and index entries as rows spill past the current block's capacity.
    /// `writer_key` must match this index's own; the single-writer
    /// discipline it encodes is what makes the in-place `end_time` update
    /// below safe without taking the block's own write lease.
    pub fn append(&mut self, writer_key: u64, times: &[i64], columns: &[&[u8]]) -> Result<()> {
        if writer_key != self.writer_key {
            log::error!("append called with a stale writer key");
            return Err(Error::WriteLeaseHeld);
        }
        if times.is_empty() {
            return Ok(());
        }
        let strides: Vec<usize> = self.params.elem_sizes.iter().map(|&s| s as usize).collect();
        let mut row = 0usize;
        while row < times.len() {
            let n = self.entry_count();
            let (block_index, is_new_block, block_start_row) = if n == 0 {
                (0u64, true, row)
            } else {
                let last = n - 1;
                let block = self.block(last)?;
                if block.is_full() {
                    (last + 1, true, row)
                } else {
                    (last, false, row)
                }
            };

            let block = self.block(block_index)?;
            let capacity_left = (block.segment().elm_max() - block.segment().published()) as usize;
            let remaining = times.len() - row;
            let take = capacity_left.min(remaining);
            if take == 0 {
                log::error!("index table full at capacity {}", self.params.index_capacity);
                return Err(Error::IndexFull { capacity: self.params.index_capacity });
            }

            let seg = block.segment_mut();
            seg.wrt_get()?;
            let ptrs = seg.wrt_loc(take as u64)?;
            for (col, &stride) in strides.iter().enumerate() {
                let src = columns[col];
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src.as_ptr().add(row * stride),
                        ptrs[col],
                        take * stride,
                    );
                }
            }
            seg.wrt_don(take as u64)?;
            seg.wrt_cpl()?;

            let start_time = times[block_start_row];
            let end_time = times[row + take - 1];

            if is_new_block {
                self.push_index_entry(start_time, end_time)?;
            } else {
                self.update_last_end_time(end_time)?;
            }

            self.unload(block_index);
            row += take;
        }
        Ok(())
    }

    fn push_index_entry(&mut self, start_time: i64, end_time: i64) -> Result<()> {
        self.segment.wrt_get()?;
        let ptrs = self.segment.wrt_loc(1)?;
        unsafe {
            (ptrs[0] as *mut i64).write(start_time);
            (ptrs[1] as *mut i64).write(end_time);
        }
        self.segment.wrt_don(1)?;
        self.segment.wrt_cpl()?;
        Ok(())
    }

    /// Updates only the `end_time` field of the already-published last entry.
    /// This index's single-writer discipline already guarantees exclusivity
    /// for this in-place mutation, so it bypasses the generic write lease.
    fn update_last_end_time(&mut self, end_time: i64) -> Result<()> {
        let n = self.entry_count();
        let ptrs = self.segment.red_rng(n - 1, 1)?;
        unsafe {
            let atomic = &*(ptrs[1] as *const AtomicU64);
            atomic.store(end_time as u64, Ordering::Release);
        }
        Ok(())
    }

    /// Streaming iteration over rows with time in `[t_start, t_end]`: bisects
    /// once into the index table, then linearly scans within each block's
    /// time array. The storage layer never bisects inside a block.
    pub fn read(&mut self, t_start: i64, t_end: i64) -> Result<RowCursor<'_>> {
        let start_block = match self.search(t_start)? {
            Some(i) => i,
            None => self.entry_count(),
        };
        Ok(RowCursor {
            index: self,
            block_index: start_block,
            row_in_block: 0,
            t_start,
            t_end,
            done: false,
        })
    }
}

/// Lifetime-bound cursor yielding `(time, column_ptrs)` for each row in
/// range. Pointers borrow directly from the attached block's mapped memory,
/// matching `Segment::red_rng`'s own raw-pointer return convention; this is
/// sound because readers and writers of one index are single-threaded.
pub struct RowCursor<'a> {
    index: &'a mut Index,
    block_index: u64,
    row_in_block: u64,
    t_start: i64,
    t_end: i64,
    done: bool,
}

impl<'a> RowCursor<'a> {
    pub fn next(&mut self) -> Result<Option<(i64, Vec<*const u8>)>> {
        if self.done {
            return Ok(None);
        }
        loop {
            if self.block_index >= self.index.entry_count() {
                self.done = true;
                return Ok(None);
            }
            let block = self.index.block(self.block_index)?;
            let published = block.segment().published();
            if self.row_in_block >= published {
                self.index.unload(self.block_index);
                self.block_index += 1;
                self.row_in_block = 0;
                continue;
            }
            let ptrs = block.segment().red_rng(self.row_in_block, 1)?;
            let time = unsafe { (ptrs[0] as *const i64).read() };
            if time > self.t_end {
                self.done = true;
                self.index.unload(self.block_index);
                return Ok(None);
            }
            self.row_in_block += 1;
            if time < self.t_start {
                continue;
            }
            return Ok(Some((time, ptrs)));
        }
    }
}

impl Index {
    /// Derives (or returns the already-derived) snapshot for block `i`,
    /// consulting block `i - 1`'s own snapshot as the seed when available.
    pub fn obs_for_block(&mut self, i: u64, prev_anchor: u64) -> Result<(Obs, bool)> {
        let predecessor = if i == 0 {
            None
        } else {
            let prev = self.block(i - 1)?;
            let obs = if prev.obs_ready() { Some(prev.read_obs()) } else { None };
            self.unload(i - 1);
            obs
        };
        let block = self.block(i)?;
        Ok(block.ensure_obs(predecessor.as_ref(), prev_anchor))
    }
}
