//! DR1: glues the level-1 history engine to the storage layer. Seeds a
//! fresh [`History`] from the predecessor block's orderbook snapshot, then
//! streams a block's rows bucket by bucket through `add -> prepare ->
//! process`, catching the engine up to a requested `t_cur`.
//!
//! One interpretation call, undocumented in the upstream spec: historical
//! rows are fed to [`History::add_stream`] in per-bucket batches (one
//! `resolution`-wide slice at a time), and each batch's `prepare` call runs
//! *before* that batch is added rather than after. `add_stream`'s acceptance
//! window is anchored to `current + L*resolution`, and `current` starts at
//! 0; advancing `current` to the batch's own bucket first, then adding rows
//! whose times fall inside it, keeps every historical row inside the
//! window regardless of how far `t_start` sits from 0. See `DESIGN.md`.

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::history::{History, HistoryConfig};
use crate::storage::Index;

pub struct DataReconstructor {
    index: Index,
    resolution: i64,
    history: History,
    cursor_time: i64,
    last_prepared: Option<i64>,
}

impl DataReconstructor {
    /// Opens `venue/instrument`'s level-1 index read-only, seeds the engine
    /// from the block preceding `t_cur - columns*resolution`, and advances
    /// it up to `t_cur`.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        config: &StorageConfig,
        venue: &str,
        instrument: &str,
        resolution: i64,
        rows: u32,
        columns: u32,
        curve_len: u32,
        with_curve: bool,
        t_cur: i64,
    ) -> Result<Self> {
        let dir = config.root.join(venue).join(instrument).join("1");
        let mut index = Index::open(config, dir, 1)?;
        let t_start = t_cur - (columns as i64) * resolution;

        let history_cfg = HistoryConfig { rows, columns, curve_len, resolution };
        let mut history = History::new(history_cfg, with_curve);

        if let Some(block_i) = index.search(t_start)? {
            if block_i > 0 {
                let (obs, _lost) = index.obs_for_block(block_i - 1, (rows / 2) as u64)?;
                let mut prices = Vec::new();
                let mut vols = Vec::new();
                for (i, &vol) in obs.volumes.iter().enumerate() {
                    if vol != 0.0 {
                        prices.push((obs.start_tick + i as u64) as i64);
                        vols.push(vol);
                    }
                }
                if !prices.is_empty() {
                    history.add_initial(&prices, &vols)?;
                }
            }
        }

        let mut dr = DataReconstructor {
            index,
            resolution,
            history,
            cursor_time: t_start,
            last_prepared: None,
        };
        dr.advance(t_cur)?;
        Ok(dr)
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Catches the engine up to `t_cur`, one `resolution`-wide bucket of
    /// rows at a time. `t_cur` must not be smaller than any value passed to
    /// a previous call.
    pub fn advance(&mut self, t_cur: i64) -> Result<()> {
        if let Some(prev) = self.last_prepared {
            if t_cur < prev {
                return Err(Error::NonMonotonicTime { previous: prev, next: t_cur });
            }
        }
        loop {
            let batch_end = (self.cursor_time + self.resolution).min(t_cur).max(self.cursor_time);
            self.history.prepare(batch_end)?;
            if batch_end > self.cursor_time {
                let (times, prices, vols) = self.read_batch(self.cursor_time, batch_end - 1)?;
                if !times.is_empty() {
                    self.history.add_stream(&times, &prices, &vols)?;
                }
            }
            self.history.process()?;
            self.history.clean();
            self.cursor_time = batch_end;
            if batch_end >= t_cur {
                break;
            }
        }
        self.last_prepared = Some(t_cur);
        Ok(())
    }

    fn read_batch(&mut self, start: i64, end: i64) -> Result<(Vec<i64>, Vec<i64>, Vec<f64>)> {
        let mut times = Vec::new();
        let mut prices = Vec::new();
        let mut vols = Vec::new();
        let mut cursor = self.index.read(start, end)?;
        while let Some((time, ptrs)) = cursor.next()? {
            let price = unsafe { (ptrs[1] as *const i64).read() };
            let vol = unsafe { (ptrs[2] as *const f64).read() };
            times.push(time);
            prices.push(price);
            vols.push(vol);
        }
        Ok((times, prices, vols))
    }
}
