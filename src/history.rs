//! Level-1 history engine: an incremental price/time-bucketed heatmap and
//! forward-looking bid/ask curve over a monotonically arriving stream of
//! per-tick volume updates.
//!
//! A tick's volume is negative for a resting bid, positive for a resting
//! ask, zero for empty, matching [`crate::obs`]. Per-tick update history and
//! the global arrival-ordered queue are plain owned collections rather than
//! the source's intrusive list nodes: a tick owns a `VecDeque` of the
//! updates already visible as "current", and a single global `VecDeque`
//! holds updates that arrived but have not yet crossed `current` (see
//! [`History::process`]).
//!
//! One interpretation call, undocumented as ambiguous in the upstream spec:
//! a streaming-mode update's time is required to strictly *exceed* its
//! tick's previous latest update time (not "be less than" it, which would
//! contradict the tick update list's ascending order and its `max_time`
//! field). See `DESIGN.md`.

use std::collections::{BTreeMap, VecDeque};

use crate::error::{Error, Result};

/// Fixed shape of one [`History`] instance: row/column/curve counts and the
/// time-bucket width. `rows` (K) must be even.
#[derive(Clone, Copy, Debug)]
pub struct HistoryConfig {
    pub rows: u32,
    pub columns: u32,
    pub curve_len: u32,
    pub resolution: i64,
}

const BID_SENTINEL: u64 = 0;
const ASK_SENTINEL: u64 = u64::MAX;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Bid,
    Ask,
    Empty,
}

fn side_of(vol: f64) -> Side {
    if vol < 0.0 {
        Side::Bid
    } else if vol > 0.0 {
        Side::Ask
    } else {
        Side::Empty
    }
}

#[derive(Clone, Copy)]
struct UpdateRec {
    tick: i64,
    time: i64,
    volume: f64,
}

struct TickState {
    start_volume: f64,
    current_volume: f64,
    max_volume: f64,
    max_time: Option<i64>,
    /// Updates with `time < current`, ascending by time.
    visible: VecDeque<UpdateRec>,
}

impl TickState {
    fn fresh(volume: f64) -> Self {
        TickState {
            start_volume: volume,
            current_volume: volume,
            max_volume: volume,
            max_time: None,
            visible: VecDeque::new(),
        }
    }

    fn is_empty_and_zero(&self) -> bool {
        self.visible.is_empty()
            && self.start_volume == 0.0
            && self.current_volume == 0.0
            && self.max_volume == 0.0
    }
}

fn round_up(t: i64, r: i64) -> i64 {
    ((t + r - 1).div_euclid(r)) * r
}

fn aid(t: i64, r: i64) -> i64 {
    t.div_euclid(r)
}

/// Incremental heatmap + bid/ask curve state. Constructed empty at time 0;
/// advanced forward only through `prepare -> add* -> process -> clean?`.
pub struct History {
    cfg: HistoryConfig,
    current: i64,
    heatmap_end: i64,
    pending_col_shift: i64,
    max_observed: i64,
    end_of_acceptance: i64,
    ticks: BTreeMap<i64, TickState>,
    pending: VecDeque<UpdateRec>,

    anchor: i64,
    tick_min: i64,
    heatmap: Vec<f64>, // row-major: index = row * columns + col, col 0 oldest

    best_cur_bid: Option<i64>,
    best_cur_ask: Option<i64>,
    best_max_bid: Option<i64>,
    best_max_ask: Option<i64>,

    curve_enabled: bool,
    curve_base_aid: i64,
    bid_curve: VecDeque<u64>,
    ask_curve: VecDeque<u64>,
    bid_last_aid: Option<i64>,
    ask_last_aid: Option<i64>,
}

impl History {
    pub fn new(cfg: HistoryConfig, with_curve: bool) -> Self {
        assert!(cfg.rows % 2 == 0, "heatmap row count must be even");
        let anchor = (cfg.rows / 2) as i64;
        let tick_min = anchor - (cfg.rows / 2) as i64;
        History {
            cfg,
            current: 0,
            heatmap_end: 0,
            pending_col_shift: 0,
            max_observed: i64::MIN,
            end_of_acceptance: (cfg.curve_len as i64) * cfg.resolution,
            ticks: BTreeMap::new(),
            pending: VecDeque::new(),
            anchor,
            tick_min,
            heatmap: vec![0.0; (cfg.rows * cfg.columns) as usize],
            best_cur_bid: None,
            best_cur_ask: None,
            best_max_bid: None,
            best_max_ask: None,
            curve_enabled: with_curve,
            curve_base_aid: aid(0, cfg.resolution) + 1,
            bid_curve: VecDeque::from(vec![BID_SENTINEL; cfg.curve_len as usize]),
            ask_curve: VecDeque::from(vec![ASK_SENTINEL; cfg.curve_len as usize]),
            bid_last_aid: None,
            ask_last_aid: None,
        }
    }

    pub fn current(&self) -> i64 {
        self.current
    }

    pub fn heatmap_end(&self) -> i64 {
        self.heatmap_end
    }

    pub fn anchor(&self) -> i64 {
        self.anchor
    }

    pub fn tick_range(&self) -> (i64, i64) {
        (self.tick_min, self.tick_min + self.cfg.rows as i64)
    }

    pub fn best_cur(&self) -> (Option<i64>, Option<i64>) {
        (self.best_cur_bid, self.best_cur_ask)
    }

    pub fn best_max(&self) -> (Option<i64>, Option<i64>) {
        (self.best_max_bid, self.best_max_ask)
    }

    /// Row-major `rows x columns` snapshot, column 0 oldest, column
    /// `columns - 1` the bucket ending at `heatmap_end`.
    pub fn heatmap(&self) -> &[f64] {
        &self.heatmap
    }

    pub fn bid_curve(&self) -> Option<&VecDeque<u64>> {
        self.curve_enabled.then_some(&self.bid_curve)
    }

    pub fn ask_curve(&self) -> Option<&VecDeque<u64>> {
        self.curve_enabled.then_some(&self.ask_curve)
    }

    /// Advances `current`, deferring any heatmap column shift to the next
    /// `process`. Requires `t_cur >= current`.
    pub fn prepare(&mut self, t_cur: i64) -> Result<()> {
        if t_cur < self.current {
            log::error!("prepare time moved backwards: {} -> {t_cur}", self.current);
            return Err(Error::NonMonotonicTime { previous: self.current, next: t_cur });
        }
        self.current = t_cur;
        let heatmap_end_new = round_up(t_cur, self.cfg.resolution);
        if heatmap_end_new > self.heatmap_end {
            let delta = (heatmap_end_new - self.heatmap_end) / self.cfg.resolution;
            self.pending_col_shift += delta;
            if self.curve_enabled {
                self.shift_curve(delta);
            }
            self.heatmap_end = heatmap_end_new;
        }
        self.end_of_acceptance = self.current + (self.cfg.curve_len as i64) * self.cfg.resolution;
        Ok(())
    }

    /// Initial mode: seeds previously-unknown ticks with a resting volume.
    pub fn add_initial(&mut self, prices: &[i64], volumes: &[f64]) -> Result<()> {
        for (&price, &vol) in prices.iter().zip(volumes) {
            if self.ticks.contains_key(&price) {
                log::error!("initial-mode add named already-known tick {price}");
                return Err(Error::DuplicateTick(price));
            }
            self.ticks.insert(price, TickState::fresh(vol));
            refresh_best(
                &self.ticks,
                price,
                0.0,
                vol,
                &mut self.best_cur_bid,
                &mut self.best_cur_ask,
                |t| t.current_volume,
            );
        }
        Ok(())
    }

    /// Streaming mode: records updates against `max_observed`-ordered
    /// arrival, deferring visibility to the tick's own list until `process`.
    pub fn add_stream(&mut self, times: &[i64], prices: &[i64], volumes: &[f64]) -> Result<()> {
        for ((&time, &price), &vol) in times.iter().zip(prices).zip(volumes) {
            if time < self.max_observed || time >= self.end_of_acceptance {
                log::error!(
                    "update time {time} outside acceptance window [{}, {})",
                    self.max_observed,
                    self.end_of_acceptance
                );
                return Err(Error::UpdateOutsideAcceptanceWindow {
                    time,
                    max_observed: self.max_observed,
                    end_of_acceptance: self.end_of_acceptance,
                });
            }
            let tick = self.ticks.entry(price).or_insert_with(|| TickState::fresh(0.0));
            if let Some(latest) = tick.max_time {
                if time <= latest {
                    log::error!("update time {time} for tick {price} does not advance past {latest}");
                    return Err(Error::StaleTickUpdate { tick: price, time, latest });
                }
            }
            let old_max_vol = tick.max_volume;
            tick.max_volume = vol;
            tick.max_time = Some(time);
            self.pending.push_back(UpdateRec { tick: price, time, volume: vol });
            self.max_observed = self.max_observed.max(time);

            if self.curve_enabled {
                refresh_best(
                    &self.ticks,
                    price,
                    old_max_vol,
                    vol,
                    &mut self.best_max_bid,
                    &mut self.best_max_ask,
                    |t| t.max_volume,
                );
                self.propagate_curve(price, old_max_vol, vol, time);
            }
        }
        Ok(())
    }

    /// Admits every pending update with `time < current` as "current", then
    /// resolves any deferred heatmap column/anchor shift.
    pub fn process(&mut self) -> Result<()> {
        while let Some(front) = self.pending.front() {
            if front.time >= self.current {
                break;
            }
            let rec = self.pending.pop_front().unwrap();
            let tick = self.ticks.get_mut(&rec.tick).expect("tick created on add");
            let old_cur_vol = tick.current_volume;
            tick.current_volume = rec.volume;
            tick.visible.push_back(rec);
            refresh_best(
                &self.ticks,
                rec.tick,
                old_cur_vol,
                rec.volume,
                &mut self.best_cur_bid,
                &mut self.best_cur_ask,
                |t| t.current_volume,
            );
        }

        if self.pending_col_shift > 0 {
            let delta = self.pending_col_shift;
            let new_anchor = crate::obs::obk_anc(
                self.best_cur_bid.map(|b| b as u64),
                self.best_cur_ask.map(|a| a as u64),
                self.anchor.max(0) as u64,
                self.cfg.rows as u64,
            ) as i64;
            if new_anchor < (self.cfg.rows / 2) as i64 {
                log::error!("anchor {new_anchor} fell below half the row count {}", self.cfg.rows);
                return Err(Error::AnchorBelowHalf { anchor: new_anchor, k: self.cfg.rows });
            }
            self.reanchor_and_regenerate(new_anchor, delta);
            self.pending_col_shift = 0;
        }
        Ok(())
    }

    /// Deletes every global/tick-local update with `time <= heatmap_end -
    /// columns*resolution` (strictly-greater-than retained, per the
    /// upstream ambiguity resolved in favor of a consistent boundary), and
    /// destroys any tick left with an empty list and all-zero volumes.
    pub fn clean(&mut self) {
        let threshold = self.heatmap_end - (self.cfg.columns as i64) * self.cfg.resolution;
        while let Some(front) = self.pending.front() {
            if front.time > threshold {
                break;
            }
            self.pending.pop_front();
        }
        let mut dead = Vec::new();
        for (&key, tick) in self.ticks.iter_mut() {
            while let Some(front) = tick.visible.front() {
                if front.time > threshold {
                    break;
                }
                tick.visible.pop_front();
            }
            if tick.is_empty_and_zero() {
                dead.push(key);
            }
        }
        for key in dead {
            self.ticks.remove(&key);
        }
    }

    fn shift_curve(&mut self, delta: i64) {
        let len = self.cfg.curve_len as i64;
        let n = delta.min(len) as usize;
        for _ in 0..n {
            self.bid_curve.pop_front();
            self.bid_curve.push_back(BID_SENTINEL);
            self.ask_curve.pop_front();
            self.ask_curve.push_back(ASK_SENTINEL);
        }
        if delta >= len {
            self.bid_last_aid = None;
            self.ask_last_aid = None;
        }
        self.curve_base_aid += delta;
    }

    fn propagate_curve(&mut self, _tick: i64, _old_vol: f64, _new_vol: f64, time: i64) {
        let a = aid(time, self.cfg.resolution);
        propagate_one_side(
            &mut self.bid_curve,
            self.curve_base_aid,
            self.cfg.curve_len as i64,
            &mut self.bid_last_aid,
            a,
            self.best_max_bid.map(|t| t as u64).unwrap_or(BID_SENTINEL),
            true,
        );
        propagate_one_side(
            &mut self.ask_curve,
            self.curve_base_aid,
            self.cfg.curve_len as i64,
            &mut self.ask_last_aid,
            a,
            self.best_max_ask.map(|t| t as u64).unwrap_or(ASK_SENTINEL),
            false,
        );
    }

    fn reanchor_and_regenerate(&mut self, new_anchor: i64, delta_cols: i64) {
        let w = self.cfg.columns as i64;
        let k = self.cfg.rows as i64;
        let new_tick_min = new_anchor - k / 2;
        let delta_rows = new_tick_min - self.tick_min;

        let mut new_hm = vec![0.0f64; (k * w) as usize];
        let mut row_is_new = vec![true; k as usize];
        let carry_cols = (w - delta_cols).max(0);
        for row in 0..k {
            let old_row = row + delta_rows;
            if old_row < 0 || old_row >= k {
                continue;
            }
            row_is_new[row as usize] = false;
            for col in 0..carry_cols {
                let old_col = col + delta_cols;
                new_hm[(row * w + col) as usize] = self.heatmap[(old_row * w + old_col) as usize];
            }
        }
        self.heatmap = new_hm;
        self.tick_min = new_tick_min;
        self.anchor = new_anchor;

        let regen_start_existing = (w - delta_cols - 1).max(0);
        for row in 0..k {
            let tick = self.tick_min + row;
            let cols: Box<dyn Iterator<Item = i64>> = if row_is_new[row as usize] {
                Box::new(0..w)
            } else {
                Box::new(regen_start_existing..w)
            };
            for col in cols {
                let b = self.heatmap_end - (w - col - 1) * self.cfg.resolution;
                let a = b - self.cfg.resolution;
                let value = self.cell_value(tick, a, b);
                self.heatmap[(row * w + col) as usize] = value;
            }
        }
    }

    /// Time-weighted average volume of `tick` over `[a, b)`, per §4.4.
    fn cell_value(&self, tick: i64, a: i64, b: i64) -> f64 {
        let width = (b - a) as f64;
        if width <= 0.0 {
            return 0.0;
        }
        let Some(state) = self.ticks.get(&tick) else {
            return 0.0;
        };
        let mut hi = b;
        let mut acc = 0.0;
        for upd in state.visible.iter().rev() {
            if hi <= a {
                break;
            }
            let lo = upd.time.max(a);
            if hi > lo {
                acc += upd.volume * (hi - lo) as f64;
            }
            hi = lo;
            if upd.time <= a {
                break;
            }
        }
        if hi > a {
            acc += state.start_volume * (hi - a) as f64;
        }
        acc / width
    }
}

fn refresh_best<F: Fn(&TickState) -> f64>(
    ticks: &BTreeMap<i64, TickState>,
    tick_key: i64,
    old_vol: f64,
    new_vol: f64,
    best_bid: &mut Option<i64>,
    best_ask: &mut Option<i64>,
    vol_of: F,
) {
    let old_side = side_of(old_vol);
    let new_side = side_of(new_vol);

    match new_side {
        Side::Bid => {
            if best_bid.map_or(true, |b| tick_key > b) {
                *best_bid = Some(tick_key);
            }
        }
        Side::Ask => {
            if best_ask.map_or(true, |a| tick_key < a) {
                *best_ask = Some(tick_key);
            }
        }
        Side::Empty => {}
    }

    if old_side == Side::Bid && *best_bid == Some(tick_key) && new_side != Side::Bid {
        *best_bid = scan_next(ticks, tick_key, Side::Bid, &vol_of);
    }
    if old_side == Side::Ask && *best_ask == Some(tick_key) && new_side != Side::Ask {
        *best_ask = scan_next(ticks, tick_key, Side::Ask, &vol_of);
    }

    if let (Some(b), Some(a)) = (*best_bid, *best_ask) {
        if a < b {
            log::warn!("ask tick {a} observed below bid tick {b}");
        }
    }
}

fn scan_next<F: Fn(&TickState) -> f64>(
    ticks: &BTreeMap<i64, TickState>,
    from: i64,
    side: Side,
    vol_of: &F,
) -> Option<i64> {
    match side {
        Side::Bid => ticks
            .range(..from)
            .rev()
            .find(|(_, t)| side_of(vol_of(t)) == Side::Bid)
            .map(|(&k, _)| k),
        Side::Ask => ticks
            .range(from + 1..)
            .find(|(_, t)| side_of(vol_of(t)) == Side::Ask)
            .map(|(&k, _)| k),
        Side::Empty => None,
    }
}

#[allow(clippy::too_many_arguments)]
fn propagate_one_side(
    curve: &mut VecDeque<u64>,
    curve_base_aid: i64,
    curve_len: i64,
    last_aid: &mut Option<i64>,
    update_aid: i64,
    new_best: u64,
    is_bid: bool,
) {
    let sentinel = if is_bid { BID_SENTINEL } else { ASK_SENTINEL };
    let prev_value = match last_aid {
        Some(prev_aid) => {
            let idx = prev_aid - curve_base_aid;
            if idx >= 0 { curve.get(idx as usize).copied().unwrap_or(sentinel) } else { sentinel }
        }
        None => sentinel,
    };

    let start_fill = last_aid.map_or(curve_base_aid, |x| x + 1).max(curve_base_aid);
    for a in start_fill..update_aid {
        let idx = a - curve_base_aid;
        if idx >= 0 && idx < curve_len {
            curve[idx as usize] = prev_value;
        }
    }

    let idx = update_aid - curve_base_aid;
    if idx >= 0 && idx < curve_len {
        if *last_aid == Some(update_aid) {
            let existing = curve[idx as usize];
            curve[idx as usize] =
                if is_bid { existing.max(new_best) } else { existing.min(new_best) };
        } else {
            curve[idx as usize] = new_best;
        }
    }
    *last_aid = Some(update_aid);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> HistoryConfig {
        HistoryConfig { rows: 8, columns: 4, curve_len: 4, resolution: 100 }
    }

    #[test]
    fn initial_add_then_process_fills_heatmap_with_resting_volumes() {
        let mut h = History::new(cfg(), false);
        h.prepare(350).unwrap();
        h.add_initial(&[3, 4, 5, 6], &[-1.0, -2.0, 3.0, 4.0]).unwrap();
        h.prepare(351).unwrap();
        h.process().unwrap();

        let (lo, hi) = h.tick_range();
        assert!(lo <= 3 && 6 < hi);
        let last_col = h.cfg.columns - 1;
        for (i, &tick) in [3i64, 4, 5, 6].iter().enumerate() {
            let row = (tick - lo) as usize;
            let val = h.heatmap()[row * h.cfg.columns as usize + last_col as usize];
            assert_eq!(val, [-1.0, -2.0, 3.0, 4.0][i]);
        }
    }

    #[test]
    fn best_cur_updates_on_zero_transition_and_rescans() {
        let mut h = History::new(cfg(), false);
        h.prepare(10).unwrap();
        h.add_initial(&[10, 12, 20], &[-1.0, -1.0, 1.0]).unwrap();
        assert_eq!(h.best_cur(), (Some(12), Some(20)));

        // Directly zero out the best bid via a streaming update cycle.
        h.prepare(10).unwrap();
        h.add_stream(&[10], &[12], &[0.0]).unwrap();
        h.prepare(11).unwrap();
        h.process().unwrap();
        assert_eq!(h.best_cur().0, Some(10));
    }

    #[test]
    fn cell_value_matches_manual_time_weighted_average() {
        let mut h = History::new(cfg(), false);
        h.prepare(0).unwrap();
        h.add_initial(&[5], &[2.0]).unwrap();
        h.prepare(5).unwrap();
        h.add_stream(&[5, 15], &[5, 5], &[5.0, 7.0]).unwrap();
        h.prepare(30).unwrap();
        h.process().unwrap();
        h.prepare(31).unwrap();
        h.process().unwrap();

        let val = h.cell_value(5, 10, 30);
        // [10,15) = 2.0 (start volume, before first update lands <30),
        // [15,30) = 5.0 once the time=5 update is visible... recomputed manually:
        // visible updates after processing: (5,5.0) and (15,7.0) both < current(31).
        // [10,15)=5.0 (set at t=5), [15,30)=7.0 (set at t=15).
        let expected = (5.0 * 5.0 + 7.0 * 15.0) / 20.0;
        assert_eq!(val, expected);
    }

    #[test]
    fn clean_removes_updates_at_or_before_window_start_and_destroys_dead_ticks() {
        let mut h = History::new(cfg(), false);
        h.prepare(0).unwrap();
        h.add_initial(&[5], &[0.0]).unwrap();
        h.prepare(5).unwrap();
        h.add_stream(&[5], &[5], &[1.0]).unwrap();
        h.prepare(6).unwrap();
        h.process().unwrap();
        h.prepare(6).unwrap();
        h.add_stream(&[6], &[5], &[0.0]).unwrap();
        h.prepare(1000).unwrap();
        h.process().unwrap();
        h.clean();
        assert!(!h.ticks.contains_key(&5));
    }

    #[test]
    fn bid_ask_curve_propagates_aggressive_extremum_within_a_cell() {
        let mut h = History::new(cfg(), true);
        h.prepare(0).unwrap();
        // Both updates land in bucket aid(150) == aid(160) == 1, one past
        // curve_base_aid (aid(current) + 1 == 1), so both fall inside the
        // curve's first cell.
        h.add_stream(&[150], &[100], &[-1.0]).unwrap();
        h.add_stream(&[160], &[101], &[-1.0]).unwrap();
        let curve = h.bid_curve().unwrap();
        assert_eq!(curve[0], 101);
    }
}
