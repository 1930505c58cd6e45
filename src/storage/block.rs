//! A block is a segment whose arrays store event rows for one level, plus
//! (for levels 1 and 2) a lazily-derived end-of-block orderbook snapshot.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::LevelParams;
use crate::error::Result;
use crate::obs::{self, Obs, GOS_LEN, OBS_LEN};
use crate::segment::{block_filename, Segment, SegmentTemplate, META_PAGE};

const SYNC_REGION: usize = 0;
const OBS_REGION: usize = 1;
const SCD_WIP_OFF: usize = 0;
const SCD_INI_OFF: usize = 4;

pub struct Block {
    segment: Segment,
    has_obs: bool,
}

impl Block {
    pub fn attach(dir: &Path, level: u8, number: u64, params: LevelParams) -> Result<Self> {
        let path = dir.join(block_filename(number));
        let mut region_sizes = vec![META_PAGE as u64];
        if params.obs_region {
            region_sizes.push((8 + OBS_LEN * 8) as u64);
        }
        let imp = [b'B', b'L', b'K', level];
        let template = SegmentTemplate {
            elm_max: params.block_rows_max,
            region_sizes: &region_sizes,
            elem_sizes: params.elem_sizes,
            imp: &imp,
        };
        let segment = Segment::attach(&path, &template)?;
        Ok(Block { segment, has_obs: params.obs_region })
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn segment_mut(&mut self) -> &mut Segment {
        &mut self.segment
    }

    pub fn is_full(&self) -> bool {
        self.segment.published() >= self.segment.elm_max()
    }

    pub fn has_obs(&self) -> bool {
        self.has_obs
    }

    fn scd_wip(&self) -> &'static AtomicU32 {
        let ptr = self
            .segment
            .region_field_ptr(SYNC_REGION, SCD_WIP_OFF)
            .expect("sync region is always present");
        unsafe { &*(ptr as *const AtomicU32) }
    }

    fn scd_ini(&self) -> &'static AtomicU32 {
        let ptr = self
            .segment
            .region_field_ptr(SYNC_REGION, SCD_INI_OFF)
            .expect("sync region is always present");
        unsafe { &*(ptr as *const AtomicU32) }
    }

    pub fn obs_ready(&self) -> bool {
        self.scd_ini().load(Ordering::Acquire) != 0
    }

    pub fn read_obs(&self) -> Obs {
        while !self.obs_ready() {
            std::hint::spin_loop();
        }
        let bytes = self.segment.region(OBS_REGION).expect("obs region present");
        decode_obs(bytes)
    }

    fn write_obs(&mut self, obs: &Obs) {
        let bytes = self.segment.region_mut(OBS_REGION).expect("obs region present");
        encode_obs(bytes, obs);
    }

    /// Price/volume pairs read from this block's own published rows,
    /// treated as overlay updates during snapshot derivation. Level 1 reads
    /// (price, vol) directly; level 2 reads the (price, vol) columns of
    /// each order event, a pragmatic simplification of full order-book
    /// replay for the purpose of a single end-of-block snapshot.
    fn row_updates(&self) -> Vec<(u64, f64)> {
        let n = self.segment.published();
        if n == 0 {
            return Vec::new();
        }
        let ptrs = self.segment.red_rng(0, n).expect("published rows are readable");
        let (price_idx, vol_idx) = if ptrs.len() == 3 { (1, 2) } else { (4, 5) };
        let mut out = Vec::with_capacity(n as usize);
        unsafe {
            for i in 0..n {
                let price = (ptrs[price_idx] as *const i64).add(i as usize).read();
                let vol = (ptrs[vol_idx] as *const f64).add(i as usize).read();
                out.push((price as u64, vol));
            }
        }
        out
    }

    /// Ensures the second-tier orderbook snapshot is computed, returning it
    /// plus whether the union of bid/ask ticks exceeded the 1024-wide
    /// window (a lossy derivation). Safe to call from multiple attachers:
    /// exactly one computes it, the rest spin on `scd_ini`.
    pub fn ensure_obs(&mut self, predecessor: Option<&Obs>, prev_anchor: u64) -> (Obs, bool) {
        if self.obs_ready() {
            return (self.read_obs(), false);
        }
        let won = self
            .scd_wip()
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !won {
            return (self.read_obs(), false);
        }
        let (obs, lost) = derive_obs(predecessor, prev_anchor, &self.row_updates());
        self.write_obs(&obs);
        self.scd_ini().store(1, Ordering::Release);
        (obs, lost)
    }
}

fn derive_obs(predecessor: Option<&Obs>, prev_anchor: u64, updates: &[(u64, f64)]) -> (Obs, bool) {
    let mut gos = vec![0.0f64; GOS_LEN];
    let gos_center = (GOS_LEN as u64) / 2;

    let (gos_base, pred_range) = match predecessor {
        Some(pred) => {
            let pred_mid = pred.start_tick + (OBS_LEN as u64) / 2;
            let gos_base = pred_mid.saturating_sub(gos_center);
            obs::obk_add_obs(&mut gos, gos_base, pred);
            (gos_base, Some((pred.start_tick, pred.start_tick + OBS_LEN as u64)))
        }
        None => (prev_anchor.saturating_sub(gos_center), None),
    };

    let touched = obs::obk_add_upds(&mut gos, gos_base, updates);

    let scan_lo = match (pred_range, touched) {
        (Some((lo, _)), Some((t_lo, _))) => lo.min(t_lo),
        (Some((lo, _)), None) => lo,
        (None, Some((t_lo, _))) => t_lo,
        (None, None) => gos_base,
    };
    let scan_hi = match (pred_range, touched) {
        (Some((_, hi)), Some((_, t_hi))) => hi.max(t_hi + 1),
        (Some((_, hi)), None) => hi,
        (None, Some((_, t_hi))) => t_hi + 1,
        (None, None) => gos_base,
    };

    let bw = obs::obk_bst_bat(&gos, gos_base, scan_lo, scan_hi);
    if bw.inverted {
        log::info!("second-tier derivation observed an ask below a bid tick");
    }
    let anchor = obs::obk_anc(bw.best_bid, bw.best_ask, prev_anchor, OBS_LEN as u64);

    let extremes = [bw.best_bid, bw.worst_bid, bw.best_ask, bw.worst_ask]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
    let lost = match (extremes.iter().min(), extremes.iter().max()) {
        (Some(&lo), Some(&hi)) => hi - lo + 1 > OBS_LEN as u64,
        _ => false,
    };
    if lost {
        log::warn!("second-tier derivation: best-to-worst span exceeded the OBS window, anchor={anchor}");
    }

    let new_obs = obs::obk_xtr_obs(&gos, gos_base, anchor);
    (new_obs, lost)
}

fn encode_obs(buf: &mut [u8], obs: &Obs) {
    buf[0..8].copy_from_slice(&obs.start_tick.to_le_bytes());
    for (i, v) in obs.volumes.iter().enumerate() {
        let off = 8 + i * 8;
        buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }
}

fn decode_obs(buf: &[u8]) -> Obs {
    let start_tick = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let mut volumes = [0.0f64; OBS_LEN];
    for (i, v) in volumes.iter_mut().enumerate() {
        let off = 8 + i * 8;
        *v = f64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
    }
    Obs { start_tick, volumes }
}
