//! General-purpose memory-mapped container for append-only parallel arrays.
//!
//! A segment maps a single backing file in three logical spans: a metadata
//! page (sync block, descriptor, implementation-defined template bytes), a
//! data area holding N parallel fixed-stride arrays that share one published
//! element count, and optional auxiliary regions. Exactly one attacher wins
//! initialization; everyone else reconciles against the descriptor it wrote.
//!
//! Concurrency is single-writer/many-reader: the only writer to array data
//! and the published count is whoever holds the write lease, and the only
//! writer to the descriptor is the one-time initializer. Visibility is
//! established purely through the acquire/release published-count fence,
//! the same pattern this crate uses for commit-length bytes embedded in a
//! mapped page.

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::mmap::{align_up, MmapFile};

pub const META_PAGE: usize = 64 * 1024;
const SYNC_SIZE: usize = 1024;
const DESCRIPTOR_OFFSET: usize = SYNC_SIZE;
const DESCRIPTOR_SIZE: usize = 1024;
const IMP_OFFSET: usize = DESCRIPTOR_OFFSET + DESCRIPTOR_SIZE;
pub const IMP_SIZE: usize = 1024;

const SPINLOCK_OFF: usize = 0;
const INI_RES_OFF: usize = 4;
const INI_CPL_OFF: usize = 8;
const WRITER_HELD_OFF: usize = 12;
const PUBLISHED_OFF: usize = 16;

const ELM_MAX_OFF: usize = 0;
const DAT_SIZE_OFF: usize = 8;
const RGN_COUNT_OFF: usize = 16;
const ARR_COUNT_OFF: usize = 20;
const RGN_SIZES_OFF: usize = 24;

pub const MAX_REGIONS: usize = 16;
pub const MAX_ARRAYS: usize = 255;

/// Caller-supplied shape for a fresh or reconciled segment.
pub struct SegmentTemplate<'a> {
    pub elm_max: u64,
    pub region_sizes: &'a [u64],
    pub elem_sizes: &'a [u8],
    /// Zero-padded (or truncated at [`IMP_SIZE`]) on write; compared byte-for-byte on reattach.
    pub imp: &'a [u8],
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Descriptor {
    elm_max: u64,
    dat_size: u64,
    region_sizes: Vec<u64>,
    elem_sizes: Vec<u8>,
}

impl Descriptor {
    fn from_template(t: &SegmentTemplate<'_>) -> Result<Self> {
        if t.region_sizes.len() > MAX_REGIONS {
            log::error!("segment template: region count {} exceeds MAX_REGIONS", t.region_sizes.len());
            return Err(Error::CorruptMetadata("region count exceeds MAX_REGIONS"));
        }
        if t.elem_sizes.len() > MAX_ARRAYS {
            log::error!("segment template: array count {} exceeds MAX_ARRAYS", t.elem_sizes.len());
            return Err(Error::CorruptMetadata("array count exceeds MAX_ARRAYS"));
        }
        let mut dat_size = 0u64;
        for &rgn in t.region_sizes {
            dat_size += align_up(rgn as usize, META_PAGE) as u64;
        }
        for &elem_size in t.elem_sizes {
            let bytes = (t.elm_max as u128) * (elem_size as u128);
            dat_size += align_up(bytes as usize, META_PAGE) as u64;
        }
        Ok(Descriptor {
            elm_max: t.elm_max,
            dat_size,
            region_sizes: t.region_sizes.to_vec(),
            elem_sizes: t.elem_sizes.to_vec(),
        })
    }

    fn write_bytes(&self, buf: &mut [u8]) {
        buf[..DESCRIPTOR_SIZE].fill(0);
        buf[ELM_MAX_OFF..ELM_MAX_OFF + 8].copy_from_slice(&self.elm_max.to_le_bytes());
        buf[DAT_SIZE_OFF..DAT_SIZE_OFF + 8].copy_from_slice(&self.dat_size.to_le_bytes());
        buf[RGN_COUNT_OFF..RGN_COUNT_OFF + 4]
            .copy_from_slice(&(self.region_sizes.len() as u32).to_le_bytes());
        buf[ARR_COUNT_OFF..ARR_COUNT_OFF + 4]
            .copy_from_slice(&(self.elem_sizes.len() as u32).to_le_bytes());
        let mut off = RGN_SIZES_OFF;
        for &rgn in &self.region_sizes {
            buf[off..off + 8].copy_from_slice(&rgn.to_le_bytes());
            off += 8;
        }
        for &es in &self.elem_sizes {
            buf[off] = es;
            off += 1;
        }
    }

    fn read_bytes(buf: &[u8]) -> Result<Self> {
        let elm_max = u64::from_le_bytes(buf[ELM_MAX_OFF..ELM_MAX_OFF + 8].try_into().unwrap());
        let dat_size = u64::from_le_bytes(buf[DAT_SIZE_OFF..DAT_SIZE_OFF + 8].try_into().unwrap());
        let rgn_count =
            u32::from_le_bytes(buf[RGN_COUNT_OFF..RGN_COUNT_OFF + 4].try_into().unwrap()) as usize;
        let arr_count =
            u32::from_le_bytes(buf[ARR_COUNT_OFF..ARR_COUNT_OFF + 4].try_into().unwrap()) as usize;
        if rgn_count > MAX_REGIONS || arr_count > MAX_ARRAYS {
            log::error!(
                "on-disk descriptor out of range: rgn_count={rgn_count}, arr_count={arr_count}"
            );
            return Err(Error::CorruptMetadata("descriptor region/array count out of range"));
        }
        let mut off = RGN_SIZES_OFF;
        let mut region_sizes = Vec::with_capacity(rgn_count);
        for _ in 0..rgn_count {
            region_sizes.push(u64::from_le_bytes(buf[off..off + 8].try_into().unwrap()));
            off += 8;
        }
        let mut elem_sizes = Vec::with_capacity(arr_count);
        for _ in 0..arr_count {
            elem_sizes.push(buf[off]);
            off += 1;
        }
        Ok(Descriptor { elm_max, dat_size, region_sizes, elem_sizes })
    }
}

/// An attached segment: one backing file, reconciled descriptor, and the
/// process-local write-lease state of this handle.
pub struct Segment {
    mmap: MmapFile,
    descriptor: Descriptor,
    region_offsets: Vec<usize>,
    array_offsets: Vec<usize>,
    /// Elements reserved but not yet published by *this* handle's write lease.
    pending_written: u64,
}

unsafe fn atomic_u32(ptr: *const u8) -> &'static AtomicU32 {
    &*(ptr as *const AtomicU32)
}

unsafe fn atomic_u64(ptr: *const u8) -> &'static AtomicU64 {
    &*(ptr as *const AtomicU64)
}

impl Segment {
    /// Attaches to `path`, creating and winning initialization if no segment
    /// exists there yet, or reconciling against an existing one otherwise.
    pub fn attach(path: &Path, template: &SegmentTemplate<'_>) -> Result<Self> {
        let descriptor = Descriptor::from_template(template)?;
        let total_len = META_PAGE + descriptor.dat_size as usize;

        let mmap = match MmapFile::open(path) {
            Ok(m) => m,
            Err(_) => Self::create_file(path, total_len)?,
        };

        let mut seg = Self::from_mapped(mmap, descriptor)?;
        seg.run_init_protocol(template)?;
        Ok(seg)
    }

    /// Builds under a per-attempt-unique temporary name so concurrent
    /// attachers in the same process (same pid) never share a tmp file; two
    /// threads truncating/remapping the same path out from under each other
    /// is a SIGBUS waiting to happen, not just a lost-update race.
    fn create_file(path: &Path, total_len: usize) -> Result<MmapFile> {
        static ATTEMPT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let pid = std::process::id();
        let tid = format!("{:?}", std::thread::current().id());
        let attempt = ATTEMPT.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("tmp-{pid}-{tid}-{attempt}"));
        let mut mmap = MmapFile::create_new(&tmp, total_len)?;
        mmap.prefault();
        mmap.sync()?;
        match publish(&tmp, path) {
            Ok(()) => MmapFile::open(path),
            Err(_) => {
                let _ = std::fs::remove_file(&tmp);
                MmapFile::open(path)
            }
        }
    }

    fn from_mapped(mmap: MmapFile, descriptor: Descriptor) -> Result<Self> {
        if mmap.len() < META_PAGE {
            log::error!("segment file is {} bytes, smaller than the metadata page", mmap.len());
            return Err(Error::CorruptMetadata("segment file smaller than metadata page"));
        }
        let mut region_offsets = Vec::with_capacity(descriptor.region_sizes.len());
        let mut off = META_PAGE;
        for &rgn in &descriptor.region_sizes {
            region_offsets.push(off);
            off += align_up(rgn as usize, META_PAGE);
        }
        let mut array_offsets = Vec::with_capacity(descriptor.elem_sizes.len());
        for &es in &descriptor.elem_sizes {
            array_offsets.push(off);
            let bytes = (descriptor.elm_max as u128) * (es as u128);
            off += align_up(bytes as usize, META_PAGE);
        }
        Ok(Segment { mmap, descriptor, region_offsets, array_offsets, pending_written: 0 })
    }

    fn sync_ptr(&self, field_off: usize) -> *const u8 {
        unsafe { self.mmap.as_ptr().add(field_off) }
    }

    fn spinlock(&self) -> &'static AtomicU32 {
        unsafe { atomic_u32(self.sync_ptr(SPINLOCK_OFF)) }
    }

    fn ini_res(&self) -> &'static AtomicU32 {
        unsafe { atomic_u32(self.sync_ptr(INI_RES_OFF)) }
    }

    fn ini_cpl(&self) -> &'static AtomicU32 {
        unsafe { atomic_u32(self.sync_ptr(INI_CPL_OFF)) }
    }

    fn writer_held(&self) -> &'static AtomicU32 {
        unsafe { atomic_u32(self.sync_ptr(WRITER_HELD_OFF)) }
    }

    fn published_atomic(&self) -> &'static AtomicU64 {
        unsafe { atomic_u64(self.sync_ptr(PUBLISHED_OFF)) }
    }

    fn lock(&self) {
        while self
            .spinlock()
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.spinlock().store(0, Ordering::Release);
    }

    fn run_init_protocol(&mut self, template: &SegmentTemplate<'_>) -> Result<()> {
        let won = self
            .ini_res()
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if won {
            self.lock();
            let mut desc_buf = [0u8; DESCRIPTOR_SIZE];
            self.descriptor.write_bytes(&mut desc_buf);
            self.mmap.range_mut(DESCRIPTOR_OFFSET, DESCRIPTOR_SIZE)?.copy_from_slice(&desc_buf);
            let mut imp_buf = [0u8; IMP_SIZE];
            let n = template.imp.len().min(IMP_SIZE);
            imp_buf[..n].copy_from_slice(&template.imp[..n]);
            self.mmap.range_mut(IMP_OFFSET, IMP_SIZE)?.copy_from_slice(&imp_buf);
            self.mmap.flush_sync()?;
            self.ini_cpl().store(1, Ordering::Release);
            self.unlock();
            return Ok(());
        }

        while self.ini_cpl().load(Ordering::Acquire) == 0 {
            std::hint::spin_loop();
        }
        self.lock();
        self.unlock();

        let on_disk = Descriptor::read_bytes(
            &self.mmap.as_slice()[DESCRIPTOR_OFFSET..DESCRIPTOR_OFFSET + DESCRIPTOR_SIZE],
        )?;
        if on_disk != self.descriptor {
            log::error!("reattach descriptor mismatch: on-disk {on_disk:?} vs template {:?}", self.descriptor);
            return Err(Error::DescriptorMismatch("descriptor disagrees with caller template"));
        }
        self.descriptor = on_disk;
        let mut want_imp = [0u8; IMP_SIZE];
        let n = template.imp.len().min(IMP_SIZE);
        want_imp[..n].copy_from_slice(&template.imp[..n]);
        let have_imp = &self.mmap.as_slice()[IMP_OFFSET..IMP_OFFSET + IMP_SIZE];
        if have_imp != want_imp {
            log::error!("reattach imp template mismatch");
            return Err(Error::DescriptorMismatch("imp template disagrees with existing segment"));
        }
        Ok(())
    }

    pub fn elm_max(&self) -> u64 {
        self.descriptor.elm_max
    }

    pub fn array_count(&self) -> usize {
        self.descriptor.elem_sizes.len()
    }

    pub fn region_count(&self) -> usize {
        self.descriptor.region_sizes.len()
    }

    /// Element count visible to every reader, established by the last `wrt_cpl`.
    pub fn published(&self) -> u64 {
        self.published_atomic().load(Ordering::Acquire)
    }

    /// Acquires the write lease, transitioning `writer_held` 0 -> 1.
    pub fn wrt_get(&mut self) -> Result<()> {
        self.lock();
        let got = self
            .writer_held()
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.unlock();
        if !got {
            log::warn!("write lease already held by another attacher");
            return Err(Error::WriteLeaseContended);
        }
        self.pending_written = 0;
        Ok(())
    }

    /// Pointers into each array at the reserved write cursor, valid for `n` elements.
    pub fn wrt_loc(&self, n: u64) -> Result<Vec<*mut u8>> {
        if self.writer_held().load(Ordering::Acquire) == 0 {
            log::error!("wrt_loc called without holding the write lease");
            return Err(Error::WriteLeaseHeld);
        }
        let base = self.published() + self.pending_written;
        if base + n > self.elm_max() {
            log::error!("wrt_loc would reserve past capacity {}", self.elm_max());
            return Err(Error::SegmentFull { capacity: self.elm_max() });
        }
        let mut ptrs = Vec::with_capacity(self.array_offsets.len());
        for (i, &off) in self.array_offsets.iter().enumerate() {
            let stride = self.descriptor.elem_sizes[i] as usize;
            let byte_off = off + (base as usize) * stride;
            ptrs.push(unsafe { self.mmap.as_ptr().add(byte_off) as *mut u8 });
        }
        Ok(ptrs)
    }

    /// Marks `n` elements at the current write cursor as filled.
    pub fn wrt_don(&mut self, n: u64) -> Result<()> {
        if self.writer_held().load(Ordering::Acquire) == 0 {
            log::error!("wrt_don called without holding the write lease");
            return Err(Error::WriteLeaseHeld);
        }
        let new_pending = self.pending_written + n;
        if self.published() + new_pending > self.elm_max() {
            log::error!("wrt_don would publish past capacity {}", self.elm_max());
            return Err(Error::SegmentFull { capacity: self.elm_max() });
        }
        self.pending_written = new_pending;
        Ok(())
    }

    /// Publishes all reserved-but-unpublished elements and releases the lease.
    pub fn wrt_cpl(&mut self) -> Result<()> {
        if self.writer_held().load(Ordering::Acquire) == 0 {
            log::error!("wrt_cpl called without holding the write lease");
            return Err(Error::WriteLeaseHeld);
        }
        self.lock();
        let new_published = self.published() + self.pending_written;
        self.published_atomic().store(new_published, Ordering::Release);
        self.writer_held().store(0, Ordering::Release);
        self.unlock();
        self.pending_written = 0;
        Ok(())
    }

    /// Read-only pointers into each array starting at `start`, valid for `n`
    /// elements. The caller must have already verified `start + n <= published`.
    pub fn red_rng(&self, start: u64, n: u64) -> Result<Vec<*const u8>> {
        let published = self.published();
        if start + n > published {
            log::error!("read past published: requested {}, published {published}", start + n);
            return Err(Error::ReadPastPublished { requested: start + n, published });
        }
        let mut ptrs = Vec::with_capacity(self.array_offsets.len());
        for (i, &off) in self.array_offsets.iter().enumerate() {
            let stride = self.descriptor.elem_sizes[i] as usize;
            let byte_off = off + (start as usize) * stride;
            ptrs.push(unsafe { self.mmap.as_ptr().add(byte_off) });
        }
        Ok(ptrs)
    }

    /// Byte range of auxiliary region `index`, mutable.
    pub fn region_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        let off = *self
            .region_offsets
            .get(index)
            .ok_or(Error::CorruptMetadata("region index out of range"))?;
        let len = self.descriptor.region_sizes[index] as usize;
        self.mmap.range_mut(off, len)
    }

    /// Byte range of auxiliary region `index`, read-only.
    pub fn region(&self, index: usize) -> Result<&[u8]> {
        let off = *self
            .region_offsets
            .get(index)
            .ok_or(Error::CorruptMetadata("region index out of range"))?;
        let len = self.descriptor.region_sizes[index] as usize;
        Ok(&self.mmap.as_slice()[off..off + len])
    }

    /// Raw pointer to a field within region `index`, for embedded atomics
    /// such as a block's `scd_wip`/`scd_ini` flags.
    pub fn region_field_ptr(&self, index: usize, field_off: usize) -> Result<*const u8> {
        let off = *self
            .region_offsets
            .get(index)
            .ok_or(Error::CorruptMetadata("region index out of range"))?;
        Ok(unsafe { self.mmap.as_ptr().add(off + field_off) })
    }
}

#[cfg(target_os = "linux")]
fn publish(tmp: &Path, dest: &Path) -> std::io::Result<()> {
    use std::ffi::CString;
    let tmp_c = CString::new(tmp.as_os_str().to_string_lossy().into_owned())?;
    let dest_c = CString::new(dest.as_os_str().to_string_lossy().into_owned())?;
    let res = unsafe {
        libc::renameat2(
            libc::AT_FDCWD,
            tmp_c.as_ptr(),
            libc::AT_FDCWD,
            dest_c.as_ptr(),
            libc::RENAME_NOREPLACE,
        )
    };
    if res == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn publish(tmp: &Path, dest: &Path) -> std::io::Result<()> {
    if dest.exists() {
        return Err(std::io::Error::from(std::io::ErrorKind::AlreadyExists));
    }
    std::fs::rename(tmp, dest)
}

/// Renders a 0-based block number as 16 lowercase hex digits, per the
/// on-disk block filename convention.
pub fn block_filename(number: u64) -> String {
    format!("{number:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn template(elm_max: u64) -> SegmentTemplate<'static> {
        SegmentTemplate { elm_max, region_sizes: &[], elem_sizes: &[8, 8], imp: b"test-imp" }
    }

    #[test]
    fn create_then_reattach_sees_same_descriptor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg0");
        let t = template(1024);
        let seg = Segment::attach(&path, &t).unwrap();
        assert_eq!(seg.published(), 0);
        assert_eq!(seg.array_count(), 2);

        let seg2 = Segment::attach(&path, &t).unwrap();
        assert_eq!(seg2.elm_max(), 1024);
    }

    #[test]
    fn descriptor_mismatch_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg0");
        let t1 = SegmentTemplate { elm_max: 1024, region_sizes: &[], elem_sizes: &[8, 8], imp: b"a" };
        let _seg = Segment::attach(&path, &t1).unwrap();
        let t2 = SegmentTemplate { elm_max: 2048, region_sizes: &[], elem_sizes: &[8, 8], imp: b"a" };
        let err = Segment::attach(&path, &t2).unwrap_err();
        assert!(matches!(err, Error::DescriptorMismatch(_)));
    }

    #[test]
    fn write_lease_round_trip_and_publish() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg0");
        let t = template(16);
        let mut seg = Segment::attach(&path, &t).unwrap();
        seg.wrt_get().unwrap();
        let ptrs = seg.wrt_loc(4).unwrap();
        unsafe {
            for i in 0..4u64 {
                (ptrs[0] as *mut u64).add(i as usize).write(i * 10);
                (ptrs[1] as *mut u64).add(i as usize).write(i * 20);
            }
        }
        seg.wrt_don(4).unwrap();
        seg.wrt_cpl().unwrap();
        assert_eq!(seg.published(), 4);

        let reads = seg.red_rng(0, 4).unwrap();
        unsafe {
            for i in 0..4u64 {
                assert_eq!((reads[0] as *const u64).add(i as usize).read(), i * 10);
                assert_eq!((reads[1] as *const u64).add(i as usize).read(), i * 20);
            }
        }
    }

    #[test]
    fn write_lease_excludes_concurrent_holder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg0");
        let t = template(16);
        let mut a = Segment::attach(&path, &t).unwrap();
        let mut b = Segment::attach(&path, &t).unwrap();
        a.wrt_get().unwrap();
        assert!(matches!(b.wrt_get(), Err(Error::WriteLeaseContended)));
        a.wrt_cpl().unwrap();
        b.wrt_get().unwrap();
    }

    #[test]
    fn read_past_published_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg0");
        let t = template(16);
        let seg = Segment::attach(&path, &t).unwrap();
        assert!(matches!(seg.red_rng(0, 1), Err(Error::ReadPastPublished { .. })));
    }

    #[test]
    fn durability_across_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg0");
        let t = template(8);
        {
            let mut seg = Segment::attach(&path, &t).unwrap();
            seg.wrt_get().unwrap();
            let ptrs = seg.wrt_loc(3).unwrap();
            unsafe {
                for i in 0..3u64 {
                    (ptrs[0] as *mut u64).add(i as usize).write(i + 100);
                }
            }
            seg.wrt_don(3).unwrap();
            seg.wrt_cpl().unwrap();
        }
        let seg = Segment::attach(&path, &t).unwrap();
        assert_eq!(seg.published(), 3);
        let reads = seg.red_rng(0, 3).unwrap();
        unsafe {
            for i in 0..3u64 {
                assert_eq!((reads[0] as *const u64).add(i as usize).read(), i + 100);
            }
        }
    }
}
