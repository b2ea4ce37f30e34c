//! Fixed memory layout of the shared segment.
//!
//! A segment is a [`SharedHeader`] followed by `block_count` slots, each a
//! [`BlockHeader`] immediately followed by `block_size` payload bytes. Both
//! peers map the same bytes, so every field here is `repr(C)` and the layout
//! is guarded by a magic tag and a version word checked at open time. All
//! index-to-address math lives in [`SegmentView`]; protocol code never touches
//! raw offsets.

use crate::error::{Error, Result};
use crate::sem::Semaphore;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::hint;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Shared header size in bytes.
pub const SHARED_HEADER_SIZE: usize = size_of::<SharedHeader>();
/// Block header size in bytes.
pub const BLOCK_HEADER_SIZE: usize = size_of::<BlockHeader>();
/// Number of per-block flag bytes carried next to each payload.
pub const BLOCK_FLAGS_LEN: usize = 8;
/// Number of user-defined side-band words in the shared header.
pub const SHARED_FLAGS_LEN: usize = 8;

/// Payloads stay cache-line aligned as long as the block size is a multiple of this.
pub(crate) const PAYLOAD_ALIGN: u32 = 64;

const MAGIC: u64 = u64::from_be_bytes(*b"shmpipe1");
const LAYOUT_VERSION: u32 = 1;

/// Shared ring header. One per segment, written by the creator, mapped by both
/// peers. The four ring pointers are padded onto their own cache lines; the two
/// counting semaphores live directly inside the header so that both processes
/// address the same `sem_t`.
#[repr(C)]
pub(crate) struct SharedHeader {
    magic: u64,
    version: u32,
    block_count: u32,
    block_size: u32,
    ready: AtomicU32,
    read_start: CachePadded<AtomicU32>,
    read_end: CachePadded<AtomicU32>,
    write_start: CachePadded<AtomicU32>,
    write_end: CachePadded<AtomicU32>,
    sem_avail: UnsafeCell<libc::sem_t>,
    sem_signal: UnsafeCell<libc::sem_t>,
    flags: [AtomicU32; SHARED_FLAGS_LEN],
}

impl SharedHeader {
    #[inline]
    pub(crate) fn block_count(&self) -> u32 {
        self.block_count
    }

    #[inline]
    pub(crate) fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Next block the reader will acquire. Reader-owned.
    #[inline]
    pub(crate) fn read_start(&self) -> &AtomicU32 {
        &self.read_start
    }

    /// Oldest block the reader has acquired but not yet released. Reader-owned.
    #[inline]
    pub(crate) fn read_end(&self) -> &AtomicU32 {
        &self.read_end
    }

    /// Next block the writer will acquire. Writer-owned.
    #[inline]
    pub(crate) fn write_start(&self) -> &AtomicU32 {
        &self.write_start
    }

    /// Oldest block the writer has filled but not yet released. Writer-owned.
    #[inline]
    pub(crate) fn write_end(&self) -> &AtomicU32 {
        &self.write_end
    }

    /// Posted by the reader when a block returns to the writer's span.
    #[inline]
    pub(crate) fn sem_avail(&self) -> Semaphore {
        Semaphore::new(&self.sem_avail)
    }

    /// Posted by the writer when a block becomes readable.
    #[inline]
    pub(crate) fn sem_signal(&self) -> Semaphore {
        Semaphore::new(&self.sem_signal)
    }

    /// User-defined side-band words. The ring protocol never consults them.
    #[inline]
    pub(crate) fn flags(&self) -> &[AtomicU32; SHARED_FLAGS_LEN] {
        &self.flags
    }
}

/// One block slot header. The payload follows directly behind it.
#[repr(C)]
pub(crate) struct BlockHeader {
    next: u32,
    prev: u32,
    done_read: AtomicU32,
    done_write: AtomicU32,
    size: AtomicU64,
    flags: UnsafeCell<[u8; BLOCK_FLAGS_LEN]>,
    _pad: [u8; 32],
}

impl BlockHeader {
    /// Successor in the circular list. Fixed at segment initialization.
    #[inline]
    pub(crate) fn next(&self) -> u32 {
        self.next
    }

    /// Predecessor in the circular list. Fixed at segment initialization.
    #[inline]
    pub(crate) fn prev(&self) -> u32 {
        self.prev
    }

    #[inline]
    pub(crate) fn done_read(&self) -> &AtomicU32 {
        &self.done_read
    }

    #[inline]
    pub(crate) fn done_write(&self) -> &AtomicU32 {
        &self.done_write
    }

    /// Payload length published by the producer.
    #[inline]
    pub(crate) fn size(&self) -> &AtomicU64 {
        &self.size
    }

    /// Message-level flag bytes; bit 0 of byte 0 is the end-of-stream bit.
    #[inline]
    pub(crate) fn flags_ptr(&self) -> *mut u8 {
        self.flags.get().cast()
    }
}

const _: () = assert!(size_of::<BlockHeader>() == 64);
const _: () = assert!(SHARED_HEADER_SIZE % PAYLOAD_ALIGN as usize == 0);

/// Stride of one slot: block header plus payload.
#[inline]
pub(crate) const fn full_block_size(block_size: u32) -> usize {
    BLOCK_HEADER_SIZE + block_size as usize
}

/// Validates ring geometry and returns the segment size it needs.
pub(crate) fn segment_size(block_count: u32, block_size: u32) -> Result<usize> {
    if block_size == 0 || block_size % PAYLOAD_ALIGN != 0 {
        return Err(Error::NotMultipleOf64(block_size));
    }
    if block_count < 2 {
        return Err(Error::BlockCountTooSmall(block_count));
    }
    (block_count as usize)
        .checked_mul(full_block_size(block_size))
        .and_then(|blocks| blocks.checked_add(SHARED_HEADER_SIZE))
        .ok_or(Error::SegmentTooLarge)
}

/// View over one mapped segment: base pointer plus the layout constants.
/// Copies of `block_count`/`block_size` are held locally so they survive the
/// mapping and cannot be shifted under us by a misbehaving peer.
#[derive(Clone, Copy)]
pub(crate) struct SegmentView {
    base: NonNull<u8>,
    block_count: u32,
    block_size: u32,
    full_block_size: usize,
}

impl SegmentView {
    /// # Safety
    /// `base` must point to a live mapping laid out for exactly this geometry.
    unsafe fn from_raw(base: *mut u8, block_count: u32, block_size: u32) -> SegmentView {
        SegmentView {
            base: NonNull::new(base).expect("segment base pointer must be valid"),
            block_count,
            block_size,
            full_block_size: full_block_size(block_size),
        }
    }

    #[inline]
    pub(crate) fn block_count(&self) -> u32 {
        self.block_count
    }

    #[inline]
    pub(crate) fn block_size(&self) -> u32 {
        self.block_size
    }

    #[inline]
    pub(crate) fn header(&self) -> &SharedHeader {
        unsafe { &*self.base.as_ptr().cast::<SharedHeader>() }
    }

    #[inline]
    fn block_ptr(&self, index: u32) -> *mut BlockHeader {
        debug_assert!(index < self.block_count);
        unsafe {
            self.base
                .as_ptr()
                .add(SHARED_HEADER_SIZE + index as usize * self.full_block_size)
                .cast::<BlockHeader>()
        }
    }

    #[inline]
    pub(crate) fn block(&self, index: u32) -> &BlockHeader {
        unsafe { &*self.block_ptr(index) }
    }

    #[inline]
    pub(crate) fn payload_ptr(&self, index: u32) -> *mut u8 {
        unsafe { self.block_ptr(index).cast::<u8>().add(BLOCK_HEADER_SIZE) }
    }
}

/// Lays a fresh ring out in `base` and publishes it to openers.
///
/// # Safety
/// `base` must point to a zeroed, writable region of at least
/// `segment_size(block_count, block_size)` bytes with cache-line alignment,
/// and the geometry must already be validated.
pub(crate) unsafe fn init_segment(
    base: *mut u8,
    block_count: u32,
    block_size: u32,
) -> Result<SegmentView> {
    let view = SegmentView::from_raw(base, block_count, block_size);

    for index in 0..block_count {
        let block = view.block_ptr(index);
        (*block).next = if index + 1 == block_count { 0 } else { index + 1 };
        (*block).prev = if index == 0 { block_count - 1 } else { index - 1 };
    }

    let header = base.cast::<SharedHeader>();
    (*header).block_count = block_count;
    (*header).block_size = block_size;
    view.header().sem_avail().init()?;
    view.header().sem_signal().init()?;
    (*header).magic = MAGIC;
    (*header).version = LAYOUT_VERSION;

    // Openers spin on this; everything above must be in place first.
    view.header().ready.store(1, Ordering::Release);
    Ok(view)
}

/// Validates a mapped segment created by a peer and returns a view over it.
///
/// Blocks until the creator has published the ring, then checks the layout
/// tag, the declared geometry against the mapping size, and walks the block
/// links once around the ring.
///
/// # Safety
/// `base` must point to a live mapping of `map_len` bytes.
pub(crate) unsafe fn open_segment(base: *mut u8, map_len: usize) -> Result<SegmentView> {
    if map_len < SHARED_HEADER_SIZE {
        return Err(Error::SegmentTruncated {
            expected: SHARED_HEADER_SIZE,
            found: map_len,
        });
    }

    let header = base.cast::<SharedHeader>();
    while (*header).ready.load(Ordering::Acquire) == 0 {
        hint::spin_loop();
    }

    if (*header).magic != MAGIC {
        return Err(Error::BadMagic);
    }
    if (*header).version != LAYOUT_VERSION {
        return Err(Error::VersionMismatch {
            expected: LAYOUT_VERSION,
            found: (*header).version,
        });
    }

    let block_count = (*header).block_count;
    let block_size = (*header).block_size;
    let expected = segment_size(block_count, block_size)?;
    if map_len < expected {
        return Err(Error::SegmentTruncated {
            expected,
            found: map_len,
        });
    }

    let view = SegmentView::from_raw(base, block_count, block_size);
    validate_links(&view)?;
    Ok(view)
}

/// Walks the `next` chain once around the ring: every link must stay in range
/// and the walk must return to block 0 after exactly `block_count` steps.
fn validate_links(view: &SegmentView) -> Result<()> {
    let block_count = view.block_count();
    let mut index = 0;
    for _ in 0..block_count {
        let block = view.block(index);
        if block.next() >= block_count || block.prev() >= block_count {
            return Err(Error::InvalidBlockIndex(index));
        }
        if view.block(block.next()).prev() != index {
            return Err(Error::InvalidBlockIndex(block.next()));
        }
        index = block.next();
    }
    if index != 0 {
        return Err(Error::InvalidBlockIndex(index));
    }
    Ok(())
}
