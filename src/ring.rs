//! Four-pointer block ring protocol and the buffer lease it hands out.
//!
//! The ring is one circular doubly-linked list of blocks cut into four arcs by
//! the pointers in the shared header, walked in `next` order:
//!
//! ```text
//! [read_end … write_start)   available to the writer
//! [write_start … write_end)  held by the writer, being produced
//! [write_end … read_start)   readable
//! [read_start … read_end)    held by the reader, being consumed
//! ```
//!
//! Acquire operations move a `start` pointer forward with a CAS and park on
//! one of the embedded semaphores when their arc is empty (reader) or the ring
//! is full (writer). Release operations mark the block done and then advance
//! the matching `end` pointer over every contiguous finished block, posting
//! the counterparty's semaphore exactly when it could be parked. Release never
//! suspends.

use crate::error::{self, Result};
use crate::layout::{BlockHeader, SegmentView, BLOCK_FLAGS_LEN};
use std::cmp::min;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::Ordering;

/// Flag byte carrying the end-of-stream bit.
const EOF_FLAG_INDEX: usize = 0;
/// Bit marking a block as the terminal block of a message.
const EOF_FLAG_MASK: u8 = 0x01;

/// Protocol state machine over one mapped ring.
pub(crate) struct Ring {
    view: SegmentView,
}

impl Ring {
    pub(crate) fn new(view: SegmentView) -> Ring {
        Ring { view }
    }

    #[inline]
    pub(crate) fn view(&self) -> &SegmentView {
        &self.view
    }

    /// Loads a block behind an index read from shared memory. Anything outside
    /// `[0, block_count)` means the peer scribbled over the header.
    #[inline]
    fn checked_block(&self, index: u32) -> Result<&BlockHeader> {
        if index >= self.view.block_count() {
            return Err(error::invalid_shared_memory(index));
        }
        Ok(self.view.block(index))
    }

    /// Claims the next free block for production, parking while the ring is
    /// full. The returned lease is empty with `block_size` capacity.
    pub(crate) fn get_write_buffer(&self) -> Result<Buffer<'_>> {
        let header = self.view.header();
        loop {
            let index = header.write_start().load(Ordering::Acquire);
            let block = self.checked_block(index)?;

            // Taking the block whose successor is read_end would collide with
            // the span the reader still holds: that is the full condition.
            if block.next() == header.read_end().load(Ordering::Acquire) {
                header.sem_avail().wait()?;
                continue;
            }

            if header
                .write_start()
                .compare_exchange(index, block.next(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(Buffer::new(self, index, 0, true));
            }
        }
    }

    /// Claims the oldest readable block, parking while the ring is empty. The
    /// returned lease exposes the payload truncated to the published size.
    pub(crate) fn get_read_buffer(&self) -> Result<Buffer<'_>> {
        let header = self.view.header();
        loop {
            let index = header.read_start().load(Ordering::Acquire);
            let block = self.checked_block(index)?;

            // read_start meeting write_end means the readable arc is empty.
            if index == header.write_end().load(Ordering::Acquire) {
                header.sem_signal().wait()?;
                continue;
            }

            if header
                .read_start()
                .compare_exchange(index, block.next(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let len = min(
                    block.size().load(Ordering::Acquire) as usize,
                    self.view.block_size() as usize,
                );
                return Ok(Buffer::new(self, index, len, false));
            }
        }
    }

    /// Publishes a produced block and advances `write_end` over the run of
    /// finished blocks starting at it.
    fn release_write(&self, buf: &Buffer<'_>) -> Result<usize> {
        let produced = buf.len;
        let block = self.view.block(buf.index);
        block.size().store(produced as u64, Ordering::Relaxed);
        block.done_write().store(1, Ordering::Release);

        let header = self.view.header();
        loop {
            let index = header.write_end().load(Ordering::Acquire);
            let block = self.checked_block(index)?;

            // The CAS both tests and reclaims the done flag; a plain load here
            // would let two interleaved releases advance past the same block.
            if block
                .done_write()
                .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Ok(produced);
            }

            let _ = header.write_end().compare_exchange(
                index,
                block.next(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );

            // A reader parked on the empty ring is waiting for exactly the
            // block read_start points at.
            if index == header.read_start().load(Ordering::Acquire) {
                header.sem_signal().post()?;
            }
        }
    }

    /// Returns a consumed block to the writer and advances `read_end` over the
    /// run of finished blocks starting at it.
    fn release_read(&self, buf: &Buffer<'_>) -> Result<()> {
        let block = self.view.block(buf.index);
        block.done_read().store(1, Ordering::Release);

        let header = self.view.header();
        loop {
            let index = header.read_end().load(Ordering::Acquire);
            let block = self.checked_block(index)?;

            if block
                .done_read()
                .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Ok(());
            }

            let _ = header.read_end().compare_exchange(
                index,
                block.next(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );

            // A writer parked on the full ring is waiting for the predecessor
            // of write_start to come free.
            if block.prev() == header.write_start().load(Ordering::Acquire) {
                header.sem_avail().post()?;
            }
        }
    }
}

/// Exclusive lease of one block's payload and flag bytes.
///
/// A write lease starts empty with [`capacity`](Buffer::capacity) equal to the
/// ring's block size: extend it with [`set_len`](Buffer::set_len) and fill
/// [`payload_mut`](Buffer::payload_mut) in place. A read lease arrives
/// pre-truncated to what the producer published. Both point straight into the
/// shared segment; no copy happens on either side.
///
/// The lease is consumed by the matching send call on the endpoint. A lease
/// that is dropped instead releases itself the same way, discarding any error
/// (a dropped write lease publishes whatever length was set).
pub struct Buffer<'a> {
    ring: &'a Ring,
    index: u32,
    payload: NonNull<u8>,
    len: usize,
    capacity: usize,
    write: bool,
}

impl<'a> Buffer<'a> {
    fn new(ring: &'a Ring, index: u32, len: usize, write: bool) -> Buffer<'a> {
        Buffer {
            ring,
            index,
            payload: NonNull::new(ring.view.payload_ptr(index)).expect("payload pointer"),
            len,
            capacity: ring.view.block_size() as usize,
            write,
        }
    }

    /// Current payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload capacity of the underlying block.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sets the payload length, clamped to [`capacity`](Buffer::capacity).
    /// For a write lease this is the size the send call will publish.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        self.len = min(len, self.capacity);
    }

    /// Payload as a byte slice.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.payload.as_ptr(), self.len) }
    }

    /// Payload as a mutable byte slice, in place in the shared segment.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.payload.as_ptr(), self.len) }
    }

    /// Message-level flag bytes carried next to the payload.
    #[inline]
    pub fn flags(&self) -> &[u8] {
        let block = self.ring.view.block(self.index);
        unsafe { slice::from_raw_parts(block.flags_ptr(), BLOCK_FLAGS_LEN) }
    }

    /// Mutable view of the flag bytes.
    #[inline]
    pub fn flags_mut(&mut self) -> &mut [u8] {
        let block = self.ring.view.block(self.index);
        unsafe { slice::from_raw_parts_mut(block.flags_ptr(), BLOCK_FLAGS_LEN) }
    }

    /// Whether this block is marked as the terminal block of a message.
    #[inline]
    pub fn is_eof(&self) -> bool {
        self.flags()[EOF_FLAG_INDEX] & EOF_FLAG_MASK != 0
    }

    /// Sets or clears the end-of-stream mark.
    #[inline]
    pub fn set_eof(&mut self, eof: bool) {
        let flags = self.flags_mut();
        if eof {
            flags[EOF_FLAG_INDEX] |= EOF_FLAG_MASK;
        } else {
            flags[EOF_FLAG_INDEX] &= !EOF_FLAG_MASK;
        }
    }

    #[inline]
    pub(crate) fn is_write(&self) -> bool {
        self.write
    }

    /// Releases the lease back to the ring, returning the published length.
    pub(crate) fn release(self) -> Result<usize> {
        let buf = ManuallyDrop::new(self);
        buf.release_impl()
    }

    fn release_impl(&self) -> Result<usize> {
        if self.write {
            self.ring.release_write(self)
        } else {
            self.ring.release_read(self).map(|()| self.len)
        }
    }
}

impl Drop for Buffer<'_> {
    fn drop(&mut self) {
        let _ = self.release_impl();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::layout::{self, testing::HeapRegion};

    fn heap_ring(block_count: u32, block_size: u32) -> (HeapRegion, Ring) {
        let size = layout::segment_size(block_count, block_size).unwrap();
        let region = HeapRegion::new(size);
        let view = unsafe { layout::init_segment(region.as_mut_ptr(), block_count, block_size).unwrap() };
        (region, Ring::new(view))
    }

    #[test]
    fn should_shape_write_and_read_leases() {
        let (_region, ring) = heap_ring(4, 64);

        let mut buf = ring.get_write_buffer().unwrap();
        assert_eq!(0, buf.len());
        assert!(buf.is_empty());
        assert_eq!(64, buf.capacity());
        assert!(!buf.is_eof());

        buf.set_len(5);
        buf.payload_mut().copy_from_slice(b"hello");
        buf.set_eof(true);
        assert_eq!(5, buf.release().unwrap());

        let buf = ring.get_read_buffer().unwrap();
        assert_eq!(5, buf.len());
        assert_eq!(64, buf.capacity());
        assert_eq!(b"hello", buf.payload());
        assert!(buf.is_eof());
        buf.release().unwrap();
    }

    #[test]
    fn should_deliver_blocks_in_fifo_order() {
        let (_region, ring) = heap_ring(4, 64);

        for msg in [&b"one"[..], b"two", b"three"] {
            let mut buf = ring.get_write_buffer().unwrap();
            buf.set_len(msg.len());
            buf.payload_mut().copy_from_slice(msg);
            buf.release().unwrap();
        }

        for msg in [&b"one"[..], b"two", b"three"] {
            let buf = ring.get_read_buffer().unwrap();
            assert_eq!(msg, buf.payload());
            buf.release().unwrap();
        }
    }

    #[test]
    fn should_clamp_set_len_to_capacity() {
        let (_region, ring) = heap_ring(4, 64);
        let mut buf = ring.get_write_buffer().unwrap();
        buf.set_len(1000);
        assert_eq!(64, buf.len());
        buf.release().unwrap();
    }

    #[test]
    fn should_stall_write_end_behind_unfinished_block() {
        let (_region, ring) = heap_ring(4, 64);
        let header = ring.view().header();

        let mut first = ring.get_write_buffer().unwrap();
        let mut second = ring.get_write_buffer().unwrap();
        assert_eq!(2, header.write_start().load(Ordering::SeqCst));

        // finishing out of order must not advance write_end past block 0
        second.set_len(3);
        second.payload_mut().copy_from_slice(b"two");
        second.release().unwrap();
        assert_eq!(0, header.write_end().load(Ordering::SeqCst));

        first.set_len(3);
        first.payload_mut().copy_from_slice(b"one");
        first.release().unwrap();
        assert_eq!(2, header.write_end().load(Ordering::SeqCst));

        let buf = ring.get_read_buffer().unwrap();
        assert_eq!(b"one", buf.payload());
        buf.release().unwrap();
        let buf = ring.get_read_buffer().unwrap();
        assert_eq!(b"two", buf.payload());
        buf.release().unwrap();
        assert_eq!(2, header.read_end().load(Ordering::SeqCst));
    }

    #[test]
    fn should_publish_partial_block_on_drop() {
        let (_region, ring) = heap_ring(4, 64);

        let mut buf = ring.get_write_buffer().unwrap();
        buf.set_len(3);
        buf.payload_mut().copy_from_slice(b"abc");
        drop(buf);

        let buf = ring.get_read_buffer().unwrap();
        assert_eq!(b"abc", buf.payload());
        drop(buf);

        assert_eq!(1, ring.view().header().read_end().load(Ordering::SeqCst));
    }

    #[test]
    fn should_clamp_read_lease_to_block_size() {
        let (_region, ring) = heap_ring(4, 64);

        let buf = ring.get_write_buffer().unwrap();
        buf.release().unwrap();

        // a corrupt peer publishing an oversize length must not widen the lease
        ring.view().block(0).size().store(10_000, Ordering::SeqCst);

        let buf = ring.get_read_buffer().unwrap();
        assert_eq!(64, buf.len());
        buf.release().unwrap();
    }

    #[test]
    fn should_fail_on_out_of_range_ring_pointer() {
        let (_region, ring) = heap_ring(4, 64);
        let header = ring.view().header();

        header.write_start().store(5, Ordering::SeqCst);
        assert!(matches!(
            ring.get_write_buffer(),
            Err(Error::InvalidSharedMemory(5))
        ));

        header.read_start().store(99, Ordering::SeqCst);
        assert!(matches!(
            ring.get_read_buffer(),
            Err(Error::InvalidSharedMemory(99))
        ));
    }
}
