//! Simplex pipe endpoint and the byte stream layered on top of it.

use crate::error::{self, Error, Result};
use crate::layout::{self, SHARED_FLAGS_LEN};
use crate::ring::{Buffer, Ring};
use crate::segment::{self, Segment};
use memmap2::MmapMut;
use std::cmp::min;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

/// One endpoint of a shared memory pipe.
///
/// Both endpoints of a pipe carry the full API; by convention one process
/// produces through the write half and the other consumes through the read
/// half. The ring supports at most one producer and at most one consumer at
/// a time; that discipline is the embedding application's contract, not
/// something the endpoint can enforce.
///
/// The buffer calls ([`get_write_buffer`](Pipe::get_write_buffer) /
/// [`send_write_buffer`](Pipe::send_write_buffer) and their read twins) are
/// the zero-copy interface: leases point straight into the shared segment.
/// [`send`](Pipe::send), [`recv`](Pipe::recv), [`read_from`](Pipe::read_from)
/// and [`write_to`](Pipe::write_to) layer a byte stream over them, and the
/// endpoint also implements [`std::io::Read`] and [`std::io::Write`].
pub struct Pipe {
    name: String,
    map: Option<MmapMut>,
    ring: Ring,
    closed: AtomicU32,
    // offending ring pointer + 1 once corruption was seen; 0 while healthy
    poisoned: AtomicU32,
    // one-shot end-of-stream marker for the io::Read impl
    pending_eof: AtomicU32,
}

// The endpoint only holds the mapping and atomics; the ring protocol itself
// is safe against the one concurrent peer the contract allows.
unsafe impl Send for Pipe {}
unsafe impl Sync for Pipe {}

impl Pipe {
    /// Creates the shared segment under `name` and maps the first endpoint.
    ///
    /// `block_size` must be a non-zero multiple of 64 and `block_count` at
    /// least 2. Fails if `name` already exists in the shm namespace; stale
    /// names from crashed runs can be removed with [`unlink`](crate::unlink).
    pub fn create(name: &str, block_count: u32, block_size: u32) -> Result<Pipe> {
        let size = layout::segment_size(block_count, block_size)?;
        let mut segment = Segment::create(name, size)?;
        let view = match unsafe { layout::init_segment(segment.map.as_mut_ptr(), block_count, block_size) } {
            Ok(view) => view,
            Err(err) => {
                let _ = segment::unlink(name);
                return Err(err);
            }
        };
        Ok(Pipe::from_parts(segment, Ring::new(view)))
    }

    /// Maps the peer endpoint of an existing pipe.
    ///
    /// Spins until the creator has published the ring, then validates the
    /// layout tag, version, geometry and block links. Opening a segment whose
    /// creator died mid-initialization therefore blocks indefinitely.
    pub fn open(name: &str) -> Result<Pipe> {
        let mut segment = Segment::open(name)?;
        let len = segment.map.len();
        let view = unsafe { layout::open_segment(segment.map.as_mut_ptr(), len)? };
        Ok(Pipe::from_parts(segment, Ring::new(view)))
    }

    fn from_parts(segment: Segment, ring: Ring) -> Pipe {
        Pipe {
            name: segment.name,
            map: Some(segment.map),
            ring,
            closed: AtomicU32::new(0),
            poisoned: AtomicU32::new(0),
            pending_eof: AtomicU32::new(0),
        }
    }

    /// Name of the shared memory segment backing this pipe.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of blocks in the ring.
    pub fn block_count(&self) -> u32 {
        self.ring.view().block_count()
    }

    /// Payload capacity of one block in bytes.
    pub fn block_size(&self) -> u32 {
        self.ring.view().block_size()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) != 0 {
            return Err(error::closed_pipe());
        }
        match self.poisoned.load(Ordering::Acquire) {
            0 => Ok(()),
            index => Err(error::invalid_shared_memory(index - 1)),
        }
    }

    fn poison_check<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(Error::InvalidSharedMemory(index)) = &res {
            self.poisoned
                .store(index.saturating_add(1), Ordering::Release);
        }
        res
    }

    /// Claims the oldest readable block, blocking while the ring is empty.
    /// The lease arrives truncated to the length the producer published.
    pub fn get_read_buffer(&self) -> Result<Buffer<'_>> {
        self.ensure_open()?;
        self.poison_check(self.ring.get_read_buffer())
    }

    /// Returns a consumed read lease to the ring, waking the writer if it is
    /// parked on a full ring. Handing a write lease here fails with
    /// [`Error::InvalidBuffer`]; the rejected lease then releases itself to
    /// its own side when dropped.
    pub fn send_read_buffer(&self, buf: Buffer<'_>) -> Result<()> {
        self.ensure_open()?;
        if buf.is_write() {
            return Err(Error::InvalidBuffer);
        }
        self.poison_check(buf.release()).map(|_| ())
    }

    /// Claims the next free block for production, blocking while the ring is
    /// full. The lease starts empty with [`block_size`](Pipe::block_size)
    /// capacity.
    pub fn get_write_buffer(&self) -> Result<Buffer<'_>> {
        self.ensure_open()?;
        self.poison_check(self.ring.get_write_buffer())
    }

    /// Publishes a write lease with its current length, waking the reader if
    /// it is parked on an empty ring. Returns the number of payload bytes
    /// published. Handing a read lease here fails with
    /// [`Error::InvalidBuffer`].
    pub fn send_write_buffer(&self, buf: Buffer<'_>) -> Result<usize> {
        self.ensure_open()?;
        if !buf.is_write() {
            return Err(Error::InvalidBuffer);
        }
        self.poison_check(buf.release())
    }

    /// Receives one block, copying up to `p.len()` bytes of its payload.
    /// Returns the copied length and whether the block carried the
    /// end-of-stream mark. Bytes beyond `p.len()` are discarded with the
    /// block.
    pub fn recv(&self, p: &mut [u8]) -> Result<(usize, bool)> {
        let buf = self.get_read_buffer()?;
        let n = min(p.len(), buf.len());
        p[..n].copy_from_slice(&buf.payload()[..n]);
        let eof = buf.is_eof();
        self.send_read_buffer(buf)?;
        Ok((n, eof))
    }

    /// Sends up to one block's worth of `p`, truncating silently; the short
    /// return value is the contract, callers with more data loop or use
    /// [`read_from`](Pipe::read_from).
    ///
    /// Every block sent this way carries the end-of-stream mark, so each call
    /// is a self-contained message. [`read_from`](Pipe::read_from) is the
    /// path that marks only the final block.
    pub fn send(&self, p: &[u8]) -> Result<usize> {
        let mut buf = self.get_write_buffer()?;
        let n = min(p.len(), buf.capacity());
        buf.set_len(n);
        buf.payload_mut().copy_from_slice(&p[..n]);
        buf.set_eof(true);
        self.send_write_buffer(buf)?;
        Ok(n)
    }

    /// Streams `src` into the pipe block by block, filling each lease in
    /// place. Only the block published on end-of-stream carries the
    /// end-of-stream mark. Returns the number of bytes transferred.
    ///
    /// A source error aborts the loop after the current lease has been
    /// returned to the ring as an empty block.
    pub fn read_from<R: io::Read>(&self, mut src: R) -> Result<u64> {
        let mut total = 0u64;
        loop {
            let mut buf = self.get_write_buffer()?;
            buf.set_len(buf.capacity());
            match read_retrying(&mut src, buf.payload_mut()) {
                Ok(0) => {
                    buf.set_len(0);
                    buf.set_eof(true);
                    self.send_write_buffer(buf)?;
                    return Ok(total);
                }
                Ok(n) => {
                    buf.set_len(n);
                    buf.set_eof(false);
                    self.send_write_buffer(buf)?;
                    total += n as u64;
                }
                Err(err) => {
                    buf.set_len(0);
                    buf.set_eof(false);
                    self.send_write_buffer(buf)?;
                    return Err(err.into());
                }
            }
        }
    }

    /// Drains the pipe into `dst` until a block carries the end-of-stream
    /// mark. Returns the number of bytes transferred. A sink error aborts the
    /// loop after the current lease has been returned to the ring.
    pub fn write_to<W: io::Write>(&self, mut dst: W) -> Result<u64> {
        let mut total = 0u64;
        loop {
            let buf = self.get_read_buffer()?;
            let res = dst.write_all(buf.payload());
            let n = buf.len();
            let eof = buf.is_eof();
            self.send_read_buffer(buf)?;
            res.map_err(Error::Io)?;
            total += n as u64;
            if eof {
                return Ok(total);
            }
        }
    }

    /// User-defined side-band words in the shared header, visible to both
    /// peers. The ring protocol never touches them.
    pub fn flags(&self) -> Result<&[AtomicU32; SHARED_FLAGS_LEN]> {
        self.ensure_open()?;
        Ok(self.ring.view().header().flags())
    }

    /// Closes this endpoint and unmaps the segment. Idempotent; every
    /// subsequent operation fails with [`Error::ClosedPipe`].
    ///
    /// Closing never unparks the peer: a peer already blocked inside a
    /// semaphore wait stays parked until this side publishes or consumes a
    /// block. Protocols that need a guaranteed shutdown send a final
    /// end-of-stream block before closing. The `&mut` receiver means every
    /// outstanding lease must be released first.
    pub fn close(&mut self) -> Result<()> {
        if self
            .closed
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        self.map.take();
        Ok(())
    }

    /// Removes the segment name from the shm namespace; the mapping stays
    /// usable until both endpoints dropped it.
    pub fn unlink(&self) -> Result<()> {
        segment::unlink(&self.name)
    }
}

fn read_retrying<R: io::Read>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match src.read(buf) {
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            res => return res,
        }
    }
}

/// Byte-stream reads. One call consumes at most one block; after a block with
/// the end-of-stream mark, the next call returns `Ok(0)` once and the stream
/// then resumes with the following message. Zero-length blocks without the
/// mark are skipped.
impl io::Read for &Pipe {
    fn read(&mut self, p: &mut [u8]) -> io::Result<usize> {
        if p.is_empty() {
            return Ok(0);
        }
        if self.pending_eof.swap(0, Ordering::AcqRel) != 0 {
            return Ok(0);
        }
        loop {
            let (n, eof) = self.recv(p)?;
            if eof {
                if n > 0 {
                    self.pending_eof.store(1, Ordering::Release);
                }
                return Ok(n);
            }
            if n > 0 {
                return Ok(n);
            }
        }
    }
}

/// Byte-stream writes; each call publishes one block that carries the
/// end-of-stream mark (see [`Pipe::send`]).
impl io::Write for &Pipe {
    fn write(&mut self, p: &[u8]) -> io::Result<usize> {
        self.send(p).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for Pipe {
    fn read(&mut self, p: &mut [u8]) -> io::Result<usize> {
        (&*self).read(p)
    }
}

impl io::Write for Pipe {
    fn write(&mut self, p: &[u8]) -> io::Result<usize> {
        (&*self).write(p)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{thread_rng, Rng};
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn pipe_pair(tag: &str, block_count: u32, block_size: u32) -> (Pipe, Pipe) {
        let name = format!("/shmpipe-{}-{}", std::process::id(), tag);
        let _ = segment::unlink(&name);
        let creator = Pipe::create(&name, block_count, block_size).unwrap();
        let peer = Pipe::open(&name).unwrap();
        (creator, peer)
    }

    fn cleanup(pipe: &Pipe) {
        pipe.unlink().unwrap();
    }

    #[test]
    fn should_deliver_single_message_with_eof() {
        let (reader, writer) = pipe_pair("hello", 4, 64);

        assert_eq!(5, writer.send(b"hello").unwrap());

        let mut buf = [0u8; 16];
        let (n, eof) = reader.recv(&mut buf).unwrap();
        assert_eq!(5, n);
        assert!(eof);
        assert_eq!(b"hello", &buf[..5]);

        cleanup(&reader);
    }

    #[test]
    fn should_shape_leases() {
        let (reader, writer) = pipe_pair("leases", 4, 64);

        let mut buf = writer.get_write_buffer().unwrap();
        assert_eq!(0, buf.len());
        assert_eq!(64, buf.capacity());
        buf.set_len(9);
        buf.payload_mut().copy_from_slice(b"nine byte");
        assert_eq!(9, writer.send_write_buffer(buf).unwrap());

        let buf = reader.get_read_buffer().unwrap();
        assert_eq!(9, buf.len());
        assert_eq!(b"nine byte", buf.payload());
        assert!(!buf.is_eof());
        reader.send_read_buffer(buf).unwrap();

        cleanup(&reader);
    }

    #[test]
    fn should_truncate_oversize_send() {
        let (reader, writer) = pipe_pair("truncate", 4, 64);

        let big = [7u8; 100];
        assert_eq!(64, writer.send(&big).unwrap());

        let mut buf = [0u8; 128];
        let (n, eof) = reader.recv(&mut buf).unwrap();
        assert_eq!(64, n);
        assert!(eof);
        assert!(buf[..64].iter().all(|&b| b == 7));

        cleanup(&reader);
    }

    #[test]
    fn should_stream_ten_thousand_blocks() {
        let (reader, writer) = pipe_pair("stream", 16, 64);
        const BLOCKS: usize = 10_000;

        let producer = thread::spawn(move || {
            for i in 0..BLOCKS {
                let mut buf = writer.get_write_buffer().unwrap();
                buf.set_len(64);
                buf.payload_mut().fill((i % 251) as u8);
                buf.set_eof(i == BLOCKS - 1);
                writer.send_write_buffer(buf).unwrap();
            }
            writer
        });

        let mut reads = 0usize;
        loop {
            let mut buf = [0u8; 64];
            let (n, eof) = reader.recv(&mut buf).unwrap();
            assert_eq!(64, n);
            assert!(buf.iter().all(|&b| b == (reads % 251) as u8));
            reads += 1;
            if eof {
                break;
            }
        }
        assert_eq!(BLOCKS, reads);

        producer.join().unwrap();
        cleanup(&reader);
    }

    #[test]
    fn should_park_writer_on_full_ring() {
        let (reader, writer) = pipe_pair("full", 2, 64);

        // one in-flight block fills a two-block ring
        writer.send(b"first").unwrap();

        let drained = Arc::new(AtomicBool::new(false));
        let consumer = {
            let drained = drained.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                drained.store(true, Ordering::SeqCst);
                let mut buf = [0u8; 64];
                let (n, _) = reader.recv(&mut buf).unwrap();
                assert_eq!(5, n);
                reader
            })
        };

        // must park until the consumer returns a block
        writer.send(b"second").unwrap();
        assert!(drained.load(Ordering::SeqCst));

        let reader = consumer.join().unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = reader.recv(&mut buf).unwrap();
        assert_eq!(6, n);
        assert_eq!(b"second", &buf[..6]);

        cleanup(&reader);
    }

    #[test]
    fn should_park_reader_on_empty_ring() {
        let (reader, writer) = pipe_pair("empty", 4, 64);

        let published = Arc::new(AtomicBool::new(false));
        let producer = {
            let published = published.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                published.store(true, Ordering::SeqCst);
                writer.send(b"wake").unwrap();
                writer
            })
        };

        let buf = reader.get_read_buffer().unwrap();
        assert!(published.load(Ordering::SeqCst));
        assert_eq!(4, buf.len());
        assert_eq!(b"wake", buf.payload());
        reader.send_read_buffer(buf).unwrap();

        producer.join().unwrap();
        cleanup(&reader);
    }

    #[test]
    fn should_close_idempotently_and_fail_afterwards() {
        let (mut reader, mut writer) = pipe_pair("close", 4, 64);

        writer.send(b"x").unwrap();
        writer.close().unwrap();
        writer.close().unwrap();

        assert!(matches!(writer.send(b"y"), Err(Error::ClosedPipe)));
        assert!(matches!(writer.get_write_buffer(), Err(Error::ClosedPipe)));
        assert!(matches!(writer.flags(), Err(Error::ClosedPipe)));

        // blocks published before the close stay readable on the other end
        let mut buf = [0u8; 8];
        let (n, eof) = reader.recv(&mut buf).unwrap();
        assert_eq!(1, n);
        assert!(eof);
        assert_eq!(b"x", &buf[..1]);

        cleanup(&reader);
        reader.close().unwrap();
        assert!(matches!(reader.recv(&mut buf), Err(Error::ClosedPipe)));
    }

    #[test]
    fn should_poison_endpoint_on_corrupt_ring_pointer() {
        let (reader, writer) = pipe_pair("corrupt", 4, 64);

        // peer scribbles an out-of-range index over the reader's pointer
        reader
            .ring
            .view()
            .header()
            .read_start()
            .store(5, Ordering::SeqCst);

        assert!(matches!(
            reader.get_read_buffer(),
            Err(Error::InvalidSharedMemory(5))
        ));

        // restoring the pointer does not heal the endpoint
        reader
            .ring
            .view()
            .header()
            .read_start()
            .store(0, Ordering::SeqCst);
        let mut buf = [0u8; 8];
        assert!(matches!(
            reader.recv(&mut buf),
            Err(Error::InvalidSharedMemory(5))
        ));

        // the writer endpoint reads its own pointers and keeps going
        writer.send(b"ok").unwrap();

        cleanup(&writer);
    }

    #[test]
    fn should_detect_corrupt_writer_pointer() {
        let (_reader, writer) = pipe_pair("corrupt-writer", 4, 64);

        writer
            .ring
            .view()
            .header()
            .write_start()
            .store(5, Ordering::SeqCst);

        assert!(matches!(
            writer.get_write_buffer(),
            Err(Error::InvalidSharedMemory(5))
        ));

        cleanup(&writer);
    }

    #[test]
    fn should_reject_wrong_direction_release() {
        let (reader, writer) = pipe_pair("direction", 4, 64);

        let buf = writer.get_write_buffer().unwrap();
        assert!(matches!(
            writer.send_read_buffer(buf),
            Err(Error::InvalidBuffer)
        ));

        // the rejected lease released itself on drop, publishing an empty block
        let mut buf = [0u8; 8];
        assert_eq!((0, false), reader.recv(&mut buf).unwrap());

        writer.send(b"ok").unwrap();
        let buf = reader.get_read_buffer().unwrap();
        assert!(matches!(
            reader.send_write_buffer(buf),
            Err(Error::InvalidBuffer)
        ));

        cleanup(&reader);
    }

    #[test]
    fn should_copy_streams_across_chunk_boundaries() {
        let (reader, writer) = pipe_pair("copy", 8, 64);

        let payload: Vec<u8> = (0..10_000).map(|i| (i % 241) as u8).collect();
        let expected = payload.clone();

        let producer = thread::spawn(move || {
            let n = writer.read_from(&payload[..]).unwrap();
            assert_eq!(10_000, n);
            writer
        });

        let mut out = Vec::new();
        let n = reader.write_to(&mut out).unwrap();
        assert_eq!(10_000, n);
        assert_eq!(expected, out);

        producer.join().unwrap();
        cleanup(&reader);
    }

    #[test]
    fn should_round_trip_random_chunks() {
        let (reader, writer) = pipe_pair("random", 8, 64);

        let len = thread_rng().gen_range(10_000..20_000);
        let payload: Vec<u8> = (0..len).map(|_| thread_rng().gen()).collect();
        let expected = payload.clone();

        let producer = thread::spawn(move || {
            let mut sent = 0usize;
            let mut rng = thread_rng();
            while sent < payload.len() {
                let chunk = rng.gen_range(1..=64).min(payload.len() - sent);
                let n = writer.send(&payload[sent..sent + chunk]).unwrap();
                assert_eq!(chunk, n);
                sent += n;
            }
            writer
        });

        let mut out = Vec::with_capacity(len);
        let mut buf = [0u8; 64];
        while out.len() < len {
            let (n, _) = reader.recv(&mut buf).unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(expected, out);

        producer.join().unwrap();
        cleanup(&reader);
    }

    #[test]
    fn should_expose_std_io_streams() {
        let (mut reader, mut writer) = pipe_pair("io", 4, 64);

        assert_eq!(3, writer.write(b"abc").unwrap());
        writer.flush().unwrap();
        assert_eq!(2, writer.write(b"de").unwrap());

        let mut buf = [0u8; 8];
        assert_eq!(3, reader.read(&mut buf).unwrap());
        assert_eq!(b"abc", &buf[..3]);
        // the end-of-stream mark of the first message surfaces once
        assert_eq!(0, reader.read(&mut buf).unwrap());
        assert_eq!(2, reader.read(&mut buf).unwrap());
        assert_eq!(b"de", &buf[..2]);

        cleanup(&reader);
    }

    #[test]
    fn should_share_user_flag_words() {
        let (reader, writer) = pipe_pair("flags", 4, 64);

        writer.flags().unwrap()[0].store(42, Ordering::SeqCst);
        writer.flags().unwrap()[SHARED_FLAGS_LEN - 1].store(7, Ordering::SeqCst);

        assert_eq!(42, reader.flags().unwrap()[0].load(Ordering::SeqCst));
        assert_eq!(
            7,
            reader.flags().unwrap()[SHARED_FLAGS_LEN - 1].load(Ordering::SeqCst)
        );

        cleanup(&reader);
    }

    #[test]
    fn should_report_geometry_and_name() {
        let name = format!("/shmpipe-{}-geometry", std::process::id());
        let _ = segment::unlink(&name);

        let pipe = Pipe::create(&name, 4, 128).unwrap();
        assert_eq!(name, pipe.name());
        assert_eq!(4, pipe.block_count());
        assert_eq!(128, pipe.block_size());

        pipe.unlink().unwrap();
    }

    #[test]
    fn should_reject_bad_geometry_at_creation() {
        let name = format!("/shmpipe-{}-badgeom", std::process::id());
        let _ = segment::unlink(&name);

        assert!(matches!(
            Pipe::create(&name, 4, 65),
            Err(Error::NotMultipleOf64(65))
        ));
        assert!(matches!(
            Pipe::create(&name, 1, 64),
            Err(Error::BlockCountTooSmall(1))
        ));
        // nothing may linger in the namespace after a rejected create
        assert!(matches!(Pipe::open(&name), Err(Error::Io(_))));
    }

    #[test]
    fn should_work_at_minimum_geometry() {
        let (reader, writer) = pipe_pair("minimum", 2, 64);

        for round in 0..100u32 {
            let msg = round.to_le_bytes();
            writer.send(&msg).unwrap();
            let mut buf = [0u8; 4];
            let (n, eof) = reader.recv(&mut buf).unwrap();
            assert_eq!(4, n);
            assert!(eof);
            assert_eq!(msg, buf);
        }

        cleanup(&reader);
    }
}
