//! Blocking byte-stream pipe between two cooperating processes on the same
//! host, carried entirely over one POSIX shared memory segment and two
//! counting semaphores. The fast path never copies through the kernel: blocks
//! are handed between the producer and the consumer by moving four ring
//! pointers inside the shared header, and the semaphores only come into play
//! when the ring runs full or empty.
//!
//! Each pipe is a single-producer/single-consumer ring of fixed-size blocks.
//! One process creates it, the other opens it; by convention one end writes
//! and the other reads.
//!
//! ## Examples
//! Stream bytes with [`send`](Pipe::send) and [`recv`](Pipe::recv) (each
//! `send` publishes one block marked as a complete message).
//! ```no_run
//! use shmpipe::Pipe;
//!
//! # fn demo() -> shmpipe::Result<()> {
//! // consumer end, created first
//! let reader = Pipe::create("/demo-pipe", 16, 4096)?;
//! // producer end, typically in another process
//! let writer = Pipe::open("/demo-pipe")?;
//!
//! writer.send(b"hello")?;
//!
//! let mut buf = [0u8; 4096];
//! let (n, eof) = reader.recv(&mut buf)?;
//! assert_eq!(b"hello", &buf[..n]);
//! assert!(eof);
//! # Ok(())
//! # }
//! ```
//! Produce and consume in place with the zero-copy buffer interface: a lease
//! points straight into the shared segment.
//! ```no_run
//! use shmpipe::Pipe;
//!
//! # fn demo() -> shmpipe::Result<()> {
//! let reader = Pipe::create("/demo-pipe", 16, 4096)?;
//! let writer = Pipe::open("/demo-pipe")?;
//!
//! let mut buf = writer.get_write_buffer()?;
//! buf.set_len(5);
//! buf.payload_mut().copy_from_slice(b"hello");
//! buf.set_eof(true);
//! writer.send_write_buffer(buf)?;
//!
//! let buf = reader.get_read_buffer()?;
//! assert_eq!(b"hello", buf.payload());
//! reader.send_read_buffer(buf)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency contract
//! A ring tolerates exactly one producer and one consumer at a time; which
//! thread of which process plays which role is the embedding application's
//! responsibility. Both peers must run this crate (or an implementation with
//! the identical layout version): all ring state is accessed through 32-bit
//! atomics with release/acquire ordering, and a peer touching the segment
//! non-atomically voids every guarantee. Acquiring a buffer blocks while the
//! ring is full (writer) or empty (reader); releasing never blocks.
//!
//! [`Pipe::close`] does not unpark a peer that is already blocked inside a
//! semaphore wait; see its documentation for the shutdown convention.

pub mod error;
mod layout;
mod pipe;
mod ring;
mod segment;
mod sem;

// re-export
pub use error::{Error, Result};
pub use layout::{BLOCK_FLAGS_LEN, BLOCK_HEADER_SIZE, SHARED_FLAGS_LEN, SHARED_HEADER_SIZE};
pub use pipe::Pipe;
pub use ring::Buffer;
pub use segment::unlink;
