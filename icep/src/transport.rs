// Copyright © 2026 The icep Developers
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the “Software”), to
// deal in the Software without restriction, including without limitation the
// rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
// sell copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
// IN THE SOFTWARE.

//! # TRANSPORT CONTRACTS
//!
//! Names the collaborators the connection engine consumes without
//! implementing: the byte-level [Transceiver], the readiness-driven
//! [Thread Pool], and the [Timer]. Concrete transports (TCP, TLS,
//! datagram, ...) and schedulers live outside this crate and plug in
//! through these traits.
//!
//! Also defines the [Buffer], the cursor-tracking byte staging area shared
//! by the engine and every transceiver for partial reads and writes.
//!
//! [Transceiver]: Transceiver
//! [Thread Pool]: ThreadPool
//! [Timer]:       Timer
//! [Buffer]:      Buffer

use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::Connection;
use crate::Error;

/// ## SOCKET OPERATION SET
///
/// A small bitset of I/O interests. Transceiver calls return the operations
/// they need to make further progress; the engine registers exactly those
/// with the [Thread Pool].
///
/// [Thread Pool]: ThreadPool
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SocketOp(u8);

impl SocketOp {
  /// No pending interest; the operation completed.
  pub const NONE: SocketOp = SocketOp(0);

  /// Progress requires the fd to become readable.
  pub const READ: SocketOp = SocketOp(1);

  /// Progress requires the fd to become writable.
  pub const WRITE: SocketOp = SocketOp(2);

  /// Progress requires the in-flight connect to finish.
  pub const CONNECT: SocketOp = SocketOp(4);

  pub fn is_none(self) -> bool {
    self.0 == 0
  }

  pub fn contains(self, other: SocketOp) -> bool {
    self.0 & other.0 != 0
  }

  /// This set with the bits of `other` removed.
  pub fn without(self, other: SocketOp) -> SocketOp {
    SocketOp(self.0 & !other.0)
  }
}

impl BitOr for SocketOp {
  type Output = SocketOp;

  fn bitor(self, rhs: SocketOp) -> SocketOp {
    SocketOp(self.0 | rhs.0)
  }
}

impl BitOrAssign for SocketOp {
  fn bitor_assign(&mut self, rhs: SocketOp) {
    self.0 |= rhs.0;
  }
}

/// ## BUFFER
///
/// A byte buffer with a cursor, staging one partially read or written
/// message. The cursor marks how far the transfer has progressed; a buffer
/// is complete when the cursor reaches its end.
#[derive(Debug, Default)]
pub struct Buffer {
  data: Vec<u8>,
  pos: usize,
}

impl Buffer {
  pub fn new() -> Self {
    Self::default()
  }

  /// A zero-filled buffer of `len` bytes with the cursor at the start,
  /// ready to receive that many bytes.
  pub fn with_len(len: usize) -> Self {
    Buffer {
      data: vec![0; len],
      pos: 0,
    }
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn pos(&self) -> usize {
    self.pos
  }

  /// Whether the cursor has reached the end of the buffer.
  pub fn is_complete(&self) -> bool {
    self.pos == self.data.len()
  }

  /// The bytes still to be transferred.
  pub fn remaining(&self) -> &[u8] {
    &self.data[self.pos..]
  }

  /// The writable tail still to be filled.
  pub fn remaining_mut(&mut self) -> &mut [u8] {
    &mut self.data[self.pos..]
  }

  /// Moves the cursor forward after a successful partial transfer.
  pub fn advance(&mut self, count: usize) {
    debug_assert!(self.pos + count <= self.data.len());
    self.pos += count;
  }

  /// Grows or shrinks the buffer in place, keeping data and cursor. Used to
  /// extend a header-sized read buffer to the full declared message size.
  pub fn resize(&mut self, len: usize) {
    self.data.resize(len, 0);
    if self.pos > len {
      self.pos = len;
    }
  }

  /// The whole underlying byte slice, regardless of the cursor.
  pub fn data(&self) -> &[u8] {
    &self.data
  }

  /// Replaces the contents with `data`, cursor at the start.
  pub fn load(&mut self, data: Vec<u8>) {
    self.data = data;
    self.pos = 0;
  }

  /// Takes the contents out, leaving the buffer empty.
  pub fn take(&mut self) -> Vec<u8> {
    self.pos = 0;
    std::mem::take(&mut self.data)
  }

  /// Empties the buffer.
  pub fn clear(&mut self) {
    self.data.clear();
    self.pos = 0;
  }
}

/// ## TRANSCEIVER
///
/// Non-blocking byte transport for one connection. Every call either
/// completes and returns [NONE], or returns the interest set it needs to
/// make progress, leaving the buffer cursor wherever the partial transfer
/// stopped. Implementations never block.
///
/// [NONE]: SocketOp::NONE
pub trait Transceiver: Send {
  /// Drives the transport-level handshake (connect completion, TLS, ...).
  /// Called repeatedly until it returns [NONE](SocketOp::NONE).
  fn initialize(&mut self, read_buf: &mut Buffer, write_buf: &mut Buffer)
    -> Result<SocketOp, Error>;

  /// Reads into the buffer's remaining space, advancing its cursor.
  fn read(&mut self, buf: &mut Buffer) -> Result<SocketOp, Error>;

  /// Writes from the buffer's remaining bytes, advancing its cursor.
  fn write(&mut self, buf: &mut Buffer) -> Result<SocketOp, Error>;

  /// Notifies the transport that a graceful close is in progress.
  /// `initiator` is true when this side sent the close message. The
  /// returned interest, if any, lets the transport observe the peer's
  /// shutdown (typically a read to detect the FIN).
  fn closing(&mut self, initiator: bool, error: &Error) -> SocketOp;

  /// Releases the transport. Called exactly once, after the thread pool has
  /// confirmed unregistration.
  fn close(&mut self);

  /// Rejects messages the transport can never send (datagram payload
  /// limits). Stream transports accept everything.
  fn check_send_size(&self, size: usize) -> Result<(), Error> {
    let _ = size;
    Ok(())
  }

  /// Whether this transport is a datagram transport. Datagram connections
  /// skip validation and graceful close.
  fn is_datagram(&self) -> bool {
    false
  }

  /// A human-readable description of the endpoint pair, used in logs.
  fn description(&self) -> String;
}

/// ## THREAD POOL
///
/// The readiness-driven scheduler the engine consumes. The pool watches
/// registered connections and calls [`Connection::on_ready`] with the ready
/// operation, with the guarantee that at most one pool thread drives a given
/// connection at a time.
///
/// Implementations must not call back into the connection from inside
/// `register`/`unregister`/`update`/`finish`; those are invoked with the
/// connection's lock held. After `finish` the pool must stop watching the
/// connection and then call [`Connection::finished`] once from a pool
/// thread.
///
/// [`Connection::on_ready`]: crate::connection::Connection::on_ready
/// [`Connection::finished`]: crate::connection::Connection::finished
pub trait ThreadPool: Send + Sync {
  /// Starts watching the connection for `interest`.
  fn register(&self, connection: &Arc<Connection>, interest: SocketOp);

  /// Stops watching the connection for `interest`.
  fn unregister(&self, connection: &Arc<Connection>, interest: SocketOp);

  /// Atomically replaces the interest set registered for the connection.
  fn update(&self, connection: &Arc<Connection>, old: SocketOp, new: SocketOp);

  /// Begins tearing the connection down. Returns true when the transceiver
  /// can be closed immediately; otherwise the pool closes it when its own
  /// bookkeeping allows.
  fn finish(&self, connection: &Arc<Connection>) -> bool;

  /// Runs user-level work from the current pool thread's dispatch context,
  /// so long dispatches do not starve the I/O loop.
  fn dispatch_from_this_thread(&self, work: Box<dyn FnOnce() + Send>);
}

/// Identifies one scheduled timer task for cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerToken(pub u64);

/// ## TIMER
///
/// One-shot task scheduling for protocol timeouts. Tasks run on a timer
/// thread and must not be canceled-and-rescheduled concurrently with
/// themselves; the engine serializes its own use.
pub trait Timer: Send + Sync {
  /// Schedules `task` to run once after `delay`.
  fn schedule(&self, task: Box<dyn FnOnce() + Send>, delay: Duration) -> TimerToken;

  /// Cancels a scheduled task. Cancelation of an already-fired task is a
  /// no-op.
  fn cancel(&self, token: TimerToken);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_socket_op_set_algebra() {
    let both: SocketOp = SocketOp::READ | SocketOp::WRITE;
    assert!(both.contains(SocketOp::READ));
    assert!(both.contains(SocketOp::WRITE));
    assert!(!both.contains(SocketOp::CONNECT));
    assert_eq!(both.without(SocketOp::READ), SocketOp::WRITE);
    assert!(SocketOp::NONE.is_none());
    assert!(!both.is_none());
  }

  #[test]
  fn test_buffer_cursor_tracking() {
    let mut buf = Buffer::with_len(4);
    assert_eq!(buf.remaining().len(), 4);
    buf.advance(3);
    assert!(!buf.is_complete());
    assert_eq!(buf.remaining().len(), 1);
    buf.advance(1);
    assert!(buf.is_complete());
  }

  #[test]
  fn test_buffer_resize_keeps_cursor() {
    let mut buf = Buffer::with_len(14);
    buf.advance(14);
    buf.resize(64);
    assert_eq!(buf.pos(), 14);
    assert_eq!(buf.remaining().len(), 50);
  }

  #[test]
  fn test_buffer_take_resets() {
    let mut buf = Buffer::new();
    buf.load(vec![1, 2, 3]);
    buf.advance(3);
    let data: Vec<u8> = buf.take();
    assert_eq!(data, vec![1, 2, 3]);
    assert!(buf.is_empty());
    assert_eq!(buf.pos(), 0);
  }
}
