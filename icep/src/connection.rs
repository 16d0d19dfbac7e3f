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

//! # CONNECTION
//!
//! The per-connection core of the engine: one [Connection] owns one
//! [Transceiver] and multiplexes requests, replies and control messages over
//! it, driven by [Thread Pool] readiness callbacks.
//!
//! All connection state lives behind a single mutex. Socket I/O happens in
//! short critical sections through the transceiver's non-blocking calls;
//! user code (servant dispatch, reply completion, sent-callbacks, heartbeat
//! callbacks) always runs outside the lock.
//!
//! ---------------------------------------------------------------------------
//!
//! The [Connection State] advances monotonically once shutdown begins:
//!
//! - [NOT INITIALIZED] - the transceiver handshake has not finished.
//! - [NOT VALIDATED] - awaiting the validate-connection exchange.
//! - [ACTIVE] - reads armed; requests flow in both directions.
//! - [HOLDING] - reads paused; pending dispatches complete.
//! - [CLOSING] - graceful close requested; draining.
//! - [CLOSING PENDING] - close message on the wire; awaiting the peer.
//! - [CLOSED] - fatal or final; resources being torn down.
//! - [FINISHED] - fully reaped.
//!
//! [Connection]:      Connection
//! [Transceiver]:     crate::transport::Transceiver
//! [Thread Pool]:     crate::transport::ThreadPool
//! [Connection State]: State
//! [NOT INITIALIZED]: State::NotInitialized
//! [NOT VALIDATED]:   State::NotValidated
//! [ACTIVE]:          State::Active
//! [HOLDING]:         State::Holding
//! [CLOSING]:         State::Closing
//! [CLOSING PENDING]: State::ClosingPending
//! [CLOSED]:          State::Closed
//! [FINISHED]:        State::Finished

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use atomic::Atomic;
use bytemuck::NoUninit;
use log::{trace, warn};

use crate::acm::{AcmClose, AcmConfig, AcmHeartbeat};
use crate::dispatch::{self, ServantManager};
use crate::invocation::{BatchQueue, Invocation};
use crate::transport::{Buffer, SocketOp, ThreadPool, Timer, TimerToken, Transceiver};
use crate::{
  CompressionStatus, Error, InputStream, MessageHeader, MessageType, SendError,
  COMPRESSION_STATUS_POS, HEADER_SIZE, MESSAGE_SIZE_POS, REQUEST_ID_POS,
};

/// Bodies below this length are never compressed.
#[cfg(feature = "bzip2")]
const COMPRESSION_FLOOR: usize = 100;

/// ## CONNECTION STATE
///
/// Ordered so that every comparison in the engine is a plain ordering test:
/// once the state is at least [CLOSING], the connection can never become
/// [ACTIVE] or [HOLDING] again, and the recorded exception is never cleared.
///
/// [CLOSING]: State::Closing
/// [ACTIVE]:  State::Active
/// [HOLDING]: State::Holding
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, NoUninit)]
#[repr(u8)]
pub enum State {
  NotInitialized,
  NotValidated,
  Active,
  Holding,
  Closing,
  ClosingPending,
  Closed,
  Finished,
}

/// ## CLOSE MODE
///
/// The three flavors of user-initiated close.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseMode {
  /// Immediate close; queued and unreplied requests fail.
  Forcefully,

  /// Queued requests fail, but requests already awaiting replies are
  /// preserved until the peer closes or the close timeout fires.
  Gracefully,

  /// Blocks the caller until every outstanding request has been answered,
  /// then closes gracefully.
  GracefullyWithWait,
}

/// ## DESTRUCTION REASON
///
/// Owner-initiated teardown, mapped onto a graceful close with the matching
/// exception.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestructionReason {
  AdapterDeactivated,
  CommunicatorDestroyed,
}

/// ## SEND STATUS
///
/// The outcome of submitting a message to the send queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
  /// The transport would have blocked; the message is queued and write
  /// interest registered. This is success of the send *operation*, not of
  /// the request.
  Queued,

  /// The whole frame was written synchronously.
  Sent,

  /// The whole frame was written synchronously and the caller must now run
  /// the invocation's sent-callback (outside the connection lock).
  SentAndInvokeSentCallback,
}

/// ## CONNECTION CONFIGURATION
///
/// Construction-time knobs; there is no global property table.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
  /// Largest acceptable declared message size.
  pub message_size_max: usize,

  /// bzip2 level for compress-eligible messages, clamped to 1..=9.
  pub compression_level: u32,

  /// Whether unexpected connection failures are logged as warnings.
  pub warn: bool,

  /// Overrides the endpoint timeout while the connection establishes and
  /// validates.
  pub connect_timeout: Option<Duration>,

  /// Bounds how long a graceful close waits for the peer, armed on entry to
  /// the closing-pending state.
  pub close_timeout: Option<Duration>,

  /// Bounds individual reads (past the header) and writes while active.
  pub endpoint_timeout: Option<Duration>,

  /// Routes dispatch work through the thread pool's dispatch hook instead
  /// of running it inline on the I/O thread.
  pub use_dispatch_executor: bool,
}

impl Default for ConnectionConfig {
  fn default() -> Self {
    ConnectionConfig {
      message_size_max: 1024 * 1024,
      compression_level: 1,
      warn: true,
      connect_timeout: None,
      close_timeout: None,
      endpoint_timeout: None,
      use_dispatch_executor: false,
    }
  }
}

/// ## OUTGOING MESSAGE
///
/// One entry of the send queue: the framed bytes, the compression
/// eligibility, and the async invocation to notify. While the entry is at
/// the head with its send in progress, the bytes live in the connection's
/// write buffer and `stream` is empty.
struct OutgoingMessage {
  stream: Option<Vec<u8>>,
  compress: bool,
  request_id: i32,
  invocation: Option<Arc<Invocation>>,

  /// A reply that arrived before this request's own send completed; it is
  /// delivered by the send-completion path so the sent notification always
  /// precedes the reply.
  pending_reply: Option<InputStream>,
}

impl OutgoingMessage {
  /// A control frame (validate, close) with no invocation attached.
  fn control(stream: Vec<u8>) -> Self {
    OutgoingMessage {
      stream: Some(stream),
      compress: false,
      request_id: 0,
      invocation: None,
      pending_reply: None,
    }
  }

  /// A reply frame produced by a dispatch.
  fn response(stream: Vec<u8>, compress: bool) -> Self {
    OutgoingMessage {
      stream: Some(stream),
      compress,
      request_id: 0,
      invocation: None,
      pending_reply: None,
    }
  }

  /// A client request or batch flush.
  fn request(
    stream: Vec<u8>,
    compress: bool,
    request_id: i32,
    invocation: Arc<Invocation>,
  ) -> Self {
    OutgoingMessage {
      stream: Some(stream),
      compress,
      request_id,
      invocation: Some(invocation),
      pending_reply: None,
    }
  }

  /// ### SENT
  ///
  /// Releases the stream and notifies the invocation. Returns the
  /// invocation when a user sent-callback must run, and the stashed reply
  /// when one raced ahead of the send completion.
  #[allow(clippy::type_complexity)]
  fn sent(&mut self) -> (Option<Arc<Invocation>>, Option<(Arc<Invocation>, InputStream)>) {
    self.stream = None;
    let invocation: Arc<Invocation> = match self.invocation.take() {
      Some(invocation) => invocation,
      None => return (None, None),
    };
    let has_callback: bool = invocation.sent();
    let reply = self
      .pending_reply
      .take()
      .map(|stream| (invocation.clone(), stream));
    (has_callback.then_some(invocation), reply)
  }
}

/// ## SEND QUEUE
///
/// Append-only FIFO of outgoing messages. The head is the message currently
/// being transmitted; while its send is in progress its bytes live in the
/// connection's write buffer.
struct SendQueue {
  queue: VecDeque<OutgoingMessage>,
}

impl SendQueue {
  fn new() -> Self {
    SendQueue {
      queue: VecDeque::new(),
    }
  }

  fn is_empty(&self) -> bool {
    self.queue.is_empty()
  }

  fn push(&mut self, message: OutgoingMessage) {
    self.queue.push_back(message);
  }

  fn front_mut(&mut self) -> Option<&mut OutgoingMessage> {
    self.queue.front_mut()
  }

  fn pop_front(&mut self) -> Option<OutgoingMessage> {
    self.queue.pop_front()
  }

  /// The queue index of the message carrying `invocation`, if any.
  fn position_of(&self, invocation: &Arc<Invocation>) -> Option<usize> {
    self.queue.iter().position(|message| {
      message
        .invocation
        .as_ref()
        .is_some_and(|candidate| Arc::ptr_eq(candidate, invocation))
    })
  }

  /// Whether the head message's send has started (its bytes were handed to
  /// the write buffer).
  fn head_in_flight(&self) -> bool {
    self
      .queue
      .front()
      .is_some_and(|message| message.stream.is_none())
  }

  /// Detaches the head's invocation so the frame already on the wire can
  /// finish without notifying anyone.
  fn detach_head(&mut self) {
    if let Some(head) = self.queue.front_mut() {
      head.invocation = None;
      head.pending_reply = None;
    }
  }

  fn remove_at(&mut self, index: usize) -> Option<OutgoingMessage> {
    self.queue.remove(index)
  }

  fn drain(&mut self) -> Vec<OutgoingMessage> {
    self.queue.drain(..).collect()
  }
}

/// ## REQUEST TABLE
///
/// Outstanding twoway invocations keyed by request id, with a hint
/// remembering the most recent insertion since replies usually arrive in
/// send order.
struct RequestTable {
  requests: HashMap<i32, Arc<Invocation>>,
  hint: Option<i32>,
}

impl RequestTable {
  fn new() -> Self {
    RequestTable {
      requests: HashMap::new(),
      hint: None,
    }
  }

  fn is_empty(&self) -> bool {
    self.requests.is_empty()
  }

  fn len(&self) -> usize {
    self.requests.len()
  }

  fn insert(&mut self, request_id: i32, invocation: Arc<Invocation>) {
    self.requests.insert(request_id, invocation);
    self.hint = Some(request_id);
  }

  /// Removes and returns the entry for `request_id`, consulting the hint
  /// before the map.
  fn take(&mut self, request_id: i32) -> Option<Arc<Invocation>> {
    if self.hint == Some(request_id) {
      self.hint = None;
    }
    self.requests.remove(&request_id)
  }

  /// The request id registered for `invocation`, hint first.
  fn id_of(&self, invocation: &Arc<Invocation>) -> Option<i32> {
    if let Some(hint) = self.hint {
      if let Some(candidate) = self.requests.get(&hint) {
        if Arc::ptr_eq(candidate, invocation) {
          return Some(hint);
        }
      }
    }
    self
      .requests
      .iter()
      .find(|(_, candidate)| Arc::ptr_eq(candidate, invocation))
      .map(|(id, _)| *id)
  }

  fn drain(&mut self) -> Vec<Arc<Invocation>> {
    self.hint = None;
    self.requests.drain().map(|(_, invocation)| invocation).collect()
  }
}

// Work gathered under the lock by one readiness callback and performed
// outside it.
#[derive(Default)]
struct DispatchWork {
  sent: Vec<Arc<Invocation>>,
  replies: Vec<(Arc<Invocation>, InputStream)>,
  heartbeat: bool,
  incoming: Option<Incoming>,
}

struct Incoming {
  stream: InputStream,
  request_id: i32,
  invoke_num: usize,
  compress_reply: bool,
}

impl DispatchWork {
  // Sent-callbacks count as one dispatch regardless of how many fired.
  fn pending_count(&self) -> usize {
    usize::from(!self.sent.is_empty())
      + self.replies.len()
      + usize::from(self.heartbeat)
      + self.incoming.as_ref().map_or(0, |incoming| incoming.invoke_num)
  }

  fn is_empty(&self) -> bool {
    self.pending_count() == 0
  }
}

// A servant manager with no servants, used when a request reaches a
// connection that has no adapter: every lookup misses and the client gets an
// object-not-exist reply.
struct NoServants;

impl ServantManager for NoServants {
  fn find(&self, _identity: &crate::Identity, _facet: &str) -> Option<Arc<dyn dispatch::Servant>> {
    None
  }
}

struct Shared {
  state: State,
  exception: Option<Error>,
  transceiver: Box<dyn Transceiver>,
  transceiver_closed: bool,
  desc: String,

  read_stream: Buffer,
  read_header: bool,
  write_stream: Buffer,

  send_queue: SendQueue,
  requests: RequestTable,
  next_request_id: i32,

  dispatch_count: usize,
  shutdown_initiated: bool,
  validated: bool,
  acm_last_activity: Instant,

  read_timer: Option<TimerToken>,
  write_timer: Option<TimerToken>,
  close_timer: Option<TimerToken>,
}

type HeartbeatCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// ## CONNECTION
///
/// The state machine multiplexing one transport. Created behind an [Arc];
/// shared by the thread pool (readiness callbacks), by every in-flight
/// invocation (until reply or failure), and by the owner that accepted or
/// created it.
pub struct Connection {
  config: ConnectionConfig,
  pool: Arc<dyn ThreadPool>,
  timer: Arc<dyn Timer>,
  servants: Option<Arc<dyn ServantManager>>,
  batch: BatchQueue,
  heartbeat_callback: Mutex<Option<HeartbeatCallback>>,
  shared: Mutex<Shared>,
  cond: Condvar,

  // Lock-free mirror of the state for fast-path queries.
  state_mirror: Atomic<State>,
}

impl Connection {
  /// ### NEW CONNECTION
  ///
  /// Creates a connection in the [NOT INITIALIZED] state. Server-side
  /// connections carry a servant manager and take the active role in
  /// validation; client-side connections pass `None`.
  ///
  /// [NOT INITIALIZED]: State::NotInitialized
  pub fn new(
    transceiver: Box<dyn Transceiver>,
    config: ConnectionConfig,
    pool: Arc<dyn ThreadPool>,
    timer: Arc<dyn Timer>,
    servants: Option<Arc<dyn ServantManager>>,
  ) -> Arc<Self> {
    let mut config = config;
    config.compression_level = config.compression_level.clamp(1, 9);
    let desc: String = transceiver.description();
    Arc::new(Connection {
      config,
      pool,
      timer,
      servants,
      batch: BatchQueue::new(),
      heartbeat_callback: Mutex::new(None),
      shared: Mutex::new(Shared {
        state: State::NotInitialized,
        exception: None,
        transceiver,
        transceiver_closed: false,
        desc,
        read_stream: Buffer::new(),
        read_header: false,
        write_stream: Buffer::new(),
        send_queue: SendQueue::new(),
        requests: RequestTable::new(),
        next_request_id: 1,
        dispatch_count: 0,
        shutdown_initiated: false,
        validated: false,
        acm_last_activity: Instant::now(),
        read_timer: None,
        write_timer: None,
        close_timer: None,
      }),
      cond: Condvar::new(),
      state_mirror: Atomic::new(State::NotInitialized),
    })
  }

  /// The current state, read without taking the connection lock.
  pub fn state(&self) -> State {
    self.state_mirror.load(Relaxed)
  }

  /// Whether the connection can carry new invocations.
  pub fn is_active_or_holding(&self) -> bool {
    let state: State = self.state();
    state > State::NotValidated && state < State::Closing
  }

  /// Whether the connection has been fully reaped.
  pub fn is_finished(&self) -> bool {
    self.state() == State::Finished && self.shared.lock().unwrap().dispatch_count == 0
  }

  /// A human-readable description of the endpoint pair.
  pub fn description(&self) -> String {
    self.shared.lock().unwrap().desc.clone()
  }

  /// Number of requests awaiting replies. Diagnostic.
  pub fn pending_requests(&self) -> usize {
    self.shared.lock().unwrap().requests.len()
  }

  /// Number of dispatches in progress. Diagnostic.
  pub fn pending_dispatches(&self) -> usize {
    self.shared.lock().unwrap().dispatch_count
  }

  pub(crate) fn batch_queue(&self) -> &BatchQueue {
    &self.batch
  }

  /// Installs the callback invoked (outside the lock) whenever the peer's
  /// heartbeat arrives.
  pub fn set_heartbeat_callback(
    &self,
    callback: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
  ) {
    *self.heartbeat_callback.lock().unwrap() = Some(Arc::new(callback));
  }

  // ---------------------------------------------------------------------
  // LIFECYCLE
  // ---------------------------------------------------------------------

  /// ### START PROCEDURE
  ///
  /// Registers with the thread pool and drives transceiver initialization
  /// and protocol validation as far as the transport allows without
  /// blocking; the pool's readiness callbacks finish the rest. The
  /// connection parks in [HOLDING] once validated.
  ///
  /// [HOLDING]: State::Holding
  pub fn start(self: &Arc<Self>) -> Result<(), Error> {
    let mut sh = self.shared.lock().unwrap();
    if sh.state >= State::Closed {
      return Err(self.recorded_exception(&sh));
    }
    self.pool.register(self, SocketOp::NONE);
    match self.start_locked(&mut sh) {
      Ok(true) => {
        self.set_state(&mut sh, State::Holding);
        Ok(())
      }
      Ok(false) => Ok(()),
      Err(error) => {
        self.set_state_with_ex(&mut sh, State::Closed, error.clone());
        Err(error)
      }
    }
  }

  fn start_locked(self: &Arc<Self>, sh: &mut Shared) -> Result<bool, Error> {
    if sh.state == State::NotInitialized && !self.initialize_locked(sh, SocketOp::NONE)? {
      return Ok(false);
    }
    if sh.state <= State::NotValidated && !self.validate_locked(sh, SocketOp::NONE)? {
      return Ok(false);
    }
    Ok(true)
  }

  /// ### ACTIVATE PROCEDURE
  ///
  /// Enables the read path. A no-op until validation has completed.
  pub fn activate(self: &Arc<Self>) {
    let mut sh = self.shared.lock().unwrap();
    if sh.state <= State::NotValidated {
      return;
    }
    self.set_state(&mut sh, State::Active);
  }

  /// ### HOLD PROCEDURE
  ///
  /// Pauses the read path; dispatches already in progress complete.
  pub fn hold(self: &Arc<Self>) {
    let mut sh = self.shared.lock().unwrap();
    if sh.state <= State::NotValidated {
      return;
    }
    self.set_state(&mut sh, State::Holding);
  }

  /// ### CLOSE PROCEDURE
  ///
  /// User-initiated close in one of the three [Close Mode]s.
  ///
  /// [Close Mode]: CloseMode
  pub fn close(self: &Arc<Self>, mode: CloseMode) {
    let mut sh = self.shared.lock().unwrap();
    match mode {
      CloseMode::Forcefully => {
        self.set_state_with_ex(
          &mut sh,
          State::Closed,
          Error::ManuallyClosed { graceful: false },
        );
      }
      CloseMode::Gracefully => {
        self.set_state_with_ex(
          &mut sh,
          State::Closing,
          Error::ManuallyClosed { graceful: true },
        );
      }
      CloseMode::GracefullyWithWait => {
        // Wait for every outstanding request to be answered before
        // recording the close.
        while !sh.requests.is_empty() {
          sh = self.cond.wait(sh).unwrap();
        }
        self.set_state_with_ex(
          &mut sh,
          State::Closing,
          Error::ManuallyClosed { graceful: true },
        );
      }
    }
  }

  /// ### DESTROY PROCEDURE
  ///
  /// Owner-initiated teardown: a graceful close recording the owner's
  /// reason.
  pub fn destroy(self: &Arc<Self>, reason: DestructionReason) {
    let error: Error = match reason {
      DestructionReason::AdapterDeactivated => Error::AdapterDeactivated,
      DestructionReason::CommunicatorDestroyed => Error::CommunicatorDestroyed,
    };
    let mut sh = self.shared.lock().unwrap();
    self.set_state_with_ex(&mut sh, State::Closing, error);
  }

  /// Blocks until the connection is at least [HOLDING] with no dispatch in
  /// progress.
  ///
  /// [HOLDING]: State::Holding
  pub fn wait_until_holding(&self) {
    let mut sh = self.shared.lock().unwrap();
    while sh.state < State::Holding || sh.dispatch_count > 0 {
      sh = self.cond.wait(sh).unwrap();
    }
  }

  /// Blocks until the connection is [FINISHED] and every dispatch has
  /// completed.
  ///
  /// [FINISHED]: State::Finished
  pub fn wait_until_finished(&self) {
    let mut sh = self.shared.lock().unwrap();
    while sh.state < State::Finished || sh.dispatch_count > 0 {
      sh = self.cond.wait(sh).unwrap();
    }
  }

  /// Surfaces the recorded exception, if the connection has failed.
  pub fn throw_exception_if_failed(&self) -> Result<(), Error> {
    let sh = self.shared.lock().unwrap();
    match &sh.exception {
      Some(exception) => {
        debug_assert!(sh.state >= State::Closing);
        Err(exception.clone())
      }
      None => Ok(()),
    }
  }

  fn recorded_exception(&self, sh: &Shared) -> Error {
    sh.exception
      .clone()
      .unwrap_or_else(|| Error::ConnectionLost(String::from("connection closed")))
  }

  // ---------------------------------------------------------------------
  // ESTABLISHMENT & VALIDATION
  // ---------------------------------------------------------------------

  // Returns false while the transceiver handshake still needs readiness.
  fn initialize_locked(
    self: &Arc<Self>,
    sh: &mut Shared,
    ready: SocketOp,
  ) -> Result<bool, Error> {
    let sh = &mut *sh;
    let op: SocketOp = sh
      .transceiver
      .initialize(&mut sh.read_stream, &mut sh.write_stream)?;
    if !op.is_none() {
      self.schedule_timeout(sh, op);
      self.pool.update(self, ready, op);
      return Ok(false);
    }
    sh.desc = sh.transceiver.description();
    self.set_state(sh, State::NotValidated);
    Ok(true)
  }

  // The validate-connection exchange: the server writes a bare header, the
  // client reads and checks one. Returns false while blocked on the
  // transport. Datagram transports are implicitly validated.
  fn validate_locked(self: &Arc<Self>, sh: &mut Shared, ready: SocketOp) -> Result<bool, Error> {
    let sh = &mut *sh;
    if !sh.transceiver.is_datagram() {
      if self.servants.is_some() {
        // SERVER SIDE
        if sh.write_stream.is_empty() {
          let header = MessageHeader::new(MessageType::ValidateConnection, HEADER_SIZE as i32);
          sh.write_stream.load(header.encode().to_vec());
          trace!("sending validate connection message ({})", sh.desc);
        }
        if !sh.write_stream.is_complete() {
          let op: SocketOp = sh.transceiver.write(&mut sh.write_stream)?;
          if !op.is_none() {
            self.schedule_timeout(sh, op);
            self.pool.update(self, ready, op);
            return Ok(false);
          }
        }
      } else {
        // CLIENT SIDE
        if sh.read_stream.is_empty() {
          sh.read_stream.resize(HEADER_SIZE);
        }
        if !sh.read_stream.is_complete() {
          let op: SocketOp = sh.transceiver.read(&mut sh.read_stream)?;
          if !op.is_none() {
            self.schedule_timeout(sh, op);
            self.pool.update(self, ready, op);
            return Ok(false);
          }
        }
        sh.validated = true;
        let bytes: [u8; HEADER_SIZE] = sh.read_stream.data()[..HEADER_SIZE]
          .try_into()
          .unwrap();
        let header: MessageHeader = MessageHeader::decode(&bytes)?;
        if header.message_type != MessageType::ValidateConnection {
          return Err(Error::ConnectionNotValidated);
        }
        if header.size != HEADER_SIZE as i32 {
          return Err(Error::IllegalMessageSize(header.size));
        }
        trace!("received validate connection message ({})", sh.desc);
      }
    }

    // Both buffers return to their steady-state shape: nothing to write, a
    // header-sized read in progress.
    sh.write_stream.clear();
    sh.read_stream.clear();
    sh.read_stream.resize(HEADER_SIZE);
    sh.read_header = true;
    Ok(true)
  }

  // ---------------------------------------------------------------------
  // I/O LOOP
  // ---------------------------------------------------------------------

  /// ### READINESS ENTRY POINT
  ///
  /// The single entry the thread pool drives. Performs non-blocking I/O and
  /// message parsing under the lock, then runs the gathered dispatch work
  /// outside it (inline, or through the pool's dispatch hook when a
  /// dispatch executor is configured).
  pub fn on_ready(self: &Arc<Self>, ready: SocketOp) {
    let mut work = DispatchWork::default();
    {
      let mut sh = self.shared.lock().unwrap();
      if sh.state >= State::Closed {
        return;
      }
      self.unschedule_timeout(&mut sh, ready);
      match self.io_ready_locked(&mut sh, ready, &mut work) {
        Ok(()) => {
          sh.acm_last_activity = Instant::now();
          let pending: usize = work.pending_count();
          if pending > 0 {
            sh.dispatch_count += pending;
          }
        }
        Err(error) => {
          if sh.transceiver.is_datagram() && matches!(error, Error::DatagramLimit(_)) {
            // A truncated datagram only loses that message.
            if self.config.warn {
              warn!("datagram limit exceeded: {error} ({})", sh.desc);
            }
            sh.read_stream.clear();
            sh.read_stream.resize(HEADER_SIZE);
            sh.read_header = true;
            return;
          }
          self.set_state_with_ex(&mut sh, State::Closed, error);
          return;
        }
      }
    }
    if work.is_empty() {
      return;
    }
    if self.config.use_dispatch_executor {
      let this: Arc<Connection> = self.clone();
      self
        .pool
        .dispatch_from_this_thread(Box::new(move || this.dispatch_work(work)));
    } else {
      self.dispatch_work(work);
    }
  }

  fn io_ready_locked(
    self: &Arc<Self>,
    sh: &mut Shared,
    ready: SocketOp,
    work: &mut DispatchWork,
  ) -> Result<(), Error> {
    let mut write_op: SocketOp = SocketOp::NONE;
    let mut read_op: SocketOp = SocketOp::NONE;

    // WRITE
    //
    // Advance the partial write at the head of the send queue.
    if ready.contains(SocketOp::WRITE)
      && !sh.write_stream.is_empty()
      && !sh.write_stream.is_complete()
    {
      write_op = sh.transceiver.write(&mut sh.write_stream)?;
    }

    // READ
    //
    // Fill the header, discover the payload size, then fill the payload.
    if ready.contains(SocketOp::READ) && !sh.read_stream.is_empty() {
      loop {
        read_op = sh.transceiver.read(&mut sh.read_stream)?;
        if read_op.contains(SocketOp::READ) {
          if sh.transceiver.is_datagram() && sh.read_stream.pos() > 0 {
            return Err(Error::DatagramLimit(sh.read_stream.pos()));
          }
          break;
        }
        if sh.read_header {
          // The connection counts as validated from the first framed
          // message, whatever it turns out to contain.
          sh.read_header = false;
          sh.validated = true;
          let bytes: [u8; HEADER_SIZE] = sh.read_stream.data()[..HEADER_SIZE]
            .try_into()
            .unwrap();
          let header: MessageHeader = MessageHeader::decode(&bytes)?;
          let size: usize = header.size as usize;
          if size > self.config.message_size_max {
            return Err(Error::MemoryLimit {
              size,
              max: self.config.message_size_max,
            });
          }
          if size > HEADER_SIZE {
            sh.read_stream.resize(size);
            continue;
          }
        }
        break;
      }
    }

    let new_op: SocketOp = read_op | write_op;

    if sh.state <= State::NotValidated {
      if !new_op.is_none() {
        // The transceiver needs more readiness before the handshake can
        // continue.
        self.schedule_timeout(sh, new_op);
        self.pool.update(self, ready, new_op);
        return Ok(());
      }
      if sh.state == State::NotInitialized && !self.initialize_locked(sh, ready)? {
        return Ok(());
      }
      if sh.state <= State::NotValidated && !self.validate_locked(sh, ready)? {
        return Ok(());
      }
      self.pool.unregister(self, ready);
      self.set_state(sh, State::Holding);
      return Ok(());
    }

    debug_assert!(sh.state <= State::ClosingPending);
    let mut new_op: SocketOp = new_op;

    // Parse before sending: a close-connection message must stop further
    // writes.
    if ready.contains(SocketOp::READ)
      && !read_op.contains(SocketOp::READ)
      && !sh.read_stream.is_empty()
      && sh.read_stream.is_complete()
    {
      new_op |= self.parse_message(sh, work)?;
    }

    if ready.contains(SocketOp::WRITE) && !write_op.contains(SocketOp::WRITE) {
      new_op |= self.send_next_message(sh, work)?;
    }

    if sh.state < State::Closed {
      self.schedule_timeout(sh, new_op);
      self.pool.update(self, ready, new_op);
    }
    Ok(())
  }

  /// ### PARSE MESSAGE
  ///
  /// Branches on the type of the complete message sitting in the read
  /// buffer and resets the buffer for the next header. Returns the read
  /// interest to re-arm.
  fn parse_message(
    self: &Arc<Self>,
    sh: &mut Shared,
    work: &mut DispatchWork,
  ) -> Result<SocketOp, Error> {
    debug_assert!(sh.state > State::NotValidated && sh.state < State::Closed);

    let bytes: Vec<u8> = sh.read_stream.take();
    sh.read_stream.resize(HEADER_SIZE);
    sh.read_header = true;

    let message_type: MessageType =
      MessageType::try_from(bytes[8]).map_err(|_| Error::UnknownMessageType(bytes[8]))?;
    let compress_byte: u8 = bytes[COMPRESSION_STATUS_POS];
    trace_message("received", message_type, bytes.len(), &sh.desc);

    let data: Vec<u8> = if compress_byte == u8::from(CompressionStatus::Compressed) {
      self.uncompress(&bytes)?
    } else {
      bytes
    };

    match message_type {
      MessageType::CloseConnection => {
        if sh.transceiver.is_datagram() {
          if self.config.warn {
            warn!("ignoring close connection message for datagram connection ({})", sh.desc);
          }
        } else {
          self.set_state_with_ex(sh, State::ClosingPending, Error::CloseConnection);
          let error: Error = self.recorded_exception(sh);
          let op: SocketOp = sh.transceiver.closing(false, &error);
          if !op.is_none() {
            return Ok(op);
          }
          self.set_state(sh, State::Closed);
        }
      }

      MessageType::Request => {
        if sh.state >= State::Closing {
          trace!("received request during closing (ignored, client will retry)");
        } else {
          let mut stream = InputStream::new(data);
          stream.set_pos(HEADER_SIZE);
          let request_id: i32 = stream.read_i32()?;
          work.incoming = Some(Incoming {
            stream,
            request_id,
            invoke_num: 1,
            compress_reply: compress_byte > 0,
          });
        }
      }

      MessageType::BatchRequest => {
        if sh.state >= State::Closing {
          trace!("received batch request during closing (ignored, client will retry)");
        } else {
          let mut stream = InputStream::new(data);
          stream.set_pos(HEADER_SIZE);
          let invoke_num: i32 = stream.read_i32()?;
          if invoke_num < 0 {
            return Err(Error::Encoding(icep_codec::EncodingError::IllegalSize {
              size: invoke_num as i64,
            }));
          }
          work.incoming = Some(Incoming {
            stream,
            request_id: 0,
            invoke_num: invoke_num as usize,
            compress_reply: compress_byte > 0,
          });
        }
      }

      MessageType::Reply => {
        let mut stream = InputStream::new(data);
        stream.set_pos(REQUEST_ID_POS);
        let request_id: i32 = stream.read_i32()?;
        match sh.requests.take(request_id) {
          Some(invocation) => {
            // Wake close(GracefullyWithWait) callers.
            self.cond.notify_all();
            let mut stream: Option<InputStream> = Some(stream);
            if let Some(front) = sh.send_queue.front_mut() {
              let is_front: bool = front
                .invocation
                .as_ref()
                .is_some_and(|candidate| Arc::ptr_eq(candidate, &invocation));
              if is_front {
                // The reply raced ahead of our own send completion; the
                // send-completion path delivers it after the sent
                // notification.
                front.pending_reply = stream.take();
              }
            }
            if let Some(stream) = stream {
              work.replies.push((invocation, stream));
            }
          }
          None => {
            // A late reply for a canceled or unknown request.
            trace!("received reply for unknown request id {request_id}");
          }
        }
      }

      MessageType::ValidateConnection => {
        if self.heartbeat_callback.lock().unwrap().is_some() {
          work.heartbeat = true;
        }
      }
    }

    Ok(if sh.state == State::Holding {
      SocketOp::NONE
    } else {
      SocketOp::READ
    })
  }

  /// ### SEND NEXT MESSAGE
  ///
  /// Runs when the head message's bytes have been fully written: releases
  /// it, collects its notifications, and starts the next queued message.
  /// Finishes the graceful close once the queue drains.
  fn send_next_message(
    self: &Arc<Self>,
    sh: &mut Shared,
    work: &mut DispatchWork,
  ) -> Result<SocketOp, Error> {
    if sh.send_queue.is_empty() {
      return Ok(SocketOp::NONE);
    }

    if sh.state == State::ClosingPending
      && !sh.write_stream.is_empty()
      && sh.write_stream.pos() == 0
    {
      // Nothing of the head was sent and no more data may be; hand the
      // bytes back so teardown can fail the message.
      let bytes: Vec<u8> = sh.write_stream.take();
      if let Some(head) = sh.send_queue.front_mut() {
        head.stream = Some(bytes);
      }
      return Ok(SocketOp::NONE);
    }

    if sh.write_stream.is_empty() || !sh.write_stream.is_complete() {
      return Ok(SocketOp::NONE);
    }
    loop {
      // HEAD FINISHED
      //
      // Release the bytes and collect the sent notification (and any reply
      // that raced ahead of the send).
      sh.write_stream.clear();
      if let Some(mut head) = sh.send_queue.pop_front() {
        let (sent, reply) = head.sent();
        if let Some(invocation) = sent {
          work.sent.push(invocation);
        }
        if let Some(reply) = reply {
          work.replies.push(reply);
        }
      }
      sh.acm_last_activity = Instant::now();

      if sh.send_queue.is_empty() {
        break;
      }
      if sh.state >= State::ClosingPending {
        return Ok(SocketOp::NONE);
      }

      // NEXT MESSAGE
      //
      // Compression and the size field are applied only now, when the
      // message reaches the head of the queue.
      let front: &mut OutgoingMessage = match sh.send_queue.front_mut() {
        Some(front) => front,
        None => break,
      };
      let bytes: Vec<u8> = self.prepare_outgoing(front)?;
      sh.write_stream.load(bytes);
      let op: SocketOp = sh.transceiver.write(&mut sh.write_stream)?;
      if !op.is_none() {
        return Ok(op);
      }
    }

    // All the queued messages were sent; a graceful close in progress can
    // now wait for the peer.
    if sh.state == State::Closing && sh.shutdown_initiated {
      self.set_state(sh, State::ClosingPending);
      let error: Error = self.recorded_exception(sh);
      let op: SocketOp = sh.transceiver.closing(true, &error);
      if !op.is_none() {
        return Ok(op);
      }
    }
    Ok(SocketOp::NONE)
  }

  // Applies compression (or the supported-but-unused flag) and the final
  // size field as the message becomes the head of the queue.
  fn prepare_outgoing(&self, message: &mut OutgoingMessage) -> Result<Vec<u8>, Error> {
    let mut bytes: Vec<u8> = message
      .stream
      .take()
      .expect("outgoing message has no stream");

    #[cfg(feature = "bzip2")]
    if message.compress && bytes.len() >= COMPRESSION_FLOOR {
      return compress::deflate(&bytes, self.config.compression_level);
    }

    if message.compress {
      bytes[COMPRESSION_STATUS_POS] = CompressionStatus::Supported.into();
    }
    let size: i32 = bytes.len() as i32;
    bytes[MESSAGE_SIZE_POS..MESSAGE_SIZE_POS + 4].copy_from_slice(&size.to_le_bytes());
    Ok(bytes)
  }

  fn uncompress(&self, bytes: &[u8]) -> Result<Vec<u8>, Error> {
    #[cfg(feature = "bzip2")]
    {
      compress::inflate(bytes, self.config.message_size_max)
    }
    #[cfg(not(feature = "bzip2"))]
    {
      let _ = bytes;
      Err(Error::CompressionUnsupported)
    }
  }

  // ---------------------------------------------------------------------
  // SENDING
  // ---------------------------------------------------------------------

  /// ### SEND ASYNC REQUEST
  ///
  /// The client entry point: patches the fresh request id (or batch count)
  /// into the framed bytes, submits them to the send queue, and registers
  /// the invocation for reply correlation. A connection that has already
  /// failed reports a retriable error without consuming the invocation.
  pub fn send_async_request(
    self: &Arc<Self>,
    invocation: &Arc<Invocation>,
    os: crate::OutputStream,
    compress: bool,
    expects_reply: bool,
    batch_count: i32,
  ) -> Result<SendStatus, SendError> {
    let mut sh = self.shared.lock().unwrap();
    if let Some(exception) = &sh.exception {
      // The higher-level proxy machinery may pick another connection.
      return Err(SendError::Retry(exception.clone()));
    }
    debug_assert!(sh.state > State::NotValidated && sh.state < State::Closing);

    let mut bytes: Vec<u8> = os.into_bytes();
    sh.transceiver
      .check_send_size(bytes.len())
      .map_err(SendError::Aborted)?;

    let mut request_id: i32 = 0;
    if expects_reply {
      request_id = next_request_id(&mut sh.next_request_id);
      bytes[REQUEST_ID_POS..REQUEST_ID_POS + 4].copy_from_slice(&request_id.to_le_bytes());
    } else if batch_count > 0 {
      bytes[REQUEST_ID_POS..REQUEST_ID_POS + 4].copy_from_slice(&batch_count.to_le_bytes());
    }

    let message = OutgoingMessage::request(bytes, compress, request_id, invocation.clone());
    let status: SendStatus = match self.send_message(&mut sh, message) {
      Ok(status) => status,
      Err(error) => {
        self.set_state_with_ex(&mut sh, State::Closed, error);
        return Err(SendError::Aborted(self.recorded_exception(&sh)));
      }
    };

    if expects_reply {
      sh.requests.insert(request_id, invocation.clone());
    }
    Ok(status)
  }

  /// ### ENQUEUE
  ///
  /// Appends a message, first attempting a non-blocking direct write when
  /// the queue is idle. A blocked write registers write interest and
  /// reports [Queued].
  ///
  /// [Queued]: SendStatus::Queued
  fn send_message(
    self: &Arc<Self>,
    sh: &mut Shared,
    mut message: OutgoingMessage,
  ) -> Result<SendStatus, Error> {
    debug_assert!(sh.state < State::Closed);

    if !sh.send_queue.is_empty() || !sh.write_stream.is_empty() {
      sh.send_queue.push(message);
      return Ok(SendStatus::Queued);
    }

    let bytes: Vec<u8> = self.prepare_outgoing(&mut message)?;
    trace_message(
      "sending",
      MessageType::try_from(bytes[8]).unwrap_or(MessageType::Request),
      bytes.len(),
      &sh.desc,
    );
    sh.write_stream.load(bytes);
    let op: SocketOp = sh.transceiver.write(&mut sh.write_stream)?;
    if op.is_none() {
      // The whole frame went out synchronously.
      sh.write_stream.clear();
      let (sent, _reply) = message.sent();
      sh.acm_last_activity = Instant::now();
      return Ok(match sent {
        Some(_) => SendStatus::SentAndInvokeSentCallback,
        None => SendStatus::Sent,
      });
    }

    // Partial write: the head's bytes stay in the write buffer.
    message.stream = None;
    sh.send_queue.push(message);
    self.schedule_timeout(sh, op);
    self.pool.register(self, op);
    Ok(SendStatus::Queued)
  }

  // ---------------------------------------------------------------------
  // SERVER COMPLETIONS
  // ---------------------------------------------------------------------

  /// ### SEND RESPONSE
  ///
  /// Completes one dispatch with a framed reply. Errors close the
  /// connection; the client then observes them as a connection failure.
  pub fn send_response(self: &Arc<Self>, reply: crate::OutputStream, compress: bool) {
    let mut sh = self.shared.lock().unwrap();
    debug_assert!(sh.state > State::NotValidated);

    debug_assert!(sh.dispatch_count > 0);
    sh.dispatch_count = sh.dispatch_count.saturating_sub(1);
    if sh.dispatch_count == 0 {
      self.cond.notify_all();
    }

    if sh.state >= State::Closed {
      return;
    }

    let message = OutgoingMessage::response(reply.into_bytes(), compress);
    let mut result: Result<(), Error> = self.send_message(&mut sh, message).map(|_| ());
    if result.is_ok() && sh.state == State::Closing && sh.dispatch_count == 0 {
      result = self.initiate_shutdown(&mut sh);
    }
    if let Err(error) = result {
      self.set_state_with_ex(&mut sh, State::Closed, error);
    }
  }

  /// ### SEND NO RESPONSE
  ///
  /// Completes one dispatch that produces no reply (one-ways, batches).
  pub fn send_no_response(self: &Arc<Self>) {
    let mut sh = self.shared.lock().unwrap();
    debug_assert!(sh.state > State::NotValidated);

    debug_assert!(sh.dispatch_count > 0);
    sh.dispatch_count = sh.dispatch_count.saturating_sub(1);
    if sh.dispatch_count == 0 {
      self.cond.notify_all();
    }

    if sh.state >= State::Closed {
      return;
    }
    if sh.state == State::Closing && sh.dispatch_count == 0 {
      if let Err(error) = self.initiate_shutdown(&mut sh) {
        self.set_state_with_ex(&mut sh, State::Closed, error);
      }
    }
  }

  /// ### INVOKE EXCEPTION
  ///
  /// A dispatch failed so badly that no reply could be marshaled. The
  /// connection closes and the remaining dispatch count of the frame is
  /// surrendered.
  pub fn invoke_exception(self: &Arc<Self>, _request_id: i32, error: Error, remaining: usize) {
    let mut sh = self.shared.lock().unwrap();
    self.set_state_with_ex(&mut sh, State::Closed, error);
    if remaining > 0 {
      debug_assert!(sh.dispatch_count >= remaining);
      sh.dispatch_count = sh.dispatch_count.saturating_sub(remaining);
      if sh.dispatch_count == 0 {
        self.cond.notify_all();
      }
    }
  }

  // ---------------------------------------------------------------------
  // CANCELLATION
  // ---------------------------------------------------------------------

  /// ### CANCEL REQUEST
  ///
  /// Cancels an in-flight invocation from any thread. A frame whose bytes
  /// have already started onto the wire finishes; the invocation is merely
  /// detached. A connection-timeout reason closes the whole connection.
  pub fn cancel_request(self: &Arc<Self>, invocation: &Arc<Invocation>, error: Error) {
    let mut sh = self.shared.lock().unwrap();
    if sh.state >= State::Closed {
      // Teardown will fail every pending invocation with the recorded
      // exception.
      return;
    }

    if let Some(index) = sh.send_queue.position_of(invocation) {
      if let Some(request_id) = sh.requests.id_of(invocation) {
        sh.requests.take(request_id);
        self.cond.notify_all();
      }
      if matches!(error, Error::ConnectionTimeout) {
        self.set_state_with_ex(&mut sh, State::Closed, error);
        return;
      }
      if index == 0 && sh.send_queue.head_in_flight() {
        sh.send_queue.detach_head();
      } else {
        sh.send_queue.remove_at(index);
      }
      drop(sh);
      invocation.complete_failed(error);
      return;
    }

    if invocation.expects_reply() {
      if let Some(request_id) = sh.requests.id_of(invocation) {
        if matches!(error, Error::ConnectionTimeout) {
          self.set_state_with_ex(&mut sh, State::Closed, error);
          return;
        }
        sh.requests.take(request_id);
        self.cond.notify_all();
        drop(sh);
        invocation.complete_failed(error);
      }
    }
  }

  // Arms the per-invocation timeout on the shared timer.
  pub(crate) fn schedule_invocation_timeout(
    self: &Arc<Self>,
    invocation: &Arc<Invocation>,
    delay: Duration,
  ) {
    let connection = Arc::downgrade(self);
    let invocation = Arc::downgrade(invocation);
    self.timer.schedule(
      Box::new(move || {
        if let (Some(connection), Some(invocation)) = (connection.upgrade(), invocation.upgrade())
        {
          connection.cancel_request(&invocation, Error::InvocationTimeout);
        }
      }),
      delay,
    );
  }

  // ---------------------------------------------------------------------
  // ACTIVITY MONITORING
  // ---------------------------------------------------------------------

  /// ### MONITOR CHECK
  ///
  /// One pass of the activity monitor: heartbeat per policy, then idle
  /// close per policy. Driven by the [Connection Monitor] every half
  /// timeout.
  ///
  /// [Connection Monitor]: crate::acm::ConnectionMonitor
  pub fn monitor(self: &Arc<Self>, now: Instant, config: &AcmConfig) {
    let mut sh = self.shared.lock().unwrap();
    if sh.state != State::Active || config.timeout.is_zero() {
      return;
    }

    // HEARTBEAT
    //
    // Sent ahead of need (a quarter timeout of quiet) so the peer's own
    // monitor sees activity in every half-timeout window.
    if config.heartbeat == AcmHeartbeat::Always
      || (config.heartbeat != AcmHeartbeat::Off
        && sh.write_stream.is_empty()
        && now >= sh.acm_last_activity + config.timeout / 4)
    {
      if config.heartbeat != AcmHeartbeat::OnDispatch || sh.dispatch_count > 0 {
        let _ = self.send_heartbeat_now(&mut sh);
      }
    }

    // A partial read or write is progress; the endpoint timeout guards it.
    if sh.read_stream.len() > HEADER_SIZE || !sh.write_stream.is_empty() {
      return;
    }

    // IDLE CLOSE
    if config.close != AcmClose::Off && now >= sh.acm_last_activity + config.timeout {
      if config.close == AcmClose::OnIdleForceful
        || (config.close != AcmClose::OnIdle && !sh.requests.is_empty())
      {
        // Pending requests with a silent peer: the connection is dead.
        self.set_state_with_ex(&mut sh, State::Closed, Error::ConnectionTimeout);
      } else if config.close != AcmClose::OnInvocation
        && sh.dispatch_count == 0
        && sh.requests.is_empty()
        && self.batch.is_empty()
      {
        self.set_state_with_ex(&mut sh, State::Closing, Error::ConnectionTimeout);
      }
    }
  }

  /// ### HEARTBEAT PROCEDURE
  ///
  /// Sends one validate-connection frame by hand.
  pub fn heartbeat(self: &Arc<Self>) -> Result<(), Error> {
    let mut sh = self.shared.lock().unwrap();
    if let Some(exception) = &sh.exception {
      return Err(exception.clone());
    }
    if sh.state != State::Active {
      return Ok(());
    }
    self.send_heartbeat_now(&mut sh)
  }

  fn send_heartbeat_now(self: &Arc<Self>, sh: &mut Shared) -> Result<(), Error> {
    if sh.transceiver.is_datagram() {
      return Ok(());
    }
    let header = MessageHeader::new(MessageType::ValidateConnection, HEADER_SIZE as i32);
    let message = OutgoingMessage::control(header.encode().to_vec());
    match self.send_message(sh, message) {
      Ok(_) => Ok(()),
      Err(error) => {
        self.set_state_with_ex(sh, State::Closed, error.clone());
        Err(error)
      }
    }
  }

  // ---------------------------------------------------------------------
  // STATE TRANSITIONS
  // ---------------------------------------------------------------------

  // Records the exception (first one wins, with the warning policy) and
  // moves to a closing or closed state.
  fn set_state_with_ex(self: &Arc<Self>, sh: &mut Shared, state: State, error: Error) {
    debug_assert!(state >= State::Closing);

    if sh.state == state {
      return;
    }
    if sh.exception.is_none() {
      debug_assert!(sh.state != State::Closed);
      // Local errors before validation stay quiet: the peer may have
      // legitimately dropped an unauthorized connection.
      if self.config.warn && sh.validated && !error.expected() {
        let suppress: bool =
          matches!(error, Error::ConnectionLost(_)) && sh.state >= State::Closing;
        if !suppress {
          warn!("connection exception: {error} ({})", sh.desc);
        }
      }
      sh.exception = Some(error);
    }
    // The state must change before requests observe the exception, so new
    // requests retry on a connection that is already marked closing.
    self.set_state(sh, state);
  }

  fn set_state(self: &Arc<Self>, sh: &mut Shared, state: State) {
    let mut state: State = state;

    // Datagram endpoints cannot close gracefully, and neither can a
    // connection destroyed before validation.
    if state == State::Closing
      && (sh.transceiver.is_datagram() || sh.state <= State::NotValidated)
    {
      state = State::Closed;
    }

    if sh.state == state {
      return;
    }

    match state {
      State::NotInitialized => {
        debug_assert!(false, "cannot transition into NotInitialized");
        return;
      }
      State::NotValidated => {
        if sh.state != State::NotInitialized {
          debug_assert!(sh.state == State::Closed);
          return;
        }
      }
      State::Active => {
        if sh.state != State::Holding && sh.state != State::NotValidated {
          return;
        }
        self.pool.register(self, SocketOp::READ);
      }
      State::Holding => {
        if sh.state != State::Active && sh.state != State::NotValidated {
          return;
        }
        if sh.state == State::Active {
          self.pool.unregister(self, SocketOp::READ);
        }
      }
      State::Closing | State::ClosingPending => {
        // Cannot change back from closing pending.
        if sh.state >= State::ClosingPending {
          return;
        }
        if state == State::ClosingPending {
          self.arm_close_timeout(sh);
        }
      }
      State::Closed => {
        if sh.state == State::Finished {
          return;
        }
        self.cancel_all_timers(sh);
        self.batch.destroy(self.recorded_exception(sh));
        if self.pool.finish(self) && !sh.transceiver_closed {
          sh.transceiver.close();
          sh.transceiver_closed = true;
        }
      }
      State::Finished => {
        debug_assert!(sh.state == State::Closed);
      }
    }

    sh.state = state;
    self.state_mirror.store(state, Relaxed);
    self.cond.notify_all();

    if sh.state == State::Closing && sh.dispatch_count == 0 {
      if let Err(error) = self.initiate_shutdown(sh) {
        self.set_state_with_ex(sh, State::Closed, error);
      }
    }
  }

  /// ### INITIATE SHUTDOWN
  ///
  /// Writes the close-connection frame once all dispatches have completed.
  /// When the frame is fully out, moves to [CLOSING PENDING] and lets the
  /// transceiver watch for the peer's shutdown.
  ///
  /// [CLOSING PENDING]: State::ClosingPending
  fn initiate_shutdown(self: &Arc<Self>, sh: &mut Shared) -> Result<(), Error> {
    debug_assert!(sh.state == State::Closing && sh.dispatch_count == 0);

    if sh.shutdown_initiated {
      return Ok(());
    }
    sh.shutdown_initiated = true;

    if sh.transceiver.is_datagram() {
      return Ok(());
    }

    let mut header = MessageHeader::new(MessageType::CloseConnection, HEADER_SIZE as i32);
    // Compression supported but not used on the close frame.
    header.compression = CompressionStatus::Supported;
    let message = OutgoingMessage::control(header.encode().to_vec());
    let status: SendStatus = self.send_message(sh, message)?;
    if status != SendStatus::Queued {
      self.set_state(sh, State::ClosingPending);
      let error: Error = self.recorded_exception(sh);
      let op: SocketOp = sh.transceiver.closing(true, &error);
      if !op.is_none() {
        self.schedule_timeout(sh, op);
        self.pool.register(self, op);
      }
    }
    Ok(())
  }

  /// ### FINISHED
  ///
  /// Invoked by the thread pool once the connection is unregistered. Fails
  /// every queued message and outstanding request with the recorded
  /// exception, closes the transceiver exactly once, and reaps.
  pub fn finished(self: &Arc<Self>, close_transceiver: bool) {
    let (queued, requests, error) = {
      let mut sh = self.shared.lock().unwrap();
      if sh.state != State::Closed {
        return;
      }
      let error: Error = self.recorded_exception(&sh);
      sh.write_stream.clear();
      sh.read_stream.clear();
      let queued: Vec<OutgoingMessage> = sh.send_queue.drain();
      let requests: Vec<Arc<Invocation>> = sh.requests.drain();
      if close_transceiver && !sh.transceiver_closed {
        sh.transceiver.close();
        sh.transceiver_closed = true;
      }
      self.set_state(&mut sh, State::Finished);
      (queued, requests, error)
    };

    // User-visible completions happen outside the lock.
    for message in queued {
      if let Some(invocation) = message.invocation {
        invocation.complete_failed(error.clone());
      }
    }
    for invocation in requests {
      invocation.complete_failed(error.clone());
    }
  }

  // ---------------------------------------------------------------------
  // DISPATCH (OUTSIDE THE LOCK)
  // ---------------------------------------------------------------------

  fn dispatch_work(self: &Arc<Self>, work: DispatchWork) {
    let mut completed: usize = 0;

    // Sent-callbacks preserve the FIFO order of enqueue, and a request's
    // sent notification always precedes its reply completion.
    if !work.sent.is_empty() {
      for invocation in &work.sent {
        invocation.invoke_sent_callback();
      }
      completed += 1;
    }
    for (invocation, stream) in work.replies {
      invocation.complete_from_stream(stream);
      completed += 1;
    }
    if work.heartbeat {
      let callback: Option<HeartbeatCallback> = self.heartbeat_callback.lock().unwrap().clone();
      if let Some(callback) = callback {
        callback(self);
      }
      completed += 1;
    }
    if completed > 0 {
      self.dispatch_finished(completed);
    }

    if let Some(incoming) = work.incoming {
      let manager: Arc<dyn ServantManager> = match &self.servants {
        Some(manager) => manager.clone(),
        None => Arc::new(NoServants),
      };
      dispatch::dispatch_all(
        self,
        incoming.stream,
        incoming.invoke_num,
        incoming.request_id,
        incoming.compress_reply,
        &manager,
      );
    }
  }

  fn dispatch_finished(self: &Arc<Self>, count: usize) {
    let mut sh = self.shared.lock().unwrap();
    debug_assert!(sh.dispatch_count >= count);
    sh.dispatch_count = sh.dispatch_count.saturating_sub(count);
    if sh.dispatch_count == 0 {
      if sh.state == State::Closing {
        if let Err(error) = self.initiate_shutdown(&mut sh) {
          self.set_state_with_ex(&mut sh, State::Closed, error);
        }
      }
      self.cond.notify_all();
    }
  }

  // ---------------------------------------------------------------------
  // TIMEOUTS
  // ---------------------------------------------------------------------

  // Connect timeout before activation, endpoint timeout while active
  // (header reads excepted), close timeout once the close frame is out.
  fn schedule_timeout(self: &Arc<Self>, sh: &mut Shared, op: SocketOp) {
    let mut op: SocketOp = op;
    let timeout: Option<Duration> = if sh.state < State::Active {
      self.config.connect_timeout.or(self.config.endpoint_timeout)
    } else if sh.state < State::ClosingPending {
      if sh.read_header {
        // Reading a header has no timeout; an idle peer is legitimate.
        op = op.without(SocketOp::READ);
      }
      self.config.endpoint_timeout
    } else {
      self.config.close_timeout.or(self.config.endpoint_timeout)
    };
    let Some(timeout) = timeout else {
      return;
    };

    if op.contains(SocketOp::READ) {
      if let Some(token) = sh.read_timer.take() {
        self.timer.cancel(token);
      }
      sh.read_timer = Some(self.schedule_timed_out(timeout));
    }
    if op.contains(SocketOp::WRITE) || op.contains(SocketOp::CONNECT) {
      if let Some(token) = sh.write_timer.take() {
        self.timer.cancel(token);
      }
      sh.write_timer = Some(self.schedule_timed_out(timeout));
    }
  }

  fn unschedule_timeout(&self, sh: &mut Shared, op: SocketOp) {
    if op.contains(SocketOp::READ) {
      if let Some(token) = sh.read_timer.take() {
        self.timer.cancel(token);
      }
    }
    if op.contains(SocketOp::WRITE) || op.contains(SocketOp::CONNECT) {
      if let Some(token) = sh.write_timer.take() {
        self.timer.cancel(token);
      }
    }
  }

  fn arm_close_timeout(self: &Arc<Self>, sh: &mut Shared) {
    let timeout: Option<Duration> = self.config.close_timeout.or(self.config.endpoint_timeout);
    let Some(timeout) = timeout else {
      return;
    };
    if let Some(token) = sh.close_timer.take() {
      self.timer.cancel(token);
    }
    sh.close_timer = Some(self.schedule_timed_out(timeout));
  }

  fn cancel_all_timers(&self, sh: &mut Shared) {
    for token in [
      sh.read_timer.take(),
      sh.write_timer.take(),
      sh.close_timer.take(),
    ]
    .into_iter()
    .flatten()
    {
      self.timer.cancel(token);
    }
  }

  fn schedule_timed_out(self: &Arc<Self>, delay: Duration) -> TimerToken {
    let connection = Arc::downgrade(self);
    self.timer.schedule(
      Box::new(move || {
        if let Some(connection) = connection.upgrade() {
          connection.timed_out();
        }
      }),
      delay,
    )
  }

  fn timed_out(self: &Arc<Self>) {
    let mut sh = self.shared.lock().unwrap();
    if sh.state <= State::NotValidated {
      self.set_state_with_ex(&mut sh, State::Closed, Error::ConnectTimeout);
    } else if sh.state < State::Closing {
      self.set_state_with_ex(&mut sh, State::Closed, Error::Timeout);
    } else if sh.state < State::Closed {
      self.set_state_with_ex(&mut sh, State::Closed, Error::CloseTimeout);
    }
  }
}

// Fresh ids count up and wrap back to 1; zero always means one-way.
fn next_request_id(next: &mut i32) -> i32 {
  let mut id: i32 = *next;
  if id <= 0 {
    id = 1;
  }
  *next = id.wrapping_add(1);
  id
}

fn trace_message(direction: &str, message_type: MessageType, size: usize, desc: &str) {
  trace!("{direction} {message_type:?} message, {size} bytes ({desc})");
}

#[cfg(feature = "bzip2")]
mod compress {
  //! Body compression: everything after the 14-byte header is compressed,
  //! the uncompressed total size is prepended to the compressed body, and
  //! the header's size field is rewritten to the compressed total.

  use std::io::Read;

  use bzip2::read::{BzDecoder, BzEncoder};
  use bzip2::Compression;

  use crate::{Error, COMPRESSION_STATUS_POS, HEADER_SIZE, MESSAGE_SIZE_POS};

  pub(super) fn deflate(message: &[u8], level: u32) -> Result<Vec<u8>, Error> {
    let body: &[u8] = &message[HEADER_SIZE..];
    let mut out: Vec<u8> = Vec::with_capacity(message.len() + 64);
    out.extend_from_slice(&message[..HEADER_SIZE]);
    out[COMPRESSION_STATUS_POS] = 2;
    out.extend_from_slice(&(message.len() as i32).to_le_bytes());

    let mut encoder = BzEncoder::new(body, Compression::new(level));
    encoder
      .read_to_end(&mut out)
      .map_err(|error| Error::Compression(error.to_string()))?;

    let total: i32 = out.len() as i32;
    out[MESSAGE_SIZE_POS..MESSAGE_SIZE_POS + 4].copy_from_slice(&total.to_le_bytes());
    Ok(out)
  }

  pub(super) fn inflate(message: &[u8], message_size_max: usize) -> Result<Vec<u8>, Error> {
    if message.len() < HEADER_SIZE + 4 {
      return Err(Error::IllegalMessageSize(message.len() as i32));
    }
    let uncompressed_size: i32 =
      i32::from_le_bytes(message[HEADER_SIZE..HEADER_SIZE + 4].try_into().unwrap());
    if uncompressed_size <= HEADER_SIZE as i32 {
      return Err(Error::IllegalMessageSize(uncompressed_size));
    }
    if uncompressed_size as usize > message_size_max {
      return Err(Error::MemoryLimit {
        size: uncompressed_size as usize,
        max: message_size_max,
      });
    }

    let mut out: Vec<u8> = Vec::with_capacity(uncompressed_size as usize);
    out.extend_from_slice(&message[..HEADER_SIZE]);
    let mut decoder = BzDecoder::new(&message[HEADER_SIZE + 4..]);
    decoder
      .read_to_end(&mut out)
      .map_err(|error| Error::Compression(error.to_string()))?;
    if out.len() != uncompressed_size as usize {
      return Err(Error::Compression(String::from(
        "uncompressed size does not match the declared size",
      )));
    }
    Ok(out)
  }
}
