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

//! # INVOCATION SERVICES
//!
//! The client-side path of the engine: turning a typed operation call into a
//! framed request on a [Connection], and resolving the caller's future from
//! the reply, a local failure, or a cancellation.
//!
//! ---------------------------------------------------------------------------
//!
//! To invoke operations:
//!
//! - Create a [Proxy] naming the target [Identity] on an established
//!   [Connection].
//! - Call the [Twoway Procedure] for request/reply operations, the
//!   [Oneway Procedure] for fire-and-forget operations, or the
//!   [Batch Procedure] followed by the [Flush Procedure] to coalesce
//!   several one-ways into a single frame.
//! - Wait on the returned [Reply Future] or [Sent Future], or cancel it
//!   from any thread.
//!
//! [Connection]:      crate::connection::Connection
//! [Identity]:        crate::Identity
//! [Proxy]:           Proxy
//! [Twoway Procedure]: Proxy::invoke_twoway
//! [Oneway Procedure]: Proxy::invoke_oneway
//! [Batch Procedure]:  Proxy::invoke_batch_oneway
//! [Flush Procedure]:  Proxy::flush_batch
//! [Reply Future]:     ReplyFuture
//! [Sent Future]:      SentFuture

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::connection::{Connection, SendStatus};
use crate::{
  Error, Identity, InputStream, MessageHeader, MessageType, OperationMode, OutputStream,
  ReplyStatus, SendError, HEADER_SIZE,
};

/// A user callback invoked once the request's frame has been written to the
/// transport.
pub type SentCallback = Box<dyn FnOnce() + Send>;

/// ## INVOCATION STATE
///
/// The lifecycle of one asynchronous invocation. An invocation is resolved
/// exactly once, by exactly one of the three terminal states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvocationState {
  /// Accepted by the send queue; bytes not yet fully written.
  Queued,

  /// The frame has been written to the transport.
  Sent,

  /// The reply arrived and resolved the future.
  ReplyReceived,

  /// Canceled by the caller or by an invocation timeout.
  Canceled,

  /// Failed locally, usually because the connection failed.
  Failed,
}

/// ## REPLY DATA
///
/// A decoded reply: its status and the input stream positioned directly
/// after the status byte, on the status-dependent remainder.
#[derive(Debug)]
pub struct ReplyData {
  pub status: ReplyStatus,
  pub stream: InputStream,
}

impl ReplyData {
  /// Convenience accessor for the common case: opens the out-parameter
  /// encapsulation of a successful reply, or folds any other status into an
  /// error.
  pub fn ok_params(mut self) -> Result<InputStream, Error> {
    match self.status {
      ReplyStatus::Ok => {
        self.stream.start_encaps()?;
        Ok(self.stream)
      }
      status => Err(Error::DispatchFailed(format!(
        "reply carried status {status:?}"
      ))),
    }
  }
}

struct InvocationInner {
  state: InvocationState,
  reply_sink: Option<oneshot::Sender<Result<ReplyData, Error>>>,
  sent_sink: Option<oneshot::Sender<Result<(), Error>>>,
  sent_callback: Option<SentCallback>,
}

/// ## INVOCATION
///
/// The shared handle for one in-flight asynchronous invocation, referenced
/// by the caller's future, by the connection's send queue slot, and by its
/// request table entry. All paths race to resolve it; only the first wins.
pub struct Invocation {
  operation: String,
  twoway: bool,
  inner: Mutex<InvocationInner>,
}

impl Invocation {
  /// A request/reply invocation resolving `reply_sink`.
  pub(crate) fn twoway(
    operation: &str,
    reply_sink: oneshot::Sender<Result<ReplyData, Error>>,
    sent_callback: Option<SentCallback>,
  ) -> Arc<Self> {
    Arc::new(Invocation {
      operation: operation.to_owned(),
      twoway: true,
      inner: Mutex::new(InvocationInner {
        state: InvocationState::Queued,
        reply_sink: Some(reply_sink),
        sent_sink: None,
        sent_callback,
      }),
    })
  }

  /// A send-only invocation (oneway or batch flush) resolving `sent_sink`
  /// when its frame is on the wire.
  pub(crate) fn oneway(
    operation: &str,
    sent_sink: oneshot::Sender<Result<(), Error>>,
    sent_callback: Option<SentCallback>,
  ) -> Arc<Self> {
    Arc::new(Invocation {
      operation: operation.to_owned(),
      twoway: false,
      inner: Mutex::new(InvocationInner {
        state: InvocationState::Queued,
        reply_sink: None,
        sent_sink: Some(sent_sink),
        sent_callback,
      }),
    })
  }

  /// The operation name, for correlation in logs.
  pub fn operation(&self) -> &str {
    &self.operation
  }

  /// Whether this invocation waits for a reply.
  pub fn expects_reply(&self) -> bool {
    self.twoway
  }

  /// The current lifecycle state.
  pub fn state(&self) -> InvocationState {
    self.inner.lock().unwrap().state
  }

  /// ### SENT
  ///
  /// Records that the frame reached the transport: advances the state,
  /// resolves a oneway's sent future, and reports whether a user
  /// sent-callback is waiting to be invoked (outside any engine lock, via
  /// [Invoke Sent Callback]).
  ///
  /// [Invoke Sent Callback]: Invocation::invoke_sent_callback
  pub(crate) fn sent(&self) -> bool {
    let mut inner = self.inner.lock().unwrap();
    if inner.state == InvocationState::Queued {
      inner.state = InvocationState::Sent;
    }
    if let Some(sink) = inner.sent_sink.take() {
      let _ = sink.send(Ok(()));
    }
    inner.sent_callback.is_some()
  }

  /// Runs the user sent-callback, if one was registered and not yet run.
  pub(crate) fn invoke_sent_callback(&self) {
    let callback: Option<SentCallback> = self.inner.lock().unwrap().sent_callback.take();
    if let Some(callback) = callback {
      callback();
    }
  }

  /// ### COMPLETE WITH REPLY
  ///
  /// Resolves the future from a received reply stream positioned after the
  /// request id. A malformed status byte fails the invocation instead.
  pub(crate) fn complete_from_stream(&self, mut stream: InputStream) {
    let status: Result<ReplyStatus, Error> = stream
      .read_u8()
      .map_err(Error::from)
      .and_then(|b| ReplyStatus::try_from(b).map_err(|_| Error::UnknownMessageType(b)));
    match status {
      Ok(status) => self.complete_reply(ReplyData { status, stream }),
      Err(error) => self.complete_failed(error),
    }
  }

  fn complete_reply(&self, reply: ReplyData) {
    let mut inner = self.inner.lock().unwrap();
    if inner.state == InvocationState::Canceled || inner.state == InvocationState::Failed {
      return;
    }
    inner.state = InvocationState::ReplyReceived;
    if let Some(sink) = inner.reply_sink.take() {
      let _ = sink.send(Ok(reply));
    }
  }

  /// ### COMPLETE WITH FAILURE
  ///
  /// Resolves the future with a local failure or cancellation. A no-op when
  /// the invocation was already resolved.
  pub(crate) fn complete_failed(&self, error: Error) {
    let mut inner = self.inner.lock().unwrap();
    if inner.state == InvocationState::ReplyReceived
      || inner.state == InvocationState::Canceled
      || inner.state == InvocationState::Failed
    {
      return;
    }
    inner.state = match error {
      Error::InvocationCanceled | Error::InvocationTimeout => InvocationState::Canceled,
      _ => InvocationState::Failed,
    };
    if let Some(sink) = inner.reply_sink.take() {
      let _ = sink.send(Err(error.clone()));
    }
    if let Some(sink) = inner.sent_sink.take() {
      let _ = sink.send(Err(error));
    }
  }
}

/// ## REPLY FUTURE
///
/// The caller's handle for one twoway invocation. Waiting consumes the
/// future; cancellation may happen from any thread at any time and resolves
/// the invocation exactly once.
pub struct ReplyFuture {
  receiver: oneshot::Receiver<Result<ReplyData, Error>>,
  invocation: Arc<Invocation>,
  connection: Weak<Connection>,
}

impl std::fmt::Debug for ReplyFuture {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ReplyFuture").finish_non_exhaustive()
  }
}

impl ReplyFuture {
  /// Blocks until the invocation resolves.
  pub fn wait(self) -> Result<ReplyData, Error> {
    match self.receiver.recv() {
      Ok(result) => result,
      Err(_) => Err(Error::ConnectionLost(String::from("invocation abandoned"))),
    }
  }

  /// ### WAIT WITH TIMEOUT
  ///
  /// Blocks up to `timeout`. On expiry the invocation is canceled with an
  /// invocation-timeout error; if a reply slipped in concurrently, that
  /// reply wins and is returned.
  pub fn wait_timeout(self, timeout: Duration) -> Result<ReplyData, Error> {
    match self.receiver.recv_timeout(timeout) {
      Ok(result) => result,
      Err(oneshot::RecvTimeoutError::Disconnected) => {
        Err(Error::ConnectionLost(String::from("invocation abandoned")))
      }
      Err(oneshot::RecvTimeoutError::Timeout) => {
        if let Some(connection) = self.connection.upgrade() {
          connection.cancel_request(&self.invocation, Error::InvocationTimeout);
        } else {
          self.invocation.complete_failed(Error::InvocationTimeout);
        }
        // Cancellation resolves the invocation exactly once, so this recv
        // returns promptly with whichever outcome won.
        match self.receiver.recv() {
          Ok(result) => result,
          Err(_) => Err(Error::InvocationTimeout),
        }
      }
    }
  }

  /// Cancels the invocation from any thread. A no-op when it has already
  /// resolved.
  pub fn cancel(&self) {
    if let Some(connection) = self.connection.upgrade() {
      connection.cancel_request(&self.invocation, Error::InvocationCanceled);
    } else {
      self.invocation.complete_failed(Error::InvocationCanceled);
    }
  }

  /// The underlying invocation handle.
  pub fn invocation(&self) -> &Arc<Invocation> {
    &self.invocation
  }
}

/// ## SENT FUTURE
///
/// The caller's handle for a oneway invocation or a batch flush; resolves
/// once the frame has been written, or with the failure that prevented it.
pub struct SentFuture {
  receiver: oneshot::Receiver<Result<(), Error>>,
  invocation: Arc<Invocation>,
  connection: Weak<Connection>,
}

impl SentFuture {
  /// Blocks until the frame is on the wire or the send failed.
  pub fn wait(self) -> Result<(), Error> {
    match self.receiver.recv() {
      Ok(result) => result,
      Err(_) => Err(Error::ConnectionLost(String::from("invocation abandoned"))),
    }
  }

  /// Cancels the send if its frame has not started; bytes already handed to
  /// the transport always finish their frame.
  pub fn cancel(&self) {
    if let Some(connection) = self.connection.upgrade() {
      connection.cancel_request(&self.invocation, Error::InvocationCanceled);
    } else {
      self.invocation.complete_failed(Error::InvocationCanceled);
    }
  }

  /// The underlying invocation handle.
  pub fn invocation(&self) -> &Arc<Invocation> {
    &self.invocation
  }
}

/// ## COMPRESS BATCH
///
/// Per-flush override of the batch message's compression eligibility.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressBatch {
  /// Compress the batch message if it reaches the size floor.
  Yes,

  /// Never compress the batch message.
  No,

  /// Compress when any batched request asked for compression.
  BasedOnProxy,
}

struct BatchInner {
  stream: OutputStream,
  count: i32,
  compress: bool,
  exception: Option<Error>,
}

/// ## BATCH QUEUE
///
/// Accumulates batched one-way requests into a single pre-framed
/// batch-request message, swapped out whole by the flush procedure. The
/// queue has its own lock so marshaling into it never contends with the
/// connection's I/O.
pub(crate) struct BatchQueue {
  inner: Mutex<BatchInner>,
}

impl BatchQueue {
  pub(crate) fn new() -> Self {
    BatchQueue {
      inner: Mutex::new(BatchInner {
        stream: Self::fresh_stream(),
        count: 0,
        compress: false,
        exception: None,
      }),
    }
  }

  // Header plus the request-count placeholder patched at send time.
  fn fresh_stream() -> OutputStream {
    let mut os = OutputStream::with_capacity(HEADER_SIZE + 4);
    MessageHeader::new(MessageType::BatchRequest, 0).write_to(&mut os);
    os.write_i32(0);
    os
  }

  /// Appends one request body to the open batch.
  pub(crate) fn add(
    &self,
    compress: bool,
    write_request: impl FnOnce(&mut OutputStream),
  ) -> Result<(), Error> {
    let mut inner = self.inner.lock().unwrap();
    if let Some(exception) = &inner.exception {
      return Err(exception.clone());
    }
    write_request(&mut inner.stream);
    inner.count += 1;
    inner.compress |= compress;
    Ok(())
  }

  /// Takes the accumulated batch, leaving the queue empty. Returns the
  /// framed stream, the request count, and the compression eligibility, or
  /// nothing when no requests were batched.
  pub(crate) fn swap(&self) -> Option<(OutputStream, i32, bool)> {
    let mut inner = self.inner.lock().unwrap();
    if inner.count == 0 {
      return None;
    }
    let stream: OutputStream = std::mem::replace(&mut inner.stream, Self::fresh_stream());
    let count: i32 = std::mem::take(&mut inner.count);
    let compress: bool = std::mem::take(&mut inner.compress);
    Some((stream, count, compress))
  }

  /// Whether the queue currently holds no batched requests.
  pub(crate) fn is_empty(&self) -> bool {
    self.inner.lock().unwrap().count == 0
  }

  /// Fails the queue permanently; batched and future requests observe the
  /// connection's exception.
  pub(crate) fn destroy(&self, exception: Error) {
    let mut inner = self.inner.lock().unwrap();
    if inner.exception.is_none() {
      inner.exception = Some(exception);
    }
  }
}

/// ## PROXY
///
/// The invoker: addresses one [Identity] (and optional facet) over one
/// established [Connection] and turns operation calls into framed requests.
/// The generated code of an IDL compiler would call these procedures; they
/// can equally be called by hand.
///
/// [Identity]:   crate::Identity
/// [Connection]: crate::connection::Connection
pub struct Proxy {
  connection: Arc<Connection>,
  identity: Identity,
  facet: String,
  context: HashMap<String, String>,
  compress: bool,
  invocation_timeout: Option<Duration>,
}

impl Proxy {
  /// A proxy for `identity` on the given connection, with no facet, no
  /// default context, and no compression.
  pub fn new(connection: Arc<Connection>, identity: Identity) -> Self {
    Proxy {
      connection,
      identity,
      facet: String::new(),
      context: HashMap::new(),
      compress: false,
      invocation_timeout: None,
    }
  }

  /// Selects a facet of the target identity.
  pub fn with_facet(mut self, facet: &str) -> Self {
    self.facet = facet.to_owned();
    self
  }

  /// Sets the default per-request context.
  pub fn with_context(mut self, context: HashMap<String, String>) -> Self {
    self.context = context;
    self
  }

  /// Marks requests from this proxy compress-eligible.
  pub fn with_compress(mut self, compress: bool) -> Self {
    self.compress = compress;
    self
  }

  /// Arms a per-invocation timeout; expired invocations are canceled with
  /// an invocation-timeout error while the connection itself survives.
  pub fn with_invocation_timeout(mut self, timeout: Duration) -> Self {
    self.invocation_timeout = Some(timeout);
    self
  }

  /// The connection this proxy invokes on.
  pub fn connection(&self) -> &Arc<Connection> {
    &self.connection
  }

  /// ### TWOWAY PROCEDURE
  ///
  /// Marshals a request expecting a reply and submits it. The returned
  /// future resolves with the reply, with the connection's failure, or with
  /// a cancellation.
  pub fn invoke_twoway(
    &self,
    operation: &str,
    mode: OperationMode,
    context: Option<&HashMap<String, String>>,
    write_params: impl FnOnce(&mut OutputStream),
    sent_callback: Option<SentCallback>,
  ) -> Result<ReplyFuture, SendError> {
    let mut os = OutputStream::with_capacity(64);
    MessageHeader::new(MessageType::Request, 0).write_to(&mut os);
    os.write_i32(0); // request id, assigned by the connection
    self.write_request_header(&mut os, operation, mode, context);
    os.start_encaps();
    write_params(&mut os);
    os.end_encaps();

    let (sender, receiver) = oneshot::channel::<Result<ReplyData, Error>>();
    let invocation: Arc<Invocation> = Invocation::twoway(operation, sender, sent_callback);

    let status: SendStatus =
      self
        .connection
        .send_async_request(&invocation, os, self.compress, true, 0)?;
    if status == SendStatus::SentAndInvokeSentCallback {
      invocation.invoke_sent_callback();
    }
    if let Some(timeout) = self.invocation_timeout {
      self
        .connection
        .schedule_invocation_timeout(&invocation, timeout);
    }
    Ok(ReplyFuture {
      receiver,
      invocation,
      connection: Arc::downgrade(&self.connection),
    })
  }

  /// ### ONEWAY PROCEDURE
  ///
  /// Marshals a request with no reply (request id zero) and submits it. The
  /// returned future resolves when the frame is on the wire.
  pub fn invoke_oneway(
    &self,
    operation: &str,
    mode: OperationMode,
    context: Option<&HashMap<String, String>>,
    write_params: impl FnOnce(&mut OutputStream),
    sent_callback: Option<SentCallback>,
  ) -> Result<SentFuture, SendError> {
    let mut os = OutputStream::with_capacity(64);
    MessageHeader::new(MessageType::Request, 0).write_to(&mut os);
    os.write_i32(0); // request id zero: no reply expected
    self.write_request_header(&mut os, operation, mode, context);
    os.start_encaps();
    write_params(&mut os);
    os.end_encaps();

    let (sender, receiver) = oneshot::channel::<Result<(), Error>>();
    let invocation: Arc<Invocation> = Invocation::oneway(operation, sender, sent_callback);

    let status: SendStatus =
      self
        .connection
        .send_async_request(&invocation, os, self.compress, false, 0)?;
    if status == SendStatus::SentAndInvokeSentCallback {
      invocation.invoke_sent_callback();
    }
    Ok(SentFuture {
      receiver,
      invocation,
      connection: Arc::downgrade(&self.connection),
    })
  }

  /// ### BATCH PROCEDURE
  ///
  /// Marshals a one-way request into the connection's batch queue. Nothing
  /// is transmitted until the [Flush Procedure] runs.
  ///
  /// [Flush Procedure]: Proxy::flush_batch
  pub fn invoke_batch_oneway(
    &self,
    operation: &str,
    mode: OperationMode,
    context: Option<&HashMap<String, String>>,
    write_params: impl FnOnce(&mut OutputStream),
  ) -> Result<(), Error> {
    self.connection.batch_queue().add(self.compress, |os| {
      self.write_request_header(os, operation, mode, context);
      os.start_encaps();
      write_params(os);
      os.end_encaps();
    })
  }

  /// ### FLUSH PROCEDURE
  ///
  /// Coalesces all batched one-ways into a single batch-request frame and
  /// submits it. An empty batch resolves immediately.
  pub fn flush_batch(&self, compress: CompressBatch) -> Result<SentFuture, SendError> {
    let (sender, receiver) = oneshot::channel::<Result<(), Error>>();
    let invocation: Arc<Invocation> = Invocation::oneway("flushBatchRequests", sender, None);

    match self.connection.batch_queue().swap() {
      None => {
        invocation.sent();
      }
      Some((os, count, queued_compress)) => {
        let compress: bool = match compress {
          CompressBatch::Yes => true,
          CompressBatch::No => false,
          CompressBatch::BasedOnProxy => queued_compress,
        };
        let status: SendStatus =
          self
            .connection
            .send_async_request(&invocation, os, compress, false, count)?;
        if status == SendStatus::SentAndInvokeSentCallback {
          invocation.invoke_sent_callback();
        }
      }
    }
    Ok(SentFuture {
      receiver,
      invocation,
      connection: Arc::downgrade(&self.connection),
    })
  }

  // Identity, facet, operation, mode and context, in wire order. The legacy
  // nonmutating mode travels as idempotent.
  fn write_request_header(
    &self,
    os: &mut OutputStream,
    operation: &str,
    mode: OperationMode,
    context: Option<&HashMap<String, String>>,
  ) {
    self.identity.write(os);
    if self.facet.is_empty() {
      os.write_size(0);
    } else {
      os.write_size(1);
      os.write_string(&self.facet);
    }
    os.write_string(operation);
    let wire_mode: OperationMode = match mode {
      OperationMode::Nonmutating => OperationMode::Idempotent,
      other => other,
    };
    os.write_enum(u8::from(wire_mode) as i32);
    os.write_string_dict(context.unwrap_or(&self.context));
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_invocation_resolves_exactly_once() {
    let (sender, receiver) = oneshot::channel();
    let invocation = Invocation::twoway("ping", sender, None);
    invocation.complete_failed(Error::ConnectionLost("reset".into()));
    // A later failure must not override the first resolution.
    invocation.complete_failed(Error::InvocationCanceled);
    assert_eq!(invocation.state(), InvocationState::Failed);
    assert!(matches!(
      receiver.recv().unwrap(),
      Err(Error::ConnectionLost(_))
    ));
  }

  #[test]
  fn test_cancellation_after_reply_is_noop() {
    let (sender, receiver) = oneshot::channel();
    let invocation = Invocation::twoway("ping", sender, None);
    let mut os = OutputStream::new();
    os.write_u8(ReplyStatus::Ok.into());
    os.write_empty_encaps();
    invocation.complete_from_stream(InputStream::new(os.into_bytes()));
    invocation.complete_failed(Error::InvocationCanceled);
    assert_eq!(invocation.state(), InvocationState::ReplyReceived);
    let reply: ReplyData = receiver.recv().unwrap().unwrap();
    assert_eq!(reply.status, ReplyStatus::Ok);
  }

  #[test]
  fn test_oneway_sent_resolves_future() {
    let (sender, receiver) = oneshot::channel();
    let invocation = Invocation::oneway("notify", sender, None);
    assert!(!invocation.sent());
    assert_eq!(invocation.state(), InvocationState::Sent);
    assert!(receiver.recv().unwrap().is_ok());
  }

  #[test]
  fn test_sent_reports_pending_callback() {
    let (sender, _receiver) = oneshot::channel();
    let invocation = Invocation::oneway("notify", sender, Some(Box::new(|| {})));
    assert!(invocation.sent());
  }

  #[test]
  fn test_batch_queue_swap_and_reset() {
    let queue = BatchQueue::new();
    assert!(queue.is_empty());
    assert!(queue.swap().is_none());

    queue.add(false, |os| os.write_string("one")).unwrap();
    queue.add(true, |os| os.write_string("two")).unwrap();
    let (stream, count, compress) = queue.swap().unwrap();
    assert_eq!(count, 2);
    assert!(compress);
    assert!(stream.len() > HEADER_SIZE + 4);
    assert!(queue.is_empty());
  }

  #[test]
  fn test_batch_queue_destroyed_rejects_requests() {
    let queue = BatchQueue::new();
    queue.destroy(Error::CommunicatorDestroyed);
    assert!(matches!(
      queue.add(false, |_| {}),
      Err(Error::CommunicatorDestroyed)
    ));
  }
}
