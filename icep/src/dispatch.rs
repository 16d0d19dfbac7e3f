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

//! # DISPATCH SERVICES
//!
//! The server-side path of the engine: from a framed request extracted by
//! the connection's I/O loop, through servant lookup and parameter
//! unmarshaling, into user code, and back out as a framed reply on the
//! originating connection.
//!
//! ---------------------------------------------------------------------------
//!
//! To serve operations:
//!
//! - Implement [Servant] for each object: a thin switch on the operation
//!   name that unmarshals in-parameters, runs the method body, and completes
//!   through the [Responder].
//! - Implement (or reuse) a [Servant Manager] mapping identities and facets
//!   to servants, and hand it to the server-side connection.
//! - Completion may be synchronous (consume the [Responder] before
//!   returning) or deferred (move it into a worker and consume it later);
//!   in-parameters must be read before returning either way.
//!
//! [Servant]:         Servant
//! [Servant Manager]: ServantManager
//! [Responder]:       Responder

use std::collections::HashMap;
use std::sync::Arc;

use log::trace;

use crate::connection::Connection;
use crate::{
  Error, Identity, InputStream, MessageHeader, MessageType, OperationMode, OutputStream,
  ReplyStatus,
};

/// ## CURRENT
///
/// Everything the engine knows about one in-flight dispatch, handed to the
/// servant alongside the in-parameter stream.
#[derive(Clone, Debug)]
pub struct Current {
  pub identity: Identity,
  pub facet: String,
  pub operation: String,
  pub mode: OperationMode,
  pub context: HashMap<String, String>,

  /// Zero for one-way and batched requests.
  pub request_id: i32,

  /// Whether the client waits for a reply.
  pub requires_response: bool,
}

/// ## DISPATCH RESULT
///
/// What a [Servant]'s dispatch switch reports back to the engine.
///
/// [Servant]: Servant
pub enum DispatchResult {
  /// The responder was consumed before returning.
  Completed,

  /// The responder was moved elsewhere and will be consumed later.
  Deferred,

  /// The operation name is not part of this servant's interface; the
  /// engine marshals the operation-not-exist reply.
  OperationNotExist(Responder),
}

/// ## SERVANT
///
/// A dispatch target. Generated code for an interface is a thin switch on
/// `current.operation` that unmarshals the in-parameters from `params`
/// (positioned inside the request encapsulation), invokes the typed method
/// body, and completes through the responder.
///
/// In-parameters must be fully read before `dispatch` returns, even when
/// completion is deferred; the stream is reclaimed afterwards.
pub trait Servant: Send + Sync {
  /// The declared mode of `operation`, when the implementor carries
  /// operation metadata (generated code does; hand-written servants may
  /// not). When a mode is declared, the engine runs [Check Mode] against
  /// the request's sent mode and rejects violations before `dispatch` is
  /// invoked.
  ///
  /// [Check Mode]: check_mode
  fn declared_mode(&self, operation: &str) -> Option<OperationMode> {
    let _ = operation;
    None
  }

  fn dispatch(
    &self,
    current: &Current,
    params: &mut InputStream,
    responder: Responder,
  ) -> DispatchResult;
}

/// ## SERVANT MANAGER
///
/// The adapter-side registry the engine consults for each request. Lookup
/// failures become object-not-exist or facet-not-exist replies.
pub trait ServantManager: Send + Sync {
  /// The servant serving `identity` under `facet`, if any.
  fn find(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>>;

  /// Whether any facet of `identity` is served; distinguishes
  /// facet-not-exist from object-not-exist.
  fn has_servant(&self, identity: &Identity) -> bool {
    self.find(identity, "").is_some()
  }
}

/// ### OPERATION MODE CHECK
///
/// Rejects a request whose sent mode is weaker than the operation's declared
/// mode: an operation declared idempotent (or nonmutating) must never be
/// dispatched from a normal-mode request, since the sender then does not
/// know the operation may be re-executed.
pub fn check_mode(declared: OperationMode, received: OperationMode) -> Result<(), Error> {
  if declared != OperationMode::Normal && received == OperationMode::Normal {
    return Err(Error::DispatchFailed(format!(
      "operation declared {declared:?} but request was sent {received:?}"
    )));
  }
  Ok(())
}

/// ## RESPONDER
///
/// The completion handle for one dispatch. Exactly one reply method is
/// called, consuming the responder; for one-way requests every reply method
/// degrades to the silent no-response completion. Dropping an unconsumed
/// responder completes the dispatch without a reply so the connection's
/// dispatch counter can never leak.
pub struct Responder {
  connection: Arc<Connection>,
  request_id: i32,
  requires_response: bool,
  compress: bool,
  armed: bool,
}

impl Responder {
  pub(crate) fn new(
    connection: Arc<Connection>,
    request_id: i32,
    requires_response: bool,
    compress: bool,
  ) -> Self {
    Responder {
      connection,
      request_id,
      requires_response,
      compress,
      armed: true,
    }
  }

  /// The connection this dispatch arrived on.
  pub fn connection(&self) -> &Arc<Connection> {
    &self.connection
  }

  /// ### SUCCESS REPLY
  ///
  /// Marshals the return value and out-parameters into the reply
  /// encapsulation and sends it.
  pub fn ok(mut self, write_results: impl FnOnce(&mut OutputStream)) {
    self.reply(ReplyStatus::Ok, |os| {
      os.start_encaps();
      write_results(os);
      os.end_encaps();
    });
  }

  /// ### PRE-MARSHALED REPLY
  ///
  /// Sends an already-encoded out-parameter encapsulation, bypassing
  /// marshaling.
  pub fn ok_encoded(mut self, params_encaps: &[u8]) {
    self.reply(ReplyStatus::Ok, |os| os.write_blob(params_encaps));
  }

  /// ### USER EXCEPTION REPLY
  ///
  /// Marshals a declared user exception as a sliced encapsulation.
  pub fn user_exception(mut self, type_id: &str, write_members: impl FnOnce(&mut OutputStream)) {
    self.reply(ReplyStatus::UserException, |os| {
      os.start_encaps();
      os.write_exception(type_id, write_members);
      os.end_encaps();
    });
  }

  /// No servant with the requested identity.
  pub fn object_not_exist(mut self, current: &Current) {
    self.not_exist(ReplyStatus::ObjectNotExist, current);
  }

  /// No servant with the requested facet.
  pub fn facet_not_exist(mut self, current: &Current) {
    self.not_exist(ReplyStatus::FacetNotExist, current);
  }

  /// The servant does not implement the requested operation.
  pub fn operation_not_exist(mut self, current: &Current) {
    self.not_exist(ReplyStatus::OperationNotExist, current);
  }

  /// An unrecoverable local error while executing the operation.
  pub fn unknown_local_exception(mut self, reason: &str) {
    let reason: String = reason.to_owned();
    self.reply(ReplyStatus::UnknownLocalException, |os| {
      os.write_string(&reason);
    });
  }

  /// An undeclared exception escaping the operation.
  pub fn unknown_user_exception(mut self, reason: &str) {
    let reason: String = reason.to_owned();
    self.reply(ReplyStatus::UnknownUserException, |os| {
      os.write_string(&reason);
    });
  }

  /// Completes a one-way dispatch, or abandons a two-way without replying.
  pub fn no_response(mut self) {
    self.armed = false;
    self.connection.send_no_response();
  }

  // The not-exist statuses carry identity, facet and operation without an
  // encapsulation.
  fn not_exist(&mut self, status: ReplyStatus, current: &Current) {
    let identity: Identity = current.identity.clone();
    let facet: String = current.facet.clone();
    let operation: String = current.operation.clone();
    self.reply(status, move |os| {
      identity.write(os);
      if facet.is_empty() {
        os.write_size(0);
      } else {
        os.write_size(1);
        os.write_string(&facet);
      }
      os.write_string(&operation);
    });
  }

  fn reply(&mut self, status: ReplyStatus, write_body: impl FnOnce(&mut OutputStream)) {
    self.armed = false;
    if !self.requires_response {
      self.connection.send_no_response();
      return;
    }
    let mut os = OutputStream::with_capacity(32);
    MessageHeader::new(MessageType::Reply, 0).write_to(&mut os);
    os.write_i32(self.request_id);
    os.write_u8(status.into());
    write_body(&mut os);
    self.connection.send_response(os, self.compress);
  }
}

impl Drop for Responder {
  fn drop(&mut self) {
    if self.armed {
      self.armed = false;
      self.connection.send_no_response();
    }
  }
}

/// ### DISPATCH ALL
///
/// Runs every request carried by one incoming frame: a single request, or
/// the `invoke_num` inlined requests of a batch. Called by the connection's
/// dispatch path outside its lock. A decode failure is fatal for the
/// connection; the remaining dispatch count is surrendered through
/// [Invoke Exception].
///
/// [Invoke Exception]: crate::connection::Connection::invoke_exception
pub(crate) fn dispatch_all(
  connection: &Arc<Connection>,
  mut stream: InputStream,
  invoke_num: usize,
  request_id: i32,
  compress_reply: bool,
  manager: &Arc<dyn ServantManager>,
) {
  let mut remaining: usize = invoke_num;
  while remaining > 0 {
    match dispatch_one(connection, &mut stream, request_id, compress_reply, manager) {
      Ok(()) => remaining -= 1,
      Err(error) => {
        connection.invoke_exception(request_id, error, remaining);
        return;
      }
    }
  }
}

fn dispatch_one(
  connection: &Arc<Connection>,
  stream: &mut InputStream,
  request_id: i32,
  compress_reply: bool,
  manager: &Arc<dyn ServantManager>,
) -> Result<(), Error> {
  // REQUEST HEADER
  //
  // Identity, facet, operation, mode and context precede the in-parameter
  // encapsulation.
  let identity: Identity = Identity::read(stream)?;
  let facets: Vec<String> = stream.read_seq(|is| is.read_string())?;
  if facets.len() > 1 {
    return Err(Error::Encoding(icep_codec::EncodingError::IllegalSize {
      size: facets.len() as i64,
    }));
  }
  let facet: String = facets.into_iter().next().unwrap_or_default();
  let operation: String = stream.read_string()?;
  let mode_value: i32 = stream.read_enum()?;
  let mode: OperationMode = OperationMode::try_from(mode_value as u8).map_err(|_| {
    Error::Encoding(icep_codec::EncodingError::InvalidEnumerator { value: mode_value })
  })?;
  let context: HashMap<String, String> = stream.read_string_dict()?;
  stream.start_encaps()?;

  let requires_response: bool = request_id != 0;
  let current = Current {
    identity,
    facet,
    operation,
    mode,
    context,
    request_id,
    requires_response,
  };
  let responder = Responder::new(
    connection.clone(),
    request_id,
    requires_response,
    compress_reply,
  );

  // SERVANT LOOKUP
  //
  // A missing servant is a normal outcome, reported to the client rather
  // than the connection.
  match manager.find(&current.identity, &current.facet) {
    None => {
      trace!(
        "no servant for `{}` facet `{}`",
        current.identity,
        current.facet
      );
      if !current.facet.is_empty() && manager.has_servant(&current.identity) {
        responder.facet_not_exist(&current);
      } else {
        responder.object_not_exist(&current);
      }
    }
    Some(servant) => {
      // MODE VALIDATION
      //
      // A servant that declares the operation's mode never sees a request
      // whose sent mode is weaker than it.
      let mode_violation: Option<Error> = servant
        .declared_mode(&current.operation)
        .and_then(|declared| check_mode(declared, current.mode).err());
      match mode_violation {
        Some(error) => {
          trace!(
            "rejecting `{}` on `{}`: {error}",
            current.operation,
            current.identity
          );
          responder.unknown_local_exception(&error.to_string());
        }
        None => match servant.dispatch(&current, stream, responder) {
          DispatchResult::Completed | DispatchResult::Deferred => {}
          DispatchResult::OperationNotExist(responder) => {
            trace!(
              "servant `{}` has no operation `{}`",
              current.identity,
              current.operation
            );
            responder.operation_not_exist(&current);
          }
        },
      }
    }
  }

  // Land on the encapsulation boundary so the next batched request parses
  // from the right position.
  stream.end_encaps()?;
  Ok(())
}
