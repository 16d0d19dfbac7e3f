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

//! # ICE PROTOCOL CONNECTION ENGINE
//!
//! Implements the per-connection core of the Ice protocol: the connection
//! state machine with its readiness-driven I/O loop, the framed binary
//! message protocol, request/reply correlation with cancellation, the send
//! queue with backpressure, active connection management, and the
//! invocation and dispatch adapters that marshal typed parameters to and
//! from user code.
//!
//! For ease of programming and extension, the functionality has been divided
//! into a few subsets: the [Transport Contracts], which name the byte-level
//! and scheduling collaborators the engine consumes; the [Connection], which
//! owns one transport and multiplexes requests and replies over it; the
//! [Active Connection Management] policy driving heartbeats and idle closes;
//! the [Invocation Services], the client-side path from typed arguments to a
//! framed request and back from its reply; and the [Dispatch Services], the
//! server-side path from a framed request to a servant and back.
//!
//! ---------------------------------------------------------------------------
//!
//! To use the engine:
//!
//! - Provide a [Transceiver] for the wire, a [Thread Pool] for readiness
//!   scheduling, and a [Timer] for protocol timeouts.
//! - Create a [Connection] over them, [Start] it, and [Activate] it.
//! - On the client side, build a [Proxy] and invoke operations on it.
//! - On the server side, register [Servant]s with a [Servant Manager] and
//!   hand it to the connection.
//! - Close with the [Close Procedure] in one of its three modes.
//!
//! [Transport Contracts]:          transport
//! [Transceiver]:                  transport::Transceiver
//! [Thread Pool]:                  transport::ThreadPool
//! [Timer]:                        transport::Timer
//! [Connection]:                   connection::Connection
//! [Start]:                        connection::Connection::start
//! [Activate]:                     connection::Connection::activate
//! [Close Procedure]:              connection::Connection::close
//! [Active Connection Management]: acm
//! [Invocation Services]:          invocation
//! [Proxy]:                        invocation::Proxy
//! [Dispatch Services]:            dispatch
//! [Servant]:                      dispatch::Servant
//! [Servant Manager]:              dispatch::ServantManager

pub mod acm;
pub mod connection;
pub mod dispatch;
pub mod invocation;
pub mod transport;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error as ThisError;

pub use icep_codec::{EncodingError, EncodingVersion, InputStream, OutputStream, ENCODING_1_1};

/// ## MESSAGE MAGIC
///
/// The four bytes `I` `c` `e` `P` opening every framed message.
pub const MAGIC: [u8; 4] = [0x49, 0x63, 0x65, 0x50];

/// ## HEADER SIZE
///
/// Every message starts with a fixed header of exactly 14 bytes; a framed
/// message can never be shorter than this.
pub const HEADER_SIZE: usize = 14;

/// Byte offset of the compression status within the header.
pub const COMPRESSION_STATUS_POS: usize = 9;

/// Byte offset of the little-endian total message size within the header.
pub const MESSAGE_SIZE_POS: usize = 10;

/// Byte offset of the request id within a request or reply message, directly
/// after the header.
pub const REQUEST_ID_POS: usize = HEADER_SIZE;

/// ## PROTOCOL VERSION
///
/// Two-byte protocol version carried by every message header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolVersion {
  pub major: u8,
  pub minor: u8,
}

/// Protocol version 1.0, the only version this engine speaks.
pub const PROTOCOL_1_0: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

/// ## MESSAGE TYPE
///
/// The one-byte discriminator at offset 8 of the message header. Receipt of
/// any other value terminates the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageType {
  /// A single request, carrying a request id and one encapsulation.
  Request = 0,

  /// Several one-way requests coalesced into one frame: a count, then the
  /// inlined requests.
  BatchRequest = 1,

  /// A reply: request id, reply status, then status-dependent data.
  Reply = 2,

  /// A bare header used for connection validation and as a heartbeat.
  ValidateConnection = 3,

  /// A bare header announcing a graceful close.
  CloseConnection = 4,
}

/// ## COMPRESSION STATUS
///
/// The one-byte compression field at offset 9 of the message header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CompressionStatus {
  /// The body is not compressed and the sender does not ask for compressed
  /// replies.
  None = 0,

  /// The body is not compressed, but the sender can decompress.
  Supported = 1,

  /// The body after the header is bzip2-compressed, prefixed by the 4-byte
  /// uncompressed message size.
  Compressed = 2,
}

/// ## REPLY STATUS
///
/// The one-byte status following the request id of every reply message,
/// selecting the layout of the rest of the reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ReplyStatus {
  /// Success; the out-parameters follow in an encapsulation.
  Ok = 0,

  /// A declared user exception follows in an encapsulation.
  UserException = 1,

  /// No servant with the requested identity; identity, facet and operation
  /// follow unencapsulated.
  ObjectNotExist = 2,

  /// No servant with the requested facet; same layout as
  /// [ObjectNotExist](ReplyStatus::ObjectNotExist).
  FacetNotExist = 3,

  /// The servant does not implement the requested operation; same layout as
  /// [ObjectNotExist](ReplyStatus::ObjectNotExist).
  OperationNotExist = 4,

  /// An unspecified local error on the server; a reason string follows.
  UnknownLocalException = 5,

  /// An undeclared user exception on the server; a reason string follows.
  UnknownUserException = 6,

  /// Any other server-side failure; a reason string follows.
  UnknownException = 7,
}

/// ## OPERATION MODE
///
/// Declared per operation and carried in every request. The receiver rejects
/// a request whose sent mode is weaker than the operation's declared mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OperationMode {
  /// May mutate state; never re-sent without explicit retry.
  Normal = 0,

  /// Legacy read-only marker; treated as
  /// [Idempotent](OperationMode::Idempotent) on the wire.
  Nonmutating = 1,

  /// Safe to re-send; the implementation must tolerate duplicate execution.
  Idempotent = 2,
}

/// ## IDENTITY
///
/// The two-part name addressing a servant: a name unique within an optional
/// category namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Identity {
  pub name: String,
  pub category: String,
}

impl Identity {
  /// An identity with an empty category.
  pub fn named(name: &str) -> Self {
    Identity {
      name: name.to_owned(),
      category: String::new(),
    }
  }

  /// Marshals the identity in wire order.
  pub fn write(&self, os: &mut OutputStream) {
    os.write_string(&self.name);
    os.write_string(&self.category);
  }

  /// Unmarshals an identity.
  pub fn read(is: &mut InputStream) -> Result<Self, EncodingError> {
    Ok(Identity {
      name: is.read_string()?,
      category: is.read_string()?,
    })
  }
}

impl std::fmt::Display for Identity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.category.is_empty() {
      write!(f, "{}", self.name)
    } else {
      write!(f, "{}/{}", self.category, self.name)
    }
  }
}

/// ## MESSAGE HEADER
///
/// The fixed 14-byte field opening every message: magic, protocol and
/// encoding versions, message type, compression status, and the total
/// message size in little-endian byte order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
  pub protocol: ProtocolVersion,
  pub encoding: EncodingVersion,
  pub message_type: MessageType,
  pub compression: CompressionStatus,
  pub size: i32,
}

impl MessageHeader {
  /// A header with the current protocol and encoding versions and no
  /// compression.
  pub fn new(message_type: MessageType, size: i32) -> Self {
    MessageHeader {
      protocol: PROTOCOL_1_0,
      encoding: ENCODING_1_1,
      message_type,
      compression: CompressionStatus::None,
      size,
    }
  }

  /// ### SERIALIZE MESSAGE HEADER
  ///
  /// Converts a header into its 14 wire bytes.
  pub fn encode(&self) -> [u8; HEADER_SIZE] {
    let mut bytes: [u8; HEADER_SIZE] = [0; HEADER_SIZE];
    bytes[0..4].copy_from_slice(&MAGIC);
    bytes[4] = self.protocol.major;
    bytes[5] = self.protocol.minor;
    bytes[6] = self.encoding.major;
    bytes[7] = self.encoding.minor;
    bytes[8] = self.message_type.into();
    bytes[9] = self.compression.into();
    bytes[10..14].copy_from_slice(&self.size.to_le_bytes());
    bytes
  }

  /// Appends the 14 header bytes to a marshaling stream.
  pub fn write_to(&self, os: &mut OutputStream) {
    os.write_blob(&self.encode());
  }

  /// ### DESERIALIZE MESSAGE HEADER
  ///
  /// Parses and validates 14 received bytes. Any header this function
  /// rejects is fatal for the connection that received it.
  pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Result<Self, Error> {
    if bytes[0..4] != MAGIC {
      return Err(Error::BadMagic([bytes[0], bytes[1], bytes[2], bytes[3]]));
    }
    let protocol = ProtocolVersion {
      major: bytes[4],
      minor: bytes[5],
    };
    if protocol.major != PROTOCOL_1_0.major || protocol.minor > PROTOCOL_1_0.minor {
      return Err(Error::UnsupportedProtocol {
        major: protocol.major,
        minor: protocol.minor,
      });
    }
    let encoding = EncodingVersion {
      major: bytes[6],
      minor: bytes[7],
    };
    if encoding.major != ENCODING_1_1.major || encoding.minor > ENCODING_1_1.minor {
      return Err(Error::UnsupportedEncoding {
        major: encoding.major,
        minor: encoding.minor,
      });
    }
    let message_type: MessageType =
      MessageType::try_from(bytes[8]).map_err(|_| Error::UnknownMessageType(bytes[8]))?;
    // Only the value 2 means anything on receipt; any other value is some
    // flavor of "not compressed".
    let compression: CompressionStatus = match bytes[9] {
      2 => CompressionStatus::Compressed,
      1 => CompressionStatus::Supported,
      _ => CompressionStatus::None,
    };
    let size: i32 = i32::from_le_bytes(bytes[10..14].try_into().unwrap());
    if size < HEADER_SIZE as i32 {
      return Err(Error::IllegalMessageSize(size));
    }
    Ok(MessageHeader {
      protocol,
      encoding,
      message_type,
      compression,
      size,
    })
  }
}

/// ## CONNECTION ERROR
///
/// Every way a connection, or an invocation riding on it, can fail. A
/// connection records the first such error permanently; all pending and
/// later operations observe that same error.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum Error {
  /// The peer sent a header that does not start with `IceP`.
  #[error("bad message magic {0:02x?}")]
  BadMagic([u8; 4]),

  /// The peer speaks a protocol version this engine does not.
  #[error("unsupported protocol version {major}.{minor}")]
  UnsupportedProtocol { major: u8, minor: u8 },

  /// The peer framed a message with an encoding version this engine does
  /// not read.
  #[error("unsupported encoding version {major}.{minor}")]
  UnsupportedEncoding { major: u8, minor: u8 },

  /// The header's message type byte is not a known message type.
  #[error("unknown message type {0}")]
  UnknownMessageType(u8),

  /// The header declared a size smaller than the header itself, or
  /// otherwise impossible.
  #[error("illegal message size {0}")]
  IllegalMessageSize(i32),

  /// The declared message size exceeds the configured maximum.
  #[error("message of {size} bytes exceeds the maximum of {max}")]
  MemoryLimit { size: usize, max: usize },

  /// The first message read during validation was not a validate-connection
  /// message.
  #[error("connection not validated by peer")]
  ConnectionNotValidated,

  /// The transport failed or the peer reset outside a graceful close.
  #[error("connection lost: {0}")]
  ConnectionLost(String),

  /// The transport could not be brought up.
  #[error("connect failed: {0}")]
  ConnectFailed(String),

  /// An endpoint read or write timed out while the connection was active.
  #[error("connection timed out")]
  Timeout,

  /// Establishment or validation exceeded the connect timeout.
  #[error("connect timed out")]
  ConnectTimeout,

  /// The peer did not complete a graceful close within the close timeout.
  #[error("close timed out")]
  CloseTimeout,

  /// The connection aged out under the active connection management policy.
  #[error("connection closed by activity monitor")]
  ConnectionTimeout,

  /// An invocation exceeded its own timeout; the connection itself
  /// survives.
  #[error("invocation timed out")]
  InvocationTimeout,

  /// An invocation was canceled by its caller.
  #[error("invocation canceled")]
  InvocationCanceled,

  /// The connection was closed locally by the user.
  #[error("connection manually closed (graceful={graceful})")]
  ManuallyClosed { graceful: bool },

  /// The peer sent a close-connection message.
  #[error("connection closed by peer")]
  CloseConnection,

  /// The owning object adapter was deactivated.
  #[error("object adapter deactivated")]
  AdapterDeactivated,

  /// The owning communicator was destroyed.
  #[error("communicator destroyed")]
  CommunicatorDestroyed,

  /// A compressed message arrived but this build carries no decompressor.
  #[error("cannot uncompress compressed message")]
  CompressionUnsupported,

  /// The compression library rejected a buffer.
  #[error("bzip2 failure: {0}")]
  Compression(String),

  /// A datagram was truncated; fatal only for stream transports.
  #[error("datagram of {0} bytes exceeded the limit")]
  DatagramLimit(usize),

  /// Marshaling or unmarshaling failed.
  #[error(transparent)]
  Encoding(#[from] EncodingError),

  /// User code failed so badly that no reply could be marshaled.
  #[error("fatal dispatch failure: {0}")]
  DispatchFailed(String),
}

impl Error {
  /// ### EXPECTED ERRORS
  ///
  /// The error kinds that occur during orderly shutdown. These never produce
  /// the validated-connection warning log.
  pub fn expected(&self) -> bool {
    matches!(
      self,
      Error::CloseConnection
        | Error::ManuallyClosed { .. }
        | Error::ConnectionTimeout
        | Error::CommunicatorDestroyed
        | Error::AdapterDeactivated
    )
  }
}

/// ## SEND ERROR
///
/// Failure to submit a request to a connection. A [Retry] failure means the
/// connection had already failed before the request was accepted, so a
/// higher-level proxy may transparently try another connection; an [Aborted]
/// failure consumed the request.
///
/// [Retry]:   SendError::Retry
/// [Aborted]: SendError::Aborted
#[derive(Clone, Debug, ThisError)]
pub enum SendError {
  #[error("invocation may be retried on another connection: {0}")]
  Retry(Error),

  #[error(transparent)]
  Aborted(Error),
}
