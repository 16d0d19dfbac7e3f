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

//! # ICE PROTOCOL MESSAGE CONTENT (ENCODING 1.1)
//!
//! Implements the data encoding used inside framed Ice protocol messages:
//! little-endian fixed-width scalars, compact sizes, length-prefixed UTF-8
//! strings, sequences, dictionaries, enumerators, tagged optional values,
//! [Encapsulation]s, and the sliced format used by user exceptions and class
//! values.
//!
//! ---------------------------------------------------------------------------
//!
//! To marshal data:
//!
//! - Create an [Output Stream] and call the typed `write_*` functions.
//! - Delimit parameter blocks with [Start Encapsulation] and
//!   [End Encapsulation].
//! - Patch previously written positions (message sizes, request ids) with
//!   [Rewrite].
//!
//! To unmarshal data:
//!
//! - Create an [Input Stream] over the received bytes and call the typed
//!   `read_*` functions, which validate sizes and UTF-8 and never read past
//!   a declared [Encapsulation] boundary.
//!
//! [Encapsulation]:       InputStream::start_encaps
//! [Output Stream]:       OutputStream
//! [Input Stream]:        InputStream
//! [Start Encapsulation]: OutputStream::start_encaps
//! [End Encapsulation]:   OutputStream::end_encaps
//! [Rewrite]:             OutputStream::rewrite_i32

use std::collections::HashMap;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// ## ENCODING VERSION
///
/// Two-byte version carried by every message header and every
/// encapsulation. This crate produces encoding 1.1 and accepts 1.0 and 1.1
/// on a per-encapsulation basis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodingVersion {
  pub major: u8,
  pub minor: u8,
}

/// Encoding version 1.0.
pub const ENCODING_1_0: EncodingVersion = EncodingVersion { major: 1, minor: 0 };

/// Encoding version 1.1, the version this crate emits.
pub const ENCODING_1_1: EncodingVersion = EncodingVersion { major: 1, minor: 1 };

/// ## ENCODING ERROR
///
/// Represents a failure to unmarshal received bytes, or to honor a declared
/// size. Every variant is terminal for the block being decoded; the protocol
/// engine treats these as unrecoverable for the enclosing message.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EncodingError {
  /// A read ran past the end of the buffer or the enclosing encapsulation.
  #[error("unmarshaling ran out of bytes at position {position}")]
  EndOfBuffer { position: usize },

  /// A length-prefixed string did not contain valid UTF-8.
  #[error("invalid UTF-8 in string at position {position}")]
  InvalidString { position: usize },

  /// A size field held a value that cannot describe well-formed data.
  #[error("illegal size {size}")]
  IllegalSize { size: i64 },

  /// An encapsulation declared a size its surrounding buffer cannot hold.
  #[error("encapsulation of {size} bytes exceeds the {available} available")]
  EncapsulationOverrun { size: usize, available: usize },

  /// An encapsulation carried an encoding version this crate cannot read.
  #[error("unsupported encoding version {major}.{minor}")]
  UnsupportedEncoding { major: u8, minor: u8 },

  /// An optional value was present with a format other than the declared one.
  #[error("optional value with tag {tag} uses unexpected format {format}")]
  OptionalFormatMismatch { tag: i32, format: u8 },

  /// A slice without a size cannot be skipped when its type is unknown.
  #[error("cannot skip unknown slice `{type_id}` with no size")]
  UnknownSlice { type_id: String },

  /// An enumerator value outside the enumeration's range.
  #[error("invalid enumerator {value}")]
  InvalidEnumerator { value: i32 },

  /// A class instance marker other than the single-instance form.
  #[error("unsupported value reference {marker}")]
  UnsupportedValueReference { marker: i64 },
}

/// ## OPTIONAL FORMAT
///
/// The 3-bit wire format selector carried in the tag byte of every optional
/// value, chosen so that a receiver which does not know the tag can skip the
/// value without knowing its type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OptionalFormat {
  /// Fixed, 1 byte.
  F1 = 0,
  /// Fixed, 2 bytes.
  F2 = 1,
  /// Fixed, 4 bytes.
  F4 = 2,
  /// Fixed, 8 bytes.
  F8 = 3,
  /// A compact size.
  Size = 4,
  /// A compact size followed by that many bytes.
  VSize = 5,
  /// A fixed 4-byte length followed by that many bytes.
  FSize = 6,
  /// A class instance; skipping requires the value factory machinery.
  Class = 7,
}

// Slice flag bits of the 1.1 sliced format.
const FLAG_HAS_TYPE_ID_STRING: u8 = 0x01;
const FLAG_HAS_SLICE_SIZE: u8 = 0x10;
const FLAG_IS_LAST_SLICE: u8 = 0x20;

/// End marker terminating the optional members of a slice.
const OPTIONAL_END_MARKER: u8 = 0xFF;

/// ## SLICE HEADER
///
/// The decoded preamble of one slice of a user exception or class value.
/// `end` is the absolute position one past the slice body when the slice
/// carried a size, which is what makes unknown slices skippable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceHeader {
  pub type_id: Option<String>,
  pub end: Option<usize>,
  pub last: bool,
}

/// ## OUTPUT STREAM
///
/// A growable little-endian marshaling buffer. The stream itself is
/// format-agnostic; the caller sequences the typed writes, opens and closes
/// encapsulations and slices, and finally takes the accumulated bytes.
#[derive(Debug, Default)]
pub struct OutputStream {
  buf: Vec<u8>,
  encaps: Vec<usize>,
  slices: Vec<usize>,
}

impl OutputStream {
  /// Creates an empty stream.
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates an empty stream with room for `capacity` bytes.
  pub fn with_capacity(capacity: usize) -> Self {
    OutputStream {
      buf: Vec::with_capacity(capacity),
      encaps: Vec::new(),
      slices: Vec::new(),
    }
  }

  /// Number of bytes written so far.
  pub fn len(&self) -> usize {
    self.buf.len()
  }

  /// Whether nothing has been written yet.
  pub fn is_empty(&self) -> bool {
    self.buf.is_empty()
  }

  /// The bytes written so far.
  pub fn as_slice(&self) -> &[u8] {
    &self.buf
  }

  /// Consumes the stream, yielding the marshaled bytes.
  pub fn into_bytes(self) -> Vec<u8> {
    debug_assert!(self.encaps.is_empty() && self.slices.is_empty());
    self.buf
  }

  /// Appends raw bytes verbatim.
  pub fn write_blob(&mut self, bytes: &[u8]) {
    self.buf.extend_from_slice(bytes);
  }

  pub fn write_u8(&mut self, value: u8) {
    self.buf.push(value);
  }

  pub fn write_bool(&mut self, value: bool) {
    self.buf.push(u8::from(value));
  }

  pub fn write_i16(&mut self, value: i16) {
    self.buf.extend_from_slice(&value.to_le_bytes());
  }

  pub fn write_i32(&mut self, value: i32) {
    self.buf.extend_from_slice(&value.to_le_bytes());
  }

  pub fn write_i64(&mut self, value: i64) {
    self.buf.extend_from_slice(&value.to_le_bytes());
  }

  pub fn write_f32(&mut self, value: f32) {
    self.buf.extend_from_slice(&value.to_le_bytes());
  }

  pub fn write_f64(&mut self, value: f64) {
    self.buf.extend_from_slice(&value.to_le_bytes());
  }

  /// ### COMPACT SIZE
  ///
  /// One byte for values below 255, otherwise a `0xFF` marker followed by
  /// the full 4-byte little-endian count.
  pub fn write_size(&mut self, size: usize) {
    if size < 255 {
      self.buf.push(size as u8);
    } else {
      self.buf.push(0xFF);
      self.write_i32(size as i32);
    }
  }

  /// A compact size followed by the UTF-8 bytes.
  pub fn write_string(&mut self, value: &str) {
    self.write_size(value.len());
    self.buf.extend_from_slice(value.as_bytes());
  }

  /// An enumerator, marshaled as the compact size of its ordinal value.
  pub fn write_enum(&mut self, ordinal: i32) {
    self.write_size(ordinal as usize);
  }

  /// A sequence: element count, then each element through `write_element`.
  pub fn write_seq<T>(&mut self, items: &[T], mut write_element: impl FnMut(&mut Self, &T)) {
    self.write_size(items.len());
    for item in items {
      write_element(self, item);
    }
  }

  /// A string-to-string dictionary: pair count, then the pairs.
  pub fn write_string_dict(&mut self, entries: &HashMap<String, String>) {
    self.write_size(entries.len());
    for (key, value) in entries {
      self.write_string(key);
      self.write_string(value);
    }
  }

  /// ### OPTIONAL VALUE PREAMBLE
  ///
  /// Writes the tag byte (and spilled tag size for tags of 30 and above)
  /// announcing an optional value of the given format. The caller writes the
  /// value itself afterwards. Callers must emit optionals in ascending tag
  /// order.
  pub fn write_optional(&mut self, tag: i32, format: OptionalFormat) {
    let format_bits: u8 = format.into();
    if tag < 30 {
      self.write_u8(format_bits | ((tag as u8) << 3));
    } else {
      self.write_u8(format_bits | 0xF0);
      self.write_size(tag as usize);
    }
  }

  /// Terminates the optional members of an exception or class slice.
  pub fn write_optional_end_marker(&mut self) {
    self.write_u8(OPTIONAL_END_MARKER);
  }

  /// ### START ENCAPSULATION
  ///
  /// Opens an encapsulation: a 4-byte self-inclusive size (patched by
  /// [End Encapsulation]) followed by the encoding version.
  ///
  /// [End Encapsulation]: OutputStream::end_encaps
  pub fn start_encaps(&mut self) {
    self.encaps.push(self.buf.len());
    self.write_i32(0);
    self.write_u8(ENCODING_1_1.major);
    self.write_u8(ENCODING_1_1.minor);
  }

  /// ### END ENCAPSULATION
  ///
  /// Closes the innermost encapsulation, patching its size field.
  pub fn end_encaps(&mut self) {
    let start: usize = self.encaps.pop().expect("end_encaps without start_encaps");
    let size: i32 = (self.buf.len() - start) as i32;
    self.rewrite_i32(start, size);
  }

  /// An empty encapsulation, used by parameterless requests and replies.
  pub fn write_empty_encaps(&mut self) {
    self.write_i32(6);
    self.write_u8(ENCODING_1_1.major);
    self.write_u8(ENCODING_1_1.minor);
  }

  /// ### START SLICE
  ///
  /// Opens one slice of a user exception or class value: a flags byte, the
  /// type id string, and a self-inclusive slice size patched by
  /// [End Slice]. The size is what lets receivers skip slices whose type
  /// they do not know.
  ///
  /// [End Slice]: OutputStream::end_slice
  pub fn start_slice(&mut self, type_id: &str, last: bool) {
    let mut flags: u8 = FLAG_HAS_TYPE_ID_STRING | FLAG_HAS_SLICE_SIZE;
    if last {
      flags |= FLAG_IS_LAST_SLICE;
    }
    self.write_u8(flags);
    self.write_string(type_id);
    self.slices.push(self.buf.len());
    self.write_i32(0);
  }

  /// ### END SLICE
  ///
  /// Closes the innermost slice, patching its size field.
  pub fn end_slice(&mut self) {
    let start: usize = self.slices.pop().expect("end_slice without start_slice");
    let size: i32 = (self.buf.len() - start) as i32;
    self.rewrite_i32(start, size);
  }

  /// A single-slice user exception: type id plus its members.
  pub fn write_exception(&mut self, type_id: &str, write_members: impl FnOnce(&mut Self)) {
    self.start_slice(type_id, true);
    write_members(self);
    self.end_slice();
  }

  /// A single class value with no graph sharing: the instance marker
  /// followed by one or more slices written by the caller.
  pub fn write_value(&mut self, type_id: &str, write_members: impl FnOnce(&mut Self)) {
    self.write_size(1);
    self.start_slice(type_id, true);
    write_members(self);
    self.end_slice();
  }

  /// ### REWRITE
  ///
  /// Overwrites 4 bytes at `position` with a little-endian value. Used to
  /// patch sizes and request ids into already-written headers.
  pub fn rewrite_i32(&mut self, position: usize, value: i32) {
    self.buf[position..position + 4].copy_from_slice(&value.to_le_bytes());
  }

  /// Overwrites a single byte at `position`.
  pub fn rewrite_u8(&mut self, position: usize, value: u8) {
    self.buf[position] = value;
  }
}

/// ## INPUT STREAM
///
/// A bounds-checked little-endian unmarshaling cursor over received bytes.
/// While an encapsulation is open, reads are limited to its declared extent.
#[derive(Debug)]
pub struct InputStream {
  buf: Vec<u8>,
  pos: usize,
  encaps: Vec<(usize, usize)>,
}

impl InputStream {
  /// Creates a stream over the given bytes, positioned at the start.
  pub fn new(buf: Vec<u8>) -> Self {
    InputStream {
      buf,
      pos: 0,
      encaps: Vec::new(),
    }
  }

  /// Current read position.
  pub fn pos(&self) -> usize {
    self.pos
  }

  /// Moves the read position. Positions past the end fail on the next read.
  pub fn set_pos(&mut self, pos: usize) {
    self.pos = pos;
  }

  /// Total number of bytes in the stream.
  pub fn len(&self) -> usize {
    self.buf.len()
  }

  pub fn is_empty(&self) -> bool {
    self.buf.is_empty()
  }

  /// The readable extent: the innermost encapsulation's end, or the buffer
  /// end when no encapsulation is open.
  fn limit(&self) -> usize {
    match self.encaps.last() {
      Some(&(_, end)) => end,
      None => self.buf.len(),
    }
  }

  /// Bytes left before the current limit.
  pub fn remaining(&self) -> usize {
    self.limit().saturating_sub(self.pos)
  }

  fn take(&mut self, count: usize) -> Result<&[u8], EncodingError> {
    if self.pos + count > self.limit() {
      return Err(EncodingError::EndOfBuffer { position: self.pos });
    }
    let bytes: &[u8] = &self.buf[self.pos..self.pos + count];
    self.pos += count;
    Ok(bytes)
  }

  /// Reads `count` raw bytes verbatim.
  pub fn read_blob(&mut self, count: usize) -> Result<Vec<u8>, EncodingError> {
    Ok(self.take(count)?.to_vec())
  }

  /// Skips `count` bytes.
  pub fn skip(&mut self, count: usize) -> Result<(), EncodingError> {
    self.take(count)?;
    Ok(())
  }

  pub fn read_u8(&mut self) -> Result<u8, EncodingError> {
    Ok(self.take(1)?[0])
  }

  pub fn read_bool(&mut self) -> Result<bool, EncodingError> {
    Ok(self.read_u8()? != 0)
  }

  pub fn read_i16(&mut self) -> Result<i16, EncodingError> {
    let bytes: [u8; 2] = self.take(2)?.try_into().unwrap();
    Ok(i16::from_le_bytes(bytes))
  }

  pub fn read_i32(&mut self) -> Result<i32, EncodingError> {
    let bytes: [u8; 4] = self.take(4)?.try_into().unwrap();
    Ok(i32::from_le_bytes(bytes))
  }

  pub fn read_i64(&mut self) -> Result<i64, EncodingError> {
    let bytes: [u8; 8] = self.take(8)?.try_into().unwrap();
    Ok(i64::from_le_bytes(bytes))
  }

  pub fn read_f32(&mut self) -> Result<f32, EncodingError> {
    let bytes: [u8; 4] = self.take(4)?.try_into().unwrap();
    Ok(f32::from_le_bytes(bytes))
  }

  pub fn read_f64(&mut self) -> Result<f64, EncodingError> {
    let bytes: [u8; 8] = self.take(8)?.try_into().unwrap();
    Ok(f64::from_le_bytes(bytes))
  }

  /// ### COMPACT SIZE
  ///
  /// Counterpart of [Write Size]. Rejects negative spilled sizes and sizes
  /// that exceed the bytes actually available, which bounds adversarial
  /// allocations.
  ///
  /// [Write Size]: OutputStream::write_size
  pub fn read_size(&mut self) -> Result<usize, EncodingError> {
    let first: u8 = self.read_u8()?;
    if first < 255 {
      return Ok(first as usize);
    }
    let size: i32 = self.read_i32()?;
    if size < 0 {
      return Err(EncodingError::IllegalSize { size: size as i64 });
    }
    Ok(size as usize)
  }

  pub fn read_string(&mut self) -> Result<String, EncodingError> {
    let size: usize = self.read_size()?;
    let position: usize = self.pos;
    let bytes: &[u8] = self.take(size)?;
    match std::str::from_utf8(bytes) {
      Ok(s) => Ok(s.to_owned()),
      Err(_) => Err(EncodingError::InvalidString { position }),
    }
  }

  pub fn read_enum(&mut self) -> Result<i32, EncodingError> {
    Ok(self.read_size()? as i32)
  }

  /// A sequence: element count, then each element through `read_element`.
  /// The count is validated against the bytes remaining.
  pub fn read_seq<T>(
    &mut self,
    mut read_element: impl FnMut(&mut Self) -> Result<T, EncodingError>,
  ) -> Result<Vec<T>, EncodingError> {
    let count: usize = self.read_size()?;
    if count > self.remaining() {
      return Err(EncodingError::IllegalSize { size: count as i64 });
    }
    let mut items: Vec<T> = Vec::with_capacity(count);
    for _ in 0..count {
      items.push(read_element(self)?);
    }
    Ok(items)
  }

  /// A string-to-string dictionary.
  pub fn read_string_dict(&mut self) -> Result<HashMap<String, String>, EncodingError> {
    let count: usize = self.read_size()?;
    if count > self.remaining() {
      return Err(EncodingError::IllegalSize { size: count as i64 });
    }
    let mut entries: HashMap<String, String> = HashMap::with_capacity(count);
    for _ in 0..count {
      let key: String = self.read_string()?;
      let value: String = self.read_string()?;
      entries.insert(key, value);
    }
    Ok(entries)
  }

  /// ### OPTIONAL VALUE LOOKUP
  ///
  /// Scans forward for an optional value with the given tag, skipping
  /// lower-tagged optionals it does not recognize. Returns `true` with the
  /// stream positioned on the value when found; returns `false` with the
  /// position unchanged relative to higher-tagged or absent optionals.
  pub fn read_optional(
    &mut self,
    tag: i32,
    expected: OptionalFormat,
  ) -> Result<bool, EncodingError> {
    loop {
      if self.remaining() == 0 {
        return Ok(false);
      }
      let saved: usize = self.pos;
      let byte: u8 = self.read_u8()?;
      if byte == OPTIONAL_END_MARKER {
        self.pos = saved;
        return Ok(false);
      }
      let format: OptionalFormat = OptionalFormat::try_from(byte & 0x07)
        .map_err(|_| EncodingError::OptionalFormatMismatch { tag, format: byte & 0x07 })?;
      let mut found: i32 = (byte >> 3) as i32;
      if found == 30 {
        found = self.read_size()? as i32;
      }
      if found > tag {
        self.pos = saved;
        return Ok(false);
      }
      if found < tag {
        self.skip_optional(format)?;
        continue;
      }
      if format != expected {
        return Err(EncodingError::OptionalFormatMismatch { tag, format: byte & 0x07 });
      }
      return Ok(true);
    }
  }

  /// Skips one optional value of the given format.
  pub fn skip_optional(&mut self, format: OptionalFormat) -> Result<(), EncodingError> {
    match format {
      OptionalFormat::F1 => self.skip(1),
      OptionalFormat::F2 => self.skip(2),
      OptionalFormat::F4 => self.skip(4),
      OptionalFormat::F8 => self.skip(8),
      OptionalFormat::Size => {
        self.read_size()?;
        Ok(())
      }
      OptionalFormat::VSize => {
        let size: usize = self.read_size()?;
        self.skip(size)
      }
      OptionalFormat::FSize => {
        let size: i32 = self.read_i32()?;
        if size < 0 {
          return Err(EncodingError::IllegalSize { size: size as i64 });
        }
        self.skip(size as usize)
      }
      OptionalFormat::Class => Err(EncodingError::UnknownSlice {
        type_id: String::from("::(class optional)"),
      }),
    }
  }

  /// ### START ENCAPSULATION
  ///
  /// Reads the size and encoding version of an encapsulation, validates
  /// both, and restricts subsequent reads to the declared extent.
  pub fn start_encaps(&mut self) -> Result<EncodingVersion, EncodingError> {
    let start: usize = self.pos;
    let size: i32 = self.read_i32()?;
    if size < 6 {
      return Err(EncodingError::IllegalSize { size: size as i64 });
    }
    let end: usize = start + size as usize;
    if end > self.limit() {
      return Err(EncodingError::EncapsulationOverrun {
        size: size as usize,
        available: self.limit() - start,
      });
    }
    let encoding = EncodingVersion {
      major: self.read_u8()?,
      minor: self.read_u8()?,
    };
    if encoding != ENCODING_1_0 && encoding != ENCODING_1_1 {
      return Err(EncodingError::UnsupportedEncoding {
        major: encoding.major,
        minor: encoding.minor,
      });
    }
    self.encaps.push((start, end));
    Ok(encoding)
  }

  /// ### END ENCAPSULATION
  ///
  /// Closes the innermost encapsulation, skipping any unread trailing data
  /// (such as optionals added by a newer peer).
  pub fn end_encaps(&mut self) -> Result<(), EncodingError> {
    let (_, end): (usize, usize) = self
      .encaps
      .pop()
      .expect("end_encaps without start_encaps");
    if self.pos > end {
      return Err(EncodingError::EndOfBuffer { position: self.pos });
    }
    self.pos = end;
    Ok(())
  }

  /// Skips a whole encapsulation without looking inside.
  pub fn skip_encaps(&mut self) -> Result<(), EncodingError> {
    self.start_encaps()?;
    self.end_encaps()
  }

  /// ### READ SLICE HEADER
  ///
  /// Decodes the preamble of the next exception or value slice.
  pub fn read_slice_header(&mut self) -> Result<SliceHeader, EncodingError> {
    let flags: u8 = self.read_u8()?;
    let type_id: Option<String> = if flags & FLAG_HAS_TYPE_ID_STRING != 0 {
      Some(self.read_string()?)
    } else {
      None
    };
    let end: Option<usize> = if flags & FLAG_HAS_SLICE_SIZE != 0 {
      let start: usize = self.pos;
      let size: i32 = self.read_i32()?;
      if size < 4 {
        return Err(EncodingError::IllegalSize { size: size as i64 });
      }
      let end: usize = start + size as usize;
      if end > self.limit() {
        return Err(EncodingError::EndOfBuffer { position: end });
      }
      Some(end)
    } else {
      None
    };
    Ok(SliceHeader {
      type_id,
      end,
      last: flags & FLAG_IS_LAST_SLICE != 0,
    })
  }

  /// Skips the body of a slice whose type is not recognized. Fails when the
  /// slice carried no size, since its extent is then unknowable.
  pub fn skip_slice(&mut self, header: &SliceHeader) -> Result<(), EncodingError> {
    match header.end {
      Some(end) => {
        self.pos = end;
        Ok(())
      }
      None => Err(EncodingError::UnknownSlice {
        type_id: header.type_id.clone().unwrap_or_default(),
      }),
    }
  }

  /// Reads the single-instance marker preceding a class value written by
  /// [Write Value].
  ///
  /// [Write Value]: OutputStream::write_value
  pub fn read_value_marker(&mut self) -> Result<(), EncodingError> {
    let marker: usize = self.read_size()?;
    if marker != 1 {
      return Err(EncodingError::UnsupportedValueReference { marker: marker as i64 });
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_scalar_round_trip() {
    let mut os = OutputStream::new();
    os.write_u8(0xAB);
    os.write_bool(true);
    os.write_i16(-2);
    os.write_i32(0x01020304);
    os.write_i64(-1);
    os.write_f32(1.5);
    os.write_f64(-0.25);

    let mut is = InputStream::new(os.into_bytes());
    assert_eq!(is.read_u8().unwrap(), 0xAB);
    assert!(is.read_bool().unwrap());
    assert_eq!(is.read_i16().unwrap(), -2);
    assert_eq!(is.read_i32().unwrap(), 0x01020304);
    assert_eq!(is.read_i64().unwrap(), -1);
    assert_eq!(is.read_f32().unwrap(), 1.5);
    assert_eq!(is.read_f64().unwrap(), -0.25);
    assert_eq!(is.remaining(), 0);
  }

  #[test]
  fn test_little_endian_layout() {
    let mut os = OutputStream::new();
    os.write_i32(14);
    assert_eq!(os.as_slice(), &[14, 0, 0, 0]);
  }

  #[test]
  fn test_size_boundary() {
    let mut os = OutputStream::new();
    os.write_size(254);
    os.write_size(255);
    assert_eq!(os.as_slice()[0], 254);
    assert_eq!(os.as_slice()[1], 0xFF);

    let mut is = InputStream::new(os.into_bytes());
    assert_eq!(is.read_size().unwrap(), 254);
    assert_eq!(is.read_size().unwrap(), 255);
  }

  #[test]
  fn test_string_round_trip() {
    let mut os = OutputStream::new();
    os.write_string("héllo");
    let mut is = InputStream::new(os.into_bytes());
    assert_eq!(is.read_string().unwrap(), "héllo");
  }

  #[test]
  fn test_string_rejects_bad_utf8() {
    let mut is = InputStream::new(vec![2, 0xC3, 0x28]);
    assert_eq!(
      is.read_string(),
      Err(EncodingError::InvalidString { position: 1 })
    );
  }

  #[test]
  fn test_seq_round_trip() {
    let values: Vec<i32> = vec![1, -1, 7];
    let mut os = OutputStream::new();
    os.write_seq(&values, |os, v| os.write_i32(*v));
    let mut is = InputStream::new(os.into_bytes());
    let decoded: Vec<i32> = is.read_seq(|is| is.read_i32()).unwrap();
    assert_eq!(decoded, values);
  }

  #[test]
  fn test_seq_rejects_oversized_count() {
    // Declares 200 elements but provides none.
    let mut is = InputStream::new(vec![200]);
    assert!(is.read_seq(|is| is.read_i32()).is_err());
  }

  #[test]
  fn test_string_dict_round_trip() {
    let mut entries: HashMap<String, String> = HashMap::new();
    entries.insert("locale".into(), "en".into());
    entries.insert("retry".into(), "0".into());
    let mut os = OutputStream::new();
    os.write_string_dict(&entries);
    let mut is = InputStream::new(os.into_bytes());
    assert_eq!(is.read_string_dict().unwrap(), entries);
  }

  #[test]
  fn test_encaps_round_trip() {
    let mut os = OutputStream::new();
    os.start_encaps();
    os.write_string("payload");
    os.end_encaps();

    let mut is = InputStream::new(os.into_bytes());
    let encoding: EncodingVersion = is.start_encaps().unwrap();
    assert_eq!(encoding, ENCODING_1_1);
    assert_eq!(is.read_string().unwrap(), "payload");
    is.end_encaps().unwrap();
    assert_eq!(is.remaining(), 0);
  }

  #[test]
  fn test_encaps_skips_unread_tail() {
    // A newer peer appended data this reader does not consume.
    let mut os = OutputStream::new();
    os.start_encaps();
    os.write_i32(42);
    os.write_i32(99);
    os.end_encaps();
    os.write_u8(7);

    let mut is = InputStream::new(os.into_bytes());
    is.start_encaps().unwrap();
    assert_eq!(is.read_i32().unwrap(), 42);
    is.end_encaps().unwrap();
    assert_eq!(is.read_u8().unwrap(), 7);
  }

  #[test]
  fn test_encaps_rejects_overrun() {
    // Declared size runs past the actual buffer.
    let mut is = InputStream::new(vec![100, 0, 0, 0, 1, 1]);
    assert!(matches!(
      is.start_encaps(),
      Err(EncodingError::EncapsulationOverrun { .. })
    ));
  }

  #[test]
  fn test_empty_encaps() {
    let mut os = OutputStream::new();
    os.write_empty_encaps();
    let mut is = InputStream::new(os.into_bytes());
    is.skip_encaps().unwrap();
    assert_eq!(is.remaining(), 0);
  }

  #[test]
  fn test_optional_present_and_absent() {
    let mut os = OutputStream::new();
    os.write_optional(1, OptionalFormat::F4);
    os.write_i32(17);
    os.write_optional(5, OptionalFormat::VSize);
    os.write_size(2);
    os.write_blob(&[9, 9]);

    let mut is = InputStream::new(os.into_bytes());
    // Tag 1 present.
    assert!(is.read_optional(1, OptionalFormat::F4).unwrap());
    assert_eq!(is.read_i32().unwrap(), 17);
    // Tag 3 absent; position held for tag 5.
    assert!(!is.read_optional(3, OptionalFormat::F1).unwrap());
    assert!(is.read_optional(5, OptionalFormat::VSize).unwrap());
    assert_eq!(is.read_size().unwrap(), 2);
  }

  #[test]
  fn test_optional_skips_unknown_lower_tags() {
    let mut os = OutputStream::new();
    os.write_optional(2, OptionalFormat::F8);
    os.write_i64(-5);
    os.write_optional(4, OptionalFormat::F1);
    os.write_u8(3);

    let mut is = InputStream::new(os.into_bytes());
    // Reader only knows tag 4; tag 2 is skipped by format.
    assert!(is.read_optional(4, OptionalFormat::F1).unwrap());
    assert_eq!(is.read_u8().unwrap(), 3);
  }

  #[test]
  fn test_optional_high_tag_spills() {
    let mut os = OutputStream::new();
    os.write_optional(200, OptionalFormat::F2);
    os.write_i16(11);
    let mut is = InputStream::new(os.into_bytes());
    assert!(is.read_optional(200, OptionalFormat::F2).unwrap());
    assert_eq!(is.read_i16().unwrap(), 11);
  }

  #[test]
  fn test_optional_format_mismatch() {
    let mut os = OutputStream::new();
    os.write_optional(1, OptionalFormat::F4);
    os.write_i32(0);
    let mut is = InputStream::new(os.into_bytes());
    assert!(matches!(
      is.read_optional(1, OptionalFormat::F8),
      Err(EncodingError::OptionalFormatMismatch { .. })
    ));
  }

  #[test]
  fn test_exception_slice_round_trip() {
    let mut os = OutputStream::new();
    os.write_exception("::calc::DivideByZero", |os| {
      os.write_string("denominator was zero");
      os.write_i32(0);
    });

    let mut is = InputStream::new(os.into_bytes());
    let header: SliceHeader = is.read_slice_header().unwrap();
    assert_eq!(header.type_id.as_deref(), Some("::calc::DivideByZero"));
    assert!(header.last);
    assert_eq!(is.read_string().unwrap(), "denominator was zero");
    assert_eq!(is.read_i32().unwrap(), 0);
  }

  #[test]
  fn test_unknown_slice_is_skippable() {
    // A derived exception the reader does not know, followed by a byte the
    // reader does care about.
    let mut os = OutputStream::new();
    os.start_slice("::calc::Derived", false);
    os.write_i64(123);
    os.end_slice();
    os.write_u8(0x55);

    let mut is = InputStream::new(os.into_bytes());
    let header: SliceHeader = is.read_slice_header().unwrap();
    assert!(!header.last);
    is.skip_slice(&header).unwrap();
    assert_eq!(is.read_u8().unwrap(), 0x55);
  }

  #[test]
  fn test_value_round_trip() {
    let mut os = OutputStream::new();
    os.write_value("::shapes::Point", |os| {
      os.write_f64(1.0);
      os.write_f64(2.0);
    });

    let mut is = InputStream::new(os.into_bytes());
    is.read_value_marker().unwrap();
    let header: SliceHeader = is.read_slice_header().unwrap();
    assert_eq!(header.type_id.as_deref(), Some("::shapes::Point"));
    assert_eq!(is.read_f64().unwrap(), 1.0);
    assert_eq!(is.read_f64().unwrap(), 2.0);
  }

  #[test]
  fn test_rewrite_patches_in_place() {
    let mut os = OutputStream::new();
    os.write_i32(0);
    os.write_u8(9);
    os.rewrite_i32(0, 77);
    let mut is = InputStream::new(os.into_bytes());
    assert_eq!(is.read_i32().unwrap(), 77);
    assert_eq!(is.read_u8().unwrap(), 9);
  }
}
