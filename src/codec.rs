//! Directional byte-cursor codec for connection snapshots.
//!
//! This module provides the converter every profile uses to move its live
//! connection state in and out of a handover window. A snapshot describes
//! itself once, as an ordered sequence of `convert` calls; running that
//! sequence against a serializing codec writes the fields out, running it
//! against a deserializing codec reads them back in. The sequence *is* the
//! wire format.
//!
//! Windows are bounded. A [`TransferCursor`] outlives each window and records
//! how far the stream has progressed, so a snapshot larger than one window is
//! moved by calling the same sequence again over the next window: bytes the
//! previous windows already carried are skipped, bytes that fall inside the
//! current window are copied, and the first field that does not fit stops
//! the pass with [`Halt::Exhausted`]. A field split over a window boundary is
//! carried partly by each window, so the concatenation of all windows is
//! byte-identical to a single large window.

use thiserror::Error;

/// Direction a cursor moves bytes in. Fixed for the cursor's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Direction {
   Serialize,
   Deserialize,
}

/// Why a conversion pass stopped before the end of the sequence.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
   /// The current window is full (or drained); resume with the next one.
   #[error("window exhausted")]
   Exhausted,

   /// The stream can not be continued: invalid input, input ended early, or
   /// a conversion was issued after the window was exhausted.
   #[error("stream corrupt")]
   Corrupt,
}

/// Result of one conversion step.
pub type Step = Result<(), Halt>;

/// Outcome of one marshal or unmarshal call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
   /// Bytes written to (or consumed from) the window.
   pub bytes: usize,
   /// False when the stream is corrupt; the whole handover must be aborted.
   pub ok: bool,
}

impl Transfer {
   pub const fn done(bytes: usize) -> Self {
      Self { bytes, ok: true }
   }

   pub const fn failed(bytes: usize) -> Self {
      Self { bytes, ok: false }
   }
}

/// Position state that survives between windows of one transfer.
#[derive(Debug, Clone)]
pub struct TransferCursor {
   direction: Direction,
   /// Stream offset of the current window's first byte.
   origin: usize,
   /// Length of the current window.
   len: usize,
   /// Bytes moved through the current window so far.
   moved: usize,
   /// Stream offset of the next field in the running pass.
   pos: usize,
   exhausted: bool,
   status: bool,
}

impl TransferCursor {
   pub const fn new(direction: Direction) -> Self {
      Self {
         direction,
         origin: 0,
         len: 0,
         moved: 0,
         pos: 0,
         exhausted: false,
         status: true,
      }
   }

   /// Rebinds the cursor to a new window of `length` bytes.
   ///
   /// With `reset_position` the stream restarts from offset zero and a
   /// previous failure is cleared. Without it the stream continues where the
   /// previous window ended.
   pub fn reset(&mut self, length: usize, reset_position: bool) {
      if reset_position {
         self.origin = 0;
         self.status = true;
      } else {
         self.origin += self.moved;
      }
      self.len = length;
      self.moved = 0;
      self.pos = 0;
      self.exhausted = false;
   }

   pub const fn direction(&self) -> Direction {
      self.direction
   }

   /// Total bytes moved by every window so far, including the current one.
   pub const fn offset(&self) -> usize {
      self.origin + self.moved
   }

   pub const fn status(&self) -> bool {
      self.status
   }
}

enum Window<'a> {
   Out(&'a mut [u8]),
   In(&'a [u8]),
}

/// A cursor bound to one window.
pub struct Codec<'a> {
   cursor: &'a mut TransferCursor,
   window: Window<'a>,
}

impl<'a> Codec<'a> {
   /// Binds a serializing cursor to the next output window.
   pub fn serializer(cursor: &'a mut TransferCursor, window: &'a mut [u8]) -> Self {
      debug_assert_eq!(cursor.direction, Direction::Serialize);
      cursor.reset(window.len(), false);
      Self {
         cursor,
         window: Window::Out(window),
      }
   }

   /// Binds a deserializing cursor to the next input window.
   pub fn deserializer(cursor: &'a mut TransferCursor, window: &'a [u8]) -> Self {
      debug_assert_eq!(cursor.direction, Direction::Deserialize);
      cursor.reset(window.len(), false);
      Self {
         cursor,
         window: Window::In(window),
      }
   }

   pub fn is_deserializing(&self) -> bool {
      self.cursor.direction == Direction::Deserialize
   }

   /// Bytes left in the current window.
   pub fn remaining(&self) -> usize {
      self.cursor.len - self.cursor.moved
   }

   /// Bytes moved through the current window.
   pub fn written(&self) -> usize {
      self.cursor.moved
   }

   pub fn status(&self) -> bool {
      self.cursor.status
   }

   /// Converts one value in the cursor's direction.
   pub fn convert<T: Convert + ?Sized>(&mut self, value: &mut T) -> Step {
      value.convert(self)
   }

   /// Marks the stream corrupt. Used by conversions that decoded an invalid
   /// value.
   pub fn corrupt(&mut self) -> Halt {
      self.cursor.status = false;
      Halt::Corrupt
   }

   /// Moves a raw field. Every typed conversion bottoms out here.
   pub fn bytes(&mut self, field: &mut [u8]) -> Step {
      if !self.cursor.status {
         return Err(Halt::Corrupt);
      }
      if self.cursor.exhausted {
         return Err(self.corrupt());
      }

      let start = self.cursor.pos;
      let end = start + field.len();
      let win_start = self.cursor.origin;
      let win_end = win_start + self.cursor.len;
      self.cursor.pos = end;

      let lo = start.max(win_start);
      let hi = end.min(win_end);
      if lo < hi {
         let in_field = lo - start..hi - start;
         let in_window = lo - win_start..hi - win_start;
         match &mut self.window {
            Window::Out(buf) => buf[in_window].copy_from_slice(&field[in_field]),
            Window::In(buf) => field[in_field].copy_from_slice(&buf[in_window]),
         }
         self.cursor.moved += hi - lo;
      }

      if end > win_end {
         self.cursor.exhausted = true;
         // an empty input window means the stream ended while fields remain
         if self.is_deserializing() && self.cursor.len == 0 {
            return Err(self.corrupt());
         }
         return Err(Halt::Exhausted);
      }
      Ok(())
   }

   /// Summarizes a finished pass into the outcome reported to the coordinator.
   pub fn outcome(&self, step: Step) -> Transfer {
      match step {
         Ok(()) | Err(Halt::Exhausted) if self.cursor.status => Transfer::done(self.written()),
         _ => Transfer::failed(self.written()),
      }
   }
}

/// A value that can be moved through a [`Codec`].
///
/// Implementations must issue the same conversions in the same order in both
/// directions, and must write partially transferred bytes back into `self`
/// so the next window can finish the field.
pub trait Convert {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step;
}

macro_rules! convert_le {
   ($($ty:ty),*) => {
      $(
         impl Convert for $ty {
            fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
               let mut raw = self.to_le_bytes();
               let step = codec.bytes(&mut raw);
               *self = <$ty>::from_le_bytes(raw);
               step
            }
         }
      )*
   };
}

convert_le!(u8, u16, u32, u64, i8, i16, i32);

impl Convert for bool {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      let mut raw = u8::from(*self);
      codec.convert(&mut raw)?;
      match raw {
         0 => *self = false,
         1 => *self = true,
         _ => return Err(codec.corrupt()),
      }
      Ok(())
   }
}

impl<const N: usize> Convert for [u8; N] {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      codec.bytes(self)
   }
}

impl Convert for uuid::Uuid {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      let mut raw = *self.as_bytes();
      let step = codec.bytes(&mut raw);
      *self = uuid::Uuid::from_bytes(raw);
      step
   }
}

/// Optional sub-snapshot: a presence flag followed by the body when set.
/// Deserializing a set flag allocates the body.
impl<T: Convert + Default> Convert for Option<T> {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      let mut present = self.is_some();
      codec.convert(&mut present)?;
      if !present {
         *self = None;
         return Ok(());
      }
      self.get_or_insert_with(T::default).convert(codec)
   }
}

/// Bounded table: a `u8` element count followed by the elements.
impl<T: Convert + Default + Clone, const N: usize> Convert for heapless::Vec<T, N> {
   fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
      let mut count = u8::try_from(self.len()).map_err(|_| codec.corrupt())?;
      codec.convert(&mut count)?;
      if codec.is_deserializing() && self.len() != usize::from(count) {
         self
            .resize_default(usize::from(count))
            .map_err(|()| codec.corrupt())?;
      }
      for item in self.iter_mut() {
         item.convert(codec)?;
      }
      Ok(())
   }
}

/// Implements [`Convert`] for a fieldless `#[repr(u8)]` enum deriving
/// `strum::FromRepr`. Unknown discriminants mark the stream corrupt.
macro_rules! convert_repr {
   ($($ty:ty),* $(,)?) => {
      $(
         impl $crate::codec::Convert for $ty {
            fn convert(&mut self, codec: &mut $crate::codec::Codec<'_>) -> $crate::codec::Step {
               let mut raw = *self as u8;
               codec.convert(&mut raw)?;
               match <$ty>::from_repr(raw) {
                  Some(value) => {
                     *self = value;
                     Ok(())
                  },
                  None => Err(codec.corrupt()),
               }
            }
         }
      )*
   };
}

pub(crate) use convert_repr;

/// A per-peer connection snapshot with a versioned layout.
pub trait Snapshot: Convert + Default {
   /// Layout version, written as the first byte of every blob.
   const SCHEMA: u8;
}

/// Converts a snapshot preceded by its schema byte. A mismatched schema
/// fails the stream.
pub fn convert_versioned<S: Snapshot>(codec: &mut Codec<'_>, snapshot: &mut S) -> Step {
   let mut schema = S::SCHEMA;
   codec.convert(&mut schema)?;
   if schema != S::SCHEMA {
      return Err(codec.corrupt());
   }
   snapshot.convert(codec)
}

#[cfg(test)]
mod tests {
   use super::*;

   #[derive(Debug, Default, Clone, PartialEq)]
   struct Inner {
      rate: u32,
      mtu: u16,
   }

   impl Convert for Inner {
      fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
         codec.convert(&mut self.rate)?;
         codec.convert(&mut self.mtu)
      }
   }

   #[derive(Debug, Default, Clone, PartialEq)]
   struct Sample {
      id: u16,
      enabled: bool,
      tag: [u8; 3],
      inner: Option<Inner>,
      list: heapless::Vec<u32, 4>,
   }

   impl Convert for Sample {
      fn convert(&mut self, codec: &mut Codec<'_>) -> Step {
         codec.convert(&mut self.id)?;
         codec.convert(&mut self.enabled)?;
         codec.convert(&mut self.tag)?;
         codec.convert(&mut self.inner)?;
         codec.convert(&mut self.list)
      }
   }

   impl Snapshot for Sample {
      const SCHEMA: u8 = 7;
   }

   fn sample() -> Sample {
      Sample {
         id: 0x1234,
         enabled: true,
         tag: *b"abc",
         inner: Some(Inner {
            rate: 128_000,
            mtu: 672,
         }),
         list: heapless::Vec::from_slice(&[1, 0xdead_beef, 3]).unwrap(),
      }
   }

   fn encode<T: Convert>(value: &mut T, window: usize) -> Vec<u8> {
      let mut cursor = TransferCursor::new(Direction::Serialize);
      let mut out = Vec::new();
      loop {
         let mut buf = vec![0u8; window];
         let (step, n) = {
            let mut codec = Codec::serializer(&mut cursor, &mut buf);
            let step = value.convert(&mut codec);
            (step, codec.written())
         };
         out.extend_from_slice(&buf[..n]);
         match step {
            Ok(()) => return out,
            Err(Halt::Exhausted) => {},
            Err(Halt::Corrupt) => panic!("serializer corrupted"),
         }
      }
   }

   fn decode<T: Convert + Default>(bytes: &[u8], window: usize) -> Result<T, Halt> {
      let mut cursor = TransferCursor::new(Direction::Deserialize);
      let mut value = T::default();
      let mut chunks = bytes.chunks(window.max(1));
      loop {
         let chunk = chunks.next().unwrap_or(&[]);
         let mut codec = Codec::deserializer(&mut cursor, chunk);
         match value.convert(&mut codec) {
            Ok(()) => return Ok(value),
            Err(Halt::Exhausted) => {},
            Err(Halt::Corrupt) => return Err(Halt::Corrupt),
         }
      }
   }

   #[test]
   fn test_streaming_subsnapshot_layout() {
      let mut inner = Some(Inner {
         rate: 128_000,
         mtu: 672,
      });
      let bytes = encode(&mut inner, 64);
      assert_eq!(bytes, [0x01, 0x00, 0xF4, 0x01, 0x00, 0xA0, 0x02]);

      let mut absent: Option<Inner> = None;
      assert_eq!(encode(&mut absent, 64), [0x00]);
   }

   #[test]
   fn test_roundtrip_single_window() {
      let mut value = sample();
      let bytes = encode(&mut value, 256);
      let decoded: Sample = decode(&bytes, 256).unwrap();
      assert_eq!(decoded, sample());
   }

   #[test]
   fn test_chunked_output_is_identical() {
      let mut value = sample();
      let whole = encode(&mut value, 256);
      for window in 1..whole.len() + 2 {
         assert_eq!(encode(&mut value, window), whole, "window {window}");
         let decoded: Sample = decode(&whole, window).unwrap();
         assert_eq!(decoded, sample(), "window {window}");
      }
   }

   #[test]
   fn test_written_matches_remaining() {
      let mut cursor = TransferCursor::new(Direction::Serialize);
      let mut buf = [0u8; 10];
      let mut codec = Codec::serializer(&mut cursor, &mut buf);
      codec.convert(&mut 0xabcdu16).unwrap();
      codec.convert(&mut 7u8).unwrap();
      assert_eq!(codec.written(), 3);
      assert_eq!(codec.remaining(), 7);
      assert!(codec.status());
   }

   #[test]
   fn test_convert_after_exhaustion_is_rejected() {
      let mut cursor = TransferCursor::new(Direction::Serialize);
      let mut buf = [0u8; 3];
      let mut codec = Codec::serializer(&mut cursor, &mut buf);
      assert_eq!(codec.convert(&mut 1u16), Ok(()));
      assert_eq!(codec.convert(&mut 0x0302u16), Err(Halt::Exhausted));
      assert!(codec.status());
      assert_eq!(codec.convert(&mut 9u8), Err(Halt::Corrupt));
      assert!(!codec.status());
      assert_eq!(codec.written(), 3);
      drop(codec);
      assert_eq!(buf, [0x01, 0x00, 0x02]);
   }

   #[test]
   fn test_truncated_input_is_corrupt() {
      let mut value = sample();
      let bytes = encode(&mut value, 256);
      let truncated = &bytes[..bytes.len() - 2];
      assert_eq!(decode::<Sample>(truncated, 5), Err(Halt::Corrupt));
   }

   #[test]
   fn test_invalid_bool_is_corrupt() {
      let mut cursor = TransferCursor::new(Direction::Deserialize);
      let mut codec = Codec::deserializer(&mut cursor, &[2]);
      let mut flag = false;
      assert_eq!(codec.convert(&mut flag), Err(Halt::Corrupt));
      assert!(!codec.status());
      assert_eq!(codec.outcome(Err(Halt::Corrupt)), Transfer::failed(1));
   }

   #[test]
   fn test_oversized_table_is_corrupt() {
      let mut cursor = TransferCursor::new(Direction::Deserialize);
      let mut codec = Codec::deserializer(&mut cursor, &[5, 0, 0, 0, 0]);
      let mut list: heapless::Vec<u8, 4> = heapless::Vec::new();
      assert_eq!(codec.convert(&mut list), Err(Halt::Corrupt));
   }

   #[test]
   fn test_schema_mismatch_is_corrupt() {
      let mut value = sample();
      let mut bytes = {
         let mut cursor = TransferCursor::new(Direction::Serialize);
         let mut buf = vec![0u8; 64];
         let n = {
            let mut codec = Codec::serializer(&mut cursor, &mut buf);
            convert_versioned(&mut codec, &mut value).unwrap();
            codec.written()
         };
         buf.truncate(n);
         buf
      };
      assert_eq!(bytes[0], Sample::SCHEMA);
      bytes[0] = Sample::SCHEMA + 1;

      let mut cursor = TransferCursor::new(Direction::Deserialize);
      let mut codec = Codec::deserializer(&mut cursor, &bytes);
      let mut decoded = Sample::default();
      assert_eq!(convert_versioned(&mut codec, &mut decoded), Err(Halt::Corrupt));
   }

   #[test]
   fn test_reset_position_restarts_stream() {
      let mut cursor = TransferCursor::new(Direction::Serialize);
      let mut buf = [0u8; 2];
      {
         let mut codec = Codec::serializer(&mut cursor, &mut buf);
         assert_eq!(codec.convert(&mut 0x0102_0304u32), Err(Halt::Exhausted));
      }
      cursor.reset(0, false);
      assert_eq!(cursor.offset(), 2);
      cursor.reset(0, true);
      assert_eq!(cursor.offset(), 0);
      assert!(cursor.status());
   }
}
