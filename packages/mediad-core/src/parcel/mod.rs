//! Length-prefixed typed message buffers.
//!
//! A parcel is the unit of exchange on every control-plane socket: an 8-byte
//! header `{code: u32, len: u32}` followed by `len` body bytes. The body is a
//! stream of native-endian primitives and NUL-terminated strings. Both sides
//! of a connection live on the same SoC, so native endianness is the wire
//! format.
//!
//! [`Parcel`] owns one message; [`FrameAssembler`] reassembles parcels from
//! arbitrary chunks of a byte stream (the resumable-receive contract);
//! [`codec::ParcelCodec`] adapts the assembler to tokio-util framing.

mod codec;

pub use codec::ParcelCodec;

use std::io::{Read, Write};

use bytes::BytesMut;
use thiserror::Error;

use crate::error::{MediaError, MediaResult};

/// Size of the `{code, len}` parcel header.
pub const HEADER_LEN: usize = 8;

/// Upper bound on a single parcel body. A peer announcing more is treated
/// as corrupt and its connection is closed.
pub const MAX_BODY_LEN: usize = 256 * 1024;

/// Error raised by typed reads from a parcel body.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParcelError {
    /// Read would cross the end of the frame.
    #[error("parcel body truncated")]
    Truncated,
    /// String region is not valid UTF-8.
    #[error("parcel string is not utf-8")]
    BadString,
    /// Header announced an oversized or malformed body.
    #[error("parcel header invalid")]
    BadHeader,
}

impl From<ParcelError> for MediaError {
    fn from(err: ParcelError) -> Self {
        MediaError::InvalidArgument(err.to_string())
    }
}

/// One framed message: a code plus a typed body.
///
/// Appends grow the body; reads copy out and advance an internal cursor.
/// Reads never consume past the frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parcel {
    code: u32,
    data: Vec<u8>,
    cursor: usize,
}

macro_rules! append_read_impl {
    ($append:ident, $read:ident, $ty:ty) => {
        pub fn $append(&mut self, value: $ty) {
            self.data.extend_from_slice(&value.to_ne_bytes());
        }

        pub fn $read(&mut self) -> Result<$ty, ParcelError> {
            const SIZE: usize = std::mem::size_of::<$ty>();
            let end = self.cursor.checked_add(SIZE).ok_or(ParcelError::Truncated)?;
            if end > self.data.len() {
                return Err(ParcelError::Truncated);
            }
            let mut raw = [0u8; SIZE];
            raw.copy_from_slice(&self.data[self.cursor..end]);
            self.cursor = end;
            Ok(<$ty>::from_ne_bytes(raw))
        }
    };
}

impl Parcel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty parcel stamped with `code`.
    pub fn with_code(code: u32) -> Self {
        Self { code, ..Self::default() }
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn set_code(&mut self, code: u32) {
        self.code = code;
    }

    /// Body length in bytes.
    pub fn body_len(&self) -> usize {
        self.data.len()
    }

    /// Resets the read cursor to the start of the body.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    append_read_impl!(append_u8, read_u8, u8);
    append_read_impl!(append_u16, read_u16, u16);
    append_read_impl!(append_u32, read_u32, u32);
    append_read_impl!(append_u64, read_u64, u64);
    append_read_impl!(append_i8, read_i8, i8);
    append_read_impl!(append_i16, read_i16, i16);
    append_read_impl!(append_i32, read_i32, i32);
    append_read_impl!(append_i64, read_i64, i64);
    append_read_impl!(append_f32, read_f32, f32);
    append_read_impl!(append_f64, read_f64, f64);

    /// Appends the string bytes plus a trailing NUL.
    ///
    /// Interior NULs would desynchronize the reader and are stripped.
    pub fn append_str(&mut self, value: &str) {
        for &b in value.as_bytes() {
            if b != 0 {
                self.data.push(b);
            }
        }
        self.data.push(0);
    }

    /// Borrows the next NUL-terminated region and advances past it.
    pub fn read_str(&mut self) -> Result<&str, ParcelError> {
        let start = self.cursor;
        let nul = self.data[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(ParcelError::Truncated)?;
        let end = start + nul;
        std::str::from_utf8(&self.data[start..end]).map_err(|_| ParcelError::BadString)?;
        self.cursor = end + 1;
        Ok(std::str::from_utf8(&self.data[start..end]).expect("validated above"))
    }

    /// Like [`read_str`](Self::read_str) but returns an owned string.
    pub fn read_string(&mut self) -> Result<String, ParcelError> {
        self.read_str().map(str::to_owned)
    }

    /// Serializes header and body into `buf`.
    pub fn encode_to(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN + self.data.len());
        buf.extend_from_slice(&self.code.to_ne_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_ne_bytes());
        buf.extend_from_slice(&self.data);
    }

    /// Serializes into a standalone byte vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len());
        out.extend_from_slice(&self.code.to_ne_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_ne_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Blocking send: stamps `code` and writes header plus body, retrying
    /// interrupted short writes.
    pub fn write_to<W: Write>(&mut self, writer: &mut W, code: u32) -> MediaResult<()> {
        self.code = code;
        let bytes = self.to_bytes();
        let mut off = 0;
        while off < bytes.len() {
            match writer.write(&bytes[off..]) {
                Ok(0) => return Err(MediaError::Closed),
                Ok(n) => off += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(MediaError::Io(err)),
            }
        }
        Ok(())
    }

    /// Blocking receive of exactly one parcel.
    pub fn read_from<R: Read>(reader: &mut R) -> MediaResult<Self> {
        let mut header = [0u8; HEADER_LEN];
        read_full(reader, &mut header)?;
        let code = u32::from_ne_bytes(header[0..4].try_into().expect("size"));
        let len = u32::from_ne_bytes(header[4..8].try_into().expect("size")) as usize;
        if len > MAX_BODY_LEN {
            return Err(ParcelError::BadHeader.into());
        }
        let mut data = vec![0u8; len];
        read_full(reader, &mut data)?;
        Ok(Self { code, data, cursor: 0 })
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> MediaResult<()> {
    let mut off = 0;
    while off < buf.len() {
        match reader.read(&mut buf[off..]) {
            Ok(0) => return Err(MediaError::Closed),
            Ok(n) => off += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(MediaError::Io(err)),
        }
    }
    Ok(())
}

/// Incremental parcel reassembly from arbitrary byte chunks.
///
/// Once a complete header is buffered, `len` is authoritative: the assembler
/// waits for exactly `HEADER_LEN + len` bytes before yielding the frame and
/// never consumes past it.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: BytesMut,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk received from the stream.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pops the next completed parcel, if any.
    pub fn next_frame(&mut self) -> Result<Option<Parcel>, ParcelError> {
        Self::take_frame(&mut self.buf)
    }

    /// Shared with the tokio codec: extracts one frame from `buf`.
    pub(crate) fn take_frame(buf: &mut BytesMut) -> Result<Option<Parcel>, ParcelError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let code = u32::from_ne_bytes(buf[0..4].try_into().expect("size"));
        let len = u32::from_ne_bytes(buf[4..8].try_into().expect("size")) as usize;
        if len > MAX_BODY_LEN {
            return Err(ParcelError::BadHeader);
        }
        if buf.len() < HEADER_LEN + len {
            buf.reserve(HEADER_LEN + len - buf.len());
            return Ok(None);
        }
        let frame = buf.split_to(HEADER_LEN + len);
        Ok(Some(Parcel {
            code,
            data: frame[HEADER_LEN..].to_vec(),
            cursor: 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_read_round_trip_all_primitives() {
        let mut p = Parcel::new();
        p.append_u8(0xA5);
        p.append_u16(0xBEEF);
        p.append_u32(0xDEAD_BEEF);
        p.append_u64(u64::MAX - 7);
        p.append_i8(-42);
        p.append_i16(-1234);
        p.append_i32(-5_000_000);
        p.append_i64(i64::MIN + 1);
        p.append_f32(1.5);
        p.append_f64(-2.25);
        p.append_str("hello");
        p.append_str("");

        assert_eq!(p.read_u8().unwrap(), 0xA5);
        assert_eq!(p.read_u16().unwrap(), 0xBEEF);
        assert_eq!(p.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(p.read_u64().unwrap(), u64::MAX - 7);
        assert_eq!(p.read_i8().unwrap(), -42);
        assert_eq!(p.read_i16().unwrap(), -1234);
        assert_eq!(p.read_i32().unwrap(), -5_000_000);
        assert_eq!(p.read_i64().unwrap(), i64::MIN + 1);
        assert_eq!(p.read_f32().unwrap(), 1.5);
        assert_eq!(p.read_f64().unwrap(), -2.25);
        assert_eq!(p.read_str().unwrap(), "hello");
        assert_eq!(p.read_str().unwrap(), "");
        assert_eq!(p.read_u8(), Err(ParcelError::Truncated));
    }

    #[test]
    fn read_never_crosses_the_frame() {
        let mut p = Parcel::new();
        p.append_i32(7);
        assert_eq!(p.read_i32().unwrap(), 7);
        assert_eq!(p.read_i32(), Err(ParcelError::Truncated));
        assert_eq!(p.read_str(), Err(ParcelError::Truncated));
    }

    #[test]
    fn interior_nul_is_stripped_from_strings() {
        let mut p = Parcel::new();
        p.append_str("a\0b");
        assert_eq!(p.read_str().unwrap(), "ab");
    }

    #[test]
    fn chunked_assembly_matches_single_shot() {
        let mut original = Parcel::with_code(PARCEL_SEND_ACK_TEST);
        original.append_i32(6);
        original.append_str("Music");
        original.append_str("request");
        original.append_i32(0);
        let bytes = original.to_bytes();

        // Single shot.
        let mut whole = FrameAssembler::new();
        whole.extend(&bytes);
        let single = whole.next_frame().unwrap().unwrap();

        // Byte-at-a-time.
        let mut dribble = FrameAssembler::new();
        let mut last = None;
        for &b in &bytes {
            assert!(last.is_none(), "frame completed early");
            dribble.extend(&[b]);
            last = dribble.next_frame().unwrap();
        }
        let mut chunked = last.expect("frame after final byte");

        assert_eq!(single.code(), chunked.code());
        let mut single = single;
        assert_eq!(single.read_i32().unwrap(), chunked.read_i32().unwrap());
        assert_eq!(single.read_string().unwrap(), chunked.read_string().unwrap());
        assert_eq!(single.read_string().unwrap(), chunked.read_string().unwrap());
        assert_eq!(single.read_i32().unwrap(), chunked.read_i32().unwrap());
    }

    #[test]
    fn assembler_keeps_following_frame_intact() {
        let mut a = Parcel::with_code(1);
        a.append_str("one");
        let mut b = Parcel::with_code(2);
        b.append_str("two");

        let mut assembler = FrameAssembler::new();
        let mut bytes = a.to_bytes();
        bytes.extend_from_slice(&b.to_bytes());
        assembler.extend(&bytes);

        let mut first = assembler.next_frame().unwrap().unwrap();
        assert_eq!(first.code(), 1);
        assert_eq!(first.read_str().unwrap(), "one");
        let mut second = assembler.next_frame().unwrap().unwrap();
        assert_eq!(second.code(), 2);
        assert_eq!(second.read_str().unwrap(), "two");
        assert!(assembler.next_frame().unwrap().is_none());
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_ne_bytes());
        bytes.extend_from_slice(&((MAX_BODY_LEN as u32) + 1).to_ne_bytes());
        let mut assembler = FrameAssembler::new();
        assembler.extend(&bytes);
        assert_eq!(assembler.next_frame(), Err(ParcelError::BadHeader));
    }

    #[test]
    fn blocking_write_read_round_trip() {
        let mut p = Parcel::new();
        p.append_i32(99);
        p.append_str("ping");
        let mut wire = Vec::new();
        p.write_to(&mut wire, 2).unwrap();

        let mut cursor = std::io::Cursor::new(wire);
        let mut back = Parcel::read_from(&mut cursor).unwrap();
        assert_eq!(back.code(), 2);
        assert_eq!(back.read_i32().unwrap(), 99);
        assert_eq!(back.read_str().unwrap(), "ping");
    }

    #[test]
    fn blocking_read_reports_eof_as_closed() {
        let mut empty = std::io::Cursor::new(Vec::<u8>::new());
        assert!(matches!(Parcel::read_from(&mut empty), Err(MediaError::Closed)));
    }

    const PARCEL_SEND_ACK_TEST: u32 = 2;
}
