//! tokio-util codec adapter for parcel framing.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::{FrameAssembler, Parcel, ParcelError};

/// Frames [`Parcel`]s on an async byte stream.
///
/// Decoding is resumable by construction: tokio-util hands the codec
/// whatever bytes arrived, and a frame is produced only once
/// `HEADER_LEN + len` bytes are buffered.
#[derive(Debug, Default)]
pub struct ParcelCodec;

impl Decoder for ParcelCodec {
    type Item = Parcel;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Parcel>, Self::Error> {
        FrameAssembler::take_frame(src).map_err(into_io)
    }
}

impl Encoder<Parcel> for ParcelCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Parcel, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_to(dst);
        Ok(())
    }
}

fn into_io(err: ParcelError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err)
}
