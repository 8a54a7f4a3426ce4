// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Frame header codec.
//!
//! Layout (big-endian, packed):
//!
//! ```text
//! | len: u16 | bitfield: u16 | timestamp: u16 | timestamp_reply: u16 |
//! | flow_id: u32 | tun_seq: u64 | data_seq: u64 | payload ... |
//! ```
//!
//! The bitfield packs `version:4 | type:6 | reorder:1 | sent_loss:5`, most
//! significant first. `len` covers the payload including the authentication
//! tag when the payload is sealed.

use crate::{
    crypto::{self, Key, TAG_LEN},
    packet::{PacketKind, HEADER_LEN, MAX_PAYLOAD, PROTOCOL_VERSION},
};
use s2n_codec::{
    decoder_invariant, decoder_value, DecoderBuffer, DecoderError, Encoder, EncoderBuffer,
    EncoderValue,
};

/// Sentinel for "no timestamp"
pub const TIMESTAMP_NONE: u16 = u16::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// Payload length, including the tag when sealed
    pub len: u16,
    pub kind: PacketKind,
    pub reorder: bool,
    /// Loss observed on this tunnel, packed into 5 bits
    pub sent_loss: u8,
    pub timestamp: u16,
    pub timestamp_reply: u16,
    pub flow_id: u32,
    pub tun_seq: u64,
    pub stream_seq: u64,
}

impl Header {
    #[inline]
    fn bits(&self) -> u16 {
        debug_assert!(self.sent_loss < 32);
        ((PROTOCOL_VERSION as u16) << 12)
            | ((self.kind as u16) << 6)
            | ((self.reorder as u16) << 5)
            | (self.sent_loss as u16 & 0x1f)
    }
}

impl EncoderValue for Header {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.len);
        encoder.encode(&self.bits());
        encoder.encode(&self.timestamp);
        encoder.encode(&self.timestamp_reply);
        encoder.encode(&self.flow_id);
        encoder.encode(&self.tun_seq);
        encoder.encode(&self.stream_seq);
    }
}

decoder_value!(
    impl<'a> Header {
        fn decode(buffer: Buffer) -> Result<Self> {
            let (len, buffer) = buffer.decode::<u16>()?;
            let (bits, buffer) = buffer.decode::<u16>()?;

            let version = (bits >> 12) as u8;
            decoder_invariant!(
                version == PROTOCOL_VERSION,
                "unsupported protocol version"
            );
            let kind = PacketKind::from_wire(((bits >> 6) & 0x3f) as u8)
                .ok_or(DecoderError::InvariantViolation("unknown packet type"))?;
            let reorder = bits & (1 << 5) != 0;
            let sent_loss = (bits & 0x1f) as u8;

            let (timestamp, buffer) = buffer.decode()?;
            let (timestamp_reply, buffer) = buffer.decode()?;
            let (flow_id, buffer) = buffer.decode()?;
            let (tun_seq, buffer) = buffer.decode()?;
            let (stream_seq, buffer) = buffer.decode()?;

            let header = Self {
                len,
                kind,
                reorder,
                sent_loss,
                timestamp,
                timestamp_reply,
                flow_id,
                tun_seq,
                stream_seq,
            };
            Ok((header, buffer))
        }
    }
);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Decoder(DecoderError),
    #[error(transparent)]
    Crypto(#[from] crypto::Error),
}

impl From<DecoderError> for Error {
    fn from(error: DecoderError) -> Self {
        Self::Decoder(error)
    }
}

/// Returns true when the payload of `kind` goes on the wire unsealed
#[inline]
fn is_cleartext(kind: PacketKind, cleartext_data: bool) -> bool {
    cleartext_data && kind.is_data()
}

/// Encodes a frame into `out`, sealing the payload unless `cleartext_data`
/// applies. Returns the wire length.
///
/// `header.len` is computed here; all other header fields are taken as-is.
pub fn encode_frame(
    header: &mut Header,
    payload: &[u8],
    key: &Key,
    cleartext_data: bool,
    out: &mut [u8],
) -> Result<usize, Error> {
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    let sealed = !is_cleartext(header.kind, cleartext_data);

    let body_len = payload.len() + if sealed { TAG_LEN } else { 0 };
    header.len = body_len as u16;
    let total = HEADER_LEN + body_len;
    debug_assert!(out.len() >= total);

    let mut encoder = EncoderBuffer::new(out);
    encoder.encode(&*header);
    encoder.write_slice(payload);
    debug_assert_eq!(encoder.len(), HEADER_LEN + payload.len());

    if sealed {
        let (aad, body) = out.split_at_mut(HEADER_LEN);
        key.seal(header.tun_seq, header.flow_id, aad, &mut body[..body_len])?;
    }

    Ok(total)
}

/// Decodes a frame in place, returning the header and the plaintext payload.
///
/// Rejects truncated buffers, a zero or oversized `len`, unknown versions
/// and kinds, and frames that fail authentication.
pub fn decode_frame<'a>(
    datagram: &'a mut [u8],
    key: &Key,
    cleartext_data: bool,
) -> Result<(Header, &'a [u8]), Error> {
    let header = {
        let (header, remaining) = DecoderBuffer::new(datagram).decode::<Header>()?;
        decoder_invariant!(header.len != 0, "empty frame");
        decoder_invariant!(
            header.len as usize <= MAX_PAYLOAD + TAG_LEN,
            "oversized frame"
        );
        decoder_invariant!(
            header.len as usize == remaining.len(),
            "frame length mismatch"
        );
        header
    };

    let (aad, body) = datagram.split_at_mut(HEADER_LEN);
    let body = &mut body[..header.len as usize];

    if is_cleartext(header.kind, cleartext_data) {
        Ok((header, body))
    } else {
        decoder_invariant!(body.len() >= TAG_LEN, "truncated authentication tag");
        let len = key.open(header.tun_seq, header.flow_id, aad, body)?;
        Ok((header, &body[..len]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::MAX_WIRE_LEN;

    fn key() -> Key {
        Key::new(b"test secret")
    }

    fn header(kind: PacketKind) -> Header {
        Header {
            len: 0,
            kind,
            reorder: kind.is_data(),
            sent_loss: 3,
            timestamp: 1234,
            timestamp_reply: TIMESTAMP_NONE,
            flow_id: 0xfeed_f00d,
            tun_seq: 42,
            stream_seq: 17,
        }
    }

    #[test]
    fn sealed_round_trip() {
        let key = key();
        let payload = b"\x45\x00\x00\x28payload bytes";
        let mut out = [0u8; MAX_WIRE_LEN];
        let mut hdr = header(PacketKind::Data);

        let len = encode_frame(&mut hdr, payload, &key, false, &mut out).unwrap();
        assert_eq!(len, HEADER_LEN + payload.len() + TAG_LEN);
        assert_eq!(hdr.len as usize, payload.len() + TAG_LEN);

        let (decoded, plaintext) = decode_frame(&mut out[..len], &key, false).unwrap();
        assert_eq!(decoded, hdr);
        assert_eq!(plaintext, payload);
    }

    #[test]
    fn cleartext_data_round_trip() {
        let key = key();
        let payload = b"udp burst";
        let mut out = [0u8; MAX_WIRE_LEN];
        let mut hdr = header(PacketKind::Data);

        let len = encode_frame(&mut hdr, payload, &key, true, &mut out).unwrap();
        assert_eq!(len, HEADER_LEN + payload.len());
        // payload is on the wire verbatim
        assert_eq!(&out[HEADER_LEN..len], payload);

        let (decoded, plaintext) = decode_frame(&mut out[..len], &key, true).unwrap();
        assert_eq!(decoded.kind, PacketKind::Data);
        assert_eq!(plaintext, payload);
    }

    #[test]
    fn control_frames_are_sealed_despite_cleartext() {
        let key = key();
        let mut out = [0u8; MAX_WIRE_LEN];
        let mut hdr = header(PacketKind::Keepalive);
        hdr.reorder = false;

        let len = encode_frame(&mut hdr, b"1024\0", &key, true, &mut out).unwrap();
        assert_eq!(len, HEADER_LEN + 5 + TAG_LEN);
        assert_ne!(&out[HEADER_LEN..HEADER_LEN + 5], b"1024\0");

        let (_, plaintext) = decode_frame(&mut out[..len], &key, true).unwrap();
        assert_eq!(plaintext, b"1024\0");
    }

    #[test]
    fn bit_flips_are_rejected() {
        let key = key();
        let payload = [7u8; 64];
        let mut out = [0u8; MAX_WIRE_LEN];
        let mut hdr = header(PacketKind::Data);
        let len = encode_frame(&mut hdr, &payload, &key, false, &mut out).unwrap();

        for bit in 0..(len * 8) {
            let mut corrupt = out;
            corrupt[bit / 8] ^= 1 << (bit % 8);
            assert!(
                decode_frame(&mut corrupt[..len], &key, false).is_err(),
                "bit {bit} accepted"
            );
        }
    }

    #[test]
    fn structural_rejects() {
        let key = key();
        let mut out = [0u8; MAX_WIRE_LEN];
        let mut hdr = header(PacketKind::Data);
        let len = encode_frame(&mut hdr, b"x", &key, false, &mut out).unwrap();

        // truncated datagram
        assert!(decode_frame(&mut out[..len - 1].to_vec(), &key, false).is_err());
        // short header
        assert!(decode_frame(&mut out[..10].to_vec(), &key, false).is_err());

        // zero length
        let mut zero = out;
        zero[0] = 0;
        zero[1] = 0;
        assert!(decode_frame(&mut zero[..HEADER_LEN], &key, false).is_err());

        // declared length larger than the MTU allows
        let mut big = out;
        big[0] = 0xff;
        big[1] = 0xff;
        assert!(decode_frame(&mut big[..len], &key, false).is_err());

        // wrong version
        let mut bad_version = out;
        bad_version[2] ^= 0x10;
        assert!(decode_frame(&mut bad_version[..len], &key, false).is_err());

        // unknown kind survives the bitfield but not the codec
        let mut bad_kind = out;
        bad_kind[2] = (PROTOCOL_VERSION << 4) | 0x0f;
        bad_kind[3] = 0xc0;
        assert!(decode_frame(&mut bad_kind[..len], &key, false).is_err());
    }

    #[test]
    fn decode_never_panics() {
        let key = key();
        bolero::check!().for_each(|bytes: &[u8]| {
            let mut cleartext = bytes.to_vec();
            let _ = decode_frame(&mut cleartext, &key, true);
            let mut sealed = bytes.to_vec();
            let _ = decode_frame(&mut sealed, &key, false);
        });
    }
}
