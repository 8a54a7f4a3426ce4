// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! RESEND request payload.
//!
//! `'R' 'S' seq_start:u64 tun_id:i32 len:i32`, big-endian like the frame
//! header.

use s2n_codec::{
    decoder_invariant, decoder_value, DecoderBuffer, DecoderError, Encoder, EncoderBuffer,
    EncoderValue,
};

pub const PAYLOAD_LEN: usize = 18;

const MAGIC: &[u8; 2] = b"RS";

/// A request for `len` consecutive tun sequence numbers starting at
/// `seq_start`, lost on the tunnel identified by `tun_id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResendRequest {
    pub seq_start: u64,
    pub tun_id: i32,
    pub len: i32,
}

impl EncoderValue for ResendRequest {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_slice(MAGIC);
        encoder.encode(&self.seq_start);
        encoder.encode(&self.tun_id);
        encoder.encode(&self.len);
    }
}

decoder_value!(
    impl<'a> ResendRequest {
        fn decode(buffer: Buffer) -> Result<Self> {
            let (magic, buffer) = buffer.decode_slice(MAGIC.len())?;
            decoder_invariant!(
                magic.as_less_safe_slice() == &MAGIC[..],
                "invalid resend request"
            );
            let (seq_start, buffer) = buffer.decode()?;
            let (tun_id, buffer) = buffer.decode()?;
            let (len, buffer) = buffer.decode()?;
            let request = Self {
                seq_start,
                tun_id,
                len,
            };
            Ok((request, buffer))
        }
    }
);

impl ResendRequest {
    /// Serializes the request into a fresh payload buffer
    pub fn to_payload(self) -> Vec<u8> {
        let mut payload = vec![0u8; PAYLOAD_LEN];
        let mut encoder = EncoderBuffer::new(&mut payload);
        encoder.encode(&self);
        debug_assert_eq!(encoder.len(), PAYLOAD_LEN);
        payload
    }

    /// Parses a request out of a received payload
    pub fn parse(payload: &[u8]) -> Result<Self, DecoderError> {
        let (request, _) = DecoderBuffer::new(payload).decode::<Self>()?;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let request = ResendRequest {
            seq_start: 0x0102_0304_0506_0708,
            tun_id: 5080,
            len: 17,
        };
        let payload = request.to_payload();
        assert_eq!(payload.len(), PAYLOAD_LEN);
        assert_eq!(&payload[..2], b"RS");
        // big-endian on the wire
        assert_eq!(&payload[2..10], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(ResendRequest::parse(&payload).unwrap(), request);
    }

    #[test]
    fn rejects_garbage() {
        assert!(ResendRequest::parse(b"").is_err());
        assert!(ResendRequest::parse(b"RS").is_err());
        assert!(ResendRequest::parse(&[0u8; PAYLOAD_LEN]).is_err());
    }
}
