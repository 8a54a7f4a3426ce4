// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! AEAD sealing of wire frames.
//!
//! Frames are protected with ChaCha20-Poly1305 under a key derived from the
//! pre-shared secret. The 12 byte nonce is `tun_seq (8) ‖ flow_id (4)`;
//! `tun_seq` strictly increases per tunnel and `flow_id` is random per
//! tunnel instance, so nonces never repeat under one key within a flow.
//! The fixed frame header is passed as additional data so any header
//! corruption fails authentication.

use aws_lc_rs::{
    aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN},
    digest::{digest, SHA256},
};

pub const TAG_LEN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The payload does not leave room for the authentication tag
    TooShort,
    /// Authentication failed or the sealing operation was rejected
    InvalidTag,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Self::TooShort => write!(f, "payload too short for authentication tag"),
            Self::InvalidTag => write!(f, "authentication failed"),
        }
    }
}

impl std::error::Error for Error {}

pub struct Key {
    key: LessSafeKey,
}

impl core::fmt::Debug for Key {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Key").finish_non_exhaustive()
    }
}

impl Key {
    /// Derives the frame protection key from the configured secret
    pub fn new(secret: &[u8]) -> Self {
        let material = digest(&SHA256, secret);
        let key = UnboundKey::new(&CHACHA20_POLY1305, material.as_ref()).expect("key size matches");
        Self {
            key: LessSafeKey::new(key),
        }
    }

    #[inline]
    pub fn tag_len(&self) -> usize {
        debug_assert_eq!(TAG_LEN, self.key.algorithm().tag_len());
        TAG_LEN
    }

    /// Seals `payload_and_tag` in place.
    ///
    /// The buffer holds the plaintext followed by `TAG_LEN` spare bytes; on
    /// return the plaintext is replaced by ciphertext and the spare bytes by
    /// the authentication tag.
    pub fn seal(
        &self,
        tun_seq: u64,
        flow_id: u32,
        aad: &[u8],
        payload_and_tag: &mut [u8],
    ) -> Result<(), Error> {
        let inline_len = payload_and_tag
            .len()
            .checked_sub(self.tag_len())
            .ok_or(Error::TooShort)?;
        let (in_out, tag_out) = payload_and_tag.split_at_mut(inline_len);

        let tag = self
            .key
            .seal_in_place_separate_tag(nonce(tun_seq, flow_id), Aad::from(aad), in_out)
            .map_err(|_| Error::InvalidTag)?;
        tag_out.copy_from_slice(tag.as_ref());
        Ok(())
    }

    /// Opens `payload_and_tag` in place, returning the plaintext length
    pub fn open(
        &self,
        tun_seq: u64,
        flow_id: u32,
        aad: &[u8],
        payload_and_tag: &mut [u8],
    ) -> Result<usize, Error> {
        if payload_and_tag.len() < self.tag_len() {
            return Err(Error::TooShort);
        }
        let plaintext = self
            .key
            .open_in_place(nonce(tun_seq, flow_id), Aad::from(aad), payload_and_tag)
            .map_err(|_| Error::InvalidTag)?;
        Ok(plaintext.len())
    }
}

#[inline]
fn nonce(tun_seq: u64, flow_id: u32) -> Nonce {
    let mut bytes = [0u8; NONCE_LEN];
    bytes[..8].copy_from_slice(&tun_seq.to_be_bytes());
    bytes[8..].copy_from_slice(&flow_id.to_be_bytes());
    Nonce::assume_unique_for_key(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = Key::new(b"a shared secret");
        let aad = [0x17u8; 28];

        let mut buf = b"hello across the bond".to_vec();
        let plaintext = buf.clone();
        buf.extend_from_slice(&[0u8; TAG_LEN]);

        key.seal(7, 0xdead_beef, &aad, &mut buf).unwrap();
        assert_ne!(&buf[..plaintext.len()], &plaintext[..]);

        let len = key.open(7, 0xdead_beef, &aad, &mut buf).unwrap();
        assert_eq!(&buf[..len], &plaintext[..]);
    }

    #[test]
    fn open_rejects_tampering() {
        let key = Key::new(b"a shared secret");
        let aad = [0u8; 28];

        let mut buf = vec![1u8; 32 + TAG_LEN];
        key.seal(1, 2, &aad, &mut buf).unwrap();

        // flipped ciphertext bit
        let mut bad = buf.clone();
        bad[3] ^= 1;
        assert_eq!(key.open(1, 2, &aad, &mut bad), Err(Error::InvalidTag));

        // flipped additional data bit
        let mut bad_aad = aad;
        bad_aad[0] ^= 1;
        assert_eq!(
            key.open(1, 2, &bad_aad, &mut buf.clone()),
            Err(Error::InvalidTag)
        );

        // wrong nonce material
        assert_eq!(key.open(2, 2, &aad, &mut buf.clone()), Err(Error::InvalidTag));

        // untouched frame still opens
        assert!(key.open(1, 2, &aad, &mut buf).is_ok());
    }

    #[test]
    fn empty_payload_is_sealable() {
        let key = Key::new(b"s");
        let mut buf = vec![0u8; TAG_LEN];
        key.seal(9, 9, &[], &mut buf).unwrap();
        assert_eq!(key.open(9, 9, &[], &mut buf), Ok(0));
    }
}
