// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Invertible datagram transform: plaintext payload <-> authenticated,
//! XOR-enciphered datagram.
//!
//! Every datagram carries a 36-byte security header `{hmac20, salt16}`
//! ahead of the ciphertext. The stream-cipher key and the HMAC key are
//! both derived from `(private_key, salt)` through a deterministic
//! key-derivation PRNG, so the codec itself holds no per-frame state;
//! only the long-lived salt generator persists across calls.

use crate::error::{Error, Result};
use ring::hmac;

const HMAC_LEN: usize = 20;
const SALT_LEN: usize = 16;
pub const SECURITY_HEADER_LEN: usize = HMAC_LEN + SALT_LEN;

/// Minimal splitmix64 generator used for deterministic key/keystream
/// derivation. Not cryptographically vetted as an RNG in general; its only
/// job here is to stretch `(private_key, salt)` into as many pseudorandom
/// bytes as the caller needs, deterministically.
struct SplitMix64(u64);

impl SplitMix64 {
    fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }

    fn fill_bytes(&mut self, out: &mut [u8]) {
        let mut chunks = out.chunks_exact_mut(8);
        for chunk in &mut chunks {
            chunk.copy_from_slice(&self.next_u64().to_le_bytes());
        }
        let rem = chunks.into_remainder();
        if !rem.is_empty() {
            let tail = self.next_u64().to_le_bytes();
            rem.copy_from_slice(&tail[..rem.len()]);
        }
    }
}

fn seed_from(private_key: &[u8], salt: &[u8; SALT_LEN], domain: u8) -> u64 {
    let mut acc: u64 = 0xD1B54A32D192ED03 ^ (domain as u64);
    for &b in private_key.iter().chain(salt.iter()) {
        acc = acc.rotate_left(5) ^ (b as u64).wrapping_mul(0x100000001B3);
    }
    acc
}

/// Derive the keystream seed and HMAC key for one frame from the shared
/// secret and that frame's salt.
fn derive_keys(private_key: &[u8], salt: &[u8; SALT_LEN]) -> (u64, hmac::Key) {
    let stream_seed = seed_from(private_key, salt, 0x01);
    let mut hmac_rng = SplitMix64::new(seed_from(private_key, salt, 0x02));
    let mut hmac_key_bytes = [0u8; HMAC_LEN];
    hmac_rng.fill_bytes(&mut hmac_key_bytes);
    let hmac_key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, &hmac_key_bytes);
    (stream_seed, hmac_key)
}

fn xor_keystream(seed: u64, buf: &mut [u8]) {
    let mut rng = SplitMix64::new(seed);
    let mut ks = vec![0u8; buf.len()];
    rng.fill_bytes(&mut ks);
    for (b, k) in buf.iter_mut().zip(ks.iter()) {
        *b ^= k;
    }
}

/// Stateful only in the long-lived salt generator; everything else is
/// re-derived per frame, per the protocol's design.
pub struct FrameCodec {
    private_key: Vec<u8>,
    salt_rng: fastrand::Rng,
}

impl FrameCodec {
    /// Create a codec seeded from system entropy.
    pub fn new(private_key: Vec<u8>) -> Self {
        Self {
            private_key,
            salt_rng: fastrand::Rng::new(),
        }
    }

    /// Create a codec with a fixed salt-generator seed, for reproducible tests.
    pub fn with_seed(private_key: Vec<u8>, seed: u64) -> Self {
        Self {
            private_key,
            salt_rng: fastrand::Rng::with_seed(seed),
        }
    }

    fn next_salt(&mut self) -> [u8; SALT_LEN] {
        let mut salt = [0u8; SALT_LEN];
        self.salt_rng.fill(&mut salt);
        salt
    }

    /// Encode `plaintext` into an authenticated, enciphered datagram.
    pub fn encode(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let salt = self.next_salt();
        let (stream_seed, hmac_key) = derive_keys(&self.private_key, &salt);

        let mut datagram = Vec::with_capacity(SECURITY_HEADER_LEN + plaintext.len());
        datagram.extend_from_slice(&[0u8; HMAC_LEN]);
        datagram.extend_from_slice(&salt);
        datagram.extend_from_slice(plaintext);

        xor_keystream(stream_seed, &mut datagram[SECURITY_HEADER_LEN..]);

        let tag = hmac::sign(&hmac_key, &datagram[HMAC_LEN..]);
        datagram[..HMAC_LEN].copy_from_slice(&tag.as_ref()[..HMAC_LEN]);
        datagram
    }

    /// Decode a datagram produced by `encode`. Returns `FrameAuthFail` if
    /// the HMAC does not verify; the datagram must be dropped in that case.
    pub fn decode(&self, datagram: &[u8]) -> Result<Vec<u8>> {
        if datagram.len() < SECURITY_HEADER_LEN {
            return Err(Error::FrameTooShort);
        }
        let received_tag = &datagram[..HMAC_LEN];
        let salt: [u8; SALT_LEN] = datagram[HMAC_LEN..SECURITY_HEADER_LEN]
            .try_into()
            .expect("slice length matches SALT_LEN");

        let (stream_seed, hmac_key) = derive_keys(&self.private_key, &salt);

        let expected_tag = hmac::sign(&hmac_key, &datagram[HMAC_LEN..]);
        if expected_tag.as_ref()[..HMAC_LEN] != *received_tag {
            return Err(Error::FrameAuthFail);
        }

        let mut plaintext = datagram[SECURITY_HEADER_LEN..].to_vec();
        xor_keystream(stream_seed, &mut plaintext);
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> FrameCodec {
        FrameCodec::with_seed(b"test-private-key-material".to_vec(), 42)
    }

    #[test]
    fn round_trip() {
        let mut c = codec();
        let plaintext = b"totem payload bytes".to_vec();
        let datagram = c.encode(&plaintext);
        let decoded = c.decode(&datagram).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn different_frames_use_different_salts() {
        let mut c = codec();
        let a = c.encode(b"same payload");
        let b = c.encode(b"same payload");
        assert_ne!(a, b, "salt must vary per frame even for identical plaintext");
    }

    #[test]
    fn bit_flip_causes_auth_fail() {
        let mut c = codec();
        let mut datagram = c.encode(b"integrity matters");
        let last = datagram.len() - 1;
        datagram[last] ^= 0x01;
        assert!(matches!(c.decode(&datagram), Err(Error::FrameAuthFail)));
    }

    #[test]
    fn too_short_datagram_rejected() {
        let c = codec();
        let err = c.decode(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, Error::FrameTooShort));
    }

    #[test]
    fn wrong_private_key_fails_auth() {
        let mut sender = FrameCodec::with_seed(b"key-a".to_vec(), 1);
        let receiver = FrameCodec::with_seed(b"key-b".to_vec(), 1);
        let datagram = sender.encode(b"secret");
        assert!(matches!(receiver.decode(&datagram), Err(Error::FrameAuthFail)));
    }
}
