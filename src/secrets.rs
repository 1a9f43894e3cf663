// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Device secrets burned in at the factory, and per-boot session state.

use {
    core::fmt,
    rand_core::{CryptoRng, RngCore},
    sha2::{Digest, Sha256},
    zeroize::{Zeroize, ZeroizeOnDrop},
};

/// Secrets provisioned once into protected flash. Read-only afterwards.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RomSecrets {
    /// Shared with the SE; proves to it that we are its MCU.
    pub pairing_secret: [u8; 32],
    pub serial_number: [u8; 9],
    /// Wraps the seed secret before it is stored in the SE.
    pub otp_key: [u8; 72],
    /// Keys the cache of the PIN digest kept in attempt records.
    pub hash_cache_secret: [u8; 32],
    pub device_serial: [u8; 16],
}

impl fmt::Debug for RomSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RomSecrets")
            .field("serial_number", &self.serial_number)
            .field("device_serial", &self.device_serial)
            .finish_non_exhaustive()
    }
}

/// State that lives for one boot and is owned by the dispatch boundary.
///
/// Holds the seed of the key that encrypts cached PIN digests, and the nonce that
/// binds attempt-record signatures to the latest setup call.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionContext {
    boot_seed: [u8; 32],
    record_nonce: [u8; 32],
}

impl SessionContext {
    pub fn new<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut ctx = Self {
            boot_seed: [0; 32],
            record_nonce: [0; 32],
        };
        ctx.forget(rng);
        ctx
    }

    /// Draw fresh values. Cached digests and outstanding records stop working.
    pub fn forget<R: RngCore + CryptoRng>(&mut self, rng: &mut R) {
        rng.fill_bytes(&mut self.boot_seed);
        rng.fill_bytes(&mut self.record_nonce);
    }

    /// Start a new attempt. Returns the public part of the new nonce.
    pub fn rotate_nonce<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> u32 {
        rng.fill_bytes(&mut self.record_nonce);
        self.private_state()
    }

    pub fn record_nonce(&self) -> &[u8; 32] {
        &self.record_nonce
    }

    /// Value echoed to the caller in `private_state`.
    pub fn private_state(&self) -> u32 {
        u32::from_le_bytes([
            self.record_nonce[0],
            self.record_nonce[1],
            self.record_nonce[2],
            self.record_nonce[3],
        ])
    }

    /// Per-boot key that masks the PIN digest while it sits in a record.
    pub fn cache_key(&self, secrets: &RomSecrets) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(secrets.hash_cache_secret);
        hasher.update(self.boot_seed);
        hasher.finalize().into()
    }
}

#[cfg(test)]
pub(crate) fn test_secrets() -> RomSecrets {
    RomSecrets {
        pairing_secret: core::array::from_fn(|i| 0xa0 ^ i as u8),
        serial_number: [0x01, 0x23, 0x6c, 0x2d, 0x8e, 0x1f, 0x33, 0x90, 0xee],
        otp_key: core::array::from_fn(|i| (i as u8).wrapping_mul(7).wrapping_add(3)),
        hash_cache_secret: [0x5c; 32],
        device_serial: *b"PASSPORT-0000042",
    }
}
