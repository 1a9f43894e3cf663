// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Authenticated session primitives on top of the raw chip commands.
//!
//! The host never reads TempKey. Instead it recomputes, with SHA-256, every value the
//! chip folds into TempKey, and then asks the chip for a MAC over it. If the chip
//! agrees, both sides hold the same secret state and nobody on the bus can have
//! forged the inputs.

use {
    crate::{
        config::PAIR_UNLOCK_ATTEMPTS,
        error::{LinkError, SeFailure, StatusCode},
        frame::Opcode,
        link::{slot_address, Bus, SeLink, ZONE_DATA_32},
        secrets::RomSecrets,
        slots::{Slot, BLOCK_SIZE},
    },
    log::{debug, error},
    rand_core::{CryptoRng, RngCore},
    sha2::{Digest, Sha256},
    zeroize::{Zeroize, Zeroizing},
};

/// Serial number bytes the chip hashes in alongside its unique serial.
const SN_8: u8 = 0xee;
const SN_0_1: [u8; 2] = [0x01, 0x23];

/// GenDig zone selecting a data slot.
const GENDIG_ZONE_DATA: u8 = 0x02;

/// GenDig zone selecting a monotonic counter.
const GENDIG_ZONE_COUNTER: u8 = 0x04;

/// MAC mode: include the full serial, key first, TempKey second.
const MAC_MODE: u8 = (1 << 6) | (1 << 0);

/// CheckMac mode: TempKey is the second 32 bytes.
const CHECKMAC_MODE: u8 = 0x01;

/// Content doesn't matter, but nice and visible.
const CHALLENGE: &[u8; 32] = b"(C) 2020 Foundation Devices Inc.";

/// The TempKey stored on the SE chip, as we computed it.
#[derive(Clone, Zeroize)]
pub struct TempKey([u8; 32]);

impl TempKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Compare without an early exit, so timing does not tell how much matched.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

pub fn xor_in_place(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Session-crypto operations for one dispatched call.
pub struct SessionCrypto<'a, B, R> {
    link: &'a mut SeLink<B>,
    secrets: &'a RomSecrets,
    rng: &'a mut R,
}

impl<'a, B: Bus, R: RngCore + CryptoRng> SessionCrypto<'a, B, R> {
    pub fn new(link: &'a mut SeLink<B>, secrets: &'a RomSecrets, rng: &'a mut R) -> Self {
        Self { link, secrets, rng }
    }

    pub fn link(&mut self) -> &mut SeLink<B> {
        self.link
    }

    /// Seed TempKey from `num_in` and the chip RNG. Only the RNG half comes back
    /// over the bus, so both sides end up with a value neither picked alone.
    pub fn pick_nonce(&mut self, num_in: &[u8; 20]) -> Result<TempKey, SeFailure> {
        let rand_out = self.link.nonce(num_in)?;
        Ok(TempKey(nonce_digest(&rand_out, num_in)))
    }

    fn fresh_nonce(&mut self) -> Result<TempKey, SeFailure> {
        let mut num_in = [0u8; 20];
        self.rng.fill_bytes(&mut num_in);
        self.pick_nonce(&num_in)
    }

    /// Have the chip fold the secret contents of `slot` into TempKey, and do the
    /// same here with what we believe the slot holds.
    pub fn gendig_slot(&mut self, slot: Slot, contents: &[u8; 32]) -> Result<[u8; 32], SeFailure> {
        let tempkey = self.fresh_nonce()?;
        self.link.gendig(GENDIG_ZONE_DATA, slot.id().into())?;
        Ok(gendig_slot_digest(slot.id(), contents, tempkey.as_bytes()))
    }

    /// Same as [`SessionCrypto::gendig_slot`], for a monotonic counter's value.
    pub fn gendig_counter(&mut self, counter_id: u16, value: u32) -> Result<[u8; 32], SeFailure> {
        let tempkey = self.fresh_nonce()?;
        self.link.gendig(GENDIG_ZONE_COUNTER, counter_id)?;
        Ok(gendig_counter_digest(counter_id, value, tempkey.as_bytes()))
    }

    /// Ask the chip for a MAC over the pairing secret and TempKey, and check it
    /// against `expected`. This is the authentication of the chip and its state.
    pub fn is_correct_tempkey(&mut self, expected: &[u8; 32]) -> Result<bool, SeFailure> {
        let key_id = u16::from(Slot::PairingSecret.id());
        let resp = self.link.mac(MAC_MODE, key_id)?;
        let actual = mac_digest(
            &self.secrets.pairing_secret,
            expected,
            key_id,
            &self.secrets.serial_number,
        );
        Ok(constant_time_eq(&actual, &resp))
    }

    /// Prove to the chip that we know the secret in `slot`.
    ///
    /// The one-byte status can be swapped by anyone on the wire. Use this to
    /// authorize key use inside the chip, never to authenticate the chip.
    pub fn checkmac(&mut self, slot: Slot, secret: &[u8; 32]) -> Result<(), SeFailure> {
        let mut od = [0u8; 13];
        self.rng.fill_bytes(&mut od);
        let tempkey = self.fresh_nonce()?;
        let resp = checkmac_response(secret, tempkey.as_bytes(), &od);

        let mut body = [0u8; 32 + 32 + 13];
        body[..32].copy_from_slice(CHALLENGE);
        body[32..64].copy_from_slice(&resp);
        body[64..].copy_from_slice(&od);

        match self.link.checkmac(CHECKMAC_MODE, slot.id().into(), &body) {
            Ok(()) => Ok(()),
            Err(LinkError::Chip(StatusCode::CheckMacMiscompare)) => Err(SeFailure::refused()),
            Err(e) => Err(e.into()),
        }
    }

    /// Check the chip produces a hash over random things the same way we would,
    /// which means we know the secret in the slot and nobody is in the middle.
    ///
    /// Used when the value may well be wrong (blank PIN probing, PIN attempts), so
    /// `Ok(false)` is an ordinary answer.
    pub fn checkmac_hard(&mut self, slot: Slot, secret: &[u8; 32]) -> Result<bool, SeFailure> {
        let digest = Zeroizing::new(self.gendig_slot(slot, secret)?);
        self.is_correct_tempkey(&digest)
    }

    /// Unlock the keys that need the pairing secret. Retried, since a glitch here
    /// would otherwise fail the whole operation.
    pub fn pair_unlock(&mut self) -> Result<(), SeFailure> {
        let secret = self.secrets.pairing_secret;
        let mut result = Err(SeFailure::refused());
        for _ in 0..PAIR_UNLOCK_ATTEMPTS {
            result = self.checkmac(Slot::PairingSecret, &secret);
            if result.is_ok() {
                break;
            }
        }
        result
    }

    /// HMAC `start` with the key in `slot`, then re-hash the reply with our own
    /// secrets. The chip reply crosses the bus in clear, so it is never used as-is.
    pub fn mixin_key(&mut self, slot: Slot, start: &[u8]) -> Result<[u8; 32], SeFailure> {
        if slot != Slot::Plain {
            self.pair_unlock()?;
        }
        self.link.hmac_init(slot.id().into())?;
        let mut end = Zeroizing::new(self.link.hmac_finish(start)?);

        let mut hasher = Sha256::new();
        hasher.update(self.secrets.pairing_secret);
        hasher.update(start);
        hasher.update([slot.id()]);
        hasher.update(end.as_slice());
        end.copy_from_slice(&hasher.finalize());
        Ok(*end)
    }

    /// Chain `iterations` chip HMACs under the stretch key, which never leaves the
    /// chip. Each round costs a bus round trip. The output crosses the bus in
    /// clear, so it is only an intermediate.
    pub fn stretch(&mut self, start: &[u8; 32], iterations: usize) -> Result<[u8; 32], SeFailure> {
        let mut msg = Zeroizing::new(*start);
        for _ in 0..iterations {
            // The stretch key needs a fresh unlock every round.
            self.pair_unlock()?;
            self.link.hmac_init(Slot::PinStretch.id().into())?;
            *msg = self.link.hmac_finish(msg.as_slice())?;
        }
        Ok(*msg)
    }

    /// Read one 32-byte block in clear.
    pub fn read_block(&mut self, slot: Slot, block: u8) -> Result<[u8; 32], SeFailure> {
        let mut out = [0u8; BLOCK_SIZE];
        self.link
            .read(ZONE_DATA_32, slot_address(slot.id(), block), &mut out)?;
        Ok(out)
    }

    /// Write one block, encrypted with and authenticated by the digest of the
    /// `auth_slot` secret.
    pub fn encrypted_write32(
        &mut self,
        slot: Slot,
        block: u8,
        auth_slot: Slot,
        auth_secret: &[u8; 32],
        data: &[u8; 32],
    ) -> Result<(), SeFailure> {
        self.pair_unlock()?;
        let digest = Zeroizing::new(self.gendig_slot(auth_slot, auth_secret)?);

        // encrypt the data to be written, and append an authenticating MAC
        let mut body = Zeroizing::new([0u8; 64]);
        body[..32].copy_from_slice(data);
        xor_in_place(&mut body[..32], digest.as_slice());

        let address = slot_address(slot.id(), block);
        body[32..].copy_from_slice(&write_mac(&digest, address, data));

        self.link.write(ZONE_DATA_32, address, body.as_slice())?;
        Ok(())
    }

    /// Read one block, encrypted on the wire by the digest of the `auth_slot` secret.
    pub fn encrypted_read32(
        &mut self,
        slot: Slot,
        block: u8,
        auth_slot: Slot,
        auth_secret: &[u8; 32],
    ) -> Result<[u8; 32], SeFailure> {
        self.pair_unlock()?;
        let digest = Zeroizing::new(self.gendig_slot(auth_slot, auth_secret)?);
        let mut data = self.read_block(slot, block)?;
        xor_in_place(&mut data, digest.as_slice());
        Ok(data)
    }

    /// Write `data` across as many blocks as needed; the last one is zero padded.
    pub fn encrypted_write(
        &mut self,
        slot: Slot,
        auth_slot: Slot,
        auth_secret: &[u8; 32],
        data: &[u8],
    ) -> Result<(), SeFailure> {
        for (block, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            let mut tmp = Zeroizing::new([0u8; BLOCK_SIZE]);
            tmp[..chunk.len()].copy_from_slice(chunk);
            self.encrypted_write32(slot, block as u8, auth_slot, auth_secret, &tmp)?;
        }
        Ok(())
    }

    pub fn encrypted_read(
        &mut self,
        slot: Slot,
        auth_slot: Slot,
        auth_secret: &[u8; 32],
        out: &mut [u8],
    ) -> Result<(), SeFailure> {
        for (block, chunk) in out.chunks_mut(BLOCK_SIZE).enumerate() {
            let tmp = Zeroizing::new(self.encrypted_read32(slot, block as u8, auth_slot, auth_secret)?);
            chunk.copy_from_slice(&tmp[..chunk.len()]);
        }
        Ok(())
    }

    /// First word of a slot readable in clear, authenticated with GenDig + MAC.
    pub fn read_verified_word(&mut self, slot: Slot) -> Result<u32, SeFailure> {
        let block = self.read_block(slot, 0)?;
        self.pair_unlock()?;
        let digest = self.gendig_slot(slot, &block)?;
        if !self.is_correct_tempkey(&digest)? {
            error!("se: {:?} value failed authentication", slot);
            return Err(SeFailure::mitm());
        }
        Ok(u32::from_le_bytes([block[0], block[1], block[2], block[3]]))
    }

    /// Read a monotonic counter.
    ///
    /// IMPORTANT: Always verify the counter's value because otherwise
    /// nothing prevents an active MitM changing the value that we think
    /// we just read.
    pub fn get_counter(&mut self, counter_id: u16) -> Result<u32, SeFailure> {
        let value = self.link.counter(counter_id, false)?;
        self.verify_counter(counter_id, value)
    }

    /// Bump a counter `incr` times, one unit per command; the chip has no bulk add.
    pub fn add_counter(&mut self, counter_id: u16, incr: u32) -> Result<u32, SeFailure> {
        if incr == 0 {
            return self.get_counter(counter_id);
        }
        let mut value = 0;
        for _ in 0..incr {
            value = self.link.counter(counter_id, true)?;
        }
        debug!("se: counter {} now {}", counter_id, value);
        self.verify_counter(counter_id, value)
    }

    fn verify_counter(&mut self, counter_id: u16, value: u32) -> Result<u32, SeFailure> {
        let digest = self.gendig_counter(counter_id, value)?;
        if !self.is_correct_tempkey(&digest)? {
            error!("se: counter {} value failed authentication", counter_id);
            return Err(SeFailure::mitm());
        }
        Ok(value)
    }

    /// Random bytes from the chip RNG.
    pub fn random(&mut self, out: &mut [u8]) -> Result<(), SeFailure> {
        for chunk in out.chunks_mut(32) {
            let bytes = self.link.random()?;
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
        Ok(())
    }
}

fn nonce_digest(rand_out: &[u8; 32], num_in: &[u8; 20]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(rand_out);
    hasher.update(num_in);
    hasher.update([Opcode::Nonce as u8, 0, 0]);
    hasher.finalize().into()
}

fn gendig_slot_digest(slot: u8, contents: &[u8; 32], tempkey: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(contents);
    hasher.update([Opcode::GenDig as u8, GENDIG_ZONE_DATA, slot, 0]);
    hasher.update([SN_8, SN_0_1[0], SN_0_1[1]]);
    hasher.update([0u8; 25]);
    hasher.update(tempkey);
    hasher.finalize().into()
}

fn gendig_counter_digest(counter_id: u16, value: u32, tempkey: &[u8; 32]) -> [u8; 32] {
    let id = counter_id.to_le_bytes();
    let mut hasher = Sha256::new();
    hasher.update([0u8; 32]);
    hasher.update([Opcode::GenDig as u8, GENDIG_ZONE_COUNTER, id[0], id[1]]);
    hasher.update([SN_8, SN_0_1[0], SN_0_1[1], 0]);
    hasher.update(value.to_le_bytes());
    hasher.update([0u8; 20]);
    hasher.update(tempkey);
    hasher.finalize().into()
}

/// What the chip answers to MAC over `key` and TempKey, full serial included.
fn mac_digest(key: &[u8; 32], tempkey: &[u8; 32], key_id: u16, sn: &[u8; 9]) -> [u8; 32] {
    let id = key_id.to_le_bytes();
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(tempkey);
    hasher.update([Opcode::Mac as u8, MAC_MODE, id[0], id[1]]);
    hasher.update([0u8; 8]);
    hasher.update([0u8; 3]);
    hasher.update([SN_8]);
    hasher.update(&sn[4..8]);
    hasher.update(&sn[0..4]);
    hasher.finalize().into()
}

/// Client response for CheckMac. `od` is the other data sent along with it.
fn checkmac_response(secret: &[u8; 32], tempkey: &[u8; 32], od: &[u8; 13]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(tempkey);
    hasher.update(&od[0..4]);
    hasher.update([0u8; 8]);
    hasher.update(&od[4..7]);
    hasher.update([SN_8]);
    hasher.update(&od[7..11]);
    hasher.update(SN_0_1);
    hasher.update(&od[11..13]);
    hasher.finalize().into()
}

/// Input MAC of an encrypted data-zone write.
fn write_mac(digest: &[u8; 32], address: u16, data: &[u8; 32]) -> [u8; 32] {
    let address = address.to_le_bytes();
    let mut hasher = Sha256::new();
    hasher.update(digest);
    hasher.update([Opcode::Write as u8, ZONE_DATA_32, address[0], address[1]]);
    hasher.update([SN_8, SN_0_1[0], SN_0_1[1]]);
    hasher.update([0u8; 25]);
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            secrets::test_secrets,
            sim::{Fault, SimChip},
        },
        rand::{rngs::StdRng, SeedableRng},
    };

    fn setup() -> (SeLink<SimChip>, RomSecrets, StdRng) {
        let secrets = test_secrets();
        let chip = SimChip::provisioned(&secrets, [0x11; 32], [0x22; 32]);
        (SeLink::new(chip), secrets, StdRng::seed_from_u64(1))
    }

    #[test]
    fn constant_time_eq_matches_slices() {
        assert!(constant_time_eq(&[1, 2, 3], &[1, 2, 3]));
        assert!(!constant_time_eq(&[1, 2, 3], &[1, 2, 4]));
        assert!(!constant_time_eq(&[1, 2, 3], &[1, 2]));
    }

    #[test]
    fn nonce_known_answer() {
        let (mut link, secrets, mut rng) = setup();
        link.bus_mut().set_next_random([0x5a; 32]);
        let mut se = SessionCrypto::new(&mut link, &secrets, &mut rng);
        let tempkey = se.pick_nonce(&[0x33; 20]).unwrap();

        let mut msg = std::vec![0x5a; 32];
        msg.extend([0x33; 20]);
        msg.extend([0x16, 0, 0]);
        let expected: [u8; 32] = Sha256::digest(&msg).into();
        assert_eq!(tempkey.as_bytes(), &expected);
        assert_eq!(link.bus().tempkey(), Some(expected));
    }

    /// Fills every request with the same byte.
    struct Fill(u8);

    impl RngCore for Fill {
        fn next_u32(&mut self) -> u32 {
            u32::from_le_bytes([self.0; 4])
        }

        fn next_u64(&mut self) -> u64 {
            u64::from_le_bytes([self.0; 8])
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(self.0);
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    impl CryptoRng for Fill {}

    const RAND_OUT: [u8; 32] = [0x5a; 32];
    const NUM_IN: [u8; 20] = [0x33; 20];
    const TEMPKEY: &str = "6f5cce19b070f655bac1aa6051ed2b48424d6aa3b5c6498e91b5709dfd1bdeb1";
    const GENDIG_SLOT5: &str = "bb1939b1eaf009c49a9ead75e35295c2a428c4f1164ce720c2ff61c540ee9204";

    fn tempkey() -> [u8; 32] {
        nonce_digest(&RAND_OUT, &NUM_IN)
    }

    #[test]
    fn known_answer_nonce_and_gendig() {
        assert_eq!(hex::encode(tempkey()), TEMPKEY);
        assert_eq!(
            hex::encode(gendig_slot_digest(5, &[0x11; 32], &tempkey())),
            GENDIG_SLOT5
        );
        assert_eq!(
            hex::encode(gendig_counter_digest(0, 1045, &tempkey())),
            "d4b254288c42941638a89748035aca87bd504eb2d14691d899ee21a1027c352e"
        );
    }

    #[test]
    fn known_answer_mac_checkmac_and_write() {
        let secrets = test_secrets();
        let mut digest = [0u8; 32];
        hex::decode_to_slice(GENDIG_SLOT5, &mut digest).unwrap();

        assert_eq!(
            hex::encode(mac_digest(&secrets.pairing_secret, &digest, 1, &secrets.serial_number)),
            "db565efaa5522c6353e303dd2291d564a2fe22cff6ae7a47594f7b3858093395"
        );
        let od: [u8; 13] = core::array::from_fn(|i| i as u8);
        assert_eq!(
            hex::encode(checkmac_response(&secrets.pairing_secret, &tempkey(), &od)),
            "87ebc869578c71812b50551538abf7b8f3186327e65e780f650922662951e584"
        );
        assert_eq!(
            hex::encode(write_mac(&digest, slot_address(6, 0), &[0x42; 32])),
            "e6b50d637489de7a21af586953e7ceb3cb45e289e608578e5aa4d3a78d6643bd"
        );
    }

    #[test]
    fn gendig_slot_follows_the_known_answer() {
        let (mut link, secrets, _) = setup();
        link.bus_mut().set_next_random(RAND_OUT);
        let mut rng = Fill(0x33);
        let mut se = SessionCrypto::new(&mut link, &secrets, &mut rng);
        let digest = se.gendig_slot(Slot::LastGood, &[0x11; 32]).unwrap();
        assert_eq!(hex::encode(digest), GENDIG_SLOT5);
    }

    #[test]
    fn tempkey_check_accepts_only_the_right_digest() {
        let (mut link, secrets, mut rng) = setup();
        let mut se = SessionCrypto::new(&mut link, &secrets, &mut rng);
        let digest = se.gendig_slot(Slot::LastGood, &[0; 32]).unwrap();
        assert_eq!(se.is_correct_tempkey(&digest), Ok(true));

        // The MAC used up TempKey, so load it again before the negative check.
        let digest = se.gendig_slot(Slot::LastGood, &[0; 32]).unwrap();
        let mut wrong = digest;
        wrong[31] ^= 1;
        assert_eq!(se.is_correct_tempkey(&wrong), Ok(false));
    }

    #[test]
    fn tempkey_check_fails_with_the_wrong_pairing_secret() {
        let (mut link, secrets, mut rng) = setup();
        let mut other = secrets.clone();
        other.pairing_secret[0] ^= 0xff;
        let mut se = SessionCrypto::new(&mut link, &other, &mut rng);
        let digest = se.gendig_slot(Slot::LastGood, &[0; 32]).unwrap();
        assert_eq!(se.is_correct_tempkey(&digest), Ok(false));
    }

    #[test]
    fn checkmac_proves_knowledge() {
        let (mut link, secrets, mut rng) = setup();
        let mut se = SessionCrypto::new(&mut link, &secrets, &mut rng);
        assert!(se.checkmac(Slot::PairingSecret, &secrets.pairing_secret).is_ok());
        assert!(se.checkmac(Slot::PairingSecret, &[0; 32]).is_err());
        assert!(se.pair_unlock().is_ok());
    }

    #[test]
    fn checkmac_hard_detects_blank_pin() {
        let (mut link, secrets, mut rng) = setup();
        let mut se = SessionCrypto::new(&mut link, &secrets, &mut rng);
        se.pair_unlock().unwrap();
        assert_eq!(se.checkmac_hard(Slot::PinHash, &[0; 32]), Ok(true));
        assert_eq!(se.checkmac_hard(Slot::PinHash, &[1; 32]), Ok(false));
    }

    #[test]
    fn stretch_is_deterministic_and_keyed() {
        let (mut link, secrets, mut rng) = setup();
        let mut se = SessionCrypto::new(&mut link, &secrets, &mut rng);
        let a = se.stretch(&[7; 32], 3).unwrap();
        let b = se.stretch(&[7; 32], 3).unwrap();
        let c = se.stretch(&[7; 32], 2).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(se.stretch(&[7; 32], 0).unwrap(), [7; 32]);
    }

    #[test]
    fn mixin_hides_the_clear_reply() {
        let (mut link, secrets, mut rng) = setup();
        let mut se = SessionCrypto::new(&mut link, &secrets, &mut rng);
        let end = se.mixin_key(Slot::Plain, &[9; 32]).unwrap();
        se.link().hmac_init(0).unwrap();
        let clear = se.link().hmac_finish(&[9; 32]).unwrap();
        assert_ne!(end, clear);
        assert_eq!(se.mixin_key(Slot::Plain, &[9; 32]).unwrap(), end);
    }

    #[test]
    fn pin_attempt_mixin_charges_counter() {
        let (mut link, secrets, mut rng) = setup();
        let mut se = SessionCrypto::new(&mut link, &secrets, &mut rng);
        let before = se.get_counter(0).unwrap();
        se.mixin_key(Slot::PinAttempt, &[1; 32]).unwrap();
        assert_eq!(se.get_counter(0).unwrap(), before + 1);
    }

    #[test]
    fn encrypted_round_trip_over_blocks() {
        let (mut link, secrets, mut rng) = setup();
        let mut se = SessionCrypto::new(&mut link, &secrets, &mut rng);
        let secret: [u8; 72] = core::array::from_fn(|i| i as u8 + 1);
        se.encrypted_write(Slot::Seed, Slot::PinHash, &[0; 32], &secret)
            .unwrap();
        let mut back = [0u8; 72];
        se.encrypted_read(Slot::Seed, Slot::PinHash, &[0; 32], &mut back)
            .unwrap();
        assert_eq!(back, secret);
        assert_eq!(link.bus().slot_block(Slot::Seed, 2)[..8], secret[64..]);
        assert_eq!(link.bus().slot_block(Slot::Seed, 2)[8..], [0; 24]);
    }

    #[test]
    fn encrypted_write_with_wrong_key_is_refused_by_chip() {
        let (mut link, secrets, mut rng) = setup();
        let mut se = SessionCrypto::new(&mut link, &secrets, &mut rng);
        assert!(se
            .encrypted_write32(Slot::LastGood, 0, Slot::PinHash, &[1; 32], &[5; 32])
            .is_err());
        assert_eq!(link.bus().slot_block(Slot::LastGood, 0), [0; 32]);
    }

    #[test]
    fn verified_reads() {
        let (mut link, secrets, mut rng) = setup();
        let mut se = SessionCrypto::new(&mut link, &secrets, &mut rng);
        assert_eq!(se.read_verified_word(Slot::MatchCount), Ok(1024));
        assert_eq!(se.add_counter(0, 3), Ok(3));
        assert_eq!(se.get_counter(0), Ok(3));
    }

    #[test]
    fn forged_counter_value_is_caught() {
        let (mut link, secrets, mut rng) = setup();
        link.bus_mut().inject(Fault::ForgeCounter(500));
        let mut se = SessionCrypto::new(&mut link, &secrets, &mut rng);
        let err = se.get_counter(0).unwrap_err();
        assert!(err.is_mitm());
    }

    #[test]
    fn forged_slot_read_is_caught() {
        let (mut link, secrets, mut rng) = setup();
        link.bus_mut().inject(Fault::ForgeRead([0xff; 32]));
        let mut se = SessionCrypto::new(&mut link, &secrets, &mut rng);
        let err = se.read_verified_word(Slot::LastGood).unwrap_err();
        assert!(err.is_mitm());
    }

    #[test]
    fn glitched_replies_are_absorbed() {
        let (mut link, secrets, mut rng) = setup();
        link.bus_mut().inject(Fault::CorruptCrc);
        link.bus_mut().inject(Fault::ShortRead);
        let mut se = SessionCrypto::new(&mut link, &secrets, &mut rng);
        assert_eq!(se.read_verified_word(Slot::MatchCount), Ok(1024));
    }

    #[test]
    fn random_fills_any_length() {
        let (mut link, secrets, mut rng) = setup();
        let mut se = SessionCrypto::new(&mut link, &secrets, &mut rng);
        let mut out = [0u8; 50];
        se.random(&mut out).unwrap();
        assert!(out.iter().any(|b| *b != 0));
    }
}
