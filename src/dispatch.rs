// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Single entry point for the application: an opcode, a buffer, an argument.

use {
    crate::{
        config::{BOOT_JITTER_MS, DISPATCH_JITTER_MS, MAX_DISPATCH_LEN},
        error::PinError,
        link::{Bus, SeLink},
        pin::PinEngine,
        record::{AttemptRecord, RECORD_LEN},
        secrets::{RomSecrets, SessionContext},
        session::SessionCrypto,
        slots::{Slot, BLOCK_SIZE},
    },
    log::{debug, trace},
    rand_core::{CryptoRng, RngCore},
};

pub const CMD_PIN_CONTROL: u32 = 0;
pub const CMD_READ_SE_SLOT: u32 = 1;
pub const CMD_GET_RANDOM_BYTES: u32 = 2;
pub const CMD_IS_BRICKED: u32 = 3;

pub const PIN_SETUP: u32 = 0;
pub const PIN_ATTEMPT: u32 = 1;
pub const PIN_CHANGE: u32 = 2;
pub const PIN_GET_SECRET: u32 = 3;

/// Longest public slot, in bytes.
const MAX_SLOT_READ: usize = 3 * BLOCK_SIZE;

/// Owns the chip link and the per-boot session state.
pub struct Dispatcher<B, R> {
    link: SeLink<B>,
    secrets: RomSecrets,
    session: SessionContext,
    rng: R,
}

impl<B: Bus, R: RngCore + CryptoRng> Dispatcher<B, R> {
    /// Call once per boot. Waits a random time first.
    pub fn new(bus: B, secrets: RomSecrets, mut rng: R) -> Self {
        let mut link = SeLink::new(bus);
        let session = SessionContext::new(&mut rng);
        link.delay_ms(jitter(&mut rng, BOOT_JITTER_MS));
        Self {
            link,
            secrets,
            session,
            rng,
        }
    }

    pub fn link(&self) -> &SeLink<B> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut SeLink<B> {
        &mut self.link
    }

    /// Drop this boot's cache key and record nonce, as a reboot would.
    pub fn logout(&mut self) {
        self.session.forget(&mut self.rng);
    }

    /// Run one request. Returns 0 (or a count for `CMD_IS_BRICKED`) on success, a
    /// negative error code otherwise.
    ///
    /// Runs with interrupts masked and always leaves the chip asleep.
    pub fn dispatch(&mut self, method: u32, buf: &mut [u8], arg2: u32) -> i32 {
        if buf.len() > MAX_DISPATCH_LEN {
            return PinError::RangeError.code();
        }

        let delay = jitter(&mut self.rng, DISPATCH_JITTER_MS);
        self.link.delay_ms(delay);

        let result = critical_section::with(|_| {
            let result = self.run(method, buf, arg2);
            self.link.reset_chip();
            result
        });

        match result {
            Ok(value) => value,
            Err(e) => {
                debug!("dispatch: {} failed: {}", method, e);
                e.code()
            }
        }
    }

    fn run(&mut self, method: u32, buf: &mut [u8], arg2: u32) -> Result<i32, PinError> {
        trace!("dispatch: method {} arg2 {} len {}", method, arg2, buf.len());
        match method {
            CMD_PIN_CONTROL => self.pin_control(buf, arg2).map(|()| 0),
            CMD_READ_SE_SLOT => self.read_slot(buf, arg2).map(|()| 0),
            CMD_GET_RANDOM_BYTES => {
                let mut se = SessionCrypto::new(&mut self.link, &self.secrets, &mut self.rng);
                se.random(buf)?;
                Ok(0)
            }
            CMD_IS_BRICKED => {
                let mut engine = PinEngine::new(
                    &mut self.link,
                    &self.secrets,
                    &mut self.session,
                    &mut self.rng,
                );
                Ok(engine.is_bricked()?.into())
            }
            _ => Err(PinError::BadRequest),
        }
    }

    fn pin_control(&mut self, buf: &mut [u8], arg2: u32) -> Result<(), PinError> {
        let bytes: &mut [u8; RECORD_LEN] = buf.try_into().map_err(|_| PinError::BadRequest)?;
        let mut record = AttemptRecord::from_bytes(bytes);

        let mut engine = PinEngine::new(
            &mut self.link,
            &self.secrets,
            &mut self.session,
            &mut self.rng,
        );
        let result = match arg2 {
            PIN_SETUP => engine.setup(&mut record),
            PIN_ATTEMPT => engine.login(&mut record),
            PIN_CHANGE => engine.change(&mut record),
            PIN_GET_SECRET => engine.fetch_secret(&mut record),
            _ => Err(PinError::BadRequest),
        };

        // These outcomes carry counts the caller must see.
        if matches!(
            result,
            Ok(()) | Err(PinError::AuthFail) | Err(PinError::IAmBrick)
        ) {
            bytes.copy_from_slice(&record.to_bytes());
        }
        result
    }

    fn read_slot(&mut self, buf: &mut [u8], arg2: u32) -> Result<(), PinError> {
        let slot = u8::try_from(arg2)
            .ok()
            .and_then(Slot::from_id)
            .filter(|slot| slot.is_public())
            .ok_or(PinError::BadRequest)?;
        if buf.len() > MAX_SLOT_READ {
            return Err(PinError::RangeError);
        }

        let mut se = SessionCrypto::new(&mut self.link, &self.secrets, &mut self.rng);
        for (block, chunk) in buf.chunks_mut(BLOCK_SIZE).enumerate() {
            let data = se.read_block(slot, block as u8)?;
            chunk.copy_from_slice(&data[..chunk.len()]);
        }
        Ok(())
    }
}

fn jitter<R: RngCore>(rng: &mut R, max_ms: u32) -> u32 {
    rng.next_u32() % (max_ms + 1)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            config::MAX_TARGET_ATTEMPTS,
            record::{ChangeFlags, StateFlags},
            secrets::test_secrets,
            sim::SimChip,
        },
        rand::{rngs::StdRng, SeedableRng},
    };

    fn dispatcher() -> Dispatcher<SimChip, StdRng> {
        let secrets = test_secrets();
        let chip = SimChip::provisioned(&secrets, [3; 32], [4; 32]);
        Dispatcher::new(chip, secrets, StdRng::seed_from_u64(99))
    }

    fn chip(d: &Dispatcher<SimChip, StdRng>) -> &SimChip {
        d.link().bus()
    }

    fn pin_call(d: &mut Dispatcher<SimChip, StdRng>, buf: &mut [u8; RECORD_LEN], op: u32) -> i32 {
        let rc = d.dispatch(CMD_PIN_CONTROL, buf, op);
        assert!(chip(d).is_asleep());
        rc
    }

    fn record(buf: &[u8; RECORD_LEN]) -> AttemptRecord {
        AttemptRecord::from_bytes(buf)
    }

    #[test]
    fn boot_delay_is_bounded() {
        let d = dispatcher();
        assert!(chip(&d).delayed_ms() <= BOOT_JITTER_MS);
    }

    #[test]
    fn oversized_buffer_never_reaches_the_chip() {
        let mut d = dispatcher();
        let mut buf = [0u8; MAX_DISPATCH_LEN + 1];
        assert_eq!(d.dispatch(CMD_GET_RANDOM_BYTES, &mut buf, 0), -103);
        assert_eq!(chip(&d).frames(), 0);
    }

    #[test]
    fn unknown_requests() {
        let mut d = dispatcher();
        let mut buf = [0u8; 4];
        assert_eq!(d.dispatch(7, &mut buf, 0), -104);
        assert!(chip(&d).is_asleep());

        let mut buf = [0u8; RECORD_LEN];
        assert_eq!(d.dispatch(CMD_PIN_CONTROL, &mut buf[..100], PIN_SETUP), -104);
        assert_eq!(pin_call(&mut d, &mut buf, 9), -104);
    }

    #[test]
    fn pin_flow_over_bytes() {
        let mut d = dispatcher();
        let secret: [u8; 72] = core::array::from_fn(|i| i as u8 ^ 0x3c);

        // Personalize the blank device.
        let mut request = AttemptRecord::default();
        request.change_flags = ChangeFlags::WALLET_PIN | ChangeFlags::SECRET;
        request.set_new_pin(b"1234");
        request.secret = secret;
        let mut buf = request.to_bytes();
        assert_eq!(pin_call(&mut d, &mut buf, PIN_SETUP), 0);
        assert!(record(&buf).state_flags.contains(StateFlags::IS_BLANK));
        assert_eq!(pin_call(&mut d, &mut buf, PIN_ATTEMPT), 0);
        assert_eq!(pin_call(&mut d, &mut buf, PIN_CHANGE), 0);

        // Wrong, then right.
        let mut buf = AttemptRecord::with_pin(b"0000").to_bytes();
        assert_eq!(pin_call(&mut d, &mut buf, PIN_SETUP), 0);
        let before = record(&buf).attempts_left;
        assert_eq!(pin_call(&mut d, &mut buf, PIN_ATTEMPT), -112);
        assert_eq!(record(&buf).attempts_left, before - 1);

        let mut buf = AttemptRecord::with_pin(b"1234").to_bytes();
        assert_eq!(pin_call(&mut d, &mut buf, PIN_SETUP), 0);
        assert_eq!(pin_call(&mut d, &mut buf, PIN_ATTEMPT), 0);
        assert_eq!(record(&buf).attempts_left, MAX_TARGET_ATTEMPTS);
        assert_eq!(pin_call(&mut d, &mut buf, PIN_GET_SECRET), 0);
        assert_eq!(record(&buf).secret, secret);

        // A logout invalidates the record.
        d.logout();
        assert_eq!(pin_call(&mut d, &mut buf, PIN_GET_SECRET), -100);
    }

    #[test]
    fn tampered_buffer_is_left_alone() {
        let mut d = dispatcher();
        let mut buf = AttemptRecord::with_pin(b"1234").to_bytes();
        assert_eq!(pin_call(&mut d, &mut buf, PIN_SETUP), 0);
        buf[52] = 0xff;
        let sent = buf;
        let frames = chip(&d).frames();
        assert_eq!(pin_call(&mut d, &mut buf, PIN_ATTEMPT), -100);
        assert_eq!(buf, sent);
        // Only the exit reset touched the line.
        assert_eq!(chip(&d).frames(), frames);
    }

    #[test]
    fn read_public_slots_only() {
        let mut d = dispatcher();
        let mut buf = [0u8; 32];
        assert_eq!(d.dispatch(CMD_READ_SE_SLOT, &mut buf, Slot::MatchCount.id().into()), 0);
        assert_eq!(&buf[..8], &[0, 4, 0, 0, 0, 4, 0, 0]);

        for slot in [Slot::PairingSecret, Slot::PinHash, Slot::Seed] {
            assert_eq!(d.dispatch(CMD_READ_SE_SLOT, &mut buf, slot.id().into()), -104);
        }
        assert_eq!(d.dispatch(CMD_READ_SE_SLOT, &mut buf, 0x105), -104);

        let mut big = [0u8; 200];
        assert_eq!(d.dispatch(CMD_READ_SE_SLOT, &mut big, Slot::LastGood.id().into()), -103);
    }

    #[test]
    fn random_bytes_and_brick_status() {
        let mut d = dispatcher();
        let mut buf = [0u8; 40];
        assert_eq!(d.dispatch(CMD_GET_RANDOM_BYTES, &mut buf, 0), 0);
        assert!(buf.iter().any(|b| *b != 0));

        let start = chip(&d).delayed_ms();
        assert_eq!(d.dispatch(CMD_IS_BRICKED, &mut [], 0), 0);
        assert!(chip(&d).delayed_ms() - start <= DISPATCH_JITTER_MS);

        d.link_mut().bus_mut().set_counter(0, 1024);
        assert_eq!(d.dispatch(CMD_IS_BRICKED, &mut [], 0), 1);
    }

    #[test]
    fn dead_chip_is_reported_and_left_asleep() {
        let mut d = dispatcher();
        d.link_mut().bus_mut().unplug();
        let mut buf = AttemptRecord::default().to_bytes();
        assert_eq!(pin_call(&mut d, &mut buf, PIN_SETUP), -106);
    }
}
