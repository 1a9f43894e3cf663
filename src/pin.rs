// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! PIN attempt state machine.
//!
//! The engine keeps no state between calls. Everything it needs comes back in the
//! signed [`AttemptRecord`], and the chip's counters are the ground truth for how
//! many guesses are left.

use {
    crate::{
        config::{KDF_ITER_PIN, MAX_TARGET_ATTEMPTS, SECRET_LEN},
        error::{PinError, SeFailure},
        link::{Bus, SeLink},
        record::{AttemptRecord, ChangeFlags, StateFlags},
        secrets::{RomSecrets, SessionContext},
        session::{xor_in_place, SessionCrypto},
        slots::{Slot, ATTEMPT_COUNTER, MATCH_COUNT_QUANTUM},
    },
    log::{debug, info, warn},
    rand_core::{CryptoRng, RngCore},
    sha2::{Digest, Sha256},
    zeroize::Zeroizing,
};

/// Domain separation for hashing the main PIN.
const PIN_PURPOSE_NORMAL: u32 = 0x334d_1858;

/// Reported as the failure count when lastgood is ahead of counter 0.
const NUM_FAILS_UNKNOWN: u32 = 99;

/// Where an attempt stands. Serialized as the record's state flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinState {
    /// Signed by setup, no good login yet. A failed login comes back here too.
    Prepared,
    /// The device has no PIN. Every login succeeds.
    Blank,
    /// A login succeeded. Change and fetch are allowed.
    Authenticated,
}

impl PinState {
    pub fn of(record: &AttemptRecord) -> Self {
        let flags = record.state_flags;
        if flags.contains(StateFlags::IS_BLANK) {
            Self::Blank
        } else if flags.contains(StateFlags::SUCCESSFUL) {
            Self::Authenticated
        } else {
            Self::Prepared
        }
    }

    pub fn flags(self) -> StateFlags {
        match self {
            Self::Prepared => StateFlags::empty(),
            Self::Blank => StateFlags::SUCCESSFUL | StateFlags::IS_BLANK,
            Self::Authenticated => StateFlags::SUCCESSFUL,
        }
    }

    fn is_logged_in(self) -> bool {
        self != Self::Prepared
    }
}

/// Attempt counts as derived from the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempts {
    pub num_fails: u32,
    pub attempts_left: u32,
}

pub struct PinEngine<'a, B, R> {
    link: &'a mut SeLink<B>,
    secrets: &'a RomSecrets,
    session: &'a mut SessionContext,
    rng: &'a mut R,
}

impl<'a, B: Bus, R: RngCore + CryptoRng> PinEngine<'a, B, R> {
    pub fn new(
        link: &'a mut SeLink<B>,
        secrets: &'a RomSecrets,
        session: &'a mut SessionContext,
        rng: &'a mut R,
    ) -> Self {
        Self {
            link,
            secrets,
            session,
            rng,
        }
    }

    /// Start a new attempt: report the counters, detect a blank PIN, sign.
    ///
    /// No signature is needed on the way in. Records signed before this call stop
    /// verifying.
    pub fn setup(&mut self, record: &mut AttemptRecord) -> Result<(), PinError> {
        record.validate()?;

        record.private_state = self.session.rotate_nonce(&mut *self.rng);
        record.state_flags = StateFlags::empty();
        record.cached_main_pin = [0; 32];
        record.hmac = [0; 32];

        let mut se = SessionCrypto::new(&mut *self.link, self.secrets, &mut *self.rng);
        se.link().reset_chip();

        let attempts = read_attempts(&mut se)?;
        record.num_fails = attempts.num_fails;
        record.attempts_left = attempts.attempts_left;
        if attempts.attempts_left == 0 {
            warn!("pin: no attempts left");
            return Err(PinError::IAmBrick);
        }

        if is_main_pin(&mut se, &[0; 32])? {
            debug!("pin: blank");
            record.state_flags = PinState::Blank.flags();
        }

        record.sign(self.secrets, self.session)
    }

    /// Try the PIN in the record against the chip.
    ///
    /// Every guess is charged on the chip before the answer is known. A wrong PIN
    /// comes back as `AuthFail` with the record re-signed and the counts updated.
    pub fn login(&mut self, record: &mut AttemptRecord) -> Result<(), PinError> {
        record.validate()?;
        record.verify(self.secrets, self.session)?;

        let state = PinState::of(record);
        let mut se = SessionCrypto::new(&mut *self.link, self.secrets, &mut *self.rng);

        let digest = match state {
            PinState::Authenticated => return Err(PinError::WrongSuccess),
            // Never try the PIN on a blank device. The flag may predate a PIN
            // change in this session though, so ask the chip; that costs no attempt.
            PinState::Blank => {
                let digest = Zeroizing::new([0u8; 32]);
                if !is_main_pin(&mut se, &digest)? {
                    let attempts = read_attempts(&mut se)?;
                    warn!("pin: record says blank, chip disagrees");
                    record.num_fails = attempts.num_fails;
                    record.attempts_left = attempts.attempts_left;
                    record.state_flags = PinState::Prepared.flags();
                    record.sign(self.secrets, self.session)?;
                    return Err(PinError::AuthFail);
                }
                digest
            }
            PinState::Prepared => {
                let digest = match pin_hash(&mut se, self.secrets, record.pin()) {
                    Ok(digest) => Zeroizing::new(digest),
                    Err(e) => {
                        // The chip refuses the attempt key once the budget is spent.
                        let attempts = read_attempts(&mut se)?;
                        if attempts.attempts_left == 0 {
                            warn!("pin: no attempts left");
                            record.num_fails = attempts.num_fails;
                            record.attempts_left = 0;
                            return Err(PinError::IAmBrick);
                        }
                        return Err(e.into());
                    }
                };
                if !is_main_pin(&mut se, &digest)? {
                    let attempts = read_attempts(&mut se)?;
                    warn!("pin: wrong, {} attempts left", attempts.attempts_left);
                    record.num_fails = attempts.num_fails;
                    record.attempts_left = attempts.attempts_left;
                    record.sign(self.secrets, self.session)?;
                    return Err(PinError::AuthFail);
                }
                update_for_good_login(&mut se, &digest)?;
                record.num_fails = 0;
                record.attempts_left = MAX_TARGET_ATTEMPTS;
                digest
            }
        };

        let zero_secret = is_secret_zero(&mut se, &digest)?;
        record.state_flags = state.flags() | PinState::Authenticated.flags();
        record.state_flags.set(StateFlags::ZERO_SECRET, zero_secret);
        record.cached_main_pin = cache_digest(self.secrets, self.session, &digest);
        info!("pin: login ok");

        record.sign(self.secrets, self.session)
    }

    /// Change the main PIN and/or the stored secret. Needs a successful login.
    pub fn change(&mut self, record: &mut AttemptRecord) -> Result<(), PinError> {
        record.validate()?;
        record.verify(self.secrets, self.session)?;

        if !PinState::of(record).is_logged_in() {
            return Err(PinError::WrongSuccess);
        }
        if record.change_flags.is_empty() {
            return Err(PinError::BadRequest);
        }

        let mut se = SessionCrypto::new(&mut *self.link, self.secrets, &mut *self.rng);
        let mut digest = Zeroizing::new(restore_digest(self.secrets, self.session, record));

        if record.change_flags.contains(ChangeFlags::WALLET_PIN) {
            // Prove the old PIN again; the cached digest alone is not enough.
            let old = Zeroizing::new(pin_hash(&mut se, self.secrets, record.old_pin())?);
            if !is_main_pin(&mut se, &old)? {
                warn!("pin: old PIN wrong");
                return Err(PinError::OldAuthFail);
            }

            let new = Zeroizing::new(pin_hash(&mut se, self.secrets, record.new_pin())?);
            se.encrypted_write32(Slot::PinHash, 0, Slot::PinHash, &old, &new)?;
            update_for_good_login(&mut se, &new)?;

            *digest = *new;
            record.num_fails = 0;
            record.attempts_left = MAX_TARGET_ATTEMPTS;
            let state = if record.new_pin().is_empty() {
                PinState::Blank
            } else {
                PinState::Authenticated
            };
            let zero_secret = record.state_flags.contains(StateFlags::ZERO_SECRET);
            record.state_flags = state.flags();
            record.state_flags.set(StateFlags::ZERO_SECRET, zero_secret);
            record.cached_main_pin = cache_digest(self.secrets, self.session, &digest);
            info!("pin: main PIN changed");
        }

        if record.change_flags.contains(ChangeFlags::SECRET) {
            let mut secret = Zeroizing::new(record.secret);
            let zero = is_zero(secret.as_slice());
            if !zero {
                xor_in_place(secret.as_mut_slice(), &self.secrets.otp_key);
            }
            se.encrypted_write(Slot::Seed, Slot::PinHash, &digest, secret.as_slice())?;
            record.state_flags.set(StateFlags::ZERO_SECRET, zero);
            info!("pin: secret changed");
        }

        record.wipe_inputs();
        record.sign(self.secrets, self.session)
    }

    /// Read the stored secret back into the record. Needs a successful login.
    pub fn fetch_secret(&mut self, record: &mut AttemptRecord) -> Result<(), PinError> {
        record.validate()?;
        record.verify(self.secrets, self.session)?;

        if !PinState::of(record).is_logged_in() {
            return Err(PinError::WrongSuccess);
        }

        let mut se = SessionCrypto::new(&mut *self.link, self.secrets, &mut *self.rng);
        let digest = Zeroizing::new(restore_digest(self.secrets, self.session, record));
        if !is_main_pin(&mut se, &digest)? {
            // Cache from another boot, or the PIN changed underneath us.
            return Err(PinError::SeFail);
        }

        let secret = read_secret(&mut se, self.secrets, &digest)?;
        record.secret = *secret;
        record.sign(self.secrets, self.session)
    }

    /// Whether the chip will refuse any further guess.
    pub fn is_bricked(&mut self) -> Result<bool, PinError> {
        let mut se = SessionCrypto::new(&mut *self.link, self.secrets, &mut *self.rng);
        Ok(read_attempts(&mut se)?.attempts_left == 0)
    }
}

fn is_zero(data: &[u8]) -> bool {
    data.iter().fold(0u8, |acc, b| acc | b) == 0
}

/// Hash up a PIN for the chip: local hash, stretching, then the two mix-ins.
/// The empty PIN maps to all zeros, the value a fresh chip holds.
///
/// Using the attempt key is what charges counter 0, so this costs one guess.
fn pin_hash<B: Bus, R: RngCore + CryptoRng>(
    se: &mut SessionCrypto<'_, B, R>,
    secrets: &RomSecrets,
    pin: &[u8],
) -> Result<[u8; 32], SeFailure> {
    if pin.is_empty() {
        return Ok([0; 32]);
    }

    let mut hasher = Sha256::new();
    hasher.update(secrets.pairing_secret);
    hasher.update(PIN_PURPOSE_NORMAL.to_le_bytes());
    hasher.update(pin);
    hasher.update(&secrets.otp_key[..32]);
    let first = Zeroizing::new(<[u8; 32]>::from(hasher.finalize()));
    let local = Zeroizing::new(<[u8; 32]>::from(Sha256::digest(first.as_slice())));

    let stretched = Zeroizing::new(se.stretch(&local, KDF_ITER_PIN)?);
    let plain = Zeroizing::new(se.mixin_key(Slot::Plain, stretched.as_slice())?);
    se.mixin_key(Slot::PinAttempt, plain.as_slice())
}

/// Test a digest against the pin-hash slot, starting from a fresh chip session.
fn is_main_pin<B: Bus, R: RngCore + CryptoRng>(
    se: &mut SessionCrypto<'_, B, R>,
    digest: &[u8; 32],
) -> Result<bool, SeFailure> {
    se.link().reset_chip();
    se.pair_unlock()?;
    se.checkmac_hard(Slot::PinHash, digest)
}

/// Failure count and remaining guesses, from authenticated reads only.
fn read_attempts<B: Bus, R: RngCore + CryptoRng>(
    se: &mut SessionCrypto<'_, B, R>,
) -> Result<Attempts, SeFailure> {
    let counter = se.get_counter(ATTEMPT_COUNTER)?;
    let lastgood = se.read_verified_word(Slot::LastGood)?;
    let match_count = se.read_verified_word(Slot::MatchCount)?;

    let num_fails = counter.checked_sub(lastgood).unwrap_or(NUM_FAILS_UNKNOWN);
    let attempts_left = (match_count & !(MATCH_COUNT_QUANTUM - 1)).saturating_sub(counter);
    debug!("pin: counter {} lastgood {} match {}", counter, lastgood, match_count);
    Ok(Attempts {
        num_fails,
        attempts_left,
    })
}

/// Grant a full budget of attempts after a good PIN.
///
/// The match count goes up first: the chip won't let counter 0 pass it.
fn update_for_good_login<B: Bus, R: RngCore + CryptoRng>(
    se: &mut SessionCrypto<'_, B, R>,
    digest: &[u8; 32],
) -> Result<(), SeFailure> {
    let count = se.get_counter(ATTEMPT_COUNTER)?;
    let mc = (count + MAX_TARGET_ATTEMPTS + MATCH_COUNT_QUANTUM) & !(MATCH_COUNT_QUANTUM - 1);

    let mut block = [0u8; 32];
    block[0..4].copy_from_slice(&mc.to_le_bytes());
    block[4..8].copy_from_slice(&mc.to_le_bytes());
    se.encrypted_write32(Slot::MatchCount, 0, Slot::PinHash, digest, &block)?;

    let count = se.add_counter(ATTEMPT_COUNTER, mc - MAX_TARGET_ATTEMPTS - count)?;

    let mut block = [0u8; 32];
    block[0..4].copy_from_slice(&count.to_le_bytes());
    se.encrypted_write32(Slot::LastGood, 0, Slot::PinHash, digest, &block)?;
    debug!("pin: match count {} counter {}", mc, count);
    Ok(())
}

/// Read and unwrap the stored secret. All zeros is stored as-is.
fn read_secret<B: Bus, R: RngCore + CryptoRng>(
    se: &mut SessionCrypto<'_, B, R>,
    secrets: &RomSecrets,
    digest: &[u8; 32],
) -> Result<Zeroizing<[u8; SECRET_LEN]>, SeFailure> {
    let mut secret = Zeroizing::new([0u8; SECRET_LEN]);
    se.encrypted_read(Slot::Seed, Slot::PinHash, digest, secret.as_mut_slice())?;
    if !is_zero(secret.as_slice()) {
        xor_in_place(secret.as_mut_slice(), &secrets.otp_key);
    }
    Ok(secret)
}

fn is_secret_zero<B: Bus, R: RngCore + CryptoRng>(
    se: &mut SessionCrypto<'_, B, R>,
    digest: &[u8; 32],
) -> Result<bool, SeFailure> {
    let mut stored = Zeroizing::new([0u8; SECRET_LEN]);
    se.encrypted_read(Slot::Seed, Slot::PinHash, digest, stored.as_mut_slice())?;
    Ok(is_zero(stored.as_slice()))
}

/// Mask the digest with this boot's cache key. Zeros stay zeros.
fn cache_digest(secrets: &RomSecrets, session: &SessionContext, digest: &[u8; 32]) -> [u8; 32] {
    if is_zero(digest) {
        return [0; 32];
    }
    let mut out = session.cache_key(secrets);
    xor_in_place(&mut out, digest);
    out
}

fn restore_digest(secrets: &RomSecrets, session: &SessionContext, record: &AttemptRecord) -> [u8; 32] {
    cache_digest(secrets, session, &record.cached_main_pin)
}
