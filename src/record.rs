// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The PIN attempt record exchanged with the application.
//!
//! The record travels as a fixed 276-byte little-endian layout. Everything except
//! the signature itself is covered by an HMAC keyed with the pairing secret and
//! bound to the current session nonce, so a record is only good until the next
//! setup call.

use {
    crate::{
        config::{MAX_PIN_LEN, SECRET_LEN},
        error::PinError,
        secrets::{RomSecrets, SessionContext},
        session::constant_time_eq,
    },
    bitflags::bitflags,
    hmac::{Hmac, Mac},
    sha2::Sha256,
    static_assertions::const_assert_eq,
    zeroize::{Zeroize, ZeroizeOnDrop},
};

/// Record magic and version.
pub const PA_MAGIC_V1: u32 = 0x2eaf_6312;

/// Size of a serialized record.
pub const RECORD_LEN: usize = 276;

const HMAC_OFFSET: usize = 140;
const SECRET_OFFSET: usize = HMAC_OFFSET + 32;
const CACHE_OFFSET: usize = SECRET_OFFSET + SECRET_LEN;

const_assert_eq!(CACHE_OFFSET + 32, RECORD_LEN);

bitflags! {
    /// Outcome flags reported back in the record.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct StateFlags: u32 {
        /// PIN was right, further actions are allowed.
        const SUCCESSFUL  = 0x01;
        /// PIN is blank, any PIN logs in.
        const IS_BLANK    = 0x02;
        /// The stored secret is all zeros.
        const ZERO_SECRET = 0x10;
    }
}

bitflags! {
    /// What a change call should change.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct ChangeFlags: u32 {
        const WALLET_PIN = 0x01;
        const SECRET     = 0x08;
    }
}

/// Parsed form of the attempt record.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AttemptRecord {
    pub magic_value: u32,
    pub pin: [u8; MAX_PIN_LEN],
    pub pin_len: u32,
    /// Not enforced here; kept for layout compatibility.
    pub delay_achieved: u32,
    pub delay_required: u32,
    pub num_fails: u32,
    pub attempts_left: u32,
    #[zeroize(skip)]
    pub state_flags: StateFlags,
    pub private_state: u32,
    #[zeroize(skip)]
    pub change_flags: ChangeFlags,
    pub old_pin: [u8; MAX_PIN_LEN],
    pub old_pin_len: u32,
    pub new_pin: [u8; MAX_PIN_LEN],
    pub new_pin_len: u32,
    pub hmac: [u8; 32],
    pub secret: [u8; SECRET_LEN],
    pub cached_main_pin: [u8; 32],
}

impl core::fmt::Debug for AttemptRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AttemptRecord")
            .field("magic_value", &self.magic_value)
            .field("num_fails", &self.num_fails)
            .field("attempts_left", &self.attempts_left)
            .field("state_flags", &self.state_flags)
            .field("change_flags", &self.change_flags)
            .finish_non_exhaustive()
    }
}

impl Default for AttemptRecord {
    fn default() -> Self {
        Self {
            magic_value: PA_MAGIC_V1,
            pin: [0; MAX_PIN_LEN],
            pin_len: 0,
            delay_achieved: 0,
            delay_required: 0,
            num_fails: 0,
            attempts_left: 0,
            state_flags: StateFlags::empty(),
            private_state: 0,
            change_flags: ChangeFlags::empty(),
            old_pin: [0; MAX_PIN_LEN],
            old_pin_len: 0,
            new_pin: [0; MAX_PIN_LEN],
            new_pin_len: 0,
            hmac: [0; 32],
            secret: [0; SECRET_LEN],
            cached_main_pin: [0; 32],
        }
    }
}

struct Writer<'a> {
    buf: &'a mut [u8; RECORD_LEN],
    pos: usize,
}

impl Writer<'_> {
    fn bytes(&mut self, data: &[u8]) {
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
    }

    fn u32(&mut self, value: u32) {
        self.bytes(&value.to_le_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8; RECORD_LEN],
    pos: usize,
}

impl Reader<'_> {
    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.array())
    }
}

impl AttemptRecord {
    /// A fresh record asking for `pin`. Long PINs are truncated here and then
    /// rejected by validation.
    pub fn with_pin(pin: &[u8]) -> Self {
        let mut record = Self::default();
        record.set_pin(pin);
        record
    }

    pub fn set_pin(&mut self, pin: &[u8]) {
        let (buf, len) = pin_field(pin);
        self.pin = buf;
        self.pin_len = len;
    }

    pub fn set_old_pin(&mut self, pin: &[u8]) {
        let (buf, len) = pin_field(pin);
        self.old_pin = buf;
        self.old_pin_len = len;
    }

    pub fn set_new_pin(&mut self, pin: &[u8]) {
        let (buf, len) = pin_field(pin);
        self.new_pin = buf;
        self.new_pin_len = len;
    }

    pub fn pin(&self) -> &[u8] {
        &self.pin[..(self.pin_len as usize).min(MAX_PIN_LEN)]
    }

    pub fn old_pin(&self) -> &[u8] {
        &self.old_pin[..(self.old_pin_len as usize).min(MAX_PIN_LEN)]
    }

    pub fn new_pin(&self) -> &[u8] {
        &self.new_pin[..(self.new_pin_len as usize).min(MAX_PIN_LEN)]
    }

    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        let mut w = Writer {
            buf: &mut buf,
            pos: 0,
        };
        w.u32(self.magic_value);
        w.bytes(&self.pin);
        w.u32(self.pin_len);
        w.u32(self.delay_achieved);
        w.u32(self.delay_required);
        w.u32(self.num_fails);
        w.u32(self.attempts_left);
        w.u32(self.state_flags.bits());
        w.u32(self.private_state);
        w.u32(self.change_flags.bits());
        w.bytes(&self.old_pin);
        w.u32(self.old_pin_len);
        w.bytes(&self.new_pin);
        w.u32(self.new_pin_len);
        w.bytes(&self.hmac);
        w.bytes(&self.secret);
        w.bytes(&self.cached_main_pin);
        debug_assert_eq!(w.pos, RECORD_LEN);
        buf
    }

    /// Parse a record. Any bit pattern parses; [`AttemptRecord::validate`] judges it.
    pub fn from_bytes(buf: &[u8; RECORD_LEN]) -> Self {
        let mut r = Reader { buf, pos: 0 };
        Self {
            magic_value: r.u32(),
            pin: r.array(),
            pin_len: r.u32(),
            delay_achieved: r.u32(),
            delay_required: r.u32(),
            num_fails: r.u32(),
            attempts_left: r.u32(),
            state_flags: StateFlags::from_bits_retain(r.u32()),
            private_state: r.u32(),
            change_flags: ChangeFlags::from_bits_retain(r.u32()),
            old_pin: r.array(),
            old_pin_len: r.u32(),
            new_pin: r.array(),
            new_pin_len: r.u32(),
            hmac: r.array(),
            secret: r.array(),
            cached_main_pin: r.array(),
        }
    }

    /// Structural checks, done before anything touches the chip.
    pub fn validate(&self) -> Result<(), PinError> {
        if self.magic_value != PA_MAGIC_V1 {
            return Err(PinError::BadMagic);
        }
        let max = MAX_PIN_LEN as u32;
        if self.pin_len > max || self.old_pin_len > max || self.new_pin_len > max {
            return Err(PinError::RangeError);
        }
        if !ChangeFlags::all().contains(self.change_flags) {
            return Err(PinError::RangeError);
        }
        Ok(())
    }

    fn signature(&self, secrets: &RomSecrets, session: &SessionContext) -> Result<[u8; 32], PinError> {
        let bytes = self.to_bytes();
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&secrets.pairing_secret)
            .map_err(|_| PinError::HmacFail)?;
        mac.update(session.record_nonce());
        mac.update(&bytes[..HMAC_OFFSET]);
        mac.update(&bytes[SECRET_OFFSET..]);
        Ok(mac.finalize().into_bytes().into())
    }

    /// Sign the record for the current session.
    pub fn sign(&mut self, secrets: &RomSecrets, session: &SessionContext) -> Result<(), PinError> {
        self.hmac = self.signature(secrets, session)?;
        Ok(())
    }

    /// Check the record came back unchanged from our last answer in this session.
    pub fn verify(&self, secrets: &RomSecrets, session: &SessionContext) -> Result<(), PinError> {
        let expected = self.signature(secrets, session)?;
        if !constant_time_eq(&expected, &self.hmac) {
            return Err(PinError::HmacFail);
        }
        Ok(())
    }

    /// Drop the PINs and the secret before the record is handed back.
    pub fn wipe_inputs(&mut self) {
        self.pin.zeroize();
        self.pin_len = 0;
        self.old_pin.zeroize();
        self.old_pin_len = 0;
        self.new_pin.zeroize();
        self.new_pin_len = 0;
        self.secret.zeroize();
    }
}

fn pin_field(pin: &[u8]) -> ([u8; MAX_PIN_LEN], u32) {
    let mut buf = [0u8; MAX_PIN_LEN];
    let n = pin.len().min(MAX_PIN_LEN);
    buf[..n].copy_from_slice(&pin[..n]);
    (buf, pin.len() as u32)
}
