// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! One call per chip command, with the wake/command/read/idle discipline.

use {
    crate::{
        config::{RESPONSE_POLL_MS, RESPONSE_RETRIES},
        error::{BusTimeout, FrameError, LinkError, StatusCode},
        frame::{self, Opcode, MAX_RESPONSE_LEN},
    },
    log::{trace, warn},
};

/// Byte transport to the chip, with the line states it needs.
pub trait Bus {
    /// Wake the chip. Its watchdog puts it back to sleep between operations.
    fn wake(&mut self);
    /// Stop the watchdog but keep TempKey and any authorization.
    fn idle(&mut self);
    /// Power down; TempKey and authorizations are forgotten.
    fn sleep(&mut self);
    fn send(&mut self, packet: &[u8]);
    /// Read back up to `buf.len()` bytes. A short count means the line went quiet.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, BusTimeout>;
    fn delay_ms(&mut self, ms: u32);
}

/// Line state to leave the chip in once a command completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum After {
    /// Keeps the session (TempKey, unlocked keys) for the next command.
    Idle,
    /// Ends the session.
    Sleep,
}

/// Data zone slot, 32-byte block address for Read and Write.
pub fn slot_address(slot: u8, block: u8) -> u16 {
    (u16::from(block) << 8) | (u16::from(slot) << 3)
}

/// Zone byte for a 32-byte access to the data zone.
pub const ZONE_DATA_32: u8 = 0x80 | 0x02;

/// Zone byte for a 4-byte access to the config zone.
pub const ZONE_CONFIG_4: u8 = 0x00;

/// Zone byte for a 32-byte access to the config zone.
pub const ZONE_CONFIG_32: u8 = 0x80;

pub struct SeLink<B> {
    bus: B,
}

impl<B: Bus> SeLink<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn into_inner(self) -> B {
        self.bus
    }

    pub fn delay_ms(&mut self, ms: u32) {
        self.bus.delay_ms(ms);
    }

    /// Wake the chip and put it straight back to sleep, dropping any session.
    pub fn reset_chip(&mut self) {
        self.bus.wake();
        self.bus.sleep();
    }

    /// Run one command and read `resp.len()` payload bytes back.
    ///
    /// Short and corrupted replies are read again, up to the retry limit. Errors the
    /// chip reports in-band are returned as they are; replaying the command is up
    /// to the caller.
    pub fn execute(
        &mut self,
        opcode: Opcode,
        p1: u8,
        p2: u16,
        data: &[u8],
        resp: &mut [u8],
        after: After,
    ) -> Result<(), LinkError> {
        let packet = frame::encode_command(opcode, p1, p2, data).map_err(|_| LinkError::BadCommand)?;
        trace!("se: {:?} p1={:#04x} p2={:#06x} len={}", opcode, p1, p2, data.len());

        self.bus.wake();
        self.bus.send(&packet);
        let result = self.read_response(opcode, resp);
        match after {
            After::Idle => self.bus.idle(),
            After::Sleep => self.bus.sleep(),
        }
        result
    }

    fn read_response(&mut self, opcode: Opcode, out: &mut [u8]) -> Result<(), LinkError> {
        let mut raw = [0u8; MAX_RESPONSE_LEN];
        let want = if opcode.has_envelope() {
            out.len() + 3
        } else {
            out.len()
        };
        if want > raw.len() {
            return Err(LinkError::BadCommand);
        }

        let mut only_timeouts = true;
        for attempt in 0..RESPONSE_RETRIES {
            if attempt > 0 {
                self.bus.delay_ms(RESPONSE_POLL_MS);
            }
            let n = match self.bus.receive(&mut raw[..want]) {
                Ok(n) => n,
                Err(BusTimeout) => continue,
            };
            only_timeouts = false;

            let decoded = if opcode.has_envelope() {
                frame::decode_response(&raw[..n], out.len())
            } else {
                frame::decode_raw(&raw[..n], out.len())
            };
            match decoded {
                Ok(payload) => {
                    out.copy_from_slice(payload);
                    return Ok(());
                }
                Err(FrameError::LengthMismatch { status: Some(code) }) => {
                    trace!("se: {:?} refused: {:?}", opcode, code);
                    return Err(LinkError::Chip(code));
                }
                Err(e) if e.is_retryable() => trace!("se: {:?} read {}: {:?}", opcode, attempt, e),
                Err(_) => return Err(LinkError::BadCommand),
            }
        }

        if only_timeouts {
            warn!("se: no reply to {:?}", opcode);
            Err(LinkError::BusTimeout)
        } else {
            warn!("se: {:?} gave up after {} reads", opcode, RESPONSE_RETRIES);
            Err(LinkError::RetriesExhausted)
        }
    }

    /// Commands whose whole reply is one status byte.
    fn status_command(&mut self, opcode: Opcode, p1: u8, p2: u16, data: &[u8]) -> Result<(), LinkError> {
        let mut status = [0u8; 1];
        self.execute(opcode, p1, p2, data, &mut status, After::Idle)?;
        match StatusCode::from(status[0]) {
            StatusCode::Success => Ok(()),
            code => Err(LinkError::Chip(code)),
        }
    }

    /// Read 4 or 32 bytes. `zone` and `address` as the chip defines them.
    pub fn read(&mut self, zone: u8, address: u16, out: &mut [u8]) -> Result<(), LinkError> {
        self.execute(Opcode::Read, zone, address, &[], out, After::Idle)
    }

    /// Write 4 or 32 bytes, optionally followed by the authenticating MAC.
    pub fn write(&mut self, zone: u8, address: u16, data: &[u8]) -> Result<(), LinkError> {
        self.status_command(Opcode::Write, zone, address, data)
    }

    /// Seed TempKey from our 20 bytes and the chip RNG. Returns the RNG output.
    pub fn nonce(&mut self, num_in: &[u8; 20]) -> Result<[u8; 32], LinkError> {
        let mut rand_out = [0u8; 32];
        self.execute(Opcode::Nonce, 0, 0, num_in, &mut rand_out, After::Idle)?;
        Ok(rand_out)
    }

    pub fn gendig(&mut self, zone: u8, key_id: u16) -> Result<(), LinkError> {
        self.status_command(Opcode::GenDig, zone, key_id, &[])
    }

    pub fn checkmac(&mut self, mode: u8, key_id: u16, body: &[u8]) -> Result<(), LinkError> {
        self.status_command(Opcode::CheckMac, mode, key_id, body)
    }

    pub fn mac(&mut self, mode: u8, key_id: u16) -> Result<[u8; 32], LinkError> {
        let mut out = [0u8; 32];
        self.execute(Opcode::Mac, mode, key_id, &[], &mut out, After::Idle)?;
        Ok(out)
    }

    /// Read (`increment == false`) or bump a monotonic counter. Returns its value.
    pub fn counter(&mut self, counter_id: u16, increment: bool) -> Result<u32, LinkError> {
        let mut out = [0u8; 4];
        self.execute(Opcode::Counter, increment.into(), counter_id, &[], &mut out, After::Idle)?;
        Ok(u32::from_le_bytes(out))
    }

    /// Start an HMAC with the key in `key_id`.
    pub fn hmac_init(&mut self, key_id: u16) -> Result<(), LinkError> {
        self.status_command(Opcode::Sha, SHA_HMAC_INIT, key_id, &[])
    }

    /// Finish the HMAC started by [`SeLink::hmac_init`] over `msg`.
    pub fn hmac_finish(&mut self, msg: &[u8]) -> Result<[u8; 32], LinkError> {
        let mut out = [0u8; 32];
        self.execute(Opcode::Sha, SHA_HMAC_END, msg.len() as u16, msg, &mut out, After::Idle)?;
        Ok(out)
    }

    pub fn random(&mut self) -> Result<[u8; 32], LinkError> {
        let mut out = [0u8; 32];
        self.execute(Opcode::Random, 0, 0, &[], &mut out, After::Idle)?;
        Ok(out)
    }

    /// Run the chip's self test. A non-zero result comes back as `SelfTestError`.
    pub fn self_test(&mut self) -> Result<(), LinkError> {
        self.status_command(Opcode::SelfTest, SELF_TEST_ALL, 0, &[])
            .map_err(|e| match e {
                LinkError::Chip(StatusCode::Unknown(_)) => LinkError::Chip(StatusCode::SelfTestError),
                e => e,
            })
    }

    pub fn lock(&mut self, mode: u8, crc: u16) -> Result<(), LinkError> {
        self.status_command(Opcode::Lock, mode, crc, &[])
    }

    pub fn info(&mut self, mode: u8, p2: u16) -> Result<[u8; 4], LinkError> {
        let mut out = [0u8; frame::INFO_LEN];
        self.execute(Opcode::Info, mode, p2, &[], &mut out, After::Idle)?;
        Ok(out)
    }
}

/// SHA command mode: start HMAC with a slot key.
pub const SHA_HMAC_INIT: u8 = 0x04;

/// SHA command mode: finish HMAC, result to the output buffer.
pub const SHA_HMAC_END: u8 = (3 << 6) | 0x02;

/// SelfTest mode bits: RNG, ECDSA, ECDH, AES, SHA.
pub const SELF_TEST_ALL: u8 = 0x3d;
