// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Software model of the secure element, speaking the same packets as the chip.
//!
//! Covers the commands this crate issues, with the slot configuration the
//! provisioning code writes: which keys need the pairing CheckMac, which slots are
//! secret, which digest authorizes encrypted access, and the counter 0 limit set by
//! the match count. Faults can be injected to exercise retries and MitM detection.

use {
    crate::{
        error::{BusTimeout, StatusCode},
        frame::{self, crc16, Opcode, MAX_PAYLOAD_LEN, MAX_RESPONSE_LEN},
        link::Bus,
        provision::{SE_CONFIG_1, SE_CONFIG_2},
        secrets::RomSecrets,
        slots::{Slot, BLOCK_SIZE, INITIAL_MATCH_COUNT, MATCH_COUNT_QUANTUM},
    },
    heapless::Vec,
    hmac::{Hmac, Mac},
    sha2::{Digest, Sha256},
};

/// Something an attacker, or a bad wire, does to the traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Flip the last byte of the next reply read.
    CorruptCrc,
    /// Cut the next reply read after two bytes.
    ShortRead,
    /// Next reply read times out.
    Silence,
    /// Replace the value of the next counter reply.
    ForgeCounter(u32),
    /// Replace the next 32-byte read reply.
    ForgeRead([u8; 32]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Nonce,
    Slot(u8),
    Counter,
}

#[derive(Clone, Copy)]
struct TempKey {
    value: [u8; 32],
    source: Source,
}

type Payload = Vec<u8, MAX_PAYLOAD_LEN>;

const SLOT_LEN: usize = 3 * BLOCK_SIZE;
const NUM_SLOTS: usize = 16;
const MAX_FAULTS: usize = 8;
const COUNTER_MAX: u32 = 2_097_151;

/// Reply waiting in the output buffer right after wake.
const WAKE_REPLY: [u8; 4] = [0x04, 0x11, 0x33, 0x43];

/// Info mode 0 answer of an ATECC608.
const REVISION: [u8; 4] = [0x00, 0x00, 0x60, 0x02];

const MAC_MODE: u8 = 0x41;
const CHECKMAC_MODE: u8 = 0x01;
const SHA_HMAC_INIT: u8 = 0x04;
const SHA_HMAC_END: u8 = 0xc2;

/// Keys that need the pairing CheckMac first, to digest or to HMAC with.
fn needs_auth(slot: u8) -> bool {
    matches!(slot, 2 | 3 | 4 | 9)
}

/// Never readable in clear.
fn is_secret(slot: u8) -> bool {
    matches!(slot, 1 | 2 | 3 | 4 | 9)
}

/// The key whose digest authorizes encrypted access to `slot`.
fn access_key(slot: u8) -> Option<u8> {
    match slot {
        3 | 5 | 6 | 9 => Some(Slot::PinHash.id()),
        _ => None,
    }
}

fn sha(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn payload(bytes: &[u8]) -> Result<Payload, StatusCode> {
    Vec::from_slice(bytes).map_err(|_| StatusCode::ParseError)
}

fn data_address(address: u16) -> (usize, usize) {
    (usize::from((address >> 3) & 0x0f), usize::from(address >> 8))
}

pub struct SimChip {
    config: [u8; 128],
    slots: [[u8; SLOT_LEN]; NUM_SLOTS],
    counters: [u32; 2],
    tempkey: Option<TempKey>,
    authorized: Option<u8>,
    hmac_key: Option<u8>,
    output: Vec<u8, MAX_RESPONSE_LEN>,
    next_random: Option<[u8; 32]>,
    rng_seed: [u8; 32],
    rng_count: u32,
    faults: Vec<Fault, MAX_FAULTS>,
    frames: usize,
    asleep: bool,
    connected: bool,
    delayed_ms: u32,
}

impl SimChip {
    /// A chip fresh from the reel: both zones unlocked.
    pub fn blank(serial: &[u8; 9]) -> Self {
        let mut config = [0u8; 128];
        config[0..4].copy_from_slice(&serial[0..4]);
        config[4..8].copy_from_slice(&REVISION);
        config[8..13].copy_from_slice(&serial[4..9]);
        config[86] = 0x55;
        config[87] = 0x55;
        config[88] = 0xff;
        config[89] = 0xff;

        let mut rng_seed = [0u8; 32];
        rng_seed[..9].copy_from_slice(serial);

        Self {
            config,
            slots: [[0; SLOT_LEN]; NUM_SLOTS],
            counters: [0; 2],
            tempkey: None,
            authorized: None,
            hmac_key: None,
            output: Vec::new(),
            next_random: None,
            rng_seed,
            rng_count: 0,
            faults: Vec::new(),
            frames: 0,
            asleep: true,
            connected: true,
            delayed_ms: 0,
        }
    }

    /// A chip in the state provisioning leaves it in, with the given chip-only keys.
    pub fn provisioned(secrets: &RomSecrets, stretch_key: [u8; 32], attempt_key: [u8; 32]) -> Self {
        let mut chip = Self::blank(&secrets.serial_number);
        chip.config[16..16 + SE_CONFIG_1.len()].copy_from_slice(&SE_CONFIG_1);
        chip.config[90..90 + SE_CONFIG_2.len()].copy_from_slice(&SE_CONFIG_2);
        chip.config[86] = 0x00;
        chip.config[87] = 0x00;
        chip.config[88] &= !((1 << Slot::PinStretch.id()) | (1 << Slot::PinAttempt.id()));

        chip.slots[1][..32].copy_from_slice(&secrets.pairing_secret);
        chip.slots[2][..32].copy_from_slice(&stretch_key);
        chip.slots[4][..32].copy_from_slice(&attempt_key);
        let mc = INITIAL_MATCH_COUNT.to_le_bytes();
        chip.slots[6][0..4].copy_from_slice(&mc);
        chip.slots[6][4..8].copy_from_slice(&mc);
        chip
    }

    pub fn inject(&mut self, fault: Fault) {
        // Bounded queue; extra faults are dropped.
        let _ = self.faults.push(fault);
    }

    /// From now on the chip never answers.
    pub fn unplug(&mut self) {
        self.connected = false;
    }

    /// RNG output of the next Nonce or Random command.
    pub fn set_next_random(&mut self, value: [u8; 32]) {
        self.next_random = Some(value);
    }

    pub fn tempkey(&self) -> Option<[u8; 32]> {
        self.tempkey.map(|t| t.value)
    }

    pub fn slot_block(&self, slot: Slot, block: usize) -> [u8; 32] {
        let start = block * BLOCK_SIZE;
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.slots[usize::from(slot.id())][start..start + BLOCK_SIZE]);
        out
    }

    pub fn counter(&self, id: usize) -> u32 {
        self.counters[id]
    }

    pub fn set_counter(&mut self, id: usize, value: u32) {
        self.counters[id] = value;
    }

    pub fn config(&self) -> &[u8; 128] {
        &self.config
    }

    /// Commands received since power up.
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn is_asleep(&self) -> bool {
        self.asleep
    }

    /// Total time the host spent in delays.
    pub fn delayed_ms(&self) -> u32 {
        self.delayed_ms
    }

    fn config_locked(&self) -> bool {
        self.config[87] != 0x55
    }

    fn data_locked(&self) -> bool {
        self.config[86] != 0x55
    }

    fn slot_unlocked(&self, slot: usize) -> bool {
        u16::from_le_bytes([self.config[88], self.config[89]]) & (1 << slot) != 0
    }

    fn serial(&self) -> [u8; 9] {
        let mut sn = [0u8; 9];
        sn[0..4].copy_from_slice(&self.config[0..4]);
        sn[4..9].copy_from_slice(&self.config[8..13]);
        sn
    }

    fn key(&self, slot: usize) -> &[u8] {
        &self.slots[slot][..32]
    }

    fn take_fault(&mut self, pred: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let i = self.faults.iter().position(pred)?;
        Some(self.faults.swap_remove(i))
    }

    fn chip_random(&mut self) -> [u8; 32] {
        if let Some(value) = self.next_random.take() {
            return value;
        }
        self.rng_count += 1;
        sha(&[&self.rng_seed, &self.rng_count.to_le_bytes()])
    }

    fn take_tempkey(&mut self, source: Option<Source>) -> Result<[u8; 32], StatusCode> {
        match self.tempkey.take() {
            Some(t) if source.map_or(true, |s| s == t.source) => Ok(t.value),
            _ => Err(StatusCode::ExecutionError),
        }
    }

    fn check_auth(&self, slot: u8) -> Result<(), StatusCode> {
        if needs_auth(slot) && self.authorized != Some(Slot::PairingSecret.id()) {
            return Err(StatusCode::ExecutionError);
        }
        Ok(())
    }

    fn execute(&mut self, opcode: Opcode, p1: u8, p2: u16, data: &[u8]) -> Result<Payload, StatusCode> {
        match opcode {
            Opcode::Read => self.read(p1, p2),
            Opcode::Write => self.write(p1, p2, data).and_then(|()| payload(&[0])),
            Opcode::Nonce => self.nonce(p1, data),
            Opcode::GenDig => self.gendig(p1, p2).and_then(|()| payload(&[0])),
            Opcode::Mac => self.mac(p1, p2),
            Opcode::CheckMac => self.checkmac(p1, p2, data).and_then(|()| payload(&[0])),
            Opcode::Counter => self.count(p1, p2),
            Opcode::Sha => self.sha(p1, p2, data),
            Opcode::Random => {
                let value = self.chip_random();
                payload(&value)
            }
            Opcode::SelfTest => payload(&[0]),
            Opcode::Lock => self.lock(p1, p2).and_then(|()| payload(&[0])),
            Opcode::Info => payload(&REVISION),
        }
    }

    fn read(&mut self, zone: u8, address: u16) -> Result<Payload, StatusCode> {
        let len = if zone & 0x80 != 0 { BLOCK_SIZE } else { 4 };
        match zone & 0x03 {
            0x00 => {
                let start = usize::from(address & 0x1f) * 4;
                let bytes = self
                    .config
                    .get(start..start + len)
                    .ok_or(StatusCode::ParseError)?;
                payload(bytes)
            }
            0x02 if len == BLOCK_SIZE => {
                let (slot, block) = data_address(address);
                if block >= SLOT_LEN / BLOCK_SIZE {
                    return Err(StatusCode::ParseError);
                }
                let start = block * BLOCK_SIZE;
                let mut out = [0u8; BLOCK_SIZE];
                out.copy_from_slice(&self.slots[slot][start..start + BLOCK_SIZE]);

                if slot == usize::from(Slot::Seed.id()) {
                    let key = Slot::PinHash.id();
                    let tempkey = self.take_tempkey(Some(Source::Slot(key)))?;
                    for (o, k) in out.iter_mut().zip(tempkey) {
                        *o ^= k;
                    }
                } else if is_secret(slot as u8) {
                    return Err(StatusCode::ExecutionError);
                }
                payload(&out)
            }
            _ => Err(StatusCode::ParseError),
        }
    }

    fn write(&mut self, zone: u8, address: u16, data: &[u8]) -> Result<(), StatusCode> {
        match zone & 0x03 {
            0x00 => {
                let start = usize::from(address & 0x1f) * 4;
                if self.config_locked() || data.len() != 4 {
                    return Err(StatusCode::ExecutionError);
                }
                // Serial, revision and the lock bytes are read only.
                if start < 16 || (84..88).contains(&start) {
                    return Err(StatusCode::ExecutionError);
                }
                self.config[start..start + 4].copy_from_slice(data);
                Ok(())
            }
            0x02 => {
                let (slot, block) = data_address(address);
                if !self.config_locked() || block >= SLOT_LEN / BLOCK_SIZE {
                    return Err(StatusCode::ExecutionError);
                }
                let start = block * BLOCK_SIZE;

                if !self.data_locked() {
                    if data.len() != BLOCK_SIZE || !self.slot_unlocked(slot) {
                        return Err(StatusCode::ExecutionError);
                    }
                    self.slots[slot][start..start + BLOCK_SIZE].copy_from_slice(data);
                    return Ok(());
                }

                let key = access_key(slot as u8).ok_or(StatusCode::ExecutionError)?;
                if data.len() != 2 * BLOCK_SIZE {
                    return Err(StatusCode::ParseError);
                }
                let tempkey = self.take_tempkey(Some(Source::Slot(key)))?;
                let mut plain = [0u8; BLOCK_SIZE];
                for ((p, c), k) in plain.iter_mut().zip(&data[..32]).zip(tempkey) {
                    *p = c ^ k;
                }

                let sn = self.serial();
                let a = address.to_le_bytes();
                let mac = sha(&[
                    &tempkey,
                    &[Opcode::Write as u8, zone, a[0], a[1]],
                    &[sn[8], sn[0], sn[1]],
                    &[0u8; 25],
                    &plain,
                ]);
                if mac[..] != data[32..] {
                    return Err(StatusCode::CheckMacMiscompare);
                }

                if slot == usize::from(Slot::MatchCount.id()) && block == 0 {
                    let lo = u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]);
                    let hi = u32::from_le_bytes([plain[4], plain[5], plain[6], plain[7]]);
                    if lo % MATCH_COUNT_QUANTUM != 0 || lo != hi {
                        return Err(StatusCode::ExecutionError);
                    }
                }
                self.slots[slot][start..start + BLOCK_SIZE].copy_from_slice(&plain);
                Ok(())
            }
            _ => Err(StatusCode::ParseError),
        }
    }

    fn nonce(&mut self, mode: u8, num_in: &[u8]) -> Result<Payload, StatusCode> {
        if mode != 0 || num_in.len() != 20 {
            return Err(StatusCode::ParseError);
        }
        let rand_out = self.chip_random();
        self.tempkey = Some(TempKey {
            value: sha(&[&rand_out, num_in, &[Opcode::Nonce as u8, 0, 0]]),
            source: Source::Nonce,
        });
        payload(&rand_out)
    }

    fn gendig(&mut self, zone: u8, key_id: u16) -> Result<(), StatusCode> {
        let prior = self.take_tempkey(Some(Source::Nonce))?;
        let sn = self.serial();
        let id = key_id.to_le_bytes();
        let (value, source) = match zone {
            0x02 => {
                let slot = usize::from(key_id);
                if slot >= NUM_SLOTS {
                    return Err(StatusCode::ParseError);
                }
                self.check_auth(slot as u8)?;
                let value = sha(&[
                    self.key(slot),
                    &[Opcode::GenDig as u8, zone, id[0], id[1]],
                    &[sn[8], sn[0], sn[1]],
                    &[0u8; 25],
                    &prior,
                ]);
                (value, Source::Slot(slot as u8))
            }
            0x04 => {
                let count = *self
                    .counters
                    .get(usize::from(key_id))
                    .ok_or(StatusCode::ParseError)?;
                let value = sha(&[
                    &[0u8; 32],
                    &[Opcode::GenDig as u8, zone, id[0], id[1]],
                    &[sn[8], sn[0], sn[1], 0],
                    &count.to_le_bytes(),
                    &[0u8; 20],
                    &prior,
                ]);
                (value, Source::Counter)
            }
            _ => return Err(StatusCode::ParseError),
        };
        self.tempkey = Some(TempKey { value, source });
        Ok(())
    }

    fn mac(&mut self, mode: u8, key_id: u16) -> Result<Payload, StatusCode> {
        let slot = usize::from(key_id);
        if mode != MAC_MODE || slot >= NUM_SLOTS {
            return Err(StatusCode::ParseError);
        }
        let prior = self.take_tempkey(None)?;
        let sn = self.serial();
        let id = key_id.to_le_bytes();
        let resp = sha(&[
            self.key(slot),
            &prior,
            &[Opcode::Mac as u8, mode, id[0], id[1]],
            &[0u8; 8],
            &[0u8; 3],
            &[sn[8]],
            &sn[4..8],
            &sn[0..4],
        ]);
        payload(&resp)
    }

    fn checkmac(&mut self, mode: u8, key_id: u16, body: &[u8]) -> Result<(), StatusCode> {
        let slot = usize::from(key_id);
        if mode != CHECKMAC_MODE || body.len() != 77 || slot >= NUM_SLOTS {
            return Err(StatusCode::ParseError);
        }
        let prior = self.take_tempkey(Some(Source::Nonce))?;
        let sn = self.serial();
        let od = &body[64..];
        let expected = sha(&[
            self.key(slot),
            &prior,
            &od[0..4],
            &[0u8; 8],
            &od[4..7],
            &[sn[8]],
            &od[7..11],
            &[sn[0], sn[1]],
            &od[11..13],
        ]);
        if expected[..] == body[32..64] {
            self.authorized = Some(slot as u8);
            Ok(())
        } else {
            self.authorized = None;
            Err(StatusCode::CheckMacMiscompare)
        }
    }

    fn count(&mut self, mode: u8, counter_id: u16) -> Result<Payload, StatusCode> {
        let counter = self
            .counters
            .get_mut(usize::from(counter_id))
            .ok_or(StatusCode::ParseError)?;
        match mode {
            0 => {}
            1 if *counter < COUNTER_MAX => *counter += 1,
            1 => return Err(StatusCode::ExecutionError),
            _ => return Err(StatusCode::ParseError),
        }
        payload(&counter.to_le_bytes())
    }

    fn sha(&mut self, mode: u8, p2: u16, data: &[u8]) -> Result<Payload, StatusCode> {
        match mode {
            SHA_HMAC_INIT => {
                let slot = p2 as u8;
                if !matches!(slot, 0 | 2 | 4) {
                    return Err(StatusCode::ExecutionError);
                }
                self.check_auth(slot)?;
                if slot == Slot::PinAttempt.id() {
                    let mc = &self.slots[usize::from(Slot::MatchCount.id())];
                    let limit = u32::from_le_bytes([mc[0], mc[1], mc[2], mc[3]]) & !(MATCH_COUNT_QUANTUM - 1);
                    if self.counters[0] >= limit {
                        return Err(StatusCode::ExecutionError);
                    }
                    self.counters[0] += 1;
                }
                self.hmac_key = Some(slot);
                payload(&[0])
            }
            SHA_HMAC_END => {
                let slot = self.hmac_key.take().ok_or(StatusCode::ExecutionError)?;
                if usize::from(p2) != data.len() {
                    return Err(StatusCode::ParseError);
                }
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(self.key(usize::from(slot)))
                    .map_err(|_| StatusCode::ExecutionError)?;
                mac.update(data);
                let out: [u8; 32] = mac.finalize().into_bytes().into();
                payload(&out)
            }
            _ => Err(StatusCode::ParseError),
        }
    }

    fn lock(&mut self, mode: u8, crc: u16) -> Result<(), StatusCode> {
        match mode & 0x03 {
            0x00 => {
                if self.config_locked() {
                    return Err(StatusCode::ExecutionError);
                }
                if mode & 0x80 == 0 && crc16(&self.config) != crc {
                    return Err(StatusCode::ExecutionError);
                }
                self.config[87] = 0x00;
                Ok(())
            }
            0x01 => {
                if !self.config_locked() || self.data_locked() {
                    return Err(StatusCode::ExecutionError);
                }
                self.config[86] = 0x00;
                Ok(())
            }
            0x02 => {
                let slot = usize::from((mode >> 2) & 0x0f);
                let bits = u16::from_le_bytes([self.config[88], self.config[89]]) & !(1 << slot);
                self.config[88..90].copy_from_slice(&bits.to_le_bytes());
                Ok(())
            }
            _ => Err(StatusCode::ParseError),
        }
    }

    fn tamper(&mut self, opcode: Opcode, reply: &mut Payload) {
        let forged = match opcode {
            Opcode::Counter => self.take_fault(|f| matches!(f, Fault::ForgeCounter(_))),
            Opcode::Read if reply.len() == BLOCK_SIZE => {
                self.take_fault(|f| matches!(f, Fault::ForgeRead(_)))
            }
            _ => None,
        };
        match forged {
            Some(Fault::ForgeCounter(value)) => {
                reply.clear();
                let _ = reply.extend_from_slice(&value.to_le_bytes());
            }
            Some(Fault::ForgeRead(block)) => {
                reply.clear();
                let _ = reply.extend_from_slice(&block);
            }
            _ => {}
        }
    }
}

impl Bus for SimChip {
    fn wake(&mut self) {
        self.asleep = false;
        self.output.clear();
        let _ = self.output.extend_from_slice(&WAKE_REPLY);
    }

    fn idle(&mut self) {}

    fn sleep(&mut self) {
        self.asleep = true;
        self.tempkey = None;
        self.authorized = None;
        self.hmac_key = None;
    }

    fn send(&mut self, packet: &[u8]) {
        self.frames += 1;
        if self.asleep || !self.connected {
            return;
        }

        let reply = match frame::decode_command(packet) {
            Ok(cmd) => {
                let result = self.execute(cmd.opcode, cmd.p1, cmd.p2, cmd.data);
                match result {
                    Ok(_) if cmd.opcode == Opcode::Info => {
                        self.output.clear();
                        let _ = self.output.extend_from_slice(&REVISION);
                        return;
                    }
                    Ok(mut reply) => {
                        self.tamper(cmd.opcode, &mut reply);
                        frame::encode_response(&reply)
                    }
                    Err(code) => frame::encode_response(&[code.into()]),
                }
            }
            Err(_) => frame::encode_response(&[StatusCode::CommsError.into()]),
        };
        if let Ok(reply) = reply {
            self.output = reply;
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, BusTimeout> {
        if !self.connected {
            return Err(BusTimeout);
        }
        let mut raw = self.output.clone();
        match self.take_fault(|f| matches!(f, Fault::CorruptCrc | Fault::ShortRead | Fault::Silence)) {
            Some(Fault::Silence) => return Err(BusTimeout),
            Some(Fault::ShortRead) => raw.truncate(2),
            Some(Fault::CorruptCrc) => {
                if let Some(last) = raw.last_mut() {
                    *last ^= 0xff;
                }
            }
            _ => {}
        }
        let n = raw.len().min(buf.len());
        buf[..n].copy_from_slice(&raw[..n]);
        Ok(n)
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delayed_ms += ms;
    }
}
