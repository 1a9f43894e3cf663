// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command and response packets of the secure element.
//!
//! A command goes out as `ioflag ‖ count ‖ opcode ‖ p1 ‖ p2 ‖ data ‖ crc`, where `p2` is
//! a little-endian `u16` and `count` covers everything from itself to the CRC. A
//! response comes back as `count ‖ payload ‖ crc`. The CRC is the chip's own 16-bit
//! checksum and is stored little-endian.

use {crate::error::FrameError, crate::error::StatusCode, heapless::Vec};

/// Largest command data block.
pub const MAX_DATA_LEN: usize = 128;

/// count + opcode + p1 + p2 + crc.
pub const COMMAND_OVERHEAD: usize = 7;

/// Largest framed command, including the leading I/O flag.
pub const MAX_COMMAND_LEN: usize = 1 + COMMAND_OVERHEAD + MAX_DATA_LEN;

/// Largest response payload.
pub const MAX_PAYLOAD_LEN: usize = 64;

/// Largest response packet.
pub const MAX_RESPONSE_LEN: usize = MAX_PAYLOAD_LEN + 3;

/// Size of a status-only reply.
pub const STATUS_REPLY_LEN: usize = 4;

/// Payload size of an `Info` reply, which comes without count or CRC.
pub const INFO_LEN: usize = 4;

/// First byte of every transfer on the single wire, telling the chip what comes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IoFlag {
    Command = 0x77,
    Transmit = 0x88,
    Idle = 0xbb,
    Sleep = 0xcc,
}

/// Chip commands used by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Read = 0x02,
    Mac = 0x08,
    Write = 0x12,
    GenDig = 0x15,
    Nonce = 0x16,
    Lock = 0x17,
    Random = 0x1b,
    Counter = 0x24,
    CheckMac = 0x28,
    Info = 0x30,
    Sha = 0x47,
    SelfTest = 0x77,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x02 => Self::Read,
            0x08 => Self::Mac,
            0x12 => Self::Write,
            0x15 => Self::GenDig,
            0x16 => Self::Nonce,
            0x17 => Self::Lock,
            0x1b => Self::Random,
            0x24 => Self::Counter,
            0x28 => Self::CheckMac,
            0x30 => Self::Info,
            0x47 => Self::Sha,
            0x77 => Self::SelfTest,
            other => return Err(other),
        })
    }
}

impl Opcode {
    /// `Info` replies carry neither count nor CRC.
    pub fn has_envelope(self) -> bool {
        self != Opcode::Info
    }
}

/// One decoded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command<'a> {
    pub opcode: Opcode,
    pub p1: u8,
    pub p2: u16,
    pub data: &'a [u8],
}

/// The chip's CRC-16: polynomial 0x8005, zero seed, data bits taken LSB first.
pub fn crc16(data: &[u8]) -> u16 {
    let poly = 0x8005u16;
    let mut crc = 0u16;
    for d in data {
        for i in 0..8 {
            let data_bit = (d >> i) & 1;
            let crc_bit = (crc >> 15) as u8;
            crc <<= 1;
            if data_bit != crc_bit {
                crc ^= poly;
            }
        }
    }
    crc
}

/// Frame a command, I/O flag included, ready for the bus.
pub fn encode_command(
    opcode: Opcode,
    p1: u8,
    p2: u16,
    data: &[u8],
) -> Result<Vec<u8, MAX_COMMAND_LEN>, FrameError> {
    if data.len() > MAX_DATA_LEN {
        return Err(FrameError::TooLong);
    }
    let mut packet = Vec::new();
    let count = (COMMAND_OVERHEAD + data.len()) as u8;
    let p2 = p2.to_le_bytes();
    // Capacity is checked above, so none of these can fail.
    packet
        .extend_from_slice(&[IoFlag::Command as u8, count, opcode as u8, p1, p2[0], p2[1]])
        .map_err(|_| FrameError::TooLong)?;
    packet
        .extend_from_slice(data)
        .map_err(|_| FrameError::TooLong)?;
    let crc = crc16(&packet[1..]);
    packet
        .extend_from_slice(&crc.to_le_bytes())
        .map_err(|_| FrameError::TooLong)?;
    Ok(packet)
}

/// Parse a framed command, I/O flag included. Inverse of [`encode_command`].
pub fn decode_command(raw: &[u8]) -> Result<Command<'_>, FrameError> {
    if raw.len() < 1 + COMMAND_OVERHEAD {
        return Err(FrameError::ShortRead);
    }
    if raw[0] != IoFlag::Command as u8 {
        return Err(FrameError::LengthMismatch { status: None });
    }
    let packet = &raw[1..];
    let count = packet[0] as usize;
    if count > packet.len() {
        return Err(FrameError::ShortRead);
    }
    if count < COMMAND_OVERHEAD {
        return Err(FrameError::LengthMismatch { status: None });
    }
    let packet = &packet[..count];
    check_crc(packet)?;
    let opcode =
        Opcode::try_from(packet[1]).map_err(|_| FrameError::LengthMismatch { status: None })?;
    Ok(Command {
        opcode,
        p1: packet[2],
        p2: u16::from_le_bytes([packet[3], packet[4]]),
        data: &packet[5..count - 2],
    })
}

/// Frame a response payload the way the chip does.
pub fn encode_response(payload: &[u8]) -> Result<Vec<u8, MAX_RESPONSE_LEN>, FrameError> {
    let mut packet = Vec::new();
    packet
        .push((payload.len() + 3) as u8)
        .map_err(|_| FrameError::TooLong)?;
    packet
        .extend_from_slice(payload)
        .map_err(|_| FrameError::TooLong)?;
    let crc = crc16(&packet);
    packet
        .extend_from_slice(&crc.to_le_bytes())
        .map_err(|_| FrameError::TooLong)?;
    Ok(packet)
}

/// Validate a response packet and return its payload.
///
/// A valid 4-byte reply where `expected_len` bytes of data were wanted is the chip
/// reporting an error, and comes back as `LengthMismatch` carrying the status.
pub fn decode_response(raw: &[u8], expected_len: usize) -> Result<&[u8], FrameError> {
    if raw.len() < STATUS_REPLY_LEN {
        return Err(FrameError::ShortRead);
    }
    let count = raw[0] as usize;
    if count < STATUS_REPLY_LEN {
        return Err(FrameError::LengthMismatch { status: None });
    }
    if count > raw.len() {
        return Err(FrameError::ShortRead);
    }
    let packet = &raw[..count];
    check_crc(packet)?;
    if count != expected_len + 3 {
        let status = (count == STATUS_REPLY_LEN).then(|| StatusCode::from(packet[1]));
        return Err(FrameError::LengthMismatch { status });
    }
    Ok(&packet[1..count - 2])
}

/// Take an `Info` payload, which has no envelope to check.
pub fn decode_raw(raw: &[u8], expected_len: usize) -> Result<&[u8], FrameError> {
    raw.get(..expected_len).ok_or(FrameError::ShortRead)
}

fn check_crc(packet: &[u8]) -> Result<(), FrameError> {
    let (body, crc) = packet.split_at(packet.len() - 2);
    if crc16(body).to_le_bytes() != [crc[0], crc[1]] {
        return Err(FrameError::CrcMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_matches_chip_replies() {
        // Wake reply and a plain success reply, as captured from the chip.
        assert_eq!(crc16(&[0x04, 0x11]).to_le_bytes(), [0x33, 0x43]);
        assert_eq!(crc16(&[0x04, 0x00]).to_le_bytes(), [0x03, 0x40]);
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn crc_is_deterministic_and_sensitive() {
        let data = b"(C) 2020 Foundation Devices Inc.";
        assert_eq!(crc16(data), crc16(data));
        let mut flipped = *data;
        flipped[7] ^= 0x10;
        assert_ne!(crc16(data), crc16(&flipped));
    }

    #[test]
    fn encode_command_layout() {
        let packet = encode_command(Opcode::GenDig, 0x02, 0x0003, &[]).unwrap();
        assert_eq!(&packet[..6], &[0x77, 0x07, 0x15, 0x02, 0x03, 0x00]);
        assert_eq!(packet.len(), 8);
        let crc = crc16(&packet[1..6]).to_le_bytes();
        assert_eq!(&packet[6..], &crc);
    }

    #[test]
    fn command_round_trip() {
        let data: [u8; 77] = core::array::from_fn(|i| i as u8);
        for (opcode, p1, p2, data) in [
            (Opcode::Nonce, 0u8, 0u16, &data[..20]),
            (Opcode::CheckMac, 0x01, 0x0001, &data[..]),
            (Opcode::Read, 0x82, 0x0148, &data[..0]),
            (Opcode::Write, 0x82, 0x0218, &data[..64]),
        ] {
            let packet = encode_command(opcode, p1, p2, data).unwrap();
            let cmd = decode_command(&packet).unwrap();
            assert_eq!(
                cmd,
                Command {
                    opcode,
                    p1,
                    p2,
                    data
                }
            );
        }
    }

    #[test]
    fn oversized_command_is_rejected() {
        let data = [0u8; MAX_DATA_LEN + 1];
        assert_eq!(
            encode_command(Opcode::Write, 0, 0, &data),
            Err(FrameError::TooLong)
        );
    }

    #[test]
    fn decode_response_payload() {
        let packet = encode_response(&[1, 2, 3, 4]).unwrap();
        assert_eq!(decode_response(&packet, 4), Ok(&[1u8, 2, 3, 4][..]));
    }

    #[test]
    fn decode_response_status_reply() {
        assert_eq!(decode_response(&[0x04, 0x00, 0x03, 0x40], 1), Ok(&[0u8][..]));
        assert_eq!(
            decode_response(&[0x04, 0x11, 0x33, 0x43], 32),
            Err(FrameError::LengthMismatch {
                status: Some(StatusCode::AfterWake)
            })
        );
    }

    #[test]
    fn decode_response_short_and_corrupt() {
        let packet = encode_response(&[0xaa; 32]).unwrap();
        assert_eq!(decode_response(&packet[..2], 32), Err(FrameError::ShortRead));
        assert_eq!(decode_response(&packet[..20], 32), Err(FrameError::ShortRead));

        let mut corrupt = packet.clone();
        corrupt[5] ^= 1;
        assert_eq!(decode_response(&corrupt, 32), Err(FrameError::CrcMismatch));

        let wrong = encode_response(&[0xaa; 4]).unwrap();
        assert_eq!(
            decode_response(&wrong, 32),
            Err(FrameError::LengthMismatch { status: None })
        );
    }

    #[test]
    fn trailing_bytes_after_packet_are_ignored() {
        let mut raw = [0u8; 12];
        let packet = encode_response(&[9, 8, 7, 6]).unwrap();
        raw[..packet.len()].copy_from_slice(&packet);
        assert_eq!(decode_response(&raw, 4), Ok(&[9u8, 8, 7, 6][..]));
    }

    #[test]
    fn info_is_raw() {
        assert!(!Opcode::Info.has_envelope());
        assert!(Opcode::Read.has_envelope());
        assert_eq!(decode_raw(&[0, 0, 0x60, 0x02], INFO_LEN), Ok(&[0u8, 0, 0x60, 0x02][..]));
        assert_eq!(decode_raw(&[0, 0], INFO_LEN), Err(FrameError::ShortRead));
    }
}
