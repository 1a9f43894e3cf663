// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Data zone layout of the secure element.

/// SE block size in bytes.
pub const BLOCK_SIZE: usize = 32;

/// Slot numbers for the SE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Slot {
    /// Key 0: HMAC key usable without authorization. Used for the "plain" mix-in.
    Plain = 0,
    PairingSecret = 1,
    PinStretch = 2,
    PinHash = 3,
    /// Using this key bumps counter 0, which is what charges each PIN attempt.
    PinAttempt = 4,
    LastGood = 5,
    MatchCount = 6,
    SupplyChain = 7,
    Seed = 9,
    UserFirmwarePubkey = 10,
    FirmwareTimestamp = 11,
    FirmwareHash = 14,
}

impl Slot {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            0 => Self::Plain,
            1 => Self::PairingSecret,
            2 => Self::PinStretch,
            3 => Self::PinHash,
            4 => Self::PinAttempt,
            5 => Self::LastGood,
            6 => Self::MatchCount,
            7 => Self::SupplyChain,
            9 => Self::Seed,
            10 => Self::UserFirmwarePubkey,
            11 => Self::FirmwareTimestamp,
            14 => Self::FirmwareHash,
            _ => return None,
        })
    }

    /// Slots the host may read in clear through the dispatch boundary.
    pub fn is_public(self) -> bool {
        matches!(
            self,
            Self::LastGood
                | Self::MatchCount
                | Self::SupplyChain
                | Self::UserFirmwarePubkey
                | Self::FirmwareTimestamp
                | Self::FirmwareHash
        )
    }
}

/// Monotonic counter charged by every PIN attempt.
pub const ATTEMPT_COUNTER: u16 = 0;

/// Starting match count written at provisioning.
pub const INITIAL_MATCH_COUNT: u32 = 1024;

/// Low bits of the match count the chip's comparator ignores.
pub const MATCH_COUNT_QUANTUM: u32 = 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_ids_round_trip() {
        for id in 0..16 {
            if let Some(slot) = Slot::from_id(id) {
                assert_eq!(slot.id(), id);
            }
        }
        assert_eq!(Slot::from_id(8), None);
    }

    #[test]
    fn secrets_are_not_public() {
        assert!(!Slot::PairingSecret.is_public());
        assert!(!Slot::PinHash.is_public());
        assert!(!Slot::Seed.is_public());
        assert!(Slot::LastGood.is_public());
    }
}
