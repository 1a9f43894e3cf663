// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! One-time config and lockdown of the chip.

use {
    crate::{
        config::PROVISION_SETTLE_MS,
        error::SeFailure,
        frame::crc16,
        link::{slot_address, Bus, SeLink, ZONE_CONFIG_32, ZONE_CONFIG_4, ZONE_DATA_32},
        secrets::RomSecrets,
        session::SessionCrypto,
        slots::{Slot, BLOCK_SIZE, INITIAL_MATCH_COUNT},
    },
    log::info,
    rand_core::{CryptoRng, RngCore},
    zeroize::Zeroizing,
};

/// Bytes [16..84) of chip config area.
pub(crate) const SE_CONFIG_1: [u8; 68] = [
    0xe1, 0x00, 0x61, 0x00, 0x00, 0x00, 0x8f, 0x80, 0x8f, 0x80, 0x8f, 0x43, 0xaf, 0x80, 0x00, 0x43,
    0x00, 0x43, 0x8f, 0x80, 0x00, 0x00, 0xc3, 0x43, 0x00, 0x43, 0xce, 0x4e, 0x00, 0x00, 0x00, 0x00,
    0x8f, 0x4e, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xf0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
];

/// Bytes [90..128) of chip config area.
pub(crate) const SE_CONFIG_2: [u8; 38] = [
    0x02, 0x15, 0x00, 0x00, 0x00, 0x00, 0x3c, 0x00, 0x5c, 0x00, 0xbc, 0x01, 0xfc, 0x01, 0xbc, 0x01,
    0x9c, 0x01, 0x9c, 0x01, 0xbc, 0x01, 0x3c, 0x00, 0xdc, 0x03, 0x9c, 0x01, 0xdc, 0x01, 0x3c, 0x00,
    0x3c, 0x00, 0xdc, 0x01, 0x3c, 0x00,
];

const CONFIG_LEN: usize = 128;

/// Lock byte value of a zone that can still be written.
const UNLOCKED: u8 = 0x55;

const LOCK_CONFIG: u8 = 0x00;
const LOCK_DATA_NO_CRC: u8 = 0x80 | 0x01;
const LOCK_SLOT: u8 = 0x02;

pub fn read_config<B: Bus>(link: &mut SeLink<B>) -> Result<[u8; CONFIG_LEN], SeFailure> {
    let mut config = [0u8; CONFIG_LEN];
    for (block, chunk) in config.chunks_mut(BLOCK_SIZE).enumerate() {
        link.read(ZONE_CONFIG_32, (block as u16) << 3, chunk)?;
    }
    Ok(config)
}

/// One-time config and lockdown of the chip.
///
/// Does nothing on a chip that is already locked, so it is safe to run at every
/// factory boot.
///
/// IMPORTANT: If they blocked the real chip, and provided a blank one for
/// us to write the (existing) pairing secret into, they would see the pairing
/// secret in cleartext. They could then restore original chip and access freely.
/// Only the factory image should ever call this.
pub fn setup_config<B: Bus, R: RngCore + CryptoRng>(
    link: &mut SeLink<B>,
    secrets: &RomSecrets,
    rng: &mut R,
) -> Result<(), SeFailure> {
    let mut config = read_config(link)?;
    link.delay_ms(PROVISION_SETTLE_MS);

    // Setup steps:
    // - write config zone data
    // - lock that
    // - write pairing secret (test it works)
    // - pick RNG value for the chip-only keys (and forget it)
    // - set all PIN values to known value (zeros)
    // - set all money secrets to known value (zeros)
    // - lock the data zone
    if config[87] == UNLOCKED {
        info!("provision: writing config zone");
        config[16..16 + SE_CONFIG_1.len()].copy_from_slice(&SE_CONFIG_1);
        config[90..90 + SE_CONFIG_2.len()].copy_from_slice(&SE_CONFIG_2);

        // Words 0..4 are serial and revision, word 21 holds the lock bytes.
        for word in (4..21).chain(22..32) {
            let start = word * 4;
            link.write(ZONE_CONFIG_4, word as u16, &config[start..start + 4])?;
        }
        link.delay_ms(PROVISION_SETTLE_MS);

        link.lock(LOCK_CONFIG, crc16(&config))?;
        link.delay_ms(PROVISION_SETTLE_MS);
    }

    if config[86] == UNLOCKED {
        info!("provision: writing data zone");
        let unlocked = u16::from_le_bytes([config[88], config[89]]);

        write_slot(link, unlocked, Slot::PairingSecret, &secrets.pairing_secret)?;

        let mut key = Zeroizing::new([0u8; BLOCK_SIZE]);
        rng.fill_bytes(key.as_mut_slice());
        write_slot(link, unlocked, Slot::PinStretch, key.as_slice())?;
        lock_slot(link, unlocked, Slot::PinStretch)?;

        rng.fill_bytes(key.as_mut_slice());
        write_slot(link, unlocked, Slot::PinAttempt, key.as_slice())?;
        lock_slot(link, unlocked, Slot::PinAttempt)?;

        write_slot(link, unlocked, Slot::PinHash, &[0; BLOCK_SIZE])?;
        write_slot(link, unlocked, Slot::LastGood, &[0; BLOCK_SIZE])?;
        write_slot(link, unlocked, Slot::FirmwareTimestamp, &[0; BLOCK_SIZE])?;
        write_slot(link, unlocked, Slot::FirmwareHash, &[0; BLOCK_SIZE])?;

        write_slot(link, unlocked, Slot::Seed, &[0; BLOCK_SIZE * 3])?;
        write_slot(link, unlocked, Slot::UserFirmwarePubkey, &[0; BLOCK_SIZE * 3])?;

        let mut match_count = [0u8; BLOCK_SIZE];
        match_count[0..4].copy_from_slice(&INITIAL_MATCH_COUNT.to_le_bytes());
        match_count[4..8].copy_from_slice(&INITIAL_MATCH_COUNT.to_le_bytes());
        write_slot(link, unlocked, Slot::MatchCount, &match_count)?;

        link.lock(LOCK_DATA_NO_CRC, 0)?;
        link.delay_ms(PROVISION_SETTLE_MS);
    }

    // The pairing secret has to work, or nothing else will.
    link.reset_chip();
    let mut se = SessionCrypto::new(link, secrets, rng);
    se.pair_unlock()
}

fn write_slot<B: Bus>(
    link: &mut SeLink<B>,
    unlocked: u16,
    slot: Slot,
    data: &[u8],
) -> Result<(), SeFailure> {
    if unlocked & (1 << slot.id()) == 0 {
        return Ok(());
    }
    for (block, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
        link.write(ZONE_DATA_32, slot_address(slot.id(), block as u8), chunk)?;
        link.delay_ms(PROVISION_SETTLE_MS);
    }
    Ok(())
}

fn lock_slot<B: Bus>(link: &mut SeLink<B>, unlocked: u16, slot: Slot) -> Result<(), SeFailure> {
    if unlocked & (1 << slot.id()) == 0 {
        return Ok(());
    }
    link.lock(LOCK_SLOT | (slot.id() << 2), 0)?;
    link.delay_ms(PROVISION_SETTLE_MS);
    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{secrets::test_secrets, sim::SimChip},
        rand::{rngs::StdRng, SeedableRng},
    };

    #[test]
    fn blank_chip_ends_up_locked_and_paired() {
        let secrets = test_secrets();
        let mut rng = StdRng::seed_from_u64(12);
        let mut link = SeLink::new(SimChip::blank(&secrets.serial_number));

        setup_config(&mut link, &secrets, &mut rng).unwrap();

        let chip = link.bus();
        let expected = SimChip::provisioned(&secrets, [0; 32], [0; 32]);
        assert_eq!(chip.config(), expected.config());
        assert_eq!(
            chip.slot_block(Slot::MatchCount, 0),
            expected.slot_block(Slot::MatchCount, 0)
        );
        assert_ne!(chip.slot_block(Slot::PinStretch, 0), [0; 32]);
        assert_ne!(
            chip.slot_block(Slot::PinStretch, 0),
            chip.slot_block(Slot::PinAttempt, 0)
        );
    }

    #[test]
    fn locked_chip_is_left_alone() {
        let secrets = test_secrets();
        let mut rng = StdRng::seed_from_u64(13);
        let mut link = SeLink::new(SimChip::provisioned(&secrets, [1; 32], [2; 32]));

        setup_config(&mut link, &secrets, &mut rng).unwrap();
        assert_eq!(link.bus().slot_block(Slot::PinStretch, 0), [1; 32]);
        assert_eq!(link.bus().slot_block(Slot::PinAttempt, 0), [2; 32]);
    }

    #[test]
    fn wrong_pairing_secret_is_caught() {
        let secrets = test_secrets();
        let mut other = secrets.clone();
        other.pairing_secret = [0x99; 32];
        let mut rng = StdRng::seed_from_u64(14);
        let mut link = SeLink::new(SimChip::provisioned(&other, [1; 32], [2; 32]));

        assert!(setup_config(&mut link, &secrets, &mut rng).is_err());
    }

    #[test]
    fn config_reads_back_serial() {
        let secrets = test_secrets();
        let mut link = SeLink::new(SimChip::blank(&secrets.serial_number));
        let config = read_config(&mut link).unwrap();
        assert_eq!(&config[0..4], &secrets.serial_number[0..4]);
        assert_eq!(&config[8..13], &secrets.serial_number[4..9]);
        assert_eq!(config[87], UNLOCKED);
    }
}
