// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixed chip requirements and PIN policy constants.

/// Normal single-wire baud rate required by the chip.
pub const SE_BAUD: u32 = 230400;

/// Line-low time of the wake token. The wake byte is clocked at half baud, then we
/// wait this long before talking. Closest to the 2.5 ms high-to-data time.
pub const WAKE_DELAY_MS: u32 = 3;

/// How many times a response read is polled before giving up.
pub const RESPONSE_RETRIES: usize = 100;

/// Pause between two response polls.
pub const RESPONSE_POLL_MS: u32 = 1;

/// Pulse reads without a single byte of data before the bus reports a timeout.
pub const PULSE_POLL_LIMIT: usize = 2000;

/// Attempts at the pairing CheckMac before giving up.
pub const PAIR_UNLOCK_ATTEMPTS: usize = 3;

/// Longest PIN, in bytes.
pub const MAX_PIN_LEN: usize = 32;

/// Length of the wrapped seed secret.
pub const SECRET_LEN: usize = 72;

/// Attempts granted after every good login.
pub const MAX_TARGET_ATTEMPTS: u32 = 21;

/// HMAC rounds in the chip for each PIN attempt. Costs about 8ms per round.
pub const KDF_ITER_PIN: usize = 8;

/// Largest buffer accepted at the dispatch boundary.
pub const MAX_DISPATCH_LEN: usize = 1024;

/// Upper bound of the random delay before each dispatched call.
pub const DISPATCH_JITTER_MS: u32 = 10;

/// Upper bound of the random delay at cold boot.
pub const BOOT_JITTER_MS: u32 = 50;

/// Settle time after each provisioning write or lock.
pub const PROVISION_SETTLE_MS: u32 = 100;

/// UART setup of the single-wire link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwiConfig {
    /// Peripheral clock feeding the UART baud generator.
    pub master_clock: u32,
    pub baud: u32,
    pub wake_delay_ms: u32,
}

impl Default for SwiConfig {
    fn default() -> Self {
        // MCK: 164MHz
        // Clock frequency is divided by 2 because of the default `h32mxdiv` PMC setting
        Self {
            master_clock: 164000000 / 2,
            baud: SE_BAUD,
            wake_delay_ms: WAKE_DELAY_MS,
        }
    }
}

impl SwiConfig {
    /// Baud rate used while the wake token is on the line.
    pub fn wake_baud(&self) -> u32 {
        self.baud / 2
    }
}
