// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Host side of the ATECC608 secure element on the Passport main board.
//!
//! The layers stack bottom up: [`swi`] turns bytes into UART pulses, [`frame`]
//! and [`link`] carry commands with CRC checks and retries, [`session`] adds
//! the authenticated chip operations, and [`pin`] runs the PIN attempt state
//! machine over an [`record::AttemptRecord`]. [`dispatch`] is the entry point
//! the firmware exposes to the rest of the system.

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod link;
#[cfg(feature = "logging")]
pub mod logging;
pub mod pin;
pub mod provision;
pub mod record;
pub mod secrets;
pub mod session;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod slots;
pub mod swi;
