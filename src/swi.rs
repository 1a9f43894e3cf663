// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Single-wire interface to the secure element, bit-banged over a UART.
//!
//! Every bit on the wire is one UART frame: a short low pulse for `0`, and a
//! frame with only the start bit low for `1`. Bytes go LSB first. The UART runs
//! 7N1 at 230400 baud, half-duplex, with a hardware receive timeout.

use {
    crate::{
        config::{SwiConfig, PULSE_POLL_LIMIT},
        error::BusTimeout,
        frame::IoFlag,
        link::Bus,
    },
    embedded_hal::blocking::delay::DelayMs,
};

/// UART frame that encodes a `0` bit.
pub const BIT0: u8 = 0x7d;

/// UART frame that encodes a `1` bit.
pub const BIT1: u8 = 0x7f;

/// The UART behind the single wire.
///
/// Frames are 7 bits wide. A port built on an 8-bit UART shifts on the way in and
/// sets the top bit on the way out.
pub trait SwiPort {
    fn set_baud(&mut self, master_clock: u32, baud: u32);
    fn set_tx(&mut self, enabled: bool);
    fn set_rx(&mut self, enabled: bool);
    /// Blocks until the transmitter can take the frame.
    fn write_byte(&mut self, byte: u8);
    /// Next received frame, or `None` once the hardware receive timeout fired.
    fn read_byte(&mut self) -> Option<u8>;
}

pub fn encode_bit(bit: bool) -> u8 {
    if bit {
        BIT1
    } else {
        BIT0
    }
}

/// `None` for frames that are neither bit code: idle line, echo garbage, noise.
pub fn decode_pulse(pulse: u8) -> Option<bool> {
    let pulse = pulse & 0x7f;
    if (pulse ^ BIT1) < 2 {
        Some(true)
    } else if pulse == BIT0 {
        Some(false)
    } else {
        None
    }
}

/// Expand `data` into pulses, 8 per byte. Returns how many pulses were written.
pub fn serialize(data: &[u8], out: &mut [u8]) -> usize {
    let mut n = 0;
    for (byte, pulses) in data.iter().zip(out.chunks_exact_mut(8)) {
        for (i, pulse) in pulses.iter_mut().enumerate() {
            *pulse = encode_bit(byte & (1 << i) != 0);
        }
        n += 8;
    }
    n
}

/// Collapse pulses back into bytes.
///
/// Junk before the first bit code is skipped. Decoding stops at the first junk
/// frame after that, and a trailing partial byte is dropped. Returns the number of
/// whole bytes written to `out`.
pub fn deserialize(pulses: &[u8], out: &mut [u8]) -> usize {
    let mut bits = pulses
        .iter()
        .map(|p| decode_pulse(*p))
        .skip_while(Option::is_none)
        .map_while(|b| b);

    let mut n = 0;
    for byte in out.iter_mut() {
        let mut value = 0u8;
        for i in 0..8 {
            match bits.next() {
                Some(true) => value |= 1 << i,
                Some(false) => {}
                None => return n,
            }
        }
        *byte = value;
        n += 1;
    }
    n
}

/// Bit-level driver for the chip's single wire.
pub struct BitBus<P, D> {
    port: P,
    delay: D,
    config: SwiConfig,
}

impl<P: SwiPort, D: DelayMs<u32>> BitBus<P, D> {
    pub fn new(mut port: P, delay: D, config: SwiConfig) -> Self {
        port.set_baud(config.master_clock, config.baud);
        Self {
            port,
            delay,
            config,
        }
    }

    pub fn release(self) -> (P, D) {
        (self.port, self.delay)
    }

    fn send_bits(&mut self, data: &[u8]) {
        self.port.set_rx(false);
        self.port.set_tx(true);

        for byte in data {
            for i in 0..8 {
                self.port.write_byte(encode_bit(byte & (1 << i) != 0));
            }
        }
    }

    /// Wait for the first bit code, skipping junk. Times out on a quiet line.
    fn first_bit(&mut self) -> Result<bool, BusTimeout> {
        for _ in 0..PULSE_POLL_LIMIT {
            match self.port.read_byte().map(decode_pulse) {
                None => return Err(BusTimeout),
                Some(Some(bit)) => return Ok(bit),
                Some(None) => continue,
            }
        }
        Err(BusTimeout)
    }

    fn next_bit(&mut self) -> Option<bool> {
        self.port.read_byte().and_then(decode_pulse)
    }
}

impl<P: SwiPort, D: DelayMs<u32>> Bus for BitBus<P, D> {
    fn wake(&mut self) {
        self.port.set_rx(false);
        self.port.set_tx(true);

        // Hold the line low long enough by sending a zero at half speed.
        self.port
            .set_baud(self.config.master_clock, self.config.wake_baud());
        self.port.write_byte(0x00);
        self.delay.delay_ms(self.config.wake_delay_ms);

        self.port
            .set_baud(self.config.master_clock, self.config.baud);
    }

    fn idle(&mut self) {
        self.send_bits(&[IoFlag::Idle as u8]);
    }

    fn sleep(&mut self) {
        self.send_bits(&[IoFlag::Sleep as u8]);
    }

    fn send(&mut self, packet: &[u8]) {
        self.send_bits(packet);
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, BusTimeout> {
        self.send_bits(&[IoFlag::Transmit as u8]);

        self.port.set_tx(false);
        self.port.set_rx(true);

        let mut first = Some(self.first_bit()?);
        for (n, byte) in buf.iter_mut().enumerate() {
            let mut value = 0u8;
            for i in 0..8 {
                let bit = match first.take() {
                    Some(bit) => bit,
                    None => match self.next_bit() {
                        Some(bit) => bit,
                        None => return Ok(n),
                    },
                };
                if bit {
                    value |= 1 << i;
                }
            }
            *byte = value;
        }
        Ok(buf.len())
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::config::SE_BAUD, std::collections::VecDeque, std::vec::Vec};

    #[derive(Debug, PartialEq)]
    enum Event {
        Baud(u32),
        Tx(bool),
        Rx(bool),
        Write(u8),
    }

    #[derive(Default)]
    struct ScriptedPort {
        events: Vec<Event>,
        incoming: VecDeque<u8>,
    }

    impl ScriptedPort {
        fn written(&self) -> Vec<u8> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    Event::Write(b) => Some(*b),
                    _ => None,
                })
                .collect()
        }
    }

    impl SwiPort for ScriptedPort {
        fn set_baud(&mut self, _master_clock: u32, baud: u32) {
            self.events.push(Event::Baud(baud));
        }

        fn set_tx(&mut self, enabled: bool) {
            self.events.push(Event::Tx(enabled));
        }

        fn set_rx(&mut self, enabled: bool) {
            self.events.push(Event::Rx(enabled));
        }

        fn write_byte(&mut self, byte: u8) {
            self.events.push(Event::Write(byte));
        }

        fn read_byte(&mut self) -> Option<u8> {
            self.incoming.pop_front()
        }
    }

    #[derive(Default)]
    struct CountingDelay(u32);

    impl DelayMs<u32> for CountingDelay {
        fn delay_ms(&mut self, ms: u32) {
            self.0 += ms;
        }
    }

    fn make_bus(incoming: &[u8]) -> BitBus<ScriptedPort, CountingDelay> {
        let port = ScriptedPort {
            incoming: incoming.iter().copied().collect(),
            ..Default::default()
        };
        let mut bus = BitBus::new(port, CountingDelay::default(), SwiConfig::default());
        bus.port.events.clear();
        bus
    }

    fn pulses(data: &[u8]) -> Vec<u8> {
        let mut out = std::vec![0u8; data.len() * 8];
        serialize(data, &mut out);
        out
    }

    #[test]
    fn every_byte_survives_the_pulse_codec() {
        for b in 0..=255u8 {
            let mut out = [0u8; 1];
            assert_eq!(deserialize(&pulses(&[b]), &mut out), 1);
            assert_eq!(out[0], b);
        }
    }

    #[test]
    fn junk_around_the_pulses_is_tolerated() {
        for b in 0..=255u8 {
            let mut stream = std::vec![0x00, 0x55, 0x13];
            stream.extend(pulses(&[b, !b]));
            // Trailing partial byte, then an idle line.
            stream.extend([BIT1, BIT0, BIT1, 0x00, 0x00]);
            let mut out = [0u8; 4];
            assert_eq!(deserialize(&stream, &mut out), 2);
            assert_eq!(&out[..2], &[b, !b]);
        }
    }

    #[test]
    fn both_one_codes_decode_as_one() {
        assert_eq!(decode_pulse(0x7f), Some(true));
        assert_eq!(decode_pulse(0x7e), Some(true));
        assert_eq!(decode_pulse(0xff), Some(true));
        assert_eq!(decode_pulse(0x7d), Some(false));
        assert_eq!(decode_pulse(0x00), None);
    }

    #[test]
    fn wake_drops_baud_for_the_wake_token() {
        let mut bus = make_bus(&[]);
        bus.wake();
        assert_eq!(
            bus.port.events,
            [
                Event::Rx(false),
                Event::Tx(true),
                Event::Baud(SE_BAUD / 2),
                Event::Write(0x00),
                Event::Baud(SE_BAUD),
            ]
        );
        assert_eq!(bus.delay.0, 3);
    }

    #[test]
    fn send_is_lsb_first() {
        let mut bus = make_bus(&[]);
        bus.send(&[0x01]);
        assert_eq!(
            bus.port.written(),
            [BIT1, BIT0, BIT0, BIT0, BIT0, BIT0, BIT0, BIT0]
        );
    }

    #[test]
    fn idle_and_sleep_flags() {
        let mut bus = make_bus(&[]);
        bus.idle();
        bus.sleep();
        assert_eq!(bus.port.written(), pulses(&[0xbb, 0xcc]));
    }

    #[test]
    fn receive_asks_for_transmit_and_decodes() {
        let mut incoming = std::vec![0x00, 0x00];
        incoming.extend(pulses(&[0x04, 0x11, 0x33, 0x43]));
        let mut bus = make_bus(&incoming);
        let mut buf = [0u8; 8];
        assert_eq!(bus.receive(&mut buf), Ok(4));
        assert_eq!(&buf[..4], &[0x04, 0x11, 0x33, 0x43]);
        assert_eq!(bus.port.written(), pulses(&[0x88]));
    }

    #[test]
    fn receive_stops_when_buffer_is_full() {
        let mut bus = make_bus(&pulses(&[1, 2, 3]));
        let mut buf = [0u8; 2];
        assert_eq!(bus.receive(&mut buf), Ok(2));
        assert_eq!(buf, [1, 2]);
    }

    #[test]
    fn quiet_line_is_a_timeout() {
        let mut bus = make_bus(&[]);
        let mut buf = [0u8; 4];
        assert_eq!(bus.receive(&mut buf), Err(BusTimeout));

        let mut bus = make_bus(&[0x00; PULSE_POLL_LIMIT + 10]);
        assert_eq!(bus.receive(&mut buf), Err(BusTimeout));
    }
}
