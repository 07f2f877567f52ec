//! One-wire bus access and device discovery.
//!
//! The [`OneWireBus`] trait covers the four timed primitives every one-wire master
//! offers (reset, write bit, read bit, delay). Byte framing, the Dallas CRC and the
//! ROM search are implemented on top of it so they can be used with any bus.

use crate::sensor::SensorError;

pub const SEARCH_ROM: u8 = 0xF0;
pub const MATCH_ROM: u8 = 0x55;
pub const SKIP_ROM: u8 = 0xCC;

/// A one-wire bus master.
///
/// Bits travel least significant first.
pub trait OneWireBus {
    /// Sends a reset pulse. Returns `true` if at least one device answered with a
    /// presence pulse.
    fn reset(&mut self) -> Result<bool, SensorError>;

    fn write_bit(&mut self, bit: bool) -> Result<(), SensorError>;

    fn read_bit(&mut self) -> Result<bool, SensorError>;

    /// Blocks for `ms` milliseconds.
    fn delay_ms(&mut self, ms: u32);

    fn write_byte(&mut self, byte: u8) -> Result<(), SensorError> {
        for i in 0..8 {
            self.write_bit((byte >> i) & 1 == 1)?;
        }
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, SensorError> {
        let mut byte = 0;
        for i in 0..8 {
            if self.read_bit()? {
                byte |= 1 << i;
            }
        }
        Ok(byte)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), SensorError> {
        bytes.iter().try_for_each(|byte| self.write_byte(*byte))
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), SensorError> {
        for byte in buf.iter_mut() {
            *byte = self.read_byte()?;
        }
        Ok(())
    }

    /// Addresses a single device: reset, MATCH ROM and the 64 bit ROM code.
    fn select(&mut self, rom: &Rom) -> Result<bool, SensorError> {
        if !self.reset()? {
            return Ok(false);
        }
        self.write_byte(MATCH_ROM)?;
        self.write_bytes(&rom.0)?;
        Ok(true)
    }
}

/// Dallas/Maxim CRC-8 (polynomial x^8 + x^5 + x^4 + 1, reflected).
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        let mut byte = byte;
        for _ in 0..8 {
            let mix = (crc ^ byte) & 0x01;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8C;
            }
            byte >>= 1;
        }
    }
    crc
}

/// A 64 bit ROM code: family code, 48 bit serial, CRC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Rom(pub [u8; 8]);

impl Rom {
    pub fn family_code(&self) -> u8 {
        self.0[0]
    }

    pub fn is_valid(&self) -> bool {
        crc8(&self.0[..7]) == self.0[7]
    }
}

impl core::fmt::Display for Rom {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// State of an ongoing ROM search (Maxim application note 187).
///
/// Every call to [`RomSearch::next_device`] walks the ROM tree once and returns the next
/// device, until all devices have been reported.
#[derive(Debug, Default)]
pub struct RomSearch {
    rom: [u8; 8],
    last_discrepancy: u8,
    last_device: bool,
}

impl RomSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_device<B: OneWireBus + ?Sized>(
        &mut self,
        bus: &mut B,
    ) -> Result<Option<Rom>, SensorError> {
        if self.last_device {
            return Ok(None);
        }

        if !bus.reset()? {
            *self = Self::default();
            return Ok(None);
        }
        bus.write_byte(SEARCH_ROM)?;

        let mut last_zero = 0u8;
        for bit_number in 1..=64u8 {
            let id_bit = bus.read_bit()?;
            let cmp_id_bit = bus.read_bit()?;

            // Nobody is left on this branch.
            if id_bit && cmp_id_bit {
                *self = Self::default();
                return Ok(None);
            }

            let byte = usize::from((bit_number - 1) / 8);
            let mask = 1u8 << ((bit_number - 1) % 8);

            let direction = if id_bit != cmp_id_bit {
                id_bit
            } else {
                let direction = if bit_number < self.last_discrepancy {
                    self.rom[byte] & mask != 0
                } else {
                    bit_number == self.last_discrepancy
                };
                if !direction {
                    last_zero = bit_number;
                }
                direction
            };

            if direction {
                self.rom[byte] |= mask;
            } else {
                self.rom[byte] &= !mask;
            }
            bus.write_bit(direction)?;
        }

        self.last_discrepancy = last_zero;
        if self.last_discrepancy == 0 {
            self.last_device = true;
        }

        let rom = Rom(self.rom);
        if !rom.is_valid() {
            *self = Self::default();
            return Err(SensorError::Bus("ROM code CRC mismatch"));
        }
        Ok(Some(rom))
    }
}

/// Simulated devices on a wired-AND bus, driven bit by bit.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;

    pub struct FakeDevice {
        pub rom: Rom,
        pub scratchpad: [u8; 9],
    }

    impl FakeDevice {
        /// A DS18B20 in 12 bit mode reporting `celsius`.
        pub fn ds18b20(serial: u8, celsius: f32) -> Self {
            let mut rom = [0x28, serial, 0x4C, 0x0A, 0x60, 0x16, 0x04, 0];
            rom[7] = crc8(&rom[..7]);

            let raw = ((celsius * 16.0) as i16).to_le_bytes();
            let mut scratchpad = [raw[0], raw[1], 0x4B, 0x46, 0x7F, 0xFF, 0x0C, 0x10, 0];
            scratchpad[8] = crc8(&scratchpad[..8]);

            Self {
                rom: Rom(rom),
                scratchpad,
            }
        }
    }

    enum State {
        Idle,
        RomCommand,
        Search { bit: usize, phase: u8 },
        MatchRom { bit: usize },
        Function,
        ReadScratchpad { bit: usize },
    }

    pub struct FakeBus {
        pub devices: Vec<FakeDevice>,
        pub conversions: usize,
        pub resets: usize,
        pub delays: Vec<u32>,
        state: State,
        active: Vec<bool>,
        byte: u8,
        bits: u8,
    }

    fn bit_of(bytes: &[u8], n: usize) -> bool {
        (bytes[n / 8] >> (n % 8)) & 1 == 1
    }

    impl FakeBus {
        pub fn new(devices: Vec<FakeDevice>) -> Self {
            let active = vec![false; devices.len()];
            Self {
                devices,
                conversions: 0,
                resets: 0,
                delays: Vec::new(),
                state: State::Idle,
                active,
                byte: 0,
                bits: 0,
            }
        }

        /// Wired-AND of one bit across every selected device. An idle bus reads high.
        fn wired_and(&self, f: impl Fn(&FakeDevice) -> bool) -> bool {
            self.devices
                .iter()
                .zip(&self.active)
                .filter(|(_, active)| **active)
                .all(|(device, _)| f(device))
        }

        fn push_bit(&mut self, bit: bool) -> Option<u8> {
            if bit {
                self.byte |= 1 << self.bits;
            }
            self.bits += 1;
            if self.bits == 8 {
                let byte = self.byte;
                self.byte = 0;
                self.bits = 0;
                Some(byte)
            } else {
                None
            }
        }
    }

    impl OneWireBus for FakeBus {
        fn reset(&mut self) -> Result<bool, SensorError> {
            self.resets += 1;
            self.active.iter_mut().for_each(|active| *active = true);
            self.state = State::RomCommand;
            self.byte = 0;
            self.bits = 0;
            Ok(!self.devices.is_empty())
        }

        fn write_bit(&mut self, bit: bool) -> Result<(), SensorError> {
            match self.state {
                State::RomCommand => match self.push_bit(bit) {
                    Some(SEARCH_ROM) => self.state = State::Search { bit: 0, phase: 0 },
                    Some(MATCH_ROM) => self.state = State::MatchRom { bit: 0 },
                    Some(SKIP_ROM) => self.state = State::Function,
                    Some(_) => self.state = State::Idle,
                    None => {}
                },
                State::Search { bit: n, phase: 2 } => {
                    for (device, active) in self.devices.iter().zip(self.active.iter_mut()) {
                        if bit_of(&device.rom.0, n) != bit {
                            *active = false;
                        }
                    }
                    self.state = if n == 63 {
                        State::Idle
                    } else {
                        State::Search { bit: n + 1, phase: 0 }
                    };
                }
                State::MatchRom { bit: n } => {
                    for (device, active) in self.devices.iter().zip(self.active.iter_mut()) {
                        if bit_of(&device.rom.0, n) != bit {
                            *active = false;
                        }
                    }
                    self.state = if n == 63 {
                        State::Function
                    } else {
                        State::MatchRom { bit: n + 1 }
                    };
                }
                State::Function => match self.push_bit(bit) {
                    Some(0x44) => {
                        self.conversions += 1;
                        self.state = State::Idle;
                    }
                    Some(0xBE) => self.state = State::ReadScratchpad { bit: 0 },
                    Some(_) => self.state = State::Idle,
                    None => {}
                },
                _ => {}
            }
            Ok(())
        }

        fn read_bit(&mut self) -> Result<bool, SensorError> {
            let bit = match self.state {
                State::Search { bit: n, phase: 0 } => {
                    self.state = State::Search { bit: n, phase: 1 };
                    self.wired_and(|device| bit_of(&device.rom.0, n))
                }
                State::Search { bit: n, phase: 1 } => {
                    self.state = State::Search { bit: n, phase: 2 };
                    self.wired_and(|device| !bit_of(&device.rom.0, n))
                }
                State::ReadScratchpad { bit: n } if n < 72 => {
                    self.state = State::ReadScratchpad { bit: n + 1 };
                    self.wired_and(|device| bit_of(&device.scratchpad, n))
                }
                _ => true,
            };
            Ok(bit)
        }

        fn delay_ms(&mut self, ms: u32) {
            self.delays.push(ms);
        }
    }
}

#[test]
fn test_crc8_check_value() {
    assert_eq!(crc8(b"123456789"), 0xA1);
    assert_eq!(crc8(&[]), 0);
}

#[test]
fn test_rom_validation_and_display() {
    let device = fake::FakeDevice::ds18b20(0x01, 20.0);
    assert!(device.rom.is_valid());
    assert_eq!(device.rom.family_code(), 0x28);
    assert!(device.rom.to_string().starts_with("28:01:4C"));

    let mut broken = device.rom;
    broken.0[3] ^= 0xFF;
    assert!(!broken.is_valid());
}

#[test]
fn test_byte_framing_is_lsb_first() {
    let mut bus = fake::FakeBus::new(vec![fake::FakeDevice::ds18b20(0x01, 20.0)]);
    assert!(bus.reset().unwrap());
    // SKIP ROM followed by CONVERT T, written bit by bit through `write_byte`.
    bus.write_byte(SKIP_ROM).unwrap();
    bus.write_byte(0x44).unwrap();
    assert_eq!(bus.conversions, 1);
}

#[test]
fn test_search_finds_every_device() {
    use fake::{FakeBus, FakeDevice};

    let mut bus = FakeBus::new(vec![
        FakeDevice::ds18b20(0x01, 20.0),
        FakeDevice::ds18b20(0x02, 21.0),
        FakeDevice::ds18b20(0x03, 22.0),
    ]);
    let expected: Vec<Rom> = bus.devices.iter().map(|device| device.rom).collect();

    let mut search = RomSearch::new();
    let mut found = Vec::new();
    while let Some(rom) = search.next_device(&mut bus).unwrap() {
        found.push(rom);
    }

    assert_eq!(found.len(), 3);
    for rom in expected {
        assert!(found.contains(&rom));
    }
    // The search is exhausted until it is restarted.
    assert_eq!(search.next_device(&mut bus).unwrap(), None);
}

#[test]
fn test_search_on_empty_bus() {
    let mut bus = fake::FakeBus::new(Vec::new());
    assert_eq!(RomSearch::new().next_device(&mut bus).unwrap(), None);
}
