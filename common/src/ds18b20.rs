use crate::onewire::{crc8, OneWireBus, Rom, RomSearch, SKIP_ROM};
use crate::reading::{celsius_to_fahrenheit, DISCONNECTED_C, DISCONNECTED_F};
use crate::sensor::{SensorError, TemperatureProbe};

const CONVERT_T: u8 = 0x44;
const READ_SCRATCHPAD: u8 = 0xBE;

/// Family codes of probes sharing the DS18B20 scratchpad layout.
const DS18B20: u8 = 0x28;
const DS1822: u8 = 0x22;
const DS1825: u8 = 0x3B;

/// Digital thermometer driver for DS18B20 probes on a one-wire bus.
///
/// Probes are addressed by their position in ROM search order, like the Arduino
/// Dallas library does. Only the last good reading of the current conversion is
/// kept, so a probe that is unplugged and plugged back in is picked up again after
/// the next [`TemperatureProbe::request_temperatures`].
pub struct Ds18b20<B> {
    bus: B,
    /// Index and Celsius value read since the last conversion.
    last: Option<(usize, f32)>,
}

impl<B: OneWireBus> Ds18b20<B> {
    const SCRATCHPAD_LEN: usize = 9;

    /// Conversion time at 12 bit resolution.
    const CONVERSION_MS: u32 = 750;

    pub fn new(bus: B) -> Self {
        Self { bus, last: None }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    fn is_supported(rom: &Rom) -> bool {
        matches!(rom.family_code(), DS18B20 | DS1822 | DS1825)
    }

    /// ROM code of the supported probe at `index` in search order.
    pub fn address(&mut self, index: usize) -> Result<Option<Rom>, SensorError> {
        let mut search = RomSearch::new();
        let mut seen = 0;
        while let Some(rom) = search.next_device(&mut self.bus)? {
            if !Self::is_supported(&rom) {
                continue;
            }
            if seen == index {
                return Ok(Some(rom));
            }
            seen += 1;
        }
        Ok(None)
    }

    /// Reads and checks the scratchpad of one probe.
    pub fn read_scratchpad(&mut self, rom: &Rom) -> Result<[u8; 9], SensorError> {
        if !self.bus.select(rom)? {
            return Err(SensorError::Bus("no presence pulse"));
        }
        self.bus.write_byte(READ_SCRATCHPAD)?;

        let mut scratchpad = [0u8; Self::SCRATCHPAD_LEN];
        self.bus.read_bytes(&mut scratchpad)?;

        // A floating data line reads as all ones, a shorted one as all zeros.
        // The zero case even passes the CRC.
        if scratchpad.iter().all(|byte| *byte == 0) {
            return Err(SensorError::Bus("scratchpad reads all zeros"));
        }
        if crc8(&scratchpad[..8]) != scratchpad[8] {
            return Err(SensorError::Bus("scratchpad CRC mismatch"));
        }

        Ok(scratchpad)
    }

    fn read_celsius(&mut self, index: usize) -> Result<f32, SensorError> {
        let rom = self.address(index)?.ok_or(SensorError::Disconnected)?;
        let scratchpad = self.read_scratchpad(&rom)?;
        Ok(scratchpad_to_celsius(&scratchpad))
    }
}

/// Decodes the temperature register, honouring the configured resolution.
///
/// Undefined low bits are masked off at 9, 10 and 11 bit resolution.
pub fn scratchpad_to_celsius(scratchpad: &[u8; 9]) -> f32 {
    let raw = i16::from_le_bytes([scratchpad[0], scratchpad[1]]);

    let raw = match scratchpad[4] & 0x60 {
        0x00 => raw & !0x07,
        0x20 => raw & !0x03,
        0x40 => raw & !0x01,
        _ => raw,
    };

    f32::from(raw) / 16.0
}

impl<B: OneWireBus> TemperatureProbe for Ds18b20<B> {
    fn begin(&mut self) -> Result<usize, SensorError> {
        let mut search = RomSearch::new();
        let mut count = 0;
        while let Some(rom) = search.next_device(&mut self.bus)? {
            if Self::is_supported(&rom) {
                log::debug!("Found DS18B20 family probe {}", rom);
                count += 1;
            } else {
                log::debug!("Ignoring one-wire device {}", rom);
            }
        }
        Ok(count)
    }

    fn request_temperatures(&mut self) -> Result<(), SensorError> {
        self.last = None;

        // An empty bus is not an error here: the following read reports the probe
        // as disconnected.
        if self.bus.reset()? {
            self.bus.write_byte(SKIP_ROM)?;
            self.bus.write_byte(CONVERT_T)?;
            self.bus.delay_ms(Self::CONVERSION_MS);
        }
        Ok(())
    }

    fn temp_c_by_index(&mut self, index: usize) -> f32 {
        if let Some((cached, celsius)) = self.last {
            if cached == index {
                return celsius;
            }
        }

        match self.read_celsius(index) {
            Ok(celsius) => {
                self.last = Some((index, celsius));
                celsius
            }
            Err(e) => {
                log::debug!("DS18B20 #{} unreadable: {}", index, e);
                DISCONNECTED_C
            }
        }
    }

    fn temp_f_by_index(&mut self, index: usize) -> f32 {
        let celsius = self.temp_c_by_index(index);
        if celsius == DISCONNECTED_C {
            DISCONNECTED_F
        } else {
            celsius_to_fahrenheit(celsius)
        }
    }
}

#[cfg(test)]
use crate::onewire::fake::{FakeBus, FakeDevice};

#[cfg(test)]
fn scratchpad(raw: u16, config: u8) -> [u8; 9] {
    let [lsb, msb] = raw.to_le_bytes();
    let mut scratchpad = [lsb, msb, 0x4B, 0x46, config, 0xFF, 0x0C, 0x10, 0];
    scratchpad[8] = crc8(&scratchpad[..8]);
    scratchpad
}

#[test]
fn test_scratchpad_to_celsius() {
    assert_eq!(scratchpad_to_celsius(&scratchpad(0x07D0, 0x7F)), 125.0);
    assert_eq!(scratchpad_to_celsius(&scratchpad(0x0191, 0x7F)), 25.0625);
    assert_eq!(scratchpad_to_celsius(&scratchpad(0x0000, 0x7F)), 0.0);
    assert_eq!(scratchpad_to_celsius(&scratchpad(0xFF5E, 0x7F)), -10.125);
    assert_eq!(scratchpad_to_celsius(&scratchpad(0xFC90, 0x7F)), -55.0);
}

#[test]
fn test_scratchpad_resolution_masking() {
    // 9 bit mode: 25.0625 degrades to 25.0
    assert_eq!(scratchpad_to_celsius(&scratchpad(0x0191, 0x1F)), 25.0);
    // 11 bit mode keeps 1/8 degree steps
    assert_eq!(scratchpad_to_celsius(&scratchpad(0x0193, 0x5F)), 25.125);
}

#[test]
fn test_request_temperatures_converts_and_waits() {
    let mut sensor = Ds18b20::new(FakeBus::new(vec![FakeDevice::ds18b20(0x01, 21.5)]));
    sensor.request_temperatures().unwrap();

    assert_eq!(sensor.bus().conversions, 1);
    assert_eq!(sensor.bus().delays, vec![750]);
}

#[test]
fn test_read_first_probe() {
    let mut sensor = Ds18b20::new(FakeBus::new(vec![FakeDevice::ds18b20(0x01, 21.5)]));

    assert_eq!(sensor.begin().unwrap(), 1);
    sensor.request_temperatures().unwrap();
    assert_eq!(sensor.temp_c_by_index(0), 21.5);
    assert!((sensor.temp_f_by_index(0) - 70.7).abs() < 0.001);
}

#[test]
fn test_probes_are_indexed_in_search_order() {
    let mut sensor = Ds18b20::new(FakeBus::new(vec![
        FakeDevice::ds18b20(0x01, 18.0),
        FakeDevice::ds18b20(0x02, -4.5),
    ]));

    assert_eq!(sensor.begin().unwrap(), 2);

    // The search takes the 0 branch first, so the probe with serial 0x02 comes first.
    assert_eq!(sensor.address(0).unwrap().unwrap().0[1], 0x02);
    assert_eq!(sensor.temp_c_by_index(0), -4.5);
    assert_eq!(sensor.temp_c_by_index(1), 18.0);
    assert_eq!(sensor.temp_c_by_index(2), DISCONNECTED_C);
}

#[test]
fn test_fahrenheit_reuses_the_celsius_read() {
    let mut sensor = Ds18b20::new(FakeBus::new(vec![FakeDevice::ds18b20(0x01, 21.5)]));
    sensor.request_temperatures().unwrap();

    assert_eq!(sensor.temp_c_by_index(0), 21.5);
    let resets = sensor.bus().resets;

    // The scratchpad going bad afterwards must not leak into the same reading.
    sensor.bus.devices[0].scratchpad[8] ^= 0x5A;
    assert!((sensor.temp_f_by_index(0) - 70.7).abs() < 0.001);
    assert_eq!(sensor.bus().resets, resets);

    // A new conversion reads the bus again.
    sensor.request_temperatures().unwrap();
    assert_eq!(sensor.temp_c_by_index(0), DISCONNECTED_C);
    assert_eq!(sensor.temp_f_by_index(0), DISCONNECTED_F);
}

#[test]
fn test_empty_bus_reports_sentinel() {
    let mut sensor = Ds18b20::new(FakeBus::new(Vec::new()));

    assert_eq!(sensor.begin().unwrap(), 0);
    sensor.request_temperatures().unwrap();
    assert_eq!(sensor.bus().conversions, 0);
    assert_eq!(sensor.temp_c_by_index(0), DISCONNECTED_C);
    assert_eq!(sensor.temp_f_by_index(0), DISCONNECTED_F);
}

#[test]
fn test_corrupt_scratchpad_reports_sentinel() {
    let mut device = FakeDevice::ds18b20(0x01, 21.5);
    device.scratchpad[8] ^= 0x5A;
    let mut sensor = Ds18b20::new(FakeBus::new(vec![device]));

    assert_eq!(sensor.temp_c_by_index(0), DISCONNECTED_C);
}

#[test]
fn test_unsupported_family_is_skipped() {
    let mut other = FakeDevice::ds18b20(0x01, 0.0);
    other.rom.0[0] = 0x01; // DS2401 silicon serial number
    other.rom.0[7] = crc8(&other.rom.0[..7]);
    let mut sensor = Ds18b20::new(FakeBus::new(vec![other, FakeDevice::ds18b20(0x07, 30.0)]));

    assert_eq!(sensor.begin().unwrap(), 1);
    assert_eq!(sensor.temp_c_by_index(0), 30.0);
}
