use crate::reading::{Reading, DISCONNECTED_C, DISCONNECTED_F};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SensorError {
    /// The driver returned its disconnected sentinel.
    #[error("probe disconnected")]
    Disconnected,

    #[error("one-wire bus fault: {0}")]
    Bus(&'static str),
}

/// A temperature driver in the style of the Arduino Dallas library.
///
/// To be implemented for each probe type. Reads never fail outright: a probe that
/// cannot be read reports [`DISCONNECTED_C`] instead.
pub trait TemperatureProbe {
    /// Initializes the bus and returns how many devices answered.
    fn begin(&mut self) -> Result<usize, SensorError>;

    /// Starts a conversion on every device on the bus and waits until it is done.
    fn request_temperatures(&mut self) -> Result<(), SensorError>;

    /// Temperature of the device at `index` in Celsius.
    fn temp_c_by_index(&mut self, index: usize) -> f32;

    /// Temperature of the device at `index` in Fahrenheit.
    fn temp_f_by_index(&mut self, index: usize) -> f32;
}

impl<P: TemperatureProbe + ?Sized> TemperatureProbe for Box<P> {
    fn begin(&mut self) -> Result<usize, SensorError> {
        (**self).begin()
    }

    fn request_temperatures(&mut self) -> Result<(), SensorError> {
        (**self).request_temperatures()
    }

    fn temp_c_by_index(&mut self, index: usize) -> f32 {
        (**self).temp_c_by_index(index)
    }

    fn temp_f_by_index(&mut self, index: usize) -> f32 {
        (**self).temp_f_by_index(index)
    }
}

/// Reads the first probe on the bus and turns the sentinel into an error.
pub struct SensorReader<P> {
    probe: P,
}

impl<P: TemperatureProbe> SensorReader<P> {
    /// Index of the probe that gets published.
    const PROBE_INDEX: usize = 0;

    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    /// Initializes the sensor bus.
    ///
    /// An empty bus is not an error here; the first reading will simply report the
    /// probe as disconnected.
    pub fn begin(&mut self) -> Result<usize, SensorError> {
        let devices = self.probe.begin()?;
        if devices == 0 {
            log::warn!("No temperature probe found on the bus");
        } else {
            log::info!("Temperature sensor initialized, {} device(s) on the bus", devices);
        }
        Ok(devices)
    }

    /// Requests a conversion and reads back the first probe.
    pub fn request_reading(&mut self, timestamp_ms: u64) -> Result<Reading, SensorError> {
        self.probe.request_temperatures()?;

        let celsius = self.probe.temp_c_by_index(Self::PROBE_INDEX);
        if celsius == DISCONNECTED_C {
            return Err(SensorError::Disconnected);
        }
        let fahrenheit = self.probe.temp_f_by_index(Self::PROBE_INDEX);
        if fahrenheit == DISCONNECTED_F {
            return Err(SensorError::Disconnected);
        }

        Ok(Reading::new(celsius, fahrenheit, timestamp_ms))
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }
}

#[test]
fn test_reader_reports_sentinel_as_disconnected() {
    use crate::sim::ScriptedProbe;

    let mut reader = SensorReader::new(ScriptedProbe::new([DISCONNECTED_C, 20.0]));
    assert_eq!(reader.request_reading(0), Err(SensorError::Disconnected));

    let reading = reader.request_reading(10).unwrap();
    assert_eq!(reading.celsius, 20.0);
    assert!((reading.fahrenheit - 68.0).abs() < 0.001);
    assert_eq!(reading.timestamp_ms, 10);
    assert_eq!(reader.probe().conversions(), 2);
}

#[test]
fn test_reader_propagates_bus_faults() {
    use crate::sim::ScriptedProbe;

    let mut probe = ScriptedProbe::new([21.0]);
    probe.fail_next_conversion("no presence pulse");
    let mut reader = SensorReader::new(probe);

    assert_eq!(
        reader.request_reading(0),
        Err(SensorError::Bus("no presence pulse"))
    );
    assert_eq!(reader.request_reading(1).unwrap().celsius, 21.0);
}

#[test]
fn test_reader_rejects_half_disconnected_readings() {
    /// Answers the Celsius read, drops off the bus before the Fahrenheit one.
    struct Flaky;

    impl TemperatureProbe for Flaky {
        fn begin(&mut self) -> Result<usize, SensorError> {
            Ok(1)
        }

        fn request_temperatures(&mut self) -> Result<(), SensorError> {
            Ok(())
        }

        fn temp_c_by_index(&mut self, _index: usize) -> f32 {
            21.5
        }

        fn temp_f_by_index(&mut self, _index: usize) -> f32 {
            DISCONNECTED_F
        }
    }

    let mut reader = SensorReader::new(Flaky);
    assert_eq!(reader.request_reading(0), Err(SensorError::Disconnected));
}
