/// Celsius value the Dallas driver reports when no probe answered.
pub const DISCONNECTED_C: f32 = -127.0;

/// Fahrenheit counterpart of [`DISCONNECTED_C`].
pub const DISCONNECTED_F: f32 = -196.6;

/// Converts a Celsius temperature to Fahrenheit.
pub fn celsius_to_fahrenheit(celsius: f32) -> f32 {
    celsius * 1.8 + 32.0
}

/// One temperature sample.
///
/// Produced once per tick and consumed right away by the payload encoder;
/// nothing keeps readings around.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reading {
    pub celsius: f32,
    pub fahrenheit: f32,
    /// Monotonic milliseconds since boot.
    pub timestamp_ms: u64,
}

impl Reading {
    pub fn new(celsius: f32, fahrenheit: f32, timestamp_ms: u64) -> Self {
        Self {
            celsius,
            fahrenheit,
            timestamp_ms,
        }
    }

    /// Builds a reading from Celsius alone, deriving Fahrenheit.
    pub fn from_celsius(celsius: f32, timestamp_ms: u64) -> Self {
        Self::new(celsius, celsius_to_fahrenheit(celsius), timestamp_ms)
    }
}

#[test]
fn test_celsius_to_fahrenheit() {
    assert_eq!(celsius_to_fahrenheit(0.0), 32.0);
    assert!((celsius_to_fahrenheit(100.0) - 212.0).abs() < 0.001);
    assert!((celsius_to_fahrenheit(DISCONNECTED_C) - DISCONNECTED_F).abs() < 0.01);
}

#[test]
fn test_reading_from_celsius() {
    let reading = Reading::from_celsius(21.5, 1234);
    assert_eq!(reading.celsius, 21.5);
    assert!((reading.fahrenheit - 70.7).abs() < 0.001);
    assert_eq!(reading.timestamp_ms, 1234);
}
