use dallas_iot_common::onewire::OneWireBus;
use dallas_iot_common::SensorError;
use esp_idf_svc::hal::delay::FreeRtos;
use esp_idf_svc::hal::interrupt;

/// One-wire master bit-banged on a single open-drain GPIO.
///
/// Needs a pull-up on the data line (4.7k for the DS18B20). Slot timings are the
/// standard speed ones; every slot runs with interrupts disabled.
pub struct GpioBus {
    pin: i32,
}

impl GpioBus {
    pub fn new(pin: i32) -> Result<Self, SensorError> {
        use esp_idf_svc::sys::*;

        let result = unsafe {
            gpio_reset_pin(pin);
            gpio_set_direction(pin, gpio_mode_t_GPIO_MODE_INPUT_OUTPUT_OD);
            gpio_set_pull_mode(pin, gpio_pull_mode_t_GPIO_PULLUP_ONLY);
            gpio_set_level(pin, 1)
        };
        if result != ESP_OK {
            return Err(SensorError::Bus("GPIO setup failed"));
        }

        Ok(Self { pin })
    }

    fn low(&self) {
        unsafe {
            esp_idf_svc::sys::gpio_set_level(self.pin, 0);
        }
    }

    fn release(&self) {
        unsafe {
            esp_idf_svc::sys::gpio_set_level(self.pin, 1);
        }
    }

    fn sample(&self) -> bool {
        unsafe { esp_idf_svc::sys::gpio_get_level(self.pin) != 0 }
    }

    fn wait_us(us: u32) {
        unsafe {
            esp_idf_svc::sys::ets_delay_us(us);
        }
    }
}

impl OneWireBus for GpioBus {
    fn reset(&mut self) -> Result<bool, SensorError> {
        if !self.sample() {
            return Err(SensorError::Bus("data line held low"));
        }

        let presence = interrupt::free(|| {
            self.low();
            Self::wait_us(480);
            self.release();
            Self::wait_us(70);
            let presence = !self.sample();
            Self::wait_us(410);
            presence
        });

        Ok(presence)
    }

    fn write_bit(&mut self, bit: bool) -> Result<(), SensorError> {
        interrupt::free(|| {
            self.low();
            if bit {
                Self::wait_us(6);
                self.release();
                Self::wait_us(64);
            } else {
                Self::wait_us(60);
                self.release();
                Self::wait_us(10);
            }
        });
        Ok(())
    }

    fn read_bit(&mut self) -> Result<bool, SensorError> {
        let bit = interrupt::free(|| {
            self.low();
            Self::wait_us(6);
            self.release();
            Self::wait_us(9);
            let bit = self.sample();
            Self::wait_us(55);
            bit
        });
        Ok(bit)
    }

    fn delay_ms(&mut self, ms: u32) {
        FreeRtos::delay_ms(ms);
    }
}
