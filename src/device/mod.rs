//! Device drivers.
//!
//! Every sensor is read through [`SensorDevice`], so the capture loop does
//! not care whether samples come from a serial port, an I2C bus or the
//! simulator.

mod i2c;
mod serial;
mod simulated;

pub use i2c::I2cAmbient;
pub use serial::{spectral_frame, SerialSpectral};
pub use simulated::SimulatedDevice;

use std::time::{Duration, Instant};

use crate::{
    config::{DriverConfig, SensorConfig},
    control::Controls,
    error::{LoggerError, Result},
    sensor::SensorKind,
};

/// An opened sensor.
pub trait SensorDevice: Send {
    fn kind(&self) -> SensorKind;

    /// Block until the next native sample is available and return its raw
    /// bytes. The slice is only valid until the next call.
    fn read_sample(&mut self) -> Result<&[u8]>;

    /// Called right before a burst starts. Drivers drop anything buffered
    /// while the controller sat at the burst boundary.
    fn start_burst(&mut self) -> Result<()> {
        Ok(())
    }

    /// Apply new sensitivity settings. Devices without such controls
    /// accept and ignore them.
    fn set_controls(&mut self, controls: Controls) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Open the device described by `config`.
pub fn open_device(config: &SensorConfig) -> Result<Box<dyn SensorDevice>> {
    let kind = config.kind;
    match &config.driver {
        DriverConfig::Simulated => Ok(Box::new(SimulatedDevice::open(config))),
        DriverConfig::Serial { path, baud_rate } => {
            if kind != SensorKind::Spectral {
                return Err(LoggerError::device(kind, "serial driver only reads the spectral sensor"));
            }
            Ok(Box::new(SerialSpectral::open(path, *baud_rate)?))
        }
        DriverConfig::I2c { bus, address } => {
            if kind != SensorKind::Ambient {
                return Err(LoggerError::device(kind, "i2c driver only reads the ambient sensor"));
            }
            Ok(Box::new(I2cAmbient::open(bus, *address, config.rate_hz())?))
        }
    }
}

/// Sleeps just long enough to hold a fixed sample period.
#[derive(Debug)]
pub struct Pacer {
    period: Duration,
    next_due: Option<Instant>,
}

impl Pacer {
    pub fn new(rate_hz: f64) -> Self {
        Pacer {
            period: Duration::from_secs_f64(1.0 / rate_hz),
            next_due: None,
        }
    }

    /// Forget the schedule; the next tick is one period after the next
    /// call to [`Pacer::wait`].
    pub fn restart(&mut self) {
        self.next_due = None;
    }

    /// Wait for the next tick; the first tick is one period after the first
    /// call. If the caller fell behind by more than a period, the schedule
    /// restarts from now instead of bursting.
    pub fn wait(&mut self) {
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now + self.period);
        if due > now {
            spin_sleep::sleep(due - now);
            self.next_due = Some(due + self.period);
        } else if now - due > self.period {
            self.next_due = Some(now + self.period);
        } else {
            self.next_due = Some(due + self.period);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn pacer_holds_rate() {
        let mut pacer = Pacer::new(200.0);
        let start = Instant::now();
        for _ in 0..21 {
            pacer.wait();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(95), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(250), "{elapsed:?}");
    }

    #[test]
    fn serial_driver_rejects_wrong_sensor() {
        let mut config = SensorConfig::simulated(SensorKind::World);
        config.driver = DriverConfig::Serial {
            path: PathBuf::from("/dev/null"),
            baud_rate: 115_200,
        };
        assert!(matches!(
            open_device(&config),
            Err(LoggerError::DeviceError { .. })
        ));
    }

    #[test]
    fn missing_serial_port_is_a_device_error() {
        let mut config = SensorConfig::simulated(SensorKind::Spectral);
        config.driver = DriverConfig::Serial {
            path: PathBuf::from("/nonexistent/ttyACM9"),
            baud_rate: 115_200,
        };
        assert!(matches!(
            open_device(&config),
            Err(LoggerError::DeviceError {
                sensor: SensorKind::Spectral,
                ..
            })
        ));
    }
}
