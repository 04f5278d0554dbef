//! Ambient light sensor: a 12-bit ADC behind a Linux `/dev/i2c-N` bus.

use log::debug;
use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    os::fd::AsRawFd,
    path::Path,
};

use super::{Pacer, SensorDevice};
use crate::{
    control::Controls,
    error::{LoggerError, Result},
    sensor::SensorKind,
};

/// `I2C_SLAVE` from `linux/i2c-dev.h`.
const I2C_SLAVE: libc::c_ulong = 0x0703;

/// Continuous conversion, 12-bit resolution.
const CONTINUOUS_12_BIT: u8 = 0x10;

const DATA_REGISTER: u8 = 0x00;

pub struct I2cAmbient {
    bus: File,
    pacer: Pacer,
    sample: [u8; 2],
}

impl I2cAmbient {
    pub fn open(bus_path: &Path, address: u16, rate_hz: f64) -> Result<Self> {
        let device_error = |e: std::io::Error| {
            LoggerError::device(SensorKind::Ambient, format!("{bus_path:?}: {e}"))
        };
        let mut bus = OpenOptions::new()
            .read(true)
            .write(true)
            .open(bus_path)
            .map_err(device_error)?;

        let ret = unsafe { libc::ioctl(bus.as_raw_fd(), I2C_SLAVE as _, address as libc::c_ulong) };
        if ret < 0 {
            return Err(device_error(std::io::Error::last_os_error()));
        }
        bus.write_all(&[CONTINUOUS_12_BIT]).map_err(device_error)?;
        debug!("ambient : opened {bus_path:?} at address {address:#04x}");

        Ok(I2cAmbient {
            bus,
            pacer: Pacer::new(rate_hz),
            sample: [0; 2],
        })
    }
}

/// Convert the two data bytes (MSB first) of a 12-bit conversion into a
/// signed reading.
pub fn adc_reading(data: [u8; 2]) -> i16 {
    let raw = (((data[0] & 0x0F) as i16) << 8) | data[1] as i16;
    if raw > 2047 {
        raw - 4096
    } else {
        raw
    }
}

impl SensorDevice for I2cAmbient {
    fn kind(&self) -> SensorKind {
        SensorKind::Ambient
    }

    fn read_sample(&mut self) -> Result<&[u8]> {
        self.pacer.wait();
        let mut data = [0u8; 2];
        self.bus
            .write_all(&[DATA_REGISTER])
            .and_then(|_| self.bus.read_exact(&mut data))
            .map_err(|e| LoggerError::device(SensorKind::Ambient, e))?;
        self.sample = adc_reading(data).to_le_bytes();
        Ok(&self.sample)
    }

    fn start_burst(&mut self) -> Result<()> {
        self.pacer.restart();
        Ok(())
    }

    fn set_controls(&mut self, _controls: Controls) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
