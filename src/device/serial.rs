//! The spectral sensor streams fixed-size messages over USB serial, each
//! wrapped in `<` and `>`.

use log::{debug, warn};
use nom::{
    bytes::streaming::{tag, take},
    sequence::delimited,
    IResult,
};
use serial2::SerialPort;
use std::{path::Path, time::Duration};

use super::SensorDevice;
use crate::{
    control::Controls,
    error::{LoggerError, Result},
    sensor::{SensorKind, SPECTRAL_MESSAGE_BYTES},
};

const FRAME_START: &[u8] = b"<";
const FRAME_END: &[u8] = b">";

/// Parse one framed message off the front of `input`. Returns
/// `Err(Incomplete)` when more bytes are needed.
pub fn spectral_frame(input: &[u8]) -> IResult<&[u8], &[u8]> {
    delimited(tag(FRAME_START), take(SPECTRAL_MESSAGE_BYTES), tag(FRAME_END))(input)
}

pub struct SerialSpectral {
    port: Option<SerialPort>,
    pending: Vec<u8>,
    message: Vec<u8>,
}

impl SerialSpectral {
    pub fn open(path: &Path, baud_rate: u32) -> Result<Self> {
        let mut port = SerialPort::open(path, baud_rate)
            .map_err(|e| LoggerError::device(SensorKind::Spectral, format!("{path:?}: {e}")))?;
        port.set_read_timeout(Duration::from_secs(2))
            .map_err(|e| LoggerError::device(SensorKind::Spectral, e))?;
        debug!("spectral : opened {path:?} at {baud_rate} baud");
        Ok(SerialSpectral {
            port: Some(port),
            pending: Vec::with_capacity(4 * SPECTRAL_MESSAGE_BYTES),
            message: vec![0; SPECTRAL_MESSAGE_BYTES],
        })
    }

    /// Try to cut one message out of the pending bytes. Garbage before a
    /// start delimiter is dropped, as is a start delimiter whose message is
    /// not closed properly.
    fn extract(&mut self) -> bool {
        loop {
            match self.pending.iter().position(|&b| b == FRAME_START[0]) {
                Some(0) => {}
                Some(skip) => {
                    self.pending.drain(..skip);
                }
                None => {
                    self.pending.clear();
                    return false;
                }
            }
            match spectral_frame(&self.pending) {
                Ok((rest, msg)) => {
                    self.message.copy_from_slice(msg);
                    let consumed = self.pending.len() - rest.len();
                    self.pending.drain(..consumed);
                    return true;
                }
                Err(nom::Err::Incomplete(_)) => return false,
                Err(_) => {
                    warn!("spectral : start delimiter not closed by end delimiter, resyncing");
                    self.pending.drain(..1);
                }
            }
        }
    }
}

impl SensorDevice for SerialSpectral {
    fn kind(&self) -> SensorKind {
        SensorKind::Spectral
    }

    fn read_sample(&mut self) -> Result<&[u8]> {
        let mut buffer = [0u8; 256];
        while !self.extract() {
            let port = self
                .port
                .as_mut()
                .ok_or_else(|| LoggerError::device(SensorKind::Spectral, "port closed"))?;
            let read_len = port
                .read(&mut buffer)
                .map_err(|e| LoggerError::device(SensorKind::Spectral, e))?;
            self.pending.extend_from_slice(&buffer[..read_len]);
        }
        Ok(&self.message)
    }

    fn start_burst(&mut self) -> Result<()> {
        self.pending.clear();
        if let Some(port) = &self.port {
            port.discard_input_buffer()
                .map_err(|e| LoggerError::device(SensorKind::Spectral, e))?;
        }
        Ok(())
    }

    fn set_controls(&mut self, _controls: Controls) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.port.take();
        Ok(())
    }
}
