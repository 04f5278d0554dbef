//! A stand-in for real hardware that produces plausible samples at the
//! configured native rate. Brightness follows the applied gain and exposure
//! so adaptive control has something to act on.

use rand::{rngs::StdRng, Rng, SeedableRng};

use super::{Pacer, SensorDevice};
use crate::{
    config::SensorConfig,
    control::Controls,
    error::Result,
    sensor::{SensorKind, SPECTRAL_MESSAGE_BYTES, SPECTRAL_MOTION_SAMPLES},
};

pub struct SimulatedDevice {
    kind: SensorKind,
    pacer: Pacer,
    rng: StdRng,
    controls: Controls,
    rows: usize,
    cols: usize,
    max_frame_bytes: usize,
    sequence: u64,
    sample: Vec<u8>,
}

impl SimulatedDevice {
    pub fn open(config: &SensorConfig) -> Self {
        let (rows, cols) = config
            .frame
            .map(|f| (f.rows, f.cols))
            .unwrap_or((0, 0));
        SimulatedDevice {
            kind: config.kind,
            pacer: Pacer::new(config.rate_hz()),
            rng: StdRng::from_entropy(),
            controls: Controls {
                gain: config.initial_gain,
                exposure: config.initial_exposure,
            },
            rows,
            cols,
            max_frame_bytes: config.max_frame_bytes,
            sequence: 0,
            sample: Vec::new(),
        }
    }

    /// Scene brightness as an 8-bit level for the current settings.
    fn level(&self) -> u8 {
        (self.controls.gain * self.controls.exposure / 40.0).clamp(0.0, 255.0) as u8
    }

    fn fill_spectral(&mut self) {
        let seq = self.sequence;
        let mut msg = Vec::with_capacity(SPECTRAL_MESSAGE_BYTES);
        for channel in 0..10u16 {
            let count = 1000 + channel * 50 + self.rng.gen_range(0..20);
            msg.extend_from_slice(&count.to_le_bytes());
        }
        for channel in 0..2u16 {
            msg.extend_from_slice(&(500 + channel).to_le_bytes());
        }
        // acceleration block, then angle block, each x/y/z interleaved
        for block in 0..2i16 {
            for i in 0..SPECTRAL_MOTION_SAMPLES as i16 {
                for axis in 0..3i16 {
                    let value = block * 1000 + axis * 100 + i + self.rng.gen_range(-3..=3);
                    msg.extend_from_slice(&value.to_le_bytes());
                }
            }
        }
        let temp = 24.0f32 + (seq % 10) as f32 * 0.1;
        msg.extend_from_slice(&temp.to_le_bytes());
        self.sample = msg;
    }

    fn fill_frame(&mut self) {
        let level = self.level();
        let (rows, cols) = (self.rows.max(1), self.cols.max(1));
        self.sample.resize(rows * cols, 0);
        for row in self.sample.chunks_exact_mut(cols) {
            let noise: i16 = self.rng.gen_range(-4..=4);
            row.fill((level as i16 + noise).clamp(0, 255) as u8);
        }
    }

    fn fill_compressed(&mut self) {
        let max = self.max_frame_bytes.max(8);
        let len = self.rng.gen_range(max / 4..=max / 2);
        self.sample.resize(len, 0);
        self.rng.fill(&mut self.sample[..]);
    }

    fn fill_ambient(&mut self) {
        let reading: i16 = self.rng.gen_range(-2048..=2047);
        self.sample = reading.to_le_bytes().to_vec();
    }
}

impl SensorDevice for SimulatedDevice {
    fn kind(&self) -> SensorKind {
        self.kind
    }

    fn read_sample(&mut self) -> Result<&[u8]> {
        self.pacer.wait();
        match self.kind {
            SensorKind::Spectral => self.fill_spectral(),
            SensorKind::World => self.fill_frame(),
            SensorKind::Pupil => self.fill_compressed(),
            SensorKind::Ambient => self.fill_ambient(),
        }
        self.sequence += 1;
        Ok(&self.sample)
    }

    fn start_burst(&mut self) -> Result<()> {
        self.pacer.restart();
        Ok(())
    }

    fn set_controls(&mut self, controls: Controls) -> Result<()> {
        self.controls = controls;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
