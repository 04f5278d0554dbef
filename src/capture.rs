//! One burst of acquisition for one sensor.

use log::{debug, trace, warn};
use std::time::{Duration, Instant};

use crate::{
    config::{FrameGeometry, RunConfig, SensorConfig},
    control::{mean_level, BinningDownsampler, Controls, Downsampler, GainExposureController, ProportionalAgc},
    device::SensorDevice,
    error::Result,
    ring_buffer::RingBuffer,
    sensor::{pack_prefixed, Framing, SensorKind},
};

/// What a finished burst looked like.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureReport {
    /// Valid samples left in the ring buffer.
    pub sample_count: u64,
    /// Samples read from the device, including any that were overwritten.
    pub captured: u64,
    /// `captured / elapsed`; diagnostic only.
    pub observed_rate: f64,
    pub elapsed: Duration,
}

/// Adaptive control state for sensors that have it.
struct AdaptiveControl {
    controller: Box<dyn GainExposureController>,
    interval: Duration,
    speed: f64,
    controls: Controls,
}

/// Reads one device into a ring buffer for a fixed wall-clock duration.
pub struct CaptureLoop {
    kind: SensorKind,
    device: Box<dyn SensorDevice>,
    framing: Framing,
    downsample: Option<(Box<dyn Downsampler>, FrameGeometry)>,
    control: Option<AdaptiveControl>,
    bursts: u64,
}

impl CaptureLoop {
    /// Build the loop with the default collaborators for the sensor: the
    /// world camera is binned and runs AGC, the others store samples as-is.
    pub fn new(device: Box<dyn SensorDevice>, sensor: &SensorConfig, run: &RunConfig) -> Self {
        let mut capture = CaptureLoop {
            kind: sensor.kind,
            device,
            framing: sensor.layout().framing,
            downsample: None,
            control: None,
            bursts: 0,
        };
        if let Some(geometry) = sensor.frame.filter(|g| g.downsample > 1) {
            capture = capture.with_downsampler(Box::new(BinningDownsampler), geometry);
        }
        if sensor.kind.has_adaptive_control() {
            capture = capture.with_control(
                Box::new(ProportionalAgc::default()),
                run.control_interval(),
                run.control_speed,
                Controls {
                    gain: sensor.initial_gain,
                    exposure: sensor.initial_exposure,
                },
            );
        }
        capture
    }

    pub fn with_downsampler(mut self, downsampler: Box<dyn Downsampler>, geometry: FrameGeometry) -> Self {
        self.downsample = Some((downsampler, geometry));
        self
    }

    pub fn with_control(
        mut self,
        controller: Box<dyn GainExposureController>,
        interval: Duration,
        speed: f64,
        controls: Controls,
    ) -> Self {
        self.control = Some(AdaptiveControl {
            controller,
            interval: interval.max(Duration::from_millis(1)),
            speed,
            controls,
        });
        self
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    /// Current gain/exposure, if this sensor runs adaptive control.
    pub fn controls(&self) -> Option<Controls> {
        self.control.as_ref().map(|c| c.controls)
    }

    /// Push the initial controls to the device.
    pub fn prime(&mut self) -> Result<()> {
        if let Some(control) = &self.control {
            self.device.set_controls(control.controls)?;
        }
        Ok(())
    }

    /// Fill `ring` with samples until `target` has elapsed. The buffer is
    /// reset first, so only samples from this burst are ever valid.
    pub fn run(&mut self, ring: &mut RingBuffer, target: Duration) -> Result<CaptureReport> {
        ring.reset();
        self.device.start_burst()?;

        let start = Instant::now();
        let mut next_control = self.control.as_ref().map(|c| start + c.interval);

        while start.elapsed() < target {
            let sample = self.device.read_sample()?;
            match (&self.downsample, self.framing) {
                (Some((downsampler, geometry)), _) => {
                    let binned =
                        downsampler.downsample(sample, geometry.rows, geometry.cols, geometry.downsample);
                    ring.push(&binned);
                }
                (None, Framing::LengthPrefixed) => {
                    pack_prefixed(sample, ring.next_slot());
                }
                (None, Framing::Fixed) => ring.push(sample),
            }

            if let (Some(due), Some(control)) = (next_control.as_mut(), self.control.as_mut()) {
                let now = Instant::now();
                if now >= *due {
                    let signal = ring.last().map(mean_level).unwrap_or(0.0);
                    let next = control.controller.adjust(signal, control.controls, control.speed);
                    if next != control.controls {
                        trace!("{} : signal {signal:.1} -> {next:?}", self.kind);
                        self.device.set_controls(next)?;
                        control.controls = next;
                    }
                    while *due <= now {
                        *due += control.interval;
                    }
                }
            }
        }

        self.bursts += 1;
        let elapsed = start.elapsed();
        let captured = ring.sample_count();
        if ring.overwritten() > 0 {
            warn!(
                "{} : burst overran its buffer, {} oldest samples overwritten",
                self.kind,
                ring.overwritten()
            );
        }
        let report = CaptureReport {
            sample_count: ring.len() as u64,
            captured,
            observed_rate: captured as f64 / elapsed.as_secs_f64(),
            elapsed,
        };
        debug!(
            "{} : burst {} captured {} samples in {:?} ({:.2} Hz)",
            self.kind, self.bursts, report.sample_count, report.elapsed, report.observed_rate
        );
        Ok(report)
    }

    pub fn close(&mut self) -> Result<()> {
        self.device.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimulatedDevice;

    fn capture(kind: SensorKind, rate: f64) -> (CaptureLoop, SensorConfig, RunConfig) {
        let mut sensor = SensorConfig::simulated(kind);
        sensor.rate_hz = Some(rate);
        if kind == SensorKind::World {
            sensor.frame = Some(FrameGeometry {
                rows: 48,
                cols: 64,
                downsample: 4,
            });
        }
        let run = RunConfig {
            control_interval_ms: 20,
            control_speed: 0.5,
            ..RunConfig::default()
        };
        let device = Box::new(SimulatedDevice::open(&sensor));
        (CaptureLoop::new(device, &sensor, &run), sensor, run)
    }

    #[test]
    fn count_stays_within_capacity_and_rate_is_close() {
        let (mut capture, sensor, _) = capture(SensorKind::World, 200.0);
        let target = Duration::from_millis(300);
        let mut ring = RingBuffer::new(sensor.capacity(target), sensor.layout().bytes_per_sample);

        let report = capture.run(&mut ring, target).unwrap();
        assert!(report.sample_count as usize <= ring.capacity());
        assert_eq!(report.sample_count, ring.len() as u64);
        assert!(report.elapsed >= target);
        assert!(
            (report.observed_rate - 200.0).abs() < 40.0,
            "{}",
            report.observed_rate
        );
    }

    #[test]
    fn world_frames_are_stored_downsampled() {
        let (mut capture, sensor, _) = capture(SensorKind::World, 100.0);
        let layout = sensor.layout();
        let mut ring = RingBuffer::new(20, layout.bytes_per_sample);
        capture.run(&mut ring, Duration::from_millis(50)).unwrap();
        assert_eq!(ring.last().unwrap().len(), 12 * 16);
    }

    #[test]
    fn adaptive_control_moves_settings() {
        let (mut capture, sensor, _) = capture(SensorKind::World, 200.0);
        capture.prime().unwrap();
        let before = capture.controls().unwrap();
        let mut ring = RingBuffer::new(100, sensor.layout().bytes_per_sample);
        capture.run(&mut ring, Duration::from_millis(150)).unwrap();
        // the default settings leave the scene dark, so exposure goes up first
        let after = capture.controls().unwrap();
        assert!(after.exposure > before.exposure);
        assert_eq!(after.gain, before.gain);
    }

    #[test]
    fn sensors_without_control_have_none() {
        let (capture, _, _) = capture(SensorKind::Ambient, 10.0);
        assert!(capture.controls().is_none());
    }

    #[test]
    fn pupil_frames_are_length_prefixed() {
        let (mut capture, sensor, _) = capture(SensorKind::Pupil, 200.0);
        let mut ring = RingBuffer::new(50, sensor.layout().bytes_per_sample);
        capture.run(&mut ring, Duration::from_millis(40)).unwrap();
        let frame = crate::sensor::unpack_prefixed(ring.last().unwrap()).unwrap();
        assert!(!frame.is_empty() && frame.len() <= sensor.max_frame_bytes);
    }

    #[test]
    fn small_buffer_wraps_without_failing() {
        let (mut capture, sensor, _) = capture(SensorKind::Ambient, 500.0);
        let mut ring = RingBuffer::new(5, sensor.layout().bytes_per_sample);
        let report = capture.run(&mut ring, Duration::from_millis(60)).unwrap();
        assert_eq!(report.sample_count, 5);
        assert!(report.captured > 5);
    }
}
