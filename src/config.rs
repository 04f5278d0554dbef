//! Run configuration.
//!
//! A [`RunConfig`] is read once (from a RON file, or built from defaults),
//! validated, and then handed by reference to every component. Nothing in
//! the crate reads sensor rates or shapes from anywhere else.

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    error::{LoggerError, Result},
    sensor::{SampleLayout, SensorKind},
};

/// Everything a run needs to know, shared by the orchestrator and every
/// controller it launches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Target length of one burst.
    pub burst_duration_ms: u64,
    /// How many bursts to capture before STOP.
    pub burst_count: u64,
    /// How long the orchestrator waits for every controller to post READY.
    pub ready_timeout_ms: u64,
    /// How long controllers get to exit after STOP before being killed.
    pub stop_grace_ms: u64,
    /// Sleep between polls of the rendezvous area.
    pub poll_interval_ms: u64,
    /// Cadence of adaptive gain/exposure control.
    pub control_interval_ms: u64,
    /// Speed setting handed to the gain/exposure controller, in `[0, 1)`.
    pub control_speed: f64,
    /// Directory receiving `run.ron`, segments and `chunk_<N>` files.
    pub output_dir: PathBuf,
    /// Directory holding the READY/GO/STOP marker areas.
    pub rendezvous_dir: PathBuf,
    pub sensors: Vec<SensorConfig>,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            burst_duration_ms: 10_000,
            burst_count: 1,
            ready_timeout_ms: 15_000,
            stop_grace_ms: 3_000,
            poll_interval_ms: 10,
            control_interval_ms: 250,
            control_speed: 0.95,
            output_dir: PathBuf::from("readings"),
            rendezvous_dir: std::env::temp_dir().join("lightlogger-rendezvous"),
            sensors: SensorKind::ALL
                .into_iter()
                .map(SensorConfig::simulated)
                .collect(),
        }
    }
}

/// Per-sensor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub kind: SensorKind,
    /// Native sample rate; falls back to the sensor's default.
    #[serde(default)]
    pub rate_hz: Option<f64>,
    #[serde(default)]
    pub driver: DriverConfig,
    /// Core to pin the controller to. Defaults to its position in the list.
    #[serde(default)]
    pub cpu: Option<usize>,
    /// Nice value requested for the controller process.
    #[serde(default = "default_nice")]
    pub nice: i32,
    /// Raw geometry of camera frames before downsampling.
    #[serde(default)]
    pub frame: Option<FrameGeometry>,
    /// Largest compressed frame a pupil slot can hold.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_gain")]
    pub initial_gain: f64,
    #[serde(default = "default_exposure")]
    pub initial_exposure: f64,
}

fn default_nice() -> i32 {
    -10
}

fn default_max_frame_bytes() -> usize {
    22_000
}

fn default_gain() -> f64 {
    1.0
}

fn default_exposure() -> f64 {
    1_000.0
}

/// Camera frame size and the binning factor applied before buffering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub rows: usize,
    pub cols: usize,
    #[serde(default = "default_downsample")]
    pub downsample: usize,
}

fn default_downsample() -> usize {
    1
}

impl FrameGeometry {
    /// Geometry after downsampling.
    pub fn stored(&self) -> (usize, usize) {
        let factor = self.downsample.max(1);
        (self.rows / factor, self.cols / factor)
    }
}

/// Which driver opens the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum DriverConfig {
    /// Synthetic samples paced at the native rate.
    #[default]
    Simulated,
    /// Framed messages over a serial port.
    Serial { path: PathBuf, baud_rate: u32 },
    /// A 12-bit ADC behind a Linux I2C bus device.
    I2c { bus: PathBuf, address: u16 },
}

impl SensorConfig {
    /// A sensor driven by the simulated driver with default settings.
    pub fn simulated(kind: SensorKind) -> Self {
        let frame = match kind {
            SensorKind::World => Some(FrameGeometry {
                rows: 480,
                cols: 640,
                downsample: 4,
            }),
            SensorKind::Pupil => Some(FrameGeometry {
                rows: 400,
                cols: 400,
                downsample: 1,
            }),
            _ => None,
        };
        SensorConfig {
            kind,
            rate_hz: None,
            driver: DriverConfig::Simulated,
            cpu: None,
            nice: default_nice(),
            frame,
            max_frame_bytes: default_max_frame_bytes(),
            initial_gain: default_gain(),
            initial_exposure: default_exposure(),
        }
    }

    pub fn rate_hz(&self) -> f64 {
        self.rate_hz.unwrap_or_else(|| self.kind.default_rate_hz())
    }

    /// Layout of one stored sample, after any downsampling.
    pub fn layout(&self) -> SampleLayout {
        match self.kind {
            SensorKind::Spectral => SampleLayout::spectral(),
            SensorKind::World => {
                let (rows, cols) = self.frame.map(|f| f.stored()).unwrap_or((120, 160));
                SampleLayout::frame(rows, cols)
            }
            SensorKind::Pupil => SampleLayout::compressed_frame(self.max_frame_bytes),
            SensorKind::Ambient => SampleLayout::scalar_i16(),
        }
    }

    /// Ring buffer slots needed for one burst: one per expected sample plus
    /// one spare.
    pub fn capacity(&self, burst: Duration) -> usize {
        (burst.as_secs_f64() * self.rate_hz()).ceil() as usize + 1
    }
}

impl RunConfig {
    /// Read and validate a RON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: RunConfig = ron::de::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn burst_duration(&self) -> Duration {
        Duration::from_millis(self.burst_duration_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn control_interval(&self) -> Duration {
        Duration::from_millis(self.control_interval_ms)
    }

    pub fn sensor(&self, kind: SensorKind) -> Option<&SensorConfig> {
        self.sensors.iter().find(|s| s.kind == kind)
    }

    /// Keep only the listed sensors, preserving config order.
    pub fn retain_sensors(&mut self, kinds: &[SensorKind]) {
        self.sensors.retain(|s| kinds.contains(&s.kind));
    }

    /// Reject configurations that would make a run meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.burst_duration_ms == 0 {
            return Err(LoggerError::Config("burst_duration_ms must be > 0".into()));
        }
        if self.sensors.is_empty() {
            return Err(LoggerError::Config("no sensors configured".into()));
        }
        if !(0.0..1.0).contains(&self.control_speed) {
            return Err(LoggerError::Config(format!(
                "control_speed {} outside [0, 1)",
                self.control_speed
            )));
        }
        for (i, sensor) in self.sensors.iter().enumerate() {
            if self.sensors[..i].iter().any(|s| s.kind == sensor.kind) {
                return Err(LoggerError::Config(format!(
                    "sensor {} configured twice",
                    sensor.kind
                )));
            }
            let rate = sensor.rate_hz();
            if !rate.is_finite() || rate <= 0.0 {
                return Err(LoggerError::Config(format!(
                    "sensor {} has invalid rate {rate}",
                    sensor.kind
                )));
            }
            sensor
                .layout()
                .validate()
                .map_err(|e| LoggerError::Config(format!("sensor {}: {e}", sensor.kind)))?;
        }
        Ok(())
    }
}
