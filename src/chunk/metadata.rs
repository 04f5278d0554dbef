use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    config::RunConfig,
    error::{LoggerError, Result},
    sensor::{SampleLayout, SensorKind},
};

/// Self-description of a run, written once as `run.ron` next to the chunks.
/// Everything needed to reshape a payload is in here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub format_version: u16,
    pub burst_duration_ms: u64,
    pub sensors: Vec<SensorMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorMetadata {
    pub kind: SensorKind,
    pub rate_hz: f64,
    pub layout: SampleLayout,
}

impl RunMetadata {
    pub const FILE_NAME: &'static str = "run.ron";

    pub fn from_config(config: &RunConfig) -> Self {
        RunMetadata {
            format_version: super::VERSION,
            burst_duration_ms: config.burst_duration_ms,
            sensors: config
                .sensors
                .iter()
                .map(|s| SensorMetadata {
                    kind: s.kind,
                    rate_hz: s.rate_hz(),
                    layout: s.layout(),
                })
                .collect(),
        }
    }

    pub fn path(run_dir: impl AsRef<Path>) -> PathBuf {
        run_dir.as_ref().join(Self::FILE_NAME)
    }

    pub fn layout(&self, kind: SensorKind) -> Option<&SampleLayout> {
        self.sensors.iter().find(|s| s.kind == kind).map(|s| &s.layout)
    }

    pub fn to_path(&self, run_dir: impl AsRef<Path>) -> Result<()> {
        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(Self::path(run_dir), text)?;
        Ok(())
    }

    pub fn from_path(run_dir: impl AsRef<Path>) -> Result<Self> {
        let path = Self::path(run_dir);
        let text = fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LoggerError::ChunkMissing(path.clone()),
            _ => LoggerError::Io(e),
        })?;
        let metadata: RunMetadata = ron::de::from_str(&text)?;
        metadata.validate()?;
        Ok(metadata)
    }

    /// Reject layouts the parser could not apply, e.g. from a hand-edited
    /// `run.ron`.
    pub fn validate(&self) -> Result<()> {
        for sensor in &self.sensors {
            sensor
                .layout
                .validate()
                .map_err(|e| LoggerError::ParseError(format!("{} layout: {e}", sensor.kind)))?;
        }
        Ok(())
    }

    /// Write the metadata for a fresh run, or check that a resumed run uses
    /// the same layouts as the one it continues.
    pub fn establish(&self, run_dir: impl AsRef<Path>) -> Result<()> {
        let run_dir = run_dir.as_ref();
        match Self::from_path(run_dir) {
            Ok(existing) if existing == *self => Ok(()),
            Ok(_) => Err(LoggerError::Config(format!(
                "{:?} was recorded with different sensor layouts",
                run_dir
            ))),
            Err(LoggerError::ChunkMissing(_)) => {
                fs::create_dir_all(run_dir)?;
                self.to_path(run_dir)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn establish_writes_then_accepts_same() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("run");
        let meta = RunMetadata::from_config(&RunConfig::default());

        meta.establish(&run_dir).unwrap();
        assert_eq!(RunMetadata::from_path(&run_dir).unwrap(), meta);
        meta.establish(&run_dir).unwrap();
    }

    #[test]
    fn establish_rejects_changed_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RunConfig::default();
        RunMetadata::from_config(&config).establish(dir.path()).unwrap();

        config.sensors[2].max_frame_bytes = 100;
        assert!(matches!(
            RunMetadata::from_config(&config).establish(dir.path()),
            Err(LoggerError::Config(_))
        ));
    }

    #[test]
    fn inconsistent_layouts_are_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut meta = RunMetadata::from_config(&RunConfig::default());
        meta.sensors[1].layout.fields.push(crate::sensor::FieldLayout {
            name: "x".to_owned(),
            offset: usize::MAX - 1,
            element: crate::sensor::ElementType::U16,
            shape: vec![1],
        });
        meta.to_path(dir.path()).unwrap();
        assert!(matches!(
            RunMetadata::from_path(dir.path()),
            Err(LoggerError::ParseError(_))
        ));

        let mut meta = RunMetadata::from_config(&RunConfig::default());
        meta.sensors[3].layout.bytes_per_sample = 0;
        meta.to_path(dir.path()).unwrap();
        assert!(matches!(
            RunMetadata::from_path(dir.path()),
            Err(LoggerError::ParseError(_))
        ));
    }

    #[test]
    fn layouts_come_from_config() {
        let meta = RunMetadata::from_config(&RunConfig::default());
        assert_eq!(
            meta.layout(SensorKind::Spectral),
            Some(&SampleLayout::spectral())
        );
    }
}
