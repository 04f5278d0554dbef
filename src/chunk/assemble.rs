use log::{info, warn};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use super::{
    parse, segment_path, ChunkWriter, Entry, RunMetadata, SensorData, SensorPayload,
    SensorReading,
};
use crate::{error::Result, sensor::SensorKind};

/// What became of one sensor's segment.
enum Segment {
    Read(SensorReading),
    Missing,
    Failed,
}

fn read_segment(path: &Path, kind: SensorKind, metadata: &RunMetadata) -> Segment {
    if !path.exists() {
        return Segment::Missing;
    }
    match parse(path, metadata) {
        Ok(parsed) => match parsed.sensors.into_iter().nth(kind.index()) {
            Some(SensorData::Present(reading)) => Segment::Read(reading),
            _ => {
                warn!("{path:?} does not hold {kind} data");
                Segment::Failed
            }
        },
        Err(e) => {
            warn!("{path:?} could not be read back: {e}");
            Segment::Failed
        }
    }
}

/// Merge the segments of `burst_index` into `chunk_<burst_index>` and
/// delete them. Sensors without a segment are written as absent, segments
/// that exist but cannot be read as open-failed.
pub fn assemble_burst(
    run_dir: impl AsRef<Path>,
    burst_index: u64,
    metadata: &RunMetadata,
) -> Result<PathBuf> {
    let run_dir = run_dir.as_ref();
    let paths = SensorKind::ALL.map(|kind| segment_path(run_dir, burst_index, kind));
    let segments: Vec<Segment> = SensorKind::ALL
        .into_iter()
        .zip(&paths)
        .map(|(kind, path)| read_segment(path, kind, metadata))
        .collect();

    let entries: [Entry<'_>; 4] = std::array::from_fn(|i| match &segments[i] {
        Segment::Read(reading) => Entry::Present(SensorPayload::from_bytes(
            &reading.raw,
            reading.sample_count,
            reading.observed_rate,
        )),
        Segment::Missing => Entry::Absent,
        Segment::Failed => Entry::OpenFailed,
    });
    let chunk = ChunkWriter::new(run_dir, metadata).write(burst_index, &entries)?;

    for path in paths.iter().filter(|p| p.exists()) {
        fs::remove_file(path)?;
    }
    let present = segments
        .iter()
        .filter(|s| matches!(s, Segment::Read(_)))
        .count();
    info!("burst {burst_index} : assembled {chunk:?} from {present} segments");
    Ok(chunk)
}

/// Remove every segment left in `run_dir`, e.g. those of a burst that was
/// cut short. Returns how many were removed.
pub fn discard_segments(run_dir: impl AsRef<Path>) -> Result<usize> {
    let entries = match fs::read_dir(run_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        let is_segment = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("burst_") && n.ends_with(".seg"));
        if is_segment {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// The burst index a run in `run_dir` should continue from: one past the
/// highest `chunk_<N>`, or zero for an empty or missing directory.
pub fn next_burst_index(run_dir: impl AsRef<Path>) -> Result<u64> {
    let entries = match fs::read_dir(run_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut next = 0;
    for entry in entries {
        let name = entry?.file_name();
        let index = name
            .to_str()
            .and_then(|n| n.strip_prefix("chunk_"))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(index) = index {
            next = next.max(index + 1);
        }
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chunk::{chunk_path, parse},
        config::RunConfig,
    };

    fn setup() -> (tempfile::TempDir, RunMetadata, ChunkWriter) {
        let dir = tempfile::tempdir().unwrap();
        let meta = RunMetadata::from_config(&RunConfig::default());
        let writer = ChunkWriter::new(dir.path(), &meta);
        (dir, meta, writer)
    }

    #[test]
    fn segments_merge_into_one_chunk() {
        let (dir, meta, writer) = setup();
        let ambient = [3u8, 0, 4, 0];
        writer
            .write_segment(2, SensorKind::Ambient, SensorPayload::from_bytes(&ambient, 2, 1.0))
            .unwrap();
        let spectral = vec![1u8; 148];
        writer
            .write_segment(2, SensorKind::Spectral, SensorPayload::from_bytes(&spectral, 1, 1.0))
            .unwrap();
        fs::write(segment_path(dir.path(), 2, SensorKind::Pupil), b"garbage").unwrap();

        let path = assemble_burst(dir.path(), 2, &meta).unwrap();
        assert_eq!(path, chunk_path(dir.path(), 2));

        let parsed = parse(&path, &meta).unwrap();
        assert_eq!(parsed.reading(SensorKind::Ambient).unwrap().raw, ambient);
        assert_eq!(parsed.reading(SensorKind::Spectral).unwrap().raw, spectral);
        assert_eq!(*parsed.sensor(SensorKind::World), SensorData::Absent);
        assert_eq!(*parsed.sensor(SensorKind::Pupil), SensorData::OpenFailed);

        assert_eq!(discard_segments(dir.path()).unwrap(), 0);
    }

    #[test]
    fn burst_without_segments_is_all_absent() {
        let (dir, meta, _) = setup();
        let path = assemble_burst(dir.path(), 0, &meta).unwrap();
        assert_eq!(parse(&path, &meta).unwrap().readings().count(), 0);
    }

    #[test]
    fn leftover_segments_are_discarded() {
        let (dir, _, writer) = setup();
        writer
            .write_segment(5, SensorKind::Ambient, SensorPayload::from_bytes(&[0, 0], 1, 1.0))
            .unwrap();
        fs::write(dir.path().join("chunk_4"), b"").unwrap();
        assert_eq!(discard_segments(dir.path()).unwrap(), 1);
        assert!(dir.path().join("chunk_4").exists());
    }

    #[test]
    fn next_index_follows_highest_chunk() {
        let (dir, _, _) = setup();
        assert_eq!(next_burst_index(dir.path()).unwrap(), 0);
        assert_eq!(next_burst_index(dir.path().join("nope")).unwrap(), 0);

        for name in ["chunk_0", "chunk_1", "chunk_10", "burst_11.W.seg", "run.ron"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        assert_eq!(next_burst_index(dir.path()).unwrap(), 11);
    }
}
