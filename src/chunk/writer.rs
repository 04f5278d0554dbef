use log::{trace, warn};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use super::{
    chunk_path, segment_path, Entry, RunMetadata, SensorPayload, ABSENT, MAGIC, OPEN_FAILED,
    VERSION,
};
use crate::{
    error::{LoggerError, Result},
    sensor::SensorKind,
};

/// A header slot after truncation, ready to serialize.
struct Resolved<'a> {
    byte_length: u64,
    sample_count: u64,
    observed_rate: f64,
    parts: Vec<&'a [u8]>,
}

/// Writes chunks and segments into one run directory.
#[derive(Debug, Clone)]
pub struct ChunkWriter {
    run_dir: PathBuf,
    sample_bytes: [Option<usize>; 4],
}

impl ChunkWriter {
    pub fn new(run_dir: impl Into<PathBuf>, metadata: &RunMetadata) -> Self {
        let sample_bytes =
            SensorKind::ALL.map(|kind| metadata.layout(kind).map(|l| l.bytes_per_sample));
        ChunkWriter {
            run_dir: run_dir.into(),
            sample_bytes,
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Write `chunk_<burst_index>`. `entries` are indexed by sensor, in
    /// chunk order.
    pub fn write(&self, burst_index: u64, entries: &[Entry<'_>; 4]) -> Result<PathBuf> {
        let path = chunk_path(&self.run_dir, burst_index);
        self.write_atomic(&path, burst_index, entries)?;
        Ok(path)
    }

    /// Write the segment holding only `kind`'s samples for one burst.
    pub fn write_segment(
        &self,
        burst_index: u64,
        kind: SensorKind,
        payload: SensorPayload<'_>,
    ) -> Result<PathBuf> {
        let entries = std::array::from_fn(|i| {
            if i == kind.index() {
                Entry::Present(payload.clone())
            } else {
                Entry::Absent
            }
        });
        let path = segment_path(&self.run_dir, burst_index, kind);
        self.write_atomic(&path, burst_index, &entries)?;
        Ok(path)
    }

    /// The file only appears under `path` once every byte is on disk.
    fn write_atomic(&self, path: &Path, burst_index: u64, entries: &[Entry<'_>; 4]) -> Result<()> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| LoggerError::Config(format!("bad chunk path {path:?}")))?;
        let temp = path.with_file_name(format!(".{name}.tmp"));

        let mut file = BufWriter::new(File::create(&temp)?);
        self.to_file(&mut file, burst_index, entries)?;
        let file = file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, path)?;
        trace!("wrote {path:?}");
        Ok(())
    }

    /// Serialize a whole chunk to the [Write]able object provided.
    pub fn to_file(
        &self,
        file: &mut impl Write,
        burst_index: u64,
        entries: &[Entry<'_>; 4],
    ) -> Result<()> {
        let resolved = SensorKind::ALL
            .into_iter()
            .zip(entries)
            .map(|(kind, entry)| self.resolve(kind, entry))
            .collect::<Result<Vec<_>>>()?;

        file.write_all(MAGIC)?;
        file.write_all(&VERSION.to_le_bytes())?;
        file.write_all(&burst_index.to_le_bytes())?;
        file.write_all(&(SensorKind::ALL.len() as u16).to_le_bytes())?;
        for (kind, entry) in SensorKind::ALL.into_iter().zip(&resolved) {
            file.write_all(&[kind.tag()])?;
            file.write_all(&entry.byte_length.to_le_bytes())?;
            file.write_all(&entry.sample_count.to_le_bytes())?;
            file.write_all(&entry.observed_rate.to_le_bytes())?;
        }
        for part in resolved.iter().flat_map(|r| &r.parts) {
            file.write_all(part)?;
        }
        Ok(())
    }

    /// Truncate a payload to whole samples, never more than it claims.
    fn resolve<'a>(&self, kind: SensorKind, entry: &Entry<'a>) -> Result<Resolved<'a>> {
        let sentinel = |byte_length| Resolved {
            byte_length,
            sample_count: 0,
            observed_rate: 0.0,
            parts: Vec::new(),
        };
        let payload = match entry {
            Entry::Absent => return Ok(sentinel(ABSENT)),
            Entry::OpenFailed => return Ok(sentinel(OPEN_FAILED)),
            Entry::Present(payload) => payload,
        };

        let sample_bytes = self.sample_bytes[kind.index()]
            .ok_or_else(|| LoggerError::Config(format!("{kind} is not part of this run")))?;
        let whole = (payload.byte_len() / sample_bytes) as u64;
        let sample_count = payload.sample_count.min(whole);
        if sample_count < payload.sample_count {
            warn!(
                "{kind} : payload holds {whole} samples but claims {}, truncating",
                payload.sample_count
            );
        }

        let mut remaining = sample_count as usize * sample_bytes;
        let mut parts = Vec::with_capacity(payload.parts.len());
        for &part in &payload.parts {
            let take = remaining.min(part.len());
            if take > 0 {
                parts.push(&part[..take]);
            }
            remaining -= take;
        }

        Ok(Resolved {
            byte_length: (sample_count as usize * sample_bytes) as u64,
            sample_count,
            observed_rate: payload.observed_rate,
            parts,
        })
    }
}
