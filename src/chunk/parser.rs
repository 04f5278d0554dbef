use nom::{
    bytes::complete::tag,
    combinator::map,
    multi::length_count,
    number::complete::{le_f64, le_u16, le_u64, u8 as byte},
    sequence::{preceded, tuple},
    Finish, IResult,
};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use super::{RunMetadata, ABSENT, MAGIC, OPEN_FAILED, VERSION};
use crate::{
    error::{LoggerError, Result},
    sensor::{unpack_prefixed, Framing, SampleLayout, SensorKind, Values},
};

#[derive(Debug, Clone, Copy, PartialEq)]
struct RawEntry {
    tag: u8,
    byte_length: u64,
    sample_count: u64,
    observed_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
struct RawHeader {
    version: u16,
    burst_index: u64,
    entries: Vec<RawEntry>,
}

fn parse_entry(input: &[u8]) -> IResult<&[u8], RawEntry> {
    map(
        tuple((byte, le_u64, le_u64, le_f64)),
        |(tag, byte_length, sample_count, observed_rate)| RawEntry {
            tag,
            byte_length,
            sample_count,
            observed_rate,
        },
    )(input)
}

fn parse_header(input: &[u8]) -> IResult<&[u8], RawHeader> {
    map(
        preceded(
            tag(&MAGIC[..]),
            tuple((le_u16, le_u64, length_count(le_u16, parse_entry))),
        ),
        |(version, burst_index, entries)| RawHeader {
            version,
            burst_index,
            entries,
        },
    )(input)
}

/// One sensor slot of a parsed chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorData {
    Present(SensorReading),
    Absent,
    OpenFailed,
}

/// The samples one sensor captured in one burst, with the layout needed to
/// interpret them.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub kind: SensorKind,
    pub sample_count: u64,
    pub observed_rate: f64,
    pub layout: SampleLayout,
    pub raw: Vec<u8>,
}

impl SensorReading {
    /// Raw bytes of each sample, in capture order. Empty for a layout with
    /// zero-byte samples.
    pub fn samples(&self) -> impl Iterator<Item = &[u8]> {
        let size = self.layout.bytes_per_sample;
        self.raw.chunks_exact(size.max(1)).filter(move |_| size > 0)
    }

    /// Every value of every sample, flattened, for fixed-framing layouts.
    pub fn values(&self) -> Result<Values> {
        if self.layout.framing != Framing::Fixed {
            return Err(LoggerError::ParseError(format!(
                "{} samples are length-prefixed, read them with frames()",
                self.kind
            )));
        }
        Ok(self.layout.element.decode(&self.raw))
    }

    /// The meaningful bytes of each length-prefixed slot.
    pub fn frames(&self) -> Result<Vec<&[u8]>> {
        self.samples()
            .enumerate()
            .map(|(i, slot)| {
                unpack_prefixed(slot).ok_or_else(|| {
                    LoggerError::ParseError(format!("{} frame {i} overruns its slot", self.kind))
                })
            })
            .collect()
    }

    /// One named sub-stream across all samples, concatenated in order.
    pub fn field(&self, name: &str) -> Result<Values> {
        let field = self
            .layout
            .fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| LoggerError::ParseError(format!("{} has no field {name}", self.kind)))?;
        let span = field.offset..field.offset.saturating_add(field.byte_len());
        let mut bytes = Vec::with_capacity(self.sample_count as usize * field.byte_len());
        for sample in self.samples() {
            let value = sample.get(span.clone()).ok_or_else(|| {
                LoggerError::ParseError(format!(
                    "{} field {name} overruns a {} byte sample",
                    self.kind,
                    sample.len()
                ))
            })?;
            bytes.extend_from_slice(value);
        }
        Ok(field.element.decode(&bytes))
    }

    /// One axis of an interleaved field, e.g. the y readings of the
    /// acceleration block.
    pub fn axis_series(&self, name: &str, axis: usize) -> Result<Vec<f64>> {
        let axes = self
            .layout
            .fields
            .iter()
            .find(|f| f.name == name)
            .and_then(|f| f.shape.last().copied())
            .unwrap_or(1);
        if axis >= axes {
            return Err(LoggerError::ParseError(format!(
                "field {name} has {axes} axes, asked for {axis}"
            )));
        }
        Ok(self
            .field(name)?
            .to_f64()
            .into_iter()
            .skip(axis)
            .step_by(axes)
            .collect())
    }
}

/// A chunk read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedChunk {
    pub burst_index: u64,
    /// Indexed by sensor, in chunk order.
    pub sensors: Vec<SensorData>,
}

impl ParsedChunk {
    pub fn sensor(&self, kind: SensorKind) -> &SensorData {
        &self.sensors[kind.index()]
    }

    pub fn reading(&self, kind: SensorKind) -> Option<&SensorReading> {
        match self.sensor(kind) {
            SensorData::Present(reading) => Some(reading),
            _ => None,
        }
    }

    pub fn readings(&self) -> impl Iterator<Item = &SensorReading> {
        self.sensors.iter().filter_map(|s| match s {
            SensorData::Present(reading) => Some(reading),
            _ => None,
        })
    }
}

/// Read and validate the chunk at `path`.
pub fn parse(path: impl AsRef<Path>, metadata: &RunMetadata) -> Result<ParsedChunk> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => LoggerError::ChunkMissing(path.to_owned()),
        _ => LoggerError::Io(e),
    })?;
    parse_bytes(&bytes, path, metadata)
}

/// Validate and split an in-memory chunk. `path` only labels errors.
pub fn parse_bytes(bytes: &[u8], path: &Path, metadata: &RunMetadata) -> Result<ParsedChunk> {
    let corrupt = |reason: String| LoggerError::corrupt(PathBuf::from(path), reason);

    let (mut payloads, header) = parse_header(bytes)
        .finish()
        .map_err(|e| corrupt(format!("unreadable header ({:?})", e.code)))?;

    if header.version != VERSION {
        return Err(corrupt(format!("unsupported version {}", header.version)));
    }
    if header.entries.len() != SensorKind::ALL.len() {
        return Err(corrupt(format!("{} entries in header", header.entries.len())));
    }

    let mut sensors = Vec::with_capacity(SensorKind::ALL.len());
    for (kind, entry) in SensorKind::ALL.into_iter().zip(&header.entries) {
        if entry.tag != kind.tag() {
            return Err(corrupt(format!(
                "expected tag {:?}, found {:?}",
                kind.tag() as char,
                entry.tag as char
            )));
        }
        let data = match entry.byte_length {
            ABSENT => SensorData::Absent,
            OPEN_FAILED => SensorData::OpenFailed,
            byte_length => {
                let layout = metadata.layout(kind).ok_or_else(|| {
                    LoggerError::ParseError(format!("{kind} has data but no layout in run metadata"))
                })?;
                layout
                    .validate()
                    .map_err(|e| LoggerError::ParseError(format!("{kind} layout: {e}")))?;
                let expected = entry.sample_count.checked_mul(layout.bytes_per_sample as u64);
                if expected != Some(byte_length) {
                    return Err(corrupt(format!(
                        "{kind}: {byte_length} bytes for {} samples of {}",
                        entry.sample_count, layout.bytes_per_sample
                    )));
                }
                if byte_length > payloads.len() as u64 {
                    return Err(corrupt(format!(
                        "{kind}: {byte_length} bytes claimed, {} left in file",
                        payloads.len()
                    )));
                }
                let (raw, rest) = payloads.split_at(byte_length as usize);
                payloads = rest;
                SensorData::Present(SensorReading {
                    kind,
                    sample_count: entry.sample_count,
                    observed_rate: entry.observed_rate,
                    layout: layout.clone(),
                    raw: raw.to_vec(),
                })
            }
        };
        sensors.push(data);
    }

    if !payloads.is_empty() {
        return Err(corrupt(format!("{} trailing bytes", payloads.len())));
    }

    Ok(ParsedChunk {
        burst_index: header.burst_index,
        sensors,
    })
}
