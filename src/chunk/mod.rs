//! The on-disk format for one burst.
//!
//! A chunk holds every sensor of the closed set, in a fixed order, behind a
//! small fixed header. All integers are little-endian.
//!
//! ```text
//! magic        4 bytes  "LLCK"
//! version      u16
//! burst_index  u64
//! entry_count  u16      always 4, in the order M W P S
//! entries      entry_count x { tag u8, byte_length u64, sample_count u64, observed_rate f64 }
//! payloads     raw bytes of every entry with a real length, in entry order
//! ```
//!
//! A `byte_length` of [`ABSENT`] means the sensor did not take part in the
//! burst, [`OPEN_FAILED`] means its data existed but could not be read back.
//! Zero is a real, empty payload.
//!
//! Controllers never share a file. Each writes a *segment* (a chunk where
//! only its own sensor is present) and the orchestrator merges segments into
//! `chunk_<N>` once the burst is over. The per-sample layout needed to read
//! a payload lives in the run's `run.ron`, never in the chunk itself.

mod assemble;
mod metadata;
mod parser;
mod writer;

pub use assemble::{assemble_burst, discard_segments, next_burst_index};
pub use metadata::{RunMetadata, SensorMetadata};
pub use parser::{parse, parse_bytes, ParsedChunk, SensorData, SensorReading};
pub use writer::ChunkWriter;

use std::path::{Path, PathBuf};

use crate::{ring_buffer::RingBuffer, sensor::SensorKind};

pub const MAGIC: &[u8; 4] = b"LLCK";
pub const VERSION: u16 = 1;

pub const ABSENT: u64 = u64::MAX;
pub const OPEN_FAILED: u64 = u64::MAX - 1;

/// magic + version + burst index + entry count
pub const HEADER_BYTES: usize = 4 + 2 + 8 + 2;
/// tag + byte length + sample count + observed rate
pub const ENTRY_BYTES: usize = 1 + 8 + 8 + 8;

/// Bytes before the first payload.
pub const PREAMBLE_BYTES: usize = HEADER_BYTES + SensorKind::ALL.len() * ENTRY_BYTES;

/// The samples of one sensor for one burst, borrowed from wherever they
/// were captured. `parts` are concatenated in order.
#[derive(Debug, Clone)]
pub struct SensorPayload<'a> {
    pub parts: Vec<&'a [u8]>,
    pub sample_count: u64,
    pub observed_rate: f64,
}

impl<'a> SensorPayload<'a> {
    pub fn from_bytes(bytes: &'a [u8], sample_count: u64, observed_rate: f64) -> Self {
        SensorPayload {
            parts: vec![bytes],
            sample_count,
            observed_rate,
        }
    }

    /// The valid samples of `ring`, oldest first.
    pub fn from_ring(ring: &'a RingBuffer, observed_rate: f64) -> Self {
        let (first, second) = ring.as_slices();
        SensorPayload {
            parts: vec![first, second],
            sample_count: ring.len() as u64,
            observed_rate,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.parts.iter().map(|p| p.len()).sum()
    }
}

/// One header slot.
#[derive(Debug, Clone)]
pub enum Entry<'a> {
    Present(SensorPayload<'a>),
    Absent,
    OpenFailed,
}

pub fn chunk_path(run_dir: impl AsRef<Path>, burst_index: u64) -> PathBuf {
    run_dir.as_ref().join(format!("chunk_{burst_index}"))
}

pub fn segment_path(run_dir: impl AsRef<Path>, burst_index: u64, kind: SensorKind) -> PathBuf {
    run_dir
        .as_ref()
        .join(format!("burst_{burst_index}.{}.seg", kind.tag() as char))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names() {
        assert_eq!(chunk_path("/r", 12), PathBuf::from("/r/chunk_12"));
        assert_eq!(
            segment_path("/r", 3, SensorKind::World),
            PathBuf::from("/r/burst_3.W.seg")
        );
    }

    #[test]
    fn ring_payload_is_in_capture_order() {
        let mut ring = RingBuffer::new(3, 1);
        for v in 1..=4 {
            ring.push(&[v]);
        }
        let payload = SensorPayload::from_ring(&ring, 1.0);
        assert_eq!(payload.sample_count, 3);
        assert_eq!(payload.parts.concat(), vec![2, 3, 4]);
    }
}
