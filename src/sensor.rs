//! The closed set of sensors the logger knows about, and the byte layout of
//! one native sample for each of them.
//!
//! Layouts are plain data so they can be written into the run metadata; the
//! parser reshapes payloads from the metadata alone and never from the
//! constants in this file.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bytes in one spectral message, without the `<` `>` framing.
pub const SPECTRAL_MESSAGE_BYTES: usize = 148;

/// Readings per axis packed into each motion block of a spectral message.
pub const SPECTRAL_MOTION_SAMPLES: usize = 10;

/// Size of the length prefix at the start of every pupil slot.
pub const PUPIL_PREFIX_BYTES: usize = 4;

/// The fixed sensor set. The declaration order is the order sensors appear
/// in a chunk header.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// Multi-channel spectral and light sensor with an IMU and thermometer.
    Spectral,
    /// High frame rate world-facing camera.
    World,
    /// Infrared pupil camera producing compressed frames.
    Pupil,
    /// Ambient light sensor read over I2C.
    Ambient,
}

impl SensorKind {
    /// Every sensor, in chunk order.
    pub const ALL: [SensorKind; 4] = [
        SensorKind::Spectral,
        SensorKind::World,
        SensorKind::Pupil,
        SensorKind::Ambient,
    ];

    /// Single byte tag written into chunk headers.
    pub fn tag(self) -> u8 {
        match self {
            SensorKind::Spectral => b'M',
            SensorKind::World => b'W',
            SensorKind::Pupil => b'P',
            SensorKind::Ambient => b'S',
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    /// Lowercase name, used for marker files and log lines.
    pub fn name(self) -> &'static str {
        match self {
            SensorKind::Spectral => "spectral",
            SensorKind::World => "world",
            SensorKind::Pupil => "pupil",
            SensorKind::Ambient => "ambient",
        }
    }

    /// Position of this sensor in the chunk header.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Native sample rate used when the config does not override it.
    pub fn default_rate_hz(self) -> f64 {
        match self {
            SensorKind::Spectral => 1.0,
            SensorKind::World => 200.0,
            SensorKind::Pupil => 120.0,
            SensorKind::Ambient => 1.0,
        }
    }

    /// Whether the capture loop runs gain/exposure control for this sensor.
    pub fn has_adaptive_control(self) -> bool {
        matches!(self, SensorKind::World)
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// Scalar type of the values inside a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementType {
    U8,
    U16,
    I16,
    U32,
    F32,
}

impl ElementType {
    pub fn size(self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::U16 | ElementType::I16 => 2,
            ElementType::U32 | ElementType::F32 => 4,
        }
    }

    /// Decode a little-endian byte run into typed values. Trailing bytes
    /// that do not fill a whole element are ignored.
    pub fn decode(self, bytes: &[u8]) -> Values {
        match self {
            ElementType::U8 => Values::U8(bytes.to_vec()),
            ElementType::U16 => Values::U16(
                bytes
                    .chunks_exact(2)
                    .map(|b| u16::from_le_bytes([b[0], b[1]]))
                    .collect(),
            ),
            ElementType::I16 => Values::I16(
                bytes
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]))
                    .collect(),
            ),
            ElementType::U32 => Values::U32(
                bytes
                    .chunks_exact(4)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
            ),
            ElementType::F32 => Values::F32(
                bytes
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
            ),
        }
    }
}

/// A typed, flat array of decoded values.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    U8(Vec<u8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    U32(Vec<u32>),
    F32(Vec<f32>),
}

impl Values {
    pub fn len(&self) -> usize {
        match self {
            Values::U8(v) => v.len(),
            Values::U16(v) => v.len(),
            Values::I16(v) => v.len(),
            Values::U32(v) => v.len(),
            Values::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lossless widening of every value to `f64`.
    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            Values::U8(v) => v.iter().map(|&x| x as f64).collect(),
            Values::U16(v) => v.iter().map(|&x| x as f64).collect(),
            Values::I16(v) => v.iter().map(|&x| x as f64).collect(),
            Values::U32(v) => v.iter().map(|&x| x as f64).collect(),
            Values::F32(v) => v.iter().map(|&x| x as f64).collect(),
        }
    }
}

/// How a sample slot is filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Framing {
    /// Every byte of the slot is sample data.
    Fixed,
    /// The slot starts with a little-endian `u32` giving the number of
    /// meaningful bytes that follow; the rest is zero padding.
    LengthPrefixed,
}

/// A named sub-stream inside a multiplexed sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldLayout {
    pub name: String,
    /// Byte offset of the field inside one sample.
    pub offset: usize,
    pub element: ElementType,
    /// Shape of the field within one sample. When the last dimension is
    /// greater than one, values are interleaved along it (x0 y0 z0 x1 ...).
    pub shape: Vec<usize>,
}

impl FieldLayout {
    pub fn value_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_len(&self) -> usize {
        self.value_count() * self.element.size()
    }
}

/// Native per-sample byte layout of one sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleLayout {
    pub bytes_per_sample: usize,
    pub element: ElementType,
    /// Shape of the values in one sample, e.g. `[rows, cols]` for frames.
    pub shape: Vec<usize>,
    pub framing: Framing,
    /// Sub-streams to demultiplex; empty when the sample is a single array.
    pub fields: Vec<FieldLayout>,
}

impl SampleLayout {
    /// The 148 byte spectral message: two channel banks, an IMU block
    /// holding acceleration then angle (each 10 readings of x/y/z), and a
    /// temperature.
    pub fn spectral() -> Self {
        let field = |name: &str, offset, element, shape: Vec<usize>| FieldLayout {
            name: name.to_owned(),
            offset,
            element,
            shape,
        };
        SampleLayout {
            bytes_per_sample: SPECTRAL_MESSAGE_BYTES,
            element: ElementType::U8,
            shape: vec![SPECTRAL_MESSAGE_BYTES],
            framing: Framing::Fixed,
            fields: vec![
                field("as_channels", 0, ElementType::U16, vec![10]),
                field("ts_channels", 20, ElementType::U16, vec![2]),
                field(
                    "acceleration",
                    24,
                    ElementType::I16,
                    vec![SPECTRAL_MOTION_SAMPLES, 3],
                ),
                field("angle", 84, ElementType::I16, vec![SPECTRAL_MOTION_SAMPLES, 3]),
                field("temperature", 144, ElementType::F32, vec![1]),
            ],
        }
    }

    /// One monochrome 8-bit frame of `rows` x `cols` pixels.
    pub fn frame(rows: usize, cols: usize) -> Self {
        SampleLayout {
            bytes_per_sample: rows * cols,
            element: ElementType::U8,
            shape: vec![rows, cols],
            framing: Framing::Fixed,
            fields: Vec::new(),
        }
    }

    /// A slot big enough for one compressed frame of at most `max_bytes`.
    pub fn compressed_frame(max_bytes: usize) -> Self {
        SampleLayout {
            bytes_per_sample: PUPIL_PREFIX_BYTES + max_bytes,
            element: ElementType::U8,
            shape: vec![max_bytes],
            framing: Framing::LengthPrefixed,
            fields: Vec::new(),
        }
    }

    /// A single signed 16-bit reading.
    pub fn scalar_i16() -> Self {
        SampleLayout {
            bytes_per_sample: 2,
            element: ElementType::I16,
            shape: vec![1],
            framing: Framing::Fixed,
            fields: Vec::new(),
        }
    }

    /// Checks the layout is self-consistent: fields fit inside the sample
    /// and fixed layouts account for every byte of the shape.
    pub fn validate(&self) -> Result<(), String> {
        if self.bytes_per_sample == 0 {
            return Err("bytes_per_sample must be non-zero".to_owned());
        }
        for field in &self.fields {
            let end = field.offset.checked_add(field.byte_len());
            if end.map_or(true, |end| end > self.bytes_per_sample) {
                return Err(format!(
                    "field {} ({} bytes at {}) overruns a {} byte sample",
                    field.name,
                    field.byte_len(),
                    field.offset,
                    self.bytes_per_sample
                ));
            }
        }
        if self.framing == Framing::Fixed {
            let shaped = self.shape.iter().product::<usize>() * self.element.size();
            if shaped != self.bytes_per_sample {
                return Err(format!(
                    "shape {:?} of {:?} is {} bytes, sample is {}",
                    self.shape, self.element, shaped, self.bytes_per_sample
                ));
            }
        }
        Ok(())
    }
}

/// Pack a compressed frame into a length-prefixed slot. Frames longer than
/// the slot are truncated.
pub fn pack_prefixed(frame: &[u8], slot: &mut [u8]) -> usize {
    let room = slot.len().saturating_sub(PUPIL_PREFIX_BYTES);
    let used = frame.len().min(room);
    slot[..PUPIL_PREFIX_BYTES].copy_from_slice(&(used as u32).to_le_bytes());
    slot[PUPIL_PREFIX_BYTES..PUPIL_PREFIX_BYTES + used].copy_from_slice(&frame[..used]);
    slot[PUPIL_PREFIX_BYTES + used..].fill(0);
    used
}

/// Inverse of [`pack_prefixed`]; `None` when the prefix claims more bytes
/// than the slot holds.
pub fn unpack_prefixed(slot: &[u8]) -> Option<&[u8]> {
    let prefix: [u8; PUPIL_PREFIX_BYTES] = slot.get(..PUPIL_PREFIX_BYTES)?.try_into().ok()?;
    let used = u32::from_le_bytes(prefix) as usize;
    slot.get(PUPIL_PREFIX_BYTES..PUPIL_PREFIX_BYTES + used)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip_in_chunk_order() {
        for (i, kind) in SensorKind::ALL.into_iter().enumerate() {
            assert_eq!(kind.index(), i);
            assert_eq!(SensorKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(SensorKind::from_tag(b'X'), None);
    }

    #[test]
    fn builtin_layouts_are_consistent() {
        SampleLayout::spectral().validate().unwrap();
        SampleLayout::frame(120, 160).validate().unwrap();
        SampleLayout::compressed_frame(22_000).validate().unwrap();
        SampleLayout::scalar_i16().validate().unwrap();
    }

    #[test]
    fn spectral_fields_cover_the_message() {
        let layout = SampleLayout::spectral();
        let covered: usize = layout.fields.iter().map(|f| f.byte_len()).sum();
        assert_eq!(covered, SPECTRAL_MESSAGE_BYTES);
    }

    #[test]
    fn overrunning_field_is_rejected() {
        let mut layout = SampleLayout::spectral();
        layout.fields[4].offset = 146;
        assert!(layout.validate().is_err());
    }

    #[test]
    fn prefixed_slots() {
        let mut slot = [0xAAu8; 12];
        assert_eq!(pack_prefixed(&[1, 2, 3], &mut slot), 3);
        assert_eq!(unpack_prefixed(&slot), Some(&[1u8, 2, 3][..]));
        assert!(slot[7..].iter().all(|&b| b == 0));

        // too long for the slot
        assert_eq!(pack_prefixed(&[9; 20], &mut slot), 8);
        assert_eq!(unpack_prefixed(&slot).map(<[u8]>::len), Some(8));
    }

    #[test]
    fn decode_little_endian() {
        let bytes = [0x01, 0x00, 0xFF, 0xFF];
        assert_eq!(ElementType::U16.decode(&bytes), Values::U16(vec![1, 0xFFFF]));
        assert_eq!(ElementType::I16.decode(&bytes), Values::I16(vec![1, -1]));
    }
}
