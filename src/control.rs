//! Seams for the two signal-processing collaborators used during capture:
//! adaptive gain/exposure control and frame downsampling.
//!
//! The capture loop only depends on the traits. The default implementations
//! here are deliberately small; deployments can swap in a tuned controller.

/// Sensitivity settings applied to a device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Controls {
    pub gain: f64,
    pub exposure: f64,
}

/// Computes new sensitivity settings from the current mean signal level.
pub trait GainExposureController: Send {
    fn adjust(&self, signal: f64, current: Controls, speed: f64) -> Controls;
}

/// Reduces a raw frame to a smaller one before it is buffered.
pub trait Downsampler: Send {
    /// `raw` holds `rows * cols` 8-bit pixels. The result holds
    /// `(rows / factor) * (cols / factor)` pixels.
    fn downsample(&self, raw: &[u8], rows: usize, cols: usize, factor: usize) -> Vec<u8>;
}

/// Proportional controller steering the mean 8-bit signal toward mid-scale.
///
/// Exposure is raised before gain and gain is lowered before exposure, so
/// the noisier knob is only used once the other is pegged.
#[derive(Debug, Clone, Copy)]
pub struct ProportionalAgc {
    pub target: f64,
    pub gain_range: (f64, f64),
    pub exposure_range: (f64, f64),
}

impl Default for ProportionalAgc {
    fn default() -> Self {
        ProportionalAgc {
            target: 127.0,
            gain_range: (1.0, 10.666),
            exposure_range: (37.0, 4839.0),
        }
    }
}

impl GainExposureController for ProportionalAgc {
    fn adjust(&self, signal: f64, current: Controls, speed: f64) -> Controls {
        let raw = 1.0 + (self.target - signal) / self.target;

        // close to target: settle faster
        let speed = if (raw - 1.0).abs() < 0.25 {
            speed * speed
        } else {
            speed
        };
        let correction = 1.0 + (1.0 - speed) * (raw - 1.0);

        let mut next = current;
        if correction > 1.0 {
            if current.exposure < self.exposure_range.1 {
                next.exposure = current.exposure * correction;
            } else {
                next.gain = current.gain * correction;
            }
        } else if correction < 1.0 {
            if current.gain > self.gain_range.0 {
                next.gain = current.gain * correction;
            } else {
                next.exposure = current.exposure * correction;
            }
        }

        Controls {
            gain: next.gain.clamp(self.gain_range.0, self.gain_range.1),
            exposure: next.exposure.clamp(self.exposure_range.0, self.exposure_range.1),
        }
    }
}

/// Averages `factor` x `factor` blocks of pixels.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinningDownsampler;

impl Downsampler for BinningDownsampler {
    fn downsample(&self, raw: &[u8], rows: usize, cols: usize, factor: usize) -> Vec<u8> {
        let factor = factor.max(1);
        if factor == 1 {
            return raw.to_vec();
        }
        let (out_rows, out_cols) = (rows / factor, cols / factor);
        let area = (factor * factor) as u32;
        let mut out = Vec::with_capacity(out_rows * out_cols);
        for r in 0..out_rows {
            for c in 0..out_cols {
                let sum: u32 = (0..factor)
                    .flat_map(|dr| {
                        let row = (r * factor + dr) * cols + c * factor;
                        raw[row..row + factor].iter().map(|&p| p as u32)
                    })
                    .sum();
                out.push((sum / area) as u8);
            }
        }
        out
    }
}

/// Mean of a run of 8-bit values; `0.0` for an empty slice.
pub fn mean_level(bytes: &[u8]) -> f64 {
    if bytes.is_empty() {
        return 0.0;
    }
    bytes.iter().map(|&b| b as u64).sum::<u64>() as f64 / bytes.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: Controls = Controls {
        gain: 1.0,
        exposure: 1000.0,
    };

    #[test]
    fn dark_scene_raises_exposure_first() {
        let next = ProportionalAgc::default().adjust(20.0, START, 0.5);
        assert!(next.exposure > START.exposure);
        assert_eq!(next.gain, START.gain);
    }

    #[test]
    fn bright_scene_at_min_gain_lowers_exposure() {
        let next = ProportionalAgc::default().adjust(250.0, START, 0.5);
        assert!(next.exposure < START.exposure);
        assert_eq!(next.gain, 1.0);
    }

    #[test]
    fn pegged_settings_stay_in_bounds() {
        let agc = ProportionalAgc::default();
        let mut controls = START;
        for _ in 0..200 {
            controls = agc.adjust(0.0, controls, 0.2);
        }
        assert_eq!(controls.exposure, agc.exposure_range.1);
        assert_eq!(controls.gain, agc.gain_range.1);
    }

    #[test]
    fn on_target_is_stable() {
        let next = ProportionalAgc::default().adjust(127.0, START, 0.9);
        assert_eq!(next, START);
    }

    #[test]
    fn binning_averages_blocks() {
        #[rustfmt::skip]
        let raw = [
            0, 2, 10, 10,
            4, 6, 10, 10,
        ];
        let out = BinningDownsampler.downsample(&raw, 2, 4, 2);
        assert_eq!(out, vec![3, 10]);
    }

    #[test]
    fn mean_of_bytes() {
        assert_eq!(mean_level(&[0, 10, 20]), 10.0);
        assert_eq!(mean_level(&[]), 0.0);
    }
}
