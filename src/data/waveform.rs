//! Waveform block decoding.
//!
//! The instrument answers `:WAV:DATA?` with a length-prefixed binary block of
//! unsigned 8-bit samples and `:WAV:PRE?` with a ten-field ASCII preamble
//! describing how to scale them. [`decode`] turns one (block, preamble) pair
//! into a calibrated time/voltage series.
//!
//! Decoding is a pure function: identical inputs always yield bit-identical
//! output. There is no I/O and no hidden state, which is what makes the
//! numeric policies below testable in isolation.
//!
//! # Revision Variance
//!
//! Instrument revisions disagree on two numeric conventions, so both are
//! selectable rather than hard-coded:
//!
//! - [`CalibrationPolicy`]: whether the vertical origin is subtracted before
//!   or after the increment scaling. The two formulas are not algebraically
//!   equivalent.
//! - [`TimeAxisPolicy`]: whether the time axis ascends or descends from the
//!   horizontal origin.

use serde::{Deserialize, Serialize};

use crate::error::{ScopeError, ShotResult};

/// Ten-field metadata record describing one waveform transfer.
///
/// Queried fresh before every channel read; never cached across channels,
/// because instrument state changes between channel selections.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformPreamble {
    /// Transfer format code (0 = byte).
    pub format: i32,
    /// Acquisition type code (0 = normal).
    pub acquisition_type: i32,
    /// Number of points in the transferred block, including the trailing
    /// sentinel sample.
    pub points: usize,
    /// Averaging count.
    pub count: i32,
    /// Seconds per sample.
    pub x_increment: f64,
    /// Horizontal origin in seconds.
    pub x_origin: f64,
    /// Horizontal reference point.
    pub x_reference: f64,
    /// Volts per level.
    pub y_increment: f64,
    /// Vertical origin in levels.
    pub y_origin: f64,
    /// Vertical reference level.
    pub y_reference: f64,
}

impl std::str::FromStr for WaveformPreamble {
    type Err = ScopeError;

    /// Parse the comma-separated ASCII reply to `:WAV:PRE?`.
    fn from_str(s: &str) -> ShotResult<Self> {
        let fields: Vec<f64> = s
            .trim()
            .split(',')
            .map(|f| {
                f.trim()
                    .parse::<f64>()
                    .map_err(|_| ScopeError::MalformedPreamble(format!("non-numeric field '{f}'")))
            })
            .collect::<ShotResult<_>>()?;

        if fields.len() != 10 {
            return Err(ScopeError::MalformedPreamble(format!(
                "expected 10 fields, got {}",
                fields.len()
            )));
        }
        if fields[2] < 1.0 {
            return Err(ScopeError::MalformedPreamble(format!(
                "point count must be positive, got {}",
                fields[2]
            )));
        }

        Ok(Self {
            format: fields[0] as i32,
            acquisition_type: fields[1] as i32,
            points: fields[2] as usize,
            count: fields[3] as i32,
            x_increment: fields[4],
            x_origin: fields[5],
            x_reference: fields[6],
            y_increment: fields[7],
            y_origin: fields[8],
            y_reference: fields[9],
        })
    }
}

/// Vertical calibration formula selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationPolicy {
    /// `(sample - y_reference - y_origin) * y_increment`
    #[default]
    OffsetBeforeScale,
    /// `(sample - y_reference) * y_increment - y_origin`
    OffsetAfterScale,
}

impl CalibrationPolicy {
    /// Convert one raw sample level to volts.
    pub fn to_volts(self, sample: u8, pre: &WaveformPreamble) -> f64 {
        let s = f64::from(sample);
        match self {
            CalibrationPolicy::OffsetBeforeScale => {
                (s - pre.y_reference - pre.y_origin) * pre.y_increment
            }
            CalibrationPolicy::OffsetAfterScale => {
                (s - pre.y_reference) * pre.y_increment - pre.y_origin
            }
        }
    }
}

/// Time-axis direction selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeAxisPolicy {
    /// `t[i] = i * x_increment - x_origin`
    #[default]
    Ascending,
    /// `t[i] = -i * x_increment - x_origin`
    Descending,
}

impl TimeAxisPolicy {
    /// Time of sample `i` relative to the trigger.
    pub fn at(self, i: usize, pre: &WaveformPreamble) -> f64 {
        let i = i as f64;
        match self {
            TimeAxisPolicy::Ascending => i * pre.x_increment - pre.x_origin,
            TimeAxisPolicy::Descending => -i * pre.x_increment - pre.x_origin,
        }
    }
}

/// One calibrated time/voltage series.
///
/// Both sequences always have the same length: the preamble's point count
/// minus the one trailing sentinel sample every observed block format
/// appends.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    /// Seconds relative to the trigger, per sample.
    pub time: Vec<f64>,
    /// Calibrated volts, per sample.
    pub voltage: Vec<f64>,
}

impl Waveform {
    /// Number of samples in the series.
    pub fn len(&self) -> usize {
        self.voltage.len()
    }

    /// Returns true when the series holds no samples.
    pub fn is_empty(&self) -> bool {
        self.voltage.is_empty()
    }
}

/// Strip the block's length-prefix header and return the declared payload.
///
/// Blocks arrive as `#<n><len, n digits><payload>[terminator]`. The declared
/// length is authoritative; trailing bytes past it (a line terminator) are
/// ignored, missing bytes are an error.
fn sample_payload(raw: &[u8]) -> ShotResult<&[u8]> {
    if raw.first() != Some(&b'#') {
        return Err(ScopeError::MalformedBlock(
            "missing '#' length-prefix header".into(),
        ));
    }
    let n_digits = match raw.get(1) {
        Some(d @ b'1'..=b'9') => (d - b'0') as usize,
        _ => {
            return Err(ScopeError::MalformedBlock(
                "header digit count is not 1-9".into(),
            ))
        }
    };
    let digits = raw.get(2..2 + n_digits).ok_or_else(|| {
        ScopeError::MalformedBlock("header truncated before length digits".into())
    })?;
    let len = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| ScopeError::MalformedBlock("non-numeric length digits".into()))?;
    if len == 0 {
        return Err(ScopeError::MalformedBlock("empty sample payload".into()));
    }
    let start = 2 + n_digits;
    raw.get(start..start + len).ok_or_else(|| {
        ScopeError::MalformedBlock(format!(
            "payload truncated: header declares {len} bytes, {} available",
            raw.len() - start
        ))
    })
}

/// Decode one raw block against its preamble into a calibrated [`Waveform`].
///
/// The final payload byte is a sentinel, not a sample, and is dropped; both
/// output sequences have length `points - 1`.
pub fn decode(
    raw: &[u8],
    pre: &WaveformPreamble,
    calibration: CalibrationPolicy,
    time_axis: TimeAxisPolicy,
) -> ShotResult<Waveform> {
    let payload = sample_payload(raw)?;
    if payload.len() != pre.points {
        return Err(ScopeError::MalformedBlock(format!(
            "payload carries {} samples, preamble declares {}",
            payload.len(),
            pre.points
        )));
    }

    let samples = &payload[..payload.len() - 1];
    let voltage = samples
        .iter()
        .map(|&s| calibration.to_volts(s, pre))
        .collect();
    let time = (0..samples.len()).map(|i| time_axis.at(i, pre)).collect();

    Ok(Waveform { time, voltage })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preamble(points: usize) -> WaveformPreamble {
        WaveformPreamble {
            format: 0,
            acquisition_type: 0,
            points,
            count: 1,
            x_increment: 1e-6,
            x_origin: 2e-6,
            x_reference: 0.0,
            y_increment: 0.01,
            y_origin: 2.0,
            y_reference: 128.0,
        }
    }

    fn block(samples: &[u8]) -> Vec<u8> {
        let mut raw = format!("#9{:09}", samples.len()).into_bytes();
        raw.extend_from_slice(samples);
        raw.push(b'\n');
        raw
    }

    #[test]
    fn test_preamble_parse() {
        let pre: WaveformPreamble = "0,0,1200,1,1.0e-06,2.0e-06,0,0.01,2.0,128"
            .parse()
            .unwrap();
        assert_eq!(pre.points, 1200);
        assert_eq!(pre.count, 1);
        assert_eq!(pre.x_increment, 1e-6);
        assert_eq!(pre.y_reference, 128.0);
    }

    #[test]
    fn test_preamble_rejects_short_record() {
        let err = "0,0,1200".parse::<WaveformPreamble>().unwrap_err();
        assert!(matches!(err, ScopeError::MalformedPreamble(_)));
    }

    #[test]
    fn test_preamble_rejects_zero_points() {
        let err = "0,0,0,1,1e-6,0,0,0.01,0,128"
            .parse::<WaveformPreamble>()
            .unwrap_err();
        assert!(matches!(err, ScopeError::MalformedPreamble(_)));
    }

    #[test]
    fn test_decode_drops_sentinel_sample() {
        let raw = block(&[128, 130, 132, 0]);
        let wf = decode(
            &raw,
            &preamble(4),
            CalibrationPolicy::OffsetBeforeScale,
            TimeAxisPolicy::Ascending,
        )
        .unwrap();
        assert_eq!(wf.len(), 3);
        assert_eq!(wf.time.len(), wf.voltage.len());
    }

    #[test]
    fn test_decode_is_deterministic() {
        let raw = block(&[10, 20, 30, 40, 50]);
        let pre = preamble(5);
        let a = decode(
            &raw,
            &pre,
            CalibrationPolicy::OffsetBeforeScale,
            TimeAxisPolicy::Ascending,
        )
        .unwrap();
        let b = decode(
            &raw,
            &pre,
            CalibrationPolicy::OffsetBeforeScale,
            TimeAxisPolicy::Ascending,
        )
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.voltage.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
                   b.voltage.iter().map(|v| v.to_bits()).collect::<Vec<_>>());
    }

    #[test]
    fn test_calibration_offset_before_scale() {
        let raw = block(&[138, 0]);
        let wf = decode(
            &raw,
            &preamble(2),
            CalibrationPolicy::OffsetBeforeScale,
            TimeAxisPolicy::Ascending,
        )
        .unwrap();
        // (138 - 128 - 2) * 0.01
        assert!((wf.voltage[0] - 0.08).abs() < 1e-12);
    }

    #[test]
    fn test_calibration_offset_after_scale() {
        let raw = block(&[138, 0]);
        let wf = decode(
            &raw,
            &preamble(2),
            CalibrationPolicy::OffsetAfterScale,
            TimeAxisPolicy::Ascending,
        )
        .unwrap();
        // (138 - 128) * 0.01 - 2.0
        assert!((wf.voltage[0] + 1.9).abs() < 1e-12);
    }

    #[test]
    fn test_time_axis_directions() {
        let raw = block(&[1, 2, 3, 0]);
        let pre = preamble(4);
        let asc = decode(
            &raw,
            &pre,
            CalibrationPolicy::OffsetBeforeScale,
            TimeAxisPolicy::Ascending,
        )
        .unwrap();
        let desc = decode(
            &raw,
            &pre,
            CalibrationPolicy::OffsetBeforeScale,
            TimeAxisPolicy::Descending,
        )
        .unwrap();
        // t[i] = +/- i * 1e-6 - 2e-6
        assert!((asc.time[2] - 0e-6).abs() < 1e-18);
        assert!((desc.time[2] + 4e-6).abs() < 1e-18);
        assert!(asc.time[0] == desc.time[0]);
    }

    #[test]
    fn test_length_matches_points_minus_one() {
        for n in [2usize, 17, 1200] {
            let samples: Vec<u8> = (0..n).map(|i| (i % 256) as u8).collect();
            let raw = block(&samples);
            let wf = decode(
                &raw,
                &preamble(n),
                CalibrationPolicy::OffsetBeforeScale,
                TimeAxisPolicy::Ascending,
            )
            .unwrap();
            assert_eq!(wf.len(), n - 1);
        }
    }

    #[test]
    fn test_decode_rejects_missing_header() {
        let err = decode(
            b"no header here",
            &preamble(4),
            CalibrationPolicy::OffsetBeforeScale,
            TimeAxisPolicy::Ascending,
        )
        .unwrap_err();
        assert!(matches!(err, ScopeError::MalformedBlock(_)));
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let mut raw = format!("#9{:09}", 100).into_bytes();
        raw.extend_from_slice(&[1, 2, 3]);
        let err = decode(
            &raw,
            &preamble(100),
            CalibrationPolicy::OffsetBeforeScale,
            TimeAxisPolicy::Ascending,
        )
        .unwrap_err();
        assert!(matches!(err, ScopeError::MalformedBlock(_)));
    }

    #[test]
    fn test_decode_rejects_point_count_mismatch() {
        let raw = block(&[1, 2, 3, 4]);
        let err = decode(
            &raw,
            &preamble(9),
            CalibrationPolicy::OffsetBeforeScale,
            TimeAxisPolicy::Ascending,
        )
        .unwrap_err();
        assert!(matches!(err, ScopeError::MalformedBlock(_)));
    }
}
