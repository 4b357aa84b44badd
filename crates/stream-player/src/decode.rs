//! Payload decode stage.
//!
//! Turns one raw stream payload into interleaved `f32` samples:
//! - reads whole 4-byte little-endian floats, dropping any trailing partial sample
//! - optionally divides by a scale factor and hard-clamps to `[-1.0, 1.0]`
//!
//! The decoder never aliases the payload memory; every sample is copied out through
//! a bounds-checked 4-byte chunk.

/// Size of one encoded sample in bytes.
pub const BYTES_PER_SAMPLE: usize = 4;

/// Decoded samples for a single stream entry.
pub type SampleBuffer = Vec<f32>;

/// Decode `raw` into samples, normalizing when `scale` is set.
///
/// Produces exactly `raw.len() / 4` samples. Empty input yields an empty buffer.
pub fn decode(raw: &[u8], scale: Option<f32>) -> SampleBuffer {
    let samples = raw.chunks_exact(BYTES_PER_SAMPLE).map(|chunk| {
        let mut bytes = [0u8; BYTES_PER_SAMPLE];
        bytes.copy_from_slice(chunk);
        f32::from_le_bytes(bytes)
    });

    match scale {
        Some(scale) => samples.map(|s| normalize_sample(s, scale)).collect(),
        None => samples.collect(),
    }
}

/// Divide by `scale` and clamp into `[-1.0, 1.0]`.
///
/// NaN input maps to silence so it can never reach the device.
pub fn normalize_sample(sample: f32, scale: f32) -> f32 {
    let v = sample / scale;
    if v.is_nan() { 0.0 } else { v.clamp(-1.0, 1.0) }
}

/// Number of bytes at the end of `raw` that do not form a whole sample.
pub fn trailing_bytes(raw: &[u8]) -> usize {
    raw.len() % BYTES_PER_SAMPLE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(samples: &[f32]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn decode_drops_partial_trailing_bytes() {
        let mut raw = encode(&[0.25, -0.5, 0.75]);
        for extra in 0..4usize {
            let buf = decode(&raw, None);
            assert_eq!(buf.len(), 3, "extra={extra}");
            assert_eq!(buf, vec![0.25, -0.5, 0.75]);
            assert_eq!(trailing_bytes(&raw), extra);
            raw.push(0xff);
        }
    }

    #[test]
    fn decode_empty_is_empty() {
        assert!(decode(&[], None).is_empty());
        assert!(decode(&[], Some(50_000.0)).is_empty());
        assert!(decode(&[1, 2, 3], None).is_empty());
    }

    #[test]
    fn passthrough_keeps_out_of_range_samples() {
        let raw = encode(&[1.0, -2.0, 0.5, 0.0]);
        assert_eq!(raw.len(), 16);
        assert_eq!(decode(&raw, None), vec![1.0, -2.0, 0.5, 0.0]);
    }

    #[test]
    fn normalization_with_unit_scale_clamps() {
        let raw = encode(&[1.0, -2.0, 0.5, 0.0]);
        assert_eq!(decode(&raw, Some(1.0)), vec![1.0, -1.0, 0.5, 0.0]);
    }

    #[test]
    fn normalization_divides_then_clamps() {
        let raw = encode(&[25_000.0, -50_000.0, 120_000.0, -1.0e9]);
        let out = decode(&raw, Some(50_000.0));
        assert_eq!(out, vec![0.5, -1.0, 1.0, -1.0]);
    }

    #[test]
    fn normalized_output_stays_in_unit_range() {
        let inputs = [
            f32::MAX,
            f32::MIN,
            f32::INFINITY,
            f32::NEG_INFINITY,
            f32::NAN,
            1.0,
            -1.0,
            0.0,
            123.456,
        ];
        for scale in [1.0f32, 0.5, 50_000.0] {
            for s in inputs {
                let v = normalize_sample(s, scale);
                assert!((-1.0..=1.0).contains(&v), "sample={s} scale={scale} out={v}");
            }
        }
    }
}
