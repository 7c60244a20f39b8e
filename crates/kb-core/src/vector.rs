//! Vector math and on-disk encoding.
//!
//! Embedding vectors are stored as BLOB columns of little-endian f32s.
//! Distance is plain L2; similarity conversion happens in the search
//! layer.

use crate::error::{KbError, KbResult};

/// Normalize a vector to unit length in place. Zero vectors are left as-is.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// L2 (Euclidean) distance between two equal-length vectors.
pub fn l2_distance(a: &[f32], b: &[f32]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = f64::from(x - y);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// Encode a vector as little-endian f32 bytes for BLOB storage.
pub fn to_blob(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode a BLOB of little-endian f32 bytes back into a vector.
pub fn from_blob(blob: &[u8]) -> KbResult<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(KbError::Serialization(format!(
            "vector blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    let mut out = Vec::with_capacity(blob.len() / 4);
    for bytes in blob.chunks_exact(4) {
        out.push(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
    }
    Ok(out)
}
