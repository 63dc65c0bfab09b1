//! Feature-vector helpers: cosine similarity, normalisation and the
//! little-endian f32 BLOB encoding used for every stored vector.

use crate::AffinityError;

/// Cosine similarity of two equal-length vectors. Zero vectors compare as 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Scale to unit L2 norm. A zero vector is returned unchanged.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

/// Normalised mean of a set of equal-length vectors, `None` for an empty set.
pub fn centroid(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let mut sum = vec![0.0f32; first.len()];
    for v in vectors {
        for (s, x) in sum.iter_mut().zip(v) {
            *s += x;
        }
    }
    Some(normalize(&sum))
}

/// Verify every vector has `expected` components.
pub fn check_dims<'a, I>(vectors: I, expected: usize) -> Result<(), AffinityError>
where
    I: IntoIterator<Item = &'a Vec<f32>>,
{
    for v in vectors {
        if v.len() != expected {
            return Err(AffinityError::SignalShapeMismatch {
                expected,
                found: v.len(),
            });
        }
    }
    Ok(())
}

/// Reject vectors carrying NaN or infinite components.
pub fn check_finite(what: &str, v: &[f32]) -> Result<(), AffinityError> {
    match v.iter().position(|x| !x.is_finite()) {
        Some(i) => Err(AffinityError::Invalid(format!(
            "{what} has a non-finite component at index {i}"
        ))),
        None => Ok(()),
    }
}

pub fn encode(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

pub fn decode(bytes: &[u8]) -> Result<Vec<f32>, AffinityError> {
    if bytes.len() % 4 != 0 {
        return Err(AffinityError::Invalid(format!(
            "vector blob of {} bytes is not a whole number of f32s",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_and_orthogonal() {
        assert!((cosine(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]) - 1.0).abs() < 1e-6);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_with_zero_vector_is_zero() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn centroid_is_unit_length() {
        let c = centroid(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let norm: f32 = c.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((c[0] - c[1]).abs() < 1e-6);
        assert!(centroid(&[]).is_none());
    }

    #[test]
    fn check_dims_reports_offender() {
        let vs = vec![vec![0.0; 4], vec![0.0; 3]];
        match check_dims(&vs, 4) {
            Err(AffinityError::SignalShapeMismatch { expected, found }) => {
                assert_eq!(expected, 4);
                assert_eq!(found, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn check_finite_names_the_index() {
        assert!(check_finite("image vector", &[0.0, 1.0]).is_ok());
        match check_finite("image vector", &[0.0, f32::NAN]) {
            Err(AffinityError::Invalid(msg)) => assert!(msg.contains("index 1"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(check_finite("v", &[f32::INFINITY]).is_err());
    }

    #[test]
    fn blob_decode_rejects_ragged_bytes() {
        let bytes = encode(&[0.25, -1.5]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(decode(&bytes).unwrap(), vec![0.25, -1.5]);
        assert!(decode(&bytes[..7]).is_err());
    }
}
