// Dense f32 tensors handed between pipeline stages

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Row-major f32 tensor owned on the CPU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl DenseTensor {
    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; shape.iter().product()],
        }
    }

    /// Wrap existing data; `None` if the element count does not match the shape
    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> Option<Self> {
        (shape.iter().product::<usize>() == data.len()).then(|| Self {
            shape: shape.to_vec(),
            data,
        })
    }

    /// Standard-normal values; an unseeded generator draws fresh values each call
    pub fn randn(shape: &[usize], seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let numel: usize = shape.iter().product();
        let data = (0..numel).map(|_| rng.sample(StandardNormal)).collect();
        Self {
            shape: shape.to_vec(),
            data,
        }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Shape as ONNX-style signed dims
    pub fn dims_i64(&self) -> Vec<i64> {
        self.shape.iter().map(|d| *d as i64).collect()
    }
}

/// Dummy image batch used to trace and verify an export
pub fn build_synthetic_input(
    batch_size: usize,
    channels: usize,
    height: usize,
    width: usize,
    seed: Option<u64>,
) -> DenseTensor {
    DenseTensor::randn(&[batch_size, channels, height, width], seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_input_shape_is_stable() {
        for _ in 0..3 {
            let input = build_synthetic_input(1, 3, 256, 192, None);
            assert_eq!(input.shape, vec![1, 3, 256, 192]);
            assert_eq!(input.numel(), 3 * 256 * 192);
        }
    }

    #[test]
    fn test_unseeded_values_differ_between_calls() {
        let a = build_synthetic_input(1, 3, 8, 8, None);
        let b = build_synthetic_input(1, 3, 8, 8, None);
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn test_seeded_values_repeat() {
        let a = build_synthetic_input(2, 3, 8, 8, Some(7));
        let b = build_synthetic_input(2, 3, 8, 8, Some(7));
        assert_eq!(a, b);
    }

    #[test]
    fn test_randn_roughly_standard() {
        let t = DenseTensor::randn(&[10_000], Some(1));
        let mean = t.data.iter().sum::<f32>() / t.numel() as f32;
        let var = t.data.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / t.numel() as f32;
        assert!(mean.abs() < 0.05, "mean {}", mean);
        assert!((var - 1.0).abs() < 0.1, "var {}", var);
    }

    #[test]
    fn test_from_vec_checks_len() {
        assert!(DenseTensor::from_vec(&[2, 2], vec![0.0; 4]).is_some());
        assert!(DenseTensor::from_vec(&[2, 2], vec![0.0; 3]).is_none());
    }
}
