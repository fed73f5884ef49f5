use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Tensor {
    shape: Vec<usize>,
    values: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![shape],
                actual: vec![vec![values.len()]],
            });
        }
        Ok(Self { shape, values })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            values: vec![0.0; len],
        }
    }

    pub fn vector(values: Vec<f32>) -> Self {
        Self {
            shape: vec![values.len()],
            values,
        }
    }

    /// Fills a tensor of `shape` by calling `fill` once per scalar, in row-major order.
    pub fn from_fn(shape: Vec<usize>, mut fill: impl FnMut() -> f32) -> Self {
        let len = shape.iter().product();
        let values = (0..len).map(|_| fill()).collect();
        Self { shape, values }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub fn shapes_of(tensors: &[Tensor]) -> Vec<Vec<usize>> {
    tensors.iter().map(|tensor| tensor.shape.clone()).collect()
}

/// Fails with `ShapeMismatch` unless `actual` has exactly the `expected` shape sequence.
pub fn ensure_same_shapes(expected: &[Tensor], actual: &[Tensor]) -> Result<()> {
    let same = expected.len() == actual.len()
        && expected
            .iter()
            .zip(actual)
            .all(|(a, b)| a.shape == b.shape);
    if same {
        Ok(())
    } else {
        Err(Error::ShapeMismatch {
            expected: shapes_of(expected),
            actual: shapes_of(actual),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_value_count_that_disagrees_with_shape() {
        let err = Tensor::new(vec![2, 3], vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn zeros_allocates_product_of_dimensions() {
        let tensor = Tensor::zeros(vec![4, 16]);
        assert_eq!(tensor.len(), 64);
        assert!(tensor.values().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn shape_check_compares_count_and_dimensions() {
        let a = vec![Tensor::zeros(vec![2, 2]), Tensor::zeros(vec![2])];
        let b = vec![Tensor::zeros(vec![2, 2]), Tensor::zeros(vec![2])];
        assert!(ensure_same_shapes(&a, &b).is_ok());
        assert!(ensure_same_shapes(&a, &b[..1]).is_err());
        let c = vec![Tensor::zeros(vec![4]), Tensor::zeros(vec![2])];
        assert!(ensure_same_shapes(&a, &c).is_err());
    }

    #[test]
    fn serializes_shape_alongside_values() {
        let tensor = Tensor::new(vec![1, 2], vec![0.5, -1.0]).unwrap();
        let json = serde_json::to_value(&tensor).unwrap();
        assert_eq!(json["shape"], serde_json::json!([1, 2]));
        assert_eq!(json["values"], serde_json::json!([0.5, -1.0]));
    }
}
