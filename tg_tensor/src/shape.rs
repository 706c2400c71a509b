//! Shape and stride utilities for tensors.

use std::fmt;

use crate::error::{Result, TensorError};

/// A tensor shape (dimensions). An empty shape denotes a scalar.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape(pub Vec<usize>);

impl Shape {
    /// Create a new shape from dimensions.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// Create a scalar shape (0-dimensional).
    pub fn scalar() -> Self {
        Shape(vec![])
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Get dimension at index.
    pub fn dim(&self, idx: usize) -> usize {
        self.0[idx]
    }

    /// Get dimensions as slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Total number of elements. The product of an empty shape is 1.
    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }

    /// Check if this is a scalar (0-dim tensor).
    pub fn is_scalar(&self) -> bool {
        self.0.is_empty()
    }

    /// Compute row-major (C-contiguous) strides for this shape.
    pub fn contiguous_strides(&self) -> Strides {
        let ndim = self.0.len();
        if ndim == 0 {
            return Strides(vec![]);
        }

        let mut strides = vec![1usize; ndim];
        for i in (0..ndim - 1).rev() {
            strides[i] = strides[i + 1] * self.0[i + 1];
        }
        Strides(strides)
    }

    /// Final shape of a broadcast between two shapes.
    ///
    /// Dimensions are compared right-aligned; each pair must be equal or one
    /// side must be 1. Symmetric in its arguments.
    pub fn broadcast_shapes(shape1: &Shape, shape2: &Shape) -> Result<Shape> {
        let ndim = shape1.ndim().max(shape2.ndim());
        let mut result = vec![0usize; ndim];

        for i in 0..ndim {
            let d1 = if i < shape1.ndim() {
                shape1.0[shape1.ndim() - 1 - i]
            } else {
                1
            };
            let d2 = if i < shape2.ndim() {
                shape2.0[shape2.ndim() - 1 - i]
            } else {
                1
            };

            if d1 != d2 && d1 != 1 && d2 != 1 {
                return Err(TensorError::ShapeMismatch(format!(
                    "shapes {shape1} and {shape2} are not compatible for broadcasting"
                )));
            }
            result[ndim - 1 - i] = d1.max(d2);
        }

        Ok(Shape(result))
    }

    /// True when `source` can be broadcast to `target` without shrinking.
    pub fn check_broadcast_to(source: &Shape, target: &Shape) -> bool {
        if source.ndim() > target.ndim() {
            return false;
        }

        for i in 0..target.ndim() {
            let dim_tgt = target.0[target.ndim() - 1 - i];
            let dim_src = if i < source.ndim() {
                source.0[source.ndim() - 1 - i]
            } else {
                1
            };
            if dim_src != dim_tgt && dim_src != 1 {
                return false;
            }
        }

        true
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.0)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        if self.0.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(s: [usize; N]) -> Self {
        Shape(s.to_vec())
    }
}

/// Tensor strides (step size in each dimension).
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Strides(pub Vec<usize>);

impl Strides {
    pub fn new(strides: Vec<usize>) -> Self {
        Strides(strides)
    }

    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// Compute flat index from multi-dimensional indices.
    pub fn flatten_index(&self, indices: &[usize]) -> usize {
        debug_assert_eq!(self.0.len(), indices.len());
        self.0.iter().zip(indices.iter()).map(|(s, i)| s * i).sum()
    }

    /// Recover multi-dimensional indices from a flat index.
    pub fn unflatten_index(&self, mut index: usize) -> Vec<usize> {
        let mut indices = vec![0usize; self.0.len()];
        for (i, &stride) in self.0.iter().enumerate() {
            indices[i] = index / stride;
            index %= stride;
        }
        indices
    }
}

/// Map a linear index in the broadcast shape back to the source linear index.
///
/// This is the translation used by the broadcast gather and its summing
/// inverse: the source shape is walked right-aligned against the target,
/// and size-1 source dimensions contribute index 0.
pub fn translation_index(index: usize, shape: &Shape, new_shape: &Shape) -> usize {
    let mut original_index = 0usize;
    let mut target_stride = 1usize;
    let mut original_stride = 1usize;

    let mut j = shape.ndim() as isize - 1;
    for i in (0..new_shape.ndim()).rev() {
        let dim_index = (index / target_stride) % new_shape.0[i];
        if j >= 0 && shape.0[j as usize] == new_shape.0[i] {
            original_index += dim_index * original_stride;
            original_stride *= shape.0[j as usize];
            j -= 1;
        } else if j >= 0 && shape.0[j as usize] == 1 {
            j -= 1;
        }
        target_stride *= new_shape.0[i];
    }

    original_index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_basics() {
        let s = Shape::new(vec![2, 3, 4]);
        assert_eq!(s.ndim(), 3);
        assert_eq!(s.dim(0), 2);
        assert_eq!(s.dim(2), 4);
        assert_eq!(s.numel(), 24);
        assert!(!s.is_scalar());
    }

    #[test]
    fn test_scalar_shape() {
        let s = Shape::scalar();
        assert_eq!(s.ndim(), 0);
        assert_eq!(s.numel(), 1);
        assert!(s.is_scalar());
    }

    #[test]
    fn test_contiguous_strides() {
        let s = Shape::new(vec![2, 3, 4]);
        assert_eq!(s.contiguous_strides().0, vec![12, 4, 1]);

        let s2 = Shape::new(vec![3, 4]);
        assert_eq!(s2.contiguous_strides().0, vec![4, 1]);

        assert!(Shape::scalar().contiguous_strides().0.is_empty());
    }

    #[test]
    fn test_broadcast_same_shape() {
        let a = Shape::new(vec![2, 3]);
        let b = Shape::new(vec![2, 3]);
        assert_eq!(Shape::broadcast_shapes(&a, &b).unwrap(), a);
    }

    #[test]
    fn test_broadcast_scalar() {
        let a = Shape::new(vec![2, 3]);
        let b = Shape::scalar();
        assert_eq!(Shape::broadcast_shapes(&a, &b).unwrap(), a);
    }

    #[test]
    fn test_broadcast_is_symmetric() {
        let a = Shape::new(vec![3, 4]);
        let b = Shape::new(vec![2, 3, 1]);
        assert_eq!(
            Shape::broadcast_shapes(&a, &b).unwrap(),
            Shape::broadcast_shapes(&b, &a).unwrap()
        );
        assert_eq!(
            Shape::broadcast_shapes(&a, &b).unwrap(),
            Shape::new(vec![2, 3, 4])
        );
    }

    #[test]
    fn test_broadcast_expand_ones() {
        let a = Shape::new(vec![1, 4]);
        let b = Shape::new(vec![3, 1]);
        assert_eq!(
            Shape::broadcast_shapes(&a, &b).unwrap(),
            Shape::new(vec![3, 4])
        );
    }

    #[test]
    fn test_broadcast_incompatible() {
        let a = Shape::new(vec![2, 3]);
        let b = Shape::new(vec![2, 4]);
        assert!(Shape::broadcast_shapes(&a, &b).is_err());
    }

    #[test]
    fn test_check_broadcast_to() {
        assert!(Shape::check_broadcast_to(
            &Shape::new(vec![1, 3]),
            &Shape::new(vec![2, 3])
        ));
        assert!(Shape::check_broadcast_to(
            &Shape::scalar(),
            &Shape::new(vec![2, 3])
        ));
        assert!(!Shape::check_broadcast_to(
            &Shape::new(vec![2, 3]),
            &Shape::new(vec![3])
        ));
        assert!(!Shape::check_broadcast_to(
            &Shape::new(vec![2]),
            &Shape::new(vec![2, 3])
        ));
    }

    #[test]
    fn test_flatten_unflatten() {
        let strides = Strides::new(vec![12, 4, 1]);
        assert_eq!(strides.flatten_index(&[0, 0, 0]), 0);
        assert_eq!(strides.flatten_index(&[1, 2, 3]), 12 + 8 + 3);
        assert_eq!(strides.unflatten_index(23), vec![1, 2, 3]);
        assert_eq!(strides.unflatten_index(0), vec![0, 0, 0]);
    }

    #[test]
    fn test_translation_index() {
        // [1, 3] broadcast to [2, 3]: rows repeat.
        let src = Shape::new(vec![1, 3]);
        let tgt = Shape::new(vec![2, 3]);
        let mapped: Vec<usize> = (0..6).map(|i| translation_index(i, &src, &tgt)).collect();
        assert_eq!(mapped, vec![0, 1, 2, 0, 1, 2]);

        // Scalar broadcast: everything maps to element 0.
        let src = Shape::scalar();
        let mapped: Vec<usize> = (0..6).map(|i| translation_index(i, &src, &tgt)).collect();
        assert_eq!(mapped, vec![0; 6]);

        // [3, 1] broadcast to [3, 4]: columns repeat.
        let src = Shape::new(vec![3, 1]);
        let tgt = Shape::new(vec![3, 4]);
        let mapped: Vec<usize> = (0..12).map(|i| translation_index(i, &src, &tgt)).collect();
        assert_eq!(mapped, vec![0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2]);
    }
}
