//! `TensorValue`: a typed, contiguous buffer on a device plus its shape.
//!
//! This is the eager numerical layer. Every op validates its preconditions
//! first, allocates the result, and dispatches to the owning device's
//! kernels. Mixed-dtype and mixed-shape operands are reconciled by dtype
//! promotion followed by broadcasting.

use std::fmt;
use std::sync::Arc;

use crate::device::Device;
use crate::dtype::{DataType, Element, Scalar};
use crate::error::{Result, TensorError};
use crate::shape::{Shape, Strides};

/// A multi-dimensional array of a single dtype, stored contiguously on one
/// device. The buffer's lifetime is exactly the lifetime of this value;
/// cloning reallocates and deep-copies.
pub struct TensorValue {
    dtype: DataType,
    data: *mut u8,
    size: usize,
    shape: Shape,
    strides: Strides,
    device: Arc<dyn Device>,
}

impl TensorValue {
    /// Allocate a tensor with undefined contents.
    pub fn uninit(shape: Shape, dtype: DataType, device: Arc<dyn Device>) -> Result<TensorValue> {
        let size = shape.numel();
        let data = device.allocate_typed(size, dtype)?;
        let strides = shape.contiguous_strides();
        Ok(TensorValue {
            dtype,
            data,
            size,
            shape,
            strides,
            device,
        })
    }

    /// Allocate a tensor filled with a scalar converted to `dtype`.
    pub fn full(
        scalar: Scalar,
        shape: Shape,
        dtype: DataType,
        device: Arc<dyn Device>,
    ) -> Result<TensorValue> {
        let mut result = Self::uninit(shape, dtype, device)?;
        result.fill(scalar);
        Ok(result)
    }

    /// Allocate a zero-filled tensor.
    pub fn zeros(shape: Shape, dtype: DataType, device: Arc<dyn Device>) -> Result<TensorValue> {
        Self::full(Scalar::F64(0.0), shape, dtype, device)
    }

    /// Build a tensor from host elements, converting from the element type
    /// to `dtype` during the upload.
    pub fn from_elems<T: Element>(
        data: &[T],
        shape: Shape,
        dtype: DataType,
        device: Arc<dyn Device>,
    ) -> Result<TensorValue> {
        if data.len() != shape.numel() {
            return Err(TensorError::ShapeMismatch(format!(
                "data length {} does not match shape {} ({} elements)",
                data.len(),
                shape,
                shape.numel()
            )));
        }
        let result = Self::uninit(shape, dtype, device)?;
        unsafe {
            result.device.copy_immediate(
                data.as_ptr() as *const u8,
                T::DTYPE,
                result.data,
                dtype,
                result.size,
            );
        }
        Ok(result)
    }

    // Accessors.

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &Strides {
        &self.strides
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn data_ptr(&self) -> *const u8 {
        self.data
    }

    pub fn data_mut_ptr(&mut self) -> *mut u8 {
        self.data
    }

    fn byte_len(&self) -> usize {
        self.size * self.dtype.size_in_bytes()
    }

    /// Borrow the buffer as raw bytes. Flushes pending device work first.
    pub fn raw_bytes(&self) -> &[u8] {
        self.device.commit_and_wait();
        unsafe { std::slice::from_raw_parts(self.data, self.byte_len()) }
    }

    /// Mutably borrow the buffer as raw bytes. Flushes pending device work
    /// first.
    pub fn raw_bytes_mut(&mut self) -> &mut [u8] {
        self.device.commit_and_wait();
        unsafe { std::slice::from_raw_parts_mut(self.data, self.byte_len()) }
    }

    /// Borrow the buffer as typed elements. Flushes pending device work.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        self.check_dtype::<T>("as_slice")?;
        self.device.commit_and_wait();
        Ok(unsafe { std::slice::from_raw_parts(self.data as *const T, self.size) })
    }

    /// Copy the buffer out as a typed vector.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        Ok(self.as_slice::<T>()?.to_vec())
    }

    /// Read the single element of a rank-0 tensor.
    pub fn item<T: Element>(&self) -> Result<T> {
        if !self.shape.is_scalar() {
            return Err(TensorError::ShapeMismatch(format!(
                "tensor of shape {} is not a scalar",
                self.shape
            )));
        }
        self.check_dtype::<T>("item")?;
        self.device.commit_and_wait();
        Ok(unsafe { *(self.data as *const T) })
    }

    /// Read one element by multi-dimensional index.
    pub fn value_at<T: Element>(&self, indices: &[usize]) -> Result<T> {
        if indices.len() != self.shape.ndim() {
            return Err(TensorError::ShapeMismatch(format!(
                "index of rank {} used on tensor of shape {}",
                indices.len(),
                self.shape
            )));
        }
        self.check_dtype::<T>("value_at")?;
        self.device.commit_and_wait();
        let flat = self.strides.flatten_index(indices);
        Ok(unsafe { *(self.data as *const T).add(flat) })
    }

    fn check_dtype<T: Element>(&self, op: &'static str) -> Result<()> {
        if T::DTYPE != self.dtype {
            return Err(TensorError::DTypeUnsupported {
                op,
                dtype: self.dtype,
            });
        }
        Ok(())
    }

    /// Overwrite every element with a scalar converted to this dtype.
    pub fn fill(&mut self, scalar: Scalar) {
        unsafe { self.device.fill(scalar, self.size, self.data, self.dtype) };
    }

    /// Convert to another dtype; a deep copy even when the dtype matches.
    pub fn to(&self, new_dtype: DataType) -> Result<TensorValue> {
        let result = Self::uninit(self.shape.clone(), new_dtype, self.device.clone())?;
        unsafe {
            self.device
                .copy_immediate(self.data, self.dtype, result.data, new_dtype, self.size);
        }
        Ok(result)
    }

    /// Move the buffer to another device, freeing the old allocation.
    pub fn to_device(&mut self, new_device: Arc<dyn Device>) -> Result<()> {
        if Arc::ptr_eq(&self.device, &new_device) {
            return Ok(());
        }
        self.device.commit_and_wait();
        let new_data = new_device.allocate_typed(self.size, self.dtype)?;
        unsafe {
            new_device.copy_immediate(self.data, self.dtype, new_data, self.dtype, self.size);
            self.device.deallocate(self.data, self.byte_len());
        }
        self.data = new_data;
        self.device = new_device;
        Ok(())
    }

    /// Same elements under a new shape. The element counts must match.
    pub fn reshape(&self, new_shape: &Shape) -> Result<TensorValue> {
        if new_shape.numel() != self.size {
            return Err(TensorError::ShapeMismatch(format!(
                "reshape element count mismatch ({} vs {})",
                self.size,
                new_shape.numel()
            )));
        }
        let result = Self::uninit(new_shape.clone(), self.dtype, self.device.clone())?;
        unsafe {
            self.device
                .copy_immediate(self.data, self.dtype, result.data, self.dtype, self.size);
        }
        Ok(result)
    }

    /// Materialize this tensor stretched to a broadcast-compatible shape.
    pub fn broadcast_to(&self, new_shape: &Shape) -> Result<TensorValue> {
        if !Shape::check_broadcast_to(&self.shape, new_shape) {
            return Err(TensorError::ShapeMismatch(format!(
                "shape {} is not broadcastable to {}",
                self.shape, new_shape
            )));
        }
        let result_shape = Shape::broadcast_shapes(&self.shape, new_shape)?;
        let result = Self::uninit(result_shape, self.dtype, self.device.clone())?;
        unsafe {
            self.device.broadcast_to(
                self.data,
                result.data,
                result.size,
                &self.shape,
                &result.shape,
                self.dtype,
            );
        }
        Ok(result)
    }

    /// Sum a broadcast-shaped tensor back down to the original shape. The
    /// dual of [`TensorValue::broadcast_to`].
    pub fn reduce_to(&self, original: &Shape) -> Result<TensorValue> {
        // The scatter accumulates, so the destination starts at zero.
        let result = Self::zeros(original.clone(), self.dtype, self.device.clone())?;
        unsafe {
            self.device.reduce_to(
                self.data,
                result.data,
                self.size,
                &self.shape,
                original,
                self.dtype,
            );
        }
        Ok(result)
    }

    // Elementwise binary operations. Matching shapes and dtypes take the
    // direct path; anything else goes through promotion and broadcasting.

    fn prepare_tensors(
        lhs: &TensorValue,
        rhs: &TensorValue,
    ) -> Result<(TensorValue, TensorValue, TensorValue)> {
        let mut lhs_adj = lhs.clone();
        let mut rhs_adj = rhs.clone();

        let mut promoted = lhs.dtype;
        if lhs.dtype != rhs.dtype {
            promoted = lhs.dtype.promote(rhs.dtype);
            lhs_adj = lhs_adj.to(promoted)?;
            rhs_adj = rhs_adj.to(promoted)?;
        }

        if lhs_adj.shape != rhs_adj.shape {
            let bc = Shape::broadcast_shapes(&lhs_adj.shape, &rhs_adj.shape)?;
            lhs_adj = lhs_adj.broadcast_to(&bc)?;
            rhs_adj = rhs_adj.broadcast_to(&bc)?;
        }

        let result = Self::uninit(lhs_adj.shape.clone(), promoted, lhs_adj.device.clone())?;
        Ok((lhs_adj, rhs_adj, result))
    }

    pub fn add(&self, other: &TensorValue) -> Result<TensorValue> {
        if self.shape == other.shape && self.dtype == other.dtype {
            let result = Self::uninit(self.shape.clone(), self.dtype, self.device.clone())?;
            unsafe { self.device.add(self.data, other.data, self.size, result.data, self.dtype) };
            return Ok(result);
        }
        let (lhs, rhs, result) = Self::prepare_tensors(self, other)?;
        unsafe { lhs.device.add(lhs.data, rhs.data, lhs.size, result.data, result.dtype) };
        Ok(result)
    }

    pub fn sub(&self, other: &TensorValue) -> Result<TensorValue> {
        if self.shape == other.shape && self.dtype == other.dtype {
            let result = Self::uninit(self.shape.clone(), self.dtype, self.device.clone())?;
            unsafe { self.device.sub(self.data, other.data, self.size, result.data, self.dtype) };
            return Ok(result);
        }
        let (lhs, rhs, result) = Self::prepare_tensors(self, other)?;
        unsafe { lhs.device.sub(lhs.data, rhs.data, lhs.size, result.data, result.dtype) };
        Ok(result)
    }

    pub fn mul(&self, other: &TensorValue) -> Result<TensorValue> {
        if self.shape == other.shape && self.dtype == other.dtype {
            let result = Self::uninit(self.shape.clone(), self.dtype, self.device.clone())?;
            unsafe { self.device.mul(self.data, other.data, self.size, result.data, self.dtype) };
            return Ok(result);
        }
        let (lhs, rhs, result) = Self::prepare_tensors(self, other)?;
        unsafe { lhs.device.mul(lhs.data, rhs.data, lhs.size, result.data, result.dtype) };
        Ok(result)
    }

    pub fn div(&self, other: &TensorValue) -> Result<TensorValue> {
        if self.shape == other.shape && self.dtype == other.dtype {
            let result = Self::uninit(self.shape.clone(), self.dtype, self.device.clone())?;
            unsafe { self.device.div(self.data, other.data, self.size, result.data, self.dtype) };
            return Ok(result);
        }
        let (lhs, rhs, result) = Self::prepare_tensors(self, other)?;
        unsafe { lhs.device.div(lhs.data, rhs.data, lhs.size, result.data, result.dtype) };
        Ok(result)
    }

    /// Elementwise `self^exp`, with the usual promotion and broadcasting.
    pub fn pow(&self, exp: &TensorValue) -> Result<TensorValue> {
        if self.shape == exp.shape && self.dtype == exp.dtype {
            let result = Self::uninit(self.shape.clone(), self.dtype, self.device.clone())?;
            unsafe { self.device.pow(self.data, exp.data, self.size, result.data, self.dtype) };
            return Ok(result);
        }
        let (lhs, rhs, result) = Self::prepare_tensors(self, exp)?;
        unsafe { lhs.device.pow(lhs.data, rhs.data, lhs.size, result.data, result.dtype) };
        Ok(result)
    }

    // In-place variants. When promotion or broadcasting widens the operand,
    // the left-hand side is reassigned, converted back to its own dtype.

    pub fn add_in_place(&mut self, other: &TensorValue) -> Result<()> {
        if self.shape == other.shape && self.dtype == other.dtype {
            unsafe { self.device.add(self.data, other.data, self.size, self.data, self.dtype) };
            return Ok(());
        }
        let original_dtype = self.dtype;
        let (lhs, rhs, result) = Self::prepare_tensors(self, other)?;
        unsafe { lhs.device.add(lhs.data, rhs.data, lhs.size, result.data, result.dtype) };
        *self = result.to(original_dtype)?;
        Ok(())
    }

    pub fn sub_in_place(&mut self, other: &TensorValue) -> Result<()> {
        if self.shape == other.shape && self.dtype == other.dtype {
            unsafe { self.device.sub(self.data, other.data, self.size, self.data, self.dtype) };
            return Ok(());
        }
        let original_dtype = self.dtype;
        let (lhs, rhs, result) = Self::prepare_tensors(self, other)?;
        unsafe { lhs.device.sub(lhs.data, rhs.data, lhs.size, result.data, result.dtype) };
        *self = result.to(original_dtype)?;
        Ok(())
    }

    pub fn mul_in_place(&mut self, other: &TensorValue) -> Result<()> {
        if self.shape == other.shape && self.dtype == other.dtype {
            unsafe { self.device.mul(self.data, other.data, self.size, self.data, self.dtype) };
            return Ok(());
        }
        let original_dtype = self.dtype;
        let (lhs, rhs, result) = Self::prepare_tensors(self, other)?;
        unsafe { lhs.device.mul(lhs.data, rhs.data, lhs.size, result.data, result.dtype) };
        *self = result.to(original_dtype)?;
        Ok(())
    }

    pub fn div_in_place(&mut self, other: &TensorValue) -> Result<()> {
        if self.shape == other.shape && self.dtype == other.dtype {
            unsafe { self.device.div(self.data, other.data, self.size, self.data, self.dtype) };
            return Ok(());
        }
        let original_dtype = self.dtype;
        let (lhs, rhs, result) = Self::prepare_tensors(self, other)?;
        unsafe { lhs.device.div(lhs.data, rhs.data, lhs.size, result.data, result.dtype) };
        *self = result.to(original_dtype)?;
        Ok(())
    }

    // Scalar arithmetic. The scalar keeps its own dtype until the kernel
    // converts it to the tensor's dtype.

    pub fn add_scalar(&self, scalar: Scalar) -> Result<TensorValue> {
        let result = Self::uninit(self.shape.clone(), self.dtype, self.device.clone())?;
        unsafe { self.device.add_scalar(self.data, scalar, self.size, result.data, self.dtype) };
        Ok(result)
    }

    pub fn sub_scalar(&self, scalar: Scalar) -> Result<TensorValue> {
        let result = Self::uninit(self.shape.clone(), self.dtype, self.device.clone())?;
        unsafe { self.device.sub_scalar(self.data, scalar, self.size, result.data, self.dtype) };
        Ok(result)
    }

    /// `scalar - self`.
    pub fn rsub_scalar(&self, scalar: Scalar) -> Result<TensorValue> {
        let result = Self::uninit(self.shape.clone(), self.dtype, self.device.clone())?;
        unsafe { self.device.rev_sub_scalar(scalar, self.data, self.size, result.data, self.dtype) };
        Ok(result)
    }

    pub fn mul_scalar(&self, scalar: Scalar) -> Result<TensorValue> {
        let result = Self::uninit(self.shape.clone(), self.dtype, self.device.clone())?;
        unsafe { self.device.mul_scalar(self.data, scalar, self.size, result.data, self.dtype) };
        Ok(result)
    }

    pub fn div_scalar(&self, scalar: Scalar) -> Result<TensorValue> {
        let result = Self::uninit(self.shape.clone(), self.dtype, self.device.clone())?;
        unsafe { self.device.div_scalar(self.data, scalar, self.size, result.data, self.dtype) };
        Ok(result)
    }

    /// `scalar / self`.
    pub fn rdiv_scalar(&self, scalar: Scalar) -> Result<TensorValue> {
        let result = Self::uninit(self.shape.clone(), self.dtype, self.device.clone())?;
        unsafe { self.device.rev_div_scalar(scalar, self.data, self.size, result.data, self.dtype) };
        Ok(result)
    }

    /// Elementwise negation.
    pub fn neg(&self) -> Result<TensorValue> {
        let result = Self::uninit(self.shape.clone(), self.dtype, self.device.clone())?;
        unsafe { self.device.unary(self.data, self.size, result.data, self.dtype) };
        Ok(result)
    }

    // Unary math.

    pub fn sqrt(&self) -> Result<TensorValue> {
        let result = Self::uninit(self.shape.clone(), self.dtype, self.device.clone())?;
        unsafe { self.device.sqrt(self.data, self.size, result.data, self.dtype) };
        Ok(result)
    }

    pub fn sin(&self) -> Result<TensorValue> {
        let result = Self::uninit(self.shape.clone(), self.dtype, self.device.clone())?;
        unsafe { self.device.sin(self.data, self.size, result.data, self.dtype) };
        Ok(result)
    }

    pub fn cos(&self) -> Result<TensorValue> {
        let result = Self::uninit(self.shape.clone(), self.dtype, self.device.clone())?;
        unsafe { self.device.cos(self.data, self.size, result.data, self.dtype) };
        Ok(result)
    }

    pub fn tanh(&self) -> Result<TensorValue> {
        let result = Self::uninit(self.shape.clone(), self.dtype, self.device.clone())?;
        unsafe { self.device.tanh(self.data, self.size, result.data, self.dtype) };
        Ok(result)
    }

    pub fn log(&self) -> Result<TensorValue> {
        let result = Self::uninit(self.shape.clone(), self.dtype, self.device.clone())?;
        unsafe { self.device.log(self.data, self.size, result.data, self.dtype) };
        Ok(result)
    }

    pub fn exp(&self) -> Result<TensorValue> {
        let result = Self::uninit(self.shape.clone(), self.dtype, self.device.clone())?;
        unsafe { self.device.exp(self.data, self.size, result.data, self.dtype) };
        Ok(result)
    }

    // Reductions.

    /// Sum every element into a rank-0 tensor.
    pub fn sum(&self) -> Result<TensorValue> {
        let result = Self::uninit(Shape::scalar(), self.dtype, self.device.clone())?;
        unsafe { self.device.sum(self.data, self.size, result.data, self.dtype) };
        Ok(result)
    }

    /// Mean of every element as a rank-0 tensor.
    pub fn mean(&self) -> Result<TensorValue> {
        let result = Self::uninit(Shape::scalar(), self.dtype, self.device.clone())?;
        unsafe { self.device.mean(self.data, self.size, result.data, self.dtype) };
        Ok(result)
    }

    /// Maximum element as a rank-0 tensor.
    pub fn max(&self) -> Result<TensorValue> {
        let result = Self::uninit(Shape::scalar(), self.dtype, self.device.clone())?;
        unsafe { self.device.max(self.data, self.size, result.data, self.dtype) };
        Ok(result)
    }

    /// Sum along one dimension.
    pub fn sum_dim(&self, dim: usize, keep_dim: bool) -> Result<TensorValue> {
        if dim >= self.shape.ndim() {
            return Err(TensorError::ShapeMismatch(format!(
                "reduction dim {dim} out of range for shape {}",
                self.shape
            )));
        }
        let mut target = self.shape.clone();
        target.0[dim] = 1;
        let mut result = Self::zeros(target.clone(), self.dtype, self.device.clone())?;
        unsafe {
            self.device
                .reduce_to(self.data, result.data, self.size, &self.shape, &target, self.dtype);
        }
        if !keep_dim {
            result.shape.0.remove(dim);
            result.strides = result.shape.contiguous_strides();
        }
        Ok(result)
    }

    /// Maximum along one dimension.
    pub fn max_dim(&self, dim: usize, keep_dim: bool) -> Result<TensorValue> {
        if dim >= self.shape.ndim() {
            return Err(TensorError::ShapeMismatch(format!(
                "reduction dim {dim} out of range for shape {}",
                self.shape
            )));
        }
        let mut target = self.shape.clone();
        target.0[dim] = 1;
        // Start from the dtype's lowest value; the scatter keeps maxima.
        let mut result = Self::full(
            Scalar::F64(f64::NEG_INFINITY),
            target.clone(),
            self.dtype,
            self.device.clone(),
        )?;
        unsafe {
            self.device
                .max_to(self.data, result.data, self.size, &self.shape, &target, self.dtype);
        }
        if !keep_dim {
            result.shape.0.remove(dim);
            result.strides = result.shape.contiguous_strides();
        }
        Ok(result)
    }

    /// 2-D dense matrix multiplication.
    pub fn matmul(&self, b: &TensorValue) -> Result<TensorValue> {
        if self.shape.ndim() != 2 || b.shape.ndim() != 2 {
            return Err(TensorError::ShapeMismatch(format!(
                "matmul requires 2-D tensors, got {} and {}",
                self.shape, b.shape
            )));
        }
        if self.shape.dim(1) != b.shape.dim(0) {
            return Err(TensorError::ShapeMismatch(format!(
                "matmul inner dimensions do not match ({} vs {})",
                self.shape, b.shape
            )));
        }

        let result_shape = Shape::new(vec![self.shape.dim(0), b.shape.dim(1)]);

        if self.dtype != b.dtype {
            let promoted = self.dtype.promote(b.dtype);
            let lhs = self.to(promoted)?;
            let rhs = b.to(promoted)?;
            let result = Self::uninit(result_shape, promoted, lhs.device.clone())?;
            unsafe {
                lhs.device
                    .matmul(lhs.data, &lhs.shape, rhs.data, &rhs.shape, result.data, promoted);
            }
            return Ok(result);
        }

        let result = Self::uninit(result_shape, self.dtype, self.device.clone())?;
        unsafe {
            self.device
                .matmul(self.data, &self.shape, b.data, &b.shape, result.data, self.dtype);
        }
        Ok(result)
    }

    /// Swap two axes, producing a fresh contiguous tensor.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<TensorValue> {
        if dim0 >= self.shape.ndim() || dim1 >= self.shape.ndim() {
            return Err(TensorError::ShapeMismatch(format!(
                "transpose dims ({dim0}, {dim1}) out of range for shape {}",
                self.shape
            )));
        }
        let mut new_shape = self.shape.clone();
        new_shape.0.swap(dim0, dim1);
        let result = Self::uninit(new_shape, self.dtype, self.device.clone())?;
        unsafe {
            self.device.transpose(
                dim0,
                dim1,
                self.data,
                &self.shape,
                &self.strides,
                &result.strides,
                result.size,
                result.data,
                self.dtype,
            );
        }
        Ok(result)
    }

    fn print_typed<T: Element>(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.device.commit_and_wait();

        let read = |flat: usize| -> T { unsafe { *(self.data as *const T).add(flat) } };

        if self.shape.is_scalar() {
            writeln!(f, "{}\n", read(0))?;
        } else if self.shape.ndim() == 1 {
            for i in 0..self.shape.dim(0) {
                writeln!(f, "  {}", read(i))?;
            }
            writeln!(f)?;
        } else {
            // Row-major 2-D slabs over the trailing two dimensions.
            let ndim = self.shape.ndim();
            let rows = self.shape.dim(ndim - 2);
            let cols = self.shape.dim(ndim - 1);
            let slab_count: usize = self.shape.dims()[..ndim - 2].iter().product();

            let mut lead = vec![0usize; ndim - 2];
            for slab in 0..slab_count.max(1) {
                if ndim > 2 {
                    write!(f, "(")?;
                    for (i, idx) in lead.iter().enumerate() {
                        write!(f, "{}", idx)?;
                        if i < lead.len() - 1 {
                            write!(f, ",")?;
                        }
                    }
                    writeln!(f, ",.,.) =")?;
                }

                for i in 0..rows {
                    for j in 0..cols {
                        let mut indices = lead.clone();
                        indices.push(i);
                        indices.push(j);
                        write!(f, "  {}", read(self.strides.flatten_index(&indices)))?;
                    }
                    writeln!(f)?;
                }
                writeln!(f)?;

                if slab + 1 < slab_count {
                    for d in (0..lead.len()).rev() {
                        lead[d] += 1;
                        if lead[d] < self.shape.dim(d) {
                            break;
                        }
                        lead[d] = 0;
                    }
                }
            }
        }

        write!(f, "[ {}{{", self.dtype.name())?;
        for (i, d) in self.shape.dims().iter().enumerate() {
            write!(f, "{}", d)?;
            if i < self.shape.ndim() - 1 {
                write!(f, ",")?;
            }
        }
        writeln!(f, "}} ]")
    }
}

impl Drop for TensorValue {
    fn drop(&mut self) {
        unsafe { self.device.deallocate(self.data, self.byte_len()) };
    }
}

impl Clone for TensorValue {
    fn clone(&self) -> Self {
        let result = Self::uninit(self.shape.clone(), self.dtype, self.device.clone())
            .expect("allocation failed while cloning tensor");
        unsafe {
            self.device
                .copy_immediate(self.data, self.dtype, result.data, self.dtype, self.size);
        }
        result
    }
}

impl fmt::Debug for TensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorValue")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("size", &self.size)
            .finish()
    }
}

impl fmt::Display for TensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dtype {
            DataType::F64 => self.print_typed::<f64>(f),
            DataType::F32 => self.print_typed::<f32>(f),
            DataType::F16 => self.print_typed::<half::f16>(f),
            DataType::BF16 => self.print_typed::<half::bf16>(f),
            DataType::I64 => self.print_typed::<i64>(f),
            DataType::I32 => self.print_typed::<i32>(f),
            DataType::I16 => self.print_typed::<i16>(f),
            DataType::I8 => self.print_typed::<i8>(f),
            DataType::U8 => self.print_typed::<u8>(f),
        }
    }
}

// Operator overloads, reference-to-reference. Shape or dtype mismatches
// follow the promote-then-broadcast path and abort on incompatibility.

impl std::ops::Add for &TensorValue {
    type Output = TensorValue;
    fn add(self, rhs: &TensorValue) -> TensorValue {
        TensorValue::add(self, rhs).expect("tensor addition failed")
    }
}

impl std::ops::Sub for &TensorValue {
    type Output = TensorValue;
    fn sub(self, rhs: &TensorValue) -> TensorValue {
        TensorValue::sub(self, rhs).expect("tensor subtraction failed")
    }
}

impl std::ops::Mul for &TensorValue {
    type Output = TensorValue;
    fn mul(self, rhs: &TensorValue) -> TensorValue {
        TensorValue::mul(self, rhs).expect("tensor multiplication failed")
    }
}

impl std::ops::Div for &TensorValue {
    type Output = TensorValue;
    fn div(self, rhs: &TensorValue) -> TensorValue {
        TensorValue::div(self, rhs).expect("tensor division failed")
    }
}

impl std::ops::Neg for &TensorValue {
    type Output = TensorValue;
    fn neg(self) -> TensorValue {
        TensorValue::neg(self).expect("tensor negation failed")
    }
}

impl std::ops::Add<f32> for &TensorValue {
    type Output = TensorValue;
    fn add(self, rhs: f32) -> TensorValue {
        self.add_scalar(Scalar::F32(rhs)).expect("tensor-scalar addition failed")
    }
}

impl std::ops::Sub<f32> for &TensorValue {
    type Output = TensorValue;
    fn sub(self, rhs: f32) -> TensorValue {
        self.sub_scalar(Scalar::F32(rhs)).expect("tensor-scalar subtraction failed")
    }
}

impl std::ops::Mul<f32> for &TensorValue {
    type Output = TensorValue;
    fn mul(self, rhs: f32) -> TensorValue {
        self.mul_scalar(Scalar::F32(rhs)).expect("tensor-scalar multiplication failed")
    }
}

impl std::ops::Div<f32> for &TensorValue {
    type Output = TensorValue;
    fn div(self, rhs: f32) -> TensorValue {
        self.div_scalar(Scalar::F32(rhs)).expect("tensor-scalar division failed")
    }
}

impl std::ops::Add<&TensorValue> for f32 {
    type Output = TensorValue;
    fn add(self, rhs: &TensorValue) -> TensorValue {
        rhs.add_scalar(Scalar::F32(self)).expect("scalar-tensor addition failed")
    }
}

impl std::ops::Sub<&TensorValue> for f32 {
    type Output = TensorValue;
    fn sub(self, rhs: &TensorValue) -> TensorValue {
        rhs.rsub_scalar(Scalar::F32(self)).expect("scalar-tensor subtraction failed")
    }
}

impl std::ops::Mul<&TensorValue> for f32 {
    type Output = TensorValue;
    fn mul(self, rhs: &TensorValue) -> TensorValue {
        rhs.mul_scalar(Scalar::F32(self)).expect("scalar-tensor multiplication failed")
    }
}

impl std::ops::Div<&TensorValue> for f32 {
    type Output = TensorValue;
    fn div(self, rhs: &TensorValue) -> TensorValue {
        rhs.rdiv_scalar(Scalar::F32(self)).expect("scalar-tensor division failed")
    }
}
