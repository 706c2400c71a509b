//! Device abstraction: the contract for all numerical kernels.
//!
//! Every kernel has a default implementation backed by the scalar CPU loops
//! in [`cpu`]; an accelerator backend overrides the methods it can run on
//! hardware and falls through to the same CPU functions for the rest.
//!
//! Kernels take raw byte pointers plus an explicit [`DataType`] so a single
//! trait object serves every dtype. Callers validate shapes and sizes before
//! dispatch; kernels do not validate again. In-place variants pass the same
//! pointer as input and output, which is why the contract is expressed with
//! pointers rather than slices.

use crate::dtype::{DataType, Scalar};
use crate::error::{Result, TensorError};
use crate::shape::{Shape, Strides};

pub mod cpu;

/// Kind of device backing a tensor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cpu,
    Metal,
}

/// The capability set every backend provides.
///
/// # Safety
///
/// All kernel methods are unsafe: the caller guarantees that each pointer
/// refers to a live buffer on this device large enough for `size` elements
/// of the given dtype, and that distinct input/output buffers do not
/// partially overlap (exact aliasing of an input with the output is allowed
/// and is how the in-place operators are implemented).
pub trait Device: Send + Sync {
    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
    }

    /// Allocate a raw buffer of at least `bytes` bytes.
    fn allocate(&self, bytes: usize) -> Result<*mut u8>;

    /// Allocate a buffer for `count` elements of `dtype`. Backends may pad
    /// the request for vector alignment.
    fn allocate_typed(&self, count: usize, dtype: DataType) -> Result<*mut u8> {
        self.allocate(count * dtype.size_in_bytes())
    }

    /// Release a buffer previously returned by [`Device::allocate`] with the
    /// same byte count.
    ///
    /// # Safety
    /// `ptr` must originate from this device's allocator and not be used
    /// afterwards.
    unsafe fn deallocate(&self, ptr: *mut u8, bytes: usize);

    // Elementwise binary, equal-size contiguous buffers of the same dtype.

    unsafe fn add(&self, a: *const u8, b: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        cpu::add(a, b, size, result, dtype)
    }

    unsafe fn sub(&self, a: *const u8, b: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        cpu::sub(a, b, size, result, dtype)
    }

    unsafe fn mul(&self, a: *const u8, b: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        cpu::mul(a, b, size, result, dtype)
    }

    unsafe fn div(&self, a: *const u8, b: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        cpu::div(a, b, size, result, dtype)
    }

    // Scalar broadcast variants. The scalar carries its own dtype and is
    // converted to the kernel dtype explicitly.

    unsafe fn add_scalar(&self, a: *const u8, scalar: Scalar, size: usize, result: *mut u8, dtype: DataType) {
        cpu::add_scalar(a, scalar, size, result, dtype)
    }

    unsafe fn sub_scalar(&self, a: *const u8, scalar: Scalar, size: usize, result: *mut u8, dtype: DataType) {
        cpu::sub_scalar(a, scalar, size, result, dtype)
    }

    /// `scalar - a[i]`.
    unsafe fn rev_sub_scalar(&self, scalar: Scalar, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        cpu::rev_sub_scalar(scalar, a, size, result, dtype)
    }

    unsafe fn mul_scalar(&self, a: *const u8, scalar: Scalar, size: usize, result: *mut u8, dtype: DataType) {
        cpu::mul_scalar(a, scalar, size, result, dtype)
    }

    unsafe fn div_scalar(&self, a: *const u8, scalar: Scalar, size: usize, result: *mut u8, dtype: DataType) {
        cpu::div_scalar(a, scalar, size, result, dtype)
    }

    /// `scalar / a[i]`.
    unsafe fn rev_div_scalar(&self, scalar: Scalar, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        cpu::rev_div_scalar(scalar, a, size, result, dtype)
    }

    /// Elementwise negation.
    unsafe fn unary(&self, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        cpu::unary(a, size, result, dtype)
    }

    /// Fill with a scalar converted to the target dtype.
    unsafe fn fill(&self, scalar: Scalar, size: usize, result: *mut u8, dtype: DataType) {
        cpu::fill(scalar, size, result, dtype)
    }

    // Whole-buffer reductions into a single element.

    unsafe fn sum(&self, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        cpu::sum(a, size, result, dtype)
    }

    unsafe fn mean(&self, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        cpu::mean(a, size, result, dtype)
    }

    unsafe fn max(&self, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        cpu::max(a, size, result, dtype)
    }

    // Unary elementwise transcendentals.

    unsafe fn sqrt(&self, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        cpu::sqrt(a, size, result, dtype)
    }

    unsafe fn sin(&self, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        cpu::sin(a, size, result, dtype)
    }

    unsafe fn cos(&self, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        cpu::cos(a, size, result, dtype)
    }

    unsafe fn tanh(&self, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        cpu::tanh(a, size, result, dtype)
    }

    unsafe fn log(&self, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        cpu::log(a, size, result, dtype)
    }

    unsafe fn exp(&self, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        cpu::exp(a, size, result, dtype)
    }

    /// Elementwise `a[i]^b[i]`.
    unsafe fn pow(&self, a: *const u8, b: *const u8, size: usize, result: *mut u8, dtype: DataType) {
        cpu::pow(a, b, size, result, dtype)
    }

    /// 2-D dense matrix multiply `A[m,k] @ B[k,n] -> C[m,n]`.
    unsafe fn matmul(
        &self,
        a: *const u8,
        a_shape: &Shape,
        b: *const u8,
        b_shape: &Shape,
        result: *mut u8,
        dtype: DataType,
    ) {
        cpu::matmul(a, a_shape, b, b_shape, result, dtype)
    }

    /// General N-D transpose via per-element stride remap.
    #[allow(clippy::too_many_arguments)]
    unsafe fn transpose(
        &self,
        dim0: usize,
        dim1: usize,
        data: *const u8,
        shape: &Shape,
        strides: &Strides,
        new_strides: &Strides,
        size: usize,
        result: *mut u8,
        dtype: DataType,
    ) {
        cpu::transpose(dim0, dim1, data, shape, strides, new_strides, size, result, dtype)
    }

    /// Dense copy with dtype conversion when source and destination differ.
    unsafe fn copy(&self, src: *const u8, src_dtype: DataType, dst: *mut u8, dst_dtype: DataType, size: usize) {
        cpu::copy(src, src_dtype, dst, dst_dtype, size)
    }

    /// Same as [`Device::copy`] but synchronous: the data is in place when
    /// this returns.
    unsafe fn copy_immediate(&self, src: *const u8, src_dtype: DataType, dst: *mut u8, dst_dtype: DataType, size: usize) {
        self.copy(src, src_dtype, dst, dst_dtype, size);
        self.commit_and_wait();
    }

    /// Gather following broadcast rules: `size` is the element count of the
    /// destination (target shape).
    unsafe fn broadcast_to(
        &self,
        src: *const u8,
        dst: *mut u8,
        size: usize,
        shape: &Shape,
        new_shape: &Shape,
        dtype: DataType,
    ) {
        cpu::broadcast_to(src, dst, size, shape, new_shape, dtype)
    }

    /// Summing scatter, the inverse of [`Device::broadcast_to`]: accumulates
    /// into `dst`, which must be zero-initialized by the caller. `size` is
    /// the element count of the source (broadcast shape).
    unsafe fn reduce_to(
        &self,
        src: *const u8,
        dst: *mut u8,
        size: usize,
        shape: &Shape,
        new_shape: &Shape,
        dtype: DataType,
    ) {
        cpu::reduce_to(src, dst, size, shape, new_shape, dtype)
    }

    /// Maximizing scatter: like [`Device::reduce_to`] but keeps the maximum.
    /// `dst` must be pre-filled with the dtype's lowest value.
    unsafe fn max_to(
        &self,
        src: *const u8,
        dst: *mut u8,
        size: usize,
        shape: &Shape,
        new_shape: &Shape,
        dtype: DataType,
    ) {
        cpu::max_to(src, dst, size, shape, new_shape, dtype)
    }

    /// Flush all pending work and block until it completes. A no-op for
    /// synchronous backends.
    fn commit_and_wait(&self) {}
}

/// Alignment for CPU buffers; matches the widest vector extensions in use.
const CPU_ALLOC_ALIGNMENT: usize = 64;

/// The reference device: scalar loops over host memory, always available,
/// used as the correctness oracle and the fall-through target of
/// accelerators.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuDevice;

impl CpuDevice {
    pub fn new() -> Self {
        CpuDevice
    }

    fn layout(bytes: usize) -> std::alloc::Layout {
        // A zero-byte tensor still owns a live allocation.
        std::alloc::Layout::from_size_align(bytes.max(1), CPU_ALLOC_ALIGNMENT)
            .expect("invalid allocation layout")
    }
}

impl Device for CpuDevice {
    fn allocate(&self, bytes: usize) -> Result<*mut u8> {
        let ptr = unsafe { std::alloc::alloc(Self::layout(bytes)) };
        if ptr.is_null() {
            return Err(TensorError::AllocationFailure { bytes });
        }
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: *mut u8, bytes: usize) {
        std::alloc::dealloc(ptr, Self::layout(bytes));
    }
}
