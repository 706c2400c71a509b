//! Reference CPU kernels: straightforward scalar loops dispatched through
//! static function tables indexed by dtype.
//!
//! These free functions back the default [`super::Device`] methods and are
//! also called directly by accelerator backends when an op or dtype has no
//! hardware path.
//!
//! # Safety
//!
//! Every function trusts the caller for buffer sizes and dtype agreement;
//! validation happens one layer up, in `TensorValue`.

use crate::dtype::{DataType, Element, Scalar, DATA_TYPE_COUNT};
use crate::shape::{translation_index, Shape, Strides};

use half::{bf16, f16};

/// Expands to a per-dtype table of instantiations of a generic kernel.
macro_rules! dtype_table {
    ($func:ident) => {
        [
            $func::<f64>,
            $func::<f32>,
            $func::<f16>,
            $func::<bf16>,
            $func::<i64>,
            $func::<i32>,
            $func::<i16>,
            $func::<i8>,
            $func::<u8>,
        ]
    };
}

// Elementwise binary kernels.

macro_rules! binary_kernel {
    ($name:ident, $generic:ident, |$x:ident, $y:ident| $expr:expr) => {
        unsafe fn $generic<T: Element>(a: *const u8, b: *const u8, size: usize, result: *mut u8) {
            let a = a as *const T;
            let b = b as *const T;
            let res = result as *mut T;
            for i in 0..size {
                let $x = *a.add(i);
                let $y = *b.add(i);
                *res.add(i) = $expr;
            }
        }

        pub unsafe fn $name(a: *const u8, b: *const u8, size: usize, result: *mut u8, dtype: DataType) {
            static TABLE: [unsafe fn(*const u8, *const u8, usize, *mut u8); DATA_TYPE_COUNT] =
                dtype_table!($generic);
            TABLE[dtype.index()](a, b, size, result)
        }
    };
}

binary_kernel!(add, add_generic, |x, y| x + y);
binary_kernel!(sub, sub_generic, |x, y| x - y);
binary_kernel!(mul, mul_generic, |x, y| x * y);
binary_kernel!(div, div_generic, |x, y| x / y);
binary_kernel!(pow, pow_generic, |x, y| T::from_f64(x.to_f64().powf(y.to_f64())));

// Scalar broadcast kernels. The scalar converts to the kernel dtype once,
// outside the loop.

macro_rules! scalar_kernel {
    ($name:ident, $generic:ident, |$x:ident, $s:ident| $expr:expr) => {
        unsafe fn $generic<T: Element>(a: *const u8, scalar: Scalar, size: usize, result: *mut u8) {
            let a = a as *const T;
            let res = result as *mut T;
            let $s: T = scalar.get();
            for i in 0..size {
                let $x = *a.add(i);
                *res.add(i) = $expr;
            }
        }

        pub unsafe fn $name(a: *const u8, scalar: Scalar, size: usize, result: *mut u8, dtype: DataType) {
            static TABLE: [unsafe fn(*const u8, Scalar, usize, *mut u8); DATA_TYPE_COUNT] =
                dtype_table!($generic);
            TABLE[dtype.index()](a, scalar, size, result)
        }
    };
}

scalar_kernel!(add_scalar, add_scalar_generic, |x, s| x + s);
scalar_kernel!(sub_scalar, sub_scalar_generic, |x, s| x - s);
scalar_kernel!(mul_scalar, mul_scalar_generic, |x, s| x * s);
scalar_kernel!(div_scalar, div_scalar_generic, |x, s| x / s);

unsafe fn rev_sub_scalar_generic<T: Element>(scalar: Scalar, a: *const u8, size: usize, result: *mut u8) {
    let a = a as *const T;
    let res = result as *mut T;
    let s: T = scalar.get();
    for i in 0..size {
        *res.add(i) = s - *a.add(i);
    }
}

pub unsafe fn rev_sub_scalar(scalar: Scalar, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
    static TABLE: [unsafe fn(Scalar, *const u8, usize, *mut u8); DATA_TYPE_COUNT] =
        dtype_table!(rev_sub_scalar_generic);
    TABLE[dtype.index()](scalar, a, size, result)
}

unsafe fn rev_div_scalar_generic<T: Element>(scalar: Scalar, a: *const u8, size: usize, result: *mut u8) {
    let a = a as *const T;
    let res = result as *mut T;
    let s: T = scalar.get();
    for i in 0..size {
        *res.add(i) = s / *a.add(i);
    }
}

pub unsafe fn rev_div_scalar(scalar: Scalar, a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
    static TABLE: [unsafe fn(Scalar, *const u8, usize, *mut u8); DATA_TYPE_COUNT] =
        dtype_table!(rev_div_scalar_generic);
    TABLE[dtype.index()](scalar, a, size, result)
}

// Unary kernels.

macro_rules! unary_kernel {
    ($name:ident, $generic:ident, |$x:ident| $expr:expr) => {
        unsafe fn $generic<T: Element>(a: *const u8, size: usize, result: *mut u8) {
            let a = a as *const T;
            let res = result as *mut T;
            for i in 0..size {
                let $x = *a.add(i);
                *res.add(i) = $expr;
            }
        }

        pub unsafe fn $name(a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
            static TABLE: [unsafe fn(*const u8, usize, *mut u8); DATA_TYPE_COUNT] =
                dtype_table!($generic);
            TABLE[dtype.index()](a, size, result)
        }
    };
}

unary_kernel!(unary, unary_generic, |x| T::from_f64(-x.to_f64()));
unary_kernel!(sqrt, sqrt_generic, |x| T::from_f64(x.to_f64().sqrt()));
unary_kernel!(sin, sin_generic, |x| T::from_f64(x.to_f64().sin()));
unary_kernel!(cos, cos_generic, |x| T::from_f64(x.to_f64().cos()));
unary_kernel!(tanh, tanh_generic, |x| T::from_f64(x.to_f64().tanh()));
unary_kernel!(log, log_generic, |x| T::from_f64(x.to_f64().ln()));
unary_kernel!(exp, exp_generic, |x| T::from_f64(x.to_f64().exp()));

// Fill.

unsafe fn fill_generic<T: Element>(scalar: Scalar, size: usize, result: *mut u8) {
    let res = result as *mut T;
    let value: T = scalar.get();
    for i in 0..size {
        *res.add(i) = value;
    }
}

pub unsafe fn fill(scalar: Scalar, size: usize, result: *mut u8, dtype: DataType) {
    static TABLE: [unsafe fn(Scalar, usize, *mut u8); DATA_TYPE_COUNT] = dtype_table!(fill_generic);
    TABLE[dtype.index()](scalar, size, result)
}

// Whole-buffer reductions.

unsafe fn sum_generic<T: Element>(a: *const u8, size: usize, result: *mut u8) {
    let a = a as *const T;
    let mut acc = T::ZERO;
    for i in 0..size {
        acc = acc + *a.add(i);
    }
    *(result as *mut T) = acc;
}

pub unsafe fn sum(a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
    static TABLE: [unsafe fn(*const u8, usize, *mut u8); DATA_TYPE_COUNT] = dtype_table!(sum_generic);
    TABLE[dtype.index()](a, size, result)
}

unsafe fn mean_generic<T: Element>(a: *const u8, size: usize, result: *mut u8) {
    let a = a as *const T;
    let mut acc = T::ZERO;
    for i in 0..size {
        acc = acc + *a.add(i);
    }
    *(result as *mut T) = acc / T::from_f64(size as f64);
}

pub unsafe fn mean(a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
    static TABLE: [unsafe fn(*const u8, usize, *mut u8); DATA_TYPE_COUNT] = dtype_table!(mean_generic);
    TABLE[dtype.index()](a, size, result)
}

unsafe fn max_generic<T: Element>(a: *const u8, size: usize, result: *mut u8) {
    debug_assert!(size > 0);
    let a = a as *const T;
    let mut best = *a;
    for i in 1..size {
        let v = *a.add(i);
        if v > best {
            best = v;
        }
    }
    *(result as *mut T) = best;
}

pub unsafe fn max(a: *const u8, size: usize, result: *mut u8, dtype: DataType) {
    static TABLE: [unsafe fn(*const u8, usize, *mut u8); DATA_TYPE_COUNT] = dtype_table!(max_generic);
    TABLE[dtype.index()](a, size, result)
}

// Matrix multiply.

unsafe fn matmul_generic<T: Element>(
    a: *const u8,
    a_shape: &Shape,
    b: *const u8,
    b_shape: &Shape,
    result: *mut u8,
) {
    let a = a as *const T;
    let b = b as *const T;
    let res = result as *mut T;

    let m = a_shape.dim(0);
    let inner = a_shape.dim(1);
    let n = b_shape.dim(1);

    for i in 0..m {
        for j in 0..n {
            let mut acc = T::ZERO;
            for k in 0..inner {
                acc = acc + *a.add(i * inner + k) * *b.add(k * n + j);
            }
            *res.add(i * n + j) = acc;
        }
    }
}

pub unsafe fn matmul(
    a: *const u8,
    a_shape: &Shape,
    b: *const u8,
    b_shape: &Shape,
    result: *mut u8,
    dtype: DataType,
) {
    static TABLE: [unsafe fn(*const u8, &Shape, *const u8, &Shape, *mut u8); DATA_TYPE_COUNT] =
        dtype_table!(matmul_generic);
    TABLE[dtype.index()](a, a_shape, b, b_shape, result)
}

// Transpose.

#[allow(clippy::too_many_arguments)]
unsafe fn transpose_generic<T: Element>(
    dim0: usize,
    dim1: usize,
    data: *const u8,
    strides: &Strides,
    new_strides: &Strides,
    size: usize,
    result: *mut u8,
) {
    let data = data as *const T;
    let res = result as *mut T;

    for i in 0..size {
        let mut indices = strides.unflatten_index(i);
        indices.swap(dim0, dim1);
        let new_index = new_strides.flatten_index(&indices);
        *res.add(new_index) = *data.add(i);
    }
}

#[allow(clippy::too_many_arguments)]
pub unsafe fn transpose(
    dim0: usize,
    dim1: usize,
    data: *const u8,
    _shape: &Shape,
    strides: &Strides,
    new_strides: &Strides,
    size: usize,
    result: *mut u8,
    dtype: DataType,
) {
    static TABLE: [unsafe fn(usize, usize, *const u8, &Strides, &Strides, usize, *mut u8);
        DATA_TYPE_COUNT] = dtype_table!(transpose_generic);
    TABLE[dtype.index()](dim0, dim1, data, strides, new_strides, size, result)
}

// Copy with dtype conversion.

unsafe fn conversion_copy_generic<S: Element, D: Element>(src: *const u8, dst: *mut u8, size: usize) {
    let src = src as *const S;
    let dst = dst as *mut D;
    for i in 0..size {
        *dst.add(i) = D::from_f64((*src.add(i)).to_f64());
    }
}

macro_rules! conv_row {
    ($src:ty) => {
        [
            conversion_copy_generic::<$src, f64>,
            conversion_copy_generic::<$src, f32>,
            conversion_copy_generic::<$src, f16>,
            conversion_copy_generic::<$src, bf16>,
            conversion_copy_generic::<$src, i64>,
            conversion_copy_generic::<$src, i32>,
            conversion_copy_generic::<$src, i16>,
            conversion_copy_generic::<$src, i8>,
            conversion_copy_generic::<$src, u8>,
        ]
    };
}

pub unsafe fn copy(src: *const u8, src_dtype: DataType, dst: *mut u8, dst_dtype: DataType, size: usize) {
    if src_dtype == dst_dtype {
        std::ptr::copy_nonoverlapping(src, dst, size * src_dtype.size_in_bytes());
        return;
    }

    static TABLE: [[unsafe fn(*const u8, *mut u8, usize); DATA_TYPE_COUNT]; DATA_TYPE_COUNT] = [
        conv_row!(f64),
        conv_row!(f32),
        conv_row!(f16),
        conv_row!(bf16),
        conv_row!(i64),
        conv_row!(i32),
        conv_row!(i16),
        conv_row!(i8),
        conv_row!(u8),
    ];
    TABLE[src_dtype.index()][dst_dtype.index()](src, dst, size)
}

// Broadcast gather and its scatter inverses.

unsafe fn broadcast_to_generic<T: Element>(
    src: *const u8,
    dst: *mut u8,
    size: usize,
    shape: &Shape,
    new_shape: &Shape,
) {
    let src = src as *const T;
    let dst = dst as *mut T;
    for index in 0..size {
        *dst.add(index) = *src.add(translation_index(index, shape, new_shape));
    }
}

pub unsafe fn broadcast_to(
    src: *const u8,
    dst: *mut u8,
    size: usize,
    shape: &Shape,
    new_shape: &Shape,
    dtype: DataType,
) {
    static TABLE: [unsafe fn(*const u8, *mut u8, usize, &Shape, &Shape); DATA_TYPE_COUNT] =
        dtype_table!(broadcast_to_generic);
    TABLE[dtype.index()](src, dst, size, shape, new_shape)
}

unsafe fn reduce_to_generic<T: Element>(
    src: *const u8,
    dst: *mut u8,
    size: usize,
    shape: &Shape,
    new_shape: &Shape,
) {
    let src = src as *const T;
    let dst = dst as *mut T;
    // Each element of the reduced tensor is used by several elements of the
    // broadcast tensor; summation aggregates all of those contributions.
    // `index` lives in the broadcast space, so the translation decomposes it
    // by `shape` and lands in `new_shape`.
    for index in 0..size {
        let target = translation_index(index, new_shape, shape);
        *dst.add(target) = *dst.add(target) + *src.add(index);
    }
}

pub unsafe fn reduce_to(
    src: *const u8,
    dst: *mut u8,
    size: usize,
    shape: &Shape,
    new_shape: &Shape,
    dtype: DataType,
) {
    static TABLE: [unsafe fn(*const u8, *mut u8, usize, &Shape, &Shape); DATA_TYPE_COUNT] =
        dtype_table!(reduce_to_generic);
    TABLE[dtype.index()](src, dst, size, shape, new_shape)
}

unsafe fn max_to_generic<T: Element>(
    src: *const u8,
    dst: *mut u8,
    size: usize,
    shape: &Shape,
    new_shape: &Shape,
) {
    let src = src as *const T;
    let dst = dst as *mut T;
    for index in 0..size {
        let target = translation_index(index, new_shape, shape);
        let v = *src.add(index);
        if v > *dst.add(target) {
            *dst.add(target) = v;
        }
    }
}

pub unsafe fn max_to(
    src: *const u8,
    dst: *mut u8,
    size: usize,
    shape: &Shape,
    new_shape: &Shape,
    dtype: DataType,
) {
    static TABLE: [unsafe fn(*const u8, *mut u8, usize, &Shape, &Shape); DATA_TYPE_COUNT] =
        dtype_table!(max_to_generic);
    TABLE[dtype.index()](src, dst, size, shape, new_shape)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_binary(f: unsafe fn(*const u8, *const u8, usize, *mut u8, DataType), a: &[f32], b: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0f32; a.len()];
        unsafe {
            f(
                a.as_ptr() as *const u8,
                b.as_ptr() as *const u8,
                a.len(),
                out.as_mut_ptr() as *mut u8,
                DataType::F32,
            );
        }
        out
    }

    #[test]
    fn test_elementwise_f32() {
        let a = [1.0f32, 2.0, 3.0];
        let b = [4.0f32, 5.0, 6.0];
        assert_eq!(run_binary(add, &a, &b), vec![5.0, 7.0, 9.0]);
        assert_eq!(run_binary(sub, &a, &b), vec![-3.0, -3.0, -3.0]);
        assert_eq!(run_binary(mul, &a, &b), vec![4.0, 10.0, 18.0]);
        assert_eq!(run_binary(div, &b, &a), vec![4.0, 2.5, 2.0]);
    }

    #[test]
    fn test_elementwise_i32() {
        let a = [1i32, 2, 3];
        let b = [10i32, 20, 30];
        let mut out = [0i32; 3];
        unsafe {
            add(
                a.as_ptr() as *const u8,
                b.as_ptr() as *const u8,
                3,
                out.as_mut_ptr() as *mut u8,
                DataType::I32,
            );
        }
        assert_eq!(out, [11, 22, 33]);
    }

    #[test]
    fn test_scalar_ops() {
        let a = [1.0f32, 2.0, 4.0];
        let mut out = [0.0f32; 3];
        unsafe {
            rev_div_scalar(
                Scalar::F32(8.0),
                a.as_ptr() as *const u8,
                3,
                out.as_mut_ptr() as *mut u8,
                DataType::F32,
            );
        }
        assert_eq!(out, [8.0, 4.0, 2.0]);

        unsafe {
            rev_sub_scalar(
                Scalar::F64(1.0),
                a.as_ptr() as *const u8,
                3,
                out.as_mut_ptr() as *mut u8,
                DataType::F32,
            );
        }
        assert_eq!(out, [0.0, -1.0, -3.0]);
    }

    #[test]
    fn test_reductions() {
        let a = [1.0f32, 2.0, 3.0, 4.0];
        let mut out = 0.0f32;
        unsafe {
            sum(a.as_ptr() as *const u8, 4, &mut out as *mut f32 as *mut u8, DataType::F32);
        }
        assert_eq!(out, 10.0);
        unsafe {
            mean(a.as_ptr() as *const u8, 4, &mut out as *mut f32 as *mut u8, DataType::F32);
        }
        assert_eq!(out, 2.5);
        unsafe {
            max(a.as_ptr() as *const u8, 4, &mut out as *mut f32 as *mut u8, DataType::F32);
        }
        assert_eq!(out, 4.0);
    }

    #[test]
    fn test_matmul() {
        // 2x3 @ 3x2 = 2x2
        let a = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [7.0f32, 8.0, 9.0, 10.0, 11.0, 12.0];
        let mut out = [0.0f32; 4];
        unsafe {
            matmul(
                a.as_ptr() as *const u8,
                &Shape::new(vec![2, 3]),
                b.as_ptr() as *const u8,
                &Shape::new(vec![3, 2]),
                out.as_mut_ptr() as *mut u8,
                DataType::F32,
            );
        }
        assert_eq!(out, [58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_transpose() {
        let a = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut out = [0.0f32; 6];
        let shape = Shape::new(vec![2, 3]);
        let new_shape = Shape::new(vec![3, 2]);
        unsafe {
            transpose(
                0,
                1,
                a.as_ptr() as *const u8,
                &shape,
                &shape.contiguous_strides(),
                &new_shape.contiguous_strides(),
                6,
                out.as_mut_ptr() as *mut u8,
                DataType::F32,
            );
        }
        assert_eq!(out, [1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_conversion_copy() {
        let a = [1.5f32, -2.5, 3.0];
        let mut out = [0.0f64; 3];
        unsafe {
            copy(
                a.as_ptr() as *const u8,
                DataType::F32,
                out.as_mut_ptr() as *mut u8,
                DataType::F64,
                3,
            );
        }
        assert_eq!(out, [1.5, -2.5, 3.0]);

        let mut back = [0.0f32; 3];
        unsafe {
            copy(
                out.as_ptr() as *const u8,
                DataType::F64,
                back.as_mut_ptr() as *mut u8,
                DataType::F32,
                3,
            );
        }
        assert_eq!(back, a);
    }

    #[test]
    fn test_broadcast_then_reduce() {
        // [1, 3] -> [2, 3] and back: reduction sums the repeated rows.
        let src = [1.0f32, 2.0, 3.0];
        let mut bc = [0.0f32; 6];
        let shape = Shape::new(vec![1, 3]);
        let target = Shape::new(vec![2, 3]);
        unsafe {
            broadcast_to(
                src.as_ptr() as *const u8,
                bc.as_mut_ptr() as *mut u8,
                6,
                &shape,
                &target,
                DataType::F32,
            );
        }
        assert_eq!(bc, [1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);

        let mut reduced = [0.0f32; 3];
        unsafe {
            reduce_to(
                bc.as_ptr() as *const u8,
                reduced.as_mut_ptr() as *mut u8,
                6,
                &target,
                &shape,
                DataType::F32,
            );
        }
        assert_eq!(reduced, [2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_max_to() {
        let src = [5.0f32, 2.0, 3.0, 4.0, 1.0, 6.0];
        let mut out = [f32::NEG_INFINITY; 3];
        unsafe {
            max_to(
                src.as_ptr() as *const u8,
                out.as_mut_ptr() as *mut u8,
                6,
                &Shape::new(vec![2, 3]),
                &Shape::new(vec![1, 3]),
                DataType::F32,
            );
        }
        assert_eq!(out, [5.0, 2.0, 6.0]);
    }
}
