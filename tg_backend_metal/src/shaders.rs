//! Embedded Metal shading language source.
//!
//! Kernels are instantiated per dtype through preprocessor macros and named
//! `<op>_<dtype>` (dtype pairs for conversion copies), matching the names
//! resolved by the pipeline table. F64 has no kernels; the table binds the
//! null kernel for every F64 slot and the host falls through to the CPU.

pub const SHADER_SOURCE: &str = r#"
#include <metal_stdlib>
using namespace metal;

struct MatSize {
    uint rows;
    uint cols;
};

// Bound for pipeline slots that must never be dispatched.
kernel void null_kernel(uint id [[thread_position_in_grid]]) {}

// Maps a linear index in the broadcast (new) shape back to the source
// linear index, walking the shapes right-aligned; size-1 source dims
// contribute index 0.
static ulong translation_index(ulong index,
                               device const ulong* shape, ulong ndim,
                               device const ulong* new_shape, ulong new_ndim)
{
    ulong original_index = 0;
    ulong target_stride = 1;
    ulong original_stride = 1;
    long j = (long)ndim - 1;
    for (long i = (long)new_ndim - 1; i >= 0; --i)
    {
        ulong dim_index = (index / target_stride) % new_shape[i];
        if (j >= 0 && shape[j] == new_shape[i])
        {
            original_index += dim_index * original_stride;
            original_stride *= shape[j];
            --j;
        }
        else if (j >= 0 && shape[j] == 1)
        {
            --j;
        }
        target_stride *= new_shape[i];
    }
    return original_index;
}

// Elementwise binary ops.

#define BINARY_KERNEL(name, S, T, expr)                                     \
kernel void name##_##S(device const T* a   [[buffer(0)]],                   \
                       device const T* b   [[buffer(1)]],                   \
                       device T*       out [[buffer(2)]],                   \
                       uint id [[thread_position_in_grid]])                 \
{                                                                           \
    T x = a[id];                                                            \
    T y = b[id];                                                            \
    out[id] = (expr);                                                       \
}

#define BINARY_OPS(S, T)                                                    \
BINARY_KERNEL(add, S, T, x + y)                                             \
BINARY_KERNEL(sub, S, T, x - y)                                             \
BINARY_KERNEL(mul, S, T, x * y)                                             \
BINARY_KERNEL(div, S, T, x / y)                                             \
BINARY_KERNEL(pow, S, T, T(pow(float(x), float(y))))

BINARY_OPS(f32, float)
BINARY_OPS(f16, half)
BINARY_OPS(bf16, bfloat)
BINARY_OPS(i64, long)
BINARY_OPS(i32, int)
BINARY_OPS(i16, short)
BINARY_OPS(i8, char)
BINARY_OPS(u8, uchar)

// Scalar broadcast ops; the scalar arrives as kernel bytes already in T.

#define SCALAR_KERNEL(name, S, T, expr)                                     \
kernel void name##_##S(device const T* a   [[buffer(0)]],                   \
                       constant T&     s   [[buffer(1)]],                   \
                       device T*       out [[buffer(2)]],                   \
                       uint id [[thread_position_in_grid]])                 \
{                                                                           \
    T x = a[id];                                                            \
    out[id] = (expr);                                                       \
}

#define SCALAR_OPS(S, T)                                                    \
SCALAR_KERNEL(add_s, S, T, x + s)                                           \
SCALAR_KERNEL(sub_s, S, T, x - s)                                           \
SCALAR_KERNEL(rsub_s, S, T, s - x)                                          \
SCALAR_KERNEL(mul_s, S, T, x * s)                                           \
SCALAR_KERNEL(div_s, S, T, x / s)                                           \
SCALAR_KERNEL(rdiv_s, S, T, s / x)

SCALAR_OPS(f32, float)
SCALAR_OPS(f16, half)
SCALAR_OPS(bf16, bfloat)
SCALAR_OPS(i64, long)
SCALAR_OPS(i32, int)
SCALAR_OPS(i16, short)
SCALAR_OPS(i8, char)
SCALAR_OPS(u8, uchar)

// Unary ops. Transcendentals compute in float.

#define UNARY_KERNEL(name, S, T, expr)                                      \
kernel void name##_##S(device const T* a   [[buffer(0)]],                   \
                       device T*       out [[buffer(1)]],                   \
                       uint id [[thread_position_in_grid]])                 \
{                                                                           \
    T x = a[id];                                                            \
    out[id] = (expr);                                                       \
}

#define UNARY_OPS(S, T)                                                     \
UNARY_KERNEL(unary, S, T, T(-float(x)))                                     \
UNARY_KERNEL(sqrt, S, T, T(sqrt(float(x))))                               \
UNARY_KERNEL(sin, S, T, T(sin(float(x))))                                 \
UNARY_KERNEL(cos, S, T, T(cos(float(x))))                                 \
UNARY_KERNEL(tanh, S, T, T(tanh(float(x))))                               \
UNARY_KERNEL(log, S, T, T(log(float(x))))                                 \
UNARY_KERNEL(exp, S, T, T(exp(float(x))))

UNARY_OPS(f32, float)
UNARY_OPS(f16, half)
UNARY_OPS(bf16, bfloat)
UNARY_OPS(i64, long)
UNARY_OPS(i32, int)
UNARY_OPS(i16, short)
UNARY_OPS(i8, char)
UNARY_OPS(u8, uchar)

// Fill.

#define FILL_KERNEL(S, T)                                                   \
kernel void fill_##S(constant T& s   [[buffer(0)]],                         \
                     device T*   out [[buffer(1)]],                         \
                     uint id [[thread_position_in_grid]])                   \
{                                                                           \
    out[id] = s;                                                            \
}

FILL_KERNEL(f32, float)
FILL_KERNEL(f16, half)
FILL_KERNEL(bf16, bfloat)
FILL_KERNEL(i64, long)
FILL_KERNEL(i32, int)
FILL_KERNEL(i16, short)
FILL_KERNEL(i8, char)
FILL_KERNEL(u8, uchar)

// Conversion copies, one kernel per (source, destination) dtype pair.

#define COPY_KERNEL(SS, ST, DS, DT)                                         \
kernel void copy_##SS##_##DS(device const ST* src [[buffer(0)]],            \
                             device DT*       dst [[buffer(1)]],            \
                             uint id [[thread_position_in_grid]])           \
{                                                                           \
    dst[id] = DT(src[id]);                                                  \
}

#define COPY_ROW(SS, ST)                                                    \
COPY_KERNEL(SS, ST, f32, float)                                             \
COPY_KERNEL(SS, ST, f16, half)                                              \
COPY_KERNEL(SS, ST, bf16, bfloat)                                           \
COPY_KERNEL(SS, ST, i64, long)                                              \
COPY_KERNEL(SS, ST, i32, int)                                               \
COPY_KERNEL(SS, ST, i16, short)                                             \
COPY_KERNEL(SS, ST, i8, char)                                               \
COPY_KERNEL(SS, ST, u8, uchar)

COPY_ROW(f32, float)
COPY_ROW(f16, half)
COPY_ROW(bf16, bfloat)
COPY_ROW(i64, long)
COPY_ROW(i32, int)
COPY_ROW(i16, short)
COPY_ROW(i8, char)
COPY_ROW(u8, uchar)

// Parallel reduction step: each 1024-thread group folds its window into one
// partial, written at the group index. The host re-dispatches until a single
// element remains.

#define REDUCE_KERNEL(name, S, T, fold, pad)                                \
kernel void name##_##S(device const T* in  [[buffer(0)]],                   \
                       device T*       out [[buffer(1)]],                   \
                       constant uint&  n   [[buffer(2)]],                   \
                       uint gid  [[thread_position_in_grid]],               \
                       uint lid  [[thread_index_in_threadgroup]],           \
                       uint tgid [[threadgroup_position_in_grid]])          \
{                                                                           \
    threadgroup T shm[1024];                                                \
    shm[lid] = gid < n ? in[gid] : (pad);                                   \
    threadgroup_barrier(mem_flags::mem_threadgroup);                        \
    for (uint stride = 512; stride > 0; stride >>= 1)                       \
    {                                                                       \
        if (lid < stride)                                                   \
        {                                                                   \
            T lhs = shm[lid];                                               \
            T rhs = shm[lid + stride];                                      \
            shm[lid] = (fold);                                              \
        }                                                                   \
        threadgroup_barrier(mem_flags::mem_threadgroup);                    \
    }                                                                       \
    if (lid == 0)                                                           \
    {                                                                       \
        out[tgid] = shm[0];                                                 \
    }                                                                       \
}

#define REDUCE_OPS(S, T)                                                    \
REDUCE_KERNEL(sum, S, T, lhs + rhs, T(0))                                   \
REDUCE_KERNEL(max, S, T, lhs > rhs ? lhs : rhs, in[0])

REDUCE_OPS(f32, float)
REDUCE_OPS(f16, half)
REDUCE_OPS(bf16, bfloat)
REDUCE_OPS(i64, long)
REDUCE_OPS(i32, int)
REDUCE_OPS(i16, short)
REDUCE_OPS(i8, char)
REDUCE_OPS(u8, uchar)

// Matrix multiply, tiled by divisibility. Each variant covers a 32-wide
// column strip; threads own 32 consecutive output rows.

#define MATMUL_TILED(S, T, TSY)                                             \
kernel void matmul_32_##TSY##_##S(device const T* A [[buffer(0)]],          \
                                  device const T* B [[buffer(1)]],          \
                                  device T*       C [[buffer(2)]],          \
                                  constant MatSize& asz [[buffer(3)]],      \
                                  constant MatSize& bsz [[buffer(4)]],      \
                                  uint2 tg  [[threadgroup_position_in_grid]], \
                                  uint2 lid [[thread_position_in_threadgroup]]) \
{                                                                           \
    uint K = asz.cols;                                                      \
    uint N = bsz.cols;                                                      \
    uint col = tg.x * 32 + lid.x;                                           \
    uint row0 = tg.y * TSY + lid.y * 32;                                    \
    for (uint r = row0; r < row0 + 32; ++r)                                 \
    {                                                                       \
        T acc = T(0);                                                       \
        for (uint k = 0; k < K; ++k)                                        \
        {                                                                   \
            acc += A[r * K + k] * B[k * N + col];                           \
        }                                                                   \
        C[r * N + col] = acc;                                               \
    }                                                                       \
}

// Fallback: bounds-checked 64x64 tiles, 64 threads per group.

#define MATMUL_FALLBACK(S, T)                                               \
kernel void matmul_t_##S(device const T* A [[buffer(0)]],                   \
                         device const T* B [[buffer(1)]],                   \
                         device T*       C [[buffer(2)]],                   \
                         constant MatSize& asz [[buffer(3)]],               \
                         constant MatSize& bsz [[buffer(4)]],               \
                         uint2 tg [[threadgroup_position_in_grid]],         \
                         uint  lid [[thread_index_in_threadgroup]])         \
{                                                                           \
    uint M = asz.rows;                                                      \
    uint K = asz.cols;                                                      \
    uint N = bsz.cols;                                                      \
    uint col = tg.x * 64 + lid;                                             \
    if (col >= N) return;                                                   \
    uint row_end = min(M, (tg.y + 1) * 64);                                 \
    for (uint r = tg.y * 64; r < row_end; ++r)                              \
    {                                                                       \
        T acc = T(0);                                                       \
        for (uint k = 0; k < K; ++k)                                        \
        {                                                                   \
            acc += A[r * K + k] * B[k * N + col];                           \
        }                                                                   \
        C[r * N + col] = acc;                                               \
    }                                                                       \
}

#define MATMUL_OPS(S, T)                                                    \
MATMUL_TILED(S, T, 32)                                                      \
MATMUL_TILED(S, T, 64)                                                      \
MATMUL_TILED(S, T, 128)                                                     \
MATMUL_FALLBACK(S, T)

MATMUL_OPS(f32, float)
MATMUL_OPS(f16, half)
MATMUL_OPS(bf16, bfloat)
MATMUL_OPS(i64, long)
MATMUL_OPS(i32, int)
MATMUL_OPS(i16, short)
MATMUL_OPS(i8, char)
MATMUL_OPS(u8, uchar)

// 2-D transpose: a staged 32x32 tile when both dims divide evenly, and a
// bounds-checked simple kernel otherwise.

#define TRANSPOSE2D(S, T)                                                   \
kernel void transpose2d_##S(device const T* in  [[buffer(0)]],              \
                            device T*       out [[buffer(1)]],              \
                            constant MatSize& sz [[buffer(2)]],             \
                            uint2 gid [[thread_position_in_grid]])          \
{                                                                           \
    if (gid.x >= sz.cols || gid.y >= sz.rows) return;                       \
    out[gid.x * sz.rows + gid.y] = in[gid.y * sz.cols + gid.x];             \
}                                                                           \
kernel void transpose2d_t_##S(device const T* in  [[buffer(0)]],            \
                              device T*       out [[buffer(1)]],            \
                              constant MatSize& sz [[buffer(2)]],           \
                              uint2 tg  [[threadgroup_position_in_grid]],   \
                              uint2 lid [[thread_position_in_threadgroup]]) \
{                                                                           \
    threadgroup T tile[32][33];                                             \
    uint x = tg.x * 32 + lid.x;                                             \
    uint y = tg.y * 32 + lid.y;                                             \
    tile[lid.y][lid.x] = in[y * sz.cols + x];                               \
    threadgroup_barrier(mem_flags::mem_threadgroup);                        \
    uint ox = tg.y * 32 + lid.x;                                            \
    uint oy = tg.x * 32 + lid.y;                                            \
    out[oy * sz.rows + ox] = tile[lid.x][lid.y];                            \
}

TRANSPOSE2D(f32, float)
TRANSPOSE2D(f16, half)
TRANSPOSE2D(bf16, bfloat)
TRANSPOSE2D(i64, long)
TRANSPOSE2D(i32, int)
TRANSPOSE2D(i16, short)
TRANSPOSE2D(i8, char)
TRANSPOSE2D(u8, uchar)

// General N-D transpose through a per-element stride remap.

#define TRANSPOSE_ND(S, T)                                                  \
kernel void transpose_##S(device const T*     in      [[buffer(0)]],        \
                          device T*           out     [[buffer(1)]],        \
                          constant ulong&     dim0    [[buffer(2)]],        \
                          constant ulong&     dim1    [[buffer(3)]],        \
                          device const ulong* strides [[buffer(4)]],        \
                          constant ulong&     ndim    [[buffer(5)]],        \
                          device const ulong* new_strides [[buffer(6)]],    \
                          uint gid [[thread_position_in_grid]])             \
{                                                                           \
    ulong idx[16];                                                          \
    ulong rem = gid;                                                        \
    for (ulong i = 0; i < ndim; ++i)                                        \
    {                                                                       \
        idx[i] = rem / strides[i];                                          \
        rem %= strides[i];                                                  \
    }                                                                       \
    ulong tmp = idx[dim0];                                                  \
    idx[dim0] = idx[dim1];                                                  \
    idx[dim1] = tmp;                                                        \
    ulong out_index = 0;                                                    \
    for (ulong i = 0; i < ndim; ++i)                                        \
    {                                                                       \
        out_index += idx[i] * new_strides[i];                               \
    }                                                                       \
    out[out_index] = in[gid];                                               \
}

TRANSPOSE_ND(f32, float)
TRANSPOSE_ND(f16, half)
TRANSPOSE_ND(bf16, bfloat)
TRANSPOSE_ND(i64, long)
TRANSPOSE_ND(i32, int)
TRANSPOSE_ND(i16, short)
TRANSPOSE_ND(i8, char)
TRANSPOSE_ND(u8, uchar)

// Broadcast gather.

#define BROADCAST(S, T)                                                     \
kernel void broadcast_##S(device const T*     src       [[buffer(0)]],      \
                          device T*           dst       [[buffer(1)]],      \
                          device const ulong* src_shape [[buffer(2)]],      \
                          constant ulong&     src_ndim  [[buffer(3)]],      \
                          device const ulong* dst_shape [[buffer(4)]],      \
                          constant ulong&     dst_ndim  [[buffer(5)]],      \
                          uint gid [[thread_position_in_grid]])             \
{                                                                           \
    dst[gid] = src[translation_index(gid, src_shape, src_ndim,              \
                                     dst_shape, dst_ndim)];                 \
}

BROADCAST(f32, float)
BROADCAST(f16, half)
BROADCAST(bf16, bfloat)
BROADCAST(i64, long)
BROADCAST(i32, int)
BROADCAST(i16, short)
BROADCAST(i8, char)
BROADCAST(u8, uchar)

// Summing scatter, the inverse of the broadcast gather. Accumulation is
// atomic, so only dtypes with device atomics run here; the accumulation
// order across threads is unspecified, which can shift floating-point
// results by an ulp or two between runs.

kernel void reduce_to_f32(device const float* src       [[buffer(0)]],
                          device atomic_float* dst      [[buffer(1)]],
                          device const ulong* dst_shape [[buffer(2)]],
                          constant ulong&     dst_ndim  [[buffer(3)]],
                          device const ulong* src_shape [[buffer(4)]],
                          constant ulong&     src_ndim  [[buffer(5)]],
                          uint gid [[thread_position_in_grid]])
{
    ulong target = translation_index(gid, dst_shape, dst_ndim, src_shape, src_ndim);
    atomic_fetch_add_explicit(&dst[target], src[gid], memory_order_relaxed);
}

kernel void reduce_to_i32(device const int*   src       [[buffer(0)]],
                          device atomic_int*  dst       [[buffer(1)]],
                          device const ulong* dst_shape [[buffer(2)]],
                          constant ulong&     dst_ndim  [[buffer(3)]],
                          device const ulong* src_shape [[buffer(4)]],
                          constant ulong&     src_ndim  [[buffer(5)]],
                          uint gid [[thread_position_in_grid]])
{
    ulong target = translation_index(gid, dst_shape, dst_ndim, src_shape, src_ndim);
    atomic_fetch_add_explicit(&dst[target], src[gid], memory_order_relaxed);
}

// Maximizing scatter. Floats go through a compare-exchange loop on the bit
// pattern; ints use the native atomic max.

kernel void max_to_f32(device const float* src       [[buffer(0)]],
                       device atomic_uint* dst       [[buffer(1)]],
                       device const ulong* dst_shape [[buffer(2)]],
                       constant ulong&     dst_ndim  [[buffer(3)]],
                       device const ulong* src_shape [[buffer(4)]],
                       constant ulong&     src_ndim  [[buffer(5)]],
                       uint gid [[thread_position_in_grid]])
{
    ulong target = translation_index(gid, dst_shape, dst_ndim, src_shape, src_ndim);
    float value = src[gid];
    uint current = atomic_load_explicit(&dst[target], memory_order_relaxed);
    while (value > as_type<float>(current))
    {
        if (atomic_compare_exchange_weak_explicit(&dst[target], &current,
                                                  as_type<uint>(value),
                                                  memory_order_relaxed,
                                                  memory_order_relaxed))
        {
            break;
        }
    }
}

kernel void max_to_i32(device const int*   src       [[buffer(0)]],
                       device atomic_int*  dst       [[buffer(1)]],
                       device const ulong* dst_shape [[buffer(2)]],
                       constant ulong&     dst_ndim  [[buffer(3)]],
                       device const ulong* src_shape [[buffer(4)]],
                       constant ulong&     src_ndim  [[buffer(5)]],
                       uint gid [[thread_position_in_grid]])
{
    ulong target = translation_index(gid, dst_shape, dst_ndim, src_shape, src_ndim);
    atomic_fetch_maxxplicit(&dst[target], src[gid], memory_order_relaxed);
}
"#;
