//! CPU kernels
//!
//! Slice-level numeric routines used by the storage-level ops. GEMM and the
//! batched row kernels parallelize with rayon; everything else is a plain
//! auto-vectorized loop.

use rayon::prelude::*;

// Below this many output elements a parallel GEMM is not worth the fork.
const GEMM_PARALLEL_THRESHOLD: usize = 64 * 64;

pub fn fill<T: Copy>(x: &mut [T], value: T) {
    for elem in x.iter_mut() {
        *elem = value;
    }
}

pub fn strided_fill<T: Copy>(x: &mut [T], value: T, stride: usize) {
    for elem in x.iter_mut().step_by(stride) {
        *elem = value;
    }
}

pub fn copy<T: Copy>(x: &[T], y: &mut [T]) {
    y.copy_from_slice(x);
}

pub fn sum(x: &[f32]) -> f32 {
    x.iter().sum()
}

pub fn mean(x: &[f32]) -> f32 {
    if x.is_empty() {
        0.0
    } else {
        sum(x) / x.len() as f32
    }
}

pub fn max(x: &[f32]) -> f32 {
    x.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v))
}

/// Maximum absolute value.
pub fn amax(x: &[f32]) -> f32 {
    x.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()))
}

/// Index of the maximum element, lowest index on ties.
pub fn max_element(x: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in x.iter().enumerate() {
        if v > x[best] {
            best = i;
        }
    }
    best
}

pub fn add(a: &[f32], b: &[f32], c: &mut [f32]) {
    for i in 0..c.len() {
        c[i] = a[i] + b[i];
    }
}

pub fn add_scalar(a: f32, x: &[f32], y: &mut [f32]) {
    for i in 0..y.len() {
        y[i] = x[i] + a;
    }
}

pub fn sub(a: &[f32], b: &[f32], c: &mut [f32]) {
    for i in 0..c.len() {
        c[i] = a[i] - b[i];
    }
}

pub fn mul(a: &[f32], b: &[f32], c: &mut [f32]) {
    for i in 0..c.len() {
        c[i] = a[i] * b[i];
    }
}

pub fn mul_scalar(a: f32, x: &[f32], y: &mut [f32]) {
    for i in 0..y.len() {
        y[i] = x[i] * a;
    }
}

pub fn inv(x: &[f32], y: &mut [f32]) {
    for i in 0..y.len() {
        y[i] = 1.0 / x[i];
    }
}

pub fn unary(x: &[f32], y: &mut [f32], f: impl Fn(f32) -> f32) {
    for i in 0..y.len() {
        y[i] = f(x[i]);
    }
}

pub fn relu(x: &[f32], y: &mut [f32]) {
    for i in 0..y.len() {
        y[i] = x[i].max(0.0);
    }
}

/// `c[j] = a[j / depth] + b[j]` — one value of `a` per batch row.
pub fn add_batch_broadcast(a: &[f32], b: &[f32], c: &mut [f32]) {
    let depth = b.len() / a.len();
    for i in 0..a.len() {
        let row = &b[i * depth..(i + 1) * depth];
        let out = &mut c[i * depth..(i + 1) * depth];
        add_scalar(a[i], row, out);
    }
}

/// `c[j] = a[j % depth] + b[j]` — `a` repeated across batch rows.
pub fn add_depth_broadcast(a: &[f32], b: &[f32], c: &mut [f32]) {
    let depth = a.len();
    for (row_in, row_out) in b.chunks(depth).zip(c.chunks_mut(depth)) {
        add(a, row_in, row_out);
    }
}

/// `c[j] = a[j / depth] * b[j]`.
pub fn mul_batch_broadcast(a: &[f32], b: &[f32], c: &mut [f32]) {
    let depth = b.len() / a.len();
    for i in 0..a.len() {
        let row = &b[i * depth..(i + 1) * depth];
        let out = &mut c[i * depth..(i + 1) * depth];
        mul_scalar(a[i], row, out);
    }
}

/// Fused `y[j] = w[j % depth] * x[j] + b[j % depth]`.
pub fn mul_and_add_batch_broadcast(x: &[f32], w: &[f32], b: &[f32], y: &mut [f32]) {
    let depth = w.len();
    for (row_in, row_out) in x.chunks(depth).zip(y.chunks_mut(depth)) {
        for j in 0..depth {
            row_out[j] = w[j] * row_in[j] + b[j];
        }
    }
}

pub trait QuantizedElem: Copy + Send + Sync + 'static {
    const MAX: f32;
    fn from_f32(value: f32) -> Self;
    fn to_f32(self) -> f32;
}

impl QuantizedElem for i8 {
    const MAX: f32 = 127.0;
    fn from_f32(value: f32) -> i8 {
        value.round().clamp(i8::MIN as f32, i8::MAX as f32) as i8
    }
    fn to_f32(self) -> f32 {
        self as f32
    }
}

impl QuantizedElem for i16 {
    const MAX: f32 = 32767.0;
    fn from_f32(value: f32) -> i16 {
        value.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
    }
    fn to_f32(self) -> f32 {
        self as f32
    }
}

/// `y = round(x * scale)`.
pub fn quantize<T: QuantizedElem>(x: &[f32], y: &mut [T], scale: f32) {
    for i in 0..y.len() {
        y[i] = T::from_f32(x[i] * scale);
    }
}

/// `y = x / scale`, the inverse of `quantize`.
pub fn unquantize<T: QuantizedElem>(x: &[T], y: &mut [f32], scale: f32) {
    for i in 0..y.len() {
        y[i] = x[i].to_f32() / scale;
    }
}

/// Per-row quantization with `scale = 127 / max(|row|)`. Rows of zeros get a
/// scale of 1.
pub fn quantize_batch(x: &[f32], scales: &mut [f32], qx: &mut [i8], depth: usize) {
    let batch_size = scales.len();
    for i in 0..batch_size {
        let row = &x[i * depth..(i + 1) * depth];
        let row_amax = amax(row);
        let scale = if row_amax == 0.0 { 1.0 } else { i8::MAX as f32 / row_amax };
        scales[i] = scale;
        quantize(row, &mut qx[i * depth..(i + 1) * depth], scale);
    }
}

/// `y[b, d] = x[b, d] / (input_scales[b] * weight_scales[d])`.
pub fn rescale_output(
    x: &[i32],
    input_scales: &[f32],
    weight_scales: &[f32],
    y: &mut [f32],
) {
    let depth = weight_scales.len();
    for (i, &input_scale) in input_scales.iter().enumerate() {
        for (j, &weight_scale) in weight_scales.iter().enumerate() {
            y[i * depth + j] = x[i * depth + j] as f32 / (input_scale * weight_scale);
        }
    }
}

pub fn transpose_2d<T: Copy>(a: &[T], dims: &[usize; 2], b: &mut [T]) {
    for i in 0..dims[0] {
        for j in 0..dims[1] {
            b[j * dims[0] + i] = a[i * dims[1] + j];
        }
    }
}

pub fn transpose_3d<T: Copy>(a: &[T], dims: &[usize; 3], perm: &[usize; 3], b: &mut [T]) {
    let strides = [dims[1] * dims[2], dims[2], 1];
    let out_dims = [dims[perm[0]], dims[perm[1]], dims[perm[2]]];
    let mut index = 0;
    for i0 in 0..out_dims[0] {
        for i1 in 0..out_dims[1] {
            for i2 in 0..out_dims[2] {
                let src = i0 * strides[perm[0]] + i1 * strides[perm[1]] + i2 * strides[perm[2]];
                b[index] = a[src];
                index += 1;
            }
        }
    }
}

pub fn transpose_4d<T: Copy>(a: &[T], dims: &[usize; 4], perm: &[usize; 4], b: &mut [T]) {
    let strides = [dims[1] * dims[2] * dims[3], dims[2] * dims[3], dims[3], 1];
    let out_dims = [dims[perm[0]], dims[perm[1]], dims[perm[2]], dims[perm[3]]];
    let mut index = 0;
    for i0 in 0..out_dims[0] {
        for i1 in 0..out_dims[1] {
            for i2 in 0..out_dims[2] {
                for i3 in 0..out_dims[3] {
                    let src = i0 * strides[perm[0]]
                        + i1 * strides[perm[1]]
                        + i2 * strides[perm[2]]
                        + i3 * strides[perm[3]];
                    b[index] = a[src];
                    index += 1;
                }
            }
        }
    }
}

pub trait GemmIn: Copy + Send + Sync + 'static {
    type Acc: Copy + Send + Sync + 'static;

    fn acc_zero() -> Self::Acc;
    fn mul_acc(a: Self, b: Self, acc: Self::Acc) -> Self::Acc;
    fn finish(acc: Self::Acc, alpha: f32, beta: f32, previous: Self::Acc) -> Self::Acc;
}

impl GemmIn for f32 {
    type Acc = f32;

    fn acc_zero() -> f32 {
        0.0
    }
    fn mul_acc(a: f32, b: f32, acc: f32) -> f32 {
        acc + a * b
    }
    fn finish(acc: f32, alpha: f32, beta: f32, previous: f32) -> f32 {
        alpha * acc + beta * previous
    }
}

macro_rules! impl_integer_gemm_in {
    ($ty:ty) => {
        impl GemmIn for $ty {
            type Acc = i32;

            fn acc_zero() -> i32 {
                0
            }
            fn mul_acc(a: $ty, b: $ty, acc: i32) -> i32 {
                acc + (a as i32) * (b as i32)
            }
            fn finish(acc: i32, alpha: f32, beta: f32, previous: i32) -> i32 {
                // Integer GEMM is used with alpha = 1, beta = 0; stay exact
                // on that path.
                if alpha == 1.0 && beta == 0.0 {
                    acc
                } else {
                    (alpha * acc as f32 + beta * previous as f32) as i32
                }
            }
        }
    };
}

impl_integer_gemm_in!(i8);
impl_integer_gemm_in!(i16);

/// Row-major `c = alpha * op(a) * op(b) + beta * c`.
///
/// `a` is `[m, k]` (or `[k, m]` when `transpose_a`), `b` is `[k, n]` (or
/// `[n, k]` when `transpose_b`), `c` is `[m, n]`.
#[allow(clippy::too_many_arguments)]
pub fn gemm<T: GemmIn>(
    a: &[T],
    b: &[T],
    transpose_a: bool,
    transpose_b: bool,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    beta: f32,
    c: &mut [T::Acc],
) {
    let row = |i: usize, j: usize| {
        let mut acc = T::acc_zero();
        for l in 0..k {
            let a_val = if transpose_a { a[l * m + i] } else { a[i * k + l] };
            let b_val = if transpose_b { b[j * k + l] } else { b[l * n + j] };
            acc = T::mul_acc(a_val, b_val, acc);
        }
        acc
    };

    if m * n >= GEMM_PARALLEL_THRESHOLD {
        c.par_chunks_mut(n).enumerate().for_each(|(i, c_row)| {
            for j in 0..n {
                c_row[j] = T::finish(row(i, j), alpha, beta, c_row[j]);
            }
        });
    } else {
        for i in 0..m {
            for j in 0..n {
                c[i * n + j] = T::finish(row(i, j), alpha, beta, c[i * n + j]);
            }
        }
    }
}

/// GEMM iterated over a leading batch dimension.
#[allow(clippy::too_many_arguments)]
pub fn gemm_batch<T: GemmIn>(
    a: &[T],
    b: &[T],
    transpose_a: bool,
    transpose_b: bool,
    batch_size: usize,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    beta: f32,
    c: &mut [T::Acc],
) {
    for i in 0..batch_size {
        let a_i = &a[i * m * k..(i + 1) * m * k];
        let b_i = &b[i * k * n..(i + 1) * k * n];
        let c_i = &mut c[i * m * n..(i + 1) * m * n];
        gemm(a_i, b_i, transpose_a, transpose_b, m, n, k, alpha, beta, c_i);
    }
}
