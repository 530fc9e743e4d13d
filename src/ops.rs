//! Dense numeric kernels shared by the attention, embedding and optimizer modules.
//!
//! Everything here is a plain function over `ndarray` arrays; modules own the
//! parameters and call into these kernels during `forward`.

use crate::error::{Error, Result};
use ndarray::{s, Array1, Array2, Array4, ArrayD, ArrayView1, ArrayView4, ArrayViewMut2, Axis, Dimension, Ix2, IxDyn, Zip};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use rand_distr::StandardNormal;

/// Value written into masked attention scores before normalisation.
pub const MASK_SENTINEL: f32 = -1e9;

/// Numerically stable softmax over the last axis, in place.
pub fn softmax_last_axis<D: Dimension>(x: &mut ndarray::Array<f32, D>) {
    if x.ndim() == 0 {
        return;
    }
    let last_axis = Axis(x.ndim() - 1);
    for mut lane in x.lanes_mut(last_axis) {
        let max = lane.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for v in lane.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        if sum > 0.0 {
            for v in lane.iter_mut() {
                *v /= sum;
            }
        }
    }
}

/// `a · bᵀ` over the last two axes for every (batch, head) pair.
///
/// `a` is `[B, H, M, D]`, `b` is `[B, H, N, D]`; the result is `[B, H, M, N]`.
pub fn matmul_transposed(a: &ArrayView4<f32>, b: &ArrayView4<f32>) -> Array4<f32> {
    let (bs, hs, m, _) = a.dim();
    let n = b.dim().2;
    let mut out = Array4::<f32>::zeros((bs, hs, m, n));
    for bi in 0..bs {
        for hi in 0..hs {
            let lhs = a.slice(s![bi, hi, .., ..]);
            let rhs = b.slice(s![bi, hi, .., ..]);
            out.slice_mut(s![bi, hi, .., ..]).assign(&lhs.dot(&rhs.t()));
        }
    }
    out
}

/// `a · b` over the last two axes for every (batch, head) pair.
///
/// `a` is `[B, H, M, K]`, `b` is `[B, H, K, N]`; the result is `[B, H, M, N]`.
pub fn batched_matmul(a: &ArrayView4<f32>, b: &ArrayView4<f32>) -> Array4<f32> {
    let (bs, hs, m, _) = a.dim();
    let n = b.dim().3;
    let mut out = Array4::<f32>::zeros((bs, hs, m, n));
    for bi in 0..bs {
        for hi in 0..hs {
            let lhs = a.slice(s![bi, hi, .., ..]);
            let rhs = b.slice(s![bi, hi, .., ..]);
            out.slice_mut(s![bi, hi, .., ..]).assign(&lhs.dot(&rhs));
        }
    }
    out
}

/// Overwrites every score whose mask entry is `true` with `value`.
///
/// The mask must already be broadcast to the score shape.
pub fn masked_fill(scores: &mut Array4<f32>, mask: &ArrayView4<bool>, value: f32) {
    Zip::from(scores).and(mask).for_each(|s, &m| {
        if m {
            *s = value;
        }
    });
}

/// Builds the fixed triangular-decay smoothing kernel.
///
/// The kernel has `2 * ((width - 1) / 2) + 1` taps: the centre weight is 1 and
/// the weight `d` taps away from the centre is `(1 - decay)^d`.
pub fn window_kernel(width: usize, decay: f32) -> Array1<f32> {
    let half = width.saturating_sub(1) / 2;
    let keep = 1.0 - decay;
    Array1::from_shape_fn(2 * half + 1, |i| {
        let dist = (i as isize - half as isize).unsigned_abs();
        keep.powi(dist as i32)
    })
}

/// Zero-padded "same" cross-correlation of `input` with an odd-length `kernel`.
pub fn convolve_same(input: &ArrayView1<f32>, kernel: &ArrayView1<f32>) -> Array1<f32> {
    let n = input.len();
    let half = kernel.len() / 2;
    Array1::from_shape_fn(n, |i| {
        let mut acc = 0.0f32;
        for (j, &w) in kernel.iter().enumerate() {
            let src = i as isize + j as isize - half as isize;
            if src >= 0 && (src as usize) < n {
                acc += w * input[src as usize];
            }
        }
        acc
    })
}

/// Smooths a `[query, key]` score matrix in place along `axis`
/// (`Axis(1)` convolves each query row across keys, `Axis(0)` each key column
/// across queries).
pub fn smooth_matrix(mut matrix: ArrayViewMut2<f32>, kernel: &ArrayView1<f32>, axis: Axis) {
    let source = matrix.to_owned();
    for (src, mut dst) in source.lanes(axis).into_iter().zip(matrix.lanes_mut(axis)) {
        dst.assign(&convolve_same(&src, kernel));
    }
}

/// Applies [`smooth_matrix`] independently to every (batch, head) score matrix.
#[cfg(not(feature = "parallel"))]
pub fn smooth_scores(scores: &mut Array4<f32>, kernel: &ArrayView1<f32>, axis: Axis) {
    for mut per_batch in scores.outer_iter_mut() {
        for per_head in per_batch.outer_iter_mut() {
            smooth_matrix(per_head, kernel, axis);
        }
    }
}

/// Applies [`smooth_matrix`] independently to every (batch, head) score matrix,
/// spreading batch elements over the rayon pool.
#[cfg(feature = "parallel")]
pub fn smooth_scores(scores: &mut Array4<f32>, kernel: &ArrayView1<f32>, axis: Axis) {
    use rayon::prelude::*;
    scores
        .outer_iter_mut()
        .into_par_iter()
        .for_each(|mut per_batch| {
            for per_head in per_batch.outer_iter_mut() {
                smooth_matrix(per_head, kernel, axis);
            }
        });
}

/// `x · w + b` over the last axis of `x`, collapsing leading axes.
///
/// `w` is `[in_features, out_features]`, `b` is `[out_features]`.
pub fn linear(x: &ArrayD<f32>, w: &ArrayD<f32>, b: Option<&ArrayD<f32>>) -> Result<ArrayD<f32>> {
    let w2 = w
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| Error::shape("linear weight", "rank 2", w.shape()))?;
    let (in_features, out_features) = w2.dim();
    let in_shape = x.shape().to_vec();
    if in_shape.last().copied() != Some(in_features) {
        return Err(Error::shape(
            "linear input",
            format!("last axis of size {}", in_features),
            &in_shape,
        ));
    }
    let rows: usize = in_shape[..in_shape.len() - 1].iter().product();
    let x2 = x
        .as_standard_layout()
        .into_owned()
        .into_shape((rows, in_features))
        .map_err(|_| Error::shape("linear input", "contiguous layout", &in_shape))?;
    let mut out: Array2<f32> = x2.dot(&w2);
    if let Some(bias) = b {
        let bias1 = bias
            .view()
            .into_dimensionality::<ndarray::Ix1>()
            .map_err(|_| Error::shape("linear bias", format!("[{}]", out_features), bias.shape()))?;
        if bias1.len() != out_features {
            return Err(Error::shape("linear bias", format!("[{}]", out_features), bias.shape()));
        }
        out += &bias1;
    }
    let mut out_shape = in_shape;
    if let Some(last) = out_shape.last_mut() {
        *last = out_features;
    }
    out.into_shape(IxDyn(&out_shape))
        .map_err(|_| Error::shape("linear output", "reshapeable result", &[rows, out_features]))
}

/// Inverted-dropout mask: each element is `1 / (1 - p)` with probability `1 - p`,
/// otherwise 0.
pub fn dropout_mask<R: Rng + ?Sized>(shape: &[usize], p: f32, rng: &mut R) -> ArrayD<f32> {
    let keep = 1.0 - p;
    ArrayD::from_shape_simple_fn(IxDyn(shape), || {
        let r: f32 = rng.gen();
        if r < keep {
            1.0 / keep
        } else {
            0.0
        }
    })
}

/// Samples every element from `U(-bound, bound)`.
pub fn uniform<R: Rng + ?Sized>(shape: &[usize], bound: f32, rng: &mut R) -> ArrayD<f32> {
    let dist = Uniform::new_inclusive(-bound, bound);
    ArrayD::from_shape_simple_fn(IxDyn(shape), || dist.sample(rng))
}

/// Xavier/Glorot uniform initialisation for a `[rows, cols]` table
/// (`fan_in = cols`, `fan_out = rows`).
pub fn xavier_uniform<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> ArrayD<f32> {
    let bound = (6.0f32 / (rows + cols).max(1) as f32).sqrt();
    uniform(&[rows, cols], bound, rng)
}

/// Samples every element from `N(0, 1)`.
pub fn standard_normal<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> ArrayD<f32> {
    ArrayD::from_shape_simple_fn(IxDyn(shape), || rng.sample::<f32, _>(StandardNormal))
}
