//! Scaled dot-product attention with optional masking, local-window smoothing
//! and a learned per-key linear bias.
//!
//! Score pipeline, in this order:
//!
//! ```text
//! scores = Q·Kᵀ / sqrt(d)  →  mask  →  window smoothing  →  + bias  →  softmax  →  · V
//! ```
//!
//! Masked entries are written as [`MASK_SENTINEL`](crate::ops::MASK_SENTINEL)
//! *before* smoothing, so the sentinel is spread into neighbouring scores.

use crate::error::{Error, Result};
use crate::ops::{self, MASK_SENTINEL};
use crate::tensor::Parameter;
use ndarray::{s, Array1, Array4, ArrayD, ArrayView4, Axis, Ix1, Ix4};
use serde::{Deserialize, Serialize};

/// Axis of the `[query, key]` score matrix along which the window kernel slides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowAxis {
    /// Each query row is smoothed across neighbouring keys.
    Key,
    /// Each key column is smoothed across neighbouring queries.
    #[default]
    Query,
}

impl WindowAxis {
    fn matrix_axis(self) -> Axis {
        match self {
            WindowAxis::Key => Axis(1),
            WindowAxis::Query => Axis(0),
        }
    }
}

/// Fixed (non-learned) local-window smoothing of attention scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalWindow {
    /// Window width; even widths behave like `width - 1`.
    pub width: usize,
    pub axis: WindowAxis,
    /// Fraction by which the kernel weight decays per step away from the centre.
    pub decay: f32,
}

impl Default for LocalWindow {
    fn default() -> Self {
        LocalWindow {
            width: 3,
            axis: WindowAxis::Query,
            decay: 0.3,
        }
    }
}

impl LocalWindow {
    pub fn new(width: usize, axis: WindowAxis) -> Self {
        LocalWindow {
            width,
            axis,
            ..Default::default()
        }
    }

    pub fn with_decay(mut self, decay: f32) -> Self {
        self.decay = decay;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 {
            return Err(Error::invalid_config("local attention window width must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.decay) {
            return Err(Error::invalid_config(format!(
                "local attention decay must be in [0, 1), got {}",
                self.decay
            )));
        }
        if self.width % 2 == 0 {
            log::warn!(
                "local attention window width {} is even; the kernel spans {} positions",
                self.width,
                self.width - 1
            );
        }
        Ok(())
    }
}

/// Behaviour switches for [`DotProductAttention`], fixed at construction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    /// Local-window smoothing; `None` disables it.
    pub local_window: Option<LocalWindow>,
    /// Capacity (maximum key length) of the learned linear bias; `None` disables it.
    pub linear_bias: Option<usize>,
}

impl AttentionConfig {
    pub fn with_local_window(mut self, window: LocalWindow) -> Self {
        self.local_window = Some(window);
        self
    }

    pub fn with_linear_bias(mut self, max_key_len: usize) -> Self {
        self.linear_bias = Some(max_key_len);
        self
    }
}

struct Smoothing {
    kernel: Array1<f32>,
    axis: Axis,
}

/// Scaled dot-product attention over `[batch, heads, seq, dim_head]` tensors.
pub struct DotProductAttention {
    config: AttentionConfig,
    smoothing: Option<Smoothing>,
    linear_bias: Option<Parameter>,
}

impl DotProductAttention {
    pub fn new(config: AttentionConfig) -> Result<Self> {
        let smoothing = match &config.local_window {
            Some(window) => {
                window.validate()?;
                Some(Smoothing {
                    kernel: ops::window_kernel(window.width, window.decay),
                    axis: window.axis.matrix_axis(),
                })
            }
            None => None,
        };
        let linear_bias = match config.linear_bias {
            Some(0) => {
                return Err(Error::invalid_config("linear bias capacity must be at least 1"));
            }
            Some(capacity) => Some(Parameter::zeros("beta", &[capacity])),
            None => None,
        };
        Ok(DotProductAttention {
            config,
            smoothing,
            linear_bias,
        })
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    /// The learned per-key bias, when enabled.
    pub fn linear_bias(&self) -> Option<&Parameter> {
        self.linear_bias.as_ref()
    }

    pub fn parameters(&self) -> Vec<Parameter> {
        self.linear_bias.iter().cloned().collect()
    }

    /// Attention over dynamically ranked inputs; each must be rank 4.
    pub fn forward(
        &self,
        queries: &ArrayD<f32>,
        keys: &ArrayD<f32>,
        values: &ArrayD<f32>,
        mask: Option<&ArrayD<bool>>,
    ) -> Result<ArrayD<f32>> {
        let q = as_rank4(queries, "attention queries")?;
        let k = as_rank4(keys, "attention keys")?;
        let v = as_rank4(values, "attention values")?;
        Ok(self.attend(&q, &k, &v, mask)?.into_dyn())
    }

    /// Attention over `[batch, heads, seq, dim_head]` views.
    pub fn attend(
        &self,
        queries: &ArrayView4<f32>,
        keys: &ArrayView4<f32>,
        values: &ArrayView4<f32>,
        mask: Option<&ArrayD<bool>>,
    ) -> Result<Array4<f32>> {
        check_shapes(queries, keys, values)?;
        let weights = self.weights(queries, keys, mask)?;
        Ok(ops::batched_matmul(&weights.view(), values))
    }

    /// The normalised attention probabilities `[batch, heads, query_len, key_len]`.
    pub fn attention_weights(
        &self,
        queries: &ArrayD<f32>,
        keys: &ArrayD<f32>,
        mask: Option<&ArrayD<bool>>,
    ) -> Result<Array4<f32>> {
        let q = as_rank4(queries, "attention queries")?;
        let k = as_rank4(keys, "attention keys")?;
        check_shapes(&q, &k, &k)?;
        self.weights(&q, &k, mask)
    }

    fn weights(
        &self,
        queries: &ArrayView4<f32>,
        keys: &ArrayView4<f32>,
        mask: Option<&ArrayD<bool>>,
    ) -> Result<Array4<f32>> {
        let dim_head = keys.dim().3;
        let scale = 1.0 / (dim_head as f32).sqrt();
        let mut scores = ops::matmul_transposed(queries, keys);
        scores.mapv_inplace(|s| s * scale);

        if let Some(mask) = mask {
            let broadcast = mask.broadcast(scores.raw_dim()).ok_or_else(|| {
                Error::shape(
                    "attention mask",
                    format!("broadcastable to {:?}", scores.shape()),
                    mask.shape(),
                )
            })?;
            ops::masked_fill(&mut scores, &broadcast, MASK_SENTINEL);
        }

        if let Some(smoothing) = &self.smoothing {
            ops::smooth_scores(&mut scores, &smoothing.kernel.view(), smoothing.axis);
        }

        if let Some(beta) = &self.linear_bias {
            let key_len = scores.dim().3;
            let guard = beta.lock();
            let capacity = guard.data.len();
            if key_len > capacity {
                return Err(Error::too_long(key_len, capacity));
            }
            let bias = guard
                .data
                .view()
                .into_dimensionality::<Ix1>()
                .map_err(|_| Error::shape("linear bias", "rank 1", guard.data.shape()))?;
            scores += &bias.slice(s![..key_len]);
        }

        ops::softmax_last_axis(&mut scores);
        Ok(scores)
    }
}

fn as_rank4<'a>(x: &'a ArrayD<f32>, context: &'static str) -> Result<ArrayView4<'a, f32>> {
    x.view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| Error::shape(context, "rank 4 [batch, heads, seq, dim_head]", x.shape()))
}

fn check_shapes(q: &ArrayView4<f32>, k: &ArrayView4<f32>, v: &ArrayView4<f32>) -> Result<()> {
    let (qb, qh, _, qd) = q.dim();
    let (kb, kh, kl, kd) = k.dim();
    let (vb, vh, vl, _) = v.dim();
    if kb != qb || kh != qh || kd != qd {
        return Err(Error::shape(
            "attention keys",
            format!("[{}, {}, _, {}]", qb, qh, qd),
            k.shape(),
        ));
    }
    if vb != qb || vh != qh || vl != kl {
        return Err(Error::shape(
            "attention values",
            format!("[{}, {}, {}, _]", qb, qh, kl),
            v.shape(),
        ));
    }
    Ok(())
}
