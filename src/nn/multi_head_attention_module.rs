//! Multi-head wrappers around [`DotProductAttention`].
//!
//! Two variants share one external contract (`[batch, seq, dim]` in, same shape
//! out) and differ only in how queries, keys and values are projected:
//! [`MultiHeadAttention`] uses three independent projections,
//! [`MultiHeadSelfAttention`] one fused projection.

use crate::error::{Error, Result};
use crate::nn::attention::{AttentionConfig, DotProductAttention};
use crate::nn::{Dropout, Linear, Module};
use crate::tensor::Parameter;
use ndarray::{Array3, Array4, ArrayD, Axis, Ix3, Ix4, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Configuration shared by both multi-head variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiHeadConfig {
    /// Model (token embedding) dimension.
    pub dim: usize,
    /// Per-head dimension; need not equal `dim / heads`.
    pub dim_head: usize,
    pub heads: usize,
    /// Dropout rate applied to the projected output.
    pub dropout: f32,
    pub attention: AttentionConfig,
}

impl Default for MultiHeadConfig {
    fn default() -> Self {
        MultiHeadConfig {
            dim: 512,
            dim_head: 64,
            heads: 8,
            dropout: 0.0,
            attention: AttentionConfig::default(),
        }
    }
}

impl MultiHeadConfig {
    pub fn new(dim: usize) -> Self {
        MultiHeadConfig {
            dim,
            ..Default::default()
        }
    }

    pub fn with_heads(mut self, heads: usize, dim_head: usize) -> Self {
        self.heads = heads;
        self.dim_head = dim_head;
        self
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_attention(mut self, attention: AttentionConfig) -> Self {
        self.attention = attention;
        self
    }

    /// `heads * dim_head`
    pub fn inner_dim(&self) -> usize {
        self.heads * self.dim_head
    }

    fn validate(&self) -> Result<()> {
        if self.dim == 0 || self.heads == 0 || self.dim_head == 0 {
            return Err(Error::invalid_config(format!(
                "multi-head attention needs non-zero dim, heads and dim_head (got {}, {}, {})",
                self.dim, self.heads, self.dim_head
            )));
        }
        Ok(())
    }
}

/// `[batch, seq, heads * dim_head]` → `[batch, heads, seq, dim_head]`.
///
/// The last axis is read head-major: feature `h * dim_head + d` belongs to head `h`.
pub fn split_heads(x: &ArrayD<f32>, heads: usize) -> Result<Array4<f32>> {
    let x3 = x
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|_| Error::shape("split_heads", "rank 3 [batch, seq, features]", x.shape()))?;
    let (b, t, features) = x3.dim();
    if heads == 0 || features % heads != 0 {
        return Err(Error::shape(
            "split_heads",
            format!("features divisible by {} heads", heads),
            x.shape(),
        ));
    }
    let per_head = x3
        .as_standard_layout()
        .into_owned()
        .into_shape((b, t, heads, features / heads))
        .map_err(|_| Error::shape("split_heads", "contiguous layout", x.shape()))?;
    Ok(per_head.permuted_axes([0, 2, 1, 3]).as_standard_layout().into_owned())
}

/// `[batch, heads, seq, dim_head]` → `[batch, seq, heads * dim_head]`; the inverse
/// of [`split_heads`].
pub fn merge_heads(x: &Array4<f32>) -> Result<Array3<f32>> {
    let (b, h, t, d) = x.dim();
    x.view()
        .permuted_axes([0, 2, 1, 3])
        .as_standard_layout()
        .into_owned()
        .into_shape((b, t, h * d))
        .map_err(|_| Error::shape("merge_heads", "contiguous layout", x.shape()))
}

/// Splits a fused `[batch, seq, 3 * heads * dim_head]` projection into q, k, v.
///
/// The last axis is decomposed as `(dim_head, 3, heads)` with `heads` varying
/// fastest, i.e. feature `d * 3 * heads + which * heads + h`.
fn split_fused(qkv: &ArrayD<f32>, heads: usize, dim_head: usize) -> Result<[Array4<f32>; 3]> {
    let shape = qkv.shape().to_vec();
    if shape.len() != 3 || shape[2] != 3 * heads * dim_head {
        return Err(Error::shape(
            "fused qkv projection",
            format!("[batch, seq, {}]", 3 * heads * dim_head),
            &shape,
        ));
    }
    let (b, t) = (shape[0], shape[1]);
    let parts = qkv
        .as_standard_layout()
        .into_owned()
        .into_shape(IxDyn(&[b, t, dim_head, 3, heads]))
        .map_err(|_| Error::shape("fused qkv projection", "contiguous layout", &shape))?;
    // -> [3, batch, heads, seq, dim_head]
    let parts = parts.permuted_axes(IxDyn(&[3, 0, 4, 1, 2]));
    let take = |which: usize| -> Result<Array4<f32>> {
        parts
            .index_axis(Axis(0), which)
            .as_standard_layout()
            .into_owned()
            .into_dimensionality::<Ix4>()
            .map_err(|_| Error::shape("fused qkv projection", "rank 4 per part", &shape))
    };
    Ok([take(0)?, take(1)?, take(2)?])
}

fn check_input(x: &ArrayD<f32>, dim: usize, context: &'static str) -> Result<()> {
    if x.ndim() != 3 || x.shape()[2] != dim {
        return Err(Error::shape(context, format!("rank 3 [batch, seq, {}]", dim), x.shape()));
    }
    Ok(())
}

fn build_dropout(p: f32, seed: Option<u64>) -> Result<Dropout> {
    match seed {
        Some(seed) => Dropout::with_seed(p, true, seed),
        None => Dropout::new(p, true),
    }
}

/// Multi-head attention with separate learned Q, K and V projections.
pub struct MultiHeadAttention {
    pub w_q: Linear,
    pub w_k: Linear,
    pub w_v: Linear,
    pub w_o: Linear,
    attention: DotProductAttention,
    dropout: Dropout,
    config: MultiHeadConfig,
}

impl MultiHeadAttention {
    pub fn new(config: MultiHeadConfig) -> Result<Self> {
        Self::build(config, &mut rand::thread_rng(), None)
    }

    /// Deterministic construction: weights and dropout masks derive from `seed`.
    pub fn new_with_seed(config: MultiHeadConfig, seed: u64) -> Result<Self> {
        Self::build(config, &mut StdRng::seed_from_u64(seed), Some(seed.wrapping_add(1)))
    }

    fn build<R: Rng + ?Sized>(config: MultiHeadConfig, rng: &mut R, seed: Option<u64>) -> Result<Self> {
        config.validate()?;
        let inner = config.inner_dim();
        Ok(MultiHeadAttention {
            w_q: Linear::new_with_rng(config.dim, inner, true, rng),
            w_k: Linear::new_with_rng(config.dim, inner, true, rng),
            w_v: Linear::new_with_rng(config.dim, inner, true, rng),
            w_o: Linear::new_with_rng(inner, config.dim, true, rng),
            attention: DotProductAttention::new(config.attention.clone())?,
            dropout: build_dropout(config.dropout, seed)?,
            config,
        })
    }

    pub fn config(&self) -> &MultiHeadConfig {
        &self.config
    }

    pub fn attention(&self) -> &DotProductAttention {
        &self.attention
    }

    /// Forward pass with an optional boolean mask broadcastable to
    /// `[batch, heads, seq, seq]` (`true` = masked out).
    pub fn forward_with_mask(&self, x: &ArrayD<f32>, mask: Option<&ArrayD<bool>>) -> Result<ArrayD<f32>> {
        check_input(x, self.config.dim, "MultiHeadAttention input")?;
        let heads = self.config.heads;
        let q = split_heads(&self.w_q.forward(x)?, heads)?;
        let k = split_heads(&self.w_k.forward(x)?, heads)?;
        let v = split_heads(&self.w_v.forward(x)?, heads)?;
        let attended = self.attention.attend(&q.view(), &k.view(), &v.view(), mask)?;
        let merged = merge_heads(&attended)?.into_dyn();
        let out = self.w_o.forward(&merged)?;
        self.dropout.forward(&out)
    }
}

impl Module for MultiHeadAttention {
    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.forward_with_mask(input, None)
    }

    fn parameters(&self) -> Vec<Parameter> {
        let mut p = self.w_q.parameters();
        p.extend(self.w_k.parameters());
        p.extend(self.w_v.parameters());
        p.extend(self.w_o.parameters());
        p.extend(self.attention.parameters());
        p
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Parameter)> {
        let mut out = Vec::new();
        out.extend(self.w_q.named_parameters(&format!("{}.w_q", prefix)));
        out.extend(self.w_k.named_parameters(&format!("{}.w_k", prefix)));
        out.extend(self.w_v.named_parameters(&format!("{}.w_v", prefix)));
        out.extend(self.w_o.named_parameters(&format!("{}.w_o", prefix)));
        if let Some(beta) = self.attention.linear_bias() {
            out.push((format!("{}.attention.beta", prefix), beta.clone()));
        }
        out
    }

    fn train(&mut self, mode: bool) {
        self.dropout.train(mode);
    }

    fn is_training(&self) -> bool {
        self.dropout.is_training()
    }
}

/// Multi-head self-attention with a single fused QKV projection.
pub struct MultiHeadSelfAttention {
    pub to_qkv: Linear,
    pub w_0: Linear,
    attention: DotProductAttention,
    dropout: Dropout,
    config: MultiHeadConfig,
}

impl MultiHeadSelfAttention {
    pub fn new(config: MultiHeadConfig) -> Result<Self> {
        Self::build(config, &mut rand::thread_rng(), None)
    }

    pub fn new_with_seed(config: MultiHeadConfig, seed: u64) -> Result<Self> {
        Self::build(config, &mut StdRng::seed_from_u64(seed), Some(seed.wrapping_add(1)))
    }

    fn build<R: Rng + ?Sized>(config: MultiHeadConfig, rng: &mut R, seed: Option<u64>) -> Result<Self> {
        config.validate()?;
        let inner = config.inner_dim();
        Ok(MultiHeadSelfAttention {
            to_qkv: Linear::new_with_rng(config.dim, inner * 3, true, rng),
            w_0: Linear::new_with_rng(inner, config.dim, true, rng),
            attention: DotProductAttention::new(config.attention.clone())?,
            dropout: build_dropout(config.dropout, seed)?,
            config,
        })
    }

    pub fn config(&self) -> &MultiHeadConfig {
        &self.config
    }

    pub fn attention(&self) -> &DotProductAttention {
        &self.attention
    }

    pub fn forward_with_mask(&self, x: &ArrayD<f32>, mask: Option<&ArrayD<bool>>) -> Result<ArrayD<f32>> {
        check_input(x, self.config.dim, "MultiHeadSelfAttention input")?;
        let qkv = self.to_qkv.forward(x)?;
        let [q, k, v] = split_fused(&qkv, self.config.heads, self.config.dim_head)?;
        let attended = self.attention.attend(&q.view(), &k.view(), &v.view(), mask)?;
        let merged = merge_heads(&attended)?.into_dyn();
        let out = self.w_0.forward(&merged)?;
        self.dropout.forward(&out)
    }
}

impl Module for MultiHeadSelfAttention {
    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.forward_with_mask(input, None)
    }

    fn parameters(&self) -> Vec<Parameter> {
        let mut p = self.to_qkv.parameters();
        p.extend(self.w_0.parameters());
        p.extend(self.attention.parameters());
        p
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Parameter)> {
        let mut out = Vec::new();
        out.extend(self.to_qkv.named_parameters(&format!("{}.to_qkv", prefix)));
        out.extend(self.w_0.named_parameters(&format!("{}.w_0", prefix)));
        if let Some(beta) = self.attention.linear_bias() {
            out.push((format!("{}.attention.beta", prefix), beta.clone()));
        }
        out
    }

    fn train(&mut self, mode: bool) {
        self.dropout.train(mode);
    }

    fn is_training(&self) -> bool {
        self.dropout.is_training()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn split_heads_is_head_major() {
        // one token with features [h0d0, h0d1, h1d0, h1d1]
        let x = Array::from_shape_vec(IxDyn(&[1, 1, 4]), vec![0.0f32, 1.0, 2.0, 3.0]).unwrap();
        let heads = split_heads(&x, 2).unwrap();
        assert_eq!(heads.dim(), (1, 2, 1, 2));
        assert_eq!(heads[[0, 0, 0, 1]], 1.0);
        assert_eq!(heads[[0, 1, 0, 0]], 2.0);
    }

    #[test]
    fn split_heads_requires_divisible_features() {
        let x = ArrayD::<f32>::zeros(IxDyn(&[1, 2, 5]));
        assert!(split_heads(&x, 2).is_err());
    }

    #[test]
    fn fused_split_puts_heads_fastest() {
        let heads = 2;
        let dim_head = 2;
        let features: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let qkv = Array::from_shape_vec(IxDyn(&[1, 1, 12]), features).unwrap();
        let [q, k, v] = split_fused(&qkv, heads, dim_head).unwrap();
        // feature index = d * 6 + which * 2 + h
        assert_eq!(q[[0, 0, 0, 0]], 0.0);
        assert_eq!(q[[0, 1, 0, 0]], 1.0);
        assert_eq!(k[[0, 0, 0, 0]], 2.0);
        assert_eq!(v[[0, 1, 0, 1]], 11.0);
    }

    #[test]
    fn zero_heads_is_invalid() {
        let cfg = MultiHeadConfig::new(8).with_heads(0, 4);
        assert!(matches!(MultiHeadAttention::new(cfg), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn dropout_out_of_range_is_invalid() {
        let cfg = MultiHeadConfig::new(8).with_heads(2, 4).with_dropout(1.5);
        assert!(matches!(MultiHeadSelfAttention::new(cfg), Err(Error::InvalidConfig(_))));
    }
}
