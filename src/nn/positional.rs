//! Positional embeddings over `[batch, seq_len, d_model]` inputs.
//!
//! Absolute and rotary embeddings are fixed functions of position (followed by
//! dropout); the two relative variants own a learned table.

use crate::error::{Error, Result};
use crate::nn::{Dropout, Module};
use crate::tensor::Parameter;
use ndarray::{s, Array2, Array3, ArrayD, ArrayView3, Axis, Ix2, Ix3};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn as_rank3<'a>(x: &'a ArrayD<f32>, context: &'static str) -> Result<ArrayView3<'a, f32>> {
    x.view()
        .into_dimensionality::<Ix3>()
        .map_err(|_| Error::shape(context, "rank 3 [batch, seq_len, d_model]", x.shape()))
}

fn check_model_dim(x: &ArrayView3<f32>, d_model: usize, context: &'static str) -> Result<()> {
    if x.dim().2 != d_model {
        return Err(Error::shape(
            context,
            format!("[batch, seq_len, {}]", d_model),
            x.shape(),
        ));
    }
    Ok(())
}

fn non_zero(value: usize, what: &str) -> Result<()> {
    if value == 0 {
        return Err(Error::invalid_config(format!("{} must be at least 1", what)));
    }
    Ok(())
}

/// Adds `table[..seq_len]` (rows are positions) to every batch element.
fn add_rows(x: &ArrayView3<f32>, table: &ArrayD<f32>, rows: &[usize]) -> Result<ArrayD<f32>> {
    let table = table
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| Error::shape("embedding table", "rank 2", table.shape()))?;
    let picked = table.select(Axis(0), rows);
    Ok((x + &picked).into_dyn())
}

/// Sinusoidal absolute position encoding, precomputed for `max_len` positions.
pub struct AbsolutePositionalEmbedding {
    pe: Array2<f32>,
    d_model: usize,
    dropout: Dropout,
}

impl AbsolutePositionalEmbedding {
    pub const DEFAULT_MAX_LEN: usize = 512;

    pub fn new(d_model: usize, max_len: usize, dropout: f32) -> Result<Self> {
        Self::build(d_model, max_len, Dropout::new(dropout, true)?)
    }

    pub fn new_with_seed(d_model: usize, max_len: usize, dropout: f32, seed: u64) -> Result<Self> {
        Self::build(d_model, max_len, Dropout::with_seed(dropout, true, seed)?)
    }

    fn build(d_model: usize, max_len: usize, dropout: Dropout) -> Result<Self> {
        non_zero(d_model, "absolute embedding d_model")?;
        non_zero(max_len, "absolute embedding max_len")?;
        let log_base = 10000f32.ln();
        let pe = Array2::from_shape_fn((max_len, d_model), |(pos, col)| {
            let pair = (col / 2) * 2;
            let omega = (-(pair as f32) * log_base / d_model as f32).exp();
            let angle = pos as f32 * omega;
            if col % 2 == 0 {
                angle.sin()
            } else {
                angle.cos()
            }
        });
        Ok(AbsolutePositionalEmbedding { pe, d_model, dropout })
    }

    pub fn max_len(&self) -> usize {
        self.pe.nrows()
    }

    /// The precomputed `[max_len, d_model]` encoding table.
    pub fn table(&self) -> &Array2<f32> {
        &self.pe
    }
}

impl Module for AbsolutePositionalEmbedding {
    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = as_rank3(input, "AbsolutePositionalEmbedding input")?;
        check_model_dim(&x, self.d_model, "AbsolutePositionalEmbedding input")?;
        let seq_len = x.dim().1;
        if seq_len > self.max_len() {
            return Err(Error::too_long(seq_len, self.max_len()));
        }
        let encoded = (&x + &self.pe.slice(s![..seq_len, ..])).into_dyn();
        self.dropout.forward(&encoded)
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![]
    }

    fn train(&mut self, mode: bool) {
        self.dropout.train(mode);
    }

    fn is_training(&self) -> bool {
        self.dropout.is_training()
    }
}

struct RotaryCache {
    cos: Array2<f32>,
    sin: Array2<f32>,
}

impl RotaryCache {
    fn empty(d_model: usize) -> Self {
        RotaryCache {
            cos: Array2::zeros((0, d_model)),
            sin: Array2::zeros((0, d_model)),
        }
    }

    fn len(&self) -> usize {
        self.cos.nrows()
    }
}

struct RotaryState {
    cache: RotaryCache,
    rebuilds: usize,
}

/// Rotary position embedding over the first `d_model` features.
///
/// The output is `x + concat(rotate(x[.., .., ..d_model]), x[.., .., d_model..])`:
/// the rotated features are added to the input, and any trailing pass-through
/// features are therefore doubled.
///
/// The cos/sin cache sits behind a mutex, so `forward` takes `&self`; how
/// concurrent `forward` calls on one instance interleave is not defined.
pub struct RotaryPositionalEmbedding {
    d_model: usize,
    base: f32,
    dropout: Dropout,
    state: Mutex<RotaryState>,
}

impl RotaryPositionalEmbedding {
    pub const DEFAULT_BASE: f32 = 10000.0;

    pub fn new(d_model: usize, base: f32, dropout: f32) -> Result<Self> {
        Self::build(d_model, base, Dropout::new(dropout, true)?)
    }

    pub fn new_with_seed(d_model: usize, base: f32, dropout: f32, seed: u64) -> Result<Self> {
        Self::build(d_model, base, Dropout::with_seed(dropout, true, seed)?)
    }

    fn build(d_model: usize, base: f32, dropout: Dropout) -> Result<Self> {
        if d_model == 0 || d_model % 2 != 0 {
            return Err(Error::invalid_config(format!(
                "rotary embedding needs an even, non-zero d_model, got {}",
                d_model
            )));
        }
        if !(base.is_finite() && base > 0.0) {
            return Err(Error::invalid_config(format!(
                "rotary embedding base must be positive, got {}",
                base
            )));
        }
        Ok(RotaryPositionalEmbedding {
            d_model,
            base,
            dropout,
            state: Mutex::new(RotaryState {
                cache: RotaryCache::empty(d_model),
                rebuilds: 0,
            }),
        })
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    /// Number of positions the cached tables currently cover.
    pub fn cached_len(&self) -> usize {
        self.state.lock().cache.len()
    }

    /// How many times the cos/sin tables have been (re)computed.
    pub fn cache_rebuilds(&self) -> usize {
        self.state.lock().rebuilds
    }

    /// Recomputes the tables for exactly `len` positions.
    pub fn force_rebuild(&self, len: usize) {
        let mut state = self.state.lock();
        self.rebuild(&mut state, len);
    }

    fn rebuild<'a>(&self, state: &'a mut RotaryState, len: usize) -> &'a RotaryCache {
        let half = self.d_model / 2;
        let d = self.d_model as f32;
        let angles = Array2::from_shape_fn((len, self.d_model), |(pos, col)| {
            let i = (col % half) as f32;
            let theta = self.base.powf(-2.0 * i / d);
            pos as f32 * theta
        });
        state.rebuilds += 1;
        log::debug!("rotary embedding cache rebuilt for {} positions", len);
        state.cache = RotaryCache {
            cos: angles.mapv(f32::cos),
            sin: angles.mapv(f32::sin),
        };
        &state.cache
    }

    fn rotate(&self, x: &ArrayView3<f32>) -> Array3<f32> {
        let (b, t, _) = x.dim();
        let d = self.d_model;
        let half = d / 2;
        let mut state = self.state.lock();
        let cache = if state.cache.len() < t {
            self.rebuild(&mut state, t)
        } else {
            &state.cache
        };

        let x_rope = x.slice(s![.., .., ..d]);
        let mut neg_half = Array3::<f32>::zeros((b, t, d));
        neg_half
            .slice_mut(s![.., .., ..half])
            .assign(&x_rope.slice(s![.., .., half..]).mapv(|v| -v));
        neg_half
            .slice_mut(s![.., .., half..])
            .assign(&x_rope.slice(s![.., .., ..half]));

        let cos = cache.cos.slice(s![..t, ..]);
        let sin = cache.sin.slice(s![..t, ..]);
        &x_rope * &cos + &neg_half * &sin
    }
}

impl Module for RotaryPositionalEmbedding {
    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = as_rank3(input, "RotaryPositionalEmbedding input")?;
        if x.dim().2 < self.d_model {
            return Err(Error::shape(
                "RotaryPositionalEmbedding input",
                format!("at least {} features", self.d_model),
                x.shape(),
            ));
        }
        let rotated = self.rotate(&x);
        let mut out = x.to_owned();
        let d = self.d_model;
        out.slice_mut(s![.., .., ..d]).zip_mut_with(&rotated, |o, &r| *o += r);
        out.slice_mut(s![.., .., d..]).mapv_inplace(|v| v * 2.0);
        self.dropout.forward(&out.into_dyn())
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![]
    }

    fn train(&mut self, mode: bool) {
        self.dropout.train(mode);
    }

    fn is_training(&self) -> bool {
        self.dropout.is_training()
    }
}

/// Learned relative-position table `[2 * max_position + 1, d_model]`, indexed by
/// absolute position.
pub struct RelativeEmbedding {
    pub embeddings_table: Parameter,
    max_position: usize,
    d_model: usize,
}

impl RelativeEmbedding {
    pub const DEFAULT_MAX_POSITION: usize = 512;

    pub fn new(d_model: usize, max_position: usize) -> Result<Self> {
        Self::new_with_rng(d_model, max_position, &mut rand::thread_rng())
    }

    pub fn new_with_seed(d_model: usize, max_position: usize, seed: u64) -> Result<Self> {
        Self::new_with_rng(d_model, max_position, &mut StdRng::seed_from_u64(seed))
    }

    /// Xavier-uniform initialised table.
    pub fn new_with_rng<R: Rng + ?Sized>(d_model: usize, max_position: usize, rng: &mut R) -> Result<Self> {
        non_zero(d_model, "relative embedding d_model")?;
        non_zero(max_position, "relative embedding max_position")?;
        let rows = 2 * max_position + 1;
        Ok(RelativeEmbedding {
            embeddings_table: Parameter::new(
                "embeddings_table",
                crate::ops::xavier_uniform(rows, d_model, rng),
            ),
            max_position,
            d_model,
        })
    }

    pub fn max_position(&self) -> usize {
        self.max_position
    }
}

impl Module for RelativeEmbedding {
    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = as_rank3(input, "RelativeEmbedding input")?;
        check_model_dim(&x, self.d_model, "RelativeEmbedding input")?;
        let seq_len = x.dim().1;
        if seq_len > self.max_position {
            return Err(Error::too_long(seq_len, self.max_position));
        }
        let rows: Vec<usize> = (0..seq_len).collect();
        let table = self.embeddings_table.lock();
        add_rows(&x, &table.data, &rows)
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![self.embeddings_table.clone()]
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Parameter)> {
        vec![(format!("{}.embeddings_table", prefix), self.embeddings_table.clone())]
    }
}

/// T5-style relative table `[max_position², d_model]` with `N(0, 1)` init.
///
/// Position `p` reads row `clamp(p, -max_position, max_position) + max_position`.
pub struct T5RelativeEmbedding {
    pub embeddings_table: Parameter,
    max_position: usize,
    d_model: usize,
}

impl T5RelativeEmbedding {
    pub const DEFAULT_MAX_POSITION: usize = 512;

    pub fn new(d_model: usize, max_position: usize) -> Result<Self> {
        Self::new_with_rng(d_model, max_position, &mut rand::thread_rng())
    }

    pub fn new_with_seed(d_model: usize, max_position: usize, seed: u64) -> Result<Self> {
        Self::new_with_rng(d_model, max_position, &mut StdRng::seed_from_u64(seed))
    }

    pub fn new_with_rng<R: Rng + ?Sized>(d_model: usize, max_position: usize, rng: &mut R) -> Result<Self> {
        non_zero(d_model, "T5 embedding d_model")?;
        // rows max..2*max must fit inside max² rows
        if max_position < 2 {
            return Err(Error::invalid_config(format!(
                "T5 embedding max_position must be at least 2, got {}",
                max_position
            )));
        }
        let rows = max_position * max_position;
        Ok(T5RelativeEmbedding {
            embeddings_table: Parameter::new(
                "embeddings_table",
                crate::ops::standard_normal(&[rows, d_model], rng),
            ),
            max_position,
            d_model,
        })
    }

    pub fn max_position(&self) -> usize {
        self.max_position
    }

    /// Table row read for position `p`.
    pub fn bucket(&self, p: isize) -> usize {
        let max = self.max_position as isize;
        (p.clamp(-max, max) + max) as usize
    }
}

impl Module for T5RelativeEmbedding {
    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = as_rank3(input, "T5RelativeEmbedding input")?;
        check_model_dim(&x, self.d_model, "T5RelativeEmbedding input")?;
        let seq_len = x.dim().1;
        if seq_len > self.max_position {
            return Err(Error::too_long(seq_len, self.max_position));
        }
        let rows: Vec<usize> = (0..seq_len as isize).map(|p| self.bucket(p)).collect();
        let table = self.embeddings_table.lock();
        add_rows(&x, &table.data, &rows)
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![self.embeddings_table.clone()]
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Parameter)> {
        vec![(format!("{}.embeddings_table", prefix), self.embeddings_table.clone())]
    }
}
