use crate::error::{Error, Result};
use crate::tensor::Parameter;
use ndarray::ArrayD;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub mod attention;
pub use attention::{AttentionConfig, DotProductAttention, LocalWindow, WindowAxis};
pub mod multi_head_attention_module;
pub use multi_head_attention_module::{
    merge_heads, split_heads, MultiHeadAttention, MultiHeadConfig, MultiHeadSelfAttention,
};
pub mod optim;
pub use optim::{MomentState, ParamGroup, ParamHandle, ScaledAdam, ScaledAdamConfig};
pub mod positional;
pub use positional::{
    AbsolutePositionalEmbedding, RelativeEmbedding, RotaryPositionalEmbedding, T5RelativeEmbedding,
};


/// A trait for neural network modules.
///
/// Modules consume and produce dynamically ranked `f32` arrays; each
/// implementation checks the rank it needs and reports a
/// [`Error::ShapeContractViolation`] otherwise.
pub trait Module {
    /// Performs a forward pass through the module.
    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>>;

    /// Returns handles onto the trainable parameters of the module.
    fn parameters(&self) -> Vec<Parameter>;

    /// Default: return a vector of (name, Parameter) pairs for module parameters
    fn named_parameters(&self, prefix: &str) -> Vec<(String, Parameter)> {
        self.parameters()
            .into_iter()
            .enumerate()
            .map(|(i, p)| (format!("{}param{}", prefix, i), p))
            .collect()
    }

    /// Switches between training (`true`) and inference (`false`) behaviour.
    fn train(&mut self, _mode: bool) {}

    /// Whether the module is in training mode.
    fn is_training(&self) -> bool {
        false
    }
}

/// A linear (fully connected) layer: `y = x · W + b` over the last axis.
#[derive(Clone, Debug)]
pub struct Linear {
    /// `[in_features, out_features]`
    pub weight: Parameter,
    /// `[out_features]`
    pub bias: Option<Parameter>,
}

impl Linear {
    /// Creates a new linear layer with weights and bias drawn from
    /// `U(-1/sqrt(in_features), 1/sqrt(in_features))`.
    ///
    /// # Arguments
    ///
    /// * `in_features` - The number of input features.
    /// * `out_features` - The number of output features.
    /// * `bias` - Whether to include a bias term.
    pub fn new(in_features: usize, out_features: usize, bias: bool) -> Self {
        Self::new_with_rng(in_features, out_features, bias, &mut rand::thread_rng())
    }

    /// Same as [`Linear::new`] but draws the initial values from `rng`.
    pub fn new_with_rng<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        bias: bool,
        rng: &mut R,
    ) -> Self {
        let bound = 1.0 / (in_features.max(1) as f32).sqrt();
        let weight = Parameter::new(
            "weight",
            crate::ops::uniform(&[in_features, out_features], bound, rng),
        );
        let bias = if bias {
            Some(Parameter::new(
                "bias",
                crate::ops::uniform(&[out_features], bound, rng),
            ))
        } else {
            None
        };
        Linear { weight, bias }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[1]
    }
}

impl Module for Linear {
    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let weight = self.weight.lock();
        match &self.bias {
            Some(bias) => {
                let bias = bias.lock();
                crate::ops::linear(input, &weight.data, Some(&bias.data))
            }
            None => crate::ops::linear(input, &weight.data, None),
        }
    }

    fn parameters(&self) -> Vec<Parameter> {
        let mut params = vec![self.weight.clone()];
        if let Some(bias) = &self.bias {
            params.push(bias.clone());
        }
        params
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Parameter)> {
        let mut out = vec![(format!("{}.weight", prefix), self.weight.clone())];
        if let Some(b) = &self.bias {
            out.push((format!("{}.bias", prefix), b.clone()));
        }
        out
    }
}

/// Dropout layer.
///
/// In training mode every element is zeroed with probability `p` and the
/// survivors are scaled by `1 / (1 - p)`; in inference mode it is the identity.
pub struct Dropout {
    p: f32,
    training: bool,
    rng: Mutex<StdRng>,
}

impl Dropout {
    /// Creates a dropout layer seeded from OS entropy.
    pub fn new(p: f32, training: bool) -> Result<Self> {
        Self::with_rng(p, training, StdRng::from_entropy())
    }

    /// Creates a dropout layer with a fixed seed, for reproducible masks.
    pub fn with_seed(p: f32, training: bool, seed: u64) -> Result<Self> {
        Self::with_rng(p, training, StdRng::seed_from_u64(seed))
    }

    fn with_rng(p: f32, training: bool, rng: StdRng) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(Error::invalid_config(format!(
                "dropout probability must be in [0, 1), got {}",
                p
            )));
        }
        Ok(Dropout {
            p,
            training,
            rng: Mutex::new(rng),
        })
    }

    /// Drop probability.
    pub fn p(&self) -> f32 {
        self.p
    }
}

impl Module for Dropout {
    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        if !self.training || self.p == 0.0 {
            return Ok(input.clone());
        }
        let mask = crate::ops::dropout_mask(input.shape(), self.p, &mut *self.rng.lock());
        Ok(input * &mask)
    }

    fn parameters(&self) -> Vec<Parameter> {
        vec![]
    }

    fn train(&mut self, mode: bool) {
        self.training = mode;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

/// A trait for optimizers that own their registered parameters' update state.
pub trait Optimizer {
    /// Performs a single optimization step.
    ///
    /// When a closure is supplied it is invoked first (typically to recompute
    /// the loss and refresh gradients) and its loss is returned unchanged.
    fn step(&mut self, closure: Option<&mut dyn FnMut() -> f32>) -> Result<Option<f32>>;

    /// Clears the gradients of all registered parameters.
    fn zero_grad(&mut self);
}
