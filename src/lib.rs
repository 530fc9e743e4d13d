//! Building blocks for conformer / RNN-T speech models.
//!
//! The crate provides an Adam-style optimizer with bias correction and
//! learning-rate scaling, a configurable scaled dot-product attention core
//! (masking, local-window smoothing, learned linear bias), two multi-head
//! wrappers and four positional embeddings. All numeric work runs on
//! [`ndarray`] arrays of `f32`.
//!
//! ```no_run
//! use conformer_blocks::nn::{Module, MultiHeadConfig, MultiHeadSelfAttention};
//! use ndarray::{ArrayD, IxDyn};
//!
//! let attn = MultiHeadSelfAttention::new(MultiHeadConfig::new(16).with_heads(4, 8))?;
//! let x = ArrayD::<f32>::zeros(IxDyn(&[2, 10, 16]));
//! let y = attn.forward(&x)?;
//! assert_eq!(y.shape(), &[2, 10, 16]);
//! # Ok::<(), conformer_blocks::Error>(())
//! ```

pub mod error;
#[path = "nn/mod.rs"]
pub mod nn;
pub mod ops;
pub mod tensor;

pub use error::{Error, Result};
pub use nn::{Module, Optimizer};
pub use tensor::Parameter;
