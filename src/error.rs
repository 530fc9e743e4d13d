use thiserror::Error;

/// Errors raised by the building blocks in this crate.
///
/// Every failure is reported synchronously, before any parameter or cache is
/// mutated.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A constructor (or setter) received an argument outside its valid range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// An input had the wrong rank or dimensions.
    #[error("Shape contract violated in {context}: expected {expected}, got {got:?}")]
    ShapeContractViolation {
        context: &'static str,
        expected: String,
        got: Vec<usize>,
    },
    /// A sequence is longer than the fixed capacity of a table or bias.
    #[error("Sequence length {len} exceeds the maximum position {max}")]
    SequenceTooLong { len: usize, max: usize },
}

impl Error {
    pub(crate) fn invalid_config(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        log::debug!("rejecting configuration: {}", msg);
        Error::InvalidConfig(msg)
    }

    pub(crate) fn shape(context: &'static str, expected: impl Into<String>, got: &[usize]) -> Self {
        let expected = expected.into();
        log::debug!("{}: expected {}, got {:?}", context, expected, got);
        Error::ShapeContractViolation {
            context,
            expected,
            got: got.to_vec(),
        }
    }

    pub(crate) fn too_long(len: usize, max: usize) -> Self {
        log::debug!("sequence length {} exceeds capacity {}", len, max);
        Error::SequenceTooLong { len, max }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
