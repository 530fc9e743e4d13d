use ndarray::{ArrayD, IxDyn};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// `ParamData` holds the values of a trainable array together with the gradient
/// written into it by the surrounding training framework.
#[derive(Debug)]
pub struct ParamData {
    /// Human-readable name, e.g. `"attn.w_q.weight"`.
    pub name: String,
    /// The parameter values.
    pub data: ArrayD<f32>,
    /// The gradient, if one has been populated since the last `zero_grad`.
    pub grad: Option<ArrayD<f32>>,
}

/// A named, mutable multi-dimensional array with an attached gradient.
///
/// `Parameter` is a cheap shared handle: cloning it yields another handle onto
/// the same storage, so a module and an optimizer can both refer to a weight
/// without copying it. Equality is handle identity.
#[derive(Clone, Debug)]
pub struct Parameter(Arc<Mutex<ParamData>>);

impl Parameter {
    /// Creates a new parameter with no gradient.
    ///
    /// # Arguments
    ///
    /// * `name` - The parameter's name.
    /// * `data` - The initial values.
    pub fn new(name: impl Into<String>, data: ArrayD<f32>) -> Self {
        Parameter(Arc::new(Mutex::new(ParamData {
            name: name.into(),
            data,
            grad: None,
        })))
    }

    /// Creates a zero-filled parameter of the given shape.
    pub fn zeros(name: impl Into<String>, shape: &[usize]) -> Self {
        Parameter::new(name, ArrayD::zeros(IxDyn(shape)))
    }

    /// Locks the parameter for reading or writing.
    pub fn lock(&self) -> MutexGuard<'_, ParamData> {
        self.0.lock()
    }

    /// Returns the parameter's name.
    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    /// Returns the shape of the parameter values.
    pub fn shape(&self) -> Vec<usize> {
        self.lock().data.shape().to_vec()
    }

    /// Returns a copy of the current values.
    pub fn data(&self) -> ArrayD<f32> {
        self.lock().data.clone()
    }

    /// Returns a copy of the current gradient, if any.
    pub fn grad(&self) -> Option<ArrayD<f32>> {
        self.lock().grad.clone()
    }

    /// Replaces the gradient.
    pub fn set_grad(&self, grad: ArrayD<f32>) {
        self.lock().grad = Some(grad);
    }

    /// Replaces the values, keeping the gradient.
    pub fn set_data(&self, data: ArrayD<f32>) {
        self.lock().data = data;
    }

    /// Clears the gradient.
    pub fn zero_grad(&self) {
        self.lock().grad = None;
    }

    /// Returns true when both handles refer to the same storage.
    pub fn ptr_eq(&self, other: &Parameter) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Parameter {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Parameter {}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn clones_share_storage() {
        let p = Parameter::new("w", arr1(&[1.0, 2.0]).into_dyn());
        let q = p.clone();
        q.lock().data[[0]] = 5.0;
        assert_eq!(p.data()[[0]], 5.0);
        assert_eq!(p, q);
    }

    #[test]
    fn distinct_parameters_are_not_equal() {
        let p = Parameter::zeros("a", &[2]);
        let q = Parameter::zeros("a", &[2]);
        assert_ne!(p, q);
    }

    #[test]
    fn zero_grad_clears_gradient() {
        let p = Parameter::zeros("b", &[3]);
        p.set_grad(arr1(&[1.0, 1.0, 1.0]).into_dyn());
        assert!(p.grad().is_some());
        p.zero_grad();
        assert!(p.grad().is_none());
        assert_eq!(p.shape(), vec![3]);
        assert_eq!(p.name(), "b");
    }
}
