//! Adam-style optimizer with bias correction and a fixed learning-rate scale.
//!
//! Per-parameter moment state is kept in a handle-indexed arena: registering a
//! parameter returns a [`ParamHandle`], and the state for that handle is created
//! lazily on the first step that sees a gradient for it.

use crate::error::{Error, Result};
use crate::nn::Optimizer;
use crate::tensor::{ParamData, Parameter};
use ndarray::{ArrayD, IxDyn, Zip};
use serde::{Deserialize, Serialize};

/// Hyperparameters of [`ScaledAdam`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaledAdamConfig {
    pub lr: f32,
    /// Decay rate of the first moment.
    pub beta1: f32,
    /// Decay rate of the second moment.
    pub beta2: f32,
    pub eps: f32,
    pub bias_correction: bool,
    /// Multiply the learning rate by `(1 - beta1)^0.5 / (1 - beta2)`.
    pub scaling: bool,
}

impl Default for ScaledAdamConfig {
    fn default() -> Self {
        ScaledAdamConfig {
            lr: 1e-5,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-7,
            bias_correction: true,
            scaling: true,
        }
    }
}

impl ScaledAdamConfig {
    pub fn with_lr(mut self, lr: f32) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_bias_correction(mut self, on: bool) -> Self {
        self.bias_correction = on;
        self
    }

    pub fn with_scaling(mut self, on: bool) -> Self {
        self.scaling = on;
        self
    }

    fn validate(&self) -> Result<()> {
        if !(self.lr.is_finite() && self.lr >= 0.0) {
            return Err(Error::invalid_config(format!("Invalid learning rate: {}", self.lr)));
        }
        if self.bias_correction && (self.beta1 < 0.0 || self.beta2 < 0.0) {
            return Err(Error::invalid_config(format!(
                "Invalid beta parameters: ({}, {})",
                self.beta1, self.beta2
            )));
        }
        if self.beta1 >= 1.0 || self.beta2 >= 1.0 {
            log::warn!(
                "betas ({}, {}) reach 1; bias correction or scaling will divide by zero",
                self.beta1,
                self.beta2
            );
        }
        Ok(())
    }

    /// Learning-rate multiplier applied when `scaling` is on.
    pub fn scale(&self) -> f32 {
        if self.scaling {
            (1.0 - self.beta1).sqrt() / (1.0 - self.beta2)
        } else {
            1.0
        }
    }

    /// Bias-correction divisors `(1 - beta1^step, 1 - beta2^step)`.
    fn correction(&self, step: u64) -> (f32, f32) {
        if self.bias_correction {
            let t = step as f32;
            (1.0 - self.beta1.powf(t), 1.0 - self.beta2.powf(t))
        } else {
            (1.0, 1.0)
        }
    }
}

/// Overrides applied to a subset of the registered parameters.
///
/// Unset fields inherit the optimizer-wide [`ScaledAdamConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamGroup {
    pub lr: Option<f32>,
    pub beta1: Option<f32>,
    pub beta2: Option<f32>,
    pub eps: Option<f32>,
    pub bias_correction: Option<bool>,
    /// Frozen parameters are never updated and never get state.
    pub frozen: bool,
}

impl ParamGroup {
    pub fn with_lr(mut self, lr: f32) -> Self {
        self.lr = Some(lr);
        self
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = Some(beta1);
        self.beta2 = Some(beta2);
        self
    }

    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = Some(eps);
        self
    }

    pub fn with_bias_correction(mut self, on: bool) -> Self {
        self.bias_correction = Some(on);
        self
    }

    pub fn frozen(mut self) -> Self {
        self.frozen = true;
        self
    }

    fn resolve(&self, base: &ScaledAdamConfig) -> ScaledAdamConfig {
        ScaledAdamConfig {
            lr: self.lr.unwrap_or(base.lr),
            beta1: self.beta1.unwrap_or(base.beta1),
            beta2: self.beta2.unwrap_or(base.beta2),
            eps: self.eps.unwrap_or(base.eps),
            bias_correction: self.bias_correction.unwrap_or(base.bias_correction),
            scaling: base.scaling,
        }
    }
}

/// Stable index of a registered parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamHandle(usize);

impl ParamHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Running moments of one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct MomentState {
    /// Number of updates applied so far.
    pub step: u64,
    pub first_moment: ArrayD<f32>,
    pub second_moment: ArrayD<f32>,
}

impl MomentState {
    fn zeros(shape: IxDyn) -> Self {
        MomentState {
            step: 0,
            first_moment: ArrayD::zeros(shape.clone()),
            second_moment: ArrayD::zeros(shape),
        }
    }
}

struct Slot {
    param: Parameter,
    group: usize,
    state: Option<MomentState>,
}

/// Adam with bias correction and an optional constant learning-rate scale
/// `(1 - beta1)^0.5 / (1 - beta2)`.
///
/// ```text
/// m ← β1·m + (1-β1)·g
/// v ← β2·v + (1-β2)·g²
/// θ ← θ - lr·scale · m̂ / (sqrt(v̂) + ε)
/// ```
///
/// Registered parameters are shared handles; how a `step` interleaves with
/// concurrent `forward` calls or other writers of the same parameters is not
/// defined.
pub struct ScaledAdam {
    config: ScaledAdamConfig,
    groups: Vec<ParamGroup>,
    slots: Vec<Slot>,
}

impl ScaledAdam {
    /// Creates an optimizer over `params`, all in one group without overrides.
    pub fn new<I>(params: I, config: ScaledAdamConfig) -> Result<Self>
    where
        I: IntoIterator<Item = Parameter>,
    {
        config.validate()?;
        let mut opt = ScaledAdam {
            config,
            groups: Vec::new(),
            slots: Vec::new(),
        };
        opt.add_param_group(params, ParamGroup::default())?;
        Ok(opt)
    }

    /// Registers another group of parameters and returns their handles.
    ///
    /// Fails if the resolved hyperparameters are invalid or a parameter is
    /// already registered.
    pub fn add_param_group<I>(&mut self, params: I, group: ParamGroup) -> Result<Vec<ParamHandle>>
    where
        I: IntoIterator<Item = Parameter>,
    {
        group.resolve(&self.config).validate()?;
        let params: Vec<Parameter> = params.into_iter().collect();
        for (i, p) in params.iter().enumerate() {
            let seen_before = self.slots.iter().any(|s| s.param.ptr_eq(p))
                || params[..i].iter().any(|q| q.ptr_eq(p));
            if seen_before {
                return Err(Error::invalid_config(format!(
                    "parameter '{}' appears in more than one parameter group",
                    p.name()
                )));
            }
        }
        let group_index = self.groups.len();
        self.groups.push(group);
        let handles = params
            .into_iter()
            .map(|param| {
                let handle = ParamHandle(self.slots.len());
                self.slots.push(Slot {
                    param,
                    group: group_index,
                    state: None,
                });
                handle
            })
            .collect();
        Ok(handles)
    }

    pub fn config(&self) -> &ScaledAdamConfig {
        &self.config
    }

    /// Optimizer-wide learning rate.
    pub fn lr(&self) -> f32 {
        self.config.lr
    }

    /// Sets the optimizer-wide learning rate; group overrides are kept.
    pub fn set_lr(&mut self, lr: f32) -> Result<()> {
        let next = self.config.with_lr(lr);
        next.validate()?;
        self.config = next;
        Ok(())
    }

    pub fn param_count(&self) -> usize {
        self.slots.len()
    }

    pub fn parameter(&self, handle: ParamHandle) -> Option<&Parameter> {
        self.slots.get(handle.0).map(|s| &s.param)
    }

    /// Handle under which `param` was registered.
    pub fn handle_of(&self, param: &Parameter) -> Option<ParamHandle> {
        self.slots
            .iter()
            .position(|s| s.param.ptr_eq(param))
            .map(ParamHandle)
    }

    /// Every registered parameter, in handle order.
    pub fn parameters(&self) -> Vec<Parameter> {
        self.slots.iter().map(|s| s.param.clone()).collect()
    }

    /// Hyperparameters in effect for `handle` after group overrides.
    pub fn effective_config(&self, handle: ParamHandle) -> Option<ScaledAdamConfig> {
        let slot = self.slots.get(handle.0)?;
        Some(self.groups[slot.group].resolve(&self.config))
    }

    /// Moment state, once the parameter has been updated at least once.
    pub fn state(&self, handle: ParamHandle) -> Option<&MomentState> {
        self.slots.get(handle.0)?.state.as_ref()
    }

    /// `(m̂, v̂)` exactly as the last update used them.
    pub fn corrected_moments(&self, handle: ParamHandle) -> Option<(ArrayD<f32>, ArrayD<f32>)> {
        let cfg = self.effective_config(handle)?;
        let state = self.state(handle)?;
        let (c1, c2) = cfg.correction(state.step);
        Some((&state.first_moment / c1, &state.second_moment / c2))
    }

    /// Checks every pending update and returns the slots that will be touched.
    fn plan(&self) -> Result<Vec<usize>> {
        let mut pending = Vec::new();
        for (i, slot) in self.slots.iter().enumerate() {
            if self.groups[slot.group].frozen {
                continue;
            }
            let guard = slot.param.lock();
            let grad = match &guard.grad {
                Some(grad) => grad,
                None => {
                    log::debug!("skipping '{}': no gradient", guard.name);
                    continue;
                }
            };
            if grad.shape() != guard.data.shape() {
                return Err(Error::shape(
                    "ScaledAdam gradient",
                    format!("{:?}", guard.data.shape()),
                    grad.shape(),
                ));
            }
            if let Some(state) = &slot.state {
                if state.first_moment.shape() != guard.data.shape() {
                    return Err(Error::shape(
                        "ScaledAdam moment state",
                        format!("{:?}", guard.data.shape()),
                        state.first_moment.shape(),
                    ));
                }
            }
            pending.push(i);
        }
        Ok(pending)
    }
}

fn update(cfg: &ScaledAdamConfig, param: &mut ParamData, state: &mut MomentState) {
    let ParamData { data, grad, .. } = param;
    let grad = match grad.as_ref() {
        Some(grad) => grad,
        None => return,
    };
    let (b1, b2) = (cfg.beta1, cfg.beta2);

    state.step += 1;
    state
        .first_moment
        .zip_mut_with(grad, |m, &g| *m = b1 * *m + (1.0 - b1) * g);
    state
        .second_moment
        .zip_mut_with(grad, |v, &g| *v = b2 * *v + (1.0 - b2) * g * g);

    let (c1, c2) = cfg.correction(state.step);
    let lr = cfg.lr * cfg.scale();
    let eps = cfg.eps;
    Zip::from(data)
        .and(&state.first_moment)
        .and(&state.second_moment)
        .for_each(|p, &m, &v| {
            let m_hat = m / c1;
            let v_hat = v / c2;
            *p -= lr * m_hat / (v_hat.sqrt() + eps);
        });
}

impl Optimizer for ScaledAdam {
    fn step(&mut self, closure: Option<&mut dyn FnMut() -> f32>) -> Result<Option<f32>> {
        let loss = closure.map(|f| f());
        let pending = self.plan()?;
        for i in pending {
            let cfg = self.groups[self.slots[i].group].resolve(&self.config);
            let slot = &mut self.slots[i];
            let mut guard = slot.param.lock();
            let shape = guard.data.raw_dim();
            let state = slot.state.get_or_insert_with(|| MomentState::zeros(shape));
            update(&cfg, &mut guard, state);
        }
        Ok(loss)
    }

    fn zero_grad(&mut self) {
        for slot in &self.slots {
            slot.param.zero_grad();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, ArrayD};

    fn param(values: &[f32]) -> Parameter {
        Parameter::new("p", arr1(values).into_dyn())
    }

    #[test]
    fn default_hyperparameters() {
        let cfg = ScaledAdamConfig::default();
        assert_eq!(cfg.lr, 1e-5);
        assert_eq!((cfg.beta1, cfg.beta2), (0.9, 0.999));
        assert_eq!(cfg.eps, 1e-7);
        assert!(cfg.bias_correction && cfg.scaling);
    }

    #[test]
    fn correction_is_identity_when_disabled() {
        let on = ScaledAdamConfig::default();
        let (c1, c2) = on.correction(1);
        assert!((c1 - 0.1).abs() < 1e-6);
        assert!((c2 - 0.001).abs() < 1e-6);
        assert_eq!(on.with_bias_correction(false).correction(1), (1.0, 1.0));
        assert_eq!(on.with_bias_correction(false).correction(50), (1.0, 1.0));
    }

    #[test]
    fn scale_factor() {
        let cfg = ScaledAdamConfig::default();
        let expected = 0.1f32.sqrt() / 0.001;
        assert!((cfg.scale() - expected).abs() / expected < 1e-3);
        assert_eq!(cfg.with_scaling(false).scale(), 1.0);
    }

    #[test]
    fn negative_lr_is_rejected() {
        let cfg = ScaledAdamConfig::default().with_lr(-1.0);
        assert!(matches!(ScaledAdam::new(vec![], cfg), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn negative_beta_only_matters_with_bias_correction() {
        let cfg = ScaledAdamConfig::default().with_betas(-0.1, 0.999);
        assert!(ScaledAdam::new(vec![], cfg).is_err());
        assert!(ScaledAdam::new(vec![], cfg.with_bias_correction(false)).is_ok());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let p = param(&[1.0]);
        let mut opt = ScaledAdam::new(vec![p.clone()], ScaledAdamConfig::default()).unwrap();
        assert!(opt.add_param_group(vec![p], ParamGroup::default()).is_err());
        assert_eq!(opt.param_count(), 1);
    }

    #[test]
    fn frozen_group_is_not_updated() {
        let p = param(&[1.0, 2.0]);
        let mut opt = ScaledAdam::new(vec![], ScaledAdamConfig::default().with_lr(0.1)).unwrap();
        let handles = opt.add_param_group(vec![p.clone()], ParamGroup::default().frozen()).unwrap();
        p.set_grad(arr1(&[1.0, 1.0]).into_dyn());
        opt.step(None).unwrap();
        assert_eq!(p.data(), arr1(&[1.0, 2.0]).into_dyn());
        assert!(opt.state(handles[0]).is_none());
    }

    #[test]
    fn group_lr_override_applies() {
        let slow = param(&[0.0]);
        let fast = param(&[0.0]);
        let cfg = ScaledAdamConfig::default().with_lr(0.01).with_scaling(false);
        let mut opt = ScaledAdam::new(vec![slow.clone()], cfg).unwrap();
        opt.add_param_group(vec![fast.clone()], ParamGroup::default().with_lr(0.1))
            .unwrap();
        slow.set_grad(arr1(&[1.0]).into_dyn());
        fast.set_grad(arr1(&[1.0]).into_dyn());
        opt.step(None).unwrap();
        // first bias-corrected step moves by about lr
        assert!((slow.data()[[0]] + 0.01).abs() < 1e-4);
        assert!((fast.data()[[0]] + 0.1).abs() < 1e-3);
    }

    #[test]
    fn closure_loss_is_returned() {
        let mut opt = ScaledAdam::new(vec![], ScaledAdamConfig::default()).unwrap();
        let mut calls = 0;
        let mut closure = || {
            calls += 1;
            2.5f32
        };
        assert_eq!(opt.step(Some(&mut closure)).unwrap(), Some(2.5));
        assert_eq!(opt.step(None).unwrap(), None);
        assert_eq!(calls, 1);
    }

    #[test]
    fn set_lr_validates() {
        let mut opt = ScaledAdam::new(vec![], ScaledAdamConfig::default()).unwrap();
        assert!(opt.set_lr(f32::NAN).is_err());
        assert_eq!(opt.lr(), 1e-5);
        opt.set_lr(0.5).unwrap();
        assert_eq!(opt.lr(), 0.5);
    }

    #[test]
    fn zero_grad_clears_every_gradient() {
        let a = param(&[1.0]);
        let b = Parameter::new("b", ArrayD::zeros(IxDyn(&[2, 2])));
        let mut opt = ScaledAdam::new(vec![a.clone(), b.clone()], ScaledAdamConfig::default()).unwrap();
        a.set_grad(arr1(&[1.0]).into_dyn());
        b.set_grad(ArrayD::ones(IxDyn(&[2, 2])));
        opt.zero_grad();
        assert!(a.grad().is_none() && b.grad().is_none());
    }
}
