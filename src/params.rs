//! # Parameter Snapshots and Differentiable Gradients
//!
//! A [`ParamSnapshot`] is an immutable name → tensor map. Training a student
//! never mutates a snapshot; every update builds a new one whose tensors keep
//! their link to the ops that produced them, so a loss evaluated on the last
//! snapshot can be differentiated through the whole chain.
//!
//! candle only tracks gradients of *variables*, and detaches every gradient
//! it produces. Two things make gradients of intermediate tensors usable as
//! differentiable values:
//!
//! - [`enable_higher_order_grads`] sets `CANDLE_GRAD_DO_NOT_DETACH` so the
//!   backward pass records its own graph.
//! - [`probe`] adds a zero-valued [`Var`] to each tensor of a snapshot. The
//!   gradient of a loss w.r.t. the probe equals the gradient w.r.t. the
//!   tensor it was added to.

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Shape, Tensor, Var};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal, Uniform};
use std::collections::BTreeMap;
use std::sync::Once;

use crate::error::GtnError;
use crate::GtnResult;

const GRAD_DO_NOT_DETACH: &str = "CANDLE_GRAD_DO_NOT_DETACH";

static HIGHER_ORDER: Once = Once::new();

/// Keep the backward graph of every gradient candle computes.
///
/// candle reads the flag once per thread on its first backward pass, so this
/// has to run before any `backward()` on the calling thread.
pub fn enable_higher_order_grads() {
    HIGHER_ORDER.call_once(|| {
        std::env::set_var(GRAD_DO_NOT_DETACH, "1");
        log::debug!("candle higher-order gradients enabled");
    });
}

// ═══════════════════════════════════════════════════════════════════════════
// SNAPSHOTS
// ═══════════════════════════════════════════════════════════════════════════

/// Immutable set of named parameter tensors
#[derive(Debug, Clone, Default)]
pub struct ParamSnapshot {
    tensors: BTreeMap<String, Tensor>,
}

impl ParamSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.tensors.insert(name.into(), tensor);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> GtnResult<&Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| GtnError::MissingParameter(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Apply `f` to every tensor, producing a new snapshot
    pub fn map<F>(&self, mut f: F) -> GtnResult<Self>
    where
        F: FnMut(&str, &Tensor) -> GtnResult<Tensor>,
    {
        let mut tensors = BTreeMap::new();
        for (name, tensor) in &self.tensors {
            tensors.insert(name.clone(), f(name, tensor)?);
        }
        Ok(Self { tensors })
    }

    /// Combine with another snapshot holding the same names
    pub fn zip_map<F>(&self, other: &ParamSnapshot, mut f: F) -> GtnResult<Self>
    where
        F: FnMut(&Tensor, &Tensor) -> GtnResult<Tensor>,
    {
        if self.len() != other.len() {
            return Err(GtnError::DimensionMismatch {
                expected: self.len(),
                got: other.len(),
            });
        }
        self.map(|name, tensor| f(tensor, other.get(name)?))
    }

    pub fn zeros_like(&self) -> GtnResult<Self> {
        self.map(|_, t| Ok(t.zeros_like()?))
    }

    /// Copy with every tensor cut from its history
    pub fn detach(&self) -> Self {
        let tensors = self
            .tensors
            .iter()
            .map(|(k, v)| (k.clone(), v.detach()))
            .collect();
        Self { tensors }
    }

    /// Largest absolute element-wise difference to `other`
    pub fn max_abs_diff(&self, other: &ParamSnapshot) -> GtnResult<f32> {
        let mut max = 0.0f32;
        for (name, tensor) in &self.tensors {
            let diff: f32 = (tensor - other.get(name)?)?
                .abs()?
                .flatten_all()?
                .max(0)?
                .to_scalar()?;
            max = max.max(diff);
        }
        Ok(max)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PROBES
// ═══════════════════════════════════════════════════════════════════════════

/// Zero-valued variables attached to a snapshot to read its gradients
#[derive(Debug)]
pub struct Probe {
    vars: Vec<(String, Var)>,
}

impl Probe {
    /// Differentiable gradient of the backward pass that produced `grads`
    /// w.r.t. each probed tensor. Tensors the loss never touched get zeros.
    pub fn gradients(&self, grads: &GradStore) -> GtnResult<ParamSnapshot> {
        let mut out = ParamSnapshot::new();
        for (name, var) in &self.vars {
            let grad = match grads.get(var.as_tensor()) {
                Some(g) => g.clone(),
                None => var.as_tensor().zeros_like()?.detach(),
            };
            out.insert(name.clone(), grad);
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Attach a fresh probe to every tensor of `snapshot`
pub fn probe(snapshot: &ParamSnapshot) -> GtnResult<(ParamSnapshot, Probe)> {
    let mut probed = ParamSnapshot::new();
    let mut vars = Vec::with_capacity(snapshot.len());
    for (name, tensor) in snapshot.iter() {
        let var = Var::zeros(tensor.shape(), tensor.dtype(), tensor.device())?;
        probed.insert(name, (tensor + var.as_tensor())?);
        vars.push((name.to_string(), var));
    }
    Ok((probed, Probe { vars }))
}

/// Evaluate `loss_fn` on `snapshot` and return the loss together with its
/// gradient w.r.t. every tensor of the snapshot. The gradient stays attached
/// to the graph so it can itself be differentiated.
pub fn differentiable_grad<F>(snapshot: &ParamSnapshot, loss_fn: F) -> GtnResult<(Tensor, ParamSnapshot)>
where
    F: FnOnce(&ParamSnapshot) -> GtnResult<Tensor>,
{
    enable_higher_order_grads();
    let (probed, probe) = probe(snapshot)?;
    let loss = loss_fn(&probed)?;
    let grads = loss.backward()?;
    let gradients = probe.gradients(&grads)?;
    Ok((loss, gradients))
}

// ═══════════════════════════════════════════════════════════════════════════
// SEEDED INITIALISATION
// ═══════════════════════════════════════════════════════════════════════════

/// Tensor with entries uniform in `[-bound, bound)`
pub fn uniform_tensor<S: Into<Shape>>(
    rng: &mut StdRng,
    shape: S,
    bound: f64,
    device: &Device,
) -> GtnResult<Tensor> {
    let shape = shape.into();
    let bound = bound as f32;
    let data: Vec<f32> = if bound > 0.0 {
        let dist = Uniform::new(-bound, bound);
        (0..shape.elem_count()).map(|_| dist.sample(rng)).collect()
    } else {
        vec![0.0; shape.elem_count()]
    };
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Tensor with entries drawn from `N(0, std^2)`
pub fn normal_tensor<S: Into<Shape>>(
    rng: &mut StdRng,
    shape: S,
    std: f64,
    device: &Device,
) -> GtnResult<Tensor> {
    let shape = shape.into();
    let dist = Normal::new(0.0f32, std as f32)
        .map_err(|e| GtnError::InvalidConfig(format!("normal distribution: {}", e)))?;
    let data: Vec<f32> = (0..shape.elem_count()).map(|_| dist.sample(rng)).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Default layer init: uniform with bound `1/sqrt(fan_in)`
pub fn fan_in_uniform<S: Into<Shape>>(
    rng: &mut StdRng,
    shape: S,
    fan_in: usize,
    device: &Device,
) -> GtnResult<Tensor> {
    let bound = 1.0 / (fan_in.max(1) as f64).sqrt();
    uniform_tensor(rng, shape, bound, device)
}

/// Constant-filled f32 tensor
pub fn constant_tensor<S: Into<Shape>>(shape: S, value: f64, device: &Device) -> GtnResult<Tensor> {
    Ok(Tensor::ones(shape, DType::F32, device)?.affine(value, 0.0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_probe_gradient_matches_analytic() {
        let device = Device::Cpu;
        let x = Tensor::new(&[1.0f32, -2.0, 3.0], &device).unwrap();
        let snapshot = ParamSnapshot::new().with("x", x);

        // d/dx sum(x^2) = 2x
        let (loss, grads) =
            differentiable_grad(&snapshot, |p| Ok(p.get("x")?.sqr()?.sum_all()?)).unwrap();
        let loss: f32 = loss.to_scalar().unwrap();
        assert!((loss - 14.0).abs() < 1e-5);

        let g: Vec<f32> = grads.get("x").unwrap().to_vec1().unwrap();
        assert_eq!(g, vec![2.0, -4.0, 6.0]);
    }

    #[test]
    fn test_gradient_is_differentiable() {
        let device = Device::Cpu;
        // a is a trainable leaf; x depends on a; g = d/dx sum(x^3) = 3x^2
        let a = Var::new(&[2.0f32], &device).unwrap();
        let x = (a.as_tensor() * 1.5).unwrap();
        let snapshot = ParamSnapshot::new().with("x", x);

        let (_, grads) = differentiable_grad(&snapshot, |p| {
            let x = p.get("x")?;
            Ok((x.sqr()? * x)?.sum_all()?)
        })
        .unwrap();

        // d/da 3 (1.5 a)^2 = 3 * 2 * 1.5^2 * a = 27 at a = 2
        let outer = grads.get("x").unwrap().sum_all().unwrap().backward().unwrap();
        let da: Vec<f32> = outer.get(a.as_tensor()).unwrap().to_vec1().unwrap();
        assert!((da[0] - 27.0).abs() < 1e-3, "got {}", da[0]);
    }

    #[test]
    fn test_unused_parameter_gets_zero_gradient() {
        let device = Device::Cpu;
        let snapshot = ParamSnapshot::new()
            .with("used", Tensor::new(&[1.0f32, 2.0], &device).unwrap())
            .with("unused", Tensor::new(&[5.0f32], &device).unwrap());
        let (_, grads) =
            differentiable_grad(&snapshot, |p| Ok(p.get("used")?.sum_all()?)).unwrap();
        let unused: Vec<f32> = grads.get("unused").unwrap().to_vec1().unwrap();
        assert_eq!(unused, vec![0.0]);
    }

    #[test]
    fn test_missing_parameter_error() {
        let snapshot = ParamSnapshot::new();
        assert!(matches!(
            snapshot.get("nope"),
            Err(GtnError::MissingParameter(_))
        ));
    }

    #[test]
    fn test_seeded_init_is_reproducible() {
        let device = Device::Cpu;
        let a = fan_in_uniform(&mut StdRng::seed_from_u64(3), (4, 5), 5, &device).unwrap();
        let b = fan_in_uniform(&mut StdRng::seed_from_u64(3), (4, 5), 5, &device).unwrap();
        let snap_a = ParamSnapshot::new().with("w", a);
        let snap_b = ParamSnapshot::new().with("w", b);
        assert_eq!(snap_a.max_abs_diff(&snap_b).unwrap(), 0.0);

        let bound = 1.0 / 5f32.sqrt();
        let values: Vec<f32> = snap_a.get("w").unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| v.abs() <= bound));
    }
}
