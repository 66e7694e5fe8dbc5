//! # Unrolled Inner Loop
//!
//! Trains a student on teacher-made batches with momentum SGD, written as a
//! pure transformation `(params, state, batch) → (params, state)`:
//!
//! ```text
//! v' = m · v + g
//! θ' = θ − lr · v'
//! ```
//!
//! `g` is the gradient of the synthetic-batch loss w.r.t. `θ`, obtained with
//! [`differentiable_grad`] so it stays linked to the teacher. The caller keeps
//! every snapshot, and a loss on the last one can be back-propagated through
//! all K steps into the teacher, the curriculum, `lr` and `m`.

use candle_core::Tensor;

use crate::error::GtnError;
use crate::params::{differentiable_grad, ParamSnapshot};
use crate::student::Student;
use crate::GtnResult;

/// Learning rate and momentum, each a `(1)` tensor
#[derive(Debug, Clone)]
pub struct InnerHyper {
    pub lr: Tensor,
    pub momentum: Tensor,
}

impl InnerHyper {
    pub fn new(lr: Tensor, momentum: Tensor) -> Self {
        Self { lr, momentum }
    }

    /// Same values, cut from the teacher's graph
    pub fn detach(&self) -> Self {
        Self {
            lr: self.lr.detach(),
            momentum: self.momentum.detach(),
        }
    }
}

/// Momentum buffers, one per student tensor
#[derive(Debug, Clone)]
pub struct MomentumState {
    pub velocity: ParamSnapshot,
}

impl MomentumState {
    /// Zero velocity shaped like `params`
    pub fn zeros(params: &ParamSnapshot) -> GtnResult<Self> {
        Ok(Self {
            velocity: params.detach().zeros_like()?,
        })
    }

    pub fn detach(&self) -> Self {
        Self {
            velocity: self.velocity.detach(),
        }
    }
}

/// One synthetic training batch
#[derive(Debug, Clone)]
pub struct SyntheticBatch {
    /// `(B, 1, H, W)`
    pub images: Tensor,
    /// `(B, num_classes)`
    pub one_hot: Tensor,
}

/// Whether the unroll keeps the history back to the teacher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnrollMode {
    /// Every snapshot stays linked to the teacher (meta-training)
    Differentiable,
    /// Snapshots are detached after each step (evaluation, search)
    Detached,
}

/// Result of an unrolled inner loop
#[derive(Debug, Clone)]
pub struct Trajectory {
    /// Initial snapshot followed by one snapshot per step
    pub snapshots: Vec<ParamSnapshot>,
    /// Synthetic-batch loss at every step
    pub losses: Vec<f32>,
    pub state: MomentumState,
}

impl Trajectory {
    /// Parameters after the last step
    pub fn final_params(&self) -> GtnResult<&ParamSnapshot> {
        self.snapshots
            .last()
            .ok_or_else(|| GtnError::ComputationError("empty trajectory".to_string()))
    }

    /// Mean of the first quarter of losses minus mean of the last quarter
    pub fn loss_drop(&self) -> Option<f32> {
        let n = self.losses.len();
        if n < 4 {
            return None;
        }
        let q = n / 4;
        let mean = |xs: &[f32]| xs.iter().sum::<f32>() / xs.len() as f32;
        Some(mean(&self.losses[..q]) - mean(&self.losses[n - q..]))
    }
}

/// `v' = m · v + g`, `θ' = θ − lr · v'`
pub fn sgd_momentum_step(
    params: &ParamSnapshot,
    grads: &ParamSnapshot,
    state: &MomentumState,
    hyper: &InnerHyper,
) -> GtnResult<(ParamSnapshot, MomentumState)> {
    let velocity = state.velocity.zip_map(grads, |v, g| {
        Ok((v.broadcast_mul(&hyper.momentum)? + g)?)
    })?;
    let params = params.zip_map(&velocity, |p, v| Ok((p - v.broadcast_mul(&hyper.lr)?)?))?;
    Ok((params, MomentumState { velocity }))
}

/// Train `student` for one step on `batch`, returning the new snapshot,
/// the new optimiser state and the loss before the update.
pub fn inner_step(
    student: &Student,
    params: &ParamSnapshot,
    state: &MomentumState,
    batch: &SyntheticBatch,
    hyper: &InnerHyper,
) -> GtnResult<(ParamSnapshot, MomentumState, f32)> {
    let (loss, grads) = differentiable_grad(params, |p| {
        student.loss(p, &batch.images, &batch.one_hot)
    })?;
    let loss_value: f32 = loss.to_scalar()?;
    let (params, state) = sgd_momentum_step(params, &grads, state, hyper)?;
    Ok((params, state, loss_value))
}

/// Run `steps` inner steps from `init`, drawing batch `t` from `batch_fn(t)`.
///
/// Zero steps returns the initial snapshot unchanged.
pub fn unroll<F>(
    student: &Student,
    init: ParamSnapshot,
    hyper: &InnerHyper,
    steps: usize,
    mode: UnrollMode,
    mut batch_fn: F,
) -> GtnResult<Trajectory>
where
    F: FnMut(usize) -> GtnResult<SyntheticBatch>,
{
    let hyper = match mode {
        UnrollMode::Differentiable => hyper.clone(),
        UnrollMode::Detached => hyper.detach(),
    };
    let mut state = MomentumState::zeros(&init)?;
    let mut snapshots = Vec::with_capacity(steps + 1);
    let mut losses = Vec::with_capacity(steps);
    let mut params = init;

    for step in 0..steps {
        let mut batch = batch_fn(step)?;
        if mode == UnrollMode::Detached {
            batch = SyntheticBatch {
                images: batch.images.detach(),
                one_hot: batch.one_hot.detach(),
            };
        }
        let (next, next_state, loss) = inner_step(student, &params, &state, &batch, &hyper)?;
        if !loss.is_finite() {
            return Err(GtnError::divergence("inner loss", step, loss as f64));
        }
        log::trace!("inner step {}: loss {:.4}", step, loss);
        losses.push(loss);
        snapshots.push(params);
        (params, state) = match mode {
            UnrollMode::Differentiable => (next, next_state),
            UnrollMode::Detached => (next.detach(), next_state.detach()),
        };
    }
    snapshots.push(params);

    Ok(Trajectory {
        snapshots,
        losses,
        state,
    })
}
