//! # Functional Layers
//!
//! Stateless building blocks used by both networks. Every function takes its
//! weights as arguments, so the same op can run on a teacher variable or on
//! any student snapshot produced by the unrolled inner loop.
//!
//! Only ops whose backward pass is itself differentiable in candle are used
//! (matmul, narrow/cat, broadcast, reductions, unary maths). Convolution is
//! therefore written as patch extraction followed by a matmul rather than
//! through `Tensor::conv2d`.

use candle_core::{DType, Device, Tensor, D};

use crate::error::GtnError;
use crate::GtnResult;

/// Leaky ReLU: `x` for `x >= 0`, `slope * x` otherwise
pub fn leaky_relu(x: &Tensor, slope: f64) -> GtnResult<Tensor> {
    let pos = x.relu()?;
    let neg = x.neg()?.relu()?;
    Ok((pos - neg.affine(slope, 0.0)?)?)
}

/// Fully connected layer with weight `(out, in)` and bias `(out)`
pub fn linear(x: &Tensor, weight: &Tensor, bias: &Tensor) -> GtnResult<Tensor> {
    Ok(x.matmul(&weight.t()?)?.broadcast_add(bias)?)
}

/// Square convolution with stride 1 and "same" zero padding.
///
/// `x` is `(B, C, H, W)`, `weight` is `(O, C, k, k)` with odd `k`, `bias` is `(O)`.
pub fn conv2d_same(x: &Tensor, weight: &Tensor, bias: &Tensor) -> GtnResult<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    let (out, c_w, k, k2) = weight.dims4()?;
    if c != c_w {
        return Err(GtnError::DimensionMismatch {
            expected: c_w,
            got: c,
        });
    }
    if k != k2 || k % 2 == 0 {
        return Err(GtnError::InvalidConfig(format!(
            "conv2d_same needs a square odd kernel, got {}x{}",
            k, k2
        )));
    }
    let pad = k / 2;
    let padded = x.pad_with_zeros(2, pad, pad)?.pad_with_zeros(3, pad, pad)?;

    let mut patches = Vec::with_capacity(k * k);
    for ky in 0..k {
        for kx in 0..k {
            patches.push(padded.narrow(2, ky, h)?.narrow(3, kx, w)?);
        }
    }
    // (B, C, k*k, H, W) -> (C*k*k, B*H*W)
    let cols = Tensor::stack(&patches, 2)?
        .reshape((b, c * k * k, h * w))?
        .transpose(0, 1)?
        .reshape((c * k * k, b * h * w))?;
    let kernel = weight.reshape((out, c * k * k))?;

    let y = kernel
        .matmul(&cols)?
        .reshape((out, b, h, w))?
        .transpose(0, 1)?
        .broadcast_add(&bias.reshape((1, out, 1, 1))?)?;
    Ok(y)
}

/// 2x2 max pooling with stride 2; odd trailing rows/columns are dropped
pub fn max_pool2x2(x: &Tensor) -> GtnResult<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    let (h2, w2) = (h / 2, w / 2);
    if h2 == 0 || w2 == 0 {
        return Err(GtnError::InvalidConfig(format!(
            "cannot pool a {}x{} feature map",
            h, w
        )));
    }
    let x = if h % 2 == 1 || w % 2 == 1 {
        x.narrow(2, 0, h2 * 2)?.narrow(3, 0, w2 * 2)?
    } else {
        x.clone()
    };
    Ok(x.reshape((b, c, h2, 2, w2, 2))?.max(5)?.max(3)?)
}

/// Nearest-neighbour 2x upsampling
pub fn upsample2x(x: &Tensor) -> GtnResult<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    Ok(x
        .reshape((b, c, h, 1, w, 1))?
        .broadcast_as((b, c, h, 2, w, 2))?
        .reshape((b, c, h * 2, w * 2))?)
}

/// Batch normalisation with batch statistics.
///
/// Works on `(B, F)` (per feature) and `(B, C, H, W)` (per channel) inputs.
pub fn batch_norm(x: &Tensor, gamma: &Tensor, beta: &Tensor, eps: f64) -> GtnResult<Tensor> {
    let (normed, features) = match x.rank() {
        2 => {
            let mean = x.mean_keepdim(0)?;
            let centered = x.broadcast_sub(&mean)?;
            let var = centered.sqr()?.mean_keepdim(0)?;
            (centered.broadcast_div(&(var + eps)?.sqrt()?)?, x.dim(1)?)
        }
        4 => {
            let mean = x.mean_keepdim((0, 2, 3))?;
            let centered = x.broadcast_sub(&mean)?;
            let var = centered.sqr()?.mean_keepdim((0, 2, 3))?;
            (centered.broadcast_div(&(var + eps)?.sqrt()?)?, x.dim(1)?)
        }
        rank => {
            return Err(GtnError::InvalidConfig(format!(
                "batch_norm expects rank 2 or 4, got {}",
                rank
            )))
        }
    };
    let shape: Vec<usize> = if x.rank() == 2 {
        vec![1, features]
    } else {
        vec![1, features, 1, 1]
    };
    Ok(normed
        .broadcast_mul(&gamma.reshape(shape.as_slice())?)?
        .broadcast_add(&beta.reshape(shape.as_slice())?)?)
}

/// Numerically stable log-softmax over the last dimension
pub fn log_softmax(logits: &Tensor) -> GtnResult<Tensor> {
    let max = logits.max_keepdim(D::Minus1)?.detach();
    let shifted = logits.broadcast_sub(&max)?;
    let log_sum = shifted.exp()?.sum_keepdim(D::Minus1)?.log()?;
    Ok(shifted.broadcast_sub(&log_sum)?)
}

/// Mean cross-entropy of `(B, K)` logits against `(B, K)` one-hot targets
pub fn cross_entropy_one_hot(logits: &Tensor, one_hot: &Tensor) -> GtnResult<Tensor> {
    let log_probs = log_softmax(logits)?;
    Ok((log_probs * one_hot)?.sum(D::Minus1)?.mean_all()?.neg()?)
}

/// One-hot f32 matrix for class indices
pub fn one_hot(labels: &[u32], num_classes: usize, device: &Device) -> GtnResult<Tensor> {
    let mut data = vec![0.0f32; labels.len() * num_classes];
    for (row, &label) in labels.iter().enumerate() {
        let label = label as usize;
        if label >= num_classes {
            return Err(GtnError::DimensionMismatch {
                expected: num_classes,
                got: label,
            });
        }
        data[row * num_classes + label] = 1.0;
    }
    Ok(Tensor::from_vec(data, (labels.len(), num_classes), device)?)
}

/// One-hot from a `u32` label tensor
pub fn one_hot_tensor(labels: &Tensor, num_classes: usize) -> GtnResult<Tensor> {
    let device = labels.device().clone();
    let labels: Vec<u32> = labels.to_dtype(DType::U32)?.to_vec1()?;
    one_hot(&labels, num_classes, &device)
}

/// Number of rows whose arg-max matches the label
pub fn correct_predictions(logits: &Tensor, labels: &Tensor) -> GtnResult<usize> {
    let predicted = logits.argmax(D::Minus1)?;
    let labels = labels.to_dtype(DType::U32)?;
    let correct: f32 = predicted
        .eq(&labels)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar()?;
    Ok(correct.round() as usize)
}
