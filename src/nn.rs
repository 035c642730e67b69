//! Small candle building blocks shared by the actor-critic network and the
//! PPO update: optimizer construction, orthogonally-initialized linear
//! layers, global gradient-norm clipping, and the categorical action
//! distribution.

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var, D};
use candle_nn::{ops, AdamW, Linear, Optimizer, ParamsAdamW, VarMap};
use rand::thread_rng;
use rand::Rng;
use rand_distr::Distribution;

use crate::error::Result;
use crate::DEVICE;

pub fn adam(vars: Vec<Var>, lr: f64) -> Result<AdamW> {
    Ok(AdamW::new(
        vars,
        ParamsAdamW {
            lr,
            eps: 1e-5,
            weight_decay: 0.0,
            ..Default::default()
        },
    )?)
}

/// Linear layer with an orthogonal weight matrix (scaled by `gain`) and a
/// zero bias, registered in `map` under `{prefix}.weight` / `{prefix}.bias`.
///
/// candle's `Init` set has no orthogonal variant, so the weights are built
/// host-side with Gram-Schmidt and inserted into the var map directly.
pub fn linear(
    map: &VarMap,
    prefix: &str,
    in_dim: usize,
    out_dim: usize,
    gain: f64,
) -> Result<Linear> {
    let data = orthogonal_weights(out_dim, in_dim, gain as f32);
    let weight = Var::from_tensor(&Tensor::from_vec(data, (out_dim, in_dim), &DEVICE)?)?;
    let bias = Var::zeros((out_dim,), DType::F32, &DEVICE)?;

    let weight_t = weight.as_tensor().clone();
    let bias_t = bias.as_tensor().clone();
    {
        let mut data = map.data().lock().unwrap();
        data.insert(format!("{prefix}.weight"), weight);
        data.insert(format!("{prefix}.bias"), bias);
    }
    Ok(Linear::new(weight_t, Some(bias_t)))
}

/// Row-major `[rows, cols]` orthogonal matrix, Gram-Schmidt over whichever
/// dimension is smaller.
fn orthogonal_weights(rows: usize, cols: usize, gain: f32) -> Vec<f32> {
    if rows < cols {
        // Orthonormal rows come from transposing an orthonormal-column matrix.
        let t = gram_schmidt(cols, rows);
        let mut out = vec![0.0f32; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                out[r * cols + c] = gain * t[r][c];
            }
        }
        out
    } else {
        let m = gram_schmidt(rows, cols);
        let mut out = vec![0.0f32; rows * cols];
        for (c, col) in m.iter().enumerate() {
            for (r, v) in col.iter().enumerate() {
                out[r * cols + c] = gain * v;
            }
        }
        out
    }
}

/// `cols` orthonormal column vectors of length `rows` (`rows >= cols`).
fn gram_schmidt(rows: usize, cols: usize) -> Vec<Vec<f32>> {
    let dist = rand_distr::StandardNormal;
    let mut rng = thread_rng();
    let mut columns: Vec<Vec<f32>> = (0..cols)
        .map(|_| {
            (0..rows)
                .map(|_| Distribution::<f32>::sample(&dist, &mut rng))
                .collect()
        })
        .collect();

    for i in 0..cols {
        for j in 0..i {
            let dot: f32 = columns[i]
                .iter()
                .zip(&columns[j])
                .map(|(a, b)| a * b)
                .sum();
            for r in 0..rows {
                columns[i][r] -= dot * columns[j][r];
            }
        }
        let norm: f32 = columns[i].iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 1e-10 {
            for v in columns[i].iter_mut() {
                *v /= norm;
            }
        } else {
            // Degenerate draw; resample the column from scratch.
            let fresh: Vec<f32> = (0..rows)
                .map(|_| Distribution::<f32>::sample(&dist, &mut rng))
                .collect();
            let norm: f32 = fresh.iter().map(|v| v * v).sum::<f32>().sqrt();
            columns[i] = fresh.into_iter().map(|v| v / norm).collect();
        }
    }
    columns
}

/// Rescales every gradient so their global L2 norm does not exceed
/// `max_norm`. Returns the pre-clip norm.
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f32) -> Result<f32> {
    let mut total = 0.0f32;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total += grad.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
    }
    let total_norm = total.sqrt();
    if total_norm > max_norm {
        let scale = (max_norm / (total_norm + 1e-6)) as f64;
        for var in vars {
            let tensor = var.as_tensor();
            let clipped = match grads.get(tensor) {
                Some(grad) => (grad * scale)?,
                None => continue,
            };
            grads.insert(tensor, clipped);
        }
    }
    Ok(total_norm)
}

/// Zero-mean, unit-std rescaling with a small epsilon against degenerate
/// batches.
pub fn normalize(x: &Tensor) -> Result<Tensor> {
    let mean = x.flatten_all()?.mean_all()?;
    let centered = x.broadcast_sub(&mean)?;
    let std = centered.sqr()?.mean_all()?.sqrt()?;
    Ok(centered.broadcast_div(&(std + 1e-8)?)?)
}

/// 1 - Var[target - pred] / Var[target]; NaN when the target variance is
/// zero, matching the explicit "undefined" convention of the diagnostics.
pub fn explained_variance(pred: &[f32], target: &[f32]) -> f32 {
    let var_y = variance(target);
    if var_y == 0.0 {
        return f32::NAN;
    }
    let err: Vec<f32> = target.iter().zip(pred).map(|(t, p)| t - p).collect();
    1.0 - variance(&err) / var_y
}

fn variance(xs: &[f32]) -> f32 {
    let n = xs.len() as f32;
    let mean = xs.iter().sum::<f32>() / n;
    xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n
}

/// Categorical distribution over a discrete action space, parameterized by
/// `[seq, batch, n_actions]` logits.
pub struct Categorical {
    log_probs: Tensor,
}

impl Categorical {
    pub fn new(logits: &Tensor) -> Result<Self> {
        Ok(Self {
            log_probs: ops::log_softmax(logits, D::Minus1)?,
        })
    }

    /// Samples one action index per `[seq, batch]` slot, returned as f32.
    pub fn sample(&self) -> Result<Tensor> {
        let (seq, batch, n_actions) = self.log_probs.dims3()?;
        let probs = self
            .log_probs
            .exp()?
            .reshape((seq * batch, n_actions))?
            .to_vec2::<f32>()?;
        let mut rng = thread_rng();
        let samples: Vec<f32> = probs
            .iter()
            .map(|row| {
                let u: f32 = rng.gen();
                let mut acc = 0.0f32;
                for (i, p) in row.iter().enumerate() {
                    acc += p;
                    if u < acc {
                        return i as f32;
                    }
                }
                (row.len() - 1) as f32
            })
            .collect();
        Ok(Tensor::from_vec(samples, (seq, batch), &DEVICE)?)
    }

    /// Log-probability of the given `[seq, batch]` action indices.
    pub fn log_prob(&self, actions: &Tensor) -> Result<Tensor> {
        let ids = actions.to_dtype(DType::U32)?.unsqueeze(D::Minus1)?;
        Ok(self.log_probs.gather(&ids, D::Minus1)?.squeeze(D::Minus1)?)
    }

    /// Shannon entropy per `[seq, batch]` slot.
    pub fn entropy(&self) -> Result<Tensor> {
        let plogp = (self.log_probs.exp()? * &self.log_probs)?;
        Ok(plogp.sum(D::Minus1)?.neg()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orthogonal_columns_are_orthonormal() {
        let rows = 16;
        let cols = 8;
        let w = orthogonal_weights(rows, cols, 1.0);
        for a in 0..cols {
            for b in 0..cols {
                let dot: f32 = (0..rows).map(|r| w[r * cols + a] * w[r * cols + b]).sum();
                let expected = if a == b { 1.0 } else { 0.0 };
                assert!(
                    (dot - expected).abs() < 1e-4,
                    "columns {a},{b}: dot {dot}"
                );
            }
        }
    }

    #[test]
    fn orthogonal_gain_scales_norms() {
        let w = orthogonal_weights(4, 12, 0.01);
        for r in 0..4 {
            let norm: f32 = (0..12).map(|c| w[r * 12 + c].powi(2)).sum::<f32>().sqrt();
            assert!((norm - 0.01).abs() < 1e-4, "row {r}: norm {norm}");
        }
    }

    #[test]
    fn normalize_produces_zero_mean_unit_std() -> Result<()> {
        let x = Tensor::from_slice(
            &[1.0f32, -3.0, 2.5, 0.25, 8.0, -1.5, 0.0, 4.0],
            (2, 4),
            &DEVICE,
        )?;
        let n = normalize(&x)?.flatten_all()?.to_vec1::<f32>()?;
        let mean = n.iter().sum::<f32>() / n.len() as f32;
        let std =
            (n.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n.len() as f32).sqrt();
        assert!(mean.abs() < 1e-5, "mean {mean}");
        assert!((std - 1.0).abs() < 1e-4, "std {std}");
        Ok(())
    }

    #[test]
    fn explained_variance_is_nan_on_constant_targets() {
        let ev = explained_variance(&[1.0, 2.0, 3.0], &[5.0, 5.0, 5.0]);
        assert!(ev.is_nan());
        let ev = explained_variance(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]);
        assert!((ev - 1.0).abs() < 1e-6);
    }

    #[test]
    fn categorical_log_prob_matches_softmax() -> Result<()> {
        let logits = Tensor::from_slice(&[0.0f32, 0.0, f32::ln(3.0)], (1, 1, 3), &DEVICE)?;
        let dist = Categorical::new(&logits)?;
        let actions = Tensor::from_slice(&[2.0f32], (1, 1), &DEVICE)?;
        let lp = dist.log_prob(&actions)?.flatten_all()?.to_vec1::<f32>()?;
        // softmax = [1/5, 1/5, 3/5]
        assert!((lp[0] - (3.0f32 / 5.0).ln()).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn categorical_entropy_peaks_at_uniform() -> Result<()> {
        let uniform = Categorical::new(&Tensor::zeros((1, 1, 4), DType::F32, &DEVICE)?)?;
        let h = uniform.entropy()?.flatten_all()?.to_vec1::<f32>()?[0];
        assert!((h - 4.0f32.ln()).abs() < 1e-5);

        let skewed = Categorical::new(&Tensor::from_slice(
            &[10.0f32, 0.0, 0.0, 0.0],
            (1, 1, 4),
            &DEVICE,
        )?)?;
        let hs = skewed.entropy()?.flatten_all()?.to_vec1::<f32>()?[0];
        assert!(hs < h);
        Ok(())
    }

    #[test]
    fn sampled_actions_are_in_range() -> Result<()> {
        let logits = Tensor::zeros((3, 5, 7), DType::F32, &DEVICE)?;
        let dist = Categorical::new(&logits)?;
        let actions = dist.sample()?;
        assert_eq!(actions.dims(), &[3, 5]);
        for a in actions.flatten_all()?.to_vec1::<f32>()? {
            assert!(a >= 0.0 && a < 7.0);
        }
        Ok(())
    }
}
