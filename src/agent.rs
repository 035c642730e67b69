//! One learning agent: network + optimizer + rollout memory.

use std::path::{Path, PathBuf};

use candle_core::Tensor;
use candle_nn::{Optimizer, VarMap};
use kdam::{tqdm, BarExt};
use tracing::{debug, warn};

use crate::buffer::{RolloutBuffer, StepBatch};
use crate::config::PpoConfig;
use crate::error::{Error, Result};
use crate::net::{ActorCritic, HiddenStates};
use crate::nn;
use crate::{TbWriter, DEVICE};

/// Scalar diagnostics from the most recent learning pass, one set per agent.
#[derive(Debug, Clone, Default)]
pub struct PpoStatus {
    pub policy_loss: f32,
    pub value_loss: f32,
    pub entropy: f32,
    pub approx_kl: f32,
    pub clip_frac: f32,
    pub explained_var: f32,
}

impl PpoStatus {
    pub fn log(&self, agent: usize, writer: &mut TbWriter, step: usize) {
        writer.add_scalar(format!("losses/value_loss_agent_{agent}"), self.value_loss, step);
        writer.add_scalar(
            format!("losses/policy_loss_agent_{agent}"),
            self.policy_loss,
            step,
        );
        writer.add_scalar(format!("losses/entropy_agent_{agent}"), self.entropy, step);
        writer.add_scalar(format!("losses/approx_kl_agent_{agent}"), self.approx_kl, step);
        writer.add_scalar(format!("losses/clipfrac_agent_{agent}"), self.clip_frac, step);
        writer.add_scalar(
            format!("losses/explained_variance_agent_{agent}"),
            self.explained_var,
            step,
        );
    }
}

/// Action-selection output for one step across all parallel environments.
pub struct ChosenActions {
    pub log_probs: Vec<f32>,
    pub actions: Vec<f32>,
    pub values: Vec<f32>,
}

pub struct PpoAgent {
    index: usize,
    cfg: PpoConfig,
    pub(crate) net: ActorCritic,
    varmap: VarMap,
    optim: candle_nn::AdamW,
    pub(crate) buffer: RolloutBuffer,
    hidden: HiddenStates,
    hidden_batch: usize,
    status: PpoStatus,
    updates: usize,
}

impl PpoAgent {
    pub fn new(cfg: &PpoConfig, index: usize) -> Result<Self> {
        cfg.validate()?;
        let varmap = VarMap::new();
        let net = ActorCritic::new(cfg, &varmap)?;
        let optim = nn::adam(varmap.all_vars(), cfg.learning_rate)?;
        let buffer = RolloutBuffer::new(
            cfg.episode_len,
            cfg.num_envs,
            cfg.obs_dim,
            cfg.critic_obs_dim(),
        );
        let hidden = net.init_hidden(cfg.num_envs)?;
        Ok(Self {
            index,
            cfg: cfg.clone(),
            net,
            varmap,
            optim,
            buffer,
            hidden,
            hidden_batch: cfg.num_envs,
            status: PpoStatus::default(),
            updates: 0,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn status(&self) -> &PpoStatus {
        &self.status
    }

    /// Number of completed learning passes.
    pub fn updates(&self) -> usize {
        self.updates
    }

    pub fn buffer(&self) -> &RolloutBuffer {
        &self.buffer
    }

    /// Re-zeroes the recurrent state for a new episode of `batch` parallel
    /// environments.
    pub fn init_hidden(&mut self, batch: usize) -> Result<()> {
        self.hidden = self.net.init_hidden(batch)?;
        self.hidden_batch = batch;
        Ok(())
    }

    /// Gradient-free forward pass over one time step. `obs` is
    /// `[num_envs, obs_dim]`, `critic_obs` is `[num_envs, obs_dim * n_agents]`.
    pub fn choose_action(&mut self, obs: &Tensor, critic_obs: &Tensor) -> Result<ChosenActions> {
        let e = self.cfg.num_envs;
        let obs = obs.reshape((1, e, self.cfg.obs_dim))?;
        let critic_obs = critic_obs.reshape((1, e, self.cfg.critic_obs_dim()))?;

        let (action, log_prob, _entropy, value) =
            self.net
                .get_action_and_value(&obs, &critic_obs, &mut self.hidden, None)?;

        Ok(ChosenActions {
            log_probs: log_prob.detach().squeeze(0)?.to_vec1()?,
            actions: action.detach().squeeze(0)?.to_vec1()?,
            values: value.detach().reshape((e,))?.to_vec1()?,
        })
    }

    /// Sampling actor-only pass for a single environment, used when showing
    /// off a trained policy. `obs` is `[1, obs_dim]`.
    ///
    /// Requires a single-environment hidden state, so the first call of an
    /// episode must be preceded by `init_hidden(1)`; the rollout-sized state
    /// left over from construction or training does not fit a batch of one.
    pub fn evaluate_action(&mut self, obs: &Tensor) -> Result<u32> {
        if self.hidden_batch != 1 {
            return Err(Error::Protocol(
                "evaluate_action called without init_hidden(1)",
            ));
        }
        let obs = obs.reshape((1, 1, self.cfg.obs_dim))?;
        let (action, _dist) = self.net.get_action(&obs, &mut self.hidden)?;
        Ok(action.reshape(())?.to_scalar::<f32>()? as u32)
    }

    /// Forwards one full trajectory step into the rollout buffer.
    pub fn remember(&mut self, step: StepBatch) -> Result<()> {
        self.buffer.store(step)
    }

    /// One PPO learning pass over the filled buffer: advantages, then
    /// `update_epochs` full-sequence replays with clipped-surrogate policy
    /// loss, (optionally clipped) value loss, entropy bonus, gradient-norm
    /// clipping, and an Adam step. Clears the buffer afterwards.
    pub fn learn(&mut self, global_step: usize, writer: &mut TbWriter) -> Result<()> {
        let t_max = self.cfg.episode_len;
        let e = self.cfg.num_envs;

        // GAE runs per environment column; the buffer arenas are [T, E].
        let mut advantages = vec![0.0f32; t_max * e];
        let mut returns = vec![0.0f32; t_max * e];
        for env in 0..e {
            let rewards = RolloutBuffer::column(self.buffer.rewards(), e, env);
            let values = RolloutBuffer::column(self.buffer.values(), e, env);
            let dones = RolloutBuffer::column(self.buffer.dones(), e, env);
            let (adv, ret) = if self.cfg.use_gae {
                crate::gae::gae_advantages(
                    &rewards,
                    &values,
                    &dones,
                    self.cfg.gamma,
                    self.cfg.gae_lambda,
                )
            } else {
                crate::gae::discounted_returns(&rewards, &values, &dones, self.cfg.gamma)
            };
            for t in 0..t_max {
                advantages[t * e + env] = adv[t];
                returns[t * e + env] = ret[t];
            }
        }

        let data = self.buffer.create_training_data(&advantages, &returns)?;
        let adv = if self.cfg.norm_adv {
            nn::normalize(&data.advantages)?
        } else {
            data.advantages.clone()
        };

        let mut total_pg_loss = 0.0f32;
        let mut total_v_loss = 0.0f32;
        let mut clip_fracs = Vec::with_capacity(self.cfg.update_epochs);
        let mut last_entropy = 0.0f32;
        let mut last_kl = 0.0f32;

        let mut bar = tqdm!(
            total = self.cfg.update_epochs,
            desc = format!("Agent {} update {}", self.index, self.updates)
        );
        for _epoch in 0..self.cfg.update_epochs {
            // the stored sequence started the episode at a zero hidden state,
            // so the replay does too
            let mut hidden = self.net.init_hidden(e)?;
            let (_, new_log_prob, entropy, new_value) = self.net.get_action_and_value(
                &data.obs,
                &data.critic_obs,
                &mut hidden,
                Some(&data.actions),
            )?;
            let new_value = new_value.squeeze(2)?;

            let log_ratio = (&new_log_prob - &data.log_probs)?;
            let ratio = log_ratio.exp()?;

            // diagnostics on the host, outside the autodiff graph
            {
                let r = ratio.flatten_all()?.to_vec1::<f32>()?;
                let lr = log_ratio.flatten_all()?.to_vec1::<f32>()?;
                let n = r.len() as f32;
                last_kl = r
                    .iter()
                    .zip(&lr)
                    .map(|(r, lr)| (r - 1.0) - lr)
                    .sum::<f32>()
                    / n;
                clip_fracs.push(
                    r.iter()
                        .filter(|r| (**r - 1.0).abs() > self.cfg.clip_coef)
                        .count() as f32
                        / n,
                );
            }

            let pg_loss1 = (&ratio * &adv)?.neg()?;
            let clipped =
                ratio.clamp(1.0 - self.cfg.clip_coef, 1.0 + self.cfg.clip_coef)?;
            let pg_loss2 = (&clipped * &adv)?.neg()?;
            let pg_loss = pg_loss1.maximum(&pg_loss2)?.mean_all()?;

            let v_loss = if self.cfg.clip_vloss {
                let unclipped = (&new_value - &data.returns)?.sqr()?;
                let delta = (&new_value - &data.values)?.clamp(
                    -self.cfg.clip_coef,
                    self.cfg.clip_coef,
                )?;
                let clipped_value = (&data.values + delta)?;
                let clipped_err = (clipped_value - &data.returns)?.sqr()?;
                (unclipped.maximum(&clipped_err)?.mean_all()? * 0.5)?
            } else {
                ((&new_value - &data.returns)?.sqr()?.mean_all()? * 0.5)?
            };

            let entropy_loss = entropy.mean_all()?;

            let pl = pg_loss.to_scalar::<f32>()?;
            let vl = v_loss.to_scalar::<f32>()?;
            last_entropy = entropy_loss.to_scalar::<f32>()?;
            for (what, value) in [("policy loss", pl), ("value loss", vl), ("approx kl", last_kl)]
            {
                if !value.is_finite() {
                    return Err(Error::NonFinite {
                        what,
                        update: self.updates,
                        value,
                    });
                }
            }
            total_pg_loss += pl;
            total_v_loss += vl;

            let loss = ((pg_loss - (entropy_loss * self.cfg.ent_coef as f64)?)?
                + (v_loss * self.cfg.vf_coef as f64)?)?;
            let mut grads = loss.backward()?;
            let grad_norm =
                nn::clip_grad_norm(&self.varmap.all_vars(), &mut grads, self.cfg.max_grad_norm)?;
            self.optim.step(&grads)?;

            debug!(
                agent = self.index,
                pg_loss = pl,
                v_loss = vl,
                kl = last_kl,
                grad_norm,
                "ppo epoch"
            );
            bar.set_postfix(format!("pl={pl:.4} vl={vl:.4} kl={last_kl:.4}"));
            bar.update(1).ok();
        }

        let pred = data.values.flatten_all()?.to_vec1::<f32>()?;
        let target = data.returns.flatten_all()?.to_vec1::<f32>()?;
        let div = self.cfg.update_epochs as f32;
        self.status = PpoStatus {
            policy_loss: total_pg_loss / div,
            value_loss: total_v_loss / div,
            entropy: last_entropy,
            approx_kl: last_kl,
            clip_frac: clip_fracs.iter().sum::<f32>() / clip_fracs.len() as f32,
            // NaN when the returns are constant: explicitly undefined rather
            // than a division by zero
            explained_var: nn::explained_variance(&pred, &target),
        };
        self.status.log(self.index, writer, global_step);

        self.buffer.clear();
        self.updates += 1;
        Ok(())
    }

    /// Persists network parameters (not optimizer or buffer state) to
    /// `dir/agent_{index}.safetensors`.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        std::fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(format!("agent_{}.safetensors", self.index));
        self.varmap.save(&path)?;
        Ok(path)
    }

    /// Restores network parameters from `dir/agent_0.safetensors`.
    ///
    /// Every agent loads agent 0's weights regardless of its own index; the
    /// leader's parameters act as a shared initialization for the rest of
    /// the team. The load is best-effort by name: missing or mismatched
    /// entries are logged and skipped, and a checkpoint that matches nothing
    /// at all is an error.
    pub fn load(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        let path = dir.as_ref().join("agent_0.safetensors");
        let tensors = candle_core::safetensors::load(&path, &DEVICE)?;

        let mut loaded = 0usize;
        {
            let data = self.varmap.data().lock().unwrap();
            for (name, var) in data.iter() {
                match tensors.get(name) {
                    Some(tensor) if tensor.dims() == var.dims() => {
                        var.set(tensor)?;
                        loaded += 1;
                    }
                    Some(tensor) => warn!(
                        name = %name,
                        checkpoint = ?tensor.dims(),
                        network = ?var.dims(),
                        "skipping checkpoint entry with mismatched shape"
                    ),
                    None => warn!(name = %name, "checkpoint is missing parameter"),
                }
            }
            for name in tensors.keys() {
                if !data.contains_key(name) {
                    warn!(name = %name, "ignoring unknown checkpoint entry");
                }
            }
        }
        if loaded == 0 {
            return Err(Error::UnusableCheckpoint { path });
        }
        debug!(agent = self.index, loaded, from = ?path, "loaded checkpoint");
        Ok(())
    }

    /// Reduces the optimizer's learning rate by `factor`.
    pub fn scale_learning_rate(&mut self, factor: f64) {
        let lr = self.optim.learning_rate() / factor;
        self.optim.set_learning_rate(lr);
    }
}
