//! Fixed-horizon per-agent rollout memory.

use candle_core::Tensor;

use crate::error::{Error, Result};
use crate::DEVICE;

/// One time step's worth of transitions for every parallel environment.
#[derive(Debug, Clone, Default)]
pub struct StepBatch {
    /// `[num_envs * obs_dim]`, row per environment.
    pub obs: Vec<f32>,
    /// `[num_envs * critic_obs_dim]`.
    pub critic_obs: Vec<f32>,
    /// `[num_envs]`, log-probability of the sampled action.
    pub log_probs: Vec<f32>,
    /// `[num_envs]`, discrete action index stored as f32.
    pub actions: Vec<f32>,
    /// `[num_envs]`, value estimate at the time of acting.
    pub values: Vec<f32>,
    /// `[num_envs]`.
    pub rewards: Vec<f32>,
    /// `[num_envs]`, 0/1 episode-termination flags.
    pub dones: Vec<f32>,
}

/// Buffer contents as training-ready tensors on the compute device.
pub struct TrainingData {
    /// `[T, num_envs, obs_dim]`
    pub obs: Tensor,
    /// `[T, num_envs, critic_obs_dim]`
    pub critic_obs: Tensor,
    /// `[T, num_envs]`
    pub log_probs: Tensor,
    /// `[T, num_envs]`
    pub actions: Tensor,
    /// `[T, num_envs]`
    pub advantages: Tensor,
    /// `[T, num_envs]`
    pub returns: Tensor,
    /// `[T, num_envs]`
    pub values: Tensor,
}

/// Pre-allocated, zeroed arenas indexed by a single write cursor.
///
/// Capacity is the episode length; the owning agent triggers learning exactly
/// when `counter == capacity`, and `clear` re-zeroes everything for the next
/// rollout. Writing past capacity is a coordination bug and is reported as
/// [`Error::BufferOverflow`] rather than wrapping around.
pub struct RolloutBuffer {
    capacity: usize,
    num_envs: usize,
    obs_dim: usize,
    critic_obs_dim: usize,
    counter: usize,
    obs: Vec<f32>,
    critic_obs: Vec<f32>,
    log_probs: Vec<f32>,
    actions: Vec<f32>,
    values: Vec<f32>,
    rewards: Vec<f32>,
    dones: Vec<f32>,
}

impl RolloutBuffer {
    pub fn new(capacity: usize, num_envs: usize, obs_dim: usize, critic_obs_dim: usize) -> Self {
        Self {
            capacity,
            num_envs,
            obs_dim,
            critic_obs_dim,
            counter: 0,
            obs: vec![0.0; capacity * num_envs * obs_dim],
            critic_obs: vec![0.0; capacity * num_envs * critic_obs_dim],
            log_probs: vec![0.0; capacity * num_envs],
            actions: vec![0.0; capacity * num_envs],
            values: vec![0.0; capacity * num_envs],
            rewards: vec![0.0; capacity * num_envs],
            dones: vec![0.0; capacity * num_envs],
        }
    }

    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.counter == self.capacity
    }

    /// Writes one step at the cursor and advances it.
    pub fn store(&mut self, step: StepBatch) -> Result<()> {
        if self.counter >= self.capacity {
            return Err(Error::BufferOverflow {
                capacity: self.capacity,
            });
        }
        check_len("step obs", &step.obs, self.num_envs * self.obs_dim)?;
        check_len(
            "step critic obs",
            &step.critic_obs,
            self.num_envs * self.critic_obs_dim,
        )?;
        for (what, field) in [
            ("step log_probs", &step.log_probs),
            ("step actions", &step.actions),
            ("step values", &step.values),
            ("step rewards", &step.rewards),
            ("step dones", &step.dones),
        ] {
            check_len(what, field, self.num_envs)?;
        }

        let c = self.counter;
        let row = self.num_envs;
        self.obs[c * row * self.obs_dim..(c + 1) * row * self.obs_dim].copy_from_slice(&step.obs);
        self.critic_obs[c * row * self.critic_obs_dim..(c + 1) * row * self.critic_obs_dim]
            .copy_from_slice(&step.critic_obs);
        self.log_probs[c * row..(c + 1) * row].copy_from_slice(&step.log_probs);
        self.actions[c * row..(c + 1) * row].copy_from_slice(&step.actions);
        self.values[c * row..(c + 1) * row].copy_from_slice(&step.values);
        self.rewards[c * row..(c + 1) * row].copy_from_slice(&step.rewards);
        self.dones[c * row..(c + 1) * row].copy_from_slice(&step.dones);
        self.counter += 1;
        Ok(())
    }

    /// Rewards arena, row-major `[T, num_envs]`.
    pub fn rewards(&self) -> &[f32] {
        &self.rewards
    }

    /// Value-estimate arena, row-major `[T, num_envs]`.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Done-flag arena, row-major `[T, num_envs]`.
    pub fn dones(&self) -> &[f32] {
        &self.dones
    }

    /// One environment's column of a `[T, num_envs]` arena.
    pub fn column(arena: &[f32], num_envs: usize, env: usize) -> Vec<f32> {
        arena
            .iter()
            .skip(env)
            .step_by(num_envs)
            .copied()
            .collect()
    }

    /// Packages the stored trajectory plus externally computed advantages and
    /// returns (both row-major `[T, num_envs]`) into device tensors. Leaves
    /// the buffer untouched.
    pub fn create_training_data(
        &self,
        advantages: &[f32],
        returns: &[f32],
    ) -> Result<TrainingData> {
        let t = self.capacity;
        let e = self.num_envs;
        check_len("advantages", advantages, t * e)?;
        check_len("returns", returns, t * e)?;

        Ok(TrainingData {
            obs: Tensor::from_slice(&self.obs, (t, e, self.obs_dim), &DEVICE)?,
            critic_obs: Tensor::from_slice(&self.critic_obs, (t, e, self.critic_obs_dim), &DEVICE)?,
            log_probs: Tensor::from_slice(&self.log_probs, (t, e), &DEVICE)?,
            actions: Tensor::from_slice(&self.actions, (t, e), &DEVICE)?,
            advantages: Tensor::from_slice(advantages, (t, e), &DEVICE)?,
            returns: Tensor::from_slice(returns, (t, e), &DEVICE)?,
            values: Tensor::from_slice(&self.values, (t, e), &DEVICE)?,
        })
    }

    /// Resets the cursor and re-zeroes every arena.
    pub fn clear(&mut self) {
        self.counter = 0;
        for arena in [
            &mut self.obs,
            &mut self.critic_obs,
            &mut self.log_probs,
            &mut self.actions,
            &mut self.values,
            &mut self.rewards,
            &mut self.dones,
        ] {
            arena.fill(0.0);
        }
    }
}

fn check_len(what: &'static str, got: &[f32], expected: usize) -> Result<()> {
    if got.len() != expected {
        return Err(Error::ShapeMismatch {
            what,
            expected: vec![expected],
            got: vec![got.len()],
        });
    }
    Ok(())
}
