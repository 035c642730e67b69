//! Recurrent attention-based actor-critic.
//!
//! Three GRU pathways share no parameters:
//! - the critic GRU consumes the centralized (all-agent) observation and
//!   feeds an orthogonal MLP ending in a scalar value head,
//! - the attention GRU folds the (n_agents - 1) co-agent slices of a local
//!   observation into one social-context vector, restarting from a zero
//!   hidden state on every call,
//! - the actor GRU consumes that context with an episode-persistent hidden
//!   state and feeds the policy head.

use candle_core::{Module, Tensor};
use candle_nn::rnn::{gru, GRUConfig, GRUState, GRU, RNN};
use candle_nn::{Linear, VarMap};

use crate::config::PpoConfig;
use crate::error::Result;
use crate::nn::{self, Categorical};

const MLP_WIDTH: usize = 128;
const SQRT_2: f64 = std::f64::consts::SQRT_2;

/// Owned recurrent state for one agent's network. Created by
/// [`ActorCritic::init_hidden`] at episode start and threaded explicitly
/// through every forward pass; the attention GRU keeps no state here on
/// purpose.
#[derive(Clone)]
pub struct HiddenStates {
    actor: GRUState,
    critic: GRUState,
}

pub struct ActorCritic {
    gru_critic: GRU,
    gru_actor: GRU,
    gru_attend: GRU,
    critic_net: [Linear; 4],
    actor_net: [Linear; 3],
    n_agents: usize,
    hidden_size: usize,
    base_len: usize,
    agent_len: usize,
}

impl ActorCritic {
    pub fn new(cfg: &PpoConfig, map: &VarMap) -> Result<Self> {
        let vb = candle_nn::VarBuilder::from_varmap(map, candle_core::DType::F32, &crate::DEVICE);
        let half = cfg.hidden_size / 2;

        let gru_critic = gru(
            cfg.critic_obs_dim(),
            cfg.hidden_size,
            GRUConfig::default(),
            vb.pp("gru_critic"),
        )?;
        let gru_actor = gru(
            half,
            cfg.hidden_size,
            GRUConfig::default(),
            vb.pp("gru_actor"),
        )?;
        let gru_attend = gru(
            cfg.base_len + cfg.agent_len,
            half,
            GRUConfig::default(),
            vb.pp("gru_attend"),
        )?;

        let critic_net = [
            nn::linear(map, "critic_net.0", cfg.hidden_size, MLP_WIDTH, SQRT_2)?,
            nn::linear(map, "critic_net.1", MLP_WIDTH, MLP_WIDTH, SQRT_2)?,
            nn::linear(map, "critic_net.2", MLP_WIDTH, MLP_WIDTH, SQRT_2)?,
            nn::linear(map, "critic_net.3", MLP_WIDTH, 1, 1.0)?,
        ];
        let actor_net = [
            nn::linear(map, "actor_net.0", cfg.hidden_size, MLP_WIDTH, SQRT_2)?,
            nn::linear(map, "actor_net.1", MLP_WIDTH, MLP_WIDTH, SQRT_2)?,
            nn::linear(map, "actor_net.2", MLP_WIDTH, cfg.action_dim, 0.01)?,
        ];

        Ok(Self {
            gru_critic,
            gru_actor,
            gru_attend,
            critic_net,
            actor_net,
            n_agents: cfg.n_agents,
            hidden_size: cfg.hidden_size,
            base_len: cfg.base_len,
            agent_len: cfg.agent_len,
        })
    }

    /// Fresh zero recurrent state for `batch` parallel environments.
    pub fn init_hidden(&self, batch: usize) -> Result<HiddenStates> {
        Ok(HiddenStates {
            actor: self.gru_actor.zero_state(batch)?,
            critic: self.gru_critic.zero_state(batch)?,
        })
    }

    /// Centralized value estimate, `[seq, batch, 1]` from a
    /// `[seq, batch, obs_dim * n_agents]` critic observation.
    pub fn get_value(&self, critic_obs: &Tensor, hidden: &mut HiddenStates) -> Result<Tensor> {
        let (seq, _batch, _dim) = critic_obs.dims3()?;
        let mut state = hidden.critic.clone();
        let mut outs = Vec::with_capacity(seq);
        for t in 0..seq {
            let x_t = critic_obs.narrow(0, t, 1)?.squeeze(0)?;
            state = self.gru_critic.step(&x_t, &state)?;
            outs.push(state.h().clone());
        }
        hidden.critic = state;

        let mut x = Tensor::stack(&outs, 0)?;
        for (i, layer) in self.critic_net.iter().enumerate() {
            x = layer.forward(&x)?;
            if i + 1 < self.critic_net.len() {
                x = x.relu()?;
            }
        }
        Ok(x)
    }

    /// Aggregates the co-agent slices of `[seq, batch, obs_dim]` local
    /// observations into `[seq, batch, hidden / 2]` context vectors.
    ///
    /// The GRU here restarts from zero on every call: it iterates over the
    /// other agents within one step, not over time.
    fn attend_agents(&self, x: &Tensor) -> Result<Tensor> {
        let (seq, batch, obs) = x.dims3()?;
        let flat = x.reshape((seq * batch, obs))?;
        let base = flat.narrow(1, 0, self.base_len)?;

        let mut state = self.gru_attend.zero_state(seq * batch)?;
        for i in 0..self.n_agents - 1 {
            let info = flat.narrow(1, self.base_len + i * self.agent_len, self.agent_len)?;
            let step_in = Tensor::cat(&[&base, &info], 1)?;
            state = self.gru_attend.step(&step_in, &state)?;
        }
        Ok(state.h().reshape((seq, batch, self.hidden_size / 2))?)
    }

    /// Samples actions for `[seq, batch, obs_dim]` local observations,
    /// returning `[seq, batch]` indices and the underlying distribution.
    pub fn get_action(
        &self,
        obs: &Tensor,
        hidden: &mut HiddenStates,
    ) -> Result<(Tensor, Categorical)> {
        let ctx = self.attend_agents(obs)?;
        let (seq, _batch, _dim) = ctx.dims3()?;

        let mut state = hidden.actor.clone();
        let mut outs = Vec::with_capacity(seq);
        for t in 0..seq {
            let x_t = ctx.narrow(0, t, 1)?.squeeze(0)?;
            state = self.gru_actor.step(&x_t, &state)?;
            outs.push(state.h().clone());
        }
        hidden.actor = state;

        let mut x = Tensor::stack(&outs, 0)?;
        for (i, layer) in self.actor_net.iter().enumerate() {
            x = layer.forward(&x)?;
            if i + 1 < self.actor_net.len() {
                x = x.relu()?;
            }
        }
        let dist = Categorical::new(&x)?;
        let action = dist.sample()?;
        Ok((action, dist))
    }

    /// Joint actor/critic pass. When `action` is given, its log-probability
    /// and entropy are evaluated instead of the freshly sampled one's, which
    /// is how stored trajectories are re-scored during learning.
    pub fn get_action_and_value(
        &self,
        obs: &Tensor,
        critic_obs: &Tensor,
        hidden: &mut HiddenStates,
        action: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
        let (sampled, dist) = self.get_action(obs, hidden)?;
        let value = self.get_value(critic_obs, hidden)?;
        let log_prob = match action {
            Some(action) => dist.log_prob(action)?,
            None => dist.log_prob(&sampled)?,
        };
        Ok((sampled, log_prob, dist.entropy()?, value))
    }
}
