//! Fans a flat multi-environment observation batch out to per-agent
//! networks and routes environment feedback back into their buffers.

use candle_core::Tensor;
use itertools::Itertools;

use crate::agent::PpoAgent;
use crate::buffer::StepBatch;
use crate::config::PpoConfig;
use crate::error::{Error, Result};
use crate::{TbWriter, Timestamp, DEVICE};

/// Per-agent transition data held between `act` and `store`.
struct PendingStep {
    obs: Vec<f32>,
    critic_obs: Vec<f32>,
    log_probs: Vec<f32>,
    actions: Vec<f32>,
    values: Vec<f32>,
}

/// Owns one [`PpoAgent`] per agent slot and the shared metrics writer.
///
/// The environment presents observations as `[num_envs * n_agents, obs_dim]`
/// with agents interleaved within each environment block: row
/// `env * n_agents + agent`. Actions, rewards and dones use the same flat
/// ordering.
pub struct MultiAgentPpo {
    cfg: PpoConfig,
    agents: Vec<PpoAgent>,
    pending: Vec<PendingStep>,
    writer: TbWriter,
}

impl MultiAgentPpo {
    pub fn new(cfg: &PpoConfig) -> Result<Self> {
        cfg.validate()?;
        let agents = (0..cfg.n_agents)
            .map(|i| PpoAgent::new(cfg, i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            cfg: cfg.clone(),
            agents,
            pending: Vec::new(),
            writer: TbWriter::default(),
        })
    }

    /// Starts writing tensorboard scalars under `training/{timestamp}`.
    pub fn init_logging(&mut self, timestamp: &Timestamp) {
        self.writer.init(None, timestamp);
    }

    pub fn agents(&self) -> &[PpoAgent] {
        &self.agents
    }

    /// Row indices of one agent's slice across all environments.
    fn agent_rows(&self, agent: usize) -> Result<Tensor> {
        let n = self.cfg.n_agents;
        let idx = (0..self.cfg.num_envs)
            .map(|env| (env * n + agent) as u32)
            .collect_vec();
        Ok(Tensor::from_vec(idx, (self.cfg.num_envs,), &DEVICE)?)
    }

    /// Centralized critic view: for each `(env, agent)` row, all agents'
    /// observations of that environment concatenated in a cyclic rotation
    /// starting at the owning agent. Every agent therefore sees itself
    /// first, which keeps the critic input agent-relative instead of
    /// globally ordered.
    fn critic_observations(&self, obs: &Tensor) -> Result<Tensor> {
        let n = self.cfg.n_agents;
        let rows = self.cfg.num_envs * n;
        let mut out = Vec::with_capacity(rows);
        for i in 0..rows {
            let agent = i % n;
            let env = i / n;
            let mut parts = Vec::with_capacity(n);
            for k in 0..n {
                let row = env * n + (k + agent) % n;
                parts.push(obs.narrow(0, row, 1)?);
            }
            out.push(Tensor::cat(&parts, 1)?);
        }
        Ok(Tensor::cat(&out, 0)?)
    }

    fn check_obs_shape(&self, obs: &Tensor) -> Result<()> {
        let expected = vec![self.cfg.num_envs * self.cfg.n_agents, self.cfg.obs_dim];
        if obs.dims() != expected.as_slice() {
            return Err(Error::ShapeMismatch {
                what: "observation batch",
                expected,
                got: obs.dims().to_vec(),
            });
        }
        Ok(())
    }

    /// Selects one action per `(env, agent)` pair. Pass `new_episode = true`
    /// on the first step of an episode to re-zero every agent's recurrent
    /// state. The returned vector is flat in the same ordering as the
    /// observation batch.
    pub fn act(&mut self, observations: &Tensor, new_episode: bool) -> Result<Vec<u32>> {
        self.check_obs_shape(observations)?;
        let n = self.cfg.n_agents;
        let e = self.cfg.num_envs;
        let critic_obs = self.critic_observations(observations)?;

        self.pending.clear();
        let mut flat = vec![0u32; e * n];
        for i in 0..n {
            let rows = self.agent_rows(i)?;
            let agent_obs = observations.index_select(&rows, 0)?;
            let agent_critic_obs = critic_obs.index_select(&rows, 0)?;

            let agent = &mut self.agents[i];
            if new_episode {
                agent.init_hidden(e)?;
            }
            let chosen = agent.choose_action(&agent_obs, &agent_critic_obs)?;
            for env in 0..e {
                flat[env * n + i] = chosen.actions[env] as u32;
            }
            self.pending.push(PendingStep {
                obs: agent_obs.flatten_all()?.to_vec1()?,
                critic_obs: agent_critic_obs.flatten_all()?.to_vec1()?,
                log_probs: chosen.log_probs,
                actions: chosen.actions,
                values: chosen.values,
            });
        }
        Ok(flat)
    }

    /// Routes the environment's reward/done feedback for the most recent
    /// `act` into each agent's buffer, and runs a learning pass for every
    /// agent whose buffer just filled.
    pub fn store(&mut self, global_step: usize, rewards: &[f32], dones: &[f32]) -> Result<()> {
        let n = self.cfg.n_agents;
        let e = self.cfg.num_envs;
        if self.pending.len() != n {
            return Err(Error::Protocol("store called without a preceding act"));
        }
        for (what, slice) in [("rewards", rewards), ("dones", dones)] {
            if slice.len() != e * n {
                return Err(Error::ShapeMismatch {
                    what,
                    expected: vec![e * n],
                    got: vec![slice.len()],
                });
            }
        }

        for (i, pending) in self.pending.drain(..).enumerate() {
            let agent = &mut self.agents[i];
            agent.remember(StepBatch {
                obs: pending.obs,
                critic_obs: pending.critic_obs,
                log_probs: pending.log_probs,
                actions: pending.actions,
                values: pending.values,
                rewards: (0..e).map(|env| rewards[env * n + i]).collect_vec(),
                dones: (0..e).map(|env| dones[env * n + i]).collect_vec(),
            })?;
            if agent.buffer().is_full() {
                agent.learn(global_step, &mut self.writer)?;
            }
        }
        Ok(())
    }

    /// Single-environment policy rollout for showing off trained agents:
    /// `observations` is `[n_agents, obs_dim]`, one row per agent.
    ///
    /// The first call of an episode must pass `new_episode = true`: it
    /// re-sizes each agent's recurrent state from the rollout batch down to
    /// a single environment. Calling with `new_episode = false` before that
    /// is a protocol error.
    pub fn evaluate(&mut self, observations: &Tensor, new_episode: bool) -> Result<Vec<u32>> {
        let expected = vec![self.cfg.n_agents, self.cfg.obs_dim];
        if observations.dims() != expected.as_slice() {
            return Err(Error::ShapeMismatch {
                what: "evaluation observations",
                expected,
                got: observations.dims().to_vec(),
            });
        }
        let mut actions = Vec::with_capacity(self.cfg.n_agents);
        for (i, agent) in self.agents.iter_mut().enumerate() {
            let obs = observations.narrow(0, i, 1)?;
            if new_episode {
                agent.init_hidden(1)?;
            }
            actions.push(agent.evaluate_action(&obs)?);
        }
        Ok(actions)
    }

    pub fn save_agents(&self, dir: impl AsRef<std::path::Path>) -> Result<()> {
        for agent in &self.agents {
            agent.save(dir.as_ref())?;
        }
        Ok(())
    }

    pub fn load_agents(&mut self, dir: impl AsRef<std::path::Path>) -> Result<()> {
        for agent in &mut self.agents {
            agent.load(dir.as_ref())?;
        }
        Ok(())
    }

    /// Loads the leader checkpoint into every agent except agent 0 and
    /// divides the followers' learning rates by 20, so only the leader keeps
    /// training at full rate from its own weights.
    pub fn load_agents_except_leader(&mut self, dir: impl AsRef<std::path::Path>) -> Result<()> {
        for agent in &mut self.agents {
            if agent.index() == 0 {
                continue;
            }
            agent.scale_learning_rate(20.0);
            agent.load(dir.as_ref())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_cfg(n_agents: usize, num_envs: usize, episode_len: usize) -> PpoConfig {
        PpoConfig {
            n_agents,
            num_envs,
            obs_dim: 4 + 3 * (n_agents - 1),
            action_dim: 4,
            base_len: 4,
            agent_len: 3,
            episode_len,
            hidden_size: 8,
            update_epochs: 1,
            ..Default::default()
        }
    }

    #[test]
    fn critic_rotation_is_a_cyclic_shift() -> Result<()> {
        let cfg = tiny_cfg(3, 1, 5);
        let coord = MultiAgentPpo::new(&cfg)?;

        // agent k's observation filled with the constant k
        let rows: Vec<f32> = (0..3)
            .flat_map(|k| vec![k as f32; cfg.obs_dim])
            .collect();
        let obs = Tensor::from_vec(rows, (3, cfg.obs_dim), &DEVICE)?;
        let critic = coord.critic_observations(&obs)?.to_vec2::<f32>()?;

        let tag = |row: &[f32]| -> Vec<f32> {
            (0..3).map(|k| row[k * cfg.obs_dim]).collect()
        };
        assert_eq!(tag(&critic[0]), vec![0.0, 1.0, 2.0]);
        assert_eq!(tag(&critic[1]), vec![1.0, 2.0, 0.0]);
        assert_eq!(tag(&critic[2]), vec![2.0, 0.0, 1.0]);
        Ok(())
    }

    #[test]
    fn act_returns_flat_env_major_actions() -> Result<()> {
        let cfg = tiny_cfg(2, 3, 5);
        let mut coord = MultiAgentPpo::new(&cfg)?;
        let obs = Tensor::rand(
            -1.0f32,
            1.0,
            (cfg.num_envs * cfg.n_agents, cfg.obs_dim),
            &DEVICE,
        )?;
        let actions = coord.act(&obs, true)?;
        assert_eq!(actions.len(), cfg.num_envs * cfg.n_agents);
        assert!(actions.iter().all(|a| (*a as usize) < cfg.action_dim));
        Ok(())
    }

    #[test]
    fn flat_ordering_routes_rows_and_feedback_per_agent() -> Result<()> {
        let cfg = tiny_cfg(2, 3, 5);
        let mut coord = MultiAgentPpo::new(&cfg)?;
        let n = cfg.n_agents;
        let e = cfg.num_envs;

        // row r of the batch is filled with the constant r
        let rows = (0..e * n)
            .flat_map(|r| vec![r as f32; cfg.obs_dim])
            .collect_vec();
        let obs = Tensor::from_vec(rows, (e * n, cfg.obs_dim), &DEVICE)?;
        let flat = coord.act(&obs, true)?;

        for (i, pending) in coord.pending.iter().enumerate() {
            for env in 0..e {
                // agent i was handed exactly the rows env * n + i ...
                assert_eq!(pending.obs[env * cfg.obs_dim], (env * n + i) as f32);
                // ... and its action came back out at the same flat slot
                assert_eq!(flat[env * n + i], pending.actions[env] as u32);
            }
        }

        // feedback at slot env * n + i lands in agent i's reward column
        let rewards = (0..e * n).map(|r| r as f32).collect_vec();
        let dones = vec![0.0f32; e * n];
        coord.store(0, &rewards, &dones)?;
        for (i, agent) in coord.agents().iter().enumerate() {
            let expected = (0..e).map(|env| (env * n + i) as f32).collect_vec();
            assert_eq!(&agent.buffer().rewards()[..e], expected.as_slice());
        }
        Ok(())
    }

    #[test]
    fn wrong_observation_shape_is_fatal() -> Result<()> {
        let cfg = tiny_cfg(2, 3, 5);
        let mut coord = MultiAgentPpo::new(&cfg)?;
        let obs = Tensor::zeros(
            (cfg.num_envs, cfg.obs_dim),
            candle_core::DType::F32,
            &DEVICE,
        )?;
        assert!(matches!(
            coord.act(&obs, true),
            Err(Error::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn store_without_act_is_a_protocol_error() -> Result<()> {
        let cfg = tiny_cfg(2, 2, 5);
        let mut coord = MultiAgentPpo::new(&cfg)?;
        let feedback = vec![0.0f32; cfg.num_envs * cfg.n_agents];
        assert!(matches!(
            coord.store(0, &feedback, &feedback),
            Err(Error::Protocol(_))
        ));
        Ok(())
    }

    #[test]
    fn learning_fires_exactly_on_buffer_fill() -> Result<()> {
        // 2 agents, 4 parallel envs, horizon 5: the 5th store triggers one
        // learn per agent and rewinds both cursors.
        let cfg = tiny_cfg(2, 4, 5);
        let mut coord = MultiAgentPpo::new(&cfg)?;
        let flat = cfg.num_envs * cfg.n_agents;

        for step in 0..cfg.episode_len {
            let obs = Tensor::rand(-1.0f32, 1.0, (flat, cfg.obs_dim), &DEVICE)?;
            coord.act(&obs, step == 0)?;

            let rewards = vec![0.1f32; flat];
            let dones = vec![0.0f32; flat];
            coord.store(step, &rewards, &dones)?;

            for agent in coord.agents() {
                if step + 1 < cfg.episode_len {
                    assert_eq!(agent.updates(), 0);
                    assert_eq!(agent.buffer().counter(), step + 1);
                } else {
                    assert_eq!(agent.updates(), 1);
                    assert_eq!(agent.buffer().counter(), 0);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn evaluation_needs_a_fresh_episode_first() -> Result<()> {
        let cfg = tiny_cfg(2, 3, 5);
        let mut coord = MultiAgentPpo::new(&cfg)?;
        let obs = Tensor::zeros(
            (cfg.n_agents, cfg.obs_dim),
            candle_core::DType::F32,
            &DEVICE,
        )?;

        // the construction-time hidden state is sized for num_envs, not 1
        assert!(matches!(
            coord.evaluate(&obs, false),
            Err(Error::Protocol(_))
        ));

        coord.evaluate(&obs, true)?;
        // within the episode the single-environment state carries over
        coord.evaluate(&obs, false)?;
        Ok(())
    }

    #[test]
    fn follower_load_shares_leader_weights_and_slows_them_down() -> Result<()> {
        let cfg = tiny_cfg(2, 2, 5);
        let dir = tempfile::tempdir()?;

        let mut coord = MultiAgentPpo::new(&cfg)?;
        coord.agents()[0].save(dir.path())?;
        coord.load_agents_except_leader(dir.path())?;
        Ok(())
    }
}
