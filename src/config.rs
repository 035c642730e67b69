use std::{fs::File, io::Read, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Full configuration surface consumed by the training core.
///
/// The observation vector is partitioned as `[base | agent_0 | agent_1 | ..]`:
/// a `base_len` slice holding the agent's own state plus object/landmark
/// state, followed by one `agent_len` slice per *other* agent. The attention
/// pathway of the network depends on this layout, so `validate` enforces
/// `base_len + (n_agents - 1) * agent_len == obs_dim`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PpoConfig {
    pub n_agents: usize,
    pub num_envs: usize,
    pub obs_dim: usize,
    pub action_dim: usize,
    /// Self/object/landmark slice length at the front of each observation.
    pub base_len: usize,
    /// Per-other-agent info slice length.
    pub agent_len: usize,
    /// Steps per rollout; doubles as the rollout buffer capacity.
    pub episode_len: usize,
    pub hidden_size: usize,
    pub learning_rate: f64,
    pub gamma: f32,
    pub gae_lambda: f32,
    pub clip_coef: f32,
    pub ent_coef: f32,
    pub vf_coef: f32,
    pub max_grad_norm: f32,
    pub update_epochs: usize,
    pub norm_adv: bool,
    pub clip_vloss: bool,
    pub use_gae: bool,
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            n_agents: 3,
            num_envs: 8,
            obs_dim: 19 + 2 * 23,
            action_dim: 5,
            base_len: 19,
            agent_len: 23,
            episode_len: 25,
            hidden_size: 64,
            learning_rate: 1e-4,
            gamma: 0.99,
            gae_lambda: 0.95,
            clip_coef: 0.2,
            ent_coef: 0.01,
            vf_coef: 0.5,
            max_grad_norm: 0.5,
            update_epochs: 4,
            norm_adv: true,
            clip_vloss: true,
            use_gae: true,
        }
    }
}

impl PpoConfig {
    /// Rejects any configuration the tensor code would otherwise turn into a
    /// silent mis-reshape.
    pub fn validate(&self) -> Result<()> {
        if self.n_agents < 2 {
            return Err(Error::Config(format!(
                "n_agents must be at least 2 for the attention pathway, got {}",
                self.n_agents
            )));
        }
        if self.num_envs == 0 {
            return Err(Error::Config("num_envs must be nonzero".into()));
        }
        if self.action_dim == 0 {
            return Err(Error::Config("action_dim must be nonzero".into()));
        }
        if self.episode_len < 2 {
            return Err(Error::Config(format!(
                "episode_len must be at least 2 to bootstrap advantages, got {}",
                self.episode_len
            )));
        }
        let expected = self.base_len + (self.n_agents - 1) * self.agent_len;
        if expected != self.obs_dim {
            return Err(Error::Config(format!(
                "observation layout base_len {} + {} agent slices of {} = {} does not cover obs_dim {}",
                self.base_len,
                self.n_agents - 1,
                self.agent_len,
                expected,
                self.obs_dim
            )));
        }
        if self.hidden_size < 2 || self.hidden_size % 2 != 0 {
            return Err(Error::Config(format!(
                "hidden_size must be even (the attention GRU uses hidden_size / 2), got {}",
                self.hidden_size
            )));
        }
        if !(0.0..1.0).contains(&self.clip_coef) || self.clip_coef == 0.0 {
            return Err(Error::Config(format!(
                "clip_coef must lie in (0, 1), got {}",
                self.clip_coef
            )));
        }
        if !(0.0..=1.0).contains(&self.gamma) || !(0.0..=1.0).contains(&self.gae_lambda) {
            return Err(Error::Config(format!(
                "gamma {} and gae_lambda {} must lie in [0, 1]",
                self.gamma, self.gae_lambda
            )));
        }
        if self.update_epochs == 0 {
            return Err(Error::Config("update_epochs must be nonzero".into()));
        }
        Ok(())
    }

    pub fn critic_obs_dim(&self) -> usize {
        self.obs_dim * self.n_agents
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(s: &str) -> Result<Self> {
        let this: Self = serde_yaml::from_str(s)?;
        this.validate()?;
        Ok(this)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut f = File::open(path)?;
        let mut s = String::new();
        f.read_to_string(&mut s)?;
        Self::from_yaml(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        PpoConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_observation_layout_is_fatal() {
        let cfg = PpoConfig {
            obs_dim: 64,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn odd_hidden_size_is_rejected() {
        let cfg = PpoConfig {
            hidden_size: 63,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn yaml_round_trip() {
        let cfg = PpoConfig::default();
        let s = cfg.to_yaml().unwrap();
        let back = PpoConfig::from_yaml(&s).unwrap();
        assert_eq!(back.obs_dim, cfg.obs_dim);
        assert_eq!(back.update_epochs, cfg.update_epochs);
    }
}
