//! Multi-agent PPO with recurrent agent-attention actor-critics.
//!
//! Each agent owns its own [`net::ActorCritic`], optimizer, and
//! [`buffer::RolloutBuffer`]; the [`coordinator::MultiAgentPpo`] fans a flat
//! observation batch out to the agents, collects their actions for the
//! environment, and routes rewards/dones back into each agent's buffer,
//! triggering a PPO update whenever a buffer fills.

use std::fmt;

use candle_core::Device;
use tensorboard_rs::summary_writer::SummaryWriter;

pub mod agent;
pub mod buffer;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gae;
pub mod net;
pub mod nn;

pub use agent::PpoAgent;
pub use buffer::RolloutBuffer;
pub use config::PpoConfig;
pub use coordinator::MultiAgentPpo;
pub use error::{Error, Result};

lazy_static::lazy_static! {
    pub static ref DEVICE: Device = Device::Cpu;
}

/// Wall-clock run identifier used to name checkpoint and log directories.
#[derive(Debug, Clone)]
pub struct Timestamp(String);

impl Timestamp {
    pub fn new() -> Self {
        Self(chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string())
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thin wrapper around the tensorboard summary writer. Uninitialized writers
/// swallow scalars, so headless tests don't spray event files everywhere.
#[derive(Default)]
pub struct TbWriter {
    writer: Option<SummaryWriter>,
}

impl TbWriter {
    pub fn init(&mut self, subdir: Option<&str>, timestamp: &Timestamp) {
        let dir = match subdir {
            Some(subdir) => format!("training/{}/{}", timestamp, subdir),
            None => format!("training/{}", timestamp),
        };
        self.writer = Some(SummaryWriter::new(&dir));
    }

    pub fn add_scalar(&mut self, label: impl AsRef<str>, scalar: f32, step: usize) {
        if let Some(writer) = self.writer.as_mut() {
            writer.add_scalar(label.as_ref(), scalar, step);
        }
    }
}
