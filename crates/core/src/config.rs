use std::time::Duration;

use candle_core::Device;
use serde::{Deserialize, Serialize};

fn default_page_size() -> usize {
    16
}

fn default_num_pages() -> usize {
    512
}

fn default_max_batch_size() -> usize {
    8
}

fn default_catch_up_timeout_ms() -> u64 {
    1000
}

fn default_sampler_seed() -> u64 {
    0
}

fn default_device() -> Device {
    Device::Cpu
}

/// Sizing of one rank's decode engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tokens held by a single KV-cache page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Total pages in the rank's pool.
    #[serde(default = "default_num_pages")]
    pub num_pages: usize,
    /// Upper bound on sequences decoded together.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Initial seed of the sampler RNG. Ranks built from one config draw
    /// identical noise, so they stay in lockstep under top-k sampling.
    #[serde(default = "default_sampler_seed")]
    pub sampler_seed: u64,
    #[serde(skip, default = "default_device")]
    pub device: Device,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            num_pages: default_num_pages(),
            max_batch_size: default_max_batch_size(),
            sampler_seed: default_sampler_seed(),
            device: default_device(),
        }
    }
}

/// Behaviour of the per-rank request loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// How long a short rank waits for each missing request after the
    /// batch-size agreement.
    #[serde(default = "default_catch_up_timeout_ms")]
    pub catch_up_timeout_ms: u64,
}

impl WorkerConfig {
    pub fn catch_up_timeout(&self) -> Duration {
        Duration::from_millis(self.catch_up_timeout_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            catch_up_timeout_ms: default_catch_up_timeout_ms(),
        }
    }
}

/// Executor layout: inline when `world_size == 0`, one thread per rank otherwise.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub world_size: usize,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl ExecutorConfig {
    pub fn is_inline(&self) -> bool {
        self.world_size == 0
    }
}
