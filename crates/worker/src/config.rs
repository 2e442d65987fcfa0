//! Configuration persistence for the worker.
//!
//! Values are resolved in this order:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/microbatch/config.toml)
//! 3. Built-in defaults (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use microbatch_core::config::{EngineConfig, ExecutorConfig, WorkerConfig};
use microbatch_core::distributed::DistributedConfig;
use microbatch_core::sampling::SamplingParams;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Settings stored in TOML. Every field is optional so a file may set any
/// subset of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerFileConfig {
    /// Rank threads; 0 decodes in the calling thread.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub world_size: Option<usize>,

    /// Tokens per KV-cache page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,

    /// Pages per rank.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_pages: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_batch_size: Option<usize>,

    /// Wait per missing request after the batch-size agreement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catch_up_timeout_ms: Option<u64>,

    /// Vocabulary of the synthetic model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vocab_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,

    /// Enables top-k sampling when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Log level used when `RUST_LOG` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

const DEFAULT_VOCAB_SIZE: usize = 256;

fn positive(field: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be at least 1",
        });
    }
    Ok(value)
}

impl WorkerFileConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("microbatch").join("config.toml"))
    }

    /// Load from the default path; a missing or unreadable file yields defaults.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Overwrite fields that `other` sets.
    pub fn merge(&mut self, other: &WorkerFileConfig) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(
                    if other.$field.is_some() {
                        self.$field = other.$field.clone();
                    }
                )*
            };
        }
        take!(
            world_size,
            page_size,
            num_pages,
            max_batch_size,
            catch_up_timeout_ms,
            vocab_size,
            max_tokens,
            top_k,
            temperature,
            seed,
            log_level,
        );
    }

    pub fn vocab_size(&self) -> Result<usize, ConfigError> {
        positive("vocab_size", self.vocab_size.unwrap_or(DEFAULT_VOCAB_SIZE))
    }

    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let defaults = EngineConfig::default();
        Ok(EngineConfig {
            page_size: positive("page_size", self.page_size.unwrap_or(defaults.page_size))?,
            num_pages: positive("num_pages", self.num_pages.unwrap_or(defaults.num_pages))?,
            max_batch_size: positive(
                "max_batch_size",
                self.max_batch_size.unwrap_or(defaults.max_batch_size),
            )?,
            sampler_seed: self.seed.unwrap_or(defaults.sampler_seed),
            device: defaults.device,
        })
    }

    /// Executor layout. An unset `world_size` falls back to the
    /// `WORLD_SIZE` environment variable, and to inline decoding when that
    /// names a single rank.
    pub fn executor_config(&self) -> Result<ExecutorConfig, ConfigError> {
        self.executor_config_with(&DistributedConfig::from_env())
    }

    pub fn executor_config_with(
        &self,
        launch: &DistributedConfig,
    ) -> Result<ExecutorConfig, ConfigError> {
        let world_size = self.world_size.unwrap_or(if launch.is_distributed() {
            launch.world_size
        } else {
            0
        });
        let worker = WorkerConfig::default();
        Ok(ExecutorConfig {
            world_size,
            engine: self.engine_config()?,
            worker: WorkerConfig {
                catch_up_timeout_ms: self
                    .catch_up_timeout_ms
                    .unwrap_or(worker.catch_up_timeout_ms),
            },
        })
    }

    pub fn sampling_params(&self) -> SamplingParams {
        let defaults = SamplingParams::default();
        SamplingParams {
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            top_k: self.top_k,
            temperature: self.temperature,
            seed: self.seed,
            ..defaults
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = WorkerFileConfig {
            world_size: Some(2),
            page_size: Some(8),
            catch_up_timeout_ms: Some(250),
            ..Default::default()
        };
        config.save_to(&path).unwrap();

        let loaded = WorkerFileConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn unset_fields_are_not_written() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        WorkerFileConfig {
            seed: Some(3),
            ..Default::default()
        }
        .save_to(&path)
        .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().trim(), "seed = 3");
    }

    #[test]
    fn merge_prefers_other() {
        let mut base = WorkerFileConfig {
            world_size: Some(1),
            num_pages: Some(64),
            ..Default::default()
        };
        base.merge(&WorkerFileConfig {
            num_pages: Some(128),
            top_k: Some(5),
            ..Default::default()
        });
        assert_eq!(base.world_size, Some(1));
        assert_eq!(base.num_pages, Some(128));
        assert_eq!(base.top_k, Some(5));
    }

    #[test]
    fn derived_configs_fall_back_to_defaults() {
        let config = WorkerFileConfig {
            max_batch_size: Some(2),
            catch_up_timeout_ms: Some(10),
            max_tokens: Some(4),
            ..Default::default()
        };
        let executor = config
            .executor_config_with(&DistributedConfig::single())
            .unwrap();
        assert!(executor.is_inline());
        assert_eq!(executor.engine.max_batch_size, 2);
        assert_eq!(executor.engine.page_size, EngineConfig::default().page_size);
        assert_eq!(executor.worker.catch_up_timeout_ms, 10);

        let params = config.sampling_params();
        assert_eq!(params.max_tokens, 4);
        assert!(params.is_greedy());
        assert_eq!(config.vocab_size().unwrap(), DEFAULT_VOCAB_SIZE);
    }

    #[test]
    fn world_size_falls_back_to_launch_environment() {
        let launch = DistributedConfig {
            rank: 0,
            world_size: 4,
            local_rank: 0,
        };
        let unset = WorkerFileConfig::default();
        assert_eq!(unset.executor_config_with(&launch).unwrap().world_size, 4);

        let explicit = WorkerFileConfig {
            world_size: Some(0),
            ..Default::default()
        };
        assert!(explicit.executor_config_with(&launch).unwrap().is_inline());
    }

    #[test]
    fn seed_also_seeds_the_engine_sampler() {
        let config = WorkerFileConfig {
            seed: Some(17),
            ..Default::default()
        };
        assert_eq!(config.engine_config().unwrap().sampler_seed, 17);
    }

    #[test]
    fn zero_sizes_rejected() {
        let zero_page = WorkerFileConfig {
            page_size: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            zero_page.engine_config(),
            Err(ConfigError::Invalid {
                field: "page_size",
                ..
            })
        ));
        assert!(zero_page
            .executor_config_with(&DistributedConfig::single())
            .is_err());

        let zero_vocab = WorkerFileConfig {
            vocab_size: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            zero_vocab.vocab_size(),
            Err(ConfigError::Invalid {
                field: "vocab_size",
                ..
            })
        ));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "world_size = \"two\"").unwrap();
        assert!(matches!(
            WorkerFileConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
